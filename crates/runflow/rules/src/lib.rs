//! # Runflow Rule Engine
//!
//! Ordered business rules evaluated against record mutations
//! (`before_insert`, `after_update`, ...).
//!
//! For one mutation the engine loads the active rules for the collection
//! and trigger, in the tenant's scope and the platform scope, and runs them
//! in ascending priority:
//!
//! 1. Evaluate the condition against the *working* record, so a rule sees
//!    what earlier rules set
//! 2. Run the action: set values, validate, abort, script, or publish a
//!    start-orchestration / notify / external-call request on the bus
//! 3. Apply the rule's error policy when the action fails
//!
//! An abort is sticky: it stops the chain and the caller must not persist
//! the record. Modifications made before the abort are kept in the result.
//!
//! The structured condition evaluator lives in [`expression`] and is shared
//! with the orchestration engine's condition steps.

#![deny(unsafe_code)]

mod context;
mod engine;
mod errors;
pub mod expression;
mod store;

pub use context::*;
pub use engine::*;
pub use errors::*;
pub use store::*;
