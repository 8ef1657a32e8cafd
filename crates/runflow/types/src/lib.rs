//! Runflow Types: the data model of the process orchestration core
//!
//! A run is one executing occurrence of a [`RunDefinition`], a versioned
//! directed graph of typed [`Step`]s. The orchestration engine interprets
//! the graph, suspending at approval and wait steps and resuming later from
//! a [`ScheduledJob`] or an external decision.
//!
//! # Key Concepts
//!
//! - **RunDefinition**: immutable, versioned step graph with one `start` step
//! - **RunInstance**: the only entity mutated during execution
//! - **StepExecutionRecord**: append-only audit of every step visit
//! - **BusinessRule**: ordered record-mutation rule (condition + action)
//! - **ConditionExpression**: structured boolean tree evaluated without code
//! - **ScheduledJob**: durable, delayed resume instruction
//!
//! # Design Principles
//!
//! 1. Definitions are validated once, at registration
//! 2. Run state only moves along the documented state machine
//! 3. Side effects are described as data, never performed by these types

#![deny(unsafe_code)]

mod condition;
mod definition;
mod errors;
mod ids;
mod instance;
mod job;
pub mod path;
mod record;
mod rule;
mod scope;
mod step;

pub use condition::*;
pub use definition::*;
pub use errors::*;
pub use ids::*;
pub use instance::*;
pub use job::*;
pub use record::*;
pub use rule::*;
pub use scope::*;
pub use step::*;
