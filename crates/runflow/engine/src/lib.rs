//! # Runflow Orchestration Engine
//!
//! Interprets versioned step graphs ([`RunDefinition`](runflow_types::RunDefinition))
//! as long-running runs that can suspend on approvals, timed waits and
//! child runs, and resume from events or durable queue jobs.
//!
//! ```text
//!   workflow.start ─┐                          ┌─► record.operation / http.request
//!   approval.resp. ─┼─► OrchestrationEngine ───┼─► approval.create / notification.send
//!   queue jobs  ────┘        │                 └─► run.* lifecycle events
//!                            ▼
//!                 RunStore · DefinitionRegistry
//! ```
//!
//! - Definitions are validated on registration and resolved tenant first,
//!   then platform
//! - Every step visit leaves one execution record
//! - Side effects are capability requests on the bus, answered by
//!   collaborators within a timeout
//! - Resumption is idempotent: a run leaves its waiting state once

#![deny(unsafe_code)]

pub mod capability;
mod config;
mod engine;
mod registry;
mod store;
mod telemetry;
pub mod triggers;

pub use config::*;
pub use engine::*;
pub use registry::*;
pub use store::*;
pub use telemetry::*;
