//! # Runflow Scheduling Queue
//!
//! Durable delayed jobs that let suspended runs survive a restart:
//! `wait_complete`, `approval_timeout`, `sla_check`, `resume`, `execute`.
//!
//! - Job ids are deterministic per (deployment, type, run, step, enqueue
//!   time); re-adding the same id is a no-op
//! - A [`WorkerPool`] hands due jobs to a [`JobProcessor`] with bounded
//!   concurrency; failures retry with exponential backoff and are parked
//!   as failed after `max_attempts`
//! - Backends: [`MemoryBackend`] and, with the `sqlite` feature,
//!   `SqliteBackend`
//! - An unreachable backend disables the queue instead of failing startup;
//!   [`JobQueue::add_job`] then returns `None` and callers fall back to
//!   in-process timers

#![deny(unsafe_code)]

mod backend;
mod errors;
mod queue;
#[cfg(feature = "sqlite")]
mod sqlite;
mod worker;

pub use backend::*;
pub use errors::*;
pub use queue::*;
#[cfg(feature = "sqlite")]
pub use sqlite::*;
pub use worker::*;
