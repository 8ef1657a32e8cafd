//! # Runflow Event Bus
//!
//! In-process publish/subscribe connecting the rule engine, the
//! orchestration engine and external collaborators.
//!
//! ```text
//!   publish(event) ──► [scope filter] ──► [topic pattern] ──► handler task
//!                                                        ├──► handler task
//!                                                        └──► handler task
//! ```
//!
//! - Topic patterns: exact, trailing `*` prefix, embedded `*` wildcard,
//!   bare `*` for everything
//! - A subscriber sees events of its own scope; a platform (`*`)
//!   subscriber sees all scopes
//! - Handlers run concurrently and independently: failures are contained
//!   and logged, never propagated to the publisher or to other handlers
//! - Capability requests carry a [`ReplyHandle`] the collaborator answers
//! - The bus is an explicit value with a drainable lifecycle; tests build
//!   isolated instances

#![deny(unsafe_code)]

mod bus;
mod errors;
mod event;
mod pattern;

pub use bus::*;
pub use errors::*;
pub use event::*;
pub use pattern::*;
