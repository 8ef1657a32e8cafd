//! # Runflow Script Sandbox
//!
//! A least-privilege interpreter for the short scripts used by business
//! rules and orchestration steps. Scripts are written in a small
//! JavaScript-like language:
//!
//! - `let` / `const` declarations, `if` / `else`, `while`, `for (x of xs)`
//! - objects, arrays, template literals, optional chaining, `??`
//! - arrow functions as callbacks to array methods (`map`, `filter`, ...)
//! - helpers for dates, record comparison, validation and JSON
//!
//! ## Containment
//!
//! ```text
//! ┌───────────────────────── Sandbox ─────────────────────────┐
//! │  context snapshot (read-only globals)                     │
//! │  locals ── interpreter ── step budget + wall-clock limit  │
//! │                │                                          │
//! │                └── capabilities (off by default)          │
//! │                      http.*  data.*  ──► HostBridge       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no file system, process, module or network access except
//! through the explicitly granted capabilities. Every error leaving the
//! sandbox is sanitized.
//!
//! ## Example
//!
//! ```rust
//! use runflow_script::{ExecuteOptions, Sandbox, ScriptContext};
//! use serde_json::json;
//!
//! let sandbox = Sandbox::default();
//! let ctx = ScriptContext::new().with_record(json!({"amount": 1200}));
//! let outcome = sandbox.execute_sync("record.amount > 1000", &ctx, &ExecuteOptions::default());
//! assert_eq!(outcome.result, json!(true));
//! ```

#![deny(unsafe_code)]

pub mod ast;
mod builtins;
mod context;
mod errors;
mod host;
mod interpreter;
pub mod lexer;
pub mod parser;
mod sandbox;
pub mod value;

pub use context::*;
pub use errors::*;
pub use host::*;
pub use sandbox::*;
