//! Quicksilver JIT: the compilation offload subsystem of the Quicksilver
//! JavaScript runtime
//!
//! Turns a hot interpreted function into native machine code without
//! corrupting, racing with, or blocking the interpreter that keeps running
//! concurrently. The interpreter's live heap stays on its side of the
//! boundary: the compiler only ever sees an immutable [`snapshot`] whose
//! heap references are opaque integers, captured once and never re-read.
//!
//! # Pipeline
//!
//! Interpreter reports a hot function → [`scheduler`] queues a work item →
//! [`snapshot`] captures the function's JIT-relevant state → [`transport`]
//! carries it to the compilation agent (worker thread or separate
//! `qjit-agent` process) → [`backend`] runs IR build, register allocation,
//! layout, peephole, and encoding → the artifact returns and [`install`]
//! swaps the function's entry point atomically.
//!
//! # Quick Start
//!
//! ```no_run
//! use quicksilver_jit::{CodeGenerator, EntryPointTable, JitConfig};
//! use std::sync::Arc;
//!
//! fn main() -> quicksilver_jit::Result<()> {
//!     let table = Arc::new(EntryPointTable::new());
//!     let mut jit = CodeGenerator::new(JitConfig::default(), table)?;
//!     // register_function / on_function_hot from the interpreter,
//!     // pump() from its idle loop
//!     jit.pump();
//!     Ok(())
//! }
//! ```
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Data model** | [`snapshot`], [`ir`] |
//! | **Compilation** | [`backend`] |
//! | **Orchestration** | [`scheduler`], [`codegen`] |
//! | **Boundary** | [`transport`], [`install`], [`error`](Error) |

pub mod backend;
pub mod codegen;
pub mod install;
pub mod ir;
pub mod scheduler;
pub mod snapshot;
pub mod transport;

mod error;

pub use backend::encode::Arch;
pub use backend::{Backend, CompiledArtifact};
pub use codegen::{CodeGenStats, CodeGenerator, JitConfig};
pub use error::{Error, FailureReason, Result};
pub use install::{EntryPointPublisher, EntryPointTable};
pub use scheduler::{Priority, Scheduler, Tier, WorkItemHandle};
pub use snapshot::{capture, FunctionId, FunctionProfile, FunctionSnapshot, RemoteAddr};
pub use transport::{serve_agent, AgentConnection, AgentMode, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
