//! `kiln` — a tracing just-in-time compiler core.
//!
//! The library lazily records arithmetic, memory, and control-flow
//! statements issued by a host program into a reference-counted expression
//! DAG with common subexpression elimination, and fuses each batch of
//! pending results into a single kernel executed on a GPU (PTX through the
//! CUDA driver) or on the host CPU (LLVM IR through an execution engine).
//! Recorded statements are IR templates whose placeholders are substituted
//! with concrete register names and types at code generation time, so the
//! same trace compiled twice — even across process restarts — reuses the
//! compiled kernel through content-hashed memory and disk caches.
//!
//! ## Architecture
//!
//! ```text
//! trace::append_*()            var table + CSE        (crate::trace, crate::var)
//!        |                          |
//!        v                          v
//! pending set (per stream) --> eval(): schedule, substitute, hash
//!                                   |
//!                     kernel caches (memory, ~/.kiln)
//!                                   |
//!                          Backend::compile/launch
//!                                   |
//!                 async allocator release chains (crate::alloc)
//! ```
//!
//! Backends implement [`backend::Backend`] and are registered through
//! [`init`]; see the `kiln-backend-cuda` and `kiln-backend-llvm` crates.
//!
//! The library is thread-safe: all shared tables sit behind one
//! process-wide lock that is released around blocking driver calls. Each
//! host thread declares its own (device, stream) pair via [`device_set`]
//! and then traces and evaluates independently.

pub mod alloc;
pub mod backend;
pub mod collective;
mod error;
pub mod eval;
mod init;
mod kernel_cache;
pub mod logging;
pub mod registry;
mod state;
mod template;
pub mod trace;
pub mod types;
pub mod var;

pub use backend::{Backend, BackendKind, ReduceOp};
pub use error::{JitError, Result};
pub use eval::{eval, var_eval};
pub use init::{
    device_count, device_set, has_backend, init, init_async, parallel_dispatch,
    set_parallel_dispatch, shutdown, sync_device, sync_stream,
};
pub use logging::LogLevel;
pub use types::VarType;
