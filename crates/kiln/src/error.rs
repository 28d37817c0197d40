use thiserror::Error;

use crate::alloc::AllocType;

/// Recoverable errors surfaced by the JIT compiler.
///
/// Everything here can be handled by the caller; violations of internal
/// invariants (e.g. a dependency edge pointing at a variable that is no
/// longer in the table) panic instead, since the shared state can no longer
/// be trusted once they occur.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("no active device/stream; call device_set() first")]
    UninitializedStream,

    #[error("arithmetic involving arrays of incompatible size {sizes:?}; the statement was \"{stmt}\"")]
    ShapeMismatch { stmt: String, sizes: Vec<u32> },

    #[error("arithmetic involving an uninitialized variable (operand id 0)")]
    NullOperand,

    #[error("attempted to resize variable {index}, which was already allocated (current size = {current}, requested size = {requested})")]
    InvalidResize {
        index: u32,
        current: u32,
        requested: u32,
    },

    #[error("unknown variable {0}")]
    UnknownVariable(u32),

    #[error("variable {index} has no {counter} references")]
    RefCountUnderflow {
        index: u32,
        counter: &'static str,
    },

    #[error("pointer {ptr:#x} is already registered (domain \"{domain}\")")]
    RegistryCollision { domain: String, ptr: usize },

    #[error("pointer {0:#x} is not registered")]
    UnknownRegistration(usize),

    #[error("{backend} kernel compilation failed: {message}")]
    CompileFailed {
        backend: &'static str,
        message: String,
    },

    #[error("out of memory while allocating {bytes} bytes of {ty} memory")]
    OutOfMemory { ty: AllocType, bytes: usize },

    #[error("driver error: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, JitError>;
