//! The capability interface between the shared JIT core and the two
//! execution backends.
//!
//! The core owns the variable graph, scheduling, template substitution, and
//! all caches; a backend contributes the pieces that differ between CUDA PTX
//! and LLVM IR: register naming, kernel skeleton assembly, parameter
//! load/store emission, compilation, launching, and the raw memory/stream
//! primitives the asynchronous allocator builds on. Handles crossing this
//! boundary (streams, events, kernels, device pointers) are plain `usize`
//! values owned by the backend, which keeps the shared state `Send` without
//! spreading raw pointer types through the tables.

use std::sync::Arc;

use crate::alloc::AllocType;
use crate::error::Result;
use crate::types::VarType;

/// The two code generation / execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cuda,
    Llvm,
}

impl BackendKind {
    /// Short name used in log output and disk cache file names.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Cuda => "cuda",
            BackendKind::Llvm => "llvm",
        }
    }
}

/// A register class: the name prefix shared by all registers of the class
/// and the declaration spelling the backend needs in its preamble (empty
/// for SSA-style backends that do not declare registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegClass {
    pub prefix: &'static str,
    pub decl: &'static str,
}

/// Reduction operators accepted by [`Backend::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Add => "add",
            ReduceOp::Mul => "mul",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::And => "and",
            ReduceOp::Or => "or",
        }
    }
}

/// Result of compiling one fused kernel.
pub struct CompiledKernel {
    /// Backend-private handle used for launching and freeing.
    pub handle: usize,
    /// Portable representation written to the disk cache (PTX text for
    /// CUDA, IR text for LLVM); the driver-side JIT re-specializes it on
    /// load.
    pub portable: Vec<u8>,
}

/// Narrow interface implemented by each execution backend.
///
/// All raw handles are owned by the backend; the core never interprets
/// them. Methods that talk to the driver may block and are called with the
/// global state lock released.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Number of devices this backend drives (0 for the host backend,
    /// which is addressed as device -1).
    fn device_count(&self) -> i32;

    /// Tag stored alongside disk-cached kernels: compute capability for
    /// CUDA, target feature set and vector width for LLVM. A cached record
    /// whose tag does not match is treated as a miss.
    fn cache_tag(&self, device: i32) -> String;

    /// Called by [`crate::shutdown`] after streams were drained and
    /// kernels freed. A light shutdown keeps the driver/engine warm for a
    /// later re-initialization; a full one tears it down.
    fn shutdown(&self, light: bool) {
        let _ = light;
    }

    // ----------------------- code generation -----------------------

    /// Register class backing values of the given type.
    fn register_class(&self, ty: VarType) -> RegClass;

    /// Number of registers of `class` the kernel skeleton reserves for its
    /// own use (loop counters, address arithmetic). Trace registers are
    /// numbered starting after the reserved range.
    fn reserved_registers(&self, class: RegClass) -> u32;

    /// Textual type name substituted for `$tN`.
    fn type_name(&self, ty: VarType) -> String;

    /// Generic binary type of matching width, substituted for `$bN`.
    fn binary_type_name(&self, ty: VarType) -> String;

    /// Current SIMD width, substituted for `$wN` (1 on CUDA).
    fn vector_width(&self) -> u32;

    /// Text appended after every substituted statement line (`";"` for
    /// PTX, empty for LLVM IR).
    fn stmt_suffix(&self) -> &'static str;

    /// One-operand copy template used by `set_size` when it must duplicate
    /// an evaluated scalar.
    fn copy_stmt(&self) -> &'static str;

    /// Literal statement produced for an all-true / all-false mask, used
    /// for constant propagation of masks that have not been evaluated.
    fn mask_literal(&self, value: bool) -> &'static str;

    /// Whether a 3-operand statement writes through a pointer operand
    /// (store or atomic update), which makes it subject to scatter-target
    /// pinning.
    fn is_scatter_stmt(&self, stmt: &str) -> bool;

    /// Emits the code that loads element `index` of kernel parameter
    /// `param` into `reg`. With `broadcast` set the parameter is a scalar
    /// and the index is ignored.
    fn emit_load(&self, body: &mut String, reg: &str, ty: VarType, param: usize, broadcast: bool);

    /// Emits the code that loads the *value* of kernel parameter `param`
    /// (a pointer literal) into `reg`, without dereferencing it.
    fn emit_load_ptr(&self, body: &mut String, reg: &str, param: usize);

    /// Emits the store of `reg` to element `index` of parameter `param`.
    fn emit_store(&self, body: &mut String, reg: &str, ty: VarType, param: usize);

    /// Wraps an emitted body in the backend's kernel skeleton (grid-stride
    /// loop on CUDA, vector loop on LLVM). `reg_counts` lists the total
    /// number of registers used per class, including the reserved range.
    fn assemble(
        &self,
        device: i32,
        body: &str,
        n_params: usize,
        reg_counts: &[(RegClass, u32)],
    ) -> String;

    // ----------------------- compile & launch -----------------------

    /// Compiles an assembled kernel. The portable form is what the disk
    /// cache stores.
    fn compile(&self, device: i32, source: &str) -> Result<CompiledKernel>;

    /// Reloads a kernel from its portable form (a disk cache hit).
    fn load_portable(&self, device: i32, payload: &[u8]) -> Result<usize>;

    /// Releases a kernel handle.
    fn free_kernel(&self, handle: usize);

    /// Launches `kernel` over `size` elements. `params` holds one device
    /// address (or pointer-literal value) per kernel parameter.
    fn launch(&self, kernel: usize, stream: usize, size: u32, params: &[usize]) -> Result<()>;

    // ----------------------- streams & events -----------------------

    fn stream_create(&self, device: i32) -> Result<usize>;
    fn stream_destroy(&self, stream: usize);
    fn stream_sync(&self, stream: usize) -> Result<()>;
    fn device_sync(&self, device: i32) -> Result<()>;

    fn event_create(&self, device: i32) -> Result<usize>;
    fn event_destroy(&self, event: usize);
    fn event_record(&self, event: usize, stream: usize) -> Result<()>;
    /// Returns true once all work preceding the matching `event_record`
    /// has completed.
    fn event_query(&self, event: usize) -> Result<bool>;
    /// Makes future work on `stream` wait (device-side) until `event` has
    /// completed. Used to join parallel-dispatch scratch streams back into
    /// the stream that triggered the evaluation.
    fn stream_wait_event(&self, stream: usize, event: usize) -> Result<()>;

    // ----------------------- memory -----------------------

    fn mem_alloc(&self, ty: AllocType, bytes: usize, device: i32) -> Result<usize>;
    fn mem_free(&self, ty: AllocType, ptr: usize, device: i32);
    fn memcpy(&self, dst: usize, src: usize, bytes: usize) -> Result<()>;
    fn memcpy_async(&self, dst: usize, src: usize, bytes: usize, stream: usize) -> Result<()>;
    fn memset_async(&self, ptr: usize, value: u8, bytes: usize, stream: usize) -> Result<()>;
    fn mem_prefetch(&self, ptr: usize, bytes: usize, device: i32, stream: usize) -> Result<()>;
    fn peer_copy(
        &self,
        dst: usize,
        dst_device: i32,
        src: usize,
        src_device: i32,
        bytes: usize,
        stream: usize,
    ) -> Result<()>;

    // ----------------------- collectives -----------------------

    fn fill(&self, stream: usize, ty: VarType, ptr: usize, size: u32, value: &[u8]) -> Result<()>;

    fn reduce(
        &self,
        stream: usize,
        ty: VarType,
        op: ReduceOp,
        ptr: usize,
        size: u32,
        out: usize,
    ) -> Result<()>;

    /// Exclusive prefix sum over 32-bit unsigned integers; `input` and
    /// `output` may alias. Sizes above 4096 are rounded up to the next
    /// multiple of 4096 on the GPU; the caller must allocate accordingly.
    fn scan_u32(&self, stream: usize, input: usize, output: usize, size: u32) -> Result<()>;

    /// Boolean AND reduction over `size` bytes; may touch up to three
    /// bytes past the end.
    fn all(&self, stream: usize, values: usize, size: u32) -> Result<bool>;

    /// Boolean OR reduction over `size` bytes; may touch up to three
    /// bytes past the end.
    fn any(&self, stream: usize, values: usize, size: u32) -> Result<bool>;

    /// Bucket-sort permutation (see [`crate::collective::mkperm`]).
    fn mkperm(
        &self,
        stream: usize,
        values: usize,
        size: u32,
        bucket_count: u32,
        perm: usize,
        offsets: usize,
    ) -> Result<u32>;
}

/// Shared handle to a registered backend.
pub type BackendHandle = Arc<dyn Backend>;
