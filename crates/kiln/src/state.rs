//! Process-wide shared state and the thread-local execution context.
//!
//! A single mutex guards every shared table (variables, CSE, streams,
//! allocator metadata, kernel cache, registry). The lock is dropped around
//! blocking driver calls; helpers that operate on `&mut State` make that
//! discipline explicit at the call sites.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::alloc::{AllocInfo, AllocType};
use crate::backend::{BackendHandle, BackendKind};
use crate::error::{JitError, Result};
use crate::kernel_cache::{CachedKernel, KernelKey};
use crate::registry::Registry;
use crate::var::{Variable, VariableKey};

/// Pointers released on a stream, gated by a completion event.
pub(crate) struct ReleaseBlock {
    pub event: usize,
    pub ptrs: Vec<usize>,
}

/// One logical execution lane: a CUDA stream, or a host submission queue.
pub(crate) struct Stream {
    pub kind: BackendKind,
    pub device: i32,
    pub index: u32,
    /// Driver stream handle (0 for the host backend).
    pub handle: usize,
    /// Pending variable ids awaiting evaluation, in id order.
    pub todo: BTreeSet<u32>,
    /// Pointers freed since the last kernel launch on this stream.
    pub release_pending: Vec<usize>,
    /// Release blocks waiting for their events to complete.
    pub release_chain: VecDeque<ReleaseBlock>,
    /// Scratch streams used for parallel dispatch of independent kernels,
    /// kept for reuse until the stream is destroyed.
    pub scratch: Vec<usize>,
}

pub(crate) struct State {
    pub backends: Vec<BackendHandle>,
    /// Number of CUDA devices (0 when only the host backend is active).
    pub device_count: i32,
    pub streams: HashMap<(i32, u32), Stream>,

    pub variables: HashMap<u32, Variable>,
    pub cse: HashMap<VariableKey, u32>,
    /// Pointer-literal side table: address -> variable id.
    pub var_from_ptr: HashMap<usize, u32>,
    /// Next variable id; id 0 is the reserved null variable.
    pub variable_index: u32,

    pub kernels: HashMap<KernelKey, CachedKernel>,
    pub cache_dir: Option<PathBuf>,

    pub allocs: HashMap<usize, AllocInfo>,
    pub free_lists: HashMap<(AllocType, i32, usize), Vec<usize>>,
    pub alloc_usage: [usize; 5],
    pub alloc_watermark: [usize; 5],

    pub registry: Registry,

    pub parallel_dispatch: bool,
}

impl State {
    fn new() -> Self {
        State {
            backends: Vec::new(),
            device_count: 0,
            streams: HashMap::new(),
            variables: HashMap::new(),
            cse: HashMap::new(),
            var_from_ptr: HashMap::new(),
            variable_index: 1,
            kernels: HashMap::new(),
            cache_dir: None,
            allocs: HashMap::new(),
            free_lists: HashMap::new(),
            alloc_usage: [0; 5],
            alloc_watermark: [0; 5],
            registry: Registry::default(),
            parallel_dispatch: true,
        }
    }

    pub fn initialized(&self) -> bool {
        !self.backends.is_empty()
    }

    /// Backend registered for the given kind, if any.
    pub fn backend(&self, kind: BackendKind) -> Option<BackendHandle> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .cloned()
    }

    /// Backend driving the given device id (-1 selects the host backend).
    pub fn backend_for_device(&self, device: i32) -> Result<BackendHandle> {
        let kind = if device < 0 {
            BackendKind::Llvm
        } else {
            BackendKind::Cuda
        };
        self.backend(kind).ok_or(JitError::UninitializedStream)
    }

    pub fn stream(&self, key: (i32, u32)) -> Result<&Stream> {
        self.streams.get(&key).ok_or(JitError::UninitializedStream)
    }

    pub fn stream_mut(&mut self, key: (i32, u32)) -> Result<&mut Stream> {
        self.streams
            .get_mut(&key)
            .ok_or(JitError::UninitializedStream)
    }
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::new()));

thread_local! {
    /// The (device, stream) pair selected by this thread via `device_set`.
    static ACTIVE_STREAM: Cell<Option<(i32, u32)>> = const { Cell::new(None) };
    /// Target buffer of the next scatter/atomic-update append on this
    /// thread; see `trace::set_scatter_gather_operand`.
    static SCATTER_OPERAND: Cell<u32> = const { Cell::new(0) };
}

pub(crate) fn lock() -> MutexGuard<'static, State> {
    STATE.lock().expect("jit state poisoned")
}

pub(crate) fn active_stream_key() -> Result<(i32, u32)> {
    ACTIVE_STREAM
        .with(|cell| cell.get())
        .ok_or(JitError::UninitializedStream)
}

pub(crate) fn set_active_stream(key: Option<(i32, u32)>) {
    ACTIVE_STREAM.with(|cell| cell.set(key));
}

pub(crate) fn scatter_operand() -> u32 {
    SCATTER_OPERAND.with(|cell| cell.get())
}

pub(crate) fn set_scatter_operand(index: u32) {
    SCATTER_OPERAND.with(|cell| cell.set(index));
}
