//! Lifecycle and device/stream management.

use std::collections::{BTreeSet, VecDeque};

use log::{debug, info, trace, warn};

use crate::backend::{BackendHandle, BackendKind};
use crate::error::{JitError, Result};
use crate::kernel_cache;
use crate::logging::{self, LogLevel};
use crate::state::{self, Stream};
use crate::{alloc, registry, var};

/// Initializes the JIT compiler with the given execution backends. Does
/// nothing when initialization already occurred; call [`shutdown`] first
/// to start from a clean slate.
pub fn init(backends: Vec<BackendHandle>) -> Result<()> {
    logging::install();
    let mut state = state::lock();
    if state.initialized() || backends.is_empty() {
        return Ok(());
    }

    state.cache_dir = kernel_cache::default_cache_dir();
    if let Some(dir) = state.cache_dir.clone() {
        if !dir.exists() {
            info!("init(): creating directory \"{}\" ..", dir.display());
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(
                    "init(): creation of directory \"{}\" failed: {err}; disk cache disabled",
                    dir.display()
                );
                state.cache_dir = None;
            }
        }
    }

    state.device_count = backends
        .iter()
        .find(|b| b.kind() == BackendKind::Cuda)
        .map(|b| b.device_count())
        .unwrap_or(0);
    for backend in &backends {
        info!(
            "init(): {} backend with {} device(s)",
            backend.kind().name(),
            if backend.kind() == BackendKind::Cuda {
                state.device_count
            } else {
                1
            }
        );
    }

    state.backends = backends;
    state.variable_index = 1;
    Ok(())
}

/// Launches a thread that runs [`init`] and returns immediately. Useful
/// when enumerating devices is slow and the caller does not need the JIT
/// right away; all other entry points acquire the state lock and thus wait
/// for initialization to finish naturally.
pub fn init_async(backends: Vec<BackendHandle>) {
    std::thread::spawn(move || {
        if let Err(err) = init(backends) {
            warn!("init_async(): initialization failed: {err}");
        }
    });
}

/// Whether a backend of the given kind was registered.
pub fn has_backend(kind: BackendKind) -> bool {
    state::lock().backend(kind).is_some()
}

/// Number of available CUDA devices (the host CPU is not counted).
pub fn device_count() -> i32 {
    state::lock().device_count
}

/// Selects the active device and stream for the calling thread. Device -1
/// targets the host CPU; 0 and up target CUDA devices. Each host thread
/// should use its own stream to dispatch concurrently.
pub fn device_set(device: i32, stream: u32) -> Result<()> {
    let key = (device, stream);
    let mut state = state::lock();
    if !state.initialized() {
        return Err(JitError::UninitializedStream);
    }
    if device < -1 || device >= state.device_count {
        return Err(JitError::Driver(format!("device_set(): invalid device {device}")));
    }

    if !state.streams.contains_key(&key) {
        trace!("device_set(device={device}, stream={stream}): creating stream");
        let backend = state.backend_for_device(device)?;
        let handle = backend.stream_create(device)?;
        state.streams.insert(
            key,
            Stream {
                kind: backend.kind(),
                device,
                index: stream,
                handle,
                todo: BTreeSet::new(),
                release_pending: Vec::new(),
                release_chain: VecDeque::new(),
                scratch: Vec::new(),
            },
        );
    } else {
        trace!("device_set(device={device}, stream={stream}): selecting stream");
    }
    drop(state);
    state::set_active_stream(Some(key));
    Ok(())
}

/// Enables or disables dispatch of differently sized kernels to separate
/// streams during a single evaluation.
pub fn set_parallel_dispatch(enable: bool) {
    state::lock().parallel_dispatch = enable;
}

/// Returns whether parallel dispatch is enabled.
pub fn parallel_dispatch() -> bool {
    state::lock().parallel_dispatch
}

/// Waits for all computation on the current stream to finish, then
/// reclaims every pointer scheduled for release on it.
pub fn sync_stream() -> Result<()> {
    let key = state::active_stream_key()?;
    let (backend, handle) = {
        let state = state::lock();
        let stream = state.stream(key)?;
        (state.backend_for_device(stream.device)?, stream.handle)
    };
    backend.stream_sync(handle)?;
    let mut state = state::lock();
    alloc::process_releases(&mut state, key, true)
}

/// Waits for all computation on the current device to finish.
pub fn sync_device() -> Result<()> {
    let key = state::active_stream_key()?;
    let (backend, device, streams): (_, _, Vec<(i32, u32)>) = {
        let state = state::lock();
        let stream = state.stream(key)?;
        let device = stream.device;
        (
            state.backend_for_device(device)?,
            device,
            state
                .streams
                .iter()
                .filter(|(_, s)| s.device == device)
                .map(|(k, _)| *k)
                .collect(),
        )
    };
    backend.device_sync(device)?;
    let mut state = state::lock();
    for stream_key in streams {
        alloc::process_releases(&mut state, stream_key, true)?;
    }
    Ok(())
}

/// Releases all resources used by the JIT compiler and reports leaks.
///
/// A light shutdown (`light = true`) flushes running computation, returns
/// cached memory, and warns about leaked variables while keeping the
/// backends themselves warm. A full shutdown additionally tears the
/// backends down, so a later [`init`] pays the full startup cost again.
pub fn shutdown(light: bool) {
    {
        let state = state::lock();
        if !state.initialized() {
            return;
        }
    }

    // Drain and destroy streams; their release chains empty into the free
    // lists.
    let keys: Vec<(i32, u32)> = state::lock().streams.keys().copied().collect();
    if !keys.is_empty() {
        info!(
            "shutdown(): releasing {} stream{} ..",
            keys.len(),
            if keys.len() > 1 { "s" } else { "" }
        );
    }
    for key in keys {
        let (backend, handle, scratch) = {
            let state = state::lock();
            let stream = match state.streams.get(&key) {
                Some(s) => s,
                None => continue,
            };
            match state.backend_for_device(stream.device) {
                Ok(b) => (b, stream.handle, stream.scratch.clone()),
                Err(_) => continue,
            }
        };
        let _ = backend.stream_sync(handle);
        for s in &scratch {
            let _ = backend.stream_sync(*s);
        }
        let mut state = state::lock();
        let _ = alloc::process_releases(&mut state, key, true);
        if let Some(stream) = state.streams.remove(&key) {
            debug!(
                "shutdown(): released {} stream {}.{}",
                stream.kind.name(),
                stream.device,
                stream.index
            );
            backend.stream_destroy(stream.handle);
            for s in stream.scratch {
                backend.stream_destroy(s);
            }
        }
    }
    state::set_active_stream(None);

    let mut state = state::lock();

    if !state.kernels.is_empty() {
        info!(
            "shutdown(): releasing {} kernel{} ..",
            state.kernels.len(),
            if state.kernels.len() > 1 { "s" } else { "" }
        );
        let kernels: Vec<_> = state.kernels.drain().collect();
        for (key, kernel) in kernels {
            if let Some(backend) = state.backend(key.kind) {
                backend.free_kernel(kernel.handle);
            }
        }
    }

    if logging::stderr_level() >= LogLevel::Warn || logging::callback_level() >= LogLevel::Warn {
        let mut ids: Vec<u32> = state.variables.keys().copied().collect();
        ids.sort_unstable();
        let mut leaked = 0u32;
        for id in ids {
            let v = var::var(&state, id);
            if leaked == 0 {
                warn!("shutdown(): detected variable leaks:");
            }
            if leaked < 10 {
                warn!(
                    " - variable {} is still being referenced! (internal references={}, external references={})",
                    id, v.ref_count_int, v.ref_count_ext
                );
            } else if leaked == 10 {
                warn!(" - (skipping remainder)");
            }
            leaked += 1;
        }
        if leaked > 0 {
            warn!("shutdown(): {} variables are still referenced!", leaked);
        }
    }

    if state.variables.is_empty() && !state.cse.is_empty() {
        panic!("shutdown(): detected a common subexpression elimination cache leak");
    }
    if state.variables.is_empty() && !state.var_from_ptr.is_empty() {
        panic!("shutdown(): detected a pointer-literal leak");
    }

    registry::registry_shutdown(&mut state);
    alloc::alloc_shutdown(&mut state);

    state.variables.clear();
    state.cse.clear();
    state.var_from_ptr.clear();
    state.variable_index = 1;

    let backends = std::mem::take(&mut state.backends);
    state.device_count = 0;
    drop(state);
    for backend in &backends {
        backend.shutdown(light);
    }
    debug!("shutdown(): done");
}
