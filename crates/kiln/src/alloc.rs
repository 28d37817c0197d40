//! Asynchronous caching memory allocator.
//!
//! Allocations are rounded up to the next power of two and recycled
//! through free lists keyed by (type, device, rounded size), so that a
//! buffer freed by one kernel can be handed to the next without a
//! CPU/device synchronization. Device-accessible pointers are not returned
//! to the free list immediately on [`free`]: they join the *release chain*
//! of the current stream and only become reusable once an event recorded
//! behind the kernel that may still access them has completed.

use std::alloc::Layout;

use log::{debug, info, trace, warn};

use crate::error::{JitError, Result};
use crate::state::{self, ReleaseBlock, State};

/// Flavors of memory handed out by [`malloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AllocType {
    /// Ordinary host memory.
    Host,
    /// Page-locked host memory, usable as a DMA source/target.
    HostPinned,
    /// Memory local to one device.
    Device,
    /// Memory mapped into the address space of the host and all devices.
    Managed,
    /// Like `Managed`, tuned for read-mostly access patterns.
    ManagedReadMostly,
}

impl std::fmt::Display for AllocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AllocType {
    pub const ALL: [AllocType; 5] = [
        AllocType::Host,
        AllocType::HostPinned,
        AllocType::Device,
        AllocType::Managed,
        AllocType::ManagedReadMostly,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AllocType::Host => "host",
            AllocType::HostPinned => "host-pinned",
            AllocType::Device => "device",
            AllocType::Managed => "managed",
            AllocType::ManagedReadMostly => "managed-read-mostly",
        }
    }

    /// Everything except plain host memory may still be in use by an
    /// in-flight kernel and must go through the release chain.
    pub fn is_device_accessible(self) -> bool {
        !matches!(self, AllocType::Host)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Bookkeeping for one live address. The entry persists while the address
/// sits in a free list and is only dropped by [`malloc_trim`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocInfo {
    pub ty: AllocType,
    pub device: i32,
    pub rounded: usize,
}

const ALLOC_ALIGN: usize = 64;

/// Minimum allocation granularity. Kernels may read a full vector width
/// past the logical end of an array; the floor guarantees that such reads
/// stay inside the allocation.
const ALLOC_FLOOR: usize = 128;

fn round_size(bytes: usize) -> usize {
    bytes.max(1).next_power_of_two().max(ALLOC_FLOOR)
}

fn host_alloc(rounded: usize) -> Result<usize> {
    let layout = Layout::from_size_align(rounded, ALLOC_ALIGN).expect("invalid layout");
    // SAFETY: Layout has nonzero size by construction.
    let ptr = unsafe { std::alloc::alloc(layout) };
    if ptr.is_null() {
        return Err(JitError::OutOfMemory {
            ty: AllocType::Host,
            bytes: rounded,
        });
    }
    Ok(ptr as usize)
}

fn host_free(ptr: usize, rounded: usize) {
    let layout = Layout::from_size_align(rounded, ALLOC_ALIGN).expect("invalid layout");
    // SAFETY: The pointer was produced by `host_alloc` with this layout.
    unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
}

/// Formats a byte count for diagnostics.
pub(crate) fn mem_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.3} {}", value, UNITS[unit])
    }
}

/// Allocates `size` bytes of the given flavor. Device-accessible flavors
/// require an active stream.
pub fn malloc(ty: AllocType, size: usize) -> Result<*mut u8> {
    let rounded = round_size(size);

    // First look in the matching free list, reclaiming any released
    // pointers whose gating event has completed.
    {
        let mut state = state::lock();
        let device = alloc_device(&state, ty)?;
        if let Ok(key) = state::active_stream_key() {
            if state.streams.contains_key(&key) {
                process_releases(&mut state, key, false)?;
            }
        }
        if let Some(ptr) = pop_free(&mut state, ty, device, rounded) {
            trace!("malloc({}, {}): reused {:#x}", ty.name(), rounded, ptr);
            return Ok(ptr as *mut u8);
        }
    }

    // Miss: ask the OS / driver, flushing and trimming before giving up.
    match fresh_alloc(ty, rounded) {
        Ok(ptr) => Ok(ptr),
        Err(JitError::OutOfMemory { .. }) => {
            // Nothing to flush without an active stream; the retry below
            // then only consults the free lists.
            let _ = crate::sync_stream();
            {
                let mut state = state::lock();
                let device = alloc_device(&state, ty)?;
                if let Ok(key) = state::active_stream_key() {
                    if state.streams.contains_key(&key) {
                        process_releases(&mut state, key, true)?;
                    }
                }
                if let Some(ptr) = pop_free(&mut state, ty, device, rounded) {
                    return Ok(ptr as *mut u8);
                }
            }
            malloc_trim();
            fresh_alloc(ty, rounded)
        }
        Err(err) => Err(err),
    }
}

fn alloc_device(state: &State, ty: AllocType) -> Result<i32> {
    if ty == AllocType::Host {
        return Ok(-1);
    }
    let key = state::active_stream_key()?;
    Ok(state.stream(key)?.device)
}

fn pop_free(state: &mut State, ty: AllocType, device: i32, rounded: usize) -> Option<usize> {
    let list = state.free_lists.get_mut(&(ty, device, rounded))?;
    let ptr = list.pop()?;
    record_usage(state, ty, rounded);
    Some(ptr)
}

fn record_usage(state: &mut State, ty: AllocType, rounded: usize) {
    let idx = ty.index();
    state.alloc_usage[idx] += rounded;
    state.alloc_watermark[idx] = state.alloc_watermark[idx].max(state.alloc_usage[idx]);
}

fn fresh_alloc(ty: AllocType, rounded: usize) -> Result<*mut u8> {
    let (ptr, device) = if ty == AllocType::Host {
        (host_alloc(rounded)?, -1)
    } else {
        let (backend, device, _stream) = {
            let state = state::lock();
            let key = state::active_stream_key()?;
            let stream = state.stream(key)?;
            (
                state.backend_for_device(stream.device)?,
                stream.device,
                stream.handle,
            )
        };
        (backend.mem_alloc(ty, rounded, device)?, device)
    };

    let mut state = state::lock();
    state.allocs.insert(ptr, AllocInfo { ty, device, rounded });
    record_usage(&mut state, ty, rounded);
    debug!("malloc({}, {}): new allocation {:#x}", ty.name(), rounded, ptr);
    Ok(ptr as *mut u8)
}

/// Releases a pointer previously returned by [`malloc`].
///
/// Host memory returns to the free list immediately. Device-accessible
/// memory is appended to the release chain of the current stream and only
/// becomes reusable once the next recorded completion event has passed.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let addr = ptr as usize;
    let mut state = state::lock();
    if state.allocs.is_empty() {
        return;
    }
    let info = match state.allocs.get(&addr) {
        Some(info) => *info,
        None => panic!("free({addr:#x}): unknown allocation"),
    };
    state.alloc_usage[info.ty.index()] -= info.rounded;

    if info.ty.is_device_accessible() {
        if let Ok(key) = state::active_stream_key() {
            if let Some(stream) = state.streams.get_mut(&key) {
                stream.release_pending.push(addr);
                trace!("free({:#x}): scheduled for release", addr);
                return;
            }
        }
    }

    state
        .free_lists
        .entry((info.ty, info.device, info.rounded))
        .or_default()
        .push(addr);
    trace!("free({:#x}): returned to free list", addr);
}

/// Internal variant used while the state lock is already held.
pub(crate) fn free_in(state: &mut State, addr: usize) {
    if state.allocs.is_empty() {
        return;
    }
    let info = match state.allocs.get(&addr) {
        Some(info) => *info,
        None => panic!("free({addr:#x}): unknown allocation"),
    };
    state.alloc_usage[info.ty.index()] -= info.rounded;

    if info.ty.is_device_accessible() {
        if let Ok(key) = state::active_stream_key() {
            if let Some(stream) = state.streams.get_mut(&key) {
                stream.release_pending.push(addr);
                return;
            }
        }
    }

    state
        .free_lists
        .entry((info.ty, info.device, info.rounded))
        .or_default()
        .push(addr);
}

/// Moves completed release blocks of `stream_key` back to the free lists.
/// With `force` set, every block is assumed complete (the caller must have
/// synchronized the stream first).
pub(crate) fn process_releases(
    state: &mut State,
    stream_key: (i32, u32),
    force: bool,
) -> Result<()> {
    // After a full synchronization nothing is in flight, so frees that
    // were never gated by a launch event can return directly.
    if force {
        let pending = match state.streams.get_mut(&stream_key) {
            Some(stream) => std::mem::take(&mut stream.release_pending),
            None => Vec::new(),
        };
        for addr in pending {
            let info = *state
                .allocs
                .get(&addr)
                .unwrap_or_else(|| panic!("release of unknown allocation {addr:#x}"));
            state
                .free_lists
                .entry((info.ty, info.device, info.rounded))
                .or_default()
                .push(addr);
        }
    }

    loop {
        let (event, backend) = {
            let stream = match state.streams.get(&stream_key) {
                Some(s) => s,
                None => return Ok(()),
            };
            match stream.release_chain.front() {
                Some(block) => (block.event, state.backend_for_device(stream.device)?),
                None => return Ok(()),
            }
        };

        if !force && !backend.event_query(event)? {
            return Ok(());
        }

        let block = state
            .streams
            .get_mut(&stream_key)
            .expect("stream disappeared")
            .release_chain
            .pop_front()
            .expect("release chain emptied concurrently");
        backend.event_destroy(block.event);
        for addr in block.ptrs {
            let info = *state
                .allocs
                .get(&addr)
                .unwrap_or_else(|| panic!("release of unknown allocation {addr:#x}"));
            state
                .free_lists
                .entry((info.ty, info.device, info.rounded))
                .or_default()
                .push(addr);
        }
    }
}

/// Records a completion event gating everything freed on `stream_key`
/// since the previous record. Called by the evaluator after each launch;
/// `launch_stream` is the driver stream the kernel actually ran on (a
/// scratch stream under parallel dispatch).
pub(crate) fn record_release_event(
    state: &mut State,
    stream_key: (i32, u32),
    launch_stream: usize,
) -> Result<()> {
    let (device, ptrs) = {
        let stream = state.stream_mut(stream_key)?;
        if stream.release_pending.is_empty() {
            return Ok(());
        }
        (stream.device, std::mem::take(&mut stream.release_pending))
    };
    let backend = state.backend_for_device(device)?;
    let event = backend.event_create(device)?;
    backend.event_record(event, launch_stream)?;
    state
        .stream_mut(stream_key)?
        .release_chain
        .push_back(ReleaseBlock { event, ptrs });
    Ok(())
}

/// Changes the flavor of an allocation, returning the (possibly new)
/// pointer. The copy is asynchronous; the old allocation is scheduled for
/// release. When source and destination are device memory on different
/// devices a peer-to-peer copy is performed.
pub fn malloc_migrate(ptr: *mut u8, ty: AllocType) -> Result<*mut u8> {
    if ptr.is_null() {
        return Ok(ptr);
    }
    let addr = ptr as usize;

    let (info, target_device, backend, stream_handle) = {
        let state = state::lock();
        let info = *state
            .allocs
            .get(&addr)
            .unwrap_or_else(|| panic!("malloc_migrate({addr:#x}): unknown allocation"));
        let key = state::active_stream_key()?;
        let stream = state.stream(key)?;
        (
            info,
            stream.device,
            state.backend_for_device(stream.device)?,
            stream.handle,
        )
    };

    if info.ty == ty && (ty != AllocType::Device || info.device == target_device) {
        return Ok(ptr);
    }

    let new_ptr = malloc(ty, info.rounded)?;
    if info.ty == AllocType::Device && ty == AllocType::Device && info.device != target_device {
        backend.peer_copy(
            new_ptr as usize,
            target_device,
            addr,
            info.device,
            info.rounded,
            stream_handle,
        )?;
    } else {
        backend.memcpy_async(new_ptr as usize, addr, info.rounded, stream_handle)?;
    }
    debug!(
        "malloc_migrate({:#x}, {} -> {}): new pointer {:#x}",
        addr,
        info.ty.name(),
        ty.name(),
        new_ptr as usize
    );
    free(ptr);
    Ok(new_ptr)
}

/// Prefetches a managed allocation to the given device (-1 = host,
/// -2 = every device).
pub fn malloc_prefetch(ptr: *mut u8, device: i32) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let addr = ptr as usize;
    let (info, backend, stream_handle, device_count) = {
        let state = state::lock();
        let info = *state
            .allocs
            .get(&addr)
            .unwrap_or_else(|| panic!("malloc_prefetch({addr:#x}): unknown allocation"));
        let key = state::active_stream_key()?;
        let stream = state.stream(key)?;
        (
            info,
            state.backend_for_device(stream.device)?,
            stream.handle,
            state.device_count,
        )
    };
    if !matches!(info.ty, AllocType::Managed | AllocType::ManagedReadMostly) {
        return Ok(());
    }
    if device == -2 {
        for d in 0..device_count {
            backend.mem_prefetch(addr, info.rounded, d, stream_handle)?;
        }
    } else {
        backend.mem_prefetch(addr, info.rounded, device, stream_handle)?;
    }
    Ok(())
}

/// Bytes currently handed out (not sitting in a free list) for one
/// allocation flavor.
pub fn usage(ty: AllocType) -> usize {
    state::lock().alloc_usage[ty.index()]
}

/// High-water mark of [`usage`] for one allocation flavor.
pub fn watermark(ty: AllocType) -> usize {
    state::lock().alloc_watermark[ty.index()]
}

/// Returns all free-list memory to the OS / driver.
pub fn malloc_trim() {
    let (lists, backends): (Vec<_>, Vec<_>) = {
        let mut state = state::lock();
        let lists: Vec<((AllocType, i32, usize), Vec<usize>)> =
            state.free_lists.drain().collect();
        for (_, ptrs) in &lists {
            for ptr in ptrs {
                state.allocs.remove(ptr);
            }
        }
        (lists, state.backends.clone())
    };

    let mut count = 0usize;
    let mut bytes = 0usize;
    for ((ty, device, rounded), ptrs) in lists {
        for ptr in ptrs {
            count += 1;
            bytes += rounded;
            if ty == AllocType::Host {
                host_free(ptr, rounded);
            } else {
                let kind = if device < 0 {
                    crate::backend::BackendKind::Llvm
                } else {
                    crate::backend::BackendKind::Cuda
                };
                if let Some(backend) = backends.iter().find(|b| b.kind() == kind) {
                    backend.mem_free(ty, ptr, device);
                }
            }
        }
    }
    if count > 0 {
        info!(
            "malloc_trim(): released {} allocations ({})",
            count,
            mem_string(bytes)
        );
    }
}

/// Warns about leaked allocations and drops the allocator tables. The
/// caller must have synchronized and drained every stream first.
pub(crate) fn alloc_shutdown(state: &mut State) {
    let free_count: usize = state.free_lists.values().map(Vec::len).sum();
    let leaked = state.allocs.len().saturating_sub(free_count);
    if leaked > 0 {
        warn!("shutdown(): {} memory allocations are still in use!", leaked);
    }

    let lists: Vec<((AllocType, i32, usize), Vec<usize>)> = state.free_lists.drain().collect();
    for ((ty, device, rounded), ptrs) in lists {
        for ptr in ptrs {
            state.allocs.remove(&ptr);
            if ty == AllocType::Host {
                host_free(ptr, rounded);
            } else if let Ok(backend) = state.backend_for_device(device) {
                backend.mem_free(ty, ptr, device);
            }
        }
    }
    state.allocs.clear();
    state.alloc_usage = [0; 5];
}
