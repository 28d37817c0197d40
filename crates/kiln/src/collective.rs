//! Tuned collective kernels: initialization, reductions, prefix sums, and
//! permutation building blocks used by higher layers.
//!
//! The core validates arguments and dispatches to the active backend;
//! the actual kernels are hand-written per backend.

use crate::backend::{BackendHandle, ReduceOp};
use crate::error::Result;
use crate::state;
use crate::types::VarType;

fn active_backend() -> Result<(BackendHandle, usize)> {
    let state = state::lock();
    let key = state::active_stream_key()?;
    let stream = state.stream(key)?;
    Ok((state.backend_for_device(stream.device)?, stream.handle))
}

/// Writes `size` copies of the element in `value` to `ptr`. `value` must
/// be exactly one element of `ty`.
pub fn fill(ty: VarType, ptr: *mut u8, size: u32, value: &[u8]) -> Result<()> {
    assert_eq!(value.len(), ty.size(), "fill value has the wrong width");
    if size == 0 {
        return Ok(());
    }
    let (backend, stream) = active_backend()?;
    backend.fill(stream, ty, ptr as usize, size, value)
}

/// Synchronous copy between two buffers visible to the active backend.
pub fn memcpy(dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (backend, _stream) = active_backend()?;
    backend.memcpy(dst as usize, src as usize, size)
}

/// Asynchronous copy ordered with respect to the active stream.
pub fn memcpy_async(dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (backend, stream) = active_backend()?;
    backend.memcpy_async(dst as usize, src as usize, size, stream)
}

/// Reduces `size` elements of `ptr` into the single element at `out`.
pub fn reduce(ty: VarType, op: ReduceOp, ptr: *const u8, size: u32, out: *mut u8) -> Result<()> {
    let (backend, stream) = active_backend()?;
    backend.reduce(stream, ty, op, ptr as usize, size, out as usize)
}

/// Exclusive prefix sum over unsigned 32-bit integers; may run in place.
///
/// On the GPU, sizes above 4096 are rounded up to the next multiple of
/// 4096 and the implementation reads and writes up to that boundary, so
/// the buffers must be allocated accordingly (allocations obtained from
/// [`crate::alloc::malloc`] always are, since they round to powers of two).
pub fn scan(input: *const u32, output: *mut u32, size: u32) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (backend, stream) = active_backend()?;
    backend.scan_u32(stream, input as usize, output as usize, size)
}

/// Boolean AND reduction over `size` bytes. The implementation may
/// initialize up to three bytes past the end of the range so that a 32-bit
/// reduction can be used.
pub fn all(values: *mut u8, size: u32) -> Result<bool> {
    if size == 0 {
        return Ok(true);
    }
    let (backend, stream) = active_backend()?;
    backend.all(stream, values as usize, size)
}

/// Boolean OR reduction over `size` bytes; see [`all`] for the tail-byte
/// caveat.
pub fn any(values: *mut u8, size: u32) -> Result<bool> {
    if size == 0 {
        return Ok(false);
    }
    let (backend, stream) = active_backend()?;
    backend.any(stream, values as usize, size)
}

/// Computes a permutation that reorders `values` (entries in
/// `0..bucket_count`) into a bucket-sorted configuration. The sort is not
/// stable.
///
/// `perm` receives `size` indices. When `offsets` is non-null it must
/// point to at least `bucket_count * 4 + 1` u32 slots and is filled with
/// quadruples `(bucket, start, length, unused)` for each non-empty bucket;
/// the return value is then the number of non-empty buckets (0 otherwise).
pub fn mkperm(
    values: *const u32,
    size: u32,
    bucket_count: u32,
    perm: *mut u32,
    offsets: *mut u32,
) -> Result<u32> {
    if size == 0 {
        return Ok(0);
    }
    let (backend, stream) = active_backend()?;
    backend.mkperm(
        stream,
        values as usize,
        size,
        bucket_count,
        perm as usize,
        offsets as usize,
    )
}
