//! Kernel caching: an in-memory map from content hashes to loaded kernels,
//! backed by a compressed on-disk cache that survives process restarts.
//!
//! The hash is a 64-bit FNV-1a digest of the fully substituted kernel
//! text. Since parameter addresses are never baked into the text (pointer
//! literals travel as kernel parameters), re-tracing the same computation
//! over different buffers produces the same hash and reuses the compiled
//! kernel.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use crate::backend::{BackendHandle, BackendKind};
use crate::error::Result;
use crate::state;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a content hash.
pub(crate) fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct KernelKey {
    pub kind: BackendKind,
    pub device: i32,
    pub hash: u64,
}

pub(crate) struct CachedKernel {
    pub handle: usize,
}

/// Returns a launchable kernel handle for the given source, consulting the
/// memory cache, then the disk cache, and compiling only on a double miss.
pub(crate) fn get_or_compile(
    kind: BackendKind,
    device: i32,
    backend: &BackendHandle,
    source: &str,
    hash: u64,
) -> Result<usize> {
    let key = KernelKey { kind, device, hash };
    let cache_dir = {
        let state = state::lock();
        if let Some(kernel) = state.kernels.get(&key) {
            debug!("kernel {:016x}: memory cache hit", hash);
            return Ok(kernel.handle);
        }
        state.cache_dir.clone()
    };

    let tag = backend.cache_tag(device);

    if let Some(dir) = cache_dir.as_deref() {
        if let Some(payload) = disk_load(dir, kind, &tag, hash) {
            match backend.load_portable(device, &payload) {
                Ok(handle) => {
                    debug!("kernel {:016x}: disk cache hit", hash);
                    return Ok(install(key, handle, backend));
                }
                Err(err) => {
                    warn!("kernel {:016x}: stale disk cache record ({err})", hash);
                }
            }
        }
    }

    info!(
        "kernel {:016x}: compiling for {} ({} bytes of IR)",
        hash,
        kind.name(),
        source.len()
    );
    let compiled = backend.compile(device, source)?;
    if let Some(dir) = cache_dir.as_deref() {
        disk_store(dir, kind, &tag, hash, &compiled.portable);
    }
    Ok(install(key, compiled.handle, backend))
}

/// Inserts a freshly loaded kernel, resolving the race where another
/// thread finished compiling the same hash first.
fn install(key: KernelKey, handle: usize, backend: &BackendHandle) -> usize {
    let mut state = state::lock();
    if let Some(existing) = state.kernels.get(&key) {
        let existing = existing.handle;
        drop(state);
        backend.free_kernel(handle);
        return existing;
    }
    state.kernels.insert(key, CachedKernel { handle });
    handle
}

// ---------------------------------------------------------------------
// Disk records
// ---------------------------------------------------------------------
//
// <hex-hash>.<backend>.bin, little-endian header followed by a zlib
// stream:
//
//   magic   [u8; 4]   "KILN"
//   version u32       bumped when the record layout changes
//   hash    u64       content hash, must match the file name
//   raw     u64       uncompressed payload size
//   tag_len u32       length of the backend tag
//   tag     [u8]      SM version (CUDA) / feature set (LLVM)
//   payload [u8]      compressed kernel in its portable form

const CACHE_MAGIC: &[u8; 4] = b"KILN";
const CACHE_VERSION: u32 = 2;

pub(crate) fn cache_file(dir: &Path, kind: BackendKind, hash: u64) -> PathBuf {
    dir.join(format!("{:016x}.{}.bin", hash, kind.name()))
}

pub(crate) fn disk_load(dir: &Path, kind: BackendKind, tag: &str, hash: u64) -> Option<Vec<u8>> {
    let path = cache_file(dir, kind, hash);
    let data = fs::read(&path).ok()?;
    match parse_record(&data, tag, hash) {
        Ok(payload) => payload,
        Err(()) => {
            warn!("kernel cache: discarding malformed record {}", path.display());
            let _ = fs::remove_file(&path);
            None
        }
    }
}

/// `Err` marks a malformed record (to be deleted); `Ok(None)` a valid
/// record compiled for a different device generation / feature set.
fn parse_record(data: &[u8], tag: &str, hash: u64) -> std::result::Result<Option<Vec<u8>>, ()> {
    if data.len() < 28 || &data[0..4] != CACHE_MAGIC {
        return Err(());
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let stored_hash = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let raw_size = u64::from_le_bytes(data[16..24].try_into().unwrap()) as usize;
    let tag_len = u32::from_le_bytes(data[24..28].try_into().unwrap()) as usize;
    if version != CACHE_VERSION || stored_hash != hash || data.len() < 28 + tag_len {
        return Err(());
    }
    if &data[28..28 + tag_len] != tag.as_bytes() {
        return Ok(None);
    }

    let mut payload = Vec::with_capacity(raw_size);
    let mut decoder = ZlibDecoder::new(&data[28 + tag_len..]);
    decoder.read_to_end(&mut payload).map_err(|_| ())?;
    if payload.len() != raw_size {
        return Err(());
    }
    Ok(Some(payload))
}

pub(crate) fn disk_store(dir: &Path, kind: BackendKind, tag: &str, hash: u64, payload: &[u8]) {
    let path = cache_file(dir, kind, hash);
    if path.exists() {
        return;
    }
    let result = (|| -> std::io::Result<()> {
        let mut record = Vec::with_capacity(28 + tag.len() + payload.len() / 2);
        record.extend_from_slice(CACHE_MAGIC);
        record.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        record.extend_from_slice(&hash.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        record.extend_from_slice(&(tag.len() as u32).to_le_bytes());
        record.extend_from_slice(tag.as_bytes());
        let mut encoder = ZlibEncoder::new(&mut record, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?;

        // Write-then-rename so a concurrent process never reads a torn
        // record.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &record)?;
        fs::rename(&tmp, &path)
    })();
    if let Err(err) = result {
        warn!("kernel cache: could not persist {}: {err}", path.display());
    }
}

/// Default disk cache location: `$HOME/.kiln` on Unix, `%TEMP%\kiln` on
/// Windows.
pub(crate) fn default_cache_dir() -> Option<PathBuf> {
    let base = if cfg!(windows) {
        std::env::var_os("TEMP").map(PathBuf::from)?
    } else {
        PathBuf::from(std::env::var_os("HOME")?)
    };
    Some(base.join(if cfg!(windows) { "kiln" } else { ".kiln" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"compiled kernel bytes".to_vec();
        let hash = fnv1a_hash(&payload);
        disk_store(dir.path(), BackendKind::Cuda, "sm_75", hash, &payload);
        let loaded = disk_load(dir.path(), BackendKind::Cuda, "sm_75", hash).unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn tag_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"kernel".to_vec();
        let hash = 0x1234;
        disk_store(dir.path(), BackendKind::Cuda, "sm_75", hash, &payload);
        assert!(disk_load(dir.path(), BackendKind::Cuda, "sm_86", hash).is_none());
    }

    #[test]
    fn truncated_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let hash = 0xfeed;
        let path = cache_file(dir.path(), BackendKind::Llvm, hash);
        fs::write(&path, b"KI").unwrap();
        assert!(disk_load(dir.path(), BackendKind::Llvm, "", hash).is_none());
        assert!(!path.exists());
    }
}
