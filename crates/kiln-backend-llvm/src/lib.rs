//! Host CPU execution backend for the `kiln` tracing JIT.
//!
//! Fused traces are emitted as LLVM IR with a configurable vector width
//! and compiled through a dynamically loaded LLVM (MCJIT); streams map to
//! ordered worker queues so evaluation stays asynchronous like on the
//! GPU, and the collective kernels run as native code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use kiln::alloc::AllocType;
use kiln::backend::{Backend, BackendKind, CompiledKernel, RegClass, ReduceOp};
use kiln::{JitError, Result, VarType};
use log::debug;

mod codegen;
mod collective;
mod engine;
mod pool;

pub use engine::{engine, is_available, LlvmEngine};

use pool::StreamPool;

/// Kernels at or below this element count run on the submitting thread
/// when the stream is idle.
const INLINE_SIZE: u32 = 16384;
/// Kernels at or above this element count are split across worker
/// threads.
const PARALLEL_SIZE: u32 = 1 << 17;

type KernelFn = unsafe extern "C" fn(u32, u32, *const usize);

struct JitKernel {
    module: engine::JitModule,
}

#[derive(Clone)]
struct TargetConfig {
    cpu: String,
    features: String,
    width: u32,
}

impl TargetConfig {
    fn detect() -> Self {
        let (mut cpu, mut features) = (String::from("native"), String::new());
        if let Ok(engine) = engine::engine() {
            if let Some(name) = engine.host_cpu() {
                cpu = name;
            }
            if let Some(feats) = engine.host_features() {
                features = feats;
            }
        }

        #[cfg(target_arch = "x86_64")]
        let width = if std::arch::is_x86_feature_detected!("avx512f") {
            16
        } else if std::arch::is_x86_feature_detected!("avx2") {
            8
        } else {
            4
        };
        #[cfg(not(target_arch = "x86_64"))]
        let width = 4;

        if features.is_empty() {
            #[cfg(target_arch = "x86_64")]
            {
                if std::arch::is_x86_feature_detected!("avx512f") {
                    features = "+avx512f,+avx2,+fma".into();
                } else if std::arch::is_x86_feature_detected!("avx2") {
                    features = "+avx2,+fma".into();
                } else {
                    features = "+sse4.2".into();
                }
            }
            #[cfg(target_arch = "aarch64")]
            {
                features = "+neon".into();
            }
        }

        TargetConfig { cpu, features, width }
    }
}

pub struct LlvmBackend {
    pool: StreamPool,
    target: RwLock<TargetConfig>,
    /// Host allocations served through the backend, with their layouts.
    allocs: Mutex<HashMap<usize, std::alloc::Layout>>,
}

/// Creates the host backend. Construction always succeeds; LLVM itself is
/// loaded lazily at the first kernel compilation, so the collective and
/// memory paths work on machines without `libLLVM`.
pub fn backend() -> Arc<LlvmBackend> {
    Arc::new(LlvmBackend {
        pool: StreamPool::default(),
        target: RwLock::new(TargetConfig::detect()),
        allocs: Mutex::new(HashMap::new()),
    })
}

impl LlvmBackend {
    /// Overrides the target CPU, feature string, and vector width used
    /// for subsequent kernel compilations (the analog of compiling with
    /// `-march`). The width must be a power of two no larger than 16.
    pub fn set_target(&self, cpu: &str, features: Option<&str>, width: u32) -> Result<()> {
        if !width.is_power_of_two() || width > 16 {
            return Err(JitError::Driver(format!(
                "set_target(): invalid vector width {width}"
            )));
        }
        let mut target = self.target.write().expect("llvm target poisoned");
        target.cpu = cpu.to_string();
        if let Some(features) = features {
            target.features = features.to_string();
        }
        target.width = width;
        debug!(
            "set_target(): cpu={}, features={}, width={}",
            target.cpu, target.features, target.width
        );
        Ok(())
    }

    /// Returns true when the configured vector width is at least `width`
    /// and the feature string contains `feature` (e.g. `+avx512f`); used
    /// by hosts to select between intrinsic statement variants.
    pub fn if_at_least(&self, width: u32, feature: &str) -> bool {
        let target = self.target.read().expect("llvm target poisoned");
        target.width >= width && target.features.split(',').any(|f| f.trim() == feature)
    }

    fn config(&self) -> TargetConfig {
        self.target.read().expect("llvm target poisoned").clone()
    }

    fn drain(&self, stream: usize) -> Result<()> {
        self.pool.sync(stream)
    }
}

/// Executes one compiled kernel over `[0, size)`, splitting large ranges
/// across worker threads at vector-width-aligned boundaries.
fn run_kernel(function: KernelFn, size: u32, params: &[usize], width: u32) {
    let threads = pool::worker_count() as u32;
    if size >= PARALLEL_SIZE && threads > 1 {
        let chunk = size.div_ceil(threads).next_multiple_of(width.max(1));
        std::thread::scope(|scope| {
            let mut start = 0u32;
            while start < size {
                let end = (start + chunk).min(size);
                let params = &*params;
                scope.spawn(move || {
                    // SAFETY: The function was produced by the JIT for
                    // exactly this signature; chunk boundaries are
                    // width-aligned so stores never overlap.
                    unsafe { function(start, end, params.as_ptr()) };
                });
                start = end;
            }
        });
    } else {
        // SAFETY: As above, single range.
        unsafe { function(0, size, params.as_ptr()) };
    }
}

impl Backend for LlvmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Llvm
    }

    fn device_count(&self) -> i32 {
        0
    }

    fn cache_tag(&self, _device: i32) -> String {
        let target = self.config();
        format!("{};{};w{}", target.cpu, target.features, target.width)
    }

    fn shutdown(&self, _light: bool) {
        let _ = self.pool.sync_all();
    }

    // ----------------------- code generation -----------------------

    fn register_class(&self, ty: VarType) -> RegClass {
        codegen::register_class(ty)
    }

    fn reserved_registers(&self, _class: RegClass) -> u32 {
        0
    }

    fn type_name(&self, ty: VarType) -> String {
        codegen::type_name(ty, self.vector_width())
    }

    fn binary_type_name(&self, ty: VarType) -> String {
        codegen::binary_type_name(ty, self.vector_width())
    }

    fn vector_width(&self) -> u32 {
        self.target.read().expect("llvm target poisoned").width
    }

    fn stmt_suffix(&self) -> &'static str {
        ""
    }

    fn copy_stmt(&self) -> &'static str {
        "$r0 = select i1 true, $t1 $r1, $t1 $r1"
    }

    fn mask_literal(&self, value: bool) -> &'static str {
        // `zeroinitializer` is valid for scalars and vectors alike, so
        // these statements hold at any vector width.
        if value {
            "$r0 = icmp eq $b0 zeroinitializer, zeroinitializer"
        } else {
            "$r0 = icmp ne $b0 zeroinitializer, zeroinitializer"
        }
    }

    fn is_scatter_stmt(&self, stmt: &str) -> bool {
        stmt.contains("store ") || stmt.contains("atomicrmw")
    }

    fn emit_load(&self, body: &mut String, reg: &str, ty: VarType, param: usize, broadcast: bool) {
        codegen::emit_load(body, reg, ty, param, broadcast, self.vector_width());
    }

    fn emit_load_ptr(&self, body: &mut String, reg: &str, param: usize) {
        codegen::emit_load_ptr(body, reg, param);
    }

    fn emit_store(&self, body: &mut String, reg: &str, ty: VarType, param: usize) {
        codegen::emit_store(body, reg, ty, param, self.vector_width());
    }

    fn assemble(
        &self,
        _device: i32,
        body: &str,
        _n_params: usize,
        _reg_counts: &[(RegClass, u32)],
    ) -> String {
        let target = self.config();
        codegen::assemble(body, target.width, &target.cpu, &target.features)
    }

    // ----------------------- compile & launch -----------------------

    fn compile(&self, _device: i32, source: &str) -> Result<CompiledKernel> {
        let module = engine::engine()?.compile(source, codegen::ENTRY_NAME)?;
        let handle = Box::into_raw(Box::new(JitKernel { module })) as usize;
        Ok(CompiledKernel {
            handle,
            portable: source.as_bytes().to_vec(),
        })
    }

    fn load_portable(&self, _device: i32, payload: &[u8]) -> Result<usize> {
        let source = std::str::from_utf8(payload)
            .map_err(|_| JitError::Driver("cached kernel record is not IR text".into()))?;
        let module = engine::engine()?.compile(source, codegen::ENTRY_NAME)?;
        Ok(Box::into_raw(Box::new(JitKernel { module })) as usize)
    }

    fn free_kernel(&self, handle: usize) {
        // SAFETY: The handle was produced by `compile`/`load_portable`.
        let kernel = unsafe { Box::from_raw(handle as *mut JitKernel) };
        if let Ok(engine) = engine::engine() {
            engine.dispose(&kernel.module);
        }
    }

    fn launch(&self, kernel: usize, stream: usize, size: u32, params: &[usize]) -> Result<()> {
        // SAFETY: The handle was produced by `compile`/`load_portable`
        // and kernels are only freed at shutdown, after stream syncs.
        let entry = unsafe { (*(kernel as *const JitKernel)).module.entry };
        let function: KernelFn = unsafe { std::mem::transmute(entry) };
        let width = self.vector_width();
        let params: Arc<Vec<usize>> = Arc::new(params.to_vec());

        if size <= INLINE_SIZE && self.pool.idle(stream)? {
            run_kernel(function, size, params.as_slice(), width);
            return Ok(());
        }

        self.pool.submit(
            stream,
            Box::new(move || run_kernel(function, size, params.as_slice(), width)),
        )?;
        Ok(())
    }

    // ----------------------- streams & events -----------------------

    fn stream_create(&self, _device: i32) -> Result<usize> {
        Ok(self.pool.create())
    }

    fn stream_destroy(&self, stream: usize) {
        self.pool.destroy(stream);
    }

    fn stream_sync(&self, stream: usize) -> Result<()> {
        self.pool.sync(stream)
    }

    fn device_sync(&self, _device: i32) -> Result<()> {
        self.pool.sync_all()
    }

    fn event_create(&self, _device: i32) -> Result<usize> {
        Ok(Box::into_raw(Box::new((0usize, 0u64))) as usize)
    }

    fn event_destroy(&self, event: usize) {
        // SAFETY: The handle was produced by `event_create`.
        drop(unsafe { Box::from_raw(event as *mut (usize, u64)) });
    }

    fn event_record(&self, event: usize, stream: usize) -> Result<()> {
        let ticket = self.pool.ticket(stream)?;
        // SAFETY: The handle was produced by `event_create` and is only
        // touched from under the caller's lock discipline.
        unsafe { *(event as *mut (usize, u64)) = (stream, ticket) };
        Ok(())
    }

    fn event_query(&self, event: usize) -> Result<bool> {
        // SAFETY: As above.
        let (stream, ticket) = unsafe { *(event as *const (usize, u64)) };
        if stream == 0 {
            return Ok(true);
        }
        self.pool.reached(stream, ticket)
    }

    fn stream_wait_event(&self, _stream: usize, event: usize) -> Result<()> {
        // SAFETY: As above.
        let (stream, ticket) = unsafe { *(event as *const (usize, u64)) };
        if stream == 0 {
            return Ok(());
        }
        self.pool.wait(stream, ticket)
    }

    // ----------------------- memory -----------------------

    fn mem_alloc(&self, ty: AllocType, bytes: usize, _device: i32) -> Result<usize> {
        let layout = std::alloc::Layout::from_size_align(bytes.max(1), 64)
            .map_err(|_| JitError::Driver("invalid allocation layout".into()))?;
        // SAFETY: The layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(JitError::OutOfMemory { ty, bytes });
        }
        self.allocs
            .lock()
            .expect("llvm alloc map poisoned")
            .insert(ptr as usize, layout);
        Ok(ptr as usize)
    }

    fn mem_free(&self, _ty: AllocType, ptr: usize, _device: i32) {
        if let Some(layout) = self
            .allocs
            .lock()
            .expect("llvm alloc map poisoned")
            .remove(&ptr)
        {
            // SAFETY: The pointer was allocated with this layout.
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }

    fn memcpy(&self, dst: usize, src: usize, bytes: usize) -> Result<()> {
        // SAFETY: Caller guarantees both regions are valid for `bytes`.
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        Ok(())
    }

    fn memcpy_async(&self, dst: usize, src: usize, bytes: usize, stream: usize) -> Result<()> {
        self.pool.submit(
            stream,
            Box::new(move || {
                // SAFETY: The release chain keeps both regions alive until
                // the stream reaches this job.
                unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
            }),
        )?;
        Ok(())
    }

    fn memset_async(&self, ptr: usize, value: u8, bytes: usize, stream: usize) -> Result<()> {
        self.pool.submit(
            stream,
            Box::new(move || {
                // SAFETY: As above.
                unsafe { std::ptr::write_bytes(ptr as *mut u8, value, bytes) };
            }),
        )?;
        Ok(())
    }

    fn mem_prefetch(&self, _ptr: usize, _bytes: usize, _device: i32, _stream: usize) -> Result<()> {
        Ok(())
    }

    fn peer_copy(
        &self,
        dst: usize,
        _dst_device: i32,
        src: usize,
        _src_device: i32,
        bytes: usize,
        stream: usize,
    ) -> Result<()> {
        self.memcpy_async(dst, src, bytes, stream)
    }

    // ----------------------- collectives -----------------------

    fn fill(&self, stream: usize, ty: VarType, ptr: usize, size: u32, value: &[u8]) -> Result<()> {
        self.drain(stream)?;
        collective::fill(ty, ptr, size, value);
        Ok(())
    }

    fn reduce(
        &self,
        stream: usize,
        ty: VarType,
        op: ReduceOp,
        ptr: usize,
        size: u32,
        out: usize,
    ) -> Result<()> {
        self.drain(stream)?;
        collective::reduce(ty, op, ptr, size, out)
    }

    fn scan_u32(&self, stream: usize, input: usize, output: usize, size: u32) -> Result<()> {
        self.drain(stream)?;
        collective::scan_u32(input, output, size);
        Ok(())
    }

    fn all(&self, stream: usize, values: usize, size: u32) -> Result<bool> {
        self.drain(stream)?;
        Ok(collective::all(values, size))
    }

    fn any(&self, stream: usize, values: usize, size: u32) -> Result<bool> {
        self.drain(stream)?;
        Ok(collective::any(values, size))
    }

    fn mkperm(
        &self,
        stream: usize,
        values: usize,
        size: u32,
        bucket_count: u32,
        perm: usize,
        offsets: usize,
    ) -> Result<u32> {
        self.drain(stream)?;
        Ok(collective::mkperm(values, size, bucket_count, perm, offsets))
    }
}
