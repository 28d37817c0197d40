//! Shared test harness: a mock backend that records compilations and
//! launches instead of driving real hardware, plus a serialized session
//! wrapper around the process-wide JIT state.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use kiln::alloc::AllocType;
use kiln::backend::{Backend, BackendKind, CompiledKernel, RegClass, ReduceOp};
use kiln::{Result, VarType};

pub struct Launch {
    pub size: u32,
    pub params: Vec<usize>,
}

#[derive(Default)]
pub struct MockStats {
    pub compiles: AtomicUsize,
    pub disk_loads: AtomicUsize,
    pub launches: Mutex<Vec<Launch>>,
    pub sources: Mutex<Vec<String>>,
}

impl MockStats {
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn disk_load_count(&self) -> usize {
        self.disk_loads.load(Ordering::SeqCst)
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn last_source(&self) -> String {
        self.sources.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

pub struct MockBackend {
    pub stats: Arc<MockStats>,
    buffers: Mutex<HashMap<usize, Vec<u8>>>,
    handles: AtomicUsize,
}

impl MockBackend {
    pub fn with_stats(stats: Arc<MockStats>) -> Arc<Self> {
        Arc::new(MockBackend {
            stats,
            buffers: Mutex::new(HashMap::new()),
            handles: AtomicUsize::new(1),
        })
    }

    fn next_handle(&self) -> usize {
        self.handles.fetch_add(1, Ordering::SeqCst)
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        // Registered as the host backend so tests reach it via
        // device_set(-1, ..).
        BackendKind::Llvm
    }

    fn device_count(&self) -> i32 {
        0
    }

    fn cache_tag(&self, _device: i32) -> String {
        "mock".into()
    }

    fn register_class(&self, ty: VarType) -> RegClass {
        let prefix = match ty {
            VarType::Bool => "%p",
            VarType::I8 | VarType::U8 | VarType::I16 | VarType::U16 => "%w",
            VarType::F16 => "%h",
            VarType::I32 | VarType::U32 => "%r",
            VarType::F32 => "%f",
            VarType::I64 | VarType::U64 | VarType::Ptr => "%rd",
            VarType::F64 => "%d",
            VarType::Invalid => panic!("invalid type"),
        };
        RegClass { prefix, decl: "" }
    }

    fn reserved_registers(&self, _class: RegClass) -> u32 {
        0
    }

    fn type_name(&self, ty: VarType) -> String {
        ty.name().to_string()
    }

    fn binary_type_name(&self, ty: VarType) -> String {
        format!("b{}", ty.size() * 8)
    }

    fn vector_width(&self) -> u32 {
        1
    }

    fn stmt_suffix(&self) -> &'static str {
        ";"
    }

    fn copy_stmt(&self) -> &'static str {
        "$r0 = copy($r1)"
    }

    fn mask_literal(&self, value: bool) -> &'static str {
        if value {
            "$r0 = mask_all_ones()"
        } else {
            "$r0 = mask_all_zeros()"
        }
    }

    fn is_scatter_stmt(&self, stmt: &str) -> bool {
        stmt.contains("scatter")
    }

    fn emit_load(&self, body: &mut String, reg: &str, ty: VarType, param: usize, broadcast: bool) {
        let suffix = if broadcast { ", bcast" } else { "" };
        body.push_str(&format!("    {reg} = load.{}(p{param}{suffix});\n", ty.name()));
    }

    fn emit_load_ptr(&self, body: &mut String, reg: &str, param: usize) {
        body.push_str(&format!("    {reg} = ptr(p{param});\n"));
    }

    fn emit_store(&self, body: &mut String, reg: &str, ty: VarType, param: usize) {
        body.push_str(&format!("    store.{}(p{param}, {reg});\n", ty.name()));
    }

    fn assemble(
        &self,
        _device: i32,
        body: &str,
        n_params: usize,
        _reg_counts: &[(RegClass, u32)],
    ) -> String {
        format!("mock_kernel(params: {n_params})\n{body}end\n")
    }

    fn compile(&self, _device: i32, source: &str) -> Result<CompiledKernel> {
        self.stats.compiles.fetch_add(1, Ordering::SeqCst);
        self.stats.sources.lock().unwrap().push(source.to_string());
        Ok(CompiledKernel {
            handle: self.next_handle(),
            portable: source.as_bytes().to_vec(),
        })
    }

    fn load_portable(&self, _device: i32, payload: &[u8]) -> Result<usize> {
        self.stats.disk_loads.fetch_add(1, Ordering::SeqCst);
        self.stats
            .sources
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(self.next_handle())
    }

    fn free_kernel(&self, _handle: usize) {}

    fn launch(&self, _kernel: usize, _stream: usize, size: u32, params: &[usize]) -> Result<()> {
        self.stats.launches.lock().unwrap().push(Launch {
            size,
            params: params.to_vec(),
        });
        Ok(())
    }

    fn stream_create(&self, _device: i32) -> Result<usize> {
        Ok(self.next_handle())
    }

    fn stream_destroy(&self, _stream: usize) {}

    fn stream_sync(&self, _stream: usize) -> Result<()> {
        Ok(())
    }

    fn device_sync(&self, _device: i32) -> Result<()> {
        Ok(())
    }

    fn event_create(&self, _device: i32) -> Result<usize> {
        Ok(self.next_handle())
    }

    fn event_destroy(&self, _event: usize) {}

    fn event_record(&self, _event: usize, _stream: usize) -> Result<()> {
        Ok(())
    }

    fn event_query(&self, _event: usize) -> Result<bool> {
        // Mock work completes instantly.
        Ok(true)
    }

    fn stream_wait_event(&self, _stream: usize, _event: usize) -> Result<()> {
        Ok(())
    }

    fn mem_alloc(&self, _ty: AllocType, bytes: usize, _device: i32) -> Result<usize> {
        let buffer = vec![0u8; bytes.max(1)];
        let addr = buffer.as_ptr() as usize;
        self.buffers.lock().unwrap().insert(addr, buffer);
        Ok(addr)
    }

    fn mem_free(&self, _ty: AllocType, ptr: usize, _device: i32) {
        self.buffers.lock().unwrap().remove(&ptr);
    }

    fn memcpy(&self, dst: usize, src: usize, bytes: usize) -> Result<()> {
        // SAFETY: Test buffers are live for the duration of the call.
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        Ok(())
    }

    fn memcpy_async(&self, dst: usize, src: usize, bytes: usize, _stream: usize) -> Result<()> {
        self.memcpy(dst, src, bytes)
    }

    fn memset_async(&self, ptr: usize, value: u8, bytes: usize, _stream: usize) -> Result<()> {
        // SAFETY: As above.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, value, bytes) };
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
        _stream: usize,
    ) -> Result<()> {
        self.memcpy(dst, src, bytes)
    }

    fn fill(&self, _stream: usize, ty: VarType, ptr: usize, size: u32, value: &[u8]) -> Result<()> {
        let width = ty.size();
        for i in 0..size as usize {
            // SAFETY: Test buffers are live and large enough.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    value.as_ptr(),
                    (ptr as *mut u8).add(i * width),
                    width,
                );
            }
        }
        Ok(())
    }

    fn reduce(
        &self,
        _stream: usize,
        _ty: VarType,
        _op: ReduceOp,
        _ptr: usize,
        _size: u32,
        _out: usize,
    ) -> Result<()> {
        unimplemented!("collectives are exercised through the backend crates")
    }

    fn scan_u32(&self, _stream: usize, _input: usize, _output: usize, _size: u32) -> Result<()> {
        unimplemented!("collectives are exercised through the backend crates")
    }

    fn all(&self, _stream: usize, _values: usize, _size: u32) -> Result<bool> {
        unimplemented!("collectives are exercised through the backend crates")
    }

    fn any(&self, _stream: usize, _values: usize, _size: u32) -> Result<bool> {
        unimplemented!("collectives are exercised through the backend crates")
    }

    fn mkperm(
        &self,
        _stream: usize,
        _values: usize,
        _size: u32,
        _bucket_count: u32,
        _perm: usize,
        _offsets: usize,
    ) -> Result<u32> {
        unimplemented!("collectives are exercised through the backend crates")
    }
}

static SESSION: OnceLock<Mutex<()>> = OnceLock::new();

/// Runs `f` against a freshly initialized JIT with a mock backend and the
/// host stream (-1, 0) active, serializing access to the process-wide
/// state across tests.
pub fn with_session<F: FnOnce(&Arc<MockStats>)>(f: F) {
    let guard = SESSION.get_or_init(|| Mutex::new(())).lock();
    let _guard = match guard {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let stats = Arc::new(MockStats::default());
    let backend = MockBackend::with_stats(Arc::clone(&stats));
    kiln::init(vec![backend as kiln::backend::BackendHandle]).unwrap();
    kiln::device_set(-1, 0).unwrap();
    f(&stats);
    kiln::shutdown(true);
}
