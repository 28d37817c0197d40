//! CUDA execution backend for the `kiln` tracing JIT.
//!
//! Fused traces are emitted as PTX and compiled through the driver's JIT
//! (`cuModuleLoadDataEx`); the driver library itself is discovered and
//! loaded at runtime, so the crate builds and links on machines without
//! CUDA installed. Streams, events, and the allocator primitives map
//! directly onto their driver counterparts.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use kiln::alloc::AllocType;
use kiln::backend::{Backend, BackendKind, CompiledKernel, RegClass, ReduceOp};
use kiln::{JitError, Result, VarType};

mod codegen;
mod collective;
mod driver;

pub use driver::{driver, is_available, CudaDriver, DeviceInfo};

/// One compiled trace kernel: the module it lives in and its entry point.
struct KernelHandles {
    module: usize,
    function: usize,
}

pub struct CudaBackend {
    driver: Arc<CudaDriver>,
    /// Driver stream handle -> device, maintained so launches can make
    /// the right context current.
    streams: Mutex<HashMap<usize, i32>>,
    /// (kernel name, device) -> function handle for the fixed collective
    /// kernels.
    collectives: Mutex<HashMap<(String, i32), usize>>,
    collective_modules: Mutex<Vec<usize>>,
}

/// Creates (or returns) the CUDA backend. Fails when no driver library or
/// no usable device is present.
///
/// Note that after a full [`kiln::shutdown`] the driver's device contexts
/// have been released; creating a fresh backend requires a new process.
pub fn backend() -> Result<Arc<CudaBackend>> {
    let driver = driver()?;
    if driver.devices().is_empty() {
        return Err(JitError::Driver("no usable CUDA device".into()));
    }
    Ok(Arc::new(CudaBackend {
        driver,
        streams: Mutex::new(HashMap::new()),
        collectives: Mutex::new(HashMap::new()),
        collective_modules: Mutex::new(Vec::new()),
    }))
}

const LAUNCH_BLOCK: u32 = 256;

impl CudaBackend {
    fn compute_capability(&self, device: i32) -> u32 {
        self.driver
            .devices()
            .get(device as usize)
            .map(|info| info.compute_capability)
            .unwrap_or(75)
    }

    fn device_of(&self, stream: usize) -> Result<i32> {
        self.streams
            .lock()
            .expect("cuda stream map poisoned")
            .get(&stream)
            .copied()
            .ok_or_else(|| JitError::Driver("launch on an unknown stream".into()))
    }

    pub(crate) fn grid_size(&self, device: i32, size: u32, block: u32) -> u32 {
        let num_sm = self
            .driver
            .devices()
            .get(device as usize)
            .map(|info| info.num_sm)
            .unwrap_or(1)
            .max(1);
        size.div_ceil(block).clamp(1, 4 * num_sm)
    }
}

impl Backend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn device_count(&self) -> i32 {
        self.driver.devices().len() as i32
    }

    fn cache_tag(&self, device: i32) -> String {
        format!("sm_{}", self.compute_capability(device))
    }

    fn shutdown(&self, light: bool) {
        let modules: Vec<usize> = self
            .collective_modules
            .lock()
            .expect("cuda collective cache poisoned")
            .drain(..)
            .collect();
        self.collectives
            .lock()
            .expect("cuda collective cache poisoned")
            .clear();
        for module in modules {
            self.driver.module_unload(module);
        }
        if !light {
            self.driver.release_contexts();
        }
    }

    // ----------------------- code generation -----------------------

    fn register_class(&self, ty: VarType) -> RegClass {
        codegen::register_class(ty)
    }

    fn reserved_registers(&self, class: RegClass) -> u32 {
        codegen::reserved_registers(class)
    }

    fn type_name(&self, ty: VarType) -> String {
        codegen::type_name(ty).to_string()
    }

    fn binary_type_name(&self, ty: VarType) -> String {
        codegen::binary_type_name(ty).to_string()
    }

    fn vector_width(&self) -> u32 {
        1
    }

    fn stmt_suffix(&self) -> &'static str {
        ";"
    }

    fn copy_stmt(&self) -> &'static str {
        "mov.$t0 $r0, $r1"
    }

    fn mask_literal(&self, value: bool) -> &'static str {
        if value {
            "mov.$t0 $r0, 1"
        } else {
            "mov.$t0 $r0, 0"
        }
    }

    fn is_scatter_stmt(&self, stmt: &str) -> bool {
        stmt.contains("st.global") || stmt.contains("atom.global.add")
    }

    fn emit_load(&self, body: &mut String, reg: &str, ty: VarType, param: usize, broadcast: bool) {
        codegen::emit_load(body, reg, ty, param, broadcast);
    }

    fn emit_load_ptr(&self, body: &mut String, reg: &str, param: usize) {
        codegen::emit_load_ptr(body, reg, param);
    }

    fn emit_store(&self, body: &mut String, reg: &str, ty: VarType, param: usize) {
        codegen::emit_store(body, reg, ty, param);
    }

    fn assemble(
        &self,
        device: i32,
        body: &str,
        n_params: usize,
        reg_counts: &[(RegClass, u32)],
    ) -> String {
        codegen::assemble(self.compute_capability(device), body, n_params, reg_counts)
    }

    // ----------------------- compile & launch -----------------------

    fn compile(&self, device: i32, source: &str) -> Result<CompiledKernel> {
        let (module, function) = self.driver.load_ptx(device, source, codegen::ENTRY_NAME)?;
        let handle = Box::into_raw(Box::new(KernelHandles { module, function })) as usize;
        Ok(CompiledKernel {
            handle,
            portable: source.as_bytes().to_vec(),
        })
    }

    fn load_portable(&self, device: i32, payload: &[u8]) -> Result<usize> {
        let source = std::str::from_utf8(payload)
            .map_err(|_| JitError::Driver("cached kernel record is not PTX text".into()))?;
        let (module, function) = self.driver.load_ptx(device, source, codegen::ENTRY_NAME)?;
        Ok(Box::into_raw(Box::new(KernelHandles { module, function })) as usize)
    }

    fn free_kernel(&self, handle: usize) {
        // SAFETY: The handle was produced by `compile`/`load_portable`.
        let handles = unsafe { Box::from_raw(handle as *mut KernelHandles) };
        self.driver.module_unload(handles.module);
    }

    fn launch(&self, kernel: usize, stream: usize, size: u32, params: &[usize]) -> Result<()> {
        let device = self.device_of(stream)?;
        self.driver.make_current(device)?;
        // SAFETY: The handle was produced by `compile`/`load_portable`
        // and outlives the launch (kernels are only freed at shutdown).
        let handles = unsafe { &*(kernel as *const KernelHandles) };

        let mut size_arg = size;
        let mut param_block: Vec<u64> = params.iter().map(|&p| p as u64).collect();
        if param_block.is_empty() {
            param_block.push(0);
        }
        let mut launch_params = [
            &mut size_arg as *mut u32 as *mut c_void,
            param_block.as_mut_ptr() as *mut c_void,
        ];
        let grid = self.grid_size(device, size, LAUNCH_BLOCK);
        self.driver
            .launch(handles.function, grid, LAUNCH_BLOCK, 0, stream, &mut launch_params)
    }

    // ----------------------- streams & events -----------------------

    fn stream_create(&self, device: i32) -> Result<usize> {
        let handle = self.driver.stream_create(device)?;
        self.streams
            .lock()
            .expect("cuda stream map poisoned")
            .insert(handle, device);
        Ok(handle)
    }

    fn stream_destroy(&self, stream: usize) {
        self.streams
            .lock()
            .expect("cuda stream map poisoned")
            .remove(&stream);
        self.driver.stream_destroy(stream);
    }

    fn stream_sync(&self, stream: usize) -> Result<()> {
        self.driver.stream_sync(stream)
    }

    fn device_sync(&self, device: i32) -> Result<()> {
        self.driver.ctx_sync(device)
    }

    fn event_create(&self, device: i32) -> Result<usize> {
        self.driver.event_create(device)
    }

    fn event_destroy(&self, event: usize) {
        self.driver.event_destroy(event);
    }

    fn event_record(&self, event: usize, stream: usize) -> Result<()> {
        self.driver.event_record(event, stream)
    }

    fn event_query(&self, event: usize) -> Result<bool> {
        self.driver.event_query(event)
    }

    fn stream_wait_event(&self, stream: usize, event: usize) -> Result<()> {
        self.driver.stream_wait_event(stream, event)
    }

    // ----------------------- memory -----------------------

    fn mem_alloc(&self, ty: AllocType, bytes: usize, device: i32) -> Result<usize> {
        match ty {
            AllocType::Device => self.driver.mem_alloc_device(bytes, device),
            AllocType::HostPinned => self.driver.mem_alloc_host(bytes),
            AllocType::Managed => self.driver.mem_alloc_managed(bytes, device, false),
            AllocType::ManagedReadMostly => self.driver.mem_alloc_managed(bytes, device, true),
            AllocType::Host => Err(JitError::Driver(
                "host allocations are not served by the CUDA backend".into(),
            )),
        }
    }

    fn mem_free(&self, ty: AllocType, ptr: usize, _device: i32) {
        match ty {
            AllocType::HostPinned => self.driver.mem_free_host(ptr),
            AllocType::Host => {}
            _ => self.driver.mem_free_device(ptr),
        }
    }

    fn memcpy(&self, dst: usize, src: usize, bytes: usize) -> Result<()> {
        self.driver.memcpy(dst, src, bytes)
    }

    fn memcpy_async(&self, dst: usize, src: usize, bytes: usize, stream: usize) -> Result<()> {
        self.driver.memcpy_async(dst, src, bytes, stream)
    }

    fn memset_async(&self, ptr: usize, value: u8, bytes: usize, stream: usize) -> Result<()> {
        self.driver.memset_d8_async(ptr, value, bytes, stream)
    }

    fn mem_prefetch(&self, ptr: usize, bytes: usize, device: i32, stream: usize) -> Result<()> {
        let target = if device < 0 { driver::CU_DEVICE_CPU } else { device };
        self.driver.mem_prefetch_async(ptr, bytes, target, stream)
    }

    fn peer_copy(
        &self,
        dst: usize,
        dst_device: i32,
        src: usize,
        src_device: i32,
        bytes: usize,
        stream: usize,
    ) -> Result<()> {
        let dst_ctx = self.driver.context(dst_device)?;
        let src_ctx = self.driver.context(src_device)?;
        self.driver
            .memcpy_peer_async(dst, dst_ctx, src, src_ctx, bytes, stream)
    }

    // ----------------------- collectives -----------------------

    fn fill(&self, stream: usize, ty: VarType, ptr: usize, size: u32, value: &[u8]) -> Result<()> {
        let device = self.device_of(stream)?;
        self.fill_impl(device, stream, ty, ptr, size, value)
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
        collective::validate_reduce(ty, op)?;
        let device = self.device_of(stream)?;
        self.reduce_impl(device, stream, ty, op, ptr, size, out)
    }

    fn scan_u32(&self, stream: usize, input: usize, output: usize, size: u32) -> Result<()> {
        let device = self.device_of(stream)?;
        self.scan_impl(device, stream, input, output, size)
    }

    fn all(&self, stream: usize, values: usize, size: u32) -> Result<bool> {
        let device = self.device_of(stream)?;
        self.all_any_impl(device, stream, values, size, true)
    }

    fn any(&self, stream: usize, values: usize, size: u32) -> Result<bool> {
        let device = self.device_of(stream)?;
        self.all_any_impl(device, stream, values, size, false)
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
        let device = self.device_of(stream)?;
        self.mkperm_impl(device, stream, values, size, bucket_count, perm, offsets)
    }
}
