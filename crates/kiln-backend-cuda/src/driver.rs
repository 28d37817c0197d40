//! Dynamically loaded CUDA driver interface.
//!
//! The driver library is resolved at runtime with `libloading`; nothing
//! links against CUDA at build time. The `KILN_LIBCUDA_PATH` environment
//! variable overrides the default search list. All handles are stored as
//! `usize` so they can live inside `Send + Sync` state.

use std::ffi::{c_void, CString};
use std::sync::{Arc, OnceLock};

use kiln::{JitError, Result};
use libloading::Library;
use log::{debug, warn};

pub(crate) type CUresult = i32;
pub(crate) type CUdevice = i32;
pub(crate) type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
pub(crate) type CUmodule = *mut c_void;
pub(crate) type CUfunction = *mut c_void;
pub(crate) type CUstream = *mut c_void;
pub(crate) type CUevent = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const CUDA_ERROR_NOT_READY: CUresult = 600;

const CU_STREAM_NON_BLOCKING: u32 = 1;
const CU_EVENT_DISABLE_TIMING: u32 = 2;
const CU_MEM_ATTACH_GLOBAL: u32 = 1;
const CU_MEM_ADVISE_SET_READ_MOSTLY: u32 = 1;
pub(crate) const CU_DEVICE_CPU: CUdevice = -1;

const CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT: i32 = 16;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;
const CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING: i32 = 41;

const CU_JIT_INFO_LOG_BUFFER: u32 = 3;
const CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES: u32 = 4;
const CU_JIT_ERROR_LOG_BUFFER: u32 = 5;
const CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES: u32 = 6;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, device: CUdevice) -> CUresult;
type CuDevicePrimaryCtxRetainFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, device: CUdevice) -> CUresult;
type CuDevicePrimaryCtxReleaseFn = unsafe extern "C" fn(device: CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuCtxEnablePeerAccessFn = unsafe extern "C" fn(ctx: CUcontext, flags: u32) -> CUresult;
type CuDeviceCanAccessPeerFn =
    unsafe extern "C" fn(ok: *mut i32, device: CUdevice, peer: CUdevice) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamWaitEventFn =
    unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: u32) -> CUresult;
type CuEventCreateFn = unsafe extern "C" fn(event: *mut CUevent, flags: u32) -> CUresult;
type CuEventDestroyFn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type CuEventQueryFn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytes: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemAllocHostFn = unsafe extern "C" fn(ptr: *mut *mut c_void, bytes: usize) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(ptr: *mut c_void) -> CUresult;
type CuMemAllocManagedFn =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytes: usize, flags: u32) -> CUresult;
type CuMemAdviseFn = unsafe extern "C" fn(
    dptr: CUdeviceptr,
    bytes: usize,
    advice: u32,
    device: CUdevice,
) -> CUresult;
type CuMemPrefetchAsyncFn = unsafe extern "C" fn(
    dptr: CUdeviceptr,
    bytes: usize,
    device: CUdevice,
    stream: CUstream,
) -> CUresult;
type CuMemcpyFn = unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, bytes: usize) -> CUresult;
type CuMemcpyAsyncFn = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    bytes: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyPeerAsyncFn = unsafe extern "C" fn(
    dst: CUdeviceptr,
    dst_ctx: CUcontext,
    src: CUdeviceptr,
    src_ctx: CUcontext,
    bytes: usize,
    stream: CUstream,
) -> CUresult;
type CuMemsetD8AsyncFn = unsafe extern "C" fn(
    dptr: CUdeviceptr,
    value: u8,
    count: usize,
    stream: CUstream,
) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const i8) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_x: u32,
    grid_y: u32,
    grid_z: u32,
    block_x: u32,
    block_y: u32,
    block_z: u32,
    shared_mem_bytes: u32,
    stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    cu_device_primary_ctx_release: CuDevicePrimaryCtxReleaseFn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_synchronize: CuCtxSynchronizeFn,
    cu_ctx_enable_peer_access: CuCtxEnablePeerAccessFn,
    cu_device_can_access_peer: CuDeviceCanAccessPeerFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy: CuStreamDestroyFn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_stream_wait_event: CuStreamWaitEventFn,
    cu_event_create: CuEventCreateFn,
    cu_event_destroy: CuEventDestroyFn,
    cu_event_record: CuEventRecordFn,
    cu_event_query: CuEventQueryFn,
    cu_mem_alloc: CuMemAllocFn,
    cu_mem_free: CuMemFreeFn,
    cu_mem_alloc_host: CuMemAllocHostFn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_mem_alloc_managed: CuMemAllocManagedFn,
    cu_mem_advise: CuMemAdviseFn,
    cu_mem_prefetch_async: CuMemPrefetchAsyncFn,
    cu_memcpy: CuMemcpyFn,
    cu_memcpy_async: CuMemcpyAsyncFn,
    cu_memcpy_peer_async: CuMemcpyPeerAsyncFn,
    cu_memset_d8_async: CuMemsetD8AsyncFn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// Per-device properties collected at initialization.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: i32,
    pub compute_capability: u32,
    pub num_sm: u32,
    /// Primary context, stored as an integer for `Send`/`Sync`.
    pub(crate) context: usize,
}

pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    devices: Vec<DeviceInfo>,
}

// SAFETY: The driver API is thread-safe; raw handles are plain values.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

static CUDA_DRIVER: OnceLock<std::result::Result<Arc<CudaDriver>, String>> = OnceLock::new();

/// Returns the process-wide driver instance, loading and initializing it
/// on first use.
pub fn driver() -> Result<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(JitError::Driver(format!("CUDA driver unavailable: {msg}"))),
    }
}

pub fn is_available() -> bool {
    driver().is_ok()
}

impl CudaDriver {
    fn new() -> Result<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_device_primary_ctx_retain: load_symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
            cu_device_primary_ctx_release: load_symbol(&lib, b"cuDevicePrimaryCtxRelease\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            cu_ctx_enable_peer_access: load_symbol(&lib, b"cuCtxEnablePeerAccess\0")?,
            cu_device_can_access_peer: load_symbol(&lib, b"cuDeviceCanAccessPeer\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_stream_wait_event: load_symbol(&lib, b"cuStreamWaitEvent\0")?,
            cu_event_create: load_symbol(&lib, b"cuEventCreate\0")?,
            cu_event_destroy: load_symbol(&lib, b"cuEventDestroy_v2\0")?,
            cu_event_record: load_symbol(&lib, b"cuEventRecord\0")?,
            cu_event_query: load_symbol(&lib, b"cuEventQuery\0")?,
            cu_mem_alloc: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_mem_alloc_host: load_symbol(&lib, b"cuMemAllocHost_v2\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_mem_alloc_managed: load_symbol(&lib, b"cuMemAllocManaged\0")?,
            cu_mem_advise: load_symbol(&lib, b"cuMemAdvise\0")?,
            cu_mem_prefetch_async: load_symbol(&lib, b"cuMemPrefetchAsync\0")?,
            cu_memcpy: load_symbol(&lib, b"cuMemcpy\0")?,
            cu_memcpy_async: load_symbol(&lib, b"cuMemcpyAsync\0")?,
            cu_memcpy_peer_async: load_symbol(&lib, b"cuMemcpyPeerAsync\0")?,
            cu_memset_d8_async: load_symbol(&lib, b"cuMemsetD8Async\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        // SAFETY: All calls follow the driver API contract with valid out
        // pointers.
        let devices = unsafe {
            check((fns.cu_init)(0), "cuInit")?;
            let mut count = 0i32;
            check((fns.cu_device_get_count)(&mut count), "cuDeviceGetCount")?;

            let mut devices = Vec::new();
            for ordinal in 0..count {
                let mut dev: CUdevice = 0;
                check((fns.cu_device_get)(&mut dev, ordinal), "cuDeviceGet")?;

                let mut unified = 0i32;
                check(
                    (fns.cu_device_get_attribute)(
                        &mut unified,
                        CU_DEVICE_ATTRIBUTE_UNIFIED_ADDRESSING,
                        dev,
                    ),
                    "cuDeviceGetAttribute",
                )?;
                if unified == 0 {
                    warn!("device {ordinal} does not support unified addressing, skipping ..");
                    continue;
                }

                let mut cc_major = 0i32;
                let mut cc_minor = 0i32;
                let mut num_sm = 0i32;
                check(
                    (fns.cu_device_get_attribute)(
                        &mut cc_major,
                        CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                        dev,
                    ),
                    "cuDeviceGetAttribute",
                )?;
                check(
                    (fns.cu_device_get_attribute)(
                        &mut cc_minor,
                        CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                        dev,
                    ),
                    "cuDeviceGetAttribute",
                )?;
                check(
                    (fns.cu_device_get_attribute)(
                        &mut num_sm,
                        CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
                        dev,
                    ),
                    "cuDeviceGetAttribute",
                )?;

                let mut ctx: CUcontext = std::ptr::null_mut();
                check(
                    (fns.cu_device_primary_ctx_retain)(&mut ctx, dev),
                    "cuDevicePrimaryCtxRetain",
                )?;
                debug!(
                    "found CUDA device {ordinal}: compute capability {}.{}, {} SMs",
                    cc_major, cc_minor, num_sm
                );
                devices.push(DeviceInfo {
                    id: dev,
                    compute_capability: (cc_major * 10 + cc_minor) as u32,
                    num_sm: num_sm as u32,
                    context: ctx as usize,
                });
            }

            // Enable peer access between all device pairs that support it.
            for a in &devices {
                for b in &devices {
                    if a.id == b.id {
                        continue;
                    }
                    let mut ok = 0i32;
                    check(
                        (fns.cu_device_can_access_peer)(&mut ok, a.id, b.id),
                        "cuDeviceCanAccessPeer",
                    )?;
                    if ok != 0 {
                        check((fns.cu_ctx_set_current)(a.context as CUcontext), "cuCtxSetCurrent")?;
                        // Already-enabled is not an error worth surfacing.
                        let _ = (fns.cu_ctx_enable_peer_access)(b.context as CUcontext, 0);
                    }
                }
            }

            devices
        };

        Ok(Self {
            _lib: lib,
            fns,
            devices,
        })
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn device(&self, device: i32) -> Result<&DeviceInfo> {
        self.devices
            .get(device as usize)
            .ok_or_else(|| JitError::Driver(format!("invalid device id {device}")))
    }

    pub(crate) fn make_current(&self, device: i32) -> Result<()> {
        let ctx = self.device(device)?.context;
        // SAFETY: The context was retained at initialization.
        unsafe { check((self.fns.cu_ctx_set_current)(ctx as CUcontext), "cuCtxSetCurrent") }
    }

    pub(crate) fn context(&self, device: i32) -> Result<usize> {
        Ok(self.device(device)?.context)
    }

    pub(crate) fn release_contexts(&self) {
        for info in &self.devices {
            // SAFETY: Matches the retain performed at initialization.
            unsafe {
                let _ = (self.fns.cu_ctx_set_current)(std::ptr::null_mut());
                let _ = (self.fns.cu_device_primary_ctx_release)(info.id);
            }
        }
    }

    pub(crate) fn stream_create(&self, device: i32) -> Result<usize> {
        self.make_current(device)?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: Valid out pointer.
        unsafe {
            check(
                (self.fns.cu_stream_create)(&mut stream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(stream as usize)
    }

    pub(crate) fn stream_destroy(&self, stream: usize) {
        // SAFETY: The stream was created by this driver.
        unsafe {
            let _ = (self.fns.cu_stream_destroy)(stream as CUstream);
        }
    }

    pub(crate) fn stream_sync(&self, stream: usize) -> Result<()> {
        // SAFETY: The stream handle is valid until destroyed.
        unsafe {
            check(
                (self.fns.cu_stream_synchronize)(stream as CUstream),
                "cuStreamSynchronize",
            )
        }
    }

    pub(crate) fn stream_wait_event(&self, stream: usize, event: usize) -> Result<()> {
        // SAFETY: Both handles were created by this driver.
        unsafe {
            check(
                (self.fns.cu_stream_wait_event)(stream as CUstream, event as CUevent, 0),
                "cuStreamWaitEvent",
            )
        }
    }

    pub(crate) fn ctx_sync(&self, device: i32) -> Result<()> {
        self.make_current(device)?;
        // SAFETY: A context is current on this thread.
        unsafe { check((self.fns.cu_ctx_synchronize)(), "cuCtxSynchronize") }
    }

    pub(crate) fn event_create(&self, device: i32) -> Result<usize> {
        self.make_current(device)?;
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: Valid out pointer.
        unsafe {
            check(
                (self.fns.cu_event_create)(&mut event, CU_EVENT_DISABLE_TIMING),
                "cuEventCreate",
            )?;
        }
        Ok(event as usize)
    }

    pub(crate) fn event_destroy(&self, event: usize) {
        // SAFETY: The event was created by this driver.
        unsafe {
            let _ = (self.fns.cu_event_destroy)(event as CUevent);
        }
    }

    pub(crate) fn event_record(&self, event: usize, stream: usize) -> Result<()> {
        // SAFETY: Both handles were created by this driver.
        unsafe {
            check(
                (self.fns.cu_event_record)(event as CUevent, stream as CUstream),
                "cuEventRecord",
            )
        }
    }

    pub(crate) fn event_query(&self, event: usize) -> Result<bool> {
        // SAFETY: The event was created by this driver.
        let rv = unsafe { (self.fns.cu_event_query)(event as CUevent) };
        match rv {
            CUDA_SUCCESS => Ok(true),
            CUDA_ERROR_NOT_READY => Ok(false),
            err => Err(driver_error(err, "cuEventQuery")),
        }
    }

    pub(crate) fn mem_alloc_device(&self, bytes: usize, device: i32) -> Result<usize> {
        self.make_current(device)?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: Valid out pointer.
        let rv = unsafe { (self.fns.cu_mem_alloc)(&mut ptr, bytes) };
        map_alloc_result(rv, bytes, kiln::alloc::AllocType::Device, "cuMemAlloc")?;
        Ok(ptr as usize)
    }

    pub(crate) fn mem_alloc_host(&self, bytes: usize) -> Result<usize> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: Valid out pointer.
        let rv = unsafe { (self.fns.cu_mem_alloc_host)(&mut ptr, bytes) };
        map_alloc_result(rv, bytes, kiln::alloc::AllocType::HostPinned, "cuMemAllocHost")?;
        Ok(ptr as usize)
    }

    pub(crate) fn mem_alloc_managed(
        &self,
        bytes: usize,
        device: i32,
        read_mostly: bool,
    ) -> Result<usize> {
        self.make_current(device)?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: Valid out pointer.
        let rv = unsafe { (self.fns.cu_mem_alloc_managed)(&mut ptr, bytes, CU_MEM_ATTACH_GLOBAL) };
        map_alloc_result(rv, bytes, kiln::alloc::AllocType::Managed, "cuMemAllocManaged")?;
        if read_mostly {
            // SAFETY: The pointer was just allocated with the given size.
            unsafe {
                check(
                    (self.fns.cu_mem_advise)(ptr, bytes, CU_MEM_ADVISE_SET_READ_MOSTLY, device),
                    "cuMemAdvise",
                )?;
            }
        }
        Ok(ptr as usize)
    }

    pub(crate) fn mem_free_device(&self, ptr: usize) {
        // SAFETY: The pointer was allocated through this driver.
        unsafe {
            let _ = (self.fns.cu_mem_free)(ptr as CUdeviceptr);
        }
    }

    pub(crate) fn mem_free_host(&self, ptr: usize) {
        // SAFETY: The pointer was allocated through this driver.
        unsafe {
            let _ = (self.fns.cu_mem_free_host)(ptr as *mut c_void);
        }
    }

    pub(crate) fn memcpy(&self, dst: usize, src: usize, bytes: usize) -> Result<()> {
        // SAFETY: Unified addressing lets the driver infer the direction.
        unsafe {
            check(
                (self.fns.cu_memcpy)(dst as CUdeviceptr, src as CUdeviceptr, bytes),
                "cuMemcpy",
            )
        }
    }

    pub(crate) fn memcpy_async(
        &self,
        dst: usize,
        src: usize,
        bytes: usize,
        stream: usize,
    ) -> Result<()> {
        // SAFETY: Pointers stay valid until the stream reaches the copy;
        // the allocator's release chain guarantees that.
        unsafe {
            check(
                (self.fns.cu_memcpy_async)(
                    dst as CUdeviceptr,
                    src as CUdeviceptr,
                    bytes,
                    stream as CUstream,
                ),
                "cuMemcpyAsync",
            )
        }
    }

    pub(crate) fn memcpy_peer_async(
        &self,
        dst: usize,
        dst_ctx: usize,
        src: usize,
        src_ctx: usize,
        bytes: usize,
        stream: usize,
    ) -> Result<()> {
        // SAFETY: Contexts were retained at initialization.
        unsafe {
            check(
                (self.fns.cu_memcpy_peer_async)(
                    dst as CUdeviceptr,
                    dst_ctx as CUcontext,
                    src as CUdeviceptr,
                    src_ctx as CUcontext,
                    bytes,
                    stream as CUstream,
                ),
                "cuMemcpyPeerAsync",
            )
        }
    }

    pub(crate) fn memset_d8_async(
        &self,
        ptr: usize,
        value: u8,
        bytes: usize,
        stream: usize,
    ) -> Result<()> {
        // SAFETY: The pointer is a live allocation of at least `bytes`.
        unsafe {
            check(
                (self.fns.cu_memset_d8_async)(ptr as CUdeviceptr, value, bytes, stream as CUstream),
                "cuMemsetD8Async",
            )
        }
    }

    pub(crate) fn mem_prefetch_async(
        &self,
        ptr: usize,
        bytes: usize,
        device: CUdevice,
        stream: usize,
    ) -> Result<()> {
        // SAFETY: The pointer is a live managed allocation.
        unsafe {
            check(
                (self.fns.cu_mem_prefetch_async)(
                    ptr as CUdeviceptr,
                    bytes,
                    device,
                    stream as CUstream,
                ),
                "cuMemPrefetchAsync",
            )
        }
    }

    /// JIT-compiles PTX text into a module and resolves `entry`, returning
    /// (module, function) handles. Compilation diagnostics from the driver
    /// are surfaced in the error message.
    pub(crate) fn load_ptx(&self, device: i32, ptx: &str, entry: &str) -> Result<(usize, usize)> {
        self.make_current(device)?;
        let c_ptx = CString::new(ptx)
            .map_err(|_| JitError::Driver("PTX source contains a NUL byte".into()))?;
        let c_entry = CString::new(entry)
            .map_err(|_| JitError::Driver("kernel entry name contains a NUL byte".into()))?;

        let mut info_log = vec![0u8; 8192];
        let mut error_log = vec![0u8; 8192];
        let mut options = [
            CU_JIT_INFO_LOG_BUFFER,
            CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
            CU_JIT_ERROR_LOG_BUFFER,
            CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
        ];
        let mut option_values = [
            info_log.as_mut_ptr() as *mut c_void,
            info_log.len() as *mut c_void,
            error_log.as_mut_ptr() as *mut c_void,
            error_log.len() as *mut c_void,
        ];

        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: Option arrays are valid for the duration of the call.
        let rv = unsafe {
            (self.fns.cu_module_load_data_ex)(
                &mut module,
                c_ptx.as_ptr() as *const c_void,
                options.len() as u32,
                options.as_mut_ptr(),
                option_values.as_mut_ptr(),
            )
        };
        if rv != CUDA_SUCCESS {
            let diag = String::from_utf8_lossy(
                &error_log[..error_log.iter().position(|&b| b == 0).unwrap_or(0)],
            )
            .into_owned();
            return Err(JitError::CompileFailed {
                backend: "cuda",
                message: if diag.is_empty() {
                    format!("cuModuleLoadDataEx failed with code {rv}")
                } else {
                    diag
                },
            });
        }

        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: The module was just loaded.
        unsafe {
            check(
                (self.fns.cu_module_get_function)(&mut function, module, c_entry.as_ptr()),
                "cuModuleGetFunction",
            )?;
        }
        Ok((module as usize, function as usize))
    }

    pub(crate) fn module_unload(&self, module: usize) {
        // SAFETY: The module was loaded through this driver.
        unsafe {
            let _ = (self.fns.cu_module_unload)(module as CUmodule);
        }
    }

    pub(crate) fn launch(
        &self,
        function: usize,
        grid: u32,
        block: u32,
        shared_mem_bytes: u32,
        stream: usize,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        // SAFETY: Parameter pointers are valid for the duration of the
        // call; the driver copies them synchronously.
        unsafe {
            check(
                (self.fns.cu_launch_kernel)(
                    function as CUfunction,
                    grid,
                    1,
                    1,
                    block,
                    1,
                    1,
                    shared_mem_bytes,
                    stream as CUstream,
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }
}

fn load_cuda_library() -> Result<Library> {
    if let Some(path) = std::env::var_os("KILN_LIBCUDA_PATH") {
        // SAFETY: Loading a user-specified driver library.
        return unsafe { Library::new(&path) }.map_err(|err| {
            JitError::Driver(format!(
                "failed to load CUDA driver from KILN_LIBCUDA_PATH: {err}"
            ))
        });
    }

    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];
    for candidate in candidates {
        // SAFETY: Dynamic library probe only.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(JitError::Driver(
        "failed to load the CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)"
            .into(),
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: The caller provides the expected symbol type from the
    // driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        JitError::Driver(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check(code: CUresult, op: &str) -> Result<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(driver_error(code, op))
    }
}

fn driver_error(code: CUresult, op: &str) -> JitError {
    JitError::Driver(format!("CUDA driver call {op} failed with code {code}"))
}

fn map_alloc_result(
    code: CUresult,
    bytes: usize,
    ty: kiln::alloc::AllocType,
    op: &str,
) -> Result<()> {
    match code {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_OUT_OF_MEMORY => Err(JitError::OutOfMemory { ty, bytes }),
        err => Err(driver_error(err, op)),
    }
}
