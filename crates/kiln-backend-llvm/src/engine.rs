//! Dynamically loaded LLVM execution engine.
//!
//! Mirrors the CUDA driver shim: a narrow set of LLVM-C symbols is
//! resolved from `libLLVM` at runtime (`KILN_LIBLLVM_PATH` overrides the
//! search), so the crate never links against LLVM at build time. Each
//! compiled kernel owns its context and MCJIT execution engine and exposes
//! the entry point as a plain function address.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, OnceLock};

use kiln::{JitError, Result};
use libloading::Library;
use log::debug;

type LLVMBool = i32;
type ContextRef = *mut c_void;
type MemoryBufferRef = *mut c_void;
type ModuleRef = *mut c_void;
type ExecutionEngineRef = *mut c_void;

#[repr(C)]
struct MCJITCompilerOptions {
    opt_level: u32,
    code_model: i32,
    no_frame_pointer_elim: LLVMBool,
    enable_fast_isel: LLVMBool,
    mcjmm: *mut c_void,
}

type ContextCreateFn = unsafe extern "C" fn() -> ContextRef;
type ContextDisposeFn = unsafe extern "C" fn(ctx: ContextRef);
type CreateMemoryBufferFn = unsafe extern "C" fn(
    data: *const c_char,
    len: usize,
    name: *const c_char,
) -> MemoryBufferRef;
type ParseIrInContextFn = unsafe extern "C" fn(
    ctx: ContextRef,
    buffer: MemoryBufferRef,
    module: *mut ModuleRef,
    message: *mut *mut c_char,
) -> LLVMBool;
type LinkInMcjitFn = unsafe extern "C" fn();
type InitTargetFn = unsafe extern "C" fn();
type InitMcjitOptionsFn = unsafe extern "C" fn(options: *mut MCJITCompilerOptions, size: usize);
type CreateMcjitFn = unsafe extern "C" fn(
    engine: *mut ExecutionEngineRef,
    module: ModuleRef,
    options: *mut MCJITCompilerOptions,
    size: usize,
    message: *mut *mut c_char,
) -> LLVMBool;
type DisposeEngineFn = unsafe extern "C" fn(engine: ExecutionEngineRef);
type GetFunctionAddressFn =
    unsafe extern "C" fn(engine: ExecutionEngineRef, name: *const c_char) -> u64;
type DisposeMessageFn = unsafe extern "C" fn(message: *mut c_char);
type HostStringFn = unsafe extern "C" fn() -> *mut c_char;

struct EngineFns {
    context_create: ContextCreateFn,
    context_dispose: ContextDisposeFn,
    create_memory_buffer: CreateMemoryBufferFn,
    parse_ir_in_context: ParseIrInContextFn,
    init_mcjit_options: InitMcjitOptionsFn,
    create_mcjit: CreateMcjitFn,
    dispose_engine: DisposeEngineFn,
    get_function_address: GetFunctionAddressFn,
    dispose_message: DisposeMessageFn,
    host_cpu_name: Option<HostStringFn>,
    host_cpu_features: Option<HostStringFn>,
}

pub struct LlvmEngine {
    _lib: Library,
    fns: EngineFns,
}

// SAFETY: LLVM-C entry points used here are thread-safe across distinct
// contexts, and every kernel owns its own context.
unsafe impl Send for LlvmEngine {}
unsafe impl Sync for LlvmEngine {}

/// A compiled kernel: its context and engine, plus the resolved entry
/// address.
pub(crate) struct JitModule {
    context: usize,
    engine: usize,
    pub entry: usize,
}

static LLVM_ENGINE: OnceLock<std::result::Result<Arc<LlvmEngine>, String>> = OnceLock::new();

/// Returns the process-wide engine, loading `libLLVM` on first use.
pub fn engine() -> Result<Arc<LlvmEngine>> {
    let init = LLVM_ENGINE.get_or_init(|| match LlvmEngine::new() {
        Ok(engine) => Ok(Arc::new(engine)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(engine) => Ok(Arc::clone(engine)),
        Err(msg) => Err(JitError::Driver(format!("LLVM unavailable: {msg}"))),
    }
}

pub fn is_available() -> bool {
    engine().is_ok()
}

impl LlvmEngine {
    fn new() -> Result<Self> {
        let lib = load_llvm_library()?;
        let fns = EngineFns {
            context_create: load_symbol(&lib, b"LLVMContextCreate\0")?,
            context_dispose: load_symbol(&lib, b"LLVMContextDispose\0")?,
            create_memory_buffer: load_symbol(&lib, b"LLVMCreateMemoryBufferWithMemoryRangeCopy\0")?,
            parse_ir_in_context: load_symbol(&lib, b"LLVMParseIRInContext\0")?,
            init_mcjit_options: load_symbol(&lib, b"LLVMInitializeMCJITCompilerOptions\0")?,
            create_mcjit: load_symbol(&lib, b"LLVMCreateMCJITCompilerForModule\0")?,
            dispose_engine: load_symbol(&lib, b"LLVMDisposeExecutionEngine\0")?,
            get_function_address: load_symbol(&lib, b"LLVMGetFunctionAddress\0")?,
            dispose_message: load_symbol(&lib, b"LLVMDisposeMessage\0")?,
            host_cpu_name: load_symbol(&lib, b"LLVMGetHostCPUName\0").ok(),
            host_cpu_features: load_symbol(&lib, b"LLVMGetHostCPUFeatures\0").ok(),
        };

        // SAFETY: Plain initialization entry points.
        unsafe {
            let link_mcjit: LinkInMcjitFn = load_symbol(&lib, b"LLVMLinkInMCJIT\0")?;
            link_mcjit();
            for &name in native_target_symbols() {
                if let Ok(init) = load_symbol::<InitTargetFn>(&lib, name) {
                    init();
                }
            }
        }

        Ok(Self { _lib: lib, fns })
    }

    /// Host CPU name as reported by LLVM (e.g. `skylake`).
    pub fn host_cpu(&self) -> Option<String> {
        self.fns.host_cpu_name.map(|f| {
            // SAFETY: LLVM returns a heap string we must dispose.
            unsafe {
                let raw = f();
                let out = CStr::from_ptr(raw).to_string_lossy().into_owned();
                (self.fns.dispose_message)(raw);
                out
            }
        })
    }

    /// Host feature string as reported by LLVM (e.g. `+avx2,+fma,..`).
    pub fn host_features(&self) -> Option<String> {
        self.fns.host_cpu_features.map(|f| {
            // SAFETY: LLVM returns a heap string we must dispose.
            unsafe {
                let raw = f();
                let out = CStr::from_ptr(raw).to_string_lossy().into_owned();
                (self.fns.dispose_message)(raw);
                out
            }
        })
    }

    /// Parses and JIT-compiles a textual IR module, resolving `entry`.
    pub(crate) fn compile(&self, ir: &str, entry: &str) -> Result<JitModule> {
        let c_entry = CString::new(entry)
            .map_err(|_| JitError::Driver("kernel entry name contains a NUL byte".into()))?;
        let buffer_name = CString::new("kiln").expect("static name");

        // SAFETY: All pointers are valid for the respective calls; the
        // memory buffer and module are consumed by the callee on success.
        unsafe {
            let context = (self.fns.context_create)();
            let buffer = (self.fns.create_memory_buffer)(
                ir.as_ptr() as *const c_char,
                ir.len(),
                buffer_name.as_ptr(),
            );

            let mut module: ModuleRef = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (self.fns.parse_ir_in_context)(context, buffer, &mut module, &mut message) != 0 {
                let diag = self.take_message(message);
                (self.fns.context_dispose)(context);
                return Err(JitError::CompileFailed {
                    backend: "llvm",
                    message: diag,
                });
            }

            let mut options = MCJITCompilerOptions {
                opt_level: 2,
                code_model: 0,
                no_frame_pointer_elim: 0,
                enable_fast_isel: 0,
                mcjmm: std::ptr::null_mut(),
            };
            (self.fns.init_mcjit_options)(&mut options, std::mem::size_of::<MCJITCompilerOptions>());
            options.opt_level = 2;

            let mut ee: ExecutionEngineRef = std::ptr::null_mut();
            let mut message: *mut c_char = std::ptr::null_mut();
            if (self.fns.create_mcjit)(
                &mut ee,
                module,
                &mut options,
                std::mem::size_of::<MCJITCompilerOptions>(),
                &mut message,
            ) != 0
            {
                let diag = self.take_message(message);
                (self.fns.context_dispose)(context);
                return Err(JitError::CompileFailed {
                    backend: "llvm",
                    message: diag,
                });
            }

            let entry_addr = (self.fns.get_function_address)(ee, c_entry.as_ptr());
            if entry_addr == 0 {
                (self.fns.dispose_engine)(ee);
                (self.fns.context_dispose)(context);
                return Err(JitError::CompileFailed {
                    backend: "llvm",
                    message: format!("entry point {entry} not found after compilation"),
                });
            }

            debug!("compiled IR module ({} bytes) -> {:#x}", ir.len(), entry_addr);
            Ok(JitModule {
                context: context as usize,
                engine: ee as usize,
                entry: entry_addr as usize,
            })
        }
    }

    pub(crate) fn dispose(&self, module: &JitModule) {
        // SAFETY: Handles were produced by `compile` and are disposed
        // exactly once by the caller.
        unsafe {
            (self.fns.dispose_engine)(module.engine as ExecutionEngineRef);
            (self.fns.context_dispose)(module.context as ContextRef);
        }
    }

    fn take_message(&self, message: *mut c_char) -> String {
        if message.is_null() {
            return "unknown LLVM error".into();
        }
        // SAFETY: LLVM handed us an owned error string.
        unsafe {
            let out = CStr::from_ptr(message).to_string_lossy().into_owned();
            (self.fns.dispose_message)(message);
            out
        }
    }
}

fn native_target_symbols() -> &'static [&'static [u8]] {
    #[cfg(target_arch = "x86_64")]
    {
        &[
            b"LLVMInitializeX86TargetInfo\0",
            b"LLVMInitializeX86Target\0",
            b"LLVMInitializeX86TargetMC\0",
            b"LLVMInitializeX86AsmPrinter\0",
        ]
    }
    #[cfg(target_arch = "aarch64")]
    {
        &[
            b"LLVMInitializeAArch64TargetInfo\0",
            b"LLVMInitializeAArch64Target\0",
            b"LLVMInitializeAArch64TargetMC\0",
            b"LLVMInitializeAArch64AsmPrinter\0",
        ]
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        &[]
    }
}

fn load_llvm_library() -> Result<Library> {
    if let Some(path) = std::env::var_os("KILN_LIBLLVM_PATH") {
        // SAFETY: Loading a user-specified library.
        return unsafe { Library::new(&path) }.map_err(|err| {
            JitError::Driver(format!("failed to load LLVM from KILN_LIBLLVM_PATH: {err}"))
        });
    }

    let mut candidates: Vec<String> = vec![
        "libLLVM.so".into(),
        "libLLVM.so.1".into(),
        "libLLVM.dylib".into(),
        "LLVM-C.dll".into(),
    ];
    for version in (11..=19).rev() {
        candidates.push(format!("libLLVM-{version}.so"));
        candidates.push(format!("libLLVM-{version}.so.1"));
    }

    for candidate in &candidates {
        // SAFETY: Dynamic library probe only.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(JitError::Driver(
        "failed to load the LLVM shared library (set KILN_LIBLLVM_PATH to override the search)"
            .into(),
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: The caller provides the expected symbol type.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        JitError::Driver(format!(
            "failed to resolve LLVM symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}
