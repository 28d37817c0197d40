//! Hand-tuned PTX collectives: fill, reductions, prefix sums, and the
//! bucket-sort permutation. The kernels are generated as PTX text,
//! compiled through the same driver JIT path as traced kernels, and
//! cached per (kernel, device) in the backend.

use std::ffi::c_void;
use std::fmt::Write as _;

use kiln::backend::{RegClass, ReduceOp};
use kiln::{JitError, Result, VarType};

use crate::codegen;
use crate::CudaBackend;

const BLOCK: u32 = 1024;
/// Elements per scan block: 1024 threads x 4 items.
const SCAN_BLOCK: u32 = 4096;

impl CudaBackend {
    /// Returns the cached function handle for a named collective kernel,
    /// generating and compiling it on first use.
    fn collective_kernel(
        &self,
        device: i32,
        name: &str,
        generate: impl FnOnce() -> String,
    ) -> Result<usize> {
        let key = (name.to_string(), device);
        if let Some(&function) = self
            .collectives
            .lock()
            .expect("cuda collective cache poisoned")
            .get(&key)
        {
            return Ok(function);
        }

        let source = generate();
        let (module, function) = self.driver.load_ptx(device, &source, name)?;
        let mut cache = self
            .collectives
            .lock()
            .expect("cuda collective cache poisoned");
        cache.insert(key, function);
        self.collective_modules
            .lock()
            .expect("cuda collective cache poisoned")
            .push(module);
        Ok(function)
    }

    fn launch_grid_stride(
        &self,
        function: usize,
        device: i32,
        stream: usize,
        size: u32,
        params: &[u64],
    ) -> Result<()> {
        let grid = self.grid_size(device, size, BLOCK);
        let mut size_arg = size;
        let mut block_params: Vec<u64> = params.to_vec();
        let mut launch_params = [
            &mut size_arg as *mut u32 as *mut c_void,
            block_params.as_mut_ptr() as *mut c_void,
        ];
        self.driver
            .launch(function, grid, BLOCK, 0, stream, &mut launch_params)
    }

    pub(crate) fn fill_impl(
        &self,
        device: i32,
        stream: usize,
        ty: VarType,
        ptr: usize,
        size: u32,
        value: &[u8],
    ) -> Result<()> {
        let width = ty.size();
        let name = format!("kiln_fill_{}", width * 8);
        let function = self.collective_kernel(device, &name, || fill_kernel(&name, width))?;

        let mut bits = [0u8; 8];
        bits[..value.len()].copy_from_slice(value);
        self.launch_grid_stride(
            function,
            device,
            stream,
            size,
            &[ptr as u64, u64::from_ne_bytes(bits)],
        )
    }

    pub(crate) fn reduce_impl(
        &self,
        device: i32,
        stream: usize,
        ty: VarType,
        op: ReduceOp,
        ptr: usize,
        size: u32,
        out: usize,
    ) -> Result<()> {
        let name = format!("kiln_reduce_{}_{}", codegen::type_name(ty), op.name());
        let function = self.collective_kernel(device, &name, || reduce_kernel(&name, ty, op))?;

        // Single cooperative block; the strided loop covers any size.
        let mut size_arg = size;
        let mut params: Vec<u64> = vec![ptr as u64, out as u64];
        let mut launch_params = [
            &mut size_arg as *mut u32 as *mut c_void,
            params.as_mut_ptr() as *mut c_void,
        ];
        self.driver
            .launch(function, 1, BLOCK, 0, stream, &mut launch_params)
    }

    pub(crate) fn scan_impl(
        &self,
        device: i32,
        stream: usize,
        input: usize,
        output: usize,
        size: u32,
    ) -> Result<()> {
        let blocks = size.div_ceil(SCAN_BLOCK).max(1);
        let scan_block = self.collective_kernel(device, "kiln_scan_block", scan_block_kernel)?;

        // Per-block exclusive scans, with each block's total written to a
        // scratch array of block sums.
        let sums_len = (blocks as usize).next_multiple_of(SCAN_BLOCK as usize);
        let sums = self.driver.mem_alloc_device(sums_len * 4, device)?;

        let mut size_arg = size;
        let mut params: Vec<u64> = vec![input as u64, output as u64, sums as u64];
        let mut launch_params = [
            &mut size_arg as *mut u32 as *mut c_void,
            params.as_mut_ptr() as *mut c_void,
        ];
        let launch = self
            .driver
            .launch(scan_block, blocks, BLOCK, 0, stream, &mut launch_params);
        if let Err(err) = launch {
            self.driver.mem_free_device(sums);
            return Err(err);
        }

        if blocks > 1 {
            // Offset each block by the exclusive scan of the block sums.
            let result = self
                .scan_impl(device, stream, sums, sums, blocks)
                .and_then(|()| {
                    let offset =
                        self.collective_kernel(device, "kiln_scan_offset", scan_offset_kernel)?;
                    let padded = blocks * SCAN_BLOCK;
                    self.launch_grid_stride(
                        offset,
                        device,
                        stream,
                        padded,
                        &[output as u64, sums as u64],
                    )
                });
            if let Err(err) = result {
                self.driver.mem_free_device(sums);
                return Err(err);
            }
        }

        // The kernels consuming `sums` are ordered on `stream`; dropping
        // the scratch after a sync keeps this self-contained.
        self.driver.stream_sync(stream)?;
        self.driver.mem_free_device(sums);
        Ok(())
    }

    pub(crate) fn all_any_impl(
        &self,
        device: i32,
        stream: usize,
        values: usize,
        size: u32,
        is_all: bool,
    ) -> Result<bool> {
        // Pad to a word boundary with the identity so a 32-bit reduction
        // can be used; the contract allows touching three trailing bytes.
        let padded = (size as usize).next_multiple_of(4);
        let tail = padded - size as usize;
        if tail > 0 {
            self.driver.memset_d8_async(
                values + size as usize,
                if is_all { 1 } else { 0 },
                tail,
                stream,
            )?;
        }

        let op = if is_all { ReduceOp::And } else { ReduceOp::Or };
        let scratch = self.driver.mem_alloc_device(8, device)?;
        let result = self
            .reduce_impl(
                device,
                stream,
                VarType::U32,
                op,
                values,
                (padded / 4) as u32,
                scratch,
            )
            .and_then(|()| {
                self.driver.stream_sync(stream)?;
                let mut word = 0u32;
                self.driver
                    .memcpy(&mut word as *mut u32 as usize, scratch, 4)?;
                Ok(if is_all { word == 0x0101_0101 } else { word != 0 })
            });
        self.driver.mem_free_device(scratch);
        result
    }

    pub(crate) fn mkperm_impl(
        &self,
        device: i32,
        stream: usize,
        values: usize,
        size: u32,
        bucket_count: u32,
        perm: usize,
        offsets: usize,
    ) -> Result<u32> {
        let hist = self.collective_kernel(device, "kiln_mkperm_hist", mkperm_hist_kernel)?;
        let scatter =
            self.collective_kernel(device, "kiln_mkperm_scatter", mkperm_scatter_kernel)?;

        let counts_bytes = bucket_count as usize * 4;
        let counts = self.driver.mem_alloc_device(counts_bytes, device)?;
        let result = (|| {
            self.driver.memset_d8_async(counts, 0, counts_bytes, stream)?;
            self.launch_grid_stride(
                hist,
                device,
                stream,
                size,
                &[values as u64, counts as u64],
            )?;
            self.driver.stream_sync(stream)?;

            let mut host_counts = vec![0u32; bucket_count as usize];
            self.driver
                .memcpy(host_counts.as_mut_ptr() as usize, counts, counts_bytes)?;

            // Exclusive offsets double as the scatter cursors.
            let mut starts = vec![0u32; bucket_count as usize];
            let mut running = 0u32;
            let mut unique = 0u32;
            for (i, &count) in host_counts.iter().enumerate() {
                starts[i] = running;
                running += count;
                if count != 0 {
                    unique += 1;
                }
            }

            if offsets != 0 {
                // Quadruples (bucket, start, length, unused) for each
                // non-empty bucket, written to host-accessible memory.
                let quads = offsets as *mut u32;
                let mut slot = 0usize;
                for (i, &count) in host_counts.iter().enumerate() {
                    if count == 0 {
                        continue;
                    }
                    // SAFETY: The caller supplied at least
                    // bucket_count * 4 + 1 writable u32 slots.
                    unsafe {
                        *quads.add(slot * 4) = i as u32;
                        *quads.add(slot * 4 + 1) = starts[i];
                        *quads.add(slot * 4 + 2) = count;
                        *quads.add(slot * 4 + 3) = 0;
                    }
                    slot += 1;
                }
            }

            self.driver
                .memcpy(counts, starts.as_ptr() as usize, counts_bytes)?;
            self.launch_grid_stride(
                scatter,
                device,
                stream,
                size,
                &[values as u64, counts as u64, perm as u64],
            )?;
            self.driver.stream_sync(stream)?;
            Ok(if offsets != 0 { unique } else { 0 })
        })();
        self.driver.mem_free_device(counts);
        result
    }
}

// ---------------------------------------------------------------------
// PTX generators
// ---------------------------------------------------------------------

const R32: RegClass = RegClass { prefix: "%r", decl: ".b32" };
const R64: RegClass = RegClass { prefix: "%rd", decl: ".b64" };

/// Baseline target for the fixed collective kernels; PTX is forward
/// compatible, so one variant serves every supported device generation.
const COLLECTIVE_SM: u32 = 50;

fn fill_kernel(name: &str, width: usize) -> String {
    let mut body = String::new();
    writeln!(body, "    ld.param.u64 %rd0, [params+0];").unwrap();
    writeln!(body, "    mul.wide.u32 %rd1, %r1, {width};").unwrap();
    body.push_str("    add.u64 %rd0, %rd0, %rd1;\n");
    body.push_str("    ld.param.u64 %rd2, [params+8];\n");
    match width {
        1 => {
            body.push_str("    cvt.u16.u64 %w1, %rd2;\n");
            body.push_str("    st.global.cs.u8 [%rd0], %w1;\n");
        }
        2 => {
            body.push_str("    cvt.u16.u64 %w1, %rd2;\n");
            body.push_str("    st.global.cs.u16 [%rd0], %w1;\n");
        }
        4 => {
            body.push_str("    cvt.u32.u64 %r4, %rd2;\n");
            body.push_str("    st.global.cs.u32 [%rd0], %r4;\n");
        }
        _ => {
            body.push_str("    st.global.cs.u64 [%rd0], %rd2;\n");
        }
    }
    rename_entry(
        codegen::assemble(
            COLLECTIVE_SM,
            &body,
            2,
            &[(R32, 5), (R64, 3), (RegClass { prefix: "%w", decl: ".b16" }, 2)],
        ),
        name,
    )
}

fn mkperm_hist_kernel() -> String {
    let body = "\
    ld.param.u64 %rd0, [params+0];
    mul.wide.u32 %rd1, %r1, 4;
    add.u64 %rd0, %rd0, %rd1;
    ld.global.cs.u32 %r4, [%rd0];
    ld.param.u64 %rd2, [params+8];
    mul.wide.u32 %rd1, %r4, 4;
    add.u64 %rd2, %rd2, %rd1;
    atom.global.add.u32 %r5, [%rd2], 1;
";
    rename_entry(
        codegen::assemble(COLLECTIVE_SM, body, 2, &[(R32, 6), (R64, 3)]),
        "kiln_mkperm_hist",
    )
}

fn mkperm_scatter_kernel() -> String {
    let body = "\
    ld.param.u64 %rd0, [params+0];
    mul.wide.u32 %rd1, %r1, 4;
    add.u64 %rd0, %rd0, %rd1;
    ld.global.cs.u32 %r4, [%rd0];
    ld.param.u64 %rd2, [params+8];
    mul.wide.u32 %rd1, %r4, 4;
    add.u64 %rd2, %rd2, %rd1;
    atom.global.add.u32 %r5, [%rd2], 1;
    ld.param.u64 %rd2, [params+16];
    mul.wide.u32 %rd1, %r5, 4;
    add.u64 %rd2, %rd2, %rd1;
    st.global.cs.u32 [%rd2], %r1;
";
    rename_entry(
        codegen::assemble(COLLECTIVE_SM, body, 3, &[(R32, 6), (R64, 3)]),
        "kiln_mkperm_scatter",
    )
}

fn scan_offset_kernel() -> String {
    let body = "\
    ld.param.u64 %rd0, [params+0];
    mul.wide.u32 %rd1, %r1, 4;
    add.u64 %rd0, %rd0, %rd1;
    shr.u32 %r4, %r1, 12;
    ld.param.u64 %rd2, [params+8];
    mul.wide.u32 %rd1, %r4, 4;
    add.u64 %rd2, %rd2, %rd1;
    ld.global.cs.u32 %r5, [%rd2];
    ld.global.cs.u32 %r6, [%rd0];
    add.u32 %r6, %r6, %r5;
    st.global.cs.u32 [%rd0], %r6;
";
    rename_entry(
        codegen::assemble(COLLECTIVE_SM, body, 2, &[(R32, 7), (R64, 3)]),
        "kiln_scan_offset",
    )
}

/// Per-block exclusive prefix sum: 1024 threads x 4 consecutive items,
/// quad sums scanned across the block in shared memory (Hillis-Steele),
/// block total written to the sums array.
fn scan_block_kernel() -> String {
    "\
.version 6.3
.target sm_50
.address_size 64

.visible .entry kiln_scan_block(.param .u32 size, .param .align 8 .b8 params[24]) {
    .shared .align 4 .b8 sdata[4096];
    .reg .b32 %r<16>;
    .reg .b64 %rd<8>;
    .reg .pred %p<2>;

    mov.u32 %r0, %ctaid.x;
    mov.u32 %r1, %tid.x;
    shl.b32 %r2, %r0, 12;
    shl.b32 %r3, %r1, 2;
    add.u32 %r2, %r2, %r3;

    ld.param.u64 %rd0, [params+0];
    mul.wide.u32 %rd1, %r2, 4;
    add.u64 %rd0, %rd0, %rd1;
    ld.global.cs.u32 %r4, [%rd0];
    ld.global.cs.u32 %r5, [%rd0+4];
    ld.global.cs.u32 %r6, [%rd0+8];
    ld.global.cs.u32 %r7, [%rd0+12];

    add.u32 %r5, %r5, %r4;
    add.u32 %r6, %r6, %r5;
    add.u32 %r7, %r7, %r6;

    mov.u32 %r8, sdata;
    shl.b32 %r9, %r1, 2;
    add.u32 %r8, %r8, %r9;
    st.shared.u32 [%r8], %r7;
    bar.sync 0;

    mov.u32 %r10, 1;
scan_step:
    mov.u32 %r11, 0;
    setp.ge.u32 %p0, %r1, %r10;
    shl.b32 %r12, %r10, 2;
    sub.u32 %r12, %r8, %r12;
    @%p0 ld.shared.u32 %r11, [%r12];
    ld.shared.u32 %r13, [%r8];
    bar.sync 0;
    add.u32 %r13, %r13, %r11;
    st.shared.u32 [%r8], %r13;
    bar.sync 0;
    shl.b32 %r10, %r10, 1;
    setp.lt.u32 %p0, %r10, 1024;
    @%p0 bra scan_step;

    ld.shared.u32 %r13, [%r8];
    sub.u32 %r13, %r13, %r7;

    ld.param.u64 %rd2, [params+8];
    mul.wide.u32 %rd1, %r2, 4;
    add.u64 %rd2, %rd2, %rd1;
    st.global.cs.u32 [%rd2], %r13;
    add.u32 %r14, %r13, %r4;
    st.global.cs.u32 [%rd2+4], %r14;
    add.u32 %r14, %r13, %r5;
    st.global.cs.u32 [%rd2+8], %r14;
    add.u32 %r14, %r13, %r6;
    st.global.cs.u32 [%rd2+12], %r14;

    setp.ne.u32 %p0, %r1, 1023;
    @%p0 bra done;
    ld.shared.u32 %r13, [%r8];
    ld.param.u64 %rd3, [params+16];
    mul.wide.u32 %rd1, %r0, 4;
    add.u64 %rd3, %rd3, %rd1;
    st.global.cs.u32 [%rd3], %r13;

done:
    ret;
}
"
    .to_string()
}

/// Single cooperative block: strided accumulation into one register per
/// thread, then a shared-memory tree reduction.
fn reduce_kernel(name: &str, ty: VarType, op: ReduceOp) -> String {
    let ts = ty.size();
    let class = codegen::register_class(ty);
    let acc = format!("{}8", class.prefix);
    let val = format!("{}9", class.prefix);
    let t = reduce_value_type(ty);
    let instr = reduce_op_instr(ty, op);
    let identity = reduce_identity(ty, op);

    let mut out = String::with_capacity(2048);
    out.push_str(".version 6.3\n.target sm_50\n.address_size 64\n\n");
    writeln!(
        out,
        ".visible .entry {name}(.param .u32 size, .param .align 8 .b8 params[16]) {{"
    )
    .unwrap();
    writeln!(out, "    .shared .align {ts} .b8 sdata[{}];", 1024 * ts).unwrap();
    // The accumulator pair lives at indices 8/9 of its own class, past
    // the skeleton's scratch registers.
    let r32 = if class.prefix == "%r" { 10 } else { 8 };
    let r64 = if class.prefix == "%rd" { 10 } else { 4 };
    writeln!(out, "    .reg .b32 %r<{r32}>;").unwrap();
    writeln!(out, "    .reg .b64 %rd<{r64}>;").unwrap();
    out.push_str("    .reg .pred %p<2>;\n");
    if class.prefix != "%r" && class.prefix != "%rd" {
        writeln!(out, "    .reg {} {}<10>;", class.decl, class.prefix).unwrap();
    }
    out.push('\n');

    writeln!(out, "    ld.param.u32 %r0, [size];").unwrap();
    out.push_str("    mov.u32 %r1, %tid.x;\n");
    out.push_str("    ld.param.u64 %rd0, [params+0];\n");
    writeln!(out, "    mov.{} {}, {};", mov_type(ty), acc, identity).unwrap();
    out.push_str("    setp.ge.u32 %p0, %r1, %r0;\n    @%p0 bra reduced;\n\nacc_loop:\n");
    writeln!(out, "    mul.wide.u32 %rd1, %r1, {ts};").unwrap();
    out.push_str("    add.u64 %rd2, %rd0, %rd1;\n");
    writeln!(out, "    ld.global.cs.{t} {val}, [%rd2];").unwrap();
    writeln!(out, "    {instr} {acc}, {acc}, {val};").unwrap();
    out.push_str(
        "    add.u32 %r1, %r1, 1024;\n    setp.lt.u32 %p0, %r1, %r0;\n    @%p0 bra acc_loop;\n\nreduced:\n",
    );
    out.push_str("    mov.u32 %r1, %tid.x;\n");
    writeln!(out, "    mul.lo.u32 %r2, %r1, {ts};").unwrap();
    out.push_str("    mov.u32 %r3, sdata;\n    add.u32 %r3, %r3, %r2;\n");
    writeln!(out, "    st.shared.{t} [%r3], {acc};").unwrap();
    out.push_str("    bar.sync 0;\n\n    mov.u32 %r2, 512;\ntree:\n");
    out.push_str("    setp.ge.u32 %p0, %r1, %r2;\n    @%p0 bra tree_skip;\n");
    writeln!(out, "    mul.lo.u32 %r4, %r2, {ts};").unwrap();
    out.push_str("    add.u32 %r5, %r3, %r4;\n");
    writeln!(out, "    ld.shared.{t} {val}, [%r5];").unwrap();
    writeln!(out, "    ld.shared.{t} {acc}, [%r3];").unwrap();
    writeln!(out, "    {instr} {acc}, {acc}, {val};").unwrap();
    writeln!(out, "    st.shared.{t} [%r3], {acc};").unwrap();
    out.push_str(
        "tree_skip:\n    bar.sync 0;\n    shr.u32 %r2, %r2, 1;\n    setp.gt.u32 %p0, %r2, 0;\n    @%p0 bra tree;\n\n",
    );
    out.push_str("    setp.ne.u32 %p0, %r1, 0;\n    @%p0 bra done;\n");
    writeln!(out, "    ld.shared.{t} {acc}, [%r3];").unwrap();
    out.push_str("    ld.param.u64 %rd0, [params+8];\n");
    writeln!(out, "    st.global.{t} [%rd0], {acc};").unwrap();
    out.push_str("\ndone:\n    ret;\n}\n");
    out
}

/// Replaces the generic entry name produced by [`codegen::assemble`].
fn rename_entry(source: String, name: &str) -> String {
    source.replace(codegen::ENTRY_NAME, name)
}

fn reduce_value_type(ty: VarType) -> &'static str {
    match ty {
        // Loads/stores of halves go through the binary spelling.
        VarType::F16 => "b16",
        other => codegen::type_name(other),
    }
}

fn mov_type(ty: VarType) -> &'static str {
    match ty {
        VarType::F16 => "b16",
        VarType::F32 => "f32",
        VarType::F64 => "f64",
        other => codegen::binary_type_name(other),
    }
}

pub(crate) fn reduce_op_instr(ty: VarType, op: ReduceOp) -> String {
    let t = codegen::type_name(ty);
    let b = codegen::binary_type_name(ty);
    match op {
        ReduceOp::Add => format!("add.{t}"),
        ReduceOp::Mul => {
            if ty.is_integral() {
                format!("mul.lo.{t}")
            } else {
                format!("mul.{t}")
            }
        }
        ReduceOp::Min => format!("min.{t}"),
        ReduceOp::Max => format!("max.{t}"),
        ReduceOp::And => format!("and.{b}"),
        ReduceOp::Or => format!("or.{b}"),
    }
}

pub(crate) fn reduce_identity(ty: VarType, op: ReduceOp) -> String {
    match op {
        ReduceOp::Add => match ty {
            VarType::F32 => "0f00000000".into(),
            VarType::F64 => "0d0000000000000000".into(),
            _ => "0".into(),
        },
        ReduceOp::Mul => match ty {
            VarType::F32 => "0f3F800000".into(),
            VarType::F64 => "0d3FF0000000000000".into(),
            _ => "1".into(),
        },
        ReduceOp::Min => match ty {
            VarType::F32 => "0f7F800000".into(),
            VarType::F64 => "0d7FF0000000000000".into(),
            VarType::I8 => "0x7f".into(),
            VarType::I16 => "0x7fff".into(),
            VarType::I32 => "0x7fffffff".into(),
            VarType::I64 => "0x7fffffffffffffff".into(),
            VarType::U8 => "0xff".into(),
            VarType::U16 => "0xffff".into(),
            VarType::U32 => "0xffffffff".into(),
            _ => "0xffffffffffffffff".into(),
        },
        ReduceOp::Max => match ty {
            VarType::F32 => "0fFF800000".into(),
            VarType::F64 => "0dFFF0000000000000".into(),
            VarType::I8 => "0x80".into(),
            VarType::I16 => "0x8000".into(),
            VarType::I32 => "0x80000000".into(),
            VarType::I64 => "0x8000000000000000".into(),
            _ => "0".into(),
        },
        ReduceOp::And => match ty.size() {
            1 => "0xff".into(),
            2 => "0xffff".into(),
            4 => "0xffffffff".into(),
            _ => "0xffffffffffffffff".into(),
        },
        ReduceOp::Or => "0".into(),
    }
}

/// Checks that a (type, op) pair has a PTX reduction; half floats and
/// non-arithmetic types are rejected before a kernel is generated.
pub(crate) fn validate_reduce(ty: VarType, op: ReduceOp) -> Result<()> {
    let supported = match op {
        ReduceOp::Add | ReduceOp::Mul | ReduceOp::Min | ReduceOp::Max => {
            ty.is_arithmetic() && ty != VarType::F16
        }
        ReduceOp::And | ReduceOp::Or => ty.is_integral(),
    };
    if supported {
        Ok(())
    } else {
        Err(JitError::Driver(format!(
            "reduce(): {} reduction over {} is not supported",
            op.name(),
            ty.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_kernel_has_tree_and_identity() {
        let src = reduce_kernel("kiln_reduce_f32_add", VarType::F32, ReduceOp::Add);
        assert!(src.contains(".visible .entry kiln_reduce_f32_add"));
        assert!(src.contains("mov.f32 %f8, 0f00000000;"));
        assert!(src.contains("add.f32 %f8, %f8, %f9;"));
        assert!(src.contains("bar.sync 0;"));
        assert!(src.contains("st.global.f32 [%rd0], %f8;"));
    }

    #[test]
    fn reduce_identities() {
        assert_eq!(reduce_identity(VarType::U32, ReduceOp::Min), "0xffffffff");
        assert_eq!(reduce_identity(VarType::I32, ReduceOp::Max), "0x80000000");
        assert_eq!(reduce_identity(VarType::F32, ReduceOp::Mul), "0f3F800000");
    }

    #[test]
    fn unsupported_reductions_are_rejected() {
        assert!(validate_reduce(VarType::F16, ReduceOp::Add).is_err());
        assert!(validate_reduce(VarType::F32, ReduceOp::And).is_err());
        assert!(validate_reduce(VarType::Bool, ReduceOp::Add).is_err());
        assert!(validate_reduce(VarType::U32, ReduceOp::And).is_ok());
    }

    #[test]
    fn fill_kernel_stores_each_width() {
        for (width, fragment) in [
            (1usize, "st.global.cs.u8"),
            (2, "st.global.cs.u16"),
            (4, "st.global.cs.u32"),
            (8, "st.global.cs.u64"),
        ] {
            let src = fill_kernel("kiln_fill_test", width);
            assert!(src.contains(fragment), "width {width}");
            assert!(src.contains(".visible .entry kiln_fill_test"));
        }
    }

    #[test]
    fn scan_block_kernel_shape() {
        let src = scan_block_kernel();
        assert!(src.contains(".shared .align 4 .b8 sdata[4096];"));
        assert!(src.contains("bar.sync 0;"));
        assert!(src.contains("st.global.cs.u32 [%rd3], %r13;"));
    }
}
