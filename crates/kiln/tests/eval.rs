//! Evaluation engine behavior: scheduling, substitution, caching,
//! materialization, and the asynchronous allocator's interaction with
//! launches.

mod common;

use kiln::alloc::{self, AllocType};
use kiln::{trace, var, VarType};

#[test]
fn evaluation_substitutes_and_materializes() {
    common::with_session(|stats| {
        let data: Vec<u32> = vec![1, 2, 3, 4];
        let src = trace::register(VarType::U32, data.as_ptr() as *mut u8, 4, false).unwrap();
        let sum = trace::append_2(VarType::U32, "$r0 = add.$t0($r1, $r2)", src, src).unwrap();

        assert!(var::ptr(sum).unwrap().is_null(), "symbolic before evaluation");
        kiln::eval().unwrap();

        assert_eq!(stats.compile_count(), 1);
        assert_eq!(stats.launch_count(), 1);
        let source = stats.last_source();
        assert!(source.contains("%r0 = load.u32(p0)"), "source was: {source}");
        assert!(source.contains("%r1 = add.u32(%r0, %r0)"), "source was: {source}");
        assert!(source.contains("store.u32(p1, %r1)"), "source was: {source}");

        // The root is a concrete buffer now; the parameter list carried
        // the input address and the fresh output address.
        let out = var::ptr(sum).unwrap();
        assert!(!out.is_null());
        {
            let launches = stats.launches.lock().unwrap();
            let launch = launches.last().unwrap();
            assert_eq!(launch.size, 4);
            assert_eq!(launch.params, vec![data.as_ptr() as usize, out as usize]);
        }

        // Evaluating again is a no-op.
        kiln::eval().unwrap();
        kiln::var_eval(sum).unwrap();
        assert_eq!(stats.launch_count(), 1);

        var::dec_ref_ext(sum).unwrap();
        var::dec_ref_ext(src).unwrap();
    });
}

#[test]
fn identical_traces_hit_the_memory_cache() {
    common::with_session(|stats| {
        let first = {
            let a = trace::append_0(VarType::F32, "$r0 = const(2)", 16).unwrap();
            let b = trace::append_1(VarType::F32, "$r0 = sqrt($r1)", a).unwrap();
            kiln::eval().unwrap();
            var::dec_ref_ext(a).unwrap();
            var::dec_ref_ext(b).unwrap();
            stats.compile_count()
        };
        assert_eq!(first, 1);

        // Re-tracing the same computation produces the same kernel text
        // (addresses are parameters, not IR), so the compiler is not
        // invoked again.
        let a = trace::append_0(VarType::F32, "$r0 = const(2)", 16).unwrap();
        let b = trace::append_1(VarType::F32, "$r0 = sqrt($r1)", a).unwrap();
        kiln::eval().unwrap();
        assert_eq!(stats.compile_count(), 1, "second trace is a cache hit");
        assert_eq!(stats.launch_count(), 2);

        var::dec_ref_ext(a).unwrap();
        var::dec_ref_ext(b).unwrap();
    });
}

#[test]
fn differently_sized_roots_become_separate_kernels() {
    common::with_session(|stats| {
        let big = trace::append_0(VarType::U32, "$r0 = index()", 32).unwrap();
        let small = trace::append_0(VarType::U32, "$r0 = index()", 8).unwrap();
        kiln::eval().unwrap();

        // Two launches — but the kernel text is size-independent, so the
        // second partition reuses the first compilation.
        assert_eq!(stats.launch_count(), 2);
        assert_eq!(stats.compile_count(), 1);
        {
            let launches = stats.launches.lock().unwrap();
            let sizes: Vec<u32> = launches.iter().map(|l| l.size).collect();
            assert_eq!(sizes, vec![32, 8], "larger partitions launch first");
        }

        var::dec_ref_ext(big).unwrap();
        var::dec_ref_ext(small).unwrap();
    });
}

#[test]
fn scalar_operands_fuse_into_larger_kernels() {
    common::with_session(|stats| {
        let scalar = trace::append_0(VarType::F32, "$r0 = const(0.5)", 1).unwrap();
        let vector = trace::append_0(VarType::F32, "$r0 = index()", 10).unwrap();
        let result = trace::append_2(VarType::F32, "$r0 = add($r1, $r2)", vector, scalar).unwrap();

        // The scalar embeds into the size-10 kernel as a broadcast; with
        // its own host reference dropped it forces no kernel of its own.
        var::dec_ref_ext(scalar).unwrap();
        kiln::eval().unwrap();
        assert_eq!(stats.launch_count(), 1);

        let source = stats.last_source();
        assert!(source.contains("const(0.5)"), "scalar computed inline: {source}");

        var::dec_ref_ext(vector).unwrap();
        var::dec_ref_ext(result).unwrap();
    });
}

#[test]
fn dead_symbolic_code_is_never_compiled() {
    common::with_session(|stats| {
        let a = trace::append_0(VarType::U32, "$r0 = index()", 8).unwrap();
        let b = trace::append_1(VarType::U32, "$r0 = expensive($r1)", a).unwrap();

        // The host loses interest in `b` before evaluating; only `a`
        // reaches a kernel.
        var::dec_ref_ext(b).unwrap();
        kiln::eval().unwrap();
        assert_eq!(stats.launch_count(), 1);
        assert!(!stats.last_source().contains("expensive"));

        var::dec_ref_ext(a).unwrap();
    });
}

#[test]
fn materialized_variables_leave_the_cse_table() {
    common::with_session(|_| {
        let a = trace::append_0(VarType::U32, "$r0 = const(5)", 4).unwrap();
        kiln::eval().unwrap();

        // `a` is concrete now; an identical append must create a fresh
        // symbolic variable rather than aliasing the evaluated one.
        let b = trace::append_0(VarType::U32, "$r0 = const(5)", 4).unwrap();
        assert_ne!(a, b);
        assert!(var::ptr(b).unwrap().is_null());

        var::dec_ref_ext(a).unwrap();
        var::dec_ref_ext(b).unwrap();
    });
}

#[test]
fn pointer_literal_parameters_keep_kernels_cacheable() {
    common::with_session(|stats| {
        let buf_a = [0u64; 16];
        let buf_b = [0u64; 16];

        for buf in [&buf_a, &buf_b] {
            let ptr = trace::register_ptr(buf.as_ptr() as *const u8).unwrap();
            let idx = trace::append_0(VarType::U32, "$r0 = index()", 16).unwrap();
            let gathered =
                trace::append_2(VarType::U64, "$r0 = gather($r1, $r2)", ptr, idx).unwrap();
            var::dec_ref_ext(idx).unwrap();
            kiln::eval().unwrap();
            var::dec_ref_ext(gathered).unwrap();
            var::dec_ref_ext(ptr).unwrap();
        }

        // The literal address travels as a kernel parameter, so changing
        // it does not invalidate the compiled kernel.
        assert_eq!(stats.launch_count(), 2);
        assert_eq!(stats.compile_count(), 1);
        let source = stats.last_source();
        assert!(source.contains("= ptr(p0)"), "source was: {source}");

        let launches = stats.launches.lock().unwrap();
        assert_eq!(launches[0].params[0], buf_a.as_ptr() as usize);
        assert_eq!(launches[1].params[0], buf_b.as_ptr() as usize);
    });
}

#[test]
fn register_round_trips_byte_exactly() {
    common::with_session(|_| {
        let data: Vec<u32> = (0..8).map(|i| 0xa5a5_0000 | i).collect();
        let id = trace::register(VarType::U32, data.as_ptr() as *mut u8, 8, false).unwrap();

        for k in 0..8u32 {
            let mut out = [0u8; 4];
            var::read(id, k, &mut out).unwrap();
            assert_eq!(u32::from_ne_bytes(out), data[k as usize]);
        }

        var::write(id, 3, &0xdead_beefu32.to_ne_bytes()).unwrap();
        let mut out = [0u8; 4];
        var::read(id, 3, &mut out).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 0xdead_beef);

        assert!(var::to_str(id).unwrap().starts_with('['));

        var::dec_ref_ext(id).unwrap();
    });
}

#[test]
fn copy_to_device_stages_host_data() {
    common::with_session(|_| {
        let values: Vec<u16> = vec![10, 20, 30];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let id = trace::copy_to_device(VarType::U16, &bytes, 3).unwrap();

        let mut out = [0u8; 2];
        var::read(id, 1, &mut out).unwrap();
        assert_eq!(u16::from_ne_bytes(out), 20);

        var::dec_ref_ext(id).unwrap();
    });
}

#[test]
fn freed_outputs_are_reused_once_their_event_passes() {
    common::with_session(|_| {
        // Kernel A produces a buffer, the host drops it, kernel B runs
        // (recording the gating event), and kernel C's output may then
        // reuse A's memory without any host-side synchronization.
        let a = trace::append_0(VarType::U32, "$r0 = index()", 64).unwrap();
        kiln::eval().unwrap();
        let addr_a = var::ptr(a).unwrap() as usize;
        var::dec_ref_ext(a).unwrap();

        let b = trace::append_0(VarType::U32, "$r0 = other()", 64).unwrap();
        kiln::eval().unwrap();
        let addr_b = var::ptr(b).unwrap() as usize;
        assert_ne!(addr_a, addr_b, "A's buffer is still gated when B allocates");

        let c = trace::append_0(VarType::U32, "$r0 = third()", 64).unwrap();
        kiln::eval().unwrap();
        let addr_c = var::ptr(c).unwrap() as usize;
        assert_eq!(addr_a, addr_c, "A's buffer flows back through the release chain");

        var::dec_ref_ext(b).unwrap();
        var::dec_ref_ext(c).unwrap();
        kiln::sync_stream().unwrap();
        alloc::malloc_trim();
    });
}

#[test]
fn usage_counters_balance() {
    common::with_session(|_| {
        let base = alloc::usage(AllocType::HostPinned);
        let p = alloc::malloc(AllocType::HostPinned, 100).unwrap();
        assert_eq!(alloc::usage(AllocType::HostPinned), base + 128);
        assert!(alloc::watermark(AllocType::HostPinned) >= base + 128);
        alloc::free(p);
        assert_eq!(alloc::usage(AllocType::HostPinned), base);
        kiln::sync_stream().unwrap();
        alloc::malloc_trim();
    });
}
