//! Trace builder behavior: CSE, reference counting, shape rules, and the
//! dirty-read ordering guarantee.

mod common;

use kiln::alloc::AllocType;
use kiln::{trace, var, JitError, VarType};

#[test]
fn identical_statements_are_deduplicated() {
    common::with_session(|_| {
        let a = trace::append_0(VarType::F32, "$r0 = const(0.5)", 1).unwrap();
        let b = trace::append_0(VarType::F32, "$r0 = const(0.5)", 1).unwrap();
        assert_eq!(a, b, "structurally identical statements share one id");

        // The reuse bumped the external count to 2: the variable survives
        // one release and disappears after the second.
        var::dec_ref_ext(a).unwrap();
        assert!(var::size(a).is_ok());
        var::dec_ref_ext(a).unwrap();
        assert!(matches!(var::size(a), Err(JitError::UnknownVariable(_))));

        let c = trace::append_0(VarType::F32, "$r0 = const(0.25)", 1).unwrap();
        let d = trace::append_0(VarType::F64, "$r0 = const(0.25)", 1).unwrap();
        assert_ne!(c, d, "the type participates in structural identity");
        var::dec_ref_ext(c).unwrap();
        var::dec_ref_ext(d).unwrap();
    });
}

#[test]
fn dedup_covers_operands_and_size() {
    common::with_session(|_| {
        let x = trace::append_0(VarType::U32, "$r0 = index()", 10).unwrap();
        let y = trace::append_0(VarType::U32, "$r0 = const(1)", 1).unwrap();

        let s1 = trace::append_2(VarType::U32, "$r0 = add($r1, $r2)", x, y).unwrap();
        let s2 = trace::append_2(VarType::U32, "$r0 = add($r1, $r2)", x, y).unwrap();
        let s3 = trace::append_2(VarType::U32, "$r0 = add($r1, $r2)", y, x).unwrap();
        assert_eq!(s1, s2);
        assert_ne!(s1, s3, "operand order participates in structural identity");

        for id in [s1, s2, s3, x, y] {
            var::dec_ref_ext(id).unwrap();
        }
    });
}

#[test]
fn broadcast_and_shape_rules() {
    common::with_session(|_| {
        let big = trace::append_0(VarType::F32, "$r0 = index()", 10).unwrap();
        let scalar = trace::append_0(VarType::F32, "$r0 = const(2)", 1).unwrap();
        let wrong = trace::append_0(VarType::F32, "$r0 = index()", 3).unwrap();

        let ok = trace::append_2(VarType::F32, "$r0 = mul($r1, $r2)", big, scalar).unwrap();
        assert_eq!(var::size(ok).unwrap(), 10, "scalars broadcast to the result size");

        let err = trace::append_2(VarType::F32, "$r0 = mul($r1, $r2)", big, wrong);
        assert!(matches!(err, Err(JitError::ShapeMismatch { .. })));

        let err = trace::append_1(VarType::F32, "$r0 = neg($r1)", 0);
        assert!(matches!(err, Err(JitError::NullOperand)));

        for id in [ok, big, scalar, wrong] {
            var::dec_ref_ext(id).unwrap();
        }
    });
}

#[test]
fn internal_references_keep_operands_alive() {
    common::with_session(|_| {
        let a = trace::append_0(VarType::U32, "$r0 = const(7)", 1).unwrap();
        let b = trace::append_1(VarType::U32, "$r0 = neg($r1)", a).unwrap();

        // Dropping the host reference leaves `a` alive through the edge
        // from `b`.
        var::dec_ref_ext(a).unwrap();
        assert!(var::size(a).is_ok());

        // A second host-side release has nothing left to release.
        assert!(matches!(
            var::dec_ref_ext(a),
            Err(JitError::RefCountUnderflow { .. })
        ));

        // Releasing `b` tears both down.
        var::dec_ref_ext(b).unwrap();
        assert!(var::size(a).is_err());
        assert!(var::size(b).is_err());
    });
}

#[test]
fn refcount_round_trip_is_neutral() {
    common::with_session(|_| {
        let a = trace::append_0(VarType::U32, "$r0 = const(3)", 1).unwrap();
        for _ in 0..5 {
            var::inc_ref_ext(a).unwrap();
        }
        for _ in 0..5 {
            var::dec_ref_ext(a).unwrap();
        }
        assert!(var::size(a).is_ok(), "balanced inc/dec leaves the variable intact");
        var::dec_ref_ext(a).unwrap();
        assert!(var::size(a).is_err());
    });
}

#[test]
fn appends_require_an_active_stream() {
    common::with_session(|_| {
        let result = std::thread::spawn(|| {
            // This thread never called device_set.
            trace::append_0(VarType::F32, "$r0 = const(1)", 1)
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(JitError::UninitializedStream)));
    });
}

#[test]
fn pointer_literals_are_shared_per_address() {
    common::with_session(|_| {
        let buffer = [0u8; 64];
        let p1 = trace::register_ptr(buffer.as_ptr()).unwrap();
        let p2 = trace::register_ptr(buffer.as_ptr()).unwrap();
        assert_eq!(p1, p2, "one pointer-literal variable per distinct address");
        assert_eq!(var::var_type(p1).unwrap(), VarType::Ptr);

        var::dec_ref_ext(p1).unwrap();
        assert!(var::size(p1).is_ok(), "second reference still holds it");
        var::dec_ref_ext(p2).unwrap();
        assert!(var::size(p1).is_err());
    });
}

#[test]
fn set_size_reshapes_or_copies() {
    common::with_session(|stats| {
        // Symbolic, unreferenced: resized in place.
        let a = trace::append_0(VarType::U32, "$r0 = index()", 1).unwrap();
        let a2 = trace::set_size(a, 16, false).unwrap();
        assert_eq!(a, a2);
        assert_eq!(var::size(a).unwrap(), 16);
        var::dec_ref_ext(a).unwrap();

        // Materialized scalar: a copy is inserted when allowed.
        let s = trace::append_0(VarType::U32, "$r0 = const(9)", 1).unwrap();
        kiln::eval().unwrap();
        assert!(!var::ptr(s).unwrap().is_null());
        assert!(matches!(
            trace::set_size(s, 8, false),
            Err(JitError::InvalidResize { .. })
        ));
        let copied = trace::set_size(s, 8, true).unwrap();
        assert_ne!(copied, s);
        assert_eq!(var::size(copied).unwrap(), 8);
        let source_count = stats.compile_count();
        kiln::eval().unwrap();
        assert!(stats.compile_count() > source_count, "the copy compiles a kernel");
        var::dec_ref_ext(copied).unwrap();

        // Materialized non-scalar: always rejected.
        let v = trace::append_0(VarType::U32, "$r0 = index()", 4).unwrap();
        kiln::eval().unwrap();
        assert!(matches!(
            trace::set_size(v, 8, true),
            Err(JitError::InvalidResize { .. })
        ));
        var::dec_ref_ext(v).unwrap();
    });
}

#[test]
fn dirty_reads_force_a_single_evaluation() {
    common::with_session(|stats| {
        let target = kiln::alloc::malloc(AllocType::HostPinned, 8 * 4).unwrap();
        let buf = trace::register(VarType::U32, target, 8, true).unwrap();
        let buf_ptr = trace::register_ptr(var::ptr(buf).unwrap()).unwrap();

        let index = trace::append_0(VarType::U32, "$r0 = index()", 8).unwrap();
        let one = trace::append_0(VarType::U32, "$r0 = const(1)", 1).unwrap();

        trace::set_scatter_gather_operand(buf).unwrap();
        let scatter = trace::append_3(
            VarType::U32,
            "scatter($r1, $r2, $r3)",
            buf_ptr,
            index,
            one,
        )
        .unwrap();
        trace::set_scatter_gather_operand(0).unwrap();
        var::mark_side_effect(scatter).unwrap();
        var::mark_dirty(buf).unwrap();

        // The intermediate expressions live on through the scatter; with
        // their host references dropped the pending set holds one root.
        var::dec_ref_ext(index).unwrap();
        var::dec_ref_ext(one).unwrap();

        // Reading the dirty buffer must trigger exactly one evaluation
        // (one fused kernel) before the new statement is recorded.
        let launches = stats.launch_count();
        let read = trace::append_1(VarType::U32, "$r0 = id($r1)", buf).unwrap();
        assert_eq!(stats.launch_count(), launches + 1);

        // The scatter executed; the buffer is clean again and further
        // reads do not evaluate.
        let launches = stats.launch_count();
        let read2 = trace::append_1(VarType::U32, "$r0 = id($r1)", buf).unwrap();
        assert_eq!(stats.launch_count(), launches);

        for id in [read, read2, scatter, buf_ptr, buf] {
            var::dec_ref_ext(id).unwrap();
        }
        kiln::eval().unwrap();
    });
}

#[test]
fn mask_literals_constant_propagate() {
    common::with_session(|_| {
        let t = trace::append_0(VarType::Bool, "$r0 = mask_all_ones()", 4).unwrap();
        let f = trace::append_0(VarType::Bool, "$r0 = mask_all_zeros()", 4).unwrap();
        let other = trace::append_0(VarType::Bool, "$r0 = cmp()", 4).unwrap();

        assert!(var::is_all_true(t).unwrap());
        assert!(!var::is_all_false(t).unwrap());
        assert!(var::is_all_false(f).unwrap());
        assert!(!var::is_all_true(other).unwrap());

        // Materialized masks are no longer recognizable.
        kiln::eval().unwrap();
        assert!(!var::is_all_true(t).unwrap());

        for id in [t, f, other] {
            var::dec_ref_ext(id).unwrap();
        }
    });
}

#[test]
fn labels_round_trip() {
    common::with_session(|_| {
        let a = trace::append_0(VarType::F32, "$r0 = const(1)", 1).unwrap();
        assert_eq!(var::label(a).unwrap(), None);
        var::set_label(a, "loss").unwrap();
        assert_eq!(var::label(a).unwrap().as_deref(), Some("loss"));
        assert!(var::whos().contains("loss"));
        var::dec_ref_ext(a).unwrap();
    });
}
