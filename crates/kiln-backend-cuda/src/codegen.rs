//! PTX code generation: register classes, type names, parameter access,
//! and the grid-stride kernel skeleton that fused trace bodies are
//! spliced into.
//!
//! Register conventions: the skeleton reserves `%r0` (element count),
//! `%r1` (linear index), `%r2` (grid stride), `%r3` (scratch), `%rd0`/
//! `%rd1` (address arithmetic), `%p0` (loop predicate) and `%w0` (mask
//! load/store scratch). Trace registers are numbered after the reserved
//! range by the core.

use std::fmt::Write as _;

use kiln::backend::RegClass;
use kiln::VarType;

pub(crate) const ENTRY_NAME: &str = "kiln_kernel";

pub(crate) fn register_class(ty: VarType) -> RegClass {
    match ty {
        VarType::Bool => RegClass { prefix: "%p", decl: ".pred" },
        VarType::I8 | VarType::U8 | VarType::I16 | VarType::U16 => {
            RegClass { prefix: "%w", decl: ".b16" }
        }
        VarType::F16 => RegClass { prefix: "%h", decl: ".b16" },
        VarType::I32 | VarType::U32 => RegClass { prefix: "%r", decl: ".b32" },
        VarType::F32 => RegClass { prefix: "%f", decl: ".f32" },
        VarType::I64 | VarType::U64 | VarType::Ptr => RegClass { prefix: "%rd", decl: ".b64" },
        VarType::F64 => RegClass { prefix: "%d", decl: ".f64" },
        VarType::Invalid => panic!("register_class(): invalid type"),
    }
}

pub(crate) fn reserved_registers(class: RegClass) -> u32 {
    match class.prefix {
        "%r" => 4,
        "%rd" => 2,
        "%p" => 1,
        "%w" => 1,
        _ => 0,
    }
}

pub(crate) fn type_name(ty: VarType) -> &'static str {
    match ty {
        VarType::I8 => "s8",
        VarType::U8 => "u8",
        VarType::I16 => "s16",
        VarType::U16 => "u16",
        VarType::I32 => "s32",
        VarType::U32 => "u32",
        VarType::I64 => "s64",
        VarType::U64 => "u64",
        VarType::F16 => "f16",
        VarType::F32 => "f32",
        VarType::F64 => "f64",
        VarType::Bool => "pred",
        VarType::Ptr => "u64",
        VarType::Invalid => panic!("type_name(): invalid type"),
    }
}

pub(crate) fn binary_type_name(ty: VarType) -> &'static str {
    match ty {
        VarType::I8 | VarType::U8 | VarType::Bool => "b8",
        VarType::I16 | VarType::U16 | VarType::F16 => "b16",
        VarType::I32 | VarType::U32 | VarType::F32 => "b32",
        VarType::I64 | VarType::U64 | VarType::F64 | VarType::Ptr => "b64",
        VarType::Invalid => panic!("binary_type_name(): invalid type"),
    }
}

/// Emits `%rd0 <- &params[slot][index]` (or the base address for
/// broadcast scalars).
fn emit_address(body: &mut String, ty: VarType, slot: usize, broadcast: bool) {
    writeln!(body, "    ld.param.u64 %rd0, [params+{}];", slot * 8).unwrap();
    if !broadcast {
        writeln!(body, "    mul.wide.u32 %rd1, %r1, {};", ty.size()).unwrap();
        body.push_str("    add.u64 %rd0, %rd0, %rd1;\n");
    }
}

pub(crate) fn emit_load(body: &mut String, reg: &str, ty: VarType, slot: usize, broadcast: bool) {
    emit_address(body, ty, slot, broadcast);
    if ty == VarType::Bool {
        // Masks are stored as bytes; widen through a b16 scratch register.
        body.push_str("    ld.global.cs.u8 %w0, [%rd0];\n");
        writeln!(body, "    setp.ne.u16 {}, %w0, 0;", reg).unwrap();
    } else {
        writeln!(body, "    ld.global.cs.{} {}, [%rd0];", load_store_type(ty), reg).unwrap();
    }
}

pub(crate) fn emit_load_ptr(body: &mut String, reg: &str, slot: usize) {
    // A pointer literal travels as the parameter value itself.
    writeln!(body, "    ld.param.u64 {}, [params+{}];", reg, slot * 8).unwrap();
}

pub(crate) fn emit_store(body: &mut String, reg: &str, ty: VarType, slot: usize) {
    emit_address(body, ty, slot, false);
    if ty == VarType::Bool {
        writeln!(body, "    selp.u16 %w0, 1, 0, {};", reg).unwrap();
        body.push_str("    st.global.cs.u8 [%rd0], %w0;\n");
    } else {
        writeln!(body, "    st.global.cs.{} [%rd0], {};", load_store_type(ty), reg).unwrap();
    }
}

/// PTX memory instructions use the binary spelling for half floats.
fn load_store_type(ty: VarType) -> &'static str {
    match ty {
        VarType::F16 => "b16",
        other => type_name(other),
    }
}

/// Wraps a body in the grid-stride loop skeleton.
pub(crate) fn assemble(
    compute_capability: u32,
    body: &str,
    n_params: usize,
    reg_counts: &[(RegClass, u32)],
) -> String {
    let mut out = String::with_capacity(body.len() + 1024);
    out.push_str(".version 6.3\n");
    writeln!(out, ".target sm_{}", compute_capability).unwrap();
    out.push_str(".address_size 64\n\n");
    writeln!(
        out,
        ".visible .entry {}(.param .u32 size, .param .align 8 .b8 params[{}]) {{",
        ENTRY_NAME,
        n_params.max(1) * 8
    )
    .unwrap();

    for &(class, count) in reg_counts {
        writeln!(out, "    .reg {} {}<{}>;", class.decl, class.prefix, count).unwrap();
    }
    // The skeleton's own registers must exist even when the body uses
    // none of their class.
    for (prefix, decl, reserved) in
        [("%r", ".b32", 4u32), ("%rd", ".b64", 2), ("%p", ".pred", 1), ("%w", ".b16", 1)]
    {
        if !reg_counts.iter().any(|(class, _)| class.prefix == prefix) {
            writeln!(out, "    .reg {} {}<{}>;", decl, prefix, reserved).unwrap();
        }
    }

    out.push_str(
        "\n    ld.param.u32 %r0, [size];\n\
         \x20   mov.u32 %r1, %ctaid.x;\n\
         \x20   mov.u32 %r2, %ntid.x;\n\
         \x20   mov.u32 %r3, %tid.x;\n\
         \x20   mad.lo.u32 %r1, %r1, %r2, %r3;\n\
         \x20   setp.ge.u32 %p0, %r1, %r0;\n\
         \x20   @%p0 bra done;\n\
         \n\
         \x20   mov.u32 %r3, %nctaid.x;\n\
         \x20   mul.lo.u32 %r2, %r2, %r3;\n\
         \n\
         body:\n",
    );
    out.push_str(body);
    out.push_str(
        "\n    add.u32 %r1, %r1, %r2;\n\
         \x20   setp.lt.u32 %p0, %r1, %r0;\n\
         \x20   @%p0 bra body;\n\
         \n\
         done:\n\
         \x20   ret;\n\
         }\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_classes_do_not_collide() {
        let int32 = register_class(VarType::I32);
        let f32 = register_class(VarType::F32);
        let mask = register_class(VarType::Bool);
        assert_ne!(int32.prefix, f32.prefix);
        assert_ne!(f32.prefix, mask.prefix);
        assert_eq!(register_class(VarType::U32), int32);
        assert_eq!(register_class(VarType::Ptr).prefix, "%rd");
    }

    #[test]
    fn load_scales_by_element_size() {
        let mut body = String::new();
        emit_load(&mut body, "%f4", VarType::F32, 2, false);
        assert!(body.contains("ld.param.u64 %rd0, [params+16];"));
        assert!(body.contains("mul.wide.u32 %rd1, %r1, 4;"));
        assert!(body.contains("ld.global.cs.f32 %f4, [%rd0];"));
    }

    #[test]
    fn broadcast_load_skips_indexing() {
        let mut body = String::new();
        emit_load(&mut body, "%f4", VarType::F32, 0, true);
        assert!(!body.contains("mul.wide.u32"));
    }

    #[test]
    fn mask_round_trips_through_bytes() {
        let mut body = String::new();
        emit_load(&mut body, "%p3", VarType::Bool, 0, false);
        emit_store(&mut body, "%p3", VarType::Bool, 1);
        assert!(body.contains("setp.ne.u16 %p3, %w0, 0;"));
        assert!(body.contains("selp.u16 %w0, 1, 0, %p3;"));
        assert!(body.contains("st.global.cs.u8 [%rd0], %w0;"));
    }

    #[test]
    fn skeleton_contains_grid_stride_loop() {
        let source = assemble(75, "    add.f32 %f4, %f4, %f4;\n", 2, &[]);
        assert!(source.starts_with(".version"));
        assert!(source.contains(".target sm_75"));
        assert!(source.contains(".param .align 8 .b8 params[16]"));
        assert!(source.contains("mad.lo.u32 %r1, %r1, %r2, %r3;"));
        assert!(source.contains("@%p0 bra body;"));
        assert!(source.contains("ret;"));
    }
}
