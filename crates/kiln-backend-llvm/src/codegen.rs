//! LLVM IR code generation: the vectorized kernel skeleton and parameter
//! access sequences that fused trace bodies are spliced into.
//!
//! Kernels have the signature `void @kiln_kernel(i32 %start, i32 %end,
//! i8** %params)` and process `width` elements per iteration. The element
//! loop may run a full vector width past `%end`; allocations produced by
//! the allocator are padded so those lanes stay in bounds.

use std::fmt::Write as _;

use kiln::backend::RegClass;
use kiln::VarType;

pub(crate) const ENTRY_NAME: &str = "kiln_kernel";

pub(crate) fn register_class(ty: VarType) -> RegClass {
    let prefix = match ty {
        VarType::Bool => "%p",
        VarType::I8 | VarType::U8 | VarType::I16 | VarType::U16 => "%w",
        VarType::F16 => "%h",
        VarType::I32 | VarType::U32 => "%r",
        VarType::F32 => "%f",
        VarType::I64 | VarType::U64 | VarType::Ptr => "%rd",
        VarType::F64 => "%d",
        VarType::Invalid => panic!("register_class(): invalid type"),
    };
    // SSA values need no declarations; the prefix only keeps names
    // readable and type classes apart.
    RegClass { prefix, decl: "" }
}

/// Scalar value type as it appears in arithmetic.
pub(crate) fn scalar_type(ty: VarType) -> &'static str {
    match ty {
        VarType::I8 | VarType::U8 => "i8",
        VarType::I16 | VarType::U16 => "i16",
        VarType::I32 | VarType::U32 => "i32",
        VarType::I64 | VarType::U64 | VarType::Ptr => "i64",
        VarType::F16 => "half",
        VarType::F32 => "float",
        VarType::F64 => "double",
        VarType::Bool => "i1",
        VarType::Invalid => panic!("scalar_type(): invalid type"),
    }
}

/// Scalar type as it lives in memory (masks are stored as bytes).
fn storage_type(ty: VarType) -> &'static str {
    if ty == VarType::Bool {
        "i8"
    } else {
        scalar_type(ty)
    }
}

fn vec(scalar: &str, width: u32) -> String {
    if width <= 1 {
        scalar.to_string()
    } else {
        format!("<{width} x {scalar}>")
    }
}

/// Value type substituted for `$tN`.
pub(crate) fn type_name(ty: VarType, width: u32) -> String {
    vec(scalar_type(ty), width)
}

/// Generic integer type of matching width, substituted for `$bN`.
pub(crate) fn binary_type_name(ty: VarType, width: u32) -> String {
    let scalar = match ty.size() {
        1 => "i8",
        2 => "i16",
        4 => "i32",
        _ => "i64",
    };
    vec(scalar, width)
}

/// Emits `{reg}_a = {storage}*` pointing at the parameter base.
fn emit_param_base(body: &mut String, reg: &str, ty: VarType, slot: usize) {
    let st = storage_type(ty);
    writeln!(
        body,
        "    {reg}_a0 = getelementptr inbounds i8*, i8** %params, i32 {slot}"
    )
    .unwrap();
    writeln!(body, "    {reg}_a1 = load i8*, i8** {reg}_a0, align 8").unwrap();
    if st == "i8" {
        writeln!(body, "    {reg}_a2 = getelementptr inbounds i8, i8* {reg}_a1, i32 0").unwrap();
    } else {
        writeln!(body, "    {reg}_a2 = bitcast i8* {reg}_a1 to {st}*").unwrap();
    }
}

pub(crate) fn emit_load(
    body: &mut String,
    reg: &str,
    ty: VarType,
    slot: usize,
    broadcast: bool,
    width: u32,
) {
    let st = storage_type(ty);
    let align = ty.size();
    emit_param_base(body, reg, ty, slot);

    let loaded = if ty == VarType::Bool { format!("{reg}_q") } else { reg.to_string() };
    if broadcast {
        if width > 1 {
            writeln!(body, "    {reg}_s = load {st}, {st}* {reg}_a2, align {align}").unwrap();
            writeln!(
                body,
                "    {reg}_i = insertelement <{width} x {st}> undef, {st} {reg}_s, i32 0"
            )
            .unwrap();
            writeln!(
                body,
                "    {loaded} = shufflevector <{width} x {st}> {reg}_i, <{width} x {st}> undef, <{width} x i32> zeroinitializer"
            )
            .unwrap();
        } else {
            writeln!(body, "    {loaded} = load {st}, {st}* {reg}_a2, align {align}").unwrap();
        }
    } else {
        writeln!(
            body,
            "    {reg}_a3 = getelementptr inbounds {st}, {st}* {reg}_a2, i32 %index"
        )
        .unwrap();
        if width > 1 {
            writeln!(
                body,
                "    {reg}_a4 = bitcast {st}* {reg}_a3 to <{width} x {st}>*"
            )
            .unwrap();
            writeln!(
                body,
                "    {loaded} = load <{width} x {st}>, <{width} x {st}>* {reg}_a4, align {align}"
            )
            .unwrap();
        } else {
            writeln!(body, "    {loaded} = load {st}, {st}* {reg}_a3, align {align}").unwrap();
        }
    }

    if ty == VarType::Bool {
        writeln!(
            body,
            "    {reg} = trunc {} {loaded} to {}",
            vec("i8", width),
            vec("i1", width)
        )
        .unwrap();
    }
}

/// A pointer literal travels as the parameter value itself; expose it to
/// arithmetic as an i64.
pub(crate) fn emit_load_ptr(body: &mut String, reg: &str, slot: usize) {
    writeln!(
        body,
        "    {reg}_a0 = getelementptr inbounds i8*, i8** %params, i32 {slot}"
    )
    .unwrap();
    writeln!(body, "    {reg}_a1 = load i8*, i8** {reg}_a0, align 8").unwrap();
    writeln!(body, "    {reg} = ptrtoint i8* {reg}_a1 to i64").unwrap();
}

pub(crate) fn emit_store(body: &mut String, reg: &str, ty: VarType, slot: usize, width: u32) {
    let st = storage_type(ty);
    let align = ty.size();
    emit_param_base(body, reg, ty, slot);
    writeln!(
        body,
        "    {reg}_a3 = getelementptr inbounds {st}, {st}* {reg}_a2, i32 %index"
    )
    .unwrap();

    let stored = if ty == VarType::Bool {
        writeln!(
            body,
            "    {reg}_z = zext {} {reg} to {}",
            vec("i1", width),
            vec("i8", width)
        )
        .unwrap();
        format!("{reg}_z")
    } else {
        reg.to_string()
    };

    if width <= 1 {
        writeln!(body, "    store {st} {stored}, {st}* {reg}_a3, align {align}").unwrap();
    } else {
        writeln!(
            body,
            "    {reg}_a4 = bitcast {st}* {reg}_a3 to <{width} x {st}>*"
        )
        .unwrap();
        writeln!(
            body,
            "    store <{width} x {st}> {stored}, <{width} x {st}>* {reg}_a4, align {align}"
        )
        .unwrap();
    }
}

/// Wraps a body in the vectorized element loop.
pub(crate) fn assemble(body: &str, width: u32, cpu: &str, features: &str) -> String {
    let mut out = String::with_capacity(body.len() + 512);
    writeln!(
        out,
        "define void @{ENTRY_NAME}(i32 %start, i32 %end, i8** noalias %params) #0 {{"
    )
    .unwrap();
    out.push_str(
        "entry:\n\
         \x20   %valid = icmp ult i32 %start, %end\n\
         \x20   br i1 %valid, label %body, label %done\n\
         \n\
         body:\n\
         \x20   %index = phi i32 [ %start, %entry ], [ %index_next, %body ]\n",
    );
    out.push_str(body);
    writeln!(out, "    %index_next = add nuw nsw i32 %index, {width}").unwrap();
    out.push_str(
        "    %again = icmp ult i32 %index_next, %end\n\
         \x20   br i1 %again, label %body, label %done\n\
         \n\
         done:\n\
         \x20   ret void\n\
         }\n\n",
    );
    writeln!(
        out,
        "attributes #0 = {{ nounwind norecurse \"target-cpu\"=\"{cpu}\" \"target-features\"=\"{features}\" }}"
    )
    .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_types_follow_width() {
        assert_eq!(type_name(VarType::F32, 1), "float");
        assert_eq!(type_name(VarType::F32, 8), "<8 x float>");
        assert_eq!(type_name(VarType::Bool, 4), "<4 x i1>");
        assert_eq!(binary_type_name(VarType::F64, 4), "<4 x i64>");
        assert_eq!(binary_type_name(VarType::Bool, 1), "i8");
    }

    #[test]
    fn vector_load_goes_through_element_pointer() {
        let mut body = String::new();
        emit_load(&mut body, "%f5", VarType::F32, 2, false, 8);
        assert!(body.contains("getelementptr inbounds i8*, i8** %params, i32 2"));
        assert!(body.contains("bitcast i8* %f5_a1 to float*"));
        assert!(body.contains("getelementptr inbounds float, float* %f5_a2, i32 %index"));
        assert!(body.contains("%f5 = load <8 x float>, <8 x float>* %f5_a4, align 4"));
    }

    #[test]
    fn broadcast_load_splats() {
        let mut body = String::new();
        emit_load(&mut body, "%f5", VarType::F32, 0, true, 8);
        assert!(body.contains("insertelement <8 x float> undef, float %f5_s, i32 0"));
        assert!(body.contains("shufflevector"));
        assert!(!body.contains("%index"));
    }

    #[test]
    fn masks_round_trip_through_bytes() {
        let mut body = String::new();
        emit_load(&mut body, "%p2", VarType::Bool, 0, false, 4);
        emit_store(&mut body, "%p2", VarType::Bool, 1, 4);
        assert!(body.contains("%p2 = trunc <4 x i8> %p2_q to <4 x i1>"));
        assert!(body.contains("%p2_z = zext <4 x i1> %p2 to <4 x i8>"));
    }

    #[test]
    fn scalar_mode_has_no_vectors() {
        let mut body = String::new();
        emit_load(&mut body, "%r3", VarType::U32, 1, false, 1);
        emit_store(&mut body, "%r3", VarType::U32, 2, 1);
        assert!(!body.contains('<'));
    }

    #[test]
    fn skeleton_steps_by_width() {
        let source = assemble("    ; body\n", 8, "skylake", "+avx2");
        assert!(source.contains("define void @kiln_kernel(i32 %start, i32 %end, i8** noalias %params)"));
        assert!(source.contains("%index = phi i32 [ %start, %entry ], [ %index_next, %body ]"));
        assert!(source.contains("%index_next = add nuw nsw i32 %index, 8"));
        assert!(source.contains("\"target-cpu\"=\"skylake\""));
        assert!(source.contains("\"target-features\"=\"+avx2\""));
    }
}
