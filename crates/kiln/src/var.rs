//! The variable table: reference-counted symbolic expressions.
//!
//! Every recorded operation is a [`Variable`] keyed by a monotonically
//! increasing 32-bit id (id 0 is the reserved null variable). A variable is
//! symbolic while `data == 0` and concrete once evaluation installed a
//! buffer address. Two independent reference counters track who keeps a
//! variable alive:
//!
//! * `ref_count_ext` — references held by the host program,
//! * `ref_count_int` — references held by other variables through `deps`
//!   or `extra_dep`.
//!
//! A variable is destroyed when both reach zero. When only the external
//! count reaches zero the variable is removed from the pending set of the
//! active stream (it will no longer force a kernel on its own) but stays
//! alive while some other pending expression depends on it. This is what
//! lets dead symbolic code disappear without an explicit liveness pass.

use std::borrow::Cow;
use std::fmt::Write as _;

use log::{debug, trace};

use crate::alloc::{self, mem_string, AllocType};
use crate::backend::BackendKind;
use crate::error::{JitError, Result};
use crate::state::{self, State};
use crate::types::VarType;

pub(crate) struct Variable {
    pub kind: BackendKind,
    pub ty: VarType,
    /// Number of elements; size 1 broadcasts against any operand size.
    pub size: u32,
    /// IR statement template; `None` once the variable is concrete.
    pub stmt: Option<Cow<'static, str>>,
    /// Operand ids; 0 marks an absent slot.
    pub deps: [u32; 3],
    /// One additional id kept alive until this variable is evaluated (for
    /// traced variables) or freed (for mapped/copied buffers).
    pub extra_dep: u32,
    /// Buffer address once evaluated, stored as an integer so the table
    /// stays `Send`.
    pub data: usize,
    /// Recursive template-size estimate: 1 + sum over dependencies.
    pub tsize: u32,
    pub ref_count_ext: u32,
    pub ref_count_int: u32,
    /// The variable owns `data` and must release it on destruction.
    pub free_variable: bool,
    /// `data` is a literal address fed to kernels by value.
    pub direct_pointer: bool,
    /// Evaluation is performed for its effect; no output buffer is written.
    pub side_effect: bool,
    /// The underlying memory was modified by a scatter; reads must force
    /// an evaluation first.
    pub dirty: bool,
    pub label: Option<String>,
}

impl Variable {
    /// Whether this variable participates in common subexpression
    /// elimination. Concrete buffers and dirty variables are excluded.
    pub fn cse_eligible(&self) -> bool {
        self.data == 0 && self.stmt.is_some() && !self.dirty
    }

    pub fn key(&self) -> VariableKey {
        VariableKey {
            kind: self.kind,
            ty: self.ty,
            stmt: self.stmt.clone().unwrap_or(Cow::Borrowed("")),
            deps: self.deps,
            size: self.size,
        }
    }
}

/// Structural identity used for common subexpression elimination.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct VariableKey {
    pub kind: BackendKind,
    pub ty: VarType,
    pub stmt: Cow<'static, str>,
    pub deps: [u32; 3],
    pub size: u32,
}

/// Looks up a variable that internal bookkeeping knows must exist.
pub(crate) fn var<'s>(state: &'s State, index: u32) -> &'s Variable {
    state
        .variables
        .get(&index)
        .unwrap_or_else(|| panic!("var({index}): unknown variable"))
}

pub(crate) fn var_mut<'s>(state: &'s mut State, index: u32) -> &'s mut Variable {
    state
        .variables
        .get_mut(&index)
        .unwrap_or_else(|| panic!("var({index}): unknown variable"))
}

fn var_checked<'s>(state: &'s State, index: u32) -> Result<&'s Variable> {
    state
        .variables
        .get(&index)
        .ok_or(JitError::UnknownVariable(index))
}

/// Drops the CSE table entry for `index` if it is present.
pub(crate) fn cse_remove(state: &mut State, index: u32) {
    let key = {
        let v = var(state, index);
        if v.stmt.is_none() {
            return;
        }
        v.key()
    };
    if state.cse.get(&key) == Some(&index) {
        state.cse.remove(&key);
    }
}

pub(crate) fn inc_ref_ext_in(state: &mut State, index: u32) {
    if index == 0 {
        return;
    }
    let v = var_mut(state, index);
    v.ref_count_ext += 1;
    trace!("inc_ref_ext({}) -> {}", index, v.ref_count_ext);
}

pub(crate) fn inc_ref_int_in(state: &mut State, index: u32) {
    if index == 0 {
        return;
    }
    let v = var_mut(state, index);
    v.ref_count_int += 1;
    trace!("inc_ref_int({}) -> {}", index, v.ref_count_int);
}

pub(crate) fn dec_ref_ext_in(state: &mut State, index: u32) -> Result<()> {
    if index == 0 || state.variables.is_empty() {
        return Ok(());
    }
    let v = var_checked(state, index)?;
    if v.ref_count_ext == 0 {
        return Err(JitError::RefCountUnderflow {
            index,
            counter: "external",
        });
    }

    let v = var_mut(state, index);
    v.ref_count_ext -= 1;
    trace!("dec_ref_ext({}) -> {}", index, v.ref_count_ext);
    let (ext, int) = (v.ref_count_ext, v.ref_count_int);

    if ext == 0 {
        if let Ok(key) = state::active_stream_key() {
            if let Some(stream) = state.streams.get_mut(&key) {
                stream.todo.remove(&index);
            }
        }
    }

    if ext == 0 && int == 0 {
        var_free(state, index);
    }
    Ok(())
}

pub(crate) fn dec_ref_int_in(state: &mut State, index: u32) {
    if index == 0 || state.variables.is_empty() {
        return;
    }
    let v = var_mut(state, index);
    if v.ref_count_int == 0 {
        panic!("dec_ref_int({index}): variable has no internal references");
    }
    v.ref_count_int -= 1;
    trace!("dec_ref_int({}) -> {}", index, v.ref_count_int);

    if v.ref_count_int == 0 && v.ref_count_ext == 0 {
        var_free(state, index);
    }
}

/// Destroys a variable whose reference counts both reached zero.
pub(crate) fn var_free(state: &mut State, index: u32) {
    cse_remove(state, index);

    let v = state
        .variables
        .remove(&index)
        .unwrap_or_else(|| panic!("var_free({index}): unknown variable"));
    trace!("var_free({}) = {:#x}", index, v.data);

    if v.free_variable && v.data != 0 {
        alloc::free_in(state, v.data);
    }

    if v.direct_pointer && state.var_from_ptr.remove(&v.data).is_none() {
        panic!("var_free({index}): direct pointer not found");
    }

    for dep in v.deps {
        dec_ref_int_in(state, dep);
    }
    let _ = dec_ref_ext_in(state, v.extra_dep);
}

// ---------------------------------------------------------------------
// Public id-based surface
// ---------------------------------------------------------------------

/// Increases the external reference count of a variable.
pub fn inc_ref_ext(index: u32) -> Result<()> {
    if index == 0 {
        return Ok(());
    }
    let mut state = state::lock();
    var_checked(&state, index)?;
    inc_ref_ext_in(&mut state, index);
    Ok(())
}

/// Decreases the external reference count of a variable, destroying it
/// when no references of either kind remain.
pub fn dec_ref_ext(index: u32) -> Result<()> {
    let mut state = state::lock();
    dec_ref_ext_in(&mut state, index)
}

/// Returns the buffer address of a variable (null while symbolic).
pub fn ptr(index: u32) -> Result<*mut u8> {
    let state = state::lock();
    Ok(var_checked(&state, index)?.data as *mut u8)
}

/// Returns the number of elements of a variable.
pub fn size(index: u32) -> Result<u32> {
    let state = state::lock();
    Ok(var_checked(&state, index)?.size)
}

/// Returns the element type of a variable.
pub fn var_type(index: u32) -> Result<VarType> {
    let state = state::lock();
    Ok(var_checked(&state, index)?.ty)
}

/// Returns the diagnostic label of a variable, if one was assigned.
pub fn label(index: u32) -> Result<Option<String>> {
    let state = state::lock();
    Ok(var_checked(&state, index)?.label.clone())
}

/// Assigns a diagnostic label to a variable.
pub fn set_label(index: u32, label: &str) -> Result<()> {
    let mut state = state::lock();
    var_checked(&state, index)?;
    var_mut(&mut state, index).label = Some(label.to_string());
    debug!("set_label({}) -> \"{}\"", index, label);
    Ok(())
}

/// Marks a variable as having side effects: evaluation executes the
/// statement even though nothing reads its result.
pub fn mark_side_effect(index: u32) -> Result<()> {
    let mut state = state::lock();
    var_checked(&state, index)?;
    debug!("mark_side_effect({index})");
    var_mut(&mut state, index).side_effect = true;
    Ok(())
}

/// Marks the memory region underlying a variable as dirty. Subsequent
/// reads of the variable force an evaluation so that scattered writes are
/// ordered before them. A dirty variable leaves the CSE table until its
/// next evaluation; it is structurally identical to its clean form but
/// must not be deduplicated against it.
pub fn mark_dirty(index: u32) -> Result<()> {
    let mut state = state::lock();
    var_checked(&state, index)?;
    debug!("mark_dirty({index})");
    cse_remove(&mut state, index);
    var_mut(&mut state, index).dirty = true;
    Ok(())
}

/// Attaches an extra dependency: `dep` is kept alive until `index` has
/// been evaluated (symbolic variables) or freed (mapped/copied buffers).
/// Setting a new extra dependency releases the previous one.
pub fn set_extra_dep(index: u32, dep: u32) -> Result<()> {
    let mut state = state::lock();
    var_checked(&state, index)?;
    if dep != 0 {
        var_checked(&state, dep)?;
    }
    let previous = {
        let v = var_mut(&mut state, index);
        std::mem::replace(&mut v.extra_dep, dep)
    };
    inc_ref_ext_in(&mut state, dep);
    dec_ref_ext_in(&mut state, previous)?;
    trace!("set_extra_dep({index}, {dep})");
    Ok(())
}

/// Constant-propagation helper: true when the variable is an unevaluated
/// mask whose statement is the literal all-ones mask.
pub fn is_all_true(index: u32) -> Result<bool> {
    mask_literal_matches(index, true)
}

/// Constant-propagation helper: true when the variable is an unevaluated
/// mask whose statement is the literal all-zeros mask.
pub fn is_all_false(index: u32) -> Result<bool> {
    mask_literal_matches(index, false)
}

fn mask_literal_matches(index: u32, value: bool) -> Result<bool> {
    let state = state::lock();
    let v = var_checked(&state, index)?;
    if v.ty != VarType::Bool || v.data != 0 {
        return Ok(false);
    }
    let backend = match state.backend(v.kind) {
        Some(b) => b,
        None => return Ok(false),
    };
    Ok(v.stmt.as_deref() == Some(backend.mask_literal(value)))
}

/// Asynchronously migrates the buffer of an evaluated variable to a
/// different flavor of memory; forces evaluation first when necessary.
pub fn migrate(index: u32, ty: AllocType) -> Result<()> {
    if index == 0 {
        return Ok(());
    }
    {
        let state = state::lock();
        let v = var_checked(&state, index)?;
        if v.data == 0 || v.dirty {
            drop(state);
            crate::eval::eval()?;
        }
    }
    let data = {
        let state = state::lock();
        var_checked(&state, index)?.data
    };
    debug!("migrate({}, {:#x}) -> {}", index, data, ty.name());
    let migrated = alloc::malloc_migrate(data as *mut u8, ty)? as usize;
    let mut state = state::lock();
    var_mut(&mut state, index).data = migrated;
    Ok(())
}

/// Reads a single element at `offset` into `dst`, synchronizing with the
/// device. `dst` must be exactly one element wide.
pub fn read(index: u32, offset: u32, dst: &mut [u8]) -> Result<()> {
    let (ty, data, kind) = prepare_access(index, offset, dst.len())?;
    let tsize = ty.size();
    let src = data + offset as usize * tsize;
    copy_with_backend(kind, dst.as_mut_ptr() as usize, src, tsize)
}

/// Writes a single element at `offset` from `src`, synchronizing with the
/// device. `src` must be exactly one element wide.
pub fn write(index: u32, offset: u32, src: &[u8]) -> Result<()> {
    let (ty, data, kind) = prepare_access(index, offset, src.len())?;
    let tsize = ty.size();
    let dst = data + offset as usize * tsize;
    copy_with_backend(kind, dst, src.as_ptr() as usize, tsize)
}

fn prepare_access(index: u32, offset: u32, len: usize) -> Result<(VarType, usize, BackendKind)> {
    crate::eval::var_eval(index)?;
    crate::sync_stream()?;

    let state = state::lock();
    let v = var_checked(&state, index)?;
    assert!(offset < v.size, "element access out of bounds");
    assert_eq!(len, v.ty.size(), "element buffer has the wrong width");
    if v.data == 0 {
        // Possible when the variable left the pending set before any
        // evaluation covered it.
        return Err(JitError::UnknownVariable(index));
    }
    Ok((v.ty, v.data, v.kind))
}

fn copy_with_backend(kind: BackendKind, dst: usize, src: usize, bytes: usize) -> Result<()> {
    let backend = {
        let state = state::lock();
        state.backend(kind).ok_or(JitError::UninitializedStream)?
    };
    backend.memcpy(dst, src, bytes)
}

/// Renders the contents of a variable as `[a, b, c, ...]`, forcing
/// evaluation and synchronization.
pub fn to_str(index: u32) -> Result<String> {
    crate::eval::var_eval(index)?;
    crate::sync_stream()?;

    let (ty, size, data, kind) = {
        let state = state::lock();
        let v = var_checked(&state, index)?;
        if v.data == 0 {
            return Err(JitError::UnknownVariable(index));
        }
        (v.ty, v.size, v.data, v.kind)
    };

    let tsize = ty.size();
    let mut bytes = vec![0u8; size as usize * tsize];
    copy_with_backend(kind, bytes.as_mut_ptr() as usize, data, bytes.len())?;

    let mut out = String::from("[");
    for i in 0..size as usize {
        if i > 0 {
            out.push_str(", ");
        }
        format_element(&mut out, ty, &bytes[i * tsize..(i + 1) * tsize]);
    }
    out.push(']');
    Ok(out)
}

fn format_element(out: &mut String, ty: VarType, raw: &[u8]) {
    match ty {
        VarType::I8 => write!(out, "{}", raw[0] as i8).unwrap(),
        VarType::U8 => write!(out, "{}", raw[0]).unwrap(),
        VarType::I16 => write!(out, "{}", i16::from_ne_bytes([raw[0], raw[1]])).unwrap(),
        VarType::U16 => write!(out, "{}", u16::from_ne_bytes([raw[0], raw[1]])).unwrap(),
        VarType::I32 => write!(out, "{}", i32::from_ne_bytes(raw.try_into().unwrap())).unwrap(),
        VarType::U32 => write!(out, "{}", u32::from_ne_bytes(raw.try_into().unwrap())).unwrap(),
        VarType::I64 => write!(out, "{}", i64::from_ne_bytes(raw.try_into().unwrap())).unwrap(),
        VarType::U64 | VarType::Ptr => {
            write!(out, "{}", u64::from_ne_bytes(raw.try_into().unwrap())).unwrap()
        }
        VarType::F16 => {
            let bits = u16::from_ne_bytes([raw[0], raw[1]]);
            write!(out, "{}", f16_to_f32(bits)).unwrap()
        }
        VarType::F32 => write!(out, "{}", f32::from_ne_bytes(raw.try_into().unwrap())).unwrap(),
        VarType::F64 => write!(out, "{}", f64::from_ne_bytes(raw.try_into().unwrap())).unwrap(),
        VarType::Bool => write!(out, "{}", if raw[0] != 0 { 1 } else { 0 }).unwrap(),
        VarType::Invalid => out.push('?'),
    }
}

/// Widens an IEEE binary16 value for display.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let frac = u32::from(bits & 0x3ff);
    let out = if exp == 0 {
        if frac == 0 {
            sign
        } else {
            // Subnormal: renormalize.
            let shift = frac.leading_zeros() - 21;
            let frac = (frac << (shift + 1)) & 0x3ff;
            sign | ((113 - shift) << 23) | (frac << 13)
        }
    } else if exp == 0x1f {
        sign | 0x7f80_0000 | (frac << 13)
    } else {
        sign | ((exp + 112) << 23) | (frac << 13)
    };
    f32::from_bits(out)
}

/// Human-readable summary of all registered variables and memory usage.
pub fn whos() -> String {
    let state = state::lock();

    let mut out = String::new();
    out.push_str("\n  ID        Type   E/I Refs   Size        Memory     Ready    Label");
    out.push_str("\n  =================================================================\n");

    let mut indices: Vec<u32> = state.variables.keys().copied().collect();
    indices.sort_unstable();

    let mut mem_ready = 0usize;
    let mut mem_scheduled = 0usize;
    let mut mem_arith = 0usize;

    for index in indices {
        let v = var(&state, index);
        let mem = v.size as usize * if v.ty == VarType::Invalid { 0 } else { v.ty.size() };
        let refs = format!("{} / {}", v.ref_count_ext, v.ref_count_int);
        writeln!(
            out,
            "  {:<9} {:<6} {:<10} {:<11} {:<10} [{}]      {}",
            index,
            v.ty.name(),
            refs,
            v.size,
            mem_string(mem),
            if v.data != 0 { 'x' } else { ' ' },
            v.label.as_deref().unwrap_or("")
        )
        .unwrap();

        if v.data != 0 {
            mem_ready += mem;
        } else if v.ref_count_ext == 0 {
            mem_arith += mem;
        } else {
            mem_scheduled += mem;
        }
    }

    out.push_str("  =================================================================\n\n");
    out.push_str("  JIT compiler\n  ============\n");
    writeln!(out, "   - Memory usage (ready)     : {}.", mem_string(mem_ready)).unwrap();
    writeln!(
        out,
        "   - Memory usage (scheduled) : {} + {} = {}.",
        mem_string(mem_ready),
        mem_string(mem_scheduled),
        mem_string(mem_ready + mem_scheduled)
    )
    .unwrap();
    writeln!(out, "   - Memory savings           : {}.\n", mem_string(mem_arith)).unwrap();

    out.push_str("  Memory allocator\n  ================\n");
    for (i, ty) in AllocType::ALL.iter().enumerate() {
        writeln!(
            out,
            "   - {:<20}: {} used (max. {}).",
            ty.name(),
            mem_string(state.alloc_usage[i]),
            mem_string(state.alloc_watermark[i])
        )
        .unwrap();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::f16_to_f32;

    #[test]
    fn f16_widening() {
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x3800), 0.5);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!(f16_to_f32(0x7c00).is_infinite());
    }
}
