//! The trace builder: appends statements to the instruction trace.
//!
//! Appending is cheap and non-blocking: a statement becomes a variable in
//! the table, is offered to the CSE cache, and joins the pending set of the
//! active stream. The single exception is an append whose operand is dirty
//! (its memory was modified by a scatter), which forces an evaluation so
//! the write is ordered before the read.

use std::borrow::Cow;

use log::debug;

use crate::backend::BackendKind;
use crate::error::{JitError, Result};
use crate::state;
use crate::types::VarType;
use crate::var::{
    self, cse_remove, dec_ref_ext_in, inc_ref_ext_in, inc_ref_int_in, Variable,
};

/// Appends a statement with no operands. `size` is the number of elements
/// of the resulting variable.
pub fn append_0(
    ty: VarType,
    stmt: impl Into<Cow<'static, str>>,
    size: u32,
) -> Result<u32> {
    append(ty, stmt.into(), &[], Some(size))
}

/// Appends a statement with one operand.
pub fn append_1(ty: VarType, stmt: impl Into<Cow<'static, str>>, op1: u32) -> Result<u32> {
    append(ty, stmt.into(), &[op1], None)
}

/// Appends a statement with two operands.
pub fn append_2(
    ty: VarType,
    stmt: impl Into<Cow<'static, str>>,
    op1: u32,
    op2: u32,
) -> Result<u32> {
    append(ty, stmt.into(), &[op1, op2], None)
}

/// Appends a statement with three operands.
pub fn append_3(
    ty: VarType,
    stmt: impl Into<Cow<'static, str>>,
    op1: u32,
    op2: u32,
    op3: u32,
) -> Result<u32> {
    append(ty, stmt.into(), &[op1, op2, op3], None)
}

/// Declares the buffer that an upcoming scatter/atomic-update statement on
/// this thread writes through. The next 3-operand append whose statement
/// the backend classifies as a store pins this variable as its extra
/// dependency, so the buffer outlives the write even if the host drops its
/// own reference. Pass 0 to clear.
pub fn set_scatter_gather_operand(index: u32) -> Result<()> {
    if index != 0 {
        let state = state::lock();
        if !state.variables.contains_key(&index) {
            return Err(JitError::UnknownVariable(index));
        }
    }
    state::set_scatter_operand(index);
    Ok(())
}

fn append(
    ty: VarType,
    stmt: Cow<'static, str>,
    deps: &[u32],
    size_override: Option<u32>,
) -> Result<u32> {
    // Reads of dirty operands must observe earlier scatters; evaluate
    // before recording the new statement.
    let needs_eval = {
        let state = state::lock();
        state::active_stream_key()?;
        let mut dirty = false;
        for &dep in deps {
            if dep == 0 {
                return Err(JitError::NullOperand);
            }
            let v = state
                .variables
                .get(&dep)
                .ok_or(JitError::UnknownVariable(dep))?;
            dirty |= v.dirty;
        }
        dirty
    };
    if needs_eval {
        crate::eval::eval()?;
    }

    let mut state = state::lock();
    let key = state::active_stream_key()?;
    state.stream(key)?;
    let kind = if key.0 < 0 {
        BackendKind::Llvm
    } else {
        BackendKind::Cuda
    };
    let backend = state.backend_for_device(key.0)?;

    let mut size = size_override.unwrap_or(1);
    let mut tsize = 1u32;
    let mut dep_arr = [0u32; 3];
    let mut sizes = Vec::with_capacity(deps.len());
    for (slot, &dep) in dep_arr.iter_mut().zip(deps) {
        let v = state
            .variables
            .get(&dep)
            .ok_or(JitError::UnknownVariable(dep))?;
        *slot = dep;
        sizes.push(v.size);
        size = size.max(v.size);
        tsize = tsize.saturating_add(v.tsize);
    }
    if sizes.iter().any(|&s| s != 1 && s != size) {
        return Err(JitError::ShapeMismatch {
            stmt: stmt.into_owned(),
            sizes,
        });
    }
    if needs_eval {
        // Dependencies are now materialized parameters.
        tsize = deps.len() as u32 + 1;
    }

    // Flush-to-zero is only meaningful for single precision; strip the
    // modifier when the statement was reused for another type.
    let stmt = if kind == BackendKind::Cuda && ty != VarType::F32 && stmt.contains(".ftz") {
        Cow::Owned(stmt.replace(".ftz", ""))
    } else {
        stmt
    };

    let v = Variable {
        kind,
        ty,
        size,
        stmt: Some(stmt),
        deps: dep_arr,
        extra_dep: 0,
        data: 0,
        tsize,
        ref_count_ext: 0,
        ref_count_int: 0,
        free_variable: false,
        direct_pointer: false,
        side_effect: false,
        dirty: false,
        label: None,
    };

    // Structural dedup against pending statements.
    if v.cse_eligible() {
        if let Some(&existing) = state.cse.get(&v.key()) {
            inc_ref_ext_in(&mut state, existing);
            debug!(
                "trace::append({} <- {:?}): {} (reused)",
                existing,
                deps,
                var::var(&state, existing).stmt.as_deref().unwrap_or("")
            );
            return Ok(existing);
        }
    }

    let mut v = v;
    if deps.len() == 3 && backend.is_scatter_stmt(v.stmt.as_deref().unwrap_or("")) {
        let target = state::scatter_operand();
        if target != 0 && state.variables.contains_key(&target) {
            v.extra_dep = target;
            inc_ref_ext_in(&mut state, target);
        }
    }

    let index = state.variable_index;
    state.variable_index += 1;

    for &dep in deps {
        inc_ref_int_in(&mut state, dep);
    }
    if v.cse_eligible() {
        state.cse.insert(v.key(), index);
    }
    debug!(
        "trace::append({} <- {:?}): {}",
        index,
        deps,
        v.stmt.as_deref().unwrap_or("")
    );
    state.variables.insert(index, v);
    inc_ref_ext_in(&mut state, index);
    state.stream_mut(key)?.todo.insert(index);

    Ok(index)
}

/// Registers an existing memory region as a variable. With `free` set the
/// JIT takes ownership and releases the buffer through the allocator when
/// the variable is destroyed. The external reference count starts at 1.
pub fn register(ty: VarType, ptr: *mut u8, size: u32, free: bool) -> Result<u32> {
    if size == 0 {
        return Err(JitError::ShapeMismatch {
            stmt: "register".into(),
            sizes: vec![0],
        });
    }
    let mut state = state::lock();
    let key = state::active_stream_key()?;
    state.stream(key)?;
    let kind = if key.0 < 0 {
        BackendKind::Llvm
    } else {
        BackendKind::Cuda
    };

    let index = state.variable_index;
    state.variable_index += 1;
    state.variables.insert(
        index,
        Variable {
            kind,
            ty,
            size,
            stmt: None,
            deps: [0; 3],
            extra_dep: 0,
            data: ptr as usize,
            tsize: 1,
            ref_count_ext: 0,
            ref_count_int: 0,
            free_variable: free,
            direct_pointer: false,
            side_effect: false,
            dirty: false,
            label: None,
        },
    );
    inc_ref_ext_in(&mut state, index);
    debug!(
        "trace::register({}): {:#x}, size={}, free={}",
        index, ptr as usize, size, free
    );
    Ok(index)
}

/// Registers a pointer literal. The literal is fed to kernels as a
/// parameter value instead of being baked into the IR, so recompiling the
/// same trace after the address changed still hits the kernel cache. One
/// variable exists per distinct address, shared through a side table.
pub fn register_ptr(ptr: *const u8) -> Result<u32> {
    let addr = ptr as usize;
    let mut state = state::lock();
    if let Some(&existing) = state.var_from_ptr.get(&addr) {
        inc_ref_ext_in(&mut state, existing);
        return Ok(existing);
    }

    let key = state::active_stream_key()?;
    state.stream(key)?;
    let kind = if key.0 < 0 {
        BackendKind::Llvm
    } else {
        BackendKind::Cuda
    };

    let index = state.variable_index;
    state.variable_index += 1;
    state.variables.insert(
        index,
        Variable {
            kind,
            ty: VarType::Ptr,
            size: 1,
            stmt: None,
            deps: [0; 3],
            extra_dep: 0,
            data: addr,
            tsize: 0,
            ref_count_ext: 0,
            ref_count_int: 0,
            free_variable: false,
            direct_pointer: true,
            side_effect: false,
            dirty: false,
            label: None,
        },
    );
    inc_ref_ext_in(&mut state, index);
    state.var_from_ptr.insert(addr, index);
    debug!("trace::register_ptr({}): {:#x}", index, addr);
    Ok(index)
}

/// Stages a host buffer into device memory through a pinned bounce buffer
/// and an asynchronous copy, returning the resulting variable. On the host
/// backend this degenerates to an ordinary copy.
pub fn copy_to_device(ty: VarType, data: &[u8], size: u32) -> Result<u32> {
    let total = size as usize * ty.size();
    assert_eq!(data.len(), total, "buffer length does not match size");

    let (device, stream_handle, backend) = {
        let state = state::lock();
        let key = state::active_stream_key()?;
        let stream = state.stream(key)?;
        (
            stream.device,
            stream.handle,
            state.backend_for_device(stream.device)?,
        )
    };

    let index = if device < 0 {
        let host = crate::alloc::malloc(crate::alloc::AllocType::HostPinned, total)?;
        // SAFETY: `host` points to at least `total` writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), host, total) };
        register(ty, host, size, true)?
    } else {
        let bounce = crate::alloc::malloc(crate::alloc::AllocType::HostPinned, total)?;
        let target = crate::alloc::malloc(crate::alloc::AllocType::Device, total)?;
        // SAFETY: `bounce` points to at least `total` writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), bounce, total) };
        backend.memcpy_async(target as usize, bounce as usize, total, stream_handle)?;
        crate::alloc::free(bounce);
        register(ty, target, size, true)?
    };
    debug!("trace::copy_to_device({}, {})", index, size);
    Ok(index)
}

/// Changes the size of a variable, returning the (possibly new) id.
///
/// A symbolic variable that nothing else depends on is resized in place. A
/// materialized or internally referenced *scalar* can be expanded by
/// inserting a copy when `allow_copy` is set (the caller's reference to
/// the old id is released); anything else is rejected.
pub fn set_size(index: u32, size: u32, allow_copy: bool) -> Result<u32> {
    let copy_stmt = {
        let mut state = state::lock();
        let v = state
            .variables
            .get(&index)
            .ok_or(JitError::UnknownVariable(index))?;
        if v.size == size {
            return Ok(index);
        }

        if v.data != 0 || v.ref_count_int > 0 {
            if v.size != 1 || !allow_copy {
                return Err(JitError::InvalidResize {
                    index,
                    current: v.size,
                    requested: size,
                });
            }
            let backend = state.backend(v.kind).ok_or(JitError::UninitializedStream)?;
            backend.copy_stmt()
        } else {
            cse_remove(&mut state, index);
            let v = var::var_mut(&mut state, index);
            v.size = size;
            let eligible = v.cse_eligible();
            let key = v.key();
            if eligible {
                state.cse.insert(key, index);
            }
            debug!("trace::set_size({}) -> {}", index, size);
            return Ok(index);
        }
    };

    let new_index = append_1(index_type(index)?, copy_stmt, index)?;
    {
        let mut state = state::lock();
        cse_remove(&mut state, new_index);
        let v = var::var_mut(&mut state, new_index);
        v.size = size;
        let eligible = v.cse_eligible();
        let key = v.key();
        if eligible {
            state.cse.insert(key, new_index);
        }
        dec_ref_ext_in(&mut state, index)?;
    }
    debug!("trace::set_size({}) -> copy {}", index, new_index);
    Ok(new_index)
}

fn index_type(index: u32) -> Result<VarType> {
    let state = state::lock();
    state
        .variables
        .get(&index)
        .map(|v| v.ty)
        .ok_or(JitError::UnknownVariable(index))
}
