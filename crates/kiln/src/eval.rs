//! The evaluation engine: fuses the pending set of the active stream into
//! kernels and launches them.
//!
//! Pending roots are partitioned by output size, since differently sized
//! results cannot share one grid (a scalar operand embedded in a larger
//! kernel broadcasts instead and stays fused). Each partition is walked in
//! dependency order, registers are assigned per type class, statements are
//! substituted, and the assembled text is hashed and resolved through the
//! kernel caches. After the launch, every root becomes a concrete buffer
//! and releases its hold on the rest of the trace.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, trace};
use smallvec::SmallVec;

use crate::alloc::{self, AllocType};
use crate::backend::{BackendKind, RegClass};
use crate::error::{JitError, Result};
use crate::kernel_cache::{self, fnv1a_hash};
use crate::state::{self, State};
use crate::template::{self, Operands};
use crate::var::{self, cse_remove, dec_ref_ext_in, dec_ref_int_in, var_mut};

enum ParamSlot {
    /// Address of an already materialized buffer (or a pointer-literal
    /// value).
    Input(usize),
    /// Output buffer of the given root, allocated at execution time.
    Output(u32),
}

struct KernelPlan {
    device: i32,
    kind: BackendKind,
    size: u32,
    source: String,
    hash: u64,
    params: Vec<ParamSlot>,
    /// (root id, output buffer size in bytes), in parameter order.
    outputs: Vec<(u32, usize)>,
    /// Every pending id covered by this kernel, including side effects.
    roots: Vec<u32>,
}

/// Evaluates all computation queued on the current stream.
pub fn eval() -> Result<()> {
    let stream_key = state::active_stream_key()?;

    let (plans, parallel) = {
        let state = state::lock();
        let stream = state.stream(stream_key)?;
        if stream.todo.is_empty() {
            return Ok(());
        }

        let mut by_size: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &id in &stream.todo {
            by_size.entry(var::var(&state, id).size).or_default().push(id);
        }

        // Large partitions launch first; under parallel dispatch the rest
        // go to scratch streams and are joined at the end.
        let mut plans = Vec::with_capacity(by_size.len());
        for (size, roots) in by_size.into_iter().rev() {
            plans.push(build_plan(&state, stream_key, size, roots)?);
        }
        let parallel = state.parallel_dispatch && plans.len() > 1;
        (plans, parallel)
    };

    let mut scratch_used = 0usize;
    for (i, plan) in plans.iter().enumerate() {
        let scratch_slot = if parallel && i > 0 {
            scratch_used = scratch_used.max(i);
            Some(i - 1)
        } else {
            None
        };
        execute_plan(plan, stream_key, scratch_slot)?;
    }

    if parallel {
        join_scratch(stream_key, scratch_used)?;
    }
    Ok(())
}

/// Evaluates the current stream only if `index` actually requires it.
pub fn var_eval(index: u32) -> Result<()> {
    let needs = {
        let state = state::lock();
        let v = state
            .variables
            .get(&index)
            .ok_or(JitError::UnknownVariable(index))?;
        v.data == 0 || v.dirty
    };
    if needs {
        eval()
    } else {
        Ok(())
    }
}

/// Collects the transitive dependencies of `roots` in evaluation order
/// (dependencies strictly before their users). Materialized variables are
/// leaves regardless of how they were produced.
fn schedule(state: &State, roots: &[u32]) -> Vec<u32> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    for &root in roots {
        visit(state, root, &mut visited, &mut order);
    }
    order
}

fn visit(state: &State, id: u32, visited: &mut HashSet<u32>, order: &mut Vec<u32>) {
    if !visited.insert(id) {
        return;
    }
    let v = var::var(state, id);
    if v.data == 0 {
        for dep in v.deps {
            if dep != 0 {
                visit(state, dep, visited, order);
            }
        }
    }
    order.push(id);
}

fn build_plan(
    state: &State,
    stream_key: (i32, u32),
    size: u32,
    mut roots: Vec<u32>,
) -> Result<KernelPlan> {
    roots.sort_unstable();
    let device = stream_key.0;
    let kind = if device < 0 {
        BackendKind::Llvm
    } else {
        BackendKind::Cuda
    };
    let backend = state.backend_for_device(device)?;
    let order = schedule(state, &roots);
    let width = backend.vector_width();

    let mut counters: HashMap<RegClass, u32> = HashMap::new();
    let mut regs: HashMap<u32, String> = HashMap::new();
    let mut params: Vec<ParamSlot> = Vec::new();
    let mut body = String::new();

    for &id in &order {
        let v = var::var(state, id);
        let class = backend.register_class(v.ty);
        let counter = counters
            .entry(class)
            .or_insert_with(|| backend.reserved_registers(class));
        let reg = format!("{}{}", class.prefix, *counter);
        *counter += 1;

        if v.data != 0 {
            let slot = params.len();
            params.push(ParamSlot::Input(v.data));
            if v.direct_pointer {
                backend.emit_load_ptr(&mut body, &reg, slot);
            } else {
                backend.emit_load(&mut body, &reg, v.ty, slot, v.size == 1 && size > 1);
            }
        } else {
            let stmt = v
                .stmt
                .as_deref()
                .unwrap_or_else(|| panic!("eval(): variable {id} has neither data nor statement"));

            let mut reg_names: [String; 4] = Default::default();
            let mut type_names: [String; 4] = Default::default();
            let mut binary_names: [String; 4] = Default::default();
            reg_names[0] = reg.clone();
            type_names[0] = backend.type_name(v.ty);
            binary_names[0] = backend.binary_type_name(v.ty);
            for (i, dep) in v.deps.iter().enumerate() {
                if *dep == 0 {
                    continue;
                }
                let dv = var::var(state, *dep);
                reg_names[i + 1] = regs
                    .get(dep)
                    .cloned()
                    .unwrap_or_else(|| panic!("eval(): operand {dep} scheduled after its user"));
                type_names[i + 1] = backend.type_name(dv.ty);
                binary_names[i + 1] = backend.binary_type_name(dv.ty);
            }
            let ops = Operands {
                regs: [&reg_names[0], &reg_names[1], &reg_names[2], &reg_names[3]],
                types: [
                    &type_names[0],
                    &type_names[1],
                    &type_names[2],
                    &type_names[3],
                ],
                binary: [
                    &binary_names[0],
                    &binary_names[1],
                    &binary_names[2],
                    &binary_names[3],
                ],
                width,
            };
            body.push_str("    ");
            body.push_str(&template::substitute(stmt, &ops));
            body.push_str(backend.stmt_suffix());
            body.push('\n');
        }
        regs.insert(id, reg);
    }

    let mut outputs = Vec::new();
    for &root in &roots {
        let v = var::var(state, root);
        if v.side_effect || v.data != 0 {
            continue;
        }
        let slot = params.len();
        params.push(ParamSlot::Output(root));
        backend.emit_store(&mut body, regs[&root].as_str(), v.ty, slot);
        outputs.push((root, v.size as usize * v.ty.size()));
    }

    // Deterministic declaration order keeps the kernel text (and its
    // hash) stable across runs.
    let mut reg_counts: Vec<(RegClass, u32)> = counters.into_iter().collect();
    reg_counts.sort_by_key(|(class, _)| class.prefix);

    let source = backend.assemble(device, &body, params.len(), &reg_counts);
    let hash = fnv1a_hash(source.as_bytes());
    trace!(
        "eval(): assembled kernel {:016x} (size {}, {} params, {} scheduled)",
        hash,
        size,
        params.len(),
        order.len()
    );

    Ok(KernelPlan {
        device,
        kind,
        size,
        source,
        hash,
        params,
        outputs,
        roots,
    })
}

fn execute_plan(
    plan: &KernelPlan,
    stream_key: (i32, u32),
    scratch_slot: Option<usize>,
) -> Result<()> {
    let backend = {
        let state = state::lock();
        state.backend_for_device(plan.device)?
    };

    let kernel =
        kernel_cache::get_or_compile(plan.kind, plan.device, &backend, &plan.source, plan.hash)?;

    // Output buffers. On a failure partway through, hand back what was
    // already taken so the free lists stay balanced.
    let alloc_ty = if plan.device < 0 {
        AllocType::HostPinned
    } else {
        AllocType::Device
    };
    let mut out_addrs: Vec<usize> = Vec::with_capacity(plan.outputs.len());
    for &(_, bytes) in &plan.outputs {
        match alloc::malloc(alloc_ty, bytes) {
            Ok(ptr) => out_addrs.push(ptr as usize),
            Err(err) => {
                for &addr in &out_addrs {
                    alloc::free(addr as *mut u8);
                }
                return Err(err);
            }
        }
    }

    let launch_stream = {
        let mut state = state::lock();
        match scratch_slot {
            None => state.stream(stream_key)?.handle,
            Some(slot) => {
                while state.stream(stream_key)?.scratch.len() <= slot {
                    let handle = backend.stream_create(plan.device)?;
                    state.stream_mut(stream_key)?.scratch.push(handle);
                }
                state.stream(stream_key)?.scratch[slot]
            }
        }
    };

    let mut out_iter = out_addrs.iter();
    let param_addrs: SmallVec<[usize; 16]> = plan
        .params
        .iter()
        .map(|slot| match slot {
            ParamSlot::Input(addr) => *addr,
            ParamSlot::Output(_) => *out_iter.next().expect("output count mismatch"),
        })
        .collect();

    backend.launch(kernel, launch_stream, plan.size, &param_addrs)?;
    debug!(
        "eval(): launched kernel {:016x} over {} elements on stream {:#x}",
        plan.hash, plan.size, launch_stream
    );

    let mut state = state::lock();
    finish_plan(&mut state, plan, &out_addrs, stream_key);
    alloc::record_release_event(&mut state, stream_key, launch_stream)
}

/// Installs output buffers and releases the evaluated roots' hold on the
/// rest of the trace.
fn finish_plan(state: &mut State, plan: &KernelPlan, out_addrs: &[usize], stream_key: (i32, u32)) {
    let installed: HashMap<u32, usize> = plan
        .outputs
        .iter()
        .map(|&(root, _)| root)
        .zip(out_addrs.iter().copied())
        .collect();

    for &root in &plan.roots {
        if !state.variables.contains_key(&root) {
            continue;
        }
        cse_remove(state, root);

        let v = var_mut(state, root);
        if let Some(&addr) = installed.get(&root) {
            v.data = addr;
            v.free_variable = true;
        }
        v.stmt = None;
        v.dirty = false;
        let deps = std::mem::replace(&mut v.deps, [0; 3]);
        let extra = std::mem::replace(&mut v.extra_dep, 0);

        for dep in deps {
            dec_ref_int_in(state, dep);
        }
        if extra != 0 {
            // The scatter executed; its target is consistent again.
            if let Some(target) = state.variables.get_mut(&extra) {
                target.dirty = false;
            }
            dec_ref_ext_in(state, extra).expect("extra dependency reference underflow");
        }
    }

    if let Ok(stream) = state.stream_mut(stream_key) {
        for root in &plan.roots {
            stream.todo.remove(root);
        }
    }
}

/// Joins scratch streams used for parallel dispatch back into the stream
/// that triggered the evaluation.
fn join_scratch(stream_key: (i32, u32), used: usize) -> Result<()> {
    let (backend, device, active_handle, scratch): (_, _, _, Vec<usize>) = {
        let state = state::lock();
        let stream = state.stream(stream_key)?;
        (
            state.backend_for_device(stream.device)?,
            stream.device,
            stream.handle,
            stream.scratch.iter().take(used).copied().collect(),
        )
    };
    for handle in scratch {
        let event = backend.event_create(device)?;
        backend.event_record(event, handle)?;
        backend.stream_wait_event(active_handle, event)?;
        backend.event_destroy(event);
    }
    Ok(())
}
