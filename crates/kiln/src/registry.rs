//! Pointer registry: a dense (domain, pointer) <-> id bijection.
//!
//! Registered pointers receive the smallest free id within their domain,
//! which lets polymorphic dispatch compile down to an integer lookup
//! instead of an indirect call through an arbitrary 64-bit address. Domains
//! are expected to be static strings (a type identifier works well).

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;

use log::{trace, warn};

use crate::error::{JitError, Result};
use crate::state::{self, State};

#[derive(Default)]
struct DomainTable {
    /// Slot `id - 1` holds the registered address, 0 when vacated.
    entries: Vec<usize>,
    /// Vacated ids, smallest first.
    unused: BinaryHeap<Reverse<u32>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    domains: HashMap<&'static str, DomainTable>,
    by_ptr: HashMap<usize, (&'static str, u32)>,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.by_ptr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_ptr.len()
    }
}

/// Registers `ptr` in `domain` and returns its id (ids start at 1; a null
/// pointer maps to 0). Registering the same pointer twice is an error,
/// regardless of domain.
pub fn put(domain: &'static str, ptr: *const u8) -> Result<u32> {
    if ptr.is_null() {
        return Ok(0);
    }
    let addr = ptr as usize;
    let mut state = state::lock();
    let registry = &mut state.registry;

    if let Some((existing, _)) = registry.by_ptr.get(&addr) {
        return Err(JitError::RegistryCollision {
            domain: (*existing).to_string(),
            ptr: addr,
        });
    }

    let table = registry.domains.entry(domain).or_default();
    let id = match table.unused.pop() {
        Some(Reverse(id)) => {
            table.entries[(id - 1) as usize] = addr;
            id
        }
        None => {
            table.entries.push(addr);
            table.entries.len() as u32
        }
    };
    registry.by_ptr.insert(addr, (domain, id));
    trace!("registry::put(\"{}\", {:#x}) -> {}", domain, addr, id);
    Ok(id)
}

/// Removes a registered pointer. A null pointer is a no-op.
pub fn remove(ptr: *const u8) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let addr = ptr as usize;
    let mut state = state::lock();
    let registry = &mut state.registry;

    let (domain, id) = registry
        .by_ptr
        .remove(&addr)
        .ok_or(JitError::UnknownRegistration(addr))?;
    let table = registry
        .domains
        .get_mut(domain)
        .expect("registry domain disappeared");
    table.entries[(id - 1) as usize] = 0;
    table.unused.push(Reverse(id));
    trace!("registry::remove({:#x})", addr);
    Ok(())
}

/// Returns the id of a registered pointer (0 for null).
pub fn get_id(ptr: *const u8) -> Result<u32> {
    if ptr.is_null() {
        return Ok(0);
    }
    let addr = ptr as usize;
    let state = state::lock();
    state
        .registry
        .by_ptr
        .get(&addr)
        .map(|(_, id)| *id)
        .ok_or(JitError::UnknownRegistration(addr))
}

/// Returns the domain of a registered pointer (`None` for null).
pub fn get_domain(ptr: *const u8) -> Result<Option<&'static str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let addr = ptr as usize;
    let state = state::lock();
    state
        .registry
        .by_ptr
        .get(&addr)
        .map(|(domain, _)| Some(*domain))
        .ok_or(JitError::UnknownRegistration(addr))
}

/// Returns the pointer registered under (domain, id); id 0 yields null.
pub fn get_ptr(domain: &str, id: u32) -> Result<*mut u8> {
    if id == 0 {
        return Ok(std::ptr::null_mut());
    }
    let state = state::lock();
    let table = state
        .registry
        .domains
        .get(domain)
        .ok_or(JitError::UnknownRegistration(0))?;
    let addr = table
        .entries
        .get((id - 1) as usize)
        .copied()
        .filter(|addr| *addr != 0)
        .ok_or(JitError::UnknownRegistration(id as usize))?;
    Ok(addr as *mut u8)
}

/// Upper bound (inclusive) on ids currently associated with a domain.
pub fn get_max(domain: &str) -> u32 {
    let state = state::lock();
    state
        .registry
        .domains
        .get(domain)
        .map(|table| table.entries.len() as u32)
        .unwrap_or(0)
}

/// Compacts every domain by dropping trailing vacated slots.
pub fn trim() {
    let mut state = state::lock();
    for table in state.registry.domains.values_mut() {
        while table.entries.last() == Some(&0) {
            table.entries.pop();
        }
        let limit = table.entries.len() as u32;
        let kept: Vec<Reverse<u32>> = table
            .unused
            .drain()
            .filter(|Reverse(id)| *id <= limit)
            .collect();
        table.unused = kept.into();
    }
}

/// Reports leaked registrations at shutdown and clears the tables.
pub(crate) fn registry_shutdown(state: &mut State) {
    if !state.registry.is_empty() {
        warn!(
            "shutdown(): registry still contains {} registered pointers!",
            state.registry.len()
        );
    }
    state.registry = Registry::default();
}
