//! Disk kernel cache: a second process (simulated by shutting the JIT
//! down and re-initializing) reuses the compiled artifact instead of
//! invoking the compiler again.

mod common;

use anyhow::Result;
use kiln::{trace, var, VarType};

fn run_trace() {
    let a = trace::append_0(VarType::F32, "$r0 = const(1.5)", 32).unwrap();
    let b = trace::append_1(VarType::F32, "$r0 = exp($r1)", a).unwrap();
    kiln::eval().unwrap();
    var::dec_ref_ext(a).unwrap();
    var::dec_ref_ext(b).unwrap();
}

#[test]
fn disk_cache_survives_restart() -> Result<()> {
    let home = tempfile::tempdir()?;
    std::env::set_var("HOME", home.path());

    // First "process": compiles and persists one kernel record.
    common::with_session(|stats| {
        run_trace();
        assert_eq!(stats.compile_count(), 1);
        assert_eq!(stats.disk_load_count(), 0);
    });

    let cache_dir = home.path().join(".kiln");
    let mut records = Vec::new();
    for entry in std::fs::read_dir(&cache_dir)? {
        let name = entry?.file_name().into_string().unwrap();
        if name.ends_with(".llvm.bin") {
            records.push(name);
        }
    }
    assert_eq!(records.len(), 1, "one record per kernel: {records:?}");
    assert_eq!(records[0].len(), "0123456789abcdef.llvm.bin".len());

    // Second "process": the in-memory cache is gone, the disk record is
    // not.
    common::with_session(|stats| {
        run_trace();
        assert_eq!(stats.compile_count(), 0, "disk hit instead of a recompile");
        assert_eq!(stats.disk_load_count(), 1);
        assert_eq!(stats.launch_count(), 1);
    });
    Ok(())
}
