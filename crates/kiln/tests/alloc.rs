//! Asynchronous allocator: free-list recycling, release-chain gating,
//! migration, and trimming.

mod common;

use kiln::alloc::{self, AllocType};

#[test]
fn host_memory_recycles_immediately() {
    common::with_session(|_| {
        let p = alloc::malloc(AllocType::Host, 100).unwrap();
        alloc::free(p);

        // 100 bytes round up to the same bucket as 128.
        let q = alloc::malloc(AllocType::Host, 128).unwrap();
        assert_eq!(p, q, "host frees return to the free list synchronously");

        // A different bucket gets a different allocation.
        let r = alloc::malloc(AllocType::Host, 4096).unwrap();
        assert_ne!(q as usize, r as usize);

        alloc::free(q);
        alloc::free(r);
        alloc::malloc_trim();
    });
}

#[test]
fn device_accessible_memory_waits_for_its_event() {
    common::with_session(|_| {
        let p = alloc::malloc(AllocType::HostPinned, 256).unwrap();
        alloc::free(p);

        // No event has gated the release yet, so the pointer may still be
        // read by an in-flight kernel and is not reusable.
        let q = alloc::malloc(AllocType::HostPinned, 256).unwrap();
        assert_ne!(p, q);

        // A stream synchronization retires everything.
        kiln::sync_stream().unwrap();
        let r = alloc::malloc(AllocType::HostPinned, 256).unwrap();
        assert_eq!(p, r);

        alloc::free(q);
        alloc::free(r);
        kiln::sync_stream().unwrap();
        alloc::malloc_trim();
    });
}

#[test]
fn migrate_changes_flavor_and_releases_the_source() {
    common::with_session(|_| {
        let p = alloc::malloc(AllocType::HostPinned, 64).unwrap();
        // SAFETY: 128 bytes were allocated (the rounding floor).
        unsafe { std::ptr::write_bytes(p, 0x5a, 64) };

        let q = alloc::malloc_migrate(p, AllocType::Managed).unwrap();
        assert_ne!(p, q);
        // SAFETY: The mock backend copies synchronously.
        let copied = unsafe { std::slice::from_raw_parts(q, 64) };
        assert!(copied.iter().all(|&b| b == 0x5a));

        // Same flavor: the pointer passes through untouched.
        let same = alloc::malloc_migrate(q, AllocType::Managed).unwrap();
        assert_eq!(q, same);

        alloc::free(q);
        kiln::sync_stream().unwrap();
        alloc::malloc_trim();
    });
}

#[test]
fn trim_empties_every_free_list() {
    common::with_session(|_| {
        let ptrs: Vec<*mut u8> = (0..4)
            .map(|i| alloc::malloc(AllocType::Host, 64 << i).unwrap())
            .collect();
        let held = alloc::usage(AllocType::Host);
        assert!(held > 0);
        for p in ptrs {
            alloc::free(p);
        }
        assert_eq!(alloc::usage(AllocType::Host), 0);
        assert!(alloc::watermark(AllocType::Host) >= held);

        alloc::malloc_trim();
        // Everything went back to the OS; fresh allocations work as
        // before.
        let p = alloc::malloc(AllocType::Host, 64).unwrap();
        alloc::free(p);
        alloc::malloc_trim();
    });
}
