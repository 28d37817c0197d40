//! Pointer registry: dense ids, slot reuse, and compaction.

mod common;

use kiln::registry;
use kiln::JitError;

#[test]
fn registry_round_trips_and_compacts() {
    common::with_session(|_| {
        let objects: Vec<Box<u64>> = (0..4).map(|i| Box::new(i)).collect();
        let ptrs: Vec<*const u8> = objects.iter().map(|b| &**b as *const u64 as *const u8).collect();

        // Dense ids, starting at 1.
        let ids: Vec<u32> = ptrs
            .iter()
            .map(|&p| registry::put("TestDomain", p).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(registry::get_max("TestDomain"), 4);

        for (&p, &id) in ptrs.iter().zip(&ids) {
            assert_eq!(registry::get_id(p).unwrap(), id);
            assert_eq!(registry::get_domain(p).unwrap(), Some("TestDomain"));
            assert_eq!(registry::get_ptr("TestDomain", id).unwrap() as *const u8, p);
        }

        // Null maps to 0 in both directions.
        assert_eq!(registry::put("TestDomain", std::ptr::null()).unwrap(), 0);
        assert_eq!(registry::get_id(std::ptr::null()).unwrap(), 0);
        assert!(registry::get_ptr("TestDomain", 0).unwrap().is_null());

        // A vacated slot is handed out again before the table grows.
        registry::remove(ptrs[1]).unwrap();
        let replacement = Box::new(99u64);
        let replacement_ptr = &*replacement as *const u64 as *const u8;
        assert_eq!(registry::put("TestDomain", replacement_ptr).unwrap(), 2);

        // Double registration and unknown removal are errors.
        assert!(matches!(
            registry::put("OtherDomain", ptrs[0]),
            Err(JitError::RegistryCollision { .. })
        ));
        let stranger = Box::new(0u64);
        assert!(matches!(
            registry::remove(&*stranger as *const u64 as *const u8),
            Err(JitError::UnknownRegistration(_))
        ));
        assert!(matches!(
            registry::get_id(&*stranger as *const u64 as *const u8),
            Err(JitError::UnknownRegistration(_))
        ));

        // Removing the tail and trimming shrinks the bound.
        registry::remove(replacement_ptr).unwrap();
        registry::remove(ptrs[3]).unwrap();
        registry::trim();
        assert_eq!(registry::get_max("TestDomain"), 3);

        registry::remove(ptrs[0]).unwrap();
        registry::remove(ptrs[2]).unwrap();
        registry::trim();
        assert_eq!(registry::get_max("TestDomain"), 0);
    });
}

#[test]
fn domains_are_independent() {
    common::with_session(|_| {
        let a = Box::new(1u64);
        let b = Box::new(2u64);
        let pa = &*a as *const u64 as *const u8;
        let pb = &*b as *const u64 as *const u8;

        assert_eq!(registry::put("DomainA", pa).unwrap(), 1);
        assert_eq!(registry::put("DomainB", pb).unwrap(), 1);
        assert_eq!(registry::get_domain(pa).unwrap(), Some("DomainA"));
        assert_eq!(registry::get_domain(pb).unwrap(), Some("DomainB"));
        assert_eq!(registry::get_max("DomainA"), 1);

        registry::remove(pa).unwrap();
        registry::remove(pb).unwrap();
    });
}
