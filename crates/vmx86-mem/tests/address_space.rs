use std::sync::Arc;
use vmx86_mem::{
    Access, AddressSpace, Backing, BackingKind, FaultKind, MapError, Prot, PAGE_SIZE,
};

fn anon(mem: &AddressSpace, addr: u64, len: u64, prot: Prot) {
    mem.map_fixed(addr, len, prot, Backing::Anonymous, false)
        .expect("map_fixed");
}

#[test]
fn read_just_below_region_end_succeeds_and_at_end_faults() {
    let mem = AddressSpace::new();
    anon(&mem, 0x40_0000, PAGE_SIZE, Prot::RW);
    let limit = 0x40_0000 + PAGE_SIZE;

    assert_eq!(mem.read(limit - 1, 1).unwrap(), vec![0]);

    let fault = mem.read(limit, 1).unwrap_err();
    assert_eq!(fault.addr, limit);
    assert_eq!(fault.width, 1);
    assert_eq!(fault.access, Access::Read);
    assert_eq!(fault.kind, FaultKind::Unmapped);
}

#[test]
fn access_straddling_region_end_faults_at_first_missing_byte() {
    let mem = AddressSpace::new();
    anon(&mem, 0x1_0000, PAGE_SIZE, Prot::RW);
    mem.write_u64(0x1_0ff8, 0x1122_3344_5566_7788).unwrap();

    let fault = mem.read_u64(0x1_0ffc).unwrap_err();
    assert_eq!(fault.addr, 0x1_1000);
    assert_eq!(fault.width, 8);

    // A faulting write has no partial effect.
    let fault = mem.write_u64(0x1_0ffc, u64::MAX).unwrap_err();
    assert_eq!(fault.addr, 0x1_1000);
    assert_eq!(fault.access, Access::Write);
    assert_eq!(mem.read_u64(0x1_0ff8).unwrap(), 0x1122_3344_5566_7788);
}

#[test]
fn access_across_adjacent_regions_is_allowed() {
    let mem = AddressSpace::new();
    anon(&mem, 0x2_0000, PAGE_SIZE, Prot::RW);
    anon(&mem, 0x2_1000, PAGE_SIZE, Prot::RWX);

    mem.write_u32(0x2_0ffe, 0xdead_beef).unwrap();
    assert_eq!(mem.read_u32(0x2_0ffe).unwrap(), 0xdead_beef);
    assert_eq!(mem.read(0x2_0ffe, 4).unwrap(), vec![0xef, 0xbe, 0xad, 0xde]);
}

#[test]
fn protection_fault_reports_required_and_actual() {
    let mem = AddressSpace::new();
    anon(&mem, 0x3_0000, PAGE_SIZE, Prot::RW);
    anon(&mem, 0x3_1000, PAGE_SIZE, Prot::READ);

    let fault = mem.write_u16(0x3_0fff, 0xffff).unwrap_err();
    assert_eq!(fault.addr, 0x3_1000);
    assert_eq!(
        fault.kind,
        FaultKind::Protection {
            required: Prot::WRITE,
            actual: Prot::READ,
        }
    );
    assert_eq!(mem.read_u8(0x3_0fff).unwrap(), 0);
    assert_eq!(
        fault.to_string(),
        "protection (need -w-, have r--) fault on Write of 2 bytes at 0x31000"
    );
}

#[test]
fn guard_pages_fault_on_every_access() {
    let mem = AddressSpace::new();
    mem.map_fixed(0x4_0000, PAGE_SIZE, Prot::empty(), Backing::Guard, false)
        .unwrap();
    let info = mem.translate(0x4_0010).unwrap();
    assert_eq!(info.kind, BackingKind::Guard);
    assert!(matches!(
        mem.read_u8(0x4_0000).unwrap_err().kind,
        FaultKind::Protection { .. }
    ));
    let mut buf = [0u8; 4];
    assert!(mem.fetch(0x4_0000, &mut buf).is_err());
}

#[test]
fn file_backing_is_private_copy_on_write() {
    let data: Arc<[u8]> = Arc::from(&b"\x7fELF-image"[..]);
    let mem = AddressSpace::new();
    mem.map_fixed(
        0x40_0000,
        PAGE_SIZE,
        Prot::RW,
        Backing::File {
            name: Arc::from("a.out"),
            data: data.clone(),
            offset: 4,
        },
        false,
    )
    .unwrap();

    assert_eq!(mem.read(0x40_0000, 6).unwrap(), b"-image");
    assert_eq!(mem.read_u8(0x40_0006).unwrap(), 0);
    mem.write(0x40_0000, b"+").unwrap();
    assert_eq!(mem.read(0x40_0000, 6).unwrap(), b"+image");
    assert_eq!(&data[..], b"\x7fELF-image");

    let info = mem.translate(0x40_0000).unwrap();
    assert_eq!(info.name.as_deref(), Some("a.out"));
}

#[test]
fn protect_splits_region_and_keeps_contents() {
    let mem = AddressSpace::new();
    anon(&mem, 0x10_0000, 3 * PAGE_SIZE, Prot::RW);
    mem.write_u8(0x10_1800, 0x5a).unwrap();

    mem.protect(0x10_1000, PAGE_SIZE, Prot::RX).unwrap();
    let regions = mem.regions();
    assert_eq!(regions.len(), 3);
    assert_eq!(
        regions.iter().map(|r| r.prot).collect::<Vec<_>>(),
        vec![Prot::RW, Prot::RX, Prot::RW]
    );
    assert_eq!(mem.read_u8(0x10_1800).unwrap(), 0x5a);
    assert!(mem.write_u8(0x10_1800, 0).is_err());
}

#[test]
fn unmap_over_gaps_and_partial_regions() {
    let mem = AddressSpace::new();
    anon(&mem, 0x10_0000, 2 * PAGE_SIZE, Prot::RW);
    anon(&mem, 0x10_4000, 2 * PAGE_SIZE, Prot::RW);

    mem.unmap(0x10_1000, 0x4000).unwrap();
    let regions = mem.regions();
    assert_eq!(regions.len(), 2);
    assert_eq!((regions[0].start, regions[0].end), (0x10_0000, 0x10_1000));
    assert_eq!((regions[1].start, regions[1].end), (0x10_5000, 0x10_6000));

    // Unmapping nothing is not an error.
    mem.unmap(0x20_0000, PAGE_SIZE).unwrap();
}

#[test]
fn map_rejects_bad_ranges() {
    let mem = AddressSpace::new();
    assert_eq!(
        mem.map(0, 0, Prot::RW, Backing::Anonymous),
        Err(MapError::ZeroLength)
    );
    assert_eq!(
        mem.map_fixed(0x1234, PAGE_SIZE, Prot::RW, Backing::Anonymous, false),
        Err(MapError::Unaligned(0x1234))
    );
    assert!(matches!(
        mem.map_fixed(
            0x7fff_ffff_f000,
            2 * PAGE_SIZE,
            Prot::RW,
            Backing::Anonymous,
            false
        ),
        Err(MapError::OutOfRange { .. })
    ));
}

#[test]
fn non_fixed_mappings_never_overlap() {
    let mem = AddressSpace::with_mmap_base(0x1000_0000);
    let mut got = Vec::new();
    for i in 1..=16u64 {
        got.push((mem.map(0, i * 100, Prot::RW, Backing::Anonymous).unwrap(), i * 100));
    }
    let mut regions = mem.regions();
    regions.sort_by_key(|r| r.start);
    for pair in regions.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }
    assert!(got.iter().all(|(a, _)| *a >= 0x1000_0000));
}

#[test]
fn concurrent_atomic_increments_do_not_lose_updates() {
    let mem = Arc::new(AddressSpace::new());
    anon(&mem, 0x50_0000, 2 * PAGE_SIZE, Prot::RW);
    // Straddles the page boundary and, after the protect below, a region boundary.
    let counter = 0x50_0ffc;
    mem.protect(0x50_1000, PAGE_SIZE, Prot::RW).unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let mem = mem.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    mem.atomic_update(counter, 8, |v| Some(v + 1)).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("thread panicked");
    }
    assert_eq!(mem.read_u64(counter).unwrap(), 4000);
}

#[test]
fn atomic_update_requires_write_permission() {
    let mem = AddressSpace::new();
    anon(&mem, 0x60_0000, PAGE_SIZE, Prot::READ);
    let fault = mem.atomic_update(0x60_0000, 4, |_| None).unwrap_err();
    assert_eq!(fault.access, Access::Write);
}

#[test]
fn read_c_string_stops_at_nul() {
    let mem = AddressSpace::new();
    anon(&mem, 0x70_0000, PAGE_SIZE, Prot::RW);
    mem.write(0x70_0000, b"hello\0world").unwrap();
    assert_eq!(mem.read_c_string(0x70_0000, 64).unwrap(), b"hello");
    assert_eq!(mem.read_c_string(0x70_0000, 3).unwrap(), b"hel");
}

#[test]
fn oversized_reads_fault_instead_of_allocating() {
    let mem = AddressSpace::new();
    let fault = mem.read(0x1000, usize::MAX).unwrap_err();
    assert_eq!(fault.addr, 0x1000);
    assert_eq!(fault.width, usize::MAX);
    assert_eq!(fault.kind, FaultKind::Unmapped);

    // Mapped at the start, the fault lands where the mapping ends.
    anon(&mem, 0x80_0000, PAGE_SIZE, Prot::RW);
    let fault = mem.read(0x80_0000, 1 << 62).unwrap_err();
    assert_eq!(fault.addr, 0x80_1000);
    assert_eq!(fault.kind, FaultKind::Unmapped);

    assert!(mem.read(0x80_0000, 0).unwrap().is_empty());
}
