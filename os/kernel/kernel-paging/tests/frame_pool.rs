use kernel_paging::{AddressSpace, FramePool, PagingError, PhysicalAddress, TablePage};

const BASE: u64 = 0x20_0000;

#[test]
fn first_free_slot_of_a_mostly_full_bitmap() {
    let mut pages = vec![TablePage::zeroed(); 32];
    let mut pool =
        FramePool::with_bitmap(&mut pages, PhysicalAddress::new(BASE), 0xffff_ff00).unwrap();

    let slot = pool.allocate().unwrap();
    assert_eq!(pool.bitmap(), 0xffff_ff01);
    assert_eq!(pool.offset_of(slot), 0);
    assert_eq!(pool.physical_page(slot).base(), PhysicalAddress::new(BASE));
}

#[test]
fn single_gap_is_found() {
    let mut pages = vec![TablePage::zeroed(); 32];
    let mut pool =
        FramePool::with_bitmap(&mut pages, PhysicalAddress::new(BASE), 0xffff_fff7).unwrap();

    // The new root takes the only free page, at offset 3 * 4 KiB.
    let space = AddressSpace::create(&mut pool).unwrap();
    assert_eq!(pool.bitmap(), 0xffff_ffff);
    assert_eq!(
        space.root_page().base(),
        PhysicalAddress::new(BASE + 0x3000)
    );

    assert_eq!(
        AddressSpace::create(&mut pool),
        Err(PagingError::PoolExhausted)
    );
    assert_eq!(pool.bitmap(), 0xffff_ffff);

    space.destroy(&mut pool).unwrap();
    assert_eq!(pool.bitmap(), 0xffff_fff7);
}

#[test]
fn allocation_order_and_reuse() {
    let mut pages = vec![TablePage::zeroed(); 8];
    let mut pool = FramePool::new(&mut pages, PhysicalAddress::new(BASE)).unwrap();
    assert_eq!(pool.capacity(), 8);

    let slots: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.bitmap(), 0xff);
    assert_eq!(pool.allocate(), None);
    assert_eq!(pool.free_slots(), 0);

    pool.deallocate(slots[5]);
    assert_eq!(pool.bitmap(), 0xdf);
    assert_eq!(pool.allocate(), Some(slots[5]));
    assert_eq!(pool.offset_of(slots[5]), 5 * 0x1000);
}

#[test]
fn pool_geometry_is_validated() {
    let mut none: Vec<TablePage> = Vec::new();
    assert_eq!(
        FramePool::new(&mut none, PhysicalAddress::new(BASE)).err(),
        Some(PagingError::InvalidPoolSize(0))
    );

    let mut many = vec![TablePage::zeroed(); 33];
    assert_eq!(
        FramePool::new(&mut many, PhysicalAddress::new(BASE)).err(),
        Some(PagingError::InvalidPoolSize(33))
    );

    let mut pages = vec![TablePage::zeroed(); 4];
    let base = PhysicalAddress::new(BASE + 0x800);
    assert_eq!(
        FramePool::new(&mut pages, base).err(),
        Some(PagingError::MisalignedPool(base))
    );
}
