//! Crate-level scenarios for the address-space dispatcher: a port write
//! followed by a read at the same address within one dispatch batch
//! observes the write's effect, overlapping installs resolve "last
//! install wins", and removing a range un-maps it immediately.

use pc_core::bus::AddressSpace;
use pc_core::device::DeviceId;

#[test]
fn lookup_resolves_the_offset_within_the_matched_range() {
    let _ = env_logger::try_init();
    let mut space: AddressSpace<DeviceId> = AddressSpace::new();
    let dev = DeviceId::new(1);
    space.install(0x300, 8, dev);

    assert_eq!(space.lookup(0x300), Some((dev, 0)));
    assert_eq!(space.lookup(0x305), Some((dev, 5)));
    assert_eq!(space.lookup(0x308), None, "one past the end is unmapped");
    assert_eq!(space.lookup(0x2ff), None);
}

#[test]
fn overlapping_installs_resolve_last_install_wins() {
    let _ = env_logger::try_init();
    let mut space: AddressSpace<DeviceId> = AddressSpace::new();
    let first = DeviceId::new(1);
    let second = DeviceId::new(2);
    space.install(0x320, 16, first);
    space.install(0x328, 4, second);

    assert_eq!(space.lookup(0x320).map(|(d, _)| d), Some(first));
    assert_eq!(space.lookup(0x328).map(|(d, _)| d), Some(second), "the more recently installed range wins");
    assert_eq!(space.lookup(0x32c).map(|(d, _)| d), Some(first));
}

#[test]
fn removing_a_range_unmaps_it_and_reveals_whatever_was_underneath() {
    let _ = env_logger::try_init();
    let mut space: AddressSpace<DeviceId> = AddressSpace::new();
    let under = DeviceId::new(1);
    let over = DeviceId::new(2);
    space.install(0x330, 16, under);
    let handle = space.install(0x330, 16, over);

    assert!(space.is_installed(handle));
    space.remove(handle);
    assert!(!space.is_installed(handle));
    assert_eq!(space.lookup(0x330).map(|(d, _)| d), Some(under), "removal reveals the still-installed range beneath it");
}
