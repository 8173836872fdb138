use super::*;
use rand::RngCore;
use tempfile::TempDir;

const BLOCK_SIZE: usize = 64;
const NUM_BLOCKS: u64 = 128;
const ARRAY_DATA_CAP: usize = 96;

fn fresh_disk(dir: &TempDir, id: u32) -> Disk {
    let path = dir.path().join(format!("disk-{id}.img"));
    let mut d = Disk::initialize(&path, id, BLOCK_SIZE, NUM_BLOCKS, ARRAY_DATA_CAP);
    assert_eq!(d.state(), DiskState::Invalid, "no image exists yet");
    d.set_array_data(b"array-config").unwrap();
    d.reset_disk().unwrap();
    d
}

#[test]
fn initialize_without_image_is_invalid() {
    let dir = TempDir::new().unwrap();
    let d = Disk::initialize(
        &dir.path().join("missing.img"),
        0,
        BLOCK_SIZE,
        NUM_BLOCKS,
        ARRAY_DATA_CAP,
    );
    assert_eq!(d.state(), DiskState::Invalid);
}

#[test]
fn reset_builds_a_zero_filled_online_disk() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    assert_eq!(d.state(), DiskState::Online);

    let meta = std::fs::metadata(d.path()).unwrap();
    assert!(
        meta.len() >= NUM_BLOCKS * BLOCK_SIZE as u64,
        "payload must be fully pre-sized"
    );

    d.mount(false).unwrap();
    let mut buf = vec![0xAAu8; 4 * BLOCK_SIZE];
    d.read_blocks(0, 4, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "fresh payload reads as zeros");
}

#[test]
fn header_and_array_data_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path;
    {
        let mut d = fresh_disk(&dir, 7);
        path = d.path().to_path_buf();
        d.mount(true).unwrap();
        d.unmount(12_345).unwrap();
    }

    let d2 = Disk::initialize(&path, 7, BLOCK_SIZE, NUM_BLOCKS, ARRAY_DATA_CAP);
    assert_eq!(d2.state(), DiskState::Offline);
    assert_eq!(d2.last_unmount(), 12_345);
    assert_eq!(d2.array_data(), b"array-config");
}

#[test]
fn reopen_with_wrong_identity_or_geometry_is_invalid() {
    let dir = TempDir::new().unwrap();
    let path;
    {
        let d = fresh_disk(&dir, 3);
        path = d.path().to_path_buf();
    }

    let wrong_id = Disk::initialize(&path, 4, BLOCK_SIZE, NUM_BLOCKS, ARRAY_DATA_CAP);
    assert_eq!(wrong_id.state(), DiskState::Invalid);

    let wrong_blocks = Disk::initialize(&path, 3, BLOCK_SIZE, NUM_BLOCKS + 1, ARRAY_DATA_CAP);
    assert_eq!(wrong_blocks.state(), DiskState::Invalid);

    let wrong_block_size = Disk::initialize(&path, 3, 2 * BLOCK_SIZE, NUM_BLOCKS, ARRAY_DATA_CAP);
    assert_eq!(wrong_block_size.state(), DiskState::Invalid);
}

#[test]
fn block_roundtrip_through_the_map() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    d.mount(true).unwrap();

    let mut data = vec![0u8; 8 * BLOCK_SIZE];
    rand::rng().fill_bytes(&mut data);
    d.write_blocks(16, 8, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    d.read_blocks(16, 8, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn payload_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path;
    {
        let mut d = fresh_disk(&dir, 0);
        path = d.path().to_path_buf();
        d.mount(true).unwrap();
        d.write_blocks(5, 1, &[0x5A; BLOCK_SIZE]).unwrap();
        d.unmount(1).unwrap();
    }
    let mut d2 = Disk::initialize(&path, 0, BLOCK_SIZE, NUM_BLOCKS, ARRAY_DATA_CAP);
    d2.set_state(DiskState::Online);
    d2.mount(false).unwrap();
    let mut back = [0u8; BLOCK_SIZE];
    d2.read_blocks(5, 1, &mut back).unwrap();
    assert!(back.iter().all(|&b| b == 0x5A));
}

#[test]
fn io_requires_the_matching_mount_state() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    let mut buf = [0u8; BLOCK_SIZE];

    assert!(d.read_blocks(0, 1, &mut buf).is_err(), "unmounted read");

    d.mount(false).unwrap();
    assert!(d.read_blocks(0, 1, &mut buf).is_ok());
    assert!(
        d.write_blocks(0, 1, &buf).is_err(),
        "read-only mount rejects writes"
    );

    d.unmount(0).unwrap();
    d.mount(true).unwrap();
    assert!(d.write_blocks(0, 1, &buf).is_ok());
}

#[test]
fn out_of_range_access_invalidates_the_disk() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    d.mount(true).unwrap();

    let mut buf = [0u8; BLOCK_SIZE];
    assert!(d.read_blocks(NUM_BLOCKS, 1, &mut buf).is_err());
    assert_eq!(d.state(), DiskState::Invalid);
    assert_eq!(d.mount_state(), MountState::Unmounted);
}

#[test]
fn mount_rejects_disks_that_are_not_online() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    d.set_state(DiskState::Offline);
    assert!(d.mount(false).is_err());
    d.set_state(DiskState::Invalid);
    assert!(d.mount(true).is_err());
}

#[test]
fn array_data_capacity_is_enforced() {
    let dir = TempDir::new().unwrap();
    let mut d = fresh_disk(&dir, 0);
    assert!(d.set_array_data(&vec![0u8; ARRAY_DATA_CAP + 1]).is_err());
    assert!(d.set_array_data(&vec![0u8; ARRAY_DATA_CAP]).is_ok());
}

#[test]
fn disk_set_serializes_access_per_disk() {
    let dir = TempDir::new().unwrap();
    let mut a = fresh_disk(&dir, 0);
    let mut b = fresh_disk(&dir, 1);
    a.mount(true).unwrap();
    b.mount(true).unwrap();
    let set = DiskSet::new(vec![a, b]);

    assert_eq!(set.len(), 2);
    set.write_blocks(0, 3, 1, &[1u8; BLOCK_SIZE]).unwrap();
    set.write_blocks(1, 3, 1, &[2u8; BLOCK_SIZE]).unwrap();

    let mut buf = [0u8; BLOCK_SIZE];
    set.read_blocks(0, 3, 1, &mut buf).unwrap();
    assert!(buf.iter().all(|&v| v == 1));
    set.read_blocks(1, 3, 1, &mut buf).unwrap();
    assert!(buf.iter().all(|&v| v == 2));

    assert_eq!(set.state(0), DiskState::Online);
    set.with_disk(0, |d| d.set_state(DiskState::Offline));
    assert_eq!(set.state(0), DiskState::Offline);
}
