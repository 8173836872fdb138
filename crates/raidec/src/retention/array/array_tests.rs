use super::*;
use crate::layout::codec::CodecConfig;
use rand::RngCore;
use std::thread;
use tempfile::TempDir;

fn array_config(
    dir: &TempDir,
    codec: CodecConfig,
    num_disks: usize,
    disk_capacity: u64,
    max_threads: usize,
) -> ArrayConfig {
    ArrayConfig {
        codec,
        disks: (0..num_disks)
            .map(|i| DiskSpec {
                path: dir.path().join(format!("disk-{i}.img")),
                online: true,
            })
            .collect(),
        disk_capacity,
        max_threads,
    }
}

fn raid5_config(dir: &TempDir) -> ArrayConfig {
    let codec = CodecConfig::Raid5 {
        dimension: 2,
        interleaving: 1,
        stripe_unit_size: 16,
    };
    array_config(dir, codec, 3, 16 * 8, 2)
}

fn fresh_array(cfg: &ArrayConfig) -> DiskArray {
    let arr = DiskArray::new(cfg).unwrap();
    arr.init().unwrap();
    arr
}

#[test]
fn fresh_disks_make_an_uninitialized_array() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    let arr = DiskArray::new(&cfg).unwrap();
    assert_eq!(arr.state(), ArrayState::Uninitialized);
    assert!(arr.mount(false).is_err(), "uninitialized arrays cannot mount");
}

#[test]
fn init_brings_every_disk_online() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    let arr = fresh_array(&cfg);
    assert_eq!(arr.state(), ArrayState::Normal);
    for i in 0..arr.num_disks() {
        assert_eq!(arr.disk_state(i), crate::retention::disk::DiskState::Online);
    }
    assert_eq!(arr.capacity(), 8 * 2 * 16);
}

#[test]
fn unmounted_access_is_rejected() {
    let dir = TempDir::new().unwrap();
    let arr = fresh_array(&raid5_config(&dir));

    let mut buf = [0u8; 16];
    assert!(arr.read_bytes(0, &mut buf).is_err());
    assert!(arr.write_bytes(0, &buf).is_err());

    arr.mount(false).unwrap();
    assert!(arr.read_bytes(0, &mut buf).is_ok());
    assert!(
        arr.write_bytes(0, &buf).is_err(),
        "read-only mount rejects writes"
    );
}

#[test]
fn byte_roundtrip_across_stripes() {
    let dir = TempDir::new().unwrap();
    let arr = fresh_array(&raid5_config(&dir));
    arr.mount(true).unwrap();

    let mut payload = vec![0u8; arr.capacity() as usize];
    rand::rng().fill_bytes(&mut payload);
    assert_eq!(arr.write_bytes(0, &payload).unwrap(), payload.len());

    let mut back = vec![0u8; payload.len()];
    assert_eq!(arr.read_bytes(0, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);

    // Unaligned views of the same data.
    let mut window = vec![0u8; 33];
    assert_eq!(arr.read_bytes(7, &mut window).unwrap(), 33);
    assert_eq!(window, payload[7..40]);
}

#[test]
fn partial_unit_write_preserves_neighbouring_bytes() {
    let dir = TempDir::new().unwrap();
    let arr = fresh_array(&raid5_config(&dir));
    arr.mount(true).unwrap();

    let prev: Vec<u8> = (0u8..16).map(|i| i + 100).collect();
    arr.write_bytes(0, &prev).unwrap();

    // Three bytes spliced into the middle of the first stripe unit.
    assert_eq!(arr.write_bytes(1, b"abc").unwrap(), 3);

    let mut out = [0u8; 16];
    arr.read_bytes(0, &mut out).unwrap();
    assert_eq!(out[0], prev[0]);
    assert_eq!(&out[1..4], b"abc");
    assert_eq!(&out[4..], &prev[4..]);
}

#[test]
fn reads_and_writes_clamp_to_capacity() {
    let dir = TempDir::new().unwrap();
    let arr = fresh_array(&raid5_config(&dir));
    arr.mount(true).unwrap();
    let cap = arr.capacity();

    let data = vec![0x11u8; 64];
    assert_eq!(arr.write_bytes(cap - 10, &data).unwrap(), 10);
    assert_eq!(arr.write_bytes(cap, &data).unwrap(), 0);

    let mut buf = vec![0u8; 64];
    assert_eq!(arr.read_bytes(cap - 10, &mut buf).unwrap(), 10);
    assert!(buf[..10].iter().all(|&b| b == 0x11));
    assert_eq!(arr.read_bytes(cap + 5, &mut buf).unwrap(), 0);
}

#[test]
fn data_survives_a_remount_cycle() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    let payload: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
    {
        let arr = fresh_array(&cfg);
        arr.mount(true).unwrap();
        arr.write_bytes(32, &payload).unwrap();
        arr.unmount().unwrap();
    }

    let arr = DiskArray::new(&cfg).unwrap();
    assert_eq!(arr.state(), ArrayState::Normal);
    arr.mount(false).unwrap();
    let mut back = vec![0u8; payload.len()];
    arr.read_bytes(32, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn degraded_array_still_serves_reads() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    let payload: Vec<u8> = (0..64u32).map(|i| (i * 3) as u8).collect();

    let arr = fresh_array(&cfg);
    arr.mount(true).unwrap();
    arr.write_bytes(0, &payload).unwrap();
    arr.unmount().unwrap();

    arr.take_disk_offline(1).unwrap();
    assert_eq!(arr.state(), ArrayState::Degraded);

    arr.mount(false).unwrap();
    let mut back = vec![0u8; payload.len()];
    arr.read_bytes(0, &mut back).unwrap();
    assert_eq!(back, payload, "reconstruction behind the byte API");
}

#[test]
fn too_many_erasures_fail_the_array() {
    // RS with a single check symbol cannot absorb two losses.
    let dir = TempDir::new().unwrap();
    let codec = CodecConfig::Rs {
        dimension: 4,
        redundancy: 1,
        interleaving: 1,
        stripe_unit_size: 16,
    };
    let cfg = array_config(&dir, codec, 5, 16 * 8, 2);
    let arr = fresh_array(&cfg);

    arr.take_disk_offline(0).unwrap();
    assert_eq!(arr.state(), ArrayState::Degraded);
    arr.take_disk_offline(3).unwrap();
    assert_eq!(arr.state(), ArrayState::Failed);

    assert!(arr.mount(false).is_err(), "failed arrays reject mounting");
    let mut buf = [0u8; 16];
    assert!(arr.read_bytes(0, &mut buf).is_err());
    assert!(arr.write_bytes(0, &buf).is_err());
}

#[test]
fn check_counts_corrupt_stripes() {
    let dir = TempDir::new().unwrap();
    let arr = fresh_array(&raid5_config(&dir));
    arr.mount(true).unwrap();

    let payload = vec![0x42u8; 256];
    arr.write_bytes(0, &payload).unwrap();
    assert_eq!(arr.check().unwrap(), 0);

    // Flip a byte of stripe 3 behind the codec's back.
    let mut block = vec![0u8; 16];
    arr.disks.read_blocks(0, 3, 1, &mut block).unwrap();
    block[9] ^= 0x80;
    arr.disks.write_blocks(0, 3, 1, &block).unwrap();

    assert_eq!(arr.check().unwrap(), 1);
    assert_eq!(
        arr.mount_state(),
        MountState::ReadWrite,
        "check restores the previous mount state"
    );
}

#[test]
fn stale_unmount_stamp_invalidates_the_disk() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    {
        let arr = fresh_array(&cfg);
        arr.mount(true).unwrap();
        arr.write_bytes(0, &[7u8; 32]).unwrap();
        arr.unmount().unwrap();
        // Rewind one disk's stamp as if it had missed the last session.
        arr.disks.with_disk(2, |d| {
            d.mount(true).unwrap();
            d.unmount(1).unwrap();
        });
    }

    let arr = DiskArray::new(&cfg).unwrap();
    assert_eq!(
        arr.disk_state(2),
        crate::retention::disk::DiskState::Invalid,
        "the laggard is stale"
    );
    assert_eq!(arr.state(), ArrayState::Degraded);
}

#[test]
fn mismatched_codec_record_invalidates_every_disk() {
    let dir = TempDir::new().unwrap();
    let cfg = raid5_config(&dir);
    {
        let arr = fresh_array(&cfg);
        arr.mount(true).unwrap();
        arr.unmount().unwrap();
    }

    let other = CodecConfig::Rs {
        dimension: 2,
        redundancy: 1,
        interleaving: 1,
        stripe_unit_size: 16,
    };
    let reopened = DiskArray::new(&array_config(&dir, other, 3, 16 * 8, 2)).unwrap();
    assert_eq!(reopened.state(), ArrayState::Uninitialized);
    for i in 0..reopened.num_disks() {
        assert_eq!(
            reopened.disk_state(i),
            crate::retention::disk::DiskState::Invalid
        );
    }
}

#[test]
fn concurrent_disjoint_writes_leave_a_consistent_array() {
    // RS(k=4, r=2), w=64, four lock slots, eight writer threads.
    let dir = TempDir::new().unwrap();
    let codec = CodecConfig::Rs {
        dimension: 4,
        redundancy: 2,
        interleaving: 1,
        stripe_unit_size: 64,
    };
    let cfg = array_config(&dir, codec, 6, 64 * 8, 4);
    let arr = std::sync::Arc::new(fresh_array(&cfg));
    arr.mount(true).unwrap();

    let stripe_bytes = 4 * 64u64;
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let arr = std::sync::Arc::clone(&arr);
            thread::spawn(move || {
                let block = vec![t as u8 + 1; stripe_bytes as usize];
                let n = arr.write_bytes(t * stripe_bytes, &block).unwrap();
                assert_eq!(n, block.len());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(arr.check().unwrap(), 0);
    for t in 0..8u64 {
        let mut back = vec![0u8; stripe_bytes as usize];
        arr.read_bytes(t * stripe_bytes, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == t as u8 + 1), "stripe {t}");
    }
}
