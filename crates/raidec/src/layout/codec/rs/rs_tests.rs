use super::*;
use crate::layout::codec::EncodingStrategy;
use crate::retention::disk::{Disk, DiskState};
use rand::RngCore;
use tempfile::TempDir;

const BLOCKS: u64 = 8;

fn online_set(dir: &TempDir, num_disks: usize, w: usize) -> Arc<DiskSet> {
    let disks = (0..num_disks)
        .map(|i| {
            let path = dir.path().join(format!("disk-{i}.img"));
            let mut d = Disk::initialize(&path, i as u32, w, BLOCKS, 64);
            d.reset_disk().unwrap();
            d.mount(true).unwrap();
            d
        })
        .collect();
    Arc::new(DiskSet::new(disks))
}

fn rs_codec(disks: Arc<DiskSet>, k: usize, r: usize, w: usize) -> RsProcessor {
    let params = CodecParams {
        length: k + r,
        dimension: k,
        stripe_unit_size: w,
        units_per_symbol: 1,
        interleaving: 1,
    };
    RsProcessor::new(params, r, disks, 2).unwrap()
}

fn set_offline(disks: &DiskSet, codec: &RsProcessor, offline: &[usize]) {
    for i in 0..disks.len() {
        let state = if offline.contains(&i) {
            DiskState::Offline
        } else {
            DiskState::Online
        };
        disks.with_disk(i, |d| d.set_state(state));
    }
    codec.reset_erasures();
}

#[test]
fn check_and_information_positions_partition_the_prefix() {
    let dir = TempDir::new().unwrap();
    let disks = online_set(&dir, 13, 16);
    let codec = rs_codec(disks, 10, 3, 16);
    assert_eq!(codec.check_positions, vec![252, 253, 254]);
    assert_eq!(codec.info_positions, (0..10).collect::<Vec<i32>>());
    assert_eq!(codec.check_locator[0], 1, "Lambda(0) = 1");
    assert_eq!(codec.check_locator.len(), 4);
}

#[test]
fn construction_rejects_bad_geometry() {
    let dir = TempDir::new().unwrap();
    let disks = online_set(&dir, 13, 16);
    let params = CodecParams {
        length: 13,
        dimension: 10,
        stripe_unit_size: 16,
        units_per_symbol: 1,
        interleaving: 1,
    };
    assert!(RsProcessor::new(params, 0, Arc::clone(&disks), 2).is_err());
    assert!(RsProcessor::new(params, 4, Arc::clone(&disks), 2).is_err());

    let oversized = CodecParams {
        length: 256,
        dimension: 200,
        stripe_unit_size: 16,
        units_per_symbol: 1,
        interleaving: 1,
    };
    assert!(RsProcessor::new(oversized, 56, disks, 2).is_err());
}

#[test]
fn encode_then_decode_roundtrips_without_erasures() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (10, 3, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(disks, k, r, w);

    let mut payload = vec![0u8; k * w];
    rand::rng().fill_bytes(&mut payload);
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    let mut out = vec![0u8; k * w];
    codec.decode_symbols(0, 0, 0, k, &mut out, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn every_erasure_pattern_within_redundancy_is_recovered() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (4, 2, 16);
    let n = k + r;
    let disks = online_set(&dir, n, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let mut payload = vec![0u8; k * w];
    rand::rng().fill_bytes(&mut payload);
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    let mut patterns: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    for a in 0..n {
        for b in a + 1..n {
            patterns.push(vec![a, b]);
        }
    }

    for pattern in &patterns {
        set_offline(&disks, &codec, pattern);
        assert!(codec.is_correctable(0), "pattern {pattern:?}");
        assert!(codec.is_mountable(), "pattern {pattern:?}");

        let mut out = vec![0u8; k * w];
        codec.decode_symbols(0, 0, 0, k, &mut out, 0).unwrap();
        assert_eq!(out, payload, "pattern {pattern:?}");
    }
}

#[test]
fn erasures_beyond_the_redundancy_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (4, 2, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    set_offline(&disks, &codec, &[0, 3, 5]);
    assert!(!codec.is_correctable(0));
    assert!(!codec.is_mountable());
}

#[test]
fn deterministic_payload_survives_three_disk_losses() {
    // RS(k=10, r=3), w=16, one subarray across 13 disks.
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (10, 3, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| i as u8).collect();
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    set_offline(&disks, &codec, &[2, 7, 11]);
    assert!(codec.is_correctable(0));

    let mut out = vec![0u8; k * w];
    codec.decode_symbols(0, 0, 0, k, &mut out, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn partial_range_decode_recovers_only_requested_symbols() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (10, 3, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| (i % 241) as u8).collect();
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    set_offline(&disks, &codec, &[3]);
    assert!(codec.is_correctable(0));

    // Symbols [2, 5) straddle the erased symbol 3.
    let mut out = vec![0u8; 3 * w];
    codec.decode_symbols(0, 0, 2, 3, &mut out, 0).unwrap();
    assert_eq!(out, payload[2 * w..5 * w]);
}

#[test]
fn delta_update_patches_check_symbols_consistently() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (10, 3, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| i as u8).collect();
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    // Overwrite bytes [32, 64), i.e. stripe units 2 and 3, through the
    // strategy gate: two of ten units stays well under the full-encode
    // threshold.
    let patch = vec![0xAAu8; 2 * w];
    codec.write_data(0, 2, 0, 2, &patch, 0).unwrap();

    let mut out = vec![0u8; k * w];
    codec.read_data(0, 0, 0, k, &mut out, 0).unwrap();
    assert_eq!(&out[..2 * w], &payload[..2 * w]);
    assert_eq!(&out[2 * w..4 * w], &patch[..]);
    assert_eq!(&out[4 * w..], &payload[4 * w..]);

    assert!(codec.verify_stripe(0, 0, 0).unwrap(), "checks must still hold");
}

#[test]
fn updates_remain_decodable_after_later_losses() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (6, 2, 32);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let mut payload = vec![0u8; k * w];
    rand::rng().fill_bytes(&mut payload);
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    let patch = vec![0x5Au8; w];
    codec.update_information_symbols(0, 0, 4, 1, &patch, 0).unwrap();
    payload[4 * w..5 * w].copy_from_slice(&patch);

    set_offline(&disks, &codec, &[1, 4]);
    assert!(codec.is_correctable(0));
    let mut out = vec![0u8; k * w];
    codec.decode_symbols(0, 0, 0, k, &mut out, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn cyclic_rotation_is_honoured_for_later_stripes() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (4, 2, 16);
    let n = k + r;
    let disks = online_set(&dir, n, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let stripe = 3u64;
    let eid = codec.core().erasure_set(stripe, 0);
    assert_eq!(eid, 3);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| (7 + i % 200) as u8).collect();
    codec.encode_stripe(stripe, eid, &payload, 0).unwrap();

    // Symbol 0 of this stripe lives on disk 3; losing that disk erases
    // logical symbol 0 under the rotated mapping.
    set_offline(&disks, &codec, &[3]);
    assert!(codec.is_correctable(eid));
    assert_eq!(codec.core().erased_position(eid, 0), Some(0));

    let mut out = vec![0u8; k * w];
    codec.decode_symbols(stripe, eid, 0, k, &mut out, 0).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn verify_detects_any_single_corrupt_symbol() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (4, 2, 16);
    let n = k + r;
    let disks = online_set(&dir, n, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| i as u8).collect();
    codec.encode_stripe(0, 0, &payload, 0).unwrap();
    assert!(codec.check_codeword(0, 0, 0).unwrap());

    for disk in 0..n {
        let mut block = vec![0u8; w];
        disks.read_blocks(disk, 0, 1, &mut block).unwrap();
        block[5] ^= 0x40;
        disks.write_blocks(disk, 0, 1, &block).unwrap();
        assert!(
            !codec.check_codeword(0, 0, 0).unwrap(),
            "corruption on disk {disk} must not pass"
        );
        block[5] ^= 0x40;
        disks.write_blocks(disk, 0, 1, &block).unwrap();
    }
}

#[test]
fn an_erasure_inside_the_update_range_forces_full_encode() {
    let dir = TempDir::new().unwrap();
    let (k, r, w) = (10, 3, 16);
    let disks = online_set(&dir, k + r, w);
    let codec = rs_codec(Arc::clone(&disks), k, r, w);

    let payload: Vec<u8> = (0..(k * w) as u32).map(|i| i as u8).collect();
    codec.encode_stripe(0, 0, &payload, 0).unwrap();

    set_offline(&disks, &codec, &[4]);
    assert!(codec.is_correctable(0));

    assert_eq!(
        codec.encoding_strategy(0, 3, 2),
        EncodingStrategy::FullEncode,
        "erased symbol 4 sits inside [3, 5)"
    );
    assert_eq!(
        codec.encoding_strategy(0, 5, 2),
        EncodingStrategy::DeltaUpdate,
        "no erasure inside [5, 7)"
    );

    // The spliced write path must still produce a decodable stripe.
    let patch = vec![0x33u8; 2 * w];
    codec.write_data(0, 3, 0, 2, &patch, 0).unwrap();

    let mut out = vec![0u8; k * w];
    codec.read_data(0, 0, 0, k, &mut out, 0).unwrap();
    assert_eq!(&out[..3 * w], &payload[..3 * w]);
    assert_eq!(&out[3 * w..5 * w], &patch[..]);
    assert_eq!(&out[5 * w..], &payload[5 * w..]);
}

#[test]
fn forney_multiple_inverts_the_locator_derivative() {
    let gf = GfTables::global();
    // Lambda(x) = (1 - x a^5)(1 - x a^9); by construction
    // Lambda'(x) = a^5 (1 - x a^9) + a^9 (1 - x a^5) in characteristic 2.
    let mut lambda = vec![0u8; 3];
    locator_poly(gf, [5, 9].into_iter(), &mut lambda);
    assert_eq!(lambda[0], 1);

    for &x in &[5, 9] {
        let got = forney_multiple(gf, 2, &lambda, 0, x);
        // Reference: evaluate Lambda'(1/X) directly. The derivative of a
        // degree-2 polynomial keeps only the coefficient of x^1.
        let deriv = lambda[1];
        let expected_log = (x + (255 - gf.log(deriv))).rem_euclid(255);
        assert_eq!(got, expected_log, "locator a^{x}");
    }
}
