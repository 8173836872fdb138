//! Testbed usage scenarios driven by the CLI.
//!
//! Each scenario returns the process exit code: 0 for success, 2 for a
//! runtime failure, 3 for a data mismatch. Hard errors propagate as `Err`
//! and are mapped to exit code 2 by the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use raidec::retention::array::DiskArray;

use crate::cli::{AccessMode, BenchArgs, VerifyArgs};

/// Identifies the stored-file header on the volume.
const STORE_MAGIC: u32 = 0x600D_F11E;
/// Header layout: magic, payload size, SHA-256 of the payload.
const STORE_HEADER_LEN: usize = 4 + 8 + 32;

pub fn initialize(array: &DiskArray) -> Result<u8> {
    array.init().context("array initialization failed")?;
    println!("Array initialization successful");
    Ok(0)
}

/// Fill the volume with a deterministic integer sequence, self-check, read
/// everything back and compare.
pub fn integer_verify(array: &DiskArray, args: &VerifyArgs) -> Result<u8> {
    let capacity = array.capacity() as usize;
    let unit = array.stripe_unit_size();
    let request = if args.blocks_per_request == 0 {
        capacity
    } else {
        args.blocks_per_request as usize * unit
    };
    // Whole u32 counters only, rounded down to full requests.
    let total = (capacity / request) * request / 4 * 4;

    let offset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let mut data = vec![0u8; total];
    for (i, word) in data.chunks_exact_mut(4).enumerate() {
        word.copy_from_slice(&(i as u32).wrapping_add(offset).to_le_bytes());
    }

    array.mount(true).context("array mount failed")?;

    let started = Instant::now();
    let mut pos = 0usize;
    while pos < total {
        let n = array.write_bytes(pos as u64, &data[pos..(pos + request).min(total)])?;
        anyhow::ensure!(n > 0, "short write at byte {pos}");
        pos += n;
    }
    report_throughput("write", total, started.elapsed());

    let started = Instant::now();
    let corrupt = array.check()?;
    if corrupt != 0 {
        warn!(corrupt, "array self-check failed");
    }
    report_throughput("check", total, started.elapsed());

    let mut back = vec![0u8; total];
    let started = Instant::now();
    let mut pos = 0usize;
    while pos < total {
        let end = (pos + request).min(total);
        let n = array.read_bytes(pos as u64, &mut back[pos..end])?;
        anyhow::ensure!(n > 0, "short read at byte {pos}");
        pos += n;
    }
    report_throughput("read", total, started.elapsed());

    array.unmount()?;

    if back != data {
        let at = back
            .iter()
            .zip(&data)
            .position(|(a, b)| a != b)
            .unwrap_or(0);
        eprintln!("Verify failed at byte offset {at}");
        return Ok(3);
    }
    println!("Verification successful");
    Ok(0)
}

/// Store a file prefixed by `{magic, size, sha256}`.
pub fn store_file(array: &DiskArray, path: &std::path::Path) -> Result<u8> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", path.display());
            return Ok(3);
        }
    };
    let needed = STORE_HEADER_LEN as u64 + data.len() as u64;
    if needed > array.capacity() {
        eprintln!(
            "File of {} bytes does not fit a volume of {} bytes",
            data.len(),
            array.capacity()
        );
        return Ok(3);
    }

    let digest: [u8; 32] = Sha256::digest(&data).into();
    let mut header = Vec::with_capacity(STORE_HEADER_LEN);
    header.extend_from_slice(&STORE_MAGIC.to_le_bytes());
    header.extend_from_slice(&(data.len() as u64).to_le_bytes());
    header.extend_from_slice(&digest);

    array.mount(true).context("array mount failed")?;
    let started = Instant::now();
    write_all(array, 0, &header)?;
    write_all(array, STORE_HEADER_LEN as u64, &data)?;
    report_throughput("store", data.len(), started.elapsed());
    array.unmount()?;

    info!(bytes = data.len(), "file stored");
    println!("File stored successfully");
    Ok(0)
}

/// Extract a stored file, validating the header and payload checksum.
pub fn get_file(array: &DiskArray, path: &std::path::Path) -> Result<u8> {
    array.mount(false).context("array mount failed")?;

    let mut header = [0u8; STORE_HEADER_LEN];
    read_all(array, 0, &mut header)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != STORE_MAGIC {
        array.unmount()?;
        eprintln!("No stored file found on the array");
        return Ok(3);
    }
    let size = u64::from_le_bytes(header[4..12].try_into().unwrap());
    if STORE_HEADER_LEN as u64 + size > array.capacity() {
        array.unmount()?;
        eprintln!("Invalid file header");
        return Ok(3);
    }

    let mut data = vec![0u8; size as usize];
    let started = Instant::now();
    read_all(array, STORE_HEADER_LEN as u64, &mut data)?;
    report_throughput("get", data.len(), started.elapsed());
    array.unmount()?;

    let digest: [u8; 32] = Sha256::digest(&data).into();
    if digest != header[12..44] {
        eprintln!("File checksum mismatch");
        return Ok(3);
    }
    std::fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?;
    println!("File extracted successfully");
    Ok(0)
}

/// Verify every stripe of the (re)mounted array.
pub fn check(array: &DiskArray) -> Result<u8> {
    let corrupt = array.check()?;
    if corrupt == 0 {
        println!("Array is consistent");
        Ok(0)
    } else {
        eprintln!("Array is corrupted: {corrupt} invalid stripes");
        Ok(3)
    }
}

/// Multi-threaded read/write load with a fixed duration.
pub fn benchmark(array: &Arc<DiskArray>, args: &BenchArgs) -> Result<u8> {
    array.mount(true).context("array mount failed")?;
    let capacity = array.capacity();
    let block = args.block_size as u64;
    if block == 0 || block > capacity {
        eprintln!("Block size {block} does not fit the volume");
        return Ok(3);
    }
    let max_offset = capacity - block;

    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));
    let writes = Arc::new(AtomicU64::new(0));
    let ops = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    let mut handles = Vec::new();
    for worker in 0..args.threads {
        let array = Arc::clone(array);
        let done = Arc::clone(&done);
        let reads = Arc::clone(&reads);
        let writes = Arc::clone(&writes);
        let ops = Arc::clone(&ops);
        let args = args.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = rand::rng();
            let mut buf = vec![0u8; args.block_size];
            rng.fill(&mut buf[..]);
            // Spread linear workers across the volume.
            let mut pos = (worker as u64 * block) % (max_offset + 1);
            while !done.load(Ordering::Relaxed) {
                let offset = match args.mode {
                    AccessMode::Random => {
                        let raw = rng.random_range(0..=max_offset);
                        if args.aligned { (raw / block) * block } else { raw }
                    }
                    AccessMode::Linear => {
                        let cur = pos;
                        pos += block;
                        if pos > max_offset {
                            pos = 0;
                        }
                        cur
                    }
                };
                if rng.random::<f64>() < args.write_ratio {
                    array.write_bytes(offset, &buf)?;
                    writes.fetch_add(block, Ordering::Relaxed);
                } else {
                    array.read_bytes(offset, &mut buf)?;
                    reads.fetch_add(block, Ordering::Relaxed);
                }
                ops.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }));
    }

    thread::sleep(Duration::from_secs(args.duration));
    done.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().expect("benchmark worker panicked")?;
    }
    let elapsed = started.elapsed();
    array.unmount()?;

    let read_bytes = reads.load(Ordering::Relaxed);
    let written_bytes = writes.load(Ordering::Relaxed);
    let total_ops = ops.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    println!("{total_ops} operations in {secs:.2} s ({:.0} IOPS)", total_ops as f64 / secs);
    println!(
        "read {:.0} bytes/s, write {:.0} bytes/s",
        read_bytes as f64 / secs,
        written_bytes as f64 / secs
    );
    Ok(0)
}

fn write_all(array: &DiskArray, start: u64, data: &[u8]) -> Result<()> {
    let mut done = 0usize;
    while done < data.len() {
        let n = array.write_bytes(start + done as u64, &data[done..])?;
        anyhow::ensure!(n > 0, "short write at offset {}", start + done as u64);
        done += n;
    }
    Ok(())
}

fn read_all(array: &DiskArray, start: u64, data: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    while done < data.len() {
        let n = array.read_bytes(start + done as u64, &mut data[done..])?;
        anyhow::ensure!(n > 0, "short read at offset {}", start + done as u64);
        done += n;
    }
    Ok(())
}

fn report_throughput(what: &str, bytes: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("{what} throughput: {:.0} bytes/s", bytes as f64 / secs);
}
