//! The disk array: a byte-addressable volume over erasure-coded stripes.
//!
//! Owns the disks, the codec, the stripe-range locker, and the per-thread
//! partial-unit scratch. Byte-level reads and writes acquire a range lock
//! over the touched stripes, handle unaligned edges through read-modify-write
//! of a single stripe unit, and hand whole units to the codec.

#[cfg(test)]
mod array_tests;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail, ensure};
use tracing::{info, warn};

use crate::layout::codec::{CodecConfig, StripeCodec};
use crate::retention::disk::{Disk, DiskSet, DiskState, MountState};
use crate::retention::locker::{RangeGuard, RangeLocker};

/// Bytes reserved on each disk for the serialized codec configuration.
const ARRAY_DATA_CAPACITY: usize = 256;

/// Possible states of the disk array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrayState {
    /// No disk has ever been reset.
    Uninitialized,
    /// More disks are gone than the code can correct; the data is lost.
    Failed,
    /// Some disks are offline but every erasure pattern is correctable.
    Degraded,
    /// All disks online.
    Normal,
}

/// One emulated disk of the array configuration.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub path: PathBuf,
    /// Whether the disk takes part in the array; offline disks become
    /// erasures.
    pub online: bool,
}

/// Full construction-time configuration of a volume.
#[derive(Debug, Clone)]
pub struct ArrayConfig {
    pub codec: CodecConfig,
    pub disks: Vec<DiskSpec>,
    /// Payload capacity of a single disk in bytes.
    pub disk_capacity: u64,
    pub max_threads: usize,
}

struct Status {
    array: ArrayState,
    mount: MountState,
}

pub struct DiskArray {
    disks: Arc<DiskSet>,
    engine: Box<dyn StripeCodec>,
    locker: RangeLocker,
    /// Per-thread scratch for partial stripe-unit reads and writes.
    partial: Vec<Mutex<Vec<u8>>>,
    status: Mutex<Status>,
    stripe_unit_size: usize,
    /// Payload units per subarray stripe (`k * u`).
    units_per_subarray: usize,
    /// Payload units per full stripe (`k * u * s`).
    units_per_stripe: usize,
    num_stripes: u64,
    /// Payload bytes per full stripe.
    stripe_bytes: u64,
    interleaving: usize,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DiskArray {
    /// Attach the disks, elect the online set from the last-unmount stamps,
    /// build the codec, and derive the array state.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the codec cannot
    /// be constructed. Disk-level problems do not fail construction; they
    /// surface as `Invalid` disks and a `Degraded`/`Failed` array.
    pub fn new(cfg: &ArrayConfig) -> Result<Self> {
        let params = cfg.codec.params();
        params.validate()?;
        ensure!(cfg.max_threads > 0, "at least one thread is required");
        let num_disks = params.num_disks();
        ensure!(
            cfg.disks.len() >= num_disks,
            "the code needs {num_disks} disks but only {} are configured",
            cfg.disks.len()
        );

        let w = params.stripe_unit_size;
        let num_stripes = cfg.disk_capacity / (w as u64 * params.units_per_symbol as u64);
        ensure!(num_stripes > 0, "disk capacity is below a single stripe");
        let blocks_per_disk = num_stripes * params.units_per_symbol as u64;

        let record = serde_json::to_vec(&cfg.codec).context("serializing the codec record")?;
        ensure!(
            record.len() <= ARRAY_DATA_CAPACITY,
            "codec record exceeds the array-data slot"
        );

        // Attach every disk; compare its stored configuration with ours and
        // remember the newest clean-unmount stamp among the candidates.
        let mut disks = Vec::with_capacity(num_disks);
        let mut last_array_unmount = 0u64;
        for (i, spec) in cfg.disks.iter().take(num_disks).enumerate() {
            let mut disk = Disk::initialize(&spec.path, i as u32, w, blocks_per_disk, ARRAY_DATA_CAPACITY);
            if disk.state() == DiskState::Offline {
                if disk.array_data() != record.as_slice() {
                    warn!(disk = i, "array configuration mismatch");
                    disk.set_state(DiskState::Invalid);
                } else {
                    last_array_unmount = last_array_unmount.max(disk.last_unmount());
                }
            }
            disk.set_array_data(&record)?;
            disks.push(disk);
        }

        // Take online the configured disks whose stamp matches the maximum;
        // an older stamp means the disk missed writes and its data is stale.
        let mut initialized = 0usize;
        let mut online = 0usize;
        for (disk, spec) in disks.iter_mut().zip(&cfg.disks) {
            if disk.state() == DiskState::Offline && spec.online {
                initialized += 1;
                if disk.last_unmount() == last_array_unmount {
                    disk.set_state(DiskState::Online);
                    online += 1;
                } else {
                    warn!(disk = disk.disk_id(), "stale unmount stamp, marking invalid");
                    disk.set_state(DiskState::Invalid);
                }
            }
        }

        let disks = Arc::new(DiskSet::new(disks));
        let engine = cfg.codec.build(Arc::clone(&disks), cfg.max_threads)?;
        engine.reset_erasures();

        let array = if initialized == 0 {
            ArrayState::Uninitialized
        } else if online == num_disks {
            ArrayState::Normal
        } else if engine.is_mountable() {
            ArrayState::Degraded
        } else {
            ArrayState::Failed
        };

        Ok(Self {
            disks,
            engine,
            locker: RangeLocker::new(cfg.max_threads),
            partial: (0..cfg.max_threads).map(|_| Mutex::new(vec![0u8; w])).collect(),
            status: Mutex::new(Status {
                array,
                mount: MountState::Unmounted,
            }),
            stripe_unit_size: w,
            units_per_subarray: params.units_per_subarray_stripe(),
            units_per_stripe: params.units_per_subarray_stripe() * params.interleaving,
            num_stripes,
            stripe_bytes: (params.units_per_subarray_stripe() * params.interleaving * w) as u64,
            interleaving: params.interleaving,
        })
    }

    #[must_use]
    pub fn state(&self) -> ArrayState {
        self.status.lock().unwrap().array
    }

    #[must_use]
    pub fn mount_state(&self) -> MountState {
        self.status.lock().unwrap().mount
    }

    /// Payload capacity of the volume in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.num_stripes * self.units_per_stripe as u64 * self.stripe_unit_size as u64
    }

    #[must_use]
    pub const fn stripe_unit_size(&self) -> usize {
        self.stripe_unit_size
    }

    #[must_use]
    pub const fn num_stripes(&self) -> u64 {
        self.num_stripes
    }

    #[must_use]
    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    #[must_use]
    pub fn disk_state(&self, disk: usize) -> DiskState {
        self.disks.state(disk)
    }

    #[must_use]
    pub fn status_string(&self) -> String {
        let mut out = String::new();
        let status = self.status.lock().unwrap();
        let _ = writeln!(out, "array: {:?}, mount: {:?}", status.array, status.mount);
        for i in 0..self.disks.len() {
            let _ = writeln!(out, "disk {i}: {:?}", self.disks.state(i));
        }
        out
    }

    /// Reset every disk and persist the codec record; the array must be
    /// unmounted.
    ///
    /// # Errors
    /// Returns an error if a disk cannot be rebuilt or the resulting array
    /// is not mountable.
    pub fn init(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        ensure!(
            status.mount == MountState::Unmounted,
            "the array must be unmounted before initialization"
        );
        status.array = ArrayState::Uninitialized;
        for i in 0..self.disks.len() {
            self.disks.with_disk(i, |d| {
                if d.state() == DiskState::Online {
                    d.set_state(DiskState::Offline);
                }
                d.reset_disk()
            })?;
        }
        self.engine.reset_erasures();
        if self.engine.is_mountable() {
            status.array = ArrayState::Normal;
            info!("array initialized");
            Ok(())
        } else {
            status.array = ArrayState::Failed;
            bail!("the initialized array is not mountable")
        }
    }

    /// Enable data access. All-or-nothing: if any online disk fails to
    /// mount, every disk is rolled back and the array stays unmounted.
    ///
    /// # Errors
    /// Returns an error if the array state forbids mounting or a disk mount
    /// fails.
    pub fn mount(&self, write: bool) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        if status.array == ArrayState::Failed || status.array == ArrayState::Uninitialized {
            bail!("array in state {:?} cannot be mounted", status.array);
        }
        ensure!(
            status.mount == MountState::Unmounted,
            "the array is already mounted"
        );

        let mut mounted = Vec::new();
        for i in 0..self.disks.len() {
            if self.disks.state(i) != DiskState::Online {
                continue;
            }
            match self.disks.with_disk(i, |d| d.mount(write)) {
                Ok(()) => mounted.push(i),
                Err(e) => {
                    for &j in &mounted {
                        self.disks.with_disk(j, Disk::abort_mount);
                    }
                    return Err(e.context(format!("mounting disk {i}")));
                }
            }
        }
        status.mount = if write {
            MountState::ReadWrite
        } else {
            MountState::Read
        };
        Ok(())
    }

    /// Disable data access and stamp the unmount time into every disk.
    ///
    /// # Errors
    /// Returns an error if the array is not mounted.
    pub fn unmount(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        ensure!(status.mount != MountState::Unmounted, "the array is not mounted");
        status.mount = MountState::Unmounted;
        drop(status);
        let ts = now_secs();
        for i in 0..self.disks.len() {
            self.disks.with_disk(i, |d| d.unmount(ts))?;
        }
        Ok(())
    }

    /// Take a disk offline; allowed only while unmounted. Rebuilds the
    /// erasure bookkeeping and re-derives the array state.
    ///
    /// # Errors
    /// Returns an error if the array is mounted or the index is out of
    /// range.
    pub fn take_disk_offline(&self, disk: usize) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        ensure!(
            status.mount == MountState::Unmounted,
            "cannot change the disk set while mounted"
        );
        ensure!(disk < self.disks.len(), "disk index {disk} out of range");
        self.disks.with_disk(disk, |d| d.set_state(DiskState::Offline));
        self.engine.reset_erasures();
        status.array = self.derive_state();
        Ok(())
    }

    /// Bring an offline disk back online without rebuilding its contents.
    ///
    /// # Errors
    /// Returns an error if the array is mounted or the index is out of
    /// range.
    pub fn bring_disk_online(&self, disk: usize) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        ensure!(
            status.mount == MountState::Unmounted,
            "cannot change the disk set while mounted"
        );
        ensure!(disk < self.disks.len(), "disk index {disk} out of range");
        self.disks.with_disk(disk, |d| d.set_state(DiskState::Online));
        self.engine.reset_erasures();
        status.array = self.derive_state();
        Ok(())
    }

    fn derive_state(&self) -> ArrayState {
        let all_online = (0..self.disks.len()).all(|i| self.disks.state(i) == DiskState::Online);
        if all_online {
            ArrayState::Normal
        } else if self.engine.is_mountable() {
            ArrayState::Degraded
        } else {
            ArrayState::Failed
        }
    }

    /// Read bytes at `pos`, clamped to the volume capacity.
    ///
    /// # Errors
    /// Returns an error if the array is not mounted or a stripe cannot be
    /// decoded.
    ///
    /// # Returns
    /// The number of bytes actually read.
    pub fn read_bytes(&self, pos: u64, dst: &mut [u8]) -> Result<usize> {
        ensure!(
            self.mount_state() != MountState::Unmounted,
            "the array is not mounted"
        );
        let capacity = self.capacity();
        if pos >= capacity {
            return Ok(0);
        }
        let len = (dst.len() as u64).min(capacity - pos) as usize;
        if len == 0 {
            return Ok(0);
        }
        let end = pos + len as u64;
        let w = self.stripe_unit_size;

        let guard = RangeGuard::acquire(
            &self.locker,
            pos / self.stripe_bytes,
            end.div_ceil(self.stripe_bytes),
        );
        let thread = guard.thread_id();

        let mut unit = pos / w as u64;
        let offset = (pos % w as u64) as usize;
        let mut done = 0usize;

        if offset != 0 {
            let mut scratch = self.partial[thread].lock().unwrap();
            self.read_units(unit, 1, &mut scratch, thread)?;
            let take = (w - offset).min(len);
            dst[..take].copy_from_slice(&scratch[offset..offset + take]);
            done += take;
            unit += 1;
        }

        let whole = (len - done) / w;
        if whole > 0 {
            self.read_units(unit, whole as u64, &mut dst[done..done + whole * w], thread)?;
            unit += whole as u64;
            done += whole * w;
        }

        if done < len {
            let mut scratch = self.partial[thread].lock().unwrap();
            self.read_units(unit, 1, &mut scratch, thread)?;
            dst[done..len].copy_from_slice(&scratch[..len - done]);
            done = len;
        }
        Ok(done)
    }

    /// Write bytes at `pos`, clamped to the volume capacity. Unaligned
    /// leading and trailing stripe units are read, patched, and written
    /// back.
    ///
    /// # Errors
    /// Returns an error if the array is not write-mounted or a stripe
    /// operation fails.
    ///
    /// # Returns
    /// The number of bytes actually written.
    pub fn write_bytes(&self, pos: u64, src: &[u8]) -> Result<usize> {
        ensure!(
            self.mount_state() == MountState::ReadWrite,
            "the array is not mounted for writing"
        );
        let capacity = self.capacity();
        if pos >= capacity {
            return Ok(0);
        }
        let len = (src.len() as u64).min(capacity - pos) as usize;
        if len == 0 {
            return Ok(0);
        }
        let end = pos + len as u64;
        let w = self.stripe_unit_size;

        let guard = RangeGuard::acquire(
            &self.locker,
            pos / self.stripe_bytes,
            end.div_ceil(self.stripe_bytes),
        );
        let thread = guard.thread_id();

        let mut unit = pos / w as u64;
        let offset = (pos % w as u64) as usize;
        let mut done = 0usize;

        if offset != 0 {
            let mut scratch = self.partial[thread].lock().unwrap();
            self.read_units(unit, 1, &mut scratch, thread)?;
            let take = (w - offset).min(len);
            scratch[offset..offset + take].copy_from_slice(&src[..take]);
            self.write_units(unit, 1, &scratch, thread)?;
            done += take;
            unit += 1;
        }

        let whole = (len - done) / w;
        if whole > 0 {
            self.write_units(unit, whole as u64, &src[done..done + whole * w], thread)?;
            unit += whole as u64;
            done += whole * w;
        }

        if done < len {
            let mut scratch = self.partial[thread].lock().unwrap();
            self.read_units(unit, 1, &mut scratch, thread)?;
            scratch[..len - done].copy_from_slice(&src[done..]);
            self.write_units(unit, 1, &scratch, thread)?;
            done = len;
        }
        Ok(done)
    }

    /// Walk `(stripe, subarray, unit)` over a run of payload stripe units.
    fn read_units(&self, first_unit: u64, count: u64, dst: &mut [u8], thread: usize) -> Result<()> {
        let upsp = self.units_per_subarray as u64;
        let ups = self.units_per_stripe as u64;
        let w = self.stripe_unit_size;

        let mut stripe = first_unit / ups;
        let in_stripe = first_unit % ups;
        let mut subarray = (in_stripe / upsp) as usize;
        let mut cur = in_stripe % upsp;
        let mut remaining = count;
        let mut pos = 0usize;
        while remaining > 0 {
            let take = (upsp - cur).min(remaining) as usize;
            self.engine.read_data(
                stripe,
                cur as usize,
                subarray,
                take,
                &mut dst[pos..pos + take * w],
                thread,
            )?;
            pos += take * w;
            remaining -= take as u64;
            cur = 0;
            subarray += 1;
            if subarray == self.interleaving {
                subarray = 0;
                stripe += 1;
            }
        }
        Ok(())
    }

    fn write_units(&self, first_unit: u64, count: u64, src: &[u8], thread: usize) -> Result<()> {
        let upsp = self.units_per_subarray as u64;
        let ups = self.units_per_stripe as u64;
        let w = self.stripe_unit_size;

        let mut stripe = first_unit / ups;
        let in_stripe = first_unit % ups;
        let mut subarray = (in_stripe / upsp) as usize;
        let mut cur = in_stripe % upsp;
        let mut remaining = count;
        let mut pos = 0usize;
        while remaining > 0 {
            let take = (upsp - cur).min(remaining) as usize;
            self.engine.write_data(
                stripe,
                cur as usize,
                subarray,
                take,
                &src[pos..pos + take * w],
                thread,
            )?;
            pos += take * w;
            remaining -= take as u64;
            cur = 0;
            subarray += 1;
            if subarray == self.interleaving {
                subarray = 0;
                stripe += 1;
            }
        }
        Ok(())
    }

    /// Verify every `(stripe, subarray)` codeword under a read-only remount.
    ///
    /// # Errors
    /// Returns an error if the remount dance fails; verification failures
    /// are counted, not propagated.
    ///
    /// # Returns
    /// The number of corrupt codewords.
    pub fn check(&self) -> Result<u64> {
        let guard = RangeGuard::acquire(&self.locker, 0, self.num_stripes);
        let thread = guard.thread_id();

        let previous = {
            let mut status = self.status.lock().unwrap();
            let prev = status.mount;
            status.mount = MountState::Unmounted;
            prev
        };
        if previous != MountState::Unmounted {
            let ts = now_secs();
            for i in 0..self.disks.len() {
                self.disks.with_disk(i, |d| d.unmount(ts))?;
            }
        }
        for i in 0..self.disks.len() {
            if self.disks.state(i) == DiskState::Online {
                self.disks.with_disk(i, |d| d.mount(false))?;
            }
        }

        let mut corrupt = 0u64;
        for stripe in 0..self.num_stripes {
            for subarray in 0..self.interleaving {
                match self.engine.verify_stripe(stripe, subarray, thread) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(stripe, subarray, "invalid stripe");
                        corrupt += 1;
                    }
                    Err(e) => {
                        warn!(stripe, subarray, "stripe verification failed: {e:#}");
                        corrupt += 1;
                    }
                }
            }
        }

        let ts = now_secs();
        for i in 0..self.disks.len() {
            self.disks.with_disk(i, |d| d.unmount(ts))?;
        }
        drop(guard);
        if previous != MountState::Unmounted {
            self.mount(previous == MountState::ReadWrite)?;
        }
        Ok(corrupt)
    }
}
