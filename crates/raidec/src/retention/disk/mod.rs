//! File-backed hard disk emulator.
//!
//! Each disk is an ordinary file: a small serialized header, the array
//! configuration record, and a zero-based payload of fixed-size blocks,
//! accessed through a writable memory map. A disk that fails validation or
//! hits an I/O fault drops to `Invalid` and stays there until it is reset.

#[cfg(test)]
mod disk_tests;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::{self, IoOpType};

/// File format identifier.
pub const DISK_MAGIC: u32 = 0x600D_F00D;
/// Version of the on-disk header layout.
pub const DISK_HEADER_VERSION: u32 = 1;
/// Bytes reserved at the start of the image for the serialized header.
const HEADER_REGION: usize = 512;

/// Possible disk states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiskState {
    /// The disk image was not properly initialized or has stale data.
    Invalid,
    /// The disk is valid but not taken into the array.
    Offline,
    /// The disk is accessible and assumed to contain correct data.
    Online,
}

/// Possible mount states, shared by disks and the array.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Read,
    ReadWrite,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct DiskHeader {
    magic: u32,
    version: u32,
    disk_id: u32,
    block_size: u64,
    num_blocks: u64,
    array_data_len: u64,
    valid: bool,
    /// Seconds since the epoch of the last write-unmount.
    last_unmount: u64,
}

/// Block-based access to a hard disk emulated as an ordinary file.
pub struct Disk {
    path: PathBuf,
    disk_id: u32,
    block_size: usize,
    num_blocks: u64,
    array_data_capacity: usize,
    payload_offset: usize,
    state: DiskState,
    mount: MountState,
    last_unmount: u64,
    array_data: Vec<u8>,
    file: Option<File>,
    map: Option<MmapMut>,
}

impl Disk {
    /// Open and validate an existing disk image.
    ///
    /// A missing file or any header mismatch (magic, version, id, geometry,
    /// valid flag) leaves the disk in the `Invalid` state rather than
    /// failing: the array decides what to do with such a disk, and
    /// [`Self::reset_disk`] can always rebuild it.
    #[must_use]
    pub fn initialize(
        path: &Path,
        disk_id: u32,
        block_size: usize,
        num_blocks: u64,
        array_data_capacity: usize,
    ) -> Self {
        let payload_offset =
            (HEADER_REGION + 4 + array_data_capacity).div_ceil(block_size) * block_size;
        let mut disk = Self {
            path: path.to_path_buf(),
            disk_id,
            block_size,
            num_blocks,
            array_data_capacity,
            payload_offset,
            state: DiskState::Invalid,
            mount: MountState::Unmounted,
            last_unmount: 0,
            array_data: Vec::new(),
            file: None,
            map: None,
        };
        match disk.try_open() {
            Ok(()) => disk.state = DiskState::Offline,
            Err(e) => {
                warn!(disk_id, path = %path.display(), "disk validation failed: {e:#}");
                disk.state = DiskState::Invalid;
                disk.file = None;
                disk.map = None;
            }
        }
        disk
    }

    fn image_len(&self) -> usize {
        self.payload_offset + self.num_blocks as usize * self.block_size
    }

    fn try_open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("opening disk image {}", self.path.display()))?;
        let len = file.metadata()?.len();
        if len < self.image_len() as u64 {
            bail!("disk image is truncated: {len} < {}", self.image_len());
        }
        let map = unsafe { MmapOptions::new().len(self.image_len()).map_mut(&file)? };

        let header_len = u32::from_le_bytes(map[0..4].try_into().unwrap()) as usize;
        if header_len == 0 || header_len > HEADER_REGION - 4 {
            bail!("corrupt disk header length {header_len}");
        }
        let header: DiskHeader = serde_json::from_slice(&map[4..4 + header_len])
            .context("deserializing disk header")?;
        if header.magic != DISK_MAGIC {
            bail!("bad magic number {:#010X}", header.magic);
        }
        if header.version != DISK_HEADER_VERSION {
            bail!("unsupported header version {}", header.version);
        }
        if header.disk_id != self.disk_id {
            bail!("disk id mismatch: image says {}", header.disk_id);
        }
        if header.block_size != self.block_size as u64 || header.num_blocks != self.num_blocks {
            bail!(
                "geometry mismatch: image is {}x{} blocks",
                header.num_blocks,
                header.block_size
            );
        }
        if header.array_data_len as usize > self.array_data_capacity {
            bail!("array data record does not fit the configured capacity");
        }
        if !header.valid {
            bail!("disk was not cleanly initialized");
        }

        let data_len = header.array_data_len as usize;
        let stored = u32::from_le_bytes(
            map[HEADER_REGION..HEADER_REGION + 4].try_into().unwrap(),
        ) as usize;
        if stored != data_len {
            bail!("array data length mismatch");
        }
        self.array_data = map[HEADER_REGION + 4..HEADER_REGION + 4 + data_len].to_vec();
        self.last_unmount = header.last_unmount;
        self.file = Some(file);
        self.map = Some(map);
        Ok(())
    }

    /// Rebuild the image zero-filled at full size, persist the header and the
    /// array data record, and bring the disk `Online`.
    ///
    /// # Errors
    /// Returns an error if the disk is mounted or the image cannot be
    /// recreated.
    pub fn reset_disk(&mut self) -> Result<()> {
        if self.mount != MountState::Unmounted {
            bail!("cannot reset a mounted disk");
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("recreating disk image {}", self.path.display()))?;
        file.set_len(self.image_len() as u64)?;
        let mut map = unsafe { MmapOptions::new().len(self.image_len()).map_mut(&file)? };

        self.last_unmount = 0;
        write_array_data(&mut map, &self.array_data);
        write_header(&mut map, &self.header())?;
        map.flush()?;

        self.file = Some(file);
        self.map = Some(map);
        self.state = DiskState::Online;
        Ok(())
    }

    fn header(&self) -> DiskHeader {
        DiskHeader {
            magic: DISK_MAGIC,
            version: DISK_HEADER_VERSION,
            disk_id: self.disk_id,
            block_size: self.block_size as u64,
            num_blocks: self.num_blocks,
            array_data_len: self.array_data.len() as u64,
            valid: true,
            last_unmount: self.last_unmount,
        }
    }

    /// Mount for read, or read-write, access. The disk must be `Online`.
    ///
    /// # Errors
    /// Returns an error if the disk is not online or is already mounted.
    pub fn mount(&mut self, write: bool) -> Result<()> {
        if self.state != DiskState::Online {
            bail!("disk {} is not online", self.disk_id);
        }
        if self.mount != MountState::Unmounted {
            bail!("disk {} is already mounted", self.disk_id);
        }
        self.mount = if write {
            MountState::ReadWrite
        } else {
            MountState::Read
        };
        Ok(())
    }

    /// Drop the mount state without stamping a timestamp. Used to roll back
    /// a partially mounted array; the data was not touched, so the existing
    /// stamp stays authoritative.
    pub fn abort_mount(&mut self) {
        self.mount = MountState::Unmounted;
    }

    /// Unmount and persist `timestamp` as the last-unmount time. A disk that
    /// is not mounted is left untouched.
    ///
    /// # Errors
    /// Returns an error if the header cannot be rewritten.
    pub fn unmount(&mut self, timestamp: u64) -> Result<()> {
        if self.mount == MountState::Unmounted {
            return Ok(());
        }
        self.mount = MountState::Unmounted;
        self.last_unmount = timestamp;
        let header = self.header();
        if let Some(map) = self.map.as_mut() {
            write_header(map, &header)?;
            map.flush_range(0, HEADER_REGION)?;
        }
        Ok(())
    }

    /// Read `count` payload blocks starting at `block` into `dst`.
    ///
    /// # Errors
    /// Returns an error if the disk is not mounted; an out-of-range access
    /// or a lost mapping additionally drops the disk to `Invalid`.
    pub fn read_blocks(&mut self, block: u64, count: usize, dst: &mut [u8]) -> Result<()> {
        if self.mount == MountState::Unmounted {
            bail!("disk {} is not mounted", self.disk_id);
        }
        let span = self.block_span(block, count, dst.len())?;
        let Some(map) = self.map.as_ref() else {
            return Err(self.fault("no backing map"));
        };
        dst[..span.len].copy_from_slice(&map[span.start..span.start + span.len]);
        metrics::record_disk_op(self.disk_id, IoOpType::Read, count as u64);
        Ok(())
    }

    /// Write `count` payload blocks starting at `block` from `src`.
    ///
    /// # Errors
    /// Returns an error if the disk is not write-mounted; an out-of-range
    /// access or a lost mapping additionally drops the disk to `Invalid`.
    pub fn write_blocks(&mut self, block: u64, count: usize, src: &[u8]) -> Result<()> {
        if self.mount != MountState::ReadWrite {
            bail!("disk {} is not mounted for writing", self.disk_id);
        }
        let span = self.block_span(block, count, src.len())?;
        let Some(map) = self.map.as_mut() else {
            return Err(self.fault("no backing map"));
        };
        map[span.start..span.start + span.len].copy_from_slice(&src[..span.len]);
        metrics::record_disk_op(self.disk_id, IoOpType::Write, count as u64);
        Ok(())
    }

    fn block_span(&mut self, block: u64, count: usize, buf_len: usize) -> Result<Span> {
        let len = count * self.block_size;
        if buf_len < len {
            bail!("buffer holds {buf_len} bytes but {len} are addressed");
        }
        if block + count as u64 > self.num_blocks {
            return Err(self.fault(&format!("block range [{block}, +{count}) is out of bounds")));
        }
        Ok(Span {
            start: self.payload_offset + block as usize * self.block_size,
            len,
        })
    }

    fn fault(&mut self, what: &str) -> anyhow::Error {
        warn!(disk_id = self.disk_id, "disk fault: {what}");
        self.state = DiskState::Invalid;
        self.mount = MountState::Unmounted;
        anyhow::anyhow!("disk {} fault: {what}", self.disk_id)
    }

    /// Store the array configuration record; persisted by the next reset.
    ///
    /// # Errors
    /// Returns an error if the record exceeds the configured capacity.
    pub fn set_array_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.array_data_capacity {
            bail!(
                "array data of {} bytes exceeds capacity {}",
                data.len(),
                self.array_data_capacity
            );
        }
        self.array_data = data.to_vec();
        Ok(())
    }

    #[must_use]
    pub fn array_data(&self) -> &[u8] {
        &self.array_data
    }

    #[must_use]
    pub const fn state(&self) -> DiskState {
        self.state
    }

    /// Whether the backing file and its mapping are attached.
    #[must_use]
    pub const fn is_operational(&self) -> bool {
        self.file.is_some() && self.map.is_some()
    }

    /// Force a state transition. Losing the `Online` state also unmounts.
    pub fn set_state(&mut self, state: DiskState) {
        self.state = state;
        if state != DiskState::Online {
            self.mount = MountState::Unmounted;
        }
    }

    #[must_use]
    pub const fn mount_state(&self) -> MountState {
        self.mount
    }

    #[must_use]
    pub const fn last_unmount(&self) -> u64 {
        self.last_unmount
    }

    #[must_use]
    pub const fn disk_id(&self) -> u32 {
        self.disk_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct Span {
    start: usize,
    len: usize,
}

fn write_header(map: &mut MmapMut, header: &DiskHeader) -> Result<()> {
    let bytes = serde_json::to_vec(header)?;
    if bytes.len() > HEADER_REGION - 4 {
        bail!("serialized header does not fit the reserved region");
    }
    map[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    map[4..4 + bytes.len()].copy_from_slice(&bytes);
    map[4 + bytes.len()..HEADER_REGION].fill(0);
    Ok(())
}

fn write_array_data(map: &mut MmapMut, data: &[u8]) {
    map[HEADER_REGION..HEADER_REGION + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    map[HEADER_REGION + 4..HEADER_REGION + 4 + data.len()].copy_from_slice(data);
}

/// The set of disks shared between the array facade and the codec.
///
/// Every disk sits behind its own mutex: concurrent operations on disjoint
/// stripe ranges may still land on the same physical disk, and the per-disk
/// lock is what serializes them there.
pub struct DiskSet {
    disks: Vec<Mutex<Disk>>,
}

impl DiskSet {
    #[must_use]
    pub fn new(disks: Vec<Disk>) -> Self {
        Self {
            disks: disks.into_iter().map(Mutex::new).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.disks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    #[must_use]
    pub fn state(&self, disk: usize) -> DiskState {
        self.disks[disk].lock().unwrap().state()
    }

    /// Read blocks from one disk of the set.
    ///
    /// # Errors
    /// Propagates the disk-level error.
    pub fn read_blocks(&self, disk: usize, block: u64, count: usize, dst: &mut [u8]) -> Result<()> {
        self.disks[disk].lock().unwrap().read_blocks(block, count, dst)
    }

    /// Write blocks to one disk of the set.
    ///
    /// # Errors
    /// Propagates the disk-level error.
    pub fn write_blocks(&self, disk: usize, block: u64, count: usize, src: &[u8]) -> Result<()> {
        self.disks[disk].lock().unwrap().write_blocks(block, count, src)
    }

    /// Run `f` with exclusive access to one disk (management operations).
    pub fn with_disk<R>(&self, disk: usize, f: impl FnOnce(&mut Disk) -> R) -> R {
        f(&mut self.disks[disk].lock().unwrap())
    }
}
