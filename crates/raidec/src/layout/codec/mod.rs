//! Codec core: stripe-to-disk dispatch shared by all RAID processors.
//!
//! [`CodecCore`] owns the coding geometry, the per-subarray erasure map, and
//! the cyclic mapping of codeword symbols onto disks; [`StripeCodec`] is the
//! capability set a concrete processor implements on top of it, with the
//! read/write decomposition provided once for all codecs.


pub mod raid5;
pub mod rs;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::layout::gf::GF_BLOCK;
use crate::retention::disk::{DiskSet, DiskState};

/// Immutable coding geometry of one array code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    /// Code length `n`: symbols per subarray stripe.
    pub length: usize,
    /// Dimension `k`: information symbols per subarray stripe.
    pub dimension: usize,
    /// Bytes per stripe unit; equals the disk block size.
    pub stripe_unit_size: usize,
    /// Stripe units per codeword symbol.
    pub units_per_symbol: usize,
    /// Interleaving order `s`: independent subarrays sharing the disk set.
    pub interleaving: usize,
}

impl CodecParams {
    /// # Errors
    /// Returns an error when any invariant of the geometry is violated.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            bail!("code dimension must be positive");
        }
        if self.length <= self.dimension {
            bail!(
                "code length {} must exceed the dimension {}",
                self.length,
                self.dimension
            );
        }
        if self.stripe_unit_size == 0 || self.stripe_unit_size % GF_BLOCK != 0 {
            bail!(
                "stripe unit size {} must be a positive multiple of {GF_BLOCK}",
                self.stripe_unit_size
            );
        }
        if self.units_per_symbol == 0 {
            bail!("stripe units per symbol must be positive");
        }
        if self.interleaving == 0 {
            bail!("interleaving order must be positive");
        }
        Ok(())
    }

    /// Total number of physical disks the code spans.
    #[must_use]
    pub const fn num_disks(&self) -> usize {
        self.length * self.interleaving
    }

    /// Payload stripe units per subarray stripe.
    #[must_use]
    pub const fn units_per_subarray_stripe(&self) -> usize {
        self.dimension * self.units_per_symbol
    }
}

/// Serializable RAID configuration; also the record persisted into every
/// disk's array-data slot and compared on re-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CodecConfig {
    Raid5 {
        dimension: usize,
        interleaving: usize,
        stripe_unit_size: usize,
    },
    Rs {
        dimension: usize,
        redundancy: usize,
        interleaving: usize,
        stripe_unit_size: usize,
    },
}

impl CodecConfig {
    /// The geometry this configuration describes.
    #[must_use]
    pub const fn params(&self) -> CodecParams {
        match *self {
            Self::Raid5 {
                dimension,
                interleaving,
                stripe_unit_size,
            } => CodecParams {
                length: dimension + 1,
                dimension,
                stripe_unit_size,
                units_per_symbol: 1,
                interleaving,
            },
            Self::Rs {
                dimension,
                redundancy,
                interleaving,
                stripe_unit_size,
            } => CodecParams {
                length: dimension + redundancy,
                dimension,
                stripe_unit_size,
                units_per_symbol: 1,
                interleaving,
            },
        }
    }

    /// Build the processor for this configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn build(
        &self,
        disks: Arc<DiskSet>,
        max_threads: usize,
    ) -> Result<Box<dyn StripeCodec>> {
        match *self {
            Self::Raid5 { .. } => Ok(Box::new(raid5::Raid5Processor::new(
                self.params(),
                disks,
                max_threads,
            )?)),
            Self::Rs { redundancy, .. } => Ok(Box::new(rs::RsProcessor::new(
                self.params(),
                redundancy,
                disks,
                max_threads,
            )?)),
        }
    }
}

/// Outcome of the update-strategy gate for a partial-stripe write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingStrategy {
    /// Read the untouched part of the stripe, splice, re-encode everything.
    FullEncode,
    /// Update the touched information symbols and patch the check symbols.
    DeltaUpdate,
}

/// Per-subarray offline-disk map, rebuilt whenever the disk set changes.
#[derive(Debug, Default)]
struct ErasureMap {
    /// Sorted in-subarray disk indices that are not online, per subarray.
    offline: Vec<Vec<usize>>,
}

/// State shared by every RAID processor: geometry, disks, erasures, and the
/// per-thread staging buffer for partial-stripe re-encodes.
pub struct CodecCore {
    params: CodecParams,
    disks: Arc<DiskSet>,
    erasures: RwLock<ErasureMap>,
    update_buf: Vec<Mutex<Vec<u8>>>,
}

impl CodecCore {
    /// # Errors
    /// Returns an error if the geometry is invalid or the disk set is too
    /// small for it.
    pub fn new(params: CodecParams, disks: Arc<DiskSet>, max_threads: usize) -> Result<Self> {
        params.validate()?;
        if max_threads == 0 {
            bail!("at least one concurrent thread is required");
        }
        if disks.len() < params.num_disks() {
            bail!(
                "code spans {} disks but only {} are attached",
                params.num_disks(),
                disks.len()
            );
        }
        let stage = params.units_per_subarray_stripe() * params.stripe_unit_size;
        let core = Self {
            params,
            disks,
            erasures: RwLock::new(ErasureMap::default()),
            update_buf: (0..max_threads).map(|_| Mutex::new(vec![0u8; stage])).collect(),
        };
        core.reset_erasures();
        Ok(core)
    }

    #[must_use]
    pub const fn params(&self) -> &CodecParams {
        &self.params
    }

    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.update_buf.len()
    }

    /// Rebuild the offline-disk map from the current disk states. Must be
    /// externally serialized against data operations (callers run it while
    /// the volume is unmounted or from mount setup).
    pub fn reset_erasures(&self) {
        let n = self.params.length;
        let mut offline = Vec::with_capacity(self.params.interleaving);
        for subarray in 0..self.params.interleaving {
            let list: Vec<usize> = (0..n)
                .filter(|i| self.disks.state(subarray * n + i) != DiskState::Online)
                .collect();
            offline.push(list);
        }
        self.erasures.write().unwrap().offline = offline;
    }

    /// Erasure-set id for a stripe of one subarray: encodes the rotation
    /// offset `stripe mod n` together with the subarray.
    #[must_use]
    pub fn erasure_set(&self, stripe: u64, subarray: usize) -> usize {
        (stripe % self.params.length as u64) as usize + subarray * self.params.length
    }

    /// Number of erased symbols for this erasure set.
    #[must_use]
    pub fn num_erasures(&self, erasure_set: usize) -> usize {
        let subarray = erasure_set / self.params.length;
        self.erasures.read().unwrap().offline[subarray].len()
    }

    /// The `i`-th erased logical symbol position, with the cyclic shift of
    /// the erasure set applied. The positions are not sorted after the
    /// shift; callers treat the list as unordered.
    #[must_use]
    pub fn erased_position(&self, erasure_set: usize, i: usize) -> Option<usize> {
        let n = self.params.length;
        let subarray = erasure_set / n;
        let shift = erasure_set % n;
        self.erasures.read().unwrap().offline[subarray]
            .get(i)
            .map(|&disk| (disk + n - shift) % n)
    }

    /// Whether logical symbol `symbol` of this erasure set maps to an
    /// offline disk.
    #[must_use]
    pub fn is_erased(&self, erasure_set: usize, symbol: usize) -> bool {
        let n = self.params.length;
        let subarray = erasure_set / n;
        let disk = (symbol + erasure_set) % n;
        self.erasures.read().unwrap().offline[subarray].contains(&disk)
    }

    fn disk_for(&self, erasure_set: usize, symbol: usize) -> usize {
        let n = self.params.length;
        let subarray = erasure_set / n;
        subarray * n + (symbol + erasure_set) % n
    }

    /// Read a run of stripe units belonging to one codeword symbol,
    /// applying the cyclic symbol-to-disk mapping.
    ///
    /// # Errors
    /// Propagates the disk I/O error; the codec does not retry.
    pub fn read_stripe_unit(
        &self,
        stripe: u64,
        erasure_set: usize,
        symbol: usize,
        unit: usize,
        count: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        let block = stripe * self.params.units_per_symbol as u64 + unit as u64;
        self.disks
            .read_blocks(self.disk_for(erasure_set, symbol), block, count, dst)
    }

    /// Write a run of stripe units belonging to one codeword symbol,
    /// applying the cyclic symbol-to-disk mapping.
    ///
    /// # Errors
    /// Propagates the disk I/O error; the codec does not retry.
    pub fn write_stripe_unit(
        &self,
        stripe: u64,
        erasure_set: usize,
        symbol: usize,
        unit: usize,
        count: usize,
        src: &[u8],
    ) -> Result<()> {
        let block = stripe * self.params.units_per_symbol as u64 + unit as u64;
        self.disks
            .write_blocks(self.disk_for(erasure_set, symbol), block, count, src)
    }

    fn update_slot(&self, thread: usize) -> MutexGuard<'_, Vec<u8>> {
        self.update_buf[thread].lock().unwrap()
    }
}

/// The capability set of a RAID processor.
///
/// Concrete codecs implement the required methods; the read/write
/// decomposition, the update-strategy gate, and the mountability check are
/// provided once here.
pub trait StripeCodec: Send + Sync {
    fn core(&self) -> &CodecCore;

    /// Check whether a given combination of erasures is correctable and, if
    /// so, prime any per-erasure-set decoding state.
    fn is_correctable(&self, erasure_set: usize) -> bool;

    /// Decode a run of payload stripe units inside one codeword symbol.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure or when the codec does not
    /// support sub-symbol access.
    fn decode_subsymbols(
        &self,
        stripe: u64,
        erasure_set: usize,
        symbol: usize,
        first_subunit: usize,
        units: usize,
        dst: &mut [u8],
        thread: usize,
    ) -> Result<()>;

    /// Decode a run of whole payload symbols.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure.
    fn decode_symbols(
        &self,
        stripe: u64,
        erasure_set: usize,
        first_symbol: usize,
        symbols: usize,
        dst: &mut [u8],
        thread: usize,
    ) -> Result<()>;

    /// Encode and write a whole stripe of payload data.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure.
    fn encode_stripe(
        &self,
        stripe: u64,
        erasure_set: usize,
        data: &[u8],
        thread: usize,
    ) -> Result<()>;

    /// Overwrite a run of information symbols and patch the check symbols
    /// incrementally.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure.
    fn update_information_symbols(
        &self,
        stripe: u64,
        erasure_set: usize,
        first_unit: usize,
        units: usize,
        data: &[u8],
        thread: usize,
    ) -> Result<()>;

    /// Check stripe consistency. Vacuously true when erasures are present.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure.
    fn check_codeword(&self, stripe: u64, erasure_set: usize, thread: usize) -> Result<bool>;

    /// Codec-specific reason to force a full re-encode for an update.
    fn force_full_encode(&self, _erasure_set: usize, _first_unit: usize, _units: usize) -> bool {
        false
    }

    /// Rebuild erasure bookkeeping after the set of failed disks changed.
    fn reset_erasures(&self) {
        self.core().reset_erasures();
    }

    /// A volume is mountable iff every cyclic rotation of the erasure
    /// pattern, in every subarray, is decodable.
    fn is_mountable(&self) -> bool {
        let p = self.core().params();
        (0..p.num_disks()).all(|eid| self.is_correctable(eid))
    }

    /// Decide between a full re-encode and a delta update for a write of
    /// `units` stripe units starting at `first_unit`.
    fn encoding_strategy(
        &self,
        erasure_set: usize,
        first_unit: usize,
        units: usize,
    ) -> EncodingStrategy {
        if self.force_full_encode(erasure_set, first_unit, units) {
            return EncodingStrategy::FullEncode;
        }
        let payload = self.core().params().units_per_subarray_stripe();
        if units > 2 * payload / 3 {
            EncodingStrategy::FullEncode
        } else {
            EncodingStrategy::DeltaUpdate
        }
    }

    /// Read `units` payload stripe units of one subarray stripe, splitting
    /// the request into at most a partial head, a run of whole symbols, and
    /// a partial tail.
    ///
    /// # Errors
    /// Fails fast on the first decode error.
    fn read_data(
        &self,
        stripe: u64,
        first_unit: usize,
        subarray: usize,
        units: usize,
        dst: &mut [u8],
        thread: usize,
    ) -> Result<()> {
        let p = self.core().params();
        let (w, u) = (p.stripe_unit_size, p.units_per_symbol);
        let eid = self.core().erasure_set(stripe, subarray);

        let mut symbol = first_unit / u;
        let head_offset = first_unit % u;
        let mut remaining = units;
        let mut pos = 0usize;

        if head_offset != 0 {
            let take = (u - head_offset).min(remaining);
            self.decode_subsymbols(
                stripe,
                eid,
                symbol,
                head_offset,
                take,
                &mut dst[..take * w],
                thread,
            )?;
            pos += take * w;
            remaining -= take;
            symbol += 1;
        }

        let symbols = remaining / u;
        if symbols > 0 {
            self.decode_symbols(
                stripe,
                eid,
                symbol,
                symbols,
                &mut dst[pos..pos + symbols * u * w],
                thread,
            )?;
            pos += symbols * u * w;
            remaining -= symbols * u;
            symbol += symbols;
        }

        if remaining > 0 {
            self.decode_subsymbols(
                stripe,
                eid,
                symbol,
                0,
                remaining,
                &mut dst[pos..pos + remaining * w],
                thread,
            )?;
        }
        Ok(())
    }

    /// Write `units` payload stripe units of one subarray stripe, either by
    /// a full splice-and-encode or by a delta update of the check symbols.
    ///
    /// # Errors
    /// Fails fast on the first decode/encode error.
    fn write_data(
        &self,
        stripe: u64,
        first_unit: usize,
        subarray: usize,
        units: usize,
        src: &[u8],
        thread: usize,
    ) -> Result<()> {
        let core = self.core();
        let p = core.params();
        let w = p.stripe_unit_size;
        let payload_units = p.units_per_subarray_stripe();
        let eid = core.erasure_set(stripe, subarray);

        match self.encoding_strategy(eid, first_unit, units) {
            EncodingStrategy::DeltaUpdate => {
                self.update_information_symbols(stripe, eid, first_unit, units, src, thread)
            }
            EncodingStrategy::FullEncode if units == payload_units => {
                self.encode_stripe(stripe, eid, src, thread)
            }
            EncodingStrategy::FullEncode => {
                let mut stage = core.update_slot(thread);
                if first_unit > 0 {
                    self.read_data(
                        stripe,
                        0,
                        subarray,
                        first_unit,
                        &mut stage[..first_unit * w],
                        thread,
                    )?;
                }
                stage[first_unit * w..(first_unit + units) * w].copy_from_slice(&src[..units * w]);
                let trailing = payload_units - (first_unit + units);
                if trailing > 0 {
                    self.read_data(
                        stripe,
                        first_unit + units,
                        subarray,
                        trailing,
                        &mut stage[(first_unit + units) * w..],
                        thread,
                    )?;
                }
                self.encode_stripe(stripe, eid, &stage, thread)
            }
        }
    }

    /// Validate the codeword of one `(stripe, subarray)` pair.
    ///
    /// # Errors
    /// Returns an error on disk I/O failure.
    fn verify_stripe(&self, stripe: u64, subarray: usize, thread: usize) -> Result<bool> {
        let eid = self.core().erasure_set(stripe, subarray);
        self.check_codeword(stripe, eid, thread)
    }
}
