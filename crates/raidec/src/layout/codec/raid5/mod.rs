//! RAID-5: single-parity XOR codec.
//!
//! `n = k + 1` with the parity at symbol `k`. Any single offline disk is
//! recoverable as the XOR of the survivors.


use std::sync::{Arc, Mutex};

use anyhow::{Result, bail, ensure};

use crate::layout::codec::{CodecCore, CodecParams, StripeCodec};
use crate::layout::gf::xor_in;
use crate::retention::disk::DiskSet;

struct XorScratch {
    parity: Vec<u8>,
    fetch: Vec<u8>,
}

pub struct Raid5Processor {
    core: CodecCore,
    scratch: Vec<Mutex<XorScratch>>,
}

impl Raid5Processor {
    /// # Errors
    /// Returns an error if the geometry does not describe a single-parity
    /// code.
    pub fn new(params: CodecParams, disks: Arc<DiskSet>, max_threads: usize) -> Result<Self> {
        if params.length != params.dimension + 1 {
            bail!("RAID-5 requires exactly one parity symbol");
        }
        if params.units_per_symbol != 1 {
            bail!("RAID-5 uses one stripe unit per symbol");
        }
        let w = params.stripe_unit_size;
        let core = CodecCore::new(params, disks, max_threads)?;
        let scratch = (0..max_threads)
            .map(|_| {
                Mutex::new(XorScratch {
                    parity: vec![0u8; w],
                    fetch: vec![0u8; w],
                })
            })
            .collect();
        Ok(Self { core, scratch })
    }

    /// The single erased symbol position, if any.
    fn single_erasure(&self, erasure_set: usize) -> Option<usize> {
        if self.core.num_erasures(erasure_set) == 0 {
            None
        } else {
            self.core.erased_position(erasure_set, 0)
        }
    }
}

/// Split two distinct stripe-unit slots out of one buffer.
fn unit_pair(buf: &mut [u8], a: usize, b: usize, w: usize) -> (&mut [u8], &mut [u8]) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = buf.split_at_mut(b * w);
        (&mut lo[a * w..(a + 1) * w], &mut hi[..w])
    } else {
        let (lo, hi) = buf.split_at_mut(a * w);
        (&mut hi[..w], &mut lo[b * w..(b + 1) * w])
    }
}

impl StripeCodec for Raid5Processor {
    fn core(&self) -> &CodecCore {
        &self.core
    }

    fn is_correctable(&self, erasure_set: usize) -> bool {
        self.core.num_erasures(erasure_set) <= 1
    }

    fn decode_subsymbols(
        &self,
        _stripe: u64,
        _erasure_set: usize,
        _symbol: usize,
        _first_subunit: usize,
        _units: usize,
        _dst: &mut [u8],
        _thread: usize,
    ) -> Result<()> {
        // Unreachable with one unit per symbol; requests always decompose
        // into whole symbols.
        bail!("RAID-5 does not support sub-symbol decoding")
    }

    /// Read the requested symbols; if the erased one falls inside the range,
    /// recover it as the XOR of every surviving symbol.
    fn decode_symbols(
        &self,
        stripe: u64,
        erasure_set: usize,
        first_symbol: usize,
        symbols: usize,
        dst: &mut [u8],
        thread: usize,
    ) -> Result<()> {
        let p = self.core.params();
        let (w, n) = (p.stripe_unit_size, p.length);
        ensure!(dst.len() >= symbols * w, "decode destination is too small");

        let erased_inside = self
            .single_erasure(erasure_set)
            .filter(|&e| e >= first_symbol && e < first_symbol + symbols);
        let Some(e) = erased_inside else {
            for (i, unit) in dst.chunks_exact_mut(w).take(symbols).enumerate() {
                self.core
                    .read_stripe_unit(stripe, erasure_set, first_symbol + i, 0, 1, unit)?;
            }
            return Ok(());
        };

        let acc = e - first_symbol;
        let mut guard = self.scratch[thread].lock().unwrap();
        let fetch = &mut guard.fetch;

        // The first surviving symbol seeds the accumulator directly.
        let seed = usize::from(e == 0);
        self.core.read_stripe_unit(
            stripe,
            erasure_set,
            seed,
            0,
            1,
            &mut dst[acc * w..(acc + 1) * w],
        )?;
        if seed >= first_symbol && seed < first_symbol + symbols {
            let (acc_slot, seed_slot) = unit_pair(dst, acc, seed - first_symbol, w);
            seed_slot.copy_from_slice(acc_slot);
        }

        for i in seed + 1..n {
            if i == e {
                continue;
            }
            if i >= first_symbol && i < first_symbol + symbols {
                // A payload symbol the caller asked for anyway.
                let (acc_slot, cur) = unit_pair(dst, acc, i - first_symbol, w);
                self.core.read_stripe_unit(stripe, erasure_set, i, 0, 1, cur)?;
                xor_in(acc_slot, cur);
            } else {
                self.core.read_stripe_unit(stripe, erasure_set, i, 0, 1, fetch)?;
                xor_in(&mut dst[acc * w..(acc + 1) * w], fetch);
            }
        }
        Ok(())
    }

    /// Write the payload symbols and the XOR parity, skipping offline disks.
    fn encode_stripe(
        &self,
        stripe: u64,
        erasure_set: usize,
        data: &[u8],
        thread: usize,
    ) -> Result<()> {
        let p = self.core.params();
        let (w, k) = (p.stripe_unit_size, p.dimension);
        ensure!(data.len() >= k * w, "encode source is too small");

        let mut guard = self.scratch[thread].lock().unwrap();
        let parity = &mut guard.parity;

        parity.copy_from_slice(&data[..w]);
        if !self.core.is_erased(erasure_set, 0) {
            self.core
                .write_stripe_unit(stripe, erasure_set, 0, 0, 1, &data[..w])?;
        }
        for i in 1..k {
            let unit = &data[i * w..(i + 1) * w];
            if !self.core.is_erased(erasure_set, i) {
                self.core
                    .write_stripe_unit(stripe, erasure_set, i, 0, 1, unit)?;
            }
            xor_in(parity, unit);
        }
        if !self.core.is_erased(erasure_set, k) {
            self.core
                .write_stripe_unit(stripe, erasure_set, k, 0, 1, parity)?;
        }
        Ok(())
    }

    /// Patch a run of information symbols.
    ///
    /// Three shapes: the parity itself is offline (write data, nothing to
    /// patch); an offline data symbol sits inside the update range (its old
    /// value cannot be read, so the parity is rebuilt from every symbol);
    /// otherwise the standard old-xor-new delta is folded into the parity.
    fn update_information_symbols(
        &self,
        stripe: u64,
        erasure_set: usize,
        first_unit: usize,
        units: usize,
        data: &[u8],
        thread: usize,
    ) -> Result<()> {
        let p = self.core.params();
        let (w, k) = (p.stripe_unit_size, p.dimension);
        ensure!(data.len() >= units * w, "update source is too small");

        if self.core.is_erased(erasure_set, k) {
            // Parity is gone; with at most one erasure every data disk in
            // the range is online.
            for i in 0..units {
                self.core.write_stripe_unit(
                    stripe,
                    erasure_set,
                    first_unit + i,
                    0,
                    1,
                    &data[i * w..(i + 1) * w],
                )?;
            }
            return Ok(());
        }

        let mut guard = self.scratch[thread].lock().unwrap();
        let s = &mut *guard;
        let (parity, fetch) = (&mut s.parity, &mut s.fetch);

        let erased_in_range = self
            .single_erasure(erasure_set)
            .filter(|&e| e >= first_unit && e < first_unit + units);

        if let Some(e) = erased_in_range {
            // New parity = sum of untouched old symbols + sum of new ones.
            parity.fill(0);
            for i in (0..first_unit).chain(first_unit + units..k) {
                self.core.read_stripe_unit(stripe, erasure_set, i, 0, 1, fetch)?;
                xor_in(parity, fetch);
            }
            for i in 0..units {
                let unit = &data[i * w..(i + 1) * w];
                xor_in(parity, unit);
                if e == first_unit + i {
                    // Cannot write to the failed disk.
                    continue;
                }
                self.core
                    .write_stripe_unit(stripe, erasure_set, first_unit + i, 0, 1, unit)?;
            }
        } else {
            // New parity = old parity + sum over the range of (old + new).
            self.core
                .read_stripe_unit(stripe, erasure_set, k, 0, 1, parity)?;
            for i in 0..units {
                let unit = &data[i * w..(i + 1) * w];
                xor_in(parity, unit);
                self.core
                    .read_stripe_unit(stripe, erasure_set, first_unit + i, 0, 1, fetch)?;
                xor_in(parity, fetch);
                self.core
                    .write_stripe_unit(stripe, erasure_set, first_unit + i, 0, 1, unit)?;
            }
        }
        self.core
            .write_stripe_unit(stripe, erasure_set, k, 0, 1, parity)
    }

    /// The XOR of all `n` symbols of a consistent stripe is zero.
    fn check_codeword(&self, stripe: u64, erasure_set: usize, thread: usize) -> Result<bool> {
        if self.core.num_erasures(erasure_set) > 0 {
            // Nothing to validate against.
            return Ok(true);
        }
        let n = self.core.params().length;
        let mut guard = self.scratch[thread].lock().unwrap();
        let s = &mut *guard;
        let (parity, fetch) = (&mut s.parity, &mut s.fetch);

        self.core
            .read_stripe_unit(stripe, erasure_set, 0, 0, 1, parity)?;
        for i in 1..n {
            self.core.read_stripe_unit(stripe, erasure_set, i, 0, 1, fetch)?;
            xor_in(parity, fetch);
        }
        Ok(parity.iter().all(|&b| b == 0))
    }
}
