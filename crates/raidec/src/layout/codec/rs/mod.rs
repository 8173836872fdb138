//! Reed-Solomon codec over GF(2^8).
//!
//! The code is the length-255 Reed-Solomon code shortened to `n = k + r`
//! active positions: `information_positions` carry the payload,
//! `check_positions` carry parity, and every other position is logically
//! zero. Encoding treats the check positions as erasures of a codeword whose
//! payload is known, so the one erasure-decoding pipeline (syndrome, erasure
//! evaluator, Forney scaling) serves encode, decode, and update alike.

#[cfg(test)]
mod rs_tests;

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Result, bail, ensure};

use crate::layout::codec::{CodecCore, CodecParams, StripeCodec};
use crate::layout::gf::{GfTables, xor_in};
use crate::retention::disk::DiskSet;

/// Length of the parent Reed-Solomon code over GF(2^8).
pub const RS_LENGTH: usize = 255;

/// Per-erasure-set decoding state, rebuilt by `is_correctable` whenever the
/// offline-disk set changes. Indexed by erasure-set id.
struct ErasureTables {
    /// Erasure locator polynomials, `r + 1` coefficients per set.
    lambda: Vec<u8>,
    /// Forney multiples `X_i / Lambda'(1/X_i)` (as logs), `r` per set.
    forney: Vec<i32>,
}

struct RsScratch {
    /// `r` syndrome blocks, packed; doubles as the evaluation temporary
    /// once the erasure evaluator has consumed it.
    syndromes: Vec<u8>,
    /// The erasure evaluator polynomial, `r` blocks.
    evaluator: Vec<u8>,
    /// Fetched codeword symbols, `n` blocks.
    fetch: Vec<u8>,
}

pub struct RsProcessor {
    core: CodecCore,
    gf: &'static GfTables,
    redundancy: usize,
    /// RS locator indices carrying payload, ascending.
    info_positions: Vec<i32>,
    /// RS locator indices carrying parity, ascending.
    check_positions: Vec<i32>,
    /// `prod_i (1 - x X_i)` over the check locators; degree `r`.
    check_locator: Vec<u8>,
    check_forney: Vec<i32>,
    erasure_tables: RwLock<ErasureTables>,
    scratch: Vec<Mutex<RsScratch>>,
}

impl RsProcessor {
    /// # Errors
    /// Returns an error if the geometry does not describe a valid shortened
    /// RS code.
    pub fn new(
        params: CodecParams,
        redundancy: usize,
        disks: Arc<DiskSet>,
        max_threads: usize,
    ) -> Result<Self> {
        if redundancy == 0 {
            bail!("Reed-Solomon redundancy must be positive");
        }
        if params.length != params.dimension + redundancy {
            bail!("code length must equal dimension plus redundancy");
        }
        if params.length > RS_LENGTH {
            bail!("code length exceeds the RS({RS_LENGTH}) parent code");
        }
        if params.units_per_symbol != 1 {
            bail!("the RS codec uses one stripe unit per symbol");
        }
        let gf = GfTables::global();
        let (k, r, w) = (params.dimension, redundancy, params.stripe_unit_size);

        let check_positions: Vec<i32> = (0..r).map(|i| (RS_LENGTH - r + i) as i32).collect();
        // Payload may sit on any locator not reserved for parity; take the
        // first k such indices.
        let mut info_positions = Vec::with_capacity(k);
        for i in 0..RS_LENGTH as i32 {
            if !check_positions.contains(&i) {
                info_positions.push(i);
                if info_positions.len() == k {
                    break;
                }
            }
        }

        let mut check_locator = vec![0u8; r + 1];
        locator_poly(gf, check_positions.iter().copied(), &mut check_locator);
        let check_forney: Vec<i32> = check_positions
            .iter()
            .map(|&x| forney_multiple(gf, r, &check_locator, 0, x))
            .collect();

        let sets = params.num_disks();
        let core = CodecCore::new(params, disks, max_threads)?;
        let scratch = (0..max_threads)
            .map(|_| {
                Mutex::new(RsScratch {
                    syndromes: vec![0u8; r * w],
                    evaluator: vec![0u8; r * w],
                    fetch: vec![0u8; params.length * w],
                })
            })
            .collect();

        Ok(Self {
            core,
            gf,
            redundancy,
            info_positions,
            check_positions,
            check_locator,
            check_forney,
            erasure_tables: RwLock::new(ErasureTables {
                lambda: vec![0u8; sets * (r + 1)],
                forney: vec![0i32; sets * r],
            }),
            scratch,
        })
    }

    /// Locator index of a logical symbol position.
    fn locator_of(&self, position: usize) -> i32 {
        let k = self.core.params().dimension;
        if position < k {
            self.info_positions[position]
        } else {
            self.check_positions[position - k]
        }
    }

    /// Exponent of `1/X` for a locator `X = alpha^locator`.
    fn inverse_exponent(&self, locator: i32) -> i32 {
        if locator == 0 {
            0
        } else {
            self.gf.field_size_1() - locator
        }
    }
}

/// `out = prod_i (1 - x X_i)` by incremental convolution in the log domain.
/// `out` must hold one coefficient more than the number of locators.
fn locator_poly(gf: &GfTables, locators: impl Iterator<Item = i32>, out: &mut [u8]) {
    out.fill(0);
    out[0] = 1;
    let fs1 = gf.field_size_1();
    for (i, x) in locators.enumerate() {
        for j in (1..=i + 1).rev() {
            if out[j - 1] != 0 {
                let mut l = gf.log(out[j - 1]) + x;
                if l >= fs1 {
                    l -= fs1;
                }
                out[j] ^= gf.alpha_pow(l);
            }
        }
    }
}

/// `X^(1-b) / Lambda'(1/X)` as a log, for the Forney recovery of the symbol
/// at locator `X = alpha^x`. In characteristic 2 the formal derivative keeps
/// only the odd coefficients, so the Horner walk steps by two.
///
/// `b` is the first consecutive-root exponent; the supplied code uses 0, but
/// the parameter stays explicit for codes with other roots.
fn forney_multiple(gf: &GfTables, degree: usize, lambda: &[u8], b: i32, x: i32) -> i32 {
    let fs1 = gf.field_size_1();
    let y = (x * (1 - b)).rem_euclid(fs1);
    // Exponent of 1/X^2.
    let mut z = if x == 0 { 0 } else { fs1 - x };
    z += z;
    if z >= fs1 {
        z -= fs1;
    }
    let mut res: u8 = 0;
    let mut j = (degree as i32 - 1) & !1;
    while j >= 0 {
        if res != 0 {
            res = gf.alpha_pow(gf.log(res) + z);
        }
        res ^= lambda[(j + 1) as usize];
        j -= 2;
    }
    let mut out = y - gf.log(res);
    if out < 0 {
        out += fs1;
    }
    out
}

/// `S_l[..] = sum_i y_i[..] * alpha^(i*l)` for `l` in `[low, high)`, over the
/// registered symbol buffers; unregistered positions are zero.
fn compute_syndrome(
    gf: &GfTables,
    registered: &[Option<&[u8]>; RS_LENGTH],
    syndromes: &mut [u8],
    low: usize,
    high: usize,
    w: usize,
) {
    let count = high - low;
    match registered[0] {
        Some(d) => {
            for j in 0..count {
                syndromes[j * w..(j + 1) * w].copy_from_slice(d);
            }
        }
        None => syndromes[..count * w].fill(0),
    }
    let fs1 = gf.field_size_1() as usize;
    for i in 1..RS_LENGTH {
        let Some(d) = registered[i] else { continue };
        let mut l = (low * i) % fs1;
        for j in 0..count {
            if l >= fs1 {
                l -= fs1;
            }
            gf.mul_add(l as i32, d, &mut syndromes[j * w..(j + 1) * w]);
            l += i;
        }
    }
}

/// `Gamma = S * Lambda mod x^t`, blockwise over stripe units.
fn erasure_evaluator(
    gf: &GfTables,
    syndromes: &[u8],
    lambda: &[u8],
    gamma: &mut [u8],
    t: usize,
    w: usize,
) {
    for i in 0..t {
        // Lambda(0) = 1, so the leading term is a plain copy.
        gamma[i * w..(i + 1) * w].copy_from_slice(&syndromes[i * w..(i + 1) * w]);
        for j in 1..=i {
            if lambda[j] != 0 {
                gf.mul_add(
                    gf.log(lambda[j]),
                    &syndromes[(i - j) * w..(i - j + 1) * w],
                    &mut gamma[i * w..(i + 1) * w],
                );
            }
        }
    }
}

/// Evaluate a block of polynomials (stored coefficient-blockwise) at
/// `alpha^x`, writing the per-unit values into `value`.
fn evaluate(gf: &GfTables, poly: &[u8], degree: usize, x: i32, value: &mut [u8], w: usize) {
    value[..w].copy_from_slice(&poly[..w]);
    let fs1 = gf.field_size_1();
    let mut l = x;
    for i in 1..=degree {
        if l >= fs1 {
            l -= fs1;
        }
        gf.mul_add(l, &poly[i * w..(i + 1) * w], &mut value[..w]);
        l += x;
    }
}

impl StripeCodec for RsProcessor {
    fn core(&self) -> &CodecCore {
        &self.core
    }

    /// Build the erasure locator polynomial and Forney multiples for this
    /// combination of erasures; anything up to `r` losses is correctable.
    fn is_correctable(&self, erasure_set: usize) -> bool {
        let t = self.core.num_erasures(erasure_set);
        if t == 0 {
            return true;
        }
        if t > self.redundancy {
            return false;
        }
        let r = self.redundancy;
        let locators: Vec<i32> = (0..t)
            .map(|i| {
                let pos = self
                    .core
                    .erased_position(erasure_set, i)
                    .expect("erased position exists");
                self.locator_of(pos)
            })
            .collect();

        let mut tables = self.erasure_tables.write().unwrap();
        let ErasureTables { lambda, forney } = &mut *tables;
        let lam = &mut lambda[erasure_set * (r + 1)..(erasure_set + 1) * (r + 1)];
        locator_poly(self.gf, locators.iter().copied(), lam);
        let fm = &mut forney[erasure_set * r..(erasure_set + 1) * r];
        for (i, &x) in locators.iter().enumerate() {
            fm[i] = forney_multiple(self.gf, t, lam, 0, x);
        }
        true
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
        bail!("the RS codec does not support sub-symbol decoding")
    }

    /// Fetch the surviving requested symbols verbatim; when erasures fall
    /// inside the range, compute the syndrome over every surviving codeword
    /// symbol and recover the missing ones by Forney's algorithm.
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
        let (w, k, r) = (p.stripe_unit_size, p.dimension, self.redundancy);
        ensure!(dst.len() >= symbols * w, "decode destination is too small");

        let mut missing = false;
        for i in 0..symbols {
            let s = first_symbol + i;
            if self.core.is_erased(erasure_set, s) {
                missing = true;
            } else {
                self.core
                    .read_stripe_unit(stripe, erasure_set, s, 0, 1, &mut dst[i * w..(i + 1) * w])?;
            }
        }
        if !missing {
            return Ok(());
        }

        let mut guard = self.scratch[thread].lock().unwrap();
        let RsScratch {
            syndromes,
            evaluator,
            fetch,
        } = &mut *guard;

        // Every surviving symbol outside the request participates in the
        // syndrome as well.
        for s in (0..first_symbol).chain(first_symbol + symbols..k + r) {
            if !self.core.is_erased(erasure_set, s) {
                self.core
                    .read_stripe_unit(stripe, erasure_set, s, 0, 1, &mut fetch[s * w..(s + 1) * w])?;
            }
        }

        let mut registered: [Option<&[u8]>; RS_LENGTH] = [None; RS_LENGTH];
        for i in 0..symbols {
            let s = first_symbol + i;
            if !self.core.is_erased(erasure_set, s) {
                registered[self.info_positions[s] as usize] = Some(&dst[i * w..(i + 1) * w]);
            }
        }
        for s in (0..first_symbol).chain(first_symbol + symbols..k + r) {
            if !self.core.is_erased(erasure_set, s) {
                registered[self.locator_of(s) as usize] = Some(&fetch[s * w..(s + 1) * w]);
            }
        }

        compute_syndrome(self.gf, &registered, syndromes, 0, r, w);

        let t = self.core.num_erasures(erasure_set);
        let tables = self.erasure_tables.read().unwrap();
        let lam = &tables.lambda[erasure_set * (r + 1)..(erasure_set + 1) * (r + 1)];
        let fm = &tables.forney[erasure_set * r..(erasure_set + 1) * r];
        erasure_evaluator(self.gf, syndromes, lam, evaluator, t, w);

        for i in 0..t {
            let s = self
                .core
                .erased_position(erasure_set, i)
                .expect("erased position exists");
            if s < first_symbol || s >= first_symbol + symbols {
                continue;
            }
            let x = self.inverse_exponent(self.info_positions[s]);
            let slot = &mut dst[(s - first_symbol) * w..(s - first_symbol + 1) * w];
            evaluate(self.gf, evaluator, t - 1, x, slot, w);
            self.gf.mul_in_place(fm[i], slot);
        }
        Ok(())
    }

    /// Write the payload, then derive the check symbols by treating every
    /// check position as an erasure of the known codeword.
    fn encode_stripe(
        &self,
        stripe: u64,
        erasure_set: usize,
        data: &[u8],
        thread: usize,
    ) -> Result<()> {
        let p = self.core.params();
        let (w, k, r) = (p.stripe_unit_size, p.dimension, self.redundancy);
        ensure!(data.len() >= k * w, "encode source is too small");

        let mut registered: [Option<&[u8]>; RS_LENGTH] = [None; RS_LENGTH];
        for i in 0..k {
            registered[self.info_positions[i] as usize] = Some(&data[i * w..(i + 1) * w]);
            if !self.core.is_erased(erasure_set, i) {
                self.core
                    .write_stripe_unit(stripe, erasure_set, i, 0, 1, &data[i * w..(i + 1) * w])?;
            }
        }

        let mut guard = self.scratch[thread].lock().unwrap();
        let RsScratch {
            syndromes,
            evaluator,
            ..
        } = &mut *guard;

        compute_syndrome(self.gf, &registered, syndromes, 0, r, w);
        erasure_evaluator(self.gf, syndromes, &self.check_locator, evaluator, r, w);

        for i in 0..r {
            if self.core.is_erased(erasure_set, k + i) {
                continue;
            }
            let x = self.inverse_exponent(self.check_positions[i]);
            // The syndrome blocks are spent; reuse the first as scratch.
            let temp = &mut syndromes[..w];
            evaluate(self.gf, evaluator, r - 1, x, temp, w);
            self.gf.mul_in_place(self.check_forney[i], temp);
            self.core
                .write_stripe_unit(stripe, erasure_set, k + i, 0, 1, temp)?;
        }
        Ok(())
    }

    /// Write the new payload and patch every surviving check symbol with the
    /// syndrome of the old-xor-new delta. The strategy gate guarantees no
    /// erasure inside the update range.
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
        let (w, k, r) = (p.stripe_unit_size, p.dimension, self.redundancy);
        ensure!(data.len() >= units * w, "update source is too small");

        let mut guard = self.scratch[thread].lock().unwrap();
        let RsScratch {
            syndromes,
            evaluator,
            fetch,
        } = &mut *guard;

        for i in 0..units {
            let delta = &mut fetch[i * w..(i + 1) * w];
            self.core
                .read_stripe_unit(stripe, erasure_set, first_unit + i, 0, 1, delta)?;
            xor_in(delta, &data[i * w..(i + 1) * w]);
            self.core.write_stripe_unit(
                stripe,
                erasure_set,
                first_unit + i,
                0,
                1,
                &data[i * w..(i + 1) * w],
            )?;
        }

        let mut registered: [Option<&[u8]>; RS_LENGTH] = [None; RS_LENGTH];
        for i in 0..units {
            registered[self.info_positions[first_unit + i] as usize] =
                Some(&fetch[i * w..(i + 1) * w]);
        }
        compute_syndrome(self.gf, &registered, syndromes, 0, r, w);
        erasure_evaluator(self.gf, syndromes, &self.check_locator, evaluator, r, w);

        for i in 0..r {
            if self.core.is_erased(erasure_set, k + i) {
                continue;
            }
            let x = self.inverse_exponent(self.check_positions[i]);
            evaluate(self.gf, evaluator, r - 1, x, &mut syndromes[..w], w);
            let old = &mut fetch[..w];
            self.core
                .read_stripe_unit(stripe, erasure_set, k + i, 0, 1, old)?;
            self.gf.mul_add(self.check_forney[i], &syndromes[..w], old);
            self.core
                .write_stripe_unit(stripe, erasure_set, k + i, 0, 1, old)?;
        }
        Ok(())
    }

    /// Fetch the whole codeword and test that every syndrome byte is zero.
    fn check_codeword(&self, stripe: u64, erasure_set: usize, thread: usize) -> Result<bool> {
        if self.core.num_erasures(erasure_set) > 0 {
            return Ok(true);
        }
        let p = self.core.params();
        let (w, k, r) = (p.stripe_unit_size, p.dimension, self.redundancy);

        let mut guard = self.scratch[thread].lock().unwrap();
        let RsScratch {
            syndromes, fetch, ..
        } = &mut *guard;

        for s in 0..k + r {
            self.core
                .read_stripe_unit(stripe, erasure_set, s, 0, 1, &mut fetch[s * w..(s + 1) * w])?;
        }
        let mut registered: [Option<&[u8]>; RS_LENGTH] = [None; RS_LENGTH];
        for s in 0..k + r {
            registered[self.locator_of(s) as usize] = Some(&fetch[s * w..(s + 1) * w]);
        }
        compute_syndrome(self.gf, &registered, syndromes, 0, r, w);
        Ok(syndromes[..r * w].iter().all(|&b| b == 0))
    }

    /// An erasure inside the update range has no old value to diff against,
    /// so the write must re-encode the full stripe.
    fn force_full_encode(&self, erasure_set: usize, first_unit: usize, units: usize) -> bool {
        (0..self.core.num_erasures(erasure_set)).any(|i| {
            self.core
                .erased_position(erasure_set, i)
                .is_some_and(|pos| pos >= first_unit && pos < first_unit + units)
        })
    }
}
