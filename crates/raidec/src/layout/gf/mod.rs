//! GF(2^m) arithmetic kernel for the erasure codecs.
//!
//! Multiplication of whole stripe units by a fixed field element is the hot
//! operation of the Reed-Solomon path, so it is table driven: for every
//! nonzero scalar `alpha^x` two 16-entry nibble product tables are built at
//! startup, and a buffer multiply resolves each byte as
//! `alpha^x * y = alpha^x * y_lo ^ alpha^x * (y_hi << 4)` with two shuffles.
//! On x86_64 with SSSE3 the shuffles are `_mm_shuffle_epi8`; everywhere else
//! a scalar loop over the same tables is used.

use std::sync::OnceLock;

use anyhow::{Result, bail};

use crate::metrics::{self, GfOpKind};


/// All buffer operations work on multiples of this many bytes.
pub const GF_BLOCK: usize = 16;

/// Primitive polynomials for GF(2^m), indexed by `m`.
const GF_GENERATORS: [u32; 9] = [0, 0, 0x7, 0xB, 0x13, 0x25, 0x43, 0x83, 0x11D];

/// Nibble product tables for one scalar `alpha^x`.
///
/// `lo[y] = alpha^x * y` and `hi[y] = alpha^x * (y << 4)` for `y` in `[0, 16)`.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct MulHelper {
    lo: [u8; 16],
    hi: [u8; 16],
}

/// Log/antilog tables plus the per-scalar nibble helpers.
///
/// Built once per process (see [`GfTables::global`]); afterwards immutable and
/// shared by reference, so codecs never observe a partially built field.
pub struct GfTables {
    extension: u32,
    field_size_1: i32,
    /// `gf[0] = 0`, `gf[1 + i] = alpha^(i mod (2^m - 1))` for `i` in
    /// `[0, 2 * (2^m - 1))`. The doubled range lets log-sum indices skip the
    /// modular reduction.
    gf: Vec<u8>,
    /// `log[0] = -1`, otherwise `gf[1 + log[v]] = v`.
    log: Vec<i32>,
    helpers: Vec<MulHelper>,
    simd: bool,
}

static GF256: OnceLock<GfTables> = OnceLock::new();

impl GfTables {
    /// Construct the tables for GF(2^m). `m` must be in `[2, 8]`.
    ///
    /// # Errors
    /// Returns an error if no primitive polynomial is known for `m` or the
    /// field does not fit a byte.
    pub fn new(extension: u32) -> Result<Self> {
        if extension as usize >= GF_GENERATORS.len() {
            bail!("no primitive polynomial on record for GF(2^{extension})");
        }
        if extension < 2 {
            bail!("multiplication tables are not needed for GF(2)");
        }
        let gen_poly = GF_GENERATORS[extension as usize];
        let field_size_1 = (1i32 << extension) - 1;
        let fs1 = field_size_1 as usize;

        let mut gf = vec![0u8; 2 * fs1 + 1];
        let mut log = vec![-1i32; fs1 + 1];
        gf[1] = 1;
        log[1] = 0;
        for i in 2..=fs1 {
            let mut v = u32::from(gf[i - 1]) << 1;
            if (v >> extension) & 1 == 1 {
                v ^= gen_poly;
            }
            gf[i] = v as u8;
            log[v as usize] = i as i32 - 1;
        }
        // Extend the antilog table so that sums of two logs index directly.
        let (head, tail) = gf.split_at_mut(fs1 + 1);
        tail.copy_from_slice(&head[1..]);

        let mut helpers = Vec::with_capacity(fs1);
        for x in 0..fs1 {
            let mut h = MulHelper {
                lo: [0; 16],
                hi: [0; 16],
            };
            for y in 1..16.min(fs1 + 1) {
                h.lo[y] = gf[1 + (log[y] as usize + x)];
            }
            for y in 1..16.min((fs1 + 1) >> 4) {
                h.hi[y] = gf[1 + (log[y << 4] as usize + x)];
            }
            helpers.push(h);
        }

        Ok(Self {
            extension,
            field_size_1,
            gf,
            log,
            helpers,
            simd: detect_simd(),
        })
    }

    /// The process-wide GF(2^8) instance used by the supplied codecs.
    pub fn global() -> &'static Self {
        GF256.get_or_init(|| Self::new(8).expect("GF(2^8) table construction"))
    }

    #[must_use]
    pub const fn extension(&self) -> u32 {
        self.extension
    }

    /// `2^m - 1`, the multiplicative group order.
    #[must_use]
    pub const fn field_size_1(&self) -> i32 {
        self.field_size_1
    }

    /// `alpha^l` for `l` in `[0, 2 * (2^m - 1))`.
    #[inline]
    #[must_use]
    pub fn alpha_pow(&self, l: i32) -> u8 {
        debug_assert!(l >= 0);
        self.gf[1 + l as usize]
    }

    /// Discrete log of `v`; `-1` for the zero element.
    #[inline]
    #[must_use]
    pub fn log(&self, v: u8) -> i32 {
        self.log[v as usize]
    }

    /// Product of two field elements.
    #[must_use]
    pub fn mul_single(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.alpha_pow(self.log(a) + self.log(b))
    }

    /// `dst[i] = alpha^x * src[i]`. A negative `x` means the scalar is the
    /// zero element and the call is a no-op (mirrors the log-domain calling
    /// convention of the codecs).
    pub fn mul(&self, x: i32, src: &[u8], dst: &mut [u8]) {
        if x < 0 {
            return;
        }
        check_blocks(src.len(), dst.len());
        metrics::record_gf_op(GfOpKind::Mul, src.len());
        let h = &self.helpers[x as usize];
        #[cfg(target_arch = "x86_64")]
        if self.simd {
            // Dispatch guarded by the runtime SSSE3 probe in `detect_simd`.
            unsafe { simd::mul_blocks(&h.lo, &h.hi, src, dst) };
            return;
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d = h.lo[(s & 0x0F) as usize] ^ h.hi[(s >> 4) as usize];
        }
    }

    /// `buf[i] = alpha^x * buf[i]`; no-op for `x < 0`.
    pub fn mul_in_place(&self, x: i32, buf: &mut [u8]) {
        if x < 0 {
            return;
        }
        check_blocks(buf.len(), buf.len());
        metrics::record_gf_op(GfOpKind::Mul, buf.len());
        let h = &self.helpers[x as usize];
        #[cfg(target_arch = "x86_64")]
        if self.simd {
            unsafe { simd::mul_in_place_blocks(&h.lo, &h.hi, buf) };
            return;
        }
        for b in buf.iter_mut() {
            *b = h.lo[(*b & 0x0F) as usize] ^ h.hi[(*b >> 4) as usize];
        }
    }

    /// `dst[i] ^= alpha^x * src[i]`; no-op for `x < 0`, plain XOR for `x = 0`.
    pub fn mul_add(&self, x: i32, src: &[u8], dst: &mut [u8]) {
        if x < 0 {
            return;
        }
        if x == 0 {
            xor_in(dst, src);
            return;
        }
        check_blocks(src.len(), dst.len());
        metrics::record_gf_op(GfOpKind::MulAdd, src.len());
        let h = &self.helpers[x as usize];
        #[cfg(target_arch = "x86_64")]
        if self.simd {
            unsafe { simd::mul_add_blocks(&h.lo, &h.hi, src, dst) };
            return;
        }
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= h.lo[(s & 0x0F) as usize] ^ h.hi[(s >> 4) as usize];
        }
    }

    /// `buf[i] = alpha^x * buf[i] ^ correction[i]`; no-op for `x < 0`.
    pub fn add_mul(&self, x: i32, buf: &mut [u8], correction: &[u8]) {
        if x < 0 {
            return;
        }
        check_blocks(buf.len(), correction.len());
        metrics::record_gf_op(GfOpKind::MulAdd, buf.len());
        let h = &self.helpers[x as usize];
        #[cfg(target_arch = "x86_64")]
        if self.simd {
            unsafe { simd::add_mul_blocks(&h.lo, &h.hi, buf, correction) };
            return;
        }
        for (b, c) in buf.iter_mut().zip(correction) {
            *b = h.lo[(*b & 0x0F) as usize] ^ h.hi[(*b >> 4) as usize] ^ c;
        }
    }

    /// `dst[i] = alpha^x * (src1[i] ^ src2[i])`; zeroes `dst` for `x < 0`.
    pub fn mul_sum(&self, x: i32, src1: &[u8], src2: &[u8], dst: &mut [u8]) {
        check_blocks(src1.len(), dst.len());
        check_blocks(src2.len(), dst.len());
        if x < 0 {
            dst.fill(0);
            return;
        }
        metrics::record_gf_op(GfOpKind::MulAdd, dst.len());
        let h = &self.helpers[x as usize];
        #[cfg(target_arch = "x86_64")]
        if self.simd {
            unsafe { simd::mul_sum_blocks(&h.lo, &h.hi, src1, src2, dst) };
            return;
        }
        for ((d, a), b) in dst.iter_mut().zip(src1).zip(src2) {
            let s = a ^ b;
            *d = h.lo[(s & 0x0F) as usize] ^ h.hi[(s >> 4) as usize];
        }
    }
}

fn detect_simd() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("ssse3")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[inline]
fn check_blocks(a: usize, b: usize) {
    assert_eq!(a, b, "buffer length mismatch");
    assert_eq!(a % GF_BLOCK, 0, "buffer length must be a multiple of 16");
}

#[inline]
fn load16(chunk: &[u8]) -> u128 {
    u128::from_ne_bytes(chunk.try_into().expect("16-byte chunk"))
}

/// `a[i] ^= b[i]`.
pub fn xor_in(a: &mut [u8], b: &[u8]) {
    check_blocks(a.len(), b.len());
    metrics::record_gf_op(GfOpKind::Xor, a.len());
    for (ac, bc) in a.chunks_exact_mut(GF_BLOCK).zip(b.chunks_exact(GF_BLOCK)) {
        let v = load16(ac) ^ load16(bc);
        ac.copy_from_slice(&v.to_ne_bytes());
    }
}

/// `c[i] = a[i] ^ b[i]`.
pub fn xor_into(a: &[u8], b: &[u8], c: &mut [u8]) {
    check_blocks(a.len(), c.len());
    check_blocks(b.len(), c.len());
    metrics::record_gf_op(GfOpKind::Xor, c.len());
    for ((cc, ac), bc) in c
        .chunks_exact_mut(GF_BLOCK)
        .zip(a.chunks_exact(GF_BLOCK))
        .zip(b.chunks_exact(GF_BLOCK))
    {
        let v = load16(ac) ^ load16(bc);
        cc.copy_from_slice(&v.to_ne_bytes());
    }
}

/// `d[i] = a[i] ^ b[i] ^ c[i]`.
pub fn xor3_into(a: &[u8], b: &[u8], c: &[u8], d: &mut [u8]) {
    check_blocks(a.len(), d.len());
    check_blocks(b.len(), d.len());
    check_blocks(c.len(), d.len());
    metrics::record_gf_op(GfOpKind::Xor, 2 * d.len());
    for (((dc, ac), bc), cc) in d
        .chunks_exact_mut(GF_BLOCK)
        .zip(a.chunks_exact(GF_BLOCK))
        .zip(b.chunks_exact(GF_BLOCK))
        .zip(c.chunks_exact(GF_BLOCK))
    {
        let v = load16(ac) ^ load16(bc) ^ load16(cc);
        dc.copy_from_slice(&v.to_ne_bytes());
    }
}

/// `c[i] ^= a[i] ^ b[i]`.
pub fn xor_xor_into(a: &[u8], b: &[u8], c: &mut [u8]) {
    check_blocks(a.len(), c.len());
    check_blocks(b.len(), c.len());
    metrics::record_gf_op(GfOpKind::Xor, 2 * c.len());
    for ((cc, ac), bc) in c
        .chunks_exact_mut(GF_BLOCK)
        .zip(a.chunks_exact(GF_BLOCK))
        .zip(b.chunks_exact(GF_BLOCK))
    {
        let v = load16(cc) ^ load16(ac) ^ load16(bc);
        cc.copy_from_slice(&v.to_ne_bytes());
    }
}

#[cfg(target_arch = "x86_64")]
mod simd {
    //! SSSE3 kernels: two nibble-table shuffles and a XOR per 16-byte lane.

    use std::arch::x86_64::{
        __m128i, _mm_and_si128, _mm_loadu_si128, _mm_set1_epi8, _mm_shuffle_epi8, _mm_srli_epi64,
        _mm_storeu_si128, _mm_xor_si128,
    };

    #[inline]
    #[target_feature(enable = "ssse3")]
    unsafe fn mul_lane(data: __m128i, lo: __m128i, hi: __m128i, mask: __m128i) -> __m128i {
        unsafe {
            let lo_nibbles = _mm_and_si128(data, mask);
            let hi_nibbles = _mm_and_si128(_mm_srli_epi64(data, 4), mask);
            _mm_xor_si128(
                _mm_shuffle_epi8(lo, lo_nibbles),
                _mm_shuffle_epi8(hi, hi_nibbles),
            )
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_blocks(lo: &[u8; 16], hi: &[u8; 16], src: &[u8], dst: &mut [u8]) {
        unsafe {
            let lo = _mm_loadu_si128(lo.as_ptr().cast());
            let hi = _mm_loadu_si128(hi.as_ptr().cast());
            let mask = _mm_set1_epi8(0x0F);
            for off in (0..src.len()).step_by(16) {
                let a = _mm_loadu_si128(src.as_ptr().add(off).cast());
                let r = mul_lane(a, lo, hi, mask);
                _mm_storeu_si128(dst.as_mut_ptr().add(off).cast(), r);
            }
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_in_place_blocks(lo: &[u8; 16], hi: &[u8; 16], buf: &mut [u8]) {
        unsafe {
            let lo = _mm_loadu_si128(lo.as_ptr().cast());
            let hi = _mm_loadu_si128(hi.as_ptr().cast());
            let mask = _mm_set1_epi8(0x0F);
            for off in (0..buf.len()).step_by(16) {
                let a = _mm_loadu_si128(buf.as_ptr().add(off).cast());
                let r = mul_lane(a, lo, hi, mask);
                _mm_storeu_si128(buf.as_mut_ptr().add(off).cast(), r);
            }
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_add_blocks(lo: &[u8; 16], hi: &[u8; 16], src: &[u8], dst: &mut [u8]) {
        unsafe {
            let lo = _mm_loadu_si128(lo.as_ptr().cast());
            let hi = _mm_loadu_si128(hi.as_ptr().cast());
            let mask = _mm_set1_epi8(0x0F);
            for off in (0..src.len()).step_by(16) {
                let a = _mm_loadu_si128(src.as_ptr().add(off).cast());
                let d = _mm_loadu_si128(dst.as_ptr().add(off).cast());
                let r = _mm_xor_si128(d, mul_lane(a, lo, hi, mask));
                _mm_storeu_si128(dst.as_mut_ptr().add(off).cast(), r);
            }
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn add_mul_blocks(lo: &[u8; 16], hi: &[u8; 16], buf: &mut [u8], corr: &[u8]) {
        unsafe {
            let lo = _mm_loadu_si128(lo.as_ptr().cast());
            let hi = _mm_loadu_si128(hi.as_ptr().cast());
            let mask = _mm_set1_epi8(0x0F);
            for off in (0..buf.len()).step_by(16) {
                let a = _mm_loadu_si128(buf.as_ptr().add(off).cast());
                let c = _mm_loadu_si128(corr.as_ptr().add(off).cast());
                let r = _mm_xor_si128(c, mul_lane(a, lo, hi, mask));
                _mm_storeu_si128(buf.as_mut_ptr().add(off).cast(), r);
            }
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_sum_blocks(
        lo: &[u8; 16],
        hi: &[u8; 16],
        src1: &[u8],
        src2: &[u8],
        dst: &mut [u8],
    ) {
        unsafe {
            let lo = _mm_loadu_si128(lo.as_ptr().cast());
            let hi = _mm_loadu_si128(hi.as_ptr().cast());
            let mask = _mm_set1_epi8(0x0F);
            for off in (0..dst.len()).step_by(16) {
                let a = _mm_loadu_si128(src1.as_ptr().add(off).cast());
                let b = _mm_loadu_si128(src2.as_ptr().add(off).cast());
                let r = mul_lane(_mm_xor_si128(a, b), lo, hi, mask);
                _mm_storeu_si128(dst.as_mut_ptr().add(off).cast(), r);
            }
        }
    }
}
