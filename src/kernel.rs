//! Bulk row operations over GF(256).
//!
//! Every coding operation reduces to four primitives applied to whole byte
//! rows: XOR, multiply-accumulate (`dst ^= f·src`), in-place scale and scaled
//! copy. [`RowOps`] is the seam; three implementations are provided and the
//! choice is made once per encoder/decoder through [`Kernel`].
//!
//! | Kernel   | Width                  | Notes                                   |
//! |----------|------------------------|-----------------------------------------|
//! | `Scalar` | 1 byte                 | reference, `Gf256` arithmetic           |
//! | `Wide`   | 8 bytes (16 with SIMD) | default; SSSE3 / NEON nibble shuffles   |
//! | `Lane4`  | 4 bytes                | u32 lanes, no target features required  |
//!
//! All kernels produce bit-identical results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::gf::{mul_slow, Gf256, FIELD};

/// Row-level primitives. `dst` and `src` always have equal length.
pub trait RowOps {
    /// `dst ^= src`
    fn xor(dst: &mut [u8], src: &[u8]);
    /// `dst ^= factor · src`
    fn mul_add(dst: &mut [u8], src: &[u8], factor: u8);
    /// `dst = factor · dst`
    fn scale(dst: &mut [u8], factor: u8);
    /// `dst = factor · src`
    fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8);
}

/// Row kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    Scalar,
    #[default]
    Wide,
    Lane4,
}

impl Kernel {
    pub const ALL: [Kernel; 3] = [Kernel::Scalar, Kernel::Wide, Kernel::Lane4];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::Scalar => "scalar",
            Kernel::Wide => "wide",
            Kernel::Lane4 => "lane4",
        }
    }

    /// Whether the `Wide` kernel runs on vector instructions in this build.
    pub const fn accelerated() -> bool {
        cfg!(all(
            feature = "simd",
            any(
                all(target_arch = "x86_64", target_feature = "ssse3"),
                target_arch = "aarch64"
            )
        ))
    }

    #[inline]
    pub fn xor(self, dst: &mut [u8], src: &[u8]) {
        match self {
            Kernel::Scalar => ScalarOps::xor(dst, src),
            Kernel::Wide => WideOps::xor(dst, src),
            Kernel::Lane4 => Lane4Ops::xor(dst, src),
        }
    }

    #[inline]
    pub fn mul_add(self, dst: &mut [u8], src: &[u8], factor: u8) {
        match self {
            Kernel::Scalar => ScalarOps::mul_add(dst, src, factor),
            Kernel::Wide => WideOps::mul_add(dst, src, factor),
            Kernel::Lane4 => Lane4Ops::mul_add(dst, src, factor),
        }
    }

    #[inline]
    pub fn scale(self, dst: &mut [u8], factor: u8) {
        match self {
            Kernel::Scalar => ScalarOps::scale(dst, factor),
            Kernel::Wide => WideOps::scale(dst, factor),
            Kernel::Lane4 => Lane4Ops::scale(dst, factor),
        }
    }

    #[inline]
    pub fn scaled_copy(self, dst: &mut [u8], src: &[u8], factor: u8) {
        match self {
            Kernel::Scalar => ScalarOps::scaled_copy(dst, src, factor),
            Kernel::Wide => WideOps::scaled_copy(dst, src, factor),
            Kernel::Lane4 => Lane4Ops::scaled_copy(dst, src, factor),
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Kernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" => Ok(Kernel::Scalar),
            "wide" => Ok(Kernel::Wide),
            "lane4" => Ok(Kernel::Lane4),
            other => Err(format!("unknown kernel '{}' (expected scalar, wide or lane4)", other)),
        }
    }
}

/// Byte-at-a-time reference kernel.
pub struct ScalarOps;

impl RowOps for ScalarOps {
    fn xor(dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= *s;
        }
    }

    fn mul_add(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        let f = Gf256(factor);
        for (d, s) in dst.iter_mut().zip(src) {
            *d = (Gf256(*d) + f * Gf256(*s)).0;
        }
    }

    fn scale(dst: &mut [u8], factor: u8) {
        let f = Gf256(factor);
        for d in dst.iter_mut() {
            *d = (f * Gf256(*d)).0;
        }
    }

    fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        let f = Gf256(factor);
        for (d, s) in dst.iter_mut().zip(src) {
            *d = (f * Gf256(*s)).0;
        }
    }
}

/// u64-chunked kernel, vectorised with the `simd` feature.
pub struct WideOps;

/// Bytes handled one at a time before `dst` reaches u64 alignment.
#[inline(always)]
fn aligned_head(dst: &[u8]) -> usize {
    dst.as_ptr().align_offset(8).min(dst.len())
}

#[allow(dead_code)]
#[inline(always)]
fn lookup8(row: &[u8; 256], src: &[u8]) -> u64 {
    let mut packed = [0u8; 8];
    for (p, s) in packed.iter_mut().zip(src) {
        *p = row[*s as usize];
    }
    u64::from_ne_bytes(packed)
}

#[inline(always)]
fn load8(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_ne_bytes(word)
}

impl RowOps for WideOps {
    fn xor(dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        let head = aligned_head(dst);
        ScalarOps::xor(&mut dst[..head], &src[..head]);

        let mut d_chunks = dst[head..].chunks_exact_mut(8);
        let mut s_chunks = src[head..].chunks_exact(8);
        for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
            d.copy_from_slice(&(load8(d) ^ load8(s)).to_ne_bytes());
        }
        ScalarOps::xor(d_chunks.into_remainder(), s_chunks.remainder());
    }

    fn mul_add(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        if factor == 0 {
            return;
        }
        if factor == 1 {
            Self::xor(dst, src);
            return;
        }

        #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "ssse3"))]
        unsafe {
            ssse3::mul_add(dst, src, factor)
        }

        #[cfg(all(feature = "simd", target_arch = "aarch64"))]
        unsafe {
            neon::mul_add(dst, src, factor)
        }

        #[cfg(not(all(
            feature = "simd",
            any(
                all(target_arch = "x86_64", target_feature = "ssse3"),
                target_arch = "aarch64"
            )
        )))]
        {
            let row = FIELD.row(factor);
            let head = aligned_head(dst);
            for (d, s) in dst[..head].iter_mut().zip(&src[..head]) {
                *d ^= row[*s as usize];
            }
            let mut d_chunks = dst[head..].chunks_exact_mut(8);
            let mut s_chunks = src[head..].chunks_exact(8);
            for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
                d.copy_from_slice(&(load8(d) ^ lookup8(row, s)).to_ne_bytes());
            }
            for (d, s) in d_chunks.into_remainder().iter_mut().zip(s_chunks.remainder()) {
                *d ^= row[*s as usize];
            }
        }
    }

    fn scale(dst: &mut [u8], factor: u8) {
        if factor == 0 {
            dst.fill(0);
            return;
        }
        if factor == 1 {
            return;
        }

        #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "ssse3"))]
        unsafe {
            ssse3::scale(dst, factor)
        }

        #[cfg(all(feature = "simd", target_arch = "aarch64"))]
        unsafe {
            neon::scale(dst, factor)
        }

        #[cfg(not(all(
            feature = "simd",
            any(
                all(target_arch = "x86_64", target_feature = "ssse3"),
                target_arch = "aarch64"
            )
        )))]
        {
            let row = FIELD.row(factor);
            let mut chunks = dst.chunks_exact_mut(8);
            for d in &mut chunks {
                let mut word = [0u8; 8];
                word.copy_from_slice(d);
                d.copy_from_slice(&lookup8(row, &word).to_ne_bytes());
            }
            for d in chunks.into_remainder() {
                *d = row[*d as usize];
            }
        }
    }

    fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        if factor == 0 {
            dst.fill(0);
            return;
        }
        if factor == 1 {
            dst.copy_from_slice(src);
            return;
        }

        #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "ssse3"))]
        unsafe {
            ssse3::scaled_copy(dst, src, factor)
        }

        #[cfg(all(feature = "simd", target_arch = "aarch64"))]
        unsafe {
            neon::scaled_copy(dst, src, factor)
        }

        #[cfg(not(all(
            feature = "simd",
            any(
                all(target_arch = "x86_64", target_feature = "ssse3"),
                target_arch = "aarch64"
            )
        )))]
        {
            let row = FIELD.row(factor);
            let mut d_chunks = dst.chunks_exact_mut(8);
            let mut s_chunks = src.chunks_exact(8);
            for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
                d.copy_from_slice(&lookup8(row, s).to_ne_bytes());
            }
            for (d, s) in d_chunks.into_remainder().iter_mut().zip(s_chunks.remainder()) {
                *d = row[*s as usize];
            }
        }
    }
}

/// u32-lane kernel: four table lookups per step.
pub struct Lane4Ops;

#[inline(always)]
fn lookup4(row: &[u8; 256], src: &[u8]) -> u32 {
    u32::from_ne_bytes([
        row[src[0] as usize],
        row[src[1] as usize],
        row[src[2] as usize],
        row[src[3] as usize],
    ])
}

#[inline(always)]
fn load4(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl RowOps for Lane4Ops {
    fn xor(dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        let mut d_chunks = dst.chunks_exact_mut(4);
        let mut s_chunks = src.chunks_exact(4);
        for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
            d.copy_from_slice(&(load4(d) ^ load4(s)).to_ne_bytes());
        }
        ScalarOps::xor(d_chunks.into_remainder(), s_chunks.remainder());
    }

    fn mul_add(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        match factor {
            0 => {}
            1 => Self::xor(dst, src),
            _ => {
                let row = FIELD.row(factor);
                let mut d_chunks = dst.chunks_exact_mut(4);
                let mut s_chunks = src.chunks_exact(4);
                for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
                    d.copy_from_slice(&(load4(d) ^ lookup4(row, s)).to_ne_bytes());
                }
                for (d, s) in d_chunks.into_remainder().iter_mut().zip(s_chunks.remainder()) {
                    *d ^= row[*s as usize];
                }
            }
        }
    }

    fn scale(dst: &mut [u8], factor: u8) {
        match factor {
            0 => dst.fill(0),
            1 => {}
            _ => {
                let row = FIELD.row(factor);
                let mut chunks = dst.chunks_exact_mut(4);
                for d in &mut chunks {
                    let word = lookup4(row, d);
                    d.copy_from_slice(&word.to_ne_bytes());
                }
                for d in chunks.into_remainder() {
                    *d = row[*d as usize];
                }
            }
        }
    }

    fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8) {
        debug_assert_eq!(dst.len(), src.len());
        match factor {
            0 => dst.fill(0),
            1 => dst.copy_from_slice(src),
            _ => {
                let row = FIELD.row(factor);
                let mut d_chunks = dst.chunks_exact_mut(4);
                let mut s_chunks = src.chunks_exact(4);
                for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
                    d.copy_from_slice(&lookup4(row, s).to_ne_bytes());
                }
                for (d, s) in d_chunks.into_remainder().iter_mut().zip(s_chunks.remainder()) {
                    *d = row[*s as usize];
                }
            }
        }
    }
}

/// Split-nibble product tables for shuffle-based multiply:
/// `f·v == lo[f][v & 0x0f] ^ hi[f][v >> 4]`.
#[allow(dead_code)]
struct NibbleTables {
    lo: [[u8; 16]; 256],
    hi: [[u8; 16]; 256],
}

#[allow(dead_code)]
impl NibbleTables {
    const fn new() -> Self {
        let mut lo = [[0u8; 16]; 256];
        let mut hi = [[0u8; 16]; 256];

        let mut f = 0usize;
        while f < 256 {
            // powers[k] = f · x^k
            let mut powers = [0u8; 8];
            powers[0] = f as u8;
            let mut k = 1;
            while k < 8 {
                powers[k] = mul_slow(powers[k - 1], 2);
                k += 1;
            }
            // Entry x is entry (x without its lowest bit) plus that bit's power.
            let mut x = 1usize;
            while x < 16 {
                let bit = x.trailing_zeros() as usize;
                lo[f][x] = lo[f][x & (x - 1)] ^ powers[bit];
                hi[f][x] = hi[f][x & (x - 1)] ^ powers[bit + 4];
                x += 1;
            }
            f += 1;
        }

        Self { lo, hi }
    }
}

#[allow(dead_code)]
static NIBBLES: NibbleTables = NibbleTables::new();

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "ssse3"))]
mod ssse3 {
    use super::NIBBLES;
    use crate::gf::FIELD;
    use std::arch::x86_64::*;

    #[inline(always)]
    unsafe fn mul_16(data: __m128i, table_lo: __m128i, table_hi: __m128i, mask: __m128i) -> __m128i {
        let lo = _mm_shuffle_epi8(table_lo, _mm_and_si128(data, mask));
        let hi = _mm_shuffle_epi8(table_hi, _mm_and_si128(_mm_srli_epi64(data, 4), mask));
        _mm_xor_si128(lo, hi)
    }

    #[inline(always)]
    unsafe fn tables(factor: u8) -> (__m128i, __m128i, __m128i) {
        let lo = _mm_loadu_si128(NIBBLES.lo[factor as usize].as_ptr() as *const __m128i);
        let hi = _mm_loadu_si128(NIBBLES.hi[factor as usize].as_ptr() as *const __m128i);
        (lo, hi, _mm_set1_epi8(0x0f))
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_add(dst: &mut [u8], src: &[u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let s = _mm_loadu_si128(src.as_ptr().add(offset) as *const __m128i);
            let d = _mm_loadu_si128(dst.as_ptr().add(offset) as *const __m128i);
            let r = _mm_xor_si128(d, mul_16(s, t_lo, t_hi, mask));
            _mm_storeu_si128(dst.as_mut_ptr().add(offset) as *mut __m128i, r);
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] ^= row[src[i] as usize];
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let s = _mm_loadu_si128(src.as_ptr().add(offset) as *const __m128i);
            _mm_storeu_si128(
                dst.as_mut_ptr().add(offset) as *mut __m128i,
                mul_16(s, t_lo, t_hi, mask),
            );
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] = row[src[i] as usize];
        }
    }

    #[target_feature(enable = "ssse3")]
    pub unsafe fn scale(dst: &mut [u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let d = _mm_loadu_si128(dst.as_ptr().add(offset) as *const __m128i);
            _mm_storeu_si128(
                dst.as_mut_ptr().add(offset) as *mut __m128i,
                mul_16(d, t_lo, t_hi, mask),
            );
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] = row[dst[i] as usize];
        }
    }
}

#[cfg(all(feature = "simd", target_arch = "aarch64"))]
mod neon {
    use super::NIBBLES;
    use crate::gf::FIELD;
    use std::arch::aarch64::*;

    #[inline(always)]
    unsafe fn mul_16(data: uint8x16_t, table_lo: uint8x16_t, table_hi: uint8x16_t, mask: uint8x16_t) -> uint8x16_t {
        let lo = vqtbl1q_u8(table_lo, vandq_u8(data, mask));
        let hi = vqtbl1q_u8(table_hi, vandq_u8(vshrq_n_u8(data, 4), mask));
        veorq_u8(lo, hi)
    }

    #[inline(always)]
    unsafe fn tables(factor: u8) -> (uint8x16_t, uint8x16_t, uint8x16_t) {
        (
            vld1q_u8(NIBBLES.lo[factor as usize].as_ptr()),
            vld1q_u8(NIBBLES.hi[factor as usize].as_ptr()),
            vdupq_n_u8(0x0f),
        )
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn mul_add(dst: &mut [u8], src: &[u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let s = vld1q_u8(src.as_ptr().add(offset));
            let d = vld1q_u8(dst.as_ptr().add(offset));
            vst1q_u8(dst.as_mut_ptr().add(offset), veorq_u8(d, mul_16(s, t_lo, t_hi, mask)));
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] ^= row[src[i] as usize];
        }
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn scaled_copy(dst: &mut [u8], src: &[u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let s = vld1q_u8(src.as_ptr().add(offset));
            vst1q_u8(dst.as_mut_ptr().add(offset), mul_16(s, t_lo, t_hi, mask));
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] = row[src[i] as usize];
        }
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn scale(dst: &mut [u8], factor: u8) {
        let len = dst.len();
        let (t_lo, t_hi, mask) = tables(factor);
        let body = len / 16 * 16;
        let mut offset = 0;
        while offset < body {
            let d = vld1q_u8(dst.as_ptr().add(offset));
            vst1q_u8(dst.as_mut_ptr().add(offset), mul_16(d, t_lo, t_hi, mask));
            offset += 16;
        }
        let row = FIELD.row(factor);
        for i in body..len {
            dst[i] = row[dst[i] as usize];
        }
    }
}
