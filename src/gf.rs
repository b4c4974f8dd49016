//! # GF(256) Field Arithmetic
//!
//! Byte-sized finite field used for every coefficient and payload operation.
//! Addition and subtraction are XOR; multiplication and division go through
//! log/exp tables, and bulk row operations use the full 256×256 product table
//! (`SBOX[f][v] = f·v`) so that multiplying a row by a fixed factor is a single
//! table lookup per byte.
//!
//! All tables are computed at compile time into the immutable [`FIELD`]
//! static and can be shared freely between threads.
//!
//! ## Polynomial
//!
//! Field polynomial `x^8 + x^6 + x^3 + x^2 + 1` (0x14d) with generator 2.

use gf256::gf::gf;

use crate::Error;

#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

/// Primitive polynomial of the field, including the x^8 term.
pub const POLYNOMIAL: u16 = 0x14d;

/// Generator of the multiplicative group.
pub const GENERATOR: u8 = 0x02;

/// Order of the multiplicative group.
const ORDER: usize = 255;

/// Precomputed field tables.
///
/// `exp` is over-provisioned to 512 entries so that `log[a] + log[b]` and
/// `log[a] + 255 - log[b]` index it directly without a modulo.
pub struct Field {
    exp: [u8; 512],
    log: [u8; 256],
    sbox: [[u8; 256]; 256],
}

/// Process-wide field tables.
pub static FIELD: Field = Field::new();

impl Field {
    /// Build all tables.
    const fn new() -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];

        let mut x: u8 = 1;
        let mut i = 0usize;
        while i < ORDER {
            exp[i] = x;
            exp[i + ORDER] = x;
            log[x as usize] = i as u8;
            x = mul_slow(x, GENERATOR);
            i += 1;
        }
        // exp[510], exp[511] stay unused; keep them on the cycle anyway.
        exp[2 * ORDER] = exp[0];
        exp[2 * ORDER + 1] = exp[1];

        let mut sbox = [[0u8; 256]; 256];
        let mut f = 1usize;
        while f < 256 {
            let mut v = 1usize;
            while v < 256 {
                sbox[f][v] = exp[log[f] as usize + log[v] as usize];
                v += 1;
            }
            f += 1;
        }

        Self { exp, log, sbox }
    }

    /// Shared tables.
    #[inline]
    pub fn global() -> &'static Field {
        &FIELD
    }

    /// `a + b` (XOR).
    #[inline(always)]
    pub const fn add(a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// `a - b` (identical to addition in characteristic 2).
    #[inline(always)]
    pub const fn sub(a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// `a · b` via log/exp.
    #[inline]
    pub fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
    }

    /// `a / b`.
    ///
    /// # Panics
    ///
    /// Panics if `b == 0`. Pivot selection only ever divides by a nonzero
    /// entry, so reaching this is a bug in the caller.
    #[inline]
    pub fn div(&self, a: u8, b: u8) -> u8 {
        assert!(b != 0, "division by zero in GF(256)");
        if a == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + ORDER - self.log[b as usize] as usize]
    }

    /// `a / b`, reporting division by zero as an error.
    #[inline]
    pub fn checked_div(&self, a: u8, b: u8) -> Result<u8, Error> {
        if b == 0 {
            return Err(Error::DivisionByZero);
        }
        Ok(self.div(a, b))
    }

    /// Multiplicative inverse.
    ///
    /// # Panics
    ///
    /// Panics if `a == 0`.
    #[inline]
    pub fn inv(&self, a: u8) -> u8 {
        self.div(1, a)
    }

    /// Product row for a fixed factor: `row(f)[v] == f · v`.
    #[inline(always)]
    pub fn row(&self, factor: u8) -> &[u8; 256] {
        &self.sbox[factor as usize]
    }

    /// `generator^power`.
    #[inline]
    pub fn exp(&self, power: usize) -> u8 {
        self.exp[power % ORDER]
    }

    /// Discrete logarithm, `None` for zero.
    #[inline]
    pub fn log(&self, a: u8) -> Option<u8> {
        (a != 0).then(|| self.log[a as usize])
    }
}

/// Carry-less multiply with reduction by [`POLYNOMIAL`].
///
/// Only used while building tables; the hot paths read [`FIELD`].
pub(crate) const fn mul_slow(a: u8, b: u8) -> u8 {
    let mut result = 0u16;
    let mut aa = a as u16;
    let mut bb = b;

    let mut i = 0;
    while i < 8 {
        if bb & 1 != 0 {
            result ^= aa;
        }
        aa <<= 1;
        bb >>= 1;
        i += 1;
    }

    let mut bit = 15;
    while bit >= 8 {
        if result & (1 << bit) != 0 {
            result ^= POLYNOMIAL << (bit - 8);
        }
        bit -= 1;
    }

    result as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exp_log_cycle() {
        let field = Field::global();
        let mut seen = [false; 256];
        for power in 0..255 {
            let x = field.exp(power);
            assert_ne!(x, 0);
            assert!(!seen[x as usize], "generator repeats at power {}", power);
            seen[x as usize] = true;
            assert_eq!(field.log(x), Some(power as u8));
        }
        assert_eq!(field.log(0), None);
    }

    #[test]
    fn test_sbox_matches_gf256_crate() {
        let field = Field::global();
        for f in 0..=255u8 {
            let row = field.row(f);
            for v in 0..=255u8 {
                let expected = (Gf256(f) * Gf256(v)).0;
                assert_eq!(row[v as usize], expected, "sbox[{}][{}]", f, v);
                assert_eq!(field.mul(f, v), expected);
                assert_eq!(mul_slow(f, v), expected);
            }
        }
    }

    #[test]
    fn test_checked_div_by_zero() {
        assert_eq!(FIELD.checked_div(7, 0), Err(Error::DivisionByZero));
        assert_eq!(FIELD.checked_div(0, 0), Err(Error::DivisionByZero));
        assert_eq!(FIELD.checked_div(0, 9), Ok(0));
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn test_div_by_zero_panics() {
        FIELD.div(3, 0);
    }

    #[test]
    fn test_known_products() {
        // x * x^7 = x^8 = x^6 + x^3 + x^2 + 1
        assert_eq!(FIELD.mul(0x02, 0x80), 0x4d);
        assert_eq!(FIELD.mul(0x01, 0xab), 0xab);
        assert_eq!(Field::add(0x0f, 0xf0), 0xff);
        assert_eq!(Field::sub(0xff, 0x0f), 0xf0);
    }

    proptest! {
        #[test]
        fn prop_mul_by_zero(a in any::<u8>()) {
            prop_assert_eq!(FIELD.mul(a, 0), 0);
            prop_assert_eq!(FIELD.mul(0, a), 0);
        }

        #[test]
        fn prop_div_by_one(a in any::<u8>()) {
            prop_assert_eq!(FIELD.div(a, 1), a);
        }

        #[test]
        fn prop_inverse(a in 1..=255u8) {
            prop_assert_eq!(FIELD.mul(a, FIELD.div(1, a)), 1);
            prop_assert_eq!(FIELD.mul(a, FIELD.inv(a)), 1);
        }

        #[test]
        fn prop_div_undoes_mul(a in any::<u8>(), b in 1..=255u8) {
            prop_assert_eq!(FIELD.div(FIELD.mul(a, b), b), a);
        }

        #[test]
        fn prop_distributive(a in any::<u8>(), b in any::<u8>(), c in any::<u8>()) {
            let lhs = FIELD.mul(a, Field::add(b, c));
            let rhs = Field::add(FIELD.mul(a, b), FIELD.mul(a, c));
            prop_assert_eq!(lhs, rhs);
        }
    }
}
