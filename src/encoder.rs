//! Block encoder: systematic pieces first, then random linear combinations.

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::trace;

use crate::kernel::Kernel;
use crate::Error;

/// One coded symbol: `payload = Σ coefficients[i] · piece[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedSymbol {
    pub generation: u32,
    pub coefficients: Vec<u8>,
    pub payload: Vec<u8>,
}

impl CodedSymbol {
    /// True when the coefficients are a unit vector, i.e. the payload is a
    /// raw source piece.
    pub fn is_systematic(&self) -> bool {
        let mut ones = 0;
        for &c in &self.coefficients {
            match c {
                0 => {}
                1 => ones += 1,
                _ => return false,
            }
        }
        ones == 1
    }
}

/// Encoder bound to the N pieces of one generation.
///
/// The source buffer is shared (`Bytes`), never copied, unless it is shorter
/// than `N·S` and has to be zero-padded once.
pub struct BlockEncoder {
    generation: u32,
    piece_count: usize,
    piece_size: usize,
    source: Bytes,
    systematic: bool,
    next_systematic: usize,
    produced: u64,
    kernel: Kernel,
    rng: StdRng,
}

impl BlockEncoder {
    /// Bind `source` (at most `piece_count · piece_size` bytes) to a new
    /// encoder. Coefficients come from an entropy-seeded generator.
    pub fn new(
        generation: u32,
        piece_count: usize,
        piece_size: usize,
        source: Bytes,
        kernel: Kernel,
    ) -> Result<Self, Error> {
        Self::with_rng(generation, piece_count, piece_size, source, kernel, StdRng::from_entropy())
    }

    /// Same as [`BlockEncoder::new`] with a reproducible coefficient stream.
    pub fn with_seed(
        generation: u32,
        piece_count: usize,
        piece_size: usize,
        source: Bytes,
        kernel: Kernel,
        seed: u64,
    ) -> Result<Self, Error> {
        Self::with_rng(generation, piece_count, piece_size, source, kernel, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        generation: u32,
        piece_count: usize,
        piece_size: usize,
        source: Bytes,
        kernel: Kernel,
        rng: StdRng,
    ) -> Result<Self, Error> {
        if piece_count == 0 || piece_size == 0 {
            return Err(Error::InvalidParams);
        }
        let block_len = piece_count * piece_size;
        let source = match source.len() {
            len if len == block_len => source,
            len if len < block_len => {
                let mut padded = BytesMut::zeroed(block_len);
                padded[..len].copy_from_slice(&source);
                padded.freeze()
            }
            len => {
                return Err(Error::WrongLength {
                    expected: block_len,
                    got: len,
                })
            }
        };

        Ok(Self {
            generation,
            piece_count,
            piece_size,
            source,
            systematic: true,
            next_systematic: 0,
            produced: 0,
            kernel,
            rng,
        })
    }

    /// Enable or disable the systematic phase. Disabling it makes every
    /// symbol a random combination from the first one on.
    pub fn systematic(mut self, enabled: bool) -> Self {
        self.systematic = enabled;
        self
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    #[inline]
    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    /// Symbols produced so far.
    #[inline]
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Whether the next symbol will be a raw piece.
    #[inline]
    pub fn in_systematic_phase(&self) -> bool {
        self.systematic && self.next_systematic < self.piece_count
    }

    #[inline]
    pub fn piece(&self, index: usize) -> &[u8] {
        let start = index * self.piece_size;
        &self.source[start..start + self.piece_size]
    }

    /// The (padded) source block.
    pub fn source(&self) -> &Bytes {
        &self.source
    }

    /// Produce the next symbol into freshly allocated buffers.
    pub fn produce(&mut self) -> CodedSymbol {
        let mut coefficients = vec![0u8; self.piece_count];
        let mut payload = vec![0u8; self.piece_size];
        self.fill_next(&mut coefficients, &mut payload);
        CodedSymbol {
            generation: self.generation,
            coefficients,
            payload,
        }
    }

    /// Produce the next symbol directly into caller buffers (e.g. a pool
    /// slot). Returns whether the symbol is systematic.
    pub fn produce_into(&mut self, coefficients: &mut [u8], payload: &mut [u8]) -> Result<bool, Error> {
        if coefficients.len() != self.piece_count {
            return Err(Error::WrongLength {
                expected: self.piece_count,
                got: coefficients.len(),
            });
        }
        if payload.len() != self.piece_size {
            return Err(Error::WrongLength {
                expected: self.piece_size,
                got: payload.len(),
            });
        }
        Ok(self.fill_next(coefficients, payload))
    }

    fn fill_next(&mut self, coefficients: &mut [u8], payload: &mut [u8]) -> bool {
        self.produced += 1;

        if self.in_systematic_phase() {
            let index = self.next_systematic;
            self.next_systematic += 1;
            coefficients.fill(0);
            coefficients[index] = 1;
            payload.copy_from_slice(self.piece(index));
            trace!(generation = self.generation, index, "systematic symbol");
            return true;
        }

        // An all-zero draw is possible and is left for the decoder to discard.
        self.rng.fill_bytes(coefficients);
        self.combine(coefficients, payload);
        trace!(generation = self.generation, produced = self.produced, "coded symbol");
        false
    }

    /// `payload = Σ coefficients[i] · piece[i]`.
    pub fn combine(&self, coefficients: &[u8], payload: &mut [u8]) {
        debug_assert_eq!(coefficients.len(), self.piece_count);
        debug_assert_eq!(payload.len(), self.piece_size);

        let mut first = true;
        for (index, &c) in coefficients.iter().enumerate() {
            if c == 0 {
                continue;
            }
            if first {
                self.kernel.scaled_copy(payload, self.piece(index), c);
                first = false;
            } else {
                self.kernel.mul_add(payload, self.piece(index), c);
            }
        }
        if first {
            payload.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gf::FIELD;

    fn source(n: usize, s: usize) -> Bytes {
        Bytes::from((0..n * s).map(|i| (i * 7 + 3) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_systematic_phase_emits_pieces() {
        let mut enc = BlockEncoder::with_seed(5, 4, 16, source(4, 16), Kernel::Wide, 1).unwrap();
        for i in 0..4 {
            assert!(enc.in_systematic_phase());
            let sym = enc.produce();
            assert_eq!(sym.generation, 5);
            assert!(sym.is_systematic());
            assert_eq!(sym.coefficients[i], 1);
            assert_eq!(sym.payload, enc.piece(i));
        }
        assert!(!enc.in_systematic_phase());
        assert_eq!(enc.produced(), 4);
    }

    #[test]
    fn test_coded_payload_is_linear_combination() {
        let mut enc = BlockEncoder::with_seed(0, 6, 33, source(6, 33), Kernel::Lane4, 42)
            .unwrap()
            .systematic(false);
        for _ in 0..8 {
            let sym = enc.produce();
            let mut expected = vec![0u8; 33];
            for (i, &c) in sym.coefficients.iter().enumerate() {
                for (e, p) in expected.iter_mut().zip(enc.piece(i)) {
                    *e ^= FIELD.mul(c, *p);
                }
            }
            assert_eq!(sym.payload, expected);
        }
    }

    #[test]
    fn test_zero_vector_gives_zero_payload() {
        let enc = BlockEncoder::with_seed(0, 3, 8, source(3, 8), Kernel::Wide, 0).unwrap();
        let mut payload = vec![0xee; 8];
        enc.combine(&[0, 0, 0], &mut payload);
        assert!(payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_source_is_padded() {
        let enc = BlockEncoder::new(1, 4, 4, Bytes::from_static(b"abcdef"), Kernel::Scalar).unwrap();
        assert_eq!(enc.source().len(), 16);
        assert_eq!(enc.piece(0), b"abcd");
        assert_eq!(enc.piece(1), b"ef\0\0");
        assert_eq!(enc.piece(3), &[0u8; 4]);
    }

    #[test]
    fn test_invalid_construction() {
        assert_eq!(
            BlockEncoder::new(0, 0, 4, Bytes::new(), Kernel::Wide).err(),
            Some(Error::InvalidParams)
        );
        assert_eq!(
            BlockEncoder::new(0, 2, 2, Bytes::from_static(b"12345"), Kernel::Wide).err(),
            Some(Error::WrongLength { expected: 4, got: 5 })
        );
    }

    #[test]
    fn test_produce_into_checks_lengths() {
        let mut enc = BlockEncoder::with_seed(0, 4, 8, source(4, 8), Kernel::Wide, 9).unwrap();
        let mut coeffs = [0u8; 3];
        let mut payload = [0u8; 8];
        assert_eq!(
            enc.produce_into(&mut coeffs, &mut payload),
            Err(Error::WrongLength { expected: 4, got: 3 })
        );
        let mut coeffs = [0u8; 4];
        assert_eq!(enc.produce_into(&mut coeffs, &mut payload), Ok(true));
        assert_eq!(&payload, enc.piece(0));
    }

    #[test]
    fn test_seeded_encoders_repeat() {
        let mut a = BlockEncoder::with_seed(0, 8, 8, source(8, 8), Kernel::Wide, 7).unwrap().systematic(false);
        let mut b = BlockEncoder::with_seed(0, 8, 8, source(8, 8), Kernel::Scalar, 7).unwrap().systematic(false);
        for _ in 0..5 {
            assert_eq!(a.produce(), b.produce());
        }
    }
}
