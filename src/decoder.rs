//! Block decoders.
//!
//! [`BlockDecoder`] performs online Gaussian elimination: each arriving
//! symbol is reduced against the existing pivot rows immediately, so rank is
//! known after every symbol and the final back-substitution only touches the
//! coefficient columns that are still nonzero.
//!
//! [`BatchDecoder`] is the older buffer-then-solve policy: it collects N raw
//! rows, runs a full [`Matrix::solve`] and, if rank is short, rewinds its
//! fill cursor to `rank` so the next symbol overwrites the first dependent
//! row. It reaches the same result with more work and is kept for validation
//! and comparison benches.

use tracing::{debug, trace};

use crate::kernel::Kernel;
use crate::matrix::Matrix;
use crate::Error;

/// Decoder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Accumulating,
    Solved,
}

/// Outcome of feeding one symbol to a [`BlockDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Symbol added a new pivot; rank is now `rank`.
    Innovative { rank: usize },
    /// Symbol was linearly dependent (or the block was already solved).
    Redundant,
    /// Symbol completed the block.
    Solved,
}

/// Incremental decoder for one generation.
pub struct BlockDecoder {
    piece_count: usize,
    piece_size: usize,
    matrix: Matrix,
    pivots: Vec<Option<usize>>,
    rank: usize,
    state: DecodeState,
    received: u64,
    redundant: u64,
}

impl BlockDecoder {
    pub fn new(piece_count: usize, piece_size: usize, kernel: Kernel) -> Result<Self, Error> {
        if piece_count == 0 || piece_size == 0 {
            return Err(Error::InvalidParams);
        }
        Ok(Self {
            piece_count,
            piece_size,
            matrix: Matrix::new(piece_count, piece_count, piece_size, kernel),
            pivots: vec![None; piece_count],
            rank: 0,
            state: DecodeState::Accumulating,
            received: 0,
            redundant: 0,
        })
    }

    #[inline]
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    #[inline]
    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    /// Number of linearly independent symbols incorporated.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn state(&self) -> DecodeState {
        self.state
    }

    #[inline]
    pub fn is_solved(&self) -> bool {
        self.state == DecodeState::Solved
    }

    /// Column → pivot row.
    pub fn pivot_map(&self) -> &[Option<usize>] {
        &self.pivots
    }

    /// Symbols fed so far, including redundant ones.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Symbols discarded as linearly dependent.
    pub fn redundant(&self) -> u64 {
        self.redundant
    }

    /// Reduce one symbol against the current pivots.
    pub fn ingest(&mut self, coefficients: &[u8], payload: &[u8]) -> Result<Ingest, Error> {
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

        self.received += 1;
        if self.state == DecodeState::Solved {
            self.redundant += 1;
            return Ok(Ingest::Redundant);
        }

        // Row `rank` is unused until it becomes a pivot, so it doubles as the
        // working row. A dependent symbol leaves it dirty; the next one
        // overwrites it.
        let work = self.rank;
        self.matrix.set_row(work, coefficients, payload);

        for col in 0..self.piece_count {
            let factor = self.matrix.get(work, col);
            if factor == 0 {
                continue;
            }
            match self.pivots[col] {
                Some(pivot) => {
                    // Pivot rows are zero left of their pivot column.
                    self.matrix.multiply_add(work, pivot, factor, col);
                }
                None => {
                    self.matrix.normalize_row(work, col);
                    self.pivots[col] = Some(work);
                    self.rank += 1;
                    trace!(col, rank = self.rank, "new pivot");

                    if self.rank == self.piece_count {
                        self.finalize();
                        return Ok(Ingest::Solved);
                    }
                    return Ok(Ingest::Innovative { rank: self.rank });
                }
            }
        }

        self.redundant += 1;
        trace!(rank = self.rank, "dependent symbol discarded");
        Ok(Ingest::Redundant)
    }

    /// Feed one symbol; returns whether the block is solved afterwards.
    pub fn add_piece(&mut self, coefficients: &[u8], payload: &[u8]) -> Result<bool, Error> {
        self.ingest(coefficients, payload)?;
        Ok(self.is_solved())
    }

    /// Back-substitution: clear every above-diagonal entry, highest column
    /// first, leaving `[identity | data]` in pivot order.
    fn finalize(&mut self) {
        for i in (0..self.piece_count).rev() {
            let Some(source) = self.pivots[i] else {
                continue;
            };
            for j in 0..i {
                let Some(target) = self.pivots[j] else {
                    continue;
                };
                let factor = self.matrix.get(target, i);
                if factor != 0 {
                    self.matrix.multiply_add(target, source, factor, i);
                }
            }
        }
        self.state = DecodeState::Solved;
        debug!(
            pieces = self.piece_count,
            received = self.received,
            redundant = self.redundant,
            "block solved"
        );
    }

    /// Decoded piece `index` in source order, once solved.
    pub fn piece(&self, index: usize) -> Option<&[u8]> {
        if !self.is_solved() || index >= self.piece_count {
            return None;
        }
        self.pivots[index].map(|row| self.matrix.payload(row))
    }

    /// The reconstructed `N·S` bytes, or `None` before the block is solved.
    pub fn get_data(&self) -> Option<Vec<u8>> {
        if !self.is_solved() {
            return None;
        }
        let mut out = Vec::with_capacity(self.piece_count * self.piece_size);
        for index in 0..self.piece_count {
            out.extend_from_slice(self.piece(index)?);
        }
        Some(out)
    }

    /// Return to `Accumulating` with no pivots, ready for another generation.
    pub fn reset(&mut self) {
        self.pivots.fill(None);
        self.rank = 0;
        self.state = DecodeState::Accumulating;
        self.received = 0;
        self.redundant = 0;
    }
}

/// Buffer-then-solve decoder with fill-cursor rewind.
pub struct BatchDecoder {
    piece_count: usize,
    piece_size: usize,
    matrix: Matrix,
    fill: usize,
    rank: usize,
    solved: bool,
}

impl BatchDecoder {
    pub fn new(piece_count: usize, piece_size: usize, kernel: Kernel) -> Result<Self, Error> {
        if piece_count == 0 || piece_size == 0 {
            return Err(Error::InvalidParams);
        }
        Ok(Self {
            piece_count,
            piece_size,
            matrix: Matrix::new(piece_count, piece_count, piece_size, kernel),
            fill: 0,
            rank: 0,
            solved: false,
        })
    }

    /// Rank established by the last full solve.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Rows currently buffered.
    pub fn buffered(&self) -> usize {
        self.fill
    }

    pub fn is_solved(&self) -> bool {
        self.solved
    }

    pub fn add_piece(&mut self, coefficients: &[u8], payload: &[u8]) -> Result<bool, Error> {
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
        if self.solved {
            return Ok(true);
        }

        self.matrix.set_row(self.fill, coefficients, payload);
        self.fill += 1;
        if self.fill < self.piece_count {
            return Ok(false);
        }

        self.rank = self.matrix.solve();
        if self.rank == self.piece_count {
            self.solved = true;
            debug!(pieces = self.piece_count, "batch solve complete");
        } else {
            trace!(rank = self.rank, "batch solve deficient, rewinding");
            self.fill = self.rank;
        }
        Ok(self.solved)
    }

    pub fn get_data(&self) -> Option<Vec<u8>> {
        if !self.solved {
            return None;
        }
        let mut out = Vec::with_capacity(self.piece_count * self.piece_size);
        for row in 0..self.piece_count {
            out.extend_from_slice(self.matrix.payload(row));
        }
        Some(out)
    }

    pub fn reset(&mut self) {
        self.fill = 0;
        self.rank = 0;
        self.solved = false;
    }
}
