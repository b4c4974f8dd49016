//! Augmented row store for Gaussian elimination.
//!
//! Each row is `[coefficients (N) | payload (S)]`, laid out in one contiguous
//! buffer with the per-row stride rounded up to [`ROW_ALIGN`] bytes, so rows
//! sit a whole number of cache lines apart. The buffer itself carries no
//! alignment guarantee; the kernels read words unaligned.
//! Rows are addressed by index only; callers never see raw offsets.

use crate::gf::FIELD;
use crate::kernel::Kernel;

/// Row stride alignment in bytes.
pub const ROW_ALIGN: usize = 64;

#[inline]
const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Row-major GF(256) matrix with padded stride.
pub struct Matrix {
    rows: usize,
    coeff_cols: usize,
    width: usize,
    stride: usize,
    data: Vec<u8>,
    scratch: Vec<u8>,
    kernel: Kernel,
}

impl Matrix {
    /// Create a zeroed `rows × (coeff_cols + payload_cols)` matrix.
    pub fn new(rows: usize, coeff_cols: usize, payload_cols: usize, kernel: Kernel) -> Self {
        let width = coeff_cols + payload_cols;
        let stride = round_up(width.max(1), ROW_ALIGN);
        Self {
            rows,
            coeff_cols,
            width,
            stride,
            data: vec![0u8; rows * stride],
            scratch: vec![0u8; width],
            kernel,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Logical row width (coefficients + payload).
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn coeff_cols(&self) -> usize {
        self.coeff_cols
    }

    #[inline]
    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    #[inline]
    fn offset(&self, row: usize) -> usize {
        debug_assert!(row < self.rows, "row {} out of range ({})", row, self.rows);
        row * self.stride
    }

    /// Full logical row.
    #[inline]
    pub fn row(&self, row: usize) -> &[u8] {
        let start = self.offset(row);
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let start = self.offset(row);
        &mut self.data[start..start + self.width]
    }

    #[inline]
    pub fn coefficients(&self, row: usize) -> &[u8] {
        &self.row(row)[..self.coeff_cols]
    }

    #[inline]
    pub fn payload(&self, row: usize) -> &[u8] {
        &self.row(row)[self.coeff_cols..]
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[self.offset(row) + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        let at = self.offset(row) + col;
        self.data[at] = value;
    }

    /// Write `coefficients | payload` into `row`.
    pub fn set_row(&mut self, row: usize, coefficients: &[u8], payload: &[u8]) {
        debug_assert_eq!(coefficients.len(), self.coeff_cols);
        debug_assert_eq!(coefficients.len() + payload.len(), self.width);
        let split = self.coeff_cols;
        let dst = self.row_mut(row);
        dst[..split].copy_from_slice(coefficients);
        dst[split..].copy_from_slice(payload);
    }

    /// Zero every row.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// First row in `from..rows` with a nonzero entry at `col`.
    pub fn find_pivot(&self, col: usize, from: usize) -> Option<usize> {
        (from..self.rows).find(|&r| self.get(r, col) != 0)
    }

    /// Row in `from..rows` with the largest entry at `col`, if any is nonzero.
    ///
    /// Ties resolve to the lowest index.
    pub fn find_pivot_max(&self, col: usize, from: usize) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for r in from..self.rows {
            let v = self.get(r, col);
            if v != 0 && best.map_or(true, |(_, b)| v > b) {
                best = Some((r, v));
            }
        }
        best.map(|(r, _)| r)
    }

    /// Exchange two rows through the scratch buffer.
    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (oa, ob, w) = (self.offset(a), self.offset(b), self.width);
        self.scratch.copy_from_slice(&self.data[oa..oa + w]);
        self.data.copy_within(ob..ob + w, oa);
        self.data[ob..ob + w].copy_from_slice(&self.scratch);
    }

    /// Scale `row` so that its entry at `pivot_col` becomes 1.
    ///
    /// No-op when the entry is already 1. The entry must be nonzero.
    pub fn normalize_row(&mut self, row: usize, pivot_col: usize) {
        let pivot = self.get(row, pivot_col);
        debug_assert!(pivot != 0, "normalizing on a zero pivot");
        if pivot == 1 {
            return;
        }
        let inv = FIELD.inv(pivot);
        let kernel = self.kernel;
        kernel.scale(self.row_mut(row), inv);
    }

    /// `target[k] ^= factor · source[k]` for `k >= from_col`.
    pub fn multiply_add(&mut self, target: usize, source: usize, factor: u8, from_col: usize) {
        if factor == 0 || target == source {
            debug_assert!(target != source, "multiply_add onto itself");
            return;
        }
        let (ot, os) = (self.offset(target), self.offset(source));
        let (lo, hi, width, kernel) = (from_col, self.width, self.width, self.kernel);
        debug_assert!(from_col <= width);

        let (dst, src) = if ot < os {
            let (head, tail) = self.data.split_at_mut(os);
            (&mut head[ot + lo..ot + hi], &tail[lo..hi])
        } else {
            let (head, tail) = self.data.split_at_mut(ot);
            (&mut tail[lo..hi], &head[os + lo..os + hi])
        };
        kernel.mul_add(dst, src, factor);
    }

    /// Gauss-Jordan elimination over the coefficient columns.
    ///
    /// Uses largest-entry pivoting, normalizes every pivot row and clears its
    /// column in all other rows. Returns the rank; the first `rank` rows are
    /// then the reduced pivot rows in column order.
    pub fn solve(&mut self) -> usize {
        let mut rank = 0;
        for col in 0..self.coeff_cols {
            if rank == self.rows {
                break;
            }
            let Some(pivot) = self.find_pivot_max(col, rank) else {
                continue;
            };
            self.swap_rows(rank, pivot);
            self.normalize_row(rank, col);
            for r in 0..self.rows {
                if r != rank {
                    let factor = self.get(r, col);
                    // Entries left of `col` in the pivot row are zero.
                    self.multiply_add(r, rank, factor, col);
                }
            }
            rank += 1;
        }
        rank
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("coeff_cols", &self.coeff_cols)
            .field("width", &self.width)
            .field("stride", &self.stride)
            .field("kernel", &self.kernel)
            .finish()
    }
}
