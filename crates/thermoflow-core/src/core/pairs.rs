//! Assembly of nucleotide-level pair matrices from per-block slices.
//!
//! A pair job over a complex of `n` strands reads one block for every
//! contiguous window `I..=J` of the duplicated strand list with
//! `I < n` and `I <= J <= I + n`. Each window contributes the log-domain
//! values between its first strand `I` and its last strand `J mod n`.
//! Upper-triangle cells receive inside contributions and lower-triangle
//! cells outside contributions, so summing the matrix with its transpose
//! combines both in log space.

use super::models::job::Sparsity;
use super::models::result::PairsResult;
use nalgebra::{DMatrix, DVector};

/// Placement of one window's values in the nucleotide matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceTarget {
    pub row_offset: usize,
    pub col_offset: usize,
    /// The window is a single strand (`I == J`); only `j > i` is written.
    pub single_strand: bool,
    /// The window wraps onto its own first strand (`J == I + n`); only
    /// `j < i` is written.
    pub wraps: bool,
}

/// Number of windows a pair job over `n` strands reads.
pub fn window_count(n: usize) -> usize {
    n * (n + 1)
}

/// Copies the relevant part of `values` into `matrix`.
pub fn write_slice(matrix: &mut DMatrix<f64>, values: &DMatrix<f64>, target: SliceTarget) {
    for i in 0..values.nrows() {
        let lo = if target.single_strand { i + 1 } else { 0 };
        let hi = if target.wraps { i } else { values.ncols() };
        for j in lo..hi {
            matrix[(target.row_offset + i, target.col_offset + j)] = values[(i, j)];
        }
    }
}

/// Turns assembled log values into pair probabilities.
///
/// The diagonal holds unpaired probabilities. A non-finite `logq` has no
/// meaningful normalization and yields the all-unpaired identity.
pub fn finalize_probabilities(mut log_matrix: DMatrix<f64>, logq: f64) -> DMatrix<f64> {
    let n = log_matrix.nrows();
    if !logq.is_finite() {
        return DMatrix::identity(n, n);
    }
    let transposed = log_matrix.transpose();
    log_matrix += transposed;
    let mut probabilities = log_matrix.map(|v| (v - logq).exp());
    probabilities.fill_diagonal(0.0);
    for k in 0..n {
        let paired: f64 = probabilities.column(k).sum();
        probabilities[(k, k)] = 1.0 - paired;
    }
    probabilities
}

/// Turns assembled energies into pair costs relative to the minimum free
/// energy. The diagonal holds the cheapest cost of each column.
pub fn finalize_costs(mut matrix: DMatrix<f64>, mfe: f64) -> DMatrix<f64> {
    let n = matrix.nrows();
    let transposed = matrix.transpose();
    matrix += transposed;
    matrix.add_scalar_mut(-mfe);
    matrix.fill_diagonal(f64::INFINITY);
    for k in 0..n {
        let cheapest = matrix.column(k).iter().copied().fold(f64::INFINITY, f64::min);
        matrix[(k, k)] = cheapest;
    }
    matrix
}

/// Applies the requested sparsity to a finalized probability matrix.
pub fn sparsify(probabilities: DMatrix<f64>, sparsity: &Sparsity) -> PairsResult {
    let diagonal = DVector::from_iterator(
        probabilities.nrows(),
        (0..probabilities.nrows()).map(|k| probabilities[(k, k)]),
    );
    if sparsity.diagonal_only {
        return PairsResult {
            diagonal,
            matrix: None,
        };
    }
    let mut matrix = probabilities;
    if sparsity.threshold > 0.0 {
        let n = matrix.nrows();
        for j in 0..n {
            for i in 0..n {
                if i != j && matrix[(i, j)] < sparsity.threshold {
                    matrix[(i, j)] = 0.0;
                }
            }
        }
    }
    PairsResult {
        diagonal,
        matrix: Some(matrix),
    }
}
