//! The boundary between the engine and the numeric recursions.
//!
//! The engine never looks inside a table. It asks the kernel how much memory
//! a table will need, creates it, asks the kernel to extend it up to a number
//! of filled diagonals, and finally hands the filled tables back to the
//! kernel to extract energies, pair matrices or backtracked structures.

use super::models::action::Action;
use super::models::complex::{Complex, Strand};
use super::models::job::{Ensemble, SampleParams};
use super::models::result::{PairList, StructureEnergy};
use nalgebra::DMatrix;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct KernelError {
    pub message: String,
}

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Numeric representation of a block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Precision {
    /// The fast representation tried first.
    Primary,
    /// The overflow-safe representation used when the primary one fails.
    Wide,
}

/// Value read from the corner of a fully filled root table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootValue {
    /// Value including complex-level corrections (symmetry, association).
    pub value: f64,
    /// Value as stored in the table.
    pub raw: f64,
}

/// Number of diagonals a block needs filled.
///
/// A full request on a multi-strand block covers every diagonal; anything
/// else only needs the diagonals within the first strand.
pub fn required_extent(complex: &Complex, full: bool) -> usize {
    if full && complex.len() > 1 {
        complex.first().len() + complex.last().len() - 1
    } else {
        complex.first().len()
    }
}

/// Everything a kernel needs to extend one block.
pub struct BlockFill<'a, K: Kernel> {
    pub ensemble: Ensemble,
    pub complex: &'a Complex,
    pub precision: Precision,
    pub model: &'a K::Prepared,
    pub action: Option<&'a Action>,
    pub table: &'a mut K::Block,
    /// Sub-blocks in prefix/suffix order: for split `n`, the prefix
    /// `complex[0..len-n-1]` followed by the suffix `complex[n+1..len]`.
    pub dependencies: &'a [&'a K::Block],
    /// Strand tables in the order of `complex.strands()`.
    pub strands: &'a [&'a K::Strand],
    /// First diagonal not yet filled.
    pub start: usize,
    /// Diagonal count to reach.
    pub end: usize,
    pub(crate) stop: &'a (dyn Fn() -> bool + Sync),
}

impl<K: Kernel> BlockFill<'_, K> {
    /// True once another work item has failed; long fills may return early.
    pub fn should_stop(&self) -> bool {
        (self.stop)()
    }
}

/// Filled tables of every contiguous sub-complex, indexed by strand range.
pub struct BlockTriangle<'a, B> {
    size: usize,
    blocks: Vec<&'a B>,
}

impl<'a, B> BlockTriangle<'a, B> {
    /// `blocks` must be ordered by end strand, then start strand.
    pub fn new(size: usize, blocks: Vec<&'a B>) -> Self {
        debug_assert_eq!(blocks.len(), size * (size + 1) / 2);
        Self { size, blocks }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Table of strands `i..=j`.
    pub fn get(&self, i: usize, j: usize) -> &'a B {
        assert!(i <= j && j < self.size, "strand range {i}..={j} outside triangle");
        self.blocks[j * (j + 1) / 2 + i]
    }
}

/// Inputs for a structure backtrack over a filled complex.
pub struct BacktrackContext<'a, K: Kernel> {
    pub ensemble: Ensemble,
    pub complex: &'a Complex,
    pub model: &'a K::Prepared,
    pub action: Option<&'a Action>,
    pub blocks: BlockTriangle<'a, K::Block>,
    pub strands: &'a [&'a K::Strand],
}

/// A dynamic-programming implementation the engine can schedule.
///
/// Tables are opaque to the engine. Implementations must be able to read
/// dependencies in either precision while filling.
pub trait Kernel: Send + Sync + Sized + 'static {
    type Strand: Send + Sync + 'static;
    type Block: Send + Sync + 'static;
    type Prepared: Send + Sync + 'static;

    fn strand_memory(&self, ensemble: Ensemble, strand: &Strand) -> usize;

    fn block_memory(&self, ensemble: Ensemble, complex: &Complex) -> usize;

    /// Expands the model for sequences up to `capacity` nucleotides.
    fn prepare(
        &self,
        ensemble: Ensemble,
        precision: Precision,
        capacity: usize,
    ) -> Result<Self::Prepared, KernelError>;

    fn compute_strand(
        &self,
        ensemble: Ensemble,
        strand: &Strand,
        model: &Self::Prepared,
    ) -> Result<Self::Strand, KernelError>;

    /// An empty table in primary precision.
    fn new_block(&self, ensemble: Ensemble, complex: &Complex) -> Self::Block;

    /// Extends `fill.table` from `fill.start` towards `fill.end` and returns
    /// the diagonal count actually reached. Stopping short in primary
    /// precision signals an overflow.
    fn fill_block(&self, fill: BlockFill<'_, Self>) -> Result<usize, KernelError>;

    /// Converts a partially filled table to wide precision in place.
    fn widen_block(&self, block: &mut Self::Block);

    fn root_value(
        &self,
        ensemble: Ensemble,
        complex: &Complex,
        block: &Self::Block,
        model: &Self::Prepared,
    ) -> Result<RootValue, KernelError>;

    /// Log-domain pair values between the first and last strand of a
    /// filled block, shaped `(len(first), len(last))`.
    fn pair_block(
        &self,
        ensemble: Ensemble,
        complex: &Complex,
        block: &Self::Block,
    ) -> Result<DMatrix<f64>, KernelError>;

    fn sample(
        &self,
        context: &BacktrackContext<'_, Self>,
        params: &SampleParams,
    ) -> Result<Vec<PairList>, KernelError>;

    fn subopt(
        &self,
        context: &BacktrackContext<'_, Self>,
        gap: f64,
        max_number: usize,
    ) -> Result<Vec<StructureEnergy>, KernelError>;
}
