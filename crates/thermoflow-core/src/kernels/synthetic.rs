//! A deterministic, instrumented kernel.
//!
//! Tables carry no real recursion; filling one only records how far it got.
//! Energies are simple functions of nucleotide count, which makes results
//! predictable, while every call is logged so callers can check ordering,
//! memory and reuse. Failure, overflow and latency can be injected per
//! complex.

use crate::core::kernel::{
    BacktrackContext, BlockFill, Kernel, KernelError, Precision, RootValue, required_extent,
};
use crate::core::models::complex::{Complex, Strand};
use crate::core::models::job::{Ensemble, SampleParams};
use crate::core::models::result::{PairList, StructureEnergy};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Per-nucleotide log partition function contribution.
pub const LOGQ_PER_NUCLEOTIDE: f64 = 0.1;
/// Per-nucleotide free energy contribution, in kcal/mol.
pub const MFE_PER_NUCLEOTIDE: f64 = -0.5;

const MIN_HAIRPIN: usize = 4;

type BlockBytes = dyn Fn(Ensemble, &Complex) -> usize + Send + Sync;
type StrandBytes = dyn Fn(Ensemble, &Strand) -> usize + Send + Sync;

/// One call to [`Kernel::fill_block`].
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    pub ensemble: Ensemble,
    pub complex: Complex,
    pub start: usize,
    pub end: usize,
    pub reached: usize,
    pub precision: Precision,
    /// Global event counter when the fill began and ended.
    pub start_seq: u64,
    pub end_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStats {
    pub prepares: usize,
    pub strand_computes: usize,
    /// Bytes held by live tables.
    pub live_bytes: usize,
    /// Highest `live_bytes` ever observed.
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
struct Meter {
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Bytes a table holds; released when the table is dropped.
#[derive(Debug)]
struct Charge {
    meter: Arc<Meter>,
    bytes: usize,
}

impl Charge {
    fn new(meter: &Arc<Meter>, bytes: usize) -> Self {
        let live = meter.live.fetch_add(bytes, Ordering::AcqRel) + bytes;
        meter.peak.fetch_max(live, Ordering::AcqRel);
        Self {
            meter: meter.clone(),
            bytes,
        }
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.meter.live.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticModel {
    pub ensemble: Ensemble,
    pub precision: Precision,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct SyntheticStrand {
    pub length: usize,
    _charge: Charge,
}

#[derive(Debug)]
pub struct SyntheticBlock {
    pub complex: Complex,
    /// Diagonals filled so far.
    pub diagonals: usize,
    pub precision: Precision,
    /// Energy shift contributed by an action, if any.
    pub bias: f64,
    _charge: Charge,
}

pub struct SyntheticKernel {
    block_bytes: Box<BlockBytes>,
    strand_bytes: Box<StrandBytes>,
    failures: HashMap<Complex, String>,
    overflows: HashSet<Complex>,
    nan_roots: HashSet<Complex>,
    fill_delay: Option<Duration>,
    meter: Arc<Meter>,
    prepares: AtomicUsize,
    strand_computes: AtomicUsize,
    sequence: AtomicU64,
    fills: Mutex<Vec<FillRecord>>,
}

impl Default for SyntheticKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticKernel {
    /// Tables cost eight bytes per cell by default.
    pub fn new() -> Self {
        Self {
            block_bytes: Box::new(|_, complex| {
                let n = complex.nucleotides();
                8 * n * n
            }),
            strand_bytes: Box::new(|_, strand| 8 * strand.len()),
            failures: HashMap::new(),
            overflows: HashSet::new(),
            nan_roots: HashSet::new(),
            fill_delay: None,
            meter: Arc::new(Meter::default()),
            prepares: AtomicUsize::new(0),
            strand_computes: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            fills: Mutex::new(Vec::new()),
        }
    }

    pub fn with_block_bytes<F>(mut self, bytes: F) -> Self
    where
        F: Fn(Ensemble, &Complex) -> usize + Send + Sync + 'static,
    {
        self.block_bytes = Box::new(bytes);
        self
    }

    pub fn with_strand_bytes<F>(mut self, bytes: F) -> Self
    where
        F: Fn(Ensemble, &Strand) -> usize + Send + Sync + 'static,
    {
        self.strand_bytes = Box::new(bytes);
        self
    }

    /// Filling `complex` fails with `message`.
    pub fn fail_on(mut self, complex: Complex, message: impl Into<String>) -> Self {
        self.failures.insert(complex, message.into());
        self
    }

    /// Primary-precision fills of `complex` stop halfway.
    pub fn overflow_on(mut self, complex: Complex) -> Self {
        self.overflows.insert(complex);
        self
    }

    /// The root value of `complex` is NaN.
    pub fn nan_on(mut self, complex: Complex) -> Self {
        self.nan_roots.insert(complex);
        self
    }

    /// Every fill sleeps this long before returning.
    pub fn with_fill_delay(mut self, delay: Duration) -> Self {
        self.fill_delay = Some(delay);
        self
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            prepares: self.prepares.load(Ordering::Acquire),
            strand_computes: self.strand_computes.load(Ordering::Acquire),
            live_bytes: self.meter.live.load(Ordering::Acquire),
            peak_bytes: self.meter.peak.load(Ordering::Acquire),
        }
    }

    /// Every fill so far, in completion order.
    pub fn fills(&self) -> Vec<FillRecord> {
        self.fills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fills_of(&self, ensemble: Ensemble, complex: &Complex) -> Vec<FillRecord> {
        self.fills()
            .into_iter()
            .filter(|r| r.ensemble == ensemble && &r.complex == complex)
            .collect()
    }

    fn tick(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    fn energy(ensemble: Ensemble, nucleotides: usize) -> f64 {
        let n = nucleotides as f64;
        match ensemble {
            Ensemble::PartitionFunction => LOGQ_PER_NUCLEOTIDE * n,
            Ensemble::MinimumFreeEnergy => MFE_PER_NUCLEOTIDE * n,
        }
    }

    fn check_filled(complex: &Complex, block: &SyntheticBlock, full: bool) -> Result<(), KernelError> {
        let required = required_extent(complex, full);
        if block.diagonals < required {
            return Err(KernelError::new(format!(
                "block '{complex}' read at {} of {required} diagonals",
                block.diagonals
            )));
        }
        Ok(())
    }
}

impl Kernel for SyntheticKernel {
    type Strand = SyntheticStrand;
    type Block = SyntheticBlock;
    type Prepared = SyntheticModel;

    fn strand_memory(&self, ensemble: Ensemble, strand: &Strand) -> usize {
        (self.strand_bytes)(ensemble, strand)
    }

    fn block_memory(&self, ensemble: Ensemble, complex: &Complex) -> usize {
        (self.block_bytes)(ensemble, complex)
    }

    fn prepare(
        &self,
        ensemble: Ensemble,
        precision: Precision,
        capacity: usize,
    ) -> Result<SyntheticModel, KernelError> {
        self.prepares.fetch_add(1, Ordering::AcqRel);
        Ok(SyntheticModel {
            ensemble,
            precision,
            capacity,
        })
    }

    fn compute_strand(
        &self,
        ensemble: Ensemble,
        strand: &Strand,
        _model: &SyntheticModel,
    ) -> Result<SyntheticStrand, KernelError> {
        self.strand_computes.fetch_add(1, Ordering::AcqRel);
        Ok(SyntheticStrand {
            length: strand.len(),
            _charge: Charge::new(&self.meter, self.strand_memory(ensemble, strand)),
        })
    }

    fn new_block(&self, ensemble: Ensemble, complex: &Complex) -> SyntheticBlock {
        SyntheticBlock {
            complex: complex.clone(),
            diagonals: 0,
            precision: Precision::Primary,
            bias: 0.0,
            _charge: Charge::new(&self.meter, self.block_memory(ensemble, complex)),
        }
    }

    fn fill_block(&self, fill: BlockFill<'_, Self>) -> Result<usize, KernelError> {
        let start_seq = self.tick();
        if let Some(delay) = self.fill_delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = self.failures.get(fill.complex) {
            return Err(KernelError::new(message.clone()));
        }
        if fill.table.precision != fill.precision {
            return Err(KernelError::new(format!(
                "table of '{}' is {:?}, fill asked for {:?}",
                fill.complex, fill.table.precision, fill.precision
            )));
        }
        for dependency in fill.dependencies {
            Self::check_filled(&dependency.complex, dependency, true)?;
        }
        if fill.strands.len() != fill.complex.len() {
            return Err(KernelError::new(format!(
                "'{}' filled with {} strand tables",
                fill.complex,
                fill.strands.len()
            )));
        }
        if fill.should_stop() {
            return Ok(fill.start);
        }

        let reached = if fill.precision == Precision::Primary && self.overflows.contains(fill.complex)
        {
            fill.start + (fill.end - fill.start) / 2
        } else {
            fill.end
        };
        fill.table.diagonals = reached;
        fill.table.bias = fill
            .action
            .map(|action| {
                let n = fill.complex.nucleotides();
                action.evaluate(fill.complex.strands(), 0, n.saturating_sub(1)).0
            })
            .unwrap_or(0.0);

        let end_seq = self.tick();
        self.fills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FillRecord {
                ensemble: fill.ensemble,
                complex: fill.complex.clone(),
                start: fill.start,
                end: fill.end,
                reached,
                precision: fill.precision,
                start_seq,
                end_seq,
            });
        Ok(reached)
    }

    fn widen_block(&self, block: &mut SyntheticBlock) {
        block.precision = Precision::Wide;
    }

    fn root_value(
        &self,
        ensemble: Ensemble,
        complex: &Complex,
        block: &SyntheticBlock,
        _model: &SyntheticModel,
    ) -> Result<RootValue, KernelError> {
        if self.nan_roots.contains(complex) {
            return Ok(RootValue {
                value: f64::NAN,
                raw: f64::NAN,
            });
        }
        Self::check_filled(complex, block, true)?;
        let raw = Self::energy(ensemble, complex.nucleotides()) + block.bias;
        Ok(RootValue { value: raw, raw })
    }

    /// Every pair of the window gets the same weight, twenty log units (or
    /// five kcal/mol) less favorable than the window itself.
    fn pair_block(
        &self,
        ensemble: Ensemble,
        complex: &Complex,
        block: &SyntheticBlock,
    ) -> Result<DMatrix<f64>, KernelError> {
        Self::check_filled(complex, block, false)?;
        let base = Self::energy(ensemble, complex.nucleotides());
        let value = match ensemble {
            Ensemble::PartitionFunction => base - 20.0,
            Ensemble::MinimumFreeEnergy => base + 5.0,
        };
        Ok(DMatrix::from_element(
            complex.first().len(),
            complex.last().len(),
            value,
        ))
    }

    /// Each sample holds at most one hairpin pair, drawn from `params.seed`.
    fn sample(
        &self,
        context: &BacktrackContext<'_, Self>,
        params: &SampleParams,
    ) -> Result<Vec<PairList>, KernelError> {
        let size = context.blocks.size();
        Self::check_filled(context.complex, context.blocks.get(0, size - 1), true)?;
        let n = context.complex.nucleotides();
        let mut rng = StdRng::seed_from_u64(params.seed);
        Ok((0..params.number)
            .map(|_| {
                if n <= MIN_HAIRPIN || rng.gen_bool(0.5) {
                    return PairList::unpaired(n);
                }
                let i = rng.gen_range(0..n - MIN_HAIRPIN);
                let j = rng.gen_range(i + MIN_HAIRPIN..n);
                PairList::from_pairs(n, &[(i, j)])
            })
            .collect())
    }

    /// Only the open chain lies within any gap.
    fn subopt(
        &self,
        context: &BacktrackContext<'_, Self>,
        _gap: f64,
        max_number: usize,
    ) -> Result<Vec<StructureEnergy>, KernelError> {
        let size = context.blocks.size();
        let root = context.blocks.get(0, size - 1);
        let energy =
            self.root_value(context.ensemble, context.complex, root, context.model)?.value;
        Ok(std::iter::once(StructureEnergy {
            structure: PairList::unpaired(context.complex.nucleotides()),
            energy,
            stack_energy: energy,
        })
        .take(max_number)
        .collect())
    }
}
