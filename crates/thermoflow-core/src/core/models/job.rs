use super::complex::Complex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest subopt gap used when backtracking, so a zero gap still returns
/// the degenerate minimum structures.
pub const MIN_SUBOPT_GAP: f64 = 1e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("Sample count must be positive")]
    ZeroSamples,
    #[error("Suboptimal gap must be a number, got {0}")]
    InvalidGap(f64),
    #[error("Suboptimal structure limit must be positive")]
    ZeroSuboptLimit,
    #[error("Pair sparsity threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f64),
}

/// The two dynamic-programming strategies the engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ensemble {
    PartitionFunction,
    MinimumFreeEnergy,
}

impl Ensemble {
    pub const ALL: [Ensemble; 2] = [Ensemble::PartitionFunction, Ensemble::MinimumFreeEnergy];

    pub fn index(self) -> usize {
        match self {
            Ensemble::PartitionFunction => 0,
            Ensemble::MinimumFreeEnergy => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Ensemble::PartitionFunction => "pfunc",
            Ensemble::MinimumFreeEnergy => "mfe",
        }
    }
}

/// Which part of a pair-probability matrix to keep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Sparsity {
    /// Keep only the unpaired probabilities on the diagonal.
    #[serde(default)]
    pub diagonal_only: bool,
    /// Off-diagonal probabilities below this are stored as zero.
    #[serde(default)]
    pub threshold: f64,
}

impl Default for Sparsity {
    fn default() -> Self {
        Self {
            diagonal_only: false,
            threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleParams {
    pub number: usize,
    pub seed: u64,
}

impl SampleParams {
    /// Requests `number` samples with a freshly drawn seed.
    pub fn new(number: usize) -> Self {
        Self {
            number,
            seed: rand::random(),
        }
    }

    pub fn with_seed(number: usize, seed: u64) -> Self {
        Self { number, seed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuboptParams {
    /// Energy gap above the minimum free energy, in kcal/mol.
    pub gap: f64,
    pub max_number: usize,
}

impl Default for SuboptParams {
    fn default() -> Self {
        Self {
            gap: 0.0,
            max_number: 100_000,
        }
    }
}

impl SuboptParams {
    pub fn new(gap: f64) -> Self {
        Self {
            gap,
            ..Self::default()
        }
    }

    /// Gap actually used for backtracking.
    pub fn effective_gap(&self) -> f64 {
        self.gap.max(MIN_SUBOPT_GAP)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    PartitionFunction,
    MinimumFreeEnergy,
    PairProbabilities(Sparsity),
    PairCosts,
    StructureSample(SampleParams),
    SuboptimalStructures(SuboptParams),
}

impl JobKind {
    /// The strategy whose tables this kind of job reads.
    pub fn ensemble(&self) -> Ensemble {
        match self {
            JobKind::PartitionFunction
            | JobKind::PairProbabilities(_)
            | JobKind::StructureSample(_) => Ensemble::PartitionFunction,
            JobKind::MinimumFreeEnergy
            | JobKind::PairCosts
            | JobKind::SuboptimalStructures(_) => Ensemble::MinimumFreeEnergy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::PartitionFunction => "pfunc",
            JobKind::MinimumFreeEnergy => "mfe",
            JobKind::PairProbabilities(_) => "pairs",
            JobKind::PairCosts => "costs",
            JobKind::StructureSample(_) => "sample",
            JobKind::SuboptimalStructures(_) => "subopt",
        }
    }
}

/// One analysis request over one complex.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub complex: Complex,
    pub kind: JobKind,
}

impl Job {
    pub fn new(complex: Complex, kind: JobKind) -> Self {
        Self { complex, kind }
    }

    pub fn pfunc(complex: Complex) -> Self {
        Self::new(complex, JobKind::PartitionFunction)
    }

    pub fn mfe(complex: Complex) -> Self {
        Self::new(complex, JobKind::MinimumFreeEnergy)
    }

    pub fn pairs(complex: Complex) -> Self {
        Self::new(complex, JobKind::PairProbabilities(Sparsity::default()))
    }

    pub fn costs(complex: Complex) -> Self {
        Self::new(complex, JobKind::PairCosts)
    }

    pub fn sample(complex: Complex, params: SampleParams) -> Self {
        Self::new(complex, JobKind::StructureSample(params))
    }

    pub fn subopt(complex: Complex, params: SuboptParams) -> Self {
        Self::new(complex, JobKind::SuboptimalStructures(params))
    }

    pub fn ensemble(&self) -> Ensemble {
        self.kind.ensemble()
    }

    /// Checks the kind-specific parameters. A negative gap is allowed and
    /// yields no structures.
    pub fn validate(&self) -> Result<(), JobError> {
        match &self.kind {
            JobKind::StructureSample(params) if params.number == 0 => Err(JobError::ZeroSamples),
            JobKind::SuboptimalStructures(params) if params.gap.is_nan() => {
                Err(JobError::InvalidGap(params.gap))
            }
            JobKind::SuboptimalStructures(params) if params.max_number == 0 => {
                Err(JobError::ZeroSuboptLimit)
            }
            JobKind::PairProbabilities(sparsity)
                if !sparsity.threshold.is_finite() || sparsity.threshold < 0.0 =>
            {
                Err(JobError::InvalidThreshold(sparsity.threshold))
            }
            _ => Ok(()),
        }
    }
}
