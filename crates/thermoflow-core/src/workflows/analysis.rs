use crate::core::kernel::Kernel;
use crate::core::models::complex::Complex;
use crate::core::models::job::{Job, SampleParams, SuboptParams};
use crate::core::models::result::{ComplexResult, PairList, StructureEnergy};
use crate::engine::config::ComputeOptions;
use crate::engine::error::EngineError;
use crate::engine::runtime::Engine;
use nalgebra::DMatrix;
use tracing::instrument;

fn run<K: Kernel>(
    engine: &Engine<K>,
    job: Job,
    options: &ComputeOptions,
) -> Result<ComplexResult, EngineError> {
    engine.compute(&job, options)
}

fn missing(slot: &str, complex: &Complex) -> EngineError {
    EngineError::Consistency(format!("{slot} result missing for '{complex}'"))
}

/// Natural log of the partition function of `complex`.
#[instrument(skip_all, fields(complex = %complex))]
pub fn log_partition_function<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    options: &ComputeOptions,
) -> Result<f64, EngineError> {
    run(engine, Job::pfunc(complex.clone()), options)?
        .pfunc
        .map(|pf| pf.logq)
        .ok_or_else(|| missing("pfunc", complex))
}

#[instrument(skip_all, fields(complex = %complex))]
pub fn min_free_energy<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    options: &ComputeOptions,
) -> Result<f64, EngineError> {
    run(engine, Job::mfe(complex.clone()), options)?
        .mfe
        .map(|mfe| mfe.energy)
        .ok_or_else(|| missing("mfe", complex))
}

/// Dense pair probability matrix; the diagonal holds unpaired probabilities.
#[instrument(skip_all, fields(complex = %complex))]
pub fn pair_probability<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    options: &ComputeOptions,
) -> Result<DMatrix<f64>, EngineError> {
    run(engine, Job::pairs(complex.clone()), options)?
        .pairs
        .and_then(|pairs| pairs.matrix)
        .ok_or_else(|| missing("pairs", complex))
}

#[instrument(skip_all, fields(complex = %complex))]
pub fn mfe_cost<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    options: &ComputeOptions,
) -> Result<DMatrix<f64>, EngineError> {
    run(engine, Job::costs(complex.clone()), options)?
        .costs
        .map(|costs| costs.matrix)
        .ok_or_else(|| missing("costs", complex))
}

/// Draws `number` structures from the Boltzmann ensemble. A fresh seed is
/// used unless one is given.
#[instrument(skip_all, fields(complex = %complex, number))]
pub fn sample<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    number: usize,
    seed: Option<u64>,
    options: &ComputeOptions,
) -> Result<Vec<PairList>, EngineError> {
    let params = match seed {
        Some(seed) => SampleParams::with_seed(number, seed),
        None => SampleParams::new(number),
    };
    run(engine, Job::sample(complex.clone(), params), options)?
        .sample
        .map(|sample| sample.structures)
        .ok_or_else(|| missing("sample", complex))
}

/// Structures within `gap` kcal/mol of the minimum free energy.
#[instrument(skip_all, fields(complex = %complex, gap))]
pub fn subopt<K: Kernel>(
    engine: &Engine<K>,
    complex: &Complex,
    gap: f64,
    options: &ComputeOptions,
) -> Result<Vec<StructureEnergy>, EngineError> {
    run(engine, Job::subopt(complex.clone(), SuboptParams::new(gap)), options)?
        .subopt
        .map(|subopt| subopt.structures)
        .ok_or_else(|| missing("subopt", complex))
}
