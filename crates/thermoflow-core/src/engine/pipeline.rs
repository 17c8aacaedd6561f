//! Expansion of jobs into roots, and the finalizers that turn filled tables
//! into results.
//!
//! Every job first requests the energy of its complex. Richer kinds add a
//! second stage that reuses the same tables:
//!
//! | job kind              | ensemble | second stage                         |
//! |-----------------------|----------|--------------------------------------|
//! | partition function    | pfunc    | none                                 |
//! | minimum free energy   | mfe      | none                                 |
//! | structure sample      | pfunc    | backtrack over every sub-complex     |
//! | suboptimal structures | mfe      | backtrack over every sub-complex     |
//! | pair probabilities    | pfunc    | one window per rotation and span     |
//! | pair costs            | mfe      | one window per rotation and span     |

use super::decompose::Root;
use super::error::EngineError;
use super::fill::{Dependencies, PassEnv, block_table, strand_tables};
use crate::core::kernel::{BacktrackContext, BlockTriangle, Kernel, Precision, required_extent};
use crate::core::models::complex::Complex;
use crate::core::models::job::{Ensemble, Job, JobKind, SampleParams, Sparsity, SuboptParams};
use crate::core::models::result::{
    CostsResult, MfeResult, PfResult, SampleResult, SuboptResult, Update,
};
use crate::core::pairs::{self, SliceTarget};
use nalgebra::DMatrix;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PairOutput {
    Probabilities(Sparsity),
    Costs,
}

/// Nucleotide matrix shared by the windows of one pair job. The window that
/// finishes last emits the result.
pub(crate) struct PairAccumulator {
    output: PairOutput,
    matrix: Mutex<DMatrix<f64>>,
    normalizer: Mutex<Option<f64>>,
    remaining: AtomicUsize,
}

impl PairAccumulator {
    fn new(output: PairOutput, complex: &Complex) -> Self {
        let n = complex.nucleotides();
        Self {
            output,
            matrix: Mutex::new(DMatrix::zeros(n, n)),
            normalizer: Mutex::new(None),
            remaining: AtomicUsize::new(pairs::window_count(complex.len())),
        }
    }
}

/// What a root does with its tables once they are filled.
pub(crate) enum Finalizer {
    Energy,
    Sample(SampleParams),
    Subopt(SuboptParams),
    PairWindow {
        accumulator: Arc<PairAccumulator>,
        target: SliceTarget,
        /// This window is the whole complex in its original rotation.
        reads_normalizer: bool,
    },
}

impl Finalizer {
    pub fn name(&self) -> &'static str {
        match self {
            Finalizer::Energy => "energy",
            Finalizer::Sample(_) => "sample",
            Finalizer::Subopt(_) => "subopt",
            Finalizer::PairWindow { .. } => "pair-window",
        }
    }
}

/// One root and the finalizer to run on it, attributed to a job's complex.
pub(crate) struct Request {
    pub complex: Complex,
    pub root: Root,
    pub finalizer: Finalizer,
}

/// Appends the roots of `job` to `out`.
pub(crate) fn expand(job: &Job, out: &mut Vec<Request>) {
    let complex = &job.complex;
    out.push(Request {
        complex: complex.clone(),
        root: Root::single(complex.clone(), true),
        finalizer: Finalizer::Energy,
    });
    match &job.kind {
        JobKind::PartitionFunction | JobKind::MinimumFreeEnergy => {}
        JobKind::StructureSample(params) => {
            out.push(backtrack_request(complex, Finalizer::Sample(*params)));
        }
        JobKind::SuboptimalStructures(params) => {
            out.push(backtrack_request(complex, Finalizer::Subopt(*params)));
        }
        JobKind::PairProbabilities(sparsity) => {
            expand_pairs(complex, PairOutput::Probabilities(*sparsity), out);
        }
        JobKind::PairCosts => expand_pairs(complex, PairOutput::Costs, out),
    }
}

fn backtrack_request(complex: &Complex, finalizer: Finalizer) -> Request {
    let n = complex.len();
    let mut root = Root {
        blocks: Vec::with_capacity(n * (n + 1) / 2),
        strands: complex.strands().to_vec(),
    };
    for j in 0..n {
        for i in 0..=j {
            root.blocks.push((complex.slice(i..j + 1), true));
        }
    }
    Request {
        complex: complex.clone(),
        root,
        finalizer,
    }
}

fn expand_pairs(complex: &Complex, output: PairOutput, out: &mut Vec<Request>) {
    let n = complex.len();
    let accumulator = Arc::new(PairAccumulator::new(output, complex));
    let dup = complex.duplicated();
    let offsets = complex.strand_offsets();
    for i in 0..n {
        for j in i..=i + n {
            let wraps = j == i + n;
            out.push(Request {
                complex: complex.clone(),
                root: Root::single(dup.slice(i..j + 1), !wraps),
                finalizer: Finalizer::PairWindow {
                    accumulator: accumulator.clone(),
                    target: SliceTarget {
                        row_offset: offsets[i],
                        col_offset: offsets[j % n],
                        single_strand: i == j,
                        wraps,
                    },
                    reads_normalizer: i == 0 && j == n - 1,
                },
            });
        }
    }
}

/// Runs `finalizer` over the filled tables of `root`.
///
/// Returns `None` when the finalizer contributes to a result that another
/// work item emits.
pub(crate) fn finalize<K: Kernel>(
    env: &PassEnv<K>,
    complex: &Complex,
    root: &Root,
    finalizer: &Finalizer,
    deps: &Dependencies<K>,
) -> Result<Option<Update>, EngineError> {
    let guards = deps.lock_blocks();
    let tables = deps
        .blocks
        .iter()
        .zip(&root.blocks)
        .enumerate()
        .map(|(position, (data, (key, full)))| {
            block_table(guards.get(position), data, required_extent(key, *full))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let kernel = env.kernel.as_ref();
    let model = env.model.get(kernel, Precision::Primary)?;
    let block_key = |k: usize| &root.blocks[k].0;

    match finalizer {
        Finalizer::Energy => {
            let value = kernel
                .root_value(env.ensemble, complex, tables[0], &model)
                .map_err(|e| EngineError::kernel(complex, e))?;
            if value.value.is_nan() || value.raw.is_nan() {
                return Err(EngineError::numeric(complex, "root value is NaN"));
            }
            Ok(Some(match env.ensemble {
                Ensemble::PartitionFunction => {
                    if value.value == f64::INFINITY {
                        return Err(EngineError::numeric(
                            complex,
                            "log partition function overflowed to +inf",
                        ));
                    }
                    Update::Pf(PfResult {
                        logq: value.value,
                        raw_logq: value.raw,
                    })
                }
                Ensemble::MinimumFreeEnergy => Update::Mfe(MfeResult {
                    energy: value.value,
                    raw_energy: value.raw,
                }),
            }))
        }
        Finalizer::Sample(params) => {
            let strand_guards = deps.lock_strands();
            let strands = strand_tables(&strand_guards, &deps.strands)?;
            let context = BacktrackContext {
                ensemble: env.ensemble,
                complex,
                model: &*model,
                action: deps.blocks[0].action.as_ref(),
                blocks: BlockTriangle::new(complex.len(), tables),
                strands: &strands,
            };
            let structures = kernel
                .sample(&context, params)
                .map_err(|e| EngineError::kernel(complex, e))?;
            Ok(Some(Update::Sample(SampleResult { structures })))
        }
        Finalizer::Subopt(params) => {
            if params.gap < 0.0 {
                return Ok(Some(Update::Subopt(SuboptResult::default())));
            }
            let strand_guards = deps.lock_strands();
            let strands = strand_tables(&strand_guards, &deps.strands)?;
            let context = BacktrackContext {
                ensemble: env.ensemble,
                complex,
                model: &*model,
                action: deps.blocks[0].action.as_ref(),
                blocks: BlockTriangle::new(complex.len(), tables),
                strands: &strands,
            };
            let structures = kernel
                .subopt(&context, params.effective_gap(), params.max_number)
                .map_err(|e| EngineError::kernel(complex, e))?;
            Ok(Some(Update::Subopt(SuboptResult { structures })))
        }
        Finalizer::PairWindow {
            accumulator,
            target,
            reads_normalizer,
        } => {
            let window = block_key(0);
            let values = kernel
                .pair_block(env.ensemble, window, tables[0])
                .map_err(|e| EngineError::kernel(window, e))?;
            pairs::write_slice(
                &mut accumulator
                    .matrix
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
                &values,
                *target,
            );
            if *reads_normalizer {
                let value = kernel
                    .root_value(env.ensemble, window, tables[0], &model)
                    .map_err(|e| EngineError::kernel(window, e))?;
                *accumulator
                    .normalizer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(value.raw);
            }
            drop(guards);
            if accumulator.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return Ok(None);
            }
            finish_pairs(complex, accumulator).map(Some)
        }
    }
}

fn finish_pairs(complex: &Complex, accumulator: &PairAccumulator) -> Result<Update, EngineError> {
    let matrix = std::mem::replace(
        &mut *accumulator
            .matrix
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
        DMatrix::zeros(0, 0),
    );
    let normalizer = accumulator
        .normalizer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .ok_or_else(|| {
            EngineError::Consistency(format!(
                "pair matrix of '{complex}' finished without its root window"
            ))
        })?;
    debug!(%complex, normalizer, "Finalizing pair matrix.");
    Ok(match accumulator.output {
        PairOutput::Probabilities(sparsity) => Update::Pairs(pairs::sparsify(
            pairs::finalize_probabilities(matrix, normalizer),
            &sparsity,
        )),
        PairOutput::Costs => Update::Costs(CostsResult {
            matrix: pairs::finalize_costs(matrix, normalizer),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complex(seqs: &[&str]) -> Complex {
        Complex::from_sequences(seqs).unwrap()
    }

    fn expanded(job: Job) -> Vec<Request> {
        let mut out = Vec::new();
        expand(&job, &mut out);
        out
    }

    #[test]
    fn energy_jobs_request_the_full_complex() {
        let x = complex(&["AC", "GU"]);
        let requests = expanded(Job::pfunc(x.clone()));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].root, Root::single(x, true));
        assert_eq!(requests[0].finalizer.name(), "energy");
    }

    #[test]
    fn backtrack_requests_every_contiguous_sub_complex() {
        let x = complex(&["A", "C", "G"]);
        let requests = expanded(Job::sample(x.clone(), SampleParams::with_seed(4, 7)));
        assert_eq!(requests.len(), 2);
        let root = &requests[1].root;
        assert_eq!(root.blocks.len(), 6);
        assert_eq!(root.blocks[0], (complex(&["A"]), true));
        assert_eq!(root.blocks[1], (complex(&["A", "C"]), true));
        assert_eq!(root.blocks[5], (complex(&["G"]), true));
        assert_eq!(root.strands, x.strands().to_vec());
    }

    #[test]
    fn pair_jobs_request_one_window_per_rotation_and_span() {
        let x = complex(&["AA", "CCC"]);
        let requests = expanded(Job::pairs(x));
        let windows: Vec<_> = requests[1..].iter().map(|r| r.root.blocks[0].clone()).collect();
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[0], (complex(&["AA"]), true));
        assert_eq!(windows[1], (complex(&["AA", "CCC"]), true));
        assert_eq!(windows[2], (complex(&["AA", "CCC", "AA"]), false));
        assert_eq!(windows[3], (complex(&["CCC"]), true));
        assert_eq!(windows[5], (complex(&["CCC", "AA", "CCC"]), false));

        let Finalizer::PairWindow {
            target,
            reads_normalizer,
            ..
        } = &requests[5].finalizer
        else {
            panic!("expected a pair window");
        };
        assert_eq!(target.row_offset, 2);
        assert_eq!(target.col_offset, 0);
        assert!(!reads_normalizer);
        assert!(matches!(
            requests[2].finalizer,
            Finalizer::PairWindow {
                reads_normalizer: true,
                ..
            }
        ));
    }
}
