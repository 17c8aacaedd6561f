use super::file::{BatchFile, FileJob, FileOptions};
use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use thermoflow::core::models::complex::Complex;
use thermoflow::core::models::job::{Job, JobKind, SampleParams, Sparsity, SuboptParams};
use thermoflow::engine::config::ComputeOptions;
use thermoflow::engine::progress::ProgressReporter;

/// A batch ready for submission: the parsed jobs plus the options merged
/// from the file and the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub jobs: Vec<Job>,
    pub max_bytes: Option<usize>,
    pub threads: Option<usize>,
    pub cache_complexes: bool,
}

impl Batch {
    pub fn compute_options(&self, reporter: ProgressReporter) -> Result<ComputeOptions> {
        let mut builder = ComputeOptions::builder()
            .cache_complexes(self.cache_complexes)
            .reporter(reporter);
        if let Some(bytes) = self.max_bytes {
            builder = builder.max_bytes(bytes);
        }
        if let Some(threads) = self.threads {
            builder = builder.threads(threads);
        }
        Ok(builder.build()?)
    }
}

pub fn build_batch(args: &RunArgs) -> Result<Batch> {
    let file = BatchFile::from_file(&args.batch)?;
    merge(file, args)
}

fn merge(file: BatchFile, args: &RunArgs) -> Result<Batch> {
    let FileOptions {
        max_bytes,
        threads,
        cache_complexes,
    } = file.options;

    if file.jobs.is_empty() {
        return Err(CliError::Config(format!(
            "batch file '{}' lists no jobs",
            args.batch.display()
        )));
    }
    let jobs = file
        .jobs
        .into_iter()
        .enumerate()
        .map(|(index, job)| convert_job(job).map_err(|e| CliError::Config(format!("job {}: {e}", index + 1))))
        .collect::<Result<Vec<_>>>()?;

    Ok(Batch {
        jobs,
        max_bytes: args.max_bytes.or(max_bytes),
        threads: args.threads.or(threads),
        cache_complexes: !args.no_cache_complexes && cache_complexes.unwrap_or(true),
    })
}

fn convert_job(job: FileJob) -> Result<Job> {
    let complex = Complex::from_sequences(job.strands())
        .map_err(|e| CliError::Config(e.to_string()))?;
    let kind = match job {
        FileJob::Pfunc { .. } => JobKind::PartitionFunction,
        FileJob::Mfe { .. } => JobKind::MinimumFreeEnergy,
        FileJob::Pairs {
            diagonal_only,
            threshold,
            ..
        } => JobKind::PairProbabilities(Sparsity {
            diagonal_only,
            threshold,
        }),
        FileJob::Costs { .. } => JobKind::PairCosts,
        FileJob::Sample { number, seed, .. } => JobKind::StructureSample(match seed {
            Some(seed) => SampleParams::with_seed(number, seed),
            None => SampleParams::new(number),
        }),
        FileJob::Subopt {
            gap, max_number, ..
        } => {
            let mut params = SuboptParams::new(gap);
            if let Some(max_number) = max_number {
                params.max_number = max_number;
            }
            JobKind::SuboptimalStructures(params)
        }
    };
    let job = Job::new(complex, kind);
    job.validate().map_err(|e| CliError::Config(e.to_string()))?;
    Ok(job)
}
