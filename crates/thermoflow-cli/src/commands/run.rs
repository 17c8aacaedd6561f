use crate::cli::RunArgs;
use crate::config::build_batch;
use crate::error::Result;
use crate::utils::progress::CliProgressHandler;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use thermoflow::core::models::result::{ComplexResult, ResultMap};
use thermoflow::engine::progress::ProgressReporter;
use thermoflow::engine::runtime::Engine;
use thermoflow::kernels::synthetic::SyntheticKernel;
use tracing::{debug, info};

/// One line of the per-complex summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub complex: String,
    pub strands: usize,
    pub nucleotides: usize,
    pub logq: Option<f64>,
    pub mfe: Option<f64>,
    pub expected_unpaired: Option<f64>,
    pub min_cost: Option<f64>,
    pub samples: Option<usize>,
    pub suboptimal: Option<usize>,
}

pub async fn run(args: RunArgs, show_progress: bool) -> Result<()> {
    let batch = build_batch(&args)?;
    info!(
        "Loaded {} job(s) from {:?} (max-bytes: {:?}, threads: {:?}, cache-complexes: {}).",
        batch.jobs.len(),
        &args.batch,
        batch.max_bytes,
        batch.threads,
        batch.cache_complexes
    );

    let progress = if show_progress {
        CliProgressHandler::new()
    } else {
        CliProgressHandler::hidden()
    };
    let options = batch.compute_options(ProgressReporter::with_callback(progress.callback()))?;
    let engine = Engine::new(SyntheticKernel::new());

    let mut results = ResultMap::new();
    for round in 1..=args.repeat {
        let started = Instant::now();
        let fills_before = engine.kernel().fills().len();

        let mut future = engine.submit(&batch.jobs, &options)?;
        results = tokio::task::spawn_blocking(move || future.get())
            .await
            .map_err(|e| anyhow::anyhow!("Batch wait task failed: {e}"))??;
        progress.clear();

        let fills = engine.kernel().fills().len() - fills_before;
        debug!(round, fills, "Batch round finished.");
        println!(
            "Round {round}: {} complex(es) in {:.2?}, {fills} block fill(s); cache holds {} entries, {} bytes.",
            results.len(),
            started.elapsed(),
            engine.cache().len(),
            engine.cache().used(),
        );
    }

    let rows = summarize(&results);
    print_summary(&rows);

    let stats = engine.kernel().stats();
    println!(
        "Kernel: {} strand table(s), {} model preparation(s), peak table memory {} bytes.",
        stats.strand_computes, stats.prepares, stats.peak_bytes
    );

    if let Some(path) = &args.output {
        write_csv(path, &rows)?;
        println!("✓ Summary written to: {}", path.display());
    }
    Ok(())
}

pub fn summarize(results: &ResultMap) -> Vec<SummaryRow> {
    results
        .iter()
        .map(|(complex, result)| summary_row(complex.to_string(), complex.len(), complex.nucleotides(), result))
        .collect()
}

fn summary_row(complex: String, strands: usize, nucleotides: usize, result: &ComplexResult) -> SummaryRow {
    SummaryRow {
        complex,
        strands,
        nucleotides,
        logq: result.pfunc.map(|pf| pf.logq),
        mfe: result.mfe.map(|mfe| mfe.energy),
        expected_unpaired: result.pairs.as_ref().map(|pairs| pairs.diagonal.sum()),
        min_cost: result
            .costs
            .as_ref()
            .map(|costs| costs.matrix.iter().copied().fold(f64::INFINITY, f64::min)),
        samples: result.sample.as_ref().map(|s| s.structures.len()),
        suboptimal: result.subopt.as_ref().map(|s| s.structures.len()),
    }
}

fn print_summary(rows: &[SummaryRow]) {
    fn cell<T: std::fmt::Display>(value: Option<T>) -> String {
        value.map_or_else(|| "-".to_string(), |v| v.to_string())
    }

    println!(
        "{:<32} {:>12} {:>12} {:>12} {:>10} {:>8} {:>8}",
        "complex", "logq", "mfe", "unpaired", "min-cost", "samples", "subopt"
    );
    for row in rows {
        println!(
            "{:<32} {:>12} {:>12} {:>12} {:>10} {:>8} {:>8}",
            row.complex,
            cell(row.logq.map(|v| format!("{v:.4}"))),
            cell(row.mfe.map(|v| format!("{v:.4}"))),
            cell(row.expected_unpaired.map(|v| format!("{v:.3}"))),
            cell(row.min_cost.map(|v| format!("{v:.3}"))),
            cell(row.samples),
            cell(row.suboptimal),
        );
    }
}

pub fn write_csv(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
