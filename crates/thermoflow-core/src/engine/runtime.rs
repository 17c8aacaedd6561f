use super::cache::Cache;
use super::config::ComputeOptions;
use super::error::EngineError;
use super::fill::PassEnv;
use super::graph::{Completion, TaskGraph};
use super::pipeline::{self, Request};
use super::progress::Progress;
use super::schedule::{PassSettings, schedule_pass};
use super::shared_error::ErrorChannel;
use crate::core::kernel::Kernel;
use crate::core::models::complex::Complex;
use crate::core::models::job::{Ensemble, Job};
use crate::core::models::result::{ComplexResult, ResultMap, Update};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument};

/// Receives every update as soon as its finalizer completes, on a worker
/// thread.
pub trait Sink: Send + Sync {
    fn put(&self, complex: &Complex, update: Update);
}

impl<F> Sink for F
where
    F: Fn(&Complex, Update) + Send + Sync,
{
    fn put(&self, complex: &Complex, update: Update) {
        self(complex, update)
    }
}

/// Merges updates into one [`ComplexResult`] per complex.
#[derive(Debug, Default)]
pub struct ResultCollector {
    results: Mutex<ResultMap>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything collected so far.
    pub fn take(&self) -> ResultMap {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Sink for ResultCollector {
    fn put(&self, complex: &Complex, update: Update) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(complex.clone())
            .or_default()
            .augment(update);
    }
}

/// Handle to a running submission.
pub struct ComputeFuture {
    completion: Completion,
    results: Option<Arc<ResultCollector>>,
    errors: ErrorChannel,
}

impl ComputeFuture {
    pub fn is_ready(&self) -> bool {
        self.completion.is_done()
    }

    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Blocks until every work item has run and returns the results, or the
    /// first error any of them recorded.
    ///
    /// Results can be taken once; later calls fail with
    /// [`EngineError::ResultAlreadyTaken`].
    pub fn get(&mut self) -> Result<ResultMap, EngineError> {
        let results = self.results.take().ok_or(EngineError::ResultAlreadyTaken)?;
        self.completion.wait();
        self.errors.rethrow_if_set()?;
        Ok(results.take())
    }
}

/// Runs batches of jobs against one kernel and one shared cache.
pub struct Engine<K: Kernel> {
    kernel: Arc<K>,
    cache: Arc<Cache<K>>,
}

impl<K: Kernel> Clone for Engine<K> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<K: Kernel> Engine<K> {
    pub fn new(kernel: K) -> Self {
        Self::with_cache(Arc::new(kernel), Arc::new(Cache::new()))
    }

    /// An engine over an existing cache, which may be shared with other
    /// engines.
    pub fn with_cache(kernel: Arc<K>, cache: Arc<Cache<K>>) -> Self {
        Self { kernel, cache }
    }

    pub fn kernel(&self) -> &Arc<K> {
        &self.kernel
    }

    pub fn cache(&self) -> &Arc<Cache<K>> {
        &self.cache
    }

    /// Validates `jobs`, schedules them, and starts the work without waiting.
    pub fn submit(&self, jobs: &[Job], options: &ComputeOptions) -> Result<ComputeFuture, EngineError> {
        let collector = Arc::new(ResultCollector::new());
        let (completion, errors) = self.launch(jobs, options, collector.clone())?;
        Ok(ComputeFuture {
            completion,
            results: Some(collector),
            errors,
        })
    }

    pub fn computes(&self, jobs: &[Job], options: &ComputeOptions) -> Result<ResultMap, EngineError> {
        self.submit(jobs, options)?.get()
    }

    pub fn compute(&self, job: &Job, options: &ComputeOptions) -> Result<ComplexResult, EngineError> {
        let mut results = self.computes(std::slice::from_ref(job), options)?;
        results.remove(&job.complex).ok_or_else(|| {
            EngineError::Consistency(format!("no result was produced for '{}'", job.complex))
        })
    }

    /// Runs `jobs` to completion, streaming each update into `sink` instead
    /// of collecting them.
    pub fn compute_with_sink(
        &self,
        jobs: &[Job],
        options: &ComputeOptions,
        sink: Arc<dyn Sink>,
    ) -> Result<(), EngineError> {
        let (completion, errors) = self.launch(jobs, options, sink)?;
        completion.wait();
        errors.rethrow_if_set()
    }

    fn pass_env(&self, ensemble: Ensemble, errors: &ErrorChannel, sink: &Arc<dyn Sink>) -> Arc<PassEnv<K>> {
        Arc::new(PassEnv {
            kernel: self.kernel.clone(),
            ensemble,
            model: self.cache.model(ensemble),
            errors: errors.clone(),
            sink: sink.clone(),
        })
    }

    /// Builds the batch graph: one pass per ensemble, run side by side when
    /// their combined footprint fits the budget and one after the other
    /// otherwise.
    #[instrument(skip_all, name = "batch", fields(jobs = jobs.len()))]
    fn launch(
        &self,
        jobs: &[Job],
        options: &ComputeOptions,
        sink: Arc<dyn Sink>,
    ) -> Result<(Completion, ErrorChannel), EngineError> {
        options.validate()?;
        for job in jobs {
            job.validate().map_err(|source| EngineError::Job {
                complex: job.complex.to_string(),
                source,
            })?;
        }
        let executor = options.resolve_executor()?;
        let errors = options.error_channel.clone().unwrap_or_default();
        let reporter = options.reporter.clone();
        reporter.report(Progress::PhaseStart { name: "Scheduling" });

        let mut requests: [Vec<Request>; 2] = Default::default();
        for job in jobs {
            pipeline::expand(job, &mut requests[job.ensemble().index()]);
        }
        let settings = PassSettings {
            max_bytes: options.max_bytes,
            cache_complexes: options.cache_complexes,
            action: options.action.clone(),
        };

        let mut graph = TaskGraph::new();
        let [pfunc_requests, mfe_requests] = requests;
        let (horizon, first, second) = {
            let mut state = self.cache.lock();
            let horizon = state.time;
            let first = schedule_pass(
                &mut graph,
                &mut state,
                self.pass_env(Ensemble::PartitionFunction, &errors, &sink),
                pfunc_requests,
                &settings,
            )?;
            let second = schedule_pass(
                &mut graph,
                &mut state,
                self.pass_env(Ensemble::MinimumFreeEnergy, &errors, &sink),
                mfe_requests,
                &settings,
            )?;
            (horizon, first, second)
        };

        let needed = first.peak_bytes + second.peak_bytes;
        let mut serial = false;
        if let Some(max) = settings.max_bytes {
            let cache = self.cache.clone();
            let limit = max.saturating_sub(needed);
            let shrink = graph.emplace("shrink before batch", move || {
                cache.shrink_before(limit, horizon);
            });
            graph.precede(shrink, first.start);
            graph.precede(shrink, second.start);

            serial = first.peak_bytes > 0 && second.peak_bytes > 0 && needed > max;
            if serial {
                let cache = self.cache.clone();
                let limit = max.saturating_sub(second.peak_bytes);
                let entry_time = second.start_time;
                let between = graph.emplace("shrink between passes", move || {
                    cache.shrink_before(limit, entry_time);
                });
                graph.precede(first.finish, between);
                graph.precede(between, second.start);
            }
        }
        graph.check_acyclic()?;
        reporter.report(Progress::PhaseFinish);

        info!(
            jobs = jobs.len(),
            tasks = graph.len(),
            threads = executor.threads(),
            "Launching batch."
        );
        debug!(
            pfunc_peak = first.peak_bytes,
            mfe_peak = second.peak_bytes,
            serial,
            cached_bytes = self.cache.used(),
            "Batch footprint."
        );
        let completion = graph.launch(&executor, errors.clone(), reporter);
        Ok((completion, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::{Precision, required_extent};
    use crate::core::models::action::{Action, ActionKind};
    use crate::core::models::job::{JobError, JobKind, SampleParams, Sparsity, SuboptParams};
    use crate::engine::config::{ConfigError, Executor};
    use crate::kernels::synthetic::{LOGQ_PER_NUCLEOTIDE, MFE_PER_NUCLEOTIDE, SyntheticKernel};
    use std::time::Duration;

    const PF: Ensemble = Ensemble::PartitionFunction;
    const MFE: Ensemble = Ensemble::MinimumFreeEnergy;

    fn complex(seqs: &[&str]) -> Complex {
        Complex::from_sequences(seqs).unwrap()
    }

    fn options() -> ComputeOptions {
        ComputeOptions::builder().threads(4).build().unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn energies_come_from_the_root_table() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU", "GGC"]);
        let results = engine
            .computes(&[Job::pfunc(x.clone()), Job::mfe(x.clone())], &options())
            .unwrap();
        let result = &results[&x];
        assert!(close(result.pfunc.as_ref().unwrap().logq, 7.0 * LOGQ_PER_NUCLEOTIDE));
        assert!(close(result.mfe.as_ref().unwrap().energy, 7.0 * MFE_PER_NUCLEOTIDE));
    }

    #[test]
    fn repeated_batches_reuse_cached_tables() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU", "GGC", "AU"]);
        let job = Job::pfunc(x.clone());

        engine.compute(&job, &options()).unwrap();
        let fills = engine.kernel().fills().len();
        let strands = engine.kernel().stats().strand_computes;
        let touched = engine.cache().last_touched_block(PF, &x).unwrap();
        assert_eq!(fills, 6);
        assert_eq!(strands, 3);

        let again = engine.compute(&job, &options()).unwrap();
        assert!(again.pfunc.is_some());
        assert_eq!(engine.kernel().fills().len(), fills);
        assert_eq!(engine.kernel().stats().strand_computes, strands);
        assert!(engine.cache().last_touched_block(PF, &x).unwrap() > touched);
        for strand in x.strands() {
            assert!(engine.cache().contains_strand(PF, strand));
            assert!(!engine.cache().contains_strand(MFE, strand));
        }
    }

    #[test]
    fn sub_blocks_are_filled_before_their_consumers() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["AC", "GU", "CA", "UG"]);
        engine.compute(&Job::mfe(x), &options()).unwrap();

        let fills = engine.kernel().fills();
        assert_eq!(fills.len(), 10);
        for record in &fills {
            for dep in crate::engine::decompose::dependencies(&record.complex) {
                let dep_fill = fills.iter().find(|r| r.complex == dep).unwrap();
                assert!(dep_fill.end_seq < record.start_seq, "{dep} after {}", record.complex);
            }
        }
    }

    #[test]
    fn partial_blocks_are_extended_by_later_full_requests() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["AAA", "CC"]);
        let wrapped = complex(&["AAA", "CC", "AAA"]);

        let pairs = engine.compute(&Job::pairs(x), &options()).unwrap();
        assert!(pairs.pairs.is_some());
        assert_eq!(engine.cache().block_progress(PF, &wrapped), Some(3));

        engine.compute(&Job::pfunc(wrapped.clone()), &options()).unwrap();
        let fills = engine.kernel().fills_of(PF, &wrapped);
        assert_eq!(fills.len(), 2);
        assert_eq!((fills[0].start, fills[0].end), (0, 3));
        assert_eq!((fills[1].start, fills[1].end), (3, required_extent(&wrapped, true)));
    }

    #[test]
    fn pair_probabilities_are_normalized_per_nucleotide() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGUA", "UUG"]);
        let result = engine.compute(&Job::pairs(x.clone()), &options()).unwrap();
        let pairs = result.pairs.unwrap();
        let matrix = pairs.matrix.unwrap();
        assert_eq!(matrix.shape(), (8, 8));
        for k in 0..8 {
            assert!(close(matrix.column(k).sum(), 1.0));
            assert!(pairs.diagonal[k] > 0.99);
        }

        let diagonal = Job::new(
            x.clone(),
            JobKind::PairProbabilities(Sparsity {
                diagonal_only: true,
                threshold: 0.0,
            }),
        );
        let result = engine.compute(&diagonal, &options()).unwrap();
        assert!(result.pairs.unwrap().matrix.is_none());
    }

    #[test]
    fn pair_costs_are_relative_to_the_minimum_free_energy() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU", "AC"]);
        let costs = engine.compute(&Job::costs(x), &options()).unwrap().costs.unwrap();
        assert_eq!(costs.matrix.shape(), (6, 6));
        assert!(costs.matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn first_error_wins_and_is_returned_once_everything_stops() {
        let kernel = SyntheticKernel::new()
            .fail_on(complex(&["AC", "GU"]), "broken A")
            .fail_on(complex(&["CC", "GG"]), "broken B");
        let engine = Engine::new(kernel);
        let jobs = [
            Job::pfunc(complex(&["AC", "GU"])),
            Job::pfunc(complex(&["CC", "GG"])),
            Job::pfunc(complex(&["AAAA"])),
        ];
        let error = engine.computes(&jobs, &options()).unwrap_err();
        match error {
            EngineError::Kernel { complex, source } => {
                assert!(complex == "AC+GU" || complex == "CC+GG", "{complex}");
                assert!(source.message.starts_with("broken"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn shared_error_channel_skips_later_submissions() {
        let kernel = SyntheticKernel::new().fail_on(complex(&["AC"]), "broken");
        let engine = Engine::new(kernel);
        let channel = ErrorChannel::new();
        let options = ComputeOptions::builder()
            .error_channel(channel.clone())
            .build()
            .unwrap();
        assert!(engine.compute(&Job::pfunc(complex(&["AC"])), &options).is_err());
        let fills = engine.kernel().fills().len();

        assert!(engine.compute(&Job::pfunc(complex(&["GGGG"])), &options).is_err());
        assert_eq!(engine.kernel().fills().len(), fills);
        channel.clear();
        assert!(engine.compute(&Job::pfunc(complex(&["GGGG"])), &options).is_ok());
    }

    #[test]
    fn samples_from_separate_jobs_accumulate() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGUACGU", "AC"]);
        let results = engine
            .computes(
                &[
                    Job::sample(x.clone(), SampleParams::with_seed(5, 1)),
                    Job::sample(x.clone(), SampleParams::with_seed(3, 2)),
                ],
                &options(),
            )
            .unwrap();
        let result = &results[&x];
        assert_eq!(result.sample.as_ref().unwrap().structures.len(), 8);
        assert!(result.pfunc.is_some());
    }

    #[test]
    fn suboptimal_structures_honor_the_gap_sign() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU", "UU"]);
        let result = engine
            .compute(&Job::subopt(x.clone(), SuboptParams::new(0.0)), &options())
            .unwrap();
        let structures = result.subopt.unwrap().structures;
        assert_eq!(structures.len(), 1);
        assert!(close(structures[0].energy, result.mfe.unwrap().energy));

        let negative = engine
            .compute(&Job::subopt(x, SuboptParams::new(-1.0)), &options())
            .unwrap();
        assert!(negative.subopt.unwrap().structures.is_empty());
    }

    #[test]
    fn passes_run_one_after_the_other_when_both_do_not_fit() {
        let kernel = SyntheticKernel::new()
            .with_block_bytes(|ensemble, _| match ensemble {
                Ensemble::PartitionFunction => 600,
                Ensemble::MinimumFreeEnergy => 500,
            })
            .with_strand_bytes(|_, _| 0);
        let engine = Engine::new(kernel);
        let x = complex(&["ACGUAC"]);
        let options = ComputeOptions::builder()
            .threads(4)
            .max_bytes(900)
            .build()
            .unwrap();
        engine
            .computes(&[Job::pfunc(x.clone()), Job::mfe(x.clone())], &options)
            .unwrap();

        let pf = &engine.kernel().fills_of(PF, &x)[0];
        let mfe = &engine.kernel().fills_of(MFE, &x)[0];
        assert!(pf.end_seq < mfe.start_seq);
        assert!(engine.kernel().stats().peak_bytes <= 900);
        assert!(engine.cache().used() <= 900);
    }

    #[test]
    fn overflowing_blocks_are_finished_in_wide_precision() {
        let x = complex(&["ACGUACGU", "GGCC"]);
        let engine = Engine::new(SyntheticKernel::new().overflow_on(x.clone()));
        let result = engine.compute(&Job::pfunc(x.clone()), &options()).unwrap();
        assert!(result.pfunc.is_some());

        let fills = engine.kernel().fills_of(PF, &x);
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].precision, Precision::Primary);
        assert!(fills[0].reached < fills[0].end);
        assert_eq!(fills[1].precision, Precision::Wide);
        assert_eq!(fills[1].start, fills[0].reached);
        assert_eq!(
            engine.cache().block_progress(PF, &x),
            Some(required_extent(&x, true))
        );
    }

    #[test]
    fn nan_root_values_are_numeric_errors() {
        let x = complex(&["ACGU"]);
        let engine = Engine::new(SyntheticKernel::new().nan_on(x.clone()));
        let error = engine.compute(&Job::mfe(x), &options()).unwrap_err();
        assert!(matches!(error, EngineError::Numeric { .. }));
    }

    #[test]
    fn invalid_input_is_rejected_before_scheduling() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU"]);

        let error = engine
            .submit(&[Job::sample(x.clone(), SampleParams::with_seed(0, 1))], &options())
            .err()
            .unwrap();
        assert!(error.is_validation());
        assert!(matches!(
            error,
            EngineError::Job {
                source: JobError::ZeroSamples,
                ..
            }
        ));

        let zero_budget = ComputeOptions {
            max_bytes: Some(0),
            ..ComputeOptions::default()
        };
        assert_eq!(
            engine.submit(&[Job::pfunc(x)], &zero_budget).err(),
            Some(EngineError::Config(ConfigError::ZeroBudget))
        );
        assert!(engine.kernel().fills().is_empty());
    }

    #[test]
    fn actions_bias_uncached_blocks() {
        let engine = Engine::new(SyntheticKernel::new());
        let x = complex(&["ACGU", "AC"]);
        let action = Action::new("bonus", |_, _, _| (-2.0, ActionKind::Bonus));
        let options = ComputeOptions::builder()
            .cache_complexes(false)
            .action(action)
            .build()
            .unwrap();
        let result = engine.compute(&Job::mfe(x.clone()), &options).unwrap();
        assert!(close(result.mfe.unwrap().energy, 6.0 * MFE_PER_NUCLEOTIDE - 2.0));
        assert_eq!(engine.cache().block_progress(MFE, &x), None);
    }

    #[test]
    fn submit_returns_before_the_work_finishes() {
        let kernel = SyntheticKernel::new().with_fill_delay(Duration::from_millis(50));
        let engine = Engine::new(kernel);
        let mut future = engine
            .submit(&[Job::mfe(complex(&["ACGU", "GC"]))], &options())
            .unwrap();
        assert!(!future.is_ready());

        future.wait();
        assert!(future.is_ready());
        assert!(future.get().unwrap()[&complex(&["ACGU", "GC"])].mfe.is_some());
    }

    #[test]
    fn clearing_the_cache_does_not_disturb_running_batches() {
        let kernel = SyntheticKernel::new().with_fill_delay(Duration::from_millis(100));
        let engine = Engine::new(kernel);
        let x = complex(&["ACGU", "GC", "AU"]);
        let mut future = engine.submit(&[Job::pfunc(x.clone())], &options()).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        engine.cache().clear();

        let results = future.get().unwrap();
        assert!(close(results[&x].pfunc.unwrap().logq, 8.0 * LOGQ_PER_NUCLEOTIDE));
    }

    #[test]
    fn results_are_taken_once() {
        let engine = Engine::new(SyntheticKernel::new());
        let mut future = engine
            .submit(&[Job::pfunc(complex(&["ACGU"]))], &options())
            .unwrap();
        assert_eq!(future.get().unwrap().len(), 1);
        assert!(future.is_ready());
        assert_eq!(future.get().err(), Some(EngineError::ResultAlreadyTaken));
    }

    #[test]
    fn sinks_receive_each_update() {
        let engine = Engine::new(SyntheticKernel::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let sink: Arc<dyn Sink> = Arc::new(move |complex: &Complex, update: Update| {
            log.lock().unwrap().push((complex.to_string(), update.name()));
        });
        let x = complex(&["ACGU"]);
        engine
            .compute_with_sink(
                &[Job::pfunc(x.clone()), Job::sample(x, SampleParams::with_seed(2, 9))],
                &options(),
                sink,
            )
            .unwrap();
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        let names: Vec<_> = seen.iter().map(|(c, name)| format!("{c}:{name}")).collect();
        assert_eq!(names, ["ACGU:pfunc", "ACGU:pfunc", "ACGU:sample"]);
    }

    #[test]
    fn engines_sharing_a_cache_reuse_each_others_tables() {
        let kernel = Arc::new(SyntheticKernel::new());
        let cache = Arc::new(Cache::new());
        let a = Engine::with_cache(kernel.clone(), cache.clone());
        let b = Engine::with_cache(kernel.clone(), cache);
        let x = complex(&["ACGU", "UU"]);
        let executor = Executor::new(2).unwrap();
        let options = ComputeOptions::builder().executor(executor).build().unwrap();

        a.compute(&Job::pfunc(x.clone()), &options).unwrap();
        let fills = kernel.fills().len();
        b.compute(&Job::pfunc(x), &options).unwrap();
        assert_eq!(kernel.fills().len(), fills);
    }

    #[test]
    fn overlapping_batches_from_many_threads_all_succeed() {
        let kernel = SyntheticKernel::new()
            .with_block_bytes(|_, _| 8)
            .with_strand_bytes(|_, _| 8);
        let engine = Engine::new(kernel);
        let executor = Executor::new(4).unwrap();
        let full = complex(&["ACGU", "GC", "AU"]);
        let (done, finished) = std::sync::mpsc::channel();

        for t in 0..6u64 {
            let engine = engine.clone();
            let executor = executor.clone();
            let full = full.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut failures = Vec::new();
                for batch in 0..10u64 {
                    let mut builder = ComputeOptions::builder().executor(executor.clone());
                    if (t + batch) % 2 == 0 {
                        builder = builder.max_bytes(400);
                    }
                    let options = builder.build().unwrap();
                    let jobs = [
                        Job::pfunc(full.clone()),
                        Job::pairs(complex(&["ACGU", "GC"])),
                        Job::sample(complex(&["GC", "AU"]), SampleParams::with_seed(3, t * 10 + batch)),
                        Job::costs(complex(&["ACGU", "AU"])),
                        Job::subopt(full.clone(), SuboptParams::new(0.5)),
                        Job::mfe(complex(&["AU", "ACGU"])),
                    ];
                    match engine.computes(&jobs, &options) {
                        Ok(results) => {
                            let logq = results[&full].pfunc.unwrap().logq;
                            if !close(logq, 8.0 * LOGQ_PER_NUCLEOTIDE) {
                                failures.push(format!("thread {t} batch {batch}: logq {logq}"));
                            }
                        }
                        Err(e) => failures.push(format!("thread {t} batch {batch}: {e}")),
                    }
                    if batch % 3 == 2 {
                        engine.cache().shrink_to_limit(100);
                    }
                }
                done.send(failures).unwrap();
            });
        }
        drop(done);

        let mut failures = Vec::new();
        for _ in 0..6 {
            let thread_failures = finished
                .recv_timeout(Duration::from_secs(60))
                .expect("a batch thread did not finish");
            failures.extend(thread_failures);
        }
        assert!(failures.is_empty(), "{failures:?}");
    }
}
