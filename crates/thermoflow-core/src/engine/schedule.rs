use super::cache::{BlockData, CacheState, EntryId, EntryKey, Store, StrandData};
use super::decompose::{BlockQueue, Root, dependencies, for_each_dependency};
use super::error::EngineError;
use super::fill::{self, Dependencies, PassEnv};
use super::graph::{TaskGraph, TaskId};
use super::pipeline::{self, Request};
use crate::core::kernel::{Kernel, required_extent};
use crate::core::models::action::Action;
use crate::core::models::complex::{Complex, Strand};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default)]
pub(crate) struct PassSettings {
    pub max_bytes: Option<usize>,
    pub cache_complexes: bool,
    pub action: Option<Action>,
}

/// Entry and exit nodes of one scheduled pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Schedule {
    pub start: TaskId,
    pub finish: TaskId,
    /// Largest number of bytes the pass had charged at once for entries it
    /// created itself.
    pub peak_bytes: usize,
    /// Tick of the first round; every entry the pass touches is at least
    /// this recent.
    pub start_time: u64,
}

struct StrandSlot {
    id: EntryId,
    task: Option<TaskId>,
}

struct BlockSlot {
    id: EntryId,
    scratch: bool,
    task: Option<TaskId>,
    /// Read by the fill task when it runs, so a later round can still
    /// upgrade a scheduled fill to the full extent.
    full: Arc<AtomicBool>,
}

impl BlockSlot {
    fn new(id: EntryId, scratch: bool, full: bool) -> Self {
        Self {
            id,
            scratch,
            task: None,
            full: Arc::new(AtomicBool::new(full)),
        }
    }
}

struct PendingFill<K: Kernel> {
    complex: Complex,
    data: Arc<BlockData<K>>,
    full: Arc<AtomicBool>,
    strands: Vec<(Arc<StrandData<K>>, Option<TaskId>)>,
}

/// Adds one pass over `requests` to `graph`.
///
/// Each request is a round: its blocks and strands are reserved at the
/// current tick, fill tasks are created for whatever is not already filled
/// far enough, and a finalize task reads the result. With a budget set,
/// entries from earlier rounds are evicted after every round; when the
/// evicted entry was last used by this pass, the round that used it must
/// finish before the new round's tasks start.
pub(crate) fn schedule_pass<K: Kernel>(
    graph: &mut TaskGraph,
    state: &mut CacheState<K>,
    env: Arc<PassEnv<K>>,
    requests: Vec<Request>,
    settings: &PassSettings,
) -> Result<Schedule, EngineError> {
    let ensemble = env.ensemble.name();
    let start = graph.barrier(format!("start {ensemble}"));
    let finish = graph.barrier(format!("finish {ensemble}"));
    let start_time = state.time;
    if requests.is_empty() {
        graph.precede(start, finish);
        return Ok(Schedule {
            start,
            finish,
            peak_bytes: 0,
            start_time,
        });
    }

    let capacity = requests
        .iter()
        .map(|r| model_capacity(&r.root))
        .max()
        .unwrap_or(0);
    let prepare = {
        let env = env.clone();
        graph.emplace(format!("prepare {ensemble}"), move || {
            if env.errors.is_set() {
                return;
            }
            if let Err(e) = env.model.prepare(&env.kernel, capacity) {
                env.errors.set(EngineError::kernel(env.ensemble.name(), e));
            }
        })
    };
    graph.precede(start, prepare);

    let rounds = requests.len();
    let mut builder = PassBuilder {
        graph: &mut *graph,
        state: &mut *state,
        scratch: Store::default(),
        env,
        settings,
        strands: HashMap::new(),
        blocks: HashMap::new(),
        created: HashSet::new(),
        own: 0,
        peak: 0,
        start_time,
        prepare,
        roots: Vec::with_capacity(rounds),
        new_tasks: Vec::new(),
    };
    for request in requests {
        builder.round(request)?;
    }
    let peak_bytes = builder.finish(finish);
    debug!(
        ensemble,
        rounds,
        tasks = graph.len(),
        peak_bytes,
        "Scheduled pass."
    );
    Ok(Schedule {
        start,
        finish,
        peak_bytes,
        start_time,
    })
}

/// Models are expanded for twice the longest strand any request reads.
fn model_capacity(root: &Root) -> usize {
    let longest = root
        .blocks
        .iter()
        .flat_map(|(complex, _)| complex.strands())
        .chain(&root.strands)
        .map(Strand::len)
        .max()
        .unwrap_or(0);
    2 * longest
}

struct PassBuilder<'a, K: Kernel> {
    graph: &'a mut TaskGraph,
    state: &'a mut CacheState<K>,
    /// Blocks that live only for this pass when complex caching is off.
    scratch: Store<K>,
    env: Arc<PassEnv<K>>,
    settings: &'a PassSettings,
    strands: HashMap<Strand, StrandSlot>,
    blocks: HashMap<Complex, BlockSlot>,
    created: HashSet<(bool, EntryId)>,
    own: usize,
    peak: usize,
    start_time: u64,
    prepare: TaskId,
    roots: Vec<TaskId>,
    /// Tasks created in the current round.
    new_tasks: Vec<TaskId>,
}

impl<K: Kernel> PassBuilder<'_, K> {
    fn round(&mut self, request: Request) -> Result<(), EngineError> {
        let time = self.state.time;
        self.new_tasks.clear();
        let Request {
            complex,
            root,
            finalizer,
        } = request;

        let mut root_strands = Vec::with_capacity(root.strands.len());
        for strand in &root.strands {
            root_strands.push(self.put_strand(strand, time)?);
        }

        let mut queue = BlockQueue::from_root(&root);
        let mut pending = Vec::new();
        while let Some((key, full)) = queue.pop_largest() {
            let Some((data, full)) = self.put_block(&key, full, time)? else {
                continue;
            };
            for_each_dependency(&key, |dep| queue.request(dep, true));
            let mut strands = Vec::with_capacity(key.len());
            for strand in key.strands() {
                strands.push(self.put_strand(strand, time)?);
            }
            pending.push(PendingFill {
                complex: key,
                data,
                full,
                strands,
            });
        }
        // Sub-blocks were visited after their consumers.
        for fill in pending.into_iter().rev() {
            self.emplace_fill(fill)?;
        }

        let mut deps = Dependencies::default();
        let mut preceding = vec![self.prepare];
        for (key, _) in &root.blocks {
            let (data, task) = self.block_entry(key)?;
            deps.blocks.push(data);
            preceding.extend(task);
        }
        for (data, task) in root_strands {
            deps.strands.push(data);
            preceding.extend(task);
        }
        let env = self.env.clone();
        let label = format!("{} {complex}", finalizer.name());
        let task = self.graph.emplace(label, move || {
            if env.errors.is_set() {
                return;
            }
            match pipeline::finalize(&env, &complex, &root, &finalizer, &deps) {
                Ok(Some(update)) => env.sink.put(&complex, update),
                Ok(None) => {}
                Err(e) => {
                    env.errors.set(e);
                }
            }
        });
        for p in preceding {
            self.graph.precede(p, task);
        }
        self.roots.push(task);
        self.new_tasks.push(task);

        self.shrink(time)?;
        self.peak = self.peak.max(self.own);
        self.state.time += 1;
        Ok(())
    }

    fn charge(&mut self, scratch: bool, id: EntryId) -> Result<(), EngineError> {
        let store = if scratch {
            &self.scratch
        } else {
            &self.state.store
        };
        self.own += store.memory_of(id)?;
        self.created.insert((scratch, id));
        Ok(())
    }

    fn put_strand(
        &mut self,
        strand: &Strand,
        time: u64,
    ) -> Result<(Arc<StrandData<K>>, Option<TaskId>), EngineError> {
        let (id, inserted) =
            self.state
                .store
                .reserve_strand(&self.env.kernel, self.env.ensemble, strand, time)?;
        if inserted {
            self.charge(false, id)?;
        }
        let data = self.state.store.strand(id)?;
        if let Some(slot) = self.strands.get(strand) {
            if slot.id == id {
                return Ok((data, slot.task));
            }
        }

        let computed = data.table.try_read().is_ok_and(|table| table.is_some());
        let task = if computed {
            None
        } else {
            let env = self.env.clone();
            let target = data.clone();
            let task = self.graph.emplace(
                format!("strand {} {strand}", env.ensemble.name()),
                move || {
                    if env.errors.is_set() {
                        return;
                    }
                    if let Err(e) = fill::compute_strand(&env, &target) {
                        env.errors.set(e);
                    }
                },
            );
            self.graph.precede(self.prepare, task);
            self.new_tasks.push(task);
            Some(task)
        };
        self.strands.insert(strand.clone(), StrandSlot { id, task });
        Ok((data, task))
    }

    /// Reserves `key` and decides whether this round has to fill it.
    ///
    /// Returns the block and its extent flag when a fill task is needed.
    /// A block that already has a task in this pass only has its flag
    /// upgraded.
    fn put_block(
        &mut self,
        key: &Complex,
        full: bool,
        time: u64,
    ) -> Result<Option<(Arc<BlockData<K>>, Arc<AtomicBool>)>, EngineError> {
        let scratch = !self.settings.cache_complexes;
        let store = if scratch {
            &mut self.scratch
        } else {
            &mut self.state.store
        };
        let (id, inserted) = store.reserve_block(
            &self.env.kernel,
            self.env.ensemble,
            key,
            self.settings.action.as_ref(),
            time,
        )?;
        let data = store.block(id)?;
        if inserted {
            self.charge(scratch, id)?;
        }

        let slot = match self.blocks.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().id == id && entry.get().scratch == scratch => {
                entry.into_mut()
            }
            Entry::Occupied(mut entry) => {
                entry.insert(BlockSlot::new(id, scratch, full));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(BlockSlot::new(id, scratch, full)),
        };
        if full {
            slot.full.store(true, Ordering::Release);
        }
        if slot.task.is_some() {
            return Ok(None);
        }
        let required = required_extent(key, full);
        let filled = data
            .state
            .try_read()
            .is_ok_and(|state| state.table.is_some() && state.progress >= required);
        if filled {
            trace!(complex = %key, "Block already filled.");
            return Ok(None);
        }
        Ok(Some((data, slot.full.clone())))
    }

    fn block_entry(&self, key: &Complex) -> Result<(Arc<BlockData<K>>, Option<TaskId>), EngineError> {
        let slot = self.blocks.get(key).ok_or_else(|| {
            EngineError::Consistency(format!("block '{key}' was not reserved before use"))
        })?;
        let store = if slot.scratch {
            &self.scratch
        } else {
            &self.state.store
        };
        Ok((store.block(slot.id)?, slot.task))
    }

    fn emplace_fill(&mut self, fill: PendingFill<K>) -> Result<(), EngineError> {
        let PendingFill {
            complex,
            data,
            full,
            strands,
        } = fill;
        let mut deps = Dependencies::default();
        let mut preceding = vec![self.prepare];
        for dep in dependencies(&complex) {
            let (block, task) = self.block_entry(&dep)?;
            deps.blocks.push(block);
            preceding.extend(task);
        }
        for (strand, task) in strands {
            deps.strands.push(strand);
            preceding.extend(task);
        }

        let env = self.env.clone();
        let label = format!("fill {} {complex}", env.ensemble.name());
        let task = self.graph.emplace(label, move || {
            if env.errors.is_set() {
                return;
            }
            if let Err(e) = fill::fill_block(&env, &data, &deps, full.load(Ordering::Acquire)) {
                env.errors.set(e);
            }
        });
        for p in preceding {
            self.graph.precede(p, task);
        }
        if let Some(slot) = self.blocks.get_mut(&complex) {
            slot.task = Some(task);
        }
        self.new_tasks.push(task);
        Ok(())
    }

    fn oldest(&self) -> Option<(bool, u64, EntryId)> {
        match (self.state.store.oldest(), self.scratch.oldest()) {
            (Some((g, _)), Some((s, sid))) if s < g => Some((true, s, sid)),
            (Some((g, gid)), _) => Some((false, g, gid)),
            (None, Some((s, sid))) => Some((true, s, sid)),
            (None, None) => None,
        }
    }

    /// Evicts entries older than the current round until the budget holds.
    fn shrink(&mut self, time: u64) -> Result<(), EngineError> {
        let Some(max) = self.settings.max_bytes else {
            return Ok(());
        };
        let mut waits = BTreeSet::new();
        while self.state.store.memory() + self.scratch.memory() > max {
            let Some((scratch, entry_time, id)) = self.oldest().filter(|&(_, t, _)| t < time)
            else {
                if self.scratch.memory() > max {
                    return Err(EngineError::Resource(format!(
                        "blocks of one request need {} bytes without complex caching, over the budget of {max}",
                        self.scratch.memory()
                    )));
                }
                warn!(
                    round = time - self.start_time,
                    used = self.state.store.memory() + self.scratch.memory(),
                    max,
                    "Round exceeds the memory budget; nothing older is left to evict."
                );
                break;
            };
            if entry_time >= self.start_time {
                waits.insert((entry_time - self.start_time) as usize);
            }
            let store = if scratch {
                &mut self.scratch
            } else {
                &mut self.state.store
            };
            let Some(evicted) = store.remove(id) else {
                break;
            };
            if self.created.remove(&(scratch, id)) {
                self.own -= evicted.memory;
            }
            match &evicted.key {
                EntryKey::Strand(_, strand) => {
                    if !scratch && self.strands.get(strand).is_some_and(|s| s.id == id) {
                        self.strands.remove(strand);
                    }
                }
                EntryKey::Block(_, complex) => {
                    if self
                        .blocks
                        .get(complex)
                        .is_some_and(|s| s.id == id && s.scratch == scratch)
                    {
                        self.blocks.remove(complex);
                    }
                }
            }
            trace!(key = ?evicted.key, bytes = evicted.memory, "Evicted during scheduling.");
        }

        if !waits.is_empty() {
            let barrier = self.graph.barrier(format!("evict {time}"));
            for round in waits {
                self.graph.precede(self.roots[round], barrier);
            }
            for &task in &self.new_tasks {
                self.graph.precede(barrier, task);
            }
        }
        Ok(())
    }

    fn finish(self, finish: TaskId) -> usize {
        for &root in &self.roots {
            self.graph.precede(root, finish);
        }
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::job::{Ensemble, Job};
    use crate::core::models::result::Update;
    use crate::engine::cache::Cache;
    use crate::engine::config::Executor;
    use crate::engine::progress::ProgressReporter;
    use crate::engine::runtime::Sink;
    use crate::engine::shared_error::ErrorChannel;
    use crate::kernels::synthetic::SyntheticKernel;
    use std::sync::Mutex;

    const PF: Ensemble = Ensemble::PartitionFunction;

    fn complex(seqs: &[&str]) -> Complex {
        Complex::from_sequences(seqs).unwrap()
    }

    struct Harness {
        kernel: Arc<SyntheticKernel>,
        cache: Cache<SyntheticKernel>,
        updates: Arc<Mutex<Vec<(Complex, Update)>>>,
        errors: ErrorChannel,
    }

    impl Harness {
        fn new(kernel: SyntheticKernel) -> Self {
            Self {
                kernel: Arc::new(kernel),
                cache: Cache::new(),
                updates: Arc::new(Mutex::new(Vec::new())),
                errors: ErrorChannel::new(),
            }
        }

        fn env(&self) -> Arc<PassEnv<SyntheticKernel>> {
            let updates = self.updates.clone();
            let sink: Arc<dyn Sink> = Arc::new(move |complex: &Complex, update: Update| {
                updates.lock().unwrap().push((complex.clone(), update));
            });
            Arc::new(PassEnv {
                kernel: self.kernel.clone(),
                ensemble: PF,
                model: self.cache.model(PF),
                errors: self.errors.clone(),
                sink,
            })
        }

        fn schedule(
            &self,
            jobs: &[Job],
            settings: &PassSettings,
        ) -> Result<(TaskGraph, Schedule), EngineError> {
            let mut requests = Vec::new();
            for job in jobs {
                pipeline::expand(job, &mut requests);
            }
            let mut graph = TaskGraph::new();
            let schedule = schedule_pass(
                &mut graph,
                &mut self.cache.lock(),
                self.env(),
                requests,
                settings,
            )?;
            Ok((graph, schedule))
        }

        fn run(&self, graph: TaskGraph) {
            graph.check_acyclic().unwrap();
            graph
                .launch(
                    &Executor::new(2).unwrap(),
                    self.errors.clone(),
                    ProgressReporter::new(),
                )
                .wait();
        }
    }

    fn cached() -> PassSettings {
        PassSettings {
            cache_complexes: true,
            ..PassSettings::default()
        }
    }

    #[test]
    fn first_pass_fills_every_block_and_charges_its_memory() {
        let harness = Harness::new(
            SyntheticKernel::new()
                .with_block_bytes(|_, _| 10)
                .with_strand_bytes(|_, _| 1),
        );
        let x = complex(&["AC", "GU"]);
        let (graph, schedule) = harness.schedule(&[Job::pfunc(x.clone())], &cached()).unwrap();

        // Three blocks and two strands.
        assert_eq!(schedule.peak_bytes, 32);
        assert_eq!(harness.cache.used(), 32);
        harness.run(graph);
        assert!(harness.errors.rethrow_if_set().is_ok());
        assert_eq!(harness.kernel.fills().len(), 3);
        let updates = harness.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, x);
    }

    #[test]
    fn cached_blocks_need_only_a_finalize_task() {
        let harness = Harness::new(SyntheticKernel::new());
        let job = Job::pfunc(complex(&["ACG", "UUA"]));
        let (graph, _) = harness.schedule(&[job.clone()], &cached()).unwrap();
        harness.run(graph);

        let (graph, schedule) = harness.schedule(&[job], &cached()).unwrap();
        // start, finish, prepare and the finalize task.
        assert_eq!(graph.len(), 4);
        assert_eq!(schedule.peak_bytes, 0);
    }

    #[test]
    fn empty_pass_links_start_to_finish() {
        let harness = Harness::new(SyntheticKernel::new());
        let (graph, schedule) = harness.schedule(&[], &cached()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(schedule.peak_bytes, 0);
        assert_eq!(harness.kernel.stats().prepares, 0);
    }

    #[test]
    fn budget_evicts_earlier_rounds_without_losing_results() {
        let harness = Harness::new(
            SyntheticKernel::new()
                .with_block_bytes(|_, _| 10)
                .with_strand_bytes(|_, _| 0),
        );
        let settings = PassSettings {
            max_bytes: Some(15),
            ..cached()
        };
        let jobs: Vec<_> = ["AAAA", "CCCC", "GGGG"]
            .iter()
            .map(|s| Job::pfunc(complex(&[s])))
            .collect();
        let (graph, schedule) = harness.schedule(&jobs, &settings).unwrap();

        assert_eq!(harness.cache.used(), 10);
        assert_eq!(schedule.peak_bytes, 10);
        assert!(harness.cache.block_progress(PF, &complex(&["AAAA"])).is_none());
        harness.run(graph);
        assert!(harness.errors.rethrow_if_set().is_ok());
        assert_eq!(harness.updates.lock().unwrap().len(), 3);
    }

    #[test]
    fn uncached_blocks_over_budget_are_a_resource_error() {
        let harness = Harness::new(SyntheticKernel::new().with_block_bytes(|_, _| 100));
        let settings = PassSettings {
            max_bytes: Some(50),
            cache_complexes: false,
            action: None,
        };
        let result = harness.schedule(&[Job::pfunc(complex(&["ACGU"]))], &settings);
        assert!(matches!(result, Err(EngineError::Resource(_))));
    }

    #[test]
    fn full_request_extends_a_partially_filled_block() {
        let harness = Harness::new(SyntheticKernel::new());
        let x = complex(&["AAA", "CC"]);
        let (graph, _) = harness.schedule(&[Job::pairs(x.clone())], &cached()).unwrap();
        harness.run(graph);
        assert!(harness.errors.rethrow_if_set().is_ok());
        let wrapped = complex(&["AAA", "CC", "AAA"]);
        assert_eq!(harness.cache.block_progress(PF, &wrapped), Some(3));

        let (graph, _) = harness.schedule(&[Job::pfunc(wrapped.clone())], &cached()).unwrap();
        harness.run(graph);
        assert_eq!(harness.cache.block_progress(PF, &wrapped), Some(5));
    }
}
