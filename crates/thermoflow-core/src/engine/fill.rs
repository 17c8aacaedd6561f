use super::cache::{BlockData, BlockState, ModelData, StrandData, read, write};
use super::decompose::largest_first;
use super::error::EngineError;
use super::runtime::Sink;
use super::shared_error::ErrorChannel;
use crate::core::kernel::{BlockFill, Kernel, Precision, required_extent};
use crate::core::models::job::Ensemble;
use std::cmp::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

/// Shared context of every work item in one pass.
pub(crate) struct PassEnv<K: Kernel> {
    pub kernel: Arc<K>,
    pub ensemble: Ensemble,
    pub model: Arc<ModelData<K>>,
    pub errors: ErrorChannel,
    pub sink: Arc<dyn Sink>,
}

/// Entries a work item keeps alive until it finishes.
pub(crate) struct Dependencies<K: Kernel> {
    pub blocks: Vec<Arc<BlockData<K>>>,
    pub strands: Vec<Arc<StrandData<K>>>,
}

impl<K: Kernel> Default for Dependencies<K> {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            strands: Vec::new(),
        }
    }
}

impl<K: Kernel> Dependencies<K> {
    pub fn lock_blocks(&self) -> ReadSet<'_, BlockState<K>> {
        ReadSet::acquire(&self.blocks, |b| &b.state, |a, b| {
            largest_first(&a.complex, &b.complex)
        })
    }

    pub fn lock_strands(&self) -> ReadSet<'_, Option<K::Strand>> {
        ReadSet::acquire(&self.strands, |s| &s.table, |a, b| a.strand.cmp(&b.strand))
    }
}

/// Read guards over a list of entries.
///
/// Every work item takes block locks largest first and strand locks after
/// all block locks. A repeated entry is locked once and shared by each
/// position that lists it.
pub(crate) struct ReadSet<'a, T> {
    guards: Vec<RwLockReadGuard<'a, T>>,
    slots: Vec<usize>,
}

impl<'a, T> ReadSet<'a, T> {
    fn acquire<D>(
        items: &'a [Arc<D>],
        lock: impl Fn(&'a D) -> &'a RwLock<T>,
        order: impl Fn(&D, &D) -> Ordering,
    ) -> Self {
        let mut sorted: Vec<usize> = (0..items.len()).collect();
        sorted.sort_by(|&a, &b| {
            order(&items[a], &items[b])
                .then_with(|| Arc::as_ptr(&items[a]).cmp(&Arc::as_ptr(&items[b])))
        });
        let mut guards = Vec::with_capacity(items.len());
        let mut slots = vec![0; items.len()];
        let mut previous = None;
        for index in sorted {
            let item = &items[index];
            if previous != Some(Arc::as_ptr(item)) {
                guards.push(read(lock(item.as_ref())));
                previous = Some(Arc::as_ptr(item));
            }
            slots[index] = guards.len() - 1;
        }
        Self { guards, slots }
    }

    /// Guard of the entry listed at `position`.
    pub fn get(&self, position: usize) -> &T {
        &self.guards[self.slots[position]]
    }
}

/// Table of a dependency block, checked to be filled at least to `required`
/// diagonals.
pub(crate) fn block_table<'a, K: Kernel>(
    guard: &'a BlockState<K>,
    data: &BlockData<K>,
    required: usize,
) -> Result<&'a K::Block, EngineError> {
    match &guard.table {
        Some(table) if guard.progress >= required => Ok(table),
        Some(_) => Err(EngineError::Consistency(format!(
            "dependency '{}' filled to {} of {} diagonals",
            data.complex, guard.progress, required
        ))),
        None => Err(EngineError::Consistency(format!(
            "missing dependency '{}'",
            data.complex
        ))),
    }
}

pub(crate) fn strand_tables<'a, K: Kernel>(
    guards: &'a ReadSet<'_, Option<K::Strand>>,
    data: &[Arc<StrandData<K>>],
) -> Result<Vec<&'a K::Strand>, EngineError> {
    data.iter()
        .enumerate()
        .map(|(position, strand)| {
            guards.get(position).as_ref().ok_or_else(|| {
                EngineError::Consistency(format!("missing strand dependency '{}'", strand.strand))
            })
        })
        .collect()
}

pub(crate) fn compute_strand<K: Kernel>(
    env: &PassEnv<K>,
    data: &StrandData<K>,
) -> Result<(), EngineError> {
    let mut table = write(&data.table);
    if table.is_some() {
        return Ok(());
    }
    let model = env.model.get(&env.kernel, Precision::Primary)?;
    trace!(strand = %data.strand, "Computing strand table.");
    *table = Some(
        env.kernel
            .compute_strand(data.ensemble, &data.strand, &model)
            .map_err(|e| EngineError::kernel(&data.strand, e))?,
    );
    Ok(())
}

/// Extends `block` to the extent its request needs.
///
/// The block's write lock is held for the whole fill, so two batches that
/// both need the block serialize on it and the second one finds the work
/// already done. If the primary fill stops short the table is widened in
/// place and the fill resumes from the diagonal it reached.
pub(crate) fn fill_block<K: Kernel>(
    env: &PassEnv<K>,
    block: &BlockData<K>,
    deps: &Dependencies<K>,
    full: bool,
) -> Result<(), EngineError> {
    let end = required_extent(&block.complex, full);
    let mut state = write(&block.state);
    if state.table.is_none() {
        state.table = Some(env.kernel.new_block(env.ensemble, &block.complex));
        state.progress = 0;
        state.precision = Precision::Primary;
    } else if state.progress >= end {
        return Ok(());
    }

    let block_guards = deps.lock_blocks();
    let dependency_tables = deps
        .blocks
        .iter()
        .enumerate()
        .map(|(position, data)| {
            block_table(
                block_guards.get(position),
                data,
                required_extent(&data.complex, true),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    let strand_guards = deps.lock_strands();
    let strand_tables = strand_tables(&strand_guards, &deps.strands)?;

    let stop = || env.errors.is_set();
    let BlockState {
        table,
        progress,
        precision,
    } = &mut *state;
    let Some(table) = table.as_mut() else {
        return Err(EngineError::Consistency(format!(
            "table of '{}' vanished during fill",
            block.complex
        )));
    };

    for attempt in [Precision::Primary, Precision::Wide] {
        if *progress >= end || stop() {
            break;
        }
        if attempt < *precision {
            continue;
        }
        if attempt == Precision::Wide && *precision == Precision::Primary {
            debug!(
                complex = %block.complex,
                reached = *progress,
                end,
                "Primary precision overflowed; widening table."
            );
            env.kernel.widen_block(table);
            *precision = Precision::Wide;
        }
        let model = env.model.get(&env.kernel, attempt)?;
        let reached = env
            .kernel
            .fill_block(BlockFill {
                ensemble: env.ensemble,
                complex: &block.complex,
                precision: attempt,
                model: &model,
                action: block.action.as_ref(),
                table: &mut *table,
                dependencies: &dependency_tables,
                strands: &strand_tables,
                start: *progress,
                end,
                stop: &stop,
            })
            .map_err(|e| EngineError::kernel(&block.complex, e))?;
        *progress = reached.clamp(*progress, end);
    }

    if *progress < end && !stop() {
        return Err(EngineError::numeric(
            &block.complex,
            format!("block fill stopped at {} of {} diagonals", *progress, end),
        ));
    }
    trace!(complex = %block.complex, progress = *progress, "Block filled.");
    Ok(())
}
