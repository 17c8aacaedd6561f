use super::error::EngineError;
use crate::core::kernel::{Kernel, KernelError, Precision};
use crate::core::models::action::Action;
use crate::core::models::complex::{Complex, Strand};
use crate::core::models::job::Ensemble;
use slotmap::{SlotMap, new_key_type};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

new_key_type! {
    pub struct EntryId;
}

/// Content identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum EntryKey {
    Strand(Ensemble, Strand),
    Block(Ensemble, Complex),
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct StrandData<K: Kernel> {
    pub strand: Strand,
    pub ensemble: Ensemble,
    pub table: RwLock<Option<K::Strand>>,
}

impl<K: Kernel> StrandData<K> {
    fn new(ensemble: Ensemble, strand: Strand) -> Self {
        Self {
            strand,
            ensemble,
            table: RwLock::new(None),
        }
    }
}

pub(crate) struct BlockState<K: Kernel> {
    pub table: Option<K::Block>,
    /// Number of diagonals filled so far.
    pub progress: usize,
    pub precision: Precision,
}

pub(crate) struct BlockData<K: Kernel> {
    pub complex: Complex,
    pub ensemble: Ensemble,
    pub action: Option<Action>,
    pub state: RwLock<BlockState<K>>,
}

impl<K: Kernel> BlockData<K> {
    fn new(ensemble: Ensemble, complex: Complex, action: Option<Action>) -> Self {
        Self {
            complex,
            ensemble,
            action,
            state: RwLock::new(BlockState {
                table: None,
                progress: 0,
                precision: Precision::Primary,
            }),
        }
    }

    pub fn progress(&self) -> usize {
        read(&self.state).progress
    }
}

pub(crate) enum Payload<K: Kernel> {
    Strand(Arc<StrandData<K>>),
    Block(Arc<BlockData<K>>),
}

struct Value<K: Kernel> {
    key: EntryKey,
    payload: Payload<K>,
    memory: usize,
    time: u64,
}

/// An entry removed by eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Evicted {
    pub key: EntryKey,
    pub memory: usize,
    pub time: u64,
}

/// A content-addressed table set indexed both by key and by last-touched
/// time.
pub(crate) struct Store<K: Kernel> {
    entries: SlotMap<EntryId, Value<K>>,
    index: HashMap<EntryKey, EntryId>,
    recency: BTreeSet<(u64, EntryId)>,
    memory: usize,
}

impl<K: Kernel> Default for Store<K> {
    fn default() -> Self {
        Self {
            entries: SlotMap::with_key(),
            index: HashMap::new(),
            recency: BTreeSet::new(),
            memory: 0,
        }
    }
}

impl<K: Kernel> Store<K> {
    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &EntryKey) -> Option<EntryId> {
        self.index.get(key).copied()
    }

    /// Returns the entry for `key`, refreshing its time, or creates it and
    /// charges `memory` to the store. The flag is true for a new entry.
    fn reserve(
        &mut self,
        key: EntryKey,
        time: u64,
        memory: impl FnOnce() -> usize,
        make: impl FnOnce() -> Payload<K>,
    ) -> Result<(EntryId, bool), EngineError> {
        if let Some(id) = self.lookup(&key) {
            self.touch(id, time)?;
            return Ok((id, false));
        }
        let memory = memory();
        let id = self.entries.insert(Value {
            key: key.clone(),
            payload: make(),
            memory,
            time,
        });
        self.index.insert(key, id);
        self.recency.insert((time, id));
        self.memory += memory;
        Ok((id, true))
    }

    pub fn reserve_strand(
        &mut self,
        kernel: &K,
        ensemble: Ensemble,
        strand: &Strand,
        time: u64,
    ) -> Result<(EntryId, bool), EngineError> {
        self.reserve(
            EntryKey::Strand(ensemble, strand.clone()),
            time,
            || kernel.strand_memory(ensemble, strand),
            || Payload::Strand(Arc::new(StrandData::new(ensemble, strand.clone()))),
        )
    }

    pub fn reserve_block(
        &mut self,
        kernel: &K,
        ensemble: Ensemble,
        complex: &Complex,
        action: Option<&Action>,
        time: u64,
    ) -> Result<(EntryId, bool), EngineError> {
        self.reserve(
            EntryKey::Block(ensemble, complex.clone()),
            time,
            || kernel.block_memory(ensemble, complex),
            || {
                Payload::Block(Arc::new(BlockData::new(
                    ensemble,
                    complex.clone(),
                    action.cloned(),
                )))
            },
        )
    }

    pub fn touch(&mut self, id: EntryId, time: u64) -> Result<(), EngineError> {
        let value = self.entries.get_mut(id).ok_or_else(|| stale(id))?;
        if value.time != time {
            self.recency.remove(&(value.time, id));
            value.time = time;
            self.recency.insert((time, id));
        }
        Ok(())
    }

    pub fn time_of(&self, id: EntryId) -> Result<u64, EngineError> {
        self.entries.get(id).map(|v| v.time).ok_or_else(|| stale(id))
    }

    pub fn memory_of(&self, id: EntryId) -> Result<usize, EngineError> {
        self.entries.get(id).map(|v| v.memory).ok_or_else(|| stale(id))
    }

    pub fn strand(&self, id: EntryId) -> Result<Arc<StrandData<K>>, EngineError> {
        match self.entries.get(id).map(|v| &v.payload) {
            Some(Payload::Strand(data)) => Ok(data.clone()),
            Some(Payload::Block(_)) => Err(EngineError::Consistency(
                "cache handle refers to a block where a strand was expected".into(),
            )),
            None => Err(stale(id)),
        }
    }

    pub fn block(&self, id: EntryId) -> Result<Arc<BlockData<K>>, EngineError> {
        match self.entries.get(id).map(|v| &v.payload) {
            Some(Payload::Block(data)) => Ok(data.clone()),
            Some(Payload::Strand(_)) => Err(EngineError::Consistency(
                "cache handle refers to a strand where a block was expected".into(),
            )),
            None => Err(stale(id)),
        }
    }

    /// Time of the least recently touched entry.
    pub fn oldest(&self) -> Option<(u64, EntryId)> {
        self.recency.first().copied()
    }

    pub fn remove(&mut self, id: EntryId) -> Option<Evicted> {
        let value = self.entries.remove(id)?;
        self.recency.remove(&(value.time, id));
        self.index.remove(&value.key);
        self.memory -= value.memory;
        Some(Evicted {
            key: value.key,
            memory: value.memory,
            time: value.time,
        })
    }

    /// Evicts least recently touched entries until at most `limit` bytes are
    /// charged, never touching entries at or after `horizon`.
    pub fn shrink_before(&mut self, limit: usize, horizon: u64) -> usize {
        while self.memory > limit {
            let Some((time, id)) = self.oldest() else {
                break;
            };
            if time >= horizon {
                break;
            }
            if let Some(evicted) = self.remove(id) {
                trace!(key = ?evicted.key, bytes = evicted.memory, time = evicted.time, "Evicted cache entry.");
            }
        }
        self.memory
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.recency.clear();
        self.memory = 0;
    }
}

fn stale(id: EntryId) -> EngineError {
    EngineError::Consistency(format!("stale cache handle {id:?}"))
}

/// Prepared model data for one ensemble, shared by every pass that uses it.
pub(crate) struct ModelData<K: Kernel> {
    ensemble: Ensemble,
    slots: RwLock<ModelSlots<K>>,
}

struct ModelSlots<K: Kernel> {
    capacity: usize,
    primary: Option<Arc<K::Prepared>>,
    wide: Option<Arc<K::Prepared>>,
}

impl<K: Kernel> ModelData<K> {
    fn new(ensemble: Ensemble) -> Self {
        Self {
            ensemble,
            slots: RwLock::new(ModelSlots {
                capacity: 0,
                primary: None,
                wide: None,
            }),
        }
    }

    /// Ensures a primary model covering `capacity` nucleotides exists.
    pub fn prepare(&self, kernel: &K, capacity: usize) -> Result<(), KernelError> {
        let mut slots = write(&self.slots);
        if slots.primary.is_some() && slots.capacity >= capacity {
            return Ok(());
        }
        let capacity = capacity.max(slots.capacity);
        debug!(ensemble = ?self.ensemble, capacity, "Preparing model.");
        slots.primary = Some(Arc::new(kernel.prepare(
            self.ensemble,
            Precision::Primary,
            capacity,
        )?));
        slots.wide = None;
        slots.capacity = capacity;
        Ok(())
    }

    /// The model for `precision`, preparing the wide model on first use.
    pub fn get(&self, kernel: &K, precision: Precision) -> Result<Arc<K::Prepared>, EngineError> {
        {
            let slots = read(&self.slots);
            let existing = match precision {
                Precision::Primary => &slots.primary,
                Precision::Wide => &slots.wide,
            };
            if let Some(model) = existing {
                return Ok(model.clone());
            }
            if precision == Precision::Primary {
                return Err(EngineError::Consistency(format!(
                    "{} model used before it was prepared",
                    self.ensemble.name()
                )));
            }
        }
        let mut slots = write(&self.slots);
        if let Some(model) = &slots.wide {
            return Ok(model.clone());
        }
        debug!(ensemble = ?self.ensemble, capacity = slots.capacity, "Preparing wide-precision model.");
        let model = Arc::new(
            kernel
                .prepare(self.ensemble, Precision::Wide, slots.capacity)
                .map_err(|e| EngineError::kernel(self.ensemble.name(), e))?,
        );
        slots.wide = Some(model.clone());
        Ok(model)
    }
}

pub(crate) struct CacheState<K: Kernel> {
    pub store: Store<K>,
    /// Global tick; entries touched at the current tick are protected.
    pub time: u64,
}

/// Memory-bounded, content-addressed cache of strand and block tables.
///
/// A single cache may serve any number of engines built on the same kernel
/// type. Entries are keyed by ensemble and content, so the two strategies
/// share the budget without sharing tables.
pub struct Cache<K: Kernel> {
    state: Mutex<CacheState<K>>,
    models: [Arc<ModelData<K>>; 2],
}

impl<K: Kernel> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Kernel> Cache<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                store: Store::default(),
                time: 0,
            }),
            models: Ensemble::ALL.map(|e| Arc::new(ModelData::new(e))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn model(&self, ensemble: Ensemble) -> Arc<ModelData<K>> {
        self.models[ensemble.index()].clone()
    }

    /// Bytes currently charged to the cache.
    pub fn used(&self) -> usize {
        self.lock().store.memory()
    }

    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().store.is_empty()
    }

    /// Current scheduling tick.
    pub fn tick(&self) -> u64 {
        self.lock().time
    }

    /// Drops every entry. Work already running keeps the tables it holds.
    /// Prepared models are not entries and stay in place, so passes that
    /// are still running keep reading them.
    pub fn clear(&self) {
        self.lock().store.clear();
    }

    /// Evicts least recently used entries until at most `limit` bytes are
    /// charged, and returns the bytes still charged. Entries touched at the
    /// current tick are never evicted, so the result may exceed `limit`.
    pub fn shrink_to_limit(&self, limit: usize) -> usize {
        let mut state = self.lock();
        let horizon = state.time;
        state.store.shrink_before(limit, horizon)
    }

    /// Evicts entries older than `horizon` down to `limit`.
    pub(crate) fn shrink_before(&self, limit: usize, horizon: u64) -> usize {
        self.lock().store.shrink_before(limit, horizon)
    }

    /// Diagonals filled so far for a cached block.
    pub fn block_progress(&self, ensemble: Ensemble, complex: &Complex) -> Option<usize> {
        let state = self.lock();
        let id = state
            .store
            .lookup(&EntryKey::Block(ensemble, complex.clone()))?;
        state.store.block(id).ok().map(|b| b.progress())
    }

    pub fn contains_strand(&self, ensemble: Ensemble, strand: &Strand) -> bool {
        self.lock()
            .store
            .lookup(&EntryKey::Strand(ensemble, strand.clone()))
            .is_some()
    }

    #[cfg(test)]
    pub(crate) fn last_touched_block(&self, ensemble: Ensemble, complex: &Complex) -> Option<u64> {
        let state = self.lock();
        let id = state
            .store
            .lookup(&EntryKey::Block(ensemble, complex.clone()))?;
        state.store.time_of(id).ok()
    }
}
