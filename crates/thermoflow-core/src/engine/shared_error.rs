use super::error::EngineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Slot {
    set: AtomicBool,
    stored: AtomicBool,
    error: Mutex<Option<EngineError>>,
}

/// First-error-wins store shared by every work item of a submission.
///
/// `is_set` is a single atomic load so it can be consulted before every work
/// item. Only the first call to `set` stores its error; later errors are
/// discarded.
#[derive(Debug, Clone, Default)]
pub struct ErrorChannel {
    slot: Arc<Slot>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` unless an error was already recorded. Returns whether
    /// this call won.
    pub fn set(&self, error: EngineError) -> bool {
        if self.slot.set.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.slot.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.slot.stored.store(true, Ordering::Release);
        true
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.slot.set.load(Ordering::Acquire)
    }

    /// Returns the recorded error, if any.
    ///
    /// If a writer has claimed the slot but not finished storing, this waits
    /// until the error is visible.
    pub fn rethrow_if_set(&self) -> Result<(), EngineError> {
        if !self.is_set() {
            return Ok(());
        }
        while !self.slot.stored.load(Ordering::Acquire) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        let guard = self.slot.error.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(error) => Err(error.clone()),
            None => Err(EngineError::Consistency(
                "error channel flagged without a stored error".into(),
            )),
        }
    }

    /// Forgets the recorded error so the channel can be reused.
    pub fn clear(&self) {
        let mut guard = self.slot.error.lock().unwrap_or_else(PoisonError::into_inner);
        if self.slot.stored.load(Ordering::Acquire) {
            *guard = None;
            self.slot.stored.store(false, Ordering::Release);
            self.slot.set.store(false, Ordering::Release);
        }
    }
}
