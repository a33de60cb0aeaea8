//! Flush events and per-epoch memoization.
//!
//! A target fires its flush signal whenever previously read memory may no
//! longer be valid: the process resumed, the dump context switched, or the
//! symbol path changed so different images would be found. Every cache in
//! this crate either subscribes to the signal (push) or compares the
//! signal's generation before handing out a memoized value (pull).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Why a target flushed its caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason
{
    /// The live process was resumed and may have changed its memory.
    Resumed,
    /// The debugger detached from the target.
    Detached,
    /// The dump/process context changed (e.g. a different runtime was selected).
    ContextChanged,
    /// Image lookup configuration changed, so different images may be found.
    ImagesChanged,
    /// Explicit request from the host.
    Requested,
}

impl fmt::Display for FlushReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let text = match self {
            Self::Resumed => "target resumed",
            Self::Detached => "target detached",
            Self::ContextChanged => "context changed",
            Self::ImagesChanged => "image lookup changed",
            Self::Requested => "flush requested",
        };
        f.write_str(text)
    }
}

type FlushCallback = Box<dyn Fn(FlushReason) + Send + Sync>;

/// Registerable flush event with a generation counter
///
/// Callbacks run synchronously inside [`FlushSignal::fire`], after the
/// generation has been bumped, so no read that starts after `fire` returns
/// can observe data cached before it.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use imgmap_core::events::{FlushReason, FlushSignal};
///
/// let signal = FlushSignal::new();
/// let fired = Arc::new(AtomicUsize::new(0));
/// let counter = fired.clone();
/// signal.register(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// signal.fire(FlushReason::Resumed);
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// assert_eq!(signal.generation(), 1);
/// ```
#[derive(Default)]
pub struct FlushSignal
{
    generation: AtomicU64,
    callbacks: Mutex<Vec<FlushCallback>>,
}

impl FlushSignal
{
    /// Create a signal at generation zero with no subscribers.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Current flush generation. Starts at zero and increases by one per flush.
    pub fn generation(&self) -> u64
    {
        self.generation.load(Ordering::Acquire)
    }

    /// Subscribe to flushes for the lifetime of this signal.
    ///
    /// Callbacks must not register further callbacks or fire the signal.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(FlushReason) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Start a new epoch and notify every subscriber.
    pub fn fire(&self, reason: FlushReason)
    {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(%reason, generation, "flushing target caches");
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(reason);
        }
    }
}

impl fmt::Debug for FlushSignal
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("FlushSignal")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// A value memoized for exactly one flush generation
///
/// Invalidation is a single comparison against the signal's generation
/// rather than a set of dirty flags. The slot lock is not held while the
/// value is computed, so an initializer may freely read memory; a racing
/// initializer for the same generation loses and its value is discarded.
pub struct EpochCell<T>
{
    slot: Mutex<Option<(u64, Arc<T>)>>,
}

impl<T> Default for EpochCell<T>
{
    fn default() -> Self
    {
        Self { slot: Mutex::new(None) }
    }
}

impl<T> EpochCell<T>
{
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Value for `generation`, if one has been computed.
    pub fn get(&self, generation: u64) -> Option<Arc<T>>
    {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((stored, value)) if *stored == generation => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the value for `generation`, computing it with `init` if the
    /// stored value belongs to an older generation (or none exists).
    ///
    /// ## Errors
    ///
    /// Propagates the error returned by `init`; nothing is stored in that case.
    pub fn get_or_try_init<E, F>(&self, generation: u64, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get(generation) {
            return Ok(value);
        }

        let value = Arc::new(init()?);
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((stored, existing)) = slot.as_ref() {
            if *stored == generation {
                return Ok(existing.clone());
            }
        }
        *slot = Some((generation, value.clone()));
        Ok(value)
    }

    /// Drop the stored value regardless of generation.
    pub fn clear(&self)
    {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl<T> fmt::Debug for EpochCell<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EpochCell")
            .field("generation", &slot.as_ref().map(|(generation, _)| *generation))
            .finish()
    }
}
