#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Continuous and one-shot device position sampling.
//!
//! [`PositionStream`] sits on top of a [`LocationProvider`] and hands out
//! cancellable watches. Each watch owns one sensor subscription; clearing
//! the watch (or stopping the stream) drops the subscription, which
//! releases the platform resource even when the sensor already failed.

pub mod filter;
pub mod provider;
pub mod simulated;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;

pub use filter::SampleFilter;
pub use patrol_position_models::{Position, PositionError, PositionOptions};
pub use provider::{LocationProvider, Sample, SensorSubscription};
pub use simulated::SimulatedProvider;

/// Opaque handle identifying an active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

thread_local! {
    /// The watch whose callback is running on this thread, if any.
    static IN_CALLBACK: Cell<Option<WatchId>> = const { Cell::new(None) };
}

/// Cancellation gate shared by a watch task and [`PositionStream`].
///
/// Callbacks run with `in_flight` held and only while `live` is set, so
/// once [`WatchGate::close`] returns no callback is running or will run.
#[derive(Default)]
struct WatchGate {
    live: AtomicBool,
    in_flight: Mutex<()>,
}

impl WatchGate {
    fn open() -> Arc<Self> {
        let gate = Self::default();
        gate.live.store(true, Ordering::SeqCst);
        Arc::new(gate)
    }

    /// Runs `f` unless the gate was closed. Returns `false` if closed.
    fn deliver(&self, id: WatchId, f: impl FnOnce()) -> bool {
        let _in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.live.load(Ordering::SeqCst) {
            return false;
        }
        let outer = IN_CALLBACK.with(|c| c.replace(Some(id)));
        f();
        IN_CALLBACK.with(|c| c.set(outer));
        true
    }

    fn close(&self, id: WatchId) {
        self.live.store(false, Ordering::SeqCst);
        // Clearing a watch from its own callback must not wait on itself.
        if IN_CALLBACK.with(Cell::get) != Some(id) {
            drop(self.in_flight.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

struct ActiveWatch {
    task: JoinHandle<()>,
    gate: Arc<WatchGate>,
}

impl ActiveWatch {
    fn stop(self, id: WatchId) {
        self.gate.close(id);
        self.task.abort();
    }
}

/// Cancellable position sampling over a [`LocationProvider`].
pub struct PositionStream {
    provider: Arc<dyn LocationProvider>,
    defaults: PositionOptions,
    last_fix: Arc<Mutex<Option<Position>>>,
    watches: Mutex<BTreeMap<WatchId, ActiveWatch>>,
    next_id: AtomicU64,
}

impl PositionStream {
    #[must_use]
    pub fn new(provider: Arc<dyn LocationProvider>, defaults: PositionOptions) -> Self {
        Self {
            provider,
            defaults,
            last_fix: Arc::new(Mutex::new(None)),
            watches: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns a single fix.
    ///
    /// A cached fix younger than `maximum_age` is returned without touching
    /// the sensor. Otherwise the sensor is queried and the request fails
    /// with [`PositionError::Timeout`] if no fix arrives within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the sensor's [`PositionError`] unchanged, or
    /// [`PositionError::Timeout`].
    pub async fn get_current_position(
        &self,
        options: Option<PositionOptions>,
    ) -> Result<Position, PositionError> {
        let options = options.unwrap_or(self.defaults);

        if let Some(cached) = self.cached_fix()
            && cached.age_at(Utc::now()) <= options.maximum_age
        {
            log::trace!("Serving cached fix from {}", cached.timestamp);
            return Ok(cached);
        }

        let fix = tokio::time::timeout(options.timeout, self.provider.current_position(&options))
            .await
            .map_err(|_| {
                log::warn!("No position fix within {:?}", options.timeout);
                PositionError::Timeout
            })??;

        self.remember(&fix);
        Ok(fix)
    }

    /// Starts a watch, invoking `callback` for every sample that passes the
    /// distance and interval filters. Sensor errors are passed through as
    /// `Err`; a fatal error ends the watch and releases its subscription.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError`] if the sensor subscription cannot be
    /// opened (e.g. permission denied).
    pub fn watch<F>(
        &self,
        mut callback: F,
        options: Option<PositionOptions>,
    ) -> Result<WatchId, PositionError>
    where
        F: FnMut(Sample) + Send + 'static,
    {
        let options = options.unwrap_or(self.defaults);
        let mut subscription = self.provider.subscribe(&options)?;
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let last_fix = Arc::clone(&self.last_fix);
        let gate = WatchGate::open();
        let task_gate = Arc::clone(&gate);

        let task = tokio::spawn(async move {
            let mut filter = SampleFilter::new(&options);

            while let Some(sample) = subscription.recv().await {
                match sample {
                    Ok(fix) => {
                        if filter.accept(&fix) {
                            *last_fix.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(fix.clone());
                            if !task_gate.deliver(id, || callback(Ok(fix))) {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let fatal = e.is_fatal();
                        log::warn!("Watch {id:?} sensor error: {e}");
                        if !task_gate.deliver(id, || callback(Err(e))) || fatal {
                            break;
                        }
                    }
                }
            }

            log::debug!("Watch {id:?} ended, releasing sensor subscription");
        });

        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ActiveWatch { task, gate });
        log::debug!("Started watch {id:?}");

        Ok(id)
    }

    /// Stops a watch. No callback for `id` runs after this returns; a
    /// callback already running on another thread is waited for.
    ///
    /// Returns `false` if the handle was unknown or already cleared.
    pub fn clear_watch(&self, id: WatchId) -> bool {
        let watch = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        watch.is_some_and(|watch| {
            watch.stop(id);
            log::debug!("Cleared watch {id:?}");
            true
        })
    }

    /// Stops every active watch.
    pub fn stop_all(&self) {
        let tasks = std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner));
        if !tasks.is_empty() {
            log::debug!("Stopping {} watch(es)", tasks.len());
        }
        for (id, watch) in tasks {
            watch.stop(id);
        }
    }

    /// Number of watches that have not been cleared.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn cached_fix(&self) -> Option<Position> {
        self.last_fix
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, fix: &Position) {
        *self.last_fix.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix.clone());
    }
}

impl Drop for PositionStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}
