//! A scriptable [`LocationProvider`] that replays fixes pushed by the
//! caller. Used by tests and by the CLI's track replay mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use patrol_position_models::{Position, PositionError, PositionOptions};
use tokio::sync::mpsc;

use crate::provider::{LocationProvider, Sample, SensorSubscription};

#[derive(Default)]
struct SimState {
    current: Option<Sample>,
    subscribers: Vec<mpsc::UnboundedSender<Sample>>,
    permission_denied: bool,
}

/// In-process sensor driven by [`SimulatedProvider::push`].
#[derive(Clone, Default)]
pub struct SimulatedProvider {
    state: Arc<Mutex<SimState>>,
    active: Arc<AtomicUsize>,
}

impl SimulatedProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a sample to every open subscription and makes it the
    /// answer to one-shot requests.
    pub fn push(&self, sample: Sample) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers.retain(|tx| tx.send(sample.clone()).is_ok());
        state.current = Some(sample);
    }

    /// Pushes each fix in `track`, sleeping `pace` between them.
    pub async fn replay(&self, track: Vec<Position>, pace: Duration) {
        log::info!("Replaying {} simulated fixes", track.len());
        for fix in track {
            self.push(Ok(fix));
            tokio::time::sleep(pace).await;
        }
    }

    /// Makes every later request fail with [`PositionError::PermissionDenied`].
    pub fn deny_permission(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .permission_denied = true;
    }

    /// Number of subscriptions that have not been released yet.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationProvider for SimulatedProvider {
    async fn current_position(
        &self,
        _options: &PositionOptions,
    ) -> Result<Position, PositionError> {
        let current = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.permission_denied {
                return Err(PositionError::PermissionDenied);
            }
            state.current.clone()
        };

        match current {
            Some(sample) => sample,
            // No fix yet: behave like a sensor that is still searching.
            None => std::future::pending().await,
        }
    }

    fn subscribe(&self, _options: &PositionOptions) -> Result<SensorSubscription, PositionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.permission_denied {
            return Err(PositionError::PermissionDenied);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        self.active.fetch_add(1, Ordering::SeqCst);

        let active = Arc::clone(&self.active);
        Ok(SensorSubscription::new(rx, move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
