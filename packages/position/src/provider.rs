//! The platform location sensor boundary.

use async_trait::async_trait;
use patrol_position_models::{Position, PositionError, PositionOptions};
use tokio::sync::mpsc;

/// A sample delivered by a sensor subscription.
pub type Sample = Result<Position, PositionError>;

/// Access to the device location sensor.
///
/// Implementations wrap whatever the platform offers (GPS daemon, mobile
/// OS bridge, replayed track). Errors are reported verbatim; callers decide
/// whether to retry.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Requests a single fix from the sensor.
    ///
    /// May never complete if the sensor has no fix; callers bound it with
    /// their own timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError`] if the sensor refuses or fails the request.
    async fn current_position(&self, options: &PositionOptions) -> Result<Position, PositionError>;

    /// Opens a continuous sensor subscription.
    ///
    /// The OS-level subscription stays open until the returned
    /// [`SensorSubscription`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::PermissionDenied`] if location access is
    /// not granted.
    fn subscribe(&self, options: &PositionOptions) -> Result<SensorSubscription, PositionError>;
}

/// An open sensor subscription. Dropping it releases the underlying
/// platform resource.
pub struct SensorSubscription {
    samples: mpsc::UnboundedReceiver<Sample>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SensorSubscription {
    /// Wraps a sample receiver and the action that releases the platform
    /// subscription.
    #[must_use]
    pub fn new(
        samples: mpsc::UnboundedReceiver<Sample>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            samples,
            release: Some(Box::new(release)),
        }
    }

    /// Waits for the next sample. Returns `None` once the sensor side has
    /// closed.
    pub async fn recv(&mut self) -> Option<Sample> {
        self.samples.recv().await
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        self.samples.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for SensorSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSubscription")
            .field("released", &self.release.is_none())
            .finish_non_exhaustive()
    }
}
