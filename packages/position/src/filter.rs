//! Distance and interval gating for watch samples.

use geo::{Distance, Haversine, Point};
use patrol_position_models::{Position, PositionOptions};

/// Great-circle distance between two fixes in meters.
#[must_use]
pub fn distance_m(a: &Position, b: &Position) -> f64 {
    Haversine.distance(
        Point::new(a.longitude, a.latitude),
        Point::new(b.longitude, b.latitude),
    )
}

/// Decides which raw sensor samples a watcher gets to see.
///
/// The first sample always passes. After that a sample passes only once
/// both the minimum interval (measured on sample timestamps) has elapsed
/// and the device has moved at least the distance filter since the last
/// delivered sample.
#[derive(Debug)]
pub struct SampleFilter {
    distance_filter_m: f64,
    interval: chrono::Duration,
    last_delivered: Option<Position>,
}

impl SampleFilter {
    #[must_use]
    pub fn new(options: &PositionOptions) -> Self {
        Self {
            distance_filter_m: options.distance_filter_m.max(0.0),
            interval: chrono::Duration::from_std(options.interval)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            last_delivered: None,
        }
    }

    /// Returns `true` and records the sample if it should be delivered.
    pub fn accept(&mut self, sample: &Position) -> bool {
        let pass = self.last_delivered.as_ref().is_none_or(|last| {
            sample.timestamp - last.timestamp >= self.interval
                && distance_m(last, sample) >= self.distance_filter_m
        });

        if pass {
            self.last_delivered = Some(sample.clone());
        }
        pass
    }
}
