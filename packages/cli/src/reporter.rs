//! Throttled position reporting.
//!
//! The watch delivers samples as often as the sensor filters allow. The
//! backend only needs the latest fix every few seconds, so the reporter
//! keeps the newest sample and sends it at most once per interval.

use std::sync::Arc;
use std::time::Duration;

use patrol_geofence::{LocationReport, LocationSink};
use patrol_position::Position;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default spacing between reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Feeds positions to a running reporter. Dropping every clone stops it.
#[derive(Clone)]
pub struct ReporterHandle {
    positions: mpsc::UnboundedSender<Position>,
}

impl ReporterHandle {
    /// Offers a new fix. Returns `false` once the reporter has stopped.
    pub fn offer(&self, position: Position) -> bool {
        self.positions.send(position).is_ok()
    }
}

/// Starts a reporter task for `security_id`.
///
/// The first fix is sent as soon as it arrives. After that, at most one
/// report goes out per `interval`, carrying the newest fix seen. A fix
/// superseded before its turn is never sent. A failed report is logged and
/// not retried beyond what the sink does itself.
///
/// # Panics
///
/// Panics if `interval` is zero.
pub fn spawn(
    sink: Arc<dyn LocationSink>,
    security_id: String,
    geofence_id: Option<String>,
    interval: Duration,
) -> (ReporterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(sink, security_id, geofence_id, interval, rx));
    (ReporterHandle { positions: tx }, task)
}

async fn run(
    sink: Arc<dyn LocationSink>,
    security_id: String,
    geofence_id: Option<String>,
    interval: Duration,
    mut positions: mpsc::UnboundedReceiver<Position>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut latest: Option<Position> = None;
    let mut sent = 0_u64;

    loop {
        tokio::select! {
            sample = positions.recv() => match sample {
                Some(position) => latest = Some(position),
                None => break,
            },
            _ = ticker.tick(), if latest.is_some() => {
                let Some(position) = latest.take() else {
                    continue;
                };
                let report = LocationReport::new(
                    security_id.clone(),
                    geofence_id.clone(),
                    position.latitude,
                    position.longitude,
                );
                match sink.report(&report).await {
                    Ok(()) => sent += 1,
                    Err(e) => log::warn!("Failed to report location for {security_id}: {e}"),
                }
            }
        }
    }

    log::debug!("Location reporter for {security_id} stopped after {sent} report(s)");
}
