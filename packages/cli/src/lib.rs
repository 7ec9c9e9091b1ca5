#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Application context for the `patrol` binary.
//!
//! [`App`] owns one instance of each service (geofence registry, alert
//! channel, dispatcher task and position stream) and wires them together:
//! position samples and server events flow into the dispatcher, and local
//! zone transitions flow back out over the channel. Positions are also
//! reported to the backend through a throttled [`reporter`].

pub mod config;
pub mod reporter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use patrol_alert_models::AlertEvent;
use patrol_channel::{AlertChannel, ChannelError, Transport};
use patrol_dispatcher::service::{self, DispatcherHandle, DispatcherInput};
use patrol_dispatcher::{AlertDispatcher, DispatcherSnapshot};
use patrol_geofence::{
    GeofenceError, GeofenceRegistry, GeofenceSource, HttpGeofenceSource, LocationSink,
};
use patrol_geofence_models::{GeofenceArea, Provenance};
use patrol_position::{LocationProvider, Position, PositionError, PositionStream, Sample, WatchId};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, ConfigError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Geofence(#[from] GeofenceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error("Failed to read track {path}: {source}")]
    TrackIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid track {path}: {source}")]
    TrackJson {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Builds a registry against the configured backend and loads its cache.
///
/// An unreachable backend is not an error here; the registry then serves
/// the fallback table.
///
/// # Errors
///
/// Returns [`GeofenceError`] if the HTTP client cannot be constructed.
pub async fn build_registry(config: &AppConfig) -> Result<GeofenceRegistry, GeofenceError> {
    let source: Arc<dyn GeofenceSource> = Arc::new(HttpGeofenceSource::new(
        &config.api_base_url,
        config.api_token.clone(),
    )?);
    let mut registry = GeofenceRegistry::new(Some(source));
    registry.initialize().await;
    Ok(registry)
}

/// Resolves each assigned zone name. Names that match nothing are logged
/// and skipped.
#[must_use]
pub fn resolve_assigned(registry: &GeofenceRegistry, names: &[String]) -> Vec<GeofenceArea> {
    let mut zones: Vec<GeofenceArea> = Vec::with_capacity(names.len());

    for name in names {
        let Some(resolved) = registry.resolve(name) else {
            log::warn!("Assigned zone {name:?} not found, skipping");
            continue;
        };
        if resolved.provenance == Provenance::Fallback {
            log::info!("Zone {name:?} served from the fallback table");
        }
        if zones.iter().any(|z| z.id == resolved.area.id) {
            log::debug!("Zone {} assigned twice", resolved.area.id);
            continue;
        }
        zones.push(resolved.area);
    }

    zones
}

/// Reads a JSON array of positions for replay.
///
/// # Errors
///
/// Returns [`AppError::TrackIo`] or [`AppError::TrackJson`].
pub fn load_track(path: &Path) -> Result<Vec<Position>, AppError> {
    let text = std::fs::read_to_string(path).map_err(|source| AppError::TrackIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| AppError::TrackJson {
        path: path.to_path_buf(),
        source,
    })
}

/// Hands every event from `events` to `sink` until the dispatcher closes
/// the feed. A lagging receiver logs how many events it missed and keeps
/// going. Returns the total number of skipped events.
pub async fn forward_events(
    mut events: broadcast::Receiver<AlertEvent>,
    mut sink: impl FnMut(AlertEvent),
) -> u64 {
    let mut skipped = 0;
    loop {
        match events.recv().await {
            Ok(event) => sink(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Alert output fell behind, skipped {n} event(s)");
                skipped += n;
            }
            Err(broadcast::error::RecvError::Closed) => return skipped,
        }
    }
}

/// A running alert core.
pub struct App {
    registry: GeofenceRegistry,
    assigned_zones: Vec<String>,
    channel: AlertChannel,
    dispatcher: DispatcherHandle,
    dispatcher_task: JoinHandle<()>,
    reporter_task: Option<JoinHandle<()>>,
    stream: PositionStream,
    watch: WatchId,
}

impl App {
    /// Starts the dispatcher, connects the channel (when an officer id is
    /// configured) and begins watching positions.
    ///
    /// When `reports` is given and the officer id and report interval are
    /// both set, watched positions are also reported to it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`AppError::Channel`] if the socket URL is unusable
    /// * [`AppError::Position`] if the location sensor refuses a watch
    pub fn start(
        config: &AppConfig,
        registry: GeofenceRegistry,
        provider: Arc<dyn LocationProvider>,
        transport: Arc<dyn Transport>,
        reports: Option<Arc<dyn LocationSink>>,
    ) -> Result<Self, AppError> {
        let zones = resolve_assigned(&registry, &config.assigned_zones);
        log::info!(
            "Watching {} zone(s) for officer {:?}",
            zones.len(),
            config.officer_id
        );
        let home_zone = zones.first().map(|zone| zone.id.clone());

        let channel = AlertChannel::new(config.channel(), transport);
        let dispatcher = AlertDispatcher::new(config.officer_id.clone(), zones, config.event_capacity);
        let (handle, dispatcher_task) = service::spawn(dispatcher, Some(channel.clone()));
        let listeners = handle.attach(&channel);
        log::debug!("Attached {} channel listener(s)", listeners.len());

        if config.officer_id.is_empty() {
            log::warn!("No officer id configured, staying offline");
        } else {
            channel.connect(&config.officer_id, &config.role)?;
        }

        let spawned = match (reports, config.report_interval()) {
            (Some(sink), Some(interval)) if !config.officer_id.is_empty() => Some(reporter::spawn(
                sink,
                config.officer_id.clone(),
                home_zone,
                interval,
            )),
            _ => None,
        };
        let (reporter_handle, reporter_task) = spawned.unzip();

        let mut to_dispatcher = handle.position_sink();
        let on_sample = move |sample: Sample| {
            if let (Some(reporter), Ok(position)) = (&reporter_handle, &sample) {
                reporter.offer(position.clone());
            }
            to_dispatcher(sample);
        };

        let stream = PositionStream::new(provider, config.position);
        let watch = match stream.watch(on_sample, None) {
            Ok(watch) => watch,
            Err(e) => {
                channel.disconnect();
                handle.shutdown();
                if let Some(task) = reporter_task {
                    task.abort();
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            registry,
            assigned_zones: config.assigned_zones.clone(),
            channel,
            dispatcher: handle,
            dispatcher_task,
            reporter_task,
            stream,
            watch,
        })
    }

    #[must_use]
    pub const fn channel(&self) -> &AlertChannel {
        &self.channel
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    #[must_use]
    pub const fn registry(&self) -> &GeofenceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.dispatcher.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> DispatcherSnapshot {
        self.dispatcher.snapshot()
    }

    /// Reloads zone definitions from the backend and hands the re-resolved
    /// assigned zones to the dispatcher. Containment of zones that stay
    /// assigned carries over, so the next fix is judged against the new
    /// geometry. Returns the number of zones now tracked.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Geofence`] if the backend fetch fails. The
    /// previous definitions stay in use.
    pub async fn refresh_zones(&mut self) -> Result<usize, AppError> {
        let fetched = self.registry.refresh().await?;
        let zones = resolve_assigned(&self.registry, &self.assigned_zones);
        let tracked = zones.len();
        log::info!("Refreshed {fetched} zone definition(s), tracking {tracked}");
        self.dispatcher.send(DispatcherInput::SetZones(zones));
        Ok(tracked)
    }

    /// Stops sampling, closes the channel and waits for the dispatcher to
    /// drain. Returns the final snapshot.
    pub async fn shutdown(self) -> DispatcherSnapshot {
        self.stream.clear_watch(self.watch);
        if let Some(task) = self.reporter_task {
            task.abort();
        }
        self.channel.disconnect();
        self.dispatcher.shutdown();

        if let Err(e) = self.dispatcher_task.await {
            log::error!("Dispatcher task failed: {e}");
        }

        self.dispatcher.snapshot()
    }
}
