//! Task wrapper around [`AlertDispatcher`].
//!
//! All inputs (position samples, channel messages, user actions) are queued
//! on one mpsc channel and applied in order by a single task. Each event is
//! published on a broadcast channel after the state change that produced
//! it, followed by a fresh [`DispatcherSnapshot`] on a watch channel.

use chrono::Utc;
use patrol_alert_models::{AlertBucket, AlertEvent, AlertOrigin};
use patrol_channel::{AlertChannel, ListenerId};
use patrol_geofence_models::GeofenceArea;
use patrol_position_models::{Position, PositionError};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{AlertDispatcher, DispatcherSnapshot, GEOFENCE_TRANSITION_EVENT, ServerEvent};

/// Buffered events per broadcast subscriber before it starts lagging.
const EVENT_BUFFER: usize = 64;

/// Inputs accepted by the dispatcher task.
#[derive(Debug)]
pub enum DispatcherInput {
    Position(Position),
    SensorError(PositionError),
    Server { event: String, payload: Value },
    Acknowledge(String),
    ClearUnread,
    SetZones(Vec<GeofenceArea>),
    Filter {
        bucket: AlertBucket,
        reply: oneshot::Sender<Vec<AlertEvent>>,
    },
    Shutdown,
}

/// Cloneable handle to a running dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    input: mpsc::UnboundedSender<DispatcherInput>,
    events: broadcast::Sender<AlertEvent>,
    snapshot: watch::Receiver<DispatcherSnapshot>,
}

impl DispatcherHandle {
    /// Queues an input. Returns `false` once the task has stopped.
    pub fn send(&self, input: DispatcherInput) -> bool {
        self.input.send(input).is_ok()
    }

    /// A callback suitable for `PositionStream::watch`.
    #[must_use]
    pub fn position_sink(&self) -> impl FnMut(Result<Position, PositionError>) + Send + 'static {
        let input = self.input.clone();
        move |sample| {
            let message = match sample {
                Ok(position) => DispatcherInput::Position(position),
                Err(e) => DispatcherInput::SensorError(e),
            };
            let _ = input.send(message);
        }
    }

    /// Routes the channel's inbound alert events into this dispatcher.
    /// Returns the listener ids so the caller can detach them.
    #[must_use]
    pub fn attach(&self, channel: &AlertChannel) -> Vec<(ServerEvent, ListenerId)> {
        ServerEvent::all()
            .iter()
            .map(|&kind| {
                let input = self.input.clone();
                let id = channel.on(kind.as_ref(), move |payload| {
                    let _ = input.send(DispatcherInput::Server {
                        event: kind.to_string(),
                        payload: payload.clone(),
                    });
                });
                (kind, id)
            })
            .collect()
    }

    /// Receives every event after it has been applied.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DispatcherSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<DispatcherSnapshot> {
        self.snapshot.clone()
    }

    /// Retained events in `bucket`, newest first. Empty once the task has
    /// stopped.
    pub async fn filter(&self, bucket: AlertBucket) -> Vec<AlertEvent> {
        let (reply, rx) = oneshot::channel();
        if !self.send(DispatcherInput::Filter { bucket, reply }) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        self.send(DispatcherInput::Acknowledge(id.to_string()))
    }

    pub fn clear_unread(&self) -> bool {
        self.send(DispatcherInput::ClearUnread)
    }

    /// Stops the task after the inputs already queued.
    pub fn shutdown(&self) -> bool {
        self.send(DispatcherInput::Shutdown)
    }
}

/// Spawns the dispatcher task.
///
/// When `channel` is given, local zone transitions are also emitted on it
/// as [`GEOFENCE_TRANSITION_EVENT`]; they are dropped while disconnected.
#[must_use]
pub fn spawn(
    dispatcher: AlertDispatcher,
    channel: Option<AlertChannel>,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(dispatcher.snapshot());

    let handle = DispatcherHandle {
        input: input_tx,
        events: events_tx.clone(),
        snapshot: snapshot_rx,
    };

    let task = tokio::spawn(run(dispatcher, input_rx, events_tx, snapshot_tx, channel));
    (handle, task)
}

async fn run(
    mut dispatcher: AlertDispatcher,
    mut input: mpsc::UnboundedReceiver<DispatcherInput>,
    events: broadcast::Sender<AlertEvent>,
    snapshot: watch::Sender<DispatcherSnapshot>,
    channel: Option<AlertChannel>,
) {
    log::debug!("Dispatcher started for {}", dispatcher.officer_id());

    while let Some(message) = input.recv().await {
        let produced: Vec<AlertEvent> = match message {
            DispatcherInput::Position(position) => dispatcher.handle_position(&position),
            DispatcherInput::SensorError(e) => {
                log::warn!("Location sensor error: {e}");
                continue;
            }
            DispatcherInput::Server { event, payload } => dispatcher
                .handle_server_message(&event, payload, Utc::now())
                .into_iter()
                .collect(),
            DispatcherInput::Acknowledge(id) => {
                if !dispatcher.acknowledge(&id) {
                    log::debug!("Nothing to acknowledge for {id}");
                }
                Vec::new()
            }
            DispatcherInput::ClearUnread => {
                dispatcher.clear_unread();
                Vec::new()
            }
            DispatcherInput::SetZones(zones) => {
                dispatcher.set_zones(zones);
                Vec::new()
            }
            DispatcherInput::Filter { bucket, reply } => {
                let matching = dispatcher.filter(bucket).into_iter().cloned().collect();
                let _ = reply.send(matching);
                continue;
            }
            DispatcherInput::Shutdown => break,
        };

        for event in produced {
            if event.origin == AlertOrigin::LocalGeofence
                && let Some(channel) = &channel
            {
                channel.emit(GEOFENCE_TRANSITION_EVENT, event.payload.clone());
            }
            // No subscribers is not an error.
            let _ = events.send(event);
        }
        snapshot.send_replace(dispatcher.snapshot());
    }

    log::debug!("Dispatcher stopped for {}", dispatcher.officer_id());
}
