#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Real-time alert channel.
//!
//! [`AlertChannel`] keeps one Socket.IO session open to the alert server
//! for the officer that called [`AlertChannel::connect`]. A background task
//! owns the connection: it performs the Engine.IO handshake, answers pings,
//! dispatches inbound events to registered listeners and writes queued
//! outbound events.
//!
//! When the connection drops, or a connect attempt fails, the task waits
//! [`ChannelConfig::reconnect_delay`] and tries again, at most
//! [`ChannelConfig::max_attempts`] times in a row. After that the channel
//! sits in [`ChannelState::PermanentDisconnect`] until `connect` is called
//! again. A successful connect resets the attempt counter.
//!
//! Lifecycle changes are delivered to listeners like any server event,
//! under the names in [`events`].

pub mod codec;
pub mod transport;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use url::Url;

use crate::codec::{EnginePacket, ROOT_NAMESPACE, SocketPacket, first_arg};
pub use crate::transport::{Connection, Transport, WebSocketTransport};

/// Delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Engine.IO endpoint path.
pub const ENGINE_PATH: &str = "/socket.io/";

/// How long to wait for the server's open and connect packets.
const OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Longest heartbeat window a server may announce. Larger handshakes are
/// rejected as malformed.
const MAX_PING_WINDOW: Duration = Duration::from_secs(600);

/// Names of the lifecycle events emitted to listeners.
pub mod events {
    /// The session is established. Payload: `{"sid": ...}`.
    pub const CONNECTED: &str = "connected";
    /// An established session was lost or closed. Payload: `{"reason": ...}`.
    pub const DISCONNECTED: &str = "disconnected";
    /// A connect attempt failed. Payload: `{"message": ...}`.
    pub const ERROR: &str = "error";
    /// Reconnection gave up. Payload: `{"attempts": ...}`.
    pub const RECONNECT_FAILED: &str = "reconnect_failed";
}

/// Errors produced by the alert channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport failed to open, read or write.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server sent something that is not valid Engine.IO/Socket.IO.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of what was wrong.
        message: String,
    },

    /// The configured server URL is invalid.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Reconnection was exhausted; call `connect` again to retry.
    #[error("Permanently disconnected after {attempts} reconnection attempt(s)")]
    PermanentDisconnect {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// There is no live session.
    #[error("Not connected")]
    NotConnected,
}

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Server URL. Its path, if any, is the Socket.IO namespace.
    pub url: String,
    /// Fixed wait before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Reconnection attempts after the first connect before giving up.
    pub max_attempts: u32,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    PermanentDisconnect,
}

impl ChannelState {
    /// Whether a background task owns the connection.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

/// The current officer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSession {
    /// Server-assigned socket id while connected.
    pub connection_id: Option<String>,
    /// Officer identity sent as the `userId` query parameter.
    pub user_id: String,
    /// Sent as the `role` query parameter.
    pub role: String,
    /// Whether the namespace connect has been acknowledged.
    pub connected: bool,
    /// Reconnection attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

/// Handle returned by [`AlertChannel::on`], used to remove one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Builds the Engine.IO WebSocket URL and Socket.IO namespace for `base`.
///
/// `http`/`https` bases are mapped to `ws`/`wss`. The identity travels in
/// the `userId` and `role` query parameters.
///
/// # Errors
///
/// Returns [`ChannelError::Url`] if `base` does not parse, or
/// [`ChannelError::Protocol`] for a scheme that is not HTTP or WebSocket.
pub fn endpoint(base: &str, user_id: &str, role: &str) -> Result<(Url, String), ChannelError> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ChannelError::Protocol {
                message: format!("unsupported URL scheme '{other}'"),
            });
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(ChannelError::Protocol {
            message: format!("cannot use scheme '{scheme}' for {base}"),
        });
    }

    let namespace = match url.path() {
        "" | "/" => ROOT_NAMESPACE.to_string(),
        path => path.to_string(),
    };

    url.set_path(ENGINE_PATH);
    url.set_fragment(None);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("userId", user_id)
        .append_pair("role", role);

    Ok((url, namespace))
}

struct Shared {
    state: ChannelState,
    session: Option<ChannelSession>,
    listeners: BTreeMap<String, Vec<(ListenerId, Listener)>>,
    next_listener_id: u64,
    /// Bumped on every connect/disconnect; tasks from older generations
    /// must not touch state or deliver events.
    generation: u64,
    namespace: String,
    outbound: Option<mpsc::UnboundedSender<String>>,
    stop: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    /// Held while listeners run, so a teardown can wait out deliveries
    /// that passed the generation check before it.
    delivery: Mutex<()>,
    state_tx: watch::Sender<ChannelState>,
}

thread_local! {
    /// Set while this thread is running channel listeners.
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as delivering until dropped.
struct DeliveryScope {
    outer: bool,
}

impl DeliveryScope {
    fn enter() -> Self {
        Self {
            outer: DELIVERING.with(|d| d.replace(true)),
        }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(self.outer));
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, state: ChannelState) {
        if shared.state != state {
            log::debug!("Alert channel {} -> {state}", shared.state);
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Applies `f` if `generation` is still current.
    fn update(&self, generation: u64, f: impl FnOnce(&Self, &mut Shared)) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation {
            return false;
        }
        f(self, &mut shared);
        true
    }

    /// Delivers `payload` to every listener of `event` if `generation` is
    /// still current. Listeners run without the state lock held.
    fn fire(&self, generation: u64, event: &str, payload: &Value) {
        // A listener that fires again on this thread already holds the gate.
        let _gate = (!DELIVERING.with(Cell::get))
            .then(|| self.delivery.lock().unwrap_or_else(PoisonError::into_inner));
        let _scope = DeliveryScope::enter();

        let listeners: Vec<Listener> = {
            let shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared
                .listeners
                .get(event)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        log::trace!("Delivering '{event}' to {} listener(s)", listeners.len());
        for listener in listeners {
            listener(payload);
        }
    }

    /// Waits for listeners that are already running on other threads.
    /// Called after a teardown; later deliveries fail the generation check.
    fn quiesce(&self) {
        if !DELIVERING.with(Cell::get) {
            drop(self.delivery.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// Stops the current task and clears the session. Returns whether a
    /// session was connected.
    fn teardown(&self, shared: &mut Shared) -> bool {
        let was_connected = shared.state == ChannelState::Connected;
        shared.generation += 1;
        shared.outbound = None;
        shared.session = None;
        if let Some(stop) = shared.stop.take() {
            let _ = stop.send(());
        }
        self.set_state(shared, ChannelState::Disconnected);
        was_connected
    }
}

/// The real-time alert channel. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct AlertChannel {
    inner: Arc<Inner>,
}

impl AlertChannel {
    #[must_use]
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                shared: Mutex::new(Shared {
                    state: ChannelState::Disconnected,
                    session: None,
                    listeners: BTreeMap::new(),
                    next_listener_id: 0,
                    generation: 0,
                    namespace: ROOT_NAMESPACE.to_string(),
                    outbound: None,
                    stop: None,
                }),
                delivery: Mutex::new(()),
                state_tx,
            }),
        }
    }

    /// A channel over real WebSockets.
    #[must_use]
    pub fn websocket(config: ChannelConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransport))
    }

    /// Starts a session for `user_id` with `role`.
    ///
    /// Idempotent: while a session for the same identity is connecting,
    /// connected or reconnecting this does nothing. A different identity
    /// replaces the current session. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the configured URL is unusable.
    pub fn connect(&self, user_id: &str, role: &str) -> Result<(), ChannelError> {
        let (url, namespace) = endpoint(&self.inner.config.url, user_id, role)?;

        let (generation, stop_rx, replaced_connected) = {
            let mut shared = self.inner.lock();

            let mut replaced_connected = false;
            if shared.state.is_live() {
                let same = shared
                    .session
                    .as_ref()
                    .is_some_and(|s| s.user_id == user_id && s.role == role);
                if same {
                    log::debug!("Alert channel already {} for {user_id}", shared.state);
                    return Ok(());
                }
                log::info!("Alert channel switching session to {user_id}");
                replaced_connected = self.inner.teardown(&mut shared);
            }

            shared.generation += 1;
            let (stop_tx, stop_rx) = oneshot::channel();
            shared.stop = Some(stop_tx);
            shared.namespace.clone_from(&namespace);
            shared.session = Some(ChannelSession {
                connection_id: None,
                user_id: user_id.to_string(),
                role: role.to_string(),
                connected: false,
                reconnect_attempts: 0,
            });
            self.inner.set_state(&mut shared, ChannelState::Connecting);
            (shared.generation, stop_rx, replaced_connected)
        };

        self.inner.quiesce();
        if replaced_connected {
            self.notify_disconnected("session replaced");
        }

        log::info!("Connecting alert channel for {user_id} ({role}) on namespace {namespace}");
        tokio::spawn(drive(
            Arc::clone(&self.inner),
            generation,
            url,
            namespace,
            stop_rx,
        ));
        Ok(())
    }

    /// Closes the session and stops reconnecting. Safe to call in any
    /// state.
    ///
    /// Once this returns no listener runs for the old session, including
    /// deliveries already in progress on other threads.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut shared = self.inner.lock();
            self.inner.teardown(&mut shared)
        };
        self.inner.quiesce();
        if was_connected {
            log::info!("Alert channel disconnected by client");
            self.notify_disconnected("io client disconnect");
        }
    }

    /// `disconnected` for a session that has already been torn down.
    fn notify_disconnected(&self, reason: &str) {
        let generation = self.inner.lock().generation;
        self.inner
            .fire(generation, events::DISCONNECTED, &json!({ "reason": reason }));
    }

    /// Registers `listener` for `event`. Several listeners may share one
    /// event name; they run in registration order.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        shared.next_listener_id += 1;
        let id = ListenerId(shared.next_listener_id);
        shared
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes the listener `id` from `event`, or every listener of `event`
    /// when `id` is `None`. Returns how many were removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        let mut shared = self.inner.lock();
        let Some(entries) = shared.listeners.get_mut(event) else {
            return 0;
        };
        let before = entries.len();
        match id {
            Some(id) => entries.retain(|(existing, _)| *existing != id),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        if entries.is_empty() {
            shared.listeners.remove(event);
        }
        removed
    }

    /// Sends `event` with `data` if connected. Returns whether the event
    /// was queued; while disconnected it is dropped.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        match self.try_emit(event, data) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping outbound '{event}': {e}");
                false
            }
        }
    }

    /// Like [`Self::emit`], reporting why an event was not sent.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] or
    /// [`ChannelError::PermanentDisconnect`] when there is no live session.
    pub fn try_emit(&self, event: &str, data: Value) -> Result<(), ChannelError> {
        let shared = self.inner.lock();
        match (shared.state, &shared.outbound) {
            (ChannelState::Connected, Some(outbound)) => {
                let frame = SocketPacket::event(&shared.namespace, event, data).to_frame();
                outbound.send(frame).map_err(|_| ChannelError::NotConnected)
            }
            (ChannelState::PermanentDisconnect, _) => Err(ChannelError::PermanentDisconnect {
                attempts: self.inner.config.max_attempts,
            }),
            _ => Err(ChannelError::NotConnected),
        }
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// A copy of the current session, if any.
    #[must_use]
    pub fn session(&self) -> Option<ChannelSession> {
        self.inner.lock().session.clone()
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    /// `disconnect` was called or the session was replaced.
    Stopped,
    /// The connection failed or dropped.
    Lost { established: bool },
}

/// Connection task: one generation, many connection attempts.
async fn drive(
    inner: Arc<Inner>,
    generation: u64,
    url: Url,
    namespace: String,
    mut stop: oneshot::Receiver<()>,
) {
    let max_attempts = inner.config.max_attempts;
    let delay = inner.config.reconnect_delay;
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let current = inner.update(generation, |inner, shared| {
                inner.set_state(shared, ChannelState::Reconnecting);
                if let Some(session) = shared.session.as_mut() {
                    session.reconnect_attempts = attempt;
                }
            });
            if !current {
                return;
            }

            log::info!("Alert channel reconnecting in {delay:?} (attempt {attempt}/{max_attempts})");
            tokio::select! {
                _ = &mut stop => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        match run_session(&inner, generation, &url, &namespace, &mut stop).await {
            SessionEnd::Stopped => return,
            SessionEnd::Lost { established } => {
                if established {
                    attempt = 0;
                }
            }
        }

        if attempt >= max_attempts {
            let current = inner.update(generation, |inner, shared| {
                shared.stop = None;
                shared.outbound = None;
                inner.set_state(shared, ChannelState::PermanentDisconnect);
            });
            if current {
                log::error!("Alert channel gave up after {attempt} reconnection attempt(s)");
                inner.fire(
                    generation,
                    events::RECONNECT_FAILED,
                    &json!({ "attempts": attempt }),
                );
            }
            return;
        }
        attempt += 1;
    }
}

/// Per-connection protocol state.
struct Session<'a> {
    inner: &'a Inner,
    generation: u64,
    namespace: &'a str,
    engine_sid: Option<String>,
    established: bool,
    /// Server silence tolerated before the connection is considered dead.
    ping_window: Duration,
    deadline: Instant,
    outbound_tx: mpsc::UnboundedSender<String>,
}

enum Step {
    Continue,
    Lost(String),
    Stale,
}

impl Session<'_> {
    async fn on_frame(&mut self, conn: &mut dyn Connection, frame: &str) -> Step {
        let packet = match EnginePacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Ignoring engine frame: {e}");
                return Step::Continue;
            }
        };

        match packet {
            EnginePacket::Open(handshake) => {
                log::debug!(
                    "Engine open sid={} ping={}ms/{}ms",
                    handshake.sid,
                    handshake.ping_interval,
                    handshake.ping_timeout
                );
                let Some(window) = ping_window(handshake.ping_interval, handshake.ping_timeout)
                else {
                    return Step::Lost(format!(
                        "invalid handshake ping {}ms/{}ms",
                        handshake.ping_interval, handshake.ping_timeout
                    ));
                };
                self.ping_window = window;
                self.deadline = Instant::now() + window;
                self.engine_sid = Some(handshake.sid);
                let connect = SocketPacket::Connect {
                    namespace: self.namespace.to_string(),
                    data: None,
                };
                self.send(conn, connect.to_frame()).await
            }
            EnginePacket::Ping(data) => {
                self.deadline = Instant::now() + self.ping_window;
                self.send(conn, EnginePacket::Pong(data).encode()).await
            }
            EnginePacket::Close => Step::Lost("transport close".to_string()),
            EnginePacket::Message(body) => self.on_message(&body),
            EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => Step::Continue,
        }
    }

    fn on_message(&mut self, body: &str) -> Step {
        let packet = match SocketPacket::decode(body) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Ignoring socket packet: {e}");
                return Step::Continue;
            }
        };

        if packet.namespace() != self.namespace {
            log::trace!("Ignoring packet for namespace {}", packet.namespace());
            return Step::Continue;
        }

        match packet {
            SocketPacket::Connect { data, .. } => {
                let sid = data
                    .as_ref()
                    .and_then(|d| d.get("sid"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| self.engine_sid.clone());
                let outbound = self.outbound_tx.clone();
                let current = self.inner.update(self.generation, |inner, shared| {
                    if let Some(session) = shared.session.as_mut() {
                        session.connected = true;
                        session.connection_id.clone_from(&sid);
                        session.reconnect_attempts = 0;
                    }
                    shared.outbound = Some(outbound);
                    inner.set_state(shared, ChannelState::Connected);
                });
                if !current {
                    return Step::Stale;
                }
                self.established = true;
                log::info!("Alert channel connected (sid {})", sid.as_deref().unwrap_or("?"));
                self.inner
                    .fire(self.generation, events::CONNECTED, &json!({ "sid": sid }));
                Step::Continue
            }
            SocketPacket::ConnectError { data, .. } => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| data.to_string(), str::to_string);
                Step::Lost(format!("connect error: {message}"))
            }
            SocketPacket::Disconnect { .. } => Step::Lost("io server disconnect".to_string()),
            SocketPacket::Event { name, args, .. } => {
                if !self.established {
                    log::debug!("Ignoring '{name}' before connect");
                    return Step::Continue;
                }
                log::debug!("Inbound event '{name}'");
                self.inner.fire(self.generation, &name, &first_arg(&args));
                Step::Continue
            }
            SocketPacket::Ack { ack_id, .. } => {
                log::trace!("Ignoring ack {ack_id}");
                Step::Continue
            }
        }
    }

    async fn send(&self, conn: &mut dyn Connection, frame: String) -> Step {
        match conn.send(frame).await {
            Ok(()) => Step::Continue,
            Err(e) => Step::Lost(e.to_string()),
        }
    }
}

/// Heartbeat window announced by a handshake, or `None` if it is zero or
/// longer than [`MAX_PING_WINDOW`].
fn ping_window(interval_ms: u64, timeout_ms: u64) -> Option<Duration> {
    let window = Duration::from_millis(interval_ms.saturating_add(timeout_ms));
    (interval_ms > 0 && window <= MAX_PING_WINDOW).then_some(window)
}

/// Runs one connection attempt until it ends.
async fn run_session(
    inner: &Inner,
    generation: u64,
    url: &Url,
    namespace: &str,
    stop: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let opened = tokio::select! {
        _ = &mut *stop => return SessionEnd::Stopped,
        opened = inner.transport.open(url) => opened,
    };

    let mut conn = match opened {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("Alert channel connect failed: {e}");
            inner.fire(generation, events::ERROR, &json!({ "message": e.to_string() }));
            return SessionEnd::Lost { established: false };
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut session = Session {
        inner,
        generation,
        namespace,
        engine_sid: None,
        established: false,
        ping_window: OPEN_TIMEOUT,
        deadline: Instant::now() + OPEN_TIMEOUT,
        outbound_tx,
    };

    let reason = loop {
        let deadline = session.deadline;
        let established = session.established;

        let step = tokio::select! {
            _ = &mut *stop => {
                if session.established {
                    let bye = SocketPacket::Disconnect { namespace: namespace.to_string() };
                    if let Err(e) = conn.send(bye.to_frame()).await {
                        log::trace!("Failed to send disconnect: {e}");
                    }
                }
                conn.close().await;
                return SessionEnd::Stopped;
            }
            () = tokio::time::sleep_until(deadline) => {
                let reason = if established { "ping timeout" } else { "connect timeout" };
                Step::Lost(reason.to_string())
            }
            Some(frame) = outbound_rx.recv(), if established => {
                session.send(conn.as_mut(), frame).await
            }
            frame = conn.recv() => match frame {
                Some(Ok(frame)) => session.on_frame(conn.as_mut(), &frame).await,
                Some(Err(e)) => Step::Lost(e.to_string()),
                None => Step::Lost("transport close".to_string()),
            },
        };

        match step {
            Step::Continue => {}
            Step::Lost(reason) => break reason,
            Step::Stale => {
                conn.close().await;
                return SessionEnd::Stopped;
            }
        }
    };

    conn.close().await;

    if session.established {
        log::warn!("Alert channel lost: {reason}");
        let current = inner.update(generation, |inner, shared| {
            shared.outbound = None;
            if let Some(s) = shared.session.as_mut() {
                s.connected = false;
                s.connection_id = None;
            }
            inner.set_state(shared, ChannelState::Reconnecting);
        });
        if !current {
            return SessionEnd::Stopped;
        }
        inner.fire(generation, events::DISCONNECTED, &json!({ "reason": reason }));
    } else {
        log::warn!("Alert channel connect failed: {reason}");
        inner.fire(generation, events::ERROR, &json!({ "message": reason }));
    }

    SessionEnd::Lost {
        established: session.established,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    const HANDSHAKE: &str =
        r#"0{"sid":"eng-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;

    struct MemoryConnection {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
            self.outgoing
                .send(frame)
                .map_err(|_| ChannelError::Transport {
                    message: "peer gone".to_string(),
                })
        }

        async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.incoming.close();
        }
    }

    /// Server side of an in-memory connection. Dropping it drops the
    /// connection.
    struct ServerEnd {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ServerEnd {
        fn push(&self, frame: &str) {
            let _ = self.to_client.send(frame.to_string());
        }

        fn received(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.from_client.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    /// Hands out queued connections; refuses once the queue is empty.
    #[derive(Default)]
    struct ScriptedTransport {
        plan: Mutex<VecDeque<Option<MemoryConnection>>>,
        opens: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn refuse(&self) {
            self.plan.lock().unwrap().push_back(None);
        }

        /// Queues a connection whose server has already sent `frames`.
        fn accept_with(&self, frames: &[&str]) -> ServerEnd {
            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            let server = ServerEnd {
                to_client,
                from_client,
            };
            for frame in frames {
                server.push(frame);
            }
            self.plan
                .lock()
                .unwrap()
                .push_back(Some(MemoryConnection { incoming, outgoing }));
            server
        }

        /// Queues a connection that completes the handshake.
        fn accept(&self) -> ServerEnd {
            self.accept_with(&[HANDSHAKE, r#"40{"sid":"sock-1"}"#])
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, url: &Url) -> Result<Box<dyn Connection>, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            match self.plan.lock().unwrap().pop_front().flatten() {
                Some(conn) => Ok(Box::new(conn)),
                None => Err(ChannelError::Transport {
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    fn channel(transport: &Arc<ScriptedTransport>) -> AlertChannel {
        AlertChannel::new(
            ChannelConfig::new("ws://alerts.test"),
            Arc::clone(transport) as Arc<dyn Transport>,
        )
    }

    fn record(channel: &AlertChannel, event: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.on(event, move |payload| sink.lock().unwrap().push(payload.clone()));
        seen
    }

    fn count(seen: &Arc<Mutex<Vec<Value>>>) -> usize {
        seen.lock().unwrap().len()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn endpoint_carries_identity_and_namespace() {
        let (url, namespace) = endpoint("wss://safetnet.site/ws/", "officer-1", "security").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://safetnet.site/socket.io/?EIO=4&transport=websocket&userId=officer-1&role=security"
        );
        assert_eq!(namespace, "/ws/");

        let (url, namespace) = endpoint("https://alerts.test", "a b", "guard").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(namespace, "/");
        assert!(url.as_str().ends_with("userId=a+b&role=guard"));

        assert!(endpoint("ftp://alerts.test", "a", "b").is_err());
        assert!(endpoint("not a url", "a", "b").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_reports_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut server = transport.accept();
        let channel = channel(&transport);
        let connected = record(&channel, events::CONNECTED);

        channel.connect("officer-1", "security").unwrap();
        settle().await;

        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(count(&connected), 1);
        let session = channel.session().unwrap();
        assert!(session.connected);
        assert_eq!(session.connection_id.as_deref(), Some("sock-1"));
        assert_eq!(session.reconnect_attempts, 0);
        assert_eq!(server.received(), vec!["40".to_string()]);
        assert_eq!(
            transport.urls.lock().unwrap()[0],
            "ws://alerts.test/socket.io/?EIO=4&transport=websocket&userId=officer-1&role=security"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::default());
        let _server = transport.accept();
        let channel = channel(&transport);
        let connected = record(&channel, events::CONNECTED);

        channel.connect("officer-1", "security").unwrap();
        channel.connect("officer-1", "security").unwrap();
        settle().await;
        channel.connect("officer-1", "security").unwrap();
        settle().await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(count(&connected), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = Arc::new(ScriptedTransport::default());
        let channel = channel(&transport);
        let errors = record(&channel, events::ERROR);
        let failed = record(&channel, events::RECONNECT_FAILED);

        channel.connect("officer-1", "security").unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(channel.state(), ChannelState::PermanentDisconnect);
        // One initial attempt plus exactly five reconnects.
        assert_eq!(transport.opens(), 6);
        assert_eq!(count(&errors), 6);
        assert_eq!(count(&failed), 1);
        assert_eq!(failed.lock().unwrap()[0]["attempts"], 5);
        assert_eq!(channel.session().unwrap().reconnect_attempts, 5);
        assert!(matches!(
            channel.try_emit("sos", json!({})),
            Err(ChannelError::PermanentDisconnect { attempts: 5 })
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 6, "no attempts after giving up");

        // Only an explicit connect starts over.
        let _server = transport.accept();
        channel.connect("officer-1", "security").unwrap();
        settle().await;
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(channel.session().unwrap().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_attempt_counter() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.refuse();
        transport.refuse();
        let server = transport.accept();
        let channel = channel(&transport);
        let disconnected = record(&channel, events::DISCONNECTED);

        channel.connect("officer-1", "security").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(transport.opens(), 3);
        assert_eq!(channel.session().unwrap().reconnect_attempts, 0);

        drop(server);
        settle().await;
        assert_eq!(count(&disconnected), 1);
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(30)).await;
        // The full budget of five applies again after the drop.
        assert_eq!(transport.opens(), 8);
        assert_eq!(channel.state(), ChannelState::PermanentDisconnect);
        assert_eq!(count(&disconnected), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_server_drop() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.accept();
        let _second = transport.accept();
        let channel = channel(&transport);
        let connected = record(&channel, events::CONNECTED);

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        first.push("1");
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(count(&connected), 2);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_unconditional_and_final() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut server = transport.accept();
        let channel = channel(&transport);
        let disconnected = record(&channel, events::DISCONNECTED);
        let alerts = record(&channel, "new_alert");

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        server.received();

        channel.disconnect();
        settle().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.session().is_none());
        assert_eq!(count(&disconnected), 1);
        assert_eq!(server.received(), vec!["41".to_string()]);

        server.push(r#"42["new_alert",{"id":1}]"#);
        channel.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count(&alerts), 0);
        assert_eq!(count(&disconnected), 1);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_reconnecting_stops_retries() {
        let transport = Arc::new(ScriptedTransport::default());
        let channel = channel(&transport);
        let disconnected = record(&channel, events::DISCONNECTED);

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        channel.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(count(&disconnected), 0, "never connected");
    }

    #[tokio::test(start_paused = true)]
    async fn emit_only_while_connected() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut server = transport.accept();
        let channel = channel(&transport);

        assert!(!channel.emit("geofence_transition", json!({"transition": "enter"})));

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        server.received();

        assert!(channel.emit("geofence_transition", json!({"transition": "enter"})));
        settle().await;
        assert_eq!(
            server.received(),
            vec![r#"42["geofence_transition",{"transition":"enter"}]"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_reach_listeners() {
        let transport = Arc::new(ScriptedTransport::default());
        let server = transport.accept();
        let channel = channel(&transport);
        let alerts = record(&channel, "new_alert");
        let updates = record(&channel, "alert_updated");

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        server.push(r#"42["new_alert",{"id":7,"priority":"high"}]"#);
        server.push(r#"42["alert_updated",{"id":7,"status":"completed"}]"#);
        server.push("42garbage");
        server.push(r#"42/other,["new_alert",{"id":8}]"#);
        settle().await;

        assert_eq!(*alerts.lock().unwrap(), vec![json!({"id": 7, "priority": "high"})]);
        assert_eq!(count(&updates), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn off_removes_one_or_all_listeners() {
        let transport = Arc::new(ScriptedTransport::default());
        let server = transport.accept();
        let channel = channel(&transport);

        let hits = Arc::new(AtomicUsize::new(0));
        let first = {
            let hits = Arc::clone(&hits);
            channel.on("new_alert", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _second = {
            let hits = Arc::clone(&hits);
            channel.on("new_alert", move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };

        channel.connect("officer-1", "security").unwrap();
        settle().await;

        server.push(r#"42["new_alert",{"id":1}]"#);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert_eq!(channel.off("new_alert", Some(first)), 1);
        server.push(r#"42["new_alert",{"id":2}]"#);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 21);

        assert_eq!(channel.off("new_alert", None), 1);
        server.push(r#"42["new_alert",{"id":3}]"#);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(channel.off("new_alert", None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answers_pings() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut server = transport.accept();
        let channel = channel(&transport);

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        server.received();

        server.push("2");
        settle().await;
        assert_eq!(server.received(), vec!["3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let transport = Arc::new(ScriptedTransport::default());
        let _server = transport.accept();
        let channel = channel(&transport);
        let disconnected = record(&channel, events::DISCONNECTED);

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        assert!(channel.is_connected());

        // pingInterval + pingTimeout without a ping.
        tokio::time::sleep(Duration::from_secs(46)).await;
        assert_eq!(count(&disconnected), 1);
        assert_eq!(
            disconnected.lock().unwrap()[0]["reason"],
            json!("ping timeout")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_error_counts_as_failed_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        let _server = transport.accept_with(&[HANDSHAKE, r#"44{"message":"unauthorized"}"#]);
        let channel = channel(&transport);
        let errors = record(&channel, events::ERROR);

        channel.connect("officer-1", "security").unwrap();
        settle().await;

        assert_eq!(channel.state(), ChannelState::Reconnecting);
        assert_eq!(
            errors.lock().unwrap()[0]["message"],
            json!("connect error: unauthorized")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_identity_replaces_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let _first = transport.accept();
        let _second = transport.accept();
        let channel = channel(&transport);
        let disconnected = record(&channel, events::DISCONNECTED);

        channel.connect("officer-1", "security").unwrap();
        settle().await;
        channel.connect("officer-2", "security").unwrap();
        settle().await;

        assert_eq!(transport.opens(), 2);
        assert_eq!(count(&disconnected), 1);
        assert_eq!(channel.session().unwrap().user_id, "officer-2");
        assert!(channel.is_connected());
    }

    #[test]
    fn ping_window_rejects_zero_and_oversized_handshakes() {
        assert_eq!(ping_window(25_000, 20_000), Some(Duration::from_secs(45)));
        assert_eq!(ping_window(0, 20_000), None);
        assert_eq!(ping_window(u64::MAX, 20_000), None);
        assert_eq!(ping_window(600_000, 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_handshake_counts_as_failed_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        let _server = transport.accept_with(&[
            r#"0{"sid":"e","pingInterval":18446744073709551615,"pingTimeout":20000}"#,
        ]);
        let channel = channel(&transport);
        let errors = record(&channel, events::ERROR);
        let failed = record(&channel, events::RECONNECT_FAILED);

        channel.connect("officer-1", "security").unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(channel.state(), ChannelState::PermanentDisconnect);
        assert_eq!(transport.opens(), 6);
        assert_eq!(count(&failed), 1);
        let first = errors.lock().unwrap()[0]["message"].as_str().unwrap().to_string();
        assert!(first.starts_with("invalid handshake"), "got {first}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_waits_for_running_listeners() {
        use std::sync::atomic::AtomicBool;

        let transport = Arc::new(ScriptedTransport::default());
        let server = transport.accept();
        let channel = channel(&transport);

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let finished = Arc::clone(&finished);
            let calls = Arc::clone(&calls);
            channel.on("new_alert", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            });
        }

        channel.connect("officer-1", "security").unwrap();
        server.push(r#"42["new_alert",{"id":1}]"#);
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        channel.disconnect();
        assert!(
            finished.load(Ordering::SeqCst),
            "disconnect returned while a listener was still running"
        );

        server.push(r#"42["new_alert",{"id":2}]"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
