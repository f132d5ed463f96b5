//! Connection Manager
//!
//! Owns one transport session and its lifecycle: connect, disconnect,
//! reconnect with exponential backoff, heartbeat, and the outbound queue
//! used while the session is down. Knows nothing about game semantics.
//!
//! ## Driving it
//!
//! The manager is frame-driven. Call [`ConnectionManager::poll`] once per
//! frame: it drains transport events, fires due timers (heartbeat,
//! reconnect) and returns the inbound envelopes. Lifecycle changes are
//! reported to subscribers as [`ConnectionEvent`]s, always after the internal
//! lock is released, so a callback may call back into the manager.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --Opened--> Connected
//!      ^                          |                      |
//!      |                      failure               drop / error
//!      |                          v                      v
//!      +------disconnect()---- Error <--backoff-- Disconnected (unexpected)
//! ```
//!
//! `Connected` is only ever entered from `Connecting`.

use std::collections::VecDeque;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::env_parse;
use crate::core::clock::{Millis, SharedClock};
use crate::core::listeners::{Listeners, Subscription};
use crate::network::protocol::Envelope;
use crate::network::transport::{Transport, TransportEvent, TransportRegistry, WEBSOCKET};

/// Largest backoff exponent; keeps the delay computation from overflowing.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session, not trying.
    Disconnected,
    /// Transport is opening.
    Connecting,
    /// Session established.
    Connected,
    /// Last attempt failed; a reconnect may be pending.
    Error,
}

/// Relative importance of an outbound message. Only consulted when the
/// outbound queue overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// Dropped first.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Dropped last.
    High,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Endpoint url.
    pub url: String,
    /// Registered transport name.
    pub transport: String,
    /// Heartbeat period while connected (0 disables).
    pub heartbeat_interval_ms: Millis,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: Millis,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Outbound queue capacity while not connected.
    pub max_queue_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            transport: WEBSOCKET.into(),
            heartbeat_interval_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            max_queue_len: 1_024,
        }
    }
}

impl ConnectionConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: std::env::var("RUNE_SYNC_URL").unwrap_or(d.url),
            transport: std::env::var("RUNE_SYNC_TRANSPORT").unwrap_or(d.transport),
            heartbeat_interval_ms: env_parse("RUNE_SYNC_HEARTBEAT_MS", d.heartbeat_interval_ms),
            reconnect_base_delay_ms: env_parse("RUNE_SYNC_RECONNECT_BASE_MS", d.reconnect_base_delay_ms),
            max_reconnect_attempts: env_parse("RUNE_SYNC_RECONNECT_ATTEMPTS", d.max_reconnect_attempts),
            max_queue_len: env_parse("RUNE_SYNC_QUEUE_CAP", d.max_queue_len),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Millis {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.reconnect_base_delay_ms.saturating_mul(1 << shift)
    }
}

/// A message waiting to be transmitted. Never mutated once queued.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Envelope type.
    pub msg_type: String,
    /// Envelope data.
    pub payload: Value,
    /// When `send` was called.
    pub timestamp: Millis,
    /// Overflow priority.
    pub priority: MessagePriority,
}

impl OutboundMessage {
    fn to_envelope(&self) -> Envelope {
        Envelope::new(self.msg_type.clone(), self.payload.clone(), self.timestamp)
    }
}

/// Errors surfaced through [`ConnectionEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Misconfiguration; not retried.
    #[error("configuration error: {0}")]
    Config(String),
    /// Transport failure; retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// State moved `from` -> `to`.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// Session established and queue flushed.
    Connected,
    /// Session ended. `unexpected` is false only for `disconnect()`.
    Disconnected {
        /// True when the transport dropped on its own.
        unexpected: bool,
    },
    /// Connect failure, mid-session error, or configuration error.
    Error(ConnectionError),
    /// A reconnect timer was armed.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay until the attempt.
        delay_ms: Millis,
    },
    /// Attempt ceiling reached; staying in `Error` until `connect()`.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Frames handed to the transport.
    pub sent: u64,
    /// Messages queued while not connected.
    pub queued: u64,
    /// Messages discarded by queue overflow.
    pub dropped: u64,
    /// Transmit attempts the transport rejected.
    pub send_failures: u64,
    /// Application envelopes received.
    pub received: u64,
    /// Inbound frames that failed to parse.
    pub malformed: u64,
    /// Reconnect attempts started.
    pub reconnects: u64,
    /// Heartbeats sent.
    pub heartbeats: u64,
}

struct ConnectionInner {
    config: ConnectionConfig,
    registry: TransportRegistry,
    clock: SharedClock,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    queue: VecDeque<OutboundMessage>,
    reconnect_attempts: u32,
    reconnect_at: Option<Millis>,
    next_heartbeat_at: Option<Millis>,
    gave_up: bool,
    stats: ConnectionStats,
}

type Events = Vec<ConnectionEvent>;

impl ConnectionInner {
    fn set_state(&mut self, to: ConnectionState, events: &mut Events) {
        let from = self.state;
        if from != to {
            debug!("connection state {:?} -> {:?}", from, to);
            self.state = to;
            events.push(ConnectionEvent::StateChanged { from, to });
        }
    }

    fn connect(&mut self, explicit: bool, events: &mut Events) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("connect() ignored while {:?}", self.state);
            return;
        }

        if explicit {
            self.reconnect_at = None;
            if self.gave_up {
                self.gave_up = false;
                self.reconnect_attempts = 0;
            }
        }

        if let Some(mut stale) = self.transport.take() {
            stale.close();
        }

        self.set_state(ConnectionState::Connecting, events);
        info!("Connecting to {} via {}", self.config.url, self.config.transport);

        let mut transport = match self.registry.create(&self.config.transport, &self.config.url) {
            Ok(t) => t,
            Err(e) if e.is_config() => {
                error!("Cannot connect: {}", e);
                self.set_state(ConnectionState::Error, events);
                events.push(ConnectionEvent::Error(ConnectionError::Config(e.to_string())));
                return;
            }
            Err(e) => {
                self.fail(ConnectionError::Transport(e.to_string()), events);
                return;
            }
        };

        match transport.open() {
            Ok(()) => self.transport = Some(transport),
            Err(e) => self.fail(ConnectionError::Transport(e.to_string()), events),
        }
    }

    fn disconnect(&mut self, events: &mut Events) {
        self.reconnect_at = None;
        self.next_heartbeat_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        let was = self.state;
        self.set_state(ConnectionState::Disconnected, events);
        if was != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.config.url);
            events.push(ConnectionEvent::Disconnected { unexpected: false });
        }
    }

    /// Failed connect attempt.
    fn fail(&mut self, err: ConnectionError, events: &mut Events) {
        warn!("Connection failure: {}", err);
        self.next_heartbeat_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.set_state(ConnectionState::Error, events);
        events.push(ConnectionEvent::Error(err));
        self.schedule_reconnect(events);
    }

    fn schedule_reconnect(&mut self, events: &mut Events) {
        if self.reconnect_at.is_some() {
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                self.config.url, self.reconnect_attempts
            );
            self.gave_up = true;
            self.set_state(ConnectionState::Error, events);
            events.push(ConnectionEvent::GaveUp {
                attempts: self.reconnect_attempts,
            });
            return;
        }

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        let delay_ms = self.config.backoff_delay(attempt);
        self.reconnect_at = Some(self.clock.now_ms().saturating_add(delay_ms));
        info!("Reconnect attempt {} in {}ms", attempt, delay_ms);
        events.push(ConnectionEvent::ReconnectScheduled { attempt, delay_ms });
    }

    fn on_opened(&mut self, events: &mut Events) {
        if self.state != ConnectionState::Connecting {
            debug!("ignoring Opened while {:?}", self.state);
            return;
        }
        self.set_state(ConnectionState::Connected, events);
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.gave_up = false;
        if self.config.heartbeat_interval_ms > 0 {
            self.next_heartbeat_at = Some(
                self.clock.now_ms().saturating_add(self.config.heartbeat_interval_ms),
            );
        }

        let pending = self.queue.len();
        while let Some(msg) = self.queue.pop_front() {
            self.transmit(&msg);
        }
        info!("Connected to {} ({} queued messages flushed)", self.config.url, pending);
        events.push(ConnectionEvent::Connected);
    }

    fn on_closed(&mut self, reason: Option<String>, events: &mut Events) {
        match self.state {
            ConnectionState::Connecting => {
                let why = reason.unwrap_or_else(|| "closed during handshake".into());
                self.fail(ConnectionError::Transport(why), events);
            }
            ConnectionState::Connected => {
                warn!("Connection to {} dropped: {:?}", self.config.url, reason);
                self.on_dropped(None, events);
            }
            // Already torn down locally.
            ConnectionState::Disconnected | ConnectionState::Error => {}
        }
    }

    /// A live session ended without a local `disconnect`, either closed by
    /// the peer or broken by a transport error.
    fn on_dropped(&mut self, error: Option<ConnectionError>, events: &mut Events) {
        self.next_heartbeat_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.set_state(ConnectionState::Disconnected, events);
        events.push(ConnectionEvent::Disconnected { unexpected: true });
        if let Some(err) = error {
            events.push(ConnectionEvent::Error(err));
        }
        self.schedule_reconnect(events);
    }

    fn handle_transport_event(&mut self, event: TransportEvent, inbound: &mut Vec<Envelope>, events: &mut Events) {
        match event {
            TransportEvent::Opened => self.on_opened(events),
            TransportEvent::Message(frame) => {
                #[cfg(feature = "debug-tracing")]
                tracing::trace!("<- {}", frame);
                match Envelope::from_json(&frame) {
                    Ok(envelope) if envelope.is_ping() => debug!("heartbeat received"),
                    Ok(envelope) => {
                        self.stats.received += 1;
                        inbound.push(envelope);
                    }
                    Err(e) => {
                        self.stats.malformed += 1;
                        warn!("Skipping malformed inbound message: {}", e);
                    }
                }
            }
            TransportEvent::Closed { reason } => self.on_closed(reason, events),
            TransportEvent::Error(msg) => match self.state {
                ConnectionState::Connecting => self.fail(ConnectionError::Transport(msg), events),
                ConnectionState::Connected => {
                    warn!("Connection to {} broke: {}", self.config.url, msg);
                    self.on_dropped(Some(ConnectionError::Transport(msg)), events);
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            },
        }
    }

    fn transmit(&mut self, msg: &OutboundMessage) {
        let frame = match msg.to_envelope().to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize '{}' message: {}", msg.msg_type, e);
                return;
            }
        };
        #[cfg(feature = "debug-tracing")]
        tracing::trace!("-> {}", frame);

        let Some(transport) = self.transport.as_mut() else {
            self.stats.send_failures += 1;
            warn!("No transport for '{}' message; dropped", msg.msg_type);
            return;
        };
        match transport.send(frame) {
            Ok(()) => self.stats.sent += 1,
            Err(e) => {
                self.stats.send_failures += 1;
                warn!("Failed to send '{}' message: {}", msg.msg_type, e);
            }
        }
    }

    fn enqueue(&mut self, msg: OutboundMessage) {
        let cap = self.config.max_queue_len;
        if self.queue.len() >= cap {
            let lowest = self.queue.iter().map(|m| m.priority).min();
            match lowest {
                Some(lowest) if lowest <= msg.priority => {
                    if let Some(idx) = self.queue.iter().position(|m| m.priority == lowest) {
                        if let Some(evicted) = self.queue.remove(idx) {
                            warn!("Outbound queue full; dropped queued '{}' message", evicted.msg_type);
                        }
                    }
                }
                _ => {
                    self.stats.dropped += 1;
                    warn!("Outbound queue full; dropped new '{}' message", msg.msg_type);
                    return;
                }
            }
            self.stats.dropped += 1;
        }
        self.stats.queued += 1;
        self.queue.push_back(msg);
    }

    fn send(&mut self, msg: OutboundMessage) {
        if self.state == ConnectionState::Connected {
            self.transmit(&msg);
        } else {
            self.enqueue(msg);
        }
    }

    fn poll(&mut self, inbound: &mut Vec<Envelope>, events: &mut Events) {
        while let Some(event) = self.transport.as_mut().and_then(|t| t.poll_event()) {
            self.handle_transport_event(event, inbound, events);
        }

        let now = self.clock.now_ms();

        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.reconnect_at = None;
                self.stats.reconnects += 1;
                info!("Reconnect attempt {} starting", self.reconnect_attempts);
                self.connect(false, events);
            }
        }

        if self.state == ConnectionState::Connected {
            if let Some(at) = self.next_heartbeat_at {
                if now >= at {
                    let ping = OutboundMessage {
                        msg_type: crate::network::protocol::message_types::PING.into(),
                        payload: Value::Object(Default::default()),
                        timestamp: now,
                        priority: MessagePriority::Low,
                    };
                    self.transmit(&ping);
                    self.stats.heartbeats += 1;
                    self.next_heartbeat_at = Some(now.saturating_add(self.config.heartbeat_interval_ms));
                }
            }
        }
    }
}

/// Handle to a connection. Clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<ConnectionInner>>,
    listeners: Listeners<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a manager. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, registry: TransportRegistry, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionInner {
                config,
                registry,
                clock,
                state: ConnectionState::Disconnected,
                transport: None,
                queue: VecDeque::new(),
                reconnect_attempts: 0,
                reconnect_at: None,
                next_heartbeat_at: None,
                gave_up: false,
                stats: ConnectionStats::default(),
            })),
            listeners: Listeners::new(),
        }
    }

    fn dispatch(&self, events: Events) {
        for event in events {
            self.listeners.notify(&event);
        }
    }

    /// Open the session. No-op while connecting or connected.
    #[instrument(skip(self))]
    pub fn connect(&self) {
        let mut events = Vec::new();
        self.inner.lock().connect(true, &mut events);
        self.dispatch(events);
    }

    /// Close the session on purpose. Cancels heartbeat and any pending
    /// reconnect before returning; never schedules a reconnect.
    pub fn disconnect(&self) {
        let mut events = Vec::new();
        self.inner.lock().disconnect(&mut events);
        self.dispatch(events);
    }

    /// Send now if connected, otherwise queue. Never fails to the caller.
    pub fn send(&self, msg_type: &str, payload: Value) {
        self.send_with_priority(msg_type, payload, MessagePriority::Normal);
    }

    /// [`send`](Self::send) with an explicit overflow priority.
    pub fn send_with_priority(&self, msg_type: &str, payload: Value, priority: MessagePriority) {
        let mut inner = self.inner.lock();
        let msg = OutboundMessage {
            msg_type: msg_type.to_string(),
            payload,
            timestamp: inner.clock.now_ms(),
            priority,
        };
        inner.send(msg);
    }

    /// Process transport events and timers. Returns inbound application envelopes.
    pub fn poll(&self) -> Vec<Envelope> {
        let mut inbound = Vec::new();
        let mut events = Vec::new();
        self.inner.lock().poll(&mut inbound, &mut events);
        self.dispatch(events);
        inbound
    }

    /// Subscribe to every lifecycle event.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }

    /// Called after each successful connect.
    pub fn on_connect<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if matches!(event, ConnectionEvent::Connected) {
                handler();
            }
        })
    }

    /// Called when the session ends; the flag is true for unexpected drops.
    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let ConnectionEvent::Disconnected { unexpected } = event {
                handler(*unexpected);
            }
        })
    }

    /// Called for connect failures, mid-session errors and configuration errors.
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let ConnectionEvent::Error(err) = event {
                handler(err);
            }
        })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// True when connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    /// When the pending reconnect fires, if one is armed.
    pub fn pending_reconnect_at(&self) -> Option<Millis> {
        self.inner.lock().reconnect_at
    }

    /// True after the attempt ceiling was hit.
    pub fn has_given_up(&self) -> bool {
        self.inner.lock().gave_up
    }

    /// True while a heartbeat is scheduled.
    pub fn heartbeat_active(&self) -> bool {
        self.inner.lock().next_heartbeat_at.is_some()
    }

    /// Messages waiting for a session.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Snapshot of the outbound queue, oldest first.
    pub fn queued_messages(&self) -> Vec<OutboundMessage> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Traffic counters.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("url", &inner.config.url)
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("reconnect_attempts", &inner.reconnect_attempts)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
