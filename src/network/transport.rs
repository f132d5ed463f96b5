//! Transport boundary.
//!
//! The connection manager only sees a message-oriented [`Transport`]:
//! open / close / send text frames, and a queue of [`TransportEvent`]s that it
//! drains on every poll. Opening is asynchronous; success or failure arrives
//! later as `Opened` or `Error`.
//!
//! Transports are created per connection attempt by name through a
//! [`TransportRegistry`]. `"websocket"` is registered by default; the
//! in-process [`MemoryHub`] relay is used by tests and the demo.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::debug;

use super::websocket::WebSocketTransport;

/// Name of the WebSocket transport in the default registry.
pub const WEBSOCKET: &str = "websocket";

/// Name conventionally used for [`MemoryHub`] transports.
pub const MEMORY: &str = "memory";

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The peer or network closed the session.
    Closed {
        /// Close reason, if the peer gave one.
        reason: Option<String>,
    },
    /// Connection attempt failed or the session broke.
    Error(String),
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No factory registered under this name.
    #[error("unknown transport type: {0}")]
    UnknownTransport(String),

    /// Endpoint could not be used by this transport.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    /// The transport needs a Tokio runtime and none is running.
    #[error("no async runtime available")]
    NoRuntime,

    /// Operation requires an open session.
    #[error("transport not open")]
    NotOpen,

    /// Session already closed.
    #[error("transport closed")]
    Closed,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TransportError {
    /// Configuration errors are not retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::UnknownTransport(_) | Self::InvalidUrl(_))
    }
}

/// A bidirectional, message-oriented channel.
pub trait Transport: Send {
    /// Start opening the session. Completion is reported as an event.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Send one text frame.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the session. No `Closed` event is produced for a local close.
    fn close(&mut self);

    /// Next pending event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

/// Builds a transport for an endpoint url.
pub type TransportFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn Transport>, TransportError> + Send + Sync>;

/// Named transport factories.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Registry with no transports.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in WebSocket transport.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(WEBSOCKET, |url: &str| {
            Ok(Box::new(WebSocketTransport::new(url)?) as Box<dyn Transport>)
        });
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Result<Box<dyn Transport>, TransportError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register a prebuilt factory handle.
    pub fn register_factory(&mut self, name: impl Into<String>, factory: TransportFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Build a transport by name.
    pub fn create(&self, name: &str, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TransportError::UnknownTransport(name.to_string()))?;
        factory(url)
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TransportRegistry").field("transports", &names).finish()
    }
}

// =============================================================================
// IN-PROCESS RELAY
// =============================================================================

type Inbox = Arc<Mutex<VecDeque<TransportEvent>>>;

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, Inbox>,
    refusing: bool,
    echo_to_sender: bool,
    next_anonymous: u64,
}

/// In-process relay: every frame a peer sends is delivered to every other
/// connected peer, like a broadcast server. Used for tests and local play.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing transports registered under `label`.
    pub fn factory(&self, label: impl Into<String>) -> TransportFactory {
        let hub = self.clone();
        let label = label.into();
        Arc::new(move |_url: &str| {
            Ok(Box::new(MemoryTransport::new(hub.clone(), label.clone())) as Box<dyn Transport>)
        })
    }

    /// Transport with an auto-generated label.
    pub fn transport(&self) -> MemoryTransport {
        let label = {
            let mut inner = self.inner.lock();
            inner.next_anonymous += 1;
            format!("anon-{}", inner.next_anonymous)
        };
        MemoryTransport::new(self.clone(), label)
    }

    /// While refusing, `open` reports a connection error.
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.lock().refusing = refusing;
    }

    /// Also deliver each frame back to its sender, like a server that
    /// broadcasts to the whole room.
    pub fn set_echo_to_sender(&self, echo: bool) {
        self.inner.lock().echo_to_sender = echo;
    }

    /// Abruptly close one peer's session. Returns false if it was not connected.
    pub fn drop_peer(&self, label: &str) -> bool {
        let inbox = self.inner.lock().peers.remove(label);
        match inbox {
            Some(inbox) => {
                inbox.lock().push_back(TransportEvent::Closed {
                    reason: Some("connection reset".into()),
                });
                true
            }
            None => false,
        }
    }

    /// Break one peer's session with a transport error instead of a close.
    /// Returns false if it was not connected.
    pub fn fail_peer(&self, label: &str, error: &str) -> bool {
        let inbox = self.inner.lock().peers.remove(label);
        match inbox {
            Some(inbox) => {
                inbox.lock().push_back(TransportEvent::Error(error.to_string()));
                true
            }
            None => false,
        }
    }

    /// Labels of connected peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.lock().peers.keys().cloned().collect();
        labels.sort();
        labels
    }

    fn join(&self, label: &str, inbox: Inbox) -> bool {
        let mut inner = self.inner.lock();
        if inner.refusing {
            return false;
        }
        inner.peers.insert(label.to_string(), inbox);
        true
    }

    fn leave(&self, label: &str, inbox: &Inbox) {
        let mut inner = self.inner.lock();
        // Only remove our own registration; a reconnect may have replaced it.
        if inner.peers.get(label).map(|i| Arc::ptr_eq(i, inbox)).unwrap_or(false) {
            inner.peers.remove(label);
        }
    }

    fn relay(&self, from: &str, frame: &str) -> bool {
        let inner = self.inner.lock();
        if !inner.peers.contains_key(from) {
            return false;
        }
        let echo = inner.echo_to_sender;
        for (label, inbox) in &inner.peers {
            if echo || label != from {
                inbox.lock().push_back(TransportEvent::Message(frame.to_string()));
            }
        }
        true
    }
}

/// One endpoint attached to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    label: String,
    inbox: Inbox,
    open: bool,
}

impl MemoryTransport {
    fn new(hub: MemoryHub, label: String) -> Self {
        Self {
            hub,
            label,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            open: false,
        }
    }

    /// Label this endpoint registers under.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.hub.join(&self.label, self.inbox.clone()) {
            self.open = true;
            self.inbox.lock().push_back(TransportEvent::Opened);
        } else {
            self.inbox
                .lock()
                .push_back(TransportEvent::Error("connection refused".into()));
        }
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if !self.hub.relay(&self.label, &frame) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            debug!("memory transport '{}' closed locally", self.label);
            self.hub.leave(&self.label, &self.inbox);
            self.open = false;
        }
        self.inbox.lock().clear();
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let event = self.inbox.lock().pop_front();
        if matches!(event, Some(TransportEvent::Closed { .. })) {
            self.open = false;
        }
        event
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
