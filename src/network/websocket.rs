//! WebSocket transport.
//!
//! Runs the socket on the ambient Tokio runtime and hands frames to the
//! frame-driven side through unbounded channels, so `poll_event` never blocks.
//! The task owns both halves of the stream: it forwards outgoing frames and
//! reports incoming frames, close and errors as [`TransportEvent`]s.

use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportError, TransportEvent};

/// Handshake deadline before the attempt is reported as an error.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side WebSocket transport.
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outgoing_tx: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Create a transport for `url` (`ws://` or `wss://`). Does not connect.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            url: url.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            events_rx: None,
            outgoing_tx: None,
            task: None,
        })
    }

    /// Override the handshake deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint url.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// True while the socket task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        // Reopening replaces any previous session.
        self.close();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let url = self.url.clone();

        self.task = Some(runtime.spawn(run_socket(url, self.connect_timeout, events_tx, outgoing_rx)));
        self.events_rx = Some(events_rx);
        self.outgoing_tx = Some(outgoing_tx);
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.outgoing_tx.as_ref().ok_or(TransportError::NotOpen)?;
        tx.send(Message::Text(frame)).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.outgoing_tx = None;
        self.events_rx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.as_mut()?.try_recv().ok()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Socket task: connect, then pump frames both ways until either side ends.
async fn run_socket(
    url: String,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            warn!("WebSocket connect to {} failed: {}", url, e);
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
        Err(_) => {
            warn!("WebSocket connect to {} timed out after {:?}", url, connect_timeout);
            let _ = events.send(TransportEvent::Error(format!(
                "connect timed out after {}ms",
                connect_timeout.as_millis()
            )));
            return;
        }
    };

    info!("WebSocket connected to {}", url);
    let _ = events.send(TransportEvent::Opened);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events.send(TransportEvent::Message(text)).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!("Dropping non-UTF-8 binary frame from {}", url),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        debug!("Server {} closed connection: {:?}", url, reason);
                        let _ = events.send(TransportEvent::Closed { reason });
                        break;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed { reason: None });
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error from {}: {}", url, e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    // Ping/Pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                }
            }
            out = outgoing.recv() => {
                match out {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            warn!("WebSocket write to {} failed: {}", url, e);
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    None => {
                        // Local close.
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    debug!("WebSocket task for {} ended", url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_event(t: &mut WebSocketTransport) -> TransportEvent {
        for _ in 0..200 {
            if let Some(ev) = t.poll_event() {
                return ev;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no transport event within 2s");
    }

    /// Echo server that handles a single client.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                } else if msg.is_close() {
                    break;
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn test_rejects_non_ws_url() {
        assert!(matches!(
            WebSocketTransport::new("http://example.com"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_open_without_runtime_fails() {
        let mut t = WebSocketTransport::new("ws://127.0.0.1:1").unwrap();
        assert!(matches!(t.open(), Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let mut t = WebSocketTransport::new("ws://127.0.0.1:1").unwrap();
        assert!(matches!(t.send("x".into()), Err(TransportError::NotOpen)));
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let url = spawn_echo_server().await;
        let mut t = WebSocketTransport::new(&url).unwrap();
        t.open().unwrap();

        assert_eq!(next_event(&mut t).await, TransportEvent::Opened);

        t.send(r#"{"type":"chat","data":{},"timestamp":1}"#.into()).unwrap();
        assert_eq!(
            next_event(&mut t).await,
            TransportEvent::Message(r#"{"type":"chat","data":{},"timestamp":1}"#.into())
        );

        t.close();
        assert!(t.poll_event().is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut t = WebSocketTransport::new(&format!("ws://{}", addr)).unwrap();
        t.open().unwrap();
        assert!(matches!(next_event(&mut t).await, TransportEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        // Accepts TCP but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut t = WebSocketTransport::new(&format!("ws://{}", addr))
            .unwrap()
            .with_connect_timeout(Duration::from_millis(200));
        t.open().unwrap();
        match next_event(&mut t).await {
            TransportEvent::Error(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout error, got {:?}", other),
        }
        server.abort();
    }

    #[tokio::test]
    async fn test_close_stops_socket_task() {
        let url = spawn_echo_server().await;
        let mut t = WebSocketTransport::new(&url).unwrap();
        t.open().unwrap();
        assert_eq!(next_event(&mut t).await, TransportEvent::Opened);
        assert!(t.is_running());

        t.close();
        assert!(!t.is_running());
        assert!(matches!(t.send("x".into()), Err(TransportError::NotOpen)));
    }
}
