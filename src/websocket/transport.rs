//! Transport abstraction and the tungstenite-backed implementation
//!
//! The client core only ever deals in text frames. A [`Transport`] connects,
//! sends text, and reports everything that happens on the wire as
//! [`TransportEvent`]s through the channel handed to `connect`.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::config::WsConfig;
use crate::error::{Error, Result};

/// Something that happened on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed
    Open,
    /// Inbound text frame
    Message(String),
    /// Protocol-level ping or pong: the peer is alive
    Alive,
    /// Read failure; the connection is unusable
    Error(String),
    /// The connection ended
    Close,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Text-frame transport consumed by the client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake; afterwards every event is reported on `events`
    async fn connect(&self, events: TransportEvents) -> Result<()>;

    async fn send(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Whether a connection existed and has since ended
    fn is_closed(&self) -> bool;
}

/// Creates the transport when a client first connects
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &WsConfig) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&WsConfig) -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self, config: &WsConfig) -> Arc<dyn Transport> {
        self(config)
    }
}

/// Factory for [`TungsteniteTransport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

impl TransportFactory for TungsteniteFactory {
    fn create(&self, config: &WsConfig) -> Arc<dyn Transport> {
        Arc::new(TungsteniteTransport::new(
            config.url.clone(),
            config.heartbeat_interval,
        ))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Connection {
    shutdown_tx: watch::Sender<bool>,
    open: Arc<AtomicBool>,
}

/// `tokio-tungstenite` websocket transport
///
/// Answers server pings and sends its own ping every heartbeat interval.
pub struct TungsteniteTransport {
    url: String,
    heartbeat_interval: Duration,
    sink: Arc<Mutex<Option<WsSink>>>,
    connection: std::sync::Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TungsteniteTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl TungsteniteTransport {
    pub fn new(url: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval,
            sink: Arc::new(Mutex::new(None)),
            connection: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn current_open_flag(&self) -> Option<Arc<AtomicBool>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.open.clone())
    }

    /// Spawn a task to read from the WebSocket stream
    fn spawn_reader_task(
        &self,
        mut stream: WsStream,
        events: TransportEvents,
        open: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let sink = self.sink.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if events.send(TransportEvent::Message(text)).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Some(ref mut s) = *sink.lock().await {
                                    let _ = s.send(Message::Pong(data)).await;
                                }
                                let _ = events.send(TransportEvent::Alive);
                            }
                            Some(Ok(Message::Pong(_))) => {
                                if events.send(TransportEvent::Alive).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::debug!("Server closed the connection: {frame:?}");
                                open.store(false, Ordering::SeqCst);
                                let _ = events.send(TransportEvent::Close);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                open.store(false, Ordering::SeqCst);
                                let _ = events.send(TransportEvent::Error(e.to_string()));
                                let _ = events.send(TransportEvent::Close);
                                break;
                            }
                            None => {
                                open.store(false, Ordering::SeqCst);
                                let _ = events.send(TransportEvent::Close);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn a task to send periodic heartbeat pings
    fn spawn_heartbeat_task(&self, open: Arc<AtomicBool>, mut shutdown_rx: watch::Receiver<bool>) {
        let sink = self.sink.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut heartbeat_interval = interval(period);
            // The first tick completes immediately
            heartbeat_interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = heartbeat_interval.tick() => {
                        if !open.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Some(ref mut s) = *sink.lock().await {
                            if let Err(e) = s.send(Message::Ping(b"ping".to_vec())).await {
                                // The reader task reports the broken connection
                                tracing::debug!("Heartbeat ping failed: {e}");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, events: TransportEvents) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(map_ws_error)?;
        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(true));
        let previous = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Connection {
                shutdown_tx,
                open: open.clone(),
            });
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(true);
        }
        self.closed.store(false, Ordering::SeqCst);

        self.spawn_reader_task(stream, events.clone(), open.clone(), shutdown_rx.clone());
        self.spawn_heartbeat_task(open, shutdown_rx);

        let _ = events.send(TransportEvent::Open);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport("Not connected".to_string()));
        }

        let mut sink_guard = self.sink.lock().await;
        if let Some(ref mut sink) = *sink_guard {
            sink.send(Message::Text(text))
                .await
                .map_err(|e| Error::Transport(format!("Failed to send: {e}")))?;
            Ok(())
        } else {
            Err(Error::Transport("No connection".to_string()))
        }
    }

    async fn close(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.open.store(false, Ordering::SeqCst);
            let _ = connection.shutdown_tx.send(true);
            self.closed.store(true, Ordering::SeqCst);
        }

        let mut sink_guard = self.sink.lock().await;
        if let Some(ref mut sink) = *sink_guard {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *sink_guard = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.current_open_flag()
            .map_or(false, |open| open.load(Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self
                .current_open_flag()
                .map_or(false, |open| !open.load(Ordering::SeqCst))
    }
}

fn map_ws_error(e: WsError) -> Error {
    match e {
        WsError::Io(io_err) => Error::Transport(format!("IO error: {io_err}")),
        WsError::Tls(tls_err) => Error::Transport(format!("TLS error: {tls_err}")),
        WsError::ConnectionClosed => Error::Transport("Connection closed".to_string()),
        WsError::AlreadyClosed => Error::Transport("Already closed".to_string()),
        WsError::Protocol(p) => Error::Transport(format!("Protocol error: {p}")),
        WsError::Url(u) => Error::Transport(format!("URL error: {u}")),
        WsError::Http(resp) => Error::Transport(format!("HTTP error: status {}", resp.status())),
        WsError::HttpFormat(e) => Error::Transport(format!("HTTP format error: {e}")),
        _ => Error::Transport(format!("WebSocket error: {e}")),
    }
}
