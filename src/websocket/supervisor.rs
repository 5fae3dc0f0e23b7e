//! Connection supervisor
//!
//! Owns the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Paused
//!       ^             |            |
//!       +-------------+      Disconnecting -> Disconnected
//! ```
//!
//! Connecting, stopping, and reconnecting serialize on one lock around the
//! connection slot. Everything the receive loop asks of the supervisor
//! (pause, resume, reconnect, disconnect handling) goes through one control
//! queue drained by a single task, so the loop never waits on the lock and
//! requests are applied in the order the frames arrived.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use super::account::AccountStreamRegistry;
use super::config::WsConfig;
use super::dispatch::{ControlSignal, Dispatcher};
use super::pending::PendingCommands;
use super::pump::{Pump, PumpListener};
use super::sequence::Sequences;
use super::subscription::{ChannelRegistry, UnsubscribeStart};
use super::transport::{Transport, TransportFactory};
use crate::auth::Credentials;
use crate::error::{Error, Result};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Connected, but the exchange is in maintenance: no trading
    Paused,
    /// Explicit stop in progress
    Disconnecting,
}

impl ConnectionState {
    /// Whether frames can be sent
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Paused)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Paused => write!(f, "Paused"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Maintenance started
    Paused,
    /// Maintenance over, subscriptions refreshed
    Resumed,
    /// The connection dropped unexpectedly; a reconnect follows
    ConnectionLost,
    /// First successful connect after a loss
    ConnectionRestored,
    /// The exchange accepted the credentials; trading is allowed
    Authenticated,
    /// The exchange refused the credentials, with its message
    AuthenticationFailed(String),
}

const EVENT_CAPACITY: usize = 64;

/// Work queued by the receive loop for the control task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Reconnect,
    /// The connection of this generation ended
    Lost(u64),
}

struct Connection {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<Pump>,
    generation: u64,
}

impl Connection {
    fn enqueue(&self, text: String) -> bool {
        self.pump.as_ref().map_or(false, |pump| pump.enqueue(text))
    }
}

/// Shared core of a client: registries, connection slot, and state machine
pub struct Supervisor {
    me: Weak<Supervisor>,
    config: WsConfig,
    factory: Arc<dyn TransportFactory>,
    sequences: Arc<Sequences>,
    credentials: StdRwLock<Option<Credentials>>,
    channels: ChannelRegistry,
    accounts: AccountStreamRegistry,
    pending: Arc<PendingCommands>,
    dispatcher: Dispatcher,
    conn: Mutex<Connection>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: StdMutex<Option<mpsc::UnboundedReceiver<Control>>>,
    authenticated: AtomicBool,
    reconnect_enabled: AtomicBool,
    lost_notified: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: WsConfig,
        factory: Arc<dyn TransportFactory>,
        sequences: Arc<Sequences>,
        credentials: Option<Credentials>,
    ) -> Arc<Self> {
        let channels = ChannelRegistry::new(sequences.clone());
        let accounts = AccountStreamRegistry::new(sequences.clone());
        let pending = Arc::new(PendingCommands::new());
        let dispatcher = Dispatcher::new(channels.clone(), accounts.clone(), pending.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            factory,
            sequences,
            credentials: StdRwLock::new(credentials),
            channels,
            accounts,
            pending,
            dispatcher,
            conn: Mutex::new(Connection {
                state: ConnectionState::Disconnected,
                transport: None,
                pump: None,
                generation: 0,
            }),
            state_tx,
            events_tx,
            control_tx,
            control_rx: StdMutex::new(Some(control_rx)),
            authenticated: AtomicBool::new(false),
            reconnect_enabled: AtomicBool::new(false),
            lost_notified: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn sequences(&self) -> &Arc<Sequences> {
        &self.sequences
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn accounts(&self) -> &AccountStreamRegistry {
        &self.accounts
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace the credentials; authenticates right away if connected
    pub async fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials);

        let conn = self.conn.lock().await;
        if conn.state.is_open() && !self.is_authenticated() {
            self.authenticate(&conn);
        }
    }

    fn set_state(&self, conn: &mut Connection, state: ConnectionState) {
        if conn.state != state {
            tracing::debug!("Connection state {} -> {}", conn.state, state);
            conn.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect and keep reconnecting after unexpected closes. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.reconnect_enabled
            .store(self.config.reconnect.enabled, Ordering::SeqCst);
        self.spawn_control_task();
        self.connect().await
    }

    /// Start draining the control queue; only the first call spawns
    fn spawn_control_task(&self) {
        let receiver = self
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(run_control(self.me.clone(), receiver));
        }
    }

    async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.state != ConnectionState::Disconnected {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        self.set_state(&mut conn, ConnectionState::Connecting);
        let transport = conn
            .transport
            .get_or_insert_with(|| self.factory.create(&self.config))
            .clone();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = transport.connect(events_tx).await {
            self.set_state(&mut conn, ConnectionState::Disconnected);
            tracing::warn!("Connecting to {} failed: {e}", self.config.url);
            return Err(match e {
                Error::Transport(_) => e,
                other => Error::Transport(other.to_string()),
            });
        }

        conn.generation += 1;
        conn.pump = Some(Pump::start(
            conn.generation,
            transport,
            events_rx,
            self.me.clone(),
            self.config.idle_timeout,
        ));
        self.set_state(&mut conn, ConnectionState::Connected);
        tracing::info!("Connected to {}", self.config.url);

        if self.lost_notified.swap(false, Ordering::SeqCst) {
            self.emit(ConnectionEvent::ConnectionRestored);
        }

        self.authenticate(&conn);
        self.resubscribe(&conn).await;
        Ok(())
    }

    /// Queue the auth event if credentials are configured
    fn authenticate(&self, conn: &Connection) {
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(credentials) = credentials else {
            return;
        };

        let frame = credentials
            .auth_request(self.sequences.next_nonce())
            .and_then(|request| Ok(serde_json::to_string(&request)?));
        match frame {
            Ok(text) => {
                conn.enqueue(text);
            }
            Err(e) => {
                tracing::error!("Cannot build auth request: {e}");
                self.emit(ConnectionEvent::AuthenticationFailed(e.to_string()));
            }
        }
    }

    /// Send a subscribe for every request not yet sent on this connection
    async fn resubscribe(&self, conn: &Connection) {
        let claimed = self.channels.sweep().await;
        if !claimed.is_empty() {
            tracing::debug!("Resubscribing {} channels", claimed.len());
        }
        for (stream_id, event) in claimed {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    conn.enqueue(text);
                }
                Err(e) => tracing::error!("Cannot encode subscribe for stream {stream_id}: {e}"),
            }
        }
    }

    /// Stop the pump, close the transport, and forget per-connection state
    async fn teardown(&self, conn: &mut Connection) {
        if let Some(pump) = conn.pump.take() {
            pump.shutdown();
        }
        if let Some(transport) = &conn.transport {
            if let Err(e) = transport.close().await {
                tracing::debug!("Closing transport: {e}");
            }
        }
        self.authenticated.store(false, Ordering::SeqCst);
        self.channels.reset().await;
        self.pending.clear().await;
    }

    /// Disconnect without reconnecting. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.reconnect_enabled.store(false, Ordering::SeqCst);

        let mut conn = self.conn.lock().await;
        if conn.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(&mut conn, ConnectionState::Disconnecting);
        self.teardown(&mut conn).await;
        self.set_state(&mut conn, ConnectionState::Disconnected);
        tracing::info!("Disconnected");
        Ok(())
    }

    /// Stop and drop every subscription, permanently
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.stop().await?;
        self.channels.clear().await;
        self.accounts.clear().await;
        self.pending.clear().await;
        Ok(())
    }

    /// React to the loss of the connection of the given generation
    async fn handle_disconnect(&self, generation: u64) {
        let mut conn = self.conn.lock().await;
        if conn.generation != generation || !conn.state.is_open() {
            return;
        }

        self.teardown(&mut conn).await;
        self.set_state(&mut conn, ConnectionState::Disconnected);
        drop(conn);

        if !self.reconnect_enabled.load(Ordering::SeqCst) {
            tracing::info!("Connection lost, reconnect disabled");
            return;
        }
        if !self.lost_notified.swap(true, Ordering::SeqCst) {
            tracing::warn!("Connection lost");
            self.emit(ConnectionEvent::ConnectionLost);
        }
        self.reconnect().await;
    }

    async fn reconnect(&self) {
        let policy = &self.config.reconnect;
        let mut attempt = 0;
        while policy.should_attempt(attempt) {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            if !self.reconnect_enabled.load(Ordering::SeqCst) || self.is_closed() {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
            attempt += 1;
        }
        tracing::error!("Giving up reconnecting after {attempt} attempts");
    }

    /// Tear down and connect again right away
    async fn force_reconnect(&self) {
        let mut conn = self.conn.lock().await;
        if !conn.state.is_open() {
            return;
        }
        self.teardown(&mut conn).await;
        self.set_state(&mut conn, ConnectionState::Disconnected);
        drop(conn);

        if let Err(e) = self.connect().await {
            tracing::warn!("Reconnect requested by server failed: {e}");
            if self.reconnect_enabled.load(Ordering::SeqCst) {
                if !self.lost_notified.swap(true, Ordering::SeqCst) {
                    self.emit(ConnectionEvent::ConnectionLost);
                }
                self.reconnect().await;
            }
        }
    }

    async fn pause(&self) {
        let mut conn = self.conn.lock().await;
        if conn.state == ConnectionState::Connected {
            self.set_state(&mut conn, ConnectionState::Paused);
            self.emit(ConnectionEvent::Paused);
        }
    }

    /// Unsubscribe every confirmed channel, resubscribe, then resume trading
    async fn resume(&self) {
        let generation = {
            let conn = self.conn.lock().await;
            if !conn.state.is_open() {
                return;
            }
            conn.generation
        };

        let mut waits = Vec::new();
        for (stream_id, chan_id) in self.channels.confirmed_channels().await {
            if let UnsubscribeStart::Send {
                event,
                confirmation,
            } = self.channels.begin_unsubscribe(stream_id, false).await
            {
                if let Err(e) = self.send_json(&event).await {
                    tracing::warn!("Refresh of channel {chan_id} aborted: {e}");
                    return;
                }
                waits.push((chan_id, confirmation));
            }
        }
        for (chan_id, confirmation) in waits {
            if confirmation
                .wait(self.config.subscribe_timeout)
                .await
                .is_err()
            {
                tracing::warn!("No unsubscribe confirmation for channel {chan_id}");
                self.channels.complete_unsubscribe(chan_id).await;
            }
        }

        let mut conn = self.conn.lock().await;
        if conn.generation != generation || !conn.state.is_open() {
            return;
        }
        self.resubscribe(&conn).await;
        if conn.state == ConnectionState::Paused {
            self.set_state(&mut conn, ConnectionState::Connected);
            self.emit(ConnectionEvent::Resumed);
        }
    }

    fn control(&self, command: Control) {
        if self.control_tx.send(command).is_err() {
            tracing::debug!("Control queue closed, dropping {command:?}");
        }
    }

    fn on_signal(&self, signal: ControlSignal) {
        match signal {
            ControlSignal::Authenticated => {
                self.authenticated.store(true, Ordering::SeqCst);
                self.emit(ConnectionEvent::Authenticated);
            }
            ControlSignal::AuthenticationFailed(reason) => {
                self.authenticated.store(false, Ordering::SeqCst);
                self.emit(ConnectionEvent::AuthenticationFailed(reason));
            }
            ControlSignal::Pause => self.control(Control::Pause),
            ControlSignal::Resume => self.control(Control::Resume),
            ControlSignal::Reconnect => self.control(Control::Reconnect),
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue a text frame while connected or paused
    pub async fn send_text(&self, text: String) -> Result<()> {
        let conn = self.conn.lock().await;
        if !conn.state.is_open() || !conn.enqueue(text) {
            return Err(Error::ConnectionNotReady(conn.state));
        }
        Ok(())
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    /// Queue a trading command: requires `Connected` (not paused) and an authenticated session
    pub async fn send_trading(&self, text: String) -> Result<()> {
        let conn = self.conn.lock().await;
        if conn.state != ConnectionState::Connected {
            return Err(Error::ConnectionNotReady(conn.state));
        }
        if !self.is_authenticated() {
            return Err(Error::NoCredentials("session is not authenticated".to_string()));
        }
        if !conn.enqueue(text) {
            return Err(Error::ConnectionNotReady(conn.state));
        }
        Ok(())
    }
}

#[async_trait]
impl PumpListener for Supervisor {
    async fn on_text(&self, text: &str) -> Result<()> {
        if let Some(signal) = self.dispatcher.dispatch(text).await? {
            self.on_signal(signal);
        }
        Ok(())
    }

    fn on_lost(&self, generation: u64, reason: &str) {
        tracing::info!("Connection {generation} ended: {reason}");
        self.control(Control::Lost(generation));
    }
}

/// Apply queued control requests one at a time, in arrival order
async fn run_control(
    supervisor: Weak<Supervisor>,
    mut receiver: mpsc::UnboundedReceiver<Control>,
) {
    while let Some(command) = receiver.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        tracing::trace!("Control {command:?}");
        match command {
            Control::Pause => supervisor.pause().await,
            Control::Resume => supervisor.resume().await,
            Control::Reconnect => supervisor.force_reconnect().await,
            Control::Lost(generation) => supervisor.handle_disconnect(generation).await,
        }
    }
}
