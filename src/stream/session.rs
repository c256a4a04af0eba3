//! Reconnecting streaming-inference session.
//!
//! `StreamSession` owns one logical connection to the inference stream. It
//! opens transports through a [`Connector`], decodes inbound frames into
//! [`StreamEvent`]s, routes them to the registered [`StreamEventHandlers`],
//! and drives the connection state machine:
//!
//! - transport open: status `connected`, attempt counter cleared, heartbeat
//!   started;
//! - transport error: status `error`, error recorded;
//! - transport close: status `disconnected`, heartbeat stopped, and a
//!   fixed-delay reconnect scheduled when the close was abnormal and attempts
//!   remain.
//!
//! All public methods are synchronous and never fail. Handlers run outside
//! the session lock, so a handler may call back into the session.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::reconnect::NORMAL_CLOSURE;
use crate::stream::client::{
    Connector, StreamClientError, TransportEvent, TransportHandle, TransportSender, WsConnector,
};
use crate::stream::config::{StreamConfig, HEARTBEAT_INTERVAL};
use crate::stream::handlers::StreamEventHandlers;
use crate::stream::proto::{ClientMessage, StreamEvent};

const CLIENT_DISCONNECT_REASON: &str = "Client disconnecting";

/// Coarse connection status of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure recorded by a session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport could not be started at all.
    #[error("failed to open stream transport: {0}")]
    Open(String),

    /// The transport reported a failure after it was started.
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Snapshot of a session's connection state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Time of the last successful open.
    pub connected_at: Option<SystemTime>,
    /// Time of the last transport close.
    pub disconnected_at: Option<SystemTime>,
    pub error: Option<ConnectionError>,
    /// Reconnects made since the last successful open.
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            connected_at: None,
            disconnected_at: None,
            error: None,
            reconnect_attempts: 0,
        }
    }
}

/// One logical streaming connection for a single inference id.
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: StreamConfig,
    handlers: StreamEventHandlers,
    connector: Arc<dyn Connector>,
    core: Mutex<SessionCore>,
}

#[derive(Default)]
struct SessionCore {
    state: ConnectionState,
    transport: Option<ActiveTransport>,
    next_generation: u64,
    next_timer_id: u64,
    reconnect_timer: Option<PendingTimer>,
    heartbeat_timer: Option<JoinHandle<()>>,
    pending: VecDeque<Notice>,
    delivering: bool,
}

struct ActiveTransport {
    generation: u64,
    sender: TransportSender,
    open: bool,
    pump: JoinHandle<()>,
}

struct PendingTimer {
    id: u64,
    task: JoinHandle<()>,
}

/// Work deferred until the session lock is released.
enum Notice {
    Status(ConnectionStatus),
    Event(StreamEvent),
}

impl StreamSession {
    /// Creates a session that connects over websockets.
    pub fn new(config: StreamConfig, handlers: StreamEventHandlers) -> Self {
        Self::with_connector(config, handlers, Arc::new(WsConnector))
    }

    /// Creates a session that opens transports through `connector`.
    pub fn with_connector(
        config: StreamConfig,
        handlers: StreamEventHandlers,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                handlers,
                connector,
                core: Mutex::new(SessionCore::default()),
            }),
        }
    }

    /// Convenience constructor for the default endpoint of `inference_id`.
    ///
    /// The base URL comes from `WORKBENCH_WS_BASE_URL` when set.
    pub fn for_inference(
        inference_id: impl Into<String>,
        handlers: StreamEventHandlers,
        user_id: Option<String>,
    ) -> Self {
        let mut config = StreamConfig::from_env(inference_id);
        if let Some(user_id) = user_id {
            config = config.with_user_id(user_id);
        }
        Self::new(config, handlers)
    }

    /// Opens the transport unless one is already live.
    ///
    /// Failures to start the transport are recorded in the state with status
    /// `error`; they are never returned.
    pub fn connect(&self) {
        SessionInner::connect(&self.inner);
    }

    /// Tears the connection down and cancels every pending timer.
    ///
    /// Safe to call repeatedly and before any `connect`.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Asks the peer to cancel the running inference.
    ///
    /// Advisory: the connection stays up until the peer closes it.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Sends a keep-alive ping. Does nothing while not connected.
    pub fn ping(&self) {
        self.inner.ping();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_core().state.status
    }

    /// Returns a copy of the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_core().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("inference_id", &self.inner.config.inference_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let mut core = self.inner.lock_core();
        core.cancel_reconnect_timer();
        core.stop_heartbeat();
        if let Some(transport) = core.transport.take() {
            if let Err(err) = transport
                .sender
                .close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON)
            {
                debug!(event = "stream_close_not_delivered", error = %err);
            }
            transport.pump.abort();
        }
    }
}

impl SessionInner {
    fn lock_core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(self: &Arc<Self>) {
        {
            let mut core = self.lock_core();
            if let Some(transport) = core.transport.as_ref() {
                warn!(
                    event = "stream_connect_ignored",
                    inference_id = self.config.inference_id(),
                    open = transport.open,
                    "stream transport already live"
                );
                return;
            }
            // An explicit connect supersedes any pending reconnect.
            core.cancel_reconnect_timer();

            match self.open_transport(&mut core) {
                Ok(()) => {}
                Err(err) => {
                    error!(
                        event = "stream_open_failed",
                        inference_id = self.config.inference_id(),
                        error = %err
                    );
                    core.state.error = Some(ConnectionError::Open(err.to_string()));
                    core.set_status(ConnectionStatus::Error);
                }
            }
        }
        self.deliver();
    }

    fn open_transport(self: &Arc<Self>, core: &mut SessionCore) -> Result<(), StreamClientError> {
        let url = self.config.endpoint_url()?;
        info!(
            event = "stream_connecting",
            inference_id = self.config.inference_id(),
            url = %url
        );
        core.set_status(ConnectionStatus::Connecting);

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;
        let TransportHandle { sender, mut events } =
            self.connector.open(&url, self.config.credential())?;

        core.next_generation += 1;
        let generation = core.next_generation;
        let session = Arc::downgrade(self);
        let pump = runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                inner.on_transport_event(generation, event);
            }
        });

        core.transport = Some(ActiveTransport {
            generation,
            sender,
            open: false,
            pump,
        });
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut core = self.lock_core();
            info!(
                event = "stream_disconnect",
                inference_id = self.config.inference_id()
            );
            core.cancel_reconnect_timer();
            core.stop_heartbeat();
            if let Some(transport) = core.transport.take() {
                if let Err(err) = transport
                    .sender
                    .close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON)
                {
                    debug!(event = "stream_close_not_delivered", error = %err);
                }
                transport.pump.abort();
            }
            core.set_status(ConnectionStatus::Disconnected);
        }
        self.deliver();
    }

    fn cancel(&self) {
        let core = self.lock_core();
        let Some(sender) = core.open_sender() else {
            warn!(
                event = "stream_cancel_ignored",
                inference_id = self.config.inference_id(),
                "cannot cancel: stream not connected"
            );
            return;
        };
        match send_control(sender, ClientMessage::Cancel) {
            Ok(()) => info!(
                event = "stream_cancel_sent",
                inference_id = self.config.inference_id()
            ),
            Err(err) => error!(
                event = "stream_cancel_failed",
                inference_id = self.config.inference_id(),
                error = %err
            ),
        }
    }

    fn ping(&self) {
        let core = self.lock_core();
        let Some(sender) = core.open_sender() else {
            return;
        };
        match send_control(sender, ClientMessage::Ping) {
            Ok(()) => debug!(
                event = "stream_ping_sent",
                inference_id = self.config.inference_id()
            ),
            Err(err) => error!(
                event = "stream_ping_failed",
                inference_id = self.config.inference_id(),
                error = %err
            ),
        }
    }

    fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        {
            let mut core = self.lock_core();
            let current = core.transport.as_ref().map(|transport| transport.generation);
            if current != Some(generation) {
                debug!(
                    event = "stream_stale_transport_event",
                    generation,
                    current = ?current
                );
                return;
            }

            match event {
                TransportEvent::Open => {
                    info!(
                        event = "stream_connected",
                        inference_id = self.config.inference_id()
                    );
                    if let Some(transport) = core.transport.as_mut() {
                        transport.open = true;
                    }
                    core.state.connected_at = Some(SystemTime::now());
                    core.state.reconnect_attempts = 0;
                    core.set_status(ConnectionStatus::Connected);
                    self.start_heartbeat(&mut core);
                }
                TransportEvent::Message(text) => match StreamEvent::from_text(&text) {
                    Ok(event) => core.pending.push_back(Notice::Event(event)),
                    Err(err) => warn!(
                        event = "stream_frame_dropped",
                        inference_id = self.config.inference_id(),
                        error = %err
                    ),
                },
                TransportEvent::Error(message) => {
                    error!(
                        event = "stream_transport_error",
                        inference_id = self.config.inference_id(),
                        error = %message
                    );
                    core.state.error = Some(ConnectionError::Transport(message));
                    core.set_status(ConnectionStatus::Error);
                }
                TransportEvent::Close { code, reason } => {
                    info!(
                        event = "stream_closed",
                        inference_id = self.config.inference_id(),
                        code,
                        reason = %reason
                    );
                    core.transport = None;
                    core.state.disconnected_at = Some(SystemTime::now());
                    core.set_status(ConnectionStatus::Disconnected);
                    core.stop_heartbeat();

                    let policy = self.config.reconnect_policy();
                    if policy.should_reconnect(code, core.state.reconnect_attempts) {
                        self.schedule_reconnect(&mut core);
                    } else if policy.enabled && code != NORMAL_CLOSURE {
                        debug!(
                            event = "stream_reconnect_skipped",
                            inference_id = self.config.inference_id(),
                            code,
                            attempts = core.state.reconnect_attempts,
                            max_attempts = policy.max_attempts
                        );
                    }
                }
            }
        }
        self.deliver();
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut SessionCore) {
        if core.reconnect_timer.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let policy = self.config.reconnect_policy();
        let attempt = core.state.reconnect_attempts + 1;
        let delay = policy.delay_for_attempt(attempt);
        info!(
            event = "stream_reconnect_scheduled",
            inference_id = self.config.inference_id(),
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );

        core.next_timer_id += 1;
        let id = core.next_timer_id;
        let session = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = session.upgrade() {
                inner.fire_reconnect(id);
            }
        });
        core.reconnect_timer = Some(PendingTimer { id, task });
    }

    fn fire_reconnect(self: &Arc<Self>, id: u64) {
        {
            let mut core = self.lock_core();
            match core.reconnect_timer.as_ref() {
                Some(timer) if timer.id == id => {}
                _ => return,
            }
            core.reconnect_timer = None;
            core.state.reconnect_attempts += 1;
        }
        SessionInner::connect(self);
    }

    fn start_heartbeat(self: &Arc<Self>, core: &mut SessionCore) {
        core.stop_heartbeat();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let session = Arc::downgrade(self);
        core.heartbeat_timer = Some(runtime.spawn(heartbeat_loop(session)));
    }

    /// Drains queued notices outside the lock, one task at a time.
    ///
    /// Notices are queued under the same lock that mutates the state, so
    /// handlers observe them in state order. A caller that finds another
    /// task draining leaves its notices for that task.
    fn deliver(&self) {
        {
            let mut core = self.lock_core();
            if core.delivering {
                return;
            }
            core.delivering = true;
        }
        loop {
            let notice = {
                let mut core = self.lock_core();
                match core.pending.pop_front() {
                    Some(notice) => notice,
                    None => {
                        core.delivering = false;
                        return;
                    }
                }
            };
            match notice {
                Notice::Status(status) => self.handlers.notify_status(status),
                Notice::Event(event) => self.handlers.dispatch(&event),
            }
        }
    }
}

impl SessionCore {
    fn set_status(&mut self, status: ConnectionStatus) {
        self.state.status = status;
        self.pending.push_back(Notice::Status(status));
    }

    fn open_sender(&self) -> Option<&TransportSender> {
        self.transport
            .as_ref()
            .filter(|transport| transport.open)
            .map(|transport| &transport.sender)
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.task.abort();
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_timer.take() {
            task.abort();
        }
    }
}

async fn heartbeat_loop(session: Weak<SessionInner>) {
    let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.ping();
    }
}

fn send_control(sender: &TransportSender, message: ClientMessage) -> Result<(), StreamClientError> {
    sender.send_text(message.to_text()?)
}
