//! Opt-in callbacks for stream events and connection status changes.

use std::fmt;
use std::sync::Arc;

use crate::stream::proto::{
    CancelledEvent, ChunkEvent, CompleteEvent, ConnectedEvent, ErrorEvent, HeartbeatEvent,
    ProgressEvent, StageCompleteEvent, StageStartEvent, StreamEvent,
};
use crate::stream::session::ConnectionStatus;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callbacks a caller registers per event kind.
///
/// Every callback is optional; unregistered kinds are dropped silently.
/// Callbacks run on the tokio task that delivered the frame and must not
/// block.
#[derive(Clone, Default)]
pub struct StreamEventHandlers {
    on_connected: Option<Callback<ConnectedEvent>>,
    on_progress: Option<Callback<ProgressEvent>>,
    on_chunk: Option<Callback<ChunkEvent>>,
    on_stage_start: Option<Callback<StageStartEvent>>,
    on_stage_complete: Option<Callback<StageCompleteEvent>>,
    on_complete: Option<Callback<CompleteEvent>>,
    on_error: Option<Callback<ErrorEvent>>,
    on_cancelled: Option<Callback<CancelledEvent>>,
    on_heartbeat: Option<Callback<HeartbeatEvent>>,
    on_connection_change: Option<Callback<ConnectionStatus>>,
}

impl StreamEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn(&ConnectedEvent) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_chunk(mut self, f: impl Fn(&ChunkEvent) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(f));
        self
    }

    pub fn on_stage_start(
        mut self,
        f: impl Fn(&StageStartEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_stage_start = Some(Arc::new(f));
        self
    }

    pub fn on_stage_complete(
        mut self,
        f: impl Fn(&StageCompleteEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_stage_complete = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&CompleteEvent) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Called for `error` events sent by the peer.
    ///
    /// Transport failures are not routed here; they show up in the session
    /// state and through [`StreamEventHandlers::on_connection_change`].
    pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn(&CancelledEvent) + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Arc::new(f));
        self
    }

    pub fn on_heartbeat(mut self, f: impl Fn(&HeartbeatEvent) + Send + Sync + 'static) -> Self {
        self.on_heartbeat = Some(Arc::new(f));
        self
    }

    /// Called on every session status transition and for `connected` events.
    pub fn on_connection_change(
        mut self,
        f: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_change = Some(Arc::new(f));
        self
    }

    pub(crate) fn notify_status(&self, status: ConnectionStatus) {
        if let Some(handler) = &self.on_connection_change {
            handler(&status);
        }
    }

    /// Routes one decoded event to its handler.
    ///
    /// A `connected` event also notifies the status handler, before the
    /// `on_connected` callback runs.
    pub(crate) fn dispatch(&self, event: &StreamEvent) {
        match event {
            StreamEvent::Connected(event) => {
                self.notify_status(ConnectionStatus::Connected);
                call(&self.on_connected, event);
            }
            StreamEvent::Progress(event) => call(&self.on_progress, event),
            StreamEvent::Chunk(event) => call(&self.on_chunk, event),
            StreamEvent::StageStart(event) => call(&self.on_stage_start, event),
            StreamEvent::StageComplete(event) => call(&self.on_stage_complete, event),
            StreamEvent::Complete(event) => call(&self.on_complete, event),
            StreamEvent::Error(event) => call(&self.on_error, event),
            StreamEvent::Cancelled(event) => call(&self.on_cancelled, event),
            StreamEvent::Heartbeat(event) => call(&self.on_heartbeat, event),
        }
    }
}

fn call<T>(handler: &Option<Callback<T>>, event: &T) {
    if let Some(handler) = handler {
        handler(event);
    }
}

impl fmt::Debug for StreamEventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEventHandlers")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_chunk", &self.on_chunk.is_some())
            .field("on_stage_start", &self.on_stage_start.is_some())
            .field("on_stage_complete", &self.on_stage_complete.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_cancelled", &self.on_cancelled.is_some())
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .field("on_connection_change", &self.on_connection_change.is_some())
            .finish()
    }
}
