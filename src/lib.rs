//! Streaming inference client for the prompt workbench.
//!
//! The crate attaches to one backend inference job over a websocket, decodes
//! its typed event stream, and routes each event to caller-supplied handlers
//! while tracking connection status and reconnecting after abnormal closes.
//!
//! - `stream`: session, transport, protocol, handlers, and configuration.
//! - `reconnect`: fixed-interval reconnect policy and close-code helpers.

/// Reconnect policy and close-code classification.
pub mod reconnect;
/// Realtime stream client, protocol types, and session state.
pub mod stream;

pub use reconnect::ReconnectPolicy;
pub use stream::client::{Connector, StreamClientError, WsConnector};
pub use stream::config::StreamConfig;
pub use stream::handlers::StreamEventHandlers;
pub use stream::proto::{ClientMessage, StreamEvent, StreamEventKind};
pub use stream::session::{ConnectionError, ConnectionState, ConnectionStatus, StreamSession};
