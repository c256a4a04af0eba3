//! Realtime stream modules.
//!
//! - `client`: websocket transport worker and the connector seam.
//! - `config`: connection configuration and endpoint construction.
//! - `handlers`: opt-in per-event callbacks.
//! - `proto`: inbound event types, decoder, and outbound control frames.
//! - `session`: reconnecting session that routes events to handlers.

/// Websocket transport and connector trait.
pub mod client;
/// Session configuration.
pub mod config;
/// Event and status callbacks.
pub mod handlers;
/// Stream protocol messages.
pub mod proto;
/// Connection state machine and event routing.
pub mod session;
