//! Websocket transport and the connector seam used by sessions.
//!
//! A [`Connector`] opens one transport per connection attempt. The transport
//! runs in a background worker that owns the socket, reports lifecycle and
//! inbound frames as [`TransportEvent`]s, and accepts outbound text frames
//! and close requests through a [`TransportSender`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::reconnect::{ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};

/// How long a locally initiated close waits for the peer's close reply.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Lifecycle and data notifications produced by a transport.
///
/// Every transport ends with exactly one `Close`. An `Error` may precede it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close { code: u16, reason: String },
}

/// Requests accepted by a transport worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Cloneable handle for outbound transport commands.
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportSender {
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx }
    }

    /// Queues one text frame.
    pub fn send_text(&self, text: String) -> Result<(), StreamClientError> {
        self.tx
            .send(TransportCommand::Send(text))
            .map_err(|_| StreamClientError::TransportClosed)
    }

    /// Asks the worker to close the socket with `code` and `reason`.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), StreamClientError> {
        self.tx
            .send(TransportCommand::Close {
                code,
                reason: reason.into(),
            })
            .map_err(|_| StreamClientError::TransportClosed)
    }
}

/// One opened transport: outbound commands plus inbound events.
#[derive(Debug)]
pub struct TransportHandle {
    pub sender: TransportSender,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports for a session.
///
/// `open` must not block. Connection progress is reported through the
/// returned handle's events; only failures to even start the attempt are
/// returned as errors.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        url: &str,
        credential: Option<&SecretString>,
    ) -> Result<TransportHandle, StreamClientError>;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(
        &self,
        url: &str,
        credential: Option<&SecretString>,
    ) -> Result<TransportHandle, StreamClientError> {
        let request = build_request(url, credential)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        runtime.spawn(async move {
            transport_worker(request, command_rx, event_tx).await;
        });

        Ok(TransportHandle {
            sender: TransportSender::new(command_tx),
            events: event_rx,
        })
    }
}

/// Errors produced while starting or driving a transport.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential could not be converted to a valid HTTP header value.
    #[error("invalid credential header: {0}")]
    InvalidCredentialHeader(#[from] InvalidHeaderValue),

    /// Endpoint could not be resolved from configuration.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// No tokio runtime is available to drive the transport.
    #[error("no tokio runtime available to drive the transport")]
    NoRuntime,

    /// Transport worker has stopped accepting commands.
    #[error("transport is closed")]
    TransportClosed,
}

fn build_request(
    url: &str,
    credential: Option<&SecretString>,
) -> Result<Request, StreamClientError> {
    let mut request = url.into_client_request()?;
    if let Some(credential) = credential {
        let header = format!("Bearer {}", credential.expose_secret()).parse()?;
        request.headers_mut().insert(AUTHORIZATION, header);
    }
    Ok(request)
}

async fn transport_worker(
    request: Request,
    mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut socket = match connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            let _ = event_tx.send(TransportEvent::Error(err.to_string()));
            let _ = event_tx.send(abnormal_close());
            return;
        }
    };
    let _ = event_tx.send(TransportEvent::Open);

    let mut peer_close: Option<(u16, String)> = None;

    loop {
        tokio::select! {
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(TransportCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                            let _ = event_tx.send(abnormal_close());
                            return;
                        }
                    }
                    Some(TransportCommand::Close { code, reason }) => {
                        close_socket(&mut socket, code, &reason).await;
                        let _ = event_tx.send(TransportEvent::Close { code, reason });
                        return;
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = event_tx.send(TransportEvent::Message(text));
                        }
                        Err(_) => warn!(event = "transport_binary_frame_dropped"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            let _ = event_tx.send(abnormal_close());
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        // Keep polling so tungstenite can flush the close reply.
                        peer_close = Some(match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (NO_STATUS_RECEIVED, String::new()),
                        });
                    }
                    Some(Err(err)) => {
                        if let Some((code, reason)) = peer_close.take() {
                            let _ = event_tx.send(TransportEvent::Close { code, reason });
                        } else {
                            let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                            let _ = event_tx.send(abnormal_close());
                        }
                        return;
                    }
                    None => {
                        let event = match peer_close.take() {
                            Some((code, reason)) => TransportEvent::Close { code, reason },
                            None => abnormal_close(),
                        };
                        let _ = event_tx.send(event);
                        return;
                    }
                }
            }
        }
    }
}

async fn close_socket(socket: &mut Socket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(err) = socket.close(Some(frame)).await {
        debug!(event = "transport_close_send_failed", error = %err);
        return;
    }

    let drain = async {
        while let Some(Ok(_)) = socket.next().await {}
    };
    if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, drain)
        .await
        .is_err()
    {
        debug!(event = "transport_close_handshake_timeout");
    }
}

fn abnormal_close() -> TransportEvent {
    TransportEvent::Close {
        code: ABNORMAL_CLOSURE,
        reason: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

    use super::{build_request, Connector, StreamClientError, WsConnector};

    #[test]
    fn request_carries_bearer_credential() {
        let credential = SecretString::new("opaque-token".to_string());
        let request =
            build_request("ws://localhost:8000/api/v1/ws/stream/inf-1", Some(&credential))
                .expect("request");
        assert_eq!(
            request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok()),
            Some("Bearer opaque-token")
        );
    }

    #[test]
    fn request_without_credential_has_no_authorization_header() {
        let request =
            build_request("ws://localhost:8000/api/v1/ws/stream/inf-1", None).expect("request");
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn credential_with_control_characters_is_rejected() {
        let credential = SecretString::new("bad\ntoken".to_string());
        let result = build_request("ws://localhost:8000/ws", Some(&credential));
        assert!(matches!(
            result,
            Err(StreamClientError::InvalidCredentialHeader(_))
        ));
    }

    #[test]
    fn malformed_url_fails_before_spawning() {
        let result = WsConnector.open("not a url", None);
        assert!(matches!(result, Err(StreamClientError::WebSocket(_))));
    }

    #[test]
    fn open_outside_runtime_reports_missing_runtime() {
        let result = WsConnector.open("ws://localhost:8000/ws", None);
        assert!(matches!(result, Err(StreamClientError::NoRuntime)));
    }
}
