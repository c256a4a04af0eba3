use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use workbench_stream::stream::session::ConnectionError;
use workbench_stream::{ConnectionStatus, StreamConfig, StreamEventHandlers, StreamSession};

const TEST_INFERENCE_ID: &str = "inf-smoke-1";
const TEST_USER_ID: &str = "user 42";
const TEST_TOKEN: &str = "opaque-jwt";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct StreamObserved {
    inference_id: String,
    user_id: Option<String>,
    cancel_frame: Value,
}

#[derive(Clone)]
struct CancelState {
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<StreamObserved, String>>>>>,
}

#[derive(Clone)]
struct FlakyState {
    connections: Arc<AtomicUsize>,
}

fn channel_handlers(tx: mpsc::UnboundedSender<String>) -> StreamEventHandlers {
    let connected = tx.clone();
    let progress = tx.clone();
    let chunk = tx.clone();
    let complete = tx.clone();
    let cancelled = tx.clone();
    let status = tx;
    StreamEventHandlers::new()
        .on_connected(move |event| {
            let _ = connected.send(format!(
                "connected:{}",
                event.data.connection_id.clone().unwrap_or_default()
            ));
        })
        .on_progress(move |event| {
            let _ = progress.send(format!(
                "progress:{}:{}",
                event.data.overall_progress,
                event.data.stage_label().unwrap_or("-")
            ));
        })
        .on_chunk(move |event| {
            let _ = chunk.send(format!("chunk:{}", event.data.text));
        })
        .on_complete(move |event| {
            let output = event
                .data
                .result
                .as_ref()
                .map(|result| result.output.clone())
                .unwrap_or_default();
            let _ = complete.send(format!("complete:{output}"));
        })
        .on_cancelled(move |_| {
            let _ = cancelled.send("cancelled".to_string());
        })
        .on_connection_change(move |value| {
            let _ = status.send(format!("status:{value}"));
        })
}

async fn next_matching(rx: &mut mpsc::UnboundedReceiver<String>, prefix: &str) -> String {
    timeout(STEP_TIMEOUT, async {
        loop {
            let item = rx.recv().await.expect("handler channel closed");
            if item.starts_with(prefix) {
                return item;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for `{prefix}`"))
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(STEP_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for session state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_streams_events_and_round_trips_cancel() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let state = CancelState {
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new()
        .route("/api/v1/ws/stream/:inference_id", get(cancel_ws_handler))
        .with_state(state);
    let (addr, server_task) = spawn_server(app).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = StreamConfig::new(TEST_INFERENCE_ID)
        .with_base_url(format!("ws://{addr}"))
        .with_user_id(TEST_USER_ID)
        .with_credential(SecretString::new(TEST_TOKEN.to_string()));
    let session = StreamSession::new(config, channel_handlers(tx));

    session.connect();
    assert_eq!(next_matching(&mut rx, "status:").await, "status:connecting");
    assert_eq!(next_matching(&mut rx, "status:").await, "status:connected");
    assert_eq!(next_matching(&mut rx, "connected:").await, "connected:conn-1");
    assert_eq!(
        next_matching(&mut rx, "progress:").await,
        "progress:25:Building Context"
    );
    assert_eq!(next_matching(&mut rx, "chunk:").await, "chunk:Hello");
    assert_eq!(next_matching(&mut rx, "chunk:").await, "chunk:, world");
    assert!(session.is_connected());

    session.cancel();
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(next_matching(&mut rx, "cancelled").await, "cancelled");
    assert_eq!(
        next_matching(&mut rx, "status:disconnected").await,
        "status:disconnected"
    );

    let observed = timeout(STEP_TIMEOUT, observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert_eq!(observed.inference_id, TEST_INFERENCE_ID);
    assert_eq!(observed.user_id.as_deref(), Some(TEST_USER_ID));
    assert_eq!(observed.cancel_frame, json!({"type": "cancel"}));

    // A normal closure from the peer must not trigger a reconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = session.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.reconnect_attempts, 0);

    session.disconnect();
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_reconnects_after_abnormal_server_close() {
    let state = FlakyState {
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let connections = Arc::clone(&state.connections);
    let app = Router::new()
        .route("/api/v1/ws/stream/:inference_id", get(flaky_ws_handler))
        .with_state(state);
    let (addr, server_task) = spawn_server(app).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = StreamConfig::new(TEST_INFERENCE_ID)
        .with_base_url(format!("ws://{addr}"))
        .with_reconnect_interval(Duration::from_millis(20))
        .with_max_reconnect_attempts(3);
    let session = StreamSession::new(config, channel_handlers(tx));

    session.connect();
    assert_eq!(next_matching(&mut rx, "connected:").await, "connected:conn-1");
    assert_eq!(
        next_matching(&mut rx, "status:disconnected").await,
        "status:disconnected"
    );
    assert_eq!(next_matching(&mut rx, "connected:").await, "connected:conn-2");
    assert_eq!(
        next_matching(&mut rx, "complete:").await,
        "complete:final answer"
    );

    wait_for(|| session.status() == ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connections.load(Ordering::SeqCst), 2);
    let state = session.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.reconnect_attempts, 0);
    assert!(state.connected_at.is_some());

    session.disconnect();
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_exhausts_reconnect_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("probe listener address");
    drop(listener);

    let (tx, _rx) = mpsc::unbounded_channel();
    let config = StreamConfig::new(TEST_INFERENCE_ID)
        .with_base_url(format!("ws://{addr}"))
        .with_reconnect_interval(Duration::from_millis(10))
        .with_max_reconnect_attempts(2);
    let session = StreamSession::new(config, channel_handlers(tx));

    session.connect();
    wait_for(|| {
        let state = session.state();
        state.reconnect_attempts == 2 && state.status == ConnectionStatus::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = session.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.reconnect_attempts, 2);
    assert!(matches!(state.error, Some(ConnectionError::Transport(_))));
}

async fn cancel_ws_handler(
    State(state): State<CancelState>,
    Path(inference_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let expected_auth = format!("Bearer {TEST_TOKEN}");
    let auth_matches = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected_auth);
    if !auth_matches {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let user_id = query.get("user_id").cloned();
    let observed_tx = state.observed_tx.clone();
    ws.on_upgrade(move |socket| async move {
        let result = run_cancel_protocol(socket, inference_id, user_id).await;
        if let Some(tx) = observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
    .into_response()
}

async fn run_cancel_protocol(
    mut socket: WebSocket,
    inference_id: String,
    user_id: Option<String>,
) -> Result<StreamObserved, String> {
    send_json(
        &mut socket,
        json!({
            "type": "connected",
            "inference_id": inference_id,
            "timestamp": "2025-01-01T00:00:00Z",
            "data": {
                "connection_id": "conn-1",
                "inference_id": inference_id,
                "message": "stream ready"
            }
        }),
    )
    .await?;
    send_text(&mut socket, "this frame is not json".to_string()).await?;
    send_json(
        &mut socket,
        json!({
            "type": "progress",
            "inference_id": inference_id,
            "timestamp": "2025-01-01T00:00:01Z",
            "data": {
                "inference_id": inference_id,
                "overall_progress": 25,
                "current_stage": "context_building",
                "stages": [],
                "started_at": "2025-01-01T00:00:00Z",
                "completed_at": null,
                "elapsed_time_seconds": 1.0,
                "estimated_remaining_seconds": 3.0,
                "error_message": null
            }
        }),
    )
    .await?;
    send_json(&mut socket, json!({"type": "chunk", "text": "Hello", "index": 0})).await?;
    send_json(
        &mut socket,
        json!({
            "type": "chunk",
            "inference_id": inference_id,
            "timestamp": "2025-01-01T00:00:02Z",
            "data": {"chunk": ", world"}
        }),
    )
    .await?;

    let cancel_frame = recv_json(&mut socket).await?;
    if cancel_frame.get("type").and_then(Value::as_str) != Some("cancel") {
        return Err(format!("expected cancel frame, got {cancel_frame}"));
    }

    send_json(
        &mut socket,
        json!({"type": "cancelled", "data": {"message": "inference cancelled"}}),
    )
    .await?;
    close_with(&mut socket, 1000, "cancelled").await?;

    Ok(StreamObserved {
        inference_id,
        user_id,
        cancel_frame,
    })
}

async fn flaky_ws_handler(
    State(state): State<FlakyState>,
    Path(inference_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |mut socket| async move {
        let connected = json!({
            "type": "connected",
            "inference_id": inference_id,
            "data": {"connection_id": format!("conn-{connection}")}
        });
        if send_json(&mut socket, connected).await.is_err() {
            return;
        }

        if connection == 1 {
            let _ = close_with(&mut socket, 1011, "backend restarting").await;
            return;
        }

        let complete = json!({
            "type": "complete",
            "inference_id": inference_id,
            "data": {
                "result": {"inference_id": inference_id, "output": "final answer"},
                "elapsed_time_seconds": 0.5
            }
        });
        if send_json(&mut socket, complete).await.is_ok() {
            let _ = close_with(&mut socket, 1000, "done").await;
        }
    })
}

async fn send_json(socket: &mut WebSocket, value: Value) -> Result<(), String> {
    send_text(socket, value.to_string()).await
}

async fn send_text(socket: &mut WebSocket, text: String) -> Result<(), String> {
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn recv_json(socket: &mut WebSocket) -> Result<Value, String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) -> Result<(), String> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .map_err(|err| format!("failed to send close frame: {err}"))?;
    while let Some(Ok(_)) = socket.recv().await {}
    Ok(())
}

async fn spawn_server(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server should run");
    });
    (addr, task)
}
