//! WebSocket endpoints.
//!
//! `/operations` takes one JSON `Operation` and streams its progress events until the
//! terminal one. The workflow runs under the supervisor: closing the socket stops the
//! stream, never the workflow.

use super::AppState;
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Extension, Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use stardeck_core::engine::{LineStream, LogOptions};
use stardeck_core::progress::{Completion, ProgressEvent};
use stardeck_core::store::resolve_container;
use stardeck_core::{Actor, Operation, OperationResult, StardeckError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wire message for a request that never became a workflow.
fn rejection(err: &StardeckError) -> String {
    ProgressEvent::Complete(Completion::failure(err, OperationResult::default()))
        .to_wire()
        .to_string()
}

async fn operations_ws(
    ws: WebSocketUpgrade,
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_operation_socket(socket, state, actor))
}

async fn handle_operation_socket(mut socket: WebSocket, state: Arc<AppState>, actor: Actor) {
    let request = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(p))) => {
                if socket.send(Message::Pong(p)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("Client closed before sending an operation");
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket receive failed");
                return;
            }
        }
    };

    let operation: Operation = match serde_json::from_str(request.as_str()) {
        Ok(operation) => operation,
        Err(e) => {
            let err = StardeckError::validation(format!("invalid operation: {}", e));
            let _ = socket.send(Message::Text(Utf8Bytes::from(rejection(&err)))).await;
            let _ = socket.close().await;
            return;
        }
    };
    info!(
        kind = operation.kind(),
        target = %operation.target(),
        "Operation requested over WebSocket"
    );

    let (progress, mut events) = state.progress_channel();
    if let Err(e) = state.spawn_operation(operation, actor, progress) {
        let _ = socket.send(Message::Text(Utf8Bytes::from(rejection(&e)))).await;
        let _ = socket.close().await;
        return;
    }

    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        let text = event.to_wire().to_string();
        if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
            info!("Client went away; the operation continues in the background");
            return;
        }
        if terminal {
            break;
        }
    }
    let _ = socket.close().await;
}

/// Forward lines to the socket until the stream ends or the client leaves.
///
/// Returning drops the stream, which stops the engine process behind it.
async fn forward_lines(socket: WebSocket, mut lines: LineStream) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Some(line) => {
                    if sender.send(Message::Text(Utf8Bytes::from(line))).await.is_err() {
                        break;
                    }
                }
                None => {
                    if let Err(e) = lines.finish().await {
                        let body = json!({ "error": e.to_string() }).to_string();
                        let _ = sender.send(Message::Text(Utf8Bytes::from(body))).await;
                    }
                    let _ = sender.close().await;
                    return;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn engine_id(state: &AppState, key: &str) -> String {
    match resolve_container(state.workflows.store().as_ref(), key).await {
        Ok(record) => record.engine_id,
        Err(_) => key.to_string(),
    }
}

async fn logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(options): Query<LogOptions>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, state, id, options))
}

async fn handle_logs_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    id: String,
    options: LogOptions,
) {
    let engine_id = engine_id(&state, &id).await;
    match state.workflows.engine().stream_logs(&engine_id, &options).await {
        Ok(lines) => forward_lines(socket, lines).await,
        Err(e) => {
            let body = json!({ "error": e.to_string() }).to_string();
            let _ = socket.send(Message::Text(Utf8Bytes::from(body))).await;
            let _ = socket.close().await;
        }
    }
}

#[derive(Deserialize)]
pub struct ExecQuery {
    /// Command line, split on whitespace
    #[serde(default = "default_shell")]
    cmd: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

async fn exec_ws(
    ws: WebSocketUpgrade,
    Extension(actor): Extension<Actor>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ExecQuery>,
) -> impl IntoResponse {
    let command: Vec<String> = query.cmd.split_whitespace().map(str::to_string).collect();
    ws.on_upgrade(move |socket| handle_exec_socket(socket, state, actor, id, command))
}

async fn handle_exec_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    actor: Actor,
    id: String,
    command: Vec<String>,
) {
    let engine_id = engine_id(&state, &id).await;
    let session = match state.workflows.engine().exec(&engine_id, &command).await {
        Ok(session) => session,
        Err(e) => {
            let body = json!({ "error": e.to_string() }).to_string();
            let _ = socket.send(Message::Text(Utf8Bytes::from(body))).await;
            let _ = socket.close().await;
            return;
        }
    };
    state.audit("container.exec", &id, &actor, json!({ "command": command })).await;

    let (mut output, input) = session.split();
    let Some(input) = input else {
        forward_lines(socket, output).await;
        return;
    };

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            line = output.next_line() => match line {
                Some(line) => {
                    if sender.send(Message::Text(Utf8Bytes::from(line))).await.is_err() {
                        break;
                    }
                }
                None => {
                    if let Err(e) = output.finish().await {
                        let body = json!({ "error": e.to_string() }).to_string();
                        let _ = sender.send(Message::Text(Utf8Bytes::from(body))).await;
                    }
                    let _ = sender.close().await;
                    return;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if input.send(text.as_str().as_bytes().to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if input.send(bytes.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(container = %id, "Exec session closed");
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/operations", get(operations_ws))
        .route("/containers/{id}/logs", get(logs_ws))
        .route("/containers/{id}/exec", get(exec_ws))
}
