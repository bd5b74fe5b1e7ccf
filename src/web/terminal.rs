//! WebSocket endpoint bridging a browser terminal to a local PTY.
//!
//! Exactly one PTY process per connection. Frames are JSON both ways:
//! `{type: input, data}` and `{type: resize, cols, rows}` inbound;
//! `{type: output, data}` (base64, since terminal output is raw bytes),
//! `{type: exit, code}` and `{type: error, message}` outbound.

use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::server::WebState;
use crate::pty;

pub fn ws_routes() -> Router<Arc<WebState>> {
    Router::new().route("/ws/terminal", get(ws_handler))
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Output { data: String },
    Exit { code: i32 },
    Error { message: String },
}

impl ServerFrame {
    fn output(bytes: &[u8]) -> Self {
        ServerFrame::Output {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn to_message(&self) -> Message {
        let json = serde_json::to_string(self).unwrap_or_default();
        Message::Text(json.into())
    }
}

async fn ws_handler(
    State(state): State<Arc<WebState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if query.token.as_deref() != Some(state.token.as_str()) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<WebState>, query: WsQuery) {
    tracing::info!("Terminal WebSocket connected");
    handle_socket_inner(socket, &state, query).await;
    tracing::info!("Terminal WebSocket disconnected");
}

async fn handle_socket_inner(socket: WebSocket, state: &WebState, query: WsQuery) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let cwd = query
        .cwd
        .map(|c| shellexpand::tilde(&c).to_string())
        .or_else(|| dirs::home_dir().map(|h| h.to_string_lossy().to_string()))
        .unwrap_or_else(|| "/".to_string());
    let cols = query.cols.unwrap_or(state.settings.terminal.default_cols);
    let rows = query.rows.unwrap_or(state.settings.terminal.default_rows);

    // Spawn failure is fatal for this connection: report and close, no retry
    let (pty, mut exit_rx) =
        match pty::spawn_shell(&state.settings.terminal.shell, Path::new(&cwd), cols, rows) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn terminal PTY");
                let frame = ServerFrame::Error {
                    message: e.to_string(),
                };
                let _ = ws_sink.send(frame.to_message()).await;
                let _ = ws_sink.close().await;
                return;
            }
        };

    let mut output_rx = pty.subscribe();

    loop {
        tokio::select! {
            // Client -> PTY
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Input { data }) => pty.write_input(data.as_bytes()),
                            Ok(ClientFrame::Resize { cols, rows }) => pty.resize(cols, rows),
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring malformed client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {}
                }
            }

            // PTY -> client
            data = output_rx.recv() => {
                match data {
                    Ok(bytes) => {
                        if ws_sink.send(ServerFrame::output(&bytes).to_message()).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Bounded buffer: a slow client sees a gap, not
                        // unbounded memory growth
                        tracing::warn!(dropped = n, "Terminal client lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                }
            }

            // Process exit: notify and close
            code = &mut exit_rx => {
                let code = code.unwrap_or(-1);
                // Flush output that raced with the exit notification
                while let Ok(bytes) = output_rx.try_recv() {
                    if ws_sink.send(ServerFrame::output(&bytes).to_message()).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sink.send(ServerFrame::Exit { code }.to_message()).await;
                let _ = ws_sink.close().await;
                tracing::info!(code = code, "Terminal process exited");
                return;
            }
        }
    }

    // Connection closed or errored: the PTY dies with it
    pty.shutdown();
}
