//! WebSocket upgrade handler and per-connection read/write loops.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use realm_common::ConnectionId;
use serde::Deserialize;
use tokio::time;

use crate::auth::middleware::{authenticate, bearer_token, AuthError};
use crate::AppState;

use super::connection::{Connection, OutboundQueue};
use super::dispatch::dispatch;
use super::events::Envelope;

/// How long the writer gets to flush and send a close frame after unregister.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// Authenticate before upgrading; a bad token never reaches the hub.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.token.as_deref().or_else(|| bearer_token(&headers)) else {
        return AuthError::MISSING.into_response();
    };
    let user = match authenticate(&state, token).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, user.user_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_tx, ws_rx) = socket.split();
    let (conn, queue) = Connection::new(user_id.as_str(), state.config.outbound_queue);
    let conn_id = conn.id();

    if let Err(err) = state.hub.register(conn).await {
        tracing::error!(%err, %user_id, "failed to register gateway connection");
        return;
    }
    tracing::info!(conn_id = %conn_id, %user_id, "gateway connection opened");

    let mut writer = tokio::spawn(write_loop(ws_tx, queue, state.config.ping_interval()));

    let writer_done = tokio::select! {
        _ = read_loop(ws_rx, &state, conn_id, &user_id) => false,
        _ = &mut writer => true,
    };

    // Unregister drops the hub's sender, so the writer sees its queue close.
    state.hub.unregister(conn_id);
    if !writer_done && time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(conn_id = %conn_id, %user_id, "gateway connection closed");
}

async fn read_loop(mut ws_rx: SplitStream<WebSocket>, state: &AppState, conn_id: ConnectionId, user_id: &str) {
    let idle_timeout = state.config.idle_timeout();
    loop {
        let msg = match time::timeout(idle_timeout, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, conn_id = %conn_id, "ws read error");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::debug!(conn_id = %conn_id, "no frames within idle timeout, closing");
                return;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => dispatch(&state.hub, conn_id, user_id, envelope),
                Err(e) => tracing::debug!(%e, conn_id = %conn_id, "skipping undecodable frame"),
            },
            Message::Close(_) => return,
            _ => continue,
        }
    }
}

/// Drain the outbound queue onto the socket, pinging while idle.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut queue: OutboundQueue, ping_every: Duration) {
    let mut ping = time::interval(ping_every);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            payload = queue.recv() => match payload {
                Some(payload) => {
                    if ws_tx.send(Message::Text(payload)).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}
