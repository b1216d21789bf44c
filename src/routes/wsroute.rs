//! WebSocket upgrade and admission
//!
//! `GET /ws/{room_id}?token=...` (or `Authorization: Bearer ...`). The token
//! and room id are checked during the HTTP upgrade so bad requests never get
//! a socket. Room and user lookups need the database and run right after
//! the upgrade; a failed lookup closes the socket with a close code.

use crate::auth::Authenticator;
use crate::error::{AppError, AppResult};
use crate::models::Identity;
use crate::state::AppState;
use crate::websocket::connection;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use uuid::Uuid;

/// Close code sent when the requested room does not exist
pub const CLOSE_ROOM_NOT_FOUND: u16 = 4404;

/// Floor for the transport's own frame limit; larger application frames are
/// read in full and dropped by the reader instead of failing the socket.
const TRANSPORT_FRAME_LIMIT: usize = 64 * 1024;

/// What the upgrade request asked for, once its token checked out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub room_id: Uuid,
    pub user_id: Uuid,
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Validate an upgrade request: path, room id and token.
pub fn admit(req: &Request, auth: &dyn Authenticator) -> Result<Admission, ErrorResponse> {
    let uri = req.uri();
    let raw_room = uri
        .path()
        .strip_prefix("/ws/")
        .map(|rest| rest.trim_end_matches('/'))
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "Not Found"))?;
    let room_id =
        Uuid::parse_str(raw_room).map_err(|_| reject(StatusCode::BAD_REQUEST, "invalid room id"))?;

    let token = uri
        .query()
        .and_then(|q| query_param(q, "token"))
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(req))
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing token"))?;

    let user_id = auth.verify(token).map_err(|e| {
        tracing::debug!(error = %e, room_id = %room_id, "handshake auth denied");
        reject(StatusCode::UNAUTHORIZED, "Unauthorized")
    })?;

    Ok(Admission { room_id, user_id })
}

fn transport_config(max_message_bytes: usize) -> WebSocketConfig {
    let limit = max_message_bytes.max(TRANSPORT_FRAME_LIMIT);
    WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit))
}

async fn close_with<S>(mut ws: WebSocketStream<S>, code: CloseCode, reason: &'static str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(error = %e, "failed to send close frame");
    }
}

async fn handle_conn(stream: TcpStream, peer: SocketAddr, state: AppState) {
    // The handshake callback is synchronous; it hands its verdict out through this slot.
    let admitted: Arc<Mutex<Option<Admission>>> = Arc::new(Mutex::new(None));
    let slot = admitted.clone();
    let auth = state.auth.clone();

    let ws = accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let admission = admit(req, auth.as_ref())?;
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(admission);
            }
            Ok(resp)
        },
        Some(transport_config(state.config.ws.max_message_bytes)),
    )
    .await;

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(remote = %peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let admission = admitted.lock().ok().and_then(|mut guard| guard.take());
    let Some(admission) = admission else {
        close_with(ws, CloseCode::Error, "admission lost").await;
        return;
    };

    let room = match state.directory.find_room(admission.room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            tracing::debug!(room_id = %admission.room_id, "rejecting connection to unknown room");
            close_with(ws, CloseCode::from(CLOSE_ROOM_NOT_FOUND), "room not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, room_id = %admission.room_id, "room lookup failed");
            close_with(ws, CloseCode::Error, "directory unavailable").await;
            return;
        }
    };

    let user = match state.directory.find_user(admission.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!(user_id = %admission.user_id, "rejecting token for unknown user");
            close_with(ws, CloseCode::Policy, "unknown user").await;
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, user_id = %admission.user_id, "user lookup failed");
            close_with(ws, CloseCode::Error, "directory unavailable").await;
            return;
        }
    };

    connection::run(ws, Identity::from(user), room, state).await;
}

/// Accept relay connections from a pre-bound listener until the process exits.
pub async fn serve_incoming(listener: TcpListener, state: AppState) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(remote = %peer, "accepted TCP connection");
                tokio::spawn(handle_conn(stream, peer, state.clone()));
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed; continuing");
            }
        }
    }
}

/// Bind the relay port and serve it.
pub async fn serve(addr: &str, state: AppState) -> AppResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::StartServer(format!("bind relay {addr}: {e}")))?;
    tracing::info!(%addr, "relay listening");
    serve_incoming(listener, state).await;
    Ok(())
}
