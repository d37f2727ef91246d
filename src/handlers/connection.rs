//! Session lifecycle: upgrade, handshake, heartbeat, read loop, teardown.
//!
//! Every accepted socket becomes one session with two tasks: a heartbeat
//! emitter and the read loop below. A third task drains the session's
//! outbound channel into the socket, which is what serializes writes. All
//! exits funnel into [`teardown`], the single cleanup path.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::handlers::{ice, matchmaking, signaling};
use crate::pool::{Connection, User};
use crate::protocol::{ClientFrame, ClientMessage, Envelope, FrameError, ServerMessage};
use crate::ratelimit::client_ip;
use crate::state::AppState;
use crate::token;
use crate::validation;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);

    if !state.rate_limiter.allow_ws(ip) {
        tracing::warn!(%ip, "websocket upgrade rate limited");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if !state.rate_limiter.acquire_slot(ip) {
        tracing::warn!(%ip, "per-source session cap reached");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ip: IpAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Sender task: the sole writer to the socket. Frames queued on one
    // Connection reach the peer in queue order.
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize outbound frame"),
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handshake: mint identity, announce the session, enter the waiting pool.
    let user_id = Uuid::new_v4().to_string();
    let session_token = token::issue(&state.config.session_secret, &user_id, state.config.token_ttl);
    let conn = Arc::new(Connection::new(user_id.clone(), tx));
    let user = User::new(user_id.clone(), session_token, conn.clone());

    let session = Envelope::new(ServerMessage::Session {
        user_id: user.id.clone(),
        token: user.token.clone(),
    });
    if conn.send(session).is_err() {
        tracing::warn!(user_id = %user_id, "session announcement failed, dropping connection");
        conn.close();
        state.rate_limiter.release_slot(ip);
        send_task.abort();
        return;
    }

    state.pool.add_waiting(user).await;
    tracing::info!(user_id = %user_id, %ip, "session established");

    // Heartbeat emitter: a liveness probe every interval until a write fails
    // or the connection is closed.
    let heartbeat_conn = conn.clone();
    let heartbeat_interval = state.config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if heartbeat_conn.send(Envelope::new(ServerMessage::Ping)).is_err() {
                heartbeat_conn.close();
                return;
            }
        }
    });

    read_loop(&state, &conn, &user_id, &mut ws_receiver).await;

    tracing::debug!(user_id = %user_id, "session ended, cleaning up");
    teardown(&state, &user_id, &conn).await;
    state.rate_limiter.release_slot(ip);
    heartbeat.abort();
    send_task.abort();
}

/// Drive one session until a terminal condition: client close, read error,
/// deadline expiry, explicit disconnect, or the connection being closed from
/// elsewhere (reaper, shutdown, failed heartbeat).
async fn read_loop(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    user_id: &str,
    receiver: &mut SplitStream<WebSocket>,
) {
    let deadline = state.config.connection_timeout;

    loop {
        let frame = tokio::select! {
            _ = conn.wait_closed() => {
                tracing::debug!(user_id = %user_id, "connection closed, leaving read loop");
                return;
            }
            frame = tokio::time::timeout(deadline, receiver.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                tracing::warn!(user_id = %user_id, "read deadline expired");
                return;
            }
            Ok(None) => {
                tracing::info!(user_id = %user_id, "socket closed by client");
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(user_id = %user_id, error = %e, "read error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                conn.touch();
                if let Err(reason) = validation::validate_frame(text.len()) {
                    signaling::send_error(conn, reason.to_string());
                    continue;
                }
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // not even a tagged frame: treat as a broken peer
                        tracing::warn!(user_id = %user_id, error = %e, "undecodable frame");
                        return;
                    }
                };
                match frame.into_message() {
                    Ok(ClientMessage::Disconnect) => {
                        tracing::info!(user_id = %user_id, "client requested disconnect");
                        return;
                    }
                    Ok(msg) => dispatch(state, conn, user_id, msg).await,
                    Err(FrameError::UnknownType(kind)) => {
                        tracing::warn!(user_id = %user_id, r#type = %kind, "unknown message type");
                    }
                    Err(err @ FrameError::BadPayload { .. }) => {
                        signaling::send_error(conn, err.to_string());
                    }
                }
            }
            // axum answers protocol pings itself; both directions prove liveness
            Message::Ping(_) | Message::Pong(_) => conn.touch(),
            Message::Binary(_) => {
                tracing::debug!(user_id = %user_id, "ignoring binary frame");
            }
            Message::Close(_) => {
                tracing::info!(user_id = %user_id, "close frame received");
                return;
            }
        }
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    conn: &Arc<Connection>,
    user_id: &str,
    message: ClientMessage,
) {
    match message {
        // liveness was already refreshed when the frame arrived
        ClientMessage::Ping | ClientMessage::Pong => {}
        ClientMessage::FindMatch => matchmaking::handle_find_match(state, conn, user_id).await,
        ClientMessage::Offer(desc) => signaling::handle_offer(state, conn, user_id, desc).await,
        ClientMessage::Answer(desc) => signaling::handle_answer(state, conn, user_id, desc).await,
        ClientMessage::IceCandidate(cand) => {
            signaling::handle_candidate(state, conn, user_id, cand).await
        }
        ClientMessage::CallStart => signaling::handle_call_start(state, conn, user_id).await,
        ClientMessage::CallAccept => signaling::handle_call_accept(state, conn, user_id).await,
        ClientMessage::CallReject => signaling::handle_call_reject(state, user_id).await,
        ClientMessage::CallEnd => signaling::handle_call_end(state, user_id).await,
        ClientMessage::GetIceServers => ice::handle_get_ice_servers(&state.config, conn),
        // handled by the read loop before dispatch
        ClientMessage::Disconnect => {}
    }
}

/// The single cleanup path for a departing session: notify and recycle the
/// partner, drop the user from every index, close the channel. Safe to run
/// concurrently with the reaper; the pool operations make the effects
/// exactly-once.
pub(crate) async fn teardown(state: &AppState, user_id: &str, conn: &Connection) {
    if let Some(partner) = state.pool.find_partner(user_id).await {
        let notice = Envelope::new(ServerMessage::PartnerDisconnected {
            reason: "Partner left the conversation".to_string(),
        });
        if partner.conn.send(notice).is_err() {
            tracing::warn!(partner_id = %partner.id, "failed to notify partner of disconnect");
        }
        state.pool.move_to_waiting(&partner.id).await;
        tracing::debug!(partner_id = %partner.id, "partner moved back to waiting");
    }

    state.pool.remove(user_id).await;
    conn.close();

    let stats = state.pool.stats().await;
    tracing::info!(
        user_id = %user_id,
        waiting = stats.waiting_users,
        active = stats.active_users,
        rooms = stats.active_rooms,
        "session cleaned up"
    );
}
