//! Matchmaking: pairing a waiting user with another waiting user.

use std::sync::Arc;

use crate::pool::Connection;
use crate::protocol::{Envelope, MatchRole, ServerMessage};
use crate::state::AppState;

/// Try to pair `user_id` with any other waiting user.
///
/// On success both sides get a `match_found` announcement: the requester as
/// caller, the partner as callee. When no partner is available, or another
/// request snatched the picked partner first, the requester stays in the
/// waiting pool and is told so.
pub async fn handle_find_match(state: &AppState, conn: &Arc<Connection>, user_id: &str) {
    let Some(partner_id) = state.pool.pick_waiting_partner(user_id).await else {
        send_waiting(conn);
        return;
    };

    let Some((room, partner_conn)) = state.pool.create_room(user_id, &partner_id).await else {
        // Lost the pairing race. If the winner paired *us*, the match
        // announcement is already on its way; otherwise we are still waiting.
        if state.pool.find_partner(user_id).await.is_none() {
            send_waiting(conn);
        }
        return;
    };

    let announce = Envelope::new(ServerMessage::MatchFound {
        partner_id: partner_id.clone(),
        room_id: room.id.clone(),
        role: MatchRole::Caller,
    });
    if conn.send(announce).is_err() {
        tracing::warn!(user_id = %user_id, "failed to announce match to caller");
    }

    let partner_announce = Envelope::new(ServerMessage::MatchFound {
        partner_id: user_id.to_string(),
        room_id: room.id.clone(),
        role: MatchRole::Callee,
    });
    if partner_conn.send(partner_announce).is_err() {
        tracing::warn!(partner_id = %partner_id, "failed to announce match to callee");
    }

    tracing::info!(
        room_id = %room.id,
        caller = %user_id,
        callee = %partner_id,
        "matched users into room"
    );
}

fn send_waiting(conn: &Connection) {
    let envelope = Envelope::new(ServerMessage::Waiting {
        status: "Looking for a partner...".to_string(),
    });
    if conn.send(envelope).is_err() {
        tracing::warn!(user_id = %conn.user_id, "failed to send waiting status");
    }
}
