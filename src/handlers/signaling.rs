//! WebRTC signaling relay and call control.
//!
//! Offers, answers and candidates are validated, stamped with the sender's id
//! and forwarded to the current partner. Call-control messages additionally
//! move both participants through the call state machine.

use std::sync::Arc;

use crate::pool::{CallState, Connection};
use crate::protocol::{Envelope, IceCandidate, ServerMessage, SessionDescription};
use crate::state::AppState;
use crate::validation;

/// Relay an SDP offer to the partner; both sides move to ringing.
pub async fn handle_offer(
    state: &AppState,
    conn: &Arc<Connection>,
    user_id: &str,
    desc: SessionDescription,
) {
    if let Err(reason) = validation::validate_offer(&desc) {
        tracing::warn!(user_id = %user_id, %reason, "rejected SDP offer");
        send_error(conn, format!("Invalid SDP offer format: {reason}"));
        return;
    }

    let Some(partner) = state.pool.find_partner(user_id).await else {
        send_error(conn, "No partner found for offer".to_string());
        return;
    };

    state
        .pool
        .set_call_states(user_id, &partner.id, CallState::Ringing)
        .await;

    let envelope = Envelope::relayed(ServerMessage::Offer(desc), user_id, &partner.id);
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to forward offer");
        send_error(conn, "Failed to forward offer".to_string());
        return;
    }
    tracing::debug!(from = %user_id, to = %partner.id, "relayed offer");
}

/// Relay an SDP answer; both sides move to answered and the room records its
/// start time.
pub async fn handle_answer(
    state: &AppState,
    conn: &Arc<Connection>,
    user_id: &str,
    desc: SessionDescription,
) {
    if let Err(reason) = validation::validate_answer(&desc) {
        tracing::warn!(user_id = %user_id, %reason, "rejected SDP answer");
        send_error(conn, format!("Invalid SDP answer format: {reason}"));
        return;
    }

    let Some(partner) = state.pool.find_partner(user_id).await else {
        send_error(conn, "No partner found for answer".to_string());
        return;
    };

    state.pool.mark_call_answered(user_id).await;

    let envelope = Envelope::relayed(ServerMessage::Answer(desc), user_id, &partner.id);
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to forward answer");
        send_error(conn, "Failed to forward answer".to_string());
        return;
    }
    tracing::debug!(from = %user_id, to = %partner.id, "relayed answer");
}

/// Relay an ICE candidate. Candidates may trickle in after the partner is
/// gone, so a missing partner drops the candidate silently.
pub async fn handle_candidate(
    state: &AppState,
    conn: &Arc<Connection>,
    user_id: &str,
    cand: IceCandidate,
) {
    if let Err(reason) = validation::validate_candidate(&cand) {
        tracing::warn!(user_id = %user_id, %reason, "rejected ICE candidate");
        send_error(conn, "Invalid ICE candidate format".to_string());
        return;
    }

    let Some(partner) = state.pool.find_partner(user_id).await else {
        tracing::debug!(user_id = %user_id, "dropping candidate without partner");
        return;
    };

    let envelope = Envelope::relayed(ServerMessage::IceCandidate(cand), user_id, &partner.id);
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to forward candidate");
    }
}

/// Announce an incoming call; the initiator moves to ringing.
pub async fn handle_call_start(state: &AppState, conn: &Arc<Connection>, user_id: &str) {
    let Some(partner) = state.pool.find_partner(user_id).await else {
        send_error(conn, "No partner found to start call".to_string());
        return;
    };

    let envelope = Envelope::relayed(
        ServerMessage::CallIncoming {
            caller_id: user_id.to_string(),
            room_id: partner.room_id.clone(),
        },
        user_id,
        &partner.id,
    );
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to announce call");
        send_error(conn, "Failed to initiate call".to_string());
        return;
    }

    state.pool.set_call_state(user_id, CallState::Ringing).await;
    tracing::info!(caller = %user_id, callee = %partner.id, "call initiated");
}

/// Accept an incoming call; both sides move to answered.
pub async fn handle_call_accept(state: &AppState, conn: &Arc<Connection>, user_id: &str) {
    let Some(partner) = state.pool.find_partner(user_id).await else {
        send_error(conn, "No partner found to accept call".to_string());
        return;
    };

    let envelope = Envelope::relayed(
        ServerMessage::CallAccepted {
            callee_id: user_id.to_string(),
            room_id: partner.room_id.clone(),
        },
        user_id,
        &partner.id,
    );
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to send call acceptance");
        return;
    }

    state
        .pool
        .set_call_states(user_id, &partner.id, CallState::Answered)
        .await;
    tracing::info!(callee = %user_id, caller = %partner.id, "call accepted");
}

/// Reject an incoming call; both sides move to ended.
pub async fn handle_call_reject(state: &AppState, user_id: &str) {
    let Some(partner) = state.pool.find_partner(user_id).await else {
        return;
    };

    let envelope = Envelope::relayed(
        ServerMessage::CallRejected {
            reason: "Call rejected".to_string(),
        },
        user_id,
        &partner.id,
    );
    if partner.conn.send(envelope).is_err() {
        tracing::warn!(from = %user_id, to = %partner.id, "failed to send call rejection");
    }

    state
        .pool
        .set_call_states(user_id, &partner.id, CallState::Ended)
        .await;
    tracing::info!(user_id = %user_id, partner_id = %partner.id, "call rejected");
}

/// End the call; both sides and the room move to ended.
pub async fn handle_call_end(state: &AppState, user_id: &str) {
    if let Some(partner) = state.pool.find_partner(user_id).await {
        let envelope = Envelope::relayed(
            ServerMessage::CallEnded {
                reason: "Call ended by peer".to_string(),
            },
            user_id,
            &partner.id,
        );
        if partner.conn.send(envelope).is_err() {
            tracing::warn!(from = %user_id, to = %partner.id, "failed to send call end");
        }
    }

    state.pool.mark_call_ended(user_id).await;
    tracing::info!(user_id = %user_id, "call ended");
}

/// Send a typed error frame back to the originating client.
pub(crate) fn send_error(conn: &Connection, message: String) {
    let envelope = Envelope::new(ServerMessage::Error { message });
    if conn.send(envelope).is_err() {
        tracing::warn!(user_id = %conn.user_id, "failed to deliver error message");
    }
}
