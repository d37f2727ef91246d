//! ICE server list assembly.

use std::sync::Arc;

use crate::config::Config;
use crate::pool::Connection;
use crate::protocol::{Envelope, IceServer, ServerMessage};

/// Build the ICE server entries clients feed into their RTC stack: one
/// unauthenticated entry covering all STUN servers, then one entry per
/// configured TURN server with its credentials.
pub fn ice_servers(config: &Config) -> Vec<IceServer> {
    let mut servers = Vec::new();

    if !config.stun_servers.is_empty() {
        servers.push(IceServer {
            urls: config.stun_servers.clone(),
            username: None,
            credential: None,
        });
    }

    for turn in &config.turn_servers {
        servers.push(IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
    }

    servers
}

/// Answer an in-session `get_ice_servers` request.
pub fn handle_get_ice_servers(config: &Config, conn: &Arc<Connection>) {
    let envelope = Envelope::new(ServerMessage::IceServers {
        ice_servers: ice_servers(config),
    });
    if conn.send(envelope).is_err() {
        tracing::warn!(user_id = %conn.user_id, "failed to send ICE servers");
    }
}
