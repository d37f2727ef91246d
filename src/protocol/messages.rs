//! Client-server message protocol definitions.
//!
//! Every frame on the wire is a JSON object with a `type` tag and an optional
//! `payload`. Outbound frames additionally carry `from`/`to` (set by the server
//! when relaying between partners) and a server-side `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Raw inbound frame. Decoded in two stages: first into this (which only
/// requires a JSON object with a string `type`), then into a [`ClientMessage`]
/// so that an unknown tag and a malformed payload stay distinguishable.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Client → server messages.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    FindMatch,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    CallStart,
    CallAccept,
    CallReject,
    CallEnd,
    Ping,
    Pong,
    Disconnect,
    GetIceServers,
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    BadPayload { kind: &'static str, reason: String },
}

impl ClientFrame {
    /// Resolve the tag and decode the payload into its typed shape.
    pub fn into_message(self) -> Result<ClientMessage, FrameError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &'static str,
            value: Value,
        ) -> Result<T, FrameError> {
            serde_json::from_value(value).map_err(|e| FrameError::BadPayload {
                kind,
                reason: e.to_string(),
            })
        }

        match self.kind.as_str() {
            "find_match" => Ok(ClientMessage::FindMatch),
            "offer" => Ok(ClientMessage::Offer(payload("offer", self.payload)?)),
            "answer" => Ok(ClientMessage::Answer(payload("answer", self.payload)?)),
            "ice_candidate" => Ok(ClientMessage::IceCandidate(payload(
                "ice_candidate",
                self.payload,
            )?)),
            "call_start" => Ok(ClientMessage::CallStart),
            "call_accept" => Ok(ClientMessage::CallAccept),
            "call_reject" => Ok(ClientMessage::CallReject),
            "call_end" => Ok(ClientMessage::CallEnd),
            "ping" => Ok(ClientMessage::Ping),
            "pong" => Ok(ClientMessage::Pong),
            "disconnect" => Ok(ClientMessage::Disconnect),
            "get_ice_servers" => Ok(ClientMessage::GetIceServers),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

/// An SDP offer or answer as produced by a peer's RTC stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    /// "offer" or "answer"; optional on the wire.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub sdp: String,
}

/// One ICE candidate. Unknown fields (e.g. `usernameFragment`) are kept so
/// relayed candidates reach the partner unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<i64>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// Role assigned to each side of a fresh match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchRole {
    Caller,
    Callee,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Session {
        user_id: String,
        token: String,
    },
    Waiting {
        status: String,
    },
    MatchFound {
        partner_id: String,
        room_id: String,
        role: MatchRole,
    },
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    CallIncoming {
        caller_id: String,
        room_id: String,
    },
    CallAccepted {
        callee_id: String,
        room_id: String,
    },
    CallRejected {
        reason: String,
    },
    CallEnded {
        reason: String,
    },
    PartnerDisconnected {
        reason: String,
    },
    IceServers {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    Ping,
    Error {
        message: String,
    },
}

/// Outbound frame: a [`ServerMessage`] plus the envelope fields.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            from: None,
            to: None,
            timestamp: Utc::now(),
        }
    }

    /// Envelope for a frame forwarded from one partner to the other.
    pub fn relayed(message: ServerMessage, from: &str, to: &str) -> Self {
        Self {
            message,
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// One ICE server entry handed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_client_frames() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"find_match"}"#).unwrap();
        assert!(matches!(frame.into_message(), Ok(ClientMessage::FindMatch)));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"offer","payload":{"type":"offer","sdp":"v=0"}}"#)
                .unwrap();
        match frame.into_message() {
            Ok(ClientMessage::Offer(desc)) => {
                assert_eq!(desc.kind.as_deref(), Some("offer"));
                assert_eq!(desc.sdp, "v=0");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn extra_envelope_fields_are_tolerated() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"pong","to":"someone","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(frame.into_message(), Ok(ClientMessage::Pong)));
    }

    #[test]
    fn unknown_type_is_not_a_payload_error() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"reticulate_splines"}"#).unwrap();
        assert!(matches!(
            frame.into_message(),
            Err(FrameError::UnknownType(t)) if t == "reticulate_splines"
        ));
    }

    #[test]
    fn offer_without_sdp_is_a_payload_error() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"offer","payload":{"type":"offer"}}"#).unwrap();
        match frame.into_message() {
            Err(FrameError::BadPayload { kind, reason }) => {
                assert_eq!(kind, "offer");
                assert!(reason.contains("sdp"), "reason was: {reason}");
            }
            other => panic!("expected payload error, got {other:?}"),
        }
    }

    #[test]
    fn candidate_keeps_unknown_fields() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.7 54321 typ host","sdpMLineIndex":0,"sdpMid":"0","usernameFragment":"abcd"}"#;
        let cand: IceCandidate = serde_json::from_str(json).unwrap();
        let out = serde_json::to_string(&cand).unwrap();
        assert!(out.contains("usernameFragment"));
        assert!(out.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn envelope_carries_tag_payload_and_timestamp() {
        let env = Envelope::new(ServerMessage::Session {
            user_id: "u1".into(),
            token: "t1".into(),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"session\""));
        assert!(json.contains("\"user_id\":\"u1\""));
        assert!(json.contains("\"timestamp\""));
        assert!(!json.contains("\"from\""));
    }

    #[test]
    fn relayed_envelope_sets_from_and_to() {
        let env = Envelope::relayed(
            ServerMessage::Offer(SessionDescription {
                kind: Some("offer".into()),
                sdp: "v=0".into(),
            }),
            "alice",
            "bob",
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"from\":\"alice\""));
        assert!(json.contains("\"to\":\"bob\""));
    }

    #[test]
    fn match_found_roles_serialize_lowercase() {
        let env = Envelope::new(ServerMessage::MatchFound {
            partner_id: "p".into(),
            room_id: "r".into(),
            role: MatchRole::Caller,
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"match_found\""));
        assert!(json.contains("\"role\":\"caller\""));
    }

    #[test]
    fn ice_servers_payload_uses_client_key() {
        let env = Envelope::new(ServerMessage::IceServers {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            }],
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"iceServers\""));
        assert!(!json.contains("credential"));
    }

    #[test]
    fn unit_messages_have_no_payload() {
        let json = serde_json::to_string(&Envelope::new(ServerMessage::Ping)).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(!json.contains("\"payload\""));
    }
}
