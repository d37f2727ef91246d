//! Shape checks for signaling payloads before they are relayed to a partner.
//!
//! These are pure functions: no state, no I/O, same verdict for the same
//! input. The error text is sent back to the offending client verbatim, so it
//! stays short and descriptive.

use thiserror::Error;

use crate::protocol::{IceCandidate, SessionDescription};

/// Whole-frame ceiling.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
/// Session description ceiling.
pub const MAX_SDP_SIZE: usize = 10 * 1024;
/// Candidate ceiling.
pub const MAX_CANDIDATE_SIZE: usize = 1024;

const MAX_SDP_MLINE_INDEX: i64 = 10;
const MAX_SDP_MID_LEN: usize = 100;

/// A payload that must not reach the partner, with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Validate an SDP offer.
pub fn validate_offer(desc: &SessionDescription) -> Result<(), ValidationError> {
    validate_sdp(desc, "offer")
}

/// Validate an SDP answer.
pub fn validate_answer(desc: &SessionDescription) -> Result<(), ValidationError> {
    validate_sdp(desc, "answer")
}

fn validate_sdp(desc: &SessionDescription, expected: &str) -> Result<(), ValidationError> {
    if desc.sdp.is_empty() {
        return Err(ValidationError::new("SDP cannot be empty"));
    }
    if desc.sdp.len() > MAX_SDP_SIZE {
        return Err(ValidationError::new(format!(
            "SDP exceeds maximum size of {MAX_SDP_SIZE} bytes"
        )));
    }
    if let Some(kind) = &desc.kind {
        if kind != expected {
            return Err(ValidationError::new(format!(
                "expected type '{expected}', got '{kind}'"
            )));
        }
    }
    if !desc.sdp.starts_with("v=0") {
        return Err(ValidationError::new("SDP must start with 'v=0'"));
    }
    for line in ["o=", "s=", "t="] {
        if !desc.sdp.contains(line) {
            return Err(ValidationError::new(format!(
                "SDP missing required line starting with '{line}'"
            )));
        }
    }
    if !desc.sdp.contains("m=audio") && !desc.sdp.contains("m=application") {
        return Err(ValidationError::new(
            "SDP must contain at least one media line (m=audio or m=application)",
        ));
    }
    Ok(())
}

/// Validate an ICE candidate.
pub fn validate_candidate(cand: &IceCandidate) -> Result<(), ValidationError> {
    if cand.candidate.is_empty() {
        return Err(ValidationError::new("candidate cannot be empty"));
    }
    if cand.candidate.len() > MAX_CANDIDATE_SIZE {
        return Err(ValidationError::new(format!(
            "candidate exceeds maximum size of {MAX_CANDIDATE_SIZE} bytes"
        )));
    }
    if !cand.candidate.contains("candidate:") {
        return Err(ValidationError::new(
            "candidate must contain 'candidate:' prefix",
        ));
    }
    if let Some(index) = cand.sdp_mline_index {
        if !(0..=MAX_SDP_MLINE_INDEX).contains(&index) {
            return Err(ValidationError::new(format!(
                "sdpMLineIndex must be between 0 and {MAX_SDP_MLINE_INDEX}"
            )));
        }
    }
    if let Some(mid) = &cand.sdp_mid {
        if mid.len() > MAX_SDP_MID_LEN {
            return Err(ValidationError::new(format!(
                "sdpMid must be at most {MAX_SDP_MID_LEN} bytes"
            )));
        }
    }
    Ok(())
}

/// Reject frames over the transport ceiling before decoding them.
pub fn validate_frame(len: usize) -> Result<(), ValidationError> {
    if len > MAX_FRAME_SIZE {
        return Err(ValidationError::new(format!(
            "message size exceeds maximum allowed size of {MAX_FRAME_SIZE} bytes"
        )));
    }
    Ok(())
}
