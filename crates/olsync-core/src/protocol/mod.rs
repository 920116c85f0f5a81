//! Wire protocol of the realtime socket.
//!
//! - [`frame`]: socket.io 0.9 text framing (`type:id[+]:endpoint[:data]`)
//! - [`messages`]: typed server events and request/response payloads
//!
//! Untyped argument arrays are converted into typed records here, once, so the
//! engine never matches on event-name strings.

pub mod frame;
pub mod messages;

pub use frame::Frame;
pub use messages::{DocSnapshot, JoinProjectReply, OtUpdate, ServerEvent};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn payload(event: &str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidPayload {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}
