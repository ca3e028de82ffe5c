//! JSON encoding of the event union and presence payloads.
//!
//! Timestamps always leave as ISO-8601 strings (see
//! [`shared::protocol::wire_time`]); decoding accepts strings or epoch
//! milliseconds and yields `DateTime<Utc>` either way.

use shared::protocol::{ChatEvent, PresenceUpdate};
use tracing::warn;

use crate::error::CodecError;

pub fn encode(event: &ChatEvent) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(|source| CodecError::Encode {
        kind: event.kind(),
        source,
    })
}

pub fn decode(payload: &[u8]) -> Result<ChatEvent, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

/// Decodes an inbound payload, logging and discarding anything malformed
/// so one bad message never stalls the listener.
pub fn decode_or_log(topic: &str, payload: &[u8]) -> Option<ChatEvent> {
    match decode(payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(topic, bytes = payload.len(), error = %err, "codec: dropping undecodable payload");
            None
        }
    }
}

pub fn encode_presence(update: &PresenceUpdate) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(update).map_err(|source| CodecError::Encode {
        kind: "presence",
        source,
    })
}

pub fn decode_presence(payload: &[u8]) -> Result<PresenceUpdate, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
