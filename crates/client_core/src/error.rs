use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no identity registered; connect first")]
    MissingIdentity,
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("broker connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker connection closed")]
    Closed,
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}
