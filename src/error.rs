//! Typed errors for the inbound message path.
//!
//! Everything else in the service reports failures through `anyhow`; the
//! decoder gets its own enum so the transport adapter can log exactly why a
//! message was dropped.

use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("topic '{0}' does not match '<prefix>/<device_id>/<kind>'")]
    UnknownTopic(String),

    #[error("empty device id in topic '{0}'")]
    EmptyDeviceId(String),

    #[error("unsupported message kind '{0}'")]
    UnsupportedKind(String),

    #[error("status payload is not valid JSON: {0}")]
    MalformedStatus(#[from] serde_json::Error),

    #[error("status payload must be a JSON object")]
    StatusNotAnObject,
}
