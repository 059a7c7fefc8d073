//! Telemetry decoder.
//!
//! Turns a raw `(topic, payload)` pair from the broker into a typed
//! [`TelemetryEvent`]. Topics have the shape `<prefix>/<device_id>/<kind>`
//! where `kind` is `status` (JSON record) or `online` (boolean-ish token).
//! Decoding never panics; anything unexpected comes back as a
//! [`DecodeError`] for the caller to log and drop.

use serde_json::Value;

use crate::error::DecodeError;
use crate::models::StatusReport;

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Status {
        device_id: String,
        report: StatusReport,
    },
    Online {
        device_id: String,
        is_online: bool,
    },
}

impl TelemetryEvent {
    pub fn device_id(&self) -> &str {
        match self {
            TelemetryEvent::Status { device_id, .. } | TelemetryEvent::Online { device_id, .. } => {
                device_id
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    // ---
    prefix: String,
}

impl TelemetryDecoder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Subscription filters covering every message kind the decoder accepts.
    pub fn subscriptions(&self) -> [String; 2] {
        [
            format!("{}/+/status", self.prefix),
            format!("{}/+/online", self.prefix),
        ]
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<TelemetryEvent, DecodeError> {
        // ---
        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        let (device_id, kind) = match rest.split('/').collect::<Vec<_>>().as_slice() {
            [device_id, kind] => (*device_id, *kind),
            _ => return Err(DecodeError::UnknownTopic(topic.to_string())),
        };
        if device_id.is_empty() {
            return Err(DecodeError::EmptyDeviceId(topic.to_string()));
        }
        let device_id = device_id.to_string();

        match kind {
            "status" => match serde_json::from_slice::<Value>(payload)? {
                Value::Object(fields) => Ok(TelemetryEvent::Status {
                    device_id,
                    report: StatusReport::new(fields),
                }),
                _ => Err(DecodeError::StatusNotAnObject),
            },
            "online" => Ok(TelemetryEvent::Online {
                device_id,
                is_online: parse_online(payload),
            }),
            other => Err(DecodeError::UnsupportedKind(other.to_string())),
        }
    }
}

/// `"true"` in any case means online; everything else, including invalid
/// UTF-8, means offline.
fn parse_online(payload: &[u8]) -> bool {
    std::str::from_utf8(payload)
        .map(|s| s.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
