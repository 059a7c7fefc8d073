//! Device-update fan-out.
//!
//! The `onDeviceUpdate` side of the service: state changes are published on
//! a `tokio` broadcast channel that websocket subscribers (see
//! `routes::ws`) read from. Publishing goes through the broadcast
//! [`Throttler`] and strips credential fields, so nothing downstream can
//! see a claim token regardless of what the caller passed in.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::sanitize;
use crate::throttle::Throttler;

// ---

const CHANNEL_CAPACITY: usize = 256;

/// One notification as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub device_id: String,
    pub data: Value,
}

pub struct UpdateHub {
    // ---
    tx: broadcast::Sender<DeviceUpdate>,
    throttler: Throttler,
}

impl UpdateHub {
    pub fn new(throttler: Throttler) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, throttler }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.tx.subscribe()
    }

    /// Publish `state` for `device_id` unless the device was broadcast too
    /// recently. Returns whether an update went out.
    pub fn publish(&self, device_id: &str, state: Value) -> bool {
        // ---
        if !self.throttler.should_emit(device_id) {
            trace!(device_id, "Broadcast throttled");
            return false;
        }
        let data = match state {
            Value::Object(fields) => Value::Object(sanitize(&fields)),
            other => other,
        };
        // no subscribers is not an error
        let _ = self.tx.send(DeviceUpdate {
            device_id: device_id.to_string(),
            data,
        });
        true
    }
}
