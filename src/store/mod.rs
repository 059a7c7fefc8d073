//! Device state store and the durable-store boundary.
//!
//! [`DeviceStateStore`] is the authoritative in-memory record per device.
//! Every mutation happens under that device's lock and updates `config`,
//! `is_online` and `last_seen` together, so readers never see a half-merged
//! report. The merged snapshot is then written through to the
//! [`DurableStore`]; a failed write is returned to the caller while the
//! in-memory view stays consistent and keeps advancing.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::Clock;
use crate::keyed::{lock, Keyed};
use crate::models::{sanitize, Device, LogKind};

mod memory;
mod postgres;

pub use memory::{LogRecord, MemoryStore};
pub use postgres::PgStore;

// ---

/// Persistence operations the core issues as side effects. Schema and
/// migrations are owned elsewhere (see `schema`).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Merge `device` into its durable row: config is union-merged, the
    /// claim token is only filled when still empty.
    async fn upsert_device(&self, device: &Device) -> Result<()>;

    async fn load_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn insert_reading(&self, device_id: &str, data: &Value) -> Result<()>;

    /// The most recent `limit` readings across all devices, oldest first.
    async fn load_recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>>;

    async fn append_learning_point(&self, device_id: &str, rise: f64) -> Result<()>;

    /// Most recent `limit` learning points for `device_id`, newest first.
    async fn load_recent_learning_points(&self, device_id: &str, limit: usize) -> Result<Vec<f64>>;

    async fn insert_log(&self, device_id: &str, kind: LogKind, message: &str) -> Result<()>;
}

/// One row of the readings table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub device_id: String,
    pub recorded_at: DateTime<Utc>,
    pub data: Value,
}

pub struct DeviceStateStore {
    // ---
    devices: Keyed<Option<Device>>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl DeviceStateStore {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            devices: Keyed::default(),
            durable,
            clock,
        }
    }

    /// Merge a status report into the device record.
    ///
    /// Reported fields overwrite same-named config entries and leave the rest
    /// alone; credentials are never merged into config. The device is marked
    /// online and `last_seen` advances. `claim_token` is only taken when the
    /// device has none yet.
    pub async fn upsert_status(
        &self,
        device_id: &str,
        reported: &Map<String, Value>,
        display_status: Option<String>,
        claim_token: Option<String>,
    ) -> Result<Device> {
        // ---
        let now = self.clock.now();
        let snapshot = {
            let slot = self.devices.slot(device_id);
            let mut guard = lock(&slot);
            let device = guard.get_or_insert_with(|| Device::new(device_id, now));

            device.config.extend(sanitize(reported));
            if display_status.is_some() {
                device.display_status = display_status;
            }
            if device.claim_token.is_none() {
                device.claim_token = claim_token;
            }
            device.is_online = true;
            device.last_seen = now;
            device.clone()
        };

        debug!(device_id, fields = reported.len(), "Merged status report");
        self.durable.upsert_device(&snapshot).await?;
        Ok(snapshot)
    }

    /// Record an online/offline transition. Config is untouched.
    pub async fn upsert_online(&self, device_id: &str, is_online: bool) -> Result<Device> {
        // ---
        let now = self.clock.now();
        let snapshot = {
            let slot = self.devices.slot(device_id);
            let mut guard = lock(&slot);
            let device = guard.get_or_insert_with(|| Device::new(device_id, now));
            device.is_online = is_online;
            device.last_seen = now;
            device.clone()
        };

        self.durable.upsert_device(&snapshot).await?;
        Ok(snapshot)
    }

    /// Current snapshot, or `None` when the device has never reported.
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.with(device_id, |d| d.clone()).flatten()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .devices
            .keys()
            .into_iter()
            .filter(|id| self.get(id).is_some())
            .collect();
        ids.sort();
        ids
    }

    /// Seed the in-memory record from durable storage. Returns whether a
    /// durable row exists; `false` means the device is about to be
    /// auto-registered.
    ///
    /// A record already built in memory (e.g. while an earlier hydration
    /// failed) is layered over the durable row: its config entries and
    /// online state win, while a durable claim token is kept over any token
    /// taken in memory since.
    pub async fn hydrate(&self, device_id: &str) -> Result<bool> {
        // ---
        let Some(stored) = self.durable.load_device(device_id).await? else {
            return Ok(false);
        };

        let slot = self.devices.slot(device_id);
        let mut guard = lock(&slot);
        let merged = match guard.take() {
            None => stored,
            Some(current) => overlay(stored, current),
        };
        debug!(device_id, "Hydrated device from durable store");
        *guard = Some(merged);
        Ok(true)
    }
}

fn overlay(stored: Device, current: Device) -> Device {
    // ---
    let mut merged = stored;
    merged.config.extend(current.config);
    if current.display_status.is_some() {
        merged.display_status = current.display_status;
    }
    if merged.claim_token.is_none() {
        merged.claim_token = current.claim_token;
    }
    merged.is_online = current.is_online;
    merged.last_seen = current.last_seen;
    merged
}
