//! Shared fixtures for the integration tests: an ingestion service over the
//! in-memory store, a manual clock and a command channel that records what
//! it was asked to send.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use plantcare_telemetry::keyed::lock;
use plantcare_telemetry::{
    CommandChannel, Device, DurableStore, IngestService, IngestSettings, LinearDryingModel,
    LogKind, ManualClock, MemoryStore, StoredReading,
};

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn publish_command(&self, device_id: &str, command: &str) -> Result<()> {
        lock(&self.sent).push((device_id.to_string(), command.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<IngestService>,
    pub durable: Arc<MemoryStore>,
    pub channel: Arc<RecordingChannel>,
    pub clock: Arc<ManualClock>,
}

fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
    ))
}

impl Harness {
    /// Fresh service whose store stamps readings with the harness clock.
    pub fn new() -> Self {
        // ---
        let clock = start_clock();
        let durable = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self::build(durable.clone(), durable, clock)
    }

    /// Service over an existing store, as after a process restart.
    pub fn with_store(durable: Arc<MemoryStore>) -> Self {
        Self::build(durable.clone(), durable, start_clock())
    }

    /// Service talking to `layer`, with `durable` kept for inspection.
    pub fn with_layer(durable: Arc<MemoryStore>, layer: Arc<dyn DurableStore>) -> Self {
        Self::build(durable, layer, start_clock())
    }

    fn build(
        durable: Arc<MemoryStore>,
        layer: Arc<dyn DurableStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        // ---
        let channel = Arc::new(RecordingChannel::default());
        // 0.1 moisture points per minute regardless of conditions
        let predictor = Arc::new(LinearDryingModel {
            w_temperature: 0.0,
            w_humidity: 0.0,
            bias: 0.1,
        });
        let service = Arc::new(IngestService::new(
            IngestSettings::default(),
            layer,
            channel.clone(),
            predictor,
            clock.clone(),
        ));
        Self {
            service,
            durable,
            channel,
            clock,
        }
    }

    pub async fn status(&self, device_id: &str, body: Value) {
        let topic = format!("plantcare/{device_id}/status");
        self.service
            .handle_message(&topic, body.to_string().as_bytes())
            .await;
    }

    pub async fn online(&self, device_id: &str, is_online: bool) {
        let topic = format!("plantcare/{device_id}/online");
        self.service
            .handle_message(&topic, is_online.to_string().as_bytes())
            .await;
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub fn log_messages(&self, device_id: &str) -> Vec<String> {
        self.durable
            .logs(device_id)
            .into_iter()
            .map(|l| l.message)
            .collect()
    }
}

/// Store whose loads fail until [`FlakyLoads::recover`] is called. Writes go
/// straight through to the wrapped store.
pub struct FlakyLoads {
    inner: Arc<MemoryStore>,
    down: AtomicBool,
}

impl FlakyLoads {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(true),
        }
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyLoads {
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.inner.upsert_device(device).await
    }

    async fn load_device(&self, device_id: &str) -> Result<Option<Device>> {
        self.check()?;
        self.inner.load_device(device_id).await
    }

    async fn insert_reading(&self, device_id: &str, data: &Value) -> Result<()> {
        self.inner.insert_reading(device_id, data).await
    }

    async fn load_recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        self.check()?;
        self.inner.load_recent_readings(limit).await
    }

    async fn append_learning_point(&self, device_id: &str, rise: f64) -> Result<()> {
        self.inner.append_learning_point(device_id, rise).await
    }

    async fn load_recent_learning_points(&self, device_id: &str, limit: usize) -> Result<Vec<f64>> {
        self.check()?;
        self.inner.load_recent_learning_points(device_id, limit).await
    }

    async fn insert_log(&self, device_id: &str, kind: LogKind, message: &str) -> Result<()> {
        self.inner.insert_log(device_id, kind, message).await
    }
}
