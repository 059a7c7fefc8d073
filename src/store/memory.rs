//! In-process [`DurableStore`] used by tests and embedded deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{DurableStore, StoredReading};
use crate::clock::{Clock, SystemClock};
use crate::keyed::lock;
use crate::models::{Device, LogKind};

// ---

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub device_id: String,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Default)]
struct Tables {
    devices: HashMap<String, Device>,
    readings: Vec<StoredReading>,
    learning_points: HashMap<String, Vec<f64>>,
    logs: Vec<LogRecord>,
}

pub struct MemoryStore {
    // ---
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    /// Stamps readings, standing in for the database's `now()`.
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            fail_writes: AtomicBool::new(false),
            clock,
        }
    }

    /// Make every subsequent write fail, to exercise degraded paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn readings(&self, device_id: &str) -> Vec<Value> {
        lock(&self.tables)
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .map(|r| r.data.clone())
            .collect()
    }

    pub fn logs(&self, device_id: &str) -> Vec<LogRecord> {
        lock(&self.tables)
            .logs
            .iter()
            .filter(|l| l.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn learning_points(&self, device_id: &str) -> Vec<f64> {
        lock(&self.tables)
            .learning_points
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store is refusing writes");
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        // ---
        self.check_writable()?;
        let mut tables = lock(&self.tables);
        match tables.devices.get_mut(&device.device_id) {
            Some(row) => {
                row.config.extend(device.config.clone());
                if device.display_status.is_some() {
                    row.display_status = device.display_status.clone();
                }
                row.is_online = device.is_online;
                row.last_seen = device.last_seen;
                if row.claim_token.is_none() {
                    row.claim_token = device.claim_token.clone();
                }
            }
            None => {
                tables.devices.insert(device.device_id.clone(), device.clone());
            }
        }
        Ok(())
    }

    async fn load_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(lock(&self.tables).devices.get(device_id).cloned())
    }

    async fn insert_reading(&self, device_id: &str, data: &Value) -> Result<()> {
        self.check_writable()?;
        let reading = StoredReading {
            device_id: device_id.to_string(),
            recorded_at: self.clock.now(),
            data: data.clone(),
        };
        lock(&self.tables).readings.push(reading);
        Ok(())
    }

    async fn load_recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        // ---
        let tables = lock(&self.tables);
        let skip = tables.readings.len().saturating_sub(limit);
        Ok(tables.readings[skip..].to_vec())
    }

    async fn append_learning_point(&self, device_id: &str, rise: f64) -> Result<()> {
        self.check_writable()?;
        lock(&self.tables)
            .learning_points
            .entry(device_id.to_string())
            .or_default()
            .push(rise);
        Ok(())
    }

    async fn load_recent_learning_points(&self, device_id: &str, limit: usize) -> Result<Vec<f64>> {
        // ---
        let tables = lock(&self.tables);
        let points = tables
            .learning_points
            .get(device_id)
            .map(|p| p.iter().rev().take(limit).copied().collect())
            .unwrap_or_default();
        Ok(points)
    }

    async fn insert_log(&self, device_id: &str, kind: LogKind, message: &str) -> Result<()> {
        self.check_writable()?;
        lock(&self.tables).logs.push(LogRecord {
            device_id: device_id.to_string(),
            kind,
            message: message.to_string(),
        });
        Ok(())
    }
}
