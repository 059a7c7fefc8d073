//! Data models for the telemetry pipeline.
//!
//! `StatusReport` is the loosely-typed record firmware publishes; everything
//! downstream reads it through the typed accessors here so the various
//! firmware spellings (`pumpState` vs `pump_state`, top-level `moisture` vs a
//! `plants` array) are handled in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---

/// Field names that carry device credentials and must never leave the
/// service. Any key mentioning a secret or password is stripped as well.
pub const CREDENTIAL_FIELDS: &[&str] = &["claim_pass", "claim_token"];

/// Number of anomalies kept per device for operator display.
pub const ANOMALY_LOG_CAPACITY: usize = 5;

pub fn is_credential_field(key: &str) -> bool {
    // ---
    let lower = key.to_ascii_lowercase();
    CREDENTIAL_FIELDS.contains(&lower.as_str())
        || lower.contains("secret")
        || lower.contains("password")
}

/// Copy of `fields` with every credential key removed.
pub fn sanitize(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| !is_credential_field(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Canonical state of one device as held by the device state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    // ---
    pub device_id: String,
    /// Free-form state code last reported by firmware.
    pub display_status: Option<String>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    /// Union of every field the device has ever reported, last write wins.
    pub config: Map<String, Value>,
    /// Claim credential, set once by the first report that carries one.
    #[serde(skip_serializing, default)]
    pub claim_token: Option<String>,
}

impl Device {
    pub fn new(device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            display_status: None,
            is_online: false,
            last_seen: now,
            config: Map::new(),
            claim_token: None,
        }
    }

    /// Public view of the device: merged config plus state, online flag and
    /// last-seen time, with credentials stripped.
    pub fn sanitized(&self) -> Value {
        // ---
        let mut out = sanitize(&self.config);
        if let Some(status) = &self.display_status {
            out.insert("state".into(), Value::String(status.clone()));
        }
        out.insert("online".into(), Value::Bool(self.is_online));
        out.insert("last_seen".into(), Value::String(self.last_seen.to_rfc3339()));
        Value::Object(out)
    }
}

/// Decoded payload of a `status` message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    // ---
    pub fields: Map<String, Value>,
}

impl StatusReport {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Firmware state code rendered as text (`state` may be a number or a string).
    pub fn display_status(&self) -> Option<String> {
        match self.fields.get("state")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn state_code(&self) -> Option<i64> {
        match self.fields.get("state")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn pump_state(&self) -> Option<bool> {
        // ---
        let raw = self
            .fields
            .get("pumpState")
            .or_else(|| self.fields.get("pump_state"))?;
        match raw {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "running" => Some(true),
                "0" | "false" | "off" | "stopped" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Soil moisture in percent: top-level `moisture`, else the first entry
    /// of the `plants` array.
    pub fn moisture(&self) -> Option<f64> {
        // ---
        if let Some(v) = self.number("moisture") {
            return Some(v);
        }
        self.fields
            .get("plants")?
            .as_array()?
            .first()?
            .get("moisture")?
            .as_f64()
    }

    pub fn temperature(&self) -> Option<f64> {
        self.number("temperature")
    }

    pub fn humidity(&self) -> Option<f64> {
        self.number("humidity")
    }

    pub fn threshold(&self) -> Option<f64> {
        self.number("threshold")
    }

    /// Claim credential carried by the report (`claim_pass` from firmware,
    /// `claim_token` from older builds). Empty strings do not count.
    pub fn claim_token(&self) -> Option<String> {
        ["claim_pass", "claim_token"]
            .iter()
            .filter_map(|k| self.fields.get(*k)?.as_str())
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from)
    }

    pub fn sanitized_fields(&self) -> Map<String, Value> {
        sanitize(&self.fields)
    }

    /// Detector input for this report, or `None` when the pump state or
    /// moisture reading is missing.
    pub fn observation(&self, device_id: &str, at: DateTime<Utc>) -> Option<TelemetryObservation> {
        Some(TelemetryObservation {
            device_id: device_id.to_string(),
            pump_state: self.pump_state()?,
            moisture_percent: self.moisture()?,
            temperature: self.temperature(),
            humidity: self.humidity(),
            timestamp: at,
        })
    }

    fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// One pump/moisture sample streamed into the anomaly detector.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryObservation {
    // ---
    pub device_id: String,
    pub pump_state: bool,
    pub moisture_percent: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryObservation {
    /// Moisture outside 0..=100 is a sensor fault, not a reading.
    pub fn is_plausible(&self) -> bool {
        self.moisture_percent.is_finite() && (0.0..=100.0).contains(&self.moisture_percent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Health of one device (or the whole fleet) as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAssessment {
    // ---
    pub score: u8,
    /// Newest first.
    pub anomalies: Vec<AnomalyEntry>,
    pub should_lockout: bool,
}

/// Severity column of the `system_logs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Warning,
    Error,
    Success,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Info => "info",
            LogKind::Warning => "warning",
            LogKind::Error => "error",
            LogKind::Success => "success",
        }
    }
}
