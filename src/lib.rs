//! PlantCare telemetry service library.
//!
//! Ingests MQTT telemetry from irrigation controllers, keeps the canonical
//! per-device state, detects pump anomalies after each watering cycle and
//! fans throttled updates out to dashboard subscribers.
//!
//! Modules follow the Explicit Module Boundary Pattern (EMBP): each module
//! exposes a small surface, re-exported here, and `main.rs` only wires the
//! pieces together.

pub mod baseline;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod keyed;
pub mod models;
pub mod mqtt;
pub mod predictor;
pub mod routes;
pub mod schema;
pub mod store;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decoder::{TelemetryDecoder, TelemetryEvent};
pub use detector::{AnomalyDetector, DetectorSettings};
pub use dispatch::{CommandChannel, MqttCommandChannel, LOCK_SYSTEM, UNLOCK_SYSTEM};
pub use error::DecodeError;
pub use gateway::{DeviceUpdate, UpdateHub};
pub use ingest::{IngestService, IngestSettings, LaneRouter};
pub use models::{Device, HealthAssessment, LogKind, StatusReport};
pub use predictor::{DryingPredictor, LinearDryingModel};
pub use store::{DurableStore, MemoryStore, PgStore, StoredReading};
