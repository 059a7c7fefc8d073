//! Configuration loader for the `plantcare-telemetry` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detector::DetectorSettings;
use crate::ingest::IngestSettings;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional floating point environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Optional string environment variable with a default value.
macro_rules! env_or {
    ($var_name:expr, $default:expr) => {
        env::var($var_name).unwrap_or_else(|_| $default.to_string())
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Port the HTTP API listens on.
    pub http_port: u16,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,

    /// Topic prefix; devices publish on `<prefix>/<device_id>/<kind>`.
    pub topic_prefix: String,

    /// Post-watering observation window.
    pub soak_window: Duration,

    /// Health score below which lockout is signalled.
    pub lockout_threshold: u8,

    /// Minimum spacing of device-update broadcasts per device.
    pub broadcast_throttle: Duration,

    /// Minimum spacing of accepted status messages per device (0 disables).
    pub ingest_throttle: Duration,

    /// Minimum spacing of online/offline log entries per device.
    pub online_log_interval: Duration,

    /// Baseline points loaded from storage per device.
    pub learning_load_limit: usize,

    /// Default critical moisture (percent) for the drying predictor.
    pub dry_threshold: f64,

    /// Stored readings the drying model is fitted to at startup.
    pub predictor_training_limit: usize,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_PORT` – HTTP listen port (default: 8080)
/// - `MQTT_HOST` / `MQTT_PORT` / `MQTT_CLIENT_ID` – broker connection
///   (default: `localhost` / 1883 / `plantcare-telemetry`)
/// - `MQTT_TOPIC_PREFIX` – topic prefix (default: `plantcare`)
/// - `SOAK_WINDOW_SECS` – soak window (default: 35)
/// - `LOCKOUT_THRESHOLD` – lockout score (default: 60)
/// - `BROADCAST_THROTTLE_MS` – broadcast interval (default: 100)
/// - `INGEST_THROTTLE_MS` – status burst filter (default: 200)
/// - `ONLINE_LOG_INTERVAL_SECS` – online log anti-spam (default: 60)
/// - `LEARNING_LOAD_LIMIT` – baseline points loaded (default: 20)
/// - `DRY_THRESHOLD_PERCENT` – predictor threshold (default: 30)
/// - `PREDICTOR_TRAINING_LIMIT` – readings used to fit the drying model (default: 500)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let http_port = to_u16("HTTP_PORT", parse_env_u32!("HTTP_PORT", 8080))?;
    let mqtt_host = env_or!("MQTT_HOST", "localhost");
    let mqtt_port = to_u16("MQTT_PORT", parse_env_u32!("MQTT_PORT", 1883))?;
    let mqtt_client_id = env_or!("MQTT_CLIENT_ID", "plantcare-telemetry");
    let topic_prefix = env_or!("MQTT_TOPIC_PREFIX", "plantcare");
    let soak_window = Duration::from_secs(parse_env_u32!("SOAK_WINDOW_SECS", 35).into());
    let lockout_threshold = u8::try_from(parse_env_u32!("LOCKOUT_THRESHOLD", 60))
        .ok()
        .filter(|t| *t <= 100)
        .ok_or_else(|| anyhow!("Invalid LOCKOUT_THRESHOLD: must be 0-100"))?;
    let broadcast_throttle =
        Duration::from_millis(parse_env_u32!("BROADCAST_THROTTLE_MS", 100).into());
    let ingest_throttle = Duration::from_millis(parse_env_u32!("INGEST_THROTTLE_MS", 200).into());
    let online_log_interval =
        Duration::from_secs(parse_env_u32!("ONLINE_LOG_INTERVAL_SECS", 60).into());
    let learning_load_limit = parse_env_u32!("LEARNING_LOAD_LIMIT", 20) as usize;
    let dry_threshold = parse_env_f64!("DRY_THRESHOLD_PERCENT", 30.0);
    let predictor_training_limit = parse_env_u32!("PREDICTOR_TRAINING_LIMIT", 500) as usize;

    if topic_prefix.trim_matches('/').is_empty() {
        return Err(anyhow!("Invalid MQTT_TOPIC_PREFIX: must not be empty"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        http_port,
        mqtt_host,
        mqtt_port,
        mqtt_client_id,
        topic_prefix,
        soak_window,
        lockout_threshold,
        broadcast_throttle,
        ingest_throttle,
        online_log_interval,
        learning_load_limit,
        dry_threshold,
        predictor_training_limit,
    })
}

fn to_u16(name: &str, value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| anyhow!("Invalid {}: {} is not a valid port", name, value))
}

impl Config {
    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            soak_window: self.soak_window,
            lockout_threshold: self.lockout_threshold,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            topic_prefix: self.topic_prefix.clone(),
            detector: self.detector_settings(),
            broadcast_throttle: self.broadcast_throttle,
            ingest_throttle: self.ingest_throttle,
            online_log_interval: self.online_log_interval,
            learning_load_limit: self.learning_load_limit,
            dry_threshold: self.dry_threshold,
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL             : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX              : {}", self.db_pool_max);
        tracing::info!("  HTTP_PORT                : {}", self.http_port);
        tracing::info!("  MQTT broker              : {}:{}", self.mqtt_host, self.mqtt_port);
        tracing::info!("  MQTT_CLIENT_ID           : {}", self.mqtt_client_id);
        tracing::info!("  MQTT_TOPIC_PREFIX        : {}", self.topic_prefix);
        tracing::info!("  SOAK_WINDOW_SECS         : {}", self.soak_window.as_secs());
        tracing::info!("  LOCKOUT_THRESHOLD        : {}", self.lockout_threshold);
        tracing::info!("  BROADCAST_THROTTLE_MS    : {}", self.broadcast_throttle.as_millis());
        tracing::info!("  INGEST_THROTTLE_MS       : {}", self.ingest_throttle.as_millis());
        tracing::info!("  ONLINE_LOG_INTERVAL_SECS : {}", self.online_log_interval.as_secs());
        tracing::info!("  LEARNING_LOAD_LIMIT      : {}", self.learning_load_limit);
        tracing::info!("  DRY_THRESHOLD_PERCENT    : {}", self.dry_threshold);
        tracing::info!("  PREDICTOR_TRAINING_LIMIT : {}", self.predictor_training_limit);
    }
}

/// Mask the password in a database URL for logging.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // a colon right after the scheme means there is no password
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}
