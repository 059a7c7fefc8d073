//! PostgreSQL-backed [`DurableStore`].
//!
//! Tables are created by `schema::create_schema` at startup. Device upserts
//! merge on the database side as well, so a row written by an older process
//! never loses fields or its claim token.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;

use super::{DurableStore, StoredReading};
use crate::models::{Device, LogKind};

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    // ---
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    status: Option<String>,
    is_online: bool,
    last_seen: DateTime<Utc>,
    config: Json<Map<String, Value>>,
    claim_token: Option<String>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            device_id: row.device_id,
            display_status: row.status,
            is_online: row.is_online,
            last_seen: row.last_seen,
            config: row.config.0,
            claim_token: row.claim_token,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    device_id: String,
    created_at: DateTime<Utc>,
    data: Json<Value>,
}

impl From<ReadingRow> for StoredReading {
    fn from(row: ReadingRow) -> Self {
        StoredReading {
            device_id: row.device_id,
            recorded_at: row.created_at,
            data: row.data.0,
        }
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, status, is_online, last_seen, config, claim_token)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (device_id) DO UPDATE SET
                status      = COALESCE(EXCLUDED.status, devices.status),
                is_online   = EXCLUDED.is_online,
                last_seen   = EXCLUDED.last_seen,
                config      = devices.config || EXCLUDED.config,
                claim_token = COALESCE(devices.claim_token, EXCLUDED.claim_token)
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.display_status)
        .bind(device.is_online)
        .bind(device.last_seen)
        .bind(Json(&device.config))
        .bind(&device.claim_token)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_device(&self, device_id: &str) -> Result<Option<Device>> {
        // ---
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, status, is_online, last_seen, config, claim_token
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Device::from))
    }

    async fn insert_reading(&self, device_id: &str, data: &Value) -> Result<()> {
        // ---
        sqlx::query("INSERT INTO readings (device_id, data) VALUES ($1, $2)")
            .bind(device_id)
            .bind(Json(data))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        // ---
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT device_id, created_at, data
            FROM (
                SELECT id, device_id, created_at, data
                FROM readings
                ORDER BY id DESC
                LIMIT $1
            ) recent
            ORDER BY id ASC
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredReading::from).collect())
    }

    async fn append_learning_point(&self, device_id: &str, rise: f64) -> Result<()> {
        // ---
        sqlx::query("INSERT INTO learning_points (device_id, rise) VALUES ($1, $2)")
            .bind(device_id)
            .bind(rise)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_recent_learning_points(&self, device_id: &str, limit: usize) -> Result<Vec<f64>> {
        // ---
        let points = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT rise
            FROM learning_points
            WHERE device_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }

    async fn insert_log(&self, device_id: &str, kind: LogKind, message: &str) -> Result<()> {
        // ---
        sqlx::query("INSERT INTO system_logs (device_id, type, message) VALUES ($1, $2, $3)")
            .bind(device_id)
            .bind(kind.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
