//! Database schema management for `plantcare-telemetry`.
//!
//! Ensures required tables and indexes exist before ingestion starts.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `devices` (canonical device rows), `readings` (raw accepted
/// reports as JSONB), `system_logs` (operator-facing event log) and
/// `learning_points` (baseline rise history). Safe to call on every startup;
/// no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Canonical device record, merged from every report
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id   TEXT PRIMARY KEY,
            status      TEXT,
            is_online   BOOLEAN     NOT NULL DEFAULT false,
            last_seen   TIMESTAMPTZ NOT NULL DEFAULT now(),
            config      JSONB       NOT NULL DEFAULT '{}'::jsonb,
            claim_token TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id         BIGSERIAL PRIMARY KEY,
            device_id  TEXT        NOT NULL REFERENCES devices (device_id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            data       JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // type is one of: info, warning, error, success
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_logs (
            id         BIGSERIAL PRIMARY KEY,
            device_id  TEXT        NOT NULL REFERENCES devices (device_id) ON DELETE CASCADE,
            type       TEXT        NOT NULL DEFAULT 'info',
            message    TEXT        NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Append-only; never pruned by the service
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_points (
            id         BIGSERIAL PRIMARY KEY,
            device_id  TEXT             NOT NULL,
            rise       DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ      NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_device_time
            ON readings (device_id, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_logs_device_time
            ON system_logs (device_id, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_learning_points_device
            ON learning_points (device_id, id DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
