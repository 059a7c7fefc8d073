//! Application entry point for the `plantcare-telemetry` service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and creating the schema
//! - Fitting the drying model to stored history
//! - Building the ingestion service over the durable store
//! - Connecting to the MQTT broker and feeding per-device lanes
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `PLANTCARE_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `PLANTCARE_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config` for the remaining variables.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use plantcare_telemetry::ingest::DEFAULT_LANE_DEPTH;
use plantcare_telemetry::{
    config, mqtt, predictor, routes, schema, DurableStore, IngestService, LaneRouter,
    MqttCommandChannel, PgStore, SystemClock,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let durable: Arc<dyn DurableStore> = Arc::new(PgStore::new(pool));
    let model = predictor::trained_model(durable.as_ref(), cfg.predictor_training_limit).await;

    let (client, eventloop) = mqtt::connect(&cfg);
    let channel = Arc::new(MqttCommandChannel::new(client.clone(), cfg.topic_prefix.clone()));

    let service = Arc::new(IngestService::new(
        cfg.ingest_settings(),
        durable,
        channel,
        Arc::new(model),
        Arc::new(SystemClock),
    ));

    let lanes = LaneRouter::new(service.clone(), DEFAULT_LANE_DEPTH);
    let subscriptions = service.decoder().subscriptions();
    tokio::spawn(mqtt::run(client, eventloop, subscriptions, lanes));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(service);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by `PLANTCARE_SPAN_EVENTS`:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, else `PLANTCARE_LOG_LEVEL`
///
/// Call once at startup, before any tracing macro fires.
fn init_tracing() {
    // ---
    let span_events = match env::var("PLANTCARE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("PLANTCARE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
