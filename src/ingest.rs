//! Ingestion service.
//!
//! Owns every per-device component and runs each inbound message through
//! them in a fixed order:
//!
//! 1. burst filter (status only)
//! 2. first-sight hydration and baseline load
//! 3. device state upsert
//! 4. anomaly detector step, with lockout dispatch
//! 5. reading persistence and system logs
//! 6. throttled, sanitized broadcast
//!
//! Persistence failures are logged and never stop the remaining steps or
//! later messages. Per-device ordering is provided by [`LaneRouter`]: one
//! queue and worker task per device, so two messages from the same device
//! are never processed concurrently or out of arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::baseline::BaselineLearner;
use crate::clock::Clock;
use crate::decoder::{TelemetryDecoder, TelemetryEvent};
use crate::detector::{AnomalyDetector, DetectorSettings, DetectorStep, RiseVerdict};
use crate::dispatch::{CommandChannel, CommandDispatcher, LOCK_SYSTEM, UNLOCK_SYSTEM};
use crate::gateway::UpdateHub;
use crate::keyed::lock;
use crate::models::{HealthAssessment, LogKind, StatusReport};
use crate::predictor::DryingPredictor;
use crate::store::{DeviceStateStore, DurableStore};
use crate::throttle::{Throttler, DEFAULT_BROADCAST_INTERVAL};

// ---

/// Firmware state codes that indicate a fault needing attention.
const CRITICAL_STATES: [i64; 2] = [3, 4];

/// Messages buffered per device before new ones are dropped.
pub const DEFAULT_LANE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    // ---
    pub topic_prefix: String,
    pub detector: DetectorSettings,
    pub broadcast_throttle: Duration,
    pub ingest_throttle: Duration,
    pub online_log_interval: Duration,
    pub learning_load_limit: usize,
    pub dry_threshold: f64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            topic_prefix: "plantcare".to_string(),
            detector: DetectorSettings::default(),
            broadcast_throttle: DEFAULT_BROADCAST_INTERVAL,
            ingest_throttle: Duration::from_millis(200),
            online_log_interval: Duration::from_secs(60),
            learning_load_limit: 20,
            dry_threshold: 30.0,
        }
    }
}

pub struct IngestService {
    // ---
    settings: IngestSettings,
    decoder: TelemetryDecoder,
    store: DeviceStateStore,
    detector: AnomalyDetector,
    hub: UpdateHub,
    dispatcher: CommandDispatcher,
    predictor: Arc<dyn DryingPredictor>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    ingest_throttle: Throttler,
    online_log_throttle: Throttler,
    /// Devices whose durable row has been read into memory.
    hydrated: Mutex<HashSet<String>>,
}

impl IngestService {
    pub fn new(
        settings: IngestSettings,
        durable: Arc<dyn DurableStore>,
        channel: Arc<dyn CommandChannel>,
        predictor: Arc<dyn DryingPredictor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // ---
        let learner = Arc::new(BaselineLearner::new(
            durable.clone(),
            settings.learning_load_limit,
        ));
        Self {
            decoder: TelemetryDecoder::new(settings.topic_prefix.clone()),
            store: DeviceStateStore::new(durable.clone(), clock.clone()),
            detector: AnomalyDetector::new(learner, settings.detector),
            hub: UpdateHub::new(Throttler::new(settings.broadcast_throttle, clock.clone())),
            dispatcher: CommandDispatcher::new(channel, durable.clone()),
            ingest_throttle: Throttler::new(settings.ingest_throttle, clock.clone()),
            online_log_throttle: Throttler::new(settings.online_log_interval, clock.clone()),
            clock,
            predictor,
            durable,
            settings,
            hydrated: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn decoder(&self) -> &TelemetryDecoder {
        &self.decoder
    }

    pub fn store(&self) -> &DeviceStateStore {
        &self.store
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn hub(&self) -> &UpdateHub {
        &self.hub
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn predictor(&self) -> &dyn DryingPredictor {
        self.predictor.as_ref()
    }

    /// Decode and apply one raw message. Decode failures are logged and the
    /// message is dropped.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        match self.decoder.decode(topic, payload) {
            Ok(event) => self.apply(event).await,
            Err(e) => warn!(topic, "Dropping message: {e}"),
        }
    }

    pub async fn apply(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Status { device_id, report } => {
                self.apply_status(&device_id, report).await
            }
            TelemetryEvent::Online {
                device_id,
                is_online,
            } => self.apply_online(&device_id, is_online).await,
        }
    }

    async fn apply_status(&self, device_id: &str, report: StatusReport) {
        // ---
        if !self.ingest_throttle.should_emit(device_id) {
            debug!(device_id, "Status burst dropped");
            return;
        }
        let is_new = self.ensure_known(device_id).await;

        if let Err(e) = self
            .store
            .upsert_status(
                device_id,
                &report.fields,
                report.display_status(),
                report.claim_token(),
            )
            .await
        {
            warn!(device_id, "Failed to persist device state: {e:#}");
        }
        if is_new {
            self.log_event(device_id, LogKind::Info, "Device auto-registered").await;
        }

        let assessment = match report.observation(device_id, self.clock.now()) {
            Some(obs) => {
                let step = self.detector.observe(&obs);
                self.handle_step(device_id, &step).await;
                Some(step.assessment)
            }
            None => {
                debug!(device_id, "Report has no pump/moisture pair, detector skipped");
                self.detector.assessment(device_id)
            }
        };

        let mut data = report.sanitized_fields();
        if let Some(assessment) = &assessment {
            data.insert("health_score".into(), json!(assessment.score));
        }
        data.insert("predicted_hours".into(), json!(self.predict_for(&report)));

        let reading = Value::Object(data);
        if let Err(e) = self.durable.insert_reading(device_id, &reading).await {
            warn!(device_id, "Failed to store reading: {e:#}");
        }

        if let Some(code) = report.state_code().filter(|c| CRITICAL_STATES.contains(c)) {
            error!(device_id, code, "Device reported critical state");
            self.log_event(device_id, LogKind::Error, &format!("Critical Error State: {code}"))
                .await;
        }

        let Value::Object(mut update) = reading else {
            return;
        };
        update.insert("online".into(), Value::Bool(true));
        self.hub.publish(device_id, Value::Object(update));
    }

    async fn apply_online(&self, device_id: &str, is_online: bool) {
        // ---
        let is_new = self.ensure_known(device_id).await;
        if let Err(e) = self.store.upsert_online(device_id, is_online).await {
            warn!(device_id, "Failed to persist online state: {e:#}");
        }
        if is_new {
            self.log_event(device_id, LogKind::Info, "Device auto-registered").await;
        }

        self.hub.publish(device_id, json!({ "online": is_online }));

        if self.online_log_throttle.should_emit(device_id) {
            let (kind, message) = if is_online {
                (LogKind::Info, "Device is Online")
            } else {
                (LogKind::Warning, "Device is Offline")
            };
            self.log_event(device_id, kind, message).await;
        }
    }

    /// Record the side effects of one detector step.
    async fn handle_step(&self, device_id: &str, step: &DetectorStep) {
        // ---
        match &step.verdict {
            Some(RiseVerdict::Anomalous { entry, .. }) => {
                self.log_event(device_id, LogKind::Warning, &entry.message).await;
            }
            Some(RiseVerdict::Normal { rise }) => {
                self.log_event(
                    device_id,
                    LogKind::Success,
                    &format!("Watering cycle OK: moisture rose by {rise:.2}"),
                )
                .await;
            }
            None => {}
        }

        if step.lockout_triggered {
            let score = step.assessment.score;
            let threshold = self.settings.detector.lockout_threshold;
            error!(device_id, score, threshold, "Health below threshold, locking out");
            self.log_event(
                device_id,
                LogKind::Error,
                &format!("Lockout: health score {score} below {threshold}"),
            )
            .await;
            if let Err(e) = self.dispatcher.send(device_id, LOCK_SYSTEM).await {
                error!(device_id, "Failed to send lockout command: {e:#}");
            }
        }
    }

    /// Health of one device. A device that has reported but never produced
    /// a detector observation is at full health; `None` means unknown.
    pub fn device_health(&self, device_id: &str) -> Option<HealthAssessment> {
        // ---
        self.detector.assessment(device_id).or_else(|| {
            self.store.get(device_id).map(|_| HealthAssessment {
                score: 100,
                anomalies: Vec::new(),
                should_lockout: false,
            })
        })
    }

    pub fn is_known(&self, device_id: &str) -> bool {
        self.store.get(device_id).is_some() || self.detector.assessment(device_id).is_some()
    }

    /// Operator reset of a device's health. The unlock command is best
    /// effort; the reset itself always applies.
    pub async fn reset_health(&self, device_id: &str) -> HealthAssessment {
        // ---
        let assessment = self.detector.reset(device_id);
        self.log_event(device_id, LogKind::Success, "Health score reset by operator")
            .await;
        if let Err(e) = self.dispatcher.send(device_id, UNLOCK_SYSTEM).await {
            warn!(device_id, "Failed to send unlock command: {e:#}");
        }
        assessment
    }

    /// Hydrate device state and baseline history until each has loaded once.
    /// A failed step is retried on the device's next message. Returns true
    /// when hydration found no durable row, i.e. the device is new.
    async fn ensure_known(&self, device_id: &str) -> bool {
        // ---
        let mut is_new = false;
        if !lock(&self.hydrated).contains(device_id) {
            match self.store.hydrate(device_id).await {
                Ok(known) => {
                    lock(&self.hydrated).insert(device_id.to_string());
                    is_new = !known;
                    if is_new {
                        info!(device_id, "New device auto-registered");
                    }
                }
                Err(e) => warn!(device_id, "Failed to load device from store, will retry: {e:#}"),
            }
        }

        let learner = self.detector.learner();
        if !learner.is_loaded(device_id) {
            if let Err(e) = learner.load(device_id).await {
                warn!(device_id, "Failed to load baseline history, will retry: {e:#}");
            }
        }
        is_new
    }

    fn predict_for(&self, report: &StatusReport) -> Option<f64> {
        let threshold = report.threshold().unwrap_or(self.settings.dry_threshold);
        self.predictor.predict(
            report.moisture()?,
            threshold,
            report.temperature()?,
            report.humidity()?,
        )
    }

    async fn log_event(&self, device_id: &str, kind: LogKind, message: &str) {
        if let Err(e) = self.durable.insert_log(device_id, kind, message).await {
            warn!(device_id, "Failed to write system log: {e:#}");
        }
    }
}

/// Routes decoded events to one ordered worker per device.
pub struct LaneRouter {
    // ---
    service: Arc<IngestService>,
    lanes: HashMap<String, mpsc::Sender<TelemetryEvent>>,
    depth: usize,
}

impl LaneRouter {
    pub fn new(service: Arc<IngestService>, depth: usize) -> Self {
        Self {
            service,
            lanes: HashMap::new(),
            depth: depth.max(1),
        }
    }

    /// Decode a raw message and queue it on its device lane. Returns whether
    /// the message was queued.
    pub fn route_raw(&mut self, topic: &str, payload: &[u8]) -> bool {
        match self.service.decoder().decode(topic, payload) {
            Ok(event) => self.route(event),
            Err(e) => {
                warn!(topic, "Dropping message: {e}");
                false
            }
        }
    }

    pub fn route(&mut self, event: TelemetryEvent) -> bool {
        // ---
        let device_id = event.device_id().to_string();
        let service = self.service.clone();
        let depth = self.depth;
        let tx = self
            .lanes
            .entry(device_id.clone())
            .or_insert_with(|| spawn_lane(service, &device_id, depth));

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(device_id = %device_id, "Device lane full, message dropped");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(device_id = %device_id, "Device lane stopped, restarting");
                let tx = spawn_lane(self.service.clone(), &device_id, depth);
                let queued = tx.try_send(event).is_ok();
                self.lanes.insert(device_id, tx);
                queued
            }
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

fn spawn_lane(
    service: Arc<IngestService>,
    device_id: &str,
    depth: usize,
) -> mpsc::Sender<TelemetryEvent> {
    // ---
    let (tx, mut rx) = mpsc::channel(depth);
    debug!(device_id, "Starting device lane");
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            service.apply(event).await;
        }
    });
    tx
}
