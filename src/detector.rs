//! Anomaly detector.
//!
//! Per-device state machine over `(pump_state, moisture, timestamp)`
//! observations:
//!
//! - `Idle`: no soak in progress. A pump `on -> off` transition starts a soak,
//!   capturing the time and the moisture at that moment.
//! - `Soaking`: the post-watering window. Observations inside the window are
//!   not judged. The first observation at or after `soak_window` closes the
//!   soak and judges the moisture rise against the device's baseline.
//!
//! The window is evaluated lazily on the next observation; there is no timer.
//! A device that goes silent mid-soak is simply never judged.
//!
//! The health score only ever goes down. [`AnomalyDetector::reset`] is the
//! single way back to 100.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::baseline::BaselineLearner;
use crate::clock::elapsed;
use crate::keyed::{lock, Keyed};
use crate::models::{AnomalyEntry, HealthAssessment, TelemetryObservation, ANOMALY_LOG_CAPACITY};

// ---

/// Default soak window: 30 s physical soak plus 5 s buffer.
pub const DEFAULT_SOAK_WINDOW: Duration = Duration::from_secs(35);
pub const DEFAULT_LOCKOUT_THRESHOLD: u8 = 60;

/// Baseline samples required before the adaptive rule replaces the
/// cold-start rule (strictly more than this many).
pub const COLD_START_SAMPLES: usize = 3;
/// Fraction of the average rise below which a cycle is anomalous.
pub const EXPECTED_RISE_FACTOR: f64 = 0.2;
pub const ADAPTIVE_PENALTY: u8 = 40;
pub const COLD_START_PENALTY: u8 = 30;

const FULL_HEALTH: u8 = 100;

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    // ---
    pub soak_window: Duration,
    pub lockout_threshold: u8,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            soak_window: DEFAULT_SOAK_WINDOW,
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Soak {
    started_at: DateTime<Utc>,
    start_moisture: f64,
}

#[derive(Debug, Clone)]
struct AnomalyState {
    // ---
    health_score: u8,
    recent_anomalies: VecDeque<AnomalyEntry>,
    /// `Some` only between a pump stop and the close of its window.
    soak: Option<Soak>,
    last_pump_state: bool,
}

impl Default for AnomalyState {
    fn default() -> Self {
        Self {
            health_score: FULL_HEALTH,
            recent_anomalies: VecDeque::with_capacity(ANOMALY_LOG_CAPACITY),
            soak: None,
            last_pump_state: false,
        }
    }
}

impl AnomalyState {
    fn assessment(&self, lockout_threshold: u8) -> HealthAssessment {
        HealthAssessment {
            score: self.health_score,
            anomalies: self.recent_anomalies.iter().cloned().collect(),
            should_lockout: self.health_score < lockout_threshold,
        }
    }

    fn log_anomaly(&mut self, entry: AnomalyEntry) {
        self.recent_anomalies.push_front(entry);
        self.recent_anomalies.truncate(ANOMALY_LOG_CAPACITY);
    }
}

/// Outcome of judging one completed soak.
#[derive(Debug, Clone, PartialEq)]
pub enum RiseVerdict {
    /// Healthy cycle; the rise was offered to the baseline.
    Normal { rise: f64 },
    Anomalous {
        rise: f64,
        penalty: u8,
        entry: AnomalyEntry,
    },
}

/// Result of feeding one observation to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorStep {
    // ---
    pub assessment: HealthAssessment,
    /// Present when this observation closed a soak window.
    pub verdict: Option<RiseVerdict>,
    /// True only on the observation that pushed the score below the
    /// lockout threshold.
    pub lockout_triggered: bool,
}

pub struct AnomalyDetector {
    // ---
    states: Keyed<AnomalyState>,
    learner: Arc<BaselineLearner>,
    settings: DetectorSettings,
}

impl AnomalyDetector {
    pub fn new(learner: Arc<BaselineLearner>, settings: DetectorSettings) -> Self {
        Self {
            states: Keyed::default(),
            learner,
            settings,
        }
    }

    pub fn learner(&self) -> &BaselineLearner {
        &self.learner
    }

    /// Advance the device's state machine by one observation.
    ///
    /// Implausible moisture readings are a no-op: they neither start, close
    /// nor extend a soak.
    pub fn observe(&self, obs: &TelemetryObservation) -> DetectorStep {
        // ---
        let slot = self.states.slot(&obs.device_id);
        let mut state = lock(&slot);
        let threshold = self.settings.lockout_threshold;

        if !obs.is_plausible() {
            warn!(
                device_id = %obs.device_id,
                moisture = obs.moisture_percent,
                "Sensor fault: moisture outside 0-100, observation ignored"
            );
            return DetectorStep {
                assessment: state.assessment(threshold),
                verdict: None,
                lockout_triggered: false,
            };
        }

        let was_locked = state.health_score < threshold;
        let mut verdict = None;

        if let Some(soak) = state.soak {
            if obs.pump_state && !state.last_pump_state {
                // a new watering cycle would contaminate the measurement
                debug!(device_id = %obs.device_id, "Pump restarted during soak, soak abandoned");
                state.soak = None;
            } else if elapsed(soak.started_at, obs.timestamp) >= self.settings.soak_window {
                state.soak = None;
                let rise = obs.moisture_percent - soak.start_moisture;
                info!(device_id = %obs.device_id, rise, "Soak complete");
                verdict = Some(self.analyze_rise(&obs.device_id, &mut state, rise, obs.timestamp));
            }
        }

        if state.last_pump_state && !obs.pump_state && state.soak.is_none() && verdict.is_none() {
            debug!(
                device_id = %obs.device_id,
                moisture = obs.moisture_percent,
                "Pump stopped, soak started"
            );
            state.soak = Some(Soak {
                started_at: obs.timestamp,
                start_moisture: obs.moisture_percent,
            });
        }
        state.last_pump_state = obs.pump_state;

        let assessment = state.assessment(threshold);
        let lockout_triggered = !was_locked && assessment.should_lockout;
        DetectorStep {
            assessment,
            verdict,
            lockout_triggered,
        }
    }

    /// Judge a completed soak and apply any penalty.
    fn analyze_rise(
        &self,
        device_id: &str,
        state: &mut AnomalyState,
        rise: f64,
        at: DateTime<Utc>,
    ) -> RiseVerdict {
        // ---
        let (penalty, message) = if self.learner.sample_count(device_id) > COLD_START_SAMPLES {
            let avg_rise = self.learner.average(device_id).unwrap_or_default();
            let expected_minimum = avg_rise * EXPECTED_RISE_FACTOR;
            if rise < expected_minimum {
                (
                    ADAPTIVE_PENALTY,
                    format!("Pump Anomaly: Rise {rise:.2} below expected {expected_minimum:.2}"),
                )
            } else {
                self.learner.record(device_id, rise);
                return RiseVerdict::Normal { rise };
            }
        } else if rise <= 0.0 {
            (
                COLD_START_PENALTY,
                format!("Pump Anomaly: Pump ran but moisture changed by {rise:.2}"),
            )
        } else {
            self.learner.record(device_id, rise);
            return RiseVerdict::Normal { rise };
        };

        state.health_score = state.health_score.saturating_sub(penalty);
        let entry = AnomalyEntry {
            timestamp: at,
            message,
        };
        warn!(
            device_id,
            score = state.health_score,
            "{}",
            entry.message
        );
        state.log_anomaly(entry.clone());
        RiseVerdict::Anomalous {
            rise,
            penalty,
            entry,
        }
    }

    /// Current assessment for one device, `None` if it was never observed.
    pub fn assessment(&self, device_id: &str) -> Option<HealthAssessment> {
        let threshold = self.settings.lockout_threshold;
        self.states.with(device_id, |s| s.assessment(threshold))
    }

    /// Fleet-wide view: the lowest score, the most recent anomalies across
    /// all devices, and lockout if any device is locked out.
    pub fn system_assessment(&self) -> HealthAssessment {
        // ---
        let assessments: Vec<_> = self
            .states
            .keys()
            .iter()
            .filter_map(|id| self.assessment(id))
            .collect();

        let score = assessments
            .iter()
            .map(|a| a.score)
            .min()
            .unwrap_or(FULL_HEALTH);
        let mut anomalies: Vec<_> = assessments
            .iter()
            .flat_map(|a| a.anomalies.iter().cloned())
            .collect();
        anomalies.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        anomalies.truncate(ANOMALY_LOG_CAPACITY);

        HealthAssessment {
            score,
            anomalies,
            should_lockout: assessments.iter().any(|a| a.should_lockout),
        }
    }

    /// Operator reset: score back to 100 and anomaly log cleared. A soak in
    /// progress is left running.
    pub fn reset(&self, device_id: &str) -> HealthAssessment {
        // ---
        let slot = self.states.slot(device_id);
        let mut state = lock(&slot);
        state.health_score = FULL_HEALTH;
        state.recent_anomalies.clear();
        info!(device_id, "Health score reset");
        state.assessment(self.settings.lockout_threshold)
    }

    pub fn is_soaking(&self, device_id: &str) -> bool {
        self.states
            .with(device_id, |s| s.soak.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + chrono::TimeDelta::milliseconds(ms)
    }

    fn obs(pump: bool, moisture: f64, ts: DateTime<Utc>) -> TelemetryObservation {
        TelemetryObservation {
            device_id: "esp32-1".into(),
            pump_state: pump,
            moisture_percent: moisture,
            temperature: None,
            humidity: None,
            timestamp: ts,
        }
    }

    fn detector() -> AnomalyDetector {
        let learner = Arc::new(BaselineLearner::new(Arc::new(MemoryStore::new()), 20));
        AnomalyDetector::new(learner, DetectorSettings::default())
    }

    /// Run one watering cycle: pump on at `start`, off 1 s later at
    /// `before`, then one observation after the window at `after`.
    fn cycle(d: &AnomalyDetector, start_ms: i64, before: f64, after: f64) -> DetectorStep {
        d.observe(&obs(true, before, at(start_ms)));
        d.observe(&obs(false, before, at(start_ms + 1_000)));
        d.observe(&obs(false, after, at(start_ms + 1_000 + 36_000)))
    }

    #[tokio::test]
    async fn test_pump_stop_starts_soak() {
        // ---
        let d = detector();
        d.observe(&obs(true, 30.0, at(0)));
        assert!(!d.is_soaking("esp32-1"));
        d.observe(&obs(false, 30.0, at(5_000)));
        assert!(d.is_soaking("esp32-1"));
    }

    #[tokio::test]
    async fn test_window_boundary_judges_exactly_once() {
        // ---
        let d = detector();
        d.observe(&obs(true, 30.0, at(0)));
        d.observe(&obs(false, 30.0, at(1_000)));

        let early = d.observe(&obs(false, 30.0, at(1_000 + 35_000 - 1)));
        assert!(early.verdict.is_none());
        assert!(d.is_soaking("esp32-1"));

        let judged = d.observe(&obs(false, 30.0, at(1_000 + 35_000 + 1)));
        assert!(judged.verdict.is_some());
        assert!(!d.is_soaking("esp32-1"));

        let after = d.observe(&obs(false, 30.0, at(1_000 + 70_000)));
        assert!(after.verdict.is_none());
        assert_eq!(after.assessment.anomalies.len(), 1);
    }

    #[tokio::test]
    async fn test_window_closes_at_exact_elapsed() {
        // ---
        let d = detector();
        d.observe(&obs(true, 30.0, at(0)));
        d.observe(&obs(false, 30.0, at(1_000)));

        let judged = d.observe(&obs(false, 30.0, at(1_000 + 35_000)));
        assert!(judged.verdict.is_some());
        assert!(!d.is_soaking("esp32-1"));
    }

    #[tokio::test]
    async fn test_cold_start_zero_rise_penalized() {
        // ---
        let d = detector();
        let step = cycle(&d, 0, 30.0, 30.0);

        assert_eq!(step.assessment.score, 70);
        assert!(matches!(
            step.verdict,
            Some(RiseVerdict::Anomalous { penalty: COLD_START_PENALTY, .. })
        ));
        assert!(step.assessment.anomalies[0]
            .message
            .starts_with("Pump Anomaly: Pump ran but moisture changed by"));
        assert!(!step.assessment.should_lockout);
    }

    #[tokio::test]
    async fn test_cold_start_positive_rise_learned() {
        // ---
        let d = detector();
        let step = cycle(&d, 0, 30.0, 35.0);

        assert_eq!(step.assessment.score, 100);
        assert_eq!(step.verdict, Some(RiseVerdict::Normal { rise: 5.0 }));
        assert_eq!(d.learner().samples("esp32-1"), vec![5.0]);
    }

    #[tokio::test]
    async fn test_adaptive_rule_against_baseline() {
        // ---
        let d = detector();
        for _ in 0..4 {
            d.learner().record("esp32-1", 10.0);
        }

        let low = cycle(&d, 0, 30.0, 31.0);
        assert_eq!(low.assessment.score, 60);
        assert!(matches!(
            low.verdict,
            Some(RiseVerdict::Anomalous { penalty: ADAPTIVE_PENALTY, .. })
        ));
        assert!(low.assessment.anomalies[0]
            .message
            .starts_with("Pump Anomaly: Rise 1.00 below expected 2.00"));
        assert_eq!(d.learner().sample_count("esp32-1"), 4);

        let ok = cycle(&d, 100_000, 30.0, 33.0);
        assert_eq!(ok.assessment.score, 60);
        assert_eq!(ok.verdict, Some(RiseVerdict::Normal { rise: 3.0 }));
        assert_eq!(d.learner().sample_count("esp32-1"), 5);
    }

    #[tokio::test]
    async fn test_score_never_increases_and_floors_at_zero() {
        // ---
        let d = detector();
        let mut previous = 100;
        for i in 0..6 {
            let step = cycle(&d, i * 100_000, 30.0, 30.0);
            assert!(step.assessment.score <= previous);
            previous = step.assessment.score;
        }
        assert_eq!(previous, 0);
    }

    #[tokio::test]
    async fn test_lockout_triggers_once_below_threshold() {
        // ---
        let d = detector();
        let first = cycle(&d, 0, 30.0, 30.0);
        assert!(!first.lockout_triggered);

        let second = cycle(&d, 100_000, 30.0, 30.0);
        assert_eq!(second.assessment.score, 40);
        assert!(second.assessment.should_lockout);
        assert!(second.lockout_triggered);

        let third = cycle(&d, 200_000, 30.0, 30.0);
        assert!(third.assessment.should_lockout);
        assert!(!third.lockout_triggered);
    }

    #[tokio::test]
    async fn test_anomaly_log_keeps_five_newest_first() {
        // ---
        let d = detector();
        for i in 0..7 {
            cycle(&d, i * 100_000, 30.0, 30.0);
        }
        let a = d.assessment("esp32-1").unwrap();
        assert_eq!(a.anomalies.len(), ANOMALY_LOG_CAPACITY);
        assert!(a
            .anomalies
            .windows(2)
            .all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[tokio::test]
    async fn test_reset_restores_health() {
        // ---
        let d = detector();
        cycle(&d, 0, 30.0, 30.0);
        cycle(&d, 100_000, 30.0, 30.0);

        let a = d.reset("esp32-1");
        assert_eq!(a.score, 100);
        assert!(a.anomalies.is_empty());
        assert!(!a.should_lockout);
    }

    #[tokio::test]
    async fn test_implausible_reading_is_noop() {
        // ---
        let d = detector();
        d.observe(&obs(true, 30.0, at(0)));
        d.observe(&obs(false, 30.0, at(1_000)));

        // would close the window, but the reading is a sensor fault
        let fault = d.observe(&obs(false, 180.0, at(40_000)));
        assert!(fault.verdict.is_none());
        assert!(d.is_soaking("esp32-1"));

        let judged = d.observe(&obs(false, 34.0, at(41_000)));
        assert_eq!(judged.verdict, Some(RiseVerdict::Normal { rise: 4.0 }));
    }

    #[tokio::test]
    async fn test_pump_restart_abandons_soak() {
        // ---
        let d = detector();
        d.observe(&obs(true, 30.0, at(0)));
        d.observe(&obs(false, 30.0, at(1_000)));
        d.observe(&obs(true, 30.0, at(10_000)));
        assert!(!d.is_soaking("esp32-1"));

        let step = d.observe(&obs(false, 31.0, at(20_000)));
        assert!(step.verdict.is_none());
        assert!(d.is_soaking("esp32-1"));
    }

    #[tokio::test]
    async fn test_system_assessment_aggregates() {
        // ---
        let d = detector();
        assert_eq!(d.system_assessment().score, 100);

        cycle(&d, 0, 30.0, 30.0);
        let mut other = obs(false, 50.0, at(0));
        other.device_id = "esp32-2".into();
        d.observe(&other);

        let system = d.system_assessment();
        assert_eq!(system.score, 70);
        assert_eq!(system.anomalies.len(), 1);
        assert!(!system.should_lockout);
    }
}
