//! "Hours until dry" estimator.
//!
//! Sits beside the detector, not inside it: the ingestion service asks a
//! [`DryingPredictor`] for an estimate and stores it with each reading.
//! The bundled [`LinearDryingModel`] regresses the drying rate (moisture
//! points lost per minute) on air temperature and humidity. At startup it
//! is fitted to recent stored readings ([`trained_model`]), falling back to
//! a seeded fit when history is too thin.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::models::StatusReport;
use crate::store::{DurableStore, StoredReading};

// ---

/// Floor on the predicted drying rate, so a near-zero rate does not
/// produce an absurd horizon.
const MIN_RATE_PER_MINUTE: f64 = 0.01;
/// Rates at or above this are treated as noise when training.
const MAX_TRAINING_RATE: f64 = 5.0;

pub trait DryingPredictor: Send + Sync {
    /// Hours until `moisture` falls to `threshold`, `None` if no estimate.
    fn predict(&self, moisture: f64, threshold: f64, temperature: f64, humidity: f64) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DryingSample {
    pub temperature: f64,
    pub humidity: f64,
    /// Moisture points lost per minute.
    pub rate: f64,
}

/// One historical reading, as used to derive training samples.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub pump_on: bool,
    pub moisture: f64,
    pub temperature: f64,
    pub humidity: f64,
}

impl HistoryPoint {
    /// `None` unless the reading carries pump state, moisture, temperature
    /// and humidity.
    pub fn from_reading(reading: &StoredReading) -> Option<Self> {
        // ---
        let Value::Object(fields) = &reading.data else {
            return None;
        };
        let report = StatusReport::new(fields.clone());
        Some(Self {
            timestamp: reading.recorded_at,
            pump_on: report.pump_state()?,
            moisture: report.moisture()?,
            temperature: report.temperature()?,
            humidity: report.humidity()?,
        })
    }
}

/// Drying-rate samples from consecutive readings where the pump stayed off
/// and moisture fell. Conditions are taken from the earlier reading.
pub fn drying_samples(history: &[HistoryPoint]) -> Vec<DryingSample> {
    // ---
    history
        .windows(2)
        .filter_map(|pair| {
            let (prev, curr) = (&pair[0], &pair[1]);
            if prev.pump_on || curr.pump_on || curr.moisture >= prev.moisture {
                return None;
            }
            let minutes = (curr.timestamp - prev.timestamp).num_milliseconds() as f64 / 60_000.0;
            if minutes <= 0.0 {
                return None;
            }
            let rate = (prev.moisture - curr.moisture) / minutes;
            (rate > 0.0 && rate < MAX_TRAINING_RATE).then_some(DryingSample {
                temperature: prev.temperature,
                humidity: prev.humidity,
                rate,
            })
        })
        .collect()
}

/// Drying samples from stored readings. Readings are paired per device, in
/// recorded order.
pub fn samples_from_readings(readings: &[StoredReading]) -> Vec<DryingSample> {
    // ---
    let mut per_device: BTreeMap<&str, Vec<HistoryPoint>> = BTreeMap::new();
    for reading in readings {
        if let Some(point) = HistoryPoint::from_reading(reading) {
            per_device
                .entry(reading.device_id.as_str())
                .or_default()
                .push(point);
        }
    }
    per_device
        .values()
        .flat_map(|history| drying_samples(history))
        .collect()
}

/// Model fitted to the most recent `limit` stored readings, or the seeded
/// model when they cannot be read or do not support a fit.
pub async fn trained_model(durable: &dyn DurableStore, limit: usize) -> LinearDryingModel {
    // ---
    let readings = match durable.load_recent_readings(limit).await {
        Ok(readings) => readings,
        Err(e) => {
            warn!("Failed to load readings for drying model: {e:#}");
            return LinearDryingModel::seeded();
        }
    };
    let samples = samples_from_readings(&readings);
    match LinearDryingModel::fit(&samples) {
        Ok(model) => {
            info!(
                readings = readings.len(),
                samples = samples.len(),
                "Drying model fitted to stored history"
            );
            model
        }
        Err(e) => {
            info!("Using seeded drying model: {e}");
            LinearDryingModel::seeded()
        }
    }
}

/// `rate = w_temperature * temperature + w_humidity * humidity + bias`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearDryingModel {
    pub w_temperature: f64,
    pub w_humidity: f64,
    pub bias: f64,
}

impl LinearDryingModel {
    /// Model fitted to a small set of typical indoor conditions, used until
    /// enough history exists to refit.
    pub fn seeded() -> Self {
        // ---
        let seed = [
            (25.0, 40.0, 0.10),
            (30.0, 60.0, 0.08),
            (20.0, 30.0, 0.05),
            (35.0, 20.0, 0.20),
        ]
        .map(|(temperature, humidity, rate)| DryingSample {
            temperature,
            humidity,
            rate,
        });
        Self::fit(&seed).unwrap_or(Self {
            w_temperature: 0.0,
            w_humidity: 0.0,
            bias: 0.1,
        })
    }

    /// Ordinary least squares over `samples`. Needs at least three samples
    /// that are not collinear.
    pub fn fit(samples: &[DryingSample]) -> Result<Self> {
        // ---
        if samples.len() < 3 {
            bail!("need at least 3 drying samples, got {}", samples.len());
        }

        // normal equations: (X^T X) w = X^T y with X rows [t, h, 1]
        let mut a = [[0.0_f64; 4]; 3];
        for s in samples {
            let x = [s.temperature, s.humidity, 1.0];
            for i in 0..3 {
                for j in 0..3 {
                    a[i][j] += x[i] * x[j];
                }
                a[i][3] += x[i] * s.rate;
            }
        }
        let [w_temperature, w_humidity, bias] = solve3(a)?;
        Ok(Self {
            w_temperature,
            w_humidity,
            bias,
        })
    }

    pub fn rate(&self, temperature: f64, humidity: f64) -> f64 {
        self.w_temperature * temperature + self.w_humidity * humidity + self.bias
    }
}

impl DryingPredictor for LinearDryingModel {
    fn predict(&self, moisture: f64, threshold: f64, temperature: f64, humidity: f64) -> Option<f64> {
        // ---
        if ![moisture, threshold, temperature, humidity].iter().all(|v| v.is_finite()) {
            return None;
        }
        let to_lose = moisture - threshold;
        if to_lose <= 0.0 {
            return Some(0.0);
        }
        let rate = self.rate(temperature, humidity).max(MIN_RATE_PER_MINUTE);
        let hours = to_lose / rate / 60.0;
        Some((hours * 10.0).round() / 10.0)
    }
}

/// Gaussian elimination with partial pivoting on an augmented 3x4 matrix.
fn solve3(mut a: [[f64; 4]; 3]) -> Result<[f64; 3]> {
    // ---
    let scale = a
        .iter()
        .flat_map(|row| row[..3].iter())
        .fold(1.0_f64, |m, v| m.max(v.abs()));
    let eps = scale * 1e-10;

    for col in 0..3 {
        let pivot = (col..3)
            .max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < eps {
            bail!("drying samples are degenerate");
        }
        a.swap(col, pivot);
        for row in 0..3 {
            if row != col {
                let factor = a[row][col] / a[col][col];
                for k in col..4 {
                    a[row][k] -= factor * a[col][k];
                }
            }
        }
    }
    Ok([a[0][3] / a[0][0], a[1][3] / a[1][1], a[2][3] / a[2][2]])
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fit_recovers_linear_relation() {
        // ---
        let truth = |t: f64, h: f64| 0.01 * t - 0.002 * h + 0.05;
        let samples: Vec<_> = [(20.0, 30.0), (25.0, 50.0), (30.0, 40.0), (35.0, 70.0), (22.0, 65.0)]
            .iter()
            .map(|&(t, h)| DryingSample {
                temperature: t,
                humidity: h,
                rate: truth(t, h),
            })
            .collect();

        let model = LinearDryingModel::fit(&samples).unwrap();
        assert!((model.w_temperature - 0.01).abs() < 1e-9);
        assert!((model.w_humidity + 0.002).abs() < 1e-9);
        assert!((model.bias - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_fit_rejects_too_few_or_degenerate() {
        // ---
        let s = DryingSample {
            temperature: 20.0,
            humidity: 30.0,
            rate: 0.1,
        };
        assert!(LinearDryingModel::fit(&[s, s]).is_err());
        assert!(LinearDryingModel::fit(&[s, s, s, s]).is_err());
    }

    #[test]
    fn test_predict_hours() {
        // ---
        let model = LinearDryingModel {
            w_temperature: 0.0,
            w_humidity: 0.0,
            bias: 0.1,
        };
        // 30 points at 0.1/min = 300 min = 5 h
        assert_eq!(model.predict(60.0, 30.0, 25.0, 40.0), Some(5.0));
        assert_eq!(model.predict(25.0, 30.0, 25.0, 40.0), Some(0.0));
        assert_eq!(model.predict(f64::NAN, 30.0, 25.0, 40.0), None);
    }

    #[test]
    fn test_predict_clamps_rate() {
        // ---
        let model = LinearDryingModel {
            w_temperature: 0.0,
            w_humidity: 0.0,
            bias: -1.0,
        };
        // 6 points at the 0.01/min floor = 600 min = 10 h
        assert_eq!(model.predict(36.0, 30.0, 25.0, 40.0), Some(10.0));
    }

    #[test]
    fn test_seeded_model_predicts_positive_horizon() {
        // ---
        let hours = LinearDryingModel::seeded()
            .predict(60.0, 30.0, 25.0, 40.0)
            .unwrap();
        assert!(hours > 0.0);
    }

    #[test]
    fn test_drying_samples_from_history() {
        // ---
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let point = |min: i64, pump_on: bool, moisture: f64| HistoryPoint {
            timestamp: t0 + chrono::TimeDelta::minutes(min),
            pump_on,
            moisture,
            temperature: 24.0,
            humidity: 45.0,
        };
        let history = [
            point(0, false, 50.0),
            point(10, false, 49.0), // 0.1/min
            point(20, true, 49.0),  // pump on: skipped
            point(30, false, 60.0), // rising: skipped
            point(31, false, 50.0), // 10/min: noise
            point(41, false, 48.0), // 0.2/min
        ];

        let samples = drying_samples(&history);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].rate - 0.1).abs() < 1e-9);
        assert!((samples[1].rate - 0.2).abs() < 1e-9);
    }

    fn reading(device: &str, minute: i64, moisture: f64, t: f64, h: f64) -> StoredReading {
        StoredReading {
            device_id: device.to_string(),
            recorded_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
                + chrono::TimeDelta::minutes(minute),
            data: serde_json::json!({
                "pumpState": false, "moisture": moisture, "temperature": t, "humidity": h
            }),
        }
    }

    #[test]
    fn test_samples_from_interleaved_devices() {
        // ---
        let readings = [
            reading("a", 0, 50.0, 20.0, 30.0),
            reading("b", 0, 80.0, 30.0, 60.0),
            reading("a", 10, 49.0, 20.0, 30.0),
            reading("b", 10, 78.0, 30.0, 60.0),
            StoredReading {
                device_id: "a".into(),
                recorded_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 15, 0).unwrap(),
                data: serde_json::json!({"moisture": 10}),
            },
        ];

        let samples = samples_from_readings(&readings);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].rate - 0.1).abs() < 1e-9);
        assert_eq!(samples[0].temperature, 20.0);
        assert!((samples[1].rate - 0.2).abs() < 1e-9);
        assert_eq!(samples[1].humidity, 60.0);
    }

    #[tokio::test]
    async fn test_trained_model_falls_back_to_seed() {
        // ---
        let store = crate::store::MemoryStore::new();
        let model = trained_model(&store, 100).await;
        assert_eq!(model, LinearDryingModel::seeded());
    }
}
