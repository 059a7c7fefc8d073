//! Adaptive baseline learner.
//!
//! Keeps, per device, the most recent moisture rises observed after
//! watering cycles that were judged healthy. The detector compares new
//! rises against the running mean of this window. Accepted rises are also
//! appended to durable storage in the background; a failed write is logged
//! and never rolls back the in-memory sample.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::keyed::{lock, Keyed};
use crate::store::DurableStore;

// ---

/// Samples that participate in the running average.
pub const HISTORY_CAPACITY: usize = 10;

/// Rises above this are physically implausible for a percentage reading.
pub const MAX_PLAUSIBLE_RISE: f64 = 100.0;

#[derive(Debug, Default)]
struct BaselineHistory {
    samples: VecDeque<f64>,
    loaded: bool,
}

impl BaselineHistory {
    fn push(&mut self, rise: f64) {
        self.samples.push_back(rise);
        while self.samples.len() > HISTORY_CAPACITY {
            self.samples.pop_front();
        }
    }
}

pub struct BaselineLearner {
    // ---
    histories: Keyed<BaselineHistory>,
    durable: Arc<dyn DurableStore>,
    load_limit: usize,
}

impl BaselineLearner {
    pub fn new(durable: Arc<dyn DurableStore>, load_limit: usize) -> Self {
        Self {
            histories: Keyed::default(),
            durable,
            load_limit,
        }
    }

    /// Append a successful rise. Non-positive or implausible values are
    /// ignored; returns whether the sample was kept.
    pub fn record(&self, device_id: &str, rise: f64) -> bool {
        // ---
        if !(rise > 0.0 && rise <= MAX_PLAUSIBLE_RISE) {
            debug!(device_id, rise, "Rejected baseline sample");
            return false;
        }
        lock(&self.histories.slot(device_id)).push(rise);
        self.persist(device_id, rise);
        true
    }

    /// In-memory samples for `device_id`, oldest first.
    pub fn samples(&self, device_id: &str) -> Vec<f64> {
        self.histories
            .with(device_id, |h| h.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn sample_count(&self, device_id: &str) -> usize {
        self.histories
            .with(device_id, |h| h.samples.len())
            .unwrap_or(0)
    }

    /// Arithmetic mean of the current window, `None` when empty.
    pub fn average(&self, device_id: &str) -> Option<f64> {
        let samples = self.samples(device_id);
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    pub fn is_loaded(&self, device_id: &str) -> bool {
        self.histories
            .with(device_id, |h| h.loaded)
            .unwrap_or(false)
    }

    /// Seed the window from the most recent persisted points. Loaded points
    /// go in chronological order ahead of anything recorded since startup,
    /// and the window is capped as usual.
    pub async fn load(&self, device_id: &str) -> Result<usize> {
        // ---
        let mut points = self
            .durable
            .load_recent_learning_points(device_id, self.load_limit)
            .await?;
        points.reverse();

        let slot = self.histories.slot(device_id);
        let mut history = lock(&slot);
        let recent: Vec<f64> = history.samples.drain(..).collect();
        for rise in points
            .iter()
            .copied()
            .filter(|r| *r > 0.0 && *r <= MAX_PLAUSIBLE_RISE)
            .chain(recent)
        {
            history.push(rise);
        }
        history.loaded = true;

        info!(
            device_id,
            loaded = points.len(),
            window = history.samples.len(),
            "Loaded baseline history"
        );
        Ok(points.len())
    }

    fn persist(&self, device_id: &str, rise: f64) {
        // ---
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(device_id, rise, "No runtime available, learning point not persisted");
            return;
        };
        let durable = self.durable.clone();
        let device_id = device_id.to_string();
        handle.spawn(async move {
            if let Err(e) = durable.append_learning_point(&device_id, rise).await {
                warn!(device_id = %device_id, rise, "Failed to persist learning point: {e:#}");
            }
        });
    }
}
