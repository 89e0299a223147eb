//! Adaptive per-band activity classification and refresh scheduling.
//!
//! Band openings change the consensus math: a busy band yields plenty of
//! corroborating reports while a quiet one may produce two spotters an
//! hour. A rolling per-band spot rate classifies each band as quiet, normal
//! or busy, and a refresher re-runs quality rebuilds at an interval chosen
//! by the busiest state, gated additionally on a minimum number of spots
//! since the last run.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;

/// Rolling activity state of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BandActivity {
    Quiet,
    Normal,
    Busy,
}

/// Rate thresholds for classification.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub window: ChronoDuration,
    /// At or below this rate (spots/minute) a band is quiet.
    pub quiet_max_per_minute: f64,
    /// At or above this rate a band is busy.
    pub busy_min_per_minute: f64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            window: ChronoDuration::minutes(5),
            quiet_max_per_minute: 2.0,
            busy_min_per_minute: 30.0,
        }
    }
}

/// Per-band rolling spot counters.
pub struct BandActivityTracker {
    config: ActivityConfig,
    counts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl BandActivityTracker {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, band: &str, now: DateTime<Utc>) {
        if band.is_empty() {
            return;
        }
        let mut counts = self.counts.lock().unwrap();
        let window = self.config.window;
        let entry = counts.entry(band.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now - *front <= window {
                break;
            }
            entry.pop_front();
        }
        entry.push_back(now);
    }

    pub fn classify(&self, band: &str, now: DateTime<Utc>) -> BandActivity {
        let counts = self.counts.lock().unwrap();
        let rate = match counts.get(band) {
            Some(entries) => {
                let window = self.config.window;
                let recent = entries.iter().filter(|at| now - **at <= window).count();
                recent as f64 / (window.num_seconds() as f64 / 60.0)
            }
            None => 0.0,
        };
        if rate <= self.config.quiet_max_per_minute {
            BandActivity::Quiet
        } else if rate >= self.config.busy_min_per_minute {
            BandActivity::Busy
        } else {
            BandActivity::Normal
        }
    }

    /// The busiest state across all tracked bands; drives the coalesced
    /// refresh interval.
    pub fn busiest(&self, now: DateTime<Utc>) -> BandActivity {
        let bands: Vec<String> = {
            let counts = self.counts.lock().unwrap();
            counts.keys().cloned().collect()
        };
        bands
            .iter()
            .map(|band| self.classify(band, now))
            .max()
            .unwrap_or(BandActivity::Quiet)
    }
}

/// Refresh intervals per activity state plus a volume gate.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub quiet: ChronoDuration,
    pub normal: ChronoDuration,
    pub busy: ChronoDuration,
    /// A refresh only runs when at least this many spots arrived since the
    /// previous run.
    pub min_spots: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            quiet: ChronoDuration::minutes(60),
            normal: ChronoDuration::minutes(30),
            busy: ChronoDuration::minutes(10),
            min_spots: 500,
        }
    }
}

/// Gates periodic quality rebuilds on elapsed time and spot volume.
pub struct AdaptiveRefresher {
    policy: RefreshPolicy,
    last_run: Mutex<DateTime<Utc>>,
    spots_since: AtomicU64,
}

impl AdaptiveRefresher {
    pub fn new(policy: RefreshPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            last_run: Mutex::new(now),
            spots_since: AtomicU64::new(0),
        }
    }

    /// Count a spot toward the volume gate.
    pub fn increment(&self) {
        self.spots_since.fetch_add(1, Relaxed);
    }

    /// Run `refresh` when both gates pass; returns whether it ran.
    pub fn maybe_refresh<F: FnOnce()>(
        &self,
        activity: BandActivity,
        now: DateTime<Utc>,
        refresh: F,
    ) -> bool {
        let interval = match activity {
            BandActivity::Quiet => self.policy.quiet,
            BandActivity::Normal => self.policy.normal,
            BandActivity::Busy => self.policy.busy,
        };
        {
            let last = self.last_run.lock().unwrap();
            if now - *last < interval {
                return false;
            }
        }
        if self.spots_since.load(Relaxed) < self.policy.min_spots {
            return false;
        }
        *self.last_run.lock().unwrap() = now;
        self.spots_since.store(0, Relaxed);
        refresh();
        true
    }
}
