//! Statistics tracking for ingested spots.
//!
//! Per-mode and per-source counters are incremented on every spot that
//! survives dedup, so they live in a concurrent map of atomics: no lock and
//! no allocation on the hot path once a key has been seen. A report
//! histogram tracks the SNR distribution across skimmer spots.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::spot::Spot;

/// SNR histogram offset so negative reports fit the u64 domain.
const REPORT_OFFSET: i32 = 50;

/// Thread-safe spot statistics.
pub struct Tracker {
    mode_counts: DashMap<String, AtomicU64>,
    source_counts: DashMap<String, AtomicU64>,
    report_histogram: RwLock<Histogram<u64>>,
    start: Instant,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            mode_counts: DashMap::new(),
            source_counts: DashMap::new(),
            report_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 200, 2).expect("report histogram bounds are valid"),
            ),
            start: Instant::now(),
        }
    }

    /// Record a spot that survived dedup.
    pub fn record(&self, spot: &Spot) {
        let mode_key = if spot.mode.is_empty() {
            spot.source.to_string()
        } else {
            spot.mode.clone()
        };
        increment(&self.mode_counts, &mode_key);
        if !spot.source_node.is_empty() && spot.source_node != mode_key {
            increment(&self.source_counts, &spot.source_node);
        }
        if spot.has_report {
            if let Ok(mut hist) = self.report_histogram.write() {
                let value = u64::from((spot.report + REPORT_OFFSET).clamp(1, 199) as u32);
                let _ = hist.record(value);
            }
        }
    }

    pub fn increment_mode(&self, mode: &str) {
        increment(&self.mode_counts, mode);
    }

    pub fn increment_source(&self, source: &str) {
        increment(&self.source_counts, source);
    }

    pub fn mode_counts(&self) -> HashMap<String, u64> {
        self.mode_counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Relaxed)))
            .collect()
    }

    pub fn source_counts(&self) -> HashMap<String, u64> {
        self.source_counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Relaxed)))
            .collect()
    }

    /// Total across all modes.
    pub fn total(&self) -> u64 {
        self.mode_counts.iter().map(|e| e.value().load(Relaxed)).sum()
    }

    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn summary(&self) -> Summary {
        let report_percentiles = self
            .report_histogram
            .read()
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| ReportPercentiles {
                p50: h.value_at_quantile(0.50) as i64 - i64::from(REPORT_OFFSET),
                p90: h.value_at_quantile(0.90) as i64 - i64::from(REPORT_OFFSET),
                p99: h.value_at_quantile(0.99) as i64 - i64::from(REPORT_OFFSET),
            });
        Summary {
            uptime_secs: self.uptime().as_secs_f64(),
            total: self.total(),
            by_mode: self.mode_counts(),
            by_source: self.source_counts(),
            report_percentiles,
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

fn increment(map: &DashMap<String, AtomicU64>, key: &str) {
    let key = key.trim();
    if key.is_empty() {
        return;
    }
    if let Some(counter) = map.get(key) {
        counter.fetch_add(1, Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Relaxed);
}

/// Report (SNR) distribution in dB.
#[derive(Debug, Clone, Serialize)]
pub struct ReportPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
}

/// Point-in-time snapshot of the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub uptime_secs: f64,
    pub total: u64,
    pub by_mode: HashMap<String, u64>,
    pub by_source: HashMap<String, u64>,
    pub report_percentiles: Option<ReportPercentiles>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn sorted(map: &HashMap<String, u64>) -> Vec<(&String, &u64)> {
            let mut items: Vec<_> = map.iter().collect();
            items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            items
        }
        write!(f, "Spots by source: ")?;
        if self.by_source.is_empty() {
            write!(f, "(none)")?;
        } else {
            let parts: Vec<String> =
                sorted(&self.by_source).iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "{}", parts.join(", "))?;
        }
        writeln!(f)?;
        write!(f, "Spots by mode: ")?;
        if self.by_mode.is_empty() {
            write!(f, "(none)")?;
        } else {
            let parts: Vec<String> =
                sorted(&self.by_mode).iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "{}", parts.join(", "))?;
        }
        if let Some(ref p) = self.report_percentiles {
            writeln!(f)?;
            write!(f, "Report dB: p50={} p90={} p99={}", p.p50, p.p90, p.p99)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::SourceType;

    fn make_spot(mode: &str, node: &str) -> Spot {
        let mut s = Spot::new("K1ABC", "W3LPL-#", 14025.0, mode);
        s.source = SourceType::Rbn;
        s.source_node = node.to_string();
        s.report = 19;
        s.has_report = true;
        s
    }

    #[test]
    fn test_record_counts_mode_and_source() {
        let tracker = Tracker::new();
        tracker.record(&make_spot("CW", "RBN"));
        tracker.record(&make_spot("CW", "RBN"));
        tracker.record(&make_spot("FT8", "RBN-DIGITAL"));

        let modes = tracker.mode_counts();
        assert_eq!(modes.get("CW"), Some(&2));
        assert_eq!(modes.get("FT8"), Some(&1));

        let sources = tracker.source_counts();
        assert_eq!(sources.get("RBN"), Some(&2));
        assert_eq!(sources.get("RBN-DIGITAL"), Some(&1));
        assert_eq!(tracker.total(), 3);
    }

    #[test]
    fn test_empty_mode_falls_back_to_source_type() {
        let tracker = Tracker::new();
        tracker.record(&make_spot("", "UPLINK"));
        assert_eq!(tracker.mode_counts().get("RBN"), Some(&1));
    }

    #[test]
    fn test_summary_percentiles() {
        let tracker = Tracker::new();
        for report in [-10, 0, 5, 19, 40] {
            let mut s = make_spot("CW", "RBN");
            s.report = report;
            tracker.record(&s);
        }
        let summary = tracker.summary();
        let p = summary.report_percentiles.expect("histogram populated");
        assert!(p.p50 >= -10 && p.p50 <= 40);
        assert!(p.p99 >= p.p50);
    }

    #[test]
    fn test_summary_display_renders() {
        let tracker = Tracker::new();
        tracker.record(&make_spot("CW", "RBN"));
        let rendered = tracker.summary().to_string();
        assert!(rendered.contains("CW=1"));
        assert!(rendered.contains("RBN=1"));
    }
}
