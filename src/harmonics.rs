//! Harmonic suppression.
//!
//! A skimmer overloaded by a strong local signal will report the same
//! station at integer multiples of its true frequency, always weaker than
//! the fundamental. The detector keeps recent per-call fundamentals and
//! drops a new spot when it lines up with `k * fundamental` within
//! tolerance, arrived inside the recency window, and is weaker by at least
//! the configured report delta.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::mode::is_correction_candidate;
use crate::spot::Spot;

/// Detector policy.
#[derive(Debug, Clone)]
pub struct HarmonicSettings {
    pub enabled: bool,
    pub recency_window: ChronoDuration,
    pub max_harmonic_multiple: u32,
    pub frequency_tolerance_hz: f64,
    pub min_report_delta: i32,
}

impl Default for HarmonicSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            recency_window: ChronoDuration::seconds(120),
            max_harmonic_multiple: 4,
            frequency_tolerance_hz: 25.0,
            min_report_delta: 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HarmonicEntry {
    frequency_khz: f64,
    report: i32,
    at: DateTime<Utc>,
}

/// Tracks recent fundamentals per DX call and decides whether a new spot is
/// likely a harmonic that should be dropped.
pub struct HarmonicDetector {
    settings: HarmonicSettings,
    entries: Mutex<HashMap<String, Vec<HarmonicEntry>>>,
}

impl HarmonicDetector {
    pub fn new(settings: HarmonicSettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(fundamental_khz)` when the spot should be dropped as a
    /// harmonic of that fundamental. Otherwise the spot is recorded as a
    /// potential future fundamental and `None` is returned.
    pub fn should_drop(&self, spot: &Spot, now: DateTime<Utc>) -> Option<f64> {
        if !self.settings.enabled || !is_correction_candidate(&spot.mode) {
            return None;
        }
        let call = spot.dx_call.trim().to_ascii_uppercase();
        if call.is_empty() {
            return None;
        }

        let mut entries = self.entries.lock().unwrap();
        Self::prune(&mut entries, &call, now, self.settings.recency_window);

        if let Some(fundamental) = self.detect(entries.get(&call), spot) {
            return Some(fundamental);
        }

        entries.entry(call).or_default().push(HarmonicEntry {
            frequency_khz: spot.frequency_khz,
            report: spot.report,
            at: spot.time,
        });
        None
    }

    fn detect(&self, candidates: Option<&Vec<HarmonicEntry>>, spot: &Spot) -> Option<f64> {
        let candidates = candidates?;
        let tolerance_khz = self.settings.frequency_tolerance_hz / 1000.0;
        for entry in candidates {
            if entry.frequency_khz <= 0.0 || spot.frequency_khz <= entry.frequency_khz {
                continue;
            }
            if self.settings.min_report_delta > 0
                && entry.report - spot.report < self.settings.min_report_delta
            {
                continue;
            }
            for mult in 2..=self.settings.max_harmonic_multiple {
                let expected = entry.frequency_khz * f64::from(mult);
                if (expected - spot.frequency_khz).abs() <= tolerance_khz
                    && spot.time - entry.at <= self.settings.recency_window
                {
                    return Some(entry.frequency_khz);
                }
            }
        }
        None
    }

    fn prune(
        entries: &mut HashMap<String, Vec<HarmonicEntry>>,
        call: &str,
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) {
        let Some(slice) = entries.get_mut(call) else {
            return;
        };
        let cutoff = now - window;
        slice.retain(|e| e.at > cutoff);
        if slice.is_empty() {
            entries.remove(call);
        }
    }

    pub fn tracked_calls(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> HarmonicSettings {
        HarmonicSettings {
            enabled: true,
            recency_window: ChronoDuration::minutes(2),
            max_harmonic_multiple: 4,
            frequency_tolerance_hz: 25.0,
            min_report_delta: 6,
        }
    }

    fn spot(dx: &str, freq: f64, report: i32, at: DateTime<Utc>) -> Spot {
        let mut s = Spot::new(dx, "W3LPL-#", freq, "CW");
        s.report = report;
        s.has_report = true;
        s.time = at;
        s
    }

    #[test]
    fn test_drops_weaker_second_harmonic() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        assert_eq!(detector.should_drop(&spot("K1ABC", 7011.0, 20, t0), t0), None);

        let t1 = t0 + ChronoDuration::seconds(5);
        let fundamental = detector.should_drop(&spot("K1ABC", 14022.0, 10, t1), t1);
        assert_eq!(fundamental, Some(7011.0));
    }

    #[test]
    fn test_keeps_stronger_higher_spot() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        assert_eq!(detector.should_drop(&spot("K1ABC", 7011.0, 10, t0), t0), None);

        let t1 = t0 + ChronoDuration::seconds(5);
        assert_eq!(detector.should_drop(&spot("K1ABC", 14022.0, 20, t1), t1), None);
    }

    #[test]
    fn test_third_harmonic_within_tolerance() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        detector.should_drop(&spot("K1ABC", 7011.0, 20, t0), t0);
        let t1 = t0 + ChronoDuration::seconds(5);
        // 3 * 7011.0 = 21033.0; within 25 Hz.
        let fundamental = detector.should_drop(&spot("K1ABC", 21033.02, 5, t1), t1);
        assert_eq!(fundamental, Some(7011.0));
    }

    #[test]
    fn test_outside_tolerance_not_dropped() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        detector.should_drop(&spot("K1ABC", 7011.0, 20, t0), t0);
        let t1 = t0 + ChronoDuration::seconds(5);
        assert_eq!(detector.should_drop(&spot("K1ABC", 14022.5, 10, t1), t1), None);
    }

    #[test]
    fn test_window_expiry_forgets_fundamental() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        detector.should_drop(&spot("K1ABC", 7011.0, 20, t0), t0);
        let t1 = t0 + ChronoDuration::minutes(5);
        assert_eq!(detector.should_drop(&spot("K1ABC", 14022.0, 10, t1), t1), None);
    }

    #[test]
    fn test_calls_are_independent() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        detector.should_drop(&spot("K1ABC", 7011.0, 20, t0), t0);
        let t1 = t0 + ChronoDuration::seconds(5);
        assert_eq!(detector.should_drop(&spot("N0XYZ", 14022.0, 10, t1), t1), None);
    }

    #[test]
    fn test_non_cw_modes_pass_through() {
        let detector = HarmonicDetector::new(settings());
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();

        let mut ft8 = spot("K1ABC", 7074.0, 20, t0);
        ft8.mode = "FT8".to_string();
        assert_eq!(detector.should_drop(&ft8, t0), None);

        let t1 = t0 + ChronoDuration::seconds(5);
        let mut harmonic = spot("K1ABC", 14148.0, 5, t1);
        harmonic.mode = "FT8".to_string();
        assert_eq!(detector.should_drop(&harmonic, t1), None);
    }

    #[test]
    fn test_decisions_are_reproducible() {
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let sequence: Vec<Spot> = vec![
            spot("K1ABC", 7011.0, 20, t0),
            spot("K1ABC", 14022.0, 10, t0 + ChronoDuration::seconds(5)),
            spot("K1ABC", 7011.2, 18, t0 + ChronoDuration::seconds(8)),
            spot("K1ABC", 21033.0, 4, t0 + ChronoDuration::seconds(12)),
        ];

        let run = || -> Vec<Option<f64>> {
            let detector = HarmonicDetector::new(settings());
            sequence.iter().map(|s| detector.should_drop(s, s.time)).collect()
        };
        assert_eq!(run(), run());
    }
}
