//! Per-call frequency averaging.
//!
//! Individual skimmers disagree by tens of Hz about the same CW/RTTY
//! signal. When enough recent reports exist for a call and their mean
//! (rounded to 0.1 kHz) differs from the incoming spot by at least the
//! configured tolerance, the spot's frequency is rewritten to the mean.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct FreqEntry {
    frequency_khz: f64,
    at: DateTime<Utc>,
}

/// Sliding window of reported frequencies per DX call.
#[derive(Debug, Default)]
pub struct FrequencyAverager {
    entries: Mutex<HashMap<String, Vec<FreqEntry>>>,
}

impl FrequencyAverager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `freq_khz` for `call` and return `(mean, reports)` over the
    /// window, the new report included.
    pub fn average(
        &self,
        call: &str,
        freq_khz: f64,
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) -> (f64, usize) {
        let call = call.trim().to_ascii_uppercase();
        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(call).or_default();
        let cutoff = now - window;
        list.retain(|e| e.at > cutoff);
        list.push(FreqEntry {
            frequency_khz: freq_khz,
            at: now,
        });
        let mean = list.iter().map(|e| e.frequency_khz).sum::<f64>() / list.len() as f64;
        (mean, list.len())
    }

    pub fn tracked_calls(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Round a frequency to 0.1 kHz for rewriting.
pub fn round_tenth_khz(freq_khz: f64) -> f64 {
    (freq_khz * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_average_includes_current_report() {
        let avg = FrequencyAverager::new();
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let window = ChronoDuration::seconds(45);

        let (mean, n) = avg.average("K1ABC", 7011.0, t0, window);
        assert_eq!(n, 1);
        assert!((mean - 7011.0).abs() < 1e-9);

        let (mean, n) = avg.average("K1ABC", 7011.4, t0 + ChronoDuration::seconds(5), window);
        assert_eq!(n, 2);
        assert!((mean - 7011.2).abs() < 1e-9);
    }

    #[test]
    fn test_window_eviction() {
        let avg = FrequencyAverager::new();
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let window = ChronoDuration::seconds(45);

        avg.average("K1ABC", 7011.0, t0, window);
        let (mean, n) = avg.average("K1ABC", 7012.0, t0 + ChronoDuration::seconds(60), window);
        assert_eq!(n, 1);
        assert!((mean - 7012.0).abs() < 1e-9);
    }

    #[test]
    fn test_calls_tracked_independently() {
        let avg = FrequencyAverager::new();
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let window = ChronoDuration::seconds(45);

        avg.average("K1ABC", 7011.0, t0, window);
        let (_, n) = avg.average("N0XYZ", 14025.0, t0, window);
        assert_eq!(n, 1);
        assert_eq!(avg.tracked_calls(), 2);
    }

    #[test]
    fn test_round_tenth() {
        assert_eq!(round_tenth_khz(7011.24), 7011.2);
        assert_eq!(round_tenth_khz(7011.25), 7011.3);
        assert_eq!(round_tenth_khz(7011.0), 7011.0);
    }
}
