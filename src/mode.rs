//! Mode normalization.
//!
//! Incoming feeds disagree about modes: skimmers tag explicit CW/RTTY/FT8,
//! human feeds often say just "SSB" or nothing at all. This module resolves
//! every spot to a final normalized mode using the generic-SSB split and a
//! band/mode allocation table.

use serde::Deserialize;

/// One band row of the allocation table. Frequencies in kHz; everything at or
/// below `cw_end_khz` resolves to CW, the rest of the band to `voice_mode`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModeAllocation {
    pub band: String,
    pub lower_khz: f64,
    #[serde(default)]
    pub cw_end_khz: f64,
    pub upper_khz: f64,
    #[serde(default)]
    pub voice_mode: String,
}

/// Band/mode allocation table used to guess a mode when a feed provides none.
#[derive(Debug, Clone)]
pub struct ModeTable {
    bands: Vec<ModeAllocation>,
}

impl ModeTable {
    pub fn new(bands: Vec<ModeAllocation>) -> Self {
        Self { bands }
    }

    /// The standard HF band plan, used when the config does not carry an
    /// allocation table of its own.
    pub fn builtin() -> Self {
        let row = |band: &str, lower: f64, cw_end: f64, upper: f64, voice: &str| ModeAllocation {
            band: band.to_string(),
            lower_khz: lower,
            cw_end_khz: cw_end,
            upper_khz: upper,
            voice_mode: voice.to_string(),
        };
        Self::new(vec![
            row("160m", 1800.0, 1840.0, 2000.0, "LSB"),
            row("80m", 3500.0, 3600.0, 4000.0, "LSB"),
            row("60m", 5330.0, 0.0, 5410.0, "USB"),
            row("40m", 7000.0, 7040.0, 7300.0, "LSB"),
            row("30m", 10100.0, 10130.0, 10150.0, "CW"),
            row("20m", 14000.0, 14070.0, 14350.0, "USB"),
            row("17m", 18068.0, 18095.0, 18168.0, "USB"),
            row("15m", 21000.0, 21070.0, 21450.0, "USB"),
            row("12m", 24890.0, 24915.0, 24990.0, "USB"),
            row("10m", 28000.0, 28070.0, 29700.0, "USB"),
            row("6m", 50000.0, 50100.0, 54000.0, "USB"),
        ])
    }

    /// Returns the allocated mode for the frequency, or `None` when the
    /// frequency falls outside every configured band.
    pub fn guess(&self, freq_khz: f64) -> Option<String> {
        for b in &self.bands {
            if freq_khz >= b.lower_khz && freq_khz <= b.upper_khz {
                if b.cw_end_khz > 0.0 && freq_khz <= b.cw_end_khz {
                    return Some("CW".to_string());
                }
                let voice = b.voice_mode.trim();
                if !voice.is_empty() {
                    return Some(voice.to_ascii_uppercase());
                }
            }
        }
        None
    }

    /// Harmonize mode selection: explicit mode wins (with the SSB split),
    /// then the allocation table, then USB above 10 MHz and CW below.
    pub fn finalize(&self, mode: &str, freq_khz: f64) -> String {
        let mode = normalize_voice_mode(mode, freq_khz);
        if !mode.is_empty() {
            return mode;
        }
        if let Some(alloc) = self.guess(freq_khz) {
            return normalize_voice_mode(&alloc, freq_khz);
        }
        if freq_khz >= 10_000.0 {
            "USB".to_string()
        } else {
            "CW".to_string()
        }
    }
}

/// Map generic "SSB" to LSB/USB depending on frequency; everything else is
/// upper-cased and trimmed.
pub fn normalize_voice_mode(mode: &str, freq_khz: f64) -> String {
    let upper = mode.trim().to_ascii_uppercase();
    if upper == "SSB" {
        if freq_khz >= 10_000.0 {
            return "USB".to_string();
        }
        return "LSB".to_string();
    }
    upper
}

/// Modes the correction engine (and harmonic detector) operate on. Digital
/// modes with strong FEC report exact calls and are never rewritten.
pub fn is_correction_candidate(mode: &str) -> bool {
    matches!(mode.trim().to_ascii_uppercase().as_str(), "CW" | "CWT" | "RTTY")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssb_split() {
        assert_eq!(normalize_voice_mode("SSB", 14250.0), "USB");
        assert_eq!(normalize_voice_mode("SSB", 3750.0), "LSB");
        assert_eq!(normalize_voice_mode("ssb", 10000.0), "USB");
        assert_eq!(normalize_voice_mode("CW", 14250.0), "CW");
        assert_eq!(normalize_voice_mode("", 14250.0), "");
    }

    #[test]
    fn test_finalize_prefers_explicit_mode() {
        let table = ModeTable::builtin();
        assert_eq!(table.finalize("FT8", 14074.0), "FT8");
        assert_eq!(table.finalize("SSB", 14250.0), "USB");
        assert_eq!(table.finalize("SSB", 3750.0), "LSB");
    }

    #[test]
    fn test_finalize_uses_allocation_table() {
        let table = ModeTable::builtin();
        assert_eq!(table.finalize("", 14025.0), "CW");
        assert_eq!(table.finalize("", 14250.0), "USB");
        assert_eq!(table.finalize("", 3750.0), "LSB");
    }

    #[test]
    fn test_finalize_defaults_outside_table() {
        let table = ModeTable::new(Vec::new());
        assert_eq!(table.finalize("", 28500.0), "USB");
        assert_eq!(table.finalize("", 7020.0), "CW");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let table = ModeTable::builtin();
        for (mode, freq) in [("SSB", 14250.0), ("SSB", 3750.0), ("", 14025.0), ("FT8", 14074.0)] {
            let once = table.finalize(mode, freq);
            let twice = table.finalize(&once, freq);
            assert_eq!(once, twice, "mode {mode:?} at {freq}");
        }
    }

    #[test]
    fn test_correction_candidates() {
        assert!(is_correction_candidate("CW"));
        assert!(is_correction_candidate("RTTY"));
        assert!(is_correction_candidate("cw"));
        assert!(!is_correction_candidate("FT8"));
        assert!(!is_correction_candidate("FT4"));
        assert!(!is_correction_candidate("USB"));
        assert!(!is_correction_candidate(""));
    }
}
