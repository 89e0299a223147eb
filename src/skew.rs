//! Per-spotter frequency skew corrections.
//!
//! Some skimmers report dial frequencies with a small, stable multiplicative
//! error. A published table maps raw skimmer IDs (SSID preserved) to a
//! correction factor applied before a spot enters the pipeline. The table is
//! replaced wholesale on refresh; readers always see a consistent snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Skew characteristics published for a single skimmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkewEntry {
    pub callsign: String,
    pub skew_hz: f64,
    pub spots: i64,
    pub correction_factor: f64,
}

/// Lookup table keyed by raw skimmer ID.
#[derive(Debug, Default)]
pub struct SkewTable {
    entries: HashMap<String, SkewEntry>,
}

impl SkewTable {
    pub fn new(entries: Vec<SkewEntry>) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let key = entry.callsign.trim().to_ascii_uppercase();
            if key.is_empty() {
                continue;
            }
            map.insert(key, entry);
        }
        Self { entries: map }
    }

    /// Load the JSON array written by the skew publisher.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = fs::read_to_string(path)
            .with_context(|| format!("failed to read skew file: {}", path.display()))?;
        let entries: Vec<SkewEntry> = serde_json::from_str(&payload)
            .with_context(|| format!("invalid skew JSON: {}", path.display()))?;
        if entries.is_empty() {
            anyhow::bail!("skew file {} contained no entries", path.display());
        }
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, call: &str) -> Option<f64> {
        let key = call.trim().to_ascii_uppercase();
        self.entries.get(&key).map(|e| e.correction_factor)
    }
}

/// Swappable holder for the latest skew table.
#[derive(Debug, Default)]
pub struct SkewStore {
    table: RwLock<Option<Arc<SkewTable>>>,
}

impl SkewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, table: SkewTable) {
        *self.table.write().unwrap() = Some(Arc::new(table));
    }

    pub fn count(&self) -> usize {
        self.table.read().unwrap().as_ref().map_or(0, |t| t.len())
    }

    /// Apply the multiplicative correction for the raw DE call, or return
    /// the frequency unchanged when no entry exists.
    pub fn apply_correction(&self, raw_de_call: &str, freq_khz: f64) -> f64 {
        let table = self.table.read().unwrap();
        match table.as_ref().and_then(|t| t.lookup(raw_de_call)) {
            Some(factor) if factor > 0.0 => freq_khz * factor,
            _ => freq_khz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(call: &str, factor: f64) -> SkewEntry {
        SkewEntry {
            callsign: call.to_string(),
            skew_hz: 10.0,
            spots: 500,
            correction_factor: factor,
        }
    }

    #[test]
    fn test_lookup_preserves_ssid_identity() {
        let table = SkewTable::new(vec![entry("W3LPL-1-#", 1.000002)]);
        assert!(table.lookup("w3lpl-1-#").is_some());
        assert!(table.lookup("W3LPL-#").is_none());
    }

    #[test]
    fn test_apply_correction() {
        let store = SkewStore::new();
        assert_eq!(store.apply_correction("W3LPL-1-#", 14025.0), 14025.0);

        store.replace(SkewTable::new(vec![entry("W3LPL-1-#", 2.0)]));
        assert_eq!(store.apply_correction("W3LPL-1-#", 14025.0), 28050.0);
        assert_eq!(store.apply_correction("K3LR-#", 14025.0), 14025.0);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_apply_correction_ignores_nonpositive_factor() {
        let store = SkewStore::new();
        store.replace(SkewTable::new(vec![entry("W3LPL-1-#", 0.0)]));
        assert_eq!(store.apply_correction("W3LPL-1-#", 14025.0), 14025.0);
    }

    #[test]
    fn test_load_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skew.json");
        let payload = serde_json::to_string(&vec![entry("EA5WU-#", 1.000001)]).unwrap();
        std::fs::write(&path, payload).unwrap();
        let table = SkewTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.lookup("EA5WU-#").is_some());

        std::fs::write(&path, "[]").unwrap();
        assert!(SkewTable::load(&path).is_err());
    }
}
