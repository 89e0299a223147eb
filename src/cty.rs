//! CTY prefix database collaborator.
//!
//! Maps callsign prefixes to country/zone/continent metadata via
//! longest-prefix match. Loading the full cty.dat format lives outside this
//! crate; here we consume a simple line-oriented export
//! (`prefix,country,continent,cq,itu,adif`) and expose the lookup contract
//! plus per-call caching and lookup metrics.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;

use crate::spot::CallMetadata;

/// Portable designators stripped before prefix matching.
const STRIP_SUFFIXES: &[&str] = &["/P", "/M", "/MM", "/AM", "/QRP", "/B"];

/// Metadata for one prefix entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInfo {
    pub country: String,
    pub continent: String,
    pub cq_zone: u16,
    pub itu_zone: u16,
    pub adif: u16,
}

impl PrefixInfo {
    pub fn new(country: &str, continent: &str, cq_zone: u16, itu_zone: u16, adif: u16) -> Self {
        Self {
            country: country.to_string(),
            continent: continent.to_string(),
            cq_zone,
            itu_zone,
            adif,
        }
    }
}

impl From<PrefixInfo> for CallMetadata {
    fn from(info: PrefixInfo) -> Self {
        CallMetadata {
            continent: info.continent,
            country: info.country,
            cq_zone: info.cq_zone,
            itu_zone: info.itu_zone,
            grid: String::new(),
            adif: info.adif,
        }
    }
}

/// Snapshot of lookup counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CtyMetrics {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub cache_entries: usize,
    pub validated: u64,
}

/// Prefix database with a per-call result cache.
///
/// Lookups are frequent (two per ingested spot) while the table itself never
/// changes after load, so resolved calls are memoized, misses included.
pub struct CtyDatabase {
    prefixes: HashMap<String, PrefixInfo>,
    max_prefix_len: usize,
    cache: Mutex<HashMap<String, Option<PrefixInfo>>>,
    total_lookups: AtomicU64,
    cache_hits: AtomicU64,
    validated: AtomicU64,
}

impl CtyDatabase {
    pub fn from_entries(entries: Vec<(String, PrefixInfo)>) -> Self {
        let mut prefixes = HashMap::with_capacity(entries.len());
        let mut max_prefix_len = 0;
        for (prefix, info) in entries {
            let prefix = prefix.trim().to_ascii_uppercase();
            if prefix.is_empty() {
                continue;
            }
            max_prefix_len = max_prefix_len.max(prefix.len());
            prefixes.insert(prefix, info);
        }
        Self {
            prefixes,
            max_prefix_len,
            cache: Mutex::new(HashMap::new()),
            total_lookups: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            validated: AtomicU64::new(0),
        }
    }

    /// Load from a `prefix,country,continent,cq,itu,adif` file. Lines that
    /// are empty or start with `#` are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read CTY file: {}", path.display()))?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 6 {
                anyhow::bail!("CTY line {}: expected 6 fields, got {}", lineno + 1, fields.len());
            }
            let parse_zone = |s: &str, what: &str| -> Result<u16> {
                s.parse()
                    .with_context(|| format!("CTY line {}: bad {what}: {s:?}", lineno + 1))
            };
            entries.push((
                fields[0].to_string(),
                PrefixInfo {
                    country: fields[1].to_string(),
                    continent: fields[2].to_string(),
                    cq_zone: parse_zone(fields[3], "CQ zone")?,
                    itu_zone: parse_zone(fields[4], "ITU zone")?,
                    adif: parse_zone(fields[5], "ADIF")?,
                },
            ));
        }
        if entries.is_empty() {
            anyhow::bail!("CTY file {} contained no entries", path.display());
        }
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Resolve a callsign to its prefix metadata via longest-prefix match.
    pub fn lookup(&self, call: &str) -> Option<PrefixInfo> {
        self.total_lookups.fetch_add(1, Relaxed);
        let key = strip_designators(call);
        if key.is_empty() {
            return None;
        }

        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&key) {
                self.cache_hits.fetch_add(1, Relaxed);
                if cached.is_some() {
                    self.validated.fetch_add(1, Relaxed);
                }
                return cached.clone();
            }
        }

        let mut result = None;
        let upper_bound = self.max_prefix_len.min(key.len());
        for len in (1..=upper_bound).rev() {
            if !key.is_char_boundary(len) {
                continue;
            }
            if let Some(info) = self.prefixes.get(&key[..len]) {
                result = Some(info.clone());
                break;
            }
        }
        if result.is_some() {
            self.validated.fetch_add(1, Relaxed);
        }
        self.cache.lock().unwrap().insert(key, result.clone());
        result
    }

    pub fn metrics(&self) -> CtyMetrics {
        CtyMetrics {
            total_lookups: self.total_lookups.load(Relaxed),
            cache_hits: self.cache_hits.load(Relaxed),
            cache_entries: self.cache.lock().unwrap().len(),
            validated: self.validated.load(Relaxed),
        }
    }
}

/// Reduce a call to its prefix-matchable base: upper-case, drop the skimmer
/// marker and numeric SSIDs, strip portable designators.
fn strip_designators(call: &str) -> String {
    let mut base = call.trim().to_ascii_uppercase();
    if let Some(stripped) = base.strip_suffix("-#") {
        base = stripped.to_string();
    }
    if let Some((head, ssid)) = base.rsplit_once('-') {
        if !head.is_empty() && !ssid.is_empty() && ssid.bytes().all(|b| b.is_ascii_digit()) {
            base = head.to_string();
        }
    }
    for suffix in STRIP_SUFFIXES {
        if let Some(stripped) = base.strip_suffix(suffix) {
            base = stripped.to_string();
            break;
        }
    }
    base
}
