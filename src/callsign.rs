//! Callsign validation and normalization.
//!
//! Every call stored on a [`crate::spot::Spot`] is upper-case, trimmed, and
//! has its numeric SSID suffix removed. The RBN skimmer marker `-#` survives
//! normalization, so `W3LPL-1-#` becomes `W3LPL-#`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Returns true for a plausible amateur callsign: 3-10 characters, at least
/// one digit and one letter, drawn from `[A-Z0-9/-]`.
pub fn is_valid(call: &str) -> bool {
    let len = call.len();
    if !(3..=10).contains(&len) {
        return false;
    }
    let mut has_digit = false;
    let mut has_alpha = false;
    for b in call.bytes() {
        match b {
            b'0'..=b'9' => has_digit = true,
            b'A'..=b'Z' => has_alpha = true,
            b'/' | b'-' | b'#' => {}
            _ => return false,
        }
    }
    has_digit && has_alpha
}

/// Upper-case and trim a callsign, dropping a numeric SSID suffix while
/// preserving the skimmer marker: `W3LPL-1-#` -> `W3LPL-#`, `N2WQ-7` ->
/// `N2WQ`. Portable suffixes (`/P`, `/QRP`, ...) are left alone.
pub fn normalize(call: &str) -> String {
    let call = call.trim().to_ascii_uppercase();
    if call.is_empty() || call.contains('/') {
        return call;
    }
    let (base, skimmer) = match call.strip_suffix("-#") {
        Some(base) => (base, true),
        None => (call.as_str(), false),
    };
    let stripped = match base.rsplit_once('-') {
        Some((head, ssid))
            if !head.is_empty() && !ssid.is_empty() && ssid.bytes().all(|b| b.is_ascii_digit()) =>
        {
            head
        }
        _ => base,
    };
    if skimmer {
        format!("{stripped}-#")
    } else {
        stripped.to_string()
    }
}

/// Bounded normalization cache with per-entry TTL.
///
/// Skimmer feeds repeat the same few thousand spotter/DX calls at a very high
/// rate; caching the normalized form avoids re-allocating on every line. The
/// cache is owned by one parser and guarded by its own mutex; nothing mutable
/// escapes this type.
#[derive(Debug)]
pub struct CallCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<String, (String, Instant)>,
    order: VecDeque<String>,
}

impl CallCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = if capacity == 0 { 4096 } else { capacity };
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
            ttl,
        }
    }

    /// Normalize through the cache.
    pub fn normalize(&self, call: &str) -> String {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if let Some((cached, inserted)) = inner.entries.get(call) {
            if now.duration_since(*inserted) < self.ttl {
                return cached.clone();
            }
        }
        let normalized = normalize(call);
        if inner.entries.insert(call.to_string(), (normalized.clone(), now)).is_none() {
            inner.order.push_back(call.to_string());
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        normalized
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid() {
        assert!(is_valid("K1ABC"));
        assert!(is_valid("W3LPL-#"));
        assert!(is_valid("EA5WU/P"));
        assert!(is_valid("2E0ABC"));
        assert!(is_valid("VA3XCD/B"));

        assert!(!is_valid("DX")); // too short
        assert!(!is_valid("CQ")); // too short
        assert!(!is_valid("KABC")); // no digit
        assert!(!is_valid("14074")); // no letter
        assert!(!is_valid("K1ABC$"));
        assert!(!is_valid("VERYLONGCALL1"));
    }

    #[test]
    fn test_normalize_strips_numeric_ssid() {
        assert_eq!(normalize("w3lpl-1-#"), "W3LPL-#");
        assert_eq!(normalize("W3LPL-#"), "W3LPL-#");
        assert_eq!(normalize("N2WQ-7"), "N2WQ");
        assert_eq!(normalize("N2WQ-12"), "N2WQ");
        assert_eq!(normalize("N2WQ-TEST"), "N2WQ-TEST");
        assert_eq!(normalize(" k1abc "), "K1ABC");
        assert_eq!(normalize("EA5WU/P"), "EA5WU/P");
    }

    #[test]
    fn test_cache_returns_normalized_forms() {
        let cache = CallCache::new(16, Duration::from_secs(60));
        assert_eq!(cache.normalize("w3lpl-1-#"), "W3LPL-#");
        assert_eq!(cache.normalize("w3lpl-1-#"), "W3LPL-#");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_evicts_oldest_beyond_capacity() {
        let cache = CallCache::new(2, Duration::from_secs(60));
        cache.normalize("K1AAA");
        cache.normalize("K2BBB");
        cache.normalize("K3CCC");
        assert_eq!(cache.len(), 2);
    }
}
