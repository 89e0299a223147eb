//! Unified spot deduplication.
//!
//! Every source adapter funnels into one deduplicator so a signal heard by
//! several skimmer networks at once is broadcast exactly once. A secondary
//! deduper further down the pipeline partitions by source class so human
//! spots are never suppressed by an earlier skimmer duplicate (and vice
//! versa).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::spot::{is_skimmer_source, Spot};

/// Fingerprint of a spot for duplicate detection: callsigns, mode, frequency
/// rounded to 0.1 kHz, and the arrival time quantized to the cluster window
/// so identically-timed reports from different feeds hash alike.
pub fn fingerprint(spot: &Spot, window_secs: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    spot.dx_call.hash(&mut hasher);
    spot.de_call.hash(&mut hasher);
    spot.mode.hash(&mut hasher);
    ((spot.frequency_khz * 10.0).round() as i64).hash(&mut hasher);
    if window_secs > 0 {
        (spot.time.timestamp() / window_secs).hash(&mut hasher);
    }
    hasher.finish()
}

/// Fingerprint without the time component, used by the secondary deduper
/// where the sliding window itself provides the time bound.
fn stable_fingerprint(spot: &Spot, include_spotter: bool) -> u64 {
    let mut hasher = DefaultHasher::new();
    spot.dx_call.hash(&mut hasher);
    if include_spotter {
        spot.de_call.hash(&mut hasher);
    }
    spot.mode.hash(&mut hasher);
    ((spot.frequency_khz * 10.0).round() as i64).hash(&mut hasher);
    hasher.finish()
}

/// Observable dedup counters.
#[derive(Debug, Default)]
pub struct DedupStats {
    pub processed: AtomicU64,
    pub duplicates: AtomicU64,
    pub cache_size: AtomicU64,
    pub output_drops: AtomicU64,
}

impl DedupStats {
    /// `(processed, duplicates, cache_size)` snapshot.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Relaxed),
            self.duplicates.load(Relaxed),
            self.cache_size.load(Relaxed),
        )
    }
}

/// Sliding fingerprint set with O(1) amortized eviction: a FIFO of insertion
/// order alongside the membership map.
struct DedupCache {
    window: ChronoDuration,
    seen: HashMap<u64, DateTime<Utc>>,
    order: VecDeque<(u64, DateTime<Utc>)>,
}

impl DedupCache {
    fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when the fingerprint is new (the spot should be
    /// forwarded), false for a duplicate inside the window.
    fn observe(&mut self, fp: u64, now: DateTime<Utc>) -> bool {
        self.evict(now);
        if self.seen.contains_key(&fp) {
            return false;
        }
        self.seen.insert(fp, now);
        self.order.push_back((fp, now));
        true
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some((fp, inserted)) = self.order.front().copied() {
            if now - inserted <= self.window {
                break;
            }
            self.order.pop_front();
            // Only remove when the stored timestamp matches; a newer
            // insertion for the same fingerprint must survive.
            if self.seen.get(&fp) == Some(&inserted) {
                self.seen.remove(&fp);
            }
        }
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// The unified dedup engine: single bounded input funnel, single bounded
/// output stream, one worker task owning the eviction structure.
pub struct Deduplicator {
    input_tx: mpsc::Sender<Spot>,
    stats: Arc<DedupStats>,
    window_secs: i64,
    handle: JoinHandle<()>,
}

impl Deduplicator {
    /// Spawn the dedup worker. Returns the engine handle and the
    /// deduplicated output stream. A non-positive window turns the engine
    /// into a counted pass-through (dedup disabled).
    pub fn spawn(
        window_secs: i64,
        buffer: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<Spot>) {
        let (input_tx, input_rx) = mpsc::channel(buffer);
        let (output_tx, output_rx) = mpsc::channel(buffer);
        let stats = Arc::new(DedupStats::default());
        let worker_stats = Arc::clone(&stats);
        let handle = tokio::spawn(run_dedup(
            input_rx,
            output_tx,
            window_secs,
            worker_stats,
            shutdown,
        ));
        (
            Self {
                input_tx,
                stats,
                window_secs,
                handle,
            },
            output_rx,
        )
    }

    /// The input funnel every source adapter publishes into.
    pub fn input(&self) -> mpsc::Sender<Spot> {
        self.input_tx.clone()
    }

    pub fn stats(&self) -> Arc<DedupStats> {
        self.stats.clone()
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Wait for the worker to drain and exit (after shutdown was signaled).
    pub async fn join(self) {
        drop(self.input_tx);
        let _ = self.handle.await;
    }
}

async fn run_dedup(
    mut input: mpsc::Receiver<Spot>,
    output: mpsc::Sender<Spot>,
    window_secs: i64,
    stats: Arc<DedupStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cache = DedupCache::new(ChronoDuration::seconds(window_secs.max(1)));
    info!(window_secs, "dedup engine started");
    loop {
        let spot = tokio::select! {
            spot = input.recv() => match spot {
                Some(spot) => spot,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        stats.processed.fetch_add(1, Relaxed);
        if window_secs > 0 {
            let fp = fingerprint(&spot, window_secs);
            if !cache.observe(fp, Utc::now()) {
                stats.duplicates.fetch_add(1, Relaxed);
                continue;
            }
            stats.cache_size.store(cache.len() as u64, Relaxed);
        }
        if output.try_send(spot).is_err() {
            stats.output_drops.fetch_add(1, Relaxed);
            debug!("dedup output channel full, dropping spot");
        }
    }
    info!("dedup engine stopped");
}

/// Post-dedup deduper partitioned by source class: one sliding set for
/// skimmer spots, a disjoint one for human spots.
pub struct SecondaryDeduper {
    window: ChronoDuration,
    include_spotter: bool,
    partitions: Mutex<[DedupCache; 2]>,
}

impl SecondaryDeduper {
    pub fn new(window_secs: i64, include_spotter: bool) -> Self {
        let window = ChronoDuration::seconds(window_secs.max(1));
        Self {
            window,
            include_spotter,
            partitions: Mutex::new([DedupCache::new(window), DedupCache::new(window)]),
        }
    }

    /// Returns true when the spot should continue down the pipeline.
    pub fn should_forward(&self, spot: &Spot, now: DateTime<Utc>) -> bool {
        let fp = stable_fingerprint(spot, self.include_spotter);
        let idx = usize::from(!is_skimmer_source(spot.source));
        let mut partitions = self.partitions.lock().unwrap();
        partitions[idx].observe(fp, now)
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::SourceType;
    use chrono::TimeZone;

    fn make_spot(source: SourceType, at: DateTime<Utc>) -> Spot {
        let mut s = Spot::new("K1ABC", "W1XYZ", 14074.0, "FT8");
        s.source = source;
        s.time = at;
        s
    }

    #[test]
    fn test_fingerprint_matches_for_equal_spots() {
        let at = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let a = make_spot(SourceType::Rbn, at);
        let mut b = make_spot(SourceType::PskReporter, at);
        // Source is not part of the fingerprint.
        assert_eq!(fingerprint(&a, 60), fingerprint(&b, 60));

        b.frequency_khz = 14074.3;
        assert_ne!(fingerprint(&a, 60), fingerprint(&b, 60));
    }

    #[test]
    fn test_fingerprint_tolerates_sub_100hz_jitter() {
        let at = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        let a = make_spot(SourceType::Rbn, at);
        let mut b = make_spot(SourceType::Rbn, at);
        b.frequency_khz = 14074.04;
        assert_eq!(fingerprint(&a, 60), fingerprint(&b, 60));
    }

    #[test]
    fn test_cache_suppresses_within_window() {
        let mut cache = DedupCache::new(ChronoDuration::seconds(60));
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        assert!(cache.observe(42, t0));
        assert!(!cache.observe(42, t0 + ChronoDuration::seconds(30)));
        assert!(cache.observe(42, t0 + ChronoDuration::seconds(120)));
    }

    #[test]
    fn test_cache_eviction_is_sliding() {
        let mut cache = DedupCache::new(ChronoDuration::seconds(60));
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        for fp in 0..100u64 {
            assert!(cache.observe(fp, t0));
        }
        assert_eq!(cache.len(), 100);
        cache.observe(200, t0 + ChronoDuration::seconds(90));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_deduplicator_emits_first_arrival_only() {
        let (_tx, shutdown) = watch::channel(false);
        let (dedup, mut output) = Deduplicator::spawn(60, 64, shutdown);
        let at = Utc::now();

        let input = dedup.input();
        input.send(make_spot(SourceType::Rbn, at)).await.unwrap();
        input.send(make_spot(SourceType::PskReporter, at)).await.unwrap();

        let first = output.recv().await.expect("first spot passes");
        assert_eq!(first.source, SourceType::Rbn);

        let (processed, duplicates, cache_size) = {
            // Both spots drained once the duplicate counter ticks.
            let stats = dedup.stats();
            loop {
                let snap = stats.snapshot();
                if snap.0 >= 2 {
                    break snap;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        };
        assert_eq!(processed, 2);
        assert_eq!(duplicates, 1);
        assert_eq!(cache_size, 1);

        drop(input);
        dedup.join().await;
    }

    #[test]
    fn test_secondary_deduper_splits_by_source_class() {
        let d = SecondaryDeduper::new(60, false);
        let now = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();

        let skimmer = make_spot(SourceType::Rbn, now);
        let human = make_spot(SourceType::Manual, now);

        assert!(d.should_forward(&skimmer, now), "skimmer spot passes");
        assert!(
            d.should_forward(&human, now),
            "human spot passes even when a skimmer duplicate was seen"
        );

        let later = now + ChronoDuration::seconds(10);
        assert!(
            !d.should_forward(&make_spot(SourceType::Manual, later), later),
            "human duplicate suppressed within window"
        );
        assert!(
            !d.should_forward(&make_spot(SourceType::Rbn, later), later),
            "skimmer duplicate suppressed within window"
        );
    }
}
