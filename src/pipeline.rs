//! Post-dedup processing pipeline.
//!
//! Single consumer of the dedup output. Stages run in a fixed order per
//! spot: age gate, secondary dedupe, call correction, harmonic
//! suppression, frequency averaging, then archive enqueue and broadcast.
//! The correction index and harmonic state are only ever touched from this
//! task, so per-call updates need no cross-call synchronization.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::adaptive::{AdaptiveRefresher, BandActivityTracker};
use crate::archive::ArchiveHandle;
use crate::averager::{round_tenth_khz, FrequencyAverager};
use crate::buffer::RingBuffer;
use crate::correction::{
    confidence_label, suggest_call_correction, CorrectionIndex, CorrectionRecord,
    CorrectionSettings,
};
use crate::cty::CtyDatabase;
use crate::dedup::SecondaryDeduper;
use crate::harmonics::HarmonicDetector;
use crate::known::KnownCallsigns;
use crate::mode::is_correction_candidate;
use crate::server::BroadcastServer;
use crate::spot::Spot;
use crate::stats::Tracker;

/// Per-spot policy knobs that are not owned by a dedicated stage.
#[derive(Debug, Clone)]
pub struct SpotPolicy {
    /// Spots older than this are dropped outright (None disables the gate).
    pub max_age: Option<ChronoDuration>,
    pub freq_avg_window: ChronoDuration,
    pub freq_avg_tolerance_khz: f64,
    pub freq_avg_min_reports: usize,
}

impl Default for SpotPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(ChronoDuration::seconds(300)),
            freq_avg_window: ChronoDuration::seconds(45),
            freq_avg_tolerance_khz: 0.3,
            freq_avg_min_reports: 3,
        }
    }
}

/// What to do when a consensus suggestion fails CTY validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidSuggestionAction {
    /// Keep the original call, label the spot "B".
    #[default]
    Tag,
    /// Drop the spot entirely.
    Suppress,
}

/// The consensus correction stage: index, thresholds, validation policy.
pub struct CorrectionStage {
    index: CorrectionIndex,
    settings: CorrectionSettings,
    cty: Option<Arc<CtyDatabase>>,
    known: Option<Arc<KnownCallsigns>>,
    invalid_action: InvalidSuggestionAction,
    pub corrections: AtomicU64,
    pub suppressions: AtomicU64,
}

impl CorrectionStage {
    pub fn new(
        settings: CorrectionSettings,
        cty: Option<Arc<CtyDatabase>>,
        known: Option<Arc<KnownCallsigns>>,
        invalid_action: InvalidSuggestionAction,
    ) -> Self {
        Self {
            index: CorrectionIndex::new(),
            settings,
            cty,
            known,
            invalid_action,
            corrections: AtomicU64::new(0),
            suppressions: AtomicU64::new(0),
        }
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Evaluate consensus for the spot, possibly rewriting its DX call and
    /// always assigning a confidence label. Returns true when the spot
    /// should be suppressed. The spot is indexed after the decision (under
    /// its corrected spelling when one was applied) so it can corroborate
    /// later subjects but never itself.
    pub fn apply(&self, spot: &mut Spot, now: DateTime<Utc>) -> bool {
        let window = self.settings.recency_window;
        let subject = CorrectionRecord::from(&*spot);
        let candidates = self.index.candidates(&subject, now, window);
        let outcome = suggest_call_correction(&subject, &candidates, &self.settings);

        let known = self
            .known
            .as_ref()
            .is_some_and(|k| k.contains(&spot.dx_call));
        spot.confidence =
            confidence_label(outcome.subject_confidence, outcome.total_reporters, known)
                .to_string();

        let mut suppress = false;
        if let Some(suggestion) = outcome.suggestion {
            let validated = match &self.cty {
                Some(cty) => cty.lookup(&suggestion.call).is_some(),
                // Without a CTY collaborator consensus stands on its own.
                None => true,
            };
            if validated {
                info!(
                    from = %spot.dx_call,
                    to = %suggestion.call,
                    freq = spot.frequency_khz,
                    supporters = suggestion.supporters,
                    confidence = suggestion.confidence_percent,
                    "call correction applied"
                );
                spot.dx_call = suggestion.call;
                spot.confidence = "C".to_string();
                self.corrections.fetch_add(1, Relaxed);
            } else if self.invalid_action == InvalidSuggestionAction::Suppress {
                info!(
                    subject = %spot.dx_call,
                    suggested = %suggestion.call,
                    freq = spot.frequency_khz,
                    "suggested call failed validation, suppressing spot"
                );
                self.suppressions.fetch_add(1, Relaxed);
                suppress = true;
            } else {
                debug!(
                    subject = %spot.dx_call,
                    suggested = %suggestion.call,
                    "suggested call failed validation, tagging bogus"
                );
                spot.confidence = "B".to_string();
            }
        }

        self.index.add(CorrectionRecord::from(&*spot), now, window);
        suppress
    }
}

/// Drop/rewrite counters for the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub stale_drops: AtomicU64,
    pub secondary_dupes: AtomicU64,
    pub harmonic_drops: AtomicU64,
    pub frequency_rewrites: AtomicU64,
    pub emitted: AtomicU64,
}

/// Everything the post-dedup pipeline consults, built once at startup.
pub struct Pipeline {
    pub tracker: Arc<Tracker>,
    pub buffer: Arc<RingBuffer>,
    pub server: Option<Arc<BroadcastServer>>,
    pub archive: Option<ArchiveHandle>,
    pub secondary: Option<SecondaryDeduper>,
    pub correction: Option<CorrectionStage>,
    pub harmonics: Option<HarmonicDetector>,
    pub averager: FrequencyAverager,
    pub activity: Option<(Arc<BandActivityTracker>, Arc<AdaptiveRefresher>)>,
    pub policy: SpotPolicy,
    pub stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Run one spot through every stage. Returns the spot to emit, or None
    /// when a stage dropped it.
    pub fn process(&self, mut spot: Spot, now: DateTime<Utc>) -> Option<Arc<Spot>> {
        self.tracker.record(&spot);

        if let Some(max_age) = self.policy.max_age {
            if now - spot.time > max_age {
                self.stats.stale_drops.fetch_add(1, Relaxed);
                debug!(dx = %spot.dx_call, freq = spot.frequency_khz, "dropping stale spot");
                return None;
            }
        }

        if let Some(secondary) = &self.secondary {
            if !secondary.should_forward(&spot, now) {
                self.stats.secondary_dupes.fetch_add(1, Relaxed);
                return None;
            }
        }

        if is_correction_candidate(&spot.mode) {
            match &self.correction {
                Some(stage) => {
                    if stage.apply(&mut spot, now) {
                        return None;
                    }
                }
                None => spot.confidence = "?".to_string(),
            }
        } else {
            spot.confidence.clear();
        }

        if let Some(harmonics) = &self.harmonics {
            if let Some(fundamental) = harmonics.should_drop(&spot, now) {
                self.stats.harmonic_drops.fetch_add(1, Relaxed);
                info!(
                    dx = %spot.dx_call,
                    fundamental,
                    harmonic = spot.frequency_khz,
                    "harmonic suppressed"
                );
                return None;
            }
        }

        if is_correction_candidate(&spot.mode) {
            let (mean, reports) = self.averager.average(
                &spot.dx_call,
                spot.frequency_khz,
                now,
                self.policy.freq_avg_window,
            );
            let rounded = round_tenth_khz(mean);
            if reports >= self.policy.freq_avg_min_reports
                && (rounded - spot.frequency_khz).abs() >= self.policy.freq_avg_tolerance_khz
            {
                debug!(
                    dx = %spot.dx_call,
                    from = spot.frequency_khz,
                    to = rounded,
                    reports,
                    "frequency averaged"
                );
                spot.frequency_khz = rounded;
                self.stats.frequency_rewrites.fetch_add(1, Relaxed);
            }
        }

        if let Some((activity, refresher)) = &self.activity {
            if let Some(band) = spot.band() {
                activity.record(band, now);
            }
            refresher.increment();
        }

        self.stats.emitted.fetch_add(1, Relaxed);
        Some(Arc::new(spot))
    }

    /// Emit a processed spot to the history buffer, archive queue, and
    /// broadcast fan-out.
    fn emit(&self, spot: Arc<Spot>) {
        self.buffer.add(Arc::clone(&spot));
        if let Some(archive) = &self.archive {
            archive.enqueue(Arc::clone(&spot));
        }
        if let Some(server) = &self.server {
            server.broadcast(&spot);
        }
    }
}

/// Drive the pipeline until the dedup output closes or shutdown flips.
pub async fn run(
    mut input: mpsc::Receiver<Spot>,
    pipeline: Pipeline,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("post-dedup pipeline started");
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
        if let Some(spot) = pipeline.process(spot, Utc::now()) {
            pipeline.emit(spot);
        }
    }
    info!("post-dedup pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cty::PrefixInfo;
    use crate::harmonics::HarmonicSettings;
    use crate::spot::SourceType;
    use chrono::TimeZone;

    fn test_cty() -> Arc<CtyDatabase> {
        Arc::new(CtyDatabase::from_entries(vec![(
            "K".into(),
            PrefixInfo::new("United States", "NA", 5, 8, 291),
        )]))
    }

    fn base_pipeline() -> Pipeline {
        Pipeline {
            tracker: Arc::new(Tracker::new()),
            buffer: Arc::new(RingBuffer::new(100)),
            server: None,
            archive: None,
            secondary: None,
            correction: None,
            harmonics: None,
            averager: FrequencyAverager::new(),
            activity: None,
            policy: SpotPolicy {
                max_age: Some(ChronoDuration::seconds(300)),
                ..Default::default()
            },
            stats: Arc::new(PipelineStats::default()),
        }
    }

    fn cw_spot(dx: &str, de: &str, freq: f64, at: DateTime<Utc>) -> Spot {
        let mut s = Spot::new(dx, de, freq, "CW");
        s.source = SourceType::Rbn;
        s.source_node = "RBN".to_string();
        s.time = at;
        s.report = 20;
        s.has_report = true;
        s
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_age_gate_drops_stale_spots() {
        let p = base_pipeline();
        let t = now();
        let stale = cw_spot("K1ABC", "K3LR-#", 14025.0, t - ChronoDuration::seconds(600));
        assert!(p.process(stale, t).is_none());
        assert_eq!(p.stats.stale_drops.load(Relaxed), 1);

        let fresh = cw_spot("K1ABC", "K3LR-#", 14025.0, t);
        assert!(p.process(fresh, t).is_some());
    }

    #[test]
    fn test_confidence_label_without_correction_stage() {
        let p = base_pipeline();
        let t = now();
        let emitted = p.process(cw_spot("K1ABC", "K3LR-#", 14025.0, t), t).unwrap();
        assert_eq!(emitted.confidence, "?");

        let mut ft8 = cw_spot("K1ABC", "K3LR-#", 14074.0, t);
        ft8.mode = "FT8".to_string();
        let emitted = p.process(ft8, t).unwrap();
        assert_eq!(emitted.confidence, "");
    }

    #[test]
    fn test_consensus_correction_end_to_end() {
        let mut p = base_pipeline();
        p.correction = Some(CorrectionStage::new(
            CorrectionSettings {
                min_consensus_reports: 3,
                min_advantage: 1,
                min_confidence_percent: 50,
                max_edit_distance: 2,
                recency_window: ChronoDuration::seconds(30),
                ..Default::default()
            },
            Some(test_cty()),
            None,
            InvalidSuggestionAction::Tag,
        ));
        let t = now();

        // Three independent spotters report K1A8C.
        for de in ["W2BBB-#", "W3CCC-#", "W4DDD-#"] {
            let emitted = p.process(cw_spot("K1A8C", de, 14074.0, t), t).unwrap();
            assert_eq!(emitted.dx_call, "K1A8C");
        }

        // The fourth spotter miscopied; consensus rewrites it.
        let emitted = p
            .process(cw_spot("K1ABC", "W1AAA-#", 14074.0, t), t)
            .expect("spot survives");
        assert_eq!(emitted.dx_call, "K1A8C");
        assert_eq!(emitted.confidence, "C");
        let stage = p.correction.as_ref().unwrap();
        assert_eq!(stage.corrections.load(Relaxed), 1);
    }

    #[test]
    fn test_invalid_suggestion_suppresses_when_configured() {
        // CTY that knows only the subject's prefix family is irrelevant
        // here; use one that resolves nothing so every suggestion fails.
        let empty_cty = Arc::new(CtyDatabase::from_entries(vec![(
            "ZZZZ".into(),
            PrefixInfo::new("Nowhere", "EU", 1, 1, 1),
        )]));
        let mut p = base_pipeline();
        p.correction = Some(CorrectionStage::new(
            CorrectionSettings {
                min_consensus_reports: 3,
                min_advantage: 1,
                min_confidence_percent: 50,
                max_edit_distance: 2,
                recency_window: ChronoDuration::seconds(30),
                ..Default::default()
            },
            Some(empty_cty),
            None,
            InvalidSuggestionAction::Suppress,
        ));
        let t = now();
        for de in ["W2BBB-#", "W3CCC-#", "W4DDD-#"] {
            p.process(cw_spot("K1A8C", de, 14074.0, t), t).unwrap();
        }
        assert!(p.process(cw_spot("K1ABC", "W1AAA-#", 14074.0, t), t).is_none());
        assert_eq!(p.correction.as_ref().unwrap().suppressions.load(Relaxed), 1);
    }

    #[test]
    fn test_harmonic_suppression_in_pipeline() {
        let mut p = base_pipeline();
        p.harmonics = Some(HarmonicDetector::new(HarmonicSettings {
            enabled: true,
            recency_window: ChronoDuration::minutes(2),
            max_harmonic_multiple: 4,
            frequency_tolerance_hz: 25.0,
            min_report_delta: 6,
        }));
        let t = now();

        let mut fundamental = cw_spot("K1ABC", "K3LR-#", 7011.0, t);
        fundamental.report = 20;
        assert!(p.process(fundamental, t).is_some());

        let t1 = t + ChronoDuration::seconds(5);
        let mut harmonic = cw_spot("K1ABC", "K3LR-#", 14022.0, t1);
        harmonic.report = 10;
        assert!(p.process(harmonic, t1).is_none());
        assert_eq!(p.stats.harmonic_drops.load(Relaxed), 1);
    }

    #[test]
    fn test_frequency_averaging_rewrites() {
        let mut p = base_pipeline();
        p.policy.freq_avg_min_reports = 3;
        p.policy.freq_avg_tolerance_khz = 0.3;
        let t = now();

        p.process(cw_spot("K1ABC", "W2BBB-#", 7010.0, t), t).unwrap();
        p.process(cw_spot("K1ABC", "W3CCC-#", 7010.0, t + ChronoDuration::seconds(2)), t + ChronoDuration::seconds(2))
            .unwrap();
        // Third report is 1.2 kHz off; the mean pulls it back.
        let t3 = t + ChronoDuration::seconds(4);
        let emitted = p.process(cw_spot("K1ABC", "W4DDD-#", 7011.2, t3), t3).unwrap();
        assert_eq!(emitted.frequency_khz, 7010.4);
        assert_eq!(p.stats.frequency_rewrites.load(Relaxed), 1);
    }

    #[test]
    fn test_secondary_dedupe_partitions() {
        let mut p = base_pipeline();
        p.secondary = Some(SecondaryDeduper::new(60, false));
        let t = now();

        let skimmer = cw_spot("K1ABC", "K3LR-#", 14025.0, t);
        assert!(p.process(skimmer, t).is_some());

        let mut human = cw_spot("K1ABC", "K3LR-#", 14025.0, t);
        human.source = SourceType::Manual;
        human.is_human = true;
        assert!(p.process(human, t).is_some(), "human spot passes its own partition");

        let dup = cw_spot("K1ABC", "K3LR-#", 14025.0, t + ChronoDuration::seconds(5));
        assert!(p.process(dup, t + ChronoDuration::seconds(5)).is_none());
        assert_eq!(p.stats.secondary_dupes.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_emits_to_buffer_and_archive() {
        let (archive, mut archive_rx) = ArchiveHandle::new(16);
        let mut p = base_pipeline();
        p.policy.max_age = None;
        p.archive = Some(archive);
        let buffer = Arc::clone(&p.buffer);

        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(rx, p, shutdown_rx));

        tx.send(cw_spot("K1ABC", "K3LR-#", 14025.0, Utc::now())).await.unwrap();
        let archived = archive_rx.recv().await.expect("archived spot");
        assert_eq!(archived.dx_call, "K1ABC");
        assert_eq!(buffer.len(), 1);

        drop(tx);
        task.await.unwrap();
    }
}
