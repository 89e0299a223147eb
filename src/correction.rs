//! Consensus-based callsign correction.
//!
//! Skimmers miscopy weak CW/RTTY signals in predictable ways: a missed dit
//! turns `K1ABC` into `K1A8C` for one station while ten others copy it
//! correctly. When enough independent spotters agree on a neighboring
//! spelling, the engine rewrites the subject's DX call (or suppresses the
//! spot when the suggested call fails CTY validation). Digital modes with
//! strong FEC are never corrected.
//!
//! Distances between calls are plain Levenshtein by default; for CW a
//! Morse-element weighting can be enabled so confusable characters (long
//! dit/dah sequences) cost more, and likewise a Baudot bit weighting for
//! RTTY. Both weighted distances are guaranteed to be at least the plain
//! distance for the same pair.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::mode::is_correction_candidate;
use crate::spot::Spot;

/// Near-frequency tolerance for corroborating reports, kHz.
const NEAR_FREQUENCY_KHZ: f64 = 0.5;

/// Distance weighting applied per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    #[default]
    Plain,
    Morse,
    Baudot,
}

/// Number of Morse elements (dits + dahs) for a character. Characters a
/// skimmer is more likely to fragment carry more weight.
fn morse_elements(c: u8) -> u32 {
    match c {
        b'E' | b'T' => 1,
        b'A' | b'I' | b'M' | b'N' => 2,
        b'D' | b'G' | b'K' | b'O' | b'R' | b'S' | b'U' | b'W' => 3,
        b'B' | b'C' | b'F' | b'H' | b'J' | b'L' | b'P' | b'Q' | b'V' | b'X' | b'Y' | b'Z' => 4,
        b'0'..=b'9' | b'/' => 5,
        _ => 3,
    }
}

/// Mark-bit weight of a character in ITA2/Baudot framing; figure-shifted
/// characters (digits) carry an extra unit for the case change.
fn baudot_weight(c: u8) -> u32 {
    match c {
        b'E' | b'T' => 1,
        b'A' | b'D' | b'H' | b'I' | b'L' | b'N' | b'O' | b'R' | b'S' | b'Z' => 2,
        b'B' | b'C' | b'F' | b'G' | b'J' | b'M' | b'P' | b'U' | b'W' | b'Y' => 3,
        b'K' | b'Q' | b'V' | b'X' => 4,
        b'3' | b'5' => 2,
        b'4' | b'8' | b'9' => 3,
        b'2' | b'6' | b'7' | b'0' => 4,
        b'1' | b'/' => 5,
        _ => 3,
    }
}

/// Weighted Levenshtein. Insertions and deletions cost the character's
/// weight; substitutions cost the rounded-up mean of both weights. All
/// weights are at least 1, so the result is never below the plain distance.
fn weighted_distance(a: &str, b: &str, weight: fn(u8) -> u32) -> u32 {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut prev: Vec<u32> = vec![0; b.len() + 1];
    for j in 1..=b.len() {
        prev[j] = prev[j - 1] + weight(b[j - 1]);
    }
    let mut current = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        current[0] = prev[0] + weight(a[i - 1]);
        for j in 1..=b.len() {
            let sub_cost = if a[i - 1] == b[j - 1] {
                0
            } else {
                (weight(a[i - 1]) + weight(b[j - 1])).div_ceil(2)
            };
            current[j] = (prev[j - 1] + sub_cost)
                .min(prev[j] + weight(a[i - 1]))
                .min(current[j - 1] + weight(b[j - 1]));
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Edit distance between two callsigns under the configured per-mode models.
/// Non-CW/RTTY modes always use the plain distance.
pub fn call_distance(
    a: &str,
    b: &str,
    mode: &str,
    cw_model: DistanceModel,
    rtty_model: DistanceModel,
) -> u32 {
    let a = a.trim().to_ascii_uppercase();
    let b = b.trim().to_ascii_uppercase();
    let mode = mode.trim().to_ascii_uppercase();
    let model = match mode.as_str() {
        "CW" | "CWT" => cw_model,
        "RTTY" => rtty_model,
        _ => DistanceModel::Plain,
    };
    match model {
        DistanceModel::Morse => weighted_distance(&a, &b, morse_elements),
        DistanceModel::Baudot => weighted_distance(&a, &b, baudot_weight),
        DistanceModel::Plain => strsim::levenshtein(&a, &b) as u32,
    }
}

/// Thresholds governing when a consensus suggestion is accepted.
#[derive(Debug, Clone)]
pub struct CorrectionSettings {
    pub min_consensus_reports: usize,
    pub min_advantage: i64,
    pub min_confidence_percent: i64,
    pub max_edit_distance: u32,
    pub recency_window: ChronoDuration,
    pub cw_model: DistanceModel,
    pub rtty_model: DistanceModel,
    /// Extra thresholds applied when the winning call is a distance-3 edit.
    pub distance3_extra_advantage: i64,
    pub distance3_extra_confidence: i64,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            min_consensus_reports: 3,
            min_advantage: 1,
            min_confidence_percent: 50,
            max_edit_distance: 2,
            recency_window: ChronoDuration::seconds(45),
            cw_model: DistanceModel::Plain,
            rtty_model: DistanceModel::Plain,
            distance3_extra_advantage: 0,
            distance3_extra_confidence: 0,
        }
    }
}

/// Short-lived index entry: just the fields consensus needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionRecord {
    pub dx_call: String,
    pub de_call: String,
    pub frequency_khz: f64,
    pub mode: String,
    pub time: DateTime<Utc>,
}

impl From<&Spot> for CorrectionRecord {
    fn from(spot: &Spot) -> Self {
        Self {
            dx_call: spot.dx_call.clone(),
            de_call: spot.de_call.clone(),
            frequency_khz: spot.frequency_khz,
            mode: spot.mode.clone(),
            time: spot.time,
        }
    }
}

/// An accepted consensus suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub call: String,
    pub supporters: usize,
    pub confidence_percent: i64,
}

/// Result of one consensus evaluation. The subject-side numbers are always
/// populated; `suggestion` is present only when every threshold passed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub suggestion: Option<Suggestion>,
    pub subject_support: usize,
    pub subject_confidence: i64,
    pub total_reporters: usize,
}

/// Evaluate consensus for `subject` against recently seen reports.
///
/// Candidates are filtered to the recency window around the subject's own
/// time, to nearby frequencies, to the same mode, and to spotters other
/// than the subject's own (no self-support). Each unique spotter counts at
/// most once regardless of how many reports it filed.
pub fn suggest_call_correction(
    subject: &CorrectionRecord,
    others: &[CorrectionRecord],
    settings: &CorrectionSettings,
) -> ConsensusOutcome {
    let subject_de = subject.de_call.to_ascii_uppercase();
    let subject_dx = subject.dx_call.to_ascii_uppercase();

    let mut seen_spotters: HashSet<String> = HashSet::new();
    let mut groups: HashMap<String, usize> = HashMap::new();
    for other in others {
        let delta = if other.time > subject.time {
            other.time - subject.time
        } else {
            subject.time - other.time
        };
        if delta > settings.recency_window {
            continue;
        }
        let de = other.de_call.to_ascii_uppercase();
        if de.is_empty() || de == subject_de {
            continue;
        }
        if (other.frequency_khz - subject.frequency_khz).abs() > NEAR_FREQUENCY_KHZ {
            continue;
        }
        if !other.mode.eq_ignore_ascii_case(&subject.mode) {
            continue;
        }
        if !seen_spotters.insert(de) {
            continue;
        }
        *groups.entry(other.dx_call.to_ascii_uppercase()).or_insert(0) += 1;
    }

    // The subject's own report counts toward its spelling.
    let subject_support = 1 + groups.remove(&subject_dx).unwrap_or(0);
    let total = subject_support + groups.values().sum::<usize>();

    let mut winner: Option<(String, usize, u32)> = None;
    for (call, &count) in &groups {
        let distance = call_distance(
            call,
            &subject_dx,
            &subject.mode,
            settings.cw_model,
            settings.rtty_model,
        );
        if distance > settings.max_edit_distance {
            continue;
        }
        let better = match &winner {
            None => true,
            Some((best_call, best_count, best_distance)) => {
                (count, std::cmp::Reverse(distance), std::cmp::Reverse(call.as_str()))
                    > (*best_count, std::cmp::Reverse(*best_distance), std::cmp::Reverse(best_call.as_str()))
            }
        };
        if better {
            winner = Some((call.clone(), count, distance));
        }
    }

    let subject_confidence = subject_support as i64 * 100 / total.max(1) as i64;

    let suggestion = winner.and_then(|(call, supporters, distance)| {
        let confidence = supporters as i64 * 100 / total.max(1) as i64;
        let mut needed_advantage = settings.min_advantage;
        let mut needed_confidence = settings.min_confidence_percent;
        if distance == 3 {
            needed_advantage += settings.distance3_extra_advantage;
            needed_confidence += settings.distance3_extra_confidence;
        }
        let advantage = supporters as i64 - subject_support as i64;
        if supporters >= settings.min_consensus_reports
            && advantage >= needed_advantage
            && confidence >= needed_confidence
        {
            Some(Suggestion {
                call,
                supporters,
                confidence_percent: confidence,
            })
        } else {
            None
        }
    });

    ConsensusOutcome {
        suggestion,
        subject_support,
        subject_confidence,
        total_reporters: total,
    }
}

/// Map a subject's consensus share to its single-letter confidence label.
pub fn confidence_label(percent: i64, total_reporters: usize, known: bool) -> &'static str {
    if total_reporters <= 1 {
        return if known { "S" } else { "?" };
    }
    match percent.clamp(0, 100) {
        0..=25 => {
            if known {
                "S"
            } else {
                "?"
            }
        }
        26..=75 => "P",
        _ => "V",
    }
}

fn freq_bucket(freq_khz: f64) -> i64 {
    (freq_khz * 10.0).round() as i64
}

/// Recency-windowed store of correction records, reachable by DX call and
/// by 100 Hz frequency bucket. One arena of entries, two id indexes; both
/// rebuilt from the same list on insert/evict. Single owner, one mutex.
pub struct CorrectionIndex {
    inner: Mutex<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    next_id: u64,
    entries: HashMap<u64, CorrectionRecord>,
    order: VecDeque<(u64, DateTime<Utc>)>,
    by_call: HashMap<String, Vec<u64>>,
    by_bucket: HashMap<i64, Vec<u64>>,
}

impl Default for CorrectionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrectionIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IndexInner::default()),
        }
    }

    /// Insert a record, evicting everything older than `window` first.
    /// Insertion happens after the consensus decision so a subject's own
    /// entry can never corroborate itself.
    pub fn add(&self, record: CorrectionRecord, now: DateTime<Utc>, window: ChronoDuration) {
        let mut inner = self.inner.lock().unwrap();
        inner.evict(now, window);

        let id = inner.next_id;
        inner.next_id += 1;
        let call_key = record.dx_call.to_ascii_uppercase();
        let bucket = freq_bucket(record.frequency_khz);
        inner.by_call.entry(call_key).or_default().push(id);
        inner.by_bucket.entry(bucket).or_default().push(id);
        inner.order.push_back((id, now));
        inner.entries.insert(id, record);
    }

    /// Recent records plausibly describing the same signal as `subject`:
    /// same-call entries plus everything in the nearby frequency buckets.
    pub fn candidates(
        &self,
        subject: &CorrectionRecord,
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) -> Vec<CorrectionRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.evict(now, window);

        let mut ids: Vec<u64> = Vec::new();
        if let Some(same_call) = inner.by_call.get(&subject.dx_call.to_ascii_uppercase()) {
            ids.extend_from_slice(same_call);
        }
        let bucket = freq_bucket(subject.frequency_khz);
        let spread = (NEAR_FREQUENCY_KHZ * 10.0) as i64;
        for b in (bucket - spread)..=(bucket + spread) {
            if let Some(nearby) = inner.by_bucket.get(&b) {
                ids.extend_from_slice(nearby);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids.iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexInner {
    fn evict(&mut self, now: DateTime<Utc>, window: ChronoDuration) {
        while let Some(&(id, inserted)) = self.order.front() {
            if now - inserted <= window {
                break;
            }
            self.order.pop_front();
            if let Some(record) = self.entries.remove(&id) {
                let call_key = record.dx_call.to_ascii_uppercase();
                if let Some(ids) = self.by_call.get_mut(&call_key) {
                    ids.retain(|&i| i != id);
                    if ids.is_empty() {
                        self.by_call.remove(&call_key);
                    }
                }
                let bucket = freq_bucket(record.frequency_khz);
                if let Some(ids) = self.by_bucket.get_mut(&bucket) {
                    ids.retain(|&i| i != id);
                    if ids.is_empty() {
                        self.by_bucket.remove(&bucket);
                    }
                }
            }
        }
    }
}

/// Decide whether the spot's mode participates in correction at all.
pub fn is_candidate(spot: &Spot) -> bool {
    is_correction_candidate(&spot.mode)
}
