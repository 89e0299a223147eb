//! Parser for line-oriented DX-cluster spot messages.
//!
//! Skimmer and upstream telnet feeds all emit variations of the same line:
//!
//! ```text
//! DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z
//! ```
//!
//! Token order drifts in the wild (frequency glued to the spotter, time
//! stuck to the front of the last token, `dB` with or without a space), so
//! the parser tokenizes on whitespace and classifies tokens with a single
//! Aho-Corasick pass over the upper-cased line instead of committing to a
//! fixed grammar. A strict variant requires CTY resolution for both calls
//! and applies the US-license gate; the minimal variant keeps whatever it
//! can parse and marks the spot human-originated.

use aho_corasick::AhoCorasick;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::callsign::{self, CallCache};
use crate::cty::CtyDatabase;
use crate::mode::ModeTable;
use crate::skew::SkewStore;
use crate::spot::{CallMetadata, SourceType, Spot};
use crate::uls::{UlsIndex, ADIF_UNITED_STATES};

/// Dial frequencies outside this range are rejected at parse time (kHz).
pub const MIN_DIAL_KHZ: f64 = 100.0;
pub const MAX_DIAL_KHZ: f64 = 3_000_000.0;

/// Errors that can occur while parsing a spot line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a spot line")]
    NotASpot,

    #[error("missing spotter callsign")]
    MissingSpotter,

    #[error("missing numeric frequency")]
    MissingFrequency,

    #[error("missing DX callsign")]
    MissingDxCall,

    #[error("invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("unknown country prefix: {0}")]
    UnknownCountry(String),

    #[error("unlicensed US spotter: {0}")]
    Unlicensed(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Quick pre-filter so the full parser only runs on plausible spot lines.
#[inline]
pub fn looks_like_spot(line: &str) -> bool {
    let trimmed = line.trim_start().as_bytes();
    trimmed.len() > 10 && trimmed[..6].eq_ignore_ascii_case(b"DX de ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeywordKind {
    Dx,
    De,
    Db,
    Wpm,
    Mode(&'static str),
}

/// Structural and mode keywords recognized by the tagger, including the
/// hyphenated digital-mode variants seen on some feeds.
const KEYWORDS: &[(&str, KeywordKind)] = &[
    ("DX", KeywordKind::Dx),
    ("DE", KeywordKind::De),
    ("DB", KeywordKind::Db),
    ("WPM", KeywordKind::Wpm),
    ("CW", KeywordKind::Mode("CW")),
    ("CWT", KeywordKind::Mode("CW")),
    ("RTTY", KeywordKind::Mode("RTTY")),
    ("FT8", KeywordKind::Mode("FT8")),
    ("FT-8", KeywordKind::Mode("FT8")),
    ("FT4", KeywordKind::Mode("FT4")),
    ("FT-4", KeywordKind::Mode("FT4")),
    ("MSK", KeywordKind::Mode("MSK144")),
    ("MSK144", KeywordKind::Mode("MSK144")),
    ("MSK-144", KeywordKind::Mode("MSK144")),
    ("USB", KeywordKind::Mode("USB")),
    ("LSB", KeywordKind::Mode("LSB")),
    ("SSB", KeywordKind::Mode("SSB")),
];

/// The automaton is immutable and built once for the process.
fn keyword_scanner() -> &'static AhoCorasick {
    static SCANNER: OnceLock<AhoCorasick> = OnceLock::new();
    SCANNER.get_or_init(|| {
        AhoCorasick::new(KEYWORDS.iter().map(|(word, _)| *word))
            .expect("keyword automaton construction cannot fail")
    })
}

/// A keyword match spanning `[start, end)` of the upper-cased line.
#[derive(Debug, Clone, Copy)]
struct KeywordMatch {
    start: usize,
    end: usize,
    kind: KeywordKind,
}

/// All keyword matches in one overlapping left-to-right pass.
fn scan_keywords(upper_line: &str) -> Vec<KeywordMatch> {
    keyword_scanner()
        .find_overlapping_iter(upper_line)
        .map(|m| KeywordMatch {
            start: m.start(),
            end: m.end(),
            kind: KEYWORDS[m.pattern().as_usize()].1,
        })
        .collect()
}

/// A token classifies as a keyword iff some match spans exactly its trimmed
/// range. A per-token rescan tolerates positional drift (doubled spaces,
/// peeled prefixes) relative to the global index.
fn classify_token(matches: &[KeywordMatch], tok: &Token) -> Option<KeywordKind> {
    for m in matches {
        if m.start == tok.trim_start && m.end == tok.trim_end {
            return Some(m.kind);
        }
    }
    for m in keyword_scanner().find_overlapping_iter(&tok.upper) {
        if m.start() == 0 && m.end() == tok.upper.len() {
            return Some(KEYWORDS[m.pattern().as_usize()].1);
        }
    }
    None
}

/// One whitespace-delimited token with its cleaned form (leading/trailing
/// `,;:!.` stripped) and the cleaned span within the original line.
#[derive(Debug, Clone)]
struct Token {
    raw: String,
    clean: String,
    upper: String,
    trim_start: usize,
    trim_end: usize,
}

fn is_clutter(b: u8) -> bool {
    matches!(b, b',' | b';' | b':' | b'!' | b'.')
}

fn tokenize(line: &str) -> Vec<Token> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::with_capacity(16);
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        while i < bytes.len() && bytes[i] != b' ' && bytes[i] != b'\t' {
            i += 1;
        }
        let end = i;
        let mut trim_start = start;
        let mut trim_end = end;
        while trim_start < trim_end && is_clutter(bytes[trim_start]) {
            trim_start += 1;
        }
        while trim_end > trim_start && is_clutter(bytes[trim_end - 1]) {
            trim_end -= 1;
        }
        let clean = line[trim_start..trim_end].to_string();
        tokens.push(Token {
            raw: line[start..end].to_string(),
            upper: clean.to_ascii_uppercase(),
            clean,
            trim_start,
            trim_end,
        });
    }
    tokens
}

fn parse_frequency_candidate(tok: &str) -> Option<f64> {
    if tok.is_empty() {
        return None;
    }
    let f: f64 = tok.parse().ok()?;
    if !(MIN_DIAL_KHZ..=MAX_DIAL_KHZ).contains(&f) {
        return None;
    }
    Some(f)
}

fn parse_signed_int(tok: &str) -> Option<i32> {
    if tok.is_empty() || tok.contains('.') {
        return None;
    }
    let v: i32 = tok.parse().ok()?;
    if !(-200..=200).contains(&v) {
        return None;
    }
    Some(v)
}

/// Accepts the glued form `19dB` / `-5dB`.
fn parse_inline_snr(tok: &str) -> Option<i32> {
    let lower = tok.trim().to_ascii_lowercase();
    let num = lower.strip_suffix("db")?;
    if num.is_empty() || num.contains('.') {
        return None;
    }
    parse_signed_int(num)
}

fn is_time_token(tok: &str) -> bool {
    let b = tok.as_bytes();
    b.len() == 5 && b[4] == b'Z' && b[..4].iter().all(|c| c.is_ascii_digit())
}

/// Some feeds glue the time to the front of the last token; peel it off.
fn peel_time_prefix(tok: &str) -> (Option<&str>, &str) {
    if tok.len() >= 5 && tok.is_char_boundary(5) && is_time_token(&tok[..5]) {
        (Some(&tok[..5]), tok[5..].trim_start())
    } else {
        (None, tok)
    }
}

/// Split the spotter token on its first colon. When the remainder parses as
/// a valid dial frequency it becomes the implicit frequency for the line.
fn extract_call_and_freq(tok: &Token) -> (String, Option<f64>) {
    match tok.raw.split_once(':') {
        Some((call, rest)) => {
            let remainder = rest.trim().trim_matches(|c| matches!(c, ',' | ';' | ':'));
            (call.trim().to_string(), parse_frequency_candidate(remainder))
        }
        None => (tok.clean.clone(), None),
    }
}

/// Fallback report extraction: the first signed integer followed by a `dB`
/// marker anywhere in the text, glued or space-separated.
fn scan_for_db(text: &str) -> Option<i32> {
    let mut prev: Option<i32> = None;
    for raw in text.split_whitespace() {
        let tok = raw.trim_matches(|c| matches!(c, ',' | ';' | ':' | '!' | '.'));
        if let Some(v) = parse_inline_snr(tok) {
            return Some(v);
        }
        if tok.eq_ignore_ascii_case("db") {
            if let Some(v) = prev {
                return Some(v);
            }
        }
        prev = parse_signed_int(tok);
    }
    None
}

/// Combine an `HHMMZ` token with today's UTC date. A result more than 12
/// hours in the future rolls back one day; more than 12 hours in the past
/// rolls forward (both happen around midnight UTC).
pub fn resolve_hhmmz(token: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    if !is_time_token(token) {
        return now;
    }
    let hour: u32 = token[0..2].parse().unwrap_or(0);
    let min: u32 = token[2..4].parse().unwrap_or(0);
    if hour > 23 || min > 59 {
        return now;
    }
    let Some(naive) = now.date_naive().and_hms_opt(hour, min, 0) else {
        return now;
    };
    let mut ts = Utc.from_utc_datetime(&naive);
    if ts - now > ChronoDuration::hours(12) {
        ts -= ChronoDuration::days(1);
    } else if now - ts > ChronoDuration::hours(12) {
        ts += ChronoDuration::days(1);
    }
    ts
}

/// Raw fields extracted from one spot line before CTY/skew/source
/// enrichment. Calls are as-seen on the wire (trimmed, not yet normalized).
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpot {
    pub de_call: String,
    pub dx_call: String,
    pub frequency_khz: f64,
    /// Mode keyword as tagged, empty when the line carried none.
    pub mode: String,
    pub report: Option<i32>,
    pub wpm: Option<i32>,
    pub time_token: Option<String>,
    pub comment: String,
}

/// Extract structural fields from a spot line. Pure: no lookups, no clock.
pub fn extract_fields(line: &str) -> ParseResult<RawSpot> {
    let line = line.trim();
    let mut tokens = tokenize(line);
    if tokens.len() < 3 {
        return Err(ParseError::NotASpot);
    }
    if tokens[0].upper != "DX" || tokens[1].upper != "DE" {
        return Err(ParseError::NotASpot);
    }
    let matches = scan_keywords(&line.to_ascii_uppercase());
    let mut consumed = vec![false; tokens.len()];
    consumed[0] = true;
    consumed[1] = true;

    let (de_call, freq_from_call) = extract_call_and_freq(&tokens[2]);
    if de_call.is_empty() {
        return Err(ParseError::MissingSpotter);
    }
    consumed[2] = true;

    let mut freq = freq_from_call;
    let mut dx_call = String::new();
    let mut mode = String::new();
    let mut time_token: Option<String> = None;
    let mut report: Option<i32> = None;
    let mut wpm: Option<i32> = None;
    let mut pending_num: Option<(usize, i32)> = None;

    for idx in 3..tokens.len() {
        if time_token.is_none() {
            let original = tokens[idx].clean.clone();
            if let (Some(ts), remainder) = peel_time_prefix(&original) {
                time_token = Some(ts.to_string());
                let shift = original.len() - remainder.len();
                tokens[idx].trim_start += shift;
                tokens[idx].trim_end = tokens[idx].trim_start + remainder.len();
                tokens[idx].upper = remainder.to_ascii_uppercase();
                tokens[idx].clean = remainder.to_string();
            }
        }
        let clean = tokens[idx].clean.clone();
        if clean.is_empty() {
            consumed[idx] = true;
            continue;
        }
        if time_token.is_none() && is_time_token(&clean) {
            time_token = Some(clean);
            consumed[idx] = true;
            pending_num = None;
            continue;
        }
        if freq.is_none() {
            if let Some(f) = parse_frequency_candidate(&clean) {
                freq = Some(f);
                consumed[idx] = true;
                continue;
            }
        }

        if let Some(kind) = classify_token(&matches, &tokens[idx]) {
            match kind {
                KeywordKind::Mode(m) => {
                    if mode.is_empty() {
                        mode = m.to_string();
                        consumed[idx] = true;
                        continue;
                    }
                }
                KeywordKind::Db => {
                    if report.is_none() {
                        if let Some((num_idx, value)) = pending_num.take() {
                            report = Some(value);
                            consumed[num_idx] = true;
                        }
                    }
                    consumed[idx] = true;
                    continue;
                }
                KeywordKind::Wpm => {
                    if wpm.is_none() {
                        if let Some((num_idx, value)) = pending_num.take() {
                            wpm = Some(value);
                            consumed[num_idx] = true;
                            consumed[idx] = true;
                            continue;
                        }
                    }
                }
                KeywordKind::Dx | KeywordKind::De => {
                    consumed[idx] = true;
                    continue;
                }
            }
        }

        if report.is_none() {
            if let Some(v) = parse_inline_snr(&clean) {
                report = Some(v);
                consumed[idx] = true;
                continue;
            }
        }

        if freq.is_some() && dx_call.is_empty() {
            let upper = clean.to_ascii_uppercase();
            if callsign::is_valid(&upper) {
                dx_call = upper;
                consumed[idx] = true;
                continue;
            }
        }

        if pending_num.is_none() {
            if let Some(v) = parse_signed_int(&clean) {
                pending_num = Some((idx, v));
            }
        }
    }

    let frequency_khz = freq.ok_or(ParseError::MissingFrequency)?;
    if dx_call.is_empty() {
        return Err(ParseError::MissingDxCall);
    }

    let mut comment_parts: Vec<&str> = Vec::new();
    for (idx, tok) in tokens.iter().enumerate() {
        if consumed[idx] {
            continue;
        }
        let clean = tok.clean.trim();
        if clean.is_empty() || tok.upper == "DX" || tok.upper == "DE" || is_time_token(&tok.upper) {
            continue;
        }
        comment_parts.push(clean);
    }
    let mut comment = comment_parts.join(" ");

    if report.is_none() {
        report = scan_for_db(&comment).or_else(|| scan_for_db(line));
    }
    if let Some(w) = wpm {
        comment = if comment.is_empty() {
            format!("{w} WPM")
        } else {
            format!("{w} WPM {comment}")
        };
    }

    Ok(RawSpot {
        de_call,
        dx_call,
        frequency_khz,
        mode,
        report,
        wpm,
        time_token,
        comment,
    })
}

/// A spot dropped because its US spotter failed the license check.
#[derive(Debug, Clone)]
pub struct UnlicensedEvent {
    pub source: String,
    pub role: &'static str,
    pub call: String,
    pub mode: String,
    pub frequency_khz: f64,
}

/// Collaborators and policy for turning [`RawSpot`]s into canonical spots.
pub struct SpotParser {
    cty: Option<Arc<CtyDatabase>>,
    uls: Option<Arc<UlsIndex>>,
    skew: Option<Arc<SkewStore>>,
    modes: Arc<ModeTable>,
    call_cache: CallCache,
    /// Permissive mode for human/upstream feeds: keep spots that fail CTY
    /// resolution and mark them human-originated.
    minimal: bool,
    node_tag: String,
    unlicensed_tx: Option<mpsc::Sender<UnlicensedEvent>>,
}

impl SpotParser {
    pub fn new(modes: Arc<ModeTable>, node_tag: impl Into<String>) -> Self {
        Self {
            cty: None,
            uls: None,
            skew: None,
            modes,
            call_cache: CallCache::new(4096, Duration::from_secs(600)),
            minimal: false,
            node_tag: node_tag.into(),
            unlicensed_tx: None,
        }
    }

    pub fn with_cty(mut self, cty: Arc<CtyDatabase>) -> Self {
        self.cty = Some(cty);
        self
    }

    pub fn with_uls(mut self, uls: Arc<UlsIndex>) -> Self {
        self.uls = Some(uls);
        self
    }

    pub fn with_skew(mut self, skew: Arc<SkewStore>) -> Self {
        self.skew = Some(skew);
        self
    }

    /// Switch into the permissive parser intended for human/upstream feeds.
    pub fn minimal(mut self) -> Self {
        self.minimal = true;
        self
    }

    /// Install a best-effort reporter queue for unlicensed-US drops. On a
    /// full queue the event is handed to a detached task instead.
    pub fn with_unlicensed_reporter(mut self, tx: mpsc::Sender<UnlicensedEvent>) -> Self {
        self.unlicensed_tx = Some(tx);
        self
    }

    /// Parse one telnet line into a canonical spot.
    pub fn parse_line(&self, line: &str, now: DateTime<Utc>) -> ParseResult<Spot> {
        let raw = extract_fields(line)?;

        let de_call = self.call_cache.normalize(&raw.de_call);
        let dx_call = self.call_cache.normalize(&raw.dx_call);
        let mode = self.modes.finalize(&raw.mode, raw.frequency_khz);

        if !callsign::is_valid(&dx_call) {
            return Err(ParseError::InvalidCallsign(dx_call));
        }
        if !callsign::is_valid(&de_call) {
            return Err(ParseError::InvalidCallsign(de_call));
        }

        let (dx_meta, de_meta) = self.resolve_metadata(&dx_call, &de_call, &mode, raw.frequency_khz)?;

        let mut frequency = raw.frequency_khz;
        if !self.minimal {
            if let Some(skew) = &self.skew {
                frequency = skew.apply_correction(&raw.de_call, frequency);
            }
        }

        let mut spot = Spot::new(&dx_call, &de_call, frequency, &mode);
        spot.dx_metadata = dx_meta;
        spot.de_metadata = de_meta;
        if let Some(token) = &raw.time_token {
            spot.time = resolve_hhmmz(token, now);
        } else {
            spot.time = now;
        }
        if let Some(report) = raw.report {
            spot.report = report;
            spot.has_report = true;
        }
        spot.comment = raw.comment;

        if self.minimal {
            spot.source = SourceType::Upstream;
            spot.source_node = self.node_tag.clone();
        } else {
            spot.source = match spot.mode.as_str() {
                "FT8" => SourceType::Ft8,
                "FT4" => SourceType::Ft4,
                _ => SourceType::Rbn,
            };
            spot.source_node = self.node_tag.clone();
        }
        spot.refresh_beacon_flag();
        spot.ensure_normalized();
        Ok(spot)
    }

    fn resolve_metadata(
        &self,
        dx_call: &str,
        de_call: &str,
        mode: &str,
        freq: f64,
    ) -> ParseResult<(CallMetadata, CallMetadata)> {
        let Some(cty) = &self.cty else {
            return Ok((CallMetadata::default(), CallMetadata::default()));
        };
        if self.minimal {
            let dx_meta = cty.lookup(dx_call).map(CallMetadata::from).unwrap_or_default();
            let de_meta = cty.lookup(de_call).map(CallMetadata::from).unwrap_or_default();
            return Ok((dx_meta, de_meta));
        }
        let dx_info = cty
            .lookup(dx_call)
            .ok_or_else(|| ParseError::UnknownCountry(dx_call.to_string()))?;
        let de_info = cty
            .lookup(de_call)
            .ok_or_else(|| ParseError::UnknownCountry(de_call.to_string()))?;
        if de_info.adif == ADIF_UNITED_STATES {
            if let Some(uls) = &self.uls {
                if !uls.is_licensed(de_call) {
                    self.dispatch_unlicensed(de_call, mode, freq);
                    return Err(ParseError::Unlicensed(de_call.to_string()));
                }
            }
        }
        Ok((CallMetadata::from(dx_info), CallMetadata::from(de_info)))
    }

    fn dispatch_unlicensed(&self, call: &str, mode: &str, freq: f64) {
        let Some(tx) = &self.unlicensed_tx else {
            return;
        };
        let event = UnlicensedEvent {
            source: self.node_tag.clone(),
            role: "DE",
            call: call.to_string(),
            mode: mode.to_string(),
            frequency_khz: freq,
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(event).await.is_err() {
                    warn!("unlicensed reporter queue closed");
                }
            });
        }
    }
}

/// Log-and-drop wrapper used by feed read loops.
pub fn parse_or_log(parser: &SpotParser, line: &str, now: DateTime<Utc>) -> Option<Spot> {
    match parser.parse_line(line, now) {
        Ok(spot) => Some(spot),
        Err(e) => {
            debug!(error = %e, line, "dropping unparseable spot line");
            None
        }
    }
}
