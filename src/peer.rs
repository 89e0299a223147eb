//! DXSpider-style peering feed.
//!
//! Peers speak the PC protocol over telnet: caret-delimited frames like
//! `PC61^14074.0^K1ABC^18-Nov-2025^2259Z^FT8 -10 dB^W3LPL^RELAY^1.2.3.4^H97^~`.
//! Only the frame-to-spot conversion is in scope here; the handshake is a
//! plain callsign login. Telnet option negotiation is refused wholesale to
//! keep the link in character mode, and a short-lived seen-set drops frames
//! relayed back to us by more than one peer.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::mode::ModeTable;
use crate::parser::{MAX_DIAL_KHZ, MIN_DIAL_KHZ};
use crate::spot::{SourceType, Spot};

const TELNET_IAC: u8 = 255;
const TELNET_DONT: u8 = 254;
const TELNET_DO: u8 = 253;
const TELNET_WONT: u8 = 252;
const TELNET_WILL: u8 = 251;
const TELNET_SB: u8 = 250;
const TELNET_SE: u8 = 240;

/// Strips telnet IAC sequences from a byte stream, producing clean payload
/// bytes plus refuse-all negotiation replies.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    in_iac: bool,
    in_subnegotiation: bool,
    pending_verb: Option<u8>,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw socket bytes; returns `(payload, replies)`.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<[u8; 3]>) {
        let mut out = Vec::with_capacity(input.len());
        let mut replies = Vec::new();
        for &b in input {
            if let Some(verb) = self.pending_verb.take() {
                match verb {
                    TELNET_DO => replies.push([TELNET_IAC, TELNET_WONT, b]),
                    TELNET_WILL => replies.push([TELNET_IAC, TELNET_DONT, b]),
                    _ => {}
                }
                continue;
            }
            if self.in_iac {
                self.in_iac = false;
                match b {
                    TELNET_SB => self.in_subnegotiation = true,
                    TELNET_SE => self.in_subnegotiation = false,
                    TELNET_DO | TELNET_WILL => self.pending_verb = Some(b),
                    TELNET_DONT | TELNET_WONT => self.pending_verb = Some(b),
                    TELNET_IAC => out.push(TELNET_IAC),
                    _ => {}
                }
                continue;
            }
            if b == TELNET_IAC {
                self.in_iac = true;
                continue;
            }
            if self.in_subnegotiation {
                continue;
            }
            out.push(b);
        }
        (out, replies)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty line")]
    Empty,

    #[error("unsupported frame type: {0}")]
    Unsupported(String),

    #[error("{frame}: insufficient fields")]
    InsufficientFields { frame: &'static str },

    #[error("{frame}: bad frequency: {value}")]
    BadFrequency { frame: &'static str, value: String },
}

/// A parsed PC protocol sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub fields: Vec<String>,
    pub hop: u8,
}

impl Frame {
    /// Parse a caret-delimited PC frame. The hop counter is the trailing
    /// `H<n>` token when present.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let raw = line.trim().trim_end_matches('~');
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        let parts: Vec<&str> = raw.split('^').collect();
        let kind = parts[0].trim().to_ascii_uppercase();
        let mut hop = 0u8;
        for part in parts.iter().rev() {
            let token = part.trim();
            if let Some(num) = token.strip_prefix('H').or_else(|| token.strip_prefix('h')) {
                if let Ok(v) = num.parse::<u8>() {
                    hop = v;
                }
                break;
            }
        }
        Ok(Self {
            kind,
            fields: parts[1..].iter().map(|s| s.to_string()).collect(),
            hop,
        })
    }

    /// Payload fields with trailing empties and the hop marker removed.
    fn payload_fields(&self) -> &[String] {
        let mut fields = &self.fields[..];
        while let Some(last) = fields.last() {
            if !last.trim().is_empty() {
                break;
            }
            fields = &fields[..fields.len() - 1];
        }
        if let Some(last) = fields.last() {
            let t = last.trim();
            if t.starts_with('H') || t.starts_with('h') {
                fields = &fields[..fields.len() - 1];
            }
        }
        fields
    }
}

/// Convert a PC11 or PC61 frame into a spot. `fallback_origin` names the
/// peer link, used when the frame's origin field is blank.
pub fn spot_from_frame(
    frame: &Frame,
    fallback_origin: &str,
    modes: &ModeTable,
    now: DateTime<Utc>,
) -> Result<Spot, FrameError> {
    let (min_fields, name): (usize, &'static str) = match frame.kind.as_str() {
        "PC11" => (7, "PC11"),
        // PC61 appends the spotter IP, which we do not store.
        "PC61" => (8, "PC61"),
        _ => return Err(FrameError::Unsupported(frame.kind.clone())),
    };
    let fields = frame.payload_fields();
    if fields.len() < min_fields {
        return Err(FrameError::InsufficientFields { frame: name });
    }
    let freq: f64 = fields[0]
        .trim()
        .parse()
        .map_err(|_| FrameError::BadFrequency {
            frame: name,
            value: fields[0].trim().to_string(),
        })?;
    if !(MIN_DIAL_KHZ..=MAX_DIAL_KHZ).contains(&freq) {
        return Err(FrameError::BadFrequency {
            frame: name,
            value: fields[0].trim().to_string(),
        });
    }
    let dx = fields[1].trim();
    let date = fields[2].trim();
    let time_str = fields[3].trim();
    let comment = &fields[4];
    let spotter = fields[5].trim();
    let mut origin = fields[6].trim();
    if origin.is_empty() {
        origin = fallback_origin;
    }

    let ts = parse_pc_datetime(date, time_str, now);
    let (mode, report, cleaned) = recover_comment_fields(comment, freq, modes);

    let mut spot = Spot::new(dx, spotter, freq, &mode);
    spot.time = ts;
    spot.comment = cleaned;
    spot.source = SourceType::Upstream;
    spot.source_node = origin.to_string();
    if let Some(report) = report {
        spot.report = report;
        spot.has_report = true;
    }
    spot.ttl = frame.hop;
    spot.refresh_beacon_flag();
    spot.ensure_normalized();
    // Skimmer relays tag their decodes with a report; bare spots are human.
    spot.is_human = report.is_none();
    Ok(spot)
}

/// PC frames carry `02-Jan-2006`-style dates with `HHMMZ` times.
fn parse_pc_datetime(date: &str, time_str: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    if date.is_empty() || time_str.is_empty() {
        return now;
    }
    let combined = format!("{date} {time_str}");
    match NaiveDateTime::parse_from_str(&combined, "%d-%b-%Y %H%MZ") {
        Ok(naive) => Utc.from_utc_datetime(&naive),
        Err(_) => now,
    }
}

/// Recover mode and report from a PC frame's free-form comment, returning
/// the remaining comment text.
fn recover_comment_fields(
    comment: &str,
    freq: f64,
    modes: &ModeTable,
) -> (String, Option<i32>, String) {
    let cleaned_input = comment.replace(['^', '\r', '\n'], " ");
    let tokens: Vec<&str> = cleaned_input.split_whitespace().collect();

    let mut mode = String::new();
    let mut report: Option<i32> = None;
    let mut kept: Vec<&str> = Vec::with_capacity(tokens.len());

    let mut skip_next = false;
    for (i, tok) in tokens.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        let upper = tok.to_ascii_uppercase();
        if mode.is_empty() {
            if let Some(m) = match_mode_token(&upper) {
                mode = m.to_string();
                continue;
            }
        }
        if report.is_none() {
            if let Some(v) = parse_inline_db(&upper) {
                report = Some(v);
                continue;
            }
            if let Some(v) = parse_signed(tok) {
                if tokens.get(i + 1).is_some_and(|next| next.eq_ignore_ascii_case("DB")) {
                    report = Some(v);
                    skip_next = true;
                    continue;
                }
            }
        }
        kept.push(tok);
    }
    (modes.finalize(&mode, freq), report, kept.join(" "))
}

fn match_mode_token(token: &str) -> Option<&'static str> {
    match token {
        "CW" => Some("CW"),
        "RTTY" => Some("RTTY"),
        "FT8" => Some("FT8"),
        "FT4" => Some("FT4"),
        "MSK144" | "MSK" => Some("MSK144"),
        "USB" => Some("USB"),
        "LSB" => Some("LSB"),
        "SSB" => Some("SSB"),
        "AM" => Some("AM"),
        "FM" => Some("FM"),
        _ => None,
    }
}

fn parse_signed(tok: &str) -> Option<i32> {
    let tok = tok.strip_prefix('+').unwrap_or(tok);
    tok.parse().ok()
}

fn parse_inline_db(tok: &str) -> Option<i32> {
    if tok.len() < 3 {
        return None;
    }
    let num = tok.strip_suffix("DB")?;
    parse_signed(num)
}

/// Time-bounded seen-set for frame keys so a spot relayed by two peers is
/// forwarded once.
pub struct FrameDedupe {
    ttl: ChronoDuration,
    items: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FrameDedupe {
    pub fn new(ttl: ChronoDuration) -> Self {
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true the first time a key is seen inside the TTL.
    pub fn mark_seen(&self, key: &str, now: DateTime<Utc>) -> bool {
        if key.is_empty() {
            return false;
        }
        let mut items = self.items.lock().unwrap();
        items.retain(|_, at| now - *at <= self.ttl);
        if items.contains_key(key) {
            return false;
        }
        items.insert(key.to_string(), now);
        true
    }
}

/// Settings for one peer link.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer node name; also the fallback origin tag.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub callsign: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "PEER".to_string(),
            host: String::new(),
            port: 7300,
            callsign: "N0CALL".to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            buffer_size: 1000,
        }
    }
}

/// Counters owned by one peer link.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub frames: AtomicU64,
    pub spots: AtomicU64,
    pub dupes: AtomicU64,
    pub parse_drops: AtomicU64,
    pub queue_drops: AtomicU64,
}

/// Supervised peering client converting PC frames to spots.
pub struct PeerClient {
    config: PeerConfig,
    modes: Arc<ModeTable>,
    stats: Arc<PeerStats>,
}

impl PeerClient {
    pub fn new(config: PeerConfig, modes: Arc<ModeTable>) -> Self {
        Self {
            config,
            modes,
            stats: Arc::new(PeerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PeerStats> {
        self.stats.clone()
    }

    pub fn start(self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Spot> {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        tokio::spawn(self.supervise(tx, shutdown));
        rx
    }

    async fn supervise(self, tx: mpsc::Sender<Spot>, mut shutdown: watch::Receiver<bool>) {
        const INITIAL_DELAY: Duration = Duration::from_secs(5);
        const MAX_DELAY: Duration = Duration::from_secs(60);
        let dedupe = FrameDedupe::new(ChronoDuration::seconds(60));
        let mut delay = INITIAL_DELAY;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_connection(&tx, &dedupe, &mut shutdown).await {
                Ok(()) => info!(peer = %self.config.name, "peer link closed"),
                Err(e) => warn!(peer = %self.config.name, error = %e, "peer link failed"),
            }
            if *shutdown.borrow() {
                break;
            }
            info!(peer = %self.config.name, delay_secs = delay.as_secs(), "reconnecting peer link");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            delay = (delay * 2).min(MAX_DELAY);
        }
        info!(peer = %self.config.name, "peer supervisor stopped");
    }

    async fn run_connection(
        &self,
        tx: &mpsc::Sender<Spot>,
        dedupe: &FrameDedupe,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(peer = %self.config.name, %addr, "connecting peer link");
        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .context("connection timeout")?
            .context("failed to connect")?;

        stream
            .write_all(format!("{}\r\n", self.config.callsign).as_bytes())
            .await
            .context("failed to send login")?;

        let mut telnet = TelnetFilter::new();
        let mut pending = Vec::with_capacity(1024);
        let mut chunk = [0u8; 4096];
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let read = tokio::select! {
                read = timeout(self.config.read_timeout, stream.read(&mut chunk)) => read,
                _ = shutdown.changed() => continue,
            };
            let n = match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e).context("read error"),
                Err(_) => anyhow::bail!("read deadline exceeded, peer link stale"),
            };
            let (payload, replies) = telnet.feed(&chunk[..n]);
            for reply in replies {
                stream.write_all(&reply).await.context("failed to send telnet reply")?;
            }
            pending.extend_from_slice(&payload);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                self.handle_line(line.trim(), tx, dedupe);
            }
        }
    }

    fn handle_line(&self, line: &str, tx: &mpsc::Sender<Spot>, dedupe: &FrameDedupe) {
        if line.is_empty() || !line.to_ascii_uppercase().starts_with("PC") {
            return;
        }
        self.stats.frames.fetch_add(1, Relaxed);
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.parse_drops.fetch_add(1, Relaxed);
                debug!(peer = %self.config.name, error = %e, "bad PC frame");
                return;
            }
        };
        if frame.kind != "PC11" && frame.kind != "PC61" {
            return;
        }
        let now = Utc::now();
        let spot = match spot_from_frame(&frame, &self.config.name, &self.modes, now) {
            Ok(spot) => spot,
            Err(e) => {
                self.stats.parse_drops.fetch_add(1, Relaxed);
                debug!(peer = %self.config.name, error = %e, "unusable PC frame");
                return;
            }
        };
        let key = format!(
            "{}|{}|{:.1}|{}",
            spot.dx_call,
            spot.de_call,
            spot.frequency_khz,
            spot.time.timestamp()
        );
        if !dedupe.mark_seen(&key, now) {
            self.stats.dupes.fetch_add(1, Relaxed);
            return;
        }
        self.stats.spots.fetch_add(1, Relaxed);
        if tx.try_send(spot).is_err() {
            self.stats.queue_drops.fetch_add(1, Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telnet_filter_strips_and_refuses() {
        let mut filter = TelnetFilter::new();
        // IAC DO 1, then "abc", then IAC WILL 3.
        let input = [255, 253, 1, b'a', b'b', b'c', 255, 251, 3];
        let (payload, replies) = filter.feed(&input);
        assert_eq!(payload, b"abc");
        assert_eq!(replies, vec![[255, 252, 1], [255, 254, 3]]);
    }

    #[test]
    fn test_telnet_filter_escaped_iac_and_subnegotiation() {
        let mut filter = TelnetFilter::new();
        let input = [b'x', 255, 255, b'y', 255, 250, 1, 2, 3, 255, 240, b'z'];
        let (payload, replies) = filter.feed(&input);
        assert_eq!(payload, vec![b'x', 255, b'y', b'z']);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_telnet_filter_split_across_feeds() {
        let mut filter = TelnetFilter::new();
        let (payload, replies) = filter.feed(&[b'a', 255]);
        assert_eq!(payload, b"a");
        assert!(replies.is_empty());
        let (payload, replies) = filter.feed(&[253, 31, b'b']);
        assert_eq!(payload, b"b");
        assert_eq!(replies, vec![[255, 252, 31]]);
    }

    #[test]
    fn test_frame_parse_with_hop() {
        let frame = Frame::parse("PC61^14074.0^K1ABC^18-Nov-2025^2259Z^FT8 -10 dB^W3LPL^RELAY^1.2.3.4^H97^~")
            .unwrap();
        assert_eq!(frame.kind, "PC61");
        assert_eq!(frame.hop, 97);
        assert_eq!(frame.payload_fields().len(), 8);
    }

    #[test]
    fn test_pc61_to_spot() {
        let frame = Frame::parse("PC61^14074.0^K1ABC^18-Nov-2025^2259Z^FT8 -10 dB^W3LPL^RELAY^1.2.3.4^H7^~")
            .unwrap();
        let modes = ModeTable::builtin();
        let spot = spot_from_frame(&frame, "FALLBACK", &modes, Utc::now()).unwrap();
        assert_eq!(spot.dx_call, "K1ABC");
        assert_eq!(spot.de_call, "W3LPL");
        assert_eq!(spot.frequency_khz, 14074.0);
        assert_eq!(spot.mode, "FT8");
        assert_eq!(spot.report, -10);
        assert!(spot.has_report);
        assert!(!spot.is_human, "spots carrying a report are skimmer relays");
        assert_eq!(spot.source, SourceType::Upstream);
        assert_eq!(spot.source_node, "RELAY");
        assert_eq!(spot.ttl, 7);
        assert_eq!(
            spot.time,
            Utc.with_ymd_and_hms(2025, 11, 18, 22, 59, 0).unwrap()
        );
    }

    #[test]
    fn test_pc11_without_report_is_human() {
        let frame =
            Frame::parse("PC11^7005.5^EA5WU^18-Nov-2025^1830Z^up 1^G4ABC^^H5^~").unwrap();
        let modes = ModeTable::builtin();
        let spot = spot_from_frame(&frame, "FALLBACK", &modes, Utc::now()).unwrap();
        assert!(spot.is_human);
        assert!(!spot.has_report);
        assert_eq!(spot.source_node, "FALLBACK");
        assert_eq!(spot.comment, "up 1");
        assert_eq!(spot.mode, "CW", "mode recovered from the allocation table");
    }

    #[test]
    fn test_out_of_range_frequency_rejected() {
        let frame =
            Frame::parse("PC11^50.0^EA5WU^18-Nov-2025^1830Z^^G4ABC^X^H5^~").unwrap();
        let modes = ModeTable::builtin();
        assert!(matches!(
            spot_from_frame(&frame, "X", &modes, Utc::now()),
            Err(FrameError::BadFrequency { .. })
        ));
    }

    #[test]
    fn test_unsupported_frame_rejected() {
        let frame = Frame::parse("PC92^stuff^H2^~").unwrap();
        let modes = ModeTable::builtin();
        assert!(matches!(
            spot_from_frame(&frame, "X", &modes, Utc::now()),
            Err(FrameError::Unsupported(_))
        ));
    }

    #[test]
    fn test_comment_mode_report_recovery() {
        let modes = ModeTable::builtin();
        let (mode, report, cleaned) = recover_comment_fields("CW 22 dB fast", 7005.0, &modes);
        assert_eq!(mode, "CW");
        assert_eq!(report, Some(22));
        assert_eq!(cleaned, "fast");

        let (mode, report, cleaned) = recover_comment_fields("FT8 -7dB", 14074.0, &modes);
        assert_eq!(mode, "FT8");
        assert_eq!(report, Some(-7));
        assert_eq!(cleaned, "");

        let (mode, report, cleaned) = recover_comment_fields("loud here", 3750.0, &modes);
        assert_eq!(mode, "LSB");
        assert_eq!(report, None);
        assert_eq!(cleaned, "loud here");
    }

    #[test]
    fn test_frame_dedupe_ttl() {
        let dedupe = FrameDedupe::new(ChronoDuration::seconds(60));
        let t0 = Utc.with_ymd_and_hms(2025, 11, 18, 12, 0, 0).unwrap();
        assert!(dedupe.mark_seen("a", t0));
        assert!(!dedupe.mark_seen("a", t0 + ChronoDuration::seconds(30)));
        assert!(dedupe.mark_seen("a", t0 + ChronoDuration::seconds(120)));
        assert!(!dedupe.mark_seen("", t0));
    }
}
