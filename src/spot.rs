//! Data structures representing DX-cluster spots.
//!
//! This module defines the canonical spot record produced by every ingest
//! path (RBN telnet, PSKReporter MQTT, DXSpider peers, upstream human feeds)
//! and consumed by every downstream stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::callsign;

/// Where a spot entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceType {
    /// Reverse Beacon Network CW/RTTY skimmers
    Rbn,
    /// RBN digital feed, FT8 decodes
    Ft8,
    /// RBN digital feed, FT4 decodes
    Ft4,
    /// PSKReporter MQTT feed
    PskReporter,
    /// An upstream cluster node (human or relayed spots)
    Upstream,
    /// Locally entered spot
    Manual,
    /// Another cluster via DXSpider peering
    Cluster,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Rbn => write!(f, "RBN"),
            SourceType::Ft8 => write!(f, "FT8"),
            SourceType::Ft4 => write!(f, "FT4"),
            SourceType::PskReporter => write!(f, "PSKREPORTER"),
            SourceType::Upstream => write!(f, "UPSTREAM"),
            SourceType::Manual => write!(f, "MANUAL"),
            SourceType::Cluster => write!(f, "CLUSTER"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RBN" => Ok(SourceType::Rbn),
            "FT8" => Ok(SourceType::Ft8),
            "FT4" => Ok(SourceType::Ft4),
            "PSKREPORTER" | "PSKR" => Ok(SourceType::PskReporter),
            "UPSTREAM" => Ok(SourceType::Upstream),
            "MANUAL" => Ok(SourceType::Manual),
            "CLUSTER" => Ok(SourceType::Cluster),
            _ => Err(()),
        }
    }
}

/// Reports whether a source is an automated skimmer network (no human
/// judgement behind the spot).
pub fn is_skimmer_source(source: SourceType) -> bool {
    matches!(
        source,
        SourceType::Rbn | SourceType::Ft8 | SourceType::Ft4 | SourceType::PskReporter
    )
}

/// Country/zone metadata attached to each side of a spot, populated from the
/// CTY prefix database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub continent: String,
    pub country: String,
    pub cq_zone: u16,
    pub itu_zone: u16,
    pub grid: String,
    pub adif: u16,
}

/// A single observation of a DX station by a spotter.
///
/// Spots are created by source adapters, flow read-only through dedup, and
/// become mutable only inside the post-dedup pipeline where `frequency_khz`,
/// `dx_call`, and `confidence` may be rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// The station being reported (heard).
    pub dx_call: String,

    /// The station reporting (the spotter).
    pub de_call: String,

    /// Dial frequency in kHz.
    pub frequency_khz: f64,

    /// Normalized mode (CW, RTTY, FT8, FT4, MSK144, USB, LSB, ...).
    pub mode: String,

    /// Signal report in dB. Meaningful only when `has_report` is true;
    /// a report of 0 dB is a real value for some feeds.
    pub report: i32,
    pub has_report: bool,

    /// Observation time, UTC. Sources providing only HH:MM are resolved to
    /// the nearest day boundary.
    pub time: DateTime<Utc>,

    pub source: SourceType,

    /// Free-form origin tag ("RBN", "RBN-DIGITAL", a peer node name, ...).
    pub source_node: String,

    /// Remaining hop budget for spots relayed over peering links.
    pub ttl: u8,

    /// False for skimmer sources, true for human-originated spots.
    pub is_human: bool,

    /// Derived from the callsign / comment (`/B` suffix, BEACON, NCDXF).
    pub is_beacon: bool,

    pub dx_metadata: CallMetadata,
    pub de_metadata: CallMetadata,

    /// Residual comment text after structural fields were parsed out.
    pub comment: String,

    /// Single-letter consensus label assigned by the correction stage:
    /// C(orrected), B(ogus), V(erified), P(lausible), S(een-known), "?",
    /// or empty for modes the correction engine does not evaluate.
    pub confidence: String,
}

impl Spot {
    /// Create a spot with normalized calls and mode; remaining fields start
    /// at their neutral defaults.
    pub fn new(dx_call: &str, de_call: &str, frequency_khz: f64, mode: &str) -> Self {
        Self {
            dx_call: callsign::normalize(dx_call),
            de_call: callsign::normalize(de_call),
            frequency_khz,
            mode: mode.trim().to_ascii_uppercase(),
            report: 0,
            has_report: false,
            time: Utc::now(),
            source: SourceType::Manual,
            source_node: String::new(),
            ttl: 0,
            is_human: false,
            is_beacon: false,
            dx_metadata: CallMetadata::default(),
            de_metadata: CallMetadata::default(),
            comment: String::new(),
            confidence: String::new(),
        }
    }

    /// Returns the amateur band bucket for this spot's frequency, or `None`
    /// outside recognized allocations.
    pub fn band(&self) -> Option<&'static str> {
        band_for_khz(self.frequency_khz)
    }

    /// Re-derive the beacon flag from the callsign and comment.
    pub fn refresh_beacon_flag(&mut self) {
        let comment = self.comment.to_ascii_uppercase();
        self.is_beacon = self.dx_call.ends_with("/B")
            || comment.contains("BEACON")
            || comment.contains("NCDXF");
    }

    /// Idempotent normalization applied before a spot leaves its source
    /// adapter: upper-cased trimmed calls, upper-cased mode, skimmer/human
    /// flag derived from the source.
    pub fn ensure_normalized(&mut self) {
        self.dx_call = callsign::normalize(&self.dx_call);
        self.de_call = callsign::normalize(&self.de_call);
        self.mode = self.mode.trim().to_ascii_uppercase();
        self.is_human = !is_skimmer_source(self.source);
    }

    /// Render the canonical DX-cluster broadcast line (without trailing CRLF):
    /// `DX de <spotter>:  <freq>  <dxcall>  <comment>  <HHMM>Z`.
    pub fn format_dx_cluster(&self) -> String {
        let spotter = format!("{}:", collapse_ssid_for_broadcast(&self.de_call));
        let mut comment = self.comment.clone();
        if comment.len() > 30 {
            let mut cut = 30;
            while !comment.is_char_boundary(cut) {
                cut -= 1;
            }
            comment.truncate(cut);
        }
        format!(
            "DX de {:<9} {:>8.1}  {:<12} {:<30} {}Z",
            spotter,
            self.frequency_khz,
            self.dx_call,
            comment,
            self.time.format("%H%M"),
        )
    }
}

impl fmt::Display for Spot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_dx_cluster())
    }
}

/// Collapse SSID suffixes for broadcast output. Skimmer identity is kept
/// (`N2WQ-1-#` becomes `N2WQ-#`), numeric SSIDs are dropped (`N2WQ-1` becomes
/// `N2WQ`), and anything else passes through untouched.
pub fn collapse_ssid_for_broadcast(call: &str) -> String {
    if call.is_empty() || call.contains('/') {
        return call.to_string();
    }
    let (base, skimmer) = match call.strip_suffix("-#") {
        Some(base) => (base, true),
        None => (call, false),
    };
    let collapsed = match base.rsplit_once('-') {
        Some((head, ssid)) if !head.is_empty() && is_all_digits(ssid) => head,
        _ => base,
    };
    if skimmer {
        format!("{collapsed}-#")
    } else {
        collapsed.to_string()
    }
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Band bucket for a frequency in kHz.
pub fn band_for_khz(khz: f64) -> Option<&'static str> {
    match khz as u32 {
        135..=138 => Some("2200m"),
        472..=479 => Some("630m"),
        1800..=2000 => Some("160m"),
        3500..=4000 => Some("80m"),
        5330..=5410 => Some("60m"),
        7000..=7300 => Some("40m"),
        10100..=10150 => Some("30m"),
        14000..=14350 => Some("20m"),
        18068..=18168 => Some("17m"),
        21000..=21450 => Some("15m"),
        24890..=24990 => Some("12m"),
        28000..=29700 => Some("10m"),
        50000..=54000 => Some("6m"),
        144000..=148000 => Some("2m"),
        219000..=225000 => Some("1.25m"),
        420000..=450000 => Some("70cm"),
        1240000..=1300000 => Some("23cm"),
        _ => None,
    }
}
