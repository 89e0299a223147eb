//! Configuration loading.
//!
//! All settings come from one TOML file; every section has working
//! defaults so a minimal config (or none at all) still starts a useful
//! server. Config errors are fatal at startup only; after startup the
//! config is immutable and each component receives its own settings
//! struct at construction.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::FeedConfig;
use crate::correction::{CorrectionSettings, DistanceModel};
use crate::harmonics::HarmonicSettings;
use crate::mqtt::MqttFeedConfig;
use crate::peer::PeerConfig;
use crate::pipeline::{InvalidSuggestionAction, SpotPolicy};
use crate::server::ServerConfig;

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub telnet: TelnetSection,
    pub dedup: DedupSection,
    pub secondary_dedup: SecondaryDedupSection,
    pub call_correction: CallCorrectionSection,
    pub harmonics: HarmonicsSection,
    pub spot_policy: SpotPolicySection,
    pub sources: SourcesSection,
    pub data: DataSection,
    pub archive: ArchiveSection,
    pub buffer: BufferSection,
    pub stats: StatsSection,
    pub metrics: MetricsSection,
    pub filter: FilterSection,
    pub adaptive: AdaptiveSection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelnetSection {
    pub port: u16,
    pub welcome_message: String,
    pub max_connections: usize,
    pub broadcast_workers: usize,
    pub session_queue: usize,
}

impl Default for TelnetSection {
    fn default() -> Self {
        Self {
            port: 7373,
            welcome_message: "Welcome to dxhub".to_string(),
            max_connections: 200,
            broadcast_workers: 4,
            session_queue: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupSection {
    pub enabled: bool,
    pub cluster_window_seconds: i64,
    pub buffer_size: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cluster_window_seconds: 60,
            buffer_size: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecondaryDedupSection {
    pub enabled: bool,
    pub window_seconds: i64,
    pub include_spotter: bool,
}

impl Default for SecondaryDedupSection {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 60,
            include_spotter: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallCorrectionSection {
    pub enabled: bool,
    pub min_consensus_reports: usize,
    pub min_advantage: i64,
    pub min_confidence_percent: i64,
    pub max_edit_distance: u32,
    pub recency_seconds: i64,
    /// "tag" keeps the original call labeled B; "suppress" drops the spot.
    pub invalid_action: String,
    /// "plain", "morse" (weighted CW), or "baudot" (weighted RTTY).
    pub distance_model: String,
    pub distance3_extra_advantage: i64,
    pub distance3_extra_confidence: i64,
}

impl Default for CallCorrectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_consensus_reports: 3,
            min_advantage: 1,
            min_confidence_percent: 50,
            max_edit_distance: 2,
            recency_seconds: 45,
            invalid_action: "tag".to_string(),
            distance_model: "plain".to_string(),
            distance3_extra_advantage: 0,
            distance3_extra_confidence: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarmonicsSection {
    pub enabled: bool,
    pub recency_seconds: i64,
    pub max_harmonic_multiple: u32,
    pub frequency_tolerance_hz: f64,
    pub min_report_delta: i32,
}

impl Default for HarmonicsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            recency_seconds: 120,
            max_harmonic_multiple: 4,
            frequency_tolerance_hz: 25.0,
            min_report_delta: 6,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpotPolicySection {
    /// 0 disables the age gate.
    pub max_age_seconds: i64,
    pub frequency_averaging_seconds: i64,
    pub frequency_averaging_tolerance_hz: f64,
    pub frequency_averaging_min_reports: usize,
}

impl Default for SpotPolicySection {
    fn default() -> Self {
        Self {
            max_age_seconds: 300,
            frequency_averaging_seconds: 45,
            frequency_averaging_tolerance_hz: 300.0,
            frequency_averaging_min_reports: 3,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesSection {
    pub rbn: FeedSection,
    pub rbn_digital: FeedSection,
    pub upstreams: Vec<UpstreamSection>,
    pub peers: Vec<PeerSection>,
    pub pskreporter: PskReporterSection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedSection {
    pub enabled: bool,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub callsign: String,
    pub buffer_size: usize,
    pub read_timeout_seconds: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            enabled: false,
            name: String::new(),
            host: "telnet.reversebeacon.net".to_string(),
            port: 7000,
            callsign: "N0CALL".to_string(),
            buffer_size: 1000,
            read_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamSection {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub callsign: String,
    pub buffer_size: usize,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 7300,
            callsign: "N0CALL".to_string(),
            buffer_size: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerSection {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub callsign: String,
    pub buffer_size: usize,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 7300,
            callsign: "N0CALL".to_string(),
            buffer_size: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PskReporterSection {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub topics: Vec<String>,
    pub workers: usize,
    pub buffer_size: usize,
}

impl Default for PskReporterSection {
    fn default() -> Self {
        let d = MqttFeedConfig::default();
        Self {
            enabled: false,
            broker: d.broker,
            port: d.port,
            topics: d.topics,
            workers: d.workers,
            buffer_size: d.buffer_size,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DataSection {
    pub cty_file: Option<PathBuf>,
    pub uls_file: Option<PathBuf>,
    pub skew_file: Option<PathBuf>,
    pub known_callsigns_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveSection {
    pub enabled: bool,
    pub queue_size: usize,
    /// Where the bundled JSON-lines drain writes; a real archive writer
    /// replaces the drain, not the queue.
    pub path: PathBuf,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_size: 10_000,
            path: PathBuf::from("data/archive.jsonl"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferSection {
    pub capacity: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self { capacity: 300_000 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsSection {
    pub display_interval_seconds: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            display_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSection {
    pub default_modes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveSection {
    pub enabled: bool,
    pub quiet_refresh_minutes: i64,
    pub normal_refresh_minutes: i64,
    pub busy_refresh_minutes: i64,
    pub min_spots: u64,
    pub activity_window_minutes: i64,
    pub quiet_max_per_minute: f64,
    pub busy_min_per_minute: f64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            quiet_refresh_minutes: 60,
            normal_refresh_minutes: 30,
            busy_refresh_minutes: 10,
            min_spots: 500,
            activity_window_minutes: 5,
            quiet_max_per_minute: 2.0,
            busy_min_per_minute: 30.0,
        }
    }
}

impl Config {
    /// Default config location (`~/.config/dxhub/config.toml` on Linux, the
    /// platform equivalent elsewhere).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dxhub/config.toml"))
    }

    /// Load from a TOML file. A missing file yields the defaults; a
    /// malformed file is a startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid TOML in config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.call_correction.invalid_action.to_ascii_lowercase().as_str() {
            "tag" | "suppress" => {}
            other => anyhow::bail!("call_correction.invalid_action must be tag or suppress, got {other:?}"),
        }
        match self.call_correction.distance_model.to_ascii_lowercase().as_str() {
            "plain" | "morse" | "baudot" => {}
            other => anyhow::bail!(
                "call_correction.distance_model must be plain, morse or baudot, got {other:?}"
            ),
        }
        if self.dedup.cluster_window_seconds <= 0 {
            anyhow::bail!("dedup.cluster_window_seconds must be positive");
        }
        if self.telnet.broadcast_workers == 0 {
            anyhow::bail!("telnet.broadcast_workers must be at least 1");
        }
        for upstream in &self.sources.upstreams {
            if upstream.host.is_empty() {
                anyhow::bail!("sources.upstreams entries need a host");
            }
        }
        for peer in &self.sources.peers {
            if peer.host.is_empty() {
                anyhow::bail!("sources.peers entries need a host");
            }
        }
        Ok(())
    }

    pub fn invalid_action(&self) -> InvalidSuggestionAction {
        if self.call_correction.invalid_action.eq_ignore_ascii_case("suppress") {
            InvalidSuggestionAction::Suppress
        } else {
            InvalidSuggestionAction::Tag
        }
    }

    /// The single configured model expands to per-mode models: "morse"
    /// weights CW, "baudot" weights RTTY, everything else stays plain.
    pub fn distance_models(&self) -> (DistanceModel, DistanceModel) {
        match self.call_correction.distance_model.to_ascii_lowercase().as_str() {
            "morse" => (DistanceModel::Morse, DistanceModel::Plain),
            "baudot" => (DistanceModel::Plain, DistanceModel::Baudot),
            _ => (DistanceModel::Plain, DistanceModel::Plain),
        }
    }

    pub fn correction_settings(&self) -> CorrectionSettings {
        let (cw_model, rtty_model) = self.distance_models();
        let recency = if self.call_correction.recency_seconds > 0 {
            self.call_correction.recency_seconds
        } else {
            45
        };
        CorrectionSettings {
            min_consensus_reports: self.call_correction.min_consensus_reports,
            min_advantage: self.call_correction.min_advantage,
            min_confidence_percent: self.call_correction.min_confidence_percent,
            max_edit_distance: self.call_correction.max_edit_distance,
            recency_window: ChronoDuration::seconds(recency),
            cw_model,
            rtty_model,
            distance3_extra_advantage: self.call_correction.distance3_extra_advantage,
            distance3_extra_confidence: self.call_correction.distance3_extra_confidence,
        }
    }

    pub fn harmonic_settings(&self) -> HarmonicSettings {
        HarmonicSettings {
            enabled: self.harmonics.enabled,
            recency_window: ChronoDuration::seconds(self.harmonics.recency_seconds.max(1)),
            max_harmonic_multiple: self.harmonics.max_harmonic_multiple,
            frequency_tolerance_hz: self.harmonics.frequency_tolerance_hz,
            min_report_delta: self.harmonics.min_report_delta,
        }
    }

    pub fn spot_policy(&self) -> SpotPolicy {
        let tolerance_hz = if self.spot_policy.frequency_averaging_tolerance_hz > 0.0 {
            self.spot_policy.frequency_averaging_tolerance_hz
        } else {
            300.0
        };
        let window = if self.spot_policy.frequency_averaging_seconds > 0 {
            self.spot_policy.frequency_averaging_seconds
        } else {
            45
        };
        SpotPolicy {
            max_age: (self.spot_policy.max_age_seconds > 0)
                .then(|| ChronoDuration::seconds(self.spot_policy.max_age_seconds)),
            freq_avg_window: ChronoDuration::seconds(window),
            freq_avg_tolerance_khz: tolerance_hz / 1000.0,
            freq_avg_min_reports: self.spot_policy.frequency_averaging_min_reports,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.telnet.port,
            welcome_message: self.telnet.welcome_message.clone(),
            max_connections: self.telnet.max_connections,
            broadcast_workers: self.telnet.broadcast_workers,
            default_modes: self.filter.default_modes.clone(),
            session_queue: self.telnet.session_queue,
        }
    }

    pub fn feed_config(&self, section: &FeedSection, fallback_name: &str) -> FeedConfig {
        FeedConfig {
            name: if section.name.is_empty() {
                fallback_name.to_string()
            } else {
                section.name.clone()
            },
            host: section.host.clone(),
            port: section.port,
            callsign: section.callsign.clone(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(section.read_timeout_seconds.max(1)),
            buffer_size: section.buffer_size,
        }
    }

    pub fn upstream_feed_config(&self, section: &UpstreamSection) -> FeedConfig {
        FeedConfig {
            name: section.name.clone(),
            host: section.host.clone(),
            port: section.port,
            callsign: section.callsign.clone(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            buffer_size: section.buffer_size,
        }
    }

    pub fn peer_config(&self, section: &PeerSection) -> PeerConfig {
        PeerConfig {
            name: section.name.clone(),
            host: section.host.clone(),
            port: section.port,
            callsign: section.callsign.clone(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            buffer_size: section.buffer_size,
        }
    }

    pub fn mqtt_config(&self) -> MqttFeedConfig {
        MqttFeedConfig {
            name: "PSKREPORTER".to_string(),
            broker: self.sources.pskreporter.broker.clone(),
            port: self.sources.pskreporter.port,
            topics: self.sources.pskreporter.topics.clone(),
            workers: self.sources.pskreporter.workers,
            buffer_size: self.sources.pskreporter.buffer_size,
        }
    }
}
