//! JSON-over-MQTT feed adapter (PSKReporter-style).
//!
//! Subscribes to spot topics on an MQTT broker and converts each JSON
//! payload into a canonical spot. Payload decoding runs in a small worker
//! pool behind a bounded queue so a burst of decode cycles cannot stall the
//! broker event loop; the event loop itself reconnects with a fixed pause
//! on any broker error.

use chrono::{DateTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::callsign;
use crate::cty::CtyDatabase;
use crate::parser::{MAX_DIAL_KHZ, MIN_DIAL_KHZ};
use crate::spot::{CallMetadata, SourceType, Spot};

/// Broker and worker-pool settings.
#[derive(Debug, Clone)]
pub struct MqttFeedConfig {
    /// Source node tag ("PSKREPORTER").
    pub name: String,
    pub broker: String,
    pub port: u16,
    pub topics: Vec<String>,
    pub workers: usize,
    pub buffer_size: usize,
}

impl Default for MqttFeedConfig {
    fn default() -> Self {
        Self {
            name: "PSKREPORTER".to_string(),
            broker: "mqtt.pskreporter.info".to_string(),
            port: 1883,
            topics: vec!["pskr/filter/v2/+/+/#".to_string()],
            workers: 2,
            buffer_size: 5000,
        }
    }
}

/// Counters owned by the MQTT adapter.
#[derive(Debug, Default)]
pub struct MqttStats {
    pub messages: AtomicU64,
    pub spots: AtomicU64,
    pub parse_drops: AtomicU64,
    pub queue_drops: AtomicU64,
    pub queue_len: AtomicUsize,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frequency out of range: {0} kHz")]
    FrequencyOutOfRange(f64),

    #[error("invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("unknown country prefix: {0}")]
    UnknownCountry(String),
}

/// One spot report as published on the PSKReporter firehose. Frequencies
/// arrive in Hz, times as unix seconds; `sc`/`rc` are the sender (heard DX)
/// and receiver (spotter), `sl`/`rl` their grid locators.
#[derive(Debug, Deserialize)]
struct WirePayload {
    f: f64,
    #[serde(default)]
    md: String,
    #[serde(default)]
    rp: Option<i32>,
    #[serde(default)]
    t: Option<i64>,
    sc: String,
    rc: String,
    #[serde(default)]
    sl: Option<String>,
    #[serde(default)]
    rl: Option<String>,
}

/// Decode one JSON payload into a spot. When a CTY database is present both
/// calls must resolve (this is a skimmer source; unknown prefixes are junk
/// decodes).
pub fn payload_to_spot(
    payload: &[u8],
    cty: Option<&CtyDatabase>,
    node: &str,
    now: DateTime<Utc>,
) -> Result<Spot, PayloadError> {
    let wire: WirePayload = serde_json::from_slice(payload)?;
    let freq_khz = wire.f / 1000.0;
    if !(MIN_DIAL_KHZ..=MAX_DIAL_KHZ).contains(&freq_khz) {
        return Err(PayloadError::FrequencyOutOfRange(freq_khz));
    }
    let dx_call = callsign::normalize(&wire.sc);
    let de_call = callsign::normalize(&wire.rc);
    if !callsign::is_valid(&dx_call) {
        return Err(PayloadError::InvalidCallsign(dx_call));
    }
    if !callsign::is_valid(&de_call) {
        return Err(PayloadError::InvalidCallsign(de_call));
    }

    let mut dx_meta = CallMetadata::default();
    let mut de_meta = CallMetadata::default();
    if let Some(cty) = cty {
        dx_meta = cty
            .lookup(&dx_call)
            .map(CallMetadata::from)
            .ok_or_else(|| PayloadError::UnknownCountry(dx_call.clone()))?;
        de_meta = cty
            .lookup(&de_call)
            .map(CallMetadata::from)
            .ok_or_else(|| PayloadError::UnknownCountry(de_call.clone()))?;
    }
    if let Some(grid) = wire.sl {
        dx_meta.grid = grid.trim().to_ascii_uppercase();
    }
    if let Some(grid) = wire.rl {
        de_meta.grid = grid.trim().to_ascii_uppercase();
    }

    let mut spot = Spot::new(&dx_call, &de_call, freq_khz, &wire.md);
    spot.dx_metadata = dx_meta;
    spot.de_metadata = de_meta;
    spot.time = wire
        .t
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or(now);
    if let Some(report) = wire.rp {
        spot.report = report;
        spot.has_report = true;
    }
    spot.source = SourceType::PskReporter;
    spot.source_node = node.to_string();
    spot.refresh_beacon_flag();
    spot.ensure_normalized();
    Ok(spot)
}

/// MQTT feed client.
pub struct MqttFeedClient {
    config: MqttFeedConfig,
    cty: Option<Arc<CtyDatabase>>,
    stats: Arc<MqttStats>,
}

impl MqttFeedClient {
    pub fn new(config: MqttFeedConfig, cty: Option<Arc<CtyDatabase>>) -> Self {
        Self {
            config,
            cty,
            stats: Arc::new(MqttStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MqttStats> {
        self.stats.clone()
    }

    /// Spawn the broker event loop plus the decode worker pool and return
    /// the spot stream.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Spot> {
        let (spot_tx, spot_rx) = mpsc::channel(self.config.buffer_size.max(1));
        let (payload_tx, payload_rx) = mpsc::channel::<bytes::Bytes>(self.config.buffer_size.max(1));
        let payload_rx = Arc::new(tokio::sync::Mutex::new(payload_rx));

        for worker in 0..self.config.workers.max(1) {
            let rx = Arc::clone(&payload_rx);
            let tx = spot_tx.clone();
            let cty = self.cty.clone();
            let stats = Arc::clone(&self.stats);
            let node = self.config.name.clone();
            tokio::spawn(async move {
                loop {
                    let payload = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(payload) = payload else { break };
                    stats.queue_len.fetch_sub(1, Relaxed);
                    match payload_to_spot(&payload, cty.as_deref(), &node, Utc::now()) {
                        Ok(spot) => {
                            stats.spots.fetch_add(1, Relaxed);
                            if tx.try_send(spot).is_err() {
                                stats.queue_drops.fetch_add(1, Relaxed);
                            }
                        }
                        Err(e) => {
                            stats.parse_drops.fetch_add(1, Relaxed);
                            debug!(error = %e, "dropping undecodable MQTT payload");
                        }
                    }
                }
                debug!(worker, "MQTT decode worker stopped");
            });
        }

        tokio::spawn(run_event_loop(
            self.config,
            payload_tx,
            Arc::clone(&self.stats),
            shutdown,
        ));
        spot_rx
    }
}

async fn run_event_loop(
    config: MqttFeedConfig,
    payload_tx: mpsc::Sender<bytes::Bytes>,
    stats: Arc<MqttStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client_id = format!("dxhub-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut event_loop) = AsyncClient::new(options, 64);

    info!(broker = %config.broker, port = config.port, "MQTT event loop started");
    loop {
        let event = tokio::select! {
            event = event_loop.poll() => event,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = client.disconnect().await;
                    break;
                }
                continue;
            }
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(broker = %config.broker, "MQTT connected, subscribing");
                for topic in &config.topics {
                    if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                        warn!(topic, error = %e, "MQTT subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                stats.messages.fetch_add(1, Relaxed);
                if payload_tx.try_send(publish.payload).is_ok() {
                    stats.queue_len.fetch_add(1, Relaxed);
                } else {
                    stats.queue_drops.fetch_add(1, Relaxed);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("MQTT event loop stopped");
}
