//! dxhub server binary: load config, wire the ingest topology, run until
//! interrupted.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dxhub::adaptive::{ActivityConfig, AdaptiveRefresher, BandActivityTracker, RefreshPolicy};
use dxhub::archive::ArchiveHandle;
use dxhub::averager::FrequencyAverager;
use dxhub::buffer::RingBuffer;
use dxhub::client::FeedClient;
use dxhub::config::Config;
use dxhub::cty::CtyDatabase;
use dxhub::dedup::{Deduplicator, SecondaryDeduper};
use dxhub::harmonics::HarmonicDetector;
use dxhub::known::KnownCallsigns;
use dxhub::metrics::{start_metrics_server, MetricsState};
use dxhub::mode::ModeTable;
use dxhub::mqtt::MqttFeedClient;
use dxhub::parser::{SpotParser, UnlicensedEvent};
use dxhub::peer::PeerClient;
use dxhub::pipeline::{self, CorrectionStage, Pipeline, PipelineStats};
use dxhub::server::BroadcastServer;
use dxhub::skew::{SkewStore, SkewTable};
use dxhub::source::{pump_into_dedup, SourceAdapter};
use dxhub::spot::Spot;
use dxhub::stats::Tracker;
use dxhub::uls::UlsIndex;

/// Real-time DX-cluster aggregation server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file. Falls back to ./dxhub.toml, then the
    /// platform config directory.
    #[arg(short, long, env = "DXHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Telnet port override.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = args.config.clone().unwrap_or_else(|| {
        let local = PathBuf::from("dxhub.toml");
        if local.exists() {
            local
        } else {
            Config::default_path().unwrap_or(local)
        }
    });
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    if let Some(port) = args.port {
        config.telnet.port = port;
    }
    info!(config = %config_path.display(), "dxhub starting");

    // Collaborators: missing data files degrade, they never abort startup.
    let cty = match &config.data.cty_file {
        Some(path) => match CtyDatabase::load(path) {
            Ok(db) => {
                info!(prefixes = db.len(), "CTY database loaded");
                Some(Arc::new(db))
            }
            Err(e) => {
                warn!(error = %e, "failed to load CTY database, continuing without");
                None
            }
        },
        None => None,
    };
    let uls = match &config.data.uls_file {
        Some(path) => match UlsIndex::load(path) {
            Ok(index) => {
                info!(calls = index.len(), "US license index loaded");
                Some(Arc::new(index))
            }
            Err(e) => {
                warn!(error = %e, "failed to load ULS index, continuing without");
                None
            }
        },
        None => None,
    };
    let skew = match &config.data.skew_file {
        Some(path) => match SkewTable::load(path) {
            Ok(table) => {
                info!(skimmers = table.len(), "skew table loaded");
                let store = SkewStore::new();
                store.replace(table);
                Some(Arc::new(store))
            }
            Err(e) => {
                warn!(error = %e, "failed to load skew table, continuing without");
                None
            }
        },
        None => None,
    };
    let known = match &config.data.known_callsigns_file {
        Some(path) => match KnownCallsigns::load(path) {
            Ok(set) => {
                info!(calls = set.len(), "known callsigns loaded");
                Some(Arc::new(set))
            }
            Err(e) => {
                warn!(error = %e, "failed to load known callsigns, continuing without");
                None
            }
        },
        None => None,
    };

    let modes = Arc::new(ModeTable::builtin());
    let tracker = Arc::new(Tracker::new());
    let buffer = Arc::new(RingBuffer::new(config.buffer.capacity));
    info!(capacity = buffer.capacity(), "ring buffer created");

    // Process-wide shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // Telnet broadcast server.
    let mut server = BroadcastServer::new(config.server_config(), Arc::clone(&buffer));
    server.start(shutdown_rx.clone()).await?;
    let server = Arc::new(server);

    // Archive queue with the bundled JSON-lines drain.
    let archive = if config.archive.enabled {
        let (handle, rx) = ArchiveHandle::new(config.archive.queue_size);
        tokio::spawn(run_archive_drain(
            config.archive.path.clone(),
            rx,
            shutdown_rx.clone(),
        ));
        Some(handle)
    } else {
        None
    };

    // Adaptive refresh scheduling.
    let activity = if config.adaptive.enabled {
        let tracker = Arc::new(BandActivityTracker::new(ActivityConfig {
            window: chrono::Duration::minutes(config.adaptive.activity_window_minutes.max(1)),
            quiet_max_per_minute: config.adaptive.quiet_max_per_minute,
            busy_min_per_minute: config.adaptive.busy_min_per_minute,
        }));
        let refresher = Arc::new(AdaptiveRefresher::new(
            RefreshPolicy {
                quiet: chrono::Duration::minutes(config.adaptive.quiet_refresh_minutes.max(1)),
                normal: chrono::Duration::minutes(config.adaptive.normal_refresh_minutes.max(1)),
                busy: chrono::Duration::minutes(config.adaptive.busy_refresh_minutes.max(1)),
                min_spots: config.adaptive.min_spots,
            },
            Utc::now(),
        ));
        Some((tracker, refresher))
    } else {
        None
    };

    // Post-dedup pipeline.
    let pipeline_stats = Arc::new(PipelineStats::default());
    let correction = config.call_correction.enabled.then(|| {
        CorrectionStage::new(
            config.correction_settings(),
            cty.clone(),
            known.clone(),
            config.invalid_action(),
        )
    });
    let harmonics = config
        .harmonics
        .enabled
        .then(|| HarmonicDetector::new(config.harmonic_settings()));
    let secondary = config
        .secondary_dedup
        .enabled
        .then(|| SecondaryDeduper::new(config.secondary_dedup.window_seconds, config.secondary_dedup.include_spotter));

    let pipeline = Pipeline {
        tracker: Arc::clone(&tracker),
        buffer: Arc::clone(&buffer),
        server: Some(Arc::clone(&server)),
        archive,
        secondary,
        correction,
        harmonics,
        averager: FrequencyAverager::new(),
        activity: activity.clone(),
        policy: config.spot_policy(),
        stats: Arc::clone(&pipeline_stats),
    };

    // The unified dedup engine all sources feed into; disabled dedup
    // becomes a counted pass-through so the topology stays identical.
    let dedup_window = if config.dedup.enabled {
        config.dedup.cluster_window_seconds
    } else {
        0
    };
    let (dedup, dedup_output) =
        Deduplicator::spawn(dedup_window, config.dedup.buffer_size, shutdown_rx.clone());
    let dedup_stats = dedup.stats();
    if config.dedup.enabled {
        info!(window_secs = dedup.window_secs(), "unified dedup enabled");
    }
    tokio::spawn(pipeline::run(dedup_output, pipeline, shutdown_rx.clone()));

    // Best-effort reporter for unlicensed-US drops.
    let (unlicensed_tx, unlicensed_rx) = mpsc::channel::<UnlicensedEvent>(256);
    tokio::spawn(run_unlicensed_reporter(unlicensed_rx, shutdown_rx.clone()));

    // Source adapters.
    let mut sources: Vec<(String, SourceAdapter)> = Vec::new();
    if config.sources.rbn.enabled {
        let parser = SpotParser::new(Arc::clone(&modes), "RBN")
            .with_unlicensed_reporter(unlicensed_tx.clone());
        let parser = attach_collaborators(parser, &cty, &uls, &skew);
        let client = FeedClient::new(config.feed_config(&config.sources.rbn, "RBN"), Arc::new(parser));
        sources.push(("RBN".to_string(), SourceAdapter::Feed(Box::new(client))));
    }
    if config.sources.rbn_digital.enabled {
        let parser = SpotParser::new(Arc::clone(&modes), "RBN-DIGITAL")
            .with_unlicensed_reporter(unlicensed_tx.clone());
        let parser = attach_collaborators(parser, &cty, &uls, &skew);
        let client = FeedClient::new(
            config.feed_config(&config.sources.rbn_digital, "RBN Digital"),
            Arc::new(parser),
        );
        sources.push(("RBN-DIGITAL".to_string(), SourceAdapter::Feed(Box::new(client))));
    }
    for upstream in &config.sources.upstreams {
        let mut parser = SpotParser::new(Arc::clone(&modes), upstream.name.clone()).minimal();
        if let Some(cty) = &cty {
            parser = parser.with_cty(Arc::clone(cty));
        }
        let client = FeedClient::new(config.upstream_feed_config(upstream), Arc::new(parser));
        sources.push((upstream.name.clone(), SourceAdapter::Feed(Box::new(client))));
    }
    for peer in &config.sources.peers {
        let client = PeerClient::new(config.peer_config(peer), Arc::clone(&modes));
        sources.push((peer.name.clone(), SourceAdapter::Peer(Box::new(client))));
    }
    if config.sources.pskreporter.enabled {
        let client = MqttFeedClient::new(config.mqtt_config(), cty.clone());
        sources.push(("PSKREPORTER".to_string(), SourceAdapter::Mqtt(Box::new(client))));
    }
    for (name, adapter) in sources {
        info!(source = %name, "starting source adapter");
        let rx = adapter.start(shutdown_rx.clone());
        tokio::spawn(pump_into_dedup(name, rx, dedup.input()));
    }

    // Adaptive refresh ticker.
    if let Some((band_tracker, refresher)) = activity {
        let correction_probe = Arc::clone(&pipeline_stats);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let now = Utc::now();
                let activity = band_tracker.busiest(now);
                refresher.maybe_refresh(activity, now, || {
                    info!(
                        ?activity,
                        emitted = correction_probe.emitted.load(std::sync::atomic::Ordering::Relaxed),
                        "quality caches refreshed"
                    );
                });
            }
        });
    }

    // Metrics endpoint.
    if config.metrics.enabled {
        let state = Arc::new(MetricsState {
            tracker: Arc::clone(&tracker),
            dedup: Some(Arc::clone(&dedup_stats)),
            broadcast: Some(server.stats()),
            pipeline: Some(Arc::clone(&pipeline_stats)),
            cty: cty.clone(),
        });
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, state).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    // Periodic stats display on the console.
    {
        let tracker = Arc::clone(&tracker);
        let dedup_stats = Arc::clone(&dedup_stats);
        let server = Arc::clone(&server);
        let buffer = Arc::clone(&buffer);
        let cty = cty.clone();
        let interval = config.stats.display_interval_seconds.max(1);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(interval));
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                println!("{}", tracker.summary());
                let (processed, duplicates, cache_size) = dedup_stats.snapshot();
                let rate = if processed > 0 {
                    duplicates as f64 / processed as f64 * 100.0
                } else {
                    0.0
                };
                println!(
                    "Dedup: processed={processed}, duplicates={duplicates} ({rate:.1}%), cache_size={cache_size}"
                );
                let (queue_drops, client_drops) = server.stats().snapshot();
                println!(
                    "Broadcast: workers={}, sessions={}, queue_drops={queue_drops}, client_drops={client_drops}",
                    server.worker_count(),
                    server.session_count(),
                );
                if let Some(cty) = &cty {
                    let m = cty.metrics();
                    println!(
                        "CTY: lookups={}, cache_hits={}, cache_entries={}, validated={}",
                        m.total_lookups, m.cache_hits, m.cache_entries, m.validated
                    );
                }
                println!(
                    "Ring buffer: entries={}, total_added={}",
                    buffer.len(),
                    buffer.total_added()
                );
                println!("---");
            }
        });
    }

    println!("dxhub is running. Connect via: telnet localhost {}", config.telnet.port);
    println!("Press Ctrl+C to stop.");

    // Wait for shutdown.
    let mut shutdown = shutdown_rx.clone();
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("shutting down");
    dedup.join().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("\nFinal statistics:\n{}", tracker.summary());
    info!("dxhub stopped");
    Ok(())
}

fn attach_collaborators(
    mut parser: SpotParser,
    cty: &Option<Arc<CtyDatabase>>,
    uls: &Option<Arc<UlsIndex>>,
    skew: &Option<Arc<SkewStore>>,
) -> SpotParser {
    if let Some(cty) = cty {
        parser = parser.with_cty(Arc::clone(cty));
    }
    if let Some(uls) = uls {
        parser = parser.with_uls(Arc::clone(uls));
    }
    if let Some(skew) = skew {
        parser = parser.with_skew(Arc::clone(skew));
    }
    parser
}

/// Drain the archive queue into a JSON-lines file. A real relational
/// archive writer replaces this drain; the enqueue side stays the same.
async fn run_archive_drain(
    path: PathBuf,
    mut rx: mpsc::Receiver<Arc<Spot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!(error = %e, "cannot create archive directory, archive disabled");
            return;
        }
    }
    let file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, path = %path.display(), "cannot open archive file, archive disabled");
            return;
        }
    };
    let mut writer = tokio::io::BufWriter::new(file);
    info!(path = %path.display(), "archive drain started");
    loop {
        let spot = tokio::select! {
            spot = rx.recv() => match spot {
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
        match serde_json::to_string(&*spot) {
            Ok(json) => {
                if writer.write_all(json.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                {
                    error!("archive write failed, stopping drain");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "unserializable spot skipped"),
        }
    }
    let _ = writer.flush().await;
    info!("archive drain stopped");
}

/// Log unlicensed-US drop events from the best-effort reporter queue.
async fn run_unlicensed_reporter(
    mut rx: mpsc::Receiver<UnlicensedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        warn!(
            source = %event.source,
            role = event.role,
            call = %event.call,
            mode = %event.mode,
            freq = event.frequency_khz,
            "dropped spot from unlicensed US station"
        );
    }
}
