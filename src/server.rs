//! Telnet broadcast server.
//!
//! Accepts long-lived client connections, negotiates a callsign, answers
//! inline commands (HELP, SHOW/DX, filters), and fans every surviving spot
//! out to all matching sessions in the DXSpider line format.
//!
//! Fan-out is sharded: a fixed pool of workers each owns a stable slice of
//! the session set (by callsign hash), rebuilt only when membership
//! changes. Per-session output is a bounded queue with drop-on-overflow; a
//! client that cannot keep up loses spots, never the connection.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::buffer::RingBuffer;
use crate::callsign;
use crate::filter::Filter;
use crate::spot::{SourceType, Spot};

/// Telnet server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub welcome_message: String,
    pub max_connections: usize,
    pub broadcast_workers: usize,
    /// Pre-seeded mode whitelist for new sessions (empty = allow all).
    pub default_modes: Vec<String>,
    /// Per-session output queue depth.
    pub session_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7373,
            welcome_message: "Welcome to dxhub".to_string(),
            max_connections: 200,
            broadcast_workers: 4,
            default_modes: Vec::new(),
            session_queue: 100,
        }
    }
}

/// Broadcast-path counters.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    /// Spots dropped because a worker queue was full.
    pub queue_drops: AtomicU64,
    /// Lines dropped because one session's queue was full.
    pub client_drops: AtomicU64,
}

impl BroadcastStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.queue_drops.load(Relaxed), self.client_drops.load(Relaxed))
    }
}

/// One registered session as seen by the broadcast path.
struct SessionHandle {
    callsign: String,
    out: mpsc::Sender<Arc<String>>,
    filter: Mutex<Filter>,
    drops: AtomicU64,
    closer: Notify,
}

/// Keyed session registry with an epoch counter so workers know when to
/// rebuild their shard snapshots.
struct Registry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    epoch: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Register a session under its normalized callsign. An existing
    /// session holding the callsign is closed first; new wins.
    fn register(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(old) = sessions.insert(handle.callsign.clone(), handle) {
            info!(callsign = %old.callsign, "closing older session for re-registering callsign");
            // notify_one stores a permit, so the close lands even if the
            // old session task is mid-write rather than parked on notified().
            old.closer.notify_one();
        }
        self.epoch.fetch_add(1, Relaxed);
    }

    /// Remove a session, but only if this exact handle is still the
    /// registered one (it may have been displaced by a newer login).
    fn unregister(&self, handle: &Arc<SessionHandle>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(current) = sessions.get(&handle.callsign) {
            if Arc::ptr_eq(current, handle) {
                sessions.remove(&handle.callsign);
                self.epoch.fetch_add(1, Relaxed);
            }
        }
    }

    fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Relaxed)
    }

    /// Sessions belonging to one worker shard.
    fn shard(&self, worker: usize, workers: usize) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|s| shard_of(&s.callsign, workers) == worker)
            .cloned()
            .collect()
    }
}

fn shard_of(callsign: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    callsign.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// The broadcast server.
pub struct BroadcastServer {
    config: ServerConfig,
    buffer: Arc<RingBuffer>,
    registry: Arc<Registry>,
    worker_txs: Vec<mpsc::Sender<Arc<BroadcastItem>>>,
    stats: Arc<BroadcastStats>,
    connections: Arc<AtomicUsize>,
}

struct BroadcastItem {
    spot: Arc<Spot>,
    line: Arc<String>,
}

impl BroadcastServer {
    pub fn new(config: ServerConfig, buffer: Arc<RingBuffer>) -> Self {
        Self {
            config,
            buffer,
            registry: Arc::new(Registry::new()),
            worker_txs: Vec::new(),
            stats: Arc::new(BroadcastStats::default()),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stats(&self) -> Arc<BroadcastStats> {
        self.stats.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.config.broadcast_workers.max(1)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind the listener and spawn the acceptor plus the fan-out workers.
    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("failed to bind telnet port {}", self.config.port))?;
        info!(port = self.config.port, "telnet server listening");
        self.start_with_listener(listener, shutdown);
        Ok(())
    }

    fn start_with_listener(&mut self, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        let workers = self.worker_count();
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel::<Arc<BroadcastItem>>(1000);
            self.worker_txs.push(tx);
            tokio::spawn(broadcast_worker(
                worker,
                workers,
                rx,
                Arc::clone(&self.registry),
                Arc::clone(&self.stats),
                shutdown.clone(),
            ));
        }
        let acceptor = Acceptor {
            config: self.config.clone(),
            buffer: Arc::clone(&self.buffer),
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
        };
        tokio::spawn(acceptor.run(listener, shutdown));
    }

    /// Fan a surviving spot out to every shard. The line is formatted once.
    pub fn broadcast(&self, spot: &Arc<Spot>) {
        let item = Arc::new(BroadcastItem {
            spot: Arc::clone(spot),
            line: Arc::new(format!("{}\r\n", spot.format_dx_cluster())),
        });
        for tx in &self.worker_txs {
            if tx.try_send(Arc::clone(&item)).is_err() {
                self.stats.queue_drops.fetch_add(1, Relaxed);
            }
        }
    }
}

async fn broadcast_worker(
    worker: usize,
    workers: usize,
    mut rx: mpsc::Receiver<Arc<BroadcastItem>>,
    registry: Arc<Registry>,
    stats: Arc<BroadcastStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut shard: Vec<Arc<SessionHandle>> = Vec::new();
    let mut seen_epoch = u64::MAX;
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let epoch = registry.epoch();
        if epoch != seen_epoch {
            shard = registry.shard(worker, workers);
            seen_epoch = epoch;
        }
        for session in &shard {
            let matches = session.filter.lock().unwrap().matches(&item.spot);
            if !matches {
                continue;
            }
            if session.out.try_send(Arc::clone(&item.line)).is_err() {
                session.drops.fetch_add(1, Relaxed);
                stats.client_drops.fetch_add(1, Relaxed);
            }
        }
    }
    debug!(worker, "broadcast worker stopped");
}

struct Acceptor {
    config: ServerConfig,
    buffer: Arc<RingBuffer>,
    registry: Arc<Registry>,
    connections: Arc<AtomicUsize>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%addr, "client connected");

            if self.connections.load(Relaxed) >= self.config.max_connections {
                tokio::spawn(reject_connection(stream));
                continue;
            }
            self.connections.fetch_add(1, Relaxed);

            let session = Session {
                config: self.config.clone(),
                buffer: Arc::clone(&self.buffer),
                registry: Arc::clone(&self.registry),
            };
            let connections = Arc::clone(&self.connections);
            let session_shutdown = shutdown.clone();
            tokio::spawn(async move {
                session.run(stream, session_shutdown).await;
                connections.fetch_sub(1, Relaxed);
            });
        }
        info!("telnet acceptor stopped");
    }
}

async fn reject_connection(mut stream: TcpStream) {
    let _ = stream
        .write_all(b"Sorry, the cluster is full. Please try again later.\r\n")
        .await;
    let _ = stream.shutdown().await;
}

/// Outcome of one client command.
#[derive(Debug, PartialEq)]
struct CommandOutcome {
    replies: Vec<String>,
    close: bool,
}

impl CommandOutcome {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            replies: vec![text.into()],
            close: false,
        }
    }
}

const HELP_TEXT: &[&str] = &[
    "Commands:",
    "  SHOW/DX [n]            most recent spots (default 10)",
    "  SHOW/STATION <call>    recent spots for one station",
    "  SHOW/FILTER            display your filter",
    "  FILTER <cat> <v...>    whitelist values; categories: MODE BAND",
    "                         DXCONT DECONT DXZONE DEZONE DXGRID2 DEGRID2",
    "                         SOURCE HUMAN(ON|OFF)",
    "  UNFILTER <cat> <v...>  remove whitelist values",
    "  CLEAR/FILTER           reset filter to allow-all",
    "  BYE                    disconnect",
];

/// Execute one command line against a session's filter and the spot
/// history. Pure apart from the filter mutation, so it is directly
/// testable.
fn process_command(line: &str, filter: &mut Filter, buffer: &RingBuffer) -> CommandOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return CommandOutcome {
            replies: Vec::new(),
            close: false,
        };
    }
    let mut parts = trimmed.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let args: Vec<&str> = parts.collect();

    match verb.as_str() {
        "HELP" | "?" => CommandOutcome {
            replies: HELP_TEXT.iter().map(|s| s.to_string()).collect(),
            close: false,
        },
        "BYE" | "QUIT" | "EXIT" => CommandOutcome {
            replies: vec!["73!".to_string()],
            close: true,
        },
        "SHOW/DX" | "SH/DX" => {
            let n = args
                .first()
                .and_then(|a| a.parse::<usize>().ok())
                .unwrap_or(10)
                .clamp(1, 100);
            let spots = buffer.recent(n);
            if spots.is_empty() {
                CommandOutcome::reply("No spots yet.")
            } else {
                CommandOutcome {
                    replies: spots.iter().map(|s| s.format_dx_cluster()).collect(),
                    close: false,
                }
            }
        }
        "SHOW/STATION" | "SH/STATION" => match args.first() {
            Some(call) => {
                let spots = buffer.recent_for_dx(call, 20);
                if spots.is_empty() {
                    CommandOutcome::reply(format!("No recent spots for {}.", call.to_ascii_uppercase()))
                } else {
                    CommandOutcome {
                        replies: spots.iter().map(|s| s.format_dx_cluster()).collect(),
                        close: false,
                    }
                }
            }
            None => CommandOutcome::reply("Usage: SHOW/STATION <call>"),
        },
        "SHOW/FILTER" | "SH/FILTER" => CommandOutcome {
            replies: filter.to_string().lines().map(str::to_string).collect(),
            close: false,
        },
        "CLEAR/FILTER" => {
            filter.clear();
            CommandOutcome::reply("Filter cleared.")
        }
        "FILTER" => apply_filter_edit(filter, &args, true),
        "UNFILTER" => apply_filter_edit(filter, &args, false),
        _ => CommandOutcome::reply(format!("Unknown command: {verb} (try HELP)")),
    }
}

fn apply_filter_edit(filter: &mut Filter, args: &[&str], enable: bool) -> CommandOutcome {
    let Some(category) = args.first() else {
        return CommandOutcome::reply("Usage: FILTER <category> <values...>");
    };
    let values = &args[1..];
    if values.is_empty() {
        return CommandOutcome::reply("Usage: FILTER <category> <values...>");
    }
    let category = category.to_ascii_uppercase();
    let mut unknown: Vec<String> = Vec::new();
    for value in values {
        match category.as_str() {
            "MODE" => filter.set_mode(value, enable),
            "BAND" => filter.set_band(value, enable),
            "DXCONT" => filter.set_dx_continent(value, enable),
            "DECONT" => filter.set_de_continent(value, enable),
            "DXZONE" => match value.parse::<u16>() {
                Ok(zone) => filter.set_dx_zone(zone, enable),
                Err(_) => unknown.push(format!("bad zone {value}")),
            },
            "DEZONE" => match value.parse::<u16>() {
                Ok(zone) => filter.set_de_zone(zone, enable),
                Err(_) => unknown.push(format!("bad zone {value}")),
            },
            "DXGRID2" => filter.set_dx_grid2(value, enable),
            "DEGRID2" => filter.set_de_grid2(value, enable),
            "SOURCE" => match value.parse::<SourceType>() {
                Ok(source) => filter.set_source(source, enable),
                Err(()) => unknown.push(format!("bad source {value}")),
            },
            "HUMAN" => {
                let on = value.eq_ignore_ascii_case("ON") || value.eq_ignore_ascii_case("YES");
                filter.set_require_human(enable && on);
            }
            _ => return CommandOutcome::reply(format!("Unknown filter category: {category}")),
        }
    }
    if unknown.is_empty() {
        CommandOutcome::reply("Filter updated.")
    } else {
        CommandOutcome::reply(unknown.join("; "))
    }
}

/// One client connection through its whole lifecycle:
/// Connecting -> Registering -> Active -> Closing.
struct Session {
    config: ServerConfig,
    buffer: Arc<RingBuffer>,
    registry: Arc<Registry>,
}

impl Session {
    async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let peer = stream.peer_addr().ok();
        let (mut read_half, mut write_half) = stream.into_split();

        // Connecting: banner and login prompt.
        let banner = format!("{}\r\nPlease enter your call: ", self.config.welcome_message);
        if write_half.write_all(banner.as_bytes()).await.is_err() {
            return;
        }

        // Inbound bytes are accumulated and split on newlines by hand:
        // plain read() is cancellation-safe inside select!, read_line is not.
        let mut pending: Vec<u8> = Vec::with_capacity(256);
        let mut chunk = [0u8; 1024];

        // Registering: await a valid callsign (with a login deadline).
        let callsign = loop {
            if let Some(line) = take_line(&mut pending) {
                let candidate = callsign::normalize(line.trim());
                if callsign::is_valid(&candidate) {
                    break candidate;
                }
                if write_half
                    .write_all(b"Invalid callsign.\r\nPlease enter your call: ")
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
            match timeout(Duration::from_secs(60), read_half.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(n)) => pending.extend_from_slice(&chunk[..n]),
                Err(_) => {
                    let _ = write_half.write_all(b"Login timeout.\r\n").await;
                    return;
                }
            }
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Arc<String>>(self.config.session_queue.max(1));
        let handle = Arc::new(SessionHandle {
            callsign: callsign.clone(),
            out: out_tx,
            filter: Mutex::new(Filter::with_default_modes(&self.config.default_modes)),
            drops: AtomicU64::new(0),
            closer: Notify::new(),
        });
        self.registry.register(Arc::clone(&handle));
        info!(callsign = %callsign, ?peer, "session registered");

        let _ = write_half
            .write_all(format!("Hello {callsign}, you are now connected.\r\n").as_bytes())
            .await;

        // Active: interleave broadcast output, inbound commands, and close
        // signals on one task.
        let mut close_reason = "connection closed";
        'active: loop {
            // Drain complete inbound lines before waiting again.
            while let Some(line) = take_line(&mut pending) {
                let outcome = {
                    let mut filter = handle.filter.lock().unwrap();
                    process_command(&line, &mut filter, &self.buffer)
                };
                for reply in &outcome.replies {
                    if write_half
                        .write_all(format!("{reply}\r\n").as_bytes())
                        .await
                        .is_err()
                    {
                        close_reason = "write error";
                        break 'active;
                    }
                }
                if outcome.close {
                    close_reason = "client requested close";
                    break 'active;
                }
            }
            tokio::select! {
                outgoing = out_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            if write_half.write_all(text.as_bytes()).await.is_err() {
                                close_reason = "write error";
                                break;
                            }
                        }
                        None => break,
                    }
                }
                read = read_half.read(&mut chunk) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => pending.extend_from_slice(&chunk[..n]),
                    }
                }
                _ = handle.closer.notified() => {
                    close_reason = "displaced by newer login";
                    let _ = write_half
                        .write_all(b"Disconnected: your callsign logged in elsewhere.\r\n")
                        .await;
                    break;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        close_reason = "server shutdown";
                        break;
                    }
                }
            }
        }

        // Closing.
        self.registry.unregister(&handle);
        let _ = write_half.shutdown().await;
        info!(callsign = %callsign, reason = close_reason, "session closed");
    }
}

/// Pop the first complete line (without its terminator) from the pending
/// byte buffer.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = pending.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn spot(dx: &str, freq: f64) -> Arc<Spot> {
        Arc::new(Spot::new(dx, "K3LR-#", freq, "CW"))
    }

    fn test_buffer() -> RingBuffer {
        let buf = RingBuffer::new(100);
        buf.add(spot("K1AAA", 7001.0));
        buf.add(spot("K2BBB", 14025.0));
        buf.add(spot("K1AAA", 7002.0));
        buf
    }

    #[test]
    fn test_shard_assignment_is_stable() {
        let a = shard_of("K1ABC", 4);
        assert_eq!(a, shard_of("K1ABC", 4));
        assert!(a < 4);
    }

    #[test]
    fn test_process_command_show_dx() {
        let buf = test_buffer();
        let mut filter = Filter::new();
        let outcome = process_command("SHOW/DX 2", &mut filter, &buf);
        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome.replies[0].contains("K1AAA"));
        assert!(!outcome.close);

        let outcome = process_command("sh/dx", &mut filter, &buf);
        assert_eq!(outcome.replies.len(), 3, "default count covers all stored spots");
    }

    #[test]
    fn test_process_command_show_station() {
        let buf = test_buffer();
        let mut filter = Filter::new();
        let outcome = process_command("SHOW/STATION k1aaa", &mut filter, &buf);
        assert_eq!(outcome.replies.len(), 2);

        let outcome = process_command("SHOW/STATION W9ZZZ", &mut filter, &buf);
        assert_eq!(outcome.replies.len(), 1);
        assert!(outcome.replies[0].contains("No recent spots"));
    }

    #[test]
    fn test_process_command_bye_closes() {
        let buf = RingBuffer::new(4);
        let mut filter = Filter::new();
        assert!(process_command("BYE", &mut filter, &buf).close);
        assert!(process_command("quit", &mut filter, &buf).close);
        assert!(!process_command("HELP", &mut filter, &buf).close);
    }

    #[test]
    fn test_process_command_filter_roundtrip() {
        let buf = RingBuffer::new(4);
        let mut filter = Filter::new();

        process_command("FILTER MODE CW RTTY", &mut filter, &buf);
        let mut cw = Spot::new("K1ABC", "W3LPL-#", 14025.0, "CW");
        cw.is_human = false;
        assert!(filter.matches(&cw));
        let mut usb = cw.clone();
        usb.mode = "USB".to_string();
        assert!(!filter.matches(&usb));

        process_command("UNFILTER MODE CW RTTY", &mut filter, &buf);
        assert!(filter.matches(&usb), "removing the last entries resets to ALL");

        process_command("FILTER DXZONE 14", &mut filter, &buf);
        assert!(!filter.matches(&cw), "zone filter rejects missing zone");
        process_command("CLEAR/FILTER", &mut filter, &buf);
        assert!(filter.matches(&cw));
    }

    #[test]
    fn test_process_command_filter_source_and_errors() {
        let buf = RingBuffer::new(4);
        let mut filter = Filter::new();

        let outcome = process_command("FILTER SOURCE RBN", &mut filter, &buf);
        assert_eq!(outcome.replies, vec!["Filter updated.".to_string()]);

        let outcome = process_command("FILTER SOURCE NOTASOURCE", &mut filter, &buf);
        assert!(outcome.replies[0].contains("bad source"));

        let outcome = process_command("FILTER NOPE X", &mut filter, &buf);
        assert!(outcome.replies[0].contains("Unknown filter category"));

        let outcome = process_command("FROBNICATE", &mut filter, &buf);
        assert!(outcome.replies[0].contains("Unknown command"));
    }

    #[test]
    fn test_registry_close_old_then_register() {
        let registry = Registry::new();
        let make = |q: usize| {
            let (tx, rx) = mpsc::channel(q);
            (
                Arc::new(SessionHandle {
                    callsign: "K1ABC".to_string(),
                    out: tx,
                    filter: Mutex::new(Filter::new()),
                    drops: AtomicU64::new(0),
                    closer: Notify::new(),
                }),
                rx,
            )
        };
        let (first, _rx1) = make(4);
        let (second, _rx2) = make(4);

        registry.register(Arc::clone(&first));
        assert_eq!(registry.len(), 1);
        let epoch = registry.epoch();

        registry.register(Arc::clone(&second));
        assert_eq!(registry.len(), 1, "one session per callsign");
        assert!(registry.epoch() > epoch);

        // Unregistering the displaced handle must not evict the newer one.
        registry.unregister(&first);
        assert_eq!(registry.len(), 1);
        registry.unregister(&second);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_login_broadcast_and_bye() {
        let buffer = Arc::new(test_buffer());
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        // Bind on an ephemeral port chosen by the OS.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut server = BroadcastServer::new(config, Arc::clone(&buffer));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        server.start_with_listener(listener, shutdown_rx);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"K1TST\r\n").await.unwrap();

        // Wait until the session registers, then broadcast.
        for _ in 0..100 {
            if server.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_count(), 1);

        let spot = spot("EA5WU", 14025.0);
        server.broadcast(&spot);

        let mut received = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 1024];
        while !received.contains("EA5WU") {
            let n = tokio::time::timeout_at(deadline, client.read(&mut chunk))
                .await
                .expect("broadcast within deadline")
                .unwrap();
            assert!(n > 0, "connection closed early");
            received.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
        assert!(received.contains("DX de K3LR-#:"));

        client.write_all(b"BYE\r\n").await.unwrap();
        for _ in 0..100 {
            if server.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_count(), 0);

        shutdown_tx.send(true).unwrap();
    }
}
