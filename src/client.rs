//! Supervised telnet feed client.
//!
//! Maintains one long-lived TCP connection to a line-oriented spot feed
//! (RBN CW/RTTY, RBN digital, or an upstream cluster), logging in with a
//! callsign and parsing each `DX de` line into a canonical spot. The
//! connection lives under a supervisor: read errors, stale reads, and even
//! a panicking connection task only ever schedule a reconnect with
//! exponential backoff; nothing escapes to the process.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::parser::{looks_like_spot, parse_or_log, SpotParser};
use crate::spot::Spot;

/// Reconnect backoff bounds.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Connection settings for one feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Display name ("RBN", "RBN Digital", an upstream node name).
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Callsign sent at the login prompt.
    pub callsign: String,
    pub connect_timeout: Duration,
    /// Read deadline forcing periodic liveness on the long-lived socket.
    pub read_timeout: Duration,
    /// Parsed-spot queue depth between this feed and the dedup funnel.
    pub buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            name: "RBN".to_string(),
            host: "telnet.reversebeacon.net".to_string(),
            port: 7000,
            callsign: "N0CALL".to_string(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            buffer_size: 1000,
        }
    }
}

/// Counters owned by one feed.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub lines: AtomicU64,
    pub spots: AtomicU64,
    pub parse_drops: AtomicU64,
    pub queue_drops: AtomicU64,
    pub reconnects: AtomicU64,
}

/// A supervised feed client.
pub struct FeedClient {
    config: FeedConfig,
    parser: Arc<SpotParser>,
    stats: Arc<FeedStats>,
}

impl FeedClient {
    pub fn new(config: FeedConfig, parser: Arc<SpotParser>) -> Self {
        Self {
            config,
            parser,
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    /// Spawn the supervisor and return the parsed-spot stream. The
    /// supervisor terminates when `shutdown` flips to true.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Spot> {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        tokio::spawn(self.supervise(tx, shutdown));
        rx
    }

    /// Connection supervisor: Dialing -> LoggingIn -> Connected, and back
    /// through Reconnecting (with backoff) on any failure. A panic inside
    /// the connection task is contained by its JoinHandle and treated as a
    /// reconnectable error.
    async fn supervise(self, tx: mpsc::Sender<Spot>, mut shutdown: watch::Receiver<bool>) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let conn = Connection {
                config: self.config.clone(),
                parser: Arc::clone(&self.parser),
                stats: Arc::clone(&self.stats),
                tx: tx.clone(),
                shutdown: shutdown.clone(),
            };
            let started = tokio::time::Instant::now();
            let mut handle = tokio::spawn(conn.run());
            let outcome = loop {
                tokio::select! {
                    joined = &mut handle => break Some(joined),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            handle.abort();
                            break None;
                        }
                    }
                }
            };
            let Some(outcome) = outcome else { break };
            match outcome {
                Ok(Ok(())) => info!(feed = %self.config.name, "connection closed"),
                Ok(Err(e)) => warn!(feed = %self.config.name, error = %e, "connection failed"),
                Err(join_err) if join_err.is_panic() => {
                    error!(feed = %self.config.name, "panic in connection task; scheduling reconnect");
                }
                Err(join_err) => {
                    warn!(feed = %self.config.name, error = %join_err, "connection task aborted");
                }
            }
            if *shutdown.borrow() {
                break;
            }

            // A connection that held for a while earns a fresh backoff.
            if started.elapsed() > MAX_RECONNECT_DELAY {
                delay = INITIAL_RECONNECT_DELAY;
            }
            self.stats.reconnects.fetch_add(1, Relaxed);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
            info!(feed = %self.config.name, delay_secs = delay.as_secs(), "reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay + jitter) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
        info!(feed = %self.config.name, "feed supervisor stopped");
    }
}

/// One dial-to-disconnect lifetime of the feed socket.
struct Connection {
    config: FeedConfig,
    parser: Arc<SpotParser>,
    stats: Arc<FeedStats>,
    tx: mpsc::Sender<Spot>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(feed = %self.config.name, %addr, "connecting");

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .context("connection timeout")?
            .context("failed to connect")?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        self.handle_login(&mut reader, &mut writer).await?;
        info!(feed = %self.config.name, "connected and logged in");

        let mut line_buf = String::with_capacity(256);
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            line_buf.clear();
            let read = tokio::select! {
                read = timeout(self.config.read_timeout, reader.read_line(&mut line_buf)) => read,
                _ = self.shutdown.changed() => continue,
            };
            match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => self.handle_line(line_buf.trim_end()),
                Ok(Err(e)) => return Err(e).context("read error"),
                Err(_) => anyhow::bail!("read deadline exceeded, connection stale"),
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.stats.lines.fetch_add(1, Relaxed);
        if !looks_like_spot(line) {
            debug!(feed = %self.config.name, line, "non-spot line");
            return;
        }
        let Some(spot) = parse_or_log(&self.parser, line, Utc::now()) else {
            self.stats.parse_drops.fetch_add(1, Relaxed);
            return;
        };
        self.stats.spots.fetch_add(1, Relaxed);
        if self.tx.try_send(spot).is_err() {
            self.stats.queue_drops.fetch_add(1, Relaxed);
            debug!(feed = %self.config.name, "spot channel full, dropping spot");
        }
    }

    /// Wait for the login prompt (`... call:`) byte by byte, then send the
    /// callsign. Feeds that never prompt are tolerated: a quiet timeout
    /// sends the callsign anyway.
    async fn handle_login<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncReadExt + Unpin,
        W: AsyncWriteExt + Unpin,
    {
        let mut buf = Vec::with_capacity(1024);
        let mut byte = [0u8; 1];
        loop {
            match timeout(self.config.connect_timeout, reader.read(&mut byte)).await {
                Ok(Ok(0)) => anyhow::bail!("connection closed during login"),
                Ok(Ok(_)) => {
                    buf.push(byte[0]);
                    if buf.len() >= 5 {
                        let tail = String::from_utf8_lossy(&buf[buf.len() - 5..]);
                        if tail.eq_ignore_ascii_case("call:") {
                            debug!(feed = %self.config.name, "login prompt received");
                            break;
                        }
                    }
                    if buf.len() > 4096 {
                        debug!(feed = %self.config.name, "no login prompt in banner, proceeding");
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e).context("read error during login"),
                Err(_) => {
                    debug!(feed = %self.config.name, "login prompt timeout, proceeding");
                    break;
                }
            }
        }

        info!(feed = %self.config.name, callsign = %self.config.callsign, "sending login");
        writer
            .write_all(format!("{}\r\n", self.config.callsign).as_bytes())
            .await
            .context("failed to send callsign")?;
        writer.flush().await.context("failed to flush login")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cty::{CtyDatabase, PrefixInfo};
    use crate::mode::ModeTable;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn test_parser() -> Arc<SpotParser> {
        let cty = Arc::new(CtyDatabase::from_entries(vec![
            ("EA".into(), PrefixInfo::new("Spain", "EU", 14, 37, 281)),
            ("RW".into(), PrefixInfo::new("European Russia", "EU", 16, 29, 54)),
        ]));
        Arc::new(SpotParser::new(Arc::new(ModeTable::builtin()), "RBN").with_cty(cty))
    }

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.port, 7000);
        assert_eq!(config.read_timeout, Duration::from_secs(300));
        assert!(config.buffer_size > 0);
    }

    #[tokio::test]
    async fn test_login_and_spot_streaming() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Please enter your call: ").await.unwrap();
            let mut buf = [0u8; 64];
            use tokio::io::AsyncReadExt;
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("TE5ST"));
            socket
                .write_all(
                    b"DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z\r\n",
                )
                .await
                .unwrap();
            // Hold the socket open briefly so the client can read the line.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = FeedConfig {
            name: "TEST".into(),
            host: addr.ip().to_string(),
            port: addr.port(),
            callsign: "TE5ST".into(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            buffer_size: 16,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = FeedClient::new(config, test_parser());
        let stats = client.stats();
        let mut spots = client.start(shutdown_rx);

        let spot = timeout(Duration::from_secs(5), spots.recv())
            .await
            .expect("spot within deadline")
            .expect("stream open");
        assert_eq!(spot.dx_call, "RW1M");
        assert_eq!(spot.de_call, "EA5WU-#");
        assert_eq!(stats.spots.load(Relaxed), 1);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
