//! Source adapters.
//!
//! Every upstream is one of a small closed set of adapter shapes sharing
//! the same capability set: run supervised until cancelled, emit a spot
//! stream, stop on the shutdown signal. The post-dedup pipeline treats them
//! all identically through the dedup funnel.

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::client::FeedClient;
use crate::mqtt::MqttFeedClient;
use crate::peer::PeerClient;
use crate::spot::Spot;

/// A configured upstream, ready to start.
pub enum SourceAdapter {
    /// Line-oriented telnet feed (RBN CW/RTTY, RBN digital, upstream human).
    Feed(Box<FeedClient>),
    /// JSON-over-MQTT feed.
    Mqtt(Box<MqttFeedClient>),
    /// DXSpider PC-frame peering link.
    Peer(Box<PeerClient>),
}

impl SourceAdapter {
    /// Start the adapter's supervised tasks and return its spot stream.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> mpsc::Receiver<Spot> {
        match self {
            SourceAdapter::Feed(client) => client.start(shutdown),
            SourceAdapter::Mqtt(client) => client.start(shutdown),
            SourceAdapter::Peer(client) => client.start(shutdown),
        }
    }
}

/// Forward one source's spot stream into the dedup funnel. Exits when the
/// source stream closes (its supervisor observed shutdown) or the funnel is
/// gone.
pub async fn pump_into_dedup(
    name: String,
    mut spots: mpsc::Receiver<Spot>,
    funnel: mpsc::Sender<Spot>,
) {
    while let Some(spot) = spots.recv().await {
        if funnel.send(spot).await.is_err() {
            break;
        }
    }
    info!(source = %name, "spot pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::SourceType;

    #[tokio::test]
    async fn test_pump_forwards_and_stops() {
        let (source_tx, source_rx) = mpsc::channel(8);
        let (funnel_tx, mut funnel_rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_into_dedup("TEST".into(), source_rx, funnel_tx));

        let mut spot = Spot::new("K1ABC", "W3LPL-#", 14025.0, "CW");
        spot.source = SourceType::Rbn;
        source_tx.send(spot).await.unwrap();

        let forwarded = funnel_rx.recv().await.expect("spot forwarded");
        assert_eq!(forwarded.dx_call, "K1ABC");

        drop(source_tx);
        pump.await.unwrap();
        assert!(funnel_rx.recv().await.is_none());
    }
}
