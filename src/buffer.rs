//! Ring buffer of recently broadcast spots.
//!
//! Backs the SHOW/DX and SHOW/STATION commands. Sized for roughly fifteen
//! minutes of traffic at full aggregate rate; old entries are overwritten
//! in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, RwLock};

use crate::spot::Spot;

/// Fixed-capacity spot history shared between the pipeline (writer) and
/// telnet sessions (readers).
pub struct RingBuffer {
    capacity: usize,
    spots: RwLock<VecDeque<Arc<Spot>>>,
    total_added: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            spots: RwLock::new(VecDeque::with_capacity(capacity)),
            total_added: AtomicU64::new(0),
        }
    }

    pub fn add(&self, spot: Arc<Spot>) {
        let mut spots = self.spots.write().unwrap();
        if spots.len() == self.capacity {
            spots.pop_front();
        }
        spots.push_back(spot);
        self.total_added.fetch_add(1, Relaxed);
    }

    /// The most recent `n` spots, newest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<Spot>> {
        let spots = self.spots.read().unwrap();
        spots.iter().rev().take(n).cloned().collect()
    }

    /// Recent spots for one DX call, newest first.
    pub fn recent_for_dx(&self, dx_call: &str, limit: usize) -> Vec<Arc<Spot>> {
        let wanted = dx_call.trim().to_ascii_uppercase();
        let spots = self.spots.read().unwrap();
        spots
            .iter()
            .rev()
            .filter(|s| s.dx_call == wanted)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.spots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total spots ever added, including overwritten ones.
    pub fn total_added(&self) -> u64 {
        self.total_added.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(dx: &str, freq: f64) -> Arc<Spot> {
        Arc::new(Spot::new(dx, "K3LR-#", freq, "CW"))
    }

    #[test]
    fn test_recent_newest_first() {
        let buf = RingBuffer::new(10);
        buf.add(spot("K1AAA", 7001.0));
        buf.add(spot("K2BBB", 7002.0));
        buf.add(spot("K3CCC", 7003.0));

        let recent = buf.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].dx_call, "K3CCC");
        assert_eq!(recent[1].dx_call, "K2BBB");
    }

    #[test]
    fn test_capacity_overwrite() {
        let buf = RingBuffer::new(2);
        buf.add(spot("K1AAA", 7001.0));
        buf.add(spot("K2BBB", 7002.0));
        buf.add(spot("K3CCC", 7003.0));

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.total_added(), 3);
        let recent = buf.recent(10);
        assert_eq!(recent[0].dx_call, "K3CCC");
        assert_eq!(recent[1].dx_call, "K2BBB");
    }

    #[test]
    fn test_recent_for_dx() {
        let buf = RingBuffer::new(10);
        buf.add(spot("K1AAA", 7001.0));
        buf.add(spot("K2BBB", 7002.0));
        buf.add(spot("K1AAA", 7003.0));

        let found = buf.recent_for_dx("k1aaa", 10);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].frequency_khz, 7003.0);
        assert!(buf.recent_for_dx("W9ZZZ", 10).is_empty());
    }
}
