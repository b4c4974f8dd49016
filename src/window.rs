//! Generation lifecycle and sliding window.
//!
//! A byte stream is cut into generations of `N·S` bytes. At most `size`
//! generations, `[base, head)`, are in flight at once. Acknowledgments retire
//! generations and move `base`; a watchdog turns stalled decode rank into
//! boost requests.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CodingConfig;
use crate::Error;

/// How acknowledgments move the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Only `base` may be acknowledged; anything else is rejected.
    StrictFifo,
    /// Any in-flight generation may be acknowledged. It is retired at once;
    /// `base` advances over the contiguous acknowledged prefix.
    #[default]
    OutOfOrder,
}

/// Sender-side view of one in-flight generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u32,
    pub piece_count: usize,
    pub piece_size: usize,
    /// Symbols handed to the transport.
    pub sent: u64,
    /// Highest decode rank reported by the receiver.
    pub rank: usize,
    pub boosts: u32,
    last_progress: Instant,
}

impl Generation {
    /// Time since rank last advanced (or since admission).
    pub fn stalled_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }
}

/// Watchdog request for extra symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boost {
    pub generation: u32,
    pub count: usize,
    pub rank: usize,
}

pub struct GenerationWindow {
    piece_count: usize,
    piece_size: usize,
    size: u32,
    stream_len: usize,
    total: u32,
    base: u32,
    head: u32,
    policy: AckPolicy,
    timeout: Duration,
    boost_count: usize,
    active: BTreeMap<u32, Generation>,
    acked: BTreeSet<u32>,
    boosts_issued: u64,
}

impl GenerationWindow {
    pub fn new(
        piece_count: usize,
        piece_size: usize,
        size: usize,
        stream_len: usize,
        policy: AckPolicy,
    ) -> Result<Self, Error> {
        if piece_count == 0 || piece_size == 0 || size == 0 {
            return Err(Error::InvalidParams);
        }
        let block = piece_count * piece_size;
        let total = u32::try_from(stream_len.div_ceil(block)).map_err(|_| Error::InvalidParams)?;
        let size = u32::try_from(size).map_err(|_| Error::InvalidParams)?;

        Ok(Self {
            piece_count,
            piece_size,
            size,
            stream_len,
            total,
            base: 0,
            head: 0,
            policy,
            timeout: Duration::from_millis(100),
            boost_count: 4,
            active: BTreeMap::new(),
            acked: BTreeSet::new(),
            boosts_issued: 0,
        })
    }

    pub fn from_config(config: &CodingConfig, stream_len: usize) -> Result<Self, Error> {
        Ok(Self::new(
            config.piece_count,
            config.piece_size,
            config.window_size,
            stream_len,
            config.ack_policy,
        )?
        .with_watchdog(config.watchdog_timeout, config.boost_count))
    }

    /// Stall timeout and symbols requested per boost.
    pub fn with_watchdog(mut self, timeout: Duration, boost_count: usize) -> Self {
        self.timeout = timeout;
        self.boost_count = boost_count;
        self
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of generations the stream splits into.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    pub fn in_flight(&self) -> u32 {
        self.head - self.base
    }

    pub fn boosts_issued(&self) -> u64 {
        self.boosts_issued
    }

    /// Every generation has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base == self.total
    }

    pub fn get(&self, id: u32) -> Option<&Generation> {
        self.active.get(&id)
    }

    /// Admitted, not yet retired generations in id order.
    pub fn active(&self) -> impl Iterator<Item = &Generation> {
        self.active.values()
    }

    pub fn active_ids(&self) -> Vec<u32> {
        self.active.keys().copied().collect()
    }

    /// Stream bytes carried by generation `id`. The last one may be short.
    pub fn byte_range(&self, id: u32) -> Range<usize> {
        let block = self.piece_count * self.piece_size;
        let start = (id as usize * block).min(self.stream_len);
        let end = (start + block).min(self.stream_len);
        start..end
    }

    /// Admit generations while capacity remains. Returns the newly admitted ids.
    pub fn slide(&mut self, now: Instant) -> Range<u32> {
        let first = self.head;
        while self.head - self.base < self.size && self.head < self.total {
            let id = self.head;
            self.active.insert(
                id,
                Generation {
                    id,
                    piece_count: self.piece_count,
                    piece_size: self.piece_size,
                    sent: 0,
                    rank: 0,
                    boosts: 0,
                    last_progress: now,
                },
            );
            debug!(generation = id, base = self.base, "generation admitted");
            self.head += 1;
        }
        first..self.head
    }

    /// Apply an acknowledgment.
    ///
    /// `Ok(true)` if it retired a generation, `Ok(false)` for a duplicate.
    pub fn acknowledge(&mut self, id: u32) -> Result<bool, Error> {
        if id >= self.head {
            return Err(Error::UnknownGeneration(id));
        }
        if id < self.base || self.acked.contains(&id) {
            return Ok(false);
        }

        match self.policy {
            AckPolicy::StrictFifo => {
                if id != self.base {
                    warn!(expected = self.base, got = id, "out-of-order ack rejected");
                    return Err(Error::OutOfOrderAck {
                        expected: self.base,
                        got: id,
                    });
                }
                self.active.remove(&id);
                self.base += 1;
            }
            AckPolicy::OutOfOrder => {
                self.active.remove(&id);
                self.acked.insert(id);
                while self.acked.remove(&self.base) {
                    self.base += 1;
                }
            }
        }

        debug!(generation = id, base = self.base, head = self.head, "generation acknowledged");
        Ok(true)
    }

    pub fn record_sent(&mut self, id: u32, count: u64) {
        if let Some(generation) = self.active.get_mut(&id) {
            generation.sent += count;
        }
    }

    /// Note a receiver rank report. Returns whether rank advanced.
    pub fn observe_rank(&mut self, id: u32, rank: usize, now: Instant) -> bool {
        match self.active.get_mut(&id) {
            Some(generation) if rank > generation.rank => {
                generation.rank = rank.min(generation.piece_count);
                generation.last_progress = now;
                true
            }
            _ => false,
        }
    }

    /// One boost per generation whose rank has been flat for the timeout.
    /// Issuing a boost restarts that generation's timer.
    pub fn check_watchdog(&mut self, now: Instant) -> Vec<Boost> {
        let mut boosts = Vec::new();
        for generation in self.active.values_mut() {
            if generation.rank >= generation.piece_count {
                continue;
            }
            if generation.stalled_for(now) < self.timeout {
                continue;
            }
            generation.last_progress = now;
            generation.boosts += 1;
            self.boosts_issued += 1;
            info!(
                generation = generation.id,
                rank = generation.rank,
                count = self.boost_count,
                "watchdog boost"
            );
            boosts.push(Boost {
                generation: generation.id,
                count: self.boost_count,
                rank: generation.rank,
            });
        }
        boosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(size: usize, generations: usize, policy: AckPolicy) -> GenerationWindow {
        GenerationWindow::new(4, 16, size, generations * 64, policy).unwrap()
    }

    #[test]
    fn test_total_rounds_up() {
        let w = GenerationWindow::new(4, 16, 2, 129, AckPolicy::OutOfOrder).unwrap();
        assert_eq!(w.total(), 3);
        assert_eq!(w.byte_range(0), 0..64);
        assert_eq!(w.byte_range(2), 128..129);

        let empty = GenerationWindow::new(4, 16, 2, 0, AckPolicy::OutOfOrder).unwrap();
        assert_eq!(empty.total(), 0);
        assert!(empty.is_complete());
    }

    #[test]
    fn test_slide_respects_size() {
        let now = Instant::now();
        let mut w = window(3, 10, AckPolicy::StrictFifo);
        assert_eq!(w.slide(now), 0..3);
        assert_eq!(w.slide(now), 3..3);
        assert!(w.head() - w.base() <= w.size());

        assert_eq!(w.acknowledge(0), Ok(true));
        assert_eq!(w.slide(now), 3..4);
        assert_eq!(w.in_flight(), 3);
    }

    #[test]
    fn test_slide_stops_at_total() {
        let now = Instant::now();
        let mut w = window(8, 2, AckPolicy::OutOfOrder);
        assert_eq!(w.slide(now), 0..2);
        w.acknowledge(1).unwrap();
        w.acknowledge(0).unwrap();
        assert!(w.is_complete());
        assert_eq!(w.slide(now), 2..2);
    }

    #[test]
    fn test_strict_fifo_rejects_out_of_order() {
        let now = Instant::now();
        let mut w = window(4, 4, AckPolicy::StrictFifo);
        w.slide(now);
        assert_eq!(w.acknowledge(2), Err(Error::OutOfOrderAck { expected: 0, got: 2 }));
        assert_eq!(w.acknowledge(0), Ok(true));
        assert_eq!(w.acknowledge(0), Ok(false));
        assert_eq!(w.acknowledge(1), Ok(true));
        assert_eq!(w.base(), 2);
        assert_eq!(w.acknowledge(9), Err(Error::UnknownGeneration(9)));
    }

    #[test]
    fn test_out_of_order_retires_immediately() {
        let now = Instant::now();
        let mut w = window(3, 6, AckPolicy::OutOfOrder);
        w.slide(now);

        assert_eq!(w.acknowledge(2), Ok(true));
        assert!(w.get(2).is_none());
        assert_eq!(w.base(), 0);
        assert_eq!(w.acknowledge(2), Ok(false));
        assert_eq!(w.slide(now), 3..3, "no capacity until base moves");

        assert_eq!(w.acknowledge(0), Ok(true));
        assert_eq!(w.base(), 1);
        assert_eq!(w.acknowledge(1), Ok(true));
        assert_eq!(w.base(), 3);
        assert_eq!(w.slide(now), 3..6);
        assert_eq!(w.active_ids(), vec![3, 4, 5]);
    }

    #[test]
    fn test_watchdog_one_boost_per_period() {
        let start = Instant::now();
        let timeout = Duration::from_millis(50);
        let mut w = window(2, 4, AckPolicy::OutOfOrder).with_watchdog(timeout, 6);
        w.slide(start);

        assert!(w.check_watchdog(start + Duration::from_millis(49)).is_empty());

        let t1 = start + timeout;
        let boosts = w.check_watchdog(t1);
        assert_eq!(boosts.len(), 2);
        assert_eq!(boosts[0], Boost { generation: 0, count: 6, rank: 0 });
        assert!(w.check_watchdog(t1 + Duration::from_millis(10)).is_empty());

        // Rank progress on generation 0 restarts its timer.
        assert!(w.observe_rank(0, 2, t1 + Duration::from_millis(30)));
        let boosts = w.check_watchdog(t1 + timeout);
        assert_eq!(boosts, vec![Boost { generation: 1, count: 6, rank: 0 }]);
        assert_eq!(w.boosts_issued(), 3);
        assert_eq!(w.get(1).map(|g| g.boosts), Some(2));
    }

    #[test]
    fn test_watchdog_skips_full_rank_and_retired() {
        let start = Instant::now();
        let mut w = window(2, 2, AckPolicy::OutOfOrder).with_watchdog(Duration::from_millis(10), 1);
        w.slide(start);
        w.observe_rank(0, 4, start);
        w.acknowledge(1).unwrap();
        assert!(w.check_watchdog(start + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_rank_reports_do_not_regress() {
        let now = Instant::now();
        let mut w = window(1, 1, AckPolicy::OutOfOrder);
        w.slide(now);
        assert!(w.observe_rank(0, 3, now));
        assert!(!w.observe_rank(0, 2, now));
        assert!(!w.observe_rank(7, 1, now));
        w.record_sent(0, 5);
        let g = w.get(0).unwrap();
        assert_eq!((g.rank, g.sent), (3, 5));
    }

    #[test]
    fn test_invalid_params() {
        assert!(GenerationWindow::new(0, 16, 1, 10, AckPolicy::OutOfOrder).is_err());
        assert!(GenerationWindow::new(4, 16, 0, 10, AckPolicy::OutOfOrder).is_err());
    }
}
