//! Coding and session configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;
use crate::window::AckPolicy;
use crate::wire;
use crate::Error;

/// Largest accepted piece count. Bounds the per-generation matrix at
/// `N × (N + S)` bytes.
pub const MAX_PIECE_COUNT: usize = 1024;

/// Everything the coding core needs to know about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingConfig {
    // === Coding parameters ===
    /// Pieces per generation (N).
    pub piece_count: usize,

    /// Bytes per piece (S).
    pub piece_size: usize,

    /// Emit the N raw pieces before coded symbols.
    pub systematic: bool,

    /// Row kernel used by encoders and decoders.
    pub kernel: Kernel,

    // === Flow control ===
    /// Generations allowed in flight at once.
    pub window_size: usize,

    /// How acknowledgments move the window.
    pub ack_policy: AckPolicy,

    /// Rank stall time before a boost.
    #[serde(with = "duration_ms")]
    pub watchdog_timeout: Duration,

    /// Symbols requested per boost.
    pub boost_count: usize,

    /// Target overhead: each generation is sent
    /// `ceil(N · (1 + redundancy))` symbols before boosts.
    pub redundancy: f64,

    /// Symbols produced per sender tick, across all generations.
    pub produce_budget: usize,

    // === Threads and memory ===
    /// Worker threads per direction; 0 means hardware concurrency.
    pub threads: usize,

    /// Slot budget for a sender/receiver pair. Each side gets half, or a
    /// pool of this size is shared with one side per region.
    pub pool_slots: usize,

    /// Bytes per slot; must hold one framed symbol.
    pub slot_size: usize,

    /// Include the optional sequence field in symbol headers.
    pub sequence_numbers: bool,
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            piece_count: 32,
            piece_size: 1024,
            systematic: true,
            kernel: Kernel::Wide,

            window_size: 8,
            ack_policy: AckPolicy::OutOfOrder,
            watchdog_timeout: Duration::from_millis(100),
            boost_count: 4,
            redundancy: 0.25,
            produce_budget: 128,

            threads: 0,
            pool_slots: 1024,
            slot_size: 2048,
            sequence_numbers: true,
        }
    }
}

impl CodingConfig {
    /// Small generations, fast watchdog, generous overhead.
    pub fn low_latency() -> Self {
        Self {
            piece_count: 8,
            piece_size: 1200,
            window_size: 16,
            watchdog_timeout: Duration::from_millis(20),
            redundancy: 0.5,
            ..Self::default()
        }
    }

    /// Doubles every generation and boosts hard on stalls.
    pub fn high_redundancy() -> Self {
        Self {
            piece_count: 32,
            piece_size: 1200,
            redundancy: 1.0,
            boost_count: 8,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pieces(mut self, piece_count: usize, piece_size: usize) -> Self {
        self.piece_count = piece_count;
        self.piece_size = piece_size;
        self
    }

    #[must_use]
    pub fn with_systematic(mut self, systematic: bool) -> Self {
        self.systematic = systematic;
        self
    }

    #[must_use]
    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = kernel;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window_size: usize, ack_policy: AckPolicy) -> Self {
        self.window_size = window_size;
        self.ack_policy = ack_policy;
        self
    }

    #[must_use]
    pub fn with_watchdog(mut self, timeout: Duration, boost_count: usize) -> Self {
        self.watchdog_timeout = timeout;
        self.boost_count = boost_count;
        self
    }

    #[must_use]
    pub fn with_redundancy(mut self, redundancy: f64) -> Self {
        self.redundancy = redundancy;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool_slots: usize, slot_size: usize) -> Self {
        self.pool_slots = pool_slots;
        self.slot_size = slot_size;
        self
    }

    /// Bytes per generation.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.piece_count * self.piece_size
    }

    /// Framed size of one coded symbol.
    #[must_use]
    pub fn symbol_len(&self) -> usize {
        wire::symbol_len(self.piece_count, self.piece_size, self.sequence_numbers)
    }

    /// Symbols sent per generation before any boost.
    #[must_use]
    pub fn target_symbols(&self) -> usize {
        let target = (self.piece_count as f64 * (1.0 + self.redundancy.max(0.0))).ceil();
        (target as usize).max(self.piece_count)
    }

    /// Worker threads, resolving 0 to the detected hardware concurrency.
    #[must_use]
    pub fn resolved_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.piece_count == 0 || self.piece_size == 0 {
            return Err(Error::InvalidParams);
        }
        if self.piece_count > MAX_PIECE_COUNT {
            return Err(Error::InvalidParams);
        }
        if self.window_size == 0 {
            return Err(Error::InvalidParams);
        }
        if !self.redundancy.is_finite() || self.redundancy < 0.0 {
            return Err(Error::InvalidParams);
        }
        if self.pool_slots < 2 || self.pool_slots % 2 != 0 {
            return Err(Error::InvalidParams);
        }
        if self.slot_size < self.symbol_len() {
            return Err(Error::InvalidParams);
        }
        Ok(())
    }
}

/// Serde helper for `Duration` as milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CodingConfig::default();
        assert_eq!(config.piece_count, 32);
        assert_eq!(config.piece_size, 1024);
        assert_eq!(config.window_size, 8);
        assert_eq!(config.watchdog_timeout, Duration::from_millis(100));
        assert_eq!(config.kernel, Kernel::Wide);
        assert_eq!(config.ack_policy, AckPolicy::OutOfOrder);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_presets_validate() {
        assert_eq!(CodingConfig::low_latency().validate(), Ok(()));
        assert_eq!(CodingConfig::high_redundancy().validate(), Ok(()));
        assert_eq!(CodingConfig::low_latency().piece_count, 8);
        assert_eq!(CodingConfig::high_redundancy().target_symbols(), 64);
    }

    #[test]
    fn test_target_symbols() {
        let config = CodingConfig::default().with_pieces(10, 100).with_redundancy(0.25);
        assert_eq!(config.target_symbols(), 13);
        assert_eq!(config.clone().with_redundancy(0.0).target_symbols(), 10);
        assert_eq!(config.with_redundancy(0.01).target_symbols(), 11);
    }

    #[test]
    fn test_validate_rejects() {
        let base = CodingConfig::default();
        assert!(base.clone().with_pieces(0, 10).validate().is_err());
        assert!(base.clone().with_pieces(10, 0).validate().is_err());
        assert!(base.clone().with_pieces(MAX_PIECE_COUNT + 1, 1).validate().is_err());
        assert!(base.clone().with_window(0, AckPolicy::StrictFifo).validate().is_err());
        assert!(base.clone().with_pool(3, 2048).validate().is_err());
        assert!(base.clone().with_pool(0, 2048).validate().is_err());
        assert!(base.clone().with_redundancy(-0.5).validate().is_err());
        assert!(base.clone().with_redundancy(f64::NAN).validate().is_err());

        // 32 + 1024 bytes plus header does not fit in 1024.
        assert!(base.clone().with_pool(16, 1024).validate().is_err());
        let exact = base.symbol_len();
        assert!(base.with_pool(16, exact).validate().is_ok());
    }

    #[test]
    fn test_resolved_threads() {
        assert_eq!(CodingConfig::default().with_threads(3).resolved_threads(), 3);
        assert!(CodingConfig::default().with_threads(0).resolved_threads() >= 1);
    }

    #[test]
    fn test_serde_roundtrip_and_defaults() {
        let config = CodingConfig::low_latency().with_kernel(Kernel::Lane4);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"watchdog_timeout\":20"));
        assert!(json.contains("\"kernel\":\"lane4\""));
        let back: CodingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: CodingConfig =
            serde_json::from_str(r#"{"piece_count": 4, "ack_policy": "strict_fifo"}"#).unwrap();
        assert_eq!(partial.piece_count, 4);
        assert_eq!(partial.ack_policy, AckPolicy::StrictFifo);
        assert_eq!(partial.piece_size, 1024);
    }
}
