//! Shared counters published by sessions and workers.
//!
//! Each field is its own `AtomicU64` with a named accessor, so any thread
//! holding an `Arc<Telemetry>` can bump or read it without locks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($name:ident => $add:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct Telemetry {
            $($name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct TelemetrySnapshot {
            $(pub $name: u64,)*
        }

        impl Telemetry {
            $(
                #[inline]
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }

                #[inline]
                pub fn $add(&self, n: u64) {
                    self.$name.fetch_add(n, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> TelemetrySnapshot {
                TelemetrySnapshot {
                    $($name: self.$name(),)*
                }
            }
        }
    };
}

counters! {
    symbols_sent => add_symbols_sent,
    symbols_received => add_symbols_received,
    dependent_symbols => add_dependent_symbols,
    generations_solved => add_generations_solved,
    boosts => add_boosts,
    pool_exhausted => add_pool_exhausted,
    malformed_packets => add_malformed_packets,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetrySnapshot {
    /// Fraction of received symbols that carried no new information.
    pub fn dependent_ratio(&self) -> f64 {
        if self.symbols_received == 0 {
            return 0.0;
        }
        self.dependent_symbols as f64 / self.symbols_received as f64
    }
}
