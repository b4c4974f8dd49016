//! RLNC - Random Linear Network Coding over GF(256)
//!
//! A byte stream is cut into generations of `N` pieces of `S` bytes. The
//! encoder emits coded symbols, each a random GF(256) combination of the
//! generation's pieces tagged with its coefficient vector. Any `N` linearly
//! independent symbols rebuild the generation, whichever ones the network
//! happens to drop.
//!
//! Layers, bottom to top:
//!
//! - [`gf`] and [`kernel`]: field arithmetic and bulk row operations
//!   (scalar, 64-bit wide with SSSE3/NEON, 32-bit lanes)
//! - [`matrix`], [`encoder`], [`decoder`]: coding core
//! - [`window`]: sliding generation window, acknowledgments and the stall
//!   watchdog
//! - [`pool`], [`arena`], [`dispatch`]: zero-copy packet slots and worker
//!   threads that own generations
//! - [`wire`], [`transport`], [`session`]: framing and the sender/receiver
//!   loops on top of any datagram transport
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use rlnc::{BlockDecoder, BlockEncoder, Kernel};
//!
//! let data = Bytes::from((0..64u8).collect::<Vec<u8>>());
//! let mut encoder = BlockEncoder::new(0, 4, 16, data.clone(), Kernel::Wide)
//!     .unwrap()
//!     .systematic(false);
//! let mut decoder = BlockDecoder::new(4, 16, Kernel::Wide).unwrap();
//!
//! while !decoder.is_solved() {
//!     let symbol = encoder.produce();
//!     decoder.ingest(&symbol.coefficients, &symbol.payload).unwrap();
//! }
//! assert_eq!(decoder.get_data().unwrap(), data);
//! ```

pub mod arena;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod encoder;
pub mod gf;
pub mod kernel;
pub mod matrix;
pub mod pool;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod window;
pub mod wire;

pub use config::CodingConfig;
pub use decoder::{BatchDecoder, BlockDecoder, DecodeState, Ingest};
pub use encoder::{BlockEncoder, CodedSymbol};
pub use gf::{Field, Gf256, FIELD};
pub use kernel::Kernel;
pub use session::{ReceiverSession, SenderSession};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use window::{AckPolicy, GenerationWindow};

/// Error type for coding, pooling and session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Zero or out-of-range sizes, counts or handles
    #[error("invalid parameters")]
    InvalidParams,
    #[error("division by zero in GF(256)")]
    DivisionByZero,
    /// No free slot in the requested pool half
    #[error("slot pool exhausted")]
    PoolExhausted,
    #[error("wrong length: expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("unknown generation {0}")]
    UnknownGeneration(u32),
    /// Strict FIFO window received an ack other than its base
    #[error("out-of-order ack: expected generation {expected}, got {got}")]
    OutOfOrderAck { expected: u32, got: u32 },
    #[error("piece arena full")]
    ArenaFull,
    /// A worker thread exited (panicked) and its inbox is closed
    #[error("worker thread gone")]
    WorkerGone,
    #[error("transport failed: {0:?}")]
    Transport(std::io::ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Transport(error.kind())
    }
}
