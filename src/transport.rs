//! # Datagram Transport Boundary
//!
//! Sessions move framed symbols and control messages through these traits
//! and never touch sockets directly. Anything that can send and receive whole
//! datagrams (UDP, unix datagram sockets, QUIC datagrams) can implement them
//! outside this crate.
//!
//! Two in-process implementations are provided for tests and demos:
//!
//! - [`MemoryChannel`]: a connected pair backed by crossbeam channels
//! - [`LossyChannel`]: wraps any transport and drops datagrams by a fixed
//!   pattern or a reproducible pseudo-random roll
//!
//! ```rust
//! use rlnc::transport::{DatagramRecv, DatagramSend, MemoryChannel};
//!
//! let (a, b) = MemoryChannel::pair();
//! a.send_datagram(b"ping").unwrap();
//! let mut buf = [0u8; 16];
//! let n = b.try_recv_datagram(&mut buf).unwrap().unwrap();
//! assert_eq!(&buf[..n], b"ping");
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Send one whole datagram.
pub trait DatagramSend {
    /// Returns the number of bytes sent (the whole datagram).
    fn send_datagram(&self, data: &[u8]) -> io::Result<usize>;
}

/// Receive one whole datagram.
pub trait DatagramRecv {
    /// Blocking receive. Excess bytes beyond `buf` may be discarded.
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking receive: `Ok(None)` when nothing is queued.
    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv_datagram(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Both directions.
pub trait DatagramTransport: DatagramSend + DatagramRecv {}

impl<T: DatagramSend + DatagramRecv> DatagramTransport for T {}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
}

fn copy_truncated(data: &[u8], buf: &mut [u8]) -> usize {
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    len
}

/// In-memory connected datagram pair.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl MemoryChannel {
    /// `(a, b)`: what `a` sends, `b` receives, and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = crossbeam_channel::unbounded();
        let (tx2, rx2) = crossbeam_channel::unbounded();
        (
            Self {
                sender: tx1,
                receiver: rx2,
            },
            Self {
                sender: tx2,
                receiver: rx1,
            },
        )
    }

    /// Datagrams waiting to be received on this end.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl DatagramSend for MemoryChannel {
    fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
        self.sender.send(data.to_vec()).map_err(|_| closed())?;
        Ok(data.len())
    }
}

impl DatagramRecv for MemoryChannel {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.receiver.recv().map_err(|_| closed())?;
        Ok(copy_truncated(&data, buf))
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.receiver.try_recv() {
            Ok(data) => Ok(Some(copy_truncated(&data, buf))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(closed()),
        }
    }
}

/// Loss injection wrapper.
///
/// Losses apply in both directions, each with its own counter. Dropped sends
/// report success, like a real network would.
#[derive(Debug)]
pub struct LossyChannel<T> {
    inner: T,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
    dropped: AtomicU64,
    drop_every_n: u64,
    loss_percent: u8,
    seed: u64,
}

impl<T> LossyChannel<T> {
    /// Drop datagram 0, n, 2n, ... (0 disables).
    pub fn with_pattern(inner: T, drop_every_n: u64) -> Self {
        Self::build(inner, drop_every_n, 0, 0)
    }

    /// Drop roughly `loss_percent`% of datagrams, reproducibly.
    pub fn with_random_loss(inner: T, loss_percent: u8) -> Self {
        Self::build(inner, 0, loss_percent.min(100), 0)
    }

    /// Like [`LossyChannel::with_random_loss`], with a different drop sequence
    /// per `seed`.
    pub fn with_seeded_loss(inner: T, loss_percent: u8, seed: u64) -> Self {
        Self::build(inner, 0, loss_percent.min(100), seed)
    }

    fn build(inner: T, drop_every_n: u64, loss_percent: u8, seed: u64) -> Self {
        Self {
            inner,
            send_counter: AtomicU64::new(0),
            recv_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drop_every_n,
            loss_percent,
            seed,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Datagrams discarded so far, both directions.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_drop(&self, counter: u64) -> bool {
        if self.drop_every_n > 0 && counter % self.drop_every_n == 0 {
            return true;
        }
        if self.loss_percent > 0 {
            // Fibonacci hashing of the counter; top byte as the roll.
            let hash = (counter ^ self.seed).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let roll = ((hash >> 56) as u8) % 100;
            return roll < self.loss_percent;
        }
        false
    }

    fn roll(&self, counter: &AtomicU64) -> bool {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let drop = self.should_drop(n);
        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop
    }
}

impl<T: DatagramSend> DatagramSend for LossyChannel<T> {
    fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
        if self.roll(&self.send_counter) {
            return Ok(data.len());
        }
        self.inner.send_datagram(data)
    }
}

impl<T: DatagramRecv> DatagramRecv for LossyChannel<T> {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.inner.recv_datagram(buf)?;
            if !self.roll(&self.recv_counter) {
                return Ok(n);
            }
        }
    }

    fn try_recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        while let Some(n) = self.inner.try_recv_datagram(buf)? {
            if !self.roll(&self.recv_counter) {
                return Ok(Some(n));
            }
        }
        Ok(None)
    }
}
