//! Sender and receiver loops.
//!
//! A [`SenderSession`] owns the generation window and a set of encode
//! workers. Each [`SenderSession::tick`] reads control messages, admits new
//! generations, hands the workers their produce budget, runs the watchdog and
//! flushes framed symbols to the transport.
//!
//! A [`ReceiverSession`] reads datagrams straight into RX slots, routes them
//! to decode workers by generation, reports rank progress, acknowledges
//! solved generations and hands back the stream in generation order.
//!
//! Neither session blocks: callers drive them from their own loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Receiver;
use tracing::{debug, info, trace};

use crate::config::CodingConfig;
use crate::dispatch::{
    self, DecodeCommand, DecodeContext, DecodeEvent, EncodeCommand, EncodeContext, Outbound, WorkerPool,
};
use crate::pool::{Region, SlotPool};
use crate::telemetry::Telemetry;
use crate::transport::DatagramTransport;
use crate::window::{AckPolicy, GenerationWindow};
use crate::wire::{self, ControlMessage};
use crate::Error;

/// Largest control datagram.
const CONTROL_BUF: usize = 16;

pub struct SenderSession<T> {
    config: Arc<CodingConfig>,
    stream: Bytes,
    transport: T,
    window: GenerationWindow,
    encoders: WorkerPool<EncodeCommand>,
    outbound: Receiver<Outbound>,
    telemetry: Arc<Telemetry>,
}

impl<T: DatagramTransport> SenderSession<T> {
    /// Start a sender with its own TX slots (`pool_slots / 2` of them).
    pub fn new(config: CodingConfig, stream: Bytes, transport: T) -> Result<Self, Error> {
        let pool = SlotPool::for_region(Region::Tx, config.pool_slots / 2, config.slot_size)?;
        Self::with_pool(config, stream, transport, pool)
    }

    /// Start a sender that frames into the TX region of `pool`, which a
    /// receiver in the same process may share.
    pub fn with_pool(
        config: CodingConfig,
        stream: Bytes,
        transport: T,
        pool: Arc<SlotPool>,
    ) -> Result<Self, Error> {
        config.validate()?;
        check_pool(&config, &pool, Region::Tx)?;
        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::new());
        let window = GenerationWindow::from_config(&config, stream.len())?;
        let (tx, outbound) = crossbeam_channel::unbounded();

        let threads = config.resolved_threads();
        let encoders = dispatch::spawn_encoders(
            EncodeContext {
                config: Arc::clone(&config),
                pool,
                telemetry: Arc::clone(&telemetry),
                outbound: tx,
            },
            threads,
        )?;

        info!(
            bytes = stream.len(),
            generations = window.total(),
            threads,
            piece_count = config.piece_count,
            piece_size = config.piece_size,
            "sender session started"
        );

        Ok(Self {
            config,
            stream,
            transport,
            window,
            encoders,
            outbound,
            telemetry,
        })
    }

    pub fn config(&self) -> &CodingConfig {
        &self.config
    }

    pub fn window(&self) -> &GenerationWindow {
        &self.window
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Every generation acknowledged.
    pub fn is_complete(&self) -> bool {
        self.window.is_complete()
    }

    /// One pass of the send loop.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        self.drain_control(now)?;

        for generation in self.window.slide(now) {
            let source = self.stream.slice(self.window.byte_range(generation));
            self.encoders
                .send_to(generation, EncodeCommand::Init { generation, source })?;
        }

        let active = self.window.active().count();
        if active > 0 {
            let budget = self.config.produce_budget;
            let per_generation = budget.div_ceil(active).max(1);
            for (index, limit) in dispatch::split_budget(budget, self.encoders.threads())
                .into_iter()
                .enumerate()
            {
                if limit > 0 {
                    self.encoders
                        .send_worker(index, EncodeCommand::Produce { limit, per_generation })?;
                }
            }
        }

        for boost in self.window.check_watchdog(now) {
            self.telemetry.add_boosts(1);
            self.encoders.send_to(
                boost.generation,
                EncodeCommand::Boost {
                    generation: boost.generation,
                    count: boost.count,
                },
            )?;
        }

        self.flush()
    }

    /// Send every symbol the workers have framed so far.
    pub fn flush(&mut self) -> Result<(), Error> {
        while let Ok(out) = self.outbound.try_recv() {
            self.transport.send_datagram(&out.slot)?;
            self.window.record_sent(out.generation, 1);
            self.telemetry.add_symbols_sent(1);
        }
        Ok(())
    }

    fn drain_control(&mut self, now: Instant) -> Result<(), Error> {
        let mut buf = [0u8; CONTROL_BUF];
        while let Some(len) = self.transport.try_recv_datagram(&mut buf)? {
            match ControlMessage::decode(&buf[..len]) {
                Some(ControlMessage::Ack(generation)) => match self.window.acknowledge(generation) {
                    Ok(true) => {
                        self.encoders
                            .send_to(generation, EncodeCommand::Ack { generation })?;
                    }
                    Ok(false) => trace!(generation, "duplicate ack"),
                    Err(error) => debug!(generation, %error, "ack ignored"),
                },
                Some(ControlMessage::Rank { generation, rank }) => {
                    self.window.observe_rank(generation, rank as usize, now);
                }
                None => self.telemetry.add_malformed_packets(1),
            }
        }
        Ok(())
    }

    /// Stop the encode workers.
    pub fn shutdown(self) -> Result<(), Error> {
        info!(telemetry = ?self.telemetry.snapshot(), "sender session stopped");
        self.encoders.shutdown()
    }
}

fn check_pool(config: &CodingConfig, pool: &SlotPool, region: Region) -> Result<(), Error> {
    if pool.slot_size() < config.symbol_len() || pool.region_len(region) == 0 {
        return Err(Error::InvalidParams);
    }
    Ok(())
}

pub struct ReceiverSession<T> {
    config: Arc<CodingConfig>,
    transport: T,
    pool: Arc<SlotPool>,
    decoders: WorkerPool<DecodeCommand>,
    events: Receiver<DecodeEvent>,
    telemetry: Arc<Telemetry>,
    stream_len: Option<usize>,
    /// Solved generations not yet handed out.
    ready: BTreeMap<u32, Bytes>,
    next_release: u32,
    released_bytes: usize,
    /// Strict FIFO: solved but not yet acknowledged.
    unacked: BTreeSet<u32>,
    next_ack: u32,
    /// Workers have been told to forget everything below this.
    retired_below: u32,
}

impl<T: DatagramTransport> ReceiverSession<T> {
    /// Start a receiver with its own RX slots (`pool_slots / 2` of them).
    pub fn new(config: CodingConfig, transport: T) -> Result<Self, Error> {
        let pool = SlotPool::for_region(Region::Rx, config.pool_slots / 2, config.slot_size)?;
        Self::with_pool(config, transport, pool)
    }

    /// Start a receiver that reads into the RX region of `pool`.
    pub fn with_pool(config: CodingConfig, transport: T, pool: Arc<SlotPool>) -> Result<Self, Error> {
        config.validate()?;
        check_pool(&config, &pool, Region::Rx)?;
        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::new());
        let (tx, events) = crossbeam_channel::unbounded();

        let threads = config.resolved_threads();
        let decoders = dispatch::spawn_decoders(
            DecodeContext {
                config: Arc::clone(&config),
                telemetry: Arc::clone(&telemetry),
                events: tx,
            },
            threads,
        )?;
        info!(threads, "receiver session started");

        Ok(Self {
            config,
            transport,
            pool,
            decoders,
            events,
            telemetry,
            stream_len: None,
            ready: BTreeMap::new(),
            next_release: 0,
            released_bytes: 0,
            unacked: BTreeSet::new(),
            next_ack: 0,
            retired_below: 0,
        })
    }

    /// Total stream length, if known out of band. The last generation is
    /// truncated to it and [`ReceiverSession::is_complete`] becomes usable.
    #[must_use]
    pub fn with_stream_len(mut self, len: usize) -> Self {
        self.stream_len = Some(len);
        self
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Bytes returned by [`ReceiverSession::take_ready`] so far.
    pub fn released_bytes(&self) -> usize {
        self.released_bytes
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stream_len, Some(len) if self.released_bytes >= len)
    }

    /// Receive what the transport has queued and apply decode results.
    /// Returns the number of datagrams routed to workers.
    pub fn poll(&mut self) -> Result<usize, Error> {
        let routed = self.receive()?;
        self.drain_events()?;
        if self.next_release > self.retired_below {
            self.retired_below = self.next_release;
            self.decoders.broadcast(DecodeCommand::Retire {
                below: self.retired_below,
            })?;
        }
        Ok(routed)
    }

    /// Drop decode progress for `generation`. Symbols that arrive later start
    /// it over.
    pub fn abandon(&mut self, generation: u32) -> Result<(), Error> {
        self.decoders.send_to(generation, DecodeCommand::Abandon { generation })
    }

    fn receive(&mut self) -> Result<usize, Error> {
        let mut routed = 0;
        loop {
            let mut lease = match self.pool.acquire(Region::Rx) {
                Ok(lease) => lease,
                Err(_) => {
                    // Leave the rest queued in the transport until slots free up.
                    self.telemetry.add_pool_exhausted(1);
                    break;
                }
            };
            let Some(len) = self.transport.try_recv_datagram(lease.as_mut_slice())? else {
                break;
            };
            lease.set_len(len);
            let slot = lease.freeze();

            match wire::peek_generation(&slot) {
                // Already delivered: the sender missed the ack.
                Some(generation) if generation < self.next_release => {
                    if wire::decode_symbol(&slot, self.config.piece_count, self.config.piece_size).is_some() {
                        self.telemetry.add_symbols_received(1);
                        self.telemetry.add_dependent_symbols(1);
                        self.send_ack(generation)?;
                    } else {
                        self.telemetry.add_malformed_packets(1);
                    }
                }
                Some(generation) => {
                    self.decoders.send_to(generation, DecodeCommand::Process { slot })?;
                    routed += 1;
                }
                None => self.telemetry.add_malformed_packets(1),
            }
        }
        Ok(routed)
    }

    fn drain_events(&mut self) -> Result<(), Error> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                DecodeEvent::Progress { generation, rank } => {
                    let report = ControlMessage::Rank {
                        generation,
                        rank: rank.min(u16::MAX as usize) as u16,
                    };
                    self.transport.send_datagram(&report.to_vec())?;
                }
                DecodeEvent::Solved { generation, data } => {
                    debug!(generation, "generation ready");
                    self.ready.insert(generation, data);
                    self.acknowledge(generation)?;
                }
                // The sender is still producing, so an earlier ack was lost.
                DecodeEvent::AlreadySolved { generation } => {
                    let acked = match self.config.ack_policy {
                        AckPolicy::OutOfOrder => true,
                        AckPolicy::StrictFifo => generation < self.next_ack,
                    };
                    if acked {
                        self.send_ack(generation)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn acknowledge(&mut self, generation: u32) -> Result<(), Error> {
        match self.config.ack_policy {
            AckPolicy::OutOfOrder => self.send_ack(generation),
            AckPolicy::StrictFifo => {
                self.unacked.insert(generation);
                while self.unacked.remove(&self.next_ack) {
                    self.send_ack(self.next_ack)?;
                    self.next_ack += 1;
                }
                Ok(())
            }
        }
    }

    fn send_ack(&self, generation: u32) -> Result<(), Error> {
        self.transport
            .send_datagram(&ControlMessage::Ack(generation).to_vec())?;
        Ok(())
    }

    /// Contiguous decoded bytes from the next generation on, if any.
    pub fn take_ready(&mut self) -> Option<Bytes> {
        let mut parts = Vec::new();
        while let Some(data) = self.ready.remove(&self.next_release) {
            parts.push(self.truncate(self.next_release, data));
            self.next_release += 1;
        }
        let total: usize = parts.iter().map(Bytes::len).sum();
        self.released_bytes += total;
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => {
                let mut joined = BytesMut::with_capacity(total);
                for part in parts {
                    joined.extend_from_slice(&part);
                }
                Some(joined.freeze())
            }
        }
    }

    /// Append newly contiguous bytes to `out`. Returns how many were added.
    pub fn reassemble(&mut self, out: &mut BytesMut) -> usize {
        match self.take_ready() {
            Some(bytes) => {
                out.extend_from_slice(&bytes);
                bytes.len()
            }
            None => 0,
        }
    }

    fn truncate(&self, generation: u32, data: Bytes) -> Bytes {
        let Some(len) = self.stream_len else {
            return data;
        };
        let start = generation as usize * self.config.block_size();
        let keep = len.saturating_sub(start).min(data.len());
        data.slice(..keep)
    }

    /// Stop the decode workers.
    pub fn shutdown(self) -> Result<(), Error> {
        info!(telemetry = ?self.telemetry.snapshot(), "receiver session stopped");
        self.decoders.shutdown()
    }
}
