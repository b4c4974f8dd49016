//! Worker threads and the messages that drive them.
//!
//! Every generation is owned by exactly one worker, `generation % threads`,
//! so encoder and decoder state is never shared and the row kernels run
//! without locks. Workers are plain OS threads draining a crossbeam inbox;
//! they stop when the pool drops its senders.
//!
//! Packet bytes travel as [`SharedSlot`]s: encode workers frame symbols
//! straight into TX slots, decode workers parse them straight out of RX
//! slots, and only the slot handle crosses threads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::{debug, info, trace, warn};

use crate::config::CodingConfig;
use crate::decoder::{BlockDecoder, Ingest};
use crate::encoder::BlockEncoder;
use crate::pool::{Region, SharedSlot, SlotPool};
use crate::telemetry::Telemetry;
use crate::wire::{self, SymbolHeader};
use crate::Error;

/// Split `total` evenly across `workers`; the remainder goes to worker 0.
pub fn split_budget(total: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let mut shares = vec![total / workers; workers];
    shares[0] += total % workers;
    shares
}

/// Fixed set of named worker threads, one inbox each.
pub struct WorkerPool<C> {
    senders: Vec<Sender<C>>,
    handles: Vec<JoinHandle<()>>,
}

impl<C: Send + 'static> WorkerPool<C> {
    /// Start `threads` workers. `make(index)` builds each worker's handler,
    /// which then runs on its own thread for every command it receives.
    pub fn spawn<F, W>(name: &str, threads: usize, mut make: F) -> Result<Self, Error>
    where
        F: FnMut(usize) -> W,
        W: FnMut(C) + Send + 'static,
    {
        if threads == 0 {
            return Err(Error::InvalidParams);
        }
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);

        for index in 0..threads {
            let (tx, rx) = crossbeam_channel::unbounded::<C>();
            let mut handler = make(index);
            let thread_name = format!("{}-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    info!(worker = %thread_name, "worker started");
                    for command in rx.iter() {
                        handler(command);
                    }
                    info!(worker = %thread_name, "worker stopped");
                })
                .map_err(|_| Error::WorkerGone)?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self { senders, handles })
    }

    pub fn threads(&self) -> usize {
        self.senders.len()
    }

    /// Worker owning `generation`.
    #[inline]
    pub fn route(&self, generation: u32) -> usize {
        generation as usize % self.senders.len()
    }

    /// Deliver to the owner of `generation`.
    pub fn send_to(&self, generation: u32, command: C) -> Result<(), Error> {
        self.send_worker(self.route(generation), command)
    }

    /// Deliver a copy of `command` to every worker.
    pub fn broadcast(&self, command: C) -> Result<(), Error>
    where
        C: Clone,
    {
        for index in 0..self.senders.len() {
            self.send_worker(index, command.clone())?;
        }
        Ok(())
    }

    pub fn send_worker(&self, index: usize, command: C) -> Result<(), Error> {
        self.senders
            .get(index)
            .ok_or(Error::InvalidParams)?
            .send(command)
            .map_err(|_| Error::WorkerGone)
    }

    /// Close every inbox and join the threads.
    ///
    /// Workers finish whatever is already queued. Returns `WorkerGone` if any
    /// of them panicked.
    pub fn shutdown(self) -> Result<(), Error> {
        drop(self.senders);
        let mut panicked = 0;
        for handle in self.handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            warn!(panicked, "workers exited by panic");
            return Err(Error::WorkerGone);
        }
        Ok(())
    }
}

// =============================================================================
// Encode side
// =============================================================================

/// Commands for encode workers.
#[derive(Debug)]
pub enum EncodeCommand {
    /// Bind source bytes to a new encoder. `source` is shared, not copied.
    Init { generation: u32, source: Bytes },
    /// Emit up to `limit` symbols this tick, at most `per_generation` for
    /// any one generation.
    Produce { limit: usize, per_generation: usize },
    /// Allow `count` more symbols for a stalled generation.
    Boost { generation: u32, count: usize },
    /// Generation delivered; drop its encoder.
    Ack { generation: u32 },
}

/// A framed symbol ready for the transport.
#[derive(Debug)]
pub struct Outbound {
    pub generation: u32,
    pub slot: SharedSlot,
}

/// What every encode worker shares.
#[derive(Clone)]
pub struct EncodeContext {
    pub config: Arc<CodingConfig>,
    pub pool: Arc<SlotPool>,
    pub telemetry: Arc<Telemetry>,
    pub outbound: Sender<Outbound>,
}

struct EncodeState {
    encoder: BlockEncoder,
    remaining: usize,
}

/// Per-thread encoder set.
pub struct EncodeWorker {
    ctx: EncodeContext,
    target: usize,
    generations: BTreeMap<u32, EncodeState>,
    rotation: usize,
}

impl EncodeWorker {
    pub fn new(ctx: EncodeContext) -> Self {
        let target = ctx.config.target_symbols();
        Self {
            ctx,
            target,
            generations: BTreeMap::new(),
            rotation: 0,
        }
    }

    /// Generations currently owned.
    pub fn active(&self) -> usize {
        self.generations.len()
    }

    pub fn handle(&mut self, command: EncodeCommand) {
        match command {
            EncodeCommand::Init { generation, source } => self.init(generation, source),
            EncodeCommand::Produce { limit, per_generation } => self.produce(limit, per_generation),
            EncodeCommand::Boost { generation, count } => {
                if let Some(state) = self.generations.get_mut(&generation) {
                    state.remaining += count;
                }
            }
            EncodeCommand::Ack { generation } => {
                if self.generations.remove(&generation).is_some() {
                    trace!(generation, "encoder retired");
                }
            }
        }
    }

    fn init(&mut self, generation: u32, source: Bytes) {
        let config = &self.ctx.config;
        match BlockEncoder::new(generation, config.piece_count, config.piece_size, source, config.kernel) {
            Ok(encoder) => {
                let encoder = encoder.systematic(config.systematic);
                self.generations.insert(
                    generation,
                    EncodeState {
                        encoder,
                        remaining: self.target,
                    },
                );
            }
            Err(error) => warn!(generation, %error, "encoder init rejected"),
        }
    }

    fn produce(&mut self, limit: usize, per_generation: usize) {
        if self.generations.is_empty() || limit == 0 {
            return;
        }
        let ids: Vec<u32> = self.generations.keys().copied().collect();
        let start = self.rotation % ids.len();
        self.rotation = self.rotation.wrapping_add(1);

        let mut budget = limit;
        for &id in ids[start..].iter().chain(&ids[..start]) {
            if budget == 0 {
                break;
            }
            let Some(state) = self.generations.get_mut(&id) else {
                continue;
            };
            let quota = per_generation.min(state.remaining).min(budget);
            for _ in 0..quota {
                match emit(&self.ctx, id, &mut state.encoder) {
                    Ok(()) => {
                        state.remaining -= 1;
                        budget -= 1;
                    }
                    // Nothing else can be framed this tick; retry on the next.
                    Err(_) => return,
                }
            }
        }
    }
}

/// Frame the next symbol of `encoder` into a TX slot and queue it.
fn emit(ctx: &EncodeContext, generation: u32, encoder: &mut BlockEncoder) -> Result<(), Error> {
    let mut lease = match ctx.pool.acquire(Region::Tx) {
        Ok(lease) => lease,
        Err(error) => {
            ctx.telemetry.add_pool_exhausted(1);
            return Err(error);
        }
    };

    let mut header = SymbolHeader::new(generation).with_systematic(encoder.in_systematic_phase());
    if ctx.config.sequence_numbers {
        header = header.with_sequence(encoder.produced() as u32);
    }
    let (n, s) = (encoder.piece_count(), encoder.piece_size());
    let (len, coefficients, payload) =
        wire::frame_in_place(lease.as_mut_slice(), &header, n, s).ok_or(Error::InvalidParams)?;
    encoder.produce_into(coefficients, payload)?;
    lease.set_len(len);

    ctx.outbound
        .send(Outbound {
            generation,
            slot: lease.freeze(),
        })
        .map_err(|_| Error::WorkerGone)
}

pub fn spawn_encoders(ctx: EncodeContext, threads: usize) -> Result<WorkerPool<EncodeCommand>, Error> {
    WorkerPool::spawn("rlnc-enc", threads, |_| {
        let mut worker = EncodeWorker::new(ctx.clone());
        move |command| worker.handle(command)
    })
}

// =============================================================================
// Decode side
// =============================================================================

/// Commands for decode workers.
#[derive(Debug, Clone)]
pub enum DecodeCommand {
    /// Parse and ingest one received datagram; the slot is released after.
    Process { slot: SharedSlot },
    /// Forget every generation below `below`, solved or not.
    Retire { below: u32 },
    /// Drop the decode progress of one generation. Later symbols start it
    /// over from rank 0.
    Abandon { generation: u32 },
}

/// Decode worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A symbol raised the rank of `generation`.
    Progress { generation: u32, rank: usize },
    /// `generation` decoded; `data` is its full `N·S` block.
    Solved { generation: u32, data: Bytes },
    /// A symbol arrived for a generation this worker already solved.
    AlreadySolved { generation: u32 },
}

#[derive(Clone)]
pub struct DecodeContext {
    pub config: Arc<CodingConfig>,
    pub telemetry: Arc<Telemetry>,
    pub events: Sender<DecodeEvent>,
}

/// Per-thread decoder set.
pub struct DecodeWorker {
    ctx: DecodeContext,
    decoders: HashMap<u32, BlockDecoder>,
    spare: Vec<BlockDecoder>,
    solved: BTreeSet<u32>,
}

impl DecodeWorker {
    pub fn new(ctx: DecodeContext) -> Self {
        Self {
            ctx,
            decoders: HashMap::new(),
            spare: Vec::new(),
            solved: BTreeSet::new(),
        }
    }

    pub fn handle(&mut self, command: DecodeCommand) {
        match command {
            DecodeCommand::Process { slot } => {
                if let Some(event) = self.process(&slot) {
                    // Receiver gone means the session is shutting down.
                    let _ = self.ctx.events.send(event);
                }
                drop(slot);
            }
            DecodeCommand::Retire { below } => {
                self.solved = self.solved.split_off(&below);
                let stale: Vec<u32> = self.decoders.keys().copied().filter(|&id| id < below).collect();
                for generation in stale {
                    if let Some(decoder) = self.decoders.remove(&generation) {
                        self.recycle(decoder);
                    }
                }
                trace!(below, live = self.decoders.len(), "generations retired");
            }
            DecodeCommand::Abandon { generation } => {
                self.solved.remove(&generation);
                if let Some(decoder) = self.decoders.remove(&generation) {
                    debug!(generation, rank = decoder.rank(), "generation abandoned");
                    self.recycle(decoder);
                }
            }
        }
    }

    /// Keep at most a window's worth of reset decoders for reuse.
    fn recycle(&mut self, mut decoder: BlockDecoder) {
        if self.spare.len() < self.ctx.config.window_size {
            decoder.reset();
            self.spare.push(decoder);
        }
    }

    fn decoder_for(&mut self, generation: u32) -> Result<&mut BlockDecoder, Error> {
        if !self.decoders.contains_key(&generation) {
            let decoder = match self.spare.pop() {
                Some(decoder) => decoder,
                None => {
                    let config = &self.ctx.config;
                    BlockDecoder::new(config.piece_count, config.piece_size, config.kernel)?
                }
            };
            self.decoders.insert(generation, decoder);
        }
        self.decoders.get_mut(&generation).ok_or(Error::UnknownGeneration(generation))
    }

    fn process(&mut self, bytes: &[u8]) -> Option<DecodeEvent> {
        let (n, s) = (self.ctx.config.piece_count, self.ctx.config.piece_size);
        let Some(view) = wire::decode_symbol(bytes, n, s) else {
            self.ctx.telemetry.add_malformed_packets(1);
            return None;
        };
        let generation = view.header.generation;
        let telemetry = Arc::clone(&self.ctx.telemetry);
        telemetry.add_symbols_received(1);

        if self.solved.contains(&generation) {
            telemetry.add_dependent_symbols(1);
            return Some(DecodeEvent::AlreadySolved { generation });
        }

        let decoder = match self.decoder_for(generation) {
            Ok(decoder) => decoder,
            Err(error) => {
                warn!(generation, %error, "no decoder available");
                return None;
            }
        };
        match decoder.ingest(view.coefficients, view.payload) {
            Ok(Ingest::Innovative { rank }) => Some(DecodeEvent::Progress { generation, rank }),
            Ok(Ingest::Redundant) => {
                telemetry.add_dependent_symbols(1);
                None
            }
            Ok(Ingest::Solved) => {
                let data = decoder.get_data().map(Bytes::from).unwrap_or_default();
                if let Some(finished) = self.decoders.remove(&generation) {
                    self.recycle(finished);
                }
                self.solved.insert(generation);
                telemetry.add_generations_solved(1);
                debug!(generation, "generation decoded");
                Some(DecodeEvent::Solved { generation, data })
            }
            Err(error) => {
                warn!(generation, %error, "symbol rejected");
                None
            }
        }
    }
}

pub fn spawn_decoders(ctx: DecodeContext, threads: usize) -> Result<WorkerPool<DecodeCommand>, Error> {
    WorkerPool::spawn("rlnc-dec", threads, |_| {
        let mut worker = DecodeWorker::new(ctx.clone());
        move |command| worker.handle(command)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_symbol;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(n: usize, s: usize) -> Arc<CodingConfig> {
        Arc::new(
            CodingConfig::default()
                .with_pieces(n, s)
                .with_redundancy(0.5)
                .with_pool(64, 256),
        )
    }

    fn block(generation: u32, len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i as u32 * 13 + generation * 101) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_split_budget() {
        assert_eq!(split_budget(10, 3), vec![4, 3, 3]);
        assert_eq!(split_budget(9, 3), vec![3, 3, 3]);
        assert_eq!(split_budget(2, 4), vec![2, 0, 0, 0]);
        assert!(split_budget(5, 0).is_empty());
        for (total, k) in [(0, 1), (127, 8), (1000, 7)] {
            let shares = split_budget(total, k);
            assert_eq!(shares.iter().sum::<usize>(), total);
            let extra = shares.iter().filter(|&&v| v != total / k).count();
            assert!(extra <= 1);
        }
    }

    #[test]
    fn test_routing_is_modulo() {
        let pool: WorkerPool<u32> = WorkerPool::spawn("route", 3, |_| |_cmd: u32| {}).unwrap();
        assert_eq!(pool.route(0), 0);
        assert_eq!(pool.route(4), 1);
        assert_eq!(pool.route(8), 2);
        assert_eq!(pool.send_worker(3, 1), Err(Error::InvalidParams));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_generation_stays_on_one_thread() {
        let seen: Arc<std::sync::Mutex<HashMap<u32, String>>> = Arc::default();
        let pool = WorkerPool::spawn("owner", 4, |_| {
            let seen = Arc::clone(&seen);
            move |generation: u32| {
                let name = thread::current().name().unwrap_or_default().to_string();
                let mut map = seen.lock().unwrap();
                let owner = map.entry(generation).or_insert_with(|| name.clone());
                assert_eq!(*owner, name);
            }
        })
        .unwrap();
        for round in 0..50u32 {
            pool.send_to(round % 10, round % 10).unwrap();
        }
        pool.shutdown().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_panicking_worker_is_isolated() {
        let handled = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::spawn("fragile", 2, |index| {
            let handled = Arc::clone(&handled);
            move |_: ()| {
                if index == 1 {
                    panic!("worker {} failed", index);
                }
                handled.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        pool.send_worker(1, ()).unwrap();
        for _ in 0..5 {
            pool.send_to(0, ()).unwrap();
        }
        assert_eq!(pool.shutdown(), Err(Error::WorkerGone));
        assert_eq!(handled.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_encode_workers_produce_decodable_symbols() {
        let (n, s) = (4, 32);
        let config = config(n, s);
        let slots = SlotPool::new(config.pool_slots, config.slot_size).unwrap();
        let telemetry = Arc::new(Telemetry::new());
        let (out_tx, out_rx) = unbounded();
        let ctx = EncodeContext {
            config: Arc::clone(&config),
            pool: Arc::clone(&slots),
            telemetry: Arc::clone(&telemetry),
            outbound: out_tx,
        };

        let workers = spawn_encoders(ctx, 2).unwrap();
        for generation in 0..3u32 {
            workers
                .send_to(generation, EncodeCommand::Init { generation, source: block(generation, n * s) })
                .unwrap();
        }
        for (index, limit) in split_budget(100, 2).into_iter().enumerate() {
            workers
                .send_worker(index, EncodeCommand::Produce { limit, per_generation: 100 })
                .unwrap();
        }
        workers.shutdown().unwrap();

        let mut decoders: HashMap<u32, BlockDecoder> = HashMap::new();
        let mut per_generation: HashMap<u32, usize> = HashMap::new();
        for out in out_rx.try_iter() {
            let view = wire::decode_symbol(&out.slot, n, s).unwrap();
            assert_eq!(view.header.generation, out.generation);
            *per_generation.entry(out.generation).or_default() += 1;
            decoders
                .entry(out.generation)
                .or_insert_with(|| BlockDecoder::new(n, s, config.kernel).unwrap())
                .ingest(view.coefficients, view.payload)
                .unwrap();
        }

        // target = ceil(4 * 1.5) = 6 symbols per generation
        for generation in 0..3u32 {
            assert_eq!(per_generation[&generation], 6);
            let decoder = &decoders[&generation];
            assert_eq!(decoder.get_data().unwrap(), block(generation, n * s));
        }
        assert_eq!(slots.busy_count(), 0);
        assert_eq!(telemetry.pool_exhausted(), 0);
    }

    #[test]
    fn test_boost_and_ack() {
        let config = config(2, 8);
        let slots = SlotPool::new(64, 64).unwrap();
        let (out_tx, out_rx) = unbounded();
        let mut worker = EncodeWorker::new(EncodeContext {
            config,
            pool: slots,
            telemetry: Arc::new(Telemetry::new()),
            outbound: out_tx,
        });

        worker.handle(EncodeCommand::Init { generation: 7, source: block(7, 16) });
        worker.handle(EncodeCommand::Produce { limit: 50, per_generation: 50 });
        assert_eq!(out_rx.try_iter().count(), 3);

        worker.handle(EncodeCommand::Produce { limit: 50, per_generation: 50 });
        assert_eq!(out_rx.try_iter().count(), 0, "target reached");

        worker.handle(EncodeCommand::Boost { generation: 7, count: 5 });
        worker.handle(EncodeCommand::Produce { limit: 2, per_generation: 50 });
        assert_eq!(out_rx.try_iter().count(), 2);

        worker.handle(EncodeCommand::Ack { generation: 7 });
        assert_eq!(worker.active(), 0);
        worker.handle(EncodeCommand::Produce { limit: 50, per_generation: 50 });
        assert_eq!(out_rx.try_iter().count(), 0);
    }

    #[test]
    fn test_fair_share_across_generations() {
        let config = Arc::new(CodingConfig::default().with_pieces(8, 8).with_redundancy(1.0));
        let (out_tx, out_rx) = unbounded();
        let mut worker = EncodeWorker::new(EncodeContext {
            config,
            pool: SlotPool::new(256, 64).unwrap(),
            telemetry: Arc::new(Telemetry::new()),
            outbound: out_tx,
        });
        for generation in 0..4u32 {
            worker.handle(EncodeCommand::Init { generation, source: block(generation, 64) });
        }
        worker.handle(EncodeCommand::Produce { limit: 8, per_generation: 2 });
        let mut counts = [0usize; 4];
        for out in out_rx.try_iter() {
            counts[out.generation as usize] += 1;
        }
        assert_eq!(counts, [2, 2, 2, 2]);
    }

    #[test]
    fn test_pool_exhaustion_drops_and_counts() {
        let config = config(2, 8);
        let telemetry = Arc::new(Telemetry::new());
        let (out_tx, out_rx) = unbounded();
        let mut worker = EncodeWorker::new(EncodeContext {
            config,
            pool: SlotPool::new(4, 64).unwrap(),
            telemetry: Arc::clone(&telemetry),
            outbound: out_tx,
        });
        worker.handle(EncodeCommand::Init { generation: 0, source: block(0, 16) });
        worker.handle(EncodeCommand::Produce { limit: 10, per_generation: 10 });

        let held: Vec<Outbound> = out_rx.try_iter().collect();
        assert_eq!(held.len(), 2, "TX half has two slots");
        assert_eq!(telemetry.pool_exhausted(), 1);

        drop(held);
        worker.handle(EncodeCommand::Produce { limit: 10, per_generation: 10 });
        assert_eq!(out_rx.try_iter().count(), 1, "remaining target resumes");
    }

    fn received_slot(pool: &Arc<SlotPool>, bytes: &[u8]) -> SharedSlot {
        let mut lease = pool.acquire(Region::Rx).unwrap();
        lease.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        lease.set_len(bytes.len());
        lease.freeze()
    }

    #[test]
    fn test_decode_worker_events() {
        let (n, s) = (3, 16);
        let config = config(n, s);
        let telemetry = Arc::new(Telemetry::new());
        let slots = SlotPool::new(16, 128).unwrap();
        let (ev_tx, ev_rx) = unbounded();
        let mut worker = DecodeWorker::new(DecodeContext {
            config: Arc::clone(&config),
            telemetry: Arc::clone(&telemetry),
            events: ev_tx,
        });

        let source = block(5, n * s);
        let mut encoder = BlockEncoder::with_seed(5, n, s, source.clone(), config.kernel, 1).unwrap();
        let mut frames = Vec::new();
        for _ in 0..n {
            let sym = encoder.produce();
            let mut frame = Vec::new();
            encode_symbol(&mut frame, &SymbolHeader::new(5), &sym.coefficients, &sym.payload);
            frames.push(frame);
        }

        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frames[0]) });
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frames[0]) });
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, b"garbage") });
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frames[1]) });
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frames[2]) });
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frames[2]) });

        let events: Vec<DecodeEvent> = ev_rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                DecodeEvent::Progress { generation: 5, rank: 1 },
                DecodeEvent::Progress { generation: 5, rank: 2 },
                DecodeEvent::Solved { generation: 5, data: source },
                DecodeEvent::AlreadySolved { generation: 5 },
            ]
        );
        assert_eq!(slots.busy_count(), 0, "every processed slot released");

        let snap = telemetry.snapshot();
        assert_eq!(snap.symbols_received, 5);
        assert_eq!(snap.dependent_symbols, 2);
        assert_eq!(snap.malformed_packets, 1);
        assert_eq!(snap.generations_solved, 1);
        assert_eq!(worker.spare.len(), 1);
    }

    fn systematic_frames(generation: u32, n: usize, s: usize, count: usize) -> Vec<Vec<u8>> {
        let mut encoder = BlockEncoder::new(generation, n, s, block(generation, n * s), crate::Kernel::Wide).unwrap();
        (0..count)
            .map(|_| {
                let sym = encoder.produce();
                let mut frame = Vec::new();
                encode_symbol(&mut frame, &SymbolHeader::new(generation), &sym.coefficients, &sym.payload);
                frame
            })
            .collect()
    }

    #[test]
    fn test_decode_worker_state_is_bounded() {
        let (n, s) = (2, 8);
        let config = config(n, s);
        let slots = SlotPool::new(8, 64).unwrap();
        let (ev_tx, ev_rx) = unbounded();
        let mut worker = DecodeWorker::new(DecodeContext {
            config: Arc::clone(&config),
            telemetry: Arc::new(Telemetry::new()),
            events: ev_tx,
        });

        // 0..500 solved, 500..800 left half decoded.
        for generation in 0..800u32 {
            let count = if generation < 500 { n } else { 1 };
            for frame in systematic_frames(generation, n, s, count) {
                worker.handle(DecodeCommand::Process { slot: received_slot(&slots, &frame) });
            }
        }
        assert_eq!(worker.solved.len(), 500);
        assert_eq!(worker.decoders.len(), 300);

        worker.handle(DecodeCommand::Retire { below: 700 });
        assert!(worker.solved.is_empty());
        assert_eq!(worker.decoders.len(), 100);
        assert!(worker.decoders.keys().all(|&id| id >= 700));
        assert!(worker.spare.len() <= config.window_size);

        worker.handle(DecodeCommand::Abandon { generation: 750 });
        assert_eq!(worker.decoders.len(), 99);

        // An abandoned generation starts over.
        ev_rx.try_iter().for_each(drop);
        let frame = &systematic_frames(750, n, s, 1)[0];
        worker.handle(DecodeCommand::Process { slot: received_slot(&slots, frame) });
        assert_eq!(ev_rx.try_recv(), Ok(DecodeEvent::Progress { generation: 750, rank: 1 }));
        assert_eq!(slots.busy_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_worker() {
        let seen = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::spawn("bcast", 3, |_| {
            let seen = Arc::clone(&seen);
            move |step: u32| {
                seen.fetch_add(step as usize, Ordering::SeqCst);
            }
        })
        .unwrap();
        pool.broadcast(2).unwrap();
        pool.shutdown().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
