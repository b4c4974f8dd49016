//! In-process sender/receiver over a lossy loopback link.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example loopback -- --bytes 4000000 --loss 15
//! cargo run --release --example loopback -- --pieces 64 --piece-size 1200 --kernel lane4 -v
//! ```
//!
//! Prints throughput, how many symbols were sent per delivered byte and the
//! receiver's dependent-symbol ratio.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use rand::RngCore;
use rlnc::transport::{LossyChannel, MemoryChannel};
use rlnc::{CodingConfig, Kernel, ReceiverSession, SenderSession};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "loopback")]
#[command(about = "Push a random stream through RLNC over a lossy in-memory link")]
struct Args {
    /// Pieces per generation
    #[arg(long, default_value = "32")]
    pieces: usize,

    /// Bytes per piece
    #[arg(long, default_value = "1024")]
    piece_size: usize,

    /// Loss rate in percent, applied to both directions
    #[arg(long, default_value = "10")]
    loss: u8,

    /// Stream length in bytes
    #[arg(long, default_value = "1000000")]
    bytes: usize,

    /// Worker threads per side (0 = all cores)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Row kernel: scalar, wide or lane4
    #[arg(long, default_value = "wide")]
    kernel: Kernel,

    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = CodingConfig::default()
        .with_pieces(args.pieces, args.piece_size)
        .with_kernel(args.kernel)
        .with_threads(args.threads)
        .with_pool(2048, (args.pieces + args.piece_size + 64).max(2048));
    config.validate().context("invalid coding parameters")?;

    let mut raw = vec![0u8; args.bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    let stream = Bytes::from(raw);

    let (near, far) = MemoryChannel::pair();
    let link = LossyChannel::with_random_loss(near, args.loss);

    let mut sender = SenderSession::new(config.clone(), stream.clone(), link).context("sender setup")?;
    let mut receiver = ReceiverSession::new(config, far)
        .context("receiver setup")?
        .with_stream_len(stream.len());

    info!(
        bytes = args.bytes,
        loss = args.loss,
        kernel = %args.kernel,
        generations = sender.window().total(),
        "starting transfer"
    );

    let deadline = Duration::from_secs(args.timeout);
    let start = Instant::now();
    let mut output = BytesMut::with_capacity(stream.len());

    while !(receiver.is_complete() && sender.is_complete()) {
        if start.elapsed() > deadline {
            bail!(
                "timed out after {:?} with {} of {} bytes",
                deadline,
                output.len(),
                stream.len()
            );
        }
        sender.tick(Instant::now())?;
        receiver.poll()?;
        receiver.reassemble(&mut output);
        std::thread::yield_now();
    }
    let elapsed = start.elapsed();

    if output.freeze() != stream {
        bail!("decoded stream differs from source");
    }

    let sent = sender.telemetry().snapshot();
    let received = receiver.telemetry().snapshot();
    let overhead = (sent.symbols_sent as usize * args.piece_size) as f64 / stream.len().max(1) as f64;

    println!("Transferred {} bytes in {:.2?}", stream.len(), elapsed);
    println!(
        "  Throughput:       {:.1} MB/s",
        stream.len() as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("  Symbols sent:     {} ({:.3}x payload)", sent.symbols_sent, overhead);
    println!("  Datagrams lost:   {}", sender.transport().dropped());
    println!("  Watchdog boosts:  {}", sent.boosts);
    println!(
        "  Dependent ratio:  {:.2}%",
        received.dependent_ratio() * 100.0
    );

    sender.shutdown()?;
    receiver.shutdown()?;
    Ok(())
}
