//! Mock streamer peer for hardware-free integration testing.
//!
//! Speaks the shared-memory ring protocol exactly like the real streamer
//! binary, so the host-side sessions can be exercised end to end with two
//! cooperating host processes and no SDR attached:
//!
//! - `--role rx-producer`: create the ring and publish deterministic
//!   counter-pattern chunks, then set the writer-done flag.
//! - `--role tx-consumer`: drain the host-created ring, appending the raw
//!   consumed bytes to `--out` for later verification.
//! - `--role duplex`: both of the above concurrently, as one process.
//!
//! The counter pattern fills every (sample, channel) element in interleaved
//! order with `c`, where `c` starts at 1 and advances as
//! `c ← (c mod 32000) + 1`, continuing across slot boundaries.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};

use iqbridge::{SampleRing, StreamError};

#[derive(Parser)]
#[command(name = "mock_streamer")]
#[command(about = "Ring-protocol mock peer for iqbridge integration tests", long_about = None)]
struct Cli {
    #[arg(long, value_enum)]
    role: Role,

    /// Ring this process produces into (rx-producer, duplex) or consumes
    /// from (tx-consumer).
    #[arg(long)]
    ring: PathBuf,

    /// Ring the duplex role consumes from (the host-created TX ring).
    #[arg(long)]
    tx_ring: Option<PathBuf>,

    /// Producer geometry: samples per chunk per channel.
    #[arg(long, default_value_t = 256)]
    chunk_size: u32,

    /// Producer geometry: slot count.
    #[arg(long, default_value_t = 16)]
    slots: u32,

    /// Producer geometry: channel count.
    #[arg(long, default_value_t = 1)]
    channels: u16,

    /// Chunks to produce; 0 means "until killed".
    #[arg(long, default_value_t = 10)]
    chunks: u64,

    /// Append raw consumed slot bytes to this file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Consumer: keep retrying while the ring is absent (the `-w` switch of
    /// the real streamer).
    #[arg(long)]
    wait: bool,

    /// Consumer: sleep this long after each consumed chunk.
    #[arg(long, default_value_t = 0)]
    pace_us: u64,

    /// Producer: bump the overflow counter by this much halfway through.
    #[arg(long, default_value_t = 0)]
    overflows: u64,

    /// Consumer: bump the underflow counter by this much after the first
    /// consumed chunk.
    #[arg(long, default_value_t = 0)]
    underflows: u64,

    /// Consumer: bump the stall counter by this much after the first
    /// consumed chunk.
    #[arg(long, default_value_t = 0)]
    stalls: u64,

    /// Producer: exit without setting the writer-done flag.
    #[arg(long)]
    skip_done: bool,

    /// Producer: exit with this status once the chunks are published.
    #[arg(long, default_value_t = 0)]
    exit_code: i32,

    /// Exit with this status before touching any ring.
    #[arg(long)]
    fail_early: Option<i32>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    RxProducer,
    TxConsumer,
    Duplex,
}

/// The deterministic test pattern: 1, 2, …, 32000, 1, 2, …
struct CounterPattern {
    c: i16,
}

impl CounterPattern {
    fn new() -> Self {
        Self { c: 1 }
    }

    fn next(&mut self) -> i16 {
        let v = self.c;
        self.c = (self.c % 32000) + 1;
        v
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(code) = cli.fail_early {
        eprintln!("mock streamer failing early as requested");
        std::process::exit(code);
    }

    match cli.role {
        Role::RxProducer => {
            produce(
                &cli.ring,
                cli.chunk_size,
                cli.slots,
                cli.channels,
                cli.chunks,
                cli.overflows,
                cli.skip_done,
            )?;
            if cli.exit_code != 0 {
                std::process::exit(cli.exit_code);
            }
            Ok(())
        }
        Role::TxConsumer => consume(
            &cli.ring,
            cli.wait,
            cli.out.clone(),
            cli.pace_us,
            cli.underflows,
            cli.stalls,
        ),
        Role::Duplex => {
            let tx_ring = cli
                .tx_ring
                .clone()
                .context("--tx-ring is required for the duplex role")?;
            let producer = {
                let ring = cli.ring.clone();
                thread::spawn(move || {
                    produce(
                        &ring,
                        cli.chunk_size,
                        cli.slots,
                        cli.channels,
                        cli.chunks,
                        cli.overflows,
                        cli.skip_done,
                    )
                })
            };
            let consumer = {
                let out = cli.out.clone();
                thread::spawn(move || {
                    consume(&tx_ring, true, out, cli.pace_us, cli.underflows, cli.stalls)
                })
            };
            let produced = producer.join().expect("producer thread panicked");
            let consumed = consumer.join().expect("consumer thread panicked");
            produced?;
            consumed
        }
    }
}

/// Create the ring and publish `chunks` counter-pattern chunks.
fn produce(
    ring_path: &std::path::Path,
    chunk_size: u32,
    slots: u32,
    channels: u16,
    chunks: u64,
    overflows: u64,
    skip_done: bool,
) -> Result<()> {
    let mut ring = SampleRing::create(ring_path, chunk_size, slots, channels)?;
    let mut pattern = CounterPattern::new();

    info!(ring = %ring_path.display(), chunk_size, slots, channels, chunks, "producing");

    let mut published: u64 = 0;
    while chunks == 0 || published < chunks {
        while !ring.can_write() {
            thread::sleep(Duration::from_micros(200));
        }
        let index = ring.write_index_relaxed();
        for sample in ring.slot_mut(index) {
            let v = pattern.next();
            sample.re = v;
            sample.im = v;
        }
        ring.store_write_index(index + 1);
        published += 1;

        if overflows > 0 && published == chunks / 2 + 1 {
            ring.record_errors(overflows);
        }
    }

    if !skip_done {
        ring.set_writer_done();
    }
    debug!(published, "producer done");
    Ok(())
}

/// Drain the ring until the writer is done, optionally dumping the consumed
/// bytes for verification.
fn consume(
    ring_path: &std::path::Path,
    wait: bool,
    out: Option<PathBuf>,
    pace_us: u64,
    underflows: u64,
    stalls: u64,
) -> Result<()> {
    let open_deadline = Instant::now() + Duration::from_secs(10);
    let ring = loop {
        match SampleRing::open(ring_path) {
            Ok(ring) => break ring,
            Err(e) if e.retryable_during_open() => {
                // Without --wait the ring is expected to already exist; a
                // short grace covers host scheduling only.
                if !wait && Instant::now() >= open_deadline {
                    bail!("ring at {} never became valid: {e}", ring_path.display());
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut dump = match out {
        Some(path) => Some(BufWriter::new(
            File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    info!(ring = %ring_path.display(), "consuming");

    let mut consumed: u64 = 0;
    loop {
        if ring.can_read() {
            let index = ring.read_index_relaxed();
            if let Some(dump) = &mut dump {
                for sample in ring.slot(index) {
                    dump.write_all(&sample.re.to_le_bytes())?;
                    dump.write_all(&sample.im.to_le_bytes())?;
                }
            }
            ring.store_read_index(index + 1);
            consumed += 1;

            if consumed == 1 {
                if underflows > 0 {
                    ring.record_errors(underflows);
                }
                if stalls > 0 {
                    ring.record_stalls(stalls);
                }
            }
            if pace_us > 0 {
                thread::sleep(Duration::from_micros(pace_us));
            }
        } else if ring.writer_done() {
            break;
        } else {
            thread::sleep(Duration::from_micros(500));
        }
    }

    if let Some(mut dump) = dump {
        dump.flush()?;
    }
    debug!(consumed, "consumer done");

    // The host owns ring deletion; losing the file mid-drain would still be
    // an error, so report it if the mapping outlived an unlink unexpectedly.
    if !ring_path.exists() {
        return Err(StreamError::RingAbsent {
            path: ring_path.to_path_buf(),
        }
        .into());
    }
    Ok(())
}
