//! Receive session: consume the streamer-produced ring and emit chunks.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chunk::{BufferPool, IqChunk};
use crate::error::{Result, StreamError};
use crate::params::{rx_invocation, RxParams};
use crate::process::{default_log_path, wait_for_ring, StreamerProcess};
use crate::ring::{delete_ring, SampleRing};
use crate::stream::{elapsed_label, WarningKind, WarningSink};

/// Backoff while the ring is empty and the writer is still alive.
const POLL_BACKOFF: Duration = Duration::from_millis(1);

/// One element of the chunk stream. The final element before the channel
/// closes carries the failure, if the session ended abnormally.
pub type RxItem = std::result::Result<Arc<IqChunk>, StreamError>;

/// Handles returned by [`start_rx`].
///
/// Dropping `chunks` is the cancellation signal: the task finishes at most
/// one in-flight copy, tears the session down and exits. `task` completes
/// only after the ring file is deleted and the streamer is reaped.
#[derive(Debug)]
pub struct RxStream {
    pub chunks: mpsc::Receiver<RxItem>,
    pub warnings: mpsc::Receiver<crate::stream::StreamWarning>,
    pub task: JoinHandle<()>,
}

/// Why the RX hot loop ended.
#[derive(Debug)]
enum RxExit {
    /// Producer set the writer-done flag and the ring is drained.
    WriterDone,
    /// Downstream consumer closed the chunk channel.
    PipeClosed,
    /// The streamer died while the ring was still open.
    ProcessExited(std::process::ExitStatus),
}

/// Start a receive session.
///
/// Deletes any stale ring file, spawns the streamer, waits for it to create
/// a valid ring (10 s bound), verifies the channel count, then hands the hot
/// loop to a dedicated thread. Startup errors are returned synchronously;
/// streaming errors arrive as the final item on the chunk channel.
pub fn start_rx(channels: u16, params: RxParams) -> Result<RxStream> {
    params.validate(channels)?;
    delete_ring(&params.ring_path)?;

    let invocation = params
        .invocation_override
        .clone()
        .unwrap_or_else(|| rx_invocation(channels, &params));
    let process = StreamerProcess::spawn(
        &invocation,
        default_log_path(params.log_dir.as_deref(), "rx"),
    )?;

    let ring = match wait_for_ring(&params.ring_path, &process).and_then(|ring| {
        if ring.num_channels() == channels {
            Ok(ring)
        } else {
            Err(StreamError::ChannelMismatch {
                requested: channels,
                actual: ring.num_channels(),
            })
        }
    }) {
        Ok(ring) => ring,
        Err(e) => {
            process.stop();
            let _ = delete_ring(&params.ring_path);
            return Err(e);
        }
    };

    let (chunk_tx, chunk_rx) = mpsc::channel(params.chunk_capacity);
    let (warn_tx, warn_rx) = mpsc::channel(params.warning_capacity);

    let task = spawn_rx_task(
        ring,
        process,
        chunk_tx,
        WarningSink::new(warn_tx),
        params.chunk_capacity,
    )?;

    Ok(RxStream {
        chunks: chunk_rx,
        warnings: warn_rx,
        task,
    })
}

/// Spawn the RX task thread over an already validated ring.
///
/// Shared with the duplex session, which supplies its own process handle and
/// warnings channel.
pub(crate) fn spawn_rx_task(
    ring: SampleRing,
    process: Arc<StreamerProcess>,
    chunks: mpsc::Sender<RxItem>,
    warnings: WarningSink,
    pool_capacity: usize,
) -> Result<JoinHandle<()>> {
    let ring_path = ring.path().to_path_buf();
    match thread::Builder::new()
        .name("iqbridge-rx".to_string())
        .spawn(move || rx_task(ring, process, chunks, warnings, pool_capacity))
    {
        Ok(handle) => Ok(handle),
        Err(e) => {
            // The task body never ran: the failed spawn dropped the closure,
            // releasing the mapping and this side's process handle. Only the
            // backing file is left to reclaim.
            if let Err(del) = delete_ring(&ring_path) {
                warn!("failed to delete rx ring file after spawn failure: {del}");
            }
            Err(StreamError::Io(e))
        }
    }
}

fn rx_task(
    ring: SampleRing,
    process: Arc<StreamerProcess>,
    chunks: mpsc::Sender<RxItem>,
    mut warnings: WarningSink,
    pool_capacity: usize,
) {
    let started = Instant::now();
    let mut pool = BufferPool::with_margin(pool_capacity, || {
        IqChunk::zeroed(ring.num_channels() as usize, ring.chunk_size() as usize)
    });

    let exit = rx_hot_loop(&ring, &mut pool, &chunks, &mut warnings, &process, started);

    match &exit {
        RxExit::WriterDone | RxExit::PipeClosed => {}
        RxExit::ProcessExited(status) if status.success() => {
            // Zero-status exit without writer_done: a notice, not a failure.
            warnings.publish(
                WarningKind::Error,
                elapsed_label(started),
                Some(StreamError::ProcessExitedClean.to_string()),
            );
        }
        RxExit::ProcessExited(status) => {
            let err = StreamError::ProcessExitedEarly { status: *status };
            warnings.publish(
                WarningKind::Error,
                elapsed_label(started),
                Some(err.to_string()),
            );
            let _ = chunks.blocking_send(Err(err));
        }
    }
    warnings.finish("rx");

    // Fixed teardown order: close the chunk stream, terminate the streamer
    // (last process-handle owner kills and reaps), unmap, delete.
    drop(chunks);
    drop(process);
    let path = ring.path().to_path_buf();
    if let Err(e) = ring.sync_and_unmap() {
        warn!("failed to flush rx ring: {e}");
    }
    if let Err(e) = delete_ring(&path) {
        warn!("failed to delete rx ring file: {e}");
    }
    info!(exit = ?exit, elapsed = ?started.elapsed(), "rx task finished");
}

fn rx_hot_loop(
    ring: &SampleRing,
    pool: &mut BufferPool<IqChunk>,
    chunks: &mpsc::Sender<RxItem>,
    warnings: &mut WarningSink,
    process: &StreamerProcess,
    started: Instant,
) -> RxExit {
    let mut seen_overflows = ring.error_count();

    loop {
        let overflows = ring.error_count();
        if overflows > seen_overflows {
            warnings.publish(
                WarningKind::Overflow,
                elapsed_label(started),
                Some(format!("{} new overflow(s)", overflows - seen_overflows)),
            );
            seen_overflows = overflows;
        }

        if ring.can_read() {
            let index = ring.read_index_relaxed();
            let chunk = pool.with_next(|buf| {
                // Slot layout equals chunk layout; one dense copy.
                buf.as_mut_slice().copy_from_slice(ring.slot(index));
            });
            // The only intended suspension point: backpressure from the
            // downstream consumer.
            if chunks.blocking_send(Ok(chunk)).is_err() {
                return RxExit::PipeClosed;
            }
            ring.store_read_index(index + 1);
        } else if ring.writer_done() {
            return RxExit::WriterDone;
        } else if let Some(status) = process.poll_exit() {
            // Published slots were drained above; an empty ring with a dead
            // writer and no done-flag means the stream ended abnormally.
            return RxExit::ProcessExited(status);
        } else {
            thread::sleep(POLL_BACKOFF);
        }
    }
}
