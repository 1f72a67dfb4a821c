//! Transmit session: drain an input stream of sample blocks into the
//! host-created ring for the streamer to consume.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chunk::{IqSample, TxBlock};
use crate::error::{Result, StreamError};
use crate::params::{tx_invocation, TxParams};
use crate::process::{default_log_path, StreamerProcess};
use crate::ring::{delete_ring, SampleRing};
use crate::stream::{sample_time_label, TxStats, WarningKind, WarningSink};

/// Backoff while the ring is full and the consumer is still alive.
const POLL_BACKOFF: Duration = Duration::from_millis(1);

/// Handles returned by [`start_tx`].
///
/// The session ends when the input channel closes (drop the sender); stats
/// and warnings are best-effort observability streams and never block the
/// task. `task` completes only after the writer-done flag is set, the drain
/// grace has elapsed and the ring file is deleted.
pub struct TxStream {
    pub stats: mpsc::Receiver<TxStats>,
    pub warnings: mpsc::Receiver<crate::stream::StreamWarning>,
    pub task: JoinHandle<()>,
}

/// Why the TX hot loop ended.
#[derive(Debug)]
enum TxExit {
    /// Input channel closed and every accepted block was published.
    Drained,
    /// The streamer died while blocks were still pending.
    ProcessExited(std::process::ExitStatus),
    /// An input block did not match the ring geometry.
    ShapeMismatch,
}

/// Start a transmit session.
///
/// The host is the ring producer: any stale file is deleted, the ring is
/// created from [`TxParams`] geometry, and only then is the streamer
/// spawned, so it can open the ring immediately.
pub fn start_tx(input: mpsc::Receiver<TxBlock>, params: TxParams) -> Result<TxStream> {
    params.validate()?;
    delete_ring(&params.ring_path)?;

    let ring = SampleRing::create(
        &params.ring_path,
        params.chunk_size,
        params.effective_num_slots(),
        params.channels,
    )?;

    let invocation = params
        .invocation_override
        .clone()
        .unwrap_or_else(|| tx_invocation(&params));
    let process = match StreamerProcess::spawn(
        &invocation,
        default_log_path(params.log_dir.as_deref(), "tx"),
    ) {
        Ok(process) => process,
        Err(e) => {
            let path = ring.path().to_path_buf();
            let _ = ring.sync_and_unmap();
            let _ = delete_ring(&path);
            return Err(e);
        }
    };

    let (stats_tx, stats_rx) = mpsc::channel(params.stats_capacity);
    let (warn_tx, warn_rx) = mpsc::channel(params.warning_capacity);

    let task = spawn_tx_task(
        input,
        ring,
        process,
        stats_tx,
        WarningSink::new(warn_tx),
        params.sample_rate,
        params.drain_grace,
    )?;

    Ok(TxStream {
        stats: stats_rx,
        warnings: warn_rx,
        task,
    })
}

/// Spawn the TX task thread over an already created ring.
///
/// Shared with the duplex session, which supplies its own process handle and
/// warnings channel.
pub(crate) fn spawn_tx_task(
    input: mpsc::Receiver<TxBlock>,
    ring: SampleRing,
    process: Arc<StreamerProcess>,
    stats: mpsc::Sender<TxStats>,
    warnings: WarningSink,
    sample_rate: u64,
    drain_grace: Duration,
) -> Result<JoinHandle<()>> {
    let ring_path = ring.path().to_path_buf();
    match thread::Builder::new()
        .name("iqbridge-tx".to_string())
        .spawn(move || tx_task(input, ring, process, stats, warnings, sample_rate, drain_grace))
    {
        Ok(handle) => Ok(handle),
        Err(e) => {
            // The task body never ran: the failed spawn dropped the closure,
            // releasing the mapping and this side's process handle. Only the
            // backing file is left to reclaim.
            if let Err(del) = delete_ring(&ring_path) {
                warn!("failed to delete tx ring file after spawn failure: {del}");
            }
            Err(StreamError::Io(e))
        }
    }
}

fn tx_task(
    input: mpsc::Receiver<TxBlock>,
    mut ring: SampleRing,
    process: Arc<StreamerProcess>,
    stats: mpsc::Sender<TxStats>,
    mut warnings: WarningSink,
    sample_rate: u64,
    drain_grace: Duration,
) {
    let exit = tx_hot_loop(input, &mut ring, &process, &stats, &mut warnings, sample_rate);
    warnings.finish("tx");

    // Signal end-of-stream and give the consumer time to flush the slots it
    // has already buffered before the process goes away.
    ring.set_writer_done();
    if !matches!(exit, TxExit::ProcessExited(_)) {
        thread::sleep(drain_grace);
    }

    drop(stats);
    drop(process);
    let path = ring.path().to_path_buf();
    if let Err(e) = ring.sync_and_unmap() {
        warn!("failed to flush tx ring: {e}");
    }
    if let Err(e) = delete_ring(&path) {
        warn!("failed to delete tx ring file: {e}");
    }
    info!(exit = ?exit, "tx task finished");
}

fn tx_hot_loop(
    mut input: mpsc::Receiver<TxBlock>,
    ring: &mut SampleRing,
    process: &StreamerProcess,
    stats: &mpsc::Sender<TxStats>,
    warnings: &mut WarningSink,
    sample_rate: u64,
) -> TxExit {
    let chunk_size = ring.chunk_size() as usize;
    let channels = ring.num_channels() as usize;
    let mut total_samples: u64 = 0;
    let mut seen_underflows = ring.error_count();
    let mut seen_stalls = ring.buffer_stall_count();

    while let Some(block) = input.blocking_recv() {
        let time_label = sample_time_label(total_samples, sample_rate);

        let underflows = ring.error_count();
        if underflows > seen_underflows {
            warnings.publish(
                WarningKind::Underflow,
                time_label.clone(),
                Some(format!("{} new underflow(s)", underflows - seen_underflows)),
            );
            seen_underflows = underflows;
        }

        let stalls = ring.buffer_stall_count();
        if stalls > seen_stalls {
            warnings.publish(
                WarningKind::BufferEmpty,
                time_label.clone(),
                Some(format!("{} new empty-buffer event(s)", stalls - seen_stalls)),
            );
            seen_stalls = stalls;
        }

        if block.samples() != chunk_size || block.channels() != channels {
            warnings.publish(
                WarningKind::Error,
                time_label,
                Some(format!(
                    "input block shaped ({}, {}), ring expects ({chunk_size}, {channels})",
                    block.samples(),
                    block.channels(),
                )),
            );
            return TxExit::ShapeMismatch;
        }

        // Wait for a free slot, watching the consumer's liveness.
        while !ring.can_write() {
            if let Some(status) = process.poll_exit() {
                warnings.publish(
                    WarningKind::Error,
                    sample_time_label(total_samples, sample_rate),
                    Some(StreamError::ProcessExitedEarly { status }.to_string()),
                );
                return TxExit::ProcessExited(status);
            }
            thread::sleep(POLL_BACKOFF);
        }

        let index = ring.write_index_relaxed();
        fill_slot(ring.slot_mut(index), &block, chunk_size, channels);
        ring.store_write_index(index + 1);

        total_samples += chunk_size as u64;
        let _ = stats.try_send(TxStats { total_samples });
    }

    TxExit::Drained
}

/// Copy one input block into a ring slot, producing the channel-interleaved
/// wire layout.
fn fill_slot(slot: &mut [IqSample], block: &TxBlock, samples: usize, channels: usize) {
    match block {
        // Single-channel complex input already matches the wire layout.
        TxBlock::Iq(b) if channels == 1 => slot.copy_from_slice(b.as_slice()),
        // Multi-channel: transpose channel-planar to sample-interleaved.
        TxBlock::Iq(b) => {
            for c in 0..channels {
                let plane = b.channel(c);
                for s in 0..samples {
                    slot[s * channels + c] = plane[s];
                }
            }
        }
        // Real input: widen element-wise to complex with zero imaginary.
        TxBlock::Real(b) => {
            for s in 0..samples {
                for c in 0..channels {
                    slot[s * channels + c] = IqSample::from_real(b.at(s, c));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{IqBlock, RealBlock};

    #[test]
    fn test_fill_slot_single_channel_iq() {
        let block = TxBlock::Iq(IqBlock::from_fn(4, 1, |s, _| IqSample::new(s as i16, 1)));
        let mut slot = vec![IqSample::default(); 4];
        fill_slot(&mut slot, &block, 4, 1);
        assert_eq!(slot[3], IqSample::new(3, 1));
    }

    #[test]
    fn test_fill_slot_transposes_dual_channel() {
        let block = TxBlock::Iq(IqBlock::from_fn(3, 2, |s, c| {
            IqSample::new(s as i16, c as i16)
        }));
        let mut slot = vec![IqSample::default(); 6];
        fill_slot(&mut slot, &block, 3, 2);
        // Interleaved: s0c0 s0c1 s1c0 s1c1 s2c0 s2c1
        assert_eq!(slot[0], IqSample::new(0, 0));
        assert_eq!(slot[1], IqSample::new(0, 1));
        assert_eq!(slot[2], IqSample::new(1, 0));
        assert_eq!(slot[5], IqSample::new(2, 1));
    }

    #[test]
    fn test_fill_slot_widens_real_input() {
        let block = TxBlock::Real(RealBlock::from_fn(4, 1, |s, _| (s as i16) * 10));
        let mut slot = vec![IqSample::new(9, 9); 4];
        fill_slot(&mut slot, &block, 4, 1);
        assert_eq!(slot[0], IqSample::new(0, 0));
        assert_eq!(slot[3], IqSample::new(30, 0));
    }
}
