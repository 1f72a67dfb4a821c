//! Full-duplex session: one streamer process serving two rings.
//!
//! The streamer is simultaneously the RX producer and the TX consumer. The
//! host creates the TX ring before spawning it (the `-w` flag tells the
//! streamer to wait for that ring), then waits for the streamer to create
//! the RX ring. Two independent task threads share one warnings channel and
//! one process handle; each owns the unmap+delete of its ring, and whichever
//! thread drops the process handle last performs the (idempotent) kill.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::chunk::TxBlock;
use crate::error::{Result, StreamError};
use crate::params::{duplex_invocation, DuplexParams};
use crate::process::{default_log_path, wait_for_ring, StreamerProcess};
use crate::ring::{delete_ring, SampleRing};
use crate::stream::rx::{spawn_rx_task, RxItem};
use crate::stream::tx::spawn_tx_task;
use crate::stream::{StreamWarning, TxStats, WarningSink};

/// Handles returned by [`start_duplex`].
///
/// `chunks` and `stats` behave exactly as in the simplex sessions; the
/// single `warnings` channel carries observations from both directions.
pub struct DuplexStream {
    pub chunks: mpsc::Receiver<RxItem>,
    pub stats: mpsc::Receiver<TxStats>,
    pub warnings: mpsc::Receiver<StreamWarning>,
    pub rx_task: JoinHandle<()>,
    pub tx_task: JoinHandle<()>,
}

/// Start a full-duplex session.
pub fn start_duplex(
    channels: u16,
    tx_input: mpsc::Receiver<TxBlock>,
    params: DuplexParams,
) -> Result<DuplexStream> {
    params.validate(channels)?;
    delete_ring(&params.rx.ring_path)?;
    delete_ring(&params.tx.ring_path)?;

    // Host side of the duplex pair is the TX producer, so it creates that
    // ring up front; the streamer opens it at startup.
    let tx_ring = SampleRing::create(
        &params.tx.ring_path,
        params.tx.chunk_size,
        params.tx.effective_num_slots(),
        channels,
    )?;

    let invocation = params
        .invocation_override
        .clone()
        .unwrap_or_else(|| duplex_invocation(channels, &params));
    let process = match StreamerProcess::spawn(
        &invocation,
        default_log_path(params.rx.log_dir.as_deref(), "duplex"),
    ) {
        Ok(process) => process,
        Err(e) => {
            discard_ring(tx_ring);
            return Err(e);
        }
    };

    let rx_ring = match wait_for_ring(&params.rx.ring_path, &process).and_then(|ring| {
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
            discard_ring(tx_ring);
            let _ = delete_ring(&params.rx.ring_path);
            return Err(e);
        }
    };

    let (chunk_tx, chunk_rx) = mpsc::channel(params.rx.chunk_capacity);
    let (stats_tx, stats_rx) = mpsc::channel(params.tx.stats_capacity);
    let (warn_tx, warn_rx) = mpsc::channel(params.rx.warning_capacity);

    let rx_task = match spawn_rx_task(
        rx_ring,
        Arc::clone(&process),
        chunk_tx,
        WarningSink::new(warn_tx.clone()),
        params.rx.chunk_capacity,
    ) {
        Ok(task) => task,
        Err(e) => {
            // The RX ring file was reclaimed by the failed spawn; the TX
            // ring is still owned here.
            process.stop();
            discard_ring(tx_ring);
            return Err(e);
        }
    };

    let tx_task = match spawn_tx_task(
        tx_input,
        tx_ring,
        process,
        stats_tx,
        WarningSink::new(warn_tx),
        params.tx.sample_rate,
        params.tx.drain_grace,
    ) {
        Ok(task) => task,
        Err(e) => {
            // The TX ring file was reclaimed by the failed spawn. The RX
            // task is already running; dropping its receiver via this early
            // return cancels it, and its teardown stops the streamer and
            // cleans up the RX ring.
            return Err(e);
        }
    };

    Ok(DuplexStream {
        chunks: chunk_rx,
        stats: stats_rx,
        warnings: warn_rx,
        rx_task,
        tx_task,
    })
}

fn discard_ring(ring: SampleRing) {
    let path = ring.path().to_path_buf();
    let _ = ring.sync_and_unmap();
    let _ = delete_ring(&path);
}
