//! Repackage the RX chunk stream into the downstream signal-channel shape.
//!
//! RX chunks are `(channels, samples)` with channel-interleaved storage (the
//! ring slot layout); signal-channel consumers want `(samples, channels)`
//! channel-planar matrices. The bridge is a single pipeline stage with its
//! own buffer pool, so the conversion allocates nothing per chunk in steady
//! state.

use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::debug;

use crate::chunk::{BufferPool, IqBlock, IqChunk};
use crate::error::{Result, StreamError};
use crate::stream::rx::RxItem;

/// One element of the bridged stream; errors from the RX task pass through
/// unchanged.
pub type SignalItem = std::result::Result<Arc<IqBlock>, StreamError>;

/// Spawn a bridge thread converting `chunks` into `(samples, channels)`
/// blocks on a bounded channel of the given capacity.
///
/// The bridge ends when the upstream chunk channel closes, or when the
/// returned receiver is dropped.
pub fn spawn_signal_bridge(
    mut chunks: mpsc::Receiver<RxItem>,
    capacity: usize,
) -> Result<mpsc::Receiver<SignalItem>> {
    let (out_tx, out_rx) = mpsc::channel(capacity);

    thread::Builder::new()
        .name("iqbridge-bridge".to_string())
        .spawn(move || {
            // Pool geometry comes from the first chunk; every later chunk in
            // a session has the same shape.
            let mut pool: Option<BufferPool<IqBlock>> = None;
            let mut forwarded: u64 = 0;

            while let Some(item) = chunks.blocking_recv() {
                let out = match item {
                    Ok(chunk) => {
                        let pool = pool.get_or_insert_with(|| {
                            BufferPool::with_margin(capacity, || {
                                IqBlock::zeroed(chunk.samples(), chunk.channels())
                            })
                        });
                        forwarded += 1;
                        Ok(pool.with_next(|block| repack(&chunk, block)))
                    }
                    Err(e) => Err(e),
                };
                if out_tx.blocking_send(out).is_err() {
                    break;
                }
            }
            debug!(forwarded, "signal bridge finished");
        })
        .map_err(StreamError::Io)?;

    Ok(out_rx)
}

/// Copy one chunk into a block, permuting interleaved to planar.
fn repack(chunk: &IqChunk, block: &mut IqBlock) {
    let channels = chunk.channels();
    let samples = chunk.samples();
    if channels == 1 {
        // Identical layouts; one dense copy.
        block.as_mut_slice().copy_from_slice(chunk.as_slice());
    } else {
        let src = chunk.as_slice();
        let dst = block.as_mut_slice();
        for c in 0..channels {
            for s in 0..samples {
                dst[c * samples + s] = src[s * channels + c];
            }
        }
    }
}
