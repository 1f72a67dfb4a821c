//! Streaming tasks: receive, transmit, full-duplex coordination and the
//! downstream repackaging bridge.
//!
//! Each session spawns one OS thread per direction. The thread owns its ring
//! attachment, shares the streamer process handle through an `Arc`, and runs
//! a fixed-order teardown on every exit path: drop the process handle (the
//! last owner kills and reaps the streamer), flush and unmap the ring, then
//! delete the ring file.

pub mod bridge;
pub mod duplex;
pub mod rx;
pub mod tx;

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

/// Classification of an out-of-band streaming warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Producer dropped incoming samples: no free slot was available (RX).
    Overflow,
    /// Consumer ran out of samples to transmit (TX).
    Underflow,
    /// Consumer substituted zeros while the ring was momentarily empty (TX).
    BufferEmpty,
    /// Task-level failure or notice, detail attached.
    Error,
}

/// An out-of-band warning from a streaming task.
///
/// Warnings are published with `try_send` and dropped silently when the
/// warnings channel is full; the hot path never suspends on them.
#[derive(Debug, Clone)]
pub struct StreamWarning {
    pub kind: WarningKind,
    /// Short free-form position label: elapsed seconds for RX, cumulative
    /// sample-time for TX.
    pub time_label: String,
    pub detail: Option<String>,
}

impl StreamWarning {
    fn new(kind: WarningKind, time_label: String, detail: Option<String>) -> Self {
        Self {
            kind,
            time_label,
            detail,
        }
    }
}

/// Transmit progress, emitted after each successfully published chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// Cumulative samples per channel published to the ring.
    pub total_samples: u64,
}

/// Elapsed-time label for RX warnings.
fn elapsed_label(started: Instant) -> String {
    format!("{:.3}s", started.elapsed().as_secs_f64())
}

/// Sample-time label for TX warnings.
fn sample_time_label(total_samples: u64, sample_rate: u64) -> String {
    format!("{:.3}s", total_samples as f64 / sample_rate as f64)
}

/// Non-blocking warning publisher with a drop counter.
///
/// Dropped warnings stay silent at the API; the count is logged once when
/// the task exits so "no warnings" and "too many warnings" are
/// distinguishable in the logs.
pub(crate) struct WarningSink {
    tx: mpsc::Sender<StreamWarning>,
    dropped: u64,
}

impl WarningSink {
    pub(crate) fn new(tx: mpsc::Sender<StreamWarning>) -> Self {
        Self { tx, dropped: 0 }
    }

    pub(crate) fn publish(&mut self, kind: WarningKind, time_label: String, detail: Option<String>) {
        if self
            .tx
            .try_send(StreamWarning::new(kind, time_label, detail))
            .is_err()
        {
            self.dropped += 1;
        }
    }

    pub(crate) fn finish(self, task: &str) {
        if self.dropped > 0 {
            debug!(task, dropped = self.dropped, "warnings dropped on full channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(sample_time_label(20_000_000, 40_000_000), "0.500s");
        assert_eq!(sample_time_label(0, 40_000_000), "0.000s");
    }

    #[test]
    fn test_warning_sink_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = WarningSink::new(tx);
        sink.publish(WarningKind::Overflow, "0.001s".to_string(), None);
        sink.publish(WarningKind::Overflow, "0.002s".to_string(), None);
        sink.publish(WarningKind::Overflow, "0.003s".to_string(), None);
        assert_eq!(sink.dropped, 2);
        sink.finish("test");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, WarningKind::Overflow);
        assert_eq!(first.time_label, "0.001s");
        assert!(rx.try_recv().is_err());
    }
}
