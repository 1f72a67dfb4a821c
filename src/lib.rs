//! # iqbridge
//!
//! Cross-process streaming of SDR IQ samples between a host application and
//! an external real-time streamer process, over lock-free shared-memory ring
//! buffers.
//!
//! The streamer binary owns the radio hardware and its DMA engine; this
//! crate owns everything on the host side: the wire-compatible ring layout
//! and its acquire/release ordering contract, supervision of the streamer
//! process, and the receive/transmit tasks that copy samples through the
//! ring, surface out-of-band warnings and clean up every resource on every
//! exit path.
//!
//! ## Crate structure
//!
//! - **`ring`**: the shared-memory ring protocol — header layout, atomic
//!   index accessors, slot addressing, file lifecycle.
//! - **`chunk`**: sample and matrix types ([`IqSample`], [`IqChunk`],
//!   [`IqBlock`], [`RealBlock`]) and the rotating buffer pools.
//! - **`params`**: typed session parameters with defaults, and composition
//!   of the streamer command line.
//! - **`process`**: the streamer process lifecycle — spawn, wait-for-ring,
//!   liveness, idempotent termination.
//! - **`stream`**: the RX/TX/duplex tasks and the signal-channel bridge.
//! - **`error`**: the [`StreamError`] taxonomy.
//!
//! ## Entry points
//!
//! [`start_rx`], [`start_tx`] and [`start_duplex`] each build or open the
//! ring(s), launch the streamer, spawn background task thread(s) and return
//! bounded channels to the caller. Dropping a chunk receiver (RX) or the
//! input sender (TX) is the cancellation signal for its task. Two auxiliary
//! operations, [`read_stats`] and [`delete_ring`], act on existing ring
//! files.
//!
//! ```no_run
//! use iqbridge::{start_rx, RxParams};
//!
//! # fn main() -> iqbridge::Result<()> {
//! let mut stream = start_rx(2, RxParams::default())?;
//! while let Some(item) = stream.chunks.blocking_recv() {
//!     let chunk = item?;
//!     println!("chunk: {} channels x {} samples", chunk.channels(), chunk.samples());
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod error;
pub mod params;
pub mod process;
pub mod ring;
pub mod stream;

pub use chunk::{IqBlock, IqChunk, IqSample, RealBlock, TxBlock};
pub use error::{Result, StreamError};
pub use params::{
    duplex_invocation, rx_invocation, tx_invocation, AgcMode, DuplexParams, RxParams,
    StreamerInvocation, TxParams,
};
pub use process::StreamerProcess;
pub use ring::{delete_ring, read_stats, RingStats, SampleRing, HEADER_SIZE, SAMPLE_SIZE};
pub use stream::bridge::{spawn_signal_bridge, SignalItem};
pub use stream::duplex::{start_duplex, DuplexStream};
pub use stream::rx::{start_rx, RxItem, RxStream};
pub use stream::tx::{start_tx, TxStream};
pub use stream::{StreamWarning, TxStats, WarningKind};
