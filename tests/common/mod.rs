#![allow(dead_code)]
//! Shared helpers for the integration suites.
//!
//! The mock streamer binary speaks the ring protocol like the real one; all
//! sessions inject it through `invocation_override`, which keeps the
//! supervisor path identical with mock and real peers.

use iqbridge::StreamerInvocation;

/// Invocation of the mock streamer built alongside the test binaries.
pub fn mock_invocation(args: &[&str]) -> StreamerInvocation {
    StreamerInvocation::new(
        env!("CARGO_BIN_EXE_mock_streamer"),
        args.iter().map(|s| s.to_string()).collect(),
    )
}

/// The mock producer's counter pattern, for verification on the consumer
/// side: starts at 1 and advances as `c ← (c mod 32000) + 1` once per
/// (sample, channel) element in interleaved order.
pub struct CounterPattern {
    c: i16,
}

impl CounterPattern {
    pub fn new() -> Self {
        Self { c: 1 }
    }

    pub fn next(&mut self) -> i16 {
        let v = self.c;
        self.c = (self.c % 32000) + 1;
        v
    }
}
