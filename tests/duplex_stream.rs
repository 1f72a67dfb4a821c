//! Integration test for full-duplex coordination: one mock peer serving the
//! RX producer and TX consumer roles at once.

mod common;

use std::time::Duration;

use common::{mock_invocation, CounterPattern};
use iqbridge::{start_duplex, DuplexParams, IqBlock, IqSample, RxParams, TxBlock, TxParams};
use tokio::sync::mpsc;

#[test]
fn test_duplex_streams_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let rx_ring = dir.path().join("rx.ring");
    let tx_ring = dir.path().join("tx.ring");
    let dump = dir.path().join("consumed.bin");

    let invocation = mock_invocation(&[
        "--role",
        "duplex",
        "--ring",
        rx_ring.to_str().unwrap(),
        "--tx-ring",
        tx_ring.to_str().unwrap(),
        "--chunks",
        "10",
        "--chunk-size",
        "256",
        "--slots",
        "16",
        "--channels",
        "1",
        "--out",
        dump.to_str().unwrap(),
    ]);

    let params = DuplexParams {
        rx: RxParams::default().with_ring_path(&rx_ring),
        tx: TxParams::default()
            .with_ring_path(&tx_ring)
            .with_geometry(256, 16)
            .with_drain_grace(Duration::from_millis(300)),
        invocation_override: None,
    }
    .with_invocation(invocation);

    let (input_tx, input_rx) = mpsc::channel(16);
    let mut stream = start_duplex(1, input_rx, params).unwrap();

    // Feed the TX direction the scenario pattern up front.
    for q in 0..10i16 {
        let block = IqBlock::from_fn(256, 1, |s, _| {
            IqSample::new(s as i16 + q * 256 + 1, q + 1)
        });
        input_tx.blocking_send(TxBlock::Iq(block)).unwrap();
    }
    drop(input_tx);

    // RX direction: ten counter chunks in sequence, then a clean close.
    let mut pattern = CounterPattern::new();
    let mut received = 0u32;
    while let Some(item) = stream.chunks.blocking_recv() {
        let chunk = item.unwrap();
        assert_eq!((chunk.channels(), chunk.samples()), (1, 256));
        for j in 0..256 {
            let expected = pattern.next();
            assert_eq!(chunk.at(0, j).re, expected);
        }
        received += 1;
    }
    assert_eq!(received, 10);

    // TX direction: cumulative stats end at 10 x 256 samples.
    let mut last = 0u64;
    while let Some(stats) = stream.stats.blocking_recv() {
        assert!(stats.total_samples >= last);
        last = stats.total_samples;
    }
    assert_eq!(last, 2560);

    // One shared warnings channel for both directions; a clean run closes it
    // without items.
    let mut warnings = Vec::new();
    while let Some(warning) = stream.warnings.blocking_recv() {
        warnings.push(warning);
    }
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");

    stream.rx_task.join().unwrap();
    stream.tx_task.join().unwrap();

    // Each task owns teardown of its ring.
    assert!(!rx_ring.exists());
    assert!(!tx_ring.exists());

    // What the peer consumed is exactly what was fed in.
    let bytes = std::fs::read(&dump).unwrap();
    assert_eq!(bytes.len(), 2560 * 4);
    for m in 0..2560usize {
        let re = i16::from_le_bytes([bytes[4 * m], bytes[4 * m + 1]]);
        let im = i16::from_le_bytes([bytes[4 * m + 2], bytes[4 * m + 3]]);
        assert_eq!(re as usize, m + 1);
        assert_eq!(im as usize, m / 256 + 1);
    }
}
