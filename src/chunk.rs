//! Sample and matrix types shared by the streaming tasks.
//!
//! The wire sample is a complex int16 pair; a ring slot holds `chunk_size ×
//! num_channels` of them, channel-interleaved sample by sample. [`IqChunk`]
//! keeps that exact storage order so the RX hot path is a single dense copy,
//! while [`IqBlock`]/[`RealBlock`] use the channel-planar `(samples,
//! channels)` order that downstream consumers and TX producers work in.

use std::sync::Arc;

/// Extra pool entries beyond the channel capacity, so a matrix momentarily
/// held by the consumer is never the one being refilled.
pub(crate) const RECYCLE_MARGIN: usize = 2;

/// One complex int16 sample: real then imaginary, host-native int16.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IqSample {
    pub re: i16,
    pub im: i16,
}

impl IqSample {
    pub const fn new(re: i16, im: i16) -> Self {
        Self { re, im }
    }

    /// Widen a real sample to complex with zero imaginary part.
    pub const fn from_real(re: i16) -> Self {
        Self { re, im: 0 }
    }
}

/// An RX chunk: logical shape `(channels, samples)`.
///
/// Storage is channel-interleaved per sample (`s0c0, s0c1, s1c0, …`),
/// identical to the ring slot layout, so filling a chunk from a slot is a
/// dense copy with no transposition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IqChunk {
    channels: usize,
    samples: usize,
    data: Vec<IqSample>,
}

impl IqChunk {
    pub fn zeroed(channels: usize, samples: usize) -> Self {
        Self {
            channels,
            samples,
            data: vec![IqSample::default(); channels * samples],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Sample `sample` of channel `channel`.
    pub fn at(&self, channel: usize, sample: usize) -> IqSample {
        debug_assert!(channel < self.channels && sample < self.samples);
        self.data[sample * self.channels + channel]
    }

    /// The interleaved backing storage, in ring-slot order.
    pub fn as_slice(&self) -> &[IqSample] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [IqSample] {
        &mut self.data
    }
}

/// A `(samples, channels)` matrix of complex int16, channel-planar storage
/// (all of channel 0, then channel 1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IqBlock {
    samples: usize,
    channels: usize,
    data: Vec<IqSample>,
}

impl IqBlock {
    pub fn zeroed(samples: usize, channels: usize) -> Self {
        Self {
            samples,
            channels,
            data: vec![IqSample::default(); samples * channels],
        }
    }

    /// Build a block by evaluating `f(sample, channel)`.
    pub fn from_fn(
        samples: usize,
        channels: usize,
        mut f: impl FnMut(usize, usize) -> IqSample,
    ) -> Self {
        let mut block = Self::zeroed(samples, channels);
        for c in 0..channels {
            for s in 0..samples {
                block.data[c * samples + s] = f(s, c);
            }
        }
        block
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn at(&self, sample: usize, channel: usize) -> IqSample {
        debug_assert!(sample < self.samples && channel < self.channels);
        self.data[channel * self.samples + sample]
    }

    /// Contiguous samples of one channel.
    pub fn channel(&self, channel: usize) -> &[IqSample] {
        let base = channel * self.samples;
        &self.data[base..base + self.samples]
    }

    pub fn as_slice(&self) -> &[IqSample] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [IqSample] {
        &mut self.data
    }
}

/// A `(samples, channels)` matrix of real int16, channel-planar storage.
/// TX widens each element to complex with zero imaginary part while copying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealBlock {
    samples: usize,
    channels: usize,
    data: Vec<i16>,
}

impl RealBlock {
    pub fn zeroed(samples: usize, channels: usize) -> Self {
        Self {
            samples,
            channels,
            data: vec![0; samples * channels],
        }
    }

    /// Build a block by evaluating `f(sample, channel)`.
    pub fn from_fn(
        samples: usize,
        channels: usize,
        mut f: impl FnMut(usize, usize) -> i16,
    ) -> Self {
        let mut block = Self::zeroed(samples, channels);
        for c in 0..channels {
            for s in 0..samples {
                block.data[c * samples + s] = f(s, c);
            }
        }
        block
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn at(&self, sample: usize, channel: usize) -> i16 {
        debug_assert!(sample < self.samples && channel < self.channels);
        self.data[channel * self.samples + sample]
    }
}

/// One element of the TX input stream.
#[derive(Clone, Debug)]
pub enum TxBlock {
    /// Complex int16 samples, transmitted as-is.
    Iq(IqBlock),
    /// Real int16 samples, widened to complex during the ring copy.
    Real(RealBlock),
}

impl TxBlock {
    pub fn samples(&self) -> usize {
        match self {
            Self::Iq(b) => b.samples(),
            Self::Real(b) => b.samples(),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::Iq(b) => b.channels(),
            Self::Real(b) => b.channels(),
        }
    }
}

/// A rotating pool of pre-allocated matrices shared with downstream via
/// `Arc`.
///
/// The pool holds `capacity + RECYCLE_MARGIN` entries and hands them out in
/// round-robin order, so an entry is not refilled until a full lap has
/// passed. If the consumer still holds a reference by then (it fell far
/// behind), `Arc::make_mut` clones instead of overwriting, preserving the
/// no-recycle-race property.
pub(crate) struct BufferPool<T: Clone> {
    bufs: Vec<Arc<T>>,
    next: usize,
}

impl<T: Clone> BufferPool<T> {
    /// Pool with `capacity + RECYCLE_MARGIN` entries built by `init`.
    pub fn with_margin(capacity: usize, init: impl Fn() -> T) -> Self {
        let bufs = (0..capacity + RECYCLE_MARGIN)
            .map(|_| Arc::new(init()))
            .collect();
        Self { bufs, next: 0 }
    }

    /// Fill the next pool entry in place and hand out a shared reference.
    pub fn with_next(&mut self, fill: impl FnOnce(&mut T)) -> Arc<T> {
        let len = self.bufs.len();
        let slot = &mut self.bufs[self.next];
        self.next = (self.next + 1) % len;
        fill(Arc::make_mut(slot));
        Arc::clone(slot)
    }
}
