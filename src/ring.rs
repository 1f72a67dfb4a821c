#![allow(unsafe_code)]
//! Lock-free shared-memory ring buffer carrying IQ sample chunks between
//! processes.
//!
//! The ring is a memory-mapped file with a fixed 64-byte header followed by
//! `num_slots × chunk_bytes` of slot storage. Exactly one writer and one
//! reader attach to a ring; the roles are fixed when the file is created.
//! Indices are free-running 64-bit counters and the modulo maps them to
//! slots, so they never wrap in practice.
//!
//! # Header layout
//!
//! All offsets are absolute byte offsets from the start of the file. The
//! layout is shared with the external streamer binary and must not change.
//!
//! | Offset | Size | Field              |
//! |--------|------|--------------------|
//! | 0      | 8    | write_index        |
//! | 8      | 8    | read_index         |
//! | 16     | 8    | error_count        |
//! | 24     | 4    | chunk_size         |
//! | 28     | 4    | num_slots          |
//! | 32     | 2    | num_channels       |
//! | 34     | 2    | flags              |
//! | 36     | 4    | sample_size        |
//! | 40     | 8    | buffer_stall_count |
//! | 48     | 16   | reserved           |
//!
//! # Ordering contract
//!
//! Publishing a slot is a release-store of `write_index`; observing a slot is
//! an acquire-load of `write_index`. Freeing a slot is a release-store of
//! `read_index`; observing free space is an acquire-load of `read_index`.
//! The release-store must be performed on the index word itself: a
//! fence-plus-relaxed-store is not an acceptable substitute on the publish
//! side, because the hardware may reorder a later relaxed store across the
//! fence. Counters and flags are relaxed; they carry no payload ordering.

use std::fs::OpenOptions;
use std::mem;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::chunk::IqSample;
use crate::error::{Result, StreamError};

/// Size of the ring header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Bytes per sample on the wire (complex int16: real then imaginary).
pub const SAMPLE_SIZE: u32 = 4;

/// Bit 0 of the header `flags` word: the writer will publish no more slots.
const FLAG_WRITER_DONE: u16 = 1 << 0;

/// Ring header, shared across processes through the file mapping.
///
/// `#[repr(C)]` with naturally aligned fields reproduces the wire offsets
/// exactly; a unit test pins every offset. The three u64 counters and the
/// flags word are atomics because both sides load them while the owning side
/// stores; the remaining metadata is written once at creation and read-only
/// afterwards.
#[repr(C)]
struct RingHeader {
    /// Next slot the writer will fill (free-running).
    write_index: AtomicU64,
    /// Next slot the reader will consume (free-running).
    read_index: AtomicU64,
    /// RX rings: producer overflows. TX rings: consumer underflows.
    error_count: AtomicU64,
    /// Samples per chunk per channel.
    chunk_size: u32,
    /// Number of slots in the ring.
    num_slots: u32,
    /// 1 or 2.
    num_channels: u16,
    /// Bit 0 = writer_done.
    flags: AtomicU16,
    /// Bytes per sample; always 4 (complex int16).
    sample_size: u32,
    /// RX rings: producer full-ring waits. TX rings: consumer empty events.
    buffer_stall_count: AtomicU64,
    /// Zeroed.
    _reserved: [u8; 16],
}

const _: () = assert!(
    mem::size_of::<RingHeader>() == HEADER_SIZE,
    "RingHeader size must equal HEADER_SIZE (64 bytes)"
);

/// Snapshot of a ring's progress counters, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub write_index: u64,
    pub read_index: u64,
    pub error_count: u64,
    pub writer_done: bool,
}

/// A single-producer single-consumer ring over a memory-mapped file.
///
/// One `SampleRing` value represents one side's attachment to the ring; it is
/// `Send` (a streaming task owns it) but deliberately not `Sync`, because the
/// protocol permits exactly one reader and one writer per ring and slot
/// access hands out slices tied to that single role.
pub struct SampleRing {
    path: PathBuf,
    /// Keeps the mapping alive; the raw pointers below point into it.
    mmap: MmapMut,
    /// SAFETY: points to the start of `mmap`, valid while `mmap` lives.
    header: *mut RingHeader,
    /// SAFETY: points `HEADER_SIZE` bytes into `mmap`, valid while `mmap` lives.
    slots: *mut u8,
    chunk_size: u32,
    num_slots: u32,
    num_channels: u16,
    /// `chunk_size × num_channels × SAMPLE_SIZE`, bounds-checked at open.
    chunk_bytes: usize,
}

// SAFETY: SampleRing owns its mapping; the raw pointers are only dereferenced
// through accessors that respect the acquire/release protocol, so moving the
// attachment to another thread is safe.
unsafe impl Send for SampleRing {}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("num_slots", &self.num_slots)
            .field("num_channels", &self.num_channels)
            .field("write_index", &self.write_index())
            .field("read_index", &self.read_index())
            .finish()
    }
}

impl SampleRing {
    /// Create a new ring file and attach as its owner.
    ///
    /// The file is sized to exactly `64 + num_slots × chunk_size ×
    /// num_channels × 4` bytes and the immutable metadata is written before
    /// either index moves. Creation fails if the path already exists; callers
    /// that tolerate stale files from a crashed predecessor delete them first
    /// (see [`delete_ring`]).
    pub fn create(
        path: &Path,
        chunk_size: u32,
        num_slots: u32,
        num_channels: u16,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StreamError::invalid_config("chunk_size must be nonzero"));
        }
        if num_slots == 0 {
            return Err(StreamError::invalid_config("num_slots must be nonzero"));
        }
        if !(1..=2).contains(&num_channels) {
            return Err(StreamError::invalid_config(format!(
                "num_channels must be 1 or 2, got {num_channels}"
            )));
        }

        let chunk_bytes = chunk_size as u64 * num_channels as u64 * SAMPLE_SIZE as u64;
        let total_size = HEADER_SIZE as u64 + num_slots as u64 * chunk_bytes;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(total_size)?;

        // SAFETY: the file was just created with `total_size` bytes.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        debug_assert!(mmap.len() >= total_size as usize);

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: the mapping is at least HEADER_SIZE bytes and `set_len`
        // zero-filled it, so the atomics already read as zero; only the
        // immutable metadata needs to be written.
        unsafe {
            (*header).chunk_size = chunk_size;
            (*header).num_slots = num_slots;
            (*header).num_channels = num_channels;
            (*header).sample_size = SAMPLE_SIZE;
        }

        // SAFETY: total_size includes HEADER_SIZE, so the offset is in bounds.
        let slots = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        debug!(
            path = %path.display(),
            chunk_size,
            num_slots,
            num_channels,
            total_bytes = total_size,
            "created ring"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            slots,
            chunk_size,
            num_slots,
            num_channels,
            chunk_bytes: chunk_bytes as usize,
        })
    }

    /// Attach to an existing ring file, validating its header.
    ///
    /// Returns [`StreamError::RingAbsent`] if the path does not exist,
    /// [`StreamError::RingTooSmall`] if the file cannot hold a header, and
    /// [`StreamError::RingMalformed`] if the metadata violates the ring
    /// invariants or the slot region is truncated. All three are retried by
    /// the ring-open polling loop, since a peer may still be initialising
    /// the file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StreamError::RingAbsent {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(StreamError::RingTooSmall {
                path: path.to_path_buf(),
                len,
            });
        }

        // SAFETY: the file is at least HEADER_SIZE bytes.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: the mapping holds a full header; metadata fields are
        // written once by the creator, so plain reads are fine (a half
        // initialised header fails validation below and gets retried).
        let (chunk_size, num_slots, num_channels, sample_size) = unsafe {
            (
                (*header).chunk_size,
                (*header).num_slots,
                (*header).num_channels,
                (*header).sample_size,
            )
        };

        let malformed = |reason: String| StreamError::RingMalformed {
            path: path.to_path_buf(),
            reason,
        };

        if chunk_size == 0 {
            return Err(malformed("zero chunk_size".to_string()));
        }
        if num_slots == 0 {
            return Err(malformed("zero num_slots".to_string()));
        }
        if !(1..=2).contains(&num_channels) {
            return Err(malformed(format!("num_channels is {num_channels}")));
        }
        if sample_size != SAMPLE_SIZE {
            return Err(malformed(format!(
                "sample_size is {sample_size}, expected {SAMPLE_SIZE}"
            )));
        }

        let chunk_bytes = chunk_size as u64 * num_channels as u64 * SAMPLE_SIZE as u64;
        let required = HEADER_SIZE as u64 + num_slots as u64 * chunk_bytes;
        if len < required {
            return Err(malformed(format!(
                "slot region truncated: file is {len} bytes, geometry requires {required}"
            )));
        }

        // SAFETY: `required` includes HEADER_SIZE and len >= required.
        let slots = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
            slots,
            chunk_size,
            num_slots,
            num_channels,
            chunk_bytes: chunk_bytes as usize,
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: `header` points to the start of `mmap`, which outlives
        // `self`; the header was validated at attach time.
        unsafe { &*self.header }
    }

    /// Samples per chunk per channel.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of slots in the ring.
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Channel count (1 or 2).
    pub fn num_channels(&self) -> u16 {
        self.num_channels
    }

    /// Total samples in one slot: `chunk_size × num_channels`.
    pub fn samples_per_slot(&self) -> usize {
        self.chunk_size as usize * self.num_channels as usize
    }

    /// Filesystem path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire-load of the write index; pairs with the writer's publish.
    pub fn write_index(&self) -> u64 {
        self.header().write_index.load(Ordering::Acquire)
    }

    /// Relaxed load of the write index; only valid on the writer side.
    pub fn write_index_relaxed(&self) -> u64 {
        self.header().write_index.load(Ordering::Relaxed)
    }

    /// Publish all slots below `value` with a release-store of the index.
    pub fn store_write_index(&self, value: u64) {
        self.header().write_index.store(value, Ordering::Release);
    }

    /// Acquire-load of the read index; pairs with the reader's release.
    pub fn read_index(&self) -> u64 {
        self.header().read_index.load(Ordering::Acquire)
    }

    /// Relaxed load of the read index; only valid on the reader side.
    pub fn read_index_relaxed(&self) -> u64 {
        self.header().read_index.load(Ordering::Relaxed)
    }

    /// Return all slots below `value` to the writer with a release-store.
    pub fn store_read_index(&self, value: u64) {
        self.header().read_index.store(value, Ordering::Release);
    }

    /// Relaxed load of the overflow/underflow counter.
    pub fn error_count(&self) -> u64 {
        self.header().error_count.load(Ordering::Relaxed)
    }

    /// Producer-side bump of the overflow/underflow counter.
    pub fn record_errors(&self, n: u64) {
        self.header().error_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Relaxed load of the buffer-stall counter.
    pub fn buffer_stall_count(&self) -> u64 {
        self.header().buffer_stall_count.load(Ordering::Relaxed)
    }

    /// Consumer-side bump of the buffer-stall counter.
    pub fn record_stalls(&self, n: u64) {
        self.header()
            .buffer_stall_count
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Whether the writer has signalled that no more slots will be published.
    pub fn writer_done(&self) -> bool {
        self.header().flags.load(Ordering::Relaxed) & FLAG_WRITER_DONE != 0
    }

    /// Set the writer-done flag. Single read-modify-write on the flags word.
    pub fn set_writer_done(&self) {
        self.header()
            .flags
            .fetch_or(FLAG_WRITER_DONE, Ordering::Relaxed);
    }

    /// Whether at least one published slot is waiting to be consumed.
    ///
    /// The acquire-load of `write_index` is what makes the subsequent slot
    /// read see the writer's bytes.
    pub fn can_read(&self) -> bool {
        self.write_index() > self.read_index_relaxed()
    }

    /// Whether at least one free slot is available to the writer.
    pub fn can_write(&self) -> bool {
        self.write_index_relaxed() - self.read_index() < self.num_slots as u64
    }

    /// Published slot contents at `index` (reader side).
    ///
    /// Protocol invariant: the caller observed `index < write_index` via an
    /// acquire-load ([`can_read`](Self::can_read)) and has not yet released
    /// the slot, so the writer will not touch it while the slice is alive.
    pub fn slot(&self, index: u64) -> &[IqSample] {
        let offset = (index % self.num_slots as u64) as usize * self.chunk_bytes;
        debug_assert!(offset + self.chunk_bytes <= self.mmap.len() - HEADER_SIZE);
        // SAFETY: offset + chunk_bytes is within the slot region (validated
        // at attach time) and the protocol gives the reader exclusive access
        // to the published slot.
        unsafe {
            slice::from_raw_parts(
                self.slots.add(offset) as *const IqSample,
                self.samples_per_slot(),
            )
        }
    }

    /// Mutable slot storage at `index` (writer side).
    ///
    /// Protocol invariant: the caller observed `index − read_index <
    /// num_slots` via an acquire-load ([`can_write`](Self::can_write)), so
    /// the reader cannot observe the slot until the next release-store of
    /// `write_index`.
    pub fn slot_mut(&mut self, index: u64) -> &mut [IqSample] {
        let offset = (index % self.num_slots as u64) as usize * self.chunk_bytes;
        debug_assert!(offset + self.chunk_bytes <= self.mmap.len() - HEADER_SIZE);
        // SAFETY: as in `slot`, plus `&mut self` pins this side as the only
        // slot writer in this process.
        unsafe {
            slice::from_raw_parts_mut(
                self.slots.add(offset) as *mut IqSample,
                self.samples_per_slot(),
            )
        }
    }

    /// Snapshot of the progress counters.
    pub fn stats(&self) -> RingStats {
        RingStats {
            write_index: self.write_index(),
            read_index: self.read_index(),
            error_count: self.error_count(),
            writer_done: self.writer_done(),
        }
    }

    /// Flush the backing bytes and release the mapping.
    ///
    /// Must precede deletion of the backing file so no dangling mapping
    /// survives the unlink.
    pub fn sync_and_unmap(self) -> Result<()> {
        self.mmap.flush()?;
        debug!(path = %self.path.display(), "unmapped ring");
        Ok(())
    }
}

/// Read the progress counters of an existing ring file.
pub fn read_stats(path: &Path) -> Result<RingStats> {
    let ring = SampleRing::open(path)?;
    Ok(ring.stats())
}

/// Delete a ring file. Deleting an absent path is a no-op.
pub fn delete_ring(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted ring file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    fn scratch_ring(chunk_size: u32, num_slots: u32, num_channels: u16) -> (tempfile::TempDir, SampleRing) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ring");
        let ring = SampleRing::create(&path, chunk_size, num_slots, num_channels).unwrap();
        (dir, ring)
    }

    #[test]
    fn test_header_layout_matches_wire_offsets() {
        assert_eq!(offset_of!(RingHeader, write_index), 0);
        assert_eq!(offset_of!(RingHeader, read_index), 8);
        assert_eq!(offset_of!(RingHeader, error_count), 16);
        assert_eq!(offset_of!(RingHeader, chunk_size), 24);
        assert_eq!(offset_of!(RingHeader, num_slots), 28);
        assert_eq!(offset_of!(RingHeader, num_channels), 32);
        assert_eq!(offset_of!(RingHeader, flags), 34);
        assert_eq!(offset_of!(RingHeader, sample_size), 36);
        assert_eq!(offset_of!(RingHeader, buffer_stall_count), 40);
        assert_eq!(offset_of!(RingHeader, _reserved), 48);
        assert_eq!(mem::size_of::<RingHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_create_sizes_file_exactly() {
        let (dir, ring) = scratch_ring(256, 16, 2);
        let len = std::fs::metadata(ring.path()).unwrap().len();
        assert_eq!(len, 64 + 16 * 256 * 2 * 4);
        drop(ring);
        drop(dir);
    }

    #[test]
    fn test_create_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ring");
        std::fs::write(&path, b"stale").unwrap();
        let err = SampleRing::create(&path, 256, 16, 1).unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ring");
        assert!(SampleRing::create(&path, 0, 16, 1).is_err());
        assert!(SampleRing::create(&path, 256, 0, 1).is_err());
        assert!(SampleRing::create(&path, 256, 16, 3).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_open_roundtrip() {
        let (_dir, ring) = scratch_ring(128, 8, 2);
        let reopened = SampleRing::open(ring.path()).unwrap();
        assert_eq!(reopened.chunk_size(), 128);
        assert_eq!(reopened.num_slots(), 8);
        assert_eq!(reopened.num_channels(), 2);
        assert_eq!(reopened.samples_per_slot(), 256);
    }

    #[test]
    fn test_open_absent_and_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.ring");
        assert!(matches!(
            SampleRing::open(&path).unwrap_err(),
            StreamError::RingAbsent { .. }
        ));

        std::fs::write(&path, vec![0u8; 32]).unwrap();
        assert!(matches!(
            SampleRing::open(&path).unwrap_err(),
            StreamError::RingTooSmall { len: 32, .. }
        ));
    }

    #[test]
    fn test_open_rejects_malformed_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ring");

        // A zeroed header has zero chunk_size.
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(
            SampleRing::open(&path).unwrap_err(),
            StreamError::RingMalformed { .. }
        ));

        // Valid metadata but a truncated slot region.
        let mut header = vec![0u8; HEADER_SIZE];
        header[24..28].copy_from_slice(&256u32.to_le_bytes());
        header[28..32].copy_from_slice(&16u32.to_le_bytes());
        header[32..34].copy_from_slice(&1u16.to_le_bytes());
        header[36..40].copy_from_slice(&SAMPLE_SIZE.to_le_bytes());
        std::fs::write(&path, &header).unwrap();
        let err = SampleRing::open(&path).unwrap_err();
        assert!(matches!(err, StreamError::RingMalformed { .. }));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_read_write_window() {
        let (_dir, mut ring) = scratch_ring(4, 3, 1);
        assert!(!ring.can_read());
        assert!(ring.can_write());

        // Fill every slot.
        for i in 0..3u64 {
            assert!(ring.can_write());
            let value = i as i16;
            for s in ring.slot_mut(i) {
                *s = IqSample::new(value, -value);
            }
            ring.store_write_index(i + 1);
        }
        assert!(!ring.can_write());
        assert!(ring.can_read());

        // Drain one and the writer regains a slot.
        assert_eq!(ring.slot(0)[0], IqSample::new(0, 0));
        assert_eq!(ring.slot(1)[3], IqSample::new(1, -1));
        ring.store_read_index(1);
        assert!(ring.can_write());

        let stats = ring.stats();
        assert_eq!(stats.write_index, 3);
        assert_eq!(stats.read_index, 1);
        assert_eq!(stats.error_count, 0);
        assert!(!stats.writer_done);
    }

    #[test]
    fn test_slot_addressing_wraps() {
        let (_dir, mut ring) = scratch_ring(2, 4, 1);
        // Index 6 maps to slot 2.
        ring.slot_mut(6)[0] = IqSample::new(42, 7);
        assert_eq!(ring.slot(2)[0], IqSample::new(42, 7));
    }

    #[test]
    fn test_counters_and_flags() {
        let (_dir, ring) = scratch_ring(4, 2, 1);
        ring.record_errors(3);
        ring.record_errors(2);
        assert_eq!(ring.error_count(), 5);

        ring.record_stalls(1);
        assert_eq!(ring.buffer_stall_count(), 1);

        assert!(!ring.writer_done());
        ring.set_writer_done();
        assert!(ring.writer_done());
        // Idempotent.
        ring.set_writer_done();
        assert!(ring.writer_done());
    }

    #[test]
    fn test_counters_visible_across_attachments() {
        let (_dir, ring) = scratch_ring(4, 2, 1);
        let peer = SampleRing::open(ring.path()).unwrap();
        ring.record_errors(7);
        ring.set_writer_done();
        assert_eq!(peer.error_count(), 7);
        assert!(peer.writer_done());
    }

    #[test]
    fn test_delete_ring_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.ring");
        delete_ring(&path).unwrap();

        std::fs::write(&path, vec![0u8; 128]).unwrap();
        delete_ring(&path).unwrap();
        assert!(!path.exists());
        delete_ring(&path).unwrap();
    }

    #[test]
    fn test_read_stats_on_file() {
        let (_dir, ring) = scratch_ring(8, 4, 1);
        ring.store_write_index(2);
        ring.store_read_index(1);
        ring.record_errors(1);
        let stats = read_stats(ring.path()).unwrap();
        assert_eq!(
            stats,
            RingStats {
                write_index: 2,
                read_index: 1,
                error_count: 1,
                writer_done: false,
            }
        );
    }

    #[test]
    fn test_sync_and_unmap_then_delete() {
        let (_dir, ring) = scratch_ring(8, 4, 1);
        let path = ring.path().to_path_buf();
        ring.sync_and_unmap().unwrap();
        delete_ring(&path).unwrap();
        assert!(!path.exists());
    }
}
