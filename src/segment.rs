//! Segments: the unit of mmap/sync/compaction, carved out of a [`BlockMap`].
//!
//! A segment is one block. Objects are bump-allocated into it by its owning
//! session; once the owner is done with it the segment is finalized (no more
//! allocations), synced to disk, and becomes eligible for compaction once
//! enough of its objects have been freed. [`SegmentMeta`] is the in-memory,
//! all-atomic state machine for one segment; [`ObjectHeader`] and
//! [`SyncHeader`] are its on-disk companions.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::block::BlockMap;
use crate::error::AllocError;
use crate::syncmodify::SyncModifyLock;
use crate::weighted_average::WeightedAverage;

pub const SYNC_MAGIC: u32 = 0x5347_4D54; // "SGMT"

/// Written immediately before every object's payload bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectHeader {
    pub address_bits: u64,
    pub size: u32,
    pub checksum: u32,
}

impl ObjectHeader {
    /// Byte offset of the `checksum` field within the header, for callers
    /// that need to rewrite just the checksum in place (e.g. a modify-guard
    /// drop) without re-encoding the whole header.
    pub const CHECKSUM_OFFSET: usize = std::mem::size_of::<u64>() + std::mem::size_of::<u32>();
}

/// Written at a fixed offset at the start of every segment. Rewritten each
/// time the segment is synced; read back at recovery to learn
/// `provider_sequence`/`alloc_pos` without scanning the whole segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SyncHeader {
    pub magic: u32,
    pub is_pinned: u8,
    pub is_finalized: u8,
    pub _pad: u16,
    pub provider_sequence: u64,
    pub alloc_pos: u32,
    pub checksum: u32,
}

impl SyncHeader {
    /// Reserved on-disk footprint, padded out to a cacheline so the object
    /// payload region that follows starts 64-byte aligned.
    pub const SIZE: usize = 64;
}

const _: () = assert!(std::mem::size_of::<SyncHeader>() <= SyncHeader::SIZE);

/// An object's total footprint (header + payload), rounded up to a multiple
/// of 64 bytes so bump allocation always leaves the next `Location`
/// cacheline aligned.
pub fn object_footprint(payload_len: usize) -> usize {
    let raw = std::mem::size_of::<ObjectHeader>() + payload_len;
    raw.div_ceil(64) * 64
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    /// Not handed to any session; sitting on the provider's free list.
    Free = 0,
    /// Owned by a session and being bump-allocated into.
    Active = 1,
    /// No more allocations will happen; waiting for (or mid-) sync.
    Finalized = 2,
    /// Currently being compacted: live objects are draining out of it.
    Compacting = 3,
    /// Emptied by the compactor and waiting to cycle back through the
    /// provider's read-lock-safe reclamation queue.
    Reclaiming = 4,
}

impl SegmentPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Active,
            2 => Self::Finalized,
            3 => Self::Compacting,
            4 => Self::Reclaiming,
            _ => unreachable!("corrupt segment phase byte"),
        }
    }
}

pub const NO_SESSION: u32 = u32::MAX;

/// All in-memory state for one segment. Every field is independently
/// atomic; callers coordinate via [`crate::syncmodify::SyncModifyLock`] for
/// anything that needs a consistent multi-field view.
pub struct SegmentMeta {
    phase: AtomicU8,
    /// Next free byte offset for bump allocation, relative to the start of
    /// the segment's payload region (after the `SyncHeader`).
    pub alloc_pos: AtomicU32,
    /// Pages below this offset have been mprotect'd read-only.
    pub first_writable_page: AtomicU32,
    pub session_id: AtomicU32,
    pub provider_sequence: AtomicU64,
    pub created_at_micros: AtomicU64,
    pub finalized_at_micros: AtomicU64,
    pub freed_bytes: AtomicU64,
    pub freed_objects: AtomicU64,
    pub live_objects: AtomicU64,
    pub is_pinned: std::sync::atomic::AtomicBool,
    vage: std::sync::Mutex<WeightedAverage>,
    pub sync_modify: SyncModifyLock,
}

impl SegmentMeta {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(SegmentPhase::Free as u8),
            alloc_pos: AtomicU32::new(0),
            first_writable_page: AtomicU32::new(0),
            session_id: AtomicU32::new(NO_SESSION),
            provider_sequence: AtomicU64::new(0),
            created_at_micros: AtomicU64::new(0),
            finalized_at_micros: AtomicU64::new(0),
            freed_bytes: AtomicU64::new(0),
            freed_objects: AtomicU64::new(0),
            live_objects: AtomicU64::new(0),
            is_pinned: std::sync::atomic::AtomicBool::new(false),
            vage: std::sync::Mutex::new(WeightedAverage::new()),
            sync_modify: SyncModifyLock::new(),
        }
    }

    pub fn phase(&self) -> SegmentPhase {
        SegmentPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: SegmentPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`; fails if another thread already
    /// moved it elsewhere.
    pub fn cas_phase(&self, from: SegmentPhase, to: SegmentPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_free(&self, bytes: u64) {
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.freed_objects.fetch_add(1, Ordering::Relaxed);
        self.live_objects.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bytes written but never published as live (e.g. a compaction copy
    /// that lost the race to a concurrent free/modify). Counts toward the
    /// freed fraction without an offsetting live-object count, since none
    /// was ever recorded for it.
    pub fn record_dead_on_arrival(&self, bytes: u64) {
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_live(&self, bytes: u64, vage: u64) {
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut w) = self.vage.lock() {
            w.add(bytes, vage);
        }
    }

    pub fn vage_average(&self) -> u64 {
        self.vage.lock().map(|w| w.average()).unwrap_or(0)
    }

    pub fn vage_sum_size(&self) -> u64 {
        self.vage.lock().map(|w| w.sum_size()).unwrap_or(0)
    }

    /// Fraction of the segment's allocated bytes that have been freed,
    /// scaled to `0..=10_000` (basis points) to avoid floating point.
    pub fn freed_fraction_bps(&self) -> u32 {
        let alloc = self.alloc_pos.load(Ordering::Relaxed) as u64;
        if alloc == 0 {
            return 0;
        }
        let freed = self.freed_bytes.load(Ordering::Relaxed);
        ((freed.saturating_mul(10_000)) / alloc) as u32
    }

    fn reset_for_reuse(&self) {
        self.alloc_pos.store(0, Ordering::Relaxed);
        self.first_writable_page.store(0, Ordering::Relaxed);
        self.session_id.store(NO_SESSION, Ordering::Relaxed);
        self.freed_bytes.store(0, Ordering::Relaxed);
        self.freed_objects.store(0, Ordering::Relaxed);
        self.live_objects.store(0, Ordering::Relaxed);
        self.is_pinned.store(false, Ordering::Relaxed);
        if let Ok(mut w) = self.vage.lock() {
            *w = WeightedAverage::new();
        }
        self.set_phase(SegmentPhase::Free);
    }
}

/// Owns the [`BlockMap`] backing every segment plus one [`SegmentMeta`] per
/// segment number. Segment numbers are never reused for a different
/// physical block: index `n` always maps to the `n`th block.
pub struct SegmentStore {
    blocks: BlockMap,
    meta: Vec<AtomicPtr<SegmentMeta>>,
    segment_size: usize,
    segment_count: AtomicU32,
    next_provider_sequence: AtomicU64,
}

impl SegmentStore {
    pub fn new(blocks: BlockMap, max_segments: usize) -> Self {
        let segment_size = blocks.block_size();
        let segment_count = blocks.block_count() as u32;
        Self {
            blocks,
            meta: (0..max_segments).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            segment_size,
            segment_count: AtomicU32::new(segment_count),
            next_provider_sequence: AtomicU64::new(1),
        }
    }

    /// Bump `next_provider_sequence` past every sequence recovery observed,
    /// so freshly-created segments never collide with a recovered one.
    pub fn bump_provider_sequence_past(&self, seen: u64) {
        let mut cur = self.next_provider_sequence.load(Ordering::Relaxed);
        while cur <= seen {
            match self.next_provider_sequence.compare_exchange_weak(cur, seen + 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count.load(Ordering::Acquire)
    }

    pub fn next_provider_sequence(&self) -> u64 {
        self.next_provider_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn meta_slot(&self, segment: u32) -> &AtomicPtr<SegmentMeta> {
        &self.meta[segment as usize]
    }

    fn ensure_meta(&self, segment: u32) -> &SegmentMeta {
        let slot = self.meta_slot(segment);
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Box::new(SegmentMeta::new()));
        match slot.compare_exchange(std::ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => unsafe { &*fresh },
            Err(actual) => {
                unsafe {
                    drop(Box::from_raw(fresh));
                }
                unsafe { &*actual }
            }
        }
    }

    /// Create a brand-new segment (growing the backing file by one block)
    /// and return its number.
    pub fn create_segment(&self) -> Result<u32, AllocError> {
        let block_num = self.blocks.alloc()?;
        if block_num >= self.meta.len() as u64 {
            return Err(AllocError::InvalidConfig("max_segments exceeded"));
        }
        let segment = block_num as u32;
        self.ensure_meta(segment);
        self.segment_count.fetch_add(1, Ordering::AcqRel);
        Ok(segment)
    }

    pub fn meta(&self, segment: u32) -> &SegmentMeta {
        self.ensure_meta(segment)
    }

    /// Reset a reclaimed segment so it can be handed out again as `Free`.
    /// Undoes any `mprotect(PROT_READ)` left over from its previous life as
    /// a finalized segment so the next owning session can bump-allocate
    /// into it.
    pub fn recycle(&self, segment: u32) {
        let whole = crate::block::BlockRange::new(segment as usize * self.segment_size, self.segment_size);
        if let Err(e) = self.blocks.protect_range(whole, false) {
            log::warn!("failed to restore write access to recycled segment {segment}: {e}");
        }
        self.meta(segment).reset_for_reuse();
    }

    /// Raw bytes for the whole segment, including the `SyncHeader` prefix.
    pub fn raw(&self, segment: u32) -> Result<&'static mut [u8], AllocError> {
        self.blocks.get(segment as u64)
    }

    /// Bytes available for object bump-allocation (after the header).
    pub fn payload(&self, segment: u32) -> Result<&'static mut [u8], AllocError> {
        Ok(&mut self.raw(segment)?[SyncHeader::SIZE..])
    }

    pub fn read_sync_header(&self, segment: u32) -> Result<SyncHeader, AllocError> {
        let raw = self.raw(segment)?;
        bytemuck::try_pod_read_unaligned(&raw[..SyncHeader::SIZE])
            .map_err(|_| AllocError::InvalidAccess { offset: 0, len: SyncHeader::SIZE })
    }

    pub fn write_sync_header(&self, segment: u32, header: SyncHeader) -> Result<(), AllocError> {
        let raw = self.raw(segment)?;
        raw[..SyncHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        Ok(())
    }

    pub fn flush_segment(&self, segment: u32) -> Result<(), AllocError> {
        self.blocks.flush_range(crate::block::BlockRange::new(
            segment as usize * self.segment_size,
            self.segment_size,
        ))
    }

    /// `mprotect` the payload bytes written since the last call to
    /// `PROT_READ`, advancing `first_writable_page` past them. Called once
    /// per segment at the end of finalize/sync, so a segment's bytes are
    /// immutable from that point on (copy-on-write is the only way to
    /// change them again).
    pub fn protect_finalized_range(&self, segment: u32) -> Result<(), AllocError> {
        let meta = self.meta(segment);
        let from = meta.first_writable_page.load(Ordering::Relaxed) as usize;
        let to = meta.alloc_pos.load(Ordering::Relaxed) as usize;
        if to <= from {
            return Ok(());
        }
        let abs_start = segment as usize * self.segment_size + SyncHeader::SIZE + from;
        self.blocks.protect_range(crate::block::BlockRange::new(abs_start, to - from), true)?;
        meta.first_writable_page.store(to as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Flush every mapped block to disk; a no-op for anonymous stores.
    pub fn flush_all(&self) -> Result<(), AllocError> {
        self.blocks.flush()
    }

    pub fn for_each_segment(&self, mut f: impl FnMut(u32, &SegmentMeta)) {
        let count = self.segment_count();
        for i in 0..count {
            if let Some(m) = self.existing_meta(i) {
                f(i, m);
            }
        }
    }

    fn existing_meta(&self, segment: u32) -> Option<&SegmentMeta> {
        let ptr = self.meta_slot(segment).load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

impl Drop for SegmentStore {
    fn drop(&mut self) {
        for slot in &self.meta {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

unsafe impl Send for SegmentStore {}
unsafe impl Sync for SegmentStore {}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(segment_size: usize, max_segments: usize) -> SegmentStore {
        let blocks = BlockMap::open_anon(segment_size, 0).unwrap();
        SegmentStore::new(blocks, max_segments)
    }

    #[test]
    fn create_segment_grows_block_map_in_lockstep() {
        let s = store(4096, 8);
        let a = s.create_segment().unwrap();
        let b = s.create_segment().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(s.segment_count(), 2);
        assert_eq!(s.raw(a).unwrap().len(), 4096);
    }

    #[test]
    fn phase_transitions_are_exclusive() {
        let s = store(4096, 4);
        let seg = s.create_segment().unwrap();
        let m = s.meta(seg);
        assert_eq!(m.phase(), SegmentPhase::Free);
        assert!(m.cas_phase(SegmentPhase::Free, SegmentPhase::Active));
        assert!(!m.cas_phase(SegmentPhase::Free, SegmentPhase::Active));
        assert_eq!(m.phase(), SegmentPhase::Active);
    }

    #[test]
    fn freed_fraction_tracks_bytes_freed_over_allocated() {
        let s = store(4096, 4);
        let seg = s.create_segment().unwrap();
        let m = s.meta(seg);
        m.alloc_pos.store(1000, Ordering::Relaxed);
        m.record_live(400, 1);
        m.record_live(600, 2);
        m.record_free(400);
        assert_eq!(m.freed_fraction_bps(), 4000);
    }

    #[test]
    fn recycle_resets_all_counters() {
        let s = store(4096, 4);
        let seg = s.create_segment().unwrap();
        let m = s.meta(seg);
        m.alloc_pos.store(2000, Ordering::Relaxed);
        m.record_live(100, 5);
        m.set_phase(SegmentPhase::Reclaiming);
        s.recycle(seg);
        let m = s.meta(seg);
        assert_eq!(m.phase(), SegmentPhase::Free);
        assert_eq!(m.alloc_pos.load(Ordering::Relaxed), 0);
        assert_eq!(m.vage_average(), 0);
    }
}
