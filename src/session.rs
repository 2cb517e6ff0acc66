//! Per-thread (or per-connection) sessions: the object-level API that sits
//! on top of the region/segment/sync-modify machinery below it.
//!
//! A session owns at most one `Active` segment at a time and bump-allocates
//! into it. Reads go through [`ReadGuard`], which both retains the logical
//! address for the duration of the borrow and participates in the
//! read-lock pipeline so the segment it points into can't be recycled out
//! from under it. Writes to an already-published object go through
//! [`ModifyGuard`], which is copy-on-write once the owning segment has been
//! finalized: mutating a finalized object allocates a fresh copy and moves
//! the logical address's control word to point at it, so concurrent
//! readers that already retained the old location keep seeing the old
//! bytes until they release it.

use std::cell::RefCell;
use std::sync::atomic::Ordering;

use crate::address::{max_ref_count, AllocHint, ControlSnapshot, LogicalAddress, Location};
use crate::cache::CacheDifficultyController;
use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::AllocError;
use crate::readlock::ReadLockTable;
use crate::region::SharedPointerTable;
use crate::ring::SpscRing;
use crate::segment::object_footprint as object_size_with_header;
use crate::segment::{ObjectHeader, SegmentMeta, SegmentPhase, SegmentStore, SyncHeader, NO_SESSION};

/// A small, fast, non-cryptographic PRNG (Lehmer/MCG variant) used only for
/// the cache-admission coin flip. Not suitable for anything security
/// sensitive; that's fine, nothing here is.
pub struct Lehmer64 {
    state: u128,
}

impl Lehmer64 {
    pub fn new(seed: u64) -> Self {
        // Must be odd for the multiplicative generator to have full period;
        // XOR in a fixed odd constant rather than rejecting even seeds.
        Self { state: (seed as u128) << 64 | 0xda3e_39cb_94b9_5bdb | 1 }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(0xda94_2042_e4dd_58b5);
        (self.state >> 64) as u64
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

/// A retained, read-only view of one object's current bytes.
pub struct ReadGuard<'a> {
    session: &'a Session<'a>,
    address: LogicalAddress,
    data: &'static [u8],
}

impl<'a> ReadGuard<'a> {
    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    pub fn address(&self) -> LogicalAddress {
        self.address
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.session.table.release(self.address);
        self.session.read_locks.end_read(self.session.id);
    }
}

/// Exclusive, in-place write access to an already-published object.
///
/// If the owning segment is still `Active` (this session's own segment),
/// the write lands in place. If it's `Finalized`, acquiring the guard
/// performs a copy-on-write: a fresh copy is bump-allocated into this
/// session's active segment, the control word is moved to the new
/// location, and `bytes_mut()` returns the new copy.
pub struct ModifyGuard<'a> {
    session: &'a Session<'a>,
    address: LogicalAddress,
    segment: u32,
    /// Byte offset of this object's `ObjectHeader` within the segment's
    /// payload region, so `Drop` can rewrite just the checksum field.
    header_offset: usize,
    data: &'static mut [u8],
    /// Held only on the in-place path (not copy-on-write, where nothing is
    /// being written into a segment another reader might concurrently sync).
    permit: Option<crate::syncmodify::ModifyGuard<'a>>,
}

impl ModifyGuard<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

impl Drop for ModifyGuard<'_> {
    fn drop(&mut self) {
        let checksum = if self.session.config.update_checksum_on_modify {
            xxhash_rust::xxh3::xxh3_64(self.data) as u32
        } else {
            0
        };
        match self.session.segments.payload(self.segment) {
            Ok(buf) => {
                let off = self.header_offset + ObjectHeader::CHECKSUM_OFFSET;
                buf[off..off + 4].copy_from_slice(&checksum.to_ne_bytes());
            }
            Err(e) => log::warn!("failed to update checksum for {:?} after modify: {e}", self.address),
        }
    }
}

struct SessionState {
    active_segment: Option<u32>,
    dirty: Vec<u32>,
}

pub struct Session<'a> {
    id: usize,
    table: &'a SharedPointerTable,
    segments: &'a SegmentStore,
    read_locks: &'a ReadLockTable,
    cache: &'a CacheDifficultyController,
    config: &'a RuntimeConfig,
    clock: &'a dyn Clock,
    rng: RefCell<Lehmer64>,
    state: RefCell<SessionState>,
    region: u16,
    read_cache_queue: SpscRing<LogicalAddress>,
}

impl<'a> Session<'a> {
    pub fn new(
        id: usize,
        region: u16,
        table: &'a SharedPointerTable,
        segments: &'a SegmentStore,
        read_locks: &'a ReadLockTable,
        cache: &'a CacheDifficultyController,
        config: &'a RuntimeConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        let seed = clock.now_micros() ^ ((id as u64) << 32) ^ 0x9E37_79B9_7F4A_7C15;
        Self {
            id,
            table,
            segments,
            read_locks,
            cache,
            config,
            clock,
            rng: RefCell::new(Lehmer64::new(seed)),
            state: RefCell::new(SessionState { active_segment: None, dirty: Vec::new() }),
            region,
            read_cache_queue: SpscRing::new(1024),
        }
    }

    fn ensure_active_segment(&self, needed: usize, new_segment: impl FnOnce() -> Result<u32, AllocError>) -> Result<u32, AllocError> {
        let mut state = self.state.borrow_mut();
        if let Some(seg) = state.active_segment {
            let meta = self.segments.meta(seg);
            let pos = meta.alloc_pos.load(Ordering::Relaxed) as usize;
            if pos + needed <= self.segments.segment_size() - SyncHeader::SIZE {
                return Ok(seg);
            }
            // Out of room: finalize and fall through to get a fresh one.
            self.finalize_segment_locked(&mut state, seg);
        }
        if state.dirty.len() >= self.config.max_dirty_segments {
            return Err(AllocError::DirtyQueueOverflow { max: self.config.max_dirty_segments });
        }
        let seg = new_segment()?;
        let meta = self.segments.meta(seg);
        if !meta.cas_phase(SegmentPhase::Free, SegmentPhase::Active) {
            return Err(AllocError::Other("freshly created segment was not Free"));
        }
        meta.session_id.store(self.id as u32, Ordering::Relaxed);
        meta.created_at_micros.store(self.clock.now_micros(), Ordering::Relaxed);
        meta.provider_sequence.store(self.segments.next_provider_sequence(), Ordering::Relaxed);
        state.active_segment = Some(seg);
        if !state.dirty.contains(&seg) {
            state.dirty.push(seg);
        }
        Ok(seg)
    }

    fn finalize_segment_locked(&self, state: &mut SessionState, seg: u32) {
        let meta = self.segments.meta(seg);
        meta.finalized_at_micros.store(self.clock.now_micros(), Ordering::Relaxed);
        meta.cas_phase(SegmentPhase::Active, SegmentPhase::Finalized);
        meta.session_id.store(NO_SESSION, Ordering::Relaxed);
        if state.active_segment == Some(seg) {
            state.active_segment = None;
        }
    }

    /// Allocate a new object, writing `payload` into it, and return its
    /// freshly-minted logical address.
    pub fn alloc(&self, payload: &[u8]) -> Result<LogicalAddress, AllocError> {
        let header_len = std::mem::size_of::<ObjectHeader>();
        let total = object_size_with_header(payload.len());
        let seg = self.ensure_active_segment(total, || self.segments.create_segment())?;
        let meta = self.segments.meta(seg);

        let offset = meta.alloc_pos.fetch_add(total as u32, Ordering::AcqRel) as usize;
        let buf = self.segments.payload(seg)?;
        let checksum = if self.config.checksum_commits {
            xxhash_rust::xxh3::xxh3_64(payload) as u32
        } else {
            0
        };
        let (addr, ctrl) = self.table.allocate(self.region, AllocHint { near: None })?;
        let header = ObjectHeader {
            size: payload.len() as u32,
            address_bits: addr.pack(),
            checksum,
        };
        buf[offset..offset + header_len].copy_from_slice(bytemuck::bytes_of(&header));
        buf[offset + header_len..offset + total].copy_from_slice(payload);

        // Physical location is recorded as a 64-byte-aligned offset from the
        // start of the mapped data store; segment base plus payload offset,
        // rounded down to the containing cacheline.
        let absolute = seg as u64 * self.segments.segment_size() as u64 + SyncHeader::SIZE as u64 + offset as u64;
        ctrl.publish(Location(absolute - (absolute % 64)));
        meta.record_live(total as u64, 0);
        Ok(addr)
    }

    /// Retain `address` for reading.
    pub fn read(&'a self, address: LogicalAddress) -> Result<ReadGuard<'a>, AllocError> {
        self.read_locks.begin_read(self.id);
        let ctrl = self.table.get(address);
        if let Err(e) = ctrl.retain(max_ref_count(self.config.max_sessions)) {
            self.read_locks.end_read(self.id);
            return Err(e);
        }
        let promote = ctrl.try_inc_activity();
        let ControlSnapshot { location, .. } = ctrl.load(Ordering::Acquire);
        let data = self.read_object_bytes(location)?;
        if promote && self.config.cache_on_read {
            let _ = self.read_cache_queue.push(address);
            let draw = self.rng.borrow_mut().next_u32();
            if self.cache.should_cache(draw, data.len()) {
                self.cache.report(data.len() as u64, self.clock.now_micros());
            }
        }
        Ok(ReadGuard { session: self, address, data })
    }

    fn read_object_bytes(&self, location: Location) -> Result<&'static [u8], AllocError> {
        let seg = (location.0 / self.segments.segment_size() as u64) as u32;
        let offset_in_segment = (location.0 % self.segments.segment_size() as u64) as usize;
        let raw = self.segments.raw(seg)?;
        let header_len = std::mem::size_of::<ObjectHeader>();
        let payload_off = offset_in_segment - SyncHeader::SIZE;
        let header: ObjectHeader =
            bytemuck::try_pod_read_unaligned(&raw[offset_in_segment..offset_in_segment + header_len])
                .map_err(|_| AllocError::InvalidAccess { offset: offset_in_segment, len: header_len })?;
        let start = payload_off + header_len;
        let end = start + header.size as usize;
        Ok(&self.segments.payload(seg)?[start..end])
    }

    /// Acquire exclusive write access, copy-on-write if the object's
    /// segment has already been finalized.
    pub fn modify(&'a self, address: LogicalAddress) -> Result<ModifyGuard<'a>, AllocError> {
        let ctrl = self.table.get(address);
        let snap = ctrl.load(Ordering::Acquire);
        let seg = (snap.location.0 / self.segments.segment_size() as u64) as u32;
        let meta = self.segments.meta(seg);

        if meta.phase() == SegmentPhase::Active {
            if let Some(permit) = meta.sync_modify.try_modify() {
                let offset_in_segment = (snap.location.0 % self.segments.segment_size() as u64) as usize;
                let header_offset = offset_in_segment - SyncHeader::SIZE;
                let data = self.read_object_bytes(snap.location)?;
                let ptr = data.as_ptr() as *mut u8;
                let data = unsafe { std::slice::from_raw_parts_mut(ptr, data.len()) };
                return Ok(ModifyGuard { session: self, address, segment: seg, header_offset, data, permit: Some(permit) });
            }
        }

        // Copy-on-write path: read the current bytes, allocate a fresh copy,
        // then move the control word to point at it.
        let current = self.read_object_bytes(snap.location)?.to_vec();
        let header_len = std::mem::size_of::<ObjectHeader>();
        let total = object_size_with_header(current.len());
        let new_seg = self.ensure_active_segment(total, || self.segments.create_segment())?;
        let new_meta = self.segments.meta(new_seg);
        let offset = new_meta.alloc_pos.fetch_add(total as u32, Ordering::AcqRel) as usize;
        let buf = self.segments.payload(new_seg)?;
        let header = ObjectHeader {
            size: current.len() as u32,
            address_bits: address.pack(),
            checksum: if self.config.checksum_commits {
                xxhash_rust::xxh3::xxh3_64(&current) as u32
            } else {
                0
            },
        };
        buf[offset..offset + header_len].copy_from_slice(bytemuck::bytes_of(&header));
        buf[offset + header_len..offset + total].copy_from_slice(&current);
        let absolute = new_seg as u64 * self.segments.segment_size() as u64 + SyncHeader::SIZE as u64 + offset as u64;
        let new_location = Location(absolute - (absolute % 64));

        if !ctrl.try_move(snap.location, new_location) {
            return Err(AllocError::Other("concurrent move raced this modify"));
        }
        meta.record_free(object_size_with_header(current.len()) as u64);
        new_meta.record_live(total as u64, meta.vage_average());

        let data = self.segments.payload(new_seg)?;
        let data = &mut data[offset + header_len..offset + total];
        Ok(ModifyGuard { session: self, address, segment: new_seg, header_offset: offset, data, permit: None })
    }

    /// Release a reference to `address`, freeing its storage if this was
    /// the last one.
    pub fn release(&self, address: LogicalAddress) {
        if self.table.release(address) {
            let ctrl = self.table.get(address);
            let snap = ctrl.load(Ordering::Acquire);
            let seg = (snap.location.0 / self.segments.segment_size() as u64) as u32;
            if let Ok(header) = self.read_object_header_for_free(address, snap.location) {
                self.segments.meta(seg).record_free(object_size_with_header(header.size as usize) as u64);
            }
            ctrl.clear();
            self.table.free(address);
        }
    }

    /// Same as `alloc`, but reuses `address`'s existing control word instead
    /// of minting a new one. The old location's bytes are logged as freed in
    /// the owning segment's meta counters; the new bytes are bump-allocated
    /// fresh and the control word's location is swung over with CAS. A
    /// concurrent compactor move between the read and the CAS means the
    /// bytes just written are dead on arrival; they're recorded as such and
    /// the whole attempt retries against the now-current location.
    pub fn realloc(&self, address: LogicalAddress, payload: &[u8]) -> Result<(), AllocError> {
        let ctrl = self.table.get(address);
        let header_len = std::mem::size_of::<ObjectHeader>();
        let total = object_size_with_header(payload.len());
        loop {
            let snap = ctrl.load(Ordering::Acquire);
            let old_seg = (snap.location.0 / self.segments.segment_size() as u64) as u32;

            let seg = self.ensure_active_segment(total, || self.segments.create_segment())?;
            let meta = self.segments.meta(seg);
            let offset = meta.alloc_pos.fetch_add(total as u32, Ordering::AcqRel) as usize;
            let buf = self.segments.payload(seg)?;
            let checksum = if self.config.checksum_commits {
                xxhash_rust::xxh3::xxh3_64(payload) as u32
            } else {
                0
            };
            let header = ObjectHeader { size: payload.len() as u32, address_bits: address.pack(), checksum };
            buf[offset..offset + header_len].copy_from_slice(bytemuck::bytes_of(&header));
            buf[offset + header_len..offset + total].copy_from_slice(payload);
            let absolute = seg as u64 * self.segments.segment_size() as u64 + SyncHeader::SIZE as u64 + offset as u64;
            let new_location = Location(absolute - (absolute % 64));

            if ctrl.try_move(snap.location, new_location) {
                if let Ok(old_header) = self.read_object_header_for_free(address, snap.location) {
                    self.segments.meta(old_seg).record_free(object_size_with_header(old_header.size as usize) as u64);
                }
                meta.record_live(total as u64, 0);
                return Ok(());
            }
            meta.record_dead_on_arrival(total as u64);
        }
    }

    /// Rewind the active segment's bump pointer by `size` bytes (post
    /// header/alignment rounding), but only if the most recent allocation
    /// into it was exactly that size. For abort paths: undoes an `alloc`
    /// before anything else has been appended on top of it. Returns `false`
    /// if there is no active segment or the rewind doesn't line up, in
    /// which case the caller must fall back to a normal `release`.
    pub fn unalloc(&self, size: usize) -> bool {
        let total = object_size_with_header(size) as u32;
        let state = self.state.borrow();
        let Some(seg) = state.active_segment else { return false };
        let meta = self.segments.meta(seg);
        let pos = meta.alloc_pos.load(Ordering::Relaxed);
        if pos < total {
            return false;
        }
        meta.alloc_pos.compare_exchange(pos, pos - total, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    fn read_object_header_for_free(&self, _address: LogicalAddress, location: Location) -> Result<ObjectHeader, AllocError> {
        let seg = (location.0 / self.segments.segment_size() as u64) as u32;
        let offset_in_segment = (location.0 % self.segments.segment_size() as u64) as usize;
        let header_len = std::mem::size_of::<ObjectHeader>();
        let raw = self.segments.raw(seg)?;
        bytemuck::try_pod_read_unaligned(&raw[offset_in_segment..offset_in_segment + header_len])
            .map_err(|_| AllocError::InvalidAccess { offset: offset_in_segment, len: header_len })
    }

    /// Finalize and sync every segment this session has written to since
    /// the last call.
    pub fn sync(&self) -> Result<(), AllocError> {
        let segs: Vec<u32> = {
            let mut state = self.state.borrow_mut();
            if let Some(active) = state.active_segment.take() {
                self.finalize_segment_locked(&mut state, active);
            }
            std::mem::take(&mut state.dirty)
        };
        for seg in segs {
            let meta = self.segments.meta(seg);
            let permit = meta.sync_modify.start_sync();
            let alloc_pos = meta.alloc_pos.load(Ordering::Relaxed);
            let checksum = if self.config.checksum_commits {
                let payload = self.segments.payload(seg)?;
                xxhash_rust::xxh3::xxh3_64(&payload[..alloc_pos as usize]) as u32
            } else {
                0
            };
            let header = SyncHeader {
                magic: crate::segment::SYNC_MAGIC,
                is_pinned: meta.is_pinned.load(Ordering::Relaxed) as u8,
                is_finalized: 1,
                _pad: 0,
                provider_sequence: meta.provider_sequence.load(Ordering::Relaxed),
                alloc_pos,
                checksum,
            };
            self.segments.write_sync_header(seg, header)?;
            match self.config.sync_mode {
                crate::config::SyncMode::None => {}
                _ => self.segments.flush_segment(seg)?,
            }
            self.segments.protect_finalized_range(seg)?;
            drop(permit);
        }
        Ok(())
    }

    pub fn drain_read_cache_hints(&self, mut f: impl FnMut(LogicalAddress)) {
        while let Some(addr) = self.read_cache_queue.pop() {
            f(addr);
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.read_locks.release_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMap;
    use crate::clock::FakeClock;
    use crate::config::RuntimeConfig;

    fn harness() -> (SharedPointerTable, SegmentStore, ReadLockTable, CacheDifficultyController, RuntimeConfig, FakeClock, u16) {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = SegmentStore::new(blocks, 64);
        let read_locks = ReadLockTable::new(4, 64);
        let config = RuntimeConfig { segment_size: 4096, ..RuntimeConfig::default() };
        let cache = CacheDifficultyController::new(1_000_000, 1_000_000, config.cache_tighten_ratio, config.cache_loosen_ratio, config.max_cacheable_object_size, 0);
        let clock = FakeClock::new(0);
        (table, segments, read_locks, cache, config, clock, region)
    }

    #[test]
    fn alloc_then_read_roundtrips_bytes() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"hello world").unwrap();
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"hello world");
    }

    #[test]
    fn modify_in_place_while_segment_still_active() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        {
            let mut m = session.modify(addr).unwrap();
            m.bytes_mut()[0] = b'X';
        }
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"Xbc");
    }

    #[test]
    fn modify_after_sync_copies_on_write() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        session.sync().unwrap();
        {
            let mut m = session.modify(addr).unwrap();
            m.bytes_mut()[0] = b'Z';
        }
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"Zbc");
    }

    #[test]
    fn modify_in_place_recomputes_the_checksum_when_configured() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let config = RuntimeConfig { update_checksum_on_modify: true, ..config };
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        {
            let mut m = session.modify(addr).unwrap();
            m.bytes_mut()[0] = b'X';
        }
        let snap = table.get(addr).load(Ordering::Relaxed);
        let seg = (snap.location.0 / segments.segment_size() as u64) as u32;
        let offset_in_segment = (snap.location.0 % segments.segment_size() as u64) as usize;
        let header: ObjectHeader =
            bytemuck::try_pod_read_unaligned(&segments.raw(seg).unwrap()[offset_in_segment..offset_in_segment + std::mem::size_of::<ObjectHeader>()]).unwrap();
        assert_eq!(header.checksum, xxhash_rust::xxh3::xxh3_64(b"Xbc") as u32);
    }

    #[test]
    fn modify_in_place_clears_the_checksum_when_not_configured() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        assert!(!config.update_checksum_on_modify);
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        {
            let mut m = session.modify(addr).unwrap();
            m.bytes_mut()[0] = b'X';
        }
        let snap = table.get(addr).load(Ordering::Relaxed);
        let seg = (snap.location.0 / segments.segment_size() as u64) as u32;
        let offset_in_segment = (snap.location.0 % segments.segment_size() as u64) as usize;
        let header: ObjectHeader =
            bytemuck::try_pod_read_unaligned(&segments.raw(seg).unwrap()[offset_in_segment..offset_in_segment + std::mem::size_of::<ObjectHeader>()]).unwrap();
        assert_eq!(header.checksum, 0);
    }

    #[test]
    fn release_drops_the_last_reference() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        session.release(addr);
        assert!(table.get(addr).load(Ordering::Relaxed).is_free());
    }

    #[test]
    fn realloc_reuses_the_address_and_frees_the_old_bytes() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let addr = session.alloc(b"abc").unwrap();
        session.realloc(addr, b"a much longer replacement payload").unwrap();
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"a much longer replacement payload");
    }

    #[test]
    fn unalloc_rewinds_the_bump_pointer_for_the_last_allocation() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let seg = session.ensure_active_segment(64, || segments.create_segment()).unwrap();
        let before = segments.meta(seg).alloc_pos.load(Ordering::Relaxed);
        let addr = session.alloc(b"abc").unwrap();
        assert!(session.unalloc(3));
        assert_eq!(segments.meta(seg).alloc_pos.load(Ordering::Relaxed), before);
        // The control word was never retracted, so a stale read still sees
        // the (now-overwritable) bytes; this is an abort-path primitive, not
        // a free.
        let _ = addr;
    }

    #[test]
    fn dirty_queue_overflow_is_reported_instead_of_growing_unbounded() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let config = RuntimeConfig { max_dirty_segments: 2, ..config };
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        // Each payload is sized to fill a whole 4096-byte segment, forcing a
        // fresh segment (and a new dirty-queue entry) per allocation.
        let payload = vec![0u8; 4096 - SyncHeader::SIZE - 64];
        session.alloc(&payload).unwrap();
        session.alloc(&payload).unwrap();
        let err = session.alloc(&payload).unwrap_err();
        assert!(matches!(err, AllocError::DirtyQueueOverflow { max: 2 }));
    }

    #[test]
    fn unalloc_refuses_to_rewind_a_mismatched_size() {
        let (table, segments, read_locks, cache, config, clock, region) = harness();
        let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
        let _ = session.alloc(b"abc").unwrap();
        assert!(!session.unalloc(4096));
    }
}
