//! Background compactor: scans `Finalized` segments whose freed fraction
//! has crossed the configured threshold, copies every still-live object out
//! into a fresh segment, and hands the drained segment to the provider for
//! reclamation once the read-lock pipeline says it's safe.
//!
//! A compaction pass never touches a segment's bytes in place - it only
//! ever reads them (an object might be concurrently modified-in-place by
//! its owning session right up until finalize, but finalize and compaction
//! candidacy are mutually exclusive: see [`crate::config::CompactablePredicate`]).
//! Moving a live object is a copy-then-CAS: the copy is written to the
//! destination first, and only published by moving the control word if
//! nothing raced us to free or move the object first.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::address::{ControlSnapshot, LogicalAddress, Location};
use crate::cache::CacheDifficultyController;
use crate::clock::Clock;
use crate::config::{CompactablePredicate, RuntimeConfig};
use crate::error::AllocError;
use crate::provider::ProviderState;
use crate::region::SharedPointerTable;
use crate::segment::{object_footprint, ObjectHeader, SegmentPhase, SegmentStore, SyncHeader};

pub struct Compactor<'a> {
    table: &'a SharedPointerTable,
    segments: &'a SegmentStore,
    provider: &'a ProviderState,
    cache: &'a CacheDifficultyController,
    config: &'a RuntimeConfig,
    clock: &'a dyn Clock,
    destination: Mutex<Option<u32>>,
}

impl<'a> Compactor<'a> {
    pub fn new(
        table: &'a SharedPointerTable,
        segments: &'a SegmentStore,
        provider: &'a ProviderState,
        cache: &'a CacheDifficultyController,
        config: &'a RuntimeConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self { table, segments, provider, cache, config, clock, destination: Mutex::new(None) }
    }

    fn is_candidate(&self, seg: u32) -> bool {
        let meta = self.segments.meta(seg);
        let phase_ok = match self.config.compactable_predicate {
            CompactablePredicate::Finalized => meta.phase() == SegmentPhase::Finalized,
            CompactablePredicate::ReadOnly => {
                matches!(meta.phase(), SegmentPhase::Finalized | SegmentPhase::Active)
            }
        };
        phase_ok && meta.freed_fraction_bps() >= self.config.compaction_threshold.apply(10_000)
    }

    /// One full pass: find candidates, drain each, queue drained segments
    /// for reclamation.
    pub fn run_pass(&self) -> usize {
        let mut drained = 0;
        let mut candidates = Vec::new();
        self.segments.for_each_segment(|seg, _| {
            if self.is_candidate(seg) {
                candidates.push(seg);
            }
        });
        for seg in candidates {
            if self.segments.meta(seg).cas_phase(SegmentPhase::Finalized, SegmentPhase::Compacting) {
                if let Err(e) = self.drain_segment(seg) {
                    log::warn!("compaction of segment {seg} failed: {e}");
                    self.segments.meta(seg).set_phase(SegmentPhase::Finalized);
                    continue;
                }
                self.provider.queue_reclaim(seg);
                drained += 1;
            }
        }
        drained
    }

    fn drain_segment(&self, seg: u32) -> Result<(), AllocError> {
        let alloc_pos = self.segments.meta(seg).alloc_pos.load(Ordering::Acquire) as usize;
        let mut cursor = 0usize;
        let header_len = std::mem::size_of::<ObjectHeader>();
        let segment_size = self.segments.segment_size();

        while cursor < alloc_pos {
            let buf = self.segments.payload(seg)?;
            let header: ObjectHeader = bytemuck::try_pod_read_unaligned(&buf[cursor..cursor + header_len])
                .map_err(|_| AllocError::InvalidAccess { offset: cursor, len: header_len })?;
            let footprint = object_footprint(header.size as usize);
            let address = LogicalAddress::unpack(header.address_bits);

            let expected_location = Location(
                seg as u64 * segment_size as u64 + SyncHeader::SIZE as u64 + cursor as u64,
            );
            self.try_migrate(address, expected_location, &buf[cursor + header_len..cursor + header_len + header.size as usize])?;

            cursor += footprint;
        }
        Ok(())
    }

    /// Copy `payload` into a fresh location and CAS the control word over
    /// to it; silently does nothing if the object is already gone or has
    /// already moved elsewhere (lost the race to a concurrent free/modify).
    fn try_migrate(&self, address: LogicalAddress, expected: Location, payload: &[u8]) -> Result<(), AllocError> {
        if address.is_null() {
            return Ok(());
        }
        let ctrl = self.table.get(address);
        let ControlSnapshot { location, refs, .. } = ctrl.load(Ordering::Acquire);
        if refs == 0 || location != expected {
            return Ok(());
        }

        let src_seg = (expected.0 / self.segments.segment_size() as u64) as u32;
        let src_vage = self.segments.meta(src_seg).vage_average();
        let new_location = self.write_copy(address, payload)?;

        if ctrl.try_move(expected, new_location) {
            self.segments.meta(src_seg).record_free(object_footprint(payload.len()) as u64);
            let dst_seg = (new_location.0 / self.segments.segment_size() as u64) as u32;
            self.segments.meta(dst_seg).record_live(object_footprint(payload.len()) as u64, src_vage + 1);

            if self.config.cache_on_read {
                self.cache.report(payload.len() as u64, self.clock.now_micros());
            }
        } else {
            // Lost the race (freed or moved by a concurrent modify); the
            // copy we just wrote is simply unreferenced garbage in the
            // destination segment, to be reclaimed on its own next pass.
            self.segments.meta((new_location.0 / self.segments.segment_size() as u64) as u32)
                .record_dead_on_arrival(object_footprint(payload.len()) as u64);
        }
        Ok(())
    }

    fn write_copy(&self, address: LogicalAddress, payload: &[u8]) -> Result<Location, AllocError> {
        let header_len = std::mem::size_of::<ObjectHeader>();
        let total = object_footprint(payload.len());
        let seg = self.ensure_destination(total)?;
        let meta = self.segments.meta(seg);
        let offset = meta.alloc_pos.fetch_add(total as u32, Ordering::AcqRel) as usize;
        let buf = self.segments.payload(seg)?;
        let header = ObjectHeader {
            address_bits: address.pack(),
            size: payload.len() as u32,
            checksum: if self.config.checksum_commits {
                xxhash_rust::xxh3::xxh3_64(payload) as u32
            } else {
                0
            },
        };
        buf[offset..offset + header_len].copy_from_slice(bytemuck::bytes_of(&header));
        buf[offset + header_len..offset + header_len + payload.len()].copy_from_slice(payload);
        let absolute = seg as u64 * self.segments.segment_size() as u64 + SyncHeader::SIZE as u64 + offset as u64;
        Ok(Location(absolute))
    }

    fn ensure_destination(&self, needed: usize) -> Result<u32, AllocError> {
        let mut dest = self.destination.lock().unwrap();
        if let Some(seg) = *dest {
            let meta = self.segments.meta(seg);
            let pos = meta.alloc_pos.load(Ordering::Relaxed) as usize;
            if pos + needed <= self.segments.segment_size() - SyncHeader::SIZE {
                return Ok(seg);
            }
            meta.set_phase(SegmentPhase::Finalized);
        }
        let seg = self.provider.take_or_create()?;
        self.segments.meta(seg).set_phase(SegmentPhase::Active);
        self.segments.meta(seg).provider_sequence.store(self.segments.next_provider_sequence(), Ordering::Relaxed);
        *dest = Some(seg);
        Ok(seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMap;
    use crate::clock::FakeClock;
    use crate::config::Ratio;
    use crate::readlock::ReadLockTable;
    use crate::session::Session;
    use std::sync::Arc;

    fn harness() -> (
        SharedPointerTable,
        u16,
        Arc<SegmentStore>,
        Arc<ProviderState>,
        CacheDifficultyController,
        RuntimeConfig,
        FakeClock,
    ) {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = Arc::new(SegmentStore::new(blocks, 64));
        let read_locks = Arc::new(ReadLockTable::new(4, 64));
        let provider = ProviderState::new(segments.clone(), read_locks, 16, 64);
        let mut config = RuntimeConfig { segment_size: 4096, ..RuntimeConfig::default() };
        config.compaction_threshold = Ratio::new(1, 4);
        let cache = CacheDifficultyController::new(1_000_000, 1_000_000, config.cache_tighten_ratio, config.cache_loosen_ratio, config.max_cacheable_object_size, 0);
        let clock = FakeClock::new(0);
        (table, region, segments, provider, cache, config, clock)
    }

    #[test]
    fn compaction_preserves_logical_addresses_and_bytes() {
        let (table, region, segments, provider, cache, config, clock) = harness();
        let session = Session::new(0, region, &table, &segments, provider.read_locks(), &cache, &config, &clock);
        let addr1 = session.alloc(b"keep-me").unwrap();
        let addr2 = session.alloc(b"drop-me").unwrap();
        session.release(addr2);
        session.sync().unwrap();

        let compactor = Compactor::new(&table, &segments, &provider, &cache, &config, &clock);
        let drained = compactor.run_pass();
        assert_eq!(drained, 1);

        let guard = session.read(addr1).unwrap();
        assert_eq!(guard.bytes(), b"keep-me");
    }
}
