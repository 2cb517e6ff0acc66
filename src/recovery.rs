//! Crash recovery: rebuilds the shared-pointer table from scratch by
//! scanning every segment's sync header and object headers.
//!
//! The shared-pointer table is pure runtime state (it is never itself
//! written to disk as a mapped structure); only segment bytes and their
//! sync headers are durable. On a clean shutdown `open()` can skip this
//! scan entirely (nothing to reconcile); otherwise it's mandatory.
//!
//! Segments are visited from the highest `provider_sequence` down to the
//! lowest, so when the same logical address shows up in more than one
//! segment (the result of a copy-on-write move that happened before the
//! crash), the newest copy wins and the older one is counted as dead.

use crate::address::{LogicalAddress, Location};
use crate::config::RecoveryChecksumPolicy;
use crate::error::AllocError;
use crate::region::SharedPointerTable;
use crate::segment::{object_footprint, ObjectHeader, SegmentPhase, SegmentStore, SyncHeader, SYNC_MAGIC};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub segments_scanned: usize,
    pub segments_freed: usize,
    pub live_objects: usize,
    pub stale_objects: usize,
    /// Segment numbers found to have zero live objects, ready to be seeded
    /// back into the provider's free list.
    pub free_segments: Vec<u32>,
}

pub fn recover(
    table: &SharedPointerTable,
    segments: &SegmentStore,
    checksum_policy: RecoveryChecksumPolicy,
    verify_checksums: bool,
) -> Result<RecoveryReport, AllocError> {
    let mut report = RecoveryReport::default();
    let count = segments.segment_count();

    let mut order: Vec<u32> = (0..count).collect();
    order.sort_by_key(|&seg| std::cmp::Reverse(segments.meta(seg).provider_sequence.load(Ordering::Relaxed)));

    let mut claimed: HashSet<LogicalAddress> = HashSet::new();
    let mut max_sequence = 0u64;

    for seg in order {
        report.segments_scanned += 1;
        let header = match segments.read_sync_header(seg) {
            Ok(h) if h.magic == SYNC_MAGIC => h,
            _ => {
                // Never synced (or corrupt header): nothing recoverable here.
                segments.meta(seg).alloc_pos.store(0, Ordering::Relaxed);
                finish_empty_segment(segments, &mut report, seg);
                continue;
            }
        };
        segments.meta(seg).provider_sequence.store(header.provider_sequence, Ordering::Relaxed);
        max_sequence = max_sequence.max(header.provider_sequence);

        if verify_checksums {
            let payload = segments.payload(seg)?;
            let alloc_pos = (header.alloc_pos as usize).min(payload.len());
            let actual = xxhash_rust::xxh3::xxh3_64(&payload[..alloc_pos]) as u32;
            if actual != header.checksum {
                match checksum_policy {
                    RecoveryChecksumPolicy::TruncateAtLastGood => {
                        segments.meta(seg).alloc_pos.store(0, Ordering::Relaxed);
                        finish_empty_segment(segments, &mut report, seg);
                        continue;
                    }
                    RecoveryChecksumPolicy::Abort => {
                        return Err(AllocError::ChecksumMismatch { offset: seg as usize * segments.segment_size(), len: header.alloc_pos as usize });
                    }
                }
            }
        }

        let valid_len = scan_segment(table, segments, seg, header.alloc_pos as usize, verify_checksums, checksum_policy, &mut claimed, &mut report)?;
        segments.meta(seg).alloc_pos.store(valid_len as u32, Ordering::Relaxed);

        if header.is_finalized != 0 || valid_len > 0 {
            segments.meta(seg).set_phase(SegmentPhase::Finalized);
        }
        if segments.meta(seg).live_objects.load(Ordering::Relaxed) == 0 {
            finish_empty_segment(segments, &mut report, seg);
        }
    }

    segments.bump_provider_sequence_past(max_sequence);
    Ok(report)
}

fn finish_empty_segment(segments: &SegmentStore, report: &mut RecoveryReport, seg: u32) {
    segments.recycle(seg);
    report.segments_freed += 1;
    report.free_segments.push(seg);
}

#[allow(clippy::too_many_arguments)]
fn scan_segment(
    table: &SharedPointerTable,
    segments: &SegmentStore,
    seg: u32,
    alloc_pos: usize,
    verify_checksums: bool,
    checksum_policy: RecoveryChecksumPolicy,
    claimed: &mut HashSet<LogicalAddress>,
    report: &mut RecoveryReport,
) -> Result<usize, AllocError> {
    let header_len = std::mem::size_of::<ObjectHeader>();
    let segment_size = segments.segment_size();
    let mut cursor = 0usize;

    while cursor + header_len <= alloc_pos {
        let buf = segments.payload(seg)?;
        let header: ObjectHeader = match bytemuck::try_pod_read_unaligned(&buf[cursor..cursor + header_len]) {
            Ok(h) => h,
            Err(_) => break,
        };
        let footprint = object_footprint(header.size as usize);
        if cursor + footprint > alloc_pos {
            break;
        }
        let payload = &buf[cursor + header_len..cursor + header_len + header.size as usize];

        if verify_checksums {
            let actual = xxhash_rust::xxh3::xxh3_64(payload) as u32;
            if actual != header.checksum {
                match checksum_policy {
                    RecoveryChecksumPolicy::TruncateAtLastGood => break,
                    RecoveryChecksumPolicy::Abort => {
                        return Err(AllocError::ChecksumMismatch { offset: cursor, len: footprint });
                    }
                }
            }
        }

        let address = LogicalAddress::unpack(header.address_bits);
        let location = Location(seg as u64 * segment_size as u64 + SyncHeader::SIZE as u64 + cursor as u64);

        if !address.is_null() {
            if claimed.insert(address) {
                table.claim_for_recovery(address, location);
                segments.meta(seg).record_live(footprint as u64, 0);
                report.live_objects += 1;
            } else {
                segments.meta(seg).record_dead_on_arrival(footprint as u64);
                report.stale_objects += 1;
            }
        }

        cursor += footprint;
    }

    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMap;
    use crate::cache::CacheDifficultyController;
    use crate::clock::FakeClock;
    use crate::config::RuntimeConfig;
    use crate::readlock::ReadLockTable;
    use crate::session::Session;

    #[test]
    fn recovery_rebuilds_addresses_after_simulated_restart() {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = SegmentStore::new(blocks, 16);
        let read_locks = ReadLockTable::new(4, 16);
        let config = RuntimeConfig { segment_size: 4096, ..RuntimeConfig::default() };
        let cache = CacheDifficultyController::new(1_000_000, 1_000_000, config.cache_tighten_ratio, config.cache_loosen_ratio, config.max_cacheable_object_size, 0);
        let clock = FakeClock::new(0);

        let addr = {
            let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
            let addr = session.alloc(b"durable").unwrap();
            session.sync().unwrap();
            addr
        };

        // Simulate a restart: a fresh, empty shared-pointer table.
        let fresh_table = SharedPointerTable::new();
        let report = recover(&fresh_table, &segments, config.recovery_checksum_policy, config.checksum_commits).unwrap();
        assert_eq!(report.live_objects, 1);
        let ctrl = fresh_table.get(addr);
        assert_eq!(ctrl.load(Ordering::Relaxed).refs, 1);
    }

    #[test]
    fn segments_left_fully_empty_are_freed() {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = SegmentStore::new(blocks, 16);
        let read_locks = ReadLockTable::new(4, 16);
        let config = RuntimeConfig { segment_size: 4096, ..RuntimeConfig::default() };
        let cache = CacheDifficultyController::new(1_000_000, 1_000_000, config.cache_tighten_ratio, config.cache_loosen_ratio, config.max_cacheable_object_size, 0);
        let clock = FakeClock::new(0);

        {
            let session = Session::new(0, region, &table, &segments, &read_locks, &cache, &config, &clock);
            let addr = session.alloc(b"temp").unwrap();
            session.sync().unwrap();
            session.release(addr);
        }

        let fresh_table = SharedPointerTable::new();
        let report = recover(&fresh_table, &segments, config.recovery_checksum_policy, config.checksum_commits).unwrap();
        assert_eq!(report.live_objects, 0);
        assert_eq!(report.segments_freed, 1);
    }
}
