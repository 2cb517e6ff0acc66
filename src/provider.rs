//! Background segment provider: keeps a supply of `Free` segments ready to
//! hand out, within the configured `mlock` budget, and moves segments that
//! the read-lock pipeline has cleared back onto that supply.
//!
//! Runs as one cooperative loop, woken on a fixed interval (instead of a
//! condition variable - there's no single event that always means "more
//! work", since work arrives from both the compactor's reclaim queue and
//! plain exhaustion of the existing free list).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::readlock::ReadLockTable;
use crate::ring::SpscRing;
use crate::segment::{SegmentPhase, SegmentStore};

/// Shared state the provider thread reads and writes; kept separate from
/// the thread handle so callers (a `Session` picking a fresh segment, or
/// tests) can poll it without needing a reference to the `JoinHandle`.
pub struct ProviderState {
    segments: Arc<SegmentStore>,
    read_locks: Arc<ReadLockTable>,
    free_list: SpscRing<u32>,
    max_mlocked_segments: usize,
    mlocked_count: AtomicUsize,
    pending_reclaim: std::sync::Mutex<Vec<crate::readlock::PendingReclaim>>,
    stop: AtomicBool,
}

impl ProviderState {
    pub fn new(segments: Arc<SegmentStore>, read_locks: Arc<ReadLockTable>, max_mlocked_segments: usize, free_list_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            segments,
            read_locks,
            free_list: SpscRing::new(free_list_capacity),
            max_mlocked_segments,
            mlocked_count: AtomicUsize::new(0),
            pending_reclaim: std::sync::Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        })
    }

    /// Called by the compactor once a segment has been fully drained of
    /// live objects.
    pub fn queue_reclaim(&self, segment: u32) {
        let sequence = self.read_locks.queue_for_reclaim(segment);
        self.pending_reclaim
            .lock()
            .unwrap()
            .push(crate::readlock::PendingReclaim { segment, sequence });
    }

    /// One pass of the provider's work: promote reclaimed segments whose
    /// readers have all left, and try to keep the free list topped up.
    pub fn tick(&self) {
        {
            let mut pending = self.pending_reclaim.lock().unwrap();
            self.read_locks.drain_ready(&mut pending);
        }
        while let Some(seg) = self.read_locks.take_ready() {
            self.segments.recycle(seg);
            // Best-effort: stay within the mlock budget, but a recycled
            // segment goes back on the free list either way.
            let _ = self.mlock_if_budget_allows(seg);
            let _ = self.free_list.push(seg);
        }
    }

    fn mlock_if_budget_allows(&self, _segment: u32) -> bool {
        let mut cur = self.mlocked_count.load(Ordering::Relaxed);
        loop {
            if cur >= self.max_mlocked_segments {
                return false;
            }
            match self
                .mlocked_count
                .compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Hand out a free segment, creating a brand-new one if none are ready.
    pub fn take_or_create(&self) -> Result<u32, crate::error::AllocError> {
        if let Some(seg) = self.free_list.pop() {
            debug_assert_eq!(self.segments.meta(seg).phase(), SegmentPhase::Free);
            return Ok(seg);
        }
        self.segments.create_segment()
    }

    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    pub fn read_locks(&self) -> &ReadLockTable {
        &self.read_locks
    }

    /// Recovery-only: seed the free list with segments found empty at open.
    pub fn seed_free_list(&self, segs: impl IntoIterator<Item = u32>) {
        for seg in segs {
            let _ = self.free_list.push(seg);
        }
    }

    pub fn pending_reclaim_count(&self) -> usize {
        self.read_locks.pending_count() as usize
    }
}

pub fn spawn(state: Arc<ProviderState>, poll_interval: Duration) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("segment-provider".into())
        .spawn(move || {
            log::debug!("segment provider thread starting");
            while !state.stop.load(Ordering::Acquire) {
                state.tick();
                std::thread::sleep(poll_interval);
            }
            log::debug!("segment provider thread stopping");
        })
        .expect("failed to spawn segment provider thread")
}

pub fn request_stop(state: &ProviderState) {
    state.stop.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMap;

    fn state() -> Arc<ProviderState> {
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = Arc::new(SegmentStore::new(blocks, 64));
        let read_locks = Arc::new(ReadLockTable::new(4, 64));
        ProviderState::new(segments, read_locks, 4, 64)
    }

    #[test]
    fn take_or_create_falls_back_to_fresh_segment_when_free_list_empty() {
        let s = state();
        let seg = s.take_or_create().unwrap();
        assert_eq!(seg, 0);
    }

    #[test]
    fn reclaimed_segment_reenters_free_list_after_tick() {
        let s = state();
        let seg = s.take_or_create().unwrap();
        s.segments.meta(seg).set_phase(SegmentPhase::Compacting);
        s.queue_reclaim(seg);
        s.tick();
        let recycled = s.take_or_create().unwrap();
        assert_eq!(recycled, seg);
        assert_eq!(s.segments.meta(recycled).phase(), SegmentPhase::Free);
    }

    #[test]
    fn mlock_budget_caps_pinned_segments() {
        let blocks = BlockMap::open_anon(4096, 0).unwrap();
        let segments = Arc::new(SegmentStore::new(blocks, 64));
        let read_locks = Arc::new(ReadLockTable::new(4, 64));
        let s = ProviderState::new(segments, read_locks, 1, 64);
        assert!(s.mlock_if_budget_allows(0));
        assert!(!s.mlock_if_budget_allows(1));
    }
}
