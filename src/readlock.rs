//! The read-lock pipeline: lets the compactor/provider reclaim a segment's
//! physical space only once every session that might still hold a
//! reference into it has proven it doesn't.
//!
//! Each session owns a [`ReadLockSlot`]: while inside a read-section it
//! stores a snapshot of the global "reclamation sequence" counter taken at
//! entry; while outside one it clears its active bit and imposes no
//! constraint. A segment queued for reclamation with sequence `s` cannot be
//! recycled until every active session's snapshot is `< s` - i.e. every
//! session that was reading when the segment was queued has since left its
//! read-section (and therefore dropped whatever reference it might have
//! taken, and will take a fresh, newer snapshot next time it enters one).
//!
//! This makes checking reclaimability wait-free for the provider (a single
//! pass over fixed-size per-session slots, no locks) at the cost of a
//! slightly pessimistic bound: a session is blocked out as a reader for the
//! segment's entire read-section, not just while touching that segment.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::ring::SpscRing;

#[repr(align(64))]
struct PaddedSlot(AtomicU64);

/// One session's read-lock state, packed into a single `u64` so a session
/// can update it without taking any lock: bit 63 is "currently in a
/// read-section", the low 63 bits are the sequence snapshot.
pub struct ReadLockSlot(PaddedSlot);

impl ReadLockSlot {
    const ACTIVE_BIT: u64 = 1 << 63;

    pub fn new() -> Self {
        Self(PaddedSlot(AtomicU64::new(0)))
    }

    /// Enter a read-section, recording the current reclamation sequence.
    pub fn begin_read(&self, current_seq: u64) {
        self.0 .0.store((current_seq & !Self::ACTIVE_BIT) | Self::ACTIVE_BIT, Ordering::Release);
    }

    /// Leave the read-section. Stores the latest sequence so the next
    /// `begin_read` (or an idle reading of this slot) reflects how much
    /// progress has been made, though only the active bit actually matters
    /// once cleared.
    pub fn end_read(&self, current_seq: u64) {
        self.0 .0.store(current_seq & !Self::ACTIVE_BIT, Ordering::Release);
    }

    pub fn snapshot(&self) -> (bool, u64) {
        let bits = self.0 .0.load(Ordering::Acquire);
        (bits & Self::ACTIVE_BIT != 0, bits & !Self::ACTIVE_BIT)
    }
}

impl Default for ReadLockSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A segment number queued by the compactor, paired with the reclamation
/// sequence it was queued at.
#[derive(Clone, Copy, Debug)]
pub struct PendingReclaim {
    pub segment: u32,
    pub sequence: u64,
}

/// Fixed-capacity table of every session's read-lock slot, plus the SPMC
/// queue of segments waiting to become reclaimable.
pub struct ReadLockTable {
    slots: Vec<ReadLockSlot>,
    /// Which session ids are currently handed out. Indexed the same as
    /// `slots`; a session releases its slot back to this table when dropped,
    /// so the Nth *concurrent* session is what exhausts capacity, not the
    /// Nth session ever created.
    taken: Vec<AtomicBool>,
    next_sequence: AtomicU64,
    /// Segment numbers that passed their minimum-safe-view check and are
    /// now free for the provider to recycle.
    ready: SpscRing<u32>,
    pending_count: AtomicU32,
}

impl ReadLockTable {
    pub fn new(max_sessions: usize, ready_capacity: usize) -> Self {
        Self {
            slots: (0..max_sessions).map(|_| ReadLockSlot::new()).collect(),
            taken: (0..max_sessions).map(|_| AtomicBool::new(false)).collect(),
            next_sequence: AtomicU64::new(1),
            ready: SpscRing::new(ready_capacity),
            pending_count: AtomicU32::new(0),
        }
    }

    /// Claim the lowest-numbered free session id, or `None` if every slot is
    /// in use.
    pub fn acquire_session(&self) -> Option<usize> {
        self.taken
            .iter()
            .position(|slot| slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok())
    }

    /// Hand a session id back so a future `acquire_session` can reuse it.
    pub fn release_session(&self, session: usize) {
        self.taken[session].store(false, Ordering::Release);
    }

    pub fn slot(&self, session: usize) -> &ReadLockSlot {
        &self.slots[session]
    }

    fn current_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Acquire)
    }

    /// The smallest sequence snapshot any currently-active session is
    /// pinned to, or `u64::MAX` if no session is active.
    fn min_active_view(&self) -> u64 {
        let mut min = u64::MAX;
        for slot in &self.slots {
            let (active, view) = slot.snapshot();
            if active {
                min = min.min(view);
            }
        }
        min
    }

    /// Called by the compactor once it finishes draining a segment. The
    /// segment becomes eligible for recycling once every currently-active
    /// reader has left its read-section.
    pub fn queue_for_reclaim(&self, segment: u32) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        let _ = segment;
        sequence
    }

    /// Advance readiness: move any segment whose queuing sequence is now
    /// behind every active reader's view from `pending` into the ready
    /// ring. Intended to be polled by the provider thread.
    pub fn drain_ready(&self, pending: &mut Vec<PendingReclaim>) {
        let safe_below = self.min_active_view();
        pending.retain(|p| {
            if p.sequence < safe_below {
                let _ = self.ready.push(p.segment);
                self.pending_count.fetch_sub(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    /// Pop one segment that's fully clear of readers and ready to recycle.
    /// Safe to call from multiple provider-side threads.
    pub fn take_ready(&self) -> Option<u32> {
        self.ready.pop_concurrent()
    }

    pub fn pending_count(&self) -> u32 {
        self.pending_count.load(Ordering::Relaxed)
    }

    pub fn begin_read(&self, session: usize) {
        self.slots[session].begin_read(self.current_sequence());
    }

    pub fn end_read(&self, session: usize) {
        self.slots[session].end_read(self.current_sequence());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_reclaimable_only_after_active_readers_leave() {
        let table = ReadLockTable::new(4, 16);
        table.begin_read(0);
        let seq = table.queue_for_reclaim(42);
        let mut pending = vec![PendingReclaim { segment: 42, sequence: seq }];

        table.drain_ready(&mut pending);
        assert!(pending.iter().any(|p| p.segment == 42), "reader 0 is still active, must not be reclaimed");
        assert_eq!(table.take_ready(), None);

        table.end_read(0);
        table.drain_ready(&mut pending);
        assert!(pending.is_empty());
        assert_eq!(table.take_ready(), Some(42));
    }

    #[test]
    fn inactive_sessions_impose_no_constraint() {
        let table = ReadLockTable::new(4, 16);
        // No session ever begins a read.
        let seq = table.queue_for_reclaim(7);
        let mut pending = vec![PendingReclaim { segment: 7, sequence: seq }];
        table.drain_ready(&mut pending);
        assert!(pending.is_empty());
        assert_eq!(table.take_ready(), Some(7));
    }

    #[test]
    fn new_read_sections_only_pin_future_queue_entries() {
        let table = ReadLockTable::new(4, 16);
        table.begin_read(0);
        table.end_read(0);
        let seq = table.queue_for_reclaim(9);
        table.begin_read(1); // starts after 9 was queued, sees sequence > 9's
        let mut pending = vec![PendingReclaim { segment: 9, sequence: seq }];
        table.drain_ready(&mut pending);
        assert!(pending.is_empty(), "a read-section begun after queuing should not block it");
    }
}
