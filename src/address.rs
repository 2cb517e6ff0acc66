//! Logical addresses and the per-address atomic control word.
//!
//! A [`LogicalAddress`] is the only thing callers above the allocator ever
//! hold onto. It never changes for the life of an object. Looking one up
//! through the shared-pointer table ([`crate::region::SharedPointerTable`])
//! yields a reference to a [`ControlWord`], whose `cacheline_offset` field is
//! the only thing that moves (when the compactor relocates the object).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AllocError;

/// A stable logical identifier: a 16-bit region plus a 24-bit index inside it.
///
/// Encoded as a 40-bit value (`region << 24 | index`) everywhere it's stored
/// packed into a header, but kept as two plain fields in memory since that's
/// both cheaper to work with and self-documenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalAddress {
    pub region: u16,
    pub index: u32,
}

/// Reserved address meaning "no object".
pub const NULL_ADDRESS: LogicalAddress = LogicalAddress {
    region: 0xFFFF,
    index: 0xFF_FFFF,
};

impl LogicalAddress {
    pub const INDEX_BITS: u32 = 24;
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    pub const fn new(region: u16, index: u32) -> Self {
        debug_assert!(index <= Self::INDEX_MASK);
        Self { region, index }
    }

    /// Pack into the 40-bit on-disk representation (low 40 bits of a `u64`).
    pub const fn pack(self) -> u64 {
        ((self.region as u64) << Self::INDEX_BITS) | (self.index as u64 & Self::INDEX_MASK as u64)
    }

    /// Unpack from the 40-bit on-disk representation.
    pub const fn unpack(bits: u64) -> Self {
        Self {
            region: (bits >> Self::INDEX_BITS) as u16,
            index: (bits & Self::INDEX_MASK as u64) as u32,
        }
    }

    pub const fn is_null(self) -> bool {
        self.region == NULL_ADDRESS.region && self.index == NULL_ADDRESS.index
    }
}

// --- Control word bit layout -------------------------------------------------
//
// | bits 0..21   | ref              | strong reference count               |
// | bits 21..62  | cacheline_offset | 64-byte-aligned physical location     |
// | bit  62      | active           | set on first read since ref rose from 0|
// | bit  63      | pending_cache    | set on a *second* read (promote signal)|

const REF_BITS: u32 = 21;
const LOCATION_BITS: u32 = 41;
const REF_MASK: u64 = (1 << REF_BITS) - 1;
const LOCATION_SHIFT: u32 = REF_BITS;
const LOCATION_MASK: u64 = ((1u64 << LOCATION_BITS) - 1) << LOCATION_SHIFT;
const ACTIVE_BIT: u64 = 1 << 62;
const PENDING_CACHE_BIT: u64 = 1 << 63;

/// Maximum concurrently-outstanding retains on a single address.
///
/// The usable maximum is `2^21 - max_threads`: each session's optimistic
/// `fetch_add` protocol can briefly overshoot by up to one per thread before
/// noticing and backing out, so the real ceiling is shaved down to leave
/// headroom.
pub fn max_ref_count(max_threads: usize) -> u64 {
    REF_MASK - max_threads as u64
}

/// A 64-byte-aligned physical location inside the mapped data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location(pub u64);

impl Location {
    pub const NULL: Location = Location(0);

    fn from_bits(bits: u64) -> Self {
        Location(((bits & LOCATION_MASK) >> LOCATION_SHIFT) * 64)
    }

    fn to_bits(self) -> u64 {
        debug_assert!(self.0 % 64 == 0);
        ((self.0 / 64) << LOCATION_SHIFT) & LOCATION_MASK
    }
}

/// A decoded snapshot of a [`ControlWord`]'s contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub refs: u64,
    pub location: Location,
    pub active: bool,
    pub pending_cache: bool,
}

impl ControlSnapshot {
    fn decode(bits: u64) -> Self {
        Self {
            refs: bits & REF_MASK,
            location: Location::from_bits(bits),
            active: bits & ACTIVE_BIT != 0,
            pending_cache: bits & PENDING_CACHE_BIT != 0,
        }
    }

    fn encode(self) -> u64 {
        (self.refs & REF_MASK)
            | self.location.to_bits()
            | if self.active { ACTIVE_BIT } else { 0 }
            | if self.pending_cache { PENDING_CACHE_BIT } else { 0 }
    }

    pub fn is_free(&self) -> bool {
        self.refs == 0
    }
}

/// The atomic control word backing one logical address.
///
/// `ref == 0` iff the address is on the allocator's freelist. Location
/// updates while `ref > 0` are performed with a compare-and-swap that fails
/// if the location has changed since it was last observed, which is how the
/// compactor's move loses gracefully to a concurrent allocation reuse (and
/// vice versa).
#[repr(transparent)]
pub struct ControlWord(AtomicU64);

impl ControlWord {
    pub const fn new_free() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self, order: Ordering) -> ControlSnapshot {
        ControlSnapshot::decode(self.0.load(order))
    }

    /// Publish a freshly-allocated object: `ref = 1`, at `location`, with
    /// activity bits clear. Uses `Release` ordering so a subsequent `Acquire`
    /// load by any reader observes the object's body, not just the word.
    pub fn publish(&self, location: Location) {
        let snap = ControlSnapshot {
            refs: 1,
            location,
            active: false,
            pending_cache: false,
        };
        self.0.store(snap.encode(), Ordering::Release);
    }

    /// Bump the reference count. Fails without mutating state if the count
    /// would exceed `max`.
    pub fn retain(&self, max: u64) -> Result<(), AllocError> {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let snap = ControlSnapshot::decode(cur);
            if snap.refs >= max {
                return Err(AllocError::RefCountSaturated);
            }
            let next = ControlSnapshot {
                refs: snap.refs + 1,
                ..snap
            }
            .encode();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Decrement the reference count, releasing with it. Returns `true` if
    /// this was the transition to zero (the address is now free and its
    /// activity bits have been cleared atomically with the drop to zero).
    pub fn release(&self) -> bool {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let snap = ControlSnapshot::decode(cur);
            debug_assert!(snap.refs > 0, "released an address with ref == 0");
            let to_zero = snap.refs == 1;
            let next = ControlSnapshot {
                refs: snap.refs - 1,
                active: if to_zero { false } else { snap.active },
                pending_cache: if to_zero { false } else { snap.pending_cache },
                ..snap
            }
            .encode();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return to_zero,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS the location, failing if `expected` no longer matches (a
    /// concurrent mover or a concurrent free/reallocation raced us).
    pub fn try_move(&self, expected: Location, new_location: Location) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let snap = ControlSnapshot::decode(cur);
            if snap.location != expected || snap.refs == 0 {
                return false;
            }
            let next = ControlSnapshot {
                location: new_location,
                ..snap
            }
            .encode();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// `free` requires the caller to have already observed `ref == 0`; this
    /// just resets the word to the canonical free value so the next
    /// allocation starts from a clean slate.
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// The second-read cache-promotion signal: sets `active` if clear, else
    /// sets `pending_cache` if clear, else returns `false`. Only the second
    /// observed read within the lifetime of a given ref count promotes.
    pub fn try_inc_activity(&self) -> bool {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let snap = ControlSnapshot::decode(cur);
            if snap.refs == 0 {
                return false;
            }
            if !snap.active {
                let next = ControlSnapshot { active: true, ..snap }.encode();
                match self
                    .0
                    .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => return false,
                    Err(observed) => {
                        cur = observed;
                        continue;
                    }
                }
            }
            if !snap.pending_cache {
                let next = ControlSnapshot { pending_cache: true, ..snap }.encode();
                match self
                    .0
                    .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => return true,
                    Err(observed) => {
                        cur = observed;
                        continue;
                    }
                }
            }
            return false;
        }
    }

    /// Used only by recovery: clamp every ref count above 1 down to 1, so
    /// the subsequent reachability pass can re-derive the true counts from
    /// scratch via `retain`.
    pub fn reset_ref_above_one_to_one(&self) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let snap = ControlSnapshot::decode(cur);
            if snap.refs <= 1 {
                return;
            }
            let next = ControlSnapshot { refs: 1, ..snap }.encode();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Clear `active`/`pending_cache` so an object has to be observed again
    /// before it can re-earn cache promotion. Run periodically by the
    /// background decay sweep; a no-op once the word is already quiescent.
    pub fn decay_activity(&self) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let snap = ControlSnapshot::decode(cur);
            if !snap.active && !snap.pending_cache {
                return;
            }
            let next = ControlSnapshot { active: false, pending_cache: false, ..snap }.encode();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_pack_roundtrip() {
        let a = LogicalAddress::new(0x1234, 0x00AB_CDEF & LogicalAddress::INDEX_MASK);
        assert_eq!(LogicalAddress::unpack(a.pack()), a);
    }

    #[test]
    fn control_word_lifecycle() {
        let w = ControlWord::new_free();
        assert!(w.load(Ordering::Relaxed).is_free());
        w.publish(Location(64));
        let snap = w.load(Ordering::Relaxed);
        assert_eq!(snap.refs, 1);
        assert_eq!(snap.location, Location(64));
        assert!(!snap.active);

        w.retain(max_ref_count(64)).unwrap();
        assert_eq!(w.load(Ordering::Relaxed).refs, 2);

        assert!(!w.release());
        assert!(w.release());
        assert!(w.load(Ordering::Relaxed).is_free());
    }

    #[test]
    fn activity_second_read_promotes() {
        let w = ControlWord::new_free();
        w.publish(Location(128));
        assert!(!w.try_inc_activity());
        assert!(w.try_inc_activity());
        // Further reads don't re-trigger until ref drops back to zero.
        assert!(!w.try_inc_activity());
        w.release();
        let snap = w.load(Ordering::Relaxed);
        assert!(!snap.active && !snap.pending_cache);
    }

    #[test]
    fn move_fails_on_stale_expected_location() {
        let w = ControlWord::new_free();
        w.publish(Location(64));
        assert!(w.try_move(Location(64), Location(128)));
        assert!(!w.try_move(Location(64), Location(192)));
        assert_eq!(w.load(Ordering::Relaxed).location, Location(128));
    }

    #[test]
    fn ref_count_saturates() {
        let w = ControlWord::new_free();
        w.publish(Location(0));
        let max = 3u64;
        w.retain(max).unwrap();
        w.retain(max).unwrap();
        assert!(matches!(w.retain(max), Err(AllocError::RefCountSaturated)));
    }
}
