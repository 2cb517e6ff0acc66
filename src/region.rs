//! The shared-pointer table: allocates stable [`LogicalAddress`]es and maps
//! them to [`ControlWord`]s.
//!
//! Three cascading bitmap levels mirror the trichotomy in the design
//! document: a region-wide summary picks a page with free control words, a
//! per-page cacheline bitmap picks a group of 64 words, and a per-group word
//! picks the actual slot. Every level is cleared (on allocate) or set (on
//! free) with a CAS, and a level that becomes fully empty or newly non-empty
//! propagates that fact to its parent.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::address::{ControlWord, LogicalAddress};
use crate::error::AllocError;

/// Control words per page: 64 per cacheline-group, 8 groups.
const WORDS_PER_GROUP: usize = 64;
const GROUPS_PER_PAGE: usize = 8;
const WORDS_PER_PAGE: usize = WORDS_PER_GROUP * GROUPS_PER_PAGE;

/// `2^24 / WORDS_PER_PAGE`: the exact number of pages needed to cover the
/// full 24-bit index space of a region.
const MAX_PAGES_PER_REGION: usize = (1 << LogicalAddress::INDEX_BITS) / WORDS_PER_PAGE;
const PAGE_FREE_WORDS: usize = MAX_PAGES_PER_REGION / 64;
const PAGE_SUMMARY_WORDS: usize = PAGE_FREE_WORDS.div_ceil(64);

/// The maximum number of regions a single table supports (`region` is 16 bits).
const MAX_REGIONS: usize = 1 << 16;

/// An optional set of nearby addresses that biases allocation toward the
/// same page, for prefetch/cacheline locality.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHint {
    pub near: Option<LogicalAddress>,
}

/// Clear bit `bit` in `word`; if the word becomes zero, clear the
/// corresponding bit in `summary`. Returns `false` if the bit was already
/// clear (a race; the caller should retry against a different bit).
fn clear_with_propagate(word: &AtomicU64, bit: u32, summary: &AtomicU64, summary_bit: u32) -> bool {
    let mask = 1u64 << bit;
    let prev = word.fetch_and(!mask, Ordering::AcqRel);
    if prev & mask == 0 {
        return false;
    }
    if prev & !mask == 0 {
        summary.fetch_and(!(1u64 << summary_bit), Ordering::AcqRel);
    }
    true
}

/// Set bit `bit` in `word`; if the word was previously zero, set the
/// corresponding bit in `summary`.
fn set_with_propagate(word: &AtomicU64, bit: u32, summary: &AtomicU64, summary_bit: u32) {
    let mask = 1u64 << bit;
    let prev = word.fetch_or(mask, Ordering::AcqRel);
    if prev == 0 {
        summary.fetch_or(1u64 << summary_bit, Ordering::AcqRel);
    }
}

/// Find a set bit anywhere in `words`, starting the scan at `start_word`.
/// Returns `(word_index, bit_index)`.
fn find_set_bit(words: &[AtomicU64], start_word: usize) -> Option<(usize, u32)> {
    let n = words.len();
    for i in 0..n {
        let idx = (start_word + i) % n;
        let bits = words[idx].load(Ordering::Acquire);
        if bits != 0 {
            return Some((idx, bits.trailing_zeros()));
        }
    }
    None
}

/// One page of 512 control words, plus the bitmaps tracking which are free.
struct Page {
    control: Box<[ControlWord; WORDS_PER_PAGE]>,
    /// One bit per control word: set means free.
    slot_free: [AtomicU64; GROUPS_PER_PAGE],
    /// One bit per cacheline-group: set means "this group has a free slot".
    group_free: AtomicU8,
}

impl Page {
    fn new() -> Box<Self> {
        Box::new(Self {
            control: Box::new(std::array::from_fn(|_| ControlWord::new_free())),
            slot_free: std::array::from_fn(|_| AtomicU64::new(u64::MAX)),
            group_free: AtomicU8::new(0xFF),
        })
    }

    fn has_free(&self) -> bool {
        self.group_free.load(Ordering::Acquire) != 0
    }

    /// Claim a free slot, returning its index within the page (0..512).
    fn allocate(&self, hint_slot: Option<usize>) -> Option<usize> {
        let start_group = hint_slot.map(|s| s / WORDS_PER_GROUP).unwrap_or(0);
        loop {
            let groups = self.group_free.load(Ordering::Acquire);
            if groups == 0 {
                return None;
            }
            // Rotate so the scan starts at start_group, preferring locality.
            let rotated = groups.rotate_right(start_group as u32 % 8);
            let rel = rotated.trailing_zeros();
            let g = (start_group + rel as usize) % GROUPS_PER_PAGE;

            let word = &self.slot_free[g];
            let bits = word.load(Ordering::Acquire);
            if bits == 0 {
                // Stale: someone beat us to the last bit in this group.
                // Best-effort clear the (now possibly-wrong) summary bit and retry.
                self.group_free.fetch_and(!(1 << g), Ordering::AcqRel);
                continue;
            }
            let bit = bits.trailing_zeros();
            let mask = 1u64 << bit;
            if word
                .compare_exchange(bits, bits & !mask, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if bits & !mask == 0 {
                self.group_free.fetch_and(!(1 << g), Ordering::AcqRel);
            }
            return Some(g * WORDS_PER_GROUP + bit as usize);
        }
    }

    /// Returns the control word at `slot`, and whether the page was entirely
    /// full immediately before this free (used to propagate to the region
    /// level).
    fn free(&self, slot: usize) -> bool {
        let g = slot / WORDS_PER_GROUP;
        let bit = (slot % WORDS_PER_GROUP) as u32;
        let was_full = self.group_free.load(Ordering::Acquire) == 0;
        let mask = 1u64 << bit;
        let prev = self.slot_free[g].fetch_or(mask, Ordering::AcqRel);
        debug_assert!(prev & mask == 0, "double free of a control word slot");
        self.group_free.fetch_or(1 << g, Ordering::AcqRel);
        was_full
    }

    fn control(&self, slot: usize) -> &ControlWord {
        &self.control[slot]
    }
}

/// A hash-bucket / name-space allocated by the caller, holding up to
/// `2^24` addressable slots.
struct Region {
    pages: Vec<AtomicPtr<Page>>,
    page_free: Vec<AtomicU64>,
    page_summary: Vec<AtomicU64>,
    /// How many pages at the low end of `pages` have ever been instantiated.
    /// Pages beyond this point are virtual capacity: free, but not yet
    /// worth the memory of a real `Page` until something allocates from them.
    next_uninitialized_page: AtomicU32,
}

impl Region {
    fn new() -> Box<Self> {
        Box::new(Self {
            pages: (0..MAX_PAGES_PER_REGION).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            page_free: (0..PAGE_FREE_WORDS).map(|_| AtomicU64::new(0)).collect(),
            page_summary: (0..PAGE_SUMMARY_WORDS).map(|_| AtomicU64::new(0)).collect(),
            next_uninitialized_page: AtomicU32::new(0),
        })
    }

    fn mark_page_present(&self, page_idx: usize) {
        let w = page_idx / 64;
        let bit = (page_idx % 64) as u32;
        let sw = w / 64;
        let sbit = (w % 64) as u32;
        set_with_propagate(&self.page_free[w], bit, &self.page_summary[sw], sbit);
    }

    fn get_or_create_page(&self, page_idx: usize) -> &Page {
        let slot = &self.pages[page_idx];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Page::new());
        match slot.compare_exchange(std::ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.mark_page_present(page_idx);
                unsafe { &*fresh }
            }
            Err(actual) => {
                // Lost the race; drop our unused page and use the winner's.
                unsafe {
                    drop(Box::from_raw(fresh));
                }
                unsafe { &*actual }
            }
        }
    }

    fn allocate(&self, hint: AllocHint) -> Result<u32, AllocError> {
        let hint_page = hint
            .near
            .map(|a| a.index as usize / WORDS_PER_PAGE)
            .filter(|p| *p < MAX_PAGES_PER_REGION);

        if let Some(p) = hint_page {
            if let Some(existing) = self.page_ptr(p) {
                if existing.has_free() {
                    if let Some(slot) = existing.allocate(hint.near.map(|a| a.index as usize % WORDS_PER_PAGE)) {
                        if !existing.has_free() {
                            self.clear_page_bit(p);
                        }
                        return Ok((p * WORDS_PER_PAGE + slot) as u32);
                    }
                }
            }
        }

        let mut start_sw = 0;
        loop {
            let Some((sw, sbit)) = find_set_bit(&self.page_summary, start_sw) else {
                // No existing page has room. Bring a fresh one into existence,
                // if the region hasn't exhausted its 2^24-index capacity.
                let fresh_idx = self.next_uninitialized_page.fetch_add(1, Ordering::Relaxed) as usize;
                if fresh_idx >= MAX_PAGES_PER_REGION {
                    return Err(AllocError::AddressSpaceExhausted);
                }
                self.get_or_create_page(fresh_idx);
                start_sw = fresh_idx / 64 / 64;
                continue;
            };
            let w = sw * 64 + sbit as usize;
            let Some((_, pbit)) = find_set_bit(std::slice::from_ref(&self.page_free[w]), 0) else {
                // Stale summary bit; clear it and retry.
                self.page_summary[sw].fetch_and(!(1 << sbit), Ordering::AcqRel);
                start_sw = sw;
                continue;
            };
            let page_idx = w * 64 + pbit as usize;
            let page = self.get_or_create_page(page_idx);
            match page.allocate(None) {
                Some(slot) => {
                    if !page.has_free() {
                        self.clear_page_bit(page_idx);
                    }
                    return Ok((page_idx * WORDS_PER_PAGE + slot) as u32);
                }
                None => {
                    // Stale: page reported free but is actually full. Fix up and retry.
                    self.clear_page_bit(page_idx);
                    start_sw = sw;
                    continue;
                }
            }
        }
    }

    fn clear_page_bit(&self, page_idx: usize) {
        let w = page_idx / 64;
        let bit = (page_idx % 64) as u32;
        let sw = w / 64;
        let sbit = (w % 64) as u32;
        clear_with_propagate(&self.page_free[w], bit, &self.page_summary[sw], sbit);
    }

    fn page_ptr(&self, page_idx: usize) -> Option<&Page> {
        let ptr = self.pages[page_idx].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Recovery-only: force `index`'s slot non-free (idempotent), without
    /// going through the normal bitmap-scan allocation path. The caller is
    /// responsible for then `publish`ing the control word.
    fn claim_for_recovery(&self, index: u32) -> &ControlWord {
        let page_idx = index as usize / WORDS_PER_PAGE;
        let slot = index as usize % WORDS_PER_PAGE;
        let page = self.get_or_create_page(page_idx);
        let g = slot / WORDS_PER_GROUP;
        let bit = (slot % WORDS_PER_GROUP) as u32;
        let mask = 1u64 << bit;
        let prev = page.slot_free[g].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 && prev & !mask == 0 {
            page.group_free.fetch_and(!(1 << g), Ordering::AcqRel);
        }
        if !page.has_free() {
            self.clear_page_bit(page_idx);
        }
        page.control(slot)
    }

    fn free(&self, index: u32) {
        let page_idx = index as usize / WORDS_PER_PAGE;
        let slot = index as usize % WORDS_PER_PAGE;
        let page = self.page_ptr(page_idx).expect("free of address in an unallocated page");
        if page.free(slot) {
            self.mark_page_present(page_idx);
        }
    }

    fn control(&self, index: u32) -> &ControlWord {
        let page_idx = index as usize / WORDS_PER_PAGE;
        let slot = index as usize % WORDS_PER_PAGE;
        self.page_ptr(page_idx)
            .unwrap_or_else(|| panic!("dereferenced a control word in an unallocated page"))
            .control(slot)
    }

    fn for_each_control(&self, mut f: impl FnMut(&ControlWord)) {
        for slot in &self.pages {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let page = unsafe { &*ptr };
            for c in page.control.iter() {
                f(c);
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        for slot in &self.pages {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

/// Allocates stable [`LogicalAddress`]es and resolves them to
/// [`ControlWord`]s. Regions are created on demand and never freed for the
/// life of the table.
pub struct SharedPointerTable {
    regions: Vec<AtomicPtr<Region>>,
    next_region: AtomicU32,
}

impl SharedPointerTable {
    pub fn new() -> Self {
        Self {
            regions: (0..MAX_REGIONS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            next_region: AtomicU32::new(0),
        }
    }

    /// Allocate a fresh 16-bit region id.
    pub fn new_region(&self) -> Result<u16, AllocError> {
        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        if id as usize >= MAX_REGIONS {
            return Err(AllocError::AddressSpaceExhausted);
        }
        let region = Box::into_raw(Region::new());
        self.regions[id as usize].store(region, Ordering::Release);
        Ok(id as u16)
    }

    /// Recovery-only: bring region `id` into existence if it doesn't
    /// already, without consuming a `next_region` ticket, and bump
    /// `next_region` past it so future `new_region` calls don't collide.
    pub fn ensure_region(&self, id: u16) {
        if self.regions[id as usize].load(Ordering::Acquire).is_null() {
            let region = Box::into_raw(Region::new());
            if self.regions[id as usize]
                .compare_exchange(std::ptr::null_mut(), region, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                unsafe {
                    drop(Box::from_raw(region));
                }
            }
        }
        let mut cur = self.next_region.load(Ordering::Relaxed);
        while cur <= id as u32 {
            match self
                .next_region
                .compare_exchange_weak(cur, id as u32 + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Recovery-only: publish `address` at `location`, claiming its slot
    /// directly rather than through the bitmap-scan allocation path.
    pub fn claim_for_recovery(&self, address: LogicalAddress, location: crate::address::Location) {
        self.ensure_region(address.region);
        self.region(address.region).claim_for_recovery(address.index).publish(location);
    }

    fn region(&self, id: u16) -> &Region {
        let ptr = self.regions[id as usize].load(Ordering::Acquire);
        assert!(!ptr.is_null(), "use of an unallocated region id {id}");
        unsafe { &*ptr }
    }

    pub fn allocate(&self, region: u16, hint: AllocHint) -> Result<(LogicalAddress, &ControlWord), AllocError> {
        let index = self.region(region).allocate(hint)?;
        let addr = LogicalAddress::new(region, index);
        Ok((addr, self.region(region).control(index)))
    }

    pub fn get(&self, address: LogicalAddress) -> &ControlWord {
        self.region(address.region).control(address.index)
    }

    /// Requires the control word to already be zeroed by the caller.
    pub fn free(&self, address: LogicalAddress) {
        self.region(address.region).free(address.index);
    }

    pub fn retain(&self, address: LogicalAddress, max_ref: u64) -> Result<(), AllocError> {
        self.get(address).retain(max_ref)
    }

    /// Returns `true` if this was the release to zero.
    pub fn release(&self, address: LogicalAddress) -> bool {
        self.get(address).release()
    }

    /// Used only by recovery.
    pub fn reset_all_refs_above_one_to_one(&self) {
        for slot in &self.regions {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            unsafe { &*ptr }.for_each_control(|c| c.reset_ref_above_one_to_one());
        }
    }

    pub fn for_each_region_control(&self, region: u16, f: impl FnMut(&ControlWord)) {
        self.region(region).for_each_control(f);
    }

    /// Background decay sweep: clear every control word's `active`/
    /// `pending_cache` bits so cache promotion keeps reflecting recent
    /// reads rather than anything ever read once.
    pub fn decay_all_activity_bits(&self) {
        for slot in &self.regions {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            unsafe { &*ptr }.for_each_control(|c| c.decay_activity());
        }
    }
}

impl Default for SharedPointerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedPointerTable {
    fn drop(&mut self) {
        for slot in &self.regions {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr));
                }
            }
        }
    }
}

unsafe impl Send for SharedPointerTable {}
unsafe impl Sync for SharedPointerTable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Location;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocate_then_release_returns_address_to_freelist() {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let (addr, ctrl) = table.allocate(region, AllocHint::default()).unwrap();
        ctrl.publish(Location(64));
        assert!(table.release(addr));
        table.get(addr).clear();
        table.free(addr);

        let (addr2, _) = table.allocate(region, AllocHint::default()).unwrap();
        assert_eq!(addr2, addr, "freed address should be reused on an otherwise-idle region");
    }

    #[test]
    fn concurrent_allocation_yields_distinct_addresses() {
        let table = Arc::new(SharedPointerTable::new());
        let region = table.new_region().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                let mut addrs = Vec::with_capacity(200);
                for i in 0..200 {
                    let (addr, ctrl) = table.allocate(region, AllocHint::default()).unwrap();
                    ctrl.publish(Location(64 * (i + 1) as u64));
                    addrs.push(addr);
                }
                addrs
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn reachable_refs_survive_reset_to_one() {
        let table = SharedPointerTable::new();
        let region = table.new_region().unwrap();
        let (addr, ctrl) = table.allocate(region, AllocHint::default()).unwrap();
        ctrl.publish(Location(64));
        ctrl.retain(1000).unwrap();
        ctrl.retain(1000).unwrap();
        assert_eq!(ctrl.load(Ordering::Relaxed).refs, 3);
        table.reset_all_refs_above_one_to_one();
        assert_eq!(table.get(addr).load(Ordering::Relaxed).refs, 1);
    }
}
