//! Adaptive admission control for the pinned object cache.
//!
//! Every promotion candidate draws a random `u32` and is admitted only if
//! the draw falls under the current "gap" (an admission window out of the
//! full `u32` range: larger gap, easier to get in). The gap self-tunes
//! against a target promotion rate: if the byte budget for the current
//! window is exhausted before the window's time elapses, the gap is
//! tightened (`*7/8`, harder to admit); if the window's time elapses first,
//! it's loosened (`*9/8`, easier to admit). The asymmetry means admission
//! reacts fast to a burst but only slowly relaxes afterward.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::Ratio;

pub struct CacheDifficultyController {
    gap: AtomicU32,
    bytes_promoted_since_last_update: AtomicU64,
    window_start_micros: AtomicU64,
    target_bytes_per_window: u64,
    frequency_window_micros: u64,
    tighten_ratio: Ratio,
    loosen_ratio: Ratio,
    max_cacheable_object_size: usize,
}

impl CacheDifficultyController {
    pub fn new(
        target_bytes_per_window: u64,
        frequency_window_micros: u64,
        tighten_ratio: Ratio,
        loosen_ratio: Ratio,
        max_cacheable_object_size: usize,
        now_micros: u64,
    ) -> Self {
        Self {
            gap: AtomicU32::new(u32::MAX),
            bytes_promoted_since_last_update: AtomicU64::new(0),
            window_start_micros: AtomicU64::new(now_micros),
            target_bytes_per_window,
            frequency_window_micros,
            tighten_ratio,
            loosen_ratio,
            max_cacheable_object_size,
        }
    }

    /// Should an object of `size` bytes whose promotion draw was `draw` be
    /// admitted to the cache right now? Objects above the configured size
    /// cap are never admitted; smaller ones are scaled by the number of
    /// cachelines they occupy, so a multi-cacheline object needs a draw
    /// proportionally harder to hit than a single-cacheline one.
    pub fn should_cache(&self, draw: u32, size: usize) -> bool {
        if size > self.max_cacheable_object_size {
            return false;
        }
        let clines = (size as u64 + 1).div_ceil(64).max(1);
        let gap = self.gap.load(Ordering::Relaxed) as u64;
        (draw as u64) < gap / clines
    }

    pub fn gap(&self) -> u32 {
        self.gap.load(Ordering::Relaxed)
    }

    /// Record that `bytes` were just promoted. Checks both triggers and
    /// rolls the window (adjusting the gap) if either has fired.
    pub fn report(&self, bytes: u64, now_micros: u64) {
        let promoted = self.bytes_promoted_since_last_update.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if promoted >= self.target_bytes_per_window {
            self.roll_window(now_micros, true);
            return;
        }
        let start = self.window_start_micros.load(Ordering::Relaxed);
        if now_micros.saturating_sub(start) >= self.frequency_window_micros {
            self.roll_window(now_micros, false);
        }
    }

    fn roll_window(&self, now_micros: u64, tighten: bool) {
        let start = self.window_start_micros.load(Ordering::Relaxed);
        if self
            .window_start_micros
            .compare_exchange(start, now_micros, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another thread already rolled this window; let it own the adjustment.
            return;
        }
        self.bytes_promoted_since_last_update.store(0, Ordering::Relaxed);
        let ratio = if tighten { self.tighten_ratio } else { self.loosen_ratio };
        let mut cur = self.gap.load(Ordering::Relaxed);
        loop {
            let next = ratio.apply(cur).clamp(1, u32::MAX);
            match self.gap.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
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
    fn exhausting_byte_budget_tightens_the_gap() {
        let c = CacheDifficultyController::new(1000, 60_000_000, Ratio::new(7, 8), Ratio::new(9, 8), 64 << 10, 0);
        let before = c.gap();
        c.report(1200, 10);
        assert!(c.gap() < before);
    }

    #[test]
    fn window_elapsing_without_budget_exhaustion_loosens_the_gap() {
        let c = CacheDifficultyController::new(1_000_000, 1000, Ratio::new(7, 8), Ratio::new(9, 8), 64 << 10, 0);
        let before = c.gap();
        c.report(10, 2000);
        assert!(c.gap() > before || c.gap() == u32::MAX);
    }

    #[test]
    fn gap_never_reaches_zero() {
        let c = CacheDifficultyController::new(1, 1, Ratio::new(7, 8), Ratio::new(9, 8), 64 << 10, 0);
        for i in 0..200 {
            c.report(2, i);
        }
        assert!(c.gap() >= 1);
    }

    #[test]
    fn should_cache_respects_the_gap_threshold() {
        let c = CacheDifficultyController::new(1_000_000, 1_000_000, Ratio::new(7, 8), Ratio::new(9, 8), 64 << 10, 0);
        assert!(c.should_cache(0, 48));
        assert!(!c.should_cache(u32::MAX, 48));
    }

    #[test]
    fn should_cache_rejects_objects_above_the_size_cap() {
        let c = CacheDifficultyController::new(1_000_000, 1_000_000, Ratio::new(7, 8), Ratio::new(9, 8), 1024, 0);
        assert!(!c.should_cache(0, 1025));
        assert!(c.should_cache(0, 1024));
    }

    #[test]
    fn should_cache_scales_the_bar_by_cacheline_count() {
        let c = CacheDifficultyController::new(1_000_000, 1_000_000, Ratio::new(7, 8), Ratio::new(9, 8), 64 << 10, 0);
        // A 48-byte object is one cacheline; a 4096-byte object is 64.
        // The same draw that clears the single-cacheline bar must not
        // clear the 64-cacheline one once it's scaled down that far.
        let draw = (u32::MAX / 64) + 1;
        assert!(c.should_cache(draw, 48));
        assert!(!c.should_cache(draw, 4096));
    }
}
