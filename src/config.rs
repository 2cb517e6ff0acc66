//! Runtime-mutable and creation-time-fixed knobs, loaded from `dbfile.bin` and
//! optionally overridden by [`crate::OpenOptions`].

use crate::error::{AllocError, FormatError};

/// Durability behavior applied after a segment is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Pages are `mprotect`'d read-only but never flushed; durability is left
    /// to the OS's normal writeback.
    None,
    /// `fsync` the whole backing file after each commit.
    Fsync,
    /// `msync(MS_ASYNC)` the finalized range.
    MsyncAsync,
    /// `msync(MS_SYNC)` the finalized range, blocking until it lands.
    MsyncSync,
}

/// Which predicate makes a dirty segment visible to the compactor.
///
/// The reference implementation this system is modeled on is inconsistent
/// between code paths about whether "read-only" or "fully finalized" is the
/// right gate (see spec Open Question #1). This implementation always uses
/// [`CompactablePredicate::Finalized`]; the other variant is kept so the
/// choice is visible and can be revisited without changing the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactablePredicate {
    /// A segment is compactable as soon as any sync header has made part of
    /// it read-only.
    ReadOnly,
    /// A segment is compactable only once its bump pointer has reached the
    /// sentinel (no further allocations are possible).
    Finalized,
}

/// What recovery does when a sync header's checksum doesn't match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChecksumPolicy {
    /// Truncate the segment at the last known-good sync header; treat the
    /// remainder as never written.
    TruncateAtLastGood,
    /// Abort recovery entirely and surface `AllocError::ChecksumMismatch`.
    Abort,
}

/// A configurable rational used by the cache-difficulty controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub numerator: u32,
    pub denominator: u32,
}

impl Ratio {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }

    pub fn apply(self, value: u32) -> u32 {
        ((value as u64 * self.numerator as u64) / self.denominator as u64) as u32
    }
}

/// All runtime-mutable and creation-time-fixed allocator options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Segment granularity. Power of two, fixed at database creation.
    pub segment_size: usize,
    /// Upper bound on segment count; drives the virtual reservation size.
    pub max_segments: usize,
    /// `mlock` budget enforced by the provider.
    pub max_mlocked_segments: usize,
    /// Post-finalize durability behavior.
    pub sync_mode: SyncMode,
    /// Whether to compute the `XXH3_64` sync-header checksum.
    pub checksum_commits: bool,
    /// Whether to maintain a per-object checksum through in-place mutation.
    pub update_checksum_on_modify: bool,
    /// Target cache-turnover period for the difficulty controller, in milliseconds.
    pub cache_frequency_window_ms: u64,
    /// Enable the background compactor thread.
    pub run_compactor: bool,
    /// Enable the background segment provider thread.
    pub run_provider: bool,
    /// Enable the background active/pending-cache bit decay sweep.
    pub run_read_bit_decay: bool,
    /// Enable the promotion path at all.
    pub cache_on_read: bool,
    /// Objects larger than this are never promoted to the pinned cache.
    pub max_cacheable_object_size: usize,
    /// Fraction of freed bytes above which a segment becomes a compaction candidate,
    /// expressed as a [`Ratio`] of `freed_bytes` to `alloc_pos`.
    pub compaction_threshold: Ratio,
    /// Which predicate gates compactor visibility (see [`CompactablePredicate`]).
    pub compactable_predicate: CompactablePredicate,
    /// What recovery does on a sync-header checksum mismatch.
    pub recovery_checksum_policy: RecoveryChecksumPolicy,
    /// Gap-tightening ratio applied when the bytes-promoted trigger fires first.
    pub cache_tighten_ratio: Ratio,
    /// Gap-loosening ratio applied when the time trigger fires first.
    pub cache_loosen_ratio: Ratio,
    /// Maximum concurrent sessions (also bounds the read-lock slot table).
    pub max_sessions: usize,
    /// Maximum number of dirty segments a session may queue before a forced sync.
    pub max_dirty_segments: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            segment_size: 32 << 20,
            max_segments: 1 << 20,
            max_mlocked_segments: 256,
            sync_mode: SyncMode::MsyncAsync,
            checksum_commits: true,
            update_checksum_on_modify: false,
            cache_frequency_window_ms: 60_000,
            run_compactor: true,
            run_provider: true,
            run_read_bit_decay: true,
            cache_on_read: true,
            max_cacheable_object_size: 64 << 10,
            compaction_threshold: Ratio::new(1, 2),
            compactable_predicate: CompactablePredicate::Finalized,
            recovery_checksum_policy: RecoveryChecksumPolicy::TruncateAtLastGood,
            cache_tighten_ratio: Ratio::new(7, 8),
            cache_loosen_ratio: Ratio::new(9, 8),
            max_sessions: 64,
            max_dirty_segments: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Validate internal consistency. Called once at `open()`.
    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.segment_size.is_power_of_two() {
            return Err(AllocError::DataFormat(FormatError::NotPowerOfTwo));
        }
        if self.segment_size < page_size::get() {
            return Err(AllocError::InvalidConfig(
                "segment_size must be at least one system page",
            ));
        }
        if self.max_segments == 0 {
            return Err(AllocError::InvalidConfig("max_segments must be nonzero"));
        }
        if self.max_sessions == 0 || self.max_sessions > 64 {
            return Err(AllocError::InvalidConfig(
                "max_sessions must be in 1..=64",
            ));
        }
        Ok(())
    }
}
