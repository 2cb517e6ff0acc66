use thiserror::Error;

/// Reasons the on-disk layout was rejected at open time.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum FormatError {
    /// The 32-bit magic at the start of `dbfile.bin` didn't match.
    #[error("Bad magic number in dbfile.bin")]
    BadMagic,
    /// `segment_size` (or another size field) wasn't a power of two.
    #[error("Size field was not a power of two")]
    NotPowerOfTwo,
    /// The backing file's length didn't match a whole number of blocks.
    #[error("Backing file size doesn't match the configured block size")]
    FileSize,
    /// Both root slots loaded successfully but claimed the same transaction ID.
    #[error("Both root pages claim the same transaction ID")]
    DuplicateIds,
    /// The stored `segment_size` didn't match the one requested at open.
    #[error("Stored segment_size doesn't match the size requested at open")]
    SegmentSizeMismatch,
}

/// Every error the allocator can return.
///
/// Kinds, per the design document: *Resource* (propagate, never catch),
/// *Configuration* (fatal at open), *Capacity* (surfaced to the caller),
/// *Corruption* (recovery-time, policy-dependent). A *Retryable* condition
/// (a lost CAS race) never escapes as an `AllocError` - it's retried in a
/// bounded spin internally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocError {
    /// Couldn't open the backing file.
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file.
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file.
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file.
    #[error(
        "Can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't allocate any more memory map space.
    #[error("Can't allocate any more memory map space. Tried to get 0x{requested:x} bytes")]
    AllocFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// `mprotect` on a finalized segment's pages failed.
    #[error("Failed to change page protection on a finalized segment")]
    Protect(#[source] std::io::Error),
    /// Punching a hole in the backing file failed.
    #[error("Punching a hole in the sparse memory map failed")]
    HolePunch(#[source] std::io::Error),
    /// The on-disk layout was rejected.
    #[error("Database layout error: {0}")]
    DataFormat(#[from] FormatError),
    /// A `RuntimeConfig` value was internally inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The session table is full (at most 64 concurrent sessions).
    #[error("Session table is full (max {max} concurrent sessions)")]
    SessionTableFull { max: usize },
    /// A session's dirty-segment queue overflowed before a sync could drain it.
    #[error("Dirty segment queue overflowed (more than {max} segments pending sync)")]
    DirtyQueueOverflow { max: usize },
    /// A control word's reference count hit its usable maximum.
    #[error("Reference count saturated for this address")]
    RefCountSaturated,
    /// The shared-pointer table has no more addresses to hand out.
    #[error("Shared-pointer table is exhausted")]
    AddressSpaceExhausted,
    /// A sync header's checksum didn't match its claimed contents during recovery.
    #[error("Checksum mismatch recovering segment at offset 0x{offset:x}, length 0x{len:x}")]
    ChecksumMismatch { offset: usize, len: usize },
    /// An access fell outside of every mapped block.
    #[error("Invalid access on the memory map was attempted. Tried to get slice at offset 0x{offset:x} with length 0x{len:x}")]
    InvalidAccess { offset: usize, len: usize },
    /// Other, miscellaneous errors.
    #[error("Other: {0}")]
    Other(&'static str),
}
