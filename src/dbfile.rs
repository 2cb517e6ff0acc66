//! `dbfile.bin`: the small root metadata file every on-disk database keeps
//! alongside its segment store.
//!
//! It carries just enough to validate that a reopen matches the database's
//! creation-time configuration and to decide whether recovery is required:
//! a magic number, the configuration fields that must stay fixed for the
//! life of the database, and a clean-shutdown flag that's cleared on open
//! and only set back on an orderly [`crate::Database`] drop. The
//! shared-pointer table itself is never persisted here (or anywhere) - see
//! `recovery.rs` and `DESIGN.md` for why.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{AllocError, FormatError};

pub const MAGIC: u32 = 0x4B56_4442; // "KVDB"
const VERSION: u16 = 1;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct RawHeader {
    magic: u32,
    version: u16,
    clean_shutdown: u8,
    _pad: u8,
    segment_size: u32,
    max_segments: u32,
    segment_count: u32,
    checksum: u64,
}

impl RawHeader {
    fn checksum_of(&self) -> u64 {
        let mut copy = *self;
        copy.checksum = 0;
        xxhash_rust::xxh3::xxh3_64(bytemuck::bytes_of(&copy))
    }
}

/// Root metadata decoded from `dbfile.bin`.
#[derive(Debug, Clone, Copy)]
pub struct RootState {
    pub clean_shutdown: bool,
    pub segment_size: u32,
    pub max_segments: u32,
    pub segment_count: u32,
}

/// Open (creating if absent) the root metadata file and return its decoded
/// state along with whether it was freshly created.
pub fn open(path: &Path, segment_size: u32, max_segments: u32) -> Result<(File, RootState, bool), AllocError> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(AllocError::Open)?;

    if is_new {
        let header = RawHeader {
            magic: MAGIC,
            version: VERSION,
            clean_shutdown: 1,
            _pad: 0,
            segment_size,
            max_segments,
            segment_count: 0,
            checksum: 0,
        };
        write_raw(&mut file, header)?;
        return Ok((
            file,
            RootState { clean_shutdown: true, segment_size, max_segments, segment_count: 0 },
            true,
        ));
    }

    let header = read_raw(&mut file)?;
    if header.magic != MAGIC {
        return Err(AllocError::DataFormat(FormatError::BadMagic));
    }
    if header.segment_size != segment_size {
        return Err(AllocError::DataFormat(FormatError::SegmentSizeMismatch));
    }
    if header.checksum != header.checksum_of() {
        return Err(AllocError::DataFormat(FormatError::BadMagic));
    }

    // Mark dirty immediately: until a clean `Database::drop` runs, a crash
    // between now and then must trigger recovery on the next open.
    let was_clean = header.clean_shutdown != 0;
    let mut dirty = header;
    dirty.clean_shutdown = 0;
    write_raw(&mut file, dirty)?;

    Ok((
        file,
        RootState {
            clean_shutdown: was_clean,
            segment_size: header.segment_size,
            max_segments: header.max_segments,
            segment_count: header.segment_count,
        },
        false,
    ))
}

/// Record a clean shutdown: called once from `Database`'s `Drop` impl after
/// every background thread has stopped and every dirty segment is synced.
pub fn mark_clean(file: &mut File, segment_count: u32) -> Result<(), AllocError> {
    let mut header = read_raw(file)?;
    header.clean_shutdown = 1;
    header.segment_count = segment_count;
    write_raw(file, header)
}

fn read_raw(file: &mut File) -> Result<RawHeader, AllocError> {
    file.seek(SeekFrom::Start(0)).map_err(AllocError::Open)?;
    let mut buf = [0u8; std::mem::size_of::<RawHeader>()];
    file.read_exact(&mut buf).map_err(AllocError::Open)?;
    bytemuck::try_pod_read_unaligned(&buf).map_err(|_| AllocError::DataFormat(FormatError::BadMagic))
}

fn write_raw(file: &mut File, mut header: RawHeader) -> Result<(), AllocError> {
    header.checksum = header.checksum_of();
    file.seek(SeekFrom::Start(0)).map_err(AllocError::Open)?;
    file.write_all(bytemuck::bytes_of(&header)).map_err(AllocError::Open)?;
    file.sync_all().map_err(AllocError::Open)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_is_marked_clean_with_zero_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbfile.bin");
        let (_file, state, is_new) = open(&path, 4096, 1024).unwrap();
        assert!(is_new);
        assert!(state.clean_shutdown);
        assert_eq!(state.segment_count, 0);
    }

    #[test]
    fn reopening_without_mark_clean_reports_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbfile.bin");
        {
            let _ = open(&path, 4096, 1024).unwrap();
        }
        let (_file, state, is_new) = open(&path, 4096, 1024).unwrap();
        assert!(!is_new);
        assert!(!state.clean_shutdown);
    }

    #[test]
    fn mark_clean_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbfile.bin");
        let (mut file, _, _) = open(&path, 4096, 1024).unwrap();
        mark_clean(&mut file, 3).unwrap();
        drop(file);
        let (_file, state, _) = open(&path, 4096, 1024).unwrap();
        assert!(state.clean_shutdown);
        assert_eq!(state.segment_count, 3);
    }

    #[test]
    fn segment_size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbfile.bin");
        {
            let _ = open(&path, 4096, 1024).unwrap();
        }
        let err = open(&path, 8192, 1024).unwrap_err();
        assert!(matches!(err, AllocError::DataFormat(FormatError::SegmentSizeMismatch)));
    }
}
