//! Growable file-backed mapping with stable pointers.
//!
//! [`BlockMap`] backs the segment store. It grows a file in fixed
//! `block_size` increments and keeps a set of memory maps over it. Growth
//! prefers a non-moving `mremap` (Linux) so existing pointers stay valid in
//! place; when that isn't possible a new map is appended instead. Either
//! way, a previously-handed-out pointer is never invalidated - callers cache
//! a [`RawView`] snapshot of the current maps and only re-consult the
//! [`BlockMap`] (taking its growth mutex) if a requested range isn't covered
//! by their cached snapshot yet.
//!
//! Growth is serialized by a mutex; steady-state reads are lock-free.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions, MmapRaw, RemapOptions};

use crate::error::AllocError;

/// A byte range inside the contiguous logical address space exposed by a
/// [`BlockMap`] (i.e. `start`/`len` are offsets from the very first block,
/// not relative to any one underlying OS mapping).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlockRange {
    pub start: usize,
    pub len: usize,
}

impl BlockRange {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }
}

struct MapSet {
    maps: Vec<MmapRaw>,
    file: Option<File>,
}

impl MapSet {
    /// # Safety
    /// The returned slices alias the live maps; the caller must not let them
    /// outlive `self` (or must never hand them to something that treats the
    /// `'static` lifetime as a promise beyond that).
    unsafe fn raw_views(&self) -> Vec<&'static [u8]> {
        self.maps
            .iter()
            .map(|m| std::slice::from_raw_parts(m.as_ptr(), m.len()))
            .collect()
    }

    unsafe fn grow_by(&mut self, additional: usize) -> Result<(), AllocError> {
        if let Some(file) = self.file.as_ref() {
            let current_size = file.metadata().map_err(AllocError::Open)?.len();
            file.set_len(current_size + additional as u64)
                .map_err(|e| AllocError::ResizeFailed {
                    size: current_size as usize,
                    requested: current_size as usize + additional,
                    source: e,
                })?;
            file.sync_all().map_err(AllocError::Sync)?;

            #[cfg(target_os = "linux")]
            if let Some(map) = self.maps.last_mut() {
                let new_size = map.len() + additional;
                if map.remap(new_size, RemapOptions::new().may_move(false)).is_ok() {
                    return Ok(());
                }
            }

            let offset = self.maps.iter().map(|m| m.len() as u64).sum::<u64>();
            let map = MmapOptions::new()
                .offset(offset)
                .len(additional)
                .map_raw(file)
                .map_err(|e| AllocError::AllocFailed {
                    requested: additional,
                    source: e,
                })?;
            self.maps.push(map);
            Ok(())
        } else {
            #[cfg(target_os = "linux")]
            if let Some(map) = self.maps.last_mut() {
                let new_size = map.len() + additional;
                if map.remap(new_size, RemapOptions::new().may_move(false)).is_ok() {
                    return Ok(());
                }
            }
            let map = MmapRaw::from(MmapMut::map_anon(additional).map_err(|e| AllocError::AllocFailed {
                requested: additional,
                source: e,
            })?);
            self.maps.push(map);
            Ok(())
        }
    }

    fn flush(&self) -> Result<(), AllocError> {
        if self.file.is_none() {
            return Ok(());
        }
        for map in &self.maps {
            map.flush().map_err(AllocError::Sync)?;
        }
        Ok(())
    }

    fn flush_range(&self, range: BlockRange) -> Result<(), AllocError> {
        if self.file.is_none() {
            return Ok(());
        }
        let mut start = 0;
        for map in &self.maps {
            let end = start + map.len();
            if range.start < end {
                if range.start + range.len > end {
                    return Err(AllocError::InvalidAccess { offset: range.start, len: range.len });
                }
                map.flush_range(range.start - start, range.len).map_err(AllocError::Sync)?;
                return Ok(());
            }
            start = end;
        }
        Err(AllocError::InvalidAccess { offset: range.start, len: range.len })
    }

    fn protect_range(&self, range: BlockRange, read_only: bool) -> Result<(), AllocError> {
        let mut start = 0;
        for map in &self.maps {
            let end = start + map.len();
            if range.start < end {
                if range.start + range.len > end {
                    return Err(AllocError::InvalidAccess { offset: range.start, len: range.len });
                }
                unsafe { mprotect_range(map.as_ptr() as *mut u8, range.start - start, range.len, read_only) }?;
                return Ok(());
            }
            start = end;
        }
        Err(AllocError::InvalidAccess { offset: range.start, len: range.len })
    }
}

/// `mprotect` the page-aligned superset of `[offset, offset + len)` relative
/// to `base`. The aligned range may extend slightly beyond what was asked
/// for (mprotect only operates on whole pages); never less.
#[cfg(unix)]
unsafe fn mprotect_range(base: *mut u8, offset: usize, len: usize, read_only: bool) -> Result<(), AllocError> {
    let page = page_size::get();
    let aligned_start = offset - offset % page;
    let aligned_len = (offset + len - aligned_start).div_ceil(page) * page;
    let prot = if read_only { libc::PROT_READ } else { libc::PROT_READ | libc::PROT_WRITE };
    let rc = unsafe { libc::mprotect(base.add(aligned_start) as *mut libc::c_void, aligned_len, prot) };
    if rc != 0 {
        return Err(AllocError::Protect(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
unsafe fn mprotect_range(_base: *mut u8, _offset: usize, _len: usize, _read_only: bool) -> Result<(), AllocError> {
    Ok(())
}

/// A grow-under-mutex, read-lock-free mapping of a file (or anonymous
/// memory, for `open_anon`) into fixed-size blocks.
pub struct BlockMap {
    block_size: usize,
    /// Total bytes currently backed, kept separately so readers can check
    /// "is my cached view stale" without taking the mutex.
    mapped_len: AtomicUsize,
    inner: Mutex<MapSet>,
}

impl BlockMap {
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, initial_blocks: usize) -> Result<Self, AllocError> {
        debug_assert!(block_size.is_power_of_two());
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(AllocError::Open)?;
        let file_size = file.metadata().map_err(AllocError::Open)?.len() as usize;
        let target = (initial_blocks * block_size).max(file_size);
        if target > file_size {
            file.set_len(target as u64).map_err(|e| AllocError::ResizeFailed {
                size: file_size,
                requested: target,
                source: e,
            })?;
        }
        let map = MmapOptions::new()
            .len(target)
            .map_raw(&file)
            .map_err(|e| AllocError::AllocFailed { requested: target, source: e })?;
        Ok(Self {
            block_size,
            mapped_len: AtomicUsize::new(target),
            inner: Mutex::new(MapSet { maps: vec![map], file: Some(file) }),
        })
    }

    pub fn open_anon(block_size: usize, initial_blocks: usize) -> Result<Self, AllocError> {
        debug_assert!(block_size.is_power_of_two());
        let target = initial_blocks * block_size;
        let map = MmapRaw::from(
            MmapMut::map_anon(target).map_err(|e| AllocError::AllocFailed { requested: target, source: e })?,
        );
        Ok(Self {
            block_size,
            mapped_len: AtomicUsize::new(target),
            inner: Mutex::new(MapSet { maps: vec![map], file: None }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped_len.load(Ordering::Acquire)
    }

    pub fn block_count(&self) -> usize {
        self.mapped_len() / self.block_size
    }

    /// Append one block, returning its index.
    pub fn alloc(&self) -> Result<u64, AllocError> {
        let mut guard = self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?;
        let block_num = self.mapped_len.load(Ordering::Acquire) / self.block_size;
        unsafe {
            guard.grow_by(self.block_size)?;
        }
        self.mapped_len.fetch_add(self.block_size, Ordering::Release);
        Ok(block_num as u64)
    }

    /// Ensure at least `n` blocks exist.
    pub fn reserve(&self, n: usize) -> Result<(), AllocError> {
        self.resize(n)
    }

    /// Extend to at least `n` blocks, growing in one step if more than one
    /// block is needed.
    pub fn resize(&self, n: usize) -> Result<(), AllocError> {
        let target = n * self.block_size;
        if self.mapped_len.load(Ordering::Acquire) >= target {
            return Ok(());
        }
        let mut guard = self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?;
        let current = self.mapped_len.load(Ordering::Acquire);
        if current >= target {
            return Ok(());
        }
        unsafe {
            guard.grow_by(target - current)?;
        }
        self.mapped_len.store(target, Ordering::Release);
        Ok(())
    }

    /// Get a pointer to one entire block.
    pub fn get(&self, block_num: u64) -> Result<&'static mut [u8], AllocError> {
        self.get_range(BlockRange::new(block_num as usize * self.block_size, self.block_size))
    }

    /// Get an arbitrary byte range. The range must not straddle two
    /// underlying OS mappings (segment-aligned ranges never do, since a
    /// `BlockMap` is only ever grown in whole-block increments and segments
    /// are whole blocks).
    pub fn get_range(&self, range: BlockRange) -> Result<&'static mut [u8], AllocError> {
        let guard = self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?;
        let mut start = 0;
        for map in &guard.maps {
            let end = start + map.len();
            if range.start < end {
                let lower = range.start - start;
                let upper = lower + range.len;
                let slice = map
                    .as_ref()
                    .get(lower..upper)
                    .ok_or(AllocError::InvalidAccess { offset: range.start, len: range.len })?;
                let ptr = slice.as_ptr() as *mut u8;
                return Ok(unsafe { std::slice::from_raw_parts_mut(ptr, slice.len()) });
            }
            start = end;
        }
        Err(AllocError::InvalidAccess { offset: range.start, len: range.len })
    }

    pub fn flush(&self) -> Result<(), AllocError> {
        self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?.flush()
    }

    pub fn flush_range(&self, range: BlockRange) -> Result<(), AllocError> {
        self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?.flush_range(range)
    }

    /// `mprotect` the given range read-only (`read_only = true`) or
    /// read-write (`read_only = false`). A no-op on targets where partial
    /// `mprotect` isn't available.
    pub fn protect_range(&self, range: BlockRange, read_only: bool) -> Result<(), AllocError> {
        self.inner.lock().map_err(|_| AllocError::Other("BlockMap mutex poisoned"))?.protect_range(range, read_only)
    }

    /// Snapshot the current maps for a lock-free [`RawView`].
    ///
    /// # Safety
    /// The returned slices must not outlive `self`.
    pub unsafe fn raw_views(&self) -> Vec<&'static [u8]> {
        self.inner
            .lock()
            .map(|g| g.raw_views())
            .unwrap_or_default()
    }
}

/// A thread-local, lock-free cached view of a [`BlockMap`]'s current maps.
/// Falls back to re-locking the `BlockMap` only when a requested range
/// isn't covered yet (i.e. the map grew since the last refresh).
#[derive(Clone)]
pub struct RawView {
    maps: Vec<&'static [u8]>,
}

impl RawView {
    /// # Safety
    /// `maps` must not outlive the `BlockMap` they were snapshotted from.
    pub unsafe fn new(maps: Vec<&'static [u8]>) -> Self {
        Self { maps }
    }

    fn try_get(&self, range: BlockRange) -> Result<Option<&'static [u8]>, AllocError> {
        let mut start = 0;
        for map in &self.maps {
            let end = start + map.len();
            if range.start < end {
                let lower = range.start - start;
                let upper = lower + range.len;
                let slice = map
                    .get(lower..upper)
                    .ok_or(AllocError::InvalidAccess { offset: range.start, len: range.len })?;
                return Ok(Some(slice));
            }
            start = end;
        }
        Ok(None)
    }

    /// Read `range`, refreshing the cached view from `map` if it isn't
    /// covered yet.
    ///
    /// # Safety
    /// The returned slice is only valid as long as `map` itself is mapped.
    pub unsafe fn get(&mut self, map: &BlockMap, range: BlockRange) -> Result<&'static [u8], AllocError> {
        if let Some(s) = self.try_get(range)? {
            return Ok(s);
        }
        self.maps = map.raw_views();
        if let Some(s) = self.try_get(range)? {
            return Ok(s);
        }
        Err(AllocError::InvalidAccess { offset: range.start, len: range.len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_block_map_grows_and_preserves_pointers() {
        let map = BlockMap::open_anon(4096, 2).unwrap();
        assert_eq!(map.block_count(), 2);
        let first = map.get(0).unwrap();
        first[0] = 0xAB;
        map.reserve(4).unwrap();
        assert_eq!(map.block_count(), 4);
        // The original block's contents survive growth.
        let reread = map.get(0).unwrap();
        assert_eq!(reread[0], 0xAB);
        let third = map.get(2).unwrap();
        third[10] = 0xCD;
        assert_eq!(map.get(2).unwrap()[10], 0xCD);
    }

    #[test]
    fn protect_range_round_trips_without_error() {
        let map = BlockMap::open_anon(4096, 2).unwrap();
        let range = BlockRange::new(0, 4096);
        map.protect_range(range, true).unwrap();
        map.protect_range(range, false).unwrap();
        // Writable again: this would fault if the read-only protect had
        // stuck.
        map.get(0).unwrap()[0] = 0x42;
    }

    #[test]
    fn alloc_appends_one_block_at_a_time() {
        let map = BlockMap::open_anon(4096, 1).unwrap();
        let b1 = map.alloc().unwrap();
        let b2 = map.alloc().unwrap();
        assert_eq!(b1, 1);
        assert_eq!(b2, 2);
        assert_eq!(map.block_count(), 3);
    }
}
