//! A segment-based, copy-on-write allocator for an embedded key/value store.
//!
//! [`Database`] wires together every subsystem documented in the individual
//! modules: a [`block::BlockMap`]-backed [`segment::SegmentStore`], the
//! [`region::SharedPointerTable`] that turns stable logical addresses into
//! physical locations, the [`readlock::ReadLockTable`] pipeline that keeps
//! the compactor from recycling data still being read, the
//! [`cache::CacheDifficultyController`], and the background
//! [`provider::ProviderState`] and [`compactor::Compactor`]. [`Session`]
//! is the per-thread handle callers actually allocate, read, modify, and
//! sync through.
//!
//! Everything above this module (trie node layouts, the iterator, the
//! transaction wrapper, the SQL virtual-table shim) is an external
//! collaborator: it talks to a [`Session`], never to these internals
//! directly.

pub mod address;
pub mod block;
pub mod cache;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod dbfile;
mod error;
pub mod provider;
pub mod readlock;
pub mod recovery;
pub mod region;
pub mod ring;
pub mod segment;
pub mod session;
pub mod syncmodify;
pub mod weighted_average;

pub use address::LogicalAddress;
pub use error::AllocError;
pub use session::{ModifyGuard, ReadGuard, Session};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cache::CacheDifficultyController;
use clock::{Clock, SystemClock};
use config::RuntimeConfig;
use provider::ProviderState;
use readlock::ReadLockTable;
use region::SharedPointerTable;
use segment::SegmentStore;

const SEGMENTS_FILE_NAME: &str = "segments.dat";
const ROOT_FILE_NAME: &str = "dbfile.bin";

/// Builder for opening or creating a [`Database`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    config: RuntimeConfig,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { config: RuntimeConfig::default() }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Open (or create) a database backed by files under `dir`.
    pub fn open<P: AsRef<Path>>(self, dir: P) -> Result<Database, AllocError> {
        self.config.validate()?;
        Database::open_dir(dir.as_ref(), self.config)
    }

    /// Open an anonymous, in-memory-only database. Never persisted, never
    /// recovered; useful for tests and ephemeral caches.
    pub fn open_anon(self) -> Result<Database, AllocError> {
        self.config.validate()?;
        Database::open_anon(self.config)
    }
}

struct Inner {
    table: SharedPointerTable,
    segments: Arc<SegmentStore>,
    read_locks: Arc<ReadLockTable>,
    provider: Arc<ProviderState>,
    cache: CacheDifficultyController,
    config: RuntimeConfig,
    clock: Box<dyn Clock>,
    default_region: u16,
    root_file: Option<Mutex<std::fs::File>>,
    stop_background: AtomicBool,
    provider_thread: Mutex<Option<JoinHandle<()>>>,
    compactor_thread: Mutex<Option<JoinHandle<()>>>,
    decay_thread: Mutex<Option<JoinHandle<()>>>,
}

/// An open database. Cheaply cloned (all state lives behind an `Arc`);
/// every clone shares the same background threads, which stop only once
/// the last handle is dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    fn open_anon(config: RuntimeConfig) -> Result<Self, AllocError> {
        let blocks = block::BlockMap::open_anon(config.segment_size, 0)?;
        let segments = Arc::new(SegmentStore::new(blocks, config.max_segments));
        let db = Self::assemble(segments, config, None)?;
        db.spawn_background_threads();
        Ok(db)
    }

    fn open_dir(dir: &Path, config: RuntimeConfig) -> Result<Self, AllocError> {
        std::fs::create_dir_all(dir).map_err(AllocError::Open)?;
        let (root_file, root_state, is_new) = dbfile::open(
            &dir.join(ROOT_FILE_NAME),
            config.segment_size as u32,
            config.max_segments as u32,
        )?;

        let blocks = block::BlockMap::open(dir.join(SEGMENTS_FILE_NAME), config.segment_size, 0)?;
        let segments = Arc::new(SegmentStore::new(blocks, config.max_segments));

        let db = Self::assemble(segments, config, Some(root_file))?;

        // Recovery must finish before the provider/compactor threads start
        // touching segment state, so it runs between assembly and the
        // threads' launch rather than inside either.
        if !is_new && !root_state.clean_shutdown {
            log::warn!("database was not cleanly shut down, running recovery");
            let report = recovery::recover(
                &db.inner.table,
                &db.inner.segments,
                db.inner.config.recovery_checksum_policy,
                db.inner.config.checksum_commits,
            )?;
            log::info!(
                "recovery complete: {} segments scanned, {} live objects, {} freed",
                report.segments_scanned,
                report.live_objects,
                report.segments_freed
            );
            db.inner.provider.seed_free_list(report.free_segments);
        } else {
            log::info!("database opened cleanly, skipping recovery");
        }

        db.spawn_background_threads();
        Ok(db)
    }

    fn assemble(
        segments: Arc<SegmentStore>,
        config: RuntimeConfig,
        root_file: Option<std::fs::File>,
    ) -> Result<Self, AllocError> {
        let table = SharedPointerTable::new();
        let default_region = table.new_region()?;
        let read_locks = Arc::new(ReadLockTable::new(config.max_sessions, config.max_segments));
        let provider = ProviderState::new(segments.clone(), read_locks.clone(), config.max_mlocked_segments, config.max_segments);
        let clock = Box::new(SystemClock);
        let now = clock.now_micros();
        let cache = CacheDifficultyController::new(
            (config.max_cacheable_object_size as u64).max(1) * 1024,
            config.cache_frequency_window_ms * 1000,
            config.cache_tighten_ratio,
            config.cache_loosen_ratio,
            config.max_cacheable_object_size,
            now,
        );

        let inner = Arc::new(Inner {
            table,
            segments,
            read_locks,
            provider,
            cache,
            config,
            clock,
            default_region,
            root_file: root_file.map(Mutex::new),
            stop_background: AtomicBool::new(false),
            provider_thread: Mutex::new(None),
            compactor_thread: Mutex::new(None),
            decay_thread: Mutex::new(None),
        });

        Ok(Database { inner })
    }

    fn spawn_background_threads(&self) {
        if self.inner.config.run_provider {
            let state = self.inner.provider.clone();
            let handle = provider::spawn(state, Duration::from_millis(50));
            *self.inner.provider_thread.lock().unwrap() = Some(handle);
        }
        if self.inner.config.run_compactor {
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name("compactor".into())
                .spawn(move || {
                    log::debug!("compactor thread starting");
                    while !inner.stop_background.load(Ordering::Acquire) {
                        let compactor = compactor::Compactor::new(
                            &inner.table,
                            &inner.segments,
                            &inner.provider,
                            &inner.cache,
                            &inner.config,
                            inner.clock.as_ref(),
                        );
                        let n = compactor.run_pass();
                        if n > 0 {
                            log::debug!("compactor drained {n} segments");
                        }
                        std::thread::sleep(Duration::from_millis(200));
                    }
                    log::debug!("compactor thread stopping");
                })
                .expect("failed to spawn compactor thread");
            *self.inner.compactor_thread.lock().unwrap() = Some(handle);
        }
        if self.inner.config.run_read_bit_decay {
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name("read-bit-decay".into())
                .spawn(move || {
                    log::debug!("read-bit decay thread starting");
                    while !inner.stop_background.load(Ordering::Acquire) {
                        inner.table.decay_all_activity_bits();
                        std::thread::sleep(Duration::from_millis(500));
                    }
                    log::debug!("read-bit decay thread stopping");
                })
                .expect("failed to spawn read-bit decay thread");
            *self.inner.decay_thread.lock().unwrap() = Some(handle);
        }
    }

    /// Open a new per-thread session against this database's default region.
    /// The session releases its slot back to the table when dropped, so
    /// capacity is bounded by *concurrently open* sessions, not by how many
    /// have ever been created.
    pub fn new_session(&self) -> Result<Session<'_>, AllocError> {
        let id = self
            .inner
            .read_locks
            .acquire_session()
            .ok_or(AllocError::SessionTableFull { max: self.inner.config.max_sessions })?;
        Ok(Session::new(
            id,
            self.inner.default_region,
            &self.inner.table,
            &self.inner.segments,
            &self.inner.read_locks,
            &self.inner.cache,
            &self.inner.config,
            self.inner.clock.as_ref(),
        ))
    }

    /// Run one compaction pass synchronously (in addition to whatever the
    /// background compactor thread is doing, if enabled).
    pub fn compact_once(&self) -> usize {
        let compactor = compactor::Compactor::new(
            &self.inner.table,
            &self.inner.segments,
            &self.inner.provider,
            &self.inner.cache,
            &self.inner.config,
            self.inner.clock.as_ref(),
        );
        compactor.run_pass()
    }

    /// Number of segments created so far.
    pub fn segment_count(&self) -> u32 {
        self.inner.segments.segment_count()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_background.store(true, Ordering::Release);
        provider::request_stop(&self.provider);
        if let Some(handle) = self.provider_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.compactor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.decay_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(root_file) = self.root_file.as_ref() {
            let mut file = root_file.lock().unwrap();
            if let Err(e) = dbfile::mark_clean(&mut file, self.segments.segment_count()) {
                log::warn!("failed to record clean shutdown: {e}");
            }
        }
        if let Err(e) = self.segments.flush_all() {
            log::warn!("failed to flush segments on shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_database_round_trips_a_value_through_a_session() {
        let db = OpenOptions::new().open_anon().unwrap();
        let session = db.new_session().unwrap();
        let addr = session.alloc(b"hello").unwrap();
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"hello");
    }

    #[test]
    fn on_disk_database_survives_a_clean_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = {
            let db = OpenOptions::new().open(dir.path()).unwrap();
            let session = db.new_session().unwrap();
            let addr = session.alloc(b"durable").unwrap();
            session.sync().unwrap();
            addr
        };

        let db = OpenOptions::new().open(dir.path()).unwrap();
        let session = db.new_session().unwrap();
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"durable");
    }

    #[test]
    fn reopen_after_a_simulated_crash_triggers_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let addr = {
            let db = OpenOptions::new().open(dir.path()).unwrap();
            let session = db.new_session().unwrap();
            let addr = session.alloc(b"crashed").unwrap();
            session.sync().unwrap();
            // Leak the handle instead of dropping it, so `dbfile.bin` is
            // never marked clean - simulating a process that died.
            std::mem::forget(db);
            addr
        };

        let db = OpenOptions::new().open(dir.path()).unwrap();
        let session = db.new_session().unwrap();
        let guard = session.read(addr).unwrap();
        assert_eq!(guard.bytes(), b"crashed");
    }
}
