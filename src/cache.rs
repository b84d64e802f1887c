//! Maps region coordinates to open region files under one directory.
//!
//! Files are opened lazily on first use and closed again by [`RegionFileCache::sweep_idle`],
//! either called directly or from an [`IdleSweeper`] thread.

use crate::blob_array::{BlobArray, ContainerState, OpenInProgress};
use crate::config::RegionStoreConfig;
use crate::coords::{ChunkPos, RegionPos};
use crate::error::StoreError;
use crate::region_file::RegionFile;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

#[derive(Debug)]
enum RegionSlot {
    /// One thread is opening the file; others see [`RegionStore::OpenInProgress`].
    Opening,
    Open(Arc<RegionFile>),
}

/// Result of a cache lookup.
#[derive(Clone, Debug)]
pub enum RegionStore {
    Open(Arc<RegionFile>),
    OpenInProgress,
}

impl RegionStore {
    pub fn blob_array(&self) -> &dyn BlobArray {
        match self {
            Self::Open(file) => &**file,
            Self::OpenInProgress => &OpenInProgress,
        }
    }

    pub fn file(&self) -> Option<&Arc<RegionFile>> {
        match self {
            Self::Open(file) => Some(file),
            Self::OpenInProgress => None,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.blob_array().state()
    }
}

#[derive(Debug)]
pub struct RegionFileCache {
    config: RegionStoreConfig,
    slots: Mutex<HashMap<RegionPos, RegionSlot>>,
}

impl RegionFileCache {
    pub fn new(config: RegionStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegionStoreConfig {
        &self.config
    }

    pub fn region_path(&self, region: RegionPos) -> PathBuf {
        self.config
            .root
            .join(region.file_name(&self.config.file_extension))
    }

    /// Region files present in the root directory, sorted by position.
    pub fn stored_regions(&self) -> Result<Vec<RegionPos>, StoreError> {
        let mut regions = Vec::new();
        for entry in std::fs::read_dir(&self.config.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(region) = name
                .to_str()
                .and_then(|name| RegionPos::from_file_name(name, &self.config.file_extension))
            {
                regions.push(region);
            }
        }
        regions.sort_unstable();
        Ok(regions)
    }

    /// Returns the open file for `region`, opening it if needed.
    ///
    /// While another thread is opening the same region, or the cached file is still closing,
    /// this returns [`RegionStore::OpenInProgress`] instead of waiting.
    pub fn get(&self, region: RegionPos) -> Result<RegionStore, StoreError> {
        {
            let mut slots = self.slots();
            match slots.get(&region) {
                Some(RegionSlot::Open(file)) if !file.is_closed() => {
                    if file.state() == ContainerState::Closing {
                        return Ok(RegionStore::OpenInProgress);
                    }
                    return Ok(RegionStore::Open(file.clone()));
                }
                Some(RegionSlot::Opening) => return Ok(RegionStore::OpenInProgress),
                _ => {
                    slots.insert(region, RegionSlot::Opening);
                }
            }
        }

        let opened = RegionFile::open(self.region_path(region), self.config.region.clone());
        let mut slots = self.slots();
        match opened {
            Ok(file) => {
                let file = Arc::new(file);
                slots.insert(region, RegionSlot::Open(file.clone()));
                Ok(RegionStore::Open(file))
            }
            Err(error) => {
                slots.remove(&region);
                Err(error)
            }
        }
    }

    pub fn read_chunk(&self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, StoreError> {
        let index = chunk.local_index().get();
        self.with_region(chunk.region(), |file| file.read_entry(index))
    }

    pub fn write_chunk(&self, chunk: ChunkPos, bytes: &[u8]) -> Result<(), StoreError> {
        let index = chunk.local_index().get();
        self.with_region(chunk.region(), |file| file.write_entry(index, bytes))
    }

    pub fn delete_chunk(&self, chunk: ChunkPos) -> Result<bool, StoreError> {
        let index = chunk.local_index().get();
        self.with_region(chunk.region(), |file| file.delete(index))
    }

    /// Closes every file that has been idle past its timeout and forgets it.
    ///
    /// Returns how many files were closed. Close failures are logged and retried on the next
    /// sweep.
    pub fn sweep_idle(&self) -> usize {
        let open: Vec<(RegionPos, Arc<RegionFile>)> = self.open_files();
        let mut closed = 0;
        for (region, file) in &open {
            match file.close_if_timed_out() {
                Ok(true) => {
                    closed += 1;
                    log::debug!("closed idle region {region:?}");
                }
                Ok(false) => {}
                Err(error) => log::warn!(
                    "failed to close idle region file {}: {error}",
                    file.path().display()
                ),
            }
        }
        if closed > 0 {
            self.forget_closed();
        }
        closed
    }

    /// Attempts to close every open file. Returns `false` if any still had open streams.
    pub fn close_all(&self) -> Result<bool, StoreError> {
        let mut all_closed = true;
        let mut first_error = None;
        for (_, file) in self.open_files() {
            match file.attempt_close() {
                Ok(closed) => all_closed &= closed,
                Err(error) => {
                    all_closed = false;
                    first_error.get_or_insert(error);
                }
            }
        }
        self.forget_closed();
        match first_error {
            Some(error) => Err(error),
            None => Ok(all_closed),
        }
    }

    pub fn open_region_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, RegionSlot::Open(file) if !file.is_closed()))
            .count()
    }

    fn with_region<T>(
        &self,
        region: RegionPos,
        op: impl Fn(&RegionFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let file = self.open_file(region)?;
        match op(&*file) {
            // A sweep started closing the file between lookup and use. The second lookup waits
            // for that close to finish.
            Err(error) if error.is_closed() => {
                let file = self.open_file(region)?;
                op(&*file)
            }
            result => result,
        }
    }

    fn open_file(&self, region: RegionPos) -> Result<Arc<RegionFile>, StoreError> {
        loop {
            match self.get(region)? {
                RegionStore::Open(file) => return Ok(file),
                RegionStore::OpenInProgress => thread::yield_now(),
            }
        }
    }

    fn open_files(&self) -> Vec<(RegionPos, Arc<RegionFile>)> {
        self.slots()
            .iter()
            .filter_map(|(region, slot)| match slot {
                RegionSlot::Open(file) => Some((*region, file.clone())),
                RegionSlot::Opening => None,
            })
            .collect()
    }

    fn forget_closed(&self) {
        self.slots()
            .retain(|_, slot| !matches!(slot, RegionSlot::Open(file) if file.is_closed()));
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RegionPos, RegionSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RegionFileCache {
    fn drop(&mut self) {
        match self.close_all() {
            Ok(true) => {}
            Ok(false) => log::warn!("region cache dropped with busy region files"),
            Err(error) => log::warn!("failed to close region files on drop: {error}"),
        }
    }
}

/// Background thread that calls [`RegionFileCache::sweep_idle`] every sweep interval.
#[derive(Debug)]
pub struct IdleSweeper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    pub fn spawn(cache: Arc<RegionFileCache>) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let interval = cache.config().sweep_interval();
        let thread_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("region-idle-sweep".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    thread::park_timeout(interval);
                    if thread_shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    cache.sweep_idle();
                }
                log::debug!("idle sweeper stopped");
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Relaxed);
        handle.thread().unpark();
        if handle.join().is_err() {
            log::warn!("idle sweeper thread panicked");
        }
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionFileConfig;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

    fn test_root(name: &str) -> PathBuf {
        let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "region-store-cache-{name}-{}-{}",
            std::process::id(),
            serial
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn config(root: PathBuf, idle_timeout: Duration) -> RegionStoreConfig {
        let mut config = RegionStoreConfig::with_defaults(root);
        config.region = RegionFileConfig::default().with_idle_timeout(idle_timeout);
        config.sweep_interval_ms = 5;
        config
    }

    #[test]
    fn chunks_route_to_their_region_file() {
        let root = test_root("routing");
        let cache = RegionFileCache::new(config(root.clone(), Duration::from_secs(60)))
            .expect("create cache");

        let near = ChunkPos::new(3, 0, 15);
        let far = ChunkPos::new(-1, 16, 2);
        cache.write_chunk(near, b"near").expect("write near");
        cache.write_chunk(far, b"far").expect("write far");
        assert_eq!(cache.open_region_count(), 2);

        assert_eq!(
            cache.read_chunk(near).expect("read near"),
            Some(b"near".to_vec())
        );
        assert_eq!(cache.read_chunk(near.offset(1, 0, 0)).expect("read"), None);
        assert!(cache.region_path(far.region()).is_file());
        assert_eq!(
            cache.stored_regions().expect("list regions"),
            vec![RegionPos::new(-1, 1, 0), RegionPos::new(0, 0, 0)]
        );

        assert!(cache.delete_chunk(far).expect("delete far"));
        assert_eq!(cache.read_chunk(far).expect("read far"), None);
        assert!(cache.close_all().expect("close all"));
        assert_eq!(cache.open_region_count(), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn opening_region_is_reported_as_in_progress() {
        let root = test_root("opening");
        let cache = RegionFileCache::new(config(root.clone(), Duration::from_secs(60)))
            .expect("create cache");
        let region = RegionPos::new(2, -3, 0);
        cache.slots().insert(region, RegionSlot::Opening);

        let store = cache.get(region).expect("lookup");
        assert!(matches!(store, RegionStore::OpenInProgress));
        assert_eq!(store.state(), ContainerState::Opening);
        assert!(store.file().is_none());
        assert!(store.blob_array().open_read(0).expect("read").is_none());

        cache.slots().remove(&region);
        let store = cache.get(region).expect("lookup after open");
        assert_eq!(store.state(), ContainerState::Open);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn store_config_must_address_every_chunk() {
        let root = test_root("geometry");
        let mut config = config(root.clone(), Duration::from_secs(60));
        config.region = RegionFileConfig::new(9, 128);
        assert!(matches!(
            RegionFileCache::new(config),
            Err(StoreError::InvalidConfig(_))
        ));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn closing_file_is_waited_for_instead_of_handed_out() {
        let root = test_root("closing");
        let cache = RegionFileCache::new(config(root.clone(), Duration::from_secs(60)))
            .expect("create cache");
        let chunk = ChunkPos::new(4, 4, 4);
        cache.write_chunk(chunk, b"kept").expect("write chunk");
        let file = cache
            .get(chunk.region())
            .expect("lookup")
            .file()
            .cloned()
            .expect("open file");

        file.hold_closing(true);
        let store = cache.get(chunk.region()).expect("lookup while closing");
        assert!(matches!(store, RegionStore::OpenInProgress));

        let finished = AtomicBool::new(false);
        thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let bytes = cache.read_chunk(chunk).expect("read after close settles");
                finished.store(true, Ordering::Release);
                bytes
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!finished.load(Ordering::Acquire), "read went through a closing file");
            file.hold_closing(false);
            let bytes = reader.join().expect("reader thread");
            assert_eq!(bytes, Some(b"kept".to_vec()));
        });

        let current = cache
            .get(chunk.region())
            .expect("lookup after close settles")
            .file()
            .cloned()
            .expect("open file");
        assert!(Arc::ptr_eq(&file, &current));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn sweep_closes_idle_files_and_cache_reopens_them() {
        let root = test_root("sweep");
        let cache = RegionFileCache::new(config(root.clone(), Duration::from_millis(1)))
            .expect("create cache");
        let chunk = ChunkPos::new(20, 5, -7);
        cache.write_chunk(chunk, b"persisted").expect("write chunk");

        thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep_idle(), 1);
        assert_eq!(cache.open_region_count(), 0);

        assert_eq!(
            cache.read_chunk(chunk).expect("read after sweep"),
            Some(b"persisted".to_vec())
        );
        assert_eq!(cache.open_region_count(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn closed_handle_is_replaced_on_next_lookup() {
        let root = test_root("reopen");
        let cache = RegionFileCache::new(config(root.clone(), Duration::from_secs(60)))
            .expect("create cache");
        let chunk = ChunkPos::new(0, 0, 1);
        cache.write_chunk(chunk, b"one").expect("write chunk");

        let stale = cache
            .get(chunk.region())
            .expect("lookup")
            .file()
            .cloned()
            .expect("open file");
        assert!(stale.attempt_close().expect("close"));

        cache.write_chunk(chunk, b"two").expect("write after close");
        let fresh = cache
            .get(chunk.region())
            .expect("lookup")
            .file()
            .cloned()
            .expect("open file");
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(
            fresh
                .read_entry(chunk.local_index().get())
                .expect("read entry"),
            Some(b"two".to_vec())
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn sweeper_thread_closes_idle_regions() {
        let root = test_root("sweeper");
        let cache = Arc::new(
            RegionFileCache::new(config(root.clone(), Duration::from_millis(1)))
                .expect("create cache"),
        );
        cache
            .write_chunk(ChunkPos::new(1, 2, 3), b"idle")
            .expect("write chunk");
        let sweeper = IdleSweeper::spawn(cache.clone()).expect("spawn sweeper");

        let deadline = web_time::Instant::now() + Duration::from_secs(5);
        while cache.open_region_count() > 0 && web_time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        sweeper.stop();
        assert_eq!(cache.open_region_count(), 0);
        let _ = std::fs::remove_dir_all(root);
    }
}
