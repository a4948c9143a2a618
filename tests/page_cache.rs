//! # Shared Page Cache Tests
//!
//! Several stores share one page cache, partitioned by store path. These
//! tests cover:
//!
//! 1. Partition isolation: equal page ids in different stores never collide
//! 2. The cache stays within its capacity under a long run of commits
//! 3. A page whose background write is still running is never evicted
//! 4. Closing a store drops its partition from the cache

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use eyre::Result;
use parking_lot::Mutex;
use tempfile::tempdir;
use tristore::{
    CachePolicy, FileMode, FilePersistenceManager, PageCacheConfig, PageStore, PageStoreBuilder,
    PersistenceManager, SharedPageCache, StoreStream,
};

fn small_cache(policy: CachePolicy) -> SharedPageCache {
    // 1 MiB / 64 KiB = 16 entries.
    PageCacheConfig::new(1, 64 * 1024, policy).build()
}

fn fill(store: &dyn PageStore, commit_id: u64, pages: usize, byte: u8) {
    for _ in 0..pages {
        let page = store.create(commit_id).unwrap();
        store.write(commit_id, page.id(), &[byte; 16], 0, 0, 16).unwrap();
    }
    store.commit(commit_id, None).unwrap();
}

mod partition_tests {
    use super::*;

    #[test]
    fn stores_sharing_a_cache_keep_their_own_pages() {
        let dir = tempdir().unwrap();
        let cache = PageCacheConfig::default().build();

        let a = PageStoreBuilder::new()
            .path(dir.path().join("a.data"))
            .cache(cache.clone())
            .open()
            .unwrap();
        let b = PageStoreBuilder::new()
            .path(dir.path().join("b.data"))
            .cache(cache.clone())
            .open()
            .unwrap();

        fill(&a, 1, 3, 0xA1);
        fill(&b, 1, 3, 0xB2);

        for id in 1..=3 {
            assert_eq!(a.retrieve(id, None).unwrap().data().unwrap()[0], 0xA1);
            assert_eq!(b.retrieve(id, None).unwrap().data().unwrap()[0], 0xB2);
        }
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn closing_a_store_drops_its_partition() {
        let dir = tempdir().unwrap();
        let cache = PageCacheConfig::default().build();

        let a = PageStoreBuilder::new()
            .path(dir.path().join("a.data"))
            .cache(cache.clone())
            .open()
            .unwrap();
        let b = PageStoreBuilder::new()
            .path(dir.path().join("b.data"))
            .cache(cache.clone())
            .open()
            .unwrap();
        fill(&a, 1, 2, 1);
        fill(&b, 1, 4, 2);
        assert_eq!(cache.len(), 6);

        a.close().unwrap();
        assert_eq!(cache.len(), 4);
        drop(b);
        assert!(cache.is_empty());
    }
}

mod capacity_tests {
    use super::*;

    #[test]
    fn lru_cache_stays_bounded() {
        let dir = tempdir().unwrap();
        let cache = small_cache(CachePolicy::Lru);
        let store = PageStoreBuilder::new()
            .path(dir.path().join("a.data"))
            .cache(cache.clone())
            .open()
            .unwrap();

        for commit_id in 1..=10 {
            fill(&store, commit_id, 10, commit_id as u8);
            assert!(cache.len() <= cache.capacity());
        }
        assert!(cache.stats().evictions > 0);

        // Evicted pages are reloaded from the file.
        for id in 1..=100u64 {
            let expected = ((id - 1) / 10 + 1) as u8;
            assert_eq!(store.retrieve(id, None).unwrap().data().unwrap()[0], expected);
        }
    }

    #[test]
    fn circular_cache_stays_bounded() {
        let dir = tempdir().unwrap();
        let cache = small_cache(CachePolicy::CircularBuffer);
        let store = PageStoreBuilder::new()
            .path(dir.path().join("a.data"))
            .background_writes(false)
            .cache(cache.clone())
            .open()
            .unwrap();

        fill(&store, 1, 40, 7);
        assert_eq!(cache.len(), cache.capacity());
        assert_eq!(store.retrieve(1, None).unwrap().data().unwrap()[0], 7);
    }
}

/// Wraps a file whose first write blocks until the test releases it.
struct GatedFile {
    file: Box<dyn StoreStream>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl Read for GatedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for GatedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some((entered, release)) = self.gate.take() {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for GatedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl StoreStream for GatedFile {
    fn sync(&mut self) -> io::Result<()> {
        self.file.sync()
    }
}

/// File persistence whose next output stream is gated.
struct GatedPersistence {
    files: FilePersistenceManager,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl PersistenceManager for GatedPersistence {
    fn file_exists(&self, path: &Path) -> bool {
        self.files.file_exists(path)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        self.files.directory_exists(path)
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        self.files.create_file(path)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.files.delete_file(path)
    }

    fn input_stream(&self, path: &Path) -> Result<Box<dyn StoreStream>> {
        self.files.input_stream(path)
    }

    fn output_stream(&self, path: &Path, mode: FileMode) -> Result<Box<dyn StoreStream>> {
        let file = self.files.output_stream(path, mode)?;
        Ok(Box::new(GatedFile {
            file,
            gate: self.gate.lock().take(),
        }))
    }

    fn file_length(&self, path: &Path) -> Result<u64> {
        self.files.file_length(path)
    }

    fn list_subdirectories(&self, path: &Path) -> Result<Vec<String>> {
        self.files.list_subdirectories(path)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        self.files.rename_file(from, to)
    }

    fn copy_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        self.files.copy_file(from, to, overwrite)
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        self.files.create_directory(path)
    }

    fn delete_directory(&self, path: &Path) -> Result<()> {
        self.files.delete_directory(path)
    }
}

mod eviction_tests {
    use super::*;

    #[test]
    fn page_being_written_is_not_evicted() {
        let dir = tempdir().unwrap();
        let cache = small_cache(CachePolicy::Lru);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gated = Arc::new(GatedPersistence {
            files: FilePersistenceManager::new(),
            gate: Mutex::new(Some((entered_tx, release_rx))),
        });

        let slow = PageStoreBuilder::new()
            .path(dir.path().join("slow.data"))
            .persistence(gated)
            .cache(cache.clone())
            .open()
            .unwrap();
        let fast = PageStoreBuilder::new()
            .path(dir.path().join("fast.data"))
            .background_writes(false)
            .cache(cache.clone())
            .open()
            .unwrap();

        let page = slow.create(1).unwrap();
        slow.write(1, page.id(), b"pending", 0, 0, 7).unwrap();

        thread::scope(|s| {
            let commit = s.spawn(|| slow.commit(1, None));

            // The background writer is now blocked inside the page write.
            entered_rx.recv().unwrap();
            while cache.is_empty() {
                thread::yield_now();
            }

            fill(&fast, 1, 20, 3);
            assert!(cache.stats().vetoed >= 1);
            assert!(cache.len() <= cache.capacity());

            release_tx.send(()).unwrap();
            commit.join().unwrap().unwrap();
        });

        assert_eq!(&slow.retrieve(1, None).unwrap().data().unwrap()[..7], b"pending");
        let on_disk = std::fs::read(dir.path().join("slow.data")).unwrap();
        assert_eq!(&on_disk[..7], b"pending");
    }
}
