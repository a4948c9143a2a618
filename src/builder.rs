//! # Store Builder
//!
//! `PageStoreBuilder` collects the settings of one page store and opens it.
//! Settings can be chained in any order before calling `open()`.
//!
//! | Option                 | Default                      |
//! |------------------------|------------------------------|
//! | kind                   | `StoreKind::AppendOnly`      |
//! | page_size              | 4096                         |
//! | read_only              | false                        |
//! | background_writes      | true (append-only only)      |
//! | preload_pages          | 0                            |
//! | current_transaction_id | 0 (binary only)              |
//! | cache                  | new LRU cache, 64 MiB        |
//! | persistence            | `FilePersistenceManager`     |
//!
//! Stores that should share a cache must be given the same
//! [`SharedPageCache`]:
//!
//! ```ignore
//! let cache = PageCacheConfig::new(32, 4096, CachePolicy::Lru).build();
//!
//! let resources = PageStoreBuilder::new()
//!     .path("./data/resources.data")
//!     .cache(cache.clone())
//!     .open()?;
//!
//! let index = PageStoreBuilder::new()
//!     .path("./data/index.data")
//!     .kind(StoreKind::Binary)
//!     .current_transaction_id(last_commit)
//!     .cache(cache)
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{eyre, Result};
use tracing::debug;

use crate::cache::SharedPageCache;
use crate::config::DEFAULT_PRELOAD_PAGES;
use crate::persistence::PersistenceManager;
use crate::store::{
    AnyPageStore, AppendOnlyFilePageStore, BinaryFilePageStore, PageStore, StoreKind,
    StoreOptions,
};
use crate::TransactionId;

pub struct PageStoreBuilder {
    path: Option<PathBuf>,
    kind: StoreKind,
    page_size: Option<usize>,
    read_only: bool,
    background_writes: bool,
    preload_pages: usize,
    current_transaction_id: TransactionId,
    cache: Option<SharedPageCache>,
    persistence: Option<Arc<dyn PersistenceManager>>,
}

impl Default for PageStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStoreBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            kind: StoreKind::default(),
            page_size: None,
            read_only: false,
            background_writes: true,
            preload_pages: DEFAULT_PRELOAD_PAGES,
            current_transaction_id: 0,
            cache: None,
            persistence: None,
        }
    }

    /// Path of the store file. Required.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn kind(mut self, kind: StoreKind) -> Self {
        self.kind = kind;
        self
    }

    /// Nominal page size. Append-only stores require a multiple of 4096;
    /// binary stores require at least 64 bytes and reserve 8 of them for
    /// the transaction tag.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Routes append-only commits through a background writer. Ignored by
    /// binary stores.
    pub fn background_writes(mut self, enabled: bool) -> Self {
        self.background_writes = enabled;
        self
    }

    /// Number of pages to load into the cache right after opening.
    pub fn preload_pages(mut self, num_pages: usize) -> Self {
        self.preload_pages = num_pages;
        self
    }

    /// Last committed transaction of a binary store, as recorded by the
    /// caller.
    pub fn current_transaction_id(mut self, tx: TransactionId) -> Self {
        self.current_transaction_id = tx;
        self
    }

    pub fn cache(mut self, cache: SharedPageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn open(self) -> Result<AnyPageStore> {
        let path = self
            .path
            .ok_or_else(|| eyre!("a store path is required"))?;

        let mut options = StoreOptions::new(path);
        if let Some(page_size) = self.page_size {
            options.page_size = page_size;
        }
        options.read_only = self.read_only;
        options.background_writes = self.background_writes;
        options.current_transaction_id = self.current_transaction_id;
        if let Some(cache) = self.cache {
            options.cache = cache;
        }
        if let Some(persistence) = self.persistence {
            options.persistence = persistence;
        }

        let store = match self.kind {
            StoreKind::AppendOnly => {
                AnyPageStore::AppendOnly(AppendOnlyFilePageStore::open(options)?)
            }
            StoreKind::Binary => AnyPageStore::Binary(BinaryFilePageStore::open(options)?),
        };

        if self.preload_pages > 0 {
            let loaded = store.preload(self.preload_pages, None)?;
            debug!(requested = self.preload_pages, loaded, "preloaded store");
        }
        Ok(store)
    }
}
