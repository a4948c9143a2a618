//! # Page Stores
//!
//! A page store manages one file of fixed-size pages. The layers above talk
//! to it through the [`PageStore`] trait:
//!
//! ```text
//! create(commit_id)        -> new page, writeable until commit
//! write(commit_id, id, ..) -> copy bytes into a writeable page
//! commit(commit_id)        -> persist every page touched since last commit
//! retrieve(id)             -> committed (or pending) page
//! ```
//!
//! Two implementations exist, selected by [`StoreKind`]:
//!
//! | Kind         | Update model                          | Stale readers            |
//! |--------------|---------------------------------------|--------------------------|
//! | `AppendOnly` | new page ids past the watermark       | never invalidated        |
//! | `Binary`     | in place, dual buffer per page        | `StoreModified` after two commits |
//!
//! [`AnyPageStore`] wraps either one so callers can hold a store without
//! generics.
//!
//! ## Concurrency
//!
//! Every method takes `&self`. Reads may run from many threads at once;
//! writes belong to a single writer transaction at a time. Stores subscribe
//! to the shared cache's eviction hooks when opened and unsubscribe on
//! `close()` or drop.

mod append_only;
mod binary;

pub use append_only::AppendOnlyFilePageStore;
pub use binary::BinaryFilePageStore;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;

use crate::cache::{PageCacheConfig, Partition, SharedPageCache};
use crate::config::DEFAULT_PAGE_SIZE;
use crate::page::{Page, PageHandle};
use crate::persistence::{FilePersistenceManager, PersistenceManager};
use crate::profiler::Profiler;
use crate::{PageId, TransactionId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    #[default]
    AppendOnly,
    Binary,
}

pub trait PageStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn path(&self) -> &Path;

    /// Usable data bytes per page.
    fn page_size(&self) -> usize;

    fn can_read(&self) -> bool;

    fn can_write(&self) -> bool;

    /// Id the next `create` will return.
    fn next_page_id(&self) -> PageId;

    fn retrieve(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<PageHandle>;

    fn create(&self, commit_id: TransactionId) -> Result<PageHandle>;

    fn write(
        &self,
        commit_id: TransactionId,
        page_id: PageId,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()>;

    fn commit(&self, commit_id: TransactionId, profiler: Option<&Profiler>) -> Result<()>;

    fn is_writeable(&self, page: &dyn Page) -> bool;

    /// Returns a page that can be written under `commit_id` holding the
    /// contents of `page`.
    fn get_writeable_page(&self, commit_id: TransactionId, page: &dyn Page)
        -> Result<PageHandle>;

    fn mark_dirty(&self, commit_id: TransactionId, page_id: PageId) -> Result<()>;

    /// Warms the cache and returns the number of pages loaded.
    fn preload(&self, num_pages: usize, profiler: Option<&Profiler>) -> Result<usize>;

    /// Releases streams, the background writer and cached pages. Pending
    /// uncommitted changes are discarded.
    fn close(&self) -> Result<()>;
}

/// Settings shared by both store kinds.
#[derive(Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub page_size: usize,
    pub read_only: bool,
    pub background_writes: bool,
    pub current_transaction_id: TransactionId,
    pub cache: SharedPageCache,
    pub persistence: Arc<dyn PersistenceManager>,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            background_writes: true,
            current_transaction_id: 0,
            cache: PageCacheConfig::default().build(),
            persistence: Arc::new(FilePersistenceManager::new()),
        }
    }

    pub(crate) fn partition(&self) -> Partition {
        Arc::from(self.path.to_string_lossy().as_ref())
    }
}

pub enum AnyPageStore {
    AppendOnly(AppendOnlyFilePageStore),
    Binary(BinaryFilePageStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $body:expr) => {
        match $self {
            AnyPageStore::AppendOnly($store) => $body,
            AnyPageStore::Binary($store) => $body,
        }
    };
}

impl AnyPageStore {
    pub fn as_append_only(&self) -> Option<&AppendOnlyFilePageStore> {
        match self {
            AnyPageStore::AppendOnly(s) => Some(s),
            AnyPageStore::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryFilePageStore> {
        match self {
            AnyPageStore::Binary(s) => Some(s),
            AnyPageStore::AppendOnly(_) => None,
        }
    }
}

impl PageStore for AnyPageStore {
    fn kind(&self) -> StoreKind {
        dispatch!(self, s => s.kind())
    }

    fn path(&self) -> &Path {
        dispatch!(self, s => s.path())
    }

    fn page_size(&self) -> usize {
        dispatch!(self, s => s.page_size())
    }

    fn can_read(&self) -> bool {
        dispatch!(self, s => s.can_read())
    }

    fn can_write(&self) -> bool {
        dispatch!(self, s => s.can_write())
    }

    fn next_page_id(&self) -> PageId {
        dispatch!(self, s => s.next_page_id())
    }

    fn retrieve(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<PageHandle> {
        dispatch!(self, s => s.retrieve(page_id, profiler))
    }

    fn create(&self, commit_id: TransactionId) -> Result<PageHandle> {
        dispatch!(self, s => s.create(commit_id))
    }

    fn write(
        &self,
        commit_id: TransactionId,
        page_id: PageId,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        dispatch!(self, s => s.write(commit_id, page_id, data, src_offset, page_offset, len))
    }

    fn commit(&self, commit_id: TransactionId, profiler: Option<&Profiler>) -> Result<()> {
        dispatch!(self, s => s.commit(commit_id, profiler))
    }

    fn is_writeable(&self, page: &dyn Page) -> bool {
        dispatch!(self, s => s.is_writeable(page))
    }

    fn get_writeable_page(
        &self,
        commit_id: TransactionId,
        page: &dyn Page,
    ) -> Result<PageHandle> {
        dispatch!(self, s => s.get_writeable_page(commit_id, page))
    }

    fn mark_dirty(&self, commit_id: TransactionId, page_id: PageId) -> Result<()> {
        dispatch!(self, s => s.mark_dirty(commit_id, page_id))
    }

    fn preload(&self, num_pages: usize, profiler: Option<&Profiler>) -> Result<usize> {
        dispatch!(self, s => s.preload(num_pages, profiler))
    }

    fn close(&self) -> Result<()> {
        dispatch!(self, s => s.close())
    }
}
