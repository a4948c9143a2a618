//! Append-only page store.
//!
//! ## File Layout
//!
//! Page `N` lives at `(N - 1) * page_size`. The file only grows: a committed
//! page is never written again.
//!
//! ```text
//! +---------+---------+---------+---------+---------+
//! | page 1  | page 2  | page 3  | page 4  | page 5  |
//! +---------+---------+---------+---------+---------+
//! |<---- committed, immutable ---->|<-- new pages -->|
//!                                  ^                 ^
//!                          new_page_offset      next_page_id
//! ```
//!
//! Pages at or above `new_page_offset` were created by the current
//! transaction and are still writeable. Updating committed data means
//! allocating a new page (see `get_writeable_page`).
//!
//! ## Commit
//!
//! With background writes enabled, every new page is queued on the
//! [`BackgroundPageWriter`] and the commit waits on `flush()`. Otherwise the
//! pages are written synchronously to a fresh output stream. Either way the
//! pages are inserted into the shared cache, sealed, and the watermark moves
//! up to `next_page_id`.
//!
//! ## Eviction
//!
//! A page still pending in the background writer is retained by the cache;
//! dropping it would leave `retrieve` reading a page that is not on disk yet.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{PageStore, StoreKind, StoreOptions};
use crate::cache::{
    CachedPage, EvictionDecision, EvictionHandler, Partition, SharedPageCache,
};
use crate::config::PAGE_SIZE_ALIGNMENT;
use crate::error::StoreError;
use crate::page::{AppendOnlyFilePage, Page, PageHandle, PersistentPage};
use crate::persistence::{FileMode, PersistenceManager, StoreStream};
use crate::profiler::Profiler;
use crate::writer::{BackgroundPageWriter, WriterStats};
use crate::{PageId, TransactionId};

struct Allocation {
    next_page_id: PageId,
    new_page_offset: PageId,
    new_pages: Vec<Arc<AppendOnlyFilePage>>,
}

impl Allocation {
    fn new_page(&self, page_id: PageId) -> Option<&Arc<AppendOnlyFilePage>> {
        if page_id < self.new_page_offset {
            return None;
        }
        self.new_pages.get((page_id - self.new_page_offset) as usize)
    }
}

struct Inner {
    options: StoreOptions,
    partition: Partition,
    input: Mutex<Option<Box<dyn StoreStream>>>,
    allocation: Mutex<Allocation>,
    writer: Option<BackgroundPageWriter<AppendOnlyFilePage>>,
    closed: AtomicBool,
}

pub struct AppendOnlyFilePageStore {
    inner: Arc<Inner>,
}

impl AppendOnlyFilePageStore {
    pub fn open(options: StoreOptions) -> Result<Self> {
        let page_size = options.page_size;
        if page_size == 0 || page_size % PAGE_SIZE_ALIGNMENT != 0 {
            return Err(StoreError::InvalidPageSize {
                page_size,
                reason: "append-only page size must be a non-zero multiple of 4096",
            }
            .into());
        }

        let path = options.path.clone();
        let pm = options.persistence.clone();
        if !pm.file_exists(&path) {
            ensure!(
                !options.read_only,
                StoreError::StoreNotFound { path: path.clone() }
            );
            pm.create_file(&path)?;
        }

        let length = pm.file_length(&path)?;
        let next_page_id = 1 + length / page_size as u64;
        let input = pm
            .input_stream(&path)
            .wrap_err_with(|| format!("failed to open page store '{}'", path.display()))?;

        let writer = if options.background_writes && !options.read_only {
            let out = pm.output_stream(&path, FileMode::OpenOrCreate)?;
            Some(BackgroundPageWriter::new(&path, out)?)
        } else {
            None
        };

        let inner = Arc::new(Inner {
            partition: options.partition(),
            options,
            input: Mutex::new(Some(input)),
            allocation: Mutex::new(Allocation {
                next_page_id,
                new_page_offset: next_page_id,
                new_pages: Vec::new(),
            }),
            writer,
            closed: AtomicBool::new(false),
        });

        let handler: Arc<dyn EvictionHandler> = inner.clone();
        inner
            .options
            .cache
            .subscribe(&inner.partition, Arc::downgrade(&handler));

        info!(
            path = %path.display(),
            page_size,
            next_page_id,
            read_only = inner.options.read_only,
            background_writes = inner.writer.is_some(),
            "opened append-only page store"
        );
        Ok(Self { inner })
    }

    pub fn writer_stats(&self) -> Option<WriterStats> {
        self.inner.writer.as_ref().map(BackgroundPageWriter::stats)
    }

    /// First page id that was not committed when the current transaction
    /// started.
    pub fn new_page_offset(&self) -> PageId {
        self.inner.allocation.lock().new_page_offset
    }

    /// Number of pages in the store, committed or pending.
    pub fn page_count(&self) -> u64 {
        self.inner.allocation.lock().next_page_id - 1
    }

    fn cache(&self) -> &SharedPageCache {
        &self.inner.options.cache
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.inner.closed.load(Ordering::Acquire),
            StoreError::StoreClosed {
                path: self.inner.options.path.clone()
            }
        );
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        ensure!(
            !self.inner.options.read_only,
            StoreError::ReadOnlyStore {
                path: self.inner.options.path.clone()
            }
        );
        Ok(())
    }

    fn load(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<Arc<AppendOnlyFilePage>> {
        let _step = Profiler::step(profiler, "retrieve.load");
        let mut input = self.inner.input.lock();
        let input = input.as_mut().ok_or_else(|| StoreError::StoreClosed {
            path: self.inner.options.path.clone(),
        })?;
        let page = AppendOnlyFilePage::load(page_id, self.inner.options.page_size, &mut **input)
            .wrap_err_with(|| {
                format!(
                    "failed to load page {} from '{}'",
                    page_id,
                    self.inner.options.path.display()
                )
            })?;
        Ok(Arc::new(page))
    }

    fn write_pages(
        &self,
        pages: &[Arc<AppendOnlyFilePage>],
        commit_id: TransactionId,
        profiler: Option<&Profiler>,
    ) -> Result<()> {
        match &self.inner.writer {
            Some(writer) => {
                {
                    let _step = Profiler::step(profiler, "commit.write");
                    for page in pages {
                        writer.queue_write(page.clone(), commit_id)?;
                        self.cache()
                            .insert_or_update(&self.inner.partition, CachedPage::AppendOnly(page.clone()));
                    }
                }
                let _step = Profiler::step(profiler, "commit.flush");
                writer.flush()
            }
            None => {
                let mut out = self
                    .inner
                    .options
                    .persistence
                    .output_stream(&self.inner.options.path, FileMode::OpenOrCreate)?;
                {
                    let _step = Profiler::step(profiler, "commit.write");
                    for page in pages {
                        page.write(&mut *out, commit_id)?;
                    }
                }
                {
                    let _step = Profiler::step(profiler, "commit.flush");
                    out.sync().wrap_err_with(|| {
                        format!("failed to sync '{}'", self.inner.options.path.display())
                    })?;
                }
                for page in pages {
                    self.cache()
                        .insert_or_update(&self.inner.partition, CachedPage::AppendOnly(page.clone()));
                }
                Ok(())
            }
        }
    }
}

impl EvictionHandler for Inner {
    fn before_evict(&self, page_id: PageId) -> EvictionDecision {
        match &self.writer {
            Some(writer) if writer.is_pending(page_id) => {
                debug!(page_id, "retaining page with pending background write");
                EvictionDecision::Retain
            }
            _ => EvictionDecision::Evict,
        }
    }
}

impl PageStore for AppendOnlyFilePageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::AppendOnly
    }

    fn path(&self) -> &Path {
        &self.inner.options.path
    }

    fn page_size(&self) -> usize {
        self.inner.options.page_size
    }

    fn can_read(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    fn can_write(&self) -> bool {
        self.can_read() && !self.inner.options.read_only
    }

    fn next_page_id(&self) -> PageId {
        self.inner.allocation.lock().next_page_id
    }

    fn retrieve(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<PageHandle> {
        let _step = Profiler::step(profiler, "retrieve");
        self.ensure_open()?;

        {
            let allocation = self.inner.allocation.lock();
            if page_id == 0 || page_id >= allocation.next_page_id {
                return Err(StoreError::PageNotFound { page_id }.into());
            }
            if let Some(page) = allocation.new_page(page_id) {
                return Ok(page.clone());
            }
        }

        if let Some(page) = self.inner.writer.as_ref().and_then(|w| w.try_get_page(page_id)) {
            return Ok(page);
        }

        if let Some(CachedPage::AppendOnly(page)) =
            self.cache().lookup(&self.inner.partition, page_id)
        {
            return Ok(page);
        }

        let page = self.load(page_id, profiler)?;
        self.cache()
            .insert_or_update(&self.inner.partition, CachedPage::AppendOnly(page.clone()));
        Ok(page)
    }

    fn create(&self, commit_id: TransactionId) -> Result<PageHandle> {
        self.ensure_writable()?;

        let mut allocation = self.inner.allocation.lock();
        let page_id = allocation.next_page_id;
        allocation.next_page_id += 1;
        let page = Arc::new(AppendOnlyFilePage::new(page_id, self.inner.options.page_size));
        allocation.new_pages.push(page.clone());

        debug!(page_id, commit_id, "created page");
        Ok(page)
    }

    fn write(
        &self,
        _commit_id: TransactionId,
        page_id: PageId,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.ensure_writable()?;

        let allocation = self.inner.allocation.lock();
        if page_id == 0 || page_id >= allocation.next_page_id {
            return Err(StoreError::UnreservedPage {
                page_id,
                next_page_id: allocation.next_page_id,
            }
            .into());
        }
        match allocation.new_page(page_id) {
            Some(page) => page.set_data(data, src_offset, page_offset, len),
            None => Err(StoreError::PageNotWriteable { page_id }.into()),
        }
    }

    fn commit(&self, commit_id: TransactionId, profiler: Option<&Profiler>) -> Result<()> {
        let _step = Profiler::step(profiler, "commit");
        self.ensure_writable()?;

        let pages = self.inner.allocation.lock().new_pages.clone();
        if pages.is_empty() {
            debug!(commit_id, "nothing to commit");
            return Ok(());
        }

        let result = self.write_pages(&pages, commit_id, profiler);

        let mut allocation = self.inner.allocation.lock();
        allocation.new_pages.clear();
        allocation.new_page_offset = allocation.next_page_id;
        drop(allocation);

        for page in &pages {
            page.seal();
        }

        match result {
            Ok(()) => {
                info!(commit_id, pages = pages.len(), "committed append-only store");
                Ok(())
            }
            Err(e) => {
                // Cached copies may not have reached the file.
                self.cache().clear(&self.inner.partition);
                warn!(commit_id, error = %format!("{:#}", e), "commit failed");
                Err(e.wrap_err(StoreError::CommitFailed { commit_id }))
            }
        }
    }

    fn is_writeable(&self, page: &dyn Page) -> bool {
        self.can_write() && page.id() >= self.inner.allocation.lock().new_page_offset
    }

    fn get_writeable_page(&self, commit_id: TransactionId, page: &dyn Page) -> Result<PageHandle> {
        self.ensure_writable()?;

        if let Some(existing) = self.inner.allocation.lock().new_page(page.id()) {
            return Ok(existing.clone());
        }

        let copy = self.create(commit_id)?;
        let data = page.data()?;
        let len = data.len().min(copy.size());
        copy.set_data(&data, 0, 0, len)?;
        debug!(from = page.id(), to = copy.id(), commit_id, "copied committed page");
        Ok(copy)
    }

    fn mark_dirty(&self, _commit_id: TransactionId, page_id: PageId) -> Result<()> {
        self.ensure_writable()?;
        match self.inner.allocation.lock().new_page(page_id) {
            Some(page) => {
                page.mark_dirty();
                Ok(())
            }
            None => Err(StoreError::PageNotWriteable { page_id }.into()),
        }
    }

    fn preload(&self, num_pages: usize, profiler: Option<&Profiler>) -> Result<usize> {
        let _step = Profiler::step(profiler, "preload");
        self.ensure_open()?;

        let committed = self.new_page_offset() - 1;
        let count = committed.min(num_pages as u64);
        for page_id in 1..=count {
            if self.cache().lookup(&self.inner.partition, page_id).is_none() {
                let page = self.load(page_id, profiler)?;
                self.cache()
                    .insert_or_update(&self.inner.partition, CachedPage::AppendOnly(page));
            }
        }
        debug!(count, "preloaded pages");
        Ok(count as usize)
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = match &self.inner.writer {
            Some(writer) => writer.shutdown(),
            None => Ok(()),
        };

        self.cache().unsubscribe(&self.inner.partition);
        self.cache().clear(&self.inner.partition);
        self.inner.input.lock().take();

        let discarded = {
            let mut allocation = self.inner.allocation.lock();
            let n = allocation.new_pages.len();
            allocation.new_pages.clear();
            n
        };
        if discarded > 0 {
            debug!(discarded, "discarded uncommitted pages on close");
        }
        info!(path = %self.inner.options.path.display(), "closed append-only page store");
        result
    }
}

impl Drop for AppendOnlyFilePageStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(
                path = %self.inner.options.path.display(),
                error = %format!("{:#}", e),
                "failed to close page store cleanly"
            );
        }
    }
}
