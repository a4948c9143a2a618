//! Binary (dual-buffer) page store.
//!
//! Every page has two slots on disk, each tagged with the transaction that
//! wrote it (see [`BinaryFilePage`]). A commit rewrites, in place, the slot
//! that readers at the last committed transaction are not using, so one
//! commit can proceed while readers of the previous state keep working.
//!
//! ## Transactions
//!
//! ```text
//! committed_tx = 4                   commit(5)
//! +--------------+--------------+    +--------------+--------------+
//! | tx 3 | old   | tx 4 | cur   | -> | tx 5 | new   | tx 4 | cur   |
//! +--------------+--------------+    +--------------+--------------+
//!   write slot     read slot           read slot      (kept for tx 4)
//! ```
//!
//! A reader pinned at transaction 3 fails with `StoreModified` once both
//! slots are newer than 3.
//!
//! ## Modified Pages
//!
//! Pages touched by the current transaction are tracked in an ordered map
//! until commit, which writes them in page-id order to a fresh output
//! stream. If the cache wants to evict a tracked page before commit, the
//! in-progress slot is flushed to disk first. This is safe because its tag
//! is newer than any committed reader's transaction.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{PageStore, StoreKind, StoreOptions};
use crate::cache::{CachedPage, EvictionDecision, EvictionHandler, Partition, SharedPageCache};
use crate::error::StoreError;
use crate::page::{BinaryFilePage, BinaryPageAdapter, Page, PageHandle};
use crate::persistence::{FileMode, StoreStream};
use crate::profiler::Profiler;
use crate::{PageId, TransactionId};

struct Transaction {
    next_page_id: PageId,
    modified: BTreeMap<PageId, Arc<BinaryFilePage>>,
    in_flight: Option<TransactionId>,
}

struct Inner {
    options: StoreOptions,
    partition: Partition,
    data_size: usize,
    input: Mutex<Option<Box<dyn StoreStream>>>,
    committed_tx: AtomicU64,
    transaction: Mutex<Transaction>,
    closed: AtomicBool,
}

pub struct BinaryFilePageStore {
    inner: Arc<Inner>,
}

impl Inner {
    fn committed(&self) -> TransactionId {
        self.committed_tx.load(Ordering::Acquire)
    }

    fn write_page(&self, page: &BinaryFilePage, commit_id: TransactionId) -> Result<()> {
        let mut out = self
            .options
            .persistence
            .output_stream(&self.options.path, FileMode::OpenOrCreate)?;
        page.write_to(&mut *out, self.committed(), commit_id)?;
        out.sync()
            .wrap_err_with(|| format!("failed to sync '{}'", self.options.path.display()))?;
        Ok(())
    }
}

impl EvictionHandler for Inner {
    fn before_evict(&self, page_id: PageId) -> EvictionDecision {
        let (page, commit_id) = {
            let transaction = self.transaction.lock();
            match (transaction.modified.get(&page_id), transaction.in_flight) {
                (Some(page), Some(commit_id)) if page.is_dirty() => (page.clone(), commit_id),
                _ => return EvictionDecision::Evict,
            }
        };

        match self.write_page(&page, commit_id) {
            Ok(()) => {
                debug!(page_id, commit_id, "flushed modified page before eviction");
                EvictionDecision::Evict
            }
            Err(e) => {
                warn!(
                    page_id,
                    error = %format!("{:#}", e),
                    "failed to flush modified page, retaining it"
                );
                EvictionDecision::Retain
            }
        }
    }
}

impl BinaryFilePageStore {
    pub fn open(options: StoreOptions) -> Result<Self> {
        let data_size = BinaryFilePage::data_size(options.page_size)?;
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
        let next_page_id = 1 + length.div_ceil(2 * options.page_size as u64);
        let input = pm
            .input_stream(&path)
            .wrap_err_with(|| format!("failed to open page store '{}'", path.display()))?;

        let committed = options.current_transaction_id;
        let inner = Arc::new(Inner {
            partition: options.partition(),
            options,
            data_size,
            input: Mutex::new(Some(input)),
            committed_tx: AtomicU64::new(committed),
            transaction: Mutex::new(Transaction {
                next_page_id,
                modified: BTreeMap::new(),
                in_flight: None,
            }),
            closed: AtomicBool::new(false),
        });

        let handler: Arc<dyn EvictionHandler> = inner.clone();
        inner
            .options
            .cache
            .subscribe(&inner.partition, Arc::downgrade(&handler));

        info!(
            path = %path.display(),
            page_size = inner.options.page_size,
            next_page_id,
            committed,
            read_only = inner.options.read_only,
            "opened binary page store"
        );
        Ok(Self { inner })
    }

    /// Transaction id of the last successful commit.
    pub fn current_transaction_id(&self) -> TransactionId {
        self.inner.committed()
    }

    /// Nominal on-disk page size; each slot holds `page_size()` data bytes
    /// after its transaction tag.
    pub fn nominal_page_size(&self) -> usize {
        self.inner.options.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.inner.transaction.lock().next_page_id - 1
    }

    /// Returns page `page_id` as seen by a reader at transaction `tx`.
    pub fn retrieve_at(&self, page_id: PageId, tx: TransactionId) -> Result<PageHandle> {
        self.ensure_open()?;
        let page = self.page(page_id, None)?;
        // Fail now rather than on first data access.
        page.read_slot(tx)?;
        Ok(Arc::new(BinaryPageAdapter::reader(page, tx)))
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

    fn ensure_writable(&self, commit_id: TransactionId) -> Result<()> {
        self.ensure_open()?;
        ensure!(
            !self.inner.options.read_only,
            StoreError::ReadOnlyStore {
                path: self.inner.options.path.clone()
            }
        );
        let committed = self.inner.committed();
        ensure!(
            commit_id > committed,
            "commit id {} must be greater than the last committed transaction {}",
            commit_id,
            committed
        );
        Ok(())
    }

    /// Loads a committed page through the cache. Never holds the
    /// transaction lock while touching the cache.
    fn page(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<Arc<BinaryFilePage>> {
        {
            let transaction = self.inner.transaction.lock();
            if page_id == 0 || page_id >= transaction.next_page_id {
                return Err(StoreError::PageNotFound { page_id }.into());
            }
            if let Some(page) = transaction.modified.get(&page_id) {
                return Ok(page.clone());
            }
        }

        if let Some(CachedPage::Binary(page)) = self.cache().lookup(&self.inner.partition, page_id) {
            return Ok(page);
        }

        let page = {
            let _step = Profiler::step(profiler, "retrieve.load");
            let mut input = self.inner.input.lock();
            let input = input.as_mut().ok_or_else(|| StoreError::StoreClosed {
                path: self.inner.options.path.clone(),
            })?;
            Arc::new(
                BinaryFilePage::load(page_id, self.inner.options.page_size, &mut **input)
                    .wrap_err_with(|| {
                        format!(
                            "failed to load page {} from '{}'",
                            page_id,
                            self.inner.options.path.display()
                        )
                    })?,
            )
        };
        self.cache()
            .insert_or_update(&self.inner.partition, CachedPage::Binary(page.clone()));
        Ok(page)
    }

    /// Registers `page_id` as modified by `commit_id` and returns it.
    ///
    /// The first time a page joins the transaction its write slot is rebuilt
    /// from the committed slot, so bytes left by an abandoned or failed
    /// commit under the same id are never carried forward.
    fn track(&self, commit_id: TransactionId, page_id: PageId) -> Result<Arc<BinaryFilePage>> {
        {
            let transaction = self.inner.transaction.lock();
            if page_id == 0 || page_id >= transaction.next_page_id {
                return Err(StoreError::UnreservedPage {
                    page_id,
                    next_page_id: transaction.next_page_id,
                }
                .into());
            }
        }

        let page = self.page(page_id, None)?;
        let committed = self.inner.committed();
        let mut transaction = self.inner.transaction.lock();
        transaction.in_flight = Some(commit_id);
        match transaction.modified.entry(page_id) {
            Entry::Occupied(tracked) => Ok(tracked.get().clone()),
            Entry::Vacant(slot) => {
                page.begin_write(committed, commit_id)?;
                Ok(slot.insert(page).clone())
            }
        }
    }

    fn writer_handle(&self, page: Arc<BinaryFilePage>, commit_id: TransactionId) -> PageHandle {
        Arc::new(BinaryPageAdapter::writer(
            page,
            self.inner.committed(),
            commit_id,
        ))
    }
}

impl PageStore for BinaryFilePageStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Binary
    }

    fn path(&self) -> &Path {
        &self.inner.options.path
    }

    fn page_size(&self) -> usize {
        self.inner.data_size
    }

    fn can_read(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    fn can_write(&self) -> bool {
        self.can_read() && !self.inner.options.read_only
    }

    fn next_page_id(&self) -> PageId {
        self.inner.transaction.lock().next_page_id
    }

    fn retrieve(&self, page_id: PageId, profiler: Option<&Profiler>) -> Result<PageHandle> {
        let _step = Profiler::step(profiler, "retrieve");
        self.ensure_open()?;

        let page = self.page(page_id, profiler)?;
        let in_flight = {
            let transaction = self.inner.transaction.lock();
            transaction
                .in_flight
                .filter(|_| transaction.modified.contains_key(&page_id))
        };
        Ok(match in_flight {
            Some(commit_id) => self.writer_handle(page, commit_id),
            None => Arc::new(BinaryPageAdapter::reader(page, self.inner.committed())),
        })
    }

    fn create(&self, commit_id: TransactionId) -> Result<PageHandle> {
        self.ensure_writable(commit_id)?;

        let page = {
            let mut transaction = self.inner.transaction.lock();
            let page_id = transaction.next_page_id;
            let page = Arc::new(BinaryFilePage::new(page_id, self.inner.options.page_size)?);
            page.begin_write(self.inner.committed(), commit_id)?;
            transaction.next_page_id += 1;
            transaction.modified.insert(page_id, page.clone());
            transaction.in_flight = Some(commit_id);
            page
        };

        debug!(page_id = page.id(), commit_id, "created page");
        Ok(self.writer_handle(page, commit_id))
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
        self.ensure_writable(commit_id)?;
        let page = self.track(commit_id, page_id)?;
        page.set_data(
            self.inner.committed(),
            commit_id,
            data,
            src_offset,
            page_offset,
            len,
        )
    }

    fn commit(&self, commit_id: TransactionId, profiler: Option<&Profiler>) -> Result<()> {
        let _step = Profiler::step(profiler, "commit");
        self.ensure_writable(commit_id)?;

        let modified = {
            let mut transaction = self.inner.transaction.lock();
            transaction.in_flight = None;
            std::mem::take(&mut transaction.modified)
        };

        let committed = self.inner.committed();
        let result = (|| -> Result<()> {
            if modified.is_empty() {
                return Ok(());
            }
            let mut out = self
                .inner
                .options
                .persistence
                .output_stream(&self.inner.options.path, FileMode::OpenOrCreate)?;
            {
                let _step = Profiler::step(profiler, "commit.write");
                for page in modified.values() {
                    page.write_to(&mut *out, committed, commit_id)?;
                }
            }
            let _step = Profiler::step(profiler, "commit.flush");
            out.sync()
                .wrap_err_with(|| format!("failed to sync '{}'", self.inner.options.path.display()))
        })();

        if let Err(e) = result {
            warn!(commit_id, error = %format!("{:#}", e), "commit failed");
            return Err(e.wrap_err(StoreError::CommitFailed { commit_id }));
        }

        self.inner.committed_tx.store(commit_id, Ordering::Release);
        for page in modified.values() {
            self.cache()
                .insert_or_update(&self.inner.partition, CachedPage::Binary(page.clone()));
        }
        info!(commit_id, pages = modified.len(), "committed binary store");
        Ok(())
    }

    fn is_writeable(&self, page: &dyn Page) -> bool {
        self.can_write() && page.id() > 0 && page.id() < self.next_page_id()
    }

    fn get_writeable_page(&self, commit_id: TransactionId, page: &dyn Page) -> Result<PageHandle> {
        self.ensure_writable(commit_id)?;
        let tracked = self.track(commit_id, page.id())?;
        tracked.prepare_write(self.inner.committed(), commit_id)?;
        Ok(self.writer_handle(tracked, commit_id))
    }

    fn mark_dirty(&self, commit_id: TransactionId, page_id: PageId) -> Result<()> {
        self.ensure_writable(commit_id)?;
        let page = self.track(commit_id, page_id)?;
        page.prepare_write(self.inner.committed(), commit_id)
    }

    fn preload(&self, num_pages: usize, profiler: Option<&Profiler>) -> Result<usize> {
        let _step = Profiler::step(profiler, "preload");
        self.ensure_open()?;

        let available = self.page_count();
        let count = (num_pages as u64 / 2).min(available);
        for page_id in 1..=count {
            self.page(page_id, profiler)?;
        }
        debug!(count, "preloaded pages");
        Ok(count as usize)
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cache().unsubscribe(&self.inner.partition);
        self.cache().clear(&self.inner.partition);
        self.inner.input.lock().take();

        let discarded = {
            let mut transaction = self.inner.transaction.lock();
            transaction.in_flight = None;
            let n = transaction.modified.len();
            transaction.modified.clear();
            n
        };
        if discarded > 0 {
            debug!(discarded, "discarded uncommitted pages on close");
        }
        info!(path = %self.inner.options.path.display(), "closed binary page store");
        Ok(())
    }
}

impl Drop for BinaryFilePageStore {
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
