//! # Background Page Writer
//!
//! Moves page writes off the committing thread. Each store with background
//! writes enabled owns one writer, and each writer owns one worker thread and
//! one output stream.
//!
//! ## Queue Model
//!
//! ```text
//! queue_write(page)                     worker thread
//!      |                                     |
//!      v                                     v
//!  shards[id % 64].pending: PageId->Task <-- remove(id) --+
//!  queue: Injector<PageId>               --- steal() -----+--> page.write(stream)
//! ```
//!
//! - The task table is split into 64 shards, each behind its own mutex, so
//!   committers queueing different pages and eviction checks through
//!   `is_pending` rarely contend with each other or with the worker.
//! - Each shard holds the *latest* write for its pages. Queueing a page
//!   that already has a pending task replaces the task without pushing a new
//!   id, so repeated writes coalesce into one.
//! - The injector holds page ids in FIFO order. The worker steals an id,
//!   moves its current task to its shard's `writing` slot and writes it. A
//!   page in that slot still counts as pending until the write returns.
//! - `outstanding` counts ids pushed and not yet processed. The worker only
//!   takes the condvar mutex on the transition to zero.
//! - `flush()` blocks until every queued id has been processed, syncs the
//!   stream and then reports any writes that failed since the last flush.
//!
//! ## Failure Handling
//!
//! A failed write is logged with `tracing::error!` and its page id recorded.
//! The next `flush()` returns `StoreError::BackgroundWriteFailed` listing
//! those ids, so a commit that relies on the writer never reports success
//! for pages that did not reach the stream.
//!
//! ## Redundant Writes
//!
//! The worker remembers the modification stamp it last wrote for each page.
//! When the same page object is queued again without having been modified
//! in between, the write is skipped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, Thread};

use crossbeam_deque::{Injector, Steal};
use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::config::{WRITER_IDLE_WAIT, WRITER_STAMP_RETENTION, WRITER_TASK_SHARDS};
use crate::error::StoreError;
use crate::page::{Page, PersistentPage};
use crate::persistence::StoreStream;
use crate::{PageId, TransactionId};

struct WriteTask<P> {
    page: Arc<P>,
    transaction_id: TransactionId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub queued: u64,
    pub coalesced: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct WriterCounters {
    queued: AtomicU64,
    coalesced: AtomicU64,
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct TaskShard<P> {
    pending: HashMap<PageId, WriteTask<P>>,
    writing: Option<(PageId, Arc<P>)>,
}

impl<P> TaskShard<P> {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            writing: None,
        }
    }

    fn len(&self) -> usize {
        self.pending.len() + usize::from(self.writing.is_some())
    }

    fn page(&self, page_id: PageId) -> Option<&Arc<P>> {
        match self.pending.get(&page_id) {
            Some(task) => Some(&task.page),
            None => self
                .writing
                .as_ref()
                .filter(|(id, _)| *id == page_id)
                .map(|(_, page)| page),
        }
    }
}

struct Shared<P> {
    path: PathBuf,
    shards: Box<[Mutex<TaskShard<P>>]>,
    queue: Injector<PageId>,
    stream: Mutex<Option<Box<dyn StoreStream>>>,
    /// Ids pushed to the queue and not yet processed.
    outstanding: AtomicUsize,
    idle: Mutex<()>,
    drained: Condvar,
    running: AtomicBool,
    failed: Mutex<Vec<PageId>>,
    counters: WriterCounters,
}

impl<P> Shared<P> {
    fn shard(&self, page_id: PageId) -> &Mutex<TaskShard<P>> {
        &self.shards[(page_id % WRITER_TASK_SHARDS as u64) as usize]
    }
}

pub struct BackgroundPageWriter<P: PersistentPage + 'static> {
    shared: Arc<Shared<P>>,
    thread: Thread,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PersistentPage + 'static> BackgroundPageWriter<P> {
    pub fn new(path: impl AsRef<Path>, stream: Box<dyn StoreStream>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let shared = Arc::new(Shared {
            path: path.clone(),
            shards: (0..WRITER_TASK_SHARDS)
                .map(|_| Mutex::new(TaskShard::new()))
                .collect(),
            queue: Injector::new(),
            stream: Mutex::new(Some(stream)),
            outstanding: AtomicUsize::new(0),
            idle: Mutex::new(()),
            drained: Condvar::new(),
            running: AtomicBool::new(true),
            failed: Mutex::new(Vec::new()),
            counters: WriterCounters::default(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("page-writer".to_string())
            .spawn(move || run(worker_shared))
            .wrap_err_with(|| {
                format!("failed to spawn page writer for '{}'", path.display())
            })?;

        debug!(path = %path.display(), "background page writer started");
        Ok(Self {
            shared,
            thread: handle.thread().clone(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues `page` to be written as part of `transaction_id`.
    ///
    /// A pending write for the same page id is replaced.
    pub fn queue_write(&self, page: Arc<P>, transaction_id: TransactionId) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            bail!(StoreError::StoreClosed {
                path: self.shared.path.clone(),
            });
        }

        let page_id = page.id();
        {
            let mut shard = self.shared.shard(page_id).lock();
            let task = WriteTask {
                page,
                transaction_id,
            };
            if shard.pending.insert(page_id, task).is_some() {
                drop(shard);
                self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!(page_id, "coalesced pending page write");
                return Ok(());
            }
            // Counted before the push so the worker never decrements an id
            // that flush has not seen.
            self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
            self.shared.queue.push(page_id);
        }
        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.thread.unpark();
        Ok(())
    }

    /// Returns the page still waiting to be written under `page_id`.
    pub fn try_get_page(&self, page_id: PageId) -> Option<Arc<P>> {
        self.shared.shard(page_id).lock().page(page_id).cloned()
    }

    /// True while `page_id` is queued or being written.
    pub fn is_pending(&self, page_id: PageId) -> bool {
        self.shared.shard(page_id).lock().page(page_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Waits until every queued write has been processed, then syncs the
    /// stream.
    ///
    /// Fails with `BackgroundWriteFailed` if any write since the previous
    /// flush failed.
    pub fn flush(&self) -> Result<()> {
        {
            let mut idle = self.shared.idle.lock();
            loop {
                let outstanding = self.shared.outstanding.load(Ordering::Acquire);
                if outstanding == 0 {
                    break;
                }
                if self.worker_stopped() {
                    bail!(
                        "page writer for '{}' stopped with {} writes outstanding",
                        self.shared.path.display(),
                        outstanding
                    );
                }
                self.shared.drained.wait_for(&mut idle, WRITER_IDLE_WAIT);
            }
        }

        if let Some(stream) = self.shared.stream.lock().as_mut() {
            stream.sync().wrap_err_with(|| {
                format!("failed to sync '{}'", self.shared.path.display())
            })?;
        }

        let failed = std::mem::take(&mut *self.shared.failed.lock());
        if !failed.is_empty() {
            return Err(StoreError::BackgroundWriteFailed { page_ids: failed }.into());
        }
        Ok(())
    }

    /// Drains the queue, stops the worker and releases the stream.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.worker.lock().is_none() {
            return Ok(());
        }

        let flushed = self.flush();
        self.shared.running.store(false, Ordering::Release);

        if let Some(handle) = self.worker.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!(path = %self.shared.path.display(), "page writer thread panicked");
            }
        }
        self.shared.stream.lock().take();
        debug!(path = %self.shared.path.display(), "background page writer stopped");
        flushed
    }

    pub fn stats(&self) -> WriterStats {
        let c = &self.shared.counters;
        WriterStats {
            queued: c.queued.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    fn worker_stopped(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl<P: PersistentPage + 'static> Drop for BackgroundPageWriter<P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(
                path = %self.shared.path.display(),
                error = %format!("{:#}", e),
                "page writer shut down with unwritten pages"
            );
        }
    }
}

fn run<P: PersistentPage + 'static>(shared: Arc<Shared<P>>) {
    let mut stamps: HashMap<PageId, (Weak<P>, u64)> = HashMap::new();
    loop {
        match shared.queue.steal() {
            Steal::Success(page_id) => {
                shared.process(page_id, &mut stamps);
            }
            Steal::Retry => thread::yield_now(),
            Steal::Empty => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(WRITER_IDLE_WAIT);
            }
        }
    }
}

impl<P: PersistentPage + 'static> Shared<P> {
    fn process(&self, page_id: PageId, stamps: &mut HashMap<PageId, (Weak<P>, u64)>) {
        let task = {
            let mut shard = self.shard(page_id).lock();
            let task = shard.pending.remove(&page_id);
            shard.writing = task.as_ref().map(|t| (page_id, t.page.clone()));
            task
        };

        if let Some(task) = task {
            let since = stamps
                .get(&page_id)
                .filter(|(page, _)| std::ptr::eq(page.as_ptr(), Arc::as_ptr(&task.page)))
                .map(|(_, stamp)| *stamp);

            let result = {
                let mut stream = self.stream.lock();
                match (stream.as_mut(), since) {
                    (None, _) => Err(eyre::eyre!("output stream has been closed")),
                    (Some(out), Some(since)) => {
                        task.page
                            .write_if_modified_since(since, &mut **out, task.transaction_id)
                    }
                    (Some(out), None) => task
                        .page
                        .write(&mut **out, task.transaction_id)
                        .map(Some),
                }
            };

            match result {
                Ok(Some(stamp)) => {
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                    stamps.insert(page_id, (Arc::downgrade(&task.page), stamp));
                    if stamps.len() > WRITER_STAMP_RETENTION {
                        stamps.retain(|_, (page, _)| page.strong_count() > 0);
                    }
                    trace!(page_id, stamp, "page written");
                }
                Ok(None) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    trace!(page_id, "page unchanged since last write, skipped");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.failed.lock().push(page_id);
                    error!(
                        page_id,
                        path = %self.path.display(),
                        error = %format!("{:#}", e),
                        "background page write failed"
                    );
                }
            }
            self.shard(page_id).lock().writing = None;
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the mutex orders this notify after a flusher's check.
            let _idle = self.idle.lock();
            self.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::AppendOnlyFilePage;
    use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
    use std::sync::mpsc;

    const PAGE: usize = 4096;

    /// In-memory stream whose buffer stays reachable after the writer
    /// takes ownership of the stream.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl SharedBuffer {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().get_ref().clone()
        }
    }

    impl Read for SharedBuffer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.lock().read(buf)
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for SharedBuffer {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.lock().seek(pos)
        }
    }

    impl StoreStream for SharedBuffer {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Blocks the first write until the test releases it.
    struct GatedStream {
        inner: SharedBuffer,
        entered: Option<mpsc::Sender<()>>,
        release: mpsc::Receiver<()>,
    }

    impl Read for GatedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for GatedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(entered) = self.entered.take() {
                let _ = entered.send(());
                let _ = self.release.recv();
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for GatedStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl StoreStream for GatedStream {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails every write that starts at or beyond `fail_from`.
    struct FailingStream {
        inner: SharedBuffer,
        fail_from: u64,
    }

    impl Read for FailingStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for FailingStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let position = self.inner.0.lock().position();
            if position >= self.fail_from {
                return Err(io::Error::other("disk full"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl StoreStream for FailingStream {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn filled_page(id: PageId, byte: u8) -> Arc<AppendOnlyFilePage> {
        let page = AppendOnlyFilePage::new(id, PAGE);
        page.set_data(&[byte; PAGE], 0, 0, PAGE).unwrap();
        Arc::new(page)
    }

    #[test]
    fn flush_drains_every_queued_page() {
        let buffer = SharedBuffer::default();
        let writer = BackgroundPageWriter::new("test", Box::new(buffer.clone())).unwrap();

        for id in 1..=1000 {
            writer.queue_write(filled_page(id, (id % 251) as u8), 1).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(writer.pending_count(), 0);
        assert_eq!(writer.stats().written, 1000);

        let bytes = buffer.contents();
        assert_eq!(bytes.len(), 1000 * PAGE);
        for id in [1u64, 2, 500, 1000] {
            let offset = (id as usize - 1) * PAGE;
            assert!(bytes[offset..offset + PAGE]
                .iter()
                .all(|&b| b == (id % 251) as u8));
        }
    }

    #[test]
    fn repeated_writes_coalesce_to_latest() {
        let buffer = SharedBuffer::default();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let stream = GatedStream {
            inner: buffer.clone(),
            entered: Some(entered_tx),
            release: release_rx,
        };
        let writer = BackgroundPageWriter::new("test", Box::new(stream)).unwrap();

        writer.queue_write(filled_page(1, 0xAA), 1).unwrap();
        entered_rx.recv().unwrap();

        // The worker is blocked inside page 1's write.
        assert!(writer.is_pending(1));
        assert_eq!(writer.pending_count(), 1);
        writer.queue_write(filled_page(2, 0x01), 1).unwrap();
        writer.queue_write(filled_page(2, 0x02), 1).unwrap();
        assert!(writer.is_pending(2));
        assert_eq!(writer.try_get_page(2).unwrap().data().unwrap()[0], 0x02);

        release_tx.send(()).unwrap();
        writer.flush().unwrap();
        assert!(!writer.is_pending(1));
        assert_eq!(writer.pending_count(), 0);

        let stats = writer.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.written, 2);

        let bytes = buffer.contents();
        assert!(bytes[PAGE..2 * PAGE].iter().all(|&b| b == 0x02));
    }

    #[test]
    fn failed_writes_surface_on_flush() {
        let buffer = SharedBuffer::default();
        let stream = FailingStream {
            inner: buffer.clone(),
            fail_from: 2 * PAGE as u64,
        };
        let writer = BackgroundPageWriter::new("test", Box::new(stream)).unwrap();

        for id in 1..=4 {
            writer.queue_write(filled_page(id, 1), 1).unwrap();
        }
        let err = writer.flush().unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::BackgroundWriteFailed { page_ids }) => {
                let mut ids = page_ids.clone();
                ids.sort_unstable();
                assert_eq!(ids, vec![3, 4]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(writer.stats().failed, 2);

        // Failures are reported once.
        writer.flush().unwrap();
    }

    #[test]
    fn concurrent_producers_drain_across_shards() {
        let buffer = SharedBuffer::default();
        let writer = BackgroundPageWriter::new("test", Box::new(buffer.clone())).unwrap();

        std::thread::scope(|s| {
            for producer in 0..4u64 {
                let writer = &writer;
                s.spawn(move || {
                    // Ids interleave so every producer touches every shard.
                    for round in 0..128u64 {
                        let id = round * 4 + producer + 1;
                        writer.queue_write(filled_page(id, id as u8), 1).unwrap();
                    }
                });
            }
        });
        writer.flush().unwrap();

        assert_eq!(writer.pending_count(), 0);
        assert_eq!(writer.stats().queued, 512);
        assert_eq!(writer.stats().written, 512);
        let bytes = buffer.contents();
        assert_eq!(bytes.len(), 512 * PAGE);
        for id in [1u64, 64, 65, 300, 512] {
            let offset = (id as usize - 1) * PAGE;
            assert!(bytes[offset..offset + PAGE].iter().all(|&b| b == id as u8));
        }
    }

    #[test]
    fn flush_without_work_returns_immediately() {
        let writer =
            BackgroundPageWriter::<AppendOnlyFilePage>::new("test", Box::new(SharedBuffer::default()))
                .unwrap();
        writer.flush().unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.pending_count(), 0);
    }

    #[test]
    fn unchanged_page_is_not_rewritten() {
        let buffer = SharedBuffer::default();
        let writer = BackgroundPageWriter::new("test", Box::new(buffer)).unwrap();
        let page = filled_page(1, 9);

        writer.queue_write(page.clone(), 1).unwrap();
        writer.flush().unwrap();
        writer.queue_write(page.clone(), 1).unwrap();
        writer.flush().unwrap();

        let stats = writer.stats();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn shutdown_drains_and_rejects_new_work() {
        let buffer = SharedBuffer::default();
        let writer = BackgroundPageWriter::new("test", Box::new(buffer.clone())).unwrap();
        for id in 1..=10 {
            writer.queue_write(filled_page(id, 3), 1).unwrap();
        }

        writer.shutdown().unwrap();
        assert_eq!(buffer.contents().len(), 10 * PAGE);
        writer.shutdown().unwrap();

        let err = writer.queue_write(filled_page(11, 3), 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::StoreClosed { .. })
        ));
    }
}
