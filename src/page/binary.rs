//! Dual-buffer page of the binary store.
//!
//! ## On-Disk Layout
//!
//! Page `N` occupies `2 * nominal` bytes starting at `(N - 1) * 2 * nominal`:
//!
//! ```text
//! +-----------+----------------------+-----------+----------------------+
//! | tx (8 LE) | data (nominal - 8)   | tx (8 LE) | data (nominal - 8)   |
//! +-----------+----------------------+-----------+----------------------+
//! |<--------- first slot --------->|<--------- second slot -------->|
//! ```
//!
//! ## Slot Selection
//!
//! A reader at transaction `T` uses the slot with the highest tag `<= T`
//! (ties go to the first slot). If both tags are newer than `T` the reader's
//! snapshot has been overwritten and `StoreModified` is raised.
//!
//! A writer uses the slot a reader at the store's last committed
//! transaction would *not* pick. Before the first write of a commit, the
//! readable slot is copied into the write slot and the write slot is tagged
//! with the commit id, so readers at older transactions keep seeing the
//! committed buffer until the commit lands.
//!
//! A fresh page starts with tags `(u64::MAX, 0)`: the second slot reads as
//! zeros and the first slot is the initial write target.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{check_range, Page, PageReadGuard};
use crate::config::{MIN_BINARY_PAGE_SIZE, TRANSACTION_ID_SIZE, UNWRITTEN_SLOT_TRANSACTION_ID};
use crate::error::StoreError;
use crate::persistence::StoreStream;
use crate::{PageId, TransactionId};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SlotHeader {
    transaction_id: U64,
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == TRANSACTION_ID_SIZE);

impl SlotHeader {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id: U64::new(transaction_id),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= TRANSACTION_ID_SIZE,
            "buffer too small for SlotHeader: {} < {}",
            bytes.len(),
            TRANSACTION_ID_SIZE
        );
        Self::ref_from_bytes(&bytes[..TRANSACTION_ID_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse SlotHeader: {:?}", e))
    }

    zerocopy_accessors! {
        transaction_id: u64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::First => Slot::Second,
            Slot::Second => Slot::First,
        }
    }

    fn index(self) -> u64 {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }
}

#[derive(Debug)]
struct DualBuffer {
    first: Box<[u8]>,
    first_tx: TransactionId,
    second: Box<[u8]>,
    second_tx: TransactionId,
}

impl DualBuffer {
    fn tx(&self, slot: Slot) -> TransactionId {
        match slot {
            Slot::First => self.first_tx,
            Slot::Second => self.second_tx,
        }
    }

    fn buf(&self, slot: Slot) -> &[u8] {
        match slot {
            Slot::First => &self.first,
            Slot::Second => &self.second,
        }
    }

    fn buf_mut(&mut self, slot: Slot) -> &mut [u8] {
        match slot {
            Slot::First => &mut self.first,
            Slot::Second => &mut self.second,
        }
    }

    fn read_slot(&self, page_id: PageId, tx: TransactionId) -> Result<Slot> {
        match (self.first_tx <= tx, self.second_tx <= tx) {
            (true, true) if self.second_tx > self.first_tx => Ok(Slot::Second),
            (true, _) => Ok(Slot::First),
            (false, true) => Ok(Slot::Second),
            (false, false) => Err(StoreError::StoreModified {
                page_id,
                requested_tx: tx,
                first_tx: self.first_tx,
                second_tx: self.second_tx,
            }
            .into()),
        }
    }

    /// Ensures the write slot for `commit_id` is tagged and holds a copy of
    /// the committed data. A slot already tagged `commit_id` is kept.
    fn prepare_write(
        &mut self,
        page_id: PageId,
        committed: TransactionId,
        commit_id: TransactionId,
    ) -> Result<Slot> {
        let write = self.read_slot(page_id, committed)?.other();
        if self.tx(write) != commit_id {
            self.reset_slot(write, commit_id);
        }
        Ok(write)
    }

    /// Like `prepare_write`, but always discards the write slot's contents.
    fn begin_write(
        &mut self,
        page_id: PageId,
        committed: TransactionId,
        commit_id: TransactionId,
    ) -> Result<Slot> {
        let write = self.read_slot(page_id, committed)?.other();
        self.reset_slot(write, commit_id);
        Ok(write)
    }

    fn reset_slot(&mut self, write: Slot, commit_id: TransactionId) {
        let (first, second) = (&mut self.first, &mut self.second);
        match write {
            Slot::First => {
                first.copy_from_slice(second);
                self.first_tx = commit_id;
            }
            Slot::Second => {
                second.copy_from_slice(first);
                self.second_tx = commit_id;
            }
        }
    }

    fn slot_tagged(&self, tx: TransactionId) -> Option<Slot> {
        if self.first_tx == tx {
            Some(Slot::First)
        } else if self.second_tx == tx {
            Some(Slot::Second)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct BinaryFilePage {
    id: PageId,
    nominal_size: usize,
    buffers: RwLock<DualBuffer>,
    dirty: AtomicBool,
    modified: AtomicU64,
}

impl BinaryFilePage {
    pub fn new(id: PageId, nominal_size: usize) -> Result<Self> {
        let size = Self::data_size(nominal_size)?;
        Ok(Self {
            id,
            nominal_size,
            buffers: RwLock::new(DualBuffer {
                first: vec![0u8; size].into_boxed_slice(),
                first_tx: UNWRITTEN_SLOT_TRANSACTION_ID,
                second: vec![0u8; size].into_boxed_slice(),
                second_tx: 0,
            }),
            dirty: AtomicBool::new(false),
            modified: AtomicU64::new(0),
        })
    }

    /// Reads both slots of page `id`. Bytes past the end of the file read
    /// as zero.
    pub fn load(id: PageId, nominal_size: usize, input: &mut dyn StoreStream) -> Result<Self> {
        let size = Self::data_size(nominal_size)?;
        let offset = Self::offset(id, nominal_size);
        input
            .seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", id, offset))?;

        let mut raw = vec![0u8; 2 * nominal_size];
        let mut filled = 0;
        while filled < raw.len() {
            let n = input
                .read(&mut raw[filled..])
                .wrap_err_with(|| format!("failed to read page {}", id))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        let (first_raw, second_raw) = raw.split_at(nominal_size);
        let first_tx = SlotHeader::from_bytes(first_raw)?.transaction_id();
        let second_tx = SlotHeader::from_bytes(second_raw)?.transaction_id();

        Ok(Self {
            id,
            nominal_size,
            buffers: RwLock::new(DualBuffer {
                first: first_raw[TRANSACTION_ID_SIZE..].into(),
                first_tx,
                second: second_raw[TRANSACTION_ID_SIZE..TRANSACTION_ID_SIZE + size].into(),
                second_tx,
            }),
            dirty: AtomicBool::new(false),
            modified: AtomicU64::new(0),
        })
    }

    /// Usable bytes per slot for a nominal page size.
    pub fn data_size(nominal_size: usize) -> Result<usize> {
        if nominal_size < MIN_BINARY_PAGE_SIZE {
            return Err(StoreError::InvalidPageSize {
                page_size: nominal_size,
                reason: "binary pages must be at least 64 bytes",
            }
            .into());
        }
        Ok(nominal_size - TRANSACTION_ID_SIZE)
    }

    /// File offset of page `id`.
    pub fn offset(id: PageId, nominal_size: usize) -> u64 {
        id.saturating_sub(1) * 2 * nominal_size as u64
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn nominal_size(&self) -> usize {
        self.nominal_size
    }

    pub fn buffer_size(&self) -> usize {
        self.nominal_size - TRANSACTION_ID_SIZE
    }

    pub fn transaction_ids(&self) -> (TransactionId, TransactionId) {
        let buffers = self.buffers.read();
        (buffers.first_tx, buffers.second_tx)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn modification_count(&self) -> u64 {
        self.modified.load(Ordering::Acquire)
    }

    pub fn read_slot(&self, tx: TransactionId) -> Result<Slot> {
        self.buffers.read().read_slot(self.id, tx)
    }

    /// Borrows the data visible to a reader at `tx`.
    pub fn read(&self, tx: TransactionId) -> Result<PageReadGuard<'_>> {
        let buffers = self.buffers.read();
        let slot = buffers.read_slot(self.id, tx)?;
        Ok(RwLockReadGuard::map(buffers, |b| b.buf(slot)))
    }

    /// Prepares the write slot for `commit_id` and marks the page dirty.
    pub fn prepare_write(&self, committed: TransactionId, commit_id: TransactionId) -> Result<()> {
        self.buffers
            .write()
            .prepare_write(self.id, committed, commit_id)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Starts `commit_id`'s changes to this page from the committed data.
    ///
    /// Whatever the write slot held is dropped, even if it is already tagged
    /// `commit_id`: that happens when a commit id is reused after an
    /// abandoned or failed transaction left partial bytes behind.
    pub fn begin_write(&self, committed: TransactionId, commit_id: TransactionId) -> Result<()> {
        self.buffers
            .write()
            .begin_write(self.id, committed, commit_id)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn set_data(
        &self,
        committed: TransactionId,
        commit_id: TransactionId,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        check_range(self.id, self.buffer_size(), data, src_offset, page_offset, len)?;

        let mut buffers = self.buffers.write();
        let slot = buffers.prepare_write(self.id, committed, commit_id)?;
        buffers.buf_mut(slot)[page_offset..page_offset + len]
            .copy_from_slice(&data[src_offset..src_offset + len]);
        self.modified.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Persists the slot tagged `commit_id`, preparing it first if needed.
    /// Returns the modification count that was written.
    pub fn write_to(
        &self,
        out: &mut dyn StoreStream,
        committed: TransactionId,
        commit_id: TransactionId,
    ) -> Result<u64> {
        let mut buffers = self.buffers.write();
        let slot = match buffers.slot_tagged(commit_id) {
            Some(slot) => slot,
            None => buffers.prepare_write(self.id, committed, commit_id)?,
        };
        let stamp = self.modified.load(Ordering::Acquire);

        let offset = Self::offset(self.id, self.nominal_size) + slot.index() * self.nominal_size as u64;
        out.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", self.id, offset))?;
        out.write_all(SlotHeader::new(commit_id).as_bytes())
            .wrap_err_with(|| format!("failed to write header of page {}", self.id))?;
        out.write_all(buffers.buf(slot))
            .wrap_err_with(|| format!("failed to write page {}", self.id))?;

        self.dirty.store(false, Ordering::Release);
        Ok(stamp)
    }
}

/// Binds a [`BinaryFilePage`] to a transaction so it can be used as a
/// [`Page`].
///
/// Reader adapters see the page as of their transaction. Writer adapters
/// see the in-progress buffer of their commit and route `set_data` into it.
#[derive(Debug, Clone)]
pub struct BinaryPageAdapter {
    page: Arc<BinaryFilePage>,
    read_tx: TransactionId,
    commit: Option<(TransactionId, TransactionId)>,
}

impl BinaryPageAdapter {
    pub fn reader(page: Arc<BinaryFilePage>, tx: TransactionId) -> Self {
        Self {
            page,
            read_tx: tx,
            commit: None,
        }
    }

    pub fn writer(
        page: Arc<BinaryFilePage>,
        committed: TransactionId,
        commit_id: TransactionId,
    ) -> Self {
        Self {
            page,
            read_tx: commit_id,
            commit: Some((committed, commit_id)),
        }
    }

    pub fn page(&self) -> &Arc<BinaryFilePage> {
        &self.page
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.read_tx
    }

    pub fn is_writer(&self) -> bool {
        self.commit.is_some()
    }
}

impl Page for BinaryPageAdapter {
    fn id(&self) -> PageId {
        self.page.id()
    }

    fn size(&self) -> usize {
        self.page.buffer_size()
    }

    fn data(&self) -> Result<PageReadGuard<'_>> {
        self.page.read(self.read_tx)
    }

    fn set_data(
        &self,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        match self.commit {
            Some((committed, commit_id)) => {
                self.page
                    .set_data(committed, commit_id, data, src_offset, page_offset, len)
            }
            None => Err(StoreError::PageNotWriteable {
                page_id: self.page.id(),
            }
            .into()),
        }
    }

    fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    fn modification_count(&self) -> u64 {
        self.page.modification_count()
    }
}
