//! # Pages
//!
//! A page is a fixed-size byte buffer identified by a one-based [`PageId`].
//! Two representations exist, one per store kind:
//!
//! - [`AppendOnlyFilePage`]: a single buffer written once at
//!   `(id - 1) * page_size`, sealed after commit.
//! - [`BinaryFilePage`]: two buffers tagged with transaction ids, stored
//!   side by side at `(id - 1) * 2 * page_size`.
//!
//! Callers see both through the [`Page`] trait and hold them as
//! [`PageHandle`]s. Reads borrow the page buffer through a read guard; no
//! copy is made.
//!
//! ## Modification Tracking
//!
//! Every page carries a dirty flag and a monotonically increasing
//! modification counter. `write` returns the counter value it persisted, so
//! a caller can skip a later write with `write_if_modified_since` when
//! nothing changed in between.

mod append_only;
mod binary;

pub use append_only::AppendOnlyFilePage;
pub use binary::{BinaryFilePage, BinaryPageAdapter, Slot, SlotHeader};

use std::fmt;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::MappedRwLockReadGuard;

use crate::persistence::StoreStream;
use crate::{PageId, TransactionId};

/// Borrowed view of a page's data.
pub type PageReadGuard<'a> = MappedRwLockReadGuard<'a, [u8]>;

pub trait Page: Send + Sync + fmt::Debug {
    fn id(&self) -> PageId;

    /// Usable data bytes in the page.
    fn size(&self) -> usize;

    fn data(&self) -> Result<PageReadGuard<'_>>;

    /// Copies `data[src_offset..src_offset + len]` into the page at
    /// `page_offset`.
    fn set_data(&self, data: &[u8], src_offset: usize, page_offset: usize, len: usize)
        -> Result<()>;

    fn is_dirty(&self) -> bool;

    fn modification_count(&self) -> u64;
}

pub type PageHandle = Arc<dyn Page>;

/// A page that can persist itself to a store stream.
pub trait PersistentPage: Page {
    /// Writes the page and returns the modification count that was written.
    fn write(&self, out: &mut dyn StoreStream, transaction_id: TransactionId) -> Result<u64>;

    /// Writes the page only if it was modified after `since`.
    fn write_if_modified_since(
        &self,
        since: u64,
        out: &mut dyn StoreStream,
        transaction_id: TransactionId,
    ) -> Result<Option<u64>> {
        if self.modification_count() <= since {
            return Ok(None);
        }
        self.write(out, transaction_id).map(Some)
    }
}

pub(crate) fn check_range(
    page_id: PageId,
    page_size: usize,
    data: &[u8],
    src_offset: usize,
    page_offset: usize,
    len: usize,
) -> Result<()> {
    ensure!(
        src_offset.checked_add(len).is_some_and(|end| end <= data.len()),
        "source range {}..{}+{} exceeds buffer of {} bytes",
        src_offset,
        src_offset,
        len,
        data.len()
    );
    ensure!(
        page_offset
            .checked_add(len)
            .is_some_and(|end| end <= page_size),
        "page {} range {}..{}+{} exceeds page size {}",
        page_id,
        page_offset,
        page_offset,
        len,
        page_size
    );
    Ok(())
}
