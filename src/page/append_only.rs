use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};

use super::{check_range, Page, PageReadGuard, PersistentPage};
use crate::error::StoreError;
use crate::persistence::StoreStream;
use crate::{PageId, TransactionId};

/// A page of an append-only store.
///
/// New pages start dirty and writable. Once committed, or when loaded from
/// disk, a page is sealed and rejects further `set_data` calls.
#[derive(Debug)]
pub struct AppendOnlyFilePage {
    id: PageId,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    sealed: AtomicBool,
    modified: AtomicU64,
}

impl AppendOnlyFilePage {
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            dirty: AtomicBool::new(true),
            sealed: AtomicBool::new(false),
            modified: AtomicU64::new(0),
        }
    }

    /// Reads page `id` from `input`. Bytes past the end of the file read as
    /// zero.
    pub fn load(id: PageId, page_size: usize, input: &mut dyn StoreStream) -> Result<Self> {
        let offset = Self::offset(id, page_size);
        input
            .seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", id, offset))?;

        let mut data = vec![0u8; page_size].into_boxed_slice();
        let mut filled = 0;
        while filled < page_size {
            let n = input
                .read(&mut data[filled..])
                .wrap_err_with(|| format!("failed to read page {}", id))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(Self {
            id,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            sealed: AtomicBool::new(true),
            modified: AtomicU64::new(0),
        })
    }

    /// File offset of page `id`.
    pub fn offset(id: PageId, page_size: usize) -> u64 {
        id.saturating_sub(1) * page_size as u64
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Page for AppendOnlyFilePage {
    fn id(&self) -> PageId {
        self.id
    }

    fn size(&self) -> usize {
        self.data.read().len()
    }

    fn data(&self) -> Result<PageReadGuard<'_>> {
        Ok(RwLockReadGuard::map(self.data.read(), |d| &d[..]))
    }

    fn set_data(
        &self,
        data: &[u8],
        src_offset: usize,
        page_offset: usize,
        len: usize,
    ) -> Result<()> {
        if self.is_sealed() {
            return Err(StoreError::PageNotWriteable { page_id: self.id }.into());
        }

        let mut buf = self.data.write();
        check_range(self.id, buf.len(), data, src_offset, page_offset, len)?;
        buf[page_offset..page_offset + len].copy_from_slice(&data[src_offset..src_offset + len]);
        self.modified.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn modification_count(&self) -> u64 {
        self.modified.load(Ordering::Acquire)
    }
}

impl PersistentPage for AppendOnlyFilePage {
    fn write(&self, out: &mut dyn StoreStream, _transaction_id: TransactionId) -> Result<u64> {
        // Holding the read lock keeps set_data from landing between the
        // write and the dirty flag reset.
        let buf = self.data.read();
        let stamp = self.modified.load(Ordering::Acquire);
        let offset = Self::offset(self.id, buf.len());

        out.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} at offset {}", self.id, offset))?;
        out.write_all(&buf)
            .wrap_err_with(|| format!("failed to write page {}", self.id))?;

        self.dirty.store(false, Ordering::Release);
        Ok(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn new_page_is_dirty_and_writable() {
        let page = AppendOnlyFilePage::new(1, 4096);
        assert!(page.is_dirty());
        assert!(!page.is_sealed());

        page.set_data(b"xyz", 0, 10, 3).unwrap();
        assert_eq!(&page.data().unwrap()[10..13], b"xyz");
        assert_eq!(page.modification_count(), 1);
    }

    #[test]
    fn set_data_rejects_out_of_range() {
        let page = AppendOnlyFilePage::new(1, 4096);
        assert!(page.set_data(b"abc", 1, 0, 3).is_err());
        assert!(page.set_data(b"abc", 0, 4095, 3).is_err());
        assert_eq!(page.modification_count(), 0);
    }

    #[test]
    fn write_places_page_at_its_offset() {
        let page = AppendOnlyFilePage::new(3, 4096);
        page.set_data(&[7u8; 4096], 0, 0, 4096).unwrap();

        let mut out = Cursor::new(Vec::new());
        let stamp = page.write(&mut out, 1).unwrap();
        assert_eq!(stamp, 1);
        assert!(!page.is_dirty());

        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 3 * 4096);
        assert!(bytes[..2 * 4096].iter().all(|&b| b == 0));
        assert!(bytes[2 * 4096..].iter().all(|&b| b == 7));
    }

    #[test]
    fn loaded_page_is_sealed() {
        let mut file = Cursor::new(vec![5u8; 4096 + 100]);
        let page = AppendOnlyFilePage::load(2, 4096, &mut file).unwrap();

        let data = page.data().unwrap();
        assert!(data[..100].iter().all(|&b| b == 5));
        assert!(data[100..].iter().all(|&b| b == 0));
        drop(data);

        assert!(!page.is_dirty());
        let err = page.set_data(b"a", 0, 0, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::PageNotWriteable { page_id: 2 })
        ));
    }

    #[test]
    fn write_if_modified_since_skips_unchanged_page() {
        let page = AppendOnlyFilePage::new(1, 4096);
        page.set_data(b"a", 0, 0, 1).unwrap();

        let mut out = Cursor::new(Vec::new());
        let stamp = page.write(&mut out, 1).unwrap();
        assert_eq!(page.write_if_modified_since(stamp, &mut out, 1).unwrap(), None);

        page.set_data(b"b", 0, 0, 1).unwrap();
        assert_eq!(
            page.write_if_modified_since(stamp, &mut out, 1).unwrap(),
            Some(stamp + 1)
        );
    }
}
