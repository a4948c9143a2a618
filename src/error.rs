//! # Store Error Conditions
//!
//! Every fallible operation in Tristore returns `eyre::Result`. Most failures
//! are plain I/O errors wrapped with context naming the file, page, or offset
//! involved. The conditions below are the ones a caller has to tell apart, so
//! they are raised as a typed [`StoreError`] inside the `eyre::Report`:
//!
//! ```ignore
//! match store.commit(7, None) {
//!     Ok(()) => {}
//!     Err(report) => match report.downcast_ref::<StoreError>() {
//!         Some(StoreError::StoreModified { .. }) => reopen_reader()?,
//!         Some(StoreError::CommitFailed { .. }) => abort_transaction()?,
//!         _ => return Err(report),
//!     },
//! }
//! ```
//!
//! ## Taxonomy
//!
//! | Kind                  | Variants                                                      |
//! |-----------------------|---------------------------------------------------------------|
//! | Invalid operation     | `ReadOnlyStore`, `PageNotWriteable`, `UnreservedPage`, `StoreClosed` |
//! | Consistency violation | `StoreModified`                                               |
//! | Argument              | `InvalidPageSize`                                             |
//! | I/O                   | `StoreNotFound`, `PageNotFound`, `BackgroundWriteFailed`      |
//! | Transaction           | `CommitFailed` (context over the root cause)                  |

use std::fmt;
use std::path::PathBuf;

use crate::{PageId, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Create, write or commit against a store opened read-only.
    ReadOnlyStore { path: PathBuf },
    /// Write to an append-only page that has already been committed.
    PageNotWriteable { page_id: PageId },
    /// Write to a page id that was never allocated.
    UnreservedPage { page_id: PageId, next_page_id: PageId },
    /// Both buffers of a dual-buffer page are newer than the reader's
    /// transaction: the reader's snapshot is stale.
    StoreModified {
        page_id: PageId,
        requested_tx: TransactionId,
        first_tx: TransactionId,
        second_tx: TransactionId,
    },
    InvalidPageSize { page_size: usize, reason: &'static str },
    StoreNotFound { path: PathBuf },
    PageNotFound { page_id: PageId },
    /// Background writes that failed since the previous flush.
    BackgroundWriteFailed { page_ids: Vec<PageId> },
    CommitFailed { commit_id: TransactionId },
    StoreClosed { path: PathBuf },
}

impl StoreError {
    pub fn is_invalid_operation(&self) -> bool {
        matches!(
            self,
            StoreError::ReadOnlyStore { .. }
                | StoreError::PageNotWriteable { .. }
                | StoreError::UnreservedPage { .. }
                | StoreError::StoreClosed { .. }
        )
    }

    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, StoreError::StoreModified { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ReadOnlyStore { path } => {
                write!(f, "store '{}' is opened read-only", path.display())
            }
            StoreError::PageNotWriteable { page_id } => write!(
                f,
                "page {} has been committed and can no longer be written",
                page_id
            ),
            StoreError::UnreservedPage {
                page_id,
                next_page_id,
            } => write!(
                f,
                "page {} has not been reserved (next page id is {})",
                page_id, next_page_id
            ),
            StoreError::StoreModified {
                page_id,
                requested_tx,
                first_tx,
                second_tx,
            } => write!(
                f,
                "store modified: page {} has no buffer valid for transaction {} (buffers at {} and {})",
                page_id, requested_tx, first_tx, second_tx
            ),
            StoreError::InvalidPageSize { page_size, reason } => {
                write!(f, "invalid page size {}: {}", page_size, reason)
            }
            StoreError::StoreNotFound { path } => {
                write!(f, "store file '{}' does not exist", path.display())
            }
            StoreError::PageNotFound { page_id } => write!(f, "page {} does not exist", page_id),
            StoreError::BackgroundWriteFailed { page_ids } => write!(
                f,
                "background writer failed to persist {} page(s): {:?}",
                page_ids.len(),
                page_ids
            ),
            StoreError::CommitFailed { commit_id } => {
                write!(f, "commit of transaction {} failed", commit_id)
            }
            StoreError::StoreClosed { path } => {
                write!(f, "store '{}' has been closed", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Returns the [`StoreError`] carried by a report, if any.
///
/// Looks through context layers, so a `CommitFailed` wrapping a
/// `StoreModified` is found as `CommitFailed` first.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report.downcast_ref::<StoreError>().or_else(|| {
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<StoreError>())
    })
}

/// Returns true if any layer of the report is the given kind of error.
pub fn has_store_error(report: &eyre::Report, pred: impl Fn(&StoreError) -> bool) -> bool {
    if report.downcast_ref::<StoreError>().is_some_and(&pred) {
        return true;
    }
    report
        .chain()
        .filter_map(|cause| cause.downcast_ref::<StoreError>())
        .any(pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn typed_error_survives_context() {
        let result: eyre::Result<()> = Err(StoreError::StoreModified {
            page_id: 3,
            requested_tx: 1,
            first_tx: 4,
            second_tx: 5,
        }
        .into());
        let report = result.wrap_err("reading page 3").unwrap_err();

        assert!(has_store_error(&report, StoreError::is_consistency_violation));
        assert!(matches!(
            store_error(&report),
            Some(StoreError::StoreModified { page_id: 3, .. })
        ));
    }

    #[test]
    fn commit_failed_wraps_root_cause() {
        let root: eyre::Result<()> = Err(StoreError::PageNotWriteable { page_id: 9 }.into());
        let report = root
            .wrap_err(StoreError::CommitFailed { commit_id: 2 })
            .unwrap_err();

        assert!(matches!(
            store_error(&report),
            Some(StoreError::CommitFailed { commit_id: 2 })
        ));
        assert!(has_store_error(&report, StoreError::is_invalid_operation));
    }

    #[test]
    fn display_names_the_page() {
        let msg = StoreError::UnreservedPage {
            page_id: 12,
            next_page_id: 4,
        }
        .to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("4"));
    }
}
