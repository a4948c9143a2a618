//! # Tristore - Transactional Page Stores
//!
//! Tristore is the storage layer of an embedded triple store. It persists
//! fixed-size pages in a single file and exposes them to the layers above
//! through a small transactional API: create pages, write into them, commit
//! under a transaction id, and read committed pages back.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tristore::{PageStore, PageStoreBuilder, StoreKind};
//!
//! let store = PageStoreBuilder::new()
//!     .path("./data/resources.data")
//!     .kind(StoreKind::AppendOnly)
//!     .page_size(4096)
//!     .open()?;
//!
//! let page = store.create(1)?;
//! store.write(1, page.id(), b"hello", 0, 0, 5)?;
//! store.commit(1, None)?;
//!
//! let read = store.retrieve(page.id(), None)?;
//! assert_eq!(&read.data()?[..5], b"hello");
//! ```
//!
//! ## Store Kinds
//!
//! ```text
//! Append-only                          Binary (dual buffer)
//! +--------+--------+--------+         +-------------+-------------+
//! | page 1 | page 2 | page 3 | ...     | 1: tx|data  | 1: tx|data  |  page 1
//! +--------+--------+--------+         +-------------+-------------+
//!                   ^                  | 2: tx|data  | 2: tx|data  |  page 2
//!          new_page_offset             +-------------+-------------+
//! ```
//!
//! - **Append-only**: committed pages are immutable; updates allocate new
//!   page ids past the watermark. Writes can go through a background writer.
//! - **Binary**: every page holds two buffers tagged with transaction ids.
//!   Readers pick the newest buffer not newer than their transaction, while
//!   writers rewrite the other buffer in place.
//!
//! Both kinds share one process-wide page cache (LRU or circular buffer),
//! partitioned by store path. Stores subscribe to eviction notifications so
//! pages that are still pending a write are never silently lost.
//!
//! ## Module Overview
//!
//! - [`store`]: the `PageStore` trait and both implementations
//! - [`page`]: in-memory page representations
//! - [`cache`]: shared page cache and eviction hooks
//! - [`writer`]: coalescing background page writer
//! - [`persistence`]: file and block-blob persistence managers
//! - [`block`]: block providers and the block-backed stream
//! - [`builder`]: configuration and store construction

#[macro_use]
mod macros;

pub mod block;
pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod page;
pub mod persistence;
pub mod profiler;
pub mod store;
pub mod writer;

/// One-based page identifier. Page 0 is never allocated.
pub type PageId = u64;

/// Monotonically increasing transaction (commit) identifier.
pub type TransactionId = u64;

pub use builder::PageStoreBuilder;
pub use cache::{CachePolicy, PageCacheConfig, SharedPageCache};
pub use error::StoreError;
pub use page::{Page, PageHandle};
pub use persistence::{
    BlockPersistenceManager, FileMode, FilePersistenceManager, PersistenceManager, StoreStream,
};
pub use profiler::Profiler;
pub use store::{AnyPageStore, AppendOnlyFilePageStore, BinaryFilePageStore, PageStore, StoreKind};
pub use writer::BackgroundPageWriter;
