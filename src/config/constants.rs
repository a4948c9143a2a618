//! # Tristore Configuration Constants
//!
//! This module centralizes the configuration constants of the page persistence
//! layer, grouping interdependent values together and documenting their
//! relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE_ALIGNMENT (4096 bytes)
//!       │
//!       ├─> DEFAULT_PAGE_SIZE (must be a multiple)
//!       │     Append-only stores reject any page size that is not a
//!       │     multiple of the alignment.
//!       │
//!       └─> DEFAULT_BLOCK_SIZE (must be a multiple)
//!             Block streams map whole pages onto blocks.
//!
//! TRANSACTION_ID_SIZE (8 bytes)
//!       │
//!       └─> MIN_BINARY_PAGE_SIZE (must exceed)
//!             Each dual-buffer slot is an 8-byte transaction id followed by
//!             (nominal page size - 8) bytes of page data.
//!
//! DEFAULT_CACHE_MEGABYTES (64)
//!       │
//!       └─> cache capacity = megabytes * 1 MiB / page size
//!             LRU_HIGH_WATER_PERCENT triggers an eviction pass,
//!             LRU_LOW_WATER_PERCENT is where the pass stops.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `DEFAULT_PAGE_SIZE % PAGE_SIZE_ALIGNMENT == 0`
//! 2. `LRU_LOW_WATER_PERCENT < LRU_HIGH_WATER_PERCENT <= 100`
//! 3. `MIN_BINARY_PAGE_SIZE > TRANSACTION_ID_SIZE`
//! 4. `DEFAULT_BLOCK_SIZE % PAGE_SIZE_ALIGNMENT == 0`

use std::time::Duration;

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Default nominal page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Append-only page sizes must be a multiple of this value.
pub const PAGE_SIZE_ALIGNMENT: usize = 4096;

/// Size of the little-endian transaction id that prefixes each dual-buffer slot.
pub const TRANSACTION_ID_SIZE: usize = 8;

/// Smallest nominal page size accepted by the binary store.
pub const MIN_BINARY_PAGE_SIZE: usize = 64;

/// Transaction id assigned to the first slot of a freshly created dual-buffer
/// page so that the first write always targets that slot.
pub const UNWRITTEN_SLOT_TRANSACTION_ID: u64 = u64::MAX;

const _: () = assert!(
    DEFAULT_PAGE_SIZE % PAGE_SIZE_ALIGNMENT == 0,
    "DEFAULT_PAGE_SIZE must be a multiple of PAGE_SIZE_ALIGNMENT"
);

const _: () = assert!(
    MIN_BINARY_PAGE_SIZE > TRANSACTION_ID_SIZE,
    "a binary page slot must have room for data after its transaction id"
);

// ============================================================================
// PAGE CACHE CONFIGURATION
// ============================================================================

/// Default page cache budget in megabytes.
pub const DEFAULT_CACHE_MEGABYTES: usize = 64;

/// Percentage of capacity at which the LRU cache starts an eviction pass.
pub const LRU_HIGH_WATER_PERCENT: usize = 95;

/// Percentage of capacity at which an LRU eviction pass stops.
pub const LRU_LOW_WATER_PERCENT: usize = 80;

/// Time an LRU cache waits before retrying a full eviction pass after a pass
/// that freed nothing.
pub const EVICTION_COOLDOWN: Duration = Duration::from_millis(500);

const _: () = assert!(
    LRU_LOW_WATER_PERCENT < LRU_HIGH_WATER_PERCENT && LRU_HIGH_WATER_PERCENT <= 100,
    "LRU water marks must satisfy low < high <= 100"
);

// ============================================================================
// BACKGROUND WRITER CONFIGURATION
// ============================================================================

/// How long the background writer sleeps waiting for work before it rechecks
/// its shutdown flag.
pub const WRITER_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Number of last-written stamps the writer keeps before pruning entries
/// whose pages have been dropped.
pub const WRITER_STAMP_RETENTION: usize = 4096;

/// Number of independently locked shards in the background writer's task
/// table. Pages map to shards by `page_id % WRITER_TASK_SHARDS`.
pub const WRITER_TASK_SHARDS: usize = 64;

// ============================================================================
// BLOCK STORAGE CONFIGURATION
// ============================================================================

/// Default block size for block-provider backed streams (64KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const _: () = assert!(
    DEFAULT_BLOCK_SIZE % PAGE_SIZE_ALIGNMENT == 0,
    "DEFAULT_BLOCK_SIZE must be a multiple of PAGE_SIZE_ALIGNMENT"
);

// ============================================================================
// STORE DEFAULTS
// ============================================================================

/// Number of pages warmed into the cache when a binary store opens.
pub const DEFAULT_PRELOAD_PAGES: usize = 0;
