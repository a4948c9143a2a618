//! # Block Providers
//!
//! A block provider stores a single named blob as a sequence of fixed-size
//! blocks. Only the last block (the *active* block) may be rewritten; every
//! block before it is sealed. This models append-mostly object storage where
//! an uploaded block is immutable.
//!
//! ```text
//! offset 0          block_size       2*block_size      length
//! +-----------------+----------------+------------------+
//! |  sealed block   |  sealed block  |   active block   |
//! +-----------------+----------------+------------------+
//!                                    ^
//!                          active_block_offset
//! ```
//!
//! [`BlockProviderStream`] layers a seekable `Read + Write` stream over a
//! provider so the append-only page store can run on top of block storage.
//! [`MemoryBlockProvider`] keeps the blocks in memory and backs
//! `BlockPersistenceManager`.

mod stream;

pub use stream::BlockProviderStream;

use eyre::{ensure, Result};
use parking_lot::Mutex;

pub trait BlockProvider: Send + Sync {
    fn block_size(&self) -> usize;

    /// Number of bytes stored.
    fn length(&self) -> u64;

    /// Offset of the block that can still be rewritten.
    fn active_block_offset(&self) -> u64;

    /// Reads the block starting at `block_offset` into `buf` and returns the
    /// number of valid bytes. `buf` must be at least one block long.
    fn read_block(&self, block_offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Stores `data` as the block starting at `block_offset`.
    ///
    /// Fails if the block is sealed or `data` is longer than a block.
    fn write_block(&self, block_offset: u64, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
struct Blocks {
    blocks: Vec<Vec<u8>>,
}

impl Blocks {
    fn length(&self, block_size: usize) -> u64 {
        match self.blocks.last() {
            Some(last) => ((self.blocks.len() - 1) * block_size + last.len()) as u64,
            None => 0,
        }
    }
}

#[derive(Debug)]
pub struct MemoryBlockProvider {
    block_size: usize,
    inner: Mutex<Blocks>,
}

impl MemoryBlockProvider {
    pub fn new(block_size: usize) -> Result<Self> {
        ensure!(block_size > 0, "block size must be non-zero");
        Ok(Self {
            block_size,
            inner: Mutex::new(Blocks::default()),
        })
    }

    /// Returns a fresh provider holding a copy of this provider's blocks.
    pub fn snapshot(&self) -> Self {
        let blocks = self.inner.lock().blocks.clone();
        Self {
            block_size: self.block_size,
            inner: Mutex::new(Blocks { blocks }),
        }
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Returns the whole blob as one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().blocks.concat()
    }

    fn check_offset(&self, block_offset: u64) -> Result<usize> {
        ensure!(
            block_offset % self.block_size as u64 == 0,
            "offset {} is not aligned to block size {}",
            block_offset,
            self.block_size
        );
        Ok((block_offset / self.block_size as u64) as usize)
    }
}

impl BlockProvider for MemoryBlockProvider {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn length(&self) -> u64 {
        self.inner.lock().length(self.block_size)
    }

    fn active_block_offset(&self) -> u64 {
        let inner = self.inner.lock();
        (inner.blocks.len().saturating_sub(1) * self.block_size) as u64
    }

    fn read_block(&self, block_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let index = self.check_offset(block_offset)?;
        ensure!(
            buf.len() >= self.block_size,
            "read buffer of {} bytes is smaller than block size {}",
            buf.len(),
            self.block_size
        );

        let inner = self.inner.lock();
        let Some(block) = inner.blocks.get(index) else {
            return Ok(0);
        };
        buf[..block.len()].copy_from_slice(block);
        Ok(block.len())
    }

    fn write_block(&self, block_offset: u64, data: &[u8]) -> Result<()> {
        let index = self.check_offset(block_offset)?;
        ensure!(
            data.len() <= self.block_size,
            "block of {} bytes exceeds block size {}",
            data.len(),
            self.block_size
        );

        let mut inner = self.inner.lock();
        let active = inner.blocks.len().saturating_sub(1);
        ensure!(
            index >= active,
            "block at offset {} is sealed (active block is at {})",
            block_offset,
            active * self.block_size
        );

        // Skipped blocks become full, zero-filled and sealed.
        if let Some(last) = inner.blocks.last_mut() {
            if index > active {
                last.resize(self.block_size, 0);
            }
        }
        while inner.blocks.len() < index {
            inner.blocks.push(vec![0; self.block_size]);
        }

        if index == inner.blocks.len() {
            inner.blocks.push(data.to_vec());
        } else {
            inner.blocks[index] = data.to_vec();
        }
        Ok(())
    }
}
