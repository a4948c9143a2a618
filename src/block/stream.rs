//! Seekable stream over a [`BlockProvider`].
//!
//! The stream caches one block in memory. Reads and writes that cross a
//! block boundary continue in the next block; moving to another block writes
//! the cached one back first if it was modified. Writing into a sealed block
//! is an I/O error.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::warn;

use super::BlockProvider;
use crate::persistence::StoreStream;

struct CachedBlock {
    offset: u64,
    data: Vec<u8>,
    valid: usize,
    dirty: bool,
}

pub struct BlockProviderStream {
    provider: Arc<dyn BlockProvider>,
    position: u64,
    block: Option<CachedBlock>,
}

fn to_io(err: eyre::Report) -> io::Error {
    io::Error::other(format!("{:#}", err))
}

impl BlockProviderStream {
    pub fn new(provider: Arc<dyn BlockProvider>) -> Self {
        Self {
            provider,
            position: 0,
            block: None,
        }
    }

    /// Opens the stream positioned at the end of the blob.
    pub fn at_end(provider: Arc<dyn BlockProvider>) -> Self {
        let position = provider.length();
        Self {
            provider,
            position,
            block: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical length including unflushed writes.
    pub fn length(&self) -> u64 {
        let stored = self.provider.length();
        match &self.block {
            Some(b) if b.dirty => stored.max(b.offset + b.valid as u64),
            _ => stored,
        }
    }

    fn block_size(&self) -> u64 {
        self.provider.block_size() as u64
    }

    fn write_back(&mut self) -> io::Result<()> {
        if let Some(block) = self.block.as_mut() {
            if block.dirty {
                self.provider
                    .write_block(block.offset, &block.data[..block.valid])
                    .map_err(to_io)?;
                block.dirty = false;
            }
        }
        Ok(())
    }

    fn load(&mut self, offset: u64) -> io::Result<&mut CachedBlock> {
        if self.block.as_ref().map(|b| b.offset) != Some(offset) {
            self.write_back()?;

            let mut data = vec![0u8; self.provider.block_size()];
            let valid = if offset < self.provider.length() {
                self.provider.read_block(offset, &mut data).map_err(to_io)?
            } else {
                0
            };
            self.block = Some(CachedBlock {
                offset,
                data,
                valid,
                dirty: false,
            });
        }
        // Populated above.
        self.block
            .as_mut()
            .ok_or_else(|| io::Error::other("block cache is empty"))
    }
}

impl Read for BlockProviderStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Another stream may have rewritten the active block since a clean
        // block was cached.
        if self.block.as_ref().is_some_and(|b| !b.dirty) {
            self.block = None;
        }
        let length = self.length();
        let block_size = self.block_size();
        let mut done = 0;

        while done < buf.len() && self.position < length {
            let offset = self.position - self.position % block_size;
            let within = (self.position - offset) as usize;
            let block = self.load(offset)?;
            if within >= block.valid {
                break;
            }

            let n = (block.valid - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&block.data[within..within + n]);
            done += n;
            self.position += n as u64;
        }
        Ok(done)
    }
}

impl Write for BlockProviderStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let block_size = self.block_size();
        let mut done = 0;

        while done < buf.len() {
            let offset = self.position - self.position % block_size;
            // A dirty cached block becomes the active one once written back.
            let frontier = match &self.block {
                Some(b) if b.dirty => b.offset.max(self.provider.active_block_offset()),
                _ => self.provider.active_block_offset(),
            };
            if offset < frontier {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("cannot write at {}: block {} is sealed", self.position, offset),
                ));
            }

            let within = (self.position - offset) as usize;
            let block = self.load(offset)?;
            let n = (block.data.len() - within).min(buf.len() - done);
            block.data[within..within + n].copy_from_slice(&buf[done..done + n]);
            block.valid = block.valid.max(within + n);
            block.dirty = true;

            done += n;
            self.position += n as u64;
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        let active = self.provider.active_block_offset();
        match &self.block {
            Some(b) if b.dirty && b.offset < active => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("modified block {} was sealed before it was flushed", b.offset),
            )),
            _ => self.write_back(),
        }
    }
}

impl Seek for BlockProviderStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.length().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

impl StoreStream for BlockProviderStream {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Drop for BlockProviderStream {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to write back active block on close");
        }
    }
}
