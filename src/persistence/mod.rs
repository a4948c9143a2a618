//! # Persistence Managers
//!
//! Page stores never touch `std::fs` directly. Every file operation goes
//! through a [`PersistenceManager`], which hands out [`StoreStream`]s for
//! reading and writing. This keeps the page stores independent of where the
//! bytes actually live:
//!
//! | Manager                    | Backing storage                          |
//! |----------------------------|------------------------------------------|
//! | `FilePersistenceManager`   | Local file system (`std::fs`)            |
//! | `BlockPersistenceManager`  | Named block blobs via `BlockProviderStream` |
//!
//! ## Streams
//!
//! A [`StoreStream`] is `Read + Write + Seek + Send` plus `sync()`, the
//! durability point. For files `sync()` is `fsync`; for block streams it
//! writes back the active block.
//!
//! ## File Modes
//!
//! ```text
//! FileMode::Open         file must exist, position 0
//! FileMode::OpenOrCreate created empty if missing, position 0
//! FileMode::Create       always starts empty (truncates)
//! FileMode::Append       created if missing, position at end
//! ```

mod block;
mod file;

pub use block::BlockPersistenceManager;
pub use file::FilePersistenceManager;

use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use eyre::Result;

/// A seekable byte stream over a store file.
pub trait StoreStream: Read + Write + Seek + Send {
    /// Flushes buffered writes and forces them to durable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl StoreStream for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl StoreStream for io::Cursor<Vec<u8>> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Open,
    OpenOrCreate,
    Create,
    Append,
}

/// File and directory operations consumed by the page stores.
pub trait PersistenceManager: Send + Sync {
    fn file_exists(&self, path: &Path) -> bool;

    fn directory_exists(&self, path: &Path) -> bool;

    /// Creates an empty file, truncating any existing one.
    fn create_file(&self, path: &Path) -> Result<()>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Opens a read-only stream positioned at the start of the file.
    fn input_stream(&self, path: &Path) -> Result<Box<dyn StoreStream>>;

    /// Opens a writable stream according to `mode`.
    fn output_stream(&self, path: &Path, mode: FileMode) -> Result<Box<dyn StoreStream>>;

    fn file_length(&self, path: &Path) -> Result<u64>;

    /// Returns the names (not full paths) of the directories directly under `path`.
    fn list_subdirectories(&self, path: &Path) -> Result<Vec<String>>;

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    fn copy_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()>;

    /// Creates the directory and any missing parents.
    fn create_directory(&self, path: &Path) -> Result<()>;

    /// Removes the directory and everything below it.
    fn delete_directory(&self, path: &Path) -> Result<()>;
}
