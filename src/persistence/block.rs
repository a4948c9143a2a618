//! Persistence manager over named in-memory block blobs.
//!
//! Each file path maps to a [`MemoryBlockProvider`]; streams are
//! [`BlockProviderStream`]s over it. Directories are tracked as a set of
//! paths. Writers are restricted to the active block, which suits the
//! append-only page store but not the binary store's in-place rewrites.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::RwLock;

use super::{FileMode, PersistenceManager, StoreStream};
use crate::block::{BlockProvider, BlockProviderStream, MemoryBlockProvider};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Namespace {
    files: HashMap<PathBuf, Arc<MemoryBlockProvider>>,
    directories: HashSet<PathBuf>,
}

#[derive(Debug)]
pub struct BlockPersistenceManager {
    block_size: usize,
    namespace: RwLock<Namespace>,
}

impl Default for BlockPersistenceManager {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            namespace: RwLock::new(Namespace::default()),
        }
    }
}

impl BlockPersistenceManager {
    pub fn new(block_size: usize) -> Result<Self> {
        ensure!(block_size > 0, "block size must be non-zero");
        Ok(Self {
            block_size,
            namespace: RwLock::new(Namespace::default()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the provider behind `path`, if the file exists.
    pub fn provider(&self, path: &Path) -> Option<Arc<MemoryBlockProvider>> {
        self.namespace.read().files.get(path).cloned()
    }

    fn new_provider(&self) -> Result<Arc<MemoryBlockProvider>> {
        Ok(Arc::new(MemoryBlockProvider::new(self.block_size)?))
    }

    fn existing(&self, path: &Path) -> Result<Arc<MemoryBlockProvider>> {
        self.provider(path).ok_or_else(|| {
            StoreError::StoreNotFound {
                path: path.to_path_buf(),
            }
            .into()
        })
    }
}

impl PersistenceManager for BlockPersistenceManager {
    fn file_exists(&self, path: &Path) -> bool {
        self.namespace.read().files.contains_key(path)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        self.namespace.read().directories.contains(path)
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        let provider = self.new_provider()?;
        self.namespace
            .write()
            .files
            .insert(path.to_path_buf(), provider);
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        if self.namespace.write().files.remove(path).is_none() {
            bail!(StoreError::StoreNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn input_stream(&self, path: &Path) -> Result<Box<dyn StoreStream>> {
        let provider: Arc<dyn BlockProvider> = self.existing(path)?;
        Ok(Box::new(BlockProviderStream::new(provider)))
    }

    fn output_stream(&self, path: &Path, mode: FileMode) -> Result<Box<dyn StoreStream>> {
        let provider = match mode {
            FileMode::Open => self.existing(path)?,
            FileMode::Create => {
                let provider = self.new_provider()?;
                self.namespace
                    .write()
                    .files
                    .insert(path.to_path_buf(), provider.clone());
                provider
            }
            FileMode::OpenOrCreate | FileMode::Append => {
                let fresh = self.new_provider()?;
                self.namespace
                    .write()
                    .files
                    .entry(path.to_path_buf())
                    .or_insert(fresh)
                    .clone()
            }
        };

        let provider: Arc<dyn BlockProvider> = provider;
        let stream = if mode == FileMode::Append {
            BlockProviderStream::at_end(provider)
        } else {
            BlockProviderStream::new(provider)
        };
        Ok(Box::new(stream))
    }

    fn file_length(&self, path: &Path) -> Result<u64> {
        Ok(self.existing(path)?.length())
    }

    fn list_subdirectories(&self, path: &Path) -> Result<Vec<String>> {
        let namespace = self.namespace.read();
        let mut names: Vec<String> = namespace
            .directories
            .iter()
            .filter(|dir| dir.parent() == Some(path))
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        let mut namespace = self.namespace.write();
        let Some(provider) = namespace.files.remove(from) else {
            bail!(StoreError::StoreNotFound {
                path: from.to_path_buf(),
            });
        };
        namespace.files.insert(to.to_path_buf(), provider);
        Ok(())
    }

    fn copy_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        let copy = Arc::new(self.existing(from)?.snapshot());
        let mut namespace = self.namespace.write();
        ensure!(
            overwrite || !namespace.files.contains_key(to),
            "cannot copy '{}': destination '{}' already exists",
            from.display(),
            to.display()
        );
        namespace.files.insert(to.to_path_buf(), copy);
        Ok(())
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        let mut namespace = self.namespace.write();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            namespace.directories.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn delete_directory(&self, path: &Path) -> Result<()> {
        let mut namespace = self.namespace.write();
        namespace.directories.retain(|dir| !dir.starts_with(path));
        namespace.files.retain(|file, _| !file.starts_with(path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn files_round_trip_through_blocks() {
        let pm = BlockPersistenceManager::new(8).unwrap();
        let path = Path::new("/stores/a.data");

        {
            let mut out = pm.output_stream(path, FileMode::OpenOrCreate).unwrap();
            out.write_all(b"0123456789abcdef-tail").unwrap();
            out.sync().unwrap();
        }
        assert!(pm.file_exists(path));
        assert_eq!(pm.file_length(path).unwrap(), 21);
        assert_eq!(pm.provider(path).unwrap().block_count(), 3);

        let mut input = pm.input_stream(path).unwrap();
        let mut text = String::new();
        input.read_to_string(&mut text).unwrap();
        assert_eq!(text, "0123456789abcdef-tail");
    }

    #[test]
    fn create_mode_truncates() {
        let pm = BlockPersistenceManager::default();
        let path = Path::new("f");

        pm.output_stream(path, FileMode::Create)
            .unwrap()
            .write_all(b"long contents")
            .unwrap();
        pm.output_stream(path, FileMode::Create)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        assert_eq!(pm.file_length(path).unwrap(), 1);
    }

    #[test]
    fn open_mode_requires_existing_file() {
        let pm = BlockPersistenceManager::default();
        assert!(pm.output_stream(Path::new("nope"), FileMode::Open).is_err());
        assert!(pm.input_stream(Path::new("nope")).is_err());
        assert!(pm.delete_file(Path::new("nope")).is_err());
    }

    #[test]
    fn directories_and_copies() {
        let pm = BlockPersistenceManager::default();
        pm.create_directory(Path::new("/root/x/y")).unwrap();
        pm.create_directory(Path::new("/root/z")).unwrap();
        assert_eq!(
            pm.list_subdirectories(Path::new("/root")).unwrap(),
            vec!["x", "z"]
        );

        let a = Path::new("/root/x/a");
        pm.create_file(a).unwrap();
        pm.output_stream(a, FileMode::Append)
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        pm.copy_file(a, Path::new("/root/z/b"), false).unwrap();
        assert!(pm.copy_file(a, Path::new("/root/z/b"), false).is_err());
        pm.rename_file(Path::new("/root/z/b"), Path::new("/root/z/c"))
            .unwrap();
        assert_eq!(pm.file_length(Path::new("/root/z/c")).unwrap(), 3);

        pm.delete_directory(Path::new("/root/x")).unwrap();
        assert!(!pm.directory_exists(Path::new("/root/x/y")));
        assert!(!pm.file_exists(a));
        assert!(pm.directory_exists(Path::new("/root/z")));
    }
}
