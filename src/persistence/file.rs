//! File-system backed persistence manager.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use super::{FileMode, PersistenceManager, StoreStream};
use crate::error::StoreError;

#[derive(Debug, Default, Clone, Copy)]
pub struct FilePersistenceManager;

impl FilePersistenceManager {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).wrap_err_with(|| {
                format!("failed to create parent directory '{}'", parent.display())
            })?;
        }
    }
    Ok(())
}

impl PersistenceManager for FilePersistenceManager {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_file(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).wrap_err_with(|| format!("failed to delete '{}'", path.display()))
    }

    fn input_stream(&self, path: &Path) -> Result<Box<dyn StoreStream>> {
        if !path.is_file() {
            return Err(StoreError::StoreNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}' for reading", path.display()))?;
        Ok(Box::new(file))
    }

    fn output_stream(&self, path: &Path, mode: FileMode) -> Result<Box<dyn StoreStream>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        match mode {
            FileMode::Open => {}
            FileMode::OpenOrCreate | FileMode::Append => {
                ensure_parent(path)?;
                options.create(true);
            }
            FileMode::Create => {
                ensure_parent(path)?;
                options.create(true).truncate(true);
            }
        }

        let mut file = options.open(path).wrap_err_with(|| {
            format!(
                "failed to open '{}' for writing ({:?})",
                path.display(),
                mode
            )
        })?;

        if mode == FileMode::Append {
            file.seek(SeekFrom::End(0))
                .wrap_err_with(|| format!("failed to seek to end of '{}'", path.display()))?;
        }
        Ok(Box::new(file))
    }

    fn file_length(&self, path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path)
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;
        Ok(metadata.len())
    }

    fn list_subdirectories(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)
            .wrap_err_with(|| format!("failed to list directory '{}'", path.display()))?
        {
            let entry = entry.wrap_err("failed to read directory entry")?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        ensure_parent(to)?;
        fs::rename(from, to).wrap_err_with(|| {
            format!(
                "failed to rename '{}' to '{}'",
                from.display(),
                to.display()
            )
        })
    }

    fn copy_file(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        ensure!(
            overwrite || !to.exists(),
            "cannot copy '{}': destination '{}' already exists",
            from.display(),
            to.display()
        );
        ensure_parent(to)?;
        fs::copy(from, to).wrap_err_with(|| {
            format!("failed to copy '{}' to '{}'", from.display(), to.display())
        })?;
        Ok(())
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create directory '{}'", path.display()))
    }

    fn delete_directory(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)
            .wrap_err_with(|| format!("failed to delete directory '{}'", path.display()))
    }
}
