//! Append-only byte stores that back a log file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{ReplicatorError, Result};

pub trait PersistenceReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> PersistenceReader for T {}

/// A growable byte sequence with truncation, read through independent readers.
pub trait BytePersistence: Send {
    fn size(&self) -> Result<u64>;

    fn append(&mut self, bytes: &[u8]) -> Result<()>;

    /// A fresh reader positioned at offset 0.
    fn reader(&self) -> Result<Box<dyn PersistenceReader>>;

    /// Discards everything from `size` onward.
    fn truncate(&mut self, size: u64) -> Result<()>;

    fn sync(&mut self) -> Result<()>;
}

pub struct FilePersistence {
    path: PathBuf,
    file: File,
}

impl FilePersistence {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BytePersistence for FilePersistence {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn PersistenceReader>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if size > self.size()? {
            return Err(ReplicatorError::InvalidArgument(format!(
                "cannot truncate {} to {size}, past its end",
                self.path.display()
            )));
        }
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory persistence; clones share the same bytes.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bytes<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> T) -> Result<T> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| ReplicatorError::Fatal("memory persistence lock poisoned".into()))?;
        Ok(f(&mut bytes))
    }
}

impl BytePersistence for MemoryPersistence {
    fn size(&self) -> Result<u64> {
        self.with_bytes(|bytes| bytes.len() as u64)
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.with_bytes(|bytes| bytes.extend_from_slice(data))
    }

    fn reader(&self) -> Result<Box<dyn PersistenceReader>> {
        let snapshot = self.with_bytes(|bytes| bytes.clone())?;
        Ok(Box::new(Cursor::new(snapshot)))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let len = self.size()?;
        if size > len {
            return Err(ReplicatorError::InvalidArgument(format!(
                "cannot truncate {len} bytes to {size}"
            )));
        }
        self.with_bytes(|bytes| bytes.truncate(size as usize))
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
