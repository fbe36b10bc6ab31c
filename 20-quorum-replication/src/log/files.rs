//! On-disk layout of a quorum's log files.
//!
//! ```text
//! <base>/wal/logs/<quorum id>/1.log
//!                            /2.log   <- highest number is the current file
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::{ReplicatorError, Result};
use crate::settings::{WAL_LOG_FILE_SUBDIRECTORY_NAME, WAL_ROOT_DIRECTORY_NAME};

const LOG_FILE_EXTENSION: &str = "log";

/// Quorum ids become directory names, so only a conservative character set is allowed.
pub fn validate_quorum_id(quorum_id: &str) -> Result<()> {
    let valid = !quorum_id.is_empty()
        && quorum_id != "."
        && quorum_id != ".."
        && quorum_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ReplicatorError::InvalidArgument(format!(
            "quorum id {quorum_id:?} is not a valid file name"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub number: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogFiles {
    quorum_dir: PathBuf,
}

impl LogFiles {
    pub fn new(base_dir: &Path, quorum_id: &str) -> Result<Self> {
        validate_quorum_id(quorum_id)?;
        let quorum_dir = base_dir
            .join(WAL_ROOT_DIRECTORY_NAME)
            .join(WAL_LOG_FILE_SUBDIRECTORY_NAME)
            .join(quorum_id);
        fs::create_dir_all(&quorum_dir)?;
        Ok(Self { quorum_dir })
    }

    pub fn quorum_dir(&self) -> &Path {
        &self.quorum_dir
    }

    /// Every log file of the quorum, oldest first. Unrelated files are ignored.
    pub fn list(&self) -> Result<Vec<LogFile>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.quorum_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_FILE_EXTENSION) {
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(number) = number {
                files.push(LogFile { number, path });
            }
        }
        files.sort_by_key(|file| file.number);
        Ok(files)
    }

    /// Path of the file that follows the current one. The file is not created.
    pub fn next_file(&self) -> Result<LogFile> {
        let number = self.list()?.last().map(|file| file.number + 1).unwrap_or(1);
        Ok(LogFile {
            number,
            path: self.quorum_dir.join(format!("{number}.{LOG_FILE_EXTENSION}")),
        })
    }

    /// Archived files last modified before `older_than`, oldest first.
    ///
    /// Only a prefix of the archive qualifies, so the remaining files stay contiguous.
    /// The current file is never returned.
    pub fn old_logs(&self, older_than: SystemTime) -> Result<Vec<LogFile>> {
        let mut files = self.list()?;
        files.pop();
        let mut old = Vec::new();
        for file in files {
            let modified = fs::metadata(&file.path)?.modified()?;
            if modified >= older_than {
                break;
            }
            old.push(file);
        }
        Ok(old)
    }

    pub fn delete(&self, file: &LogFile) -> Result<()> {
        debug!(path = %file.path.display(), "deleting log file");
        fs::remove_file(&file.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_quorum_ids_that_escape_the_directory() {
        assert!(validate_quorum_id("quorum-1_a.b").is_ok());
        for bad in ["", "..", "a/b", "a b"] {
            assert!(validate_quorum_id(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn numbers_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::new(dir.path(), "q").unwrap();
        assert!(files.list().unwrap().is_empty());

        for _ in 0..3 {
            let next = files.next_file().unwrap();
            fs::write(&next.path, b"").unwrap();
        }
        fs::write(files.quorum_dir().join("notes.txt"), b"").unwrap();

        let numbers: Vec<u64> = files.list().unwrap().iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(files.quorum_dir().ends_with("wal/logs/q"));
    }

    #[test]
    fn old_logs_never_include_the_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = LogFiles::new(dir.path(), "q").unwrap();
        for _ in 0..2 {
            fs::write(files.next_file().unwrap().path, b"").unwrap();
        }
        let far_future = SystemTime::now() + std::time::Duration::from_secs(3600);
        let old = files.old_logs(far_future).unwrap();
        assert_eq!(old.iter().map(|f| f.number).collect::<Vec<_>>(), vec![1]);
        assert!(files.old_logs(SystemTime::UNIX_EPOCH).unwrap().is_empty());
    }
}
