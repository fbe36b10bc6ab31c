//! The on-disk log of one quorum, spread over a sequence of rolled files.
//!
//! Each file begins with a [`LogHeader`] frame recording what preceded it, so
//! a file can be read on its own and older files can be deleted without losing
//! the term and configuration in force. Entry frames follow the header.
//!
//! `QuorumLog` is not thread-safe; the log service gives each quorum a worker
//! thread that owns its `QuorumLog` exclusively.

use std::io::Seek;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{self, FrameScan};
use crate::entry::LogEntry;
use crate::error::{ReplicatorError, Result};
use crate::log::files::{LogFile, LogFiles};
use crate::log::navigator::PersistenceNavigator;
use crate::log::oracle::{LogEntryOracle, QuorumConfigurationWithSeqNum};
use crate::log::persistence::{BytePersistence, FilePersistence};
use crate::log::replicator_log::check_append;
use crate::quorum::QuorumConfiguration;
use crate::settings::LogSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub base_seq_num: u64,
    pub base_term: u64,
    pub base_configuration: QuorumConfiguration,
    pub base_configuration_seq_num: u64,
}

impl LogHeader {
    fn base_configuration(&self) -> QuorumConfigurationWithSeqNum {
        QuorumConfigurationWithSeqNum {
            configuration: self.base_configuration.clone(),
            seq_num: self.base_configuration_seq_num,
        }
    }
}

struct Segment {
    file: LogFile,
    header: LogHeader,
    navigator: PersistenceNavigator,
    last_seq_num: u64,
}

impl Segment {
    fn contains(&self, seq_num: u64) -> bool {
        self.header.base_seq_num < seq_num && seq_num <= self.last_seq_num
    }
}

pub struct QuorumLog {
    quorum_id: String,
    files: LogFiles,
    segments: Vec<Segment>,
    oracle: LogEntryOracle,
    max_entry_seek: u64,
}

impl QuorumLog {
    /// Opens the quorum's files under `base_dir`, scanning each to rebuild the
    /// navigators and the oracle. A torn or checksum-failing final frame of the
    /// current file is cut off; damage anywhere else is `Fatal`.
    pub fn open(base_dir: &Path, quorum_id: &str, settings: &LogSettings) -> Result<Self> {
        let files = LogFiles::new(base_dir, quorum_id)?;
        let mut log = Self {
            quorum_id: quorum_id.to_string(),
            files,
            segments: Vec::new(),
            oracle: LogEntryOracle::new(),
            max_entry_seek: settings.max_entry_seek,
        };

        let existing = log.files.list()?;
        let count = existing.len();
        for (position, file) in existing.into_iter().enumerate() {
            let is_current = position + 1 == count;
            match log.open_segment(file.clone(), is_current)? {
                Some(segment) => log.segments.push(segment),
                None => {
                    warn!(quorum_id, path = %file.path.display(), "removing log file without header");
                    log.files.delete(&file)?;
                }
            }
        }
        if log.segments.is_empty() {
            log.create_segment()?;
        }

        info!(
            quorum_id,
            files = log.segments.len(),
            last_index = log.last_index(),
            last_term = log.last_term(),
            "opened quorum log"
        );
        Ok(log)
    }

    fn open_segment(&mut self, file: LogFile, is_current: bool) -> Result<Option<Segment>> {
        let mut persistence = FilePersistence::open(&file.path)?;
        let mut reader = persistence.reader()?;
        let Some(header) = codec::read_frame::<_, LogHeader>(&mut reader)? else {
            return Ok(None);
        };
        let first_entry_address = reader.stream_position()?;

        if let Some(previous) = self.segments.last() {
            if previous.last_seq_num != header.base_seq_num {
                return Err(ReplicatorError::LogConsistency(format!(
                    "{} starts after seq {} but the previous file ends at {}",
                    file.path.display(),
                    header.base_seq_num,
                    previous.last_seq_num
                )));
            }
        }
        self.oracle
            .notify_base(header.base_seq_num, header.base_term, &header.base_configuration());

        let file_len = persistence.size()?;
        let mut logged = Vec::new();
        let mut last_seq_num = header.base_seq_num;
        let mut torn_at = None;
        loop {
            let address = reader.stream_position()?;
            let body = match codec::scan_frame(&mut reader)? {
                FrameScan::Frame(body) => body,
                FrameScan::End => break,
                FrameScan::Torn if is_current => {
                    warn!(path = %file.path.display(), address, "cutting off torn log tail");
                    torn_at = Some(address);
                    break;
                }
                FrameScan::Corrupt if is_current && reader.stream_position()? == file_len => {
                    warn!(path = %file.path.display(), address, "cutting off final frame with a bad checksum");
                    torn_at = Some(address);
                    break;
                }
                FrameScan::Torn | FrameScan::Corrupt => {
                    return Err(ReplicatorError::Fatal(format!(
                        "{} is damaged at offset {address}",
                        file.path.display()
                    )));
                }
            };
            let entry: LogEntry = codec::decode_body(&body).map_err(|err| {
                ReplicatorError::Fatal(format!(
                    "{} holds an undecodable entry at offset {address}: {err}",
                    file.path.display()
                ))
            })?;
            if entry.index != last_seq_num + 1 {
                return Err(ReplicatorError::LogConsistency(format!(
                    "{} holds seq {} after seq {}",
                    file.path.display(),
                    entry.index,
                    last_seq_num
                )));
            }
            last_seq_num = entry.index;
            self.oracle.notify_logging(&entry);
            logged.push((entry.index, address));
        }
        drop(reader);

        if let Some(address) = torn_at {
            persistence.truncate(address)?;
            persistence.sync()?;
        }

        let mut navigator = PersistenceNavigator::new(Box::new(persistence), first_entry_address);
        navigator.set_max_entry_seek(self.max_entry_seek)?;
        for (seq_num, address) in logged {
            navigator.notify_logging(seq_num, address);
        }

        Ok(Some(Segment {
            file,
            header,
            navigator,
            last_seq_num,
        }))
    }

    /// Starts a new current file whose header captures the log's state so far.
    fn create_segment(&mut self) -> Result<()> {
        let last_index = self.last_index();
        let base_configuration = self.oracle.config_at_seq_num(last_index);
        let header = LogHeader {
            base_seq_num: last_index,
            base_term: self.oracle.term_at_seq_num(last_index),
            base_configuration: base_configuration.configuration,
            base_configuration_seq_num: base_configuration.seq_num,
        };

        let file = self.files.next_file()?;
        let mut persistence = FilePersistence::open(&file.path)?;
        let header_bytes = codec::frame_bytes(&header)?;
        persistence.append(&header_bytes)?;
        persistence.sync()?;

        let mut navigator =
            PersistenceNavigator::new(Box::new(persistence), header_bytes.len() as u64);
        navigator.set_max_entry_seek(self.max_entry_seek)?;

        debug!(quorum_id = %self.quorum_id, number = file.number, base_seq_num = last_index, "created log file");
        self.segments.push(Segment {
            file,
            header,
            navigator,
            last_seq_num: last_index,
        });
        Ok(())
    }

    fn current(&mut self) -> Result<&mut Segment> {
        self.segments
            .last_mut()
            .ok_or_else(|| ReplicatorError::Fatal("quorum log has no current file".into()))
    }

    pub fn quorum_id(&self) -> &str {
        &self.quorum_id
    }

    pub fn oracle(&self) -> &LogEntryOracle {
        &self.oracle
    }

    pub fn last_index(&self) -> u64 {
        self.segments.last().map(|segment| segment.last_seq_num).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.oracle.term_at_seq_num(self.last_index())
    }

    pub fn file_count(&self) -> usize {
        self.segments.len()
    }

    /// Appends and syncs. Entries must continue the log without a gap.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        check_append(self.last_index(), entries)?;
        if entries.is_empty() {
            return Ok(());
        }

        let segment = self.current()?;
        let start = segment.navigator.persistence().size()?;
        let mut bytes = Vec::new();
        let mut addresses = Vec::with_capacity(entries.len());
        for entry in entries {
            addresses.push(start + bytes.len() as u64);
            codec::encode_frame(entry, &mut bytes)?;
        }
        let persistence = segment.navigator.persistence_mut();
        persistence.append(&bytes)?;
        persistence.sync()?;

        for (entry, address) in entries.iter().zip(addresses) {
            segment.navigator.notify_logging(entry.index, address);
            segment.last_seq_num = entry.index;
        }
        for entry in entries {
            self.oracle.notify_logging(entry);
        }
        Ok(())
    }

    /// Entries `start..end`. `start == end` yields nothing.
    pub fn entries(&mut self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        if start == end {
            return Ok(Vec::new());
        }
        if start == 0 || start > end {
            return Err(ReplicatorError::InvalidArgument(format!(
                "invalid entry range {start}..{end}"
            )));
        }
        if end > self.last_index() + 1 {
            return Err(ReplicatorError::EntryNotFound(end - 1));
        }

        let mut found = Vec::with_capacity((end - start) as usize);
        let mut next = start;
        for segment in self.segments.iter_mut() {
            if next >= end {
                break;
            }
            if !segment.contains(next) {
                continue;
            }
            let mut reader = segment.navigator.reader_at_seq_num(next)?;
            while next < end && next <= segment.last_seq_num {
                let entry = codec::decode_entry(&mut reader)?
                    .ok_or(ReplicatorError::EntryNotFound(next))?;
                if entry.index != next {
                    return Err(ReplicatorError::LogConsistency(format!(
                        "expected seq {next} but read {}",
                        entry.index
                    )));
                }
                found.push(entry);
                next += 1;
            }
        }
        if next < end {
            return Err(ReplicatorError::EntryNotFound(next));
        }
        Ok(found)
    }

    /// Removes `seq_num` and everything after it. Files that would be left
    /// holding nothing are deleted, except the first remaining one.
    pub fn truncate(&mut self, seq_num: u64) -> Result<()> {
        if seq_num == 0 {
            return Err(ReplicatorError::InvalidArgument("cannot truncate at seq num 0".into()));
        }
        if seq_num > self.last_index() {
            return Ok(());
        }
        let first_base = self.segments.first().map(|s| s.header.base_seq_num).unwrap_or(0);
        if seq_num <= first_base {
            return Err(ReplicatorError::InvalidArgument(format!(
                "seq {seq_num} precedes the oldest retained log file"
            )));
        }

        while self.segments.len() > 1
            && self
                .segments
                .last()
                .is_some_and(|segment| segment.header.base_seq_num >= seq_num)
        {
            if let Some(segment) = self.segments.pop() {
                drop(segment.navigator);
                self.files.delete(&segment.file)?;
            }
        }

        let segment = self.current()?;
        if seq_num <= segment.last_seq_num {
            let address = segment.navigator.address_of_entry(seq_num)?;
            let persistence = segment.navigator.persistence_mut();
            persistence.truncate(address)?;
            persistence.sync()?;
            segment.navigator.notify_truncation(seq_num)?;
            segment.last_seq_num = seq_num - 1;
        }
        self.oracle.notify_truncation(seq_num);
        debug!(quorum_id = %self.quorum_id, seq_num, last_index = self.last_index(), "truncated log");
        Ok(())
    }

    pub fn roll(&mut self) -> Result<()> {
        self.create_segment()?;
        info!(quorum_id = %self.quorum_id, files = self.segments.len(), "rolled log");
        Ok(())
    }

    /// Deletes archived files last modified before `older_than`. Returns how many went.
    pub fn clear_old_logs(&mut self, older_than: SystemTime) -> Result<usize> {
        let old = self.files.old_logs(older_than)?;
        let mut removed = 0;
        for file in old {
            let Some(position) = self.segments.iter().position(|s| s.file == file) else {
                continue;
            };
            if position + 1 == self.segments.len() {
                break;
            }
            let segment = self.segments.remove(position);
            drop(segment.navigator);
            self.files.delete(&file)?;
            removed += 1;
        }
        if removed > 0 {
            info!(quorum_id = %self.quorum_id, removed, "cleared old log files");
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn current_file_size(&mut self) -> Result<u64> {
        self.current()?.navigator.persistence().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::entries;

    fn open(dir: &Path) -> QuorumLog {
        QuorumLog::open(dir, "quorum", &LogSettings::default()).unwrap()
    }

    #[test]
    fn empty_log_has_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(dir.path());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.oracle().last_configuration(), QuorumConfigurationWithSeqNum::empty());
        assert_eq!(log.file_count(), 1);
    }

    #[test]
    fn rejects_gaps_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(1).indexes(&[1, 2, 3]).build()).unwrap();
        let size = log.current_file_size().unwrap();

        assert!(log.append(&entries().term(1).indexes(&[5]).build()).is_err());
        assert!(log.append(&entries().term(1).indexes(&[4, 6]).build()).is_err());
        assert_eq!(log.current_file_size().unwrap(), size);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn reads_ranges_across_rolled_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(1).indexes(&[1, 2, 3]).build()).unwrap();
        log.roll().unwrap();
        log.append(&entries().term(2).indexes(&[4, 5]).build()).unwrap();
        log.roll().unwrap();
        log.append(&entries().term(2).indexes(&[6]).build()).unwrap();

        let read: Vec<u64> = log.entries(2, 7).unwrap().iter().map(|e| e.index).collect();
        assert_eq!(read, vec![2, 3, 4, 5, 6]);
        assert!(log.entries(4, 4).unwrap().is_empty());
        assert!(log.entries(5, 8).is_err());
    }

    #[test]
    fn truncating_across_a_roll_removes_the_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(1).indexes(&[1, 2]).build()).unwrap();
        log.roll().unwrap();
        log.append(&entries().term(2).indexes(&[3, 4]).build()).unwrap();

        log.truncate(2).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.file_count(), 1);

        log.append(&entries().term(3).indexes(&[2]).build()).unwrap();
        drop(log);
        let mut log = open(dir.path());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entries(2, 3).unwrap()[0].term, 3);
    }

    #[test]
    fn cuts_off_a_torn_tail_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(1).indexes(&[1, 2]).build()).unwrap();
        let path = log.files.list().unwrap()[0].path.clone();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let full = bytes.len();
        bytes.extend_from_slice(&codec::frame_bytes(&entries().term(1).indexes(&[3]).build()[0]).unwrap()[..4]);
        std::fs::write(&path, &bytes).unwrap();

        let mut log = open(dir.path());
        assert_eq!(log.last_index(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full as u64);
        log.append(&entries().term(1).indexes(&[3]).build()).unwrap();
        assert_eq!(log.entries(3, 4).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_entry_before_intact_ones_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let logged = entries().term(1).indexes(&[1, 2, 3]).build();
        let mut log = open(dir.path());
        log.append(&logged).unwrap();
        let path = log.files.list().unwrap()[0].path.clone();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let full = bytes.len();
        let tail: usize = logged[1..].iter().map(|e| codec::frame_bytes(e).unwrap().len()).sum();
        // a byte inside the body of entry 2
        bytes[full - tail + 3] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let reopened = QuorumLog::open(dir.path(), "quorum", &LogSettings::default());
        assert!(matches!(reopened, Err(ReplicatorError::Fatal(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full as u64);
    }

    #[test]
    fn bad_checksum_on_the_final_frame_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let logged = entries().term(1).indexes(&[1, 2, 3]).build();
        let mut log = open(dir.path());
        log.append(&logged).unwrap();
        let path = log.files.list().unwrap()[0].path.clone();
        drop(log);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = codec::frame_bytes(&logged[2]).unwrap().len();
        let at = bytes.len() - 2;
        bytes[at] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut log = open(dir.path());
        assert_eq!(log.last_index(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), (bytes.len() - last) as u64);
        assert_eq!(log.entries(1, 3).unwrap(), logged[..2].to_vec());
    }

    #[test]
    fn torn_frame_in_an_archived_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(1).indexes(&[1, 2]).build()).unwrap();
        log.roll().unwrap();
        log.append(&entries().term(1).indexes(&[3]).build()).unwrap();
        let archived = log.files.list().unwrap()[0].path.clone();
        drop(log);

        let mut bytes = std::fs::read(&archived).unwrap();
        bytes.truncate(bytes.len() - 1);
        std::fs::write(&archived, &bytes).unwrap();

        let reopened = QuorumLog::open(dir.path(), "quorum", &LogSettings::default());
        assert!(matches!(reopened, Err(ReplicatorError::Fatal(_))));
    }

    #[test]
    fn clearing_old_logs_keeps_the_current_file_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path());
        log.append(&entries().term(4).indexes(&[1, 2]).build()).unwrap();
        log.roll().unwrap();
        log.append(&entries().term(5).indexes(&[3]).build()).unwrap();

        let future = SystemTime::now() + std::time::Duration::from_secs(3600);
        assert_eq!(log.clear_old_logs(future).unwrap(), 1);
        assert_eq!(log.file_count(), 1);
        assert!(log.entries(1, 2).is_err());
        drop(log);

        let log = open(dir.path());
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.oracle().term_at_seq_num(2), 4);
    }
}
