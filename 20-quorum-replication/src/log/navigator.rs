//! Sparse sequence-number → byte-offset index over one log file.
//!
//! The navigator remembers the address of every `max_entry_seek`-th entry that
//! is logged, plus any address it had to find by scanning. Lookups seek to the
//! nearest indexed entry at or below the target and walk forward frame by
//! frame. Seq 0 is always indexed and maps to the first entry address of the
//! file, so every lookup has a starting point.

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom};

use crate::codec;
use crate::error::{ReplicatorError, Result};
use crate::log::persistence::{BytePersistence, PersistenceReader};
use crate::settings::WAL_NAVIGATOR_DEFAULT_MAX_ENTRY_SEEK;

pub struct PersistenceNavigator {
    persistence: Box<dyn BytePersistence>,
    index: BTreeMap<u64, u64>,
    max_entry_seek: u64,
}

impl PersistenceNavigator {
    /// `first_entry_address` is where entries begin, past any file header.
    pub fn new(persistence: Box<dyn BytePersistence>, first_entry_address: u64) -> Self {
        Self {
            persistence,
            index: BTreeMap::from([(0, first_entry_address)]),
            max_entry_seek: WAL_NAVIGATOR_DEFAULT_MAX_ENTRY_SEEK,
        }
    }

    pub fn persistence(&self) -> &dyn BytePersistence {
        self.persistence.as_ref()
    }

    pub fn persistence_mut(&mut self) -> &mut dyn BytePersistence {
        self.persistence.as_mut()
    }

    pub fn set_max_entry_seek(&mut self, max_entry_seek: u64) -> Result<()> {
        if max_entry_seek < 1 {
            return Err(ReplicatorError::InvalidArgument(
                "max entry seek must be at least 1".into(),
            ));
        }
        self.max_entry_seek = max_entry_seek;
        Ok(())
    }

    /// Records that `seq_num` was written at `address`.
    pub fn notify_logging(&mut self, seq_num: u64, address: u64) {
        let last_indexed = self.index.keys().next_back().copied().unwrap_or(0);
        if seq_num >= last_indexed + self.max_entry_seek {
            self.index.insert(seq_num, address);
        }
    }

    /// Forgets every index point at or after `seq_num`.
    pub fn notify_truncation(&mut self, seq_num: u64) -> Result<()> {
        if seq_num == 0 {
            return Err(ReplicatorError::InvalidArgument(
                "cannot truncate at seq num 0".into(),
            ));
        }
        self.index.split_off(&seq_num);
        Ok(())
    }

    pub fn address_of_entry(&mut self, seq_num: u64) -> Result<u64> {
        let (&floor_seq_num, &floor_address) = self
            .index
            .range(..=seq_num)
            .next_back()
            .ok_or(ReplicatorError::EntryNotFound(seq_num))?;
        if floor_seq_num == seq_num {
            return Ok(floor_address);
        }

        let mut reader = self.persistence.reader()?;
        reader.seek(SeekFrom::Start(floor_address))?;
        loop {
            let address = reader.stream_position()?;
            match codec::skip_entry_and_return_seq_num(&mut reader)? {
                Some(found) if found == seq_num => {
                    self.index.insert(seq_num, address);
                    return Ok(address);
                }
                Some(found) if found > seq_num => return Err(ReplicatorError::EntryNotFound(seq_num)),
                Some(_) => {}
                None => return Err(ReplicatorError::EntryNotFound(seq_num)),
            }
        }
    }

    pub fn reader_at_seq_num(&mut self, seq_num: u64) -> Result<Box<dyn PersistenceReader>> {
        let address = self.address_of_entry(seq_num)?;
        let mut reader = self.persistence.reader()?;
        reader.seek(SeekFrom::Start(address))?;
        Ok(reader)
    }

    /// A reader positioned at the last entry of the file, or at the end of an
    /// empty file. The last entry is indexed as a side effect.
    pub fn reader_at_last_entry(&mut self) -> Result<Box<dyn PersistenceReader>> {
        let (_, &start) = self
            .index
            .iter()
            .next_back()
            .ok_or(ReplicatorError::EntryNotFound(0))?;

        let mut reader = self.persistence.reader()?;
        reader.seek(SeekFrom::Start(start))?;
        let mut last = None;
        loop {
            let address = reader.stream_position()?;
            match codec::skip_entry_and_return_seq_num(&mut reader)? {
                Some(seq_num) => last = Some((seq_num, address)),
                None => break,
            }
        }

        let position = match last {
            Some((seq_num, address)) => {
                self.index.insert(seq_num, address);
                address
            }
            None => start,
        };
        reader.seek(SeekFrom::Start(position))?;
        Ok(reader)
    }

    #[cfg(test)]
    fn indexed_seq_nums(&self) -> Vec<u64> {
        self.index.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{entries, LogEntry};
    use crate::log::persistence::MemoryPersistence;

    fn navigator_with(logged: &[LogEntry], max_entry_seek: u64) -> PersistenceNavigator {
        let mut navigator = PersistenceNavigator::new(Box::new(MemoryPersistence::new()), 0);
        navigator.set_max_entry_seek(max_entry_seek).unwrap();
        for entry in logged {
            let address = navigator.persistence().size().unwrap();
            let bytes = codec::frame_bytes(entry).unwrap();
            navigator.persistence_mut().append(&bytes).unwrap();
            navigator.notify_logging(entry.index, address);
        }
        navigator
    }

    #[test]
    fn indexes_sparsely_and_finds_every_entry() {
        let logged = entries().term(1).indexes(&[1, 2, 3, 4, 5, 6, 7]).build();
        let mut navigator = navigator_with(&logged, 3);
        assert_eq!(navigator.indexed_seq_nums(), vec![0, 3, 6]);

        for entry in &logged {
            let mut reader = navigator.reader_at_seq_num(entry.index).unwrap();
            assert_eq!(codec::decode_entry(&mut reader).unwrap().as_ref(), Some(entry));
        }
    }

    #[test]
    fn missing_entry_is_reported() {
        let mut navigator = navigator_with(&entries().term(1).indexes(&[1, 2]).build(), 256);
        assert!(matches!(
            navigator.address_of_entry(3),
            Err(ReplicatorError::EntryNotFound(3))
        ));
    }

    #[test]
    fn truncation_drops_later_index_points_and_keeps_zero() {
        let logged = entries().term(1).indexes(&[1, 2, 3, 4, 5]).build();
        let mut navigator = navigator_with(&logged, 1);
        navigator.notify_truncation(3).unwrap();
        assert_eq!(navigator.indexed_seq_nums(), vec![0, 1, 2]);

        navigator.notify_truncation(1).unwrap();
        assert_eq!(navigator.indexed_seq_nums(), vec![0]);

        assert!(navigator.notify_truncation(0).is_err());
    }

    #[test]
    fn reader_at_last_entry_reads_the_last_entry() {
        let logged = entries().term(2).indexes(&[1, 2, 3, 4]).build();
        let mut navigator = navigator_with(&logged, 256);
        let mut reader = navigator.reader_at_last_entry().unwrap();
        assert_eq!(codec::decode_entry(&mut reader).unwrap().as_ref(), logged.last());
        assert_eq!(navigator.indexed_seq_nums(), vec![0, 4]);
    }

    #[test]
    fn rejects_zero_max_entry_seek() {
        let mut navigator = PersistenceNavigator::new(Box::new(MemoryPersistence::new()), 0);
        assert!(navigator.set_max_entry_seek(0).is_err());
    }
}
