//! Abstract log storage capability the consensus core appends through, plus
//! an in-memory implementation.

use std::collections::BTreeMap;

use crate::palf::{LogEntry, LogInfo, Lsn, ProposalId};
use crate::utils::PalfError;

use get_size::GetSize;

/// Dense, append-only log storage. Entries occupy consecutive LSNs right after
/// the base info, which describes the (virtual, committed) entry preceding the
/// first stored one.
pub trait LogStorage: Send + Sync {
    /// Info of the virtual entry right before the first stored entry.
    fn base_info(&self) -> LogInfo;

    /// Info of the last entry, or the base info if nothing is stored.
    fn last_log_info(&self) -> LogInfo;

    /// Exclusive end LSN, i.e., the LSN the next appended entry takes.
    fn end_lsn(&self) -> Lsn {
        self.last_log_info().lsn + 1
    }

    /// Info of the entry at `lsn`, including the base info itself.
    fn log_info_at(&self, lsn: Lsn) -> Option<LogInfo>;

    /// Copy of the stored entry at `lsn`.
    fn get_entry(&self, lsn: Lsn) -> Option<LogEntry>;

    /// Appends an entry; its LSN must equal `end_lsn()`.
    fn append(&mut self, entry: LogEntry) -> Result<(), PalfError>;

    /// Drops every stored entry at or after `from`.
    fn truncate(&mut self, from: Lsn) -> Result<(), PalfError>;

    /// Reads entries starting at `start`, bounded by a total byte size and an
    /// entry count. At least one entry is returned if any exists at `start`.
    fn read(&self, start: Lsn, size_limit: usize, count_limit: usize)
        -> Vec<LogEntry>;

    /// Re-stamps every entry in `[from, to)` with the given proposal ID,
    /// returning how many were touched. Nothing changes on error.
    fn rewrite_proposal_id(
        &mut self,
        from: Lsn,
        to: Lsn,
        proposal_id: ProposalId,
    ) -> Result<usize, PalfError>;

    /// Discards everything and restarts the log after the given base info.
    fn reset_base(&mut self, base: LogInfo) -> Result<(), PalfError>;
}

/// In-memory log storage backed by an ordered map.
#[derive(Debug, Clone)]
pub struct MemLogStorage {
    /// Virtual committed entry preceding the first stored one.
    base: LogInfo,

    /// Stored entries keyed by LSN.
    entries: BTreeMap<Lsn, LogEntry>,
}

impl MemLogStorage {
    /// Creates an empty storage starting from the genesis base.
    pub fn new() -> Self {
        Self::with_base(LogInfo::genesis())
    }

    /// Creates an empty storage starting from the given base.
    pub fn with_base(base: LogInfo) -> Self {
        MemLogStorage {
            base,
            entries: BTreeMap::new(),
        }
    }
}

impl Default for MemLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemLogStorage {
    fn base_info(&self) -> LogInfo {
        self.base
    }

    fn last_log_info(&self) -> LogInfo {
        self.entries
            .values()
            .next_back()
            .map_or(self.base, |e| e.log_info())
    }

    fn log_info_at(&self, lsn: Lsn) -> Option<LogInfo> {
        if lsn == self.base.lsn {
            Some(self.base)
        } else {
            self.entries.get(&lsn).map(|e| e.log_info())
        }
    }

    fn get_entry(&self, lsn: Lsn) -> Option<LogEntry> {
        self.entries.get(&lsn).cloned()
    }

    fn append(&mut self, entry: LogEntry) -> Result<(), PalfError> {
        let end_lsn = self.end_lsn();
        if entry.lsn != end_lsn {
            return logged_err!(
                "append lsn {} does not match storage end {}",
                entry.lsn,
                end_lsn
            );
        }
        self.entries.insert(entry.lsn, entry);
        Ok(())
    }

    fn truncate(&mut self, from: Lsn) -> Result<(), PalfError> {
        if from <= self.base.lsn {
            return logged_err!(
                "truncate lsn {} at or before base {}",
                from,
                self.base.lsn
            );
        }
        self.entries.split_off(&from);
        Ok(())
    }

    fn read(
        &self,
        start: Lsn,
        size_limit: usize,
        count_limit: usize,
    ) -> Vec<LogEntry> {
        let mut read = Vec::new();
        let mut size = 0;
        for entry in self.entries.range(start..).map(|(_, e)| e) {
            let entry_size = entry.get_size();
            if read.len() >= count_limit
                || (!read.is_empty() && size + entry_size > size_limit)
            {
                break;
            }
            size += entry_size;
            read.push(entry.clone());
        }
        read
    }

    fn rewrite_proposal_id(
        &mut self,
        from: Lsn,
        to: Lsn,
        proposal_id: ProposalId,
    ) -> Result<usize, PalfError> {
        if from >= to {
            return Ok(0);
        }
        if let Some(entry) = self
            .entries
            .range(from..to)
            .map(|(_, e)| e)
            .find(|e| e.proposal_id > proposal_id)
        {
            return logged_err!(
                "rewrite lsn {} pid {} down to {}",
                entry.lsn,
                entry.proposal_id,
                proposal_id
            );
        }
        let mut touched = 0;
        for entry in self.entries.range_mut(from..to).map(|(_, e)| e) {
            entry.proposal_id = proposal_id;
            touched += 1;
        }
        Ok(touched)
    }

    fn reset_base(&mut self, base: LogInfo) -> Result<(), PalfError> {
        if !base.is_valid() || base.lsn < self.base.lsn {
            return logged_err!(
                "reset base to {:?} behind current {:?}",
                base,
                self.base
            );
        }
        self.base = base;
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::palf::ConfigVersion;

    fn entry(lsn: Lsn, pid: ProposalId, len: usize) -> LogEntry {
        LogEntry {
            lsn,
            proposal_id: pid,
            config_version: ConfigVersion::new(1, 1),
            data: vec![7; len],
        }
    }

    #[test]
    fn append_and_tail() -> Result<(), PalfError> {
        let mut storage = MemLogStorage::new();
        assert_eq!(storage.last_log_info(), LogInfo::genesis());
        assert_eq!(storage.end_lsn(), 1);
        storage.append(entry(1, 1, 4))?;
        storage.append(entry(2, 1, 4))?;
        assert!(storage.append(entry(4, 1, 4)).is_err());
        assert_eq!(storage.last_log_info(), LogInfo::new(2, 1));
        assert_eq!(storage.log_info_at(0), Some(LogInfo::genesis()));
        assert_eq!(storage.log_info_at(3), None);
        Ok(())
    }

    #[test]
    fn truncate_and_rewrite() -> Result<(), PalfError> {
        let mut storage = MemLogStorage::with_base(LogInfo::new(10, 2));
        for lsn in 11..=15 {
            storage.append(entry(lsn, 2, 1))?;
        }
        storage.truncate(13)?;
        assert_eq!(storage.end_lsn(), 13);
        assert!(storage.truncate(10).is_err());
        assert_eq!(storage.rewrite_proposal_id(12, 13, 4)?, 1);
        assert_eq!(storage.log_info_at(12), Some(LogInfo::new(12, 4)));
        assert!(storage.rewrite_proposal_id(11, 13, 3).is_err());
        assert_eq!(storage.log_info_at(11), Some(LogInfo::new(11, 2)));
        assert_eq!(storage.rewrite_proposal_id(11, 12, 3)?, 1);
        assert_eq!(storage.log_info_at(11), Some(LogInfo::new(11, 3)));
        assert_eq!(storage.rewrite_proposal_id(12, 12, 9)?, 0);
        Ok(())
    }

    #[test]
    fn read_bounded() -> Result<(), PalfError> {
        let mut storage = MemLogStorage::new();
        for lsn in 1..=10 {
            storage.append(entry(lsn, 1, 100))?;
        }
        assert_eq!(storage.read(3, usize::MAX, 4).len(), 4);
        assert_eq!(storage.read(9, usize::MAX, 4).len(), 2);
        // size limit smaller than one entry still yields progress
        assert_eq!(storage.read(1, 1, 10).len(), 1);
        let one = entry(1, 1, 100).get_size();
        assert_eq!(storage.read(1, one * 3, 10).len(), 3);
        Ok(())
    }

    #[test]
    fn reset_base_discards() -> Result<(), PalfError> {
        let mut storage = MemLogStorage::new();
        storage.append(entry(1, 1, 1))?;
        storage.reset_base(LogInfo::new(50, 3))?;
        assert_eq!(storage.last_log_info(), LogInfo::new(50, 3));
        assert_eq!(storage.end_lsn(), 51);
        assert!(storage.reset_base(LogInfo::new(20, 3)).is_err());
        Ok(())
    }
}
