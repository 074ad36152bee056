//! Replicated log storage with snapshot-aware indexing. Adapted from the
//! teacher's `networking::membership::raft::log` module.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::SystemTime;

pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Vec<u8>,
    pub timestamp: SystemTime,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    snapshot: Option<Snapshot>,
    first_index: LogIndex,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            snapshot: None,
            first_index: 1,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .or_else(|| self.snapshot.as_ref().map(|s| s.last_included_index))
            .unwrap_or(0)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .or_else(|| self.snapshot.as_ref().map(|s| s.last_included_term))
            .unwrap_or(0)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.last_included_index {
                return Some(snapshot.last_included_term);
            }
        }
        self.get(index).map(|e| e.term)
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(AgentError::InvalidLogEntry(format!(
                "expected index {}, got {}",
                self.last_index() + 1,
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Truncate any entries from `from_index` onward, used when a follower
    /// discovers a conflicting term during AppendEntries.
    pub fn truncate_from(&mut self, from_index: LogIndex) {
        self.entries.retain(|e| e.index < from_index);
    }

    pub fn entries_from(&self, index: LogIndex) -> Vec<LogEntry> {
        if index < self.first_index {
            return Vec::new();
        }
        let offset = (index - self.first_index) as usize;
        self.entries.iter().skip(offset).cloned().collect()
    }

    /// Compact the log below `up_to_index`, storing a snapshot covering it
    /// (spec §4.2: "the log may be truncated below it").
    pub fn compact(&mut self, up_to_index: LogIndex, data: Vec<u8>) -> Result<()> {
        let term = self
            .term_at(up_to_index)
            .ok_or_else(|| AgentError::InvalidLogEntry("compact: unknown index".to_string()))?;
        self.entries.retain(|e| e.index > up_to_index);
        self.snapshot = Some(Snapshot {
            last_included_index: up_to_index,
            last_included_term: term,
            data,
        });
        self.first_index = up_to_index + 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_rejects_out_of_order_index() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        let err = log.append(LogEntry::new(1, 3, vec![]));
        assert!(err.is_err());
    }

    #[test]
    fn compact_truncates_below_index() {
        let mut log = RaftLog::new();
        for i in 1..=5u64 {
            log.append(LogEntry::new(1, i, vec![])).unwrap();
        }
        log.compact(3, b"snap".to_vec()).unwrap();
        assert!(log.get(3).is_none());
        assert!(log.get(4).is_some());
        assert_eq!(log.term_at(3), Some(1));
    }
}
