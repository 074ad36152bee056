//! AppendEntries / InstallSnapshot RPCs and leader-side replication state.
//! Adapted from the teacher's `networking::membership::raft::replication`
//! module, extended with the no-op-on-leadership rule from spec §4.2.

use super::log::{LogEntry, LogIndex, RaftLog, Snapshot, Term};
use crate::common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Fast log-rollback hints (teacher's `replication.rs`): the follower's
    /// conflicting term and the first index at which that term appears.
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Leader-only per-follower replication cursors (`nextIndex`/`matchIndex` in
/// Raft parlance).
#[derive(Debug, Default)]
pub struct ReplicationTracker {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
}

impl ReplicationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize_for_term(&mut self, members: &[NodeId], leader_last_index: LogIndex) {
        self.next_index.clear();
        self.match_index.clear();
        for member in members {
            self.next_index.insert(member.clone(), leader_last_index + 1);
            self.match_index.insert(member.clone(), 0);
        }
    }

    pub fn next_index(&self, node: &NodeId) -> LogIndex {
        *self.next_index.get(node).unwrap_or(&1)
    }

    pub fn match_index(&self, node: &NodeId) -> LogIndex {
        *self.match_index.get(node).unwrap_or(&0)
    }

    pub fn record_success(&mut self, node: &NodeId, match_index: LogIndex) {
        self.match_index.insert(node.clone(), match_index);
        self.next_index.insert(node.clone(), match_index + 1);
    }

    /// Apply a conflict hint from a rejected AppendEntries, skipping back to
    /// the start of the conflicting term when the follower reports one
    /// (fast rollback), otherwise decrementing by one.
    pub fn record_failure(&mut self, node: &NodeId, response: &AppendEntriesResponse, log: &RaftLog) {
        let fallback = match (response.conflict_term, response.conflict_index) {
            (Some(term), Some(_)) => {
                let mut idx = log.last_index();
                while idx > 0 && log.term_at(idx).map(|t| t > term).unwrap_or(false) {
                    idx -= 1;
                }
                idx.max(1)
            }
            (None, Some(index)) => index,
            _ => self.next_index(node).saturating_sub(1).max(1),
        };
        self.next_index.insert(node.clone(), fallback);
    }

    /// Highest index replicated to a strict majority of `members` (leader
    /// included, whose match index is implicitly its own last log index).
    pub fn majority_match_index(&self, members: &[NodeId], leader_last_index: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = members.iter().map(|m| self.match_index(m)).collect();
        indices.push(leader_last_index);
        indices.sort_unstable();
        let majority_pos = indices.len() / 2;
        indices[majority_pos]
    }
}

/// Build the AppendEntries request a leader sends to a given follower, given
/// its replication cursor.
pub fn build_append_entries(
    leader_id: &NodeId,
    term: Term,
    log: &RaftLog,
    next_index: LogIndex,
    leader_commit: LogIndex,
) -> AppendEntriesRequest {
    let prev_log_index = next_index.saturating_sub(1);
    let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
    AppendEntriesRequest {
        term,
        leader_id: leader_id.clone(),
        prev_log_index,
        prev_log_term,
        entries: log.entries_from(next_index),
        leader_commit,
    }
}

/// Validate and apply an incoming AppendEntries request against a follower's
/// log, returning the response to send back.
pub fn apply_append_entries(log: &mut RaftLog, current_term: Term, request: &AppendEntriesRequest) -> AppendEntriesResponse {
    if request.term < current_term {
        return AppendEntriesResponse {
            term: current_term,
            success: false,
            conflict_index: None,
            conflict_term: None,
        };
    }

    if request.prev_log_index > 0 {
        match log.term_at(request.prev_log_index) {
            None => {
                return AppendEntriesResponse {
                    term: request.term,
                    success: false,
                    conflict_index: Some(log.last_index() + 1),
                    conflict_term: None,
                };
            }
            Some(term) if term != request.prev_log_term => {
                let mut first_of_term = request.prev_log_index;
                while first_of_term > 1 && log.term_at(first_of_term - 1) == Some(term) {
                    first_of_term -= 1;
                }
                return AppendEntriesResponse {
                    term: request.term,
                    success: false,
                    conflict_index: Some(first_of_term),
                    conflict_term: Some(term),
                };
            }
            _ => {}
        }
    }

    for entry in &request.entries {
        if let Some(existing_term) = log.term_at(entry.index) {
            if existing_term != entry.term {
                log.truncate_from(entry.index);
            } else {
                continue;
            }
        }
        // Safe to append/overwrite because any conflicting suffix above was
        // just truncated.
        let _ = log.append(entry.clone());
    }

    AppendEntriesResponse {
        term: request.term,
        success: true,
        conflict_index: None,
        conflict_term: None,
    }
}

pub fn build_install_snapshot(leader_id: &NodeId, term: Term, snapshot: &Snapshot) -> InstallSnapshotRequest {
    InstallSnapshotRequest {
        term,
        leader_id: leader_id.clone(),
        last_included_index: snapshot.last_included_index,
        last_included_term: snapshot.last_included_term,
        data: snapshot.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::log::LogEntry;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[test]
    fn apply_append_entries_detects_term_conflict() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(1, 2, vec![])).unwrap();

        let request = AppendEntriesRequest {
            term: 2,
            leader_id: node("leader"),
            prev_log_index: 2,
            prev_log_term: 2, // follower has term 1 at index 2: conflict
            entries: vec![],
            leader_commit: 0,
        };
        let response = apply_append_entries(&mut log, 1, &request);
        assert!(!response.success);
        assert_eq!(response.conflict_term, Some(1));
    }

    #[test]
    fn apply_append_entries_appends_new_entries() {
        let mut log = RaftLog::new();
        let request = AppendEntriesRequest {
            term: 1,
            leader_id: node("leader"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, vec![1, 2, 3])],
            leader_commit: 0,
        };
        let response = apply_append_entries(&mut log, 1, &request);
        assert!(response.success);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn majority_match_index_is_the_median() {
        let mut tracker = ReplicationTracker::new();
        let members = vec![node("a"), node("b")];
        tracker.initialize_for_term(&members, 0);
        tracker.record_success(&members[0], 5);
        tracker.record_success(&members[1], 3);
        // leader_last_index=5, matches=[5,3] -> sorted [3,5,5], median idx 1 = 5
        assert_eq!(tracker.majority_match_index(&members, 5), 5);
    }
}
