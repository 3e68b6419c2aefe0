//! C3 — the replicated log.
//!
//! Grounded on `original_source/Raft/raft_nodes.py::Log` and
//! `original_source/Paxos/paxos_nodes.py::Log`: an ordered, append-only
//! vector of entries keyed by `(term, index)`.

use serde::{Deserialize, Serialize};

use crate::message::{LogIndex, Term};

/// One entry in the replicated log. Identity is `(term, index)`; see
/// spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: u64,
    pub timestamp_millis: i64,
    pub payload: String,
}

/// Append-only sequence of entries, the sole source of truth for apply
/// ordering (spec.md §4.4). Followers may truncate a conflicting suffix
/// (Raft only); Paxos only ever appends on learn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new() }
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Raft-only: drops every entry from `index` (inclusive) onward, used
    /// on a consistency-check failure during `AppendEntries`.
    pub fn truncate_from(&mut self, index: u64) {
        self.entries.truncate(index as usize);
    }

    /// `-1` when the log is empty, matching the original's sentinel.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex - 1
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    pub fn iterate(&self, start_index: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().skip(start_index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, index: u64) -> LogEntry {
        LogEntry { term, index, timestamp_millis: 0, payload: format!("op-{}", index) }
    }

    #[test]
    fn empty_log_has_sentinel_last_index() {
        let log = Log::new();
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_and_term_at() {
        let mut log = Log::new();
        log.append(entry(1, 0));
        log.append(entry(1, 1));
        log.append(entry(2, 2));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(0), Some(1));
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.term_at(3), None);
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut log = Log::new();
        log.append(entry(1, 0));
        log.append(entry(1, 1));
        log.append(entry(2, 2));
        log.truncate_from(1);
        assert_eq!(log.last_index(), 0);
    }

    #[test]
    fn iterate_from_start_index() {
        let mut log = Log::new();
        for i in 0..5 {
            log.append(entry(1, i));
        }
        let collected: Vec<_> = log.iterate(3).map(|e| e.index).collect();
        assert_eq!(collected, vec![3, 4]);
    }
}
