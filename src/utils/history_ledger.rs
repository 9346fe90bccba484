use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;

/// One submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: PathBuf,
    /// Output of a forwarded command is never paired with the command, so this
    /// stays `None` for entries recorded by the router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Fixed-capacity ring of submitted commands. When full, the oldest entry is
/// dropped to make room.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl HistoryLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, command: impl Into<String>, cwd: PathBuf) -> &HistoryEntry {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            command: command.into(),
            timestamp: Utc::now(),
            cwd,
            exit_code: None,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Numbered listing in the style of a shell's `history` builtin.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{:>5}  {}\n", i + 1, entry.command))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_entry_when_full() {
        let mut ledger = HistoryLedger::new(3);
        for cmd in ["a", "b", "c", "d"] {
            ledger.record(cmd, PathBuf::from("/tmp"));
        }
        let commands: Vec<_> = ledger.entries().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec!["b", "c", "d"]);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn records_cwd_and_monotonic_timestamps() {
        let mut ledger = HistoryLedger::new(10);
        let start = Utc::now();
        ledger.record("ls", PathBuf::from("/a"));
        ledger.record("make", PathBuf::from("/b"));
        let entries = ledger.entries();
        assert_eq!(entries[0].cwd, PathBuf::from("/a"));
        assert_eq!(entries[1].cwd, PathBuf::from("/b"));
        assert!(entries[0].timestamp >= start);
        assert!(entries[1].timestamp >= entries[0].timestamp);
        assert!(entries.iter().all(|e| e.exit_code.is_none()));
    }

    #[test]
    fn render_numbers_entries_from_one() {
        let mut ledger = HistoryLedger::new(10);
        ledger.record("ls -la", PathBuf::from("/"));
        ledger.record("git status", PathBuf::from("/"));
        assert_eq!(ledger.render(), "    1  ls -la\n    2  git status\n");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut ledger = HistoryLedger::new(0);
        ledger.record("a", PathBuf::from("/"));
        ledger.record("b", PathBuf::from("/"));
        assert_eq!(ledger.capacity(), 1);
        assert_eq!(ledger.entries()[0].command, "b");
    }
}
