// Replicated Log
//
// Append-only ordered sequence of entries with an embedded snapshot prefix.
// All indices at or below `snapshot_index` are represented solely by the
// snapshot; live entries occupy `snapshot_index + 1 ..= last_index`.
//
// Entries proposed locally carry a one-shot completion that fires exactly
// once: with the entry's index when it commits, or with `None` when the
// entry is discarded. Completions are taken out of the entry before firing
// and are never serialized.

use super::{LogIndex, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// One-shot proposal completion: `Some(index)` on commit, `None` on discard
pub type Completion = oneshot::Sender<Option<LogIndex>>;

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Leader barrier entry; not fed to the state machine
    Noop,

    /// Opaque state machine command
    Command(Bytes),
}

/// Entry in the replicated log, addressed by a 1-based index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was created by a leader
    pub term: Term,

    /// Command or no-op
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn noop(term: Term) -> Self {
        Self {
            term,
            payload: EntryPayload::Noop,
        }
    }

    pub fn command(term: Term, data: Bytes) -> Self {
        Self {
            term,
            payload: EntryPayload::Command(data),
        }
    }
}

/// Compacted log prefix: state machine image up to a specific (index, term)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last entry covered by the snapshot
    pub index: LogIndex,

    /// Term of the entry at `index`
    pub term: Term,

    /// Opaque state machine image
    pub data: Bytes,
}

struct StoredEntry {
    entry: LogEntry,
    completion: Option<Completion>,
}

impl StoredEntry {
    fn discard(mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(None);
        }
    }
}

/// The replicated log: live entries plus the snapshot prefix
pub struct RaftLog {
    entries: VecDeque<StoredEntry>,
    snapshot: Snapshot,
}

impl RaftLog {
    /// Build a log from a snapshot and the entries beyond it
    pub fn restore(snapshot: Snapshot, entries: Vec<LogEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| StoredEntry {
                    entry,
                    completion: None,
                })
                .collect(),
            snapshot,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot.index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot.term
    }

    /// Index of the most recently appended entry
    pub fn last_index(&self) -> LogIndex {
        self.snapshot.index + self.entries.len() as u64
    }

    /// Term at `last_index`, falling back to the snapshot term when no
    /// entries live beyond the snapshot
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|stored| stored.entry.term)
            .unwrap_or(self.snapshot.term)
    }

    /// Entry at `index`; defined for `snapshot_index < index <= last_index`
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot.index {
            return None;
        }
        self.entries
            .get((index - self.snapshot.index - 1) as usize)
            .map(|stored| &stored.entry)
    }

    /// Term at `index`, answering from the snapshot boundary as well
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot.index {
            return Some(self.snapshot.term);
        }
        self.entry(index).map(|entry| entry.term)
    }

    /// Append an entry, optionally binding a proposal completion
    pub fn append(&mut self, entry: LogEntry, completion: Option<Completion>) -> LogIndex {
        self.entries.push_back(StoredEntry { entry, completion });
        self.last_index()
    }

    /// Discard `from ..= last_index`. Entries removed with a completion
    /// still bound complete negatively.
    pub fn truncate(&mut self, from: LogIndex) {
        if from <= self.snapshot.index {
            return;
        }
        let keep = (from - self.snapshot.index - 1) as usize;
        if keep >= self.entries.len() {
            return;
        }
        for stored in self.entries.drain(keep..).collect::<Vec<_>>() {
            stored.discard();
        }
    }

    /// Replace the snapshot prefix, discarding every entry at or below
    /// `index`. A snapshot older than the current one is ignored.
    pub fn set_snapshot(&mut self, index: LogIndex, term: Term, data: Bytes) {
        if index < self.snapshot.index {
            return;
        }
        let drop_n = (index - self.snapshot.index).min(self.entries.len() as u64) as usize;
        for stored in self.entries.drain(..drop_n).collect::<Vec<_>>() {
            stored.discard();
        }
        self.snapshot = Snapshot { index, term, data };
    }

    /// Clone up to `max` wire entries starting at `from`
    pub fn entries_from(&self, from: LogIndex, max: u64) -> Vec<LogEntry> {
        if from <= self.snapshot.index {
            return Vec::new();
        }
        let start = (from - self.snapshot.index - 1) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(max.min(usize::MAX as u64) as usize)
            .map(|stored| stored.entry.clone())
            .collect()
    }

    /// Take the completion bound at `index`, if any; at most once
    pub(crate) fn take_completion(&mut self, index: LogIndex) -> Option<Completion> {
        if index <= self.snapshot.index {
            return None;
        }
        self.entries
            .get_mut((index - self.snapshot.index - 1) as usize)
            .and_then(|stored| stored.completion.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> RaftLog {
        RaftLog::restore(
            Snapshot {
                index: 0,
                term: 0,
                data: Bytes::new(),
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_empty_log() {
        let log = seeded();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.entry(1).is_none());
    }

    #[test]
    fn test_append_and_lookup() {
        let mut log = seeded();
        assert_eq!(log.append(LogEntry::noop(1), None), 1);
        assert_eq!(
            log.append(LogEntry::command(2, Bytes::from_static(b"x")), None),
            2
        );

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.entry(2).unwrap().term, 2);
        assert!(log.entry(3).is_none());
    }

    #[test]
    fn test_truncate_completes_negatively() {
        let mut log = seeded();
        log.append(LogEntry::noop(1), None);
        let (tx, mut rx) = oneshot::channel();
        log.append(LogEntry::command(1, Bytes::from_static(b"x")), Some(tx));

        log.truncate(2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_truncate_below_snapshot_is_noop() {
        let mut log = seeded();
        log.set_snapshot(5, 2, Bytes::new());
        log.append(LogEntry::noop(3), None);
        log.truncate(4);
        assert_eq!(log.last_index(), 6);
    }

    #[test]
    fn test_set_snapshot_discards_prefix() {
        let mut log = seeded();
        for _ in 0..4 {
            log.append(LogEntry::noop(1), None);
        }
        log.set_snapshot(3, 1, Bytes::from_static(b"img"));

        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.snapshot_term(), 1);
        assert_eq!(log.last_index(), 4);
        assert!(log.entry(3).is_none());
        assert_eq!(log.term_at(3), Some(1));
        assert_eq!(log.entry(4).unwrap().term, 1);
    }

    #[test]
    fn test_set_snapshot_beyond_last_clears_log() {
        let mut log = seeded();
        log.append(LogEntry::noop(1), None);
        log.set_snapshot(10, 4, Bytes::new());

        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let mut log = seeded();
        log.set_snapshot(5, 2, Bytes::from_static(b"new"));
        log.set_snapshot(3, 1, Bytes::from_static(b"old"));
        assert_eq!(log.snapshot_index(), 5);
    }

    #[test]
    fn test_entries_from_respects_batch_cap() {
        let mut log = seeded();
        for _ in 0..5 {
            log.append(LogEntry::noop(1), None);
        }
        let batch = log.entries_from(2, 2);
        assert_eq!(batch.len(), 2);
        let rest = log.entries_from(6, 100);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_completion_taken_once() {
        let mut log = seeded();
        let (tx, _rx) = oneshot::channel();
        log.append(LogEntry::command(1, Bytes::from_static(b"x")), Some(tx));

        assert!(log.take_completion(1).is_some());
        assert!(log.take_completion(1).is_none());
    }
}
