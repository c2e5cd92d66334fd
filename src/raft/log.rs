use super::ReplicaID;

use serde_derive::{Deserialize, Serialize};

/// A log index. 0-based; -1 means "no entry" (e.g. an empty commit index or
/// the base of an empty log).
pub type Index = i64;

/// A leader term. Starts at 0 before any election; the first leader has
/// term 1.
pub type Term = u64;

/// A log entry: one client put, tagged with the term in which a leader
/// appended it. The originating client and message id ride along so the
/// leader that commits the entry can acknowledge the right request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub key: String,
    pub value: String,
    pub client: ReplicaID,
    pub mid: String,
}

/// The replicated log: an in-memory ordered sequence of client writes. The
/// leader appends entries at the end and replicates them to followers, who
/// splice them into their own logs, truncating any conflicting uncommitted
/// suffix. An index replicated on a quorum becomes committed and is applied
/// to the state machine.
///
/// Invariants:
///
/// * Entry terms never decrease along the log.
/// * Entries at or below the commit index are never changed or removed.
/// * Two logs with the same index and term agree on all prior entries.
#[derive(Debug)]
pub struct Log {
    entries: Vec<Entry>,
    commit_index: Index,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Creates an empty log with nothing committed.
    pub fn new() -> Self {
        Self { entries: Vec::new(), commit_index: -1 }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns true if the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the index of the last entry, or -1 if empty.
    pub fn last_index(&self) -> Index {
        self.len() - 1
    }

    /// Returns the term of the last entry, or 0 if empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Returns the index of the last committed entry, or -1.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Fetches the entry at an index, if it exists.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Returns the term of the entry at an index, or 0 if there is none.
    pub fn term_at(&self, index: Index) -> Term {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// Checks whether this log agrees with a leader's at the given base: a
    /// base of -1 is the empty prefix and always agrees, otherwise the entry
    /// must exist with the expected term.
    pub fn matches_at(&self, prev_index: Index, prev_term: Term) -> bool {
        prev_index == -1 || self.get(prev_index).map(|e| e.term == prev_term).unwrap_or(false)
    }

    /// Appends an entry at the end of the log, returning its index. Only the
    /// leader appends; followers splice.
    pub fn append(&mut self, entry: Entry) -> Index {
        assert!(entry.term > 0, "can't append entry with term 0");
        assert!(entry.term >= self.last_term(), "entry term regression");
        self.entries.push(entry);
        self.last_index()
    }

    /// Splices replicated entries in after the given base index, which the
    /// caller must already have verified via matches_at(). Entries already
    /// present with a matching term are skipped; the first index holding a
    /// different term has its suffix truncated and replaced. Returns the
    /// highest index this call proved identical to the sender's log.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<Entry>) -> Index {
        let confirmed = prev_index + entries.len() as Index;
        for (i, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + i as Index;
            assert!(index <= self.len(), "spliced entries must touch the existing log");
            if let Some(existing) = self.get(index) {
                if existing.term == entry.term {
                    // Same index and term implies the same entry.
                    debug_assert_eq!(existing.mid, entry.mid, "entry mismatch at {index}");
                    continue;
                }
                self.truncate_from(index);
            }
            self.entries.push(entry);
        }
        confirmed
    }

    /// Erases all entries at and beyond the given index. Committed entries
    /// are immutable; erasing one is a fatal protocol violation.
    pub fn truncate_from(&mut self, index: Index) {
        assert!(index > self.commit_index, "can't truncate committed entries");
        self.entries.truncate(index.max(0) as usize);
    }

    /// Marks entries up to and including the given index as committed. The
    /// index must exist, and the commit index never regresses.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index <= self.last_index(), "commit index {index} beyond last entry");
        assert!(
            index >= self.commit_index,
            "commit index regression {} → {index}",
            self.commit_index
        );
        self.commit_index = index;
        index
    }

    /// Returns up to max entries starting at the given index, cloned for
    /// transmission.
    pub fn entries_from(&self, index: Index, max: usize) -> Vec<Entry> {
        let start = index.clamp(0, self.len()) as usize;
        self.entries[start..].iter().take(max).cloned().collect()
    }

    /// Returns the first index holding the given term, if any. Used to
    /// answer conflict hints.
    pub fn first_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries.iter().position(|e| e.term == term).map(|i| i as Index)
    }

    /// Returns the last index holding the given term, if any. Used to
    /// process conflict hints on the leader.
    pub fn last_index_of_term(&self, term: Term) -> Option<Index> {
        self.entries.iter().rposition(|e| e.term == term).map(|i| i as Index)
    }

    /// Returns the highest uncommitted index that writes the given key, if
    /// any. Reads of such keys must wait for the write to commit.
    pub fn uncommitted_index_of_key(&self, key: &str) -> Option<Index> {
        let start = (self.commit_index + 1) as usize;
        self.entries[start..]
            .iter()
            .rposition(|e| e.key == key)
            .map(|i| start as Index + i as Index)
    }
}
