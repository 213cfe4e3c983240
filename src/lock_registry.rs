//! Process-wide table of active write sessions (spec.md §3, §4.3).
//!
//! One [`std::sync::Mutex`] guards the whole bounded slot table, the
//! same way a single `flock`-guarded lock file serializes one resource's
//! mutations, generalized here from "one lock per process" to "one
//! bounded table of per-sentence locks per process". Every registry
//! operation holds the
//! mutex for its whole body, which is what gives spec.md §5's "Concurrent
//! LOCKs on the same sentence are linearized: exactly one succeeds" for
//! free: the check-then-insert in [`LockRegistry::try_acquire`] is one
//! atomic critical section.
//!
//! The **identity rule** (spec.md §4.3): once created, a [`LockEntry`] is
//! bound to a sentence by its `original_text`, not by
//! `sentence_index_at_lock`. The index is only ever used as an admission
//! hint when a new `LOCK` arrives; re-binding at `UNLOCK` always goes
//! through content matching (`Document::find_sentence_by_text`).

use std::sync::Mutex;

use crate::document::Document;
use crate::error::SsError;

/// `(file, user)`-addressed record of an active write session. `session_doc`
/// is the session-private sentence list captured at `LOCK` time (spec.md
/// §3's "list_head") — single-owner, moved into the registry on `add` and
/// moved back out to the caller on removal, never shared by pointer
/// (spec.md §9, "avoid raw back-pointers").
pub struct LockEntry {
    pub filename: String,
    pub username: String,
    pub sentence_index_at_lock: usize,
    pub sentence_id: u64,
    pub node_identity: u64,
    pub sentence_count_at_lock: usize,
    pub original_text: String,
    pub undo_saved: bool,
    pub session_doc: Document,
}

/// A clonable, `Document`-free view of a [`LockEntry`], for callers that
/// only need to inspect registry state (`find`).
#[derive(Debug, Clone)]
pub struct LockSummary {
    pub filename: String,
    pub username: String,
    pub sentence_index_at_lock: usize,
    pub sentence_id: u64,
    pub node_identity: u64,
    pub sentence_count_at_lock: usize,
    pub original_text: String,
    pub undo_saved: bool,
}

impl From<&LockEntry> for LockSummary {
    fn from(e: &LockEntry) -> Self {
        LockSummary {
            filename: e.filename.clone(),
            username: e.username.clone(),
            sentence_index_at_lock: e.sentence_index_at_lock,
            sentence_id: e.sentence_id,
            node_identity: e.node_identity,
            sentence_count_at_lock: e.sentence_count_at_lock,
            original_text: e.original_text.clone(),
            undo_saved: e.undo_saved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Owned,
    OwnedByOther,
    NotLocked,
}

pub const DEFAULT_MAX_LOCKS: usize = 256;

pub struct LockRegistry {
    slots: Mutex<Vec<Option<LockEntry>>>,
}

impl LockRegistry {
    pub fn new(max_locks: usize) -> Self {
        let mut slots = Vec::with_capacity(max_locks);
        slots.resize_with(max_locks, || None);
        LockRegistry {
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }

    pub fn find(&self, filename: &str, username: &str) -> Option<LockSummary> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|e| e.filename == filename && e.username == username)
            .map(LockSummary::from)
    }

    /// Index-based contention check, spec.md §4.3.
    pub fn check(&self, filename: &str, idx: usize, username: &str) -> CheckResult {
        let slots = self.slots.lock().unwrap();
        for e in slots.iter().flatten() {
            if e.filename == filename && e.sentence_index_at_lock == idx {
                return if e.username == username {
                    CheckResult::Owned
                } else {
                    CheckResult::OwnedByOther
                };
            }
        }
        CheckResult::NotLocked
    }

    /// Content-based contention check, spec.md §4.3.
    pub fn check_by_content(&self, filename: &str, original_text: &str, username: &str) -> CheckResult {
        let slots = self.slots.lock().unwrap();
        for e in slots.iter().flatten() {
            if e.filename == filename && e.original_text == original_text {
                return if e.username == username {
                    CheckResult::Owned
                } else {
                    CheckResult::OwnedByOther
                };
            }
        }
        CheckResult::NotLocked
    }

    /// Atomically checks for contention on `(filename, idx)` and, if
    /// none, admits a new entry. Idempotent for the same user re-locking
    /// the same index. This single critical section realizes spec.md
    /// §5's "exactly one succeeds" linearization.
    #[allow(clippy::too_many_arguments)]
    pub fn try_acquire(
        &self,
        filename: &str,
        username: &str,
        idx: usize,
        sentence_id: u64,
        node_identity: u64,
        sentence_count: usize,
        original_text: String,
        session_doc: Document,
    ) -> Result<(), SsError> {
        let mut slots = self.slots.lock().unwrap();

        for e in slots.iter().flatten() {
            if e.filename == filename && e.sentence_index_at_lock == idx {
                return if e.username == username {
                    Ok(())
                } else {
                    Err(SsError::SentenceLocked)
                };
            }
        }

        let free = slots.iter().position(|s| s.is_none());
        match free {
            Some(i) => {
                slots[i] = Some(LockEntry {
                    filename: filename.to_string(),
                    username: username.to_string(),
                    sentence_index_at_lock: idx,
                    sentence_id,
                    node_identity,
                    sentence_count_at_lock: sentence_count,
                    original_text,
                    undo_saved: false,
                    session_doc,
                });
                Ok(())
            }
            None => Err(SsError::RegistryFull),
        }
    }

    /// Runs `f` against the entry's session-private `Document` while
    /// holding the registry mutex, for `WORD`-style in-memory edits that
    /// must never touch disk.
    pub fn with_session_doc<R>(
        &self,
        filename: &str,
        username: &str,
        f: impl FnOnce(&mut LockEntry) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(e) = slot {
                if e.filename == filename && e.username == username {
                    return Some(f(e));
                }
            }
        }
        None
    }

    /// Sets `undo_saved` the first time it is called for an entry;
    /// returns `Some(true)` exactly once per session (the caller should
    /// snapshot `.undo` on that call), `Some(false)` on later calls, and
    /// `None` if there is no such entry.
    pub fn mark_undo_saved_if_first(&self, filename: &str, username: &str) -> Option<bool> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(e) = slot {
                if e.filename == filename && e.username == username {
                    if e.undo_saved {
                        return Some(false);
                    }
                    e.undo_saved = true;
                    return Some(true);
                }
            }
        }
        None
    }

    /// Releases the entry referencing `node_identity`, tearing down its
    /// private sentence list.
    pub fn remove_by_node(&self, filename: &str, node_identity: u64) -> Option<LockEntry> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if e.filename == filename && e.node_identity == node_identity) {
                return slot.take();
            }
        }
        None
    }

    /// Releases the entry for `(filename, username)`.
    pub fn remove(&self, filename: &str, username: &str) -> Option<LockEntry> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if e.filename == filename && e.username == username) {
                return slot.take();
            }
        }
        None
    }

    /// Releases every entry owned by `username` (disconnect cleanup).
    /// Returns the number of entries released.
    pub fn cleanup_user(&self, username: &str) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let mut count = 0;
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if e.username == username) {
                *slot = None;
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_and_contention() {
        let reg = LockRegistry::new(4);
        let doc = Document::create(b"One. Two.");
        let id0 = doc.sentence_by_index(0).unwrap();
        reg.try_acquire("a.txt", "alice", 0, id0, 1, 2, "One.".into(), doc)
            .unwrap();

        assert_eq!(reg.check("a.txt", 0, "alice"), CheckResult::Owned);
        assert_eq!(reg.check("a.txt", 0, "bob"), CheckResult::OwnedByOther);
        assert_eq!(reg.check("a.txt", 1, "bob"), CheckResult::NotLocked);

        let doc2 = Document::create(b"One. Two.");
        let id0b = doc2.sentence_by_index(0).unwrap();
        assert!(matches!(
            reg.try_acquire("a.txt", "bob", 0, id0b, 1, 2, "One.".into(), doc2),
            Err(SsError::SentenceLocked)
        ));

        let doc3 = Document::create(b"One. Two.");
        let sentence_id = doc3.sentence_by_index(1).unwrap();
        reg.try_acquire("a.txt", "bob", 1, sentence_id, 1, 2, "Two.".into(), doc3)
            .unwrap();
        assert_eq!(reg.active_count(), 2);
    }

    #[test]
    fn registry_full() {
        let reg = LockRegistry::new(1);
        let doc = Document::create(b"One.");
        let id = doc.sentence_by_index(0).unwrap();
        reg.try_acquire("a.txt", "alice", 0, id, 1, 1, "One.".into(), doc)
            .unwrap();
        let doc2 = Document::create(b"X.");
        let id2 = doc2.sentence_by_index(0).unwrap();
        assert!(matches!(
            reg.try_acquire("b.txt", "bob", 0, id2, 1, 1, "X.".into(), doc2),
            Err(SsError::RegistryFull)
        ));
    }

    #[test]
    fn cleanup_user_releases_all_entries() {
        let reg = LockRegistry::new(4);
        let a = Document::create(b"A.");
        let id_a = a.sentence_by_index(0).unwrap();
        reg.try_acquire("a.txt", "alice", 0, id_a, 1, 1, "A.".into(), a)
            .unwrap();
        let b = Document::create(b"B.");
        let id_b = b.sentence_by_index(0).unwrap();
        reg.try_acquire("b.txt", "alice", 0, id_b, 1, 1, "B.".into(), b)
            .unwrap();
        let c = Document::create(b"C.");
        let id_c = c.sentence_by_index(0).unwrap();
        reg.try_acquire("c.txt", "bob", 0, id_c, 1, 1, "C.".into(), c)
            .unwrap();

        assert_eq!(reg.cleanup_user("alice"), 2);
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.check("c.txt", 0, "bob"), CheckResult::Owned);
    }

    #[test]
    fn undo_saved_flips_once() {
        let reg = LockRegistry::new(4);
        let doc = Document::create(b"A.");
        let id = doc.sentence_by_index(0).unwrap();
        reg.try_acquire("a.txt", "alice", 0, id, 1, 1, "A.".into(), doc)
            .unwrap();
        assert_eq!(reg.mark_undo_saved_if_first("a.txt", "alice"), Some(true));
        assert_eq!(reg.mark_undo_saved_if_first("a.txt", "alice"), Some(false));
        assert_eq!(reg.mark_undo_saved_if_first("missing.txt", "alice"), None);
    }
}
