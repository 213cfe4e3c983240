//! The Write-Session Engine: `LOCK -> WORD* -> UNLOCK` (spec.md §4.4).
//!
//! This is the coordinator that ties [`crate::document::Document`],
//! [`crate::lock_registry::LockRegistry`] and [`crate::file_store::FileStore`]
//! together. Mirrors a REST handler's pattern of validate,
//! mutate the owned resource, persist, log — just collapsed into one
//! object instead of one handler function per HTTP route, since there is
//! no router here to host them.
//!
//! A single `SessionEngine` instance is shared (immutably) across every
//! connection thread; all mutable state lives inside the registry's
//! mutex and the file store's atomic-write discipline, per spec.md §9's
//! "global mutable registry" note.

use std::cell::Cell;
use std::sync::Arc;

use log::warn;

use crate::document::Document;
use crate::error::{SsError, SsResult};
use crate::file_store::{FileMeta, FileStats, FileStore};
use crate::lock_registry::{CheckResult, LockRegistry};

thread_local! {
    /// Set by the dispatcher around handling of an inbound message that
    /// itself carries `FLAG_IS_REPLICATION` (spec.md §4.6: "if ... the
    /// inbound message is not itself a replication message"). One
    /// connection is served by one thread, so a thread-local is enough to
    /// suppress the re-forward without threading an extra argument through
    /// every `SessionEngine` method.
    static SUPPRESS_FORWARD: Cell<bool> = Cell::new(false);
}

/// Runs `f` with commit-forwarding suppressed for its duration. The
/// dispatcher wraps every handler for an inbound `FLAG_IS_REPLICATION`
/// message in this so a forwarded mutation is applied locally but not
/// bounced back out to the replica.
pub fn without_forwarding<R>(f: impl FnOnce() -> R) -> R {
    SUPPRESS_FORWARD.with(|s| s.set(true));
    let result = f();
    SUPPRESS_FORWARD.with(|s| s.set(false));
    result
}

/// Hard cap on tokens accepted by `WORD` tokenization (spec.md §5).
/// Exceeding it is reported as `InvalidWord` rather than silently
/// truncating the sentence.
pub const MAX_WORDS_PER_SENTENCE: usize = 4096;

/// The four-byte token the client uses to encode a literal newline
/// inside a single-line `WORD` payload (spec.md §9).
const NEWLINE_TOKEN: &str = "<NL>";

/// Forwards a successful mutation to a configured replica, carrying
/// whatever payload bytes and checkpoint tag the original message needs
/// to be replayed op-for-op (spec.md §4.6, "forwards the same message").
/// Implemented by [`crate::replication::ReplicaClient`]; kept as a trait
/// here so `session` does not need to depend on `replication`'s
/// transport details.
pub trait CommitForwarder: Send + Sync {
    fn forward(&self, op_code: &str, filename: &str, username: &str, payload: &[u8], checkpoint_tag: Option<&str>);
}

pub struct LockAck {
    pub sentence_index: usize,
    pub sentence_count: usize,
    pub original_text: String,
}

pub struct UnlockAck {
    pub bytes_written: usize,
}

pub struct SessionEngine {
    registry: LockRegistry,
    store: FileStore,
    forwarder: Option<Arc<dyn CommitForwarder>>,
    max_files: usize,
}

fn decode_nl(content: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(content);
    if text.contains(NEWLINE_TOKEN) {
        text.replace(NEWLINE_TOKEN, "\n").into_bytes()
    } else {
        content.to_vec()
    }
}

fn tokenize_words(text: &[u8]) -> Vec<Vec<u8>> {
    String::from_utf8_lossy(text)
        .split_whitespace()
        .map(|w| w.as_bytes().to_vec())
        .collect()
}

fn join_words(words: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, w) in words.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(w);
    }
    out
}

impl SessionEngine {
    pub fn new(store: FileStore, max_locks: usize) -> Self {
        SessionEngine {
            registry: LockRegistry::new(max_locks),
            store,
            forwarder: None,
            max_files: usize::MAX,
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn CommitForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Bounds the number of distinct files this server will create
    /// (spec.md §5's MAX_FILES-per-server resource bound). Unbounded by
    /// default.
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    fn forward(&self, op_code: &str, filename: &str, username: &str, payload: &[u8], checkpoint_tag: Option<&str>) {
        if SUPPRESS_FORWARD.with(|s| s.get()) {
            return;
        }
        if let Some(f) = &self.forwarder {
            f.forward(op_code, filename, username, payload, checkpoint_tag);
        }
    }

    // ---- non-mutating --------------------------------------------------

    pub fn read(&self, filename: &str) -> SsResult<Vec<u8>> {
        self.store.read_file(filename)
    }

    pub fn check_mtime(&self, filename: &str) -> SsResult<i64> {
        Ok(self.store.read_meta(filename)?.modified)
    }

    // ---- plain file lifecycle ops (spec.md §6 op codes) -----------------

    pub fn create(&self, filename: &str, owner: &str) -> SsResult<()> {
        if self.store.count_files()? >= self.max_files {
            return Err(SsError::SsUnavailable);
        }
        self.store.create_file(filename, owner)?;
        self.forward("SS_CREATE", filename, owner, owner.as_bytes(), None);
        Ok(())
    }

    pub fn delete(&self, filename: &str, username: &str) -> SsResult<()> {
        self.store.delete_file(filename)?;
        self.forward("SS_DELETE", filename, username, &[], None);
        Ok(())
    }

    pub fn move_file(&self, filename: &str, new_filename: &str, username: &str) -> SsResult<()> {
        self.store.move_file(filename, new_filename)?;
        self.forward("SS_MOVE", filename, username, new_filename.as_bytes(), None);
        Ok(())
    }

    pub fn checkpoint(&self, filename: &str, tag: &str, username: &str) -> SsResult<()> {
        self.store.checkpoint(filename, tag)?;
        self.forward("SS_CHECKPOINT", filename, username, &[], Some(tag));
        Ok(())
    }

    pub fn view_checkpoint(&self, filename: &str, tag: &str) -> SsResult<Vec<u8>> {
        self.store.view_checkpoint(filename, tag)
    }

    pub fn revert(&self, filename: &str, tag: &str, username: &str) -> SsResult<()> {
        self.store.revert(filename, tag)?;
        self.forward("SS_REVERT", filename, username, &[], Some(tag));
        Ok(())
    }

    pub fn list_checkpoints(&self, filename: &str) -> SsResult<Vec<(String, i64)>> {
        self.store.list_checkpoints(filename)
    }

    pub fn meta(&self, filename: &str) -> SsResult<FileMeta> {
        self.store.read_meta(filename)
    }

    pub fn stats(&self, filename: &str) -> SsResult<FileStats> {
        self.store.read_stats(filename)
    }

    /// Single-level rollback. Not itself undoable, and not a write
    /// session op — it bypasses the registry entirely.
    pub fn undo(&self, filename: &str, username: &str) -> SsResult<()> {
        self.store.undo(filename)?;
        self.forward("UNDO", filename, username, &[], None);
        Ok(())
    }

    // ---- the write session ----------------------------------------------

    /// `LOCK(file, idx, user)` — spec.md §4.4.
    pub fn lock(&self, filename: &str, idx: usize, username: &str, node_identity: u64) -> SsResult<LockAck> {
        // idempotent re-lock: the caller already owns this index.
        if let CheckResult::Owned = self.registry.check(filename, idx, username) {
            if let Some(existing) = self.registry.find(filename, username) {
                return Ok(LockAck {
                    sentence_index: existing.sentence_index_at_lock,
                    sentence_count: existing.sentence_count_at_lock,
                    original_text: existing.original_text,
                });
            }
        }

        let bytes = self.store.read_file(filename)?;
        let session_doc = Document::create(&bytes);
        let n = session_doc.sentence_count();

        let (sentence_id, original_text) = if bytes.is_empty() && idx == 0 {
            let id = session_doc.seed_empty_sentence();
            (id, String::new())
        } else if idx == n {
            let id = session_doc.seed_append_sentence()?;
            (id, String::new())
        } else if idx < n {
            let id = session_doc
                .sentence_by_index(idx)
                .ok_or_else(|| SsError::InvalidSentence(format!("no sentence at index {}", idx)))?;
            let text = String::from_utf8_lossy(&session_doc.sentence(id).unwrap_or_default()).into_owned();
            (id, text)
        } else {
            return Err(SsError::InvalidSentence(format!(
                "sentence index {} out of range (count {})",
                idx, n
            )));
        };

        match self.registry.check(filename, idx, username) {
            CheckResult::Owned => {}
            CheckResult::OwnedByOther => return Err(SsError::SentenceLocked),
            CheckResult::NotLocked => {}
        }

        session_doc.lock(sentence_id, username)?;

        self.registry.try_acquire(
            filename,
            username,
            idx,
            sentence_id,
            node_identity,
            n,
            original_text.clone(),
            session_doc,
        )?;

        Ok(LockAck {
            sentence_index: idx,
            sentence_count: n,
            original_text,
        })
    }

    /// `WORD(file, word_idx, new_word, user)` — spec.md §4.4. `word_idx
    /// == -1` (passed here as `None`) replaces the whole sentence text.
    pub fn word(&self, filename: &str, username: &str, word_idx: Option<usize>, new_word: &str) -> SsResult<()> {
        if self.registry.find(filename, username).is_none() {
            return Err(SsError::PermissionDenied);
        }

        if self.registry.mark_undo_saved_if_first(filename, username) == Some(true) {
            self.store.save_undo(filename)?;
        }

        let result = self.registry.with_session_doc(filename, username, |entry| {
            let current = entry.session_doc.sentence(entry.sentence_id).unwrap_or_default();

            let replacement = match word_idx {
                None => new_word.as_bytes().to_vec(),
                Some(idx) => {
                    let mut words = tokenize_words(&current);
                    let w = words.len();
                    if idx > w {
                        return Err(SsError::InvalidWord(format!(
                            "word index {} out of range (count {})",
                            idx, w
                        )));
                    }
                    let new_tokens = tokenize_words(new_word.as_bytes());
                    if words.len() + new_tokens.len() > MAX_WORDS_PER_SENTENCE {
                        return Err(SsError::InvalidWord("sentence exceeds MAX_WORDS_PER_SENTENCE".into()));
                    }
                    words.splice(idx..idx, new_tokens);
                    join_words(&words)
                }
            };

            entry.session_doc.replace_sentence(entry.sentence_id, &replacement)
        });

        match result {
            Some(inner) => inner,
            None => Err(SsError::PermissionDenied),
        }
    }

    /// `UNLOCK(file, user)` — spec.md §4.4.
    pub fn unlock(&self, filename: &str, username: &str) -> SsResult<UnlockAck> {
        let summary = self
            .registry
            .find(filename, username)
            .ok_or(SsError::PermissionDenied)?;

        let edited_text = self
            .registry
            .with_session_doc(filename, username, |entry| {
                entry.session_doc.sentence(entry.sentence_id).unwrap_or_default()
            })
            .ok_or(SsError::PermissionDenied)?;

        let bytes = self.store.read_file(filename)?;
        let fresh = Document::create(&bytes);
        let m = fresh.sentence_count();

        let target_id = match fresh.find_sentence_by_text(summary.original_text.as_bytes()) {
            Some(id) => id,
            None if summary.original_text.is_empty() && m == 0 => fresh.seed_empty_sentence(),
            None if summary.original_text.is_empty() && m > 0 => fresh.seed_append_sentence()?,
            None => {
                return Err(SsError::InvalidSentence(
                    "locked sentence no longer present in current content".into(),
                ))
            }
        };

        fresh.replace_sentence(target_id, &edited_text)?;
        let decoded = decode_nl(&fresh.text());

        self.store.write_file_atomic(filename, &decoded)?;
        self.store.increment_stats(filename, username)?;

        self.registry.remove(filename, username);
        self.forward("SS_WRITE_UNLOCK", filename, username, &[], None);

        Ok(UnlockAck {
            bytes_written: decoded.len(),
        })
    }

    /// Releases a session without committing (connection drop,
    /// spec.md §4.4's "Timeouts and cancellation").
    pub fn cancel(&self, filename: &str, username: &str) {
        self.registry.remove(filename, username);
    }

    /// Releases every session owned by `username` (disconnect cleanup).
    pub fn cleanup_user(&self, username: &str) -> usize {
        let n = self.registry.cleanup_user(username);
        if n > 0 {
            warn!("released {} uncommitted session(s) for user {}", n, username);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> SessionEngine {
        SessionEngine::new(FileStore::new(dir), 16)
    }

    #[test]
    fn append_mode_end_to_end() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"Hello world.").unwrap();

        let ack = eng.lock("a.txt", 1, "alice", 1).unwrap();
        assert_eq!(ack.sentence_count, 1);
        assert_eq!(ack.original_text, "");

        eng.word("a.txt", "alice", None, "Bye.").unwrap();
        let unlock = eng.unlock("a.txt", "alice").unwrap();
        assert!(unlock.bytes_written > 0);

        let content = String::from_utf8(eng.read("a.txt").unwrap()).unwrap();
        assert_eq!(content, "Hello world. Bye.");
        assert_eq!(eng.stats("a.txt").unwrap().total_edits, 1);
    }

    #[test]
    fn first_write_to_empty_file_commits() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        eng.word("a.txt", "alice", None, "Hello.").unwrap();
        let unlock = eng.unlock("a.txt", "alice").unwrap();
        assert!(unlock.bytes_written > 0);

        assert_eq!(eng.read("a.txt").unwrap(), b"Hello.");
        assert_eq!(eng.stats("a.txt").unwrap().total_edits, 1);
    }

    #[test]
    fn insert_before_semantics() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"a b c.").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        eng.word("a.txt", "alice", Some(1), "X").unwrap();
        eng.unlock("a.txt", "alice").unwrap();

        assert_eq!(eng.read("a.txt").unwrap(), b"a X b c.");
    }

    #[test]
    fn contention_across_sentences() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"One. Two.").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        assert!(matches!(
            eng.lock("a.txt", 0, "bob", 2),
            Err(SsError::SentenceLocked)
        ));
        eng.lock("a.txt", 1, "bob", 2).unwrap();
    }

    #[test]
    fn pre_commit_isolation_and_undo() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"Hi. Bye.").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        eng.word("a.txt", "alice", Some(0), "Yo").unwrap();

        // a reader mid-session sees the unmodified on-disk content.
        assert_eq!(eng.read("a.txt").unwrap(), b"Hi. Bye.");

        eng.unlock("a.txt", "alice").unwrap();
        assert_eq!(eng.read("a.txt").unwrap(), b"Yo Hi. Bye.");

        eng.undo("a.txt", "alice").unwrap();
        assert_eq!(eng.read("a.txt").unwrap(), b"Hi. Bye.");
    }

    #[test]
    fn word_out_of_range_is_invalid_word() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"a b c.").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        assert!(matches!(
            eng.word("a.txt", "alice", Some(99), "X"),
            Err(SsError::InvalidWord(_))
        ));
    }

    #[test]
    fn word_without_lock_is_permission_denied() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        assert!(matches!(
            eng.word("a.txt", "alice", None, "x"),
            Err(SsError::PermissionDenied)
        ));
    }

    #[test]
    fn cleanup_user_releases_uncommitted_session() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"One. Two.").unwrap();
        eng.lock("a.txt", 0, "alice", 1).unwrap();

        assert_eq!(eng.cleanup_user("alice"), 1);
        // the file is untouched; a new writer can now take the lock.
        assert_eq!(eng.read("a.txt").unwrap(), b"One. Two.");
        eng.lock("a.txt", 0, "bob", 2).unwrap();
    }

    #[test]
    fn max_files_bound_rejects_further_creates() {
        let dir = tempdir().unwrap();
        let eng = SessionEngine::new(FileStore::new(dir.path()), 16).with_max_files(1);
        eng.create("a.txt", "alice").unwrap();
        assert!(matches!(eng.create("b.txt", "alice"), Err(SsError::SsUnavailable)));
    }

    #[test]
    fn nl_token_decoded_on_commit() {
        let dir = tempdir().unwrap();
        let eng = engine(dir.path());
        eng.create("a.txt", "alice").unwrap();
        eng.store().write_file_atomic("a.txt", b"Hi.").unwrap();

        eng.lock("a.txt", 0, "alice", 1).unwrap();
        eng.word("a.txt", "alice", None, "Line1<NL>Line2.").unwrap();
        eng.unlock("a.txt", "alice").unwrap();

        assert_eq!(eng.read("a.txt").unwrap(), b"Line1\nLine2.");
    }
}
