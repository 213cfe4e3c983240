//! Sentence-boundary parsing and per-sentence locking layered on a
//! [`PieceTable`] (spec.md §3, §4.2).
//!
//! A `Document` is deliberately cheap to create: the Write-Session Engine
//! (`crate::session`) builds a fresh one from disk at the start of every
//! `LOCK` and `UNLOCK`, rather than keeping one long-lived instance per
//! file around. Cross-request mutual exclusion is the Lock Registry's
//! job (`crate::lock_registry`); the `lock`/`unlock` methods here track
//! locked-state on *this* instance's own sentence list, which is enough
//! for standalone use and for the identity-preserving re-parse the
//! engine relies on.

use std::path::Path;
use std::sync::RwLock;

use crate::error::{SsError, SsResult};
use crate::piece_table::{PieceTable, PieceTableSnapshot, PtError};

const SENTENCE_DELIMITERS: [u8; 3] = [b'.', b'!', b'?'];

fn is_delimiter(b: u8) -> bool {
    SENTENCE_DELIMITERS.contains(&b)
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn pt_err(e: PtError) -> SsError {
    SsError::Other(anyhow::anyhow!(e.to_string()))
}

/// A parsed sentence. `trailing_ws` resolves spec.md §9's open question on
/// inter-sentence whitespace ownership: the whitespace run immediately
/// following a sentence's delimiter belongs to that sentence, not to the
/// one that follows.
#[derive(Debug, Clone)]
pub struct SentenceBoundary {
    pub id: u64,
    pub start: usize,
    pub end: usize,
    pub trailing_ws: String,
    pub locked_by: Option<String>,
}

impl SentenceBoundary {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

fn parse_sentences(text: &[u8]) -> Vec<SentenceBoundary> {
    let mut sentences = Vec::new();
    let mut id = 1u64;
    let mut pos = 0usize;
    let mut sentence_start = 0usize;
    let len = text.len();

    while pos < len {
        if is_delimiter(text[pos]) {
            let end = pos + 1;
            let mut ws_end = end;
            while ws_end < len && is_ws(text[ws_end]) {
                ws_end += 1;
            }
            let trailing_ws = String::from_utf8_lossy(&text[end..ws_end]).into_owned();
            sentences.push(SentenceBoundary {
                id,
                start: sentence_start,
                end,
                trailing_ws,
                locked_by: None,
            });
            id += 1;
            pos = ws_end;
            sentence_start = ws_end;
        } else {
            pos += 1;
        }
    }

    if sentence_start < len {
        sentences.push(SentenceBoundary {
            id,
            start: sentence_start,
            end: len,
            trailing_ws: String::new(),
            locked_by: None,
        });
    }

    sentences
}

pub struct DocumentSnapshot(PieceTableSnapshot);

pub struct Document {
    pt: PieceTable,
    sentences: RwLock<Vec<SentenceBoundary>>,
}

impl Document {
    pub fn create(content: &[u8]) -> Self {
        let pt = PieceTable::create(content);
        let sentences = parse_sentences(content);
        Document {
            pt,
            sentences: RwLock::new(sentences),
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Document> {
        let bytes = std::fs::read(path)?;
        Ok(Document::create(&bytes))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.text())
    }

    pub fn text(&self) -> Vec<u8> {
        self.pt.materialize()
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.read().unwrap().len()
    }

    pub fn sentence_by_index(&self, i: usize) -> Option<u64> {
        self.sentences.read().unwrap().get(i).map(|s| s.id)
    }

    pub fn sentence(&self, id: u64) -> Option<Vec<u8>> {
        let sentences = self.sentences.read().unwrap();
        let s = sentences.iter().find(|s| s.id == id)?;
        Some(self.pt.range(s.start, s.end - s.start))
    }

    /// Full sentence bytes (own text + trailing whitespace), useful for
    /// reassembling a document byte-for-byte.
    pub fn sentence_with_trailing_ws(&self, id: u64) -> Option<Vec<u8>> {
        let sentences = self.sentences.read().unwrap();
        let s = sentences.iter().find(|s| s.id == id)?;
        let mut out = self.pt.range(s.start, s.end - s.start);
        out.extend_from_slice(s.trailing_ws.as_bytes());
        Some(out)
    }

    pub fn last_sentence_ends_with_delimiter(&self) -> bool {
        let sentences = self.sentences.read().unwrap();
        match sentences.last() {
            None => false,
            Some(s) => {
                let last_byte = self.pt.range(s.end - 1, 1);
                last_byte.first().map_or(false, |b| is_delimiter(*b))
            }
        }
    }

    pub fn lock_info(&self, id: u64) -> Option<(bool, Option<String>)> {
        let sentences = self.sentences.read().unwrap();
        sentences
            .iter()
            .find(|s| s.id == id)
            .map(|s| (s.is_locked(), s.locked_by.clone()))
    }

    /// Try-locks sentence `id` for `user`. Idempotent for the same user;
    /// fails with [`SsError::SentenceLocked`] if another user holds it.
    pub fn lock(&self, id: u64, user: &str) -> SsResult<()> {
        let mut sentences = self.sentences.write().unwrap();
        let s = sentences
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SsError::InvalidSentence(format!("no sentence with id {}", id)))?;
        match &s.locked_by {
            Some(holder) if holder == user => Ok(()),
            Some(_) => Err(SsError::SentenceLocked),
            None => {
                s.locked_by = Some(user.to_string());
                Ok(())
            }
        }
    }

    /// Only the holder may unlock.
    pub fn unlock(&self, id: u64, user: &str) -> SsResult<()> {
        let mut sentences = self.sentences.write().unwrap();
        let s = sentences
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SsError::InvalidSentence(format!("no sentence with id {}", id)))?;
        match &s.locked_by {
            Some(holder) if holder == user => {
                s.locked_by = None;
                Ok(())
            }
            _ => Err(SsError::PermissionDenied),
        }
    }

    /// Returns the id of the sentence whose own text (excluding trailing
    /// whitespace) equals `text`, the authoritative identity-matching
    /// step used throughout the Write-Session Engine (spec.md §9,
    /// "Identity vs index").
    pub fn find_sentence_by_text(&self, text: &[u8]) -> Option<u64> {
        let sentences = self.sentences.read().unwrap();
        for s in sentences.iter() {
            if self.pt.range(s.start, s.end - s.start) == text {
                return Some(s.id);
            }
        }
        None
    }

    /// Holder-checked splice + reparse, for standalone use of `Document`
    /// (spec.md §4.2's `edit` operation).
    pub fn edit(&self, id: u64, new_text: &[u8], user: &str) -> SsResult<()> {
        let (start, end, original) = {
            let sentences = self.sentences.read().unwrap();
            let s = sentences
                .iter()
                .find(|s| s.id == id)
                .ok_or_else(|| SsError::InvalidSentence(format!("no sentence with id {}", id)))?;
            match &s.locked_by {
                Some(holder) if holder == user => {}
                _ => return Err(SsError::PermissionDenied),
            }
            (s.start, s.end, self.pt.range(s.start, s.end - s.start))
        };
        self.splice_and_reparse_preserving_lock(start, end, new_text, Some(&original), user)
    }

    /// Unchecked splice, used by the Write-Session Engine at `UNLOCK`
    /// once identity has already been verified via the Lock Registry.
    pub fn replace_sentence(&self, id: u64, new_text: &[u8]) -> SsResult<()> {
        let (start, end) = {
            let sentences = self.sentences.read().unwrap();
            let s = sentences
                .iter()
                .find(|s| s.id == id)
                .ok_or_else(|| SsError::InvalidSentence(format!("no sentence with id {}", id)))?;
            (s.start, s.end)
        };
        self.pt.delete(start, end - start);
        self.pt.insert(start, new_text).map_err(pt_err)?;
        self.reparse();
        Ok(())
    }

    /// Appends `text` as a brand-new trailing sentence. Used for the
    /// append-mode `LOCK`/`UNLOCK` path (spec.md §4.4). The last existing
    /// sentence must end in a delimiter unless the document is empty.
    pub fn append_sentence(&self, text: &[u8]) -> SsResult<()> {
        let total = self.pt.length();
        if total == 0 {
            self.pt.insert(0, text).map_err(pt_err)?;
            self.reparse();
            return Ok(());
        }

        if !self.last_sentence_ends_with_delimiter() {
            return Err(SsError::InvalidSentence(
                "last sentence has no terminating delimiter".into(),
            ));
        }
        let needs_space = {
            let sentences = self.sentences.read().unwrap();
            sentences.last().map(|s| s.trailing_ws.is_empty()).unwrap_or(true)
        };

        if needs_space {
            self.pt.insert(self.pt.length(), b" ").map_err(pt_err)?;
        }
        self.pt.insert(self.pt.length(), text).map_err(pt_err)?;
        self.reparse();
        Ok(())
    }

    /// Forces a single empty sentence onto an otherwise empty document
    /// (spec.md §4.4 `LOCK` step 2, "empty file with idx == 0").
    pub fn seed_empty_sentence(&self) -> u64 {
        let mut sentences = self.sentences.write().unwrap();
        if sentences.is_empty() {
            sentences.push(SentenceBoundary {
                id: 1,
                start: 0,
                end: 0,
                trailing_ws: String::new(),
                locked_by: None,
            });
        }
        sentences[0].id
    }

    /// Appends a synthetic empty trailing sentence for append-mode `LOCK`
    /// (spec.md §4.4 `LOCK` step 3). The current last sentence must
    /// already end in a delimiter. Mirrors `append_sentence`'s separating
    /// space: if the current last sentence owns no trailing whitespace, one
    /// space is inserted into the buffer before the new empty boundary so
    /// the eventual commit reads e.g. `"Hello world. Bye."`, not
    /// `"Hello world.Bye."`.
    pub fn seed_append_sentence(&self) -> SsResult<u64> {
        if !self.last_sentence_ends_with_delimiter() {
            return Err(SsError::InvalidSentence(
                "last sentence has no terminating delimiter".into(),
            ));
        }
        let needs_space = {
            let sentences = self.sentences.read().unwrap();
            sentences.last().map(|s| s.trailing_ws.is_empty()).unwrap_or(true)
        };
        if needs_space {
            self.pt.insert(self.pt.length(), b" ").map_err(pt_err)?;
        }

        let mut sentences = self.sentences.write().unwrap();
        let end = self.pt.length();
        let next_id = sentences.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        sentences.push(SentenceBoundary {
            id: next_id,
            start: end,
            end,
            trailing_ws: String::new(),
            locked_by: None,
        });
        Ok(next_id)
    }

    fn reparse(&self) {
        let content = self.pt.materialize();
        *self.sentences.write().unwrap() = parse_sentences(&content);
    }

    fn splice_and_reparse_preserving_lock(
        &self,
        start: usize,
        end: usize,
        new_text: &[u8],
        fallback_text: Option<&[u8]>,
        holder: &str,
    ) -> SsResult<()> {
        self.pt.delete(start, end - start);
        self.pt.insert(start, new_text).map_err(pt_err)?;
        self.reparse();

        let mut sentences = self.sentences.write().unwrap();
        let mut target = sentences.iter().position(|s| s.start == start);
        if target.is_none() {
            if let Some(text) = fallback_text {
                target = sentences
                    .iter()
                    .position(|s| self.pt.range(s.start, s.end - s.start) == text);
            }
        }
        if let Some(idx) = target {
            sentences[idx].locked_by = Some(holder.to_string());
        }
        Ok(())
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot(self.pt.snapshot())
    }

    /// Refused while any sentence is locked.
    pub fn restore(&self, snapshot: &DocumentSnapshot) -> SsResult<()> {
        {
            let sentences = self.sentences.read().unwrap();
            if sentences.iter().any(|s| s.is_locked()) {
                return Err(SsError::SentenceLocked);
            }
        }
        self.pt.restore(&snapshot.0);
        self.reparse();
        Ok(())
    }
}
