//! Append-only piece-table text buffer (spec.md §3, §4.1).
//!
//! The document is never copied wholesale on edit: `original` is the
//! immutable byte slice the table was created from, `add` is an
//! append-only scratch buffer, and the logical text is the ordered
//! concatenation of `pieces`, each a `(buffer, start, length)` reference
//! into one of the two. A snapshot is just a copy of the piece list plus
//! the `add` length at the time it was taken; because `add` only grows
//! and its bytes are never overwritten, a restored snapshot's pieces
//! remain valid no matter what has been inserted since.

use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PtError {
    #[error("position {pos} is out of bounds (length {len})")]
    OutOfBounds { pos: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Original,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub buffer: BufferKind,
    pub start: usize,
    pub length: usize,
}

/// A copy of the piece sequence plus the `add` length at capture time.
///
/// The `add_len` field is not needed to restore correctly (pieces carry
/// their own offsets), but it documents the invariant the restore relies
/// on: every offset in `pieces` referencing `Add` is `< add_len`, and
/// `add_len` only grows from here on.
#[derive(Debug, Clone)]
pub struct PieceTableSnapshot {
    pieces: Vec<Piece>,
    add_len: usize,
}

struct Inner {
    add: Vec<u8>,
    pieces: Vec<Piece>,
}

/// Two-buffer piece table with snapshot/restore.
///
/// `original` never changes after [`PieceTable::create`]. `add` and
/// `pieces` are grouped under one [`RwLock`] because every mutating
/// operation (`insert`, `delete`, `restore`) touches both together;
/// readers (`materialize`, `range`, `length`) take the shared side of the
/// same lock, so a reader never observes a piece list mid-splice.
pub struct PieceTable {
    original: Vec<u8>,
    inner: RwLock<Inner>,
}

impl PieceTable {
    pub fn create(content: &[u8]) -> Self {
        let original = content.to_vec();
        let pieces = if original.is_empty() {
            Vec::new()
        } else {
            vec![Piece {
                buffer: BufferKind::Original,
                start: 0,
                length: original.len(),
            }]
        };
        PieceTable {
            original,
            inner: RwLock::new(Inner {
                add: Vec::new(),
                pieces,
            }),
        }
    }

    pub fn length(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.pieces.iter().map(|p| p.length).sum()
    }

    fn piece_bytes<'a>(&'a self, add: &'a [u8], p: &Piece) -> &'a [u8] {
        match p.buffer {
            BufferKind::Original => &self.original[p.start..p.start + p.length],
            BufferKind::Add => &add[p.start..p.start + p.length],
        }
    }

    pub fn materialize(&self) -> Vec<u8> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::with_capacity(inner.pieces.iter().map(|p| p.length).sum());
        for p in &inner.pieces {
            out.extend_from_slice(self.piece_bytes(&inner.add, p));
        }
        out
    }

    /// Returns up to `len` bytes starting at `start`. `len` is clamped to
    /// `length() - start`; an out-of-range `start` yields an empty slice.
    pub fn range(&self, start: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.read().unwrap();
        let total: usize = inner.pieces.iter().map(|p| p.length).sum();
        if start >= total {
            return Vec::new();
        }
        let end = (start + len).min(total);
        let mut out = Vec::with_capacity(end - start);
        let mut offset = 0usize;
        for p in &inner.pieces {
            let p_start = offset;
            let p_end = offset + p.length;
            offset = p_end;
            if p_end <= start || p_start >= end {
                continue;
            }
            let lo = start.max(p_start) - p_start;
            let hi = end.min(p_end) - p_start;
            out.extend_from_slice(&self.piece_bytes(&inner.add, p)[lo..hi]);
        }
        out
    }

    /// Inserts `text` at `pos`, splitting the covering piece into up to
    /// three pieces `[left, new, right]` and skipping any zero-length
    /// split. `pos == length()` appends at the end.
    pub fn insert(&self, pos: usize, text: &[u8]) -> Result<(), PtError> {
        if text.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        let total: usize = inner.pieces.iter().map(|p| p.length).sum();
        if pos > total {
            return Err(PtError::OutOfBounds { pos, len: total });
        }

        let add_start = inner.add.len();
        inner.add.extend_from_slice(text);
        let new_piece = Piece {
            buffer: BufferKind::Add,
            start: add_start,
            length: text.len(),
        };

        let mut offset = 0usize;
        let mut split_at = None;
        for (i, p) in inner.pieces.iter().enumerate() {
            if pos <= offset + p.length {
                split_at = Some((i, pos - offset));
                break;
            }
            offset += p.length;
        }

        match split_at {
            None => inner.pieces.push(new_piece),
            Some((i, local)) => {
                let p = inner.pieces[i];
                let mut replacement = Vec::with_capacity(3);
                if local > 0 {
                    replacement.push(Piece {
                        buffer: p.buffer,
                        start: p.start,
                        length: local,
                    });
                }
                replacement.push(new_piece);
                if local < p.length {
                    replacement.push(Piece {
                        buffer: p.buffer,
                        start: p.start + local,
                        length: p.length - local,
                    });
                }
                inner.pieces.splice(i..=i, replacement);
            }
        }
        Ok(())
    }

    /// Deletes `len` bytes starting at `pos`, clamping `len` so the range
    /// never runs past the end of the document. Walks the piece list,
    /// keeping any fragment of a piece that falls outside `[pos, pos+len)`.
    pub fn delete(&self, pos: usize, len: usize) {
        if len == 0 {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let total: usize = inner.pieces.iter().map(|p| p.length).sum();
        if pos >= total {
            return;
        }
        let end = (pos + len).min(total);

        let mut kept = Vec::with_capacity(inner.pieces.len() + 1);
        let mut offset = 0usize;
        for p in &inner.pieces {
            let p_start = offset;
            let p_end = offset + p.length;
            offset = p_end;

            if p_end <= pos || p_start >= end {
                kept.push(*p);
                continue;
            }
            if p_start < pos {
                kept.push(Piece {
                    buffer: p.buffer,
                    start: p.start,
                    length: pos - p_start,
                });
            }
            if p_end > end {
                let skip = end - p_start;
                kept.push(Piece {
                    buffer: p.buffer,
                    start: p.start + skip,
                    length: p_end - end,
                });
            }
        }
        inner.pieces = kept;
    }

    pub fn snapshot(&self) -> PieceTableSnapshot {
        let inner = self.inner.read().unwrap();
        PieceTableSnapshot {
            pieces: inner.pieces.clone(),
            add_len: inner.add.len(),
        }
    }

    /// Replaces the piece sequence with the snapshot's. `add` is never
    /// truncated, so bytes the snapshot references are guaranteed present
    /// even if more text was appended to `add` after the snapshot was
    /// taken.
    pub fn restore(&self, snapshot: &PieceTableSnapshot) {
        let mut inner = self.inner.write().unwrap();
        debug_assert!(inner.add.len() >= snapshot.add_len);
        inner.pieces = snapshot.pieces.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(pt: &PieceTable) -> String {
        String::from_utf8(pt.materialize()).unwrap()
    }

    #[test]
    fn create_empty() {
        let pt = PieceTable::create(b"");
        assert_eq!(pt.length(), 0);
        assert_eq!(text(&pt), "");
    }

    #[test]
    fn create_roundtrip() {
        let pt = PieceTable::create(b"hello world");
        assert_eq!(text(&pt), "hello world");
        assert_eq!(pt.length(), 11);
    }

    #[test]
    fn insert_at_start_middle_end() {
        let pt = PieceTable::create(b"helloworld");
        pt.insert(5, b" ").unwrap();
        assert_eq!(text(&pt), "hello world");
        pt.insert(0, b">>").unwrap();
        assert_eq!(text(&pt), ">>hello world");
        let len = pt.length();
        pt.insert(len, b"!!").unwrap();
        assert_eq!(text(&pt), ">>hello world!!");
    }

    #[test]
    fn insert_out_of_bounds_fails() {
        let pt = PieceTable::create(b"abc");
        let err = pt.insert(4, b"x").unwrap_err();
        assert_eq!(err, PtError::OutOfBounds { pos: 4, len: 3 });
    }

    #[test]
    fn insert_into_empty() {
        let pt = PieceTable::create(b"");
        pt.insert(0, b"hi").unwrap();
        assert_eq!(text(&pt), "hi");
    }

    #[test]
    fn delete_whole_piece_and_fragments() {
        let pt = PieceTable::create(b"abcdefghij");
        pt.delete(3, 4); // remove "defg"
        assert_eq!(text(&pt), "abchij");
    }

    #[test]
    fn delete_clamped_past_end() {
        let pt = PieceTable::create(b"abc");
        pt.delete(1, 100);
        assert_eq!(text(&pt), "a");
    }

    #[test]
    fn delete_spanning_multiple_pieces() {
        let pt = PieceTable::create(b"abc");
        pt.insert(3, b"def").unwrap();
        pt.insert(6, b"ghi").unwrap();
        assert_eq!(text(&pt), "abcdefghi");
        pt.delete(2, 5); // remove "cdefg"
        assert_eq!(text(&pt), "abhi");
    }

    #[test]
    fn range_clamping() {
        let pt = PieceTable::create(b"abcdef");
        assert_eq!(pt.range(2, 100), b"cdef");
        assert_eq!(pt.range(10, 2), b"");
        assert_eq!(pt.range(0, 0), b"");
    }

    #[test]
    fn snapshot_restore_ignores_later_inserts() {
        let pt = PieceTable::create(b"hello");
        let snap = pt.snapshot();
        pt.insert(5, b" world").unwrap();
        assert_eq!(text(&pt), "hello world");
        pt.restore(&snap);
        assert_eq!(text(&pt), "hello");
        // add buffer growth from the restored-away insert must not be
        // truncated, so a fresh insert afterwards still works.
        pt.insert(5, b"!").unwrap();
        assert_eq!(text(&pt), "hello!");
    }

    #[test]
    fn insert_delete_matches_reference_buffer() {
        let mut reference = String::from("the quick brown fox");
        let pt = PieceTable::create(reference.as_bytes());

        reference.insert_str(4, "very ");
        pt.insert(4, b"very ").unwrap();
        assert_eq!(text(&pt), reference);

        reference.replace_range(10..16, "");
        pt.delete(10, 6);
        assert_eq!(text(&pt), reference);

        let tail = reference.len();
        reference.push_str(" jumps");
        pt.insert(tail, b" jumps").unwrap();
        assert_eq!(text(&pt), reference);
    }
}
