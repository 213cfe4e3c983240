//! Wire protocol framing (spec.md §6, SPEC_FULL §6).
//!
//! Every message is a 4-byte big-endian length prefix, a `serde_json`-
//! encoded [`Header`] of that length, then exactly `header.data_length`
//! raw payload bytes. JSON-over-length-prefixed-frames is used instead
//! of a hand-rolled binary struct layout so the framing stays small and
//! auditable (SPEC_FULL §6); the payload itself stays raw bytes per op
//! code, exactly as spec.md specifies (ASCII for `WRITE_WORD`, a plain
//! username for `CREATE`, and so on). Grounded on `tools/http.rs`'s
//! length-prefixed read/write helpers, generalized from HTTP framing to
//! this crate's one custom frame shape.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, SsError, SsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Request,
    Response,
    Ack,
    Error,
    Stop,
}

/// Protocol op codes consumed by the SS core (spec.md §6). Names mirror
/// the wire identifiers the spec gives (`SS_WRITE_LOCK`, ...); variants
/// are plain Rust enum members, not the wire strings themselves —
/// [`OpCode::as_wire_name`] / [`op_code_from_wire_name`] do that mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    SsCreate,
    SsDelete,
    SsRead,
    SsWriteLock,
    SsWriteWord,
    SsWriteUnlock,
    Info,
    Stream,
    Undo,
    SsMove,
    SsCheckpoint,
    SsViewCheckpoint,
    SsRevert,
    SsListCheckpoints,
    SsSync,
    SsCheckMtime,
    Exec,
}

impl OpCode {
    pub fn as_wire_name(&self) -> &'static str {
        match self {
            OpCode::SsCreate => "SS_CREATE",
            OpCode::SsDelete => "SS_DELETE",
            OpCode::SsRead => "SS_READ",
            OpCode::SsWriteLock => "SS_WRITE_LOCK",
            OpCode::SsWriteWord => "SS_WRITE_WORD",
            OpCode::SsWriteUnlock => "SS_WRITE_UNLOCK",
            OpCode::Info => "INFO",
            OpCode::Stream => "STREAM",
            OpCode::Undo => "UNDO",
            OpCode::SsMove => "SS_MOVE",
            OpCode::SsCheckpoint => "SS_CHECKPOINT",
            OpCode::SsViewCheckpoint => "SS_VIEWCHECKPOINT",
            OpCode::SsRevert => "SS_REVERT",
            OpCode::SsListCheckpoints => "SS_LISTCHECKPOINTS",
            OpCode::SsSync => "SS_SYNC",
            OpCode::SsCheckMtime => "SS_CHECK_MTIME",
            OpCode::Exec => "EXEC",
        }
    }
}

pub fn op_code_from_wire_name(name: &str) -> Option<OpCode> {
    Some(match name {
        "SS_CREATE" => OpCode::SsCreate,
        "SS_DELETE" => OpCode::SsDelete,
        "SS_READ" => OpCode::SsRead,
        "SS_WRITE_LOCK" => OpCode::SsWriteLock,
        "SS_WRITE_WORD" => OpCode::SsWriteWord,
        "SS_WRITE_UNLOCK" => OpCode::SsWriteUnlock,
        "INFO" => OpCode::Info,
        "STREAM" => OpCode::Stream,
        "UNDO" => OpCode::Undo,
        "SS_MOVE" => OpCode::SsMove,
        "SS_CHECKPOINT" => OpCode::SsCheckpoint,
        "SS_VIEWCHECKPOINT" => OpCode::SsViewCheckpoint,
        "SS_REVERT" => OpCode::SsRevert,
        "SS_LISTCHECKPOINTS" => OpCode::SsListCheckpoints,
        "SS_SYNC" => OpCode::SsSync,
        "SS_CHECK_MTIME" => OpCode::SsCheckMtime,
        "EXEC" => OpCode::Exec,
        _ => return None,
    })
}

/// Bit 0 of `Header::flags`: this message is a replication forward, not
/// a client-originated request (spec.md §6, §4.6).
pub const FLAG_IS_REPLICATION: u32 = 1 << 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub msg_type: MsgType,
    pub op_code: OpCode,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub foldername: Option<String>,
    #[serde(default)]
    pub sentence_index: Option<i64>,
    #[serde(default)]
    pub checkpoint_tag: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub flags: u32,
    pub data_length: u32,
}

impl Header {
    pub fn request(op_code: OpCode, username: &str, filename: &str) -> Header {
        Header {
            msg_type: MsgType::Request,
            op_code,
            username: username.to_string(),
            filename: filename.to_string(),
            foldername: None,
            sentence_index: None,
            checkpoint_tag: None,
            error_code: None,
            flags: 0,
            data_length: 0,
        }
    }

    pub fn is_replication(&self) -> bool {
        self.flags & FLAG_IS_REPLICATION != 0
    }
}

pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Writes one frame: 4-byte BE header length, the JSON header (with
/// `data_length` set to `payload.len()`), then the raw payload.
pub fn write_frame(w: &mut impl Write, header: &Header, payload: &[u8]) -> io::Result<()> {
    let mut header = header.clone();
    header.data_length = payload.len() as u32;
    let encoded = serde_json::to_vec(&header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&(encoded.len() as u32).to_be_bytes())?;
    w.write_all(&encoded)?;
    w.write_all(payload)?;
    w.flush()
}

/// Reads one frame. Returns `UnexpectedEof`/`WouldBlock`/etc. verbatim
/// so callers can distinguish a clean disconnect from a read timeout.
pub fn read_frame(r: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let header_len = u32::from_be_bytes(len_buf) as usize;

    let mut header_buf = vec![0u8; header_len];
    r.read_exact(&mut header_buf)?;
    let header: Header =
        serde_json::from_slice(&header_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut payload = vec![0u8; header.data_length as usize];
    r.read_exact(&mut payload)?;
    Ok(Frame { header, payload })
}

/// Parses a `WRITE_WORD` payload: ASCII `"<word_idx> <new_word...>"`,
/// trailing CR/LF trimmed. `word_idx == -1` means "replace the whole
/// sentence" and is surfaced as `None` (spec.md §4.4 step 3).
pub fn parse_write_word_payload(payload: &[u8]) -> SsResult<(Option<usize>, String)> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches(['\r', '\n']);
    let mut parts = text.splitn(2, ' ');
    let idx_str = parts
        .next()
        .ok_or_else(|| SsError::InvalidWord("empty WRITE_WORD payload".into()))?;
    let rest = parts.next().unwrap_or("");
    let idx: i64 = idx_str
        .parse()
        .map_err(|_| SsError::InvalidWord(format!("non-numeric word index: {}", idx_str)))?;
    if idx < -1 {
        return Err(SsError::InvalidWord(format!("word index out of range: {}", idx)));
    }
    Ok((if idx == -1 { None } else { Some(idx as usize) }, rest.to_string()))
}

/// Formats a sync manifest as `"<filename>:<mtime>\n"` lines (spec.md
/// §4.6, §6).
pub fn format_manifest(entries: &[(String, i64)]) -> Vec<u8> {
    let mut out = String::new();
    for (name, mtime) in entries {
        out.push_str(&format!("{}:{}\n", name, mtime));
    }
    out.into_bytes()
}

/// Inverse of [`format_manifest`]. Lines that don't parse as
/// `name:timestamp` are skipped rather than failing the whole manifest.
pub fn parse_manifest(payload: &[u8]) -> Vec<(String, i64)> {
    String::from_utf8_lossy(payload)
        .lines()
        .filter_map(|line| {
            let (name, ts) = line.rsplit_once(':')?;
            let ts: i64 = ts.trim().parse().ok()?;
            Some((name.to_string(), ts))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let header = Header::request(OpCode::SsWriteWord, "alice", "a.txt");
        let mut buf = Vec::new();
        write_frame(&mut buf, &header, b"1 hello").unwrap();

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).unwrap();
        assert_eq!(frame.header.username, "alice");
        assert_eq!(frame.header.filename, "a.txt");
        assert!(matches!(frame.header.op_code, OpCode::SsWriteWord));
        assert_eq!(frame.payload, b"1 hello");
    }

    #[test]
    fn replication_flag_round_trips() {
        let mut header = Header::request(OpCode::SsCreate, "alice", "a.txt");
        header.flags = FLAG_IS_REPLICATION;
        assert!(header.is_replication());

        let mut buf = Vec::new();
        write_frame(&mut buf, &header, b"").unwrap();
        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        assert!(frame.header.is_replication());
    }

    #[test]
    fn parse_write_word_replace_whole_sentence() {
        let (idx, word) = parse_write_word_payload(b"-1 Bye.\r\n").unwrap();
        assert_eq!(idx, None);
        assert_eq!(word, "Bye.");
    }

    #[test]
    fn parse_write_word_insert_before() {
        let (idx, word) = parse_write_word_payload(b"1 X").unwrap();
        assert_eq!(idx, Some(1));
        assert_eq!(word, "X");
    }

    #[test]
    fn manifest_round_trip() {
        let entries = vec![("f".to_string(), 100i64), ("g".to_string(), 50i64)];
        let payload = format_manifest(&entries);
        let parsed = parse_manifest(&payload);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn op_code_wire_name_round_trip() {
        for name in [
            "SS_CREATE",
            "SS_WRITE_LOCK",
            "SS_SYNC",
            "SS_CHECK_MTIME",
            "EXEC",
        ] {
            let code = op_code_from_wire_name(name).unwrap();
            assert_eq!(code.as_wire_name(), name);
        }
    }
}
