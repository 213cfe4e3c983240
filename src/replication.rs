//! Replication & Sync: forward-on-commit and version-based recovery
//! pull between a primary and its one configured replica (spec.md §4.6,
//! SPEC_FULL §4.6).
//!
//! Grounded on `client::pull`'s "build a manifest, connect, stream what
//! the other side lacks or has stale, write atomically" shape —
//! rewritten from async chunk-indexed pulling (`pull_index_chunks`)
//! down to this system's much smaller unit of sync: whole files plus
//! their `.meta` sidecar, keyed by a `{filename, modified_ts}` manifest
//! instead of a content-addressed chunk digest.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{info, warn};
use walkdir::WalkDir;

use crate::config::ReplicaConfig;
use crate::error::{SsError, SsResult};
use crate::file_store::FileStore;
use crate::protocol::{self, op_code_from_wire_name, read_frame, write_frame, Header, MsgType, OpCode, FLAG_IS_REPLICATION};
use crate::session::CommitForwarder;

/// Sidecar suffixes excluded when building a sync manifest (spec.md
/// §4.6 step 1: "excluding `.meta`, `.undo`, `.stats`, and
/// `.checkpoint.*`").
const SIDECAR_MARKERS: [&str; 3] = [".meta", ".undo", ".stats"];

fn is_primary_file(name: &str) -> bool {
    if name.contains(".checkpoint.") {
        return false;
    }
    !SIDECAR_MARKERS.iter().any(|m| name.ends_with(m))
}

/// Walks `store`'s root and builds a `{filename, modified_ts}` manifest
/// for every primary file (spec.md §4.6 step 1).
pub fn build_manifest(store: &FileStore) -> SsResult<Vec<(String, i64)>> {
    let root = store.root();
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let rel_str = match rel.to_str() {
            Some(s) => s,
            None => continue,
        };
        if !is_primary_file(rel_str) {
            continue;
        }
        let modified = store.read_meta(rel_str).map(|m| m.modified).unwrap_or(0);
        out.push((rel_str.to_string(), modified));
    }
    out.sort();
    Ok(out)
}

/// One configured replica peer, plus the bounded connect/read/write
/// timeout spec.md §4.6 and §5 require ("Replication forwarding has a
/// connect/send timeout; expiration does not affect the primary
/// commit").
pub struct ReplicaClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ReplicaClient {
    pub fn new(cfg: &ReplicaConfig, timeout: Duration) -> Self {
        ReplicaClient {
            host: cfg.host.clone(),
            port: cfg.port,
            timeout,
        }
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "replica address did not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    /// Forwards one successful mutation to the replica with
    /// `FLAG_IS_REPLICATION` set. A failure or timeout is logged and
    /// swallowed (spec.md §4.6, §7 "Replication — never surfaced to the
    /// client"); divergence is healed by the next recovery pull.
    pub fn forward_op(
        &self,
        op_code: OpCode,
        filename: &str,
        username: &str,
        payload: &[u8],
        checkpoint_tag: Option<&str>,
    ) {
        let result = (|| -> std::io::Result<()> {
            let stream = self.connect()?;
            let mut writer = BufWriter::new(stream.try_clone()?);
            let mut reader = BufReader::new(stream);

            let mut header = Header::request(op_code, username, filename);
            header.flags = FLAG_IS_REPLICATION;
            header.checkpoint_tag = checkpoint_tag.map(|s| s.to_string());
            write_frame(&mut writer, &header, payload)?;

            let frame = read_frame(&mut reader)?;
            if matches!(frame.header.msg_type, MsgType::Error) {
                warn!(
                    "replica rejected forwarded {} for {}: {:?}",
                    op_code.as_wire_name(),
                    filename,
                    frame.header.error_code
                );
            }
            Ok(())
        })();

        if let Err(err) = result {
            warn!(
                "replication forward of {} for {} failed (will be healed by recovery sync): {}",
                op_code.as_wire_name(),
                filename,
                err
            );
        }
    }

    /// Runs the requester side of version-based recovery sync (spec.md
    /// §4.6 steps 2-4): sends our manifest, then reads back a stream of
    /// `"FILENAME\nCONTENT"` / `"FILENAME.meta\nCONTENT"` response pairs
    /// until the peer's terminating ACK, writing each atomically.
    /// Returns the number of primary files pulled.
    pub fn pull_from_peer(&self, store: &FileStore) -> SsResult<usize> {
        let manifest = build_manifest(store)?;
        let payload = protocol::format_manifest(&manifest);

        let stream = self.connect().map_err(SsError::Io)?;
        let mut writer = BufWriter::new(stream.try_clone().map_err(SsError::Io)?);
        let mut reader = BufReader::new(stream);

        let header = Header::request(OpCode::SsSync, "", "");
        write_frame(&mut writer, &header, &payload).map_err(SsError::Io)?;

        let mut pulled = 0usize;
        loop {
            let frame = read_frame(&mut reader).map_err(SsError::Io)?;
            match frame.header.msg_type {
                MsgType::Ack => break,
                MsgType::Response => {
                    write_payload_file(store, &frame.payload)?;
                    if !frame.header.filename.ends_with(".meta") {
                        pulled += 1;
                    }
                }
                other => {
                    return Err(SsError::Other(anyhow::anyhow!(
                        "unexpected frame {:?} during recovery sync",
                        other
                    )))
                }
            }
        }
        info!("recovery sync pulled {} file(s) from peer", pulled);
        Ok(pulled)
    }
}

impl CommitForwarder for ReplicaClient {
    fn forward(
        &self,
        op_code: &str,
        filename: &str,
        username: &str,
        payload: &[u8],
        checkpoint_tag: Option<&str>,
    ) {
        if let Some(code) = op_code_from_wire_name(op_code) {
            self.forward_op(code, filename, username, payload, checkpoint_tag);
        }
    }
}

/// Writes one `"FILENAME\nCONTENT"` sync payload to `store`, atomically.
fn write_payload_file(store: &FileStore, payload: &[u8]) -> SsResult<()> {
    let split_at = payload
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| SsError::Other(anyhow::anyhow!("malformed sync payload: missing filename separator")))?;
    let filename = String::from_utf8_lossy(&payload[..split_at]).into_owned();
    let content = &payload[split_at + 1..];
    crate::file_store::atomic_write(&store.path(&filename)?, content)
}

/// Server-side responder for an inbound `SS_SYNC` request (spec.md
/// §4.6 step 3): for every local primary file, stream it (plus its
/// `.meta` sidecar) back when the requester's manifest omits it or is
/// stale, then terminate with ACK. Equal timestamps are left alone
/// ("remote already up to date").
pub fn respond_to_sync(store: &FileStore, request_payload: &[u8], writer: &mut impl std::io::Write) -> SsResult<()> {
    let remote_manifest = protocol::parse_manifest(request_payload);
    let local_manifest = build_manifest(store)?;

    for (filename, local_ts) in &local_manifest {
        let remote_ts = remote_manifest.iter().find(|(n, _)| n == filename).map(|(_, t)| *t);
        let should_send = match remote_ts {
            None => true,
            Some(remote_ts) => *local_ts > remote_ts,
        };
        if !should_send {
            continue;
        }

        let content = store.read_file(filename)?;
        send_payload_file(writer, filename, &content)?;

        if let Ok(meta) = store.read_meta(filename) {
            let meta_bytes = format!("owner:{}\ncreated:{}\nmodified:{}\n", meta.owner, meta.created, meta.modified);
            send_payload_file(writer, &format!("{}.meta", filename), meta_bytes.as_bytes())?;
        }
    }

    let ack = Header {
        msg_type: MsgType::Ack,
        ..Header::request(OpCode::SsSync, "", "")
    };
    write_frame(writer, &ack, &[]).map_err(SsError::Io)
}

fn send_payload_file(writer: &mut impl std::io::Write, filename: &str, content: &[u8]) -> SsResult<()> {
    let mut payload = Vec::with_capacity(filename.len() + 1 + content.len());
    payload.extend_from_slice(filename.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(content);

    let mut header = Header::request(OpCode::SsSync, "", filename);
    header.msg_type = MsgType::Response;
    write_frame(writer, &header, &payload).map_err(SsError::Io)
}
