//! Request Dispatcher: accept loop, per-connection thread, and the
//! op-code dispatch table that drives [`crate::session::SessionEngine`].
//!
//! Grounded on `api2/node.rs`'s `TcpListener::bind` usage, generalized
//! from a single ephemeral helper-process port to a long-lived,
//! keep-alive client port: one thread per accepted client connection,
//! kept alive from LOCK through UNLOCK.

use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::{ErrorCode, SsError, SsResult};
use crate::protocol::{
    self, read_frame, write_frame, Frame, Header, MsgType, OpCode, FLAG_IS_REPLICATION,
};
use crate::replication;
use crate::session::SessionEngine;

/// Inter-word delay for `STREAM` responses.
const STREAM_WORD_DELAY: Duration = Duration::from_millis(100);

/// Broadcasts a shutdown request to the accept loop and every connection
/// thread by closing a zero-capacity channel: once [`ShutdownHandle::trigger`]
/// drops the sender, every outstanding [`Receiver::try_recv`] call across
/// all cloned receivers starts returning `Disconnected`, so a graceful
/// SIGINT/SIGTERM can release all locks and close every socket.
pub struct ShutdownHandle(Sender<()>);

impl ShutdownHandle {
    pub fn trigger(self) {
        drop(self.0);
    }
}

/// Thread-safe handle the accept loop and every connection thread share:
/// the session engine plus a shutdown channel polled between reads via a
/// periodic recv timeout.
pub struct Server {
    engine: Arc<SessionEngine>,
    recv_timeout: Duration,
    shutdown_rx: Receiver<()>,
    next_node_identity: AtomicU64,
}

impl Server {
    /// Builds the server and the [`ShutdownHandle`] that requests its
    /// termination; the caller (a signal handler bridge, in production)
    /// is responsible for keeping the handle alive until it calls
    /// [`ShutdownHandle::trigger`].
    pub fn new(engine: SessionEngine, recv_timeout: Duration) -> (Self, ShutdownHandle) {
        let (tx, rx) = bounded::<()>(0);
        (
            Server {
                engine: Arc::new(engine),
                recv_timeout,
                shutdown_rx: rx,
                next_node_identity: AtomicU64::new(1),
            },
            ShutdownHandle(tx),
        )
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    fn is_shutting_down(&self) -> bool {
        matches!(self.shutdown_rx.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }

    /// Runs the accept loop on `addr` until the paired [`ShutdownHandle`]
    /// is triggered. Each accepted connection is served on its own thread.
    pub fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        // non-blocking accept + a short poll interval lets the loop notice
        // shutdown promptly without a dedicated wakeup mechanism.
        listener.set_nonblocking(true)?;
        info!("storage server listening on {}", addr);

        let mut workers = Vec::new();
        while !self.is_shutting_down() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    let engine = Arc::clone(&self.engine);
                    let shutdown_rx = self.shutdown_rx.clone();
                    let recv_timeout = self.recv_timeout;
                    let node_identity = self.next_node_identity.fetch_add(1, Ordering::SeqCst);
                    workers.push(thread::spawn(move || {
                        if let Err(err) = stream.set_read_timeout(Some(recv_timeout)) {
                            warn!("failed to set read timeout for {}: {}", peer, err);
                        }
                        handle_connection(stream, &engine, node_identity, &shutdown_rx);
                    }));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
            workers.retain(|w| !w.is_finished());
        }

        info!("shutdown requested, waiting for {} connection(s) to drain", workers.len());
        for w in workers {
            let _ = w.join();
        }
        Ok(())
    }
}

/// One accepted connection's lifetime: frame loop, dispatch, and
/// disconnect cleanup.
fn handle_connection(stream: TcpStream, engine: &Arc<SessionEngine>, node_identity: u64, shutdown_rx: &Receiver<()>) {
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("failed to clone connection stream: {}", err);
            return;
        }
    });
    let mut writer = BufWriter::new(stream);

    let mut session_user: Option<String> = None;

    loop {
        let frame = match read_frame(&mut reader) {
            Ok(f) => f,
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // recv timeout: only used to notice shutdown/disconnect;
                // a write-session is not torn down just for going idle.
                if matches!(shutdown_rx.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected)) {
                    break;
                }
                continue;
            }
            Err(_) => break, // connection reset or truncated frame
        };

        let is_replication = frame.header.is_replication();
        let response = if is_replication {
            crate::session::without_forwarding(|| {
                dispatch(engine, &frame, &mut writer, &mut session_user, node_identity)
            })
        } else {
            dispatch(engine, &frame, &mut writer, &mut session_user, node_identity)
        };

        match response {
            Ok(Some(header)) => {
                if write_frame(&mut writer, &header, &[]).is_err() {
                    break;
                }
            }
            Ok(None) => {} // dispatch already wrote its own response frame(s)
            Err(err) => {
                let header = error_header(&frame.header, &err);
                if write_frame(&mut writer, &header, &[]).is_err() {
                    break;
                }
                // any ERROR on LOCK closes the connection.
                if matches!(frame.header.op_code, OpCode::SsWriteLock) {
                    break;
                }
            }
        }
    }

    if let Some(user) = session_user {
        let released = engine.cleanup_user(&user);
        if released > 0 {
            debug!("connection from {:?} dropped with {} open session(s)", peer, released);
        }
    }
}

fn error_header(request: &Header, err: &SsError) -> Header {
    Header {
        msg_type: MsgType::Error,
        error_code: Some(err.code()),
        ..request.clone_for_response()
    }
}

/// Dispatches one request frame. Returns `Ok(Some(header))` for the
/// common case of a single ACK/RESPONSE-with-no-payload reply the caller
/// writes; `Ok(None)` when the handler already wrote its own frame(s)
/// (plain reads, streaming, sync); `Err` for the caller to translate into
/// an `ERROR` frame.
fn dispatch(
    engine: &Arc<SessionEngine>,
    frame: &Frame,
    writer: &mut impl Write,
    session_user: &mut Option<String>,
    node_identity: u64,
) -> SsResult<Option<Header>> {
    let h = &frame.header;
    let ack = || Ok(Some(ack_header(h)));

    match h.op_code {
        OpCode::SsCreate => {
            let owner = String::from_utf8_lossy(&frame.payload).into_owned();
            let owner = if owner.is_empty() { h.username.clone() } else { owner };
            engine.create(&h.filename, &owner)?;
            ack()
        }
        OpCode::SsDelete => {
            engine.delete(&h.filename, &h.username)?;
            ack()
        }
        OpCode::SsRead | OpCode::Exec => {
            let content = engine.read(&h.filename)?;
            write_response(writer, h, &content)?;
            Ok(None)
        }
        OpCode::SsWriteLock => {
            let idx = non_negative_index(h.sentence_index)?;
            let ack = engine.lock(&h.filename, idx, &h.username, node_identity)?;
            *session_user = Some(h.username.clone());
            let payload = format!("{} {}\n{}", ack.sentence_index, ack.sentence_count, ack.original_text);
            write_response(writer, h, payload.as_bytes())?;
            Ok(None)
        }
        OpCode::SsWriteWord => {
            let (word_idx, new_word) = protocol::parse_write_word_payload(&frame.payload)?;
            engine.word(&h.filename, &h.username, word_idx, &new_word)?;
            ack()
        }
        OpCode::SsWriteUnlock => {
            let result = engine.unlock(&h.filename, &h.username);
            if result.is_ok() {
                *session_user = None;
            }
            let ack_info = result?;
            let payload = ack_info.bytes_written.to_string();
            write_response(writer, h, payload.as_bytes())?;
            Ok(None)
        }
        OpCode::Info => {
            let meta = engine.meta(&h.filename)?;
            let stats = engine.stats(&h.filename)?;
            let mut payload = format!(
                "owner:{}\ncreated:{}\nmodified:{}\ntotal_edits:{}\n",
                meta.owner, meta.created, meta.modified, stats.total_edits
            );
            let mut users: Vec<&String> = stats.per_user.keys().collect();
            users.sort();
            for u in users {
                payload.push_str(&format!("user:{}:{}\n", u, stats.per_user[u]));
            }
            write_response(writer, h, payload.as_bytes())?;
            Ok(None)
        }
        OpCode::Stream => {
            stream_file(engine, h, writer)?;
            Ok(None)
        }
        OpCode::Undo => {
            engine.undo(&h.filename, &h.username)?;
            ack()
        }
        OpCode::SsMove => {
            let new_filename = String::from_utf8_lossy(&frame.payload).into_owned();
            engine.move_file(&h.filename, &new_filename, &h.username)?;
            ack()
        }
        OpCode::SsCheckpoint => {
            let tag = checkpoint_tag(h)?;
            engine.checkpoint(&h.filename, tag, &h.username)?;
            ack()
        }
        OpCode::SsViewCheckpoint => {
            let tag = checkpoint_tag(h)?;
            let content = engine.view_checkpoint(&h.filename, tag)?;
            write_response(writer, h, &content)?;
            Ok(None)
        }
        OpCode::SsRevert => {
            let tag = checkpoint_tag(h)?;
            engine.revert(&h.filename, tag, &h.username)?;
            ack()
        }
        OpCode::SsListCheckpoints => {
            let list = engine.list_checkpoints(&h.filename)?;
            let mut payload = String::new();
            for (tag, ts) in list {
                payload.push_str(&format!("{}:{}\n", tag, ts));
            }
            write_response(writer, h, payload.as_bytes())?;
            Ok(None)
        }
        OpCode::SsSync => {
            replication::respond_to_sync(engine.store(), &frame.payload, writer)?;
            Ok(None)
        }
        OpCode::SsCheckMtime => {
            let mtime = engine.check_mtime(&h.filename)?;
            write_response(writer, h, mtime.to_string().as_bytes())?;
            Ok(None)
        }
    }
}

/// Streams `h.filename`'s current words as one `RESPONSE` frame per word
/// (spec.md §6's `STREAM` op), each `STREAM_WORD_DELAY` apart, followed
/// by a terminating `STOP` frame.
fn stream_file(engine: &Arc<SessionEngine>, h: &Header, writer: &mut impl Write) -> SsResult<()> {
    let content = engine.read(&h.filename)?;
    let text = String::from_utf8_lossy(&content);
    for (i, word) in text.split_whitespace().enumerate() {
        if i > 0 {
            thread::sleep(STREAM_WORD_DELAY);
        }
        write_response(writer, h, word.as_bytes()).map_err(SsError::Io)?;
    }
    let stop = Header {
        msg_type: MsgType::Stop,
        ..h.clone_for_response()
    };
    write_frame(writer, &stop, &[]).map_err(SsError::Io)
}

fn ack_header(request: &Header) -> Header {
    Header {
        msg_type: MsgType::Ack,
        ..request.clone_for_response()
    }
}

fn write_response(writer: &mut impl Write, request: &Header, payload: &[u8]) -> SsResult<()> {
    let header = Header {
        msg_type: MsgType::Response,
        ..request.clone_for_response()
    };
    write_frame(writer, &header, payload).map_err(SsError::Io)
}

fn non_negative_index(idx: Option<i64>) -> SsResult<usize> {
    match idx {
        Some(v) if v >= 0 => Ok(v as usize),
        _ => Err(SsError::InvalidSentence("missing or negative sentence_index".into())),
    }
}

fn checkpoint_tag(h: &Header) -> SsResult<&str> {
    h.checkpoint_tag
        .as_deref()
        .ok_or_else(|| SsError::InvalidCommand)
}

impl Header {
    /// Builds the header skeleton for a reply to `self`: same op code,
    /// username, and filename, flags/error cleared.
    fn clone_for_response(&self) -> Header {
        Header {
            msg_type: self.msg_type,
            op_code: self.op_code,
            username: self.username.clone(),
            filename: self.filename.clone(),
            foldername: self.foldername.clone(),
            sentence_index: self.sentence_index,
            checkpoint_tag: self.checkpoint_tag.clone(),
            error_code: None,
            flags: 0,
            data_length: 0,
        }
    }
}
