//! Drives the six literal end-to-end scenarios of spec.md §8 against the
//! Write-Session Engine directly (in-process, no real sockets) — the
//! engine is fully testable independent of the network layer, the same
//! separation the teacher keeps between its backup/restore logic and its
//! HTTP transport.

use sentence_store::error::SsError;
use sentence_store::file_store::FileStore;
use sentence_store::replication::{build_manifest, respond_to_sync};
use sentence_store::session::SessionEngine;
use tempfile::tempdir;

fn engine_with(dir: &std::path::Path, content: &[u8]) -> SessionEngine {
    let store = FileStore::new(dir);
    store.create_file("a.txt", "alice").unwrap();
    store.write_file_atomic("a.txt", content).unwrap();
    SessionEngine::new(store, 32)
}

#[test]
fn scenario_1_append_mode() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"Hello world.");

    let ack = eng.lock("a.txt", 1, "u1", 1).unwrap();
    assert_eq!(ack.sentence_count, 1);

    eng.word("a.txt", "u1", None, "Bye.").unwrap();
    eng.unlock("a.txt", "u1").unwrap();

    let content = String::from_utf8(eng.read("a.txt").unwrap()).unwrap();
    assert_eq!(content, "Hello world. Bye.");
    assert_eq!(eng.stats("a.txt").unwrap().total_edits, 1);
}

#[test]
fn scenario_2_insert_before_semantics() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"a b c.");

    eng.lock("a.txt", 0, "u1", 1).unwrap();
    eng.word("a.txt", "u1", Some(1), "X").unwrap();
    eng.unlock("a.txt", "u1").unwrap();

    assert_eq!(eng.read("a.txt").unwrap(), b"a X b c.");
}

#[test]
fn scenario_3_contention() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"One. Two.");

    eng.lock("a.txt", 0, "u1", 1).unwrap();
    assert!(matches!(eng.lock("a.txt", 0, "u2", 2), Err(SsError::SentenceLocked)));
    eng.lock("a.txt", 1, "u2", 2).unwrap();
}

#[test]
fn scenario_4_pre_commit_isolation() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"Hi. Bye.");

    eng.lock("a.txt", 0, "u1", 1).unwrap();
    eng.word("a.txt", "u1", Some(0), "Yo").unwrap();

    // a concurrent reader sees the unmodified on-disk content.
    assert_eq!(eng.read("a.txt").unwrap(), b"Hi. Bye.");

    eng.unlock("a.txt", "u1").unwrap();
    assert_eq!(eng.read("a.txt").unwrap(), b"Yo Hi. Bye.");
}

#[test]
fn scenario_5_undo_after_unlock() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"Hi. Bye.");

    eng.lock("a.txt", 0, "u1", 1).unwrap();
    eng.word("a.txt", "u1", Some(0), "Yo").unwrap();
    eng.unlock("a.txt", "u1").unwrap();
    assert_eq!(eng.read("a.txt").unwrap(), b"Yo Hi. Bye.");

    eng.undo("a.txt", "u1").unwrap();
    assert_eq!(eng.read("a.txt").unwrap(), b"Hi. Bye.");
}

#[test]
fn scenario_6_sync_convergence() {
    // Primary has f@100, g@50. Replica has f@80, g@60, h@70. After
    // primary <- replica recovery pull: primary contains f@100, g@60,
    // h@70.
    let primary_dir = tempdir().unwrap();
    let primary = FileStore::new(primary_dir.path());
    primary.create_file("f", "u1").unwrap();
    primary.write_file_atomic("f", b"primary-f").unwrap();
    bump_mtime(&primary, "f", 100);
    primary.create_file("g", "u1").unwrap();
    primary.write_file_atomic("g", b"primary-g").unwrap();
    bump_mtime(&primary, "g", 50);

    let replica_dir = tempdir().unwrap();
    let replica = FileStore::new(replica_dir.path());
    replica.create_file("f", "u1").unwrap();
    replica.write_file_atomic("f", b"replica-f").unwrap();
    bump_mtime(&replica, "f", 80);
    replica.create_file("g", "u1").unwrap();
    replica.write_file_atomic("g", b"replica-g-newer").unwrap();
    bump_mtime(&replica, "g", 60);
    replica.create_file("h", "u1").unwrap();
    replica.write_file_atomic("h", b"replica-h").unwrap();
    bump_mtime(&replica, "h", 70);

    // exercise the sync protocol's payload shape directly, without a
    // real socket: build the requester's manifest, hand it to the
    // peer's responder, and apply whatever frames come back.
    let manifest_payload = sentence_store::protocol::format_manifest(&build_manifest(&primary).unwrap());
    let mut response_buf = Vec::new();
    respond_to_sync(&replica, &manifest_payload, &mut response_buf).unwrap();

    apply_sync_response(&primary, response_buf);

    assert_eq!(primary.read_file("f").unwrap(), b"primary-f");
    assert_eq!(primary.read_file("g").unwrap(), b"replica-g-newer");
    assert_eq!(primary.read_file("h").unwrap(), b"replica-h");
}

fn bump_mtime(store: &FileStore, filename: &str, ts: i64) {
    let mut meta = store.read_meta(filename).unwrap();
    meta.modified = ts;
    store.write_meta(filename, &meta).unwrap();
}

fn apply_sync_response(store: &FileStore, buf: Vec<u8>) {
    use sentence_store::protocol::{read_frame, MsgType};
    use std::io::Cursor;

    let mut cursor = Cursor::new(buf);
    loop {
        let frame = read_frame(&mut cursor).unwrap();
        match frame.header.msg_type {
            MsgType::Ack => break,
            MsgType::Response => {
                let payload = &frame.payload;
                let split_at = payload.iter().position(|&b| b == b'\n').unwrap();
                let filename = String::from_utf8_lossy(&payload[..split_at]).into_owned();
                if filename.ends_with(".meta") {
                    continue;
                }
                let content = &payload[split_at + 1..];
                store.write_file_atomic(&filename, content).unwrap();
            }
            other => panic!("unexpected frame during sync: {:?}", other),
        }
    }
}

#[test]
fn cleanup_user_on_disconnect_does_not_commit() {
    let dir = tempdir().unwrap();
    let eng = engine_with(dir.path(), b"One. Two.");

    eng.lock("a.txt", 0, "u1", 1).unwrap();
    eng.word("a.txt", "u1", Some(0), "Edited").unwrap();

    // client disconnects before UNLOCK.
    assert_eq!(eng.cleanup_user("u1"), 1);

    assert_eq!(eng.read("a.txt").unwrap(), b"One. Two.");
    // the sentence is free again for a new writer.
    eng.lock("a.txt", 0, "u2", 2).unwrap();
}
