//! `storage-server` process entry point (spec.md §6, "Process arguments").
//!
//! Usage: `storage-server <nm_ip> <nm_port> <client_port> <server_id>`.
//! The NM coordinates themselves are not used for routing here (spec.md
//! §1: NM request routing is out of scope) — they are logged so an
//! operator can confirm which name server this instance registered
//! with; registration itself belongs to the out-of-scope NM protocol.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{self, SigHandler, Signal};

use sentence_store::config::ServerConfig;
use sentence_store::dispatcher::{Server, ShutdownHandle};
use sentence_store::file_store::FileStore;
use sentence_store::logging::init_logging;
use sentence_store::replication::ReplicaClient;
use sentence_store::session::SessionEngine;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs SIGINT/SIGTERM handlers that flip a flag polled by the
/// accept loop (spec.md §6: "Shutdown signals: graceful SIGINT/SIGTERM
/// release all locks and close sockets").
fn install_signal_handlers() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))
            .context("failed to install SIGINT handler")?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))
            .context("failed to install SIGTERM handler")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    let args = sentence_store::config::ServerArgs::parse(&raw_args)
        .context("invalid command-line arguments")?;

    init_logging(&args.server_id);
    info!(
        "starting storage server {} (registering with NM at {}:{})",
        args.server_id, args.nm_ip, args.nm_port
    );

    let config_path = PathBuf::from(format!("ss_{}.toml", args.server_id));
    let mut config = ServerConfig::load_or_default(&config_path);
    if config.storage_root == PathBuf::from("data") {
        config.storage_root = PathBuf::from(format!("data/ss_{}", args.server_id));
    }

    let store = FileStore::new(config.storage_root.clone());
    let mut engine = SessionEngine::new(store, config.max_locks).with_max_files(config.max_files);

    let replica = config
        .replica
        .as_ref()
        .map(|r| Arc::new(ReplicaClient::new(r, Duration::from_millis(config.replication_timeout_ms))));

    if let Some(replica) = &replica {
        info!("replica configured at {}:{}", config.replica.as_ref().unwrap().host, config.replica.as_ref().unwrap().port);
        match replica.pull_from_peer(engine.store()) {
            Ok(n) => info!("recovery sync pulled {} file(s) from replica on startup", n),
            Err(err) => warn!("recovery sync with replica failed (continuing without it): {}", err),
        }
        engine = engine.with_forwarder(replica.clone() as Arc<dyn sentence_store::session::CommitForwarder>);
    }

    install_signal_handlers()?;

    let (server, shutdown) = Server::new(engine, Duration::from_secs(config.recv_timeout_secs));
    ctrlc_watchdog(shutdown);

    let addr = format!("0.0.0.0:{}", args.client_port);
    server.run(&addr).context("accept loop failed")
}

/// Bridges the process-wide `SHUTDOWN_REQUESTED` flag set by the signal
/// handler into the server's shutdown channel: once the flag is set, the
/// watchdog thread triggers the handle, which closes the channel and
/// wakes every connection thread's `try_recv`. A small dedicated thread
/// avoids doing any of this inside the `extern "C"` signal handler itself.
fn ctrlc_watchdog(shutdown: ShutdownHandle) {
    std::thread::spawn(move || {
        loop {
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        shutdown.trigger();
    });
}
