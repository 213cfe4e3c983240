//! `name-server`: a thin, deliberately non-functional Name Server
//! stand-in (spec.md §1, SPEC_FULL §2).
//!
//! The NM's request routing and permission table are explicitly
//! out-of-scope for this crate (spec.md §1, "treated as external
//! collaborators, specified only at their interface to the core"). This
//! binary exists solely so a developer can point a `storage-server` at
//! *something* listening on the NM's address/port while exercising the
//! SS accept loop end-to-end; it accepts connections and immediately
//! closes them rather than implementing any routing logic.

use std::env;
use std::net::TcpListener;

use anyhow::{bail, Context, Result};
use log::info;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .ok();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 1 {
        bail!("usage: name-server <listen_port>");
    }
    let port: u16 = args[0].parse().context("invalid listen_port")?;

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).with_context(|| format!("failed to bind {}", addr))?;
    info!(
        "name-server placeholder listening on {} (no routing logic: out of scope per spec)",
        addr
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => drop(stream), // accept and hang up; real routing lives in the NM, not here
            Err(err) => log::warn!("accept failed: {}", err),
        }
    }
    Ok(())
}
