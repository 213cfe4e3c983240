//! Server configuration: a TOML file for resource bounds and the
//! optional replica, plus the positional process arguments a
//! `storage-server` invocation takes. Grounded on
//! `config/datastore.rs`'s config-file load/save shape, reimplemented
//! directly on `serde`/`toml` instead of a bespoke section-config/schema
//! stack (see DESIGN.md for why that stack is dropped).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::lock_registry::DEFAULT_MAX_LOCKS;

fn default_max_locks() -> usize {
    DEFAULT_MAX_LOCKS
}

fn default_max_files() -> usize {
    10_000
}

fn default_recv_timeout_secs() -> u64 {
    2
}

fn default_replication_timeout_ms() -> u64 {
    2_000
}

/// Coordinates of the configured replica peer, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub host: String,
    pub port: u16,
}

/// Resource bounds and replica coordinates loaded once at process
/// start. One `ServerConfig` per Storage Server process, much smaller
/// than a datacenter backup daemon's many section-config resource types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub storage_root: PathBuf,
    #[serde(default = "default_max_locks")]
    pub max_locks: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,
    #[serde(default)]
    pub replica: Option<ReplicaConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            storage_root: PathBuf::from("data"),
            max_locks: default_max_locks(),
            max_files: default_max_files(),
            recv_timeout_secs: default_recv_timeout_secs(),
            replication_timeout_ms: default_replication_timeout_ms(),
            replica: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<ServerConfig> {
        let text = fs::read_to_string(path).with_context(|| format!("unable to read config file {:?}", path))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {:?}", path))
    }

    /// Loads `path` if present, falling back to [`ServerConfig::default`]
    /// (logging a warning) if it is missing or unparseable. A missing
    /// config file is not itself an error: the server has sane defaults
    /// for everything except `storage_root`, which the caller must set
    /// explicitly if the default `data/` is wrong for this deployment.
    pub fn load_or_default(path: &Path) -> ServerConfig {
        if !path.exists() {
            return ServerConfig::default();
        }
        match ServerConfig::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("{:#}; falling back to defaults", err);
                ServerConfig::default()
            }
        }
    }
}

/// Positional CLI arguments for the `storage-server` binary:
/// `<nm_ip> <nm_port> <client_port> <server_id>`.
#[derive(Debug, Clone)]
pub struct ServerArgs {
    pub nm_ip: String,
    pub nm_port: u16,
    pub client_port: u16,
    pub server_id: String,
}

impl ServerArgs {
    pub fn parse(args: &[String]) -> Result<ServerArgs> {
        if args.len() != 4 {
            bail!("usage: storage-server <nm_ip> <nm_port> <client_port> <server_id>");
        }
        Ok(ServerArgs {
            nm_ip: args[0].clone(),
            nm_port: args[1].parse().context("invalid nm_port")?,
            client_port: args[2].parse().context("invalid client_port")?,
            server_id: args[3].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let cfg = ServerConfig::load_or_default(&dir.path().join("nope.toml"));
        assert_eq!(cfg.max_locks, DEFAULT_MAX_LOCKS);
        assert!(cfg.replica.is_none());
    }

    #[test]
    fn parses_replica_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ss.toml");
        fs::write(
            &path,
            r#"
            storage_root = "data/ss_1"
            max_locks = 64

            [replica]
            host = "10.0.0.2"
            port = 9001
            "#,
        )
        .unwrap();

        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.max_locks, 64);
        assert_eq!(cfg.max_files, default_max_files());
        let replica = cfg.replica.unwrap();
        assert_eq!(replica.host, "10.0.0.2");
        assert_eq!(replica.port, 9001);
    }

    #[test]
    fn parse_cli_args() {
        let args: Vec<String> = ["10.0.0.1", "8000", "9000", "ss1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = ServerArgs::parse(&args).unwrap();
        assert_eq!(parsed.nm_port, 8000);
        assert_eq!(parsed.client_port, 9000);
        assert_eq!(parsed.server_id, "ss1");
    }

    #[test]
    fn wrong_arg_count_fails() {
        let args: Vec<String> = vec!["only-one".to_string()];
        assert!(ServerArgs::parse(&args).is_err());
    }
}
