//! Logging initialization (SPEC_FULL §1 ambient stack).
//!
//! The teacher declares `log`, `env_logger`, and `syslog` together; this
//! crate picks between the two backends at startup based on whether
//! stderr is a tty, the ordinary split between "running interactively
//! during development" and "running detached under a service manager".

use std::os::unix::io::RawFd;

use log::LevelFilter;

const STDERR_FD: RawFd = 2;

fn stderr_is_tty() -> bool {
    nix::unistd::isatty(STDERR_FD).unwrap_or(false)
}

/// Initializes the global logger exactly once per process. `server_id`
/// is used as the syslog process tag so multiple Storage Servers on one
/// host are distinguishable in the system log.
pub fn init_logging(server_id: &str) {
    if stderr_is_tty() {
        init_env_logger();
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: format!("storage-server[{}]", server_id),
        pid: std::process::id() as i32,
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            let boxed = Box::new(syslog::BasicLogger::new(logger));
            if log::set_boxed_logger(boxed).is_ok() {
                log::set_max_level(LevelFilter::Info);
            }
        }
        Err(err) => {
            init_env_logger();
            log::warn!("syslog unavailable ({}), logging to stderr instead", err);
        }
    }
}

fn init_env_logger() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .try_init();
}
