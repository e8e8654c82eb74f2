//! # Configuration
//!
//! Resolves a node index into the paths a worker needs, and installs logging.
//!
//! | Variable | Effect |
//! |---|---|
//! | `OFFRUN_WORKER_BIN` | worker binary used by [`crate::Api::proc_create`] |
//! | `OFFRUN_LOG` | `tracing` filter directives, `warn` when unset |

use std::path::Path;
use std::path::PathBuf;

use offrun::WorkerConfig;

pub const WORKER_BIN_ENV: &str = "OFFRUN_WORKER_BIN";
pub const LOG_ENV: &str = "OFFRUN_LOG";
pub const DEFAULT_WORKER_BIN: &str = "/opt/offrun/libexec/offrun-worker";

const DEVICE_TEMPLATE: &str = "/dev/veslot";
const OS_SOCKET_DIR: &str = "/var/opt/offrun";

pub fn device_path(node: u32) -> PathBuf {
    PathBuf::from(format!("{}{}", DEVICE_TEMPLATE, node))
}

pub fn os_socket(node: u32) -> PathBuf {
    Path::new(OS_SOCKET_DIR).join(format!("os{}.sock", node))
}

/// The worker binary named by the environment, or the installed default.
pub fn worker_binary() -> PathBuf {
    match std::env::var_os(WORKER_BIN_ENV) {
        Some(bin) if !bin.is_empty() => PathBuf::from(bin),
        _ => PathBuf::from(DEFAULT_WORKER_BIN),
    }
}

/// Paths for a worker on `node`. Without an explicit binary the environment decides.
pub fn for_node(node: u32, worker: Option<&Path>) -> WorkerConfig {
    let worker = match worker {
        Some(path) => path.to_path_buf(),
        None => worker_binary(),
    };
    WorkerConfig::new(os_socket(node), device_path(node), worker)
}

/// Installs a fmt subscriber filtered by `OFFRUN_LOG`. Later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_templating() {
        assert_eq!(device_path(0), PathBuf::from("/dev/veslot0"));
        assert_eq!(os_socket(3), PathBuf::from("/var/opt/offrun/os3.sock"));

        let config = for_node(7, Some(Path::new("/tmp/worker")));
        assert_eq!(config.device, PathBuf::from("/dev/veslot7"));
        assert_eq!(config.os_socket, PathBuf::from("/var/opt/offrun/os7.sock"));
        assert_eq!(config.worker_binary, PathBuf::from("/tmp/worker"));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
