//! Runtime configuration. No CLI flags (per the process interface contract);
//! every knob is an environment variable with a hard-coded default.

use std::path::PathBuf;

const DEFAULT_PDU_CAPACITY: usize = 1024;
const RUNTIME_DIR_ENV: &str = "BLUETOOTHD_RUNTIME_DIR";
const PDU_CAPACITY_ENV: &str = "BLUETOOTHD_PDU_CAPACITY";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the listening socket and PID file.
    pub runtime_dir: PathBuf,
    /// Maximum payload bytes a read buffer will accumulate before a PDU
    /// is considered malformed.
    pub pdu_capacity: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var(RUNTIME_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_runtime_dir());

        let pdu_capacity = std::env::var(PDU_CAPACITY_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PDU_CAPACITY);

        Config {
            runtime_dir,
            pdu_capacity,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("bluetoothd.sock")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.runtime_dir.join("bluetoothd.pid")
    }
}

fn default_runtime_dir() -> PathBuf {
    // SAFETY: getuid takes no pointers and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/bluetoothd-{uid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_matches_spec() {
        std::env::remove_var(PDU_CAPACITY_ENV);
        let cfg = Config::from_env();
        assert_eq!(cfg.pdu_capacity, 1024);
    }

    #[test]
    fn socket_and_pid_paths_live_under_runtime_dir() {
        let cfg = Config {
            runtime_dir: PathBuf::from("/tmp/example"),
            pdu_capacity: 1024,
        };
        assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/example/bluetoothd.sock"));
        assert_eq!(cfg.pid_file_path(), PathBuf::from("/tmp/example/bluetoothd.pid"));
    }
}
