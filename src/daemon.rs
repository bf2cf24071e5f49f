//! Daemon lifecycle bookkeeping: runtime directory, PID file, stale-state
//! cleanup. Narrowed from a multi-instance "hub directory per session"
//! model to this daemon's single-instance, single-client convention: one
//! runtime directory holds exactly one PID file and one listening socket.

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Ensure `dir` exists with `0700` permissions, set before creation so a
/// concurrent process can never observe a world-writable window.
pub fn ensure_runtime_dir(dir: &Path) -> io::Result<()> {
    // SAFETY: umask takes a plain mode_t and has no failure mode.
    let previous = unsafe { libc::umask(0o077) };
    let result = fs::create_dir_all(dir);
    // SAFETY: restores the umask this process had on entry.
    unsafe {
        libc::umask(previous);
    }
    result
}

pub fn write_pid_file(path: &Path) -> io::Result<()> {
    let pid = std::process::id();
    fs::write(path, pid.to_string())
}

pub fn read_pid_file(path: &Path) -> io::Result<u32> {
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pid file does not contain a pid"))
}

/// Whether the process recorded in `pid_file` is still alive. Signal 0
/// performs no delivery; it only checks that the target exists and is
/// signalable by this process.
pub fn is_running(pid_file: &Path) -> bool {
    let Ok(pid) = read_pid_file(pid_file) else {
        return false;
    };
    // SAFETY: kill with signal 0 is a pure existence probe.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Remove a stale PID file and socket left behind by a prior instance that
/// did not shut down cleanly. Refuses to touch either file if the PID file
/// names a still-living process.
pub fn cleanup_stale(config: &Config) -> io::Result<()> {
    let pid_file = config.pid_file_path();
    if pid_file.exists() {
        if is_running(&pid_file) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "another bluetoothd instance is already running",
            ));
        }
        fs::remove_file(&pid_file).ok();
    }
    let socket_path = config.socket_path();
    if socket_path.exists() {
        fs::remove_file(&socket_path).ok();
    }
    Ok(())
}

pub fn cleanup_on_shutdown(config: &Config) {
    if let Err(e) = fs::remove_file(config.pid_file_path()) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to remove pid file: {e}");
        }
    }
    if let Err(e) = fs::remove_file(config.socket_path()) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to remove socket: {e}");
        }
    }
}

/// Bind and return the listening socket. This is the "external collaborator"
/// described by the wire contract (a pre-bound stream socket handed to the
/// connection manager); this function is the one place that collaborator is
/// constructed for a standalone binary rather than supplied by an embedder.
pub fn bind_listener(config: &Config) -> io::Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    ensure_runtime_dir(&config.runtime_dir)?;
    cleanup_stale(config)?;
    let path = config.socket_path();
    let listener = UnixListener::bind(&path)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_in(dir: &Path) -> Config {
        Config {
            runtime_dir: dir.to_path_buf(),
            pdu_capacity: 1024,
        }
    }

    #[test]
    fn write_then_read_pid_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("bluetoothd.pid");
        write_pid_file(&pid_file).unwrap();
        let pid = read_pid_file(&pid_file).unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn is_running_detects_current_process() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("bluetoothd.pid");
        write_pid_file(&pid_file).unwrap();
        assert!(is_running(&pid_file));
    }

    #[test]
    fn is_running_false_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let missing: PathBuf = tmp.path().join("nonexistent.pid");
        assert!(!is_running(&missing));
    }

    #[test]
    fn cleanup_stale_removes_dead_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        // A pid that is extremely unlikely to be alive.
        fs::write(config.pid_file_path(), "999999").unwrap();
        cleanup_stale(&config).unwrap();
        assert!(!config.pid_file_path().exists());
    }

    #[test]
    fn cleanup_stale_refuses_when_process_alive() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_pid_file(&config.pid_file_path()).unwrap();
        assert!(cleanup_stale(&config).is_err());
    }

    #[test]
    fn ensure_runtime_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested");
        ensure_runtime_dir(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
