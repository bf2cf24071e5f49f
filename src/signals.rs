//! Self-pipe signal delivery.
//!
//! `SIGINT`/`SIGTERM` arrive on an arbitrary thread inside the process and
//! the only async-signal-safe thing their handler can do is write to a
//! pipe. `signal_hook::low_level::pipe::register` installs exactly that
//! handler for us; the read end is registered with the reactor the same
//! way any other fd is, via [`crate::reactor::Reactor::register`]. The
//! reactor does not need to know signals exist — it just sees a readable
//! fd and runs the callback bound to it, which calls
//! [`Reactor::stop`](crate::reactor::Reactor::stop).

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::error::{DaemonError, DaemonResult};

/// The read half of the signal self-pipe, to be registered with the reactor.
pub struct SignalPipe {
    read: UnixStream,
}

impl SignalPipe {
    /// Installs handlers for `SIGINT` and `SIGTERM` that write a sentinel
    /// byte to this pipe. Must be called once during startup, before the
    /// reactor begins polling.
    pub fn install() -> DaemonResult<Self> {
        let (read, write) = UnixStream::pair().map_err(DaemonError::Io)?;
        read.set_nonblocking(true).map_err(DaemonError::Io)?;
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::low_level::pipe::register(signal, write.try_clone().map_err(DaemonError::Io)?)
                .map_err(DaemonError::Io)?;
        }
        Ok(SignalPipe { read })
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.read.as_raw_fd()
    }

    /// Drains any pending sentinel bytes. Returns `true` if a signal was
    /// observed, `false` if the fd was just a spurious wakeup.
    pub fn drain(&mut self) -> DaemonResult<bool> {
        use std::io::Read;
        let mut buf = [0u8; 64];
        let mut observed = false;
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => return Err(DaemonError::Resource("signal pipe closed")),
                Ok(_) => observed = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(observed),
                Err(e) => return Err(DaemonError::Io(e)),
            }
        }
    }
}

impl std::fmt::Debug for SignalPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipe").field("fd", &self.as_raw_fd()).finish()
    }
}
