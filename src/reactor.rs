//! A single-threaded, readiness-based I/O loop.
//!
//! The reactor owns a [`mio::Poll`] instance and a fixed-capacity table of
//! registrations. Every fd the daemon ever waits on — the listening socket,
//! the command and notification sockets, the task-queue pipe, the signal
//! self-pipe — is registered here under its own [`Token`] with a callback
//! that runs when that fd becomes ready. There is no async runtime: the loop
//! below *is* the scheduler.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll};

use crate::error::{DaemonError, DaemonResult};

pub use mio::Token;

/// Matches the original daemon's fixed `MAXNFDS`: one listener, two sockets
/// per connection, the task pipe, the signal pipe, with headroom left over.
pub const MAX_REGISTRATIONS: usize = 64;

/// What a registered fd is ready to do, collapsed from mio's richer event
/// flags into the three things a callback ever needs to branch on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

type Callback = Box<dyn FnMut(&mut Reactor, Readiness)>;

struct Registration {
    fd: RawFd,
    interest: Interest,
    // Taken out of the table for the duration of the callback invocation so
    // the callback can be handed `&mut Reactor` (and, through it, call back
    // into register/reregister/deregister on its own token) without a
    // borrow-checker conflict with the table that owns it.
    callback: Option<Callback>,
}

/// The daemon's I/O loop.
///
/// `register` accepts any raw fd wrapped for the registration call via
/// [`mio::unix::SourceFd`] — the reactor does not own the fd's lifetime,
/// callers do (a `UnixListener`, a pipe end, a `signal_hook` pipe end).
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration>,
    next_token: usize,
    running: bool,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .finish()
    }
}

impl Reactor {
    pub fn new() -> DaemonResult<Self> {
        Ok(Reactor {
            poll: Poll::new().map_err(DaemonError::Io)?,
            events: Events::with_capacity(MAX_REGISTRATIONS),
            registrations: HashMap::with_capacity(MAX_REGISTRATIONS),
            next_token: 0,
            running: false,
        })
    }

    /// Registers `fd` for `interest`, invoking `callback` on every
    /// readiness event until the registration is removed.
    ///
    /// Rejects negative fds and refuses a 65th registration: both are
    /// programming errors rather than transient conditions, since the
    /// daemon's connection model bounds live fds well under the capacity.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(&mut Reactor, Readiness) + 'static,
    ) -> DaemonResult<Token> {
        if fd < 0 {
            return Err(DaemonError::Resource("negative file descriptor"));
        }
        if self.registrations.len() >= MAX_REGISTRATIONS {
            return Err(DaemonError::Resource("reactor registration table is full"));
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(DaemonError::Io)?;
        self.registrations.insert(
            token,
            Registration {
                fd,
                interest,
                callback: Some(Box::new(callback)),
            },
        );
        Ok(token)
    }

    /// Changes the interest set for an existing registration — used to
    /// toggle write-readiness on and off as a socket's send queue drains.
    pub fn reregister(&mut self, token: Token, interest: Interest) -> DaemonResult<()> {
        let reg = self
            .registrations
            .get_mut(&token)
            .ok_or(DaemonError::Resource("unknown reactor token"))?;
        if reg.interest == interest {
            return Ok(());
        }
        self.poll
            .registry()
            .reregister(&mut SourceFd(&reg.fd), token, interest)
            .map_err(DaemonError::Io)?;
        reg.interest = interest;
        Ok(())
    }

    /// Removes a registration. Safe to call from within the registration's
    /// own callback. A missing token is not an error — deregistering twice
    /// (e.g. once explicitly, once as part of teardown) is routine.
    pub fn deregister(&mut self, token: Token) -> DaemonResult<()> {
        if let Some(reg) = self.registrations.remove(&token) {
            self.poll
                .registry()
                .deregister(&mut SourceFd(&reg.fd))
                .map_err(DaemonError::Io)?;
        }
        Ok(())
    }

    /// Requests that [`run`](Self::run) return after the current batch of
    /// callbacks finishes. Called by the signal-pipe callback.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Runs `init` once to perform the initial registrations, then polls
    /// until [`stop`](Self::stop) is called.
    pub fn run(
        &mut self,
        mut init: impl FnMut(&mut Reactor) -> DaemonResult<()>,
    ) -> DaemonResult<()> {
        init(self)?;
        self.running = true;
        while self.running {
            match self.poll.poll(&mut self.events, Option::<Duration>::None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DaemonError::Io(e)),
            }
            let ready: Vec<(Token, Readiness)> = self
                .events
                .iter()
                .map(|ev| {
                    (
                        ev.token(),
                        Readiness {
                            readable: ev.is_readable(),
                            writable: ev.is_writable(),
                            error: ev.is_error() || ev.is_read_closed() || ev.is_write_closed(),
                        },
                    )
                })
                .collect();
            for (token, readiness) in ready {
                if !self.running {
                    break;
                }
                self.dispatch_one(token, readiness);
            }
        }
        Ok(())
    }

    fn dispatch_one(&mut self, token: Token, readiness: Readiness) {
        let callback = match self.registrations.get_mut(&token) {
            Some(reg) => reg.callback.take(),
            // Deregistered by an earlier callback in the same readiness batch.
            None => None,
        };
        let Some(mut callback) = callback else {
            return;
        };
        callback(self, readiness);
        if let Some(reg) = self.registrations.get_mut(&token) {
            reg.callback = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn rejects_negative_fd() {
        let mut reactor = Reactor::new().unwrap();
        let err = reactor.register(-1, Interest::READABLE, |_, _| {}).unwrap_err();
        assert!(matches!(err, DaemonError::Resource(_)));
    }

    #[test]
    fn register_and_deregister_round_trip() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&a);
        let token = reactor.register(fd, Interest::READABLE, |_, _| {}).unwrap();
        reactor.reregister(token, Interest::READABLE | Interest::WRITABLE).unwrap();
        reactor.deregister(token).unwrap();
        // Deregistering twice is a no-op, not an error.
        reactor.deregister(token).unwrap();
    }

    #[test]
    fn refuses_registration_past_capacity() {
        let mut reactor = Reactor::new().unwrap();
        let mut keep_alive = Vec::new();
        for _ in 0..MAX_REGISTRATIONS {
            let (a, b) = UnixStream::pair().unwrap();
            let fd = std::os::fd::AsRawFd::as_raw_fd(&a);
            reactor.register(fd, Interest::READABLE, |_, _| {}).unwrap();
            keep_alive.push((a, b));
        }
        let (a, b) = UnixStream::pair().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&a);
        let err = reactor.register(fd, Interest::READABLE, |_, _| {}).unwrap_err();
        assert!(matches!(err, DaemonError::Resource(_)));
        keep_alive.push((a, b));
    }

    #[test]
    fn callback_can_deregister_its_own_token() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&a);
        use std::io::Write;
        b.write_all(b"x").unwrap();
        let token = reactor
            .register(fd, Interest::READABLE, move |r, _| {
                r.deregister(Token(0)).unwrap();
            })
            .unwrap();
        reactor.dispatch_one(token, Readiness { readable: true, writable: false, error: false });
        assert!(reactor.registrations.get(&token).is_none());
    }
}
