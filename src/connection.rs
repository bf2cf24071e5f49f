//! Connection lifecycle: accepting the command and notification sockets,
//! driving their read/write state machines, and the raw `sendmsg`/`recvmsg`
//! plumbing needed to pass a file descriptor alongside a PDU.
//!
//! Exactly one client is ever connected at a time. The client opens two
//! Unix-domain sockets against the daemon's listener in sequence: the
//! first accepted connection becomes the command socket, the second the
//! notification socket. A third connection attempt, or any I/O error on
//! either socket, tears both down and returns the daemon to
//! "awaiting command socket".

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;
use std::sync::Arc;

use mio::Interest;

use crate::buffers::{ReadBuffer, WriteBuffer};
use crate::dispatch::{DispatchContext, ServiceInit};
use crate::error::{DaemonError, DaemonResult};
use crate::proto::Pdu;
use crate::reactor::{Reactor, Readiness, Token};
use crate::task_queue::TaskSender;

/// A notification sender bound to one connection's notification socket.
/// Safe to call from any thread: the underlying queue is drained only on
/// the reactor thread, so the only thing crossing threads is the already-
/// encoded intent to send, never raw socket access.
pub type SendPdu = Arc<dyn Fn(Pdu) + Send + Sync>;

type NotificationOutbox = Arc<std::sync::Mutex<VecDeque<Pdu>>>;

fn new_outbox() -> NotificationOutbox {
    Arc::new(std::sync::Mutex::new(VecDeque::new()))
}

fn send_pdu_fn(outbox: NotificationOutbox) -> SendPdu {
    Arc::new(move |pdu: Pdu| {
        if let Ok(mut queue) = outbox.lock() {
            queue.push_back(pdu);
        }
    })
}

struct Endpoint {
    stream: UnixStream,
    token: Token,
    read: ReadBuffer,
    write: VecDeque<WriteBuffer>,
    write_interest: bool,
}

/// Everything the daemon knows about the single live client connection.
pub struct ConnectionManager {
    listener_token: Option<Token>,
    command: Option<Endpoint>,
    notification: Option<Endpoint>,
    dispatch: Option<DispatchContext>,
    outbox: NotificationOutbox,
    hal: Arc<crate::hal::HalAdapter>,
    tasks: TaskSender,
    pdu_capacity: usize,
}

impl ConnectionManager {
    pub fn new(hal: Arc<crate::hal::HalAdapter>, tasks: TaskSender, pdu_capacity: usize) -> Self {
        ConnectionManager {
            listener_token: None,
            command: None,
            notification: None,
            dispatch: None,
            outbox: new_outbox(),
            hal,
            tasks,
            pdu_capacity,
        }
    }

    /// Registers the pre-bound listener with the reactor. Called once at
    /// startup by `main`.
    pub fn register_listener(
        manager: &Rc<RefCell<Self>>,
        reactor: &mut Reactor,
        listener: UnixListener,
    ) -> DaemonResult<()> {
        listener.set_nonblocking(true).map_err(DaemonError::Io)?;
        let fd = listener.as_raw_fd();
        let manager_for_cb = manager.clone();
        let token = reactor.register(fd, Interest::READABLE, move |reactor, readiness| {
            if readiness.error {
                log::error!("listener socket reported an error, giving up on it");
                return;
            }
            let manager_for_accept = manager_for_cb.clone();
            manager_for_cb.borrow_mut().accept_ready(reactor, &listener, &manager_for_accept);
        })?;
        manager.borrow_mut().listener_token = Some(token);
        Ok(())
    }

    fn accept_ready(&mut self, reactor: &mut Reactor, listener: &UnixListener, manager: &Rc<RefCell<Self>>) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.adopt(reactor, stream, manager),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Adopts a freshly accepted stream as the command socket if none is
    /// set, else as the notification socket, else logs and drops it.
    fn adopt(&mut self, reactor: &mut Reactor, stream: UnixStream, manager: &Rc<RefCell<Self>>) {
        if self.command.is_none() {
            self.adopt_command(reactor, stream, manager);
        } else if self.notification.is_none() {
            self.adopt_notification(reactor, stream, manager);
        } else {
            log::warn!("rejecting third connection attempt; command and notification sockets already bound");
        }
    }

    fn adopt_command(&mut self, reactor: &mut Reactor, stream: UnixStream, manager: &Rc<RefCell<Self>>) {
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("failed to set command socket non-blocking: {e}");
            return;
        }
        let fd = stream.as_raw_fd();
        let init = ServiceInit {
            hal: self.hal.clone(),
            tasks: self.tasks.clone(),
            send_notification: send_pdu_fn(self.outbox.clone()),
        };
        self.dispatch = Some(DispatchContext::new(init));
        let manager_for_cb = manager.clone();
        let token = match reactor.register(fd, Interest::READABLE, move |reactor, readiness| {
            command_callback(reactor, readiness, &manager_for_cb);
        }) {
            Ok(token) => token,
            Err(e) => {
                log::error!("failed to register command socket: {e}");
                self.dispatch = None;
                return;
            }
        };
        self.command = Some(Endpoint {
            stream,
            token,
            read: ReadBuffer::new(self.pdu_capacity),
            write: VecDeque::new(),
            write_interest: false,
        });
        log::info!("command socket connected");
    }

    fn adopt_notification(&mut self, reactor: &mut Reactor, stream: UnixStream, manager: &Rc<RefCell<Self>>) {
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("failed to set notification socket non-blocking: {e}");
            return;
        }
        let fd = stream.as_raw_fd();
        let manager_for_cb = manager.clone();
        let token = match reactor.register(fd, Interest::READABLE, move |reactor, readiness| {
            notification_callback(reactor, readiness, &manager_for_cb);
        }) {
            Ok(token) => token,
            Err(e) => {
                log::error!("failed to register notification socket: {e}");
                return;
            }
        };
        self.notification = Some(Endpoint {
            stream,
            token,
            read: ReadBuffer::new(self.pdu_capacity),
            write: VecDeque::new(),
            write_interest: false,
        });
        log::info!("notification socket connected");
        self.flush_outbox(reactor);
    }

    /// Drains any notifications enqueued (directly, or via a task that ran
    /// since the last drain) and, if the notification socket exists, queues
    /// them for send. Notifications with nowhere to go are dropped.
    pub fn flush_outbox(&mut self, reactor: &mut Reactor) {
        let pending: Vec<Pdu> = {
            let mut q = self.outbox.lock().expect("notification outbox lock poisoned");
            q.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        if self.notification.is_none() {
            log::debug!("dropping {} notification(s): notification socket not connected", pending.len());
            return;
        }
        for pdu in pending {
            self.queue_notification(pdu);
        }
        self.sync_write_interest(reactor);
    }

    fn queue_notification(&mut self, pdu: Pdu) {
        if let Some(notification) = &mut self.notification {
            notification.write.push_back(WriteBuffer::new(&pdu));
        }
    }

    fn sync_write_interest(&mut self, reactor: &mut Reactor) {
        if let Some(endpoint) = &mut self.command {
            sync_endpoint_write_interest(endpoint, reactor);
        }
        if let Some(endpoint) = &mut self.notification {
            sync_endpoint_write_interest(endpoint, reactor);
        }
    }

    fn handle_command_readable(&mut self, reactor: &mut Reactor) {
        loop {
            let pdu = {
                let Some(endpoint) = &mut self.command else { return };
                match read_one_pdu(endpoint) {
                    Ok(Some(pdu)) => pdu,
                    Ok(None) => return,
                    Err(e) => {
                        log::warn!("command socket read error: {e}");
                        self.teardown(reactor);
                        return;
                    }
                }
            };
            let response = match &mut self.dispatch {
                Some(dispatch) => dispatch.dispatch(&pdu),
                None => return,
            };
            if let Some(endpoint) = &mut self.command {
                match response.attached_fd {
                    Some(fd) => endpoint.write.push_back(WriteBuffer::with_fd(&response.pdu, fd)),
                    None => endpoint.write.push_back(WriteBuffer::new(&response.pdu)),
                }
            }
        }
        // unreachable, loop only returns
    }

    fn handle_command_writable(&mut self, reactor: &mut Reactor) {
        let result = {
            let Some(endpoint) = &mut self.command else { return };
            drain_writes(endpoint)
        };
        if let Err(e) = result {
            log::warn!("command socket write error: {e}");
            self.teardown(reactor);
            return;
        }
        self.sync_write_interest(reactor);
    }

    fn handle_notification_readable(&mut self, reactor: &mut Reactor) {
        // The notification socket is write-only from the daemon's
        // perspective; any inbound byte, or EOF, indicates the client
        // closed it.
        let closed = {
            let Some(endpoint) = &mut self.notification else { return };
            let mut scratch = [0u8; 64];
            use std::io::Read;
            match endpoint.stream.read(&mut scratch) {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(_) => true,
            }
        };
        if closed {
            log::info!("notification socket closed by client");
            self.teardown(reactor);
        }
    }

    fn handle_notification_writable(&mut self, reactor: &mut Reactor) {
        let result = {
            let Some(endpoint) = &mut self.notification else { return };
            drain_writes(endpoint)
        };
        if let Err(e) = result {
            log::warn!("notification socket write error: {e}");
            self.teardown(reactor);
            return;
        }
        self.sync_write_interest(reactor);
    }

    /// Tears down both sockets and all per-connection state on any error,
    /// returning the daemon to "awaiting command socket".
    fn teardown(&mut self, reactor: &mut Reactor) {
        if let Some(endpoint) = self.command.take() {
            let _ = reactor.deregister(endpoint.token);
        }
        if let Some(endpoint) = self.notification.take() {
            let _ = reactor.deregister(endpoint.token);
        }
        self.dispatch = None;
        self.outbox.lock().expect("notification outbox lock poisoned").clear();
    }

    /// Tears down the live connection, if any, and deregisters the
    /// listener. Called once by `main` on graceful shutdown.
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        self.teardown(reactor);
        if let Some(token) = self.listener_token.take() {
            let _ = reactor.deregister(token);
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("has_command", &self.command.is_some())
            .field("has_notification", &self.notification.is_some())
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

fn command_callback(reactor: &mut Reactor, readiness: Readiness, manager: &Rc<RefCell<ConnectionManager>>) {
    let mut m = manager.borrow_mut();
    if readiness.error {
        log::warn!("command socket reported an error");
        m.teardown(reactor);
        return;
    }
    if readiness.readable {
        m.handle_command_readable(reactor);
    }
    if readiness.writable {
        m.handle_command_writable(reactor);
    }
}

fn notification_callback(reactor: &mut Reactor, readiness: Readiness, manager: &Rc<RefCell<ConnectionManager>>) {
    let mut m = manager.borrow_mut();
    if readiness.error {
        log::warn!("notification socket reported an error");
        m.teardown(reactor);
        return;
    }
    if readiness.readable {
        m.handle_notification_readable(reactor);
    }
    if readiness.writable {
        m.handle_notification_writable(reactor);
    }
}

fn read_one_pdu(endpoint: &mut Endpoint) -> DaemonResult<Option<Pdu>> {
    use std::io::Read;
    loop {
        if endpoint.read.has_full_pdu() {
            return Ok(Some(endpoint.read.take_pdu()?));
        }
        if endpoint.read.is_full() {
            return Err(DaemonError::Resource("read buffer full without a complete pdu"));
        }
        match endpoint.stream.read(endpoint.read.target_mut()) {
            Ok(0) => return Err(DaemonError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"))),
            Ok(n) => endpoint.read.record_read(n)?,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(DaemonError::Io(e)),
        }
    }
}

fn drain_writes(endpoint: &mut Endpoint) -> DaemonResult<()> {
    while let Some(wbuf) = endpoint.write.front_mut() {
        let fd = wbuf.fd_for_next_send();
        match send_with_optional_fd(&endpoint.stream, wbuf.remaining(), fd) {
            Ok(n) => {
                wbuf.fd_sent();
                wbuf.advance(n);
                if wbuf.is_consumed() {
                    endpoint.write.pop_front();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(DaemonError::Io(e)),
        }
    }
    Ok(())
}

fn sync_endpoint_write_interest(endpoint: &mut Endpoint, reactor: &mut Reactor) {
    let wants_write = !endpoint.write.is_empty();
    if wants_write == endpoint.write_interest {
        return;
    }
    let interest = if wants_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if reactor.reregister(endpoint.token, interest).is_ok() {
        endpoint.write_interest = wants_write;
    }
}

/// `sendmsg(2)` with an optional `SCM_RIGHTS` ancillary fd. Mirrors
/// `build_pdu_wbuf_msg_with_fd`'s control-buffer construction.
fn send_with_optional_fd(stream: &UnixStream, bytes: &[u8], fd: Option<&OwnedFd>) -> io::Result<usize> {
    let raw = stream.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
    let mut cbuf = vec![0u8; cmsg_space];
    if let Some(fd) = fd {
        msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cbuf.len() as _;
        // SAFETY: `msg.msg_control` points at `cbuf`, sized for exactly one
        // `RawFd`-carrying cmsghdr via `CMSG_SPACE` above.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        // SAFETY: `cmsg` is non-null because `msg_controllen` was sized to
        // hold it; writing the header fields and the fd payload stays
        // within the `cbuf` allocation.
        unsafe {
            let cmsg = &mut *cmsg;
            cmsg.cmsg_level = libc::SOL_SOCKET;
            cmsg.cmsg_type = libc::SCM_RIGHTS;
            cmsg.cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
            std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    // SAFETY: `raw` is a valid, open socket fd; `msg` describes a single
    // iovec into `bytes` (which outlives this call) and, when present, one
    // well-formed `SCM_RIGHTS` cmsg into `cbuf` (which also outlives this
    // call).
    let sent = unsafe { libc::sendmsg(raw, &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HalAdapter, TestHal};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_manager() -> Rc<RefCell<ConnectionManager>> {
        let (tasks, _rx) = crate::task_queue::channel().unwrap();
        let hal = Arc::new(HalAdapter::new(Box::new(TestHal::new())));
        Rc::new(RefCell::new(ConnectionManager::new(hal, tasks, 1024)))
    }

    #[test]
    fn outbox_drops_notifications_before_socket_connected() {
        let manager = new_manager();
        let mut reactor = Reactor::new().unwrap();
        {
            let mut m = manager.borrow_mut();
            m.outbox.lock().unwrap().push_back(Pdu::empty(0x01, 0x81));
            m.flush_outbox(&mut reactor);
            assert!(m.notification.is_none());
        }
    }
}
