//! Cross-thread handoff from HAL callback threads into the reactor thread.
//!
//! The platform HAL invokes its callbacks on threads the daemon does not
//! own. Those threads must never touch a socket, a send queue, or a
//! dispatch table directly — the only thing they are allowed to do is drop
//! a closure into this queue. The queue is a plain pipe: a pointer-sized
//! write is atomic up to `PIPE_BUF`, so concurrent submissions from
//! multiple foreign threads never interleave, and the reactor thread is the
//! only reader.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::{DaemonError, DaemonResult};

/// A unit of work submitted from a foreign thread, run on the reactor thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The write end of the task pipe. Cheaply cloned and handed to every HAL
/// callback thread that needs to reach back into the reactor.
#[derive(Clone)]
pub struct TaskSender {
    write_fd: Arc<OwnedFd>,
}

/// The read end of the task pipe. Owned by the reactor; never cloned.
pub struct TaskReceiver {
    read_fd: OwnedFd,
    partial: Vec<u8>,
}

/// Creates a connected pipe pair for the task queue.
pub fn channel() -> DaemonResult<(TaskSender, TaskReceiver)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid pointer to two `RawFd` slots, the only
    // output `pipe(2)` writes to on success.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(DaemonError::Io(io::Error::last_os_error()));
    }
    // SAFETY: both fds were just returned by `pipe(2)` and are owned here.
    let (read_fd, write_fd) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking(&read_fd)?;
    Ok((
        TaskSender { write_fd: Arc::new(write_fd) },
        TaskReceiver { read_fd, partial: Vec::new() },
    ))
}

fn set_nonblocking(fd: &OwnedFd) -> DaemonResult<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid, open fd for the duration of this call.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(DaemonError::Io(io::Error::last_os_error()));
    }
    // SAFETY: same fd, setting flags returned above plus O_NONBLOCK.
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(DaemonError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

impl TaskSender {
    /// Boxes `f` and writes its address into the pipe in a single syscall.
    ///
    /// `Box<dyn FnOnce() + Send>` is itself a fat pointer (data + vtable),
    /// too wide for an atomic pipe write, so the closure is boxed a second
    /// time: `Box::into_raw` on the outer box yields a thin, pointer-sized
    /// address that fits in one `PIPE_BUF`-guaranteed write.
    pub fn submit<F>(&self, f: F) -> DaemonResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed: Task = Box::new(f);
        let double_boxed: Box<Task> = Box::new(boxed);
        let ptr = Box::into_raw(double_boxed) as usize;
        let bytes = ptr.to_ne_bytes();
        debug_assert!(bytes.len() <= libc::PIPE_BUF as usize);
        let raw = self.write_fd.as_raw_fd();
        // SAFETY: `bytes` is a valid `POINTER_SIZE`-byte buffer; `raw` is
        // open for the lifetime of `self`.
        let written = unsafe { libc::write(raw, bytes.as_ptr() as *const _, bytes.len()) };
        if written == bytes.len() as isize {
            return Ok(());
        }
        // Reclaim the box so a short or failed write never leaks it.
        // SAFETY: `ptr` was produced by the `Box::into_raw` call above and
        // has not been freed, since the write did not fully succeed.
        drop(unsafe { Box::from_raw(ptr as *mut Task) });
        if written < 0 {
            Err(DaemonError::Io(io::Error::last_os_error()))
        } else {
            Err(DaemonError::Resource("short write on task queue pipe"))
        }
    }
}

impl TaskReceiver {
    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Drains every task currently queued, running each to completion in
    /// submission order. Returns the number of tasks run.
    ///
    /// Called from the reactor's readability callback for the pipe; reads
    /// until `EAGAIN`, so one readiness event drains an arbitrary backlog
    /// rather than requiring one event per task.
    pub fn drain_all(&mut self) -> DaemonResult<usize> {
        let mut count = 0;
        loop {
            match self.read_one()? {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return Ok(count),
            }
        }
    }

    fn read_one(&mut self) -> DaemonResult<Option<Task>> {
        while self.partial.len() < POINTER_SIZE {
            let mut byte = [0u8; 1];
            let raw = self.read_fd.as_raw_fd();
            // SAFETY: `byte` is a valid 1-byte buffer; `raw` is open for
            // the lifetime of `self`.
            let n = unsafe { libc::read(raw, byte.as_mut_ptr() as *mut _, 1) };
            if n == 1 {
                self.partial.push(byte[0]);
                continue;
            }
            if n == 0 {
                return Err(DaemonError::Resource("task queue pipe closed"));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(DaemonError::Io(err));
        }
        let mut bytes = [0u8; POINTER_SIZE];
        bytes.copy_from_slice(&self.partial);
        self.partial.clear();
        let ptr = usize::from_ne_bytes(bytes) as *mut Task;
        // SAFETY: `ptr` was produced by `Box::into_raw` in `submit` and is
        // read back exactly once, reconstructing ownership of the box.
        let boxed = unsafe { Box::from_raw(ptr) };
        Ok(Some(*boxed))
    }
}

impl std::fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSender").field("write_fd", &self.write_fd.as_raw_fd()).finish()
    }
}

impl std::fmt::Debug for TaskReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReceiver").field("read_fd", &self.read_fd.as_raw_fd()).finish()
    }
}

use std::os::fd::FromRawFd;
