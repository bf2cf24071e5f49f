//! Fixed-capacity read and write accumulation buffers for one socket.
//!
//! A [`ReadBuffer`] accumulates bytes until a full PDU header, then a full
//! PDU, is present; a [`WriteBuffer`] holds one already-encoded PDU (plus an
//! optional ancillary fd) and tracks how much of it has been written.

use std::os::fd::OwnedFd;

use crate::error::{DaemonError, DaemonResult};
use crate::proto::{Pdu, HEADER_LEN};

/// Accumulates inbound bytes for one connection until a full PDU is framed.
///
/// Capacity is fixed at construction: `HEADER_LEN + payload_capacity`. The
/// declared payload length is validated exactly once, the instant the
/// header completes — not on every subsequent call — so a malicious or
/// corrupt declared length is rejected before it can ever be used to size a
/// slice, rather than being re-checked (and re-trusted) on each read.
pub struct ReadBuffer {
    bytes: Vec<u8>,
    filled: usize,
    payload_capacity: usize,
    declared_len: Option<usize>,
}

impl ReadBuffer {
    pub fn new(payload_capacity: usize) -> Self {
        ReadBuffer {
            bytes: vec![0u8; HEADER_LEN + payload_capacity],
            filled: 0,
            payload_capacity,
            declared_len: None,
        }
    }

    pub fn has_header(&self) -> bool {
        self.filled >= HEADER_LEN
    }

    pub fn has_full_pdu(&self) -> bool {
        match self.declared_len {
            Some(len) => self.filled >= HEADER_LEN + len,
            None => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.filled >= self.bytes.len()
    }

    /// The slice a `read(2)` should fill next.
    pub fn target_mut(&mut self) -> &mut [u8] {
        let end = match self.declared_len {
            Some(len) => HEADER_LEN + len,
            None => HEADER_LEN,
        };
        &mut self.bytes[self.filled..end]
    }

    /// Records that `n` more bytes landed in the slice returned by
    /// `target_mut`. Validates the declared length the moment the header
    /// completes.
    pub fn record_read(&mut self, n: usize) -> DaemonResult<()> {
        self.filled += n;
        if self.declared_len.is_none() && self.filled >= HEADER_LEN {
            let (_, _, len) = Pdu::decode_header(&self.bytes[..HEADER_LEN]);
            let len = len as usize;
            if len > self.payload_capacity {
                return Err(DaemonError::Malformed("declared PDU length exceeds capacity"));
            }
            self.declared_len = Some(len);
        }
        Ok(())
    }

    /// Decodes the accumulated bytes into a [`Pdu`] and resets the buffer
    /// for the next frame. Panics if called before [`has_full_pdu`] — a
    /// caller bug, not a wire condition.
    pub fn take_pdu(&mut self) -> DaemonResult<Pdu> {
        debug_assert!(self.has_full_pdu());
        let len = self.declared_len.expect("take_pdu called before header complete");
        let pdu = Pdu::decode(&self.bytes[..HEADER_LEN + len])?;
        self.filled = 0;
        self.declared_len = None;
        Ok(pdu)
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("filled", &self.filled)
            .field("declared_len", &self.declared_len)
            .field("capacity", &self.bytes.len())
            .finish()
    }
}

/// One encoded PDU awaiting transmission, with an optional fd to pass via
/// `SCM_RIGHTS` alongside the first byte written.
pub struct WriteBuffer {
    bytes: Vec<u8>,
    cursor: usize,
    attached_fd: Option<OwnedFd>,
}

impl WriteBuffer {
    pub fn new(pdu: &Pdu) -> Self {
        WriteBuffer { bytes: pdu.encode(), cursor: 0, attached_fd: None }
    }

    pub fn with_fd(pdu: &Pdu, fd: OwnedFd) -> Self {
        WriteBuffer { bytes: pdu.encode(), cursor: 0, attached_fd: Some(fd) }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    pub fn is_consumed(&self) -> bool {
        self.cursor >= self.bytes.len()
    }

    pub fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    /// The fd to pass via `SCM_RIGHTS` on the *next* `sendmsg` call, if any
    /// is attached and this is the first attempt at sending this buffer.
    /// A non-blocking `sendmsg` either transfers the fd on this call or
    /// fails with nothing sent, so "first attempt" is exactly "cursor still
    /// at zero" — no separate retry bookkeeping is needed.
    pub fn fd_for_next_send(&self) -> Option<&OwnedFd> {
        if self.cursor == 0 {
            self.attached_fd.as_ref()
        } else {
            None
        }
    }

    /// Marks the attached fd as sent: the kernel has already duplicated it
    /// into the peer's fd table via the ancillary data on the call just
    /// made, so this endpoint's copy is released.
    pub fn fd_sent(&mut self) {
        self.attached_fd = None;
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("remaining", &self.remaining().len())
            .field("has_fd", &self.attached_fd.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Pdu;

    #[test]
    fn accumulates_header_then_payload() {
        let mut rbuf = ReadBuffer::new(1024);
        let pdu = Pdu::new(0x01, 0x02, vec![0xAA, 0xBB, 0xCC]);
        let encoded = pdu.encode();
        assert!(!rbuf.has_header());
        rbuf.target_mut()[..HEADER_LEN].copy_from_slice(&encoded[..HEADER_LEN]);
        rbuf.record_read(HEADER_LEN).unwrap();
        assert!(rbuf.has_header());
        assert!(!rbuf.has_full_pdu());
        let rest = &encoded[HEADER_LEN..];
        rbuf.target_mut().copy_from_slice(rest);
        rbuf.record_read(rest.len()).unwrap();
        assert!(rbuf.has_full_pdu());
        let decoded = rbuf.take_pdu().unwrap();
        assert_eq!(decoded.service, 0x01);
        assert_eq!(decoded.opcode, 0x02);
        assert_eq!(decoded.payload, vec![0xAA, 0xBB, 0xCC]);
        assert!(!rbuf.has_header());
    }

    #[test]
    fn rejects_declared_length_over_capacity() {
        let mut rbuf = ReadBuffer::new(4);
        let header = [0x01, 0x02, 0xFF, 0x00]; // declares 255 bytes, capacity is 4
        rbuf.target_mut()[..HEADER_LEN].copy_from_slice(&header);
        let err = rbuf.record_read(HEADER_LEN).unwrap_err();
        assert!(matches!(err, DaemonError::Malformed(_)));
    }

    #[test]
    fn write_buffer_drains_incrementally() {
        let pdu = Pdu::new(0x01, 0x02, vec![1, 2, 3]);
        let mut wbuf = WriteBuffer::new(&pdu);
        assert!(!wbuf.is_consumed());
        let total = wbuf.remaining().len();
        wbuf.advance(total - 1);
        assert!(!wbuf.is_consumed());
        wbuf.advance(1);
        assert!(wbuf.is_consumed());
    }

    #[test]
    fn write_buffer_fd_only_rides_along_on_first_send() {
        let pdu = Pdu::empty(0x02, 0x01);
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = std::os::fd::OwnedFd::from(a);
        let mut wbuf = WriteBuffer::with_fd(&pdu, fd);
        assert!(wbuf.fd_for_next_send().is_some());
        wbuf.fd_sent();
        assert!(wbuf.fd_for_next_send().is_none());
        wbuf.advance(1);
        assert!(wbuf.fd_for_next_send().is_none());
    }
}
