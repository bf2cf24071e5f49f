//! Wire-level status taxonomy and internal error types.
//!
//! `Status` is the byte that travels over the wire in an error-reply PDU
//! (see `proto::dispatch`). It mirrors the native Bluetooth interface's own
//! status codes rather than Rust's own error conventions, so it is kept
//! separate from `anyhow::Error`, which is reserved for process-boundary
//! failures (bind, PID file, HAL open) that never reach a client socket.

/// Status codes mirroring the native Bluetooth interface's `bt_status_t`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("success")]
    Success = 0,
    #[error("fail")]
    Fail = 1,
    #[error("not ready")]
    NotReady = 2,
    #[error("no memory")]
    NoMem = 3,
    #[error("busy")]
    Busy = 4,
    #[error("done")]
    Done = 5,
    #[error("unsupported")]
    Unsupported = 6,
    #[error("invalid parameter")]
    ParmInvalid = 7,
    #[error("unhandled")]
    Unhandled = 8,
    #[error("auth failure")]
    AuthFailure = 9,
    #[error("remote device down")]
    RmtDevDown = 10,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Internal failure taxonomy distinguishing decode/dispatch failures from
/// the `Status` byte that is ultimately sent to the client. Every variant
/// maps onto exactly one `Status` via [`DaemonError::status`].
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("malformed pdu: {0}")]
    Malformed(&'static str),

    #[error("no handler for service {service:#04x} opcode {opcode:#04x}")]
    Unsupported { service: u8, opcode: u8 },

    #[error("resource allocation failed: {0}")]
    Resource(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hal error: {0:?}")]
    Hal(Status),

    #[error("state conflict: {0}")]
    StateConflict(&'static str),
}

impl DaemonError {
    /// The wire status this error is reported to the client as.
    pub fn status(&self) -> Status {
        match self {
            DaemonError::Malformed(_) => Status::ParmInvalid,
            DaemonError::Unsupported { .. } => Status::Unsupported,
            DaemonError::Resource(_) => Status::NoMem,
            DaemonError::Io(_) => Status::Fail,
            DaemonError::Hal(status) => *status,
            DaemonError::StateConflict(_) => Status::Fail,
        }
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
