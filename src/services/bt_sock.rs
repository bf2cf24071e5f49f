//! BT-Sock service (`0x02`): `LISTEN`/`CONNECT` against the stack's socket
//! profile, both returning a stack-owned file descriptor via `SCM_RIGHTS`
//! rather than any payload field.

use std::sync::Arc;

use crate::dispatch::{HandlerResponse, ServiceHandler, ServiceInit, SERVICE_BT_SOCK};
use crate::error::{DaemonError, DaemonResult};
use crate::hal::HalAdapter;
use crate::proto::Pdu;

const OP_LISTEN: u8 = 0x01;
const OP_CONNECT: u8 = 0x02;

pub fn register(_mode: u8, init: &ServiceInit) -> DaemonResult<ServiceHandler> {
    let hal = init.hal.clone();
    Ok(Box::new(move |pdu: &Pdu| handle(&hal, pdu)))
}

/// Nothing to tear down: BT-Sock holds no state of its own beyond the
/// shared HAL handle, which BT-Core's registration owns the lifecycle of.
pub fn unregister(_init: &ServiceInit) -> DaemonResult<()> {
    Ok(())
}

fn handle(hal: &Arc<HalAdapter>, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
    match pdu.opcode {
        OP_LISTEN => {
            let mut r = pdu.reader();
            let sock_type = r.read_u8()?;
            let name = r.read_bdname()?;
            let uuid = r.read_uuid()?;
            let channel = r.read_u16()?;
            let flags = r.read_u8()?;
            let fd = hal
                .hal()
                .socket_listen(sock_type, &name, uuid, channel, flags)
                .map_err(DaemonError::Hal)?;
            Ok(HandlerResponse::with_fd(Pdu::empty(pdu.service, pdu.opcode), fd))
        }
        OP_CONNECT => {
            let mut r = pdu.reader();
            let addr = r.read_bdaddr()?;
            let sock_type = r.read_u8()?;
            let uuid = r.read_uuid()?;
            let channel = r.read_u16()?;
            let flags = r.read_u8()?;
            let fd = hal
                .hal()
                .socket_connect(addr, sock_type, uuid, channel, flags)
                .map_err(DaemonError::Hal)?;
            Ok(HandlerResponse::with_fd(Pdu::empty(pdu.service, pdu.opcode), fd))
        }
        _ => Err(DaemonError::Unsupported { service: SERVICE_BT_SOCK, opcode: pdu.opcode }),
    }
}
