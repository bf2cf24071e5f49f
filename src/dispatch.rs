//! Service/opcode dispatch: the two fixed-size tables that route a decoded
//! PDU to a handler, plus the Core service that mutates one of them at
//! runtime.
//!
//! There are three tables in the original design; this crate keeps them as
//! data owned by one [`DispatchContext`] per connection rather than as
//! process-wide statics:
//!
//! - `handlers`: which services are *currently* registered, built at
//!   runtime by `REGISTER_MODULE`/`UNREGISTER_MODULE`.
//! - [`REGISTER_FACTORIES`] / [`UNREGISTER_FACTORIES`]: which services
//!   *can* be registered at all, fixed at compile time — one slot per
//!   service id, populated by `services::bt_core` and `services::bt_sock`.
//!
//! Service id `0x00` (Core) is never present in `handlers`; it is handled
//! directly by [`DispatchContext::handle_core`] and can be neither
//! registered nor unregistered through the generic path.

use crate::error::{DaemonError, DaemonResult};
use crate::proto::{is_notification_opcode, Pdu};
use crate::services::{bt_core, bt_sock};

pub const SERVICE_CORE: u8 = 0x00;
pub const SERVICE_BT_CORE: u8 = 0x01;
pub const SERVICE_BT_SOCK: u8 = 0x02;

const OPCODE_REGISTER_MODULE: u8 = 0x01;
const OPCODE_UNREGISTER_MODULE: u8 = 0x02;

/// The reply to a handled command: a response PDU, optionally carrying an
/// fd to pass via `SCM_RIGHTS` (used only by BT-Sock's `LISTEN`/`CONNECT`).
pub struct HandlerResponse {
    pub pdu: Pdu,
    pub attached_fd: Option<std::os::fd::OwnedFd>,
}

impl HandlerResponse {
    pub fn plain(pdu: Pdu) -> Self {
        HandlerResponse { pdu, attached_fd: None }
    }

    pub fn with_fd(pdu: Pdu, fd: std::os::fd::OwnedFd) -> Self {
        HandlerResponse { pdu, attached_fd: Some(fd) }
    }
}

/// A registered service's request handler, closed over whatever state its
/// `REGISTER_MODULE` factory call needed (a HAL handle, a bound notifier).
pub type ServiceHandler = Box<dyn FnMut(&Pdu) -> DaemonResult<HandlerResponse> + Send>;

/// Per-connection collaborators a service needs at registration time:
/// access to the HAL, a way to submit work that must run on the reactor
/// thread, and a sink for unsolicited notifications bound to this
/// connection's notification socket.
#[derive(Clone)]
pub struct ServiceInit {
    pub hal: std::sync::Arc<crate::hal::HalAdapter>,
    pub tasks: crate::task_queue::TaskSender,
    pub send_notification: crate::connection::SendPdu,
}

pub type RegisterFactory = fn(mode: u8, init: &ServiceInit) -> DaemonResult<ServiceHandler>;
pub type UnregisterFactory = fn(&ServiceInit) -> DaemonResult<()>;

/// Compile-time table of which services can be registered and how.
/// Index = service id. Slot 0 (Core) is intentionally left `None`: Core is
/// not registered through this path at all.
pub static REGISTER_FACTORIES: [Option<RegisterFactory>; 256] = {
    let mut table: [Option<RegisterFactory>; 256] = [None; 256];
    table[SERVICE_BT_CORE as usize] = Some(bt_core::register as RegisterFactory);
    table[SERVICE_BT_SOCK as usize] = Some(bt_sock::register as RegisterFactory);
    table
};

/// Compile-time table mirroring `REGISTER_FACTORIES` for teardown.
pub static UNREGISTER_FACTORIES: [Option<UnregisterFactory>; 256] = {
    let mut table: [Option<UnregisterFactory>; 256] = [None; 256];
    table[SERVICE_BT_CORE as usize] = Some(bt_core::unregister as UnregisterFactory);
    table[SERVICE_BT_SOCK as usize] = Some(bt_sock::unregister as UnregisterFactory);
    table
};

/// Owns the runtime handler table for one connection's command socket.
pub struct DispatchContext {
    handlers: Box<[Option<ServiceHandler>; 256]>,
    init: ServiceInit,
}

impl DispatchContext {
    pub fn new(init: ServiceInit) -> Self {
        DispatchContext {
            handlers: Box::new(std::array::from_fn(|_| None)),
            init,
        }
    }

    /// Decodes and routes one inbound command, always returning a PDU to
    /// send back — a handler's own error becomes an error-reply PDU rather
    /// than propagating, since the wire contract has no way to refuse a
    /// reply outright.
    pub fn dispatch(&mut self, pdu: &Pdu) -> HandlerResponse {
        match self.handle_by_service(pdu) {
            Ok(response) => response,
            Err(err) => HandlerResponse::plain(Pdu::error_reply(pdu.service, err.status())),
        }
    }

    fn handle_by_service(&mut self, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
        if is_notification_opcode(pdu.opcode) {
            return Err(DaemonError::Unsupported { service: pdu.service, opcode: pdu.opcode });
        }
        if pdu.service == SERVICE_CORE {
            return self.handle_core(pdu);
        }
        match self.handlers[pdu.service as usize].as_mut() {
            Some(handler) => handler(pdu),
            None => Err(DaemonError::Unsupported { service: pdu.service, opcode: pdu.opcode }),
        }
    }

    fn handle_core(&mut self, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
        match pdu.opcode {
            OPCODE_REGISTER_MODULE => self.register_module(pdu),
            OPCODE_UNREGISTER_MODULE => self.unregister_module(pdu),
            _ => Err(DaemonError::Unsupported { service: SERVICE_CORE, opcode: pdu.opcode }),
        }
    }

    /// `REGISTER_MODULE`: binds a compile-time factory to a runtime slot.
    /// Rejects Core itself, an unknown service id, and re-registration of
    /// an already-bound slot — all three as a plain `Fail`, matching the
    /// native `core_register_module`'s single failure path.
    fn register_module(&mut self, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
        let mut reader = pdu.reader();
        let service = reader.read_u8()?;
        let mode = reader.read_u8()?;
        if service == SERVICE_CORE {
            return Err(DaemonError::StateConflict("core service cannot be registered"));
        }
        if self.handlers[service as usize].is_some() {
            return Err(DaemonError::StateConflict("service already registered"));
        }
        let factory = REGISTER_FACTORIES[service as usize]
            .ok_or(DaemonError::StateConflict("no such service"))?;
        let handler = factory(mode, &self.init)?;
        self.handlers[service as usize] = Some(handler);
        Ok(HandlerResponse::plain(Pdu::empty(pdu.service, pdu.opcode)))
    }

    /// `UNREGISTER_MODULE`: the inverse of [`register_module`](Self::register_module).
    fn unregister_module(&mut self, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
        let mut reader = pdu.reader();
        let service = reader.read_u8()?;
        if service == SERVICE_CORE {
            return Err(DaemonError::StateConflict("core service cannot be unregistered"));
        }
        if self.handlers[service as usize].is_none() {
            return Err(DaemonError::StateConflict("service not registered"));
        }
        let unregister = UNREGISTER_FACTORIES[service as usize]
            .ok_or(DaemonError::StateConflict("no such service"))?;
        unregister(&self.init)?;
        self.handlers[service as usize] = None;
        Ok(HandlerResponse::plain(Pdu::empty(pdu.service, pdu.opcode)))
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<usize> = self
            .handlers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|_| i))
            .collect();
        f.debug_struct("DispatchContext").field("registered_services", &registered).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HalAdapter, TestHal};
    use crate::task_queue;

    fn test_init() -> ServiceInit {
        let (tasks, _rx) = task_queue::channel().unwrap();
        ServiceInit {
            hal: std::sync::Arc::new(HalAdapter::new(Box::new(TestHal::new()))),
            tasks,
            send_notification: std::sync::Arc::new(|_pdu| {}),
        }
    }

    #[test]
    fn unknown_service_is_unsupported() {
        let mut ctx = DispatchContext::new(test_init());
        let pdu = Pdu::new(0x7F, 0x01, Vec::new());
        let response = ctx.dispatch(&pdu);
        assert_eq!(response.pdu.opcode, 0x00);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Unsupported.as_u8()]);
    }

    #[test]
    fn register_then_dispatch_then_unregister() {
        let mut ctx = DispatchContext::new(test_init());
        let register = Pdu::new(SERVICE_CORE, OPCODE_REGISTER_MODULE, vec![SERVICE_BT_CORE, 0x00]);
        let response = ctx.dispatch(&register);
        assert_eq!(response.pdu.payload, Vec::<u8>::new());

        let enable = Pdu::new(SERVICE_BT_CORE, 0x01, Vec::new());
        let response = ctx.dispatch(&enable);
        assert_eq!(response.pdu.opcode, 0x01);

        let unregister = Pdu::new(SERVICE_CORE, OPCODE_UNREGISTER_MODULE, vec![SERVICE_BT_CORE]);
        let response = ctx.dispatch(&unregister);
        assert_eq!(response.pdu.payload, Vec::<u8>::new());

        // Now dispatching to bt-core again is unsupported again.
        let response = ctx.dispatch(&enable);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Unsupported.as_u8()]);
    }

    #[test]
    fn double_registration_fails() {
        let mut ctx = DispatchContext::new(test_init());
        let register = Pdu::new(SERVICE_CORE, OPCODE_REGISTER_MODULE, vec![SERVICE_BT_CORE, 0x00]);
        ctx.dispatch(&register);
        let response = ctx.dispatch(&register);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Fail.as_u8()]);
    }

    #[test]
    fn core_cannot_be_registered_or_unregistered() {
        let mut ctx = DispatchContext::new(test_init());
        let register = Pdu::new(SERVICE_CORE, OPCODE_REGISTER_MODULE, vec![SERVICE_CORE, 0x00]);
        let response = ctx.dispatch(&register);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Fail.as_u8()]);

        let unregister = Pdu::new(SERVICE_CORE, OPCODE_UNREGISTER_MODULE, vec![SERVICE_CORE]);
        let response = ctx.dispatch(&unregister);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Fail.as_u8()]);
    }

    #[test]
    fn notification_opcode_rejected_on_command_path() {
        let mut ctx = DispatchContext::new(test_init());
        let pdu = Pdu::new(SERVICE_BT_CORE, 0x81, Vec::new());
        let response = ctx.dispatch(&pdu);
        assert_eq!(response.pdu.payload, vec![crate::error::Status::Unsupported.as_u8()]);
    }
}
