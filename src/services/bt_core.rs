//! BT-Core service (`0x01`): adapter and remote-device control, bonding,
//! discovery, and DUT/LE test modes, plus the notification path by which
//! HAL callbacks reach the client.
//!
//! Registration opens the HAL (§4.10's idempotent-open guard, enforced by
//! [`crate::hal::HalAdapter::open`]) and installs [`BtCoreCallbacks`] as the
//! stack's callback vector; unregistration tears both down. Every command
//! handler here follows the same shape: decode fixed fields, call the HAL,
//! and on success reply with an empty payload — per §9, the HAL's actual
//! result (adapter properties, discovery results, ...) arrives later as a
//! notification, never inline on the response.

use std::sync::Arc;

use crate::dispatch::{HandlerResponse, ServiceHandler, ServiceInit, SERVICE_BT_CORE};
use crate::error::{DaemonError, DaemonResult};
use crate::hal::{BluetoothCallbacks, HalAdapter};
use crate::proto::{BdAddr, BdName, Pdu, PduWriter, Property, Uuid};
use crate::task_queue::TaskSender;

const OP_ENABLE: u8 = 0x01;
const OP_DISABLE: u8 = 0x02;
const OP_GET_ADAPTER_PROPERTIES: u8 = 0x03;
const OP_GET_ADAPTER_PROPERTY: u8 = 0x04;
const OP_SET_ADAPTER_PROPERTY: u8 = 0x05;
const OP_GET_REMOTE_DEVICE_PROPERTIES: u8 = 0x06;
const OP_GET_REMOTE_DEVICE_PROPERTY: u8 = 0x07;
const OP_SET_REMOTE_DEVICE_PROPERTY: u8 = 0x08;
const OP_GET_REMOTE_SERVICE_RECORD: u8 = 0x09;
const OP_GET_REMOTE_SERVICES: u8 = 0x0a;
const OP_START_DISCOVERY: u8 = 0x0b;
const OP_CANCEL_DISCOVERY: u8 = 0x0c;
const OP_CREATE_BOND: u8 = 0x0d;
const OP_REMOVE_BOND: u8 = 0x0e;
const OP_CANCEL_BOND: u8 = 0x0f;
const OP_PIN_REPLY: u8 = 0x10;
const OP_SSP_REPLY: u8 = 0x11;
const OP_DUT_MODE_CONFIGURE: u8 = 0x12;
const OP_DUT_MODE_SEND: u8 = 0x13;
const OP_LE_TEST_MODE: u8 = 0x14;

const NOTIFY_ADAPTER_STATE_CHANGED: u8 = 0x81;
const NOTIFY_ADAPTER_PROPERTIES_CHANGED: u8 = 0x82;
const NOTIFY_REMOTE_DEVICE_PROPERTIES: u8 = 0x83;
const NOTIFY_DEVICE_FOUND: u8 = 0x84;
const NOTIFY_DISCOVERY_STATE_CHANGED: u8 = 0x85;
const NOTIFY_PIN_REQUEST: u8 = 0x86;
const NOTIFY_SSP_REQUEST: u8 = 0x87;
const NOTIFY_BOND_STATE_CHANGED: u8 = 0x88;
const NOTIFY_ACL_STATE_CHANGED: u8 = 0x89;
const NOTIFY_DUT_MODE_RECEIVE: u8 = 0x8a;
const NOTIFY_LE_TEST_MODE: u8 = 0x8b;

/// `REGISTER_MODULE(BT_CORE, mode)` factory. `mode` is accepted but unused:
/// the native `init_bt_core` takes a callback-thread mode flag the test
/// double has no use for, and nothing downstream branches on it.
pub fn register(_mode: u8, init: &ServiceInit) -> DaemonResult<ServiceHandler> {
    init.hal.open()?;
    let callbacks: Arc<dyn BluetoothCallbacks> = Arc::new(BtCoreCallbacks {
        tasks: init.tasks.clone(),
        send_notification: init.send_notification.clone(),
    });
    init.hal.hal().init(callbacks);
    let hal = init.hal.clone();
    Ok(Box::new(move |pdu: &Pdu| handle(&hal, pdu)))
}

/// `UNREGISTER_MODULE(BT_CORE)`: tears the callback vector down and closes
/// the HAL, clearing the open guard so a later `REGISTER_MODULE` can reopen
/// it.
pub fn unregister(init: &ServiceInit) -> DaemonResult<()> {
    init.hal.close();
    Ok(())
}

fn handle(hal: &Arc<HalAdapter>, pdu: &Pdu) -> DaemonResult<HandlerResponse> {
    let mut r = pdu.reader();
    let status = match pdu.opcode {
        OP_ENABLE => hal.hal().enable(),
        OP_DISABLE => hal.hal().disable(),
        OP_GET_ADAPTER_PROPERTIES => hal.hal().get_adapter_properties(),
        OP_GET_ADAPTER_PROPERTY => {
            let prop_type = r.read_u8()?;
            hal.hal().get_adapter_property(prop_type)
        }
        OP_SET_ADAPTER_PROPERTY => {
            let property = r.read_property()?;
            hal.hal().set_adapter_property(&property)
        }
        OP_GET_REMOTE_DEVICE_PROPERTIES => {
            let addr = r.read_bdaddr()?;
            hal.hal().get_remote_device_properties(addr)
        }
        OP_GET_REMOTE_DEVICE_PROPERTY => {
            let addr = r.read_bdaddr()?;
            let prop_type = r.read_u8()?;
            hal.hal().get_remote_device_property(addr, prop_type)
        }
        OP_SET_REMOTE_DEVICE_PROPERTY => {
            let addr = r.read_bdaddr()?;
            let property = r.read_property()?;
            hal.hal().set_remote_device_property(addr, &property)
        }
        OP_GET_REMOTE_SERVICE_RECORD => {
            let addr = r.read_bdaddr()?;
            let uuid = r.read_uuid()?;
            hal.hal().get_remote_service_record(addr, uuid)
        }
        OP_GET_REMOTE_SERVICES => {
            let addr = r.read_bdaddr()?;
            hal.hal().get_remote_services(addr)
        }
        OP_START_DISCOVERY => hal.hal().start_discovery(),
        OP_CANCEL_DISCOVERY => hal.hal().cancel_discovery(),
        OP_CREATE_BOND => {
            let addr = r.read_bdaddr()?;
            hal.hal().create_bond(addr)
        }
        OP_REMOVE_BOND => {
            let addr = r.read_bdaddr()?;
            hal.hal().remove_bond(addr)
        }
        OP_CANCEL_BOND => {
            let addr = r.read_bdaddr()?;
            hal.hal().cancel_bond(addr)
        }
        OP_PIN_REPLY => {
            let addr = r.read_bdaddr()?;
            let accept = r.read_u8()?;
            let pin_len = r.read_u8()?;
            let pin = r.read_pincode()?;
            hal.hal().pin_reply(addr, accept, pin_len, pin)
        }
        OP_SSP_REPLY => {
            let addr = r.read_bdaddr()?;
            let variant = r.read_u8()?;
            let accept = r.read_u8()?;
            let passkey = r.read_u32()?;
            hal.hal().ssp_reply(addr, variant, accept, passkey)
        }
        OP_DUT_MODE_CONFIGURE => {
            let enable = r.read_u8()?;
            hal.hal().dut_mode_configure(enable)
        }
        OP_DUT_MODE_SEND => {
            let opcode = r.read_u16()?;
            let payload = r.read_mem(r.remaining())?;
            hal.hal().dut_mode_send(opcode, payload)
        }
        OP_LE_TEST_MODE => {
            let opcode = r.read_u16()?;
            let payload = r.read_mem(r.remaining())?;
            hal.hal().le_test_mode(opcode, payload)
        }
        _ => {
            return Err(DaemonError::Unsupported { service: SERVICE_BT_CORE, opcode: pdu.opcode });
        }
    };
    if status.is_success() {
        Ok(HandlerResponse::plain(Pdu::empty(pdu.service, pdu.opcode)))
    } else {
        Err(DaemonError::Hal(status))
    }
}

/// Translates HAL callback invocations — which run on a HAL-owned thread —
/// into notification PDUs submitted through the task queue. This is the
/// system's one concurrency boundary: everything here runs off the reactor
/// thread and must not touch a socket directly.
struct BtCoreCallbacks {
    tasks: TaskSender,
    send_notification: crate::connection::SendPdu,
}

impl BtCoreCallbacks {
    fn emit(&self, opcode: u8, payload: Vec<u8>) {
        let pdu = Pdu::new(SERVICE_BT_CORE, opcode, payload);
        let send_notification = self.send_notification.clone();
        if let Err(e) = self.tasks.submit(move || send_notification(pdu)) {
            log::warn!("dropping bt-core notification {opcode:#04x}: {e}");
        }
    }
}

impl BluetoothCallbacks for BtCoreCallbacks {
    fn adapter_state_changed(&self, state: u8) {
        let mut w = PduWriter::new();
        w.append_u8(state);
        self.emit(NOTIFY_ADAPTER_STATE_CHANGED, w.into_payload());
    }

    fn adapter_properties(&self, status: crate::error::Status, properties: Vec<Property>) {
        let mut w = PduWriter::new();
        w.append_u8(status.as_u8());
        w.append_property_list(&properties);
        self.emit(NOTIFY_ADAPTER_PROPERTIES_CHANGED, w.into_payload());
    }

    fn remote_device_properties(
        &self,
        status: crate::error::Status,
        addr: BdAddr,
        properties: Vec<Property>,
    ) {
        let mut w = PduWriter::new();
        w.append_u8(status.as_u8());
        w.append_bdaddr(&addr);
        w.append_property_list(&properties);
        self.emit(NOTIFY_REMOTE_DEVICE_PROPERTIES, w.into_payload());
    }

    fn device_found(&self, properties: Vec<Property>) {
        let mut w = PduWriter::new();
        w.append_property_list(&properties);
        self.emit(NOTIFY_DEVICE_FOUND, w.into_payload());
    }

    fn discovery_state_changed(&self, state: u8) {
        let mut w = PduWriter::new();
        w.append_u8(state);
        self.emit(NOTIFY_DISCOVERY_STATE_CHANGED, w.into_payload());
    }

    fn pin_request(&self, addr: BdAddr, name: BdName, class_of_device: u32) {
        let mut w = PduWriter::new();
        w.append_bdaddr(&addr);
        w.append_bdname(&name);
        w.append_u32(class_of_device);
        self.emit(NOTIFY_PIN_REQUEST, w.into_payload());
    }

    fn ssp_request(
        &self,
        addr: BdAddr,
        name: BdName,
        class_of_device: u32,
        variant: u8,
        passkey: u32,
    ) {
        let mut w = PduWriter::new();
        w.append_bdaddr(&addr);
        w.append_bdname(&name);
        w.append_u32(class_of_device);
        w.append_u8(variant);
        w.append_u32(passkey);
        self.emit(NOTIFY_SSP_REQUEST, w.into_payload());
    }

    fn bond_state_changed(&self, status: crate::error::Status, addr: BdAddr, state: u8) {
        let mut w = PduWriter::new();
        w.append_u8(status.as_u8());
        w.append_bdaddr(&addr);
        w.append_u8(state);
        self.emit(NOTIFY_BOND_STATE_CHANGED, w.into_payload());
    }

    fn acl_state_changed(&self, status: crate::error::Status, addr: BdAddr, state: u8) {
        let mut w = PduWriter::new();
        w.append_u8(status.as_u8());
        w.append_bdaddr(&addr);
        w.append_u8(state);
        self.emit(NOTIFY_ACL_STATE_CHANGED, w.into_payload());
    }

    fn dut_mode_receive(&self, opcode: u16, payload: Vec<u8>) {
        let mut w = PduWriter::new();
        w.append_u16(opcode);
        w.append_mem(&payload);
        self.emit(NOTIFY_DUT_MODE_RECEIVE, w.into_payload());
    }

    fn le_test_mode(&self, status: crate::error::Status, num_packets: u16) {
        let mut w = PduWriter::new();
        w.append_u8(status.as_u8());
        w.append_u16(num_packets);
        self.emit(NOTIFY_LE_TEST_MODE, w.into_payload());
    }
}
