//! Abstraction over the platform Bluetooth HAL.
//!
//! The real daemon opens a vendor `.so` behind `BT_HARDWARE_MODULE_ID` and
//! talks to it through a fixed vtable of function pointers plus a
//! callback vtable the daemon installs in return. Neither the vendor
//! binary nor its loader has a Rust-idiomatic equivalent worth building, so
//! [`BluetoothHal`] stands in for the native interface and [`HalAdapter`]
//! stands in for the open/close lifecycle around it. [`TestHal`] is the one
//! concrete implementation: a deterministic double used by both the
//! integration tests and, wired up in `main`, the running daemon itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use crate::error::{DaemonError, DaemonResult, Status};
use crate::proto::{BdAddr, BdName, PinCode, Property, Uuid};

/// The fixed set of entry points the BT-Core and BT-Sock services call into.
///
/// Every method returns a [`Status`] synchronously; methods that also
/// produce asynchronous data (property fetches, discovery, bonding) report
/// that data later via the callback vector installed through [`init`].
///
/// [`init`]: BluetoothHal::init
pub trait BluetoothHal: Send + Sync {
    fn init(&self, callbacks: Arc<dyn BluetoothCallbacks>);
    fn cleanup(&self);

    fn enable(&self) -> Status;
    fn disable(&self) -> Status;

    fn get_adapter_properties(&self) -> Status;
    fn get_adapter_property(&self, prop_type: u8) -> Status;
    fn set_adapter_property(&self, property: &Property) -> Status;

    fn get_remote_device_properties(&self, addr: BdAddr) -> Status;
    fn get_remote_device_property(&self, addr: BdAddr, prop_type: u8) -> Status;
    fn set_remote_device_property(&self, addr: BdAddr, property: &Property) -> Status;
    fn get_remote_service_record(&self, addr: BdAddr, uuid: Uuid) -> Status;
    fn get_remote_services(&self, addr: BdAddr) -> Status;

    fn start_discovery(&self) -> Status;
    fn cancel_discovery(&self) -> Status;

    fn create_bond(&self, addr: BdAddr) -> Status;
    fn remove_bond(&self, addr: BdAddr) -> Status;
    fn cancel_bond(&self, addr: BdAddr) -> Status;

    fn pin_reply(&self, addr: BdAddr, accept: u8, pin_len: u8, pin: PinCode) -> Status;
    fn ssp_reply(&self, addr: BdAddr, variant: u8, accept: u8, passkey: u32) -> Status;

    fn dut_mode_configure(&self, enable: u8) -> Status;
    fn dut_mode_send(&self, opcode: u16, payload: &[u8]) -> Status;
    fn le_test_mode(&self, opcode: u16, payload: &[u8]) -> Status;

    /// Stands in for the socket profile sub-interface fetched through
    /// `get_profile_interface(BT_PROFILE_SOCKETS_ID)` in the native API;
    /// modeled here as a second facet of the same trait rather than a
    /// separate fetch, since this crate has exactly one HAL implementation
    /// and no other profile interface is in scope.
    fn socket_listen(
        &self,
        sock_type: u8,
        service_name: &BdName,
        uuid: Uuid,
        channel: u16,
        flags: u8,
    ) -> Result<OwnedFd, Status>;

    fn socket_connect(
        &self,
        addr: BdAddr,
        sock_type: u8,
        uuid: Uuid,
        channel: u16,
        flags: u8,
    ) -> Result<OwnedFd, Status>;
}

/// The callback vtable a HAL implementation invokes — typically from its
/// own worker thread — to report asynchronous results and unsolicited
/// events. Mirrors `bt_callbacks_t`: one method per notification opcode.
pub trait BluetoothCallbacks: Send + Sync {
    fn adapter_state_changed(&self, state: u8);
    fn adapter_properties(&self, status: Status, properties: Vec<Property>);
    fn remote_device_properties(&self, status: Status, addr: BdAddr, properties: Vec<Property>);
    fn device_found(&self, properties: Vec<Property>);
    fn discovery_state_changed(&self, state: u8);
    fn pin_request(&self, addr: BdAddr, name: BdName, class_of_device: u32);
    fn ssp_request(&self, addr: BdAddr, name: BdName, class_of_device: u32, variant: u8, passkey: u32);
    fn bond_state_changed(&self, status: Status, addr: BdAddr, state: u8);
    fn acl_state_changed(&self, status: Status, addr: BdAddr, state: u8);
    fn dut_mode_receive(&self, opcode: u16, payload: Vec<u8>);
    fn le_test_mode(&self, status: Status, num_packets: u16);
}

/// Owns the open/close lifecycle of the HAL. `open` is idempotent and
/// fails if the device is already open, mirroring `init_bt_core`'s
/// module-singleton guard; `close` tears the callback vector down and
/// clears the guard so a later `REGISTER_MODULE` can reopen it.
pub struct HalAdapter {
    opened: AtomicBool,
    hal: Box<dyn BluetoothHal>,
}

impl HalAdapter {
    pub fn new(hal: Box<dyn BluetoothHal>) -> Self {
        HalAdapter { opened: AtomicBool::new(false), hal }
    }

    pub fn open(&self) -> DaemonResult<()> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(DaemonError::StateConflict("bluetooth hal already open"));
        }
        Ok(())
    }

    pub fn close(&self) {
        self.hal.cleanup();
        self.opened.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn hal(&self) -> &dyn BluetoothHal {
        self.hal.as_ref()
    }
}

impl std::fmt::Debug for HalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalAdapter").field("opened", &self.is_open()).finish()
    }
}

/// A deterministic in-process stand-in for the vendor HAL.
///
/// Every command succeeds and, where the native interface would report its
/// result asynchronously, fires the matching callback from a spawned
/// thread — genuinely crossing threads, so the callback path exercises the
/// same task-queue handoff it would against a real HAL.
pub struct TestHal {
    callbacks: Mutex<Option<Arc<dyn BluetoothCallbacks>>>,
}

impl TestHal {
    pub fn new() -> Self {
        TestHal { callbacks: Mutex::new(None) }
    }

    fn fire(&self, f: impl FnOnce(&dyn BluetoothCallbacks) + Send + 'static) {
        let callbacks = self.callbacks.lock().expect("hal callback lock poisoned").clone();
        if let Some(cb) = callbacks {
            thread::spawn(move || f(cb.as_ref()));
        }
    }
}

impl Default for TestHal {
    fn default() -> Self {
        Self::new()
    }
}

impl BluetoothHal for TestHal {
    fn init(&self, callbacks: Arc<dyn BluetoothCallbacks>) {
        *self.callbacks.lock().expect("hal callback lock poisoned") = Some(callbacks);
    }

    fn cleanup(&self) {
        *self.callbacks.lock().expect("hal callback lock poisoned") = None;
    }

    fn enable(&self) -> Status {
        self.fire(|cb| cb.adapter_state_changed(1));
        Status::Success
    }

    fn disable(&self) -> Status {
        self.fire(|cb| cb.adapter_state_changed(0));
        Status::Success
    }

    fn get_adapter_properties(&self) -> Status {
        self.fire(|cb| cb.adapter_properties(Status::Success, Vec::new()));
        Status::Success
    }

    fn get_adapter_property(&self, prop_type: u8) -> Status {
        self.fire(move |cb| {
            cb.adapter_properties(Status::Success, vec![Property { prop_type, value: Vec::new() }])
        });
        Status::Success
    }

    fn set_adapter_property(&self, property: &Property) -> Status {
        let property = property.clone();
        self.fire(move |cb| cb.adapter_properties(Status::Success, vec![property]));
        Status::Success
    }

    fn get_remote_device_properties(&self, addr: BdAddr) -> Status {
        self.fire(move |cb| cb.remote_device_properties(Status::Success, addr, Vec::new()));
        Status::Success
    }

    fn get_remote_device_property(&self, addr: BdAddr, prop_type: u8) -> Status {
        self.fire(move |cb| {
            cb.remote_device_properties(
                Status::Success,
                addr,
                vec![Property { prop_type, value: Vec::new() }],
            )
        });
        Status::Success
    }

    fn set_remote_device_property(&self, addr: BdAddr, property: &Property) -> Status {
        let property = property.clone();
        self.fire(move |cb| cb.remote_device_properties(Status::Success, addr, vec![property]));
        Status::Success
    }

    fn get_remote_service_record(&self, _addr: BdAddr, _uuid: Uuid) -> Status {
        Status::Success
    }

    fn get_remote_services(&self, addr: BdAddr) -> Status {
        self.fire(move |cb| cb.remote_device_properties(Status::Success, addr, Vec::new()));
        Status::Success
    }

    fn start_discovery(&self) -> Status {
        self.fire(|cb| cb.discovery_state_changed(1));
        Status::Success
    }

    fn cancel_discovery(&self) -> Status {
        self.fire(|cb| cb.discovery_state_changed(0));
        Status::Success
    }

    fn create_bond(&self, addr: BdAddr) -> Status {
        self.fire(move |cb| cb.bond_state_changed(Status::Success, addr, 2));
        Status::Success
    }

    fn remove_bond(&self, addr: BdAddr) -> Status {
        self.fire(move |cb| cb.bond_state_changed(Status::Success, addr, 0));
        Status::Success
    }

    fn cancel_bond(&self, addr: BdAddr) -> Status {
        self.fire(move |cb| cb.bond_state_changed(Status::Success, addr, 0));
        Status::Success
    }

    fn pin_reply(&self, _addr: BdAddr, _accept: u8, _pin_len: u8, _pin: PinCode) -> Status {
        Status::Success
    }

    fn ssp_reply(&self, _addr: BdAddr, _variant: u8, _accept: u8, _passkey: u32) -> Status {
        Status::Success
    }

    fn dut_mode_configure(&self, _enable: u8) -> Status {
        Status::Success
    }

    fn dut_mode_send(&self, opcode: u16, payload: &[u8]) -> Status {
        let payload = payload.to_vec();
        self.fire(move |cb| cb.dut_mode_receive(opcode, payload));
        Status::Success
    }

    fn le_test_mode(&self, _opcode: u16, _payload: &[u8]) -> Status {
        self.fire(|cb| cb.le_test_mode(Status::Success, 0));
        Status::Success
    }

    fn socket_listen(
        &self,
        _sock_type: u8,
        _service_name: &BdName,
        _uuid: Uuid,
        _channel: u16,
        _flags: u8,
    ) -> Result<OwnedFd, Status> {
        let (local, _remote) = UnixStream::pair().map_err(|_| Status::NoMem)?;
        Ok(OwnedFd::from(local))
    }

    fn socket_connect(
        &self,
        _addr: BdAddr,
        _sock_type: u8,
        _uuid: Uuid,
        _channel: u16,
        _flags: u8,
    ) -> Result<OwnedFd, Status> {
        let (local, _remote) = UnixStream::pair().map_err(|_| Status::NoMem)?;
        Ok(OwnedFd::from(local))
    }
}
