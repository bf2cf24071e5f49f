//! Core library for `bluetoothd`: a user-space daemon that brokers a single
//! client's access to a platform Bluetooth HAL over a framed PDU protocol on
//! a pair of Unix-domain sockets.
//!
//! `main` is a thin binary entry point; everything else — the reactor, the
//! wire codec, the connection and dispatch machinery, the concrete BT-Core
//! and BT-Sock services, and the HAL abstraction — lives here so it can be
//! exercised directly by the integration tests under `tests/`.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod hal;
pub mod proto;
pub mod reactor;
pub mod services;
pub mod signals;
pub mod task_queue;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{DaemonError, DaemonResult, Status};
pub use hal::{BluetoothCallbacks, BluetoothHal, HalAdapter, TestHal};
pub use reactor::Reactor;
pub use signals::SignalPipe;
