//! `bluetoothd` binary entry point.
//!
//! Wires the ambient collaborators (configuration, the listening socket, the
//! HAL, the task queue, signal delivery) together and hands them to the
//! reactor. See the `bluetoothd` library for the actual daemon logic.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use mio::Interest;

use bluetoothd::config::Config;
use bluetoothd::connection::ConnectionManager;
use bluetoothd::hal::{HalAdapter, TestHal};
use bluetoothd::reactor::Reactor;
use bluetoothd::signals::SignalPipe;
use bluetoothd::{daemon, task_queue};

fn main() -> Result<()> {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

fn run() -> Result<()> {
    let config = Config::from_env();
    let listener = daemon::bind_listener(&config).context("failed to bind listening socket")?;
    daemon::write_pid_file(&config.pid_file_path()).context("failed to write pid file")?;
    log::info!("listening on {:?}", config.socket_path());

    let hal = Arc::new(HalAdapter::new(Box::new(TestHal::new())));
    let (tasks, task_rx) = task_queue::channel().context("failed to create task queue")?;
    let manager = Rc::new(RefCell::new(ConnectionManager::new(hal, tasks, config.pdu_capacity)));
    let manager_for_tasks = manager.clone();

    let signal_pipe = SignalPipe::install().context("failed to install signal handlers")?;

    let mut reactor = Reactor::new().context("failed to create reactor")?;

    // `Reactor::run`'s `init` is typed `FnMut` even though it only ever runs
    // once; each resource is moved in through an `Option` so the closure
    // still satisfies that bound.
    let mut listener = Some(listener);
    let mut signal_pipe = Some(signal_pipe);
    let mut task_rx = Some(task_rx);

    let run_result = reactor.run(|reactor| {
        let listener = listener.take().expect("init runs exactly once");
        ConnectionManager::register_listener(&manager, reactor, listener)?;

        let mut pipe = signal_pipe.take().expect("init runs exactly once");
        let signal_fd = pipe.as_raw_fd();
        reactor.register(signal_fd, Interest::READABLE, move |reactor, _readiness| {
            if let Err(e) = pipe.drain() {
                log::error!("signal pipe error: {e}");
            }
            log::info!("shutdown signal received");
            reactor.stop();
        })?;

        let mut rx = task_rx.take().expect("init runs exactly once");
        let task_fd = rx.as_raw_fd();
        let manager_for_cb = manager_for_tasks.clone();
        reactor.register(task_fd, Interest::READABLE, move |reactor, _readiness| {
            match rx.drain_all() {
                Ok(_) => manager_for_cb.borrow_mut().flush_outbox(reactor),
                Err(e) => {
                    log::error!("task queue error: {e}");
                    reactor.stop();
                }
            }
        })?;

        Ok(())
    });

    manager.borrow_mut().shutdown(&mut reactor);
    daemon::cleanup_on_shutdown(&config);
    run_result?;
    log::info!("shut down cleanly");
    Ok(())
}
