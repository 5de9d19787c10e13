// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns guest doorbell writes into device callbacks on a dedicated thread.
//!
//! Each binding couples a KVM ioeventfd, matched on a guest address and a 2 byte value, with
//! a subscriber. The dispatcher thread waits on every bound eventfd plus the shutdown signal
//! and runs the subscriber of whichever eventfd fires. Bindings are never removed: they live
//! as long as the VM.

use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use slab::Slab;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::logger::{IncMetric, METRICS, debug, error, info};
use crate::utils::{ShutdownSignal, usize_to_u64};
use crate::vstate::vm::{GuestIoAddress, VmError, VmOps};

/// Maximum number of events handled per wake up.
pub const IOEVENT_MAX_EVENTS: usize = 32;
/// Epoll token of the shutdown signal.
const STOP_TOKEN: u64 = u64::MAX;

/// Errors of the event dispatcher.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum IoEventError {
    /// Cannot create the doorbell eventfd: {0}
    EventFd(io::Error),
    /// Cannot add a file descriptor to the dispatcher epoll: {0}
    Epoll(io::Error),
    /// Cannot bind the doorbell: {0}
    Vm(#[from] VmError),
    /// Failed to wait for events: {0}
    Wait(io::Error),
    /// Cannot spawn the dispatcher thread: {0}
    Spawn(io::Error),
}

/// Receives the doorbell notifications of one binding.
pub trait IoEventSubscriber: Send {
    /// Called on the dispatcher thread each time the bound doorbell rings.
    fn notify(&mut self);
}

struct Binding {
    evt: EventFd,
    addr: GuestIoAddress,
    datamatch: u16,
    handler: Arc<Mutex<dyn IoEventSubscriber>>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("fd", &self.evt.as_raw_fd())
            .field("addr", &self.addr)
            .field("datamatch", &self.datamatch)
            .finish()
    }
}

/// Owner of the doorbell bindings and of the thread servicing them.
pub struct IoEventDispatcher {
    epoll: Epoll,
    bindings: Mutex<Slab<Binding>>,
    shutdown: ShutdownSignal,
}

impl fmt::Debug for IoEventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoEventDispatcher")
            .field("bindings", &self.bindings)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl IoEventDispatcher {
    /// Creates a dispatcher which stops once `shutdown` is triggered.
    pub fn new(shutdown: ShutdownSignal) -> Result<Self, IoEventError> {
        let epoll = Epoll::new().map_err(IoEventError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                shutdown.as_raw_fd(),
                EpollEvent::new(EventSet::IN, STOP_TOKEN),
            )
            .map_err(IoEventError::Epoll)?;
        Ok(IoEventDispatcher {
            epoll,
            bindings: Mutex::new(Slab::new()),
            shutdown,
        })
    }

    /// Number of registered bindings.
    pub fn len(&self) -> usize {
        self.bindings.lock().expect("Poisoned lock").len()
    }

    /// Whether no binding was registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binds guest writes of `datamatch` at `addr` to `handler`.
    ///
    /// Can be called while the dispatcher thread is running. The kernel binding is made last,
    /// so on failure no guest write is diverted to an eventfd nobody polls.
    pub fn register(
        &self,
        vm: &dyn VmOps,
        addr: GuestIoAddress,
        datamatch: u16,
        handler: Arc<Mutex<dyn IoEventSubscriber>>,
    ) -> Result<(), IoEventError> {
        let evt = EventFd::new(libc::EFD_NONBLOCK).map_err(IoEventError::EventFd)?;
        let fd = evt.as_raw_fd();

        let mut bindings = self.bindings.lock().expect("Poisoned lock");
        let entry = bindings.vacant_entry();
        let key = entry.key();

        if let Err(err) =
            self.epoll
                .ctl(ControlOperation::Add, fd, EpollEvent::new(EventSet::IN, usize_to_u64(key)))
        {
            METRICS.ioevent.event_fails.inc();
            return Err(IoEventError::Epoll(err));
        }

        if let Err(err) = vm.register_ioevent(&evt, addr, datamatch) {
            if let Err(del_err) = self.epoll.ctl(ControlOperation::Delete, fd, EpollEvent::default())
            {
                error!("ioevent: cannot unwatch fd {fd}: {}", del_err);
            }
            METRICS.ioevent.event_fails.inc();
            return Err(IoEventError::Vm(err));
        }

        entry.insert(Binding {
            evt,
            addr,
            datamatch,
            handler,
        });
        METRICS.ioevent.registration_count.inc();
        debug!("ioevent: bound {addr:?} == {datamatch} to fd {fd}");
        Ok(())
    }

    /// Spawns the dispatcher thread.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, IoEventError> {
        let dispatcher = Arc::clone(self);
        thread::Builder::new()
            .name("vmm_ioevent".to_string())
            .spawn(move || {
                if let Err(err) = dispatcher.run() {
                    error!("ioevent: dispatcher stopped: {}", err);
                }
            })
            .map_err(IoEventError::Spawn)
    }

    /// Services doorbells until the shutdown signal is triggered.
    pub fn run(&self) -> Result<(), IoEventError> {
        let mut events = vec![EpollEvent::default(); IOEVENT_MAX_EVENTS];
        loop {
            let count = match self.epoll.wait(-1, &mut events) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    METRICS.ioevent.event_fails.inc();
                    return Err(IoEventError::Wait(err));
                }
            };

            for event in &events[..count] {
                if event.data() == STOP_TOKEN {
                    info!("ioevent: shutting down");
                    return Ok(());
                }
                self.dispatch(event.data());
            }

            // A shutdown may be pending behind a busy doorbell.
            if self.shutdown.is_triggered() {
                info!("ioevent: shutting down");
                return Ok(());
            }
        }
    }

    fn dispatch(&self, token: u64) {
        let handler = {
            let bindings = self.bindings.lock().expect("Poisoned lock");
            let Some(binding) = usize::try_from(token).ok().and_then(|key| bindings.get(key))
            else {
                error!("ioevent: event for unknown binding {token}");
                METRICS.ioevent.event_fails.inc();
                return;
            };
            match binding.evt.read() {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("ioevent: failed to drain {:?}: {}", binding.addr, err);
                    METRICS.ioevent.event_fails.inc();
                    return;
                }
            }
            Arc::clone(&binding.handler)
        };

        METRICS.ioevent.notification_count.inc();
        handler.lock().expect("Poisoned lock").notify();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::vstate::vm::tests::FakeVm;

    struct Counter(Arc<AtomicUsize>);

    impl IoEventSubscriber for Counter {
        fn notify(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    // Counts the fds of the dispatcher epoll set from its fdinfo entry.
    fn watched_fds(dispatcher: &IoEventDispatcher) -> usize {
        let path = format!("/proc/self/fdinfo/{}", dispatcher.epoll.as_raw_fd());
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|line| line.starts_with("tfd:"))
            .count()
    }

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "notification not delivered");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_register() {
        let shutdown = ShutdownSignal::new().unwrap();
        let dispatcher = IoEventDispatcher::new(shutdown).unwrap();
        let vm = FakeVm::default();
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(dispatcher.is_empty());

        dispatcher
            .register(
                &vm,
                GuestIoAddress::Mmio(0x1000_003c),
                0,
                Arc::new(Mutex::new(Counter(hits.clone()))),
            )
            .unwrap();
        assert_eq!(dispatcher.len(), 1);
        let ioevents = vm.ioevents.lock().unwrap();
        assert_eq!(ioevents.len(), 1);
        assert_eq!(ioevents[0].0, GuestIoAddress::Mmio(0x1000_003c));
        assert_eq!(ioevents[0].1, 0);
    }

    #[test]
    fn test_register_failure() {
        let shutdown = ShutdownSignal::new().unwrap();
        let dispatcher = IoEventDispatcher::new(shutdown).unwrap();
        let vm = FakeVm::failing();
        let res = dispatcher.register(
            &vm,
            GuestIoAddress::Pio(0x10),
            1,
            Arc::new(Mutex::new(Counter(Arc::new(AtomicUsize::new(0))))),
        );
        assert!(matches!(res, Err(IoEventError::Vm(_))));
        assert!(dispatcher.is_empty());
        // Only the shutdown signal is watched.
        assert_eq!(watched_fds(&dispatcher), 1);

        // The slot is reused by the next binding, which works as usual.
        let vm = FakeVm::default();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher
            .register(
                &vm,
                GuestIoAddress::Pio(0x10),
                1,
                Arc::new(Mutex::new(Counter(hits.clone()))),
            )
            .unwrap();
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(watched_fds(&dispatcher), 2);
        vm.ioevents.lock().unwrap()[0].2.write(1).unwrap();
        let mut events = vec![EpollEvent::default(); IOEVENT_MAX_EVENTS];
        let count = dispatcher.epoll.wait(0, &mut events).unwrap();
        assert_eq!(count, 1);
        dispatcher.dispatch(events[0].data());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_and_shutdown() {
        let shutdown = ShutdownSignal::new().unwrap();
        let dispatcher = Arc::new(IoEventDispatcher::new(shutdown.clone()).unwrap());
        let vm = FakeVm::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        dispatcher
            .register(
                &vm,
                GuestIoAddress::Mmio(0x2000),
                0,
                Arc::new(Mutex::new(Counter(first.clone()))),
            )
            .unwrap();
        let handle = dispatcher.start().unwrap();

        // Bindings added while the thread runs are picked up too.
        dispatcher
            .register(
                &vm,
                GuestIoAddress::Mmio(0x2000),
                1,
                Arc::new(Mutex::new(Counter(second.clone()))),
            )
            .unwrap();

        // Play the guest: ring each doorbell through the kernel side of the binding.
        let doorbells: Vec<EventFd> = vm
            .ioevents
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, evt)| evt.try_clone().unwrap())
            .collect();
        doorbells[0].write(1).unwrap();
        wait_for(&first, 1);
        doorbells[1].write(1).unwrap();
        wait_for(&second, 1);
        doorbells[0].write(1).unwrap();
        wait_for(&first, 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        shutdown.trigger().unwrap();
        handle.join().unwrap();
    }
}
