// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kvm_ioctls::VcpuFd;
use libc::{c_int, c_void, siginfo_t};
use vmm_sys_util::signal::{Killable, register_signal_handler};

use crate::devices::{Bus, IoBuses};
use crate::logger::{IncMetric, METRICS, error, info, warn};
use crate::utils::ShutdownSignal;

/// Signal number (SIGRTMIN) used to kick vCPUs out of `KVM_RUN`.
pub const VCPU_RTSIG_OFFSET: i32 = 0;
/// Delay between two kicks of a vCPU being stopped.
const KICK_INTERVAL: Duration = Duration::from_millis(10);

/// Errors of the vCPU exit loop.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VcpuError {
    /// Failure during vcpu run: {0}
    Run(kvm_ioctls::Error),
    /// Unexpected KVM exit: {0}
    UnhandledKvmExit(String),
    /// Cannot register the vcpu kick signal handler: {0}
    SignalHandler(vmm_sys_util::errno::Error),
    /// Failed to signal vcpu: {0}
    SignalVcpu(vmm_sys_util::errno::Error),
    /// Cannot spawn a new vCPU thread: {0}
    VcpuSpawn(io::Error),
    /// The vCPU thread panicked.
    VcpuPanicked,
}

/// Exit reasons the VMM reacts to.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// Port input of `data.len() / size` consecutive accesses of `size` bytes.
    IoIn {
        /// Guest port.
        port: u16,
        /// Width of one access.
        size: usize,
        /// Filled by the VMM.
        data: &'a mut [u8],
    },
    /// Port output of `data.len() / size` consecutive accesses of `size` bytes.
    IoOut {
        /// Guest port.
        port: u16,
        /// Width of one access.
        size: usize,
        /// Written by the guest.
        data: &'a [u8],
    },
    /// MMIO read at the given guest address.
    MmioRead(u64, &'a mut [u8]),
    /// MMIO write at the given guest address.
    MmioWrite(u64, &'a [u8]),
    /// The guest halted.
    Hlt,
    /// The guest triple faulted or asked for a reset.
    Shutdown,
    /// Hardware entry failure.
    FailEntry,
    /// Failure from the Linux KVM subsystem rather than from the hardware.
    InternalError,
    /// Any other exit, with its description.
    Unhandled(String),
}

/// Runs a vCPU until its next exit.
pub trait VcpuRunner {
    /// Enters the guest and returns the reason it left.
    fn run(&mut self) -> Result<VcpuExit<'_>, kvm_ioctls::Error>;
}

impl VcpuRunner for VcpuFd {
    fn run(&mut self) -> Result<VcpuExit<'_>, kvm_ioctls::Error> {
        // The access width of string I/O is only reported in the kvm_run header.
        let kvm_run: *const kvm_bindings::kvm_run = self.get_kvm_run();
        let io_size = || {
            // SAFETY: `kvm_run` points to the area mmapped for the lifetime of this fd. KVM_RUN
            // returned so the kernel isn't updating it, and the io header doesn't overlap the
            // data slice handed out with the exit.
            usize::from(unsafe { (*kvm_run).__bindgen_anon_1.io.size })
        };

        let exit = match VcpuFd::run(self)? {
            kvm_ioctls::VcpuExit::IoIn(port, data) => VcpuExit::IoIn {
                port,
                size: io_size(),
                data,
            },
            kvm_ioctls::VcpuExit::IoOut(port, data) => VcpuExit::IoOut {
                port,
                size: io_size(),
                data,
            },
            kvm_ioctls::VcpuExit::MmioRead(addr, data) => VcpuExit::MmioRead(addr, data),
            kvm_ioctls::VcpuExit::MmioWrite(addr, data) => VcpuExit::MmioWrite(addr, data),
            kvm_ioctls::VcpuExit::Hlt => VcpuExit::Hlt,
            kvm_ioctls::VcpuExit::Shutdown => VcpuExit::Shutdown,
            kvm_ioctls::VcpuExit::FailEntry { .. } => VcpuExit::FailEntry,
            kvm_ioctls::VcpuExit::InternalError => VcpuExit::InternalError,
            other => VcpuExit::Unhandled(format!("{other:?}")),
        };
        Ok(exit)
    }
}

/// Result of one round of guest execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuEmulation {
    /// The exit was serviced, the guest can be resumed.
    Handled,
    /// `KVM_RUN` was interrupted by a signal.
    Interrupted,
    /// The guest stopped.
    Stopped,
}

/// A vCPU wired to the I/O buses.
#[derive(Debug)]
pub struct Vcpu<R> {
    index: u8,
    runner: R,
    pio_bus: Arc<Bus>,
    mmio_bus: Arc<Bus>,
    shutdown: ShutdownSignal,
}

impl<R: VcpuRunner> Vcpu<R> {
    /// Creates the vCPU `index` dispatching its I/O exits to `buses`.
    pub fn new(index: u8, runner: R, buses: &IoBuses, shutdown: ShutdownSignal) -> Self {
        Vcpu {
            index,
            runner,
            pio_bus: Arc::clone(&buses.pio),
            mmio_bus: Arc::clone(&buses.mmio),
            shutdown,
        }
    }

    /// Runs the vCPU in KVM context and handles the kvm exit reason.
    ///
    /// Returns error or enum specifying whether emulation was handled or interrupted.
    pub fn run_emulation(&mut self) -> Result<VcpuEmulation, VcpuError> {
        match self.runner.run() {
            Ok(exit) => match exit {
                VcpuExit::IoIn { port, size, data } => {
                    self.pio_bus.read_repeated(u64::from(port), size, data);
                    METRICS.vcpu.exit_io_in.inc();
                    Ok(VcpuEmulation::Handled)
                }
                VcpuExit::IoOut { port, size, data } => {
                    self.pio_bus.write_repeated(u64::from(port), size, data);
                    METRICS.vcpu.exit_io_out.inc();
                    Ok(VcpuEmulation::Handled)
                }
                VcpuExit::MmioRead(addr, data) => {
                    self.mmio_bus.read(addr, data);
                    METRICS.vcpu.exit_mmio_read.inc();
                    Ok(VcpuEmulation::Handled)
                }
                VcpuExit::MmioWrite(addr, data) => {
                    self.mmio_bus.write(addr, data);
                    METRICS.vcpu.exit_mmio_write.inc();
                    Ok(VcpuEmulation::Handled)
                }
                VcpuExit::Hlt => {
                    info!("Received KVM_EXIT_HLT signal");
                    Ok(VcpuEmulation::Stopped)
                }
                VcpuExit::Shutdown => {
                    info!("Received KVM_EXIT_SHUTDOWN signal");
                    Ok(VcpuEmulation::Stopped)
                }
                // Documentation specifies that below kvm exits are considered
                // errors.
                VcpuExit::FailEntry => {
                    METRICS.vcpu.failures.inc();
                    error!("Received KVM_EXIT_FAIL_ENTRY signal");
                    Err(VcpuError::UnhandledKvmExit("FailEntry".to_string()))
                }
                VcpuExit::InternalError => {
                    METRICS.vcpu.failures.inc();
                    error!("Received KVM_EXIT_INTERNAL_ERROR signal");
                    Err(VcpuError::UnhandledKvmExit("InternalError".to_string()))
                }
                VcpuExit::Unhandled(reason) => {
                    METRICS.vcpu.failures.inc();
                    error!("Unexpected exit reason on vcpu run: {}", reason);
                    Err(VcpuError::UnhandledKvmExit(reason))
                }
            },
            Err(err) => match err.errno() {
                libc::EAGAIN => Ok(VcpuEmulation::Handled),
                // Kicked, see `VcpuHandle::join`.
                libc::EINTR => Ok(VcpuEmulation::Interrupted),
                _ => {
                    METRICS.vcpu.failures.inc();
                    error!("Failure during vcpu run: {}", err);
                    Err(VcpuError::Run(err))
                }
            },
        }
    }

    /// Main loop of the vCPU thread.
    ///
    /// Runs the guest until it stops, fails or the shutdown signal is triggered. A stopping or
    /// failing guest triggers the shutdown signal itself, so the other threads wind down too.
    pub fn run(&mut self) -> Result<(), VcpuError> {
        while !self.shutdown.is_triggered() {
            match self.run_emulation() {
                Ok(VcpuEmulation::Handled) | Ok(VcpuEmulation::Interrupted) => {}
                Ok(VcpuEmulation::Stopped) => {
                    self.request_shutdown();
                    return Ok(());
                }
                Err(err) => {
                    self.request_shutdown();
                    return Err(err);
                }
            }
        }
        info!("vcpu {}: shutting down", self.index);
        Ok(())
    }

    fn request_shutdown(&self) {
        if let Err(err) = self.shutdown.trigger() {
            error!("vcpu {}: cannot signal the shutdown: {}", self.index, err);
            METRICS.vcpu.failures.inc();
        }
    }
}

impl<R: VcpuRunner + Send + 'static> Vcpu<R> {
    /// Registers a signal handler which makes use of VCPU_RTSIG_OFFSET in order to interrupt
    /// `KVM_RUN` with `EINTR`.
    pub fn register_kick_signal_handler() -> Result<(), VcpuError> {
        extern "C" fn handle_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {}

        register_signal_handler(libc::SIGRTMIN() + VCPU_RTSIG_OFFSET, handle_signal)
            .map_err(VcpuError::SignalHandler)
    }

    /// Moves the vCPU to its own `vmm_vcpu{index}` thread.
    pub fn start_threaded(mut self) -> Result<VcpuHandle, VcpuError> {
        Self::register_kick_signal_handler()?;
        let index = self.index;
        let thread = thread::Builder::new()
            .name(format!("vmm_vcpu{index}"))
            .spawn(move || self.run())
            .map_err(VcpuError::VcpuSpawn)?;
        Ok(VcpuHandle { index, thread })
    }
}

/// Handle to a running vCPU thread.
#[derive(Debug)]
pub struct VcpuHandle {
    index: u8,
    thread: JoinHandle<Result<(), VcpuError>>,
}

impl VcpuHandle {
    /// Interrupts the vCPU if it is inside `KVM_RUN`.
    pub fn kick(&self) -> Result<(), VcpuError> {
        self.thread
            .kill(libc::SIGRTMIN() + VCPU_RTSIG_OFFSET)
            .map_err(VcpuError::SignalVcpu)
    }

    /// Waits for the vCPU thread, kicking it until it notices the shutdown signal.
    ///
    /// The shutdown signal must be triggered beforehand. A kick landing right before the
    /// thread enters `KVM_RUN` is lost, hence the repeated kicks.
    pub fn join(self) -> Result<(), VcpuError> {
        while !self.thread.is_finished() {
            if let Err(err) = self.kick() {
                warn!("vcpu {}: {}", self.index, err);
            }
            thread::sleep(KICK_INTERVAL);
        }
        self.thread.join().map_err(|_| VcpuError::VcpuPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::devices::bus::tests::RecordingDevice;

    /// Exits replayed by [`ScriptedRunner`].
    #[derive(Debug, Clone)]
    enum Scripted {
        IoIn { port: u16, size: usize, count: usize },
        IoOut { port: u16, size: usize, data: Vec<u8> },
        MmioRead { addr: u64, len: usize },
        MmioWrite { addr: u64, data: Vec<u8> },
        Hlt,
        Shutdown,
        FailEntry,
        Unhandled,
        Errno(i32),
    }

    /// Plays a fixed sequence of exits, then keeps the guest spinning on a harmless port write.
    #[derive(Debug, Default)]
    struct ScriptedRunner {
        script: VecDeque<Scripted>,
        buf: Vec<u8>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<Scripted>) -> Self {
            ScriptedRunner {
                script: script.into(),
                buf: Vec::new(),
            }
        }
    }

    impl VcpuRunner for ScriptedRunner {
        fn run(&mut self) -> Result<VcpuExit<'_>, kvm_ioctls::Error> {
            let next = self.script.pop_front().unwrap_or_else(|| {
                thread::sleep(Duration::from_millis(1));
                Scripted::IoOut {
                    port: 0x80,
                    size: 1,
                    data: vec![0],
                }
            });
            Ok(match next {
                Scripted::IoIn { port, size, count } => {
                    self.buf = vec![0; size * count];
                    VcpuExit::IoIn {
                        port,
                        size,
                        data: &mut self.buf,
                    }
                }
                Scripted::IoOut { port, size, data } => {
                    self.buf = data;
                    VcpuExit::IoOut {
                        port,
                        size,
                        data: &self.buf,
                    }
                }
                Scripted::MmioRead { addr, len } => {
                    self.buf = vec![0; len];
                    VcpuExit::MmioRead(addr, &mut self.buf)
                }
                Scripted::MmioWrite { addr, data } => {
                    self.buf = data;
                    VcpuExit::MmioWrite(addr, &self.buf)
                }
                Scripted::Hlt => VcpuExit::Hlt,
                Scripted::Shutdown => VcpuExit::Shutdown,
                Scripted::FailEntry => VcpuExit::FailEntry,
                Scripted::Unhandled => VcpuExit::Unhandled("Debug".to_string()),
                Scripted::Errno(errno) => return Err(kvm_ioctls::Error::new(errno)),
            })
        }
    }

    fn vcpu(script: Vec<Scripted>) -> (Vcpu<ScriptedRunner>, IoBuses, ShutdownSignal) {
        let buses = IoBuses::default();
        let shutdown = ShutdownSignal::new().unwrap();
        let vcpu = Vcpu::new(0, ScriptedRunner::new(script), &buses, shutdown.clone());
        (vcpu, buses, shutdown)
    }

    #[test]
    fn test_io_exits() {
        let (mut vcpu, buses, _shutdown) = vcpu(vec![
            Scripted::IoOut {
                port: 0x3f8,
                size: 1,
                data: b"ok".to_vec(),
            },
            Scripted::IoIn {
                port: 0x3fa,
                size: 2,
                count: 2,
            },
        ]);
        let dev = Arc::new(Mutex::new(RecordingDevice::default()));
        buses.pio.register(0x3f8, 8, dev.clone());

        // A string output is split in single byte accesses.
        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Handled);
        assert_eq!(
            dev.lock().unwrap().writes,
            vec![(0x3f8, 0, b"o".to_vec()), (0x3f8, 0, b"k".to_vec())]
        );

        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Handled);
        assert_eq!(dev.lock().unwrap().reads, vec![(0x3f8, 2, 2), (0x3f8, 2, 2)]);
        assert_eq!(vcpu.runner.buf, vec![2, 3, 2, 3]);
    }

    #[test]
    fn test_mmio_exits() {
        let (mut vcpu, buses, _shutdown) = vcpu(vec![
            Scripted::MmioWrite {
                addr: 0xd000_0004,
                data: vec![0xaa; 4],
            },
            Scripted::MmioRead {
                addr: 0xd000_0000,
                len: 2,
            },
            // Nothing lives there, the exit is still handled and the data left untouched.
            Scripted::MmioRead {
                addr: 0x1000,
                len: 4,
            },
        ]);
        let dev = Arc::new(Mutex::new(RecordingDevice::default()));
        buses.mmio.register(0xd000_0000, 0x100, dev.clone());

        for _ in 0..3 {
            assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Handled);
        }
        let dev = dev.lock().unwrap();
        assert_eq!(dev.writes, vec![(0xd000_0000, 4, vec![0xaa; 4])]);
        assert_eq!(dev.reads, vec![(0xd000_0000, 0, 2)]);
        assert_eq!(vcpu.runner.buf, vec![0; 4]);
    }

    #[test]
    fn test_stop_exits() {
        let (mut vcpu, _buses, _shutdown) = vcpu(vec![Scripted::Hlt, Scripted::Shutdown]);
        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Stopped);
        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Stopped);
    }

    #[test]
    fn test_error_exits() {
        let (mut vcpu, _buses, _shutdown) = vcpu(vec![
            Scripted::FailEntry,
            Scripted::Unhandled,
            Scripted::Errno(libc::EAGAIN),
            Scripted::Errno(libc::EINTR),
            Scripted::Errno(libc::EFAULT),
        ]);
        let failures = METRICS.vcpu.failures.count();

        assert!(matches!(
            vcpu.run_emulation(),
            Err(VcpuError::UnhandledKvmExit(_))
        ));
        assert!(matches!(
            vcpu.run_emulation(),
            Err(VcpuError::UnhandledKvmExit(reason)) if reason == "Debug"
        ));
        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Handled);
        assert_eq!(vcpu.run_emulation().unwrap(), VcpuEmulation::Interrupted);
        assert!(matches!(vcpu.run_emulation(), Err(VcpuError::Run(_))));
        assert!(METRICS.vcpu.failures.count() >= failures + 3);
    }

    #[test]
    fn test_run_until_halt() {
        let (mut vcpu, _buses, shutdown) = vcpu(vec![
            Scripted::Errno(libc::EINTR),
            Scripted::IoOut {
                port: 0x80,
                size: 1,
                data: vec![1],
            },
            Scripted::Hlt,
        ]);
        vcpu.run().unwrap();
        // The halting guest brings the rest of the VM down.
        assert!(shutdown.is_triggered());
        assert!(vcpu.runner.script.is_empty());
    }

    #[test]
    fn test_run_failure_triggers_shutdown() {
        let (mut vcpu, _buses, shutdown) = vcpu(vec![Scripted::FailEntry]);
        assert!(vcpu.run().is_err());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_threaded_shutdown() {
        let (vcpu, _buses, shutdown) = vcpu(Vec::new());
        let handle = vcpu.start_threaded().unwrap();
        thread::sleep(Duration::from_millis(20));

        shutdown.trigger().unwrap();
        handle.join().unwrap();
    }
}
