// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enables pre-boot setup, instantiation and teardown of the device graph of a microVM.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use vmm_sys_util::eventfd::EventFd;

use crate::devices::ioevent::{IoEventDispatcher, IoEventError};
use crate::devices::legacy::serial::{
    restore_stdin_canon_mode, set_stdin_raw_mode, start_input_thread,
};
use crate::devices::legacy::{
    EventFdTrigger, SERIAL_IRQ, SERIAL_PORT_BASE, SERIAL_PORT_SIZE, SerialDevice, SerialError,
    SerialOut,
};
use crate::devices::virtio::VirtioDevice;
use crate::devices::virtio::block::{BLOCK_IRQ, VirtioBlock, VirtioBlockConfig, VirtioBlockError};
use crate::devices::virtio::transport::pci::{VirtioPciDevice, VirtioPciDeviceError};
use crate::devices::IoBuses;
use crate::logger::{IncMetric, METRICS, error, info, warn};
use crate::pci::PciDevice;
use crate::pci::bus::{
    PCI_CONFIG_ADDRESS_PORT, PCI_CONFIG_DATA_PORT, PCI_CONFIG_PORT_SIZE, PciConfigIo,
    PciRootError,
};
use crate::utils::ShutdownSignal;
use crate::vmm_config::{SerialOutput, VmmConfig};
use crate::vstate::memory::GuestMemoryMmap;
use crate::vstate::vm::{VmError, VmOps};

/// Errors associated with starting the devices.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StartDevicesError {
    /// Cannot set up the event dispatcher: {0}
    IoEvent(#[from] IoEventError),
    /// Cannot create the serial interrupt eventfd: {0}
    SerialEventFd(io::Error),
    /// Cannot wire the serial interrupt: {0}
    SerialIrq(VmError),
    /// Cannot start the serial console: {0}
    Serial(#[from] SerialError),
    /// Cannot create the block device: {0}
    Block(#[from] VirtioBlockError),
    /// Cannot expose the block device over PCI: {0}
    BlockTransport(#[from] VirtioPciDeviceError),
    /// Cannot plug the block device: {0}
    PciRoot(#[from] PciRootError),
}

/// Owns the device graph of a microVM and the threads servicing it.
///
/// The PCI host bridge, the event dispatcher and, when enabled, the serial console are
/// required: failing to set any of them up aborts the start. A block device that can't be
/// created is logged and left out.
#[derive(Debug)]
pub struct DeviceManager {
    buses: IoBuses,
    pci: Arc<Mutex<PciConfigIo>>,
    serial: Option<Arc<Mutex<SerialDevice>>>,
    block: Option<Arc<Mutex<VirtioPciDevice>>>,
    ioevents: Arc<IoEventDispatcher>,
    shutdown: ShutdownSignal,
    threads: Vec<JoinHandle<()>>,
    raw_terminal: bool,
}

impl DeviceManager {
    /// Builds the devices described by `config` and starts their threads.
    ///
    /// Stopping happens through `shutdown`, which is also what the vCPUs watch.
    pub fn start(
        vm: Arc<dyn VmOps>,
        mem: &GuestMemoryMmap,
        config: &VmmConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self, StartDevicesError> {
        let buses = IoBuses::default();

        let pci = Arc::new(Mutex::new(PciConfigIo::new()));
        buses.pio.register(
            PCI_CONFIG_ADDRESS_PORT,
            PCI_CONFIG_PORT_SIZE,
            pci.clone(),
        );
        buses
            .pio
            .register(PCI_CONFIG_DATA_PORT, PCI_CONFIG_PORT_SIZE, pci.clone());

        let ioevents = Arc::new(IoEventDispatcher::new(shutdown.clone())?);

        let mut manager = DeviceManager {
            buses,
            pci,
            serial: None,
            block: None,
            ioevents,
            shutdown,
            threads: Vec::new(),
            raw_terminal: false,
        };

        if let Some(block_config) = &config.block {
            match manager.attach_block(&vm, mem, block_config) {
                Ok(block) => manager.block = Some(block),
                Err(err) => {
                    error!("Cannot attach block device {}: {}", block_config.path_on_host, err);
                    METRICS.vmm.device_setup_fails.inc();
                }
            }
        }

        if let Err(err) = manager.start_threads(vm.as_ref(), config) {
            // Wind down whatever already runs.
            manager.stop();
            return Err(err);
        }

        info!("Devices started");
        Ok(manager)
    }

    fn start_threads(
        &mut self,
        vm: &dyn VmOps,
        config: &VmmConfig,
    ) -> Result<(), StartDevicesError> {
        self.threads.push(self.ioevents.start()?);

        if config.serial.enabled {
            let serial = self.attach_serial(vm, config.serial.output)?;
            if config.serial.output == SerialOutput::Stdout {
                match set_stdin_raw_mode() {
                    Ok(raw) => self.raw_terminal = raw,
                    Err(err) => warn!("Cannot set raw mode for the terminal: {}", err),
                }
                if let Some(handle) =
                    start_input_thread(serial.clone(), io::stdin(), self.shutdown.clone())?
                {
                    self.threads.push(handle);
                }
            }
            self.serial = Some(serial);
        }
        Ok(())
    }

    fn attach_serial(
        &self,
        vm: &dyn VmOps,
        output: SerialOutput,
    ) -> Result<Arc<Mutex<SerialDevice>>, StartDevicesError> {
        let evt = EventFd::new(libc::EFD_NONBLOCK).map_err(StartDevicesError::SerialEventFd)?;
        vm.register_irqfd(&evt, SERIAL_IRQ)
            .map_err(StartDevicesError::SerialIrq)?;

        let out = match output {
            SerialOutput::Stdout => SerialOut::Stdout(io::stdout()),
            SerialOutput::Sink => SerialOut::Sink(io::sink()),
        };
        let serial = Arc::new(Mutex::new(SerialDevice::new(EventFdTrigger::new(evt), out)));
        self.buses
            .pio
            .register(SERIAL_PORT_BASE, SERIAL_PORT_SIZE, serial.clone());
        Ok(serial)
    }

    fn attach_block(
        &self,
        vm: &Arc<dyn VmOps>,
        mem: &GuestMemoryMmap,
        config: &VirtioBlockConfig,
    ) -> Result<Arc<Mutex<VirtioPciDevice>>, StartDevicesError> {
        let block = VirtioBlock::new(config.clone(), mem.clone())?;
        info!(
            "Block device {} with {} sectors",
            config.path_on_host,
            block.disk().nsectors()
        );
        let block: Arc<Mutex<dyn VirtioDevice>> = Arc::new(Mutex::new(block));
        let pci_device = VirtioPciDevice::new(
            block,
            Arc::clone(vm),
            self.ioevents.clone(),
            self.buses.clone(),
            BLOCK_IRQ,
        )?;
        let slot = self
            .pci
            .lock()
            .expect("Poisoned lock")
            .register_device(pci_device.clone() as Arc<Mutex<dyn PciDevice>>)?;
        info!("Block device plugged in PCI slot {}", slot);
        Ok(pci_device)
    }

    /// The I/O buses the vCPUs dispatch their exits to.
    pub fn buses(&self) -> &IoBuses {
        &self.buses
    }

    /// The PCI host bridge.
    pub fn pci(&self) -> &Arc<Mutex<PciConfigIo>> {
        &self.pci
    }

    /// The console, when enabled.
    pub fn serial(&self) -> Option<&Arc<Mutex<SerialDevice>>> {
        self.serial.as_ref()
    }

    /// The virtio block device, when attached.
    pub fn block(&self) -> Option<&Arc<Mutex<VirtioPciDevice>>> {
        self.block.as_ref()
    }

    /// The doorbell dispatcher.
    pub fn ioevents(&self) -> &Arc<IoEventDispatcher> {
        &self.ioevents
    }

    /// The cancellation signal of every thread of the microVM.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Stops the device threads and flushes the metrics.
    pub fn shutdown(mut self) {
        self.stop();
        if let Err(err) = METRICS.write() {
            METRICS.vmm.missed_log_count.inc();
            error!("Failed to write metrics while stopping: {}", err);
        }
        info!("Devices stopped");
    }

    fn stop(&mut self) {
        if let Err(err) = self.shutdown.trigger() {
            error!("Cannot signal the device threads: {}", err);
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }
        if self.raw_terminal {
            restore_stdin_canon_mode();
            self.raw_terminal = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::devices::virtio::TYPE_BLOCK;
    use crate::devices::virtio::test_utils::default_mem;
    use crate::pci::bus::PciConfigAddress;
    use crate::vmm_config::SerialConfig;
    use crate::vstate::vm::tests::FakeVm;

    fn sink_console() -> SerialConfig {
        SerialConfig {
            enabled: true,
            output: SerialOutput::Sink,
        }
    }

    fn disk(sectors: u64) -> TempFile {
        let file = TempFile::new().unwrap();
        file.as_file().set_len(sectors * 512).unwrap();
        file
    }

    fn pci_read_u32(buses: &IoBuses, device: u8, register: u8) -> u32 {
        let address = PciConfigAddress::new(device, register).raw();
        assert!(buses.pio.write(PCI_CONFIG_ADDRESS_PORT, &address.to_le_bytes()));
        let mut data = [0u8; 4];
        assert!(buses.pio.read(PCI_CONFIG_DATA_PORT, &mut data));
        u32::from_le_bytes(data)
    }

    #[test]
    fn test_start_without_block() {
        let vm = Arc::new(FakeVm::default());
        let config = VmmConfig {
            serial: sink_console(),
            ..Default::default()
        };
        let manager = DeviceManager::start(
            vm.clone(),
            &default_mem(),
            &config,
            ShutdownSignal::new().unwrap(),
        )
        .unwrap();

        assert!(manager.block().is_none());
        assert!(manager.serial().is_some());
        // 0xcf8, 0xcfc and COM1.
        assert_eq!(manager.buses().pio.len(), 3);
        assert!(manager.buses().mmio.is_empty());
        assert_eq!(vm.irqfds.lock().unwrap()[0].0, SERIAL_IRQ);

        // The console answers on its ports.
        let mut lcr = [0u8];
        assert!(manager.buses().pio.read(SERIAL_PORT_BASE + 3, &mut lcr));
        assert_eq!(lcr[0], 0x03);

        // Slot 0 is empty.
        assert_eq!(pci_read_u32(manager.buses(), 0, 0), 0xffff_ffff);

        let shutdown = manager.shutdown_signal().clone();
        manager.shutdown();
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_start_with_block() {
        let image = disk(8);
        let vm = Arc::new(FakeVm::default());
        let config = VmmConfig {
            serial: SerialConfig {
                enabled: false,
                output: SerialOutput::Sink,
            },
            block: Some(VirtioBlockConfig {
                path_on_host: image.as_path().to_str().unwrap().to_string(),
                is_read_only: false,
            }),
            ..Default::default()
        };
        let manager = DeviceManager::start(
            vm.clone(),
            &default_mem(),
            &config,
            ShutdownSignal::new().unwrap(),
        )
        .unwrap();

        assert!(manager.serial().is_none());
        let block = manager.block().unwrap();
        assert_eq!(
            block
                .lock()
                .unwrap()
                .virtio_device()
                .lock()
                .unwrap()
                .device_type(),
            TYPE_BLOCK
        );
        assert_eq!(vm.irqfds.lock().unwrap()[0].0, u32::from(BLOCK_IRQ));

        // The guest finds the virtio block function in slot 0.
        assert_eq!(pci_read_u32(manager.buses(), 0, 0), 0x1042_1af4);
        assert_eq!(pci_read_u32(manager.buses(), 1, 0), 0xffff_ffff);

        manager.shutdown();
    }

    #[test]
    fn test_block_failure_is_tolerated() {
        let vm = Arc::new(FakeVm::default());
        let config = VmmConfig {
            serial: sink_console(),
            block: Some(VirtioBlockConfig {
                path_on_host: "/invalid/disk.img".to_string(),
                is_read_only: false,
            }),
            ..Default::default()
        };
        let fails = METRICS.vmm.device_setup_fails.count();
        let manager = DeviceManager::start(
            vm,
            &default_mem(),
            &config,
            ShutdownSignal::new().unwrap(),
        )
        .unwrap();

        assert!(manager.block().is_none());
        assert!(manager.serial().is_some());
        assert!(METRICS.vmm.device_setup_fails.count() > fails);
        manager.shutdown();
    }

    #[test]
    fn test_serial_failure_is_fatal() {
        let vm = Arc::new(FakeVm::failing());
        let config = VmmConfig {
            serial: sink_console(),
            ..Default::default()
        };
        let shutdown = ShutdownSignal::new().unwrap();
        let res = DeviceManager::start(vm, &default_mem(), &config, shutdown.clone());
        assert!(matches!(res, Err(StartDevicesError::SerialIrq(_))));
        // The dispatcher thread was already running and got stopped.
        assert!(shutdown.is_triggered());
    }
}
