// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::mem::size_of;
use std::sync::{Arc, Mutex, Weak};

use super::common_config::{COMMON_CONFIG_SIZE, VirtioPciCommonConfig};
use crate::devices::bus::{BusDevice, IoBuses};
use crate::devices::ioevent::{IoEventDispatcher, IoEventSubscriber};
use crate::devices::virtio::VirtioDevice;
use crate::logger::{IncMetric, METRICS, debug, error, warn};
use crate::pci::configuration::{
    PciBarRegionType, PciConfiguration, PciConfigurationError, PciHeader,
};
use crate::pci::{PciCapability, PciCapabilityId, PciDevice};
use crate::utils::u64_to_usize;
use crate::vstate::memory::{ByteValued, Le32};
use crate::vstate::vm::{GuestIoAddress, VmError, VmOps};

/// BAR index we are using for VirtIO configuration
const VIRTIO_BAR_INDEX: usize = 0;

#[derive(Debug, Clone, Copy)]
enum PciCapabilityType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
    Pci = 5,
}

// This offset represents the 2 bytes omitted from the VirtioPciCap structure
// as they are already handled through add_capability(). These 2 bytes are the
// fields cap_vndr (1 byte) and cap_next (1 byte) defined in the virtio spec.
const VIRTIO_PCI_CAP_OFFSET: usize = 2;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VirtioPciCap {
    cap_len: u8,      // Generic PCI field: capability length
    cfg_type: u8,     // Identifies the structure.
    pci_bar: u8,      // Where to find it.
    id: u8,           // Multiple capabilities of the same type.
    padding: [u8; 2], // Pad to full dword.
    offset: Le32,     // Offset within bar.
    length: Le32,     // Length of the structure, in bytes.
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciCap {}

impl PciCapability for VirtioPciCap {
    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

impl VirtioPciCap {
    // `cap_size` is the size of the whole capability structure this header starts.
    fn new(cfg_type: PciCapabilityType, cap_size: usize, offset: u64, length: u64) -> Self {
        VirtioPciCap {
            // Capabilities are a few bytes long, far below 255.
            cap_len: (cap_size + VIRTIO_PCI_CAP_OFFSET) as u8,
            cfg_type: cfg_type as u8,
            pci_bar: VIRTIO_BAR_INDEX as u8,
            id: 0,
            padding: [0; 2],
            // The BAR layout fits in 32 bits.
            offset: Le32::from(offset as u32),
            length: Le32::from(length as u32),
        }
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct VirtioPciNotifyCap {
    cap: VirtioPciCap,
    notify_off_multiplier: Le32,
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciNotifyCap {}

impl PciCapability for VirtioPciNotifyCap {
    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct VirtioPciCfgCap {
    cap: VirtioPciCap,
    pci_cfg_data: [u8; 4],
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciCfgCap {}

impl PciCapability for VirtioPciCfgCap {
    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

// Layout of BAR0.
const COMMON_CONFIG_BAR_OFFSET: u64 = 0x00;
const ISR_CONFIG_BAR_OFFSET: u64 = 0x38;
const ISR_CONFIG_SIZE: u64 = 4;
const NOTIFICATION_BAR_OFFSET: u64 = 0x3c;
const NOTIFICATION_SIZE: u64 = 4;
const DEVICE_CONFIG_BAR_OFFSET: u64 = 0x40;
const DEVICE_CONFIG_SIZE: u64 = 0xc0;
// The BAR size must be a power of 2.
const CAPABILITY_BAR_SIZE: u32 = 0x100;

// Every queue kicks the same address, the written value tells them apart.
const NOTIFY_OFF_MULTIPLIER: u32 = 0;

// Positions within the PCI_CFG capability, header included.
const PCI_CFG_CAP_BAR_OFFSET: usize = VIRTIO_PCI_CAP_OFFSET + 6;
const PCI_CFG_CAP_LENGTH: usize = VIRTIO_PCI_CAP_OFFSET + 10;
const PCI_CFG_CAP_DATA: usize = VIRTIO_PCI_CAP_OFFSET + size_of::<VirtioPciCap>();

/// PCI vendor ID of virtio devices.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;
/// Add to the virtio device type to get the PCI device ID.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;
/// Class code of virtio devices: mass storage, other.
pub const VIRTIO_PCI_CLASS_CODE: u32 = 0x01_8000;

/// Errors of the virtio PCI transport.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VirtioPciDeviceError {
    /// Cannot wire the device interrupt: {0}
    Vm(#[from] VmError),
    /// Cannot build the configuration space: {0}
    Configuration(#[from] PciConfigurationError),
    /// Virtio device type {0} has no PCI device ID
    DeviceType(u32),
}

// Runs the queue of a device when its doorbell rings.
#[derive(Debug)]
struct QueueNotifier {
    device: Arc<Mutex<dyn VirtioDevice>>,
    queue_index: usize,
}

impl IoEventSubscriber for QueueNotifier {
    fn notify(&mut self) {
        self.device
            .lock()
            .expect("Poisoned lock")
            .process_queue(self.queue_index);
    }
}

/// A virtio device exposed as a PCI function with the modern capability layout.
///
/// All the virtio structures live in BAR0. The queue doorbell is serviced twice: KVM turns
/// matching writes into ioeventfd notifications once the queue is enabled, and any write
/// reaching the vCPU thread runs the queue inline.
#[derive(Debug)]
pub struct VirtioPciDevice {
    config: PciConfiguration,
    common_config: VirtioPciCommonConfig,
    cap_pci_cfg_offset: usize,
    device: Arc<Mutex<dyn VirtioDevice>>,
    vm: Arc<dyn VmOps>,
    ioevents: Arc<IoEventDispatcher>,
}

impl VirtioPciDevice {
    /// Wraps `device` in a PCI function whose interrupt is line `irq`.
    ///
    /// BAR0 regions are registered on `buses` once the guest enables decoding.
    pub fn new(
        device: Arc<Mutex<dyn VirtioDevice>>,
        vm: Arc<dyn VmOps>,
        ioevents: Arc<IoEventDispatcher>,
        buses: IoBuses,
        irq: u8,
    ) -> Result<Arc<Mutex<Self>>, VirtioPciDeviceError> {
        let device_type = {
            let locked = device.lock().expect("Poisoned lock");
            vm.register_irqfd(locked.interrupt_trigger().irq_evt(), u32::from(irq))?;
            locked.device_type()
        };
        let device_id = u16::try_from(device_type)
            .ok()
            .and_then(|t| VIRTIO_PCI_DEVICE_ID_BASE.checked_add(t))
            .ok_or(VirtioPciDeviceError::DeviceType(device_type))?;

        let header = PciHeader {
            vendor_id: VIRTIO_PCI_VENDOR_ID,
            device_id,
            class_code: VIRTIO_PCI_CLASS_CODE,
            irq_line: irq,
        };
        let mut config = PciConfiguration::new_type0(header, buses);
        let cap_pci_cfg_offset = Self::add_capabilities(&mut config)?;

        let pci_device = Arc::new(Mutex::new(VirtioPciDevice {
            config,
            common_config: VirtioPciCommonConfig::default(),
            cap_pci_cfg_offset,
            device,
            vm,
            ioevents,
        }));

        let handler: Arc<Mutex<dyn BusDevice>> = pci_device.clone();
        let handler: Weak<Mutex<dyn BusDevice>> = Arc::downgrade(&handler);
        pci_device.lock().expect("Poisoned lock").config.add_pci_bar(
            VIRTIO_BAR_INDEX,
            CAPABILITY_BAR_SIZE,
            PciBarRegionType::Memory32,
            handler,
        )?;

        Ok(pci_device)
    }

    // Returns the config space offset of the PCI_CFG capability.
    fn add_capabilities(config: &mut PciConfiguration) -> Result<usize, PciConfigurationError> {
        let common_cap = VirtioPciCap::new(
            PciCapabilityType::Common,
            size_of::<VirtioPciCap>(),
            COMMON_CONFIG_BAR_OFFSET,
            COMMON_CONFIG_SIZE,
        );
        config.add_capability(&common_cap)?;

        let notify_cap = VirtioPciNotifyCap {
            cap: VirtioPciCap::new(
                PciCapabilityType::Notify,
                size_of::<VirtioPciNotifyCap>(),
                NOTIFICATION_BAR_OFFSET,
                NOTIFICATION_SIZE,
            ),
            notify_off_multiplier: Le32::from(NOTIFY_OFF_MULTIPLIER),
        };
        config.add_capability(&notify_cap)?;

        let isr_cap = VirtioPciCap::new(
            PciCapabilityType::Isr,
            size_of::<VirtioPciCap>(),
            ISR_CONFIG_BAR_OFFSET,
            ISR_CONFIG_SIZE,
        );
        config.add_capability(&isr_cap)?;

        let device_cap = VirtioPciCap::new(
            PciCapabilityType::Device,
            size_of::<VirtioPciCap>(),
            DEVICE_CONFIG_BAR_OFFSET,
            DEVICE_CONFIG_SIZE,
        );
        config.add_capability(&device_cap)?;

        let cfg_cap = VirtioPciCfgCap {
            cap: VirtioPciCap::new(PciCapabilityType::Pci, size_of::<VirtioPciCfgCap>(), 0, 0),
            pci_cfg_data: [0; 4],
        };
        config.add_capability(&cfg_cap)
    }

    /// The wrapped virtio device.
    pub fn virtio_device(&self) -> Arc<Mutex<dyn VirtioDevice>> {
        self.device.clone()
    }

    /// Guest address of the virtio structures, 0 until the guest programs BAR0.
    pub fn config_bar_addr(&self) -> u64 {
        self.config.bar_addr(VIRTIO_BAR_INDEX)
    }

    // Binds the doorbell of a freshly enabled queue to the event dispatcher.
    fn register_doorbell(&self, queue_index: u16, notify_off: u16) {
        let bar_addr = self.config_bar_addr();
        if bar_addr == 0 {
            warn!("virtio: queue {queue_index} enabled before BAR0 was programmed");
            return;
        }
        let addr = bar_addr
            + NOTIFICATION_BAR_OFFSET
            + u64::from(NOTIFY_OFF_MULTIPLIER) * u64::from(notify_off);
        let notifier = Arc::new(Mutex::new(QueueNotifier {
            device: self.device.clone(),
            queue_index: usize::from(queue_index),
        }));
        if let Err(err) =
            self.ioevents
                .register(self.vm.as_ref(), GuestIoAddress::Mmio(addr), queue_index, notifier)
        {
            // Kicks still reach the device through the inline notify path.
            error!("virtio: cannot bind doorbell of queue {queue_index}: {}", err);
            METRICS.ioevent.event_fails.inc();
        }
    }

    fn read_bar(&mut self, offset: u64, data: &mut [u8]) {
        match offset {
            o if o < COMMON_CONFIG_BAR_OFFSET + COMMON_CONFIG_SIZE => {
                let device = self.device.lock().expect("Poisoned lock");
                self.common_config
                    .read(o - COMMON_CONFIG_BAR_OFFSET, data, &*device);
            }
            o if (ISR_CONFIG_BAR_OFFSET..ISR_CONFIG_BAR_OFFSET + ISR_CONFIG_SIZE).contains(&o) => {
                data.fill(0);
                if o == ISR_CONFIG_BAR_OFFSET {
                    // Reading the ISR acknowledges the interrupt.
                    let device = self.device.lock().expect("Poisoned lock");
                    let status = device.interrupt_trigger().take_status();
                    if let Some(first) = data.first_mut() {
                        *first = (status & 0xff) as u8;
                    }
                }
            }
            o if (NOTIFICATION_BAR_OFFSET..NOTIFICATION_BAR_OFFSET + NOTIFICATION_SIZE)
                .contains(&o) =>
            {
                data.fill(0);
            }
            o if (DEVICE_CONFIG_BAR_OFFSET..DEVICE_CONFIG_BAR_OFFSET + DEVICE_CONFIG_SIZE)
                .contains(&o) =>
            {
                let device = self.device.lock().expect("Poisoned lock");
                device.read_config(o - DEVICE_CONFIG_BAR_OFFSET, data);
            }
            o => {
                warn!("pci: read outside of the virtio structures at {o:#x}");
                METRICS.pci.invalid_virtio_access_count.inc();
                data.fill(0);
            }
        }
    }

    fn write_bar(&mut self, offset: u64, data: &[u8]) {
        match offset {
            o if o < COMMON_CONFIG_BAR_OFFSET + COMMON_CONFIG_SIZE => {
                let enabled = {
                    let mut device = self.device.lock().expect("Poisoned lock");
                    self.common_config
                        .write(o - COMMON_CONFIG_BAR_OFFSET, data, &mut *device)
                        .map(|index| {
                            let notify_off = device.queues()[usize::from(index)].notify_off;
                            (index, notify_off)
                        })
                };
                if let Some((index, notify_off)) = enabled {
                    self.register_doorbell(index, notify_off);
                }
            }
            o if (ISR_CONFIG_BAR_OFFSET..ISR_CONFIG_BAR_OFFSET + ISR_CONFIG_SIZE).contains(&o) => {
                warn!("pci: write to the read-only ISR status at {o:#x}");
                METRICS.pci.invalid_virtio_access_count.inc();
            }
            o if (NOTIFICATION_BAR_OFFSET..NOTIFICATION_BAR_OFFSET + NOTIFICATION_SIZE)
                .contains(&o) =>
            {
                self.notify_inline(data);
            }
            o if (DEVICE_CONFIG_BAR_OFFSET..DEVICE_CONFIG_BAR_OFFSET + DEVICE_CONFIG_SIZE)
                .contains(&o) =>
            {
                let mut device = self.device.lock().expect("Poisoned lock");
                device.write_config(o - DEVICE_CONFIG_BAR_OFFSET, data);
            }
            o => {
                warn!("pci: write outside of the virtio structures at {o:#x}");
                METRICS.pci.invalid_virtio_access_count.inc();
            }
        }
    }

    // A kick that KVM did not turn into an ioevent: run the queue on this thread.
    fn notify_inline(&mut self, data: &[u8]) {
        let queue_index = match *data {
            [lo] => usize::from(lo),
            [lo, hi, ..] => usize::from(u16::from_le_bytes([lo, hi])),
            [] => return,
        };
        let mut device = self.device.lock().expect("Poisoned lock");
        if queue_index >= device.queues().len() {
            warn!("virtio: notification for unknown queue {queue_index}");
            METRICS.pci.invalid_virtio_access_count.inc();
            return;
        }
        debug!("virtio: inline notification for queue {queue_index}");
        device.process_queue(queue_index);
    }

    // Whether `[offset, offset + len)` is inside the data window of the PCI_CFG capability.
    fn in_pci_cfg_window(&self, offset: u64, len: usize) -> bool {
        let start = self.cap_pci_cfg_offset + PCI_CFG_CAP_DATA;
        let offset = u64_to_usize(offset);
        offset >= start && offset.saturating_add(len) <= start + 4
    }

    fn read_config_u32(&self, offset: usize) -> u32 {
        let mut data = [0u8; 4];
        self.config.read(offset as u64, &mut data);
        u32::from_le_bytes(data)
    }

    // The BAR access the guest set up in the PCI_CFG capability.
    fn pci_cfg_access(&self) -> Option<(u64, usize)> {
        let bar_offset = self.read_config_u32(self.cap_pci_cfg_offset + PCI_CFG_CAP_BAR_OFFSET);
        let len = self.read_config_u32(self.cap_pci_cfg_offset + PCI_CFG_CAP_LENGTH);
        match len {
            1 | 2 | 4 => Some((u64::from(bar_offset), len as usize)),
            _ => {
                warn!("pci: invalid virtio PCI_CFG access length {len}");
                METRICS.pci.invalid_virtio_access_count.inc();
                None
            }
        }
    }
}

impl PciDevice for VirtioPciDevice {
    fn read_config(&mut self, offset: u64, data: &mut [u8]) {
        // The PCI_CFG capability lets the guest reach BAR0 through the configuration space.
        if self.in_pci_cfg_window(offset, data.len()) {
            data.fill(0);
            if let Some((bar_offset, len)) = self.pci_cfg_access() {
                if len <= data.len() {
                    self.read_bar(bar_offset, &mut data[..len]);
                }
            }
            return;
        }
        self.config.read(offset, data);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        if self.in_pci_cfg_window(offset, data.len()) {
            if let Some((bar_offset, len)) = self.pci_cfg_access() {
                if len <= data.len() {
                    self.write_bar(bar_offset, &data[..len]);
                }
            }
            return;
        }
        self.config.write(offset, data);
    }
}

impl BusDevice for VirtioPciDevice {
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        self.read_bar(offset, data)
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) {
        self.write_bar(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::VIRTIO_ISR_QUEUE;
    use crate::devices::virtio::test_utils::{DummyDevice, PackedRing, default_mem};
    use crate::pci::configuration::{
        PCI_BASE_ADDRESS_0, PCI_CAPABILITY_LIST, PCI_COMMAND, PCI_COMMAND_MEMORY, PCI_STATUS,
        PCI_STATUS_CAP_LIST,
    };
    use crate::utils::ShutdownSignal;
    use crate::vstate::memory::{GuestAddress, GuestMemoryMmap};
    use crate::vstate::vm::tests::FakeVm;

    const BAR_ADDR: u64 = 0xd000_0000;

    struct TestContext {
        mem: GuestMemoryMmap,
        device: Arc<Mutex<DummyDevice>>,
        vm: Arc<FakeVm>,
        ioevents: Arc<IoEventDispatcher>,
        buses: IoBuses,
        pci: Arc<Mutex<VirtioPciDevice>>,
    }

    impl TestContext {
        fn new() -> Self {
            let mem = default_mem();
            let device = Arc::new(Mutex::new(DummyDevice::new(&mem, 2)));
            let vm = Arc::new(FakeVm::default());
            let ioevents = Arc::new(IoEventDispatcher::new(ShutdownSignal::new().unwrap()).unwrap());
            let buses = IoBuses::default();
            let pci = VirtioPciDevice::new(
                device.clone(),
                vm.clone(),
                ioevents.clone(),
                buses.clone(),
                15,
            )
            .unwrap();
            TestContext {
                mem,
                device,
                vm,
                ioevents,
                buses,
                pci,
            }
        }

        fn read_config(&self, offset: usize, len: usize) -> u32 {
            let mut data = [0u8; 4];
            self.pci
                .lock()
                .unwrap()
                .read_config(offset as u64, &mut data[..len]);
            u32::from_le_bytes(data)
        }

        fn write_config(&self, offset: usize, data: &[u8]) {
            self.pci.lock().unwrap().write_config(offset as u64, data);
        }

        // Programs BAR0 and enables memory decoding, as the guest firmware would.
        fn map_bar(&self) {
            self.write_config(PCI_BASE_ADDRESS_0, &(BAR_ADDR as u32).to_le_bytes());
            self.write_config(PCI_COMMAND, &PCI_COMMAND_MEMORY.to_le_bytes());
        }

        fn mmio_read(&self, offset: u64, len: usize) -> u32 {
            let mut data = [0u8; 4];
            assert!(self.buses.mmio.read(BAR_ADDR + offset, &mut data[..len]));
            u32::from_le_bytes(data)
        }

        fn mmio_write(&self, offset: u64, data: &[u8]) {
            assert!(self.buses.mmio.write(BAR_ADDR + offset, data));
        }
    }

    #[test]
    fn test_capability_layout() {
        assert_eq!(size_of::<VirtioPciCap>(), 14);
        assert_eq!(size_of::<VirtioPciNotifyCap>(), 18);
        assert_eq!(size_of::<VirtioPciCfgCap>(), 18);
    }

    #[test]
    fn test_pci_header() {
        let ctx = TestContext::new();
        assert_eq!(ctx.read_config(0x00, 2), u32::from(VIRTIO_PCI_VENDOR_ID));
        assert_eq!(ctx.read_config(0x02, 2), 0x1042);
        assert_eq!(ctx.read_config(0x08, 4) >> 8, VIRTIO_PCI_CLASS_CODE);
        assert_eq!(ctx.read_config(0x3c, 1), 15);
        assert_ne!(ctx.read_config(PCI_STATUS, 2) & u32::from(PCI_STATUS_CAP_LIST), 0);

        // The device interrupt is wired to line 15.
        let irqfds = ctx.vm.irqfds.lock().unwrap();
        assert_eq!(irqfds.len(), 1);
        assert_eq!(irqfds[0].0, 15);
    }

    #[test]
    fn test_capability_chain() {
        let ctx = TestContext::new();
        let mut next = ctx.read_config(PCI_CAPABILITY_LIST, 1) as usize;
        assert_eq!(next, 0x40);

        let mut caps = Vec::new();
        while next != 0 {
            let id = ctx.read_config(next, 1);
            assert_eq!(id, PciCapabilityId::VendorSpecific as u32);
            let cap_len = ctx.read_config(next + 2, 1);
            let cfg_type = ctx.read_config(next + 3, 1);
            let bar = ctx.read_config(next + 4, 1);
            let offset = ctx.read_config(next + 8, 4);
            let length = ctx.read_config(next + 12, 4);
            assert_eq!(bar, 0);
            caps.push((cfg_type, cap_len, offset, length));
            next = ctx.read_config(next + 1, 1) as usize;
        }
        assert_eq!(
            caps,
            vec![
                (1, 16, 0x00, 56),
                (2, 20, 0x3c, 4),
                (3, 16, 0x38, 4),
                (4, 16, 0x40, 0xc0),
                (5, 20, 0, 0),
            ]
        );
        // notify_off_multiplier.
        assert_eq!(ctx.read_config(0x50 + 16, 4), 0);
    }

    #[test]
    fn test_bar_mapping() {
        let ctx = TestContext::new();
        assert!(ctx.buses.mmio.is_empty());

        ctx.map_bar();
        assert_eq!(ctx.pci.lock().unwrap().config_bar_addr(), BAR_ADDR);
        let region = ctx.buses.mmio.find(BAR_ADDR + 0xff).unwrap();
        assert_eq!(region.base, BAR_ADDR);
        assert_eq!(region.len, 0x100);

        // num_queues through the BAR.
        assert_eq!(ctx.mmio_read(0x12, 2), 2);

        ctx.write_config(PCI_COMMAND, &0u16.to_le_bytes());
        assert!(ctx.buses.mmio.is_empty());
    }

    #[test]
    fn test_queue_enable_binds_doorbell() {
        let ctx = TestContext::new();
        ctx.map_bar();
        let ring = PackedRing::new(GuestAddress(0x1000), &ctx.mem, 8);

        ctx.mmio_write(0x16, &1u16.to_le_bytes());
        ctx.mmio_write(0x18, &8u16.to_le_bytes());
        ctx.mmio_write(0x20, &(ring.desc_table().0 as u32).to_le_bytes());
        ctx.mmio_write(0x28, &(ring.driver_area().0 as u32).to_le_bytes());
        ctx.mmio_write(0x30, &(ring.device_area().0 as u32).to_le_bytes());
        ctx.mmio_write(0x1c, &1u16.to_le_bytes());
        assert!(ctx.device.lock().unwrap().queues[1].ready);

        {
            let ioevents = ctx.vm.ioevents.lock().unwrap();
            assert_eq!(ioevents.len(), 1);
            assert_eq!(ioevents[0].0, GuestIoAddress::Mmio(BAR_ADDR + 0x3c));
            assert_eq!(ioevents[0].1, 1);
        }
        assert_eq!(ctx.ioevents.len(), 1);

        // Enabling again doesn't bind a second doorbell.
        ctx.mmio_write(0x1c, &1u16.to_le_bytes());
        assert_eq!(ctx.ioevents.len(), 1);
    }

    #[test]
    fn test_queue_enable_without_bar() {
        let ctx = TestContext::new();
        let ring = PackedRing::new(GuestAddress(0x1000), &ctx.mem, 8);
        let mut pci = ctx.pci.lock().unwrap();

        pci.write_bar(0x18, &8u16.to_le_bytes());
        pci.write_bar(0x20, &(ring.desc_table().0 as u32).to_le_bytes());
        pci.write_bar(0x28, &(ring.driver_area().0 as u32).to_le_bytes());
        pci.write_bar(0x30, &(ring.device_area().0 as u32).to_le_bytes());
        pci.write_bar(0x1c, &1u16.to_le_bytes());
        assert!(ctx.device.lock().unwrap().queues[0].ready);
        assert!(ctx.ioevents.is_empty());
    }

    #[test]
    fn test_inline_notify() {
        let ctx = TestContext::new();
        ctx.map_bar();

        ctx.mmio_write(0x3c, &1u16.to_le_bytes());
        ctx.mmio_write(0x3c, &[0]);
        // Unknown queue.
        ctx.mmio_write(0x3c, &7u16.to_le_bytes());
        assert_eq!(ctx.device.lock().unwrap().processed, vec![1, 0]);
    }

    #[test]
    fn test_isr_read_to_clear() {
        let ctx = TestContext::new();
        ctx.map_bar();

        ctx.device
            .lock()
            .unwrap()
            .irq_trigger
            .trigger_irq(VIRTIO_ISR_QUEUE)
            .unwrap();
        assert_eq!(ctx.mmio_read(0x38, 1), VIRTIO_ISR_QUEUE);
        assert_eq!(ctx.mmio_read(0x38, 1), 0);
    }

    #[test]
    fn test_device_config() {
        let ctx = TestContext::new();
        ctx.map_bar();

        assert_eq!(ctx.mmio_read(0x40, 4), u32::from_le_bytes([0, 1, 2, 3]));
        ctx.mmio_write(0x44, &[9, 9]);
        assert_eq!(ctx.device.lock().unwrap().config[4..6], [9, 9]);
    }

    #[test]
    fn test_pci_cfg_window() {
        let ctx = TestContext::new();
        let cap = ctx.pci.lock().unwrap().cap_pci_cfg_offset;

        // Read num_queues through the configuration space, BAR0 not mapped.
        ctx.write_config(cap + PCI_CFG_CAP_BAR_OFFSET, &0x12u32.to_le_bytes());
        ctx.write_config(cap + PCI_CFG_CAP_LENGTH, &2u32.to_le_bytes());
        assert_eq!(ctx.read_config(cap + PCI_CFG_CAP_DATA, 4), 2);

        // Write the device status.
        ctx.write_config(cap + PCI_CFG_CAP_BAR_OFFSET, &0x14u32.to_le_bytes());
        ctx.write_config(cap + PCI_CFG_CAP_LENGTH, &1u32.to_le_bytes());
        ctx.write_config(cap + PCI_CFG_CAP_DATA, &[0x03, 0, 0, 0]);
        assert_eq!(ctx.pci.lock().unwrap().common_config.device_status, 0x03);

        // Invalid lengths read as zero.
        ctx.write_config(cap + PCI_CFG_CAP_LENGTH, &3u32.to_le_bytes());
        assert_eq!(ctx.read_config(cap + PCI_CFG_CAP_DATA, 4), 0);
    }

    #[test]
    fn test_irqfd_failure() {
        let mem = default_mem();
        let device = Arc::new(Mutex::new(DummyDevice::new(&mem, 1)));
        let ioevents = Arc::new(IoEventDispatcher::new(ShutdownSignal::new().unwrap()).unwrap());
        let res = VirtioPciDevice::new(
            device,
            Arc::new(FakeVm::failing()),
            ioevents,
            IoBuses::default(),
            15,
        );
        assert!(matches!(res, Err(VirtioPciDeviceError::Vm(_))));
    }
}
