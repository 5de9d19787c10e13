// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fmt;
use std::sync::{Mutex, Weak};

use super::{PciCapability, PciCapabilityId};
use crate::devices::{Bus, BusDevice, IoBuses, RegionId};
use crate::logger::{IncMetric, METRICS, debug, warn};
use crate::utils::u64_to_usize;

/// Size of a type 0 configuration space.
pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
/// Number of Base Address Registers of a type 0 header.
pub const NUM_BAR_REGS: usize = 6;

/// Offset of the vendor ID register.
pub const PCI_VENDOR_ID: usize = 0x00;
/// Offset of the device ID register.
pub const PCI_DEVICE_ID: usize = 0x02;
/// Offset of the COMMAND register.
pub const PCI_COMMAND: usize = 0x04;
/// Enables decoding of I/O space BARs.
pub const PCI_COMMAND_IO: u16 = 0x1;
/// Enables decoding of memory space BARs.
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
/// Offset of the STATUS register.
pub const PCI_STATUS: usize = 0x06;
/// Interrupt status bit.
pub const PCI_STATUS_INTERRUPT: u16 = 0x08;
/// The device implements a capability list.
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;
/// Offset of the revision ID, class code is stored in the next three bytes.
pub const PCI_CLASS_REVISION: usize = 0x08;
/// Offset of the header type register.
pub const PCI_HEADER_TYPE: usize = 0x0e;
/// Header type of a non-bridge device.
pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;
/// Offset of the first BAR.
pub const PCI_BASE_ADDRESS_0: usize = 0x10;
/// Offset of the last BAR.
pub const PCI_BASE_ADDRESS_5: usize = 0x24;
/// Offset of the capability list head pointer.
pub const PCI_CAPABILITY_LIST: usize = 0x34;
/// Offset of the interrupt line register.
pub const PCI_INTERRUPT_LINE: usize = 0x3c;
/// Offset of the interrupt pin register.
pub const PCI_INTERRUPT_PIN: usize = 0x3d;
/// Interrupt pin INTA#.
pub const PCI_INTERRUPT_PIN_INTA: u8 = 1;

const FIRST_CAPABILITY_OFFSET: usize = 0x40;
const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x1;
const PCI_BASE_ADDRESS_IO_MASK: u32 = !0x3;
const PCI_BASE_ADDRESS_MEM_MASK: u32 = !0xf;

/// Errors associated with building a configuration space.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum PciConfigurationError {
    /// BAR {0} does not exist
    InvalidBar(usize),
    /// BAR size {0:#x} is not a power of two
    InvalidBarSize(u32),
    /// BAR {0} is already in use
    BarInUse(usize),
    /// Capability of {0} bytes does not fit in the configuration space
    CapabilitySpaceFull(usize),
}

/// Address space decoded by a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBarRegionType {
    /// 32 bit memory space
    Memory32,
    /// Port-I/O space
    Io,
}

/// Identity of a type 0 device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciHeader {
    /// Vendor ID
    pub vendor_id: u16,
    /// Device ID
    pub device_id: u16,
    /// 24 bit class code: class, subclass and programming interface
    pub class_code: u32,
    /// Legacy interrupt line routed to the device
    pub irq_line: u8,
}

struct PciBar {
    size: u32,
    region_type: PciBarRegionType,
    handler: Weak<Mutex<dyn BusDevice>>,
    region: Option<RegionId>,
}

impl fmt::Debug for PciBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciBar")
            .field("size", &format_args!("{:#x}", self.size))
            .field("region_type", &self.region_type)
            .field("region", &self.region)
            .finish()
    }
}

/// Contains the configuration space of a PCI node.
///
/// See the [specification](https://en.wikipedia.org/wiki/PCI_configuration_space).
/// Accesses are plain byte copies into the 256 byte space, any width is accepted. Writes to the
/// COMMAND register and to the BARs additionally move the device's BAR regions on the I/O buses.
#[derive(Debug)]
pub struct PciConfiguration {
    space: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [Option<PciBar>; NUM_BAR_REGS],
    // Contains the byte offset and size of the last capability.
    last_capability: Option<(usize, usize)>,
    buses: IoBuses,
}

impl PciConfiguration {
    /// Create a new type 0 PCI configuration
    pub fn new_type0(header: PciHeader, buses: IoBuses) -> Self {
        let mut config = PciConfiguration {
            space: [0; PCI_CONFIG_SPACE_SIZE],
            bars: Default::default(),
            last_capability: None,
            buses,
        };
        config.write_u16(PCI_VENDOR_ID, header.vendor_id);
        config.write_u16(PCI_DEVICE_ID, header.device_id);
        // Revision 0 in the low byte.
        config.write_u32(PCI_CLASS_REVISION, (header.class_code & 0x00ff_ffff) << 8);
        config.space[PCI_HEADER_TYPE] = PCI_HEADER_TYPE_NORMAL;
        config.space[PCI_INTERRUPT_PIN] = PCI_INTERRUPT_PIN_INTA;
        config.space[PCI_INTERRUPT_LINE] = header.irq_line;
        config.write_u16(PCI_STATUS, PCI_STATUS_INTERRUPT);
        config
    }

    /// Reads `data.len()` bytes at `offset`. Out of range accesses read as zero.
    pub fn read(&self, offset: u64, data: &mut [u8]) {
        match self.range(offset, data.len()) {
            Some(range) => data.copy_from_slice(&self.space[range]),
            None => {
                warn!("pci: config read out of range at {offset:#x}");
                data.fill(0);
            }
        }
    }

    /// Writes `data` at `offset`, applying the COMMAND and BAR side effects.
    ///
    /// STATUS is read-only.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let Some(range) = self.range(offset, data.len()) else {
            warn!("pci: config write out of range at {offset:#x}");
            return;
        };
        let (start, end) = (range.start, range.end);
        let status = self.read_u16(PCI_STATUS);
        self.space[range].copy_from_slice(data);
        self.write_u16(PCI_STATUS, status);

        if start < PCI_COMMAND + 2 && end > PCI_COMMAND {
            self.update_bar_decoding();
        }
        if (PCI_BASE_ADDRESS_0..=PCI_BASE_ADDRESS_5 + 3).contains(&start) {
            self.reprogram_bar((start - PCI_BASE_ADDRESS_0) / 4);
        }
    }

    /// Declares BAR `bar_idx` with the given size and address space.
    ///
    /// `handler` receives the accesses once the guest assigns an address and enables decoding.
    pub fn add_pci_bar(
        &mut self,
        bar_idx: usize,
        size: u32,
        region_type: PciBarRegionType,
        handler: Weak<Mutex<dyn BusDevice>>,
    ) -> Result<(), PciConfigurationError> {
        let slot = self
            .bars
            .get_mut(bar_idx)
            .ok_or(PciConfigurationError::InvalidBar(bar_idx))?;
        if !size.is_power_of_two() {
            return Err(PciConfigurationError::InvalidBarSize(size));
        }
        if slot.is_some() {
            return Err(PciConfigurationError::BarInUse(bar_idx));
        }
        *slot = Some(PciBar {
            size,
            region_type,
            handler,
            region: None,
        });
        self.reprogram_bar(bar_idx);
        Ok(())
    }

    /// Returns the decode address currently programmed in BAR `bar_idx`, without flag bits.
    pub fn bar_addr(&self, bar_idx: usize) -> u64 {
        let Some(Some(bar)) = self.bars.get(bar_idx) else {
            return 0;
        };
        let mask = match bar.region_type {
            PciBarRegionType::Io => PCI_BASE_ADDRESS_IO_MASK,
            PciBarRegionType::Memory32 => PCI_BASE_ADDRESS_MEM_MASK,
        };
        u64::from(self.read_u32(Self::bar_offset(bar_idx)) & !(bar.size - 1) & mask)
    }

    /// Whether BAR `bar_idx` currently has a region on one of the I/O buses.
    pub fn is_bar_active(&self, bar_idx: usize) -> bool {
        matches!(self.bars.get(bar_idx), Some(Some(bar)) if bar.region.is_some())
    }

    /// Adds the capability `cap_data` to the list of capabilities.
    ///
    /// `cap_data` should not include the two-byte PCI capability header (type, next).
    /// Correct values will be generated automatically based on `cap_data.id()` and
    /// the position in the list. The last capability added ends the list.
    pub fn add_capability(
        &mut self,
        cap_data: &dyn PciCapability,
    ) -> Result<usize, PciConfigurationError> {
        let total_len = cap_data.bytes().len() + 2;
        let (cap_offset, tail_offset) = match self.last_capability {
            Some((offset, len)) => (Self::next_dword(offset, len), offset + 1),
            None => (FIRST_CAPABILITY_OFFSET, PCI_CAPABILITY_LIST),
        };
        let cap_pointer = u8::try_from(cap_offset)
            .ok()
            .filter(|_| cap_offset + total_len <= PCI_CONFIG_SPACE_SIZE)
            .ok_or(PciConfigurationError::CapabilitySpaceFull(total_len))?;

        let status = self.read_u16(PCI_STATUS) | PCI_STATUS_CAP_LIST;
        self.write_u16(PCI_STATUS, status);
        self.space[tail_offset] = cap_pointer;
        self.space[cap_offset] = cap_data.id() as u8;
        self.space[cap_offset + 1] = 0; // Next pointer.
        self.space[cap_offset + 2..cap_offset + total_len].copy_from_slice(cap_data.bytes());
        self.last_capability = Some((cap_offset, total_len));

        Ok(cap_offset)
    }

    /// Current value of the COMMAND register.
    pub fn command(&self) -> u16 {
        self.read_u16(PCI_COMMAND)
    }

    // Find the next aligned offset after the one given.
    fn next_dword(offset: usize, len: usize) -> usize {
        let next = offset + len;
        (next + 3) & !3
    }

    fn bar_offset(bar_idx: usize) -> usize {
        PCI_BASE_ADDRESS_0 + bar_idx * 4
    }

    fn range(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = u64_to_usize(offset);
        let end = start.checked_add(len)?;
        (end <= PCI_CONFIG_SPACE_SIZE).then_some(start..end)
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.space[offset], self.space[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.space[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.space[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.space[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    // Keeps only the address bits a BAR of this size decodes, plus the space flag.
    // Unimplemented BARs read back as zero so the guest sizes them as absent.
    fn reprogram_bar(&mut self, bar_idx: usize) {
        let offset = Self::bar_offset(bar_idx);
        let Some(bar) = &self.bars[bar_idx] else {
            self.write_u32(offset, 0);
            return;
        };
        let flag = match bar.region_type {
            PciBarRegionType::Io => PCI_BASE_ADDRESS_SPACE_IO,
            PciBarRegionType::Memory32 => 0,
        };
        let value = (self.read_u32(offset) & !(bar.size - 1)) | flag;
        let region = bar.region;
        let region_type = bar.region_type;
        self.write_u32(offset, value);

        if let Some(id) = region {
            let base = self.bar_addr(bar_idx);
            self.bus(region_type).set_base(id, base);
            debug!("pci: BAR{bar_idx} moved to {base:#x}");
        }
    }

    fn update_bar_decoding(&mut self) {
        let command = self.command();
        for bar_idx in 0..NUM_BAR_REGS {
            let Some(bar) = &self.bars[bar_idx] else {
                continue;
            };
            let enabled = match bar.region_type {
                PciBarRegionType::Io => command & PCI_COMMAND_IO != 0,
                PciBarRegionType::Memory32 => command & PCI_COMMAND_MEMORY != 0,
            };
            let active = bar.region.is_some();
            let addr = self.bar_addr(bar_idx);

            if enabled && !active && addr != 0 {
                self.activate_bar(bar_idx, addr);
            } else if !enabled && active {
                self.deactivate_bar(bar_idx);
            }
        }
    }

    fn activate_bar(&mut self, bar_idx: usize, addr: u64) {
        let Some(bar) = self.bars[bar_idx].as_mut() else {
            return;
        };
        let Some(device) = bar.handler.upgrade() else {
            warn!("pci: BAR{bar_idx} has no live handler");
            return;
        };
        let bus = match bar.region_type {
            PciBarRegionType::Io => &self.buses.pio,
            PciBarRegionType::Memory32 => &self.buses.mmio,
        };
        bar.region = Some(bus.register(addr, u64::from(bar.size), device));
        METRICS.pci.bar_activation_count.inc();
        debug!(
            "pci: BAR{bar_idx} decoding {:?} [{addr:#x}, {:#x})",
            bar.region_type,
            addr + u64::from(bar.size)
        );
    }

    fn deactivate_bar(&mut self, bar_idx: usize) {
        let Some(bar) = self.bars[bar_idx].as_mut() else {
            return;
        };
        if let Some(id) = bar.region.take() {
            let bus = match bar.region_type {
                PciBarRegionType::Io => &self.buses.pio,
                PciBarRegionType::Memory32 => &self.buses.mmio,
            };
            bus.deregister(id);
            METRICS.pci.bar_deactivation_count.inc();
            debug!("pci: BAR{bar_idx} decoding disabled");
        }
    }

    fn bus(&self, region_type: PciBarRegionType) -> &Bus {
        match region_type {
            PciBarRegionType::Io => &self.buses.pio,
            PciBarRegionType::Memory32 => &self.buses.mmio,
        }
    }
}
