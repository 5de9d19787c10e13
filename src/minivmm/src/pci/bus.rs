// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::sync::{Arc, Mutex};

use super::PciDevice;
use super::configuration::PCI_CONFIG_SPACE_SIZE;
use crate::devices::{Bus, BusDevice};
use crate::logger::{IncMetric, METRICS, debug, warn};
use crate::utils::{u64_to_usize, usize_to_u64};

/// Port of the CONFIG_ADDRESS register.
pub const PCI_CONFIG_ADDRESS_PORT: u64 = 0xcf8;
/// Port of the CONFIG_DATA register.
pub const PCI_CONFIG_DATA_PORT: u64 = 0xcfc;
/// Width of each of the two configuration ports.
pub const PCI_CONFIG_PORT_SIZE: u64 = 4;

const NUM_DEVICE_IDS: u8 = 32;

/// Errors for the PCI host bridge.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum PciRootError {
    /// All {0} device slots of bus 0 are in use
    NoPciDeviceSlotAvailable(u8),
}

/// Value latched in CONFIG_ADDRESS.
///
/// Layout: `enable:1 | reserved:7 | bus:8 | device:5 | function:3 | register:6 | offset:2`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PciConfigAddress(u32);

impl PciConfigAddress {
    const ENABLE_BIT: u32 = 0x8000_0000;
    const BUS_NUMBER_OFFSET: u32 = 16;
    const BUS_NUMBER_MASK: u32 = 0xff;
    const DEVICE_NUMBER_OFFSET: u32 = 11;
    const DEVICE_NUMBER_MASK: u32 = 0x1f;
    const FUNCTION_NUMBER_OFFSET: u32 = 8;
    const FUNCTION_NUMBER_MASK: u32 = 0x07;
    const REGISTER_NUMBER_OFFSET: u32 = 2;
    const REGISTER_NUMBER_MASK: u32 = 0x3f;
    const REGISTER_OFFSET_MASK: u32 = 0x3;

    /// Address of `register` of function 0 of `device` on bus 0, with the enable bit set.
    pub fn new(device: u8, register: u8) -> Self {
        PciConfigAddress(
            Self::ENABLE_BIT
                | ((u32::from(device) & Self::DEVICE_NUMBER_MASK) << Self::DEVICE_NUMBER_OFFSET)
                | ((u32::from(register) & Self::REGISTER_NUMBER_MASK)
                    << Self::REGISTER_NUMBER_OFFSET),
        )
    }

    /// Wraps a raw CONFIG_ADDRESS value.
    pub fn from_raw(raw: u32) -> Self {
        PciConfigAddress(raw)
    }

    /// Raw CONFIG_ADDRESS value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether configuration cycles are enabled.
    pub fn enabled(self) -> bool {
        self.0 & Self::ENABLE_BIT != 0
    }

    /// Bus number.
    pub fn bus(self) -> u32 {
        (self.0 >> Self::BUS_NUMBER_OFFSET) & Self::BUS_NUMBER_MASK
    }

    /// Device (slot) number.
    pub fn device(self) -> u32 {
        (self.0 >> Self::DEVICE_NUMBER_OFFSET) & Self::DEVICE_NUMBER_MASK
    }

    /// Function number.
    pub fn function(self) -> u32 {
        (self.0 >> Self::FUNCTION_NUMBER_OFFSET) & Self::FUNCTION_NUMBER_MASK
    }

    /// Index of the 32 bit register.
    pub fn register(self) -> u32 {
        (self.0 >> Self::REGISTER_NUMBER_OFFSET) & Self::REGISTER_NUMBER_MASK
    }

    /// Byte offset inside the register.
    pub fn reg_offset(self) -> u32 {
        self.0 & Self::REGISTER_OFFSET_MASK
    }

    fn clear_reg_offset(&mut self) {
        self.0 &= !Self::REGISTER_OFFSET_MASK;
    }
}

// Routes accesses of the internal config bus to a device's configuration space.
struct PciConfigRegion(Arc<Mutex<dyn PciDevice>>);

impl BusDevice for PciConfigRegion {
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        self.0
            .lock()
            .expect("Poisoned lock")
            .read_config(offset, data);
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) {
        self.0
            .lock()
            .expect("Poisoned lock")
            .write_config(offset, data);
    }
}

/// Emulates the PCI configuration access mechanism #1 (ports 0xCF8/0xCFC) of a host bridge.
///
/// Every device owns a 256 byte region on an internal bus keyed by its CONFIG_ADDRESS value,
/// so a data port access resolves the latched address exactly like a guest I/O access.
#[derive(Debug, Default)]
pub struct PciConfigIo {
    /// Config space register.
    config_address: PciConfigAddress,
    config_bus: Bus,
    next_device: u8,
}

impl PciConfigIo {
    /// Creates a host bridge with no devices.
    pub fn new() -> Self {
        PciConfigIo::default()
    }

    /// Plugs `device` into the next free slot of bus 0 and returns the slot number.
    pub fn register_device(
        &mut self,
        device: Arc<Mutex<dyn PciDevice>>,
    ) -> Result<u8, PciRootError> {
        if self.next_device >= NUM_DEVICE_IDS {
            return Err(PciRootError::NoPciDeviceSlotAvailable(NUM_DEVICE_IDS));
        }
        let slot = self.next_device;
        self.next_device += 1;
        let base = u64::from(PciConfigAddress::new(slot, 0).raw());
        self.config_bus.register(
            base,
            usize_to_u64(PCI_CONFIG_SPACE_SIZE),
            Arc::new(Mutex::new(PciConfigRegion(device))),
        );
        debug!("pci: device registered in slot {slot}");
        Ok(slot)
    }

    /// Value currently latched in CONFIG_ADDRESS.
    pub fn config_address(&self) -> PciConfigAddress {
        self.config_address
    }

    fn read_config_address(&self, offset: u64, data: &mut [u8]) {
        let bytes = self.config_address.raw().to_le_bytes();
        let start = u64_to_usize(offset);
        match bytes.get(start..start + data.len()) {
            Some(src) => data.copy_from_slice(src),
            None => data.fill(0xff),
        }
    }

    fn write_config_address(&mut self, offset: u64, data: &[u8]) {
        let mut bytes = self.config_address.raw().to_le_bytes();
        let start = u64_to_usize(offset);
        if let Some(dst) = bytes.get_mut(start..start + data.len()) {
            dst.copy_from_slice(data);
            self.config_address = PciConfigAddress::from_raw(u32::from_le_bytes(bytes));
        }
    }

    fn config_data_address(&self, offset: u64) -> u64 {
        u64::from(self.config_address.raw()) | offset
    }

    fn read_config_data(&mut self, offset: u64, data: &mut [u8]) {
        METRICS.pci.cfg_read_count.inc();
        if !self.config_bus.read(self.config_data_address(offset), data) {
            // Nothing decodes this address, the guest sees an absent device.
            METRICS.pci.missed_cfg_count.inc();
            data.fill(0xff);
        }
        self.config_address.clear_reg_offset();
    }

    fn write_config_data(&mut self, offset: u64, data: &[u8]) {
        METRICS.pci.cfg_write_count.inc();
        if !self.config_bus.write(self.config_data_address(offset), data) {
            METRICS.pci.missed_cfg_count.inc();
        }
        self.config_address.clear_reg_offset();
    }
}

impl BusDevice for PciConfigIo {
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {
        match base {
            PCI_CONFIG_ADDRESS_PORT => {
                self.read_config_address(offset, data);
                self.config_address.clear_reg_offset();
            }
            PCI_CONFIG_DATA_PORT => self.read_config_data(offset, data),
            _ => warn!("pci: read from unexpected port {base:#x}"),
        }
    }

    fn write(&mut self, base: u64, offset: u64, data: &[u8]) {
        match base {
            PCI_CONFIG_ADDRESS_PORT => {
                self.write_config_address(offset, data);
                self.config_address.clear_reg_offset();
            }
            PCI_CONFIG_DATA_PORT => self.write_config_data(offset, data),
            _ => warn!("pci: write to unexpected port {base:#x}"),
        }
    }
}
