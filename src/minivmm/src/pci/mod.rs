// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

/// PCI host bridge and configuration mechanism #1
pub mod bus;
/// PCI configuration space handling
pub mod configuration;

/// Common logic of all PCI devices
pub trait PciDevice: Send {
    /// Reads `data.len()` bytes of the configuration space starting at `offset`.
    fn read_config(&mut self, offset: u64, data: &mut [u8]);
    /// Writes `data` into the configuration space starting at `offset`.
    ///
    /// Writes to the COMMAND register or to a BAR may (de)register regions on the I/O buses.
    fn write_config(&mut self, offset: u64, data: &[u8]);
}

/// Standard PCI capability IDs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciCapabilityId {
    /// Power management
    PowerManagement = 0x01,
    /// Message signalled interrupts
    MessageSignalledInterrupts = 0x05,
    /// Vendor specific, used by virtio
    VendorSpecific = 0x09,
    /// PCI express
    PciExpress = 0x10,
    /// MSI-X
    MsiX = 0x11,
}

/// A PCI capability list. Devices can optionally specify capabilities in their configuration space.
pub trait PciCapability {
    /// Bytes of the PCI capability, without the two byte (id, next) header
    fn bytes(&self) -> &[u8];
    /// Id of the PCI capability
    fn id(&self) -> PciCapabilityId;
}
