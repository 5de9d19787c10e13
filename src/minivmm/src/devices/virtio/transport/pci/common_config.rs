// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use crate::devices::virtio::VirtioDevice;
use crate::devices::virtio::queue::Queue;
use crate::logger::{IncMetric, METRICS, debug, info, warn};
use crate::vstate::memory::GuestAddress;

/// Size of the common configuration structure.
pub const COMMON_CONFIG_SIZE: u64 = 56;
/// Vector value meaning "no MSI-X vector": the device only signals through its legacy line.
pub const VIRTQ_MSI_NO_VECTOR: u16 = 0xffff;

/// Contains the data for reading and writing the common configuration structure of a virtio PCI
/// device.
///
/// * Registers:
///
/// ** About the whole device.
///    le32 device_feature_select;     // 0x00 // read-write
///    le32 device_feature;            // 0x04 // read-only for driver
///    le32 driver_feature_select;     // 0x08 // read-write
///    le32 driver_feature;            // 0x0C // read-write
///    le16 msix_config;               // 0x10 // read-write
///    le16 num_queues;                // 0x12 // read-only for driver
///    u8 device_status;               // 0x14 // read-write (driver_status)
///    u8 config_generation;           // 0x15 // read-only for driver
///
/// ** About a specific virtqueue.
///    le16 queue_select;              // 0x16 // read-write
///    le16 queue_size;                // 0x18 // read-write
///    le16 queue_msix_vector;         // 0x1A // read-write
///    le16 queue_enable;              // 0x1C // read-write (Ready)
///    le16 queue_notify_off;          // 0x1E // read-only for driver
///    le64 queue_desc;                // 0x20 // read-write
///    le64 queue_driver;              // 0x28 // read-write
///    le64 queue_device;              // 0x30 // read-write
///
/// The per-queue registers read back as zero while `queue_select` is out of range.
#[derive(Debug, Default)]
pub struct VirtioPciCommonConfig {
    /// Device status written by the driver
    pub device_status: u8,
    /// Bumped when the device configuration changes
    pub config_generation: u8,
    /// Which 32 bit half of the device features is exposed
    pub device_feature_select: u32,
    /// Which 32 bit half of the guest features a write acknowledges
    pub guest_feature_select: u32,
    /// Queue the per-queue registers refer to
    pub queue_select: u16,
}

impl VirtioPciCommonConfig {
    /// Reads a register of the common configuration.
    pub fn read(&self, offset: u64, data: &mut [u8], device: &dyn VirtioDevice) {
        match data.len() {
            1 => data[0] = self.read_common_config_byte(offset),
            2 => {
                let v = self.read_common_config_word(offset, device.queues());
                data.copy_from_slice(&v.to_le_bytes());
            }
            4 => {
                let v = self.read_common_config_dword(offset, device);
                data.copy_from_slice(&v.to_le_bytes());
            }
            len => {
                warn!("pci: invalid data length for virtio read: len {len}");
                METRICS.pci.invalid_virtio_access_count.inc();
                data.fill(0);
            }
        }
    }

    /// Writes a register of the common configuration.
    ///
    /// Returns the index of the queue this write enabled, if any.
    pub fn write(
        &mut self,
        offset: u64,
        data: &[u8],
        device: &mut dyn VirtioDevice,
    ) -> Option<u16> {
        match data.len() {
            1 => {
                self.write_common_config_byte(offset, data[0]);
                None
            }
            2 => {
                let value = u16::from_le_bytes([data[0], data[1]]);
                self.write_common_config_word(offset, value, device)
            }
            4 => {
                let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.write_common_config_dword(offset, value, device);
                None
            }
            len => {
                warn!("pci: invalid data length for virtio write: len {len}");
                METRICS.pci.invalid_virtio_access_count.inc();
                None
            }
        }
    }

    fn invalid_access(kind: &str, offset: u64) {
        warn!("pci: invalid virtio {kind} at {offset:#x}");
        METRICS.pci.invalid_virtio_access_count.inc();
    }

    fn read_common_config_byte(&self, offset: u64) -> u8 {
        // The driver is only allowed to do aligned, properly sized access.
        match offset {
            0x14 => self.device_status,
            0x15 => self.config_generation,
            _ => {
                Self::invalid_access("config byte read", offset);
                0
            }
        }
    }

    fn write_common_config_byte(&mut self, offset: u64, value: u8) {
        match offset {
            0x14 => {
                debug!("virtio: device status {:#x} -> {:#x}", self.device_status, value);
                self.device_status = value;
            }
            _ => Self::invalid_access("config byte write", offset),
        }
    }

    fn read_common_config_word(&self, offset: u64, queues: &[Queue]) -> u16 {
        match offset {
            0x10 => VIRTQ_MSI_NO_VECTOR,
            0x12 => u16::try_from(queues.len()).unwrap_or(u16::MAX), // num_queues
            0x16 => self.queue_select,
            0x18 => self.with_queue(queues, |q| q.size).unwrap_or(0),
            0x1a => VIRTQ_MSI_NO_VECTOR,
            0x1c => u16::from(self.with_queue(queues, |q| q.ready).unwrap_or(false)),
            0x1e => self.with_queue(queues, |q| q.notify_off).unwrap_or(0),
            _ => {
                Self::invalid_access("register word read", offset);
                0
            }
        }
    }

    fn write_common_config_word(
        &mut self,
        offset: u64,
        value: u16,
        device: &mut dyn VirtioDevice,
    ) -> Option<u16> {
        match offset {
            // No MSI-X: vectors stay unmapped.
            0x10 | 0x1a => {}
            0x16 => self.queue_select = value,
            0x18 => self.with_queue_mut(device.queues_mut(), |q| {
                if !q.ready {
                    q.size = value;
                }
            }),
            0x1c => return self.write_queue_enable(value, device),
            _ => Self::invalid_access("register word write", offset),
        }
        None
    }

    fn write_queue_enable(&mut self, value: u16, device: &mut dyn VirtioDevice) -> Option<u16> {
        match value {
            0 => {
                info!("virtio: guest disable virtq {}", self.queue_select);
                None
            }
            1 => {
                let mem = device.guest_memory().clone();
                let index = self.queue_select;
                let queue = device.queues_mut().get_mut(usize::from(index))?;
                match queue.enable(&mem) {
                    Ok(true) => {
                        debug!("virtio: enabled queue {index} of size {}", queue.size);
                        Some(index)
                    }
                    Ok(false) => None,
                    Err(err) => {
                        warn!("virtio: cannot enable queue {index}: {err}");
                        METRICS.pci.invalid_virtio_access_count.inc();
                        None
                    }
                }
            }
            _ => {
                Self::invalid_access("queue enable value", u64::from(value));
                None
            }
        }
    }

    fn read_common_config_dword(&self, offset: u64, device: &dyn VirtioDevice) -> u32 {
        fn half(features: u64, select: u32) -> u32 {
            // Only 64 bits of features (2 pages) are defined for now.
            if select < 2 {
                ((features >> (select * 32)) & 0xffff_ffff) as u32
            } else {
                0
            }
        }

        let queues = device.queues();
        match offset {
            0x00 => self.device_feature_select,
            0x04 => half(device.avail_features(), self.device_feature_select),
            0x08 => self.guest_feature_select,
            0x0c => half(device.acked_features(), self.guest_feature_select),
            0x20 => self.with_queue(queues, |q| lo(q.desc_table_address)).unwrap_or(0),
            0x24 => self.with_queue(queues, |q| hi(q.desc_table_address)).unwrap_or(0),
            0x28 => self.with_queue(queues, |q| lo(q.driver_area_address)).unwrap_or(0),
            0x2c => self.with_queue(queues, |q| hi(q.driver_area_address)).unwrap_or(0),
            0x30 => self.with_queue(queues, |q| lo(q.device_area_address)).unwrap_or(0),
            0x34 => self.with_queue(queues, |q| hi(q.device_area_address)).unwrap_or(0),
            _ => {
                Self::invalid_access("register dword read", offset);
                0
            }
        }
    }

    fn write_common_config_dword(
        &mut self,
        offset: u64,
        value: u32,
        device: &mut dyn VirtioDevice,
    ) {
        fn set_hi(v: &mut GuestAddress, x: u32) {
            *v = GuestAddress((v.0 & 0xffff_ffff) | (u64::from(x) << 32))
        }

        fn set_lo(v: &mut GuestAddress, x: u32) {
            *v = GuestAddress((v.0 & !0xffff_ffff) | u64::from(x))
        }

        match offset {
            0x00 => self.device_feature_select = value,
            0x08 => self.guest_feature_select = value,
            0x0c => device.ack_features_by_page(self.guest_feature_select, value),
            0x20 => self.with_queue_mut(device.queues_mut(), |q| {
                set_lo(&mut q.desc_table_address, value)
            }),
            0x24 => self.with_queue_mut(device.queues_mut(), |q| {
                set_hi(&mut q.desc_table_address, value)
            }),
            0x28 => self.with_queue_mut(device.queues_mut(), |q| {
                set_lo(&mut q.driver_area_address, value)
            }),
            0x2c => self.with_queue_mut(device.queues_mut(), |q| {
                set_hi(&mut q.driver_area_address, value)
            }),
            0x30 => self.with_queue_mut(device.queues_mut(), |q| {
                set_lo(&mut q.device_area_address, value)
            }),
            0x34 => self.with_queue_mut(device.queues_mut(), |q| {
                set_hi(&mut q.device_area_address, value)
            }),
            _ => Self::invalid_access("register dword write", offset),
        }
    }

    fn with_queue<U, F>(&self, queues: &[Queue], f: F) -> Option<U>
    where
        F: FnOnce(&Queue) -> U,
    {
        queues.get(usize::from(self.queue_select)).map(f)
    }

    fn with_queue_mut<F: FnOnce(&mut Queue)>(&self, queues: &mut [Queue], f: F) {
        if let Some(queue) = queues.get_mut(usize::from(self.queue_select)) {
            f(queue);
        }
    }
}

fn lo(addr: GuestAddress) -> u32 {
    (addr.0 & 0xffff_ffff) as u32
}

fn hi(addr: GuestAddress) -> u32 {
    (addr.0 >> 32) as u32
}
