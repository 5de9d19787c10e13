// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtio block device.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::disk::DiskProperties;
use super::request::Request;
use super::{BLOCK_QUEUE_SIZES, VIRTIO_BLK_F_RO, VirtioBlockError};
use crate::devices::virtio::queue::Queue;
use crate::devices::virtio::{
    IrqTrigger, TYPE_BLOCK, VIRTIO_F_RING_PACKED, VIRTIO_F_VERSION_1, VIRTIO_ISR_QUEUE,
    VirtioDevice,
};
use crate::logger::{IncMetric, METRICS, error, warn};
use crate::utils::u64_to_usize;
use crate::vstate::memory::GuestMemoryMmap;

/// Use this structure to set up the Block Device before booting the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VirtioBlockConfig {
    /// Path of the backing file on the host
    pub path_on_host: String,
    /// If set to true, the drive is opened in read-only mode. Otherwise, the
    /// drive is opened as read-write.
    #[serde(default)]
    pub is_read_only: bool,
}

/// Virtio device for exposing block level read/write operations on a host file.
#[derive(Debug)]
pub struct VirtioBlock {
    // Virtio fields.
    avail_features: u64,
    acked_features: u64,
    config_space: Vec<u8>,

    // Transport related fields.
    queues: Vec<Queue>,
    irq_trigger: IrqTrigger,
    mem: GuestMemoryMmap,

    // Host file and properties.
    disk: DiskProperties,
}

impl VirtioBlock {
    /// Create a new virtio block device that operates on the given file.
    pub fn new(config: VirtioBlockConfig, mem: GuestMemoryMmap) -> Result<Self, VirtioBlockError> {
        let disk = DiskProperties::new(Path::new(&config.path_on_host), config.is_read_only)?;

        let mut avail_features = (1u64 << VIRTIO_F_VERSION_1) | (1u64 << VIRTIO_F_RING_PACKED);
        if config.is_read_only {
            avail_features |= 1u64 << VIRTIO_BLK_F_RO;
        }

        let queues = BLOCK_QUEUE_SIZES.iter().map(|&s| Queue::new(s)).collect();

        Ok(VirtioBlock {
            avail_features,
            acked_features: 0u64,
            config_space: disk.virtio_block_config_space(),
            queues,
            irq_trigger: IrqTrigger::new().map_err(VirtioBlockError::IrqTrigger)?,
            mem,
            disk,
        })
    }

    /// Backing disk image.
    pub fn disk(&self) -> &DiskProperties {
        &self.disk
    }

    // Drains queue `queue_index`; returns whether any request was completed.
    fn drain_queue(&mut self, queue_index: usize) -> Result<bool, VirtioBlockError> {
        let queue = &mut self.queues[queue_index];
        let mut used_any = false;

        while let Some(head) = queue.pop(&self.mem)? {
            match Request::parse(head, queue, &self.mem) {
                Ok(request) => {
                    let len = request.execute(&self.disk, &self.mem);
                    queue.mark_used(&self.mem, &request.head, len)?;
                }
                Err(err) => {
                    error!("Malformed block request chain {}: {}", head.id, err);
                    METRICS.block.malformed_chain_count.inc();
                    // The chain is off the ring, hand it back empty.
                    queue.mark_used(&self.mem, &head, 0)?;
                }
            }
            used_any = true;
        }

        Ok(used_any)
    }
}

impl VirtioDevice for VirtioBlock {
    fn device_type(&self) -> u32 {
        TYPE_BLOCK
    }

    fn avail_features(&self) -> u64 {
        self.avail_features
    }

    fn acked_features(&self) -> u64 {
        self.acked_features
    }

    fn set_acked_features(&mut self, acked_features: u64) {
        self.acked_features = acked_features;
    }

    fn queues(&self) -> &[Queue] {
        &self.queues
    }

    fn queues_mut(&mut self) -> &mut [Queue] {
        &mut self.queues
    }

    fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    fn interrupt_trigger(&self) -> &IrqTrigger {
        &self.irq_trigger
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let config_len = self.config_space.len() as u64;
        if offset >= config_len {
            error!("Failed to read config space");
            return;
        }
        let start = u64_to_usize(offset);
        let len = data.len().min(self.config_space.len() - start);
        data[..len].copy_from_slice(&self.config_space[start..start + len]);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let start = usize::try_from(offset).ok();
        let end = start.and_then(|s| s.checked_add(data.len()));
        let Some(dst) = start
            .zip(end)
            .and_then(|(start, end)| self.config_space.get_mut(start..end))
        else {
            error!("Failed to write config space");
            return;
        };

        dst.copy_from_slice(data);
    }

    fn process_queue(&mut self, queue_index: usize) {
        METRICS.block.queue_event_count.inc();
        if queue_index >= self.queues.len() {
            warn!("Notification for unknown block queue {queue_index}");
            METRICS.block.event_fails.inc();
            return;
        }

        let used_any = match self.drain_queue(queue_index) {
            Ok(used_any) => used_any,
            Err(err) => {
                error!("Failed to process block queue: {}", err);
                METRICS.block.event_fails.inc();
                return;
            }
        };

        if !used_any {
            return;
        }
        match self.queues[queue_index].needs_notification(&self.mem) {
            Ok(true) => {
                if let Err(err) = self.irq_trigger.trigger_irq(VIRTIO_ISR_QUEUE) {
                    error!("Failed to signal used queue: {:?}", err);
                    METRICS.block.event_fails.inc();
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!("Failed to read the driver event area: {}", err);
                METRICS.block.event_fails.inc();
            }
        }
    }
}
