// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Implements virtio devices, queues, and transport mechanisms.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use vmm_sys_util::eventfd::EventFd;

use self::queue::Queue;
use crate::logger::{error, warn};
use crate::vstate::memory::GuestMemoryMmap;

pub mod block;
pub mod queue;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod transport;

/// Types taken from linux/virtio_ids.h.
/// Virtio block device ID.
pub const TYPE_BLOCK: u32 = 2;

/// Compliance with the virtio 1.0 specification.
pub const VIRTIO_F_VERSION_1: u32 = 32;
/// Support for the packed virtqueue layout.
pub const VIRTIO_F_RING_PACKED: u32 = 34;

/// ISR bit signalling used buffers.
pub const VIRTIO_ISR_QUEUE: u32 = 0x1;
/// ISR bit signalling a configuration change.
pub const VIRTIO_ISR_CONFIG: u32 = 0x2;

/// Helper struct that is responsible for triggering guest IRQs
///
/// The status word is shared with the transport, which exposes it as the ISR register.
#[derive(Debug)]
pub struct IrqTrigger {
    pub(crate) irq_status: Arc<AtomicU32>,
    pub(crate) irq_evt: EventFd,
}

impl IrqTrigger {
    /// Creates a trigger whose eventfd still has to be bound to an interrupt line.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            irq_status: Arc::new(AtomicU32::new(0)),
            irq_evt: EventFd::new(libc::EFD_NONBLOCK)?,
        })
    }

    /// Latches `status` into the ISR and raises the interrupt line.
    pub fn trigger_irq(&self, status: u32) -> Result<(), io::Error> {
        self.irq_status.fetch_or(status, Ordering::SeqCst);

        self.irq_evt.write(1).map_err(|err| {
            error!("Failed to send irq to the guest: {:?}", err);
            err
        })?;

        Ok(())
    }

    /// Returns the latched status and clears it.
    pub fn take_status(&self) -> u32 {
        self.irq_status.swap(0, Ordering::SeqCst)
    }

    /// Eventfd to bind to the guest interrupt line.
    pub fn irq_evt(&self) -> &EventFd {
        &self.irq_evt
    }
}

/// Trait for virtio devices to be driven by a virtio transport.
///
/// The lifecycle of a virtio device is to be moved to a virtio transport, which will then query
/// the device. The transport owns the common configuration; the device owns its queues and
/// its device specific configuration.
pub trait VirtioDevice: Debug + Send {
    /// The virtio device type.
    fn device_type(&self) -> u32;

    /// The set of feature bits offered by the device.
    fn avail_features(&self) -> u64;

    /// The set of feature bits acknowledged by the driver.
    fn acked_features(&self) -> u64;

    /// Stores the feature bits acknowledged by the driver.
    fn set_acked_features(&mut self, acked_features: u64);

    /// Returns the device queues.
    fn queues(&self) -> &[Queue];

    /// Returns a mutable reference to the device queues.
    fn queues_mut(&mut self) -> &mut [Queue];

    /// Guest memory the queues live in.
    fn guest_memory(&self) -> &GuestMemoryMmap;

    /// Interrupt raised when the device uses buffers.
    fn interrupt_trigger(&self) -> &IrqTrigger;

    /// Reads this device configuration space at `offset`.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Writes to this device configuration space at `offset`.
    fn write_config(&mut self, offset: u64, data: &[u8]);

    /// Handles a notification for queue `queue_index`: drains it and completes its requests.
    fn process_queue(&mut self, queue_index: usize);

    /// ORs `value` into the 32 bit half of the acknowledged features selected by `page`.
    fn ack_features_by_page(&mut self, page: u32, value: u32) {
        let shift = match page {
            0 => 0,
            1 => 32,
            _ => {
                warn!("Received acknowledge request for unknown feature page {page}");
                return;
            }
        };
        let acked = self.acked_features() | (u64::from(value) << shift);
        self.set_acked_features(acked);
    }

    /// Whether the driver acknowledged feature bit `feature`.
    fn has_feature(&self, feature: u32) -> bool {
        feature < 64 && self.acked_features() & (1 << feature) != 0
    }
}
