// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Implements a virtio block device backed by a raw disk image.

pub mod device;
pub mod disk;
pub mod request;

use self::disk::DiskError;
use crate::devices::virtio::queue::{MAX_QUEUE_SIZE, QueueError};
use crate::vstate::memory::GuestMemoryError;

pub use self::device::{VirtioBlock, VirtioBlockConfig};

/// Sector shift for block device.
pub const SECTOR_SHIFT: u8 = 9;
/// Size of block sector.
pub const SECTOR_SIZE: u32 = (0x01_u32) << SECTOR_SHIFT;
/// The number of queues of block device.
pub const BLOCK_NUM_QUEUES: usize = 1;
/// Maximal size of each block queue.
pub const BLOCK_QUEUE_SIZES: [u16; BLOCK_NUM_QUEUES] = [MAX_QUEUE_SIZE];
/// Interrupt line of the block device.
pub const BLOCK_IRQ: u8 = 15;

/// Device is read-only.
pub const VIRTIO_BLK_F_RO: u32 = 5;

/// Errors the block device can trigger.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VirtioBlockError {
    /// Guest gave us too few descriptors in a descriptor chain.
    DescriptorChainTooShort,
    /// Guest gave us too many descriptors in a descriptor chain.
    DescriptorChainTooLong,
    /// Guest gave us a descriptor that was too short to use.
    DescriptorLengthTooSmall,
    /// Guest gave us a write only descriptor that protocol says to read from.
    UnexpectedWriteOnlyDescriptor,
    /// Guest gave us a read only descriptor that protocol says to write to.
    UnexpectedReadOnlyDescriptor,
    /// Disk image error: {0}
    Disk(#[from] DiskError),
    /// Failed to access the virtqueue: {0}
    Queue(#[from] QueueError),
    /// Request buffer is outside guest memory: {0}
    GuestMemory(GuestMemoryError),
    /// Error coming from the IRQ: {0}
    IrqTrigger(std::io::Error),
    /// Cannot create the interrupt eventfd: {0}
    EventFd(std::io::Error),
}
