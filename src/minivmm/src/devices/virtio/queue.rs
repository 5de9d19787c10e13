// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Packed virtqueue, as described in section 2.7 of the virtio 1.1 specification.
//!
//! The ring is a single array of descriptors shared with the driver. Ownership of a slot is
//! carried by its AVAIL and USED flag bits, read against a wrap counter that flips every time
//! the device walks past the end of the ring.

use std::mem::size_of;
use std::sync::atomic::{Ordering, fence};

use bitflags::bitflags;

use crate::utils::usize_to_u64;
use crate::vstate::memory::{ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryError};

/// Max size of the virtio queues offered by our virtio devices.
pub const MAX_QUEUE_SIZE: u16 = 128;

/// Event suppression: the driver wants to be notified.
pub const RING_EVENT_FLAGS_ENABLE: u16 = 0x0;
/// Event suppression: the driver does not want to be notified.
pub const RING_EVENT_FLAGS_DISABLE: u16 = 0x1;

bitflags! {
    /// Flags of a packed descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// The buffer continues in the next slot.
        const NEXT = 1;
        /// The buffer is write-only for the device.
        const WRITE = 1 << 1;
        /// The buffer contains a table of descriptors.
        const INDIRECT = 1 << 2;
        /// Driver side ownership bit.
        const AVAIL = 1 << 7;
        /// Device side ownership bit.
        const USED = 1 << 15;
    }
}

/// Errors triggered while using a packed virtqueue.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum QueueError {
    /// Virtio queue size {0} is not in 1..={1}
    InvalidQueueSize(u16, u16),
    /// Ring area at {0:#x} of {1} bytes is outside guest memory
    RingOutOfMemory(u64, usize),
    /// Failed to access the virtio ring in guest memory: {0}
    MemoryError(#[from] GuestMemoryError),
}

/// A packed virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackedDescriptor {
    /// Guest physical address of the buffer
    pub addr: u64,
    /// Length of the buffer
    pub len: u32,
    /// Buffer id, echoed back by the device
    pub id: u16,
    /// See [`DescFlags`]
    pub flags: u16,
}

// SAFETY: `PackedDescriptor` is a POD and contains no padding.
unsafe impl ByteValued for PackedDescriptor {}

/// Event suppression structure of a packed ring.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackedEvent {
    /// Descriptor offset and wrap counter
    pub off_wrap: u16,
    /// One of the `RING_EVENT_FLAGS_*` values
    pub flags: u16,
}

// SAFETY: `PackedEvent` is a POD and contains no padding.
unsafe impl ByteValued for PackedEvent {}

/// A descriptor taken off the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailDescriptor {
    /// Slot of the ring the descriptor was read from
    pub index: u16,
    /// Guest physical address of the buffer
    pub addr: GuestAddress,
    /// Length of the buffer
    pub len: u32,
    /// Buffer id
    pub id: u16,
    /// Flags as found in the ring
    pub flags: DescFlags,
}

impl AvailDescriptor {
    /// Gets if this descriptor is followed by another one of the same chain.
    pub fn has_next(&self) -> bool {
        self.flags.contains(DescFlags::NEXT)
    }

    /// If the driver designated this as a write only descriptor.
    ///
    /// If this is false, this descriptor is read only.
    /// Write only means the emulated device can write and the driver can read.
    pub fn is_write_only(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }
}

/// A packed virtio queue's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    /// The maximal size in elements offered by the device
    pub max_size: u16,

    /// The queue size in elements the driver selected
    pub size: u16,

    /// Indicates if the queue is finished with configuration
    pub ready: bool,

    /// Offset of the queue doorbell, in units of the notify multiplier
    pub notify_off: u16,

    /// Guest physical address of the descriptor ring
    pub desc_table_address: GuestAddress,

    /// Guest physical address of the driver event suppression structure
    pub driver_area_address: GuestAddress,

    /// Guest physical address of the device event suppression structure
    pub device_area_address: GuestAddress,

    /// Next slot the device will inspect
    pub next_avail: u16,

    /// Ring wrap counter of the device
    pub wrap_counter: bool,
}

impl Queue {
    /// Constructs an empty virtio queue with the given `max_size`.
    pub fn new(max_size: u16) -> Queue {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            notify_off: 0,
            desc_table_address: GuestAddress(0),
            driver_area_address: GuestAddress(0),
            device_area_address: GuestAddress(0),
            next_avail: 0,
            wrap_counter: true,
        }
    }

    fn desc_table_size(&self) -> usize {
        size_of::<PackedDescriptor>() * usize::from(self.size)
    }

    fn check_area<M: GuestMemory>(
        mem: &M,
        addr: GuestAddress,
        len: usize,
    ) -> Result<(), QueueError> {
        if mem.check_range(addr, len) {
            Ok(())
        } else {
            Err(QueueError::RingOutOfMemory(addr.0, len))
        }
    }

    /// Validates the ring areas the driver configured and starts consuming from slot 0.
    ///
    /// Returns `Ok(false)` if the queue was already enabled, in which case nothing changes.
    pub fn enable<M: GuestMemory>(&mut self, mem: &M) -> Result<bool, QueueError> {
        if self.ready {
            return Ok(false);
        }
        if self.size == 0 || self.size > self.max_size {
            return Err(QueueError::InvalidQueueSize(self.size, self.max_size));
        }
        Self::check_area(mem, self.desc_table_address, self.desc_table_size())?;
        Self::check_area(mem, self.driver_area_address, size_of::<PackedEvent>())?;
        Self::check_area(mem, self.device_area_address, size_of::<PackedEvent>())?;

        // Ask the driver to always kick us.
        mem.write_obj(
            PackedEvent {
                off_wrap: 0,
                flags: RING_EVENT_FLAGS_ENABLE,
            },
            self.device_area_address,
        )?;

        self.next_avail = 0;
        self.wrap_counter = true;
        self.ready = true;
        Ok(true)
    }

    fn desc_addr(&self, index: u16) -> GuestAddress {
        // Index is always < size, the ring was validated on enable.
        GuestAddress(
            self.desc_table_address.0
                + u64::from(index) * usize_to_u64(size_of::<PackedDescriptor>()),
        )
    }

    fn is_available(&self, flags: DescFlags) -> bool {
        flags.contains(DescFlags::AVAIL) == self.wrap_counter
            && flags.contains(DescFlags::USED) != self.wrap_counter
    }

    /// Takes the descriptor at `next_avail` if the driver made it available.
    ///
    /// Returns `Ok(None)` when the ring is empty or the slot was not released by the driver yet.
    pub fn pop<M: GuestMemory>(&mut self, mem: &M) -> Result<Option<AvailDescriptor>, QueueError> {
        if !self.ready {
            return Ok(None);
        }

        let addr = self.desc_addr(self.next_avail);
        let flags_addr = GuestAddress(addr.0 + 14);
        let flags = DescFlags::from_bits_retain(mem.read_obj::<u16>(flags_addr)?);
        if !self.is_available(flags) {
            return Ok(None);
        }
        // The rest of the descriptor is valid once the flags say so.
        fence(Ordering::Acquire);
        let desc = mem.read_obj::<PackedDescriptor>(addr)?;

        let index = self.next_avail;
        self.next_avail += 1;
        if self.next_avail >= self.size {
            self.next_avail = 0;
            self.wrap_counter = !self.wrap_counter;
        }

        Ok(Some(AvailDescriptor {
            index,
            addr: GuestAddress(desc.addr),
            len: desc.len,
            id: desc.id,
            flags,
        }))
    }

    /// Hands `desc` back to the driver with `len` bytes written.
    ///
    /// The USED bit is toggled rather than set, so the slot reads as used for the wrap counter
    /// it was made available with.
    pub fn mark_used<M: GuestMemory>(
        &self,
        mem: &M,
        desc: &AvailDescriptor,
        len: u32,
    ) -> Result<(), QueueError> {
        let addr = self.desc_addr(desc.index);
        mem.write_obj(len, GuestAddress(addr.0 + 8))?;
        // The length must be visible before the slot changes owner.
        fence(Ordering::Release);
        let flags = desc.flags ^ DescFlags::USED;
        mem.write_obj(flags.bits(), GuestAddress(addr.0 + 14))?;
        Ok(())
    }

    /// Whether the driver asked to be interrupted when buffers are used.
    pub fn needs_notification<M: GuestMemory>(&self, mem: &M) -> Result<bool, QueueError> {
        fence(Ordering::SeqCst);
        let event = mem.read_obj::<PackedEvent>(self.driver_area_address)?;
        Ok(event.flags != RING_EVENT_FLAGS_DISABLE)
    }
}
