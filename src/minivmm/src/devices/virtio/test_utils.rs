// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver side of a packed ring, for exercising devices in tests.

use std::collections::VecDeque;
use std::mem::size_of;

use crate::devices::virtio::queue::{
    DescFlags, MAX_QUEUE_SIZE, PackedDescriptor, PackedEvent, Queue,
};
use crate::devices::virtio::{
    IrqTrigger, TYPE_BLOCK, VIRTIO_F_RING_PACKED, VIRTIO_F_VERSION_1, VirtioDevice,
};
use crate::utils::usize_to_u64;
use crate::vstate::memory::test_utils::single_region_mem;
use crate::vstate::memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Asserts that `$metric` changed by `$delta` after evaluating `$block`.
#[macro_export]
macro_rules! check_metric_after_block {
    ($metric:expr, $delta:expr, $block:expr) => {{
        let before = $metric.count();
        let _ = $block;
        assert_eq!($metric.count(), before + $delta, "unexpected metric value");
    }};
}

/// Creates a [`GuestMemoryMmap`] with a single region of size 65536 (= 0x10000 hex) starting at
/// guest physical address 0
pub(crate) fn default_mem() -> GuestMemoryMmap {
    single_region_mem(0x10000)
}

/// A packed ring laid out in guest memory as `[descriptors | driver event | device event]`,
/// driven the way a guest driver would.
#[derive(Debug)]
pub(crate) struct PackedRing<'a> {
    mem: &'a GuestMemoryMmap,
    start: GuestAddress,
    size: u16,
    next_avail: u16,
    avail_wrap: bool,
    next_used: u16,
    used_wrap: bool,
    free: u16,
    next_id: u16,
    // Lengths of the chains not reclaimed yet, oldest first.
    in_flight: VecDeque<u16>,
}

impl<'a> PackedRing<'a> {
    pub(crate) fn new(start: GuestAddress, mem: &'a GuestMemoryMmap, size: u16) -> Self {
        let ring = PackedRing {
            mem,
            start,
            size,
            next_avail: 0,
            avail_wrap: true,
            next_used: 0,
            used_wrap: true,
            free: size,
            next_id: 0,
            in_flight: VecDeque::new(),
        };
        for index in 0..size {
            ring.set_desc(index, PackedDescriptor::default());
        }
        ring.set_driver_event_flags(0);
        ring
    }

    pub(crate) fn desc_table(&self) -> GuestAddress {
        self.start
    }

    pub(crate) fn driver_area(&self) -> GuestAddress {
        GuestAddress(
            self.start.0 + u64::from(self.size) * usize_to_u64(size_of::<PackedDescriptor>()),
        )
    }

    pub(crate) fn device_area(&self) -> GuestAddress {
        GuestAddress(self.driver_area().0 + usize_to_u64(size_of::<PackedEvent>()))
    }

    /// A queue configured for this ring, already enabled.
    pub(crate) fn create_queue(&self) -> Queue {
        let mut queue = Queue::new(MAX_QUEUE_SIZE);
        queue.size = self.size;
        queue.desc_table_address = self.desc_table();
        queue.driver_area_address = self.driver_area();
        queue.device_area_address = self.device_area();
        queue.enable(self.mem).unwrap();
        queue
    }

    pub(crate) fn desc(&self, index: u16) -> PackedDescriptor {
        self.mem.read_obj(self.desc_addr(index)).unwrap()
    }

    pub(crate) fn set_driver_event_flags(&self, flags: u16) {
        self.mem
            .write_obj(PackedEvent { off_wrap: 0, flags }, self.driver_area())
            .unwrap();
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.free > 0
    }

    /// Posts a chain of `(addr, len, device_writable)` buffers and returns its id.
    ///
    /// The head is published last so the device never sees a partial chain.
    pub(crate) fn add_chain(&mut self, buffers: &[(GuestAddress, u32, bool)]) -> u16 {
        let count = u16::try_from(buffers.len()).unwrap();
        assert!(count > 0 && count <= self.free, "no room for the chain");

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut head = None;
        for (i, (addr, len, write)) in buffers.iter().enumerate() {
            let mut flags = DescFlags::empty();
            if i + 1 < buffers.len() {
                flags |= DescFlags::NEXT;
            }
            if *write {
                flags |= DescFlags::WRITE;
            }
            flags |= if self.avail_wrap {
                DescFlags::AVAIL
            } else {
                DescFlags::USED
            };
            let desc = PackedDescriptor {
                addr: addr.0,
                len: *len,
                id,
                flags: flags.bits(),
            };
            if i == 0 {
                head = Some((self.next_avail, desc));
            } else {
                self.set_desc(self.next_avail, desc);
            }
            self.next_avail += 1;
            if self.next_avail == self.size {
                self.next_avail = 0;
                self.avail_wrap = !self.avail_wrap;
            }
        }
        let (index, desc) = head.unwrap();
        self.set_desc(index, desc);

        self.free -= count;
        self.in_flight.push_back(count);
        id
    }

    /// Reclaims the oldest chain if the device marked it used.
    pub(crate) fn reclaim_used(&mut self) -> bool {
        let flags = DescFlags::from_bits_retain(self.desc(self.next_used).flags);
        let used = flags.contains(DescFlags::AVAIL) == self.used_wrap
            && flags.contains(DescFlags::USED) == self.used_wrap;
        if !used {
            return false;
        }
        let Some(count) = self.in_flight.pop_front() else {
            return false;
        };
        for _ in 0..count {
            self.next_used += 1;
            if self.next_used == self.size {
                self.next_used = 0;
                self.used_wrap = !self.used_wrap;
            }
        }
        self.free += count;
        true
    }

    fn desc_addr(&self, index: u16) -> GuestAddress {
        GuestAddress(
            self.start.0 + u64::from(index) * usize_to_u64(size_of::<PackedDescriptor>()),
        )
    }

    fn set_desc(&self, index: u16, desc: PackedDescriptor) {
        self.mem.write_obj(desc, self.desc_addr(index)).unwrap();
    }
}

/// A virtio device that records the queues it is asked to process.
#[derive(Debug)]
pub(crate) struct DummyDevice {
    pub(crate) acked_features: u64,
    pub(crate) queues: Vec<Queue>,
    pub(crate) mem: GuestMemoryMmap,
    pub(crate) irq_trigger: IrqTrigger,
    pub(crate) config: Vec<u8>,
    pub(crate) processed: Vec<usize>,
}

impl DummyDevice {
    pub(crate) const FEATURES: u64 =
        (1 << VIRTIO_F_VERSION_1) | (1 << VIRTIO_F_RING_PACKED) | 0b101;

    pub(crate) fn new(mem: &GuestMemoryMmap, num_queues: usize) -> Self {
        DummyDevice {
            acked_features: 0,
            queues: vec![Queue::new(MAX_QUEUE_SIZE); num_queues],
            mem: mem.clone(),
            irq_trigger: IrqTrigger::new().unwrap(),
            config: (0..8).collect(),
            processed: Vec::new(),
        }
    }
}

impl VirtioDevice for DummyDevice {
    fn device_type(&self) -> u32 {
        TYPE_BLOCK
    }

    fn avail_features(&self) -> u64 {
        Self::FEATURES
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
        let start = usize::try_from(offset).unwrap();
        data.copy_from_slice(&self.config[start..start + data.len()]);
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let start = usize::try_from(offset).unwrap();
        self.config[start..start + data.len()].copy_from_slice(data);
    }

    fn process_queue(&mut self, queue_index: usize) {
        self.processed.push(queue_index);
    }
}
