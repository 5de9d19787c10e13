// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Handles routing to devices in an address space.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use slab::Slab;

use crate::logger::{IncMetric, METRICS, debug};
use crate::utils::usize_to_u64;

/// Trait for devices that respond to reads or writes in an arbitrary address space.
///
/// The device does not care where it exists in address space as each method is only given an
/// offset into its allocated portion of address space.
#[allow(unused_variables)]
pub trait BusDevice: Send {
    /// Reads at `offset` from this device
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {}
    /// Writes at `offset` into this device
    fn write(&mut self, base: u64, offset: u64, data: &[u8]) {}
}

/// Stable handle of a region registered on a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

/// Location of a region registered on a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Handle of the region.
    pub id: RegionId,
    /// First address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub len: u64,
}

struct Region {
    base: u64,
    len: u64,
    device: Arc<Mutex<dyn BusDevice>>,
}

impl Region {
    fn offset_of(&self, addr: u64) -> Option<u64> {
        addr.checked_sub(self.base).filter(|offset| *offset < self.len)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

/// The two guest-visible address spaces.
#[derive(Debug, Clone, Default)]
pub struct IoBuses {
    /// Port-I/O bus.
    pub pio: Arc<Bus>,
    /// Memory-mapped I/O bus.
    pub mmio: Arc<Bus>,
}

/// A device container for routing reads and writes over some address space.
///
/// Regions are stored in a slab, so a [`RegionId`] stays valid until the region is deregistered.
/// Overlapping regions are not rejected; callers must not register them. Lookups never hold the
/// region table lock while a device handler runs, so handlers are free to (de)register regions.
#[derive(Debug, Default)]
pub struct Bus {
    regions: RwLock<Slab<Region>>,
}

impl Bus {
    /// Constructs a bus with no regions.
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Puts `device` in charge of `[base, base + len)`.
    pub fn register(&self, base: u64, len: u64, device: Arc<Mutex<dyn BusDevice>>) -> RegionId {
        let mut regions = self.regions.write().expect("Poisoned lock");
        RegionId(regions.insert(Region { base, len, device }))
    }

    /// Removes a region. Returns `false` if it was already detached.
    pub fn deregister(&self, id: RegionId) -> bool {
        let mut regions = self.regions.write().expect("Poisoned lock");
        regions.try_remove(id.0).is_some()
    }

    /// Moves a region to a new base address, keeping its length and device.
    pub fn set_base(&self, id: RegionId, base: u64) -> bool {
        let mut regions = self.regions.write().expect("Poisoned lock");
        match regions.get_mut(id.0) {
            Some(region) => {
                region.base = base;
                true
            }
            None => false,
        }
    }

    /// Returns the region containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<RegionInfo> {
        let regions = self.regions.read().expect("Poisoned lock");
        regions
            .iter()
            .find(|(_, region)| region.offset_of(addr).is_some())
            .map(|(id, region)| RegionInfo {
                id: RegionId(id),
                base: region.base,
                len: region.len,
            })
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.regions.read().expect("Poisoned lock").len()
    }

    /// Whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, addr: u64, size: usize) -> Option<(u64, u64, Arc<Mutex<dyn BusDevice>>)> {
        let regions = self.regions.read().expect("Poisoned lock");
        let Some((_, region)) = regions
            .iter()
            .find(|(_, region)| region.offset_of(addr).is_some())
        else {
            METRICS.bus.missed_access_count.inc();
            return None;
        };
        let offset = addr - region.base;
        // The whole access must fit, partially overlapping ones are dropped.
        match offset.checked_add(usize_to_u64(size)) {
            Some(end) if end <= region.len => {
                Some((region.base, offset, region.device.clone()))
            }
            _ => {
                debug!(
                    "bus: dropping access at {addr:#x} of {size} bytes straddling {:?}",
                    region
                );
                METRICS.bus.straddling_access_count.inc();
                None
            }
        }
    }

    /// Reads data from the device that owns the range containing `addr` and puts it into `data`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        if let Some((base, offset, device)) = self.resolve(addr, data.len()) {
            device
                .lock()
                .expect("Failed to acquire device lock")
                .read(base, offset, data);
            true
        } else {
            false
        }
    }

    /// Writes `data` to the device that owns the range containing `addr`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        if let Some((base, offset, device)) = self.resolve(addr, data.len()) {
            device
                .lock()
                .expect("Failed to acquire device lock")
                .write(base, offset, data);
            true
        } else {
            false
        }
    }

    /// Performs `data.len() / size` consecutive reads of `size` bytes at `addr`.
    ///
    /// String port-I/O instructions are batched by KVM into a single exit with a repeat count.
    pub fn read_repeated(&self, addr: u64, size: usize, data: &mut [u8]) {
        if size == 0 {
            return;
        }
        for chunk in data.chunks_exact_mut(size) {
            self.read(addr, chunk);
        }
    }

    /// Performs `data.len() / size` consecutive writes of `size` bytes at `addr`.
    pub fn write_repeated(&self, addr: u64, size: usize, data: &[u8]) {
        if size == 0 {
            return;
        }
        for chunk in data.chunks_exact(size) {
            self.write(addr, chunk);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Records every access it receives.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingDevice {
        pub(crate) reads: Vec<(u64, u64, usize)>,
        pub(crate) writes: Vec<(u64, u64, Vec<u8>)>,
    }

    impl BusDevice for RecordingDevice {
        fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {
            self.reads.push((base, offset, data.len()));
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = u8::try_from(offset).unwrap() + u8::try_from(i).unwrap();
            }
        }

        fn write(&mut self, base: u64, offset: u64, data: &[u8]) {
            self.writes.push((base, offset, data.to_vec()));
        }
    }

    struct ConstantDevice;
    impl BusDevice for ConstantDevice {}

    fn recording() -> Arc<Mutex<RecordingDevice>> {
        Arc::new(Mutex::new(RecordingDevice::default()))
    }

    #[test]
    fn test_bus_register_find() {
        let bus = Bus::new();
        assert!(bus.is_empty());
        let id = bus.register(0x10, 0x10, Arc::new(Mutex::new(ConstantDevice)));
        assert_eq!(bus.len(), 1);

        assert!(bus.find(0x0f).is_none());
        let info = bus.find(0x10).unwrap();
        assert_eq!(info, RegionInfo { id, base: 0x10, len: 0x10 });
        assert_eq!(bus.find(0x1f).unwrap().id, id);
        assert!(bus.find(0x20).is_none());

        assert!(bus.deregister(id));
        assert!(bus.find(0x10).is_none());
        // Already detached.
        assert!(!bus.deregister(id));
    }

    #[test]
    fn test_bus_read_write() {
        let bus = Bus::new();
        let dev = recording();
        bus.register(0x10, 0x10, dev.clone());

        let mut data = [0u8; 2];
        assert!(bus.read(0x12, &mut data));
        assert_eq!(data, [2, 3]);
        assert!(bus.write(0x1e, &[0xaa, 0xbb]));

        let dev = dev.lock().unwrap();
        assert_eq!(dev.reads, vec![(0x10, 2, 2)]);
        assert_eq!(dev.writes, vec![(0x10, 0xe, vec![0xaa, 0xbb])]);
    }

    #[test]
    fn test_bus_drops_straddling_access() {
        let bus = Bus::new();
        let low = recording();
        let high = recording();
        bus.register(0x3f8, 8, low.clone());
        bus.register(0x400, 8, high.clone());

        let mut data = [0xffu8; 4];
        assert!(!bus.read(0x3fe, &mut data));
        assert_eq!(data, [0xff; 4]);
        assert!(!bus.write(0x3fe, &[1, 2, 3, 4]));
        assert!(!bus.write(u64::MAX, &[1, 2]));

        assert!(low.lock().unwrap().reads.is_empty());
        assert!(low.lock().unwrap().writes.is_empty());
        assert!(high.lock().unwrap().reads.is_empty());
        assert!(high.lock().unwrap().writes.is_empty());

        // An access ending exactly at the region's end is fine.
        assert!(bus.write(0x3fc, &[1, 2, 3, 4]));
    }

    #[test]
    fn test_bus_reregistration() {
        let bus = Bus::new();
        let dev = recording();
        let mut before = [0u8; 1];
        let id = bus.register(0x100, 0x10, dev.clone());
        bus.read(0x105, &mut before);
        assert!(bus.deregister(id));
        assert!(!bus.read(0x105, &mut [0u8; 1]));

        let id2 = bus.register(0x100, 0x10, dev.clone());
        let mut after = [0u8; 1];
        bus.read(0x105, &mut after);
        assert_eq!(before, after);
        assert_eq!(bus.find(0x105).unwrap().id, id2);
        assert_eq!(dev.lock().unwrap().reads, vec![(0x100, 5, 1), (0x100, 5, 1)]);
    }

    #[test]
    fn test_bus_set_base() {
        let bus = Bus::new();
        let dev = recording();
        let id = bus.register(0x1000, 0x100, dev.clone());
        assert!(bus.set_base(id, 0x2000));
        assert!(bus.find(0x1000).is_none());
        assert!(bus.write(0x2004, &[1]));
        assert_eq!(dev.lock().unwrap().writes, vec![(0x2000, 4, vec![1])]);

        bus.deregister(id);
        assert!(!bus.set_base(id, 0x3000));
    }

    #[test]
    fn test_bus_repeated_access() {
        let bus = Bus::new();
        let dev = recording();
        bus.register(0x3f8, 8, dev.clone());

        bus.write_repeated(0x3f8, 1, b"abc");
        let mut data = [0u8; 4];
        bus.read_repeated(0x3f9, 2, &mut data);
        // A zero size is ignored instead of looping forever.
        bus.write_repeated(0x3f8, 0, b"abc");

        let dev = dev.lock().unwrap();
        assert_eq!(
            dev.writes,
            vec![
                (0x3f8, 0, b"a".to_vec()),
                (0x3f8, 0, b"b".to_vec()),
                (0x3f8, 0, b"c".to_vec())
            ]
        );
        assert_eq!(dev.reads, vec![(0x3f8, 1, 2), (0x3f8, 1, 2)]);
        assert_eq!(data, [1, 2, 1, 2]);
    }

    #[test]
    fn test_handler_can_register_regions() {
        struct Relocating(Arc<Bus>);
        impl BusDevice for Relocating {
            fn write(&mut self, _base: u64, _offset: u64, _data: &[u8]) {
                self.0.register(0x8000, 0x10, Arc::new(Mutex::new(ConstantDevice)));
            }
        }

        let bus = Arc::new(Bus::new());
        bus.register(0x10, 1, Arc::new(Mutex::new(Relocating(bus.clone()))));
        assert!(bus.write(0x10, &[1]));
        assert!(bus.find(0x8000).is_some());
    }

    proptest! {
        #[test]
        fn test_find_matches_containing_region(
            lens in proptest::collection::vec(1u64..0x100, 1..8),
            gaps in proptest::collection::vec(0u64..0x100, 8),
            probe in 0u64..0x1000,
        ) {
            let bus = Bus::new();
            let mut ranges = Vec::new();
            let mut base = 0;
            for (len, gap) in lens.iter().zip(gaps.iter()) {
                base += gap;
                let id = bus.register(base, *len, Arc::new(Mutex::new(ConstantDevice)));
                ranges.push((id, base, *len));
                base += len;
            }

            let expected = ranges
                .iter()
                .find(|(_, base, len)| probe >= *base && probe < base + len)
                .map(|(id, _, _)| *id);
            prop_assert_eq!(bus.find(probe).map(|info| info.id), expected);
        }
    }
}
