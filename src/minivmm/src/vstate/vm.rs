// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;

use kvm_ioctls::{IoEventAddress, VmFd};
use vmm_sys_util::eventfd::EventFd;

/// Errors associated with the kernel bindings of a VM.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VmError {
    /// Cannot register ioeventfd at {0:?}: {1}
    RegisterIoEvent(GuestIoAddress, kvm_ioctls::Error),
    /// Cannot register irqfd for GSI {0}: {1}
    RegisterIrqFd(u32, kvm_ioctls::Error),
}

/// A guest address in one of the two I/O address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestIoAddress {
    /// Port-I/O address.
    Pio(u64),
    /// Memory-mapped I/O address.
    Mmio(u64),
}

impl From<GuestIoAddress> for IoEventAddress {
    fn from(addr: GuestIoAddress) -> Self {
        match addr {
            GuestIoAddress::Pio(addr) => IoEventAddress::Pio(addr),
            GuestIoAddress::Mmio(addr) => IoEventAddress::Mmio(addr),
        }
    }
}

/// Kernel-level eventfd bindings of a VM.
pub trait VmOps: Debug + Send + Sync {
    /// Makes guest writes of the 2-byte value `datamatch` at `addr` signal `evt` instead of
    /// exiting to userspace.
    fn register_ioevent(
        &self,
        evt: &EventFd,
        addr: GuestIoAddress,
        datamatch: u16,
    ) -> Result<(), VmError>;

    /// Makes writes to `evt` raise the guest interrupt line `gsi`.
    fn register_irqfd(&self, evt: &EventFd, gsi: u32) -> Result<(), VmError>;
}

impl VmOps for VmFd {
    fn register_ioevent(
        &self,
        evt: &EventFd,
        addr: GuestIoAddress,
        datamatch: u16,
    ) -> Result<(), VmError> {
        VmFd::register_ioevent(self, evt, &IoEventAddress::from(addr), datamatch)
            .map_err(|err| VmError::RegisterIoEvent(addr, err))
    }

    fn register_irqfd(&self, evt: &EventFd, gsi: u32) -> Result<(), VmError> {
        VmFd::register_irqfd(self, evt, gsi).map_err(|err| VmError::RegisterIrqFd(gsi, err))
    }
}
