// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub use vm_memory::{
    Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestUsize, Le32,
};

/// Type of GuestMemoryMmap.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

/// Errors associated with guest memory creation.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MemoryError {
    /// Cannot create guest memory: {0}
    VmMemoryError(vm_memory::Error),
}

/// Creates anonymous guest memory out of `(start, size)` ranges.
pub fn create_anon_memory(ranges: &[(GuestAddress, usize)]) -> Result<GuestMemoryMmap, MemoryError> {
    GuestMemoryMmap::from_ranges(ranges).map_err(MemoryError::VmMemoryError)
}
