// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Common configuration structure of a virtio PCI device.
pub mod common_config;
/// PCI function wrapping a virtio device.
pub mod device;

pub use self::device::{VirtioPciDevice, VirtioPciDeviceError};
