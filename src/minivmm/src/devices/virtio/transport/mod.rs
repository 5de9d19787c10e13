// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transports exposing virtio devices to the guest.

/// Virtio over PCI.
pub mod pci;
