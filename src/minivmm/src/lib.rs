// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device emulation core of a minimal KVM-based x86-64 virtual machine monitor.
//!
//! Guest port-I/O and MMIO exits are routed through an address [`devices::Bus`] to a PCI
//! host bridge, a virtio-over-PCI block device using packed virtqueues and a 16550 UART.
//! Virtqueue doorbells are bound to eventfds serviced by a dedicated
//! [`devices::ioevent::IoEventDispatcher`] thread.
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

/// Assembles the device graph of a microVM.
pub mod builder;
/// Emulates virtual and hardware devices.
pub mod devices;
/// Logging and metrics.
pub mod logger;
/// PCI configuration space and host bridge emulation.
pub mod pci;
/// Miscellaneous helpers shared across the crate.
pub mod utils;
/// Wrappers over structures used to configure the VMM.
pub mod vmm_config;
/// Platform primitives: guest memory, VM bindings and the vCPU exit loop.
pub mod vstate;

pub use crate::builder::{DeviceManager, StartDevicesError};
pub use crate::utils::ShutdownSignal;
