// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Guest memory types.
pub mod memory;
/// vCPU exit handling.
pub mod vcpu;
/// Kernel bindings consumed by the devices.
pub mod vm;
