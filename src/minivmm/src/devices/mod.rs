// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Emulates virtual and hardware devices.

pub mod bus;
pub mod ioevent;
pub mod legacy;
pub mod virtio;

pub use self::bus::{Bus, BusDevice, IoBuses, RegionId, RegionInfo};
