// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics collection.

mod logging;
mod metrics;

pub use log::{debug, error, info, trace, warn};

pub use crate::logger::logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, LevelFilter, LevelFilterFromStrError,
    Logger, LoggerConfig, LoggerInitError, LoggerUpdateError,
};
pub use crate::logger::metrics::{
    BlockDeviceMetrics, BusMetrics, IncMetric, IoEventMetrics, METRICS, Metrics, MetricsError,
    PciMetrics, SerialDeviceMetrics, SharedIncMetric, VcpuMetrics, VmmCoreMetrics, VmmMetrics,
};
