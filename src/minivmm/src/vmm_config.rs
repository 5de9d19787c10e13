// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::devices::virtio::block::VirtioBlockConfig;
use crate::logger::{LOGGER, LoggerConfig, LoggerUpdateError, METRICS, MetricsError};

/// Errors encountered when configuring the VMM.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VmmConfigError {
    /// Invalid JSON configuration: {0}
    InvalidJson(serde_json::Error),
    /// Cannot configure the logger: {0}
    Logger(#[from] LoggerUpdateError),
    /// Cannot open the metrics file: {0}
    MetricsFile(io::Error),
    /// Cannot initialize the metrics: {0}
    Metrics(#[from] MetricsError),
}

/// Where the guest console writes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialOutput {
    /// The VMM standard output. Console input is then read from stdin.
    #[default]
    Stdout,
    /// Nowhere.
    Sink,
}

/// Configuration of the COM1 console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Whether the UART is plugged in.
    #[serde(default = "default_serial_enabled")]
    pub enabled: bool,
    /// Console destination.
    #[serde(default)]
    pub output: SerialOutput,
}

fn default_serial_enabled() -> bool {
    true
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            enabled: default_serial_enabled(),
            output: SerialOutput::default(),
        }
    }
}

/// Configuration of the metrics system.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Named pipe or file used as output for metrics.
    pub metrics_path: PathBuf,
}

/// Used for configuring a VMM from one single JSON document.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmmConfig {
    /// Logger settings, the defaults log warnings and errors to stderr.
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    /// Metrics destination, metrics are not flushed without one.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// The console.
    #[serde(default)]
    pub serial: SerialConfig,
    /// The virtio block device, if any.
    #[serde(default)]
    pub block: Option<VirtioBlockConfig>,
}

impl VmmConfig {
    /// Parses a configuration document.
    pub fn from_json(config_json: &str) -> Result<Self, VmmConfigError> {
        serde_json::from_str(config_json).map_err(VmmConfigError::InvalidJson)
    }

    /// Applies the logger and metrics settings.
    ///
    /// The metrics destination can only be set once per process.
    pub fn init_observability(&self) -> Result<(), VmmConfigError> {
        if let Some(logger) = &self.logger {
            LOGGER.update(logger.clone())?;
        }
        if let Some(metrics) = &self.metrics {
            let file = OpenOptions::new()
                .custom_flags(libc::O_NONBLOCK)
                .create(true)
                .append(true)
                .open(&metrics.metrics_path)
                .map_err(VmmConfigError::MetricsFile)?;
            METRICS.init(Box::new(file))?;
        }
        Ok(())
    }
}
