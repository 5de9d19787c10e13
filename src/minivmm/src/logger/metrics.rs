// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system.
//!
//! Every metric is a [`SharedIncMetric`]: a counter holding the current value and the value at the
//! last flush. Serializing a metric reports the delta between the two and moves the flush mark,
//! so each JSON line written by [`Metrics::write`] covers the interval since the previous one.
//! Counters can be bumped from any thread without locking.

use std::fmt::Debug;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Serialize, Serializer};

/// Static instance used for handling metrics.
pub static METRICS: Metrics<VmmCoreMetrics> = Metrics::new(VmmCoreMetrics::new());

/// Metrics system.
// All member fields have types which are Sync, and exhibit interior mutability, so
// we can call operations on metrics using a non-mut static global variable.
#[derive(Debug)]
pub struct Metrics<T: Serialize> {
    // Metrics will get flushed here.
    metrics_buf: OnceLock<Mutex<MetricsDestination>>,
    app_metrics: T,
}

impl<T: Serialize> Metrics<T> {
    /// Creates a new instance of the current metrics.
    pub const fn new(app_metrics: T) -> Metrics<T> {
        Metrics {
            metrics_buf: OnceLock::new(),
            app_metrics,
        }
    }

    /// Initialize metrics system (once and only once).
    pub fn init(&self, metrics_dest: Box<dyn Write + Send>) -> Result<(), MetricsError> {
        self.metrics_buf
            .set(Mutex::new(MetricsDestination(metrics_dest)))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Writes one JSON line to the destination provided upon initialization.
    ///
    /// Returns `Ok(false)` when the metrics system was never initialized.
    pub fn write(&self) -> Result<bool, MetricsError> {
        let Some(lock) = self.metrics_buf.get() else {
            return Ok(false);
        };
        let msg = serde_json::to_string(&self.app_metrics)
            .map_err(|err| MetricsError::Serde(err.to_string()))?;
        let mut guard = lock.lock().expect("Poisoned lock");
        let dest = &mut guard.0;
        dest.write_all(format!("{msg}\n").as_bytes())
            .and_then(|()| dest.flush())
            .map_err(MetricsError::Write)
            .map(|()| true)
    }
}

impl<T: Serialize> Deref for Metrics<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_metrics
    }
}

struct MetricsDestination(Box<dyn Write + Send>);

impl Debug for MetricsDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MetricsDestination")
    }
}

/// Describes the errors which may occur while handling metrics scenarios.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Reinitialization of metrics not allowed.
    AlreadyInitialized,
    /// {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Used for defining new types of metrics that act as a counter (i.e they are continuously updated
/// by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
    /// Returns diff of current and old value of the counter.
    fn fetch_diff(&self) -> u64;
}

/// Representation of a metric that is expected to be incremented from more than one thread, so more
/// synchronization is necessary.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Reset counters of each metrics. Here we suppose that Serialize's goal is to help with the
    /// flushing of metrics.
    /// !!! Any print of the metrics will also reset them. Use with caution !!!
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Metrics for the port-I/O and MMIO buses.
#[derive(Debug, Default, Serialize)]
pub struct BusMetrics {
    /// Accesses that hit no registered region.
    pub missed_access_count: SharedIncMetric,
    /// Accesses that started inside a region but did not fit in it.
    pub straddling_access_count: SharedIncMetric,
}
impl BusMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_access_count: SharedIncMetric::new(),
            straddling_access_count: SharedIncMetric::new(),
        }
    }
}

/// Metrics for the PCI host bridge and PCI devices.
#[derive(Debug, Default, Serialize)]
pub struct PciMetrics {
    /// Configuration space reads routed to a device.
    pub cfg_read_count: SharedIncMetric,
    /// Configuration space writes routed to a device.
    pub cfg_write_count: SharedIncMetric,
    /// Configuration accesses that matched no device.
    pub missed_cfg_count: SharedIncMetric,
    /// BAR regions registered on a bus.
    pub bar_activation_count: SharedIncMetric,
    /// BAR regions removed from a bus.
    pub bar_deactivation_count: SharedIncMetric,
    /// Malformed accesses to a virtio-pci BAR.
    pub invalid_virtio_access_count: SharedIncMetric,
}
impl PciMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            cfg_read_count: SharedIncMetric::new(),
            cfg_write_count: SharedIncMetric::new(),
            missed_cfg_count: SharedIncMetric::new(),
            bar_activation_count: SharedIncMetric::new(),
            bar_deactivation_count: SharedIncMetric::new(),
            invalid_virtio_access_count: SharedIncMetric::new(),
        }
    }
}

/// Metrics specific to the UART device.
#[derive(Debug, Default, Serialize)]
pub struct SerialDeviceMetrics {
    /// Errors triggered while using the UART device.
    pub error_count: SharedIncMetric,
    /// Number of read calls that did not trigger a read.
    pub missed_read_count: SharedIncMetric,
    /// Number of write calls that did not trigger a write.
    pub missed_write_count: SharedIncMetric,
    /// Number of bytes read by the guest from the receive buffer.
    pub read_count: SharedIncMetric,
    /// Number of bytes emitted to the console.
    pub write_count: SharedIncMetric,
    /// Number of input bytes lost because the receive FIFO was full.
    pub rx_overrun_count: SharedIncMetric,
}
impl SerialDeviceMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            error_count: SharedIncMetric::new(),
            missed_read_count: SharedIncMetric::new(),
            missed_write_count: SharedIncMetric::new(),
            read_count: SharedIncMetric::new(),
            write_count: SharedIncMetric::new(),
            rx_overrun_count: SharedIncMetric::new(),
        }
    }
}

/// Block device associated metrics.
#[derive(Debug, Default, Serialize)]
pub struct BlockDeviceMetrics {
    /// Number of times when handling a queue notification.
    pub queue_event_count: SharedIncMetric,
    /// Number of failures in signaling the guest.
    pub event_fails: SharedIncMetric,
    /// Number of successful read operations.
    pub read_count: SharedIncMetric,
    /// Number of successful write operations.
    pub write_count: SharedIncMetric,
    /// Bytes read by the guest.
    pub read_bytes: SharedIncMetric,
    /// Bytes written by the guest.
    pub write_bytes: SharedIncMetric,
    /// Requests completed with an I/O error status.
    pub io_errors: SharedIncMetric,
    /// Requests of an unsupported type.
    pub unsupported_count: SharedIncMetric,
    /// Descriptor chains that did not follow the header/data/status layout.
    pub malformed_chain_count: SharedIncMetric,
}
impl BlockDeviceMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            queue_event_count: SharedIncMetric::new(),
            event_fails: SharedIncMetric::new(),
            read_count: SharedIncMetric::new(),
            write_count: SharedIncMetric::new(),
            read_bytes: SharedIncMetric::new(),
            write_bytes: SharedIncMetric::new(),
            io_errors: SharedIncMetric::new(),
            unsupported_count: SharedIncMetric::new(),
            malformed_chain_count: SharedIncMetric::new(),
        }
    }
}

/// Metrics of the ioeventfd dispatcher thread.
#[derive(Debug, Default, Serialize)]
pub struct IoEventMetrics {
    /// Doorbell bindings created.
    pub registration_count: SharedIncMetric,
    /// Doorbells delivered to a device.
    pub notification_count: SharedIncMetric,
    /// Failures in draining a doorbell or waiting for events.
    pub event_fails: SharedIncMetric,
}
impl IoEventMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            registration_count: SharedIncMetric::new(),
            notification_count: SharedIncMetric::new(),
            event_fails: SharedIncMetric::new(),
        }
    }
}

/// Vcpu related metrics.
#[derive(Debug, Default, Serialize)]
pub struct VcpuMetrics {
    /// Number of KVM exits for handling input IO.
    pub exit_io_in: SharedIncMetric,
    /// Number of KVM exits for handling output IO.
    pub exit_io_out: SharedIncMetric,
    /// Number of KVM exits for handling MMIO reads.
    pub exit_mmio_read: SharedIncMetric,
    /// Number of KVM exits for handling MMIO writes.
    pub exit_mmio_write: SharedIncMetric,
    /// Number of errors during this VCPU's run.
    pub failures: SharedIncMetric,
}
impl VcpuMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            exit_io_in: SharedIncMetric::new(),
            exit_io_out: SharedIncMetric::new(),
            exit_mmio_read: SharedIncMetric::new(),
            exit_mmio_write: SharedIncMetric::new(),
            failures: SharedIncMetric::new(),
        }
    }
}

/// Metrics related to the virtual machine manager itself.
#[derive(Debug, Default, Serialize)]
pub struct VmmMetrics {
    /// Number of log lines that could not be written.
    pub missed_log_count: SharedIncMetric,
    /// Optional devices skipped because their setup failed.
    pub device_setup_fails: SharedIncMetric,
}
impl VmmMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_log_count: SharedIncMetric::new(),
            device_setup_fails: SharedIncMetric::new(),
        }
    }
}

/// Structure storing all metrics while enforcing serialization support on them.
#[derive(Debug, Default, Serialize)]
pub struct VmmCoreMetrics {
    /// Port-I/O and MMIO bus metrics.
    pub bus: BusMetrics,
    /// PCI related metrics.
    pub pci: PciMetrics,
    /// UART metrics.
    pub uart: SerialDeviceMetrics,
    /// Block device metrics.
    pub block: BlockDeviceMetrics,
    /// Doorbell dispatcher metrics.
    pub ioevent: IoEventMetrics,
    /// vCPU metrics.
    pub vcpu: VcpuMetrics,
    /// VMM metrics.
    pub vmm: VmmMetrics,
}
impl VmmCoreMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            bus: BusMetrics::new(),
            pci: PciMetrics::new(),
            uart: SerialDeviceMetrics::new(),
            block: BlockDeviceMetrics::new(),
            ioevent: IoEventMetrics::new(),
            vcpu: VcpuMetrics::new(),
            vmm: VmmMetrics::new(),
        }
    }
}
