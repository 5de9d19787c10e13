// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vmm_sys_util::eventfd::EventFd;

/// Safely converts a u64 value to a usize value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn u64_to_usize(num: u64) -> usize {
    num as usize
}

/// Safely converts a usize value to a u64 value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn usize_to_u64(num: usize) -> u64 {
    num as u64
}

#[derive(Debug)]
struct ShutdownState {
    triggered: AtomicBool,
    evt: EventFd,
}

/// Cancellation signal shared by every thread of a microVM.
///
/// Threads blocked in epoll watch the file descriptor returned by [`AsRawFd::as_raw_fd`]; the
/// vCPU loop polls [`ShutdownSignal::is_triggered`] after each exit. The eventfd counter is
/// never drained, so it stays readable for every watcher once triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(Arc<ShutdownState>);

impl ShutdownSignal {
    /// Creates an untriggered signal.
    pub fn new() -> io::Result<Self> {
        Ok(ShutdownSignal(Arc::new(ShutdownState {
            triggered: AtomicBool::new(false),
            evt: EventFd::new(libc::EFD_NONBLOCK)?,
        })))
    }

    /// Requests every watcher to stop. Calling it more than once has no further effect.
    pub fn trigger(&self) -> io::Result<()> {
        if self.0.triggered.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.0.evt.write(1)
    }

    /// Whether [`ShutdownSignal::trigger`] was called.
    pub fn is_triggered(&self) -> bool {
        self.0.triggered.load(Ordering::Acquire)
    }
}

impl AsRawFd for ShutdownSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.0.evt.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal() {
        let signal = ShutdownSignal::new().unwrap();
        let clone = signal.clone();
        assert!(!clone.is_triggered());

        signal.trigger().unwrap();
        assert!(clone.is_triggered());
        // A second trigger doesn't bump the counter again.
        signal.trigger().unwrap();
        assert_eq!(signal.0.evt.read().unwrap(), 1);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(u64_to_usize(0x1000), 0x1000);
        assert_eq!(usize_to_u64(usize::MAX), u64::MAX);
    }
}
