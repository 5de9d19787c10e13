// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Parsing and execution of block requests.

use std::mem::size_of;

use super::disk::{DiskError, DiskProperties};
use super::{SECTOR_SHIFT, VirtioBlockError};
use crate::devices::virtio::queue::{AvailDescriptor, Queue};
use crate::logger::{IncMetric, METRICS, warn};
use crate::utils::u64_to_usize;
use crate::vstate::memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

/// Read sectors into the data buffer.
pub const VIRTIO_BLK_T_IN: u32 = 0;
/// Write the data buffer into sectors.
pub const VIRTIO_BLK_T_OUT: u32 = 1;

/// Request completed successfully.
pub const VIRTIO_BLK_S_OK: u8 = 0;
/// Request failed on the disk image.
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
/// Request type is not supported.
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Kind of a block request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// Disk read
    In,
    /// Disk write
    Out,
    /// Anything else, completed with `VIRTIO_BLK_S_UNSUPP`
    Unsupported(u32),
}

impl From<u32> for RequestType {
    fn from(value: u32) -> Self {
        match value {
            VIRTIO_BLK_T_IN => RequestType::In,
            VIRTIO_BLK_T_OUT => RequestType::Out,
            t => RequestType::Unsupported(t),
        }
    }
}

/// The request header represents the mandatory fields of each block device request.
///
/// A request header contains the following fields:
///   * request_type: an u32 value mapping to a read, write or an unsupported operation.
///   * ioprio: an u32 value the device ignores.
///   * sector: an u64 value representing the offset where a read/write is to occur.
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct RequestHeader {
    request_type: u32,
    ioprio: u32,
    sector: u64,
}

// SAFETY: Safe because RequestHeader only contains plain data.
unsafe impl ByteValued for RequestHeader {}

impl RequestHeader {
    /// Builds a header for a request of `request_type` at `sector`.
    pub fn new(request_type: u32, sector: u64) -> RequestHeader {
        RequestHeader {
            request_type,
            ioprio: 0,
            sector,
        }
    }
}

/// A parsed block request: header, data and status descriptors.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    /// What the guest asks for
    pub r#type: RequestType,
    /// Head descriptor, handed back to the driver on completion
    pub head: AvailDescriptor,
    /// Length of the data buffer
    pub data_len: u32,
    /// Where the status byte goes
    pub status_addr: GuestAddress,
    sector: u64,
    data_addr: GuestAddress,
}

impl Request {
    /// Parses the chain starting at `head`, taking the rest of the chain off `queue`.
    ///
    /// The whole chain is consumed before anything is validated, so a rejected request
    /// never leaves descriptors behind in the ring.
    pub fn parse(
        head: AvailDescriptor,
        queue: &mut Queue,
        mem: &GuestMemoryMmap,
    ) -> Result<Request, VirtioBlockError> {
        let tail = Self::pop_tail(&head, queue, mem)?;

        // The head contains the request type which MUST be readable.
        if head.is_write_only() {
            return Err(VirtioBlockError::UnexpectedWriteOnlyDescriptor);
        }
        if (head.len as usize) < size_of::<RequestHeader>() {
            return Err(VirtioBlockError::DescriptorLengthTooSmall);
        }

        let header: RequestHeader = mem
            .read_obj(head.addr)
            .map_err(VirtioBlockError::GuestMemory)?;
        let r#type = RequestType::from(header.request_type);

        // Reads and writes carry one data buffer. Other requests may come without one.
        let (data_desc, status_desc) = match (r#type, tail.as_slice()) {
            (_, []) => return Err(VirtioBlockError::DescriptorChainTooShort),
            (RequestType::Unsupported(_), [status]) => (None, status),
            (RequestType::Unsupported(_), [data, .., status]) => (Some(data), status),
            (_, [_]) => return Err(VirtioBlockError::DescriptorChainTooShort),
            (_, [data, status]) => (Some(data), status),
            (_, _) => return Err(VirtioBlockError::DescriptorChainTooLong),
        };

        match (r#type, data_desc) {
            (RequestType::In, Some(data)) if !data.is_write_only() => {
                return Err(VirtioBlockError::UnexpectedReadOnlyDescriptor);
            }
            (RequestType::Out, Some(data)) if data.is_write_only() => {
                return Err(VirtioBlockError::UnexpectedWriteOnlyDescriptor);
            }
            _ => {}
        }

        // The status MUST always be writable.
        if !status_desc.is_write_only() {
            return Err(VirtioBlockError::UnexpectedReadOnlyDescriptor);
        }
        if status_desc.len < 1 {
            return Err(VirtioBlockError::DescriptorLengthTooSmall);
        }

        Ok(Request {
            r#type,
            head,
            data_len: data_desc.map_or(0, |d| d.len),
            status_addr: status_desc.addr,
            sector: header.sector,
            data_addr: data_desc.map_or(GuestAddress(0), |d| d.addr),
        })
    }

    // Pops the descriptors linked after `head`, at most one ring's worth.
    fn pop_tail(
        head: &AvailDescriptor,
        queue: &mut Queue,
        mem: &GuestMemoryMmap,
    ) -> Result<Vec<AvailDescriptor>, VirtioBlockError> {
        let mut tail = Vec::new();
        let mut has_next = head.has_next();
        while has_next {
            if tail.len() + 1 >= usize::from(queue.size) {
                return Err(VirtioBlockError::DescriptorChainTooLong);
            }
            // The driver publishes the head last, so a missing link is a broken chain.
            let desc = queue
                .pop(mem)?
                .ok_or(VirtioBlockError::DescriptorChainTooShort)?;
            has_next = desc.has_next();
            tail.push(desc);
        }
        Ok(tail)
    }

    // Byte range of the disk this request touches, clamped to the end of the disk.
    fn disk_range(&self, disk: &DiskProperties) -> Option<(u64, usize)> {
        let offset = self.sector.checked_mul(1 << SECTOR_SHIFT)?;
        let disk_size = disk.nsectors() << SECTOR_SHIFT;
        if offset >= disk_size {
            return None;
        }
        let len = u64::from(self.data_len).min(disk_size - offset);
        Some((offset, u64_to_usize(len)))
    }

    fn transfer(&self, disk: &DiskProperties, mem: &GuestMemoryMmap) -> Result<u32, VirtioBlockError> {
        let (offset, len) = self.disk_range(disk).ok_or(DiskError::OutOfBounds {
            offset: self.sector.saturating_mul(1 << SECTOR_SHIFT),
            len: self.data_len as usize,
        })?;
        let mut buf = vec![0u8; len];
        match self.r#type {
            RequestType::In => {
                disk.read_at(&mut buf, offset)?;
                mem.write_slice(&buf, self.data_addr)
                    .map_err(VirtioBlockError::GuestMemory)?;
                METRICS.block.read_count.inc();
                METRICS.block.read_bytes.add(len as u64);
            }
            RequestType::Out => {
                mem.read_slice(&mut buf, self.data_addr)
                    .map_err(VirtioBlockError::GuestMemory)?;
                disk.write_at(&buf, offset)?;
                METRICS.block.write_count.inc();
                METRICS.block.write_bytes.add(len as u64);
            }
            RequestType::Unsupported(_) => return Ok(0),
        }
        // len is bounded by data_len.
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }

    /// Runs the request against `disk` and writes its status byte.
    ///
    /// Returns the number of data bytes transferred, which is 0 for failed requests.
    pub fn execute(&self, disk: &DiskProperties, mem: &GuestMemoryMmap) -> u32 {
        let (status, transferred) = match self.r#type {
            RequestType::Unsupported(t) => {
                warn!("Received unsupported block request type {t}");
                METRICS.block.unsupported_count.inc();
                (VIRTIO_BLK_S_UNSUPP, 0)
            }
            _ => match self.transfer(disk, mem) {
                Ok(len) => (VIRTIO_BLK_S_OK, len),
                Err(err) => {
                    warn!("Failed to execute {:?} request: {}", self.r#type, err);
                    METRICS.block.io_errors.inc();
                    (VIRTIO_BLK_S_IOERR, 0)
                }
            },
        };

        if let Err(err) = mem.write_obj(status, self.status_addr) {
            warn!("Failed to write block request status: {}", err);
            METRICS.block.event_fails.inc();
        }
        transferred
    }
}
