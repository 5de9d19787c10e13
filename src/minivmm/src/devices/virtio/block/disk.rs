// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Raw disk image backing a block device.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{SECTOR_SHIFT, SECTOR_SIZE};
use crate::logger::warn;

/// Size of the block device configuration space: the capacity field.
pub const BLOCK_CONFIG_SPACE_SIZE: usize = 8;

/// Errors triggered by the disk image.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DiskError {
    /// Cannot open disk image {1:?}: {0}
    BackingFile(std::io::Error, PathBuf),
    /// Access of {len} bytes at offset {offset} is outside the disk image
    OutOfBounds {
        /// Byte offset of the access
        offset: u64,
        /// Length of the access
        len: usize,
    },
    /// Disk image is read-only
    ReadOnly,
    /// I/O on the disk image failed: {0}
    Io(std::io::Error),
}

/// Helper object for setting up all `Block` fields derived from its backing file.
#[derive(Debug)]
pub struct DiskProperties {
    file: File,
    file_path: PathBuf,
    nsectors: u64,
    image_size: u64,
    read_only: bool,
}

impl DiskProperties {
    // Helper function that opens the file with the proper access permissions
    fn open_file(disk_image_path: &Path, is_disk_read_only: bool) -> Result<File, DiskError> {
        OpenOptions::new()
            .read(true)
            .write(!is_disk_read_only)
            .open(disk_image_path)
            .map_err(|err| DiskError::BackingFile(err, disk_image_path.to_path_buf()))
    }

    // Helper function that gets the size of the file
    fn file_size(disk_image_path: &Path, disk_image: &mut File) -> Result<u64, DiskError> {
        let disk_size = disk_image
            .seek(SeekFrom::End(0))
            .map_err(|err| DiskError::BackingFile(err, disk_image_path.to_path_buf()))?;

        // If the image is not a multiple of the sector size, the tail bits are not exposed.
        if disk_size % u64::from(SECTOR_SIZE) != 0 {
            warn!(
                "Disk size {} is not a multiple of sector size {}; the remainder will not be \
                 visible to the guest.",
                disk_size, SECTOR_SIZE
            );
        }

        Ok(disk_size)
    }

    /// Opens the disk image at `disk_image_path`.
    pub fn new(disk_image_path: &Path, is_disk_read_only: bool) -> Result<Self, DiskError> {
        let mut disk_image = Self::open_file(disk_image_path, is_disk_read_only)?;
        let disk_size = Self::file_size(disk_image_path, &mut disk_image)?;

        Ok(Self {
            file: disk_image,
            file_path: disk_image_path.to_path_buf(),
            nsectors: disk_size >> SECTOR_SHIFT,
            image_size: disk_size,
            read_only: is_disk_read_only,
        })
    }

    /// Path of the backing file.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Number of whole sectors exposed to the guest.
    pub fn nsectors(&self) -> u64 {
        self.nsectors
    }

    /// Size of the image in bytes.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Whether the image was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), DiskError> {
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| offset.checked_add(len));
        match end {
            Some(end) if end <= self.image_size => Ok(()),
            _ => Err(DiskError::OutOfBounds { offset, len }),
        }
    }

    /// Fills `buf` with the image contents at byte `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), DiskError> {
        self.check_bounds(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(DiskError::Io)
    }

    /// Writes `buf` into the image at byte `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), DiskError> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        self.check_bounds(offset, buf.len())?;
        self.file.write_all_at(buf, offset).map_err(DiskError::Io)
    }

    /// Provides vec containing the virtio block configuration space
    /// buffer. The config space is populated with the disk size based
    /// on the backing file size.
    pub fn virtio_block_config_space(&self) -> Vec<u8> {
        // The config space is little endian.
        self.nsectors.to_le_bytes().to_vec()
    }
}
