// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! LitePCIe driver control structures and request codes (DMA subset).
//!
//! These structures match the layout of `litepcie.h` shared by the Linux
//! kernel module and the Windows KMDF driver. On Linux the request codes are
//! `_IOC` encodings with magic `'S'`; on Windows they are `CTL_CODE`s with
//! `METHOD_BUFFERED`.

use crate::channel::{Direction, Directions};
use crate::device::Counts;
use crate::error::DmaError;

/// `struct litepcie_ioctl_dma`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmaLoopback {
    pub loopback_enable: u8,
}

/// `struct litepcie_ioctl_dma_writer` / `struct litepcie_ioctl_dma_reader`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmaEngine {
    pub enable: u8,
    pub hw_count: i64,
    pub sw_count: i64,
}

impl DmaEngine {
    /// Request enabling (or disabling) the engine.
    pub fn request(enable: bool) -> Self {
        Self {
            enable: enable as u8,
            ..Self::default()
        }
    }

    /// Counters reported by the driver.
    pub fn counts(&self, direction: Direction) -> Result<Counts, DmaError> {
        let hw_count = u64::try_from(self.hw_count).map_err(|_| {
            DmaError::violation(direction, format!("negative hw_count {}", self.hw_count))
        })?;
        let sw_count = u64::try_from(self.sw_count).map_err(|_| {
            DmaError::violation(direction, format!("negative sw_count {}", self.sw_count))
        })?;
        Ok(Counts { hw_count, sw_count })
    }
}

/// `struct litepcie_ioctl_lock`.
///
/// The driver sets each `*_status` to 1 unless the corresponding request was
/// refused because the lock is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmaLock {
    pub dma_reader_request: u8,
    pub dma_writer_request: u8,
    pub dma_reader_release: u8,
    pub dma_writer_release: u8,
    pub dma_reader_status: u8,
    pub dma_writer_status: u8,
}

impl DmaLock {
    /// Request the locks for `wanted`.
    pub fn request(wanted: Directions) -> Self {
        Self {
            dma_reader_request: wanted.has(Direction::Outbound) as u8,
            dma_writer_request: wanted.has(Direction::Inbound) as u8,
            ..Self::default()
        }
    }

    /// Release the locks for `release`.
    pub fn release(release: Directions) -> Self {
        Self {
            dma_reader_release: release.has(Direction::Outbound) as u8,
            dma_writer_release: release.has(Direction::Inbound) as u8,
            ..Self::default()
        }
    }

    /// Requested directions the driver granted.
    pub fn granted(&self) -> Directions {
        let mut granted = Directions::empty();
        if self.dma_writer_request != 0 && self.dma_writer_status != 0 {
            granted |= Directions::INBOUND;
        }
        if self.dma_reader_request != 0 && self.dma_reader_status != 0 {
            granted |= Directions::OUTBOUND;
        }
        granted
    }
}

/// `struct litepcie_ioctl_mmap_dma_info`.
///
/// `tx` buffers feed the reader engine (outbound), `rx` buffers are filled by
/// the writer engine (inbound).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MmapDmaInfo {
    pub dma_tx_buf_offset: u64,
    pub dma_tx_buf_size: u64,
    pub dma_tx_buf_count: u64,
    pub dma_rx_buf_offset: u64,
    pub dma_rx_buf_size: u64,
    pub dma_rx_buf_count: u64,
}

/// `struct litepcie_ioctl_mmap_dma_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MmapDmaUpdate {
    pub sw_count: i64,
}

impl MmapDmaUpdate {
    pub fn new(sw_count: u64) -> Self {
        Self {
            sw_count: sw_count as i64,
        }
    }
}

/// Request numbers shared by both platforms.
pub mod nr {
    pub const DMA: u32 = 20;
    pub const DMA_WRITER: u32 = 21;
    pub const DMA_READER: u32 = 22;
    pub const MMAP_DMA_INFO: u32 = 24;
    pub const LOCK: u32 = 25;
    pub const MMAP_DMA_WRITER_UPDATE: u32 = 26;
    pub const MMAP_DMA_READER_UPDATE: u32 = 27;
}

/// Linux `_IOC` request codes.
pub mod linux {
    use super::*;
    use std::mem::size_of;

    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    const MAGIC: u64 = b'S' as u64;

    const fn ioc(dir: u64, nr: u32, size: usize) -> u64 {
        (dir << 30) | ((size as u64) << 16) | (MAGIC << 8) | nr as u64
    }

    pub const DMA: u64 = ioc(IOC_WRITE, nr::DMA, size_of::<DmaLoopback>());
    pub const DMA_WRITER: u64 = ioc(IOC_READ | IOC_WRITE, nr::DMA_WRITER, size_of::<DmaEngine>());
    pub const DMA_READER: u64 = ioc(IOC_READ | IOC_WRITE, nr::DMA_READER, size_of::<DmaEngine>());
    pub const MMAP_DMA_INFO: u64 = ioc(IOC_READ, nr::MMAP_DMA_INFO, size_of::<MmapDmaInfo>());
    pub const LOCK: u64 = ioc(IOC_READ | IOC_WRITE, nr::LOCK, size_of::<DmaLock>());
    pub const MMAP_DMA_WRITER_UPDATE: u64 =
        ioc(IOC_WRITE, nr::MMAP_DMA_WRITER_UPDATE, size_of::<MmapDmaUpdate>());
    pub const MMAP_DMA_READER_UPDATE: u64 =
        ioc(IOC_WRITE, nr::MMAP_DMA_READER_UPDATE, size_of::<MmapDmaUpdate>());
}

/// Windows `CTL_CODE(FILE_DEVICE_UNKNOWN, nr, METHOD_BUFFERED, FILE_ANY_ACCESS)` codes.
pub mod win32 {
    use super::nr;

    const FILE_DEVICE_UNKNOWN: u32 = 0x22;

    const fn ctl_code(nr: u32) -> u32 {
        (FILE_DEVICE_UNKNOWN << 16) | (nr << 2)
    }

    pub const DMA: u32 = ctl_code(nr::DMA);
    pub const DMA_WRITER: u32 = ctl_code(nr::DMA_WRITER);
    pub const DMA_READER: u32 = ctl_code(nr::DMA_READER);
    pub const MMAP_DMA_INFO: u32 = ctl_code(nr::MMAP_DMA_INFO);
    pub const LOCK: u32 = ctl_code(nr::LOCK);
    pub const MMAP_DMA_WRITER_UPDATE: u32 = ctl_code(nr::MMAP_DMA_WRITER_UPDATE);
    pub const MMAP_DMA_READER_UPDATE: u32 = ctl_code(nr::MMAP_DMA_READER_UPDATE);
}
