// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Fixed-capacity ring of fixed-size DMA slots.
//!
//! Storage is either a private allocation owned by the session (copy mode)
//! or a region the privileged driver maps into the process (zero-copy). Slots
//! are addressed by index; the byte offset of slot `i` is `i * slot_size`.

use crate::channel::Direction;
use crate::error::DmaError;

/// Memory shared with the driver (an mmap'ed DMA buffer region).
///
/// Dropping the region unmaps it; the underlying memory stays owned by the
/// driver.
///
/// # Safety
///
/// Implementors guarantee that `as_ptr()` is valid for reads and writes of
/// `len()` bytes for as long as the region is alive, and that the pointer is
/// stable across calls.
pub unsafe trait SharedRegion: Send {
    /// Base address of the mapping.
    fn as_ptr(&self) -> *mut u8;

    /// Length of the mapping in bytes.
    fn len(&self) -> usize;

    /// Returns true if the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing memory of a [`BufferRing`].
pub enum RingStorage {
    /// Process-private buffer, freed with the ring.
    Private(Box<[u8]>),
    /// Region shared with the driver, unmapped (never freed) with the ring.
    Shared(Box<dyn SharedRegion>),
}

impl std::fmt::Debug for RingStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingStorage::Private(buf) => f.debug_tuple("Private").field(&buf.len()).finish(),
            RingStorage::Shared(region) => f.debug_tuple("Shared").field(&region.len()).finish(),
        }
    }
}

/// A circular array of `slot_count` slots of `slot_size` bytes.
#[derive(Debug)]
pub struct BufferRing {
    slot_size: usize,
    slot_count: usize,
    storage: RingStorage,
}

impl BufferRing {
    /// Allocate a zeroed private ring.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the memory cannot be reserved.
    pub fn allocate(
        direction: Direction,
        slot_size: usize,
        slot_count: usize,
    ) -> Result<Self, DmaError> {
        let bytes = slot_size
            .checked_mul(slot_count)
            .ok_or(DmaError::AllocationFailure {
                direction,
                bytes: usize::MAX,
            })?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes)
            .map_err(|_| DmaError::AllocationFailure { direction, bytes })?;
        buf.resize(bytes, 0);

        Ok(Self {
            slot_size,
            slot_count,
            storage: RingStorage::Private(buf.into_boxed_slice()),
        })
    }

    /// Wrap a region mapped from the driver.
    ///
    /// # Errors
    ///
    /// Returns `MmapFailed` if the region is smaller than the ring.
    pub fn shared(
        slot_size: usize,
        slot_count: usize,
        region: Box<dyn SharedRegion>,
    ) -> Result<Self, DmaError> {
        let bytes = slot_size * slot_count;
        if region.len() < bytes {
            return Err(DmaError::MmapFailed(format!(
                "mapped {} bytes, ring needs {}",
                region.len(),
                bytes
            )));
        }
        Ok(Self {
            slot_size,
            slot_count,
            storage: RingStorage::Shared(region),
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Total ring size in bytes.
    pub fn len(&self) -> usize {
        self.slot_size * self.slot_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the storage is mapped from the driver.
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, RingStorage::Shared(_))
    }

    /// Byte offset of slot `index` (taken modulo the ring size).
    #[inline]
    pub fn slot_offset(&self, index: usize) -> usize {
        (index % self.slot_count) * self.slot_size
    }

    /// Read access to one slot.
    pub fn slot(&self, index: usize) -> &[u8] {
        let offset = self.slot_offset(index);
        &self.bytes()[offset..offset + self.slot_size]
    }

    /// Write access to one slot.
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let offset = self.slot_offset(index);
        let slot_size = self.slot_size;
        &mut self.bytes_mut()[offset..offset + slot_size]
    }

    /// The first `slots` slots as one contiguous buffer (copy transfers).
    pub fn batch_mut(&mut self, slots: usize) -> &mut [u8] {
        let len = slots.min(self.slot_count) * self.slot_size;
        &mut self.bytes_mut()[..len]
    }

    /// Base pointer for transfers that outlive a borrow (overlapped I/O).
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes_mut().as_mut_ptr()
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            RingStorage::Private(buf) => &buf[..],
            // SAFETY: the region is valid for `region.len() >= self.len()`
            // bytes while it is alive, and it lives as long as `self`.
            RingStorage::Shared(region) => unsafe {
                std::slice::from_raw_parts(region.as_ptr(), self.slot_size * self.slot_count)
            },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.slot_size * self.slot_count;
        match &mut self.storage {
            RingStorage::Private(buf) => &mut buf[..],
            // SAFETY: as in `bytes`; `&mut self` makes this the only view
            // held by the session.
            RingStorage::Shared(region) => unsafe {
                std::slice::from_raw_parts_mut(region.as_ptr(), len)
            },
        }
    }
}
