// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-direction DMA channel locks.
//!
//! The driver arbitrates ownership of each DMA direction: one lock per
//! (device, direction). A [`ChannelLock`] holds the directions granted to
//! this process and releases them when dropped, on every exit path. The
//! driver additionally drops any lock still held when the file handle is
//! closed.

use crate::channel::Directions;
use crate::device::DmaDevice;
use crate::error::DmaError;
use std::sync::Arc;

/// Scoped ownership of one or both DMA directions of a device.
pub struct ChannelLock<D: DmaDevice> {
    device: Arc<D>,
    held: Directions,
}

impl<D: DmaDevice> ChannelLock<D> {
    /// Request exclusive ownership of `wanted` without blocking.
    ///
    /// Either every requested direction is granted or none is held on
    /// return: a partial grant is released before reporting `LockDenied`.
    pub fn acquire(device: &Arc<D>, wanted: Directions) -> Result<Self, DmaError> {
        let granted = device.request_lock(wanted)? & wanted;
        let lock = Self {
            device: Arc::clone(device),
            held: granted,
        };

        let denied = wanted - granted;
        if !denied.is_empty() {
            log::debug!("DMA lock denied for {:?}", denied);
            // Dropping `lock` gives back whatever was granted.
            return Err(DmaError::LockDenied { denied });
        }

        log::debug!("DMA lock acquired for {:?}", granted);
        Ok(lock)
    }

    /// Directions currently held.
    pub fn held(&self) -> Directions {
        self.held
    }

    /// Release explicitly, reporting driver errors.
    pub fn release(mut self) -> Result<(), DmaError> {
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            return Ok(());
        }
        self.device.release_lock(held)?;
        log::debug!("DMA lock released for {:?}", held);
        Ok(())
    }
}

impl<D: DmaDevice> Drop for ChannelLock<D> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        match self.device.release_lock(self.held) {
            Ok(()) => log::debug!("DMA lock released for {:?}", self.held),
            Err(e) => log::warn!("failed to release DMA lock {:?}: {}", self.held, e),
        }
    }
}

impl<D: DmaDevice> std::fmt::Debug for ChannelLock<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLock")
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Direction;
    use crate::soft::{SoftCard, SoftConfig};

    #[test]
    fn test_acquire_and_release() {
        let card = SoftCard::new(SoftConfig::default());
        let device = Arc::new(card.open());

        let lock = ChannelLock::acquire(&device, Directions::all()).unwrap();
        assert_eq!(lock.held(), Directions::all());
        assert!(card.lock_owner(Direction::Inbound).is_some());

        lock.release().unwrap();
        assert!(card.lock_owner(Direction::Inbound).is_none());
        assert!(card.lock_owner(Direction::Outbound).is_none());
    }

    #[test]
    fn test_second_owner_is_denied() {
        let card = SoftCard::new(SoftConfig::default());
        let first = Arc::new(card.open());
        let second = Arc::new(card.open());

        let _held = ChannelLock::acquire(&first, Directions::OUTBOUND).unwrap();
        let err = ChannelLock::acquire(&second, Directions::OUTBOUND).unwrap_err();
        assert!(matches!(
            err,
            DmaError::LockDenied { denied } if denied == Directions::OUTBOUND
        ));

        // The other direction is still free.
        let inbound = ChannelLock::acquire(&second, Directions::INBOUND).unwrap();
        assert_eq!(inbound.held(), Directions::INBOUND);
    }

    #[test]
    fn test_partial_grant_is_rolled_back() {
        let card = SoftCard::new(SoftConfig::default());
        let first = Arc::new(card.open());
        let second = Arc::new(card.open());

        let _outbound = ChannelLock::acquire(&first, Directions::OUTBOUND).unwrap();
        assert!(ChannelLock::acquire(&second, Directions::all()).is_err());

        // The inbound lock granted to `second` was given back.
        assert!(card.lock_owner(Direction::Inbound).is_none());
        assert!(ChannelLock::acquire(&first, Directions::INBOUND).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let card = SoftCard::new(SoftConfig::default());
        let device = Arc::new(card.open());
        {
            let _lock = ChannelLock::acquire(&device, Directions::INBOUND).unwrap();
            assert!(card.lock_owner(Direction::Inbound).is_some());
        }
        assert!(card.lock_owner(Direction::Inbound).is_none());
    }
}
