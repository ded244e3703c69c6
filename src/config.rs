// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Session configuration.
//!
//! Defaults reproduce the reference LitePCIe FPGA build: 256 slots of 8 KiB
//! per direction, with the DMA engines raising an interrupt every 32 slots.

use crate::channel::{Direction, Directions};
use crate::error::DmaError;
use std::time::Duration;

/// Default slot size in bytes.
pub const DEFAULT_SLOT_SIZE: usize = 8192;

/// Default number of slots per ring.
pub const DEFAULT_SLOT_COUNT: usize = 256;

/// Default number of slots completed per DMA interrupt.
pub const DEFAULT_BUFFERS_PER_IRQ: usize = 32;

/// Default bound on the readiness / completion wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// DMA session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    /// Bytes per ring slot (copy mode; zero-copy uses the driver's layout).
    pub slot_size: usize,
    /// Slots per ring (copy mode; zero-copy uses the driver's layout).
    pub slot_count: usize,
    /// Slots the hardware completes per interrupt.
    pub buffers_per_irq: usize,
    /// Outbound in-flight limit. `None` picks the mode default.
    pub outbound_capacity_bound: Option<usize>,
    /// Bound on each blocking wait inside a step.
    pub wait_timeout: Duration,
    /// Map the driver's DMA buffers instead of copying through private ones.
    pub zero_copy: bool,
    /// Route outbound data straight back inbound inside the FPGA.
    pub loopback: bool,
    /// Directions to stream.
    pub directions: Directions,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            slot_count: DEFAULT_SLOT_COUNT,
            buffers_per_irq: DEFAULT_BUFFERS_PER_IRQ,
            outbound_capacity_bound: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            zero_copy: false,
            loopback: true,
            directions: Directions::all(),
        }
    }
}

impl DmaConfig {
    /// Default configuration with the given buffer ownership mode.
    pub fn new(zero_copy: bool) -> Self {
        Self {
            zero_copy,
            ..Self::default()
        }
    }

    /// Set the ring geometry used in copy mode.
    pub fn set_geometry(&mut self, slot_size: usize, slot_count: usize) {
        self.slot_size = slot_size;
        self.slot_count = slot_count;
    }

    /// Set the outbound in-flight limit.
    pub fn set_outbound_capacity_bound(&mut self, bound: usize) {
        self.outbound_capacity_bound = Some(bound);
    }

    /// Set the bound on blocking waits.
    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// Enable or disable internal FPGA loopback.
    pub fn set_loopback(&mut self, loopback: bool) {
        self.loopback = loopback;
    }

    /// Select the directions to stream.
    pub fn set_directions(&mut self, directions: Directions) {
        self.directions = directions;
    }

    /// Availability cap for `direction` on a ring of `slot_count` slots.
    ///
    /// Inbound may use the whole ring. Outbound defaults to half the ring in
    /// zero-copy mode and to `slot_count - buffers_per_irq` in copy mode,
    /// matching the descriptor-table sizing of the reference gateware.
    pub fn capacity_bound(&self, direction: Direction, slot_count: usize) -> usize {
        match direction {
            Direction::Inbound => slot_count,
            Direction::Outbound => {
                let bound = self.outbound_capacity_bound.unwrap_or(if self.zero_copy {
                    slot_count / 2
                } else {
                    slot_count.saturating_sub(self.buffers_per_irq)
                });
                bound.clamp(1, slot_count)
            }
        }
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.directions.is_empty() {
            return Err(DmaError::InvalidConfig(
                "no DMA direction selected".to_string(),
            ));
        }
        validate_geometry(self.slot_size, self.slot_count)?;
        if self.buffers_per_irq == 0 {
            return Err(DmaError::InvalidConfig(
                "buffers_per_irq must be non-zero".to_string(),
            ));
        }
        if let Some(bound) = self.outbound_capacity_bound {
            if bound == 0 || bound > self.slot_count {
                return Err(DmaError::InvalidConfig(format!(
                    "outbound capacity bound {} must be within 1..={}",
                    bound, self.slot_count
                )));
            }
        }
        if self.wait_timeout.is_zero() {
            return Err(DmaError::InvalidConfig(
                "wait timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check a ring geometry (from the config or reported by the driver).
pub(crate) fn validate_geometry(slot_size: usize, slot_count: usize) -> Result<(), DmaError> {
    if slot_size == 0 || slot_size % 8 != 0 {
        return Err(DmaError::InvalidConfig(format!(
            "slot size {} must be a non-zero multiple of 8",
            slot_size
        )));
    }
    if !slot_count.is_power_of_two() {
        return Err(DmaError::InvalidConfig(format!(
            "slot count {} must be a power of two",
            slot_count
        )));
    }
    if slot_size.checked_mul(slot_count).is_none() {
        return Err(DmaError::InvalidConfig("ring size overflows".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DmaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slot_size, 8192);
        assert_eq!(config.slot_count, 256);
        assert_eq!(config.wait_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_capacity_bound_defaults() {
        let copy = DmaConfig::new(false);
        assert_eq!(copy.capacity_bound(Direction::Outbound, 256), 224);
        assert_eq!(copy.capacity_bound(Direction::Inbound, 256), 256);

        let zero_copy = DmaConfig::new(true);
        assert_eq!(zero_copy.capacity_bound(Direction::Outbound, 256), 128);
        assert_eq!(zero_copy.capacity_bound(Direction::Inbound, 256), 256);
    }

    #[test]
    fn test_capacity_bound_override() {
        let mut config = DmaConfig::new(true);
        config.set_outbound_capacity_bound(200);
        assert_eq!(config.capacity_bound(Direction::Outbound, 256), 200);
        // Clamped to the actual ring when the driver reports a smaller one.
        assert_eq!(config.capacity_bound(Direction::Outbound, 64), 64);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut config = DmaConfig::default();
        config.set_geometry(8192, 100);
        assert!(matches!(config.validate(), Err(DmaError::InvalidConfig(_))));

        config.set_geometry(12, 256);
        assert!(config.validate().is_err());

        config.set_geometry(0, 256);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_bounds() {
        let mut config = DmaConfig::default();
        config.set_outbound_capacity_bound(0);
        assert!(config.validate().is_err());

        let mut config = DmaConfig::default();
        config.set_outbound_capacity_bound(257);
        assert!(config.validate().is_err());

        let mut config = DmaConfig::default();
        config.set_directions(Directions::empty());
        assert!(config.validate().is_err());

        let mut config = DmaConfig::default();
        config.set_wait_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
