// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-direction progress counters and availability arithmetic.
//!
//! Each DMA direction owns a pair of monotonic counters:
//!
//! - `hw_count` advances only on hardware-confirmed completions, learned
//!   during a synchronization step.
//! - `sw_count` advances only when the application claims a slot, which
//!   hands it back to hardware at the next step.
//!
//! In zero-copy mode the number of claimable slots is derived from the
//! counters alone. In copy mode it is the size of the last completed batch.

use crate::error::DmaError;
use bitflags::bitflags;
use std::fmt;

/// Direction of a DMA stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host (the FPGA's "writer" engine).
    Inbound,
    /// Host to device (the FPGA's "reader" engine).
    Outbound,
}

impl Direction {
    /// Both directions, inbound first.
    pub const ALL: [Direction; 2] = [Direction::Inbound, Direction::Outbound];

    /// Single-direction flag set.
    #[inline]
    pub const fn flag(self) -> Directions {
        match self {
            Direction::Inbound => Directions::INBOUND,
            Direction::Outbound => Directions::OUTBOUND,
        }
    }

    /// Index for per-direction arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    /// Name of the FPGA DMA engine serving this direction.
    pub const fn engine_name(self) -> &'static str {
        match self {
            Direction::Inbound => "writer",
            Direction::Outbound => "reader",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

bitflags! {
    /// A set of DMA directions (lock requests, readiness, sync results).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Directions: u8 {
        /// Device to host.
        const INBOUND = 1 << 0;
        /// Host to device.
        const OUTBOUND = 1 << 1;
    }
}

impl Directions {
    /// Returns true if `direction` is in the set.
    #[inline]
    pub fn has(self, direction: Direction) -> bool {
        self.contains(direction.flag())
    }

    /// Iterate over the directions in the set, inbound first.
    pub fn each(self) -> impl Iterator<Item = Direction> {
        Direction::ALL.into_iter().filter(move |d| self.has(*d))
    }
}

impl From<Direction> for Directions {
    fn from(direction: Direction) -> Self {
        direction.flag()
    }
}

/// Claimable inbound slots: `clamp(hw - sw, 0, capacity)`.
#[inline]
pub fn inbound_available(hw_count: u64, sw_count: u64, capacity: usize) -> usize {
    hw_count.saturating_sub(sw_count).min(capacity as u64) as usize
}

/// Claimable outbound slots: `clamp(bound - (sw - hw), 0, bound)`.
#[inline]
pub fn outbound_available(hw_count: u64, sw_count: u64, capacity_bound: usize) -> usize {
    let in_flight = sw_count.saturating_sub(hw_count);
    (capacity_bound as u64).saturating_sub(in_flight) as usize
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Enabled,
}

/// How claimable slots are accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accounting {
    /// Zero-copy: availability is a function of the counters.
    Counters,
    /// Copy mode: availability is what remains of the last transferred batch.
    Batch { remaining: usize },
}

/// Progress counters and claim cursor of one DMA direction.
///
/// Counters are only mutated through the synchronization step
/// (`observe_hw_count`, `complete_batch`, `suspend`) and through `claim`.
#[derive(Debug, Clone)]
pub struct DmaChannel {
    direction: Direction,
    state: ChannelState,
    hw_count: u64,
    sw_count: u64,
    /// `sw_count` at the start of the current copy batch.
    batch_base: u64,
    /// Slots handed to the application since the channel was enabled.
    claimed: u64,
    slot_count: usize,
    capacity_bound: usize,
    accounting: Accounting,
}

impl DmaChannel {
    /// Create a disabled channel over a ring of `slot_count` slots.
    ///
    /// `capacity_bound` caps availability (outbound in-flight limit, or copy
    /// batch size); it must not exceed `slot_count`.
    pub fn new(
        direction: Direction,
        slot_count: usize,
        capacity_bound: usize,
        zero_copy: bool,
    ) -> Self {
        debug_assert!(capacity_bound <= slot_count);
        Self {
            direction,
            state: ChannelState::Disabled,
            hw_count: 0,
            sw_count: 0,
            batch_base: 0,
            claimed: 0,
            slot_count,
            capacity_bound,
            accounting: if zero_copy {
                Accounting::Counters
            } else {
                Accounting::Batch { remaining: 0 }
            },
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ChannelState::Enabled
    }

    pub fn hw_count(&self) -> u64 {
        self.hw_count
    }

    pub fn sw_count(&self) -> u64 {
        self.sw_count
    }

    /// Slots handed to the application. In copy mode `sw_count` also
    /// covers inbound slots dropped unclaimed.
    pub fn claimed(&self) -> u64 {
        self.claimed
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn capacity_bound(&self) -> usize {
        self.capacity_bound
    }

    /// Number of slots that can be claimed before the next step.
    pub fn available(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        match self.accounting {
            Accounting::Counters => match self.direction {
                Direction::Inbound => {
                    inbound_available(self.hw_count, self.sw_count, self.slot_count)
                }
                Direction::Outbound => {
                    outbound_available(self.hw_count, self.sw_count, self.capacity_bound)
                }
            },
            Accounting::Batch { remaining } => remaining,
        }
    }

    /// Ring index of the next slot to hand out.
    #[inline]
    pub fn cursor(&self) -> usize {
        ((self.sw_count - self.batch_base) % self.slot_count as u64) as usize
    }

    /// Disabled -> Enabled. Counters and cursor restart from zero together.
    pub(crate) fn enable(&mut self) {
        self.state = ChannelState::Enabled;
        self.hw_count = 0;
        self.sw_count = 0;
        self.batch_base = 0;
        self.claimed = 0;
        if let Accounting::Batch { remaining } = &mut self.accounting {
            // Outbound copy mode starts with the whole batch free to fill.
            *remaining = match self.direction {
                Direction::Inbound => 0,
                Direction::Outbound => self.capacity_bound,
            };
        }
    }

    /// Enabled -> Disabled. Nothing can be claimed afterwards.
    pub(crate) fn disable(&mut self) {
        self.state = ChannelState::Disabled;
        if let Accounting::Batch { remaining } = &mut self.accounting {
            *remaining = 0;
        }
    }

    /// Record the hardware counter reported by the driver (zero-copy).
    pub(crate) fn observe_hw_count(&mut self, hw_count: u64) -> Result<(), DmaError> {
        if hw_count < self.hw_count {
            return Err(DmaError::violation(
                self.direction,
                format!(
                    "hardware count went backwards ({} -> {})",
                    self.hw_count, hw_count
                ),
            ));
        }
        if self.direction == Direction::Outbound && hw_count > self.sw_count {
            return Err(DmaError::violation(
                self.direction,
                format!(
                    "hardware consumed unreleased slots (hw {} > sw {})",
                    hw_count, self.sw_count
                ),
            ));
        }
        let pending = hw_count.saturating_sub(self.sw_count);
        if self.direction == Direction::Inbound && pending > self.slot_count as u64 {
            log::warn!(
                "inbound overrun: {} slots pending on a {}-slot ring",
                pending,
                self.slot_count
            );
        }
        self.hw_count = hw_count;
        Ok(())
    }

    /// Record a completed copy transfer of `slots` slots.
    ///
    /// The cursor restarts at the beginning of the private ring. Inbound, the
    /// transfer delivered `slots` new slots. Outbound, hardware took `slots`
    /// slots of the batch but is never credited beyond what was released,
    /// so `sw_count - hw_count` stays within the capacity bound.
    pub(crate) fn complete_batch(&mut self, slots: usize) {
        debug_assert!(slots <= self.capacity_bound);
        self.retire_batch();
        match self.direction {
            Direction::Inbound => self.hw_count += slots as u64,
            Direction::Outbound => {
                let consumed = (self.hw_count + slots as u64).min(self.sw_count);
                self.hw_count = self.hw_count.max(consumed);
            }
        }
        self.batch_base = self.sw_count;
        self.accounting = Accounting::Batch { remaining: slots };
    }

    /// No slot may be claimed while a copy transfer is in flight.
    pub(crate) fn suspend(&mut self) {
        self.retire_batch();
    }

    /// Close the current copy batch. Unclaimed inbound slots are dropped
    /// and count as released, keeping `hw_count - sw_count` within the ring.
    fn retire_batch(&mut self) {
        if let Accounting::Batch { remaining } = &mut self.accounting {
            if *remaining > 0 && self.direction == Direction::Inbound {
                log::trace!("inbound: {} unclaimed slots dropped", remaining);
                self.sw_count += *remaining as u64;
            }
            *remaining = 0;
        }
    }

    /// Claim the next slot, returning its ring index.
    pub(crate) fn claim(&mut self) -> Option<usize> {
        if self.available() == 0 {
            return None;
        }
        let index = self.cursor();
        self.sw_count += 1;
        self.claimed += 1;
        if let Accounting::Batch { remaining } = &mut self.accounting {
            *remaining -= 1;
        }
        Some(index)
    }
}
