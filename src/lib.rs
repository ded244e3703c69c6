// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # LitePCIe DMA Rust Bindings
//!
//! User-space streaming over the DMA engines of a LitePCIe FPGA design. The
//! privileged driver owns the board; this crate runs the ring-buffer
//! synchronization protocol against it:
//!
//! - Per direction, monotonic hardware/software counters decide which slots
//!   of a fixed ring the application may claim.
//! - Each direction is locked exclusively through the driver.
//! - Slots are either mapped from the driver (zero-copy) or copied through a
//!   private ring with `read` / `write` (copy mode).
//! - Steps are driven either by readiness polling or by overlapped
//!   completions.
//!
//! ## Platform Support
//!
//! | Platform | Transport   | Zero-copy | Copy |
//! |----------|-------------|-----------|------|
//! | Linux    | polling     | Supported | Supported |
//! | Windows  | overlapped  | Not available | Supported |
//!
//! Every platform can run against [`SoftCard`], an in-process emulation of a
//! board in loopback.
//!
//! ## Example
//!
//! ```rust,no_run
//! use litepcie_dma::{DmaError, DmaSession};
//!
//! fn main() -> Result<(), DmaError> {
//!     let mut session = DmaSession::init("/dev/litepcie0", true)?;
//!     for _ in 0..1000 {
//!         session.step()?;
//!         while let Some(slot) = session.next_outbound_buffer() {
//!             slot.fill(0xA5);
//!         }
//!         while let Some(slot) = session.next_inbound_buffer() {
//!             let _ = slot;
//!         }
//!     }
//!     let stats = session.cleanup()?;
//!     println!("received {} bytes", stats.inbound.bytes());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod ioctl;
pub mod lock;
pub mod ring;
pub mod session;
pub mod soft;
pub mod transport;

pub use channel::{ChannelState, Direction, Directions, DmaChannel};
pub use config::DmaConfig;
pub use device::{
    Counts, DmaDevice, LitePcieDevice, OverlappedDevice, RingGeometry, RingLayout, Submission,
};
pub use error::{DmaError, DmaResult};
pub use lock::ChannelLock;
pub use ring::{BufferRing, SharedRegion};
pub use session::{Availability, DirectionStats, DmaSession, SessionStats};
pub use soft::{Fault, SoftCard, SoftConfig, SoftDevice};
pub use transport::{BufferMode, OverlappedTransport, PollingTransport, TransportDriver};
