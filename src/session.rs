// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Streaming session: the pull-style buffer API.
//!
//! A session owns one device handle, the channel lock, and one stream per
//! requested direction. The application alternates between [`DmaSession::step`]
//! and draining the claimable slots:
//!
//! ```rust,no_run
//! use litepcie_dma::{DmaConfig, DmaSession, SoftCard, SoftConfig};
//!
//! let card = SoftCard::new(SoftConfig::default());
//! let mut session = DmaSession::polling(card.open(), &DmaConfig::new(true))?;
//! for _ in 0..100 {
//!     session.step()?;
//!     while let Some(slot) = session.next_outbound_buffer() {
//!         slot.fill(0x5A);
//!     }
//!     while let Some(slot) = session.next_inbound_buffer() {
//!         assert!(slot.iter().all(|&b| b == 0x5A));
//!     }
//! }
//! let stats = session.cleanup()?;
//! println!("{} slots received", stats.inbound.sw_count);
//! # Ok::<(), litepcie_dma::DmaError>(())
//! ```
//!
//! Teardown runs on every exit path, in this order: abandon in-flight
//! transfers, disable the channels, release the lock, unmap or free the
//! rings, close the handle.

use crate::channel::{DmaChannel, Direction, Directions};
use crate::config::{validate_geometry, DmaConfig};
use crate::device::{Counts, DmaDevice, OverlappedDevice};
use crate::error::{DmaError, DmaResult};
use crate::lock::ChannelLock;
use crate::ring::BufferRing;
use crate::transport::{
    BufferMode, OverlappedTransport, PollingTransport, Stream, Streams, TransportDriver,
};
use std::sync::Arc;

/// Claimable slots per direction after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Availability {
    pub inbound: usize,
    pub outbound: usize,
}

impl Availability {
    pub fn get(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound,
            Direction::Outbound => self.outbound,
        }
    }
}

/// Progress of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    /// Slots completed by hardware.
    pub hw_count: u64,
    /// Slots released back to hardware.
    pub sw_count: u64,
    /// Slots handed to the application.
    pub claimed: u64,
    pub slot_size: usize,
    /// Driver counters read when the channel was disabled.
    pub final_counts: Option<Counts>,
}

impl DirectionStats {
    /// Bytes handed to the application.
    pub fn bytes(&self) -> u64 {
        self.claimed * self.slot_size as u64
    }
}

/// Session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub inbound: DirectionStats,
    pub outbound: DirectionStats,
    /// Steps run.
    pub steps: u64,
    /// Steps whose bounded wait expired without progress.
    pub timeouts: u64,
}

impl SessionStats {
    pub fn direction(&self, direction: Direction) -> &DirectionStats {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionStats {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    fn record(&mut self, streams: &Streams) {
        for direction in streams.active().each() {
            if let Some(stream) = streams.get(direction) {
                let stats = self.direction_mut(direction);
                stats.hw_count = stream.channel().hw_count();
                stats.sw_count = stream.channel().sw_count();
                stats.claimed = stream.channel().claimed();
                stats.slot_size = stream.ring().slot_size();
            }
        }
    }
}

/// Resources of a live session, in teardown order.
struct Live<D: DmaDevice> {
    transport: Box<dyn TransportDriver<D>>,
    device: Arc<D>,
    lock: ChannelLock<D>,
    streams: Streams,
    mode: BufferMode,
}

/// A DMA streaming session over a device.
pub struct DmaSession<D: DmaDevice> {
    live: Option<Live<D>>,
    stats: SessionStats,
}

impl<D: DmaDevice + 'static> DmaSession<D> {
    /// Start a session driven by readiness polling.
    pub fn polling(device: D, config: &DmaConfig) -> DmaResult<Self> {
        let transport = PollingTransport::new(config.wait_timeout);
        Self::with_transport(device, config, Box::new(transport))
    }

    /// Start a session with an explicit transport.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if `config` does not validate.
    /// - `LockDenied` if another session owns a requested direction.
    /// - `ZeroCopyUnsupported` / `MmapFailed` if zero-copy cannot be set up.
    /// - `AllocationFailure` if a private ring cannot be allocated.
    ///
    /// Every resource acquired before the failure is released.
    pub fn with_transport(
        device: D,
        config: &DmaConfig,
        transport: Box<dyn TransportDriver<D>>,
    ) -> DmaResult<Self> {
        config.validate()?;
        let mode = if config.zero_copy {
            BufferMode::ZeroCopy
        } else {
            BufferMode::Copy
        };

        let device = Arc::new(device);
        // Declared before the lock so that on failure the rings go after the
        // lock is released.
        let mut streams = Streams::default();
        let lock = ChannelLock::acquire(&device, config.directions)?;
        device.set_loopback(config.loopback)?;

        let layout = match mode {
            BufferMode::ZeroCopy => Some(device.ring_layout()?),
            BufferMode::Copy => None,
        };
        for direction in config.directions.each() {
            let ring = match &layout {
                Some(layout) => {
                    let geometry = layout.for_direction(direction);
                    validate_geometry(geometry.slot_size, geometry.slot_count)?;
                    let region = device.map_ring(direction, geometry)?;
                    BufferRing::shared(geometry.slot_size, geometry.slot_count, region)?
                }
                None => BufferRing::allocate(direction, config.slot_size, config.slot_count)?,
            };
            let slot_count = ring.slot_count();
            let channel = DmaChannel::new(
                direction,
                slot_count,
                config.capacity_bound(direction, slot_count),
                mode == BufferMode::ZeroCopy,
            );
            streams.insert(Stream::new(channel, ring));
        }

        // Disable whatever was enabled if a later engine fails to start.
        let mut enabled = scopeguard::guard(Directions::empty(), |enabled| {
            for direction in enabled.each() {
                if let Err(e) = device.enable_channel(direction, false) {
                    log::warn!("failed to disable {} channel: {}", direction, e);
                }
            }
        });
        for direction in config.directions.each() {
            let counts = device.enable_channel(direction, true)?;
            *enabled |= direction.flag();
            if let Some(stream) = streams.get_mut(direction) {
                stream.channel.enable();
                log::debug!(
                    "{} channel enabled (driver hw {} sw {})",
                    direction,
                    counts.hw_count,
                    counts.sw_count
                );
            }
        }
        scopeguard::ScopeGuard::into_inner(enabled);

        log::info!(
            "DMA session started: {} mode, {} transport, {:?}",
            mode.name(),
            transport.name(),
            config.directions
        );

        let mut stats = SessionStats::default();
        stats.record(&streams);
        Ok(Self {
            live: Some(Live {
                transport,
                device,
                lock,
                streams,
                mode,
            }),
            stats,
        })
    }

    /// Run one synchronization step and report what can be claimed.
    ///
    /// A timeout is not an error: availability is returned unchanged.
    ///
    /// # Errors
    ///
    /// - `SessionClosed` after `cleanup` or a fatal error.
    /// - `ProtocolViolation` if hardware and software disagree; the session
    ///   is torn down before the error is returned.
    pub fn step(&mut self) -> DmaResult<Availability> {
        let live = self.live.as_mut().ok_or(DmaError::SessionClosed)?;
        self.stats.steps += 1;

        match live
            .transport
            .step(&live.device, live.mode, &mut live.streams)
        {
            Ok(synced) => {
                if synced.is_empty() {
                    self.stats.timeouts += 1;
                    log::trace!("step {}: timeout", self.stats.steps);
                }
                self.stats.record(&live.streams);
                Ok(self.availability())
            }
            Err(e) if e.is_fatal() => {
                log::error!("{}; tearing down DMA session", e);
                if let Some(live) = self.live.take() {
                    if let Err(teardown) = teardown(live, &mut self.stats) {
                        log::warn!("teardown after fatal error: {}", teardown);
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the next inbound slot (data produced by the device).
    ///
    /// The slot is valid until the next `step`.
    pub fn next_inbound_buffer(&mut self) -> Option<&mut [u8]> {
        self.claim(Direction::Inbound)
    }

    /// Claim the next outbound slot to fill with data for the device.
    ///
    /// The slot is handed to hardware at the next `step`.
    pub fn next_outbound_buffer(&mut self) -> Option<&mut [u8]> {
        self.claim(Direction::Outbound)
    }

    fn claim(&mut self, direction: Direction) -> Option<&mut [u8]> {
        let stream = self.live.as_mut()?.streams.get_mut(direction)?;
        let index = stream.channel.claim()?;
        Some(stream.ring.slot_mut(index))
    }

    /// Claimable slots right now.
    pub fn availability(&self) -> Availability {
        let available = |direction| {
            self.stream(direction)
                .map_or(0, |stream| stream.channel().available())
        };
        Availability {
            inbound: available(Direction::Inbound),
            outbound: available(Direction::Outbound),
        }
    }

    /// Counters and ring of `direction`, if the session is live and streams it.
    pub fn stream(&self, direction: Direction) -> Option<&Stream> {
        self.live.as_ref()?.streams.get(direction)
    }

    pub fn mode(&self) -> Option<BufferMode> {
        self.live.as_ref().map(|live| live.mode)
    }

    /// Directions locked by this session.
    pub fn locked(&self) -> Directions {
        self.live
            .as_ref()
            .map_or(Directions::empty(), |live| live.lock.held())
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Tear the session down and return its final statistics.
    ///
    /// # Errors
    ///
    /// Returns the first driver error met while disabling channels or
    /// releasing the lock; every step of the teardown still runs.
    pub fn cleanup(mut self) -> DmaResult<SessionStats> {
        if let Some(live) = self.live.take() {
            teardown(live, &mut self.stats)?;
        }
        Ok(self.stats)
    }
}

impl<D: OverlappedDevice + 'static> DmaSession<D> {
    /// Start a session driven by overlapped completions.
    pub fn overlapped(device: D, config: &DmaConfig) -> DmaResult<Self> {
        let transport = OverlappedTransport::new(config.wait_timeout);
        Self::with_transport(device, config, Box::new(transport))
    }
}

#[cfg(not(target_os = "windows"))]
impl DmaSession<crate::device::LitePcieDevice> {
    /// Open the LitePCIe device node `name` (e.g. `/dev/litepcie0`) and start
    /// a polling session with default settings.
    pub fn init(name: &str, zero_copy: bool) -> DmaResult<Self> {
        Self::open(name, &DmaConfig::new(zero_copy))
    }

    /// Open the LitePCIe device node `name` with an explicit configuration.
    pub fn open(name: &str, config: &DmaConfig) -> DmaResult<Self> {
        let device = crate::device::LitePcieDevice::open(name)?;
        Self::polling(device, config)
    }
}

#[cfg(target_os = "windows")]
impl DmaSession<crate::device::LitePcieDevice> {
    /// Open the LitePCIe DMA channel `name` (e.g. `\DMA0`) and start an
    /// overlapped session with default settings.
    pub fn init(name: &str, zero_copy: bool) -> DmaResult<Self> {
        Self::open(name, &DmaConfig::new(zero_copy))
    }

    /// Open the LitePCIe DMA channel `name` with an explicit configuration.
    pub fn open(name: &str, config: &DmaConfig) -> DmaResult<Self> {
        if config.zero_copy {
            return Err(DmaError::ZeroCopyUnsupported);
        }
        let device = crate::device::LitePcieDevice::open(name)?;
        Self::overlapped(device, config)
    }
}

impl<D: DmaDevice> Drop for DmaSession<D> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            if let Err(e) = teardown(live, &mut self.stats) {
                log::warn!("DMA session teardown: {}", e);
            }
        }
    }
}

impl<D: DmaDevice> std::fmt::Debug for DmaSession<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaSession")
            .field("open", &self.live.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Release everything a live session holds.
fn teardown<D: DmaDevice>(live: Live<D>, stats: &mut SessionStats) -> DmaResult<()> {
    let Live {
        mut transport,
        device,
        lock,
        mut streams,
        mode,
    } = live;
    let mut first_error = None;

    transport.abandon(&device);

    for direction in streams.active().each() {
        match device.enable_channel(direction, false) {
            Ok(counts) => {
                stats.direction_mut(direction).final_counts = Some(counts);
                log::debug!(
                    "{} channel disabled (driver hw {} sw {})",
                    direction,
                    counts.hw_count,
                    counts.sw_count
                );
            }
            Err(e) => {
                log::warn!("failed to disable {} channel: {}", direction, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(stream) = streams.get_mut(direction) {
            stream.channel.disable();
        }
    }
    stats.record(&streams);

    if let Err(e) = lock.release() {
        log::warn!("failed to release DMA lock: {}", e);
        first_error.get_or_insert(e);
    }
    drop(streams);
    drop(transport);
    drop(device);

    log::info!(
        "DMA session closed ({} mode): {} slots in, {} slots out, {} steps",
        mode.name(),
        stats.inbound.sw_count,
        stats.outbound.sw_count,
        stats.steps
    );
    first_error.map_or(Ok(()), Err)
}
