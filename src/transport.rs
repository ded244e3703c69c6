// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Synchronization step drivers.
//!
//! A step tells hardware which slots software released, learns hardware
//! progress, and updates availability. How this happens depends on two
//! independent choices:
//!
//! - [`BufferMode`]: zero-copy exchanges counters with the driver; copy mode
//!   moves a batch of slots between the private ring and the driver.
//! - The transport: [`PollingTransport`] waits for readiness and syncs only
//!   the ready directions; [`OverlappedTransport`] keeps one asynchronous
//!   transfer in flight per direction and harvests completions.

use crate::channel::{DmaChannel, Direction, Directions};
use crate::device::{DmaDevice, OverlappedDevice, Submission};
use crate::error::{DmaError, DmaResult};
use crate::ring::BufferRing;
use std::time::Duration;

/// Who owns the ring memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Rings are mapped from the driver; only counters are exchanged.
    ZeroCopy,
    /// Rings are private; data is copied through `read` / `write`.
    Copy,
}

impl BufferMode {
    pub fn name(self) -> &'static str {
        match self {
            BufferMode::ZeroCopy => "zero-copy",
            BufferMode::Copy => "copy",
        }
    }
}

/// One direction's counters and ring.
#[derive(Debug)]
pub struct Stream {
    pub(crate) channel: DmaChannel,
    pub(crate) ring: BufferRing,
}

impl Stream {
    pub(crate) fn new(channel: DmaChannel, ring: BufferRing) -> Self {
        Self { channel, ring }
    }

    pub fn channel(&self) -> &DmaChannel {
        &self.channel
    }

    pub fn ring(&self) -> &BufferRing {
        &self.ring
    }
}

/// The streams of a session, at most one per direction.
#[derive(Debug, Default)]
pub struct Streams {
    inbound: Option<Stream>,
    outbound: Option<Stream>,
}

impl Streams {
    pub fn get(&self, direction: Direction) -> Option<&Stream> {
        match direction {
            Direction::Inbound => self.inbound.as_ref(),
            Direction::Outbound => self.outbound.as_ref(),
        }
    }

    pub(crate) fn get_mut(&mut self, direction: Direction) -> Option<&mut Stream> {
        match direction {
            Direction::Inbound => self.inbound.as_mut(),
            Direction::Outbound => self.outbound.as_mut(),
        }
    }

    pub(crate) fn insert(&mut self, stream: Stream) {
        match stream.channel.direction() {
            Direction::Inbound => self.inbound = Some(stream),
            Direction::Outbound => self.outbound = Some(stream),
        }
    }

    /// Directions with a stream.
    pub fn active(&self) -> Directions {
        let mut active = Directions::empty();
        if self.inbound.is_some() {
            active |= Directions::INBOUND;
        }
        if self.outbound.is_some() {
            active |= Directions::OUTBOUND;
        }
        active
    }

    fn expect_mut(&mut self, direction: Direction) -> DmaResult<&mut Stream> {
        self.get_mut(direction)
            .ok_or_else(|| DmaError::violation(direction, "no stream for this direction"))
    }
}

/// One way of running the synchronization step.
pub trait TransportDriver<D: DmaDevice>: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run one bounded synchronization step.
    ///
    /// Returns the directions whose state was refreshed; empty means the
    /// bounded wait timed out and nothing changed.
    ///
    /// # Errors
    ///
    /// A fatal error (`ProtocolViolation`) means hardware and software state
    /// can no longer be trusted; the caller must tear the session down.
    fn step(
        &mut self,
        device: &D,
        mode: BufferMode,
        streams: &mut Streams,
    ) -> DmaResult<Directions>;

    /// Give up every in-flight operation before teardown.
    fn abandon(&mut self, device: &D);
}

/// A failed synchronization call leaves the counters unknown.
fn sync_failure(direction: Direction, err: DmaError) -> DmaError {
    if err.is_fatal() {
        err
    } else {
        DmaError::violation(direction, format!("synchronization call failed: {}", err))
    }
}

/// Zero-copy: release claimed slots, then learn the hardware count.
fn sync_counters<D: DmaDevice>(device: &D, stream: &mut Stream) -> DmaResult<()> {
    let channel = &mut stream.channel;
    let direction = channel.direction();
    device
        .push_sw_count(direction, channel.sw_count())
        .map_err(|e| sync_failure(direction, e))?;
    let counts = device
        .enable_channel(direction, true)
        .map_err(|e| sync_failure(direction, e))?;
    channel.observe_hw_count(counts.hw_count)?;
    log::trace!(
        "{}: hw {} sw {} available {}",
        direction,
        channel.hw_count(),
        channel.sw_count(),
        channel.available()
    );
    Ok(())
}

/// Bytes requested by one copy transfer: a full batch of `capacity_bound` slots.
fn batch_len(stream: &Stream) -> usize {
    stream.channel.capacity_bound() * stream.ring.slot_size()
}

/// Copy mode: move one batch with a blocking `read` / `write`.
fn transfer_copy<D: DmaDevice>(device: &D, stream: &mut Stream) -> DmaResult<()> {
    let direction = stream.channel.direction();
    let slots = stream.channel.capacity_bound();
    stream.channel.suspend();

    let buf = stream.ring.batch_mut(slots);
    let requested = buf.len();
    let moved = match direction {
        Direction::Inbound => device.read(buf),
        Direction::Outbound => device.write(buf),
    }
    .map_err(|e| sync_failure(direction, e))?;
    finish_copy(stream, requested, moved)
}

/// Account for a finished copy transfer.
fn finish_copy(stream: &mut Stream, requested: usize, moved: usize) -> DmaResult<()> {
    let direction = stream.channel.direction();
    let slot_size = stream.ring.slot_size();
    if moved > requested || moved % slot_size != 0 {
        return Err(DmaError::violation(
            direction,
            format!(
                "moved {} bytes for a {}-byte request with {}-byte slots",
                moved, requested, slot_size
            ),
        ));
    }
    stream.channel.complete_batch(moved / slot_size);
    log::trace!("{}: batch of {} slots", direction, moved / slot_size);
    Ok(())
}

// ============================================================================
// Readiness Polling
// ============================================================================

/// Waits for readiness, then syncs the ready directions only.
#[derive(Debug, Clone)]
pub struct PollingTransport {
    timeout: Duration,
}

impl PollingTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<D: DmaDevice> TransportDriver<D> for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn step(
        &mut self,
        device: &D,
        mode: BufferMode,
        streams: &mut Streams,
    ) -> DmaResult<Directions> {
        let ready = device.wait_ready(streams.active(), self.timeout)?;
        for direction in ready.each() {
            let stream = streams.expect_mut(direction)?;
            match mode {
                BufferMode::ZeroCopy => sync_counters(device, stream)?,
                BufferMode::Copy => transfer_copy(device, stream)?,
            }
        }
        Ok(ready)
    }

    fn abandon(&mut self, _device: &D) {}
}

// ============================================================================
// Overlapped Completion
// ============================================================================

/// Submits both directions asynchronously and harvests completions.
///
/// Synchronous completions are consumed in the same step, and every pending
/// transfer that already finished is harvested without waiting. Only when
/// nothing completed does the step block for any one pending transfer.
///
/// In zero-copy mode there is nothing to submit: counters are exchanged for
/// every direction, and when hardware made no progress the step waits for
/// readiness (if the device supports it) before syncing again.
#[derive(Debug, Clone)]
pub struct OverlappedTransport {
    timeout: Duration,
    pending: Directions,
    /// Bytes requested by each in-flight transfer.
    requested: [usize; 2],
}

impl OverlappedTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Directions::empty(),
            requested: [0; 2],
        }
    }

    /// Directions with a transfer in flight.
    pub fn pending(&self) -> Directions {
        self.pending
    }

    /// Wait up to `timeout` for one pending transfer and account for it.
    ///
    /// Returns `None` when nothing is pending or nothing finished in time.
    fn harvest<D: OverlappedDevice>(
        &mut self,
        device: &D,
        streams: &mut Streams,
        timeout: Duration,
    ) -> DmaResult<Option<Direction>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let harvested = device.wait_any(self.pending, timeout).map_err(|e| {
            // Either pending direction may have failed; report the first.
            let direction = self.pending.each().next().unwrap_or(Direction::Inbound);
            sync_failure(direction, e)
        })?;
        let Some((direction, moved)) = harvested else {
            return Ok(None);
        };
        self.pending.remove(direction.flag());
        let requested = self.requested[direction.index()];
        finish_copy(streams.expect_mut(direction)?, requested, moved)?;
        Ok(Some(direction))
    }

    /// Zero-copy step: exchange counters, waiting once if nothing moved.
    fn step_counters<D: DmaDevice>(
        &mut self,
        device: &D,
        streams: &mut Streams,
    ) -> DmaResult<Directions> {
        let active = streams.active();
        let before = hw_counts(streams);
        for direction in active.each() {
            sync_counters(device, streams.expect_mut(direction)?)?;
        }
        if hw_counts(streams) != before {
            return Ok(active);
        }

        let ready = match device.wait_ready(active, self.timeout) {
            Ok(ready) => ready,
            Err(DmaError::PlatformNotSupported(_)) => return Ok(active),
            Err(e) => return Err(e),
        };
        for direction in ready.each() {
            sync_counters(device, streams.expect_mut(direction)?)?;
        }
        Ok(ready)
    }
}

fn hw_counts(streams: &Streams) -> [Option<u64>; 2] {
    Direction::ALL.map(|d| streams.get(d).map(|s| s.channel.hw_count()))
}

impl<D: OverlappedDevice> TransportDriver<D> for OverlappedTransport {
    fn name(&self) -> &'static str {
        "overlapped"
    }

    fn step(
        &mut self,
        device: &D,
        mode: BufferMode,
        streams: &mut Streams,
    ) -> DmaResult<Directions> {
        if mode == BufferMode::ZeroCopy {
            return self.step_counters(device, streams);
        }

        let mut completed = Directions::empty();
        for direction in (streams.active() - self.pending).each() {
            let stream = streams.expect_mut(direction)?;
            stream.channel.suspend();
            let len = batch_len(stream);
            let buf = stream.ring.as_mut_ptr();

            // SAFETY: the channel is suspended, so no slot of the batch is
            // handed out until the transfer is harvested; the ring outlives
            // the transfer because the session calls `abandon` before
            // dropping its streams.
            match unsafe { device.submit(direction, buf, len) }
                .map_err(|e| sync_failure(direction, e))?
            {
                Submission::Completed(moved) => {
                    finish_copy(stream, len, moved)?;
                    completed |= direction.flag();
                }
                Submission::Pending => {
                    self.pending |= direction.flag();
                    self.requested[direction.index()] = len;
                }
            }
        }

        // Harvest whatever already finished, then block only if idle.
        while let Some(direction) = self.harvest(device, streams, Duration::ZERO)? {
            completed |= direction.flag();
        }
        if completed.is_empty() {
            if let Some(direction) = self.harvest(device, streams, self.timeout)? {
                completed |= direction.flag();
            }
        }
        Ok(completed)
    }

    fn abandon(&mut self, device: &D) {
        if !self.pending.is_empty() {
            log::debug!("cancelling in-flight transfers {:?}", self.pending);
            device.cancel_all();
            self.pending = Directions::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{Fault, SoftCard, SoftConfig, SoftDevice};

    const SLOT: usize = 64;

    fn card() -> SoftCard {
        SoftCard::new(SoftConfig {
            slot_size: SLOT,
            slot_count: 8,
            batch_per_tick: 8,
        })
    }

    fn copy_streams(device: &SoftDevice, outbound_bound: usize) -> Streams {
        device.set_loopback(true).unwrap();
        let mut streams = Streams::default();
        for (direction, bound) in [(Direction::Inbound, 8), (Direction::Outbound, outbound_bound)] {
            device.enable_channel(direction, true).unwrap();
            let mut channel = DmaChannel::new(direction, 8, bound, false);
            channel.enable();
            let ring = BufferRing::allocate(direction, SLOT, 8).unwrap();
            streams.insert(Stream::new(channel, ring));
        }
        streams
    }

    #[test]
    fn test_polling_copy_moves_full_batches() {
        let card = card();
        let device = card.open();
        let mut streams = copy_streams(&device, 8);
        let mut transport = PollingTransport::new(Duration::from_millis(50));

        let synced = transport
            .step(&device, BufferMode::Copy, &mut streams)
            .unwrap();
        assert!(synced.has(Direction::Outbound));
        let out = streams.get(Direction::Outbound).unwrap().channel();
        assert_eq!(out.available(), 8);
        assert_eq!(out.cursor(), 0);
    }

    #[test]
    fn test_misaligned_completion_is_a_violation() {
        let card = card();
        let device = card.open();
        let mut streams = copy_streams(&device, 8);
        card.inject(Fault::ShortCompletion {
            direction: Direction::Outbound,
            bytes: SLOT / 2,
        });

        let mut transport = PollingTransport::new(Duration::from_millis(50));
        let err = transport
            .step(&device, BufferMode::Copy, &mut streams)
            .unwrap_err();
        assert!(matches!(
            err,
            DmaError::ProtocolViolation {
                direction: Direction::Outbound,
                ..
            }
        ));
    }

    #[test]
    fn test_polling_timeout_changes_nothing() {
        let card = card();
        let device = card.open();
        let mut streams = Streams::default();
        device.enable_channel(Direction::Inbound, true).unwrap();
        let mut channel = DmaChannel::new(Direction::Inbound, 8, 8, true);
        channel.enable();
        let ring = BufferRing::allocate(Direction::Inbound, SLOT, 8).unwrap();
        streams.insert(Stream::new(channel, ring));

        let mut transport = PollingTransport::new(Duration::from_millis(5));
        let synced = transport
            .step(&device, BufferMode::ZeroCopy, &mut streams)
            .unwrap();
        assert!(synced.is_empty());
        assert_eq!(streams.get(Direction::Inbound).unwrap().channel().hw_count(), 0);
    }

    #[test]
    fn test_overlapped_keeps_inbound_in_flight() {
        let card = card();
        let device = card.open();
        let mut streams = copy_streams(&device, 4);
        device.set_loopback(false).unwrap();
        let mut transport = OverlappedTransport::new(Duration::from_millis(5));

        // Nothing comes back: inbound stays pending, outbound completes.
        for _ in 0..3 {
            let completed = transport
                .step(&device, BufferMode::Copy, &mut streams)
                .unwrap();
            assert_eq!(completed, Directions::OUTBOUND);
            assert_eq!(transport.pending(), Directions::INBOUND);
            assert_eq!(streams.get(Direction::Inbound).unwrap().channel().available(), 0);
        }

        transport.abandon(&device);
        assert!(transport.pending().is_empty());
    }

    #[test]
    fn test_overlapped_harvests_finished_read_alongside_sync_write() {
        let card = card();
        let device = card.open();
        let mut streams = copy_streams(&device, 4);
        let mut transport = OverlappedTransport::new(Duration::from_millis(50));

        // The read is submitted before any data exists and goes pending; the
        // write completes at once and its slots loop back within the step.
        let completed = transport
            .step(&device, BufferMode::Copy, &mut streams)
            .unwrap();
        assert_eq!(completed, Directions::all());
        assert!(transport.pending().is_empty());
        let inbound = streams.get(Direction::Inbound).unwrap().channel();
        assert_eq!(inbound.available(), 4);
        assert_eq!(inbound.hw_count(), 4);
    }

    #[test]
    fn test_overlapped_zero_copy_waits_when_idle() {
        let card = card();
        let device = card.open();
        device.enable_channel(Direction::Inbound, true).unwrap();
        let mut channel = DmaChannel::new(Direction::Inbound, 8, 8, true);
        channel.enable();
        let ring = BufferRing::allocate(Direction::Inbound, SLOT, 8).unwrap();
        let mut streams = Streams::default();
        streams.insert(Stream::new(channel, ring));

        let timeout = Duration::from_millis(20);
        let mut transport = OverlappedTransport::new(timeout);
        let start = std::time::Instant::now();
        let synced = transport
            .step(&device, BufferMode::ZeroCopy, &mut streams)
            .unwrap();
        assert!(synced.is_empty());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_submission_failure_is_fatal() {
        let card = card();
        let device = card.open();
        let mut streams = copy_streams(&device, 4);
        card.inject(Fault::SubmitFailure {
            direction: Direction::Inbound,
        });

        let mut transport = OverlappedTransport::new(Duration::from_millis(50));
        let err = transport
            .step(&device, BufferMode::Copy, &mut streams)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
