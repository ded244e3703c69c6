// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software emulation of a LitePCIe board with its driver.
//!
//! A [`SoftCard`] models one board in FPGA loopback: the reader engine
//! consumes released outbound slots and the writer engine writes them back
//! into the inbound ring. Each [`SoftDevice`] is one open handle on the card,
//! with the driver's per-handle lock bookkeeping and teardown.
//!
//! Hardware only progresses when a handle calls into the card ("ticks"),
//! at most `batch_per_tick` slots per engine per tick, so tests are
//! deterministic. [`Fault`]s can be injected to make the next matching call
//! misbehave.

use crate::channel::{Direction, Directions};
use crate::device::{Counts, DmaDevice, OverlappedDevice, RingGeometry, RingLayout, Submission};
use crate::error::{DmaError, DmaResult};
use crate::ring::SharedRegion;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const INBOUND: usize = Direction::Inbound.index();
const OUTBOUND: usize = Direction::Outbound.index();

/// Interval between hardware ticks while a handle waits.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Shape of the emulated board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftConfig {
    pub slot_size: usize,
    pub slot_count: usize,
    /// Slots each engine may complete per tick.
    pub batch_per_tick: usize,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            slot_size: 1024,
            slot_count: 32,
            batch_per_tick: 8,
        }
    }
}

/// A one-shot misbehavior of the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next copy transfer for `direction` reports `bytes` moved.
    ShortCompletion { direction: Direction, bytes: usize },
    /// The next counter exchange for `direction` fails.
    SyncFailure { direction: Direction },
    /// The next overlapped submission for `direction` fails.
    SubmitFailure { direction: Direction },
    /// The next counter report for `direction` goes backwards by one.
    CounterRollback { direction: Direction },
}

impl Fault {
    fn direction(&self) -> Direction {
        match *self {
            Fault::ShortCompletion { direction, .. }
            | Fault::SyncFailure { direction }
            | Fault::SubmitFailure { direction }
            | Fault::CounterRollback { direction } => direction,
        }
    }
}

/// Driver-owned DMA buffer memory, shared with every mapping of it.
struct KernelRing {
    ptr: *mut [u8],
}

// SAFETY: plain heap memory; concurrent access is confined to disjoint slots
// by the counter protocol.
unsafe impl Send for KernelRing {}
unsafe impl Sync for KernelRing {}

impl KernelRing {
    fn new(len: usize) -> Self {
        Self {
            ptr: Box::into_raw(vec![0u8; len].into_boxed_slice()),
        }
    }

    fn len(&self) -> usize {
        self.ptr.len()
    }

    fn slot_ptr(&self, index: u64, slot_size: usize) -> *mut u8 {
        let slot_count = (self.len() / slot_size) as u64;
        let offset = (index % slot_count) as usize * slot_size;
        // SAFETY: `offset + slot_size <= len`.
        unsafe { (self.ptr as *mut u8).add(offset) }
    }
}

impl Drop for KernelRing {
    fn drop(&mut self) {
        // SAFETY: allocated by `Box::into_raw` in `new`.
        drop(unsafe { Box::from_raw(self.ptr) });
    }
}

/// A "mapping" of a kernel ring into the session.
struct SoftRegion {
    ring: Arc<KernelRing>,
}

// SAFETY: the ring outlives the region through the `Arc`.
unsafe impl SharedRegion for SoftRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ring.ptr as *mut u8
    }

    fn len(&self) -> usize {
        self.ring.len()
    }
}

#[derive(Debug, Default)]
struct Engine {
    enabled: bool,
    hw_count: u64,
    sw_count: u64,
    owner: Option<u64>,
}

struct CardState {
    config: SoftConfig,
    loopback: bool,
    engines: [Engine; 2],
    rings: [Arc<KernelRing>; 2],
    /// Slots travelling through the FPGA loopback path.
    fifo: VecDeque<Box<[u8]>>,
    next_id: u64,
    open_handles: usize,
    faults: Vec<Fault>,
}

impl CardState {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        Some(self.faults.remove(index))
    }

    fn counts(&self, direction: Direction) -> Counts {
        let engine = &self.engines[direction.index()];
        Counts {
            hw_count: engine.hw_count,
            sw_count: engine.sw_count,
        }
    }

    /// Let both engines make progress.
    fn tick(&mut self) {
        let SoftConfig {
            slot_size,
            slot_count,
            batch_per_tick,
        } = self.config;

        // Reader engine: consume slots released by software.
        for _ in 0..batch_per_tick {
            let out = &self.engines[OUTBOUND];
            if !out.enabled || out.hw_count >= out.sw_count {
                break;
            }
            let forward = self.loopback && self.engines[INBOUND].enabled;
            if forward {
                if self.fifo.len() >= slot_count {
                    break;
                }
                let src = self.rings[OUTBOUND].slot_ptr(out.hw_count, slot_size);
                // SAFETY: the slot lies in [hw, sw) and is owned by hardware.
                let data = unsafe { std::slice::from_raw_parts(src, slot_size) };
                self.fifo.push_back(data.into());
            }
            self.engines[OUTBOUND].hw_count += 1;
        }

        // Writer engine: fill inbound slots from the loopback path.
        for _ in 0..batch_per_tick {
            let inb = &self.engines[INBOUND];
            if !inb.enabled || inb.hw_count.saturating_sub(inb.sw_count) >= slot_count as u64 {
                break;
            }
            let Some(data) = self.fifo.pop_front() else {
                break;
            };
            let dst = self.rings[INBOUND].slot_ptr(inb.hw_count, slot_size);
            // SAFETY: the slot is at most `slot_count - 1` ahead of the
            // released count, so software does not hold it.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, slot_size) };
            self.engines[INBOUND].hw_count += 1;
        }
    }

    /// Driver `read`: copy completed inbound slots out.
    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        if let Some(Fault::ShortCompletion { bytes, .. }) = self.take_fault(|f| {
            matches!(f, Fault::ShortCompletion { direction: Direction::Inbound, .. })
        }) {
            return bytes;
        }
        self.tick();

        let slot_size = self.config.slot_size;
        let engine = &mut self.engines[INBOUND];
        if !engine.enabled {
            return 0;
        }
        let ready = engine.hw_count.saturating_sub(engine.sw_count) as usize;
        let slots = ready.min(buf.len() / slot_size);
        for (i, chunk) in buf.chunks_exact_mut(slot_size).take(slots).enumerate() {
            let src = self.rings[INBOUND].slot_ptr(engine.sw_count + i as u64, slot_size);
            // SAFETY: the slot lies in [sw, hw) and is owned by software.
            chunk.copy_from_slice(unsafe { std::slice::from_raw_parts(src, slot_size) });
        }
        engine.sw_count += slots as u64;
        slots * slot_size
    }

    /// Driver `write`: copy outbound slots in and release them to hardware.
    fn write_from(&mut self, buf: &[u8]) -> usize {
        if let Some(Fault::ShortCompletion { bytes, .. }) = self.take_fault(|f| {
            matches!(f, Fault::ShortCompletion { direction: Direction::Outbound, .. })
        }) {
            return bytes;
        }
        self.tick();

        let SoftConfig {
            slot_size,
            slot_count,
            ..
        } = self.config;
        let engine = &mut self.engines[OUTBOUND];
        if !engine.enabled {
            return 0;
        }
        let in_flight = engine.sw_count.saturating_sub(engine.hw_count) as usize;
        let room = slot_count.saturating_sub(in_flight);
        let slots = room.min(buf.len() / slot_size);
        for (i, chunk) in buf.chunks_exact(slot_size).take(slots).enumerate() {
            let dst = self.rings[OUTBOUND].slot_ptr(engine.sw_count + i as u64, slot_size);
            // SAFETY: the slot lies outside [hw, sw) so hardware is not reading it.
            unsafe { std::ptr::copy_nonoverlapping(chunk.as_ptr(), dst, slot_size) };
        }
        engine.sw_count += slots as u64;
        self.tick();
        slots * slot_size
    }

    fn ready(&self, interest: Directions) -> Directions {
        let mut ready = Directions::empty();
        let inb = &self.engines[INBOUND];
        if interest.has(Direction::Inbound) && inb.enabled && inb.hw_count > inb.sw_count {
            ready |= Directions::INBOUND;
        }
        let out = &self.engines[OUTBOUND];
        if interest.has(Direction::Outbound)
            && out.enabled
            && out.sw_count.saturating_sub(out.hw_count) < self.config.slot_count as u64
        {
            ready |= Directions::OUTBOUND;
        }
        ready
    }
}

/// An emulated LitePCIe board. Clones refer to the same board.
#[derive(Clone)]
pub struct SoftCard {
    state: Arc<Mutex<CardState>>,
}

impl SoftCard {
    /// Create a board with loopback disabled and both engines idle.
    pub fn new(config: SoftConfig) -> Self {
        let ring_len = config.slot_size * config.slot_count;
        let state = CardState {
            config,
            loopback: false,
            engines: Default::default(),
            rings: [
                Arc::new(KernelRing::new(ring_len)),
                Arc::new(KernelRing::new(ring_len)),
            ],
            fifo: VecDeque::with_capacity(config.slot_count),
            next_id: 1,
            open_handles: 0,
            faults: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> SoftConfig {
        self.state().config
    }

    /// Open a new handle on the board.
    pub fn open(&self) -> SoftDevice {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.open_handles += 1;
        log::debug!("soft card: handle {} opened", id);
        SoftDevice {
            card: self.clone(),
            id,
            in_flight: Mutex::new([None, None]),
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    /// Handle id holding the lock for `direction`.
    pub fn lock_owner(&self, direction: Direction) -> Option<u64> {
        self.state().engines[direction.index()].owner
    }

    /// Counters as seen by the driver.
    pub fn counts(&self, direction: Direction) -> Counts {
        self.state().counts(direction)
    }

    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.state().engines[direction.index()].enabled
    }

    pub fn loopback(&self) -> bool {
        self.state().loopback
    }

    /// Arm a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        log::debug!("soft card: injecting {:?}", fault);
        self.state().faults.push(fault);
    }
}

impl std::fmt::Debug for SoftCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SoftCard")
            .field("config", &state.config)
            .field("loopback", &state.loopback)
            .field("engines", &state.engines)
            .field("open_handles", &state.open_handles)
            .finish()
    }
}

/// A transfer waiting for the card to make room or data.
struct InFlight {
    buf: *mut u8,
    len: usize,
}

// SAFETY: the submitter guarantees the buffer stays valid until harvested.
unsafe impl Send for InFlight {}

/// One open handle on a [`SoftCard`].
pub struct SoftDevice {
    card: SoftCard,
    id: u64,
    in_flight: Mutex<[Option<InFlight>; 2]>,
}

impl SoftDevice {
    /// Handle id, as reported by [`SoftCard::lock_owner`].
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn card(&self) -> &SoftCard {
        &self.card
    }

    fn in_flight(&self) -> MutexGuard<'_, [Option<InFlight>; 2]> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_fault(state: &mut CardState, direction: Direction) -> DmaResult<()> {
        match state.take_fault(|f| {
            matches!(f, Fault::SyncFailure { .. }) && f.direction() == direction
        }) {
            Some(_) => Err(DmaError::Io(std::io::Error::other(format!(
                "injected {} sync failure",
                direction
            )))),
            None => Ok(()),
        }
    }

    /// Move as much of `len` bytes at `buf` as the card accepts right now.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `len` bytes.
    unsafe fn transfer(&self, direction: Direction, buf: *mut u8, len: usize) -> usize {
        let mut state = self.card.state();
        match direction {
            Direction::Inbound => state.read_into(std::slice::from_raw_parts_mut(buf, len)),
            Direction::Outbound => state.write_from(std::slice::from_raw_parts(buf, len)),
        }
    }
}

impl DmaDevice for SoftDevice {
    fn request_lock(&self, wanted: Directions) -> DmaResult<Directions> {
        let mut state = self.card.state();
        let mut granted = Directions::empty();
        for direction in wanted.each() {
            let owner = &mut state.engines[direction.index()].owner;
            if owner.is_none() || *owner == Some(self.id) {
                *owner = Some(self.id);
                granted |= direction.flag();
            }
        }
        Ok(granted)
    }

    fn release_lock(&self, release: Directions) -> DmaResult<()> {
        let mut state = self.card.state();
        for direction in release.each() {
            let owner = &mut state.engines[direction.index()].owner;
            if *owner == Some(self.id) {
                *owner = None;
            }
        }
        Ok(())
    }

    fn set_loopback(&self, enable: bool) -> DmaResult<()> {
        self.card.state().loopback = enable;
        Ok(())
    }

    fn enable_channel(&self, direction: Direction, enable: bool) -> DmaResult<Counts> {
        let mut state = self.card.state();
        Self::sync_fault(&mut state, direction)?;

        let engine = &mut state.engines[direction.index()];
        if enable != engine.enabled {
            engine.enabled = enable;
            if enable {
                engine.hw_count = 0;
                engine.sw_count = 0;
                state.fifo.clear();
            }
        }
        if enable {
            state.tick();
        }

        let mut counts = state.counts(direction);
        if state
            .take_fault(|f| {
                matches!(f, Fault::CounterRollback { .. }) && f.direction() == direction
            })
            .is_some()
        {
            counts.hw_count = counts.hw_count.saturating_sub(1);
        }
        Ok(counts)
    }

    fn ring_layout(&self) -> DmaResult<RingLayout> {
        let config = self.card.config();
        let geometry = |offset| RingGeometry {
            offset,
            slot_size: config.slot_size,
            slot_count: config.slot_count,
        };
        let ring_len = (config.slot_size * config.slot_count) as u64;
        Ok(RingLayout {
            inbound: geometry(0),
            outbound: geometry(ring_len),
        })
    }

    fn map_ring(
        &self,
        direction: Direction,
        geometry: &RingGeometry,
    ) -> DmaResult<Box<dyn SharedRegion>> {
        let state = self.card.state();
        let ring = &state.rings[direction.index()];
        if geometry.len() > ring.len() {
            return Err(DmaError::MmapFailed(format!(
                "{} ring is {} bytes, {} requested",
                direction,
                ring.len(),
                geometry.len()
            )));
        }
        Ok(Box::new(SoftRegion {
            ring: Arc::clone(ring),
        }))
    }

    fn push_sw_count(&self, direction: Direction, sw_count: u64) -> DmaResult<()> {
        let mut state = self.card.state();
        Self::sync_fault(&mut state, direction)?;
        state.engines[direction.index()].sw_count = sw_count;
        state.tick();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> DmaResult<usize> {
        Ok(self.card.state().read_into(buf))
    }

    fn write(&self, buf: &[u8]) -> DmaResult<usize> {
        Ok(self.card.state().write_from(buf))
    }

    fn wait_ready(&self, interest: Directions, timeout: Duration) -> DmaResult<Directions> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = {
                let mut state = self.card.state();
                state.tick();
                state.ready(interest)
            };
            if !ready.is_empty() || Instant::now() >= deadline {
                return Ok(ready);
            }
            std::thread::sleep(TICK_INTERVAL);
        }
    }
}

impl OverlappedDevice for SoftDevice {
    unsafe fn submit(
        &self,
        direction: Direction,
        buf: *mut u8,
        len: usize,
    ) -> DmaResult<Submission> {
        if self
            .card
            .state()
            .take_fault(|f| matches!(f, Fault::SubmitFailure { .. }) && f.direction() == direction)
            .is_some()
        {
            return Err(DmaError::Io(std::io::Error::other(format!(
                "injected {} submission failure",
                direction
            ))));
        }

        let mut in_flight = self.in_flight();
        if in_flight[direction.index()].is_some() {
            return Err(DmaError::violation(direction, "transfer already in flight"));
        }
        let moved = self.transfer(direction, buf, len);
        if moved > 0 {
            return Ok(Submission::Completed(moved));
        }
        in_flight[direction.index()] = Some(InFlight { buf, len });
        Ok(Submission::Pending)
    }

    fn wait_any(
        &self,
        pending: Directions,
        timeout: Duration,
    ) -> DmaResult<Option<(Direction, usize)>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut in_flight = self.in_flight();
                for direction in pending.each() {
                    let Some(op) = &in_flight[direction.index()] else {
                        continue;
                    };
                    // SAFETY: the buffer was promised valid until harvest.
                    let moved = unsafe { self.transfer(direction, op.buf, op.len) };
                    if moved > 0 {
                        in_flight[direction.index()] = None;
                        return Ok(Some((direction, moved)));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(TICK_INTERVAL);
        }
    }

    fn cancel_all(&self) {
        let mut in_flight = self.in_flight();
        for (op, direction) in in_flight.iter_mut().zip(Direction::ALL) {
            if op.take().is_some() {
                log::debug!("soft card: cancelled {} transfer", direction);
            }
        }
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        let mut state = self.card.state();
        for engine in state.engines.iter_mut() {
            if engine.owner == Some(self.id) {
                engine.owner = None;
                engine.enabled = false;
            }
        }
        state.open_handles -= 1;
        log::debug!("soft card: handle {} closed", self.id);
    }
}

impl std::fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftDevice").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SoftConfig {
        SoftConfig {
            slot_size: 64,
            slot_count: 8,
            batch_per_tick: 8,
        }
    }

    #[test]
    fn test_lock_arbitration() {
        let card = SoftCard::new(small());
        let a = card.open();
        let b = card.open();

        assert_eq!(a.request_lock(Directions::INBOUND).unwrap(), Directions::INBOUND);
        assert_eq!(b.request_lock(Directions::all()).unwrap(), Directions::OUTBOUND);

        // Releasing a lock held by another handle is a no-op.
        b.release_lock(Directions::INBOUND).unwrap();
        assert_eq!(card.lock_owner(Direction::Inbound), Some(a.id()));

        drop(a);
        assert_eq!(card.lock_owner(Direction::Inbound), None);
        assert_eq!(card.open_handles(), 1);
    }

    #[test]
    fn test_copy_loopback_roundtrip() {
        let card = SoftCard::new(small());
        let dev = card.open();
        dev.set_loopback(true).unwrap();
        dev.enable_channel(Direction::Inbound, true).unwrap();
        dev.enable_channel(Direction::Outbound, true).unwrap();

        let out: Vec<u8> = (0..3 * 64).map(|i| i as u8).collect();
        assert_eq!(dev.write(&out).unwrap(), 3 * 64);

        let mut back = vec![0u8; 8 * 64];
        assert_eq!(dev.read(&mut back).unwrap(), 3 * 64);
        assert_eq!(&back[..3 * 64], &out[..]);
        assert_eq!(card.counts(Direction::Outbound).hw_count, 3);
    }

    #[test]
    fn test_zero_copy_counters() {
        let card = SoftCard::new(small());
        let dev = card.open();
        dev.set_loopback(true).unwrap();
        dev.enable_channel(Direction::Inbound, true).unwrap();
        dev.enable_channel(Direction::Outbound, true).unwrap();

        let layout = dev.ring_layout().unwrap();
        let tx = dev.map_ring(Direction::Outbound, &layout.outbound).unwrap();
        let rx = dev.map_ring(Direction::Inbound, &layout.inbound).unwrap();
        unsafe { std::ptr::write_bytes(tx.as_ptr(), 0x5A, 64) };

        dev.push_sw_count(Direction::Outbound, 1).unwrap();
        let counts = dev.enable_channel(Direction::Inbound, true).unwrap();
        assert_eq!(counts.hw_count, 1);
        assert_eq!(unsafe { *rx.as_ptr() }, 0x5A);
    }

    #[test]
    fn test_inbound_never_overruns_released_slots() {
        let card = SoftCard::new(small());
        let dev = card.open();
        dev.set_loopback(true).unwrap();
        dev.enable_channel(Direction::Inbound, true).unwrap();
        dev.enable_channel(Direction::Outbound, true).unwrap();

        // Release far more outbound slots than the inbound ring can hold.
        for _ in 0..6 {
            let hw = card.counts(Direction::Outbound).hw_count;
            dev.push_sw_count(Direction::Outbound, hw + 8).unwrap();
        }
        let counts = dev.enable_channel(Direction::Inbound, true).unwrap();
        assert_eq!(counts.hw_count, 8);
    }

    #[test]
    fn test_faults_fire_once() {
        let card = SoftCard::new(small());
        let dev = card.open();
        dev.enable_channel(Direction::Inbound, true).unwrap();

        card.inject(Fault::SyncFailure {
            direction: Direction::Inbound,
        });
        assert!(dev.push_sw_count(Direction::Outbound, 0).is_ok());
        assert!(dev.push_sw_count(Direction::Inbound, 0).is_err());
        assert!(dev.push_sw_count(Direction::Inbound, 0).is_ok());

        card.inject(Fault::ShortCompletion {
            direction: Direction::Inbound,
            bytes: 32,
        });
        let mut buf = vec![0u8; 8 * 64];
        assert_eq!(dev.read(&mut buf).unwrap(), 32);
        assert_eq!(dev.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_overlapped_pending_then_harvested() {
        let card = SoftCard::new(small());
        let dev = card.open();
        dev.set_loopback(true).unwrap();
        dev.enable_channel(Direction::Inbound, true).unwrap();
        dev.enable_channel(Direction::Outbound, true).unwrap();

        let mut rx = vec![0u8; 8 * 64];
        let submitted = unsafe { dev.submit(Direction::Inbound, rx.as_mut_ptr(), rx.len()) };
        assert_eq!(submitted.unwrap(), Submission::Pending);
        assert_eq!(
            dev.wait_any(Directions::INBOUND, Duration::from_millis(5)).unwrap(),
            None
        );

        let mut tx = vec![7u8; 2 * 64];
        let submitted = unsafe { dev.submit(Direction::Outbound, tx.as_mut_ptr(), tx.len()) };
        assert_eq!(submitted.unwrap(), Submission::Completed(128));

        let done = dev.wait_any(Directions::INBOUND, Duration::from_secs(1)).unwrap();
        assert_eq!(done, Some((Direction::Inbound, 128)));
        assert!(rx[..128].iter().all(|&b| b == 7));
    }
}
