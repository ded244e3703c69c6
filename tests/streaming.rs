// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Long loopback runs: ordering, integrity, wraparound and counter behavior.

use litepcie_dma::{
    Direction, DmaConfig, DmaDevice, DmaSession, SoftCard, SoftConfig, SoftDevice,
};
use std::time::Duration;

const SLOT: usize = 128;
const SLOTS: usize = 16;

fn card(batch_per_tick: usize) -> SoftCard {
    SoftCard::new(SoftConfig {
        slot_size: SLOT,
        slot_count: SLOTS,
        batch_per_tick,
    })
}

fn config(zero_copy: bool) -> DmaConfig {
    let mut config = DmaConfig::new(zero_copy);
    config.set_geometry(SLOT, SLOTS);
    config.set_outbound_capacity_bound(SLOTS / 2);
    config.set_wait_timeout(Duration::from_millis(20));
    config
}

fn fill(slot: &mut [u8], seq: u64) {
    for (i, b) in slot[12..].iter_mut().enumerate() {
        *b = (seq as usize).wrapping_mul(31).wrapping_add(i) as u8;
    }
    let crc = crc32fast::hash(&slot[12..]);
    slot[..8].copy_from_slice(&seq.to_le_bytes());
    slot[8..12].copy_from_slice(&crc.to_le_bytes());
}

fn verify(slot: &[u8]) -> u64 {
    let seq = u64::from_le_bytes(slot[..8].try_into().unwrap());
    let crc = u32::from_le_bytes(slot[8..12].try_into().unwrap());
    assert_eq!(crc32fast::hash(&slot[12..]), crc, "slot {} corrupted", seq);
    seq
}

struct Snapshot {
    zero_copy: bool,
    hw: [u64; 2],
    sw: [u64; 2],
}

impl Snapshot {
    fn new(zero_copy: bool) -> Self {
        Self {
            zero_copy,
            hw: [0; 2],
            sw: [0; 2],
        }
    }

    /// Check counters only move forward and stay within their bounds.
    fn advance<D: DmaDevice + 'static>(&mut self, session: &DmaSession<D>) {
        for direction in Direction::ALL {
            let stream = session.stream(direction).unwrap();
            let channel = stream.channel();
            let (hw, sw) = (channel.hw_count(), channel.sw_count());
            let i = direction.index();
            assert!(hw >= self.hw[i], "{} hw_count went backwards", direction);
            assert!(sw >= self.sw[i], "{} sw_count went backwards", direction);
            assert!(channel.available() <= channel.capacity_bound());
            match direction {
                Direction::Inbound => {
                    assert!(hw >= sw, "inbound sw {} passed hw {}", sw, hw);
                    assert!(hw - sw <= SLOTS as u64);
                }
                Direction::Outbound => {
                    assert!(sw >= hw, "outbound hw {} passed sw {}", hw, sw);
                    assert!(sw - hw <= channel.capacity_bound() as u64);
                }
            }
            if self.zero_copy {
                assert_eq!(channel.cursor() as u64, sw % SLOTS as u64);
            }
            self.hw[i] = hw;
            self.sw[i] = sw;
        }
    }
}

/// Stream `total` slots out and check they come back complete and in order.
fn run_zero_copy(mut session: DmaSession<SoftDevice>, total: u64) {
    let mut sent = 0u64;
    let mut received = 0u64;
    let mut snapshot = Snapshot::new(true);

    for _ in 0..10_000 {
        if received == total {
            break;
        }
        session.step().unwrap();
        snapshot.advance(&session);

        while sent < total {
            let Some(slot) = session.next_outbound_buffer() else {
                break;
            };
            fill(slot, sent);
            sent += 1;
        }
        while let Some(slot) = session.next_inbound_buffer() {
            assert_eq!(verify(slot), received, "slot lost or duplicated");
            received += 1;
        }
        snapshot.advance(&session);
    }
    assert_eq!(received, total);

    let stats = session.cleanup().unwrap();
    assert_eq!(stats.inbound.sw_count, total);
    assert_eq!(stats.outbound.sw_count, total);
    assert_eq!(stats.inbound.bytes(), total * SLOT as u64);
}

#[test]
fn test_zero_copy_polling_loopback_wraps_many_times() {
    let card = card(3);
    let session = DmaSession::polling(card.open(), &config(true)).unwrap();
    run_zero_copy(session, 20 * SLOTS as u64);
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_zero_copy_overlapped_loopback_wraps_many_times() {
    let card = card(5);
    let session = DmaSession::overlapped(card.open(), &config(true)).unwrap();
    run_zero_copy(session, 20 * SLOTS as u64);
    assert_eq!(card.open_handles(), 0);
}

/// Copy mode hands out whole batches; check the protocol, not the payload.
fn run_copy(mut session: DmaSession<SoftDevice>, steps: usize) -> u64 {
    let mut snapshot = Snapshot::new(false);
    let mut received = 0u64;

    for _ in 0..steps {
        let available = session.step().unwrap();
        snapshot.advance(&session);
        assert!(available.inbound <= SLOTS);
        assert!(available.outbound <= SLOTS / 2);

        let mut claimed = 0;
        while let Some(slot) = session.next_outbound_buffer() {
            slot.fill(0xC3);
            claimed += 1;
        }
        assert_eq!(claimed, available.outbound);

        let mut claimed = 0;
        while let Some(slot) = session.next_inbound_buffer() {
            assert_eq!(slot.len(), SLOT);
            claimed += 1;
        }
        assert_eq!(claimed, available.inbound);
        received += claimed as u64;
        snapshot.advance(&session);
    }

    session.cleanup().unwrap();
    received
}

#[test]
fn test_copy_polling_loopback() {
    let card = card(4);
    let session = DmaSession::polling(card.open(), &config(false)).unwrap();
    assert!(run_copy(session, 200) > 0);
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_copy_overlapped_loopback() {
    let card = card(4);
    let session = DmaSession::overlapped(card.open(), &config(false)).unwrap();
    assert!(run_copy(session, 200) > 0);
    assert!(card.lock_owner(Direction::Inbound).is_none());
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_copy_inbound_batches_reset_the_cursor() {
    let card = card(8);
    let mut session = DmaSession::polling(card.open(), &config(false)).unwrap();

    for _ in 0..50 {
        let available = session.step().unwrap();
        if available.inbound > 0 {
            let channel = session.stream(Direction::Inbound).unwrap().channel();
            assert_eq!(channel.cursor(), 0);
            break;
        }
        while session.next_outbound_buffer().is_some() {}
    }
    let stats = session.cleanup().unwrap();
    assert!(stats.inbound.hw_count > 0);
}
