// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Session-level protocol scenarios against the emulated board.

use litepcie_dma::{
    Direction, Directions, DmaConfig, DmaError, DmaSession, Fault, SoftCard, SoftConfig,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const SLOT: usize = 256;

fn card() -> SoftCard {
    SoftCard::new(SoftConfig {
        slot_size: SLOT,
        slot_count: 8,
        batch_per_tick: 8,
    })
}

fn config(zero_copy: bool) -> DmaConfig {
    let mut config = DmaConfig::new(zero_copy);
    config.set_geometry(SLOT, 8);
    config.set_wait_timeout(Duration::from_millis(20));
    config
}

#[test]
fn test_inbound_three_completions_give_three_claims() {
    let card = card();
    let mut session = DmaSession::polling(card.open(), &config(true)).unwrap();

    for i in 0..3u8 {
        let slot = session.next_outbound_buffer().unwrap();
        slot.fill(i + 1);
    }

    let mut inbound = 0;
    for _ in 0..10 {
        inbound = session.step().unwrap().inbound;
        if inbound > 0 {
            break;
        }
    }
    assert_eq!(inbound, 3);
    assert_eq!(
        session.stream(Direction::Inbound).unwrap().channel().hw_count(),
        3
    );

    for i in 0..3u8 {
        let slot = session.next_inbound_buffer().unwrap();
        assert!(slot.iter().all(|&b| b == i + 1));
    }
    assert!(session.next_inbound_buffer().is_none());
    assert_eq!(
        session.stream(Direction::Inbound).unwrap().channel().sw_count(),
        3
    );
}

#[test]
fn test_copy_outbound_partial_write_resets_cursor() {
    let card = card();
    let mut config = config(false);
    config.set_directions(Directions::OUTBOUND);
    config.set_outbound_capacity_bound(8);
    let mut session = DmaSession::polling(card.open(), &config).unwrap();

    // Copy-mode outbound starts with the whole batch free.
    assert_eq!(session.availability().outbound, 8);
    session.next_outbound_buffer().unwrap();
    session.next_outbound_buffer().unwrap();
    assert_eq!(
        session.stream(Direction::Outbound).unwrap().channel().cursor(),
        2
    );

    card.inject(Fault::ShortCompletion {
        direction: Direction::Outbound,
        bytes: 3 * SLOT,
    });
    let available = session.step().unwrap();
    assert_eq!(available.outbound, 3);
    assert_eq!(
        session.stream(Direction::Outbound).unwrap().channel().cursor(),
        0
    );
}

#[test]
fn test_misaligned_completion_tears_everything_down() {
    let card = card();
    let mut config = config(false);
    config.set_outbound_capacity_bound(8);
    let mut session = DmaSession::polling(card.open(), &config).unwrap();

    card.inject(Fault::ShortCompletion {
        direction: Direction::Outbound,
        bytes: SLOT / 2,
    });
    let err = session.step().unwrap_err();
    assert!(matches!(
        err,
        DmaError::ProtocolViolation {
            direction: Direction::Outbound,
            ..
        }
    ));

    // Disabled, unlocked, unmapped, closed.
    assert!(!session.is_open());
    assert!(!card.is_enabled(Direction::Inbound));
    assert!(!card.is_enabled(Direction::Outbound));
    assert_eq!(card.lock_owner(Direction::Inbound), None);
    assert_eq!(card.lock_owner(Direction::Outbound), None);
    assert_eq!(card.open_handles(), 0);

    assert!(matches!(session.step(), Err(DmaError::SessionClosed)));
    assert!(session.next_inbound_buffer().is_none());
    assert!(session.stats().outbound.final_counts.is_some());
}

#[test]
fn test_counter_rollback_is_fatal() {
    let card = card();
    let mut session = DmaSession::polling(card.open(), &config(true)).unwrap();

    session.next_outbound_buffer().unwrap();
    session.next_outbound_buffer().unwrap();
    // The card consumes both released slots on this step.
    session.step().unwrap();
    assert_eq!(
        session.stream(Direction::Outbound).unwrap().channel().hw_count(),
        2
    );

    card.inject(Fault::CounterRollback {
        direction: Direction::Outbound,
    });
    let err = session.step().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_one_session_per_direction() {
    let card = card();
    let contenders = 4;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let card = card.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut config = config(false);
                config.set_directions(Directions::OUTBOUND);
                config.set_outbound_capacity_bound(4);
                barrier.wait();
                let result = DmaSession::polling(card.open(), &config);
                let won = result.is_ok();
                // Hold the lock until every contender has tried.
                barrier.wait();
                drop(result);
                won
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(card.lock_owner(Direction::Outbound), None);
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_directions_are_locked_independently() {
    let card = card();
    let mut inbound = config(false);
    inbound.set_directions(Directions::INBOUND);
    let mut outbound = config(false);
    outbound.set_directions(Directions::OUTBOUND);
    outbound.set_outbound_capacity_bound(4);

    let _rx = DmaSession::polling(card.open(), &inbound).unwrap();
    let _tx = DmaSession::polling(card.open(), &outbound).unwrap();
    assert!(matches!(
        DmaSession::polling(card.open(), &config(false)),
        Err(DmaError::LockDenied { .. })
    ));
}

#[test]
fn test_drop_releases_the_lock() {
    let card = card();
    {
        let mut session = DmaSession::polling(card.open(), &config(true)).unwrap();
        session.step().unwrap();
        assert!(card.lock_owner(Direction::Inbound).is_some());
    }
    assert_eq!(card.lock_owner(Direction::Inbound), None);
    assert_eq!(card.lock_owner(Direction::Outbound), None);
    assert!(!card.is_enabled(Direction::Outbound));
    assert_eq!(card.open_handles(), 0);

    // The directions are free again.
    let session = DmaSession::polling(card.open(), &config(true)).unwrap();
    assert_eq!(session.locked(), Directions::all());
}

#[test]
fn test_sync_failure_in_overlapped_zero_copy_is_fatal() {
    let card = card();
    let mut session = DmaSession::overlapped(card.open(), &config(true)).unwrap();
    session.step().unwrap();

    card.inject(Fault::SyncFailure {
        direction: Direction::Inbound,
    });
    assert!(session.step().unwrap_err().is_fatal());
    assert!(!session.is_open());
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_cleanup_reports_final_counts() {
    let card = card();
    let mut session = DmaSession::polling(card.open(), &config(true)).unwrap();
    for _ in 0..4 {
        session.next_outbound_buffer().unwrap();
    }
    session.step().unwrap();

    let stats = session.cleanup().unwrap();
    assert_eq!(stats.outbound.sw_count, 4);
    let final_out = stats.outbound.final_counts.unwrap();
    assert_eq!(final_out.sw_count, 4);
    assert_eq!(final_out.hw_count, 4);
    assert_eq!(card.open_handles(), 0);
}

#[test]
fn test_copy_counters_stay_within_the_ring() {
    let card = card();
    let mut config = config(false);
    config.set_outbound_capacity_bound(4);
    let mut session = DmaSession::polling(card.open(), &config).unwrap();

    // A batch goes out before anything was claimed.
    session.step().unwrap();
    let out = session.stream(Direction::Outbound).unwrap().channel();
    assert!(out.sw_count() >= out.hw_count());

    // Drain outbound only; inbound batches arrive and are never claimed.
    for _ in 0..20 {
        session.step().unwrap();
        while session.next_outbound_buffer().is_some() {}

        let out = session.stream(Direction::Outbound).unwrap().channel();
        assert!(out.sw_count() >= out.hw_count());
        assert!(out.sw_count() - out.hw_count() <= 4);
        let inb = session.stream(Direction::Inbound).unwrap().channel();
        assert!(inb.hw_count() >= inb.sw_count());
        assert!(inb.hw_count() - inb.sw_count() <= 8);
    }

    let stats = session.cleanup().unwrap();
    assert!(stats.inbound.hw_count > 0);
    assert_eq!(stats.inbound.claimed, 0);
    assert_eq!(stats.inbound.bytes(), 0);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_allocation_failure_releases_lock_and_handle() {
    let card = card();
    let mut config = config(false);
    // 2^60 bytes per ring: representable, but no allocator can provide it.
    config.set_geometry(1 << 40, 1 << 20);

    let err = DmaSession::polling(card.open(), &config).unwrap_err();
    assert!(matches!(err, DmaError::AllocationFailure { .. }));
    assert_eq!(card.lock_owner(Direction::Inbound), None);
    assert_eq!(card.lock_owner(Direction::Outbound), None);
    assert!(!card.is_enabled(Direction::Inbound));
    assert_eq!(card.open_handles(), 0);

    // Both directions are free for the next session.
    assert!(DmaSession::polling(card.open(), &crate::config(false)).is_ok());
}
