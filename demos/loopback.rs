// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA loopback test: stream numbered, checksummed slots out and verify them
//! as they come back in.
//!
//! Run with: `cargo run --example loopback -- [DEVICE] [--zero-copy] [--seconds N]`
//!
//! `DEVICE` defaults to `soft` (the in-process emulated board); use e.g.
//! `/dev/litepcie0` on Linux or `\DMA0` on Windows for real hardware.
//! Set `RUST_LOG=debug` for protocol logs.

use clap::Parser;
use litepcie_dma::{DmaConfig, DmaDevice, DmaError, DmaSession, SoftCard, SoftConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slot header: sequence number and CRC32 of the payload.
const HEADER: usize = 12;

#[derive(Parser)]
#[command(name = "loopback", about = "LitePCIe DMA loopback test")]
struct Options {
    /// Device to stream through: `soft` for the emulated board, or a device
    /// path such as /dev/litepcie0
    #[arg(default_value = "soft")]
    device: String,

    /// Use driver-mapped rings instead of copying through read/write
    #[arg(short, long)]
    zero_copy: bool,

    /// How long to stream
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,
}

fn fill_slot(slot: &mut [u8], seq: u64) {
    let payload = &mut slot[HEADER..];
    let mut state = seq.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    for byte in payload.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
    let crc = crc32fast::hash(payload);
    slot[..8].copy_from_slice(&seq.to_le_bytes());
    slot[8..HEADER].copy_from_slice(&crc.to_le_bytes());
}

/// Returns the sequence number if the payload checksum matches.
fn check_slot(slot: &[u8]) -> Option<u64> {
    let seq = u64::from_le_bytes(slot[..8].try_into().ok()?);
    let crc = u32::from_le_bytes(slot[8..HEADER].try_into().ok()?);
    (crc32fast::hash(&slot[HEADER..]) == crc).then_some(seq)
}

#[derive(Default)]
struct Tally {
    sent: u64,
    received: u64,
    corrupt: u64,
    out_of_order: u64,
    expected: Option<u64>,
}

fn run<D: DmaDevice + 'static>(
    mut session: DmaSession<D>,
    stop: &AtomicBool,
) -> Result<Tally, DmaError> {
    let mut tally = Tally::default();
    let start = Instant::now();
    let mut last_report = start;

    while !stop.load(Ordering::Relaxed) {
        session.step()?;

        while let Some(slot) = session.next_outbound_buffer() {
            fill_slot(slot, tally.sent);
            tally.sent += 1;
        }
        while let Some(slot) = session.next_inbound_buffer() {
            tally.received += 1;
            match check_slot(slot) {
                None => tally.corrupt += 1,
                Some(seq) => {
                    if tally.expected.is_some_and(|expected| expected != seq) {
                        tally.out_of_order += 1;
                    }
                    tally.expected = Some(seq + 1);
                }
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let stats = session.stats();
            let secs = start.elapsed().as_secs_f64();
            println!(
                "{:6.1}s  TX {:8.2} MB/s  RX {:8.2} MB/s  errors {}",
                secs,
                stats.outbound.bytes() as f64 / secs / 1e6,
                stats.inbound.bytes() as f64 / secs / 1e6,
                tally.corrupt + tally.out_of_order
            );
            last_report = Instant::now();
        }
    }

    let stats = session.cleanup()?;
    println!();
    println!("Steps: {} ({} timeouts)", stats.steps, stats.timeouts);
    for (name, dir) in [("TX", &stats.outbound), ("RX", &stats.inbound)] {
        println!(
            "  {}: hw {} sw {} final {:?}",
            name, dir.hw_count, dir.sw_count, dir.final_counts
        );
    }
    Ok(tally)
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();

    let options = Options::parse();

    println!("LitePCIe DMA Loopback Test");
    println!("==========================\n");
    println!("  Device:    {}", options.device);
    println!(
        "  Mode:      {}",
        if options.zero_copy { "zero-copy" } else { "copy" }
    );
    println!("  Duration:  {} s\n", options.seconds);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let seconds = options.seconds;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            stop.store(true, Ordering::Relaxed);
        });
    }

    let result = if options.device == "soft" {
        let card = SoftCard::new(SoftConfig {
            slot_size: 8192,
            slot_count: 256,
            batch_per_tick: 32,
        });
        let config = DmaConfig::new(options.zero_copy);
        DmaSession::polling(card.open(), &config).and_then(|session| run(session, &stop))
    } else {
        DmaSession::init(&options.device, options.zero_copy)
            .and_then(|session| run(session, &stop))
    };

    match result {
        Ok(tally) => {
            println!();
            println!("Sent:         {}", tally.sent);
            println!("Received:     {}", tally.received);
            println!("Corrupt:      {}", tally.corrupt);
            println!("Out of order: {}", tally.out_of_order);
        }
        Err(DmaError::LockDenied { denied }) => {
            eprintln!("DMA not available: {:?} in use by another process", denied);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("DMA loopback failed: {}", e);
            std::process::exit(1);
        }
    }
}
