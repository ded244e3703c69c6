// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DMA streaming.

use crate::channel::{Direction, Directions};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while setting up or running a DMA session.
#[derive(Debug, Error)]
pub enum DmaError {
    /// The device node could not be opened.
    #[error("device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another session already owns one of the requested DMA directions.
    #[error("DMA not available: {denied:?} locked by another session")]
    LockDenied { denied: Directions },

    /// Private ring allocation failed (copy mode).
    #[error("failed to allocate {bytes} bytes for the {direction} ring")]
    AllocationFailure { direction: Direction, bytes: usize },

    /// Hardware and software disagree on buffer ownership; the session is torn down.
    #[error("{direction} protocol violation: {reason}")]
    ProtocolViolation { direction: Direction, reason: String },

    /// Zero-copy mapping is not offered by this device or platform.
    #[error("zero-copy DMA not available on this device")]
    ZeroCopyUnsupported,

    /// Memory mapping of the driver's DMA buffers failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Invalid session configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session was already cleaned up (or torn down after a fatal error).
    #[error("DMA session is closed")]
    SessionClosed,

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Platform not supported.
    #[error("platform not supported: {0}")]
    PlatformNotSupported(&'static str),
}

impl DmaError {
    /// Wrap a failure of a synchronization call at the driver boundary.
    pub(crate) fn violation(direction: Direction, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            direction,
            reason: reason.into(),
        }
    }

    /// Returns true if the error leaves hardware and software state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;
