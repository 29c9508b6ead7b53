// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for firmware command, event queue and mailbox operations.

use std::backtrace::Backtrace;
use thiserror::Error;

/// Errors that can occur while talking to device firmware.
#[derive(Debug, Error)]
pub enum FwError {
    /// Inline request does not fit in front of the response window.
    #[error("request of {len} bytes exceeds the {max}-byte inline limit")]
    RequestTooLarge { len: usize, max: usize },

    /// Handle does not refer to a live request context of that type.
    #[error("invalid or stale request handle")]
    InvalidHandle,

    /// Request context already held by the caller.
    #[error("request context already held")]
    AlreadyHeld,

    /// Request context already carries its auxiliary DMA mapping.
    #[error("request context already has an auxiliary DMA mapping")]
    SliceInUse,

    /// Request context is being sent right now.
    #[error("request context is in flight")]
    InFlight,

    /// Callback slot is not idle.
    #[error("callback {0} already registered")]
    AlreadyRegistered(usize),

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// DMA memory could not be allocated.
    #[error("DMA allocation of {0} bytes failed")]
    NoMemory(usize),

    /// Bounded work queue is full; the item was dropped.
    #[error("work queue full")]
    QueueFull,

    /// Firmware refused access to the resource.
    #[error("firmware denied access")]
    AccessDenied,

    /// Firmware ran out of the requested resource.
    #[error("firmware resources exhausted")]
    ResourceExhausted,

    /// Firmware rejected the request parameters.
    #[error("firmware rejected parameters")]
    InvalidParams,

    /// Firmware could not allocate a buffer for the request.
    #[error("firmware out of memory")]
    FwNoMemory,

    /// Firmware (or peer) is busy; the request may be retried.
    #[error("firmware busy")]
    Busy,

    /// Firmware does not implement the request.
    #[error("request not supported by firmware")]
    Unsupported,

    /// Any other error code reported by the device.
    #[error("device error: code={code:#06x}")]
    DeviceError { code: u16 },

    /// No valid completion was observed within the timeout.
    #[error("timeout: type={req_type:#06x} seq={seq} after {elapsed_ms}ms (len={resp_len}, valid={valid})")]
    Timeout {
        req_type: u16,
        seq: u16,
        elapsed_ms: u64,
        resp_len: u16,
        valid: u8,
    },

    /// Device reported a fatal health condition; no hardware access attempted.
    #[error("device is in a fatal state")]
    DeviceFatal,

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),
}

impl FwError {
    /// Returns true if the caller may reasonably retry the request.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Returns true for errors caused by a caller bug rather than the device.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::RequestTooLarge { .. }
                | Self::InvalidHandle
                | Self::AlreadyHeld
                | Self::SliceInUse
                | Self::InFlight
                | Self::AlreadyRegistered(_)
        )
    }
}

/// Result type alias for firmware operations.
pub type FwResult<T> = Result<T, FwError>;

/// Log a usage error loudly, with a captured backtrace, and hand it back.
pub(crate) fn misuse(err: FwError, what: &str) -> FwError {
    log::error!("{}: {}\n{}", what, err, Backtrace::capture());
    err
}
