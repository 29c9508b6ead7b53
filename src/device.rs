// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interfaces consumed from the host environment.
//!
//! The transport never touches hardware directly. Everything it needs from
//! the surrounding driver is expressed by two traits:
//!
//! - [`Device`]: register access, DMA memory, time, health and entropy
//! - [`IrqHost`]: interrupt registration and masking
//!
//! Logging goes through the `log` facade.

use crate::dma::DmaRegion;
use crate::error::FwResult;
use std::sync::Arc;
use std::time::Instant;

/// Handle to one device function.
pub trait Device: Send + Sync + 'static {
    /// Read a 32-bit register.
    fn read32(&self, reg: u32) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, reg: u32, val: u32);

    /// Allocate zeroed device-visible memory.
    fn dma_alloc(&self, len: usize) -> FwResult<DmaRegion> {
        DmaRegion::alloc(len)
    }

    /// Return memory obtained from [`Device::dma_alloc`].
    fn dma_free(&self, region: DmaRegion) {
        drop(region);
    }

    /// Current time.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// True once the device has entered a fatal state.
    ///
    /// Checked before every command and on every wait iteration.
    fn is_fatal(&self) -> bool;

    /// Random 32-bit value (used for mailbox sender tokens).
    fn random_u32(&self) -> u32;

    /// Global function index of this function.
    fn func_id(&self) -> u16;
}

/// Interrupt handler invoked in interrupt context. Must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt primitives supplied by the host environment.
pub trait IrqHost: Send + Sync + 'static {
    /// Attach `handler` to `vector`; the vector starts unmasked.
    fn request_irq(&self, vector: u32, handler: IrqHandler) -> FwResult<()>;

    /// Detach the handler. Returns once no invocation is running.
    fn free_irq(&self, vector: u32);

    /// Suppress delivery on `vector`.
    fn mask(&self, vector: u32);

    /// Resume delivery on `vector`.
    fn unmask(&self, vector: u32);
}
