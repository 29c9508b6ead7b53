// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # Host-to-firmware command and mailbox transport
//!
//! This crate implements the host side of the control path between a driver
//! and a NIC's management firmware:
//!
//! - **Command channel**: request contexts backed by DMA slabs, a generation
//!   checked handle per request, and synchronous send with backoff, timeout
//!   and firmware error mapping ([`FwChannel`])
//! - **Event queues**: async and completion queues with phase-bit ownership,
//!   budgeted draining and re-arming ([`EventQueue`])
//! - **Callback registry**: register/invoke/unregister state machine that
//!   lets teardown wait for running callbacks ([`EventRegistry`])
//! - **Mailbox**: 48-byte segmented messages between PFs and VFs with
//!   reassembly, response matching and VF token checks ([`Mailbox`])
//!
//! Hardware access goes through the [`Device`] and [`IrqHost`] traits. The
//! [`sim`] module provides a software device used by the tests, benches and
//! demos.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fwcmd_rust::sim::{FwReply, FwRequest, SimDevice};
//! use fwcmd_rust::{FwResult, ReqType, Session, SessionConfig};
//!
//! fn main() -> FwResult<()> {
//!     let dev = SimDevice::new(0);
//!     dev.set_firmware(|_: &FwRequest| FwReply::ok(b"1.2.3".to_vec()));
//!
//!     let session = Session::open(dev.clone(), dev, SessionConfig::default())?;
//!     let ch = session.channel();
//!
//!     let req = ch.req_init(ReqType::VER_GET, 24)?;
//!     ch.req_hold(&req)?;
//!     ch.send(req)?;
//!     println!("firmware {:?}", ch.resp(&req)?.body);
//!     ch.req_drop(req)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Every public type is `Send + Sync`. Commands may be sent from any number
//! of threads; each event queue drains on its own worker thread and the
//! mailbox runs request handlers on a separate worker.

// Module declarations
pub mod backoff;
pub mod channel;
pub mod config;
pub mod ctx;
pub mod device;
pub mod dma;
pub mod engine;
pub mod eq;
pub mod error;
pub mod mbox;
#[cfg(feature = "async")]
pub mod nonblocking;
pub mod registry;
pub mod regs;
pub mod reqtype;
pub mod sim;
pub mod slab;
pub mod wire;

// Re-exports for convenient access
pub use backoff::Backoff;
pub use channel::FwChannel;
pub use config::{
    AckMode, ChannelConfig, EqConfig, EqKind, FuncConfig, FuncRole, MboxConfig, SessionConfig,
};
pub use ctx::{AllocFlags, CtxFlags, DmaSpan, FwResponse, ReqHandle};
pub use device::{Device, IrqHandler, IrqHost};
pub use dma::DmaRegion;
pub use engine::Session;
pub use eq::{EqState, EventQueue};
pub use error::{FwError, FwResult};
pub use mbox::{Mailbox, MboxHandler, MboxReply, MboxRequest, MboxRole, RandomIdSync};
pub use registry::{CallbackTable, EventFn, EventRegistry, SlotState};
pub use reqtype::{Channel, ReqType};
