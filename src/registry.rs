// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Callback tables with a register/invoke/unregister state machine.
//!
//! Every slot moves through
//!
//! ```text
//! Idle -> Registered -> Invoking -> Registered -> Unregistering -> Idle
//! ```
//!
//! The state lives in one atomic so the dispatch path never takes a mutex.
//! `unregister` waits until a running invocation has finished, so the caller
//! may free whatever the callback touches as soon as it returns.

use crate::error::{FwError, FwResult};
use spin::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const REGISTERED: u8 = 1;
const INVOKING: u8 = 2;
const UNREGISTERING: u8 = 3;

/// Observable state of a callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Registered,
    Invoking,
    Unregistering,
}

impl SlotState {
    fn from_raw(v: u8) -> Self {
        match v {
            REGISTERED => Self::Registered,
            INVOKING => Self::Invoking,
            UNREGISTERING => Self::Unregistering,
            _ => Self::Idle,
        }
    }
}

struct Slot<T: ?Sized> {
    state: AtomicU8,
    payload: RwLock<Option<Arc<T>>>,
}

/// Fixed-size table of callbacks indexed by event or module id.
pub struct CallbackTable<T: ?Sized> {
    slots: Vec<Slot<T>>,
}

impl<T: ?Sized> CallbackTable<T> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len)
                .map(|_| Slot {
                    state: AtomicU8::new(IDLE),
                    payload: RwLock::new(None),
                })
                .collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: usize) -> FwResult<&Slot<T>> {
        self.slots.get(id).ok_or_else(|| {
            FwError::InvalidArgument(format!("callback id {} out of range ({})", id, self.slots.len()))
        })
    }

    pub fn state(&self, id: usize) -> SlotState {
        self.slots
            .get(id)
            .map_or(SlotState::Idle, |s| SlotState::from_raw(s.state.load(Ordering::Acquire)))
    }

    /// Install `cb` in an idle slot.
    pub fn register(&self, id: usize, cb: Arc<T>) -> FwResult<()> {
        let slot = self.slot(id)?;
        let mut payload = slot.payload.write();
        if slot.state.load(Ordering::Acquire) != IDLE || payload.is_some() {
            return Err(FwError::AlreadyRegistered(id));
        }
        *payload = Some(cb);
        slot.state.store(REGISTERED, Ordering::Release);
        Ok(())
    }

    /// Remove the callback, waiting out a running invocation.
    ///
    /// Returns false if nothing was registered.
    pub fn unregister(&self, id: usize) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        loop {
            match slot.state.compare_exchange(
                REGISTERED,
                UNREGISTERING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(INVOKING) => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
        slot.payload.write().take();
        slot.state.store(IDLE, Ordering::Release);
        true
    }

    /// Run `f` with the callback in slot `id`.
    ///
    /// Returns `None` when the slot is not registered. Invocations of one
    /// slot are serialized.
    pub fn invoke<R>(&self, id: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.slots.get(id)?;
        loop {
            match slot.state.compare_exchange(
                REGISTERED,
                INVOKING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(INVOKING) => std::hint::spin_loop(),
                Err(_) => return None,
            }
        }
        let _done = scopeguard::guard((), |_| slot.state.store(REGISTERED, Ordering::Release));
        let cb = slot.payload.read().clone()?;
        Some(f(&cb))
    }
}

/// Event callback; receives the element payload.
pub type EventFn = dyn Fn(&[u8]) + Send + Sync;

/// Hardware and software async event types (7-bit type field).
pub const MAX_AEQ_EVENTS: usize = 128;
/// Completion event types (3-bit type field).
pub const MAX_CEQ_EVENTS: usize = 8;

/// Callback tables for both event queue kinds.
pub struct EventRegistry {
    hw: CallbackTable<EventFn>,
    sw: CallbackTable<EventFn>,
    completion: CallbackTable<EventFn>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            hw: CallbackTable::new(MAX_AEQ_EVENTS),
            sw: CallbackTable::new(MAX_AEQ_EVENTS),
            completion: CallbackTable::new(MAX_CEQ_EVENTS),
        }
    }

    pub fn register_hw_event(&self, event: u8, cb: Arc<EventFn>) -> FwResult<()> {
        self.hw.register(event as usize, cb)
    }

    pub fn unregister_hw_event(&self, event: u8) -> bool {
        self.hw.unregister(event as usize)
    }

    pub fn register_sw_event(&self, event: u8, cb: Arc<EventFn>) -> FwResult<()> {
        self.sw.register(event as usize, cb)
    }

    pub fn unregister_sw_event(&self, event: u8) -> bool {
        self.sw.unregister(event as usize)
    }

    pub fn register_completion_event(&self, event: u8, cb: Arc<EventFn>) -> FwResult<()> {
        self.completion.register(event as usize, cb)
    }

    pub fn unregister_completion_event(&self, event: u8) -> bool {
        self.completion.unregister(event as usize)
    }

    /// Deliver an async event. Returns false if nobody handled it.
    pub(crate) fn dispatch_async(&self, event: u8, software: bool, data: &[u8]) -> bool {
        let table = if software { &self.sw } else { &self.hw };
        let handled = table.invoke(event as usize, |cb| cb(data)).is_some();
        if !handled {
            log::warn!(
                "unhandled {} async event {:#x}",
                if software { "software" } else { "hardware" },
                event
            );
        }
        handled
    }

    /// Deliver a completion event. Returns false if nobody handled it.
    pub(crate) fn dispatch_completion(&self, event: u8, data: u32) -> bool {
        let handled = self
            .completion
            .invoke(event as usize, |cb| cb(&data.to_le_bytes()))
            .is_some();
        if !handled {
            log::warn!("unhandled completion event {:#x}", event);
        }
        handled
    }
}
