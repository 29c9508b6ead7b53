// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Event queues.
//!
//! Firmware reports asynchronous events (mailbox traffic, send results) and
//! command completions through rings of fixed-size elements in host memory.
//! Each element carries a phase bit; the producer writes it last, inverted on
//! every lap, so the consumer tells new elements from stale ones without
//! reading a producer index.
//!
//! ```text
//!   interrupt ──► NotArmed ──► worker pass ──► Processing
//!                    ▲                             │
//!                    └──── budget used up ◄────────┤
//!                                                  ▼
//!                         Armed ◄── write CI | ARM (ring empty)
//! ```
//!
//! The interrupt handler only flips the state and wakes the queue's worker
//! thread. The worker drains up to `budget` elements per pass, publishes the
//! consumer index every `ci_step` elements, and dispatches each element
//! through the [`EventRegistry`].

use crate::channel::lock;
use crate::config::{EqConfig, EqKind};
use crate::device::{Device, IrqHost};
use crate::dma::DmaRegion;
use crate::error::{FwError, FwResult};
use crate::registry::EventRegistry;
use crate::regs::{
    eq_page_hi, eq_page_lo, eq_reg, EQ_CI, EQ_CI_ARM, EQ_CI_MASK, EQ_DEPTH, EQ_ELEM_SIZE, EQ_KIND,
    EQ_MAX_PAGES, EQ_PAGE_SIZE, EQ_VECTOR,
};
use crate::wire::{AeqDesc, CeqDesc};
use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

const ARMED: u8 = 0;
const NOT_ARMED: u8 = 1;
const PROCESSING: u8 = 2;

/// Size of an async element's descriptor word.
const AEQ_DESC_LEN: usize = 4;

/// Interrupt state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqState {
    /// Interrupts enabled.
    Armed,
    /// Interrupt taken, drain pending.
    NotArmed,
    /// Worker draining.
    Processing,
}

/// One consumed element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Async {
        event: u8,
        software: bool,
        data: Vec<u8>,
    },
    Completion {
        event: u8,
        data: u32,
    },
}

/// Consumer view of a ring.
pub(crate) struct Ring {
    kind: EqKind,
    depth: u32,
    elem_size: usize,
    per_page: usize,
    pages: Vec<DmaRegion>,
    ci: u32,
    /// Phase bit the next valid element carries.
    phase: bool,
}

impl Ring {
    pub fn alloc<D: Device>(dev: &D, cfg: &EqConfig) -> FwResult<Self> {
        let elem_size = cfg.elem_size as usize;
        let page_size = cfg.page_size as usize;
        let elem_ok = match cfg.kind {
            EqKind::Async => elem_size > AEQ_DESC_LEN && elem_size % 4 == 0,
            EqKind::Completion => elem_size == 4,
        };
        if !elem_ok || cfg.depth == 0 || page_size < elem_size || page_size % elem_size != 0 {
            return Err(FwError::InvalidArgument(format!(
                "event queue geometry: depth={} elem={} page={}",
                cfg.depth, elem_size, page_size
            )));
        }
        let per_page = page_size / elem_size;
        let npages = (cfg.depth as usize).div_ceil(per_page);
        if npages > EQ_MAX_PAGES || cfg.depth > EQ_CI_MASK {
            return Err(FwError::InvalidArgument(format!(
                "event queue of {} elements needs {} pages (max {})",
                cfg.depth, npages, EQ_MAX_PAGES
            )));
        }

        let mut pages = Vec::with_capacity(npages);
        for _ in 0..npages {
            match dev.dma_alloc(page_size) {
                Ok(p) => pages.push(p),
                Err(e) => {
                    for p in pages {
                        dev.dma_free(p);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            kind: cfg.kind,
            depth: cfg.depth,
            elem_size,
            per_page,
            pages,
            ci: 0,
            // Zeroed memory reads as phase 0, so the first lap carries 1
            phase: true,
        })
    }

    fn locate(&self, idx: u32) -> (&DmaRegion, usize) {
        let idx = idx as usize;
        (&self.pages[idx / self.per_page], (idx % self.per_page) * self.elem_size)
    }

    /// Next element, if the producer has written it.
    pub fn peek(&self) -> Option<Event> {
        let (page, off) = self.locate(self.ci);
        match self.kind {
            EqKind::Async => {
                let desc_off = off + self.elem_size - AEQ_DESC_LEN;
                let desc = AeqDesc::from_bits_retain(page.read_u32(desc_off));
                if desc.contains(AeqDesc::PHASE) != self.phase {
                    return None;
                }
                // Body reads must not pass the phase check
                fence(Ordering::Acquire);
                let len = (desc.size() as usize).min(self.elem_size - AEQ_DESC_LEN);
                Some(Event::Async {
                    event: desc.event(),
                    software: desc.contains(AeqDesc::SOFTWARE),
                    data: page.to_vec(off, len),
                })
            }
            EqKind::Completion => {
                let desc = CeqDesc::from_bits_retain(page.read_u32(off));
                if desc.contains(CeqDesc::PHASE) != self.phase {
                    return None;
                }
                fence(Ordering::Acquire);
                Some(Event::Completion {
                    event: desc.event(),
                    data: desc.data(),
                })
            }
        }
    }

    /// Step past the current element. Returns true on wrap.
    pub fn advance(&mut self) -> bool {
        self.ci += 1;
        if self.ci == self.depth {
            self.ci = 0;
            self.phase = !self.phase;
            true
        } else {
            false
        }
    }

    pub fn ci(&self) -> u32 {
        self.ci
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    pub fn release<D: Device>(&mut self, dev: &D) {
        for p in self.pages.drain(..) {
            dev.dma_free(p);
        }
    }
}

struct EqInner<D: Device> {
    dev: Arc<D>,
    cfg: EqConfig,
    ring: Mutex<Ring>,
    state: AtomicU8,
    registry: Arc<EventRegistry>,
    /// Wakes the worker; dropped to stop it.
    kick: Mutex<Option<SyncSender<()>>>,
}

impl<D: Device> EqInner<D> {
    fn ci_reg(&self) -> u32 {
        eq_reg(self.cfg.id, EQ_CI)
    }

    fn on_interrupt(&self) {
        self.state.store(NOT_ARMED, Ordering::SeqCst);
        self.schedule();
    }

    fn schedule(&self) {
        if let Some(tx) = lock(&self.kick).as_ref() {
            // A full channel means a pass is already queued
            let _ = tx.try_send(());
        }
    }

    /// One drain pass. Returns true if elements remain.
    fn process(&self) -> bool {
        self.state.store(PROCESSING, Ordering::SeqCst);
        let mut ring = lock(&self.ring);
        if ring.pages.is_empty() {
            return false;
        }

        let mut done = 0;
        while done < self.cfg.budget {
            let Some(ev) = ring.peek() else {
                break;
            };
            self.dispatch(ev);
            ring.advance();
            done += 1;
            if done % self.cfg.ci_step == 0 {
                self.dev.write32(self.ci_reg(), ring.ci());
            }
        }

        if done == self.cfg.budget && ring.peek().is_some() {
            self.dev.write32(self.ci_reg(), ring.ci());
            self.state.store(NOT_ARMED, Ordering::SeqCst);
            log::trace!("eq{}: budget used, rescheduling", self.cfg.id);
            return true;
        }
        // An interrupt raised by the arm write moves the state on again
        self.state.store(ARMED, Ordering::SeqCst);
        self.dev.write32(self.ci_reg(), ring.ci() | EQ_CI_ARM);
        false
    }

    fn dispatch(&self, ev: Event) {
        match ev {
            Event::Async {
                event,
                software,
                data,
            } => {
                self.registry.dispatch_async(event, software, &data);
            }
            Event::Completion { event, data } => {
                self.registry.dispatch_completion(event, data);
            }
        }
    }
}

/// An event queue with its interrupt and worker thread.
pub struct EventQueue<D: Device> {
    inner: Arc<EqInner<D>>,
    irq: Arc<dyn IrqHost>,
    worker: Option<JoinHandle<()>>,
}

impl<D: Device> EventQueue<D> {
    /// Allocate the ring, publish it to the device and arm it.
    pub fn create(
        dev: Arc<D>,
        irq: Arc<dyn IrqHost>,
        cfg: EqConfig,
        registry: Arc<EventRegistry>,
    ) -> FwResult<Self> {
        if cfg.budget == 0 || cfg.ci_step == 0 {
            return Err(FwError::InvalidArgument("event queue budget must be non-zero".into()));
        }
        let ring = Ring::alloc(&*dev, &cfg)?;

        let q = cfg.id;
        dev.write32(eq_reg(q, EQ_DEPTH), cfg.depth);
        dev.write32(eq_reg(q, EQ_ELEM_SIZE), cfg.elem_size);
        dev.write32(eq_reg(q, EQ_PAGE_SIZE), cfg.page_size);
        dev.write32(eq_reg(q, EQ_VECTOR), cfg.vector);
        dev.write32(eq_reg(q, EQ_KIND), (cfg.kind == EqKind::Completion) as u32);
        for (i, page) in ring.pages.iter().enumerate() {
            dev.write32(eq_page_lo(q, i), page.bus() as u32);
            dev.write32(eq_page_hi(q, i), (page.bus() >> 32) as u32);
        }
        dev.write32(eq_reg(q, EQ_CI), 0);

        let (tx, rx) = sync_channel::<()>(1);
        let inner = Arc::new(EqInner {
            dev,
            cfg,
            ring: Mutex::new(ring),
            state: AtomicU8::new(NOT_ARMED),
            registry,
            kick: Mutex::new(Some(tx)),
        });

        let worker_inner = Arc::clone(&inner);
        let spawned = std::thread::Builder::new()
            .name(format!("fw-eq{}", q))
            .spawn(move || {
                while rx.recv().is_ok() {
                    if worker_inner.process() {
                        worker_inner.schedule();
                    }
                }
            });
        let worker = match spawned {
            Ok(w) => w,
            Err(e) => {
                inner.dev.write32(eq_reg(q, EQ_DEPTH), 0);
                lock(&inner.ring).release(&*inner.dev);
                return Err(e.into());
            }
        };

        let mut eq = Self {
            inner,
            irq,
            worker: Some(worker),
        };

        let weak = Arc::downgrade(&eq.inner);
        eq.irq.request_irq(
            cfg.vector,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_interrupt();
                }
            }),
        )
        .inspect_err(|_| eq.teardown(false))?;

        eq.inner.state.store(ARMED, Ordering::SeqCst);
        eq.inner.dev.write32(eq.inner.ci_reg(), EQ_CI_ARM);
        log::debug!(
            "eq{}: {:?} queue of {}x{}B on vector {}",
            q,
            cfg.kind,
            cfg.depth,
            cfg.elem_size,
            cfg.vector
        );
        Ok(eq)
    }

    pub fn id(&self) -> u16 {
        self.inner.cfg.id
    }

    pub fn kind(&self) -> EqKind {
        self.inner.cfg.kind
    }

    pub fn state(&self) -> EqState {
        match self.inner.state.load(Ordering::SeqCst) {
            ARMED => EqState::Armed,
            PROCESSING => EqState::Processing,
            _ => EqState::NotArmed,
        }
    }

    /// Consumer index and expected phase.
    pub fn consumer(&self) -> (u32, bool) {
        let ring = lock(&self.inner.ring);
        (ring.ci(), ring.phase())
    }

    /// Free the interrupt, stop the worker and release the ring.
    pub fn destroy(mut self) {
        self.teardown(true);
    }

    fn teardown(&mut self, irq_requested: bool) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if irq_requested {
            self.irq.free_irq(self.inner.cfg.vector);
        }
        lock(&self.inner.kick).take();
        if worker.join().is_err() {
            log::error!("eq{}: worker panicked", self.inner.cfg.id);
        }
        let dev = &self.inner.dev;
        // Disable the queue before its pages go back
        dev.write32(eq_reg(self.inner.cfg.id, EQ_DEPTH), 0);
        lock(&self.inner.ring).release(&**dev);
        log::debug!("eq{}: destroyed", self.inner.cfg.id);
    }
}

impl<D: Device> Drop for EventQueue<D> {
    fn drop(&mut self) {
        self.teardown(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn write_ceq(ring: &Ring, idx: u32, data: u32, phase: bool) {
        let (page, off) = ring.locate(idx);
        page.write_u32(off, CeqDesc::new(0, data, phase).bits());
    }

    #[test]
    fn test_ring_wrap_flips_phase_once() {
        let dev = SimDevice::new(0);
        let depth = 4;
        let cfg = EqConfig::ceq(0, 0).with_depth(depth);
        let mut ring = Ring::alloc(&*dev, &cfg).unwrap();

        // Nothing produced yet: zeroed memory is not an element
        assert_eq!(ring.peek(), None);

        let mut flips = 0;
        for i in 0..=depth {
            let lap_phase = i < depth;
            write_ceq(&ring, i % depth, i, lap_phase);
            assert_eq!(
                ring.peek(),
                Some(Event::Completion { event: 0, data: i })
            );
            let ci_before = ring.ci();
            if ring.advance() {
                flips += 1;
                assert_eq!(ci_before, depth - 1);
                assert_eq!(ring.ci(), 0);
            }
        }
        assert_eq!(flips, 1);
        assert!(!ring.phase());

        // Producer lagging: slot 1 still holds the first lap's element
        assert_eq!(ring.peek(), None);
        ring.release(&*dev);
        assert_eq!(dev.live_dma(), 0);
    }

    #[test]
    fn test_bad_geometry() {
        let dev = SimDevice::new(0);
        let cfg = EqConfig::ceq(0, 0).with_depth(0);
        assert!(Ring::alloc(&*dev, &cfg).is_err());
        // 64-byte elements in a 4 KiB page: 64 per page, 8 pages max
        let cfg = EqConfig::aeq(0, 0).with_depth(64 * 8 + 1);
        assert!(Ring::alloc(&*dev, &cfg).is_err());
        let cfg = EqConfig::aeq(0, 0).with_depth(64 * 8);
        let mut ring = Ring::alloc(&*dev, &cfg).unwrap();
        assert_eq!(dev.live_dma(), 8);
        ring.release(&*dev);
    }

    fn completion_queue(
        dev: &Arc<SimDevice>,
        cfg: EqConfig,
    ) -> (EventQueue<SimDevice>, mpsc::Receiver<u32>) {
        let registry = Arc::new(EventRegistry::new());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        registry
            .register_completion_event(
                0,
                Arc::new(move |d: &[u8]| {
                    let _ = lock(&tx).send(u32::from_le_bytes([d[0], d[1], d[2], d[3]]));
                }),
            )
            .unwrap();
        let eq = EventQueue::create(Arc::clone(dev), dev.clone(), cfg, registry).unwrap();
        (eq, rx)
    }

    #[test]
    fn test_interrupt_drain_and_rearm() {
        let dev = SimDevice::new(0);
        let (eq, rx) = completion_queue(&dev, EqConfig::ceq(1, 3).with_depth(16));
        assert_eq!(eq.state(), EqState::Armed);

        for i in 0..20u32 {
            assert!(dev.push_ceq(1, 0, i));
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
        }
        // 20 elements in a 16-deep ring: wrapped once
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while eq.state() != EqState::Armed && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(eq.consumer(), (4, false));
        assert_eq!(eq.state(), EqState::Armed);
        eq.destroy();
        assert_eq!(dev.live_dma(), 0);
    }

    #[test]
    fn test_destroy_disables_queue_before_freeing_pages() {
        let dev = SimDevice::new(0);
        let (eq, rx) = completion_queue(&dev, EqConfig::ceq(4, 6).with_depth(16));
        dev.push_ceq(4, 0, 11);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 11);

        eq.destroy();
        assert_eq!(dev.reg(eq_reg(4, EQ_DEPTH)), 0);
        assert_eq!(dev.freed_in_use(), 0);
        assert_eq!(dev.live_dma(), 0);
    }

    #[test]
    fn test_budget_reschedules() {
        let dev = SimDevice::new(0);
        let cfg = EqConfig::ceq(2, 5).with_depth(32).with_budget(2, 1);
        let (eq, rx) = completion_queue(&dev, cfg);

        // Hold the interrupt while the backlog builds up
        dev.mask(5);
        for i in 0..7u32 {
            dev.push_ceq(2, 0, i);
        }
        dev.unmask(5);
        let got: Vec<u32> = (0..7)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, (0..7).collect::<Vec<_>>());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dev.reg(eq_reg(2, EQ_CI)) != (7 | EQ_CI_ARM) && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(dev.reg(eq_reg(2, EQ_CI)), 7 | EQ_CI_ARM);
        drop(eq);
    }

    #[test]
    fn test_async_dispatch_by_type() {
        let dev = SimDevice::new(0);
        let registry = Arc::new(EventRegistry::new());
        let hw = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let tx = Mutex::new(tx);
        let h = Arc::clone(&hw);
        registry
            .register_hw_event(3, Arc::new(move |d: &[u8]| {
                h.fetch_add(1, Ordering::SeqCst);
                let _ = lock(&tx).send(d.to_vec());
            }))
            .unwrap();
        let (stx, srx) = mpsc::channel::<u8>();
        let stx = Mutex::new(stx);
        registry
            .register_sw_event(3, Arc::new(move |d: &[u8]| {
                let _ = lock(&stx).send(d[0]);
            }))
            .unwrap();

        let eq = EventQueue::create(
            Arc::clone(&dev),
            dev.clone(),
            EqConfig::aeq(0, 9),
            Arc::clone(&registry),
        )
        .unwrap();

        dev.push_aeq(0, 3, false, b"hello");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hello".to_vec());
        dev.push_aeq(0, 3, true, &[42]);
        assert_eq!(srx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(hw.load(Ordering::SeqCst), 1);

        eq.destroy();
        // Vector is free again
        assert!(dev.request_irq(9, Arc::new(|| {})).is_ok());
    }
}
