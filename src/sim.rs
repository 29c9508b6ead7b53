// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of a device function.
//!
//! [`SimDevice`] implements [`Device`] and [`IrqHost`] on top of a register
//! file and host memory. It answers commands rung on the doorbell with a
//! programmable firmware, produces event queue elements honouring the ring
//! geometry, phase bit and arming, and forwards mailbox segments to other
//! functions attached to the same [`SimFabric`].
//!
//! Bus addresses are host addresses. The model only touches memory that was
//! allocated through [`Device::dma_alloc`] and not yet freed.

use crate::channel::lock;
use crate::device::{Device, IrqHandler, IrqHost};
use crate::dma::DmaRegion;
use crate::error::{FwError, FwResult};
use crate::regs::{
    cmd_doorbell, cmd_window, eq_page_hi, eq_page_lo, eq_reg, CMD_WINDOW_LEN, EQ_CI, EQ_CI_ARM,
    EQ_CI_MASK, EQ_DEPTH, EQ_ELEM_SIZE, EQ_MAX_PAGES, EQ_PAGE_SIZE, EQ_VECTOR, MBOX_ATTR, MBOX_ATTR_DST_MASK,
    MBOX_ATTR_DWORDS_MASK, MBOX_ATTR_DWORDS_SHIFT, MBOX_ATTR_EVENT_ACK, MBOX_DATA, MBOX_TRIGGER,
    MBOX_WB_HI, MBOX_WB_LO,
};
use crate::reqtype::{Channel, ReqType};
use crate::slab::RESP_SIZE;
use crate::wire::{
    aeq_event, ceq_event, cmd_done_data, mbox_wb, AeqDesc, CeqDesc, ReqHeader, RespHeader,
    ShortCmd, MBOX_TOKEN_OFF, NO_CMPL_RING, REQ_HEADER_LEN, RESP_HEADER_LEN, RESP_VALID_KEY,
};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Register block of all event queues.
const EQ_REGS: std::ops::Range<u32> = eq_reg(0, 0)..MBOX_DATA;
const EQ_STRIDE: u32 = eq_reg(1, 0) - eq_reg(0, 0);

/// Commands kept for inspection.
const COMMAND_LOG_LEN: usize = 256;

/// A command as the firmware saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwRequest {
    pub channel: Channel,
    /// Arrived through a short descriptor.
    pub short: bool,
    pub header: ReqHeader,
    /// Full request bytes, header included.
    pub payload: Vec<u8>,
}

impl FwRequest {
    pub fn req_type(&self) -> ReqType {
        ReqType(self.header.req_type)
    }

    /// Request bytes after the header.
    pub fn body(&self) -> &[u8] {
        self.payload.get(REQ_HEADER_LEN..).unwrap_or(&[])
    }
}

/// How the firmware finishes a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Header, body, then the valid byte.
    Complete,
    /// Header and body, but the valid byte never arrives.
    NoValid,
    /// Nothing is written.
    Hang,
}

/// Firmware answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwReply {
    pub error_code: u16,
    pub body: Vec<u8>,
    pub delay: Duration,
    pub mode: CompletionMode,
}

impl FwReply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            error_code: 0,
            body: body.into(),
            delay: Duration::ZERO,
            mode: CompletionMode::Complete,
        }
    }

    pub fn error(code: u16) -> Self {
        Self {
            error_code: code,
            ..Self::ok(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Programmable firmware behaviour.
pub type FwBehavior = dyn Fn(&FwRequest) -> FwReply + Send + Sync;

struct IrqSlot {
    handler: IrqHandler,
    masked: bool,
    pending: bool,
}

/// Producer side of one event queue.
struct SimEq {
    prod: u32,
    phase: bool,
    armed: bool,
}

impl SimEq {
    fn new() -> Self {
        Self {
            prod: 0,
            phase: true,
            armed: false,
        }
    }
}

#[derive(Default)]
struct DmaMap {
    live: HashMap<u64, usize>,
    /// Fail this many upcoming allocations.
    fail: usize,
    /// Frees of pages an enabled event queue still pointed at.
    freed_in_use: usize,
}

impl DmaMap {
    fn covers(&self, bus: u64, len: usize) -> bool {
        self.live.iter().any(|(&base, &size)| {
            bus >= base && (bus - base).checked_add(len as u64).is_some_and(|e| e <= size as u64)
        })
    }
}

/// Simulated device function.
pub struct SimDevice {
    me: Weak<SimDevice>,
    func_id: u16,
    regs: Mutex<HashMap<u32, u32>>,
    dma: Mutex<DmaMap>,
    fatal: AtomicBool,
    rng: Mutex<u32>,
    firmware: Mutex<Option<Arc<FwBehavior>>>,
    irqs: Mutex<HashMap<u32, IrqSlot>>,
    eqs: Mutex<HashMap<u16, SimEq>>,
    fabric: Mutex<Weak<SimFabric>>,
    commands: Mutex<Vec<FwRequest>>,
    published: Mutex<Vec<(u16, u32)>>,
    doorbells: AtomicUsize,
}

impl SimDevice {
    pub fn new(func_id: u16) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            func_id,
            regs: Mutex::new(HashMap::new()),
            dma: Mutex::new(DmaMap::default()),
            fatal: AtomicBool::new(false),
            rng: Mutex::new(0x9e37_79b9 ^ (func_id as u32).wrapping_mul(0x85eb_ca6b)),
            firmware: Mutex::new(None),
            irqs: Mutex::new(HashMap::new()),
            eqs: Mutex::new(HashMap::new()),
            fabric: Mutex::new(Weak::new()),
            commands: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            doorbells: AtomicUsize::new(0),
        })
    }

    /// Install the firmware answering commands.
    pub fn set_firmware<F>(&self, f: F)
    where
        F: Fn(&FwRequest) -> FwReply + Send + Sync + 'static,
    {
        *lock(&self.firmware) = Some(Arc::new(f));
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    /// Make the next `n` DMA allocations fail.
    pub fn fail_dma_allocs(&self, n: usize) {
        lock(&self.dma).fail = n;
    }

    /// DMA regions allocated and not yet freed.
    pub fn live_dma(&self) -> usize {
        lock(&self.dma).live.len()
    }

    /// Ring pages freed while their queue was still enabled.
    pub fn freed_in_use(&self) -> usize {
        lock(&self.dma).freed_in_use
    }

    /// Most recent commands, oldest first.
    pub fn commands(&self) -> Vec<FwRequest> {
        lock(&self.commands).clone()
    }

    /// Number of doorbell writes.
    pub fn doorbells(&self) -> usize {
        self.doorbells.load(Ordering::SeqCst)
    }

    /// Random ids published through the firmware, in order.
    pub fn published_random_ids(&self) -> Vec<(u16, u32)> {
        lock(&self.published).clone()
    }

    /// Interrupt vectors with a handler attached.
    pub fn irqs_requested(&self) -> usize {
        lock(&self.irqs).len()
    }

    /// True if an enabled event queue lists `bus` as one of its pages.
    fn eq_page_enabled(&self, bus: u64) -> bool {
        let regs = lock(&self.regs);
        let reg = |r: u32| regs.get(&r).copied().unwrap_or(0);
        regs.iter()
            .filter(|&(&r, &v)| {
                v != 0 && EQ_REGS.contains(&r) && (r - EQ_REGS.start) % EQ_STRIDE == EQ_DEPTH
            })
            .map(|(&r, _)| ((r - EQ_REGS.start) / EQ_STRIDE) as u16)
            .any(|q| {
                (0..EQ_MAX_PAGES).any(|i| {
                    let addr = reg(eq_page_lo(q, i)) as u64 | (reg(eq_page_hi(q, i)) as u64) << 32;
                    addr == bus
                })
            })
    }

    /// Raw register value.
    pub fn reg(&self, reg: u32) -> u32 {
        lock(&self.regs).get(&reg).copied().unwrap_or(0)
    }

    fn dma_read(&self, bus: u64, len: usize) -> Option<Vec<u8>> {
        let map = lock(&self.dma);
        if !map.covers(bus, len) {
            log::warn!("sim: DMA read outside mapped memory at {:#x}+{}", bus, len);
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: the range lies in a live allocation; the map lock keeps it
        // from being freed during the copy.
        unsafe { std::ptr::copy_nonoverlapping(bus as *const u8, out.as_mut_ptr(), len) };
        Some(out)
    }

    fn dma_write(&self, bus: u64, data: &[u8]) -> bool {
        let map = lock(&self.dma);
        if !map.covers(bus, data.len()) {
            log::warn!("sim: DMA write outside mapped memory at {:#x}+{}", bus, data.len());
            return false;
        }
        for (i, &b) in data.iter().enumerate() {
            // SAFETY: as in `dma_read`; byte-wise volatile stores model the
            // device writing behind the host's back.
            unsafe { std::ptr::write_volatile((bus as *mut u8).add(i), b) };
        }
        true
    }

    // ------------------------------------------------------------------
    // Command channel
    // ------------------------------------------------------------------

    fn on_doorbell(&self, ch: Channel) {
        self.doorbells.fetch_add(1, Ordering::SeqCst);
        let window: Vec<u8> = (0..CMD_WINDOW_LEN as u32 / 4)
            .flat_map(|i| self.reg(cmd_window(ch) + i * 4).to_le_bytes())
            .collect();

        let (short, payload) = match ShortCmd::from_bytes(&window) {
            Some(sc) => match self.dma_read(sc.req_addr, sc.size as usize) {
                Some(p) => (true, p),
                None => return,
            },
            None => (false, window),
        };
        let Some(header) = ReqHeader::from_bytes(&payload) else {
            log::warn!("sim: truncated request");
            return;
        };
        let req = FwRequest {
            channel: ch,
            short,
            header,
            payload,
        };

        let reply = if req.req_type() == ReqType::FUNC_MBOX_RANDOM_ID {
            self.on_random_id(&req)
        } else {
            let fw = lock(&self.firmware).clone();
            match fw {
                Some(fw) => fw(&req),
                None => FwReply::ok(Vec::new()),
            }
        };
        {
            let mut cmds = lock(&self.commands);
            if cmds.len() == COMMAND_LOG_LEN {
                cmds.remove(0);
            }
            cmds.push(req);
        }

        if reply.mode == CompletionMode::Hang {
            return;
        }
        if reply.delay.is_zero() {
            self.respond(ch, &header, &reply);
        } else if let Some(me) = self.me.upgrade() {
            std::thread::spawn(move || {
                std::thread::sleep(reply.delay);
                me.respond(ch, &header, &reply);
            });
        }
    }

    fn respond(&self, ch: Channel, hdr: &ReqHeader, reply: &FwReply) {
        let max_body = RESP_SIZE - RESP_HEADER_LEN - 1;
        let body = &reply.body[..reply.body.len().min(max_body)];
        let resp_len = RESP_HEADER_LEN + body.len() + 1;
        let rh = RespHeader {
            error_code: reply.error_code,
            req_type: hdr.req_type,
            seq_id: hdr.seq_id,
            resp_len: resp_len as u16,
        };
        self.dma_write(hdr.resp_addr + RESP_HEADER_LEN as u64, body);
        self.dma_write(hdr.resp_addr, &rh.to_bytes());
        fence(Ordering::Release);
        if reply.mode == CompletionMode::Complete {
            self.dma_write(hdr.resp_addr + resp_len as u64 - 1, &[RESP_VALID_KEY]);
        }
        if hdr.cmpl_ring != NO_CMPL_RING {
            self.push_ceq(hdr.cmpl_ring, ceq_event::CMD_DONE, cmd_done_data(ch as u8, hdr.seq_id));
        }
    }

    fn on_random_id(&self, req: &FwRequest) -> FwReply {
        let b = req.body();
        if b.len() < 8 {
            return FwReply::error(crate::wire::fw_err::INVALID_PARAMS);
        }
        let func = u16::from_le_bytes([b[0], b[1]]);
        let id = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
        lock(&self.published).push((func, id));
        if let Some(fabric) = lock(&self.fabric).upgrade() {
            fabric.set_random_id(func, id);
        }
        FwReply::ok(Vec::new())
    }

    // ------------------------------------------------------------------
    // Event queues
    // ------------------------------------------------------------------

    /// Produce an async event on queue `q`.
    pub fn push_aeq(&self, q: u16, event: u8, software: bool, data: &[u8]) -> bool {
        self.produce(q, |elem_size, phase| {
            let mut e = vec![0u8; elem_size];
            let n = data.len().min(elem_size - 4).min(u8::MAX as usize);
            e[..n].copy_from_slice(&data[..n]);
            let desc = AeqDesc::new(event, software, n as u8, phase);
            e[elem_size - 4..].copy_from_slice(&desc.bits().to_le_bytes());
            e
        })
    }

    /// Produce a completion event on queue `q`.
    pub fn push_ceq(&self, q: u16, event: u8, data: u32) -> bool {
        self.produce(q, |_, phase| CeqDesc::new(event, data, phase).bits().to_le_bytes().to_vec())
    }

    fn produce(&self, q: u16, build: impl FnOnce(usize, bool) -> Vec<u8>) -> bool {
        let depth = self.reg(eq_reg(q, EQ_DEPTH));
        let elem_size = self.reg(eq_reg(q, EQ_ELEM_SIZE)) as usize;
        let page_size = self.reg(eq_reg(q, EQ_PAGE_SIZE)) as usize;
        if depth == 0 || elem_size < 4 || page_size < elem_size {
            log::warn!("sim: event for unconfigured queue {}", q);
            return false;
        }

        let raise = {
            let mut eqs = lock(&self.eqs);
            let st = eqs.entry(q).or_insert_with(SimEq::new);
            let per_page = page_size / elem_size;
            let idx = st.prod as usize;
            let page = idx / per_page;
            let base = (self.reg(eq_page_hi(q, page)) as u64) << 32 | self.reg(eq_page_lo(q, page)) as u64;
            let addr = base + ((idx % per_page) * elem_size) as u64;

            let elem = build(elem_size, st.phase);
            let desc_off = elem_size - 4;
            // Body first; the descriptor carrying the phase bit goes last
            if !self.dma_write(addr, &elem[..desc_off]) {
                return false;
            }
            fence(Ordering::Release);
            self.dma_write(addr + desc_off as u64, &elem[desc_off..]);

            st.prod += 1;
            if st.prod == depth {
                st.prod = 0;
                st.phase = !st.phase;
            }
            std::mem::take(&mut st.armed)
        };
        if raise {
            self.raise(self.reg(eq_reg(q, EQ_VECTOR)));
        }
        true
    }

    fn on_eq_ci(&self, q: u16, val: u32) {
        if val & EQ_CI_ARM == 0 {
            return;
        }
        let raise = {
            let mut eqs = lock(&self.eqs);
            let st = eqs.entry(q).or_insert_with(SimEq::new);
            let pending = val & EQ_CI_MASK != st.prod;
            st.armed = !pending;
            pending
        };
        if raise {
            self.raise(self.reg(eq_reg(q, EQ_VECTOR)));
        }
    }

    /// Fire interrupt `vector` (deferred while masked).
    pub fn raise(&self, vector: u32) {
        let handler = {
            let mut irqs = lock(&self.irqs);
            match irqs.get_mut(&vector) {
                Some(slot) if slot.masked => {
                    slot.pending = true;
                    None
                }
                Some(slot) => Some(Arc::clone(&slot.handler)),
                None => None,
            }
        };
        if let Some(h) = handler {
            h();
        }
    }

    // ------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------

    fn on_mbox_trigger(&self) {
        let attr = self.reg(MBOX_ATTR);
        let dst = (attr & MBOX_ATTR_DST_MASK) as u16;
        let dwords = (attr >> MBOX_ATTR_DWORDS_SHIFT) & MBOX_ATTR_DWORDS_MASK;
        let data: Vec<u8> = (0..dwords)
            .flat_map(|i| self.reg(MBOX_DATA + i * 4).to_le_bytes())
            .collect();

        let fabric = lock(&self.fabric).upgrade();
        let err = match &fabric {
            Some(f) => f.deliver(self.func_id, dst, &data),
            None => 1,
        };

        let status = mbox_wb::finished(err);
        let wb = (self.reg(MBOX_WB_HI) as u64) << 32 | self.reg(MBOX_WB_LO) as u64;
        if wb != 0 {
            self.dma_write(wb + 4, &mbox_wb::checksum(status).to_le_bytes());
            fence(Ordering::Release);
            self.dma_write(wb, &status.to_le_bytes());
        }
        if attr & MBOX_ATTR_EVENT_ACK != 0 {
            let aeq = fabric.map_or(0, |f| f.aeq);
            self.push_aeq(aeq, aeq_event::MBOX_SEND_RESULT, false, &status.to_le_bytes());
        }
    }
}

impl Device for SimDevice {
    fn read32(&self, reg: u32) -> u32 {
        self.reg(reg)
    }

    fn write32(&self, reg: u32, val: u32) {
        lock(&self.regs).insert(reg, val);

        if reg == cmd_doorbell(Channel::Primary) {
            self.on_doorbell(Channel::Primary);
        } else if reg == cmd_doorbell(Channel::Secondary) {
            self.on_doorbell(Channel::Secondary);
        } else if reg == MBOX_TRIGGER {
            self.on_mbox_trigger();
        } else if EQ_REGS.contains(&reg) {
            let q = ((reg - EQ_REGS.start) / EQ_STRIDE) as u16;
            match (reg - EQ_REGS.start) % EQ_STRIDE {
                EQ_CI => self.on_eq_ci(q, val),
                // Geometry rewrite resets the producer
                EQ_DEPTH => {
                    lock(&self.eqs).insert(q, SimEq::new());
                }
                _ => {}
            }
        }
    }

    fn dma_alloc(&self, len: usize) -> FwResult<DmaRegion> {
        let mut map = lock(&self.dma);
        if map.fail > 0 {
            map.fail -= 1;
            return Err(FwError::NoMemory(len));
        }
        let region = DmaRegion::alloc(len)?;
        map.live.insert(region.bus(), region.len());
        Ok(region)
    }

    fn dma_free(&self, region: DmaRegion) {
        let in_use = self.eq_page_enabled(region.bus());
        let mut map = lock(&self.dma);
        if in_use {
            log::warn!("sim: freeing page {:#x} of an enabled event queue", region.bus());
            map.freed_in_use += 1;
        }
        if map.live.remove(&region.bus()).is_none() {
            log::warn!("sim: freeing untracked DMA region {:?}", region);
        }
        drop(region);
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    fn random_u32(&self) -> u32 {
        // xorshift32
        let mut s = lock(&self.rng);
        let mut x = *s;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *s = x;
        x
    }

    fn func_id(&self) -> u16 {
        self.func_id
    }
}

impl IrqHost for SimDevice {
    fn request_irq(&self, vector: u32, handler: IrqHandler) -> FwResult<()> {
        let mut irqs = lock(&self.irqs);
        if irqs.contains_key(&vector) {
            return Err(FwError::InvalidArgument(format!("vector {} in use", vector)));
        }
        irqs.insert(
            vector,
            IrqSlot {
                handler,
                masked: false,
                pending: false,
            },
        );
        Ok(())
    }

    fn free_irq(&self, vector: u32) {
        lock(&self.irqs).remove(&vector);
    }

    fn mask(&self, vector: u32) {
        if let Some(slot) = lock(&self.irqs).get_mut(&vector) {
            slot.masked = true;
        }
    }

    fn unmask(&self, vector: u32) {
        let fire = match lock(&self.irqs).get_mut(&vector) {
            Some(slot) => {
                slot.masked = false;
                std::mem::take(&mut slot.pending)
            }
            None => false,
        };
        if fire {
            self.raise(vector);
        }
    }
}

/// Interconnect carrying mailbox segments between simulated functions.
pub struct SimFabric {
    /// Async event queue mailbox events are delivered to.
    aeq: u16,
    funcs: Mutex<HashMap<u16, Weak<SimDevice>>>,
    random_ids: Mutex<HashMap<u16, u32>>,
    spoofed: Mutex<HashMap<u16, u32>>,
    delivered: AtomicUsize,
}

impl SimFabric {
    pub fn new() -> Arc<Self> {
        Self::with_aeq(0)
    }

    pub fn with_aeq(aeq: u16) -> Arc<Self> {
        Arc::new(Self {
            aeq,
            funcs: Mutex::new(HashMap::new()),
            random_ids: Mutex::new(HashMap::new()),
            spoofed: Mutex::new(HashMap::new()),
            delivered: AtomicUsize::new(0),
        })
    }

    pub fn attach(self: &Arc<Self>, dev: &Arc<SimDevice>) {
        lock(&self.funcs).insert(dev.func_id, Arc::downgrade(dev));
        *lock(&dev.fabric) = Arc::downgrade(self);
    }

    /// Token stamped on segments sent by `func`.
    pub fn set_random_id(&self, func: u16, id: u32) {
        lock(&self.random_ids).insert(func, id);
    }

    pub fn random_id(&self, func: u16) -> Option<u32> {
        lock(&self.random_ids).get(&func).copied()
    }

    /// Stamp `token` on `func`'s segments instead of its random id.
    pub fn spoof_token(&self, func: u16, token: Option<u32>) {
        let mut spoofed = lock(&self.spoofed);
        match token {
            Some(t) => spoofed.insert(func, t),
            None => spoofed.remove(&func),
        };
    }

    /// Segments delivered so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Hand one segment to `dst`; returns the write-back error code.
    fn deliver(&self, src: u16, dst: u16, data: &[u8]) -> u16 {
        let Some(dev) = lock(&self.funcs).get(&dst).and_then(Weak::upgrade) else {
            log::warn!("sim: mailbox destination {} not attached", dst);
            return 1;
        };
        let token = lock(&self.spoofed)
            .get(&src)
            .copied()
            .or_else(|| self.random_id(src))
            .unwrap_or(0);

        let mut elem = [0u8; MBOX_TOKEN_OFF + 4];
        let n = data.len().min(MBOX_TOKEN_OFF);
        elem[..n].copy_from_slice(&data[..n]);
        elem[MBOX_TOKEN_OFF..].copy_from_slice(&token.to_le_bytes());

        if dev.push_aeq(self.aeq, aeq_event::MBOX_FROM_FUNC, false, &elem) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_tracking() {
        let dev = SimDevice::new(0);
        let r = dev.dma_alloc(100).unwrap();
        assert_eq!(dev.live_dma(), 1);
        assert!(dev.dma_write(r.bus() + 96, &[1, 2, 3, 4]));
        assert!(!dev.dma_write(r.bus() + 98, &[1, 2, 3, 4]));
        assert_eq!(dev.dma_read(r.bus() + 96, 4), Some(vec![1, 2, 3, 4]));
        dev.dma_free(r);
        assert_eq!(dev.live_dma(), 0);

        dev.fail_dma_allocs(1);
        assert!(matches!(dev.dma_alloc(10), Err(FwError::NoMemory(10))));
        assert!(dev.dma_alloc(10).is_ok());
    }

    #[test]
    fn test_rng_deterministic() {
        let a = SimDevice::new(3);
        let b = SimDevice::new(3);
        let xs: Vec<u32> = (0..4).map(|_| a.random_u32()).collect();
        let ys: Vec<u32> = (0..4).map(|_| b.random_u32()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs[0], xs[1]);
    }

    #[test]
    fn test_irq_masking_defers_delivery() {
        let dev = SimDevice::new(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        dev.request_irq(4, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert!(dev.request_irq(4, Arc::new(|| {})).is_err());

        dev.raise(4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dev.mask(4);
        dev.raise(4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dev.unmask(4);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        dev.free_irq(4);
        dev.raise(4);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_push_to_unconfigured_queue() {
        let dev = SimDevice::new(0);
        assert!(!dev.push_ceq(0, 0, 1));
    }
}
