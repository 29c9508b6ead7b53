// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Request contexts.
//!
//! A request context pairs a request buffer with its response window, both
//! inside one DMA slab, plus per-request metadata (timeout, ownership,
//! logging, auxiliary mapping). Callers refer to a context through a
//! [`ReqHandle`]: a slot index, the slot's generation and the request type.
//! A handle is only accepted while all three still match, so a stale handle
//! can never reach a context that was released and reused, even for the same
//! request type.
//!
//! Exactly one of "consumed by send" or "released by drop" happens to every
//! context. A context that was held is not consumed by send; the caller
//! drops it once the response has been read.

use crate::device::Device;
use crate::dma::DmaRegion;
use crate::error::{misuse, FwError, FwResult};
use crate::reqtype::{ReqType, TARGET_ID_DEFAULT};
use crate::slab::{
    align_up, SliceArena, SlabPool, DMA_ALIGN, REQ_MAX_LEN, RESP_OFFSET, RESP_SIZE, SLAB_SIZE,
};
use crate::wire::{req_off, ReqHeader, RespHeader, REQ_HEADER_LEN, RESP_HEADER_LEN};
use bitflags::bitflags;
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Per-request state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtxFlags: u8 {
        /// Caller holds the context; send does not release it.
        const OWNED = 1 << 0;
        /// Failures are logged at debug level only.
        const SILENT = 1 << 1;
        /// Response window holds data the caller has not dropped yet.
        const RESP_DIRTY = 1 << 2;
    }
}

bitflags! {
    /// Allocation policy for slices.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u8 {
        /// Zero slices before handing them out.
        const ZERO_SLICE = 1 << 0;
    }
}

/// Opaque reference to a live request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqHandle {
    slot: u32,
    generation: u32,
    req_type: ReqType,
}

impl ReqHandle {
    /// Request type the handle was issued for.
    #[inline]
    pub fn req_type(&self) -> ReqType {
        self.req_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanLoc {
    Slab(usize),
    Aux,
}

/// A device-visible buffer belonging to a request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSpan {
    bus: u64,
    len: usize,
    loc: SpanLoc,
}

impl DmaSpan {
    /// Bus address to hand to the firmware.
    #[inline]
    pub fn bus(&self) -> u64 {
        self.bus
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for the standalone fallback mapping.
    #[inline]
    pub fn is_standalone(&self) -> bool {
        self.loc == SpanLoc::Aux
    }
}

/// Parsed response of a held request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwResponse {
    pub error_code: u16,
    pub req_type: u16,
    pub seq_id: u16,
    pub resp_len: u16,
    /// Bytes between the header and the valid marker.
    pub body: Vec<u8>,
}

struct ReqCtx {
    slab: Arc<DmaRegion>,
    /// Caller-provided request replacing the inline one.
    external: Option<Arc<DmaRegion>>,
    req_len: usize,
    arena: SliceArena,
    aux: Option<DmaRegion>,
    timeout: Duration,
    flags: CtxFlags,
    alloc: AllocFlags,
}

impl ReqCtx {
    /// Memory currently holding the request.
    fn request(&self) -> &DmaRegion {
        self.external.as_deref().unwrap_or(&self.slab)
    }
}

struct Slot {
    generation: u32,
    req_type: ReqType,
    in_flight: bool,
    ctx: Option<ReqCtx>,
}

/// What the transport needs to issue a request.
pub(crate) struct SendPlan {
    pub slab: Arc<DmaRegion>,
    pub external: Option<Arc<DmaRegion>>,
    pub req_len: usize,
    pub timeout: Duration,
    pub flags: CtxFlags,
}

impl SendPlan {
    pub fn request(&self) -> &DmaRegion {
        self.external.as_deref().unwrap_or(&self.slab)
    }
}

/// Arena of request contexts backed by a slab pool.
pub(crate) struct ReqArena {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    pool: SlabPool,
    default_timeout: Duration,
    max_timeout: Duration,
    default_cmpl_ring: u16,
}

impl ReqArena {
    pub fn new(
        max_contexts: usize,
        default_timeout: Duration,
        max_timeout: Duration,
        default_cmpl_ring: u16,
    ) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            pool: SlabPool::new(max_contexts),
            default_timeout,
            max_timeout,
            default_cmpl_ring,
        }
    }

    /// Slabs handed out to live contexts.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn init<D: Device>(&mut self, dev: &D, req_type: ReqType, len: usize) -> FwResult<ReqHandle> {
        if len > REQ_MAX_LEN {
            return Err(misuse(
                FwError::RequestTooLarge {
                    len,
                    max: REQ_MAX_LEN,
                },
                "request init",
            ));
        }
        if len < REQ_HEADER_LEN {
            return Err(FwError::InvalidArgument(format!(
                "request of {} bytes is shorter than its header",
                len
            )));
        }

        let slab = self.pool.take(dev)?;
        let hdr = ReqHeader {
            req_type: req_type.as_u16(),
            cmpl_ring: self.default_cmpl_ring,
            seq_id: 0,
            target_id: TARGET_ID_DEFAULT,
            resp_addr: slab.bus() + RESP_OFFSET as u64,
        };
        slab.write(0, &hdr.to_bytes());

        let ctx = ReqCtx {
            slab: Arc::new(slab),
            external: None,
            req_len: len,
            arena: SliceArena::new(len),
            aux: None,
            timeout: self.default_timeout,
            flags: CtxFlags::empty(),
            alloc: AllocFlags::empty(),
        };

        let index = match self.free_slots.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    req_type,
                    in_flight: false,
                    ctx: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.req_type = req_type;
        slot.in_flight = false;
        slot.ctx = Some(ctx);

        Ok(ReqHandle {
            slot: index,
            generation: slot.generation,
            req_type,
        })
    }

    fn slot(&self, h: &ReqHandle) -> Option<&Slot> {
        self.slots
            .get(h.slot as usize)
            .filter(|s| s.generation == h.generation && s.req_type == h.req_type && s.ctx.is_some())
    }

    fn slot_mut(&mut self, h: &ReqHandle) -> FwResult<&mut Slot> {
        match self.slots.get_mut(h.slot as usize) {
            Some(s) if s.generation == h.generation && s.req_type == h.req_type && s.ctx.is_some() => {
                Ok(s)
            }
            _ => Err(misuse(FwError::InvalidHandle, "request handle")),
        }
    }

    /// Live, idle context for `h`.
    fn ctx_mut(&mut self, h: &ReqHandle) -> FwResult<&mut ReqCtx> {
        let slot = self.slot_mut(h)?;
        if slot.in_flight {
            return Err(misuse(FwError::InFlight, "request handle"));
        }
        slot.ctx.as_mut().ok_or(FwError::InvalidHandle)
    }

    fn ctx(&self, h: &ReqHandle) -> FwResult<&ReqCtx> {
        self.slot(h)
            .and_then(|s| s.ctx.as_ref())
            .ok_or_else(|| misuse(FwError::InvalidHandle, "request handle"))
    }

    /// True while `h` names a live context.
    pub fn is_live(&self, h: &ReqHandle) -> bool {
        self.slot(h).is_some()
    }

    pub fn set_timeout(&mut self, h: &ReqHandle, timeout: Duration) -> FwResult<()> {
        let max = self.max_timeout;
        let ctx = self.ctx_mut(h)?;
        ctx.timeout = timeout.min(max);
        Ok(())
    }

    pub fn silence(&mut self, h: &ReqHandle) -> FwResult<()> {
        self.ctx_mut(h)?.flags.insert(CtxFlags::SILENT);
        Ok(())
    }

    pub fn set_alloc_flags(&mut self, h: &ReqHandle, alloc: AllocFlags) -> FwResult<()> {
        self.ctx_mut(h)?.alloc = alloc;
        Ok(())
    }

    pub fn set_target(&mut self, h: &ReqHandle, target_id: u16) -> FwResult<()> {
        let ctx = self.ctx_mut(h)?;
        ctx.request().write_u16(req_off::TARGET_ID, target_id);
        Ok(())
    }

    pub fn set_cmpl_ring(&mut self, h: &ReqHandle, ring: u16) -> FwResult<()> {
        let ctx = self.ctx_mut(h)?;
        ctx.request().write_u16(req_off::CMPL_RING, ring);
        Ok(())
    }

    /// Write request bytes at `offset` (header included).
    pub fn write(&mut self, h: &ReqHandle, offset: usize, data: &[u8]) -> FwResult<()> {
        let ctx = self.ctx_mut(h)?;
        check_range(offset, data.len(), ctx.req_len)?;
        ctx.request().write(offset, data);
        Ok(())
    }

    pub fn read(&self, h: &ReqHandle, offset: usize, buf: &mut [u8]) -> FwResult<()> {
        let ctx = self.ctx(h)?;
        check_range(offset, buf.len(), ctx.req_len)?;
        ctx.request().read(offset, buf);
        Ok(())
    }

    /// Claim the context for the caller and return its response window.
    pub fn hold(&mut self, h: &ReqHandle) -> FwResult<DmaSpan> {
        let ctx = self.ctx_mut(h)?;
        if ctx.flags.contains(CtxFlags::OWNED) {
            return Err(misuse(FwError::AlreadyHeld, "request hold"));
        }
        ctx.flags.insert(CtxFlags::OWNED);
        Ok(DmaSpan {
            bus: ctx.slab.bus() + RESP_OFFSET as u64,
            len: RESP_SIZE,
            loc: SpanLoc::Slab(RESP_OFFSET),
        })
    }

    /// Release the context and everything attached to it.
    pub fn drop_ctx<D: Device>(&mut self, dev: &D, h: &ReqHandle) -> FwResult<()> {
        self.ctx_mut(h)?;
        self.teardown(dev, h.slot);
        Ok(())
    }

    fn teardown<D: Device>(&mut self, dev: &D, index: u32) {
        let slot = &mut self.slots[index as usize];
        let Some(ctx) = slot.ctx.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.in_flight = false;

        if let Some(aux) = ctx.aux {
            dev.dma_free(aux);
        }
        ctx.slab.fill(0, REQ_HEADER_LEN, 0);
        match Arc::try_unwrap(ctx.slab) {
            Ok(slab) => self.pool.give(slab),
            // Still referenced by a sender; it is freed with the last clone.
            Err(_) => {
                log::error!("request slab still shared at teardown");
                self.pool.give_lost();
            }
        }
        self.free_slots.push(index);
    }

    /// Carve a DMA buffer for the request.
    pub fn slice<D: Device>(&mut self, dev: &D, h: &ReqHandle, size: usize) -> FwResult<DmaSpan> {
        if size == 0 {
            return Err(FwError::InvalidArgument("zero-size DMA slice".into()));
        }
        let ctx = self.ctx_mut(h)?;
        let zero = ctx.alloc.contains(AllocFlags::ZERO_SLICE);

        if let Some(offset) = ctx.arena.carve(size) {
            if zero {
                ctx.slab.fill(offset, size, 0);
            }
            return Ok(DmaSpan {
                bus: ctx.slab.bus() + offset as u64,
                len: size,
                loc: SpanLoc::Slab(offset),
            });
        }

        // Could not carve from the slab, try a standalone mapping.
        if ctx.aux.is_some() {
            return Err(misuse(FwError::SliceInUse, "refusing to reallocate DMA slice"));
        }
        let aux = dev.dma_alloc(size)?;
        let span = DmaSpan {
            bus: aux.bus(),
            len: size,
            loc: SpanLoc::Aux,
        };
        ctx.aux = Some(aux);
        Ok(span)
    }

    fn span_region<'a>(ctx: &'a ReqCtx, span: &DmaSpan) -> FwResult<(&'a DmaRegion, usize)> {
        match span.loc {
            SpanLoc::Slab(offset) => {
                let carved = offset >= ctx.arena.high() && offset + span.len <= RESP_OFFSET;
                let resp = offset == RESP_OFFSET && span.len == RESP_SIZE;
                if (carved || resp) && ctx.slab.bus() + offset as u64 == span.bus {
                    Ok((&ctx.slab, offset))
                } else {
                    Err(FwError::InvalidArgument("span does not belong to request".into()))
                }
            }
            SpanLoc::Aux => match &ctx.aux {
                Some(aux) if aux.bus() == span.bus => Ok((aux, 0)),
                _ => Err(FwError::InvalidArgument("span does not belong to request".into())),
            },
        }
    }

    pub fn span_write(&mut self, h: &ReqHandle, span: &DmaSpan, offset: usize, data: &[u8]) -> FwResult<()> {
        let ctx = self.ctx_mut(h)?;
        check_range(offset, data.len(), span.len)?;
        let (region, base) = Self::span_region(ctx, span)?;
        region.write(base + offset, data);
        Ok(())
    }

    pub fn span_read(&self, h: &ReqHandle, span: &DmaSpan, offset: usize, buf: &mut [u8]) -> FwResult<()> {
        let ctx = self.ctx(h)?;
        check_range(offset, buf.len(), span.len)?;
        let (region, base) = Self::span_region(ctx, span)?;
        region.read(base + offset, buf);
        Ok(())
    }

    /// Substitute the request payload.
    ///
    /// Small payloads are copied inline unless `force_external` or slices
    /// already occupy the bytes they would need; others are referenced in
    /// place. The handle is re-stamped with the request type found in the
    /// new payload.
    pub fn replace(
        &mut self,
        h: &mut ReqHandle,
        src: Arc<DmaRegion>,
        len: usize,
        inline_limit: usize,
        force_external: bool,
    ) -> FwResult<()> {
        if len < REQ_HEADER_LEN || len > src.len() || len > u16::MAX as usize {
            return Err(FwError::InvalidArgument(format!(
                "replacement request of {} bytes (buffer {})",
                len,
                src.len()
            )));
        }
        let new_type = ReqType(src.read_u16(req_off::REQ_TYPE));
        let ctx = self.ctx_mut(h)?;
        let resp_addr = ctx.slab.bus() + RESP_OFFSET as u64;

        // Carved slices pin the end of the inline request area
        let fits = align_up(len, DMA_ALIGN) <= ctx.arena.high();
        if len <= inline_limit && fits && !force_external {
            let mut buf = vec![0u8; len];
            src.read(0, &mut buf);
            if ctx.req_len > len {
                ctx.slab.fill(len, ctx.req_len - len, 0);
            }
            ctx.slab.write(0, &buf);
            ctx.external = None;
            ctx.arena.set_request_len(len);
        } else {
            ctx.external = Some(src);
        }
        ctx.req_len = len;
        ctx.request().write_u64(req_off::RESP_ADDR, resp_addr);

        let slot = self.slot_mut(h)?;
        slot.req_type = new_type;
        h.req_type = new_type;
        Ok(())
    }

    /// Mark the context in flight and hand out what the sender needs.
    pub fn begin_send(&mut self, h: &ReqHandle) -> FwResult<SendPlan> {
        let slot = self.slot_mut(h)?;
        if slot.in_flight {
            return Err(misuse(FwError::InFlight, "request send"));
        }
        let ctx = slot.ctx.as_mut().ok_or(FwError::InvalidHandle)?;
        ctx.flags.remove(CtxFlags::RESP_DIRTY);
        let plan = SendPlan {
            slab: Arc::clone(&ctx.slab),
            external: ctx.external.clone(),
            req_len: ctx.req_len,
            timeout: ctx.timeout,
            flags: ctx.flags,
        };
        slot.in_flight = true;
        Ok(plan)
    }

    /// Finish a send: release unheld contexts, mark held ones dirty.
    pub fn end_send<D: Device>(&mut self, dev: &D, h: &ReqHandle) {
        let Some(slot) = self.slots.get_mut(h.slot as usize) else {
            return;
        };
        if slot.generation != h.generation || slot.ctx.is_none() {
            return;
        }
        slot.in_flight = false;
        let owned = slot
            .ctx
            .as_ref()
            .is_some_and(|c| c.flags.contains(CtxFlags::OWNED));
        if owned {
            if let Some(ctx) = slot.ctx.as_mut() {
                ctx.flags.insert(CtxFlags::RESP_DIRTY);
            }
        } else {
            self.teardown(dev, h.slot);
        }
    }

    pub fn flags(&self, h: &ReqHandle) -> FwResult<CtxFlags> {
        Ok(self.ctx(h)?.flags)
    }

    pub fn timeout(&self, h: &ReqHandle) -> FwResult<Duration> {
        Ok(self.ctx(h)?.timeout)
    }

    /// Parse the response window of a live context.
    pub fn response(&self, h: &ReqHandle) -> FwResult<FwResponse> {
        let ctx = self.ctx(h)?;
        let raw = ctx.slab.to_vec(RESP_OFFSET, RESP_HEADER_LEN);
        let hdr = RespHeader::from_bytes(&raw).ok_or(FwError::InvalidHandle)?;
        let len = (hdr.resp_len as usize).min(RESP_SIZE);
        let body = if len > RESP_HEADER_LEN + 1 {
            ctx.slab.to_vec(RESP_OFFSET + RESP_HEADER_LEN, len - RESP_HEADER_LEN - 1)
        } else {
            Vec::new()
        };
        Ok(FwResponse {
            error_code: hdr.error_code,
            req_type: hdr.req_type,
            seq_id: hdr.seq_id,
            resp_len: hdr.resp_len,
            body,
        })
    }

    /// Free every cached slab. Live contexts are released too.
    pub fn shutdown<D: Device>(&mut self, dev: &D) {
        for index in 0..self.slots.len() as u32 {
            if self.slots[index as usize].ctx.is_some() {
                log::warn!("releasing request context {} at shutdown", index);
                self.teardown(dev, index);
            }
        }
        self.pool.release(dev);
    }
}

fn check_range(offset: usize, len: usize, limit: usize) -> FwResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(FwError::InvalidArgument(format!(
            "range {}+{} exceeds {} bytes",
            offset, len, limit
        ))),
    }
}

const _: () = assert!(RESP_OFFSET + RESP_SIZE == SLAB_SIZE);
