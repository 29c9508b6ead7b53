// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Synchronous firmware command transport.
//!
//! A command goes through these steps:
//!
//! 1. pick the channel (primary or secondary) from the request type and target
//! 2. under the channel's sequence lock: stamp the sequence id, register a
//!    wait token when completion comes through an event queue, copy the
//!    request (or a short descriptor pointing at it) into the command window,
//!    fence, ring the doorbell
//! 3. outside the lock: wait with backoff for the response length and then
//!    the valid byte, or for the wait token
//! 4. map the firmware error code and release the context unless held
//!
//! # Example
//!
//! ```rust,no_run
//! use fwcmd_rust::{ChannelConfig, FwChannel, FwResult, ReqType};
//! use fwcmd_rust::sim::SimDevice;
//!
//! fn main() -> FwResult<()> {
//!     let dev = SimDevice::new(0);
//!     let ch = FwChannel::new(dev, ChannelConfig::default())?;
//!
//!     let req = ch.req_init(ReqType::VER_GET, 24)?;
//!     ch.req_hold(&req)?;
//!     ch.send(req)?;
//!     let resp = ch.resp(&req)?;
//!     println!("{} bytes", resp.body.len());
//!     ch.req_drop(req)?;
//!     Ok(())
//! }
//! ```

use crate::config::ChannelConfig;
use crate::ctx::{AllocFlags, CtxFlags, DmaSpan, FwResponse, ReqArena, ReqHandle, SendPlan};
use crate::device::Device;
use crate::dma::DmaRegion;
use crate::error::{FwError, FwResult};
use crate::mbox::RandomIdSync;
use crate::regs::{cmd_doorbell, cmd_window, CMD_WINDOW_LEN};
use crate::registry::EventFn;
use crate::reqtype::{classify, Channel, ReqType};
use crate::slab::RESP_OFFSET;
use crate::wire::{
    cmd_done_parse, fw_status, req_off, resp_off, ShortCmd, NO_CMPL_RING, REQ_HEADER_LEN,
    RESP_HEADER_LEN, RESP_VALID_KEY, SHORT_CMD_LEN,
};
use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Completion ring value used when commands are polled.
const POLL_RING: u16 = NO_CMPL_RING;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Pending,
    Complete,
}

/// Rendezvous between a waiting sender and the completion queue.
struct WaitToken {
    state: Mutex<TokenState>,
    cv: Condvar,
}

impl WaitToken {
    fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::Pending),
            cv: Condvar::new(),
        }
    }

    fn complete(&self) {
        *lock(&self.state) = TokenState::Complete;
        self.cv.notify_all();
    }

    /// Wait up to `d` for completion.
    fn wait_for(&self, d: Duration) -> bool {
        let guard = lock(&self.state);
        match self
            .cv
            .wait_timeout_while(guard, d, |s| *s == TokenState::Pending)
        {
            Ok((s, _)) => *s == TokenState::Complete,
            Err(poisoned) => *poisoned.into_inner().0 == TokenState::Complete,
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Firmware command channel of one function.
pub struct FwChannel<D: Device> {
    dev: Arc<D>,
    cfg: ChannelConfig,
    arena: Mutex<ReqArena>,
    /// Next sequence id per channel; held across the hardware write only.
    seq: [Mutex<u16>; 2],
    tokens: Mutex<HashMap<(Channel, u16), Arc<WaitToken>>>,
}

impl<D: Device> FwChannel<D> {
    pub fn new(dev: Arc<D>, cfg: ChannelConfig) -> FwResult<Self> {
        if cfg.window_len > CMD_WINDOW_LEN
            || cfg.window_len < SHORT_CMD_LEN
            || cfg.window_len % 4 != 0
        {
            return Err(FwError::InvalidArgument(format!(
                "command window of {} bytes",
                cfg.window_len
            )));
        }
        let arena = ReqArena::new(
            cfg.max_contexts,
            cfg.default_timeout,
            cfg.max_timeout,
            cfg.cmpl_ring.unwrap_or(POLL_RING),
        );
        Ok(Self {
            dev,
            cfg,
            arena: Mutex::new(arena),
            seq: [Mutex::new(0), Mutex::new(0)],
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.dev
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    fn arena(&self) -> MutexGuard<'_, ReqArena> {
        lock(&self.arena)
    }

    // ------------------------------------------------------------------
    // Request contexts
    // ------------------------------------------------------------------

    /// Create a request of `len` bytes (header included).
    pub fn req_init(&self, req_type: ReqType, len: usize) -> FwResult<ReqHandle> {
        self.arena().init(&*self.dev, req_type, len)
    }

    /// Keep the context alive past `send`; returns the response window.
    pub fn req_hold(&self, h: &ReqHandle) -> FwResult<DmaSpan> {
        self.arena().hold(h)
    }

    /// Release a context that was never sent, or a held one after use.
    pub fn req_drop(&self, h: ReqHandle) -> FwResult<()> {
        self.arena().drop_ctx(&*self.dev, &h)
    }

    /// Replace the request payload with `len` bytes of `src`.
    ///
    /// Payloads that fit the command window are copied; larger ones are sent
    /// in place through a short descriptor. `h` is updated to the request
    /// type found in the new payload.
    pub fn req_replace(&self, h: &mut ReqHandle, src: Arc<DmaRegion>, len: usize) -> FwResult<()> {
        self.arena().replace(
            h,
            src,
            len,
            self.cfg.window_len,
            self.cfg.short_cmd_required,
        )
    }

    /// Per-request timeout, capped at the configured maximum.
    pub fn req_set_timeout(&self, h: &ReqHandle, timeout: Duration) -> FwResult<()> {
        self.arena().set_timeout(h, timeout)
    }

    /// Demote failure logging of this request to debug level.
    pub fn req_silence(&self, h: &ReqHandle) -> FwResult<()> {
        self.arena().silence(h)
    }

    pub fn req_set_target(&self, h: &ReqHandle, target_id: u16) -> FwResult<()> {
        self.arena().set_target(h, target_id)
    }

    /// Complete through completion ring `ring`, or poll with `None`.
    pub fn req_set_completion(&self, h: &ReqHandle, ring: Option<u16>) -> FwResult<()> {
        self.arena().set_cmpl_ring(h, ring.unwrap_or(POLL_RING))
    }

    pub fn req_set_alloc_flags(&self, h: &ReqHandle, flags: AllocFlags) -> FwResult<()> {
        self.arena().set_alloc_flags(h, flags)
    }

    /// Write request bytes at `offset`; offsets below 16 patch the header.
    pub fn req_write(&self, h: &ReqHandle, offset: usize, data: &[u8]) -> FwResult<()> {
        self.arena().write(h, offset, data)
    }

    pub fn req_read(&self, h: &ReqHandle, offset: usize, buf: &mut [u8]) -> FwResult<()> {
        self.arena().read(h, offset, buf)
    }

    pub fn req_flags(&self, h: &ReqHandle) -> FwResult<CtxFlags> {
        self.arena().flags(h)
    }

    /// Device-visible buffer owned by the request.
    pub fn dma_slice(&self, h: &ReqHandle, size: usize) -> FwResult<DmaSpan> {
        self.arena().slice(&*self.dev, h, size)
    }

    pub fn span_write(&self, h: &ReqHandle, span: &DmaSpan, offset: usize, data: &[u8]) -> FwResult<()> {
        self.arena().span_write(h, span, offset, data)
    }

    pub fn span_read(&self, h: &ReqHandle, span: &DmaSpan, offset: usize, buf: &mut [u8]) -> FwResult<()> {
        self.arena().span_read(h, span, offset, buf)
    }

    /// Parsed response of a held request.
    pub fn resp(&self, h: &ReqHandle) -> FwResult<FwResponse> {
        self.arena().response(h)
    }

    /// Slabs held by live contexts.
    pub fn outstanding(&self) -> usize {
        self.arena().outstanding()
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Issue the request and wait for its response.
    ///
    /// The context is released unless it was held.
    pub fn send(&self, h: ReqHandle) -> FwResult<()> {
        self.send_inner(h, false)
    }

    /// Like [`send`](Self::send), but failures are only logged at debug level.
    pub fn send_silent(&self, h: ReqHandle) -> FwResult<()> {
        self.send_inner(h, true)
    }

    fn send_inner(&self, h: ReqHandle, silent: bool) -> FwResult<()> {
        let plan = self.arena().begin_send(&h)?;
        // Teardown runs on every exit path, after the plan's slab clone is gone.
        let plan = scopeguard::guard(plan, |plan| {
            drop(plan);
            self.arena().end_send(&*self.dev, &h);
        });
        let silent = silent || plan.flags.contains(CtxFlags::SILENT);

        if self.dev.is_fatal() {
            log::debug!("device fatal, not sending {}", h.req_type());
            return Err(FwError::DeviceFatal);
        }

        let req = plan.request();
        let req_type = req.read_u16(req_off::REQ_TYPE);
        let target = req.read_u16(req_off::TARGET_ID);
        let cmpl_ring = req.read_u16(req_off::CMPL_RING);
        let ch = classify(ReqType(req_type), target, self.cfg.secondary_channel);

        // Stale data from an earlier use of this window must not look valid
        plan.slab.fill(RESP_OFFSET, RESP_HEADER_LEN, 0);

        let (seq, token) = {
            let mut next = lock(&self.seq[ch as usize]);
            let seq = *next;
            *next = seq.wrapping_add(1);
            req.write_u16(req_off::SEQ_ID, seq);

            let token = (cmpl_ring != POLL_RING).then(|| {
                let t = Arc::new(WaitToken::new());
                lock(&self.tokens).insert((ch, seq), Arc::clone(&t));
                t
            });
            self.write_command(ch, &plan, req_type, target);
            (seq, token)
        };
        let _token = scopeguard::guard((), |_| {
            if token.is_some() {
                lock(&self.tokens).remove(&(ch, seq));
            }
        });
        log::trace!("sent {} seq={} on {:?}", ReqType(req_type), seq, ch);

        let start = self.dev.now();
        let waited = match &token {
            Some(t) => self
                .wait_token(t, start, plan.timeout)
                .and_then(|_| self.wait_response(&plan, start, plan.timeout)),
            None => self.wait_response(&plan, start, plan.timeout),
        };

        let err = match waited {
            Ok(()) => match fw_status(plan.slab.read_u16(RESP_OFFSET + resp_off::ERROR_CODE)) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            },
            Err(FwError::Timeout { .. }) => FwError::Timeout {
                req_type,
                seq,
                elapsed_ms: self.elapsed(start).as_millis() as u64,
                resp_len: plan.slab.read_u16(RESP_OFFSET + resp_off::RESP_LEN),
                valid: self.last_valid_byte(&plan),
            },
            Err(e) => e,
        };

        if silent {
            log::debug!("{} seq={} failed: {}", ReqType(req_type), seq, err);
        } else if matches!(err, FwError::Timeout { .. }) {
            log::error!("{} {}", ReqType(req_type), err);
        } else {
            log::warn!("{} seq={} failed: {}", ReqType(req_type), seq, err);
        }
        Err(err)
    }

    /// Copy the request (or a short descriptor) into the window and ring.
    fn write_command(&self, ch: Channel, plan: &SendPlan, req_type: u16, target: u16) {
        let req = plan.request();
        let window_len = self.cfg.window_len;
        let short = self.cfg.short_cmd_required || plan.external.is_some() || plan.req_len > window_len;

        let mut buf = vec![0u8; window_len];
        if short {
            let sc = ShortCmd::new(req_type, target, plan.req_len as u16, req.bus());
            buf[..SHORT_CMD_LEN].copy_from_slice(&sc.to_bytes());
        } else {
            req.read(0, &mut buf[..plan.req_len]);
        }

        let base = cmd_window(ch);
        for (i, word) in buf.chunks_exact(4).enumerate() {
            let v = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.dev.write32(base + (i * 4) as u32, v);
        }
        // Window contents must be visible before the doorbell
        fence(Ordering::Release);
        self.dev.write32(cmd_doorbell(ch), 1);
    }

    fn elapsed(&self, start: Instant) -> Duration {
        self.dev.now().saturating_duration_since(start)
    }

    /// Sleep one backoff step, or report the timeout.
    fn backoff(&self, start: Instant, timeout: Duration) -> FwResult<()> {
        if self.dev.is_fatal() {
            return Err(FwError::DeviceFatal);
        }
        match self.cfg.backoff.sleep_for(self.elapsed(start), timeout) {
            Some(d) => {
                std::thread::sleep(d);
                Ok(())
            }
            None => Err(FwError::Timeout {
                req_type: 0,
                seq: 0,
                elapsed_ms: 0,
                resp_len: 0,
                valid: 0,
            }),
        }
    }

    fn wait_token(&self, token: &WaitToken, start: Instant, timeout: Duration) -> FwResult<()> {
        loop {
            if self.dev.is_fatal() {
                return Err(FwError::DeviceFatal);
            }
            let Some(slice) = self.cfg.backoff.sleep_for(self.elapsed(start), timeout) else {
                return self.backoff(start, timeout);
            };
            // Fatal state is re-checked between slices
            if token.wait_for(slice) {
                return Ok(());
            }
        }
    }

    /// Poll the length field, then the valid byte that firmware writes last.
    fn wait_response(&self, plan: &SendPlan, start: Instant, timeout: Duration) -> FwResult<()> {
        let resp = &plan.slab;
        let len = loop {
            if self.dev.is_fatal() {
                return Err(FwError::DeviceFatal);
            }
            let len = resp.read_u16(RESP_OFFSET + resp_off::RESP_LEN) as usize;
            if len != 0 {
                break len;
            }
            self.backoff(start, timeout)?;
        };
        if len <= RESP_HEADER_LEN || len > crate::slab::RESP_SIZE {
            log::error!("firmware returned invalid response length {}", len);
            return Err(FwError::DeviceError {
                code: crate::wire::fw_err::FAIL,
            });
        }

        let valid_off = RESP_OFFSET + len - 1;
        while resp.read_u8(valid_off) != RESP_VALID_KEY {
            self.backoff(start, timeout)?;
        }
        // Payload reads must not pass the valid byte
        fence(Ordering::Acquire);
        resp.write_u8(valid_off, 0);
        Ok(())
    }

    fn last_valid_byte(&self, plan: &SendPlan) -> u8 {
        let len = plan.slab.read_u16(RESP_OFFSET + resp_off::RESP_LEN) as usize;
        if len > RESP_HEADER_LEN && len <= crate::slab::RESP_SIZE {
            plan.slab.read_u8(RESP_OFFSET + len - 1)
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // Completion queue integration
    // ------------------------------------------------------------------

    /// Wake the sender waiting on `(ch, seq)`. Returns false if none is.
    pub fn complete_token(&self, ch: Channel, seq: u16) -> bool {
        let token = lock(&self.tokens).get(&(ch, seq)).cloned();
        match token {
            Some(t) => {
                t.complete();
                true
            }
            None => {
                log::debug!("completion for {:?} seq={} has no waiter", ch, seq);
                false
            }
        }
    }

    /// Callback for the command-done completion event.
    pub fn completion_handler(self: &Arc<Self>) -> Arc<EventFn> {
        let weak = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            let Some(ch) = weak.upgrade() else {
                return;
            };
            let Some(word) = data.get(..4) else {
                log::warn!("short command-done event ({} bytes)", data.len());
                return;
            };
            let (chan, seq) = cmd_done_parse(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
            let chan = if chan == 0 {
                Channel::Primary
            } else {
                Channel::Secondary
            };
            ch.complete_token(chan, seq);
        })
    }

    /// Publish `func`'s mailbox random id to firmware.
    pub fn set_random_id(&self, func: u16, id: u32) -> FwResult<()> {
        let h = self.req_init(ReqType::FUNC_MBOX_RANDOM_ID, REQ_HEADER_LEN + 8)?;
        let mut body = [0u8; 8];
        body[0..2].copy_from_slice(&func.to_le_bytes());
        body[4..8].copy_from_slice(&id.to_le_bytes());
        if let Err(e) = self.req_write(&h, REQ_HEADER_LEN, &body) {
            let _ = self.req_drop(h);
            return Err(e);
        }
        self.send(h)
    }

    /// Release cached DMA memory. Live contexts are released as well.
    pub fn shutdown(&self) {
        self.arena().shutdown(&*self.dev);
    }
}

impl<D: Device> RandomIdSync for FwChannel<D> {
    fn publish_random_id(&self, func: u16, id: u32) -> FwResult<()> {
        self.set_random_id(func, id)
    }
}

impl<D: Device> Drop for FwChannel<D> {
    fn drop(&mut self) {
        self.arena().shutdown(&*self.dev);
    }
}
