// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Function-to-function mailbox.
//!
//! Messages of up to [`MBOX_MAX_MSG_LEN`] bytes travel between PFs, VFs and
//! the PPF in 48-byte segments through a 64-byte hardware data window:
//!
//! ```text
//! | 0..8 header | 8..56 segment body | 56..60 sender token (stamped by hw) |
//! ```
//!
//! Sending takes the destination's lock for the whole message and the
//! hardware lock for each segment, then waits for the segment's write-back
//! status (polled, CRC checked) or for the send-result event.
//!
//! Receiving reassembles segments per source and direction. Responses wake
//! the caller waiting on that message id; requests are queued to a worker
//! that runs the handler registered for the module and sends the reply.
//!
//! Segments from VFs carry a token that must match the VF's current or
//! previous random id. A mismatch drops the segment and schedules a single
//! resync of that VF's id per message.

use crate::channel::lock;
use crate::config::{AckMode, FuncConfig, FuncRole, MboxConfig};
use crate::device::Device;
use crate::dma::DmaRegion;
use crate::error::{FwError, FwResult};
use crate::registry::{CallbackTable, EventFn};
use crate::regs::{
    MBOX_ATTR, MBOX_ATTR_DST_MASK, MBOX_ATTR_DWORDS_SHIFT, MBOX_ATTR_EVENT_ACK, MBOX_DATA,
    MBOX_TRIGGER, MBOX_WB_HI, MBOX_WB_LO,
};
use crate::wire::{
    mbox_status, mbox_wb, Direction, MboxHeader, MBOX_HEADER_LEN, MBOX_MAX_MSG_LEN, MBOX_SEG_LEN,
    MBOX_SEQ_ID_MAX, MBOX_TOKEN_OFF,
};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Modules addressable by the 5-bit module field.
pub const MBOX_MODULES: usize = 32;

/// Queued work items (requests and resyncs).
const WORK_QUEUE_DEPTH: usize = 64;

/// Bytes of the data window written per segment.
const SEG_WINDOW_LEN: usize = MBOX_HEADER_LEN + MBOX_SEG_LEN;

/// Publishes a function's mailbox random id to firmware.
pub trait RandomIdSync: Send + Sync {
    fn publish_random_id(&self, func: u16, id: u32) -> FwResult<()>;
}

/// Relationship between the receiving function and the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MboxRole {
    /// PF handling a message from one of its VFs.
    PfFromVf,
    /// PPF handling a message from a PF.
    PpfFromPf,
    /// VF handling a message from its PF.
    VfFromPf,
    /// PF handling a message from the PPF.
    PfFromPpf,
}

impl MboxRole {
    const ALL: [MboxRole; 4] = [
        MboxRole::PfFromVf,
        MboxRole::PpfFromPf,
        MboxRole::VfFromPf,
        MboxRole::PfFromPpf,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A request delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MboxRequest {
    pub src: u16,
    pub module: u8,
    pub cmd: u8,
    pub msg_id: u8,
    pub data: Vec<u8>,
}

/// Response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MboxReply {
    pub msg_id: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

/// Module handler; writes its response into the output buffer.
pub type MboxHandler = dyn Fn(&MboxRequest, &mut Vec<u8>) -> FwResult<()> + Send + Sync;

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub header: MboxHeader,
    pub data: Vec<u8>,
}

/// Reassembly state of one (source, direction) stream.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    active: bool,
    next_seq: u8,
    first: Option<MboxHeader>,
    buf: Vec<u8>,
}

impl Reassembly {
    fn reset(&mut self) {
        self.active = false;
        self.next_seq = 0;
        self.first = None;
        self.buf.clear();
    }

    fn reject(&mut self, hdr: &MboxHeader, why: &str) -> Option<Message> {
        log::warn!(
            "mailbox: dropping segment from {} (msg {} seq {}): {}",
            hdr.src_func,
            hdr.msg_id,
            hdr.seq_id,
            why
        );
        self.reset();
        None
    }

    /// Feed one segment; returns the message once its last segment arrived.
    pub fn feed(&mut self, hdr: &MboxHeader, body: &[u8]) -> Option<Message> {
        let seg_len = hdr.seg_len as usize;
        if seg_len > MBOX_SEG_LEN || seg_len > body.len() {
            return self.reject(hdr, "segment too long");
        }
        if hdr.seq_id > MBOX_SEQ_ID_MAX {
            return self.reject(hdr, "sequence id out of range");
        }
        if hdr.msg_len as usize > MBOX_MAX_MSG_LEN {
            return self.reject(hdr, "message too long");
        }

        if hdr.seq_id == 0 {
            self.reset();
            self.active = true;
            self.first = Some(*hdr);
        } else {
            let same_msg = self.first.is_some_and(|f| f.msg_id == hdr.msg_id);
            if !self.active || hdr.seq_id != self.next_seq || !same_msg {
                return self.reject(hdr, "out of order");
            }
        }

        let off = hdr.seq_id as usize * MBOX_SEG_LEN;
        let end = off + seg_len;
        if end > hdr.msg_len as usize {
            return self.reject(hdr, "segment past message end");
        }
        self.buf.truncate(off);
        self.buf.extend_from_slice(&body[..seg_len]);
        self.next_seq = hdr.seq_id + 1;

        if !hdr.last {
            if seg_len != MBOX_SEG_LEN {
                return self.reject(hdr, "short segment before the last");
            }
            return None;
        }
        if end != hdr.msg_len as usize {
            return self.reject(hdr, "length mismatch");
        }
        let data = std::mem::take(&mut self.buf);
        let header = *hdr;
        self.reset();
        Some(Message { header, data })
    }
}

/// Per-VF random ids.
struct RandIdTable {
    cur: Vec<u32>,
    old: Vec<u32>,
    /// Message id that already triggered a resync.
    resync_for: Vec<Option<u8>>,
}

#[derive(Default)]
struct RespSlot {
    waiting: Option<u8>,
    reply: Option<MboxReply>,
}

/// Sender side state for one destination.
#[derive(Default)]
struct Peer {
    /// One outstanding request per destination. Responses do not take it.
    send: Mutex<()>,
    resp: Mutex<RespSlot>,
    cv: Condvar,
}

enum Work {
    Request {
        role: MboxRole,
        no_ack: bool,
        req: MboxRequest,
    },
    Resync {
        func: u16,
        idx: usize,
    },
}

struct MboxInner<D: Device> {
    dev: Arc<D>,
    cfg: MboxConfig,
    func: FuncConfig,
    sync: Option<Arc<dyn RandomIdSync>>,
    handlers: Vec<CallbackTable<MboxHandler>>,
    peers: Mutex<HashMap<u16, Arc<Peer>>>,
    /// Hardware window; holds the write-back record.
    hw: Mutex<Option<DmaRegion>>,
    send_result: Mutex<Option<u32>>,
    send_cv: Condvar,
    msg_id: AtomicU8,
    rx: Mutex<HashMap<(u16, Direction), Reassembly>>,
    work: Mutex<Option<SyncSender<Work>>>,
    in_flight: Mutex<HashMap<u16, u32>>,
    rand: Mutex<RandIdTable>,
    dropped: AtomicUsize,
    resyncs: AtomicUsize,
}

/// Mailbox of one function.
pub struct Mailbox<D: Device> {
    inner: Arc<MboxInner<D>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Device> Mailbox<D> {
    /// Set up the mailbox. `sync` publishes VF random ids (PF/PPF only).
    pub fn create(
        dev: Arc<D>,
        cfg: MboxConfig,
        func: FuncConfig,
        sync: Option<Arc<dyn RandomIdSync>>,
    ) -> FwResult<Self> {
        let wb = dev.dma_alloc(mbox_wb::LEN)?;
        let nvf = func.num_vfs as usize;
        let (tx, rx) = sync_channel(WORK_QUEUE_DEPTH);

        let inner = Arc::new(MboxInner {
            dev,
            cfg,
            func,
            sync,
            handlers: MboxRole::ALL
                .iter()
                .map(|_| CallbackTable::new(MBOX_MODULES))
                .collect(),
            peers: Mutex::new(HashMap::new()),
            hw: Mutex::new(Some(wb)),
            send_result: Mutex::new(None),
            send_cv: Condvar::new(),
            msg_id: AtomicU8::new(0),
            rx: Mutex::new(HashMap::new()),
            work: Mutex::new(Some(tx)),
            in_flight: Mutex::new(HashMap::new()),
            rand: Mutex::new(RandIdTable {
                cur: vec![0; nvf],
                old: vec![0; nvf],
                resync_for: vec![None; nvf],
            }),
            dropped: AtomicUsize::new(0),
            resyncs: AtomicUsize::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(format!("fw-mbox{}", func.func_id))
            .spawn(move || worker_inner.run_worker(rx));
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                if let Some(wb) = lock(&inner.hw).take() {
                    inner.dev.dma_free(wb);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn func(&self) -> &FuncConfig {
        &self.inner.func
    }

    /// Send a request to `dst` and wait for its response.
    pub fn send_to_peer(
        &self,
        dst: u16,
        module: u8,
        cmd: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FwResult<MboxReply> {
        self.inner
            .send_request(dst, module, cmd, data, timeout.unwrap_or(self.inner.cfg.msg_timeout))
    }

    /// Send a request to `dst` without asking for a response.
    pub fn send_to_peer_no_ack(&self, dst: u16, module: u8, cmd: u8, data: &[u8]) -> FwResult<()> {
        self.inner.send_no_ack(dst, module, cmd, data)
    }

    /// Send a request from this VF to its PF.
    pub fn send_to_pf(
        &self,
        module: u8,
        cmd: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FwResult<MboxReply> {
        if self.inner.func.role != FuncRole::Vf {
            return Err(FwError::InvalidArgument("send_to_pf from a PF".into()));
        }
        self.send_to_peer(self.inner.func.pf_id, module, cmd, data, timeout)
    }

    /// Send a request to this PF's VF number `vf` (0-based).
    pub fn send_to_vf(
        &self,
        vf: u16,
        module: u8,
        cmd: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> FwResult<MboxReply> {
        let f = &self.inner.func;
        if f.role == FuncRole::Vf || vf >= f.num_vfs {
            return Err(FwError::InvalidArgument(format!("no VF {}", vf)));
        }
        self.send_to_peer(f.first_vf + vf, module, cmd, data, timeout)
    }

    /// Install the handler for messages of `module` received in `role`.
    pub fn register_callback(&self, role: MboxRole, module: u8, handler: Arc<MboxHandler>) -> FwResult<()> {
        self.inner.handlers[role.index()].register(module as usize, handler)
    }

    /// Remove a handler; returns once no invocation of it is running.
    pub fn unregister_callback(&self, role: MboxRole, module: u8) -> bool {
        self.inner.handlers[role.index()].unregister(module as usize)
    }

    /// Generate and publish a random id for every VF of this PF.
    pub fn init_vf_random_ids(&self) -> FwResult<()> {
        let inner = &self.inner;
        let Some(sync) = inner.sync.as_ref() else {
            return Err(FwError::InvalidArgument("no random id publisher".into()));
        };
        for idx in 0..inner.func.num_vfs {
            let func = inner.func.first_vf + idx;
            let id = inner.dev.random_u32();
            sync.publish_random_id(func, id)?;
            let mut t = lock(&inner.rand);
            t.cur[idx as usize] = id;
            t.old[idx as usize] = id;
            t.resync_for[idx as usize] = None;
        }
        log::info!("mailbox: random ids set for {} VFs", inner.func.num_vfs);
        Ok(())
    }

    /// Current and previous random id of VF table entry `idx`.
    pub fn vf_random_id(&self, idx: usize) -> Option<(u32, u32)> {
        let t = lock(&self.inner.rand);
        Some((*t.cur.get(idx)?, *t.old.get(idx)?))
    }

    /// Segments and requests dropped on receive.
    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Random id resyncs started.
    pub fn resyncs(&self) -> usize {
        self.inner.resyncs.load(Ordering::SeqCst)
    }

    /// Callback for mailbox segment events.
    pub fn segment_handler(&self) -> Arc<EventFn> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |data: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_segment(data);
            }
        })
    }

    /// Callback for segment send-result events.
    pub fn send_result_handler(&self) -> Arc<EventFn> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |data: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_send_result(data);
            }
        })
    }

    /// Stop the worker and release the hardware window.
    pub fn shutdown(&self) {
        lock(&self.inner.work).take();
        if let Some(w) = lock(&self.worker).take() {
            if w.join().is_err() {
                log::error!("mailbox worker panicked");
            }
        }
        if let Some(wb) = lock(&self.inner.hw).take() {
            self.inner.dev.dma_free(wb);
        }
    }
}

impl<D: Device> Drop for Mailbox<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: Device> MboxInner<D> {
    fn peer(&self, dst: u16) -> Arc<Peer> {
        Arc::clone(lock(&self.peers).entry(dst).or_default())
    }

    fn next_msg_id(&self) -> u8 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_message(&self, module: u8, data: &[u8]) -> FwResult<()> {
        if data.len() > MBOX_MAX_MSG_LEN {
            return Err(FwError::InvalidArgument(format!(
                "mailbox message of {} bytes (max {})",
                data.len(),
                MBOX_MAX_MSG_LEN
            )));
        }
        if module as usize >= MBOX_MODULES {
            return Err(FwError::InvalidArgument(format!("mailbox module {}", module)));
        }
        Ok(())
    }

    fn header(&self, module: u8, cmd: u8, msg_id: u8, len: usize) -> MboxHeader {
        MboxHeader {
            msg_len: len as u16,
            module,
            seg_len: 0,
            no_ack: false,
            seq_id: 0,
            last: false,
            direction: Direction::Send,
            cmd,
            msg_id,
            status: mbox_status::OK,
            src_func: self.func.func_id,
        }
    }

    fn send_request(
        &self,
        dst: u16,
        module: u8,
        cmd: u8,
        data: &[u8],
        timeout: Duration,
    ) -> FwResult<MboxReply> {
        self.check_message(module, data)?;
        let peer = self.peer(dst);
        let _serial = lock(&peer.send);

        let msg_id = self.next_msg_id();
        *lock(&peer.resp) = RespSlot {
            waiting: Some(msg_id),
            reply: None,
        };
        let _window = scopeguard::guard((), |_| lock(&peer.resp).waiting = None);

        let hdr = self.header(module, cmd, msg_id, data.len());
        self.send_segments(dst, hdr, data)?;

        let reply = self.wait_reply(&peer, msg_id, timeout)?;
        match reply.status {
            mbox_status::OK => Ok(reply),
            mbox_status::BUSY_ACTIVE_FW => Err(FwError::Busy),
            mbox_status::CMD_ERROR => Err(FwError::InvalidParams),
            code => Err(FwError::DeviceError { code: code as u16 }),
        }
    }

    fn send_no_ack(&self, dst: u16, module: u8, cmd: u8, data: &[u8]) -> FwResult<()> {
        self.check_message(module, data)?;
        let peer = self.peer(dst);
        let _serial = lock(&peer.send);
        let mut hdr = self.header(module, cmd, self.next_msg_id(), data.len());
        hdr.no_ack = true;
        self.send_segments(dst, hdr, data)
    }

    fn wait_reply(&self, peer: &Peer, msg_id: u8, timeout: Duration) -> FwResult<MboxReply> {
        let start = Instant::now();
        let mut slot = lock(&peer.resp);
        loop {
            if let Some(reply) = slot.reply.take() {
                return Ok(reply);
            }
            if self.dev.is_fatal() {
                return Err(FwError::DeviceFatal);
            }
            let Some(step) = self.cfg.backoff.sleep_for(start.elapsed(), timeout) else {
                log::warn!("mailbox: no response to msg {} within {:?}", msg_id, timeout);
                return Err(FwError::Timeout {
                    req_type: 0,
                    seq: msg_id as u16,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    resp_len: 0,
                    valid: 0,
                });
            };
            slot = match peer.cv.wait_timeout(slot, step) {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn send_segments(&self, dst: u16, mut hdr: MboxHeader, data: &[u8]) -> FwResult<()> {
        let nsegs = data.len().div_ceil(MBOX_SEG_LEN).max(1);
        for seq in 0..nsegs {
            let off = seq * MBOX_SEG_LEN;
            let seg = &data[off.min(data.len())..(off + MBOX_SEG_LEN).min(data.len())];
            hdr.seq_id = seq as u8;
            hdr.seg_len = seg.len() as u8;
            hdr.last = seq + 1 == nsegs;
            self.send_segment(dst, &hdr, seg)?;
        }
        Ok(())
    }

    fn send_segment(&self, dst: u16, hdr: &MboxHeader, seg: &[u8]) -> FwResult<()> {
        let hw = lock(&self.hw);
        let Some(wb) = hw.as_ref() else {
            return Err(FwError::InvalidArgument("mailbox is shut down".into()));
        };
        if self.dev.is_fatal() {
            return Err(FwError::DeviceFatal);
        }

        // Status of an earlier segment must not satisfy this one
        wb.fill(0, mbox_wb::LEN, 0);
        *lock(&self.send_result) = None;

        let mut window = [0u8; SEG_WINDOW_LEN];
        window[..MBOX_HEADER_LEN].copy_from_slice(&hdr.pack().to_le_bytes());
        window[MBOX_HEADER_LEN..MBOX_HEADER_LEN + seg.len()].copy_from_slice(seg);
        for (i, w) in window.chunks_exact(4).enumerate() {
            self.dev
                .write32(MBOX_DATA + (i * 4) as u32, u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        }

        let mut attr = (dst as u32 & MBOX_ATTR_DST_MASK)
            | (((SEG_WINDOW_LEN / 4) as u32) << MBOX_ATTR_DWORDS_SHIFT);
        if self.cfg.ack_mode == AckMode::Event {
            attr |= MBOX_ATTR_EVENT_ACK;
        }
        self.dev.write32(MBOX_WB_LO, wb.bus() as u32);
        self.dev.write32(MBOX_WB_HI, (wb.bus() >> 32) as u32);
        self.dev.write32(MBOX_ATTR, attr);
        fence(Ordering::Release);
        self.dev.write32(MBOX_TRIGGER, 1);

        let status = match self.cfg.ack_mode {
            AckMode::Poll => self.poll_wb(wb, hdr)?,
            AckMode::Event => self.wait_send_result(hdr)?,
        };
        let err = ((status >> mbox_wb::ERR_SHIFT) & mbox_wb::ERR_MASK) as u16;
        if err != 0 {
            log::warn!(
                "mailbox: segment {} of msg {} to {} failed: {:#x}",
                hdr.seq_id,
                hdr.msg_id,
                dst,
                err
            );
            return Err(FwError::DeviceError { code: err });
        }
        Ok(())
    }

    fn seg_timeout(&self, hdr: &MboxHeader, start: Instant, status: u32) -> FwError {
        log::error!(
            "mailbox: segment {} of msg {} not acknowledged (status {:#x})",
            hdr.seq_id,
            hdr.msg_id,
            status
        );
        FwError::Timeout {
            req_type: ((hdr.module as u16) << 8) | hdr.cmd as u16,
            seq: hdr.seq_id as u16,
            elapsed_ms: start.elapsed().as_millis() as u64,
            resp_len: 0,
            valid: status as u8,
        }
    }

    /// Wait for a finished write-back record with a matching checksum.
    fn poll_wb(&self, wb: &DmaRegion, hdr: &MboxHeader) -> FwResult<u32> {
        let start = Instant::now();
        loop {
            if self.dev.is_fatal() {
                return Err(FwError::DeviceFatal);
            }
            let status = wb.read_u32(0);
            if status & mbox_wb::DONE_MASK == mbox_wb::DONE {
                fence(Ordering::Acquire);
                if wb.read_u32(4) == mbox_wb::checksum(status) {
                    return Ok(status);
                }
                log::trace!("mailbox: write-back checksum not settled");
            }
            match self.cfg.backoff.sleep_for(start.elapsed(), self.cfg.seg_timeout) {
                Some(d) => std::thread::sleep(d),
                None => return Err(self.seg_timeout(hdr, start, status)),
            }
        }
    }

    fn wait_send_result(&self, hdr: &MboxHeader) -> FwResult<u32> {
        let start = Instant::now();
        let mut slot = lock(&self.send_result);
        loop {
            if let Some(status) = slot.take() {
                return Ok(status);
            }
            if self.dev.is_fatal() {
                return Err(FwError::DeviceFatal);
            }
            let Some(step) = self.cfg.backoff.sleep_for(start.elapsed(), self.cfg.seg_timeout) else {
                return Err(self.seg_timeout(hdr, start, 0));
            };
            slot = match self.send_cv.wait_timeout(slot, step) {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn on_send_result(&self, data: &[u8]) {
        let Some(b) = data.get(..4) else {
            log::warn!("mailbox: short send-result event");
            return;
        };
        *lock(&self.send_result) = Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        self.send_cv.notify_all();
    }

    fn drop_segment(&self, why: std::fmt::Arguments<'_>) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
        log::warn!("mailbox: {}", why);
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    fn on_segment(&self, elem: &[u8]) {
        if elem.len() < MBOX_HEADER_LEN {
            self.drop_segment(format_args!("truncated segment ({} bytes)", elem.len()));
            return;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&elem[..MBOX_HEADER_LEN]);
        let hdr = MboxHeader::unpack(u64::from_le_bytes(raw));
        let src = hdr.src_func;

        if self.func.role != FuncRole::Vf && !self.func.is_pf_id(src) {
            let token = elem
                .get(MBOX_TOKEN_OFF..MBOX_TOKEN_OFF + 4)
                .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
            if !self.check_token(src, hdr.msg_id, token) {
                lock(&self.rx).remove(&(src, hdr.direction));
                return;
            }
        }

        let body = &elem[MBOX_HEADER_LEN..elem.len().min(MBOX_TOKEN_OFF)];
        let msg = {
            let mut rx = lock(&self.rx);
            rx.entry((src, hdr.direction)).or_default().feed(&hdr, body)
        };
        let Some(msg) = msg else {
            return;
        };

        match msg.header.direction {
            Direction::Response => self.on_response(msg),
            Direction::Send => self.on_request(msg),
        }
    }

    /// Accept `token` from VF `src`, or schedule a resync and refuse it.
    fn check_token(&self, src: u16, msg_id: u8, token: u32) -> bool {
        let Some(idx) = self.func.vf_index(src) else {
            self.drop_segment(format_args!("segment from unknown function {}", src));
            return false;
        };
        {
            let mut t = lock(&self.rand);
            if token == t.cur[idx] || token == t.old[idx] {
                // A later message may reuse this id
                t.resync_for[idx] = None;
                return true;
            }
            if t.resync_for[idx] == Some(msg_id) {
                self.drop_segment(format_args!("bad token from VF {} (resync pending)", src));
                return false;
            }
            t.resync_for[idx] = Some(msg_id);
        }
        self.drop_segment(format_args!("bad token from VF {} msg {}", src, msg_id));
        self.enqueue(Work::Resync { func: src, idx });
        false
    }

    fn on_response(&self, msg: Message) {
        let src = msg.header.src_func;
        let peer = lock(&self.peers).get(&src).cloned();
        let Some(peer) = peer else {
            self.drop_segment(format_args!("response from {} nobody asked for", src));
            return;
        };
        let mut slot = lock(&peer.resp);
        if slot.waiting != Some(msg.header.msg_id) || slot.reply.is_some() {
            drop(slot);
            self.drop_segment(format_args!(
                "late or mismatched response from {} (msg {})",
                src, msg.header.msg_id
            ));
            return;
        }
        slot.reply = Some(MboxReply {
            msg_id: msg.header.msg_id,
            status: msg.header.status,
            data: msg.data,
        });
        drop(slot);
        peer.cv.notify_all();
    }

    fn role_for(&self, src: u16) -> Option<MboxRole> {
        let f = &self.func;
        match f.role {
            FuncRole::Vf => (src == f.pf_id).then_some(MboxRole::VfFromPf),
            _ if !f.is_pf_id(src) => Some(MboxRole::PfFromVf),
            FuncRole::Ppf => Some(MboxRole::PpfFromPf),
            FuncRole::Pf => (src == f.ppf_id).then_some(MboxRole::PfFromPpf),
        }
    }

    fn on_request(&self, msg: Message) {
        let src = msg.header.src_func;
        let Some(role) = self.role_for(src) else {
            self.drop_segment(format_args!("request from unexpected function {}", src));
            return;
        };

        {
            let mut in_flight = lock(&self.in_flight);
            let n = in_flight.entry(src).or_insert(0);
            if *n >= self.cfg.max_in_flight {
                drop(in_flight);
                self.drop_segment(format_args!("too many requests in flight from {}", src));
                return;
            }
            *n += 1;
        }

        let req = MboxRequest {
            src,
            module: msg.header.module,
            cmd: msg.header.cmd,
            msg_id: msg.header.msg_id,
            data: msg.data,
        };
        if !self.enqueue(Work::Request {
            role,
            no_ack: msg.header.no_ack,
            req,
        }) {
            self.request_done(src);
        }
    }

    fn request_done(&self, src: u16) {
        if let Some(n) = lock(&self.in_flight).get_mut(&src) {
            *n = n.saturating_sub(1);
        }
    }

    fn enqueue(&self, work: Work) -> bool {
        let work_tx = lock(&self.work);
        let Some(tx) = work_tx.as_ref() else {
            return false;
        };
        match tx.try_send(work) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                drop(work_tx);
                self.drop_segment(format_args!("{}", FwError::QueueFull));
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    fn run_worker(&self, rx: Receiver<Work>) {
        while let Ok(work) = rx.recv() {
            match work {
                Work::Request { role, no_ack, req } => {
                    self.handle_request(role, no_ack, &req);
                    self.request_done(req.src);
                }
                Work::Resync { func, idx } => self.resync(func, idx),
            }
        }
    }

    fn handle_request(&self, role: MboxRole, no_ack: bool, req: &MboxRequest) {
        let mut out = Vec::new();
        let result = self.handlers[role.index()].invoke(req.module as usize, |h| h(req, &mut out));
        let mut status = match result {
            Some(Ok(())) => mbox_status::OK,
            Some(Err(FwError::Busy)) => mbox_status::BUSY_ACTIVE_FW,
            Some(Err(e)) => {
                log::debug!("mailbox: module {} cmd {} failed: {}", req.module, req.cmd, e);
                mbox_status::CMD_ERROR
            }
            None => {
                log::warn!("mailbox: no {:?} handler for module {}", role, req.module);
                mbox_status::CMD_ERROR
            }
        };
        if no_ack {
            return;
        }
        if out.len() > MBOX_MAX_MSG_LEN {
            log::warn!("mailbox: response of {} bytes truncated", out.len());
            out.clear();
            status = mbox_status::CMD_ERROR;
        }

        // Not under the peer's send lock: a local sender may hold it while
        // it waits on this same peer
        let mut hdr = self.header(req.module, req.cmd, req.msg_id, out.len());
        hdr.direction = Direction::Response;
        hdr.no_ack = true;
        hdr.status = status;
        if let Err(e) = self.send_segments(req.src, hdr, &out) {
            log::warn!("mailbox: response to {} msg {} failed: {}", req.src, req.msg_id, e);
        }
    }

    /// Give VF `func` a new random id.
    fn resync(&self, func: u16, idx: usize) {
        let Some(sync) = self.sync.as_ref() else {
            return;
        };
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        let id = self.dev.random_u32();
        let prev = {
            let mut t = lock(&self.rand);
            let prev = (t.cur[idx], t.old[idx]);
            t.old[idx] = t.cur[idx];
            t.cur[idx] = id;
            prev
        };
        match sync.publish_random_id(func, id) {
            Ok(()) => log::info!("mailbox: random id of VF {} refreshed", func),
            Err(e) => {
                log::warn!("mailbox: random id resync for VF {} failed: {}", func, e);
                let mut t = lock(&self.rand);
                t.cur[idx] = prev.0;
                t.old[idx] = prev.1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EqConfig;
    use crate::eq::EventQueue;
    use crate::registry::EventRegistry;
    use crate::sim::{SimDevice, SimFabric};
    use crate::wire::aeq_event;
    use std::sync::atomic::AtomicBool;

    fn seg(msg_id: u8, seq: u8, seg_len: u8, last: bool, msg_len: u16) -> MboxHeader {
        MboxHeader {
            msg_len,
            module: 1,
            seg_len,
            no_ack: false,
            seq_id: seq,
            last,
            direction: Direction::Send,
            cmd: 2,
            msg_id,
            status: 0,
            src_func: 7,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn chunk(p: &[u8], seq: usize) -> &[u8] {
        &p[seq * MBOX_SEG_LEN..((seq + 1) * MBOX_SEG_LEN).min(p.len())]
    }

    #[test]
    fn test_reassembly_in_order() {
        let p = payload(130);
        let mut r = Reassembly::default();
        assert_eq!(r.feed(&seg(5, 0, 48, false, 130), chunk(&p, 0)), None);
        assert_eq!(r.feed(&seg(5, 1, 48, false, 130), chunk(&p, 1)), None);
        let msg = r.feed(&seg(5, 2, 34, true, 130), chunk(&p, 2)).unwrap();
        assert_eq!(msg.data, p);
        assert_eq!(msg.header.msg_id, 5);
    }

    #[test]
    fn test_reassembly_out_of_order_resets() {
        let p = payload(4 * 48);
        let mut r = Reassembly::default();
        assert_eq!(r.feed(&seg(1, 0, 48, false, 192), chunk(&p, 0)), None);
        assert_eq!(r.feed(&seg(1, 1, 48, false, 192), chunk(&p, 1)), None);
        // 3 before 2
        assert_eq!(r.feed(&seg(1, 3, 48, true, 192), chunk(&p, 3)), None);
        assert_eq!(r.feed(&seg(1, 2, 48, false, 192), chunk(&p, 2)), None);
        assert!(!r.active);

        // Next well-ordered message from the same sender goes through
        let q = payload(60);
        assert_eq!(r.feed(&seg(2, 0, 48, false, 60), chunk(&q, 0)), None);
        let msg = r.feed(&seg(2, 1, 12, true, 60), chunk(&q, 1)).unwrap();
        assert_eq!(msg.data, q);
    }

    #[test]
    fn test_reassembly_limits() {
        let mut r = Reassembly::default();
        let body = [0u8; 48];
        // Oversized segment
        assert_eq!(r.feed(&seg(1, 0, 49, true, 49), &[0u8; 49]), None);
        // Sequence id past the maximum
        assert_eq!(r.feed(&seg(1, MBOX_SEQ_ID_MAX + 1, 48, true, 2040), &body), None);
        // Continuation without a start
        assert_eq!(r.feed(&seg(1, 1, 48, false, 96), &body), None);
        // Segment from a different message id mid-stream
        assert_eq!(r.feed(&seg(1, 0, 48, false, 96), &body), None);
        assert_eq!(r.feed(&seg(2, 1, 48, true, 96), &body), None);
        assert!(!r.active);
        // Empty message
        let msg = r.feed(&seg(3, 0, 0, true, 0), &[]).unwrap();
        assert!(msg.data.is_empty());
    }

    #[test]
    fn test_max_message_fits_sequence_space() {
        let p = payload(MBOX_MAX_MSG_LEN);
        let nsegs = MBOX_MAX_MSG_LEN.div_ceil(MBOX_SEG_LEN);
        assert_eq!(nsegs - 1, MBOX_SEQ_ID_MAX as usize);
        let mut r = Reassembly::default();
        let mut out = None;
        for s in 0..nsegs {
            let c = chunk(&p, s);
            out = r.feed(
                &seg(9, s as u8, c.len() as u8, s + 1 == nsegs, MBOX_MAX_MSG_LEN as u16),
                c,
            );
        }
        assert_eq!(out.unwrap().data, p);
    }

    // ------------------------------------------------------------------
    // Two simulated functions on one fabric
    // ------------------------------------------------------------------

    struct Node {
        _dev: Arc<SimDevice>,
        mbox: Mailbox<SimDevice>,
        _eq: EventQueue<SimDevice>,
    }

    fn node(
        fabric: &Arc<SimFabric>,
        func: FuncConfig,
        cfg: MboxConfig,
        sync: Option<Arc<dyn RandomIdSync>>,
    ) -> Node {
        let dev = SimDevice::new(func.func_id);
        fabric.attach(&dev);
        let registry = Arc::new(EventRegistry::new());
        let mbox = Mailbox::create(Arc::clone(&dev), cfg, func, sync).unwrap();
        registry
            .register_hw_event(aeq_event::MBOX_FROM_FUNC, mbox.segment_handler())
            .unwrap();
        registry
            .register_hw_event(aeq_event::MBOX_SEND_RESULT, mbox.send_result_handler())
            .unwrap();
        let eq = EventQueue::create(Arc::clone(&dev), dev.clone(), EqConfig::aeq(0, 0), registry).unwrap();
        Node { _dev: dev, mbox, _eq: eq }
    }

    fn pf(func_id: u16, role: FuncRole, num_vfs: u16) -> FuncConfig {
        FuncConfig {
            func_id,
            role,
            pf_id: func_id,
            ppf_id: 0,
            first_vf: 32,
            num_vfs,
            max_pf_funcs: 32,
        }
    }

    fn vf(func_id: u16) -> FuncConfig {
        FuncConfig {
            func_id,
            role: FuncRole::Vf,
            pf_id: 0,
            ppf_id: 0,
            first_vf: 32,
            num_vfs: 0,
            max_pf_funcs: 32,
        }
    }

    fn echo_with(out_len: usize) -> Arc<MboxHandler> {
        Arc::new(move |req: &MboxRequest, out: &mut Vec<u8>| {
            out.extend((0..out_len).map(|i| req.data.get(i).copied().unwrap_or(0xee) ^ 0xff));
            Ok(())
        })
    }

    fn run_end_to_end(mode: AckMode) {
        let fabric = SimFabric::new();
        let cfg = MboxConfig::default().with_ack_mode(mode);
        let a = node(&fabric, pf(0, FuncRole::Ppf, 0), cfg, None);
        let b = node(&fabric, pf(7, FuncRole::Pf, 0), cfg, None);

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        b.mbox
            .register_callback(
                MboxRole::PfFromPpf,
                3,
                Arc::new(move |req: &MboxRequest, out: &mut Vec<u8>| {
                    *lock(&s) = Some(req.clone());
                    out.extend_from_slice(&[0x5a; 20]);
                    Ok(())
                }),
            )
            .unwrap();

        let p = payload(130);
        let reply = a.mbox.send_to_peer(7, 3, 0x21, &p, None).unwrap();
        assert_eq!(reply.status, mbox_status::OK);
        assert_eq!(reply.data, vec![0x5a; 20]);

        let req = lock(&seen).clone().unwrap();
        assert_eq!(req.data, p);
        assert_eq!(req.src, 0);
        assert_eq!(req.cmd, 0x21);
        assert_eq!(req.msg_id, reply.msg_id);
        // 3 request segments and 1 response segment
        assert_eq!(fabric.delivered(), 4);
    }

    #[test]
    fn test_end_to_end_poll_ack() {
        run_end_to_end(AckMode::Poll);
    }

    #[test]
    fn test_end_to_end_event_ack() {
        run_end_to_end(AckMode::Event);
    }

    #[test]
    fn test_message_ids_advance() {
        let fabric = SimFabric::new();
        let cfg = MboxConfig::default();
        let a = node(&fabric, pf(0, FuncRole::Ppf, 0), cfg, None);
        let b = node(&fabric, pf(1, FuncRole::Pf, 0), cfg, None);
        b.mbox
            .register_callback(MboxRole::PfFromPpf, 0, echo_with(4))
            .unwrap();
        let r1 = a.mbox.send_to_peer(1, 0, 0, &[1, 2, 3, 4], None).unwrap();
        let r2 = a.mbox.send_to_peer(1, 0, 0, &[], None).unwrap();
        assert_eq!(r2.msg_id, r1.msg_id.wrapping_add(1));
        assert_eq!(r1.data, vec![0xfe, 0xfd, 0xfc, 0xfb]);
        assert_eq!(r2.data, vec![0x11; 4]);
    }

    #[test]
    fn test_simultaneous_cross_requests() {
        let fabric = SimFabric::new();
        let cfg = MboxConfig::default();
        let a = node(&fabric, pf(0, FuncRole::Ppf, 0), cfg, None);
        let b = node(&fabric, pf(1, FuncRole::Pf, 0), cfg, None);
        let slow = |tag: u8| -> Arc<MboxHandler> {
            Arc::new(move |_: &MboxRequest, out: &mut Vec<u8>| {
                std::thread::sleep(Duration::from_millis(50));
                out.push(tag);
                Ok(())
            })
        };
        a.mbox.register_callback(MboxRole::PpfFromPf, 5, slow(0xa)).unwrap();
        b.mbox.register_callback(MboxRole::PfFromPpf, 5, slow(0xb)).unwrap();

        let timeout = Some(Duration::from_millis(500));
        let (ab, ba) = std::thread::scope(|s| {
            let ab = s.spawn(|| a.mbox.send_to_peer(1, 5, 0, &payload(100), timeout));
            let ba = s.spawn(|| b.mbox.send_to_peer(0, 5, 0, &payload(100), timeout));
            (ab.join().unwrap(), ba.join().unwrap())
        });
        assert_eq!(ab.unwrap().data, vec![0xb]);
        assert_eq!(ba.unwrap().data, vec![0xa]);
    }

    #[test]
    fn test_handler_status_codes() {
        let fabric = SimFabric::new();
        let cfg = MboxConfig::default();
        let a = node(&fabric, pf(0, FuncRole::Ppf, 0), cfg, None);
        let b = node(&fabric, pf(1, FuncRole::Pf, 0), cfg, None);
        b.mbox
            .register_callback(
                MboxRole::PfFromPpf,
                2,
                Arc::new(|_: &MboxRequest, _: &mut Vec<u8>| Err(FwError::Busy)),
            )
            .unwrap();

        assert!(matches!(
            a.mbox.send_to_peer(1, 2, 0, &[0], None),
            Err(FwError::Busy)
        ));
        // No handler for module 4
        assert!(matches!(
            a.mbox.send_to_peer(1, 4, 0, &[0], None),
            Err(FwError::InvalidParams)
        ));
        assert!(b.mbox.unregister_callback(MboxRole::PfFromPpf, 2));
        assert!(matches!(
            a.mbox.send_to_peer(1, 2, 0, &[0], None),
            Err(FwError::InvalidParams)
        ));
    }

    #[test]
    fn test_argument_checks() {
        let fabric = SimFabric::new();
        let a = node(&fabric, pf(0, FuncRole::Ppf, 1), MboxConfig::default(), None);
        let big = vec![0u8; MBOX_MAX_MSG_LEN + 1];
        assert!(matches!(
            a.mbox.send_to_peer(1, 0, 0, &big, None),
            Err(FwError::InvalidArgument(_))
        ));
        assert!(matches!(
            a.mbox.send_to_peer(1, 32, 0, &[], None),
            Err(FwError::InvalidArgument(_))
        ));
        assert!(a.mbox.send_to_pf(0, 0, &[], None).is_err());
        assert!(a.mbox.send_to_vf(1, 0, 0, &[], None).is_err());
        // Peer not attached: write-back reports the failure
        assert!(matches!(
            a.mbox.send_to_peer(9, 0, 0, &[1], None),
            Err(FwError::DeviceError { code: 1 })
        ));
    }

    #[test]
    fn test_no_ack_and_in_flight_limit() {
        let fabric = SimFabric::new();
        let cfg = MboxConfig::default().with_max_in_flight(2);
        let a = node(&fabric, pf(0, FuncRole::Ppf, 0), cfg, None);
        let b = node(&fabric, pf(1, FuncRole::Pf, 0), cfg, None);

        let gate = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));
        let (g, h) = (Arc::clone(&gate), Arc::clone(&handled));
        b.mbox
            .register_callback(
                MboxRole::PfFromPpf,
                1,
                Arc::new(move |_: &MboxRequest, _: &mut Vec<u8>| {
                    while !g.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        for i in 0..4u8 {
            a.mbox.send_to_peer_no_ack(1, 1, 0, &[i]).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while b.mbox.dropped() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(b.mbox.dropped(), 2);

        gate.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while handled.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handled.load(Ordering::SeqCst), 2);
        // No responses were sent
        assert_eq!(fabric.delivered(), 4);
    }

    /// Publishes random ids straight into the fabric.
    struct FabricSync {
        fabric: Arc<SimFabric>,
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl RandomIdSync for FabricSync {
        fn publish_random_id(&self, func: u16, id: u32) -> FwResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FwError::Busy);
            }
            self.fabric.set_random_id(func, id);
            Ok(())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_vf_token_check_and_single_resync() {
        let fabric = SimFabric::new();
        let sync = Arc::new(FabricSync {
            fabric: Arc::clone(&fabric),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let cfg = MboxConfig::default();
        let p = node(&fabric, pf(0, FuncRole::Ppf, 2), cfg, Some(sync.clone() as Arc<dyn RandomIdSync>));
        let v = node(&fabric, vf(32), cfg, None);
        p.mbox
            .register_callback(MboxRole::PfFromVf, 1, echo_with(2))
            .unwrap();

        p.mbox.init_vf_random_ids().unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 2);
        let (cur, old) = p.mbox.vf_random_id(0).unwrap();
        assert_eq!(cur, old);
        assert_eq!(fabric.random_id(32), Some(cur));

        // Genuine token
        assert!(v.mbox.send_to_pf(1, 0, &[1], None).is_ok());

        // Forged token on a 3-segment message: dropped, one resync
        fabric.spoof_token(32, Some(cur ^ 0xdead_beef));
        let short = Some(Duration::from_millis(100));
        assert!(matches!(
            v.mbox.send_to_pf(1, 0, &payload(130), short),
            Err(FwError::Timeout { .. })
        ));
        assert!(wait_for(|| p.mbox.resyncs() == 1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(p.mbox.resyncs(), 1);
        assert_eq!(p.mbox.dropped(), 3);

        let (new_cur, new_old) = p.mbox.vf_random_id(0).unwrap();
        assert_eq!(new_old, cur);
        assert_ne!(new_cur, cur);

        // Previous token is still accepted
        fabric.spoof_token(32, Some(cur));
        assert!(v.mbox.send_to_pf(1, 0, &[2], None).is_ok());
        // And the current one
        fabric.spoof_token(32, None);
        assert!(v.mbox.send_to_pf(1, 0, &[3], None).is_ok());
        assert_eq!(p.mbox.resyncs(), 1);
    }

    #[test]
    fn test_good_token_rearms_resync() {
        let fabric = SimFabric::new();
        let sync = Arc::new(FabricSync {
            fabric: Arc::clone(&fabric),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let p = node(
            &fabric,
            pf(0, FuncRole::Ppf, 1),
            MboxConfig::default(),
            Some(sync as Arc<dyn RandomIdSync>),
        );
        p.mbox.init_vf_random_ids().unwrap();
        let (cur, _) = p.mbox.vf_random_id(0).unwrap();
        let bad = cur ^ 0x5555_aaaa;
        let inner = &p.mbox.inner;

        assert!(!inner.check_token(32, 7, bad));
        assert!(wait_for(|| p.mbox.vf_random_id(0).is_some_and(|(c, _)| c != cur)));
        // Further segments of the same message do not resync again
        assert!(!inner.check_token(32, 7, bad));
        assert_eq!(p.mbox.resyncs(), 1);

        let (fresh, _) = p.mbox.vf_random_id(0).unwrap();
        assert!(inner.check_token(32, 8, fresh));
        // Message id 7 comes around again after the counter wraps
        assert!(!inner.check_token(32, 7, bad));
        assert!(wait_for(|| p.mbox.resyncs() == 2));
    }

    #[test]
    fn test_failed_resync_restores_table() {
        let fabric = SimFabric::new();
        let sync = Arc::new(FabricSync {
            fabric: Arc::clone(&fabric),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });
        let cfg = MboxConfig::default();
        let p = node(&fabric, pf(0, FuncRole::Ppf, 1), cfg, Some(sync.clone() as Arc<dyn RandomIdSync>));
        let v = node(&fabric, vf(32), cfg, None);
        p.mbox.init_vf_random_ids().unwrap();
        let before = p.mbox.vf_random_id(0).unwrap();

        sync.fail.store(true, Ordering::SeqCst);
        fabric.spoof_token(32, Some(0x1234_5678));
        let _ = v.mbox.send_to_peer_no_ack(0, 1, 0, &[1]);
        assert!(wait_for(|| sync.calls.load(Ordering::SeqCst) == 2));
        assert!(wait_for(|| p.mbox.vf_random_id(0) == Some(before)));
    }
}
