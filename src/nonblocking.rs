// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Async wrappers for the blocking transport calls.
//!
//! Each call moves the blocking wait to tokio's blocking pool, so a command
//! that runs into its timeout does not stall the executor.

use crate::channel::FwChannel;
use crate::ctx::{FwResponse, ReqHandle};
use crate::device::Device;
use crate::error::FwResult;
use crate::mbox::{Mailbox, MboxReply};
use crate::reqtype::ReqType;
use std::sync::Arc;
use std::time::Duration;

/// Send `h` without blocking the runtime.
pub async fn send<D: Device>(ch: Arc<FwChannel<D>>, h: ReqHandle) -> FwResult<()> {
    tokio::task::spawn_blocking(move || ch.send(h))
        .await
        .map_err(std::io::Error::from)?
}

impl<D: Device> FwChannel<D> {
    /// Async form of [`send`](FwChannel::send).
    pub async fn send_async(self: &Arc<Self>, h: ReqHandle) -> FwResult<()> {
        send(Arc::clone(self), h).await
    }
}

/// Build, send and collect a request carrying `body`.
pub async fn request<D: Device>(
    ch: Arc<FwChannel<D>>,
    req_type: ReqType,
    body: Vec<u8>,
) -> FwResult<FwResponse> {
    tokio::task::spawn_blocking(move || {
        let h = ch.req_init(req_type, crate::wire::REQ_HEADER_LEN + body.len())?;
        let _release = scopeguard::guard((), |_| {
            let _ = ch.req_drop(h);
        });
        ch.req_hold(&h)?;
        ch.req_write(&h, crate::wire::REQ_HEADER_LEN, &body)?;
        ch.send(h)?;
        ch.resp(&h)
    })
    .await
    .map_err(std::io::Error::from)?
}

/// Send a mailbox request and wait for the peer's response.
pub async fn send_to_peer<D: Device>(
    mbox: Arc<Mailbox<D>>,
    dst: u16,
    module: u8,
    cmd: u8,
    data: Vec<u8>,
    timeout: Option<Duration>,
) -> FwResult<MboxReply> {
    tokio::task::spawn_blocking(move || mbox.send_to_peer(dst, module, cmd, &data, timeout))
        .await
        .map_err(std::io::Error::from)?
}
