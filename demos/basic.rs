// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example: commands and mailbox traffic against simulated functions.
//!
//! Run with: `cargo run --example basic`

use fwcmd_rust::sim::{CompletionMode, FwReply, FwRequest, SimDevice, SimFabric};
use fwcmd_rust::{
    ChannelConfig, FuncConfig, FuncRole, FwError, MboxRequest, MboxRole, ReqType, Session,
    SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    println!("Firmware Transport Basic Example");
    println!("================================\n");

    let fabric = SimFabric::new();
    let pf_dev = SimDevice::new(0);
    let vf_dev = SimDevice::new(32);
    fabric.attach(&pf_dev);
    fabric.attach(&vf_dev);

    pf_dev.set_firmware(|req: &FwRequest| match req.req_type() {
        ReqType::VER_GET => FwReply::ok(b"fw 1.2.3".to_vec()),
        ReqType::FUNC_RESET => FwReply::ok(Vec::new()).with_mode(CompletionMode::Hang),
        _ => FwReply::ok(Vec::new()),
    });

    // PF session
    println!("Opening PF session...");
    let mut pf_cfg = SessionConfig {
        func: FuncConfig {
            num_vfs: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    pf_cfg.channel = ChannelConfig::default()
        .with_cmpl_ring(pf_cfg.ceq.id)
        .with_timeout(Duration::from_millis(100));
    let pf = match Session::open(pf_dev.clone(), pf_dev.clone(), pf_cfg) {
        Ok(s) => s,
        Err(e) => {
            println!("  Failed to open session: {}", e);
            return;
        }
    };
    println!("  VF random ids published: {:?}", pf_dev.published_random_ids());
    println!();

    // Command with a held response
    println!("Querying firmware version...");
    let ch = pf.channel();
    let result = ch.req_init(ReqType::VER_GET, 24).and_then(|req| {
        ch.req_hold(&req)?;
        let sent = ch.send(req).and_then(|_| ch.resp(&req));
        ch.req_drop(req)?;
        sent
    });
    match result {
        Ok(resp) => println!(
            "  seq {} -> {:?}",
            resp.seq_id,
            String::from_utf8_lossy(&resp.body)
        ),
        Err(e) => println!("  Error: {}", e),
    }
    println!();

    // Command the firmware never answers
    println!("Sending a command that times out...");
    match ch.req_init(ReqType::FUNC_RESET, 16).and_then(|req| ch.send(req)) {
        Err(e @ FwError::Timeout { .. }) => println!("  {}", e),
        other => println!("  Unexpected: {:?}", other),
    }
    println!();

    // VF to PF mailbox
    println!("VF -> PF mailbox request...");
    if let Err(e) = pf.mailbox().register_callback(
        MboxRole::PfFromVf,
        2,
        Arc::new(|req: &MboxRequest, out: &mut Vec<u8>| {
            println!("  PF got {} bytes from function {}", req.data.len(), req.src);
            out.extend_from_slice(&(req.data.len() as u32).to_le_bytes());
            Ok(())
        }),
    ) {
        println!("  Failed to register handler: {}", e);
        return;
    }

    let vf_cfg = SessionConfig {
        func: FuncConfig {
            func_id: 32,
            role: FuncRole::Vf,
            ..Default::default()
        },
        ..Default::default()
    };
    let vf = match Session::open(vf_dev.clone(), vf_dev, vf_cfg) {
        Ok(s) => s,
        Err(e) => {
            println!("  Failed to open VF session: {}", e);
            return;
        }
    };
    let message = vec![0xabu8; 300];
    match vf.mailbox().send_to_pf(2, 7, &message, None) {
        Ok(reply) => println!(
            "  Reply to msg {}: status {} data {:02x?}",
            reply.msg_id, reply.status, reply.data
        ),
        Err(e) => println!("  Error: {}", e),
    }
    println!("  Segments delivered: {}", fabric.delivered());

    vf.close();
    pf.close();
    println!("\nDone.");
}
