// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level session tying the transport pieces of one function together.

use crate::channel::FwChannel;
use crate::config::{FuncRole, SessionConfig};
use crate::device::{Device, IrqHost};
use crate::eq::EventQueue;
use crate::error::FwResult;
use crate::mbox::{Mailbox, RandomIdSync};
use crate::registry::EventRegistry;
use crate::wire::{aeq_event, ceq_event};
use std::sync::Arc;

/// Command channel, event queues and mailbox of one device function.
///
/// Command completions arrive on the completion queue; mailbox segments
/// and send results arrive on the async queue.
///
/// # Example
///
/// ```rust,no_run
/// use fwcmd_rust::sim::SimDevice;
/// use fwcmd_rust::{FwResult, ReqType, Session, SessionConfig};
///
/// fn main() -> FwResult<()> {
///     let dev = SimDevice::new(0);
///     let session = Session::open(dev.clone(), dev, SessionConfig::default())?;
///
///     let ch = session.channel();
///     ch.send(ch.req_init(ReqType::FUNC_RESET, 16)?)?;
///
///     session.close();
///     Ok(())
/// }
/// ```
pub struct Session<D: Device> {
    cfg: SessionConfig,
    channel: Arc<FwChannel<D>>,
    registry: Arc<EventRegistry>,
    mbox: Mailbox<D>,
    ceq: Option<EventQueue<D>>,
    aeq: Option<EventQueue<D>>,
}

impl<D: Device> Session<D> {
    /// Bring up the channel, mailbox and both event queues.
    ///
    /// A PF with VFs also publishes a random id for each of them.
    ///
    /// # Errors
    ///
    /// Returns the first failure; whatever was already set up is torn down.
    pub fn open(dev: Arc<D>, irq: Arc<dyn IrqHost>, cfg: SessionConfig) -> FwResult<Self> {
        let channel = Arc::new(FwChannel::new(Arc::clone(&dev), cfg.channel)?);
        let registry = Arc::new(EventRegistry::new());
        registry.register_completion_event(ceq_event::CMD_DONE, channel.completion_handler())?;

        let sync = (cfg.func.role != FuncRole::Vf)
            .then(|| Arc::clone(&channel) as Arc<dyn RandomIdSync>);
        let mbox = Mailbox::create(Arc::clone(&dev), cfg.mbox, cfg.func, sync)?;
        registry.register_hw_event(aeq_event::MBOX_FROM_FUNC, mbox.segment_handler())?;
        registry.register_hw_event(aeq_event::MBOX_SEND_RESULT, mbox.send_result_handler())?;

        let mut session = Self {
            cfg,
            channel,
            registry: Arc::clone(&registry),
            mbox,
            ceq: None,
            aeq: None,
        };
        session.ceq = Some(EventQueue::create(
            Arc::clone(&dev),
            Arc::clone(&irq),
            cfg.ceq,
            Arc::clone(&registry),
        )?);
        session.aeq = Some(EventQueue::create(dev, irq, cfg.aeq, registry)?);

        if cfg.func.role != FuncRole::Vf && cfg.func.num_vfs > 0 {
            session.mailbox().init_vf_random_ids()?;
        }
        log::info!(
            "session open: func {} ({:?}), aeq {} ceq {}",
            cfg.func.func_id,
            cfg.func.role,
            cfg.aeq.id,
            cfg.ceq.id
        );
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn channel(&self) -> &Arc<FwChannel<D>> {
        &self.channel
    }

    /// Register or unregister additional event callbacks here.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn mailbox(&self) -> &Mailbox<D> {
        &self.mbox
    }

    pub fn aeq(&self) -> Option<&EventQueue<D>> {
        self.aeq.as_ref()
    }

    pub fn ceq(&self) -> Option<&EventQueue<D>> {
        self.ceq.as_ref()
    }

    /// Tear everything down.
    pub fn close(self) {
        drop(self);
    }

    fn teardown(&mut self) {
        // No more events, then no more mailbox work, then no more commands
        if let Some(aeq) = self.aeq.take() {
            aeq.destroy();
        }
        if let Some(ceq) = self.ceq.take() {
            ceq.destroy();
        }
        self.registry.unregister_hw_event(aeq_event::MBOX_FROM_FUNC);
        self.registry.unregister_hw_event(aeq_event::MBOX_SEND_RESULT);
        self.registry.unregister_completion_event(ceq_event::CMD_DONE);
        self.mbox.shutdown();
        self.channel.shutdown();
        log::debug!("session closed: func {}", self.cfg.func.func_id);
    }
}

impl<D: Device> Drop for Session<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
