// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Tunables for the command channel, event queues and mailbox.

use crate::backoff::Backoff;
use crate::regs::CMD_WINDOW_LEN;
use std::time::Duration;

/// Default per-command timeout.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(500);

/// Ceiling for per-command timeouts.
pub const DEFAULT_MAX_CMD_TIMEOUT: Duration = Duration::from_secs(40);

/// Default ceiling on simultaneously live request contexts.
pub const DEFAULT_MAX_CONTEXTS: usize = 64;

/// Default async event queue geometry.
pub const DEFAULT_AEQ_DEPTH: u32 = 256;
pub const DEFAULT_AEQ_ELEM_SIZE: u32 = 64;

/// Default completion event queue geometry.
pub const DEFAULT_CEQ_DEPTH: u32 = 1024;
pub const DEFAULT_CEQ_ELEM_SIZE: u32 = 4;

/// Elements drained per deferred pass.
pub const DEFAULT_EQ_BUDGET: u32 = 256;

/// Consumer index is published every this many elements.
pub const DEFAULT_EQ_CI_STEP: u32 = 64;

/// Default mailbox message and segment timeouts.
pub const DEFAULT_MBOX_MSG_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_MBOX_SEG_TIMEOUT: Duration = Duration::from_secs(8);

/// Requests queued per source function before new ones are dropped.
pub const DEFAULT_MBOX_MAX_IN_FLIGHT: u32 = 10;

/// Command channel configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Timeout applied to new request contexts.
    pub default_timeout: Duration,
    /// Upper bound for per-request timeouts.
    pub max_timeout: Duration,
    /// Bytes the host may write directly into the command window.
    pub window_len: usize,
    /// Firmware only accepts short descriptors.
    pub short_cmd_required: bool,
    /// Firmware exposes the secondary management channel.
    pub secondary_channel: bool,
    /// Completion ring stamped into new requests; `None` polls.
    pub cmpl_ring: Option<u16>,
    pub backoff: Backoff,
    pub max_contexts: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CMD_TIMEOUT,
            max_timeout: DEFAULT_MAX_CMD_TIMEOUT,
            window_len: CMD_WINDOW_LEN,
            short_cmd_required: false,
            secondary_channel: false,
            cmpl_ring: None,
            backoff: Backoff::default(),
            max_contexts: DEFAULT_MAX_CONTEXTS,
        }
    }
}

impl ChannelConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_short_cmd(mut self, required: bool) -> Self {
        self.short_cmd_required = required;
        self
    }

    pub fn with_secondary_channel(mut self, enabled: bool) -> Self {
        self.secondary_channel = enabled;
        self
    }

    /// Complete commands through the completion queue ring `ring`.
    pub fn with_cmpl_ring(mut self, ring: u16) -> Self {
        self.cmpl_ring = Some(ring);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Event queue kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqKind {
    /// Administrative events, 64-byte elements.
    Async,
    /// Completion notifications, 4-byte elements.
    Completion,
}

/// Event queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct EqConfig {
    pub kind: EqKind,
    /// Queue index in the register block.
    pub id: u16,
    pub vector: u32,
    pub depth: u32,
    pub elem_size: u32,
    pub page_size: u32,
    /// Elements per deferred pass.
    pub budget: u32,
    /// Elements between consumer index updates.
    pub ci_step: u32,
}

impl EqConfig {
    pub fn aeq(id: u16, vector: u32) -> Self {
        Self {
            kind: EqKind::Async,
            id,
            vector,
            depth: DEFAULT_AEQ_DEPTH,
            elem_size: DEFAULT_AEQ_ELEM_SIZE,
            page_size: crate::dma::PAGE_SIZE as u32,
            budget: DEFAULT_EQ_BUDGET,
            ci_step: DEFAULT_EQ_CI_STEP,
        }
    }

    pub fn ceq(id: u16, vector: u32) -> Self {
        Self {
            kind: EqKind::Completion,
            id,
            vector,
            depth: DEFAULT_CEQ_DEPTH,
            elem_size: DEFAULT_CEQ_ELEM_SIZE,
            page_size: crate::dma::PAGE_SIZE as u32,
            budget: DEFAULT_EQ_BUDGET,
            ci_step: DEFAULT_EQ_CI_STEP,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_budget(mut self, budget: u32, ci_step: u32) -> Self {
        self.budget = budget;
        self.ci_step = ci_step;
        self
    }
}

/// How the mailbox learns that a segment left the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Poll the write-back status word.
    Poll,
    /// Wait for a send-result event.
    Event,
}

/// Mailbox configuration.
#[derive(Debug, Clone, Copy)]
pub struct MboxConfig {
    pub ack_mode: AckMode,
    /// Wait for the peer's response.
    pub msg_timeout: Duration,
    /// Wait for one segment's write-back.
    pub seg_timeout: Duration,
    /// Queued requests per source function.
    pub max_in_flight: u32,
    pub backoff: Backoff,
}

impl Default for MboxConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Poll,
            msg_timeout: DEFAULT_MBOX_MSG_TIMEOUT,
            seg_timeout: DEFAULT_MBOX_SEG_TIMEOUT,
            max_in_flight: DEFAULT_MBOX_MAX_IN_FLIGHT,
            backoff: Backoff::default(),
        }
    }
}

impl MboxConfig {
    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_msg_timeout(mut self, timeout: Duration) -> Self {
        self.msg_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, n: u32) -> Self {
        self.max_in_flight = n;
        self
    }
}

/// Role of this function in the PF/VF hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncRole {
    /// Physical function.
    Pf,
    /// Primary physical function (manages other PFs).
    Ppf,
    /// Virtual function.
    Vf,
}

/// Identity and topology of this function.
#[derive(Debug, Clone, Copy)]
pub struct FuncConfig {
    pub func_id: u16,
    pub role: FuncRole,
    /// Parent PF (meaningful for VFs).
    pub pf_id: u16,
    pub ppf_id: u16,
    /// Global id of this PF's first VF.
    pub first_vf: u16,
    pub num_vfs: u16,
    /// Function ids below this are PFs.
    pub max_pf_funcs: u16,
}

impl Default for FuncConfig {
    fn default() -> Self {
        Self {
            func_id: 0,
            role: FuncRole::Ppf,
            pf_id: 0,
            ppf_id: 0,
            first_vf: 32,
            num_vfs: 0,
            max_pf_funcs: 32,
        }
    }
}

impl FuncConfig {
    /// True if `func` is a PF or PPF.
    #[inline]
    pub fn is_pf_id(&self, func: u16) -> bool {
        func < self.max_pf_funcs
    }

    /// VF table index of global function `func`, if it is one of ours.
    pub fn vf_index(&self, func: u16) -> Option<usize> {
        let idx = func.checked_sub(self.first_vf)?;
        (idx < self.num_vfs).then_some(idx as usize)
    }
}

/// Everything needed to open a [`Session`](crate::Session).
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
    pub aeq: EqConfig,
    pub ceq: EqConfig,
    pub mbox: MboxConfig,
    pub func: FuncConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            aeq: EqConfig::aeq(0, 0),
            ceq: EqConfig::ceq(1, 1),
            mbox: MboxConfig::default(),
            func: FuncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = ChannelConfig::default();
        assert_eq!(c.default_timeout, Duration::from_millis(500));
        assert_eq!(c.max_timeout, Duration::from_secs(40));
        assert_eq!(c.window_len, 128);
        assert_eq!(c.cmpl_ring, None);

        let aeq = EqConfig::aeq(0, 0);
        assert_eq!((aeq.depth, aeq.elem_size), (256, 64));
        let ceq = EqConfig::ceq(1, 1);
        assert_eq!((ceq.depth, ceq.elem_size), (1024, 4));
        assert_eq!((ceq.budget, ceq.ci_step), (256, 64));

        let m = MboxConfig::default();
        assert_eq!(m.msg_timeout, Duration::from_secs(8));
        assert_eq!(m.max_in_flight, 10);
    }

    #[test]
    fn test_vf_index() {
        let f = FuncConfig {
            first_vf: 32,
            num_vfs: 4,
            ..Default::default()
        };
        assert!(f.is_pf_id(0));
        assert!(!f.is_pf_id(32));
        assert_eq!(f.vf_index(32), Some(0));
        assert_eq!(f.vf_index(35), Some(3));
        assert_eq!(f.vf_index(36), None);
        assert_eq!(f.vf_index(5), None);
    }
}
