// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Firmware request types and command channel classification.
//!
//! Every request starts with a 16-bit type. Most go over the primary
//! command channel; flow-offload requests go over the secondary management
//! channel when the firmware provides one.

/// Firmware request type.
///
/// Arbitrary values are allowed; the associated constants name the ones the
/// transport itself knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqType(pub u16);

impl ReqType {
    /// Query firmware interface version.
    pub const VER_GET: Self = Self(0x0000);
    /// Configure a virtual function.
    pub const FUNC_VF_CFG: Self = Self(0x000f);
    /// Reset a function.
    pub const FUNC_RESET: Self = Self(0x0011);
    /// Query function capabilities.
    pub const FUNC_QCAPS: Self = Self(0x0015);
    /// Query function configuration.
    pub const FUNC_QCFG: Self = Self(0x0016);
    /// Query port PHY configuration.
    pub const PORT_PHY_QCFG: Self = Self(0x0027);
    /// Allocate a flow.
    pub const CFA_FLOW_ALLOC: Self = Self(0x0090);
    /// Free a flow.
    pub const CFA_FLOW_FREE: Self = Self(0x0091);
    /// Flush flows.
    pub const CFA_FLOW_FLUSH: Self = Self(0x0092);
    /// Query flow statistics.
    pub const CFA_FLOW_STATS: Self = Self(0x0093);
    /// Allocate an encapsulation record.
    pub const CFA_ENCAP_RECORD_ALLOC: Self = Self(0x0094);
    /// Free an encapsulation record.
    pub const CFA_ENCAP_RECORD_FREE: Self = Self(0x0095);
    /// Allocate a decapsulation filter.
    pub const CFA_DECAP_FILTER_ALLOC: Self = Self(0x0096);
    /// Free a decapsulation filter.
    pub const CFA_DECAP_FILTER_FREE: Self = Self(0x0097);
    /// Publish a function's mailbox random id to firmware.
    pub const FUNC_MBOX_RANDOM_ID: Self = Self(0x0300);
    /// Retrieve a firmware core dump.
    pub const DBG_COREDUMP: Self = Self(0xff14);

    /// Returns the request type as a u16 value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns a human-readable name for known request types.
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x0000 => "VER_GET",
            0x000f => "FUNC_VF_CFG",
            0x0011 => "FUNC_RESET",
            0x0015 => "FUNC_QCAPS",
            0x0016 => "FUNC_QCFG",
            0x0027 => "PORT_PHY_QCFG",
            0x0090 => "CFA_FLOW_ALLOC",
            0x0091 => "CFA_FLOW_FREE",
            0x0092 => "CFA_FLOW_FLUSH",
            0x0093 => "CFA_FLOW_STATS",
            0x0094 => "CFA_ENCAP_RECORD_ALLOC",
            0x0095 => "CFA_ENCAP_RECORD_FREE",
            0x0096 => "CFA_DECAP_FILTER_ALLOC",
            0x0097 => "CFA_DECAP_FILTER_FREE",
            0x0300 => "FUNC_MBOX_RANDOM_ID",
            0xff14 => "DBG_COREDUMP",
            _ => return None,
        })
    }
}

impl From<u16> for ReqType {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for ReqType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#06x})", self.name().unwrap_or("UNKNOWN"), self.0)
    }
}

/// Command channel a request is issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Regular firmware command channel.
    Primary = 0,
    /// Out-of-band management channel for flow offload requests.
    Secondary = 1,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Primary, Channel::Secondary];
}

/// Default target: the firmware itself.
pub const TARGET_ID_DEFAULT: u16 = 0xffff;
/// Explicit target id routing a request to the secondary channel.
pub const TARGET_ID_SECONDARY: u16 = 0xfffe;

/// Request types served by the secondary channel.
const SECONDARY_TYPES: &[ReqType] = &[
    ReqType::CFA_FLOW_ALLOC,
    ReqType::CFA_FLOW_FREE,
    ReqType::CFA_FLOW_FLUSH,
    ReqType::CFA_FLOW_STATS,
    ReqType::CFA_ENCAP_RECORD_ALLOC,
    ReqType::CFA_ENCAP_RECORD_FREE,
    ReqType::CFA_DECAP_FILTER_ALLOC,
    ReqType::CFA_DECAP_FILTER_FREE,
];

/// Pick the channel for a request.
///
/// With no secondary channel available everything goes to the primary one.
pub fn classify(req_type: ReqType, target_id: u16, secondary_available: bool) -> Channel {
    if secondary_available
        && (target_id == TARGET_ID_SECONDARY || SECONDARY_TYPES.contains(&req_type))
    {
        Channel::Secondary
    } else {
        Channel::Primary
    }
}
