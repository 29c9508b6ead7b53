// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Wire formats shared with the firmware.
//!
//! All multi-byte fields are little endian.
//!
//! # Request header (16 bytes)
//!
//! | Offset | Size | Field      |
//! |--------|------|------------|
//! | 0      | 2    | req_type   |
//! | 2      | 2    | cmpl_ring  |
//! | 4      | 2    | seq_id     |
//! | 6      | 2    | target_id  |
//! | 8      | 8    | resp_addr  |
//!
//! # Response header (8 bytes)
//!
//! | Offset | Size | Field      |
//! |--------|------|------------|
//! | 0      | 2    | error_code |
//! | 2      | 2    | req_type   |
//! | 4      | 2    | seq_id     |
//! | 6      | 2    | resp_len   |
//!
//! The last byte of a response (`resp_len - 1`) is the valid marker. The
//! firmware writes it after everything else.

use crate::error::FwError;
use bitflags::bitflags;

/// Size of the request header.
pub const REQ_HEADER_LEN: usize = 16;
/// Size of the response header.
pub const RESP_HEADER_LEN: usize = 8;
/// Value of the valid marker in a completed response.
pub const RESP_VALID_KEY: u8 = 1;
/// Completion ring value meaning "poll, no interrupt".
pub const NO_CMPL_RING: u16 = 0xffff;
/// Signature identifying a short command descriptor.
pub const SHORT_CMD_SIGNATURE: u16 = 0x4321;
/// Size of a short command descriptor.
pub const SHORT_CMD_LEN: usize = 16;

/// Request header at the front of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ReqHeader {
    pub req_type: u16,
    pub cmpl_ring: u16,
    pub seq_id: u16,
    pub target_id: u16,
    pub resp_addr: u64,
}

impl ReqHeader {
    pub fn to_bytes(&self) -> [u8; REQ_HEADER_LEN] {
        let mut b = [0u8; REQ_HEADER_LEN];
        b[0..2].copy_from_slice(&self.req_type.to_le_bytes());
        b[2..4].copy_from_slice(&self.cmpl_ring.to_le_bytes());
        b[4..6].copy_from_slice(&self.seq_id.to_le_bytes());
        b[6..8].copy_from_slice(&self.target_id.to_le_bytes());
        b[8..16].copy_from_slice(&self.resp_addr.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < REQ_HEADER_LEN {
            return None;
        }
        Some(Self {
            req_type: u16::from_le_bytes([b[0], b[1]]),
            cmpl_ring: u16::from_le_bytes([b[2], b[3]]),
            seq_id: u16::from_le_bytes([b[4], b[5]]),
            target_id: u16::from_le_bytes([b[6], b[7]]),
            resp_addr: u64::from_le_bytes(b[8..16].try_into().ok()?),
        })
    }
}

/// Byte offsets of request header fields.
pub mod req_off {
    pub const REQ_TYPE: usize = 0;
    pub const CMPL_RING: usize = 2;
    pub const SEQ_ID: usize = 4;
    pub const TARGET_ID: usize = 6;
    pub const RESP_ADDR: usize = 8;
}

/// Response header at the front of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RespHeader {
    pub error_code: u16,
    pub req_type: u16,
    pub seq_id: u16,
    pub resp_len: u16,
}

impl RespHeader {
    pub fn to_bytes(&self) -> [u8; RESP_HEADER_LEN] {
        let mut b = [0u8; RESP_HEADER_LEN];
        b[0..2].copy_from_slice(&self.error_code.to_le_bytes());
        b[2..4].copy_from_slice(&self.req_type.to_le_bytes());
        b[4..6].copy_from_slice(&self.seq_id.to_le_bytes());
        b[6..8].copy_from_slice(&self.resp_len.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < RESP_HEADER_LEN {
            return None;
        }
        Some(Self {
            error_code: u16::from_le_bytes([b[0], b[1]]),
            req_type: u16::from_le_bytes([b[2], b[3]]),
            seq_id: u16::from_le_bytes([b[4], b[5]]),
            resp_len: u16::from_le_bytes([b[6], b[7]]),
        })
    }
}

/// Byte offsets of response header fields.
pub mod resp_off {
    pub const ERROR_CODE: usize = 0;
    pub const REQ_TYPE: usize = 2;
    pub const SEQ_ID: usize = 4;
    pub const RESP_LEN: usize = 6;
}

/// Descriptor written instead of the request when the request itself does
/// not fit in the command window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ShortCmd {
    pub req_type: u16,
    pub signature: u16,
    pub target_id: u16,
    pub size: u16,
    pub req_addr: u64,
}

impl ShortCmd {
    pub fn new(req_type: u16, target_id: u16, size: u16, req_addr: u64) -> Self {
        Self {
            req_type,
            signature: SHORT_CMD_SIGNATURE,
            target_id,
            size,
            req_addr,
        }
    }

    pub fn to_bytes(&self) -> [u8; SHORT_CMD_LEN] {
        let mut b = [0u8; SHORT_CMD_LEN];
        b[0..2].copy_from_slice(&self.req_type.to_le_bytes());
        b[2..4].copy_from_slice(&self.signature.to_le_bytes());
        b[4..6].copy_from_slice(&self.target_id.to_le_bytes());
        b[6..8].copy_from_slice(&self.size.to_le_bytes());
        b[8..16].copy_from_slice(&self.req_addr.to_le_bytes());
        b
    }

    /// Parse a short descriptor; `None` if the signature does not match.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < SHORT_CMD_LEN {
            return None;
        }
        let signature = u16::from_le_bytes([b[2], b[3]]);
        if signature != SHORT_CMD_SIGNATURE {
            return None;
        }
        Some(Self {
            req_type: u16::from_le_bytes([b[0], b[1]]),
            signature,
            target_id: u16::from_le_bytes([b[4], b[5]]),
            size: u16::from_le_bytes([b[6], b[7]]),
            req_addr: u64::from_le_bytes(b[8..16].try_into().ok()?),
        })
    }
}

/// Firmware error codes carried in [`RespHeader::error_code`].
pub mod fw_err {
    pub const SUCCESS: u16 = 0x0000;
    pub const FAIL: u16 = 0x0001;
    pub const INVALID_PARAMS: u16 = 0x0002;
    pub const RESOURCE_ACCESS_DENIED: u16 = 0x0003;
    pub const RESOURCE_ALLOC_ERROR: u16 = 0x0004;
    pub const INVALID_FLAGS: u16 = 0x0005;
    pub const INVALID_ENABLES: u16 = 0x0006;
    pub const UNSUPPORTED_TLV: u16 = 0x0007;
    pub const NO_BUFFER: u16 = 0x0008;
    pub const UNSUPPORTED_OPTION: u16 = 0x0009;
    pub const HOT_RESET_PROGRESS: u16 = 0x000a;
    pub const HOT_RESET_FAIL: u16 = 0x000b;
    pub const BUSY: u16 = 0x0010;
    pub const RESOURCE_LOCKED: u16 = 0x0011;
    pub const CMD_NOT_SUPPORTED: u16 = 0xffff;
}

/// Map a firmware error code onto the error taxonomy.
pub fn fw_status(code: u16) -> Result<(), FwError> {
    match code {
        fw_err::SUCCESS => Ok(()),
        fw_err::RESOURCE_ACCESS_DENIED | fw_err::RESOURCE_LOCKED => Err(FwError::AccessDenied),
        fw_err::RESOURCE_ALLOC_ERROR => Err(FwError::ResourceExhausted),
        fw_err::INVALID_PARAMS
        | fw_err::INVALID_FLAGS
        | fw_err::INVALID_ENABLES
        | fw_err::UNSUPPORTED_TLV
        | fw_err::UNSUPPORTED_OPTION => Err(FwError::InvalidParams),
        fw_err::NO_BUFFER => Err(FwError::FwNoMemory),
        fw_err::HOT_RESET_PROGRESS | fw_err::BUSY => Err(FwError::Busy),
        fw_err::CMD_NOT_SUPPORTED => Err(FwError::Unsupported),
        code => Err(FwError::DeviceError { code }),
    }
}

bitflags! {
    /// Async event queue element descriptor (last 4 bytes of the element).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AeqDesc: u32 {
        /// Event type, bits [6:0].
        const TYPE = 0x7f;
        /// Software-originated event.
        const SOFTWARE = 1 << 7;
        /// Payload size in bytes, bits [15:8].
        const SIZE = 0xff << 8;
        /// Producer phase.
        const PHASE = 1 << 31;
    }
}

impl AeqDesc {
    pub fn new(event: u8, software: bool, size: u8, phase: bool) -> Self {
        let mut d = Self::from_bits_retain((event as u32 & 0x7f) | ((size as u32) << 8));
        d.set(Self::SOFTWARE, software);
        d.set(Self::PHASE, phase);
        d
    }

    #[inline]
    pub fn event(self) -> u8 {
        (self.bits() & Self::TYPE.bits()) as u8
    }

    #[inline]
    pub fn size(self) -> u8 {
        ((self.bits() & Self::SIZE.bits()) >> 8) as u8
    }
}

bitflags! {
    /// Completion event queue element (one 32-bit word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CeqDesc: u32 {
        /// Event data, bits [25:0].
        const DATA = 0x03ff_ffff;
        /// Event type, bits [28:26].
        const TYPE = 0x7 << 26;
        /// Producer phase.
        const PHASE = 1 << 31;
    }
}

impl CeqDesc {
    pub fn new(event: u8, data: u32, phase: bool) -> Self {
        let mut d = Self::from_bits_retain(
            (data & Self::DATA.bits()) | (((event as u32) & 0x7) << 26),
        );
        d.set(Self::PHASE, phase);
        d
    }

    #[inline]
    pub fn event(self) -> u8 {
        ((self.bits() & Self::TYPE.bits()) >> 26) as u8
    }

    #[inline]
    pub fn data(self) -> u32 {
        self.bits() & Self::DATA.bits()
    }
}

/// Async event types raised by the device.
pub mod aeq_event {
    /// Mailbox segment from another function.
    pub const MBOX_FROM_FUNC: u8 = 1;
    /// Message from the management firmware.
    pub const MSG_FROM_MGMT: u8 = 2;
    /// Mailbox segment transmit result.
    pub const MBOX_SEND_RESULT: u8 = 5;
}

/// Completion event types.
pub mod ceq_event {
    /// Command response written; data carries channel and sequence id.
    pub const CMD_DONE: u8 = 0;
}

/// Pack a command-done completion word.
#[inline]
pub fn cmd_done_data(channel: u8, seq: u16) -> u32 {
    ((channel as u32 & 1) << 16) | seq as u32
}

/// Unpack a command-done completion word into `(channel, seq)`.
#[inline]
pub fn cmd_done_parse(data: u32) -> (u8, u16) {
    (((data >> 16) & 1) as u8, data as u16)
}

// ============================================================================
// Mailbox
// ============================================================================

/// Mailbox header size.
pub const MBOX_HEADER_LEN: usize = 8;
/// Mailbox segment payload size.
pub const MBOX_SEG_LEN: usize = 48;
/// Highest legal segment sequence id.
pub const MBOX_SEQ_ID_MAX: u8 = 42;
/// Largest logical mailbox message.
pub const MBOX_MAX_MSG_LEN: usize = 2040;
/// Offset of the sender token within a delivered mailbox element.
pub const MBOX_TOKEN_OFF: usize = MBOX_HEADER_LEN + MBOX_SEG_LEN;

/// Mailbox message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Response,
}

/// Status codes carried in mailbox responses.
pub mod mbox_status {
    pub const OK: u8 = 0;
    pub const SEND_ERR: u8 = 1;
    pub const BUSY_ACTIVE_FW: u8 = 2;
    pub const CMD_ERROR: u8 = 3;
}

/// 64-bit mailbox segment header.
///
/// | Bits    | Field    |
/// |---------|----------|
/// | 10:0    | msg_len  |
/// | 15:11   | module   |
/// | 21:16   | seg_len  |
/// | 22      | no_ack   |
/// | 29:24   | seq_id   |
/// | 30      | last     |
/// | 31      | direction (1 = response) |
/// | 39:32   | cmd      |
/// | 47:40   | msg_id   |
/// | 53:48   | status   |
/// | 63:54   | src_func |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MboxHeader {
    pub msg_len: u16,
    pub module: u8,
    pub seg_len: u8,
    pub no_ack: bool,
    pub seq_id: u8,
    pub last: bool,
    pub direction: Direction,
    pub cmd: u8,
    pub msg_id: u8,
    pub status: u8,
    pub src_func: u16,
}

impl MboxHeader {
    pub fn pack(&self) -> u64 {
        (self.msg_len as u64 & 0x7ff)
            | ((self.module as u64 & 0x1f) << 11)
            | ((self.seg_len as u64 & 0x3f) << 16)
            | ((self.no_ack as u64) << 22)
            | ((self.seq_id as u64 & 0x3f) << 24)
            | ((self.last as u64) << 30)
            | (((self.direction == Direction::Response) as u64) << 31)
            | ((self.cmd as u64) << 32)
            | ((self.msg_id as u64) << 40)
            | ((self.status as u64 & 0x3f) << 48)
            | ((self.src_func as u64 & 0x3ff) << 54)
    }

    pub fn unpack(v: u64) -> Self {
        Self {
            msg_len: (v & 0x7ff) as u16,
            module: ((v >> 11) & 0x1f) as u8,
            seg_len: ((v >> 16) & 0x3f) as u8,
            no_ack: (v >> 22) & 1 == 1,
            seq_id: ((v >> 24) & 0x3f) as u8,
            last: (v >> 30) & 1 == 1,
            direction: if (v >> 31) & 1 == 1 {
                Direction::Response
            } else {
                Direction::Send
            },
            cmd: (v >> 32) as u8,
            msg_id: (v >> 40) as u8,
            status: ((v >> 48) & 0x3f) as u8,
            src_func: ((v >> 54) & 0x3ff) as u16,
        }
    }
}

/// Mailbox write-back record: status word followed by its CRC32.
///
/// | Bits  | Field                          |
/// |-------|--------------------------------|
/// | 7:0   | done (`0xff` when finished)    |
/// | 23:8  | error code                     |
pub mod mbox_wb {
    /// Size of the write-back record in bytes.
    pub const LEN: usize = 8;
    pub const DONE: u32 = 0xff;
    pub const DONE_MASK: u32 = 0xff;
    pub const ERR_SHIFT: u32 = 8;
    pub const ERR_MASK: u32 = 0xffff;

    /// Build a finished status word with `err`.
    pub fn finished(err: u16) -> u32 {
        DONE | ((err as u32) << ERR_SHIFT)
    }

    /// Checksum the firmware stores next to `status`.
    pub fn checksum(status: u32) -> u32 {
        crc32fast::hash(&status.to_le_bytes())
    }
}

// Compile-time size checks for structures shared with the firmware
const _: () = assert!(std::mem::size_of::<ReqHeader>() == REQ_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<RespHeader>() == RESP_HEADER_LEN);
const _: () = assert!(std::mem::size_of::<ShortCmd>() == SHORT_CMD_LEN);
const _: () = assert!(MBOX_TOKEN_OFF + 4 <= 60);
// 43 segments (seq 0..=42) carry the largest message
const _: () = assert!((MBOX_SEQ_ID_MAX as usize + 1) * MBOX_SEG_LEN >= MBOX_MAX_MSG_LEN);
const _: () = assert!(MBOX_MAX_MSG_LEN < 0x800);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_header_layout() {
        let hdr = ReqHeader {
            req_type: 0x0020,
            cmpl_ring: NO_CMPL_RING,
            seq_id: 3,
            target_id: 0xffff,
            resp_addr: 0x1122_3344_5566_7788,
        };
        let b = hdr.to_bytes();
        assert_eq!(&b[0..2], &[0x20, 0x00]);
        assert_eq!(&b[req_off::SEQ_ID..req_off::SEQ_ID + 2], &[3, 0]);
        assert_eq!(b[req_off::RESP_ADDR], 0x88);
        assert_eq!(ReqHeader::from_bytes(&b), Some(hdr));
        assert_eq!(ReqHeader::from_bytes(&b[..8]), None);
    }

    #[test]
    fn test_short_cmd_signature() {
        let sc = ShortCmd::new(0x15, 0xffff, 300, 0xdead_0000);
        let b = sc.to_bytes();
        assert_eq!(ShortCmd::from_bytes(&b), Some(sc));

        // A regular request header is not mistaken for a short descriptor
        let hdr = ReqHeader {
            req_type: 0x15,
            cmpl_ring: NO_CMPL_RING,
            ..Default::default()
        };
        assert_eq!(ShortCmd::from_bytes(&hdr.to_bytes()), None);
    }

    #[test]
    fn test_fw_status_mapping() {
        assert!(fw_status(fw_err::SUCCESS).is_ok());
        assert!(matches!(
            fw_status(fw_err::RESOURCE_ACCESS_DENIED),
            Err(FwError::AccessDenied)
        ));
        assert!(matches!(
            fw_status(fw_err::RESOURCE_ALLOC_ERROR),
            Err(FwError::ResourceExhausted)
        ));
        assert!(matches!(
            fw_status(fw_err::INVALID_ENABLES),
            Err(FwError::InvalidParams)
        ));
        assert!(matches!(fw_status(fw_err::NO_BUFFER), Err(FwError::FwNoMemory)));
        assert!(matches!(fw_status(fw_err::BUSY), Err(FwError::Busy)));
        assert!(matches!(
            fw_status(fw_err::HOT_RESET_PROGRESS),
            Err(FwError::Busy)
        ));
        assert!(matches!(
            fw_status(fw_err::CMD_NOT_SUPPORTED),
            Err(FwError::Unsupported)
        ));
        assert!(matches!(
            fw_status(0x1234),
            Err(FwError::DeviceError { code: 0x1234 })
        ));
    }

    #[test]
    fn test_aeq_desc() {
        let d = AeqDesc::new(aeq_event::MBOX_FROM_FUNC, false, 60, true);
        assert_eq!(d.event(), 1);
        assert_eq!(d.size(), 60);
        assert!(d.contains(AeqDesc::PHASE));
        assert!(!d.contains(AeqDesc::SOFTWARE));

        let sw = AeqDesc::new(0x7f, true, 0, false);
        assert_eq!(sw.event(), 0x7f);
        assert!(sw.contains(AeqDesc::SOFTWARE));
        assert!(!sw.contains(AeqDesc::PHASE));
    }

    #[test]
    fn test_ceq_desc() {
        let data = cmd_done_data(1, 0xbeef);
        let d = CeqDesc::new(ceq_event::CMD_DONE, data, true);
        assert_eq!(d.event(), 0);
        assert_eq!(cmd_done_parse(d.data()), (1, 0xbeef));
        assert!(d.contains(CeqDesc::PHASE));

        let d = CeqDesc::new(5, 0x3ff_ffff, false);
        assert_eq!(d.event(), 5);
        assert_eq!(d.data(), 0x3ff_ffff);
    }

    #[test]
    fn test_mbox_header_fields() {
        let hdr = MboxHeader {
            msg_len: 130,
            module: 0x1f,
            seg_len: 34,
            no_ack: false,
            seq_id: 2,
            last: true,
            direction: Direction::Response,
            cmd: 0xa5,
            msg_id: 0xfe,
            status: mbox_status::CMD_ERROR,
            src_func: 0x3ff,
        };
        let v = hdr.pack();
        assert_eq!(v & 0x7ff, 130);
        assert_eq!((v >> 24) & 0x3f, 2);
        assert_eq!(v >> 54, 0x3ff);
        assert_eq!(MboxHeader::unpack(v), hdr);
    }

    #[test]
    fn test_mbox_wb_checksum() {
        let st = mbox_wb::finished(0);
        assert_eq!(st & mbox_wb::DONE_MASK, mbox_wb::DONE);
        assert_ne!(mbox_wb::checksum(st), mbox_wb::checksum(mbox_wb::finished(1)));
    }
}
