// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register map of the firmware interface.
//!
//! | Range             | Block                                   |
//! |-------------------|-----------------------------------------|
//! | `0x1000..0x1104`  | primary command window + doorbell       |
//! | `0x2000..0x2104`  | secondary command window + doorbell     |
//! | `0x3000..`        | event queue control, `0x100` per queue  |
//! | `0x8000..0x8050`  | mailbox data window, attributes, trigger |

use crate::reqtype::Channel;

/// Direct-write command window size in bytes.
pub const CMD_WINDOW_LEN: usize = 128;

const CMD_WINDOW_BASE: [u32; 2] = [0x1000, 0x2000];
const CMD_DOORBELL_OFF: u32 = 0x100;

/// First register of the command window for `ch`.
#[inline]
pub const fn cmd_window(ch: Channel) -> u32 {
    CMD_WINDOW_BASE[ch as usize]
}

/// Doorbell register for `ch`. Any write triggers the firmware.
#[inline]
pub const fn cmd_doorbell(ch: Channel) -> u32 {
    CMD_WINDOW_BASE[ch as usize] + CMD_DOORBELL_OFF
}

const EQ_BASE: u32 = 0x3000;
const EQ_STRIDE: u32 = 0x100;

/// Consumer index register: bits [23:0] index, bit 31 arm.
pub const EQ_CI: u32 = 0x00;
/// Queue depth in elements.
pub const EQ_DEPTH: u32 = 0x04;
/// Element size in bytes.
pub const EQ_ELEM_SIZE: u32 = 0x08;
/// Page size in bytes.
pub const EQ_PAGE_SIZE: u32 = 0x0c;
/// Interrupt vector.
pub const EQ_VECTOR: u32 = 0x10;
/// Queue kind: 0 async, 1 completion.
pub const EQ_KIND: u32 = 0x14;
/// Page bus addresses, low/high word pairs.
pub const EQ_PAGE_ADDR: u32 = 0x20;

/// Maximum pages per queue addressable through the control block.
pub const EQ_MAX_PAGES: usize = 8;

/// Arm bit in the consumer index register.
pub const EQ_CI_ARM: u32 = 1 << 31;
/// Index mask in the consumer index register.
pub const EQ_CI_MASK: u32 = 0x00ff_ffff;

/// Address of register `reg` of event queue `q`.
#[inline]
pub const fn eq_reg(q: u16, reg: u32) -> u32 {
    EQ_BASE + q as u32 * EQ_STRIDE + reg
}

/// Address of the low word of page `page` of event queue `q`.
#[inline]
pub const fn eq_page_lo(q: u16, page: usize) -> u32 {
    eq_reg(q, EQ_PAGE_ADDR + page as u32 * 8)
}

/// Address of the high word of page `page` of event queue `q`.
#[inline]
pub const fn eq_page_hi(q: u16, page: usize) -> u32 {
    eq_page_lo(q, page) + 4
}

/// Mailbox data window (header + segment + reserved token word).
pub const MBOX_DATA: u32 = 0x8000;
/// Mailbox data window size in bytes.
pub const MBOX_DATA_LEN: usize = 64;
/// Transmit attributes: [12:0] destination, [20:16] dword count, bit 24 event ack.
pub const MBOX_ATTR: u32 = 0x8040;
/// Trigger register. Any write starts the transfer.
pub const MBOX_TRIGGER: u32 = 0x8044;
/// Write-back status bus address, low word.
pub const MBOX_WB_LO: u32 = 0x8048;
/// Write-back status bus address, high word.
pub const MBOX_WB_HI: u32 = 0x804c;

pub const MBOX_ATTR_DST_MASK: u32 = 0x1fff;
pub const MBOX_ATTR_DWORDS_SHIFT: u32 = 16;
pub const MBOX_ATTR_DWORDS_MASK: u32 = 0x1f;
pub const MBOX_ATTR_EVENT_ACK: u32 = 1 << 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_registers() {
        assert_eq!(cmd_window(Channel::Primary), 0x1000);
        assert_eq!(cmd_doorbell(Channel::Primary), 0x1100);
        assert_eq!(cmd_window(Channel::Secondary), 0x2000);
        assert_eq!(cmd_doorbell(Channel::Secondary), 0x2100);
        // Doorbell sits past the end of the window
        assert!(cmd_doorbell(Channel::Primary) >= cmd_window(Channel::Primary) + CMD_WINDOW_LEN as u32);
    }

    #[test]
    fn test_eq_registers() {
        assert_eq!(eq_reg(0, EQ_CI), 0x3000);
        assert_eq!(eq_reg(2, EQ_DEPTH), 0x3204);
        assert_eq!(eq_page_lo(1, 0), 0x3120);
        assert_eq!(eq_page_hi(1, 3), 0x313c);
        // Page table must not spill into the next queue's block
        assert!(eq_page_hi(0, EQ_MAX_PAGES - 1) < eq_reg(1, EQ_CI));
    }
}
