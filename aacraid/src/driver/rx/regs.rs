//! i960 Rx / Rocket message-unit register definitions.
//!
//! Offsets are relative to the start of the message-unit BAR.

// ═══════════════════════════════════════════════════════════════════════════
// MESSAGE UNIT
// ═══════════════════════════════════════════════════════════════════════════

/// Inbound message register 0 (POST descriptor address).
pub const IMRX0: u32 = 0x10;
/// Inbound message register 1.
pub const IMRX1: u32 = 0x14;
/// Outbound message register 0.
pub const OMRX0: u32 = 0x18;
/// Outbound message register 1.
pub const OMRX1: u32 = 0x1C;
/// Inbound doorbell register (host rings the adapter).
pub const IDR: u32 = 0x20;
/// Inbound interrupt status register.
pub const IISR: u32 = 0x24;
/// Inbound interrupt mask register.
pub const IIMR: u32 = 0x28;
/// Outbound doorbell register (adapter rings the host, write 1 to clear).
pub const ODR: u32 = 0x2C;
/// Outbound interrupt status register.
pub const OISR: u32 = 0x30;
/// Outbound interrupt mask register.
pub const OIMR: u32 = 0x34;

// ═══════════════════════════════════════════════════════════════════════════
// MAILBOXES
// ═══════════════════════════════════════════════════════════════════════════

/// Mailbox register `n` (0..=7).
#[inline]
pub const fn mailbox(n: u32) -> u32 {
    0x50 + n * 4
}

/// Firmware status word.
pub const MAILBOX7: u32 = mailbox(7);

// ═══════════════════════════════════════════════════════════════════════════
// DOORBELL BITS
// ═══════════════════════════════════════════════════════════════════════════

pub const INBOUNDDOORBELL_0: u32 = 1 << 0;
pub const INBOUNDDOORBELL_1: u32 = 1 << 1;
pub const INBOUNDDOORBELL_2: u32 = 1 << 2;
pub const INBOUNDDOORBELL_3: u32 = 1 << 3;
pub const INBOUNDDOORBELL_4: u32 = 1 << 4;
pub const INBOUNDDOORBELL_5: u32 = 1 << 5;
pub const INBOUNDDOORBELL_6: u32 = 1 << 6;

pub const OUTBOUNDDOORBELL_0: u32 = 1 << 0;
pub const OUTBOUNDDOORBELL_1: u32 = 1 << 1;
pub const OUTBOUNDDOORBELL_2: u32 = 1 << 2;
pub const OUTBOUNDDOORBELL_3: u32 = 1 << 3;
pub const OUTBOUNDDOORBELL_4: u32 = 1 << 4;

/// Adapter has printf text in the comm region.
pub const DOORBELL_PRINTF_READY: u32 = 1 << 5;
/// Host consumed the printf text.
pub const DOORBELL_PRINTF_DONE: u32 = 1 << 5;

// ═══════════════════════════════════════════════════════════════════════════
// OUTBOUND INTERRUPT MASK
// ═══════════════════════════════════════════════════════════════════════════

/// OIMR bit gating the outbound doorbell interrupt.
pub const OIMR_DOORBELL: u8 = 0x04;
/// OIMR value with every source masked.
pub const OIMR_ALL_MASKED: u8 = 0xff;
/// OIMR value with only the doorbell interrupt enabled.
pub const OIMR_DOORBELL_ONLY: u8 = 0xfb;

// ═══════════════════════════════════════════════════════════════════════════
// POST RESULTS
// ═══════════════════════════════════════════════════════════════════════════

/// Size of the buffer the firmware writes its POST text into.
pub const POST_BUFFER_SIZE: usize = 512;

/// Upper byte of a status word that carries its panic code inline.
pub const PANIC_CODE_INLINE: u32 = 0xBC00_0000;
