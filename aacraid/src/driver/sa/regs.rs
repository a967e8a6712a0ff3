//! StrongARM (sa) doorbell register definitions.
//!
//! Doorbells are 16-bit set/clear register pairs; mailboxes are 32-bit.

/// Primary (adapter-to-host) doorbell clear, write 1 to clear.
pub const PRICLEARIRQ: u32 = 0x98;
/// Secondary (host-to-adapter) doorbell clear.
pub const SECCLEARIRQ: u32 = 0x9a;
/// Primary doorbell status/set.
pub const PRISETIRQ: u32 = 0x9c;
/// Secondary doorbell set (host rings the adapter).
pub const SECSETIRQ: u32 = 0x9e;
/// Primary interrupt mask clear (unmask).
pub const PRICLEARIRQMASK: u32 = 0xa0;
/// Secondary interrupt mask clear.
pub const SECCLEARIRQMASK: u32 = 0xa2;
/// Primary interrupt mask set (mask).
pub const PRISETIRQMASK: u32 = 0xa4;
/// Secondary interrupt mask set.
pub const SECSETIRQMASK: u32 = 0xa6;

/// Mailbox register `n` (0..=7).
#[inline]
pub const fn mailbox(n: u32) -> u32 {
    0xa8 + n * 4
}

/// Firmware status word.
pub const MAILBOX7: u32 = mailbox(7);

// Register roles
pub const DOORBELL_REG_S: u32 = SECSETIRQ;
pub const DOORBELL_REG_P: u32 = PRISETIRQ;
pub const DOORBELL_CLR_REG_P: u32 = PRICLEARIRQ;

pub const DOORBELL_0: u16 = 0x0001;
pub const DOORBELL_1: u16 = 0x0002;
pub const DOORBELL_2: u16 = 0x0004;
pub const DOORBELL_3: u16 = 0x0008;
pub const DOORBELL_4: u16 = 0x0010;
pub const DOORBELL_5: u16 = 0x0020;
pub const DOORBELL_6: u16 = 0x0040;

pub const PRINTF_READY: u16 = DOORBELL_5;
pub const PRINTF_DONE: u16 = DOORBELL_5;
