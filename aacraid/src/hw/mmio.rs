//! MMIO (Memory-Mapped I/O) register access.
//!
//! Transports never touch raw addresses directly; they go through
//! [`RegisterIo`], so a register window can be a real BAR mapping ([`Mmio`])
//! or a simulated register file.
//!
//! # Safety
//! - Address must be valid MMIO address
//! - Address must be properly aligned
//! - Address must be mapped with appropriate attributes

use core::ptr::{read_volatile, write_volatile};
use std::sync::Arc;

/// Access to one adapter's register window, by byte offset.
pub trait RegisterIo: Send + Sync {
    /// Read 8-bit register.
    fn read8(&self, offset: u32) -> u8;
    /// Write 8-bit register.
    fn write8(&self, offset: u32, value: u8);
    /// Read 16-bit register.
    fn read16(&self, offset: u32) -> u16;
    /// Write 16-bit register.
    fn write16(&self, offset: u32, value: u16);
    /// Read 32-bit register.
    fn read32(&self, offset: u32) -> u32;
    /// Write 32-bit register.
    fn write32(&self, offset: u32, value: u32);
}

// A shared window (e.g. one register file observed by a transport and a
// firmware model) forwards to the inner implementation.
impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    #[inline]
    fn read8(&self, offset: u32) -> u8 {
        (**self).read8(offset)
    }
    #[inline]
    fn write8(&self, offset: u32, value: u8) {
        (**self).write8(offset, value)
    }
    #[inline]
    fn read16(&self, offset: u32) -> u16 {
        (**self).read16(offset)
    }
    #[inline]
    fn write16(&self, offset: u32, value: u16) {
        (**self).write16(offset, value)
    }
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }
    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value)
    }
}

/// A mapped PCI BAR.
#[derive(Debug, Clone, Copy)]
pub struct Mmio {
    base: u64,
    size: u32,
}

impl Mmio {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    /// `base..base + size` must be a valid, mapped, uncached MMIO range for
    /// as long as the returned value is used.
    pub unsafe fn new(base: u64, size: u32) -> Self {
        Self { base, size }
    }

    #[inline]
    fn addr(&self, offset: u32, width: u32) -> u64 {
        debug_assert!(offset + width <= self.size, "register {offset:#x} outside BAR");
        debug_assert!(offset % width == 0, "unaligned register {offset:#x}");
        self.base + offset as u64
    }
}

// Device registers are little-endian; convert at the boundary.
impl RegisterIo for Mmio {
    #[inline]
    fn read8(&self, offset: u32) -> u8 {
        unsafe { read_volatile(self.addr(offset, 1) as *const u8) }
    }

    #[inline]
    fn write8(&self, offset: u32, value: u8) {
        unsafe { write_volatile(self.addr(offset, 1) as *mut u8, value) }
    }

    #[inline]
    fn read16(&self, offset: u32) -> u16 {
        u16::from_le(unsafe { read_volatile(self.addr(offset, 2) as *const u16) })
    }

    #[inline]
    fn write16(&self, offset: u32, value: u16) {
        unsafe { write_volatile(self.addr(offset, 2) as *mut u16, value.to_le()) }
    }

    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        u32::from_le(unsafe { read_volatile(self.addr(offset, 4) as *const u32) })
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        unsafe { write_volatile(self.addr(offset, 4) as *mut u32, value.to_le()) }
    }
}
