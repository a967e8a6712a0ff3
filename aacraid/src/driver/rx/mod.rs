//! i960 Rx / Rocket transport.
//!
//! # Sync command handshake
//! 1. Load command and parameters into mailboxes 0..=4
//! 2. Clear a stale ack, mask the doorbell interrupt
//! 3. Ring inbound doorbell 0
//! 4. Poll outbound doorbell 0 (bounded), then read status from mailbox 0
//!
//! The outbound interrupt mask is restored on both success and timeout.

pub mod regs;

use core::mem::size_of;
use core::ptr::write_volatile;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use dma_pool::DmaAllocator;
use log::{error, warn};

use super::traits::{
    AdapterHealth, AdapterNotify, AdapterTransport, HostDoorbell, InterruptEvent, TransportError,
};
use crate::hw::{sfence, RegisterIo};
use crate::time::{Deadline, TimeoutConfig};
use crate::types::{fw_status, sync_command};

/// Descriptor pointing the firmware at the POST text buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PostStatus {
    post_command: u32,
    post_address: u32,
}

/// Outbound doorbell bit for an interrupt source.
fn event_bit(event: InterruptEvent) -> u32 {
    match event {
        InterruptEvent::HostNormCmdReady => regs::OUTBOUNDDOORBELL_1,
        InterruptEvent::HostNormRespReady => regs::OUTBOUNDDOORBELL_2,
        InterruptEvent::AdapNormCmdNotFull => regs::OUTBOUNDDOORBELL_3,
        InterruptEvent::AdapNormRespNotFull => regs::OUTBOUNDDOORBELL_4,
    }
}

const ALL_EVENT_BITS: u32 = regs::OUTBOUNDDOORBELL_1
    | regs::OUTBOUNDDOORBELL_2
    | regs::OUTBOUNDDOORBELL_3
    | regs::OUTBOUNDDOORBELL_4;

/// Parse a `"0xNN"` POST string into a panic code.
fn parse_post_code(text: &[u8]) -> Option<u8> {
    match text {
        [b'0', b'x' | b'X', hi, lo, ..] => {
            let hi = (*hi as char).to_digit(16)?;
            let lo = (*lo as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        }
        _ => None,
    }
}

/// Rx/Rocket register transport.
pub struct RxTransport<R: RegisterIo> {
    io: R,
    dma: Arc<dyn DmaAllocator>,
    timeouts: TimeoutConfig,
    /// Cached outbound doorbell mask; a set bit means masked.
    irq_mask: AtomicU32,
    sync_lock: Mutex<()>,
}

impl<R: RegisterIo> RxTransport<R> {
    /// Create a transport over a mapped message unit.
    ///
    /// All interrupt sources start masked.
    pub fn new(io: R, dma: Arc<dyn DmaAllocator>, timeouts: TimeoutConfig) -> Self {
        Self {
            io,
            dma,
            timeouts,
            irq_mask: AtomicU32::new(ALL_EVENT_BITS),
            sync_lock: Mutex::new(()),
        }
    }

    /// Push the cached mask to OIMR.
    fn push_mask(&self, mask: u32) {
        let oimr = if mask & ALL_EVENT_BITS == ALL_EVENT_BITS {
            regs::OIMR_ALL_MASKED
        } else {
            regs::OIMR_DOORBELL_ONLY
        };
        self.io.write8(regs::OIMR, oimr);
    }

    /// Resolve the panic code of a panicked firmware.
    fn panic_code(&self, status: u32) -> Option<u8> {
        if status & 0xFF00_0000 == regs::PANIC_CODE_INLINE {
            return Some(((status >> 16) & 0xFF) as u8);
        }
        match self.read_post_results() {
            Ok(code) => code,
            Err(e) => {
                warn!("[aacraid] rx: POST results unavailable: {}", e);
                None
            }
        }
    }

    /// Ask the firmware to write its POST text and decode the panic code.
    fn read_post_results(&self) -> Result<Option<u8>, TransportError> {
        let buffer = self.dma.alloc_coherent(regs::POST_BUFFER_SIZE, 16)?;
        let post = match self.dma.alloc_coherent(size_of::<PostStatus>(), 16) {
            Ok(post) => post,
            Err(e) => {
                self.dma.free_coherent(buffer);
                return Err(e.into());
            }
        };

        let desc = PostStatus {
            post_command: sync_command::COMMAND_POST_RESULTS.to_le(),
            post_address: (buffer.bus_addr() as u32).to_le(),
        };
        unsafe { write_volatile(post.cpu_ptr() as *mut PostStatus, desc) };
        sfence();
        self.io.write32(regs::IMRX0, post.bus_addr() as u32);

        let result = self.sync_cmd(sync_command::COMMAND_POST_RESULTS, buffer.bus_addr() as u32);
        self.dma.free_coherent(post);

        let code = result.map(|_| {
            let text = unsafe { core::slice::from_raw_parts(buffer.cpu_ptr(), 4) };
            parse_post_code(text)
        });
        self.dma.free_coherent(buffer);
        code
    }
}

impl<R: RegisterIo> AdapterTransport for RxTransport<R> {
    fn name(&self) -> &'static str {
        "rx"
    }

    fn enable_interrupt(&self, event: InterruptEvent) {
        let mask = self.irq_mask.fetch_and(!event_bit(event), Ordering::AcqRel) & !event_bit(event);
        self.push_mask(mask);
    }

    fn disable_interrupt(&self, event: InterruptEvent) {
        let mask = self.irq_mask.fetch_or(event_bit(event), Ordering::AcqRel) | event_bit(event);
        self.push_mask(mask);
    }

    fn notify(&self, event: AdapterNotify) {
        let bit = match event {
            AdapterNotify::AdapNormCmdQue => regs::INBOUNDDOORBELL_1,
            AdapterNotify::HostNormRespNotFull => regs::INBOUNDDOORBELL_4,
            AdapterNotify::AdapNormRespQue => regs::INBOUNDDOORBELL_2,
            AdapterNotify::HostNormCmdNotFull => regs::INBOUNDDOORBELL_3,
            AdapterNotify::FastIo => regs::INBOUNDDOORBELL_6,
            AdapterNotify::AdapPrintfDone => regs::DOORBELL_PRINTF_DONE,
            other => {
                warn!("[aacraid] rx: no doorbell for {:?}, adapter will poll", other);
                return;
            }
        };
        self.io.write32(regs::IDR, bit);
    }

    fn sync_cmd(&self, command: u32, param: u32) -> Result<u32, TransportError> {
        let _serial = self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.io.write32(regs::mailbox(0), command);
        self.io.write32(regs::mailbox(1), param);
        for n in 2..=4 {
            self.io.write32(regs::mailbox(n), 0);
        }
        // Clear a stale ack
        self.io.write32(regs::ODR, regs::OUTBOUNDDOORBELL_0);

        let saved = self.io.read8(regs::OIMR);
        self.io.write8(regs::OIMR, saved | regs::OIMR_DOORBELL);
        let _ = self.io.read8(regs::OIMR);

        self.io.write32(regs::IDR, regs::INBOUNDDOORBELL_0);

        let deadline = Deadline::after(self.timeouts.sync_cmd());
        loop {
            if self.io.read32(regs::ODR) & regs::OUTBOUNDDOORBELL_0 != 0 {
                self.io.write32(regs::ODR, regs::OUTBOUNDDOORBELL_0);
                break;
            }
            if deadline.expired() {
                self.io.write8(regs::OIMR, saved);
                error!("[aacraid] rx: sync command {:#x} timed out", command);
                return Err(TransportError::SyncTimeout { command });
            }
            thread::sleep(self.timeouts.sync_poll());
        }

        let status = self.io.read32(regs::mailbox(0));
        self.io.write32(regs::ODR, regs::OUTBOUNDDOORBELL_0);
        self.io.write8(regs::OIMR, saved);
        Ok(status)
    }

    fn check_health(&self) -> AdapterHealth {
        let status = self.io.read32(regs::MAILBOX7);

        if status & fw_status::SELF_TEST_FAILED != 0 {
            return AdapterHealth::SelfTestFailed;
        }
        if status & fw_status::KERNEL_PANIC != 0 {
            return AdapterHealth::KernelPanic {
                code: self.panic_code(status),
            };
        }
        if status & fw_status::KERNEL_UP_AND_RUNNING == 0 {
            return AdapterHealth::NotUp;
        }
        AdapterHealth::Healthy
    }

    fn take_doorbell(&self) -> Option<HostDoorbell> {
        let pending = self.io.read32(regs::ODR);

        if pending & regs::DOORBELL_PRINTF_READY != 0 {
            let value = self.io.read32(regs::mailbox(5));
            self.io.write32(regs::ODR, regs::DOORBELL_PRINTF_READY);
            return Some(HostDoorbell::PrintfReady(value));
        }

        let live = pending & !self.irq_mask.load(Ordering::Acquire);
        let (bit, doorbell) = if live & regs::OUTBOUNDDOORBELL_1 != 0 {
            (regs::OUTBOUNDDOORBELL_1, HostDoorbell::CommandReady)
        } else if live & regs::OUTBOUNDDOORBELL_2 != 0 {
            (regs::OUTBOUNDDOORBELL_2, HostDoorbell::ResponseReady)
        } else if live & regs::OUTBOUNDDOORBELL_3 != 0 {
            (regs::OUTBOUNDDOORBELL_3, HostDoorbell::CommandNotFull)
        } else if live & regs::OUTBOUNDDOORBELL_4 != 0 {
            (regs::OUTBOUNDDOORBELL_4, HostDoorbell::ResponseNotFull)
        } else {
            return None;
        };
        self.io.write32(regs::ODR, bit);
        Some(doorbell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimLayout, SimRegisters};
    use dma_pool::HostDmaAllocator;
    use std::time::Duration;

    fn transport(sim: &Arc<SimRegisters>) -> RxTransport<Arc<SimRegisters>> {
        let timeouts = TimeoutConfig::new()
            .with_sync_cmd(Duration::from_millis(20))
            .with_sync_poll(Duration::from_micros(1));
        RxTransport::new(sim.clone(), Arc::new(HostDmaAllocator::new()), timeouts)
    }

    #[test]
    fn test_sync_cmd_returns_mailbox0() {
        let sim = SimRegisters::new(SimLayout::Rx);
        sim.on_sync(|cmd, params| {
            assert_eq!(params[0], 0x1234);
            Some(cmd + 1)
        });
        let rx = transport(&sim);
        sim.set8(regs::OIMR, regs::OIMR_DOORBELL_ONLY);
        assert_eq!(rx.sync_cmd(0x05, 0x1234), Ok(0x06));
        // Ack cleared and mask restored
        assert_eq!(sim.get(regs::ODR) & regs::OUTBOUNDDOORBELL_0, 0);
        assert_eq!(sim.get(regs::OIMR) as u8, regs::OIMR_DOORBELL_ONLY);
    }

    #[test]
    fn test_sync_cmd_timeout_restores_mask() {
        let sim = SimRegisters::new(SimLayout::Rx);
        sim.on_sync(|_, _| None);
        let rx = transport(&sim);
        sim.set8(regs::OIMR, regs::OIMR_DOORBELL_ONLY);
        assert_eq!(
            rx.sync_cmd(0x05, 0),
            Err(TransportError::SyncTimeout { command: 0x05 })
        );
        assert_eq!(sim.get(regs::OIMR) as u8, regs::OIMR_DOORBELL_ONLY);
    }

    #[test]
    fn test_notify_maps_doorbells() {
        let sim = SimRegisters::new(SimLayout::Rx);
        let rx = transport(&sim);
        rx.notify(AdapterNotify::AdapNormCmdQue);
        rx.notify(AdapterNotify::HostNormRespNotFull);
        rx.notify(AdapterNotify::AdapHighCmdQue);
        rx.notify(AdapterNotify::AdapPrintfDone);
        assert_eq!(
            sim.take_rung(),
            vec![
                regs::INBOUNDDOORBELL_1,
                regs::INBOUNDDOORBELL_4,
                regs::DOORBELL_PRINTF_DONE
            ]
        );
    }

    #[test]
    fn test_health_classification() {
        let sim = SimRegisters::new(SimLayout::Rx);
        let rx = transport(&sim);
        sim.set(regs::MAILBOX7, 0);
        assert_eq!(rx.check_health(), AdapterHealth::NotUp);
        sim.set(regs::MAILBOX7, fw_status::KERNEL_UP_AND_RUNNING);
        assert_eq!(rx.check_health(), AdapterHealth::Healthy);
        sim.set(regs::MAILBOX7, fw_status::SELF_TEST_FAILED | fw_status::KERNEL_UP_AND_RUNNING);
        assert_eq!(rx.check_health(), AdapterHealth::SelfTestFailed);
        sim.set(regs::MAILBOX7, 0xBC2A_0000 | fw_status::KERNEL_PANIC);
        assert_eq!(rx.check_health(), AdapterHealth::KernelPanic { code: Some(0x2A) });
    }

    #[test]
    fn test_panic_code_from_post_results() {
        let sim = SimRegisters::new(SimLayout::Rx);
        let dma = Arc::new(HostDmaAllocator::new());
        let fw_dma = dma.clone();
        sim.on_sync(move |cmd, params| {
            assert_eq!(cmd, sync_command::COMMAND_POST_RESULTS);
            let buf = fw_dma.bus_to_cpu(params[0] as u64)?;
            for (i, b) in b"0x3F".iter().enumerate() {
                unsafe { *buf.add(i) = *b };
            }
            Some(0)
        });
        let rx = RxTransport::new(sim.clone(), dma.clone(), TimeoutConfig::new());
        sim.set(regs::MAILBOX7, fw_status::KERNEL_PANIC);
        assert_eq!(rx.check_health(), AdapterHealth::KernelPanic { code: Some(0x3F) });
        assert_ne!(sim.get(regs::IMRX0), 0);
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn test_take_doorbell_honours_mask() {
        let sim = SimRegisters::new(SimLayout::Rx);
        let rx = transport(&sim);
        sim.raise_doorbell(regs::OUTBOUNDDOORBELL_2);
        assert_eq!(rx.take_doorbell(), None);

        rx.enable_interrupt(InterruptEvent::HostNormRespReady);
        assert_eq!(sim.get(regs::OIMR) as u8, regs::OIMR_DOORBELL_ONLY);
        assert_eq!(rx.take_doorbell(), Some(HostDoorbell::ResponseReady));
        assert_eq!(rx.take_doorbell(), None);

        rx.disable_all_interrupts();
        assert_eq!(sim.get(regs::OIMR) as u8, regs::OIMR_ALL_MASKED);
    }

    #[test]
    fn test_printf_doorbell_carries_mailbox5() {
        let sim = SimRegisters::new(SimLayout::Rx);
        let rx = transport(&sim);
        sim.set(regs::mailbox(5), (200 << 16) | 12);
        sim.raise_doorbell(regs::DOORBELL_PRINTF_READY);
        assert_eq!(rx.take_doorbell(), Some(HostDoorbell::PrintfReady((200 << 16) | 12)));
    }

    #[test]
    fn test_parse_post_code() {
        assert_eq!(parse_post_code(b"0xA5"), Some(0xA5));
        assert_eq!(parse_post_code(b"0Xff"), Some(0xFF));
        assert_eq!(parse_post_code(b"oops"), None);
    }
}
