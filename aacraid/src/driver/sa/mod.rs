//! StrongARM (sa) transport.
//!
//! Same logical protocol as `rx`, different register file: the host rings
//! the secondary doorbell, the adapter answers on the primary one, and the
//! primary mask is driven through separate set/clear registers.

pub mod regs;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use log::{error, warn};

use super::traits::{
    AdapterHealth, AdapterNotify, AdapterTransport, HostDoorbell, InterruptEvent, TransportError,
};
use crate::hw::RegisterIo;
use crate::time::{Deadline, TimeoutConfig};
use crate::types::fw_status;

fn event_bit(event: InterruptEvent) -> u16 {
    match event {
        InterruptEvent::HostNormCmdReady => regs::DOORBELL_1,
        InterruptEvent::HostNormRespReady => regs::DOORBELL_2,
        InterruptEvent::AdapNormCmdNotFull => regs::DOORBELL_3,
        InterruptEvent::AdapNormRespNotFull => regs::DOORBELL_4,
    }
}

/// StrongARM register transport.
pub struct SaTransport<R: RegisterIo> {
    io: R,
    timeouts: TimeoutConfig,
    /// Mirror of the primary mask; a set bit means masked.
    irq_mask: AtomicU16,
    sync_lock: Mutex<()>,
}

impl<R: RegisterIo> SaTransport<R> {
    pub fn new(io: R, timeouts: TimeoutConfig) -> Self {
        Self {
            io,
            timeouts,
            irq_mask: AtomicU16::new(
                regs::DOORBELL_1 | regs::DOORBELL_2 | regs::DOORBELL_3 | regs::DOORBELL_4,
            ),
            sync_lock: Mutex::new(()),
        }
    }
}

impl<R: RegisterIo> AdapterTransport for SaTransport<R> {
    fn name(&self) -> &'static str {
        "sa"
    }

    fn enable_interrupt(&self, event: InterruptEvent) {
        let bit = event_bit(event);
        self.irq_mask.fetch_and(!bit, Ordering::AcqRel);
        self.io.write16(regs::PRICLEARIRQMASK, bit);
    }

    fn disable_interrupt(&self, event: InterruptEvent) {
        let bit = event_bit(event);
        self.irq_mask.fetch_or(bit, Ordering::AcqRel);
        self.io.write16(regs::PRISETIRQMASK, bit);
    }

    fn notify(&self, event: AdapterNotify) {
        let bit = match event {
            AdapterNotify::AdapNormCmdQue => regs::DOORBELL_1,
            AdapterNotify::HostNormRespNotFull => regs::DOORBELL_4,
            AdapterNotify::AdapNormRespQue => regs::DOORBELL_2,
            AdapterNotify::HostNormCmdNotFull => regs::DOORBELL_3,
            AdapterNotify::FastIo => regs::DOORBELL_6,
            AdapterNotify::AdapPrintfDone => regs::PRINTF_DONE,
            other => {
                warn!("[aacraid] sa: no doorbell for {:?}, adapter will poll", other);
                return;
            }
        };
        self.io.write16(regs::DOORBELL_REG_S, bit);
    }

    fn sync_cmd(&self, command: u32, param: u32) -> Result<u32, TransportError> {
        let _serial = self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.io.write32(regs::mailbox(0), command);
        self.io.write32(regs::mailbox(1), param);
        for n in 2..=4 {
            self.io.write32(regs::mailbox(n), 0);
        }
        self.io.write16(regs::DOORBELL_CLR_REG_P, regs::DOORBELL_0);
        self.io.write16(regs::DOORBELL_REG_S, regs::DOORBELL_0);

        let deadline = Deadline::after(self.timeouts.sync_cmd());
        while self.io.read16(regs::DOORBELL_REG_P) & regs::DOORBELL_0 == 0 {
            if deadline.expired() {
                error!("[aacraid] sa: sync command {:#x} timed out", command);
                return Err(TransportError::SyncTimeout { command });
            }
            thread::sleep(self.timeouts.sync_poll());
        }

        self.io.write16(regs::DOORBELL_CLR_REG_P, regs::DOORBELL_0);
        Ok(self.io.read32(regs::mailbox(0)))
    }

    fn check_health(&self) -> AdapterHealth {
        let status = self.io.read32(regs::MAILBOX7);
        if status & fw_status::SELF_TEST_FAILED != 0 {
            AdapterHealth::SelfTestFailed
        } else if status & fw_status::KERNEL_PANIC != 0 {
            AdapterHealth::KernelPanic { code: None }
        } else if status & fw_status::KERNEL_UP_AND_RUNNING == 0 {
            AdapterHealth::NotUp
        } else {
            AdapterHealth::Healthy
        }
    }

    fn take_doorbell(&self) -> Option<HostDoorbell> {
        let pending = self.io.read16(regs::DOORBELL_REG_P);

        if pending & regs::PRINTF_READY != 0 {
            let value = self.io.read32(regs::mailbox(5));
            self.io.write16(regs::DOORBELL_CLR_REG_P, regs::PRINTF_READY);
            return Some(HostDoorbell::PrintfReady(value));
        }

        let live = pending & !self.irq_mask.load(Ordering::Acquire);
        let (bit, doorbell) = if live & regs::DOORBELL_1 != 0 {
            (regs::DOORBELL_1, HostDoorbell::CommandReady)
        } else if live & regs::DOORBELL_2 != 0 {
            (regs::DOORBELL_2, HostDoorbell::ResponseReady)
        } else if live & regs::DOORBELL_3 != 0 {
            (regs::DOORBELL_3, HostDoorbell::CommandNotFull)
        } else if live & regs::DOORBELL_4 != 0 {
            (regs::DOORBELL_4, HostDoorbell::ResponseNotFull)
        } else {
            return None;
        };
        self.io.write16(regs::DOORBELL_CLR_REG_P, bit);
        Some(doorbell)
    }
}
