//! Transport abstraction.
//!
//! Every adapter family exposes the same operation set (interrupt masking,
//! doorbells, synchronous mailbox commands, health) over a different register
//! layout. The protocol core only ever talks to [`AdapterTransport`].

use dma_pool::DmaError;
use thiserror::Error;

use crate::types::sync_command;

// ═══════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Host-side interrupt sources that can be masked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptEvent {
    /// Adapter posted to the host normal command queue.
    HostNormCmdReady,
    /// Adapter posted to the host normal response queue.
    HostNormRespReady,
    /// Adapter freed a slot in its normal command queue.
    AdapNormCmdNotFull,
    /// Adapter freed a slot in its normal response queue.
    AdapNormRespNotFull,
}

impl InterruptEvent {
    pub const ALL: [InterruptEvent; 4] = [
        InterruptEvent::HostNormCmdReady,
        InterruptEvent::HostNormRespReady,
        InterruptEvent::AdapNormCmdNotFull,
        InterruptEvent::AdapNormRespNotFull,
    ];
}

/// Host-to-adapter notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterNotify {
    AdapNormCmdQue,
    AdapHighCmdQue,
    AdapNormRespQue,
    AdapHighRespQue,
    HostNormCmdNotFull,
    HostHighCmdNotFull,
    HostNormRespNotFull,
    HostHighRespNotFull,
    FastIo,
    AdapPrintfDone,
}

/// An acknowledged adapter-to-host doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDoorbell {
    /// Printf text is waiting; carries `(level << 16) | length`.
    PrintfReady(u32),
    /// New entries on the host normal command queue.
    CommandReady,
    /// New entries on the host normal response queue.
    ResponseReady,
    /// The adapter command queue has room again.
    CommandNotFull,
    /// The adapter response queue has room again.
    ResponseNotFull,
}

/// Outcome of an adapter health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterHealth {
    Healthy,
    /// Firmware power-on self test failed.
    SelfTestFailed,
    /// Firmware panicked; carries the panic code when one could be read.
    KernelPanic { code: Option<u8> },
    /// Firmware kernel is not running yet.
    NotUp,
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The adapter never acknowledged a synchronous command.
    #[error("sync command {command:#x} not acknowledged")]
    SyncTimeout { command: u32 },
    /// Scratch DMA memory for a command could not be allocated.
    #[error("transport DMA allocation failed: {0}")]
    Dma(#[from] DmaError),
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// Register-level operations of one adapter family.
pub trait AdapterTransport: Send + Sync {
    /// Short family name for log messages.
    fn name(&self) -> &'static str;

    /// Unmask one interrupt source.
    fn enable_interrupt(&self, event: InterruptEvent);

    /// Mask one interrupt source.
    fn disable_interrupt(&self, event: InterruptEvent);

    /// Ring the doorbell that corresponds to `event`.
    ///
    /// Events the family has no doorbell for are logged and ignored.
    fn notify(&self, event: AdapterNotify);

    /// Run a synchronous mailbox command and return mailbox 0.
    ///
    /// Polls for the acknowledgement, so it works with interrupts masked.
    fn sync_cmd(&self, command: u32, param: u32) -> Result<u32, TransportError>;

    /// Classify the firmware status register.
    fn check_health(&self) -> AdapterHealth;

    /// Read, acknowledge and return the highest-priority pending doorbell.
    fn take_doorbell(&self) -> Option<HostDoorbell>;

    /// Mask every interrupt source.
    fn disable_all_interrupts(&self) {
        for event in InterruptEvent::ALL {
            self.disable_interrupt(event);
        }
    }

    /// Drop the adapter into its debugger.
    fn interrupt_adapter(&self) -> Result<(), TransportError> {
        self.sync_cmd(sync_command::BREAKPOINT_REQUEST, 0).map(|_| ())
    }
}
