//! FIB dispatch: submission, completion and the response path.
//!
//! # FIB lifetime
//! ```text
//!   Idle ──fib_send──▶ Submitted ──response──▶ Completed
//!                          │
//!                          └──wait deadline──▶ TimedOut (parked on free)
//! ```
//!
//! Host FIBs are identified on the wire by `index << 2`; bit 0 of a
//! response address flags a fast response (status OK, payload untouched).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, warn};
use thiserror::Error;

use super::aif::AifHub;
use super::fib::{Fib, FibCallback, FibError, FibPool};
use super::printf;
use super::queue::{CommQueues, QueueId};
use super::region::CommRegion;
use crate::config::AdapterConfig;
use crate::driver::{AdapterTransport, HostDoorbell};
use crate::types::repr_c::FIB_HEADER_SIZE;
use crate::types::{command, HwFibRef, Priority, QueueEntry, XferState, FIB_MAGIC, ST_OK};

/// Response address bit marking a fast response.
const FAST_RESPONSE: u32 = 0x01;

// ═══════════════════════════════════════════════════════════════════════════
// SEND RESULTS
// ═══════════════════════════════════════════════════════════════════════════

/// Why `fib_send` refused or gave up on a FIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendErrorKind {
    /// The FIB is not host owned (already submitted?).
    #[error("FIB is not host owned")]
    Busy,
    /// Unsupported wait/reply combination.
    #[error("invalid wait/reply combination")]
    InvalidArgument,
    /// Payload plus header exceeds the FIB capacity.
    #[error("payload exceeds FIB capacity")]
    MessageTooLarge,
    /// The command queue stayed full.
    #[error("command queue full")]
    WouldBlock,
    /// No response before the wait deadline.
    #[error("no response before deadline")]
    TimedOut,
}

/// A failed send. Carries the FIB back to the caller.
#[derive(Debug, Error)]
#[error("fib_send failed: {kind}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub fib: Fib,
}

impl SendError {
    pub fn into_fib(self) -> Fib {
        self.fib
    }
}

/// A successful send.
#[derive(Debug)]
pub enum SendOutcome {
    /// Synchronous round trip done; the FIB holds the response.
    Completed(Fib),
    /// Submitted; the callback receives the FIB with the response.
    InProgress,
    /// Submitted; no response will come.
    Queued,
}

// ═══════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════

/// Per-adapter FIB counters.
#[derive(Debug, Default)]
pub struct FibStats {
    fibs_sent: AtomicU64,
    normal_sent: AtomicU64,
    async_sent: AtomicU64,
    no_response_sent: AtomicU64,
    normal_received: AtomicU64,
    async_received: AtomicU64,
    no_response_received: AtomicU64,
    aifs_received: AtomicU64,
    dropped_responses: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`FibStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FibStatsSnapshot {
    pub fibs_sent: u64,
    pub normal_sent: u64,
    pub async_sent: u64,
    pub no_response_sent: u64,
    pub normal_received: u64,
    pub async_received: u64,
    pub no_response_received: u64,
    pub aifs_received: u64,
    pub dropped_responses: u64,
    pub timeouts: u64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl FibStats {
    pub fn snapshot(&self) -> FibStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FibStatsSnapshot {
            fibs_sent: get(&self.fibs_sent),
            normal_sent: get(&self.normal_sent),
            async_sent: get(&self.async_sent),
            no_response_sent: get(&self.no_response_sent),
            normal_received: get(&self.normal_received),
            async_received: get(&self.async_received),
            no_response_received: get(&self.no_response_received),
            aifs_received: get(&self.aifs_received),
            dropped_responses: get(&self.dropped_responses),
            timeouts: get(&self.timeouts),
        }
    }

    pub(crate) fn record_aif(&self) {
        bump(&self.aifs_received);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DISPATCHER
// ═══════════════════════════════════════════════════════════════════════════

/// Protocol state of one attached adapter.
pub struct Dispatcher {
    transport: Arc<dyn AdapterTransport>,
    comm: CommRegion,
    pool: FibPool,
    config: AdapterConfig,
    stats: FibStats,
    aif: AifHub,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn AdapterTransport>,
        comm: CommRegion,
        pool: FibPool,
        config: AdapterConfig,
    ) -> Self {
        Self {
            transport,
            comm,
            pool,
            aif: AifHub::new(&config),
            config,
            stats: FibStats::default(),
        }
    }

    #[inline]
    pub fn transport(&self) -> &dyn AdapterTransport {
        self.transport.as_ref()
    }

    #[inline]
    pub fn comm(&self) -> &CommRegion {
        &self.comm
    }

    #[inline]
    pub fn queues(&self) -> &CommQueues {
        self.comm.queues()
    }

    #[inline]
    pub fn pool(&self) -> &FibPool {
        &self.pool
    }

    #[inline]
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &FibStats {
        &self.stats
    }

    #[inline]
    pub fn aif(&self) -> &AifHub {
        &self.aif
    }

    pub fn fib_alloc(&self) -> Result<Fib, FibError> {
        self.pool.alloc()
    }

    pub fn fib_init(&self, fib: &Fib) {
        self.pool.init(fib)
    }

    pub fn fib_free(&self, fib: Fib) {
        self.pool.free(fib)
    }

    /// Volatile view of a FIB's hardware half.
    pub fn hw(&self, fib: &Fib) -> HwFibRef {
        self.pool.hw(fib)
    }

    /// Submit a host FIB on the command queue of `priority`.
    ///
    /// | wait | reply | behaviour                                   |
    /// |------|-------|---------------------------------------------|
    /// | yes  | yes   | block for the response, up to the deadline  |
    /// | no   | yes   | return `InProgress`, callback gets the FIB  |
    /// | no   | no    | return `Queued`, FIB freed on completion    |
    /// | yes  | no    | `InvalidArgument`                           |
    ///
    /// An asynchronous reply without a callback is rejected, since nobody
    /// could take the FIB back. A FIB whose earlier wait timed out is
    /// `Busy` until it goes through `fib_complete`. Every error hands the
    /// FIB back untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn fib_send(
        &self,
        command: u16,
        fib: Fib,
        size: u16,
        priority: Priority,
        wait: bool,
        reply: bool,
        callback: Option<FibCallback>,
    ) -> Result<SendOutcome, SendError> {
        if self.pool.is_timed_out(fib.index()) {
            // The adapter may still answer the abandoned command.
            return Err(SendError { kind: SendErrorKind::Busy, fib });
        }

        let hw = self.pool.hw(&fib);
        let original = hw.xfer_state();

        if !original.contains(XferState::HOST_OWNED) {
            return Err(SendError { kind: SendErrorKind::Busy, fib });
        }

        let mode = match (wait, reply) {
            (true, false) => {
                return Err(SendError { kind: SendErrorKind::InvalidArgument, fib });
            }
            (false, true) if callback.is_none() => {
                return Err(SendError { kind: SendErrorKind::InvalidArgument, fib });
            }
            (false, true) => XferState::ASYNC | XferState::RESPONSE_EXPECTED,
            (false, false) => XferState::NO_RESPONSE_EXPECTED,
            (true, true) => XferState::RESPONSE_EXPECTED,
        };

        let total = FIB_HEADER_SIZE + size as usize;
        if total > hw.sender_size() as usize {
            return Err(SendError { kind: SendErrorKind::MessageTooLarge, fib });
        }

        let index = fib.index();
        hw.set_xfer_state(original | mode | XferState::SENT_FROM_HOST | priority.xfer_flag());
        hw.set_sender_fib_address(index << 2);
        hw.set_sender_data(index);
        hw.set_command(command);
        hw.set_flags(0);
        hw.set_size(total as u16);

        let queue = match priority {
            Priority::Normal => QueueId::AdapNormCmd,
            Priority::High => QueueId::AdapHighCmd,
        };
        let entry = QueueEntry {
            size: total as u32,
            addr: self.pool.hw_bus(&fib) as u32,
        };

        self.pool.completion(index).reset();
        self.pool.set_callback(&fib, if wait { None } else { callback });

        let slot = match self.queues().queue_get(queue, entry, self.config.timeouts.queue_full()) {
            Ok(slot) => slot,
            Err(e) => {
                warn!("[aacraid] fib_send: {}", e);
                hw.set_xfer_state(original);
                self.pool.set_callback(&fib, None);
                return Err(SendError { kind: SendErrorKind::WouldBlock, fib });
            }
        };

        self.queues().pending_push(queue, index);
        bump(&self.stats.fibs_sent);
        bump(match (wait, reply) {
            (true, _) => &self.stats.normal_sent,
            (false, true) => &self.stats.async_sent,
            (false, false) => &self.stats.no_response_sent,
        });

        // From here on an asynchronous FIB belongs to the response path.
        slot.insert(self.transport());

        if !wait {
            return Ok(if reply {
                SendOutcome::InProgress
            } else {
                SendOutcome::Queued
            });
        }

        if self.pool.completion(index).wait_timeout(self.config.timeouts.fib_response()) {
            Ok(SendOutcome::Completed(fib))
        } else {
            warn!("[aacraid] FIB {} command {:#x} timed out", index, command);
            bump(&self.stats.timeouts);
            self.pool.mark_timed_out(&fib);
            Err(SendError { kind: SendErrorKind::TimedOut, fib })
        }
    }

    /// Finish a host-originated FIB and return it to the pool.
    ///
    /// A FIB with a corrupt header or an unexpected state is parked rather
    /// than reused.
    pub fn fib_complete(&self, fib: Fib) -> Result<(), FibError> {
        let hw = self.pool.hw(&fib);
        let state = hw.xfer_state();

        if state.is_empty() {
            self.pool.free(fib);
            return Ok(());
        }
        if hw.struct_type() != FIB_MAGIC {
            self.pool.quarantine(fib);
            return Err(FibError::BadMagic);
        }
        if state.intersects(XferState::SENT_FROM_HOST | XferState::HOST_OWNED) {
            hw.set_raw_xfer_state(0);
            self.pool.free(fib);
            Ok(())
        } else {
            self.pool.quarantine(fib);
            Err(FibError::InvalidState { state: state.bits() })
        }
    }

    /// Acknowledge an adapter-originated FIB on the matching response queue.
    ///
    /// `size` is the payload size of the answer; zero leaves the size field
    /// as the adapter sent it.
    pub fn fib_adapter_complete(&self, hw: HwFibRef, size: u16) -> Result<(), FibError> {
        let state = hw.xfer_state();
        if state.is_empty() {
            return Ok(());
        }
        if hw.struct_type() != FIB_MAGIC {
            return Err(FibError::BadMagic);
        }
        if !state.contains(XferState::SENT_FROM_ADAPTER) {
            if state.contains(XferState::SENT_FROM_HOST) {
                // The host gave up on this FIB; nothing to answer.
                return Ok(());
            }
            warn!("[aacraid] fib_adapter_complete: unknown XferState {:#x}", state.bits());
            return Err(FibError::InvalidState { state: state.bits() });
        }

        hw.insert_xfer_state(XferState::HOST_PROCESSED);
        if size != 0 {
            let total = FIB_HEADER_SIZE + size as usize;
            let max = hw.sender_size() as usize;
            if total > max {
                return Err(FibError::MessageTooLarge { size: total, max });
            }
            hw.set_size(total as u16);
        }

        let queue = if state.contains(XferState::HIGH_PRIORITY) {
            QueueId::AdapHighResp
        } else {
            QueueId::AdapNormResp
        };
        let sender = hw.sender_fib_address();
        hw.set_receiver_fib_address(sender);
        let entry = QueueEntry {
            size: hw.size() as u32,
            addr: sender,
        };

        let slot = self.queues().queue_get(queue, entry, self.config.timeouts.queue_full())?;
        slot.insert(self.transport());
        Ok(())
    }

    /// Drain the host normal response queue.
    pub fn response_normal(&self) {
        let queues = self.queues();
        while let Some(entry) = queues.consumer_get(QueueId::HostNormResp) {
            queues.consumer_free(QueueId::HostNormResp, self.transport());
            self.complete_response(entry);
        }
    }

    fn complete_response(&self, entry: QueueEntry) {
        let fast = entry.addr & FAST_RESPONSE != 0;
        let index = entry.addr >> 2;

        let Some(hw) = self.pool.hw_at(index) else {
            error!("[aacraid] response for FIB index {} out of range", index);
            bump(&self.stats.dropped_responses);
            return;
        };
        let state = hw.xfer_state();
        let issued_on = if state.contains(XferState::HIGH_PRIORITY) {
            QueueId::AdapHighCmd
        } else {
            QueueId::AdapNormCmd
        };
        if !self.queues().pending_remove(issued_on, index) {
            warn!("[aacraid] response for FIB {} which is not in flight", index);
            bump(&self.stats.dropped_responses);
            return;
        }

        if fast {
            hw.insert_xfer_state(XferState::ADAPTER_PROCESSED);
            hw.set_data_u32(0, ST_OK);
        }
        if hw.command() == command::NU_FILE_SYSTEM && hw.data_u32(0) & 0xffff_0000 != 0 {
            hw.set_data_u32(0, ST_OK);
        }

        if state.intersects(XferState::NO_RESPONSE_EXPECTED | XferState::ASYNC) {
            if state.contains(XferState::NO_RESPONSE_EXPECTED) {
                bump(&self.stats.no_response_received);
            } else {
                bump(&self.stats.async_received);
            }
            let fib = Fib::reclaim(index);
            match self.pool.take_callback(index) {
                Some(callback) => callback(fib),
                None => {
                    if let Err(e) = self.fib_complete(fib) {
                        warn!("[aacraid] completing FIB {}: {}", index, e);
                    }
                }
            }
        } else {
            bump(&self.stats.normal_received);
            self.pool.completion(index).complete();
        }
    }

    /// New adapter-initiated traffic: hand it to the AIF worker.
    pub fn command_normal(&self) {
        self.aif.wake();
    }

    /// Act on one acknowledged doorbell.
    pub fn handle_doorbell(&self, doorbell: HostDoorbell) {
        match doorbell {
            HostDoorbell::PrintfReady(value) => {
                printf::adapter_printf(&self.comm, self.transport(), value);
            }
            HostDoorbell::CommandReady => self.command_normal(),
            HostDoorbell::ResponseReady => self.response_normal(),
            HostDoorbell::CommandNotFull | HostDoorbell::ResponseNotFull => {
                self.queues().signal_space();
            }
        }
    }
}
