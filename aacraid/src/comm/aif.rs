//! Adapter-initiated FIBs (AIFs).
//!
//! The adapter posts AIFs on the host normal command queue. A dedicated
//! worker drains that queue, copies each AIF to every open listener
//! context and acknowledges it on the adapter normal response queue.
//!
//! Listeners that stop reading are evicted once their backlog passes the
//! configured limit and they have not been serviced for `aif_stale`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use spin::Mutex;
use thiserror::Error;

use super::dispatch::Dispatcher;
use super::queue::QueueId;
use crate::config::AdapterConfig;
use crate::sync::Completion;
use crate::time::Deadline;
use crate::types::repr_c::HwFib;
use crate::types::{command, ST_OK};

pub const AIF_EVENT_NOTIFY: u32 = 1;
pub const AIF_JOB_PROGRESS: u32 = 2;
pub const AIF_API_REPORT: u32 = 3;
pub const AIF_DRIVER_NOTIFY: u32 = 4;

/// Payload size of the status word written back into an AIF.
const AIF_RESPONSE_SIZE: u16 = 4;

/// First payload word of an `AIF_REQUEST` FIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AifCommand {
    EventNotify,
    JobProgress,
    ApiReport,
    DriverNotify,
    Other(u32),
}

impl AifCommand {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            AIF_EVENT_NOTIFY => Self::EventNotify,
            AIF_JOB_PROGRESS => Self::JobProgress,
            AIF_API_REPORT => Self::ApiReport,
            AIF_DRIVER_NOTIFY => Self::DriverNotify,
            other => Self::Other(other),
        }
    }
}

/// Handle of one listener context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u32);

impl ContextId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Never opened, closed, or evicted.
    #[error("unknown AIF context")]
    UnknownContext,
    #[error("no AIF pending")]
    NoEvent,
    #[error("timed out waiting for an AIF")]
    TimedOut,
}

struct FibContext {
    id: ContextId,
    fibs: VecDeque<Box<HwFib>>,
    last_serviced: Instant,
    ready: Arc<Completion>,
}

/// Listener table plus the worker's wakeup and stop flags.
pub struct AifHub {
    contexts: Mutex<Vec<FibContext>>,
    next_id: AtomicU32,
    wakeup: Completion,
    stop: AtomicBool,
    backlog_limit: usize,
    stale_after: Duration,
}

impl AifHub {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            wakeup: Completion::new(),
            stop: AtomicBool::new(false),
            backlog_limit: config.aif_backlog_limit,
            stale_after: config.timeouts.aif_stale(),
        }
    }

    /// Register a new listener. It sees AIFs that arrive from now on.
    pub fn open_fib_context(&self) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.contexts.lock().push(FibContext {
            id,
            fibs: VecDeque::new(),
            last_serviced: Instant::now(),
            ready: Arc::new(Completion::new()),
        });
        debug!("[aacraid] AIF context {} opened", id.0);
        id
    }

    /// Take the oldest AIF queued for `id`.
    ///
    /// With `wait` set, block up to that long for one to arrive.
    pub fn next_fib(&self, id: ContextId, wait: Option<Duration>) -> Result<Box<HwFib>, ContextError> {
        let deadline = wait.map(Deadline::after);
        loop {
            let ready = {
                let mut contexts = self.contexts.lock();
                let ctx = contexts
                    .iter_mut()
                    .find(|c| c.id == id)
                    .ok_or(ContextError::UnknownContext)?;
                ctx.last_serviced = Instant::now();
                if let Some(fib) = ctx.fibs.pop_front() {
                    return Ok(fib);
                }
                ctx.ready.clone()
            };

            let Some(deadline) = deadline else {
                return Err(ContextError::NoEvent);
            };
            let remaining = deadline.remaining();
            if remaining.is_zero() || !ready.wait_timeout(remaining) {
                return Err(ContextError::TimedOut);
            }
        }
    }

    /// Drop a listener and everything queued for it.
    pub fn close_fib_context(&self, id: ContextId) -> Result<(), ContextError> {
        let ctx = {
            let mut contexts = self.contexts.lock();
            let pos = contexts
                .iter()
                .position(|c| c.id == id)
                .ok_or(ContextError::UnknownContext)?;
            contexts.swap_remove(pos)
        };
        // Unblock a reader parked in next_fib; it will see UnknownContext.
        ctx.ready.complete();
        debug!("[aacraid] AIF context {} closed, {} AIFs dropped", id.0, ctx.fibs.len());
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// AIFs queued for `id`.
    pub fn backlog(&self, id: ContextId) -> Option<usize> {
        self.contexts.lock().iter().find(|c| c.id == id).map(|c| c.fibs.len())
    }

    /// Copy `fib` to every listener. Returns how many received it.
    pub fn fan_out(&self, fib: &HwFib) -> usize {
        let mut evicted = Vec::new();
        let mut delivered = 0;
        {
            let mut contexts = self.contexts.lock();
            contexts.retain_mut(|ctx| {
                if ctx.fibs.len() > self.backlog_limit && ctx.last_serviced.elapsed() > self.stale_after {
                    evicted.push((ctx.id, ctx.ready.clone()));
                    return false;
                }
                ctx.fibs.push_back(Box::new(*fib));
                ctx.ready.complete();
                delivered += 1;
                true
            });
        }
        for (id, ready) in evicted {
            warn!("[aacraid] AIF context {} stopped reading, evicted", id.0);
            ready.complete();
        }
        delivered
    }

    /// Wake the worker.
    pub fn wake(&self) {
        self.wakeup.complete();
    }

    /// Ask the worker to exit after its current pass.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wakeup.complete();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Body of the AIF worker thread.
///
/// Also polls on `aif_idle` so AIFs posted without a doorbell are not
/// stranded.
pub fn run(dispatcher: &Dispatcher) {
    let idle = dispatcher.config().timeouts.aif_idle();
    info!("[aacraid] {}: AIF worker started", dispatcher.transport().name());
    while !dispatcher.aif().is_stopped() {
        drain_host_commands(dispatcher);
        dispatcher.aif().wakeup.wait_timeout(idle);
    }
    info!("[aacraid] {}: AIF worker stopped", dispatcher.transport().name());
}

/// Handle every AIF on the host normal command queue. Returns the count.
pub fn drain_host_commands(dispatcher: &Dispatcher) -> usize {
    let queues = dispatcher.queues();
    let mut handled = 0;
    while let Some(entry) = queues.consumer_get(QueueId::HostNormCmd) {
        queues.consumer_free(QueueId::HostNormCmd, dispatcher.transport());

        let Some(hw) = dispatcher.comm().aif_fib(entry.addr) else {
            warn!("[aacraid] AIF address {:#x} outside the AIF area", entry.addr);
            continue;
        };
        dispatcher.stats().record_aif();
        handled += 1;

        if hw.command() == command::AIF_REQUEST {
            match AifCommand::from_raw(hw.data_u32(0)) {
                AifCommand::DriverNotify => {
                    debug!("[aacraid] driver notify AIF, event {:#x}", hw.data_u32(4));
                }
                aif => {
                    let copies = dispatcher.aif().fan_out(&hw.snapshot());
                    debug!("[aacraid] {:?} AIF delivered to {} listeners", aif, copies);
                }
            }
        } else {
            info!("[aacraid] unknown adapter command {:#x}", hw.command());
        }

        hw.set_data_u32(0, ST_OK);
        if let Err(e) = dispatcher.fib_adapter_complete(hw, AIF_RESPONSE_SIZE) {
            warn!("[aacraid] acknowledging AIF: {}", e);
        }
    }
    handled
}
