//! Adapter lifecycle.
//!
//! # Attach sequence
//! 1. Wait for the firmware kernel to report up (bounded)
//! 2. Mask every interrupt source
//! 3. Allocate the FIB pool and the communication region
//! 4. Hand the init descriptor to the adapter
//! 5. Unmask the interrupt sources and start the AIF worker
//!
//! Dropping the adapter stops the worker and masks interrupts again; the
//! DMA memory goes back to the allocator with the last dispatcher handle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dma_pool::{DmaAllocator, DmaError};
use log::{error, info, warn};
use spin::Mutex;
use thiserror::Error;

use crate::comm::aif::{self, ContextError, ContextId};
use crate::comm::{CommInitError, CommRegion, Dispatcher, FibError, FibPool, SendErrorKind, SendOutcome};
use crate::config::AdapterConfig;
use crate::driver::{AdapterHealth, AdapterTransport, InterruptEvent, TransportError};
use crate::time::Deadline;
use crate::types::repr_c::HwFib;
use crate::types::{command, container, Priority};

/// Interval between firmware status polls while waiting for start-up.
const STARTUP_POLL: Duration = Duration::from_millis(10);

/// Payload of the close-all-containers shutdown command.
const CLOSE_COMMAND_SIZE: u16 = 8;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("adapter self test failed")]
    SelfTestFailed,
    #[error("adapter kernel panic (code {code:?})")]
    KernelPanic { code: Option<u8> },
    #[error("adapter firmware did not come up")]
    StartupTimeout,
    #[error("FIB pool allocation failed: {0}")]
    Dma(#[from] DmaError),
    #[error(transparent)]
    Comm(#[from] CommInitError),
    #[error("cannot start AIF worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fib(#[from] FibError),
    #[error(transparent)]
    Send(#[from] SendErrorKind),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One attached adapter.
pub struct Adapter {
    dispatcher: Arc<Dispatcher>,
    worker: Option<JoinHandle<()>>,
    /// Serializes interrupt service.
    isr_lock: Mutex<()>,
}

impl Adapter {
    /// Bring up an adapter behind `transport`.
    pub fn attach(
        transport: Arc<dyn AdapterTransport>,
        dma: Arc<dyn DmaAllocator>,
        config: AdapterConfig,
    ) -> Result<Self, AttachError> {
        wait_for_firmware(transport.as_ref(), config.timeouts.firmware_startup())?;
        transport.disable_all_interrupts();

        let pool = FibPool::setup(dma.clone(), config.total_fibs(), config.max_fib_size)?;
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let comm = CommRegion::init(dma, transport.as_ref(), &config, elapsed)?;

        for event in InterruptEvent::ALL {
            transport.enable_interrupt(event);
        }

        let dispatcher = Arc::new(Dispatcher::new(transport, comm, pool, config));
        let worker = {
            let dispatcher = dispatcher.clone();
            thread::Builder::new()
                .name("aacraid-aif".into())
                .spawn(move || aif::run(&dispatcher))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                dispatcher.transport().disable_all_interrupts();
                return Err(AttachError::WorkerSpawn(e));
            }
        };

        info!(
            "[aacraid] {}: attached, {} FIBs of {} bytes",
            dispatcher.transport().name(),
            dispatcher.pool().capacity(),
            dispatcher.pool().fib_size()
        );
        Ok(Self {
            dispatcher,
            worker: Some(worker),
            isr_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Service every pending doorbell. Returns whether there was any.
    ///
    /// Completion callbacks run in here; they must not call back into
    /// `handle_interrupt`.
    pub fn handle_interrupt(&self) -> bool {
        let _isr = self.isr_lock.lock();
        let mut handled = false;
        while let Some(doorbell) = self.dispatcher.transport().take_doorbell() {
            self.dispatcher.handle_doorbell(doorbell);
            handled = true;
        }
        handled
    }

    pub fn check_health(&self) -> AdapterHealth {
        self.dispatcher.transport().check_health()
    }

    /// Drop the adapter into its debugger.
    pub fn interrupt_adapter(&self) -> Result<(), AdapterError> {
        self.dispatcher.transport().interrupt_adapter()?;
        Ok(())
    }

    /// Ask the firmware to flush and close every container.
    pub fn send_shutdown(&self) -> Result<(), AdapterError> {
        let d = &self.dispatcher;
        let fib = d.fib_alloc()?;
        d.fib_init(&fib);
        let hw = d.hw(&fib);
        hw.set_data_u32(0, container::VM_CLOSE_ALL);
        hw.set_data_u32(4, container::ALL_CONTAINERS);

        match d.fib_send(
            command::CONTAINER_COMMAND,
            fib,
            CLOSE_COMMAND_SIZE,
            Priority::Normal,
            true,
            true,
            None,
        ) {
            Ok(SendOutcome::Completed(fib)) => {
                d.fib_complete(fib)?;
                Ok(())
            }
            Ok(outcome) => {
                // Synchronous sends only ever complete.
                error!("[aacraid] shutdown: unexpected outcome {:?}", outcome);
                Ok(())
            }
            Err(e) => {
                let kind = e.kind;
                if let Err(fib_err) = d.fib_complete(e.into_fib()) {
                    warn!("[aacraid] shutdown: releasing FIB: {}", fib_err);
                }
                Err(kind.into())
            }
        }
    }

    pub fn open_fib_context(&self) -> ContextId {
        self.dispatcher.aif().open_fib_context()
    }

    pub fn next_fib(&self, id: ContextId, wait: Option<Duration>) -> Result<Box<HwFib>, ContextError> {
        self.dispatcher.aif().next_fib(id, wait)
    }

    pub fn close_fib_context(&self, id: ContextId) -> Result<(), ContextError> {
        self.dispatcher.aif().close_fib_context(id)
    }

    /// Stop the worker and mask the adapter.
    ///
    /// The DMA memory is returned once the last dispatcher handle goes away.
    /// Dropping an attached adapter detaches it the same way.
    pub fn detach(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.dispatcher.aif().request_stop();
        if worker.join().is_err() {
            error!("[aacraid] AIF worker panicked");
        }
        self.dispatcher.transport().disable_all_interrupts();
        info!("[aacraid] {}: detached", self.dispatcher.transport().name());
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Poll the firmware status until the kernel reports up.
fn wait_for_firmware(transport: &dyn AdapterTransport, timeout: Duration) -> Result<(), AttachError> {
    let deadline = Deadline::after(timeout);
    loop {
        match transport.check_health() {
            AdapterHealth::Healthy => return Ok(()),
            AdapterHealth::SelfTestFailed => {
                error!("[aacraid] {}: adapter self test failed", transport.name());
                return Err(AttachError::SelfTestFailed);
            }
            AdapterHealth::KernelPanic { code } => {
                error!("[aacraid] {}: adapter kernel panic {:?}", transport.name(), code);
                return Err(AttachError::KernelPanic { code });
            }
            AdapterHealth::NotUp if deadline.expired() => {
                error!("[aacraid] {}: firmware not up after {:?}", transport.name(), timeout);
                return Err(AttachError::StartupTimeout);
            }
            AdapterHealth::NotUp => thread::sleep(STARTUP_POLL.min(deadline.remaining())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::aif::AIF_EVENT_NOTIFY;
    use crate::driver::{rx, sa, RxTransport, SaTransport};
    use crate::testing::{SimFirmware, SimLayout, SimRegisters};
    use crate::time::TimeoutConfig;
    use crate::types::{fw_status, LOG_AAC_INFO};
    use dma_pool::HostDmaAllocator;

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig::new()
            .with_sync_cmd(Duration::from_millis(500))
            .with_sync_poll(Duration::from_micros(10))
            .with_firmware_startup(Duration::from_millis(50))
            .with_fib_response(Duration::from_secs(5))
    }

    fn config() -> AdapterConfig {
        AdapterConfig::new().with_fibs(16, 4).with_timeouts(timeouts())
    }

    struct Rig {
        regs: Arc<SimRegisters>,
        dma: Arc<HostDmaAllocator>,
        fw: SimFirmware,
        transport: Arc<dyn AdapterTransport>,
    }

    fn rig(layout: SimLayout) -> Rig {
        let regs = SimRegisters::new(layout);
        let dma = Arc::new(HostDmaAllocator::new());
        let fw = SimFirmware::install(&regs, dma.clone());
        let transport: Arc<dyn AdapterTransport> = match layout {
            SimLayout::Rx => Arc::new(RxTransport::new(regs.clone(), dma.clone(), timeouts())),
            SimLayout::Sa => Arc::new(SaTransport::new(regs.clone(), timeouts())),
        };
        Rig { regs, dma, fw, transport }
    }

    fn attach(rig: &Rig) -> Adapter {
        Adapter::attach(rig.transport.clone(), rig.dma.clone(), config()).unwrap()
    }

    #[test]
    fn test_attach_publishes_descriptor_and_unmasks() {
        let rig = rig(SimLayout::Rx);
        let adapter = attach(&rig);

        let init = rig.fw.init();
        assert_eq!(init.init_struct_revision, 3);
        assert_eq!(init.max_io_commands, 20);
        assert_eq!(rig.regs.get(rx::regs::OIMR) as u8, rx::regs::OIMR_DOORBELL_ONLY);
        assert_eq!(adapter.check_health(), AdapterHealth::Healthy);

        drop(adapter);
        assert_eq!(rig.regs.get(rx::regs::OIMR) as u8, rx::regs::OIMR_ALL_MASKED);
        assert_eq!(rig.dma.live_regions(), 0);
    }

    fn shutdown_round_trip(layout: SimLayout) {
        let rig = rig(layout);
        let adapter = Arc::new(attach(&rig));
        let Rig { regs: _regs, fw, dma, .. } = rig;

        let firmware = {
            let adapter = adapter.clone();
            thread::spawn(move || {
                let entry = fw.wait_command(Duration::from_secs(5)).expect("no shutdown command");
                let hw = fw.fib_at(entry.addr);
                assert_eq!(hw.command(), command::CONTAINER_COMMAND);
                assert_eq!(hw.data_u32(0), container::VM_CLOSE_ALL);
                assert_eq!(hw.data_u32(4), container::ALL_CONTAINERS);
                fw.respond(entry, &0u32.to_le_bytes(), false);
                assert!(adapter.handle_interrupt());
            })
        };

        adapter.send_shutdown().unwrap();
        firmware.join().unwrap();

        let pool = adapter.dispatcher().pool();
        assert_eq!(pool.free_count(), pool.capacity());
        drop(adapter);
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn test_shutdown_round_trip_rx() {
        shutdown_round_trip(SimLayout::Rx);
    }

    #[test]
    fn test_shutdown_round_trip_sa() {
        shutdown_round_trip(SimLayout::Sa);
    }

    #[test]
    fn test_aif_reaches_listener_through_interrupt() {
        let rig = rig(SimLayout::Rx);
        let adapter = attach(&rig);
        let listener = adapter.open_fib_context();

        rig.fw.post_aif(5, AIF_EVENT_NOTIFY, b"event");
        assert!(adapter.handle_interrupt());

        let copy = adapter.next_fib(listener, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&copy.data[4..9], b"event");
        let ack = rig.fw.wait_response(Duration::from_secs(5)).unwrap();
        assert_eq!(ack.addr, 5 * 512);

        adapter.close_fib_context(listener).unwrap();
        assert_eq!(adapter.next_fib(listener, None).unwrap_err(), ContextError::UnknownContext);

        // Joining the worker orders its doorbell before the check.
        drop(adapter);
        assert!(rig.regs.take_rung().contains(&rx::regs::INBOUNDDOORBELL_2));
    }

    #[test]
    fn test_printf_doorbell_is_answered() {
        let rig = rig(SimLayout::Sa);
        let adapter = attach(&rig);
        rig.regs.take_rung();

        rig.fw.write_printf(LOG_AAC_INFO, "cache flushed");
        assert!(adapter.handle_interrupt());
        assert_eq!(rig.regs.take_rung(), vec![sa::regs::PRINTF_DONE as u32]);
        assert!(!adapter.handle_interrupt());
    }

    #[test]
    fn test_attach_reports_kernel_panic() {
        let rig = rig(SimLayout::Rx);
        rig.regs.set(rx::regs::MAILBOX7, 0xBC2A_0000 | fw_status::KERNEL_PANIC);
        let err = Adapter::attach(rig.transport.clone(), rig.dma.clone(), config()).err();
        assert!(matches!(err, Some(AttachError::KernelPanic { code: Some(0x2A) })));
        assert_eq!(rig.dma.live_regions(), 0);
    }

    #[test]
    fn test_attach_times_out_when_firmware_stays_down() {
        let rig = rig(SimLayout::Sa);
        rig.regs.set(sa::regs::MAILBOX7, 0);
        let err = Adapter::attach(rig.transport.clone(), rig.dma.clone(), config()).err();
        assert!(matches!(err, Some(AttachError::StartupTimeout)));
    }

    #[test]
    fn test_attach_rejects_failed_self_test() {
        let rig = rig(SimLayout::Sa);
        rig.regs.set(sa::regs::MAILBOX7, fw_status::SELF_TEST_FAILED);
        let err = Adapter::attach(rig.transport.clone(), rig.dma.clone(), config()).err();
        assert!(matches!(err, Some(AttachError::SelfTestFailed)));
    }

    #[test]
    fn test_detach_stops_worker_and_masks() {
        let rig = rig(SimLayout::Sa);
        let adapter = attach(&rig);
        assert_eq!(rig.regs.get(sa::regs::PRISETIRQMASK) as u16, 0);
        let dispatcher = adapter.dispatcher().clone();

        adapter.detach();
        assert!(dispatcher.aif().is_stopped());
        assert_eq!(
            rig.regs.get(sa::regs::PRISETIRQMASK) as u16,
            sa::regs::DOORBELL_1 | sa::regs::DOORBELL_2 | sa::regs::DOORBELL_3 | sa::regs::DOORBELL_4
        );
        // The worker's handle is gone; this one is the last.
        assert_eq!(Arc::strong_count(&dispatcher), 1);
        drop(dispatcher);
        assert_eq!(rig.dma.live_regions(), 0);
    }

    #[test]
    fn test_interrupt_adapter_sends_breakpoint() {
        let rig = rig(SimLayout::Rx);
        let adapter = attach(&rig);
        assert_eq!(adapter.interrupt_adapter(), Ok(()));
    }
}
