//! Test doubles: a simulated register file, a recording transport and a
//! firmware model that drives the shared queues from the adapter side.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dma_pool::{DmaAllocator, HostDmaAllocator};
use spin::Mutex;

use crate::comm::queue::{advance_consumer, body_offset, consume_slot, produce_slot, QueueId};
use crate::comm::{CommRegion, Dispatcher, FibPool};
use crate::config::AdapterConfig;
use crate::driver::{rx, sa};
use crate::driver::{
    AdapterHealth, AdapterNotify, AdapterTransport, HostDoorbell, InterruptEvent, TransportError,
};
use crate::hw::RegisterIo;
use crate::time::Deadline;
use crate::types::repr_c::{HwFib, FIB_HEADER_SIZE, FIB_SIZE};
use crate::types::{command, fw_status, AacInit, HwFibRef, QueueEntry, XferState, FIB_MAGIC};

// ═══════════════════════════════════════════════════════════════════════════
// SIMULATED REGISTERS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLayout {
    Rx,
    Sa,
}

type SyncHandler = Box<dyn FnMut(u32, [u32; 4]) -> Option<u32> + Send>;

/// Register file of one simulated message unit.
///
/// Doorbell status registers are write-one-to-clear, and ringing doorbell 0
/// runs the installed sync handler. A handler returning `None` never acks.
pub struct SimRegisters {
    layout: SimLayout,
    regs: Mutex<HashMap<u32, u32>>,
    sync: Mutex<Option<SyncHandler>>,
    rung: Mutex<Vec<u32>>,
}

impl SimRegisters {
    pub fn new(layout: SimLayout) -> Arc<Self> {
        Arc::new(Self {
            layout,
            regs: Mutex::new(HashMap::new()),
            sync: Mutex::new(None),
            rung: Mutex::new(Vec::new()),
        })
    }

    pub fn on_sync(&self, handler: impl FnMut(u32, [u32; 4]) -> Option<u32> + Send + 'static) {
        *self.sync.lock() = Some(Box::new(handler));
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn set(&self, offset: u32, value: u32) {
        self.regs.lock().insert(offset, value);
    }

    pub fn set8(&self, offset: u32, value: u8) {
        self.set(offset, value as u32);
    }

    fn update(&self, offset: u32, f: impl FnOnce(u32) -> u32) {
        let mut regs = self.regs.lock();
        let value = f(regs.get(&offset).copied().unwrap_or(0));
        regs.insert(offset, value);
    }

    /// Doorbells the host rang, other than the sync doorbell.
    pub fn take_rung(&self) -> Vec<u32> {
        core::mem::take(&mut *self.rung.lock())
    }

    /// Adapter side: raise outbound doorbell bits.
    pub fn raise_doorbell(&self, bits: u32) {
        let status = match self.layout {
            SimLayout::Rx => rx::regs::ODR,
            SimLayout::Sa => sa::regs::PRISETIRQ,
        };
        self.update(status, |v| v | bits);
    }

    fn mailbox(&self, n: u32) -> u32 {
        match self.layout {
            SimLayout::Rx => rx::regs::mailbox(n),
            SimLayout::Sa => sa::regs::mailbox(n),
        }
    }

    fn run_sync(&self) {
        let command = self.get(self.mailbox(0));
        let params = [1, 2, 3, 4].map(|n| self.get(self.mailbox(n)));
        let Some(mut handler) = self.sync.lock().take() else {
            return;
        };
        let status = handler(command, params);
        *self.sync.lock() = Some(handler);

        if let Some(status) = status {
            self.set(self.mailbox(0), status);
            self.raise_doorbell(1);
        }
    }

    fn ring(&self, bits: u32) {
        if bits & 1 != 0 {
            self.run_sync();
        }
        if bits & !1 != 0 {
            self.rung.lock().push(bits & !1);
        }
    }

    fn write(&self, offset: u32, value: u32) {
        match (self.layout, offset) {
            (SimLayout::Rx, rx::regs::ODR) | (SimLayout::Sa, sa::regs::PRICLEARIRQ) => {
                let status = match self.layout {
                    SimLayout::Rx => rx::regs::ODR,
                    SimLayout::Sa => sa::regs::PRISETIRQ,
                };
                self.update(status, |v| v & !value);
            }
            (SimLayout::Rx, rx::regs::IDR) | (SimLayout::Sa, sa::regs::SECSETIRQ) => self.ring(value),
            (SimLayout::Sa, sa::regs::PRISETIRQMASK) => self.update(offset, |v| v | value),
            (SimLayout::Sa, sa::regs::PRICLEARIRQMASK) => {
                self.update(sa::regs::PRISETIRQMASK, |v| v & !value)
            }
            _ => self.set(offset, value),
        }
    }
}

impl RegisterIo for SimRegisters {
    fn read8(&self, offset: u32) -> u8 {
        self.get(offset) as u8
    }

    fn write8(&self, offset: u32, value: u8) {
        self.write(offset, value as u32)
    }

    fn read16(&self, offset: u32) -> u16 {
        self.get(offset) as u16
    }

    fn write16(&self, offset: u32, value: u16) {
        self.write(offset, value as u32)
    }

    fn read32(&self, offset: u32) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.write(offset, value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECORDING TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Transport that records what the protocol layer asks of it.
#[derive(Default)]
pub struct RecordingTransport {
    notified: Mutex<Vec<AdapterNotify>>,
    sync_calls: Mutex<Vec<(u32, u32)>>,
    doorbells: Mutex<VecDeque<HostDoorbell>>,
    enabled: Mutex<Vec<InterruptEvent>>,
    fail_sync: bool,
}

impl RecordingTransport {
    pub fn failing_sync() -> Self {
        Self {
            fail_sync: true,
            ..Self::default()
        }
    }

    pub fn notified(&self) -> Vec<AdapterNotify> {
        self.notified.lock().clone()
    }

    pub fn sync_calls(&self) -> Vec<(u32, u32)> {
        self.sync_calls.lock().clone()
    }

    pub fn push_doorbell(&self, doorbell: HostDoorbell) {
        self.doorbells.lock().push_back(doorbell);
    }

    pub fn enabled(&self) -> Vec<InterruptEvent> {
        self.enabled.lock().clone()
    }
}

impl AdapterTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn enable_interrupt(&self, event: InterruptEvent) {
        let mut enabled = self.enabled.lock();
        if !enabled.contains(&event) {
            enabled.push(event);
        }
    }

    fn disable_interrupt(&self, event: InterruptEvent) {
        self.enabled.lock().retain(|&e| e != event);
    }

    fn notify(&self, event: AdapterNotify) {
        self.notified.lock().push(event);
    }

    fn sync_cmd(&self, command: u32, param: u32) -> Result<u32, TransportError> {
        self.sync_calls.lock().push((command, param));
        if self.fail_sync {
            Err(TransportError::SyncTimeout { command })
        } else {
            Ok(0)
        }
    }

    fn check_health(&self) -> AdapterHealth {
        AdapterHealth::Healthy
    }

    fn take_doorbell(&self) -> Option<HostDoorbell> {
        self.doorbells.lock().pop_front()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FIRMWARE MODEL
// ═══════════════════════════════════════════════════════════════════════════

/// Adapter side of the shared memory protocol.
///
/// Follows the bus addresses the host published in the init descriptor,
/// exactly as firmware would.
pub struct SimFirmware {
    dma: Arc<HostDmaAllocator>,
    regs: Option<Arc<SimRegisters>>,
    init_bus: Arc<Mutex<Option<u32>>>,
}

impl SimFirmware {
    /// Model for a region whose descriptor lives at `init_bus`, with no
    /// doorbells.
    pub fn detached(dma: Arc<HostDmaAllocator>, init_bus: u64) -> Self {
        Self {
            dma,
            regs: None,
            init_bus: Arc::new(Mutex::new(Some(init_bus as u32))),
        }
    }

    /// Boot a model behind `regs`: report the kernel up, ack every sync
    /// command and remember the init descriptor address.
    pub fn install(regs: &Arc<SimRegisters>, dma: Arc<HostDmaAllocator>) -> Self {
        let init_bus = Arc::new(Mutex::new(None));
        let seen = init_bus.clone();
        let mailbox7 = match regs.layout {
            SimLayout::Rx => rx::regs::MAILBOX7,
            SimLayout::Sa => sa::regs::MAILBOX7,
        };
        regs.set(mailbox7, fw_status::KERNEL_UP_AND_RUNNING);
        regs.on_sync(move |cmd, params| {
            if cmd == crate::types::sync_command::INIT_STRUCT_BASE_ADDRESS {
                *seen.lock() = Some(params[0]);
            }
            Some(0)
        });
        Self {
            dma,
            regs: Some(regs.clone()),
            init_bus,
        }
    }

    fn cpu(&self, bus: u32) -> *mut u8 {
        self.dma
            .bus_to_cpu(bus as u64)
            .unwrap_or_else(|| panic!("bus address {bus:#x} not mapped"))
    }

    /// The descriptor as the host published it.
    pub fn init(&self) -> AacInit {
        let bus = self.init_bus.lock().expect("no init descriptor announced");
        unsafe { AacInit::load(self.cpu(bus) as *const AacInit) }
    }

    fn index(&self, id: QueueId, consumer: bool) -> &AtomicU32 {
        let headers = self.cpu(self.init().comm_header_address) as *const AtomicU32;
        unsafe { &*headers.add(id as usize * 2 + consumer as usize) }
    }

    fn entry_ptr(&self, id: QueueId, slot: u32) -> *mut QueueEntry {
        let area = self.cpu(self.init().comm_header_address);
        unsafe { (area.add(body_offset(id)) as *mut QueueEntry).add(slot as usize) }
    }

    fn produce(&self, id: QueueId, entry: QueueEntry) {
        let (producer, consumer) = (self.index(id, false), self.index(id, true));
        let (slot, _) = produce_slot(
            u32::from_le(producer.load(Ordering::Acquire)),
            u32::from_le(consumer.load(Ordering::Acquire)),
            id.entries(),
        )
        .unwrap_or_else(|| panic!("{id:?} full"));
        let wire = QueueEntry {
            size: entry.size.to_le(),
            addr: entry.addr.to_le(),
        };
        unsafe { core::ptr::write_volatile(self.entry_ptr(id, slot), wire) };
        producer.store((slot + 1).to_le(), Ordering::Release);
    }

    fn consume(&self, id: QueueId) -> Option<QueueEntry> {
        let (producer, consumer) = (self.index(id, false), self.index(id, true));
        let cons = u32::from_le(consumer.load(Ordering::Acquire));
        let slot = consume_slot(u32::from_le(producer.load(Ordering::Acquire)), cons, id.entries())?;
        let wire = unsafe { core::ptr::read_volatile(self.entry_ptr(id, slot)) };
        consumer.store(advance_consumer(cons, id.entries()).to_le(), Ordering::Release);
        Some(QueueEntry {
            size: u32::from_le(wire.size),
            addr: u32::from_le(wire.addr),
        })
    }

    fn ring_host(&self, rx_bit: u32, sa_bit: u16) {
        if let Some(regs) = &self.regs {
            regs.raise_doorbell(match regs.layout {
                SimLayout::Rx => rx_bit,
                SimLayout::Sa => sa_bit as u32,
            });
        }
    }

    /// Take the next host command, normal priority first.
    pub fn take_command(&self) -> Option<QueueEntry> {
        self.consume(QueueId::AdapNormCmd)
            .or_else(|| self.consume(QueueId::AdapHighCmd))
    }

    pub fn wait_command(&self, timeout: Duration) -> Option<QueueEntry> {
        poll(timeout, || self.take_command())
    }

    /// Take the next acknowledgement of an AIF, normal priority first.
    pub fn take_response(&self) -> Option<QueueEntry> {
        self.consume(QueueId::AdapNormResp)
            .or_else(|| self.consume(QueueId::AdapHighResp))
    }

    pub fn wait_response(&self, timeout: Duration) -> Option<QueueEntry> {
        poll(timeout, || self.take_response())
    }

    /// Host FIB at bus address `bus`.
    pub fn fib_at(&self, bus: u32) -> HwFibRef {
        unsafe { HwFibRef::new(self.cpu(bus) as *mut HwFib) }
    }

    /// AIF FIB at offset `addr` of the AIF area.
    pub fn aif_at(&self, addr: u32) -> HwFibRef {
        let base = self.init().adapter_fibs_physical_address;
        self.fib_at(base + addr)
    }

    /// Answer a host command: write `payload`, then post the sender handle
    /// on the host response queue.
    pub fn respond(&self, command: QueueEntry, payload: &[u8], fast: bool) {
        let hw = self.fib_at(command.addr);
        hw.write_data(0, payload);
        hw.insert_xfer_state(XferState::ADAPTER_PROCESSED);
        self.post_response(QueueEntry {
            size: command.size,
            addr: hw.sender_fib_address() | fast as u32,
        });
    }

    pub fn post_response(&self, entry: QueueEntry) {
        self.produce(QueueId::HostNormResp, entry);
        self.ring_host(rx::regs::OUTBOUNDDOORBELL_2, sa::regs::DOORBELL_2);
    }

    pub fn post_command(&self, entry: QueueEntry) {
        self.produce(QueueId::HostNormCmd, entry);
        self.ring_host(rx::regs::OUTBOUNDDOORBELL_1, sa::regs::DOORBELL_1);
    }

    /// Build an `AIF_REQUEST` FIB in AIF slot `slot` without posting it.
    pub fn stage_aif(&self, slot: u32, aif_command: u32) -> HwFibRef {
        let hw = self.aif_at(slot * FIB_SIZE as u32);
        hw.clear();
        hw.set_struct_type(FIB_MAGIC);
        hw.set_command(command::AIF_REQUEST);
        hw.set_xfer_state(
            XferState::ADAPTER_OWNED
                | XferState::FIB_INITIALIZED
                | XferState::SENT_FROM_ADAPTER
                | XferState::RESPONSE_EXPECTED
                | XferState::NORMAL_PRIORITY,
        );
        hw.set_size((FIB_HEADER_SIZE + 4) as u16);
        hw.set_sender_size(FIB_SIZE as u16);
        hw.set_sender_fib_address(slot * FIB_SIZE as u32);
        hw.set_data_u32(0, aif_command);
        hw
    }

    /// Post an AIF whose payload follows the AIF command word.
    pub fn post_aif(&self, slot: u32, aif_command: u32, payload: &[u8]) {
        let hw = self.stage_aif(slot, aif_command);
        hw.write_data(4, payload);
        let size = (FIB_HEADER_SIZE + 4 + payload.len()) as u16;
        hw.set_size(size);
        self.post_command(QueueEntry {
            size: size as u32,
            addr: slot * FIB_SIZE as u32,
        });
    }

    /// Write printf text and ring `PrintfReady`.
    pub fn write_printf(&self, level: u16, text: &str) {
        let buffer = self.cpu(self.init().printfbuf);
        unsafe { core::ptr::copy_nonoverlapping(text.as_ptr(), buffer, text.len()) };
        if let Some(regs) = &self.regs {
            let value = (level as u32) << 16 | text.len() as u32;
            regs.set(regs.mailbox(5), value);
            regs.raise_doorbell(match regs.layout {
                SimLayout::Rx => rx::regs::DOORBELL_PRINTF_READY,
                SimLayout::Sa => sa::regs::PRINTF_READY as u32,
            });
        }
    }
}

fn poll<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Deadline::after(timeout);
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if deadline.expired() {
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Dispatcher over a recording transport, plus a firmware model of its
/// region.
pub fn dispatcher_fixture(
    config: AdapterConfig,
) -> (Arc<Dispatcher>, SimFirmware, Arc<RecordingTransport>) {
    let dma = Arc::new(HostDmaAllocator::new());
    let transport = Arc::new(RecordingTransport::default());
    let comm = CommRegion::build(dma.clone() as Arc<dyn DmaAllocator>, &config, 0).unwrap();
    let pool = FibPool::setup(dma.clone(), config.total_fibs(), config.max_fib_size).unwrap();
    let fw = SimFirmware::detached(dma, comm.init_bus());
    let dispatcher = Dispatcher::new(transport.clone(), comm, pool, config);
    (Arc::new(dispatcher), fw, transport)
}
