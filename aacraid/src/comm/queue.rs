//! Host/adapter ring queues.
//!
//! Eight rings live in the communication region, each a pair of indices
//! (producer, consumer) followed later by a body of `{size, addr}` entries.
//! Both indices are written by two independent parties: the host updates
//! the producer of the adapter queues and the consumer of the host queues,
//! the adapter does the opposite. The host-side channel locks only order
//! host contexts against each other; agreement with the adapter comes from
//! the index rules below alone.
//!
//! # Index rules
//! - Both indices start at the queue's capacity.
//! - A stored index `>= entries` addresses slot 0.
//! - Producer stores `slot + 1`, so stored values range over `1..=entries`.
//! - Empty when `producer == consumer`.
//! - Full when `slot + 1 == consumer` for the slot the producer would fill.

use core::mem::size_of;
use core::ptr::{read_volatile, write_volatile};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::driver::{AdapterNotify, AdapterTransport};
use crate::hw::{lfence, sfence};
use crate::sync::Completion;
use crate::time::Deadline;
use crate::types::QueueEntry;

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE IDS AND SIZING
// ═══════════════════════════════════════════════════════════════════════════

/// The eight communication queues, in region order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum QueueId {
    HostNormCmd = 0,
    HostHighCmd = 1,
    AdapNormCmd = 2,
    AdapHighCmd = 3,
    HostNormResp = 4,
    HostHighResp = 5,
    AdapNormResp = 6,
    AdapHighResp = 7,
}

pub const NUMBER_OF_COMM_QUEUES: usize = 8;

impl QueueId {
    pub const ALL: [QueueId; NUMBER_OF_COMM_QUEUES] = [
        QueueId::HostNormCmd,
        QueueId::HostHighCmd,
        QueueId::AdapNormCmd,
        QueueId::AdapHighCmd,
        QueueId::HostNormResp,
        QueueId::HostHighResp,
        QueueId::AdapNormResp,
        QueueId::AdapHighResp,
    ];

    /// Fixed capacity of this queue.
    pub const fn entries(self) -> u32 {
        match self {
            QueueId::HostNormCmd => 8,
            QueueId::HostHighCmd => 4,
            QueueId::AdapNormCmd => 512,
            QueueId::AdapHighCmd => 4,
            QueueId::HostNormResp => 512,
            QueueId::HostHighResp => 4,
            QueueId::AdapNormResp => 8,
            QueueId::AdapHighResp => 4,
        }
    }

    /// Lock shared by the two directions of one physical channel.
    const fn channel(self) -> usize {
        match self {
            QueueId::HostNormCmd | QueueId::AdapNormResp => 0,
            QueueId::HostHighCmd | QueueId::AdapHighResp => 1,
            QueueId::AdapNormCmd | QueueId::HostNormResp => 2,
            QueueId::AdapHighCmd | QueueId::HostHighResp => 3,
        }
    }

    /// Doorbell announcing a new entry on an adapter queue.
    fn insert_notify(self) -> Option<AdapterNotify> {
        match self {
            QueueId::AdapNormCmd => Some(AdapterNotify::AdapNormCmdQue),
            QueueId::AdapHighCmd => Some(AdapterNotify::AdapHighCmdQue),
            QueueId::AdapNormResp => Some(AdapterNotify::AdapNormRespQue),
            QueueId::AdapHighResp => Some(AdapterNotify::AdapHighRespQue),
            _ => None,
        }
    }

    /// Doorbell announcing that a full host queue has room again.
    fn not_full_notify(self) -> Option<AdapterNotify> {
        match self {
            QueueId::HostNormCmd => Some(AdapterNotify::HostNormCmdNotFull),
            QueueId::HostHighCmd => Some(AdapterNotify::HostHighCmdNotFull),
            QueueId::HostNormResp => Some(AdapterNotify::HostNormRespNotFull),
            QueueId::HostHighResp => Some(AdapterNotify::HostHighRespNotFull),
            _ => None,
        }
    }
}

/// Sum of all queue capacities.
pub const TOTAL_QUEUE_ENTRIES: usize = {
    let mut total = 0;
    let mut i = 0;
    while i < NUMBER_OF_COMM_QUEUES {
        total += QueueId::ALL[i].entries() as usize;
        i += 1;
    }
    total
};

/// Bytes of producer/consumer header pairs.
pub const QUEUE_HEADERS_SIZE: usize = NUMBER_OF_COMM_QUEUES * 2 * size_of::<u32>();

/// Bytes of headers plus all queue bodies.
pub const QUEUE_AREA_SIZE: usize = QUEUE_HEADERS_SIZE + TOTAL_QUEUE_ENTRIES * size_of::<QueueEntry>();

/// Byte offset of a queue's body within the queue area.
pub const fn body_offset(id: QueueId) -> usize {
    let mut offset = QUEUE_HEADERS_SIZE;
    let mut i = 0;
    while i < id as usize {
        offset += QueueId::ALL[i].entries() as usize * size_of::<QueueEntry>();
        i += 1;
    }
    offset
}

// ═══════════════════════════════════════════════════════════════════════════
// INDEX RULES
// ═══════════════════════════════════════════════════════════════════════════

/// Slot the producer fills next and the nearly-full hint, or `None` if full.
pub(crate) fn produce_slot(producer: u32, consumer: u32, entries: u32) -> Option<(u32, bool)> {
    let nearly_full = producer.wrapping_sub(2) == consumer;
    let slot = if producer >= entries { 0 } else { producer };
    if slot + 1 == consumer {
        None
    } else {
        Some((slot, nearly_full))
    }
}

/// Slot holding the oldest unconsumed entry, or `None` if empty.
pub(crate) fn consume_slot(producer: u32, consumer: u32, entries: u32) -> Option<u32> {
    if producer == consumer {
        None
    } else if consumer >= entries {
        Some(0)
    } else {
        Some(consumer)
    }
}

/// Consumer index after freeing one entry.
pub(crate) fn advance_consumer(consumer: u32, entries: u32) -> u32 {
    if consumer >= entries {
        1
    } else {
        consumer + 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// No free slot right now.
    #[error("queue {queue:?} full")]
    Full { queue: QueueId },
    /// Still full when the bounded wait ran out.
    #[error("queue {queue:?} stayed full")]
    Timeout { queue: QueueId },
}

// ═══════════════════════════════════════════════════════════════════════════
// RING VIEW
// ═══════════════════════════════════════════════════════════════════════════

/// One ring inside the communication region.
struct Ring {
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    base: *mut QueueEntry,
    entries: u32,
}

impl Ring {
    #[inline]
    fn producer(&self) -> u32 {
        u32::from_le(unsafe { (*self.producer).load(Ordering::Acquire) })
    }

    #[inline]
    fn set_producer(&self, value: u32) {
        unsafe { (*self.producer).store(value.to_le(), Ordering::Release) }
    }

    #[inline]
    fn consumer(&self) -> u32 {
        u32::from_le(unsafe { (*self.consumer).load(Ordering::Acquire) })
    }

    #[inline]
    fn set_consumer(&self, value: u32) {
        unsafe { (*self.consumer).store(value.to_le(), Ordering::Release) }
    }

    fn write_entry(&self, slot: u32, entry: QueueEntry) {
        debug_assert!(slot < self.entries);
        let wire = QueueEntry {
            size: entry.size.to_le(),
            addr: entry.addr.to_le(),
        };
        unsafe { write_volatile(self.base.add(slot as usize), wire) }
    }

    fn read_entry(&self, slot: u32) -> QueueEntry {
        debug_assert!(slot < self.entries);
        let wire = unsafe { read_volatile(self.base.add(slot as usize)) };
        QueueEntry {
            size: u32::from_le(wire.size),
            addr: u32::from_le(wire.addr),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE SET
// ═══════════════════════════════════════════════════════════════════════════

/// Granularity of the queue-full wait between capacity checks.
const SPACE_POLL: Duration = Duration::from_millis(1);

/// All eight queues plus their host-side bookkeeping.
pub struct CommQueues {
    rings: [Ring; NUMBER_OF_COMM_QUEUES],
    channels: [Mutex<()>; 4],
    /// Pool indices submitted on each queue and not yet answered.
    pending: [Mutex<Vec<u32>>; NUMBER_OF_COMM_QUEUES],
    /// Raised whenever a queue may have gained room.
    space: Completion,
    interrupt_moderation: bool,
}

// Ring pointers target DMA memory owned by the communication region.
unsafe impl Send for CommQueues {}
unsafe impl Sync for CommQueues {}

impl CommQueues {
    /// Lay out the rings over `area` and reset every index to its capacity.
    ///
    /// # Safety
    /// `area` must be 4-byte aligned, valid for `QUEUE_AREA_SIZE` bytes, and
    /// outlive the returned value.
    pub unsafe fn init(area: *mut u8, interrupt_moderation: bool) -> Self {
        let headers = area as *const AtomicU32;
        let rings = core::array::from_fn(|i| {
            let id = QueueId::ALL[i];
            let ring = Ring {
                producer: headers.add(i * 2),
                consumer: headers.add(i * 2 + 1),
                base: area.add(body_offset(id)) as *mut QueueEntry,
                entries: id.entries(),
            };
            ring.set_producer(id.entries());
            ring.set_consumer(id.entries());
            ring
        });
        Self {
            rings,
            channels: core::array::from_fn(|_| Mutex::new(())),
            pending: core::array::from_fn(|_| Mutex::new(Vec::new())),
            space: Completion::new(),
            interrupt_moderation,
        }
    }

    #[inline]
    fn ring(&self, id: QueueId) -> &Ring {
        &self.rings[id as usize]
    }

    /// Raw producer index as stored in shared memory.
    pub fn producer_index(&self, id: QueueId) -> u32 {
        self.ring(id).producer()
    }

    /// Raw consumer index as stored in shared memory.
    pub fn consumer_index(&self, id: QueueId) -> u32 {
        self.ring(id).consumer()
    }

    /// Reserve the next producer slot of `id`.
    ///
    /// The channel lock stays held inside the returned slot until it is
    /// inserted or dropped.
    pub fn get_entry(&self, id: QueueId) -> Result<QueueSlot<'_>, QueueError> {
        let channel = self.channels[id.channel()].lock();
        let ring = self.ring(id);
        match produce_slot(ring.producer(), ring.consumer(), ring.entries) {
            Some((slot, nearly_full)) => Ok(QueueSlot {
                queues: self,
                id,
                slot,
                nearly_full,
                channel,
            }),
            None => {
                debug!("[aacraid] queue {:?} full, {} outstanding", id, self.pending_count(id));
                Err(QueueError::Full { queue: id })
            }
        }
    }

    /// Reserve a slot on `id` and stamp `entry` into it, waiting up to
    /// `timeout` for room.
    pub fn queue_get(
        &self,
        id: QueueId,
        entry: QueueEntry,
        timeout: Duration,
    ) -> Result<QueueSlot<'_>, QueueError> {
        let deadline = Deadline::after(timeout);
        let mut warned = false;
        loop {
            match self.get_entry(id) {
                Ok(mut slot) => {
                    slot.write(entry);
                    return Ok(slot);
                }
                Err(QueueError::Full { .. }) => {
                    if !warned {
                        warn!("[aacraid] queue {:?} full, waiting for room", id);
                        warned = true;
                    }
                    let remaining = deadline.remaining();
                    if remaining.is_zero() {
                        return Err(QueueError::Timeout { queue: id });
                    }
                    self.space.wait_timeout(remaining.min(SPACE_POLL));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether `id` holds an unconsumed entry.
    pub fn consumer_avail(&self, id: QueueId) -> bool {
        let ring = self.ring(id);
        consume_slot(ring.producer(), ring.consumer(), ring.entries).is_some()
    }

    /// Peek at the oldest unconsumed entry of `id`.
    pub fn consumer_get(&self, id: QueueId) -> Option<QueueEntry> {
        let _channel = self.channels[id.channel()].lock();
        let ring = self.ring(id);
        let slot = consume_slot(ring.producer(), ring.consumer(), ring.entries)?;
        // Entry body after the adapter-written index.
        lfence();
        Some(ring.read_entry(slot))
    }

    /// Release the oldest entry of `id`.
    ///
    /// If the queue was full before this call the adapter is told it may
    /// produce again.
    pub fn consumer_free(&self, id: QueueId, transport: &dyn AdapterTransport) {
        let was_full = {
            let _channel = self.channels[id.channel()].lock();
            let ring = self.ring(id);
            let consumer = ring.consumer();
            let was_full = produce_slot(ring.producer(), consumer, ring.entries).is_none();
            ring.set_consumer(advance_consumer(consumer, ring.entries));
            was_full
        };
        self.space.complete();

        if was_full {
            match id.not_full_notify() {
                Some(event) => transport.notify(event),
                None => warn!("[aacraid] consumer_free on adapter queue {:?}", id),
            }
        }
    }

    /// Wake producers waiting for room.
    pub fn signal_space(&self) {
        self.space.complete();
    }

    pub fn pending_push(&self, id: QueueId, index: u32) {
        self.pending[id as usize].lock().push(index);
    }

    /// Remove `index` from the pending list of `id`. Returns whether it was there.
    pub fn pending_remove(&self, id: QueueId, index: u32) -> bool {
        let mut pending = self.pending[id as usize].lock();
        match pending.iter().position(|&i| i == index) {
            Some(pos) => {
                pending.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self, id: QueueId) -> usize {
        self.pending[id as usize].lock().len()
    }
}

/// A reserved producer slot, holding its channel lock.
pub struct QueueSlot<'a> {
    queues: &'a CommQueues,
    id: QueueId,
    slot: u32,
    nearly_full: bool,
    channel: MutexGuard<'a, ()>,
}

impl<'a> QueueSlot<'a> {
    /// Ring slot this reservation will fill.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn queue(&self) -> QueueId {
        self.id
    }

    pub fn write(&mut self, entry: QueueEntry) {
        self.queues.ring(self.id).write_entry(self.slot, entry);
    }

    /// Publish the entry, drop the channel lock and ring the adapter.
    ///
    /// The doorbell is skipped when the queue was nearly full and interrupt
    /// moderation is on; the adapter is then already draining it.
    pub fn insert(self, transport: &dyn AdapterTransport) {
        let QueueSlot {
            queues,
            id,
            slot,
            nearly_full,
            channel,
        } = self;

        sfence();
        queues.ring(id).set_producer(slot + 1);
        drop(channel);

        if nearly_full && queues.interrupt_moderation {
            return;
        }
        match id.insert_notify() {
            Some(event) => transport.notify(event),
            None => warn!("[aacraid] unexpected insert on host queue {:?}", id),
        }
    }
}
