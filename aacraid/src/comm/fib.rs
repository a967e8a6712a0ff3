//! FIB pool.
//!
//! One DMA block of `N` hardware FIBs plus `N` host control slots, paired by
//! index. Slots move between three places and never leave the pool:
//!
//! ```text
//!   free list ──alloc──▶ caller ──free──▶ free list
//!                          │
//!                          └──free (timed out)──▶ timeout list (parked)
//! ```
//!
//! A FIB whose wait timed out may still be written by the adapter, so it is
//! parked on the timeout list for the lifetime of the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dma_pool::{DmaAllocator, DmaError, DmaRegion};
use log::warn;
use spin::Mutex;
use thiserror::Error;

use super::queue::QueueError;
use crate::sync::Completion;
use crate::types::repr_c::{HwFib, FIB_HEADER_SIZE, FIB_SIZE};
use crate::types::{HwFibRef, XferState, FIB_MAGIC};

/// Completion callback of an asynchronous or fire-and-forget FIB.
///
/// Receives ownership of the FIB back once the adapter has answered.
pub type FibCallback = Box<dyn FnOnce(Fib) + Send>;

/// FIB errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FibError {
    /// Every FIB is in flight or parked.
    #[error("FIB pool exhausted")]
    PoolExhausted,
    /// The header no longer carries the FIB magic.
    #[error("FIB header is corrupt")]
    BadMagic,
    /// The transfer state does not allow this operation.
    #[error("FIB in unexpected transfer state {state:#x}")]
    InvalidState { state: u32 },
    /// Payload plus header exceeds the FIB capacity.
    #[error("FIB size {size} exceeds capacity {max}")]
    MessageTooLarge { size: usize, max: usize },
    /// No room on the response queue.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Exclusive handle to one pool FIB.
///
/// Not `Clone`: holding a `Fib` is owning it. Hand it back with
/// [`FibPool::free`] or through the dispatch layer.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped Fib never returns to the pool"]
pub struct Fib {
    index: u32,
}

impl Fib {
    /// Pool index, also the wire handle (shifted left by 2).
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Rebuild the handle of an in-flight FIB. The caller must be the
    /// single party that took it over from the sender.
    pub(crate) fn reclaim(index: u32) -> Self {
        Self { index }
    }
}

/// Host control block paired with one hardware FIB.
struct FibSlot {
    completion: Completion,
    timed_out: AtomicBool,
    callback: Mutex<Option<FibCallback>>,
}

struct PoolLists {
    free_head: Option<u32>,
    /// Intrusive free-list links, by index.
    next: Vec<Option<u32>>,
    timed_out: Vec<u32>,
}

/// Fixed pool of FIBs backed by one DMA block.
pub struct FibPool {
    dma: Arc<dyn DmaAllocator>,
    region: Option<DmaRegion>,
    hw_base: *mut HwFib,
    hw_bus: u64,
    fib_size: u16,
    slots: Box<[FibSlot]>,
    lists: Mutex<PoolLists>,
}

// `hw_base` points into `region`, which the pool owns.
unsafe impl Send for FibPool {}
unsafe impl Sync for FibPool {}

impl FibPool {
    /// Allocate `count` FIBs and chain them all onto the free list.
    pub fn setup(dma: Arc<dyn DmaAllocator>, count: usize, fib_size: u16) -> Result<Self, DmaError> {
        let region = dma.alloc_coherent(count.max(1) * FIB_SIZE, FIB_SIZE)?;
        let hw_base = region.cpu_ptr() as *mut HwFib;
        let hw_bus = region.bus_addr();

        let slots = (0..count)
            .map(|_| FibSlot {
                completion: Completion::new(),
                timed_out: AtomicBool::new(false),
                callback: Mutex::new(None),
            })
            .collect();
        let next = (0..count as u32)
            .map(|i| (i + 1 < count as u32).then_some(i + 1))
            .collect();

        Ok(Self {
            dma,
            region: Some(region),
            hw_base,
            hw_bus,
            fib_size: fib_size.min(FIB_SIZE as u16),
            slots,
            lists: Mutex::new(PoolLists {
                free_head: (count > 0).then_some(0),
                next,
                timed_out: Vec::new(),
            }),
        })
    }

    /// Total FIBs in the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn fib_size(&self) -> u16 {
        self.fib_size
    }

    /// Volatile view of the hardware FIB behind `fib`.
    ///
    /// `fib` must come from this pool. A foreign handle past the end of the
    /// pool is clamped to the last FIB, which stays inside the pool's DMA
    /// block.
    #[inline]
    pub fn hw(&self, fib: &Fib) -> HwFibRef {
        debug_assert!(self.contains(fib.index), "FIB index {} out of range", fib.index);
        let last = self.capacity().saturating_sub(1);
        self.view((fib.index as usize).min(last))
    }

    /// View of the FIB at a wire index, if the pool has one.
    pub(crate) fn hw_at(&self, index: u32) -> Option<HwFibRef> {
        self.contains(index).then(|| self.view(index as usize))
    }

    #[inline]
    fn view(&self, index: usize) -> HwFibRef {
        // The DMA block holds at least one FIB even for an empty pool.
        unsafe { HwFibRef::new(self.hw_base.add(index)) }
    }

    /// Bus address of the hardware FIB behind `fib`.
    #[inline]
    pub fn hw_bus(&self, fib: &Fib) -> u64 {
        self.hw_bus + fib.index as u64 * FIB_SIZE as u64
    }

    /// Bus address of the first hardware FIB.
    #[inline]
    pub fn base_bus(&self) -> u64 {
        self.hw_bus
    }

    pub(crate) fn contains(&self, index: u32) -> bool {
        (index as usize) < self.capacity()
    }

    pub(crate) fn completion(&self, index: u32) -> &Completion {
        &self.slots[index as usize].completion
    }

    /// Pop a FIB off the free list with a cleared transfer state.
    pub fn alloc(&self) -> Result<Fib, FibError> {
        let index = {
            let mut lists = self.lists.lock();
            let index = lists.free_head.ok_or(FibError::PoolExhausted)?;
            lists.free_head = lists.next[index as usize].take();
            index
        };

        let slot = &self.slots[index as usize];
        slot.timed_out.store(false, Ordering::Release);
        slot.completion.reset();
        *slot.callback.lock() = None;
        self.view(index as usize).set_raw_xfer_state(0);
        Ok(Fib { index })
    }

    /// Return a FIB to the free list, or park it if its wait timed out.
    pub fn free(&self, fib: Fib) {
        let index = fib.index;
        let mut lists = self.lists.lock();
        if self.slots[index as usize].timed_out.load(Ordering::Acquire) {
            warn!("[aacraid] FIB {} timed out, parking it", index);
            lists.timed_out.push(index);
            return;
        }

        let state = self.view(index as usize).raw_xfer_state();
        if state != 0 {
            warn!("[aacraid] fib_free: FIB {} still has XferState {:#x}", index, state);
        }
        lists.next[index as usize] = lists.free_head;
        lists.free_head = Some(index);
    }

    /// Park a FIB without inspecting it.
    pub(crate) fn quarantine(&self, fib: Fib) {
        self.lists.lock().timed_out.push(fib.index);
    }

    /// Stamp a freshly allocated FIB for a host-originated command.
    pub fn init(&self, fib: &Fib) {
        let hw = self.hw(fib);
        let bus = self.hw_bus(fib) as u32;
        unsafe { core::ptr::write_bytes(hw.as_ptr() as *mut u8, 0, FIB_HEADER_SIZE) };
        hw.set_struct_type(FIB_MAGIC);
        hw.set_size(self.fib_size);
        hw.set_sender_size(self.fib_size);
        hw.set_xfer_state(
            XferState::HOST_OWNED
                | XferState::FIB_INITIALIZED
                | XferState::FIB_EMPTY
                | XferState::FAST_RESPONSE_CAPABLE,
        );
        hw.set_sender_fib_address(bus);
        hw.set_receiver_fib_address(bus);
    }

    /// Clear the transfer state after checking the header is intact.
    pub fn dealloc(&self, fib: &Fib) -> Result<(), FibError> {
        let hw = self.hw(fib);
        if hw.struct_type() != FIB_MAGIC {
            return Err(FibError::BadMagic);
        }
        hw.set_raw_xfer_state(0);
        Ok(())
    }

    /// Flag a FIB whose waiter gave up.
    pub fn mark_timed_out(&self, fib: &Fib) {
        self.slots[fib.index as usize].timed_out.store(true, Ordering::Release);
    }

    pub fn is_timed_out(&self, index: u32) -> bool {
        self.contains(index) && self.slots[index as usize].timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn set_callback(&self, fib: &Fib, callback: Option<FibCallback>) {
        *self.slots[fib.index as usize].callback.lock() = callback;
    }

    pub(crate) fn take_callback(&self, index: u32) -> Option<FibCallback> {
        self.slots[index as usize].callback.lock().take()
    }

    /// FIBs currently on the free list.
    pub fn free_count(&self) -> usize {
        let lists = self.lists.lock();
        let mut count = 0;
        let mut cursor = lists.free_head;
        while let Some(i) = cursor {
            count += 1;
            cursor = lists.next[i as usize];
        }
        count
    }

    /// FIBs parked after a timeout.
    pub fn timed_out_count(&self) -> usize {
        self.lists.lock().timed_out.len()
    }
}

impl Drop for FibPool {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.dma.free_coherent(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_pool::HostDmaAllocator;
    use std::collections::HashSet;

    fn pool(count: usize) -> FibPool {
        FibPool::setup(Arc::new(HostDmaAllocator::new()), count, FIB_SIZE as u16).unwrap()
    }

    #[test]
    fn test_alloc_is_lifo() {
        let p = pool(4);
        let a = p.alloc().unwrap();
        assert_eq!(a.index(), 0);
        let b = p.alloc().unwrap();
        assert_eq!(b.index(), 1);
        p.free(a);
        assert_eq!(p.alloc().unwrap().index(), 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let p = pool(2);
        let _a = p.alloc().unwrap();
        let _b = p.alloc().unwrap();
        assert_eq!(p.alloc(), Err(FibError::PoolExhausted));
    }

    #[test]
    fn test_conservation_and_single_ownership() {
        let p = pool(16);
        let mut held = Vec::new();
        let mut seen = HashSet::new();
        for round in 0..64usize {
            if round % 3 == 2 && !held.is_empty() {
                let fib: Fib = held.remove(round % held.len());
                seen.remove(&fib.index());
                p.free(fib);
            } else if let Ok(fib) = p.alloc() {
                assert!(seen.insert(fib.index()), "FIB {} handed out twice", fib.index());
                held.push(fib);
            }
            assert_eq!(p.free_count() + p.timed_out_count() + held.len(), p.capacity());
        }
    }

    #[test]
    fn test_timed_out_fib_is_never_reused() {
        let n = 8;
        let p = pool(n);
        let fib = p.alloc().unwrap();
        let parked = fib.index();
        p.mark_timed_out(&fib);
        p.free(fib);
        assert_eq!(p.timed_out_count(), 1);

        let mut rest = Vec::new();
        for _ in 0..n - 1 {
            let f = p.alloc().unwrap();
            assert_ne!(f.index(), parked);
            rest.push(f);
        }
        assert_eq!(p.alloc(), Err(FibError::PoolExhausted));
    }

    #[test]
    fn test_init_stamps_header() {
        let p = pool(2);
        let _first = p.alloc().unwrap();
        let fib = p.alloc().unwrap();
        p.init(&fib);
        let hw = p.hw(&fib);
        assert_eq!(hw.struct_type(), FIB_MAGIC);
        assert_eq!(hw.size(), 512);
        assert_eq!(hw.sender_size(), 512);
        assert_eq!(hw.sender_fib_address() as u64, p.hw_bus(&fib));
        assert_eq!(hw.receiver_fib_address(), hw.sender_fib_address());
        assert!(hw.xfer_state().contains(XferState::HOST_OWNED | XferState::FAST_RESPONSE_CAPABLE));
    }

    #[test]
    fn test_dealloc_checks_magic() {
        let p = pool(1);
        let fib = p.alloc().unwrap();
        assert_eq!(p.dealloc(&fib), Err(FibError::BadMagic));
        p.init(&fib);
        assert_eq!(p.dealloc(&fib), Ok(()));
        assert_eq!(p.hw(&fib).raw_xfer_state(), 0);
    }

    #[test]
    fn test_wire_index_lookup_is_bounded() {
        let p = pool(3);
        assert!(p.hw_at(2).is_some());
        assert!(p.hw_at(3).is_none());
        assert!(p.hw_at(u32::MAX >> 2).is_none());
    }

    #[test]
    fn test_alloc_clears_previous_use() {
        let p = pool(1);
        let fib = p.alloc().unwrap();
        p.init(&fib);
        p.set_callback(&fib, Some(Box::new(|_| {})));
        p.completion(0).complete();
        p.free(fib);
        let fib = p.alloc().unwrap();
        assert_eq!(p.hw(&fib).raw_xfer_state(), 0);
        assert!(p.take_callback(0).is_none());
        assert!(!p.completion(0).try_wait());
    }
}
