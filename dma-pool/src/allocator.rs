//! DMA-coherent allocators.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use spin::Mutex;
use thiserror::Error;

use crate::region::DmaRegion;
use crate::PAGE_SIZE;

/// DMA allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DmaError {
    /// The backing allocator could not satisfy the request.
    #[error("out of DMA memory ({size} bytes requested)")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },
    /// Alignment is zero or not a power of two.
    #[error("invalid DMA alignment {align}")]
    InvalidAlignment {
        /// Requested alignment.
        align: usize,
    },
    /// No room left below the 4GB bus window.
    #[error("DMA bus address space exhausted")]
    BusSpaceExhausted,
}

/// Source of DMA-coherent memory.
///
/// Regions are zeroed on allocation and stay mapped until handed back through
/// [`DmaAllocator::free_coherent`].
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align` in both address spaces.
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError>;

    /// Return a region previously obtained from this allocator.
    fn free_coherent(&self, region: DmaRegion);
}

/// First bus address handed out. Keeps zero an obviously bad address.
const HOST_BUS_BASE: u64 = 0x0010_0000;

/// Highest bus address usable by 32-bit adapter fields.
const HOST_BUS_LIMIT: u64 = 0xFFFF_F000;

struct Mapping {
    cpu: usize,
    bus: u64,
    size: usize,
}

struct HostState {
    /// Sorted by bus address.
    live: Vec<Mapping>,
}

impl HostState {
    /// Lowest `align`-aligned bus address with `size` free bytes behind it.
    fn find_gap(&self, size: u64, align: u64) -> Option<u64> {
        let align_up = |addr: u64| addr.checked_add(align - 1).map(|a| a & !(align - 1));
        let mut cursor = HOST_BUS_BASE;
        for m in &self.live {
            let bus = align_up(cursor)?;
            if bus.checked_add(size)? <= m.bus {
                return Some(bus);
            }
            cursor = cursor.max(m.bus + m.size as u64);
        }
        let bus = align_up(cursor)?;
        (bus.checked_add(size)? <= HOST_BUS_LIMIT).then_some(bus)
    }
}

/// Host-memory DMA allocator.
///
/// Memory comes from the global allocator; bus addresses are assigned
/// first-fit from a window below 4GB so that every address fits the
/// adapter's 32-bit fields. Freed ranges are handed out again. Both views share the same alignment, so offset arithmetic done on
/// the CPU pointer carries over to the bus address unchanged.
pub struct HostDmaAllocator {
    state: Mutex<HostState>,
}

impl HostDmaAllocator {
    /// Create an allocator with an empty bus window.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState { live: Vec::new() }),
        }
    }

    /// Translate a bus address of a live region back to its CPU pointer.
    ///
    /// This is what the device side of a simulation uses to follow the
    /// addresses the host publishes.
    pub fn bus_to_cpu(&self, bus: u64) -> Option<*mut u8> {
        let state = self.state.lock();
        state
            .live
            .iter()
            .find(|m| bus >= m.bus && bus < m.bus + m.size as u64)
            .map(|m| (m.cpu + (bus - m.bus) as usize) as *mut u8)
    }

    /// Number of regions currently handed out.
    pub fn live_regions(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(DmaError::InvalidAlignment { align });
        }
        let align = align.max(PAGE_SIZE);
        let size = size.max(1);
        let layout =
            Layout::from_size_align(size, align).map_err(|_| DmaError::InvalidAlignment { align })?;

        let mut state = self.state.lock();
        let bus = state
            .find_gap(size as u64, align as u64)
            .ok_or(DmaError::BusSpaceExhausted)?;

        let cpu = unsafe { alloc_zeroed(layout) };
        if cpu.is_null() {
            return Err(DmaError::OutOfMemory { size });
        }

        let pos = state.live.partition_point(|m| m.bus < bus);
        state.live.insert(
            pos,
            Mapping {
                cpu: cpu as usize,
                bus,
                size,
            },
        );
        Ok(unsafe { DmaRegion::new(cpu, bus, size, align) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let mut state = self.state.lock();
        let Some(pos) = state.live.iter().position(|m| m.bus == region.bus_addr()) else {
            debug_assert!(false, "freeing DMA region this allocator does not own");
            return;
        };
        state.live.remove(pos);
        if let Ok(layout) = Layout::from_size_align(region.size(), region.align()) {
            unsafe { dealloc(region.cpu_ptr(), layout) };
        }
    }
}
