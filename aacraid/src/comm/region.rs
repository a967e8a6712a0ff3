//! Communication region.
//!
//! One DMA block, laid out once at attach:
//!
//! ```text
//! +0       AIF FIB area (4096 bytes, adapter-initiated FIBs)
//! +4096    aac_init descriptor
//!          padding up to the next 16-byte boundary
//!          queue headers (8 x producer/consumer) + queue bodies
//!          printf buffer (256 bytes)
//! ```
//!
//! Only the bus address of the init descriptor is handed to the adapter;
//! it finds everything else through the descriptor.

use core::mem::size_of;
use std::sync::Arc;

use dma_pool::{DmaAllocator, DmaError, DmaRegion, PAGE_SIZE};
use log::{debug, info};
use thiserror::Error;

use super::queue::{CommQueues, QUEUE_AREA_SIZE};
use crate::config::AdapterConfig;
use crate::driver::{AdapterTransport, TransportError};
use crate::types::repr_c::{HwFib, FIB_SIZE};
use crate::types::{sync_command, AacInit, HwFibRef};

pub const ADAPTER_FIBS_SIZE: usize = 4096;
pub const AIF_FIB_COUNT: u32 = (ADAPTER_FIBS_SIZE / FIB_SIZE) as u32;
pub const QUEUE_ALIGN: usize = 16;
pub const PRINTF_BUFFER_SIZE: usize = 256;
pub const INIT_STRUCT_REVISION: u32 = 3;
pub const MINI_PORT_REVISION: u32 = 1;
/// Largest host page count the init descriptor can express.
pub const MAX_HOST_PHYS_MEM_PAGES: u32 = 0xFFFFF;

/// Communication region setup errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommInitError {
    #[error("communication region allocation failed: {0}")]
    Dma(#[from] DmaError),
    #[error("adapter did not take the init descriptor: {0}")]
    Transport(#[from] TransportError),
}

/// Offsets of every sub-area inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommLayout {
    pub init_offset: usize,
    pub queues_offset: usize,
    pub printf_offset: usize,
    pub size: usize,
}

impl CommLayout {
    /// Bytes to allocate, including worst-case alignment slack.
    pub const ALLOC_SIZE: usize = ADAPTER_FIBS_SIZE
        + size_of::<AacInit>()
        + QUEUE_AREA_SIZE
        + QUEUE_ALIGN
        + PRINTF_BUFFER_SIZE;

    /// Layout for a region starting at `base`.
    ///
    /// The gap before the queue headers is `QUEUE_ALIGN - (addr % QUEUE_ALIGN)`,
    /// a full 16 bytes when the address is already aligned.
    pub fn for_base(base: u64) -> Self {
        let init_offset = ADAPTER_FIBS_SIZE;
        let after_init = init_offset + size_of::<AacInit>();
        let misalign = (base as usize + after_init) & (QUEUE_ALIGN - 1);
        let queues_offset = after_init + (QUEUE_ALIGN - misalign);
        Self {
            init_offset,
            queues_offset,
            printf_offset: queues_offset + QUEUE_AREA_SIZE,
            size: Self::ALLOC_SIZE,
        }
    }
}

/// Host page count as reported to the adapter, clamped rather than wrapped.
pub fn host_phys_mem_pages(bytes: u64) -> u32 {
    let pages = bytes / PAGE_SIZE as u64;
    pages.min(MAX_HOST_PHYS_MEM_PAGES as u64) as u32
}

/// The shared communication region and the queues inside it.
pub struct CommRegion {
    dma: Arc<dyn DmaAllocator>,
    region: Option<DmaRegion>,
    layout: CommLayout,
    base_cpu: *mut u8,
    base_bus: u64,
    queues: CommQueues,
}

// Pointers target `region`, owned by this value.
unsafe impl Send for CommRegion {}
unsafe impl Sync for CommRegion {}

impl CommRegion {
    /// Allocate and lay out the region and fill in the init descriptor.
    pub fn build(
        dma: Arc<dyn DmaAllocator>,
        config: &AdapterConfig,
        elapsed_seconds: u32,
    ) -> Result<Self, CommInitError> {
        let region = dma.alloc_coherent(CommLayout::ALLOC_SIZE, PAGE_SIZE)?;
        let base_cpu = region.cpu_ptr();
        let base_bus = region.bus_addr();
        let layout = CommLayout::for_base(base_bus);

        let init = AacInit {
            init_struct_revision: INIT_STRUCT_REVISION,
            mini_port_revision: MINI_PORT_REVISION,
            fsrev: config.fsrev,
            comm_header_address: (base_bus + layout.queues_offset as u64) as u32,
            fast_io_comm_area_address: 0,
            adapter_fibs_physical_address: base_bus as u32,
            adapter_fibs_virtual_address: 0,
            adapter_fibs_size: ADAPTER_FIBS_SIZE as u32,
            adapter_fib_align: FIB_SIZE as u32,
            printfbuf: (base_bus + layout.printf_offset as u64) as u32,
            printfbufsiz: PRINTF_BUFFER_SIZE as u32,
            host_phys_mem_pages: host_phys_mem_pages(config.host_memory_bytes),
            host_elapsed_seconds: elapsed_seconds,
            init_flags: 0,
            max_io_commands: config.total_fibs() as u32,
            max_io_size: config.max_io_size,
            max_fib_size: config.max_fib_size as u32,
        };

        let queues = unsafe {
            init.store(base_cpu.add(layout.init_offset) as *mut AacInit);
            core::ptr::write_bytes(base_cpu.add(layout.printf_offset), 0, PRINTF_BUFFER_SIZE);
            CommQueues::init(base_cpu.add(layout.queues_offset), config.interrupt_moderation)
        };

        debug!(
            "[aacraid] comm region bus={:#x} queues=+{:#x} printf=+{:#x}",
            base_bus, layout.queues_offset, layout.printf_offset
        );

        Ok(Self {
            dma,
            region: Some(region),
            layout,
            base_cpu,
            base_bus,
            queues,
        })
    }

    /// Build the region and hand the init descriptor to the adapter.
    pub fn init(
        dma: Arc<dyn DmaAllocator>,
        transport: &dyn AdapterTransport,
        config: &AdapterConfig,
        elapsed_seconds: u32,
    ) -> Result<Self, CommInitError> {
        let comm = Self::build(dma, config, elapsed_seconds)?;
        let status = transport.sync_cmd(sync_command::INIT_STRUCT_BASE_ADDRESS, comm.init_bus() as u32)?;
        info!(
            "[aacraid] {}: init descriptor at {:#x} accepted (status {:#x})",
            transport.name(),
            comm.init_bus(),
            status
        );
        Ok(comm)
    }

    #[inline]
    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    #[inline]
    pub fn queues(&self) -> &CommQueues {
        &self.queues
    }

    /// Bus address of the init descriptor.
    #[inline]
    pub fn init_bus(&self) -> u64 {
        self.base_bus + self.layout.init_offset as u64
    }

    /// Bus address of the region.
    #[inline]
    pub fn base_bus(&self) -> u64 {
        self.base_bus
    }

    /// Read back the init descriptor.
    pub fn init_descriptor(&self) -> AacInit {
        unsafe { AacInit::load(self.base_cpu.add(self.layout.init_offset) as *const AacInit) }
    }

    /// Adapter-initiated FIB addressed by a host command queue entry.
    ///
    /// The entry carries an offset into the AIF area.
    pub fn aif_fib(&self, entry_addr: u32) -> Option<HwFibRef> {
        let index = entry_addr / FIB_SIZE as u32;
        if index >= AIF_FIB_COUNT {
            return None;
        }
        Some(unsafe {
            HwFibRef::new(self.base_cpu.add(index as usize * FIB_SIZE) as *mut HwFib)
        })
    }

    /// CPU pointer to the printf buffer.
    pub(crate) fn printf_buffer(&self) -> *mut u8 {
        unsafe { self.base_cpu.add(self.layout.printf_offset) }
    }
}

impl Drop for CommRegion {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.dma.free_coherent(region);
        }
    }
}
