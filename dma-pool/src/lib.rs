//! DMA-coherent memory for host/adapter shared structures.
//!
//! A [`DmaRegion`] pairs the CPU view of a block with the bus address the
//! device uses for the same bytes. Drivers obtain regions from a
//! [`DmaAllocator`]; the allocator is the only component that knows how the
//! two address spaces relate.
//!
//! [`HostDmaAllocator`] backs regions with ordinary host memory and hands out
//! synthetic 32-bit bus addresses, which is what the adapter firmware can
//! represent on the wire.

pub mod allocator;
pub mod region;

pub use allocator::{DmaAllocator, DmaError, HostDmaAllocator};
pub use region::DmaRegion;

/// Page size assumed for DMA placement.
pub const PAGE_SIZE: usize = 4096;
