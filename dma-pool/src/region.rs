//! DMA region definition.

/// DMA-capable memory region.
///
/// Contains both the CPU-accessible pointer and the device-visible bus address.
#[derive(Debug)]
pub struct DmaRegion {
    /// CPU-accessible pointer to the region.
    cpu_ptr: *mut u8,
    /// Device-visible bus address.
    bus_addr: u64,
    /// Total size of the region in bytes.
    size: usize,
    /// Alignment the region was allocated with.
    align: usize,
}

impl DmaRegion {
    /// Create a new DMA region.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of valid DMA-capable memory
    /// - `bus_addr` must be the corresponding device-visible address
    pub unsafe fn new(cpu_ptr: *mut u8, bus_addr: u64, size: usize, align: usize) -> Self {
        debug_assert!(align.is_power_of_two(), "DMA alignment must be a power of two");
        Self {
            cpu_ptr,
            bus_addr,
            size,
            align,
        }
    }

    /// CPU pointer to the start of the region.
    #[inline]
    pub fn cpu_ptr(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// Bus address of the start of the region.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Region size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocation alignment.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// CPU pointer at `offset` bytes into the region.
    ///
    /// # Panics
    /// Panics if `offset` is past the end of the region.
    #[inline]
    pub fn cpu_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.size, "offset {offset:#x} outside DMA region");
        unsafe { self.cpu_ptr.add(offset) }
    }

    /// Bus address at `offset` bytes into the region.
    #[inline]
    pub fn bus_at(&self, offset: usize) -> u64 {
        assert!(offset <= self.size, "offset {offset:#x} outside DMA region");
        self.bus_addr + offset as u64
    }

    /// Whether `bus` falls inside this region.
    #[inline]
    pub fn contains_bus(&self, bus: u64) -> bool {
        bus >= self.bus_addr && bus < self.bus_addr + self.size as u64
    }

    /// Zero the whole region.
    pub fn zero(&self) {
        unsafe { core::ptr::write_bytes(self.cpu_ptr, 0, self.size) }
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}
