//! #[repr(C)] structures shared with the adapter.
//!
//! CRITICAL: These structures MUST match the firmware layout exactly.
//! All multi-byte fields are little-endian on the wire; the accessors below
//! convert at every load and store.

use core::mem::{offset_of, size_of};
use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

/// Size of a hardware FIB (header + payload).
pub const FIB_SIZE: usize = 512;
/// Size of the FIB header.
pub const FIB_HEADER_SIZE: usize = 32;
/// Payload capacity of a hardware FIB.
pub const FIB_DATA_SIZE: usize = FIB_SIZE - FIB_HEADER_SIZE;

/// FIB header (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FibHeader {
    /// Transfer state bitmask.
    pub xfer_state: u32,
    /// Command code.
    pub command: u16,
    /// Structure type tag (`FIB_MAGIC`).
    pub struct_type: u8,
    /// Host-internal flags, always zero on the wire.
    pub flags: u8,
    /// Size of this FIB: header plus used payload.
    pub size: u16,
    /// Capacity of the FIB in the sender.
    pub sender_size: u16,
    /// Sender's handle for this FIB (shifted pool index for host FIBs).
    pub sender_fib_address: u32,
    /// Address the receiver should answer into.
    pub receiver_fib_address: u32,
    /// Opaque sender data (pool index for host FIBs).
    pub sender_data: u32,
    /// Adapter timestamp when it started the FIB.
    pub receiver_time_start: u32,
    /// Adapter timestamp when it finished the FIB.
    pub receiver_time_done: u32,
}

/// Hardware FIB: the unit exchanged with the adapter.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HwFib {
    pub header: FibHeader,
    pub data: [u8; FIB_DATA_SIZE],
}

/// Queue entry (8 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueEntry {
    /// Size of the FIB the entry refers to.
    pub size: u32,
    /// Bus address (commands) or sender handle (responses) of the FIB.
    pub addr: u32,
}

/// Init descriptor handed to the adapter by `INIT_STRUCT_BASE_ADDRESS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AacInit {
    pub init_struct_revision: u32,
    pub mini_port_revision: u32,
    pub fsrev: u32,
    pub comm_header_address: u32,
    pub fast_io_comm_area_address: u32,
    pub adapter_fibs_physical_address: u32,
    pub adapter_fibs_virtual_address: u32,
    pub adapter_fibs_size: u32,
    pub adapter_fib_align: u32,
    pub printfbuf: u32,
    pub printfbufsiz: u32,
    pub host_phys_mem_pages: u32,
    pub host_elapsed_seconds: u32,
    // Revision 4 fields
    pub init_flags: u32,
    pub max_io_commands: u32,
    pub max_io_size: u32,
    pub max_fib_size: u32,
}

const _: () = assert!(size_of::<FibHeader>() == FIB_HEADER_SIZE);
const _: () = assert!(size_of::<HwFib>() == FIB_SIZE);
const _: () = assert!(size_of::<QueueEntry>() == 8);
const _: () = assert!(size_of::<AacInit>() == 17 * 4);

impl AacInit {
    /// Store into shared memory, converting every field to little-endian.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `size_of::<AacInit>()` bytes.
    pub unsafe fn store(&self, dst: *mut AacInit) {
        let words: [u32; 17] = core::mem::transmute(*self);
        let out = dst as *mut u32;
        for (i, w) in words.iter().enumerate() {
            write_volatile(out.add(i), w.to_le());
        }
    }

    /// Load from shared memory.
    ///
    /// # Safety
    /// `src` must be valid for reads of `size_of::<AacInit>()` bytes.
    pub unsafe fn load(src: *const AacInit) -> AacInit {
        let mut words = [0u32; 17];
        let inp = src as *const u32;
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le(read_volatile(inp.add(i)));
        }
        core::mem::transmute(words)
    }
}

/// Volatile view of a hardware FIB living in DMA memory.
///
/// The adapter may write the same bytes at any time, so nothing here hands
/// out Rust references into the FIB; every access is a volatile load/store.
#[derive(Debug, Clone, Copy)]
pub struct HwFibRef {
    ptr: *mut HwFib,
}

macro_rules! header_field {
    ($get:ident, $set:ident, $field:ident, $ty:ty) => {
        #[inline]
        pub fn $get(&self) -> $ty {
            unsafe { <$ty>::from_le(read_volatile(addr_of!((*self.ptr).header.$field))) }
        }

        #[inline]
        pub fn $set(&self, value: $ty) {
            unsafe { write_volatile(addr_of_mut!((*self.ptr).header.$field), value.to_le()) }
        }
    };
}

impl HwFibRef {
    /// Wrap a pointer to a hardware FIB.
    ///
    /// # Safety
    /// `ptr` must point to `FIB_SIZE` bytes of DMA memory that stay mapped
    /// for the lifetime of every copy of the returned view.
    pub unsafe fn new(ptr: *mut HwFib) -> Self {
        Self { ptr }
    }

    /// Raw pointer to the FIB.
    #[inline]
    pub fn as_ptr(&self) -> *mut HwFib {
        self.ptr
    }

    header_field!(raw_xfer_state, set_raw_xfer_state, xfer_state, u32);
    header_field!(command, set_command, command, u16);
    header_field!(size, set_size, size, u16);
    header_field!(sender_size, set_sender_size, sender_size, u16);
    header_field!(sender_fib_address, set_sender_fib_address, sender_fib_address, u32);
    header_field!(receiver_fib_address, set_receiver_fib_address, receiver_fib_address, u32);
    header_field!(sender_data, set_sender_data, sender_data, u32);

    #[inline]
    pub fn struct_type(&self) -> u8 {
        unsafe { read_volatile(addr_of!((*self.ptr).header.struct_type)) }
    }

    #[inline]
    pub fn set_struct_type(&self, value: u8) {
        unsafe { write_volatile(addr_of_mut!((*self.ptr).header.struct_type), value) }
    }

    #[inline]
    pub fn set_flags(&self, value: u8) {
        unsafe { write_volatile(addr_of_mut!((*self.ptr).header.flags), value) }
    }

    /// Transfer state, unknown bits preserved.
    #[inline]
    pub fn xfer_state(&self) -> super::XferState {
        super::XferState::from_bits_retain(self.raw_xfer_state())
    }

    #[inline]
    pub fn set_xfer_state(&self, state: super::XferState) {
        self.set_raw_xfer_state(state.bits());
    }

    /// OR flags into the transfer state.
    #[inline]
    pub fn insert_xfer_state(&self, flags: super::XferState) {
        self.set_xfer_state(self.xfer_state() | flags);
    }

    /// Pointer to the payload area.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { (self.ptr as *mut u8).add(offset_of!(HwFib, data)) }
    }

    /// Copy `src` into the start of the payload.
    ///
    /// # Panics
    /// Panics if `src` exceeds the payload capacity.
    pub fn write_data(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= FIB_DATA_SIZE, "FIB payload overflow");
        for (i, b) in src.iter().enumerate() {
            unsafe { write_volatile(self.data_ptr().add(offset + i), *b) };
        }
    }

    /// Copy payload bytes starting at `offset` into `dst`.
    pub fn read_data(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= FIB_DATA_SIZE, "FIB payload overflow");
        for (i, b) in dst.iter_mut().enumerate() {
            *b = unsafe { read_volatile(self.data_ptr().add(offset + i)) };
        }
    }

    /// Little-endian u32 at `offset` in the payload.
    pub fn data_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read_data(offset, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn set_data_u32(&self, offset: usize, value: u32) {
        self.write_data(offset, &value.to_le_bytes());
    }

    /// Snapshot of the whole FIB.
    pub fn snapshot(&self) -> HwFib {
        unsafe { read_volatile(self.ptr) }
    }

    /// Overwrite the whole FIB.
    pub fn store(&self, fib: &HwFib) {
        unsafe { write_volatile(self.ptr, *fib) }
    }

    /// Zero header and payload.
    pub fn clear(&self) {
        unsafe { core::ptr::write_bytes(self.ptr as *mut u8, 0, FIB_SIZE) }
    }
}

unsafe impl Send for HwFibRef {}
unsafe impl Sync for HwFibRef {}

impl HwFib {
    /// An all-zero FIB.
    pub const fn zeroed() -> Self {
        Self {
            header: FibHeader {
                xfer_state: 0,
                command: 0,
                struct_type: 0,
                flags: 0,
                size: 0,
                sender_size: 0,
                sender_fib_address: 0,
                receiver_fib_address: 0,
                sender_data: 0,
                receiver_time_start: 0,
                receiver_time_done: 0,
            },
            data: [0; FIB_DATA_SIZE],
        }
    }
}

impl core::fmt::Debug for HwFib {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HwFib")
            .field("header", &self.header)
            .field("data", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

impl Default for HwFib {
    fn default() -> Self {
        Self::zeroed()
    }
}
