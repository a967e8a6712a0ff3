//! Shared data types module.
//!
//! Contains all #[repr(C)] structures that live in memory shared with the
//! adapter, plus the command codes and state flags that travel inside them.

pub mod repr_c;

use bitflags::bitflags;

// Re-exports
pub use repr_c::{AacInit, FibHeader, HwFib, HwFibRef, QueueEntry};

bitflags! {
    /// FIB transfer state. Travels in the first header word of every FIB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XferState: u32 {
        const HOST_OWNED = 1 << 0;
        const ADAPTER_OWNED = 1 << 1;
        const FIB_INITIALIZED = 1 << 2;
        const FIB_EMPTY = 1 << 3;
        const ALLOCATED_FROM_POOL = 1 << 4;
        const SENT_FROM_HOST = 1 << 5;
        const SENT_FROM_ADAPTER = 1 << 6;
        const RESPONSE_EXPECTED = 1 << 7;
        const NO_RESPONSE_EXPECTED = 1 << 8;
        const ADAPTER_PROCESSED = 1 << 9;
        const HOST_PROCESSED = 1 << 10;
        const HIGH_PRIORITY = 1 << 11;
        const NORMAL_PRIORITY = 1 << 12;
        const ASYNC = 1 << 13;
        const PAGE_FILE_IO = 1 << 14;
        const SHUTDOWN_REQUEST = 1 << 15;
        const LAZY_WRITE = 1 << 16;
        const ADAPTER_MICRO_FIB = 1 << 17;
        const BIOS_FIB_PATH = 1 << 18;
        const FAST_RESPONSE_CAPABLE = 1 << 19;
        const API_FIB = 1 << 20;
    }
}

/// Submission priority. Selects which command/response queue pair is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    /// The transfer-state flag that tags a FIB with this priority.
    pub fn xfer_flag(self) -> XferState {
        match self {
            Priority::Normal => XferState::NORMAL_PRIORITY,
            Priority::High => XferState::HIGH_PRIORITY,
        }
    }
}

/// `StructType` tag of a well-formed FIB.
pub const FIB_MAGIC: u8 = 0x01;

/// Status word written into the payload of a successfully handled FIB.
pub const ST_OK: u32 = 0;

/// FIB command codes.
pub mod command {
    pub const TEST_COMMAND: u16 = 1;
    pub const TEST_ADAPTER_COMMAND: u16 = 2;
    pub const NU_FILE_SYSTEM: u16 = 300;
    pub const CONTAINER_COMMAND: u16 = 500;
    pub const CONTAINER_COMMAND_64: u16 = 501;
    pub const RAW_IO: u16 = 502;
    pub const AIF_REQUEST: u16 = 700;
    pub const CHECK_REVISION: u16 = 701;
    pub const FSA_HOST_SHUTDOWN: u16 = 702;
    pub const REQUEST_ADAPTER_INFO: u16 = 703;
    pub const IS_ADAPTER_PAUSED: u16 = 704;
    pub const SEND_HOST_TIME: u16 = 705;
}

/// Container (`VM_*`) sub-commands carried in a `CONTAINER_COMMAND` payload.
pub mod container {
    pub const VM_NULL: u32 = 0;
    pub const VM_NAME_SERVE: u32 = 1;
    pub const VM_CONTAINER_CONFIG: u32 = 2;
    pub const VM_IOCTL: u32 = 3;
    pub const VM_FILESYSTEM_IOCTL: u32 = 4;
    pub const VM_CLOSE_ALL: u32 = 5;

    /// Container id meaning "every container".
    pub const ALL_CONTAINERS: u32 = 0xffff_ffff;
}

/// Synchronous (mailbox) command codes.
pub mod sync_command {
    pub const BREAKPOINT_REQUEST: u32 = 0x0000_0004;
    pub const INIT_STRUCT_BASE_ADDRESS: u32 = 0x0000_0005;
    pub const READ_PERMANENT_PARAMETERS: u32 = 0x0000_000a;
    pub const WRITE_PERMANENT_PARAMETERS: u32 = 0x0000_000b;
    pub const SEND_SYNCHRONOUS_FIB: u32 = 0x0000_000c;
    pub const HOST_CRASHING: u32 = 0x0000_000d;
    pub const COMMAND_POST_RESULTS: u32 = 0x0000_0014;
    pub const GET_ADAPTER_PROPERTIES: u32 = 0x0000_0019;
}

/// Firmware status bits reported in mailbox 7.
pub mod fw_status {
    pub const SELF_TEST_FAILED: u32 = 0x0000_0004;
    pub const MONITOR_PANIC: u32 = 0x0000_0020;
    pub const KERNEL_UP_AND_RUNNING: u32 = 0x0000_0080;
    pub const KERNEL_PANIC: u32 = 0x0000_0100;
}

/// Adapter printf severity levels.
pub const LOG_AAC_INFO: u16 = 100;
pub const LOG_AAC_HIGH_ERROR: u16 = 200;
