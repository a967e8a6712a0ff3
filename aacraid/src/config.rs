//! Adapter configuration.

use crate::time::TimeoutConfig;
use crate::types::repr_c::FIB_SIZE;

/// Per-adapter configuration, fixed at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConfig {
    /// FIBs reserved for I/O commands.
    pub io_fibs: u16,
    /// FIBs reserved for management commands.
    pub mgt_fibs: u16,
    /// Hardware FIB size announced to the adapter.
    pub max_fib_size: u16,
    /// Largest single transfer announced to the adapter.
    pub max_io_size: u32,
    /// Physical memory installed in the host, in bytes.
    pub host_memory_bytes: u64,
    /// Allow the nearly-full doorbell suppression hint.
    pub interrupt_moderation: bool,
    /// Queued AIF copies after which a stale listener is evicted.
    pub aif_backlog_limit: usize,
    /// Host file-system revision reported in the init descriptor.
    pub fsrev: u32,
    pub timeouts: TimeoutConfig,
}

impl AdapterConfig {
    pub const fn new() -> Self {
        Self {
            io_fibs: 256,
            mgt_fibs: 64,
            max_fib_size: FIB_SIZE as u16,
            max_io_size: 64 * 1024,
            host_memory_bytes: 0,
            interrupt_moderation: true,
            aif_backlog_limit: 20,
            fsrev: 0,
            timeouts: TimeoutConfig::new(),
        }
    }

    /// Total FIBs in the pool.
    #[inline]
    pub fn total_fibs(&self) -> usize {
        self.io_fibs as usize + self.mgt_fibs as usize
    }

    pub fn with_fibs(mut self, io_fibs: u16, mgt_fibs: u16) -> Self {
        self.io_fibs = io_fibs;
        self.mgt_fibs = mgt_fibs;
        self
    }

    pub fn with_host_memory(mut self, bytes: u64) -> Self {
        self.host_memory_bytes = bytes;
        self
    }

    pub fn with_interrupt_moderation(mut self, enabled: bool) -> Self {
        self.interrupt_moderation = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new()
    }
}
