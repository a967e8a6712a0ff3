//! Time and timing module.
//!
//! Every poll and every blocking wait in the driver is bounded by one of
//! these deadlines.

use std::time::{Duration, Instant};

/// Timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    sync_cmd: Duration,
    sync_poll: Duration,
    firmware_startup: Duration,
    fib_response: Duration,
    queue_full: Duration,
    aif_stale: Duration,
    aif_idle: Duration,
}

impl TimeoutConfig {
    /// Timeouts matching adapter firmware expectations.
    pub const fn new() -> Self {
        Self {
            sync_cmd: Duration::from_secs(30),
            sync_poll: Duration::from_micros(5),
            firmware_startup: Duration::from_secs(180),
            fib_response: Duration::from_secs(180),
            queue_full: Duration::from_secs(10),
            aif_stale: Duration::from_secs(120),
            aif_idle: Duration::from_millis(100),
        }
    }

    /// Synchronous mailbox command acknowledgement (30 seconds)
    #[inline]
    pub fn sync_cmd(&self) -> Duration {
        self.sync_cmd
    }

    /// Delay between doorbell polls while a sync command runs (5us)
    #[inline]
    pub fn sync_poll(&self) -> Duration {
        self.sync_poll
    }

    /// Firmware kernel coming up after reset (180 seconds)
    #[inline]
    pub fn firmware_startup(&self) -> Duration {
        self.firmware_startup
    }

    /// Waiting caller of a synchronous FIB (180 seconds)
    #[inline]
    pub fn fib_response(&self) -> Duration {
        self.fib_response
    }

    /// Producer blocked on a full queue (10 seconds)
    #[inline]
    pub fn queue_full(&self) -> Duration {
        self.queue_full
    }

    /// Age after which a backlogged AIF listener is evicted (2 minutes)
    #[inline]
    pub fn aif_stale(&self) -> Duration {
        self.aif_stale
    }

    /// AIF worker re-check interval when no doorbell arrives (100ms)
    #[inline]
    pub fn aif_idle(&self) -> Duration {
        self.aif_idle
    }

    pub fn with_sync_cmd(mut self, d: Duration) -> Self {
        self.sync_cmd = d;
        self
    }

    pub fn with_sync_poll(mut self, d: Duration) -> Self {
        self.sync_poll = d;
        self
    }

    pub fn with_firmware_startup(mut self, d: Duration) -> Self {
        self.firmware_startup = d;
        self
    }

    pub fn with_fib_response(mut self, d: Duration) -> Self {
        self.fib_response = d;
        self
    }

    pub fn with_queue_full(mut self, d: Duration) -> Self {
        self.queue_full = d;
        self
    }

    pub fn with_aif_stale(mut self, d: Duration) -> Self {
        self.aif_stale = d;
        self
    }

    pub fn with_aif_idle(mut self, d: Duration) -> Self {
        self.aif_idle = d;
        self
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time after which a poll gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400 * 365)),
        }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, zero once expired.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}
