//! Memory barriers.
//!
//! The host and the adapter share the communication region without any
//! common lock, so these are what order entry writes against index updates
//! and doorbell rings.

use core::sync::atomic::{fence, Ordering};

/// Store fence - all prior stores are visible before any later store.
///
/// Use before publishing a producer index or ringing a doorbell.
#[inline]
pub fn sfence() {
    fence(Ordering::Release);
}

/// Load fence - all prior loads complete before subsequent loads.
///
/// Use after reading an adapter-written index, before reading the entry.
#[inline]
pub fn lfence() {
    fence(Ordering::Acquire);
}
