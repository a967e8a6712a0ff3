//! Host/adapter communication: shared region, queues, FIBs and AIFs.

pub mod aif;
pub mod dispatch;
pub mod fib;
pub mod printf;
pub mod queue;
pub mod region;

pub use aif::{AifCommand, AifHub, ContextError, ContextId};
pub use dispatch::{Dispatcher, FibStats, FibStatsSnapshot, SendError, SendErrorKind, SendOutcome};
pub use fib::{Fib, FibCallback, FibError, FibPool};
pub use printf::PrintfMessage;
pub use queue::{CommQueues, QueueError, QueueId, QueueSlot};
pub use region::{CommInitError, CommLayout, CommRegion};
