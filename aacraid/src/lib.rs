//! Host side of the Adaptec RAID (aacraid) FIB command protocol.
//!
//! The host and the adapter talk through one shared DMA region holding an
//! init descriptor, eight ring queues and an area for adapter-initiated
//! FIBs. Layers, bottom up:
//!
//! - [`hw`] - register access and memory barriers
//! - [`driver`] - per-family register transports (`rx`, `sa`)
//! - [`comm`] - shared region, queues, FIB pool, dispatch and AIFs
//! - [`adapter`] - attach, interrupt service and shutdown
//!
//! ```ignore
//! let transport = Arc::new(RxTransport::new(mmio, dma.clone(), TimeoutConfig::new()));
//! let adapter = Adapter::attach(transport, dma, AdapterConfig::new())?;
//! // from the interrupt handler
//! adapter.handle_interrupt();
//! ```

pub mod adapter;
pub mod comm;
pub mod config;
pub mod driver;
pub mod hw;
pub mod sync;
pub mod time;
pub mod types;

#[cfg(test)]
mod testing;

pub use adapter::{Adapter, AdapterError, AttachError};
pub use comm::{
    ContextError, ContextId, Dispatcher, Fib, FibCallback, FibError, SendError, SendErrorKind,
    SendOutcome,
};
pub use config::AdapterConfig;
pub use driver::{AdapterHealth, AdapterTransport, RxTransport, SaTransport};
pub use time::TimeoutConfig;
pub use types::Priority;
