//! Adapter transports.
//!
//! Two register layouts are supported:
//! - `rx` - i960 Rx/Rocket style message unit (32-bit doorbells, OIMR mask)
//! - `sa` - StrongARM style doorbells (16-bit set/clear pairs)
//!
//! Both poll synchronous commands with a bounded deadline and never block on
//! an interrupt, so they work before the interrupt line is wired.

pub mod rx;
pub mod sa;
pub mod traits;

pub use rx::RxTransport;
pub use sa::SaTransport;
pub use traits::{
    AdapterHealth, AdapterNotify, AdapterTransport, HostDoorbell, InterruptEvent, TransportError,
};
