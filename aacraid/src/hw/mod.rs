//! Hardware access primitives.
//!
//! These are the building blocks every transport uses:
//! - `mmio` - register window access behind the [`RegisterIo`] trait
//! - `barriers` - ordering between shared-memory writes and doorbells

pub mod barriers;
pub mod mmio;

pub use barriers::{lfence, sfence};
pub use mmio::{Mmio, RegisterIo};
