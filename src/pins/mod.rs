//! Pin identifiers, per-pin state and the shared registry.

pub mod header;
pub mod registry;
pub mod state;

// Re-export commonly used items
pub use header::{gpio_map, PinId, HEADER};
pub use registry::PinRegistry;
pub use state::{Lease, Owner, PeripheralMode, PinMode, PinSnapshot, PinStateRecord};
