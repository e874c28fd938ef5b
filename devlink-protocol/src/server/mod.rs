//! Server factory and application-facing callbacks.

pub mod events;
pub mod factory;

pub use events::{ClientDescription, DeviceDescription, DeviceKind, ServerEvents};
pub use factory::{create_browser_server, create_server, TransportKind};
