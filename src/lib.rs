//! Bridge from a BLE GNSS accessory to the operating system's mock location
//! providers.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod session;

#[cfg(test)]
mod test_support;

pub use error::BridgeError;
pub use session::{SessionConfig, SessionController, SessionPorts, SessionStatus};
