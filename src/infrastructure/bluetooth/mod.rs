//! Bluetooth Module
//!
//! Provides BLE communication with the GNSS accessory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (state machine, auto-rescan, telemetry forwarding)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ TransportEvent
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      BleTransport                        │
//! │   scan ─ connect ─ MTU ─ discovery ─ CCCD ─ read/write   │
//! └──────────┬──────────────────────────────┬───────────────┘
//!            │ Radio / RadioEvent           │ payloads
//!            ▼                              ▼
//! ┌───────────────────┐             ┌──────────────┐
//! │  Radio backend    │             │   Protocol   │
//! │  (WinRT on Win32) │             │  UUIDs, JSON │
//! └───────────────────┘             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Accessory identifiers and the telemetry codec
//! - [`radio`] - Platform radio port and its callback events
//! - [`transport`] - Link management on top of the radio
//! - [`service`] - Connection state machine
//! - `winrt` - Windows radio backend

pub mod protocol;
pub mod radio;
pub mod service;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use service::BluetoothService;
pub use transport::BleTransport;
