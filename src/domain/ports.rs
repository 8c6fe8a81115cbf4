//! Port traits: the boundary between the bridge core and the platform.
//!
//! ```text
//!   Platform adapter ──▶ Port trait ──▶ BluetoothService / MockLocationManager
//! ```
//!
//! The core only ever talks to the operating system through these traits, so
//! every gated operation can be exercised against in-memory fakes.

use crate::domain::models::{Capability, LocationFix, StatusUpdate};
use thiserror::Error;

/// Persisted "mock enabled" flag controlling the whole pipeline.
pub trait SessionFlag: Send + Sync {
    fn get(&self) -> bool;
    fn set(&self, enabled: bool);
}

/// Runtime permission query. Never cache the answer: capabilities can be
/// revoked between two calls.
pub trait PermissionQuery: Send + Sync {
    fn has_capability(&self, capability: Capability) -> bool;
}

/// Fire-and-forget status output (UI, notification, log...).
pub trait StatusSink: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

/// Failure reported by the OS mock location service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    /// The provider lost its test-provider status (app unselected as mock
    /// location app, provider removed by the system, ...).
    #[error("{0} is not a test provider")]
    NotTestProvider(String),

    /// The caller is not allowed to mock locations.
    #[error("security exception: {0}")]
    Security(String),

    #[error("{0}")]
    Rejected(String),
}

/// OS facility for named test location providers.
pub trait MockLocationSurface: Send + Sync {
    /// Whether this app is currently selected as the mock location app.
    fn is_mock_provider_allowed(&self) -> bool;

    fn add_test_provider(&self, provider: &str) -> Result<(), SurfaceError>;

    fn remove_test_provider(&self, provider: &str) -> Result<(), SurfaceError>;

    fn set_test_provider_enabled(&self, provider: &str, enabled: bool) -> Result<(), SurfaceError>;

    fn set_test_provider_location(&self, provider: &str, fix: &LocationFix) -> Result<(), SurfaceError>;
}
