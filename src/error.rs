//! Error taxonomy for the BLE bridge and the mock location pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::Capability;

/// Android's `SCAN_FAILED_INTERNAL_ERROR`, reused for locally refused scans.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("missing {capability:?} permission: {operation}")]
    PermissionDenied {
        capability: Capability,
        operation: &'static str,
    },

    #[error("Bluetooth is not enabled")]
    RadioUnavailable,

    #[error("scan timed out without finding the accessory")]
    ScanTimeout,

    #[error("scan failed with error code {0}")]
    ScanFailed(i32),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("service discovery failed with status {0}")]
    ServiceDiscoveryFailed(i32),

    #[error("GPS service ({0}) not found")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("descriptor write failed for {characteristic}: {reason}")]
    DescriptorWriteFailed { characteristic: Uuid, reason: String },

    #[error("characteristic read failed for {characteristic}, status {status}")]
    ReadFailed { characteristic: Uuid, status: i32 },

    #[error("write to {characteristic} failed: {reason}")]
    WriteFailed { characteristic: Uuid, reason: String },

    #[error("error parsing data for {characteristic}: {reason}")]
    PayloadParseError { characteristic: Uuid, reason: String },

    #[error("mock locations are not enabled for this app in developer settings")]
    MockLocationDisabled,

    #[error("mock provider setup failed: {0}")]
    ProviderRegistrationFailed(String),

    #[error("provider {0} is no longer a test provider")]
    ProviderRevoked(String),

    #[error("mock location push failed: {0}")]
    PushFailed(String),
}

impl BridgeError {
    /// Errors the auto-rescan loop recovers from on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ScanTimeout | Self::ScanFailed(_))
    }

    /// Errors that need the user to grant a permission or switch something on.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::RadioUnavailable | Self::MockLocationDisabled
        )
    }

    /// Malformed payloads never leave the transport's log.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::PayloadParseError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BridgeError::ScanFailed(2).is_retryable());
        assert!(BridgeError::ScanTimeout.is_retryable());
        assert!(!BridgeError::RadioUnavailable.is_retryable());
        assert!(BridgeError::RadioUnavailable.requires_user_action());
        assert!(BridgeError::PermissionDenied {
            capability: Capability::Scan,
            operation: "scan",
        }
        .requires_user_action());
        assert!(!BridgeError::ServiceNotFound(Uuid::nil()).is_retryable());
    }

    #[test]
    fn test_permission_message_names_capability() {
        let err = BridgeError::PermissionDenied {
            capability: Capability::Connect,
            operation: "poll telemetry",
        };
        assert_eq!(err.to_string(), "missing Connect permission: poll telemetry");
    }
}
