//! Desktop implementations of the bridge ports, used by the binary.

use crate::domain::models::{Capability, LocationFix, StatusUpdate};
use crate::domain::ports::{MockLocationSurface, PermissionQuery, StatusSink, SurfaceError};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Desktop hosts have no runtime permission model.
pub struct GrantedPermissions;

impl PermissionQuery for GrantedPermissions {
    fn has_capability(&self, _capability: Capability) -> bool {
        true
    }
}

/// Writes every status update to the log.
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn publish(&self, update: StatusUpdate) {
        match update {
            StatusUpdate::Link(link) => {
                info!("Link: connected={} scanning={}", link.connected, link.scanning)
            }
            StatusUpdate::Record(record) => match serde_json::to_string(&record) {
                Ok(json) => info!("Status: {}", json),
                Err(e) => warn!("Unserializable status record: {}", e),
            },
        }
    }
}

/// Mock location surface that appends every pushed fix to a JSON lines file.
///
/// Each line is `{"provider": "...", "fix": {...}}`.
pub struct JournalSurface {
    path: PathBuf,
    /// provider name -> enabled
    providers: Mutex<BTreeMap<String, bool>>,
}

impl JournalSurface {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        info!("Mock locations are journaled to {:?}", path);
        Ok(Self {
            path,
            providers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, provider: &str, fix: &LocationFix) -> std::io::Result<()> {
        let line = json!({ "provider": provider, "fix": fix });
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)
    }

    fn lock_providers(&self) -> MutexGuard<'_, BTreeMap<String, bool>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockLocationSurface for JournalSurface {
    fn is_mock_provider_allowed(&self) -> bool {
        true
    }

    fn add_test_provider(&self, provider: &str) -> Result<(), SurfaceError> {
        self.lock_providers().insert(provider.to_string(), false);
        debug!("Journal provider {} added", provider);
        Ok(())
    }

    fn remove_test_provider(&self, provider: &str) -> Result<(), SurfaceError> {
        match self.lock_providers().remove(provider) {
            Some(_) => Ok(()),
            None => Err(SurfaceError::NotTestProvider(provider.to_string())),
        }
    }

    fn set_test_provider_enabled(&self, provider: &str, enabled: bool) -> Result<(), SurfaceError> {
        match self.lock_providers().get_mut(provider) {
            Some(state) => {
                *state = enabled;
                Ok(())
            }
            None => Err(SurfaceError::NotTestProvider(provider.to_string())),
        }
    }

    fn set_test_provider_location(&self, provider: &str, fix: &LocationFix) -> Result<(), SurfaceError> {
        match self.lock_providers().get(provider) {
            Some(true) => {}
            Some(false) => return Err(SurfaceError::Rejected(format!("{} is disabled", provider))),
            None => return Err(SurfaceError::NotTestProvider(provider.to_string())),
        }
        self.append(provider, fix)
            .map_err(|e| SurfaceError::Rejected(format!("journal write failed: {}", e)))
    }
}
