//! Mock Location Manager
//!
//! Drives the OS test providers through their lifecycle:
//!
//! ```text
//! Unregistered ──add──▶ Registered+Disabled ──enable──▶ Registered+Enabled
//!       ▲                                                     │
//!       └──────────── stop / revoked by the OS ───────────────┘
//! ```
//!
//! The OS can silently revoke test-provider status (for example when the
//! user picks another mock location app). A revoked provider gets exactly one
//! inline re-registration before it is dropped.

use crate::domain::location::{self, AccuracyPolicy, PreviousPosition};
use crate::domain::models::{Capability, LocationFix, ProviderRegistration, StatusRecord, StatusUpdate, TelemetryEvent};
use crate::domain::ports::{MockLocationSurface, PermissionQuery, SessionFlag, StatusSink, SurfaceError};
use crate::domain::settings::Settings;
use crate::domain::telemetry::{merge_telemetry, TelemetrySnapshot};
use crate::error::BridgeError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the mock provider pipeline
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Candidate provider names, in registration order
    pub providers: Vec<String>,
    /// Minimum spacing between two pushes
    pub min_update_interval: Duration,
    pub accuracy: AccuracyPolicy,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            providers: vec!["gps".to_string(), "network".to_string()],
            min_update_interval: Duration::from_millis(200),
            accuracy: AccuracyPolicy::default(),
        }
    }
}

impl MockConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            providers: settings.mock_providers.clone(),
            min_update_interval: Duration::from_millis(settings.min_update_interval_ms),
            accuracy: AccuracyPolicy::default(),
        }
    }
}

/// Why a location update was not pushed.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The session flag is off
    SessionDisabled,
    InvalidCoordinates,
    /// Providers could not be (re)activated
    Inactive(BridgeError),
    RateLimited,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Pushed { fix: LocationFix, providers: usize },
    Dropped(DropReason),
    Failed(BridgeError),
}

struct MockState {
    providers: BTreeMap<String, ProviderRegistration>,
    active: bool,
    last_push: Option<Instant>,
    last_fix: Option<(LocationFix, Instant)>,
    telemetry: TelemetrySnapshot,
    record: StatusRecord,
    session_start: Instant,
}

pub struct MockLocationManager {
    surface: Arc<dyn MockLocationSurface>,
    permissions: Arc<dyn PermissionQuery>,
    flag: Arc<dyn SessionFlag>,
    sink: Arc<dyn StatusSink>,
    config: MockConfig,
    state: Mutex<MockState>,
}

impl MockLocationManager {
    pub fn new(
        surface: Arc<dyn MockLocationSurface>,
        permissions: Arc<dyn PermissionQuery>,
        flag: Arc<dyn SessionFlag>,
        sink: Arc<dyn StatusSink>,
        config: MockConfig,
    ) -> Self {
        Self {
            surface,
            permissions,
            flag,
            sink,
            config,
            state: Mutex::new(MockState {
                providers: BTreeMap::new(),
                active: false,
                last_push: None,
                last_fix: None,
                telemetry: TelemetrySnapshot::default(),
                record: StatusRecord::default(),
                session_start: Instant::now(),
            }),
        }
    }

    /// Register every candidate provider that is not registered yet.
    ///
    /// Succeeds when at least one provider ends up registered.
    pub fn ensure_configured(&self) -> Result<(), BridgeError> {
        let mut state = self.lock_state();
        self.configure(&mut state)
    }

    /// Enable every registered provider.
    ///
    /// Succeeds when at least one provider ends up enabled.
    pub fn ensure_active(&self) -> Result<(), BridgeError> {
        let mut state = self.lock_state();
        self.activate(&mut state)
    }

    /// Check permissions, register and enable the providers, and publish the
    /// resulting running state.
    pub fn start_mocking(&self) -> Result<(), BridgeError> {
        let result = {
            let mut state = self.lock_state();
            let result = self.prepare(&mut state);
            match &result {
                Ok(()) => {
                    info!(
                        "Mock location started on {:?}",
                        state.providers.keys().collect::<Vec<_>>()
                    );
                    state.record.running = true;
                    state.record.error_message = None;
                }
                Err(e) => {
                    error!("Failed to start mock location: {}", e);
                    state.record.running = false;
                    state.record.error_message = Some(e.to_string());
                }
            }
            result
        };
        self.publish_status();
        result
    }

    /// Push one coordinate pair to every enabled provider.
    pub fn handle_location_update(&self, latitude: f64, longitude: f64) -> PushOutcome {
        if !self.flag.get() {
            debug!("Mock location disabled, dropping update");
            return PushOutcome::Dropped(DropReason::SessionDisabled);
        }
        if !latitude.is_finite() || !longitude.is_finite() {
            warn!("Rejecting non-finite coordinates ({}, {})", latitude, longitude);
            return PushOutcome::Dropped(DropReason::InvalidCoordinates);
        }

        let outcome = {
            let mut state = self.lock_state();
            self.push_locked(&mut state, latitude, longitude)
        };

        match &outcome {
            PushOutcome::Dropped(DropReason::RateLimited) => {}
            _ => self.publish_status(),
        }
        outcome
    }

    /// Merge decoded telemetry and route coordinates to the providers.
    ///
    /// Returns the push outcome when the batch carried coordinates.
    pub fn ingest(&self, events: &[TelemetryEvent]) -> Option<PushOutcome> {
        {
            let mut state = self.lock_state();
            state.telemetry = merge_telemetry(&state.telemetry, events);
            let snapshot = state.telemetry.clone();
            snapshot.apply_to(&mut state.record);
        }
        self.publish_status();

        let (latitude, longitude) = events.iter().rev().find_map(|event| match event {
            TelemetryEvent::Coordinates {
                latitude,
                longitude,
            } => Some((*latitude, *longitude)),
            _ => None,
        })?;
        Some(self.handle_location_update(latitude, longitude))
    }

    /// Disable and remove every registered provider. Idempotent.
    pub fn stop_mocking(&self) {
        let mut state = self.lock_state();
        for (provider, registration) in std::mem::take(&mut state.providers) {
            if registration.enabled {
                if let Err(e) = self.surface.set_test_provider_enabled(&provider, false) {
                    debug!("Disabling {} failed: {}", provider, e);
                }
            }
            if let Err(e) = self.surface.remove_test_provider(&provider) {
                debug!("Removing {} failed: {}", provider, e);
            }
            info!("Removed test provider {}", provider);
        }
        state.active = false;
        state.last_push = None;
        state.last_fix = None;
        state.record.running = false;
    }

    pub fn report_error(&self, error: &BridgeError) {
        self.lock_state().record.error_message = Some(error.to_string());
        self.publish_status();
    }

    pub fn status(&self) -> StatusRecord {
        self.lock_state().record.clone()
    }

    pub fn publish_status(&self) {
        let record = self.status();
        self.sink.publish(StatusUpdate::Record(record));
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active
    }

    pub fn providers(&self) -> BTreeMap<String, ProviderRegistration> {
        self.lock_state().providers.clone()
    }

    fn prepare(&self, state: &mut MockState) -> Result<(), BridgeError> {
        if !self.permissions.has_capability(Capability::FineLocation)
            && !self.permissions.has_capability(Capability::CoarseLocation)
        {
            return Err(BridgeError::PermissionDenied {
                capability: Capability::FineLocation,
                operation: "mock location",
            });
        }
        if !self.surface.is_mock_provider_allowed() {
            return Err(BridgeError::MockLocationDisabled);
        }
        self.configure(state)?;
        self.activate(state)
    }

    fn configure(&self, state: &mut MockState) -> Result<(), BridgeError> {
        let mut last_error = None;
        for provider in &self.config.providers {
            if state.providers.get(provider).is_some_and(|r| r.registered) {
                continue;
            }
            match self.register(provider) {
                Ok(()) => {
                    state.providers.insert(
                        provider.clone(),
                        ProviderRegistration {
                            registered: true,
                            enabled: false,
                        },
                    );
                }
                Err(e) => {
                    warn!("Failed to register test provider {}: {}", provider, e);
                    last_error = Some(e);
                }
            }
        }

        if state.providers.values().any(|r| r.registered) {
            Ok(())
        } else {
            Err(BridgeError::ProviderRegistrationFailed(match last_error {
                Some(e) => e.to_string(),
                None => "no mock provider configured".to_string(),
            }))
        }
    }

    fn activate(&self, state: &mut MockState) -> Result<(), BridgeError> {
        let names: Vec<String> = state.providers.keys().cloned().collect();
        for provider in names {
            match self.surface.set_test_provider_enabled(&provider, true) {
                Ok(()) => Self::mark_enabled(state, &provider),
                Err(SurfaceError::NotTestProvider(_)) => {
                    warn!("{} lost its test provider status, re-registering", provider);
                    match self.reregister(&provider) {
                        Ok(()) => Self::mark_enabled(state, &provider),
                        Err(e) => {
                            warn!("Dropping {}: {}", provider, e);
                            state.providers.remove(&provider);
                        }
                    }
                }
                Err(e) => {
                    warn!("Dropping {}: enable failed: {}", provider, e);
                    state.providers.remove(&provider);
                }
            }
        }

        state.active = state.providers.values().any(|r| r.enabled);
        if state.active {
            Ok(())
        } else {
            Err(BridgeError::ProviderRegistrationFailed(
                "no mock provider could be enabled".to_string(),
            ))
        }
    }

    fn push_locked(&self, state: &mut MockState, latitude: f64, longitude: f64) -> PushOutcome {
        if !state.active {
            if let Err(e) = self.prepare(state) {
                warn!("Mock providers not ready, dropping update: {}", e);
                state.record.error_message = Some(e.to_string());
                return PushOutcome::Dropped(DropReason::Inactive(e));
            }
        }

        let now = Instant::now();
        if let Some(last_push) = state.last_push {
            if now.duration_since(last_push) < self.config.min_update_interval {
                return PushOutcome::Dropped(DropReason::RateLimited);
            }
        }

        let fix = self.build_fix(state, latitude, longitude, now);

        let targets: Vec<String> = state
            .providers
            .iter()
            .filter(|(_, r)| r.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        let mut delivered = 0;
        let mut last_error = None;

        for provider in targets {
            match self.surface.set_test_provider_location(&provider, &fix) {
                Ok(()) => delivered += 1,
                Err(SurfaceError::NotTestProvider(_)) => {
                    warn!("{} revoked during push, re-registering", provider);
                    let retried = self
                        .reregister(&provider)
                        .and_then(|()| self.surface.set_test_provider_location(&provider, &fix));
                    match retried {
                        Ok(()) => {
                            Self::mark_enabled(state, &provider);
                            delivered += 1;
                        }
                        Err(e) => {
                            error!("Dropping provider {} after failed recovery: {}", provider, e);
                            state.providers.remove(&provider);
                            last_error = Some(BridgeError::ProviderRevoked(provider));
                        }
                    }
                }
                Err(e) => {
                    warn!("Push to {} failed: {}", provider, e);
                    last_error = Some(BridgeError::PushFailed(e.to_string()));
                }
            }
        }

        if state.providers.is_empty() {
            warn!("No mock provider left, re-arming on next update");
            state.active = false;
        }

        if delivered == 0 {
            let err = BridgeError::PushFailed(match last_error {
                Some(e) => e.to_string(),
                None => "no enabled provider".to_string(),
            });
            state.record.error_message = Some(err.to_string());
            return PushOutcome::Failed(err);
        }

        debug!(
            "Pushed ({:.6}, {:.6}) ±{:.1}m to {} provider(s)",
            latitude, longitude, fix.accuracy, delivered
        );
        state.last_push = Some(now);
        state.last_fix = Some((fix.clone(), now));
        state.record.running = true;
        state.record.error_message = None;
        state.record.last_fix = Some((latitude, longitude));

        PushOutcome::Pushed {
            fix,
            providers: delivered,
        }
    }

    fn build_fix(&self, state: &MockState, latitude: f64, longitude: f64, now: Instant) -> LocationFix {
        let telemetry = &state.telemetry;
        let previous = state.last_fix.as_ref();

        let accuracy = location::accuracy_from_hdop(telemetry.hdop, &self.config.accuracy);
        let altitude = location::resolve_altitude(telemetry.altitude, previous.and_then(|(fix, _)| fix.altitude));
        let speed = location::resolve_speed(
            telemetry.speed,
            latitude,
            longitude,
            previous.map(|(fix, at)| PreviousPosition {
                latitude: fix.latitude,
                longitude: fix.longitude,
                elapsed_secs: now.duration_since(*at).as_secs_f64(),
            }),
        );

        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        LocationFix {
            latitude,
            longitude,
            accuracy,
            altitude,
            speed,
            bearing: telemetry.heading,
            timestamp_millis,
            monotonic_nanos: now.duration_since(state.session_start).as_nanos() as u64,
        }
    }

    /// Remove-then-add, so a stale registration never blocks the add.
    fn register(&self, provider: &str) -> Result<(), SurfaceError> {
        if let Err(e) = self.surface.remove_test_provider(provider) {
            debug!("Pre-registration removal of {}: {}", provider, e);
        }
        self.surface.add_test_provider(provider)?;
        info!("Registered test provider {}", provider);
        Ok(())
    }

    fn reregister(&self, provider: &str) -> Result<(), SurfaceError> {
        self.register(provider)?;
        self.surface.set_test_provider_enabled(provider, true)
    }

    fn mark_enabled(state: &mut MockState, provider: &str) {
        state.providers.insert(
            provider.to_string(),
            ProviderRegistration {
                registered: true,
                enabled: true,
            },
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
