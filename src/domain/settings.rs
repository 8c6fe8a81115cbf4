use crate::domain::ports::SessionFlag;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_gps_mocker".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether the BLE + mock location pipeline should run
    #[serde(default = "default_false")]
    pub mock_enabled: bool,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Accessory identity
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_coordinates_uuid")]
    pub ble_coordinates_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub ble_status_char_uuid: String,
    #[serde(default = "default_device_name")]
    pub ble_device_name: String,

    // Link timing
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_mtu")]
    pub preferred_mtu: u16,
    #[serde(default = "default_descriptor_delay_ms")]
    pub descriptor_delay_ms: u64,
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    #[serde(default = "default_rescan_delay_ms")]
    pub rescan_delay_ms: u64,
    /// Scan/connect gated by dedicated Bluetooth permissions instead of location
    #[serde(default = "default_true")]
    pub dedicated_bluetooth_permissions: bool,

    // Mock location tuning
    #[serde(default = "default_providers")]
    pub mock_providers: Vec<String>,
    #[serde(default = "default_min_update_interval_ms")]
    pub min_update_interval_ms: u64,
    #[serde(default = "default_location_journal")]
    pub location_journal_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mock_enabled: false,
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_coordinates_char_uuid: default_coordinates_uuid(),
            ble_status_char_uuid: default_status_uuid(),
            ble_device_name: default_device_name(),

            scan_timeout_ms: default_scan_timeout_ms(),
            preferred_mtu: default_mtu(),
            descriptor_delay_ms: default_descriptor_delay_ms(),
            rescan_interval_ms: default_rescan_interval_ms(),
            rescan_delay_ms: default_rescan_delay_ms(),
            dedicated_bluetooth_permissions: true,

            mock_providers: default_providers(),
            min_update_interval_ms: default_min_update_interval_ms(),
            location_journal_file: default_location_journal(),
        }
    }
}

fn default_service_uuid() -> String {
    "14f0514a-e15f-4ad3-89a6-b4cb3ac86abe".to_string()
}
fn default_coordinates_uuid() -> String {
    "12c64fea-7ed9-40be-9c7e-9912a5050d23".to_string()
}
fn default_status_uuid() -> String {
    "3e4f5d6c-7b8a-9d0e-1f2a-3b4c5d6e7f8a".to_string()
}
fn default_device_name() -> String {
    "GPS-C3".to_string()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_mtu() -> u16 {
    185
}
fn default_descriptor_delay_ms() -> u64 {
    100
}
fn default_rescan_interval_ms() -> u64 {
    3_000
}
fn default_rescan_delay_ms() -> u64 {
    3_000
}
fn default_providers() -> Vec<String> {
    vec!["gps".to_string(), "network".to_string()]
}
fn default_min_update_interval_ms() -> u64 {
    200
}
fn default_location_journal() -> String {
    "mock_locations.jsonl".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!("Ignoring unreadable settings at {:?}: {}", settings_path, e);
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleGpsMocker");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn set_mock_enabled(&mut self, enabled: bool) -> anyhow::Result<()> {
        if self.settings.mock_enabled != enabled {
            self.settings.mock_enabled = enabled;
            self.save()?;
        }
        Ok(())
    }
}

/// Session flag persisted in the settings file.
#[derive(Clone)]
pub struct FileSessionFlag {
    settings: Arc<Mutex<SettingsService>>,
}

impl FileSessionFlag {
    pub fn new(settings: Arc<Mutex<SettingsService>>) -> Self {
        Self { settings }
    }
}

impl SessionFlag for FileSessionFlag {
    fn get(&self) -> bool {
        match self.settings.lock() {
            Ok(settings) => settings.get().mock_enabled,
            Err(_) => {
                error!("Settings lock poisoned, treating mock flag as disabled");
                false
            }
        }
    }

    fn set(&self, enabled: bool) {
        match self.settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.set_mock_enabled(enabled) {
                    error!("Failed to persist mock flag: {}", e);
                }
            }
            Err(_) => error!("Settings lock poisoned, mock flag not persisted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ble_gps_mocker_{}_{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join("settings.json")
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"mock_enabled": true}"#).unwrap();
        assert!(settings.mock_enabled);
        assert_eq!(settings.ble_device_name, "GPS-C3");
        assert_eq!(settings.scan_timeout_ms, 10_000);
        assert_eq!(settings.mock_providers, vec!["gps", "network"]);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_flag_survives_reload() {
        let path = temp_settings_path("flag");
        let _ = fs::remove_file(&path);

        let service = Arc::new(Mutex::new(SettingsService::with_path(path.clone())));
        let flag = FileSessionFlag::new(service);
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());

        let reloaded = SettingsService::with_path(path.clone());
        assert!(reloaded.get().mock_enabled);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let path = temp_settings_path("corrupt");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path.clone());
        assert!(!service.get().mock_enabled);
        assert_eq!(service.get().preferred_mtu, 185);

        let _ = fs::remove_file(&path);
    }
}
