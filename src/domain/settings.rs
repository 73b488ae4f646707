use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "PhysioTracker";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Missing fields take their defaults, so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. "info" or "physio_tracker=debug"
    pub level: String,
    pub console: bool,
    pub file: bool,
    /// Relative paths are resolved against the data directory
    pub directory: String,
    pub file_prefix: String,
    pub rotation: LogRotation,
    pub show_source_location: bool,
    pub show_thread_ids: bool,
    pub show_target: bool,
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: false,
            directory: "logs".to_string(),
            file_prefix: "physio_tracker".to_string(),
            rotation: LogRotation::Daily,
            show_source_location: true,
            show_thread_ids: false,
            show_target: true,
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub user_id: String,
    pub log_settings: LogSettings,

    // Device firmware contract
    pub ble_service_uuid: String,
    pub ble_sensor_char_uuid: String,
    pub ble_placement_char_uuid: String,
    pub device_name_prefix: String,
    pub scan_timeout_secs: u64,
    pub last_connected_address: Option<String>,

    // Session engine
    pub feedback_clear_ms: u64,
    pub tick_interval_ms: u64,

    /// Where results and session records are written
    pub data_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: "user1".to_string(),
            log_settings: LogSettings::default(),
            ble_service_uuid: protocol::SERVICE_UUID.to_string(),
            ble_sensor_char_uuid: protocol::SENSOR_CHAR_UUID.to_string(),
            ble_placement_char_uuid: protocol::PLACEMENT_CHAR_UUID.to_string(),
            device_name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            scan_timeout_secs: 30,
            last_connected_address: None,
            feedback_clear_ms: 3000,
            tick_interval_ms: 1000,
            data_dir: None,
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Settings from `<config dir>/PhysioTracker/settings.json`.
    pub fn new() -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(Self::at_path(config_dir.join(APP_DIR).join(SETTINGS_FILE)))
    }

    /// Load from an explicit file; missing or unreadable files yield defaults.
    pub fn at_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_else(|e| {
            tracing::debug!("Using default settings ({}): {:#}", settings_path.display(), e);
            Settings::default()
        });

        Self {
            settings,
            settings_path,
        }
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("writing {}", self.settings_path.display()))?;
        tracing::debug!("Settings saved to {}", self.settings_path.display());
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_address.as_deref() != Some(address) {
            self.settings.last_connected_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }

    /// Directory for stored records and logs; defaults next to the settings file.
    pub fn data_dir(&self) -> PathBuf {
        match &self.settings.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => self
                .settings_path
                .parent()
                .map(|p| p.join("data"))
                .unwrap_or_else(|| PathBuf::from("data")),
        }
    }
}
