//! Process settings
//!
//! A JSON file with the log directory, the device backend choice, the
//! sequencer configuration and the initial plate. Every field is optional;
//! a missing file means all defaults.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use sop_sequencer::bypass::BYPASS_NAMES;
use sop_sequencer::SopConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Where the daily log files go; console only when absent
    pub log_directory: Option<PathBuf>,
    /// Drive simulated devices
    pub simulate: bool,
    /// Cartridge loaded at start-up, -1 for none
    pub cartridge: i32,
    /// Subsystems bypassed at start-up
    pub bypasses: Vec<String>,
    pub sop: SopConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_directory: None,
            simulate: true,
            cartridge: -1,
            bypasses: Vec::new(),
            sop: SopConfig::default(),
        }
    }
}

impl BridgeSettings {
    /// Read settings from `path`; a file that does not exist yields defaults
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No settings file at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if !self.simulate {
            return Err(BridgeError::InvalidSettings(
                "only simulated devices are available; set \"simulate\": true".to_string(),
            ));
        }
        if let Some(unknown) = self.bypasses.iter().find(|name| !BYPASS_NAMES.contains(&name.as_str())) {
            return Err(BridgeError::InvalidSettings(format!("unknown bypass: {}", unknown)));
        }
        if self.sop.timeout_secs <= 0.0 {
            return Err(BridgeError::InvalidSettings("sop.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sop-bridge-{}-{}", uuid::Uuid::new_v4(), name))
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = BridgeSettings::load(&temp_path("missing.json")).unwrap();
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let path = temp_path("partial.json");
        std::fs::write(&path, r#"{"cartridge": 11, "sop": {"timeout_secs": 2.5}}"#).unwrap();
        let settings = BridgeSettings::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.cartridge, 11);
        assert_eq!(settings.sop.timeout_secs, 2.5);
        assert_eq!(settings.sop.readout_duration_secs, 90.0);
        assert!(settings.simulate);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("saved.json");
        let settings = BridgeSettings {
            bypasses: vec!["ffs".to_string()],
            ..Default::default()
        };
        settings.save(&path).unwrap();
        let loaded = BridgeSettings::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_invalid_settings() {
        let unknown = BridgeSettings {
            bypasses: vec!["dome".to_string()],
            ..Default::default()
        };
        assert!(matches!(unknown.validate(), Err(BridgeError::InvalidSettings(_))));

        let real = BridgeSettings {
            simulate: false,
            ..Default::default()
        };
        assert!(real.validate().is_err());

        let path = temp_path("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let result = BridgeSettings::load(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(BridgeError::Serialization(_))));
    }
}
