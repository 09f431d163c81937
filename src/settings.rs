//! Station settings using Figment
//!
//! Settings that apply to the whole station rather than one document.
//! Loaded from, in increasing precedence:
//! 1. built-in defaults
//! 2. `rust_station.toml` (or an explicit path)
//! 3. environment variables prefixed with `RUST_STATION_`
//!
//! # Example
//! ```no_run
//! use rust_station::settings::StationSettings;
//!
//! let settings = StationSettings::load()?;
//! println!("default document: {:?}", settings.default_file);
//! # Ok::<(), station_core::StationError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use station_core::error::{StationError, StationResult};
use std::path::{Path, PathBuf};

/// Default settings file name.
pub const SETTINGS_FILE: &str = "rust_station.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_STATION_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Station-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Station document used when none is given explicitly
    pub default_file: Option<PathBuf>,
    /// Forced-reconnect default for instruments that do not set it
    pub enable_forced_reconnect: bool,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            default_file: None,
            enable_forced_reconnect: false,
            log_level: "info".to_string(),
        }
    }
}

impl StationSettings {
    /// Load settings from `rust_station.toml` and the environment.
    ///
    /// A missing settings file is not an error; defaults apply.
    pub fn load() -> StationResult<Self> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Load settings from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StationResult<Self> {
        let settings: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| StationError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, exposed for callers that want to add layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> StationResult<()> {
        if !VALID_LEVELS.contains(&self.log_level.as_str()) {
            return Err(StationError::Settings(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let settings = StationSettings::load_from("/nonexistent/rust_station.toml").unwrap();
        assert_eq!(settings, StationSettings::default());
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_file = \"stations/lab.yaml\"\nenable_forced_reconnect = true\nlog_level = \"debug\""
        )
        .unwrap();

        let settings = StationSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.default_file, Some(PathBuf::from("stations/lab.yaml")));
        assert!(settings.enable_forced_reconnect);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"debug\"").unwrap();

        std::env::set_var("RUST_STATION_LOG_LEVEL", "warn");
        let result = StationSettings::load_from(file.path());
        std::env::remove_var("RUST_STATION_LOG_LEVEL");

        assert_eq!(result.unwrap().log_level, "warn");
    }

    #[test]
    #[serial]
    fn test_invalid_log_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"loud\"").unwrap();

        let err = StationSettings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, StationError::Settings(msg) if msg.contains("loud")));
    }

    #[test]
    #[serial]
    fn test_wrong_type_is_settings_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enable_forced_reconnect = \"sometimes\"").unwrap();

        assert!(matches!(
            StationSettings::load_from(file.path()),
            Err(StationError::Settings(_))
        ));
    }
}
