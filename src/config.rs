// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::ble_constants::limits;
use crate::bluetooth::{LineEnding, SessionOptions, TextEncoding, TrafficSettings};

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Outbound traffic settings.
    pub traffic: TrafficConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name such as "hci0". The system default when unset.
    pub adapter: Option<String>,

    /// Only list peripherals advertising the HM-10 serial service.
    pub hm10_only: bool,

    /// Give up on a connection that is not ready after this many seconds.
    /// Zero disables the watchdog.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Appended to every command: "none", "cr", "lf" or "crlf".
    pub line_ending: LineEnding,

    /// "utf8" or "ascii".
    pub encoding: TextEncoding,

    /// Largest single write in bytes. Longer commands are split.
    pub max_write_len: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::None,
            encoding: TextEncoding::Utf8,
            max_write_len: limits::DEFAULT_MAX_WRITE_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "hm10_link=info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hm10-link")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            return Ok(toml::from_str(&content)?);
        }

        let config = Self::default();
        config.save_to(path)?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Session options derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            hm10_only: self.bluetooth.hm10_only,
            traffic: TrafficSettings {
                line_ending: self.traffic.line_ending,
                encoding: self.traffic.encoding,
                max_write_len: self.traffic.max_write_len.max(1),
            },
        }
    }

    /// Connect watchdog duration, if enabled.
    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        match self.bluetooth.connect_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\nhm10_only = true\n\n[traffic]\nline_ending = \"crlf\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.bluetooth.hm10_only);
        assert_eq!(config.bluetooth.adapter, None);
        assert_eq!(config.traffic.line_ending, LineEnding::Crlf);
        assert_eq!(config.traffic.max_write_len, 20);
        assert_eq!(config.logging.level, "hm10_link=info");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.bluetooth.adapter = Some("hci1".to_string());
        config.bluetooth.connect_timeout_secs = 15;
        config.traffic.encoding = TextEncoding::Ascii;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_connect_timeout_zero_disables() {
        let mut config = Config::default();
        assert_eq!(config.connect_timeout(), None);

        config.bluetooth.connect_timeout_secs = 10;
        assert_eq!(config.connect_timeout(), Some(std::time::Duration::from_secs(10)));
    }

    #[test]
    fn test_session_options_clamp_write_len() {
        let mut config = Config::default();
        config.traffic.max_write_len = 0;
        assert_eq!(config.session_options().traffic.max_write_len, 1);
    }
}
