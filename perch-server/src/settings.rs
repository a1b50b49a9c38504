//! Daemon settings (`<config-dir>/config.toml`)
//!
//! Every field is optional. The file is re-read by the handlers that depend
//! on it, so edits apply without restarting the daemon.

use crate::defaults::ANALYZE_TIMEOUT;
use crate::error::{ConfigError, ConfigResult};
use crate::registry::SETTINGS_FILE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Top-level domain for app URLs (`http://<app>.<tld>`)
    pub tld: Option<String>,
    /// Port shown in app URLs; omitted when 80
    pub url_port: Option<u16>,
    /// Terminal launcher; `{script}`, `{dir}` and `{prompt_file}` are substituted
    pub terminal_command: Option<String>,
    /// Editor launcher for config files; `{path}` is substituted
    pub editor_command: Option<String>,
    /// Coding agent started in the terminal with the failure prompt
    pub agent_command: Option<String>,
    pub analyzer: AnalyzerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: ANALYZE_TIMEOUT.as_secs(),
        }
    }
}

impl AnalyzerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Settings {
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(SETTINGS_FILE)
    }

    /// Read settings; a missing file yields the defaults.
    pub fn read(config_dir: &Path) -> ConfigResult<Self> {
        let path = Self::path(config_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::FileRead(path, e)),
        };
        toml::from_str(&content).map_err(|e| ConfigError::TomlParse(path, e))
    }

    /// Like [`Settings::read`], but a broken file is logged and ignored.
    pub fn load(config_dir: &Path) -> Self {
        match Self::read(config_dir) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Ignoring settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn agent_command(&self) -> Option<&str> {
        self.agent_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Settings::read(dir.path()).unwrap(), Settings::default());
    }

    #[test]
    fn parses_all_sections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
tld = "localhost"
url_port = 9280
agent_command = "claude"

[analyzer]
enabled = true
model = "qwen2.5"
"#,
        )
        .unwrap();

        let settings = Settings::read(dir.path()).unwrap();
        assert_eq!(settings.tld.as_deref(), Some("localhost"));
        assert_eq!(settings.url_port, Some(9280));
        assert_eq!(settings.agent_command(), Some("claude"));
        assert!(settings.analyzer.enabled);
        assert_eq!(settings.analyzer.model, "qwen2.5");
        assert_eq!(settings.analyzer.url, "http://127.0.0.1:11434");
    }

    #[test]
    fn blank_agent_command_counts_as_unset() {
        let settings = Settings {
            agent_command: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.agent_command(), None);
    }

    #[test]
    fn broken_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "tld = ").unwrap();
        assert!(Settings::read(dir.path()).is_err());
        assert_eq!(Settings::load(dir.path()), Settings::default());
    }
}
