use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub imsg: ImsgConfig,
    pub reminders: RemindersConfig,
    pub contacts: ContactsConfig,
    pub privacy: PrivacyConfig,
    pub messages: MessagesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImsgConfig {
    pub path: String,
    pub default_region: String,
    pub timeout_secs: u64,
    pub history_timeout_floor_secs: u64,
    pub history_timeout_secs_per_100: u64,
    pub recipient_probe_threads: usize,
    pub watch_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemindersConfig {
    pub path: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactsConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// `regex` enables redaction, empty disables it
    pub pii_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    /// Comma-separated recipients allowed for sending; empty allows all
    pub send_allowlist: String,
    pub days_back: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

impl Default for ImsgConfig {
    fn default() -> Self {
        Self {
            path: "imsg".to_string(),
            default_region: "US".to_string(),
            timeout_secs: 30,
            history_timeout_floor_secs: 30,
            history_timeout_secs_per_100: 10,
            recipient_probe_threads: 50,
            watch_debounce_ms: 250,
        }
    }
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            path: "remindctl".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/contacts.json"),
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            pii_filter: "regex".to_string(),
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            send_allowlist: String::new(),
            days_back: 365,
        }
    }
}

impl ImsgConfig {
    /// Timeout for ordinary `imsg` calls
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout for a history fetch of `limit` messages: a fixed floor plus
    /// a per-100-messages allowance.
    #[must_use]
    pub fn history_timeout(&self, limit: usize) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let allowance = limit as f64 / 100.0 * self.history_timeout_secs_per_100 as f64;
        Duration::from_secs(self.history_timeout_floor_secs) + Duration::from_secs_f64(allowance)
    }
}

impl RemindersConfig {
    /// Timeout for `remindctl` calls
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MessagesConfig {
    /// Parsed send allowlist; empty means unrestricted.
    #[must_use]
    pub fn allowlist(&self) -> Vec<String> {
        self.send_allowlist
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the default
    /// locations and under the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default()).context("Failed to build default configuration")?;

        let mut builder = Config::builder()
            // Start with default values
            .add_source(defaults)
            // Add config files if they exist
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("config").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // IMSG_GATEWAY_IMSG__PATH=/opt/bin/imsg
            .add_source(
                Environment::with_prefix("IMSG_GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let app_config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        // Validate imsg config
        if self.imsg.path.trim().is_empty() {
            return Err(anyhow::anyhow!("imsg.path cannot be empty"));
        }
        if self.imsg.timeout_secs == 0 {
            return Err(anyhow::anyhow!("imsg.timeout_secs must be greater than 0"));
        }
        if self.imsg.history_timeout_floor_secs == 0 {
            return Err(anyhow::anyhow!("imsg.history_timeout_floor_secs must be greater than 0"));
        }
        if self.imsg.recipient_probe_threads == 0 {
            return Err(anyhow::anyhow!("imsg.recipient_probe_threads must be greater than 0"));
        }
        if !(50..=5000).contains(&self.imsg.watch_debounce_ms) {
            return Err(anyhow::anyhow!("imsg.watch_debounce_ms must be between 50 and 5000"));
        }

        // Validate reminders config
        if self.reminders.path.trim().is_empty() {
            return Err(anyhow::anyhow!("reminders.path cannot be empty"));
        }
        if self.reminders.timeout_secs == 0 {
            return Err(anyhow::anyhow!("reminders.timeout_secs must be greater than 0"));
        }

        // Validate contacts config
        if self.contacts.path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("contacts.path cannot be empty"));
        }

        // Validate privacy config
        let valid_modes = ["", "regex"];
        if !valid_modes.contains(&self.privacy.pii_filter.trim().to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid PII filter mode: {}. Must be one of: {:?}",
                self.privacy.pii_filter,
                valid_modes
            ));
        }

        // Validate messages config
        if !(1..=3650).contains(&self.messages.days_back) {
            return Err(anyhow::anyhow!("messages.days_back must be between 1 and 3650"));
        }

        Ok(())
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.imsg.path, "imsg");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.imsg.recipient_probe_threads, 50);
        assert_eq!(config.messages.days_back, 365);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.imsg.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_history_timeout_scales_with_limit() {
        let config = ImsgConfig::default();
        assert_eq!(config.history_timeout(50), Duration::from_secs(35));
        assert_eq!(config.history_timeout(500), Duration::from_secs(80));
        assert_eq!(config.history_timeout(5000), Duration::from_secs(530));
    }

    #[test]
    fn test_allowlist_parsing() {
        let messages = MessagesConfig {
            send_allowlist: " +15551234567, a@example.com ,,".to_string(),
            days_back: 365,
        };
        assert_eq!(messages.allowlist(), vec!["+15551234567", "a@example.com"]);
        assert!(MessagesConfig::default().allowlist().is_empty());
    }
}
