//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

static DEFAULT_STORAGE_DIR: &str = "~/.local/share/groupcal";

fn default_storage_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_DIR)
}

fn default_month_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_duplicate_window() -> Duration {
    Duration::from_secs(2)
}

fn default_retention_months() -> u32 {
    3
}

fn default_personal_color() -> String {
    "#4A90E2".to_string()
}

fn default_group_color() -> String {
    "#7B61FF".to_string()
}

/// Engine settings, read from ~/.config/groupcal/config.toml when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a month fetch stays fresh in memory
    #[serde(default = "default_month_cache_ttl", with = "humantime_str")]
    pub month_cache_ttl: Duration,

    /// Window in which an identical `add` is treated as a double submission
    #[serde(default = "default_duplicate_window", with = "humantime_str")]
    pub duplicate_window: Duration,

    /// Months of history kept in the persistent cache
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,

    #[serde(default = "default_personal_color")]
    pub personal_color: String,

    /// Used when neither the membership nor the event carries a color
    #[serde(default = "default_group_color")]
    pub default_group_color: String,

    /// Where `FileStorage` keeps its buckets (`~` is expanded)
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            month_cache_ttl: default_month_cache_ttl(),
            duplicate_window: default_duplicate_window(),
            retention_months: default_retention_months(),
            personal_color: default_personal_color(),
            default_group_color: default_group_color(),
            storage_dir: default_storage_dir(),
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> SyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Config("Could not determine config directory".into()))?
            .join("groupcal");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from the default config path, falling back to defaults for
    /// anything (or everything) missing.
    pub fn load() -> SyncResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> SyncResult<Self> {
        Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    /// `storage_dir` with `~` expanded.
    pub fn storage_path(&self) -> PathBuf {
        let full_path_str =
            shellexpand::tilde(&self.storage_dir.to_string_lossy()).into_owned();

        PathBuf::from(full_path_str)
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> SyncResult<()> {
        let contents = format!(
            "\
# groupcal sync engine configuration

# How long a fetched month stays fresh in memory:
# month_cache_ttl = \"5m\"

# Identical event submissions within this window are dropped:
# duplicate_window = \"2s\"

# Months of past events kept in the offline cache:
# retention_months = 3

# Where the offline cache and queue are stored:
# storage_dir = \"{}\"
",
            DEFAULT_STORAGE_DIR
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| SyncError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| SyncError::Config(format!("Could not write config file: {e}")))?;
        Ok(())
    }
}

/// Durations written as humantime strings ("5m", "2s").
mod humantime_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }
}
