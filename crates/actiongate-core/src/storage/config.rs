//! TOML-based engine configuration.
//!
//! Stores:
//! - Per-feature quotas and cooldown windows
//! - The new-user grace period
//! - Reconciler timing (sweep interval, expiry tolerance)
//! - The shadow-ban fallback duration
//!
//! Configuration is stored at `~/.config/actiongate/config.toml`.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::ConfigError;
use crate::feature::Feature;

/// Longest cooldown or shadow-ban window accepted, ten years in seconds.
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Quota and cooldown for one feature.
///
/// Zero in either field means "not configured" and falls back to the
/// feature's built-in default, never to "unlimited".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureLimitConfig {
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub cooldown_secs: u64,
}

impl FeatureLimitConfig {
    fn defaults_for(feature: Feature) -> Self {
        Self {
            limit: feature.default_limit(),
            cooldown_secs: feature.default_cooldown_secs(),
        }
    }
}

/// Per-feature limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_conversation")]
    pub conversation: FeatureLimitConfig,
    #[serde(default = "default_refresh")]
    pub refresh: FeatureLimitConfig,
    #[serde(default = "default_filter")]
    pub filter: FeatureLimitConfig,
    #[serde(default = "default_search")]
    pub search: FeatureLimitConfig,
    #[serde(default = "default_message")]
    pub message: FeatureLimitConfig,
}

/// Exemptions evaluated before quota math.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BypassConfig {
    /// New-user grace period in seconds. Zero disables the grace period.
    #[serde(default)]
    pub grace_period_secs: u64,
}

/// Background reconciler timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Remaining cooldown at or below this counts as expired.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
}

/// Moderation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Used only when a shadow ban is recorded without a duration.
    #[serde(default = "default_shadow_ban_secs")]
    pub shadow_ban_default_secs: u64,
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/actiongate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

// Default functions
fn default_conversation() -> FeatureLimitConfig {
    FeatureLimitConfig::defaults_for(Feature::Conversation)
}
fn default_refresh() -> FeatureLimitConfig {
    FeatureLimitConfig::defaults_for(Feature::Refresh)
}
fn default_filter() -> FeatureLimitConfig {
    FeatureLimitConfig::defaults_for(Feature::Filter)
}
fn default_search() -> FeatureLimitConfig {
    FeatureLimitConfig::defaults_for(Feature::Search)
}
fn default_message() -> FeatureLimitConfig {
    FeatureLimitConfig::defaults_for(Feature::Message)
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_tolerance_ms() -> u64 {
    1000
}
fn default_shadow_ban_secs() -> u64 {
    900
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            conversation: default_conversation(),
            refresh: default_refresh(),
            filter: default_filter(),
            search: default_search(),
            message: default_message(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            tolerance_ms: default_tolerance_ms(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            shadow_ban_default_secs: default_shadow_ban_secs(),
        }
    }
}

impl LimitsConfig {
    pub fn get(&self, feature: Feature) -> FeatureLimitConfig {
        match feature {
            Feature::Conversation => self.conversation,
            Feature::Refresh => self.refresh,
            Feature::Filter => self.filter,
            Feature::Search => self.search,
            Feature::Message => self.message,
        }
    }

    pub fn get_mut(&mut self, feature: Feature) -> &mut FeatureLimitConfig {
        match feature {
            Feature::Conversation => &mut self.conversation,
            Feature::Refresh => &mut self.refresh,
            Feature::Filter => &mut self.filter,
            Feature::Search => &mut self.search,
            Feature::Message => &mut self.message,
        }
    }
}

impl ReconcilerConfig {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn tolerance(&self) -> Duration {
        Duration::milliseconds(self.tolerance_ms as i64)
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() {
            return Err(invalid("config key is empty".into()));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| invalid("unknown config key".into()))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| invalid("unknown config key".into()))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => value
                        .parse::<bool>()
                        .map(serde_json::Value::Bool)
                        .map_err(|e| invalid(e.to_string()))?,
                    serde_json::Value::Number(_) => value
                        .parse::<u64>()
                        .map(|n| serde_json::Value::Number(n.into()))
                        .map_err(|_| invalid(format!("cannot parse '{value}' as a whole number")))?,
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        return Err(invalid("cannot overwrite a whole section".into()));
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| invalid("unknown config key".into()))?;
        }

        Err(invalid("unknown config key".into()))
    }

    /// Location of `config.toml` inside the data directory.
    pub fn path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("config.toml"),
            message: e.to_string(),
        })?;
        Ok(dir.join("config.toml"))
    }

    /// Load from disk or write and return the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from an explicit path, creating it with defaults if missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content)?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Reject settings the reconciler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciler.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reconciler.sweep_interval_ms".into(),
                message: "sweep interval must be positive".into(),
            });
        }
        if self.reconciler.tolerance_ms > 60_000 {
            return Err(ConfigError::InvalidValue {
                key: "reconciler.tolerance_ms".into(),
                message: "tolerance above one minute would expire cooldowns early".into(),
            });
        }
        for feature in Feature::ALL {
            if self.limits.get(feature).cooldown_secs > MAX_WINDOW_SECS {
                return Err(ConfigError::InvalidValue {
                    key: format!("limits.{}.cooldown_secs", feature.id()),
                    message: format!("cooldown must not exceed {MAX_WINDOW_SECS} seconds"),
                });
            }
        }
        if self.moderation.shadow_ban_default_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::InvalidValue {
                key: "moderation.shadow_ban_default_secs".into(),
                message: format!("shadow ban must not exceed {MAX_WINDOW_SECS} seconds"),
            });
        }
        if self.bypass.grace_period_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::InvalidValue {
                key: "bypass.grace_period_secs".into(),
                message: format!("grace period must not exceed {MAX_WINDOW_SECS} seconds"),
            });
        }
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value in memory by key. Returns error if key is unknown
    /// or the result fails validation; the config is left untouched then.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config =
            serde_json::from_value(json).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.bypass.grace_period_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub fn shadow_ban_default(&self) -> Duration {
        let secs = self.moderation.shadow_ban_default_secs.min(MAX_WINDOW_SECS);
        Duration::seconds(secs as i64)
    }
}
