//! Player configuration
//!
//! Host-level defaults for a run. Everything here can also be changed from
//! inside a macro through the matching system variable; those writes last
//! for the rest of the run only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// How often the command sequence is played
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// Play the commands once
    #[default]
    Once,
    /// Play the commands N times (stops early when a datasource runs out)
    Times(u64),
    /// Play once per datasource row
    UntilDatasourceEnd,
}

/// Inter-command delay (`!REPLAYSPEED`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaySpeed {
    #[default]
    Fast,
    Medium,
    Slow,
}

impl ReplaySpeed {
    pub fn delay(self) -> Duration {
        match self {
            ReplaySpeed::Fast => Duration::ZERO,
            ReplaySpeed::Medium => Duration::from_millis(500),
            ReplaySpeed::Slow => Duration::from_millis(1500),
        }
    }

    /// The `!REPLAYSPEED` spelling.
    pub fn as_setting(self) -> &'static str {
        match self {
            ReplaySpeed::Fast => "FAST",
            ReplaySpeed::Medium => "MEDIUM",
            ReplaySpeed::Slow => "SLOW",
        }
    }

    /// Parse a `!REPLAYSPEED` value.
    pub fn from_setting(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FAST" => Some(ReplaySpeed::Fast),
            "MEDIUM" => Some(ReplaySpeed::Medium),
            "SLOW" => Some(ReplaySpeed::Slow),
            _ => None,
        }
    }
}

/// Configuration for playing macros
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerConfig {
    /// Fixed wait between retry attempts, in milliseconds
    pub poll_interval_ms: u64,
    /// Retry window for element and image commands, in seconds
    pub timeout_step: f64,
    /// Timeout for navigation commands, in seconds. Handlers see it, and
    /// navigation misses are retried within it
    pub timeout_page: f64,
    pub repeat: Repeat,
    /// Initial `!ERRORIGNORE`
    pub error_ignore: bool,
    /// Whether `PAUSE` suspends the run
    pub honor_pause: bool,
    pub replay_speed: ReplaySpeed,
    /// Base directory for relative datasource paths
    pub datasource_dir: PathBuf,
    /// Values handed to `CMDLINE`, keyed by variable name
    pub cmdline: HashMap<String, String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_step: 6.0,
            timeout_page: 60.0,
            repeat: Repeat::Once,
            error_ignore: false,
            honor_pause: true,
            replay_speed: ReplaySpeed::Fast,
            datasource_dir: PathBuf::from("."),
            cmdline: HashMap::new(),
        }
    }
}

impl PlayerConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Value for `CMDLINE`, looked up case-insensitively.
    pub fn cmdline_value(&self, var: &str) -> Option<&str> {
        self.cmdline
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(var))
            .map(|(_, v)| v.as_str())
    }
}

/// Seconds as a `Duration`, treating negative or invalid values as zero.
pub fn seconds(s: f64) -> Duration {
    if s.is_finite() && s > 0.0 {
        Duration::from_secs_f64(s)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.timeout_step, 6.0);
        assert_eq!(cfg.repeat, Repeat::Once);
        assert!(cfg.honor_pause);
    }

    #[test]
    fn test_from_toml() {
        let cfg = PlayerConfig::from_toml(
            r#"
poll_interval_ms = 50
timeout_step = 2.5
repeat = { times = 3 }
replay_speed = "medium"
datasource_dir = "data"

[cmdline]
"!VAR1" = "hello"
"#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval_ms, 50);
        assert_eq!(cfg.timeout_step, 2.5);
        assert_eq!(cfg.timeout_page, 60.0);
        assert_eq!(cfg.repeat, Repeat::Times(3));
        assert_eq!(cfg.replay_speed.delay(), Duration::from_millis(500));
        assert_eq!(cfg.datasource_dir, PathBuf::from("data"));
        assert_eq!(cfg.cmdline_value("!var1"), Some("hello"));
    }

    #[test]
    fn test_repeat_unit_variant() {
        let cfg = PlayerConfig::from_toml(r#"repeat = "until_datasource_end""#).unwrap();
        assert_eq!(cfg.repeat, Repeat::UntilDatasourceEnd);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(PlayerConfig::from_toml("pol_interval = 5").is_err());
    }

    #[test]
    fn test_seconds_clamps() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
    }
}
