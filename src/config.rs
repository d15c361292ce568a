//! Engine configuration
//!
//! One YAML document configures every component. Durations are written the
//! human way ("30s", "5m", "72h", "1h30m", "250ms").
//!
//! ```yaml
//! coding:
//!   threshold: 3
//!   total: 5
//!   mode: shamir
//! monitor:
//!   check_interval: 30s
//!   thresholds:
//!     repair_threshold: 0.7
//!     emergency_threshold: 0.5
//! repair:
//!   max_concurrent: 3
//!   retry_delay: 5s
//! recovery:
//!   session_ttl: 72h
//!   session_retention: 24h
//! vault:
//!   replication_factor: 2
//! logging:
//!   level: info
//!   json: false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodingParams;
use crate::error::{Error, Result};
use crate::monitor::{MonitorConfig, RepairConfig};
use crate::recovery::RecoveryConfig;
use crate::vault::VaultConfig;

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration for all engine components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default coding parameters for new files
    pub coding: CodingParams,
    pub monitor: MonitorConfig,
    pub repair: RepairConfig,
    pub recovery: RecoveryConfig,
    pub vault: VaultConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.coding
            .validate()
            .map_err(|e| Error::Config(format!("coding: {}", e)))?;
        self.monitor.thresholds.validate()?;
        self.repair.validate()?;
        self.recovery.validate()?;
        self.vault.validate()?;
        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "1h", "30m", "24h", "1h30m", "250ms").
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => return Err(Error::DurationParse(format!("unknown duration unit: {}", c))),
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse("duration must be greater than 0".to_string()));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the largest whole unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    const UNITS: [(u64, &str); 4] = [(86_400_000, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")];

    for (size, unit) in UNITS {
        if ms >= size && ms % size == 0 {
            return format!("{}{}", ms / size, unit);
        }
    }
    format!("{}ms", ms)
}

/// `#[serde(with = "duration_serde")]` for human-readable durations.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
