//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Tunables of one lockspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockspaceConfig {
    /// Resource hash buckets
    pub rsbtbl_size: u32,
    /// Lock id buckets (the upper 16 bits of a lock id)
    pub lkbtbl_size: u32,
    /// Lock value block length in bytes
    pub lvblen: usize,
    /// Maximum resource name length in bytes
    pub max_name_len: usize,
    /// How long an unreferenced resource lingers on the toss list
    pub toss_secs: u64,
    /// Period of the background scanner
    pub scan_secs: u64,
    /// Warn about locks waiting longer than this (centiseconds, 0 = off)
    pub timewarn_cs: u64,
    /// Masterless mode: the hash-selected node masters every resource
    pub no_directory: bool,
}

impl Default for LockspaceConfig {
    fn default() -> Self {
        Self {
            rsbtbl_size: 1024,
            lkbtbl_size: 1024,
            lvblen: 32,
            max_name_len: 64,
            toss_secs: 10,
            scan_secs: 5,
            timewarn_cs: 500,
            no_directory: false,
        }
    }
}

impl LockspaceConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of resource buckets
    pub fn with_rsbtbl_size(mut self, size: u32) -> Self {
        self.rsbtbl_size = size;
        self
    }

    /// Set the number of lock id buckets
    pub fn with_lkbtbl_size(mut self, size: u32) -> Self {
        self.lkbtbl_size = size;
        self
    }

    /// Set the LVB length
    pub fn with_lvblen(mut self, len: usize) -> Self {
        self.lvblen = len;
        self
    }

    /// Set the maximum resource name length
    pub fn with_max_name_len(mut self, len: usize) -> Self {
        self.max_name_len = len;
        self
    }

    /// Set the toss grace period
    pub fn with_toss_secs(mut self, secs: u64) -> Self {
        self.toss_secs = secs;
        self
    }

    /// Set the scanner period
    pub fn with_scan_secs(mut self, secs: u64) -> Self {
        self.scan_secs = secs;
        self
    }

    /// Set the timewarn threshold
    pub fn with_timewarn_cs(mut self, cs: u64) -> Self {
        self.timewarn_cs = cs;
        self
    }

    /// Enable masterless mode
    pub fn with_no_directory(mut self, enabled: bool) -> Self {
        self.no_directory = enabled;
        self
    }

    /// Toss grace period
    pub fn toss_period(&self) -> Duration {
        Duration::from_secs(self.toss_secs)
    }

    /// Scanner period
    pub fn scan_period(&self) -> Duration {
        Duration::from_secs(self.scan_secs.max(1))
    }

    /// Timewarn threshold, if enabled
    pub fn timewarn(&self) -> Option<Duration> {
        (self.timewarn_cs > 0).then(|| Duration::from_millis(self.timewarn_cs.saturating_mul(10)))
    }

    /// Check the configuration for values the lockspace cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rsbtbl_size == 0 {
            return Err(invalid("lockspace.rsbtbl_size", self.rsbtbl_size));
        }
        if self.lkbtbl_size == 0 || self.lkbtbl_size > u32::from(u16::MAX) + 1 {
            return Err(invalid("lockspace.lkbtbl_size", self.lkbtbl_size));
        }
        if self.lvblen == 0 || self.lvblen % 8 != 0 {
            return Err(invalid("lockspace.lvblen", self.lvblen));
        }
        if self.max_name_len == 0 || self.max_name_len > usize::from(u16::MAX) {
            return Err(invalid("lockspace.max_name_len", self.max_name_len));
        }
        Ok(())
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlmConfig {
    /// Lockspace tunables.
    pub lockspace: Option<LockspaceConfigSpec>,
    /// Scanner tunables.
    pub scan: Option<ScanConfigSpec>,
}

impl DlmConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIDLM_CONFIG` env var (if set),
    /// then apply `OXIDLM__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("OXIDLM_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIDLM__") {
                continue;
            }
            let path = key["OXIDLM__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["lockspace", "rsbtbl_size"] => {
                    self.lockspace_mut().rsbtbl_size = Some(parse_value(&key, &value)?);
                }
                ["lockspace", "lkbtbl_size"] => {
                    self.lockspace_mut().lkbtbl_size = Some(parse_value(&key, &value)?);
                }
                ["lockspace", "lvblen"] => {
                    self.lockspace_mut().lvblen = Some(parse_value(&key, &value)?);
                }
                ["lockspace", "max_name_len"] => {
                    self.lockspace_mut().max_name_len = Some(parse_value(&key, &value)?);
                }
                ["lockspace", "no_directory"] => {
                    self.lockspace_mut().no_directory = Some(parse_value(&key, &value)?);
                }
                ["scan", "toss_secs"] => {
                    self.scan_mut().toss_secs = Some(parse_value(&key, &value)?);
                }
                ["scan", "scan_secs"] => {
                    self.scan_mut().scan_secs = Some(parse_value(&key, &value)?);
                }
                ["scan", "timewarn_cs"] => {
                    self.scan_mut().timewarn_cs = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a validated `LockspaceConfig` using defaults plus overrides.
    pub fn to_lockspace_config(&self) -> Result<LockspaceConfig, ConfigError> {
        let mut config = LockspaceConfig::default();
        if let Some(lockspace) = &self.lockspace {
            lockspace.apply_to(&mut config);
        }
        if let Some(scan) = &self.scan {
            scan.apply_to(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    fn lockspace_mut(&mut self) -> &mut LockspaceConfigSpec {
        self.lockspace.get_or_insert_with(LockspaceConfigSpec::default)
    }

    fn scan_mut(&mut self) -> &mut ScanConfigSpec {
        self.scan.get_or_insert_with(ScanConfigSpec::default)
    }
}

/// Lockspace table overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockspaceConfigSpec {
    /// Resource hash buckets.
    pub rsbtbl_size: Option<u32>,
    /// Lock id buckets.
    pub lkbtbl_size: Option<u32>,
    /// LVB length.
    pub lvblen: Option<usize>,
    /// Maximum resource name length.
    pub max_name_len: Option<usize>,
    /// Masterless mode.
    pub no_directory: Option<bool>,
}

impl LockspaceConfigSpec {
    fn apply_to(&self, config: &mut LockspaceConfig) {
        if let Some(value) = self.rsbtbl_size {
            config.rsbtbl_size = value;
        }
        if let Some(value) = self.lkbtbl_size {
            config.lkbtbl_size = value;
        }
        if let Some(value) = self.lvblen {
            config.lvblen = value;
        }
        if let Some(value) = self.max_name_len {
            config.max_name_len = value;
        }
        if let Some(value) = self.no_directory {
            config.no_directory = value;
        }
    }
}

/// Scanner overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanConfigSpec {
    /// Toss grace period in seconds.
    pub toss_secs: Option<u64>,
    /// Scanner period in seconds.
    pub scan_secs: Option<u64>,
    /// Timewarn threshold in centiseconds.
    pub timewarn_cs: Option<u64>,
}

impl ScanConfigSpec {
    fn apply_to(&self, config: &mut LockspaceConfig) {
        if let Some(value) = self.toss_secs {
            config.toss_secs = value;
        }
        if let Some(value) = self.scan_secs {
            config.scan_secs = value.max(1);
        }
        if let Some(value) = self.timewarn_cs {
            config.timewarn_cs = value;
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
