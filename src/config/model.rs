// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::logging::LogLevel;

/// Top-level settings file as read from TOML, before validation.
///
/// ```toml
/// [build]
/// max_jobs = 4
/// keep_going = true
/// max_silent_time = "10m"
/// build_timeout = "2h"
///
/// [substitution]
/// max_jobs = 16
/// fallback = true
/// trusted_public_keys = ["cache.example.org-1"]
/// substituters = ["https://cache.example.org"]
///
/// [logging]
/// level = "debug"
/// ```
///
/// All sections are optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub substitution: SubstitutionSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[build]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSection {
    /// Concurrent local builds.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    #[serde(default)]
    pub keep_going: bool,

    /// Duration string such as `"10m"`; `"0s"` disables the limit.
    #[serde(default)]
    pub max_silent_time: Option<String>,

    #[serde(default)]
    pub build_timeout: Option<String>,

    /// How often goals waiting on an external lock or a remote machine retry.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Builder log lines kept for failure messages.
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

fn default_max_jobs() -> usize {
    1
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_log_lines() -> usize {
    25
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            keep_going: false,
            max_silent_time: None,
            build_timeout: None,
            poll_interval: default_poll_interval(),
            log_lines: default_log_lines(),
        }
    }
}

/// `[substitution]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SubstitutionSection {
    /// Consult substituters at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent substitution transfers.
    #[serde(default = "default_substitution_jobs")]
    pub max_jobs: usize,

    /// Build from source if substitution fails.
    #[serde(default)]
    pub fallback: bool,

    #[serde(default = "default_true")]
    pub require_sigs: bool,

    #[serde(default)]
    pub trusted_public_keys: Vec<String>,

    /// Substituter URIs, in order of preference. Opening them is up to the
    /// host.
    #[serde(default)]
    pub substituters: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_substitution_jobs() -> usize {
    16
}

impl Default for SubstitutionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_jobs: default_substitution_jobs(),
            fallback: false,
            require_sigs: true,
            trusted_public_keys: Vec::new(),
            substituters: Vec::new(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// Everything the worker reads at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_jobs: usize,
    pub max_substitution_jobs: usize,
    pub keep_going: bool,
    pub fallback: bool,
    pub use_substitutes: bool,
    pub require_sigs: bool,
    pub trusted_public_keys: Vec<String>,
    pub max_silent_time: Option<Duration>,
    pub build_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub log_lines: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            max_substitution_jobs: default_substitution_jobs(),
            keep_going: false,
            fallback: false,
            use_substitutes: true,
            require_sigs: true,
            trusted_public_keys: Vec::new(),
            max_silent_time: None,
            build_timeout: None,
            poll_interval: Duration::from_secs(5),
            log_lines: default_log_lines(),
        }
    }
}

/// Validated settings file.
///
/// Constructed via `TryFrom<RawConfigFile>`, see `validate.rs`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub settings: WorkerSettings,
    pub substituters: Vec<String>,
    pub log_level: Option<LogLevel>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        settings: WorkerSettings,
        substituters: Vec<String>,
        log_level: Option<LogLevel>,
    ) -> Self {
        Self {
            settings,
            substituters,
            log_level,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        self.settings.clone()
    }
}

/// Parse a duration such as `"250ms"`, `"30s"`, `"10m"` or `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}
