// src/config/validate.rs

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::warn;

use crate::config::model::{ConfigFile, RawConfigFile, WorkerSettings, parse_duration};
use crate::errors::{RealiserError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RealiserError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_limits(&raw)?;
        validate_substituters(&raw)?;
        let settings = worker_settings(&raw)?;
        Ok(ConfigFile::new_unchecked(
            settings,
            raw.substitution.substituters,
            raw.logging.level,
        ))
    }
}

fn validate_limits(cfg: &RawConfigFile) -> Result<()> {
    if cfg.substitution.max_jobs == 0 {
        return Err(RealiserError::ConfigError(
            "[substitution].max_jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.build.log_lines == 0 {
        return Err(RealiserError::ConfigError(
            "[build].log_lines must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_substituters(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = BTreeSet::new();
    for uri in &cfg.substitution.substituters {
        if uri.trim().is_empty() {
            return Err(RealiserError::ConfigError(
                "[substitution].substituters contains an empty URI".to_string(),
            ));
        }
        if !seen.insert(uri.as_str()) {
            return Err(RealiserError::ConfigError(format!(
                "substituter '{uri}' is listed more than once"
            )));
        }
    }

    if cfg.substitution.require_sigs
        && cfg.substitution.trusted_public_keys.is_empty()
        && !cfg.substitution.substituters.is_empty()
    {
        warn!("require_sigs is set but no trusted_public_keys are configured; only trusted substituters will be usable");
    }
    Ok(())
}

/// A limit of zero means "no limit".
fn optional_limit(field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    let Some(s) = value else { return Ok(None) };
    let d = parse_duration(s)
        .map_err(|e| RealiserError::ConfigError(format!("[build].{field}: {e}")))?;
    Ok((!d.is_zero()).then_some(d))
}

fn worker_settings(cfg: &RawConfigFile) -> Result<WorkerSettings> {
    let poll_interval = parse_duration(&cfg.build.poll_interval)
        .map_err(|e| RealiserError::ConfigError(format!("[build].poll_interval: {e}")))?;
    if poll_interval.is_zero() {
        return Err(RealiserError::ConfigError(
            "[build].poll_interval must be greater than zero".to_string(),
        ));
    }

    Ok(WorkerSettings {
        max_jobs: cfg.build.max_jobs,
        max_substitution_jobs: cfg.substitution.max_jobs,
        keep_going: cfg.build.keep_going,
        fallback: cfg.substitution.fallback,
        use_substitutes: cfg.substitution.enabled,
        require_sigs: cfg.substitution.require_sigs,
        trusted_public_keys: cfg.substitution.trusted_public_keys.clone(),
        max_silent_time: optional_limit("max_silent_time", cfg.build.max_silent_time.as_deref())?,
        build_timeout: optional_limit("build_timeout", cfg.build.build_timeout.as_deref())?,
        poll_interval,
        log_lines: cfg.build.log_lines,
    })
}
