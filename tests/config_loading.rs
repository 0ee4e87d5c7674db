// tests/config_loading.rs

use std::error::Error;
use std::io::Write;
use std::time::Duration;

use realiser::config::{WorkerSettings, load_and_validate, parse_duration};
use realiser::errors::RealiserError;
use realiser::logging::LogLevel;
use tempfile::NamedTempFile;

type TestResult = Result<(), Box<dyn Error>>;

fn config_file(contents: &str) -> Result<NamedTempFile, Box<dyn Error>> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{contents}")?;
    Ok(file)
}

fn expect_config_error(contents: &str) -> Result<String, Box<dyn Error>> {
    let file = config_file(contents)?;
    match load_and_validate(file.path()) {
        Err(RealiserError::ConfigError(msg)) => Ok(msg),
        Err(e) => Err(format!("expected ConfigError, got: {e:?}").into()),
        Ok(cfg) => Err(format!("expected an error, got {cfg:?}").into()),
    }
}

#[test]
fn empty_file_gives_default_settings() -> TestResult {
    let file = config_file("")?;
    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.settings, WorkerSettings::default());
    assert!(cfg.substituters.is_empty());
    assert_eq!(cfg.log_level, None);
    Ok(())
}

#[test]
fn every_section_is_read() -> TestResult {
    let file = config_file(
        r#"
[build]
max_jobs = 4
keep_going = true
max_silent_time = "10m"
build_timeout = "2h"
poll_interval = "250ms"
log_lines = 50

[substitution]
enabled = false
max_jobs = 8
fallback = true
require_sigs = false
trusted_public_keys = ["cache.example.org-1"]
substituters = ["https://cache.example.org", "https://mirror.example.org"]

[logging]
level = "debug"
"#,
    )?;
    let cfg = load_and_validate(file.path())?;
    let s = &cfg.settings;

    assert_eq!(s.max_jobs, 4);
    assert!(s.keep_going);
    assert_eq!(s.max_silent_time, Some(Duration::from_secs(600)));
    assert_eq!(s.build_timeout, Some(Duration::from_secs(7200)));
    assert_eq!(s.poll_interval, Duration::from_millis(250));
    assert_eq!(s.log_lines, 50);
    assert!(!s.use_substitutes);
    assert_eq!(s.max_substitution_jobs, 8);
    assert!(s.fallback);
    assert!(!s.require_sigs);
    assert_eq!(s.trusted_public_keys, vec!["cache.example.org-1".to_string()]);
    assert_eq!(
        cfg.substituters,
        vec![
            "https://cache.example.org".to_string(),
            "https://mirror.example.org".to_string()
        ]
    );
    assert_eq!(cfg.log_level, Some(LogLevel::Debug));
    Ok(())
}

#[test]
fn zero_limits_disable_timeouts() -> TestResult {
    let file = config_file(
        r#"
[build]
max_silent_time = "0s"
build_timeout = "0ms"
"#,
    )?;
    let cfg = load_and_validate(file.path())?;
    assert_eq!(cfg.settings.max_silent_time, None);
    assert_eq!(cfg.settings.build_timeout, None);
    Ok(())
}

#[test]
fn bad_duration_names_the_field() -> TestResult {
    let msg = expect_config_error(
        r#"
[build]
build_timeout = "forever"
"#,
    )?;
    assert!(msg.contains("[build].build_timeout"), "{msg}");
    Ok(())
}

#[test]
fn zero_substitution_jobs_is_rejected() -> TestResult {
    let msg = expect_config_error(
        r#"
[substitution]
max_jobs = 0
"#,
    )?;
    assert!(msg.contains("[substitution].max_jobs must be >= 1"), "{msg}");
    Ok(())
}

#[test]
fn zero_poll_interval_is_rejected() -> TestResult {
    let msg = expect_config_error(
        r#"
[build]
poll_interval = "0s"
"#,
    )?;
    assert!(msg.contains("[build].poll_interval must be greater than zero"), "{msg}");
    Ok(())
}

#[test]
fn duplicate_substituter_is_rejected() -> TestResult {
    let msg = expect_config_error(
        r#"
[substitution]
substituters = ["https://cache.example.org", "https://cache.example.org"]
"#,
    )?;
    assert!(
        msg.contains("substituter 'https://cache.example.org' is listed more than once"),
        "{msg}"
    );
    Ok(())
}

#[test]
fn malformed_toml_is_a_toml_error() -> TestResult {
    let file = config_file("[build\nmax_jobs = 1")?;
    match load_and_validate(file.path()) {
        Err(RealiserError::TomlError(_)) => Ok(()),
        other => Err(format!("expected TomlError, got {other:?}").into()),
    }
}

#[test]
fn missing_file_is_an_io_error() {
    let result = load_and_validate("/definitely/not/here/realiser.toml");
    assert!(matches!(result, Err(RealiserError::IoError(_))));
}

#[test]
fn durations_need_a_known_unit() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 3m "), Ok(Duration::from_secs(180)));
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("5d").is_err());
    assert!(parse_duration("").is_err());
}
