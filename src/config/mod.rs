// src/config/mod.rs

//! Worker settings.
//!
//! - `model.rs`: the TOML data model and the runtime [`WorkerSettings`].
//! - `loader.rs`: reading a settings file from disk.
//! - `validate.rs`: turning a raw file into a validated [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, RawConfigFile, WorkerSettings, parse_duration};
