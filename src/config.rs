//! Config *loading* for the `agentloom` binary — the one piece of the
//! ambient config story spec.md §1 excludes from the core ("config
//! loading" is named as out of scope), while the `RuntimeConfig` type it
//! loads lives in `loom-domain` (SPEC_FULL §10.3).
//!
//! Grounded on the teacher's `sa_gateway::cli::load_config` /
//! `Config::load_or_default`: read a TOML file if present, otherwise fall
//! back to defaults; never fail startup over a missing config file.

use std::path::{Path, PathBuf};

use loom_domain::config::{ConfigSeverity, RuntimeConfig};

/// Load `path` if it exists and parses as TOML, otherwise start from
/// `RuntimeConfig::default()`. Parse errors are logged and degrade to
/// defaults rather than aborting startup — config *loading* is out of
/// the core's scope, so this binary treats it the same way the teacher's
/// `Config::load_or_default` treats a missing/bad `config.toml`.
pub fn load_or_default(path: &Path) -> RuntimeConfig {
    match std::fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<RuntimeConfig>(&raw) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "loaded runtime config");
                cfg
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                RuntimeConfig::default()
            }
        },
        Err(_) => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            RuntimeConfig::default()
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("./agentloom.toml")
}

/// Log every validation issue at the severity the config system assigns
/// it, and report whether any `Error`-severity issue was found (the
/// caller's cue to abort startup, mirroring the teacher's
/// `doctor`/`config validate` exit-code policy).
pub fn log_and_check(cfg: &RuntimeConfig) -> bool {
    let issues = cfg.validate();
    let mut has_error = false;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => {
                tracing::error!("config: {issue}");
                has_error = true;
            }
        }
    }
    !has_error
}
