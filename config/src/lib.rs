//! Load configuration from XDG `config.toml` and project `.env`, then apply to the
//! process environment with priority: **existing env > .env > XDG**.
//!
//! The engine reads its typed settings (`CORTEX_*`) from the environment after
//! this layering has run, so every deployment surface configures it the same way.

mod dotenv;
mod xdg;

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Environment layers collected from disk, not yet applied.
#[derive(Debug, Default)]
pub struct EnvLayers {
    dotenv: HashMap<String, String>,
    xdg: HashMap<String, String>,
}

impl EnvLayers {
    /// Collects `.env` (from `override_dir` or the current directory) and the
    /// `[env]` table of `$XDG_CONFIG_HOME/<app_name>/config.toml`.
    pub fn collect(app_name: &str, override_dir: Option<&Path>) -> Result<Self, LoadError> {
        Ok(Self {
            dotenv: dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?,
            xdg: xdg::load_env_map(app_name)?,
        })
    }

    /// Resolves one key with the layering rule, without touching the process env.
    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.dotenv
            .get(key)
            .or_else(|| self.xdg.get(key))
            .map(String::as_str)
    }

    /// Sets every collected key that is **not** already present in the process
    /// environment, so existing env always wins.
    pub fn apply(&self) {
        let mut keys: std::collections::HashSet<&str> =
            self.dotenv.keys().map(String::as_str).collect();
        keys.extend(self.xdg.keys().map(String::as_str));
        for key in keys {
            if std::env::var(key).is_ok() {
                continue;
            }
            if let Some(value) = self.resolve(key) {
                std::env::set_var(key, value);
            }
        }
    }
}

/// Collects and applies both layers in one call. Missing files are fine.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    EnvLayers::collect(app_name, override_dir)?.apply();
    Ok(())
}
