//! Serverless components runner
//!
//! Looks for a `serverless.js`, `serverless.yml`, `serverless.yaml` or
//! `serverless.json` in the working directory and, when it describes a
//! components project, runs its root component once or keeps re-running it on
//! file changes. Framework-style configurations and empty directories are left
//! alone.

use std::path::Path;

use crate::classify::is_components_file;
use crate::config_file::{ConfigError, resolve};
use crate::script::NodeScriptLoader;

pub mod classify;
pub mod component;
pub mod config_file;
pub mod context;
pub mod coordinator;
pub mod inputs;
pub mod logger;
pub mod script;
pub mod template;
pub mod watch;

/// Whether the current directory holds a components project.
///
/// A missing configuration is `false`, never an error.
///
/// # Errors
///
/// Returns `ConfigError` if the working directory is unknown or a
/// configuration exists but cannot be loaded.
pub fn running_components() -> Result<bool, ConfigError> {
    let cwd = std::env::current_dir()
        .map_err(|e| ConfigError::UnknownWorkingDirectory(e.to_string()))?;
    running_components_in(&cwd, &NodeScriptLoader::from_env())
}

/// [`running_components`] for an explicit directory and script loader.
///
/// # Errors
///
/// Returns `ConfigError` if a configuration exists but cannot be loaded.
pub fn running_components_in(
    dir: &Path,
    scripts: &dyn script::ScriptLoader,
) -> Result<bool, ConfigError> {
    Ok(resolve(dir, scripts)?.is_some_and(|file| is_components_file(&file)))
}
