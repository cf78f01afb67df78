//! Configuration loading for matforge.
//!
//! Three concerns live here:
//! - `load_and_apply`: fold XDG `config.toml` and project `.env` into the
//!   process environment with priority **existing env > .env > XDG**.
//! - [`servers`]: the tool-server JSON (`mcpServers` map) including the
//!   `__EVOMASTER_WORKSPACES__` placeholder substitution.
//! - [`runtime`]: the YAML runtime config snapshot (`config.yaml`).

mod dotenv;
pub mod runtime;
pub mod servers;
mod xdg_toml;

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

/// Folds `.env` and XDG `config.toml` values into the process environment.
///
/// The runtime reads its credentials (`OSS_*`, `BOHRIUM_*`, the LM key)
/// lazily from the environment, so this runs once at startup before anything
/// touches them. A variable already present in the environment is never
/// overwritten; beyond that, the project `.env` (current directory, or
/// `override_dir`) outranks `$XDG_CONFIG_HOME/<app_name>/config.toml`.
/// Applying the stronger source first means each later source only fills
/// variables that are still unset.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let dotenv_vars = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;
    let xdg_vars = xdg_toml::load_env_map(app_name)?;

    for (name, value) in dotenv_vars.into_iter().chain(xdg_vars) {
        if std::env::var_os(&name).is_none() {
            std::env::set_var(&name, value);
        }
    }
    Ok(())
}

/// Serializes tests that mutate the process environment (this crate's tests
/// touch real credential names and `XDG_CONFIG_HOME`).
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
