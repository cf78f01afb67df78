//! Load `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

fn xdg_config_path(app_name: &str) -> Option<PathBuf> {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    let path = config_dir.join(app_name).join("config.toml");
    path.exists().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns env key-value pairs from the `[env]` section. Missing file or
/// empty section returns an empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let path = match xdg_config_path(app_name) {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env)
}
