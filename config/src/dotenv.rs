//! Parse a project `.env` into a key-value map; application happens in lib
//! so the precedence rules live in one place.

use std::collections::HashMap;
use std::path::Path;

/// Strips surrounding quotes from a value. Double quotes support the `\"`
/// escape; single quotes are literal.
fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value[1..value.len() - 1].replace("\\\"", "\"");
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}

/// Minimal `.env` parser: `KEY=VALUE` lines, `#` comment lines, no
/// multiline values or continuations.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()));
    }
    out
}

/// Loads `.env` from `override_dir` or the current directory. A missing file
/// is an empty map, not an error.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(_) => return Ok(HashMap::new()),
        },
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    Ok(parse_dotenv(&std::fs::read_to_string(path)?))
}
