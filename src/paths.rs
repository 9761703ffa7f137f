//! Centralized path resolution for stratum
//!
//! # Environment Variables
//!
//! - `STRATUM_CONFIG_DIR` - Override config directory
//! - `STRATUM_STATE_DIR` - Override state directory (file store root)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STRATUM_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/stratum` (if set)
//! 3. Platform default (`dirs::config_dir()/stratum`)
//!
//! For state_dir():
//! 1. `STRATUM_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/stratum` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\stratum`
//!    - macOS/Linux: `~/.local/state/stratum`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STRATUM_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STRATUM_STATE_DIR";

/// File name looked up in the working directory before the config directory
pub const LOCAL_CONFIG_FILE: &str = "stratum.toml";

/// Get the stratum config directory path
pub fn config_dir() -> Result<PathBuf> {
    config_dir_with(env_lookup)
}

/// Path of the user-level config file, `<config_dir>/config.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the stratum state directory path
pub fn state_dir() -> Result<PathBuf> {
    state_dir_with(env_lookup)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

pub(crate) fn config_dir_with(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    // 1. Check environment variable override
    if let Some(dir) = lookup(ENV_CONFIG_DIR) {
        let path = expand_path(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    // 2. Check XDG_CONFIG_HOME
    if let Some(xdg_config) = lookup("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("stratum");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    // 3. Platform default
    let base = dirs::config_dir().context("Could not determine config directory")?;
    let path = base.join("stratum");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

pub(crate) fn state_dir_with(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(dir) = lookup(ENV_STATE_DIR) {
        let path = expand_path(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Some(xdg_state) = lookup("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("stratum");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            let path = local_app_data.join("stratum");
            log::debug!("Using Windows state dir: {}", path.display());
            return Ok(path);
        }
    }

    // Unix default: ~/.local/state/stratum
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("stratum");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Expand `~` and environment variables in a path string
///
/// Unknown variables are left as written.
///
/// ```
/// use stratum::paths;
///
/// let path = paths::expand_path("/srv/$STRATUM_DOC_UNSET_VAR/state");
/// assert_eq!(path.to_str(), Some("/srv/$STRATUM_DOC_UNSET_VAR/state"));
/// ```
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_dir_env_override() {
        let result = config_dir_with(vars(&[(ENV_CONFIG_DIR, "/custom/config")])).unwrap();
        assert_eq!(result, PathBuf::from("/custom/config"));
    }

    #[test]
    fn test_config_dir_override_beats_xdg() {
        let result = config_dir_with(vars(&[
            (ENV_CONFIG_DIR, "/custom/config"),
            ("XDG_CONFIG_HOME", "/tmp/xdg"),
        ]))
        .unwrap();
        assert_eq!(result, PathBuf::from("/custom/config"));
    }

    #[test]
    fn test_xdg_config_home() {
        let result = config_dir_with(vars(&[("XDG_CONFIG_HOME", "/tmp/xdg-config-test")])).unwrap();
        assert_eq!(result, PathBuf::from("/tmp/xdg-config-test/stratum"));
    }

    #[test]
    fn test_state_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        let result = state_dir_with(vars(&[(ENV_STATE_DIR, "~/stratum-state-test")])).unwrap();
        assert_eq!(result, home.join("stratum-state-test"));
    }

    #[test]
    fn test_xdg_state_home() {
        let result = state_dir_with(vars(&[("XDG_STATE_HOME", "/tmp/xdg-state-test")])).unwrap();
        assert_eq!(result, PathBuf::from("/tmp/xdg-state-test/stratum"));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_state_dir_unix() {
        let result = state_dir_with(vars(&[])).unwrap();
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join(".local").join("state").join("stratum"));
    }

    #[test]
    fn test_expand_with_tilde() {
        let result = expand_path("~/test/path");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join("test").join("path"));
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand_path("/path/$NONEXISTENT_VAR_12345/file");
        assert_eq!(result, PathBuf::from("/path/$NONEXISTENT_VAR_12345/file"));
    }

    #[test]
    fn test_env_var_constants() {
        assert_eq!(ENV_CONFIG_DIR, "STRATUM_CONFIG_DIR");
        assert_eq!(ENV_STATE_DIR, "STRATUM_STATE_DIR");
    }
}
