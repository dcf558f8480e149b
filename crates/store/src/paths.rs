//! Platform directories

use std::path::{Path, PathBuf};

/// Expand a path, replacing `~` with the user's home directory
///
/// # Examples
///
/// ```
/// use swarmroute_store::expand_path;
/// use std::path::PathBuf;
///
/// let path = expand_path(&PathBuf::from("~/swarmroute/state.json"));
/// assert!(!path.starts_with("~"));
/// ```
pub fn expand_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Where identity key files are kept
pub fn default_key_dir() -> PathBuf {
    default_data_dir().join("keys")
}

/// `config.json` inside [`default_config_dir`]
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.json")
}

/// - Linux: `$XDG_CONFIG_HOME/swarmroute`, else `~/.config/swarmroute`
/// - macOS: `~/Library/Application Support/SwarmRoute`
/// - Windows: `%APPDATA%\SwarmRoute`
pub fn default_config_dir() -> PathBuf {
    platform_dir("XDG_CONFIG_HOME", ".config")
}

/// Routing state lives here unless `--state-dir` says otherwise.
///
/// - Linux: `$XDG_DATA_HOME/swarmroute`, else `~/.local/share/swarmroute`
/// - macOS and Windows: same as [`default_config_dir`]
pub fn default_data_dir() -> PathBuf {
    platform_dir("XDG_DATA_HOME", ".local/share")
}

/// The XDG arguments only matter on Linux
#[allow(unused_variables)]
fn platform_dir(xdg_var: &str, xdg_fallback: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = std::env::var(xdg_var)
        .map(PathBuf::from)
        .ok()
        .or_else(|| home_dir().map(|h| h.join(xdg_fallback)))
        .map(|dir| dir.join("swarmroute"));

    #[cfg(target_os = "macos")]
    let base = home_dir().map(|h| h.join("Library/Application Support/SwarmRoute"));

    #[cfg(target_os = "windows")]
    let base = std::env::var("APPDATA").map(|d| PathBuf::from(d).join("SwarmRoute")).ok();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    let base = home_dir().map(|h| h.join(".swarmroute"));

    base.unwrap_or_else(|| PathBuf::from(".swarmroute"))
}
