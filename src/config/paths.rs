//! Data-directory resolution.
//!
//! A sentinel file named `munin-portable` beside the executable switches
//! the agent into portable mode: data lives in a `data/` folder next to
//! the binary. Otherwise the platform configuration directory is used.

use std::path::PathBuf;

const PORTABLE_SENTINEL: &str = "munin-portable";

/// Resolve the agent data directory.
pub fn data_dir() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if dir.join(PORTABLE_SENTINEL).exists() {
                return dir.join("data");
            }
        }
    }
    platform_config_dir().join("munin-agent")
}

#[cfg(unix)]
fn platform_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config"),
        Err(_) => PathBuf::from("."),
    }
}

#[cfg(windows)]
fn platform_config_dir() -> PathBuf {
    match std::env::var("APPDATA") {
        Ok(appdata) => PathBuf::from(appdata),
        Err(_) => PathBuf::from("."),
    }
}

#[cfg(not(any(unix, windows)))]
fn platform_config_dir() -> PathBuf {
    PathBuf::from(".")
}
