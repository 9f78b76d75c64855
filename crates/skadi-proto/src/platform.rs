//! Where skadi keeps its files and how it finds the player binary.
//!
//! Unix uses XDG-style locations under the home directory.  On Windows a
//! `data` directory or `config.toml` next to the executable marks a portable
//! install and takes precedence over the per-user folders.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "skadi";

/// File name of the configuration inside `config_dir()`.
pub const CONFIG_FILE: &str = "config.toml";

/// Log file and other runtime state.
pub fn data_dir() -> PathBuf {
    portable_data_dir().unwrap_or_else(|| user_data_base().join(APP_NAME))
}

/// Directory holding `CONFIG_FILE`.
pub fn config_dir() -> PathBuf {
    portable_config_dir().unwrap_or_else(|| user_config_base().join(APP_NAME))
}

fn exe_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(std::env::temp_dir)
}

#[cfg(unix)]
fn user_data_base() -> PathBuf {
    home().join(".local").join("share")
}

#[cfg(unix)]
fn user_config_base() -> PathBuf {
    home().join(".config")
}

#[cfg(windows)]
fn user_data_base() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(home)
}

#[cfg(windows)]
fn user_config_base() -> PathBuf {
    dirs::config_dir().unwrap_or_else(home)
}

#[cfg(unix)]
fn portable_data_dir() -> Option<PathBuf> {
    None
}

#[cfg(unix)]
fn portable_config_dir() -> Option<PathBuf> {
    None
}

#[cfg(windows)]
fn portable_data_dir() -> Option<PathBuf> {
    exe_dir().map(|dir| dir.join("data")).filter(|dir| dir.is_dir())
}

#[cfg(windows)]
fn portable_config_dir() -> Option<PathBuf> {
    exe_dir().filter(|dir| dir.join(CONFIG_FILE).is_file())
}

#[cfg(unix)]
fn binary_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(windows)]
fn binary_names(name: &str) -> Vec<String> {
    if name.ends_with(".exe") {
        vec![name.to_string()]
    } else {
        vec![format!("{}.exe", name), name.to_string()]
    }
}

fn find_beside_exe(names: &[String]) -> Option<PathBuf> {
    let dir = exe_dir()?;
    for name in names {
        let p = dir.join(name);
        if p.is_file() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.is_file() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[String]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.is_file() {
                return Some(p);
            }
        }
    }
    None
}

/// Locate the configured player executable.
///
/// A value containing a path separator is used as-is.  A bare name is looked
/// up beside the current executable (bundled builds), then on PATH.  Falls
/// back to the bare name so the OS reports the failure at spawn time.
pub fn find_player_binary(executable: &str) -> PathBuf {
    let as_path = Path::new(executable);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return as_path.to_path_buf();
    }

    let names = binary_names(executable);
    find_beside_exe(&names)
        .or_else(|| find_on_path(&names))
        .unwrap_or_else(|| as_path.to_path_buf())
}
