// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of the source directory, configuration file,
//! and run state file. None of these functions check whether the paths they
//! return actually exist.

use std::path::{Component, Path, PathBuf};

/// Determine absolute path to user's home directory.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to source directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/oxihome`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_source_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("oxihome"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to configuration file.
///
/// Uses `$XDG_CONFIG_HOME/oxihome/oxihome.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxihome").join("oxihome.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to run state file.
///
/// Uses `$XDG_CONFIG_HOME/oxihome/runstate.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_run_state_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("oxihome").join("runstate.toml"))
        .ok_or(NoWayHome)
}

/// Lexically normalize a path.
///
/// Drops `.` components and folds `..` into their parent without touching
/// the file system, so symlinks are never resolved.
pub fn normalize(path: impl AsRef<Path>) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normal.pop() {
                    normal.push(component);
                }
            }
            other => normal.push(other),
        }
    }

    normal
}

/// Resolve a user supplied path against the destination directory.
///
/// Accepts `~/...` paths, absolute paths, and paths relative to `cwd`.
/// Returns the normalized path relative to `dest_dir`, or `None` if it
/// lies outside of it.
pub fn dest_relative(
    dest_dir: impl AsRef<Path>,
    cwd: impl AsRef<Path>,
    path: impl AsRef<Path>,
) -> Option<PathBuf> {
    let path = path.as_ref().to_string_lossy();
    let path = PathBuf::from(shellexpand::tilde(&*path).into_owned());
    let path = normalize(cwd.as_ref().join(path));
    let dest_dir = normalize(dest_dir);

    path.strip_prefix(&dest_dir).ok().map(Path::to_path_buf)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
