// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File system and script execution capability.
//!
//! Everything the apply executor does to the outside world goes through
//! the [`System`] trait: reading live state, mutating the destination
//! directory, and running scripts. [`RealSystem`] is the one talking to the
//! host.

use std::{
    ffi::OsString,
    fs::{self, DirBuilder, Permissions},
    io::{self, Write},
    os::unix::fs::{symlink, DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};
use tracing::{debug, instrument};

/// Live state of a single path, read without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEntry {
    Missing,
    File { perm: u32, size: u64 },
    Dir { perm: u32 },
    Symlink,
    Other,
}

/// Capability to inspect and mutate the destination directory.
pub trait System {
    /// Inspect path without following symlinks.
    fn lstat(&self, path: &Path) -> io::Result<LiveEntry>;

    /// Read full contents of regular file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Read link text of symlink.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// List names of directory entries in sorted order.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>>;

    /// Create directory with exactly `perm` permission bits.
    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Set permission bits of path to exactly `perm`.
    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()>;

    /// Replace path with regular file holding `contents` and `perm` bits.
    fn write_file(&self, path: &Path, contents: &[u8], perm: u32) -> io::Result<()>;

    /// Create symlink at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Remove path, recursively for directories. Missing paths are fine.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Run script `contents` named `name` from working directory `dir`.
    ///
    /// Blocks until the script exits, and returns its exit status.
    fn run_script(&self, name: &str, contents: &[u8], dir: &Path) -> io::Result<ExitStatus>;
}

/// System backed by the host file system and process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSystem;

impl RealSystem {
    /// Construct new host system.
    pub fn new() -> Self {
        Self
    }
}

impl System for RealSystem {
    fn lstat(&self, path: &Path) -> io::Result<LiveEntry> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LiveEntry::Missing),
            Err(err) => return Err(err),
        };

        // INVARIANT: Setuid, setgid, and sticky bits are never managed.
        let perm = meta.permissions().mode() & 0o777;
        let file_type = meta.file_type();
        let entry = if file_type.is_symlink() {
            LiveEntry::Symlink
        } else if file_type.is_dir() {
            LiveEntry::Dir { perm }
        } else if file_type.is_file() {
            LiveEntry::File {
                perm,
                size: meta.len(),
            }
        } else {
            LiveEntry::Other
        };

        Ok(entry)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut names = fs::read_dir(path)?
            .map(|entry| entry.map(|entry| entry.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        DirBuilder::new().mode(perm).create(path)?;

        // INVARIANT: Process umask must not leak into the result.
        fs::set_permissions(path, Permissions::from_mode(perm))
    }

    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()> {
        fs::set_permissions(path, Permissions::from_mode(perm))
    }

    fn write_file(&self, path: &Path, contents: &[u8], perm: u32) -> io::Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        // INVARIANT: Write to temporary file in same directory, then rename,
        // so the target is never observed half written.
        let mut temp = tempfile::Builder::new()
            .prefix(".oxihome-")
            .tempfile_in(parent)?;
        temp.write_all(contents)?;
        temp.as_file().set_permissions(Permissions::from_mode(perm))?;
        temp.persist(path).map_err(|err| err.error)?;

        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        symlink(target, link)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) => Err(err),
        };

        match result {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    #[instrument(skip(self, contents, dir), level = "debug")]
    fn run_script(&self, name: &str, contents: &[u8], dir: &Path) -> io::Result<ExitStatus> {
        let mut temp = tempfile::Builder::new()
            .prefix("oxihome-")
            .suffix(&format!("-{name}"))
            .tempfile()?;
        temp.write_all(contents)?;
        temp.as_file().set_permissions(Permissions::from_mode(0o700))?;

        // INVARIANT: Close our handle first, executing a file that is still
        // open for writing fails with ETXTBSY.
        let script = temp.into_temp_path();

        let mut command = if contents.starts_with(b"#!") {
            Command::new(&*script)
        } else {
            let mut command = Command::new("/bin/sh");
            command.arg(&*script);
            command
        };

        debug!("run script {name:?} in {:?}", dir.display());
        let status = command.current_dir(dir).status()?;
        script.close()?;

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lstat_reports_live_kinds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let system = RealSystem::new();

        let file = dir.path().join("file");
        system.write_file(&file, b"abc", 0o640)?;
        assert_eq!(system.lstat(&file)?, LiveEntry::File { perm: 0o640, size: 3 });

        let subdir = dir.path().join("subdir");
        system.mkdir(&subdir, 0o750)?;
        assert_eq!(system.lstat(&subdir)?, LiveEntry::Dir { perm: 0o750 });

        let link = dir.path().join("link");
        system.symlink(Path::new("does/not/exist"), &link)?;
        assert_eq!(system.lstat(&link)?, LiveEntry::Symlink);
        assert_eq!(system.read_link(&link)?, PathBuf::from("does/not/exist"));

        assert_eq!(system.lstat(&dir.path().join("nope"))?, LiveEntry::Missing);

        Ok(())
    }

    #[test]
    fn lstat_ignores_special_mode_bits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let system = RealSystem::new();
        let sticky = dir.path().join("sticky");
        system.mkdir(&sticky, 0o755)?;
        fs::set_permissions(&sticky, Permissions::from_mode(0o1755))?;

        assert_eq!(system.lstat(&sticky)?, LiveEntry::Dir { perm: 0o755 });

        Ok(())
    }

    #[test]
    fn write_file_replaces_contents_and_mode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let system = RealSystem::new();
        let file = dir.path().join("file");

        system.write_file(&file, b"old", 0o600)?;
        system.write_file(&file, b"new", 0o644)?;
        assert_eq!(system.read_file(&file)?, b"new");
        assert_eq!(system.lstat(&file)?, LiveEntry::File { perm: 0o644, size: 3 });
        assert_eq!(system.read_dir(dir.path())?, vec![OsString::from("file")]);

        Ok(())
    }

    #[test]
    fn remove_all_handles_trees_and_missing_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let system = RealSystem::new();
        let tree = dir.path().join("tree");
        system.mkdir(&tree, 0o755)?;
        system.write_file(&tree.join("leaf"), b"x", 0o644)?;

        system.remove_all(&tree)?;
        assert_eq!(system.lstat(&tree)?, LiveEntry::Missing);
        system.remove_all(&tree)?;

        Ok(())
    }

    #[test]
    fn run_script_reports_exit_status() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let system = RealSystem::new();

        let status = system.run_script("ok.sh", b"#!/bin/sh\necho hi > out\n", dir.path())?;
        assert!(status.success());
        assert_eq!(fs::read_to_string(dir.path().join("out"))?, "hi\n");

        let status = system.run_script("fail.sh", b"exit 3\n", dir.path())?;
        assert_eq!(status.code(), Some(3));

        Ok(())
    }
}
