// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Persistent run state of `run_once_` scripts.
//!
//! A once script should only run again when its content changes. The run
//! state remembers, for every script identity, the content hash of its last
//! __successful__ run. The record is only written after the script exits
//! with a zero status, so a script that crashes halfway stays eligible to
//! run on the next apply.
//!
//! # Run State File Layout
//!
//! [`FileRunState`] keeps its records in a small TOML file, by default at
//! `$XDG_CONFIG_HOME/oxihome/runstate.toml`:
//!
//! ```toml
//! [run_once]
//! "run_once_before_install.sh" = "sha256:9f86d081884c7d659a2feaa0c55ad015..."
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

const HASH_PREFIX: &str = "sha256:";

/// Compute content hash used to identify a script's content.
///
/// Returns a string in the format `"sha256:<hex>"`.
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    format!("{HASH_PREFIX}{:x}", hasher.finalize())
}

/// Store of content hashes from successful once script runs.
pub trait RunStateStore {
    /// Last successful content hash of script `identity`, if any.
    fn get(&self, identity: &str) -> Option<String>;

    /// Record `hash` as last successful content hash of script `identity`.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if the record cannot be persisted.
    fn set(&mut self, identity: &str, hash: &str) -> Result<()>;
}

/// Run state that lives and dies with the current process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryRunState {
    records: BTreeMap<String, String>,
}

impl MemoryRunState {
    /// Construct new empty run state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStateStore for MemoryRunState {
    fn get(&self, identity: &str) -> Option<String> {
        self.records.get(identity).cloned()
    }

    fn set(&mut self, identity: &str, hash: &str) -> Result<()> {
        self.records.insert(identity.into(), hash.into());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
struct RunStateLayout {
    #[serde(default)]
    run_once: BTreeMap<String, String>,
}

/// Run state persisted to a TOML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRunState {
    path: PathBuf,
    layout: RunStateLayout,
}

impl FileRunState {
    /// Open run state file.
    ///
    /// A missing file is treated as an empty run state. The file itself is
    /// only created on the first call to [`RunStateStore::set`].
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if the file exists but cannot be read.
    /// - Return [`StoreError::Deserialize`] if the file cannot be parsed.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let layout = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(|err| StoreError::Deserialize {
                source: err,
                path: path.clone(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no run state at {:?}", path.display());
                RunStateLayout::default()
            }
            Err(err) => {
                return Err(StoreError::Read {
                    source: err,
                    path: path.clone(),
                })
            }
        };

        Ok(Self { path, layout })
    }

    /// Path to run state file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn persist(&self) -> Result<()> {
        let write_err = |err| StoreError::Write {
            source: err,
            path: self.path.clone(),
        };

        let content = toml::to_string_pretty(&self.layout).map_err(StoreError::Serialize)?;
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(write_err)?;

        // INVARIANT: Write to temporary file in same directory, then rename,
        // so a crash never leaves a half written run state behind.
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        temp.write_all(content.as_bytes()).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&self.path)
            .map_err(|err| write_err(err.error))?;

        Ok(())
    }
}

impl RunStateStore for FileRunState {
    fn get(&self, identity: &str) -> Option<String> {
        self.layout.run_once.get(identity).cloned()
    }

    fn set(&mut self, identity: &str, hash: &str) -> Result<()> {
        self.layout.run_once.insert(identity.into(), hash.into());
        self.persist()
    }
}

/// Run state error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run state file cannot be read.
    #[error("failed to read run state at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Run state file cannot be written.
    #[error("failed to write run state at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Run state file cannot be parsed.
    #[error("failed to parse run state at {:?}", path.display())]
    Deserialize {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    /// Run state cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_hash_known_value() {
        assert_eq!(
            content_hash("hello world"),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn memory_run_state_records_hashes() -> anyhow::Result<()> {
        let mut state = MemoryRunState::new();
        assert_eq!(state.get("run_once_install.sh"), None);

        state.set("run_once_install.sh", "sha256:aaaa")?;
        state.set("run_once_install.sh", "sha256:bbbb")?;
        assert_eq!(state.get("run_once_install.sh"), Some("sha256:bbbb".into()));

        Ok(())
    }

    #[test]
    fn file_run_state_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("runstate.toml");

        let mut state = FileRunState::open(&path)?;
        assert_eq!(state.get("run_once_install.sh"), None);
        assert!(!path.exists());

        state.set("run_once_install.sh", "sha256:aaaa")?;
        let state = FileRunState::open(&path)?;
        assert_eq!(state.get("run_once_install.sh"), Some("sha256:aaaa".into()));

        Ok(())
    }

    #[test]
    fn file_run_state_rejects_garbage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("runstate.toml");
        fs::write(&path, "this is = = not toml")?;

        let result = FileRunState::open(&path);
        assert!(matches!(result, Err(StoreError::Deserialize { .. })));

        Ok(())
    }
}
