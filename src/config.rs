// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that Oxihome reads before
//! every apply. Every setting is optional. Anything left unset falls back to
//! a sensible default, e.g., the destination directory defaults to the
//! user's home directory.
//!
//! # General Layout
//!
//! ```toml
//! source_dir = "~/.local/share/oxihome"
//! dest_dir = "~"
//! state_file = "~/.config/oxihome/runstate.toml"
//! umask = 0o022
//!
//! [data]
//! email = "john@doe.com"
//!
//! [encryption]
//! command = "age"
//! args = ["--decrypt", "--identity", "~/.config/oxihome/key.txt"]
//! ```
//!
//! Paths go through shell expansion, so both `~` and environment variables
//! like `$HOME` work.

use crate::{
    apply::Umask,
    crypt::CommandDecryptor,
    path::{default_run_state_file, default_source_dir, home_dir, NoWayHome},
    template::DataContext,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// Name of built-in table of the data context.
pub const BUILTIN_DATA: &str = "oxihome";

const FALLBACK_UMASK: u32 = 0o022;

/// Oxihome configuration.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Path to source directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,

    /// Path to destination directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_dir: Option<PathBuf>,

    /// Path to run state file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Umask to use instead of the process umask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,

    /// Data templates are rendered against.
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub data: toml::Table,

    /// External decryption tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSettings>,
}

impl Config {
    /// Load configuration file.
    ///
    /// A missing configuration file is the same as an empty one.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists, but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file cannot be parsed.
    /// - Return [`ConfigError::ShellExpansion`] if a path cannot be expanded.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(data) => data.parse(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no configuration at {:?}, use defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.into(),
            }),
        }
    }

    /// Absolute path to source directory.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if default cannot be determined.
    pub fn source_dir(&self) -> Result<PathBuf> {
        match &self.source_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(default_source_dir()?),
        }
    }

    /// Absolute path to destination directory.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if default cannot be determined.
    pub fn dest_dir(&self) -> Result<PathBuf> {
        match &self.dest_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?),
        }
    }

    /// Absolute path to run state file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if default cannot be determined.
    pub fn state_file(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(default_run_state_file()?),
        }
    }

    /// Umask to apply with.
    ///
    /// Uses the configured umask if set, otherwise reads the umask of the
    /// current process.
    pub fn umask(&self) -> Umask {
        match self.umask {
            Some(mask) => Umask::new(mask),
            None => process_umask(),
        }
    }

    /// Decryptor built from encryption settings, if any.
    pub fn decryptor(&self) -> Option<CommandDecryptor> {
        self.encryption
            .as_ref()
            .map(|settings| CommandDecryptor::new(&settings.command, &settings.args))
    }

    /// Merge user data with built-in data into a data context.
    ///
    /// The built-in `oxihome` table always wins over user data of the same
    /// name.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if a default path cannot be
    ///   determined.
    pub fn data_context(&self) -> Result<DataContext> {
        let mut builtin = toml::Table::new();
        builtin.insert("os".into(), std::env::consts::OS.into());
        builtin.insert("arch".into(), std::env::consts::ARCH.into());
        builtin.insert("home_dir".into(), path_value(home_dir()?));
        builtin.insert("source_dir".into(), path_value(self.source_dir()?));
        builtin.insert("dest_dir".into(), path_value(self.dest_dir()?));

        let mut data = self.data.clone();
        if data.contains_key(BUILTIN_DATA) {
            warn!("user data {BUILTIN_DATA:?} is shadowed by built-in data");
        }
        data.insert(BUILTIN_DATA.into(), toml::Value::Table(builtin));

        Ok(data)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        for path in [
            &mut config.source_dir,
            &mut config.dest_dir,
            &mut config.state_file,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_path(path)?;
        }

        if let Some(encryption) = config.encryption.as_mut() {
            for arg in encryption.args.iter_mut() {
                *arg = shellexpand::full(arg.as_str())?.into_owned();
            }
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// External decryption tool settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// Command to run.
    pub command: String,

    /// Arguments to pass to command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Read umask of current process.
///
/// Linux reports it in `/proc/self/status`. Falls back to `0022` wherever
/// that is not available.
pub fn process_umask() -> Umask {
    let umask = fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("Umask:"))
                .and_then(|mask| u32::from_str_radix(mask.trim(), 8).ok())
        });

    match umask {
        Some(mask) => Umask::new(mask),
        None => {
            debug!("cannot read process umask, fall back to {FALLBACK_UMASK:04o}");
            Umask::new(FALLBACK_UMASK)
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path = path.to_string_lossy();
    Ok(PathBuf::from(shellexpand::full(&*path)?.into_owned()))
}

fn path_value(path: PathBuf) -> toml::Value {
    toml::Value::String(path.to_string_lossy().into_owned())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file cannot be read.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Default path cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("DOTS", "/home/blah/dots"), ("HOME", "/home/blah")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = indoc! {r#"
            source_dir = "$DOTS"
            dest_dir = "~"
            umask = 0o077

            [data]
            email = "john@doe.com"

            [encryption]
            command = "age"
            args = ["--decrypt", "--identity", "~/key.txt"]
        "#}
        .parse()?;

        let mut data = toml::Table::new();
        data.insert("email".into(), "john@doe.com".into());
        let expect = Config {
            source_dir: Some("/home/blah/dots".into()),
            dest_dir: Some("/home/blah".into()),
            state_file: None,
            umask: Some(0o077),
            data,
            encryption: Some(EncryptionSettings {
                command: "age".into(),
                args: vec!["--decrypt".into(), "--identity".into(), "/home/blah/key.txt".into()],
            }),
        };

        assert_eq!(result, expect);
        assert_eq!(result.umask(), Umask::new(0o077));

        Ok(())
    }

    #[test]
    fn serialize_config() {
        let result = Config {
            source_dir: Some("/home/blah/dots".into()),
            dest_dir: Some("/home/blah".into()),
            umask: Some(0o022),
            encryption: Some(EncryptionSettings {
                command: "age".into(),
                args: Vec::new(),
            }),
            ..Default::default()
        }
        .to_string();

        let expect = indoc! {r#"
            source_dir = "/home/blah/dots"
            dest_dir = "/home/blah"
            umask = 18

            [encryption]
            command = "age"
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn reject_unexpandable_path() {
        let result = "source_dir = \"$OXIHOME_SURELY_NOT_SET_ANYWHERE\"".parse::<Config>();
        assert!(matches!(result, Err(ConfigError::ShellExpansion(_))));
    }

    #[test]
    fn load_missing_file_is_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load(dir.path().join("oxihome.toml"))?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn data_context_protects_builtin_table() -> anyhow::Result<()> {
        let config: Config = indoc! {r#"
            source_dir = "/home/blah/dots"
            dest_dir = "/home/blah"

            [data]
            name = "John Doe"

            [data.oxihome]
            os = "plan9"
        "#}
        .parse()?;

        let data = config.data_context()?;
        assert_eq!(data["name"].as_str(), Some("John Doe"));

        let builtin = data[BUILTIN_DATA].as_table().expect("builtin table");
        assert_eq!(builtin["os"].as_str(), Some(std::env::consts::OS));
        assert_eq!(builtin["home_dir"].as_str(), Some("/home/blah"));
        assert_eq!(builtin["source_dir"].as_str(), Some("/home/blah/dots"));
        assert_eq!(builtin["dest_dir"].as_str(), Some("/home/blah"));

        Ok(())
    }

    #[test]
    fn process_umask_keeps_permission_bits() {
        assert_eq!(process_umask().bits() & !0o777, 0);
    }
}
