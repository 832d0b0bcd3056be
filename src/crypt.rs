// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Decryption of `encrypted_` source entries.
//!
//! Oxihome never implements any cipher itself. Encrypted entries are handed
//! to a [`Decryptor`], which in practice pipes them through an external tool
//! like `age` or `gpg` configured by the user.

use std::{
    ffi::OsString,
    io::{self, Write},
    process::{Command, Stdio},
    thread,
};
use tracing::{debug, instrument};

/// Turn ciphertext back into plaintext.
pub trait Decryptor {
    /// Decrypt `ciphertext` of source entry `name`.
    ///
    /// # Errors
    ///
    /// - Return [`DecryptError`] if the ciphertext cannot be decrypted.
    fn decrypt(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Decryptor used when no encryption tool is configured.
///
/// Every decryption attempt fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDecryption;

impl Decryptor for NoDecryption {
    fn decrypt(&self, name: &str, _ciphertext: &[u8]) -> Result<Vec<u8>> {
        Err(DecryptError::NotConfigured { name: name.into() })
    }
}

/// Decrypt by piping ciphertext through an external command.
///
/// Ciphertext is written to the standard input of the command, and the
/// plaintext is read back from its standard output, e.g.,
/// `age --decrypt --identity key.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDecryptor {
    command: OsString,
    args: Vec<OsString>,
}

impl CommandDecryptor {
    /// Construct new command decryptor.
    pub fn new(
        command: impl Into<OsString>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Decryptor for CommandDecryptor {
    #[instrument(skip(self, ciphertext), level = "debug")]
    fn decrypt(&self, name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        debug!("decrypt {name:?} with {:?}", self.command);
        let spawn_err = |err| DecryptError::Spawn {
            source: err,
            name: name.into(),
        };

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        // INVARIANT: Feed stdin from its own thread while stdout and stderr
        // drain, otherwise both sides block on full pipes. Dropping stdin at
        // the end of the thread closes it, so the command sees EOF.
        let stdin = child.stdin.take();
        let (written, output) = thread::scope(|scope| {
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(ciphertext),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (written, output)
        });
        let output = output.map_err(spawn_err)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(output.stderr.as_slice());
            return Err(DecryptError::Failed {
                name: name.into(),
                message: stderr.trim_end().to_string(),
            });
        }

        // INVARIANT: Commands may exit without reading all of stdin.
        if let Err(err) = written {
            if err.kind() != io::ErrorKind::BrokenPipe {
                return Err(spawn_err(err));
            }
        }

        Ok(output.stdout)
    }
}

/// Decryption error types.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    /// No decryption tool is configured.
    #[error("cannot decrypt {name:?}: no encryption command configured")]
    NotConfigured { name: String },

    /// Decryption tool cannot be run.
    #[error("failed to run decryption command for {name:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        name: String,
    },

    /// Decryption tool rejected the ciphertext.
    #[error("failed to decrypt {name:?}: {message}")]
    Failed { name: String, message: String },
}

/// Friendly result alias :3
pub type Result<T, E = DecryptError> = std::result::Result<T, E>;
