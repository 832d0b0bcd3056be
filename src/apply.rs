// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Apply target state to the destination directory.
//!
//! The executor compares each [`TargetEntry`] against the live file system,
//! and only mutates what differs. Work happens in a fixed sequence of
//! phases:
//!
//! 1. Run before scripts.
//! 2. Create directories, parents first.
//! 3. Write files, create symlinks, and remove absent targets.
//! 4. Prune exact directories, deepest first.
//! 5. Run after scripts.
//!
//! Every mutation is recorded in an [`ApplyReport`]. A dry run walks through
//! the exact same decisions, but never touches the file system, the run
//! state, or any script. Thus, the report of a dry run always matches the
//! report of the real run that follows it.
//!
//! [`TargetEntry`]: crate::target::TargetEntry

use crate::{
    attr::ScriptPhase,
    runstate::{RunStateStore, StoreError},
    system::{LiveEntry, System},
    target::{RunCondition, TargetEntry, TargetKind, TargetState},
};

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// File mode creation mask.
///
/// Captured once before an apply starts, and never read from the process
/// again while the apply runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Umask(u32);

impl Umask {
    /// Construct new umask. Only permission bits are kept.
    pub fn new(mask: u32) -> Self {
        Self(mask & 0o777)
    }

    /// Mask out bits of `perm`.
    pub fn apply(&self, perm: u32) -> u32 {
        perm & !self.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl Default for Umask {
    fn default() -> Self {
        Self(0o022)
    }
}

impl Display for Umask {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:04o}", self.0)
    }
}

/// Options controlling an apply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Plan mutations without performing them.
    pub dry_run: bool,

    /// Mask applied to every permission set.
    pub umask: Umask,
}

/// Phase of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApplyPhase {
    BeforeScripts,
    CreateDirs,
    MutateEntries,
    PruneDirs,
    AfterScripts,
}

impl Display for ApplyPhase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let phase = match self {
            Self::BeforeScripts => "before scripts",
            Self::CreateDirs => "create dirs",
            Self::MutateEntries => "mutate entries",
            Self::PruneDirs => "prune dirs",
            Self::AfterScripts => "after scripts",
        };
        fmt.write_str(phase)
    }
}

/// Mutation performed on a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDir { perm: u32 },
    Chmod { perm: u32 },
    WriteFile { perm: u32 },
    Symlink { link: PathBuf },
    Remove,
    RunScript,
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::CreateDir { perm } => write!(fmt, "create directory ({perm:04o})"),
            Self::Chmod { perm } => write!(fmt, "change mode ({perm:04o})"),
            Self::WriteFile { perm } => write!(fmt, "write file ({perm:04o})"),
            Self::Symlink { link } => write!(fmt, "link to {:?}", link.display()),
            Self::Remove => fmt.write_str("remove"),
            Self::RunScript => fmt.write_str("run script"),
        }
    }
}

/// Mutation of a path during a specific phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub phase: ApplyPhase,
    pub path: PathBuf,
    pub action: Action,
}

/// Every mutation of an apply in the order it happened.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    actions: Vec<PlannedAction>,
}

impl ApplyReport {
    pub fn actions(&self) -> &[PlannedAction] {
        self.actions.as_slice()
    }

    /// Nothing needed to change.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Apply target state to the destination directory.
///
/// Stops at the first failure. Whatever was already applied stays applied.
///
/// # Errors
///
/// - Return [`ApplyError::Io`] if the file system cannot be read or
///   mutated.
/// - Return [`ApplyError::Script`] if a script exits unsuccessfully.
/// - Return [`ApplyError::Store`] if run state cannot be recorded.
#[instrument(skip_all, fields(dry_run = options.dry_run), level = "debug")]
pub fn apply(
    state: &TargetState,
    system: &impl System,
    run_state: &mut impl RunStateStore,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let mut executor = Executor {
        state,
        system,
        run_state,
        options,
        fresh: BTreeSet::new(),
        report: ApplyReport::default(),
    };

    executor.run_scripts(ApplyPhase::BeforeScripts, ScriptPhase::Before)?;
    executor.create_dirs()?;
    executor.mutate_entries()?;
    executor.prune_dirs()?;
    executor.run_scripts(ApplyPhase::AfterScripts, ScriptPhase::After)?;

    Ok(executor.report)
}

struct Executor<'a, S, R> {
    state: &'a TargetState,
    system: &'a S,
    run_state: &'a mut R,
    options: &'a ApplyOptions,

    // Directories made during this apply. Nothing lives beneath them yet,
    // which keeps dry runs from looking at paths that do not exist.
    fresh: BTreeSet<PathBuf>,
    report: ApplyReport,
}

impl<S, R> Executor<'_, S, R>
where
    S: System,
    R: RunStateStore,
{
    fn run_scripts(&mut self, phase: ApplyPhase, script_phase: ScriptPhase) -> Result<()> {
        let state = self.state;
        for entry in state.entries() {
            let TargetKind::Script {
                contents,
                condition,
                phase: entry_phase,
                identity,
            } = &entry.kind
            else {
                continue;
            };

            if *entry_phase != script_phase {
                continue;
            }

            if let RunCondition::Once { hash } = condition {
                if self.run_state.get(identity).as_deref() == Some(hash.as_str()) {
                    debug!("skip unchanged once script {identity:?}");
                    continue;
                }
            }

            self.record(phase, &entry.path, Action::RunScript);
            if self.options.dry_run {
                continue;
            }

            let name = entry
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| identity.clone());
            let dir = self.script_dir(&entry.path)?;
            let status = self
                .system
                .run_script(&name, contents, &dir)
                .map_err(|err| io_error(err, &entry.path, "run script"))?;

            if !status.success() {
                return Err(ScriptError {
                    path: entry.path.clone(),
                    code: status.code(),
                }
                .into());
            }

            // INVARIANT: Only record once scripts after they succeed.
            if let RunCondition::Once { hash } = condition {
                self.run_state.set(identity, hash)?;
            }
        }

        Ok(())
    }

    fn create_dirs(&mut self) -> Result<()> {
        let state = self.state;
        for entry in state.entries() {
            let TargetKind::Dir { perm, .. } = &entry.kind else {
                continue;
            };

            let perm = self.options.umask.apply(*perm);
            match self.lstat(&entry.path)? {
                LiveEntry::Dir { perm: live } if live == perm => {
                    debug!("directory {:?} is up to date", entry.path.display());
                }
                LiveEntry::Dir { .. } => {
                    self.record(ApplyPhase::CreateDirs, &entry.path, Action::Chmod { perm });
                    self.mutate(&entry.path, "change mode of", |system, path| {
                        system.chmod(path, perm)
                    })?;
                }
                LiveEntry::Missing => self.create_dir(entry, perm)?,
                _ => {
                    self.remove(ApplyPhase::CreateDirs, &entry.path)?;
                    self.create_dir(entry, perm)?;
                }
            }
        }

        Ok(())
    }

    fn create_dir(&mut self, entry: &TargetEntry, perm: u32) -> Result<()> {
        self.record(ApplyPhase::CreateDirs, &entry.path, Action::CreateDir { perm });
        self.mutate(&entry.path, "create directory", |system, path| {
            system.mkdir(path, perm)
        })?;
        self.fresh.insert(entry.path.clone());

        Ok(())
    }

    fn mutate_entries(&mut self) -> Result<()> {
        let state = self.state;
        for entry in state.entries() {
            match &entry.kind {
                TargetKind::File {
                    contents,
                    perm,
                    create,
                } => self.reconcile_file(entry, contents, *perm, *create)?,
                TargetKind::Symlink { link } => self.reconcile_symlink(entry, link)?,
                TargetKind::Absent => {
                    if self.lstat(&entry.path)? != LiveEntry::Missing {
                        self.remove(ApplyPhase::MutateEntries, &entry.path)?;
                    }
                }
                TargetKind::Dir { .. } | TargetKind::Script { .. } => continue,
            }
        }

        Ok(())
    }

    fn reconcile_file(
        &mut self,
        entry: &TargetEntry,
        contents: &[u8],
        perm: u32,
        create: bool,
    ) -> Result<()> {
        let perm = self.options.umask.apply(perm);
        let live = self.lstat(&entry.path)?;

        // INVARIANT: Create-only files never touch whatever already exists.
        if create && live != LiveEntry::Missing {
            debug!("keep existing {:?}", entry.path.display());
            return Ok(());
        }

        match live {
            LiveEntry::File {
                perm: live_perm,
                size,
            } => {
                let same_contents = size == contents.len() as u64
                    && self
                        .system
                        .read_file(&entry.path)
                        .map_err(|err| io_error(err, &entry.path, "read"))?
                        == contents;

                if !same_contents {
                    self.write_file(entry, contents, perm)?;
                } else if live_perm != perm {
                    self.record(ApplyPhase::MutateEntries, &entry.path, Action::Chmod { perm });
                    self.mutate(&entry.path, "change mode of", |system, path| {
                        system.chmod(path, perm)
                    })?;
                } else {
                    debug!("file {:?} is up to date", entry.path.display());
                }
            }
            LiveEntry::Missing => self.write_file(entry, contents, perm)?,
            _ => {
                self.remove(ApplyPhase::MutateEntries, &entry.path)?;
                self.write_file(entry, contents, perm)?;
            }
        }

        Ok(())
    }

    fn write_file(&mut self, entry: &TargetEntry, contents: &[u8], perm: u32) -> Result<()> {
        self.record(ApplyPhase::MutateEntries, &entry.path, Action::WriteFile { perm });
        self.mutate(&entry.path, "write", |system, path| {
            system.write_file(path, contents, perm)
        })
    }

    fn reconcile_symlink(&mut self, entry: &TargetEntry, link: &Path) -> Result<()> {
        match self.lstat(&entry.path)? {
            LiveEntry::Symlink => {
                let live = self
                    .system
                    .read_link(&entry.path)
                    .map_err(|err| io_error(err, &entry.path, "read link"))?;
                if live == link {
                    debug!("symlink {:?} is up to date", entry.path.display());
                    return Ok(());
                }

                self.record_symlink(entry, link)?;
            }
            LiveEntry::Missing => self.record_symlink(entry, link)?,
            _ => {
                self.remove(ApplyPhase::MutateEntries, &entry.path)?;
                self.record_symlink(entry, link)?;
            }
        }

        Ok(())
    }

    fn record_symlink(&mut self, entry: &TargetEntry, link: &Path) -> Result<()> {
        self.record(
            ApplyPhase::MutateEntries,
            &entry.path,
            Action::Symlink { link: link.into() },
        );
        self.mutate(&entry.path, "link", |system, path| {
            system.remove_all(path)?;
            system.symlink(link, path)
        })
    }

    fn prune_dirs(&mut self) -> Result<()> {
        let state = self.state;
        let mut exact = state
            .entries()
            .iter()
            .filter_map(|entry| match &entry.kind {
                TargetKind::Dir {
                    exact: true,
                    managed,
                    ..
                } => Some((entry.path.as_path(), managed)),
                _ => None,
            })
            .collect::<Vec<_>>();
        exact.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));

        for (dir, managed) in exact {
            // INVARIANT: Directories made during this apply only hold managed
            // entries.
            if self.fresh.contains(dir) {
                continue;
            }

            let names = self
                .system
                .read_dir(dir)
                .map_err(|err| io_error(err, dir, "read directory"))?;
            for name in names {
                let managed_name = name.to_str().is_some_and(|name| managed.contains(name));
                if !managed_name {
                    self.remove(ApplyPhase::PruneDirs, &dir.join(name))?;
                }
            }
        }

        Ok(())
    }

    fn remove(&mut self, phase: ApplyPhase, path: &Path) -> Result<()> {
        self.record(phase, path, Action::Remove);
        self.mutate(path, "remove", |system, path| system.remove_all(path))
    }

    fn lstat(&self, path: &Path) -> Result<LiveEntry> {
        if path
            .ancestors()
            .skip(1)
            .any(|ancestor| self.fresh.contains(ancestor))
        {
            return Ok(LiveEntry::Missing);
        }

        self.system
            .lstat(path)
            .map_err(|err| io_error(err, path, "inspect"))
    }

    fn script_dir(&self, path: &Path) -> Result<PathBuf> {
        let dir = path.parent().unwrap_or(self.state.dest_dir());
        match self.lstat(dir)? {
            LiveEntry::Dir { .. } => Ok(dir.to_path_buf()),
            _ => Ok(self.state.dest_dir().to_path_buf()),
        }
    }

    fn mutate(
        &self,
        path: &Path,
        action: &'static str,
        op: impl FnOnce(&S, &Path) -> io::Result<()>,
    ) -> Result<()> {
        if self.options.dry_run {
            return Ok(());
        }

        op(self.system, path).map_err(|err| io_error(err, path, action))
    }

    fn record(&mut self, phase: ApplyPhase, path: &Path, action: Action) {
        match self.options.dry_run {
            true => info!("would {action} {:?}", path.display()),
            false => info!("{action} {:?}", path.display()),
        }

        self.report.actions.push(PlannedAction {
            phase,
            path: path.to_path_buf(),
            action,
        });
    }
}

fn io_error(source: io::Error, path: &Path, action: &'static str) -> ApplyError {
    ApplyError::Io {
        source,
        path: path.to_path_buf(),
        action,
    }
}

/// Script exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("script {:?} failed with {}", path.display(), exit_code(code))]
pub struct ScriptError {
    pub path: PathBuf,
    pub code: Option<i32>,
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".into(),
    }
}

/// Apply error types.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// File system operation failed.
    #[error("failed to {action} {:?}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
        action: &'static str,
    },

    /// Script exited unsuccessfully.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Run state cannot be recorded.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = ApplyError> = std::result::Result<T, E>;
