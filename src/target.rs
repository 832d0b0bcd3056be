// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Target state computation.
//!
//! The __target state__ is the fully resolved description of what the
//! destination directory should look like after an apply. It is computed
//! from a [`SourceTree`] by decrypting encrypted entries, rendering
//! templates, and turning attributes into permissions and run conditions.
//!
//! # Ordering
//!
//! Entries come out parents first, in source sibling order. Scripts are
//! pulled out of the tree: before scripts lead the target state, after
//! scripts trail it, and both groups are sorted by order prefix, and then by
//! target path. Scripts without a phase run after everything else.
//!
//! # Empty Contents
//!
//! A plain file whose contents end up empty is a request to __remove__ the
//! target, unless it carries the `empty_` attribute. The same goes for
//! symlinks without a link target. Scripts that consist of nothing but
//! whitespace are dropped altogether.
//!
//! [`SourceTree`]: crate::source::SourceTree

use crate::{
    attr::{EntryKind, OrderPrefix, ScriptPhase},
    crypt::{DecryptError, Decryptor},
    path::normalize,
    runstate::content_hash,
    source::{SourceEntry, SourceTree},
    template::{DataContext, TemplateEngine, TemplateError},
};

use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// When a script is allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCondition {
    /// Run on every apply.
    Always,

    /// Run only if `hash` differs from the last successful run.
    Once { hash: String },
}

/// Desired state of a single target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// Directory. Exact directories prune every live child not listed in
    /// `managed`.
    Dir {
        perm: u32,
        exact: bool,
        managed: BTreeSet<String>,
    },

    /// Regular file. Create-only files never replace existing entries.
    File {
        contents: Vec<u8>,
        perm: u32,
        create: bool,
    },

    /// Symlink, compared by link text.
    Symlink { link: PathBuf },

    /// Script to run. Never written to the destination directory.
    Script {
        contents: Vec<u8>,
        condition: RunCondition,
        phase: ScriptPhase,
        identity: String,
    },

    /// Nothing may exist at the target path.
    Absent,
}

/// Target path with its desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    /// Absolute path inside destination directory.
    pub path: PathBuf,

    /// Source entry this target comes from, relative to source directory.
    pub source_rel: PathBuf,

    /// Desired state.
    pub kind: TargetKind,
}

/// Options controlling target state computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    dest_dir: PathBuf,
    scope: Vec<PathBuf>,
    recursive: bool,
}

impl BuildOptions {
    /// Construct new options targeting `dest_dir` with everything in scope.
    pub fn new(dest_dir: impl AsRef<Path>) -> Self {
        Self {
            dest_dir: normalize(dest_dir),
            scope: Vec::new(),
            recursive: true,
        }
    }

    /// Restrict target state to paths relative to destination directory.
    ///
    /// An empty path names the destination directory itself, which puts
    /// everything in scope.
    pub fn with_scope(mut self, scope: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        let scope = scope.into_iter().map(normalize).collect::<Vec<_>>();
        self.scope = match scope.iter().any(|path| path.as_os_str().is_empty()) {
            true => Vec::new(),
            false => scope,
        };
        self
    }

    /// Include everything beneath scoped directories, or only the scoped
    /// entries themselves.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn dest_dir(&self) -> &Path {
        self.dest_dir.as_path()
    }
}

/// Ordered mapping of target paths to their desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    dest_dir: PathBuf,
    entries: Vec<TargetEntry>,
    index: BTreeMap<PathBuf, usize>,
}

impl TargetState {
    /// Construct target state from entries in apply order.
    ///
    /// # Errors
    ///
    /// - Return [`DuplicateTargetError`] if two entries share a path.
    pub fn from_entries(
        dest_dir: impl Into<PathBuf>,
        entries: Vec<TargetEntry>,
    ) -> Result<Self, DuplicateTargetError> {
        let mut index = BTreeMap::new();
        for (id, entry) in entries.iter().enumerate() {
            if let Some(first) = index.insert(entry.path.clone(), id) {
                return Err(DuplicateTargetError {
                    target: entry.path.clone(),
                    first: entries[first].source_rel.clone(),
                    second: entry.source_rel.clone(),
                });
            }
        }

        Ok(Self {
            dest_dir: dest_dir.into(),
            entries,
            index,
        })
    }

    /// Compute target state from source tree.
    ///
    /// Every template is rendered, and every encrypted entry decrypted,
    /// exactly once. The first failure aborts the whole computation.
    ///
    /// # Errors
    ///
    /// - Return [`BuildError::Template`] if a template cannot be rendered.
    /// - Return [`BuildError::Decrypt`] if an entry cannot be decrypted.
    /// - Return [`BuildError::Duplicate`] if two entries share a target.
    /// - Return [`BuildError::NotManaged`] if a scope path matches nothing.
    #[instrument(skip_all, level = "debug")]
    pub fn build(
        tree: &SourceTree,
        data: &DataContext,
        engine: &impl TemplateEngine,
        decryptor: &impl Decryptor,
        options: &BuildOptions,
    ) -> Result<Self> {
        let scope = Scope::new(&options.scope, options.recursive);
        let mut matched = vec![false; options.scope.len()];
        let mut entries = Vec::new();
        let mut before = Vec::new();
        let mut after = Vec::new();

        for entry in tree.iter() {
            let rel = entry.target_rel.as_path();
            let in_scope = scope.includes(rel, &mut matched);
            if !in_scope && !scope.leads_to(rel) {
                continue;
            }

            let path = options.dest_dir.join(rel);
            let source_rel = entry.source_rel.clone();
            let target = |kind| TargetEntry {
                path: path.clone(),
                source_rel: source_rel.clone(),
                kind,
            };

            // INVARIANT: Directories only leading to scoped entries are
            // created, but never pruned.
            if !in_scope {
                if entry.attrs.kind == EntryKind::Dir {
                    entries.push(target(TargetKind::Dir {
                        perm: entry.attrs.perm(),
                        exact: false,
                        managed: BTreeSet::new(),
                    }));
                }
                continue;
            }

            let kind = match entry.attrs.kind {
                EntryKind::Dir => {
                    let exact = entry.attrs.exact && scope.covers_subtree();
                    let managed = match exact {
                        true => managed_names(tree, entry),
                        false => BTreeSet::new(),
                    };
                    TargetKind::Dir {
                        perm: entry.attrs.perm(),
                        exact,
                        managed,
                    }
                }
                EntryKind::Remove => TargetKind::Absent,
                EntryKind::File => {
                    let contents = resolve_contents(entry, data, engine, decryptor)?;
                    if contents.is_empty() && !entry.attrs.empty && !entry.attrs.create {
                        TargetKind::Absent
                    } else {
                        TargetKind::File {
                            contents,
                            perm: entry.attrs.perm(),
                            create: entry.attrs.create,
                        }
                    }
                }
                EntryKind::Symlink => {
                    let mut link = resolve_contents(entry, data, engine, decryptor)?;
                    while matches!(link.last(), Some(b'\n' | b'\r')) {
                        link.pop();
                    }

                    if link.is_empty() {
                        TargetKind::Absent
                    } else {
                        TargetKind::Symlink {
                            link: PathBuf::from(OsString::from_vec(link)),
                        }
                    }
                }
                EntryKind::Script => {
                    let contents = resolve_contents(entry, data, engine, decryptor)?;
                    if contents.iter().all(u8::is_ascii_whitespace) {
                        debug!("skip empty script {:?}", entry.source_rel.display());
                        continue;
                    }

                    let condition = match entry.attrs.once {
                        true => RunCondition::Once {
                            hash: content_hash(&contents),
                        },
                        false => RunCondition::Always,
                    };
                    let phase = entry.attrs.phase.unwrap_or(ScriptPhase::After);
                    let script = target(TargetKind::Script {
                        contents,
                        condition,
                        phase,
                        identity: entry.source_rel.to_string_lossy().into_owned(),
                    });

                    let key = (entry.attrs.order, entry.target_rel.clone());
                    match phase {
                        ScriptPhase::Before => before.push((key, script)),
                        ScriptPhase::After => after.push((key, script)),
                    }
                    continue;
                }
            };

            debug!("target {:?}: {:?}", path.display(), kind_name(&kind));
            entries.push(target(kind));
        }

        if let Some(unmatched) = matched.iter().position(|hit| !hit) {
            return Err(BuildError::NotManaged {
                path: options.scope[unmatched].clone(),
            });
        }

        let mut ordered = sort_scripts(before);
        ordered.append(&mut entries);
        ordered.append(&mut sort_scripts(after));

        Ok(Self::from_entries(options.dest_dir.clone(), ordered)?)
    }

    /// Absolute path to destination directory.
    pub fn dest_dir(&self) -> &Path {
        self.dest_dir.as_path()
    }

    /// Entries in apply order.
    pub fn entries(&self) -> &[TargetEntry] {
        self.entries.as_slice()
    }

    /// Look up desired state of absolute target path.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&TargetEntry> {
        self.index
            .get(path.as_ref())
            .map(|id| &self.entries[*id])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Scope<'a> {
    paths: &'a [PathBuf],
    recursive: bool,
}

impl<'a> Scope<'a> {
    fn new(paths: &'a [PathBuf], recursive: bool) -> Self {
        Self { paths, recursive }
    }

    fn includes(&self, rel: &Path, matched: &mut [bool]) -> bool {
        if self.paths.is_empty() {
            return true;
        }

        let mut hit = false;
        for (id, scope) in self.paths.iter().enumerate() {
            if rel == scope || (self.recursive && rel.starts_with(scope)) {
                matched[id] = true;
                hit = true;
            }
        }

        hit
    }

    fn leads_to(&self, rel: &Path) -> bool {
        self.paths
            .iter()
            .any(|scope| scope != rel && scope.starts_with(rel))
    }

    fn covers_subtree(&self) -> bool {
        self.paths.is_empty() || self.recursive
    }
}

fn resolve_contents(
    entry: &SourceEntry,
    data: &DataContext,
    engine: &impl TemplateEngine,
    decryptor: &impl Decryptor,
) -> Result<Vec<u8>> {
    let name = entry.source_rel.to_string_lossy().into_owned();
    let mut contents = entry.contents.clone();

    if entry.attrs.encrypted {
        contents = decryptor
            .decrypt(&name, &contents)
            .map_err(|err| BuildError::Decrypt {
                source: err,
                path: entry.source_path.clone(),
            })?;
    }

    if entry.attrs.template {
        let text = String::from_utf8(contents)
            .map_err(|_| TemplateError::new(name.as_str(), "template is not valid UTF-8"))?;
        contents = engine.render(&name, &text, data)?.into_bytes();
    }

    Ok(contents)
}

fn managed_names(tree: &SourceTree, dir: &SourceEntry) -> BTreeSet<String> {
    let mut managed = dir
        .children
        .iter()
        .map(|child| child.target_name().to_string())
        .collect::<BTreeSet<_>>();

    for ignored in tree.ignored() {
        if ignored.parent() == Some(dir.target_rel.as_path()) {
            if let Some(name) = ignored.file_name().and_then(|name| name.to_str()) {
                managed.insert(name.to_string());
            }
        }
    }

    managed
}

fn sort_scripts(mut scripts: Vec<((Option<OrderPrefix>, PathBuf), TargetEntry)>) -> Vec<TargetEntry> {
    scripts.sort_by(|a, b| a.0.cmp(&b.0));
    scripts.into_iter().map(|(_, script)| script).collect()
}

fn kind_name(kind: &TargetKind) -> &'static str {
    match kind {
        TargetKind::Dir { .. } => "dir",
        TargetKind::File { .. } => "file",
        TargetKind::Symlink { .. } => "symlink",
        TargetKind::Script { .. } => "script",
        TargetKind::Absent => "absent",
    }
}

/// Two source entries resolve to the same target path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "target {:?} is produced by both {:?} and {:?}",
    target.display(),
    first.display(),
    second.display()
)]
pub struct DuplicateTargetError {
    pub target: PathBuf,
    pub first: PathBuf,
    pub second: PathBuf,
}

/// Target state computation error types.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Template cannot be rendered.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Encrypted entry cannot be decrypted.
    #[error("failed to decrypt source entry {:?}", path.display())]
    Decrypt {
        #[source]
        source: DecryptError,
        path: PathBuf,
    },

    /// Two entries resolve to the same target.
    #[error(transparent)]
    Duplicate(#[from] DuplicateTargetError),

    /// Scope path does not match anything in the source directory.
    #[error("{:?} is not managed by the source directory", path.display())]
    NotManaged { path: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = BuildError> = std::result::Result<T, E>;
