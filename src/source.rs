// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source directory traversal.
//!
//! The __source directory__ holds the desired state of the destination
//! directory encoded through attribute-bearing names (see [`attr`]). Walking
//! it produces a [`SourceTree`]: every recognized entry with its decoded
//! attributes, its payload, and its children sorted by order prefix, and
//! then by target name.
//!
//! # Skipped Entries
//!
//! Names starting with a `.` belong to the source directory itself, e.g.,
//! `.git` or the `.oxihomeignore` file, so they are never treated as
//! entries. Anything that is neither a regular file nor a directory is
//! skipped with a warning.
//!
//! # Ignore File
//!
//! An optional `.oxihomeignore` at the top-level of the source directory
//! lists gitignore patterns matched against __target__ paths, e.g.,
//! `.cache/` ignores whatever would be deployed to `~/.cache`. Ignored
//! targets are remembered so exact directories leave them alone.
//!
//! [`attr`]: crate::attr

use crate::{
    attr::{self, Attributes, InvalidAttributeError, OrderPrefix, SourceShape},
    target::DuplicateTargetError,
};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Name of ignore file at the top-level of the source directory.
pub const IGNORE_FILE: &str = ".oxihomeignore";

/// Entry of the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Absolute path of entry on disk.
    pub source_path: PathBuf,

    /// Path of entry relative to source directory.
    pub source_rel: PathBuf,

    /// Path of target relative to destination directory.
    pub target_rel: PathBuf,

    /// Attributes decoded from entry name.
    pub attrs: Attributes,

    /// Raw file contents. Always empty for directories.
    pub contents: Vec<u8>,

    /// Children of directory in sibling order.
    pub children: Vec<SourceEntry>,
}

impl SourceEntry {
    /// Decoded target name of entry.
    pub fn target_name(&self) -> &str {
        self.target_rel
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    fn sort_key(&self) -> (Option<OrderPrefix>, &str) {
        (self.attrs.order, self.target_name())
    }
}

/// Ordered tree of source entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    root: PathBuf,
    entries: Vec<SourceEntry>,
    ignored: BTreeSet<PathBuf>,
}

impl SourceTree {
    /// Construct source tree from already decoded entries.
    ///
    /// Sibling order is taken as given.
    pub fn new(root: impl Into<PathBuf>, entries: Vec<SourceEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
            ignored: BTreeSet::new(),
        }
    }

    /// Walk source directory.
    ///
    /// Traverses source directory breadth-first through an explicit
    /// worklist. Each directory listing is decoded, and sorted by order
    /// prefix and target name, so the resulting tree never depends on the
    /// order the host file system lists entries in.
    ///
    /// # Errors
    ///
    /// - Return [`SourceWalkError::ReadDir`] or [`SourceWalkError::ReadFile`]
    ///   if entries cannot be read.
    /// - Return [`SourceWalkError::NonUtf8Name`] for names that are not
    ///   valid UTF-8.
    /// - Return [`SourceWalkError::Attribute`] for contradictory attributes.
    /// - Return [`SourceWalkError::Duplicate`] if two siblings produce the
    ///   same target name.
    /// - Return [`SourceWalkError::Ignore`] if ignore file cannot be parsed.
    #[instrument(skip(root), level = "debug")]
    pub fn walk(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        debug!("walk source directory {:?}", root.display());
        let matcher = load_ignore_file(&root)?;

        let mut nodes: Vec<SourceEntry> = Vec::new();
        let mut child_ids: Vec<Vec<usize>> = Vec::new();
        let mut top_ids = Vec::new();
        let mut ignored = BTreeSet::new();

        let mut worklist = VecDeque::new();
        worklist.push_back((None, root.clone(), PathBuf::new(), PathBuf::new()));

        while let Some((parent, dir, source_rel, target_rel)) = worklist.pop_front() {
            let level = read_level(&dir, &source_rel, &target_rel, &matcher, &mut ignored)?;
            for entry in level {
                let id = nodes.len();
                if entry.attrs.kind == attr::EntryKind::Dir {
                    worklist.push_back((
                        Some(id),
                        entry.source_path.clone(),
                        entry.source_rel.clone(),
                        entry.target_rel.clone(),
                    ));
                }

                match parent {
                    Some(parent) => child_ids[parent].push(id),
                    None => top_ids.push(id),
                }
                nodes.push(entry);
                child_ids.push(Vec::new());
            }
        }

        // INVARIANT: Children always come after their parent, so assemble
        // the tree from the back.
        let mut slots: Vec<Option<SourceEntry>> = nodes.into_iter().map(Some).collect();
        for id in (0..slots.len()).rev() {
            let children = child_ids[id]
                .iter()
                .filter_map(|child| slots[*child].take())
                .collect::<Vec<_>>();
            if let Some(node) = slots[id].as_mut() {
                node.children = children;
            }
        }
        let entries = top_ids
            .into_iter()
            .filter_map(|id| slots[id].take())
            .collect();

        Ok(Self {
            root,
            entries,
            ignored,
        })
    }

    /// Absolute path to source directory.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Top-level entries in sibling order.
    pub fn entries(&self) -> &[SourceEntry] {
        self.entries.as_slice()
    }

    /// Target paths matched by the ignore file.
    pub fn ignored(&self) -> &BTreeSet<PathBuf> {
        &self.ignored
    }

    /// Iterate entries parents first, siblings in order.
    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        let mut stack = self.entries.iter().rev().collect::<Vec<_>>();
        std::iter::from_fn(move || {
            let entry = stack.pop()?;
            stack.extend(entry.children.iter().rev());
            Some(entry)
        })
    }
}

fn load_ignore_file(root: &Path) -> Result<Gitignore> {
    let path = root.join(IGNORE_FILE);
    let mut builder = GitignoreBuilder::new(root);
    if path.is_file() {
        debug!("load ignore file {:?}", path.display());
        if let Some(err) = builder.add(&path) {
            return Err(SourceWalkError::Ignore { source: err, path });
        }
    }

    builder
        .build()
        .map_err(|err| SourceWalkError::Ignore { source: err, path })
}

fn read_level(
    dir: &Path,
    source_rel: &Path,
    target_rel: &Path,
    matcher: &Gitignore,
    ignored: &mut BTreeSet<PathBuf>,
) -> Result<Vec<SourceEntry>> {
    let read_dir_err = |err| SourceWalkError::ReadDir {
        source: err,
        path: dir.to_path_buf(),
    };

    let mut level = Vec::new();
    for dir_entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let dir_entry = dir_entry.map_err(read_dir_err)?;
        let path = dir_entry.path();
        let Some(name) = dir_entry.file_name().to_str().map(ToOwned::to_owned) else {
            return Err(SourceWalkError::NonUtf8Name { path });
        };

        if name.starts_with('.') {
            debug!("skip source metadata {:?}", path.display());
            continue;
        }

        let file_type = dir_entry.file_type().map_err(read_dir_err)?;
        let shape = if file_type.is_dir() {
            SourceShape::Dir
        } else if file_type.is_file() {
            SourceShape::File
        } else {
            warn!("skip unrecognized source entry {:?}", path.display());
            continue;
        };

        let (target_name, attrs) =
            attr::decode(&name, shape).map_err(|err| SourceWalkError::Attribute {
                source: err,
                path: path.clone(),
            })?;
        let target = target_rel.join(&target_name);

        if matcher
            .matched_path_or_any_parents(&target, shape == SourceShape::Dir)
            .is_ignore()
        {
            debug!("ignore {:?}", target.display());
            ignored.insert(target);
            continue;
        }

        let contents = match shape {
            SourceShape::File => fs::read(&path).map_err(|err| SourceWalkError::ReadFile {
                source: err,
                path: path.clone(),
            })?,
            SourceShape::Dir => Vec::new(),
        };

        level.push(SourceEntry {
            source_path: path,
            source_rel: source_rel.join(&name),
            target_rel: target,
            attrs,
            contents,
            children: Vec::new(),
        });
    }

    let mut seen: BTreeMap<&Path, &Path> = BTreeMap::new();
    for entry in &level {
        if let Some(first) = seen.insert(&entry.target_rel, &entry.source_rel) {
            let mut pair = [first.to_path_buf(), entry.source_rel.clone()];
            pair.sort();
            let [first, second] = pair;
            return Err(DuplicateTargetError {
                target: entry.target_rel.clone(),
                first,
                second,
            }
            .into());
        }
    }

    level.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    Ok(level)
}

/// Source walk error types.
#[derive(Debug, thiserror::Error)]
pub enum SourceWalkError {
    /// Directory of source directory cannot be listed.
    #[error("failed to read source directory {:?}", path.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// File of source directory cannot be read.
    #[error("failed to read source file {:?}", path.display())]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Entry name cannot be decoded as UTF-8.
    #[error("source entry {:?} has a non UTF-8 name", path.display())]
    NonUtf8Name { path: PathBuf },

    /// Entry name carries invalid attributes.
    #[error("bad source entry {:?}", path.display())]
    Attribute {
        #[source]
        source: InvalidAttributeError,
        path: PathBuf,
    },

    /// Two siblings resolve to the same target.
    #[error(transparent)]
    Duplicate(#[from] DuplicateTargetError),

    /// Ignore file cannot be parsed.
    #[error("failed to parse ignore file {:?}", path.display())]
    Ignore {
        #[source]
        source: ignore::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = SourceWalkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn populate(root: &Path, files: &[(&str, &str)]) -> anyhow::Result<()> {
        for (path, contents) in files {
            let path = root.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }

        Ok(())
    }

    fn target_paths(tree: &SourceTree) -> Vec<String> {
        tree.iter()
            .map(|entry| entry.target_rel.display().to_string())
            .collect()
    }

    #[test]
    fn walk_sorts_siblings_by_order_then_name() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        populate(
            root.path(),
            &[
                ("dot_zshrc", "zsh"),
                ("20_run_b.sh", "echo b"),
                ("10_run_a.sh", "echo a"),
                ("dot_config/nvim/init.lua", "vim"),
                ("dot_config/alacritty.toml", "term"),
                ("dot_bashrc", "bash"),
            ],
        )?;

        let tree = SourceTree::walk(root.path())?;
        assert_eq!(
            target_paths(&tree),
            vec![
                ".bashrc",
                ".config",
                ".config/alacritty.toml",
                ".config/nvim",
                ".config/nvim/init.lua",
                ".zshrc",
                "a.sh",
                "b.sh",
            ]
        );

        let bashrc = &tree.entries()[0];
        assert_eq!(bashrc.contents, b"bash");
        assert_eq!(bashrc.source_rel, PathBuf::from("dot_bashrc"));

        Ok(())
    }

    #[test]
    fn walk_skips_source_metadata() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        populate(
            root.path(),
            &[(".git/HEAD", "ref"), (".hidden", "x"), ("dot_file", "y")],
        )?;

        let tree = SourceTree::walk(root.path())?;
        assert_eq!(target_paths(&tree), vec![".file"]);

        Ok(())
    }

    #[test]
    fn walk_honors_ignore_file() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        populate(
            root.path(),
            &[
                (IGNORE_FILE, ".cache/\n*.bak\n"),
                ("dot_cache/junk", "x"),
                ("dot_vimrc.bak", "old"),
                ("dot_vimrc", "new"),
            ],
        )?;

        let tree = SourceTree::walk(root.path())?;
        assert_eq!(target_paths(&tree), vec![".vimrc"]);
        assert!(tree.ignored().contains(Path::new(".cache")));
        assert!(tree.ignored().contains(Path::new(".vimrc.bak")));

        Ok(())
    }

    #[test]
    fn walk_rejects_duplicate_targets() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        populate(root.path(), &[("dot_file", "a"), ("create_dot_file", "b")])?;

        let result = SourceTree::walk(root.path());
        match result {
            Err(SourceWalkError::Duplicate(err)) => {
                assert_eq!(err.target, PathBuf::from(".file"));
                assert_eq!(err.first, PathBuf::from("create_dot_file"));
                assert_eq!(err.second, PathBuf::from("dot_file"));
            }
            other => panic!("expected duplicate target error, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn walk_rejects_contradictory_attributes() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("remove_exact_dot_dir"))?;

        let result = SourceTree::walk(root.path());
        assert!(matches!(result, Err(SourceWalkError::Attribute { .. })));

        Ok(())
    }

    #[test]
    fn walk_fails_on_missing_root() {
        let result = SourceTree::walk("/this/path/does/not/exist/at/all");
        assert!(matches!(result, Err(SourceWalkError::ReadDir { .. })));
    }
}
