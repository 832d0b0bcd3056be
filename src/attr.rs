// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source name attribute codec.
//!
//! Every entry in the source directory carries its attributes in its own
//! name. The name `private_dot_ssh` is a directory that should be deployed as
//! `.ssh` with group and other permission bits cleared, while
//! `run_once_before_10-install.sh` is a script that runs once before any file
//! is touched.
//!
//! # Grammar
//!
//! Attribute tokens are stripped from the front of a name in a fixed order.
//! Each token is optional, and may only appear once. Which tokens exist
//! depends on the __shape__ of the source entry, i.e., whether it is a file
//! or a directory on disk:
//!
//! | step | file                                               | directory  |
//! | ---- | -------------------------------------------------- | ---------- |
//! | 1    | `NN_`                                              | `NN_`      |
//! | 2    | `create_`, `remove_`, `symlink_`, `run_once_`, `run_` | `remove_` |
//! | 3    | `before_`, `after_` (scripts only)                 |            |
//! | 4    |                                                    | `exact_`   |
//! | 5    | `encrypted_`                                       |            |
//! | 6    | `private_`                                         | `private_` |
//! | 7    | `readonly_`                                        | `readonly_`|
//! | 8    | `empty_`                                           |            |
//! | 9    | `executable_`                                      |            |
//! | 10   | `dot_`, `literal_`                                 | `dot_`, `literal_` |
//!
//! The `dot_` token becomes a literal leading `.`, and `literal_` simply stops
//! prefix parsing. Files may also end with `.tmpl` to mark them as templates,
//! or `.literal` to keep a name that would otherwise look like a template.
//! Tokens that do not exist for a given shape are just part of the name.

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result as FmtResult},
};

const DOT_PREFIX: &str = "dot_";
const LITERAL_PREFIX: &str = "literal_";
const TEMPLATE_SUFFIX: &str = ".tmpl";
const LITERAL_SUFFIX: &str = ".literal";

/// Kind of target a source entry describes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    #[default]
    File,
    Dir,
    Symlink,
    Script,
    Remove,
}

/// Shape of a source entry on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceShape {
    File,
    Dir,
}

/// When a script runs relative to file mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptPhase {
    Before,
    After,
}

/// Numeric `NN_` prefix used to order siblings.
///
/// Remembers how many digits were written so that leading zeros survive an
/// encode after a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderPrefix {
    value: u32,
    width: usize,
}

impl OrderPrefix {
    /// Construct new order prefix written without padding.
    pub fn new(value: u32) -> Self {
        Self {
            value,
            width: value.to_string().len(),
        }
    }

    /// Construct new order prefix padded with zeros to `width` digits.
    pub fn with_width(value: u32, width: usize) -> Self {
        Self {
            value,
            width: width.max(value.to_string().len()),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

impl Ord for OrderPrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then(self.width.cmp(&other.width))
    }
}

impl PartialOrd for OrderPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for OrderPrefix {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:0width$}", self.value, width = self.width)
    }
}

/// Attributes decoded from a source entry name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub kind: EntryKind,
    pub order: Option<OrderPrefix>,
    pub phase: Option<ScriptPhase>,
    pub create: bool,
    pub exact: bool,
    pub empty: bool,
    pub executable: bool,
    pub private: bool,
    pub readonly: bool,
    pub encrypted: bool,
    pub template: bool,
    pub once: bool,
}

impl Attributes {
    /// Construct attribute set of plain file.
    pub fn file() -> Self {
        Self::default()
    }

    /// Construct attribute set of plain directory.
    pub fn dir() -> Self {
        Self {
            kind: EntryKind::Dir,
            ..Self::default()
        }
    }

    /// Permission bits of the target before any umask is applied.
    pub fn perm(&self) -> u32 {
        let mut perm = match self.kind {
            EntryKind::Dir => 0o777,
            _ if self.executable => 0o777,
            _ => 0o666,
        };

        if self.private {
            perm &= !0o077;
        }

        if self.readonly {
            perm &= !0o222;
        }

        perm
    }

    fn prefix(&self) -> String {
        let mut prefix = String::new();
        if let Some(order) = self.order {
            prefix.push_str(&format!("{order}_"));
        }

        match self.kind {
            EntryKind::Remove => prefix.push_str("remove_"),
            EntryKind::Symlink => prefix.push_str("symlink_"),
            EntryKind::Script if self.once => prefix.push_str("run_once_"),
            EntryKind::Script => prefix.push_str("run_"),
            EntryKind::File if self.create => prefix.push_str("create_"),
            _ => {}
        }

        match self.phase {
            Some(ScriptPhase::Before) => prefix.push_str("before_"),
            Some(ScriptPhase::After) => prefix.push_str("after_"),
            None => {}
        }

        let flags = [
            (self.exact, "exact_"),
            (self.encrypted, "encrypted_"),
            (self.private, "private_"),
            (self.readonly, "readonly_"),
            (self.empty, "empty_"),
            (self.executable, "executable_"),
        ];
        for (set, token) in flags {
            if set {
                prefix.push_str(token);
            }
        }

        prefix
    }

    fn shapes(&self) -> &'static [SourceShape] {
        match self.kind {
            EntryKind::Dir => &[SourceShape::Dir],
            EntryKind::Remove if !self.has_content_flags() => &[SourceShape::File, SourceShape::Dir],
            _ => &[SourceShape::File],
        }
    }

    fn has_content_flags(&self) -> bool {
        self.encrypted || self.empty || self.executable || self.template
    }

    fn validate(&self, name: &str) -> Result<()> {
        let conflict = match self.kind {
            EntryKind::Remove if self.exact => Some("exact_ and remove_ are contradictory"),
            EntryKind::Remove if self.private || self.readonly || self.has_content_flags() => {
                Some("remove_ cannot carry permission or content attributes")
            }
            EntryKind::Symlink
                if self.private
                    || self.readonly
                    || self.empty
                    || self.executable
                    || self.encrypted =>
            {
                Some("symlink_ only accepts the .tmpl suffix")
            }
            EntryKind::Script if self.private || self.readonly || self.empty || self.executable => {
                Some("run_ cannot carry permission attributes")
            }
            _ => None,
        };

        match conflict {
            Some(reason) => Err(InvalidAttributeError::new(name, reason)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Effect {
    Create,
    Kind(EntryKind),
    RunOnce,
    Phase(ScriptPhase),
    Exact,
    Encrypted,
    Private,
    ReadOnly,
    Empty,
    Executable,
    Dot,
    Literal,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    prefix: &'static str,
    effect: Effect,
}

const fn token(prefix: &'static str, effect: Effect) -> Token {
    Token { prefix, effect }
}

// INVARIANT: Steps are tried in order, and at most one token per step.
const FILE_STEPS: &[&[Token]] = &[
    &[
        token("create_", Effect::Create),
        token("remove_", Effect::Kind(EntryKind::Remove)),
        token("symlink_", Effect::Kind(EntryKind::Symlink)),
        token("run_once_", Effect::RunOnce),
        token("run_", Effect::Kind(EntryKind::Script)),
    ],
    &[
        token("before_", Effect::Phase(ScriptPhase::Before)),
        token("after_", Effect::Phase(ScriptPhase::After)),
    ],
    &[token("encrypted_", Effect::Encrypted)],
    &[token("private_", Effect::Private)],
    &[token("readonly_", Effect::ReadOnly)],
    &[token("empty_", Effect::Empty)],
    &[token("executable_", Effect::Executable)],
    &[
        token(DOT_PREFIX, Effect::Dot),
        token(LITERAL_PREFIX, Effect::Literal),
    ],
];

const DIR_STEPS: &[&[Token]] = &[
    &[token("remove_", Effect::Kind(EntryKind::Remove))],
    &[token("exact_", Effect::Exact)],
    &[token("private_", Effect::Private)],
    &[token("readonly_", Effect::ReadOnly)],
    &[
        token(DOT_PREFIX, Effect::Dot),
        token(LITERAL_PREFIX, Effect::Literal),
    ],
];

/// Decode source entry name into target name and attribute set.
///
/// # Errors
///
/// - Return [`InvalidAttributeError`] if attributes contradict each other, or
///   if nothing usable remains of the name once attributes are stripped.
pub fn decode(name: &str, shape: SourceShape) -> Result<(String, Attributes)> {
    let (steps, kind) = match shape {
        SourceShape::File => (FILE_STEPS, EntryKind::File),
        SourceShape::Dir => (DIR_STEPS, EntryKind::Dir),
    };
    let mut attrs = Attributes {
        kind,
        ..Attributes::default()
    };

    let mut rest = name;
    if let Some((order, tail)) = split_order_prefix(rest) {
        attrs.order = Some(order);
        rest = tail;
    }

    let mut target = None;
    'steps: for step in steps {
        for token in step.iter() {
            // INVARIANT: Phase tokens only mean something to scripts.
            if matches!(token.effect, Effect::Phase(_)) && attrs.kind != EntryKind::Script {
                continue;
            }

            let Some(tail) = rest.strip_prefix(token.prefix) else {
                continue;
            };

            match token.effect {
                Effect::Create => attrs.create = true,
                Effect::Kind(kind) => attrs.kind = kind,
                Effect::RunOnce => {
                    attrs.kind = EntryKind::Script;
                    attrs.once = true;
                }
                Effect::Phase(phase) => attrs.phase = Some(phase),
                Effect::Exact => attrs.exact = true,
                Effect::Encrypted => attrs.encrypted = true,
                Effect::Private => attrs.private = true,
                Effect::ReadOnly => attrs.readonly = true,
                Effect::Empty => attrs.empty = true,
                Effect::Executable => attrs.executable = true,
                Effect::Dot => {
                    target = Some(format!(".{tail}"));
                    break 'steps;
                }
                Effect::Literal => {
                    target = Some(tail.to_string());
                    break 'steps;
                }
            }

            rest = tail;
            continue 'steps;
        }
    }
    let mut target = target.unwrap_or_else(|| rest.to_string());

    if shape == SourceShape::File {
        if let Some(stripped) = target.strip_suffix(LITERAL_SUFFIX) {
            target = stripped.to_string();
        } else if let Some(stripped) = target.strip_suffix(TEMPLATE_SUFFIX) {
            attrs.template = true;
            target = stripped.to_string();
        }
    }

    if target.is_empty() || target == "." || target == ".." {
        return Err(InvalidAttributeError::new(name, "no target name left"));
    }

    if target.contains(std::path::is_separator) {
        return Err(InvalidAttributeError::new(
            name,
            "target name contains a path separator",
        ));
    }

    attrs.validate(name)?;

    Ok((target, attrs))
}

/// Encode target name and attribute set into a source entry name.
///
/// Inserts `literal_` or `.literal` escapes whenever the plain encoding would
/// decode into something else.
///
/// Removals decode from both files and directories. The encoding that fits
/// both is preferred, then one that fits a single shape while the other
/// shape rejects it, and only then one that merely fits a single shape.
pub fn encode(target_name: &str, attrs: &Attributes) -> String {
    let prefix = attrs.prefix();
    let has_suffix =
        target_name.ends_with(TEMPLATE_SUFFIX) || target_name.ends_with(LITERAL_SUFFIX);
    let suffixes: &[&str] = match attrs.kind {
        _ if attrs.template => &[TEMPLATE_SUFFIX],
        _ if !has_suffix => &[""],
        EntryKind::Dir => &[""],
        EntryKind::Remove => &["", LITERAL_SUFFIX],
        _ => &[LITERAL_SUFFIX],
    };

    let mut bodies = Vec::with_capacity(2);
    match target_name.strip_prefix('.') {
        Some(rest) => bodies.push(format!("{DOT_PREFIX}{rest}")),
        None => bodies.push(target_name.to_string()),
    }
    bodies.push(format!("{LITERAL_PREFIX}{target_name}"));

    let candidates = bodies
        .iter()
        .flat_map(|body| { let prefix = &prefix; suffixes.iter().map(move |suffix| format!("{prefix}{body}{suffix}")) })
        .collect::<Vec<_>>();

    let expect = (target_name.to_string(), attrs.clone());
    let decodings = |encoded: &str| {
        attrs
            .shapes()
            .iter()
            .map(|shape| decode(encoded, *shape).ok())
            .collect::<Vec<_>>()
    };
    let fits = |decoded: &Option<(String, Attributes)>| decoded.as_ref() == Some(&expect);

    candidates
        .iter()
        .find(|encoded| decodings(encoded).iter().all(fits))
        .or_else(|| {
            candidates.iter().find(|encoded| {
                let decoded = decodings(encoded);
                decoded.iter().any(fits)
                    && decoded.iter().all(|result| result.is_none() || fits(result))
            })
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|encoded| decodings(encoded).iter().any(fits))
        })
        .cloned()
        .unwrap_or_else(|| format!("{prefix}{LITERAL_PREFIX}{target_name}{}", suffixes[0]))
}

fn split_order_prefix(name: &str) -> Option<(OrderPrefix, &str)> {
    let digits = name.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }

    let tail = name[digits..].strip_prefix('_')?;
    let value = name[..digits].parse::<u32>().ok()?;

    Some((OrderPrefix::with_width(value, digits), tail))
}

/// Source entry name carries contradictory or unusable attributes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid attributes in source name {name:?}: {reason}")]
pub struct InvalidAttributeError {
    pub name: String,
    pub reason: &'static str,
}

impl InvalidAttributeError {
    fn new(name: impl Into<String>, reason: &'static str) -> Self {
        Self {
            name: name.into(),
            reason,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = InvalidAttributeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn attrs(edit: impl FnOnce(&mut Attributes)) -> Attributes {
        let mut attrs = Attributes::default();
        edit(&mut attrs);
        attrs
    }

    #[test_case("dot_file", ".file", Attributes::file(); "dot prefix")]
    #[test_case("create_dot_create", ".create", attrs(|a| a.create = true); "create")]
    #[test_case("empty_dot_empty", ".empty", attrs(|a| a.empty = true); "empty")]
    #[test_case(
        "executable_dot_executable",
        ".executable",
        attrs(|a| a.executable = true);
        "executable"
    )]
    #[test_case("private_dot_private", ".private", attrs(|a| a.private = true); "private")]
    #[test_case(
        "symlink_dot_symlink",
        ".symlink",
        attrs(|a| a.kind = EntryKind::Symlink);
        "symlink"
    )]
    #[test_case("dot_template.tmpl", ".template", attrs(|a| a.template = true); "template")]
    #[test_case("remove_dot_old", ".old", attrs(|a| a.kind = EntryKind::Remove); "remove")]
    #[test_case(
        "run_once_before_10-install.sh",
        "10-install.sh",
        attrs(|a| {
            a.kind = EntryKind::Script;
            a.once = true;
            a.phase = Some(ScriptPhase::Before);
        });
        "run once before"
    )]
    #[test_case(
        "05_run_after_setup.sh.tmpl",
        "setup.sh",
        attrs(|a| {
            a.kind = EntryKind::Script;
            a.order = Some(OrderPrefix::with_width(5, 2));
            a.phase = Some(ScriptPhase::After);
            a.template = true;
        });
        "ordered script"
    )]
    #[test_case(
        "encrypted_private_readonly_dot_netrc",
        ".netrc",
        attrs(|a| {
            a.encrypted = true;
            a.private = true;
            a.readonly = true;
        });
        "stacked flags"
    )]
    #[test_case("dot_private_file", ".private_file", Attributes::file(); "dot stops parsing")]
    #[test_case("literal_dot_file", "dot_file", Attributes::file(); "literal prefix")]
    #[test_case("exact_file", "exact_file", Attributes::file(); "dir token on file")]
    #[test_case("after_dark", "after_dark", Attributes::file(); "phase token without run")]
    #[test_case("notes.tmpl.literal", "notes.tmpl", Attributes::file(); "literal suffix")]
    #[test]
    fn decode_file_names(name: &str, target: &str, expect: Attributes) -> anyhow::Result<()> {
        let result = decode(name, SourceShape::File)?;
        assert_eq!(result, (target.to_string(), expect));
        Ok(())
    }

    #[test_case("dot_dir", ".dir", Attributes::dir(); "dot prefix")]
    #[test_case(
        "exact_private_dot_ssh",
        ".ssh",
        attrs(|a| {
            a.kind = EntryKind::Dir;
            a.exact = true;
            a.private = true;
        });
        "exact private"
    )]
    #[test_case("remove_dot_cache", ".cache", attrs(|a| a.kind = EntryKind::Remove); "remove")]
    #[test_case("empty_dir", "empty_dir", Attributes::dir(); "file token on dir")]
    #[test_case("subdir.tmpl", "subdir.tmpl", Attributes::dir(); "no suffixes on dir")]
    #[test]
    fn decode_dir_names(name: &str, target: &str, expect: Attributes) -> anyhow::Result<()> {
        let result = decode(name, SourceShape::Dir)?;
        assert_eq!(result, (target.to_string(), expect));
        Ok(())
    }

    #[test_case("remove_exact_dot_dir", SourceShape::Dir; "exact with remove")]
    #[test_case("remove_private_dot_file", SourceShape::File; "remove with private")]
    #[test_case("remove_dot_file.tmpl", SourceShape::File; "remove with template")]
    #[test_case("symlink_executable_dot_link", SourceShape::File; "symlink with executable")]
    #[test_case("run_private_script.sh", SourceShape::File; "script with private")]
    #[test_case("private_", SourceShape::File; "nothing left")]
    #[test_case("dot_", SourceShape::Dir; "only a dot")]
    #[test_case("literal_.tmpl", SourceShape::File; "template without name")]
    #[test]
    fn decode_rejects_invalid_names(name: &str, shape: SourceShape) {
        let result = decode(name, shape);
        assert!(result.is_err(), "{name:?} decoded into {result:?}");
    }

    #[test]
    fn decode_order_prefix() -> anyhow::Result<()> {
        let (target, attrs) = decode("007_dot_bond", SourceShape::File)?;
        assert_eq!(target, ".bond");
        assert_eq!(attrs.order.map(|order| order.value()), Some(7));

        // Digits without an underscore belong to the name.
        let (target, attrs) = decode("2fa-codes", SourceShape::File)?;
        assert_eq!(target, "2fa-codes");
        assert_eq!(attrs.order, None);

        Ok(())
    }

    #[test_case("dot_file", SourceShape::File; "plain file")]
    #[test_case("create_private_dot_create", SourceShape::File; "create private")]
    #[test_case("run_once_before_install.sh.tmpl", SourceShape::File; "once script")]
    #[test_case("10_run_after_finish.sh", SourceShape::File; "ordered script")]
    #[test_case("symlink_dot_link.tmpl", SourceShape::File; "symlink template")]
    #[test_case("encrypted_private_readonly_empty_executable_dot_x", SourceShape::File; "all flags")]
    #[test_case("remove_dot_stale", SourceShape::File; "remove file")]
    #[test_case("remove_dot_stale", SourceShape::Dir; "remove dir")]
    #[test_case("exact_private_readonly_dot_dir", SourceShape::Dir; "exact dir")]
    #[test_case("literal_dot_file", SourceShape::File; "escaped token")]
    #[test_case("notes.tmpl.literal", SourceShape::File; "escaped suffix")]
    #[test_case("literal_12_monkeys", SourceShape::File; "escaped order prefix")]
    #[test_case("subdir.tmpl", SourceShape::Dir; "dir with template suffix")]
    #[test_case("subdir.literal", SourceShape::Dir; "dir with literal suffix")]
    #[test_case("remove_x.literal", SourceShape::Dir; "removed dir with literal suffix")]
    #[test_case("remove_foo.tmpl", SourceShape::Dir; "removed dir with template suffix")]
    #[test]
    fn canonical_names_round_trip(name: &str, shape: SourceShape) -> anyhow::Result<()> {
        let (target, attrs) = decode(name, shape)?;
        assert_eq!(encode(&target, &attrs), name);
        Ok(())
    }

    #[test]
    fn encode_escapes_ambiguous_names() -> anyhow::Result<()> {
        let cases = [
            ("private_key", Attributes::file()),
            ("12_monkeys", Attributes::file()),
            ("config.tmpl", Attributes::file()),
            ("exact_match", Attributes::dir()),
            ("run_me.sh", Attributes::file()),
            (
                "exact_stuff",
                Attributes {
                    kind: EntryKind::Remove,
                    ..Attributes::default()
                },
            ),
        ];

        for (target, attrs) in cases {
            let encoded = encode(target, &attrs);
            for shape in attrs.shapes() {
                assert_eq!(decode(&encoded, *shape)?, (target.to_string(), attrs.clone()));
            }
        }

        Ok(())
    }

    #[test]
    fn perm_derivation() {
        assert_eq!(Attributes::file().perm(), 0o666);
        assert_eq!(Attributes::dir().perm(), 0o777);
        assert_eq!(attrs(|a| a.executable = true).perm(), 0o777);
        assert_eq!(attrs(|a| a.private = true).perm(), 0o600);
        assert_eq!(
            attrs(|a| {
                a.private = true;
                a.readonly = true;
            })
            .perm(),
            0o400
        );
    }
}
