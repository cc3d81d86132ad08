//! Domain model types shared by the parser, graph builder, resolver and
//! report.
//!
//! A [`Unit`] is one migration chain (one application's `migrations/`
//! directory). It owns its [`ChainFile`]s and the parsed [`ChainPointer`];
//! once built it is never mutated. A fix produces a [`RebasePlan`] instead,
//! and a re-scan produces a fresh `Unit`.
//!
//! [`RebasePlan`]: crate::conflict::RebasePlan

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chain::pointer::ChainPointer;

// ---------------------------------------------------------------------------
// Run mode
// ---------------------------------------------------------------------------

/// Whether a run only computes plans or also writes them to disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Compute plans, touch nothing.
    Preview,
    /// Compute plans and apply them.
    Apply,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preview => write!(f, "preview"),
            Self::Apply => write!(f, "apply"),
        }
    }
}

// ---------------------------------------------------------------------------
// Migration names
// ---------------------------------------------------------------------------

/// A validated migration name such as `0002_add_field`.
///
/// The digit prefix is the sequence number. The prefix width is kept so a
/// renumbered name is padded the same way as the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MigrationName {
    raw: String,
    number: u32,
    width: usize,
}

impl MigrationName {
    /// Parse a migration name (file stem). Returns `None` when the name does
    /// not follow the `<digits>_<identifier>` convention.
    pub fn parse(raw: &str) -> Option<Self> {
        let (digits, rest) = raw.split_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if rest.is_empty() || !rest.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return None;
        }
        let number = digits.parse::<u32>().ok()?;
        Some(Self {
            raw: raw.to_string(),
            number,
            width: digits.len(),
        })
    }

    /// Parse a chain file name (`0002_add_field.py`) for the given extension.
    pub fn from_file_name(file_name: &str, extension: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
        Self::parse(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The sequence number encoded in the prefix.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Everything after the first underscore.
    pub fn suffix(&self) -> &str {
        &self.raw[self.width + 1..]
    }

    /// The same name under a different sequence number, padded to the
    /// original prefix width.
    pub fn renumbered(&self, number: u32) -> Self {
        let raw = format!("{:0width$}_{}", number, self.suffix(), width = self.width);
        let width = raw.find('_').unwrap_or(self.width);
        Self { raw, number, width }
    }

    /// File name of this migration for the given extension.
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.raw, extension)
    }
}

impl fmt::Display for MigrationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<MigrationName> for String {
    fn from(name: MigrationName) -> Self {
        name.raw
    }
}

impl TryFrom<String> for MigrationName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid migration name: {value}"))
    }
}

// ---------------------------------------------------------------------------
// Dependency declarations
// ---------------------------------------------------------------------------

/// A byte range inside a chain file's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// A directed `(unit, migration)` reference from one chain file to another,
/// possibly in a different unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub unit: String,
    pub migration: String,
}

impl DependencyEdge {
    pub fn new(unit: impl Into<String>, migration: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            migration: migration.into(),
        }
    }
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "('{}', '{}')", self.unit, self.migration)
    }
}

/// One element of a `dependencies = [...]` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyEntry {
    /// A `('unit', 'migration')` tuple. `name_span` covers the characters
    /// between the quotes of the migration literal.
    Edge {
        edge: DependencyEdge,
        name_span: Span,
    },
    /// Anything else, e.g. `migrations.swappable_dependency(...)`. Kept
    /// verbatim and never treated as an edge.
    Opaque(String),
}

/// The parsed dependency declaration of a chain file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyList {
    /// Span from the `dependencies` keyword to the closing bracket. `None`
    /// when the migration declares no dependencies at all.
    pub region: Option<Span>,
    pub entries: Vec<DependencyEntry>,
}

impl DependencyList {
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.entries.iter().filter_map(|entry| match entry {
            DependencyEntry::Edge { edge, .. } => Some(edge),
            DependencyEntry::Opaque(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Chain files and units
// ---------------------------------------------------------------------------

/// One migration source file.
#[derive(Debug, Clone)]
pub struct ChainFile {
    pub path: PathBuf,
    pub name: MigrationName,
    pub dependencies: DependencyList,
    /// Full source text, kept byte-for-byte for rewriting.
    pub payload: String,
}

impl ChainFile {
    pub fn number(&self) -> u32 {
        self.name.number()
    }

    /// Edges pointing into the given unit.
    pub fn local_edges<'a>(&'a self, unit: &'a str) -> impl Iterator<Item = &'a DependencyEdge> {
        self.dependencies.edges().filter(move |e| e.unit == unit)
    }

    /// Edges pointing into other units.
    pub fn foreign_edges<'a>(
        &'a self,
        unit: &'a str,
    ) -> impl Iterator<Item = &'a DependencyEdge> {
        self.dependencies.edges().filter(move |e| e.unit != unit)
    }
}

/// One migration chain.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Application label, e.g. `blog`.
    pub name: String,
    /// The chain directory (usually `<app>/migrations`).
    pub root: PathBuf,
    /// Chain files sorted by name.
    pub files: Vec<ChainFile>,
    pub pointer_path: PathBuf,
    /// Raw pointer file content.
    pub pointer_raw: String,
    pub pointer: ChainPointer,
}

impl Unit {
    /// Look up a chain file by migration name.
    pub fn file(&self, name: &str) -> Option<&ChainFile> {
        self.files
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.files[idx])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.files
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A reference from a file in one unit to a migration in another unit,
/// collected so renamed targets can be flagged after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub from_unit: String,
    pub from_file: String,
    pub target: DependencyEdge,
}
