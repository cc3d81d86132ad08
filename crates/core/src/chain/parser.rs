//! Unit parser: reads one chain directory into a [`Unit`] without executing
//! any of its files.
//!
//! Only three things are extracted from a chain file: the sequence number and
//! name (from the file name) and the `dependencies = [...]` list inside the
//! `Migration` class. The list is tokenised by a small recursive-descent
//! cursor; the rest of the file is kept as an opaque payload.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, trace};

use crate::chain::pointer::ChainPointer;
use crate::config::LayoutConfig;
use crate::errors::ParseError;
use crate::models::{ChainFile, DependencyEdge, DependencyEntry, DependencyList, MigrationName, Span, Unit};

fn class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^class[ \t]+Migration\b[^\n]*:").expect("migration class regex")
    })
}

fn dependencies_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]+(dependencies)[ \t]*(?::[^=\n]*)?=[ \t]*")
            .expect("dependencies assignment regex")
    })
}

// ---------------------------------------------------------------------------
// Unit parser
// ---------------------------------------------------------------------------

/// Builds [`Unit`]s from chain directories.
pub struct UnitParser {
    layout: LayoutConfig,
}

impl UnitParser {
    pub fn new(layout: &LayoutConfig) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    /// The unit (application) name of a chain directory: the parent's name
    /// for a conventional `<app>/migrations` directory, otherwise the
    /// directory's own name.
    pub fn unit_name(&self, dir: &Path) -> String {
        let own = dir.file_name().and_then(|n| n.to_str());
        let name = if own == Some(self.layout.chain_dir.as_str()) {
            dir.parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
        } else {
            own
        };
        name.map(str::to_string)
            .unwrap_or_else(|| dir.display().to_string())
    }

    /// Parse the chain directory at `dir`.
    pub fn parse_unit(&self, dir: &Path) -> Result<Unit, ParseError> {
        let name = self.unit_name(dir);
        let pointer_path = dir.join(&self.layout.pointer_file);
        let pointer_raw = match std::fs::read_to_string(&pointer_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParseError::MissingPointer(pointer_path.display().to_string()));
            }
            Err(source) => {
                return Err(ParseError::Io {
                    path: pointer_path.display().to_string(),
                    source,
                })
            }
        };
        let pointer = ChainPointer::parse(&pointer_raw).map_err(|detail| ParseError::Pointer {
            path: pointer_path.display().to_string(),
            detail,
        })?;

        let mut files = Vec::new();
        for (path, migration) in self.chain_file_paths(dir)? {
            let payload = std::fs::read_to_string(&path).map_err(|source| ParseError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let file = ChainFile::from_source(path, migration, payload)?;
            trace!(
                unit = %name,
                file = %file.name,
                edges = file.dependencies.edges().count(),
                "parsed chain file"
            );
            files.push(file);
        }

        if files.is_empty() {
            return Err(ParseError::EmptyChain(dir.display().to_string()));
        }
        files.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

        debug!(unit = %name, files = files.len(), conflicted = pointer.is_conflicted(), "unit parsed");

        Ok(Unit {
            name,
            root: dir.to_path_buf(),
            files,
            pointer_path,
            pointer_raw,
            pointer,
        })
    }

    /// Regular files in `dir` following the chain naming convention.
    fn chain_file_paths(&self, dir: &Path) -> Result<Vec<(PathBuf, MigrationName)>, ParseError> {
        let io_err = |source| ParseError::Io {
            path: dir.display().to_string(),
            source,
        };
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(migration) =
                MigrationName::from_file_name(&file_name, &self.layout.chain_extension)
            else {
                continue;
            };
            // Directories and dangling links that merely look like chain files
            // are not part of the chain.
            if !path.is_file() {
                trace!(path = %path.display(), "skipping non-file chain entry");
                continue;
            }
            found.push((path, migration));
        }
        Ok(found)
    }
}

impl ChainFile {
    /// Build a chain file from its source text.
    pub fn from_source(
        path: PathBuf,
        name: MigrationName,
        payload: String,
    ) -> Result<Self, ParseError> {
        let dependencies = match extract_dependencies(&payload) {
            Ok(deps) => deps,
            Err(Extract::NoMigrationClass) => {
                return Err(ParseError::NotAMigration(path.display().to_string()))
            }
            Err(Extract::Syntax { offset, detail }) => {
                return Err(ParseError::Declaration {
                    path: path.display().to_string(),
                    offset,
                    detail,
                })
            }
        };
        Ok(Self {
            path,
            name,
            dependencies,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Declaration extraction
// ---------------------------------------------------------------------------

/// Why a dependency declaration could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    NoMigrationClass,
    Syntax { offset: usize, detail: String },
}

impl Extract {
    fn at(offset: usize, detail: impl Into<String>) -> Self {
        Self::Syntax {
            offset,
            detail: detail.into(),
        }
    }
}

/// Extract the dependency list of the first `Migration` class in `source`.
pub fn extract_dependencies(source: &str) -> Result<DependencyList, Extract> {
    let class = class_regex()
        .find(source)
        .ok_or(Extract::NoMigrationClass)?;
    let body_start = class.end();
    let body_end = class_body_end(source, body_start);
    let body = &source[..body_end];

    let Some(caps) = dependencies_regex().captures_at(body, body_start) else {
        return Ok(DependencyList::default());
    };
    let (Some(keyword), Some(whole)) = (caps.get(1), caps.get(0)) else {
        return Ok(DependencyList::default());
    };

    let mut cursor = Cursor::new(source, whole.end());
    let close = match cursor.peek() {
        Some(b'[') => b']',
        Some(b'(') => b')',
        _ => {
            return Err(Extract::at(
                whole.end(),
                "dependencies is not a literal list",
            ))
        }
    };
    cursor.bump();
    let entries = cursor.parse_entries(close)?;

    Ok(DependencyList {
        region: Some(Span::new(keyword.start(), cursor.pos)),
        entries,
    })
}

/// Offset of the first top-level statement after the class header, or the
/// end of the source.
fn class_body_end(source: &str, body_start: usize) -> usize {
    let mut offset = body_start;
    for line in source[body_start..].split_inclusive('\n') {
        if offset > body_start {
            let first = line.bytes().next();
            let is_top_level = matches!(first, Some(b) if !b.is_ascii_whitespace() && b != b'#');
            if is_top_level {
                return offset;
            }
        }
        offset += line.len();
    }
    source.len()
}

/// Byte cursor over the source text. Every position it reports is an
/// absolute offset into the file.
struct Cursor<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str, pos: usize) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    /// Skip whitespace, line continuations and comments.
    fn skip_trivia(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' => self.bump(),
                b'\\' if matches!(self.peek_at(1), Some(b'\n' | b'\r')) => self.bump(),
                b'#' => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Parse list elements up to and including `close`.
    fn parse_entries(&mut self, close: u8) -> Result<Vec<DependencyEntry>, Extract> {
        let mut entries = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => return Err(Extract::at(self.pos, "unterminated dependency list")),
                Some(b) if b == close => {
                    self.bump();
                    return Ok(entries);
                }
                Some(_) => {}
            }

            entries.push(self.parse_entry(close)?);

            self.skip_trivia();
            match self.peek() {
                Some(b',') => self.bump(),
                Some(b) if b == close => {}
                None => return Err(Extract::at(self.pos, "unterminated dependency list")),
                Some(b) => {
                    return Err(Extract::at(
                        self.pos,
                        format!("unexpected '{}' after list element", b as char),
                    ))
                }
            }
        }
    }

    fn parse_entry(&mut self, close: u8) -> Result<DependencyEntry, Extract> {
        let start = self.pos;
        if self.peek() == Some(b'(') && self.tuple_starts_with_string() {
            let entry = self.parse_edge()?;
            self.skip_trivia();
            if !matches!(self.peek(), Some(b',')) && self.peek() != Some(close) {
                return Err(Extract::at(
                    self.pos,
                    "dependency tuple followed by an expression",
                ));
            }
            return Ok(entry);
        }

        self.skip_expression(close)?;
        let text = self.src[start..self.pos].trim_end().to_string();
        Ok(DependencyEntry::Opaque(text))
    }

    /// Whether the group opening at the cursor starts with a string literal,
    /// i.e. is meant to be a `('unit', 'migration')` tuple.
    fn tuple_starts_with_string(&self) -> bool {
        let mut probe = Cursor::new(self.src, self.pos + 1);
        probe.skip_trivia();
        probe.string_prefix_len().is_some()
    }

    /// `( 'unit' , 'migration' [,] )`
    fn parse_edge(&mut self) -> Result<DependencyEntry, Extract> {
        let open = self.pos;
        self.bump();
        self.skip_trivia();
        let unit = self.parse_string()?;
        self.skip_trivia();
        if self.peek() != Some(b',') {
            return Err(Extract::at(self.pos, "dependency tuple must hold two strings"));
        }
        self.bump();
        self.skip_trivia();
        if self.string_prefix_len().is_none() {
            return Err(Extract::at(self.pos, "dependency tuple must hold two strings"));
        }
        let name = self.parse_string()?;
        self.skip_trivia();
        if self.peek() == Some(b',') {
            self.bump();
            self.skip_trivia();
        }
        match self.peek() {
            Some(b')') => self.bump(),
            None => return Err(Extract::at(open, "unterminated dependency tuple")),
            Some(_) => {
                return Err(Extract::at(self.pos, "dependency tuple must hold two strings"))
            }
        }
        Ok(DependencyEntry::Edge {
            edge: DependencyEdge::new(unit.1, name.1),
            name_span: name.0,
        })
    }

    /// Length of a string prefix (`r`, `b`, `rb`, ...) if a string literal
    /// starts at the cursor.
    fn string_prefix_len(&self) -> Option<usize> {
        let mut len = 0;
        while let Some(b) = self.peek_at(len) {
            match b {
                b'r' | b'R' | b'u' | b'U' | b'b' | b'B' if len < 2 => len += 1,
                b'\'' | b'"' => return Some(len),
                _ => return None,
            }
        }
        None
    }

    /// Parse a string literal, returning the span of its contents and the
    /// contents themselves.
    fn parse_string(&mut self) -> Result<(Span, String), Extract> {
        let prefix = self
            .string_prefix_len()
            .ok_or_else(|| Extract::at(self.pos, "expected a string literal"))?;
        self.pos += prefix;
        let span = self.skip_string_body()?;
        Ok((span, span.slice(self.src).to_string()))
    }

    /// Consume a quoted string whose opening quote is at the cursor.
    fn skip_string_body(&mut self) -> Result<Span, Extract> {
        let start = self.pos;
        let quote = self
            .peek()
            .ok_or_else(|| Extract::at(start, "expected a string literal"))?;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        let delim = if triple { 3 } else { 1 };
        self.pos += delim;
        let content_start = self.pos;

        loop {
            match self.peek() {
                None => return Err(Extract::at(start, "unterminated string literal")),
                Some(b'\\') => self.pos += 2,
                Some(b'\n') if !triple => {
                    return Err(Extract::at(start, "unterminated string literal"))
                }
                Some(b) if b == quote => {
                    if !triple {
                        let span = Span::new(content_start, self.pos);
                        self.bump();
                        return Ok(span);
                    }
                    if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                        let span = Span::new(content_start, self.pos);
                        self.pos += 3;
                        return Ok(span);
                    }
                    self.bump();
                }
                Some(_) => self.bump(),
            }
        }
    }

    /// Skip an arbitrary expression up to a top-level `,` or `close`.
    fn skip_expression(&mut self, close: u8) -> Result<(), Extract> {
        let mut stack: Vec<u8> = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(Extract::at(self.pos, "unterminated dependency list"));
            };
            match b {
                b',' if stack.is_empty() => return Ok(()),
                b if b == close && stack.is_empty() => return Ok(()),
                b'(' => {
                    stack.push(b')');
                    self.bump();
                }
                b'[' => {
                    stack.push(b']');
                    self.bump();
                }
                b'{' => {
                    stack.push(b'}');
                    self.bump();
                }
                b')' | b']' | b'}' => {
                    if stack.pop() != Some(b) {
                        return Err(Extract::at(
                            self.pos,
                            format!("unbalanced '{}'", b as char),
                        ));
                    }
                    self.bump();
                }
                b'\'' | b'"' => {
                    self.skip_string_body()?;
                }
                b'#' | b' ' | b'\t' | b'\r' | b'\n' => self.skip_trivia(),
                _ => self.bump(),
            }
        }
    }
}
