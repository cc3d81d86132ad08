//! Chain-pointer parsing.
//!
//! The pointer file names the current leaf of a chain. After a conflicting
//! merge it carries the standard conflict delimiters instead:
//!
//! ```text
//! <<<<<<< HEAD
//! 0002_head
//! ||||||| base        (optional, diff3 style)
//! 0001_initial
//! =======
//! 0002_feature
//! >>>>>>> feature
//! ```

use std::fmt;

const OURS_MARKER: &str = "<<<<<<<";
const BASE_MARKER: &str = "|||||||";
const SPLIT_MARKER: &str = "=======";
const THEIRS_MARKER: &str = ">>>>>>>";

/// Parsed chain pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainPointer {
    /// A single leaf name.
    Resolved(String),
    /// An unresolved conflict region.
    Conflicted(PointerConflict),
}

/// The two sides of a pointer conflict, in the order they appear in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerConflict {
    pub ours_label: String,
    pub ours: String,
    pub theirs_label: String,
    pub theirs: String,
    /// The conflict region exactly as it appears in the file.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Ours,
    Base,
    Theirs,
    Closed,
}

impl ChainPointer {
    /// Parse pointer file content. The error is a human-readable detail; the
    /// caller attaches the path.
    pub fn parse(content: &str) -> Result<Self, String> {
        if !content.lines().any(|l| l.trim_start().starts_with(OURS_MARKER)) {
            return Self::parse_resolved(content);
        }

        let mut section = Section::Outside;
        let mut ours_label = String::new();
        let mut theirs_label = String::new();
        let mut ours = Vec::new();
        let mut theirs = Vec::new();
        let mut raw = String::new();

        for (idx, line) in content.lines().enumerate() {
            let lineno = idx + 1;
            let trimmed = line.trim();

            if let Some(label) = trimmed.strip_prefix(OURS_MARKER) {
                match section {
                    Section::Outside => {
                        section = Section::Ours;
                        ours_label = label.trim().to_string();
                    }
                    Section::Closed => {
                        return Err(format!("second conflict region at line {lineno}"));
                    }
                    _ => return Err(format!("nested conflict marker at line {lineno}")),
                }
            } else if trimmed.starts_with(BASE_MARKER) {
                if section != Section::Ours {
                    return Err(format!("unexpected base marker at line {lineno}"));
                }
                section = Section::Base;
            } else if trimmed == SPLIT_MARKER {
                if !matches!(section, Section::Ours | Section::Base) {
                    return Err(format!("unexpected separator at line {lineno}"));
                }
                section = Section::Theirs;
            } else if let Some(label) = trimmed.strip_prefix(THEIRS_MARKER) {
                if section != Section::Theirs {
                    return Err(format!("unexpected closing marker at line {lineno}"));
                }
                theirs_label = label.trim().to_string();
                section = Section::Closed;
                raw.push_str(line);
                raw.push('\n');
                continue;
            } else if is_content(trimmed) {
                match section {
                    Section::Ours => ours.push(trimmed.to_string()),
                    Section::Theirs => theirs.push(trimmed.to_string()),
                    Section::Base => {}
                    Section::Outside | Section::Closed => {
                        return Err(format!(
                            "unexpected content '{trimmed}' outside the conflict region"
                        ));
                    }
                }
            }

            if !matches!(section, Section::Outside | Section::Closed) {
                raw.push_str(line);
                raw.push('\n');
            }
        }

        if section != Section::Closed {
            return Err("unterminated conflict region".to_string());
        }

        let ours = single_name(ours, "ours")?;
        let theirs = single_name(theirs, "theirs")?;
        Ok(Self::Conflicted(PointerConflict {
            ours_label,
            ours,
            theirs_label,
            theirs,
            raw,
        }))
    }

    fn parse_resolved(content: &str) -> Result<Self, String> {
        let names: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| is_content(l))
            .collect();
        match names.as_slice() {
            [] => Err("pointer is empty".to_string()),
            [name] => {
                if name.contains(SPLIT_MARKER) || name.starts_with(THEIRS_MARKER) {
                    return Err("conflict delimiter without an opening marker".to_string());
                }
                Ok(Self::Resolved(name.to_string()))
            }
            more => Err(format!("expected one name, found {}", more.len())),
        }
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self, Self::Conflicted(_))
    }

    /// Content of a pointer file naming `name` as the leaf.
    pub fn render_resolved(name: &str) -> String {
        format!("{name}\n")
    }
}

impl fmt::Display for ChainPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(name) => f.write_str(name),
            Self::Conflicted(c) => write!(f, "conflict({} | {})", c.ours, c.theirs),
        }
    }
}

fn is_content(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#')
}

fn single_name(names: Vec<String>, side: &str) -> Result<String, String> {
    let count = names.len();
    let mut iter = names.into_iter();
    match (iter.next(), count) {
        (Some(name), 1) => Ok(name),
        (None, _) => Err(format!("{side} side of the conflict is empty")),
        _ => Err(format!("{side} side of the conflict holds {count} names")),
    }
}
