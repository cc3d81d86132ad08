//! Error types for the migration rebase engine.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type. Only [`EngineError`] aborts a run; everything else is recorded
//! against the unit or directory it happened in.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Scan errors
// ---------------------------------------------------------------------------

/// Problems met while walking the project tree. Recorded per directory; the
/// scan continues past them.
#[derive(Debug, Error)]
pub enum ScanError {
    /// A directory could not be read (permissions, vanished, ...).
    #[error("cannot read '{path}': {detail}")]
    Unreadable { path: String, detail: String },

    /// Following a symlink would revisit an ancestor directory.
    #[error("symlink loop at '{path}' (points back to '{ancestor}')")]
    SymlinkLoop { path: String, ancestor: String },
}

impl ScanError {
    pub fn path(&self) -> &str {
        match self {
            Self::Unreadable { path, .. } | Self::SymlinkLoop { path, .. } => path,
        }
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        let path = err
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        match err.loop_ancestor() {
            Some(ancestor) => Self::SymlinkLoop {
                path,
                ancestor: ancestor.display().to_string(),
            },
            None => Self::Unreadable {
                path,
                detail: err
                    .io_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| err.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// Errors from reading a unit directory into a [`Unit`](crate::models::Unit).
#[derive(Debug, Error)]
pub enum ParseError {
    /// A chain file or the pointer could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The chain directory has no pointer file.
    #[error("missing chain pointer '{0}'")]
    MissingPointer(String),

    /// The file has no top-level `Migration` class.
    #[error("no Migration class found in '{0}'")]
    NotAMigration(String),

    /// The dependency declaration could not be tokenised.
    #[error("unparseable dependency declaration in '{path}' at byte {offset}: {detail}")]
    Declaration {
        path: String,
        offset: usize,
        detail: String,
    },

    /// The pointer file does not follow either the clean or the conflicted
    /// form.
    #[error("invalid chain pointer '{path}': {detail}")]
    Pointer { path: String, detail: String },

    /// The directory holds no chain files.
    #[error("no chain files in '{0}'")]
    EmptyChain(String),
}

// ---------------------------------------------------------------------------
// Unit errors
// ---------------------------------------------------------------------------

/// Per-unit failures. Recorded against the unit; the run continues.
#[derive(Debug, Error)]
pub enum UnitError {
    /// Unparseable file, unexpected topology or pointer/leaf mismatch.
    #[error("malformed unit '{unit}': {detail}")]
    Malformed { unit: String, detail: String },

    /// A valid graph with more than one divergence point.
    #[error("unsupported topology in unit '{unit}': {detail}")]
    UnsupportedTopology { unit: String, detail: String },

    /// Applying the plan failed; performed steps were reverted best-effort.
    #[error("filesystem error in unit '{unit}': {source}")]
    Filesystem {
        unit: String,
        #[source]
        source: RewriteError,
    },

    /// The worker processing the unit panicked or was aborted.
    #[error("worker for unit '{unit}' failed: {detail}")]
    Worker { unit: String, detail: String },
}

impl UnitError {
    pub fn malformed(unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            unit: unit.into(),
            detail: detail.into(),
        }
    }

    pub fn unsupported(unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnsupportedTopology {
            unit: unit.into(),
            detail: detail.into(),
        }
    }

    /// The message without the `... unit '<name>':` prefix, for reports that
    /// already show the unit name in its own column.
    pub fn detail(&self) -> String {
        match self {
            Self::Malformed { detail, .. }
            | Self::UnsupportedTopology { detail, .. }
            | Self::Worker { detail, .. } => detail.clone(),
            Self::Filesystem { source, .. } => source.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rewrite errors
// ---------------------------------------------------------------------------

/// Errors from applying a plan to disk.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// An I/O operation failed.
    #[error("{op} '{path}' failed: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The rename target is already taken.
    #[error("destination '{0}' already exists")]
    DestinationExists(String),

    /// The file changed on disk since it was parsed.
    #[error("'{path}' changed since it was read: {detail}")]
    StaleSource { path: String, detail: String },

    /// The step failed and some of the rollback failed too.
    #[error("{cause}; rollback incomplete: {}", .leftovers.join("; "))]
    PartiallyReverted {
        cause: Box<RewriteError>,
        leftovers: Vec<String>,
    },
}

impl RewriteError {
    pub fn io(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Errors that stop a run before (or instead of) producing a report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The root or unit path is missing or not a directory.
    #[error("invalid target '{path}': {detail}")]
    InvalidTarget { path: String, detail: String },

    /// The unit path has no chain directory or pointer file.
    #[error("'{0}' is not a migration unit (no chain directory with a pointer file)")]
    NotAUnit(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A background task could not be joined.
    #[error("engine task failed: {0}")]
    Task(String),

    /// The report could not be serialized.
    #[error("failed to render report: {0}")]
    Render(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = UnitError::malformed("blog", "3 divergent leaves");
        assert_eq!(err.to_string(), "malformed unit 'blog': 3 divergent leaves");
        assert_eq!(err.detail(), "3 divergent leaves");

        let err = RewriteError::DestinationExists("/tmp/0003_x.py".into());
        assert_eq!(err.to_string(), "destination '/tmp/0003_x.py' already exists");

        let err = ConfigError::InvalidValue {
            field: "layout.chain_extension".into(),
            detail: "must not start with a dot".into(),
        };
        assert!(err.to_string().contains("layout.chain_extension"));
    }

    #[test]
    fn test_partially_reverted_lists_leftovers() {
        let err = RewriteError::PartiallyReverted {
            cause: Box::new(RewriteError::DestinationExists("b".into())),
            leftovers: vec!["restore a".into(), "rename c".into()],
        };
        assert_eq!(
            err.to_string(),
            "destination 'b' already exists; rollback incomplete: restore a; rename c"
        );
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = UnitError::unsupported("shop", "nested divergence").into();
        assert!(matches!(core_err, CoreError::Unit(_)));

        let core_err: CoreError = ConfigError::FileNotFound("x.toml".into()).into();
        assert!(matches!(core_err, CoreError::Config(_)));
    }
}
