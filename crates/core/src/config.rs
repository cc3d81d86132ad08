//! TOML-based configuration for the rebase engine.
//!
//! Every field has a default, so running without a config file behaves like
//! an empty one. The CLI loads a file when `--config` is given, applies
//! environment overrides, then lets its own flags win.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Environment variable overriding `run.workers`.
pub const WORKERS_ENV: &str = "REBASE_MIGRATIONS_WORKERS";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tree discovery settings.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Naming conventions of a unit directory.
    #[serde(default)]
    pub layout: LayoutConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub run: RunConfig,

    /// Report rendering settings.
    #[serde(default)]
    pub output: OutputConfig,
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// How thoroughly the scanner walks the tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Skip well-known build/cache/vendor directories and only accept chain
    /// directories with the conventional name.
    #[default]
    Conventional,
    /// Walk every directory and accept any directory holding a pointer file.
    Exhaustive,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conventional => write!(f, "conventional"),
            Self::Exhaustive => write!(f, "exhaustive"),
        }
    }
}

/// Scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub mode: ScanMode,

    /// Glob patterns matched against directory names. Matching directories
    /// are not descended into in conventional mode.
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,

    /// Follow symbolic links while walking. Loops are reported, not followed.
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_skip_dirs() -> Vec<String> {
    [
        // Version control
        ".git",
        ".svn",
        ".hg",
        // Python environments and caches
        "venv",
        ".venv",
        "env",
        ".env",
        "virtualenv",
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        ".ruff_cache",
        ".tox",
        ".nox",
        "*.egg-info",
        "site-packages",
        // JavaScript
        "node_modules",
        ".npm",
        ".yarn",
        // Build output
        "build",
        "dist",
        "target",
        ".cache",
        "htmlcov",
        "_build",
        // Editors
        ".idea",
        ".vscode",
        // Static and media roots
        "static",
        "staticfiles",
        "media",
        "docs",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::default(),
            skip_dirs: default_skip_dirs(),
            follow_symlinks: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// File and directory naming conventions of a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Name of the directory holding a chain (default `migrations`).
    #[serde(default = "default_chain_dir")]
    pub chain_dir: String,

    /// Name of the chain-pointer file (default `max_migration.txt`).
    #[serde(default = "default_pointer_file")]
    pub pointer_file: String,

    /// Extension of chain files, without the dot (default `py`).
    #[serde(default = "default_chain_extension")]
    pub chain_extension: String,
}

fn default_chain_dir() -> String {
    "migrations".into()
}
fn default_pointer_file() -> String {
    "max_migration.txt".into()
}
fn default_chain_extension() -> String {
    "py".into()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            chain_dir: default_chain_dir(),
            pointer_file: default_pointer_file(),
            chain_extension: default_chain_extension(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Units processed in parallel. 0 = available hardware parallelism.
    #[serde(default)]
    pub workers: usize,

    /// Capacity of the candidate and result channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl RunConfig {
    /// The worker count to use, resolving 0 to the hardware parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Report rendering format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables.
    #[default]
    Table,
    /// Pretty-printed JSON document.
    Json,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Colour table cells by status.
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            color: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Apply overrides from the environment.
    ///
    /// An unparseable value is an error rather than silently ignored, since
    /// it usually means a benchmark is not running with the intended pool.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        match std::env::var(WORKERS_ENV) {
            Ok(val) if !val.trim().is_empty() => {
                let workers = val.trim().parse::<usize>().map_err(|e| {
                    ConfigError::InvalidValue {
                        field: WORKERS_ENV.into(),
                        detail: format!("'{val}' is not a worker count: {e}"),
                    }
                })?;
                debug!(workers, "worker count taken from environment");
                self.run.workers = workers;
            }
            Ok(_) => warn!(env_name = WORKERS_ENV, "env var is set but empty"),
            Err(_) => {}
        }
        Ok(())
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layout.chain_dir.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "layout.chain_dir".into(),
                detail: "chain directory name must not be empty".into(),
            });
        }
        if self.layout.pointer_file.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "layout.pointer_file".into(),
                detail: "pointer file name must not be empty".into(),
            });
        }
        if self.layout.pointer_file.contains(['/', '\\']) {
            return Err(ConfigError::InvalidValue {
                field: "layout.pointer_file".into(),
                detail: "pointer file must be a plain file name".into(),
            });
        }
        if self.layout.chain_extension.is_empty() || self.layout.chain_extension.starts_with('.')
        {
            return Err(ConfigError::InvalidValue {
                field: "layout.chain_extension".into(),
                detail: "extension must be non-empty and given without the leading dot".into(),
            });
        }
        if self.run.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "run.channel_capacity".into(),
                detail: "channel capacity must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, apply overrides, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}
