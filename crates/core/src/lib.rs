//! Migration rebase core library.
//!
//! Finds migration chains whose chain pointer was left conflicted by a merge
//! or rebase, and linearises them: the *ours* leaf keeps its number, the
//! *theirs* leaf is renumbered after it and re-parented onto it, and the
//! pointer is rewritten to the new leaf. Chain files are parsed structurally
//! and never executed.

pub mod chain;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod models;
pub mod report;
pub mod rewriter;
pub mod scanner;

// Re-exports for convenience.
pub use config::{EngineConfig, OutputFormat, ScanMode};
pub use engine::{apply, preview, Preview, RebaseEngine, ShutdownFlag, Target};
pub use errors::{CoreError, EngineError};
pub use models::RunMode;
pub use report::{Report, UnitStatus};
