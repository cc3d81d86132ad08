//! Applies a [`RebasePlan`] to disk.
//!
//! Steps run in a fixed order: dependency rewrite of *theirs*, rename of
//! *theirs*, pointer overwrite. Each performed step is journaled; when a later
//! step fails the journal is undone in reverse order. The undo is best-effort:
//! a process crash between steps, or a second failure during the undo, leaves
//! the unit half-applied. Apply mode is meant to run once over a clean or
//! backed-up working tree.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::conflict::RebasePlan;
use crate::errors::RewriteError;
use crate::models::RunMode;

/// A performed step and what is needed to undo it.
#[derive(Debug)]
enum Step {
    Content { path: PathBuf, original: String },
    Rename { from: PathBuf, to: PathBuf },
    Pointer { path: PathBuf, original: String },
}

impl Step {
    /// The undo action, for logs and error details.
    fn describe(&self) -> String {
        match self {
            Self::Content { path, .. } | Self::Pointer { path, .. } => {
                format!("restore {}", path.display())
            }
            Self::Rename { from, to } => {
                format!("rename {} back to {}", to.display(), from.display())
            }
        }
    }
}

/// Stateless plan executor.
pub struct Rewriter;

impl Rewriter {
    /// Execute `plan`. Returns whether anything was written; preview mode
    /// never writes.
    pub fn execute(plan: &RebasePlan, mode: RunMode) -> Result<bool, RewriteError> {
        if mode == RunMode::Preview {
            debug!(unit = %plan.unit, "preview: plan not applied");
            return Ok(false);
        }

        let mut journal = Vec::new();
        match Self::apply(plan, &mut journal) {
            Ok(()) => {
                info!(unit = %plan.unit, steps = journal.len(), "rebase plan applied");
                Ok(true)
            }
            Err(cause) => {
                warn!(unit = %plan.unit, error = %cause, steps = journal.len(), "apply failed, reverting");
                let leftovers = Self::rollback(journal);
                if leftovers.is_empty() {
                    Err(cause)
                } else {
                    Err(RewriteError::PartiallyReverted {
                        cause: Box::new(cause),
                        leftovers,
                    })
                }
            }
        }
    }

    fn apply(plan: &RebasePlan, journal: &mut Vec<Step>) -> Result<(), RewriteError> {
        for rewrite in &plan.rewrites {
            let original = read(&rewrite.file)?;
            let updated = rewrite
                .render(&original)
                .map_err(|detail| RewriteError::StaleSource {
                    path: rewrite.file.display().to_string(),
                    detail,
                })?;
            if updated != original {
                write(&rewrite.file, &updated)?;
                debug!(file = %rewrite.file.display(), "dependency declaration rewritten");
                journal.push(Step::Content {
                    path: rewrite.file.clone(),
                    original,
                });
            }
        }

        for rename in &plan.renames {
            if rename.to.symlink_metadata().is_ok() {
                return Err(RewriteError::DestinationExists(
                    rename.to.display().to_string(),
                ));
            }
            std::fs::rename(&rename.from, &rename.to)
                .map_err(|e| RewriteError::io("rename", &rename.from, e))?;
            debug!(from = %rename.from.display(), to = %rename.to.display(), "chain file renamed");
            journal.push(Step::Rename {
                from: rename.from.clone(),
                to: rename.to.clone(),
            });
        }

        let current = read(&plan.pointer.path)?;
        if current != plan.pointer.old {
            return Err(RewriteError::StaleSource {
                path: plan.pointer.path.display().to_string(),
                detail: "chain pointer changed since it was read".into(),
            });
        }
        write(&plan.pointer.path, &plan.pointer.new)?;
        journal.push(Step::Pointer {
            path: plan.pointer.path.clone(),
            original: current,
        });
        Ok(())
    }

    /// Undo `journal` newest first. Returns a description of every step that
    /// could not be undone.
    fn rollback(journal: Vec<Step>) -> Vec<String> {
        let mut leftovers = Vec::new();
        for step in journal.into_iter().rev() {
            let result = match &step {
                Step::Content { path, original } | Step::Pointer { path, original } => {
                    std::fs::write(path, original)
                }
                Step::Rename { from, to } => std::fs::rename(to, from),
            };
            match result {
                Ok(()) => debug!(step = %step.describe(), "reverted"),
                Err(e) => {
                    warn!(step = %step.describe(), error = %e, "revert failed");
                    leftovers.push(format!("{}: {e}", step.describe()));
                }
            }
        }
        leftovers
    }
}

fn read(path: &Path) -> Result<String, RewriteError> {
    std::fs::read_to_string(path).map_err(|e| RewriteError::io("read", path, e))
}

fn write(path: &Path, content: &str) -> Result<(), RewriteError> {
    std::fs::write(path, content).map_err(|e| RewriteError::io("write", path, e))
}
