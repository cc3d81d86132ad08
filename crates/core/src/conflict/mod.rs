//! Conflict detection and rebase planning.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- matching a unit's chain-pointer conflict against the
//!    two divergent leaves of its graph.
//! 2. **Resolution** -- computing the [`RebasePlan`] that re-stacks *theirs*
//!    on top of *ours*.

pub mod detector;
pub mod resolver;

pub use detector::{ConflictCase, ConflictDetector, Detection};
pub use resolver::{PointerUpdate, RebasePlan, RenameOp, Replacement, Resolver, RewriteOp};
