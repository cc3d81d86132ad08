//! Conflict detection logic.
//!
//! Combines a unit's graph topology with its chain pointer. A divergence is a
//! conflict only when the pointer itself carries an unresolved conflict
//! region naming exactly the two divergent leaves; *ours* and *theirs* are
//! taken from the order of the names in that region and nothing else.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::graph::Topology;
use crate::chain::pointer::ChainPointer;
use crate::errors::UnitError;
use crate::models::{MigrationName, Unit};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A confirmed divergence in one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictCase {
    pub unit: String,
    /// The file both leaves depend on.
    pub ancestor: MigrationName,
    /// First name in the pointer conflict region.
    pub ours: MigrationName,
    /// Second name in the pointer conflict region.
    pub theirs: MigrationName,
    pub ours_label: String,
    pub theirs_label: String,
    /// The conflict region as found in the pointer file.
    pub pointer_raw: String,
}

/// Outcome of detection for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Single chain whose pointer names its leaf.
    Clean { leaf: MigrationName },
    Conflict(ConflictCase),
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless detector matching a unit's pointer against its topology.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Decide whether `unit` (already classified as `topology`) is clean,
    /// conflicted or malformed.
    pub fn detect(unit: &Unit, topology: &Topology) -> Result<Detection, UnitError> {
        let name_of = |idx: usize| unit.files[idx].name.clone();

        match (topology, &unit.pointer) {
            (Topology::Linear { leaf }, ChainPointer::Resolved(current)) => {
                let leaf = name_of(*leaf);
                if leaf.as_str() != current {
                    return Err(UnitError::malformed(
                        &unit.name,
                        format!("chain pointer names '{current}' but the leaf is '{leaf}'"),
                    ));
                }
                debug!(unit = %unit.name, %leaf, "unit is clean");
                Ok(Detection::Clean { leaf })
            }
            (Topology::Linear { leaf }, ChainPointer::Conflicted(conflict)) => {
                Err(UnitError::malformed(
                    &unit.name,
                    format!(
                        "chain pointer conflict ({} vs {}) but the chain has a single leaf '{}'",
                        conflict.ours,
                        conflict.theirs,
                        name_of(*leaf)
                    ),
                ))
            }
            (Topology::Divergent { leaves, .. }, ChainPointer::Resolved(current)) => {
                Err(UnitError::malformed(
                    &unit.name,
                    format!(
                        "divergent leaves {} and {} without a chain pointer conflict (pointer names '{current}')",
                        name_of(leaves[0]),
                        name_of(leaves[1])
                    ),
                ))
            }
            (Topology::Divergent { ancestor, leaves }, ChainPointer::Conflicted(conflict)) => {
                let ours = Self::match_leaf(unit, leaves, &conflict.ours)?;
                let theirs = Self::match_leaf(unit, leaves, &conflict.theirs)?;
                if ours == theirs {
                    return Err(UnitError::malformed(
                        &unit.name,
                        format!("both sides of the chain pointer conflict name '{ours}'"),
                    ));
                }

                info!(
                    unit = %unit.name,
                    %ours,
                    %theirs,
                    ancestor = %name_of(*ancestor),
                    "conflict detected"
                );

                Ok(Detection::Conflict(ConflictCase {
                    unit: unit.name.clone(),
                    ancestor: name_of(*ancestor),
                    ours,
                    theirs,
                    ours_label: conflict.ours_label.clone(),
                    theirs_label: conflict.theirs_label.clone(),
                    pointer_raw: conflict.raw.clone(),
                }))
            }
        }
    }

    /// The divergent leaf whose name equals `name` exactly.
    fn match_leaf(unit: &Unit, leaves: &[usize; 2], name: &str) -> Result<MigrationName, UnitError> {
        leaves
            .iter()
            .map(|&idx| &unit.files[idx].name)
            .find(|leaf| leaf.as_str() == name)
            .cloned()
            .ok_or_else(|| {
                UnitError::malformed(
                    &unit.name,
                    format!(
                        "chain pointer names '{name}', which is not one of the divergent leaves ({}, {})",
                        unit.files[leaves[0]].name,
                        unit.files[leaves[1]].name
                    ),
                )
            })
    }
}
