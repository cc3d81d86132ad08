//! Rebase planning.
//!
//! The [`Resolver`] turns a [`ConflictCase`] into a [`RebasePlan`]: *ours*
//! keeps its number and name, *theirs* moves to the next number after *ours*
//! and re-parents onto it, and the chain pointer names the renumbered
//! *theirs*. Planning never touches the filesystem.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::pointer::ChainPointer;
use crate::conflict::detector::ConflictCase;
use crate::errors::UnitError;
use crate::models::{DependencyEdge, DependencyEntry, MigrationName, Span, Unit};

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Rename of one chain file to a new sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameOp {
    pub from: PathBuf,
    pub to: PathBuf,
    pub old_name: MigrationName,
    pub new_name: MigrationName,
    pub old_number: u32,
    pub new_number: u32,
}

/// One literal replacement inside a file's dependency declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replacement {
    pub span: Span,
    /// Text expected at `span` when the plan is applied.
    pub original: String,
    pub text: String,
}

/// New dependency edges for one chain file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteOp {
    /// Path of the file before any rename in the same plan.
    pub file: PathBuf,
    pub migration: MigrationName,
    pub old_dependencies: Vec<DependencyEdge>,
    pub new_dependencies: Vec<DependencyEdge>,
    #[serde(skip)]
    pub replacements: Vec<Replacement>,
}

impl RewriteOp {
    /// Apply the replacements to `source`. Fails with a description of the
    /// first replacement whose expected text is no longer there.
    pub fn render(&self, source: &str) -> Result<String, String> {
        let mut ordered: Vec<&Replacement> = self.replacements.iter().collect();
        ordered.sort_by_key(|r| r.span.start);

        let mut out = String::with_capacity(source.len());
        let mut cursor = 0;
        for r in ordered {
            let found = source.get(r.span.start..r.span.end);
            if r.span.start < cursor || found != Some(r.original.as_str()) {
                return Err(format!(
                    "expected '{}' at bytes {}..{}",
                    r.original, r.span.start, r.span.end
                ));
            }
            out.push_str(&source[cursor..r.span.start]);
            out.push_str(&r.text);
            cursor = r.span.end;
        }
        out.push_str(&source[cursor..]);
        Ok(out)
    }
}

/// Replacement content for the chain pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointerUpdate {
    pub path: PathBuf,
    /// Content as read (including any conflict delimiters).
    pub old: String,
    pub new: String,
}

/// Everything needed to linearise one conflicted unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebasePlan {
    pub unit: String,
    pub ancestor: MigrationName,
    pub ours: MigrationName,
    pub theirs: MigrationName,
    pub renames: Vec<RenameOp>,
    pub rewrites: Vec<RewriteOp>,
    pub pointer: PointerUpdate,
}

impl RebasePlan {
    /// The leaf name once the plan is applied.
    pub fn new_leaf(&self) -> &MigrationName {
        self.renames
            .last()
            .map(|r| &r.new_name)
            .unwrap_or(&self.theirs)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Stateless rebase planner.
pub struct Resolver;

impl Resolver {
    /// Compute the plan that re-stacks *theirs* on top of *ours*.
    pub fn plan(unit: &Unit, case: &ConflictCase) -> Result<RebasePlan, UnitError> {
        let theirs = unit.file(case.theirs.as_str()).ok_or_else(|| {
            UnitError::malformed(&unit.name, format!("'{}' is not in the unit", case.theirs))
        })?;

        let parents: Vec<&DependencyEdge> = theirs.local_edges(&unit.name).collect();
        if parents.len() != 1 || parents[0].migration != case.ancestor.as_str() {
            return Err(UnitError::unsupported(
                &unit.name,
                format!(
                    "'{}' must depend only on '{}' within the unit",
                    case.theirs, case.ancestor
                ),
            ));
        }

        let new_number = case.ours.number().checked_add(1).ok_or_else(|| {
            UnitError::unsupported(
                &unit.name,
                format!("no sequence number after '{}'", case.ours),
            )
        })?;
        let new_name = case.theirs.renumbered(new_number);
        let ext = extension_of(&theirs.path);

        if let Some(taken) = unit
            .files
            .iter()
            .find(|f| f.number() == new_number && f.name != case.theirs)
        {
            return Err(UnitError::unsupported(
                &unit.name,
                format!(
                    "sequence number {new_number} after '{}' is already used by '{}'",
                    case.ours, taken.name
                ),
            ));
        }

        let mut renames = Vec::new();
        if new_name != case.theirs {
            renames.push(RenameOp {
                from: theirs.path.clone(),
                to: theirs.path.with_file_name(new_name.file_name(&ext)),
                old_name: case.theirs.clone(),
                new_name: new_name.clone(),
                old_number: case.theirs.number(),
                new_number,
            });
        }

        let mut replacements = Vec::new();
        let mut new_dependencies = Vec::new();
        for entry in &theirs.dependencies.entries {
            let DependencyEntry::Edge { edge, name_span } = entry else {
                continue;
            };
            if edge.unit == unit.name && edge.migration == case.ancestor.as_str() {
                replacements.push(Replacement {
                    span: *name_span,
                    original: edge.migration.clone(),
                    text: case.ours.to_string(),
                });
                new_dependencies.push(DependencyEdge::new(&edge.unit, case.ours.as_str()));
            } else {
                new_dependencies.push(edge.clone());
            }
        }

        let rewrite = RewriteOp {
            file: theirs.path.clone(),
            migration: case.theirs.clone(),
            old_dependencies: theirs.dependencies.edges().cloned().collect(),
            new_dependencies,
            replacements,
        };
        debug!(
            unit = %unit.name,
            file = %rewrite.migration,
            replacements = rewrite.replacements.len(),
            "planned dependency rewrite"
        );

        let plan = RebasePlan {
            unit: unit.name.clone(),
            ancestor: case.ancestor.clone(),
            ours: case.ours.clone(),
            theirs: case.theirs.clone(),
            renames,
            rewrites: vec![rewrite],
            pointer: PointerUpdate {
                path: unit.pointer_path.clone(),
                old: unit.pointer_raw.clone(),
                new: ChainPointer::render_resolved(new_name.as_str()),
            },
        };

        info!(
            unit = %plan.unit,
            ours = %plan.ours,
            theirs = %plan.theirs,
            new_leaf = %plan.new_leaf(),
            "rebase plan computed"
        );
        Ok(plan)
    }
}

fn extension_of(path: &std::path::Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("py")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::graph::ChainGraph;
    use crate::conflict::detector::{ConflictDetector, Detection};
    use crate::models::ChainFile;

    const HEAD: &str = "from django.db import migrations\n\n\nclass Migration(migrations.Migration):\n    dependencies = [\n        ('blog', '0001_initial'),\n    ]\n\n    operations = []\n";
    const FEATURE: &str = "from django.db import migrations\n\n\nclass Migration(migrations.Migration):\n    dependencies = [\n        (\"blog\", \"0001_initial\"),\n        ('auth', '0012_user'),\n    ]\n\n    operations = [migrations.RunPython(noop)]\n";

    fn file(name: &str, source: &str) -> ChainFile {
        ChainFile::from_source(
            PathBuf::from(format!("blog/migrations/{name}.py")),
            MigrationName::parse(name).unwrap(),
            source.to_string(),
        )
        .unwrap()
    }

    fn conflicted_unit(pointer: &str) -> Unit {
        Unit {
            name: "blog".into(),
            root: PathBuf::from("blog/migrations"),
            files: vec![
                file(
                    "0001_initial",
                    "class Migration(migrations.Migration):\n    initial = True\n",
                ),
                file("0002_feature", FEATURE),
                file("0002_head", HEAD),
            ],
            pointer_path: PathBuf::from("blog/migrations/max_migration.txt"),
            pointer_raw: pointer.into(),
            pointer: ChainPointer::parse(pointer).unwrap(),
        }
    }

    fn plan_for(unit: &Unit) -> Result<RebasePlan, UnitError> {
        let topology = ChainGraph::build(unit)?.classify()?;
        match ConflictDetector::detect(unit, &topology)? {
            Detection::Conflict(case) => Resolver::plan(unit, &case),
            Detection::Clean { .. } => panic!("expected a conflict"),
        }
    }

    #[test]
    fn test_plan_renumbers_theirs() {
        let unit = conflicted_unit("<<<<<<< HEAD\n0002_head\n=======\n0002_feature\n>>>>>>> feature\n");
        let plan = plan_for(&unit).unwrap();

        assert_eq!(plan.ours.as_str(), "0002_head");
        assert_eq!(plan.renames.len(), 1);
        let rename = &plan.renames[0];
        assert_eq!(rename.from, PathBuf::from("blog/migrations/0002_feature.py"));
        assert_eq!(rename.to, PathBuf::from("blog/migrations/0003_feature.py"));
        assert_eq!((rename.old_number, rename.new_number), (2, 3));

        let rewrite = &plan.rewrites[0];
        assert_eq!(
            rewrite.new_dependencies,
            vec![
                DependencyEdge::new("blog", "0002_head"),
                DependencyEdge::new("auth", "0012_user"),
            ]
        );
        assert_eq!(plan.pointer.new, "0003_feature\n");
        assert_eq!(plan.new_leaf().as_str(), "0003_feature");
    }

    #[test]
    fn test_render_replaces_only_the_literal() {
        let unit = conflicted_unit("<<<<<<< HEAD\n0002_head\n=======\n0002_feature\n>>>>>>> feature\n");
        let plan = plan_for(&unit).unwrap();
        let rendered = plan.rewrites[0].render(FEATURE).unwrap();
        assert_eq!(
            rendered,
            FEATURE.replace("(\"blog\", \"0001_initial\")", "(\"blog\", \"0002_head\")")
        );
    }

    #[test]
    fn test_render_detects_stale_source() {
        let unit = conflicted_unit("<<<<<<< HEAD\n0002_head\n=======\n0002_feature\n>>>>>>> feature\n");
        let plan = plan_for(&unit).unwrap();
        let edited = format!("# edited\n{FEATURE}");
        assert!(plan.rewrites[0].render(&edited).is_err());
    }

    #[test]
    fn test_plan_when_ours_is_numerically_larger() {
        let mut unit = conflicted_unit("<<<<<<< HEAD\n0005_head\n=======\n0002_feature\n>>>>>>> feature\n");
        unit.files[2] = file("0005_head", HEAD);
        unit.files.sort_by(|a, b| a.name.cmp(&b.name));

        let plan = plan_for(&unit).unwrap();
        assert_eq!(plan.renames[0].new_name.as_str(), "0006_feature");
        assert_eq!(plan.rewrites[0].new_dependencies[0].migration, "0005_head");
    }

    #[test]
    fn test_theirs_already_at_next_number_is_not_renamed() {
        let mut unit = conflicted_unit("<<<<<<< HEAD\n0002_head\n=======\n0003_feature\n>>>>>>> feature\n");
        unit.files[1] = file("0003_feature", FEATURE);
        unit.files.sort_by(|a, b| a.name.cmp(&b.name));

        let plan = plan_for(&unit).unwrap();
        assert!(plan.renames.is_empty());
        assert_eq!(plan.new_leaf().as_str(), "0003_feature");
        assert_eq!(plan.pointer.new, "0003_feature\n");
    }

    #[test]
    fn test_next_number_already_used_is_unsupported() {
        let base = "class Migration(migrations.Migration):\n    dependencies = [\n        ('blog', '0001_initial'),\n    ]\n";
        let on_base = |source: &str| source.replace("0001_initial", "0003_base");
        let mut unit = conflicted_unit("<<<<<<< HEAD\n0002_head\n=======\n0004_feature\n>>>>>>> feature\n");
        unit.files = vec![
            file(
                "0001_initial",
                "class Migration(migrations.Migration):\n    initial = True\n",
            ),
            file("0002_head", &on_base(HEAD)),
            file("0003_base", base),
            file("0004_feature", &on_base(FEATURE)),
        ];

        let err = plan_for(&unit).unwrap_err();
        assert!(matches!(err, UnitError::UnsupportedTopology { .. }));
        assert!(err.detail().contains("already used by '0003_base'"));
    }
}
