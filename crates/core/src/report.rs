//! Run report: per-unit outcomes, scan issues and warnings, rendered as
//! tables or JSON.
//!
//! Workers never touch the report directly. Outcomes flow over a channel to a
//! single aggregator owning a [`ReportBuilder`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::{Deserialize, Serialize};

use crate::config::{OutputFormat, ScanMode};
use crate::conflict::RebasePlan;
use crate::errors::{EngineError, ScanError, UnitError};
use crate::models::{CrossReference, DependencyEdge, RunMode};

// ---------------------------------------------------------------------------
// Per-unit entries
// ---------------------------------------------------------------------------

/// Final state of one unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Single chain, pointer names the leaf. No plan.
    Clean,
    /// A plan was computed (preview) or applied (apply).
    Resolved,
    MalformedUnit,
    UnsupportedTopology,
    /// Applying the plan failed; see `detail`.
    Error,
}

impl UnitStatus {
    /// Whether this status makes the run fail.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Clean | Self::Resolved)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Resolved => write!(f, "resolved"),
            Self::MalformedUnit => write!(f, "malformed_unit"),
            Self::UnsupportedTopology => write!(f, "unsupported_topology"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: String,
    pub path: PathBuf,
    pub status: UnitStatus,
    /// True when the plan was written to disk.
    pub applied: bool,
    /// Current leaf of a clean unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RebasePlan>,
}

impl UnitReport {
    pub fn clean(unit: impl Into<String>, path: PathBuf, leaf: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            path,
            status: UnitStatus::Clean,
            applied: false,
            leaf: Some(leaf.into()),
            detail: None,
            plan: None,
        }
    }

    pub fn resolved(plan: RebasePlan, path: PathBuf, applied: bool) -> Self {
        Self {
            unit: plan.unit.clone(),
            path,
            status: UnitStatus::Resolved,
            applied,
            leaf: None,
            detail: None,
            plan: Some(plan),
        }
    }

    /// A failed unit. The plan is kept for `Error` so the report shows what
    /// was attempted.
    pub fn failed(
        unit: impl Into<String>,
        path: PathBuf,
        err: &UnitError,
        plan: Option<RebasePlan>,
    ) -> Self {
        let status = match err {
            UnitError::Malformed { .. } => UnitStatus::MalformedUnit,
            UnitError::UnsupportedTopology { .. } => UnitStatus::UnsupportedTopology,
            UnitError::Filesystem { .. } | UnitError::Worker { .. } => UnitStatus::Error,
        };
        Self {
            unit: unit.into(),
            path,
            status,
            applied: false,
            leaf: None,
            detail: Some(err.detail()),
            plan,
        }
    }
}

/// A directory the scanner could not process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanIssue {
    pub path: String,
    pub detail: String,
}

impl From<&ScanError> for ScanIssue {
    fn from(err: &ScanError) -> Self {
        Self {
            path: err.path().to_string(),
            detail: err.to_string(),
        }
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    pub total: usize,
    pub clean: usize,
    pub resolved: usize,
    pub malformed: usize,
    pub unsupported: usize,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub mode: RunMode,
    pub scan_mode: ScanMode,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Dispatch stopped early on a shutdown request.
    pub cancelled: bool,
    pub summary: ReportSummary,
    pub units: Vec<UnitReport>,
    pub scan_issues: Vec<ScanIssue>,
    pub warnings: Vec<String>,
}

impl Report {
    /// Whether any unit failed or the run was cut short.
    pub fn has_failures(&self) -> bool {
        self.cancelled || self.units.iter().any(|u| u.status.is_failure())
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == name)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render(&self, format: OutputFormat, color: bool) -> Result<String, EngineError> {
        match format {
            OutputFormat::Json => self.to_json(),
            OutputFormat::Table => Ok(self.to_table(color)),
        }
    }

    /// Human-readable rendering: summary, per-plan detail, pointer changes,
    /// scan issues and warnings.
    pub fn to_table(&self, color: bool) -> String {
        let mut out = String::new();

        if self.units.is_empty() {
            out.push_str(&format!("No migration units found under {}\n", self.root.display()));
        } else {
            out.push_str(&self.summary_table(color).to_string());
            out.push('\n');
        }

        for entry in &self.units {
            let Some(plan) = &entry.plan else { continue };
            out.push_str(&format!("\n{} ({})\n", entry.unit, entry.path.display()));
            out.push_str(&plan_table(plan).to_string());
            out.push('\n');
        }

        let pointers: Vec<&UnitReport> = self.units.iter().filter(|u| u.plan.is_some()).collect();
        if !pointers.is_empty() {
            let mut table = new_table();
            table.set_header(vec!["Unit", "Current pointer", "New pointer"]);
            for entry in pointers {
                let Some(plan) = &entry.plan else { continue };
                table.add_row(vec![
                    Cell::new(&entry.unit),
                    Cell::new(plan.pointer.old.trim_end()),
                    Cell::new(plan.pointer.new.trim_end()),
                ]);
            }
            out.push('\n');
            out.push_str(&table.to_string());
            out.push('\n');
        }

        if !self.scan_issues.is_empty() {
            out.push_str("\nScan issues:\n");
            for issue in &self.scan_issues {
                out.push_str(&format!("  {}\n", issue.detail));
            }
        }
        if !self.warnings.is_empty() {
            out.push_str("\nWarnings:\n");
            for warning in &self.warnings {
                out.push_str(&format!("  {warning}\n"));
            }
        }

        let s = &self.summary;
        out.push_str(&format!(
            "\n{} unit(s): {} clean, {} resolved, {} malformed, {} unsupported, {} error(s){}{}\n",
            s.total,
            s.clean,
            s.resolved,
            s.malformed,
            s.unsupported,
            s.errors,
            if self.mode == RunMode::Preview { " (preview, nothing written)" } else { "" },
            if self.cancelled { " [cancelled]" } else { "" },
        ));
        out
    }

    fn summary_table(&self, color: bool) -> Table {
        let mut table = new_table();
        table.set_header(vec!["Unit", "Status", "Renames", "Dependency updates", "Pointer", "Detail"]);
        for entry in &self.units {
            let (renames, rewrites, pointer) = match &entry.plan {
                Some(plan) => (
                    plan.renames.len(),
                    plan.rewrites.len(),
                    plan.pointer.new.trim_end().to_string(),
                ),
                None => (0, 0, entry.leaf.clone().unwrap_or_else(|| "-".into())),
            };
            let mut status = Cell::new(entry.status);
            if color {
                status = status.fg(status_color(entry.status));
            }
            table.add_row(vec![
                Cell::new(&entry.unit),
                status,
                Cell::new(renames),
                Cell::new(rewrites),
                Cell::new(pointer),
                Cell::new(entry.detail.as_deref().unwrap_or("")),
            ]);
        }
        table
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn plan_table(plan: &RebasePlan) -> Table {
    let mut table = new_table();
    table.set_header(vec!["File", "Rename", "Dependencies"]);

    let renames: HashMap<&str, String> = plan
        .renames
        .iter()
        .map(|r| (r.old_name.as_str(), format!("{} -> {}", r.old_name, r.new_name)))
        .collect();

    for rewrite in &plan.rewrites {
        let rename = renames
            .get(rewrite.migration.as_str())
            .cloned()
            .unwrap_or_else(|| "-".into());
        table.add_row(vec![
            Cell::new(&rewrite.migration),
            Cell::new(rename),
            Cell::new(format!(
                "[{}] -> [{}]",
                join_edges(&rewrite.old_dependencies),
                join_edges(&rewrite.new_dependencies)
            )),
        ]);
    }
    table
}

fn join_edges(edges: &[DependencyEdge]) -> String {
    edges
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_color(status: UnitStatus) -> Color {
    match status {
        UnitStatus::Clean => Color::Green,
        UnitStatus::Resolved => Color::Blue,
        UnitStatus::MalformedUnit | UnitStatus::UnsupportedTopology => Color::Yellow,
        UnitStatus::Error => Color::Red,
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects outcomes while a run is in progress. Owned by one aggregator.
#[derive(Debug)]
pub struct ReportBuilder {
    mode: RunMode,
    scan_mode: ScanMode,
    root: PathBuf,
    started_at: DateTime<Utc>,
    units: Vec<UnitReport>,
    scan_issues: Vec<ScanIssue>,
    cross_refs: Vec<CrossReference>,
}

impl ReportBuilder {
    pub fn new(mode: RunMode, scan_mode: ScanMode, root: PathBuf) -> Self {
        Self {
            mode,
            scan_mode,
            root,
            started_at: Utc::now(),
            units: Vec::new(),
            scan_issues: Vec::new(),
            cross_refs: Vec::new(),
        }
    }

    pub fn push_unit(&mut self, report: UnitReport, cross_refs: Vec<CrossReference>) {
        self.units.push(report);
        self.cross_refs.extend(cross_refs);
    }

    pub fn push_scan_issue(&mut self, issue: ScanIssue) {
        self.scan_issues.push(issue);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Sort entries, count statuses and flag cross-unit references to
    /// renamed files.
    pub fn finish(mut self, cancelled: bool) -> Report {
        self.units
            .sort_by(|a, b| a.unit.cmp(&b.unit).then_with(|| a.path.cmp(&b.path)));

        let mut summary = ReportSummary {
            total: self.units.len(),
            ..Default::default()
        };
        for entry in &self.units {
            match entry.status {
                UnitStatus::Clean => summary.clean += 1,
                UnitStatus::Resolved => summary.resolved += 1,
                UnitStatus::MalformedUnit => summary.malformed += 1,
                UnitStatus::UnsupportedTopology => summary.unsupported += 1,
                UnitStatus::Error => summary.errors += 1,
            }
        }

        let warnings = cross_reference_warnings(&self.units, &self.cross_refs);

        Report {
            mode: self.mode,
            scan_mode: self.scan_mode,
            root: self.root,
            started_at: self.started_at,
            completed_at: Utc::now(),
            cancelled,
            summary,
            units: self.units,
            scan_issues: self.scan_issues,
            warnings,
        }
    }
}

/// One warning per cross-unit edge whose target is renamed by a plan.
fn cross_reference_warnings(units: &[UnitReport], refs: &[CrossReference]) -> Vec<String> {
    let renamed: HashMap<(&str, &str), &str> = units
        .iter()
        .filter(|u| u.status == UnitStatus::Resolved)
        .filter_map(|u| u.plan.as_ref())
        .flat_map(|plan| {
            plan.renames.iter().map(move |r| {
                ((plan.unit.as_str(), r.old_name.as_str()), r.new_name.as_str())
            })
        })
        .collect();

    let mut warnings: Vec<String> = refs
        .iter()
        .filter_map(|r| {
            renamed
                .get(&(r.target.unit.as_str(), r.target.migration.as_str()))
                .map(|new| {
                    format!(
                        "{}/{} depends on {}.{} which is renamed to {}",
                        r.from_unit, r.from_file, r.target.unit, r.target.migration, new
                    )
                })
        })
        .collect();
    warnings.sort();
    warnings.dedup();
    warnings
}
