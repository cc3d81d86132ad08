//! Orchestrator: runs the per-unit pipeline over one unit or a whole tree.
//!
//! For a tree run:
//!
//! 1. The scanner walks on a blocking thread and streams candidates through a
//!    bounded channel.
//! 2. The dispatcher takes a semaphore permit per candidate and runs the unit
//!    pipeline (parse, graph, detect, resolve, rewrite) on the blocking pool.
//! 3. Outcomes go through a second channel to a single aggregator task that
//!    owns the [`ReportBuilder`].
//!
//! Setting the shutdown flag stops dispatch; units already running finish
//! and are reported.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chain::{ChainGraph, UnitParser};
use crate::config::{EngineConfig, LayoutConfig, OutputFormat, ScanMode};
use crate::conflict::{ConflictDetector, Detection, RebasePlan, Resolver};
use crate::errors::{EngineError, ScanError, UnitError};
use crate::models::{CrossReference, MigrationName, RunMode, Unit};
use crate::report::{Report, ReportBuilder, ScanIssue, UnitReport};
use crate::rewriter::Rewriter;
use crate::scanner::Scanner;

/// Shared cancellation flag, set from signal handlers.
pub type ShutdownFlag = Arc<AtomicBool>;

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// What a run operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every unit found under a root.
    Tree(PathBuf),
    /// One chain directory.
    Unit(PathBuf),
}

impl Target {
    /// Interpret `path`: a directory holding a pointer file is a single unit,
    /// anything else is a tree root.
    pub fn detect(path: impl AsRef<Path>, layout: &LayoutConfig) -> Result<Self, EngineError> {
        let path = ensure_dir(path.as_ref())?;
        if path.join(&layout.pointer_file).is_file() {
            Ok(Self::Unit(path))
        } else {
            Ok(Self::Tree(path))
        }
    }

    /// A single unit given either as the chain directory or as the
    /// application directory containing it.
    pub fn unit(path: impl AsRef<Path>, layout: &LayoutConfig) -> Result<Self, EngineError> {
        let path = ensure_dir(path.as_ref())?;
        if path.join(&layout.pointer_file).is_file() {
            return Ok(Self::Unit(path));
        }
        let chain = path.join(&layout.chain_dir);
        if chain.join(&layout.pointer_file).is_file() {
            return Ok(Self::Unit(chain));
        }
        Err(EngineError::NotAUnit(path.display().to_string()))
    }

    /// A tree root.
    pub fn tree(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Ok(Self::Tree(ensure_dir(path.as_ref())?))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Tree(p) | Self::Unit(p) => p,
        }
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, EngineError> {
    let invalid = |detail: &str| EngineError::InvalidTarget {
        path: path.display().to_string(),
        detail: detail.to_string(),
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(path.to_path_buf()),
        Ok(_) => Err(invalid("not a directory")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(invalid("does not exist")),
        Err(e) => Err(invalid(&e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Per-unit pipeline
// ---------------------------------------------------------------------------

/// Result of processing one unit.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub report: UnitReport,
    /// Edges from this unit into other units.
    pub cross_refs: Vec<CrossReference>,
}

enum Resolution {
    Clean(MigrationName),
    Planned(RebasePlan),
}

/// Parse, classify, detect, resolve and (in apply mode) rewrite one unit.
/// Never fails: every problem ends up in the returned report entry.
pub fn process_unit(dir: &Path, config: &EngineConfig, mode: RunMode) -> UnitOutcome {
    let parser = UnitParser::new(&config.layout);
    let path = dir.to_path_buf();

    let unit = match parser.parse_unit(dir) {
        Ok(unit) => unit,
        Err(e) => {
            let name = parser.unit_name(dir);
            let err = UnitError::malformed(&name, e.to_string());
            warn!(unit = %name, error = %e, "unit could not be parsed");
            return UnitOutcome {
                report: UnitReport::failed(name, path, &err, None),
                cross_refs: Vec::new(),
            };
        }
    };
    let cross_refs = cross_references(&unit);

    let report = match resolve(&unit) {
        Ok(Resolution::Clean(leaf)) => UnitReport::clean(&unit.name, path, leaf.as_str()),
        Ok(Resolution::Planned(plan)) => match Rewriter::execute(&plan, mode) {
            Ok(applied) => UnitReport::resolved(plan, path, applied),
            Err(source) => {
                let err = UnitError::Filesystem {
                    unit: unit.name.clone(),
                    source,
                };
                warn!(unit = %unit.name, error = %err, "rewrite failed");
                UnitReport::failed(&unit.name, path, &err, Some(plan))
            }
        },
        Err(err) => {
            warn!(unit = %unit.name, error = %err, "unit not resolved");
            UnitReport::failed(&unit.name, path, &err, None)
        }
    };

    debug!(unit = %unit.name, status = %report.status, "unit processed");
    UnitOutcome { report, cross_refs }
}

fn resolve(unit: &Unit) -> Result<Resolution, UnitError> {
    let topology = ChainGraph::build(unit)?.classify()?;
    match ConflictDetector::detect(unit, &topology)? {
        Detection::Clean { leaf } => Ok(Resolution::Clean(leaf)),
        Detection::Conflict(case) => Ok(Resolution::Planned(Resolver::plan(unit, &case)?)),
    }
}

/// [`process_unit`] for a pool worker: a panic is reported against the unit
/// instead of tearing down the run.
pub fn process_unit_guarded(dir: &Path, config: &EngineConfig, mode: RunMode) -> UnitOutcome {
    panic::catch_unwind(AssertUnwindSafe(|| process_unit(dir, config, mode)))
        .unwrap_or_else(|payload| worker_failure(dir, &config.layout, payload.as_ref()))
}

fn worker_failure(dir: &Path, layout: &LayoutConfig, payload: &(dyn Any + Send)) -> UnitOutcome {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    let name = UnitParser::new(layout).unit_name(dir);
    let err = UnitError::Worker {
        unit: name.clone(),
        detail: format!("panicked: {message}"),
    };
    warn!(unit = %name, error = %err, "unit worker failed");
    UnitOutcome {
        report: UnitReport::failed(name, dir.to_path_buf(), &err, None),
        cross_refs: Vec::new(),
    }
}

fn cross_references(unit: &Unit) -> Vec<CrossReference> {
    unit.files
        .iter()
        .flat_map(|file| {
            file.foreign_edges(&unit.name).map(move |edge| CrossReference {
                from_unit: unit.name.clone(),
                from_file: file.name.to_string(),
                target: edge.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum Message {
    Unit(UnitOutcome),
    ScanIssue(ScanIssue),
}

/// Drives runs over units or trees.
pub struct RebaseEngine {
    config: Arc<EngineConfig>,
    shutdown: ShutdownFlag,
}

impl RebaseEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share an externally owned shutdown flag (e.g. one set by signal
    /// handlers).
    pub fn with_shutdown(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run over `target` and return the complete report.
    pub async fn run(&self, target: &Target, mode: RunMode) -> Result<Report, EngineError> {
        info!(
            target = %target.path().display(),
            %mode,
            scan_mode = %self.config.scan.mode,
            "starting run"
        );

        let report = match target {
            Target::Unit(dir) => self.run_unit(dir.clone(), mode).await?,
            Target::Tree(root) => self.run_tree(root.clone(), mode).await?,
        };

        info!(
            total = report.summary.total,
            resolved = report.summary.resolved,
            failed = report.summary.malformed + report.summary.unsupported + report.summary.errors,
            cancelled = report.cancelled,
            "run complete"
        );
        Ok(report)
    }

    async fn run_unit(&self, dir: PathBuf, mode: RunMode) -> Result<Report, EngineError> {
        let mut builder = ReportBuilder::new(mode, self.config.scan.mode, dir.clone());
        let config = self.config.clone();
        let outcome =
            tokio::task::spawn_blocking(move || process_unit_guarded(&dir, &config, mode))
                .await?;
        builder.push_unit(outcome.report, outcome.cross_refs);
        Ok(builder.finish(false))
    }

    async fn run_tree(&self, root: PathBuf, mode: RunMode) -> Result<Report, EngineError> {
        let capacity = self.config.run.channel_capacity;
        let workers = self.config.run.effective_workers();
        debug!(workers, capacity, "worker pool configured");

        // Scanner -> dispatcher.
        let (candidate_tx, mut candidate_rx) =
            mpsc::channel::<Result<PathBuf, ScanError>>(capacity);
        let scanner = Scanner::new(&root, &self.config);
        let scan_shutdown = self.shutdown.clone();
        let scan_task = tokio::task::spawn_blocking(move || {
            for candidate in scanner.scan() {
                if scan_shutdown.load(Ordering::SeqCst) {
                    return true;
                }
                if candidate_tx.blocking_send(candidate).is_err() {
                    return true;
                }
            }
            false
        });

        // Workers -> aggregator.
        let (result_tx, mut result_rx) = mpsc::channel::<Message>(capacity);
        let scan_mode = self.config.scan.mode;
        let aggregator = tokio::spawn(async move {
            let mut builder = ReportBuilder::new(mode, scan_mode, root);
            while let Some(message) = result_rx.recv().await {
                match message {
                    Message::Unit(outcome) => builder.push_unit(outcome.report, outcome.cross_refs),
                    Message::ScanIssue(issue) => builder.push_scan_issue(issue),
                }
            }
            builder
        });

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut stopped_dispatch = false;
        let mut dispatched = 0usize;

        while let Some(candidate) = candidate_rx.recv().await {
            if self.is_shutdown_requested() {
                stopped_dispatch = true;
                break;
            }
            let dir = match candidate {
                Ok(dir) => dir,
                Err(err) => {
                    if result_tx.send(Message::ScanIssue((&err).into())).await.is_err() {
                        return Err(EngineError::Task("report aggregator stopped".into()));
                    }
                    continue;
                }
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?;
            if self.is_shutdown_requested() {
                stopped_dispatch = true;
                break;
            }

            let config = self.config.clone();
            let tx = result_tx.clone();
            tasks.spawn_blocking(move || {
                let outcome = process_unit_guarded(&dir, &config, mode);
                // The aggregator outlives every worker; a send error means
                // the run is already failing.
                let _ = tx.blocking_send(Message::Unit(outcome));
                drop(permit);
            });
            dispatched += 1;

            while let Some(joined) = tasks.try_join_next() {
                joined?;
            }
        }

        if stopped_dispatch {
            info!(dispatched, "shutdown requested, waiting for in-flight units");
        }
        // Stops the scanner at its next send.
        drop(candidate_rx);

        while let Some(joined) = tasks.join_next().await {
            joined?;
        }
        drop(result_tx);

        let builder = aggregator.await?;
        let scanner_stopped = scan_task.await?;
        Ok(builder.finish(stopped_dispatch || scanner_stopped))
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// A preview report together with its rendering.
#[derive(Debug, Clone)]
pub struct Preview {
    pub report: Report,
    pub rendered: String,
}

fn engine_for(scan_mode: ScanMode) -> Result<RebaseEngine, EngineError> {
    let mut config = EngineConfig::default();
    config.scan.mode = scan_mode;
    RebaseEngine::new(config)
}

/// Resolve and apply every conflict under `path` (a tree root or a single
/// chain directory) with default settings.
pub async fn apply(path: impl AsRef<Path>, scan_mode: ScanMode) -> Result<Report, EngineError> {
    let engine = engine_for(scan_mode)?;
    let target = Target::detect(path, &engine.config().layout)?;
    engine.run(&target, RunMode::Apply).await
}

/// Compute plans for every conflict under `path` without writing anything,
/// and render the report in `format`.
pub async fn preview(
    path: impl AsRef<Path>,
    scan_mode: ScanMode,
    format: OutputFormat,
) -> Result<Preview, EngineError> {
    let engine = engine_for(scan_mode)?;
    let target = Target::detect(path, &engine.config().layout)?;
    let report = engine.run(&target, RunMode::Preview).await?;
    let rendered = report.render(format, false)?;
    Ok(Preview { report, rendered })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = tmp.path().join("blog").join("migrations");
        std::fs::create_dir_all(&chain).unwrap();
        std::fs::write(chain.join("max_migration.txt"), "0001_initial\n").unwrap();
        let layout = LayoutConfig::default();

        assert_eq!(
            Target::detect(&chain, &layout).unwrap(),
            Target::Unit(chain.clone())
        );
        assert_eq!(
            Target::detect(tmp.path(), &layout).unwrap(),
            Target::Tree(tmp.path().to_path_buf())
        );
        assert_eq!(
            Target::unit(tmp.path().join("blog"), &layout).unwrap(),
            Target::Unit(chain)
        );
        assert!(matches!(
            Target::unit(tmp.path(), &layout),
            Err(EngineError::NotAUnit(_))
        ));
    }

    #[test]
    fn test_invalid_target() {
        let layout = LayoutConfig::default();
        assert!(matches!(
            Target::detect("/nonexistent/project", &layout),
            Err(EngineError::InvalidTarget { .. })
        ));

        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            Target::tree(&file),
            Err(EngineError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_process_unparseable_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = tmp.path().join("blog").join("migrations");
        std::fs::create_dir_all(&chain).unwrap();
        std::fs::write(chain.join("max_migration.txt"), "0001_initial\n").unwrap();
        std::fs::write(chain.join("0001_initial.py"), "x = 1\n").unwrap();

        let outcome = process_unit(&chain, &EngineConfig::default(), RunMode::Preview);
        assert_eq!(outcome.report.unit, "blog");
        assert_eq!(outcome.report.status, crate::report::UnitStatus::MalformedUnit);
        assert!(outcome.report.detail.unwrap().contains("no Migration class"));
    }

    #[test]
    fn test_worker_panic_is_reported_against_unit() {
        let dir = PathBuf::from("/srv/project/blog/migrations");
        let payload = panic::catch_unwind(|| panic!("index out of bounds")).unwrap_err();

        let outcome = worker_failure(&dir, &LayoutConfig::default(), payload.as_ref());
        assert_eq!(outcome.report.unit, "blog");
        assert_eq!(outcome.report.path, dir);
        assert_eq!(outcome.report.status, crate::report::UnitStatus::Error);
        assert_eq!(
            outcome.report.detail.as_deref(),
            Some("panicked: index out of bounds")
        );
    }

    #[test]
    fn test_guarded_pipeline_passes_through_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = tmp.path().join("blog").join("migrations");
        std::fs::create_dir_all(&chain).unwrap();
        std::fs::write(chain.join("max_migration.txt"), "0001_initial\n").unwrap();
        std::fs::write(chain.join("0001_initial.py"), "x = 1\n").unwrap();

        let outcome = process_unit_guarded(&chain, &EngineConfig::default(), RunMode::Preview);
        assert_eq!(outcome.report.status, crate::report::UnitStatus::MalformedUnit);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.run.channel_capacity = 0;
        assert!(matches!(
            RebaseEngine::new(config),
            Err(EngineError::Config(_))
        ));
    }
}
