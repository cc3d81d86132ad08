//! End-to-end tests for the rebase engine.
//!
//! Each test builds a throwaway project tree with `tempfile`, runs the real
//! engine over it and checks both the report and the files left on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use migration_rebase_core::chain::{ChainGraph, Topology, UnitParser};
use migration_rebase_core::config::{EngineConfig, LayoutConfig, OutputFormat, ScanMode};
use migration_rebase_core::engine::{RebaseEngine, Target};
use migration_rebase_core::errors::EngineError;
use migration_rebase_core::models::RunMode;
use migration_rebase_core::report::{Report, UnitStatus};

// ===========================================================================
// Helpers
// ===========================================================================

const INITIAL: &str = "from django.db import migrations, models\n\n\nclass Migration(migrations.Migration):\n\n    initial = True\n\n    dependencies = []\n\n    operations = [\n        migrations.CreateModel(name=\"Post\", fields=[(\"id\", models.AutoField(primary_key=True))]),\n    ]\n";

fn migration(app: &str, parent: &str, body: &str) -> String {
    format!(
        "# Generated by Django 4.2\n\nfrom django.db import migrations, models\n\n\nclass Migration(migrations.Migration):\n\n    dependencies = [\n        (\"{app}\", \"{parent}\"),\n    ]\n\n    operations = [\n        {body}\n    ]\n"
    )
}

fn pointer_conflict(ours: &str, theirs: &str) -> String {
    format!("<<<<<<< HEAD\n{ours}\n=======\n{theirs}\n>>>>>>> 5f2c1e9 (add {theirs})\n")
}

/// `<root>/<app>/migrations` with `0001_initial` and two leaves on top of it.
fn conflicted_app(root: &Path, app: &str, ours: &str, theirs: &str) -> PathBuf {
    let dir = root.join(app).join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("__init__.py"), "").unwrap();
    std::fs::write(dir.join("0001_initial.py"), INITIAL).unwrap();
    std::fs::write(
        dir.join(format!("{ours}.py")),
        migration(app, "0001_initial", "migrations.AddField(model_name=\"post\", name=\"head\", field=models.TextField())"),
    )
    .unwrap();
    std::fs::write(
        dir.join(format!("{theirs}.py")),
        migration(app, "0001_initial", "migrations.AddField(model_name=\"post\", name=\"feature\", field=models.TextField())"),
    )
    .unwrap();
    std::fs::write(dir.join("max_migration.txt"), pointer_conflict(ours, theirs)).unwrap();
    dir
}

fn clean_app(root: &Path, app: &str) -> PathBuf {
    let dir = root.join(app).join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("0001_initial.py"), INITIAL).unwrap();
    std::fs::write(
        dir.join("0002_second.py"),
        migration(app, "0001_initial", "migrations.RunSQL(\"SELECT 1\")"),
    )
    .unwrap();
    std::fs::write(dir.join("max_migration.txt"), "0002_second\n").unwrap();
    dir
}

fn engine(workers: usize) -> RebaseEngine {
    let mut config = EngineConfig::default();
    config.run.workers = workers;
    RebaseEngine::new(config).unwrap()
}

async fn run(root: &Path, mode: RunMode) -> Report {
    engine(4)
        .run(&Target::tree(root).unwrap(), mode)
        .await
        .unwrap()
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// Snapshot of every file under `root` (relative path, content).
fn snapshot(root: &Path) -> Vec<(PathBuf, String)> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            files.push((
                entry.path().strip_prefix(root).unwrap().to_path_buf(),
                read(entry.path()),
            ));
        }
    }
    files
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_head_feature_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    let head_before = read(dir.join("0002_head.py"));

    let report = run(tmp.path(), RunMode::Apply).await;

    let entry = report.unit("blog").unwrap();
    assert_eq!(entry.status, UnitStatus::Resolved);
    assert!(entry.applied);
    let plan = entry.plan.as_ref().unwrap();
    assert_eq!(plan.ours.as_str(), "0002_head");
    assert_eq!(plan.theirs.as_str(), "0002_feature");
    assert_eq!(plan.renames[0].new_name.as_str(), "0003_feature");

    assert_eq!(read(dir.join("0002_head.py")), head_before);
    assert!(!dir.join("0002_feature.py").exists());
    assert!(read(dir.join("0003_feature.py")).contains("(\"blog\", \"0002_head\")"));
    assert_eq!(read(dir.join("max_migration.txt")), "0003_feature\n");
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_textual_order_beats_numeric_order() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "shop", "0007_zeta", "0002_alpha");

    let report = run(tmp.path(), RunMode::Apply).await;

    let plan = report.unit("shop").unwrap().plan.clone().unwrap();
    assert_eq!(plan.ours.as_str(), "0007_zeta");
    assert_eq!(plan.renames[0].new_name.as_str(), "0008_alpha");
    assert!(dir.join("0007_zeta.py").exists());
    assert!(read(dir.join("0008_alpha.py")).contains("(\"shop\", \"0007_zeta\")"));
    assert_eq!(read(dir.join("max_migration.txt")), "0008_alpha\n");
}

#[tokio::test]
async fn test_applied_unit_is_clean_and_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");

    run(tmp.path(), RunMode::Apply).await;

    let unit = UnitParser::new(&LayoutConfig::default())
        .parse_unit(&dir)
        .unwrap();
    assert!(!unit.pointer.is_conflicted());
    let topology = ChainGraph::build(&unit).unwrap().classify().unwrap();
    assert!(matches!(topology, Topology::Linear { .. }));
    let numbers: Vec<u32> = unit.files.iter().map(|f| f.number()).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let again = run(tmp.path(), RunMode::Preview).await;
    let entry = again.unit("blog").unwrap();
    assert_eq!(entry.status, UnitStatus::Clean);
    assert!(entry.plan.is_none());
    assert_eq!(entry.leaf.as_deref(), Some("0003_feature"));
}

#[tokio::test]
async fn test_payload_preserved_outside_declaration() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    let before = read(dir.join("0002_feature.py"));

    run(tmp.path(), RunMode::Apply).await;

    let after = read(dir.join("0003_feature.py"));
    let start = before.find("dependencies").unwrap();
    let end = start + before[start..].find(']').unwrap() + 1;
    assert_eq!(&after[..start], &before[..start]);
    assert!(after.ends_with(&before[end..]));
    assert_eq!(
        after,
        before.replace("(\"blog\", \"0001_initial\")", "(\"blog\", \"0002_head\")")
    );
}

#[tokio::test]
async fn test_preview_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    clean_app(tmp.path(), "accounts");
    let before = snapshot(tmp.path());

    let preview = migration_rebase_core::preview(tmp.path(), ScanMode::Conventional, OutputFormat::Json)
        .await
        .unwrap();

    assert_eq!(snapshot(tmp.path()), before);
    let entry = preview.report.unit("blog").unwrap();
    assert_eq!(entry.status, UnitStatus::Resolved);
    assert!(!entry.applied);
    let json: serde_json::Value = serde_json::from_str(&preview.rendered).unwrap();
    assert_eq!(json["mode"], "preview");
    assert_eq!(json["summary"]["resolved"], 1);
    assert_eq!(json["summary"]["clean"], 1);
}

#[tokio::test]
async fn test_failure_is_isolated_to_one_unit() {
    let tmp = tempfile::tempdir().unwrap();
    let apps = ["alpha", "bravo", "charlie", "delta", "echo"];
    for app in apps {
        conflicted_app(tmp.path(), app, "0002_head", "0002_feature");
    }
    // Occupy the rename destination in one unit. The parser ignores
    // directories, so the plan is computed and the rename step fails.
    let broken = tmp.path().join("charlie/migrations");
    std::fs::create_dir(broken.join("0003_feature.py")).unwrap();
    let feature_before = read(broken.join("0002_feature.py"));
    let pointer_before = read(broken.join("max_migration.txt"));

    let report = run(tmp.path(), RunMode::Apply).await;

    for app in apps {
        let expected = if app == "charlie" { UnitStatus::Error } else { UnitStatus::Resolved };
        assert_eq!(report.unit(app).unwrap().status, expected, "unit {app}");
    }
    let failed = report.unit("charlie").unwrap();
    assert!(failed.detail.as_ref().unwrap().contains("already exists"));
    assert!(failed.plan.is_some());
    assert_eq!(read(broken.join("0002_feature.py")), feature_before);
    assert_eq!(read(broken.join("max_migration.txt")), pointer_before);
    assert_eq!(report.summary.errors, 1);
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_three_leaves_touch_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    std::fs::write(
        dir.join("0002_third.py"),
        migration("blog", "0001_initial", "migrations.RunSQL(\"SELECT 3\")"),
    )
    .unwrap();
    let before = snapshot(tmp.path());

    let report = run(tmp.path(), RunMode::Apply).await;

    let entry = report.unit("blog").unwrap();
    assert!(matches!(
        entry.status,
        UnitStatus::MalformedUnit | UnitStatus::UnsupportedTopology
    ));
    assert!(entry.plan.is_none());
    assert_eq!(snapshot(tmp.path()), before);
}

#[tokio::test]
async fn test_pointer_names_unknown_leaf() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    std::fs::write(
        dir.join("max_migration.txt"),
        pointer_conflict("0002_head", "0002_elsewhere"),
    )
    .unwrap();

    let report = run(tmp.path(), RunMode::Apply).await;
    assert_eq!(report.unit("blog").unwrap().status, UnitStatus::MalformedUnit);
    assert!(dir.join("0002_feature.py").exists());
}

#[tokio::test]
async fn test_cross_unit_reference_warning() {
    let tmp = tempfile::tempdir().unwrap();
    conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    let accounts = tmp.path().join("accounts/migrations");
    std::fs::create_dir_all(&accounts).unwrap();
    let source = "class Migration(migrations.Migration):\n    dependencies = [\n        ('blog', '0002_feature'),\n    ]\n";
    std::fs::write(accounts.join("0001_initial.py"), source).unwrap();
    std::fs::write(accounts.join("max_migration.txt"), "0001_initial\n").unwrap();

    let report = run(tmp.path(), RunMode::Apply).await;

    assert_eq!(report.unit("accounts").unwrap().status, UnitStatus::Clean);
    assert_eq!(
        report.warnings,
        vec!["accounts/0001_initial depends on blog.0002_feature which is renamed to 0003_feature"]
    );
    // Files outside the conflicted unit are left alone.
    assert_eq!(read(accounts.join("0001_initial.py")), source);
}

#[tokio::test]
async fn test_single_unit_target() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = conflicted_app(tmp.path(), "blog", "0002_head", "0002_feature");
    conflicted_app(tmp.path(), "shop", "0002_head", "0002_feature");

    let report = migration_rebase_core::apply(&dir, ScanMode::Conventional)
        .await
        .unwrap();

    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].unit, "blog");
    assert!(dir.join("0003_feature.py").exists());
    assert!(tmp.path().join("shop/migrations/0002_feature.py").exists());
}

#[tokio::test]
async fn test_reused_number_in_linear_chain_is_malformed() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("blog").join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("0001_initial.py"), INITIAL).unwrap();
    std::fs::write(
        dir.join("0002_a.py"),
        migration("blog", "0001_initial", "migrations.RunSQL(\"SELECT 1\")"),
    )
    .unwrap();
    std::fs::write(
        dir.join("0002_b.py"),
        migration("blog", "0002_a", "migrations.RunSQL(\"SELECT 2\")"),
    )
    .unwrap();
    std::fs::write(dir.join("max_migration.txt"), "0002_b\n").unwrap();

    let report = run(tmp.path(), RunMode::Preview).await;

    let entry = report.unit("blog").unwrap();
    assert_eq!(entry.status, UnitStatus::MalformedUnit);
    assert!(entry.detail.as_deref().unwrap().contains("sequence number 2"));
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_next_number_in_use_leaves_unit_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("blog").join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("0001_initial.py"), INITIAL).unwrap();
    std::fs::write(
        dir.join("0003_base.py"),
        migration("blog", "0001_initial", "migrations.RunSQL(\"SELECT 1\")"),
    )
    .unwrap();
    std::fs::write(
        dir.join("0002_head.py"),
        migration("blog", "0003_base", "migrations.RunSQL(\"SELECT 2\")"),
    )
    .unwrap();
    std::fs::write(
        dir.join("0004_feat.py"),
        migration("blog", "0003_base", "migrations.RunSQL(\"SELECT 3\")"),
    )
    .unwrap();
    std::fs::write(
        dir.join("max_migration.txt"),
        pointer_conflict("0002_head", "0004_feat"),
    )
    .unwrap();
    let before = snapshot(tmp.path());

    let report = run(tmp.path(), RunMode::Apply).await;

    let entry = report.unit("blog").unwrap();
    assert_eq!(entry.status, UnitStatus::UnsupportedTopology);
    assert!(!entry.applied);
    assert!(entry.detail.as_deref().unwrap().contains("0003_base"));
    assert_eq!(snapshot(tmp.path()), before);
}

#[tokio::test]
async fn test_invalid_root_fails_fast() {
    let err = migration_rebase_core::apply("/definitely/not/here", ScanMode::Conventional)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTarget { .. }));
}

#[tokio::test]
async fn test_exhaustive_scan_finds_nonstandard_units() {
    let tmp = tempfile::tempdir().unwrap();
    // Chain directory named after its unit instead of `<app>/migrations`.
    conflicted_app(tmp.path(), "legacy", "0002_head", "0002_feature");
    std::fs::create_dir(tmp.path().join("schemas")).unwrap();
    std::fs::rename(
        tmp.path().join("legacy/migrations"),
        tmp.path().join("schemas/legacy"),
    )
    .unwrap();

    let conventional = run(tmp.path(), RunMode::Preview).await;
    assert!(conventional.units.is_empty());

    let mut config = EngineConfig::default();
    config.scan.mode = ScanMode::Exhaustive;
    let report = RebaseEngine::new(config)
        .unwrap()
        .run(&Target::tree(tmp.path()).unwrap(), RunMode::Preview)
        .await
        .unwrap();
    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].unit, "legacy");
    assert_eq!(report.units[0].status, UnitStatus::Resolved);
}

#[tokio::test]
async fn test_cancelled_before_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..10 {
        conflicted_app(tmp.path(), &format!("app{i:02}"), "0002_head", "0002_feature");
    }
    let before = snapshot(tmp.path());

    let engine = engine(2);
    engine.shutdown_flag().store(true, Ordering::SeqCst);
    let report = engine
        .run(&Target::tree(tmp.path()).unwrap(), RunMode::Apply)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.units.is_empty());
    assert!(report.has_failures());
    assert_eq!(snapshot(tmp.path()), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_mid_run_finishes_in_flight_units() {
    let tmp = tempfile::tempdir().unwrap();
    let apps: Vec<String> = (0..500).map(|i| format!("app{i:03}")).collect();
    for app in &apps {
        conflicted_app(tmp.path(), app, "0002_head", "0002_feature");
    }

    let engine = engine(1);
    let flag = engine.shutdown_flag();
    let first_pointer = tmp.path().join("app000/migrations/max_migration.txt");
    let watcher = std::thread::spawn(move || {
        while read(&first_pointer) != "0003_feature\n" {
            std::thread::yield_now();
        }
        flag.store(true, Ordering::SeqCst);
    });

    let report = engine
        .run(&Target::tree(tmp.path()).unwrap(), RunMode::Apply)
        .await
        .unwrap();
    watcher.join().unwrap();

    assert!(report.cancelled);
    assert!(report.has_failures());
    assert!(report.unit("app000").is_some());
    assert!(report.units.len() < apps.len());

    // Every unit is either fully applied and reported, or untouched.
    for app in &apps {
        let dir = tmp.path().join(app).join("migrations");
        let pointer = read(dir.join("max_migration.txt"));
        match report.unit(app) {
            Some(entry) => {
                assert_eq!(entry.status, UnitStatus::Resolved);
                assert!(entry.applied);
                assert_eq!(pointer, "0003_feature\n");
                assert!(!dir.join("0002_feature.py").exists());
            }
            None => {
                assert_eq!(pointer, pointer_conflict("0002_head", "0002_feature"));
                assert!(dir.join("0002_feature.py").exists());
                assert!(!dir.join("0003_feature.py").exists());
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_units() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..1000 {
        conflicted_app(tmp.path(), &format!("app{i:04}"), "0002_head", "0002_feature");
    }

    let report = engine(8)
        .run(&Target::tree(tmp.path()).unwrap(), RunMode::Apply)
        .await
        .unwrap();

    assert_eq!(report.summary.total, 1000);
    assert_eq!(report.summary.resolved, 1000);
    assert!(!report.cancelled);
    for entry in &report.units {
        assert_eq!(entry.status, UnitStatus::Resolved);
        let dir = &entry.path;
        assert!(read(dir.join("0003_feature.py")).contains(&format!("(\"{}\", \"0002_head\")", entry.unit)));
        assert_eq!(read(dir.join("max_migration.txt")), "0003_feature\n");
    }
}
