//! Project tree scanner.
//!
//! Produces candidate unit directories lazily so the orchestrator can start
//! processing before the walk finishes. Unreadable directories and symlink
//! loops are yielded as errors and the walk continues past them.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::config::{EngineConfig, ScanMode};
use crate::errors::ScanError;

/// Finds chain directories under a root.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    mode: ScanMode,
    skip_dirs: Vec<String>,
    follow_symlinks: bool,
    chain_dir: String,
    pointer_file: String,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            root: root.into(),
            mode: config.scan.mode,
            skip_dirs: config.scan.skip_dirs.clone(),
            follow_symlinks: config.scan.follow_symlinks,
            chain_dir: config.layout.chain_dir.clone(),
            pointer_file: config.layout.pointer_file.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the tree, yielding candidate directories in walk order.
    pub fn scan(&self) -> Candidates<'_> {
        debug!(root = %self.root.display(), mode = %self.mode, "scanning for units");
        Candidates {
            scanner: self,
            walker: WalkDir::new(&self.root)
                .follow_links(self.follow_symlinks)
                .sort_by_file_name()
                .into_iter(),
        }
    }

    /// Whether a directory with this name is pruned from the walk.
    fn is_skipped(&self, name: &OsStr) -> bool {
        if self.mode == ScanMode::Exhaustive {
            return false;
        }
        let Some(name) = name.to_str() else {
            return false;
        };
        self.skip_dirs
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, name))
    }

    /// Whether `dir` holds a chain.
    pub fn is_candidate(&self, dir: &Path) -> bool {
        let named_like_chain = dir.file_name() == Some(OsStr::new(&self.chain_dir));
        if self.mode == ScanMode::Conventional && !named_like_chain {
            return false;
        }
        dir.join(&self.pointer_file).is_file()
    }
}

/// Iterator over the candidate directories of one scan.
pub struct Candidates<'a> {
    scanner: &'a Scanner,
    walker: walkdir::IntoIter,
}

impl Iterator for Candidates<'_> {
    type Item = Result<PathBuf, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let err = ScanError::from(err);
                    warn!(path = %err.path(), error = %err, "scan error");
                    return Some(Err(err));
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.depth() > 0 && self.scanner.is_skipped(entry.file_name()) {
                trace!(path = %entry.path().display(), "skipping directory");
                self.walker.skip_current_dir();
                continue;
            }
            if self.scanner.is_candidate(entry.path()) {
                // A conventional chain directory never nests another unit.
                if self.scanner.mode == ScanMode::Conventional {
                    self.walker.skip_current_dir();
                }
                trace!(path = %entry.path().display(), "candidate unit");
                return Some(Ok(entry.into_path()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unit(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("max_migration.txt"), "0001_initial\n").unwrap();
    }

    fn scan(root: &Path, mode: ScanMode) -> Vec<PathBuf> {
        let mut config = EngineConfig::default();
        config.scan.mode = mode;
        Scanner::new(root, &config)
            .scan()
            .map(|r| r.unwrap().strip_prefix(root).unwrap().to_path_buf())
            .collect()
    }

    #[test]
    fn test_conventional_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_unit(&root.join("blog/migrations"));
        make_unit(&root.join("apps/shop/migrations"));
        make_unit(&root.join("node_modules/pkg/migrations"));
        make_unit(&root.join("venv/lib/django/migrations"));
        make_unit(&root.join("legacy/schema"));
        std::fs::create_dir_all(root.join("users/migrations")).unwrap();

        let found = scan(root, ScanMode::Conventional);
        assert_eq!(
            found,
            vec![
                PathBuf::from("apps/shop/migrations"),
                PathBuf::from("blog/migrations"),
            ]
        );
    }

    #[test]
    fn test_exhaustive_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_unit(&root.join("blog/migrations"));
        make_unit(&root.join("node_modules/pkg/migrations"));
        make_unit(&root.join("legacy/schema"));

        let found = scan(root, ScanMode::Exhaustive);
        assert_eq!(
            found,
            vec![
                PathBuf::from("blog/migrations"),
                PathBuf::from("legacy/schema"),
                PathBuf::from("node_modules/pkg/migrations"),
            ]
        );
    }

    #[test]
    fn test_glob_skip_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_unit(&root.join("pkg.egg-info/migrations"));
        make_unit(&root.join("core/migrations"));

        let found = scan(root, ScanMode::Conventional);
        assert_eq!(found, vec![PathBuf::from("core/migrations")]);
    }

    #[test]
    fn test_root_named_like_skip_dir_is_scanned() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("build");
        make_unit(&root.join("blog/migrations"));
        assert_eq!(scan(&root, ScanMode::Conventional).len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_unit(&root.join("blog/migrations"));
        std::os::unix::fs::symlink(root, root.join("blog/loop")).unwrap();

        let mut config = EngineConfig::default();
        config.scan.follow_symlinks = true;
        let results: Vec<_> = Scanner::new(root, &config).scan().collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ScanError::SymlinkLoop { .. }))));
    }
}
