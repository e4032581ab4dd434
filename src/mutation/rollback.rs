//! Rollback of recorded mutations
//!
//! Applied mutations are grouped by path. The latest mutation on a path fixes
//! its position in the replay (newest first); the restored state is the
//! `before` snapshot of the earliest applied mutation on that path, which is
//! the content the path had when the run started.

use super::{Mutation, MutationKind};
use crate::workspace::WorkspaceFs;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Paths whose prior content was written back
    pub restored: Vec<PathBuf>,
    /// Paths removed because they did not exist before the run
    pub removed: Vec<PathBuf>,
    /// Paths with nothing to restore (e.g. a deleted directory)
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct PathPlan<'a> {
    latest: usize,
    earliest: &'a Mutation,
}

/// Undo every applied mutation in `history`. Individual failures are
/// collected in the report; the remaining paths are still restored.
pub async fn rollback(fs: &WorkspaceFs, history: &[Mutation]) -> RollbackReport {
    let mut plans: HashMap<&Path, PathPlan<'_>> = HashMap::new();
    for (idx, mutation) in history.iter().enumerate().filter(|(_, m)| m.applied) {
        plans
            .entry(mutation.path.as_path())
            .and_modify(|plan| plan.latest = idx)
            .or_insert(PathPlan {
                latest: idx,
                earliest: mutation,
            });
    }

    let mut ordered: Vec<(&Path, PathPlan<'_>)> = plans.into_iter().collect();
    ordered.sort_by(|a, b| b.1.latest.cmp(&a.1.latest));

    let mut report = RollbackReport::default();
    for (path, plan) in ordered {
        let earliest = plan.earliest;
        let outcome = match (&earliest.before, &earliest.before_bytes, earliest.kind) {
            (Some(before), _, _) => fs
                .write_text(path, before)
                .await
                .map(|_| report.restored.push(path.to_path_buf())),
            (None, Some(bytes), _) => fs
                .write_bytes(path, bytes)
                .await
                .map(|_| report.restored.push(path.to_path_buf())),
            (None, None, MutationKind::Write) => fs
                .remove_recursive(path)
                .await
                .map(|_| report.removed.push(path.to_path_buf())),
            (None, None, MutationKind::Delete) => {
                report.skipped.push(path.to_path_buf());
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(path = %path.display(), error = %e, "rollback failed for path");
            report.failures.push(RollbackFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    }

    info!(
        restored = report.restored.len(),
        removed = report.removed.len(),
        failed = report.failures.len(),
        "rollback finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationRecorder;
    use crate::workspace::Workspace;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MutationRecorder) {
        let dir = tempdir().unwrap();
        let fs = WorkspaceFs::new(Workspace::new(dir.path()).unwrap());
        (dir, MutationRecorder::new(fs))
    }

    fn read(dir: &tempfile::TempDir, rel: &str) -> Option<String> {
        std::fs::read_to_string(dir.path().join(rel)).ok()
    }

    #[tokio::test]
    async fn restores_modified_and_removes_created_files() {
        let (dir, mut rec) = setup();
        std::fs::write(dir.path().join("existing.txt"), "original").unwrap();

        rec.write(Path::new("existing.txt"), "changed").await.unwrap();
        rec.write(Path::new("new/created.txt"), "fresh").await.unwrap();

        let report = rollback(rec.fs(), rec.history()).await;
        assert!(report.is_clean());
        assert_eq!(read(&dir, "existing.txt").as_deref(), Some("original"));
        assert_eq!(read(&dir, "new/created.txt"), None);
        assert_eq!(report.restored, vec![PathBuf::from("existing.txt")]);
        assert_eq!(report.removed, vec![PathBuf::from("new/created.txt")]);
    }

    #[tokio::test]
    async fn recreates_deleted_files() {
        let (dir, mut rec) = setup();
        std::fs::write(dir.path().join("doomed.txt"), "still here").unwrap();

        rec.delete(Path::new("doomed.txt")).await.unwrap();
        assert_eq!(read(&dir, "doomed.txt"), None);

        let report = rollback(rec.fs(), rec.history()).await;
        assert!(report.is_clean());
        assert_eq!(read(&dir, "doomed.txt").as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn deleted_binary_file_is_restored_byte_for_byte() {
        let (dir, mut rec) = setup();
        let raw = [0x63, 0x61, 0x66, 0xE9, 0x0A, 0xFF, 0x00, 0x01];
        std::fs::write(dir.path().join("blob.bin"), raw).unwrap();

        let deleted = rec.delete(Path::new("blob.bin")).await.unwrap();
        assert!(deleted.applied);
        assert_eq!(deleted.before, None);
        assert!(!dir.path().join("blob.bin").exists());

        let report = rollback(rec.fs(), rec.history()).await;
        assert!(report.is_clean());
        assert_eq!(report.restored, vec![PathBuf::from("blob.bin")]);
        assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), raw);
    }

    #[tokio::test]
    async fn multiply_written_path_returns_to_pre_run_content() {
        let (dir, mut rec) = setup();
        std::fs::write(dir.path().join("a.txt"), "v0").unwrap();

        rec.write(Path::new("a.txt"), "v1").await.unwrap();
        rec.write(Path::new("a.txt"), "v2").await.unwrap();
        rec.delete(Path::new("a.txt")).await.unwrap();

        let report = rollback(rec.fs(), rec.history()).await;
        assert_eq!(read(&dir, "a.txt").as_deref(), Some("v0"));
        assert_eq!(report.restored.len(), 1);
    }

    #[tokio::test]
    async fn unapplied_mutations_are_ignored() {
        let dir = tempdir().unwrap();
        let fs = WorkspaceFs::new(Workspace::new(dir.path()).unwrap());
        let mut rec = MutationRecorder::new(fs).with_dry_run(true);
        std::fs::write(dir.path().join("a.txt"), "disk").unwrap();

        rec.write(Path::new("a.txt"), "simulated").await.unwrap();
        let report = rollback(rec.fs(), rec.history()).await;
        assert_eq!(report, RollbackReport::default());
        assert_eq!(read(&dir, "a.txt").as_deref(), Some("disk"));
    }

    #[tokio::test]
    async fn disjoint_paths_restore_regardless_of_order() {
        let (dir, mut rec) = setup();
        for name in ["x.txt", "y.txt", "z.txt"] {
            std::fs::write(dir.path().join(name), format!("orig-{name}")).unwrap();
        }
        rec.write(Path::new("z.txt"), "1").await.unwrap();
        rec.write(Path::new("x.txt"), "2").await.unwrap();
        rec.write(Path::new("y.txt"), "3").await.unwrap();

        let mut shuffled = rec.history().to_vec();
        shuffled.reverse();
        rollback(rec.fs(), &shuffled).await;

        for name in ["x.txt", "y.txt", "z.txt"] {
            assert_eq!(read(&dir, name), Some(format!("orig-{name}")));
        }
    }

    #[tokio::test]
    async fn failure_on_one_path_does_not_stop_others() {
        let (dir, mut rec) = setup();
        std::fs::write(dir.path().join("ok.txt"), "ok-orig").unwrap();
        rec.write(Path::new("ok.txt"), "changed").await.unwrap();

        let mut history = rec.history().to_vec();
        let mut bogus = history[0].clone();
        bogus.path = PathBuf::from("../escape.txt");
        history.push(bogus);

        let report = rollback(rec.fs(), &history).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("../escape.txt"));
        assert_eq!(read(&dir, "ok.txt").as_deref(), Some("ok-orig"));
    }
}
