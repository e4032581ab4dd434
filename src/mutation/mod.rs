//! Mutation recording
//!
//! Every write or delete the pipeline performs goes through
//! [`MutationRecorder`], which snapshots the prior content, honors dry-run and
//! an optional approval gate, and keeps the history that rollback replays.

pub mod rollback;

use crate::error::{NebulaError, Result};
use crate::workspace::{EntryKind, WorkspaceFs};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use rollback::{rollback, RollbackFailure, RollbackReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Write,
    Delete,
}

/// Why a mutation was recorded without touching the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Declined,
    DryRun,
}

/// A recorded write or delete. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: Uuid,
    pub kind: MutationKind,
    /// Workspace-relative path
    pub path: PathBuf,
    /// Content before the mutation (`None` if no file existed)
    pub before: Option<String>,
    /// Raw prior bytes of a deleted file that was not UTF-8 text
    #[serde(skip)]
    pub before_bytes: Option<Vec<u8>>,
    /// Content after the mutation (writes only)
    pub after: Option<String>,
    pub applied: bool,
    pub reason: Option<SkipReason>,
    pub recorded_at: DateTime<Utc>,
}

/// What an approval gate gets to look at before a mutation is committed.
#[derive(Debug, Clone, Copy)]
pub struct MutationPreview<'a> {
    pub kind: MutationKind,
    pub path: &'a Path,
    pub before: Option<&'a str>,
    pub after: Option<&'a str>,
}

impl MutationPreview<'_> {
    /// Unified diff of `before -> after`, or a deletion notice.
    pub fn unified_diff(&self) -> String {
        let label = self.path.display().to_string();
        match self.kind {
            MutationKind::Delete => match self.before {
                Some(before) => format!(
                    "delete {} ({} lines)",
                    label,
                    before.lines().count()
                ),
                None => format!("delete {}", label),
            },
            MutationKind::Write => {
                let before = self.before.unwrap_or("");
                let after = self.after.unwrap_or("");
                let old_header = if self.before.is_some() {
                    format!("a/{}", label)
                } else {
                    "/dev/null".to_string()
                };
                let new_header = format!("b/{}", label);
                let diff = TextDiff::from_lines(before, after);
                diff.unified_diff()
                    .context_radius(3)
                    .header(&old_header, &new_header)
                    .to_string()
            }
        }
    }
}

/// Caller-supplied predicate consulted before each mutation is committed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, preview: &MutationPreview<'_>) -> bool;
}

pub struct MutationRecorder {
    fs: WorkspaceFs,
    dry_run: bool,
    approval: Option<Arc<dyn ApprovalGate>>,
    history: Vec<Mutation>,
}

impl MutationRecorder {
    pub fn new(fs: WorkspaceFs) -> Self {
        Self {
            fs,
            dry_run: false,
            approval: None,
            history: Vec::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn fs(&self) -> &WorkspaceFs {
        &self.fs
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// All mutations recorded so far, in chronological order.
    pub fn history(&self) -> &[Mutation] {
        &self.history
    }

    pub fn applied(&self) -> impl Iterator<Item = &Mutation> {
        self.history.iter().filter(|m| m.applied)
    }

    /// Current content of a path; a dry run sees its own simulated writes.
    pub async fn current_text(&self, path: &Path) -> Result<Option<String>> {
        if self.dry_run {
            let relative = self.relative(path)?;
            if let Some(last) = self.history.iter().rev().find(|m| m.path == relative) {
                return Ok(match last.kind {
                    MutationKind::Write => last.after.clone(),
                    MutationKind::Delete => None,
                });
            }
        }
        self.fs.read_text(path).await
    }

    pub async fn write(&mut self, path: &Path, content: &str) -> Result<Mutation> {
        let relative = self.relative(path)?;
        if self.fs.stat(&relative).await? == Some(EntryKind::Directory) {
            return Err(NebulaError::InvalidPath(format!(
                "{} is a directory",
                relative.display()
            )));
        }
        let before = self.current_text(&relative).await?;

        let preview = MutationPreview {
            kind: MutationKind::Write,
            path: &relative,
            before: before.as_deref(),
            after: Some(content),
        };
        let reason = self.gate(&preview).await;
        if reason.is_none() {
            self.fs.write_text(&relative, content).await?;
            info!(path = %relative.display(), bytes = content.len(), "wrote file");
        }

        Ok(self.record(
            MutationKind::Write,
            relative,
            (before, None),
            Some(content.to_string()),
            reason,
        ))
    }

    pub async fn delete(&mut self, path: &Path) -> Result<Mutation> {
        let relative = self.relative(path)?;
        let (before, before_bytes) = match self.fs.stat(&relative).await? {
            Some(EntryKind::File) => match self.current_text(&relative).await {
                Ok(text) => (text, None),
                Err(NebulaError::NotText { .. }) => (None, self.fs.read_bytes(&relative).await?),
                Err(e) => return Err(e),
            },
            _ => (None, None),
        };

        let preview = MutationPreview {
            kind: MutationKind::Delete,
            path: &relative,
            before: before.as_deref(),
            after: None,
        };
        let reason = self.gate(&preview).await;
        if reason.is_none() {
            let existed = self.fs.remove_recursive(&relative).await?;
            info!(path = %relative.display(), existed, "deleted path");
        }

        Ok(self.record(
            MutationKind::Delete,
            relative,
            (before, before_bytes),
            None,
            reason,
        ))
    }

    fn relative(&self, path: &Path) -> Result<PathBuf> {
        let workspace = self.fs.workspace();
        let absolute = workspace.resolve(path)?;
        Ok(workspace.relative(&absolute))
    }

    async fn gate(&self, preview: &MutationPreview<'_>) -> Option<SkipReason> {
        if self.dry_run {
            debug!(path = %preview.path.display(), "dry run, mutation simulated");
            return Some(SkipReason::DryRun);
        }
        if let Some(gate) = &self.approval {
            if !gate.approve(preview).await {
                warn!(path = %preview.path.display(), "mutation declined");
                return Some(SkipReason::Declined);
            }
        }
        None
    }

    fn record(
        &mut self,
        kind: MutationKind,
        path: PathBuf,
        (before, before_bytes): (Option<String>, Option<Vec<u8>>),
        after: Option<String>,
        reason: Option<SkipReason>,
    ) -> Mutation {
        let mutation = Mutation {
            id: Uuid::new_v4(),
            kind,
            path,
            before,
            before_bytes,
            after,
            applied: reason.is_none(),
            reason,
            recorded_at: Utc::now(),
        };
        self.history.push(mutation.clone());
        mutation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use tempfile::tempdir;

    struct Decline;

    #[async_trait]
    impl ApprovalGate for Decline {
        async fn approve(&self, _preview: &MutationPreview<'_>) -> bool {
            false
        }
    }

    fn recorder(root: &Path) -> MutationRecorder {
        MutationRecorder::new(WorkspaceFs::new(Workspace::new(root).unwrap()))
    }

    #[tokio::test]
    async fn write_records_before_and_after() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let mut rec = recorder(dir.path());

        let m = rec.write(Path::new("a.txt"), "new").await.unwrap();
        assert!(m.applied);
        assert_eq!(m.before.as_deref(), Some("old"));
        assert_eq!(m.after.as_deref(), Some("new"));
        assert_eq!(m.reason, None);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn repeated_write_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());

        let first = rec.write(Path::new("a.txt"), "same").await.unwrap();
        let second = rec.write(Path::new("a.txt"), "same").await.unwrap();
        assert!(first.applied && second.applied);
        assert_eq!(first.before, None);
        assert_eq!(second.before, second.after);
        assert_eq!(rec.history().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_leaves_disk_untouched() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path()).with_dry_run(true);

        let m = rec.write(Path::new("a.txt"), "hello").await.unwrap();
        assert!(!m.applied);
        assert_eq!(m.reason, Some(SkipReason::DryRun));
        assert!(!dir.path().join("a.txt").exists());

        // later reads in the same dry run see the simulated content
        let current = rec.current_text(Path::new("a.txt")).await.unwrap();
        assert_eq!(current.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn declined_mutation_is_recorded_not_applied() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        let mut rec = recorder(dir.path()).with_approval(Arc::new(Decline));

        let m = rec.delete(Path::new("keep.txt")).await.unwrap();
        assert!(!m.applied);
        assert_eq!(m.reason, Some(SkipReason::Declined));
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn delete_captures_prior_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        let mut rec = recorder(dir.path());

        let m = rec.delete(Path::new("gone.txt")).await.unwrap();
        assert!(m.applied);
        assert_eq!(m.kind, MutationKind::Delete);
        assert_eq!(m.before.as_deref(), Some("bye"));
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn write_over_non_utf8_file_is_refused() {
        let dir = tempdir().unwrap();
        let raw = [0xFF, 0xFE, 0x00, 0x41];
        std::fs::write(dir.path().join("data.bin"), raw).unwrap();
        let mut rec = recorder(dir.path());

        let err = rec.write(Path::new("data.bin"), "text").await.unwrap_err();
        assert!(matches!(err, NebulaError::NotText { .. }));
        assert!(rec.history().is_empty());
        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), raw);
    }

    #[tokio::test]
    async fn escaping_write_touches_nothing() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let err = rec.write(Path::new("../outside.txt"), "x").await.unwrap_err();
        assert!(matches!(err, NebulaError::PathEscape { .. }));
        assert!(rec.history().is_empty());
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[test]
    fn preview_renders_unified_diff() {
        let preview = MutationPreview {
            kind: MutationKind::Write,
            path: Path::new("src/lib.rs"),
            before: Some("a\nb\n"),
            after: Some("a\nc\n"),
        };
        let diff = preview.unified_diff();
        assert!(diff.contains("--- a/src/lib.rs"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }
}
