//! Mutation orchestration
//!
//! Turns validated [`EditAction`]s into recorded mutations, choosing an edit
//! strategy per action. One action failing never stops its siblings.

use crate::action::{EditAction, ImplementationPayload};
use crate::anchor::{apply_anchor_edit, check_postcondition};
use crate::diff::{apply_unified_diff, DiffOptions, DiffStrategy};
use crate::error::{NebulaError, Result};
use crate::mutation::{Mutation, MutationRecorder};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How a successful action produced its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditStrategy {
    Overwrite,
    Anchor,
    Diff { diff: DiffStrategy },
    AnchorThenDiff { diff: DiffStrategy },
    Delete,
}

impl fmt::Display for EditStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditStrategy::Overwrite => write!(f, "overwrite"),
            EditStrategy::Anchor => write!(f, "anchor"),
            EditStrategy::Diff { diff } => write!(f, "{}", diff),
            EditStrategy::AnchorThenDiff { diff } => write!(f, "anchor missed, {}", diff),
            EditStrategy::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied {
        mutation: Mutation,
        strategy: EditStrategy,
    },
    Failed {
        error_kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub index: usize,
    pub action: String,
    pub path: Option<PathBuf>,
    pub outcome: ActionOutcome,
}

impl ActionReport {
    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub actions: Vec<ActionReport>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|a| a.is_applied())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|a| !a.is_applied())
    }

    pub fn all_succeeded(&self) -> bool {
        self.actions.iter().all(ActionReport::is_applied)
    }

    /// Paths touched by mutations that actually reached the disk.
    pub fn changed_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        for report in &self.actions {
            if let ActionOutcome::Applied { mutation, .. } = &report.outcome {
                if mutation.applied && !paths.contains(&mutation.path.as_path()) {
                    paths.push(&mutation.path);
                }
            }
        }
        paths
    }
}

pub struct MutationOrchestrator<'a> {
    recorder: &'a mut MutationRecorder,
    diff_options: DiffOptions,
}

impl<'a> MutationOrchestrator<'a> {
    pub fn new(recorder: &'a mut MutationRecorder, diff_options: DiffOptions) -> Self {
        Self {
            recorder,
            diff_options,
        }
    }

    /// Apply every action of a payload in order. Actions rejected during
    /// narrowing are reported as failures at their original index.
    pub async fn apply_payload(&mut self, payload: &ImplementationPayload) -> ApplyReport {
        let mut report = ApplyReport::default();

        for rejected in &payload.rejected {
            let error = NebulaError::InvalidAction {
                index: rejected.index,
                reason: rejected.reason.clone(),
            };
            report.actions.push(ActionReport {
                index: rejected.index,
                action: "invalid".to_string(),
                path: rejected.path.clone(),
                outcome: failed(&error),
            });
        }

        // Rejected actions keep their index; applied ones fill the gaps.
        let mut taken: Vec<usize> = payload.rejected.iter().map(|r| r.index).collect();
        let mut next_index = 0;
        for action in &payload.actions {
            while taken.contains(&next_index) {
                next_index += 1;
            }
            taken.push(next_index);

            let outcome = match self.apply_action(action).await {
                Ok((mutation, strategy)) => ActionOutcome::Applied { mutation, strategy },
                Err(e) => {
                    warn!(path = %action.path().display(), error = %e, "action failed");
                    failed(&e)
                }
            };
            report.actions.push(ActionReport {
                index: next_index,
                action: action.label().to_string(),
                path: Some(action.path().to_path_buf()),
                outcome,
            });
        }

        report.actions.sort_by_key(|a| a.index);
        report
    }

    pub async fn apply_action(&mut self, action: &EditAction) -> Result<(Mutation, EditStrategy)> {
        let postcondition = action.postcondition();
        match action {
            EditAction::WriteFile { path, content, .. } => {
                check_postcondition(path, content, postcondition)?;
                let mutation = self.recorder.write(path, content).await?;
                Ok((mutation, EditStrategy::Overwrite))
            }
            EditAction::DeletePath { path } => {
                let mutation = self.recorder.delete(path).await?;
                Ok((mutation, EditStrategy::Delete))
            }
            EditAction::ModifyFile {
                path,
                patch,
                anchor,
                content,
                ..
            } => {
                let original = self.recorder.current_text(path).await?.unwrap_or_default();

                let (updated, strategy) = if let Some(anchor) = anchor {
                    match apply_anchor_edit(path, &original, anchor, postcondition) {
                        Ok(updated) => (updated, EditStrategy::Anchor),
                        Err(e) if e.is_edit_miss() && patch.is_some() => {
                            debug!(path = %path.display(), error = %e, "anchor edit missed, trying diff");
                            let patch = patch.as_deref().unwrap_or_default();
                            let (updated, diff) = self.diff(path, &original, patch, postcondition)?;
                            (updated, EditStrategy::AnchorThenDiff { diff })
                        }
                        Err(e) => return Err(e),
                    }
                } else if let Some(patch) = patch {
                    let (updated, diff) = self.diff(path, &original, patch, postcondition)?;
                    (updated, EditStrategy::Diff { diff })
                } else if let Some(content) = content {
                    check_postcondition(path, content, postcondition)?;
                    (content.clone(), EditStrategy::Overwrite)
                } else {
                    return Err(NebulaError::MissingInstructions { path: path.clone() });
                };

                let mutation = self.recorder.write(path, &updated).await?;
                Ok((mutation, strategy))
            }
        }
    }

    fn diff(
        &self,
        path: &Path,
        original: &str,
        patch: &str,
        postcondition: Option<&str>,
    ) -> Result<(String, DiffStrategy)> {
        let outcome = apply_unified_diff(path, original, patch, self.diff_options)?;
        check_postcondition(path, &outcome.content, postcondition)?;
        Ok((outcome.content, outcome.strategy))
    }
}

fn failed(error: &NebulaError) -> ActionOutcome {
    ActionOutcome::Failed {
        error_kind: error.kind().to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{AnchorEdit, AnchorMode, AnchorSpec};
    use crate::workspace::{Workspace, WorkspaceFs};
    use tempfile::tempdir;

    fn recorder(root: &Path) -> MutationRecorder {
        MutationRecorder::new(WorkspaceFs::new(Workspace::new(root).unwrap()))
    }

    fn read(root: &Path, rel: &str) -> String {
        std::fs::read_to_string(root.join(rel)).unwrap()
    }

    #[tokio::test]
    async fn write_file_payload_creates_file() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let payload = ImplementationPayload::from_response(
            r#"{"actions":[{"type":"write_file","path":"a.txt","content":"hello"}]}"#,
        )
        .unwrap();

        let report = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_payload(&payload)
            .await;
        assert!(report.all_succeeded());
        assert_eq!(read(dir.path(), "a.txt"), "hello");

        let mutation = &rec.history()[0];
        assert_eq!(mutation.before, None);
        assert_eq!(mutation.after.as_deref(), Some("hello"));
        assert!(mutation.applied);
    }

    #[tokio::test]
    async fn anchor_insert_after() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "foo").unwrap();
        let mut rec = recorder(dir.path());
        let action = EditAction::ModifyFile {
            path: PathBuf::from("f.txt"),
            patch: None,
            anchor: Some(AnchorEdit {
                spec: AnchorSpec::exact("foo"),
                mode: AnchorMode::InsertAfter,
                text: "bar".to_string(),
            }),
            content: None,
            ensure_postcondition: Some("foobar".to_string()),
        };

        let (_, strategy) = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_action(&action)
            .await
            .unwrap();
        assert_eq!(strategy, EditStrategy::Anchor);
        assert_eq!(read(dir.path(), "f.txt"), "foobar");
    }

    #[tokio::test]
    async fn anchor_miss_falls_back_to_diff() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\n").unwrap();
        let mut rec = recorder(dir.path());
        let action = EditAction::ModifyFile {
            path: PathBuf::from("f.txt"),
            patch: Some("@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n".to_string()),
            anchor: Some(AnchorEdit {
                spec: AnchorSpec::exact("not present"),
                mode: AnchorMode::Replace,
                text: "x".to_string(),
            }),
            content: None,
            ensure_postcondition: None,
        };

        let (_, strategy) = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_action(&action)
            .await
            .unwrap();
        assert!(matches!(strategy, EditStrategy::AnchorThenDiff { .. }));
        assert_eq!(read(dir.path(), "f.txt"), "a\nB\nc\n");
    }

    #[tokio::test]
    async fn anchor_miss_without_patch_writes_nothing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "original").unwrap();
        let mut rec = recorder(dir.path());
        let action = EditAction::ModifyFile {
            path: PathBuf::from("f.txt"),
            patch: None,
            anchor: Some(AnchorEdit {
                spec: AnchorSpec::exact("missing"),
                mode: AnchorMode::Replace,
                text: "x".to_string(),
            }),
            content: Some("would overwrite".to_string()),
            ensure_postcondition: None,
        };

        let err = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_action(&action)
            .await
            .unwrap_err();
        assert!(matches!(err, NebulaError::AnchorNotFound { .. }));
        assert!(rec.history().is_empty());
        assert_eq!(read(dir.path(), "f.txt"), "original");
    }

    #[tokio::test]
    async fn failures_do_not_stop_siblings() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let payload = ImplementationPayload::from_response(
            r#"{"actions":[
                {"type":"write_file","path":"../escape.txt","content":"x"},
                {"type":"bogus","path":"b.txt"},
                {"type":"modify_file","path":"c.txt"},
                {"type":"write_file","path":"d.txt","content":"ok"}
            ]}"#,
        )
        .unwrap();

        let report = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_payload(&payload)
            .await;

        let kinds: Vec<(usize, bool)> = report
            .actions
            .iter()
            .map(|a| (a.index, a.is_applied()))
            .collect();
        assert_eq!(kinds, vec![(0, false), (1, false), (2, false), (3, true)]);

        let error_kind = |i: usize| match &report.actions[i].outcome {
            ActionOutcome::Failed { error_kind, .. } => error_kind.clone(),
            ActionOutcome::Applied { .. } => String::new(),
        };
        assert_eq!(error_kind(0), "path_escape");
        assert_eq!(error_kind(1), "invalid_action");
        assert_eq!(error_kind(2), "missing_instructions");
        assert_eq!(read(dir.path(), "d.txt"), "ok");
        assert_eq!(report.changed_paths(), vec![Path::new("d.txt")]);
    }

    #[tokio::test]
    async fn write_postcondition_is_enforced() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let action = EditAction::WriteFile {
            path: PathBuf::from("a.txt"),
            content: "hello".to_string(),
            ensure_postcondition: Some("goodbye".to_string()),
        };
        let err = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_action(&action)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "postcondition_unmet");
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn sequential_modifications_see_earlier_writes_in_dry_run() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one\n").unwrap();
        let mut rec = recorder(dir.path()).with_dry_run(true);
        let payload = ImplementationPayload::from_response(
            r#"{"actions":[
                {"type":"modify_file","path":"f.txt","anchor":"one","mode":"insert_after","snippet":"\ntwo"},
                {"type":"modify_file","path":"f.txt","anchor":"two","mode":"insert_after","snippet":"\nthree"}
            ]}"#,
        )
        .unwrap();

        let report = MutationOrchestrator::new(&mut rec, DiffOptions::default())
            .apply_payload(&payload)
            .await;
        assert!(report.all_succeeded());
        assert_eq!(rec.history()[1].after.as_deref(), Some("one\ntwo\nthree\n"));
        assert_eq!(read(dir.path(), "f.txt"), "one\n");
        assert!(report.changed_paths().is_empty());
    }
}
