//! Agent pipeline
//!
//! A run is a fixed sequence of agent stages sharing one typed
//! [`RunContext`]: plan, implement, apply, validate (with rollback on
//! failure), then the advisory agents concurrently, then the report. A stage
//! that fails records why in the context; the report is always produced.

pub mod advisors;
pub mod implementer;
pub mod planner;
pub mod reporter;
pub mod validator;
mod pipeline;

pub use pipeline::{apply_response, Pipeline, PipelineSettings};
pub use planner::Plan;

use crate::action::ImplementationPayload;
use crate::error::NebulaError;
use crate::llm::Usage;
use crate::mutation::RollbackReport;
use crate::orchestrator::ApplyReport;
use crate::workspace::WorkspaceFs;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;
use validator::ValidationOutcome;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Plan,
    Implement,
    Validate,
    Analyze,
    Optimize,
    GenerateTests,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Plan => "planner",
            Stage::Implement => "implementer",
            Stage::Validate => "validator",
            Stage::Analyze => "analyzer",
            Stage::Optimize => "optimizer",
            Stage::GenerateTests => "test generator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

/// Free-text output of an advisory agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentNote {
    pub stage: Stage,
    pub text: String,
}

/// State threaded through every stage of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub request: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub plan: Option<Plan>,
    pub implementation: Option<ImplementationPayload>,
    pub apply_report: Option<ApplyReport>,
    pub validation: Option<ValidationOutcome>,
    pub rollback: Option<RollbackReport>,
    pub notes: Vec<AgentNote>,
    pub test_report: Option<ApplyReport>,
    pub failures: Vec<StageFailure>,
    pub usage: Usage,
}

impl RunContext {
    pub fn new(request: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request: request.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            plan: None,
            implementation: None,
            apply_report: None,
            validation: None,
            rollback: None,
            notes: Vec::new(),
            test_report: None,
            failures: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn record_failure(&mut self, stage: Stage, error: &NebulaError) {
        self.record_error(stage, error.kind(), error.to_string());
    }

    pub fn record_error(&mut self, stage: Stage, kind: &str, message: impl Into<String>) {
        let message = message.into();
        debug!(stage = stage.label(), kind, "stage failed");
        self.failures.push(StageFailure {
            stage,
            kind: kind.to_string(),
            message,
        });
    }

    pub fn add_usage(&mut self, usage: Option<&Usage>) {
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// No stage failed, every action applied, and nothing was rolled back.
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
            && self.rollback.is_none()
            && self
                .apply_report
                .as_ref()
                .is_some_and(ApplyReport::all_succeeded)
    }
}

const SKIPPED_DIRS: [&str; 6] = [".git", "target", "node_modules", "dist", "build", ".venv"];

/// Sorted listing of workspace files for prompts, capped at `limit` entries.
pub fn summarize_workspace(root: &Path, limit: usize) -> String {
    let mut files: Vec<String> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0 || !(entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();

    let total = files.len();
    let mut summary = files.into_iter().take(limit).collect::<Vec<_>>().join("\n");
    if total > limit {
        summary.push_str(&format!("\n... and {} more files", total - limit));
    }
    summary
}

/// A file handed to an agent as prompt context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub content: String,
}

/// Read the listed files that exist, each truncated to `max_chars`. Paths
/// that do not resolve inside the workspace are skipped.
pub async fn read_snapshots<P: AsRef<Path>>(
    fs: &WorkspaceFs,
    paths: &[P],
    max_chars: usize,
) -> Vec<FileSnapshot> {
    let mut snapshots = Vec::new();
    for path in paths {
        let path = path.as_ref();
        match fs.read_text(path).await {
            Ok(Some(content)) => snapshots.push(FileSnapshot {
                path: path.to_path_buf(),
                content: crate::util::truncate(&content, max_chars),
            }),
            Ok(None) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "skipping context file"),
        }
    }
    snapshots
}

/// Render snapshots as fenced blocks for a prompt.
pub fn format_snapshots(snapshots: &[FileSnapshot]) -> String {
    let mut out = String::new();
    for snapshot in snapshots {
        out.push_str(&format!(
            "FILE: {}\n```\n{}\n```\n\n",
            snapshot.path.display(),
            snapshot.content
        ));
    }
    out
}
