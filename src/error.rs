//! Error taxonomy for the mutation pipeline
//!
//! Per-action failures (`AnchorNotFound`, `PostconditionUnmet`, `DiffApply`,
//! `MissingInstructions`) are recoverable at the orchestrator level. The rest
//! abort the operation that raised them.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NebulaError>;

#[derive(Error, Debug)]
pub enum NebulaError {
    #[error("Path escapes workspace: {} (root: {})", path.display(), root.display())]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("{} is not UTF-8 text", path.display())]
    NotText { path: PathBuf },

    #[error(
        "Could not recover JSON from a {response_len}-char response after every repair strategy. Preview: {snippet}"
    )]
    JsonRecovery { response_len: usize, snippet: String },

    #[error("Anchor not found in {}: {anchor}", path.display())]
    AnchorNotFound { path: PathBuf, anchor: String },

    #[error("Postcondition unmet in {}: result does not contain {expected:?}", path.display())]
    PostconditionUnmet { path: PathBuf, expected: String },

    #[error("Diff could not be applied to {}.\n{manual_fix}", path.display())]
    DiffApply { path: PathBuf, manual_fix: String },

    #[error("No edit instructions for {}: expected a patch, an anchor with content, or content", path.display())]
    MissingInstructions { path: PathBuf },

    #[error("Validation command `{command}` failed ({status}): {output}")]
    ShellValidation {
        command: String,
        status: String,
        output: String,
    },

    #[error("Rejected action #{index}: {reason}")]
    InvalidAction { index: usize, reason: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NebulaError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NebulaError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the orchestrator may try another strategy after this error.
    pub fn is_edit_miss(&self) -> bool {
        matches!(
            self,
            NebulaError::AnchorNotFound { .. } | NebulaError::PostconditionUnmet { .. }
        )
    }

    /// Short machine-friendly label, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            NebulaError::PathEscape { .. } => "path_escape",
            NebulaError::InvalidPath(_) => "invalid_path",
            NebulaError::NotText { .. } => "not_text",
            NebulaError::JsonRecovery { .. } => "json_recovery_failure",
            NebulaError::AnchorNotFound { .. } => "anchor_not_found",
            NebulaError::PostconditionUnmet { .. } => "postcondition_unmet",
            NebulaError::DiffApply { .. } => "diff_apply_failure",
            NebulaError::MissingInstructions { .. } => "missing_instructions",
            NebulaError::ShellValidation { .. } => "shell_validation_failure",
            NebulaError::InvalidAction { .. } => "invalid_action",
            NebulaError::Io { .. } => "io",
            NebulaError::Llm(_) => "llm",
            NebulaError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_misses_are_recoverable() {
        let miss = NebulaError::AnchorNotFound {
            path: PathBuf::from("a.rs"),
            anchor: "fn main".to_string(),
        };
        assert!(miss.is_edit_miss());

        let escape = NebulaError::PathEscape {
            path: PathBuf::from("../x"),
            root: PathBuf::from("/w"),
        };
        assert!(!escape.is_edit_miss());
        assert_eq!(escape.kind(), "path_escape");
    }

    #[test]
    fn diff_apply_message_embeds_manual_fix() {
        let err = NebulaError::DiffApply {
            path: PathBuf::from("src/lib.rs"),
            manual_fix: "Hunk 1: delete `old`".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("src/lib.rs"));
        assert!(text.contains("Hunk 1: delete `old`"));
    }
}
