//! Edit actions requested by the implementer
//!
//! The model emits loosely-shaped JSON. It is narrowed here, once, into the
//! [`EditAction`] union; nothing downstream looks at raw JSON again.

use crate::error::Result;
use crate::recovery::{expand_patches, recover_json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Literal and/or regex marker locating an edit point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl AnchorSpec {
    pub fn exact(text: impl Into<String>) -> Self {
        Self {
            exact: Some(text.into()),
            regex: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
        blank(&self.exact) && blank(&self.regex)
    }

    /// Human-readable form used in errors and reports.
    pub fn describe(&self) -> String {
        match (&self.exact, &self.regex) {
            (Some(exact), Some(regex)) => format!("/{}/ or {:?}", regex, exact),
            (Some(exact), None) => format!("{:?}", exact),
            (None, Some(regex)) => format!("/{}/", regex),
            (None, None) => "<empty anchor>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMode {
    Replace,
    InsertBefore,
    InsertAfter,
}

impl AnchorMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "replace" => Some(AnchorMode::Replace),
            "insert_before" | "insertbefore" | "before" => Some(AnchorMode::InsertBefore),
            "insert_after" | "insertafter" | "after" => Some(AnchorMode::InsertAfter),
            _ => None,
        }
    }
}

/// An anchor plus the text to splice at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorEdit {
    pub spec: AnchorSpec,
    pub mode: AnchorMode,
    /// `replacement` for replace mode, `snippet` for the insert modes
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditAction {
    WriteFile {
        path: PathBuf,
        content: String,
        ensure_postcondition: Option<String>,
    },
    ModifyFile {
        path: PathBuf,
        patch: Option<String>,
        anchor: Option<AnchorEdit>,
        content: Option<String>,
        ensure_postcondition: Option<String>,
    },
    DeletePath {
        path: PathBuf,
    },
}

impl EditAction {
    pub fn path(&self) -> &Path {
        match self {
            EditAction::WriteFile { path, .. }
            | EditAction::ModifyFile { path, .. }
            | EditAction::DeletePath { path } => path,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EditAction::WriteFile { .. } => "write_file",
            EditAction::ModifyFile { .. } => "modify_file",
            EditAction::DeletePath { .. } => "delete_path",
        }
    }

    pub fn postcondition(&self) -> Option<&str> {
        match self {
            EditAction::WriteFile {
                ensure_postcondition,
                ..
            }
            | EditAction::ModifyFile {
                ensure_postcondition,
                ..
            } => ensure_postcondition.as_deref(),
            EditAction::DeletePath { .. } => None,
        }
    }
}

/// An action that failed narrowing and never reached the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedAction {
    pub index: usize,
    pub path: Option<PathBuf>,
    pub reason: String,
}

/// The implementer's output: actions to apply plus free-text notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImplementationPayload {
    pub actions: Vec<EditAction>,
    pub notes: String,
    pub rejected: Vec<RejectedAction>,
}

impl ImplementationPayload {
    /// Recover JSON from raw model text and narrow it.
    pub fn from_response(raw: &str) -> Result<Self> {
        Ok(Self::from_value(recover_json(raw)?))
    }

    pub fn from_value(mut value: Value) -> Self {
        expand_patches(&mut value);

        let notes = match value.get("notes") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };

        let mut payload = ImplementationPayload {
            notes,
            ..Default::default()
        };

        let raw_actions = match value.get("actions") {
            Some(Value::Array(items)) => items.clone(),
            Some(single @ Value::Object(_)) => vec![single.clone()],
            _ => Vec::new(),
        };

        for (index, raw) in raw_actions.into_iter().enumerate() {
            let path_hint = raw
                .get("path")
                .and_then(Value::as_str)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from);
            match narrow_action(raw) {
                Ok(action) => payload.actions.push(action),
                Err(reason) => payload.rejected.push(RejectedAction {
                    index,
                    path: path_hint,
                    reason,
                }),
            }
        }
        payload
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAction {
    #[serde(rename = "type", alias = "kind", alias = "action", alias = "op")]
    kind: Option<String>,
    #[serde(alias = "file", alias = "file_path", alias = "filePath")]
    path: Option<String>,
    content: Option<Value>,
    #[serde(alias = "diff")]
    patch: Option<String>,
    anchor: Option<RawAnchor>,
    mode: Option<String>,
    snippet: Option<String>,
    replacement: Option<String>,
    #[serde(rename = "ensurePostcondition", alias = "ensure_postcondition")]
    ensure_postcondition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAnchor {
    Text(String),
    Spec {
        #[serde(default)]
        exact: Option<String>,
        #[serde(default)]
        regex: Option<String>,
    },
}

enum ActionKind {
    Write,
    Modify,
    Delete,
}

fn parse_kind(raw: &str) -> Option<ActionKind> {
    match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
        "write_file" | "write" | "create_file" | "create" => Some(ActionKind::Write),
        "modify_file" | "modify" | "edit_file" | "edit" | "patch_file" | "update_file" => {
            Some(ActionKind::Modify)
        }
        "delete_path" | "delete" | "delete_file" | "remove" | "remove_file" => {
            Some(ActionKind::Delete)
        }
        _ => None,
    }
}

/// Content may arrive as a string or, for JSON files, as a structured value.
fn content_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => serde_json::to_string_pretty(&other).ok().map(|s| s + "\n"),
    }
}

fn narrow_action(raw: Value) -> std::result::Result<EditAction, String> {
    let raw: RawAction =
        serde_json::from_value(raw).map_err(|e| format!("malformed action: {}", e))?;

    let path = raw
        .path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| "action has no path".to_string())?;

    let kind_text = raw
        .kind
        .as_deref()
        .ok_or_else(|| "action has no type".to_string())?;
    let kind = parse_kind(kind_text).ok_or_else(|| format!("unknown action type {:?}", kind_text))?;

    let ensure_postcondition = raw.ensure_postcondition.filter(|s| !s.is_empty());
    let content = content_text(raw.content);

    match kind {
        ActionKind::Delete => Ok(EditAction::DeletePath { path }),
        ActionKind::Write => {
            let content = content.ok_or_else(|| "write_file requires content".to_string())?;
            Ok(EditAction::WriteFile {
                path,
                content,
                ensure_postcondition,
            })
        }
        ActionKind::Modify => {
            let spec = match raw.anchor {
                Some(RawAnchor::Text(exact)) => Some(AnchorSpec::exact(exact)),
                Some(RawAnchor::Spec { exact, regex }) => Some(AnchorSpec { exact, regex }),
                None => None,
            }
            .filter(|spec| !spec.is_empty());

            let mode = match raw.mode.as_deref() {
                Some(m) => Some(AnchorMode::parse(m).ok_or_else(|| format!("unknown anchor mode {:?}", m))?),
                None => None,
            };

            let anchor = match spec {
                Some(spec) => {
                    let mode = mode.unwrap_or(if raw.replacement.is_some() {
                        AnchorMode::Replace
                    } else {
                        AnchorMode::InsertAfter
                    });
                    let text = match mode {
                        AnchorMode::Replace => raw
                            .replacement
                            .clone()
                            .or_else(|| raw.snippet.clone())
                            .or_else(|| content.clone()),
                        AnchorMode::InsertBefore | AnchorMode::InsertAfter => raw
                            .snippet
                            .clone()
                            .or_else(|| raw.replacement.clone())
                            .or_else(|| content.clone()),
                    };
                    text.map(|text| AnchorEdit { spec, mode, text })
                }
                None => None,
            };

            Ok(EditAction::ModifyFile {
                path,
                patch: raw.patch.filter(|p| !p.trim().is_empty()),
                anchor,
                content,
                ensure_postcondition,
            })
        }
    }
}
