use crate::llm::prompts::PLANNER_SYSTEM;
use crate::llm::{ChatMessage, Completion, CompletionOptions, LlmClient};
use crate::recovery::recover_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// The planner's output. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Plan {
    /// Build a plan from a recovered JSON value. Steps given as objects are
    /// flattened to their `description`/`step` text.
    pub fn from_value(value: &Value) -> Self {
        let text_list = |key: &str| -> Vec<String> {
            match value.get(key) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => ["description", "step", "path", "file"]
                            .iter()
                            .find_map(|k| obj.get(*k).and_then(Value::as_str))
                            .map(str::to_string),
                        _ => None,
                    })
                    .filter(|s| !s.trim().is_empty())
                    .collect(),
                Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
                _ => Vec::new(),
            }
        };

        Plan {
            summary: value
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            steps: text_list("steps"),
            files: text_list("files"),
        }
    }

    /// Fallback for a planner response with no recoverable JSON: the text
    /// itself becomes the only step.
    pub fn from_text(request: &str, text: &str) -> Self {
        let text = text.trim();
        Plan {
            summary: request.trim().to_string(),
            steps: if text.is_empty() {
                Vec::new()
            } else {
                vec![crate::util::truncate(text, 2000)]
            },
            files: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("Summary: {}\n", self.summary);
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        if !self.files.is_empty() {
            out.push_str(&format!("Files: {}\n", self.files.join(", ")));
        }
        out
    }
}

/// Ask the planning model for a plan. Only transport errors fail; an
/// unparseable answer degrades to a text plan.
pub async fn plan(
    llm: &dyn LlmClient,
    request: &str,
    workspace_summary: &str,
    options: &CompletionOptions,
) -> anyhow::Result<(Plan, Completion)> {
    let user = format!(
        "REQUEST:\n{}\n\nWORKSPACE FILES:\n{}\n\nReturn the plan as JSON.",
        request, workspace_summary
    );
    let messages = [ChatMessage::system(PLANNER_SYSTEM), ChatMessage::user(user)];
    let completion = llm.complete(&messages, options).await?;

    let plan = match recover_json(&completion.content) {
        Ok(value) => Plan::from_value(&value),
        Err(e) => {
            warn!(error = %e, "planner response had no JSON, using it as free text");
            Plan::from_text(request, &completion.content)
        }
    };
    debug!(steps = plan.steps.len(), files = plan.files.len(), "plan ready");
    Ok((plan, completion))
}
