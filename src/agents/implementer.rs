use super::{format_snapshots, FileSnapshot, Plan};
use crate::action::ImplementationPayload;
use crate::error::{NebulaError, Result};
use crate::llm::prompts::{json_repair_user, IMPLEMENTER_SYSTEM, JSON_REPAIR_SYSTEM};
use crate::llm::{ChatMessage, CompletionOptions, LlmClient, Usage};
use crate::recovery::recover_json;
use crate::util::truncate;
use tracing::{debug, info, warn};

/// Raw response sent back to the repair model, at most.
const MAX_REPAIR_INPUT_CHARS: usize = 60_000;

pub fn build_prompt(request: &str, plan: Option<&Plan>, files: &[FileSnapshot]) -> String {
    let mut prompt = format!("REQUEST:\n{}\n\n", request);
    if let Some(plan) = plan {
        prompt.push_str("PLAN:\n");
        prompt.push_str(&plan.render());
        prompt.push('\n');
    }
    if files.is_empty() {
        prompt.push_str("No existing files were loaded; create what the plan needs.\n\n");
    } else {
        prompt.push_str("CURRENT FILES:\n\n");
        prompt.push_str(&format_snapshots(files));
    }
    prompt.push_str("Return the actions as JSON.");
    prompt
}

/// Ask the implementing model for edit actions and narrow its answer.
///
/// Usage from every round trip, repairs included, is added to `usage`.
pub async fn implement(
    llm: &dyn LlmClient,
    request: &str,
    plan: Option<&Plan>,
    files: &[FileSnapshot],
    options: &CompletionOptions,
    repair: &RepairPolicy<'_>,
    usage: &mut Usage,
) -> Result<ImplementationPayload> {
    let messages = [
        ChatMessage::system(IMPLEMENTER_SYSTEM),
        ChatMessage::user(build_prompt(request, plan, files)),
    ];
    let completion = llm
        .complete(&messages, options)
        .await
        .map_err(|e| NebulaError::Llm(e.to_string()))?;
    if let Some(u) = &completion.usage {
        usage.add(u);
    }

    let payload = parse_with_repair(llm, &completion.content, "implementation", repair, usage).await?;
    info!(
        actions = payload.actions.len(),
        rejected = payload.rejected.len(),
        "implementation received"
    );
    Ok(payload)
}

/// How many times, and with which model, to ask for malformed JSON to be fixed.
#[derive(Debug, Clone, Copy)]
pub struct RepairPolicy<'a> {
    pub options: &'a CompletionOptions,
    pub max_attempts: usize,
}

/// Recover a payload from `raw`, asking the repair model to fix the JSON when
/// local recovery fails. The error after the last attempt describes the
/// original response.
pub async fn parse_with_repair(
    llm: &dyn LlmClient,
    raw: &str,
    context_hint: &str,
    repair: &RepairPolicy<'_>,
    usage: &mut Usage,
) -> Result<ImplementationPayload> {
    let original_error = match recover_json(raw) {
        Ok(value) => return Ok(ImplementationPayload::from_value(value)),
        Err(e) => e,
    };

    let mut last_error = original_error.to_string();
    for attempt in 1..=repair.max_attempts {
        debug!(attempt, max = repair.max_attempts, "asking model to repair JSON");
        let messages = [
            ChatMessage::system(JSON_REPAIR_SYSTEM),
            ChatMessage::user(json_repair_user(
                context_hint,
                &last_error,
                &truncate(raw, MAX_REPAIR_INPUT_CHARS),
            )),
        ];
        let completion = match llm.complete(&messages, repair.options).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(attempt, error = %e, "JSON repair request failed");
                break;
            }
        };
        if let Some(u) = &completion.usage {
            usage.add(u);
        }

        match recover_json(&completion.content) {
            Ok(value) => {
                info!(attempt, "JSON repaired by model");
                return Ok(ImplementationPayload::from_value(value));
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(original_error)
}
