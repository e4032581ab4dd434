//! Advisory agents
//!
//! Analyzer, optimizer and test generator run concurrently against the
//! already-applied change set. The first two only read; the test generator
//! may only create files that do not exist yet.

use super::implementer::{parse_with_repair, RepairPolicy};
use super::{format_snapshots, FileSnapshot};
use crate::action::{EditAction, ImplementationPayload, RejectedAction};
use crate::error::Result;
use crate::llm::prompts::{ANALYZER_SYSTEM, OPTIMIZER_SYSTEM, TEST_GENERATOR_SYSTEM};
use crate::llm::{ChatMessage, Completion, CompletionOptions, LlmClient, Usage};
use crate::workspace::WorkspaceFs;
use std::collections::HashSet;
use tracing::debug;

pub struct AdvisorOutput {
    pub analysis: anyhow::Result<Completion>,
    pub optimization: anyhow::Result<Completion>,
    pub tests: Result<ImplementationPayload>,
    /// Usage of the test generator, repairs included
    pub test_usage: Usage,
}

fn review_prompt(request: &str, files: &[FileSnapshot]) -> String {
    format!(
        "REQUEST:\n{}\n\nCHANGED FILES:\n\n{}",
        request,
        format_snapshots(files)
    )
}

async fn review(
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
    options: &CompletionOptions,
) -> anyhow::Result<Completion> {
    let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
    llm.complete(&messages, options).await
}

async fn generate_tests(
    llm: &dyn LlmClient,
    prompt: &str,
    options: &CompletionOptions,
    repair: &RepairPolicy<'_>,
) -> (Result<ImplementationPayload>, Usage) {
    let mut usage = Usage::default();
    let messages = [
        ChatMessage::system(TEST_GENERATOR_SYSTEM),
        ChatMessage::user(prompt),
    ];
    let json_options = options.clone().json();
    let completion = match llm.complete(&messages, &json_options).await {
        Ok(completion) => completion,
        Err(e) => return (Err(crate::NebulaError::Llm(e.to_string())), usage),
    };
    if let Some(u) = &completion.usage {
        usage.add(u);
    }
    let payload = parse_with_repair(llm, &completion.content, "test generation", repair, &mut usage).await;
    (payload, usage)
}

/// Run the three advisory agents concurrently over the changed files.
pub async fn run_advisors(
    llm: &dyn LlmClient,
    request: &str,
    files: &[FileSnapshot],
    options: &CompletionOptions,
    repair: &RepairPolicy<'_>,
) -> AdvisorOutput {
    let prompt = review_prompt(request, files);
    debug!(files = files.len(), "running advisory agents");

    let (analysis, optimization, (tests, test_usage)) = futures::join!(
        review(llm, ANALYZER_SYSTEM, &prompt, options),
        review(llm, OPTIMIZER_SYSTEM, &prompt, options),
        generate_tests(llm, &prompt, options, repair),
    );

    AdvisorOutput {
        analysis,
        optimization,
        tests,
        test_usage,
    }
}

/// Keep only actions that create new files. Everything else moves to
/// `rejected`, indexed consistently with the original action list.
pub async fn restrict_to_new_files(
    fs: &WorkspaceFs,
    payload: ImplementationPayload,
) -> ImplementationPayload {
    let ImplementationPayload {
        actions,
        notes,
        mut rejected,
    } = payload;

    let taken: HashSet<usize> = rejected.iter().map(|r| r.index).collect();
    let slots = (0usize..).filter(|i| !taken.contains(i));

    let mut kept = Vec::new();
    for (action, index) in actions.into_iter().zip(slots) {
        let reason = match &action {
            EditAction::WriteFile { path, .. } => match fs.stat(path).await {
                Ok(None) => None,
                Ok(Some(_)) => Some("refusing to overwrite an existing file".to_string()),
                Err(e) => Some(e.to_string()),
            },
            other => Some(format!(
                "test generation may only create new files, got {}",
                other.label()
            )),
        };

        match reason {
            None => kept.push(action),
            Some(reason) => rejected.push(RejectedAction {
                index,
                path: Some(action.path().to_path_buf()),
                reason,
            }),
        }
    }
    rejected.sort_by_key(|r| r.index);

    ImplementationPayload {
        actions: kept,
        notes,
        rejected,
    }
}
