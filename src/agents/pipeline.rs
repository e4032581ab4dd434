use super::advisors::{restrict_to_new_files, run_advisors};
use super::implementer::{implement, RepairPolicy};
use super::planner::plan;
use super::validator::validate;
use super::{read_snapshots, summarize_workspace, AgentNote, RunContext, Stage};
use crate::action::ImplementationPayload;
use crate::config::{Config, ValidationCommand};
use crate::diff::DiffOptions;
use crate::llm::{Completion, CompletionOptions, LlmClient};
use crate::mutation::{rollback, MutationRecorder};
use crate::orchestrator::MutationOrchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Files listed in the planner prompt, at most.
const WORKSPACE_SUMMARY_LIMIT: usize = 300;

/// Characters of each file handed to an agent, at most.
const MAX_FILE_CONTEXT_CHARS: usize = 40_000;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub planner: CompletionOptions,
    pub implementer: CompletionOptions,
    pub repair: CompletionOptions,
    pub advisor: CompletionOptions,
    pub max_json_repair_attempts: usize,
    pub validation_commands: Vec<ValidationCommand>,
    pub validation_timeout: Duration,
    pub diff: DiffOptions,
    pub run_advisors: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            planner: config.completion(&config.planner_model).json(),
            implementer: config.completion(&config.implementer_model).json(),
            repair: config.completion(&config.repair_model).json(),
            advisor: config.completion(&config.planner_model),
            max_json_repair_attempts: config.max_json_repair_attempts,
            validation_commands: config.validation_commands.clone(),
            validation_timeout: config.validation_timeout(),
            diff: config.diff_options(),
            run_advisors: true,
        }
    }

    fn repair_policy(&self) -> RepairPolicy<'_> {
        RepairPolicy {
            options: &self.repair,
            max_attempts: self.max_json_repair_attempts,
        }
    }
}

/// The full agent run: plan, implement, apply, validate, advise.
pub struct Pipeline {
    llm: Arc<dyn LlmClient>,
    recorder: MutationRecorder,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(llm: Arc<dyn LlmClient>, recorder: MutationRecorder, settings: PipelineSettings) -> Self {
        Self {
            llm,
            recorder,
            settings,
        }
    }

    pub fn recorder(&self) -> &MutationRecorder {
        &self.recorder
    }

    /// Run every stage for `request`. Failures are recorded in the returned
    /// context instead of being returned as errors.
    pub async fn run(&mut self, request: &str) -> RunContext {
        let mut ctx = RunContext::new(request, self.recorder.is_dry_run());
        info!(run_id = %ctx.run_id, "run started");
        let llm = Arc::clone(&self.llm);

        let summary = summarize_workspace(self.recorder.fs().workspace().root(), WORKSPACE_SUMMARY_LIMIT);
        match plan(llm.as_ref(), request, &summary, &self.settings.planner).await {
            Ok((plan, completion)) => {
                ctx.add_usage(completion.usage.as_ref());
                ctx.plan = Some(plan);
            }
            Err(e) => {
                ctx.record_error(Stage::Plan, "llm", e.to_string());
                ctx.finish();
                return ctx;
            }
        }

        let planned: Vec<PathBuf> = ctx
            .plan
            .iter()
            .flat_map(|p| p.files.iter().map(PathBuf::from))
            .collect();
        let files = read_snapshots(self.recorder.fs(), &planned, MAX_FILE_CONTEXT_CHARS).await;

        let repair = self.settings.repair_policy();
        let implemented = implement(
            llm.as_ref(),
            request,
            ctx.plan.as_ref(),
            &files,
            &self.settings.implementer,
            &repair,
            &mut ctx.usage,
        )
        .await;
        let payload = match implemented {
            Ok(payload) => payload,
            Err(e) => {
                ctx.record_failure(Stage::Implement, &e);
                ctx.finish();
                return ctx;
            }
        };

        let validated = commit(&mut self.recorder, &self.settings, payload, &mut ctx).await;
        if validated && self.settings.run_advisors {
            self.advise(llm.as_ref(), &mut ctx).await;
        }

        ctx.finish();
        info!(run_id = %ctx.run_id, succeeded = ctx.succeeded(), "run finished");
        ctx
    }

    async fn advise(&mut self, llm: &dyn LlmClient, ctx: &mut RunContext) {
        let changed: Vec<PathBuf> = ctx
            .apply_report
            .as_ref()
            .map(|report| report.changed_paths().into_iter().map(Path::to_path_buf).collect())
            .unwrap_or_default();
        if changed.is_empty() {
            return;
        }

        let files = read_snapshots(self.recorder.fs(), &changed, MAX_FILE_CONTEXT_CHARS).await;
        let repair = self.settings.repair_policy();
        let output = run_advisors(llm, &ctx.request, &files, &self.settings.advisor, &repair).await;

        record_note(ctx, Stage::Analyze, output.analysis);
        record_note(ctx, Stage::Optimize, output.optimization);
        ctx.usage.add(&output.test_usage);

        match output.tests {
            Ok(payload) => {
                let payload = restrict_to_new_files(self.recorder.fs(), payload).await;
                if !payload.notes.trim().is_empty() {
                    ctx.notes.push(AgentNote {
                        stage: Stage::GenerateTests,
                        text: payload.notes.clone(),
                    });
                }
                if payload.actions.is_empty() && payload.rejected.is_empty() {
                    return;
                }
                let mut orchestrator = MutationOrchestrator::new(&mut self.recorder, self.settings.diff);
                ctx.test_report = Some(orchestrator.apply_payload(&payload).await);
            }
            Err(e) => ctx.record_failure(Stage::GenerateTests, &e),
        }
    }
}

fn record_note(ctx: &mut RunContext, stage: Stage, result: anyhow::Result<Completion>) {
    match result {
        Ok(completion) => {
            ctx.add_usage(completion.usage.as_ref());
            ctx.notes.push(AgentNote {
                stage,
                text: completion.content,
            });
        }
        Err(e) => ctx.record_error(stage, "llm", e.to_string()),
    }
}

/// Apply `payload`, then validate. A failed validation rolls back every
/// mutation this call applied. Returns whether the change set stands.
async fn commit(
    recorder: &mut MutationRecorder,
    settings: &PipelineSettings,
    payload: ImplementationPayload,
    ctx: &mut RunContext,
) -> bool {
    let first_mutation = recorder.history().len();
    let report = MutationOrchestrator::new(recorder, settings.diff)
        .apply_payload(&payload)
        .await;
    let wrote_anything = !report.changed_paths().is_empty();
    ctx.implementation = Some(payload);
    ctx.apply_report = Some(report);

    if !wrote_anything || settings.validation_commands.is_empty() {
        return true;
    }

    let root = recorder.fs().workspace().root().to_path_buf();
    let outcome = validate(&root, &settings.validation_commands, settings.validation_timeout).await;
    let failure = outcome.failure();
    ctx.validation = Some(outcome);

    let Some(error) = failure else {
        return true;
    };
    ctx.record_failure(Stage::Validate, &error);

    let report = rollback(recorder.fs(), &recorder.history()[first_mutation..]).await;
    if !report.is_clean() {
        warn!(failures = report.failures.len(), "rollback left some paths unrestored");
    }
    ctx.rollback = Some(report);
    false
}

/// Apply a saved raw model response without any model round trip.
pub async fn apply_response(
    recorder: &mut MutationRecorder,
    raw: &str,
    settings: &PipelineSettings,
    label: &str,
) -> RunContext {
    let mut ctx = RunContext::new(label, recorder.is_dry_run());
    match ImplementationPayload::from_response(raw) {
        Ok(payload) => {
            commit(recorder, settings, payload, &mut ctx).await;
        }
        Err(e) => ctx.record_failure(Stage::Implement, &e),
    }
    ctx.finish();
    ctx
}
