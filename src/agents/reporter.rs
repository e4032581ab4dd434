//! Plain-text run summary

use super::validator::CheckStatus;
use super::RunContext;
use crate::mutation::SkipReason;
use crate::orchestrator::{ActionOutcome, ApplyReport};
use std::fmt::Write as _;

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_actions(out: &mut String, title: &str, report: &ApplyReport) {
    let applied = report.succeeded().count();
    let failed = report.failed().count();
    let _ = writeln!(out, "\n{} ({} applied, {} failed)", title, applied, failed);
    if report.actions.is_empty() {
        out.push_str("  (no actions)\n");
    }

    for action in &report.actions {
        let path = action
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<no path>".to_string());
        match &action.outcome {
            ActionOutcome::Applied { mutation, strategy } => {
                let marker = if mutation.applied { "+" } else { "~" };
                let skipped = match mutation.reason {
                    Some(SkipReason::DryRun) => ", dry run",
                    Some(SkipReason::Declined) => ", declined",
                    None => "",
                };
                let _ = writeln!(
                    out,
                    "  {} #{} {} {} [{}{}]",
                    marker, action.index, action.action, path, strategy, skipped
                );
            }
            ActionOutcome::Failed {
                error_kind,
                message,
            } => {
                let _ = writeln!(
                    out,
                    "  ● #{} {} {} ({})",
                    action.index, action.action, path, error_kind
                );
                let _ = writeln!(out, "{}", indent(message, "      "));
            }
        }
    }
}

/// Render the run for the terminal.
pub fn render(ctx: &RunContext) -> String {
    let mut out = String::new();
    let short_id: String = ctx.run_id.to_string().chars().take(8).collect();
    let _ = writeln!(
        out,
        "nebula run {}{}",
        short_id,
        if ctx.dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(out, "Request: {}", ctx.request);

    if let Some(plan) = &ctx.plan {
        out.push_str("\nPlan\n");
        let _ = writeln!(out, "{}", indent(plan.render().trim_end(), "  "));
    }

    if let Some(payload) = &ctx.implementation {
        if !payload.notes.trim().is_empty() {
            out.push_str("\nImplementer notes\n");
            let _ = writeln!(out, "{}", indent(payload.notes.trim(), "  "));
        }
    }

    if let Some(report) = &ctx.apply_report {
        render_actions(&mut out, "Actions", report);
    }

    if let Some(validation) = &ctx.validation {
        out.push_str("\nValidation\n");
        for check in &validation.checks {
            let _ = writeln!(out, "  {} {}", check.status.icon(), check.name);
            if matches!(check.status, CheckStatus::Fail | CheckStatus::TimedOut)
                && !check.output.is_empty()
            {
                let _ = writeln!(out, "{}", indent(&check.output, "      "));
            }
        }
    }

    if let Some(rollback) = &ctx.rollback {
        out.push_str("\nRollback\n");
        for path in &rollback.restored {
            let _ = writeln!(out, "  restored {}", path.display());
        }
        for path in &rollback.removed {
            let _ = writeln!(out, "  removed {}", path.display());
        }
        for path in &rollback.skipped {
            let _ = writeln!(out, "  skipped {}", path.display());
        }
        for failure in &rollback.failures {
            let _ = writeln!(out, "  ● {}: {}", failure.path.display(), failure.message);
        }
    }

    for note in &ctx.notes {
        let _ = writeln!(out, "\n{}", capitalize(note.stage.label()));
        let _ = writeln!(out, "{}", indent(note.text.trim(), "  "));
    }

    if let Some(report) = &ctx.test_report {
        render_actions(&mut out, "Generated tests", report);
    }

    if !ctx.failures.is_empty() {
        out.push_str("\nFailures\n");
        for failure in &ctx.failures {
            let _ = writeln!(out, "  [{}] {}", failure.stage.label(), failure.kind);
            let _ = writeln!(out, "{}", indent(&failure.message, "      "));
        }
    }

    let usage = &ctx.usage;
    if usage.total_tokens > 0 {
        let _ = write!(
            out,
            "\nTokens: {} (prompt {}, completion {})",
            usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
        );
        if let Some(cost) = usage.cost {
            let _ = write!(out, ", ${:.4}", cost);
        }
        out.push('\n');
    }

    let verdict = if ctx.succeeded() {
        "succeeded"
    } else if ctx.rollback.is_some() {
        "failed, changes rolled back"
    } else {
        "finished with failures"
    };
    let _ = writeln!(out, "\nResult: {}", verdict);
    out
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentNote, Stage};
    use crate::mutation::{Mutation, MutationKind};
    use crate::orchestrator::{ActionReport, EditStrategy};
    use crate::NebulaError;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn applied(index: usize, path: &str, reason: Option<SkipReason>) -> ActionReport {
        ActionReport {
            index,
            action: "write_file".to_string(),
            path: Some(PathBuf::from(path)),
            outcome: ActionOutcome::Applied {
                mutation: Mutation {
                    id: Uuid::new_v4(),
                    kind: MutationKind::Write,
                    path: PathBuf::from(path),
                    before: None,
                    before_bytes: None,
                    after: Some("x".to_string()),
                    applied: reason.is_none(),
                    reason,
                    recorded_at: Utc::now(),
                },
                strategy: EditStrategy::Overwrite,
            },
        }
    }

    #[test]
    fn report_lists_outcomes_and_failures() {
        let mut ctx = RunContext::new("add a file", false);
        ctx.apply_report = Some(ApplyReport {
            actions: vec![
                applied(0, "a.txt", None),
                ActionReport {
                    index: 1,
                    action: "modify_file".to_string(),
                    path: Some(PathBuf::from("b.rs")),
                    outcome: ActionOutcome::Failed {
                        error_kind: "diff_apply_failure".to_string(),
                        message: "Diff could not be applied.\nManual fix for b.rs:".to_string(),
                    },
                },
            ],
        });
        ctx.notes.push(AgentNote {
            stage: Stage::Analyze,
            text: "No issues found.".to_string(),
        });
        ctx.record_failure(
            Stage::Implement,
            &NebulaError::Llm("rate limited".to_string()),
        );
        ctx.usage.total_tokens = 30;

        let text = render(&ctx);
        assert!(text.contains("Actions (1 applied, 1 failed)"));
        assert!(text.contains("  + #0 write_file a.txt [overwrite]"));
        assert!(text.contains("  ● #1 modify_file b.rs (diff_apply_failure)"));
        assert!(text.contains("      Manual fix for b.rs:"));
        assert!(text.contains("\nAnalyzer\n  No issues found."));
        assert!(text.contains("[implementer] llm"));
        assert!(text.contains("Tokens: 30"));
        assert!(text.ends_with("Result: finished with failures\n"));
    }

    #[test]
    fn dry_run_marks_unwritten_mutations() {
        let mut ctx = RunContext::new("preview", true);
        ctx.apply_report = Some(ApplyReport {
            actions: vec![applied(0, "a.txt", Some(SkipReason::DryRun))],
        });

        let text = render(&ctx);
        assert!(text.contains("(dry run)"));
        assert!(text.contains("  ~ #0 write_file a.txt [overwrite, dry run]"));
        assert!(text.ends_with("Result: succeeded\n"));
    }
}
