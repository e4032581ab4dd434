use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use nebula::agents::{apply_response, reporter, Pipeline, PipelineSettings, RunContext, Stage};
use nebula::config::Config;
use nebula::llm::OpenRouterClient;
use nebula::mutation::{ApprovalGate, MutationPreview, MutationRecorder};
use nebula::workspace::{Workspace, WorkspaceFs};
use nebula::{logging, NebulaError};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "nebula",
    about = "A multi-agent coding assistant that edits your workspace safely",
    version
)]
struct Cli {
    /// Workspace root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Record mutations without writing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Apply every mutation without asking
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Print the run context as JSON instead of the text report
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan, implement, validate and review a change
    Run {
        /// What to change, in plain words
        #[arg(required = true, trailing_var_arg = true)]
        request: Vec<String>,
    },
    /// Apply a saved model response (no network)
    Apply {
        /// File holding the raw response text
        response: PathBuf,
    },
}

/// Asks on the terminal before each mutation, showing its diff.
struct StdinApproval;

#[async_trait]
impl ApprovalGate for StdinApproval {
    async fn approve(&self, preview: &MutationPreview<'_>) -> bool {
        let diff = preview.unified_diff();
        let path = preview.path.display().to_string();
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            writeln!(stderr, "\n{}", diff)?;
            write!(stderr, "Apply change to {}? [y/N] ", path)?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Ok(Err(e)) => {
                debug!(error = %e, "approval prompt failed, declining");
                false
            }
            Err(e) => {
                debug!(error = %e, "approval task failed, declining");
                false
            }
        }
    }
}

fn print_report(ctx: &RunContext, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(ctx)?);
    } else {
        print!("{}", reporter::render(ctx));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = Config::load();
    let settings = PipelineSettings::from_config(&config);

    let workspace = Workspace::new(&cli.workspace)
        .with_context(|| format!("Cannot open workspace {}", cli.workspace.display()))?;
    let mut recorder = MutationRecorder::new(WorkspaceFs::new(workspace)).with_dry_run(cli.dry_run);
    if !cli.yes && !cli.dry_run {
        recorder = recorder.with_approval(Arc::new(StdinApproval));
    }

    let ctx = match cli.command {
        Command::Run { request } => {
            let request = request.join(" ");
            match config.resolve_api_key() {
                Some(key) => {
                    let llm = Arc::new(OpenRouterClient::new(key, config.base_url.clone()));
                    let mut pipeline = Pipeline::new(llm, recorder, settings);
                    pipeline.run(&request).await
                }
                None => {
                    let mut ctx = RunContext::new(request, cli.dry_run);
                    ctx.record_failure(
                        Stage::Setup,
                        &NebulaError::Config(format!(
                            "No API key found. Set NEBULA_API_KEY or OPENROUTER_API_KEY, or add api_key to {}",
                            Config::config_location()
                        )),
                    );
                    ctx.finish();
                    ctx
                }
            }
        }
        Command::Apply { response } => {
            let raw = tokio::fs::read_to_string(&response)
                .await
                .with_context(|| format!("Failed to read {}", response.display()))?;
            let label = format!("apply {}", response.display());
            apply_response(&mut recorder, &raw, &settings, &label).await
        }
    };

    print_report(&ctx, cli.json)?;
    if !ctx.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
