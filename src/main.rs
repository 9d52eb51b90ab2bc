//! CLI entry point for the luigi orchestrator.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use luigi::cancel::CancelToken;
use luigi::core::types::RunStatus;
use luigi::error::LuigiError;
use luigi::exit_codes;
use luigi::io::config::{load_config, resolve_config_path};
use luigi::orchestrator::{Orchestrator, cli_agent_set};

#[derive(Parser)]
#[command(
    name = "luigi",
    version,
    about = "Multi-agent coding orchestrator: plan, execute, test, review, iterate"
)]
struct Cli {
    /// Task prompt, or a repo path (e.g. ".") to collect the task through
    /// the prompt channel.
    task_or_repo: Option<String>,

    /// Path to the target repository. Defaults to the current directory.
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Path to a config file (TOML). Defaults to `<repo>/.luigi/config.toml`
    /// or built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resume a previous run by id instead of starting a new one.
    #[arg(long)]
    resume_run_id: Option<String>,
}

fn main() {
    luigi::logging::init();
    std::process::exit(match run() {
        Ok(status) => match status {
            RunStatus::Completed => exit_codes::OK,
            RunStatus::Aborted => exit_codes::ABORTED,
            _ => exit_codes::FAILURE,
        },
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    });
}

fn run() -> Result<RunStatus> {
    let cli = Cli::parse();

    // `luigi "do X"` runs in the current directory; `luigi .` (or any
    // directory path) starts without a task and collects it via the prompt
    // channel; `--repo` makes the positional argument unambiguous.
    let (repo_path, task) = match (&cli.repo, &cli.task_or_repo) {
        (Some(repo), task) => (repo.clone(), task.clone()),
        (None, None) => (std::env::current_dir()?, None),
        (None, Some(candidate)) => {
            let as_path = PathBuf::from(candidate);
            if as_path.is_dir() {
                (as_path, None)
            } else {
                (std::env::current_dir()?, Some(candidate.clone()))
            }
        }
    };
    let repo_path = repo_path.canonicalize().map_err(|err| {
        LuigiError::config(format!("repo path {}: {err}", repo_path.display()))
    })?;

    if cli.resume_run_id.is_some() && task.is_some() {
        return Err(LuigiError::config(
            "cannot combine --resume-run-id with an explicit task prompt",
        )
        .into());
    }

    let config_path = resolve_config_path(cli.config.as_deref(), &repo_path);
    let config = load_config(config_path.as_deref())?;

    let interactive = std::io::stdin().is_terminal();
    let cancel = CancelToken::new();
    let orchestrator = match &cli.resume_run_id {
        Some(run_id) => Orchestrator::resume(
            config,
            repo_path.clone(),
            run_id,
            interactive,
            cancel.clone(),
            cli_agent_set,
        )?,
        None => Orchestrator::new(
            config,
            repo_path.clone(),
            interactive,
            cancel.clone(),
            cli_agent_set,
        )?,
    };

    println!("Run ID: {}", orchestrator.run_id());
    println!("Repo:   {}", repo_path.display());
    println!("Logs:   {}", orchestrator.run_dir().display());

    orchestrator.run(task)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<LuigiError>() {
        Some(LuigiError::Config(_)) => exit_codes::CONFIG,
        Some(LuigiError::AgentInvocation(_)) | Some(LuigiError::AgentProtocol(_)) => {
            exit_codes::AGENT
        }
        Some(LuigiError::TestRunner(_)) => exit_codes::TEST_RUNNER,
        Some(LuigiError::Workspace(_)) | Some(LuigiError::MergeConflict { .. }) => {
            exit_codes::WORKSPACE
        }
        Some(LuigiError::Aborted) => exit_codes::ABORTED,
        _ => exit_codes::FAILURE,
    }
}
