//! Top-level per-task state machine.
//!
//! Owns the run lifecycle: iteration cap, carry-forward baselines, approval
//! persistence (commit, optional merge with dirty-target policy and
//! conflict delegation to an executor), disposal policy, and session-mode
//! idle/wake.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::core::resume::{ResumeStage, classify};
use crate::core::types::{
    Decision, RunSnapshot, RunStatus, TerminalError, WorkspaceStrategy,
};
use crate::error::LuigiError;
use crate::io::agent::{Agent, CliAgent, ExecuteRequest, ExecutorStatus};
use crate::io::config::LuigiConfig;
use crate::io::git::{Git, MergeOutcome};
use crate::io::prompt_channel::{PromptChannel, PromptKind};
use crate::io::state::StateStore;
use crate::io::workspace::{Workspace, WorkspaceManager};
use crate::scheduler::Scheduler;

/// Everything needed to drive one process worth of runs.
pub struct Orchestrator {
    config: LuigiConfig,
    repo_path: PathBuf,
    store: StateStore,
    workspaces: WorkspaceManager,
    prompts: PromptChannel,
    cancel: CancelToken,
    reviewers: Vec<Arc<dyn Agent>>,
    executors: Vec<Arc<dyn Agent>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("repo_path", &self.repo_path)
            .finish_non_exhaustive()
    }
}

/// Reviewer and executor agents for one run.
pub struct AgentSet {
    pub reviewers: Vec<Arc<dyn Agent>>,
    pub executors: Vec<Arc<dyn Agent>>,
}

/// Build CLI-backed agents from the config, logging under `run_dir`.
pub fn cli_agent_set(config: &LuigiConfig, run_dir: &Path) -> AgentSet {
    let build = |entries: &[crate::io::config::AgentEntry]| {
        entries
            .iter()
            .map(|entry| {
                Arc::new(CliAgent::new(
                    entry.id.clone(),
                    entry.command.clone(),
                    config.agent_invoke.clone(),
                    run_dir,
                )) as Arc<dyn Agent>
            })
            .collect()
    };
    AgentSet {
        reviewers: build(&config.agents.reviewers),
        executors: build(&config.agents.executors),
    }
}

impl Orchestrator {
    /// Start a fresh run. `agents` receives the run directory so CLI agents
    /// can place their log files there; tests pass scripted sets.
    pub fn new(
        config: LuigiConfig,
        repo_path: PathBuf,
        interactive: bool,
        cancel: CancelToken,
        agents: impl FnOnce(&LuigiConfig, &Path) -> AgentSet,
    ) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let snapshot = RunSnapshot::new(run_id, repo_path.clone(), Utc::now().to_rfc3339());
        let logs_root = resolve_dir(&config.orchestrator.logs_dir, &repo_path);
        let store = StateStore::create(&logs_root, snapshot)?;
        Self::assemble(config, repo_path, store, interactive, cancel, agents)
    }

    /// Reattach to a persisted run by id.
    pub fn resume(
        config: LuigiConfig,
        repo_path: PathBuf,
        run_id: &str,
        interactive: bool,
        cancel: CancelToken,
        agents: impl FnOnce(&LuigiConfig, &Path) -> AgentSet,
    ) -> Result<Self> {
        let logs_root = resolve_dir(&config.orchestrator.logs_dir, &repo_path);
        let store = StateStore::load(&logs_root, run_id)?;
        let snapshot = store.snapshot();
        if snapshot.repo_path != repo_path {
            return Err(anyhow!(LuigiError::config(format!(
                "run {run_id} belongs to {}, not {}",
                snapshot.repo_path.display(),
                repo_path.display()
            ))));
        }
        if matches!(snapshot.status, RunStatus::Completed) {
            return Err(anyhow!(LuigiError::config(format!(
                "run {run_id} already completed"
            ))));
        }
        store.note("resuming previous run")?;
        Self::assemble(config, repo_path, store, interactive, cancel, agents)
    }

    fn assemble(
        config: LuigiConfig,
        repo_path: PathBuf,
        store: StateStore,
        interactive: bool,
        cancel: CancelToken,
        agents: impl FnOnce(&LuigiConfig, &Path) -> AgentSet,
    ) -> Result<Self> {
        let workspaces =
            WorkspaceManager::new(resolve_dir(&config.orchestrator.workspaces_dir, &repo_path))?;
        let poll = Duration::from_secs(config.prompt.poll_interval_secs);
        let timeout = match config.prompt.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let prompts = PromptChannel::new(
            store.prompts_dir(),
            poll,
            timeout,
            cancel.clone(),
            interactive,
        )?;
        cancel.watch_file(store.run_dir().to_path_buf(), poll);

        let AgentSet {
            reviewers,
            executors,
        } = agents(&config, store.run_dir());
        Ok(Self {
            config,
            repo_path,
            store,
            workspaces,
            prompts,
            cancel,
            reviewers,
            executors,
        })
    }

    pub fn run_id(&self) -> String {
        self.store.snapshot().run_id
    }

    pub fn run_dir(&self) -> &Path {
        self.store.run_dir()
    }

    /// Run tasks until terminal; in session mode, idle for the next task
    /// after each run and keep going until cancelled.
    pub fn run(&self, initial_task: Option<String>) -> Result<RunStatus> {
        let mut pending_task = initial_task;
        let mut first = true;
        loop {
            let resuming_with_task = self.store.snapshot().task.is_some() && first;
            if !resuming_with_task {
                let task = match pending_task.take() {
                    Some(task) => task,
                    None => {
                        let kind = if first {
                            PromptKind::InitialTask
                        } else {
                            PromptKind::SessionNextTask
                        };
                        self.prompts.ask_task(kind)?
                    }
                };
                self.store.update("task accepted", |snapshot| {
                    snapshot.task = Some(task);
                    snapshot.session_index += 1;
                    // A new task in session mode starts a clean run history.
                    if snapshot.status == RunStatus::Idle {
                        snapshot.iterations.clear();
                        snapshot.approved = false;
                        snapshot.persisted = false;
                        snapshot.winning_iteration = None;
                        snapshot.error = None;
                    }
                })?;
            }
            first = false;

            let status = self.drive_task()?;
            if !self.config.orchestrator.session_mode
                || matches!(status, RunStatus::Aborted)
            {
                return Ok(status);
            }
            self.store.update("run idle, awaiting next task", |snapshot| {
                snapshot.status = RunStatus::Idle;
                snapshot.task = None;
            })?;
            info!("session mode: waiting for the next task");
        }
    }

    /// Drive one task to a terminal status, recording it in the snapshot.
    fn drive_task(&self) -> Result<RunStatus> {
        self.store.update("run started", |snapshot| {
            snapshot.status = RunStatus::Running;
        })?;

        match self.iteration_loop() {
            Ok(status) => Ok(status),
            Err(err) => {
                let status = if matches!(
                    err.downcast_ref::<LuigiError>(),
                    Some(LuigiError::Aborted)
                ) {
                    RunStatus::Aborted
                } else {
                    RunStatus::Failed
                };
                let kind = err
                    .downcast_ref::<LuigiError>()
                    .map(LuigiError::kind)
                    .unwrap_or("internal")
                    .to_string();
                let message = format!("{err:#}");
                self.store.update("run terminated with error", |snapshot| {
                    snapshot.status = status;
                    if let Some(iteration) = snapshot.current_iteration_mut() {
                        if iteration.decision.is_none() {
                            iteration.decision = Some(Decision::Aborted);
                            iteration.ended_at = Some(Utc::now().to_rfc3339());
                        }
                    }
                    snapshot.error = Some(TerminalError { kind, message });
                })?;
                if status == RunStatus::Aborted {
                    Ok(status)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn iteration_loop(&self) -> Result<RunStatus> {
        let scheduler = Scheduler {
            config: &self.config,
            store: &self.store,
            workspaces: &self.workspaces,
            prompts: &self.prompts,
            cancel: &self.cancel,
            reviewers: &self.reviewers,
            executors: &self.executors,
            repo_path: &self.repo_path,
        };

        loop {
            self.cancel.check()?;
            let snapshot = self.store.snapshot();

            match classify(&snapshot, self.reviewers.len()) {
                ResumeStage::Terminal => return Ok(snapshot.status),
                ResumeStage::Disposition => {
                    let persisted = self.persist_approval(&snapshot)?;
                    return self.finish_approved(persisted);
                }
                _ => {}
            }

            // Iteration cap: decided iterations count; an undecided slot is
            // the one we are about to re-enter.
            let decided = snapshot
                .iterations
                .iter()
                .filter(|it| it.decision.is_some())
                .count() as u32;
            let reentering = snapshot
                .current_iteration()
                .is_some_and(|it| it.decision.is_none());
            if !reentering {
                if let Some(max) = self.config.max_iterations() {
                    if decided >= max {
                        self.store.update("max iterations exceeded", |snapshot| {
                            snapshot.status = RunStatus::Failed;
                            snapshot.error = Some(TerminalError {
                                kind: "max-iterations-exceeded".to_string(),
                                message: format!(
                                    "no approval after {decided} of {max} iterations"
                                ),
                            });
                        })?;
                        return Ok(RunStatus::Failed);
                    }
                }
            }

            let next_index = if reentering {
                snapshot.iterations.len() as u32 - 1
            } else {
                snapshot.iterations.len() as u32
            };
            let baseline = self.baseline_for_iteration(&snapshot.run_id, next_index);
            let outcome = scheduler.run_iteration(&baseline)?;

            if outcome.decision.is_approved() {
                let winner_id = outcome
                    .winner_candidate_id
                    .clone()
                    .ok_or_else(|| anyhow!("approved iteration without a winner"))?;
                let persisted = match outcome.winner_workspace {
                    Some(workspace) => self.persist_workspace(&workspace, &winner_id)?,
                    None => {
                        warn!("approved winner has no workspace to persist");
                        false
                    }
                };
                return self.finish_approved(persisted);
            }

            if let Some(next_task) = outcome.next_task {
                self.store.update("next iteration task set", |snapshot| {
                    snapshot.task = Some(next_task);
                })?;
            }
        }
    }

    /// Baseline directory for an iteration: the carry-forward adoption from
    /// the previous iteration when present, the repo itself otherwise.
    fn baseline_for_iteration(&self, run_id: &str, iteration: u32) -> PathBuf {
        if iteration > 0 {
            let carried = self
                .workspaces
                .base_dir()
                .join(run_id)
                .join(format!("iter_{iteration}"))
                .join("baseline");
            if carried.is_dir() {
                return carried;
            }
        }
        self.repo_path.clone()
    }

    fn finish_approved(&self, persisted: bool) -> Result<RunStatus> {
        let status = if persisted {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.store.update(
            if persisted {
                "run completed"
            } else {
                "approved but not persisted"
            },
            |snapshot| {
                snapshot.status = status;
                snapshot.persisted = persisted;
                if !persisted {
                    snapshot.error = Some(TerminalError {
                        kind: "persistence-failed".to_string(),
                        message: "iteration approved but changes were not persisted".to_string(),
                    });
                }
            },
        )?;
        Ok(status)
    }

    /// Disposition re-entry: rebuild the winner workspace from the snapshot
    /// and persist it.
    fn persist_approval(&self, snapshot: &RunSnapshot) -> Result<bool> {
        let iteration = snapshot
            .current_iteration()
            .ok_or_else(|| anyhow!("no iteration to persist"))?;
        let winner_id = iteration
            .winner_candidate_id
            .clone()
            .ok_or_else(|| anyhow!("approved iteration without a winner"))?;
        let candidate = iteration
            .candidate(&winner_id)
            .ok_or_else(|| anyhow!("winner {winner_id} missing from iteration"))?;
        let workspace = candidate
            .workspace_strategy
            .and_then(|strategy| {
                self.workspaces.reattach(
                    &self.repo_path,
                    strategy,
                    candidate.workspace_path.as_deref(),
                )
            });
        match workspace {
            Some(workspace) => self.persist_workspace(&workspace, &winner_id),
            None => {
                warn!(winner = %winner_id, "winner workspace could not be reattached");
                Ok(false)
            }
        }
    }

    /// Persist an approved workspace per its strategy, then apply the
    /// cleanup policy.
    fn persist_workspace(&self, workspace: &Workspace, winner_id: &str) -> Result<bool> {
        let persisted = match workspace.strategy {
            WorkspaceStrategy::InPlace => true,
            WorkspaceStrategy::Copy => {
                if self.config.orchestrator.apply_changes_on_success {
                    match self.workspaces.apply_changes(workspace) {
                        Ok(()) => {
                            self.store.note("applied winner changes to repo")?;
                            true
                        }
                        Err(err) => {
                            warn!(error = %err, "apply-changes failed");
                            self.store
                                .note(&format!("persistence step failed: {err:#}"))?;
                            false
                        }
                    }
                } else {
                    true
                }
            }
            WorkspaceStrategy::Worktree => self.persist_worktree(workspace, winner_id)?,
        };

        let cleanup = &self.config.orchestrator.cleanup;
        if cleanup == "always" || (cleanup == "on_success" && persisted) {
            self.workspaces.dispose(workspace);
        }
        Ok(persisted)
    }

    /// Commit on the candidate branch, then optionally merge into the
    /// target branch. Merge conflicts are delegated to an executor agent;
    /// if resolution fails the run ends approved-but-not-persisted.
    fn persist_worktree(&self, workspace: &Workspace, winner_id: &str) -> Result<bool> {
        let snapshot = self.store.snapshot();
        let task = snapshot.task.clone().unwrap_or_default();
        let run_id = snapshot.run_id.clone();
        let branch = workspace
            .branch_name
            .clone()
            .ok_or_else(|| anyhow!(LuigiError::workspace("worktree without a branch name")))?;

        if self.config.orchestrator.commit_on_approval {
            let message = fill_template(
                &self.config.orchestrator.commit_message,
                &task,
                &run_id,
                &branch,
                &self.config.orchestrator.merge_target_branch,
            );
            let sha = self
                .workspaces
                .with_repo_lock(|| Git::new(&workspace.path).commit_all(&message))?;
            self.store.update("winner committed", |snapshot| {
                snapshot.commit_sha = sha.clone();
                snapshot.branch_name = Some(branch.clone());
            })?;
        }

        if !self.config.orchestrator.auto_merge_on_approval {
            return Ok(true);
        }

        let merged = self.merge_into_target(&branch, &task, &run_id, winner_id)?;
        if merged && self.config.orchestrator.delete_branch_on_merge {
            // The branch is still checked out by the winner worktree; drop
            // the worktree first, then the branch.
            self.workspaces.dispose(workspace);
            let deleted = self
                .workspaces
                .with_repo_lock(|| Git::new(&self.repo_path).delete_branch(&branch))?;
            if deleted {
                self.store.note(&format!("deleted merged branch {branch}"))?;
            }
        }
        Ok(merged)
    }

    /// Merge `branch` into the configured target branch, honoring the
    /// dirty-target policy and delegating conflicts to an executor.
    fn merge_into_target(
        &self,
        branch: &str,
        task: &str,
        run_id: &str,
        winner_id: &str,
    ) -> Result<bool> {
        let target = self.config.orchestrator.merge_target_branch.clone();
        let merge_message = fill_template(
            &self.config.orchestrator.merge_commit_message,
            task,
            run_id,
            branch,
            &target,
        );

        let merge_attempt = self.workspaces.with_repo_lock(|| {
            let git = Git::new(&self.repo_path);
            if !git.branch_exists(&target)? {
                return Err(anyhow!(LuigiError::workspace(format!(
                    "merge target branch not found: {target}"
                ))));
            }
            if git.current_branch()? != target {
                git.checkout_branch(&target)?;
            }
            if git.has_changes()? {
                match self.config.orchestrator.dirty_target_policy.as_str() {
                    "commit" => {
                        let message = fill_template(
                            &self.config.orchestrator.dirty_target_commit_message,
                            task,
                            run_id,
                            branch,
                            &target,
                        );
                        git.commit_all(&message)?;
                        info!("auto-committed dirty target branch before merge");
                    }
                    _ => {
                        return Err(anyhow!(LuigiError::workspace(
                            "target branch has uncommitted changes (dirty_target_policy=abort)"
                        )));
                    }
                }
            }
            git.merge_no_ff(branch, &merge_message)
        });

        let outcome = match merge_attempt {
            Ok(outcome) => outcome,
            Err(err) => {
                self.store.note(&format!("merge failed: {err:#}"))?;
                return Ok(false);
            }
        };

        match outcome {
            MergeOutcome::Merged => {
                self.record_merge(branch, &target)?;
                Ok(true)
            }
            MergeOutcome::Conflicts(files) => {
                self.store.note(&format!(
                    "merge conflict in {} file(s), delegating to executor",
                    files.len()
                ))?;
                match self.delegate_conflicts(branch, &target, &merge_message, &files, winner_id) {
                    Ok(true) => {
                        self.record_merge(branch, &target)?;
                        Ok(true)
                    }
                    Ok(false) => Ok(false),
                    Err(err) => {
                        self.store
                            .note(&format!("conflict resolution failed: {err:#}"))?;
                        Ok(false)
                    }
                }
            }
        }
    }

    fn record_merge(&self, branch: &str, target: &str) -> Result<()> {
        let sha = Git::new(&self.repo_path).head_sha().ok();
        self.store.update(
            &format!("merged {branch} into {target}"),
            |snapshot| {
                snapshot.merge_commit_sha = sha.clone();
            },
        )
    }

    /// Hand the conflicted merge to an executor agent with the full run
    /// context, then verify the merge actually concluded.
    fn delegate_conflicts(
        &self,
        branch: &str,
        target: &str,
        merge_message: &str,
        files: &[String],
        winner_id: &str,
    ) -> Result<bool> {
        let snapshot = self.store.snapshot();
        let iteration = snapshot.current_iteration();
        let winner = iteration.and_then(|it| it.candidate(winner_id));
        // Prefer the executor that produced the winning candidate; it has
        // the most context on the changes being merged.
        let executor = winner
            .and_then(|candidate| {
                self.executors
                    .iter()
                    .find(|e| e.id() == candidate.executor_id)
            })
            .or_else(|| self.executors.first())
            .ok_or_else(|| anyhow!("no executor available for conflict resolution"))?;

        let reviews = iteration.map(|it| it.reviews.clone()).unwrap_or_default();
        let prompt = format!(
            "PHASE: EXECUTE\nResolve the git merge conflicts in this repository.\n\
             Task: {task}\nSource branch: {branch}\nTarget branch: {target}\n\
             Conflicted files:\n{file_list}\n\n\
             Review context:\n{reviews}\n\n\
             Instructions:\n\
             - Resolve each conflict, preferring the source branch changes unless the reviews say otherwise.\n\
             - Stage the resolved files with git add.\n\
             - Complete the merge with: git commit -m {merge_message:?}\n\
             - Ensure no unmerged paths remain.\n\
             When finished output the executor result JSON with status DONE.",
            task = snapshot.task.as_deref().unwrap_or("(none)"),
            file_list = files
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n"),
            reviews = json!(reviews),
        );

        let reply = executor.execute(&ExecuteRequest {
            executor_prompt: prompt,
            reviewer_answers: None,
            workdir: self.repo_path.clone(),
            session: None,
        })?;
        if reply.status != ExecutorStatus::Done {
            return Ok(false);
        }

        self.workspaces.with_repo_lock(|| {
            let git = Git::new(&self.repo_path);
            if !git.unmerged_files()?.is_empty() {
                return Ok(false);
            }
            if git.merge_in_progress()? {
                git.commit_merge(merge_message)?;
            }
            git.is_ancestor(branch, "HEAD")
        })
    }
}

/// Resolve a configured directory against the repo when relative.
fn resolve_dir(dir: &Path, repo_path: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        repo_path.join(dir)
    }
}

/// Expand `{task}`, `{run_id}`, `{branch}`, `{target}` placeholders in
/// configured message templates.
fn fill_template(template: &str, task: &str, run_id: &str, branch: &str, target: &str) -> String {
    template
        .replace("{task}", task)
        .replace("{run_id}", run_id)
        .replace("{branch}", branch)
        .replace("{target}", target)
}
