//! Orchestrator configuration (`.luigi/config.toml`).
//!
//! The file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values; a missing file is
//! the full default configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LuigiError;

/// Top-level configuration (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LuigiConfig {
    pub orchestrator: OrchestratorConfig,
    pub agents: AgentsConfig,
    pub testing: TestingConfig,
    pub prompt: PromptConfig,
    pub agent_invoke: AgentInvokeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum plan/execute/review iterations per run. 0 means unlimited.
    pub max_iterations: u32,
    /// Stay alive after a run and wait for the next task.
    pub session_mode: bool,
    /// Workspace strategy: "auto" | "in_place" | "copy" | "worktree".
    pub workspace_strategy: String,
    /// Workspace disposal policy: "always" | "on_success" | "never".
    pub cleanup: String,
    /// Reuse a rejected winner's workspace as the next iteration baseline.
    pub carry_forward: bool,
    /// Apply copy-strategy changes back to the repo on approval.
    pub apply_changes_on_success: bool,
    /// Commit worktree changes on approval.
    pub commit_on_approval: bool,
    pub commit_message: String,
    /// Merge the approved worktree branch into `merge_target_branch`.
    pub auto_merge_on_approval: bool,
    pub merge_target_branch: String,
    /// What to do when the target branch has uncommitted changes:
    /// "commit" | "abort".
    pub dirty_target_policy: String,
    pub dirty_target_commit_message: String,
    pub merge_commit_message: String,
    pub delete_branch_on_merge: bool,
    pub branch_prefix: String,
    pub branch_suffix_length: usize,
    /// Cap on reviewer/executor clarification rounds per candidate.
    pub max_question_rounds: u32,
    pub executors_per_plan: usize,
    /// Root for run logs; `~` and env vars are not expanded, relative paths
    /// resolve against the repo.
    pub logs_dir: PathBuf,
    pub workspaces_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            session_mode: false,
            workspace_strategy: "auto".to_string(),
            cleanup: "on_success".to_string(),
            carry_forward: true,
            apply_changes_on_success: true,
            commit_on_approval: true,
            commit_message: "Task complete: {task}".to_string(),
            auto_merge_on_approval: false,
            merge_target_branch: "main".to_string(),
            dirty_target_policy: "commit".to_string(),
            dirty_target_commit_message:
                "Auto-commit local changes before luigi merge (run {run_id})".to_string(),
            merge_commit_message: "Merge {branch} into {target} (run {run_id})".to_string(),
            delete_branch_on_merge: true,
            branch_prefix: "luigi".to_string(),
            branch_suffix_length: 6,
            max_question_rounds: 5,
            executors_per_plan: 1,
            logs_dir: PathBuf::from(".luigi/logs"),
            workspaces_dir: PathBuf::from(".luigi/workspaces"),
        }
    }
}

/// One configured agent program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEntry {
    pub id: String,
    /// Program argv prefix; the adapter appends contract flags and the prompt.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub reviewers: Vec<AgentEntry>,
    pub executors: Vec<AgentEntry>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            reviewers: vec![AgentEntry {
                id: "reviewer-1".to_string(),
                command: vec!["codex".to_string()],
            }],
            executors: vec![AgentEntry {
                id: "executor-1".to_string(),
                command: vec!["claude".to_string()],
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestingConfig {
    /// Run `install_command` before tests when a package manifest exists but
    /// its dependency directory is missing.
    pub install_if_missing: bool,
    pub install_command: Vec<String>,
    /// Fallback unit test command when a plan reports `test_commands: null`.
    pub unit_command: Vec<String>,
    /// Fallback end-to-end command, same condition.
    pub e2e_command: Vec<String>,
    /// Global per-command timeout; plans may override per command.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            install_if_missing: false,
            install_command: vec!["npm".to_string(), "install".to_string()],
            unit_command: vec!["npm".to_string(), "test".to_string()],
            e2e_command: vec![
                "npx".to_string(),
                "playwright".to_string(),
                "test".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptConfig {
    /// Poll interval for prompt response files.
    pub poll_interval_secs: u64,
    /// Optional overall deadline for any human response. 0 means wait forever.
    pub timeout_secs: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentInvokeConfig {
    /// Wall-clock budget for one agent invocation.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Retries for invocation/protocol failures, with exponential backoff.
    pub max_retries: u32,
}

impl Default for AgentInvokeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            max_retries: 2,
        }
    }
}

impl LuigiConfig {
    pub fn validate(&self) -> Result<()> {
        let orch = &self.orchestrator;
        if !matches!(
            orch.workspace_strategy.as_str(),
            "auto" | "in_place" | "copy" | "worktree"
        ) {
            return Err(LuigiError::config(format!(
                "orchestrator.workspace_strategy must be auto|in_place|copy|worktree, got {:?}",
                orch.workspace_strategy
            ))
            .into());
        }
        if !matches!(orch.cleanup.as_str(), "always" | "on_success" | "never") {
            return Err(LuigiError::config(format!(
                "orchestrator.cleanup must be always|on_success|never, got {:?}",
                orch.cleanup
            ))
            .into());
        }
        if !matches!(orch.dirty_target_policy.as_str(), "commit" | "abort") {
            return Err(LuigiError::config(format!(
                "orchestrator.dirty_target_policy must be commit|abort, got {:?}",
                orch.dirty_target_policy
            ))
            .into());
        }
        if orch.executors_per_plan == 0 {
            return Err(LuigiError::config("orchestrator.executors_per_plan must be >= 1").into());
        }
        if orch.branch_prefix.trim().is_empty() {
            return Err(LuigiError::config("orchestrator.branch_prefix must be non-empty").into());
        }
        if self.agents.reviewers.is_empty() {
            return Err(LuigiError::config("agents.reviewers must not be empty").into());
        }
        if self.agents.executors.is_empty() {
            return Err(LuigiError::config("agents.executors must not be empty").into());
        }
        let mut seen = Vec::new();
        for agent in self.agents.reviewers.iter().chain(&self.agents.executors) {
            if agent.id.trim().is_empty() {
                return Err(LuigiError::config("agent id must be non-empty").into());
            }
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(LuigiError::config(format!(
                    "agent {} command must be a non-empty array",
                    agent.id
                ))
                .into());
            }
            if seen.contains(&agent.id) {
                return Err(
                    LuigiError::config(format!("duplicate agent id {:?}", agent.id)).into(),
                );
            }
            seen.push(agent.id.clone());
        }
        if self.testing.output_limit_bytes == 0 {
            return Err(LuigiError::config("testing.output_limit_bytes must be > 0").into());
        }
        if self.testing.timeout_secs == 0 {
            return Err(LuigiError::config("testing.timeout_secs must be > 0").into());
        }
        if self.agent_invoke.timeout_secs == 0 {
            return Err(LuigiError::config("agent_invoke.timeout_secs must be > 0").into());
        }
        if self.prompt.poll_interval_secs == 0 {
            return Err(LuigiError::config("prompt.poll_interval_secs must be > 0").into());
        }
        Ok(())
    }

    /// Iteration cap as an option; `None` means unlimited.
    pub fn max_iterations(&self) -> Option<u32> {
        match self.orchestrator.max_iterations {
            0 => None,
            n => Some(n),
        }
    }
}

/// Resolve the effective config file path.
///
/// Precedence: explicit `--config`, then `<repo>/.luigi/config.toml`, then
/// built-in defaults (no file).
pub fn resolve_config_path(explicit: Option<&Path>, repo_path: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let repo_local = repo_path.join(".luigi").join("config.toml");
    if repo_local.exists() {
        return Some(repo_local);
    }
    None
}

/// Load config from a TOML file. A `None` path yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<LuigiConfig> {
    let Some(path) = path else {
        let cfg = LuigiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: LuigiConfig =
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LuigiConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
