//! Git adapter for workspace and merge operations.
//!
//! The orchestrator drives git for worktree provisioning, approval commits,
//! and target-branch merges, so we keep a small, explicit wrapper around
//! `git` subprocess calls rather than linking a git library.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Checked-out branch ref, if any (detached worktrees have none).
    pub branch: Option<String>,
}

/// Result of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge stopped with these unmerged paths.
    Conflicts(Vec<String>),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir is inside a git working tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// True when the repo has at least one commit (HEAD resolves).
    pub fn has_commit(&self) -> bool {
        self.run(&["rev-parse", "--verify", "HEAD"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to operate)"));
        }
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Unified diff of tracked changes in the working tree.
    pub fn diff(&self) -> Result<String> {
        self.run_capture(&["diff"])
    }

    /// Diff two directories outside any repo context. Exit code 1 means
    /// "differences found", not failure.
    pub fn diff_no_index(&self, left: &Path, right: &Path) -> Result<String> {
        let left = left.to_string_lossy().into_owned();
        let right = right.to_string_lossy().into_owned();
        let out = self.run(&["diff", "--no-index", "--", &left, &right])?;
        match out.status.code() {
            Some(0) | Some(1) => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
            _ => Err(anyhow!(
                "git diff --no-index failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Delete a local branch with `-d`; returns false when git refuses
    /// (unmerged) or the branch does not exist.
    pub fn delete_branch(&self, branch: &str) -> Result<bool> {
        if !self.branch_exists(branch)? {
            return Ok(false);
        }
        let out = self.run(&["branch", "-d", branch])?;
        if !out.status.success() {
            warn!(branch, "branch delete refused");
            return Ok(false);
        }
        Ok(true)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Stage and commit everything; returns the new commit sha, or `None`
    /// when the tree was already clean.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        if !self.has_changes()? {
            debug!("nothing to commit");
            return Ok(None);
        }
        self.add_all()?;
        self.run_checked(&["commit", "-m", message])?;
        Ok(Some(self.head_sha()?))
    }

    /// Materialize a worktree at `path`. `create_branch` makes a new branch
    /// at HEAD; otherwise the existing branch is checked out. `force` clears
    /// stale registrations left behind by deleted directories.
    pub fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        create_branch: bool,
        force: bool,
    ) -> Result<()> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if force {
            args.push("-f");
        }
        if create_branch {
            args.extend(["-b", branch, &path_str]);
        } else {
            args.extend([&path_str, branch]);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(WorktreeEntry {
                    path: PathBuf::from(path.trim()),
                    branch: None,
                });
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(entry) = current.as_mut() {
                    entry.branch = Some(
                        branch
                            .trim()
                            .strip_prefix("refs/heads/")
                            .unwrap_or(branch.trim())
                            .to_string(),
                    );
                }
            }
        }
        if let Some(entry) = current {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Path of the worktree where `branch` is checked out, if any.
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .worktree_list()?
            .into_iter()
            .find(|entry| entry.branch.as_deref() == Some(branch))
            .map(|entry| entry.path))
    }

    /// Best-effort worktree removal; worktrees may carry uncommitted changes.
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().into_owned();
        let out = self.run(&["worktree", "remove", "--force", &path_str])?;
        if !out.status.success() {
            debug!(path = %path.display(), "worktree remove refused");
        }
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run(&["worktree", "prune"])?;
        Ok(())
    }

    /// Merge `branch` into the current branch with a merge commit.
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        let out = self.run(&["merge", "--no-ff", "-m", message, branch])?;
        if out.status.success() {
            return Ok(MergeOutcome::Merged);
        }
        let conflicts = self.unmerged_files()?;
        if conflicts.is_empty() {
            return Err(anyhow!(
                "git merge {branch} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(MergeOutcome::Conflicts(conflicts))
    }

    pub fn unmerged_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn merge_in_progress(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
        Ok(out.status.success())
    }

    /// Conclude an in-progress merge after conflicts were resolved.
    pub fn commit_merge(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "-m", message])?;
        Ok(())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, renamed)) = path.split_once("->") {
        path = renamed.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
