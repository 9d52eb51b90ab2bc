//! Workspace provisioning, change capture, and persistence.
//!
//! Each candidate gets an isolated working tree under
//! `<base>/<run>/iter_<n>/cand_<slug>/`: a git worktree on a deterministic
//! branch when the repo supports it, a baseline+workspace copy pair
//! otherwise, or the repo itself for in-place runs. Provisioning is
//! idempotent so crash-resume reattaches existing directories instead of
//! recreating them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::WorkspaceStrategy;
use crate::error::LuigiError;
use crate::io::git::Git;

/// Byte bound for the textual diff kept in a change summary.
const DIFF_LIMIT_BYTES: usize = 200_000;

/// Directory names never copied into baselines or workspaces.
const COPY_IGNORE: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".DS_Store",
    "logs",
];

/// A materialized working tree owned by one candidate (or one iteration
/// baseline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// The original repository changes eventually land in.
    pub repo_path: PathBuf,
    /// Where the executor operates.
    pub path: PathBuf,
    pub strategy: WorkspaceStrategy,
    /// Per-candidate directory holding the workspace and its artifacts.
    pub run_dir: PathBuf,
    /// Pristine snapshot for copy/in-place diffing.
    pub baseline_path: Option<PathBuf>,
    /// Worktree branch, when the strategy is worktree.
    pub branch_name: Option<String>,
}

/// Changed-file summary captured from a workspace. Never mutates anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub changed_paths: Vec<String>,
    pub total_bytes: u64,
    /// Unified diff, truncated to a bound.
    pub diff: String,
}

impl ChangeSummary {
    /// First `max_lines` lines of the diff, for prompts and admin requests.
    pub fn diff_preview(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.diff.lines().take(max_lines).collect();
        lines.join("\n")
    }
}

/// How a provision request picks its strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyChoice {
    /// Worktree when the repo has a commit, copy otherwise.
    Auto,
    Explicit(WorkspaceStrategy),
}

impl StrategyChoice {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::Auto),
            "in_place" => Ok(Self::Explicit(WorkspaceStrategy::InPlace)),
            "copy" => Ok(Self::Explicit(WorkspaceStrategy::Copy)),
            "worktree" => Ok(Self::Explicit(WorkspaceStrategy::Worktree)),
            other => Err(anyhow!(LuigiError::config(format!(
                "unknown workspace strategy {other:?}"
            )))),
        }
    }
}

/// Inputs for provisioning one candidate workspace.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub repo_path: &'a Path,
    /// Tree the workspace content starts from; the repo itself on iteration
    /// 0, a carried-forward baseline afterwards.
    pub source_path: &'a Path,
    pub run_id: &'a str,
    pub iteration: u32,
    pub candidate_id: &'a str,
    pub strategy: StrategyChoice,
    pub branch_prefix: &'a str,
    pub branch_suffix_len: usize,
}

/// Creates, snapshots, persists, and disposes workspaces.
///
/// Operations on distinct workspaces are independent; operations that touch
/// the source repository (worktree registry, merges) are serialized through
/// `repo_lock`.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    repo_lock: Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|err| {
            anyhow!(LuigiError::workspace(format!(
                "create workspace base {}: {err}",
                base_dir.display()
            )))
        })?;
        Ok(Self {
            base_dir,
            repo_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Serialize an operation against the source repository.
    pub fn with_repo_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.repo_lock.lock().expect("repo lock poisoned");
        f()
    }

    /// Provision a candidate workspace; reuses existing directories when
    /// resuming.
    pub fn provision(&self, request: &ProvisionRequest<'_>) -> Result<Workspace> {
        let run_dir = self.candidate_dir(request.run_id, request.iteration, request.candidate_id)?;
        fs::create_dir_all(&run_dir).map_err(|err| {
            anyhow!(LuigiError::workspace(format!(
                "create candidate dir {}: {err}",
                run_dir.display()
            )))
        })?;

        let strategy = self.resolve_strategy(request)?;
        match strategy {
            WorkspaceStrategy::Worktree => self.provision_worktree(request, &run_dir),
            WorkspaceStrategy::Copy => self.provision_copy(request, &run_dir),
            WorkspaceStrategy::InPlace => self.provision_in_place(request, &run_dir),
        }
    }

    /// Reattach a persisted candidate workspace, best-effort. `None` means
    /// the caller should provision a fresh one.
    pub fn reattach(
        &self,
        repo_path: &Path,
        strategy: WorkspaceStrategy,
        workspace_path: Option<&Path>,
    ) -> Option<Workspace> {
        match strategy {
            WorkspaceStrategy::Worktree => {
                let path = workspace_path?;
                if path.is_dir() && Git::new(path).is_repo() {
                    Some(Workspace {
                        repo_path: repo_path.to_path_buf(),
                        path: path.to_path_buf(),
                        strategy,
                        run_dir: path.parent()?.to_path_buf(),
                        baseline_path: None,
                        branch_name: Git::new(path).current_branch().ok(),
                    })
                } else {
                    None
                }
            }
            WorkspaceStrategy::Copy => {
                let path = workspace_path?;
                let baseline = path.parent()?.join("baseline");
                if path.is_dir() && baseline.is_dir() {
                    Some(Workspace {
                        repo_path: repo_path.to_path_buf(),
                        path: path.to_path_buf(),
                        strategy,
                        run_dir: path.parent()?.to_path_buf(),
                        baseline_path: Some(baseline),
                        branch_name: None,
                    })
                } else {
                    None
                }
            }
            WorkspaceStrategy::InPlace => {
                let run_dir = workspace_path?.parent()?.to_path_buf();
                let baseline = run_dir.join("baseline");
                Some(Workspace {
                    repo_path: repo_path.to_path_buf(),
                    path: repo_path.to_path_buf(),
                    strategy,
                    run_dir,
                    baseline_path: baseline.is_dir().then_some(baseline),
                    branch_name: None,
                })
            }
        }
    }

    /// Capture changed paths, their byte total, and a bounded diff.
    pub fn snapshot_changes(&self, workspace: &Workspace) -> Result<ChangeSummary> {
        match workspace.strategy {
            WorkspaceStrategy::Worktree => {
                let git = Git::new(&workspace.path);
                let changed_paths: Vec<String> = git
                    .status_porcelain()?
                    .into_iter()
                    .map(|entry| entry.path)
                    .collect();
                let total_bytes = changed_paths
                    .iter()
                    .filter_map(|rel| fs::metadata(workspace.path.join(rel)).ok())
                    .map(|meta| meta.len())
                    .sum();
                let diff = truncate_bytes(git.diff()?, DIFF_LIMIT_BYTES);
                Ok(ChangeSummary {
                    changed_paths,
                    total_bytes,
                    diff,
                })
            }
            WorkspaceStrategy::Copy | WorkspaceStrategy::InPlace => {
                let Some(baseline) = &workspace.baseline_path else {
                    return Ok(ChangeSummary::default());
                };
                let changed = diff_trees(baseline, &workspace.path)?;
                let total_bytes = changed
                    .iter()
                    .filter_map(|rel| fs::metadata(workspace.path.join(rel)).ok())
                    .map(|meta| meta.len())
                    .sum();
                let diff = truncate_bytes(
                    Git::new(&workspace.path).diff_no_index(baseline, &workspace.path)?,
                    DIFF_LIMIT_BYTES,
                );
                Ok(ChangeSummary {
                    changed_paths: changed,
                    total_bytes,
                    diff,
                })
            }
        }
    }

    /// Apply a copy-strategy workspace back onto the repository, including
    /// deletions relative to the baseline. Worktree persistence goes through
    /// git (commit + merge) and in-place needs nothing.
    pub fn apply_changes(&self, workspace: &Workspace) -> Result<()> {
        if workspace.strategy != WorkspaceStrategy::Copy {
            return Ok(());
        }
        let baseline = workspace.baseline_path.as_ref().ok_or_else(|| {
            anyhow!(LuigiError::workspace(
                "cannot apply copy workspace without a baseline snapshot"
            ))
        })?;
        sync_tree(&workspace.path, &workspace.repo_path, baseline)
    }

    /// Copy a workspace into a fresh baseline directory for the next
    /// iteration. Always copy, regardless of the run strategy, so
    /// uncommitted changes survive.
    pub fn adopt_as_baseline(
        &self,
        workspace: &Workspace,
        run_id: &str,
        next_iteration: u32,
    ) -> Result<PathBuf> {
        let dest = self
            .base_dir
            .join(sanitize_component(run_id, 80))
            .join(format!("iter_{next_iteration}"))
            .join("baseline");
        if dest.is_dir() {
            fs::remove_dir_all(&dest).map_err(|err| {
                anyhow!(LuigiError::workspace(format!(
                    "clear stale baseline {}: {err}",
                    dest.display()
                )))
            })?;
        }
        copy_tree(&workspace.path, &dest)
            .with_context(|| format!("adopt {} as baseline", workspace.path.display()))?;
        Ok(dest)
    }

    /// Best-effort disposal; never fatal. Unregisters any git worktrees
    /// nested under the candidate dir before deleting it, so the repo does
    /// not accumulate stale worktree entries.
    pub fn dispose(&self, workspace: &Workspace) {
        let _guard = self.repo_lock.lock().expect("repo lock poisoned");
        let git = Git::new(&workspace.repo_path);
        if git.is_repo() {
            if let Ok(entries) = git.worktree_list() {
                for entry in entries {
                    if entry.path.starts_with(&workspace.run_dir) {
                        let _ = git.worktree_remove(&entry.path);
                    }
                }
                let _ = git.worktree_prune();
            }
        }
        if workspace.strategy != WorkspaceStrategy::InPlace && workspace.run_dir.is_dir() {
            if let Err(err) = fs::remove_dir_all(&workspace.run_dir) {
                warn!(dir = %workspace.run_dir.display(), %err, "workspace cleanup failed");
            }
        } else if workspace.strategy == WorkspaceStrategy::InPlace {
            // Only the baseline snapshot belongs to us.
            if let Some(baseline) = &workspace.baseline_path {
                let _ = fs::remove_dir_all(baseline);
            }
        }
    }

    fn resolve_strategy(&self, request: &ProvisionRequest<'_>) -> Result<WorkspaceStrategy> {
        match request.strategy {
            StrategyChoice::Explicit(strategy) => {
                if strategy == WorkspaceStrategy::Worktree {
                    let git = Git::new(request.repo_path);
                    if !git.is_repo() || !git.has_commit() {
                        return Err(anyhow!(LuigiError::workspace(
                            "worktree strategy requires a git repo with at least one commit"
                        )));
                    }
                }
                Ok(strategy)
            }
            StrategyChoice::Auto => {
                let git = Git::new(request.repo_path);
                if git.is_repo() && git.has_commit() {
                    Ok(WorkspaceStrategy::Worktree)
                } else {
                    Ok(WorkspaceStrategy::Copy)
                }
            }
        }
    }

    fn provision_worktree(
        &self,
        request: &ProvisionRequest<'_>,
        run_dir: &Path,
    ) -> Result<Workspace> {
        let _guard = self.repo_lock.lock().expect("repo lock poisoned");
        let git = Git::new(request.repo_path);
        let worktree_path = run_dir.join("worktree");
        let branch_name = candidate_branch(
            request.branch_prefix,
            request.run_id,
            request.iteration,
            request.candidate_id,
            request.branch_suffix_len,
        );

        // Resume: the worktree directory is already materialized.
        if worktree_path.is_dir() && Git::new(&worktree_path).is_repo() {
            debug!(path = %worktree_path.display(), "reusing existing worktree");
            return Ok(Workspace {
                repo_path: request.repo_path.to_path_buf(),
                path: worktree_path,
                strategy: WorkspaceStrategy::Worktree,
                run_dir: run_dir.to_path_buf(),
                baseline_path: None,
                branch_name: Some(branch_name),
            });
        }

        // Resume: the branch is checked out elsewhere (crash between
        // worktree creation and state write).
        if let Some(existing) = git.worktree_for_branch(&branch_name)? {
            if existing.is_dir() && Git::new(&existing).is_repo() {
                debug!(path = %existing.display(), "reattaching worktree by branch");
                return Ok(Workspace {
                    repo_path: request.repo_path.to_path_buf(),
                    path: existing,
                    strategy: WorkspaceStrategy::Worktree,
                    run_dir: run_dir.to_path_buf(),
                    baseline_path: None,
                    branch_name: Some(branch_name),
                });
            }
            // Registered but gone from disk: clear it so add can succeed.
            let _ = git.worktree_remove(&existing);
            let _ = git.worktree_prune();
        }

        let force = stale_registration(&git, &worktree_path)?;
        let create_branch = !git.branch_exists(&branch_name)?;
        git.worktree_add(&worktree_path, &branch_name, create_branch, force)
            .map_err(|err| anyhow!(LuigiError::workspace(format!("git worktree add: {err:#}"))))?;

        Ok(Workspace {
            repo_path: request.repo_path.to_path_buf(),
            path: worktree_path,
            strategy: WorkspaceStrategy::Worktree,
            run_dir: run_dir.to_path_buf(),
            baseline_path: None,
            branch_name: Some(branch_name),
        })
    }

    fn provision_copy(&self, request: &ProvisionRequest<'_>, run_dir: &Path) -> Result<Workspace> {
        let baseline_path = run_dir.join("baseline");
        let workspace_path = run_dir.join("workspace");

        // Resume: both trees already exist.
        if baseline_path.is_dir() && workspace_path.is_dir() {
            debug!(path = %workspace_path.display(), "reusing existing copy workspace");
        } else {
            if baseline_path.exists() {
                let _ = fs::remove_dir_all(&baseline_path);
            }
            if workspace_path.exists() {
                let _ = fs::remove_dir_all(&workspace_path);
            }
            copy_tree(request.source_path, &baseline_path)
                .with_context(|| "snapshot baseline")?;
            copy_tree(&baseline_path, &workspace_path).with_context(|| "seed workspace")?;
        }

        Ok(Workspace {
            repo_path: request.repo_path.to_path_buf(),
            path: workspace_path,
            strategy: WorkspaceStrategy::Copy,
            run_dir: run_dir.to_path_buf(),
            baseline_path: Some(baseline_path),
            branch_name: None,
        })
    }

    fn provision_in_place(
        &self,
        request: &ProvisionRequest<'_>,
        run_dir: &Path,
    ) -> Result<Workspace> {
        let baseline_path = run_dir.join("baseline");
        if !baseline_path.is_dir() {
            copy_tree(request.source_path, &baseline_path)
                .with_context(|| "snapshot in-place baseline")?;
        }
        Ok(Workspace {
            repo_path: request.repo_path.to_path_buf(),
            path: request.repo_path.to_path_buf(),
            strategy: WorkspaceStrategy::InPlace,
            run_dir: run_dir.to_path_buf(),
            baseline_path: Some(baseline_path),
            branch_name: None,
        })
    }

    fn candidate_dir(&self, run_id: &str, iteration: u32, candidate_id: &str) -> Result<PathBuf> {
        let run_component = sanitize_component(run_id, 80);
        let cand_component = sanitize_component(candidate_id, 80);
        Ok(self
            .base_dir
            .join(run_component)
            .join(format!("iter_{iteration}"))
            .join(format!("cand_{cand_component}")))
    }
}

/// Deterministic worktree branch name for one candidate.
fn candidate_branch(
    prefix: &str,
    run_id: &str,
    iteration: u32,
    candidate_id: &str,
    suffix_len: usize,
) -> String {
    let prefix = sanitize_component(prefix, 24);
    let short_run: String = run_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    let suffix = short_hash(candidate_id, suffix_len.clamp(4, 16));
    format!("{prefix}/{short_run}-i{iteration}-{suffix}")
}

fn short_hash(value: &str, len: usize) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..len.min(hex.len())].to_string()
}

/// Keep only filesystem-safe characters in a path component.
fn sanitize_component(value: &str, max_len: usize) -> String {
    let mut cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-')).to_string();
    if cleaned.is_empty() {
        cleaned = "x".to_string();
    }
    if cleaned.len() > max_len {
        let digest = short_hash(value, 12);
        cleaned.truncate(max_len.saturating_sub(13).max(1));
        cleaned.push('_');
        cleaned.push_str(&digest);
    }
    cleaned
}

/// A worktree path registered with git but missing from disk.
fn stale_registration(git: &Git, path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let registered = git
        .worktree_list()?
        .iter()
        .any(|entry| entry.path == path);
    if registered {
        let _ = git.worktree_remove(path);
        let _ = git.worktree_prune();
        return Ok(true);
    }
    Ok(false)
}

/// Recursively copy `src` into `dst`, skipping the ignore set and symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if COPY_IGNORE.contains(&name.to_string_lossy().as_ref()) {
            continue;
        }
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(&name);
        if file_type.is_symlink() {
            debug!(path = %from.display(), "skipping symlink during copy");
            continue;
        }
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

/// Relative paths of files that differ between two trees (changed, added,
/// or deleted), sorted.
fn diff_trees(baseline: &Path, workspace: &Path) -> Result<Vec<String>> {
    let base_files = walk_files(baseline)?;
    let work_files = walk_files(workspace)?;
    let mut changed = Vec::new();
    for rel in &work_files {
        match base_files.binary_search(rel) {
            Ok(_) => {
                let before = fs::read(baseline.join(rel)).unwrap_or_default();
                let after = fs::read(workspace.join(rel)).unwrap_or_default();
                if before != after {
                    changed.push(rel.clone());
                }
            }
            Err(_) => changed.push(rel.clone()),
        }
    }
    for rel in &base_files {
        if work_files.binary_search(rel).is_err() {
            changed.push(rel.clone());
        }
    }
    changed.sort();
    changed.dedup();
    Ok(changed)
}

/// All file paths under `root`, relative, sorted.
fn walk_files(root: &Path) -> Result<Vec<String>> {
    fn inner(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                inner(root, &entry.path(), out)?;
            } else {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .expect("walked path under root")
                    .to_string_lossy()
                    .into_owned();
                out.push(rel);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    if root.is_dir() {
        inner(root, root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

/// Sync `src` into `dst`, deleting files that existed in `baseline` but were
/// removed in `src`. Refuses to write through symlinks.
fn sync_tree(src: &Path, dst: &Path, baseline: &Path) -> Result<()> {
    let src_files = walk_files(src)?;
    let baseline_files = walk_files(baseline)?;

    for rel in &src_files {
        let from = src.join(rel);
        let to = safe_dest_path(dst, rel)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(&from, &to)
            .with_context(|| format!("apply {} -> {}", from.display(), to.display()))?;
    }

    for rel in &baseline_files {
        if src_files.binary_search(rel).is_err() {
            let target = safe_dest_path(dst, rel)?;
            if target.is_file() {
                fs::remove_file(&target)
                    .with_context(|| format!("delete {}", target.display()))?;
            }
        }
    }
    Ok(())
}

/// Resolve `rel` under `root`, refusing traversal and symlinked directories
/// along the way so a hostile workspace cannot write outside the repo.
fn safe_dest_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(anyhow!(LuigiError::workspace(format!(
            "refusing to write outside destination root: {rel}"
        ))));
    }
    let mut cursor = root.to_path_buf();
    let components: Vec<_> = rel_path.components().collect();
    for component in &components[..components.len().saturating_sub(1)] {
        cursor.push(component);
        if cursor.is_symlink() {
            return Err(anyhow!(LuigiError::workspace(format!(
                "refusing to write through symlinked directory {}",
                cursor.display()
            ))));
        }
    }
    let dest = root.join(rel_path);
    if dest.is_symlink() {
        return Err(anyhow!(LuigiError::workspace(format!(
            "refusing to overwrite symlink {}",
            dest.display()
        ))));
    }
    Ok(dest)
}

fn truncate_bytes(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... [truncated] ...");
    text
}
