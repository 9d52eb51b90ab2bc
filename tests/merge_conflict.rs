//! Approved worktree run whose target-branch merge conflicts: the conflict
//! is delegated to an executor agent, the retried merge succeeds, and the
//! target branch ends with a merge commit.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use luigi::cancel::CancelToken;
use luigi::core::types::RunStatus;
use luigi::io::agent::{Agent, ExecutorReply, ExecutorStatus};
use luigi::io::config::LuigiConfig;
use luigi::orchestrator::{AgentSet, Orchestrator};
use luigi::test_support::{
    ScriptedAgent, ScriptedExec, approve_review, init_git_repo, ready_plan, sh_command,
};

fn git(repo: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .expect("run git");
    assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn merge_conflict_is_delegated_and_resolved() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(&repo).expect("mkdir");
    init_git_repo(&repo);

    let mut cfg = LuigiConfig::default();
    cfg.orchestrator.workspace_strategy = "worktree".to_string();
    cfg.orchestrator.auto_merge_on_approval = true;
    cfg.orchestrator.merge_target_branch = "main".to_string();
    cfg.orchestrator.max_iterations = 2;
    cfg.orchestrator.logs_dir = temp.path().join("logs");
    cfg.orchestrator.workspaces_dir = temp.path().join("workspaces");
    cfg.prompt.poll_interval_secs = 1;
    cfg.prompt.timeout_secs = 30;

    let candidate = "iter0-c00-reviewer-1-executor-1";
    let repo_for_hook = repo.clone();
    let repo_for_resolve = repo.clone();

    // First execution edits README in the worktree and, like a concurrent
    // developer, lands a conflicting commit on main.
    let implement = ScriptedExec {
        files: vec![(PathBuf::from("README.md"), "worktree version\n".to_string())],
        hook: Some(Box::new(move |_workdir| {
            fs::write(repo_for_hook.join("README.md"), "main version\n")?;
            git(&repo_for_hook, &["add", "-A"]);
            git(&repo_for_hook, &["commit", "-q", "-m", "concurrent main edit"]);
            Ok(())
        })),
        reply: ExecutorReply {
            status: ExecutorStatus::Done,
            summary: "edited README".to_string(),
            session_id: None,
        },
    };

    // Second execution is the conflict delegation: resolve and stage.
    let resolve = ScriptedExec {
        files: Vec::new(),
        hook: Some(Box::new(move |_workdir| {
            fs::write(repo_for_resolve.join("README.md"), "resolved version\n")?;
            git(&repo_for_resolve, &["add", "-A"]);
            Ok(())
        })),
        reply: ExecutorReply {
            status: ExecutorStatus::Done,
            summary: "resolved conflicts".to_string(),
            session_id: None,
        },
    };

    let reviewer = Arc::new(
        ScriptedAgent::new("reviewer-1")
            .with_plan(ready_plan("edit the README", Some(vec![sh_command("true")])))
            .with_review(candidate, approve_review(&[candidate])),
    );
    let executor = Arc::new(
        ScriptedAgent::new("executor-1")
            .with_exec(implement)
            .with_exec(resolve),
    );

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        repo.clone(),
        false,
        CancelToken::new(),
        {
            let reviewer = reviewer.clone();
            let executor = executor.clone();
            move |_, _| AgentSet {
                reviewers: vec![reviewer as Arc<dyn Agent>],
                executors: vec![executor as Arc<dyn Agent>],
            }
        },
    )
    .expect("orchestrator");
    let run_id = orchestrator.run_id();

    let status = orchestrator
        .run(Some("edit the README".to_string()))
        .expect("run");
    assert_eq!(status, RunStatus::Completed);

    // The resolved content is on main, behind a merge commit.
    assert_eq!(
        fs::read_to_string(repo.join("README.md")).expect("read"),
        "resolved version\n"
    );
    assert_eq!(git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "main");
    let merges = git(&repo, &["log", "--merges", "--oneline"]);
    assert_eq!(merges.lines().count(), 1, "expected one merge commit");

    // The merged candidate branch was deleted after its worktree was
    // dropped.
    let branches = git(&repo, &["branch", "--list", "luigi/*"]);
    assert!(branches.trim().is_empty(), "candidate branch should be gone: {branches}");

    let raw = fs::read_to_string(cfg.orchestrator.logs_dir.join(&run_id).join("state.json"))
        .expect("read state");
    let snapshot: luigi::core::types::RunSnapshot =
        serde_json::from_str(&raw).expect("parse state");
    assert!(snapshot.persisted);
    assert!(snapshot.merge_commit_sha.is_some());
    assert!(snapshot.commit_sha.is_some());
}
