//! Crash-resume: a run killed between execution and review re-enters at the
//! review phase without re-running executors.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use luigi::cancel::CancelToken;
use luigi::core::types::{
    Candidate, CandidateStatus, CommandRecord, Decision, IterationRecord, Plan, PlanTask,
    RunSnapshot, RunStatus, TestReport, WorkspaceStrategy,
};
use luigi::io::agent::Agent;
use luigi::io::config::LuigiConfig;
use luigi::io::state::StateStore;
use luigi::io::workspace::{ProvisionRequest, StrategyChoice, WorkspaceManager};
use luigi::orchestrator::{AgentSet, Orchestrator};
use luigi::test_support::{ScriptedAgent, approve_review, reject_review};

const RUN_ID: &str = "run-resume-1";
const C1: &str = "iter0-c00-reviewer-1-executor-1";
const C2: &str = "iter0-c01-reviewer-1-executor-2";

fn test_config(root: &Path) -> LuigiConfig {
    let mut cfg = LuigiConfig::default();
    cfg.orchestrator.workspace_strategy = "copy".to_string();
    cfg.orchestrator.executors_per_plan = 2;
    cfg.orchestrator.logs_dir = root.join("logs");
    cfg.orchestrator.workspaces_dir = root.join("workspaces");
    cfg.prompt.poll_interval_secs = 1;
    cfg.prompt.timeout_secs = 30;
    cfg
}

fn passing_report() -> TestReport {
    TestReport {
        commands: vec![CommandRecord {
            argv: vec!["true".to_string()],
            exit_code: 0,
            duration_ms: 3,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        }],
        installed_deps: None,
    }
}

fn done_candidate(id: &str, executor: &str, workspace_path: &Path) -> Candidate {
    let mut candidate =
        Candidate::new(id.to_string(), "reviewer-1".to_string(), executor.to_string());
    candidate.status = CandidateStatus::Done;
    candidate.workspace_path = Some(workspace_path.to_path_buf());
    candidate.workspace_strategy = Some(WorkspaceStrategy::Copy);
    candidate.session_id = Some(format!("session-{executor}"));
    candidate.summary = Some("implemented".to_string());
    candidate.test_report = Some(passing_report());
    candidate.changed_paths = vec!["app.txt".to_string()];
    candidate
}

/// Build the state a crashed process would leave behind: plans written, two
/// candidates executed and tested, no reviews yet.
fn seed_crashed_run(cfg: &LuigiConfig, repo: &Path) {
    let manager = WorkspaceManager::new(&cfg.orchestrator.workspaces_dir).expect("manager");
    let mut workspaces = Vec::new();
    for (candidate_id, content) in [(C1, "candidate one\n"), (C2, "candidate two\n")] {
        let workspace = manager
            .provision(&ProvisionRequest {
                repo_path: repo,
                source_path: repo,
                run_id: RUN_ID,
                iteration: 0,
                candidate_id,
                strategy: StrategyChoice::Explicit(WorkspaceStrategy::Copy),
                branch_prefix: "luigi",
                branch_suffix_len: 6,
            })
            .expect("provision");
        fs::write(workspace.path.join("app.txt"), content).expect("write");
        workspaces.push(workspace);
    }

    let mut snapshot = RunSnapshot::new(
        RUN_ID.to_string(),
        repo.to_path_buf(),
        Utc::now().to_rfc3339(),
    );
    snapshot.status = RunStatus::Running;
    snapshot.task = Some("improve app".to_string());
    let mut iteration = IterationRecord::new(0, snapshot.created_at.clone());
    iteration.plans.push(Plan {
        reviewer_id: "reviewer-1".to_string(),
        executor_prompt: "improve the app".to_string(),
        tasks: vec![PlanTask {
            id: "t1".to_string(),
            title: "improve".to_string(),
            description: "improve the app".to_string(),
        }],
        test_commands: Some(vec![]),
        notes: None,
    });
    iteration
        .candidates
        .push(done_candidate(C1, "executor-1", &workspaces[0].path));
    iteration
        .candidates
        .push(done_candidate(C2, "executor-2", &workspaces[1].path));
    snapshot.iterations.push(iteration);

    StateStore::create(&cfg.orchestrator.logs_dir, snapshot).expect("seed state");
}

#[test]
fn resume_reenters_at_review_without_reexecuting() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(&repo).expect("mkdir");
    fs::write(repo.join("app.txt"), "original\n").expect("write");

    let cfg = test_config(temp.path());
    seed_crashed_run(&cfg, &repo);

    // Executors have nothing scripted: any execute call would fail the test.
    let reviewer = Arc::new(
        ScriptedAgent::new("reviewer-1")
            .with_review(C1, approve_review(&[C1, C2]))
            .with_review(C2, reject_review(&[C1, C2], "prefer candidate one")),
    );
    let executor_1 = Arc::new(ScriptedAgent::new("executor-1"));
    let executor_2 = Arc::new(ScriptedAgent::new("executor-2"));

    let orchestrator = Orchestrator::resume(
        cfg.clone(),
        repo.clone(),
        RUN_ID,
        false,
        CancelToken::new(),
        {
            let reviewer = reviewer.clone();
            let (e1, e2) = (executor_1.clone(), executor_2.clone());
            move |_, _| AgentSet {
                reviewers: vec![reviewer as Arc<dyn Agent>],
                executors: vec![e1 as Arc<dyn Agent>, e2 as Arc<dyn Agent>],
            }
        },
    )
    .expect("resume");

    let status = orchestrator.run(None).expect("run");
    assert_eq!(status, RunStatus::Completed);

    // No executor was re-invoked; the persisted workspaces were reused.
    assert!(executor_1.seen_sessions().is_empty());
    assert!(executor_2.seen_sessions().is_empty());

    // Candidate one won and its workspace content landed in the repo.
    assert_eq!(
        fs::read_to_string(repo.join("app.txt")).expect("read"),
        "candidate one\n"
    );

    let raw = fs::read_to_string(
        cfg.orchestrator
            .logs_dir
            .join(RUN_ID)
            .join("state.json"),
    )
    .expect("read state");
    let snapshot: RunSnapshot = serde_json::from_str(&raw).expect("parse");
    assert_eq!(snapshot.status, RunStatus::Completed);
    let iteration = &snapshot.iterations[0];
    assert_eq!(iteration.decision, Some(Decision::Approved));
    assert_eq!(iteration.winner_candidate_id.as_deref(), Some(C1));
    assert_eq!(iteration.reviews.len(), 2);
    // Executor sessions survive resume for any later clarification rounds.
    assert_eq!(
        iteration.candidate(C1).expect("candidate").session_id.as_deref(),
        Some("session-executor-1")
    );
}

#[test]
fn resume_rejects_mismatched_repo() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    let other = temp.path().join("other");
    fs::create_dir_all(&repo).expect("mkdir");
    fs::create_dir_all(&other).expect("mkdir");

    let cfg = test_config(temp.path());
    seed_crashed_run(&cfg, &repo);

    let err = Orchestrator::resume(
        cfg,
        other,
        RUN_ID,
        false,
        CancelToken::new(),
        |_, _| AgentSet {
            reviewers: vec![Arc::new(ScriptedAgent::new("reviewer-1")) as Arc<dyn Agent>],
            executors: vec![Arc::new(ScriptedAgent::new("executor-1")) as Arc<dyn Agent>],
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("belongs to"));
}
