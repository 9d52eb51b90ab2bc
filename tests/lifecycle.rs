//! End-to-end run lifecycle against scripted agents.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use luigi::cancel::CancelToken;
use luigi::core::types::{Decision, RunSnapshot, RunStatus, Verdict};
use luigi::io::agent::{Agent, ExecutorReply, ExecutorStatus, AnswerOutcome, ReviewOutcome, ReviewReply};
use luigi::io::config::LuigiConfig;
use luigi::orchestrator::{AgentSet, Orchestrator};
use luigi::test_support::{
    ScriptedAgent, ScriptedExec, approve_review, done_exec, ready_plan, reject_review, sh_command,
};

fn test_config(root: &Path, strategy: &str, max_iterations: u32) -> LuigiConfig {
    let mut cfg = LuigiConfig::default();
    cfg.orchestrator.workspace_strategy = strategy.to_string();
    cfg.orchestrator.max_iterations = max_iterations;
    cfg.orchestrator.logs_dir = root.join("logs");
    cfg.orchestrator.workspaces_dir = root.join("workspaces");
    cfg.prompt.poll_interval_secs = 1;
    cfg.prompt.timeout_secs = 30;
    cfg.testing.timeout_secs = 60;
    cfg
}

fn agent_set(reviewers: Vec<Arc<ScriptedAgent>>, executors: Vec<Arc<ScriptedAgent>>) -> AgentSet {
    AgentSet {
        reviewers: reviewers
            .into_iter()
            .map(|agent| agent as Arc<dyn Agent>)
            .collect(),
        executors: executors
            .into_iter()
            .map(|agent| agent as Arc<dyn Agent>)
            .collect(),
    }
}

fn load_snapshot(cfg: &LuigiConfig, run_id: &str) -> RunSnapshot {
    let path = cfg.orchestrator.logs_dir.join(run_id).join("state.json");
    let raw = fs::read_to_string(&path).expect("read state.json");
    serde_json::from_str(&raw).expect("parse state.json")
}

/// Answer the first pending admin tie-break request with the given choice.
fn respond_to_tiebreak(run_dir: PathBuf, winner: &str, verdict: &str) -> thread::JoinHandle<()> {
    let response = format!(
        "{{\"winner_candidate_id\": \"{winner}\", \"verdict\": \"{verdict}\"}}"
    );
    thread::spawn(move || {
        let prompts = run_dir.join("prompts");
        for _ in 0..600 {
            if let Ok(entries) = fs::read_dir(&prompts) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if let Some(id) = name.strip_suffix(".request.json") {
                        let raw = fs::read_to_string(entry.path()).unwrap_or_default();
                        if raw.contains("admin-tiebreak") {
                            fs::write(
                                prompts.join(format!("{id}.response.json")),
                                &response,
                            )
                            .expect("write tiebreak response");
                            return;
                        }
                    }
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("no admin-tiebreak request appeared");
    })
}

#[test]
fn approved_run_applies_winner_changes_to_repo() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(repo.join("src")).expect("mkdir");
    fs::write(
        repo.join("src/divide.js"),
        "function divide(a, b) { return a / b; }\n",
    )
    .expect("write");

    let cfg = test_config(temp.path(), "copy", 3);
    let candidate = "iter0-c00-reviewer-1-executor-1";
    let fixed = "function divide(a, b) { if (b === 0) throw new Error('divide by zero'); return a / b; }\n";

    let reviewer = Arc::new(
        ScriptedAgent::new("reviewer-1")
            .with_plan(ready_plan(
                "throw on divide by zero",
                Some(vec![sh_command("grep -q throw src/divide.js")]),
            ))
            .with_review(candidate, approve_review(&[candidate])),
    );
    let executor = Arc::new(ScriptedAgent::new("executor-1").with_exec(done_exec(
        "implemented divide-by-zero guard",
        vec![(PathBuf::from("src/divide.js"), fixed.to_string())],
    )));

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        repo.clone(),
        false,
        CancelToken::new(),
        {
            let reviewer = reviewer.clone();
            let executor = executor.clone();
            move |_, _| agent_set(vec![reviewer], vec![executor])
        },
    )
    .expect("orchestrator");
    let run_id = orchestrator.run_id();

    let status = orchestrator
        .run(Some("fix divide by zero".to_string()))
        .expect("run");
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(fs::read_to_string(repo.join("src/divide.js")).expect("read"), fixed);

    let snapshot = load_snapshot(&cfg, &run_id);
    assert_eq!(snapshot.status, RunStatus::Completed);
    assert!(snapshot.persisted);
    assert_eq!(snapshot.iterations.len(), 1);
    let iteration = &snapshot.iterations[0];
    assert_eq!(iteration.decision, Some(Decision::Approved));
    assert_eq!(iteration.winner_candidate_id.as_deref(), Some(candidate));
    let winner = iteration.candidate(candidate).expect("winner record");
    assert_eq!(winner.changed_paths, vec!["src/divide.js".to_string()]);
    assert!(winner.test_report.as_ref().expect("tests").all_passed());
}

#[test]
fn executor_clarification_resumes_same_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(repo.join("src")).expect("mkdir");
    fs::write(repo.join("src/divide.js"), "buggy\n").expect("write");

    let cfg = test_config(temp.path(), "copy", 3);
    let candidate = "iter0-c00-reviewer-1-executor-1";

    let reviewer = Arc::new(
        ScriptedAgent::new("reviewer-1")
            .with_plan(ready_plan(
                "fix divide",
                Some(vec![sh_command("grep -q throw src/divide.js")]),
            ))
            .with_answer(AnswerOutcome::Answer("throw".to_string()))
            .with_review(candidate, approve_review(&[candidate])),
    );
    let executor = Arc::new(
        ScriptedAgent::new("executor-1")
            .with_exec(ScriptedExec {
                files: Vec::new(),
                hook: None,
                reply: ExecutorReply {
                    status: ExecutorStatus::NeedsClarification {
                        questions: vec!["Throw or return null?".to_string()],
                    },
                    summary: "need guidance".to_string(),
                    session_id: Some("sess-1".to_string()),
                },
            })
            .with_exec(done_exec(
                "implemented with throw",
                vec![(PathBuf::from("src/divide.js"), "throw\n".to_string())],
            )),
    );

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        repo.clone(),
        false,
        CancelToken::new(),
        {
            let reviewer = reviewer.clone();
            let executor = executor.clone();
            move |_, _| agent_set(vec![reviewer], vec![executor])
        },
    )
    .expect("orchestrator");
    let run_id = orchestrator.run_id();

    let status = orchestrator
        .run(Some("fix divide".to_string()))
        .expect("run");
    assert_eq!(status, RunStatus::Completed);

    // The follow-up call resumed the session the executor reported.
    assert_eq!(
        executor.seen_sessions(),
        vec![None, Some("sess-1".to_string())]
    );

    let snapshot = load_snapshot(&cfg, &run_id);
    assert_eq!(snapshot.iterations.len(), 1);
    let winner = snapshot.iterations[0].candidate(candidate).expect("candidate");
    assert_eq!(winner.session_id.as_deref(), Some("sess-1"));
    assert_eq!(winner.clarification_rounds, 1);
}

#[test]
fn reviewer_disagreement_escalates_to_admin_tiebreak() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(&repo).expect("mkdir");
    fs::write(repo.join("app.txt"), "original\n").expect("write");

    let mut cfg = test_config(temp.path(), "copy", 3);
    cfg.orchestrator.executors_per_plan = 1;

    let c1 = "iter0-c00-reviewer-a-executor-1";
    let c2 = "iter0-c01-reviewer-b-executor-2";

    // Reviewer A prefers c1 and approves it; reviewer B prefers c2 and
    // rejects c1: Borda tie broken toward c1, verdicts disagree.
    let reviewer_a = Arc::new(
        ScriptedAgent::new("reviewer-a")
            .with_plan(ready_plan("plan a", Some(vec![sh_command("true")])))
            .with_review(c1, approve_review(&[c1, c2]))
            .with_review(
                c2,
                ReviewOutcome::Ready(ReviewReply {
                    approved: false,
                    ranking: vec![c1.to_string(), c2.to_string()],
                    feedback: "prefer the other".to_string(),
                    next_prompt: Some("iterate".to_string()),
                }),
            ),
    );
    let reviewer_b = Arc::new(
        ScriptedAgent::new("reviewer-b")
            .with_plan(ready_plan("plan b", Some(vec![sh_command("true")])))
            .with_review(c1, reject_review(&[c2, c1], "not this one"))
            .with_review(c2, approve_review(&[c2, c1])),
    );
    let executor_1 = Arc::new(ScriptedAgent::new("executor-1").with_exec(done_exec(
        "candidate one",
        vec![(PathBuf::from("app.txt"), "from executor one\n".to_string())],
    )));
    let executor_2 = Arc::new(ScriptedAgent::new("executor-2").with_exec(done_exec(
        "candidate two",
        vec![(PathBuf::from("app.txt"), "from executor two\n".to_string())],
    )));

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        repo.clone(),
        false,
        CancelToken::new(),
        {
            let (ra, rb) = (reviewer_a.clone(), reviewer_b.clone());
            let (e1, e2) = (executor_1.clone(), executor_2.clone());
            move |_, _| agent_set(vec![ra, rb], vec![e1, e2])
        },
    )
    .expect("orchestrator");
    let run_id = orchestrator.run_id();

    let responder =
        respond_to_tiebreak(orchestrator.run_dir().to_path_buf(), c2, "APPROVED");
    let status = orchestrator
        .run(Some("improve app".to_string()))
        .expect("run");
    responder.join().expect("responder");

    assert_eq!(status, RunStatus::Completed);
    // Admin override wins: the repo holds executor two's version.
    assert_eq!(
        fs::read_to_string(repo.join("app.txt")).expect("read"),
        "from executor two\n"
    );

    let snapshot = load_snapshot(&cfg, &run_id);
    let iteration = &snapshot.iterations[0];
    assert_eq!(
        iteration.decision,
        Some(Decision::AdminEscalated {
            verdict: Verdict::Approved
        })
    );
    assert_eq!(iteration.winner_candidate_id.as_deref(), Some(c2));
    assert_eq!(iteration.reviews.len(), 4);
}

#[test]
fn iteration_cap_fails_run_and_carries_winner_forward() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("repo");
    fs::create_dir_all(&repo).expect("mkdir");
    fs::write(repo.join("app.txt"), "original\n").expect("write");

    let mut cfg = test_config(temp.path(), "copy", 2);
    cfg.orchestrator.carry_forward = true;

    let c_iter0 = "iter0-c00-reviewer-1-executor-1";
    let c_iter1 = "iter1-c00-reviewer-1-executor-1";

    let reviewer = Arc::new(
        ScriptedAgent::new("reviewer-1")
            .with_plan(ready_plan("attempt one", Some(vec![sh_command("true")])))
            .with_plan(ready_plan("attempt two", Some(vec![sh_command("true")])))
            .with_review(c_iter0, reject_review(&[c_iter0], "still missing the fix"))
            .with_review(c_iter1, reject_review(&[c_iter1], "still not done")),
    );
    let executor = Arc::new(
        ScriptedAgent::new("executor-1")
            .with_exec(done_exec(
                "first attempt",
                vec![(PathBuf::from("app.txt"), "v1\n".to_string())],
            ))
            .with_exec(done_exec(
                "second attempt",
                vec![(PathBuf::from("app.txt"), "v2\n".to_string())],
            )),
    );

    let orchestrator = Orchestrator::new(
        cfg.clone(),
        repo.clone(),
        false,
        CancelToken::new(),
        {
            let reviewer = reviewer.clone();
            let executor = executor.clone();
            move |_, _| agent_set(vec![reviewer], vec![executor])
        },
    )
    .expect("orchestrator");
    let run_id = orchestrator.run_id();

    let status = orchestrator
        .run(Some("do the thing".to_string()))
        .expect("run");
    assert_eq!(status, RunStatus::Failed);

    let snapshot = load_snapshot(&cfg, &run_id);
    assert_eq!(snapshot.iterations.len(), 2);
    assert_eq!(snapshot.iterations[0].decision, Some(Decision::Rejected));
    assert_eq!(snapshot.iterations[1].decision, Some(Decision::Rejected));
    let error = snapshot.error.expect("terminal error");
    assert_eq!(error.kind, "max-iterations-exceeded");

    // Carry-forward adopted iteration 0's winner as iteration 1's baseline.
    let carried = cfg
        .orchestrator
        .workspaces_dir
        .join(&run_id)
        .join("iter_1")
        .join("baseline")
        .join("app.txt");
    assert_eq!(fs::read_to_string(carried).expect("read baseline"), "v1\n");

    // The rejected winner's next_prompt became the next iteration's task.
    assert_eq!(
        snapshot.task.as_deref(),
        Some("[reviewer-1] still not done")
    );

    // The repo itself was never touched.
    assert_eq!(
        fs::read_to_string(repo.join("app.txt")).expect("read"),
        "original\n"
    );
}
