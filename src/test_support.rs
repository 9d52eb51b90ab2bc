//! Test-only helpers: scripted agents and repo fixtures.
//!
//! Scripted agents return predetermined outcomes without spawning
//! processes, letting lifecycle tests drive the scheduler and orchestrator
//! deterministically.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::types::{Plan, PlanTask, TestCommand};
use crate::error::LuigiError;
use crate::io::agent::{
    Agent, AnswerOutcome, AnswerRequest, ExecuteRequest, ExecutorReply, ExecutorStatus,
    PlanOutcome, PlanRequest, ReviewOutcome, ReviewReply, ReviewRequest,
};

/// Side effect invoked with the execution workdir, for fixtures that need
/// more than file writes (git operations, staged resolutions).
pub type ExecHook = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;

/// One scripted executor invocation: files written into the workspace, an
/// optional hook, then the reply.
pub struct ScriptedExec {
    pub files: Vec<(PathBuf, String)>,
    pub hook: Option<ExecHook>,
    pub reply: ExecutorReply,
}

/// Agent implementation fed from queues.
#[derive(Default)]
pub struct ScriptedAgent {
    id: String,
    plans: Mutex<VecDeque<PlanOutcome>>,
    execs: Mutex<VecDeque<ScriptedExec>>,
    reviews: Mutex<HashMap<String, VecDeque<ReviewOutcome>>>,
    answers: Mutex<VecDeque<AnswerOutcome>>,
    /// Session ids observed on each execute call, for resume assertions.
    seen_sessions: Mutex<Vec<Option<String>>>,
    /// Fail every call with an invocation error (for retry/failure tests).
    always_fail: bool,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn failing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn with_plan(self, outcome: PlanOutcome) -> Self {
        self.plans.lock().unwrap().push_back(outcome);
        self
    }

    pub fn with_exec(self, exec: ScriptedExec) -> Self {
        self.execs.lock().unwrap().push_back(exec);
        self
    }

    pub fn with_review(self, candidate_id: &str, outcome: ReviewOutcome) -> Self {
        self.reviews
            .lock()
            .unwrap()
            .entry(candidate_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn with_answer(self, outcome: AnswerOutcome) -> Self {
        self.answers.lock().unwrap().push_back(outcome);
        self
    }

    pub fn seen_sessions(&self) -> Vec<Option<String>> {
        self.seen_sessions.lock().unwrap().clone()
    }
}

impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn plan(&self, _request: &PlanRequest) -> Result<PlanOutcome> {
        if self.always_fail {
            return Err(anyhow!(LuigiError::invocation(format!(
                "{} scripted to fail",
                self.id
            ))));
        }
        let mut outcome = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("{}: no scripted plan left", self.id))?;
        if let PlanOutcome::Ready(plan) = &mut outcome {
            plan.reviewer_id = self.id.clone();
        }
        Ok(outcome)
    }

    fn execute(&self, request: &ExecuteRequest) -> Result<ExecutorReply> {
        if self.always_fail {
            return Err(anyhow!(LuigiError::invocation(format!(
                "{} scripted to fail",
                self.id
            ))));
        }
        self.seen_sessions
            .lock()
            .unwrap()
            .push(request.session.clone());
        let exec = self
            .execs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("{}: no scripted execution left", self.id))?;
        for (rel, contents) in &exec.files {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        if let Some(hook) = &exec.hook {
            hook(&request.workdir)?;
        }
        Ok(exec.reply)
    }

    fn review(&self, request: &ReviewRequest) -> Result<ReviewOutcome> {
        if self.always_fail {
            return Err(anyhow!(LuigiError::invocation(format!(
                "{} scripted to fail",
                self.id
            ))));
        }
        self.reviews
            .lock()
            .unwrap()
            .get_mut(&request.candidate_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                anyhow!(
                    "{}: no scripted review for {}",
                    self.id,
                    request.candidate_id
                )
            })
    }

    fn answer(&self, _request: &AnswerRequest) -> Result<AnswerOutcome> {
        if self.always_fail {
            return Err(anyhow!(LuigiError::invocation(format!(
                "{} scripted to fail",
                self.id
            ))));
        }
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("{}: no scripted answer left", self.id))
    }
}

/// A ready plan with one task and the given test commands.
pub fn ready_plan(prompt: &str, test_commands: Option<Vec<TestCommand>>) -> PlanOutcome {
    PlanOutcome::Ready(Plan {
        reviewer_id: String::new(),
        executor_prompt: prompt.to_string(),
        tasks: vec![PlanTask {
            id: "t1".to_string(),
            title: "implement".to_string(),
            description: prompt.to_string(),
        }],
        test_commands,
        notes: None,
    })
}

/// Shell-based test command, for workspaces without real tooling.
pub fn sh_command(script: &str) -> TestCommand {
    TestCommand {
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        cwd: None,
        timeout_secs: None,
    }
}

pub fn done_exec(summary: &str, files: Vec<(PathBuf, String)>) -> ScriptedExec {
    ScriptedExec {
        files,
        hook: None,
        reply: ExecutorReply {
            status: ExecutorStatus::Done,
            summary: summary.to_string(),
            session_id: None,
        },
    }
}

pub fn approve_review(ranking: &[&str]) -> ReviewOutcome {
    ReviewOutcome::Ready(ReviewReply {
        approved: true,
        ranking: ranking.iter().map(|s| s.to_string()).collect(),
        feedback: "looks complete".to_string(),
        next_prompt: None,
    })
}

pub fn reject_review(ranking: &[&str], next_prompt: &str) -> ReviewOutcome {
    ReviewOutcome::Ready(ReviewReply {
        approved: false,
        ranking: ranking.iter().map(|s| s.to_string()).collect(),
        feedback: "work remains".to_string(),
        next_prompt: Some(next_prompt.to_string()),
    })
}

/// Initialize a git repo with one commit on branch `main`.
pub fn init_git_repo(root: &Path) {
    run_git(root, &["init", "-q"]);
    run_git(root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    run_git(root, &["config", "user.email", "test@example.com"]);
    run_git(root, &["config", "user.name", "test"]);
    fs::write(root.join("README.md"), "hello\n").expect("write README");
    run_git(root, &["add", "-A"]);
    run_git(root, &["commit", "-q", "-m", "chore: init"]);
}

fn run_git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}
