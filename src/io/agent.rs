//! Agent adapter: the capability behind which planner/reviewer and executor
//! programs live.
//!
//! Every agent is a child process sharing one invocation contract: a
//! working-directory flag, an `--output-last-message` flag naming the file
//! where the agent writes its final structured JSON, and the prompt as the
//! final positional argument. Prompts open with a `PHASE:` sentinel so mocks
//! and future agents can route. The adapter normalizes the structured
//! messages, validates them, and retries transient failures with backoff.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::types::{Plan, PlanTask, TestCommand};
use crate::error::LuigiError;
use crate::io::config::AgentInvokeConfig;
use crate::io::process::run_with_timeout;

const PLAN_TEMPLATE: &str = include_str!("templates/plan.md");
const EXECUTE_TEMPLATE: &str = include_str!("templates/execute.md");
const REVIEW_TEMPLATE: &str = include_str!("templates/review.md");
const ANSWER_TEMPLATE: &str = include_str!("templates/answer.md");

/// Environment variable selecting a Python interpreter for `.py` agent
/// commands (legacy adapter mode). The only variable luigi interprets;
/// everything else passes through to the child.
pub const PYTHON_OVERRIDE_ENV: &str = "LUIGI_PYTHON";

/// Inputs for a planning call.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub task: String,
    pub user_context: String,
    pub workdir: PathBuf,
}

/// Planner output after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// `reviewer_id` is filled in by the adapter.
    Ready(Plan),
    NeedsUserInput(Vec<String>),
}

/// Inputs for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub executor_prompt: String,
    /// Answers collected from reviewers in a clarification round.
    pub reviewer_answers: Option<String>,
    pub workdir: PathBuf,
    /// Session to resume; `None` starts a fresh conversation.
    pub session: Option<String>,
}

/// Executor structured result after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorReply {
    pub status: ExecutorStatus,
    pub summary: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorStatus {
    Done,
    NeedsClarification { questions: Vec<String> },
    Failed,
}

/// Inputs for reviewing one candidate.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task: String,
    pub candidate_id: String,
    /// Summary blocks for every candidate in the iteration.
    pub candidates_text: String,
    pub known_candidate_ids: Vec<String>,
    pub user_context: String,
    pub workdir: PathBuf,
}

/// Review output after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Ready(ReviewReply),
    NeedsUserInput(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewReply {
    pub approved: bool,
    pub ranking: Vec<String>,
    pub feedback: String,
    pub next_prompt: Option<String>,
}

/// Inputs for answering executor questions (plan-like clarification mode).
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub questions: Vec<String>,
    pub context: String,
    pub user_context: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answer(String),
    NeedsUserInput(Vec<String>),
}

/// The agent capability. One implementation spawns real CLIs; tests use
/// scripted implementations.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn plan(&self, request: &PlanRequest) -> Result<PlanOutcome>;
    fn execute(&self, request: &ExecuteRequest) -> Result<ExecutorReply>;
    fn review(&self, request: &ReviewRequest) -> Result<ReviewOutcome>;
    fn answer(&self, request: &AnswerRequest) -> Result<AnswerOutcome>;
}

/// Agent backed by a child-process CLI.
pub struct CliAgent {
    id: String,
    command: Vec<String>,
    invoke: AgentInvokeConfig,
    /// Append-only per-agent log under the run directory.
    log_path: PathBuf,
    /// Directory for `--output-last-message` files.
    output_dir: PathBuf,
}

impl CliAgent {
    pub fn new(
        id: impl Into<String>,
        command: Vec<String>,
        invoke: AgentInvokeConfig,
        run_dir: &Path,
    ) -> Self {
        let id = id.into();
        Self {
            log_path: run_dir.join(format!("{id}.log")),
            output_dir: run_dir.join("agent_output"),
            id,
            command,
            invoke,
        }
    }

    /// Spawn the agent once and return its structured message.
    fn invoke_once(
        &self,
        prompt: &str,
        workdir: &Path,
        session: Option<&str>,
    ) -> Result<serde_json::Value> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("create {}", self.output_dir.display()))?;
        let output_path = self.output_dir.join(format!("{}.json", Uuid::new_v4()));

        let mut argv = self.command.clone();
        if let Some(first) = argv.first() {
            if first.ends_with(".py") {
                if let Ok(python) = std::env::var(PYTHON_OVERRIDE_ENV) {
                    if !python.trim().is_empty() {
                        argv.insert(0, python);
                    }
                }
            }
        }
        let program = argv
            .first()
            .ok_or_else(|| anyhow!(LuigiError::invocation("empty agent command")))?
            .clone();

        let mut cmd = Command::new(&program);
        cmd.args(&argv[1..])
            .arg("--cd")
            .arg(workdir)
            .arg("--output-last-message")
            .arg(&output_path);
        if let Some(session) = session {
            cmd.arg("--resume").arg(session);
        }
        cmd.arg(prompt);

        info!(agent = %self.id, phase = extract_phase(prompt), "invoking agent");
        let run = run_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.invoke.timeout_secs),
            self.invoke.output_limit_bytes,
        )
        .map_err(|err| anyhow!(LuigiError::invocation(format!("{}: {err:#}", self.id))))?;

        self.append_log(&format!(
            "=== {} {} exit={} ===\n{}",
            chrono::Utc::now().to_rfc3339(),
            extract_phase(prompt),
            run.exit_code,
            run.transcript(&self.id),
        ));

        let message = fs::read_to_string(&output_path).ok();
        let _ = fs::remove_file(&output_path);

        if run.timed_out {
            return Err(anyhow!(LuigiError::invocation(format!(
                "{} timed out after {}s",
                self.id, self.invoke.timeout_secs
            ))));
        }
        let message = match message {
            Some(contents) if !contents.trim().is_empty() => contents,
            _ if run.exit_code != 0 => {
                return Err(anyhow!(LuigiError::invocation(format!(
                    "{} exited with code {} and no structured message",
                    self.id, run.exit_code
                ))));
            }
            _ => {
                return Err(anyhow!(LuigiError::protocol(format!(
                    "{} produced an empty final message",
                    self.id
                ))));
            }
        };

        serde_json::from_str(&message).map_err(|err| {
            anyhow!(LuigiError::protocol(format!(
                "{} final message is not valid JSON: {err}",
                self.id
            )))
        })
    }

    /// Invoke with retry-on-transient-failure and exponential backoff.
    fn invoke_with_retry(
        &self,
        prompt: &str,
        workdir: &Path,
        session: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            match self.invoke_once(prompt, workdir, session) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err
                        .downcast_ref::<LuigiError>()
                        .is_some_and(LuigiError::is_retryable);
                    if !retryable || attempt >= self.invoke.max_retries {
                        return Err(err);
                    }
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(agent = %self.id, attempt, ?delay, "agent call failed, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn append_log(&self, text: &str) {
        use std::io::Write;
        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = file.write_all(text.as_bytes());
        }
    }
}

impl Agent for CliAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn plan(&self, request: &PlanRequest) -> Result<PlanOutcome> {
        let prompt = render_template(
            "plan",
            PLAN_TEMPLATE,
            context! {
                task => request.task,
                user_context => non_empty(&request.user_context),
            },
        )?;
        let value = self.invoke_with_retry(&prompt, &request.workdir, None)?;
        normalize_plan(&self.id, value)
    }

    fn execute(&self, request: &ExecuteRequest) -> Result<ExecutorReply> {
        let prompt = render_template(
            "execute",
            EXECUTE_TEMPLATE,
            context! {
                executor_prompt => request.executor_prompt,
                reviewer_answers => request.reviewer_answers.as_deref(),
            },
        )?;
        let value =
            self.invoke_with_retry(&prompt, &request.workdir, request.session.as_deref())?;
        normalize_executor(&self.id, value)
    }

    fn review(&self, request: &ReviewRequest) -> Result<ReviewOutcome> {
        let prompt = render_template(
            "review",
            REVIEW_TEMPLATE,
            context! {
                task => request.task,
                candidate_id => request.candidate_id,
                candidates_text => request.candidates_text,
                user_context => non_empty(&request.user_context),
            },
        )?;
        let value = self.invoke_with_retry(&prompt, &request.workdir, None)?;
        normalize_review(&self.id, value, &request.known_candidate_ids)
    }

    fn answer(&self, request: &AnswerRequest) -> Result<AnswerOutcome> {
        let prompt = render_template(
            "answer",
            ANSWER_TEMPLATE,
            context! {
                questions => request.questions.join("\n"),
                context => request.context,
                user_context => non_empty(&request.user_context),
            },
        )?;
        let value = self.invoke_with_retry(&prompt, &request.workdir, None)?;
        normalize_answer(&self.id, value)
    }
}

fn render_template(name: &str, source: &str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .context("register prompt template")?;
    let rendered = env
        .get_template(name)
        .context("load prompt template")?
        .render(ctx)
        .context("render prompt template")?;
    Ok(rendered)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// First `PHASE:` line of a prompt, for logs.
fn extract_phase(prompt: &str) -> &str {
    for line in prompt.lines() {
        if let Some(phase) = line.strip_prefix("PHASE:") {
            return phase.trim();
        }
    }
    "UNKNOWN"
}

// Wire-format messages. Statuses are uppercase on the wire; everything else
// is optional so validation can produce useful protocol errors.

#[derive(Debug, Deserialize)]
struct PlanMessage {
    status: Option<String>,
    claude_prompt: Option<String>,
    tasks: Option<Vec<PlanTaskMessage>>,
    test_commands: Option<Vec<TestCommandMessage>>,
    questions: Option<Vec<String>>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanTaskMessage {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestCommandMessage {
    argv: Option<Vec<String>>,
    cwd: Option<PathBuf>,
    timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecutorMessage {
    status: Option<String>,
    summary: Option<String>,
    questions: Option<Vec<String>>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewMessage {
    status: Option<String>,
    ranking: Option<Vec<String>>,
    feedback: Option<String>,
    questions: Option<Vec<String>>,
    next_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnswerMessage {
    status: Option<String>,
    answer: Option<String>,
    questions: Option<Vec<String>>,
}

fn protocol_err(agent_id: &str, msg: impl std::fmt::Display) -> anyhow::Error {
    anyhow!(LuigiError::protocol(format!("{agent_id}: {msg}")))
}

fn clean_questions(questions: Option<Vec<String>>) -> Vec<String> {
    questions
        .unwrap_or_default()
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

/// Validate and normalize a planner message into a [`Plan`].
pub fn normalize_plan(agent_id: &str, value: serde_json::Value) -> Result<PlanOutcome> {
    let message: PlanMessage =
        serde_json::from_value(value).map_err(|err| protocol_err(agent_id, err))?;

    // A missing status with questions is treated as a clarification request,
    // matching older planner builds.
    let status = match message.status.as_deref() {
        Some(status) => status.to_string(),
        None if message.questions.as_ref().is_some_and(|q| !q.is_empty()) => {
            "NEEDS_USER_INPUT".to_string()
        }
        None => "OK".to_string(),
    };

    if status == "NEEDS_USER_INPUT" {
        let questions = clean_questions(message.questions);
        if questions.is_empty() {
            return Err(protocol_err(
                agent_id,
                "NEEDS_USER_INPUT requires a non-empty questions list",
            ));
        }
        return Ok(PlanOutcome::NeedsUserInput(questions));
    }
    if status != "OK" {
        return Err(protocol_err(agent_id, format!("unknown plan status {status:?}")));
    }

    let executor_prompt = message
        .claude_prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| protocol_err(agent_id, "claude_prompt must be a non-empty string"))?
        .to_string();

    let raw_tasks = message
        .tasks
        .filter(|t| !t.is_empty())
        .ok_or_else(|| protocol_err(agent_id, "tasks must be a non-empty list"))?;
    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (idx, task) in raw_tasks.into_iter().enumerate() {
        let field = |value: Option<String>, name: &str| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    protocol_err(agent_id, format!("tasks[{idx}].{name} must be non-empty"))
                })
        };
        tasks.push(PlanTask {
            id: field(task.id, "id")?,
            title: field(task.title, "title")?,
            description: field(task.description, "description")?,
        });
    }

    let test_commands = match message.test_commands {
        None => None,
        Some(commands) if commands.is_empty() => None,
        Some(commands) => {
            let mut parsed = Vec::with_capacity(commands.len());
            for (idx, command) in commands.into_iter().enumerate() {
                let argv = command
                    .argv
                    .filter(|argv| !argv.is_empty() && argv.iter().all(|a| !a.trim().is_empty()))
                    .ok_or_else(|| {
                        protocol_err(
                            agent_id,
                            format!("test_commands[{idx}].argv must be a non-empty list"),
                        )
                    })?;
                if command.timeout_sec == Some(0) {
                    return Err(protocol_err(
                        agent_id,
                        format!("test_commands[{idx}].timeout_sec must be positive"),
                    ));
                }
                parsed.push(TestCommand {
                    argv,
                    cwd: command.cwd,
                    timeout_secs: command.timeout_sec,
                });
            }
            Some(parsed)
        }
    };

    Ok(PlanOutcome::Ready(Plan {
        reviewer_id: agent_id.to_string(),
        executor_prompt,
        tasks,
        test_commands,
        notes: message.notes.filter(|n| !n.trim().is_empty()),
    }))
}

/// Validate and normalize an executor message.
///
/// `NEEDS_CODEX` is accepted as a deprecated alias of `NEEDS_REVIEWER`.
pub fn normalize_executor(agent_id: &str, value: serde_json::Value) -> Result<ExecutorReply> {
    let message: ExecutorMessage =
        serde_json::from_value(value).map_err(|err| protocol_err(agent_id, err))?;
    let status = message
        .status
        .ok_or_else(|| protocol_err(agent_id, "executor result missing status"))?;
    let summary = message.summary.unwrap_or_default().trim().to_string();

    let status = match status.as_str() {
        "DONE" => ExecutorStatus::Done,
        "FAILED" => ExecutorStatus::Failed,
        "NEEDS_REVIEWER" | "NEEDS_CODEX" => {
            let questions = clean_questions(message.questions);
            if questions.is_empty() {
                return Err(protocol_err(
                    agent_id,
                    "clarification request without questions",
                ));
            }
            ExecutorStatus::NeedsClarification { questions }
        }
        other => {
            return Err(protocol_err(
                agent_id,
                format!("unknown executor status {other:?}"),
            ));
        }
    };

    Ok(ExecutorReply {
        status,
        summary,
        session_id: message.session_id.filter(|s| !s.trim().is_empty()),
    })
}

/// Validate and normalize a review message.
pub fn normalize_review(
    agent_id: &str,
    value: serde_json::Value,
    known_candidate_ids: &[String],
) -> Result<ReviewOutcome> {
    let message: ReviewMessage =
        serde_json::from_value(value).map_err(|err| protocol_err(agent_id, err))?;
    let status = message
        .status
        .ok_or_else(|| protocol_err(agent_id, "review missing status"))?;

    if status == "NEEDS_USER_INPUT" {
        let questions = clean_questions(message.questions);
        if questions.is_empty() {
            return Err(protocol_err(
                agent_id,
                "NEEDS_USER_INPUT requires a non-empty questions list",
            ));
        }
        return Ok(ReviewOutcome::NeedsUserInput(questions));
    }

    let approved = match status.as_str() {
        "APPROVED" => true,
        "REJECTED" => false,
        other => {
            return Err(protocol_err(
                agent_id,
                format!("unknown review status {other:?}"),
            ));
        }
    };

    let feedback = message
        .feedback
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| protocol_err(agent_id, "feedback must be a non-empty string"))?;

    let ranking = message.ranking.unwrap_or_default();
    if ranking.is_empty() {
        return Err(protocol_err(agent_id, "ranking must be a non-empty list"));
    }
    for candidate_id in &ranking {
        if !known_candidate_ids.contains(candidate_id) {
            return Err(protocol_err(
                agent_id,
                format!("ranking references unknown candidate {candidate_id:?}"),
            ));
        }
    }

    let next_prompt = message
        .next_prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    // An approval carrying a next-iteration prompt implicitly means work
    // remains; reject the message instead of guessing intent.
    if approved && next_prompt.is_some() {
        return Err(protocol_err(
            agent_id,
            "APPROVED requires next_prompt to be null",
        ));
    }

    Ok(ReviewOutcome::Ready(ReviewReply {
        approved,
        ranking,
        feedback,
        next_prompt,
    }))
}

/// Validate and normalize an answer message.
pub fn normalize_answer(agent_id: &str, value: serde_json::Value) -> Result<AnswerOutcome> {
    let message: AnswerMessage =
        serde_json::from_value(value).map_err(|err| protocol_err(agent_id, err))?;
    let status = message
        .status
        .ok_or_else(|| protocol_err(agent_id, "answer missing status"))?;
    match status.as_str() {
        "NEEDS_USER_INPUT" => {
            let questions = clean_questions(message.questions);
            if questions.is_empty() {
                return Err(protocol_err(
                    agent_id,
                    "NEEDS_USER_INPUT requires a non-empty questions list",
                ));
            }
            Ok(AnswerOutcome::NeedsUserInput(questions))
        }
        "ANSWER" => {
            let answer = message
                .answer
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .ok_or_else(|| protocol_err(agent_id, "answer must be a non-empty string"))?;
            Ok(AnswerOutcome::Answer(answer))
        }
        other => Err(protocol_err(
            agent_id,
            format!("unknown answer status {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plan_normalization_accepts_minimal_ok_plan() {
        let outcome = normalize_plan(
            "reviewer-1",
            json!({
                "status": "OK",
                "claude_prompt": "implement it",
                "tasks": [{"id": "t1", "title": "do", "description": "the work"}],
                "test_commands": null,
            }),
        )
        .expect("normalize");
        let PlanOutcome::Ready(plan) = outcome else {
            panic!("expected ready plan");
        };
        assert_eq!(plan.reviewer_id, "reviewer-1");
        assert_eq!(plan.test_commands, None);
        assert_eq!(plan.tasks.len(), 1);
    }

    #[test]
    fn plan_without_status_but_with_questions_asks_user() {
        let outcome = normalize_plan(
            "reviewer-1",
            json!({"questions": ["which framework?"]}),
        )
        .expect("normalize");
        assert_eq!(
            outcome,
            PlanOutcome::NeedsUserInput(vec!["which framework?".to_string()])
        );
    }

    #[test]
    fn plan_with_empty_test_commands_normalizes_to_fallback() {
        let outcome = normalize_plan(
            "reviewer-1",
            json!({
                "status": "OK",
                "claude_prompt": "implement",
                "tasks": [{"id": "t1", "title": "a", "description": "b"}],
                "test_commands": [],
            }),
        )
        .expect("normalize");
        let PlanOutcome::Ready(plan) = outcome else {
            panic!("expected ready plan");
        };
        assert_eq!(plan.test_commands, None);
    }

    #[test]
    fn plan_rejects_missing_prompt() {
        let err = normalize_plan(
            "reviewer-1",
            json!({"status": "OK", "tasks": [{"id": "t", "title": "t", "description": "d"}]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("claude_prompt"));
    }

    #[test]
    fn executor_accepts_deprecated_clarification_alias() {
        for status in ["NEEDS_REVIEWER", "NEEDS_CODEX"] {
            let reply = normalize_executor(
                "executor-1",
                json!({
                    "status": status,
                    "summary": "stuck",
                    "questions": ["throw or return null?"],
                    "session_id": "sess-9",
                }),
            )
            .expect("normalize");
            assert_eq!(
                reply.status,
                ExecutorStatus::NeedsClarification {
                    questions: vec!["throw or return null?".to_string()]
                }
            );
            assert_eq!(reply.session_id.as_deref(), Some("sess-9"));
        }
    }

    #[test]
    fn executor_clarification_without_questions_is_protocol_error() {
        let err = normalize_executor(
            "executor-1",
            json!({"status": "NEEDS_REVIEWER", "questions": []}),
        )
        .unwrap_err();
        let luigi = err.downcast_ref::<LuigiError>().expect("typed error");
        assert!(matches!(luigi, LuigiError::AgentProtocol(_)));
    }

    #[test]
    fn executor_unknown_status_is_protocol_error() {
        let err =
            normalize_executor("executor-1", json!({"status": "MAYBE"})).unwrap_err();
        assert!(err.to_string().contains("unknown executor status"));
    }

    #[test]
    fn review_validates_ranking_against_known_candidates() {
        let known = vec!["c1".to_string(), "c2".to_string()];
        let outcome = normalize_review(
            "reviewer-1",
            json!({
                "status": "REJECTED",
                "ranking": ["c2", "c1"],
                "feedback": "tests fail",
                "next_prompt": "fix the tests",
            }),
            &known,
        )
        .expect("normalize");
        let ReviewOutcome::Ready(review) = outcome else {
            panic!("expected review");
        };
        assert!(!review.approved);
        assert_eq!(review.ranking, vec!["c2".to_string(), "c1".to_string()]);
        assert_eq!(review.next_prompt.as_deref(), Some("fix the tests"));

        let err = normalize_review(
            "reviewer-1",
            json!({"status": "APPROVED", "ranking": ["ghost"], "feedback": "ok"}),
            &known,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown candidate"));
    }

    #[test]
    fn approved_review_must_not_carry_next_prompt() {
        let known = vec!["c1".to_string()];
        let err = normalize_review(
            "reviewer-1",
            json!({
                "status": "APPROVED",
                "ranking": ["c1"],
                "feedback": "done",
                "next_prompt": "but also do this",
            }),
            &known,
        )
        .unwrap_err();
        assert!(err.to_string().contains("next_prompt"));
    }

    #[test]
    fn answer_normalization_round_trips() {
        assert_eq!(
            normalize_answer("r", json!({"status": "ANSWER", "answer": "throw"})).expect("ok"),
            AnswerOutcome::Answer("throw".to_string())
        );
        assert_eq!(
            normalize_answer(
                "r",
                json!({"status": "NEEDS_USER_INPUT", "questions": ["really?"]})
            )
            .expect("ok"),
            AnswerOutcome::NeedsUserInput(vec!["really?".to_string()])
        );
    }

    #[test]
    fn phase_sentinel_extraction() {
        assert_eq!(extract_phase("PHASE: PLAN\nrest"), "PLAN");
        assert_eq!(extract_phase("no sentinel"), "UNKNOWN");
    }

    #[test]
    fn cli_agent_reads_structured_message_from_output_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).expect("mkdir");

        // A stand-in agent honoring the invocation contract: scan argv for
        // --output-last-message and write a DONE message there.
        let script = temp.path().join("agent.sh");
        fs::write(
            &script,
            "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--output-last-message\" ]; then out=\"$2\"; shift; fi\n  shift\ndone\nprintf '{\"status\":\"DONE\",\"summary\":\"did it\"}' > \"$out\"\n",
        )
        .expect("write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        }

        let agent = CliAgent::new(
            "executor-1",
            vec![script.to_string_lossy().into_owned()],
            AgentInvokeConfig {
                timeout_secs: 30,
                output_limit_bytes: 10_000,
                max_retries: 0,
            },
            &run_dir,
        );
        let reply = agent
            .execute(&ExecuteRequest {
                executor_prompt: "implement".to_string(),
                reviewer_answers: None,
                workdir: temp.path().to_path_buf(),
                session: None,
            })
            .expect("execute");
        assert_eq!(reply.status, ExecutorStatus::Done);
        assert_eq!(reply.summary, "did it");
        assert!(run_dir.join("executor-1.log").exists());
    }

    #[test]
    fn cli_agent_maps_silent_failure_to_invocation_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CliAgent::new(
            "reviewer-1",
            vec!["false".to_string()],
            AgentInvokeConfig {
                timeout_secs: 30,
                output_limit_bytes: 10_000,
                max_retries: 0,
            },
            temp.path(),
        );
        let err = agent
            .plan(&PlanRequest {
                task: "task".to_string(),
                user_context: String::new(),
                workdir: temp.path().to_path_buf(),
            })
            .unwrap_err();
        let luigi = err.downcast_ref::<LuigiError>().expect("typed error");
        assert!(matches!(luigi, LuigiError::AgentInvocation(_)));
    }
}
