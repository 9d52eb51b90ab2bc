//! File-based rendezvous for human input.
//!
//! For each outstanding question the channel writes
//! `prompts/<id>.request.json` and polls for `prompts/<id>.response.json`,
//! which an observing UI (or notifier relay) eventually writes. A serialized
//! copy of every request is appended to `prompts/outbox.jsonl` so external
//! notifiers can deliver it elsewhere; whichever response file appears first
//! resolves the request. With a TTY and no observers, the channel prompts on
//! the terminal instead. Resolved requests are deleted.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::core::types::{QnaEntry, Verdict};
use crate::error::LuigiError;

/// What a request is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptKind {
    InitialTask,
    ReviewerClarification,
    AdminTiebreak,
    SessionNextTask,
}

/// On-disk request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub id: String,
    pub kind: PromptKind,
    #[serde(default)]
    pub questions: Vec<String>,
    /// Free-form context for the responder (reviews, diffs, options).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

/// Admin resolution of a reviewer disagreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiebreakChoice {
    pub winner_candidate_id: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnswersFile {
    answers: Vec<QnaEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskFile {
    task: String,
}

/// Bidirectional request/response channel for human input.
pub struct PromptChannel {
    prompts_dir: PathBuf,
    poll_interval: Duration,
    /// Overall deadline per request; `None` waits forever.
    timeout: Option<Duration>,
    cancel: CancelToken,
    /// Prompt on the terminal instead of waiting for response files.
    interactive: bool,
}

impl PromptChannel {
    pub fn new(
        prompts_dir: PathBuf,
        poll_interval: Duration,
        timeout: Option<Duration>,
        cancel: CancelToken,
        interactive: bool,
    ) -> Result<Self> {
        fs::create_dir_all(&prompts_dir)
            .with_context(|| format!("create {}", prompts_dir.display()))?;
        Ok(Self {
            prompts_dir,
            poll_interval,
            timeout,
            cancel,
            interactive,
        })
    }

    /// Ask the human a list of questions; returns one answer per question.
    pub fn ask_questions(
        &self,
        kind: PromptKind,
        questions: &[String],
        context: serde_json::Value,
    ) -> Result<Vec<QnaEntry>> {
        let questions: Vec<String> = questions
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if questions.is_empty() {
            return Ok(Vec::new());
        }

        if self.interactive {
            return self.ask_questions_on_terminal(&questions);
        }

        let request = self.publish(kind, questions.clone(), context, None)?;
        let value = self.await_response(&request)?;
        let parsed: AnswersFile = serde_json::from_value(value)
            .with_context(|| format!("parse answers for prompt {}", request.id))?;
        Ok(parsed.answers)
    }

    /// Ask for a task string (initial task or session-mode next task).
    pub fn ask_task(&self, kind: PromptKind) -> Result<String> {
        if self.interactive {
            let task = self.read_line("Task> ")?;
            if task.trim().is_empty() {
                return Err(anyhow!("empty task provided"));
            }
            return Ok(task.trim().to_string());
        }
        let request = self.publish(kind, Vec::new(), serde_json::Value::Null, None)?;
        let value = self.await_response(&request)?;
        let parsed: TaskFile = serde_json::from_value(value)
            .with_context(|| format!("parse task for prompt {}", request.id))?;
        let task = parsed.task.trim().to_string();
        if task.is_empty() {
            return Err(anyhow!("empty task provided via prompt channel"));
        }
        Ok(task)
    }

    /// Escalate a reviewer disagreement to the admin.
    pub fn ask_tiebreak(&self, context: serde_json::Value) -> Result<TiebreakChoice> {
        if self.interactive {
            return self.ask_tiebreak_on_terminal(&context);
        }
        let request = self.publish(
            PromptKind::AdminTiebreak,
            vec!["Reviewers disagree. Choose the winning candidate and verdict.".to_string()],
            context,
            None,
        )?;
        let value = self.await_response(&request)?;
        serde_json::from_value(value)
            .with_context(|| format!("parse tie-break for prompt {}", request.id))
    }

    fn publish(
        &self,
        kind: PromptKind,
        questions: Vec<String>,
        context: serde_json::Value,
        deadline_secs: Option<u64>,
    ) -> Result<PromptRequest> {
        let request = PromptRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            questions,
            context,
            created_at: Utc::now().to_rfc3339(),
            deadline_secs,
        };
        let path = self.request_path(&request.id);
        let mut buf = serde_json::to_string_pretty(&request).context("serialize prompt request")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;

        // Notifier fan-out: append a compact copy for external delivery.
        let outbox = self.prompts_dir.join("outbox.jsonl");
        let line = serde_json::to_string(&request).context("serialize outbox line")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&outbox)
            .with_context(|| format!("open {}", outbox.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", outbox.display()))?;

        info!(id = %request.id, kind = ?request.kind, "prompt request published");
        Ok(request)
    }

    /// Poll until the response file appears, the deadline passes, or the run
    /// is cancelled.
    fn await_response(&self, request: &PromptRequest) -> Result<serde_json::Value> {
        let response_path = self.response_path(&request.id);
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                self.mark_cancelled(&request.id);
                return Err(anyhow!(LuigiError::Aborted));
            }
            if response_path.exists() {
                let contents = fs::read_to_string(&response_path)
                    .with_context(|| format!("read {}", response_path.display()))?;
                match serde_json::from_str(&contents) {
                    Ok(value) => {
                        let _ = fs::remove_file(&response_path);
                        let _ = fs::remove_file(self.request_path(&request.id));
                        debug!(id = %request.id, "prompt resolved");
                        return Ok(value);
                    }
                    // Possibly a mid-write file; retry next tick.
                    Err(err) => debug!(id = %request.id, %err, "response not yet parseable"),
                }
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() > timeout {
                    self.mark_cancelled(&request.id);
                    return Err(anyhow!(LuigiError::DeadlineExceeded(format!(
                        "prompt {} unanswered after {}s",
                        request.id,
                        timeout.as_secs()
                    ))));
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Rename the request so observers can tell it will never be served.
    fn mark_cancelled(&self, id: &str) {
        let from = self.request_path(id);
        let to = self.prompts_dir.join(format!("{id}.cancelled.json"));
        let _ = fs::rename(from, to);
    }

    fn ask_questions_on_terminal(&self, questions: &[String]) -> Result<Vec<QnaEntry>> {
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            println!();
            println!("Reviewer question:");
            println!("{question}");
            let answer = self.read_line("> ")?;
            answers.push(QnaEntry {
                question: question.clone(),
                answer: answer.trim().to_string(),
            });
        }
        Ok(answers)
    }

    fn ask_tiebreak_on_terminal(&self, context: &serde_json::Value) -> Result<TiebreakChoice> {
        println!();
        println!("Reviewers disagree. Context:");
        println!("{}", serde_json::to_string_pretty(context).unwrap_or_default());
        let winner = self.read_line("Winner candidate id> ")?;
        let verdict = loop {
            let raw = self.read_line("Verdict (approved/rejected)> ")?;
            match raw.trim().to_lowercase().as_str() {
                "approved" => break Verdict::Approved,
                "rejected" => break Verdict::Rejected,
                _ => println!("Please answer 'approved' or 'rejected'."),
            }
        };
        let notes = self.read_line("Notes (optional)> ")?;
        Ok(TiebreakChoice {
            winner_candidate_id: winner.trim().to_string(),
            verdict,
            notes: (!notes.trim().is_empty()).then(|| notes.trim().to_string()),
        })
    }

    fn read_line(&self, prompt: &str) -> Result<String> {
        use std::io::{BufRead, Write};
        print!("{prompt}");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read terminal input")?;
        Ok(line)
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{id}.request.json"))
    }

    fn response_path(&self, id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{id}.response.json"))
    }
}
