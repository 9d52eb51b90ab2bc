//! Shared deterministic types for the orchestration core.
//!
//! These types define the stable contract between components and the shape of
//! the persisted `state.json` snapshot. They must not depend on I/O and must
//! serialize deterministically across runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Terminal and in-flight states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    /// Session mode only: run finished, waiting for the next task.
    Idle,
    Completed,
    Failed,
    Aborted,
}

/// How a workspace materializes the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    InPlace,
    Copy,
    Worktree,
}

impl WorkspaceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InPlace => "in_place",
            Self::Copy => "copy",
            Self::Worktree => "worktree",
        }
    }
}

/// A single test command from a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, rename = "timeout_sec", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// One ordered work item inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// Structured planner output, normalized from the reviewer's plan message.
///
/// `test_commands: None` means "use the configured fallback commands";
/// a present list is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Reviewer that issued the plan.
    pub reviewer_id: String,
    /// Prompt handed to executors implementing this plan.
    pub executor_prompt: String,
    pub tasks: Vec<PlanTask>,
    pub test_commands: Option<Vec<TestCommand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Candidate lifecycle: pending -> running -> (needs-clarification <-> running)*
/// -> done | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateStatus {
    Pending,
    Running,
    NeedsClarification,
    Done,
    Failed,
}

impl CandidateStatus {
    /// Whether the candidate reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsClarification => "needs-clarification",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Result of one test command run in a candidate workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRecord {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// All test commands run for one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub commands: Vec<CommandRecord>,
    /// Present when `install_if_missing` triggered a dependency install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_deps: Option<CommandRecord>,
}

impl TestReport {
    pub fn all_passed(&self) -> bool {
        self.commands.iter().all(CommandRecord::passed)
    }

    /// One-line summary for review prompts and history events.
    pub fn summary(&self) -> String {
        if self.commands.is_empty() {
            return "No tests were run.".to_string();
        }
        let parts: Vec<String> = self
            .commands
            .iter()
            .map(|cmd| {
                let label = cmd.argv.join(" ");
                if cmd.timed_out {
                    format!("{label}: timed out")
                } else {
                    format!("{label}: exit {}", cmd.exit_code)
                }
            })
            .collect();
        parts.join("; ")
    }
}

/// One executor's attempt to implement one plan in a dedicated workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Reviewer whose plan this candidate implements. Must reference a plan
    /// in the same iteration.
    pub plan_reviewer_id: String,
    pub executor_id: String,
    pub status: CandidateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_strategy: Option<WorkspaceStrategy>,
    /// Opaque executor session id, reused to resume the same conversation.
    /// Never shared across candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_report: Option<TestReport>,
    #[serde(default)]
    pub changed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff_preview: String,
    #[serde(default)]
    pub clarification_rounds: u32,
}

impl Candidate {
    pub fn new(id: String, plan_reviewer_id: String, executor_id: String) -> Self {
        Self {
            id,
            plan_reviewer_id,
            executor_id,
            status: CandidateStatus::Pending,
            workspace_path: None,
            workspace_strategy: None,
            session_id: None,
            summary: None,
            test_report: None,
            changed_paths: Vec::new(),
            diff_preview: String::new(),
            clarification_rounds: 0,
        }
    }

    /// Deterministic candidate id. The zero-padded ordinal comes first so the
    /// lexicographic order of ids equals creation order, which is what the
    /// consensus tie-break relies on.
    pub fn make_id(iteration: u32, ordinal: usize, reviewer_id: &str, executor_id: &str) -> String {
        format!("iter{iteration}-c{ordinal:02}-{reviewer_id}-{executor_id}")
    }

    /// Compact text block describing this candidate for review prompts.
    pub fn summary_text(&self) -> String {
        let mut lines = vec![
            format!("candidate_id: {}", self.id),
            format!("plan_reviewer_id: {}", self.plan_reviewer_id),
            format!("executor_id: {}", self.executor_id),
            format!("status: {}", self.status.as_str()),
        ];
        if let Some(report) = &self.test_report {
            lines.push(format!("tests: {}", report.summary()));
        }
        if let Some(summary) = &self.summary {
            lines.push(format!("executor_summary: {summary}"));
        }
        if !self.changed_paths.is_empty() {
            lines.push(format!("changed_paths: {}", self.changed_paths.join(", ")));
        }
        if !self.diff_preview.is_empty() {
            lines.push("diff_preview:".to_string());
            lines.push(self.diff_preview.clone());
        }
        lines.join("\n")
    }
}

/// A reviewer's verdict on a single candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    Rejected,
}

/// One reviewer's final evaluation of one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: String,
    pub candidate_id: String,
    pub verdict: Verdict,
    /// Preference order over all candidates in the iteration, best first.
    pub ranking: Vec<String>,
    pub feedback: String,
    /// Prompt the reviewer suggests for the next iteration when rejecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_prompt: Option<String>,
}

/// Final decision for an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Decision {
    Approved,
    Rejected,
    /// Reviewers disagreed; an admin chose the winner and verdict.
    AdminEscalated { verdict: Verdict },
    Aborted,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(
            self,
            Self::Approved
                | Self::AdminEscalated {
                    verdict: Verdict::Approved
                }
        )
    }
}

/// One plan/execute/test/review cycle within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 0-based index within the run.
    pub index: u32,
    pub plans: Vec<Plan>,
    pub candidates: Vec<Candidate>,
    pub reviews: Vec<Review>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_candidate_id: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl IterationRecord {
    pub fn new(index: u32, started_at: String) -> Self {
        Self {
            index,
            plans: Vec::new(),
            candidates: Vec::new(),
            reviews: Vec::new(),
            decision: None,
            winner_candidate_id: None,
            started_at,
            ended_at: None,
        }
    }

    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn candidate_mut(&mut self, id: &str) -> Option<&mut Candidate> {
        self.candidates.iter_mut().find(|c| c.id == id)
    }

    pub fn plan_for(&self, reviewer_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.reviewer_id == reviewer_id)
    }
}

/// Accumulated question/answer exchange with the human user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QnaEntry {
    pub question: String,
    pub answer: String,
}

/// Machine-readable terminal failure recorded in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    pub kind: String,
    pub message: String,
}

/// The serialized shadow of a run. In-memory state is authoritative while the
/// process lives; this snapshot becomes authoritative after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub repo_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub created_at: String,
    pub status: RunStatus,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winning_iteration: Option<u32>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default)]
    pub session_index: u32,
    #[serde(default)]
    pub user_qna: Vec<QnaEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TerminalError>,
}

impl RunSnapshot {
    pub fn new(run_id: String, repo_path: PathBuf, created_at: String) -> Self {
        Self {
            run_id,
            repo_path,
            task: None,
            created_at,
            status: RunStatus::Pending,
            iterations: Vec::new(),
            winning_iteration: None,
            approved: false,
            persisted: false,
            session_index: 0,
            user_qna: Vec::new(),
            commit_sha: None,
            branch_name: None,
            merge_commit_sha: None,
            error: None,
        }
    }

    pub fn current_iteration(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    pub fn current_iteration_mut(&mut self) -> Option<&mut IterationRecord> {
        self.iterations.last_mut()
    }

    /// Q&A transcript formatted for agent prompts.
    pub fn user_context(&self) -> String {
        let mut lines = Vec::new();
        for entry in &self.user_qna {
            if entry.question.trim().is_empty() {
                continue;
            }
            lines.push(format!("Q: {}", entry.question.trim()));
            lines.push(format!("A: {}", entry.answer.trim()));
            lines.push(String::new());
        }
        lines.join("\n").trim_end().to_string()
    }
}

/// Check the cross-reference invariants of a snapshot.
///
/// Returns human-readable violations; empty means the snapshot is coherent.
pub fn validate_snapshot(snapshot: &RunSnapshot) -> Vec<String> {
    let mut errors = Vec::new();
    for iteration in &snapshot.iterations {
        let reviewer_ids: Vec<&str> = iteration
            .plans
            .iter()
            .map(|p| p.reviewer_id.as_str())
            .collect();
        for candidate in &iteration.candidates {
            if !reviewer_ids.contains(&candidate.plan_reviewer_id.as_str()) {
                errors.push(format!(
                    "iteration {}: candidate {} references unknown plan reviewer {}",
                    iteration.index, candidate.id, candidate.plan_reviewer_id
                ));
            }
        }
        for review in &iteration.reviews {
            if iteration.candidate(&review.candidate_id).is_none() {
                errors.push(format!(
                    "iteration {}: review by {} references unknown candidate {}",
                    iteration.index, review.reviewer_id, review.candidate_id
                ));
            }
        }
        if let Some(winner) = &iteration.winner_candidate_id {
            if iteration.candidate(winner).is_none() {
                errors.push(format!(
                    "iteration {}: winner {} is not a candidate",
                    iteration.index, winner
                ));
            }
        }
    }
    if snapshot.status == RunStatus::Completed
        && !snapshot
            .iterations
            .iter()
            .any(|it| it.decision.as_ref().is_some_and(Decision::is_approved))
    {
        errors.push("run is completed but no iteration was approved".to_string());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_candidate(plan_reviewer: &str, candidate_reviewer: &str) -> RunSnapshot {
        let mut snapshot = RunSnapshot::new(
            "run-1".to_string(),
            PathBuf::from("/tmp/repo"),
            "2026-01-01T00:00:00Z".to_string(),
        );
        let mut iteration = IterationRecord::new(0, snapshot.created_at.clone());
        iteration.plans.push(Plan {
            reviewer_id: plan_reviewer.to_string(),
            executor_prompt: "do it".to_string(),
            tasks: vec![PlanTask {
                id: "t1".to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
            }],
            test_commands: None,
            notes: None,
        });
        iteration.candidates.push(Candidate::new(
            Candidate::make_id(0, 0, candidate_reviewer, "executor-1"),
            candidate_reviewer.to_string(),
            "executor-1".to_string(),
        ));
        snapshot.iterations.push(iteration);
        snapshot
    }

    #[test]
    fn candidate_ids_sort_in_creation_order() {
        let first = Candidate::make_id(1, 0, "reviewer-1", "executor-1");
        let second = Candidate::make_id(1, 1, "reviewer-1", "executor-2");
        let eleventh = Candidate::make_id(1, 10, "reviewer-1", "executor-1");
        assert!(first < second);
        assert!(second < eleventh);
    }

    #[test]
    fn validate_accepts_coherent_snapshot() {
        let snapshot = snapshot_with_candidate("reviewer-1", "reviewer-1");
        assert!(validate_snapshot(&snapshot).is_empty());
    }

    #[test]
    fn validate_flags_dangling_plan_reference() {
        let snapshot = snapshot_with_candidate("reviewer-1", "reviewer-2");
        let errors = validate_snapshot(&snapshot);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown plan reviewer"));
    }

    #[test]
    fn validate_flags_completed_run_without_approval() {
        let mut snapshot = snapshot_with_candidate("reviewer-1", "reviewer-1");
        snapshot.status = RunStatus::Completed;
        let errors = validate_snapshot(&snapshot);
        assert!(errors.iter().any(|e| e.contains("no iteration was approved")));
    }

    #[test]
    fn test_report_summary_labels_timeouts() {
        let report = TestReport {
            commands: vec![
                CommandRecord {
                    argv: vec!["npm".to_string(), "test".to_string()],
                    exit_code: 0,
                    duration_ms: 10,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                },
                CommandRecord {
                    argv: vec!["slow".to_string()],
                    exit_code: 124,
                    duration_ms: 9_999,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                },
            ],
            installed_deps: None,
        };
        assert_eq!(report.summary(), "npm test: exit 0; slow: timed out");
        assert!(!report.all_passed());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = snapshot_with_candidate("reviewer-1", "reviewer-1");
        let json = serde_json::to_string_pretty(&snapshot).expect("serialize");
        let loaded: RunSnapshot = serde_json::from_str(&json).expect("parse");
        assert_eq!(loaded, snapshot);
    }
}
