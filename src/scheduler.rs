//! Per-iteration coordinator: plan, assign, execute, test, review, decide.
//!
//! The scheduler is reentrant: it inspects the current iteration record and
//! performs only the missing work, so crash-resume re-enters naturally at
//! the first incomplete phase. Fan-out uses scoped threads; each candidate's
//! tests run on the same worker the moment its executor finishes, while
//! reviews wait until every candidate has test results, and consensus waits
//! for every (reviewer, candidate) review.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::core::assign::assign_executors;
use crate::core::consensus::{self, ConsensusOutcome};
use crate::core::types::{
    Candidate, CandidateStatus, Decision, IterationRecord, Plan, Review, Verdict,
    WorkspaceStrategy,
};
use crate::io::agent::{
    Agent, AnswerOutcome, AnswerRequest, ExecuteRequest, ExecutorStatus, PlanOutcome, PlanRequest,
    ReviewOutcome, ReviewRequest,
};
use crate::io::config::LuigiConfig;
use crate::io::prompt_channel::{PromptChannel, PromptKind, TiebreakChoice};
use crate::io::state::StateStore;
use crate::io::test_runner::run_tests;
use crate::io::workspace::{ProvisionRequest, StrategyChoice, Workspace, WorkspaceManager};

/// Lines of diff shown in review and tie-break contexts.
const DIFF_PREVIEW_LINES: usize = 40;

/// Result of driving one iteration to its decision.
#[derive(Debug)]
pub struct IterationOutcome {
    pub decision: Decision,
    pub winner_candidate_id: Option<String>,
    /// Kept only when the iteration was approved; the orchestrator persists
    /// it and owns disposal.
    pub winner_workspace: Option<Workspace>,
    /// Baseline for the next iteration when carry-forward adopted the
    /// rejected winner.
    pub next_baseline: Option<PathBuf>,
    /// Task override for the next iteration (reviewer next-prompts).
    pub next_task: Option<String>,
}

/// Shared handles the scheduler needs for one run.
pub struct Scheduler<'a> {
    pub config: &'a LuigiConfig,
    pub store: &'a StateStore,
    pub workspaces: &'a WorkspaceManager,
    pub prompts: &'a PromptChannel,
    pub cancel: &'a CancelToken,
    pub reviewers: &'a [Arc<dyn Agent>],
    pub executors: &'a [Arc<dyn Agent>],
    pub repo_path: &'a Path,
}

impl Scheduler<'_> {
    /// Drive the run's current iteration (creating it if needed) from its
    /// first incomplete phase through disposition.
    pub fn run_iteration(&self, baseline: &Path) -> Result<IterationOutcome> {
        self.cancel.check()?;
        let iteration_index = self.ensure_iteration()?;
        let task = self
            .store
            .snapshot()
            .task
            .unwrap_or_default();

        self.plan_phase(iteration_index, &task)?;
        self.cancel.check()?;
        self.assign_phase(iteration_index)?;
        self.cancel.check()?;
        let workspace_map = self.execute_phase(iteration_index, &task, baseline)?;
        self.cancel.check()?;

        let all_failed = self
            .store
            .snapshot()
            .iterations[iteration_index]
            .candidates
            .iter()
            .all(|c| c.status == CandidateStatus::Failed);
        if all_failed {
            warn!(iteration = iteration_index, "every candidate failed");
            return self.fail_iteration(iteration_index, workspace_map);
        }

        self.review_phase(iteration_index, &task)?;
        self.cancel.check()?;
        let (decision, winner_id, next_task) = self.consensus_phase(iteration_index)?;
        self.disposition_phase(iteration_index, decision, winner_id, next_task, workspace_map)
    }

    /// Reuse the last undecided iteration or open a new slot.
    fn ensure_iteration(&self) -> Result<usize> {
        self.store.update("iteration slot ready", |snapshot| {
            let reuse = snapshot
                .current_iteration()
                .is_some_and(|it| it.decision.is_none());
            if !reuse {
                let index = snapshot.iterations.len() as u32;
                snapshot
                    .iterations
                    .push(IterationRecord::new(index, Utc::now().to_rfc3339()));
            }
            snapshot.iterations.len() - 1
        })
    }

    /// Phase 1: concurrently plan with every reviewer, then settle
    /// clarification rounds serially.
    fn plan_phase(&self, iteration: usize, task: &str) -> Result<()> {
        if !self.store.snapshot().iterations[iteration].plans.is_empty() {
            info!(iteration, "plans already present, skipping planning");
            return Ok(());
        }
        self.store
            .note(&format!("iteration {iteration}: planning with {} reviewers", self.reviewers.len()))?;

        let user_context = self.store.snapshot().user_context();
        let outcomes: Vec<(String, Result<PlanOutcome>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .reviewers
                .iter()
                .map(|reviewer| {
                    let user_context = user_context.clone();
                    scope.spawn(move || {
                        let outcome = reviewer.plan(&PlanRequest {
                            task: task.to_string(),
                            user_context,
                            workdir: self.repo_path.to_path_buf(),
                        });
                        (reviewer.id().to_string(), outcome)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("planner thread panicked"))
                .collect()
        });

        let mut plans: Vec<Plan> = Vec::new();
        for (reviewer_id, outcome) in outcomes {
            match self.settle_plan(&reviewer_id, task, outcome) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }
        if plans.is_empty() {
            return Err(anyhow!("no reviewer produced a valid plan"));
        }

        self.store.update("plans recorded", |snapshot| {
            snapshot.iterations[iteration].plans = plans;
        })?;
        Ok(())
    }

    /// Resolve one reviewer's plan outcome, looping clarification rounds
    /// through the prompt channel. Invalid plans are dropped so one broken
    /// reviewer cannot sink an iteration with other valid plans.
    fn settle_plan(
        &self,
        reviewer_id: &str,
        task: &str,
        mut outcome: Result<PlanOutcome>,
    ) -> Result<Option<Plan>> {
        let reviewer = self
            .reviewers
            .iter()
            .find(|r| r.id() == reviewer_id)
            .ok_or_else(|| anyhow!("unknown reviewer {reviewer_id}"))?;
        let mut rounds = 0u32;
        loop {
            match outcome {
                Ok(PlanOutcome::Ready(plan)) => return Ok(Some(plan)),
                Ok(PlanOutcome::NeedsUserInput(questions)) => {
                    rounds += 1;
                    if rounds > self.config.orchestrator.max_question_rounds {
                        warn!(reviewer = reviewer_id, "plan clarification rounds exhausted");
                        self.store.note(&format!(
                            "reviewer {reviewer_id} dropped: clarification rounds exhausted"
                        ))?;
                        return Ok(None);
                    }
                    self.store
                        .note(&format!("reviewer {reviewer_id} asked the user {} question(s)", questions.len()))?;
                    let answers = self.prompts.ask_questions(
                        PromptKind::ReviewerClarification,
                        &questions,
                        json!({"reviewer_id": reviewer_id, "phase": "plan"}),
                    )?;
                    self.store.update("user answers recorded", |snapshot| {
                        snapshot.user_qna.extend(answers.clone());
                    })?;
                    let user_context = self.store.snapshot().user_context();
                    outcome = reviewer.plan(&PlanRequest {
                        task: task.to_string(),
                        user_context,
                        workdir: self.repo_path.to_path_buf(),
                    });
                }
                Err(err) => {
                    if err.downcast_ref::<crate::error::LuigiError>().is_none() {
                        return Err(err);
                    }
                    warn!(reviewer = reviewer_id, error = %err, "plan dropped");
                    self.store
                        .note(&format!("reviewer {reviewer_id} plan invalid: {err:#}"))?;
                    return Ok(None);
                }
            }
        }
    }

    /// Phase 2: create one candidate per (plan, executor) slot.
    fn assign_phase(&self, iteration: usize) -> Result<()> {
        let snapshot = self.store.snapshot();
        let record = &snapshot.iterations[iteration];
        if !record.candidates.is_empty() {
            return Ok(());
        }
        let plan_reviewers: Vec<String> =
            record.plans.iter().map(|p| p.reviewer_id.clone()).collect();
        let executor_ids: Vec<String> =
            self.executors.iter().map(|e| e.id().to_string()).collect();
        let assignments = assign_executors(
            &plan_reviewers,
            &executor_ids,
            self.config.orchestrator.executors_per_plan,
        );
        let index = record.index;
        let candidates: Vec<Candidate> = assignments
            .iter()
            .enumerate()
            .map(|(ordinal, assignment)| {
                Candidate::new(
                    Candidate::make_id(
                        index,
                        ordinal,
                        &assignment.plan_reviewer_id,
                        &assignment.executor_id,
                    ),
                    assignment.plan_reviewer_id.clone(),
                    assignment.executor_id.clone(),
                )
            })
            .collect();
        let count = candidates.len();
        self.store
            .update(&format!("iteration {iteration}: created {count} candidates"), |snapshot| {
                snapshot.iterations[iteration].candidates = candidates;
            })?;
        Ok(())
    }

    /// Phase 3 + 4: run executors concurrently; each worker runs the plan's
    /// tests as soon as its executor completes. Terminal candidates from a
    /// previous process get their workspaces reattached; the unreattachable
    /// ones are retried from the baseline with their session preserved.
    fn execute_phase(
        &self,
        iteration: usize,
        task: &str,
        baseline: &Path,
    ) -> Result<HashMap<String, Workspace>> {
        let mut workspace_map = HashMap::new();
        let snapshot = self.store.snapshot();
        let record = &snapshot.iterations[iteration];

        // Reattach what we can; queue everything else.
        let mut to_execute: Vec<String> = Vec::new();
        for candidate in &record.candidates {
            if candidate.status.is_terminal() {
                let reattached = candidate.workspace_strategy.and_then(|strategy| {
                    self.workspaces.reattach(
                        self.repo_path,
                        strategy,
                        candidate.workspace_path.as_deref(),
                    )
                });
                match reattached {
                    Some(workspace) => {
                        workspace_map.insert(candidate.id.clone(), workspace);
                    }
                    None => {
                        info!(candidate = %candidate.id, "workspace lost, retrying candidate");
                        let id = candidate.id.clone();
                        self.store.update("candidate requeued after lost workspace", |snapshot| {
                            if let Some(candidate) =
                                snapshot.iterations[iteration].candidate_mut(&id)
                            {
                                candidate.status = CandidateStatus::Pending;
                                candidate.test_report = None;
                            }
                        })?;
                        to_execute.push(id);
                    }
                }
            } else {
                to_execute.push(candidate.id.clone());
            }
        }

        if to_execute.is_empty() {
            info!(iteration, "all candidates already terminal");
            return Ok(workspace_map);
        }

        let strategy = self.candidate_strategy(baseline, record.candidates.len())?;
        self.store.note(&format!(
            "iteration {iteration}: executing {} candidate(s)",
            to_execute.len()
        ))?;

        let results: Vec<Result<(String, Option<Workspace>)>> = thread::scope(|scope| {
            let handles: Vec<_> = to_execute
                .iter()
                .map(|candidate_id| {
                    scope.spawn(move || {
                        self.run_candidate(iteration, candidate_id, task, baseline, strategy)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("candidate worker panicked"))?
                })
                .collect()
        });

        for result in results {
            let (candidate_id, workspace) = result?;
            if let Some(workspace) = workspace {
                workspace_map.insert(candidate_id, workspace);
            }
        }
        Ok(workspace_map)
    }

    /// One candidate, start to finish: provision, execute (with
    /// clarification rounds), test, snapshot changes.
    fn run_candidate(
        &self,
        iteration: usize,
        candidate_id: &str,
        task: &str,
        baseline: &Path,
        strategy: StrategyChoice,
    ) -> Result<(String, Option<Workspace>)> {
        let snapshot = self.store.snapshot();
        let record = &snapshot.iterations[iteration];
        let candidate = record
            .candidate(candidate_id)
            .ok_or_else(|| anyhow!("unknown candidate {candidate_id}"))?
            .clone();
        let plan = record
            .plan_for(&candidate.plan_reviewer_id)
            .ok_or_else(|| anyhow!("candidate {candidate_id} references missing plan"))?
            .clone();
        let run_id = snapshot.run_id.clone();

        let workspace = match self.workspaces.provision(&ProvisionRequest {
            repo_path: self.repo_path,
            source_path: baseline,
            run_id: &run_id,
            iteration: record.index,
            candidate_id,
            strategy,
            branch_prefix: &self.config.orchestrator.branch_prefix,
            branch_suffix_len: self.config.orchestrator.branch_suffix_length,
        }) {
            Ok(workspace) => workspace,
            Err(err) => {
                // Workspace errors are fatal for this candidate only.
                warn!(candidate = candidate_id, error = %err, "workspace provisioning failed");
                self.mark_candidate_failed(
                    iteration,
                    candidate_id,
                    &format!("workspace provisioning failed: {err:#}"),
                )?;
                return Ok((candidate_id.to_string(), None));
            }
        };

        self.store.update(
            &format!("candidate {candidate_id} running"),
            |snapshot| {
                if let Some(candidate) = snapshot.iterations[iteration].candidate_mut(candidate_id)
                {
                    candidate.status = CandidateStatus::Running;
                    candidate.workspace_path = Some(workspace.path.clone());
                    candidate.workspace_strategy = Some(workspace.strategy);
                }
            },
        )?;

        let executor = self
            .executors
            .iter()
            .find(|e| e.id() == candidate.executor_id)
            .ok_or_else(|| anyhow!("unknown executor {}", candidate.executor_id))?;

        let mut session = candidate.session_id.clone();
        let mut reviewer_answers: Option<String> = None;
        let mut rounds = candidate.clarification_rounds;
        let final_status;
        let mut final_summary;

        loop {
            if self.cancel.is_cancelled() {
                return Err(anyhow!(crate::error::LuigiError::Aborted));
            }
            let reply = match executor.execute(&ExecuteRequest {
                executor_prompt: plan.executor_prompt.clone(),
                reviewer_answers: reviewer_answers.take(),
                workdir: workspace.path.clone(),
                session: session.clone(),
            }) {
                Ok(reply) => reply,
                Err(err) => {
                    if err.downcast_ref::<crate::error::LuigiError>().is_none() {
                        return Err(err);
                    }
                    final_status = CandidateStatus::Failed;
                    final_summary = format!("executor failed: {err:#}");
                    break;
                }
            };
            session = reply.session_id.clone().or(session);

            match reply.status {
                ExecutorStatus::Done => {
                    final_status = CandidateStatus::Done;
                    final_summary = reply.summary;
                    break;
                }
                ExecutorStatus::Failed => {
                    final_status = CandidateStatus::Failed;
                    final_summary = if reply.summary.is_empty() {
                        "executor reported failure".to_string()
                    } else {
                        reply.summary
                    };
                    break;
                }
                ExecutorStatus::NeedsClarification { questions } => {
                    rounds += 1;
                    if rounds > self.config.orchestrator.max_question_rounds {
                        final_status = CandidateStatus::Failed;
                        final_summary =
                            "executor exceeded the clarification round cap".to_string();
                        break;
                    }
                    self.store.update(
                        &format!(
                            "candidate {candidate_id} asked reviewers (round {rounds})"
                        ),
                        |snapshot| {
                            if let Some(candidate) =
                                snapshot.iterations[iteration].candidate_mut(candidate_id)
                            {
                                candidate.status = CandidateStatus::NeedsClarification;
                                candidate.session_id = session.clone();
                                candidate.clarification_rounds = rounds;
                            }
                        },
                    )?;
                    let answers = self.collect_reviewer_answers(
                        task,
                        candidate_id,
                        &questions,
                        &workspace.path,
                    )?;
                    reviewer_answers = Some(answers);
                    self.store.update(
                        &format!("candidate {candidate_id} resuming executor session"),
                        |snapshot| {
                            if let Some(candidate) =
                                snapshot.iterations[iteration].candidate_mut(candidate_id)
                            {
                                candidate.status = CandidateStatus::Running;
                            }
                        },
                    )?;
                }
            }
        }

        // Testing starts for this candidate as soon as its executor is done;
        // failed candidates still run tests so reviewers see the evidence.
        let test_report = run_tests(
            &workspace.path,
            &self.config.testing,
            plan.test_commands.as_deref(),
        )?;
        if final_summary.is_empty() {
            final_summary = test_report.summary();
        }

        let changes = self
            .workspaces
            .snapshot_changes(&workspace)
            .unwrap_or_default();

        self.store.update(
            &format!("candidate {candidate_id} finished: {}", final_status.as_str()),
            |snapshot| {
                if let Some(candidate) = snapshot.iterations[iteration].candidate_mut(candidate_id)
                {
                    candidate.status = final_status;
                    candidate.summary = Some(final_summary.clone());
                    candidate.session_id = session.clone();
                    candidate.test_report = Some(test_report.clone());
                    candidate.changed_paths = changes.changed_paths.clone();
                    candidate.diff_preview = changes.diff_preview(DIFF_PREVIEW_LINES);
                    candidate.clarification_rounds = rounds;
                }
            },
        )?;

        Ok((candidate_id.to_string(), Some(workspace)))
    }

    /// Fan an executor's questions to every plan-holding reviewer and merge
    /// their answers. A reviewer that needs the user opens a prompt first.
    fn collect_reviewer_answers(
        &self,
        task: &str,
        candidate_id: &str,
        questions: &[String],
        workdir: &Path,
    ) -> Result<String> {
        let context = json!({
            "task": task,
            "candidate_id": candidate_id,
        })
        .to_string();
        let mut merged = Vec::new();
        for reviewer in self.reviewers {
            let mut rounds = 0u32;
            let answer = loop {
                let user_context = self.store.snapshot().user_context();
                let outcome = reviewer.answer(&AnswerRequest {
                    questions: questions.to_vec(),
                    context: context.clone(),
                    user_context,
                    workdir: workdir.to_path_buf(),
                })?;
                match outcome {
                    AnswerOutcome::Answer(answer) => break answer,
                    AnswerOutcome::NeedsUserInput(user_questions) => {
                        rounds += 1;
                        if rounds > self.config.orchestrator.max_question_rounds {
                            break "(reviewer could not answer)".to_string();
                        }
                        let answers = self.prompts.ask_questions(
                            PromptKind::ReviewerClarification,
                            &user_questions,
                            json!({"reviewer_id": reviewer.id(), "candidate_id": candidate_id}),
                        )?;
                        self.store.update("user answers recorded", |snapshot| {
                            snapshot.user_qna.extend(answers.clone());
                        })?;
                    }
                }
            };
            merged.push(format!("[{}] {answer}", reviewer.id()));
        }
        Ok(merged.join("\n\n"))
    }

    fn mark_candidate_failed(
        &self,
        iteration: usize,
        candidate_id: &str,
        summary: &str,
    ) -> Result<()> {
        self.store.update(
            &format!("candidate {candidate_id} failed"),
            |snapshot| {
                if let Some(candidate) = snapshot.iterations[iteration].candidate_mut(candidate_id)
                {
                    candidate.status = CandidateStatus::Failed;
                    candidate.summary = Some(summary.to_string());
                }
            },
        )
    }

    /// Phase 5: one review per (reviewer, candidate) pair, fanned out, with
    /// serial user-clarification follow-ups.
    fn review_phase(&self, iteration: usize, task: &str) -> Result<()> {
        let snapshot = self.store.snapshot();
        let record = &snapshot.iterations[iteration];
        let candidate_ids: Vec<String> =
            record.candidates.iter().map(|c| c.id.clone()).collect();
        let candidates_text = record
            .candidates
            .iter()
            .map(Candidate::summary_text)
            .collect::<Vec<_>>()
            .join("\n\n");

        let missing: Vec<(String, String)> = self
            .reviewers
            .iter()
            .flat_map(|reviewer| {
                candidate_ids.iter().map(move |candidate_id| {
                    (reviewer.id().to_string(), candidate_id.clone())
                })
            })
            .filter(|(reviewer_id, candidate_id)| {
                !record.reviews.iter().any(|review| {
                    &review.reviewer_id == reviewer_id && &review.candidate_id == candidate_id
                })
            })
            .collect();
        if missing.is_empty() {
            info!(iteration, "reviews already complete");
            return Ok(());
        }
        self.store.note(&format!(
            "iteration {iteration}: collecting {} review(s)",
            missing.len()
        ))?;

        let user_context = snapshot.user_context();
        let outcomes: Vec<(String, String, Result<ReviewOutcome>)> = thread::scope(|scope| {
            let handles: Vec<_> = missing
                .iter()
                .map(|(reviewer_id, candidate_id)| {
                    let user_context = user_context.clone();
                    let candidates_text = candidates_text.clone();
                    let candidate_ids = candidate_ids.clone();
                    scope.spawn(move || {
                        let reviewer = self
                            .reviewers
                            .iter()
                            .find(|r| r.id() == reviewer_id.as_str())
                            .expect("reviewer exists");
                        let outcome = reviewer.review(&ReviewRequest {
                            task: task.to_string(),
                            candidate_id: candidate_id.clone(),
                            candidates_text,
                            known_candidate_ids: candidate_ids,
                            user_context,
                            workdir: self.repo_path.to_path_buf(),
                        });
                        (reviewer_id.clone(), candidate_id.clone(), outcome)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("review thread panicked"))
                .collect()
        });

        for (reviewer_id, candidate_id, outcome) in outcomes {
            let settled = self.settle_review(
                &reviewer_id,
                &candidate_id,
                task,
                &candidates_text,
                &candidate_ids,
                outcome,
            )?;
            let Some(review) = settled else {
                self.store.note(&format!(
                    "review by {reviewer_id} of {candidate_id} failed"
                ))?;
                continue;
            };
            self.store.update(
                &format!("review recorded: {reviewer_id} on {candidate_id}"),
                |snapshot| {
                    snapshot.iterations[iteration].reviews.push(review.clone());
                },
            )?;
        }
        Ok(())
    }

    fn settle_review(
        &self,
        reviewer_id: &str,
        candidate_id: &str,
        task: &str,
        candidates_text: &str,
        candidate_ids: &[String],
        mut outcome: Result<ReviewOutcome>,
    ) -> Result<Option<Review>> {
        let reviewer = self
            .reviewers
            .iter()
            .find(|r| r.id() == reviewer_id)
            .ok_or_else(|| anyhow!("unknown reviewer {reviewer_id}"))?;
        let mut rounds = 0u32;
        loop {
            match outcome {
                Ok(ReviewOutcome::Ready(reply)) => {
                    return Ok(Some(Review {
                        reviewer_id: reviewer_id.to_string(),
                        candidate_id: candidate_id.to_string(),
                        verdict: if reply.approved {
                            Verdict::Approved
                        } else {
                            Verdict::Rejected
                        },
                        ranking: reply.ranking,
                        feedback: reply.feedback,
                        next_prompt: reply.next_prompt,
                    }));
                }
                Ok(ReviewOutcome::NeedsUserInput(questions)) => {
                    rounds += 1;
                    if rounds > self.config.orchestrator.max_question_rounds {
                        return Ok(None);
                    }
                    let answers = self.prompts.ask_questions(
                        PromptKind::ReviewerClarification,
                        &questions,
                        json!({"reviewer_id": reviewer_id, "phase": "review"}),
                    )?;
                    self.store.update("user answers recorded", |snapshot| {
                        snapshot.user_qna.extend(answers.clone());
                    })?;
                    let user_context = self.store.snapshot().user_context();
                    outcome = reviewer.review(&ReviewRequest {
                        task: task.to_string(),
                        candidate_id: candidate_id.to_string(),
                        candidates_text: candidates_text.to_string(),
                        known_candidate_ids: candidate_ids.to_vec(),
                        user_context,
                        workdir: self.repo_path.to_path_buf(),
                    });
                }
                Err(err) => {
                    if err.downcast_ref::<crate::error::LuigiError>().is_none() {
                        return Err(err);
                    }
                    warn!(reviewer = reviewer_id, candidate = candidate_id, error = %err, "review failed");
                    return Ok(None);
                }
            }
        }
    }

    /// Phase 6: Borda winner + verdict agreement, or admin tie-break.
    fn consensus_phase(
        &self,
        iteration: usize,
    ) -> Result<(Decision, String, Option<String>)> {
        let snapshot = self.store.snapshot();
        let record = &snapshot.iterations[iteration];
        let candidate_ids: Vec<String> =
            record.candidates.iter().map(|c| c.id.clone()).collect();

        match consensus::decide(&candidate_ids, &record.reviews) {
            Some(ConsensusOutcome::Unanimous { winner, verdict }) => {
                let next_task = (verdict == Verdict::Rejected)
                    .then(|| consensus::merged_next_prompt(&winner, &record.reviews))
                    .flatten();
                let decision = match verdict {
                    Verdict::Approved => Decision::Approved,
                    Verdict::Rejected => Decision::Rejected,
                };
                Ok((decision, winner, next_task))
            }
            outcome => {
                let winner_hint = match &outcome {
                    Some(ConsensusOutcome::Escalated { winner_hint }) => Some(winner_hint.clone()),
                    _ => None,
                };
                // An empty review set (every reviewer failed or was dropped)
                // also lands here; that is not a disagreement.
                self.store.note(if record.reviews.is_empty() {
                    "no valid reviews recorded, escalating to admin"
                } else {
                    "reviewers disagree, escalating to admin"
                })?;
                let choice = self.admin_tiebreak(record, winner_hint)?;
                if !candidate_ids.contains(&choice.winner_candidate_id) {
                    return Err(anyhow!(
                        "admin selected unknown candidate {:?}",
                        choice.winner_candidate_id
                    ));
                }
                let next_task = match choice.verdict {
                    Verdict::Approved => None,
                    Verdict::Rejected => {
                        let merged = consensus::merged_next_prompt(
                            &choice.winner_candidate_id,
                            &record.reviews,
                        );
                        match (merged, choice.notes.clone()) {
                            (Some(prompt), Some(notes)) => {
                                Some(format!("{prompt}\n\nAdmin notes:\n{notes}"))
                            }
                            (Some(prompt), None) => Some(prompt),
                            (None, Some(notes)) => Some(format!("Admin notes:\n{notes}")),
                            (None, None) => None,
                        }
                    }
                };
                Ok((
                    Decision::AdminEscalated {
                        verdict: choice.verdict,
                    },
                    choice.winner_candidate_id,
                    next_task,
                ))
            }
        }
    }

    /// Raise an admin-tiebreak prompt carrying every review and candidate
    /// summary (including diffs).
    fn admin_tiebreak(
        &self,
        record: &IterationRecord,
        winner_hint: Option<String>,
    ) -> Result<TiebreakChoice> {
        let context = json!({
            "iteration": record.index,
            "winner_hint": winner_hint,
            "reviews": record.reviews,
            "candidates": record
                .candidates
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "status": c.status.as_str(),
                    "summary": c.summary,
                    "tests": c.test_report.as_ref().map(|t| t.summary()),
                    "diff_preview": c.diff_preview,
                }))
                .collect::<Vec<_>>(),
        });
        self.prompts.ask_tiebreak(context)
    }

    /// Phase 7: record the decision, dispose losers immediately, and either
    /// hand the winner to the orchestrator (approved) or adopt it as the
    /// next baseline (rejected with carry-forward).
    fn disposition_phase(
        &self,
        iteration: usize,
        decision: Decision,
        winner_id: String,
        next_task: Option<String>,
        mut workspace_map: HashMap<String, Workspace>,
    ) -> Result<IterationOutcome> {
        let approved = decision.is_approved();
        self.store.update(
            &format!(
                "iteration {iteration} decided: {} (winner {winner_id})",
                if approved { "approved" } else { "rejected" }
            ),
            |snapshot| {
                let index = {
                    let record = &mut snapshot.iterations[iteration];
                    record.decision = Some(decision.clone());
                    record.winner_candidate_id = Some(winner_id.clone());
                    record.ended_at = Some(Utc::now().to_rfc3339());
                    record.index
                };
                snapshot.approved = approved;
                if approved {
                    snapshot.winning_iteration = Some(index);
                }
            },
        )?;

        let keep_losers = self.config.orchestrator.cleanup == "never";
        for (candidate_id, workspace) in &workspace_map {
            if candidate_id != &winner_id && !keep_losers {
                self.workspaces.dispose(workspace);
            }
        }

        let winner_workspace = workspace_map.remove(&winner_id);
        if approved {
            return Ok(IterationOutcome {
                decision,
                winner_candidate_id: Some(winner_id),
                winner_workspace,
                next_baseline: None,
                next_task,
            });
        }

        let mut next_baseline = None;
        if self.config.orchestrator.carry_forward {
            if let Some(workspace) = &winner_workspace {
                let run_id = self.store.snapshot().run_id;
                let next_index = self.store.snapshot().iterations[iteration].index + 1;
                next_baseline =
                    Some(self.workspaces.adopt_as_baseline(workspace, &run_id, next_index)?);
                self.store.note(&format!(
                    "carry-forward: adopted {winner_id} as iteration {next_index} baseline"
                ))?;
            }
        }
        if let Some(workspace) = &winner_workspace {
            if self.config.orchestrator.cleanup != "never" {
                self.workspaces.dispose(workspace);
            }
        }

        Ok(IterationOutcome {
            decision,
            winner_candidate_id: Some(winner_id),
            winner_workspace: None,
            next_baseline,
            next_task,
        })
    }

    /// Every candidate failed: the iteration is rejected without a winner.
    fn fail_iteration(
        &self,
        iteration: usize,
        workspace_map: HashMap<String, Workspace>,
    ) -> Result<IterationOutcome> {
        self.store.update(
            &format!("iteration {iteration} failed: all candidates failed"),
            |snapshot| {
                let record = &mut snapshot.iterations[iteration];
                record.decision = Some(Decision::Rejected);
                record.ended_at = Some(Utc::now().to_rfc3339());
            },
        )?;
        if self.config.orchestrator.cleanup != "never" {
            for workspace in workspace_map.values() {
                self.workspaces.dispose(workspace);
            }
        }
        Ok(IterationOutcome {
            decision: Decision::Rejected,
            winner_candidate_id: None,
            winner_workspace: None,
            next_baseline: None,
            next_task: None,
        })
    }

    /// Pick the provisioning strategy for this iteration's candidates.
    fn candidate_strategy(
        &self,
        baseline: &Path,
        candidate_count: usize,
    ) -> Result<StrategyChoice> {
        // A carried-forward baseline holds uncommitted changes only the copy
        // strategy can both inherit and later apply back to the repo.
        if baseline != self.repo_path {
            return Ok(StrategyChoice::Explicit(WorkspaceStrategy::Copy));
        }
        let mut choice = StrategyChoice::parse(&self.config.orchestrator.workspace_strategy)?;
        if candidate_count > 1
            && choice == StrategyChoice::Explicit(WorkspaceStrategy::InPlace)
        {
            // Concurrent candidates in the same directory would corrupt each
            // other; fall back to isolated workspaces.
            choice = StrategyChoice::Auto;
        }
        Ok(choice)
    }
}
