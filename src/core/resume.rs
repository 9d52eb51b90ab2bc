//! Resume classification: where to re-enter the scheduler after a crash.
//!
//! Classification is a pure function of the snapshot, so resuming twice from
//! the same snapshot always re-enters at the same point.

use crate::core::types::{RunSnapshot, RunStatus};

/// The point at which a resumed run re-enters the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStage {
    /// No iteration started yet; run from the top.
    Fresh,
    /// Iteration exists but produced no plans.
    Planning,
    /// Plans present, at least one candidate not terminal.
    Execution,
    /// All candidates terminal but reviews incomplete.
    Review,
    /// All reviews recorded, decision absent.
    Consensus,
    /// Decision approved but persistence did not finish.
    Disposition,
    /// Run already reached a terminal state; nothing to do.
    Terminal,
}

/// Classify a snapshot into the stage the scheduler should re-enter.
///
/// `reviewer_count` is the configured number of reviewers; reviews are
/// complete once every (reviewer, candidate) pair is recorded.
pub fn classify(snapshot: &RunSnapshot, reviewer_count: usize) -> ResumeStage {
    match snapshot.status {
        RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted => {
            return ResumeStage::Terminal;
        }
        _ => {}
    }

    let Some(iteration) = snapshot.current_iteration() else {
        return ResumeStage::Fresh;
    };

    if let Some(decision) = &iteration.decision {
        if decision.is_approved() && !snapshot.persisted {
            return ResumeStage::Disposition;
        }
        // Decision recorded and disposition finished: the next iteration
        // never materialized, so continue from a fresh iteration slot.
        return ResumeStage::Fresh;
    }

    if iteration.plans.is_empty() {
        return ResumeStage::Planning;
    }

    let all_terminal = !iteration.candidates.is_empty()
        && iteration
            .candidates
            .iter()
            .all(|c| c.status.is_terminal());
    if !all_terminal {
        return ResumeStage::Execution;
    }

    let expected_reviews = reviewer_count * iteration.candidates.len();
    if iteration.reviews.len() < expected_reviews {
        return ResumeStage::Review;
    }

    ResumeStage::Consensus
}

/// Candidates that still need executing when re-entering at `Execution`.
pub fn pending_candidate_ids(snapshot: &RunSnapshot) -> Vec<String> {
    snapshot
        .current_iteration()
        .map(|iteration| {
            iteration
                .candidates
                .iter()
                .filter(|c| !c.status.is_terminal())
                .map(|c| c.id.clone())
                .collect()
        })
        .unwrap_or_default()
}
