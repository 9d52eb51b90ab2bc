//! Reviewer consensus: Borda-count winner selection and verdict agreement.
//!
//! Each reviewer supplies a preference ranking over all candidates. Rankings
//! are combined with a Borda count (a candidate ranked at position `i` of `m`
//! earns `m - 1 - i` points per reviewer); ties break toward the earliest
//! candidate id. The iteration verdict is the reviewers' verdict on the
//! winner when they agree; disagreement escalates to the admin.

use std::collections::BTreeMap;

use crate::core::types::{Review, Verdict};

/// Outcome of combining all reviews for an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Every reviewer's verdict on the winner agrees.
    Unanimous { winner: String, verdict: Verdict },
    /// Verdicts on the winner disagree; the admin must break the tie.
    Escalated { winner_hint: String },
}

/// Borda scores per candidate, sorted best-first (score desc, id asc).
pub fn rank_candidates(candidate_ids: &[String], reviews: &[Review]) -> Vec<(String, u32)> {
    let mut scores: BTreeMap<&str, u32> = candidate_ids
        .iter()
        .map(|id| (id.as_str(), 0u32))
        .collect();

    for ranking in reviewer_rankings(reviews).values() {
        let m = candidate_ids.len() as u32;
        for (position, candidate_id) in ranking.iter().enumerate() {
            if let Some(score) = scores.get_mut(candidate_id.as_str()) {
                *score += m.saturating_sub(position as u32 + 1);
            }
        }
    }

    let mut ranked: Vec<(String, u32)> = scores
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    // BTreeMap already yields ids ascending, so equal scores keep the
    // earliest id first after this stable sort.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

/// Combine all final reviews into a consensus outcome.
///
/// Returns `None` when there are no reviews or no candidates to rank.
pub fn decide(candidate_ids: &[String], reviews: &[Review]) -> Option<ConsensusOutcome> {
    if candidate_ids.is_empty() || reviews.is_empty() {
        return None;
    }
    let ranked = rank_candidates(candidate_ids, reviews);
    let winner = ranked.first()?.0.clone();

    let verdicts: Vec<Verdict> = reviews
        .iter()
        .filter(|r| r.candidate_id == winner)
        .map(|r| r.verdict)
        .collect();
    if verdicts.is_empty() {
        // No reviewer evaluated the winner directly; the admin decides.
        return Some(ConsensusOutcome::Escalated { winner_hint: winner });
    }
    let first = verdicts[0];
    if verdicts.iter().all(|v| *v == first) {
        Some(ConsensusOutcome::Unanimous {
            winner,
            verdict: first,
        })
    } else {
        Some(ConsensusOutcome::Escalated { winner_hint: winner })
    }
}

/// Collect the suggested next-iteration prompts from reviewers that rejected
/// the winner, merged into one task string for the next iteration.
pub fn merged_next_prompt(winner: &str, reviews: &[Review]) -> Option<String> {
    let parts: Vec<String> = reviews
        .iter()
        .filter(|r| r.candidate_id == winner)
        .filter_map(|r| {
            r.next_prompt
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| format!("[{}] {p}", r.reviewer_id))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// One ranking per reviewer. Reviewers submit the same preference order with
/// each of their reviews; the ranking attached to the review of the earliest
/// candidate id is taken as canonical so the result does not depend on review
/// arrival order.
fn reviewer_rankings(reviews: &[Review]) -> BTreeMap<&str, &Vec<String>> {
    let mut per_reviewer: BTreeMap<&str, (&str, &Vec<String>)> = BTreeMap::new();
    for review in reviews {
        if review.ranking.is_empty() {
            continue;
        }
        per_reviewer
            .entry(review.reviewer_id.as_str())
            .and_modify(|(candidate, ranking)| {
                if review.candidate_id.as_str() < *candidate {
                    *candidate = review.candidate_id.as_str();
                    *ranking = &review.ranking;
                }
            })
            .or_insert((review.candidate_id.as_str(), &review.ranking));
    }
    per_reviewer
        .into_iter()
        .map(|(reviewer, (_, ranking))| (reviewer, ranking))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(reviewer: &str, candidate: &str, verdict: Verdict, ranking: &[&str]) -> Review {
        Review {
            reviewer_id: reviewer.to_string(),
            candidate_id: candidate.to_string(),
            verdict,
            ranking: ranking.iter().map(|s| s.to_string()).collect(),
            feedback: "feedback".to_string(),
            next_prompt: None,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unanimous_approval_selects_common_winner() {
        let candidates = ids(&["c1", "c2"]);
        let reviews = vec![
            review("a", "c1", Verdict::Approved, &["c1", "c2"]),
            review("a", "c2", Verdict::Rejected, &["c1", "c2"]),
            review("b", "c1", Verdict::Approved, &["c1", "c2"]),
            review("b", "c2", Verdict::Rejected, &["c1", "c2"]),
        ];
        assert_eq!(
            decide(&candidates, &reviews),
            Some(ConsensusOutcome::Unanimous {
                winner: "c1".to_string(),
                verdict: Verdict::Approved,
            })
        );
    }

    #[test]
    fn borda_tie_breaks_to_earliest_candidate_id() {
        // Reviewer a prefers c1, reviewer b prefers c2: 1 point each.
        let candidates = ids(&["c1", "c2"]);
        let reviews = vec![
            review("a", "c1", Verdict::Approved, &["c1", "c2"]),
            review("a", "c2", Verdict::Approved, &["c1", "c2"]),
            review("b", "c1", Verdict::Approved, &["c2", "c1"]),
            review("b", "c2", Verdict::Approved, &["c2", "c1"]),
        ];
        let ranked = rank_candidates(&candidates, &reviews);
        assert_eq!(ranked[0], ("c1".to_string(), 1));
        assert_eq!(ranked[1], ("c2".to_string(), 1));
    }

    #[test]
    fn verdict_disagreement_on_winner_escalates() {
        // Borda tie broken toward c1; a approves c1, b rejects it.
        let candidates = ids(&["c1", "c2"]);
        let reviews = vec![
            review("a", "c1", Verdict::Approved, &["c1", "c2"]),
            review("a", "c2", Verdict::Rejected, &["c1", "c2"]),
            review("b", "c1", Verdict::Rejected, &["c2", "c1"]),
            review("b", "c2", Verdict::Approved, &["c2", "c1"]),
        ];
        assert_eq!(
            decide(&candidates, &reviews),
            Some(ConsensusOutcome::Escalated {
                winner_hint: "c1".to_string()
            })
        );
    }

    #[test]
    fn unanimous_rejection_is_a_consensus() {
        let candidates = ids(&["c1"]);
        let reviews = vec![
            review("a", "c1", Verdict::Rejected, &["c1"]),
            review("b", "c1", Verdict::Rejected, &["c1"]),
        ];
        assert_eq!(
            decide(&candidates, &reviews),
            Some(ConsensusOutcome::Unanimous {
                winner: "c1".to_string(),
                verdict: Verdict::Rejected,
            })
        );
    }

    #[test]
    fn decide_requires_reviews() {
        assert_eq!(decide(&ids(&["c1"]), &[]), None);
        assert_eq!(decide(&[], &[review("a", "c1", Verdict::Approved, &["c1"])]), None);
    }

    #[test]
    fn merged_next_prompt_collects_rejecting_reviewers() {
        let mut first = review("a", "c1", Verdict::Rejected, &["c1"]);
        first.next_prompt = Some("fix the tests".to_string());
        let second = review("b", "c1", Verdict::Rejected, &["c1"]);
        let merged = merged_next_prompt("c1", &[first, second]).expect("prompt");
        assert_eq!(merged, "[a] fix the tests");
    }

    #[test]
    fn rankings_ignore_unknown_candidates() {
        let candidates = ids(&["c1"]);
        let reviews = vec![review("a", "c1", Verdict::Approved, &["ghost", "c1"])];
        let ranked = rank_candidates(&candidates, &reviews);
        assert_eq!(ranked, vec![("c1".to_string(), 0)]);
    }
}
