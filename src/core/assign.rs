//! Executor assignment for the candidate fan-out.
//!
//! Every plan gets `executors_per_plan` candidates; executors rotate through
//! plans in a stable round-robin so repeated runs produce identical
//! assignments. Candidate count is deliberately `plans * executors_per_plan`.

/// One (plan, executor) pairing produced by assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub plan_reviewer_id: String,
    pub executor_id: String,
}

/// Pair each plan with `executors_per_plan` executors, round-robin.
pub fn assign_executors(
    plan_reviewer_ids: &[String],
    executor_ids: &[String],
    executors_per_plan: usize,
) -> Vec<Assignment> {
    let mut assignments = Vec::new();
    if plan_reviewer_ids.is_empty() || executor_ids.is_empty() {
        return assignments;
    }
    let per_plan = executors_per_plan.max(1);
    let mut index = 0usize;
    for reviewer_id in plan_reviewer_ids {
        for _ in 0..per_plan {
            let executor_id = &executor_ids[index % executor_ids.len()];
            index += 1;
            assignments.push(Assignment {
                plan_reviewer_id: reviewer_id.clone(),
                executor_id: executor_id.clone(),
            });
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn one_executor_per_plan_round_robins() {
        let assignments = assign_executors(&ids(&["r1", "r2"]), &ids(&["e1", "e2"]), 1);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].plan_reviewer_id, "r1");
        assert_eq!(assignments[0].executor_id, "e1");
        assert_eq!(assignments[1].plan_reviewer_id, "r2");
        assert_eq!(assignments[1].executor_id, "e2");
    }

    #[test]
    fn cartesian_blowup_is_explicit() {
        let assignments = assign_executors(&ids(&["r1", "r2"]), &ids(&["e1", "e2"]), 2);
        assert_eq!(assignments.len(), 4);
        // r1 gets e1 and e2, then r2 wraps around to e1 and e2 again.
        let pairs: Vec<(&str, &str)> = assignments
            .iter()
            .map(|a| (a.plan_reviewer_id.as_str(), a.executor_id.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("r1", "e1"), ("r1", "e2"), ("r2", "e1"), ("r2", "e2")]
        );
    }

    #[test]
    fn fewer_executors_than_slots_wraps() {
        let assignments = assign_executors(&ids(&["r1"]), &ids(&["e1"]), 3);
        assert_eq!(assignments.len(), 3);
        assert!(assignments.iter().all(|a| a.executor_id == "e1"));
    }

    #[test]
    fn empty_inputs_produce_no_assignments() {
        assert!(assign_executors(&[], &ids(&["e1"]), 1).is_empty());
        assert!(assign_executors(&ids(&["r1"]), &[], 1).is_empty());
    }
}
