// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stage scheduler — balance pipeline stages across a fixed rank pool.
//!
//! A pipelined placement run is only as fast as its slowest stage. Given
//! the average per-item cost of every stage and the number of ranks in the
//! job, the scheduler picks how many ranks each stage gets so that the
//! predicted per-stage wall time `cost[s] / ranks[s]` is as flat as
//! possible, then buckets concrete rank ids into stages.

use std::collections::HashMap;

/// Convert raw per-stage average costs into relative difficulties.
///
/// Difficulties are the costs normalised to sum to 1; they are what
/// [`solve`] balances. An all-zero cost vector yields uniform difficulty.
#[must_use]
pub fn to_difficulty(per_stage_cost: &[f64]) -> Vec<f64> {
    let total: f64 = per_stage_cost.iter().sum();
    if total <= 0.0 {
        let n = per_stage_cost.len();
        #[allow(clippy::cast_precision_loss)] // stage counts are tiny
        return vec![1.0 / n.max(1) as f64; n];
    }
    per_stage_cost.iter().map(|c| c / total).collect()
}

/// Distribute `ranks` over `difficulty.len()` stages.
///
/// Every stage gets one rank as a floor; each remaining rank goes to the
/// stage with the highest predicted wall time `difficulty[s] / ranks[s]`,
/// re-evaluated after every assignment. Returns the rank count per stage,
/// summing to `ranks`.
///
/// # Errors
///
/// Returns a message if there are fewer ranks than stages, or no stages.
pub fn solve(ranks: u32, difficulty: &[f64]) -> Result<Vec<u32>, String> {
    let stages = difficulty.len();
    if stages == 0 {
        return Err(String::from("schedule: no stages to assign"));
    }
    if (ranks as usize) < stages {
        return Err(format!(
            "schedule: {ranks} ranks cannot cover {stages} stages"
        ));
    }

    let mut per_stage = vec![1u32; stages];
    let mut remaining = ranks - u32::try_from(stages).map_err(|e| e.to_string())?;

    while remaining > 0 {
        // stage with the currently worst predicted wall time
        let slowest = (0..stages)
            .max_by(|&a, &b| {
                let wa = difficulty[a] / f64::from(per_stage[a]);
                let wb = difficulty[b] / f64::from(per_stage[b]);
                wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0);
        per_stage[slowest] += 1;
        remaining -= 1;
    }

    Ok(per_stage)
}

/// Concrete rank-to-stage mapping produced by [`assign`].
#[derive(Debug, Clone)]
pub struct StageAssignment {
    /// Stage index for every rank id.
    pub stage_of_rank: HashMap<u32, usize>,
    /// Rank ids belonging to each stage, in ascending order.
    pub ranks_of_stage: Vec<Vec<u32>>,
}

impl StageAssignment {
    /// Stage of the given rank, if the rank is part of the job.
    #[must_use]
    pub fn local_stage(&self, rank: u32) -> Option<usize> {
        self.stage_of_rank.get(&rank).copied()
    }

    /// Worker-pool size of a stage.
    #[must_use]
    pub fn stage_width(&self, stage: usize) -> usize {
        self.ranks_of_stage.get(stage).map_or(0, Vec::len)
    }
}

/// Bucket rank ids into stages: ranks `0..per_stage[0]` form stage 0, the
/// next `per_stage[1]` form stage 1, and so on. Ranks within one bucket are
/// that stage's worker pool.
#[must_use]
pub fn assign(per_stage: &[u32]) -> StageAssignment {
    let mut stage_of_rank = HashMap::new();
    let mut ranks_of_stage = Vec::with_capacity(per_stage.len());

    let mut next_rank = 0u32;
    for (stage, &count) in per_stage.iter().enumerate() {
        let mut bucket = Vec::with_capacity(count as usize);
        for _ in 0..count {
            stage_of_rank.insert(next_rank, stage);
            bucket.push(next_rank);
            next_rank += 1;
        }
        ranks_of_stage.push(bucket);
    }

    StageAssignment {
        stage_of_rank,
        ranks_of_stage,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_normalises_to_one() {
        let d = to_difficulty(&[2.0, 1.0, 1.0]);
        let sum: f64 = d.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12, "sum={sum}");
        assert!((d[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn difficulty_of_zero_costs_is_uniform() {
        let d = to_difficulty(&[0.0, 0.0]);
        assert!((d[0] - 0.5).abs() < 1e-12);
        assert!((d[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn solve_balances_three_stages_over_ten_ranks() {
        let per_stage = solve(10, &[0.5, 0.3, 0.2]).expect("solvable");
        assert_eq!(per_stage, vec![5, 3, 2]);
        assert_eq!(per_stage.iter().sum::<u32>(), 10);
    }

    #[test]
    fn solve_minimises_max_stage_time() {
        let difficulty = [0.5, 0.3, 0.2];
        let per_stage = solve(10, &difficulty).expect("solvable");
        let worst = per_stage
            .iter()
            .zip(difficulty.iter())
            .map(|(&n, &d)| d / f64::from(n))
            .fold(0.0_f64, f64::max);
        // moving any single rank between stages must not improve the bound
        assert!(worst <= 0.5 / 4.0 + 1e-12, "worst stage time {worst}");
    }

    #[test]
    fn solve_floors_every_stage_at_one() {
        let per_stage = solve(3, &[0.98, 0.01, 0.01]).expect("solvable");
        assert_eq!(per_stage, vec![1, 1, 1]);
    }

    #[test]
    fn solve_rejects_too_few_ranks() {
        assert!(solve(2, &[0.5, 0.3, 0.2]).is_err());
        assert!(solve(4, &[]).is_err());
    }

    #[test]
    fn assign_buckets_ranks_in_order() {
        let a = assign(&[2, 3, 1]);
        assert_eq!(a.local_stage(0), Some(0));
        assert_eq!(a.local_stage(1), Some(0));
        assert_eq!(a.local_stage(2), Some(1));
        assert_eq!(a.local_stage(4), Some(1));
        assert_eq!(a.local_stage(5), Some(2));
        assert_eq!(a.local_stage(6), None);
        assert_eq!(a.ranks_of_stage[1], vec![2, 3, 4]);
        assert_eq!(a.stage_width(2), 1);
    }

    #[test]
    fn solve_then_assign_covers_all_ranks() {
        let per_stage = solve(7, &[0.1, 0.8, 0.1]).expect("solvable");
        let a = assign(&per_stage);
        for rank in 0..7 {
            assert!(a.local_stage(rank).is_some(), "rank {rank} unassigned");
        }
    }
}
