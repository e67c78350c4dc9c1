// SPDX-License-Identifier: AGPL-3.0-or-later
//! Candidate selection by likelihood weight ratio.
//!
//! The LWR of a placement is the softmax of its log-likelihood within the
//! query: `lwr_i = exp(logl_i − L*) / Σ_j exp(logl_j − L*)` with
//! `L* = max logl`. Shifting by the maximum keeps the exponentials in
//! range and makes the ratios invariant to any additive constant in log
//! space. Two pruning policies reduce each query to its candidates: a
//! per-placement support threshold and an accumulated-mass threshold.
//! Both always retain at least the best placement.

use super::sample::Sample;

/// Compute and attach LWRs for every query of the sample.
///
/// Placements with non-finite log-likelihood are dropped first; a query
/// whose placements are all non-finite ends up empty. For every non-empty
/// query the attached LWRs sum to 1 within tight tolerance.
pub fn compute_and_set_lwr(sample: &mut Sample) {
    for pquery in sample.iter_mut() {
        pquery.placements.retain(|p| p.logl.is_finite());
        if pquery.placements.is_empty() {
            continue;
        }
        let best = pquery
            .placements
            .iter()
            .map(|p| p.logl)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut total = 0.0;
        for placement in &mut pquery.placements {
            placement.lwr = (placement.logl - best).exp();
            total += placement.lwr;
        }
        for placement in &mut pquery.placements {
            placement.lwr /= total;
        }
    }
}

/// Drop placements whose LWR does not exceed `threshold`; a zero (or
/// negative) threshold disables pruning entirely.
///
/// Each query keeps at least its highest-LWR placement, even when that
/// placement is itself at or below the threshold. The surviving
/// placements stay in their current order.
pub fn discard_by_support_threshold(sample: &mut Sample, threshold: f64) {
    if threshold <= 0.0 {
        return;
    }
    for pquery in sample.iter_mut() {
        if pquery.placements.is_empty() {
            continue;
        }
        let best = pquery
            .placements
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.lwr
                    .partial_cmp(&b.lwr)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map_or(0, |(at, _)| at);
        let keep_anyway = pquery.placements[best].clone();

        pquery.placements.retain(|p| p.lwr > threshold);
        if pquery.placements.is_empty() {
            pquery.placements.push(keep_anyway);
        }
    }
}

/// Keep, per query, the shortest LWR-descending prefix whose accumulated
/// mass reaches `threshold`.
///
/// Sorts each query by descending LWR with ascending branch id breaking
/// ties, then cuts after the placement that pushes the running sum to the
/// threshold. At least one placement always survives.
pub fn discard_by_accumulated_threshold(sample: &mut Sample, threshold: f64) {
    for pquery in sample.iter_mut() {
        if pquery.placements.is_empty() {
            continue;
        }
        pquery.placements.sort_by(|a, b| {
            b.lwr
                .partial_cmp(&a.lwr)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.branch_id.cmp(&b.branch_id))
        });

        let mut accumulated = 0.0;
        let mut keep = pquery.placements.len();
        for (at, placement) in pquery.placements.iter().enumerate() {
            accumulated += placement.lwr;
            if accumulated >= threshold {
                keep = at + 1;
                break;
            }
        }
        pquery.placements.truncate(keep.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phylo::sample::Placement;

    fn sample_with_logls(logls: &[f64]) -> Sample {
        let mut sample = Sample::new();
        for (branch, &logl) in logls.iter().enumerate() {
            let placement = Placement {
                branch_id: branch as u32,
                logl,
                pendant_length: 0.1,
                distal_length: 0.05,
                lwr: 0.0,
            };
            sample.add_placement(0, "q0", placement);
        }
        sample
    }

    fn sample_with_lwrs(rows: &[&[f64]]) -> Sample {
        let mut sample = Sample::new();
        for (query, lwrs) in rows.iter().enumerate() {
            for (branch, &lwr) in lwrs.iter().enumerate() {
                let placement = Placement {
                    branch_id: branch as u32,
                    logl: -10.0,
                    pendant_length: 0.9,
                    distal_length: 0.9,
                    lwr,
                };
                sample.add_placement(query as u32, &format!("q{query}"), placement);
            }
        }
        sample
    }

    fn counts(sample: &Sample) -> Vec<usize> {
        sample.iter().map(|p| p.placements.len()).collect()
    }

    #[test]
    fn lwr_matches_softmax_identity() {
        let mut sample = sample_with_logls(&[-10.0, -11.0, -12.0]);
        compute_and_set_lwr(&mut sample);
        let pquery = sample.pquery(0).unwrap();
        let expected = [0.6652, 0.2447, 0.0900];
        for (placement, &want) in pquery.placements.iter().zip(&expected) {
            assert!(
                (placement.lwr - want).abs() < 5e-4,
                "lwr {} vs {want}",
                placement.lwr
            );
        }
        let sum: f64 = pquery.placements.iter().map(|p| p.lwr).sum();
        assert!((sum - 1.0).abs() <= 1e-12, "Σlwr = {sum}");
    }

    #[test]
    fn lwr_is_shift_invariant() {
        let mut near = sample_with_logls(&[-10.0, -11.0, -12.0]);
        let mut far = sample_with_logls(&[-100_010.0, -100_011.0, -100_012.0]);
        compute_and_set_lwr(&mut near);
        compute_and_set_lwr(&mut far);
        let near_q = near.pquery(0).unwrap();
        let far_q = far.pquery(0).unwrap();
        for (a, b) in near_q.placements.iter().zip(&far_q.placements) {
            assert!((a.lwr - b.lwr).abs() < 1e-12);
        }
    }

    #[test]
    fn non_finite_placements_are_dropped() {
        let mut sample = sample_with_logls(&[-10.0, f64::NEG_INFINITY, f64::NAN]);
        compute_and_set_lwr(&mut sample);
        let pquery = sample.pquery(0).unwrap();
        assert_eq!(pquery.placements.len(), 1);
        assert!((pquery.placements[0].lwr - 1.0).abs() <= 1e-12);
    }

    #[test]
    fn all_non_finite_leaves_query_empty() {
        let mut sample = sample_with_logls(&[f64::NEG_INFINITY, f64::INFINITY]);
        compute_and_set_lwr(&mut sample);
        assert!(sample.pquery(0).unwrap().placements.is_empty());
    }

    #[test]
    fn accumulated_threshold_retains_expected_counts() {
        let mut sample = sample_with_lwrs(&[
            &[0.001, 0.23, 0.05, 0.02, 0.4, 0.009, 0.2, 0.09],
            &[0.01, 0.02, 0.005, 0.002, 0.94, 0.003, 0.02],
            &[1.0],
        ]);
        discard_by_accumulated_threshold(&mut sample, 0.95);
        assert_eq!(counts(&sample), vec![5, 2, 1]);
    }

    #[test]
    fn accumulated_threshold_is_monotone() {
        let rows: &[&[f64]] = &[&[0.001, 0.23, 0.05, 0.02, 0.4, 0.009, 0.2, 0.09]];
        let mut loose = sample_with_lwrs(rows);
        let mut tight = sample_with_lwrs(rows);
        discard_by_accumulated_threshold(&mut loose, 0.6);
        discard_by_accumulated_threshold(&mut tight, 0.95);
        let loose_ids: Vec<u32> = loose.pquery(0).unwrap().placements.iter().map(|p| p.branch_id).collect();
        let tight_ids: Vec<u32> = tight.pquery(0).unwrap().placements.iter().map(|p| p.branch_id).collect();
        assert!(loose_ids.len() <= tight_ids.len());
        for id in &loose_ids {
            assert!(tight_ids.contains(id), "θ'≥θ must keep a superset");
        }
    }

    #[test]
    fn accumulated_orders_by_lwr_with_branch_tiebreak() {
        let mut sample = sample_with_lwrs(&[&[0.02, 0.9, 0.02, 0.06]]);
        discard_by_accumulated_threshold(&mut sample, 1.0);
        let ids: Vec<u32> = sample.pquery(0).unwrap().placements.iter().map(|p| p.branch_id).collect();
        assert_eq!(ids, vec![1, 3, 0, 2]);
    }

    #[test]
    fn support_threshold_retains_expected_counts() {
        let mut sample = sample_with_lwrs(&[
            &[0.001, 0.23, 0.05, 0.02, 0.4, 0.009, 0.2, 0.09],
            &[0.01, 0.02, 0.005, 0.002, 0.94, 0.003, 0.02],
            &[1.0],
        ]);
        discard_by_support_threshold(&mut sample, 0.01);
        assert_eq!(counts(&sample), vec![6, 3, 1]);
    }

    #[test]
    fn support_threshold_zero_is_noop() {
        let rows: &[&[f64]] = &[&[0.5, 0.3, 0.2]];
        let mut sample = sample_with_lwrs(rows);
        discard_by_support_threshold(&mut sample, 0.0);
        assert_eq!(counts(&sample), vec![3]);
    }

    #[test]
    fn support_threshold_above_one_keeps_single_best() {
        let mut sample = sample_with_lwrs(&[&[0.5, 0.3, 0.2], &[0.1, 0.9]]);
        discard_by_support_threshold(&mut sample, 1.0 + 1e-9);
        assert_eq!(counts(&sample), vec![1, 1]);
        assert_eq!(sample.pquery(0).unwrap().placements[0].branch_id, 0);
        assert_eq!(sample.pquery(1).unwrap().placements[0].branch_id, 1);
    }

    #[test]
    fn empty_query_is_untouched_by_pruning() {
        let mut sample = sample_with_logls(&[f64::NEG_INFINITY]);
        compute_and_set_lwr(&mut sample);
        discard_by_support_threshold(&mut sample, 0.5);
        discard_by_accumulated_threshold(&mut sample, 0.5);
        assert!(sample.pquery(0).unwrap().placements.is_empty());
    }
}
