// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tiny tree — the three-tip placement problem for one reference branch.
//!
//! Placing a query on a branch only ever needs the conditional
//! likelihoods at the branch's two endpoints, so the kernel works on a
//! minimal sub-instance: query tip, distal endpoint, proximal endpoint,
//! joined at a virtual root on the insertion point. The sub-partition
//! *aliases* the reference's model-wide parameter block (shared `Arc`,
//! never copied, never mutated) and *deep-copies* exactly two per-node
//! payloads: the proximal CLV, and either the distal CLV or — when the
//! branch is a pendant edge — the distal tip's character array.
//!
//! # Index layout
//!
//! The engine treats positions below `tips = 3` as character arrays, so
//! the aliased reference CLVs must sit at indices `≥ 3`:
//!
//! | node     | role         | clv index            | scaler |
//! |----------|--------------|----------------------|--------|
//! | new tip  | query        | 1                    | none   |
//! | distal   | ref endpoint | 2 (tip) / 5 (inner)  | 2/none |
//! | proximal | ref endpoint | 4                    | 0      |
//! | inner    | virtual root | 3                    | 1      |
//!
//! A tiny tree is private to its thread; the aliased reference data is
//! immutable and may be shared by any number of concurrent tiny trees.

use std::sync::Arc;

use super::optimize::{self, Triplet};
use super::partition::Partition;
use super::range::{Range, get_valid_range};
use super::reference::Tree;
use super::sample::Placement;
use crate::error::{Error, Result};
use crate::io::fasta::Sequence;
use crate::options::Options;

/// Canonical pendant length of a fresh insertion.
pub const DEFAULT_PENDANT_LENGTH: f64 = 0.9;

const NEW_TIP_CLV: usize = 1;
const DISTAL_CLV_TIP: usize = 2;
const INNER_CLV: usize = 3;
const PROXIMAL_CLV: usize = 4;
const DISTAL_CLV_INNER: usize = 5;

const PROXIMAL_SCALER: usize = 0;
const INNER_SCALER: usize = 1;
const DISTAL_SCALER: usize = 2;

const PROXIMAL_MATRIX: usize = 0;
const DISTAL_MATRIX: usize = 1;
const PENDANT_MATRIX: usize = 2;

/// Three-tip compute object bound to one reference branch.
pub struct TinyTree {
    partition: Partition,
    triplet: Triplet,
    branch_id: u32,
    original_branch_length: f64,
    tip_tip: bool,
    /// Current `[proximal, distal, pendant]` lengths (canonical state).
    lengths: [f64; 3],
}

impl TinyTree {
    /// Bind a tiny tree to `branch_id` of the reference.
    ///
    /// When one endpoint of the branch is a reference tip, endpoints are
    /// swapped so the tip is always the distal node, and the distal
    /// payload is copied as a character array instead of a CLV.
    ///
    /// # Errors
    ///
    /// Propagates allocation and copy failures from the engine.
    pub fn from_branch(tree: &Tree, branch_id: u32) -> Result<Self> {
        let mut distal = tree.branch_record(branch_id);
        let mut proximal = tree.branch_back_record(branch_id);

        let mut tip_tip = false;
        if distal.next.is_none() {
            tip_tip = true;
        } else if proximal.next.is_none() {
            tip_tip = true;
            std::mem::swap(&mut distal, &mut proximal);
        }

        let original_branch_length = distal.length;
        let reference = &tree.partition;

        // one CLV-bearing pseudo-tip in the tip case, two otherwise, plus
        // the inner node
        let num_clv_tips = if tip_tip { 1 } else { 2 };
        let mut partition = Partition::create(
            3,
            1 + num_clv_tips,
            reference.sites,
            3,
            3,
            Arc::clone(&reference.params),
            reference.attributes,
        )?;

        partition.set_clv(PROXIMAL_CLV, reference.clv(proximal.clv_index)?)?;
        let distal_clv = if tip_tip {
            let chars = reference.tip_chars(distal.clv_index).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "reference tip {} has no character data",
                    distal.clv_index
                ))
            })?;
            partition.set_tip_chars(DISTAL_CLV_TIP, chars.to_vec());
            DISTAL_CLV_TIP
        } else {
            partition.set_clv(DISTAL_CLV_INNER, reference.clv(distal.clv_index)?)?;
            DISTAL_CLV_INNER
        };

        let proximal_scaler = proximal.scaler_index.map(|s| {
            partition.set_scaler(PROXIMAL_SCALER, reference.scaler(s));
            PROXIMAL_SCALER
        });
        let distal_scaler = distal.scaler_index.map(|s| {
            partition.set_scaler(DISTAL_SCALER, reference.scaler(s));
            DISTAL_SCALER
        });

        let triplet = Triplet {
            new_tip_clv: NEW_TIP_CLV,
            inner_clv: INNER_CLV,
            inner_scaler: Some(INNER_SCALER),
            distal_clv,
            distal_scaler,
            proximal_clv: PROXIMAL_CLV,
            proximal_scaler,
            matrices: [PROXIMAL_MATRIX, DISTAL_MATRIX, PENDANT_MATRIX],
        };

        let mut tiny = Self {
            partition,
            triplet,
            branch_id,
            original_branch_length,
            tip_tip,
            lengths: [0.0; 3],
        };
        tiny.reset_triplet()?;
        Ok(tiny)
    }

    /// Branch this tiny tree is bound to.
    #[must_use]
    pub const fn branch_id(&self) -> u32 {
        self.branch_id
    }

    /// Reference length of the bound branch.
    #[must_use]
    pub const fn original_branch_length(&self) -> f64 {
        self.original_branch_length
    }

    /// Whether the bound branch is a pendant (tip) edge.
    #[must_use]
    pub const fn is_tip_tip(&self) -> bool {
        self.tip_tip
    }

    /// Alignment length this tiny tree evaluates.
    #[must_use]
    pub const fn sites(&self) -> usize {
        self.partition.sites
    }

    /// Copy sharing the reference parameter block (the deep-copied CLVs,
    /// scalers and tip characters are re-duplicated).
    #[must_use]
    pub fn clone_shallow(&self) -> Self {
        Self {
            partition: self.partition.clone(),
            triplet: self.triplet,
            branch_id: self.branch_id,
            original_branch_length: self.original_branch_length,
            tip_tip: self.tip_tip,
            lengths: self.lengths,
        }
    }

    /// Fully independent copy: the parameter block itself is duplicated.
    #[must_use]
    pub fn clone_deep(&self) -> Self {
        let mut copy = self.clone_shallow();
        copy.partition.params = Arc::new((*self.partition.params).clone());
        copy
    }

    /// Back to the canonical triplet: `ℓ/2, ℓ/2` on the reference branch
    /// halves, the default pendant length, matrices recomputed, inner CLV
    /// facing the query tip.
    fn reset_triplet(&mut self) -> Result<()> {
        let half = self.original_branch_length / 2.0;
        self.lengths = [half, half, DEFAULT_PENDANT_LENGTH];
        self.partition.update_prob_matrices(
            &[PROXIMAL_MATRIX, DISTAL_MATRIX, PENDANT_MATRIX],
            &self.lengths,
        )?;
        self.update_inner();
        Ok(())
    }

    fn update_inner(&mut self) {
        let op = self.triplet.inner_operation();
        self.partition.update_partials(&[op]);
    }

    fn edge_logl(&self, per_site: Option<&mut Vec<f64>>) -> f64 {
        self.partition.edge_loglikelihood(
            NEW_TIP_CLV,
            None,
            INNER_CLV,
            Some(INNER_SCALER),
            PENDANT_MATRIX,
            per_site,
        )
    }

    /// Score one query on the bound branch.
    ///
    /// Initialises the query tip, optionally optimises the triplet branch
    /// lengths (restricted to the query's non-gap window under
    /// premasking), recomputes the inner CLV and evaluates the edge
    /// log-likelihood. The tiny tree is returned to its canonical state,
    /// so consecutive calls are independent.
    ///
    /// # Errors
    ///
    /// [`Error::InputShape`] on a length mismatch, [`Error::EmptyRange`]
    /// for an all-gap query under premasking, [`Error::BadState`] for
    /// unmappable characters, [`Error::DegenerateBranch`] when the branch
    /// yields `-inf`.
    pub fn place(
        &mut self,
        seq: &Sequence,
        opt_branches: bool,
        options: &Options,
    ) -> Result<Placement> {
        if seq.sites.len() != self.partition.sites {
            return Err(Error::InputShape {
                header: seq.header.clone(),
                got: seq.sites.len(),
                expected: self.partition.sites,
            });
        }

        let mut range = Range::new(0, self.partition.sites);
        if options.premasking {
            range = get_valid_range(&seq.sites);
            if range.is_empty() {
                return Err(Error::EmptyRange {
                    header: seq.header.clone(),
                });
            }
        }

        self.partition.set_tip_states(NEW_TIP_CLV, &seq.sites)?;

        let mut distal_length = self.lengths[1];
        let mut pendant_length = self.lengths[2];

        if opt_branches {
            let mut lengths = self.lengths;
            let triplet = self.triplet;
            let sliding = options.sliding_blo;
            if options.premasking {
                self.partition.focused(range, |p| {
                    optimize::optimize_triplet(p, &triplet, &mut lengths, sliding)
                });
            } else {
                optimize::optimize_triplet(&mut self.partition, &triplet, &mut lengths, sliding);
            }

            // rescale the insertion point back onto the reference branch
            let new_total = lengths[0] + lengths[1];
            distal_length =
                ((self.original_branch_length / new_total) * lengths[1])
                    .clamp(0.0, self.original_branch_length);
            pendant_length = lengths[2];
        }

        self.update_inner();
        let logl = self.edge_logl(None);

        if opt_branches {
            // canonical state for the next placement on this branch
            self.reset_triplet()?;
        }

        if logl == f64::NEG_INFINITY {
            return Err(Error::DegenerateBranch {
                branch_id: self.branch_id,
                detail: format!("-inf log-likelihood for query '{}'", seq.header),
            });
        }

        Placement::new(
            self.branch_id,
            logl,
            pendant_length,
            distal_length,
            self.original_branch_length,
        )
    }

    /// Per-site log-likelihoods of the homogeneous sequence `ccc…c` for
    /// alphabet symbol `symbol`, on the canonical triplet.
    ///
    /// This is the feeder of the pre-placement lookup store.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if `symbol` is not in the alphabet map.
    pub fn persite_logl(&mut self, symbol: u8) -> Result<Vec<f64>> {
        let seq: String = std::iter::repeat_n(symbol as char, self.partition.sites).collect();
        self.partition.set_tip_states(NEW_TIP_CLV, &seq)?;
        let mut per_site = Vec::new();
        self.edge_logl(Some(&mut per_site));
        Ok(per_site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phylo::model::SubstModel;
    use crate::phylo::partition::CpuFeatures;
    use crate::phylo::reference::Tree;

    fn seqs(pairs: &[(&str, &str)]) -> Vec<Sequence> {
        pairs
            .iter()
            .map(|(h, s)| Sequence {
                header: (*h).to_string(),
                sites: (*s).to_string(),
            })
            .collect()
    }

    fn reference() -> Tree {
        let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
        let alignment = seqs(&[
            ("t1", "ACGTACGTAAGG"),
            ("t2", "ACGTACTTAAGC"),
            ("t3", "ACCTACGTATGG"),
            ("t4", "GCGTACGAATGG"),
        ]);
        Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::scalar()).unwrap()
    }

    fn query(sites: &str) -> Sequence {
        Sequence {
            header: String::from("query"),
            sites: sites.to_string(),
        }
    }

    fn no_opt() -> Options {
        Options {
            opt_branches: false,
            ..Options::default()
        }
    }

    #[test]
    fn inner_branch_is_tip_inner() {
        let tree = reference();
        let tiny = TinyTree::from_branch(&tree, 0).unwrap();
        assert!(!tiny.is_tip_tip(), "branch 0 joins two inner nodes");
    }

    #[test]
    fn pendant_branch_is_tip_tip() {
        let tree = reference();
        let tiny = TinyTree::from_branch(&tree, 1).unwrap();
        assert!(tiny.is_tip_tip(), "branch 1 is the t1 pendant edge");
        assert!((tiny.original_branch_length() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn place_without_optimisation_scores_finite() {
        let tree = reference();
        for branch in 0..tree.nums().branches as u32 {
            let mut tiny = TinyTree::from_branch(&tree, branch).unwrap();
            let placement = tiny
                .place(&query("ACGTACGTAAGG"), false, &no_opt())
                .unwrap();
            assert!(placement.logl.is_finite() && placement.logl < 0.0);
            assert!((placement.pendant_length - DEFAULT_PENDANT_LENGTH).abs() < 1e-12);
            assert!(
                (placement.distal_length - tiny.original_branch_length() / 2.0).abs() < 1e-12
            );
        }
    }

    #[test]
    fn optimised_lengths_respect_invariants() {
        let tree = reference();
        let options = Options::default();
        for branch in 0..tree.nums().branches as u32 {
            let mut tiny = TinyTree::from_branch(&tree, branch).unwrap();
            let placement = tiny.place(&query("ACGTACGTAAGG"), true, &options).unwrap();
            assert!(placement.pendant_length >= 0.0);
            assert!(placement.distal_length >= 0.0);
            assert!(
                placement.distal_length <= tiny.original_branch_length(),
                "distal {} > branch {}",
                placement.distal_length,
                tiny.original_branch_length()
            );
        }
    }

    #[test]
    fn optimisation_does_not_worsen_likelihood() {
        let tree = reference();
        let mut tiny = TinyTree::from_branch(&tree, 2).unwrap();
        let plain = tiny.place(&query("ACGTACTTAAGC"), false, &no_opt()).unwrap();
        let tuned = tiny
            .place(&query("ACGTACTTAAGC"), true, &Options::default())
            .unwrap();
        assert!(
            tuned.logl >= plain.logl - 1e-9,
            "optimised {} vs plain {}",
            tuned.logl,
            plain.logl
        );
    }

    #[test]
    fn consecutive_placements_are_independent() {
        let tree = reference();
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        let options = Options::default();
        let first = tiny.place(&query("ACGTACGTAAGG"), true, &options).unwrap();
        let _other = tiny.place(&query("GCGTACGAATGG"), true, &options).unwrap();
        let again = tiny.place(&query("ACGTACGTAAGG"), true, &options).unwrap();
        assert_eq!(first.logl.to_bits(), again.logl.to_bits());
        assert_eq!(
            first.distal_length.to_bits(),
            again.distal_length.to_bits()
        );
    }

    #[test]
    fn copy_chaining_preserves_placements() {
        let tree = reference();
        let mut original = TinyTree::from_branch(&tree, 0).unwrap();
        let mut shallow = original.clone_shallow();
        let mut deep = original.clone_deep();
        let mut shallow_of_deep = deep.clone_shallow();
        let mut deep_of_shallow = shallow.clone_deep();

        let q = query("ACGTACGTAAGG");
        let options = Options::default();
        let want = original.place(&q, true, &options).unwrap();
        for copy in [
            &mut shallow,
            &mut deep,
            &mut shallow_of_deep,
            &mut deep_of_shallow,
        ] {
            let got = copy.place(&q, true, &options).unwrap();
            assert_eq!(want.logl.to_bits(), got.logl.to_bits());
            assert_eq!(want.distal_length.to_bits(), got.distal_length.to_bits());
            assert_eq!(want.pendant_length.to_bits(), got.pendant_length.to_bits());
        }
    }

    #[test]
    fn premasking_rejects_all_gap_queries() {
        let tree = reference();
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        let err = tiny
            .place(&query("------------"), false, &Options::default())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyRange { .. }));
    }

    #[test]
    fn length_mismatch_is_input_shape() {
        let tree = reference();
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        let err = tiny.place(&query("ACGT"), false, &no_opt()).unwrap_err();
        assert!(matches!(err, Error::InputShape { .. }));
    }

    #[test]
    fn persite_logl_sums_to_homogeneous_placement() {
        let tree = reference();
        let mut tiny = TinyTree::from_branch(&tree, 3).unwrap();
        let per_site = tiny.persite_logl(b'A').unwrap();
        assert_eq!(per_site.len(), 12);
        let sum: f64 = per_site.iter().sum();
        let placement = tiny
            .place(&query("AAAAAAAAAAAA"), false, &no_opt())
            .unwrap();
        assert!(
            (sum - placement.logl).abs() < 1e-10,
            "Σ per-site {sum} vs placement {}",
            placement.logl
        );
    }
}
