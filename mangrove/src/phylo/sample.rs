// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-query placement records.
//!
//! A [`Placement`] is one scored insertion of one query on one branch; a
//! [`PQuery`] is the per-query list of them; a [`Sample`] maps query ids
//! to their `PQuery`s while preserving first-insertion order, so output
//! follows input order no matter how work was fanned out.

use crate::error::{Error, Result};

/// One scored placement of a query on a reference branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    /// Branch the query was inserted on.
    pub branch_id: u32,
    /// Log-likelihood of the placement.
    pub logl: f64,
    /// Length of the new branch holding the query.
    pub pendant_length: f64,
    /// Distance of the insertion point from the branch's distal end.
    pub distal_length: f64,
    /// Likelihood weight ratio within the query, attached by the
    /// candidate selector; 0 until then.
    pub lwr: f64,
}

impl Placement {
    /// Validated construction.
    ///
    /// # Errors
    ///
    /// [`Error::DegenerateBranch`] when the log-likelihood is not finite,
    /// the pendant length is negative, or the distal length falls outside
    /// `[0, original_branch_length]`.
    pub fn new(
        branch_id: u32,
        logl: f64,
        pendant_length: f64,
        distal_length: f64,
        original_branch_length: f64,
    ) -> Result<Self> {
        if !logl.is_finite() {
            return Err(Error::DegenerateBranch {
                branch_id,
                detail: format!("non-finite log-likelihood {logl}"),
            });
        }
        if pendant_length < 0.0 {
            return Err(Error::DegenerateBranch {
                branch_id,
                detail: format!("negative pendant length {pendant_length}"),
            });
        }
        if !(0.0..=original_branch_length).contains(&distal_length) {
            return Err(Error::DegenerateBranch {
                branch_id,
                detail: format!(
                    "distal length {distal_length} outside [0, {original_branch_length}]"
                ),
            });
        }
        Ok(Self {
            branch_id,
            logl,
            pendant_length,
            distal_length,
            lwr: 0.0,
        })
    }
}

/// All placements of one query.
#[derive(Debug, Clone, Default)]
pub struct PQuery {
    /// Query id (position in the query stream).
    pub query_id: u32,
    /// Query header from the input.
    pub header: String,
    /// Placements in insertion order, until the selector reorders them.
    pub placements: Vec<Placement>,
}

impl PQuery {
    /// Highest log-likelihood among the placements.
    #[must_use]
    pub fn best_logl(&self) -> Option<f64> {
        self.placements
            .iter()
            .map(|p| p.logl)
            .fold(None, |best, logl| {
                Some(best.map_or(logl, |b: f64| b.max(logl)))
            })
    }
}

/// Query-id-keyed collection of `PQuery`s, iterating in first-insertion
/// order.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    index: std::collections::HashMap<u32, usize>,
    pqueries: Vec<PQuery>,
}

impl Sample {
    /// Empty sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a placement to the query's record, creating the record on
    /// first sight. The header is only stored on creation.
    pub fn add_placement(&mut self, query_id: u32, header: &str, placement: Placement) {
        let at = *self.index.entry(query_id).or_insert_with(|| {
            self.pqueries.push(PQuery {
                query_id,
                header: header.to_string(),
                placements: Vec::new(),
            });
            self.pqueries.len() - 1
        });
        self.pqueries[at].placements.push(placement);
    }

    /// Number of queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pqueries.len()
    }

    /// Whether no query has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pqueries.is_empty()
    }

    /// Queries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PQuery> {
        self.pqueries.iter()
    }

    /// Mutable access in first-insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PQuery> {
        self.pqueries.iter_mut()
    }

    /// Record of one query, if present.
    #[must_use]
    pub fn pquery(&self, query_id: u32) -> Option<&PQuery> {
        self.index.get(&query_id).map(|&at| &self.pqueries[at])
    }

    /// Fold another sample into this one. Merging is keyed by query id,
    /// so the result is independent of which rank contributed first.
    pub fn merge(&mut self, other: Self) {
        for pquery in other.pqueries {
            for placement in pquery.placements {
                self.add_placement(pquery.query_id, &pquery.header, placement);
            }
        }
    }

    /// Reorder iteration to ascending query id. Merged samples arrive in
    /// worker-completion order; ids restore the input-stream order.
    pub fn sort_by_query_id(&mut self) {
        self.pqueries.sort_by_key(|p| p.query_id);
        for (at, pquery) in self.pqueries.iter().enumerate() {
            self.index.insert(pquery.query_id, at);
        }
    }
}

impl IntoIterator for Sample {
    type Item = PQuery;
    type IntoIter = std::vec::IntoIter<PQuery>;

    fn into_iter(self) -> Self::IntoIter {
        self.pqueries.into_iter()
    }
}
