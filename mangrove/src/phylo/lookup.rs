// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-placement lookup store.
//!
//! The non-optimising placement log-likelihood decomposes per site, and a
//! site's contribution depends only on the query's character there. So
//! per branch, one per-site log-likelihood vector per character class —
//! built by scoring homogeneous sequences `ccc…c` on the branch's tiny
//! tree — turns approximate scoring of any query into a table walk:
//! `logl(q) = Σ_site table[class(q[site])][site]`.
//!
//! Tables are built lazily, one-shot, under a per-branch mutex: whichever
//! worker first needs a branch populates it while others wait, and the
//! table is never written again.

use std::sync::{Arc, Mutex};

use super::partition::ModelParams;
use super::tiny::TinyTree;
use crate::error::{Error, Result};

struct BranchTable {
    /// Class-major per-site log-likelihoods: `logls[code * sites + site]`.
    logls: Vec<f64>,
}

/// Per-branch tables of per-site log-likelihoods by character class.
pub struct LookupStore {
    tables: Vec<Mutex<Option<BranchTable>>>,
    params: Arc<ModelParams>,
    sites: usize,
}

impl LookupStore {
    /// Empty store for `branches` branches.
    #[must_use]
    pub fn new(branches: usize, params: Arc<ModelParams>, sites: usize) -> Self {
        Self {
            tables: (0..branches).map(|_| Mutex::new(None)).collect(),
            params,
            sites,
        }
    }

    /// Number of branches covered.
    #[must_use]
    pub fn branches(&self) -> usize {
        self.tables.len()
    }

    /// Whether a branch's table has been populated.
    #[must_use]
    pub fn is_built(&self, branch_id: u32) -> bool {
        self.tables[branch_id as usize]
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Populate the branch's table if nobody has yet. `tiny` must be
    /// bound to the same branch; it is used to score the homogeneous
    /// probe sequences and is left in its canonical state.
    ///
    /// # Errors
    ///
    /// Propagates kernel failures; [`Error::InvalidInput`] when `tiny` is
    /// bound to a different branch.
    pub fn ensure(&self, tiny: &mut TinyTree) -> Result<()> {
        let branch_id = tiny.branch_id() as usize;
        if branch_id >= self.tables.len() {
            return Err(Error::InvalidInput(format!(
                "branch {branch_id} outside lookup store of {}",
                self.tables.len()
            )));
        }
        let mut guard = self.tables[branch_id]
            .lock()
            .map_err(|_| Error::InvalidInput(String::from("poisoned lookup mutex")))?;
        if guard.is_some() {
            return Ok(());
        }

        let map = &self.params.charmap;
        let mut logls = vec![0.0; map.map_size() * self.sites];
        for code in map.occupied_codes() {
            let per_site = tiny.persite_logl(map.symbol(code))?;
            logls[code * self.sites..code * self.sites + self.sites].copy_from_slice(&per_site);
        }
        *guard = Some(BranchTable { logls });
        Ok(())
    }

    /// Approximate placement log-likelihood of `sequence` on a branch by
    /// summing table entries.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the branch table has not been built
    /// or the length is off; [`Error::BadState`] for unmappable
    /// characters.
    pub fn prescore(&self, branch_id: u32, sequence: &str) -> Result<f64> {
        if sequence.len() != self.sites {
            return Err(Error::InvalidInput(format!(
                "query of {} sites against lookup of {}",
                sequence.len(),
                self.sites
            )));
        }
        let guard = self.tables[branch_id as usize]
            .lock()
            .map_err(|_| Error::InvalidInput(String::from("poisoned lookup mutex")))?;
        let table = guard.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("lookup table for branch {branch_id} not built"))
        })?;

        let map = &self.params.charmap;
        let mut total = 0.0;
        for (site, &c) in sequence.as_bytes().iter().enumerate() {
            let code = map.code(c).ok_or(Error::BadState {
                character: c as char,
                site,
            })?;
            total += table.logls[code * self.sites + site];
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fasta::Sequence;
    use crate::options::Options;
    use crate::phylo::model::SubstModel;
    use crate::phylo::partition::CpuFeatures;
    use crate::phylo::reference::Tree;

    fn reference() -> Tree {
        let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
        let alignment: Vec<Sequence> = [
            ("t1", "ACGTACGTAAGG"),
            ("t2", "ACGTACTTAAGC"),
            ("t3", "ACCTACGTATGG"),
            ("t4", "GCGTACGAATGG"),
        ]
        .iter()
        .map(|(h, s)| Sequence {
            header: (*h).to_string(),
            sites: (*s).to_string(),
        })
        .collect();
        Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::scalar()).unwrap()
    }

    #[test]
    fn prescore_matches_exact_unoptimised_placement() {
        let tree = reference();
        let store = LookupStore::new(tree.nums().branches, tree.params(), 12);
        let options = Options {
            premasking: false,
            opt_branches: false,
            ..Options::default()
        };
        let query = Sequence {
            header: String::from("q"),
            sites: String::from("ACGTACGTATGC"),
        };
        for branch in 0..tree.nums().branches as u32 {
            let mut tiny = TinyTree::from_branch(&tree, branch).unwrap();
            store.ensure(&mut tiny).unwrap();
            let approx = store.prescore(branch, &query.sites).unwrap();
            let exact = tiny.place(&query, false, &options).unwrap().logl;
            assert!(
                (approx - exact).abs() < 1e-9,
                "branch {branch}: lookup {approx} vs exact {exact}"
            );
        }
    }

    #[test]
    fn ensure_is_one_shot() {
        let tree = reference();
        let store = LookupStore::new(tree.nums().branches, tree.params(), 12);
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        assert!(!store.is_built(0));
        store.ensure(&mut tiny).unwrap();
        assert!(store.is_built(0));
        // second call is a no-op, not a rebuild
        store.ensure(&mut tiny).unwrap();
        assert!(store.is_built(0));
    }

    #[test]
    fn prescore_requires_built_table() {
        let tree = reference();
        let store = LookupStore::new(tree.nums().branches, tree.params(), 12);
        assert!(store.prescore(0, "ACGTACGTATGC").is_err());
    }

    #[test]
    fn ambiguity_characters_are_scored() {
        let tree = reference();
        let store = LookupStore::new(tree.nums().branches, tree.params(), 12);
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        store.ensure(&mut tiny).unwrap();
        let score = store.prescore(0, "ACGTNNRY-WGG").unwrap();
        assert!(score.is_finite());
    }

    #[test]
    fn unmappable_character_is_bad_state() {
        let tree = reference();
        let store = LookupStore::new(tree.nums().branches, tree.params(), 12);
        let mut tiny = TinyTree::from_branch(&tree, 0).unwrap();
        store.ensure(&mut tiny).unwrap();
        assert!(matches!(
            store.prescore(0, "ACGT!CGTATGC"),
            Err(Error::BadState { .. })
        ));
    }
}
