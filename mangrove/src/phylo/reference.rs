// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference tree: topology arena, Newick ingestion, and CLV fill.
//!
//! The tree is held twice, for two different jobs:
//!
//! - a parent/children **arena** rooted at the unrooted tree's
//!   trifurcation, used for parsing, serialisation and jplace output;
//! - a flat array of **directed records**, three per inner node and one
//!   per tip, used by the numerics. Record `r` faces the edge
//!   `(r, back(r))`; its CLV summarises the subtree on `r`'s side of that
//!   edge, so every edge has conditional likelihoods available from both
//!   directions and any branch can host a placement without retraversal.
//!
//! Branch ids, tip ids and CLV indices are assigned in preorder over the
//! compacted arena, which makes them — and therefore every downstream
//! likelihood — reproducible across checkpoint round-trips.

use std::collections::HashMap;
use std::sync::Arc;

use super::charmap::Charmap;
use super::model::SubstModel;
use super::partition::{Attributes, CpuFeatures, ModelParams, Operation, Partition};
use crate::error::{Error, Result};
use crate::io::fasta::Sequence;

/// Node of the rooted serialisation arena. The root has `parent == self`.
#[derive(Debug, Clone)]
pub struct ArenaNode {
    /// Parent index (self for the root).
    pub parent: u32,
    /// Child indices in preorder.
    pub children: Vec<u32>,
    /// Length of the edge towards the parent (0 for the root).
    pub length: f64,
    /// Tip label; empty for inner nodes.
    pub label: String,
}

/// Directed record of the numerics arena.
#[derive(Debug, Clone)]
pub struct NodeRec {
    /// Record across this record's edge.
    pub back: u32,
    /// Next record of the same inner node (cycle of three); `None` marks a
    /// tip record.
    pub next: Option<u32>,
    /// CLV (or tip character array) index in the partition.
    pub clv_index: usize,
    /// Scale buffer index; tips scale through the sentinel `None`.
    pub scaler_index: Option<usize>,
    /// Branch id of this record's edge; doubles as its pmatrix index.
    pub pmatrix_index: usize,
    /// Length of this record's edge.
    pub length: f64,
}

/// Tip, inner-node and branch counts of the reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNumbers {
    /// Number of tips.
    pub tip_nodes: usize,
    /// Number of inner nodes.
    pub inner_nodes: usize,
    /// Number of branches.
    pub branches: usize,
}

/// Reference tree bound to its partition, ready for placement.
#[derive(Debug)]
pub struct Tree {
    /// Numerics engine holding reference CLVs and per-branch pmatrices.
    pub partition: Partition,
    records: Vec<NodeRec>,
    branches: Vec<u32>,
    nums: TreeNumbers,
    arena: Vec<ArenaNode>,
    root: usize,
    tip_labels: Vec<String>,
    tip_sequences: Vec<String>,
}

impl Tree {
    /// Ingest a Newick string and a reference alignment.
    ///
    /// A rooted (binary-root) input is unrooted first. Every tip label
    /// must have a sequence in `alignment`, all of equal length.
    ///
    /// # Errors
    ///
    /// [`Error::Newick`] on malformed input or unsupported topology,
    /// [`Error::Fasta`] on label/alignment mismatches.
    pub fn from_newick(
        newick: &str,
        alignment: &[Sequence],
        model: SubstModel,
        features: CpuFeatures,
    ) -> Result<Self> {
        let (mut arena, mut root) = parse_newick(newick)?;
        (arena, root) = unroot(arena, root)?;
        let (arena, root) = compact(&arena, root);

        let by_header: HashMap<&str, &str> = alignment
            .iter()
            .map(|s| (s.header.as_str(), s.sites.as_str()))
            .collect();

        let mut tip_labels = Vec::new();
        let mut tip_sequences = Vec::new();
        for node in &arena {
            if node.children.is_empty() {
                let seq = by_header.get(node.label.as_str()).ok_or_else(|| {
                    Error::Fasta(format!("tip '{}' missing from the alignment", node.label))
                })?;
                tip_labels.push(node.label.clone());
                tip_sequences.push((*seq).to_string());
            }
        }

        Self::from_parts(model, features, arena, root, tip_labels, tip_sequences)
    }

    /// Assemble a tree from its serialisable parts. Both the Newick path
    /// and the checkpoint reload path end here, so a reloaded tree runs
    /// the exact same construction arithmetic as the original.
    ///
    /// # Errors
    ///
    /// [`Error::Newick`] for unsupported topology shapes, [`Error::Fasta`]
    /// for ragged alignments.
    pub fn from_parts(
        model: SubstModel,
        features: CpuFeatures,
        arena: Vec<ArenaNode>,
        root: usize,
        tip_labels: Vec<String>,
        tip_sequences: Vec<String>,
    ) -> Result<Self> {
        let tips = tip_labels.len();
        if tips < 3 {
            return Err(Error::Newick(format!(
                "reference tree needs at least 3 tips, found {tips}"
            )));
        }
        let sites = tip_sequences.first().map_or(0, String::len);
        if tip_sequences.iter().any(|s| s.len() != sites) {
            return Err(Error::Fasta(String::from(
                "reference alignment rows differ in length",
            )));
        }

        let arena_tips = arena.iter().filter(|n| n.children.is_empty()).count();
        if arena_tips != tips {
            return Err(Error::Newick(format!(
                "{arena_tips} arena tips but {tips} tip sequences"
            )));
        }
        // branch ids are preorder (node index − 1), which needs the root first
        if root != 0 {
            return Err(Error::Newick(String::from(
                "arena must be rooted at node 0",
            )));
        }

        // degree check: every inner node must have exactly three neighbours
        for (idx, node) in arena.iter().enumerate() {
            if node.children.is_empty() {
                continue;
            }
            let degree = node.children.len() + usize::from(idx != root);
            if degree != 3 {
                return Err(Error::Newick(format!(
                    "inner node of degree {degree}; only binary unrooted trees are supported"
                )));
            }
        }

        let inner_nodes = arena.len() - tips;
        let branch_count = arena.len() - 1;
        let nums = TreeNumbers {
            tip_nodes: tips,
            inner_nodes,
            branches: branch_count,
        };

        let (records, branches) = build_records(&arena, root, tips)?;

        let charmap = if model.states == 20 {
            Charmap::amino_acid()
        } else {
            Charmap::nucleotide()
        };
        let mut params = ModelParams::new(model, charmap, sites);
        mark_invariant_sites(&mut params, &tip_sequences);
        let params = Arc::new(params);

        let clv_records = records.iter().filter(|r| r.next.is_some()).count();
        let mut partition = Partition::create(
            tips,
            clv_records,
            sites,
            branch_count,
            clv_records,
            params,
            Attributes {
                pattern_tip: true,
                features,
            },
        )?;

        for (tip_id, seq) in tip_sequences.iter().enumerate() {
            partition.set_tip_states(tip_id, seq)?;
        }

        let lengths: Vec<f64> = branches
            .iter()
            .map(|&rep| records[rep as usize].length)
            .collect();
        let indices: Vec<usize> = (0..branch_count).collect();
        partition.update_prob_matrices(&indices, &lengths)?;

        fill_clvs(&mut partition, &records);

        Ok(Self {
            partition,
            records,
            branches,
            nums,
            arena,
            root,
            tip_labels,
            tip_sequences,
        })
    }

    /// Tree size summary.
    #[must_use]
    pub const fn nums(&self) -> TreeNumbers {
        self.nums
    }

    /// Shared model-wide parameter block.
    #[must_use]
    pub fn params(&self) -> Arc<ModelParams> {
        Arc::clone(&self.partition.params)
    }

    /// All directed records.
    #[must_use]
    pub fn records(&self) -> &[NodeRec] {
        &self.records
    }

    /// Representative record of a branch (one of its two directions).
    #[must_use]
    pub fn branch_record(&self, branch_id: u32) -> &NodeRec {
        &self.records[self.branches[branch_id as usize] as usize]
    }

    /// Record on the far side of the same branch.
    #[must_use]
    pub fn branch_back_record(&self, branch_id: u32) -> &NodeRec {
        let rep = self.branch_record(branch_id);
        &self.records[rep.back as usize]
    }

    /// Length of a branch.
    #[must_use]
    pub fn branch_length(&self, branch_id: u32) -> f64 {
        self.branch_record(branch_id).length
    }

    /// Serialisation arena and its root.
    #[must_use]
    pub fn arena(&self) -> (&[ArenaNode], usize) {
        (&self.arena, self.root)
    }

    /// Tip labels in tip-id order.
    #[must_use]
    pub fn tip_labels(&self) -> &[String] {
        &self.tip_labels
    }

    /// Tip sequences in tip-id order.
    #[must_use]
    pub fn tip_sequences(&self) -> &[String] {
        &self.tip_sequences
    }

    /// Newick string with jplace edge annotations: every branch length is
    /// followed by `{branch_id}`.
    #[must_use]
    pub fn newick_with_edge_ids(&self) -> String {
        let mut out = String::new();
        self.write_subtree(self.root, &mut out);
        out.push(';');
        out
    }

    fn write_subtree(&self, node: usize, out: &mut String) {
        let rec = &self.arena[node];
        if rec.children.is_empty() {
            out.push_str(&rec.label);
        } else {
            out.push('(');
            for (i, &child) in rec.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_subtree(child as usize, out);
            }
            out.push(')');
        }
        if node != self.root {
            // branch ids are preorder over the compact arena
            out.push_str(&format!(":{}{{{}}}", rec.length, node - 1));
        }
    }
}

/// Parse a Newick string into a rooted arena.
fn parse_newick(newick: &str) -> Result<(Vec<ArenaNode>, usize)> {
    let trimmed = newick.trim().trim_end_matches(';');
    if trimmed.is_empty() {
        return Err(Error::Newick(String::from("empty tree string")));
    }

    let mut nodes = vec![ArenaNode {
        parent: 0,
        children: Vec::new(),
        length: 0.0,
        label: String::new(),
    }];
    let root = 0usize;
    let mut stack = vec![root];

    let bytes: Vec<char> = trimmed.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            '(' => {
                let parent = *stack
                    .last()
                    .ok_or_else(|| Error::Newick(String::from("unbalanced parentheses")))?;
                let idx = nodes.len();
                nodes.push(ArenaNode {
                    parent: parent as u32,
                    children: Vec::new(),
                    length: 0.0,
                    label: String::new(),
                });
                nodes[parent].children.push(idx as u32);
                stack.push(idx);
                i += 1;
            }
            ')' => {
                let closed = stack
                    .pop()
                    .ok_or_else(|| Error::Newick(String::from("unbalanced parentheses")))?;
                if closed == root {
                    return Err(Error::Newick(String::from("closing parenthesis at root")));
                }
                i += 1;
                let (label, length, consumed) = scan_label_length(&bytes[i..]);
                nodes[closed].label = label;
                nodes[closed].length = length;
                i += consumed;
            }
            ',' => i += 1,
            _ => {
                let (label, length, consumed) = scan_label_length(&bytes[i..]);
                if consumed == 0 {
                    i += 1;
                    continue;
                }
                let parent = *stack
                    .last()
                    .ok_or_else(|| Error::Newick(String::from("tip outside any clade")))?;
                let idx = nodes.len();
                nodes.push(ArenaNode {
                    parent: parent as u32,
                    children: Vec::new(),
                    length,
                    label,
                });
                nodes[parent].children.push(idx as u32);
                i += consumed;
            }
        }
    }

    if stack != vec![root] {
        return Err(Error::Newick(String::from("unbalanced parentheses")));
    }
    // the outermost clade IS the root: hoist single-child wrappers
    let mut real_root = root;
    while nodes[real_root].children.len() == 1 {
        real_root = nodes[real_root].children[0] as usize;
        nodes[real_root].parent = real_root as u32;
    }
    Ok((nodes, real_root))
}

fn scan_label_length(chars: &[char]) -> (String, f64, usize) {
    let mut label = String::new();
    let mut length_text = String::new();
    let mut in_length = false;
    let mut consumed = 0;

    for &c in chars {
        match c {
            '(' | ')' | ',' | ';' => break,
            ':' => in_length = true,
            _ => {
                if in_length {
                    length_text.push(c);
                } else {
                    label.push(c);
                }
            }
        }
        consumed += 1;
    }
    let length = length_text.parse::<f64>().unwrap_or(0.0);
    (label, length, consumed)
}

/// Collapse a binary root: the unrooted tree has a trifurcation instead.
fn unroot(mut arena: Vec<ArenaNode>, root: usize) -> Result<(Vec<ArenaNode>, usize)> {
    if arena[root].children.len() != 2 {
        return Ok((arena, root));
    }
    let a = arena[root].children[0] as usize;
    let b = arena[root].children[1] as usize;
    let (keep, fold) = if !arena[a].children.is_empty() {
        (a, b)
    } else if !arena[b].children.is_empty() {
        (b, a)
    } else {
        return Err(Error::Newick(String::from(
            "two-taxon trees cannot be unrooted",
        )));
    };

    let merged = arena[a].length + arena[b].length;
    arena[fold].parent = keep as u32;
    arena[fold].length = merged;
    arena[keep].parent = keep as u32;
    arena[keep].length = 0.0;
    arena[keep].children.push(fold as u32);
    arena[root].children.clear(); // old root goes dead; compact() drops it
    Ok((arena, keep))
}

/// Renumber an arena in preorder from `root`, dropping unreachable nodes.
fn compact(arena: &[ArenaNode], root: usize) -> (Vec<ArenaNode>, usize) {
    let mut order = Vec::with_capacity(arena.len());
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        order.push(node);
        for &child in arena[node].children.iter().rev() {
            stack.push(child as usize);
        }
    }

    let mut remap = HashMap::new();
    for (new_idx, &old_idx) in order.iter().enumerate() {
        remap.insert(old_idx, new_idx as u32);
    }

    let nodes = order
        .iter()
        .map(|&old_idx| {
            let node = &arena[old_idx];
            ArenaNode {
                parent: remap[&(node.parent as usize)],
                children: node.children.iter().map(|c| remap[&(*c as usize)]).collect(),
                length: node.length,
                label: node.label.clone(),
            }
        })
        .collect();
    (nodes, 0)
}

/// Build the directed-record arena and the branch table from the rooted
/// arena. Branch `i` is the parent edge of arena node `i + 1` (preorder).
fn build_records(arena: &[ArenaNode], root: usize, tips: usize) -> Result<(Vec<NodeRec>, Vec<u32>)> {
    // slot of (node, neighbour) in the record array
    let mut slot: HashMap<(usize, usize), usize> = HashMap::new();
    let mut records: Vec<NodeRec> = Vec::new();
    let mut next_clv = tips;
    let mut tip_id = 0usize;

    for (idx, node) in arena.iter().enumerate() {
        let mut neighbours: Vec<usize> = Vec::new();
        if idx != root {
            neighbours.push(node.parent as usize);
        }
        neighbours.extend(node.children.iter().map(|&c| c as usize));

        if node.children.is_empty() {
            slot.insert((idx, node.parent as usize), records.len());
            records.push(NodeRec {
                back: u32::MAX,
                next: None,
                clv_index: tip_id,
                scaler_index: None,
                pmatrix_index: 0,
                length: node.length,
            });
            tip_id += 1;
            continue;
        }

        let first = records.len();
        for (k, &neighbour) in neighbours.iter().enumerate() {
            slot.insert((idx, neighbour), records.len());
            let next = first + (k + 1) % neighbours.len();
            records.push(NodeRec {
                back: u32::MAX,
                next: Some(next as u32),
                clv_index: next_clv,
                scaler_index: Some(next_clv - tips),
                pmatrix_index: 0,
                length: 0.0,
            });
            next_clv += 1;
        }
    }

    let mut branches = Vec::with_capacity(arena.len() - 1);
    for (idx, node) in arena.iter().enumerate() {
        if idx == root {
            continue;
        }
        let branch_id = idx - 1;
        let parent = node.parent as usize;
        let down = *slot
            .get(&(idx, parent))
            .ok_or_else(|| Error::Newick(String::from("record table incomplete")))?;
        let up = *slot
            .get(&(parent, idx))
            .ok_or_else(|| Error::Newick(String::from("record table incomplete")))?;
        records[down].back = up as u32;
        records[up].back = down as u32;
        records[down].pmatrix_index = branch_id;
        records[up].pmatrix_index = branch_id;
        records[down].length = node.length;
        records[up].length = node.length;
        branches.push(down as u32);
    }

    Ok((records, branches))
}

/// Mark sites where all tips share at least one compatible state.
fn mark_invariant_sites(params: &mut ModelParams, tip_sequences: &[String]) {
    let sites = params.invariant.len();
    for site in 0..sites {
        let mut mask = params.charmap.full_mask();
        for seq in tip_sequences {
            mask &= params.charmap.mask(seq.as_bytes()[site]).unwrap_or(0);
        }
        params.invariant[site] = if mask == 0 {
            -1
        } else {
            i32::try_from(mask.trailing_zeros()).unwrap_or(-1)
        };
    }
}

/// Compute every record's CLV, children before parents.
fn fill_clvs(partition: &mut Partition, records: &[NodeRec]) {
    let mut done = vec![false; records.len()];

    fn ensure(idx: usize, partition: &mut Partition, records: &[NodeRec], done: &mut [bool]) {
        if done[idx] || records[idx].next.is_none() {
            done[idx] = true;
            return;
        }
        done[idx] = true; // set first: cycles through `back` cannot recurse into us

        let rec = &records[idx];
        let next = rec.next.unwrap_or(0) as usize;
        let nextnext = records[next].next.unwrap_or(0) as usize;
        let child1 = records[next].back as usize;
        let child2 = records[nextnext].back as usize;
        ensure(child1, partition, records, done);
        ensure(child2, partition, records, done);

        let op = Operation {
            parent_clv: rec.clv_index,
            parent_scaler: rec.scaler_index,
            child1_clv: records[child1].clv_index,
            child1_scaler: records[child1].scaler_index,
            child1_matrix: records[child1].pmatrix_index,
            child2_clv: records[child2].clv_index,
            child2_scaler: records[child2].scaler_index,
            child2_matrix: records[child2].pmatrix_index,
        };
        partition.update_partials(&[op]);
    }

    for idx in 0..records.len() {
        ensure(idx, partition, records, &mut done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phylo::model::SubstModel;

    fn seqs(pairs: &[(&str, &str)]) -> Vec<Sequence> {
        pairs
            .iter()
            .map(|(h, s)| Sequence {
                header: (*h).to_string(),
                sites: (*s).to_string(),
            })
            .collect()
    }

    fn small_tree() -> Tree {
        let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
        let alignment = seqs(&[
            ("t1", "ACGTACGT"),
            ("t2", "ACGTACTT"),
            ("t3", "ACCTACGT"),
            ("t4", "GCGTACGA"),
        ]);
        Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::scalar()).unwrap()
    }

    #[test]
    fn four_tip_tree_has_five_branches() {
        let tree = small_tree();
        assert_eq!(
            tree.nums(),
            TreeNumbers {
                tip_nodes: 4,
                inner_nodes: 2,
                branches: 5
            }
        );
    }

    #[test]
    fn rooted_input_is_unrooted() {
        let newick = "((t1:0.1,t2:0.2):0.05,(t3:0.3,t4:0.25):0.07);";
        let alignment = seqs(&[
            ("t1", "ACGT"),
            ("t2", "ACTT"),
            ("t3", "ACCT"),
            ("t4", "GCGT"),
        ]);
        let tree =
            Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::scalar())
                .unwrap();
        // the root edge folds into one branch of length 0.05 + 0.07
        assert_eq!(tree.nums().branches, 5);
        let lengths: Vec<f64> = (0..5).map(|b| tree.branch_length(b)).collect();
        assert!(
            lengths.iter().any(|&l| (l - 0.12).abs() < 1e-12),
            "expected merged root branch in {lengths:?}"
        );
    }

    #[test]
    fn every_branch_links_two_records() {
        let tree = small_tree();
        for branch in 0..tree.nums().branches as u32 {
            let rec = tree.branch_record(branch);
            let back = tree.branch_back_record(branch);
            assert_eq!(rec.pmatrix_index, back.pmatrix_index);
            assert!((rec.length - back.length).abs() < 1e-300);
        }
    }

    #[test]
    fn edge_likelihood_is_orientation_invariant() {
        let tree = small_tree();
        // the total tree likelihood evaluated across any edge is the same
        let mut logls = Vec::new();
        for branch in 0..tree.nums().branches as u32 {
            let rec = tree.branch_record(branch);
            let back = tree.branch_back_record(branch);
            let logl = tree.partition.edge_loglikelihood(
                rec.clv_index,
                rec.scaler_index,
                back.clv_index,
                back.scaler_index,
                rec.pmatrix_index,
                None,
            );
            assert!(logl.is_finite() && logl < 0.0, "branch {branch}: {logl}");
            logls.push(logl);
        }
        for &logl in &logls[1..] {
            assert!(
                (logl - logls[0]).abs() < 1e-9,
                "edge likelihoods disagree: {logls:?}"
            );
        }
    }

    #[test]
    fn missing_tip_sequence_is_reported() {
        let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
        let alignment = seqs(&[("t1", "ACGT"), ("t2", "ACTT"), ("t3", "ACCT")]);
        let err =
            Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::scalar())
                .unwrap_err();
        assert!(err.to_string().contains("t4"));
    }

    #[test]
    fn malformed_newick_is_rejected() {
        let alignment = seqs(&[("t1", "ACGT")]);
        for bad in ["((t1:0.1,t2:0.2;", "", "t1:0.1)("] {
            assert!(
                Tree::from_newick(bad, &alignment, SubstModel::jc69(), CpuFeatures::scalar())
                    .is_err(),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn jplace_newick_numbers_every_branch() {
        let tree = small_tree();
        let text = tree.newick_with_edge_ids();
        for branch in 0..tree.nums().branches {
            assert!(
                text.contains(&format!("{{{branch}}}")),
                "missing {{{branch}}} in {text}"
            );
        }
        assert!(text.ends_with(';'));
    }

    #[test]
    fn invariant_sites_are_detected() {
        let tree = small_tree();
        let params = tree.params();
        // site 1 is C in all four sequences
        assert_eq!(params.invariant[1], 1);
        // site 0 mixes A and G
        assert_eq!(params.invariant[0], -1);
    }
}
