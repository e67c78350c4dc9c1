// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary checkpoint of the reference tree and model.
//!
//! The checkpoint stores primitive inputs, not derived state: model
//! parameters, the serialisation arena, and the tip alignment, all
//! little-endian with length-prefixed strings. Reloading feeds them
//! through [`Tree::from_parts`] — the exact constructor the original tree
//! used — so eigen systems, probability matrices and CLVs are recomputed
//! by the same arithmetic and every placement is bit-for-bit identical
//! after a round trip.
//!
//! # Layout
//!
//! ```text
//! magic "TGRF" | version u32
//! model:  states u32, rates [f64], freqs [f64], cat_rates [f64],
//!         cat_weights [f64], prop_invar f64, alpha f64
//! arena:  node_count u32, root u32,
//!         per node: parent u32, length f64, label str
//! tips:   tip_count u32, per tip: label str, sequence str
//! ```
//!
//! Vectors are `u32` count followed by payloads; strings are `u32` byte
//! length followed by UTF-8 bytes.

use std::path::Path;

use crate::error::{Error, Result};
use crate::phylo::model::SubstModel;
use crate::phylo::partition::CpuFeatures;
use crate::phylo::reference::{ArenaNode, Tree};

const MAGIC: &[u8; 4] = b"TGRF";
const VERSION: u32 = 1;

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f64_vec(out: &mut Vec<u8>, values: &[f64]) {
    put_u32(out, values.len() as u32);
    for &value in values {
        put_f64(out, value);
    }
}

fn put_str(out: &mut Vec<u8>, text: &str) {
    put_u32(out, text.len() as u32);
    out.extend_from_slice(text.as_bytes());
}

/// Serialise a reference tree to checkpoint bytes.
#[must_use]
pub fn dump(tree: &Tree) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    put_u32(&mut out, VERSION);

    let params = tree.params();
    let model = &params.model;
    put_u32(&mut out, model.states as u32);
    put_f64_vec(&mut out, &model.subst_rates);
    put_f64_vec(&mut out, &model.frequencies);
    put_f64_vec(&mut out, &model.category_rates);
    put_f64_vec(&mut out, &model.category_weights);
    put_f64(&mut out, model.prop_invar);
    put_f64(&mut out, model.alpha);

    let (arena, root) = tree.arena();
    put_u32(&mut out, arena.len() as u32);
    put_u32(&mut out, root as u32);
    for node in arena {
        put_u32(&mut out, node.parent);
        put_f64(&mut out, node.length);
        put_str(&mut out, &node.label);
    }

    put_u32(&mut out, tree.tip_labels().len() as u32);
    for (label, sequence) in tree.tip_labels().iter().zip(tree.tip_sequences()) {
        put_str(&mut out, label);
        put_str(&mut out, sequence);
    }

    out
}

/// Write a checkpoint file.
///
/// # Errors
///
/// [`Error::Io`] on write failure.
pub fn save(tree: &Tree, path: &Path) -> Result<()> {
    std::fs::write(path, dump(tree)).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(len).filter(|&e| e <= self.bytes.len());
        let end = end.ok_or_else(|| {
            Error::CheckpointMismatch(format!("truncated at byte {}", self.at))
        })?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f64(&mut self) -> Result<f64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| {
            Error::CheckpointMismatch(String::from("truncated f64"))
        })?;
        Ok(f64::from_le_bytes(bytes))
    }

    fn f64_vec(&mut self) -> Result<Vec<f64>> {
        let count = self.u32()? as usize;
        if count > self.bytes.len() {
            return Err(Error::CheckpointMismatch(format!(
                "implausible vector length {count}"
            )));
        }
        (0..count).map(|_| self.f64()).collect()
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::CheckpointMismatch(String::from("non-UTF-8 string")))
    }
}

/// Rebuild a reference tree from checkpoint bytes.
///
/// # Errors
///
/// [`Error::CheckpointMismatch`] on a bad magic, unsupported version,
/// truncation, or a structure that disagrees with itself.
pub fn restore(bytes: &[u8], features: CpuFeatures) -> Result<Tree> {
    let mut cursor = Cursor { bytes, at: 0 };

    let magic = cursor.take(4)?;
    if magic != MAGIC {
        return Err(Error::CheckpointMismatch(String::from(
            "not a tideGraft checkpoint (bad magic)",
        )));
    }
    let version = cursor.u32()?;
    if version != VERSION {
        return Err(Error::CheckpointMismatch(format!(
            "unsupported checkpoint version {version}"
        )));
    }

    let states = cursor.u32()? as usize;
    let subst_rates = cursor.f64_vec()?;
    let frequencies = cursor.f64_vec()?;
    let category_rates = cursor.f64_vec()?;
    let category_weights = cursor.f64_vec()?;
    let prop_invar = cursor.f64()?;
    let alpha = cursor.f64()?;
    if frequencies.len() != states {
        return Err(Error::CheckpointMismatch(format!(
            "{} frequencies for {} states",
            frequencies.len(),
            states
        )));
    }
    let model = SubstModel::gtr(
        subst_rates,
        frequencies,
        category_rates,
        category_weights,
        prop_invar,
        alpha,
    )
    .map_err(|e| Error::CheckpointMismatch(format!("model: {e}")))?;

    let node_count = cursor.u32()? as usize;
    let root = cursor.u32()? as usize;
    if root >= node_count {
        return Err(Error::CheckpointMismatch(format!(
            "root {root} outside arena of {node_count}"
        )));
    }
    let mut arena = Vec::with_capacity(node_count);
    for idx in 0..node_count {
        let parent = cursor.u32()?;
        if parent as usize >= node_count {
            return Err(Error::CheckpointMismatch(format!(
                "node {idx} points at parent {parent} outside the arena"
            )));
        }
        let length = cursor.f64()?;
        let label = cursor.string()?;
        arena.push(ArenaNode {
            parent,
            children: Vec::new(),
            length,
            label,
        });
    }
    for idx in 0..node_count {
        let parent = arena[idx].parent as usize;
        if parent != idx {
            arena[parent].children.push(idx as u32);
        }
    }

    let tip_count = cursor.u32()? as usize;
    let mut tip_labels = Vec::with_capacity(tip_count);
    let mut tip_sequences = Vec::with_capacity(tip_count);
    for _ in 0..tip_count {
        tip_labels.push(cursor.string()?);
        tip_sequences.push(cursor.string()?);
    }

    let arena_tips: Vec<&str> = arena
        .iter()
        .filter(|n| n.children.is_empty())
        .map(|n| n.label.as_str())
        .collect();
    if arena_tips.len() != tip_count
        || arena_tips
            .iter()
            .zip(&tip_labels)
            .any(|(a, b)| *a != b.as_str())
    {
        return Err(Error::CheckpointMismatch(String::from(
            "arena tips and stored tip table disagree",
        )));
    }

    Tree::from_parts(model, features, arena, root, tip_labels, tip_sequences)
        .map_err(|e| Error::CheckpointMismatch(format!("reassembly: {e}")))
}

/// Read a checkpoint file.
///
/// # Errors
///
/// [`Error::Io`] on read failure, plus everything [`restore`] reports.
pub fn load(path: &Path, features: CpuFeatures) -> Result<Tree> {
    let bytes = std::fs::read(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    restore(&bytes, features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fasta::Sequence;

    fn reference() -> Tree {
        let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
        let alignment: Vec<Sequence> = [
            ("t1", "ACGTACGT"),
            ("t2", "ACGTACTT"),
            ("t3", "ACCTACGT"),
            ("t4", "GCGTACGA"),
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
    fn roundtrip_preserves_structure() {
        let tree = reference();
        let restored = restore(&dump(&tree), CpuFeatures::scalar()).unwrap();
        assert_eq!(tree.nums(), restored.nums());
        assert_eq!(tree.tip_labels(), restored.tip_labels());
        for branch in 0..tree.nums().branches as u32 {
            assert_eq!(
                tree.branch_length(branch).to_bits(),
                restored.branch_length(branch).to_bits()
            );
        }
    }

    #[test]
    fn roundtrip_preserves_clvs_bit_for_bit() {
        let tree = reference();
        let restored = restore(&dump(&tree), CpuFeatures::scalar()).unwrap();
        for rec in tree.records() {
            if rec.next.is_none() {
                continue;
            }
            let original = tree.partition.clv(rec.clv_index).unwrap();
            let reloaded = restored.partition.clv(rec.clv_index).unwrap();
            for (a, b) in original.iter().zip(reloaded) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn bad_magic_is_mismatch() {
        let mut bytes = dump(&reference());
        bytes[0] = b'X';
        assert!(matches!(
            restore(&bytes, CpuFeatures::scalar()),
            Err(Error::CheckpointMismatch(_))
        ));
    }

    #[test]
    fn truncation_is_mismatch() {
        let bytes = dump(&reference());
        for cut in [3, 10, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(
                    restore(&bytes[..cut], CpuFeatures::scalar()),
                    Err(Error::CheckpointMismatch(_))
                ),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reference.tgrf");
        let tree = reference();
        save(&tree, &path).unwrap();
        let restored = load(&path, CpuFeatures::scalar()).unwrap();
        assert_eq!(tree.nums(), restored.nums());
    }
}
