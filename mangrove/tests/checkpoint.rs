// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint round trip on the 8-tip / 705-site fixture: every placement
//! computed on a reloaded tree is bit-for-bit the placement computed on
//! the original, across all branches and option profiles.

mod common;

use tidegraft_mangrove::io::checkpoint;
use tidegraft_mangrove::options::Options;
use tidegraft_mangrove::phylo::partition::CpuFeatures;
use tidegraft_mangrove::phylo::tiny::TinyTree;

use common::{reference_tree, tip_alignment};

#[test]
fn reload_reproduces_every_unoptimised_placement() {
    let original = reference_tree();
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("reference.tgrf");
    checkpoint::save(&original, &path).expect("save");
    let reloaded = checkpoint::load(&path, CpuFeatures::scalar()).expect("load");

    assert_eq!(original.nums(), reloaded.nums());

    let options = Options {
        opt_branches: false,
        ..Options::default()
    };
    for query in &tip_alignment() {
        for branch in 0..original.nums().branches as u32 {
            let mut tiny_a = TinyTree::from_branch(&original, branch).expect("tiny");
            let mut tiny_b = TinyTree::from_branch(&reloaded, branch).expect("tiny");
            let a = tiny_a.place(query, false, &options).expect("place");
            let b = tiny_b.place(query, false, &options).expect("place");
            assert_eq!(
                a.logl.to_bits(),
                b.logl.to_bits(),
                "branch {branch}, query {}",
                query.header
            );
            assert_eq!(a.distal_length.to_bits(), b.distal_length.to_bits());
            assert_eq!(a.pendant_length.to_bits(), b.pendant_length.to_bits());
        }
    }
}

#[test]
fn reload_reproduces_optimised_placements() {
    let original = reference_tree();
    let reloaded =
        checkpoint::restore(&checkpoint::dump(&original), CpuFeatures::scalar()).expect("restore");

    let options = Options::default();
    let alignment = tip_alignment();
    for query in [&alignment[1], &alignment[6]] {
        for branch in 0..original.nums().branches as u32 {
            let mut tiny_a = TinyTree::from_branch(&original, branch).expect("tiny");
            let mut tiny_b = TinyTree::from_branch(&reloaded, branch).expect("tiny");
            let a = tiny_a.place(query, true, &options).expect("place");
            let b = tiny_b.place(query, true, &options).expect("place");
            assert_eq!(
                a.logl.to_bits(),
                b.logl.to_bits(),
                "branch {branch}, query {} (optimised)",
                query.header
            );
            assert_eq!(a.distal_length.to_bits(), b.distal_length.to_bits());
            assert_eq!(a.pendant_length.to_bits(), b.pendant_length.to_bits());
        }
    }
}

#[test]
fn reload_rejects_foreign_bytes() {
    let bytes = vec![0u8; 64];
    assert!(checkpoint::restore(&bytes, CpuFeatures::scalar()).is_err());
}
