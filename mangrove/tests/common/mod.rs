// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixture: an 8-tip reference (13 branches, 6 inner nodes) over a
//! 705-site alignment, generated deterministically by evolving a root
//! sequence down the tree with per-branch mutation pressure.
#![allow(dead_code)] // each test binary uses a different slice of this

use tidegraft_mangrove::io::fasta::Sequence;
use tidegraft_mangrove::phylo::model::SubstModel;
use tidegraft_mangrove::phylo::partition::CpuFeatures;
use tidegraft_mangrove::phylo::reference::Tree;

pub const SITES: usize = 705;

pub const NEWICK: &str = "((t1:0.11,t2:0.19):0.15,(t3:0.13,t4:0.21):0.17,\
                          ((t5:0.09,t6:0.12):0.14,(t7:0.23,t8:0.08):0.16):0.19);";

/// Deterministic 64-bit LCG, good enough for fixture data.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    pub fn unit(&mut self) -> f64 {
        f64::from(self.next_u32()) / f64::from(u32::MAX)
    }
}

const BASES: [u8; 4] = *b"ACGT";

fn evolve(parent: &[u8], branch_length: f64, rng: &mut Lcg) -> Vec<u8> {
    parent
        .iter()
        .map(|&base| {
            if rng.unit() < branch_length {
                let mut substitute = BASES[(rng.next_u32() % 4) as usize];
                while substitute == base {
                    substitute = BASES[(rng.next_u32() % 4) as usize];
                }
                substitute
            } else {
                base
            }
        })
        .collect()
}

/// Tip sequences in `t1..t8` order, evolved down the fixture topology.
pub fn tip_alignment() -> Vec<Sequence> {
    let mut rng = Lcg::new(0x5eed_cafe);
    let root: Vec<u8> = (0..SITES)
        .map(|_| BASES[(rng.next_u32() % 4) as usize])
        .collect();

    // mirror the NEWICK topology, inner lengths included in the path
    let ab = evolve(&root, 0.15, &mut rng);
    let cd = evolve(&root, 0.17, &mut rng);
    let efgh = evolve(&root, 0.19, &mut rng);
    let ef = evolve(&efgh, 0.14, &mut rng);
    let gh = evolve(&efgh, 0.16, &mut rng);

    let tips = [
        ("t1", evolve(&ab, 0.11, &mut rng)),
        ("t2", evolve(&ab, 0.19, &mut rng)),
        ("t3", evolve(&cd, 0.13, &mut rng)),
        ("t4", evolve(&cd, 0.21, &mut rng)),
        ("t5", evolve(&ef, 0.09, &mut rng)),
        ("t6", evolve(&ef, 0.12, &mut rng)),
        ("t7", evolve(&gh, 0.23, &mut rng)),
        ("t8", evolve(&gh, 0.08, &mut rng)),
    ];

    tips.into_iter()
        .map(|(header, sites)| Sequence {
            header: header.to_string(),
            sites: String::from_utf8(sites).expect("ASCII bases"),
        })
        .collect()
}

/// The assembled 8-tip reference tree.
pub fn reference_tree() -> Tree {
    Tree::from_newick(
        NEWICK,
        &tip_alignment(),
        SubstModel::jc69(),
        CpuFeatures::scalar(),
    )
    .expect("fixture tree")
}

/// Branch id of a tip's pendant edge, by label.
pub fn pendant_branch_of(tree: &Tree, label: &str) -> u32 {
    let (arena, _root) = tree.arena();
    for (idx, node) in arena.iter().enumerate() {
        if node.label == label {
            return (idx - 1) as u32;
        }
    }
    panic!("no tip labelled {label}");
}
