// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validate the placement core against its documented fixtures: gap
//! windows, LWR identities, both pruning policies, byte formatting, the
//! stage scheduler, and a small end-to-end placement.

use tidegraft_flotilla::schedule;
use tidegraft_mangrove::io::fasta::Sequence;
use tidegraft_mangrove::memory::{format_byte_num, memstring_to_byte};
use tidegraft_mangrove::options::Options;
use tidegraft_mangrove::phylo::lwr;
use tidegraft_mangrove::phylo::model::SubstModel;
use tidegraft_mangrove::phylo::partition::CpuFeatures;
use tidegraft_mangrove::phylo::range::get_valid_range;
use tidegraft_mangrove::phylo::reference::Tree;
use tidegraft_mangrove::phylo::sample::{Placement, Sample};
use tidegraft_mangrove::phylo::tiny::TinyTree;
use tidegraft_mangrove::validation::Validator;

fn lwr_sample(rows: &[&[f64]]) -> Sample {
    let mut sample = Sample::new();
    for (query, lwrs) in rows.iter().enumerate() {
        for (branch, &weight) in lwrs.iter().enumerate() {
            let placement = Placement {
                branch_id: branch as u32,
                logl: -10.0,
                pendant_length: 0.9,
                distal_length: 0.9,
                lwr: weight,
            };
            sample.add_placement(query as u32, &format!("q{query}"), placement);
        }
    }
    sample
}

fn main() {
    let mut v = Validator::new("validate_placement");

    v.section("── valid ranges ──");
    let r = get_valid_range("--GGG---");
    v.check_count("range begin of --GGG---", r.begin, 2);
    v.check_count("range span of --GGG---", r.span, 3);
    let r = get_valid_range("GGGCCCGTAT-------");
    v.check_count("range begin, leading signal", r.begin, 0);
    v.check_count("range span, leading signal", r.span, 10);
    let r = get_valid_range("-GGGC---CCG-TAT");
    v.check_count("range begin, internal gaps", r.begin, 1);
    v.check_count("range span, internal gaps", r.span, 14);
    let r = get_valid_range("---------GGGCCCGTAT-------");
    v.check_count("range begin, flanked", r.begin, 9);
    v.check_count("range span, flanked", r.span, 10);

    v.section("── LWR identity ──");
    let mut sample = Sample::new();
    for (branch, logl) in [(0u32, -10.0), (1, -11.0), (2, -12.0)] {
        sample.add_placement(
            0,
            "q0",
            Placement {
                branch_id: branch,
                logl,
                pendant_length: 0.9,
                distal_length: 0.9,
                lwr: 0.0,
            },
        );
    }
    lwr::compute_and_set_lwr(&mut sample);
    let q = sample.pquery(0).expect("query 0");
    v.check("lwr of best", q.placements[0].lwr, 0.6652, 5e-4);
    v.check("lwr of runner-up", q.placements[1].lwr, 0.2447, 5e-4);
    v.check("lwr of third", q.placements[2].lwr, 0.0900, 5e-4);
    let sum: f64 = q.placements.iter().map(|p| p.lwr).sum();
    v.check("Σ lwr", sum, 1.0, 1e-12);

    v.section("── accumulated pruning (θ = 0.95) ──");
    let mut sample = lwr_sample(&[
        &[0.001, 0.23, 0.05, 0.02, 0.4, 0.009, 0.2, 0.09],
        &[0.01, 0.02, 0.005, 0.002, 0.94, 0.003, 0.02],
        &[1.0],
    ]);
    lwr::discard_by_accumulated_threshold(&mut sample, 0.95);
    let counts: Vec<usize> = sample.iter().map(|p| p.placements.len()).collect();
    v.check_count("query a retained", counts[0], 5);
    v.check_count("query b retained", counts[1], 2);
    v.check_count("query c retained", counts[2], 1);

    v.section("── support pruning (θ = 0.01) ──");
    let mut sample = lwr_sample(&[
        &[0.001, 0.23, 0.05, 0.02, 0.4, 0.009, 0.2, 0.09],
        &[0.01, 0.02, 0.005, 0.002, 0.94, 0.003, 0.02],
        &[1.0],
    ]);
    lwr::discard_by_support_threshold(&mut sample, 0.01);
    let counts: Vec<usize> = sample.iter().map(|p| p.placements.len()).collect();
    v.check_count("query a retained", counts[0], 6);
    v.check_count("query b retained", counts[1], 3);
    v.check_count("query c retained", counts[2], 1);

    v.section("── byte formatting ──");
    v.check_true("2048 → 2.0KiB", format_byte_num(2048.0) == "2.0KiB");
    v.check_true(
        "1.5·2²⁰ → 1.5MiB",
        format_byte_num(1.5 * f64::from(1 << 20)) == "1.5MiB",
    );
    v.check_count(
        "512M in bytes",
        memstring_to_byte("512M").expect("parse 512M") as usize,
        512 << 20,
    );
    v.check_count(
        "2G in bytes",
        memstring_to_byte("2G").expect("parse 2G") as usize,
        2 << 30,
    );

    v.section("── stage scheduler ──");
    let per_stage = schedule::solve(10, &[0.5, 0.3, 0.2]).expect("solvable");
    v.check_count("stage 0 ranks", per_stage[0] as usize, 5);
    v.check_count("stage 1 ranks", per_stage[1] as usize, 3);
    v.check_count("stage 2 ranks", per_stage[2] as usize, 2);

    v.section("── end-to-end placement ──");
    let newick = "((t1:0.1,t2:0.2):0.15,t3:0.3,t4:0.25);";
    let alignment: Vec<Sequence> = [
        ("t1", "ACGTACGTAAGGACGTTGCA"),
        ("t2", "ACGTACTTAAGCACGATGCA"),
        ("t3", "ACCTACGTATGGTCGTTGCA"),
        ("t4", "GCGTACGAATGGACGTTGGA"),
    ]
    .iter()
    .map(|(h, s)| Sequence {
        header: (*h).to_string(),
        sites: (*s).to_string(),
    })
    .collect();
    let tree = Tree::from_newick(newick, &alignment, SubstModel::jc69(), CpuFeatures::detect())
        .expect("reference tree");
    v.check_count("branches of a 4-tip tree", tree.nums().branches, 5);

    for (opt_branches, premasking) in [(false, false), (false, true), (true, false), (true, true)] {
        let options = Options {
            premasking,
            opt_branches,
            ..Options::default()
        };
        // t1's own sequence must win on t1's pendant branch (branch 1)
        let query = Sequence {
            header: String::from("t1-copy"),
            sites: alignment[0].sites.clone(),
        };
        let mut best = (0u32, f64::NEG_INFINITY);
        for branch in 0..tree.nums().branches as u32 {
            let mut tiny = TinyTree::from_branch(&tree, branch).expect("tiny tree");
            let placement = tiny.place(&query, opt_branches, &options).expect("place");
            if placement.logl > best.1 {
                best = (branch, placement.logl);
            }
        }
        v.check_count(
            &format!("best branch (opt={opt_branches}, premask={premasking})"),
            best.0 as usize,
            1,
        );
    }

    v.finish()
}
