// SPDX-License-Identifier: AGPL-3.0-or-later
//! `place` — put query sequences on a reference tree.
//!
//! ```text
//! place <tree.nwk> <reference.fasta> <queries.fasta> <output.jplace> [flags]
//!
//!   --no-prescoring           skip the approximate pre-placement stage
//!   --prescoring-threshold X  accumulated-LWR mass kept by prescoring [0,1]
//!   --no-premasking           evaluate gap columns too
//!   --no-sliding-blo          restart optimisation brackets every sweep
//!   --no-opt-branches         skip branch-length optimisation
//!   --chunk-size N            queries per streamed chunk
//!   --memsave MODE            off | auto | full  (custom is rejected)
//!   --memory BYTES            memory constraint, e.g. 512M, 2G
//!   --repeats                 site-repeat mode (no memory planning)
//! ```
//!
//! Exit codes: 0 success, 1 fatal (infeasible memory budget, every query
//! gap-only, numerics failure).

use std::path::PathBuf;
use std::process::ExitCode;

use tidegraft_mangrove::error::Result;
use tidegraft_mangrove::io::fasta::{AlignmentInfo, read_fasta};
use tidegraft_mangrove::memory::{
    MemoryConfig, MemoryFootprint, format_byte_num, get_max_memory, memstring_to_byte,
};
use tidegraft_mangrove::options::{MemsaveMode, Options};
use tidegraft_mangrove::phylo::model::SubstModel;
use tidegraft_mangrove::phylo::partition::CpuFeatures;
use tidegraft_mangrove::phylo::reference::Tree;
use tidegraft_mangrove::pipeline::place_queries;

struct Invocation {
    tree: PathBuf,
    reference: PathBuf,
    queries: PathBuf,
    output: PathBuf,
    options: Options,
}

fn usage() -> ! {
    eprintln!(
        "usage: place <tree.nwk> <reference.fasta> <queries.fasta> <output.jplace>\n\
         flags: --no-prescoring --prescoring-threshold X --no-premasking\n\
         \u{20}      --no-sliding-blo --no-opt-branches --chunk-size N\n\
         \u{20}      --memsave off|auto|full --memory BYTES --repeats"
    );
    std::process::exit(1)
}

fn parse_args() -> Invocation {
    let mut positional = Vec::new();
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-prescoring" => options.prescoring = false,
            "--no-premasking" => options.premasking = false,
            "--no-sliding-blo" => options.sliding_blo = false,
            "--no-opt-branches" => options.opt_branches = false,
            "--repeats" => options.repeats = true,
            "--prescoring-threshold" => {
                let value = args.next().unwrap_or_else(|| usage());
                options.prescoring_threshold = value.parse().unwrap_or_else(|_| usage());
            }
            "--chunk-size" => {
                let value = args.next().unwrap_or_else(|| usage());
                options.chunk_size = value.parse().unwrap_or_else(|_| usage());
            }
            "--memsave" => {
                let value = args.next().unwrap_or_else(|| usage());
                options.memsave.mode = match value.as_str() {
                    "off" => MemsaveMode::Off,
                    "auto" => MemsaveMode::Auto,
                    "full" => MemsaveMode::Full,
                    "custom" => MemsaveMode::Custom,
                    _ => usage(),
                };
            }
            "--memory" => {
                let value = args.next().unwrap_or_else(|| usage());
                options.memsave.memory_constraint = match memstring_to_byte(&value) {
                    Ok(bytes) => bytes,
                    Err(_) => usage(),
                };
            }
            flag if flag.starts_with("--") => usage(),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    if positional.len() != 4 {
        usage();
    }
    let mut it = positional.into_iter();
    Invocation {
        tree: it.next().unwrap_or_else(|| usage()),
        reference: it.next().unwrap_or_else(|| usage()),
        queries: it.next().unwrap_or_else(|| usage()),
        output: it.next().unwrap_or_else(|| usage()),
        options,
    }
}

fn run(invocation: &mut Invocation) -> Result<bool> {
    invocation.options.validate()?;

    let reference = read_fasta(&invocation.reference)?;
    let ref_info = AlignmentInfo::from_alignment(&reference)?;
    let query_alignment = read_fasta(&invocation.queries)?;
    let qry_info = AlignmentInfo::from_alignment(&query_alignment)?;
    drop(query_alignment);

    let model = SubstModel::jc69();
    let features = CpuFeatures::detect();

    if invocation.options.repeats {
        eprintln!("note: site repeats requested, memory planning disabled");
    } else {
        let footprint = MemoryFootprint::new(
            &ref_info,
            &qry_info,
            &model,
            &invocation.options,
            features,
        )?;
        println!("Memory footprint breakdown:");
        for (component, bytes) in footprint.breakdown() {
            println!("  {:>10}  {component}", format_byte_num(bytes as f64));
        }
        println!(
            "Estimated memory footprint: {}",
            format_byte_num(footprint.total() as f64)
        );
        let system_max = get_max_memory();
        println!(
            "Total available memory: {}",
            format_byte_num(system_max as f64)
        );

        let config = MemoryConfig::new(invocation.options.memsave, &footprint, system_max)?;
        if config.constraint_exceeds_system {
            eprintln!(
                "warning: memory constraint exceeds detected system memory, continuing \
                 with the specified value"
            );
        }
        if config.active {
            println!(
                "Memory saving active: {} / {} CLV slots",
                config.clv_slots,
                footprint.maximum_required_clvs()
            );
            if !config.preplace_lookup_enabled && invocation.options.prescoring {
                eprintln!("note: budget cannot fit the preplacement lookup, prescoring disabled");
                invocation.options.prescoring = false;
            }
        }
    }

    let newick = std::fs::read_to_string(&invocation.tree).map_err(|e| {
        tidegraft_mangrove::error::Error::Io {
            path: invocation.tree.clone(),
            source: e,
        }
    })?;
    let tree = Tree::from_newick(&newick, &reference, model, features)?;
    println!(
        "Reference: {} tips, {} branches, {} sites",
        tree.nums().tip_nodes,
        tree.nums().branches,
        tree.partition.sites
    );

    let invocation_line: Vec<String> = std::env::args().collect();
    let report = place_queries(
        &tree,
        &invocation.queries,
        &invocation.output,
        &invocation.options,
        &invocation_line.join(" "),
    )?;

    for header in &report.queries_skipped {
        eprintln!("warning: query '{header}' has no non-gap sites, skipped");
    }
    println!(
        "Placed {} queries -> {}",
        report.queries_placed,
        report.output_path.display()
    );

    Ok(report.queries_placed > 0 || report.queries_skipped.is_empty())
}

fn main() -> ExitCode {
    let mut invocation = parse_args();
    match run(&mut invocation) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("error: every query was skipped");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
