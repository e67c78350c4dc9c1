// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged placement driver: read → prescore → score → write.
//!
//! Queries stream from disk in bounded chunks and flow through the stages
//! as [`Token`]s over bounded channels, so memory stays flat no matter
//! how large the query file is. Within a stage, work fans out over a
//! worker pool by `query_id % workers`; a worker pool's size comes from
//! the flotilla scheduler balancing the per-stage costs over the
//! machine's threads. `Eof` tokens propagate downstream: a worker
//! forwards them and exits once every upstream peer has finished.
//!
//! The prescore stage approximates every (query, branch) score through
//! the lookup store and keeps, per query, the branches covering the
//! accumulated-LWR mass `prescoring_threshold`; only those survive into
//! exact (optionally branch-length-optimising) scoring.
//!
//! A query whose non-gap window is empty is skipped with a warning; every
//! other error aborts the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::Mutex;

use tidegraft_flotilla::schedule;
use tidegraft_flotilla::token::{Status, Token};

use crate::error::{Error, Result};
use crate::io::fasta::{FastaStream, Sequence};
use crate::io::jplace;
use crate::options::Options;
use crate::phylo::lookup::LookupStore;
use crate::phylo::lwr;
use crate::phylo::reference::Tree;
use crate::phylo::sample::Sample;
use crate::phylo::tiny::TinyTree;

/// Accumulated-LWR mass kept in the final output.
const OUTPUT_ACC_MASS: f64 = 0.999_99;

/// Tokens queued per channel before senders block.
const CHANNEL_DEPTH: usize = 2;

/// Outcome summary of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Queries that produced at least one placement.
    pub queries_placed: usize,
    /// Headers skipped for having no non-gap sites.
    pub queries_skipped: Vec<String>,
    /// Where the jplace document went.
    pub output_path: PathBuf,
}

/// One query's surviving work after prescoring.
struct WorkItem {
    query_id: u32,
    header: String,
    sites: String,
    branches: Vec<u32>,
}

type ChunkToken = Token<Vec<(u32, Sequence)>>;
type WorkToken = Token<Vec<WorkItem>>;

/// Per-worker cache of tiny trees, one per branch touched.
struct TinyCache<'t> {
    tree: &'t Tree,
    bound: HashMap<u32, TinyTree>,
}

impl<'t> TinyCache<'t> {
    fn new(tree: &'t Tree) -> Self {
        Self {
            tree,
            bound: HashMap::new(),
        }
    }

    fn get(&mut self, branch_id: u32) -> Result<&mut TinyTree> {
        if !self.bound.contains_key(&branch_id) {
            self.bound
                .insert(branch_id, TinyTree::from_branch(self.tree, branch_id)?);
        }
        Ok(self
            .bound
            .get_mut(&branch_id)
            .unwrap_or_else(|| unreachable!("inserted above")))
    }
}

fn fan_out<T>(items: Vec<T>, workers: usize, id_of: impl Fn(&T) -> u32) -> Vec<Vec<T>> {
    let mut parts: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for item in items {
        let slot = (id_of(&item) as usize) % workers;
        parts[slot].push(item);
    }
    parts
}

fn send_token<T>(
    senders: &[SyncSender<Token<Vec<T>>>],
    parts: Vec<Vec<T>>,
    status: Status,
) -> Result<()> {
    for (sender, payload) in senders.iter().zip(parts) {
        sender
            .send(Token { payload, status })
            .map_err(|_| Error::InvalidInput(String::from("pipeline stage hung up")))?;
    }
    Ok(())
}

fn broadcast_eof<T>(senders: &[SyncSender<Token<Vec<T>>>]) -> Result<()> {
    for sender in senders {
        sender
            .send(Token::eof(Vec::new()))
            .map_err(|_| Error::InvalidInput(String::from("pipeline stage hung up")))?;
    }
    Ok(())
}

/// Keep, for one prescored query, the branches that cover the
/// accumulated-LWR mass `threshold`.
fn select_candidates(scores: &[(u32, f64)], threshold: f64) -> Vec<u32> {
    let mut sample = Sample::new();
    for &(branch_id, logl) in scores {
        if !logl.is_finite() {
            continue;
        }
        sample.add_placement(
            0,
            "",
            crate::phylo::sample::Placement {
                branch_id,
                logl,
                pendant_length: 0.0,
                distal_length: 0.0,
                lwr: 0.0,
            },
        );
    }
    lwr::compute_and_set_lwr(&mut sample);
    lwr::discard_by_accumulated_threshold(&mut sample, threshold);
    sample
        .pquery(0)
        .map(|p| p.placements.iter().map(|pl| pl.branch_id).collect())
        .unwrap_or_default()
}

fn prescore_worker(
    tree: &Tree,
    lookup: &LookupStore,
    options: &Options,
    incoming: &Receiver<ChunkToken>,
    to_score: &[SyncSender<WorkToken>],
    skipped: &Mutex<Vec<String>>,
) -> Result<()> {
    let mut cache = TinyCache::new(tree);
    let branch_count = tree.nums().branches as u32;

    loop {
        let token = incoming
            .recv()
            .map_err(|_| Error::InvalidInput(String::from("read stage hung up")))?;
        let eof = token.is_eof();

        let mut work = Vec::new();
        for (query_id, seq) in token.payload {
            if options.premasking
                && crate::phylo::range::get_valid_range(&seq.sites).is_empty()
            {
                if let Ok(mut guard) = skipped.lock() {
                    guard.push(seq.header.clone());
                }
                continue;
            }
            if seq.sites.len() != tree.partition.sites {
                return Err(Error::InputShape {
                    header: seq.header,
                    got: seq.sites.len(),
                    expected: tree.partition.sites,
                });
            }

            let mut scores = Vec::with_capacity(branch_count as usize);
            for branch_id in 0..branch_count {
                lookup.ensure(cache.get(branch_id)?)?;
                scores.push((branch_id, lookup.prescore(branch_id, &seq.sites)?));
            }
            let branches = select_candidates(&scores, options.prescoring_threshold);
            work.push(WorkItem {
                query_id,
                header: seq.header,
                sites: seq.sites,
                branches,
            });
        }

        let parts = fan_out(work, to_score.len(), |w| w.query_id);
        send_token(to_score, parts, token.status)?;
        if eof {
            return Ok(());
        }
    }
}

fn score_worker(
    tree: &Tree,
    options: &Options,
    upstreams: usize,
    incoming: &Receiver<WorkToken>,
    to_writer: &SyncSender<Token<Sample>>,
    skipped: &Mutex<Vec<String>>,
) -> Result<()> {
    let mut cache = TinyCache::new(tree);
    let mut local = Sample::new();
    let mut eofs = 0;

    while eofs < upstreams {
        let token = incoming
            .recv()
            .map_err(|_| Error::InvalidInput(String::from("upstream stage hung up")))?;
        if token.is_eof() {
            eofs += 1;
        }

        for item in token.payload {
            let seq = Sequence {
                header: item.header,
                sites: item.sites,
            };
            for &branch_id in &item.branches {
                match cache.get(branch_id)?.place(&seq, options.opt_branches, options) {
                    Ok(placement) => local.add_placement(item.query_id, &seq.header, placement),
                    Err(Error::EmptyRange { header }) => {
                        if let Ok(mut guard) = skipped.lock() {
                            guard.push(header);
                        }
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }

    to_writer
        .send(Token::eof(local))
        .map_err(|_| Error::InvalidInput(String::from("writer hung up")))
}

/// Stream `query_path` through the pipeline against `tree`, writing a
/// jplace document to `output_path`.
///
/// # Errors
///
/// Fatal kernel, transport and I/O errors abort the run. All-gap queries
/// are skipped, not fatal; the report lists them.
pub fn place_queries(
    tree: &Tree,
    query_path: &Path,
    output_path: &Path,
    options: &Options,
    invocation: &str,
) -> Result<PipelineReport> {
    options.validate()?;

    let threads = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
    let prescoring = options.prescoring;
    let stage_costs: &[f64] = if prescoring {
        &[0.05, 0.35, 0.55, 0.05]
    } else {
        &[0.15, 0.7, 0.15]
    };
    let difficulty = schedule::to_difficulty(stage_costs);
    let ranks = u32::try_from(threads.max(stage_costs.len()))
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let per_stage =
        schedule::solve(ranks, &difficulty).map_err(Error::InvalidInput)?;
    let assignment = schedule::assign(&per_stage);
    let n_pre = if prescoring { assignment.stage_width(1) } else { 0 };
    let n_score = assignment.stage_width(if prescoring { 2 } else { 1 });

    let lookup = LookupStore::new(tree.nums().branches, tree.params(), tree.partition.sites);
    let skipped = Mutex::new(Vec::new());
    let mut stream = FastaStream::open(query_path)?;
    let mut merged = Sample::new();

    std::thread::scope(|scope| -> Result<()> {
        // writer feed
        let (to_writer, from_scores) = sync_channel::<Token<Sample>>(n_score.max(1));

        // score pool
        let mut to_score = Vec::with_capacity(n_score);
        let mut handles = Vec::new();
        let score_upstreams = if prescoring { n_pre } else { 1 };
        for _ in 0..n_score {
            let (tx, rx) = sync_channel::<WorkToken>(CHANNEL_DEPTH);
            to_score.push(tx);
            let writer = to_writer.clone();
            let skipped = &skipped;
            handles.push(scope.spawn(move || {
                score_worker(tree, options, score_upstreams, &rx, &writer, skipped)
            }));
        }
        drop(to_writer);

        // prescore pool
        let mut to_pre = Vec::with_capacity(n_pre);
        for _ in 0..n_pre {
            let (tx, rx) = sync_channel::<ChunkToken>(CHANNEL_DEPTH);
            to_pre.push(tx);
            let to_score = to_score.clone();
            let lookup = &lookup;
            let skipped = &skipped;
            handles.push(scope.spawn(move || {
                prescore_worker(tree, lookup, options, &rx, &to_score, skipped)
            }));
        }

        // read stage, running on this thread
        let all_branches: Vec<u32> = (0..tree.nums().branches as u32).collect();
        loop {
            let chunk = stream.next_chunk(options.chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            if prescoring {
                let parts = fan_out(chunk, n_pre, |(id, _)| *id);
                send_token(&to_pre, parts, Status::Data)?;
            } else {
                let work: Vec<WorkItem> = chunk
                    .into_iter()
                    .map(|(query_id, seq)| WorkItem {
                        query_id,
                        header: seq.header,
                        sites: seq.sites,
                        branches: all_branches.clone(),
                    })
                    .collect();
                let parts = fan_out(work, n_score, |w| w.query_id);
                send_token(&to_score, parts, Status::Data)?;
            }
        }
        if prescoring {
            broadcast_eof(&to_pre)?;
        } else {
            broadcast_eof(&to_score)?;
        }
        drop(to_pre);
        drop(to_score);

        // write stage: merge worker samples as they drain
        let mut remaining = n_score;
        while remaining > 0 {
            let token = from_scores
                .recv()
                .map_err(|_| Error::InvalidInput(String::from("score stage hung up")))?;
            if token.is_eof() {
                remaining -= 1;
            }
            merged.merge(token.payload);
        }

        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::InvalidInput(String::from("worker panicked")))??;
        }
        Ok(())
    })?;

    merged.sort_by_query_id();
    lwr::compute_and_set_lwr(&mut merged);
    lwr::discard_by_accumulated_threshold(&mut merged, OUTPUT_ACC_MASS);

    jplace::write_jplace(
        output_path,
        &merged,
        &tree.newick_with_edge_ids(),
        invocation,
    )?;

    let skipped = skipped.into_inner().unwrap_or_default();
    Ok(PipelineReport {
        queries_placed: merged.len(),
        queries_skipped: skipped,
        output_path: output_path.to_path_buf(),
    })
}
