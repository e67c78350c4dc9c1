// SPDX-License-Identifier: AGPL-3.0-or-later
//! jplace (v3) placement output.
//!
//! The jplace format is JSON with a fixed skeleton: the reference tree in
//! Newick form with `{edge_num}` annotations, a `placements` array with
//! one entry per query, and a `fields` legend for the per-placement
//! tuples. Built by hand — the structure is flat enough that a JSON
//! library would only obscure the field order the format mandates.

use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::phylo::sample::Sample;

/// Field order of every placement tuple.
const FIELDS: [&str; 5] = [
    "edge_num",
    "likelihood",
    "like_weight_ratio",
    "distal_length",
    "pendant_length",
];

fn escape_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Render a sample as a jplace document.
///
/// `tree` is the edge-annotated Newick string
/// ([`crate::phylo::reference::Tree::newick_with_edge_ids`]);
/// `invocation` is echoed into the metadata block.
#[must_use]
pub fn jplace_string(sample: &Sample, tree: &str, invocation: &str) -> String {
    let mut out = String::from("{\n");
    out.push_str(&format!("  \"tree\": \"{}\",\n", escape_json(tree)));

    out.push_str("  \"placements\": [\n");
    let mut first_query = true;
    for pquery in sample.iter() {
        if !first_query {
            out.push_str(",\n");
        }
        first_query = false;
        out.push_str("    {\"p\": [");
        for (i, p) in pquery.placements.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!(
                "[{}, {}, {}, {}, {}]",
                p.branch_id, p.logl, p.lwr, p.distal_length, p.pendant_length
            ));
        }
        out.push_str(&format!(
            "], \"n\": [\"{}\"]}}",
            escape_json(&pquery.header)
        ));
    }
    out.push_str("\n  ],\n");

    let fields: Vec<String> = FIELDS.iter().map(|f| format!("\"{f}\"")).collect();
    out.push_str(&format!("  \"fields\": [{}],\n", fields.join(", ")));
    out.push_str("  \"version\": 3,\n");
    out.push_str(&format!(
        "  \"metadata\": {{\"invocation\": \"{}\"}}\n",
        escape_json(invocation)
    ));
    out.push_str("}\n");
    out
}

/// Write a jplace document to `path`.
///
/// # Errors
///
/// [`Error::Io`] on create/write failures.
pub fn write_jplace(path: &Path, sample: &Sample, tree: &str, invocation: &str) -> Result<()> {
    let text = jplace_string(sample, tree, invocation);
    let mut file = std::fs::File::create(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    file.write_all(text.as_bytes()).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
