// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingestion and serialisation: FASTA alignments, binary checkpoints,
//! and jplace placement output.

pub mod checkpoint;
pub mod fasta;
pub mod jplace;
