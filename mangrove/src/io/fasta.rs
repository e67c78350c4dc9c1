// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sovereign FASTA parser — zero external parsing dependencies.
//!
//! Streams aligned records from disk via [`BufReader`]. Handles both
//! plain and gzip-compressed files (`.gz` extension, via
//! `flate2::read::GzDecoder`).
//!
//! [`read_fasta`] collects a whole alignment (the reference MSA path);
//! [`FastaStream`] yields queries in bounded chunks so the placement
//! pipeline never holds more than `chunk_size` sequences of the query
//! file in memory.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::phylo::range::is_gap_char;

/// One aligned sequence. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Header line content (without the leading `>`).
    pub header: String,
    /// Aligned site characters.
    pub sites: String,
}

/// Shape summary of an alignment, as the memory planner consumes it.
#[derive(Debug, Clone)]
pub struct AlignmentInfo {
    /// Number of sequences.
    pub sequences: usize,
    /// Alignment length in sites.
    pub sites: usize,
    /// Per-column flag: every sequence gapped here.
    pub gap_mask: Vec<bool>,
}

impl AlignmentInfo {
    /// Inspect an in-memory alignment.
    ///
    /// # Errors
    ///
    /// [`Error::Fasta`] when rows differ in length or there are none.
    pub fn from_alignment(alignment: &[Sequence]) -> Result<Self> {
        let sites = alignment
            .first()
            .map(|s| s.sites.len())
            .ok_or_else(|| Error::Fasta(String::from("empty alignment")))?;
        for seq in alignment {
            if seq.sites.len() != sites {
                return Err(Error::Fasta(format!(
                    "sequence '{}' has {} sites, alignment has {}",
                    seq.header,
                    seq.sites.len(),
                    sites
                )));
            }
        }

        let mut gap_mask = vec![true; sites];
        for seq in alignment {
            for (site, &c) in seq.sites.as_bytes().iter().enumerate() {
                if !is_gap_char(c) {
                    gap_mask[site] = false;
                }
            }
        }

        Ok(Self {
            sequences: alignment.len(),
            sites,
            gap_mask,
        })
    }

    /// Number of columns with at least one non-gap character.
    #[must_use]
    pub fn nongap_count(&self) -> usize {
        self.gap_mask.iter().filter(|&&gap| !gap).count()
    }
}

/// Open a FASTA file for buffered reading, transparently decompressing
/// `.gz` files.
fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let ext = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("");
    if ext.eq_ignore_ascii_case("gz") {
        Ok(Box::new(BufReader::new(flate2::read::GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Streaming FASTA reader yielding records one at a time.
pub struct FastaStream {
    reader: Box<dyn BufRead>,
    path: std::path::PathBuf,
    pending_header: Option<String>,
    records_read: u32,
}

impl FastaStream {
    /// Open `path` for streaming.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] when the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: open_reader(path)?,
            path: path.to_path_buf(),
            pending_header: None,
            records_read: 0,
        })
    }

    /// Number of records handed out so far; doubles as the id of the next
    /// record.
    #[must_use]
    pub const fn records_read(&self) -> u32 {
        self.records_read
    }

    fn read_line(&mut self, buf: &mut String) -> Result<usize> {
        self.reader.read_line(buf).map_err(|e| Error::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Next record, or `None` at end of input.
    ///
    /// # Errors
    ///
    /// [`Error::Fasta`] on malformed records, [`Error::Io`] on read
    /// failures.
    pub fn next_record(&mut self) -> Result<Option<Sequence>> {
        let header = match self.pending_header.take() {
            Some(header) => header,
            None => {
                let mut line = String::new();
                loop {
                    line.clear();
                    if self.read_line(&mut line)? == 0 {
                        return Ok(None);
                    }
                    let trimmed = line.trim_end();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Some(rest) = trimmed.strip_prefix('>') {
                        break rest.to_string();
                    }
                    return Err(Error::Fasta(format!(
                        "expected '>' header, got: {}",
                        &trimmed[..trimmed.len().min(40)]
                    )));
                }
            }
        };

        let mut sites = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if let Some(rest) = trimmed.strip_prefix('>') {
                self.pending_header = Some(rest.to_string());
                break;
            }
            sites.push_str(trimmed);
        }

        if sites.is_empty() {
            return Err(Error::Fasta(format!("record '{header}' has no sequence")));
        }
        self.records_read += 1;
        Ok(Some(Sequence { header, sites }))
    }

    /// Read up to `chunk_size` records. An empty chunk marks end of
    /// input.
    ///
    /// # Errors
    ///
    /// Propagates [`FastaStream::next_record`] failures.
    pub fn next_chunk(&mut self, chunk_size: u32) -> Result<Vec<(u32, Sequence)>> {
        let mut chunk = Vec::new();
        while chunk.len() < chunk_size as usize {
            let id = self.records_read;
            match self.next_record()? {
                Some(seq) => chunk.push((id, seq)),
                None => break,
            }
        }
        Ok(chunk)
    }
}

/// Read a whole FASTA file into memory (the reference alignment path).
///
/// # Errors
///
/// [`Error::Io`] on open/read failures, [`Error::Fasta`] on malformed
/// records or an empty file.
pub fn read_fasta(path: &Path) -> Result<Vec<Sequence>> {
    let mut stream = FastaStream::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = stream.next_record()? {
        records.push(record);
    }
    if records.is_empty() {
        return Err(Error::Fasta(format!(
            "no FASTA records in {}",
            path.display()
        )));
    }
    Ok(records)
}
