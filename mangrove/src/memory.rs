// SPDX-License-Identifier: AGPL-3.0-or-later
//! Memory-footprint prediction and CLV-slot policy.
//!
//! Placement memory is dominated by the reference partition's CLV buffer,
//! which grows with alignment length and tip count. Before anything is
//! allocated, the planner predicts the peak working set from the input
//! shapes alone and, under a byte budget, decides between keeping every
//! CLV resident and a logarithmic slot policy (`⌈log₂ tips⌉ + 2` slots,
//! recomputing evicted CLVs on demand).
//!
//! The process-wide ceiling is the smaller of `/proc/meminfo` and a
//! `SLURM_MEM_PER_NODE` override (suffixes K/M/G/T, default M). Both
//! probes are injectable for testing.

use crate::error::{Error, Result};
use crate::io::fasta::AlignmentInfo;
use crate::options::{MemsaveMode, MemsaveOption, Options};
use crate::phylo::charmap::{AA_MAP_SIZE, NT_MAP_SIZE};
use crate::phylo::model::SubstModel;
use crate::phylo::partition::CpuFeatures;

const BYTES_F64: u64 = 8;
const BYTES_U32: u64 = 4;
const BYTES_PTR: u64 = 8;

/// Input-stream buffering of the query reader (three blocks).
const QUERY_STREAM_BLOCK: u64 = 4 * 1024 * 1024;

/// Predicted byte footprint of one placement run, by component.
#[derive(Debug, Clone)]
pub struct MemoryFootprint {
    partition: u64,
    per_clv: u64,
    clv_buffer: u64,
    max_num_clv: u64,
    logn: u64,
    lookup: u64,
    presample: u64,
    refmsa: u64,
    qs_stream: u64,
    allwork: u64,
}

impl MemoryFootprint {
    /// Predict the footprint from input shapes, model and options.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] under site repeats (their footprint cannot
    /// be predicted from shapes alone) or mismatched alignment widths.
    pub fn new(
        ref_info: &AlignmentInfo,
        qry_info: &AlignmentInfo,
        model: &SubstModel,
        options: &Options,
        features: CpuFeatures,
    ) -> Result<Self> {
        if options.repeats {
            return Err(Error::InvalidInput(String::from(
                "cannot predict the memory footprint under site repeats",
            )));
        }
        if ref_info.sites != qry_info.sites {
            return Err(Error::InvalidInput(format!(
                "reference has {} sites, queries have {}",
                ref_info.sites, qry_info.sites
            )));
        }

        let tips = ref_info.sequences as u64;
        let inner = tips.saturating_sub(2);
        let branches = 2 * tips - 3;
        let num_sites = if options.premasking {
            ref_info.nongap_count() as u64
        } else {
            ref_info.sites as u64
        };

        let states = model.states as u64;
        let states_padded = features.states_padded(model.states) as u64;
        let rate_cats = model.rate_cats() as u64;
        let rate_matrices = 1u64;

        // ── partition breakdown ──────────────────────────────────────
        let mut partition = 0u64;

        // eigen-decomposition-valid flags
        partition += rate_matrices * 4;

        // tip-pattern bookkeeping: charmap, tipmap, tip-tip lookup, tipchars
        partition += 128 + 128 * BYTES_PTR;
        if states == 4 {
            partition += 16 * 16 * rate_cats * states_padded * BYTES_F64;
        }
        partition += tips * num_sites + tips * BYTES_PTR;

        let num_clvs = inner * 3;
        let per_clv = num_sites * states_padded * rate_cats * BYTES_F64 + BYTES_PTR;
        let clv_buffer = num_clvs * per_clv;
        partition += clv_buffer;

        // probability matrices, allocated with shared padding displacement
        let displacement = (states_padded - states) * states_padded * BYTES_F64;
        partition += branches * states * states_padded * rate_cats * BYTES_F64
            + displacement
            + branches * BYTES_PTR;

        // eigenvectors, their inverse, eigenvalues
        partition += 2 * (rate_matrices * states * states_padded * BYTES_F64 + rate_matrices * BYTES_PTR);
        partition += rate_matrices * states_padded * BYTES_F64 + rate_matrices * BYTES_PTR;

        // substitution parameters and frequencies
        partition += rate_matrices * (states * states - states) / 2 * BYTES_F64
            + rate_matrices * BYTES_PTR;
        partition += rate_matrices * states_padded * BYTES_F64 + rate_matrices * BYTES_PTR;

        // rates, rate weights, p-invar, site weights
        partition += rate_cats * BYTES_F64 * 2;
        partition += rate_matrices * BYTES_F64;
        partition += num_sites * BYTES_U32;

        // scale buffers, one per CLV-bearing record
        partition += num_clvs * num_sites * BYTES_U32 + num_clvs * BYTES_PTR;

        // ── collaborating buffers ────────────────────────────────────
        let effective_states = if states == 4 {
            NT_MAP_SIZE as u64
        } else {
            AA_MAP_SIZE as u64
        };
        let mutex_bytes = std::mem::size_of::<std::sync::Mutex<()>>() as u64;
        let (lookup, presample) = if options.prescoring {
            let lookup =
                128 * BYTES_PTR + branches * mutex_bytes + branches * effective_states * num_sites * BYTES_F64;
            let chunk = u64::from(options.chunk_size).min(qry_info.sequences as u64);
            let slim_placement = 16u64;
            (lookup, chunk * branches * slim_placement)
        } else {
            (0, 0)
        };

        let refmsa = ref_info.sequences as u64 * num_sites + ref_info.sequences as u64 * 50;

        let qs_stream = QUERY_STREAM_BLOCK * 3;

        let allwork = if options.prescoring {
            0
        } else {
            branches * u64::from(options.chunk_size).min(qry_info.sequences as u64) * 16
        };

        Ok(Self {
            partition,
            per_clv,
            clv_buffer,
            max_num_clv: num_clvs,
            logn: (tips as f64).log2().ceil() as u64 + 2,
            lookup,
            presample,
            refmsa,
            qs_stream,
            allwork,
        })
    }

    /// Predicted peak bytes with every CLV resident.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.partition + self.lookup + self.presample + self.refmsa + self.qs_stream + self.allwork
    }

    /// Smallest feasible footprint: the CLV buffer shrunk to the
    /// logarithmic slot count.
    #[must_use]
    pub const fn minimum(&self) -> u64 {
        self.total() - self.clv_buffer + self.logn * self.per_clv
    }

    /// Bytes of a single CLV.
    #[must_use]
    pub const fn clv(&self) -> u64 {
        self.per_clv
    }

    /// Bytes of the full CLV buffer.
    #[must_use]
    pub const fn clv_buffer(&self) -> u64 {
        self.clv_buffer
    }

    /// CLV count of the full policy.
    #[must_use]
    pub const fn maximum_required_clvs(&self) -> u64 {
        self.max_num_clv
    }

    /// CLV slot count of the logarithmic policy.
    #[must_use]
    pub const fn logn_clvs(&self) -> u64 {
        self.logn
    }

    /// Bytes of the pre-placement lookup (0 when prescoring is off).
    #[must_use]
    pub const fn lookup(&self) -> u64 {
        self.lookup
    }

    /// Per-component byte breakdown for reporting.
    #[must_use]
    pub fn breakdown(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("partition total", self.partition),
            ("CLV buffer", self.clv_buffer),
            ("preplacement lookup", self.lookup),
            ("preplacement sample", self.presample),
            ("reference MSA", self.refmsa),
            ("query input stream", self.qs_stream),
            ("all-work object", self.allwork),
        ]
    }
}

/// Concrete CLV policy picked by [`MemoryConfig::new`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Whether the memory-saving policy is active at all.
    pub active: bool,
    /// CLV slots to allocate.
    pub clv_slots: u64,
    /// Whether the pre-placement lookup fits the budget.
    pub preplace_lookup_enabled: bool,
    /// The operator's constraint exceeded detected system memory (warn
    /// and continue).
    pub constraint_exceeds_system: bool,
}

impl MemoryConfig {
    /// Resolve the memory-saving request against a predicted footprint
    /// and the detected system ceiling.
    ///
    /// # Errors
    ///
    /// [`Error::BudgetInfeasible`] when the constraint is below the
    /// feasible minimum, or for the unimplemented custom mode.
    pub fn new(
        memsave: MemsaveOption,
        footprint: &MemoryFootprint,
        system_max: u64,
    ) -> Result<Self> {
        let inactive = Self {
            active: false,
            clv_slots: footprint.maximum_required_clvs(),
            preplace_lookup_enabled: true,
            constraint_exceeds_system: false,
        };

        match memsave.mode {
            MemsaveMode::Off => Ok(inactive),
            MemsaveMode::Auto => {
                // an oversized operator constraint is honoured (with a
                // warning flag), not silently capped at system memory
                let budget = memsave.memory_constraint;
                if footprint.total() as f64 > 0.95 * budget as f64 {
                    Self::init(budget, footprint, system_max)
                } else {
                    Ok(inactive)
                }
            }
            MemsaveMode::Full => Self::init(footprint.minimum(), footprint, system_max),
            MemsaveMode::Custom => Err(Error::BudgetInfeasible(String::from(
                "custom memsave mode is not implemented",
            ))),
        }
    }

    fn init(constraint: u64, footprint: &MemoryFootprint, system_max: u64) -> Result<Self> {
        let minimum = footprint.minimum();
        if constraint < minimum {
            return Err(Error::BudgetInfeasible(format!(
                "constraint {} below the minimum required {}",
                format_byte_num(constraint as f64),
                format_byte_num(minimum as f64)
            )));
        }

        let mut budget = constraint - minimum;
        let preplace_lookup_enabled = footprint.lookup() > 0 && footprint.lookup() < budget;
        if preplace_lookup_enabled {
            budget -= footprint.lookup();
        }

        let extra = budget / footprint.clv();
        let clv_slots =
            (footprint.logn_clvs() + extra).min(footprint.maximum_required_clvs());

        Ok(Self {
            active: true,
            clv_slots,
            preplace_lookup_enabled,
            constraint_exceeds_system: constraint > system_max,
        })
    }
}

/// Human-readable byte count: `2048 → "2.0KiB"`.
#[must_use]
pub fn format_byte_num(mut size: f64) -> String {
    const MAGNITUDE: [&str; 6] = ["", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut level = 0;
    while size > 1024.0 && level + 1 < MAGNITUDE.len() {
        size /= 1024.0;
        level += 1;
    }
    format!("{size:.1}{}", MAGNITUDE[level])
}

/// Parse a memory string with binary suffix `K/M/G/T`; a missing suffix
/// means mebibytes (the SLURM convention).
///
/// # Errors
///
/// [`Error::InvalidInput`] on an empty or non-numeric string.
pub fn memstring_to_byte(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(String::from("empty memory string")));
    }
    let last = trimmed
        .chars()
        .last()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('M');
    let (digits, mult) = match last {
        'K' => (&trimmed[..trimmed.len() - 1], 1024u64),
        'M' => (&trimmed[..trimmed.len() - 1], 1024u64.pow(2)),
        'G' => (&trimmed[..trimmed.len() - 1], 1024u64.pow(3)),
        'T' => (&trimmed[..trimmed.len() - 1], 1024u64.pow(4)),
        _ => (trimmed, 1024u64.pow(2)),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("unparseable memory string '{text}'")))?;
    Ok((value * mult as f64) as u64)
}

/// Extract total memory bytes from `/proc/meminfo` content.
#[must_use]
pub fn parse_meminfo(content: &str) -> Option<u64> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Resolve the process-wide memory ceiling from probe inputs: detected
/// system memory, capped by a SLURM per-node limit when present.
#[must_use]
pub fn max_memory_from(meminfo: Option<&str>, slurm_mem_per_node: Option<&str>) -> u64 {
    let mut maxmem = meminfo.and_then(parse_meminfo).unwrap_or(u64::MAX);
    if let Some(limit) = slurm_mem_per_node
        && let Ok(bytes) = memstring_to_byte(limit)
    {
        maxmem = maxmem.min(bytes);
    }
    maxmem
}

/// Probe the live environment for the memory ceiling.
#[must_use]
pub fn get_max_memory() -> u64 {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok();
    let slurm = std::env::var("SLURM_MEM_PER_NODE").ok();
    max_memory_from(meminfo.as_deref(), slurm.as_deref())
}
