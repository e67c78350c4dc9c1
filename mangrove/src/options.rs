// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run options for the placement pipeline.

use crate::error::{Error, Result};

/// Memory-saving policy requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemsaveMode {
    /// Never trade CLV slots for memory.
    #[default]
    Off,
    /// Activate memory saving only when the predicted footprint crowds the
    /// budget (95% rule).
    Auto,
    /// Run at the minimum feasible footprint.
    Full,
    /// Operator-specified byte budget. Unsupported; rejected when options
    /// are assembled.
    Custom,
}

/// Memory-saving request: mode plus the byte budget it applies against.
#[derive(Debug, Clone, Copy)]
pub struct MemsaveOption {
    /// Requested policy.
    pub mode: MemsaveMode,
    /// Byte budget the policy applies against (system ceiling by default).
    pub memory_constraint: u64,
}

/// Options covering the `place` command surface.
#[derive(Debug, Clone)]
pub struct Options {
    /// Run the approximate pre-placement stage before exact scoring.
    pub prescoring: bool,
    /// Accumulated-LWR mass retained by pre-placement, in `[0, 1]`.
    pub prescoring_threshold: f64,
    /// Restrict per-query evaluation to the query's non-gap window.
    pub premasking: bool,
    /// Seed each optimisation sweep with the previous sweep's lengths.
    pub sliding_blo: bool,
    /// Optimise the three triplet branch lengths per placement.
    pub opt_branches: bool,
    /// Number of query sequences per streamed chunk.
    pub chunk_size: u32,
    /// Memory-saving request.
    pub memsave: MemsaveOption,
    /// Use site-repeat compression in the numerics layer. Mutually
    /// exclusive with memory-footprint planning.
    pub repeats: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prescoring: true,
            prescoring_threshold: 0.99,
            premasking: true,
            sliding_blo: true,
            opt_branches: true,
            chunk_size: 1000,
            memsave: MemsaveOption {
                mode: MemsaveMode::Off,
                memory_constraint: u64::MAX,
            },
            repeats: false,
        }
    }
}

impl Options {
    /// Reject option combinations the pipeline cannot honour.
    ///
    /// # Errors
    ///
    /// [`Error::BudgetInfeasible`] for the unimplemented custom memsave
    /// mode, [`Error::InvalidInput`] for out-of-range thresholds or the
    /// repeats/memsave conflict.
    pub fn validate(&self) -> Result<()> {
        if self.memsave.mode == MemsaveMode::Custom {
            return Err(Error::BudgetInfeasible(String::from(
                "custom memsave mode is not implemented",
            )));
        }
        if !(0.0..=1.0).contains(&self.prescoring_threshold) {
            return Err(Error::InvalidInput(format!(
                "prescoring threshold {} outside [0, 1]",
                self.prescoring_threshold
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput(String::from("chunk size must be > 0")));
        }
        if self.repeats && self.memsave.mode != MemsaveMode::Off {
            return Err(Error::InvalidInput(String::from(
                "site repeats and memory-saving mode are mutually exclusive",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn custom_memsave_is_rejected() {
        let mut options = Options::default();
        options.memsave.mode = MemsaveMode::Custom;
        assert!(matches!(
            options.validate(),
            Err(Error::BudgetInfeasible(_))
        ));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let options = Options {
            prescoring_threshold: 1.5,
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn repeats_conflicts_with_memsave() {
        let mut options = Options {
            repeats: true,
            ..Options::default()
        };
        options.memsave.mode = MemsaveMode::Auto;
        assert!(options.validate().is_err());

        options.memsave.mode = MemsaveMode::Off;
        assert!(options.validate().is_ok());
    }
}
