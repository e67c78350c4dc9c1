// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLV / probability-matrix engine — the CPU numerics provider.
//!
//! A [`Partition`] owns the per-node conditional likelihood vectors
//! (CLVs), per-branch transition probability matrices, and per-node scale
//! buffers for one likelihood problem, while *aliasing* the model-wide
//! parameter block ([`ModelParams`]) through an `Arc`. That aliasing is
//! what makes three-tip sub-partitions cheap: they share the reference's
//! eigen system, frequencies, rates, pattern weights and character map
//! without copying, and the shared block is immutable after construction.
//!
//! # Tip pattern convention
//!
//! With the tip-pattern attribute set, a node index below `tips` stores a
//! character array instead of a CLV; indices at or above `tips` are
//! CLV-bearing. Callers that want to hang a reference CLV off a "tip"
//! position (the tiny-tree trick) must therefore give that node an index
//! `≥ tips`.
//!
//! # Scaling
//!
//! Partial likelihoods underflow on deep trees. When every entry of a
//! site's partial drops below [`SCALE_THRESHOLD`], the site is multiplied
//! by [`SCALE_FACTOR`] and the site's counter in the node's scale buffer
//! is incremented; scale counts propagate parent = child₁ + child₂ (+1)
//! and are unwound in log space by the edge likelihood.

use std::sync::Arc;

use super::charmap::Charmap;
use super::model::{EigenDecomp, SubstModel};
use super::range::Range;
use crate::error::{Error, Result};

/// Rescaling trigger: all states of a site below this value.
pub const SCALE_THRESHOLD: f64 = 1e-256;

/// Factor applied when a site is rescaled.
pub const SCALE_FACTOR: f64 = 1e256;

/// `ln(SCALE_FACTOR)`, unwound per scale count by the edge likelihood.
const LOG_SCALE_FACTOR: f64 = 256.0 * std::f64::consts::LN_10;

/// Branch lengths are clamped below by this before exponentiation.
pub const BRANCH_LENGTH_MIN: f64 = 1e-8;

/// SIMD capability flags, detected once and injected at partition
/// creation. They decide the state padding of CLV rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// AVX2 available.
    pub avx2: bool,
    /// AVX available.
    pub avx: bool,
    /// SSE3 available.
    pub sse3: bool,
}

impl CpuFeatures {
    /// Probe the running CPU.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            Self {
                avx2: std::arch::is_x86_feature_detected!("avx2"),
                avx: std::arch::is_x86_feature_detected!("avx"),
                sse3: std::arch::is_x86_feature_detected!("sse3"),
            }
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            Self::scalar()
        }
    }

    /// No SIMD; scalar layout.
    #[must_use]
    pub const fn scalar() -> Self {
        Self {
            avx2: false,
            avx: false,
            sse3: false,
        }
    }

    /// CLV row padding implied by the widest available vector unit.
    #[must_use]
    pub fn states_padded(&self, states: usize) -> usize {
        if self.avx2 || self.avx {
            states.div_ceil(4) * 4
        } else if self.sse3 {
            states.div_ceil(2) * 2
        } else {
            states
        }
    }
}

/// Partition attributes fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    /// Store tips as character arrays instead of CLVs.
    pub pattern_tip: bool,
    /// SIMD capability of this process.
    pub features: CpuFeatures,
}

/// Model-wide parameter block shared by the reference partition and every
/// tiny-tree partition. Immutable after construction; shared by `Arc`.
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Substitution model (rates, frequencies, categories, p-invar).
    pub model: SubstModel,
    /// Eigen system of the normalised rate matrix.
    pub eigen: EigenDecomp,
    /// Character/state map of the alphabet.
    pub charmap: Charmap,
    /// Per-site pattern weights (1 when sites are not deduplicated).
    pub pattern_weights: Vec<u32>,
    /// Invariant state index per site, `-1` where the site varies. Only
    /// consulted when the model has a non-zero invariant proportion.
    pub invariant: Vec<i32>,
}

impl ModelParams {
    /// Parameter block with unit pattern weights and no invariant sites.
    #[must_use]
    pub fn new(model: SubstModel, charmap: Charmap, sites: usize) -> Self {
        let eigen = model.eigen();
        Self {
            model,
            eigen,
            charmap,
            pattern_weights: vec![1; sites],
            invariant: vec![-1; sites],
        }
    }
}

/// One partial-likelihood update: compute the parent CLV from two
/// children through their transition matrices.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    /// CLV index receiving the result.
    pub parent_clv: usize,
    /// Scale buffer of the parent, if it has one.
    pub parent_scaler: Option<usize>,
    /// First child CLV (or tip) index.
    pub child1_clv: usize,
    /// First child's scale buffer.
    pub child1_scaler: Option<usize>,
    /// Probability matrix over the first child's branch.
    pub child1_matrix: usize,
    /// Second child CLV (or tip) index.
    pub child2_clv: usize,
    /// Second child's scale buffer.
    pub child2_scaler: Option<usize>,
    /// Probability matrix over the second child's branch.
    pub child2_matrix: usize,
}

/// CLV/pmatrix storage for one likelihood problem.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Number of real tips (character-array positions).
    pub tips: usize,
    /// Number of CLV slots beyond the tip positions.
    pub clv_buffers: usize,
    /// Model states.
    pub states: usize,
    /// Padded CLV row width.
    pub states_padded: usize,
    /// Alignment length in sites.
    pub sites: usize,
    /// Discrete rate categories.
    pub rate_cats: usize,
    /// Partition attributes.
    pub attributes: Attributes,
    /// Shared model-wide parameter block.
    pub params: Arc<ModelParams>,
    clvs: Vec<Option<Vec<f64>>>,
    tipchars: Vec<Option<Vec<u8>>>,
    pmatrices: Vec<Vec<f64>>,
    scalers: Vec<Vec<u32>>,
    view: Range,
}

impl Partition {
    /// Allocate a partition.
    ///
    /// With the tip-pattern attribute, CLV storage is allocated only for
    /// indices `tips..tips + clv_buffers`; tip positions hold character
    /// arrays filled by [`Partition::set_tip_states`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when any dimension is zero.
    pub fn create(
        tips: usize,
        clv_buffers: usize,
        sites: usize,
        prob_matrices: usize,
        scale_buffers: usize,
        params: Arc<ModelParams>,
        attributes: Attributes,
    ) -> Result<Self> {
        let states = params.model.states;
        let rate_cats = params.model.rate_cats();
        if tips == 0 || sites == 0 || prob_matrices == 0 {
            return Err(Error::InvalidInput(String::from(
                "partition needs tips, sites and probability matrices",
            )));
        }
        if params.pattern_weights.len() != sites {
            return Err(Error::InvalidInput(format!(
                "{} pattern weights for {} sites",
                params.pattern_weights.len(),
                sites
            )));
        }

        let states_padded = attributes.features.states_padded(states);
        let clv_len = sites * rate_cats * states_padded;
        let total_slots = tips + clv_buffers;

        let clvs = (0..total_slots)
            .map(|index| {
                let is_char_tip = attributes.pattern_tip && index < tips;
                (!is_char_tip).then(|| vec![0.0; clv_len])
            })
            .collect();
        let tipchars = (0..tips).map(|_| None).collect();
        let pmatrices = (0..prob_matrices)
            .map(|_| vec![0.0; rate_cats * states * states_padded])
            .collect();
        let scalers = (0..scale_buffers).map(|_| vec![0u32; sites]).collect();

        Ok(Self {
            tips,
            clv_buffers,
            states,
            states_padded,
            sites,
            rate_cats,
            attributes,
            params,
            clvs,
            tipchars,
            pmatrices,
            scalers,
            view: Range::new(0, sites),
        })
    }

    /// Currently evaluated site window.
    #[must_use]
    pub const fn view(&self) -> Range {
        self.view
    }

    /// Run `body` with evaluation restricted to `range`, restoring the
    /// full-alignment view afterwards. This is the premasking adapter:
    /// partial updates, edge likelihoods and anything the body triggers
    /// only touch the focused window.
    pub fn focused<R>(&mut self, range: Range, body: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.view;
        let begin = range.begin.min(self.sites);
        let span = range.span.min(self.sites - begin);
        self.view = Range::new(begin, span);
        let result = body(self);
        self.view = saved;
        result
    }

    /// Load tip states from an aligned sequence.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when a character is not in the alphabet map,
    /// [`Error::InputShape`] when the length is off,
    /// [`Error::InvalidInput`] for a non-tip index under tip-pattern.
    pub fn set_tip_states(&mut self, index: usize, sequence: &str) -> Result<()> {
        if sequence.len() != self.sites {
            return Err(Error::InputShape {
                header: String::new(),
                got: sequence.len(),
                expected: self.sites,
            });
        }
        for (site, &c) in sequence.as_bytes().iter().enumerate() {
            if self.params.charmap.mask(c).is_none() {
                return Err(Error::BadState {
                    character: c as char,
                    site,
                });
            }
        }

        if self.attributes.pattern_tip && index < self.tips {
            self.tipchars[index] = Some(sequence.as_bytes().to_vec());
            return Ok(());
        }

        // CLV-bearing position: expand the characters in place
        let params = Arc::clone(&self.params);
        let (states, states_padded, rate_cats) = (self.states, self.states_padded, self.rate_cats);
        let clv = self.clv_slot_mut(index)?;
        for (site, &c) in sequence.as_bytes().iter().enumerate() {
            let mask = params.charmap.mask(c).unwrap_or(0);
            for cat in 0..rate_cats {
                let base = (site * rate_cats + cat) * states_padded;
                for state in 0..states {
                    clv[base + state] = f64::from((mask >> state) & 1);
                }
            }
        }
        Ok(())
    }

    /// Raw tip character array, if loaded.
    #[must_use]
    pub fn tip_chars(&self, index: usize) -> Option<&[u8]> {
        self.tipchars.get(index)?.as_deref()
    }

    /// Overwrite a tip character array (deep-copy path of tiny trees).
    pub fn set_tip_chars(&mut self, index: usize, chars: Vec<u8>) {
        self.tipchars[index] = Some(chars);
    }

    /// CLV contents of a slot.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] if the slot has no CLV storage.
    pub fn clv(&self, index: usize) -> Result<&[f64]> {
        self.clvs
            .get(index)
            .and_then(Option::as_deref)
            .ok_or_else(|| Error::InvalidInput(format!("no CLV storage at index {index}")))
    }

    fn clv_slot_mut(&mut self, index: usize) -> Result<&mut Vec<f64>> {
        self.clvs
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::InvalidInput(format!("no CLV storage at index {index}")))
    }

    /// Overwrite a CLV slot (deep-copy path of tiny trees).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] on missing storage or a length mismatch.
    pub fn set_clv(&mut self, index: usize, data: &[f64]) -> Result<()> {
        let slot = self.clv_slot_mut(index)?;
        if slot.len() != data.len() {
            return Err(Error::InvalidInput(format!(
                "CLV length {} does not fit slot {} of length {}",
                data.len(),
                index,
                slot.len()
            )));
        }
        slot.copy_from_slice(data);
        Ok(())
    }

    /// Scale buffer contents.
    #[must_use]
    pub fn scaler(&self, index: usize) -> &[u32] {
        &self.scalers[index]
    }

    /// Overwrite a scale buffer (deep-copy path of tiny trees).
    pub fn set_scaler(&mut self, index: usize, data: &[u32]) {
        self.scalers[index].copy_from_slice(data);
    }

    /// Probability matrix storage of one branch.
    #[must_use]
    pub fn pmatrix(&self, index: usize) -> &[f64] {
        &self.pmatrices[index]
    }

    /// Recompute transition probability matrices for the given branches.
    ///
    /// `P(t) = E · diag(exp(λᵢ · r_c · t')) · E⁻¹` per rate category,
    /// with `t' = t / (1 − p_invar)` and `t` clamped below by
    /// [`BRANCH_LENGTH_MIN`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] on index/length mismatches.
    pub fn update_prob_matrices(
        &mut self,
        matrix_indices: &[usize],
        branch_lengths: &[f64],
    ) -> Result<()> {
        if matrix_indices.len() != branch_lengths.len() {
            return Err(Error::InvalidInput(format!(
                "{} matrix indices vs {} branch lengths",
                matrix_indices.len(),
                branch_lengths.len()
            )));
        }
        let n = self.states;
        let np = self.states_padded;
        let params = Arc::clone(&self.params);
        let eigen = &params.eigen;
        let model = &params.model;
        let invar_scale = 1.0 - model.prop_invar;

        for (&matrix, &length) in matrix_indices.iter().zip(branch_lengths) {
            let pmat = self
                .pmatrices
                .get_mut(matrix)
                .ok_or_else(|| Error::InvalidInput(format!("no pmatrix {matrix}")))?;
            let t = length.max(BRANCH_LENGTH_MIN) / invar_scale;

            for (cat, &rate) in model.category_rates.iter().enumerate() {
                let expvals: Vec<f64> = eigen
                    .eigenvals
                    .iter()
                    .map(|&lambda| (lambda * rate * t).exp())
                    .collect();
                let block = &mut pmat[cat * (n * np)..(cat + 1) * (n * np)];
                for i in 0..n {
                    for j in 0..n {
                        let mut sum = 0.0;
                        for (k, &e) in expvals.iter().enumerate() {
                            sum += eigen.eigenvecs[i * n + k] * e * eigen.inv_eigenvecs[k * n + j];
                        }
                        // roundoff can push tiny probabilities negative
                        block[i * np + j] = sum.max(0.0);
                    }
                }
            }
        }
        Ok(())
    }

    fn child_partial(&self, index: usize, site: usize, cat: usize, out: &mut [f64]) {
        if let Some(Some(chars)) = self.tipchars.get(index) {
            let mask = self.params.charmap.mask(chars[site]).unwrap_or(0);
            for (state, slot) in out.iter_mut().enumerate().take(self.states) {
                *slot = f64::from((mask >> state) & 1);
            }
            return;
        }
        let clv = self.clvs[index].as_deref().unwrap_or(&[]);
        let base = (site * self.rate_cats + cat) * self.states_padded;
        out[..self.states].copy_from_slice(&clv[base..base + self.states]);
    }

    fn scale_count(&self, scaler: Option<usize>, site: usize) -> u32 {
        scaler.map_or(0, |s| self.scalers[s][site])
    }

    /// Run partial-likelihood updates over the current site view.
    pub fn update_partials(&mut self, operations: &[Operation]) {
        let n = self.states;
        let np = self.states_padded;
        let view = self.view;
        let mut c1 = vec![0.0; n];
        let mut c2 = vec![0.0; n];

        for op in operations {
            for site in view.begin..view.end() {
                let inherited = self.scale_count(op.child1_scaler, site)
                    + self.scale_count(op.child2_scaler, site);

                let mut parent = vec![0.0; self.rate_cats * np];
                let mut site_max = 0.0_f64;
                for cat in 0..self.rate_cats {
                    self.child_partial(op.child1_clv, site, cat, &mut c1);
                    self.child_partial(op.child2_clv, site, cat, &mut c2);
                    let m1 = &self.pmatrices[op.child1_matrix][cat * (n * np)..];
                    let m2 = &self.pmatrices[op.child2_matrix][cat * (n * np)..];

                    for state in 0..n {
                        let mut sum1 = 0.0;
                        let mut sum2 = 0.0;
                        for x in 0..n {
                            sum1 += m1[state * np + x] * c1[x];
                            sum2 += m2[state * np + x] * c2[x];
                        }
                        let value = sum1 * sum2;
                        parent[cat * np + state] = value;
                        site_max = site_max.max(value);
                    }
                }

                let mut count = inherited;
                if site_max < SCALE_THRESHOLD && site_max > 0.0 {
                    for value in &mut parent {
                        *value *= SCALE_FACTOR;
                    }
                    count += 1;
                }
                if let Some(scaler) = op.parent_scaler {
                    self.scalers[scaler][site] = count;
                }

                let clv = self.clvs[op.parent_clv]
                    .as_mut()
                    .unwrap_or_else(|| unreachable!("parent CLV storage missing"));
                let base = site * self.rate_cats * np;
                clv[base..base + self.rate_cats * np].copy_from_slice(&parent);
            }
        }
    }

    /// Log-likelihood of the edge between two CLV-or-tip positions, with
    /// the transition matrix of that edge on the `child` side.
    ///
    /// When `per_site_out` is given it is filled with the per-site
    /// log-likelihoods of the current view (unweighted).
    #[allow(clippy::too_many_arguments)]
    pub fn edge_loglikelihood(
        &self,
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix: usize,
        mut per_site_out: Option<&mut Vec<f64>>,
    ) -> f64 {
        let n = self.states;
        let np = self.states_padded;
        let model = &self.params.model;
        let freqs = &model.frequencies;
        let view = self.view;
        let mut parent = vec![0.0; n];
        let mut child = vec![0.0; n];

        if let Some(out) = per_site_out.as_deref_mut() {
            out.clear();
            out.resize(view.span, 0.0);
        }

        let mut total = 0.0;
        for site in view.begin..view.end() {
            let mut site_lk = 0.0;
            for (cat, &weight) in model.category_weights.iter().enumerate() {
                self.child_partial(parent_clv, site, cat, &mut parent);
                self.child_partial(child_clv, site, cat, &mut child);
                let pmat = &self.pmatrices[matrix][cat * (n * np)..];

                let mut cat_lk = 0.0;
                for i in 0..n {
                    let mut inner = 0.0;
                    for j in 0..n {
                        inner += pmat[i * np + j] * child[j];
                    }
                    cat_lk += freqs[i] * parent[i] * inner;
                }
                site_lk += weight * cat_lk;
            }

            if model.prop_invar > 0.0 {
                let inv_state = self.params.invariant[site];
                let inv_lk = if inv_state >= 0 {
                    freqs[inv_state as usize]
                } else {
                    0.0
                };
                site_lk = site_lk * (1.0 - model.prop_invar) + model.prop_invar * inv_lk;
            }

            let counts = self.scale_count(parent_scaler, site) + self.scale_count(child_scaler, site);
            let site_logl = if site_lk > 0.0 {
                site_lk.ln() - f64::from(counts) * LOG_SCALE_FACTOR
            } else {
                f64::NEG_INFINITY
            };

            if let Some(out) = per_site_out.as_deref_mut() {
                out[site - view.begin] = site_logl;
            }
            total += f64::from(self.params.pattern_weights[site]) * site_logl;
        }
        total
    }
}
