// SPDX-License-Identifier: AGPL-3.0-or-later
//! GTR-family substitution model and its eigen decomposition.
//!
//! Holds the exchangeability rates, stationary frequencies, discrete rate
//! categories and invariant-site proportion of a time-reversible model,
//! plus the eigen system of the normalised instantaneous rate matrix. The
//! CLV engine turns the eigen system into transition probability matrices
//! per branch length (`P(t) = E · diag(exp(λᵢ t)) · E⁻¹`).
//!
//! A reversible rate matrix `Q` becomes symmetric under the similarity
//! transform `B = diag(√π) · Q · diag(1/√π)`, so the decomposition reduces
//! to a symmetric eigenproblem solved by cyclic Jacobi rotations.
//!
//! # References
//!
//! - Tavaré 1986, *Lectures Math. Life Sci.* 17:57-86 (GTR)
//! - Yang 1994, *J Mol Evol* 39:306-314 (discrete Γ rates)

use std::fmt;

use crate::error::{Error, Result};

/// Time-reversible substitution model description.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstModel {
    /// Number of character states (4 for DNA, 20 for protein).
    pub states: usize,
    /// Upper-triangle exchangeability rates, `states·(states-1)/2` values
    /// in row order (AC, AG, AT, CG, CT, GT for DNA).
    pub subst_rates: Vec<f64>,
    /// Stationary state frequencies, summing to 1.
    pub frequencies: Vec<f64>,
    /// Relative rate of each discrete rate category.
    pub category_rates: Vec<f64>,
    /// Weight of each rate category, summing to 1.
    pub category_weights: Vec<f64>,
    /// Proportion of invariant sites in `[0, 1)`.
    pub prop_invar: f64,
    /// Γ shape parameter the category rates were discretised from.
    pub alpha: f64,
}

/// Eigen system of the normalised rate matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomp {
    /// Eigenvalues of `Q`, one per state.
    pub eigenvals: Vec<f64>,
    /// Right eigenvectors, row-major `states × states`; column `k` pairs
    /// with `eigenvals[k]`.
    pub eigenvecs: Vec<f64>,
    /// Inverse of the eigenvector matrix, row-major.
    pub inv_eigenvecs: Vec<f64>,
}

impl SubstModel {
    /// General time-reversible model.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] on dimension mismatches, non-positive
    /// frequencies, or weights that do not sum to 1.
    pub fn gtr(
        subst_rates: Vec<f64>,
        frequencies: Vec<f64>,
        category_rates: Vec<f64>,
        category_weights: Vec<f64>,
        prop_invar: f64,
        alpha: f64,
    ) -> Result<Self> {
        let states = frequencies.len();
        let expected_rates = states * (states - 1) / 2;
        if subst_rates.len() != expected_rates {
            return Err(Error::InvalidInput(format!(
                "{} exchangeability rates given, {} states need {}",
                subst_rates.len(),
                states,
                expected_rates
            )));
        }
        if frequencies.iter().any(|&f| f <= 0.0) {
            return Err(Error::InvalidInput(String::from(
                "stationary frequencies must be positive",
            )));
        }
        let freq_sum: f64 = frequencies.iter().sum();
        if (freq_sum - 1.0).abs() > 1e-6 {
            return Err(Error::InvalidInput(format!(
                "stationary frequencies sum to {freq_sum}, expected 1"
            )));
        }
        if category_rates.is_empty() || category_rates.len() != category_weights.len() {
            return Err(Error::InvalidInput(String::from(
                "rate category rates and weights must be non-empty and equal length",
            )));
        }
        let weight_sum: f64 = category_weights.iter().sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(Error::InvalidInput(format!(
                "category weights sum to {weight_sum}, expected 1"
            )));
        }
        if !(0.0..1.0).contains(&prop_invar) {
            return Err(Error::InvalidInput(format!(
                "proportion of invariant sites {prop_invar} outside [0, 1)"
            )));
        }
        Ok(Self {
            states,
            subst_rates,
            frequencies,
            category_rates,
            category_weights,
            prop_invar,
            alpha,
        })
    }

    /// Jukes-Cantor model: equal rates, equal frequencies, one rate
    /// category. The usual starting point for nucleotide placement.
    #[must_use]
    pub fn jc69() -> Self {
        Self {
            states: 4,
            subst_rates: vec![1.0; 6],
            frequencies: vec![0.25; 4],
            category_rates: vec![1.0],
            category_weights: vec![1.0],
            prop_invar: 0.0,
            alpha: 1.0,
        }
    }

    /// Number of discrete rate categories.
    #[must_use]
    pub fn rate_cats(&self) -> usize {
        self.category_rates.len()
    }

    /// Normalised instantaneous rate matrix, row-major, with mean
    /// substitution rate 1 at stationarity.
    #[must_use]
    pub fn rate_matrix(&self) -> Vec<f64> {
        let n = self.states;
        let mut q = vec![0.0; n * n];

        let mut pair = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                let rate = self.subst_rates[pair];
                pair += 1;
                q[i * n + j] = rate * self.frequencies[j];
                q[j * n + i] = rate * self.frequencies[i];
            }
        }
        for i in 0..n {
            let off: f64 = (0..n).filter(|&j| j != i).map(|j| q[i * n + j]).sum();
            q[i * n + i] = -off;
        }

        // scale so that -Σ πᵢ qᵢᵢ = 1
        let mean_rate: f64 = (0..n).map(|i| -self.frequencies[i] * q[i * n + i]).sum();
        if mean_rate > 0.0 {
            for entry in &mut q {
                *entry /= mean_rate;
            }
        }
        q
    }

    /// Eigen decomposition of the normalised rate matrix.
    ///
    /// Symmetrises `Q` with the stationary frequencies, runs Jacobi, and
    /// maps the orthonormal eigenvectors back to eigenvectors of `Q`.
    #[must_use]
    pub fn eigen(&self) -> EigenDecomp {
        let n = self.states;
        let q = self.rate_matrix();

        let sqrt_pi: Vec<f64> = self.frequencies.iter().map(|&f| f.sqrt()).collect();
        let mut b = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                b[i * n + j] = sqrt_pi[i] * q[i * n + j] / sqrt_pi[j];
            }
        }

        let (eigenvals, v) = jacobi_symmetric(&b, n);

        // E = diag(1/√π)·V,  E⁻¹ = Vᵀ·diag(√π)
        let mut eigenvecs = vec![0.0; n * n];
        let mut inv_eigenvecs = vec![0.0; n * n];
        for i in 0..n {
            for k in 0..n {
                eigenvecs[i * n + k] = v[i * n + k] / sqrt_pi[i];
                inv_eigenvecs[k * n + i] = v[i * n + k] * sqrt_pi[i];
            }
        }

        EigenDecomp {
            eigenvals,
            eigenvecs,
            inv_eigenvecs,
        }
    }
}

impl fmt::Display for SubstModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Substitution Rates:")?;
        let rates: Vec<String> = self.subst_rates.iter().map(|r| format!("{r:.4}")).collect();
        writeln!(f, "  {}", rates.join(" "))?;
        writeln!(f, "Base Frequencies:")?;
        let freqs: Vec<String> = self.frequencies.iter().map(|p| format!("{p:.4}")).collect();
        writeln!(f, "  {}", freqs.join(" "))?;
        writeln!(f, "Rate Categories: {}", self.rate_cats())?;
        writeln!(f, "Alpha: {:.4}", self.alpha)?;
        write!(f, "P-invar: {:.4}", self.prop_invar)
    }
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
///
/// Returns (eigenvalues, eigenvectors), eigenvectors row-major with
/// column `k` belonging to eigenvalue `k`. Convergence when the squared
/// off-diagonal mass drops below `1e-24`; the state space is at most 20,
/// so a handful of sweeps suffices.
#[allow(clippy::many_single_char_names)] // standard notation: a=matrix, v=eigvecs, t/c/s=Givens
fn jacobi_symmetric(matrix: &[f64], n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut a = matrix.to_vec();
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }

    for _sweep in 0..(100 * n) {
        let mut off_diag = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                off_diag += a[i * n + j] * a[i * n + j];
            }
        }
        if off_diag < 1e-24 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq.abs() < 1e-18 {
                    continue;
                }

                let app = a[p * n + p];
                let aqq = a[q * n + q];
                let tau = (aqq - app) / (2.0 * apq);
                let t = if tau.abs() > 1e15 {
                    1.0 / (2.0 * tau)
                } else {
                    let sign = if tau >= 0.0 { 1.0 } else { -1.0 };
                    sign / (tau.abs() + tau.mul_add(tau, 1.0).sqrt())
                };

                let c = 1.0 / t.mul_add(t, 1.0).sqrt();
                let s = t * c;

                a[p * n + p] = t.mul_add(-apq, app);
                a[q * n + q] = t.mul_add(apq, aqq);
                a[p * n + q] = 0.0;
                a[q * n + p] = 0.0;

                for r in 0..n {
                    if r != p && r != q {
                        let arp = a[r * n + p];
                        let arq = a[r * n + q];
                        a[r * n + p] = c.mul_add(arp, -s * arq);
                        a[p * n + r] = a[r * n + p];
                        a[r * n + q] = s.mul_add(arp, c * arq);
                        a[q * n + r] = a[r * n + q];
                    }
                }

                for r in 0..n {
                    let vrp = v[r * n + p];
                    let vrq = v[r * n + q];
                    v[r * n + p] = c.mul_add(vrp, -s * vrq);
                    v[r * n + q] = s.mul_add(vrp, c * vrq);
                }
            }
        }
    }

    let eigenvalues: Vec<f64> = (0..n).map(|i| a[i * n + i]).collect();
    (eigenvalues, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct_q(model: &SubstModel) -> Vec<f64> {
        let n = model.states;
        let e = model.eigen();
        let mut q = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += e.eigenvecs[i * n + k] * e.eigenvals[k] * e.inv_eigenvecs[k * n + j];
                }
                q[i * n + j] = sum;
            }
        }
        q
    }

    #[test]
    fn jc69_rate_matrix_is_normalised() {
        let model = SubstModel::jc69();
        let q = model.rate_matrix();
        let mean: f64 = (0..4).map(|i| -model.frequencies[i] * q[i * 4 + i]).sum();
        assert!((mean - 1.0).abs() < 1e-12, "mean rate {mean}");
        for i in 0..4 {
            let row: f64 = (0..4).map(|j| q[i * 4 + j]).sum();
            assert!(row.abs() < 1e-12, "row {i} sums to {row}");
        }
    }

    #[test]
    fn eigen_reconstructs_rate_matrix() {
        let model = SubstModel::gtr(
            vec![1.2, 2.8, 0.7, 1.1, 3.4, 1.0],
            vec![0.3, 0.2, 0.25, 0.25],
            vec![1.0],
            vec![1.0],
            0.0,
            1.0,
        )
        .unwrap();
        let q = model.rate_matrix();
        let rebuilt = reconstruct_q(&model);
        for (orig, back) in q.iter().zip(&rebuilt) {
            assert!((orig - back).abs() < 1e-9, "Q entry {orig} vs {back}");
        }
    }

    #[test]
    fn one_eigenvalue_is_zero() {
        let model = SubstModel::jc69();
        let e = model.eigen();
        let near_zero = e.eigenvals.iter().filter(|v| v.abs() < 1e-9).count();
        assert_eq!(near_zero, 1, "eigenvalues {:?}", e.eigenvals);
        // the rest are negative for a proper rate matrix
        assert!(e.eigenvals.iter().all(|&v| v < 1e-9));
    }

    #[test]
    fn gtr_rejects_bad_shapes() {
        assert!(SubstModel::gtr(
            vec![1.0; 5],
            vec![0.25; 4],
            vec![1.0],
            vec![1.0],
            0.0,
            1.0
        )
        .is_err());
        assert!(SubstModel::gtr(
            vec![1.0; 6],
            vec![0.5, 0.5, 0.0, 0.0],
            vec![1.0],
            vec![1.0],
            0.0,
            1.0
        )
        .is_err());
        assert!(SubstModel::gtr(
            vec![1.0; 6],
            vec![0.25; 4],
            vec![1.0],
            vec![0.5],
            0.0,
            1.0
        )
        .is_err());
    }

    #[test]
    fn display_reports_model_summary() {
        let text = SubstModel::jc69().to_string();
        assert!(text.contains("Substitution Rates"));
        assert!(text.contains("Base Frequencies"));
        assert!(text.contains("Alpha"));
    }
}
