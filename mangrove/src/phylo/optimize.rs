// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch-length optimisation for the placement triplet.
//!
//! The three branches of a tiny tree (proximal, distal, pendant) are
//! optimised one at a time by bracketed Brent minimisation of the
//! negative edge log-likelihood, swept until the likelihood gain drops
//! below [`CONVERGENCE_EPS`] or [`MAX_SWEEPS`] is reached. The pendant
//! branch is cheap to move (only its probability matrix feeds the edge
//! likelihood); the proximal and distal branches additionally require the
//! inner CLV to be recomputed per candidate length.
//!
//! A candidate length is only accepted when it actually improves the
//! likelihood, so the sweep is monotone and termination is guaranteed.

use super::partition::{Operation, Partition};

/// Hard lower bound for any optimised branch length.
pub const BRANCH_MIN: f64 = 1e-8;

/// Hard upper bound for any optimised branch length.
pub const BRANCH_MAX: f64 = 100.0;

/// Maximum number of optimisation sweeps over the triplet.
pub const MAX_SWEEPS: usize = 8;

/// Sweep-to-sweep log-likelihood gain below which optimisation stops.
pub const CONVERGENCE_EPS: f64 = 1e-3;

/// Per-branch Brent tolerance on the length itself.
const LENGTH_TOL: f64 = 1e-4;

/// Brent iterations per branch per sweep.
const BRENT_ITER: usize = 50;

/// Index layout of a placement triplet inside its partition. The matrix
/// order is `[proximal, distal, pendant]`, matching the length vectors
/// handed to [`optimize_triplet`].
#[derive(Debug, Clone, Copy)]
pub struct Triplet {
    /// Query tip position (character array).
    pub new_tip_clv: usize,
    /// Inner (virtual root) CLV.
    pub inner_clv: usize,
    /// Inner scale buffer.
    pub inner_scaler: Option<usize>,
    /// Distal-side CLV or tip position.
    pub distal_clv: usize,
    /// Distal scale buffer, if the distal side carries one.
    pub distal_scaler: Option<usize>,
    /// Proximal-side CLV.
    pub proximal_clv: usize,
    /// Proximal scale buffer, if carried.
    pub proximal_scaler: Option<usize>,
    /// Probability matrix indices `[proximal, distal, pendant]`.
    pub matrices: [usize; 3],
}

impl Triplet {
    /// The partial-likelihood operation that points the inner CLV at the
    /// query tip.
    #[must_use]
    pub const fn inner_operation(&self) -> Operation {
        Operation {
            parent_clv: self.inner_clv,
            parent_scaler: self.inner_scaler,
            child1_clv: self.distal_clv,
            child1_scaler: self.distal_scaler,
            child1_matrix: self.matrices[1],
            child2_clv: self.proximal_clv,
            child2_scaler: self.proximal_scaler,
            child2_matrix: self.matrices[0],
        }
    }

    fn edge_logl(&self, partition: &Partition) -> f64 {
        partition.edge_loglikelihood(
            self.new_tip_clv,
            None,
            self.inner_clv,
            self.inner_scaler,
            self.matrices[2],
            None,
        )
    }
}

/// Jointly optimise the triplet branch lengths in place.
///
/// `lengths` is `[proximal, distal, pendant]` on entry and exit; the
/// partition's probability matrices and inner CLV match `lengths` on
/// return. With `sliding` each branch is searched in a window around its
/// previous value, otherwise over the full `[BRANCH_MIN, BRANCH_MAX]`
/// bracket. Returns the final log-likelihood over the partition's current
/// site view.
pub fn optimize_triplet(
    partition: &mut Partition,
    triplet: &Triplet,
    lengths: &mut [f64; 3],
    sliding: bool,
) -> f64 {
    let refresh =
        |partition: &mut Partition, branch: usize, length: f64| {
            let _ = partition.update_prob_matrices(&[triplet.matrices[branch]], &[length]);
            if branch < 2 {
                partition.update_partials(&[triplet.inner_operation()]);
            }
        };

    let mut logl = triplet.edge_logl(partition);

    for _sweep in 0..MAX_SWEEPS {
        let sweep_start = logl;
        for branch in 0..3 {
            let current = lengths[branch];
            let (lo, hi) = if sliding {
                (
                    (current / 8.0).max(BRANCH_MIN),
                    (current * 8.0).min(BRANCH_MAX),
                )
            } else {
                (BRANCH_MIN, BRANCH_MAX)
            };

            let (candidate, neg_logl) = brent_minimize(
                |t| {
                    refresh(partition, branch, t);
                    -triplet.edge_logl(partition)
                },
                lo,
                hi,
                LENGTH_TOL,
                BRENT_ITER,
            );

            if -neg_logl > logl {
                lengths[branch] = candidate;
                logl = -neg_logl;
            }
            // leave matrices and CLV in sync with the accepted length
            refresh(partition, branch, lengths[branch]);
        }

        if logl - sweep_start < CONVERGENCE_EPS {
            break;
        }
    }

    logl
}

/// Bracketed Brent minimisation without derivatives.
///
/// Returns `(argmin, min)` of `f` over `[a, b]` to within `tol` on the
/// argument.
fn brent_minimize(
    mut f: impl FnMut(f64) -> f64,
    a: f64,
    b: f64,
    tol: f64,
    max_iter: usize,
) -> (f64, f64) {
    const CGOLD: f64 = 0.381_966_011_250_105;
    const EPS: f64 = 1e-12;

    let (mut lo, mut hi) = (a.min(b), a.max(b));
    let mut x = CGOLD.mul_add(hi - lo, lo);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;
    let mut d = 0.0_f64;
    let mut e = 0.0_f64;

    for _ in 0..max_iter {
        let xm = 0.5 * (lo + hi);
        let tol1 = tol.mul_add(x.abs(), EPS);
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (hi - lo) {
            break;
        }

        let mut use_golden = true;
        if e.abs() > tol1 {
            // trial parabolic fit through x, v, w
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v).mul_add(q, -(x - w) * r);
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            e = d;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (lo - x) && p < q * (hi - x) {
                d = p / q;
                let u = x + d;
                if u - lo < tol2 || hi - u < tol2 {
                    d = if xm > x { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x >= xm { lo - x } else { hi - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u);

        if fu <= fx {
            if u >= x {
                lo = x;
            } else {
                hi = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                lo = u;
            } else {
                hi = u;
            }
            if fu <= fw || (w - x).abs() < EPS {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || (v - x).abs() < EPS || (v - w).abs() < EPS {
                v = u;
                fv = fu;
            }
        }
    }

    (x, fx)
}
