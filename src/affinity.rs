//! Pairwise similarity structure among high-dimensional presets.
//!
//! Each point gets its own Gaussian kernel bandwidth, found by binary
//! search so the entropy of its conditional neighbor distribution matches
//! the target perplexity. The conditional rows are then symmetrized into
//! the joint affinities consumed by the embedder.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{CubeError, Result};
use crate::training::JobContext;

/// The search needs this many samples per unit of perplexity to make the
/// target neighborhood size reachable.
const MIN_SAMPLES_PER_PERPLEXITY: f32 = 3.0;

/// Bandwidth binary-search budget per point.
const MAX_SEARCH_STEPS: usize = 50;

/// Entropy tolerance for accepting a bandwidth.
const ENTROPY_TOL: f32 = 1e-5;

/// Floor applied to the symmetrized affinities.
const P_MIN: f32 = 1e-12;

/// Computes symmetrized Gaussian affinities for `x` (N x D).
///
/// Rows of the conditional matrix sum to 1 before symmetrization; the
/// returned joint matrix is symmetric, non-negative and sums to 1 overall.
///
/// Fails with `InvalidParameter` before any search begins when N is too
/// small relative to the perplexity target.
pub fn gaussian_affinities(
    x: ArrayView2<f32>,
    perplexity: f32,
    ctx: &JobContext,
) -> Result<Array2<f32>> {
    let n = x.nrows();

    if !(perplexity > 0.0) {
        return Err(CubeError::InvalidParameter("perplexity must be positive"));
    }
    if (n as f32) < MIN_SAMPLES_PER_PERPLEXITY * perplexity {
        return Err(CubeError::InvalidParameter(
            "too few samples for the perplexity target",
        ));
    }

    let d2 = squared_distances(x);
    let target_entropy = perplexity.ln();

    let mut p = Array2::<f32>::zeros((n, n));
    p.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let converged = calibrate_row(d2.view(), i, target_entropy, &mut row);
            if !converged {
                ctx.post(format!("perplexity search adjusted for point {i}"));
            }
        });

    // Joint affinities: p = (p + p^T) / 2n, floored away from zero so the
    // divergence gradient stays finite.
    let p_t = p.t().to_owned();
    p += &p_t;
    p.mapv_inplace(|v| (v / (2.0 * n as f32)).max(P_MIN));

    Ok(p)
}

/// Pairwise squared Euclidean distances via the Gram matrix.
fn squared_distances(x: ArrayView2<f32>) -> Array2<f32> {
    let n = x.nrows();
    let gram = x.dot(&x.t());

    let mut d2 = Array2::<f32>::zeros((n, n));
    d2.as_slice_mut()
        .unwrap()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (gram[[i, i]] + gram[[j, j]] - 2.0 * gram[[i, j]]).max(0.0);
            }
        });
    d2
}

/// Binary search for point `i`'s kernel precision; writes the normalized
/// conditional distribution into `row`. Returns whether the entropy
/// matched the target within tolerance.
fn calibrate_row(
    d2: ArrayView2<f32>,
    i: usize,
    target_entropy: f32,
    row: &mut ndarray::ArrayViewMut1<f32>,
) -> bool {
    let n = d2.nrows();
    let mut beta = 1.0_f32;
    let mut beta_min = f32::NEG_INFINITY;
    let mut beta_max = f32::INFINITY;
    let mut converged = false;

    for _ in 0..MAX_SEARCH_STEPS {
        let (entropy, sum) = row_entropy(d2.view(), i, beta, row);

        let diff = entropy - target_entropy;
        if diff.abs() < ENTROPY_TOL && sum > 0.0 {
            converged = true;
            break;
        }

        if diff > 0.0 {
            // Distribution too wide: sharpen the kernel.
            beta_min = beta;
            beta = if beta_max.is_finite() {
                (beta + beta_max) / 2.0
            } else {
                beta * 2.0
            };
        } else {
            beta_max = beta;
            beta = if beta_min.is_finite() {
                (beta + beta_min) / 2.0
            } else {
                beta / 2.0
            };
        }
    }

    // Normalize the final kernel into a conditional distribution.
    let (_, sum) = row_entropy(d2.view(), i, beta, row);
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    } else {
        // Degenerate geometry (all neighbors at the same spot): fall back
        // to a uniform neighborhood.
        let uniform = 1.0 / (n - 1) as f32;
        for (j, v) in row.iter_mut().enumerate() {
            *v = if j == i { 0.0 } else { uniform };
        }
    }

    converged
}

/// Writes the unnormalized kernel row for precision `beta` and returns its
/// Shannon entropy and normalizer.
fn row_entropy(
    d2: ArrayView2<f32>,
    i: usize,
    beta: f32,
    row: &mut ndarray::ArrayViewMut1<f32>,
) -> (f32, f32) {
    let mut sum = 0.0_f32;
    let mut weighted = 0.0_f32;

    for (j, v) in row.iter_mut().enumerate() {
        if j == i {
            *v = 0.0;
            continue;
        }
        let w = (-d2[[i, j]] * beta).exp();
        *v = w;
        sum += w;
        weighted += d2[[i, j]] * w;
    }

    if sum <= 0.0 {
        return (f32::NEG_INFINITY, 0.0);
    }

    (sum.ln() + beta * weighted / sum, sum)
}
