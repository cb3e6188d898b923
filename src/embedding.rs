//! Iterative low-dimensional embedding of the affinity structure.
//!
//! Minimizes the divergence between the high-dimensional affinities and a
//! Student-t kernel in latent space by gradient descent with momentum and
//! per-parameter gains. An early-exaggeration phase scales the affinities
//! up for the first quarter of the budget so clusters separate before the
//! layout settles.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;

use crate::error::{CubeError, Result};
use crate::net::random_array;
use crate::training::JobContext;

/// Affinity scale during the early phase.
const EXAGGERATION: f32 = 4.0;

/// Momentum before and after the early phase.
const INITIAL_MOMENTUM: f32 = 0.5;
const FINAL_MOMENTUM: f32 = 0.8;

/// Floor for the per-parameter gains.
const MIN_GAIN: f32 = 0.01;

/// Floor for latent similarities inside the divergence report.
const Q_MIN: f32 = 1e-12;

/// Iterations between queued progress reports.
const REPORT_EVERY: usize = 50;

/// Gradient-descent embedder over a fixed affinity matrix.
#[derive(Debug, Clone)]
pub struct NonlinearEmbedder {
    iters: usize,
    learning_rate: f32,
}

impl NonlinearEmbedder {
    pub fn new(iters: usize, learning_rate: f32) -> Self {
        Self {
            iters,
            learning_rate,
        }
    }

    /// Optimizes an N x L embedding against `affinities` (N x N, joint,
    /// symmetric).
    ///
    /// The cancel flag is observed once per iteration; a cancelled run
    /// returns `CubeError::Cancelled` and the partial embedding is
    /// discarded by the caller.
    pub fn fit(
        &self,
        affinities: ArrayView2<f32>,
        latent_dims: usize,
        rng: &mut StdRng,
        ctx: &JobContext,
    ) -> Result<Array2<f32>> {
        let n = affinities.nrows();
        debug_assert_eq!(n, affinities.ncols());

        let exaggeration_end = self.iters / 4;
        let momentum_switch = self.iters / 4;

        let mut y = random_array((n, latent_dims), 1e-4, rng);
        let mut velocity = Array2::<f32>::zeros((n, latent_dims));
        let mut gains = Array2::<f32>::ones((n, latent_dims));
        let mut num = Array2::<f32>::zeros((n, n));
        let mut grad = Array2::<f32>::zeros((n, latent_dims));

        for it in 0..self.iters {
            if ctx.cancelled() {
                return Err(CubeError::Cancelled);
            }

            let exaggeration = if it < exaggeration_end { EXAGGERATION } else { 1.0 };
            let momentum = if it < momentum_switch {
                INITIAL_MOMENTUM
            } else {
                FINAL_MOMENTUM
            };

            let inv_sum = student_t_numerators(y.view(), &mut num);
            gradient(
                affinities.view(),
                num.view(),
                inv_sum,
                exaggeration,
                y.view(),
                &mut grad,
            );

            // Gains grow where the gradient flips against the velocity and
            // shrink where both agree, then the momentum step applies.
            Zip::from(&mut gains)
                .and(&velocity)
                .and(&grad)
                .for_each(|g, &v, &dg| {
                    *g = if (dg > 0.0) == (v > 0.0) { *g * 0.8 } else { *g + 0.2 };
                    if *g < MIN_GAIN {
                        *g = MIN_GAIN;
                    }
                });

            let lr = self.learning_rate;
            Zip::from(&mut velocity)
                .and(&gains)
                .and(&grad)
                .for_each(|v, &g, &dg| *v = momentum * *v - lr * g * dg);
            y += &velocity;

            // Keep the embedding centered so it cannot drift.
            let mean = y.mean_axis(Axis(0)).unwrap();
            y -= &mean;

            if (it + 1) % REPORT_EVERY == 0 || it + 1 == self.iters {
                let err = kl_divergence(affinities.view(), num.view(), inv_sum);
                ctx.post(format!(
                    "embedding iteration {} of {} (error {:.4})",
                    it + 1,
                    self.iters,
                    err
                ));
            }
        }

        Ok(y)
    }
}

/// Fills `num` with the unnormalized Student-t similarities
/// `1 / (1 + ||y_i - y_j||^2)` (zero diagonal) and returns `1 / sum`.
fn student_t_numerators(y: ArrayView2<f32>, num: &mut Array2<f32>) -> f32 {
    let n = y.nrows();

    num.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let yi = y.row(i);
            for (j, v) in row.iter_mut().enumerate() {
                if i == j {
                    *v = 0.0;
                    continue;
                }
                let mut d2 = 0.0;
                for k in 0..y.ncols() {
                    let diff = yi[k] - y[[j, k]];
                    d2 += diff * diff;
                }
                *v = 1.0 / (1.0 + d2);
            }
        });

    let sum: f32 = num.sum();
    if sum > 0.0 {
        1.0 / sum
    } else {
        0.0
    }
}

/// Writes the divergence gradient for every point into `grad`.
fn gradient(
    p: ArrayView2<f32>,
    num: ArrayView2<f32>,
    inv_sum: f32,
    exaggeration: f32,
    y: ArrayView2<f32>,
    grad: &mut Array2<f32>,
) {
    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut g)| {
            g.fill(0.0);
            let yi = y.row(i);
            for j in 0..y.nrows() {
                if i == j {
                    continue;
                }
                let q = num[[i, j]] * inv_sum;
                let mult = 4.0 * (exaggeration * p[[i, j]] - q) * num[[i, j]];
                for k in 0..y.ncols() {
                    g[k] += mult * (yi[k] - y[[j, k]]);
                }
            }
        });
}

/// KL divergence between the affinities and the current latent kernel.
fn kl_divergence(p: ArrayView2<f32>, num: ArrayView2<f32>, inv_sum: f32) -> f32 {
    let mut kl = 0.0;
    for (pv, nv) in p.iter().zip(num.iter()) {
        let q = (nv * inv_sum).max(Q_MIN);
        if *pv > 0.0 {
            kl += pv * (pv / q).ln();
        }
    }
    kl
}
