//! Linear reduction path: whitening plus an independence-maximizing
//! rotation, producing an L x D projection with an exact linear forward
//! map (the inverse is still learned, since the projection is not
//! invertible off the data manifold).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::error::{CubeError, Result};
use crate::training::JobContext;

/// Iteration budget per independent component.
const MAX_COMPONENT_ITERS: usize = 200;

/// Convergence tolerance on successive direction estimates.
const DIRECTION_TOL: f32 = 1e-4;

/// Eigenvalues below this fraction of the largest count as degenerate.
/// The covariance is accumulated in f32, so rank deficiency shows up as
/// eigenvalues around machine epsilon times the leading one.
const EIGEN_RATIO_FLOOR: f64 = 1e-6;

/// A fitted linear forward map: `latent = projection * (x - mean)`.
#[derive(Debug, Clone)]
pub struct LinearProjector {
    projection: Array2<f32>,
    mean: Array1<f32>,
}

impl LinearProjector {
    pub(crate) fn from_parts(projection: Array2<f32>, mean: Array1<f32>) -> Self {
        Self { projection, mean }
    }

    /// The L x D projection matrix.
    pub fn projection(&self) -> ArrayView2<'_, f32> {
        self.projection.view()
    }

    /// Per-feature means subtracted before projecting.
    pub fn mean(&self) -> ArrayView1<'_, f32> {
        self.mean.view()
    }

    pub fn latent_dims(&self) -> usize {
        self.projection.nrows()
    }

    pub fn sample_dims(&self) -> usize {
        self.projection.ncols()
    }

    /// Projects one preset into latent space.
    pub fn project(&self, sample: &[f32]) -> Vec<f32> {
        debug_assert_eq!(sample.len(), self.sample_dims());

        let x = ArrayView1::from(sample);
        let centered = &x - &self.mean;
        self.projection.dot(&centered).to_vec()
    }

    /// Fits a projector to `x` (N x D) and returns it together with the
    /// N x L latent coordinates of the training samples.
    ///
    /// Fails with `InvalidParameter` when N <= D (the covariance cannot
    /// be full rank) and with a numerical error when the leading
    /// eigenvalues are degenerate — both detected before whitening.
    pub fn fit(
        x: ArrayView2<f32>,
        latent_dims: usize,
        rng: &mut StdRng,
        ctx: &JobContext,
    ) -> Result<(Self, Array2<f32>)> {
        let (n, d) = (x.nrows(), x.ncols());

        if n <= d {
            return Err(CubeError::InvalidParameter(
                "need more samples than preset dimensions for the linear method",
            ));
        }

        let mean = x.mean_axis(Axis(0)).unwrap();
        let centered = &x - &mean;
        let cov = centered.t().dot(&centered) / (n as f32 - 1.0);

        let (eigvals, eigvecs) = symmetric_eigen(cov.view());

        let lead = eigvals[0];
        if lead <= 0.0 {
            return Err(CubeError::Numerical("covariance is singular"));
        }
        for &ev in eigvals.iter().take(latent_dims) {
            if ev < EIGEN_RATIO_FLOOR * lead {
                return Err(CubeError::Numerical("covariance is singular"));
            }
        }

        // Whitening onto the top-L principal directions: row l of K is
        // eigvec_l / sqrt(lambda_l), so z = centered * K^T has identity
        // covariance.
        let mut whitener = Array2::<f32>::zeros((latent_dims, d));
        for l in 0..latent_dims {
            let scale = (eigvals[l] as f32).sqrt().recip();
            for j in 0..d {
                whitener[[l, j]] = eigvecs[[j, l]] as f32 * scale;
            }
        }
        let z = centered.dot(&whitener.t());

        let rotation = independent_rotation(z.view(), latent_dims, rng, ctx)?;

        let projection = rotation.dot(&whitener);
        let latent = z.dot(&rotation.t());

        Ok((Self { projection, mean }, latent))
    }
}

/// Deflation search for an orthonormal L x L rotation whose rows maximize
/// non-Gaussianity of the whitened data (tanh contrast).
fn independent_rotation(
    z: ArrayView2<f32>,
    latent_dims: usize,
    rng: &mut StdRng,
    ctx: &JobContext,
) -> Result<Array2<f32>> {
    let n = z.nrows() as f32;
    let dist = Normal::new(0.0_f32, 1.0).unwrap();
    let mut rotation = Array2::<f32>::zeros((latent_dims, latent_dims));

    for comp in 0..latent_dims {
        if ctx.cancelled() {
            return Err(CubeError::Cancelled);
        }

        let mut w = Array1::from_shape_fn(latent_dims, |_| dist.sample(rng));
        normalize(&mut w);

        let mut converged = false;
        for _ in 0..MAX_COMPONENT_ITERS {
            let wx = z.dot(&w);
            let g = wx.mapv(f32::tanh);
            let g_prime_mean = wx.mapv(|v| 1.0 - v.tanh().powi(2)).mean().unwrap();

            let mut w_new = z.t().dot(&g) / n - &(&w * g_prime_mean);

            // Deflate against the components already found.
            for prev in 0..comp {
                let overlap = w_new.dot(&rotation.row(prev));
                w_new = w_new - &(&rotation.row(prev) * overlap);
            }
            normalize(&mut w_new);

            let agreement = w_new.dot(&w).abs();
            let done = (1.0 - agreement) < DIRECTION_TOL;
            w = w_new;
            if done {
                converged = true;
                break;
            }
        }

        if !converged {
            ctx.post(format!(
                "independence search stopped at the iteration bound for component {comp}"
            ));
        }

        rotation.row_mut(comp).assign(&w);
    }

    Ok(rotation)
}

fn normalize(v: &mut Array1<f32>) {
    let norm = v.mapv(|x| x * x).sum().sqrt();
    if norm > 0.0 {
        *v /= norm;
    }
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching eigenvectors
/// as columns. Runs in f64 regardless of the engine precision; the
/// whitening scales amplify any eigenvalue error by 1/sqrt(lambda).
fn symmetric_eigen(m: ArrayView2<f32>) -> (Array1<f64>, Array2<f64>) {
    let d = m.nrows();
    let mut a = m.mapv(|v| v as f64);
    let mut v = Array2::<f64>::eye(d);

    const MAX_SWEEPS: usize = 100;
    const OFF_TOL: f64 = 1e-14;

    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..d {
            for q in (p + 1)..d {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off < OFF_TOL {
            break;
        }

        for p in 0..d.saturating_sub(1) {
            for q in (p + 1)..d {
                if a[[p, q]].abs() < OFF_TOL {
                    continue;
                }

                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..d {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..d {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..d {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    // Sort by descending eigenvalue, carrying the eigenvector columns.
    let mut order: Vec<usize> = (0..d).collect();
    order.sort_by(|&i, &j| a[[j, j]].partial_cmp(&a[[i, i]]).unwrap());

    let eigvals = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let mut eigvecs = Array2::<f64>::zeros((d, d));
    for (dst, &src) in order.iter().enumerate() {
        for k in 0..d {
            eigvecs[[k, dst]] = v[[k, src]];
        }
    }

    (eigvals, eigvecs)
}
