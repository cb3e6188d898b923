//! The inverse mapping: a small feed-forward network from latent
//! coordinates back to full-dimensional presets.
//!
//! Neither forward reduction admits a closed-form inverse for arbitrary
//! latent queries, so the network is fit on (latent, original) pairs no
//! matter which reduction produced them.

mod activation;
mod dense;

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{CubeError, Result};
use crate::optimization::{Adam, Optimizer};
use crate::training::JobContext;

pub(crate) use activation::Activation;
use dense::Dense;

/// Bounds for one inverse-model fit.
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Full passes over the training pairs.
    pub passes: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            passes: 200,
            batch_size: 32,
            learning_rate: 1e-3,
        }
    }
}

/// How often a fit reports progress, in passes.
const REPORT_EVERY: usize = 25;

/// A deterministic latent -> preset function approximator.
///
/// All weights and biases live in one flat buffer, viewed per layer, so
/// the whole model moves through export/import as a single slice.
#[derive(Debug, Clone)]
pub struct InverseRegressor {
    layers: Vec<Dense>,
    params: Vec<f32>,
}

impl InverseRegressor {
    /// Builds an untrained network `latent -> hidden -> hidden -> sample`
    /// with tanh hidden units and a linear output.
    ///
    /// # Arguments
    /// * `latent_dims` - Input width.
    /// * `sample_dims` - Output width.
    /// * `hidden` - Width of both hidden layers.
    /// * `rng` - Source for the weight initialization.
    pub fn new(latent_dims: usize, sample_dims: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let layers = vec![
            Dense::new(latent_dims, hidden, Activation::Tanh),
            Dense::new(hidden, hidden, Activation::Tanh),
            Dense::new(hidden, sample_dims, Activation::Identity),
        ];

        let mut params = Vec::with_capacity(layers.iter().map(Dense::size).sum());
        for layer in &layers {
            let std = (1.0 / layer.inputs() as f32).sqrt();
            let dist = Normal::new(0.0, std).unwrap();
            let w_size = layer.size() - layer.outputs();
            params.extend((0..w_size).map(|_| dist.sample(rng)));
            params.extend(std::iter::repeat(0.0).take(layer.outputs()));
        }

        Self { layers, params }
    }

    /// Rebuilds a network from exported layer sizes and parameters.
    ///
    /// Activations are implied by position: tanh on every layer but the
    /// last, identity on the last.
    pub(crate) fn from_parts(dims: &[(usize, usize)], params: Vec<f32>) -> Result<Self> {
        if dims.is_empty() {
            return Err(CubeError::Serialization("no layers in payload".into()));
        }

        let last = dims.len() - 1;
        let layers: Vec<Dense> = dims
            .iter()
            .enumerate()
            .map(|(i, &(inputs, outputs))| {
                let act = if i == last { Activation::Identity } else { Activation::Tanh };
                Dense::new(inputs, outputs, act)
            })
            .collect();

        for pair in layers.windows(2) {
            if pair[0].outputs() != pair[1].inputs() {
                return Err(CubeError::Serialization("layer sizes do not chain".into()));
            }
        }

        let expected: usize = layers.iter().map(Dense::size).sum();
        if params.len() != expected {
            return Err(CubeError::Serialization(format!(
                "parameter count {} does not match layer sizes (expected {})",
                params.len(),
                expected
            )));
        }

        Ok(Self { layers, params })
    }

    pub fn latent_dims(&self) -> usize {
        self.layers.first().unwrap().inputs()
    }

    pub fn sample_dims(&self) -> usize {
        self.layers.last().unwrap().outputs()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        self.layers
            .iter()
            .map(|layer| (layer.inputs(), layer.outputs()))
            .collect()
    }

    /// Evaluates the network on one latent vector.
    ///
    /// Deterministic: the same input against the same parameters always
    /// produces the same output.
    pub fn predict(&self, latent: &[f32]) -> Vec<f32> {
        debug_assert_eq!(latent.len(), self.latent_dims());

        let x = ArrayView2::from_shape((1, latent.len()), latent).unwrap();
        let mut a = x.to_owned();
        let mut offset = 0;

        for layer in &self.layers {
            let size = layer.size();
            let (_, out) = layer.forward(&self.params[offset..offset + size], a.view());
            a = out;
            offset += size;
        }

        a.row(0).to_vec()
    }

    /// Fits the network to (latent, preset) pairs by minimizing mean
    /// squared reconstruction error with Adam.
    ///
    /// The cancel flag is observed once per pass; a cancelled fit returns
    /// `CubeError::Cancelled` and leaves the parameters mid-flight (the
    /// caller discards the model in that case).
    ///
    /// # Arguments
    /// * `inputs` - N x L standardized latent coordinates.
    /// * `targets` - N x D original presets, row-paired with `inputs`.
    ///
    /// # Returns
    /// The mean loss of the final pass.
    pub fn fit(
        &mut self,
        inputs: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        opts: &FitOptions,
        rng: &mut StdRng,
        ctx: &JobContext,
    ) -> Result<f32> {
        debug_assert_eq!(inputs.nrows(), targets.nrows());
        debug_assert_eq!(inputs.ncols(), self.latent_dims());
        debug_assert_eq!(targets.ncols(), self.sample_dims());

        let n = inputs.nrows();
        let batch = opts.batch_size.max(1).min(n);
        let mut adam = Adam::new(self.params.len(), opts.learning_rate);
        let mut grad = vec![0.0; self.params.len()];
        let mut order: Vec<usize> = (0..n).collect();
        let mut last_loss = f32::INFINITY;

        for pass in 0..opts.passes {
            if ctx.cancelled() {
                return Err(CubeError::Cancelled);
            }

            order.shuffle(rng);
            let mut pass_loss = 0.0;
            let mut batches = 0;

            for chunk in order.chunks(batch) {
                let x = inputs.select(Axis(0), chunk);
                let y = targets.select(Axis(0), chunk);

                pass_loss += self.step(&mut adam, &mut grad, x.view(), y.view());
                batches += 1;
            }

            last_loss = pass_loss / batches as f32;

            if (pass + 1) % REPORT_EVERY == 0 || pass + 1 == opts.passes {
                ctx.post(format!(
                    "inverse model training pass {} of {} (mse {:.6})",
                    pass + 1,
                    opts.passes,
                    last_loss
                ));
            }
        }

        Ok(last_loss)
    }

    /// One forward/backward/update step over a batch. Returns the batch loss.
    fn step(
        &mut self,
        adam: &mut Adam,
        grad: &mut [f32],
        x: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> f32 {
        // Forward, keeping each layer's input and pre-activation for the
        // backward sweep.
        let mut caches: Vec<(Array2<f32>, Array2<f32>)> = Vec::with_capacity(self.layers.len());
        let mut a = x.to_owned();
        let mut offset = 0;

        for layer in &self.layers {
            let size = layer.size();
            let (z, out) = layer.forward(&self.params[offset..offset + size], a.view());
            caches.push((a, z));
            a = out;
            offset += size;
        }

        let diff = &a - &y;
        let loss = diff.mapv(|v| v * v).mean().unwrap_or_default();

        // Backward in reverse layer order over the same flat offsets.
        let mut d = diff * (2.0 / a.len() as f32);
        for (layer, (x_in, z)) in self.layers.iter().zip(&caches).rev() {
            let size = layer.size();
            offset -= size;
            let params = &self.params[offset..offset + size];
            let grad_slice = &mut grad[offset..offset + size];
            d = layer.backward(params, grad_slice, x_in.view(), z.view(), d);
        }

        adam.update_params(grad, &mut self.params);
        loss
    }
}

/// Fills `out` with a standard-normal draw scaled by `scale`.
pub(crate) fn random_array(
    shape: (usize, usize),
    scale: f32,
    rng: &mut impl Rng,
) -> Array2<f32> {
    let dist = Normal::new(0.0, scale).unwrap();
    Array2::from_shape_fn(shape, |_| dist.sample(rng))
}
