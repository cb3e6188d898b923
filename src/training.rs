//! One reduction job: forward embedding, latent standardization, inverse
//! fit. The job runs on a worker thread owned by the instance; everything
//! here communicates with the caller through the cancel flag and the
//! message queue only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::affinity::gaussian_affinities;
use crate::data::SampleSet;
use crate::embedding::NonlinearEmbedder;
use crate::error::{CubeError, Result};
use crate::messages::MessageQueue;
use crate::net::{FitOptions, InverseRegressor};
use crate::projection::LinearProjector;

/// Forward reduction strategy, chosen once per training start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Whitening plus independence rotation; exact linear forward map.
    Linear,
    /// Affinity-matched iterative embedding; no closed forward map.
    Nonlinear,
}

impl Method {
    pub(crate) fn tag(self) -> f64 {
        match self {
            Method::Linear => 0.0,
            Method::Nonlinear => 1.0,
        }
    }

    pub(crate) fn from_tag(tag: f64) -> Result<Self> {
        if tag == 0.0 {
            Ok(Method::Linear)
        } else if tag == 1.0 {
            Ok(Method::Nonlinear)
        } else {
            Err(CubeError::Serialization(format!("unknown method tag {tag}")))
        }
    }
}

/// Bounds and seeds for one reduction job.
///
/// The defaults match the sizes the engine is normally run at; tests and
/// embedding callers shrink the iteration budgets through
/// `start_training_with`.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Target effective neighborhood size for the nonlinear path.
    pub perplexity: f32,
    /// Iteration budget for the nonlinear embedder.
    pub embed_iters: usize,
    pub embed_learning_rate: f32,
    /// Width of the inverse network's hidden layers.
    pub hidden: usize,
    /// Inverse-fit bounds.
    pub fit: FitOptions,
    /// Seed for every stochastic step of the job.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            embed_iters: 300,
            embed_learning_rate: 200.0,
            hidden: 64,
            fit: FitOptions::default(),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.perplexity > 0.0) {
            return Err(CubeError::InvalidParameter("perplexity must be positive"));
        }
        if self.embed_iters == 0 {
            return Err(CubeError::InvalidParameter("embedding needs at least one iteration"));
        }
        if !(self.embed_learning_rate > 0.0) || !(self.fit.learning_rate > 0.0) {
            return Err(CubeError::InvalidParameter("learning rates must be positive"));
        }
        if self.hidden == 0 {
            return Err(CubeError::InvalidParameter("hidden width must be positive"));
        }
        if self.fit.passes == 0 || self.fit.batch_size == 0 {
            return Err(CubeError::InvalidParameter("inverse fit needs passes and a batch size"));
        }
        Ok(())
    }
}

/// Shared handles a running job uses to report back: the cooperative
/// cancel flag and the instance's message queue.
#[derive(Debug, Clone)]
pub struct JobContext {
    cancel: Arc<AtomicBool>,
    messages: Arc<MessageQueue>,
}

impl JobContext {
    pub(crate) fn new(cancel: Arc<AtomicBool>, messages: Arc<MessageQueue>) -> Self {
        Self { cancel, messages }
    }

    /// A context wired to nothing, for driving components directly.
    pub fn detached() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            messages: Arc::new(MessageQueue::new()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Queues a progress line for the next poll.
    pub fn post(&self, line: String) {
        debug!("{line}");
        self.messages.push(line);
    }
}

/// Everything `restore` needs, installed atomically on job completion.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub(crate) method: Method,
    pub(crate) regressor: InverseRegressor,
    /// Present for the linear method only.
    pub(crate) projector: Option<LinearProjector>,
}

impl TrainedModel {
    pub(crate) fn from_parts(
        method: Method,
        regressor: InverseRegressor,
        projector: Option<LinearProjector>,
    ) -> Self {
        Self {
            method,
            regressor,
            projector,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn regressor(&self) -> &InverseRegressor {
        &self.regressor
    }

    /// The linear forward map, when the model was trained linearly.
    pub fn projector(&self) -> Option<&LinearProjector> {
        self.projector.as_ref()
    }

    pub fn latent_dims(&self) -> usize {
        self.regressor.latent_dims()
    }

    pub fn sample_dims(&self) -> usize {
        self.regressor.sample_dims()
    }

    /// Reconstructs a preset from an arbitrary latent coordinate.
    ///
    /// Coordinates are expected around [-2, +2] per axis (the latent
    /// prior is standardized during training) but are not clamped.
    pub fn restore(&self, latent: &[f32]) -> Result<Vec<f32>> {
        if latent.len() != self.latent_dims() {
            return Err(CubeError::DimensionMismatch {
                what: "latent vector",
                got: latent.len(),
                expected: self.latent_dims(),
            });
        }
        Ok(self.regressor.predict(latent))
    }
}

/// Runs the full reduction pipeline. Called from the instance's worker
/// thread; all failures (including cancellation) come back as errors for
/// the worker to translate into phase transitions and messages.
pub(crate) fn run_reduction(
    samples: &SampleSet,
    method: Method,
    latent_dims: usize,
    cfg: &TrainingConfig,
    ctx: &JobContext,
) -> Result<TrainedModel> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    ctx.post(format!(
        "parameter reduction started: {} presets, {} -> {} dimensions",
        samples.len(),
        samples.dims(),
        latent_dims
    ));

    let (raw_latent, projector) = match method {
        Method::Nonlinear => {
            let p = gaussian_affinities(samples.view(), cfg.perplexity, ctx)?;
            ctx.post(format!(
                "affinity structure ready (perplexity {})",
                cfg.perplexity
            ));

            let embedder = NonlinearEmbedder::new(cfg.embed_iters, cfg.embed_learning_rate);
            let y = embedder.fit(p.view(), latent_dims, &mut rng, ctx)?;
            (y, None)
        }
        Method::Linear => {
            let (projector, latent) =
                LinearProjector::fit(samples.view(), latent_dims, &mut rng, ctx)?;
            ctx.post("linear projection ready".to_string());
            (latent, Some(projector))
        }
    };

    // Standardize each latent axis so restore queries live on an
    // approximately Normal(0, I) scale.
    let latent = standardize_columns(raw_latent);

    let mut regressor = InverseRegressor::new(latent_dims, samples.dims(), cfg.hidden, &mut rng);
    let loss = regressor.fit(latent.view(), samples.view(), &cfg.fit, &mut rng, ctx)?;

    ctx.post(format!("inverse model ready (final mse {loss:.6})"));

    Ok(TrainedModel {
        method,
        regressor,
        projector,
    })
}

/// Rescales every column to zero mean and unit variance.
fn standardize_columns(mut m: Array2<f32>) -> Array2<f32> {
    for mut col in m.axis_iter_mut(Axis(1)) {
        let mean = col.mean().unwrap_or(0.0);
        let var = col.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
        let std = var.sqrt().max(1e-6);
        col.mapv_inplace(|v| (v - mean) / std);
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tags_round_trip() {
        for method in [Method::Linear, Method::Nonlinear] {
            assert_eq!(Method::from_tag(method.tag()).unwrap(), method);
        }
        assert!(Method::from_tag(7.0).is_err());
    }

    #[test]
    fn standardize_yields_unit_scale() {
        let m = ndarray::array![[1.0_f32, 10.0], [3.0, 30.0], [5.0, 50.0]];
        let s = standardize_columns(m);

        for col in s.axis_iter(Axis(1)) {
            assert!(col.mean().unwrap().abs() < 1e-6);
            let var = col.mapv(|v| v * v).mean().unwrap();
            assert!((var - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = TrainingConfig {
            embed_iters: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CubeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn linear_pipeline_produces_a_restorable_model() {
        let mut rows = Vec::new();
        let mut rng_state = 0x9e3779b9_u64;
        for i in 0..120 {
            let mut row = Vec::with_capacity(6);
            for j in 0..6 {
                // Deterministic jitter.
                rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let noise = ((rng_state >> 33) as f32 / (1u64 << 31) as f32) - 0.5;
                let base = if i % 2 == 0 { 0.2 } else { 0.8 };
                row.push(base + 0.05 * noise + 0.01 * j as f32);
            }
            rows.push(row);
        }
        let samples = SampleSet::from_rows(rows).unwrap();

        let cfg = TrainingConfig {
            fit: FitOptions {
                passes: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = JobContext::detached();
        let model = run_reduction(&samples, Method::Linear, 2, &cfg, &ctx).unwrap();

        assert_eq!(model.latent_dims(), 2);
        assert_eq!(model.sample_dims(), 6);
        assert_eq!(model.method(), Method::Linear);
        assert!(model.projector.is_some());

        let restored = model.restore(&[0.0, 0.0]).unwrap();
        assert_eq!(restored.len(), 6);

        // Wrong latent width is rejected.
        assert!(matches!(
            model.restore(&[0.0, 0.0, 0.0]),
            Err(CubeError::DimensionMismatch { .. })
        ));
    }
}
