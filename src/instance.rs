//! One addressable cube: a model slot, a message buffer and at most one
//! running reduction job.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::data::SampleSet;
use crate::error::{CubeError, Result};
use crate::messages::MessageQueue;
use crate::store;
use crate::training::{self, JobContext, Method, TrainedModel, TrainingConfig};

/// Lifecycle phase of an instance.
///
/// The phase and the model slot are deliberately independent: a cancelled
/// or failed retrain flips the phase but leaves a previously installed
/// model untouched, so `has_model` keeps answering for the old model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Training,
    Ready,
    Stopped,
    Failed,
}

/// State guarded by the instance lock. Held only for installation and
/// short reads, never across a running computation.
#[derive(Debug)]
struct ModelSlot {
    phase: Phase,
    model: Option<TrainedModel>,
    /// Preset width, fixed by the first successful training or import.
    sample_dims: Option<usize>,
}

/// Handles shared between the instance and its worker thread.
#[derive(Debug)]
struct Inner {
    slot: Mutex<ModelSlot>,
    computing: AtomicBool,
    cancel: Arc<AtomicBool>,
    messages: Arc<MessageQueue>,
}

/// An id-addressed reduction engine instance.
pub struct CubeInstance {
    id: usize,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CubeInstance {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            inner: Arc::new(Inner {
                slot: Mutex::new(ModelSlot {
                    phase: Phase::Empty,
                    model: None,
                    sample_dims: None,
                }),
                computing: AtomicBool::new(false),
                cancel: Arc::new(AtomicBool::new(false)),
                messages: Arc::new(MessageQueue::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.inner.slot.lock().unwrap().phase
    }

    /// Whether a reduction job is currently running.
    pub fn is_training(&self) -> bool {
        self.inner.computing.load(Ordering::Acquire)
    }

    /// Whether a model is installed and `restore` will answer.
    pub fn has_model(&self) -> bool {
        self.inner.slot.lock().unwrap().model.is_some()
    }

    /// Drains the progress/warning queue.
    pub fn poll_messages(&self) -> Vec<String> {
        self.inner.messages.drain()
    }

    /// Starts the reduction job for this instance.
    ///
    /// Validation is synchronous: ragged or empty samples, a latent width
    /// outside {2, 3}, a preset width conflicting with this instance's
    /// fixed D, or an already-running job all fail before any work is
    /// scheduled. On success the pipeline runs on a dedicated worker
    /// thread and results surface through the phase, the model slot and
    /// the message queue.
    pub fn start_training(
        &self,
        rows: Vec<Vec<f32>>,
        method: Method,
        latent_dims: usize,
        quality: f32,
        cfg: TrainingConfig,
    ) -> Result<()> {
        cfg.validate()?;

        if latent_dims != 2 && latent_dims != 3 {
            return Err(CubeError::InvalidParameter("latent dimension must be 2 or 3"));
        }

        let samples = SampleSet::from_rows(rows)?;

        // Reserved knob: accepted for interface stability, not yet wired
        // to anything.
        if !(0.0..=1.0).contains(&quality) {
            self.inner
                .messages
                .push(format!("quality {quality} is outside [0, 1]; parameter is reserved"));
        }

        {
            let mut slot = self.inner.slot.lock().unwrap();

            if let Some(fixed) = slot.sample_dims {
                if samples.dims() != fixed {
                    return Err(CubeError::DimensionMismatch {
                        what: "preset width",
                        got: samples.dims(),
                        expected: fixed,
                    });
                }
            }

            // Single-flight gate for the whole job lifetime.
            if self
                .inner
                .computing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return Err(CubeError::Conflict);
            }

            slot.phase = Phase::Training;
        }

        self.inner.cancel.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let ctx = JobContext::new(Arc::clone(&inner.cancel), Arc::clone(&inner.messages));
        let id = self.id;

        let spawned = thread::Builder::new()
            .name(format!("cube-{id}-reduction"))
            .spawn(move || run_job(inner, samples, method, latent_dims, cfg, ctx));

        let mut worker = self.worker.lock().unwrap();
        match spawned {
            Ok(handle) => {
                // A previous job's thread has already finished once the
                // gate was free; reap it before tracking the new one.
                if let Some(old) = worker.replace(handle) {
                    let _ = old.join();
                }
                info!(cube = id; "reduction job started");
                Ok(())
            }
            Err(e) => {
                let mut slot = self.inner.slot.lock().unwrap();
                slot.phase = Phase::Failed;
                self.inner.computing.store(false, Ordering::Release);
                warn!("cube {id}: failed to spawn reduction worker: {e}");
                Err(CubeError::Io(e))
            }
        }
    }

    /// Requests cooperative cancellation of a running job.
    ///
    /// The worker observes the flag at its iteration boundaries; with no
    /// job running the request is a harmless no-op.
    pub fn stop_training(&self) {
        self.inner.cancel.store(true, Ordering::Release);
    }

    /// Reconstructs a preset from a latent coordinate using the installed
    /// model. Never blocks on a running job.
    pub fn restore(&self, latent: &[f32]) -> Result<Vec<f32>> {
        let slot = self.inner.slot.lock().unwrap();
        let model = slot.model.as_ref().ok_or(CubeError::NotReady)?;
        model.restore(latent)
    }

    /// Latent width of the installed model.
    pub fn input_dimensions(&self) -> Result<usize> {
        let slot = self.inner.slot.lock().unwrap();
        slot.model
            .as_ref()
            .map(TrainedModel::latent_dims)
            .ok_or(CubeError::NotReady)
    }

    /// Preset width of the installed model.
    pub fn restored_dimensions(&self) -> Result<usize> {
        let slot = self.inner.slot.lock().unwrap();
        slot.model
            .as_ref()
            .map(TrainedModel::sample_dims)
            .ok_or(CubeError::NotReady)
    }

    /// Serializes the installed model into the flat parameter sequence.
    pub fn export_model(&self) -> Result<Vec<f64>> {
        let slot = self.inner.slot.lock().unwrap();
        let model = slot.model.as_ref().ok_or(CubeError::NotReady)?;
        Ok(store::export(model))
    }

    /// Installs a model from an exported sequence without training.
    pub fn import_model(&self, seq: &[f64]) -> Result<()> {
        if self.is_training() {
            return Err(CubeError::Conflict);
        }

        let model = store::import(seq)?;
        self.install(model)
    }

    /// Saves the installed model to a file.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        let slot = self.inner.slot.lock().unwrap();
        let model = slot.model.as_ref().ok_or(CubeError::NotReady)?;
        store::save(path, model)
    }

    /// Loads a model from a file saved by `save_model`.
    pub fn load_model(&self, path: &Path) -> Result<()> {
        if self.is_training() {
            return Err(CubeError::Conflict);
        }

        let model = store::load(path)?;
        self.install(model)
    }

    /// Installs an imported model, enforcing the instance's fixed
    /// dimensions.
    fn install(&self, model: TrainedModel) -> Result<()> {
        let mut slot = self.inner.slot.lock().unwrap();

        if let Some(fixed) = slot.sample_dims {
            if model.sample_dims() != fixed {
                return Err(CubeError::DimensionMismatch {
                    what: "preset width",
                    got: model.sample_dims(),
                    expected: fixed,
                });
            }
        }
        if let Some(existing) = slot.model.as_ref() {
            if existing.latent_dims() != model.latent_dims() {
                return Err(CubeError::DimensionMismatch {
                    what: "latent width",
                    got: model.latent_dims(),
                    expected: existing.latent_dims(),
                });
            }
        }

        slot.sample_dims = Some(model.sample_dims());
        slot.model = Some(model);
        slot.phase = Phase::Ready;

        debug!("cube {}: model installed from parameters", self.id);
        Ok(())
    }

    /// Cancels any running job and joins the worker. Called on deletion
    /// and drop, so the sample and model buffers are never released under
    /// a live worker.
    pub(crate) fn shutdown(&self) {
        self.inner.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CubeInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker-thread body: run the pipeline, then translate the outcome into
/// a phase transition, an optional model installation and a final
/// message. Errors never cross the thread boundary.
fn run_job(
    inner: Arc<Inner>,
    samples: SampleSet,
    method: Method,
    latent_dims: usize,
    cfg: TrainingConfig,
    ctx: JobContext,
) {
    let outcome = training::run_reduction(&samples, method, latent_dims, &cfg, &ctx);

    {
        let mut slot = inner.slot.lock().unwrap();
        match outcome {
            Ok(model) => {
                slot.sample_dims = Some(model.sample_dims());
                slot.model = Some(model);
                slot.phase = Phase::Ready;
                ctx.post("parameter reduction complete, model installed".to_string());
            }
            Err(CubeError::Cancelled) => {
                slot.phase = Phase::Stopped;
                ctx.post("parameter reduction stopped before completion".to_string());
            }
            Err(e) => {
                slot.phase = Phase::Failed;
                ctx.post(format!("parameter reduction failed: {e}"));
            }
        }
    }

    // Only after the slot reflects the outcome does the instance stop
    // reporting as computing.
    inner.computing.store(false, Ordering::Release);
}
