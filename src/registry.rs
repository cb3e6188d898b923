//! The id table: every boundary operation addresses an instance by the
//! non-negative integer returned from `create_instance`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CubeError, Result};
use crate::instance::CubeInstance;
use crate::training::{Method, TrainingConfig};

/// Owns all live instances and hands out ids.
///
/// Ids are allocated monotonically and never reused while an instance is
/// live. The table lock is held only for lookups; the returned handle is
/// cloned out, so long-running calls on one instance never block calls on
/// another.
#[derive(Default)]
pub struct CubeRegistry {
    instances: Mutex<HashMap<usize, Arc<CubeInstance>>>,
    next_id: AtomicUsize,
}

impl CubeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty instance and returns its id.
    pub fn create_instance(&self) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cube = Arc::new(CubeInstance::new(id));
        self.instances.lock().unwrap().insert(id, cube);
        id
    }

    /// Removes an instance, cancelling and joining any running job before
    /// its buffers are released.
    pub fn delete_instance(&self, id: usize) -> Result<()> {
        let cube = self
            .instances
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(CubeError::InvalidHandle(id))?;

        cube.shutdown();
        Ok(())
    }

    fn get(&self, id: usize) -> Result<Arc<CubeInstance>> {
        self.instances
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CubeError::InvalidHandle(id))
    }

    /// Returns a shared handle to an instance for direct use.
    ///
    /// The handle stays valid after `delete_instance`; the registry only
    /// drops its own reference.
    pub fn instance(&self, id: usize) -> Result<Arc<CubeInstance>> {
        self.get(id)
    }

    /// Drains and returns the instance's queued messages.
    pub fn poll_messages(&self, id: usize) -> Result<Vec<String>> {
        Ok(self.get(id)?.poll_messages())
    }

    /// Starts a reduction job with the default bounds.
    ///
    /// `quality` is reserved: it is accepted for interface stability and
    /// currently ignored.
    pub fn start_training(
        &self,
        id: usize,
        samples: Vec<Vec<f32>>,
        method: Method,
        latent_dims: usize,
        quality: f32,
    ) -> Result<()> {
        self.start_training_with(id, samples, method, latent_dims, quality, TrainingConfig::default())
    }

    /// Starts a reduction job with explicit bounds.
    pub fn start_training_with(
        &self,
        id: usize,
        samples: Vec<Vec<f32>>,
        method: Method,
        latent_dims: usize,
        quality: f32,
        config: TrainingConfig,
    ) -> Result<()> {
        self.get(id)?
            .start_training(samples, method, latent_dims, quality, config)
    }

    pub fn is_training(&self, id: usize) -> Result<bool> {
        Ok(self.get(id)?.is_training())
    }

    /// Requests cooperative cancellation of the instance's running job.
    pub fn stop_training(&self, id: usize) -> Result<()> {
        self.get(id)?.stop_training();
        Ok(())
    }

    pub fn has_model(&self, id: usize) -> Result<bool> {
        Ok(self.get(id)?.has_model())
    }

    /// Reconstructs a preset from a latent coordinate.
    pub fn restore(&self, id: usize, latent: &[f32]) -> Result<Vec<f32>> {
        self.get(id)?.restore(latent)
    }

    /// Latent width accepted by `restore`.
    pub fn input_dimensions(&self, id: usize) -> Result<usize> {
        self.get(id)?.input_dimensions()
    }

    /// Preset width produced by `restore`.
    pub fn restored_dimensions(&self, id: usize) -> Result<usize> {
        self.get(id)?.restored_dimensions()
    }

    pub fn export_model(&self, id: usize) -> Result<Vec<f64>> {
        self.get(id)?.export_model()
    }

    pub fn import_model(&self, id: usize, params: &[f64]) -> Result<()> {
        self.get(id)?.import_model(params)
    }

    pub fn save_model(&self, id: usize, path: &Path) -> Result<()> {
        self.get(id)?.save_model(path)
    }

    pub fn load_model(&self, id: usize, path: &Path) -> Result<()> {
        self.get(id)?.load_model(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_deletable() {
        let registry = CubeRegistry::new();
        let a = registry.create_instance();
        let b = registry.create_instance();
        assert_ne!(a, b);

        registry.delete_instance(a).unwrap();
        assert!(matches!(
            registry.delete_instance(a),
            Err(CubeError::InvalidHandle(_))
        ));
        registry.delete_instance(b).unwrap();
    }

    #[test]
    fn operations_on_unknown_ids_fail() {
        let registry = CubeRegistry::new();
        assert!(matches!(
            registry.has_model(99),
            Err(CubeError::InvalidHandle(99))
        ));
        assert!(matches!(
            registry.restore(99, &[0.0, 0.0]),
            Err(CubeError::InvalidHandle(99))
        ));
        assert!(matches!(
            registry.stop_training(99),
            Err(CubeError::InvalidHandle(99))
        ));
    }

    #[test]
    fn fresh_instance_reports_empty_state() {
        let registry = CubeRegistry::new();
        let id = registry.create_instance();

        assert!(!registry.has_model(id).unwrap());
        assert!(!registry.is_training(id).unwrap());
        assert!(registry.poll_messages(id).unwrap().is_empty());
        assert!(matches!(
            registry.input_dimensions(id),
            Err(CubeError::NotReady)
        ));
    }
}
