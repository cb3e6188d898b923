//! State-machine and validation behavior of the public registry surface.

use std::time::Duration;

use cube_model::{CubeError, CubeRegistry, FitOptions, Method, TrainingConfig};

fn quick_cfg() -> TrainingConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    TrainingConfig {
        embed_iters: 40,
        fit: FitOptions {
            passes: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Two blobs, enough samples for the default perplexity.
fn blob_rows(n: usize, d: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..d)
                .map(|j| {
                    let base = if i % 2 == 0 { 0.2 } else { 0.8 };
                    base + 0.02 * ((i * d + j) % 5) as f32
                })
                .collect()
        })
        .collect()
}

fn wait_until_idle(registry: &CubeRegistry, id: usize) {
    while registry.is_training(id).unwrap() {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn fresh_instance_is_empty_and_idle() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    assert!(!registry.has_model(id).unwrap());
    assert!(!registry.is_training(id).unwrap());
}

#[test]
fn latent_width_outside_two_or_three_is_invalid() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    let got = registry.start_training(id, blob_rows(120, 8), Method::Nonlinear, 4, 1.0);
    assert!(matches!(got, Err(CubeError::InvalidParameter(_))));

    let got = registry.start_training(id, blob_rows(120, 8), Method::Nonlinear, 1, 1.0);
    assert!(matches!(got, Err(CubeError::InvalidParameter(_))));
}

#[test]
fn empty_sample_set_is_invalid() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    let got = registry.start_training(id, Vec::new(), Method::Linear, 2, 1.0);
    assert!(matches!(got, Err(CubeError::InvalidParameter(_))));
}

#[test]
fn training_runs_to_completion_and_installs_a_model() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    registry
        .start_training_with(id, blob_rows(150, 10), Method::Nonlinear, 2, 1.0, quick_cfg())
        .unwrap();
    assert!(registry.is_training(id).unwrap());

    wait_until_idle(&registry, id);

    assert!(registry.has_model(id).unwrap());
    assert_eq!(registry.input_dimensions(id).unwrap(), 2);
    assert_eq!(registry.restored_dimensions(id).unwrap(), 10);

    let restored = registry.restore(id, &[0.1, -0.1]).unwrap();
    assert_eq!(restored.len(), 10);

    // Progress lines were produced and are drained exactly once.
    let messages = registry.poll_messages(id).unwrap();
    assert!(!messages.is_empty());
    assert!(registry.poll_messages(id).unwrap().is_empty());
}

#[test]
fn second_start_on_a_running_instance_conflicts() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    let mut slow = quick_cfg();
    slow.embed_iters = 5000;
    registry
        .start_training_with(id, blob_rows(200, 10), Method::Nonlinear, 2, 1.0, slow)
        .unwrap();

    let second = registry.start_training(id, blob_rows(200, 10), Method::Nonlinear, 2, 1.0);
    assert!(matches!(second, Err(CubeError::Conflict)));

    registry.stop_training(id).unwrap();
    wait_until_idle(&registry, id);
}

#[test]
fn stopping_before_completion_leaves_no_model() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    let mut slow = quick_cfg();
    slow.embed_iters = 5000;
    registry
        .start_training_with(id, blob_rows(200, 10), Method::Nonlinear, 2, 1.0, slow)
        .unwrap();

    registry.stop_training(id).unwrap();
    wait_until_idle(&registry, id);

    assert!(!registry.has_model(id).unwrap());
    assert!(!registry.is_training(id).unwrap());
    assert!(matches!(registry.restore(id, &[0.0, 0.0]), Err(CubeError::NotReady)));
}

#[test]
fn restore_rejects_wrong_latent_width() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    registry
        .start_training_with(id, blob_rows(120, 6), Method::Linear, 2, 1.0, quick_cfg())
        .unwrap();
    wait_until_idle(&registry, id);
    assert!(registry.has_model(id).unwrap());

    let got = registry.restore(id, &[0.0, 0.0, 0.0]);
    assert!(matches!(
        got,
        Err(CubeError::DimensionMismatch { got: 3, expected: 2, .. })
    ));
}

#[test]
fn deleting_a_running_instance_joins_the_worker() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    let mut slow = quick_cfg();
    slow.embed_iters = 5000;
    registry
        .start_training_with(id, blob_rows(200, 10), Method::Nonlinear, 2, 1.0, slow)
        .unwrap();

    // Deletion must request cancellation and join; afterwards the id is gone.
    registry.delete_instance(id).unwrap();
    assert!(matches!(
        registry.is_training(id),
        Err(CubeError::InvalidHandle(_))
    ));
}

#[test]
fn export_without_a_model_is_not_ready() {
    let registry = CubeRegistry::new();
    let id = registry.create_instance();

    assert!(matches!(registry.export_model(id), Err(CubeError::NotReady)));
}
