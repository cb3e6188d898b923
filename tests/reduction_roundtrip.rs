//! End-to-end reduction and model-transfer scenarios: clustered preset
//! data in [0,1]^D, background training, message polling, restore, and
//! parameter transfer between instances and through files.

use std::time::Duration;

use cube_model::{CubeRegistry, FitOptions, Method, TrainingConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Gaussian-like clusters in the unit hypercube: per-cluster means spread
/// across the cube, uniform +-0.1 jitter, clamped to [0, 1].
fn clustered_presets(clusters: usize, per_cluster: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(clusters * per_cluster);

    for _ in 0..clusters {
        let mean: Vec<f32> = (0..dims)
            .map(|_| {
                let centered = 2.0 * (rng.random::<f32>() - 0.5);
                0.8 * centered + 0.1
            })
            .collect();

        for _ in 0..per_cluster {
            let preset: Vec<f32> = mean
                .iter()
                .map(|&m| {
                    let jitter = 0.1 * 2.0 * (rng.random::<f32>() - 0.5);
                    (m + jitter).clamp(0.0, 1.0)
                })
                .collect();
            data.push(preset);
        }
    }

    data
}

/// Polls like the reference driver: drain messages while the job runs.
fn poll_to_completion(registry: &CubeRegistry, id: usize) -> Vec<String> {
    let mut all = Vec::new();
    while registry.is_training(id).unwrap() {
        all.extend(registry.poll_messages(id).unwrap());
        std::thread::sleep(Duration::from_millis(20));
    }
    all.extend(registry.poll_messages(id).unwrap());
    all
}

fn mean_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f32>() / a.len() as f32
}

/// The reference scenario at a CI-sized sample count: nonlinear reduction
/// to 3 dimensions, restore from a random latent point, transfer the
/// model to a second instance and compare restorations.
#[test]
fn nonlinear_reduction_and_model_transfer() {
    let registry = CubeRegistry::new();
    let cube = registry.create_instance();

    let presets = clustered_presets(10, 40, 50, 0xC0FFEE);
    let cfg = TrainingConfig {
        embed_iters: 120,
        fit: FitOptions {
            passes: 80,
            ..Default::default()
        },
        ..Default::default()
    };

    registry
        .start_training_with(cube, presets, Method::Nonlinear, 3, 1.0, cfg)
        .unwrap();

    let messages = poll_to_completion(&registry, cube);
    assert!(
        messages.iter().any(|m| m.contains("embedding iteration")),
        "expected embedder progress in {messages:?}"
    );
    assert!(
        messages.iter().any(|m| m.contains("inverse model")),
        "expected inverse-fit progress in {messages:?}"
    );

    assert!(registry.has_model(cube).unwrap());
    assert_eq!(registry.input_dimensions(cube).unwrap(), 3);
    assert_eq!(registry.restored_dimensions(cube).unwrap(), 50);

    // A latent point scaled into [-0.25, 0.25]^3, as in the reference run.
    let mut rng = StdRng::seed_from_u64(99);
    let z: Vec<f32> = (0..3)
        .map(|_| 0.25 * 2.0 * (rng.random::<f32>() - 0.5))
        .collect();

    let restored = registry.restore(cube, &z).unwrap();
    assert_eq!(restored.len(), 50);

    // Transfer the parameters to a fresh instance.
    let cube2 = registry.create_instance();
    let params = registry.export_model(cube).unwrap();
    registry.import_model(cube2, &params).unwrap();
    assert!(registry.has_model(cube2).unwrap());

    let restored2 = registry.restore(cube2, &z).unwrap();
    let mad = mean_abs_diff(&restored, &restored2);
    assert!(mad < 1e-5, "restorations diverge: mean abs diff {mad}");

    registry.delete_instance(cube2).unwrap();
    registry.delete_instance(cube).unwrap();
}

#[test]
fn linear_reduction_and_file_round_trip() {
    let registry = CubeRegistry::new();
    let cube = registry.create_instance();

    let presets = clustered_presets(10, 60, 50, 0xBEEF);
    let cfg = TrainingConfig {
        fit: FitOptions {
            passes: 80,
            ..Default::default()
        },
        ..Default::default()
    };

    registry
        .start_training_with(cube, presets, Method::Linear, 2, 1.0, cfg)
        .unwrap();
    poll_to_completion(&registry, cube);

    assert!(registry.has_model(cube).unwrap());
    assert_eq!(registry.input_dimensions(cube).unwrap(), 2);

    let z = [0.6_f32, -1.1];
    let restored = registry.restore(cube, &z).unwrap();

    // Restored presets should land near the training range.
    for &v in &restored {
        assert!((-0.5..=1.5).contains(&v), "restored value {v} far out of range");
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.model");
    registry.save_model(cube, &path).unwrap();

    let cube2 = registry.create_instance();
    registry.load_model(cube2, &path).unwrap();

    let restored2 = registry.restore(cube2, &z).unwrap();
    let mad = mean_abs_diff(&restored, &restored2);
    assert!(mad < 1e-5, "file round trip diverged: mean abs diff {mad}");
}

#[test]
fn import_into_mismatched_instance_is_rejected() {
    let registry = CubeRegistry::new();
    let a = registry.create_instance();
    let b = registry.create_instance();

    // Train A on 8-dimensional presets, B on 12-dimensional ones.
    let quick = TrainingConfig {
        fit: FitOptions {
            passes: 20,
            ..Default::default()
        },
        ..Default::default()
    };

    registry
        .start_training_with(a, clustered_presets(4, 30, 8, 1), Method::Linear, 2, 1.0, quick.clone())
        .unwrap();
    registry
        .start_training_with(b, clustered_presets(4, 30, 12, 2), Method::Linear, 2, 1.0, quick)
        .unwrap();
    poll_to_completion(&registry, a);
    poll_to_completion(&registry, b);

    let params = registry.export_model(a).unwrap();
    let got = registry.import_model(b, &params);
    assert!(
        matches!(got, Err(cube_model::CubeError::DimensionMismatch { .. })),
        "got {got:?}"
    );
}

/// The full-size reference scenario (1000 presets, 50 dimensions, default
/// budgets). Long; run with `cargo test -- --ignored`.
#[test]
#[ignore = "full-size reference scenario, several minutes in debug builds"]
fn reference_scenario_full_size() {
    let registry = CubeRegistry::new();
    let cube = registry.create_instance();

    let presets = clustered_presets(10, 100, 50, 0x1D107);
    registry
        .start_training(cube, presets, Method::Nonlinear, 3, 1.0)
        .unwrap();
    poll_to_completion(&registry, cube);

    assert!(registry.has_model(cube).unwrap());

    let mut rng = StdRng::seed_from_u64(7);
    let z: Vec<f32> = (0..3)
        .map(|_| 0.25 * 2.0 * (rng.random::<f32>() - 0.5))
        .collect();
    let restored = registry.restore(cube, &z).unwrap();

    let cube2 = registry.create_instance();
    let params = registry.export_model(cube).unwrap();
    registry.import_model(cube2, &params).unwrap();
    let restored2 = registry.restore(cube2, &z).unwrap();

    assert!(mean_abs_diff(&restored, &restored2) < 1e-5);
}
