//! Bidirectional dimensionality reduction for preset collections.
//!
//! A cube learns a mapping from high-dimensional presets down to a 2- or
//! 3-dimensional latent space (linearly, or through an affinity-matched
//! iterative embedding) and, alongside it, an inverse network able to
//! reconstruct a plausible preset from any latent coordinate — including
//! ones never seen during training. Reduction jobs run on background
//! workers with cooperative cancellation and a drainable progress queue;
//! trained models export to a flat numeric sequence that round-trips
//! through files.
//!
//! ```no_run
//! use cube_model::{CubeRegistry, Method};
//!
//! let registry = CubeRegistry::new();
//! let cube = registry.create_instance();
//!
//! let presets: Vec<Vec<f32>> = load_presets();
//! registry.start_training(cube, presets, Method::Nonlinear, 3, 1.0).unwrap();
//!
//! while registry.is_training(cube).unwrap() {
//!     for line in registry.poll_messages(cube).unwrap() {
//!         println!("{line}");
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(200));
//! }
//!
//! let preset = registry.restore(cube, &[0.1, -0.3, 0.8]).unwrap();
//! # fn load_presets() -> Vec<Vec<f32>> { vec![] }
//! ```

mod affinity;
mod data;
mod embedding;
mod error;
mod instance;
mod messages;
mod net;
mod optimization;
mod projection;
mod registry;
mod store;
mod training;

pub use affinity::gaussian_affinities;
pub use data::SampleSet;
pub use embedding::NonlinearEmbedder;
pub use error::{CubeError, Result};
pub use instance::{CubeInstance, Phase};
pub use net::{FitOptions, InverseRegressor};
pub use projection::LinearProjector;
pub use registry::CubeRegistry;
pub use store::{export, import, load, save};
pub use training::{JobContext, Method, TrainedModel, TrainingConfig};
