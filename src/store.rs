//! Model persistence.
//!
//! `export`/`import` move a trained model through one ordered `f64`
//! sequence with a versioned header, so two engines can exchange models
//! without agreeing on anything but this layout:
//!
//! ```text
//! [0]              format version (1.0)
//! [1]              method tag (0 = linear, 1 = nonlinear)
//! [2]              D (preset dimensions)
//! [3]              L (latent dimensions)
//! [4]              n = number of dense layers
//! [5 .. 5+2n)      per-layer (input, output) sizes
//! [.. params]      regressor parameters, layer by layer
//!                  (weights row-major, then biases)
//! [.. L*D + D]     linear method only: projection row-major, then means
//! ```
//!
//! `save`/`load` wrap the same sequence in a little-endian file frame:
//! the `CUBE` magic, a u32 frame version, a u64 value count, then the
//! raw values.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{Array1, Array2};

use crate::error::{CubeError, Result};
use crate::net::InverseRegressor;
use crate::projection::LinearProjector;
use crate::training::{Method, TrainedModel};

const FORMAT_VERSION: f64 = 1.0;
const MAGIC: [u8; 4] = *b"CUBE";
const FRAME_VERSION: u32 = 1;

/// Upper bound on the value count accepted from a file header, to keep a
/// corrupt length field from driving allocation.
const MAX_MODEL_VALUES: u64 = 1 << 28;

/// Serializes a trained model into the flat layout above.
pub fn export(model: &TrainedModel) -> Vec<f64> {
    let dims = model.regressor().layer_dims();

    let mut seq = Vec::with_capacity(5 + 2 * dims.len() + model.regressor().num_params());
    seq.push(FORMAT_VERSION);
    seq.push(model.method().tag());
    seq.push(model.sample_dims() as f64);
    seq.push(model.latent_dims() as f64);
    seq.push(dims.len() as f64);

    for &(inputs, outputs) in &dims {
        seq.push(inputs as f64);
        seq.push(outputs as f64);
    }

    seq.extend(model.regressor().params().iter().map(|&v| v as f64));

    if let Some(projector) = model.projector() {
        seq.extend(projector.projection().iter().map(|&v| v as f64));
        seq.extend(projector.mean().iter().map(|&v| v as f64));
    }

    seq
}

/// Reconstructs a model from an exported sequence.
///
/// Rejects unknown versions and any sequence whose length disagrees with
/// its own header.
pub fn import(seq: &[f64]) -> Result<TrainedModel> {
    if seq.len() < 5 {
        return Err(CubeError::Serialization("sequence too short for a header".into()));
    }

    if seq[0] != FORMAT_VERSION {
        return Err(CubeError::Serialization(format!(
            "unsupported format version {}",
            seq[0]
        )));
    }

    let method = Method::from_tag(seq[1])?;
    let sample_dims = as_count(seq[2], "D")?;
    let latent_dims = as_count(seq[3], "L")?;
    let n_layers = as_count(seq[4], "layer count")?;

    if latent_dims != 2 && latent_dims != 3 {
        return Err(CubeError::Serialization(format!(
            "latent dimension {latent_dims} is outside {{2, 3}}"
        )));
    }

    let header_end = 5 + 2 * n_layers;
    if seq.len() < header_end {
        return Err(CubeError::Serialization("layer table is truncated".into()));
    }

    let mut dims = Vec::with_capacity(n_layers);
    for i in 0..n_layers {
        let inputs = as_count(seq[5 + 2 * i], "layer input size")?;
        let outputs = as_count(seq[5 + 2 * i + 1], "layer output size")?;
        dims.push((inputs, outputs));
    }

    if dims.first().map(|&(i, _)| i) != Some(latent_dims)
        || dims.last().map(|&(_, o)| o) != Some(sample_dims)
    {
        return Err(CubeError::Serialization(
            "layer sizes do not match the declared dimensions".into(),
        ));
    }

    let param_count: usize = dims.iter().map(|&(i, o)| (i + 1) * o).sum();
    let projector_count = match method {
        Method::Linear => latent_dims * sample_dims + sample_dims,
        Method::Nonlinear => 0,
    };

    let expected = header_end + param_count + projector_count;
    if seq.len() != expected {
        return Err(CubeError::Serialization(format!(
            "sequence has {} values, layout implies {}",
            seq.len(),
            expected
        )));
    }

    let params: Vec<f32> = seq[header_end..header_end + param_count]
        .iter()
        .map(|&v| v as f32)
        .collect();
    let regressor = InverseRegressor::from_parts(&dims, params)?;

    let projector = match method {
        Method::Nonlinear => None,
        Method::Linear => {
            let start = header_end + param_count;
            let proj_vals: Vec<f32> = seq[start..start + latent_dims * sample_dims]
                .iter()
                .map(|&v| v as f32)
                .collect();
            let mean_vals: Vec<f32> = seq[start + latent_dims * sample_dims..]
                .iter()
                .map(|&v| v as f32)
                .collect();

            let projection =
                Array2::from_shape_vec((latent_dims, sample_dims), proj_vals).unwrap();
            let mean = Array1::from_vec(mean_vals);
            Some(LinearProjector::from_parts(projection, mean))
        }
    };

    Ok(TrainedModel::from_parts(method, regressor, projector))
}

/// Writes the exported sequence to `path` inside the `CUBE` frame.
pub fn save(path: &Path, model: &TrainedModel) -> Result<()> {
    let seq = export(model);

    let mut sink = BufWriter::new(File::create(path)?);
    sink.write_all(&MAGIC)?;
    sink.write_all(&FRAME_VERSION.to_le_bytes())?;
    sink.write_all(&(seq.len() as u64).to_le_bytes())?;
    for v in &seq {
        sink.write_all(&v.to_le_bytes())?;
    }
    sink.flush()?;

    Ok(())
}

/// Reads a framed sequence from `path` and imports it.
pub fn load(path: &Path) -> Result<TrainedModel> {
    let mut src = BufReader::new(File::open(path)?);

    let mut magic = [0_u8; 4];
    src.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(CubeError::Serialization("not a cube model file".into()));
    }

    let mut word = [0_u8; 4];
    src.read_exact(&mut word)?;
    let frame_version = u32::from_le_bytes(word);
    if frame_version != FRAME_VERSION {
        return Err(CubeError::Serialization(format!(
            "unsupported file frame version {frame_version}"
        )));
    }

    let mut long = [0_u8; 8];
    src.read_exact(&mut long)?;
    let count = u64::from_le_bytes(long);
    if count > MAX_MODEL_VALUES {
        return Err(CubeError::Serialization(format!(
            "value count {count} is implausibly large"
        )));
    }

    let mut seq = Vec::with_capacity(count as usize);
    for _ in 0..count {
        src.read_exact(&mut long)?;
        seq.push(f64::from_le_bytes(long));
    }

    import(&seq)
}

/// Reads a header value as a positive integer count.
fn as_count(v: f64, what: &str) -> Result<usize> {
    if v.fract() != 0.0 || v < 1.0 || v > MAX_MODEL_VALUES as f64 {
        return Err(CubeError::Serialization(format!("bad {what}: {v}")));
    }
    Ok(v as usize)
}
