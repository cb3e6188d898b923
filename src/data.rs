use ndarray::{Array2, ArrayView2};

use crate::error::{CubeError, Result};

/// An owned, validated N x D matrix of presets.
///
/// Construction is the single choke point for shape validation: once a
/// `SampleSet` exists, every row is known to have the same width and the
/// set is known to be non-empty.
#[derive(Debug, Clone)]
pub struct SampleSet {
    data: Array2<f32>,
}

impl SampleSet {
    /// Builds a sample set from caller-provided rows.
    ///
    /// # Arguments
    /// * `rows` - One `Vec<f32>` per preset, all of the same length.
    ///
    /// # Returns
    /// The validated set, or an error when `rows` is empty, a row is
    /// empty, or the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let n = rows.len();
        if n == 0 {
            return Err(CubeError::InvalidParameter("no samples given"));
        }

        let dim = rows[0].len();
        if dim == 0 {
            return Err(CubeError::InvalidParameter("samples have zero dimensions"));
        }

        for row in &rows {
            if row.len() != dim {
                return Err(CubeError::DimensionMismatch {
                    what: "sample row",
                    got: row.len(),
                    expected: dim,
                });
            }
        }

        let mut flat = Vec::with_capacity(n * dim);
        for row in rows {
            flat.extend_from_slice(&row);
        }

        // Shape is consistent by the checks above.
        let data = Array2::from_shape_vec((n, dim), flat).unwrap();
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Width of every sample.
    pub fn dims(&self) -> usize {
        self.data.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.data
    }
}
