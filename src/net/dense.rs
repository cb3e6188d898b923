use ndarray::{linalg, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};

use super::activation::Activation;

/// A fully-connected layer over a flat parameter slice.
///
/// The layer itself is stateless: weights and biases live in the owning
/// network's single flat buffer and are viewed per call, so the whole
/// model can be exported, imported and optimized as one slice.
#[derive(Debug, Clone)]
pub(crate) struct Dense {
    dim: (usize, usize),
    act: Activation,
}

impl Dense {
    pub fn new(inputs: usize, outputs: usize, act: Activation) -> Self {
        Self {
            dim: (inputs, outputs),
            act,
        }
    }

    pub fn inputs(&self) -> usize {
        self.dim.0
    }

    pub fn outputs(&self) -> usize {
        self.dim.1
    }

    /// The amount of parameters this layer occupies: weights plus biases.
    pub fn size(&self) -> usize {
        (self.dim.0 + 1) * self.dim.1
    }

    /// Forward pass for a batch.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the flat parameter buffer.
    /// * `x` - Batch input, one row per sample.
    ///
    /// # Returns
    /// The pre-activations `z` and activations `a`, both batch-shaped.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let (w, b) = self.view_params(params);

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let a = z.mapv(|v| self.act.f(v));
        (z, a)
    }

    /// Backward pass for a batch.
    ///
    /// Accumulates this layer's weight and bias gradients into `grad` and
    /// returns the error to propagate to the previous layer.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the flat parameter buffer.
    /// * `grad` - This layer's slice of the flat gradient buffer.
    /// * `x` - The batch input seen by the matching `forward` call.
    /// * `z` - The pre-activations produced by that call.
    /// * `d` - The error arriving from the next layer.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        x: ArrayView2<f32>,
        z: ArrayView2<f32>,
        mut d: Array2<f32>,
    ) -> Array2<f32> {
        d.zip_mut_with(&z, |d, &z| *d *= self.act.df(z));

        let (mut dw, mut db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params);
        let mut d_prev = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut d_prev);
        d_prev
    }

    /// Views the raw parameter slice as this layer's weights and biases.
    pub fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size() - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap();
        (weights, biases)
    }

    /// Views the raw gradient slice as this layer's delta weights and biases.
    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size() - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap();
        (dw, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn forward_applies_affine_then_activation() {
        let layer = Dense::new(2, 1, Activation::Identity);
        // w = [[1], [2]], b = [3]
        let params = [1.0, 2.0, 3.0];
        let x = array![[1.0, 1.0], [2.0, 0.5]];

        let (z, a) = layer.forward(&params, x.view());
        assert_eq!(z, array![[6.0], [8.0]]);
        assert_eq!(a, z);
    }

    #[test]
    fn backward_gradient_matches_finite_difference() {
        let layer = Dense::new(3, 2, Activation::Tanh);
        let mut params: Vec<f32> = (0..layer.size()).map(|i| 0.1 * (i as f32) - 0.3).collect();
        let x = array![[0.5, -0.2, 0.8], [1.0, 0.3, -0.4]];
        let y = array![[0.1, -0.6], [0.4, 0.2]];

        // Analytic gradient of 0.5 * sum((a - y)^2).
        let (z, a) = layer.forward(&params, x.view());
        let d = &a - &y;
        let mut grad = vec![0.0; layer.size()];
        layer.backward(&params, &mut grad, x.view(), z.view(), d);

        let h = 1e-3;
        for i in 0..params.len() {
            let saved = params[i];

            params[i] = saved + h;
            let (_, a_hi) = layer.forward(&params, x.view());
            let loss_hi: f32 = (&a_hi - &y).mapv(|v| 0.5 * v * v).sum();

            params[i] = saved - h;
            let (_, a_lo) = layer.forward(&params, x.view());
            let loss_lo: f32 = (&a_lo - &y).mapv(|v| 0.5 * v * v).sum();

            params[i] = saved;

            let numeric = (loss_hi - loss_lo) / (2.0 * h);
            assert!(
                (grad[i] - numeric).abs() < 1e-2,
                "param {i}: analytic {} vs numeric {}",
                grad[i],
                numeric
            );
        }
    }
}
