//! Minimal dense-network toolkit: fully connected layers, activations,
//! inverted dropout and the Adam optimizer.
//!
//! Layers store weights as `(inputs, outputs)` so a batch `x` of shape
//! `(n, inputs)` maps to `x · W + b`.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-8;

/// Fully connected layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Gradient of the loss with respect to one [`Dense`] layer.
#[derive(Debug, Clone)]
pub struct DenseGrad {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseGrad {
    pub fn zeros_like(layer: &Dense) -> Self {
        Self {
            weight: Array2::zeros(layer.weight.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }
}

impl Dense {
    /// Uniform init in ±1/√inputs for weights and bias.
    pub fn new<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(outputs, |_| rng.gen_range(-bound..bound));
        Self { weight, bias }
    }

    pub fn inputs(&self) -> usize {
        self.weight.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weight.ncols()
    }

    /// Check a deserialized layer against the `(inputs, outputs)` its
    /// network wires it for.
    pub fn check_shape(&self, inputs: usize, outputs: usize) -> Result<(), String> {
        if self.inputs() != inputs || self.outputs() != outputs {
            return Err(format!(
                "layer is {}x{}, expected {inputs}x{outputs}",
                self.inputs(),
                self.outputs()
            ));
        }
        if self.bias.len() != outputs {
            return Err(format!("bias has {} entries, expected {outputs}", self.bias.len()));
        }
        if !self.weight.iter().chain(self.bias.iter()).all(|v| v.is_finite()) {
            return Err("non-finite parameter".to_string());
        }
        Ok(())
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    /// Backward pass. `x` is the input seen by [`forward`](Self::forward),
    /// `grad_out` the loss gradient w.r.t. the layer output. Returns the
    /// parameter gradient and the gradient w.r.t. `x`.
    pub fn backward(&self, x: ArrayView2<'_, f32>, grad_out: &Array2<f32>) -> (DenseGrad, Array2<f32>) {
        let weight = x.t().dot(grad_out);
        let bias = grad_out.sum_axis(Axis(0));
        let grad_in = grad_out.dot(&self.weight.t());
        (DenseGrad { weight, bias }, grad_in)
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Gate `grad` by the ReLU derivative at pre-activation `pre`.
pub fn relu_backward(pre: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    Zip::from(pre)
        .and(grad)
        .map_collect(|&p, &g| if p > 0.0 { g } else { 0.0 })
}

pub fn sigmoid_scalar(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(sigmoid_scalar)
}

/// `ln(1 + e^x)`, computed without overflow. Strictly positive.
pub fn softplus_scalar(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub fn softplus(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(softplus_scalar)
}

/// Gate `grad` by the softplus derivative (the logistic function) at `pre`.
pub fn softplus_backward(pre: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    Zip::from(pre)
        .and(grad)
        .map_collect(|&p, &g| g * sigmoid_scalar(p))
}

/// Draw an inverted-dropout mask: kept units are scaled by `1 / (1 - rate)`.
/// Returns `None` when `rate` is zero.
pub fn dropout_mask<R: Rng>(shape: (usize, usize), rate: f32, rng: &mut R) -> Option<Array2<f32>> {
    if rate <= 0.0 {
        return None;
    }
    let keep = 1.0 - rate.min(0.95);
    Some(Array2::from_shape_fn(shape, |_| {
        if rng.gen::<f32>() < keep {
            1.0 / keep
        } else {
            0.0
        }
    }))
}

pub fn apply_mask(mut x: Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
    if let Some(mask) = mask {
        x *= mask;
    }
    x
}

/// First and second moment estimates for one layer.
#[derive(Debug, Clone)]
pub struct AdamSlot {
    m: DenseGrad,
    v: DenseGrad,
}

impl AdamSlot {
    pub fn for_layer(layer: &Dense) -> Self {
        Self {
            m: DenseGrad::zeros_like(layer),
            v: DenseGrad::zeros_like(layer),
        }
    }
}

/// Adam with L2 weight decay folded into the gradient.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub weight_decay: f32,
    step: i32,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
            step: 0,
        }
    }

    /// Advance the shared step counter. Call once per batch, before the
    /// per-layer [`update`](Self::update) calls.
    pub fn tick(&mut self) {
        self.step = self.step.saturating_add(1);
    }

    pub fn update(&self, layer: &mut Dense, grad: &DenseGrad, slot: &mut AdamSlot) {
        let t = self.step.max(1);
        let correction1 = 1.0 - ADAM_BETA1.powi(t);
        let correction2 = 1.0 - ADAM_BETA2.powi(t);

        Zip::from(&mut layer.weight)
            .and(&grad.weight)
            .and(&mut slot.m.weight)
            .and(&mut slot.v.weight)
            .for_each(|p, &g, m, v| self.step_param(p, g, m, v, correction1, correction2));
        Zip::from(&mut layer.bias)
            .and(&grad.bias)
            .and(&mut slot.m.bias)
            .and(&mut slot.v.bias)
            .for_each(|p, &g, m, v| self.step_param(p, g, m, v, correction1, correction2));
    }

    fn step_param(&self, p: &mut f32, g: f32, m: &mut f32, v: &mut f32, c1: f32, c2: f32) {
        let g = g + self.weight_decay * *p;
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        let m_hat = *m / c1;
        let v_hat = *v / c2;
        *p -= self.learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dense_forward_shape_and_values() {
        let layer = Dense {
            weight: array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0]],
            bias: array![0.5, 0.0, 0.0],
        };
        let x = array![[1.0, 2.0], [0.0, 0.0]];
        let y = layer.forward(x.view());
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y, array![[1.5, 2.0, 0.0], [0.5, 0.0, 0.0]]);
    }

    #[test]
    fn test_dense_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Dense::new(3, 2, &mut rng);
        let x = array![[0.3, -0.2, 0.9], [1.1, 0.4, -0.5]];
        // loss = sum(forward(x))
        let grad_out = Array2::ones((2, 2));
        let (grad, _) = layer.backward(x.view(), &grad_out);

        let eps = 1e-3;
        let mut bumped = layer.clone();
        bumped.weight[[1, 0]] += eps;
        let numeric = (bumped.forward(x.view()).sum() - layer.forward(x.view()).sum()) / eps;
        assert!((numeric - grad.weight[[1, 0]]).abs() < 1e-2, "{numeric} vs {}", grad.weight[[1, 0]]);
        assert_eq!(grad.bias, array![2.0, 2.0]);
    }

    #[test]
    fn test_check_shape() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = Dense::new(4, 3, &mut rng);
        assert!(layer.check_shape(4, 3).is_ok());
        assert!(layer.check_shape(3, 4).is_err());

        layer.bias = array![0.0, 0.0];
        assert!(layer.check_shape(4, 3).unwrap_err().contains("bias"));

        let mut layer = Dense::new(2, 2, &mut rng);
        layer.weight[[0, 1]] = f32::NAN;
        assert!(layer.check_shape(2, 2).is_err());
    }

    #[test]
    fn test_activations() {
        let x = array![[-2.0, 0.0, 3.0]];
        assert_eq!(relu(&x), array![[0.0, 0.0, 3.0]]);
        assert!((sigmoid_scalar(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid_scalar(-100.0) >= 0.0 && sigmoid_scalar(100.0) <= 1.0);
        assert!(softplus_scalar(-50.0) > 0.0);
        assert!((softplus_scalar(0.0) - 2f32.ln()).abs() < 1e-6);
        assert!((softplus_scalar(40.0) - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_dropout_mask_scales_kept_units() {
        let mut rng = StdRng::seed_from_u64(1);
        let mask = dropout_mask((50, 40), 0.2, &mut rng).unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 1.25).abs() < 1e-6));
        let mean = mask.mean().unwrap();
        assert!((mean - 1.0).abs() < 0.1, "mean {mean}");
        assert!(dropout_mask((2, 2), 0.0, &mut rng).is_none());
    }

    #[test]
    fn test_adam_descends_quadratic() {
        // Minimize sum((w - 3)^2) for a 1x1 layer.
        let mut layer = Dense {
            weight: array![[0.0]],
            bias: array![0.0],
        };
        let mut slot = AdamSlot::for_layer(&layer);
        let mut adam = Adam::new(0.1, 0.0);
        for _ in 0..500 {
            let grad = DenseGrad {
                weight: layer.weight.mapv(|w| 2.0 * (w - 3.0)),
                bias: layer.bias.mapv(|b| 2.0 * (b + 1.0)),
            };
            adam.tick();
            adam.update(&mut layer, &grad, &mut slot);
        }
        assert!((layer.weight[[0, 0]] - 3.0).abs() < 1e-2);
        assert!((layer.bias[0] + 1.0).abs() < 1e-2);
    }
}
