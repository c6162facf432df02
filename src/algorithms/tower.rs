//! Tower transforms: the mapping from a batch of base embeddings to final
//! representations, plus the backward pass needed to train it.
//!
//! Batches are row-major in meaning: one row per user or item.

use super::initializer::InitializationMethod;
use crate::error::{Result, TowerError};
use nalgebra::{DMatrix, RowDVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    None,
}

impl Activation {
    fn apply(self, z: &DMatrix<f32>) -> DMatrix<f32> {
        match self {
            Activation::Relu => z.map(crate::utils::relu),
            Activation::None => z.clone(),
        }
    }
}

/// `output = activation(input · weights + bias)`, weights shaped `in × out`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLayer {
    pub weights: DMatrix<f32>,
    pub bias: RowDVector<f32>,
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerGradient {
    pub weights: DMatrix<f32>,
    pub bias: RowDVector<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tower {
    Identity,
    Multilayer(Vec<DenseLayer>),
}

/// Intermediate values of one forward pass, kept for the backward pass.
#[derive(Debug, Clone)]
pub struct TowerPass {
    layer_inputs: Vec<DMatrix<f32>>,
    pre_activations: Vec<DMatrix<f32>>,
    /// Per-row divisor when normalization ran.
    divisors: Option<Vec<f32>>,
    epsilon: f32,
    pub output: DMatrix<f32>,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(rng: &mut R, in_dim: usize, out_dim: usize, activation: Activation) -> Self {
        Self {
            weights: InitializationMethod::VarianceScaledNormal.initialize_matrix(rng, in_dim, out_dim),
            bias: InitializationMethod::Zeros.initialize_row(rng, out_dim),
            activation,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weights.ncols()
    }

    fn affine(&self, input: &DMatrix<f32>) -> DMatrix<f32> {
        let mut z = input * &self.weights;
        for mut row in z.row_iter_mut() {
            row += &self.bias;
        }
        z
    }
}

impl LayerGradient {
    fn zeros_like(layer: &DenseLayer) -> Self {
        Self {
            weights: DMatrix::zeros(layer.in_dim(), layer.out_dim()),
            bias: RowDVector::zeros(layer.out_dim()),
        }
    }
}

impl Tower {
    /// ReLU hidden layers followed by a linear projection to `output_dim`.
    pub fn multilayer<R: Rng + ?Sized>(
        rng: &mut R,
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 || hidden.iter().any(|&h| h == 0) {
            return Err(TowerError::config("tower layer sizes must be positive"));
        }

        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut prev = input_dim;
        for &h in hidden {
            layers.push(DenseLayer::new(rng, prev, h, Activation::Relu));
            prev = h;
        }
        layers.push(DenseLayer::new(rng, prev, output_dim, Activation::None));

        Ok(Tower::Multilayer(layers))
    }

    /// Builds a multilayer tower from explicit layers, checking that each
    /// layer's input matches the previous layer's output and that the final
    /// layer is linear.
    pub fn from_layers(layers: Vec<DenseLayer>) -> Result<Self> {
        let last = layers
            .last()
            .ok_or_else(|| TowerError::config("a multilayer tower needs at least one layer"))?;
        if last.activation != Activation::None {
            return Err(TowerError::config("the final tower layer must be linear"));
        }
        for pair in layers.windows(2) {
            if pair[0].out_dim() != pair[1].in_dim() {
                return Err(TowerError::config(format!(
                    "layer output {} does not match next layer input {}",
                    pair[0].out_dim(),
                    pair[1].in_dim()
                )));
            }
        }
        for layer in &layers {
            if layer.bias.len() != layer.out_dim() {
                return Err(TowerError::config(format!(
                    "bias of length {} for a layer with {} outputs",
                    layer.bias.len(),
                    layer.out_dim()
                )));
            }
        }
        Ok(Tower::Multilayer(layers))
    }

    pub fn layers(&self) -> &[DenseLayer] {
        match self {
            Tower::Identity => &[],
            Tower::Multilayer(layers) => layers,
        }
    }

    pub fn layers_mut(&mut self) -> &mut [DenseLayer] {
        match self {
            Tower::Identity => &mut [],
            Tower::Multilayer(layers) => layers,
        }
    }

    /// Output width for a given input width.
    pub fn output_dim(&self, input_dim: usize) -> usize {
        self.layers().last().map_or(input_dim, DenseLayer::out_dim)
    }

    pub fn input_dim(&self) -> Option<usize> {
        self.layers().first().map(DenseLayer::in_dim)
    }

    /// Inference-only transform.
    pub fn transform(&self, input: DMatrix<f32>, normalize: bool, epsilon: f32) -> Result<DMatrix<f32>> {
        Ok(self.forward(input, normalize, epsilon)?.output)
    }

    pub fn forward(&self, input: DMatrix<f32>, normalize: bool, epsilon: f32) -> Result<TowerPass> {
        if let Some(expected) = self.input_dim() {
            if input.ncols() != expected {
                return Err(TowerError::DimensionMismatch {
                    context: "tower input",
                    expected,
                    actual: input.ncols(),
                });
            }
        }

        let layers = self.layers();
        let mut layer_inputs = Vec::with_capacity(layers.len());
        let mut pre_activations = Vec::with_capacity(layers.len());
        let mut h = input;

        for layer in layers {
            let z = layer.affine(&h);
            let next = layer.activation.apply(&z);
            layer_inputs.push(h);
            pre_activations.push(z);
            h = next;
        }

        let divisors = normalize.then(|| normalize_rows(&mut h, epsilon));

        Ok(TowerPass {
            layer_inputs,
            pre_activations,
            divisors,
            epsilon,
            output: h,
        })
    }

    /// Propagates `grad_output` (same shape as `pass.output`) back through the
    /// tower. Returns the gradient w.r.t. the tower input and one gradient per
    /// layer, in layer order.
    pub fn backward(&self, pass: &TowerPass, grad_output: &DMatrix<f32>) -> (DMatrix<f32>, Vec<LayerGradient>) {
        let mut grad = match &pass.divisors {
            Some(divisors) => normalize_rows_backward(&pass.output, divisors, pass.epsilon, grad_output),
            None => grad_output.clone(),
        };

        let layers = self.layers();
        let mut gradients: Vec<LayerGradient> = layers.iter().map(LayerGradient::zeros_like).collect();

        for (index, layer) in layers.iter().enumerate().rev() {
            let z = &pass.pre_activations[index];
            if layer.activation == Activation::Relu {
                for (g, &z) in grad.iter_mut().zip(z.iter()) {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                }
            }

            let input = &pass.layer_inputs[index];
            gradients[index].weights = input.tr_mul(&grad);
            gradients[index].bias = column_sums(&grad);
            grad = &grad * layer.weights.transpose();
        }

        (grad, gradients)
    }
}

/// Divides each row by `max(norm, epsilon)` in place and returns the divisors.
pub fn normalize_rows(matrix: &mut DMatrix<f32>, epsilon: f32) -> Vec<f32> {
    let mut divisors = Vec::with_capacity(matrix.nrows());
    for mut row in matrix.row_iter_mut() {
        let divisor = row.norm().max(epsilon);
        row /= divisor;
        divisors.push(divisor);
    }
    divisors
}

/// Backward pass of [`normalize_rows`]. With `y = x / n` and `n = |x|` the
/// Jacobian is `(I - y yᵀ) / n`; when the norm was floored at epsilon the
/// divisor is a constant and the gradient is just `dy / epsilon`.
fn normalize_rows_backward(
    output: &DMatrix<f32>,
    divisors: &[f32],
    epsilon: f32,
    grad_output: &DMatrix<f32>,
) -> DMatrix<f32> {
    let mut grad = grad_output.clone();
    for (r, &divisor) in divisors.iter().enumerate() {
        let y = output.row(r);
        let projection = if divisor <= epsilon {
            0.0
        } else {
            y.dot(&grad_output.row(r))
        };
        for c in 0..grad.ncols() {
            grad[(r, c)] = (grad_output[(r, c)] - projection * y[c]) / divisor;
        }
    }
    grad
}

fn column_sums(matrix: &DMatrix<f32>) -> RowDVector<f32> {
    RowDVector::from_iterator(matrix.ncols(), matrix.column_iter().map(|c| c.sum()))
}
