//! Layers and the [`Module`] trait the classifier is assembled from

use std::{
    cell::RefCell,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::values::Value;

#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} values, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
}

/// Counterpart of `torch.nn.Module`
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    /// Shared handles to every trainable leaf, in a stable order
    fn parameters(&self) -> Vec<Value>;

    fn zero_grad(&mut self) {
        self.parameters().iter_mut().for_each(Value::zero_grad);
    }

    /// Forward pass for a single example
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;

    /// Forward pass for every example of a batch
    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        batch.iter().map(|inputs| self.forward(inputs)).collect()
    }

    /// Toggles layers which behave differently while training (e.g. dropout)
    fn set_training(&mut self, _training: bool) {}

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }
}

/// One output unit of a [`Layer`], `w . x + b`
pub struct Neuron {
    pub weights: Vec<Value>,
    pub bias: Value,
}

impl Neuron {
    fn new<R: Rng + ?Sized>(n_inputs: usize, rng: &mut R) -> Self {
        // He initialization, N(0, 2 / fan_in), keeps the activation variance stable through ReLUs
        let he = Normal::new(0.0, (2.0 / n_inputs as f32).sqrt())
            .expect("fan_in is positive so the std is finite and positive");
        let mut sample = || Value::new(he.sample(rng));
        Self {
            weights: (0..n_inputs).map(|_| sample()).collect(),
            bias: sample(),
        }
    }

    #[cfg(test)]
    fn constant(n_inputs: usize, weight: f32, bias: f32) -> Self {
        Self {
            weights: (0..n_inputs).map(|_| Value::new(weight)).collect(),
            bias: Value::new(bias),
        }
    }

    /// Weights followed by the bias
    pub fn parameters(&self) -> Vec<Value> {
        let mut params = self.weights.clone();
        params.push(self.bias.clone());
        params
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        Ok(&Value::dot(&self.weights, inputs) + &self.bias)
    }
}

/// A fully connected (affine) layer of a neural network
pub struct Layer {
    neurons: Vec<Neuron>,
    n_inputs: usize,
    n_output_nans: AtomicUsize,
}

impl Layer {
    /// Randomly initialized layer mapping `n_inputs` values to `n_outputs`
    pub fn new<R: Rng + ?Sized>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new(n_inputs, rng)).collect();
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn constant(n_inputs: usize, n_outputs: usize, weight: f32, bias: f32) -> Self {
        let neurons = (0..n_outputs)
            .map(|_| Neuron::constant(n_inputs, weight, bias))
            .collect();
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.neurons.len()
    }

    /// Shape of the weight matrix, `[n_outputs, n_inputs]`
    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.n_outputs(), self.n_inputs]
    }

    /// Weights in row-major order, one row per neuron
    pub fn weight(&self) -> Vec<Value> {
        self.neurons
            .iter()
            .flat_map(|n| n.weights.iter().cloned())
            .collect()
    }

    pub fn bias(&self) -> Vec<Value> {
        self.neurons.iter().map(|n| n.bias.clone()).collect()
    }

    /// Parameters neuron by neuron, each neuron's weights followed by its bias
    pub fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    /// Number of NaN outputs produced by the latest forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    /// Number of parameters which are currently NaN
    pub fn n_parameter_nans(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|v| v.data().is_nan())
            .count()
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut outputs = Vec::with_capacity(self.neurons.len());
        for neuron in &self.neurons {
            outputs.push(neuron.forward(inputs)?);
        }
        self.n_output_nans.store(
            outputs.iter().filter(|v| v.data().is_nan()).count(),
            atomic::Ordering::Relaxed,
        );
        Ok(outputs)
    }
}

/// Element-wise `max(x, 0)`, remembering how many units were inactive
#[derive(Default)]
pub struct ReLU {
    n_inactive: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let outputs = inputs.iter().map(Value::relu).collect::<Vec<_>>();
        self.n_inactive.store(
            outputs.iter().filter(|v| v.data() == 0.0).count(),
            atomic::Ordering::Relaxed,
        );
        outputs
    }

    /// Units which were inactive in the latest forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_inactive.load(atomic::Ordering::Relaxed)
    }
}

/// Randomly zeroes inputs with probability `p` while training, scaling the kept
/// values by `1 / (1 - p)` so the expected activation is unchanged.
/// Outside of training the inputs pass through untouched.
pub struct Dropout {
    p: f32,
    training: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&p) {
            return Err(NNError::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            p,
            training: true,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        if !self.training || self.p == 0.0 {
            return inputs.to_vec();
        }
        let scale = Value::new(1.0 / (1.0 - self.p));
        let zero = Value::new(0.0);
        let mut rng = self.rng.borrow_mut();
        inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < self.p {
                    v * &zero
                } else {
                    v * &scale
                }
            })
            .collect()
    }
}

/// Log of the softmax of a set of values, `x_i - ln(sum_j exp(x_j))`
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        // Shifting by the max keeps exp from overflowing. The shift is a constant so
        // the gradient is unchanged, it cancels out between the two terms.
        let max = inputs
            .iter()
            .map(|v| v.data())
            .fold(f32::NEG_INFINITY, f32::max);
        let max = Value::new(max);
        let shifted = inputs.iter().map(|v| v - &max).collect::<Vec<_>>();
        let exps = shifted.iter().map(|v| v.exp()).collect::<Vec<_>>();
        let log_sum_exp = Value::sum_all(&exps).ln();
        shifted.iter().map(|v| v - &log_sum_exp).collect()
    }
}
