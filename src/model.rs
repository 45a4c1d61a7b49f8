//! Feed-forward classifier with a configurable stack of hidden layers

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{CheckpointError, StateDict, StateTensor},
    nn::{Dropout, Layer, LogSoftmax, Module, NNError, ReLU},
    values::Value,
};

/// Dropout probability used when none is given
pub const DEFAULT_DROP_P: f32 = 0.5;

/// Shape of a [`Network`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layers: Vec<usize>,
    /// Probability of dropping a hidden unit while training
    pub drop_p: f32,
}

impl ClassifierConfig {
    pub fn new(input_size: usize, output_size: usize, hidden_layers: Vec<usize>) -> Self {
        Self {
            input_size,
            output_size,
            hidden_layers,
            drop_p: DEFAULT_DROP_P,
        }
    }

    pub fn with_drop_p(mut self, drop_p: f32) -> Self {
        self.drop_p = drop_p;
        self
    }

    pub fn validate(&self) -> Result<(), NNError> {
        if self.input_size == 0 {
            return Err(NNError::InvalidConfig("input_size must be positive".into()));
        }
        if self.output_size == 0 {
            return Err(NNError::InvalidConfig("output_size must be positive".into()));
        }
        if let Some(i) = self.hidden_layers.iter().position(|&w| w == 0) {
            return Err(NNError::InvalidConfig(format!(
                "hidden layer {i} must have a positive width"
            )));
        }
        if !(0.0..1.0).contains(&self.drop_p) {
            return Err(NNError::InvalidConfig(format!(
                "drop_p must be in [0, 1), got {}",
                self.drop_p
            )));
        }
        Ok(())
    }

    /// Every layer width from the input to the output
    pub fn widths(&self) -> Vec<usize> {
        std::iter::once(self.input_size)
            .chain(self.hidden_layers.iter().copied())
            .chain(std::iter::once(self.output_size))
            .collect()
    }
}

/// A parameter tensor of a network along with its name and shape.
/// `values` share storage with the network, writing to them updates the network.
pub struct NamedParameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<Value>,
}

/// Classifier made of `Linear -> ReLU -> Dropout` hidden blocks followed by a
/// `Linear -> LogSoftmax` output block
pub struct Network {
    hidden_layers: Vec<Layer>,
    relus: Vec<ReLU>,
    output: Layer,
    dropout: Dropout,
    log_softmax: LogSoftmax,
}

impl Network {
    /// Builds a randomly initialized network
    pub fn new(config: ClassifierConfig) -> Result<Self, NNError> {
        Self::build(config, &mut Pcg64Mcg::from_rng(&mut rand::rng()))
    }

    /// Builds a network whose initial weights and dropout masks are reproducible
    pub fn seeded(config: ClassifierConfig, seed: u64) -> Result<Self, NNError> {
        Self::build(config, &mut Pcg64Mcg::seed_from_u64(seed))
    }

    fn build(config: ClassifierConfig, rng: &mut Pcg64Mcg) -> Result<Self, NNError> {
        config.validate()?;
        let blocks = config
            .widths()
            .windows(2)
            .map(|w| (w[0], w[1]))
            .collect::<Vec<_>>();
        let (&(output_in, output_out), hidden_blocks) = blocks
            .split_last()
            .ok_or_else(|| NNError::InvalidConfig("network has no layers".into()))?;

        let hidden_layers = hidden_blocks
            .iter()
            .map(|&(n_in, n_out)| Layer::new(n_in, n_out, rng))
            .collect::<Vec<_>>();
        let relus = hidden_layers.iter().map(|_| ReLU::new()).collect();
        let output = Layer::new(output_in, output_out, rng);
        let dropout = Dropout::new(config.drop_p, rng.next_u64())?;

        Ok(Self {
            hidden_layers,
            relus,
            output,
            dropout,
            log_softmax: LogSoftmax::new(),
        })
    }

    /// The configuration read back from the layers of the network
    pub fn config(&self) -> ClassifierConfig {
        let input_size = self
            .hidden_layers
            .first()
            .unwrap_or(&self.output)
            .n_inputs();
        ClassifierConfig {
            input_size,
            output_size: self.output.n_outputs(),
            hidden_layers: self.hidden_layers.iter().map(|l| l.n_outputs()).collect(),
            drop_p: self.dropout.p(),
        }
    }

    pub fn is_training(&self) -> bool {
        self.dropout.is_training()
    }

    /// Parameters named `hidden_layers.<i>.weight`, `hidden_layers.<i>.bias`,
    /// `output.weight` and `output.bias`, in layer order
    pub fn named_parameters(&self) -> Vec<NamedParameter> {
        let named_layers = self
            .hidden_layers
            .iter()
            .enumerate()
            .map(|(i, layer)| (format!("hidden_layers.{i}"), layer))
            .chain(std::iter::once(("output".to_string(), &self.output)));

        named_layers
            .flat_map(|(prefix, layer)| {
                [
                    NamedParameter {
                        name: format!("{prefix}.weight"),
                        shape: layer.weight_shape(),
                        values: layer.weight(),
                    },
                    NamedParameter {
                        name: format!("{prefix}.bias"),
                        shape: vec![layer.n_outputs()],
                        values: layer.bias(),
                    },
                ]
            })
            .collect()
    }

    /// Snapshot of every parameter
    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|p| {
                let tensor = StateTensor {
                    shape: p.shape,
                    data: p.values.iter().map(|v| v.data()).collect(),
                };
                (p.name, tensor)
            })
            .collect()
    }

    /// Copies a snapshot into the parameters of the network.
    ///
    /// Every entry is checked against the network before anything is written, so on
    /// error the network is left untouched.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<(), CheckpointError> {
        let params = self.named_parameters();

        for param in &params {
            let tensor = state_dict
                .get(&param.name)
                .ok_or_else(|| CheckpointError::MissingKey(param.name.clone()))?;
            tensor.validate(&param.name)?;
            if tensor.shape != param.shape {
                return Err(CheckpointError::ShapeMismatch {
                    name: param.name.clone(),
                    expected: param.shape.clone(),
                    got: tensor.shape.clone(),
                });
            }
        }
        if let Some(name) = state_dict
            .keys()
            .find(|name| !params.iter().any(|p| &p.name == *name))
        {
            return Err(CheckpointError::UnexpectedKey(name.clone()));
        }

        for param in params {
            let tensor = &state_dict[&param.name];
            for (mut value, &data) in param.values.into_iter().zip(tensor.data.iter()) {
                value.set_data(data);
            }
        }
        Ok(())
    }

    /// Class probabilities for each example, without keeping the graph around
    pub fn predict_proba(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, NNError> {
        batch
            .iter()
            .map(|example| {
                let inputs = example.iter().map(|&x| Value::new(x)).collect::<Vec<_>>();
                let log_probs = self.forward(&inputs)?;
                Ok(log_probs.iter().map(|v| v.data().exp()).collect())
            })
            .collect()
    }

    /// Number of hidden units which were inactive in the latest forward pass
    pub fn n_dead_neurons(&self) -> usize {
        self.relus.iter().map(|r| r.n_dead_neurons()).sum()
    }

    /// Number of parameters which are NaN, a sign of a diverging run
    pub fn n_parameter_nans(&self) -> usize {
        self.hidden_layers
            .iter()
            .chain(std::iter::once(&self.output))
            .map(|l| l.n_parameter_nans())
            .sum()
    }
}

impl Module for Network {
    fn parameters(&self) -> Vec<Value> {
        self.hidden_layers
            .iter()
            .chain(std::iter::once(&self.output))
            .flat_map(|l| l.parameters())
            .collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut x = inputs.to_vec();
        for (layer, relu) in self.hidden_layers.iter().zip(self.relus.iter()) {
            let h = relu.forward(&layer.forward(&x)?);
            x = self.dropout.forward(&h);
        }
        let logits = self.output.forward(&x)?;
        if self.output.n_output_nans() > 0 {
            log::debug!("n_output_nans: {}", self.output.n_output_nans());
        }
        Ok(self.log_softmax.forward(&logits))
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }
}
