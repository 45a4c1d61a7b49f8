//! Saving and restoring trained networks
//!
//! A checkpoint stores the shape of the network next to its parameters so that a
//! network of the right shape can be rebuilt before the parameters are copied in.
//! On disk it is a JSON object:
//!
//! ```json
//! {
//!   "input_size": 784,
//!   "output_size": 10,
//!   "hidden_layers": [512, 256, 128],
//!   "drop_p": 0.5,
//!   "state_dict": {
//!     "hidden_layers.0.weight": { "shape": [512, 784], "data": [...] },
//!     ...
//!   }
//! }
//! ```
//!
//! Keys other than these are ignored when reading.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{ClassifierConfig, DEFAULT_DROP_P, Network},
    nn::NNError,
};

/// Errors when capturing or restoring a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Size mismatch for {name}: the network expects shape {expected:?}, the checkpoint has {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Missing key {0} in state dict")]
    MissingKey(String),
    #[error("Unexpected key {0} in state dict")]
    UnexpectedKey(String),
    #[error("Tensor {name} has shape {shape:?} but holds {len} values")]
    MalformedTensor {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("Tensor {name} holds a non-finite value, which JSON cannot represent")]
    NonFiniteParameter { name: String },
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Snapshot of one parameter, values in row-major order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StateTensor {
    /// Checks that the data fills the shape exactly
    pub fn validate(&self, name: &str) -> Result<(), CheckpointError> {
        if self.shape.iter().product::<usize>() != self.data.len() {
            return Err(CheckpointError::MalformedTensor {
                name: name.to_string(),
                shape: self.shape.clone(),
                len: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Parameter snapshots keyed by parameter name
pub type StateDict = BTreeMap<String, StateTensor>;

/// Self-describing snapshot of a [`Network`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layers: Vec<usize>,
    /// Dropout probability of the saved network, [`DEFAULT_DROP_P`] when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_p: Option<f32>,
    pub state_dict: StateDict,
}

impl Checkpoint {
    /// Captures the shape and a copy of the parameters of a network
    pub fn from_model(model: &Network) -> Self {
        let config = model.config();
        Self {
            input_size: config.input_size,
            output_size: config.output_size,
            hidden_layers: config.hidden_layers,
            drop_p: Some(config.drop_p),
            state_dict: model.state_dict(),
        }
    }

    /// Configuration of the network the checkpoint was taken from
    pub fn config(&self) -> ClassifierConfig {
        ClassifierConfig::new(self.input_size, self.output_size, self.hidden_layers.clone())
            .with_drop_p(self.drop_p.unwrap_or(DEFAULT_DROP_P))
    }

    /// Rebuilds a network of the recorded shape and loads the recorded parameters into it
    pub fn into_model(self) -> Result<Network, CheckpointError> {
        let mut model = Network::new(self.config())?;
        model.load_state_dict(&self.state_dict)?;
        Ok(model)
    }

    /// Writes the checkpoint as JSON. Fails before touching `path` if any parameter is
    /// NaN or infinite, since such a file could not be read back.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        if let Some((name, _)) = self
            .state_dict
            .iter()
            .find(|(_, tensor)| tensor.data.iter().any(|x| !x.is_finite()))
        {
            return Err(CheckpointError::NonFiniteParameter { name: name.clone() });
        }
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        log::info!(
            "Saved checkpoint with {} parameter tensors to '{}'.",
            self.state_dict.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let checkpoint: Self = serde_json::from_reader(reader)?;
        log::info!(
            "Loaded checkpoint for {} -> {:?} -> {} from '{}'.",
            checkpoint.input_size,
            checkpoint.hidden_layers,
            checkpoint.output_size,
            path.display()
        );
        Ok(checkpoint)
    }
}

/// Writes a checkpoint of `model` to `path`
pub fn save_checkpoint(model: &Network, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    Checkpoint::from_model(model).save(path)
}

/// Reads the checkpoint at `path` and rebuilds the network it describes
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Network, CheckpointError> {
    Checkpoint::load(path)?.into_model()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::{
        assert_eq_float,
        nn::Module,
        optim::{Optim, SGD},
        values::Value,
    };

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fc-net-{}-{name}.json", std::process::id()))
    }

    fn inputs(n: usize, width: usize) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| {
                (0..width)
                    .map(|j| Value::new(((i + 3 * j) % 11) as f32 / 11.0))
                    .collect()
            })
            .collect()
    }

    fn outputs(model: &Network, batch: &[Vec<Value>]) -> Vec<Vec<f32>> {
        model
            .forward_batch(batch)
            .unwrap()
            .iter()
            .map(|row| row.iter().map(|v| v.data()).collect())
            .collect()
    }

    #[test]
    fn test_record_describes_network() {
        let model = Network::seeded(ClassifierConfig::new(784, 10, vec![512, 256, 128]), 0).unwrap();
        let checkpoint = Checkpoint::from_model(&model);
        assert_eq!(checkpoint.input_size, 784);
        assert_eq!(checkpoint.output_size, 10);
        assert_eq!(checkpoint.hidden_layers, vec![512, 256, 128]);
        assert_eq!(
            checkpoint.state_dict["hidden_layers.0.weight"].shape,
            vec![512, 784]
        );
        assert_eq!(checkpoint.state_dict["output.weight"].shape, vec![10, 128]);

        let path = temp_path("record");
        checkpoint.save(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_reader(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(json["hidden_layers"], serde_json::json!([512, 256, 128]));
        assert_eq!(json["input_size"], 784);
        assert_eq!(json["output_size"], 10);

        let restored = load_checkpoint(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(restored.config().hidden_layers, vec![512, 256, 128]);
        assert_eq!(restored.config().input_size, 784);
        assert_eq!(restored.config().output_size, 10);
    }

    #[test]
    fn test_roundtrip_reproduces_outputs() {
        let config = ClassifierConfig::new(6, 4, vec![8, 5]).with_drop_p(0.2);
        let mut model = Network::seeded(config.clone(), 11).unwrap();

        // move the weights away from their initial values
        let mut optim = SGD::new(model.parameters(), 0.1, 0.0);
        let batch = inputs(3, 6);
        for row in model.forward_batch(&batch).unwrap() {
            row[0].backward();
        }
        optim.step();
        model.eval();

        let path = temp_path("roundtrip");
        save_checkpoint(&model, &path).unwrap();
        let mut restored = load_checkpoint(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        restored.eval();

        assert_eq!(restored.config(), config);
        for (a, b) in outputs(&model, &batch).iter().zip(outputs(&restored, &batch).iter()) {
            for (a, b) in a.iter().zip(b.iter()) {
                assert_eq_float!(a, b);
            }
        }
    }

    #[test]
    fn test_load_into_different_architecture_fails() {
        let model = Network::seeded(ClassifierConfig::new(784, 10, vec![512, 256, 128]), 0).unwrap();
        let checkpoint = Checkpoint::from_model(&model);

        let mut other = Network::seeded(ClassifierConfig::new(784, 10, vec![400, 200, 100]), 0).unwrap();
        let err = other.load_state_dict(&checkpoint.state_dict).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ShapeMismatch { ref name, ref expected, ref got }
                if name == "hidden_layers.0.weight"
                    && expected == &vec![400, 784]
                    && got == &vec![512, 784]
        ));
        assert!(err.to_string().contains("hidden_layers.0.weight"));
    }

    #[test]
    fn test_load_into_fewer_layers_fails() {
        let model = Network::seeded(ClassifierConfig::new(8, 3, vec![6, 4]), 0).unwrap();
        let checkpoint = Checkpoint::from_model(&model);

        let mut deeper = Network::seeded(ClassifierConfig::new(8, 3, vec![6, 4, 4]), 0).unwrap();
        assert!(matches!(
            deeper.load_state_dict(&checkpoint.state_dict),
            Err(CheckpointError::MissingKey(name)) if name == "hidden_layers.2.weight"
        ));

        let mut shallower = Network::seeded(ClassifierConfig::new(8, 3, vec![6]), 0).unwrap();
        assert!(matches!(
            shallower.load_state_dict(&checkpoint.state_dict),
            Err(CheckpointError::ShapeMismatch { name, .. }) if name == "output.weight"
        ));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let model = Network::seeded(ClassifierConfig::new(2, 2, vec![]), 0).unwrap();
        let mut json = serde_json::to_value(Checkpoint::from_model(&model)).unwrap();
        json["optimizer_state"] = serde_json::json!({ "lr": 0.01 });
        json["epochs"] = serde_json::json!(3);
        let checkpoint: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(checkpoint.state_dict, model.state_dict());
    }

    #[test]
    fn test_missing_drop_p_uses_default() {
        let model = Network::seeded(ClassifierConfig::new(2, 2, vec![3]).with_drop_p(0.1), 0).unwrap();
        let mut checkpoint = Checkpoint::from_model(&model);
        assert_eq!(checkpoint.drop_p, Some(0.1));
        checkpoint.drop_p = None;
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert!(json.get("drop_p").is_none());
        assert_eq!(checkpoint.into_model().unwrap().config().drop_p, DEFAULT_DROP_P);
    }

    #[test]
    fn test_non_finite_parameters_are_not_saved() {
        let model = Network::seeded(ClassifierConfig::new(3, 2, vec![4]), 0).unwrap();
        let mut bias = model
            .named_parameters()
            .into_iter()
            .find(|p| p.name == "hidden_layers.0.bias")
            .unwrap()
            .values
            .remove(1);
        bias.set_data(f32::NAN);

        let path = temp_path("non-finite");
        let err = save_checkpoint(&model, &path).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::NonFiniteParameter { ref name } if name == "hidden_layers.0.bias"
        ));
        assert!(!path.exists());

        bias.set_data(f32::INFINITY);
        assert!(matches!(
            save_checkpoint(&model, &path),
            Err(CheckpointError::NonFiniteParameter { .. })
        ));

        bias.set_data(0.25);
        save_checkpoint(&model, &path).unwrap();
        let restored = load_checkpoint(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(restored.state_dict(), model.state_dict());
    }

    #[test]
    fn test_io_errors_propagate() {
        let err = Checkpoint::load(temp_path("does-not-exist")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io(e) if e.kind() == std::io::ErrorKind::NotFound));

        let path = temp_path("malformed");
        std::fs::write(&path, "{\"input_size\": 3").unwrap();
        let err = Checkpoint::load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, CheckpointError::Json(_)));
    }
}
