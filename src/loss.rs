//! Loss function(s)

use thiserror::Error;

use crate::values::Value;

/// Errors for loss functions
#[derive(Debug, Error)]
pub enum LossError {
    #[error("Batch size mismatch: {predictions} predictions for {labels} labels")]
    BatchSizeMismatch { predictions: usize, labels: usize },
    #[error("Label {label} is out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },
    #[error("Cannot compute the loss of an empty batch")]
    EmptyBatch,
}

/// Negative log likelihood loss, averaged over the batch.
///
/// Expects log-probabilities (e.g. the output of `LogSoftmax`) and zero-based class indices.
pub struct NLLLoss;

impl NLLLoss {
    pub fn call(log_probs: &[Vec<Value>], labels: &[usize]) -> Result<Value, LossError> {
        if log_probs.len() != labels.len() {
            return Err(LossError::BatchSizeMismatch {
                predictions: log_probs.len(),
                labels: labels.len(),
            });
        }
        if log_probs.is_empty() {
            return Err(LossError::EmptyBatch);
        }
        let picked = log_probs
            .iter()
            .zip(labels.iter())
            .map(|(row, &label)| {
                row.get(label).cloned().ok_or(LossError::LabelOutOfRange {
                    label,
                    n_classes: row.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mean = Value::sum_all(&picked) / Value::new(labels.len() as f32);
        Ok(-&mean)
    }
}
