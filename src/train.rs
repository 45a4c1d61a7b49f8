//! Training and validation loops

use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{LossError, NLLLoss},
    nn::{Module, NNError},
    optim::Optim,
    values::Value,
};

/// Errors raised while training or evaluating
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error("Cannot iterate over an empty data loader")]
    EmptyLoader,
}

/// Options for [`train`]
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Log the running training loss every `print_every` optimization steps
    pub print_every: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 5,
            print_every: 40,
        }
    }
}

/// Loss and accuracy of a model over a whole data loader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Validation {
    /// Criterion averaged over batches
    pub loss: f32,
    /// Fraction of examples whose most likely class is the label
    pub accuracy: f32,
}

/// Validation run in the middle of an epoch, every `print_every` steps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepValidation {
    /// Optimization step within the epoch, starting at 1
    pub step: usize,
    /// Training loss averaged over the last `print_every` steps
    pub running_loss: f32,
    pub validation: Validation,
}

/// Result of [`train_epoch`]
#[derive(Debug, Clone, Default)]
pub struct EpochReport {
    /// Loss averaged over every batch of the epoch
    pub loss: f32,
    pub step_validations: Vec<StepValidation>,
}

/// Per epoch losses and accuracies
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub train_losses: Vec<f32>,
    pub test_losses: Vec<f32>,
    pub test_accuracies: Vec<f32>,
    /// Mid-epoch validations, one list per epoch
    pub step_validations: Vec<Vec<StepValidation>>,
}

/// Index of the largest value
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

/// Validates with dropout disabled, then puts the model back in train mode
fn validate_in_eval_mode<M>(model: &mut M, loader: &DataLoader) -> Result<Validation, TrainError>
where
    M: Module + ?Sized,
{
    model.eval();
    let result = validation(&*model, loader);
    model.train();
    result
}

/// Runs one epoch of training.
///
/// Every `print_every` steps (never when it is 0) the running loss is logged and, if a
/// `testloader` is given, the model is validated on it in eval mode.
pub fn train_epoch<M, O>(
    model: &mut M,
    loader: &DataLoader,
    optimizer: &mut O,
    print_every: usize,
    testloader: Option<&DataLoader>,
) -> Result<EpochReport, TrainError>
where
    M: Module + ?Sized,
    O: Optim + ?Sized,
{
    if loader.is_empty() || testloader.is_some_and(DataLoader::is_empty) {
        return Err(TrainError::EmptyLoader);
    }
    model.train();

    let mut report = EpochReport::default();
    let mut epoch_loss = 0.0;
    let mut running_loss = 0.0;
    for (step, (inputs, labels)) in loader.iter().enumerate() {
        let step = step + 1;
        // gradients accumulate across backward passes, clear them for every batch
        optimizer.zero_grad();
        let log_probs = model.forward_batch(&inputs)?;
        let loss = NLLLoss::call(&log_probs, &labels)?;
        loss.backward();
        optimizer.step();

        let loss = loss.data();
        if !loss.is_finite() {
            log::warn!("non-finite loss {} at step {}", loss, step);
        }
        epoch_loss += loss;
        running_loss += loss;
        if print_every == 0 || step % print_every != 0 {
            continue;
        }

        let running = running_loss / print_every as f32;
        running_loss = 0.0;
        match testloader {
            Some(testloader) => {
                let validation = validate_in_eval_mode(model, testloader)?;
                log::info!(
                    "Step: {}.. Training Loss: {:.3}.. Test Loss: {:.3}.. Test Accuracy: {:.3}",
                    step,
                    running,
                    validation.loss,
                    validation.accuracy
                );
                report.step_validations.push(StepValidation {
                    step,
                    running_loss: running,
                    validation,
                });
            }
            None => log::debug!("step: {}, running_loss: {:.4}", step, running),
        }
    }
    report.loss = epoch_loss / loader.len() as f32;
    Ok(report)
}

/// Evaluates the model as is, the caller decides between train and eval mode
pub fn validation<M>(model: &M, loader: &DataLoader) -> Result<Validation, TrainError>
where
    M: Module + ?Sized,
{
    if loader.is_empty() {
        return Err(TrainError::EmptyLoader);
    }
    let mut total_loss = 0.0;
    let mut correct = 0;
    for (inputs, labels) in loader.iter() {
        let log_probs = model.forward_batch(&inputs)?;
        total_loss += NLLLoss::call(&log_probs, &labels)?.data();
        correct += log_probs
            .iter()
            .zip(labels.iter())
            .filter(|(row, label)| {
                let row = row.iter().map(Value::data).collect::<Vec<_>>();
                argmax(&row) == Some(**label)
            })
            .count();
    }
    Ok(Validation {
        loss: total_loss / loader.len() as f32,
        accuracy: correct as f32 / loader.n_samples() as f32,
    })
}

/// Trains for a fixed number of epochs. The model is validated on `testloader` in eval
/// mode every `print_every` steps and at the end of every epoch, and is left in train mode.
pub fn train<M, O>(
    model: &mut M,
    trainloader: &DataLoader,
    testloader: &DataLoader,
    optimizer: &mut O,
    options: &TrainOptions,
) -> Result<TrainingHistory, TrainError>
where
    M: Module + ?Sized,
    O: Optim + ?Sized,
{
    if trainloader.is_empty() || testloader.is_empty() {
        return Err(TrainError::EmptyLoader);
    }
    let mut history = TrainingHistory::default();
    for epoch in 0..options.epochs {
        let report = train_epoch(
            model,
            trainloader,
            optimizer,
            options.print_every,
            Some(testloader),
        )?;
        let Validation { loss, accuracy } = validate_in_eval_mode(model, testloader)?;

        log::info!(
            "Epoch: {}/{}.. Training Loss: {:.3}.. Test Loss: {:.3}.. Test Accuracy: {:.3}",
            epoch + 1,
            options.epochs,
            report.loss,
            loss,
            accuracy
        );
        history.train_losses.push(report.loss);
        history.test_losses.push(loss);
        history.test_accuracies.push(accuracy);
        history.step_validations.push(report.step_validations);
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::{
        datasets::{Dataset, load_dataset},
        model::{ClassifierConfig, Network},
        optim::{Adam, SGD},
    };

    use super::*;

    fn loaders(dataset: Dataset, seed: u64) -> (DataLoader, DataLoader) {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let (train_x, train_y) = load_dataset(dataset, 100, &mut rng);
        let (test_x, test_y) = load_dataset(dataset, 50, &mut rng);
        (
            DataLoader::new(train_x, train_y, 10, true).unwrap(),
            DataLoader::new(test_x, test_y, 25, false).unwrap(),
        )
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_validation_counts_correct_predictions() {
        let mut model = Network::seeded(ClassifierConfig::new(2, 2, vec![]), 0).unwrap();
        model.eval();
        let data = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 2.0]];
        let predicted = model
            .predict_proba(&data)
            .unwrap()
            .iter()
            .map(|p| argmax(p).unwrap())
            .collect::<Vec<_>>();
        // flip the label of the first example only
        let labels = vec![1 - predicted[0], predicted[1], predicted[2]];
        let loader = DataLoader::new(data, labels, 2, false).unwrap();

        let result = validation(&model, &loader).unwrap();
        assert!((result.accuracy - 2.0 / 3.0).abs() < 1e-6);
        assert!(result.loss > 0.0);
    }

    #[test]
    fn test_training_reduces_loss() {
        let (trainloader, testloader) = loaders(Dataset::Line, 1);
        let mut model = Network::seeded(ClassifierConfig::new(2, 2, vec![8]).with_drop_p(0.0), 1).unwrap();
        let mut optim = Adam::new(model.parameters(), 0.05);

        model.eval();
        let before = validation(&model, &testloader).unwrap();
        model.train();

        let options = TrainOptions {
            epochs: 10,
            print_every: 5,
        };
        let history = train(&mut model, &trainloader, &testloader, &mut optim, &options).unwrap();
        assert_eq!(history.train_losses.len(), 10);
        assert_eq!(history.test_losses.len(), 10);
        assert_eq!(history.test_accuracies.len(), 10);
        assert!(model.is_training());

        let last = *history.test_losses.last().unwrap();
        assert!(last < before.loss, "{last} >= {}", before.loss);
        assert!(*history.test_accuracies.last().unwrap() > 0.8);
    }

    #[test]
    fn test_train_epoch_with_sgd_and_dropout() {
        let (trainloader, _) = loaders(Dataset::Moon, 2);
        let mut model = Network::seeded(ClassifierConfig::new(2, 2, vec![16, 8]), 2).unwrap();
        let mut optim = SGD::new(model.parameters(), 0.05, 0.9);
        let report = train_epoch(&mut model, &trainloader, &mut optim, 0, None).unwrap();
        assert!(report.loss.is_finite() && report.loss > 0.0);
        assert!(report.step_validations.is_empty());
        assert_eq!(model.n_parameter_nans(), 0);
    }

    #[test]
    fn test_validates_every_print_every_steps() {
        // 200 training examples in batches of 10 give 20 steps per epoch
        let (trainloader, testloader) = loaders(Dataset::Circle, 3);
        let mut model = Network::seeded(ClassifierConfig::new(2, 2, vec![8]), 3).unwrap();
        let mut optim = SGD::new(model.parameters(), 0.05, 0.0);
        let options = TrainOptions {
            epochs: 2,
            print_every: 8,
        };

        let history = train(&mut model, &trainloader, &testloader, &mut optim, &options).unwrap();
        assert_eq!(history.step_validations.len(), 2);
        for epoch in &history.step_validations {
            let steps = epoch.iter().map(|v| v.step).collect::<Vec<_>>();
            assert_eq!(steps, vec![8, 16]);
            for v in epoch {
                assert!(v.running_loss.is_finite() && v.running_loss > 0.0);
                assert!((0.0..=1.0).contains(&v.validation.accuracy));
            }
        }
        assert!(model.is_training());

        let options = TrainOptions {
            epochs: 1,
            print_every: 0,
        };
        let history = train(&mut model, &trainloader, &testloader, &mut optim, &options).unwrap();
        assert_eq!(history.step_validations, vec![Vec::new()]);
    }

    #[test]
    fn test_empty_loader() {
        let empty = DataLoader::new(vec![], vec![], 4, false).unwrap();
        let model = Network::seeded(ClassifierConfig::new(2, 2, vec![]), 0).unwrap();
        assert!(matches!(
            validation(&model, &empty),
            Err(TrainError::EmptyLoader)
        ));
    }

    #[test]
    fn test_empty_testloader_is_rejected_before_training() {
        let (trainloader, _) = loaders(Dataset::Line, 4);
        let empty = DataLoader::new(vec![], vec![], 4, false).unwrap();
        let mut model = Network::seeded(ClassifierConfig::new(2, 2, vec![4]), 4).unwrap();
        let mut optim = SGD::new(model.parameters(), 0.1, 0.0);
        let before = model.state_dict();

        let result = train(
            &mut model,
            &trainloader,
            &empty,
            &mut optim,
            &TrainOptions::default(),
        );
        assert!(matches!(result, Err(TrainError::EmptyLoader)));
        assert_eq!(model.state_dict(), before);
    }
}
