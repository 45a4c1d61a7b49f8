//! Trains, evaluates and inspects feed-forward classifiers using the library provided by `fc_net`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- train --hidden 16 8 --checkpoint checkpoint.json
//! cargo run -- eval --checkpoint checkpoint.json
//! cargo run -- train --dataset idx --data-dir data/FashionMNIST --limit 2000 --hidden 128 64
//! ```
//!
//! Set `RUST_LOG=info` (or `debug`) to see training progress.

use std::{error::Error, path::PathBuf};

use fc_net::{
    checkpoint::{Checkpoint, load_checkpoint, save_checkpoint},
    dataloader::DataLoader,
    datasets::{Dataset, Samples, Split, load_dataset, load_idx},
    model::{ClassifierConfig, DEFAULT_DROP_P, Network},
    nn::Module,
    optim::{Adam, Optim, SGD},
    plot::plot_losses,
    train::{TrainOptions, train, validation},
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a classifier and save a checkpoint of it
    Train(TrainArgs),
    /// Report the test loss and accuracy of a saved checkpoint
    Eval(EvalArgs),
    /// Print the architecture and parameter shapes of a saved checkpoint
    Inspect {
        #[clap(short, long)]
        checkpoint: PathBuf,
    },
}

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Source {
    Line,
    Circle,
    Xor,
    Moon,
    /// MNIST style IDX files in `--data-dir`
    Idx,
}

#[derive(Debug, ValueEnum, Clone, Copy)]
enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Args)]
struct DataArgs {
    #[clap(short, long, value_enum, default_value_t = Source::Moon)]
    dataset: Source,
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    /// Only use the first `limit` examples of each IDX split
    #[clap(long)]
    limit: Option<usize>,
    /// Number of points per class of the synthetic datasets
    #[clap(long, default_value_t = 500)]
    class_size: usize,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,
    #[clap(long, num_args = 0.., default_values_t = vec![16, 8])]
    hidden: Vec<usize>,
    #[clap(long, default_value_t = DEFAULT_DROP_P)]
    drop_p: f32,
    #[clap(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[clap(short, long, default_value_t = 0.001)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(short, long, default_value_t = 5)]
    epochs: usize,
    #[clap(short, long, default_value_t = 40)]
    print_every: usize,
    #[clap(short, long, default_value = "checkpoint.json")]
    checkpoint: PathBuf,
    /// Write a plot of the training and validation losses to this PNG file
    #[clap(long)]
    plot: Option<String>,
}

#[derive(Args)]
struct EvalArgs {
    #[command(flatten)]
    data: DataArgs,
    #[clap(short, long, default_value = "checkpoint.json")]
    checkpoint: PathBuf,
}

/// Training and test samples along with the number of classes
fn load_samples(args: &DataArgs) -> Result<(Samples, Samples, usize), Box<dyn Error>> {
    let synthetic = match args.dataset {
        Source::Line => Dataset::Line,
        Source::Circle => Dataset::Circle,
        Source::Xor => Dataset::XOR,
        Source::Moon => Dataset::Moon,
        Source::Idx => {
            let train = load_idx(&args.data_dir, Split::Train, args.limit)?;
            let test = load_idx(&args.data_dir, Split::Test, args.limit)?;
            let n_classes = train.1.iter().chain(test.1.iter()).max().map_or(0, |&l| l + 1);
            return Ok((train, test, n_classes));
        }
    };
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let train = load_dataset(synthetic, args.class_size, &mut rng);
    let test = load_dataset(synthetic, args.class_size / 4 + 1, &mut rng);
    Ok((train, test, synthetic.n_classes()))
}

fn run_train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let ((train_x, train_y), (test_x, test_y), n_classes) = load_samples(&args.data)?;
    let input_size = train_x.first().map_or(0, |x| x.len());

    let config = ClassifierConfig::new(input_size, n_classes, args.hidden).with_drop_p(args.drop_p);
    log::info!("Training {:?}", config);
    let mut model = Network::seeded(config, args.data.seed)?;
    let mut optimizer: Box<dyn Optim> = match args.optimizer {
        OptimizerKind::Sgd => Box::new(SGD::new(model.parameters(), args.lr, args.momentum)),
        OptimizerKind::Adam => Box::new(Adam::new(model.parameters(), args.lr)),
    };

    let trainloader = DataLoader::new(train_x, train_y, args.data.batch_size, true)?;
    let testloader = DataLoader::new(test_x, test_y, args.data.batch_size, false)?;
    let options = TrainOptions {
        epochs: args.epochs,
        print_every: args.print_every,
    };
    let history = train(
        &mut model,
        &trainloader,
        &testloader,
        optimizer.as_mut(),
        &options,
    )?;
    log::debug!(
        "n_dead_neurons in the last forward pass: {}, n_parameter_nans: {}",
        model.n_dead_neurons(),
        model.n_parameter_nans()
    );

    save_checkpoint(&model, &args.checkpoint)?;
    if let Some(plot) = args.plot {
        plot_losses(&history, &plot)?;
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<(), Box<dyn Error>> {
    let mut model = load_checkpoint(&args.checkpoint)?;
    model.eval();
    let (_, (test_x, test_y), _) = load_samples(&args.data)?;
    let testloader = DataLoader::new(test_x, test_y, args.data.batch_size, false)?;
    let result = validation(&model, &testloader)?;
    log::info!(
        "Test Loss: {:.3}.. Test Accuracy: {:.3}",
        result.loss,
        result.accuracy
    );
    println!("loss: {:.4}, accuracy: {:.4}", result.loss, result.accuracy);
    Ok(())
}

fn run_inspect(checkpoint: PathBuf) -> Result<(), Box<dyn Error>> {
    let checkpoint = Checkpoint::load(checkpoint)?;
    let config = checkpoint.config();
    println!(
        "input_size: {}, output_size: {}, hidden_layers: {:?}, drop_p: {}",
        config.input_size, config.output_size, config.hidden_layers, config.drop_p
    );
    for (name, tensor) in &checkpoint.state_dict {
        println!("{name}: {:?}", tensor.shape);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Cli::parse().command {
        Command::Train(args) => run_train(args),
        Command::Eval(args) => run_eval(args),
        Command::Inspect { checkpoint } => run_inspect(checkpoint),
    }
}
