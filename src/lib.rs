//! Feed-forward classifiers with checkpointing, built on a minimal scalar autograd
//! library with a PyTorch-like API.

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod plot;
pub mod train;
pub mod values;
