//! Gradient-based training of an optimizer's own hyperparameters.
//!
//! A momentum optimizer's learning rate and momentum are stored in unconstrained space and
//! updated by differentiating through the optimizer's step, either to make that step look
//! more like plain descent (`step_downhill`) or to land closer to a known global minimum up
//! to a relabeling of hidden neurons (`step_global`).

pub mod arch;
pub mod autodiff;
pub mod config;
mod error;
pub mod optimization;
pub mod permutations;
pub mod training;
pub mod tree;

pub use error::{MetaErr, Result};

/// Every weight, gradient, state and hyperparameter is a dynamically shaped `f64` array.
pub type Tensor = ndarray::ArrayD<f64>;
