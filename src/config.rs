use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::{
    MetaErr, Result,
    optimization::momentum::{self, Params},
    training::{DEFAULT_POWER, OPTIMIZER_LR},
};

/// Which outer objective the hyperparameters are trained on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Push the optimizer's step away from plain gradient descent.
    #[default]
    Downhill,
    /// Pull the weights toward a known global minimum.
    Global,
}

/// The inner optimizer and its initial hyperparameters, in human readable form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Momentum { lr: f64, momentum: f64 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Momentum {
            lr: 0.01,
            momentum: 0.9,
        }
    }
}

impl OptimizerConfig {
    /// Converts the configured values into unconstrained momentum `Params`.
    pub fn params(&self) -> Result<Params> {
        match *self {
            Self::Momentum { lr, momentum } => momentum::defaults(lr, momentum),
        }
    }
}

/// Settings of a meta-training run.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// The fixed step taken on the hyperparameters.
    pub meta_lr: f64,
    /// The exponent of the loss, `sum(|gt - out|^power)`.
    pub power: f64,
    /// Reject non-finite weights, gradients and hyperparameters on entry of every step.
    pub check_finite: bool,
    pub iterations: NonZeroUsize,
    pub objective: Objective,
    pub optimizer: OptimizerConfig,
    pub seed: Option<u64>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            meta_lr: OPTIMIZER_LR,
            power: DEFAULT_POWER,
            check_finite: false,
            iterations: NonZeroUsize::MIN,
            objective: Objective::default(),
            optimizer: OptimizerConfig::default(),
            seed: None,
        }
    }
}

impl MetaConfig {
    /// Parses a configuration from its json representation.
    ///
    /// # Returns
    /// The configuration, or a `Config` error if the json is malformed or a value is out of
    /// range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde can't.
    pub fn validate(&self) -> Result<()> {
        if !(self.meta_lr.is_finite() && self.meta_lr > 0.) {
            return Err(MetaErr::Config(format!(
                "meta_lr must be positive and finite, got {}",
                self.meta_lr
            )));
        }

        if !(self.power.is_finite() && self.power > 0.) {
            return Err(MetaErr::Config(format!(
                "power must be positive and finite, got {}",
                self.power
            )));
        }

        self.optimizer
            .params()
            .map_err(|e| MetaErr::Config(format!("invalid optimizer: {e}")))?;

        Ok(())
    }
}
