use log::{info, warn};
use rand::{SeedableRng, rngs::StdRng};

use super::{Task, step_downhill_with, step_global_with};
use crate::{
    MetaErr, Result, Tensor,
    arch::{ForwardPass, feedforward_init},
    config::{MetaConfig, Objective},
    optimization::{Momentum, Optimizer, momentum::Params},
    permutations::layer_distance_values,
    tree::Tree,
};

/// What a single meta iteration left behind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// The loss reported by the step.
    pub loss: f64,
    /// The learning rate after the hyperparameter update.
    pub lr: f64,
    /// The momentum after the hyperparameter update.
    pub momentum: f64,
    /// The distance from the new weights to the global minimum, if one is known.
    pub distance: Option<f64>,
}

/// Drives a momentum optimizer whose hyperparameters are trained alongside the weights.
///
/// Threads the weights, the optimizer state and hyperparameters, and the lagged gradient from
/// one iteration into the next, and keeps a record of every iteration.
pub struct MetaTrainer<F> {
    config: MetaConfig,
    forward_pass: F,
    optimizer: Momentum,

    weights: Tree<Tensor>,
    opt_params: Tree<Tensor>,
    opt_state: Tree<Tensor>,
    last_dldw: Tree<Tensor>,
    global_minimum: Option<Tree<Tensor>>,

    history: Vec<Record>,
}

impl<F: ForwardPass> MetaTrainer<F> {
    /// Returns a new `MetaTrainer`.
    ///
    /// # Arguments
    /// * `config` - The run's settings, the initial hyperparameters included.
    /// * `forward_pass` - The model being trained.
    /// * `weights` - The model's initial weights.
    ///
    /// # Returns
    /// The trainer, or a `Config` error if `config` holds invalid values.
    pub fn new(config: MetaConfig, forward_pass: F, weights: Tree<Tensor>) -> Result<Self> {
        config.validate()?;

        let optimizer = Momentum::new();
        let opt_params = config.optimizer.params()?.to_tree();
        let opt_state = optimizer.init(&weights, &opt_params);
        let last_dldw = weights.zeros_like();

        Ok(Self {
            config,
            forward_pass,
            optimizer,
            weights,
            opt_params,
            opt_state,
            last_dldw,
            global_minimum: None,
            history: Vec::new(),
        })
    }

    /// Returns a new `MetaTrainer` for a feedforward network with randomly initialized
    /// weights, seeded by `config.seed` when set.
    ///
    /// # Arguments
    /// * `config` - The run's settings.
    /// * `forward_pass` - The model being trained.
    /// * `sizes` - The width of every layer, input and output included.
    pub fn from_sizes(config: MetaConfig, forward_pass: F, sizes: &[usize]) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let weights = feedforward_init(sizes, &mut rng)?;
        Self::new(config, forward_pass, weights)
    }

    /// Sets the known global minimum, required by the `global` objective.
    pub fn with_global_minimum(mut self, global_minimum: Tree<Tensor>) -> Self {
        self.global_minimum = Some(global_minimum);
        self
    }

    /// Runs `config.iterations` meta iterations on the given data.
    ///
    /// # Arguments
    /// * `inputs` - The model's inputs.
    /// * `ground_truth` - The expected outputs.
    ///
    /// # Returns
    /// The loss of every iteration run by this call.
    pub fn train(&mut self, inputs: &Tensor, ground_truth: &Tensor) -> Result<Vec<f64>> {
        let iterations = self.config.iterations.get();
        let mut losses = Vec::with_capacity(iterations);

        for _ in 0..iterations {
            let record = self.iterate(inputs, ground_truth)?;
            losses.push(record.loss);
        }

        Ok(losses)
    }

    fn iterate(&mut self, inputs: &Tensor, ground_truth: &Tensor) -> Result<Record> {
        let task =
            Task::new(&self.forward_pass, inputs, ground_truth).with_power(self.config.power);

        let (loss, distance) = match self.config.objective {
            Objective::Downhill => {
                let out = step_downhill_with(
                    &self.config,
                    &self.weights,
                    task,
                    &self.optimizer,
                    &self.opt_params,
                    &self.opt_state,
                    &self.last_dldw,
                )?;

                self.weights = out.weights;
                self.opt_state = out.opt_state;
                self.opt_params = out.opt_params;
                self.last_dldw = out.dldw;

                let distance = match &self.global_minimum {
                    Some(minimum) => Some(layer_distance_values(&self.weights, minimum)?.0),
                    None => None,
                };
                (out.loss, distance)
            }
            Objective::Global => {
                let global_minimum = self.global_minimum.as_ref().ok_or_else(|| {
                    MetaErr::Config("the global objective needs a global minimum".to_string())
                })?;

                let out = step_global_with(
                    &self.config,
                    &self.weights,
                    task,
                    &self.optimizer,
                    &self.opt_params,
                    &self.opt_state,
                    global_minimum,
                )?;

                self.weights = out.weights;
                self.opt_state = out.opt_state;
                self.opt_params = out.opt_params;
                (out.loss, Some(out.distance))
            }
        };

        let params = self.params()?;
        let record = Record {
            loss,
            lr: params.lr(),
            momentum: params.momentum(),
            distance,
        };

        let iteration = self.history.len();
        if !loss.is_finite() {
            warn!("non-finite loss at iteration {iteration}");
        }
        info!(
            iteration = iteration,
            loss = loss,
            lr = record.lr,
            momentum = record.momentum;
            "meta iteration"
        );

        self.history.push(record);
        Ok(record)
    }

    pub fn weights(&self) -> &Tree<Tensor> {
        &self.weights
    }

    pub fn opt_state(&self) -> &Tree<Tensor> {
        &self.opt_state
    }

    /// The current hyperparameters.
    pub fn params(&self) -> Result<Params> {
        Params::from_tree(&self.opt_params)
    }

    /// Every iteration run so far, oldest first.
    pub fn history(&self) -> &[Record] {
        &self.history
    }
}
