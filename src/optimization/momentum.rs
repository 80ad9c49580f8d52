use ndarray::arr0;

use super::{Optimizer, inverse_sigmoid, sigmoid};
use crate::{
    MetaErr, Result, Tensor,
    autodiff::{Graph, Var},
    tree::Tree,
};

const LOG_LR: &str = "log_lr";
const INV_SIG_MOMENTUM: &str = "inv_sig_momentum";
const LAST_UPDATE: &str = "last_update";

/// The momentum hyperparameters, stored in unconstrained space.
///
/// Any pair of reals maps to a valid configuration: the learning rate is `exp(log_lr)` and
/// the momentum is `sigmoid(inv_sig_momentum)`, so gradient descent can run on these fields
/// directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {
    pub log_lr: f64,
    pub inv_sig_momentum: f64,
}

impl Params {
    /// The learning rate these parameters encode.
    pub fn lr(&self) -> f64 {
        self.log_lr.exp()
    }

    /// The momentum coefficient these parameters encode.
    pub fn momentum(&self) -> f64 {
        sigmoid(self.inv_sig_momentum)
    }

    /// Converts the parameters into the tree every optimizer is driven with.
    pub fn to_tree(&self) -> Tree<Tensor> {
        Tree::named([
            (LOG_LR, Tree::leaf(arr0(self.log_lr).into_dyn())),
            (INV_SIG_MOMENTUM, Tree::leaf(arr0(self.inv_sig_momentum).into_dyn())),
        ])
    }

    /// Reads the parameters back from a hyperparameter tree.
    pub fn from_tree(tree: &Tree<Tensor>) -> Result<Self> {
        let read = |key| {
            tree.get(key)
                .and_then(Tree::as_leaf)
                .filter(|t| t.len() == 1)
                .map(|t| t.sum())
                .ok_or(MetaErr::StructureMismatch {
                    what: "momentum hyperparameters",
                })
        };

        Ok(Self {
            log_lr: read(LOG_LR)?,
            inv_sig_momentum: read(INV_SIG_MOMENTUM)?,
        })
    }
}

/// Converts a human readable learning rate and momentum into unconstrained `Params`.
///
/// # Arguments
/// * `lr` - The learning rate, must be positive.
/// * `momentum` - The momentum coefficient, must be in `(0, 1)`.
///
/// # Returns
/// The parameters, or a `Domain` error if either value is out of range.
pub fn defaults(lr: f64, momentum: f64) -> Result<Params> {
    if !(lr > 0. && lr.is_finite()) {
        return Err(MetaErr::Domain {
            what: "learning rate",
            value: lr,
        });
    }

    Ok(Params {
        log_lr: lr.ln(),
        inv_sig_momentum: inverse_sigmoid(momentum)?,
    })
}

/// Builds the momentum state for `initial_weights`: the last applied update, all zeros.
pub fn init(initial_weights: &Tree<Tensor>, _params: &Tree<Tensor>) -> Tree<Tensor> {
    Tree::named([(LAST_UPDATE, initial_weights.zeros_like())])
}

/// Records a momentum step: `update = lr * grad + momentum * last_update` and
/// `weights - update`, leaf by leaf.
///
/// # Returns
/// A tuple with the new state (holding `update`) and the new weights.
pub fn update(
    graph: &mut Graph,
    params: &Tree<Var>,
    state: &Tree<Var>,
    weights: &Tree<Var>,
    grad: &Tree<Var>,
) -> Result<(Tree<Var>, Tree<Var>)> {
    let log_lr = hyperparam(params, LOG_LR)?;
    let inv_sig_momentum = hyperparam(params, INV_SIG_MOMENTUM)?;
    let last_update = state.get(LAST_UPDATE).ok_or(MetaErr::StructureMismatch {
        what: "momentum state",
    })?;

    let lr = graph.exp(log_lr);
    let momentum = graph.sigmoid(inv_sig_momentum);

    let update = grad.try_zip_with(last_update, "gradient and momentum state", |&g, &v| {
        let step = graph.mul_scalar(lr, g)?;
        let velocity = graph.mul_scalar(momentum, v)?;
        graph.add(step, velocity)
    })?;

    let updated = weights.try_zip_with(&update, "weights and update", |&w, &u| graph.sub(w, u))?;

    Ok((Tree::named([(LAST_UPDATE, update)]), updated))
}

fn hyperparam(params: &Tree<Var>, key: &str) -> Result<Var> {
    params
        .get(key)
        .and_then(Tree::as_leaf)
        .copied()
        .ok_or(MetaErr::StructureMismatch {
            what: "momentum hyperparameters",
        })
}

/// Gradient descent with momentum, with its hyperparameters smuggled through invertible
/// reparameterizations.
#[derive(Debug, Default, Clone, Copy)]
pub struct Momentum;

impl Momentum {
    /// Creates a new `Momentum` optimizer.
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for Momentum {
    fn init(&self, weights: &Tree<Tensor>, params: &Tree<Tensor>) -> Tree<Tensor> {
        init(weights, params)
    }

    fn update(
        &self,
        graph: &mut Graph,
        params: &Tree<Var>,
        state: &Tree<Var>,
        weights: &Tree<Var>,
        grad: &Tree<Var>,
    ) -> Result<(Tree<Var>, Tree<Var>)> {
        update(graph, params, state, weights, grad)
    }
}
