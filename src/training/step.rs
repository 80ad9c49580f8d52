use log::debug;

use super::{Task, check_finite, loss_and_grad};
use crate::{
    Result, Tensor, arch::ForwardPass, config::MetaConfig, optimization::Optimizer, tree::Tree,
};

/// The outcome of a plain training step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub weights: Tree<Tensor>,
    pub opt_state: Tree<Tensor>,
    /// The loss before the update.
    pub loss: f64,
}

/// Takes one optimization step on `task` with fixed hyperparameters.
///
/// # Arguments
/// * `weights` - The current weights.
/// * `task` - The problem the weights are trained on.
/// * `optimizer` - The update rule.
/// * `opt_params` - The optimizer's hyperparameters.
/// * `opt_state` - The optimizer's running state.
///
/// # Returns
/// The updated weights and state, and the loss measured before updating.
pub fn step<F, O>(
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
) -> Result<Step>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    let (loss, dldw) = loss_and_grad(weights, task)?;
    let (opt_state, weights) = optimizer.apply(opt_params, opt_state, weights, &dldw)?;
    debug!(loss = loss; "optimization step");

    Ok(Step {
        weights,
        opt_state,
        loss,
    })
}

/// Like `step`, validating its inputs first when `config.check_finite` is set.
pub fn step_with<F, O>(
    config: &MetaConfig,
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
) -> Result<Step>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    if config.check_finite {
        check_finite(weights, "weights")?;
        check_finite(opt_params, "optimizer hyperparameters")?;
        check_finite(opt_state, "optimizer state")?;
    }

    step(weights, task, optimizer, opt_params, opt_state)
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;
    use crate::{
        MetaErr,
        arch::Feedforward,
        arch::activations::ActFn,
        optimization::{Momentum, momentum::defaults},
    };

    fn weights(bias: f64) -> Tree<Tensor> {
        Tree::seq([
            Tree::seq([Tree::leaf(arr2(&[[1., 2.]]).into_dyn())]),
            Tree::seq([Tree::leaf(ndarray::arr1(&[bias]).into_dyn())]),
        ])
    }

    #[test]
    fn reports_the_loss_before_updating() {
        let net = Feedforward::new(ActFn::Identity);
        let inputs = arr2(&[[1., 0.5]]).into_dyn();
        let truth = arr2(&[[3.]]).into_dyn();
        let params = defaults(0.1, 0.5).unwrap().to_tree();
        let w = weights(0.);
        let state = Momentum.init(&w, &params);

        let out = step(&w, Task::new(&net, &inputs, &truth), &Momentum, &params, &state).unwrap();

        // output 2 against 3, gradient -2 * [1, 0.5] on W and -2 on B
        assert_eq!(out.loss, 1.);
        let expected = Tree::seq([
            Tree::seq([Tree::leaf(arr2(&[[1.2, 2.1]]).into_dyn())]),
            Tree::seq([Tree::leaf(ndarray::arr1(&[0.2]).into_dyn())]),
        ]);
        assert!(out.weights.max_abs_diff(&expected).unwrap() < 1e-12);
    }

    #[test]
    fn guard_is_opt_in() {
        let net = Feedforward::new(ActFn::Identity);
        let inputs = arr2(&[[1., 0.5]]).into_dyn();
        let truth = arr2(&[[3.]]).into_dyn();
        let task = Task::new(&net, &inputs, &truth);
        let params = defaults(0.1, 0.5).unwrap().to_tree();
        let w = weights(f64::INFINITY);
        let state = Momentum.init(&w, &params);
        let guarded = MetaConfig {
            check_finite: true,
            ..Default::default()
        };

        let err = step_with(&guarded, &w, task, &Momentum, &params, &state).unwrap_err();
        assert_eq!(err, MetaErr::NonFinite { what: "weights" });
        assert!(step_with(&MetaConfig::default(), &w, task, &Momentum, &params, &state).is_ok());
    }
}
