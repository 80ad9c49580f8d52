use log::debug;

use super::{Task, check_finite, loss_and_grad, traced_loss};
use crate::{
    Result, Tensor,
    arch::ForwardPass,
    autodiff::{Graph, Var},
    config::MetaConfig,
    optimization::Optimizer,
    permutations::{Permutation, layer_distance},
    tree::Tree,
};

/// The default step size of the hyperparameter update, `θ' = θ - OPTIMIZER_LR * dL/dθ`.
pub const OPTIMIZER_LR: f64 = 0.25;

/// The outcome of a `step_downhill` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Downhill {
    pub weights: Tree<Tensor>,
    pub opt_state: Tree<Tensor>,
    pub opt_params: Tree<Tensor>,
    /// The loss at the weights passed in, before the update.
    pub loss: f64,
    /// The gradient at the weights passed in, to be passed as `last_dldw` on the next call.
    pub dldw: Tree<Tensor>,
}

/// The outcome of a `step_global` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub weights: Tree<Tensor>,
    pub opt_state: Tree<Tensor>,
    pub opt_params: Tree<Tensor>,
    /// How the updated weights' hidden neurons were matched to the global minimum.
    pub perm: Vec<Permutation>,
    /// The task loss before the update.
    pub loss: f64,
    /// The distance from the updated weights to the global minimum.
    pub distance: f64,
}

/// Records an optimizer step driven by `last_dldw` and the loss at the weights it starts
/// from.
///
/// The step only uses the previous gradient, so the gradient of the returned loss with
/// respect to `weights` is fresh while the weights move one gradient behind.
///
/// # Returns
/// The loss, and a tuple with the new weights and the new optimizer state.
pub fn traced_update_and_retest<F, O>(
    graph: &mut Graph,
    weights: &Tree<Var>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Var>,
    opt_state: &Tree<Var>,
    last_dldw: &Tree<Var>,
) -> Result<(Var, (Tree<Var>, Tree<Var>))>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    let (new_state, new_weights) =
        optimizer.update(graph, opt_params, opt_state, weights, last_dldw)?;
    let loss = traced_loss(graph, weights, task)?;

    Ok((loss, (new_weights, new_state)))
}

/// Concrete counterpart of `traced_update_and_retest`.
pub fn update_and_retest<F, O>(
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    last_dldw: &Tree<Tensor>,
) -> Result<(f64, (Tree<Tensor>, Tree<Tensor>))>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    let mut graph = Graph::new();
    let weights = graph.lift(weights);
    let params = graph.lift(opt_params);
    let state = graph.lift(opt_state);
    let last_dldw = graph.lift(last_dldw);

    let (loss, (weights, state)) = traced_update_and_retest(
        &mut graph, &weights, task, optimizer, &params, &state, &last_dldw,
    )?;

    Ok((graph.item(loss)?, (graph.eval(&weights), graph.eval(&state))))
}

/// Records how far the optimizer's step strays from plain descent along `dldw`.
///
/// With `actual` the optimizer's new weights, this is `Σ |(detach(actual) - dldw) - actual|`.
/// Its value is `Σ |dldw|`, but its gradient only flows through the second `actual`, so
/// descending on it pushes the optimizer's output along `-dldw`.
pub fn traced_slope_away<O: Optimizer + ?Sized>(
    graph: &mut Graph,
    opt_params: &Tree<Var>,
    opt_state: &Tree<Var>,
    optimizer: &O,
    weights: &Tree<Var>,
    dldw: &Tree<Var>,
) -> Result<Var> {
    let (_, actual) = optimizer.update(graph, opt_params, opt_state, weights, dldw)?;

    let downhill = actual.try_zip_with(dldw, "updated weights and gradient", |&a, &g| {
        let forgotten = graph.detach(a);
        graph.sub(forgotten, g)
    })?;

    let gaps = downhill.try_zip_with(&actual, "downhill and updated weights", |&d, &a| {
        let gap = graph.sub(d, a)?;
        Ok(graph.abs(gap))
    })?;

    graph.sum_tree(&gaps)
}

/// Concrete counterpart of `traced_slope_away`. A zero gradient yields `0`.
pub fn slope_away_from_local_minimum<O: Optimizer + ?Sized>(
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    optimizer: &O,
    weights: &Tree<Tensor>,
    dldw: &Tree<Tensor>,
) -> Result<f64> {
    let mut graph = Graph::new();
    let params = graph.lift(opt_params);
    let state = graph.lift(opt_state);
    let weights = graph.lift(weights);
    let dldw = graph.lift(dldw);

    let slope = traced_slope_away(&mut graph, &params, &state, optimizer, &weights, &dldw)?;
    graph.item(slope)
}

/// Takes a training step with the gradient of the previous call, and a hyperparameter step
/// that makes the optimizer behave more like descent along the fresh gradient.
///
/// Uses `OPTIMIZER_LR` and no input validation, see `step_downhill_with`.
///
/// # Arguments
/// * `weights` - The current weights.
/// * `task` - The problem the weights are trained on.
/// * `optimizer` - The update rule.
/// * `opt_params` - The hyperparameters being trained.
/// * `opt_state` - The optimizer's running state.
/// * `last_dldw` - The `dldw` returned by the previous call, zeros on the first one.
pub fn step_downhill<F, O>(
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    last_dldw: &Tree<Tensor>,
) -> Result<Downhill>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    step_downhill_with(
        &MetaConfig::default(),
        weights,
        task,
        optimizer,
        opt_params,
        opt_state,
        last_dldw,
    )
}

/// Like `step_downhill`, with the meta learning rate and the finiteness guard taken from
/// `config`.
pub fn step_downhill_with<F, O>(
    config: &MetaConfig,
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    last_dldw: &Tree<Tensor>,
) -> Result<Downhill>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    if config.check_finite {
        check_finite(weights, "weights")?;
        check_finite(opt_params, "optimizer hyperparameters")?;
        check_finite(opt_state, "optimizer state")?;
        check_finite(last_dldw, "last gradient")?;
    }

    let mut graph = Graph::new();
    let w = graph.lift(weights);
    let params = graph.lift(opt_params);
    let state = graph.lift(opt_state);
    let last = graph.lift(last_dldw);

    let (loss, (new_weights, new_state)) =
        traced_update_and_retest(&mut graph, &w, task, optimizer, &params, &state, &last)?;
    let dldw = graph.grad_tree(loss, &w)?;
    let dldw = dldw.map(|&g| graph.detach(g));

    let slope = traced_slope_away(&mut graph, &params, &state, optimizer, &w, &dldw)?;
    let dldo = graph.grad_tree(slope, &params)?;
    let opt_params = descend(opt_params, &graph.eval(&dldo), config.meta_lr)?;

    let loss = graph.item(loss)?;
    let slope = graph.item(slope)?;
    debug!(loss = loss, slope = slope; "downhill step");

    Ok(Downhill {
        weights: graph.eval(&new_weights),
        opt_state: graph.eval(&new_state),
        opt_params,
        loss,
        dldw: graph.eval(&dldw),
    })
}

/// Records an optimizer step and the permutation-invariant distance from the weights it
/// reaches to `global_minimum`.
///
/// # Returns
/// The distance, and a tuple with the new state, the new weights and the hidden neuron
/// matching found.
pub fn traced_opt_step_global<O: Optimizer + ?Sized>(
    graph: &mut Graph,
    opt_params: &Tree<Var>,
    opt_state: &Tree<Var>,
    optimizer: &O,
    weights: &Tree<Var>,
    dldw: &Tree<Var>,
    global_minimum: &Tree<Tensor>,
) -> Result<(Var, (Tree<Var>, Tree<Var>, Vec<Permutation>))> {
    let (opt_state, weights) = optimizer.update(graph, opt_params, opt_state, weights, dldw)?;
    let (distance, perm) = layer_distance(graph, &weights, global_minimum)?;

    Ok((distance, (opt_state, weights, perm)))
}

/// Concrete counterpart of `traced_opt_step_global`.
pub fn opt_step_global<O: Optimizer + ?Sized>(
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    optimizer: &O,
    weights: &Tree<Tensor>,
    dldw: &Tree<Tensor>,
    global_minimum: &Tree<Tensor>,
) -> Result<(f64, (Tree<Tensor>, Tree<Tensor>, Vec<Permutation>))> {
    let mut graph = Graph::new();
    let params = graph.lift(opt_params);
    let state = graph.lift(opt_state);
    let weights = graph.lift(weights);
    let dldw = graph.lift(dldw);

    let (distance, (state, weights, perm)) = traced_opt_step_global(
        &mut graph,
        &params,
        &state,
        optimizer,
        &weights,
        &dldw,
        global_minimum,
    )?;

    Ok((
        graph.item(distance)?,
        (graph.eval(&state), graph.eval(&weights), perm),
    ))
}

/// Takes a training step, and a hyperparameter step that brings the updated weights closer
/// to a known global minimum, up to a relabeling of hidden neurons.
///
/// Uses `OPTIMIZER_LR` and no input validation, see `step_global_with`.
pub fn step_global<F, O>(
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    global_minimum: &Tree<Tensor>,
) -> Result<Global>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    step_global_with(
        &MetaConfig::default(),
        weights,
        task,
        optimizer,
        opt_params,
        opt_state,
        global_minimum,
    )
}

/// Like `step_global`, with the meta learning rate and the finiteness guard taken from
/// `config`.
pub fn step_global_with<F, O>(
    config: &MetaConfig,
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
    optimizer: &O,
    opt_params: &Tree<Tensor>,
    opt_state: &Tree<Tensor>,
    global_minimum: &Tree<Tensor>,
) -> Result<Global>
where
    F: ForwardPass + ?Sized,
    O: Optimizer + ?Sized,
{
    if config.check_finite {
        check_finite(weights, "weights")?;
        check_finite(opt_params, "optimizer hyperparameters")?;
        check_finite(opt_state, "optimizer state")?;
        check_finite(global_minimum, "global minimum")?;
    }

    let (loss, dldw) = loss_and_grad(weights, task)?;

    let mut graph = Graph::new();
    let params = graph.lift(opt_params);
    let state = graph.lift(opt_state);
    let w = graph.lift(weights);
    let dldw = graph.lift(&dldw);

    let (distance, (new_state, new_weights, perm)) = traced_opt_step_global(
        &mut graph,
        &params,
        &state,
        optimizer,
        &w,
        &dldw,
        global_minimum,
    )?;
    let dldo = graph.grad_tree(distance, &params)?;
    let opt_params = descend(opt_params, &graph.eval(&dldo), config.meta_lr)?;

    let distance = graph.item(distance)?;
    debug!(loss = loss, distance = distance; "global step");

    Ok(Global {
        weights: graph.eval(&new_weights),
        opt_state: graph.eval(&new_state),
        opt_params,
        perm,
        loss,
        distance,
    })
}

/// `params - meta_lr * grad`, leaf by leaf.
fn descend(params: &Tree<Tensor>, grad: &Tree<Tensor>, meta_lr: f64) -> Result<Tree<Tensor>> {
    params.zip_with(grad, "hyperparameters and their gradient", |p, g| {
        p - &(g * meta_lr)
    })
}
