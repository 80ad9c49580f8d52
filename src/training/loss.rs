use crate::{
    MetaErr, Result, Tensor,
    arch::ForwardPass,
    autodiff::{Graph, Var},
    tree::Tree,
};

/// The exponent used when none is given: the loss is a sum of squared errors.
pub const DEFAULT_POWER: f64 = 2.;

/// A supervised problem: a model, the data it's fed, and what it should output.
pub struct Task<'a, F: ?Sized> {
    pub forward_pass: &'a F,
    pub inputs: &'a Tensor,
    pub ground_truth: &'a Tensor,
    pub power: f64,
}

impl<F: ?Sized> Clone for Task<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: ?Sized> Copy for Task<'_, F> {}

impl<'a, F: ForwardPass + ?Sized> Task<'a, F> {
    /// Creates a new `Task` with the default loss exponent.
    ///
    /// # Arguments
    /// * `forward_pass` - The model, `[batch, ndim_in] -> [batch, ndim_out]`.
    /// * `inputs` - The model's inputs.
    /// * `ground_truth` - The expected outputs, same shape as the model's outputs.
    pub fn new(forward_pass: &'a F, inputs: &'a Tensor, ground_truth: &'a Tensor) -> Self {
        Self {
            forward_pass,
            inputs,
            ground_truth,
            power: DEFAULT_POWER,
        }
    }

    /// Replaces the loss exponent.
    pub fn with_power(self, power: f64) -> Self {
        Self { power, ..self }
    }
}

/// Records `sum(|ground_truth - forward_pass(weights, inputs)|^power)` in `graph`.
///
/// # Returns
/// The 0-dimensional loss, or a `ShapeMismatch` if the model's output and the ground truth
/// disagree in shape.
pub fn traced_loss<F: ForwardPass + ?Sized>(
    graph: &mut Graph,
    weights: &Tree<Var>,
    task: Task<'_, F>,
) -> Result<Var> {
    let inputs = graph.constant(task.inputs.clone());
    let outputs = task.forward_pass.forward(graph, weights, inputs)?;

    if graph.shape(outputs) != task.ground_truth.shape() {
        return Err(MetaErr::ShapeMismatch {
            what: "model outputs",
            got: graph.shape(outputs).to_vec(),
            expected: task.ground_truth.shape().to_vec(),
        });
    }

    let ground_truth = graph.constant(task.ground_truth.clone());
    let error = graph.sub(ground_truth, outputs)?;
    let error = graph.abs(error);
    let error = graph.pow_const(error, task.power);

    Ok(graph.sum(error))
}

/// Computes the loss of `weights` on `task`.
pub fn loss<F: ForwardPass + ?Sized>(weights: &Tree<Tensor>, task: Task<'_, F>) -> Result<f64> {
    let mut graph = Graph::new();
    let weights = graph.lift(weights);
    let loss = traced_loss(&mut graph, &weights, task)?;
    graph.item(loss)
}

/// Computes the loss of `weights` on `task` and its gradient with respect to `weights`.
///
/// # Returns
/// A tuple with the loss and a gradient tree shaped like `weights`.
pub fn loss_and_grad<F: ForwardPass + ?Sized>(
    weights: &Tree<Tensor>,
    task: Task<'_, F>,
) -> Result<(f64, Tree<Tensor>)> {
    let mut graph = Graph::new();
    let weights = graph.lift(weights);
    let loss = traced_loss(&mut graph, &weights, task)?;
    let grad = graph.grad_tree(loss, &weights)?;

    Ok((graph.item(loss)?, graph.eval(&grad)))
}
