use crate::{
    Result,
    autodiff::{Graph, Var},
    tree::Tree,
};

/// A model's prediction function: `(weights, inputs) -> outputs`.
///
/// Implementors must be pure and record every operation in `graph`, since the training core
/// differentiates through them. Inputs are `[batch, ndim_in]` and outputs `[batch, ndim_out]`.
pub trait ForwardPass {
    fn forward(&self, graph: &mut Graph, weights: &Tree<Var>, inputs: Var) -> Result<Var>;
}

impl<F> ForwardPass for F
where
    F: Fn(&mut Graph, &Tree<Var>, Var) -> Result<Var>,
{
    fn forward(&self, graph: &mut Graph, weights: &Tree<Var>, inputs: Var) -> Result<Var> {
        self(graph, weights, inputs)
    }
}
