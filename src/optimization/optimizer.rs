use crate::{
    Result, Tensor,
    autodiff::{Graph, Var},
    tree::Tree,
};

/// Defines how weights move from step `t` to step `t+1` given a gradient.
///
/// Unlike a regular optimizer, implementors are pure: the running state is passed in and a
/// new one is returned, and the update is recorded in a `Graph` so that its result can be
/// differentiated with respect to the hyperparameters themselves.
pub trait Optimizer {
    /// Builds the initial running state for the given weights.
    ///
    /// # Arguments
    /// * `weights` - The initial weights, only their structure and shapes are used.
    /// * `params` - The optimizer's hyperparameters.
    fn init(&self, weights: &Tree<Tensor>, params: &Tree<Tensor>) -> Tree<Tensor>;

    /// Records one optimization step in `graph`.
    ///
    /// # Arguments
    /// * `graph` - The graph the update is recorded in.
    /// * `params` - The traced hyperparameters.
    /// * `state` - The traced running state.
    /// * `weights` - The traced current weights.
    /// * `grad` - The traced gradient of the loss with respect to `weights`.
    ///
    /// # Returns
    /// A tuple with the new state and the new weights.
    fn update(
        &self,
        graph: &mut Graph,
        params: &Tree<Var>,
        state: &Tree<Var>,
        weights: &Tree<Var>,
        grad: &Tree<Var>,
    ) -> Result<(Tree<Var>, Tree<Var>)>;

    /// Runs `update` on concrete values.
    ///
    /// # Returns
    /// A tuple with the new state and the new weights.
    fn apply(
        &self,
        params: &Tree<Tensor>,
        state: &Tree<Tensor>,
        weights: &Tree<Tensor>,
        grad: &Tree<Tensor>,
    ) -> Result<(Tree<Tensor>, Tree<Tensor>)> {
        let mut graph = Graph::new();
        let params = graph.lift(params);
        let state = graph.lift(state);
        let weights = graph.lift(weights);
        let grad = graph.lift(grad);

        let (state, weights) = self.update(&mut graph, &params, &state, &weights, &grad)?;
        Ok((graph.eval(&state), graph.eval(&weights)))
    }
}
