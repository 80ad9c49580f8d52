use std::f64::consts::FRAC_2_PI;

use crate::{
    Result,
    autodiff::{Graph, Var},
};

const GELU_CUBIC: f64 = 0.044715;

/// The nonlinearity applied after a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActFn {
    Identity,
    Sigmoid,
    Tanh,
    /// The tanh approximation, `0.5 z (1 + tanh(sqrt(2/π) (z + 0.044715 z³)))`.
    #[default]
    Gelu,
}

impl ActFn {
    /// Records the activation of `z` in the graph.
    pub fn apply(&self, graph: &mut Graph, z: Var) -> Result<Var> {
        match self {
            ActFn::Identity => Ok(z),
            ActFn::Sigmoid => Ok(graph.sigmoid(z)),
            ActFn::Tanh => Ok(graph.tanh(z)),
            ActFn::Gelu => gelu(graph, z),
        }
    }
}

fn gelu(graph: &mut Graph, z: Var) -> Result<Var> {
    let cube = graph.pow_const(z, 3.);
    let cube = graph.scale(cube, GELU_CUBIC);
    let inner = graph.add(z, cube)?;
    let inner = graph.scale(inner, FRAC_2_PI.sqrt());

    let gate = graph.tanh(inner);
    let gate = graph.add_const(gate, 1.);
    let gated = graph.mul(z, gate)?;
    Ok(graph.scale(gated, 0.5))
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn gelu_value(z: f64) -> f64 {
        let inner = FRAC_2_PI.sqrt() * (z + GELU_CUBIC * z.powi(3));
        0.5 * z * (1. + inner.tanh())
    }

    #[test]
    fn gelu_is_the_default() {
        assert_eq!(ActFn::default(), ActFn::Gelu);
    }

    #[test]
    fn gelu_matches_the_tanh_approximation() {
        let mut graph = Graph::new();
        let z = graph.constant(arr1(&[-2., -0.5, 0., 1., 3.]).into_dyn());

        let y = ActFn::Gelu.apply(&mut graph, z).unwrap();

        for (&z, &y) in [-2., -0.5, 0., 1., 3.].iter().zip(graph.value(y)) {
            assert!((y - gelu_value(z)).abs() < 1e-12, "gelu({z}) = {y}");
        }
        // close to relu away from zero
        assert!((gelu_value(3.) - 3.).abs() < 1e-2);
        assert!(gelu_value(-3.).abs() < 1e-2);
    }

    #[test]
    fn gelu_gradient_matches_finite_differences() {
        let eps = 1e-6;

        for z0 in [-1.5, -0.2, 0., 0.7, 2.] {
            let mut graph = Graph::new();
            let z = graph.scalar(z0);
            let y = ActFn::Gelu.apply(&mut graph, z).unwrap();
            let dz = graph.grad(y, &[z]).unwrap()[0];

            let numeric = (gelu_value(z0 + eps) - gelu_value(z0 - eps)) / (2. * eps);
            let analytic = graph.item(dz).unwrap();
            assert!((analytic - numeric).abs() < 1e-6, "z = {z0}: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn simple_activations_are_applied_elementwise() {
        let mut graph = Graph::new();
        let z = graph.scalar(0.3);

        let identity = ActFn::Identity.apply(&mut graph, z).unwrap();
        let sigmoid = ActFn::Sigmoid.apply(&mut graph, z).unwrap();
        let tanh = ActFn::Tanh.apply(&mut graph, z).unwrap();

        assert_eq!(identity, z);
        assert!((graph.item(sigmoid).unwrap() - 1. / (1. + (-0.3f64).exp())).abs() < 1e-12);
        assert!((graph.item(tanh).unwrap() - 0.3f64.tanh()).abs() < 1e-12);
    }
}
