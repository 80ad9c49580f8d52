use log::debug;
use ndarray::{Array2, ArrayView1, Axis, Ix1, Ix2};

use super::{Permutation, hungarian};
use crate::{
    MetaErr, Result, Tensor,
    arch::{Layers, permute_hidden_traced},
    autodiff::{Graph, Var},
    tree::Tree,
};

/// Computes a permutation-invariant distance between traced `actual` weights and a known
/// `ideal` weight tree.
///
/// Hidden neurons are matched layer by layer: neuron `k` of `ideal` is paired with the
/// `actual` neuron whose incoming weights (already aligned by the previous layer's matching)
/// and bias are closest in squared euclidean distance. The distance is the sum of squared
/// differences between the relabeled `actual` tree and `ideal`.
///
/// # Arguments
/// * `graph` - The graph `actual` lives in.
/// * `actual` - The traced weights, either the feedforward layout or a sequence of matrices.
/// * `ideal` - The reference weights, same structure and shapes as `actual`.
///
/// # Returns
/// The distance, differentiable with respect to `actual`, and one permutation per hidden
/// layer mapping each `ideal` neuron to the `actual` neuron it was matched with.
pub fn layer_distance(
    graph: &mut Graph,
    actual: &Tree<Var>,
    ideal: &Tree<Tensor>,
) -> Result<(Var, Vec<Permutation>)> {
    let actual_values = graph.eval(actual);
    actual_values.try_zip_with(ideal, "actual and ideal weights", |a, i| {
        check_same_shape(a, i)
    })?;

    let perms = match_neurons(&actual_values, ideal)?;
    let aligned = permute_hidden_traced(graph, actual, &perms)?;

    let squares = aligned.try_zip_with(ideal, "aligned and ideal weights", |&a, i| {
        let i = graph.constant(i.clone());
        let d = graph.sub(a, i)?;
        graph.mul(d, d)
    })?;
    let distance = graph.sum_tree(&squares)?;

    let value = graph.item(distance)?;
    debug!(distance = value, layers = perms.len(); "matched hidden neurons");
    Ok((distance, perms))
}

/// Concrete counterpart of `layer_distance`.
pub fn layer_distance_values(
    actual: &Tree<Tensor>,
    ideal: &Tree<Tensor>,
) -> Result<(f64, Vec<Permutation>)> {
    let mut graph = Graph::new();
    let actual = graph.lift(actual);
    let (distance, perms) = layer_distance(&mut graph, &actual, ideal)?;
    Ok((graph.item(distance)?, perms))
}

fn check_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(MetaErr::ShapeMismatch {
            what: "actual and ideal leaves",
            got: a.shape().to_vec(),
            expected: b.shape().to_vec(),
        });
    }

    Ok(())
}

/// Finds one permutation per hidden layer aligning `actual` to `ideal`.
fn match_neurons(actual: &Tree<Tensor>, ideal: &Tree<Tensor>) -> Result<Vec<Permutation>> {
    let actual = Layers::split(actual)?;
    let ideal = Layers::split(ideal)?;
    let hidden = actual.len().saturating_sub(1);

    let mut perms: Vec<Permutation> = Vec::with_capacity(hidden);
    for i in 0..hidden {
        let mut w = matrix(&actual.weights[i])?;
        if let Some(prev) = perms.last() {
            if w.ncols() != prev.len() {
                return Err(MetaErr::ShapeMismatch {
                    what: "layer inputs and previous layer outputs",
                    got: vec![w.ncols()],
                    expected: vec![prev.len()],
                });
            }
            w = w.select(Axis(1), prev);
        }
        let w_ideal = matrix(&ideal.weights[i])?;

        let biases = match (actual.biases, ideal.biases) {
            (Some(a), Some(b)) => {
                let (a, b) = (vector(&a[i])?, vector(&b[i])?);
                for bias in [&a, &b] {
                    if bias.len() != w.nrows() {
                        return Err(MetaErr::ShapeMismatch {
                            what: "layer biases and weight rows",
                            got: vec![bias.len()],
                            expected: vec![w.nrows()],
                        });
                    }
                }
                Some((a, b))
            }
            _ => None,
        };

        let cost = neuron_costs(&w, &w_ideal, biases);
        perms.push(hungarian::assign(&cost)?);
    }

    Ok(perms)
}

/// `cost[[k, j]]` is the squared distance between `ideal` neuron `k` and `actual` neuron `j`.
fn neuron_costs(
    actual: &Array2<f64>,
    ideal: &Array2<f64>,
    biases: Option<(ArrayView1<f64>, ArrayView1<f64>)>,
) -> Array2<f64> {
    let n = ideal.nrows();

    Array2::from_shape_fn((n, n), |(k, j)| {
        let incoming: f64 = ideal
            .row(k)
            .iter()
            .zip(actual.row(j))
            .map(|(i, a)| (i - a).powi(2))
            .sum();

        let bias = biases.map_or(0., |(a, i)| (i[k] - a[j]).powi(2));
        incoming + bias
    })
}

fn matrix(tree: &Tree<Tensor>) -> Result<Array2<f64>> {
    let t = tree.as_leaf().ok_or(MetaErr::StructureMismatch {
        what: "layer leaf",
    })?;

    t.view()
        .into_dimensionality::<Ix2>()
        .map(|m| m.to_owned())
        .map_err(|_| MetaErr::ShapeMismatch {
            what: "layer weights",
            got: t.shape().to_vec(),
            expected: vec![0, 0],
        })
}

fn vector(tree: &Tree<Tensor>) -> Result<ArrayView1<'_, f64>> {
    let t = tree.as_leaf().ok_or(MetaErr::StructureMismatch {
        what: "layer leaf",
    })?;

    t.view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| MetaErr::ShapeMismatch {
            what: "layer biases",
            got: t.shape().to_vec(),
            expected: vec![0],
        })
}

#[cfg(test)]
mod tests {
    use ndarray::{IxDyn, arr2};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::{feedforward_init, permute_hidden};

    #[test]
    fn identical_trees_are_at_distance_zero_with_identity_permutations() {
        let mut rng = StdRng::seed_from_u64(3);
        let ideal = feedforward_init(&[2, 5, 4, 1], &mut rng).unwrap();

        let (distance, perms) = layer_distance_values(&ideal, &ideal).unwrap();

        assert_eq!(distance, 0.);
        assert_eq!(perms, [vec![0, 1, 2, 3, 4], vec![0, 1, 2, 3]]);
    }

    #[test]
    fn scrambled_neurons_are_recovered() {
        let mut rng = StdRng::seed_from_u64(5);
        let ideal = feedforward_init(&[3, 6, 4, 2], &mut rng).unwrap();
        let actual = permute_hidden(&ideal, &[vec![4, 2, 0, 5, 1, 3], vec![3, 1, 0, 2]]).unwrap();

        let (distance, perms) = layer_distance_values(&actual, &ideal).unwrap();

        assert!(distance < 1e-20, "distance = {distance}");
        assert_eq!(permute_hidden(&actual, &perms).unwrap(), ideal);
    }

    #[test]
    fn distance_is_the_squared_error_after_alignment() {
        let ideal = Tree::seq([
            Tree::leaf(arr2(&[[1., 0.], [0., 1.]]).into_dyn()),
            Tree::leaf(arr2(&[[1., 2.]]).into_dyn()),
        ]);
        // hidden neurons swapped, then the first output weight nudged by 0.5
        let actual = Tree::seq([
            Tree::leaf(arr2(&[[0., 1.], [1., 0.]]).into_dyn()),
            Tree::leaf(arr2(&[[2., 1.5]]).into_dyn()),
        ]);

        let (distance, perms) = layer_distance_values(&actual, &ideal).unwrap();

        assert_eq!(perms, [vec![1, 0]]);
        assert!((distance - 0.25).abs() < 1e-12);
    }

    #[test]
    fn distance_is_differentiable_in_the_actual_weights() {
        let ideal = Tree::seq([Tree::leaf(arr2(&[[1., 2.]]).into_dyn())]);
        let actual = Tree::seq([Tree::leaf(arr2(&[[2., 2.]]).into_dyn())]);

        let mut graph = Graph::new();
        let vars = graph.lift(&actual);
        let (distance, perms) = layer_distance(&mut graph, &vars, &ideal).unwrap();
        let grad = graph.grad_tree(distance, &vars).unwrap();

        assert!(perms.is_empty());
        assert_eq!(graph.eval(&grad), Tree::seq([Tree::leaf(arr2(&[[2., 0.]]).into_dyn())]));
    }

    #[test]
    fn broken_layer_chains_are_rejected() {
        let chain = Tree::seq([
            Tree::leaf(Tensor::zeros(IxDyn(&[5, 3]))),
            Tree::leaf(Tensor::zeros(IxDyn(&[2, 2]))),
            Tree::leaf(Tensor::zeros(IxDyn(&[1, 2]))),
        ]);

        assert!(matches!(
            layer_distance_values(&chain, &chain),
            Err(MetaErr::ShapeMismatch {
                what: "layer inputs and previous layer outputs",
                ..
            })
        ));
    }

    #[test]
    fn biases_must_match_their_weight_rows() {
        let tree = Tree::seq([
            Tree::seq([
                Tree::leaf(Tensor::zeros(IxDyn(&[3, 2]))),
                Tree::leaf(Tensor::zeros(IxDyn(&[1, 3]))),
            ]),
            Tree::seq([
                Tree::leaf(Tensor::zeros(IxDyn(&[2]))),
                Tree::leaf(Tensor::zeros(IxDyn(&[1]))),
            ]),
        ]);

        assert!(matches!(
            layer_distance_values(&tree, &tree),
            Err(MetaErr::ShapeMismatch {
                what: "layer biases and weight rows",
                ..
            })
        ));
    }

    #[test]
    fn mismatched_trees_are_rejected() {
        let ideal = Tree::seq([Tree::leaf(arr2(&[[1., 2.]]).into_dyn())]);
        let actual = Tree::seq([Tree::leaf(arr2(&[[1.], [2.]]).into_dyn())]);

        assert!(matches!(
            layer_distance_values(&actual, &ideal),
            Err(MetaErr::ShapeMismatch { .. })
        ));
    }
}
