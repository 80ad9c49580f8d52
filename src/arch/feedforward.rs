use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{ForwardPass, activations::ActFn};
use crate::{
    MetaErr, Result, Tensor,
    autodiff::{Graph, Var},
    tree::Tree,
};

/// A fully connected network, `x <- act_fn(x @ W_iᵀ + B_i)` for every layer.
///
/// The weight tree is `Seq[Seq[W_0, .., W_n], Seq[B_0, .., B_n]]` where `W_i` has shape
/// `[out_i, in_i]` and `B_i` has shape `[out_i]`. Inputs are `[batch, in_0]`.
#[derive(Debug, Clone, Copy)]
pub struct Feedforward {
    act_fn: ActFn,
}

impl Feedforward {
    /// Creates a new `Feedforward` forward pass.
    ///
    /// # Arguments
    /// * `act_fn` - The nonlinearity applied after every layer, the last one included.
    pub fn new(act_fn: ActFn) -> Self {
        Self { act_fn }
    }
}

impl ForwardPass for Feedforward {
    fn forward(&self, graph: &mut Graph, weights: &Tree<Var>, inputs: Var) -> Result<Var> {
        let layers = Layers::split(weights)?;
        let biases = layers.biases.ok_or(MetaErr::StructureMismatch {
            what: "feedforward weights and biases",
        })?;

        let mut x = inputs;
        for (w, b) in layers.weights.iter().zip(biases) {
            let w = leaf(w)?;
            let b = leaf(b)?;

            let wt = graph.transpose(w);
            let z = graph.matmul(x, wt)?;
            let shape = graph.shape(z).to_vec();
            let b = graph.broadcast(b, &shape)?;
            let z = graph.add(z, b)?;

            x = self.act_fn.apply(graph, z)?;
        }

        Ok(x)
    }
}

/// The per-layer view of a weight tree.
///
/// Either the feedforward layout (weights and biases) or a plain sequence of 2-dimensional
/// weight leaves.
pub(crate) struct Layers<'a, T> {
    pub(crate) weights: &'a [Tree<T>],
    pub(crate) biases: Option<&'a [Tree<T>]>,
}

impl<'a, T> Layers<'a, T> {
    pub(crate) fn split(tree: &'a Tree<T>) -> Result<Self> {
        let Some(children) = tree.as_seq() else {
            return Err(MetaErr::StructureMismatch {
                what: "layered weights",
            });
        };

        if let [Tree::Seq(weights), Tree::Seq(biases)] = children {
            if weights.len() != biases.len() {
                return Err(MetaErr::StructureMismatch {
                    what: "feedforward weights and biases",
                });
            }

            return Ok(Self {
                weights,
                biases: Some(biases),
            });
        }

        if children.iter().all(|c| c.as_leaf().is_some()) {
            return Ok(Self {
                weights: children,
                biases: None,
            });
        }

        Err(MetaErr::StructureMismatch {
            what: "layered weights",
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.weights.len()
    }

    /// Builds a tree with the same layout as the split one.
    pub(crate) fn rebuild<U>(&self, weights: Vec<Tree<U>>, biases: Vec<Tree<U>>) -> Tree<U> {
        match self.biases {
            Some(_) => Tree::seq([Tree::Seq(weights), Tree::Seq(biases)]),
            None => Tree::Seq(weights),
        }
    }
}

fn leaf<T: Copy>(tree: &Tree<T>) -> Result<T> {
    tree.as_leaf().copied().ok_or(MetaErr::StructureMismatch {
        what: "layer leaf",
    })
}

/// Initializes a feedforward weight tree with He (Kaiming) normal weights and zero biases.
///
/// # Arguments
/// * `sizes` - The width of every layer, input and output included.
/// * `rng` - A random number generator.
///
/// # Returns
/// The weight tree, or an error if fewer than two sizes are given or a size is zero.
pub fn feedforward_init<R: Rng>(sizes: &[usize], rng: &mut R) -> Result<Tree<Tensor>> {
    if sizes.len() < 2 {
        return Err(MetaErr::Config(format!(
            "a feedforward network needs at least 2 layer sizes, got {}",
            sizes.len()
        )));
    }

    let mut weights = Vec::with_capacity(sizes.len() - 1);
    let mut biases = Vec::with_capacity(sizes.len() - 1);

    for dim in sizes.windows(2) {
        let (fan_in, fan_out) = (dim[0], dim[1]);
        let std_dev = (2. / fan_in as f64).sqrt();
        let normal = Normal::new(0., std_dev).map_err(|_| MetaErr::Domain {
            what: "initializer standard deviation",
            value: std_dev,
        })?;

        let w = Tensor::from_shape_fn(vec![fan_out, fan_in], |_| normal.sample(&mut *rng));
        weights.push(Tree::leaf(w));
        biases.push(Tree::leaf(Tensor::zeros(vec![fan_out])));
    }

    Ok(Tree::seq([Tree::Seq(weights), Tree::Seq(biases)]))
}

/// Relabels the hidden neurons of a traced weight tree.
///
/// For hidden layer `i`, neuron `k` of the result is neuron `perms[i][k]` of the input: the
/// rows of `W_i`, the entries of `B_i` and the columns of `W_{i+1}` are reordered together, so
/// the network computes the same function.
///
/// # Returns
/// The relabeled tree, or an error if there isn't exactly one valid permutation per hidden
/// layer.
pub fn permute_hidden_traced(
    graph: &mut Graph,
    tree: &Tree<Var>,
    perms: &[Vec<usize>],
) -> Result<Tree<Var>> {
    let layers = Layers::split(tree)?;
    let n = layers.len();

    if perms.len() + 1 != n {
        return Err(MetaErr::ShapeMismatch {
            what: "hidden layer permutations",
            got: vec![perms.len()],
            expected: vec![n.saturating_sub(1)],
        });
    }

    let mut weights = Vec::with_capacity(n);
    let mut biases = Vec::with_capacity(n);

    for i in 0..n {
        let mut w = leaf(&layers.weights[i])?;
        if let Some(perm) = perms.get(i) {
            w = graph.permute(w, 0, perm)?;
        }
        if i > 0 {
            w = graph.permute(w, 1, &perms[i - 1])?;
        }
        weights.push(Tree::leaf(w));

        if let Some(bs) = layers.biases {
            let mut b = leaf(&bs[i])?;
            if let Some(perm) = perms.get(i) {
                b = graph.permute(b, 0, perm)?;
            }
            biases.push(Tree::leaf(b));
        }
    }

    Ok(layers.rebuild(weights, biases))
}

/// Concrete counterpart of `permute_hidden_traced`.
pub fn permute_hidden(tree: &Tree<Tensor>, perms: &[Vec<usize>]) -> Result<Tree<Tensor>> {
    let mut graph = Graph::new();
    let vars = graph.lift(tree);
    let permuted = permute_hidden_traced(&mut graph, &vars, perms)?;
    Ok(graph.eval(&permuted))
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn run(net: &Feedforward, weights: &Tree<Tensor>, x: &Tensor) -> Tensor {
        let mut graph = Graph::new();
        let w = graph.lift(weights);
        let x = graph.constant(x.clone());
        let y = net.forward(&mut graph, &w, x).unwrap();
        graph.value(y).clone()
    }

    #[test]
    fn init_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        let tree = feedforward_init(&[3, 5, 2], &mut rng).unwrap();
        let shapes: Vec<Vec<usize>> = tree.leaves().iter().map(|t| t.shape().to_vec()).collect();

        assert_eq!(shapes, [vec![5, 3], vec![2, 5], vec![5], vec![2]]);
        assert!(tree.is_finite());
        assert!(feedforward_init(&[3], &mut rng).is_err());
    }

    #[test]
    fn forward_computes_affine_layers() {
        let weights = Tree::seq([
            Tree::seq([Tree::leaf(arr2(&[[1., 2.], [0., -1.]]).into_dyn())]),
            Tree::seq([Tree::leaf(arr1(&[0.5, 1.]).into_dyn())]),
        ]);
        let x = arr2(&[[1., 1.], [2., 0.]]).into_dyn();

        let y = run(&Feedforward::new(ActFn::Identity), &weights, &x);
        assert_eq!(y, arr2(&[[3.5, 0.], [2.5, 1.]]).into_dyn());
    }

    #[test]
    fn permuting_hidden_neurons_preserves_the_function() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = feedforward_init(&[2, 4, 3, 1], &mut rng).unwrap();
        let perms = vec![vec![2, 0, 3, 1], vec![1, 2, 0]];
        let permuted = permute_hidden(&weights, &perms).unwrap();
        let net = Feedforward::new(ActFn::Tanh);
        let x = arr2(&[[0.3, -1.2], [1.5, 0.7], [0., 0.]]).into_dyn();

        assert_ne!(permuted, weights);
        let diff = (&run(&net, &weights, &x) - &run(&net, &permuted, &x))
            .iter()
            .fold(0f64, |m, d| m.max(d.abs()));
        assert!(diff < 1e-12);
    }

    #[test]
    fn permute_hidden_rejects_wrong_permutation_counts() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = feedforward_init(&[2, 3, 1], &mut rng).unwrap();

        assert!(permute_hidden(&weights, &[]).is_err());
        assert!(permute_hidden(&weights, &[vec![0, 1]]).is_err());
    }
}
