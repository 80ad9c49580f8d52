mod distance;
mod hungarian;

pub use distance::{layer_distance, layer_distance_values};
pub use hungarian::assign;

/// A relabeling of one hidden layer: neuron `k` of the reference network is neuron `perm[k]`
/// of the other one.
pub type Permutation = Vec<usize>;
