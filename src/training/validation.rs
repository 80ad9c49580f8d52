use log::warn;

use crate::{MetaErr, Result, Tensor, tree::Tree};

/// Fails with `NonFinite` if any element of any leaf of `tree` is `NaN` or infinite.
///
/// # Arguments
/// * `tree` - The tree to inspect.
/// * `what` - A name for `tree`, reported in the error.
pub fn check_finite(tree: &Tree<Tensor>, what: &'static str) -> Result<()> {
    if tree.is_finite() {
        return Ok(());
    }

    warn!("non-finite values in {what}");
    Err(MetaErr::NonFinite { what })
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    #[test]
    fn finite_trees_pass() {
        let tree = Tree::seq([Tree::leaf(arr1(&[1., -2.]).into_dyn())]);
        assert!(check_finite(&tree, "weights").is_ok());
        assert!(check_finite(&Tree::<Tensor>::Seq(vec![]), "weights").is_ok());
    }

    #[test]
    fn nan_and_infinities_are_reported() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let tree = Tree::named([("w", Tree::leaf(arr1(&[1., bad]).into_dyn()))]);
            assert_eq!(
                check_finite(&tree, "weights"),
                Err(MetaErr::NonFinite { what: "weights" })
            );
        }
    }
}
