use std::collections::BTreeMap;

use crate::{MetaErr, Result, Tensor};

/// A nested container of values: weights, gradients, optimizer state and hyperparameters
/// are all trees of tensors, their traced counterparts are trees of graph variables.
///
/// Leaves are always visited depth-first, sequences in order and maps in key order, so two
/// trees with the same structure list their leaves in corresponding positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    Seq(Vec<Tree<T>>),
    Map(BTreeMap<String, Tree<T>>),
}

impl<T> Tree<T> {
    /// Creates a new leaf.
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    /// Creates a new ordered sequence of subtrees.
    pub fn seq<I>(children: I) -> Self
    where
        I: IntoIterator<Item = Tree<T>>,
    {
        Self::Seq(children.into_iter().collect())
    }

    /// Creates a new named mapping of subtrees.
    pub fn named<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Tree<T>)>,
        K: Into<String>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Tree::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Tree<T>]> {
        match self {
            Tree::Seq(children) => Some(children),
            _ => None,
        }
    }

    /// Returns the subtree under `key` if this tree is a map containing it.
    pub fn get(&self, key: &str) -> Option<&Tree<T>> {
        match self {
            Tree::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Returns every leaf in traversal order.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Tree::Leaf(value) => out.push(value),
            Tree::Seq(children) => children.iter().for_each(|c| c.collect_leaves(out)),
            Tree::Map(entries) => entries.values().for_each(|c| c.collect_leaves(out)),
        }
    }

    /// Returns the amount of leaves in the tree.
    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Seq(children) => children.iter().map(Tree::num_leaves).sum(),
            Tree::Map(entries) => entries.values().map(Tree::num_leaves).sum(),
        }
    }

    /// Whether both trees have the same nesting, sequence lengths and map keys.
    pub fn same_structure<U>(&self, other: &Tree<U>) -> bool {
        match (self, other) {
            (Tree::Leaf(_), Tree::Leaf(_)) => true,
            (Tree::Seq(a), Tree::Seq(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_structure(b))
            }
            (Tree::Map(a), Tree::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, a), (kb, b))| ka == kb && a.same_structure(b))
            }
            _ => false,
        }
    }

    /// Applies `f` to every leaf, keeping the structure.
    pub fn map<U, F>(&self, mut f: F) -> Tree<U>
    where
        F: FnMut(&T) -> U,
    {
        self.map_inner(&mut f)
    }

    fn map_inner<U, F>(&self, f: &mut F) -> Tree<U>
    where
        F: FnMut(&T) -> U,
    {
        match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)),
            Tree::Seq(children) => Tree::Seq(children.iter().map(|c| c.map_inner(f)).collect()),
            Tree::Map(entries) => Tree::Map(
                entries
                    .iter()
                    .map(|(k, c)| (k.clone(), c.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Applies a fallible `f` to every leaf, stopping at the first error.
    pub fn try_map<U, F>(&self, mut f: F) -> Result<Tree<U>>
    where
        F: FnMut(&T) -> Result<U>,
    {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U, F>(&self, f: &mut F) -> Result<Tree<U>>
    where
        F: FnMut(&T) -> Result<U>,
    {
        let tree = match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)?),
            Tree::Seq(children) => Tree::Seq(
                children
                    .iter()
                    .map(|c| c.try_map_inner(f))
                    .collect::<Result<_>>()?,
            ),
            Tree::Map(entries) => Tree::Map(
                entries
                    .iter()
                    .map(|(k, c)| Ok((k.clone(), c.try_map_inner(f)?)))
                    .collect::<Result<_>>()?,
            ),
        };

        Ok(tree)
    }

    /// Combines two structurally identical trees leaf by leaf.
    ///
    /// # Arguments
    /// * `other` - The tree to zip with.
    /// * `what` - A description of the pair of trees, used in the error.
    /// * `f` - The fallible leaf combinator.
    ///
    /// # Returns
    /// The combined tree, or `StructureMismatch` if the trees differ in structure.
    pub fn try_zip_with<U, V, F>(&self, other: &Tree<U>, what: &'static str, mut f: F) -> Result<Tree<V>>
    where
        F: FnMut(&T, &U) -> Result<V>,
    {
        if !self.same_structure(other) {
            return Err(MetaErr::StructureMismatch { what });
        }

        let mut rhs = other.leaves().into_iter();
        self.try_map(|a| match rhs.next() {
            Some(b) => f(a, b),
            None => Err(MetaErr::StructureMismatch { what }),
        })
    }

    /// Infallible leaf combinator counterpart of `try_zip_with`; only the structure check
    /// can fail.
    pub fn zip_with<U, V, F>(&self, other: &Tree<U>, what: &'static str, mut f: F) -> Result<Tree<V>>
    where
        F: FnMut(&T, &U) -> V,
    {
        self.try_zip_with(other, what, |a, b| Ok(f(a, b)))
    }

    /// Folds every leaf into an accumulator in traversal order.
    pub fn fold<A, F>(&self, init: A, mut f: F) -> A
    where
        F: FnMut(A, &T) -> A,
    {
        self.leaves().into_iter().fold(init, |acc, leaf| f(acc, leaf))
    }

    /// Builds a tree with this tree's structure out of a flat list of leaves.
    ///
    /// # Returns
    /// The new tree or `StructureMismatch` if the amount of leaves differs.
    pub fn with_leaves<U>(&self, leaves: Vec<U>) -> Result<Tree<U>> {
        if leaves.len() != self.num_leaves() {
            return Err(MetaErr::StructureMismatch {
                what: "tree and flat leaves",
            });
        }

        let mut leaves = leaves.into_iter();
        self.try_map(|_| {
            leaves.next().ok_or(MetaErr::StructureMismatch {
                what: "tree and flat leaves",
            })
        })
    }
}

impl Tree<Tensor> {
    /// A tree with the same structure and shapes, every leaf zeroed.
    pub fn zeros_like(&self) -> Self {
        self.map(|t| Tensor::zeros(t.raw_dim()))
    }

    /// Whether every element of every leaf is finite.
    pub fn is_finite(&self) -> bool {
        self.fold(true, |acc, t| acc && t.iter().all(|x| x.is_finite()))
    }

    /// Largest absolute elementwise difference against another tree.
    pub fn max_abs_diff(&self, other: &Tree<Tensor>) -> Result<f64> {
        let diffs = self.try_zip_with(other, "compared trees", |a, b| {
            if a.shape() != b.shape() {
                return Err(MetaErr::ShapeMismatch {
                    what: "compared leaves",
                    got: a.shape().to_vec(),
                    expected: b.shape().to_vec(),
                });
            }

            Ok(a.iter()
                .zip(b.iter())
                .fold(0f64, |m, (x, y)| m.max((x - y).abs())))
        })?;

        Ok(diffs.fold(0f64, |m, d| m.max(*d)))
    }
}
