use ndarray::Axis;

use super::Var;
use crate::Tensor;

/// Every operation the graph can record.
///
/// Constants (including detached values) have no inputs, so gradients never flow through them.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Constant,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Neg(Var),
    AddConst(Var),
    Scale(Var, f64),
    PowConst(Var, f64),
    Exp(Var),
    Log(Var),
    Sigmoid(Var),
    Tanh(Var),
    Abs(Var),
    MatMul(Var, Var),
    Transpose(Var),
    Broadcast(Var),
    SumTo(Var),
    Permute {
        input: Var,
        axis: usize,
        perm: Vec<usize>,
    },
}

impl Op {
    /// The graph variables this operation reads from.
    pub(crate) fn inputs(&self) -> Vec<Var> {
        use Op::*;

        match self {
            Constant => vec![],
            Add(a, b) | Sub(a, b) | Mul(a, b) | MatMul(a, b) => vec![*a, *b],
            Neg(a) | AddConst(a) | Scale(a, _) | PowConst(a, _) | Exp(a) | Log(a)
            | Sigmoid(a) | Tanh(a) | Abs(a) | Transpose(a) | Broadcast(a) | SumTo(a) => vec![*a],
            Permute { input, .. } => vec![*input],
        }
    }
}

/// The sign of `x`, zero at zero.
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

/// Sums `t` down to `shape`, the adjoint of broadcasting `shape` up to `t`'s shape.
///
/// # Returns
/// `None` if `shape` can't be broadcast to `t`'s shape.
pub(crate) fn reduce_to(t: &Tensor, shape: &[usize]) -> Option<Tensor> {
    if t.ndim() < shape.len() {
        return None;
    }

    let mut out = t.clone();
    while out.ndim() > shape.len() {
        out = out.sum_axis(Axis(0));
    }

    let dims = out.shape().to_vec();
    for (axis, (&have, &want)) in dims.iter().zip(shape).enumerate() {
        if have == want {
            continue;
        }

        if want != 1 {
            return None;
        }

        out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }

    Some(out)
}

/// Returns the permutation that undoes `perm`.
pub(crate) fn invert(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }

    inv
}

/// Whether `perm` contains every index in `0..perm.len()` exactly once.
pub(crate) fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }

    true
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    #[test]
    fn reduce_to_sums_leading_and_unit_axes() {
        let t = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();

        assert_eq!(reduce_to(&t, &[2]).unwrap(), arr1(&[4.0, 6.0]).into_dyn());
        assert_eq!(reduce_to(&t, &[2, 1]).unwrap(), arr2(&[[3.0], [7.0]]).into_dyn());
        assert_eq!(reduce_to(&t, &[]).unwrap().sum(), 10.0);
        assert!(reduce_to(&t, &[3]).is_none());
    }

    #[test]
    fn invert_undoes_the_permutation() {
        let perm = [2, 0, 3, 1];
        let inv = invert(&perm);

        for (i, &p) in perm.iter().enumerate() {
            assert_eq!(inv[p], i);
        }
        assert!(is_permutation(&perm));
        assert!(!is_permutation(&[0, 0, 1]));
        assert!(!is_permutation(&[0, 3]));
    }

    #[test]
    fn sign_is_zero_at_zero() {
        assert_eq!(sign(0.), 0.);
        assert_eq!(sign(-0.), 0.);
        assert_eq!(sign(3.), 1.);
        assert_eq!(sign(-2.), -1.);
    }
}
