use ndarray::{Axis, Ix2, IxDyn};

use super::op::{self, Op};
use crate::{MetaErr, Result, Tensor, tree::Tree};

/// A handle to a value recorded in a `Graph`.
///
/// A `Var` is an index into the graph that created it and is only meaningful there. Using
/// it with another graph reads an unrelated node, or panics if that graph is shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(pub(crate) usize);

struct Node {
    op: Op,
    value: Tensor,
}

/// An arena of recorded operations supporting reverse-mode differentiation.
///
/// `grad` records the backward pass in the same arena instead of computing raw numbers,
/// so the gradients it returns are graph variables themselves and can be differentiated
/// again (gradient of a gradient).
///
/// Every value is computed eagerly when its node is pushed, a graph is meant to live for a
/// single computation and be dropped afterwards.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Creates a new empty `Graph`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the amount of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, op: Op, value: Tensor) -> Var {
        self.nodes.push(Node { op, value });
        Var(self.nodes.len() - 1)
    }

    /// Records a constant tensor. Any variable can be differentiated against, constants
    /// included, so this is also how inputs and parameters enter the graph.
    pub fn constant(&mut self, value: Tensor) -> Var {
        self.push(Op::Constant, value)
    }

    /// Records a 0-dimensional constant.
    pub fn scalar(&mut self, value: f64) -> Var {
        self.constant(Tensor::from_elem(IxDyn(&[]), value))
    }

    /// Records a constant of zeros with `v`'s shape.
    pub fn zeros_like(&mut self, v: Var) -> Var {
        let zeros = Tensor::zeros(self.value(v).raw_dim());
        self.constant(zeros)
    }

    /// The stop-gradient primitive: a new variable with `v`'s value that contributes nothing
    /// to any gradient computed afterwards.
    pub fn detach(&mut self, v: Var) -> Var {
        let value = self.value(v).clone();
        self.constant(value)
    }

    pub fn value(&self, v: Var) -> &Tensor {
        &self.nodes[v.0].value
    }

    pub fn shape(&self, v: Var) -> &[usize] {
        self.nodes[v.0].value.shape()
    }

    /// Reads a single element variable as a number.
    pub fn item(&self, v: Var) -> Result<f64> {
        let value = self.value(v);
        if value.len() != 1 {
            return Err(MetaErr::NotScalar {
                got: value.shape().to_vec(),
            });
        }

        Ok(value.sum())
    }

    fn check_same_shape(&self, a: Var, b: Var, what: &'static str) -> Result<()> {
        if self.shape(a) != self.shape(b) {
            return Err(MetaErr::ShapeMismatch {
                what,
                got: self.shape(b).to_vec(),
                expected: self.shape(a).to_vec(),
            });
        }

        Ok(())
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        self.check_same_shape(a, b, "add operands")?;
        let value = self.value(a) + self.value(b);
        Ok(self.push(Op::Add(a, b), value))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var> {
        self.check_same_shape(a, b, "sub operands")?;
        let value = self.value(a) - self.value(b);
        Ok(self.push(Op::Sub(a, b), value))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var> {
        self.check_same_shape(a, b, "mul operands")?;
        let value = self.value(a) * self.value(b);
        Ok(self.push(Op::Mul(a, b), value))
    }

    /// Multiplies every element of `t` by the 0-dimensional variable `s`.
    pub fn mul_scalar(&mut self, s: Var, t: Var) -> Result<Var> {
        let shape = self.shape(t).to_vec();
        let s = self.broadcast(s, &shape)?;
        self.mul(s, t)
    }

    pub fn neg(&mut self, a: Var) -> Var {
        let value = -self.value(a);
        self.push(Op::Neg(a), value)
    }

    pub fn add_const(&mut self, a: Var, c: f64) -> Var {
        let value = self.value(a) + c;
        self.push(Op::AddConst(a), value)
    }

    pub fn scale(&mut self, a: Var, c: f64) -> Var {
        let value = self.value(a) * c;
        self.push(Op::Scale(a, c), value)
    }

    pub fn pow_const(&mut self, a: Var, p: f64) -> Var {
        let value = self.value(a).mapv(|x| x.powf(p));
        self.push(Op::PowConst(a, p), value)
    }

    pub fn exp(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::exp);
        self.push(Op::Exp(a), value)
    }

    pub fn log(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::ln);
        self.push(Op::Log(a), value)
    }

    pub fn sigmoid(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| 1. / (1. + (-x).exp()));
        self.push(Op::Sigmoid(a), value)
    }

    pub fn tanh(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::tanh);
        self.push(Op::Tanh(a), value)
    }

    pub fn abs(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f64::abs);
        self.push(Op::Abs(a), value)
    }

    /// Matrix product of two 2-dimensional variables.
    pub fn matmul(&mut self, a: Var, b: Var) -> Result<Var> {
        let value = {
            let lhs = self.as_matrix(a, "matmul lhs")?;
            let rhs = self.as_matrix(b, "matmul rhs")?;

            if lhs.ncols() != rhs.nrows() {
                return Err(MetaErr::ShapeMismatch {
                    what: "matmul inner dimensions",
                    got: vec![rhs.nrows()],
                    expected: vec![lhs.ncols()],
                });
            }

            lhs.dot(&rhs).into_dyn()
        };

        Ok(self.push(Op::MatMul(a, b), value))
    }

    fn as_matrix(&self, v: Var, what: &'static str) -> Result<ndarray::ArrayView2<'_, f64>> {
        self.value(v)
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| MetaErr::ShapeMismatch {
                what,
                got: self.shape(v).to_vec(),
                expected: vec![0, 0],
            })
    }

    /// Reverses the axes of `a`.
    pub fn transpose(&mut self, a: Var) -> Var {
        let value = self.value(a).t().to_owned();
        self.push(Op::Transpose(a), value)
    }

    /// Broadcasts `a` up to `shape` following the usual right-aligned rules.
    pub fn broadcast(&mut self, a: Var, shape: &[usize]) -> Result<Var> {
        let value = self
            .value(a)
            .broadcast(shape)
            .ok_or_else(|| MetaErr::ShapeMismatch {
                what: "broadcast",
                got: self.shape(a).to_vec(),
                expected: shape.to_vec(),
            })?
            .to_owned();

        Ok(self.push(Op::Broadcast(a), value))
    }

    /// Sums `a` down to `shape`, the inverse direction of `broadcast`.
    pub fn sum_to(&mut self, a: Var, shape: &[usize]) -> Result<Var> {
        let value = op::reduce_to(self.value(a), shape).ok_or_else(|| MetaErr::ShapeMismatch {
            what: "sum_to",
            got: self.shape(a).to_vec(),
            expected: shape.to_vec(),
        })?;

        Ok(self.push(Op::SumTo(a), value))
    }

    /// Sums every element of `a` into a 0-dimensional variable.
    pub fn sum(&mut self, a: Var) -> Var {
        let value = Tensor::from_elem(IxDyn(&[]), self.value(a).sum());
        self.push(Op::SumTo(a), value)
    }

    /// Reorders `a` along `axis` so that index `i` of the output is index `perm[i]` of `a`.
    pub fn permute(&mut self, a: Var, axis: usize, perm: &[usize]) -> Result<Var> {
        let len = self.shape(a).get(axis).copied();
        if len != Some(perm.len()) || !op::is_permutation(perm) {
            return Err(MetaErr::ShapeMismatch {
                what: "permutation",
                got: vec![perm.len()],
                expected: self.shape(a).to_vec(),
            });
        }

        let value = self.value(a).select(Axis(axis), perm);
        let op = Op::Permute {
            input: a,
            axis,
            perm: perm.to_vec(),
        };

        Ok(self.push(op, value))
    }

    /// Computes the gradient of the 0-dimensional `output` with respect to every variable in
    /// `wrt`.
    ///
    /// The gradients are recorded as new nodes, so they can be differentiated again.
    /// Variables `output` doesn't depend on get a zero gradient.
    ///
    /// # Returns
    /// One gradient per `wrt` variable, each with the shape of that variable, or `NotScalar`
    /// if `output` is not 0-dimensional.
    pub fn grad(&mut self, output: Var, wrt: &[Var]) -> Result<Vec<Var>> {
        if !self.shape(output).is_empty() {
            return Err(MetaErr::NotScalar {
                got: self.shape(output).to_vec(),
            });
        }

        let len = output.0 + 1;

        // nodes that depend on at least one of `wrt`
        let mut relevant = vec![false; len];
        for v in wrt.iter().filter(|v| v.0 < len) {
            relevant[v.0] = true;
        }
        for id in 0..len {
            if !relevant[id] {
                relevant[id] = self.nodes[id].op.inputs().iter().any(|i| relevant[i.0]);
            }
        }

        let mut adjoints: Vec<Option<Var>> = vec![None; len];
        adjoints[output.0] = Some(self.scalar(1.));

        for id in (0..len).rev() {
            let Some(g) = adjoints[id] else {
                continue;
            };

            if !relevant[id] {
                continue;
            }

            let op = self.nodes[id].op.clone();
            for (input, contrib) in self.backward(Var(id), &op, g, &relevant)? {
                adjoints[input.0] = match adjoints[input.0] {
                    Some(acc) => Some(self.add(acc, contrib)?),
                    None => Some(contrib),
                };
            }
        }

        let grads = wrt
            .iter()
            .map(|&v| match adjoints.get(v.0).copied().flatten() {
                Some(g) => g,
                None => self.zeros_like(v),
            })
            .collect();

        Ok(grads)
    }

    /// Records the contribution of `node`'s adjoint `g` to each of its relevant inputs.
    fn backward(&mut self, node: Var, op: &Op, g: Var, relevant: &[bool]) -> Result<Vec<(Var, Var)>> {
        let needs = |v: &Var| relevant[v.0];
        let mut contribs = Vec::with_capacity(2);

        match op {
            Op::Constant => {}
            Op::Add(a, b) => {
                if needs(a) {
                    contribs.push((*a, g));
                }
                if needs(b) {
                    contribs.push((*b, g));
                }
            }
            Op::Sub(a, b) => {
                if needs(a) {
                    contribs.push((*a, g));
                }
                if needs(b) {
                    contribs.push((*b, self.neg(g)));
                }
            }
            Op::Mul(a, b) => {
                if needs(a) {
                    contribs.push((*a, self.mul(g, *b)?));
                }
                if needs(b) {
                    contribs.push((*b, self.mul(g, *a)?));
                }
            }
            Op::Neg(a) => contribs.push((*a, self.neg(g))),
            Op::AddConst(a) => contribs.push((*a, g)),
            Op::Scale(a, c) => contribs.push((*a, self.scale(g, *c))),
            Op::PowConst(a, p) => {
                let d = self.pow_const(*a, p - 1.);
                let d = self.scale(d, *p);
                contribs.push((*a, self.mul(g, d)?));
            }
            Op::Exp(a) => contribs.push((*a, self.mul(g, node)?)),
            Op::Log(a) => {
                let recip = self.pow_const(*a, -1.);
                contribs.push((*a, self.mul(g, recip)?));
            }
            Op::Sigmoid(a) => {
                let one_minus = self.neg(node);
                let one_minus = self.add_const(one_minus, 1.);
                let d = self.mul(node, one_minus)?;
                contribs.push((*a, self.mul(g, d)?));
            }
            Op::Tanh(a) => {
                let sq = self.mul(node, node)?;
                let d = self.neg(sq);
                let d = self.add_const(d, 1.);
                contribs.push((*a, self.mul(g, d)?));
            }
            Op::Abs(a) => {
                let sign = self.value(*a).mapv(op::sign);
                let sign = self.constant(sign);
                contribs.push((*a, self.mul(g, sign)?));
            }
            Op::MatMul(a, b) => {
                if needs(a) {
                    let bt = self.transpose(*b);
                    contribs.push((*a, self.matmul(g, bt)?));
                }
                if needs(b) {
                    let at = self.transpose(*a);
                    contribs.push((*b, self.matmul(at, g)?));
                }
            }
            Op::Transpose(a) => contribs.push((*a, self.transpose(g))),
            Op::Broadcast(a) => {
                let shape = self.shape(*a).to_vec();
                contribs.push((*a, self.sum_to(g, &shape)?));
            }
            Op::SumTo(a) => {
                let shape = self.shape(*a).to_vec();
                contribs.push((*a, self.broadcast(g, &shape)?));
            }
            Op::Permute { input, axis, perm } => {
                let inv = op::invert(perm);
                contribs.push((*input, self.permute(g, *axis, &inv)?));
            }
        }

        contribs.retain(|(input, _)| needs(input));
        Ok(contribs)
    }

    /// Records every leaf of a concrete tree as a constant.
    pub fn lift(&mut self, tree: &Tree<Tensor>) -> Tree<Var> {
        tree.map(|t| self.constant(t.clone()))
    }

    /// Reads back the values of a traced tree.
    pub fn eval(&self, tree: &Tree<Var>) -> Tree<Tensor> {
        tree.map(|&v| self.value(v).clone())
    }

    /// Like `grad`, but for a whole tree of variables. The result keeps `wrt`'s structure.
    pub fn grad_tree(&mut self, output: Var, wrt: &Tree<Var>) -> Result<Tree<Var>> {
        let flat: Vec<Var> = wrt.leaves().into_iter().copied().collect();
        let grads = self.grad(output, &flat)?;
        wrt.with_leaves(grads)
    }

    /// Sums every element of every leaf of a traced tree into a 0-dimensional variable.
    pub fn sum_tree(&mut self, tree: &Tree<Var>) -> Result<Var> {
        let mut total = self.scalar(0.);
        for &leaf in tree.leaves() {
            let s = self.sum(leaf);
            total = self.add(total, s)?;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn gradient_of_a_polynomial() {
        let mut g = Graph::new();
        let x = g.scalar(3.);
        let x2 = g.mul(x, x).unwrap();
        let y = g.mul(x2, x).unwrap();

        let dx = g.grad(y, &[x]).unwrap()[0];
        assert!(close(g.item(dx).unwrap(), 27.));
    }

    #[test]
    fn gradients_can_be_differentiated_again() {
        let mut g = Graph::new();
        let x = g.scalar(2.);
        let y = g.pow_const(x, 3.);

        let dx = g.grad(y, &[x]).unwrap()[0];
        let ddx = g.grad(dx, &[x]).unwrap()[0];

        assert!(close(g.item(dx).unwrap(), 12.));
        assert!(close(g.item(ddx).unwrap(), 12.));
    }

    #[test]
    fn detached_values_carry_no_gradient() {
        let mut g = Graph::new();
        let x = g.scalar(5.);
        let frozen = g.detach(x);
        let y = g.mul(x, frozen).unwrap();

        let dx = g.grad(y, &[x]).unwrap()[0];
        assert!(close(g.value(frozen).sum(), 5.));
        assert!(close(g.item(dx).unwrap(), 5.));
    }

    #[test]
    fn unrelated_variables_get_zero_gradients() {
        let mut g = Graph::new();
        let x = g.constant(arr1(&[1., 2.]).into_dyn());
        let unrelated = g.constant(arr2(&[[1., 1.]]).into_dyn());
        let y = g.sum(x);

        let grads = g.grad(y, &[x, unrelated]).unwrap();
        assert_eq!(g.value(grads[0]), &arr1(&[1., 1.]).into_dyn());
        assert_eq!(g.value(grads[1]), &arr2(&[[0., 0.]]).into_dyn());
    }

    #[test]
    fn non_scalar_outputs_are_rejected() {
        let mut g = Graph::new();
        let x = g.constant(arr1(&[1., 2.]).into_dyn());
        assert!(matches!(g.grad(x, &[x]), Err(MetaErr::NotScalar { .. })));
    }

    #[test]
    fn elementwise_shape_mismatch_is_an_error() {
        let mut g = Graph::new();
        let a = g.constant(arr1(&[1., 2.]).into_dyn());
        let b = g.constant(arr1(&[1., 2., 3.]).into_dyn());
        assert!(matches!(g.add(a, b), Err(MetaErr::ShapeMismatch { .. })));
    }

    #[test]
    fn matmul_gradients() {
        let mut g = Graph::new();
        let a = g.constant(arr2(&[[1., 2.], [3., 4.]]).into_dyn());
        let b = g.constant(arr2(&[[5.], [6.]]).into_dyn());
        let c = g.matmul(a, b).unwrap();
        let y = g.sum(c);

        let grads = g.grad(y, &[a, b]).unwrap();
        assert_eq!(g.value(c), &arr2(&[[17.], [39.]]).into_dyn());
        assert_eq!(g.value(grads[0]), &arr2(&[[5., 6.], [5., 6.]]).into_dyn());
        assert_eq!(g.value(grads[1]), &arr2(&[[4.], [6.]]).into_dyn());
    }

    #[test]
    fn broadcast_and_sum_to_are_adjoint() {
        let mut g = Graph::new();
        let b = g.constant(arr1(&[1., 2.]).into_dyn());
        let wide = g.broadcast(b, &[3, 2]).unwrap();
        let y = g.sum(wide);

        let db = g.grad(y, &[b]).unwrap()[0];
        assert_eq!(g.value(db), &arr1(&[3., 3.]).into_dyn());
    }

    #[test]
    fn permutation_gradients_flow_back_to_the_original_positions() {
        let mut g = Graph::new();
        let a = g.constant(arr1(&[10., 20., 30.]).into_dyn());
        let p = g.permute(a, 0, &[2, 0, 1]).unwrap();
        let w = g.constant(arr1(&[1., 2., 3.]).into_dyn());
        let weighted = g.mul(p, w).unwrap();
        let y = g.sum(weighted);

        let da = g.grad(y, &[a]).unwrap()[0];
        assert_eq!(g.value(p), &arr1(&[30., 10., 20.]).into_dyn());
        assert_eq!(g.value(da), &arr1(&[2., 3., 1.]).into_dyn());
        assert!(g.permute(a, 0, &[0, 0, 1]).is_err());
    }

    #[test]
    #[should_panic]
    fn vars_from_another_graph_are_out_of_range() {
        let mut other = Graph::new();
        other.scalar(1.);
        let v = other.scalar(2.);

        Graph::new().value(v);
    }

    #[test]
    fn smooth_unary_derivatives() {
        let mut g = Graph::new();
        let x = g.scalar(0.3);

        let s = g.sigmoid(x);
        let ds = g.grad(s, &[x]).unwrap()[0];
        let sv = 1. / (1. + (-0.3f64).exp());
        assert!(close(g.item(ds).unwrap(), sv * (1. - sv)));

        let t = g.tanh(x);
        let dt = g.grad(t, &[x]).unwrap()[0];
        assert!(close(g.item(dt).unwrap(), 1. - 0.3f64.tanh().powi(2)));

        let l = g.log(x);
        let dl = g.grad(l, &[x]).unwrap()[0];
        assert!(close(g.item(dl).unwrap(), 1. / 0.3));

        let e = g.exp(x);
        let de = g.grad(e, &[x]).unwrap()[0];
        assert!(close(g.item(de).unwrap(), 0.3f64.exp()));
    }

    #[test]
    fn abs_has_zero_slope_at_zero() {
        let mut g = Graph::new();
        let x = g.constant(arr1(&[-2., 0., 3.]).into_dyn());
        let a = g.abs(x);
        let y = g.sum(a);

        let dx = g.grad(y, &[x]).unwrap()[0];
        assert_eq!(g.value(dx), &arr1(&[-1., 0., 1.]).into_dyn());
    }

    #[test]
    fn tree_gradients_keep_the_structure() {
        let mut g = Graph::new();
        let tree = Tree::named([
            ("a", Tree::leaf(arr1(&[1., 2.]).into_dyn())),
            ("b", Tree::leaf(ndarray::arr0(4.).into_dyn())),
        ]);
        let vars = g.lift(&tree);
        let squares = vars.try_map(|&v| g.mul(v, v)).unwrap();
        let y = g.sum_tree(&squares).unwrap();

        let grads = g.grad_tree(y, &vars).unwrap();
        let grads = g.eval(&grads);
        assert!(grads.same_structure(&tree));
        assert_eq!(grads.get("a").unwrap().as_leaf().unwrap(), &arr1(&[2., 4.]).into_dyn());
        assert!(close(grads.get("b").unwrap().as_leaf().unwrap().sum(), 8.));
    }
}
