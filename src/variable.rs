use std::rc::Rc;
use std::collections::{ HashMap, HashSet };
use std::fmt::Debug;

mod ops;

pub use ops::{ Add, Sub, Mul, MatMul, AddBias, Select, Join, Scale, Activation };

use crate::{
  internal::*,
  scalar::Real,
  parameter::{ ParamId, Parameter },
  gradient::{ Gradient, RGradient, RVector },
};


/// Unary operation that can also compute its derivatives.

pub trait UnaryOp<T: Real>: Debug {
  fn run(&self, lhs: &[T]) -> Vec<T>;
  fn run_r(&self, lhs: &[T], lhs_r: &[T]) -> Vec<T>;
  fn derive(&self, lhs: &[T], grad: &[T]) -> Vec<T>;
  fn derive_r(&self, lhs: &[T], lhs_r: &[T], grad: &[T], grad_r: &[T]) -> Vec<T>;
}


/// Binary operation that can also compute its derivatives.

pub trait BinaryOp<T: Real>: Debug {
  fn run(&self, lhs: &[T], rhs: &[T]) -> Vec<T>;
  fn run_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T]) -> Vec<T>;
  fn derive(&self, lhs: &[T], rhs: &[T], grad: &[T]) -> (Vec<T>, Vec<T>);
  fn derive_r(&self, lhs: &[T], lhs_r: &[T], rhs: &[T], rhs_r: &[T], grad: &[T], grad_r: &[T]) -> (Vec<T>, Vec<T>);
}


/// Operation over any number of inputs that can also compute its derivatives.

pub trait MultiOp<T: Real>: Debug {
  fn run(&self, inputs: &[&[T]]) -> Vec<T>;
  fn run_r(&self, inputs: &[&[T]], rinputs: &[&[T]]) -> Vec<T>;
  fn derive(&self, inputs: &[&[T]], grad: &[T]) -> Vec<Vec<T>>;
  fn derive_r(&self, inputs: &[&[T]], rinputs: &[&[T]], grad: &[T], grad_r: &[T]) -> Vec<Vec<T>>;
}


#[derive(Debug)]
enum Op<T: Real> {
  Unary(Box<dyn UnaryOp<T>>),
  Binary(Box<dyn BinaryOp<T>>),
  Multi(Box<dyn MultiOp<T>>),
}


#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
  Param(ParamId),
  Input,
  Computed,
}


/// Node in a computation graph, containing a [Variable]'s value,
/// its optional R-value and the operation used to create it.

#[derive(Debug)]
struct Node<T: Real> {
  id: usize,
  value: Vec<T>,
  rvalue: Option<Vec<T>>,
  op: Option<Op<T>>,
  previous: Vec<Rc<Self>>,
  source: Source,
}

impl<T: Real> Node<T> {
  fn rvalue_or_zeros(&self) -> Vec<T> {
    self.rvalue.clone().unwrap_or_else(|| vec![T::zero(); self.value.len()] )
  }

  fn derive(&self, grad: &[T]) -> Vec<Vec<T>> {
    let Some(op) = &self.op else { return vec![] };
    let values: Vec<&[T]> = self.previous.iter().map(|prev| &prev.value[..] ).collect();
    match op {
      Op::Unary(op) => vec![op.derive(values[0], grad)],
      Op::Binary(op) => {
        let (lhs, rhs) = op.derive(values[0], values[1], grad);
        vec![lhs, rhs]
      },
      Op::Multi(op) => op.derive(&values, grad),
    }
  }

  fn derive_r(&self, grad: &[T], grad_r: &[T]) -> Vec<Vec<T>> {
    let Some(op) = &self.op else { return vec![] };
    let values: Vec<&[T]> = self.previous.iter().map(|prev| &prev.value[..] ).collect();
    let rvalues: Vec<Vec<T>> = self.previous.iter().map(|prev| prev.rvalue_or_zeros() ).collect();
    let rvalues: Vec<&[T]> = rvalues.iter().map(|r| &r[..] ).collect();
    match op {
      Op::Unary(op) => vec![op.derive_r(values[0], rvalues[0], grad, grad_r)],
      Op::Binary(op) => {
        let (lhs, rhs) = op.derive_r(values[0], rvalues[0], values[1], rvalues[1], grad, grad_r);
        vec![lhs, rhs]
      },
      Op::Multi(op) => op.derive_r(&values, &rvalues, grad, grad_r),
    }
  }
}


/// Differentiable value, tracking the operations used to create it.
///
/// Variables optionally carry an R-value, the directional derivative of
/// their value along some [RVector]. Operations on Variables with
/// R-values propagate them forward automatically.

#[derive(Debug, Clone)]
pub struct Variable<T: Real> {
  node: Rc<Node<T>>,
}

impl<T: Real> Variable<T> {
  fn leaf(value: Vec<T>, rvalue: Option<Vec<T>>, source: Source) -> Self {
    if let Some(rvalue) = &rvalue {
      assert_eq!(value.len(), rvalue.len(), "R-value must match value in length");
    }
    Self {
      node: Rc::new(Node {
        id: make_id(),
        value,
        rvalue,
        op: None,
        previous: vec![],
        source,
      }),
    }
  }

  /// Constant input with an optional R-value.

  pub fn input(value: Vec<T>, rvalue: Option<Vec<T>>) -> Self {
    Self::leaf(value, rvalue, Source::Input)
  }

  fn operation(op: Op<T>, previous: Vec<Rc<Node<T>>>) -> Self {
    let values: Vec<&[T]> = previous.iter().map(|prev| &prev.value[..] ).collect();
    let value = match &op {
      Op::Unary(op) => op.run(values[0]),
      Op::Binary(op) => op.run(values[0], values[1]),
      Op::Multi(op) => op.run(&values),
    };
    let rvalue = previous.iter().any(|prev| prev.rvalue.is_some() ).then(|| {
      let rvalues: Vec<Vec<T>> = previous.iter().map(|prev| prev.rvalue_or_zeros() ).collect();
      let rvalues: Vec<&[T]> = rvalues.iter().map(|r| &r[..] ).collect();
      match &op {
        Op::Unary(op) => op.run_r(values[0], rvalues[0]),
        Op::Binary(op) => op.run_r(values[0], rvalues[0], values[1], rvalues[1]),
        Op::Multi(op) => op.run_r(&values, &rvalues),
      }
    });
    Self {
      node: Rc::new(Node {
        id: make_id(),
        value,
        rvalue,
        op: Some(op),
        previous,
        source: Source::Computed,
      }),
    }
  }

  pub fn id(&self) -> usize {
    self.node.id
  }

  pub fn value(&self) -> &[T] {
    &self.node.value
  }

  pub fn rvalue(&self) -> Option<&[T]> {
    self.node.rvalue.as_deref()
  }

  pub fn len(&self) -> usize {
    self.node.value.len()
  }

  pub fn is_empty(&self) -> bool {
    self.node.value.is_empty()
  }

  pub fn unary_op(&self, op: impl UnaryOp<T> + 'static) -> Self {
    Self::operation(Op::Unary(Box::new(op)), vec![self.node.clone()])
  }

  pub fn binary_op(&self, op: impl BinaryOp<T> + 'static, rhs: &Self) -> Self {
    Self::operation(Op::Binary(Box::new(op)), vec![self.node.clone(), rhs.node.clone()])
  }

  pub fn multi_op(op: impl MultiOp<T> + 'static, inputs: &[&Self]) -> Self {
    Self::operation(
      Op::Multi(Box::new(op)),
      inputs.iter().map(|input| input.node.clone() ).collect(),
    )
  }

  /// Back-propagate `upstream` through this Variable's graph.
  ///
  /// Parameter gradients get accumulated into `g`, for all parameters `g` tracks.
  /// Returns the gradient with respect to each Variable in `wrt`.

  pub fn propagate(&self, upstream: &[T], wrt: &[&Self], g: &mut Gradient<T>) -> Vec<Vec<T>> {
    assert_eq!(upstream.len(), self.len(), "Upstream gradient does not match output");
    let targets: HashSet<usize> = wrt.iter().map(|var| var.id() ).collect();
    let mut grads: HashMap<usize, Vec<T>> = HashMap::new();
    let mut found: HashMap<usize, Vec<T>> = HashMap::new();
    grads.insert(self.id(), upstream.to_vec());
    for node in self.history().iter().rev() {
      let Some(grad) = grads.remove(&node.id) else { continue };
      for (change, prev) in node.derive(&grad).into_iter().zip(&node.previous) {
        match grads.get_mut(&prev.id) {
          Some(existing) => add_into(existing, &change),
          None => { grads.insert(prev.id, change); },
        }
      }
      if let Source::Param(id) = node.source {
        g.accumulate(id, &grad);
      }
      if targets.contains(&node.id) {
        found.insert(node.id, grad);
      }
    }
    wrt.iter()
      .map(|var| found.get(&var.id()).cloned().unwrap_or_else(|| vec![T::zero(); var.len()] ) )
      .collect()
  }

  /// Back-propagate both an upstream gradient and its R-derivative.
  ///
  /// Returns gradients and R-gradients with respect to each Variable in `wrt`.

  pub fn propagate_r(
    &self,
    upstream: &[T],
    upstream_r: &[T],
    wrt: &[&Self],
    rg: &mut RGradient<T>,
    g: &mut Gradient<T>,
  ) -> (Vec<Vec<T>>, Vec<Vec<T>>) {
    assert_eq!(upstream.len(), self.len(), "Upstream gradient does not match output");
    assert_eq!(upstream_r.len(), self.len(), "Upstream R-gradient does not match output");
    let targets: HashSet<usize> = wrt.iter().map(|var| var.id() ).collect();
    let mut grads: HashMap<usize, (Vec<T>, Vec<T>)> = HashMap::new();
    let mut found: HashMap<usize, (Vec<T>, Vec<T>)> = HashMap::new();
    grads.insert(self.id(), (upstream.to_vec(), upstream_r.to_vec()));
    for node in self.history().iter().rev() {
      let Some((grad, grad_r)) = grads.remove(&node.id) else { continue };
      let changes = node.derive(&grad);
      let rchanges = node.derive_r(&grad, &grad_r);
      for ((change, rchange), prev) in changes.into_iter().zip(rchanges).zip(&node.previous) {
        match grads.get_mut(&prev.id) {
          Some((existing, existing_r)) => {
            add_into(existing, &change);
            add_into(existing_r, &rchange);
          },
          None => { grads.insert(prev.id, (change, rchange)); },
        }
      }
      if let Source::Param(id) = node.source {
        g.accumulate(id, &grad);
        rg.accumulate(id, &grad_r);
      }
      if targets.contains(&node.id) {
        found.insert(node.id, (grad, grad_r));
      }
    }
    wrt.iter()
      .map(|var| found.get(&var.id()).cloned().unwrap_or_else(|| {
        (vec![T::zero(); var.len()], vec![T::zero(); var.len()])
      }))
      .unzip()
  }

  fn history(&self) -> Vec<Rc<Node<T>>> {
    let mut history = vec![];
    Self::history_recurse(&self.node, &mut history, &mut HashSet::new());
    history
  }

  fn history_recurse(node: &Rc<Node<T>>, history: &mut Vec<Rc<Node<T>>>, visited: &mut HashSet<usize>) {
    if visited.contains(&node.id) { return }
    visited.insert(node.id);
    for prev in &node.previous {
      Self::history_recurse(prev, history, visited);
    }
    history.push(node.clone());
  }

  pub fn matmul(&self, weights: &Self, rows: usize, cols: usize) -> Self {
    weights.binary_op(MatMul { rows, cols }, self)
  }

  pub fn add_bias(&self, bias: &Self) -> Self {
    self.binary_op(AddBias, bias)
  }

  /// Columns `start..start + len` of every row of width `width`.

  pub fn select(&self, width: usize, start: usize, len: usize) -> Self {
    self.unary_op(Select { width, start, len })
  }

  /// Concatenate the rows of several batched Variables.

  pub fn join(inputs: &[&Self], widths: &[usize]) -> Self {
    Self::multi_op(Join { widths: widths.to_vec() }, inputs)
  }

  pub fn scale(&self, factor: T) -> Self {
    self.unary_op(Scale { factor })
  }

  pub fn activate(&self, activation: Activation) -> Self {
    if activation == Activation::Identity { return self.clone() }
    self.unary_op(activation)
  }

  pub fn sigmoid(&self) -> Self {
    self.activate(Activation::Sigmoid)
  }

  pub fn tanh(&self) -> Self {
    self.activate(Activation::Tanh)
  }
}


macro_rules! add_operator {
  ($op:ident, $meth:ident, $symbol:tt) => {
    impl<T: Real> std::ops::$op for &Variable<T> {
      type Output = Variable<T>;

      fn $meth(self, rhs: Self) -> Variable<T> {
        self.binary_op($op, rhs)
      }
    }

    impl<T: Real> std::ops::$op for Variable<T> {
      type Output = Variable<T>;

      fn $meth(self, rhs: Self) -> Variable<T> {
        &self $symbol &rhs
      }
    }

    impl<T: Real> std::ops::$op<Variable<T>> for &Variable<T> {
      type Output = Variable<T>;

      fn $meth(self, rhs: Variable<T>) -> Variable<T> {
        self $symbol &rhs
      }
    }

    impl<T: Real> std::ops::$op<&Variable<T>> for Variable<T> {
      type Output = Variable<T>;

      fn $meth(self, rhs: &Variable<T>) -> Variable<T> {
        &self $symbol rhs
      }
    }
  };
}

add_operator!(Add, add, +);
add_operator!(Sub, sub, -);
add_operator!(Mul, mul, *);


/// Creates leaf [Variable]s for one batched evaluation.
///
/// With an [RVector] present, parameters carry their perturbation
/// direction as R-value, turning every derived Variable into an
/// R-operator result.

#[derive(Debug, Clone, Copy)]
pub struct Context<'a, T: Real> {
  rv: Option<&'a RVector<T>>,
}

impl<'a, T: Real> Context<'a, T> {
  pub fn new() -> Self {
    Self { rv: None }
  }

  pub fn with_rvector(rv: &'a RVector<T>) -> Self {
    Self { rv: Some(rv) }
  }

  pub fn is_r(&self) -> bool {
    self.rv.is_some()
  }

  pub fn param(&self, param: &Parameter<T>) -> Variable<T> {
    let rvalue = self.rv.map(|rv| match rv.get(param.id()) {
      Some(direction) => {
        assert_eq!(direction.len(), param.len(), "RVector entry does not match parameter");
        direction.clone()
      },
      None => vec![T::zero(); param.len()],
    });
    Variable::leaf(param.data.clone(), rvalue, Source::Param(param.id()))
  }

  /// Input Variable; in R mode a missing R-value defaults to zero.

  pub fn input(&self, value: Vec<T>, rvalue: Option<Vec<T>>) -> Variable<T> {
    let rvalue = if self.is_r() {
      Some(rvalue.unwrap_or_else(|| vec![T::zero(); value.len()] ))
    } else {
      rvalue
    };
    Variable::input(value, rvalue)
  }
}

impl<'a, T: Real> Default for Context<'a, T> {
  fn default() -> Self {
    Self::new()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn x_squared() {
    let p = Parameter::new(vec![3.0, 5.0]);
    let ctx = Context::new();
    let x = ctx.param(&p);
    let z = &x * &x + x.scale(2.0);
    assert_eq!(z.value(), &[15.0, 35.0]);
    let mut g = Gradient::new(&[&p]);
    z.propagate(&[1.0, 1.0], &[], &mut g);
    assert_eq!(g.get(p.id()), Some(&vec![8.0, 12.0]));
  }

  #[test]
  fn input_gradients() {
    let ctx = Context::new();
    let a = ctx.input(vec![1.0, 2.0], None);
    let b = ctx.input(vec![3.0, 4.0], None);
    let z = (&a * &b) - &a;
    let mut g = Gradient::default();
    let grads = z.propagate(&[1.0, 2.0], &[&a, &b], &mut g);
    assert_eq!(grads, vec![vec![2.0, 6.0], vec![1.0, 4.0]]);
  }

  #[test]
  fn r_values() {
    let p = Parameter::new(vec![2.0]);
    let mut rv = RVector::new(&[&p]);
    rv.accumulate(p.id(), &[1.0]);
    let ctx = Context::with_rvector(&rv);
    let x = ctx.param(&p);
    let y = &x * &x * &x;
    assert_eq!(y.value(), &[8.0]);
    // d/dt (p + t)^3 = 3p^2
    assert_eq!(y.rvalue(), Some(&[12.0][..]));
    let mut g = Gradient::new(&[&p]);
    let mut rg = RGradient::new(&[&p]);
    y.propagate_r(&[1.0], &[0.0], &[], &mut rg, &mut g);
    assert_eq!(g.get(p.id()), Some(&vec![12.0]));
    // d/dt 3(p + t)^2 = 6p
    assert_eq!(rg.get(p.id()), Some(&vec![12.0]));
  }

  #[test]
  fn unused_inputs_get_zeros() {
    let ctx = Context::<f64>::new();
    let a = ctx.input(vec![1.0], None);
    let b = ctx.input(vec![1.0, 1.0], None);
    let z = a.scale(3.0);
    let grads = z.propagate(&[1.0], &[&a, &b], &mut Gradient::default());
    assert_eq!(grads, vec![vec![3.0], vec![0.0, 0.0]]);
  }
}
