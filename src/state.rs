use crate::{
  internal::*,
  scalar::Real,
};


/// Per-lane value a [Block](crate::Block) carries from one timestep to the next.
///
/// Blocks built from a single function use plain vectors, while
/// compositions like [ParallelBlock](crate::ParallelBlock) keep one
/// sub-state per wrapped block.

#[derive(Debug, Clone, PartialEq)]
pub enum State<T: Real> {
  Vector(Vec<T>),
  Composite(Vec<State<T>>),
}

/// Gradient with respect to a [State], shaped like the State itself.

pub type StateGrad<T> = State<T>;

impl<T: Real> State<T> {
  pub fn vector(&self) -> &[T] {
    match self {
      Self::Vector(values) => values,
      Self::Composite(_) => panic!("Expected vector state but got composite state"),
    }
  }

  pub fn into_vector(self) -> Vec<T> {
    match self {
      Self::Vector(values) => values,
      Self::Composite(_) => panic!("Expected vector state but got composite state"),
    }
  }

  pub fn parts(&self) -> &[State<T>] {
    match self {
      Self::Composite(parts) => parts,
      Self::Vector(_) => panic!("Expected composite state but got vector state"),
    }
  }

  pub fn into_parts(self) -> Vec<State<T>> {
    match self {
      Self::Composite(parts) => parts,
      Self::Vector(_) => panic!("Expected composite state but got vector state"),
    }
  }

  /// Total number of scalars in this State.

  pub fn size(&self) -> usize {
    match self {
      Self::Vector(values) => values.len(),
      Self::Composite(parts) => parts.iter().map(|part| part.size() ).sum(),
    }
  }

  /// A State of the same shape, filled with zeros.

  pub fn zeroed(&self) -> Self {
    match self {
      Self::Vector(values) => Self::Vector(vec![T::zero(); values.len()]),
      Self::Composite(parts) => Self::Composite(parts.iter().map(|part| part.zeroed() ).collect()),
    }
  }

  pub fn add(&mut self, other: &Self) {
    match (self, other) {
      (Self::Vector(lhs), Self::Vector(rhs)) => add_into(lhs, rhs),
      (Self::Composite(lhs), Self::Composite(rhs)) => {
        assert_eq!(lhs.len(), rhs.len(), "Cannot add composite states of differing arity");
        for (l, r) in lhs.iter_mut().zip(rhs) {
          l.add(r);
        }
      },
      _ => panic!("Cannot add states of differing shape"),
    }
  }

  /// All scalars in depth-first order.

  pub fn flatten(&self) -> Vec<T> {
    let mut flat = Vec::with_capacity(self.size());
    self.flatten_into(&mut flat);
    flat
  }

  fn flatten_into(&self, flat: &mut Vec<T>) {
    match self {
      Self::Vector(values) => flat.extend_from_slice(values),
      Self::Composite(parts) => parts.iter().for_each(|part| part.flatten_into(flat) ),
    }
  }

  /// Rebuild a State shaped like `template` from flat data.

  pub fn unflatten(template: &Self, flat: &[T]) -> Self {
    assert_eq!(template.size(), flat.len(), "Flat data does not match state size");
    let (state, _) = Self::unflatten_from(template, flat);
    state
  }

  fn unflatten_from<'a>(template: &Self, flat: &'a [T]) -> (Self, &'a [T]) {
    match template {
      Self::Vector(values) => {
        let (head, rest) = flat.split_at(values.len());
        (Self::Vector(head.to_vec()), rest)
      },
      Self::Composite(parts) => {
        let mut rest = flat;
        let parts = parts.iter().map(|part| {
          let (state, remaining) = Self::unflatten_from(part, rest);
          rest = remaining;
          state
        }).collect();
        (Self::Composite(parts), rest)
      },
    }
  }
}


/// A [State] together with its directional derivative, as used by the R-operator.
///
/// When used as a gradient, `value` holds the gradient and `rvalue` its R-derivative.

#[derive(Debug, Clone, PartialEq)]
pub enum RState<T: Real> {
  Vector { value: Vec<T>, rvalue: Vec<T> },
  Composite(Vec<RState<T>>),
}

/// Gradient and R-gradient with respect to an [RState].

pub type RStateGrad<T> = RState<T>;

impl<T: Real> RState<T> {
  /// Pair a State with an R-value of zero.

  pub fn from_state(state: &State<T>) -> Self {
    Self::from_parts(state, &state.zeroed())
  }

  /// Combine a value and its R-derivative, which must be shaped alike.

  pub fn from_parts(value: &State<T>, rvalue: &State<T>) -> Self {
    match (value, rvalue) {
      (State::Vector(value), State::Vector(rvalue)) => {
        assert_eq!(value.len(), rvalue.len(), "R-state must match state in length");
        Self::Vector { value: value.clone(), rvalue: rvalue.clone() }
      },
      (State::Composite(values), State::Composite(rvalues)) => {
        assert_eq!(values.len(), rvalues.len(), "R-state must match state in arity");
        Self::Composite(values.iter().zip(rvalues).map(|(v, r)| Self::from_parts(v, r) ).collect())
      },
      _ => panic!("R-state must match state in shape"),
    }
  }

  pub fn value(&self) -> State<T> {
    match self {
      Self::Vector { value, .. } => State::Vector(value.clone()),
      Self::Composite(parts) => State::Composite(parts.iter().map(|part| part.value() ).collect()),
    }
  }

  pub fn rvalue(&self) -> State<T> {
    match self {
      Self::Vector { rvalue, .. } => State::Vector(rvalue.clone()),
      Self::Composite(parts) => State::Composite(parts.iter().map(|part| part.rvalue() ).collect()),
    }
  }

  pub fn vector(&self) -> (&[T], &[T]) {
    match self {
      Self::Vector { value, rvalue } => (value, rvalue),
      Self::Composite(_) => panic!("Expected vector state but got composite state"),
    }
  }

  pub fn parts(&self) -> &[RState<T>] {
    match self {
      Self::Composite(parts) => parts,
      Self::Vector { .. } => panic!("Expected composite state but got vector state"),
    }
  }

  pub fn into_parts(self) -> Vec<RState<T>> {
    match self {
      Self::Composite(parts) => parts,
      Self::Vector { .. } => panic!("Expected composite state but got vector state"),
    }
  }

  pub fn zeroed(&self) -> Self {
    match self {
      Self::Vector { value, .. } => Self::Vector {
        value: vec![T::zero(); value.len()],
        rvalue: vec![T::zero(); value.len()],
      },
      Self::Composite(parts) => Self::Composite(parts.iter().map(|part| part.zeroed() ).collect()),
    }
  }

  pub fn add(&mut self, other: &Self) {
    match (self, other) {
      (Self::Vector { value, rvalue }, Self::Vector { value: v, rvalue: r }) => {
        add_into(value, v);
        add_into(rvalue, r);
      },
      (Self::Composite(lhs), Self::Composite(rhs)) => {
        assert_eq!(lhs.len(), rhs.len(), "Cannot add composite states of differing arity");
        for (l, r) in lhs.iter_mut().zip(rhs) {
          l.add(r);
        }
      },
      _ => panic!("Cannot add states of differing shape"),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn nested() -> State<f64> {
    State::Composite(vec![
      State::Vector(vec![1.0, 2.0]),
      State::Composite(vec![State::Vector(vec![3.0]), State::Vector(vec![])]),
      State::Vector(vec![4.0]),
    ])
  }

  #[test]
  fn flatten_roundtrip() {
    let state = nested();
    assert_eq!(state.size(), 4);
    assert_eq!(state.flatten(), vec![1.0, 2.0, 3.0, 4.0]);
    let rebuilt = State::unflatten(&state.zeroed(), &[5.0, 6.0, 7.0, 8.0]);
    assert_eq!(rebuilt.parts()[1].parts()[0], State::Vector(vec![7.0]));
    assert_eq!(rebuilt.flatten(), vec![5.0, 6.0, 7.0, 8.0]);
  }

  #[test]
  fn add_states() {
    let mut state = nested();
    state.add(&nested());
    assert_eq!(state.flatten(), vec![2.0, 4.0, 6.0, 8.0]);
  }

  #[test]
  #[should_panic]
  fn add_mismatched() {
    let mut state = nested();
    state.add(&State::Vector(vec![1.0; 4]));
  }

  #[test]
  fn r_parts() {
    let state = nested();
    let rstate = RState::from_parts(&state, &state.zeroed());
    assert_eq!(rstate.value(), state);
    assert_eq!(rstate.rvalue(), state.zeroed());
    assert_eq!(rstate, RState::from_state(&state));
  }
}
