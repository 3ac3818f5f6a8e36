//! Finite difference checks shared by the unit tests.

use crate::{
  parameter::{ ParamId, Parameter },
  gradient::{ Gradient, RVector },
  block::Block,
  bptt::Gradienter,
  cost::CostFunc,
  sequence::Sequence,
  runner::Runner,
};


pub const EPSILON: f64 = 1e-5;


fn zeroed(params: &[&mut Parameter<f64>]) -> Gradient<f64> {
  let params: Vec<&Parameter<f64>> = params.iter().map(|param| &**param ).collect();
  Gradient::new(&params)
}

/// Centered difference quotient of `total_cost` for every parameter component.

pub fn numeric_gradient<M>(
  model: &mut M,
  params: impl Fn(&mut M) -> Vec<&mut Parameter<f64>>,
  total_cost: impl Fn(&M) -> f64,
) -> Gradient<f64> {
  let mut g = zeroed(&params(model));
  let shapes: Vec<(ParamId, usize)> = params(model).iter().map(|param| (param.id(), param.len()) ).collect();
  for (k, (id, len)) in shapes.into_iter().enumerate() {
    for i in 0..len {
      let original = params(model)[k].data[i];
      params(model)[k].data[i] = original + EPSILON;
      let plus = total_cost(model);
      params(model)[k].data[i] = original - EPSILON;
      let minus = total_cost(model);
      params(model)[k].data[i] = original;
      if let Some(values) = g.get_mut(id) {
        values[i] = (plus - minus) / (2.0 * EPSILON);
      }
    }
  }
  g
}

pub fn block_numeric_gradient<B: Block<f64>>(block: &mut B, cost: &dyn CostFunc<f64>, samples: &[Sequence<f64>]) -> Gradient<f64> {
  numeric_gradient(block, |block| block.parameters_mut(), |block| {
    Runner::new(block).total_cost(samples.len(), samples, cost)
  })
}

fn shift(params: Vec<&mut Parameter<f64>>, rv: &RVector<f64>, step: f64) {
  for param in params {
    if let Some(direction) = rv.get(param.id()) {
      for (value, d) in param.data.iter_mut().zip(direction) {
        *value += step * d;
      }
    }
  }
}

/// Directional derivative of the analytic gradient along `rv`,
/// taken as a centered difference.

pub fn numeric_rgradient<G: Gradienter<f64>>(
  gradienter: &mut G,
  params: impl Fn(&mut G) -> Vec<&mut Parameter<f64>>,
  rv: &RVector<f64>,
  samples: &[G::Sample],
) -> Gradient<f64> {
  shift(params(gradienter), rv, EPSILON);
  let mut rg = gradienter.gradient(samples).into_inner();
  shift(params(gradienter), rv, -2.0 * EPSILON);
  let mut minus = gradienter.gradient(samples).into_inner();
  shift(params(gradienter), rv, EPSILON);
  minus.scale(-1.0);
  rg.add(&minus);
  rg.scale(1.0 / (2.0 * EPSILON));
  rg
}

/// Compare component-wise, relative to the magnitude of larger values.

pub fn assert_gradients_close(actual: &Gradient<f64>, expected: &Gradient<f64>, tolerance: f64) {
  assert_eq!(actual.len(), expected.len(), "Gradients cover differing parameters");
  for (id, values) in expected.iter() {
    let other = actual.get(*id).unwrap_or_else(|| panic!("Missing gradient for {id:?}") );
    assert_eq!(other.len(), values.len());
    for (i, (&a, &e)) in other.iter().zip(values).enumerate() {
      let scale = 1f64.max(a.abs()).max(e.abs());
      assert!((a - e).abs() <= tolerance * scale, "Gradient of {id:?}[{i}] is {a} but expected {e}");
    }
  }
}
