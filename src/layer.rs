use crate::{
  scalar::Real,
  parameter::Parameter,
  variable::{ Variable, Context, Activation },
};


/// Differentiable vector function evaluated on many lanes at once.
///
/// `input` holds `n` equally sized rows, one per lane. The result
/// must again consist of `n` rows.

pub trait Batcher<T: Real>: Send + Sync {
  fn batch(&self, ctx: &Context<T>, input: &Variable<T>, n: usize) -> Variable<T>;

  fn parameters(&self) -> Vec<&Parameter<T>> {
    vec![]
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    vec![]
  }
}


/// Fully connected affine layer.

#[derive(Debug, Clone)]
pub struct Dense<T: Real> {
  pub inputs: usize,
  pub outputs: usize,
  pub weights: Parameter<T>,
  pub biases: Parameter<T>,
}

impl<T: Real> Dense<T> {
  pub fn new(inputs: usize, outputs: usize) -> Self {
    let gain = T::from(1.0 / (inputs.max(1) as f64).sqrt()).unwrap();
    Self {
      inputs,
      outputs,
      weights: Parameter::randn(inputs * outputs, gain),
      biases: Parameter::zeros(outputs),
    }
  }
}

impl<T: Real> Batcher<T> for Dense<T> {
  fn batch(&self, ctx: &Context<T>, input: &Variable<T>, n: usize) -> Variable<T> {
    assert_eq!(input.len(), n * self.inputs, "Dense layer expects {n} rows of width {}", self.inputs);
    input
      .matmul(&ctx.param(&self.weights), self.outputs, self.inputs)
      .add_bias(&ctx.param(&self.biases))
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    vec![&self.weights, &self.biases]
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    vec![&mut self.weights, &mut self.biases]
  }
}


impl<T: Real> Batcher<T> for Activation {
  fn batch(&self, _ctx: &Context<T>, input: &Variable<T>, _n: usize) -> Variable<T> {
    input.activate(*self)
  }
}


/// Sequential chain of [Batcher]s.

pub struct Network<T: Real> {
  pub layers: Vec<Box<dyn Batcher<T>>>,
}

impl<T: Real> Network<T> {
  pub fn new(layers: Vec<Box<dyn Batcher<T>>>) -> Self {
    Self { layers }
  }
}

impl<T: Real> Batcher<T> for Network<T> {
  fn batch(&self, ctx: &Context<T>, input: &Variable<T>, n: usize) -> Variable<T> {
    self.layers.iter().fold(input.clone(), |x, layer| layer.batch(ctx, &x, n) )
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.layers.iter().flat_map(|layer| layer.parameters() ).collect()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.layers.iter_mut().flat_map(|layer| layer.parameters_mut() ).collect()
  }
}


/// Long short-term memory cell.
///
/// Rows are laid out as `[input, cell, hidden]` and map to
/// `[hidden', cell', hidden']`, so that the trailing `[cell', hidden']`
/// can be carried as the next state.

#[derive(Debug, Clone)]
pub struct LstmCell<T: Real> {
  pub input_size: usize,
  pub hidden_size: usize,
  pub input_gates: Dense<T>,
  pub hidden_weights: Parameter<T>,
}

impl<T: Real> LstmCell<T> {
  pub fn new(input_size: usize, hidden_size: usize) -> Self {
    let mut input_gates = Dense::new(input_size, hidden_size * 4);
    // Remember by default
    for bias in &mut input_gates.biases.data[hidden_size..hidden_size * 2] {
      *bias = T::one();
    }
    let gain = T::from(1.0 / (hidden_size.max(1) as f64).sqrt()).unwrap();
    Self {
      input_size,
      hidden_size,
      input_gates,
      hidden_weights: Parameter::randn(hidden_size * 4 * hidden_size, gain),
    }
  }
}

impl<T: Real> Batcher<T> for LstmCell<T> {
  fn batch(&self, ctx: &Context<T>, input: &Variable<T>, n: usize) -> Variable<T> {
    let h = self.hidden_size;
    let width = self.input_size + h * 2;
    assert_eq!(input.len(), n * width, "LSTM cell expects {n} rows of width {width}");

    let x = input.select(width, 0, self.input_size);
    let cx = input.select(width, self.input_size, h);
    let hx = input.select(width, self.input_size + h, h);

    let size = h * 4;
    let gates = self.input_gates.batch(ctx, &x, n) + hx.matmul(&ctx.param(&self.hidden_weights), size, h);
    let input_gate = gates.select(size, 0, h);
    let forget_gate = gates.select(size, h, h);
    let cell_input = gates.select(size, h * 2, h);
    let output_gate = gates.select(size, h * 3, h);

    let cy = cx * forget_gate.sigmoid() + input_gate.sigmoid() * cell_input.tanh();
    let hy = output_gate.sigmoid() * cy.tanh();

    Variable::join(&[&hy, &cy, &hy], &[h, h, h])
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    vec![&self.input_gates.weights, &self.input_gates.biases, &self.hidden_weights]
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    vec![&mut self.input_gates.weights, &mut self.input_gates.biases, &mut self.hidden_weights]
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::gradient::{ Gradient, GradientPool };

  #[test]
  fn dense_rows() {
    let mut dense = Dense::<f64>::new(2, 1);
    dense.weights.data = vec![2.0, -1.0];
    dense.biases.data = vec![0.5];
    let ctx = Context::new();
    let x = ctx.input(vec![1.0, 1.0, 3.0, 2.0], None);
    let y = dense.batch(&ctx, &x, 2);
    assert_eq!(y.value(), &[1.5, 4.5]);
    let mut g = Gradient::new(&dense.parameters());
    y.propagate(&[1.0, 1.0], &[], &mut g);
    assert_eq!(g.get(dense.weights.id()), Some(&vec![4.0, 3.0]));
    assert_eq!(g.get(dense.biases.id()), Some(&vec![2.0]));
  }

  #[test]
  fn network_chains_layers() {
    let mut dense = Dense::<f64>::new(1, 1);
    dense.weights.data = vec![-2.0];
    let net = Network::new(vec![Box::new(dense), Box::new(Activation::ReLU)]);
    let ctx = Context::new();
    let y = net.batch(&ctx, &ctx.input(vec![1.0, -1.0], None), 2);
    assert_eq!(y.value(), &[0.0, 2.0]);
    assert_eq!(net.parameters().len(), 2);
  }

  #[test]
  fn cloned_layers_train_separately() {
    let dense = Dense::<f64>::new(2, 2);
    let net = Network::new(vec![Box::new(dense.clone()), Box::new(dense)]);
    let params = net.parameters();
    assert!(Gradient::new(&params).matches(&params));

    let pool = GradientPool::new();
    let (a, b) = (pool.alloc(&params), pool.alloc(&params));
    drop((a, b));
    let _g = pool.alloc(&params);
    assert_eq!(pool.free_count(), 1);
  }

  #[test]
  fn lstm_layout() {
    let cell = LstmCell::<f64>::new(3, 2);
    let ctx = Context::new();
    let input = ctx.input(vec![0.1; 2 * 7], None);
    let output = cell.batch(&ctx, &input, 2);
    assert_eq!(output.len(), 2 * 6);
    let row = &output.value()[..6];
    assert_eq!(row[0..2], row[4..6]);
    assert!(row.iter().all(|x| x.abs() < 1.0 + 0.1 ));
  }
}
