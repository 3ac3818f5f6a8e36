use crate::{
  internal::*,
  scalar::Real,
  parameter::Parameter,
  gradient::{ Gradient, RGradient, RVector },
  variable::{ Variable, Context },
  layer::Batcher,
  seq_func::{ SeqFunc, ResultSeqs, RResultSeqs, Seqs },
};


fn lengths<T>(seqs: &[Vec<Vec<T>>]) -> Vec<usize> {
  seqs.iter().map(|seq| seq.len() ).collect()
}

fn flatten<T: Real>(seqs: &[Vec<Vec<T>>]) -> Vec<T> {
  let rows: Vec<Vec<T>> = seqs.iter().flatten().cloned().collect();
  join_rows(&rows)
}

// Distribute consecutive rows over sequences of the given lengths
fn regroup<T: Real>(rows: Vec<Vec<T>>, lengths: &[usize]) -> Seqs<T> {
  let mut rows = rows.into_iter();
  lengths.iter().map(|&len| rows.by_ref().take(len).collect() ).collect()
}

fn reverse<T: Real>(seqs: &[Vec<Vec<T>>]) -> Seqs<T> {
  seqs.iter().map(|seq| seq.iter().rev().cloned().collect() ).collect()
}


/// Applies a [Batcher] to every timestep independently.

pub struct MapSeqFunc<T: Real> {
  batcher: Box<dyn Batcher<T>>,
}

impl<T: Real> MapSeqFunc<T> {
  pub fn new(batcher: Box<dyn Batcher<T>>) -> Self {
    Self { batcher }
  }
}

impl<T: Real> SeqFunc<T> for MapSeqFunc<T> {
  fn apply_seqs<'a>(&'a self, inputs: &[Vec<Vec<T>>]) -> Box<dyn ResultSeqs<T> + 'a> {
    let lengths = lengths(inputs);
    let n = lengths.iter().sum();
    if n == 0 {
      return Box::new(MapResult { lengths, graph: None, outputs: inputs.iter().map(|_| vec![] ).collect() })
    }
    let ctx = Context::new();
    let input = ctx.input(flatten(inputs), None);
    let output = self.batcher.batch(&ctx, &input, n);
    let outputs = regroup(split_rows(output.value(), n), &lengths);
    Box::new(MapResult { lengths, graph: Some((input, output)), outputs })
  }

  fn apply_seqs_r<'a>(&'a self, rv: &RVector<T>, inputs: &[Vec<Vec<T>>], rinputs: &[Vec<Vec<T>>]) -> Box<dyn RResultSeqs<T> + 'a> {
    let lengths = lengths(inputs);
    let n = lengths.iter().sum();
    if n == 0 {
      let empty: Seqs<T> = inputs.iter().map(|_| vec![] ).collect();
      return Box::new(MapRResult { lengths, graph: None, outputs: empty.clone(), routputs: empty })
    }
    let ctx = Context::with_rvector(rv);
    let input = ctx.input(flatten(inputs), Some(flatten(rinputs)));
    let output = self.batcher.batch(&ctx, &input, n);
    let routput = output.rvalue().map(|r| r.to_vec() ).unwrap_or_else(|| vec![T::zero(); output.len()] );
    let outputs = regroup(split_rows(output.value(), n), &lengths);
    let routputs = regroup(split_rows(&routput, n), &lengths);
    Box::new(MapRResult { lengths, graph: Some((input, output)), outputs, routputs })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.batcher.parameters()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.batcher.parameters_mut()
  }
}


struct MapResult<T: Real> {
  lengths: Vec<usize>,
  graph: Option<(Variable<T>, Variable<T>)>,
  outputs: Seqs<T>,
}

impl<T: Real> ResultSeqs<T> for MapResult<T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.outputs
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, g: &mut Gradient<T>) -> Seqs<T> {
    let Some((input, output)) = &self.graph else { return self.lengths.iter().map(|_| vec![] ).collect() };
    let n = self.lengths.iter().sum();
    let grad = output.propagate(&flatten(&upstream), &[input], g).remove(0);
    regroup(split_rows(&grad, n), &self.lengths)
  }
}


struct MapRResult<T: Real> {
  lengths: Vec<usize>,
  graph: Option<(Variable<T>, Variable<T>)>,
  outputs: Seqs<T>,
  routputs: Seqs<T>,
}

impl<T: Real> RResultSeqs<T> for MapRResult<T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.outputs
  }

  fn routput_seqs(&self) -> &[Vec<Vec<T>>] {
    &self.routputs
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, rupstream: Seqs<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> (Seqs<T>, Seqs<T>) {
    let Some((input, output)) = &self.graph else {
      let empty: Seqs<T> = self.lengths.iter().map(|_| vec![] ).collect();
      return (empty.clone(), empty)
    };
    let n = self.lengths.iter().sum();
    let (mut grads, mut rgrads) = output.propagate_r(&flatten(&upstream), &flatten(&rupstream), &[input], rg, g);
    (
      regroup(split_rows(&grads.remove(0), n), &self.lengths),
      regroup(split_rows(&rgrads.remove(0), n), &self.lengths),
    )
  }
}


/// Chains [SeqFunc]s, feeding each one's output sequences into the next.

pub struct ComposedSeqFunc<T: Real> {
  funcs: Vec<Box<dyn SeqFunc<T>>>,
}

impl<T: Real> ComposedSeqFunc<T> {
  pub fn new(funcs: Vec<Box<dyn SeqFunc<T>>>) -> Self {
    assert!(!funcs.is_empty(), "Cannot use an empty ComposedSeqFunc");
    Self { funcs }
  }
}

impl<T: Real> SeqFunc<T> for ComposedSeqFunc<T> {
  fn apply_seqs<'a>(&'a self, inputs: &[Vec<Vec<T>>]) -> Box<dyn ResultSeqs<T> + 'a> {
    let mut results: Vec<Box<dyn ResultSeqs<T> + 'a>> = Vec::with_capacity(self.funcs.len());
    for func in &self.funcs {
      let result = match results.last() {
        Some(previous) => func.apply_seqs(previous.output_seqs()),
        None => func.apply_seqs(inputs),
      };
      results.push(result);
    }
    Box::new(ComposedResult { results })
  }

  fn apply_seqs_r<'a>(&'a self, rv: &RVector<T>, inputs: &[Vec<Vec<T>>], rinputs: &[Vec<Vec<T>>]) -> Box<dyn RResultSeqs<T> + 'a> {
    let mut results: Vec<Box<dyn RResultSeqs<T> + 'a>> = Vec::with_capacity(self.funcs.len());
    for func in &self.funcs {
      let result = match results.last() {
        Some(previous) => func.apply_seqs_r(rv, previous.output_seqs(), previous.routput_seqs()),
        None => func.apply_seqs_r(rv, inputs, rinputs),
      };
      results.push(result);
    }
    Box::new(ComposedRResult { results })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    self.funcs.iter().flat_map(|func| func.parameters() ).collect()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    self.funcs.iter_mut().flat_map(|func| func.parameters_mut() ).collect()
  }
}


struct ComposedResult<'a, T: Real> {
  results: Vec<Box<dyn ResultSeqs<T> + 'a>>,
}

impl<'a, T: Real> ResultSeqs<T> for ComposedResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    self.results.last().map_or(&[][..], |result| result.output_seqs() )
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, g: &mut Gradient<T>) -> Seqs<T> {
    self.results.iter().rev().fold(upstream, |upstream, result| result.propagate_gradient(upstream, g) )
  }
}


struct ComposedRResult<'a, T: Real> {
  results: Vec<Box<dyn RResultSeqs<T> + 'a>>,
}

impl<'a, T: Real> RResultSeqs<T> for ComposedRResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    self.results.last().map_or(&[][..], |result| result.output_seqs() )
  }

  fn routput_seqs(&self) -> &[Vec<Vec<T>>] {
    self.results.last().map_or(&[][..], |result| result.routput_seqs() )
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, rupstream: Seqs<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> (Seqs<T>, Seqs<T>) {
    self.results.iter().rev().fold((upstream, rupstream), |(upstream, rupstream), result| {
      result.propagate_gradient(upstream, rupstream, rg, g)
    })
  }
}


/// Bidirectional sequence processing.
///
/// `forward` sees each sequence in order and `backward` sees it reversed.
/// At every timestep their outputs are joined as `[forward, backward]`
/// and fed into `output`.

pub struct Bidirectional<T: Real> {
  pub forward: Box<dyn SeqFunc<T>>,
  pub backward: Box<dyn SeqFunc<T>>,
  pub output: Box<dyn SeqFunc<T>>,
}

impl<T: Real> Bidirectional<T> {
  pub fn new(forward: Box<dyn SeqFunc<T>>, backward: Box<dyn SeqFunc<T>>, output: Box<dyn SeqFunc<T>>) -> Self {
    Self { forward, backward, output }
  }
}

// Join forward outputs with time-aligned backward outputs
fn join<T: Real>(forward: &[Vec<Vec<T>>], backward: &[Vec<Vec<T>>]) -> Seqs<T> {
  forward.iter().zip(backward).map(|(fseq, bseq)| {
    fseq.iter().zip(bseq.iter().rev()).map(|(f, b)| [&f[..], &b[..]].concat() ).collect()
  }).collect()
}

// Split joined gradients into forward gradients and backward gradients in backward time order
fn split<T: Real>(joined: Seqs<T>, widths: &[Vec<usize>]) -> (Seqs<T>, Seqs<T>) {
  joined.into_iter().zip(widths).map(|(seq, widths)| {
    let (fseq, mut bseq): (Vec<_>, Vec<_>) = seq.into_iter().zip(widths).map(|(mut step, &width)| {
      let back = step.split_off(width);
      (step, back)
    }).unzip();
    bseq.reverse();
    (fseq, bseq)
  }).unzip()
}

fn add_reversed<T: Real>(mut grads: Seqs<T>, reversed: &[Vec<Vec<T>>]) -> Seqs<T> {
  for (seq, rseq) in grads.iter_mut().zip(reversed) {
    for (step, rstep) in seq.iter_mut().zip(rseq.iter().rev()) {
      add_into(step, rstep);
    }
  }
  grads
}

fn widths<T>(seqs: &[Vec<Vec<T>>]) -> Vec<Vec<usize>> {
  seqs.iter().map(|seq| seq.iter().map(|step| step.len() ).collect() ).collect()
}

impl<T: Real> SeqFunc<T> for Bidirectional<T> {
  fn apply_seqs<'a>(&'a self, inputs: &[Vec<Vec<T>>]) -> Box<dyn ResultSeqs<T> + 'a> {
    let forward = self.forward.apply_seqs(inputs);
    let backward = self.backward.apply_seqs(&reverse(inputs));
    let output = self.output.apply_seqs(&join(forward.output_seqs(), backward.output_seqs()));
    let widths = widths(forward.output_seqs());
    Box::new(BidirectionalResult { forward, backward, output, widths })
  }

  fn apply_seqs_r<'a>(&'a self, rv: &RVector<T>, inputs: &[Vec<Vec<T>>], rinputs: &[Vec<Vec<T>>]) -> Box<dyn RResultSeqs<T> + 'a> {
    let forward = self.forward.apply_seqs_r(rv, inputs, rinputs);
    let backward = self.backward.apply_seqs_r(rv, &reverse(inputs), &reverse(rinputs));
    let output = self.output.apply_seqs_r(
      rv,
      &join(forward.output_seqs(), backward.output_seqs()),
      &join(forward.routput_seqs(), backward.routput_seqs()),
    );
    let widths = widths(forward.output_seqs());
    Box::new(BidirectionalRResult { forward, backward, output, widths })
  }

  fn parameters(&self) -> Vec<&Parameter<T>> {
    [&self.forward, &self.backward, &self.output].into_iter()
      .flat_map(|func| func.parameters() )
      .collect()
  }

  fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
    [&mut self.forward, &mut self.backward, &mut self.output].into_iter()
      .flat_map(|func| func.parameters_mut() )
      .collect()
  }
}


struct BidirectionalResult<'a, T: Real> {
  forward: Box<dyn ResultSeqs<T> + 'a>,
  backward: Box<dyn ResultSeqs<T> + 'a>,
  output: Box<dyn ResultSeqs<T> + 'a>,
  widths: Vec<Vec<usize>>,
}

impl<'a, T: Real> ResultSeqs<T> for BidirectionalResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    self.output.output_seqs()
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, g: &mut Gradient<T>) -> Seqs<T> {
    let joined = self.output.propagate_gradient(upstream, g);
    let (forward, backward) = split(joined, &self.widths);
    let grads = self.forward.propagate_gradient(forward, g);
    let reversed = self.backward.propagate_gradient(backward, g);
    add_reversed(grads, &reversed)
  }
}


struct BidirectionalRResult<'a, T: Real> {
  forward: Box<dyn RResultSeqs<T> + 'a>,
  backward: Box<dyn RResultSeqs<T> + 'a>,
  output: Box<dyn RResultSeqs<T> + 'a>,
  widths: Vec<Vec<usize>>,
}

impl<'a, T: Real> RResultSeqs<T> for BidirectionalRResult<'a, T> {
  fn output_seqs(&self) -> &[Vec<Vec<T>>] {
    self.output.output_seqs()
  }

  fn routput_seqs(&self) -> &[Vec<Vec<T>>] {
    self.output.routput_seqs()
  }

  fn propagate_gradient(&self, upstream: Seqs<T>, rupstream: Seqs<T>, rg: &mut RGradient<T>, g: &mut Gradient<T>) -> (Seqs<T>, Seqs<T>) {
    let (joined, rjoined) = self.output.propagate_gradient(upstream, rupstream, rg, g);
    let (forward, backward) = split(joined, &self.widths);
    let (rforward, rbackward) = split(rjoined, &self.widths);
    let (grads, rgrads) = self.forward.propagate_gradient(forward, rforward, rg, g);
    let (reversed, rreversed) = self.backward.propagate_gradient(backward, rbackward, rg, g);
    (add_reversed(grads, &reversed), add_reversed(rgrads, &rreversed))
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    variable::Activation,
    layer::Dense,
    block::lstm,
    cost::{ CostFunc, MeanSquaredCost },
    sequence::Sequence,
    bptt::Gradienter,
    seq_func::{ BlockSeqFunc, SeqFuncGradienter },
    check::*,
  };

  fn samples() -> Vec<Sequence<f64>> {
    [2, 4, 0, 1, 3].iter().enumerate().map(|(i, &len)| {
      let inputs = (0..len).map(|t| vec![(0.7 * t as f64 + i as f64).cos(), 0.2 * i as f64] ).collect();
      let outputs = (0..len).map(|t| vec![0.3 * t as f64, -0.1 * i as f64] ).collect();
      Sequence::new(inputs, outputs)
    }).collect()
  }

  fn total_cost(func: &dyn SeqFunc<f64>, samples: &[Sequence<f64>]) -> f64 {
    let inputs: Seqs<f64> = samples.iter().map(|sample| sample.inputs.clone() ).collect();
    func.apply_seqs(&inputs).output_seqs().iter().zip(samples).map(|(actual, sample)| {
      actual.iter().zip(&sample.outputs).map(|(a, e)| CostFunc::<f64>::cost(&MeanSquaredCost, a, e) ).sum::<f64>()
    }).sum()
  }

  fn check_func<F: SeqFunc<f64>>(func: F) {
    let samples = samples();
    let mut gradienter = SeqFuncGradienter::new(func, MeanSquaredCost).max_lanes(2);
    let expected = numeric_gradient(&mut gradienter.func, |func| func.parameters_mut(), |func| total_cost(func, &samples) );
    assert_gradients_close(&gradienter.gradient(&samples), &expected, 1e-6);

    let rv = RVector::randn(&gradienter.func.parameters());
    let (g, rg) = gradienter.rgradient(&rv, &samples);
    assert_gradients_close(&g, &expected, 1e-6);
    let expected_r = numeric_rgradient(&mut gradienter, |gradienter| gradienter.func.parameters_mut(), &rv, &samples);
    assert_gradients_close(&rg, &expected_r, 1e-6);
  }

  #[test]
  fn maps_every_timestep() {
    let func = MapSeqFunc::<f64>::new(Box::new(Activation::Square));
    let inputs = vec![vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![], vec![vec![-1.0, 0.5]]];
    let result = func.apply_seqs(&inputs);
    assert_eq!(result.output_seqs(), &[
      vec![vec![1.0, 4.0], vec![9.0, 16.0]],
      vec![],
      vec![vec![1.0, 0.25]],
    ]);
    let grads = result.propagate_gradient(vec![vec![vec![1.0; 2]; 2], vec![], vec![vec![1.0, 0.0]]], &mut Gradient::default());
    assert_eq!(grads[2], vec![vec![-2.0, 0.0]]);
    assert_eq!(grads[0][1], vec![6.0, 8.0]);
  }

  #[test]
  fn joins_time_aligned() {
    let func = Bidirectional::<f64>::new(
      Box::new(MapSeqFunc::new(Box::new(Activation::Identity))),
      Box::new(MapSeqFunc::new(Box::new(Activation::Square))),
      Box::new(MapSeqFunc::new(Box::new(Activation::Identity))),
    );
    let result = func.apply_seqs(&[vec![vec![1.0, 2.0], vec![3.0, 4.0]]]);
    assert_eq!(result.output_seqs(), &[vec![vec![1.0, 2.0, 1.0, 4.0], vec![3.0, 4.0, 9.0, 16.0]]]);
    let grads = result.propagate_gradient(vec![vec![vec![1.0, 0.0, 1.0, 0.0], vec![0.0; 4]]], &mut Gradient::default());
    assert_eq!(grads, vec![vec![vec![3.0, 0.0], vec![0.0, 0.0]]]);
  }

  #[test]
  #[should_panic(expected = "empty ComposedSeqFunc")]
  fn empty_composition() {
    ComposedSeqFunc::<f64>::new(vec![]);
  }

  #[test]
  fn composed_gradients() {
    check_func(ComposedSeqFunc::new(vec![
      Box::new(MapSeqFunc::new(Box::new(Dense::new(2, 3)))),
      Box::new(BlockSeqFunc::new(lstm(3, 2))),
    ]));
  }

  #[test]
  fn bidirectional_gradients() {
    check_func(Bidirectional::new(
      Box::new(BlockSeqFunc::new(lstm(2, 2))),
      Box::new(BlockSeqFunc::new(lstm(2, 1))),
      Box::new(MapSeqFunc::new(Box::new(Dense::new(3, 2)))),
    ));
  }
}
