use itertools::Itertools;

use crate::{
  scalar::Real,
  gradient::{ Gradient, RGradient, RVector },
  state::{ State, StateGrad, RState, RStateGrad },
  block::{ Block, BlockOutput, BlockROutput, Upstream, RUpstream },
  cost::CostFunc,
  sequence::Sequence,
};


struct Step<O: ?Sized> {
  output: Box<O>,
  // Sequence index of every lane in `output`
  lanes: Vec<usize>,
  time: usize,
}


// Re-expand state gradients of `step` to the lanes of the previous step,
// zero filling lanes that ended at the previous step.
pub(crate) fn expand_lanes<S>(prev_lanes: &[usize], prev_states: &[S], lanes: &[usize], grads: Vec<S>, zeroed: impl Fn(&S) -> S) -> Vec<S> {
  let mut lanes = lanes.iter().peekable();
  let mut grads = grads.into_iter();
  prev_lanes.iter().zip_eq(prev_states).map(|(lane, state)| {
    lanes.next_if_eq(&lane)
      .and_then(|_| grads.next() )
      .unwrap_or_else(|| zeroed(state) )
  }).collect()
}

fn non_empty<T: Real>(seqs: &[Sequence<T>]) -> Vec<&Sequence<T>> {
  seqs.iter().filter(|seq| !seq.is_empty() ).collect()
}


/// Forward pass over a batch of sequences that remembers every timestep,
/// so gradients can be back-propagated through time afterwards.
///
/// Empty sequences are dropped up front. Each call to
/// [time_step](Self::time_step) evaluates the block once on all lanes
/// whose sequence extends to the current time.

pub struct SeqProp<'a, T: Real> {
  block: &'a dyn Block<T>,
  cost: &'a dyn CostFunc<T>,
  seqs: Vec<&'a Sequence<T>>,
  memory: Vec<Step<dyn BlockOutput<T> + 'a>>,
  lanes: Vec<usize>,
  carry: Vec<State<T>>,
  time: usize,
}

impl<'a, T: Real> SeqProp<'a, T> {
  pub fn new(block: &'a dyn Block<T>, cost: &'a dyn CostFunc<T>, seqs: &'a [Sequence<T>]) -> Self {
    let seqs = non_empty(seqs);
    Self {
      block,
      cost,
      lanes: (0..seqs.len()).collect(),
      seqs,
      memory: vec![],
      carry: vec![],
      time: 0,
    }
  }

  /// Advance all active lanes by one timestep.
  ///
  /// Returns false once every sequence has ended.

  pub fn time_step(&mut self) -> bool {
    if self.lanes.is_empty() { return false }
    let time = self.time;
    let seqs = &self.seqs;
    let inputs: Vec<Vec<T>> = self.lanes.iter().map(|&lane| seqs[lane].inputs[time].clone() ).collect();
    let states = if time == 0 {
      vec![self.block.start_state(); self.lanes.len()]
    } else {
      std::mem::take(&mut self.carry)
    };
    let output = self.block.batch(&states, &inputs);

    let (lanes, carry) = self.lanes.iter()
      .zip(output.states())
      .filter(|&(&lane, _)| seqs[lane].len() > time + 1 )
      .map(|(&lane, state)| (lane, state.clone()) )
      .unzip();
    let active = std::mem::replace(&mut self.lanes, lanes);
    self.carry = carry;
    self.memory.push(Step { output, lanes: active, time });
    self.time += 1;
    true
  }

  pub fn is_done(&self) -> bool {
    self.lanes.is_empty()
  }

  pub fn memory_count(&self) -> usize {
    self.memory.len()
  }

  /// Forget all but the last `count` timesteps.

  pub fn truncate(&mut self, count: usize) {
    let excess = self.memory.len().saturating_sub(count);
    self.memory.drain(..excess);
  }

  /// Back-propagate through the remembered timesteps.
  ///
  /// The latest `head` timesteps receive output gradients from the cost
  /// function. The `tail` timesteps before them only pass on state
  /// gradients. Start state gradients are delivered to the block if the
  /// covered range reaches back to the first timestep.

  pub fn back_propagate(&self, g: &mut Gradient<T>, head: usize, tail: usize) {
    if head == 0 { return }
    let count = self.memory.len();
    let low = count.saturating_sub(head + tail);
    let low_head = count.saturating_sub(head);

    let mut upstream: Option<Vec<StateGrad<T>>> = None;
    let mut start_grads = vec![];
    for i in (low..count).rev() {
      let step = &self.memory[i];
      let outputs = (i >= low_head).then(|| {
        step.output.outputs().iter().zip_eq(&step.lanes)
          .map(|(actual, &lane)| self.cost.gradient(actual, &self.seqs[lane].outputs[step.time]) )
          .collect()
      });
      let down = step.output.propagate_gradient(Upstream { outputs, states: upstream.take() }, g);
      if step.time == 0 {
        start_grads = down.states;
      } else if i > low {
        let prev = &self.memory[i - 1];
        upstream = Some(expand_lanes(&prev.lanes, prev.output.states(), &step.lanes, down.states, State::zeroed));
      }
    }
    if !start_grads.is_empty() {
      self.block.propagate_start(&start_grads, g);
    }
  }
}


/// [SeqProp] carrying R-values along a direction `rv` through every timestep.

pub struct SeqRProp<'a, T: Real> {
  block: &'a dyn Block<T>,
  cost: &'a dyn CostFunc<T>,
  rv: &'a RVector<T>,
  seqs: Vec<&'a Sequence<T>>,
  memory: Vec<Step<dyn BlockROutput<T> + 'a>>,
  lanes: Vec<usize>,
  carry: Vec<RState<T>>,
  time: usize,
}

impl<'a, T: Real> SeqRProp<'a, T> {
  pub fn new(block: &'a dyn Block<T>, cost: &'a dyn CostFunc<T>, rv: &'a RVector<T>, seqs: &'a [Sequence<T>]) -> Self {
    let seqs = non_empty(seqs);
    Self {
      block,
      cost,
      rv,
      lanes: (0..seqs.len()).collect(),
      seqs,
      memory: vec![],
      carry: vec![],
      time: 0,
    }
  }

  pub fn time_step(&mut self) -> bool {
    if self.lanes.is_empty() { return false }
    let time = self.time;
    let seqs = &self.seqs;
    let inputs: Vec<Vec<T>> = self.lanes.iter().map(|&lane| seqs[lane].inputs[time].clone() ).collect();
    // Training data does not depend on the parameters
    let rinputs: Vec<Vec<T>> = inputs.iter().map(|input| vec![T::zero(); input.len()] ).collect();
    let states = if time == 0 {
      vec![self.block.start_rstate(self.rv); self.lanes.len()]
    } else {
      std::mem::take(&mut self.carry)
    };
    let output = self.block.batch_r(self.rv, &states, &inputs, &rinputs);

    let (lanes, carry) = self.lanes.iter()
      .zip(output.states())
      .filter(|&(&lane, _)| seqs[lane].len() > time + 1 )
      .map(|(&lane, state)| (lane, state.clone()) )
      .unzip();
    let active = std::mem::replace(&mut self.lanes, lanes);
    self.carry = carry;
    self.memory.push(Step { output, lanes: active, time });
    self.time += 1;
    true
  }

  pub fn is_done(&self) -> bool {
    self.lanes.is_empty()
  }

  pub fn memory_count(&self) -> usize {
    self.memory.len()
  }

  pub fn truncate(&mut self, count: usize) {
    let excess = self.memory.len().saturating_sub(count);
    self.memory.drain(..excess);
  }

  /// Like [SeqProp::back_propagate], accumulating R-gradients into `rg` as well.

  pub fn back_propagate(&self, rg: &mut RGradient<T>, g: &mut Gradient<T>, head: usize, tail: usize) {
    if head == 0 { return }
    let count = self.memory.len();
    let low = count.saturating_sub(head + tail);
    let low_head = count.saturating_sub(head);

    let mut upstream: Option<Vec<RStateGrad<T>>> = None;
    let mut start_grads = vec![];
    for i in (low..count).rev() {
      let step = &self.memory[i];
      let (outputs, routputs) = if i >= low_head {
        let (grads, rgrads): (Vec<_>, Vec<_>) = step.output.outputs().iter()
          .zip_eq(step.output.routputs())
          .zip_eq(&step.lanes)
          .map(|((actual, ractual), &lane)| {
            self.cost.gradient_r(actual, ractual, &self.seqs[lane].outputs[step.time])
          })
          .unzip();
        (Some(grads), Some(rgrads))
      } else {
        (None, None)
      };
      let down = step.output.propagate_gradient(RUpstream { outputs, routputs, states: upstream.take() }, rg, g);
      if step.time == 0 {
        start_grads = down.states;
      } else if i > low {
        let prev = &self.memory[i - 1];
        upstream = Some(expand_lanes(&prev.lanes, prev.output.states(), &step.lanes, down.states, RState::zeroed));
      }
    }
    if !start_grads.is_empty() {
      self.block.propagate_start_r(&start_grads, rg, g);
    }
  }
}
