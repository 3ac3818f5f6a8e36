use criterion::{ black_box, criterion_group, criterion_main, BenchmarkId, Criterion };

use recurrent::{
  block::{ Block, StackedBlock, lstm, square },
  Sequence, BPTT, TruncatedBPTT, Gradienter, MeanSquaredCost, RVector,
};


fn samples(count: usize) -> Vec<Sequence<f32>> {
  (0..count).map(|i| {
    let len = 10 + (i * 7) % 30;
    let inputs = (0..len).map(|t| vec![(t as f32 * 0.3).sin(), i as f32 * 0.01, 1.0, -0.5] ).collect();
    let outputs = (0..len).map(|t| vec![(t as f32 * 0.3).cos(); 16] ).collect();
    Sequence::new(inputs, outputs)
  }).collect()
}

fn block() -> StackedBlock<f32> {
  StackedBlock::new(vec![
    Box::new(lstm(4, 16)),
    Box::new(lstm(16, 16)),
    Box::new(square(0)),
  ])
}


fn bench_bptt(c: &mut Criterion) {
  let samples = samples(64);
  let mut group = c.benchmark_group("bptt");
  for &threads in &[1usize, 2, 4, 8] {
    group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
      let mut bptt = BPTT::new(block(), MeanSquaredCost).max_threads(threads).max_lanes(8);
      b.iter(|| black_box(bptt.gradient(black_box(&samples))) );
    });
  }
  group.finish();
}

fn bench_truncated(c: &mut Criterion) {
  let samples = samples(64);
  let mut group = c.benchmark_group("truncated_bptt");
  for &(head, tail) in &[(1usize, 0usize), (4, 4), (8, 16)] {
    let id = BenchmarkId::from_parameter(format!("{head}head_{tail}tail"));
    group.bench_with_input(id, &(head, tail), |b, &(head, tail)| {
      let mut bptt = TruncatedBPTT::new(block(), MeanSquaredCost, head, tail).max_lanes(8);
      b.iter(|| black_box(bptt.gradient(black_box(&samples))) );
    });
  }
  group.finish();
}

fn bench_rgradient(c: &mut Criterion) {
  let samples = samples(32);
  c.bench_function("rgradient", |b| {
    let mut bptt = BPTT::new(block(), MeanSquaredCost).max_lanes(8);
    let rv = RVector::randn(&bptt.block.parameters());
    b.iter(|| black_box(bptt.rgradient(&rv, black_box(&samples))) );
  });
}


criterion_group!(benches, bench_bptt, bench_truncated, bench_rgradient);
criterion_main!(benches);
