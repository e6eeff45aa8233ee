use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use trellis::lattice::{MaxLattice, SumLattice};
use trellis::{
    Alphabet, Connectivity, Crf, Instance, ModelKind, ObservedAttribute, WeightTying,
};

fn build_model(num_labels: usize, num_features: usize) -> Crf {
    let mut labels = Alphabet::new();
    for i in 0..num_labels {
        labels.intern(&format!("L{}", i));
    }
    let mut crf = Crf::new(num_features, ModelKind::GloballyNormalized);
    crf.add_states_for_labels(
        &labels,
        &[],
        Connectivity::FullyConnected,
        WeightTying::PerArc,
        &[],
    )
    .unwrap();
    let mut params = crf.factors().parameters_vec();
    for (i, p) in params.iter_mut().enumerate() {
        *p = ((i % 13) as f64 - 6.0) * 0.05;
    }
    crf.factors_mut().set_parameters(&params).unwrap();
    crf
}

fn build_instance(len: usize, num_features: usize) -> Instance {
    let items = (0..len)
        .map(|t| {
            vec![
                ObservedAttribute::new((t % num_features) as u32, 1.0),
                ObservedAttribute::new(((t + 1) % num_features) as u32, 0.5),
            ]
        })
        .collect();
    Instance::new(items)
}

fn benchmark_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_backward_by_labels");
    let t = 10;
    for l in [2, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(l), &l, |b, &l| {
            let crf = build_model(l, 4);
            let inst = build_instance(t, 4);
            b.iter(|| {
                let lattice = SumLattice::new(&crf, &inst, None, None);
                black_box(lattice.total_weight());
            });
        });
    }
    group.finish();
}

fn benchmark_viterbi(c: &mut Criterion) {
    let mut group = c.benchmark_group("viterbi_by_labels");
    let t = 10;
    for l in [2, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(l), &l, |b, &l| {
            let crf = build_model(l, 4);
            let inst = build_instance(t, 4);
            b.iter(|| {
                let lattice = MaxLattice::new(&crf, &inst);
                black_box(lattice.best_output_sequence());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_forward_backward, benchmark_viterbi);
criterion_main!(benches);
