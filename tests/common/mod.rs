#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use trellis::{
    Alphabet, ArcSpec, Connectivity, Crf, Instance, ModelKind, ObservedAttribute,
    WeightTying, WeightedTransducer,
};

/// Every complete path through the model for one instance, as
/// `(label sequence, path weight)`, by direct enumeration. Only usable on
/// small models; this is the oracle the lattices are checked against.
pub fn enumerate_paths(crf: &Crf, instance: &Instance) -> Vec<(Vec<u32>, f64)> {
    let mut paths = Vec::new();
    for s in 0..crf.num_states() {
        let w = crf.initial_weight(s);
        if w == f64::NEG_INFINITY {
            continue;
        }
        walk(crf, instance, 0, s, w, &mut Vec::new(), &mut paths);
    }
    paths
}

fn walk(
    crf: &Crf,
    instance: &Instance,
    t: usize,
    state: usize,
    weight: f64,
    labels: &mut Vec<u32>,
    paths: &mut Vec<(Vec<u32>, f64)>,
) {
    if t == instance.len() {
        let total = weight + crf.final_weight(state);
        if total != f64::NEG_INFINITY {
            paths.push((labels.clone(), total));
        }
        return;
    }
    let mut weights = Vec::new();
    crf.arc_weights(state, &instance.items[t], None, &mut weights);
    let arcs = crf.transducer().state(state).arcs();
    for (k, arc) in arcs.iter().enumerate() {
        if weights[k] == f64::NEG_INFINITY {
            continue;
        }
        labels.push(arc.label());
        walk(
            crf,
            instance,
            t + 1,
            arc.destination(),
            weight + weights[k],
            labels,
            paths,
        );
        labels.pop();
    }
}

/// Paths compatible with an output constraint
pub fn enumerate_constrained_paths(
    crf: &Crf,
    instance: &Instance,
    constraint: &[u32],
) -> Vec<(Vec<u32>, f64)> {
    enumerate_paths(crf, instance)
        .into_iter()
        .filter(|(labels, _)| labels == constraint)
        .collect()
}

/// A fully connected chain model over synthetic labels with randomized
/// parameters (weights, defaults, initial/final)
pub fn random_chain_crf(seed: u64, num_labels: usize, num_features: usize) -> Crf {
    let mut rng = StdRng::seed_from_u64(seed);
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
    for p in &mut params {
        *p = rng.gen_range(-1.5..1.5);
    }
    crf.factors_mut().set_parameters(&params).unwrap();
    crf
}

/// A random unlabeled instance with one or two attributes per position
pub fn random_instance(seed: u64, len: usize, num_features: usize) -> Instance {
    let mut rng = StdRng::seed_from_u64(seed);
    let items = (0..len)
        .map(|_| {
            let count = rng.gen_range(1..=2usize.min(num_features));
            (0..count)
                .map(|_| {
                    ObservedAttribute::new(
                        rng.gen_range(0..num_features as u32),
                        rng.gen_range(0.25..1.5),
                    )
                })
                .collect()
        })
        .collect();
    Instance::new(items)
}

/// A hand-built 3-state model with impossible initial/final states and a
/// dead-end arc, exercising the `-inf` plumbing
pub fn gappy_crf() -> Crf {
    let mut crf = Crf::new(2, ModelKind::GloballyNormalized);
    let g0 = crf.weight_group("g0");
    let g1 = crf.weight_group("g1");
    let g2 = crf.weight_group("g2");
    crf.add_state(
        "A",
        0.2,
        f64::NEG_INFINITY,
        vec![
            ArcSpec::new("A", 0, vec![g0]),
            ArcSpec::new("B", 1, vec![g1]),
            ArcSpec::new("C", 2, vec![g2]),
        ],
    )
    .unwrap();
    crf.add_state(
        "B",
        f64::NEG_INFINITY,
        0.1,
        vec![ArcSpec::new("A", 0, vec![g1]), ArcSpec::new("B", 1, vec![g0, g1])],
    )
    .unwrap();
    // C is a dead end: no outgoing arcs, not a final state
    crf.add_state("C", f64::NEG_INFINITY, f64::NEG_INFINITY, vec![])
        .unwrap();
    crf.finish().unwrap();

    crf.factors_mut().weight_mut(g0).set(0, 0.7).unwrap();
    crf.factors_mut().weight_mut(g0).set(1, -0.4).unwrap();
    crf.factors_mut().weight_mut(g1).set(0, -0.9).unwrap();
    crf.factors_mut().weight_mut(g1).set(1, 0.3).unwrap();
    crf.factors_mut().weight_mut(g2).set(0, 1.1).unwrap();
    crf.factors_mut().set_default_weight(g1, 0.25).unwrap();
    crf
}

/// A small instance over the two-feature space of [`gappy_crf`]
pub fn gappy_instance(len: usize) -> Instance {
    let items = (0..len)
        .map(|t| {
            vec![
                ObservedAttribute::new((t % 2) as u32, 1.0),
                ObservedAttribute::new(((t + 1) % 2) as u32, 0.5),
            ]
        })
        .collect();
    Instance::new(items)
}

/// `WeightTying::Both` model over two labels: every arc scores its own
/// group plus a destination-shared group
pub fn tied_crf() -> Crf {
    let mut labels = Alphabet::new();
    labels.intern("B");
    labels.intern("O");
    let mut crf = Crf::new(2, ModelKind::GloballyNormalized);
    crf.add_states_for_labels(
        &labels,
        &[],
        Connectivity::FullyConnected,
        WeightTying::Both,
        &[],
    )
    .unwrap();
    let mut params = crf.factors().parameters_vec();
    for (i, p) in params.iter_mut().enumerate() {
        *p = ((i % 5) as f64 - 2.0) * 0.3;
    }
    crf.factors_mut().set_parameters(&params).unwrap();
    crf
}
