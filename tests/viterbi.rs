mod common;

use std::collections::HashMap;

use common::*;
use trellis::lattice::MaxLattice;

fn weight_by_labels(crf: &trellis::Crf, inst: &trellis::Instance) -> HashMap<Vec<u32>, f64> {
    enumerate_paths(crf, inst).into_iter().collect()
}

/// Viterbi's best path weight equals the maximum over all complete paths.
#[test]
fn best_path_matches_enumeration() {
    for len in 1..=4 {
        let crf = gappy_crf();
        let inst = gappy_instance(len);
        let paths = enumerate_paths(&crf, &inst);
        let best = paths
            .iter()
            .map(|(_, w)| *w)
            .fold(f64::NEG_INFINITY, f64::max);

        let lattice = MaxLattice::new(&crf, &inst);
        assert!((lattice.best_weight() - best).abs() < 1e-9);

        // the decoded sequence carries the winning weight
        let decoded = lattice.best_output_sequence();
        let table = weight_by_labels(&crf, &inst);
        assert!((table[&decoded] - best).abs() < 1e-9);
    }
}

#[test]
fn best_path_matches_enumeration_on_random_models() {
    for seed in 0..6 {
        let crf = random_chain_crf(seed, 2 + (seed as usize % 3), 3);
        let inst = random_instance(seed + 400, 1 + (seed as usize % 4), 3);
        let paths = enumerate_paths(&crf, &inst);
        let best = paths
            .iter()
            .map(|(_, w)| *w)
            .fold(f64::NEG_INFINITY, f64::max);
        let lattice = MaxLattice::new(&crf, &inst);
        assert!((lattice.best_weight() - best).abs() < 1e-9);
    }
}

/// The k-best list is weight-sorted descending, headed by the Viterbi
/// path, and matches the top of the enumerated path list.
#[test]
fn n_best_matches_sorted_enumeration() {
    let crf = random_chain_crf(21, 3, 3);
    let inst = random_instance(421, 3, 3);
    let lattice = MaxLattice::new(&crf, &inst);

    let mut paths = enumerate_paths(&crf, &inst);
    paths.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let k = 5.min(paths.len());
    let n_best = lattice.best_output_sequences(k);
    assert_eq!(n_best.len(), k);

    assert!((n_best[0].weight - lattice.best_weight()).abs() < 1e-9);
    let table = weight_by_labels(&crf, &inst);
    for (i, path) in n_best.iter().enumerate() {
        // reported weight is the true weight of the reported labels
        assert!((table[&path.labels] - path.weight).abs() < 1e-9);
        // and matches the i-th best enumerated weight
        assert!((path.weight - paths[i].1).abs() < 1e-9);
        if i > 0 {
            assert!(n_best[i - 1].weight >= path.weight - 1e-12);
        }
    }
}

/// Asking for more paths than exist returns them all, still sorted.
#[test]
fn n_best_exhausts_small_lattices() {
    let crf = gappy_crf();
    let inst = gappy_instance(2);
    let paths = enumerate_paths(&crf, &inst);
    let lattice = MaxLattice::new(&crf, &inst);
    let n_best = lattice.best_output_sequences(paths.len() + 10);
    assert_eq!(n_best.len(), paths.len());
}

/// A single cached weight-table slot forces constant recycling and must
/// not change the answers.
#[test]
fn n_best_with_tiny_weight_cache() {
    let crf = random_chain_crf(33, 3, 3);
    let inst = random_instance(433, 4, 3);

    let roomy = MaxLattice::new(&crf, &inst).best_output_sequences(6);
    let tight = MaxLattice::with_cache(&crf, &inst, 1).best_output_sequences(6);
    assert_eq!(roomy.len(), tight.len());
    for (a, b) in roomy.iter().zip(&tight) {
        assert!((a.weight - b.weight).abs() < 1e-12);
    }
}
