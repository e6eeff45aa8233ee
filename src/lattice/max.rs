use log::warn;
use ndarray::Array2;

use super::score_step;
use super::search::{AStar, SearchGraph};
use crate::dataset::Instance;
use crate::transducer::{ArcId, WeightedTransducer};

/// Back-pointer sentinel for nodes no path reaches
const NO_ARC: u32 = u32::MAX;

/// Default bound on the number of per-step weight tables the n-best
/// search keeps alive
const DEFAULT_MAX_CACHED_STEPS: usize = 64;

/// One entry of an n-best list
#[derive(Debug, Clone, PartialEq)]
pub struct NBestPath {
    /// Output labels, one per input position
    pub labels: Vec<u32>,
    /// Total path weight (initial + transitions + final)
    pub weight: f64,
}

/// Max-product (Viterbi) lattice: the single best path by dynamic
/// programming, and n-best lists by A* search over the trellis.
///
/// The n-best search walks the trellis end-to-start: edge costs are
/// negated transition weights and the heuristic is the negated Viterbi
/// weight-to-reach, which is admissible because `delta` is the true
/// optimum. Because every expansion of a `(time, state)` node re-reads the
/// same transition weights, per-step weight tables are computed on first
/// touch and kept in a bounded cache that recycles the least-recently-used
/// slot.
pub struct MaxLattice<'a, T: WeightedTransducer> {
    model: &'a T,
    instance: &'a Instance,
    /// Max weight of any path from an initial state into `(t, s)`
    delta: Array2<f64>,
    /// Global arc id of the best incoming transition per node
    back: Array2<u32>,
    best_end: Option<usize>,
    best_weight: f64,
    max_cached_steps: usize,
}

impl<'a, T: WeightedTransducer> MaxLattice<'a, T> {
    pub fn new(model: &'a T, instance: &'a Instance) -> Self {
        Self::with_cache(model, instance, DEFAULT_MAX_CACHED_STEPS)
    }

    /// Build the lattice with an explicit bound on cached weight tables
    pub fn with_cache(model: &'a T, instance: &'a Instance, max_cached_steps: usize) -> Self {
        let len = instance.len();
        let num_states = model.num_states();
        let arena = model.transducer();

        let mut lattice = Self {
            model,
            instance,
            delta: Array2::from_elem((len + 1, num_states), f64::NEG_INFINITY),
            back: Array2::from_elem((len + 1, num_states), NO_ARC),
            best_end: None,
            best_weight: f64::NEG_INFINITY,
            max_cached_steps: max_cached_steps.max(1),
        };

        let initial = model.initial_states();
        if initial.is_empty() {
            warn!("max lattice over a transducer with no initial states");
            return lattice;
        }
        for &s in &initial {
            lattice.delta[[0, s]] = model.initial_weight(s);
        }

        let mut step = vec![f64::NEG_INFINITY; arena.num_arcs()];
        let mut scratch = Vec::new();
        for t in 0..len {
            score_step(model, &instance.items[t], None, &mut step, &mut scratch);
            for s in 0..num_states {
                let d = lattice.delta[[t, s]];
                if d == f64::NEG_INFINITY {
                    continue;
                }
                let offset = arena.arc_offset(s);
                for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                    let w = step[offset + k];
                    if w == f64::NEG_INFINITY {
                        continue;
                    }
                    let dest = arc.destination();
                    let score = d + w;
                    if score > lattice.delta[[t + 1, dest]] {
                        lattice.delta[[t + 1, dest]] = score;
                        lattice.back[[t + 1, dest]] = arena.arc_id(s, k).0;
                    }
                }
            }
        }

        for s in 0..num_states {
            let score = lattice.delta[[len, s]] + model.final_weight(s);
            if score > lattice.best_weight {
                lattice.best_weight = score;
                lattice.best_end = Some(s);
            }
        }
        lattice
    }

    /// Weight of the best complete path; `-inf` if none exists
    pub fn best_weight(&self) -> f64 {
        self.best_weight
    }

    /// Max weight of any path from an initial state into `(t, state)`
    pub fn delta(&self, t: usize, state: usize) -> f64 {
        self.delta[[t, state]]
    }

    /// The arg-max output label sequence, reconstructed from the
    /// back-pointers; empty when every complete path is impossible
    pub fn best_output_sequence(&self) -> Vec<u32> {
        let len = self.instance.len();
        let mut state = match self.best_end {
            Some(s) => s,
            None => return Vec::new(),
        };
        let arena = self.model.transducer();
        let mut labels = vec![0u32; len];
        for t in (0..len).rev() {
            let arc_id = ArcId(self.back[[t + 1, state]]);
            debug_assert_ne!(arc_id.0, NO_ARC);
            labels[t] = arena.arc(arc_id).label();
            state = arena.arc_source(arc_id);
        }
        labels
    }

    /// The `n` best complete paths, weight-sorted descending. The first
    /// entry carries the same weight as [`best_weight`](Self::best_weight).
    pub fn best_output_sequences(&self, n: usize) -> Vec<NBestPath> {
        let len = self.instance.len();
        if self.best_end.is_none() || n == 0 {
            return Vec::new();
        }

        let starts: Vec<(Hop, f64)> = (0..self.num_states())
            .filter(|&s| {
                self.model.final_weight(s) != f64::NEG_INFINITY
                    && self.delta[[len, s]] != f64::NEG_INFINITY
            })
            .map(|s| {
                (
                    Hop {
                        time: len,
                        state: s as u32,
                        arc: None,
                    },
                    -self.model.final_weight(s),
                )
            })
            .collect();

        let graph = NBestGraph {
            lattice: self,
            cache: StepCache::new(self.max_cached_steps, self.model.transducer().num_arcs()),
        };
        let mut search = AStar::new(graph, starts);
        let mut paths = Vec::with_capacity(n);
        while paths.len() < n {
            match search.next_answer() {
                Some((hops, cost)) => {
                    let mut labels = vec![0u32; len];
                    for hop in &hops {
                        if let Some(arc) = hop.arc {
                            labels[hop.time] = self.model.transducer().arc(arc).label();
                        }
                    }
                    paths.push(NBestPath {
                        labels,
                        weight: -cost,
                    });
                }
                None => break,
            }
        }
        paths
    }

    fn num_states(&self) -> usize {
        self.delta.ncols()
    }
}

/// A position in the backward n-best search: the trellis node plus the
/// arc taken out of it toward the already-searched suffix
#[derive(Debug, Clone, Copy)]
struct Hop {
    time: usize,
    state: u32,
    arc: Option<ArcId>,
}

struct NBestGraph<'l, 'a, T: WeightedTransducer> {
    lattice: &'l MaxLattice<'a, T>,
    cache: StepCache,
}

impl<T: WeightedTransducer> SearchGraph for NBestGraph<'_, '_, T> {
    type Node = Hop;

    fn is_goal(&self, node: &Hop) -> bool {
        node.time == 0
    }

    fn completion_estimate(&self, node: &Hop) -> f64 {
        -self.lattice.delta[[node.time, node.state as usize]]
    }

    fn expand(&mut self, node: &Hop, out: &mut Vec<(Hop, f64)>) {
        if node.time == 0 {
            return;
        }
        let t = node.time - 1;
        let lattice = self.lattice;
        let arena = lattice.model.transducer();
        let weights = self.cache.get_or_compute(t, |buf| {
            let mut scratch = Vec::new();
            score_step(
                lattice.model,
                &lattice.instance.items[t],
                None,
                buf,
                &mut scratch,
            );
        });
        for s in 0..arena.num_states() {
            if lattice.delta[[t, s]] == f64::NEG_INFINITY {
                continue;
            }
            let offset = arena.arc_offset(s);
            for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                if arc.destination() != node.state as usize {
                    continue;
                }
                let w = weights[offset + k];
                if w == f64::NEG_INFINITY {
                    continue;
                }
                out.push((
                    Hop {
                        time: t,
                        state: s as u32,
                        arc: Some(arena.arc_id(s, k)),
                    },
                    -w,
                ));
            }
        }
    }
}

/// Bounded cache of per-time-step arc weight tables, recycling the
/// least-recently-used slot once full
struct StepCache {
    slots: Vec<CacheSlot>,
    capacity: usize,
    table_len: usize,
    tick: u64,
}

struct CacheSlot {
    time: usize,
    weights: Vec<f64>,
    last_used: u64,
}

impl StepCache {
    fn new(capacity: usize, table_len: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            table_len,
            tick: 0,
        }
    }

    fn get_or_compute(&mut self, time: usize, fill: impl FnOnce(&mut [f64])) -> &[f64] {
        self.tick += 1;
        if let Some(i) = self.slots.iter().position(|slot| slot.time == time) {
            self.slots[i].last_used = self.tick;
            return &self.slots[i].weights;
        }
        let i = if self.slots.len() < self.capacity {
            self.slots.push(CacheSlot {
                time,
                weights: Vec::new(),
                last_used: self.tick,
            });
            self.slots.len() - 1
        } else {
            self.slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(i, _)| i)
                .unwrap()
        };
        let slot = &mut self.slots[i];
        slot.time = time;
        slot.last_used = self.tick;
        slot.weights.clear();
        slot.weights.resize(self.table_len, f64::NEG_INFINITY);
        fill(&mut slot.weights);
        &self.slots[i].weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::{Crf, ModelKind};
    use crate::dataset::ObservedAttribute;
    use crate::transducer::ArcSpec;

    fn two_label_model() -> Crf {
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let g0 = crf.weight_group("g0");
        let g1 = crf.weight_group("g1");
        crf.add_state(
            "A",
            0.0,
            0.0,
            vec![ArcSpec::new("A", 0, vec![g0]), ArcSpec::new("B", 1, vec![g1])],
        )
        .unwrap();
        crf.add_state(
            "B",
            0.0,
            0.0,
            vec![ArcSpec::new("A", 0, vec![g1]), ArcSpec::new("B", 1, vec![g0])],
        )
        .unwrap();
        crf.finish().unwrap();
        crf.factors_mut().weight_mut(g0).set(0, 1.0).unwrap();
        crf.factors_mut().weight_mut(g1).set(0, -1.0).unwrap();
        crf
    }

    #[test]
    fn test_best_path_prefers_heavy_arcs() {
        let crf = two_label_model();
        let inst = Instance::new(vec![
            vec![ObservedAttribute::new(0, 1.0)],
            vec![ObservedAttribute::new(0, 1.0)],
        ]);
        let lattice = MaxLattice::new(&crf, &inst);
        // staying on the g0 arcs scores 1.0 per step
        assert_eq!(lattice.best_output_sequence().len(), 2);
        assert!((lattice.best_weight() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_n_best_sorted_and_headed_by_viterbi() {
        let crf = two_label_model();
        let inst = Instance::new(vec![
            vec![ObservedAttribute::new(0, 1.0)],
            vec![ObservedAttribute::new(0, 1.0)],
        ]);
        let lattice = MaxLattice::new(&crf, &inst);
        let paths = lattice.best_output_sequences(4);
        assert_eq!(paths.len(), 4);
        assert!((paths[0].weight - lattice.best_weight()).abs() < 1e-12);
        assert_eq!(paths[0].labels, lattice.best_output_sequence());
        for pair in paths.windows(2) {
            assert!(pair[0].weight >= pair[1].weight - 1e-12);
        }
    }

    #[test]
    fn test_no_initial_states_all_impossible() {
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let g = crf.weight_group("g");
        crf.add_state(
            "A",
            f64::NEG_INFINITY,
            0.0,
            vec![ArcSpec::new("A", 0, vec![g])],
        )
        .unwrap();
        crf.finish().unwrap();
        let inst = Instance::new(vec![vec![]]);
        let lattice = MaxLattice::new(&crf, &inst);
        assert_eq!(lattice.best_weight(), f64::NEG_INFINITY);
        assert!(lattice.best_output_sequence().is_empty());
        assert!(lattice.best_output_sequences(3).is_empty());
    }
}
