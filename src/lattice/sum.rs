use log::warn;
use ndarray::Array2;

use super::{log_add, log_sum_slice, score_step};
use crate::dataset::Instance;
use crate::factors::Incrementor;
use crate::transducer::WeightedTransducer;

/// Exact log-space forward-backward over one instance.
///
/// Computes the total path weight (log partition function) and, via the
/// [`Incrementor`] protocol, per-state and per-transition marginal
/// probabilities. Transition marginals are reported as they are produced
/// during the backward pass; the full xi table is never materialized.
///
/// With an output constraint sequence the same recursion runs over the
/// restricted transition set, which is how observed-label statistics are
/// gathered.
#[derive(Debug)]
pub struct SumLattice {
    len: usize,
    num_states: usize,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    total: f64,
}

impl SumLattice {
    /// Run forward-backward. `constraint`, if present, must have one
    /// output label per input position.
    pub fn new<T: WeightedTransducer>(
        model: &T,
        instance: &Instance,
        constraint: Option<&[u32]>,
        mut incrementor: Option<&mut dyn Incrementor>,
    ) -> Self {
        let len = instance.len();
        let num_states = model.num_states();
        if let Some(c) = constraint {
            assert_eq!(c.len(), len, "constraint length must match input length");
        }

        let mut lattice = Self {
            len,
            num_states,
            alpha: Array2::from_elem((len + 1, num_states), f64::NEG_INFINITY),
            beta: Array2::from_elem((len + 1, num_states), f64::NEG_INFINITY),
            total: f64::NEG_INFINITY,
        };

        let initial = model.initial_states();
        if initial.is_empty() {
            warn!("sum lattice over a transducer with no initial states");
            return lattice;
        }
        for &s in &initial {
            lattice.alpha[[0, s]] = model.initial_weight(s);
        }

        let arena = model.transducer();
        let num_arcs = arena.num_arcs();
        let mut scratch = Vec::new();
        let mut weights = Vec::with_capacity(len);
        for t in 0..len {
            let mut step = vec![f64::NEG_INFINITY; num_arcs];
            let output = constraint.map(|c| c[t]);
            score_step(model, &instance.items[t], output, &mut step, &mut scratch);
            weights.push(step);
        }

        // Forward pass
        for t in 0..len {
            let step = &weights[t];
            for s in 0..num_states {
                let a = lattice.alpha[[t, s]];
                if a == f64::NEG_INFINITY {
                    continue;
                }
                let offset = arena.arc_offset(s);
                for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                    let w = step[offset + k];
                    if w == f64::NEG_INFINITY {
                        continue;
                    }
                    let d = arc.destination();
                    lattice.alpha[[t + 1, d]] = log_add(lattice.alpha[[t + 1, d]], a + w);
                }
            }
        }

        let final_scores: Vec<f64> = (0..num_states)
            .map(|s| lattice.alpha[[len, s]] + model.final_weight(s))
            .collect();
        lattice.total = log_sum_slice(&final_scores);
        if lattice.total == f64::NEG_INFINITY {
            // No statistics are reported; the accumulator stays untouched.
            warn!("every path through the sum lattice is impossible");
            return lattice;
        }

        // Backward pass, streaming transition marginals as they appear
        for s in 0..num_states {
            lattice.beta[[len, s]] = model.final_weight(s);
        }
        for t in (0..len).rev() {
            let step = &weights[t];
            for s in 0..num_states {
                let offset = arena.arc_offset(s);
                let mut b = f64::NEG_INFINITY;
                for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                    let w = step[offset + k];
                    if w == f64::NEG_INFINITY {
                        continue;
                    }
                    let next = lattice.beta[[t + 1, arc.destination()]];
                    if next == f64::NEG_INFINITY {
                        continue;
                    }
                    b = log_add(b, w + next);
                    if let Some(inc) = incrementor.as_deref_mut() {
                        let xi = lattice.alpha[[t, s]] + w + next - lattice.total;
                        if xi != f64::NEG_INFINITY {
                            inc.increment_transition(arena.arc_id(s, k), t, xi.exp());
                        }
                    }
                }
                lattice.beta[[t, s]] = b;
            }
        }

        if let Some(inc) = incrementor.as_deref_mut() {
            for s in 0..num_states {
                let first = lattice.gamma(0, s);
                if first != f64::NEG_INFINITY {
                    inc.increment_initial(s, first.exp());
                }
                let last = lattice.gamma(len, s);
                if last != f64::NEG_INFINITY {
                    inc.increment_final(s, last.exp());
                }
            }
        }

        lattice
    }

    /// Log partition function; `-inf` when every path is impossible
    pub fn total_weight(&self) -> f64 {
        self.total
    }

    /// Log posterior of being in `state` at time `t` (layer `t`, before
    /// consuming input `t`)
    pub fn gamma(&self, t: usize, state: usize) -> f64 {
        if self.total == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        let a = self.alpha[[t, state]];
        let b = self.beta[[t, state]];
        if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        a + b - self.total
    }

    /// Unnormalized forward weight into `(t, state)`
    pub fn alpha(&self, t: usize, state: usize) -> f64 {
        self.alpha[[t, state]]
    }

    /// Unnormalized backward weight out of `(t, state)`
    pub fn beta(&self, t: usize, state: usize) -> f64 {
        self.beta[[t, state]]
    }

    /// Input length in positions; the trellis has one more layer
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }
}
