use log::warn;
use ndarray::Array2;

use super::{log_add, log_sum_slice, score_step};
use crate::dataset::Instance;
use crate::factors::Incrementor;
use crate::transducer::WeightedTransducer;

/// Beam controls for [`BeamSumLattice`].
#[derive(Debug, Clone, Copy)]
pub struct BeamOptions {
    /// Number of states retained per time step
    pub width: usize,
    /// Drop states whose forward weight trails the step maximum by more
    /// than this many log units (narrows the beam)
    pub relative_threshold: Option<f64>,
    /// Widen the beam past `width` until the retained states cover at
    /// least this fraction of the step's forward probability mass
    pub mass_target: Option<f64>,
}

impl Default for BeamOptions {
    fn default() -> Self {
        Self {
            width: 16,
            relative_threshold: None,
            mass_target: None,
        }
    }
}

/// Beam-pruned forward-backward.
///
/// An *approximate* algorithm: at every time step only the top states by
/// forward weight are retained and all others become impossible, so the
/// returned total weight underestimates the true partition function and
/// the marginals are biased by the truncation. Reported marginals are
/// renormalized per time step (a best-effort correction for the pruned
/// mass, guaranteeing the per-step totals still sum to one); with a beam
/// at least as wide as the state space nothing is pruned and the result
/// equals the exact lattice's.
#[derive(Debug)]
pub struct BeamSumLattice {
    len: usize,
    num_states: usize,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    /// Per-layer marginal mass after pruning, the renormalizer
    norms: Vec<f64>,
    total: f64,
}

impl BeamSumLattice {
    pub fn new<T: WeightedTransducer>(
        model: &T,
        instance: &Instance,
        constraint: Option<&[u32]>,
        mut incrementor: Option<&mut dyn Incrementor>,
        options: BeamOptions,
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
            norms: vec![0.0; len + 1],
            total: f64::NEG_INFINITY,
        };

        let initial = model.initial_states();
        if initial.is_empty() {
            warn!("beam sum lattice over a transducer with no initial states");
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

        // Forward pass, pruning each new layer
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
            prune_layer(&mut lattice.alpha, t + 1, &options);
        }

        let final_scores: Vec<f64> = (0..num_states)
            .map(|s| lattice.alpha[[len, s]] + model.final_weight(s))
            .collect();
        lattice.total = log_sum_slice(&final_scores);
        if lattice.total == f64::NEG_INFINITY {
            warn!("every path through the beam sum lattice is impossible");
            return lattice;
        }

        // Backward pass with per-step renormalized reporting
        for s in 0..num_states {
            lattice.beta[[len, s]] = model.final_weight(s);
        }
        lattice.norms[len] = lattice.layer_mass(len);
        for t in (0..len).rev() {
            let step = &weights[t];
            // xi for step t uses the finished layer t+1 and its normalizer
            let next_norm = lattice.norms[t + 1];
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
                        if xi != f64::NEG_INFINITY && next_norm > 0.0 {
                            inc.increment_transition(
                                arena.arc_id(s, k),
                                t,
                                xi.exp() / next_norm,
                            );
                        }
                    }
                }
                lattice.beta[[t, s]] = b;
            }
            lattice.norms[t] = lattice.layer_mass(t);
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

    fn layer_mass(&self, t: usize) -> f64 {
        let mut mass = 0.0;
        for s in 0..self.num_states {
            let a = self.alpha[[t, s]];
            let b = self.beta[[t, s]];
            if a != f64::NEG_INFINITY && b != f64::NEG_INFINITY {
                mass += (a + b - self.total).exp();
            }
        }
        mass
    }

    /// Beam-estimated log partition function (an underestimate of the
    /// exact lattice's whenever pruning removed mass)
    pub fn total_weight(&self) -> f64 {
        self.total
    }

    /// Log posterior of being in `state` at layer `t`, renormalized over
    /// the surviving states of the layer
    pub fn gamma(&self, t: usize, state: usize) -> f64 {
        if self.total == f64::NEG_INFINITY || self.norms[t] == 0.0 {
            return f64::NEG_INFINITY;
        }
        let a = self.alpha[[t, state]];
        let b = self.beta[[t, state]];
        if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        a + b - self.total - self.norms[t].ln()
    }

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

/// Keep the strongest states of a freshly computed forward layer, setting
/// the rest impossible
fn prune_layer(alpha: &mut Array2<f64>, t: usize, options: &BeamOptions) {
    let mut candidates: Vec<(usize, f64)> = alpha
        .row(t)
        .iter()
        .enumerate()
        .filter(|(_, &a)| a != f64::NEG_INFINITY)
        .map(|(s, &a)| (s, a))
        .collect();
    if candidates.len() <= options.width && options.relative_threshold.is_none() {
        return;
    }
    candidates.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap());

    let mut keep = options.width.min(candidates.len());
    if let Some(target) = options.mass_target {
        // Widen until the kept prefix covers the target probability mass
        let max = candidates[0].1;
        let total_mass: f64 = candidates.iter().map(|(_, a)| (a - max).exp()).sum();
        let mut covered = 0.0;
        let mut needed = candidates.len();
        for (i, (_, a)) in candidates.iter().enumerate() {
            covered += (a - max).exp();
            if covered >= target * total_mass {
                needed = i + 1;
                break;
            }
        }
        keep = keep.max(needed).min(candidates.len());
    }
    if let Some(threshold) = options.relative_threshold {
        let max = candidates[0].1;
        let within = candidates.partition_point(|(_, a)| *a >= max - threshold);
        keep = keep.min(within.max(1));
    }

    for &(s, _) in &candidates[keep..] {
        alpha[[t, s]] = f64::NEG_INFINITY;
    }
}
