use log::warn;
use ndarray::Array2;

use super::score_step;
use crate::dataset::Instance;
use crate::factors::Incrementor;
use crate::transducer::WeightedTransducer;

/// Forward-backward in linear probability space with per-step rescaling.
///
/// Instead of log-space arithmetic, alpha and beta are renormalized at
/// every time step (dividing each layer by its sum) while a running log
/// scale factor accumulates the normalizers. This trades the log-space
/// transcendental calls of [`SumLattice`](super::SumLattice) for periodic
/// renormalization; the two agree on `Z`, gamma and xi to within
/// floating-point tolerance. Exponentials are shifted by the step's
/// maximum weight first, so large weights cannot overflow.
#[derive(Debug)]
pub struct ScaledSumLattice {
    len: usize,
    num_states: usize,
    /// Scaled forward weights; each layer sums to one
    alpha: Array2<f64>,
    /// Scaled backward weights; each layer sums to one
    beta: Array2<f64>,
    /// Per-layer sum of `alpha * beta`, the marginal normalizer
    gamma_norm: Vec<f64>,
    total: f64,
}

impl ScaledSumLattice {
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
            alpha: Array2::zeros((len + 1, num_states)),
            beta: Array2::zeros((len + 1, num_states)),
            gamma_norm: vec![0.0; len + 1],
            total: f64::NEG_INFINITY,
        };

        let initial = model.initial_states();
        if initial.is_empty() {
            warn!("scaled sum lattice over a transducer with no initial states");
            return lattice;
        }

        let arena = model.transducer();
        let num_arcs = arena.num_arcs();

        // Per-step exponentiated arc weights, shifted by the step maximum
        let mut scratch = Vec::new();
        let mut exp_weights: Vec<Vec<f64>> = Vec::with_capacity(len);
        let mut shifts: Vec<f64> = Vec::with_capacity(len);
        for t in 0..len {
            let mut step = vec![f64::NEG_INFINITY; num_arcs];
            let output = constraint.map(|c| c[t]);
            score_step(model, &instance.items[t], output, &mut step, &mut scratch);
            let shift = step.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let shift = if shift == f64::NEG_INFINITY { 0.0 } else { shift };
            for w in &mut step {
                *w = (*w - shift).exp();
            }
            exp_weights.push(step);
            shifts.push(shift);
        }

        // Forward pass with per-layer renormalization
        let init_shift = initial
            .iter()
            .map(|&s| model.initial_weight(s))
            .fold(f64::NEG_INFINITY, f64::max);
        for &s in &initial {
            lattice.alpha[[0, s]] = (model.initial_weight(s) - init_shift).exp();
        }
        let c0: f64 = lattice.alpha.row(0).sum();
        lattice.alpha.row_mut(0).mapv_inplace(|v| v / c0);
        let mut log_scale = init_shift + c0.ln();

        for t in 0..len {
            let step = &exp_weights[t];
            for s in 0..num_states {
                let a = lattice.alpha[[t, s]];
                if a == 0.0 {
                    continue;
                }
                let offset = arena.arc_offset(s);
                for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                    let w = step[offset + k];
                    if w == 0.0 {
                        continue;
                    }
                    lattice.alpha[[t + 1, arc.destination()]] += a * w;
                }
            }
            let c: f64 = lattice.alpha.row(t + 1).sum();
            if c == 0.0 {
                warn!("every path through the scaled sum lattice is impossible");
                return lattice;
            }
            lattice.alpha.row_mut(t + 1).mapv_inplace(|v| v / c);
            log_scale += shifts[t] + c.ln();
        }

        let final_shift = (0..num_states)
            .map(|s| model.final_weight(s))
            .fold(f64::NEG_INFINITY, f64::max);
        if final_shift == f64::NEG_INFINITY {
            warn!("every path through the scaled sum lattice is impossible");
            return lattice;
        }
        let mut z_layer = 0.0;
        for s in 0..num_states {
            z_layer += lattice.alpha[[len, s]] * (model.final_weight(s) - final_shift).exp();
        }
        if z_layer == 0.0 {
            warn!("every path through the scaled sum lattice is impossible");
            return lattice;
        }
        lattice.total = log_scale + final_shift + z_layer.ln();

        // Backward pass; each beta layer is normalized independently, so
        // marginals are recovered by per-layer normalization below.
        for s in 0..num_states {
            lattice.beta[[len, s]] = (model.final_weight(s) - final_shift).exp();
        }
        let bsum: f64 = lattice.beta.row(len).sum();
        lattice.beta.row_mut(len).mapv_inplace(|v| v / bsum);

        for t in (0..len).rev() {
            let step = &exp_weights[t];
            // Transition marginals for step t only need the finished layer
            // t+1; their own sum is the per-step normalizer.
            if let Some(inc) = incrementor.as_deref_mut() {
                let mut xi = vec![0.0; num_arcs];
                let mut xi_sum = 0.0;
                for s in 0..num_states {
                    let a = lattice.alpha[[t, s]];
                    if a == 0.0 {
                        continue;
                    }
                    let offset = arena.arc_offset(s);
                    for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                        let raw = a * step[offset + k] * lattice.beta[[t + 1, arc.destination()]];
                        xi[offset + k] = raw;
                        xi_sum += raw;
                    }
                }
                if xi_sum > 0.0 {
                    for (id, raw) in xi.into_iter().enumerate() {
                        if raw > 0.0 {
                            inc.increment_transition(
                                crate::transducer::ArcId(id as u32),
                                t,
                                raw / xi_sum,
                            );
                        }
                    }
                }
            }

            for s in 0..num_states {
                let offset = arena.arc_offset(s);
                let mut b = 0.0;
                for (k, arc) in arena.state(s).arcs().iter().enumerate() {
                    b += step[offset + k] * lattice.beta[[t + 1, arc.destination()]];
                }
                lattice.beta[[t, s]] = b;
            }
            let c: f64 = lattice.beta.row(t).sum();
            if c > 0.0 {
                lattice.beta.row_mut(t).mapv_inplace(|v| v / c);
            }
        }

        for t in 0..=len {
            let mut norm = 0.0;
            for s in 0..num_states {
                norm += lattice.alpha[[t, s]] * lattice.beta[[t, s]];
            }
            lattice.gamma_norm[t] = norm;
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

    /// Log posterior of being in `state` at layer `t`
    pub fn gamma(&self, t: usize, state: usize) -> f64 {
        if self.total == f64::NEG_INFINITY || self.gamma_norm[t] == 0.0 {
            return f64::NEG_INFINITY;
        }
        let p = self.alpha[[t, state]] * self.beta[[t, state]] / self.gamma_norm[t];
        if p == 0.0 {
            f64::NEG_INFINITY
        } else {
            p.ln()
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crf::{Crf, ModelKind};
    use crate::lattice::SumLattice;
    use crate::transducer::ArcSpec;

    #[test]
    fn test_matches_log_space_on_small_chain() {
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let g0 = crf.weight_group("g0");
        let g1 = crf.weight_group("g1");
        crf.add_state(
            "A",
            0.3,
            -0.2,
            vec![ArcSpec::new("A", 0, vec![g0]), ArcSpec::new("B", 1, vec![g1])],
        )
        .unwrap();
        crf.add_state("B", -0.1, 0.4, vec![ArcSpec::new("A", 0, vec![g0])])
            .unwrap();
        crf.finish().unwrap();
        crf.factors_mut().weight_mut(g0).set(0, 1.2).unwrap();
        crf.factors_mut().weight_mut(g1).set(0, -0.7).unwrap();

        let inst = Instance::new(vec![
            vec![crate::dataset::ObservedAttribute::new(0, 1.0)],
            vec![crate::dataset::ObservedAttribute::new(0, 0.5)],
        ]);
        let exact = SumLattice::new(&crf, &inst, None, None);
        let scaled = ScaledSumLattice::new(&crf, &inst, None, None);
        assert!((exact.total_weight() - scaled.total_weight()).abs() < 1e-9);
        for t in 0..=2 {
            for s in 0..2 {
                let a = exact.gamma(t, s);
                let b = scaled.gamma(t, s);
                if a == f64::NEG_INFINITY {
                    assert_eq!(b, f64::NEG_INFINITY);
                } else {
                    assert!((a - b).abs() < 1e-9, "gamma mismatch at ({}, {})", t, s);
                }
            }
        }
    }
}
