//! Lattice inference over the unrolled `(time, state)` trellis.
//!
//! The sum-product side computes the partition function and marginal
//! probabilities; three implementations are substitutable behind the same
//! surface: [`SumLattice`] (exact, log space), [`ScaledSumLattice`]
//! (linear space with per-step rescaling) and [`BeamSumLattice`]
//! (approximate, beam-pruned). The max-product side ([`MaxLattice`])
//! computes the best path and n-best lists.

pub mod max;
pub mod search;
pub mod sum;
pub mod sum_beam;
pub mod sum_scaled;

pub use self::max::{MaxLattice, NBestPath};
pub use self::search::{AStar, SearchGraph};
pub use self::sum::SumLattice;
pub use self::sum_beam::{BeamOptions, BeamSumLattice};
pub use self::sum_scaled::ScaledSumLattice;

use crate::dataset::ObservedAttribute;
use crate::transducer::WeightedTransducer;

/// `log(exp(a) + exp(b))` with exact handling of `-inf` operands.
///
/// An infinite operand must short-circuit: naively shifting by the maximum
/// turns `-inf - (-inf)` into NaN.
pub fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `log(sum(exp(values)))`, `-inf` for an empty or all-impossible slice
pub fn log_sum_slice(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Score every arc of the model against one input item, writing into a
/// flat arc-major buffer (`buf.len() == num_arcs`, arcs in global order).
pub(crate) fn score_step<T: WeightedTransducer + ?Sized>(
    model: &T,
    item: &[ObservedAttribute],
    output: Option<u32>,
    buf: &mut [f64],
    scratch: &mut Vec<f64>,
) {
    let arena = model.transducer();
    for state in 0..arena.num_states() {
        model.arc_weights(state, item, output, scratch);
        let offset = arena.arc_offset(state);
        buf[offset..offset + scratch.len()].copy_from_slice(scratch);
    }
}
