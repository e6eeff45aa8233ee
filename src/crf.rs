use log::warn;

use crate::alphabet::Alphabet;
use crate::dataset::{Instance, ObservedAttribute};
use crate::error::{Error, Result};
use crate::factors::{Factors, WeightVector};
use crate::lattice::max::{MaxLattice, NBestPath};
use crate::lattice::log_sum_slice;
use crate::transducer::{ArcSpec, Transducer, WeightedTransducer};

/// Normalization regime of a chain model.
///
/// This is the single semantic difference between the two model families:
/// the locally normalized variant renormalizes each state's outgoing
/// weights to log-probabilities immediately after scoring, and all lattice
/// code downstream is unaware of the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Globally normalized (CRF): weights are unnormalized log-potentials
    GloballyNormalized,
    /// Locally normalized (MEMM): per-state log-sum-exp renormalization
    LocallyNormalized,
}

/// Which label pairs receive transitions when building states from labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Every label pair
    FullyConnected,
    /// Only label pairs adjacent somewhere in the training data
    AsInData,
}

/// How transition weights are tied when building states from labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightTying {
    /// One weight group per (source, destination) arc
    PerArc,
    /// One weight group per destination label, shared across sources
    ByDestination,
    /// Both: each arc scores against its own group plus the shared
    /// destination group
    Both,
}

/// A linear-chain discriminative sequence model: a transducer arena, the
/// tied parameter bundle scoring its transitions, and the normalization
/// regime.
///
/// A transition's weight is the sum over its weight groups of the group
/// vector's dot product with the input features plus the group's default
/// weight.
#[derive(Debug, Clone)]
pub struct Crf {
    transducer: Transducer,
    factors: Factors,
    weight_names: Alphabet,
    kind: ModelKind,
    num_features: usize,
}

impl Crf {
    /// A model over an input feature space of the given dimensionality
    pub fn new(num_features: usize, kind: ModelKind) -> Self {
        Self {
            transducer: Transducer::new(),
            factors: Factors::new(),
            weight_names: Alphabet::new(),
            kind,
            num_features,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn factors(&self) -> &Factors {
        &self.factors
    }

    pub fn factors_mut(&mut self) -> &mut Factors {
        &mut self.factors
    }

    /// Get or create the weight group registered under `name`.
    ///
    /// New groups start as dense zero vectors over the feature space.
    pub fn weight_group(&mut self, name: &str) -> u32 {
        if let Some(id) = self.weight_names.lookup(name) {
            return id;
        }
        let id = self.weight_names.intern(name);
        let created = self
            .factors
            .add_weight_group(WeightVector::dense(self.num_features));
        debug_assert_eq!(id, created);
        id
    }

    /// Look up a weight group by name without creating it
    pub fn weight_group_by_name(&self, name: &str) -> Option<u32> {
        self.weight_names.lookup(name)
    }

    /// Freeze a weight group by name
    pub fn freeze_weight_group(&mut self, name: &str) -> Result<()> {
        match self.weight_names.lookup(name) {
            Some(id) => self.factors.set_frozen(id, true),
            None => Err(Error::InvalidParameter(format!(
                "no weight group named `{}`",
                name
            ))),
        }
    }

    /// Add a state with its outgoing transitions and initial/final weights.
    ///
    /// Weight-group references are bounds-checked here; duplicate state
    /// names are rejected.
    pub fn add_state(
        &mut self,
        name: &str,
        initial_weight: f64,
        final_weight: f64,
        arcs: Vec<ArcSpec>,
    ) -> Result<usize> {
        for spec in &arcs {
            for &group in &spec.weight_groups {
                if group as usize >= self.factors.num_weight_groups() {
                    return Err(Error::WeightGroupOutOfBounds {
                        index: group as usize,
                        len: self.factors.num_weight_groups(),
                    });
                }
            }
        }
        let index = self.transducer.add_state(name, arcs)?;
        let slot = self.factors.add_state_slot(initial_weight, final_weight);
        debug_assert_eq!(index, slot);
        Ok(index)
    }

    /// Resolve destination names and fix the arc order
    pub fn finish(&mut self) -> Result<()> {
        self.transducer.finish()
    }

    /// One state per label, transitions per the connectivity and tying
    /// choices, minus forbidden label pairs.
    ///
    /// Patterns are `"FROM->TO"` label-name pairs, `*` standing for any
    /// label; anything else is a configuration error. The instances are
    /// consulted only under [`Connectivity::AsInData`].
    pub fn add_states_for_labels(
        &mut self,
        labels: &Alphabet,
        instances: &[Instance],
        connectivity: Connectivity,
        tying: WeightTying,
        forbidden: &[&str],
    ) -> Result<()> {
        let num_labels = labels.len();
        let forbidden = parse_patterns(forbidden, labels)?;

        let mut connected = vec![vec![false; num_labels]; num_labels];
        match connectivity {
            Connectivity::FullyConnected => {
                for row in &mut connected {
                    row.iter_mut().for_each(|c| *c = true);
                }
            }
            Connectivity::AsInData => {
                for inst in instances {
                    if let Some(ys) = &inst.labels {
                        for pair in ys.windows(2) {
                            connected[pair[0] as usize][pair[1] as usize] = true;
                        }
                    }
                }
            }
        }
        for &(from, to) in &forbidden {
            for (i, row) in connected.iter_mut().enumerate() {
                if from.map_or(true, |f| f as usize == i) {
                    for (j, c) in row.iter_mut().enumerate() {
                        if to.map_or(true, |t| t as usize == j) {
                            *c = false;
                        }
                    }
                }
            }
        }

        for (src, src_id) in labels.iter() {
            let mut arcs = Vec::new();
            for (dst, dst_id) in labels.iter() {
                if !connected[src_id as usize][dst_id as usize] {
                    continue;
                }
                let mut groups = Vec::new();
                match tying {
                    WeightTying::PerArc => {
                        groups.push(self.weight_group(&format!("{}->{}", src, dst)));
                    }
                    WeightTying::ByDestination => {
                        groups.push(self.weight_group(&format!("->{}", dst)));
                    }
                    WeightTying::Both => {
                        groups.push(self.weight_group(&format!("{}->{}", src, dst)));
                        groups.push(self.weight_group(&format!("->{}", dst)));
                    }
                }
                arcs.push(ArcSpec::new(dst, dst_id, groups));
            }
            self.add_state(src, 0.0, 0.0, arcs)?;
        }
        self.finish()
    }

    fn raw_arc_weights(&self, state: usize, item: &[ObservedAttribute], out: &mut Vec<f64>) {
        let arcs = self.transducer.state(state).arcs();
        out.clear();
        out.reserve(arcs.len());
        for arc in arcs {
            let mut weight = 0.0;
            for &group in arc.weight_groups() {
                weight += self.factors.weight(group).dot(item) + self.factors.default_weight(group);
            }
            out.push(weight);
        }
    }

    /// Viterbi decode: the highest-weight output label sequence
    pub fn transduce(&self, instance: &Instance) -> Vec<u32> {
        MaxLattice::new(self, instance).best_output_sequence()
    }

    /// The `n` highest-weight output sequences, weight-sorted descending
    pub fn n_best(&self, instance: &Instance, n: usize) -> Vec<NBestPath> {
        MaxLattice::new(self, instance).best_output_sequences(n)
    }

    /// Decode one instance, checking that any requested output length
    /// matches the input length
    pub fn label(&self, instance: &Instance) -> Result<Vec<u32>> {
        if let Some(labels) = &instance.labels {
            if labels.len() != instance.len() {
                return Err(Error::LengthMismatch {
                    expected: instance.len(),
                    actual: labels.len(),
                });
            }
        }
        Ok(self.transduce(instance))
    }

    /// Decode a batch; a malformed instance is reported in place and does
    /// not fail its neighbors
    pub fn label_all(&self, instances: &[Instance]) -> Vec<Result<Vec<u32>>> {
        instances
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                let result = self.label(inst);
                if let Err(e) = &result {
                    warn!("skipping instance {}: {}", i, e);
                }
                result
            })
            .collect()
    }
}

impl WeightedTransducer for Crf {
    fn transducer(&self) -> &Transducer {
        &self.transducer
    }

    fn initial_weight(&self, state: usize) -> f64 {
        self.factors.initial_weight(state)
    }

    fn final_weight(&self, state: usize) -> f64 {
        self.factors.final_weight(state)
    }

    fn arc_weights(
        &self,
        state: usize,
        item: &[ObservedAttribute],
        output: Option<u32>,
        out: &mut Vec<f64>,
    ) {
        self.raw_arc_weights(state, item, out);
        if self.kind == ModelKind::LocallyNormalized && !out.is_empty() {
            // Normalize over the unconstrained sibling set, so constrained
            // lattices score true conditional log-probabilities.
            let z = log_sum_slice(out);
            if z > f64::NEG_INFINITY {
                out.iter_mut().for_each(|w| *w -= z);
            }
        }
        if let Some(label) = output {
            let arcs = self.transducer.state(state).arcs();
            for (w, arc) in out.iter_mut().zip(arcs) {
                if arc.label() != label {
                    *w = f64::NEG_INFINITY;
                }
            }
        }
    }
}

/// Parse `"FROM->TO"` label-pair patterns, `*` as a wildcard side
fn parse_patterns(
    patterns: &[&str],
    labels: &Alphabet,
) -> Result<Vec<(Option<u32>, Option<u32>)>> {
    let mut parsed = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let (from, to) = pattern
            .split_once("->")
            .ok_or_else(|| Error::MalformedPattern(pattern.to_string()))?;
        let side = |name: &str| -> Result<Option<u32>> {
            if name == "*" {
                Ok(None)
            } else {
                labels
                    .lookup(name)
                    .map(Some)
                    .ok_or_else(|| Error::MalformedPattern(pattern.to_string()))
            }
        };
        parsed.push((side(from)?, side(to)?));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_alphabet(names: &[&str]) -> Alphabet {
        let mut labels = Alphabet::new();
        for name in names {
            labels.intern(name);
        }
        labels
    }

    fn attr(id: u32, value: f64) -> ObservedAttribute {
        ObservedAttribute::new(id, value)
    }

    #[test]
    fn test_tied_scoring() {
        let mut crf = Crf::new(2, ModelKind::GloballyNormalized);
        let shared = crf.weight_group("shared");
        let own = crf.weight_group("own");
        crf.add_state(
            "A",
            0.0,
            0.0,
            vec![
                ArcSpec::new("A", 0, vec![shared]),
                ArcSpec::new("B", 1, vec![own, shared]),
            ],
        )
        .unwrap();
        crf.add_state("B", f64::NEG_INFINITY, 0.0, vec![ArcSpec::new("A", 0, vec![shared])])
            .unwrap();
        crf.finish().unwrap();

        crf.factors_mut().weight_mut(shared).set(0, 1.0).unwrap();
        crf.factors_mut().weight_mut(own).set(1, 2.0).unwrap();
        crf.factors_mut().set_default_weight(own, 0.5).unwrap();

        let item = vec![attr(0, 1.0), attr(1, 1.0)];
        let mut out = Vec::new();
        crf.arc_weights(0, &item, None, &mut out);
        // arc A->A: shared only = 1.0; arc A->B: own + shared = 2.5 + 1.0
        assert!((out[0] - 1.0).abs() < 1e-12);
        assert!((out[1] - 3.5).abs() < 1e-12);

        // the tied group is shared across states
        crf.arc_weights(1, &item, None, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_output_constraint_masks_to_impossible() {
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let g = crf.weight_group("g");
        crf.add_state(
            "A",
            0.0,
            0.0,
            vec![ArcSpec::new("A", 0, vec![g]), ArcSpec::new("A", 1, vec![g])],
        )
        .unwrap();
        crf.finish().unwrap();

        let item = vec![attr(0, 1.0)];
        let mut out = Vec::new();
        crf.arc_weights(0, &item, Some(1), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], f64::NEG_INFINITY);
        assert!(out[1].is_finite());
    }

    #[test]
    fn test_local_normalization_sums_to_one() {
        let mut crf = Crf::new(1, ModelKind::LocallyNormalized);
        let g0 = crf.weight_group("g0");
        let g1 = crf.weight_group("g1");
        crf.add_state(
            "A",
            0.0,
            0.0,
            vec![ArcSpec::new("A", 0, vec![g0]), ArcSpec::new("A", 1, vec![g1])],
        )
        .unwrap();
        crf.finish().unwrap();
        crf.factors_mut().weight_mut(g0).set(0, 1.5).unwrap();
        crf.factors_mut().weight_mut(g1).set(0, -0.5).unwrap();

        let item = vec![attr(0, 1.0)];
        let mut out = Vec::new();
        crf.arc_weights(0, &item, None, &mut out);
        let total: f64 = out.iter().map(|w| w.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_group_bounds_checked() {
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let err = crf
            .add_state("A", 0.0, 0.0, vec![ArcSpec::new("A", 0, vec![3])])
            .unwrap_err();
        assert!(matches!(err, Error::WeightGroupOutOfBounds { index: 3, .. }));
    }

    #[test]
    fn test_states_for_labels_connectivity() {
        let labels = label_alphabet(&["B", "O"]);
        let instances = vec![Instance::labeled(
            vec![vec![], vec![], vec![]],
            vec![0, 1, 1],
        )];

        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        crf.add_states_for_labels(
            &labels,
            &instances,
            Connectivity::AsInData,
            WeightTying::PerArc,
            &[],
        )
        .unwrap();
        // only B->O and O->O appear in the data
        assert_eq!(crf.transducer().num_arcs(), 2);
        assert!(crf.weight_group_by_name("B->O").is_some());
        assert!(crf.weight_group_by_name("O->B").is_none());
    }

    #[test]
    fn test_forbidden_patterns() {
        let labels = label_alphabet(&["B", "O"]);
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        crf.add_states_for_labels(
            &labels,
            &[],
            Connectivity::FullyConnected,
            WeightTying::PerArc,
            &["*->B"],
        )
        .unwrap();
        // B->B, O->B forbidden; B->O, O->O remain
        assert_eq!(crf.transducer().num_arcs(), 2);
    }

    #[test]
    fn test_label_reports_length_mismatch_per_instance() {
        let labels = label_alphabet(&["B", "O"]);
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        crf.add_states_for_labels(
            &labels,
            &[],
            Connectivity::FullyConnected,
            WeightTying::PerArc,
            &[],
        )
        .unwrap();

        let good = Instance::new(vec![vec![attr(0, 1.0)], vec![attr(0, 1.0)]]);
        // two items but three requested outputs
        let bad = Instance {
            items: vec![vec![], vec![]],
            labels: Some(vec![0, 1, 0]),
            weight: 1.0,
        };

        let results = crf.label_all(&[good, bad]);
        assert!(results[0].is_ok());
        assert_eq!(results[0].as_ref().unwrap().len(), 2);
        assert!(matches!(results[1], Err(Error::LengthMismatch { .. })));
    }

    #[test]
    fn test_malformed_pattern() {
        let labels = label_alphabet(&["B", "O"]);
        let mut crf = Crf::new(1, ModelKind::GloballyNormalized);
        let err = crf
            .add_states_for_labels(
                &labels,
                &[],
                Connectivity::FullyConnected,
                WeightTying::PerArc,
                &["B=>O"],
            )
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPattern(_)));

        let err = crf
            .add_states_for_labels(
                &labels,
                &[],
                Connectivity::FullyConnected,
                WeightTying::PerArc,
                &["B->X"],
            )
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPattern(_)));
    }
}
