use crate::dataset::{Instance, ObservedAttribute};
use crate::error::{Error, Result};
use crate::transducer::{ArcId, Transducer};

/// Change stamps of a parameter store.
///
/// `structure` moves on any structural change (group added, vector
/// replaced, state slot added); `value` moves on any change at all,
/// structural changes included. Caches hold the version they were computed
/// at and compare by equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub structure: u64,
    pub value: u64,
}

/// A feature-indexed weight vector.
///
/// With `indices == None` the vector is dense over the feature space;
/// otherwise `indices` is sorted and parallel to `values`. Sparse vectors
/// silently drop increments to features they do not carry, which is what
/// keeps structurally matching accumulators aligned with the parameters.
#[derive(Debug, Clone)]
pub struct WeightVector {
    indices: Option<Vec<u32>>,
    values: Vec<f64>,
}

impl WeightVector {
    /// A dense zero vector over `len` features
    pub fn dense(len: usize) -> Self {
        Self {
            indices: None,
            values: vec![0.0; len],
        }
    }

    /// A sparse zero vector carrying exactly the given feature ids
    pub fn sparse(mut indices: Vec<u32>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        let len = indices.len();
        Self {
            indices: Some(indices),
            values: vec![0.0; len],
        }
    }

    /// Number of stored locations
    pub fn num_locations(&self) -> usize {
        self.values.len()
    }

    /// The stored values, in location order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn location_of(&self, fid: u32) -> Option<usize> {
        match &self.indices {
            None => {
                if (fid as usize) < self.values.len() {
                    Some(fid as usize)
                } else {
                    None
                }
            }
            Some(indices) => indices.binary_search(&fid).ok(),
        }
    }

    /// The weight stored for a feature id, zero if absent
    pub fn value(&self, fid: u32) -> f64 {
        self.location_of(fid).map_or(0.0, |loc| self.values[loc])
    }

    /// Set the weight for a feature id
    pub fn set(&mut self, fid: u32, value: f64) -> Result<()> {
        match self.location_of(fid) {
            Some(loc) => {
                self.values[loc] = value;
                Ok(())
            }
            None => Err(Error::InvalidParameter(format!(
                "feature id {} not present in weight vector",
                fid
            ))),
        }
    }

    /// Sparse dot product against an input item
    pub fn dot(&self, item: &[ObservedAttribute]) -> f64 {
        let mut sum = 0.0;
        for attr in item {
            if let Some(loc) = self.location_of(attr.id) {
                sum += self.values[loc] * attr.value;
            }
        }
        sum
    }

    /// Add `scale * value` for each attribute of an item.
    ///
    /// Increments to features this vector does not carry are dropped.
    pub fn add_scaled_features(&mut self, item: &[ObservedAttribute], scale: f64) {
        for attr in item {
            if let Some(loc) = self.location_of(attr.id) {
                self.values[loc] += attr.value * scale;
            }
        }
    }

    /// True if `other` stores exactly the same feature locations
    pub fn structure_matches(&self, other: &WeightVector) -> bool {
        self.indices == other.indices && self.values.len() == other.values.len()
    }

    /// Element-wise `self += scale * other` over matching structure
    pub fn plus_equals(&mut self, other: &WeightVector, scale: f64) {
        debug_assert!(self.structure_matches(other));
        for (v, o) in self.values.iter_mut().zip(other.values.iter()) {
            *v += o * scale;
        }
    }

    /// Sum of squared values
    pub fn two_norm_squared(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }

    fn zeroed_like(&self) -> Self {
        Self {
            indices: self.indices.clone(),
            values: vec![0.0; self.values.len()],
        }
    }
}

/// The full parameter bundle of a chain model: tied weight vectors, their
/// default-feature weights and frozen flags, and per-state initial/final
/// weights, with change stamps for cache invalidation.
///
/// Three structurally matching instances coexist during training: the live
/// parameters, the observed-label constraints accumulator, and the model
/// expectations accumulator.
#[derive(Debug, Clone)]
pub struct Factors {
    weights: Vec<WeightVector>,
    default_weights: Vec<f64>,
    frozen: Vec<bool>,
    initial: Vec<f64>,
    finals: Vec<f64>,
    structure_stamp: u64,
    value_stamp: u64,
}

impl Default for Factors {
    fn default() -> Self {
        Self::new()
    }
}

impl Factors {
    pub fn new() -> Self {
        Self {
            weights: Vec::new(),
            default_weights: Vec::new(),
            frozen: Vec::new(),
            initial: Vec::new(),
            finals: Vec::new(),
            structure_stamp: 0,
            value_stamp: 0,
        }
    }

    /// Current change stamps
    pub fn version(&self) -> Version {
        Version {
            structure: self.structure_stamp,
            value: self.value_stamp,
        }
    }

    fn structure_changed(&mut self) {
        self.structure_stamp += 1;
        self.value_stamp += 1;
    }

    fn value_changed(&mut self) {
        self.value_stamp += 1;
    }

    /// Append a weight group; returns its index
    pub fn add_weight_group(&mut self, vector: WeightVector) -> u32 {
        let index = self.weights.len() as u32;
        self.weights.push(vector);
        self.default_weights.push(0.0);
        self.frozen.push(false);
        self.structure_changed();
        index
    }

    /// Replace a group's vector wholesale (sparsification/densification)
    pub fn replace_weight_group(&mut self, group: u32, vector: WeightVector) -> Result<()> {
        let g = self.check_group(group)?;
        self.weights[g] = vector;
        self.structure_changed();
        Ok(())
    }

    pub fn num_weight_groups(&self) -> usize {
        self.weights.len()
    }

    fn check_group(&self, group: u32) -> Result<usize> {
        let g = group as usize;
        if g < self.weights.len() {
            Ok(g)
        } else {
            Err(Error::WeightGroupOutOfBounds {
                index: g,
                len: self.weights.len(),
            })
        }
    }

    pub fn weight(&self, group: u32) -> &WeightVector {
        &self.weights[group as usize]
    }

    pub fn weight_mut(&mut self, group: u32) -> &mut WeightVector {
        self.value_changed();
        &mut self.weights[group as usize]
    }

    pub fn default_weight(&self, group: u32) -> f64 {
        self.default_weights[group as usize]
    }

    pub fn set_default_weight(&mut self, group: u32, value: f64) -> Result<()> {
        let g = self.check_group(group)?;
        self.default_weights[g] = value;
        self.value_changed();
        Ok(())
    }

    /// Freeze or unfreeze a weight group. Frozen groups keep their values
    /// through training and report an exactly zero gradient.
    pub fn set_frozen(&mut self, group: u32, frozen: bool) -> Result<()> {
        let g = self.check_group(group)?;
        self.frozen[g] = frozen;
        self.value_changed();
        Ok(())
    }

    pub fn is_frozen(&self, group: u32) -> bool {
        self.frozen[group as usize]
    }

    /// Append a state slot with its initial/final weights; returns the
    /// state index
    pub fn add_state_slot(&mut self, initial: f64, final_: f64) -> usize {
        let index = self.initial.len();
        self.initial.push(initial);
        self.finals.push(final_);
        self.structure_changed();
        index
    }

    pub fn num_states(&self) -> usize {
        self.initial.len()
    }

    pub fn initial_weight(&self, state: usize) -> f64 {
        self.initial[state]
    }

    pub fn final_weight(&self, state: usize) -> f64 {
        self.finals[state]
    }

    pub fn set_initial_weight(&mut self, state: usize, weight: f64) {
        self.initial[state] = weight;
        self.value_changed();
    }

    pub fn set_final_weight(&mut self, state: usize, weight: f64) {
        self.finals[state] = weight;
        self.value_changed();
    }

    /// A structurally identical bundle with every value zeroed.
    ///
    /// This is how accumulators are born; a lattice that finds every path
    /// impossible reports nothing, leaving the accumulator a correct
    /// all-zero contribution.
    pub fn zeroed_like(&self) -> Factors {
        Factors {
            weights: self.weights.iter().map(WeightVector::zeroed_like).collect(),
            default_weights: vec![0.0; self.default_weights.len()],
            frozen: self.frozen.clone(),
            initial: vec![0.0; self.initial.len()],
            finals: vec![0.0; self.finals.len()],
            structure_stamp: 0,
            value_stamp: 0,
        }
    }

    /// Reset every value to zero, keeping the structure
    pub fn zero(&mut self) {
        for w in &mut self.weights {
            w.values.iter_mut().for_each(|v| *v = 0.0);
        }
        self.default_weights.iter_mut().for_each(|v| *v = 0.0);
        self.initial.iter_mut().for_each(|v| *v = 0.0);
        self.finals.iter_mut().for_each(|v| *v = 0.0);
        self.value_changed();
    }

    /// True if `other` has identical shape: same states, same groups, same
    /// vector structure
    pub fn structure_matches(&self, other: &Factors) -> bool {
        self.initial.len() == other.initial.len()
            && self.weights.len() == other.weights.len()
            && self
                .weights
                .iter()
                .zip(other.weights.iter())
                .all(|(a, b)| a.structure_matches(b))
    }

    /// Element-wise `self += scale * other`
    pub fn plus_equals(&mut self, other: &Factors, scale: f64) -> Result<()> {
        if !self.structure_matches(other) {
            return Err(Error::InvalidParameter(
                "factors structure mismatch in plus_equals".to_string(),
            ));
        }
        for (w, o) in self.weights.iter_mut().zip(other.weights.iter()) {
            w.plus_equals(o, scale);
        }
        for (d, o) in self.default_weights.iter_mut().zip(&other.default_weights) {
            *d += o * scale;
        }
        for (i, o) in self.initial.iter_mut().zip(&other.initial) {
            *i += o * scale;
        }
        for (f, o) in self.finals.iter_mut().zip(&other.finals) {
            *f += o * scale;
        }
        self.value_changed();
        Ok(())
    }

    /// Total length of the flat parameter vector:
    /// `[initial | final | defaults | weight vectors]`
    pub fn num_parameters(&self) -> usize {
        2 * self.initial.len()
            + self.default_weights.len()
            + self.weights.iter().map(WeightVector::num_locations).sum::<usize>()
    }

    /// The flat parameter vector as a fresh allocation
    pub fn parameters_vec(&self) -> Vec<f64> {
        let mut buf = vec![0.0; self.num_parameters()];
        self.pack(&mut buf);
        buf
    }

    /// Walk every stored value and panic on NaN; statistics and parameters
    /// must stay NaN-free at all times
    pub fn assert_finite(&self, what: &str) {
        for vector in &self.weights {
            assert_finite(&vector.values, what);
        }
        assert_finite(&self.default_weights, what);
        assert_finite(&self.initial, what);
        assert_finite(&self.finals, what);
    }

    /// Copy all parameters into a flat buffer
    pub fn parameters_into(&self, buf: &mut [f64]) -> Result<()> {
        let expected = self.num_parameters();
        if buf.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }
        self.pack(buf);
        Ok(())
    }

    fn pack(&self, buf: &mut [f64]) {
        let mut pos = 0;
        for &w in self.initial.iter().chain(&self.finals).chain(&self.default_weights) {
            buf[pos] = w;
            pos += 1;
        }
        for vector in &self.weights {
            buf[pos..pos + vector.values.len()].copy_from_slice(&vector.values);
            pos += vector.values.len();
        }
    }

    /// Overwrite all parameters from a flat buffer.
    ///
    /// # Panics
    ///
    /// Panics on NaN input; a NaN parameter is an internal-consistency
    /// violation, not a recoverable condition.
    pub fn set_parameters(&mut self, buf: &[f64]) -> Result<()> {
        let expected = self.num_parameters();
        if buf.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }
        assert_finite(buf, "parameters");
        let s = self.initial.len();
        let g = self.default_weights.len();
        self.initial.copy_from_slice(&buf[..s]);
        self.finals.copy_from_slice(&buf[s..2 * s]);
        self.default_weights.copy_from_slice(&buf[2 * s..2 * s + g]);
        let mut pos = 2 * s + g;
        for vector in &mut self.weights {
            let n = vector.values.len();
            vector.values.copy_from_slice(&buf[pos..pos + n]);
            pos += n;
        }
        self.value_changed();
        Ok(())
    }

    /// Zero the slots of frozen weight groups (vector locations and the
    /// default-weight slot) in a flat gradient buffer
    pub fn zero_frozen(&self, buf: &mut [f64]) {
        let s = self.initial.len();
        let mut pos = 2 * s + self.default_weights.len();
        for (g, vector) in self.weights.iter().enumerate() {
            if self.frozen[g] {
                buf[2 * s + g] = 0.0;
                buf[pos..pos + vector.values.len()].iter_mut().for_each(|v| *v = 0.0);
            }
            pos += vector.values.len();
        }
    }
}

/// Panics if the buffer contains NaN
pub(crate) fn assert_finite(buf: &[f64], what: &str) {
    for (i, v) in buf.iter().enumerate() {
        assert!(!v.is_nan(), "NaN in {} at index {}", what, i);
    }
}

/// The callback protocol by which lattices report marginal probabilities.
///
/// Both the sum-product and max-product lattices call back through this
/// interface as marginals are produced, decoupling how a marginal is
/// computed from what is done with it. Transition reports carry the time
/// step so implementations can reach the input features observed there.
pub trait Incrementor {
    fn increment_initial(&mut self, state: usize, weight: f64);
    fn increment_final(&mut self, state: usize, weight: f64);
    fn increment_transition(&mut self, arc: ArcId, position: usize, weight: f64);
}

/// An [`Incrementor`] accumulating into a [`Factors`] bundle.
///
/// Each transition increment fans out to every tied weight group the
/// transition uses: the group's vector receives the input features scaled
/// by the marginal, the group's default weight receives the marginal
/// itself. An optional scale pre-multiplies every report (per-instance
/// importance weighting); `skipping_frozen` suppresses accumulation into
/// frozen groups, as expectation gathering requires.
pub struct FactorsIncrementor<'a> {
    target: &'a mut Factors,
    transducer: &'a Transducer,
    instance: &'a Instance,
    scale: f64,
    skip_frozen: bool,
}

impl<'a> FactorsIncrementor<'a> {
    pub fn new(target: &'a mut Factors, transducer: &'a Transducer, instance: &'a Instance) -> Self {
        Self {
            target,
            transducer,
            instance,
            scale: 1.0,
            skip_frozen: false,
        }
    }

    /// Pre-multiply every report by `scale`
    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Skip weight groups flagged frozen
    pub fn skipping_frozen(mut self) -> Self {
        self.skip_frozen = true;
        self
    }
}

impl Incrementor for FactorsIncrementor<'_> {
    fn increment_initial(&mut self, state: usize, weight: f64) {
        self.target.initial[state] += weight * self.scale;
    }

    fn increment_final(&mut self, state: usize, weight: f64) {
        self.target.finals[state] += weight * self.scale;
    }

    fn increment_transition(&mut self, arc: ArcId, position: usize, weight: f64) {
        let transition = self.transducer.arc(arc);
        let item = &self.instance.items[position];
        let weight = weight * self.scale;
        for &group in transition.weight_groups() {
            if self.skip_frozen && self.target.frozen[group as usize] {
                continue;
            }
            self.target.weights[group as usize].add_scaled_features(item, weight);
            self.target.default_weights[group as usize] += weight;
        }
    }
}
