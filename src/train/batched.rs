use log::debug;
use rayon::prelude::*;

use super::objective::{gather_constraints, instance_contribution, Objective, Prior};
use crate::crf::Crf;
use crate::dataset::Instance;
use crate::error::{Error, Result};
use crate::factors::{assert_finite, Factors, Version};

/// Decides whether cached value/gradient must be recomputed for the
/// current parameter version.
///
/// This is the single synchronization point between the optimizer's
/// sequential iteration loop and the parallel batch workers: a query that
/// returns `false` means the caches computed for this version are still
/// valid and no parallel phase runs.
pub trait CacheStaleIndicator: Send {
    fn value_stale(&mut self, version: Version) -> bool;
    fn gradient_stale(&mut self, version: Version) -> bool;
}

/// Staleness by version equality: stale exactly when the parameter store's
/// stamps differ from those the cache was computed at.
#[derive(Debug, Default)]
pub struct VersionStaleIndicator {
    value: Option<Version>,
    gradient: Option<Version>,
}

impl CacheStaleIndicator for VersionStaleIndicator {
    fn value_stale(&mut self, version: Version) -> bool {
        if self.value == Some(version) {
            false
        } else {
            self.value = Some(version);
            true
        }
    }

    fn gradient_stale(&mut self, version: Version) -> bool {
        if self.gradient == Some(version) {
            false
        } else {
            self.gradient = Some(version);
            true
        }
    }
}

/// The label-likelihood objective computed over parallel batches.
///
/// The training set is split into contiguous batches once; each batch owns
/// its expectations buffer and its slice of the per-instance status array,
/// so the parallel phase shares nothing mutable. Worker tasks run in a
/// rayon scope whose lifetime is the recomputation call; the only shared
/// state is the read-only parameter vector, immutable for the duration of
/// one phase. The prior term is folded into the last batch's value so the
/// combination never double-counts it.
pub struct BatchedLabelLikelihood<'a> {
    crf: &'a mut Crf,
    instances: &'a [Instance],
    prior: Prior,
    batch_size: usize,
    constraints: Factors,
    batch_expectations: Vec<Factors>,
    batch_values: Vec<f64>,
    infinite: Vec<Option<bool>>,
    skipped: usize,
    stale: Box<dyn CacheStaleIndicator>,
    cached_value: f64,
    cached_gradient: Vec<f64>,
}

impl<'a> std::fmt::Debug for BatchedLabelLikelihood<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedLabelLikelihood")
            .field("prior", &self.prior)
            .field("batch_size", &self.batch_size)
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}

impl<'a> BatchedLabelLikelihood<'a> {
    pub fn new(
        crf: &'a mut Crf,
        instances: &'a [Instance],
        prior: Prior,
        num_batches: usize,
    ) -> Result<Self> {
        Self::with_stale_indicator(
            crf,
            instances,
            prior,
            num_batches,
            Box::<VersionStaleIndicator>::default(),
        )
    }

    pub fn with_stale_indicator(
        crf: &'a mut Crf,
        instances: &'a [Instance],
        prior: Prior,
        num_batches: usize,
        stale: Box<dyn CacheStaleIndicator>,
    ) -> Result<Self> {
        if num_batches == 0 {
            return Err(Error::InvalidParameter(
                "num_batches must be at least 1".to_string(),
            ));
        }
        if instances.is_empty() {
            return Err(Error::InvalidParameter("no training data".to_string()));
        }
        let mut constraints = crf.factors().zeroed_like();
        gather_constraints(crf, instances, &mut constraints)?;
        constraints.assert_finite("constraints");

        let num_batches = num_batches.min(instances.len());
        let batch_size = instances.len().div_ceil(num_batches);
        let actual_batches = instances.len().div_ceil(batch_size);
        debug!(
            "batched objective: {} instances in {} batches of up to {}",
            instances.len(),
            actual_batches,
            batch_size
        );
        let batch_expectations = (0..actual_batches)
            .map(|_| crf.factors().zeroed_like())
            .collect();
        let num_parameters = crf.factors().num_parameters();
        Ok(Self {
            crf,
            instances,
            prior,
            batch_size,
            constraints,
            batch_expectations,
            batch_values: vec![0.0; actual_batches],
            infinite: vec![None; instances.len()],
            skipped: 0,
            stale,
            cached_value: 0.0,
            cached_gradient: vec![0.0; num_parameters],
        })
    }

    /// Number of instances skipped for infinite weight so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Parallel phase: every batch recomputes its value and expectations
    fn recompute(&mut self) {
        let crf: &Crf = self.crf;
        let batch_size = self.batch_size;
        let offsets: Vec<usize> = (0..self.batch_values.len()).map(|b| b * batch_size).collect();

        let results: Vec<(f64, usize)> = self
            .instances
            .par_chunks(batch_size)
            .zip(self.batch_expectations.par_iter_mut())
            .zip(self.infinite.par_chunks_mut(batch_size))
            .zip(offsets.par_iter())
            .map(|(((chunk, expectations), status), &offset)| {
                expectations.zero();
                let mut value = 0.0;
                let mut skipped = 0;
                for (i, (inst, st)) in chunk.iter().zip(status.iter_mut()).enumerate() {
                    value += instance_contribution(
                        crf,
                        offset + i,
                        inst,
                        expectations,
                        st,
                        &mut skipped,
                    );
                }
                expectations.assert_finite("expectations");
                (value, skipped)
            })
            .collect();

        self.skipped = 0;
        for (b, (value, skipped)) in results.into_iter().enumerate() {
            self.batch_values[b] = value;
            self.skipped += skipped;
        }
        // The prior belongs to exactly one batch; by convention the last.
        let prior = self.prior.log_prior(&self.crf.factors().parameters_vec());
        if let Some(last) = self.batch_values.last_mut() {
            *last += prior;
        }
        self.cached_value = self.batch_values.iter().sum();
    }

    fn refresh_value(&mut self) {
        let version = self.crf.factors().version();
        if self.stale.value_stale(version) {
            self.recompute();
        }
    }
}

impl Objective for BatchedLabelLikelihood<'_> {
    fn num_parameters(&self) -> usize {
        self.crf.factors().num_parameters()
    }

    fn parameters(&self, buf: &mut [f64]) -> Result<()> {
        self.crf.factors().parameters_into(buf)
    }

    fn set_parameters(&mut self, buf: &[f64]) -> Result<()> {
        self.crf.factors_mut().set_parameters(buf)
    }

    fn value(&mut self) -> f64 {
        self.refresh_value();
        self.cached_value
    }

    fn value_gradient(&mut self, buf: &mut [f64]) -> Result<()> {
        let n = self.num_parameters();
        if buf.len() != n {
            return Err(Error::LengthMismatch {
                expected: n,
                actual: buf.len(),
            });
        }
        self.refresh_value();
        let version = self.crf.factors().version();
        if self.stale.gradient_stale(version) {
            self.cached_gradient.copy_from_slice(&self.constraints.parameters_vec());
            for expectations in &self.batch_expectations {
                for (g, e) in self
                    .cached_gradient
                    .iter_mut()
                    .zip(expectations.parameters_vec())
                {
                    *g -= e;
                }
            }
            let params = self.crf.factors().parameters_vec();
            self.prior.add_gradient(&params, &mut self.cached_gradient);
            self.crf.factors().zero_frozen(&mut self.cached_gradient);
            assert_finite(&self.cached_gradient, "gradient");
        }
        buf.copy_from_slice(&self.cached_gradient);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use crate::crf::{Connectivity, ModelKind, WeightTying};
    use crate::dataset::ObservedAttribute;
    use crate::train::objective::LabelLikelihood;

    fn toy_setup() -> (Crf, Vec<Instance>) {
        let mut labels = Alphabet::new();
        labels.intern("B");
        labels.intern("O");
        let instances = vec![
            Instance::labeled(
                vec![
                    vec![ObservedAttribute::new(0, 1.0)],
                    vec![ObservedAttribute::new(1, 1.0)],
                    vec![ObservedAttribute::new(0, 1.0)],
                ],
                vec![0, 1, 0],
            ),
            Instance::labeled(
                vec![
                    vec![ObservedAttribute::new(1, 1.0)],
                    vec![ObservedAttribute::new(1, 1.0)],
                ],
                vec![1, 1],
            ),
            Instance::labeled(
                vec![vec![ObservedAttribute::new(0, 1.0)]],
                vec![0],
            ),
        ];
        let mut crf = Crf::new(2, ModelKind::GloballyNormalized);
        crf.add_states_for_labels(
            &labels,
            &instances,
            Connectivity::FullyConnected,
            WeightTying::PerArc,
            &[],
        )
        .unwrap();
        (crf, instances)
    }

    #[test]
    fn test_batched_matches_single_objective() {
        let (mut crf, instances) = toy_setup();
        let prior = Prior::Gaussian { variance: 5.0 };

        let params: Vec<f64> = (0..crf.factors().num_parameters())
            .map(|i| ((i % 7) as f64 - 3.0) * 0.1)
            .collect();

        let mut crf2 = crf.clone();
        let (value, gradient) = {
            let mut single = LabelLikelihood::new(&mut crf2, &instances, prior).unwrap();
            single.set_parameters(&params).unwrap();
            let v = single.value();
            let mut g = vec![0.0; single.num_parameters()];
            single.value_gradient(&mut g).unwrap();
            (v, g)
        };

        let mut batched = BatchedLabelLikelihood::new(&mut crf, &instances, prior, 2).unwrap();
        batched.set_parameters(&params).unwrap();
        assert!((batched.value() - value).abs() < 1e-9);
        let mut g = vec![0.0; batched.num_parameters()];
        batched.value_gradient(&mut g).unwrap();
        for (a, b) in g.iter().zip(&gradient) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_version_staleness() {
        let mut indicator = VersionStaleIndicator::default();
        let v1 = Version {
            structure: 1,
            value: 4,
        };
        assert!(indicator.value_stale(v1));
        assert!(!indicator.value_stale(v1));
        let v2 = Version {
            structure: 1,
            value: 5,
        };
        assert!(indicator.value_stale(v2));
        assert!(indicator.gradient_stale(v2));
        assert!(!indicator.gradient_stale(v2));
    }

    #[test]
    fn test_cached_between_parameter_changes() {
        let (mut crf, instances) = toy_setup();
        let mut objective =
            BatchedLabelLikelihood::new(&mut crf, &instances, Prior::Flat, 2).unwrap();

        let v1 = objective.value();
        let v2 = objective.value();
        assert_eq!(v1, v2);
        let mut g = vec![0.0; objective.num_parameters()];
        objective.value_gradient(&mut g).unwrap();

        let params: Vec<f64> = vec![0.1; objective.num_parameters()];
        objective.set_parameters(&params).unwrap();
        let v3 = objective.value();
        assert_ne!(v1, v3);
    }

    #[test]
    fn test_rejects_empty_training_set() {
        let (mut crf, _) = toy_setup();
        let err = BatchedLabelLikelihood::new(&mut crf, &[], Prior::Flat, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
}
