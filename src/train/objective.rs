use log::warn;

use crate::crf::Crf;
use crate::dataset::Instance;
use crate::error::{Error, Result};
use crate::factors::{assert_finite, Factors, FactorsIncrementor, Version};
use crate::lattice::SumLattice;
use crate::transducer::WeightedTransducer;

/// The contract an external gradient-based optimizer drives.
///
/// The optimizer is expected to cycle through set-parameters /
/// get-value / get-gradient and perform its own line search and
/// convergence test; implementations cache against the parameter store's
/// change stamps so repeated reads between parameter changes are free.
pub trait Objective {
    fn num_parameters(&self) -> usize;
    fn parameters(&self, buf: &mut [f64]) -> Result<()>;
    fn set_parameters(&mut self, buf: &[f64]) -> Result<()>;
    /// Objective value at the current parameters (to be maximized)
    fn value(&mut self) -> f64;
    /// Gradient at the current parameters, written into `buf`
    fn value_gradient(&mut self, buf: &mut [f64]) -> Result<()>;
}

/// Closed-form log-prior over the parameters.
///
/// Non-finite parameters (impossible initial/final weights) are excluded
/// from both the value and the gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    /// No regularization
    Flat,
    /// Zero-mean Gaussian with the given variance
    Gaussian { variance: f64 },
    /// Smooth hyperbolic approximation to an L1 prior
    Hyperbolic { slope: f64, sharpness: f64 },
}

impl Prior {
    /// Log-prior contribution to the objective value
    pub fn log_prior(&self, params: &[f64]) -> f64 {
        match *self {
            Prior::Flat => 0.0,
            Prior::Gaussian { variance } => {
                let mut sum = 0.0;
                for &p in params {
                    if p.is_finite() {
                        sum += p * p;
                    }
                }
                -sum / (2.0 * variance)
            }
            Prior::Hyperbolic { slope, sharpness } => {
                let mut sum = 0.0;
                for &p in params {
                    if p.is_finite() {
                        sum += (sharpness * p).cosh().ln();
                    }
                }
                -(slope / sharpness) * sum
            }
        }
    }

    /// Add the log-prior gradient to `grad`
    pub fn add_gradient(&self, params: &[f64], grad: &mut [f64]) {
        match *self {
            Prior::Flat => {}
            Prior::Gaussian { variance } => {
                for (g, &p) in grad.iter_mut().zip(params) {
                    if p.is_finite() {
                        *g -= p / variance;
                    }
                }
            }
            Prior::Hyperbolic { slope, sharpness } => {
                for (g, &p) in grad.iter_mut().zip(params) {
                    if p.is_finite() {
                        *g -= slope * (sharpness * p).tanh();
                    }
                }
            }
        }
    }
}

/// Gather observed-label sufficient statistics for every instance.
///
/// Labels are fixed across training, so this runs once: each instance's
/// lattice is constrained to its true output sequence and its marginals
/// accumulate into `constraints`, scaled by the instance weight.
pub(crate) fn gather_constraints(
    crf: &Crf,
    instances: &[Instance],
    constraints: &mut Factors,
) -> Result<()> {
    for inst in instances {
        let labels = inst.labels.as_deref().ok_or_else(|| {
            Error::InvalidParameter("unlabeled instance in training set".to_string())
        })?;
        if labels.len() != inst.len() {
            return Err(Error::LengthMismatch {
                expected: inst.len(),
                actual: labels.len(),
            });
        }
        let mut inc =
            FactorsIncrementor::new(constraints, crf.transducer(), inst).scaled(inst.weight);
        SumLattice::new(crf, inst, Some(labels), Some(&mut inc));
    }
    Ok(())
}

/// One instance's log-likelihood contribution, accumulating model
/// expectations on the side.
///
/// An instance with an infinite labeled or unlabeled weight contributes
/// zero and is logged; its infinite status may not flip between calls
/// with unchanged data, and a flip is a fatal internal-consistency error.
pub(crate) fn instance_contribution(
    crf: &Crf,
    index: usize,
    inst: &Instance,
    expectations: &mut Factors,
    status: &mut Option<bool>,
    skipped: &mut usize,
) -> f64 {
    let labels = inst
        .labels
        .as_deref()
        .expect("training instances are validated as labeled");

    let labeled = SumLattice::new(crf, inst, Some(labels), None).total_weight();
    let mut unlabeled = f64::NEG_INFINITY;
    if labeled != f64::NEG_INFINITY {
        let mut inc = FactorsIncrementor::new(expectations, crf.transducer(), inst)
            .scaled(inst.weight)
            .skipping_frozen();
        unlabeled = SumLattice::new(crf, inst, None, Some(&mut inc)).total_weight();
    }

    let infinite = labeled == f64::NEG_INFINITY || unlabeled == f64::NEG_INFINITY;
    if let Some(was_infinite) = *status {
        assert!(
            was_infinite == infinite,
            "instance {} changed infinite status between evaluations",
            index
        );
    }
    *status = Some(infinite);

    if infinite {
        warn!(
            "instance {} has an impossible label sequence (labeled weight {}, unlabeled weight {}); contributing zero",
            index, labeled, unlabeled
        );
        *skipped += 1;
        return 0.0;
    }
    inst.weight * (labeled - unlabeled)
}

/// Label log-likelihood of a training set under a chain model, with its
/// gradient: `constraints - expectations + prior gradient`.
///
/// Constraints are gathered once at construction; expectations are
/// recomputed whenever the parameter value stamp moves. Frozen weight
/// groups report an exactly zero gradient.
pub struct LabelLikelihood<'a> {
    crf: &'a mut Crf,
    instances: &'a [Instance],
    prior: Prior,
    constraints: Factors,
    expectations: Factors,
    cached_value: f64,
    value_version: Option<Version>,
    cached_gradient: Vec<f64>,
    gradient_version: Option<Version>,
    infinite: Vec<Option<bool>>,
    skipped: usize,
}

impl<'a> LabelLikelihood<'a> {
    pub fn new(crf: &'a mut Crf, instances: &'a [Instance], prior: Prior) -> Result<Self> {
        let mut constraints = crf.factors().zeroed_like();
        gather_constraints(crf, instances, &mut constraints)?;
        constraints.assert_finite("constraints");
        let expectations = crf.factors().zeroed_like();
        let num_parameters = crf.factors().num_parameters();
        Ok(Self {
            crf,
            instances,
            prior,
            constraints,
            expectations,
            cached_value: 0.0,
            value_version: None,
            cached_gradient: vec![0.0; num_parameters],
            gradient_version: None,
            infinite: vec![None; instances.len()],
            skipped: 0,
        })
    }

    /// Number of instances skipped for infinite weight so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Recompute value and expectations if the parameters moved
    fn refresh(&mut self) {
        let version = self.crf.factors().version();
        if self.value_version == Some(version) {
            return;
        }
        self.expectations.zero();
        let crf: &Crf = self.crf;
        let mut value = 0.0;
        for (i, inst) in self.instances.iter().enumerate() {
            value += instance_contribution(
                crf,
                i,
                inst,
                &mut self.expectations,
                &mut self.infinite[i],
                &mut self.skipped,
            );
        }
        self.expectations.assert_finite("expectations");
        value += self.prior.log_prior(&self.crf.factors().parameters_vec());
        self.cached_value = value;
        self.value_version = Some(version);
    }
}

impl Objective for LabelLikelihood<'_> {
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
        self.refresh();
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
        self.refresh();
        let version = self.crf.factors().version();
        if self.gradient_version != Some(version) {
            let constraints = self.constraints.parameters_vec();
            let expectations = self.expectations.parameters_vec();
            for (g, (c, e)) in self
                .cached_gradient
                .iter_mut()
                .zip(constraints.iter().zip(&expectations))
            {
                *g = c - e;
            }
            let params = self.crf.factors().parameters_vec();
            self.prior.add_gradient(&params, &mut self.cached_gradient);
            self.crf.factors().zero_frozen(&mut self.cached_gradient);
            assert_finite(&self.cached_gradient, "gradient");
            self.gradient_version = Some(version);
        }
        buf.copy_from_slice(&self.cached_gradient);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_prior_closed_form() {
        let prior = Prior::Gaussian { variance: 2.0 };
        let params = vec![1.0, -2.0, f64::NEG_INFINITY];
        // -(1 + 4) / (2 * 2)
        assert!((prior.log_prior(&params) + 1.25).abs() < 1e-12);

        let mut grad = vec![0.0; 3];
        prior.add_gradient(&params, &mut grad);
        assert!((grad[0] + 0.5).abs() < 1e-12);
        assert!((grad[1] - 1.0).abs() < 1e-12);
        assert_eq!(grad[2], 0.0);
    }

    #[test]
    fn test_hyperbolic_prior_gradient_bounded() {
        let prior = Prior::Hyperbolic {
            slope: 0.5,
            sharpness: 3.0,
        };
        let params = vec![10.0, -10.0, 0.0];
        let mut grad = vec![0.0; 3];
        prior.add_gradient(&params, &mut grad);
        // tanh saturates: the L1-like gradient approaches +/- slope
        assert!((grad[0] + 0.5).abs() < 1e-6);
        assert!((grad[1] - 0.5).abs() < 1e-6);
        assert_eq!(grad[2], 0.0);
    }

    #[test]
    fn test_flat_prior_is_zero() {
        let params = vec![3.0, -4.0];
        assert_eq!(Prior::Flat.log_prior(&params), 0.0);
        let mut grad = vec![1.0, 1.0];
        Prior::Flat.add_gradient(&params, &mut grad);
        assert_eq!(grad, vec![1.0, 1.0]);
    }
}
