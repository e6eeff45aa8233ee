use super::batched::BatchedLabelLikelihood;
use super::lbfgs::{optimize, LbfgsParams};
use super::objective::Prior;
use crate::alphabet::Alphabet;
use crate::attribute::Attribute;
use crate::crf::{Connectivity, Crf, ModelKind, WeightTying};
use crate::dataset::{Instance, Item, ObservedAttribute};
use crate::error::{Error, Result};
use crate::lattice::NBestPath;

/// High-level trainer for chain models.
///
/// Accepts string-typed attribute/label sequences, interns them through
/// internal alphabets, builds the state machine from the training labels,
/// and fits the parameters with batched L-BFGS over the label-likelihood
/// objective.
#[derive(Debug)]
pub struct Trainer {
    /// Training instances
    instances: Vec<Instance>,
    /// Attribute alphabet
    attrs: Alphabet,
    /// Label alphabet
    labels: Alphabet,
    kind: ModelKind,
    connectivity: Connectivity,
    tying: WeightTying,
    forbidden: Vec<String>,
    prior: Prior,
    num_batches: usize,
    params: LbfgsParams,
    /// Enable progress output
    verbose: bool,
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Trainer {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            attrs: Alphabet::new(),
            labels: Alphabet::new(),
            kind: ModelKind::GloballyNormalized,
            connectivity: Connectivity::AsInData,
            tying: WeightTying::PerArc,
            forbidden: Vec::new(),
            prior: Prior::Gaussian { variance: 10.0 },
            num_batches: 1,
            params: LbfgsParams::default(),
            verbose: false,
        }
    }

    /// Enable or disable progress output
    pub fn verbose(&mut self, enabled: bool) -> &mut Self {
        self.verbose = enabled;
        self
    }

    /// Get optimizer parameters
    pub fn params(&self) -> &LbfgsParams {
        &self.params
    }

    /// Get optimizer parameters for mutation
    pub fn params_mut(&mut self) -> &mut LbfgsParams {
        &mut self.params
    }

    /// Use a zero-mean Gaussian prior with the given variance
    pub fn with_gaussian_prior(&mut self, variance: f64) -> Result<&mut Self> {
        if variance <= 0.0 {
            return Err(Error::InvalidParameter(
                "prior variance must be positive".to_string(),
            ));
        }
        self.prior = Prior::Gaussian { variance };
        Ok(self)
    }

    /// Use a smooth hyperbolic approximation to an L1 prior
    pub fn with_hyperbolic_prior(&mut self, slope: f64, sharpness: f64) -> Result<&mut Self> {
        if slope <= 0.0 || sharpness <= 0.0 {
            return Err(Error::InvalidParameter(
                "hyperbolic prior slope and sharpness must be positive".to_string(),
            ));
        }
        self.prior = Prior::Hyperbolic { slope, sharpness };
        Ok(self)
    }

    /// Train without regularization
    pub fn with_flat_prior(&mut self) -> &mut Self {
        self.prior = Prior::Flat;
        self
    }

    /// Number of parallel batches for value/gradient computation
    pub fn with_num_batches(&mut self, num_batches: usize) -> Result<&mut Self> {
        if num_batches == 0 {
            return Err(Error::InvalidParameter(
                "num_batches must be at least 1".to_string(),
            ));
        }
        self.num_batches = num_batches;
        Ok(self)
    }

    pub fn with_model_kind(&mut self, kind: ModelKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub fn with_connectivity(&mut self, connectivity: Connectivity) -> &mut Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_weight_tying(&mut self, tying: WeightTying) -> &mut Self {
        self.tying = tying;
        self
    }

    /// Forbid label transitions matching `"FROM->TO"` patterns
    pub fn with_forbidden_transitions(&mut self, patterns: &[&str]) -> &mut Self {
        self.forbidden = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Append training data
    pub fn append<I, L>(&mut self, xseq: &[I], yseq: &[L]) -> Result<()>
    where
        I: AsRef<[Attribute]>,
        L: AsRef<str>,
    {
        self.append_with_weight(xseq, yseq, 1.0)
    }

    /// Append weighted training data
    pub fn append_with_weight<I, L>(&mut self, xseq: &[I], yseq: &[L], weight: f64) -> Result<()>
    where
        I: AsRef<[Attribute]>,
        L: AsRef<str>,
    {
        if xseq.len() != yseq.len() {
            return Err(Error::LengthMismatch {
                expected: xseq.len(),
                actual: yseq.len(),
            });
        }
        if xseq.is_empty() {
            return Err(Error::InvalidParameter(
                "empty sequences are not allowed".to_string(),
            ));
        }

        let mut items = Vec::with_capacity(xseq.len());
        let mut labels = Vec::with_capacity(yseq.len());
        for (item, label) in xseq.iter().zip(yseq.iter()) {
            let item: Item = item
                .as_ref()
                .iter()
                .map(|attr| ObservedAttribute::new(self.attrs.intern(&attr.name), attr.value))
                .collect();
            items.push(item);
            labels.push(self.labels.intern(label.as_ref()));
        }
        self.instances
            .push(Instance::labeled(items, labels).with_weight(weight));
        Ok(())
    }

    /// Clear all training data
    pub fn clear(&mut self) {
        self.instances.clear();
        self.attrs.clear();
        self.labels.clear();
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn num_attributes(&self) -> usize {
        self.attrs.len()
    }

    /// Build the model and fit its parameters; returns the trained tagger
    pub fn train(&mut self) -> Result<Tagger> {
        if self.instances.is_empty() {
            return Err(Error::InvalidParameter("no training data".to_string()));
        }

        if self.verbose {
            println!("Building state machine...");
        }
        let mut crf = Crf::new(self.attrs.len(), self.kind);
        let forbidden: Vec<&str> = self.forbidden.iter().map(String::as_str).collect();
        crf.add_states_for_labels(
            &self.labels,
            &self.instances,
            self.connectivity,
            self.tying,
            &forbidden,
        )?;

        if self.verbose {
            println!("Number of labels: {}", self.labels.len());
            println!("Number of attributes: {}", self.attrs.len());
            println!(
                "Number of parameters: {}",
                crf.factors().num_parameters()
            );
        }

        let converged = {
            let mut objective = BatchedLabelLikelihood::new(
                &mut crf,
                &self.instances,
                self.prior,
                self.num_batches,
            )?;
            optimize(&mut objective, &self.params, self.verbose)?
        };

        if self.verbose {
            println!("Training completed.");
        }

        Ok(Tagger {
            crf,
            attrs: self.attrs.clone(),
            labels: self.labels.clone(),
            converged,
        })
    }
}

/// A trained chain model with its alphabets, ready to tag.
#[derive(Debug, Clone)]
pub struct Tagger {
    crf: Crf,
    attrs: Alphabet,
    labels: Alphabet,
    /// Whether the optimizer signaled convergence
    pub converged: bool,
}

impl Tagger {
    /// The underlying model
    pub fn crf(&self) -> &Crf {
        &self.crf
    }

    pub fn label_alphabet(&self) -> &Alphabet {
        &self.labels
    }

    pub fn attribute_alphabet(&self) -> &Alphabet {
        &self.attrs
    }

    fn instance_of<I: AsRef<[Attribute]>>(&self, xseq: &[I]) -> Instance {
        let items = xseq
            .iter()
            .map(|item| {
                // attributes unseen in training carry no weight and are dropped
                item.as_ref()
                    .iter()
                    .filter_map(|attr| {
                        self.attrs
                            .lookup(&attr.name)
                            .map(|id| ObservedAttribute::new(id, attr.value))
                    })
                    .collect()
            })
            .collect();
        Instance::new(items)
    }

    fn label_name(&self, id: u32) -> Result<&str> {
        self.labels
            .entry(id)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown label id {}", id)))
    }

    /// Predict the label sequence for an item sequence
    pub fn tag<I: AsRef<[Attribute]>>(&self, xseq: &[I]) -> Result<Vec<&str>> {
        if xseq.is_empty() {
            return Ok(Vec::new());
        }
        let instance = self.instance_of(xseq);
        let ids = self.crf.transduce(&instance);
        ids.into_iter().map(|id| self.label_name(id)).collect()
    }

    /// The `n` best label sequences with their path weights
    pub fn tag_n_best<I: AsRef<[Attribute]>>(
        &self,
        xseq: &[I],
        n: usize,
    ) -> Result<Vec<(Vec<&str>, f64)>> {
        if xseq.is_empty() {
            return Ok(Vec::new());
        }
        let instance = self.instance_of(xseq);
        self.crf
            .n_best(&instance, n)
            .into_iter()
            .map(|NBestPath { labels, weight }| {
                let named: Result<Vec<&str>> =
                    labels.into_iter().map(|id| self.label_name(id)).collect();
                Ok((named?, weight))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_validation() {
        let mut trainer = Trainer::new();

        let xseq = vec![vec![Attribute::new("walk", 1.0)]];
        let yseq = vec!["sunny", "rainy"];
        assert!(matches!(
            trainer.append(&xseq, &yseq),
            Err(Error::LengthMismatch { .. })
        ));

        let empty_x: Vec<Vec<Attribute>> = vec![];
        let empty_y: Vec<&str> = vec![];
        assert!(matches!(
            trainer.append(&empty_x, &empty_y),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_append_interns_alphabets() {
        let mut trainer = Trainer::new();
        let xseq = vec![
            vec![Attribute::new("walk", 1.0), Attribute::new("shop", 0.5)],
            vec![Attribute::new("walk", 1.0)],
        ];
        let yseq = vec!["sunny", "sunny"];
        trainer.append(&xseq, &yseq).unwrap();

        assert_eq!(trainer.num_instances(), 1);
        assert_eq!(trainer.num_attributes(), 2);
        assert_eq!(trainer.num_labels(), 1);
    }

    #[test]
    fn test_config_validation() {
        let mut trainer = Trainer::new();
        assert!(trainer.with_gaussian_prior(0.0).is_err());
        assert!(trainer.with_gaussian_prior(1.0).is_ok());
        assert!(trainer.with_hyperbolic_prior(-1.0, 1.0).is_err());
        assert!(trainer.with_num_batches(0).is_err());
        assert!(trainer.with_num_batches(4).is_ok());
    }

    #[test]
    fn test_train_requires_data() {
        let mut trainer = Trainer::new();
        assert!(matches!(
            trainer.train(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
