/// An attribute id with its observed value
///
/// The id indexes the input feature space; instances are expected to arrive
/// with attributes already mapped through a closed vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct ObservedAttribute {
    /// Attribute id
    pub id: u32,
    /// Value of the attribute
    pub value: f64,
}

impl ObservedAttribute {
    pub fn new(id: u32, value: f64) -> Self {
        Self { id, value }
    }
}

/// The sparse feature vector observed at one sequence position
pub type Item = Vec<ObservedAttribute>;

/// One training or test sequence: an item per position, an optional target
/// label sequence, and an importance weight.
///
/// Instances are owned by the caller and borrowed by the lattices for the
/// duration of one inference call.
#[derive(Debug, Clone)]
pub struct Instance {
    /// The item sequence
    pub items: Vec<Item>,
    /// Target labels, present for training data
    pub labels: Option<Vec<u32>>,
    /// Importance weight applied to this instance's statistics
    pub weight: f64,
}

impl Instance {
    /// An unlabeled instance, for application-time decoding
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            labels: None,
            weight: 1.0,
        }
    }

    /// A labeled training instance
    pub fn labeled(items: Vec<Item>, labels: Vec<u32>) -> Self {
        Self {
            items,
            labels: Some(labels),
            weight: 1.0,
        }
    }

    /// Set the importance weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Sequence length in positions
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
