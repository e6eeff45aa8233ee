use std::collections::HashMap;

use crate::dataset::ObservedAttribute;
use crate::error::{Error, Result};

/// Global arc handle: a transition's position in the arena's arc order.
///
/// Arc ids are dense and stable once [`Transducer::finish`] has run; the
/// lattices use them to key per-time-step weight tables and to report
/// transition marginals back through the
/// [`Incrementor`](crate::Incrementor) protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArcId(pub u32);

/// A transition as specified at construction time.
///
/// The destination is given by name and resolved to a state index once,
/// when the transducer is finished.
#[derive(Debug, Clone)]
pub struct ArcSpec {
    /// Destination state name
    pub dest: String,
    /// Output label id emitted by this transition
    pub label: u32,
    /// Indices into the shared weight-vector table; several transitions may
    /// name the same group (weight tying)
    pub weight_groups: Vec<u32>,
}

impl ArcSpec {
    pub fn new<T: Into<String>>(dest: T, label: u32, weight_groups: Vec<u32>) -> Self {
        Self {
            dest: dest.into(),
            label,
            weight_groups,
        }
    }
}

/// A transition owned by its source state.
#[derive(Debug, Clone)]
pub struct Transition {
    dest_name: String,
    dest: u32,
    label: u32,
    weight_groups: Vec<u32>,
}

impl Transition {
    /// Destination state index. Valid after [`Transducer::finish`].
    pub fn destination(&self) -> usize {
        self.dest as usize
    }

    /// Destination state name as given at construction
    pub fn destination_name(&self) -> &str {
        &self.dest_name
    }

    /// Output label id
    pub fn label(&self) -> u32 {
        self.label
    }

    /// The tied weight groups this transition scores against
    pub fn weight_groups(&self) -> &[u32] {
        &self.weight_groups
    }
}

/// A state in the transducer arena.
///
/// States own their outgoing transitions; everything else refers to states
/// by index. Initial and final weights live in the parameter store
/// ([`Factors`](crate::Factors)), where they are trained alongside the
/// transition weights.
#[derive(Debug, Clone)]
pub struct State {
    index: u32,
    name: String,
    arcs: Vec<Transition>,
}

impl State {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outgoing transitions in construction order
    pub fn arcs(&self) -> &[Transition] {
        &self.arcs
    }
}

/// The state/transition arena of a weighted finite-state transducer.
///
/// States and transitions are append-only. Destination names are resolved
/// to indices by [`finish`](Self::finish); no inference may run before
/// that.
#[derive(Debug, Clone, Default)]
pub struct Transducer {
    states: Vec<State>,
    by_name: HashMap<String, u32>,
    /// Prefix sums over per-state arc counts, built by `finish`
    arc_offsets: Vec<u32>,
    num_arcs: u32,
    finished: bool,
}

impl Transducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a state with its outgoing transitions.
    ///
    /// Returns the new state's index. Duplicate names are rejected.
    pub fn add_state(&mut self, name: &str, arcs: Vec<ArcSpec>) -> Result<usize> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateState(name.to_string()));
        }
        let index = self.states.len() as u32;
        self.by_name.insert(name.to_string(), index);
        let arcs = arcs
            .into_iter()
            .map(|spec| Transition {
                dest_name: spec.dest,
                dest: u32::MAX,
                label: spec.label,
                weight_groups: spec.weight_groups,
            })
            .collect();
        self.states.push(State {
            index,
            name: name.to_string(),
            arcs,
        });
        self.finished = false;
        Ok(index as usize)
    }

    /// Resolve destination names to indices and build the global arc order.
    ///
    /// Fails on a transition whose destination names no state.
    pub fn finish(&mut self) -> Result<()> {
        let by_name = &self.by_name;
        for state in &mut self.states {
            for arc in &mut state.arcs {
                match by_name.get(&arc.dest_name) {
                    Some(&dest) => arc.dest = dest,
                    None => return Err(Error::UnknownState(arc.dest_name.clone())),
                }
            }
        }
        self.arc_offsets = Vec::with_capacity(self.states.len());
        let mut offset = 0u32;
        for state in &self.states {
            self.arc_offsets.push(offset);
            offset += state.arcs.len() as u32;
        }
        self.num_arcs = offset;
        self.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, index: usize) -> &State {
        &self.states[index]
    }

    pub fn state_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).map(|&i| i as usize)
    }

    /// Total number of transitions across all states
    pub fn num_arcs(&self) -> usize {
        self.num_arcs as usize
    }

    /// The global id of a state's `local`-th arc
    pub fn arc_id(&self, state: usize, local: usize) -> ArcId {
        debug_assert!(self.finished, "transducer not finished");
        ArcId(self.arc_offsets[state] + local as u32)
    }

    /// First global arc id of a state's arc block
    pub fn arc_offset(&self, state: usize) -> usize {
        self.arc_offsets[state] as usize
    }

    /// Resolve a global arc id to its transition
    pub fn arc(&self, id: ArcId) -> &Transition {
        let source = self.arc_source(id);
        let local = id.0 as usize - self.arc_offsets[source] as usize;
        &self.states[source].arcs[local]
    }

    /// The source state of a global arc id
    pub fn arc_source(&self, id: ArcId) -> usize {
        debug_assert!(self.finished, "transducer not finished");
        self.arc_offsets.partition_point(|&o| o <= id.0) - 1
    }
}

/// The contract all lattice algorithms consume.
///
/// An implementation supplies the structural arena plus the weighting of
/// initial states, final states, and scored transitions against an input
/// item. Scored weights are additive log-domain quantities; negative
/// infinity means impossible.
pub trait WeightedTransducer {
    /// The underlying state/transition arena
    fn transducer(&self) -> &Transducer;

    /// Weight of starting in `state`; `-inf` if not an initial state
    fn initial_weight(&self, state: usize) -> f64;

    /// Weight of ending in `state`; `-inf` if not a final state
    fn final_weight(&self, state: usize) -> f64;

    /// Score every arc out of `state` against the features of one input
    /// item, writing one weight per arc into `out` (resized to the arc
    /// count). With an `output` label constraint, arcs whose label does not
    /// match are scored `-inf` rather than omitted, so callers can treat
    /// the arc set as syntactically uniform.
    fn arc_weights(
        &self,
        state: usize,
        item: &[ObservedAttribute],
        output: Option<u32>,
        out: &mut Vec<f64>,
    );

    fn num_states(&self) -> usize {
        self.transducer().num_states()
    }

    fn state(&self, index: usize) -> &State {
        self.transducer().state(index)
    }

    /// States with initial weight above `-inf`
    fn initial_states(&self) -> Vec<usize> {
        (0..self.num_states())
            .filter(|&s| self.initial_weight(s) > f64::NEG_INFINITY)
            .collect()
    }

    /// Reserved for generative/epsilon extensions; chain models do not
    /// implement it.
    fn epsilon_arcs(&self, _state: usize) -> Result<&[Transition]> {
        Err(Error::Unsupported("epsilon transition iteration"))
    }
}
