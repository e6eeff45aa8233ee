use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An implicit graph explored by [`AStar`].
///
/// Expansion may mutate the graph (weight caches and the like); nodes are
/// small copyable handles.
pub trait SearchGraph {
    type Node: Copy;

    /// True when a path ending at this node is a complete answer
    fn is_goal(&self, node: &Self::Node) -> bool;

    /// Admissible lower bound on the remaining cost from this node.
    ///
    /// Must be exact at goal nodes: a popped goal's reported cost is its
    /// path cost plus this estimate, so the estimate carries any terminal
    /// cost the edges do not.
    fn completion_estimate(&self, node: &Self::Node) -> f64;

    /// Append `(successor, edge cost)` pairs
    fn expand(&mut self, node: &Self::Node, out: &mut Vec<(Self::Node, f64)>);
}

struct ArenaEntry<N> {
    node: N,
    parent: Option<usize>,
    cost: f64,
}

struct HeapEntry {
    priority: f64,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.index == other.index
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we pop the cheapest entry
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Best-first search over an implicit graph, yielding answers in
/// nondecreasing total cost.
///
/// There is no closed set: a node may be expanded once per distinct path
/// reaching it, which is what makes repeated calls to
/// [`next_answer`](Self::next_answer) enumerate the k best paths.
pub struct AStar<G: SearchGraph> {
    graph: G,
    arena: Vec<ArenaEntry<G::Node>>,
    queue: BinaryHeap<HeapEntry>,
    scratch: Vec<(G::Node, f64)>,
}

impl<G: SearchGraph> AStar<G> {
    /// Seed the search with start nodes and their start costs
    pub fn new(graph: G, starts: Vec<(G::Node, f64)>) -> Self {
        let mut search = Self {
            graph,
            arena: Vec::new(),
            queue: BinaryHeap::new(),
            scratch: Vec::new(),
        };
        for (node, cost) in starts {
            if cost == f64::INFINITY {
                continue;
            }
            let priority = cost + search.graph.completion_estimate(&node);
            if priority == f64::INFINITY {
                continue;
            }
            search.arena.push(ArenaEntry {
                node,
                parent: None,
                cost,
            });
            search.queue.push(HeapEntry {
                priority,
                index: search.arena.len() - 1,
            });
        }
        search
    }

    /// The next-cheapest complete path, as `(start..goal node sequence,
    /// total cost)`, or `None` when the graph is exhausted
    pub fn next_answer(&mut self) -> Option<(Vec<G::Node>, f64)> {
        while let Some(entry) = self.queue.pop() {
            let index = entry.index;
            let node = self.arena[index].node;
            if self.graph.is_goal(&node) {
                let mut path = Vec::new();
                let mut at = Some(index);
                while let Some(i) = at {
                    path.push(self.arena[i].node);
                    at = self.arena[i].parent;
                }
                path.reverse();
                return Some((path, entry.priority));
            }
            let cost = self.arena[index].cost;
            let mut successors = std::mem::take(&mut self.scratch);
            self.graph.expand(&node, &mut successors);
            for (succ, edge_cost) in successors.drain(..) {
                let succ_cost = cost + edge_cost;
                let priority = succ_cost + self.graph.completion_estimate(&succ);
                if priority == f64::INFINITY {
                    continue;
                }
                self.arena.push(ArenaEntry {
                    node: succ,
                    parent: Some(index),
                    cost: succ_cost,
                });
                self.queue.push(HeapEntry {
                    priority,
                    index: self.arena.len() - 1,
                });
            }
            self.scratch = successors;
        }
        None
    }
}
