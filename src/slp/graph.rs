use crate::ir::ValueId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub type SuperwordId = usize;
pub type NodeId = usize;

/// An ordered tuple of lane values chosen to become one vector instruction.
///
/// Lane contents may only be rewritten while the graph is under
/// construction (operand reordering) or when the conversion manager swaps a
/// lane for its extracted twin; consumers built afterwards observe a fixed
/// tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Superword {
    lanes: SmallVec<[ValueId; 4]>,
    operands: SmallVec<[SuperwordId; 2]>,
    node: NodeId,
    /// How many superwords consume this one as an operand. More than one
    /// consumer freezes the lane tuple.
    uses: usize,
}

impl Superword {
    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn element(&self, lane: usize) -> ValueId {
        self.lanes[lane]
    }

    pub fn lanes(&self) -> &[ValueId] {
        &self.lanes
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.lanes.contains(&value)
    }

    pub fn is_leaf(&self) -> bool {
        self.operands.is_empty()
    }

    /// All lanes hold one and the same value (broadcast opportunity).
    pub fn splattable(&self) -> bool {
        self.lanes.iter().all(|&v| v == self.lanes[0])
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, index: usize) -> SuperwordId {
        self.operands[index]
    }

    pub fn operands(&self) -> &[SuperwordId] {
        &self.operands
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn num_uses(&self) -> usize {
        self.uses
    }

    pub(crate) fn set_element(&mut self, lane: usize, value: ValueId) {
        self.lanes[lane] = value;
    }
}

/// Owner of every alternative superword occupying one logical tree position.
/// The first superword is the node's entry; more accumulate when commutative
/// coarsening collapses additional scalar groupings into the same position.
#[derive(Debug, Clone, PartialEq)]
pub struct SlpNode {
    superwords: Vec<SuperwordId>,
    operands: Vec<NodeId>,
}

impl SlpNode {
    pub fn num_superwords(&self) -> usize {
        self.superwords.len()
    }

    pub fn superword(&self, index: usize) -> SuperwordId {
        self.superwords[index]
    }

    pub fn superwords(&self) -> &[SuperwordId] {
        &self.superwords
    }

    pub fn last_superword(&self) -> SuperwordId {
        *self.superwords.last().unwrap()
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, index: usize) -> NodeId {
        self.operands[index]
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }
}

/// The superword DAG for one seed: arenas for superwords and nodes plus the
/// reuse registry keyed by first-lane value. Registry hits are what turn the
/// tree into a DAG; lookups require full tuple equality.
#[derive(Debug, Clone)]
pub struct SlpGraph {
    words: Vec<Superword>,
    nodes: Vec<SlpNode>,
    words_by_value: FxHashMap<ValueId, SmallVec<[SuperwordId; 2]>>,
    root_word: SuperwordId,
    root_node: NodeId,
}

impl SlpGraph {
    pub(crate) fn new(seed: &[ValueId]) -> Self {
        let mut graph = Self {
            words: Vec::new(),
            nodes: Vec::new(),
            words_by_value: FxHashMap::default(),
            root_word: 0,
            root_node: 0,
        };
        let root_node = graph.add_node();
        let root_word = graph.add_word(SmallVec::from_slice(seed), root_node);
        graph.root_word = root_word;
        graph.root_node = root_node;
        graph
    }

    pub fn root(&self) -> SuperwordId {
        self.root_word
    }

    pub fn root_node(&self) -> NodeId {
        self.root_node
    }

    pub fn word(&self, id: SuperwordId) -> &Superword {
        &self.words[id]
    }

    pub(crate) fn word_mut(&mut self, id: SuperwordId) -> &mut Superword {
        &mut self.words[id]
    }

    pub fn node(&self, id: NodeId) -> &SlpNode {
        &self.nodes[id]
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn add_node(&mut self) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(SlpNode {
            superwords: Vec::new(),
            operands: Vec::new(),
        });
        id
    }

    pub(crate) fn add_word(&mut self, lanes: SmallVec<[ValueId; 4]>, node: NodeId) -> SuperwordId {
        let id = self.words.len();
        self.words_by_value
            .entry(lanes[0])
            .or_default()
            .push(id);
        self.words.push(Superword {
            lanes,
            operands: SmallVec::new(),
            node,
            uses: 0,
        });
        self.nodes[node].superwords.push(id);
        id
    }

    pub(crate) fn add_word_operand(&mut self, word: SuperwordId, operand: SuperwordId) {
        self.words[word].operands.push(operand);
        self.words[operand].uses += 1;
    }

    pub(crate) fn add_node_operand(&mut self, node: NodeId, operand: NodeId) {
        self.nodes[node].operands.push(operand);
    }

    /// Exact-tuple reuse lookup: first lane keys the registry, the remaining
    /// lanes must match an existing superword one for one.
    pub fn find_existing(&self, lanes: &[ValueId]) -> Option<SuperwordId> {
        let candidates = self.words_by_value.get(&lanes[0])?;
        candidates
            .iter()
            .copied()
            .find(|&w| self.words[w].lanes.as_slice() == lanes)
    }

    /// Whether `word` is the entry superword of its owning node, i.e. the
    /// superword that opened the node. Reaching it again means the node can
    /// accept no further superwords.
    pub fn is_node_entry(&self, word: SuperwordId) -> bool {
        self.nodes[self.words[word].node].superwords[0] == word
    }

    pub fn node_contains(&self, node: NodeId, value: ValueId) -> bool {
        self.nodes[node]
            .superwords
            .iter()
            .any(|&w| self.words[w].contains(value))
    }

    /// Lane value of the node's entry superword.
    pub fn node_value(&self, node: NodeId, lane: usize) -> ValueId {
        self.words[self.nodes[node].superwords[0]].element(lane)
    }

    pub(crate) fn set_node_value(&mut self, node: NodeId, lane: usize, value: ValueId) {
        let word = self.nodes[node].superwords[0];
        self.words[word].set_element(lane, value);
    }

    /// Superwords reachable from `root` via operand edges, each visited once,
    /// in deterministic worklist order.
    pub fn reachable_words(&self, root: SuperwordId) -> Vec<SuperwordId> {
        let mut seen = vec![false; self.words.len()];
        let mut order = vec![root];
        seen[root] = true;
        let mut at = 0;
        while at < order.len() {
            let word = order[at];
            at += 1;
            for &operand in self.words[word].operands.iter() {
                if !seen[operand] {
                    seen[operand] = true;
                    order.push(operand);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_lookup_requires_full_tuple_match() {
        let mut g = SlpGraph::new(&[1, 2, 3, 4]);
        let node = g.add_node();
        g.add_word(SmallVec::from_slice(&[5, 6, 7, 8]), node);
        assert_eq!(g.find_existing(&[1, 2, 3, 4]), Some(g.root()));
        assert_eq!(g.find_existing(&[5, 6, 7, 8]), Some(1));
        assert_eq!(g.find_existing(&[1, 2, 3, 5]), None);
        assert_eq!(g.find_existing(&[5, 6, 7, 9]), None);
    }

    #[test]
    fn splattable_and_leaf_queries() {
        let g = SlpGraph::new(&[7, 7, 7, 7]);
        assert!(g.word(g.root()).splattable());
        assert!(g.word(g.root()).is_leaf());
        let g = SlpGraph::new(&[7, 7, 8, 7]);
        assert!(!g.word(g.root()).splattable());
    }

    #[test]
    fn node_entry_is_first_superword() {
        let mut g = SlpGraph::new(&[1, 2, 3, 4]);
        let root_node = g.root_node();
        let second = g.add_word(SmallVec::from_slice(&[5, 6, 7, 8]), root_node);
        assert!(g.is_node_entry(g.root()));
        assert!(!g.is_node_entry(second));
        assert_eq!(g.node(root_node).last_superword(), second);
    }
}
