use crate::config::SlpConfig;
use crate::ir::{Block, Opcode, ValueDef, ValueId};
use crate::slp::graph::{NodeId, SlpGraph, SuperwordId};
use log::debug;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Candidate classification during operand reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No legal candidate at this position; let other positions pick first.
    Failed,
    /// The previous lane's exact value recurs (broadcast opportunity).
    Splat,
    /// Trivial match among constants.
    Const,
    /// Match by contiguous-address adjacency to the previous lane's pick.
    Load,
    /// Match by shared opcode, ties broken by look-ahead scoring.
    Opcode,
}

/// Grows the superword DAG bottom-up from a seed of isomorphic values.
///
/// Construction never fails: a seed that cannot grow simply yields a graph
/// consisting of the seed superword alone, leaving profitability to the cost
/// model.
pub struct GraphBuilder<'a> {
    block: &'a Block,
    config: &'a SlpConfig,
    graph: SlpGraph,
    /// Operand nodes discovered but not yet descended into. Descent into a
    /// multinode's operands is deferred until the node is complete so that
    /// all alternative superwords are known before operands are finalized.
    pending: FxHashSet<NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn build(block: &'a Block, config: &'a SlpConfig, seed: &[ValueId]) -> SlpGraph {
        debug_assert_eq!(seed.len(), config.width);
        let mut builder = GraphBuilder {
            block,
            config,
            graph: SlpGraph::new(seed),
            pending: FxHashSet::default(),
        };
        builder.pending.insert(builder.graph.root_node());
        let root = builder.graph.root();
        builder.build_word(root);
        debug!(
            "built SLP graph: {} superwords in {} nodes",
            builder.graph.num_words(),
            builder.graph.num_nodes()
        );
        builder.graph
    }

    fn build_word(&mut self, word: SuperwordId) {
        if !self.uniformly_vectorizable(word) {
            return;
        }
        let node = self.graph.word(word).node();
        let num_lanes = self.graph.word(word).num_lanes();
        let opcode = self
            .block
            .def_opcode(self.graph.word(word).element(0))
            .expect("uniformly vectorizable lanes have defining operations")
            .clone();
        let arity = opcode.arity();

        if opcode.commutative() {
            // Coarsening mode: align operands per lane, then grow the current
            // node where legal, open new operand nodes otherwise.
            let all_operands = self.all_operands_sorted(word, &opcode);
            for i in 0..arity {
                let lanes: SmallVec<[ValueId; 4]> =
                    (0..num_lanes).map(|lane| all_operands[lane][i]).collect();
                if let Some(existing) = self.graph.find_existing(&lanes) {
                    let operand_node = self.graph.word(existing).node();
                    self.graph.add_word_operand(word, existing);
                    self.graph.add_node_operand(node, operand_node);
                } else if self.appendable(node, &opcode, &all_operands, i) {
                    let new_word = self.add_word_to(lanes, node, word);
                    self.build_word(new_word);
                } else if self.of_vectorizable_type(&lanes) {
                    let operand_node = self.graph.add_node();
                    self.add_word_to(lanes, operand_node, word);
                    self.graph.add_node_operand(node, operand_node);
                    self.pending.insert(operand_node);
                }
            }
            // Normal mode: back at the node's entry superword means the
            // multinode is complete. Reorder its operand lanes, then descend
            // into the operand nodes that are still pending.
            if self.graph.is_node_entry(word) {
                if self.graph.node(node).num_operands() > 1 && num_lanes > 1 {
                    self.reorder_operands(node);
                }
                let operand_nodes: Vec<NodeId> = self.graph.node(node).operands().to_vec();
                for operand_node in operand_nodes {
                    if self.pending.remove(&operand_node) {
                        let last = self.graph.node(operand_node).last_superword();
                        self.build_word(last);
                    }
                }
            }
        } else {
            // Non-commutative: operands are taken positionally, descent is
            // eager and no reordering applies.
            for i in 0..arity {
                let lanes: SmallVec<[ValueId; 4]> = (0..num_lanes)
                    .map(|lane| {
                        let element = self.graph.word(word).element(lane);
                        let def = self
                            .block
                            .defining_op(element)
                            .expect("vectorizable lanes have defining operations");
                        self.block.op(def).operands[i]
                    })
                    .collect();
                if let Some(existing) = self.graph.find_existing(&lanes) {
                    let operand_node = self.graph.word(existing).node();
                    self.graph.add_word_operand(word, existing);
                    self.graph.add_node_operand(node, operand_node);
                } else if self.of_vectorizable_type(&lanes) {
                    let operand_node = self.graph.add_node();
                    let new_word = self.add_word_to(lanes, operand_node, word);
                    self.graph.add_node_operand(node, operand_node);
                    self.build_word(new_word);
                }
            }
        }
    }

    /// Stop condition: growth continues only while every lane is the result
    /// of one shared, vectorizable opcode.
    fn uniformly_vectorizable(&self, word: SuperwordId) -> bool {
        let lanes = self.graph.word(word).lanes();
        let first = match self.block.def_opcode(lanes[0]) {
            Some(opcode) if opcode.vectorizable() => opcode,
            _ => return false,
        };
        if !lanes.iter().skip(1).all(|&v| {
            self.block
                .def_opcode(v)
                .is_some_and(|opcode| opcode.vectorizable() && opcode.name() == first.name())
        }) {
            return false;
        }
        if !self.config.allow_duplicate_elements {
            let mut seen: SmallVec<[ValueId; 4]> = SmallVec::new();
            for &lane in lanes {
                if seen.contains(&lane) {
                    return false;
                }
                seen.push(lane);
            }
        }
        true
    }

    fn of_vectorizable_type(&self, lanes: &[ValueId]) -> bool {
        lanes
            .iter()
            .all(|&v| self.block.value(v).ty.is_vectorizable())
    }

    /// A candidate tuple may join the current node when every lane's operand
    /// shares the node's opcode, none of those operands is consumed outside
    /// the node, and the node has room left.
    fn appendable(
        &self,
        node: NodeId,
        opcode: &Opcode,
        all_operands: &[SmallVec<[ValueId; 2]>],
        index: usize,
    ) -> bool {
        if self.graph.node(node).num_superwords() >= self.config.max_node_size {
            return false;
        }
        all_operands.iter().all(|operands| {
            let operand = operands[index];
            match self.block.def_opcode(operand) {
                Some(def) if def.name() == opcode.name() => {
                    self.block.users(operand).iter().all(|&user| {
                        self.block
                            .result(user)
                            .is_some_and(|result| self.graph.node_contains(node, result))
                    })
                }
                _ => false,
            }
        })
    }

    fn add_word_to(
        &mut self,
        lanes: SmallVec<[ValueId; 4]>,
        node: NodeId,
        using_word: SuperwordId,
    ) -> SuperwordId {
        let new_word = self.graph.add_word(lanes, node);
        self.graph.add_word_operand(using_word, new_word);
        new_word
    }

    /// Operand lists per lane, each sorted by a canonical key so that
    /// semantically equivalent operands line up across lanes despite
    /// syntactic order. Sorting is independent per lane.
    fn all_operands_sorted(
        &self,
        word: SuperwordId,
        current: &Opcode,
    ) -> Vec<SmallVec<[ValueId; 2]>> {
        let mut all: Vec<SmallVec<[ValueId; 2]>> = Vec::new();
        for &lane in self.graph.word(word).lanes() {
            let def = self.block.defining_op(lane).unwrap();
            let mut operands: SmallVec<[ValueId; 2]> =
                SmallVec::from_slice(&self.block.op(def).operands);
            self.sort_by_opcode(&mut operands, current);
            all.push(operands);
        }
        all
    }

    fn sort_by_opcode(&self, values: &mut SmallVec<[ValueId; 2]>, smallest: &Opcode) {
        values.sort_by_key(|&v| match self.block.def_opcode(v) {
            Some(opcode) => {
                let preferred = u8::from(opcode.name() != smallest.name());
                (0u8, preferred, opcode.name(), 0usize)
            }
            None => (1, 1, "", self.argument_index(v)),
        });
    }

    fn argument_index(&self, value: ValueId) -> usize {
        match self.block.value(value).def {
            ValueDef::Argument { index } => index,
            ValueDef::OpResult { .. } => 0,
        }
    }

    /// Align operand picks across lanes for a completed multinode. Lane 0 is
    /// the baseline; every subsequent lane assigns each position its best
    /// candidate by mode, deferring failed positions and handing leftovers
    /// out in order.
    ///
    /// Positions whose operand word already has another consumer are pinned:
    /// their lane tuple is frozen, so they keep their values and those values
    /// are withdrawn from the candidate pool before any free position picks.
    fn reorder_operands(&mut self, node: NodeId) {
        let num_operands = self.graph.node(node).num_operands();
        let num_lanes = self
            .graph
            .word(self.graph.node(node).superword(0))
            .num_lanes();
        let rewritable: Vec<bool> = (0..num_operands)
            .map(|i| {
                let operand_node = self.graph.node(node).operand(i);
                let entry = self.graph.node(operand_node).superword(0);
                self.graph.word(entry).num_uses() <= 1
            })
            .collect();
        if !rewritable.contains(&true) {
            return;
        }
        let mut final_order: Vec<Vec<Option<ValueId>>> = vec![Vec::new(); num_lanes];
        let mut modes: Vec<Vec<Mode>> = vec![Vec::new(); num_lanes];

        for i in 0..num_operands {
            let value = self.graph.node_value(self.graph.node(node).operand(i), 0);
            final_order[0].push(Some(value));
            modes[0].push(self.mode_from_value(value));
        }

        for lane in 1..num_lanes {
            let mut candidates: Vec<ValueId> = (0..num_operands)
                .map(|i| self.graph.node_value(self.graph.node(node).operand(i), lane))
                .collect();
            for i in 0..num_operands {
                if rewritable[i] {
                    continue;
                }
                let pinned = self.graph.node_value(self.graph.node(node).operand(i), lane);
                let at = candidates
                    .iter()
                    .position(|&c| c == pinned)
                    .expect("pinned lane values come from the candidate pool");
                candidates.remove(at);
            }
            for i in 0..num_operands {
                if !rewritable[i] {
                    let pinned = self.graph.node_value(self.graph.node(node).operand(i), lane);
                    let carried = modes[lane - 1][i];
                    final_order[lane].push(Some(pinned));
                    modes[lane].push(carried);
                    continue;
                }
                if modes[lane - 1][i] == Mode::Failed {
                    final_order[lane].push(None);
                    modes[lane].push(Mode::Failed);
                    continue;
                }
                let last = final_order[lane - 1][i].expect("non-failed positions carry a value");
                let (best, mode) = self.best_candidate(modes[lane - 1][i], last, &mut candidates);
                let mode = if best == Some(last) { Mode::Splat } else { mode };
                final_order[lane].push(best);
                modes[lane].push(mode);
            }
            // Distribute remaining candidates over unassigned positions.
            for candidate in candidates {
                if let Some(slot) = final_order[lane].iter_mut().find(|slot| slot.is_none()) {
                    *slot = Some(candidate);
                }
            }
        }

        for i in 0..num_operands {
            if !rewritable[i] {
                continue;
            }
            let operand_node = self.graph.node(node).operand(i);
            for (lane, order) in final_order.iter().enumerate() {
                if let Some(value) = order[i] {
                    self.graph.set_node_value(operand_node, lane, value);
                }
            }
        }
    }

    fn best_candidate(
        &self,
        mode: Mode,
        last: ValueId,
        candidates: &mut Vec<ValueId>,
    ) -> (Option<ValueId>, Mode) {
        let mut result_mode = mode;
        let best = match mode {
            Mode::Failed => None,
            Mode::Splat => candidates.iter().copied().find(|&c| c == last),
            Mode::Const | Mode::Load | Mode::Opcode => {
                let matching: Vec<ValueId> = candidates
                    .iter()
                    .copied()
                    .filter(|&candidate| {
                        if mode == Mode::Load {
                            consecutive_loads(self.block, last, candidate)
                        } else {
                            match (self.block.def_opcode(last), self.block.def_opcode(candidate)) {
                                (Some(a), Some(b)) => a.name() == b.name(),
                                _ => false,
                            }
                        }
                    })
                    .collect();
                if matching.is_empty() {
                    // No legal candidate: consume one arbitrarily, mark the
                    // position failed so later lanes stop matching against it.
                    result_mode = Mode::Failed;
                    candidates.first().copied()
                } else if matching.len() == 1 || mode != Mode::Opcode {
                    Some(matching[0])
                } else {
                    Some(self.look_ahead_best(last, &matching))
                }
            }
        };
        if let Some(best) = best {
            let at = candidates
                .iter()
                .position(|&c| c == best)
                .expect("best candidate was drawn from the candidate list");
            candidates.remove(at);
        }
        (best, result_mode)
    }

    /// Break opcode ties by structural similarity, descending one level at a
    /// time until a strict winner emerges or the bound is exhausted.
    fn look_ahead_best(&self, last: ValueId, matching: &[ValueId]) -> ValueId {
        if !self.config.use_xor_chains {
            let mut best = matching[0];
            let mut best_score = 0;
            for &candidate in matching {
                let score = self.look_ahead_score(last, candidate, 0);
                if score > best_score {
                    best = candidate;
                    best_score = score;
                }
            }
            return best;
        }
        let mut best = matching[0];
        for level in 1..=self.config.max_look_ahead {
            let mut best_score = 0;
            let mut scores: FxHashSet<usize> = FxHashSet::default();
            for &candidate in matching {
                let score = self.look_ahead_score(last, candidate, level);
                if scores.is_empty() || score > best_score {
                    best = candidate;
                    best_score = score;
                }
                scores.insert(score);
            }
            // A strict winner at this level; no need to go deeper.
            if scores.len() > 1 {
                break;
            }
        }
        best
    }

    fn look_ahead_score(&self, last: ValueId, candidate: ValueId, level: usize) -> usize {
        let last_def = self.block.defining_op(last);
        let candidate_def = self.block.defining_op(candidate);
        if level == 0 || last_def.is_none() || candidate_def.is_none() {
            if last == candidate {
                return 1;
            }
            if let Some(def) = last_def {
                if matches!(self.block.op(def).opcode, Opcode::BatchRead { .. }) {
                    return usize::from(consecutive_loads(self.block, last, candidate));
                }
            }
            return match (last_def, candidate_def) {
                (Some(a), Some(b)) => {
                    usize::from(self.block.op(a).opcode.name() == self.block.op(b).opcode.name())
                }
                _ => 0,
            };
        }
        let mut sum = 0;
        for &last_operand in &self.block.op(last_def.unwrap()).operands {
            for &candidate_operand in &self.block.op(candidate_def.unwrap()).operands {
                sum += self.look_ahead_score(last_operand, candidate_operand, level - 1);
            }
        }
        sum
    }

    fn mode_from_value(&self, value: ValueId) -> Mode {
        match self.block.def_opcode(value) {
            None => Mode::Splat,
            Some(opcode) if opcode.constant_like() => Mode::Const,
            Some(Opcode::BatchRead { .. }) => Mode::Load,
            Some(_) => Mode::Opcode,
        }
    }
}

/// Two loads are consecutive when they read adjacent offsets off the same
/// base value.
pub(crate) fn consecutive_loads(block: &Block, lhs: ValueId, rhs: ValueId) -> bool {
    let (Some(lhs_def), Some(rhs_def)) = (block.defining_op(lhs), block.defining_op(rhs)) else {
        return false;
    };
    let lhs_op = block.op(lhs_def);
    let rhs_op = block.op(rhs_def);
    match (&lhs_op.opcode, &rhs_op.opcode) {
        (Opcode::BatchRead { index: a }, Opcode::BatchRead { index: b }) => {
            lhs_op.operands[0] == rhs_op.operands[0] && *b == a + 1
        }
        _ => false,
    }
}
