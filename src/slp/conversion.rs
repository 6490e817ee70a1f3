use crate::error::{Result, SlpError};
use crate::ir::{Block, OpId, Opcode, Type, ValueId};
use crate::slp::cost::CostModel;
use crate::slp::graph::{SlpGraph, SuperwordId};
use crate::slp::pattern::SlpPattern;
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;

type WordCallback = Box<dyn FnMut(SuperwordId)>;
type ScalarCallback = Box<dyn FnMut(ValueId)>;

/// Tracks which superwords and scalars have been realized so far in an
/// attempt. Computed sets only ever grow; a superword may be marked computed
/// only after all of its operand superwords.
#[derive(Default)]
pub struct ConversionState {
    computed_words: FxHashSet<SuperwordId>,
    computed_scalars: FxHashSet<ValueId>,
    /// First computed superword (and lane) holding each value. First entry
    /// wins, so every later extraction request resolves to the same source.
    extractable: FxHashMap<ValueId, (SuperwordId, usize)>,
    word_callbacks: Vec<WordCallback>,
    scalar_callbacks: Vec<ScalarCallback>,
    extraction_callbacks: Vec<ScalarCallback>,
}

impl ConversionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn already_computed_word(&self, word: SuperwordId) -> bool {
        self.computed_words.contains(&word)
    }

    pub fn already_computed_scalar(&self, value: ValueId) -> bool {
        self.computed_scalars.contains(&value)
    }

    /// Superword position `value` could be extracted from, if any.
    pub fn word_containing(&self, value: ValueId) -> Option<(SuperwordId, usize)> {
        self.extractable.get(&value).copied()
    }

    pub(crate) fn mark_word_computed(
        &mut self,
        graph: &SlpGraph,
        word: SuperwordId,
    ) -> Result<()> {
        for &operand in graph.word(word).operands() {
            if !self.computed_words.contains(&operand) {
                return Err(SlpError::OperandOrder(word, operand));
            }
        }
        if !self.computed_words.insert(word) {
            return Ok(());
        }
        for (lane, &element) in graph.word(word).lanes().iter().enumerate() {
            self.extractable.entry(element).or_insert((word, lane));
        }
        for callback in self.word_callbacks.iter_mut() {
            callback(word);
        }
        Ok(())
    }

    /// Marking a scalar computed implies its whole operand subtree is
    /// available too.
    pub(crate) fn mark_scalar_computed(&mut self, block: &Block, value: ValueId) {
        if !self.computed_scalars.insert(value) {
            return;
        }
        if let Some(op) = block.defining_op(value) {
            let operands: Vec<ValueId> = block.op(op).operands.to_vec();
            for operand in operands {
                self.mark_scalar_computed(block, operand);
            }
        }
        for callback in self.scalar_callbacks.iter_mut() {
            callback(value);
        }
    }

    pub(crate) fn mark_extracted(&mut self, value: ValueId) {
        for callback in self.extraction_callbacks.iter_mut() {
            callback(value);
        }
    }

    pub fn on_word_computed(&mut self, callback: WordCallback) {
        self.word_callbacks.push(callback);
    }

    pub fn on_scalar_computed(&mut self, callback: ScalarCallback) {
        self.scalar_callbacks.push(callback);
    }

    pub fn on_value_extracted(&mut self, callback: ScalarCallback) {
        self.extraction_callbacks.push(callback);
    }
}

/// Drives one graph-to-block rewrite: fixes the conversion order, tracks
/// which scalar uses escape the graph, places new operations, and bridges
/// vector lanes back to scalar consumers with at most one extraction per
/// value.
#[derive(Default)]
pub struct ConversionManager {
    state: ConversionState,
    order: Vec<SuperwordId>,
    /// Per lane value, the users that sit outside the dependency graph and
    /// keep needing the scalar, sorted by program position.
    escaping_users: FxHashMap<ValueId, Vec<OpId>>,
    vector_values: FxHashMap<SuperwordId, ValueId>,
    extraction_cache: FxHashMap<ValueId, ValueId>,
    index_constants: FxHashMap<usize, ValueId>,
    /// Most recently created operation; new operations are placed after it
    /// (and after their operand definitions).
    latest: Option<OpId>,
}

impl ConversionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversionState {
        &mut self.state
    }

    /// Fix the processing order (deepest superwords first, non-leaves before
    /// leaves at equal depth) and snapshot which users of each lane value
    /// live outside the graph.
    pub fn init_conversion(&mut self, block: &Block, graph: &SlpGraph) {
        let mut depths: FxHashMap<SuperwordId, usize> = FxHashMap::default();
        depths.insert(graph.root(), 0);
        let mut worklist = vec![graph.root()];
        while let Some(word) = worklist.pop() {
            let depth = depths[&word] + 1;
            for &operand in graph.word(word).operands() {
                let entry = depths.entry(operand).or_insert(0);
                if *entry < depth {
                    *entry = depth;
                    worklist.push(operand);
                }
            }
        }

        self.order = depths.keys().copied().collect();
        self.order
            .sort_unstable_by_key(|&word| (Reverse(depths[&word]), graph.word(word).is_leaf(), word));

        self.escaping_users.clear();
        for &word in &self.order {
            for lane in 0..graph.word(word).num_lanes() {
                let element = graph.word(word).element(lane);
                let Some(def) = block.defining_op(element) else {
                    continue;
                };
                self.escaping_users
                    .entry(element)
                    .or_insert_with(|| block.users(element).to_vec());
                if graph.word(word).is_leaf() {
                    continue;
                }
                // Operand superwords sit deeper and were visited already, so
                // their entries exist by now.
                for index in 0..graph.word(word).num_operands() {
                    let operand = graph.word(word).operand(index);
                    let consumed = graph.word(operand).element(lane);
                    if let Some(users) = self.escaping_users.get_mut(&consumed) {
                        users.retain(|&user| user != def);
                    }
                }
            }
        }
        self.escaping_users.retain(|_, users| !users.is_empty());
        for users in self.escaping_users.values_mut() {
            users.sort_unstable_by_key(|&user| block.position(user));
        }

        // The region's entry point: the earliest defining operation among
        // the leaf lanes anchors all created instructions.
        self.latest = self
            .order
            .iter()
            .filter(|&&word| graph.word(word).is_leaf())
            .flat_map(|&word| graph.word(word).lanes())
            .filter_map(|&lane| block.defining_op(lane))
            .min_by_key(|&op| block.position(op));
    }

    pub fn conversion_order(&self) -> &[SuperwordId] {
        &self.order
    }

    pub fn was_converted(&self, word: SuperwordId) -> bool {
        self.vector_values.contains_key(&word)
    }

    pub fn vector_value(&self, word: SuperwordId) -> Result<ValueId> {
        self.vector_values
            .get(&word)
            .copied()
            .ok_or(SlpError::MissingVector(word))
    }

    pub fn has_escaping_users(&self, value: ValueId) -> bool {
        self.escaping_users
            .get(&value)
            .is_some_and(|users| !users.is_empty())
    }

    /// Route the pattern's scalar inputs through extraction handling and
    /// write the resolved values back into the superword lanes, so the
    /// pattern reads them directly when applied.
    pub fn setup_conversion_for(
        &mut self,
        block: &mut Block,
        graph: &mut SlpGraph,
        word: SuperwordId,
        pattern: &dyn SlpPattern,
        cost: &mut dyn CostModel,
    ) -> Result<()> {
        let required = pattern.required_scalars(block, graph, word);
        for lane in 0..graph.word(word).num_lanes() {
            let element = graph.word(word).element(lane);
            if !required.contains(&element) {
                continue;
            }
            let resolved = self.get_or_extract(block, cost, element)?;
            if resolved != element {
                graph.word_mut(word).set_element(lane, resolved);
            }
        }
        Ok(())
    }

    /// Record the vector realization of `word` and bridge every lane value
    /// that still has scalar users outside the graph.
    pub fn update(
        &mut self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        vector: ValueId,
        pattern: &dyn SlpPattern,
        cost: &mut dyn CostModel,
    ) -> Result<()> {
        if self.vector_values.contains_key(&word) {
            return Err(SlpError::AlreadyConverted(word));
        }
        self.vector_values.insert(word, vector);
        self.state.mark_word_computed(graph, word)?;
        for scalar in pattern.required_scalars(block, graph, word) {
            self.state.mark_scalar_computed(block, scalar);
        }
        for lane in 0..graph.word(word).num_lanes() {
            let element = graph.word(word).element(lane);
            if self.state.already_computed_scalar(element) {
                continue;
            }
            if !self.has_escaping_users(element) {
                continue;
            }
            let extracted = self.get_or_extract(block, cost, element)?;
            let users = self.escaping_users.remove(&element).unwrap_or_default();
            for user in users {
                block.replace_uses_in(user, element, extracted);
            }
        }
        Ok(())
    }

    /// Bridge a single value to the scalar domain: reuse it if it is already
    /// computed or extracted, keep the scalar computation alive when
    /// extraction does not pay off, otherwise emit one lane extraction.
    pub fn get_or_extract(
        &mut self,
        block: &mut Block,
        cost: &mut dyn CostModel,
        value: ValueId,
    ) -> Result<ValueId> {
        if self.state.already_computed_scalar(value) {
            return Ok(value);
        }
        if let Some(&extracted) = self.extraction_cache.get(&value) {
            return Ok(extracted);
        }
        if !cost.extraction_profitable(block, &self.state, value) {
            trace!("keeping value {value} scalar, extraction does not pay off");
            self.state.mark_scalar_computed(block, value);
            return Ok(value);
        }
        let (word, lane) = self
            .state
            .word_containing(value)
            .ok_or(SlpError::NoExtractionSource(value))?;
        let source = self.vector_value(word)?;
        let index = self.lane_index_constant(block, lane);
        let extracted = self.create(block, Opcode::ExtractLane, &[source, index], Type::F64);
        trace!("extracted value {value} as {extracted} from superword {word} lane {lane}");
        self.extraction_cache.insert(value, extracted);
        self.state.mark_extracted(value);
        Ok(extracted)
    }

    /// Create a new operation, placed after the latest creation and after
    /// all of its operand definitions.
    pub fn create(
        &mut self,
        block: &mut Block,
        opcode: Opcode,
        operands: &[ValueId],
        ty: Type,
    ) -> ValueId {
        let mut anchor = self.latest;
        for &operand in operands {
            if let Some(def) = block.defining_op(operand) {
                if anchor.is_none_or(|at| block.is_before(at, def)) {
                    anchor = Some(def);
                }
            }
        }
        let op = match anchor {
            Some(at) => block.insert_after(at, opcode, operands, Some(ty)),
            None => block.insert_at_start(opcode, operands, Some(ty)),
        };
        self.latest = Some(op);
        match block.result(op) {
            Some(result) => result,
            None => unreachable!("created operations always produce a result"),
        }
    }

    fn lane_index_constant(&mut self, block: &mut Block, lane: usize) -> ValueId {
        if let Some(&constant) = self.index_constants.get(&lane) {
            return constant;
        }
        let constant = self.create(block, Opcode::ConstI32(lane as i32), &[], Type::I32);
        self.index_constants.insert(lane, constant);
        constant
    }

    /// Re-linearize the whole block by operand depth: label every operation
    /// with its longest path to a consumer, then emit depth groups deepest
    /// first, each group in original program order.
    pub fn finish_conversion(&mut self, block: &mut Block) {
        self.escaping_users.clear();
        self.latest = None;

        let schedule: Vec<OpId> = block.schedule().to_vec();
        let mut depths: FxHashMap<OpId, usize> =
            schedule.iter().map(|&op| (op, 0)).collect();
        let mut enqueued: FxHashSet<OpId> = schedule.iter().copied().collect();
        let mut worklist: Vec<OpId> = schedule.clone();
        let mut max_depth = 0;
        while let Some(op) = worklist.pop() {
            enqueued.remove(&op);
            let depth = depths[&op] + 1;
            let operands: Vec<ValueId> = block.op(op).operands.to_vec();
            for operand in operands {
                let Some(def) = block.defining_op(operand) else {
                    continue;
                };
                if depths[&def] < depth {
                    depths.insert(def, depth);
                    max_depth = max_depth.max(depth);
                    if enqueued.insert(def) {
                        worklist.push(def);
                    }
                }
            }
        }

        let mut groups: Vec<Vec<OpId>> = vec![Vec::new(); max_depth + 1];
        for &op in &schedule {
            groups[max_depth - depths[&op]].push(op);
        }
        let mut order = Vec::with_capacity(schedule.len());
        for mut group in groups {
            group.sort_unstable_by_key(|&op| block.position(op));
            order.extend(group);
        }
        block.set_schedule(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlpConfig;
    use crate::ir::verify::verify;
    use crate::slp::builder::GraphBuilder;
    use crate::slp::cost::UnitCostModel;
    use crate::slp::pattern::{BroadcastSuperword, VectorizeRead};

    fn consecutive_reads(b: &mut Block) -> Vec<ValueId> {
        let buf = b.add_argument(Type::Buffer);
        (0..4)
            .map(|i| {
                let op = b.append(Opcode::BatchRead { index: i }, &[buf], Some(Type::F64));
                b.result(op).unwrap()
            })
            .collect()
    }

    fn mul_log_block(b: &mut Block) -> Vec<ValueId> {
        let reads = consecutive_reads(b);
        reads
            .iter()
            .map(|&r| {
                let log = b.append(Opcode::Log, &[r], Some(Type::F64));
                let log = b.result(log).unwrap();
                let mul = b.append(Opcode::Mul, &[log, log], Some(Type::F64));
                b.result(mul).unwrap()
            })
            .collect()
    }

    #[test]
    fn operands_come_before_their_consumers_in_the_order() {
        let mut b = Block::new();
        let seed = mul_log_block(&mut b);
        let config = SlpConfig::default();
        let graph = GraphBuilder::build(&b, &config, &seed);
        let mut mgr = ConversionManager::new();
        mgr.init_conversion(&b, &graph);

        let order = mgr.conversion_order();
        assert_eq!(order.len(), graph.num_words());
        let position = |word: SuperwordId| order.iter().position(|&w| w == word).unwrap();
        for &word in order {
            for &operand in graph.word(word).operands() {
                assert!(position(operand) < position(word));
            }
        }
        assert_eq!(*order.last().unwrap(), graph.root());
    }

    #[test]
    fn computing_a_word_before_its_operands_is_rejected() {
        let mut b = Block::new();
        let seed = mul_log_block(&mut b);
        let config = SlpConfig::default();
        let graph = GraphBuilder::build(&b, &config, &seed);
        let mut state = ConversionState::new();

        assert!(matches!(
            state.mark_word_computed(&graph, graph.root()),
            Err(SlpError::OperandOrder(_, _))
        ));
        let mut order: Vec<SuperwordId> = {
            let mut mgr = ConversionManager::new();
            mgr.init_conversion(&b, &graph);
            mgr.conversion_order().to_vec()
        };
        for word in order.drain(..) {
            state.mark_word_computed(&graph, word).unwrap();
            assert!(state.already_computed_word(word));
        }
    }

    #[test]
    fn extraction_is_cached_per_value() {
        let mut b = Block::new();
        let seed = consecutive_reads(&mut b);
        let config = SlpConfig::default();
        let graph = GraphBuilder::build(&b, &config, &seed);
        let mut mgr = ConversionManager::new();
        let mut cost = UnitCostModel::new();
        mgr.init_conversion(&b, &graph);

        let pattern = VectorizeRead;
        let vector = pattern.apply(&mut b, &graph, graph.root(), &mut mgr).unwrap();
        mgr.update(&mut b, &graph, graph.root(), vector, &pattern, &mut cost)
            .unwrap();

        let first = mgr.get_or_extract(&mut b, &mut cost, seed[2]).unwrap();
        let second = mgr.get_or_extract(&mut b, &mut cost, seed[2]).unwrap();
        assert_ne!(first, seed[2]);
        assert_eq!(first, second);
        let extracts = b
            .schedule()
            .iter()
            .filter(|&&op| matches!(b.op(op).opcode, Opcode::ExtractLane))
            .count();
        assert_eq!(extracts, 1);
    }

    #[test]
    fn unprofitable_extraction_keeps_the_scalar() {
        let mut b = Block::new();
        let x = b.add_argument(Type::F64);
        let add = b.append(Opcode::Add, &[x, x], Some(Type::F64));
        let add = b.result(add).unwrap();
        let config = SlpConfig::default();
        let graph = GraphBuilder::build(&b, &config, &[add, add, add, add]);
        let mut mgr = ConversionManager::new();
        let mut cost = UnitCostModel::new();
        mgr.init_conversion(&b, &graph);

        let resolved = mgr.get_or_extract(&mut b, &mut cost, add).unwrap();
        assert_eq!(resolved, add);
        assert!(mgr.state().already_computed_scalar(add));
        assert!(mgr.state().already_computed_scalar(x));

        // The graph grew an operand word for the (x, x, x, x) argument
        // tuple; realize it first so the root's operand-order check holds.
        let pattern = BroadcastSuperword;
        let operand = graph.word(graph.root()).operand(0);
        let splat = pattern.apply(&mut b, &graph, operand, &mut mgr).unwrap();
        mgr.update(&mut b, &graph, operand, splat, &pattern, &mut cost)
            .unwrap();

        // The root's broadcast now reads the untouched scalar directly.
        let vector = pattern.apply(&mut b, &graph, graph.root(), &mut mgr).unwrap();
        mgr.update(&mut b, &graph, graph.root(), vector, &pattern, &mut cost)
            .unwrap();
        mgr.finish_conversion(&mut b);
        verify(&b).unwrap();
    }

    #[test]
    fn relinearization_groups_by_depth() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        let r0 = b.append(Opcode::BatchRead { index: 0 }, &[buf], Some(Type::F64));
        let v0 = b.result(r0).unwrap();
        let log = b.append(Opcode::Log, &[v0], Some(Type::F64));
        let lv = b.result(log).unwrap();
        let r1 = b.append(Opcode::BatchRead { index: 1 }, &[buf], Some(Type::F64));
        let v1 = b.result(r1).unwrap();
        let add = b.append(Opcode::Add, &[lv, v1], Some(Type::F64));
        let _ = b.result(add).unwrap();

        let mut mgr = ConversionManager::new();
        mgr.finish_conversion(&mut b);
        verify(&b).unwrap();
        // r0 feeds the log feeding the add, so it is deepest; the log and
        // the second read share a depth and keep their original order.
        assert_eq!(b.schedule(), &[r0, log, r1, add]);
    }
}
