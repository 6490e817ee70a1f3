use crate::ir::{Block, OpId, Opcode, ValueId};
use crate::slp::conversion::ConversionState;
use crate::slp::graph::{SlpGraph, SuperwordId};
use crate::slp::pattern::PatternKind;
use rustc_hash::{FxHashMap, FxHashSet};

/// Pricing contract consulted during rewriting.
///
/// One instance lives for one vectorization attempt; `reset` clears memoized
/// state between independent attempts. Pattern dispatch happens over
/// [`PatternKind`] tags instead of an open visitor hierarchy.
pub trait CostModel {
    /// Cost of computing `value` and its whole operand subtree on the scalar
    /// path. Memoized per value for the lifetime of the instance.
    fn scalar_cost(&mut self, block: &Block, value: ValueId) -> f64;

    /// Local cost of realizing `superword` through a pattern of the given
    /// kind. Operand superwords are priced separately.
    fn superword_cost(
        &mut self,
        block: &Block,
        graph: &SlpGraph,
        word: SuperwordId,
        kind: PatternKind,
    ) -> f64;

    /// Whether bridging `value` out of its containing vector beats keeping
    /// the scalar computation alive. False also covers values that sit in no
    /// computed superword.
    fn extraction_profitable(
        &mut self,
        block: &Block,
        state: &ConversionState,
        value: ValueId,
    ) -> bool;

    /// Aggregate scalar cost of the block, excluding operations known to be
    /// dead after vectorization. Used by the host driver to accept or reject
    /// a rewrite as a whole.
    fn block_cost(&mut self, block: &Block, dead: &FxHashSet<OpId>) -> f64;

    fn reset(&mut self);
}

/// Uniform pricing: constants are free, memory reads cost 2, every other
/// scalar operation costs 1; extractions and insertions cost 1 each.
#[derive(Debug, Default)]
pub struct UnitCostModel {
    cached_scalar: FxHashMap<ValueId, f64>,
}

impl UnitCostModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn op_cost(opcode: &Opcode) -> f64 {
        if opcode.constant_like() {
            0.0
        } else if matches!(opcode, Opcode::BatchRead { .. }) {
            2.0
        } else {
            1.0
        }
    }

    const EXTRACT_COST: f64 = 1.0;
    const INSERT_COST: f64 = 1.0;
}

impl CostModel for UnitCostModel {
    fn scalar_cost(&mut self, block: &Block, value: ValueId) -> f64 {
        if let Some(&cost) = self.cached_scalar.get(&value) {
            return cost;
        }
        let cost = match block.defining_op(value) {
            None => 0.0,
            Some(op) => {
                let mut cost = Self::op_cost(&block.op(op).opcode);
                let operands: Vec<ValueId> = block.op(op).operands.to_vec();
                for operand in operands {
                    cost += self.scalar_cost(block, operand);
                }
                cost
            }
        };
        self.cached_scalar.insert(value, cost);
        cost
    }

    fn superword_cost(
        &mut self,
        _block: &Block,
        graph: &SlpGraph,
        word: SuperwordId,
        kind: PatternKind,
    ) -> f64 {
        match kind {
            PatternKind::Constant => 0.0,
            PatternKind::Read => 1.0,
            PatternKind::Arith => 1.0,
            PatternKind::Broadcast => 1.0,
            PatternKind::BroadcastInsert => {
                let lanes = graph.word(word).lanes();
                let inserts = lanes
                    .iter()
                    .skip(1)
                    .filter(|&&lane| lane != lanes[0])
                    .count();
                1.0 + inserts as f64 * Self::INSERT_COST
            }
        }
    }

    fn extraction_profitable(
        &mut self,
        block: &Block,
        state: &ConversionState,
        value: ValueId,
    ) -> bool {
        if state.word_containing(value).is_none() {
            return false;
        }
        self.scalar_cost(block, value) > Self::EXTRACT_COST
    }

    fn block_cost(&mut self, block: &Block, dead: &FxHashSet<OpId>) -> f64 {
        block
            .schedule()
            .iter()
            .filter(|op| !dead.contains(op))
            .map(|&op| Self::op_cost(&block.op(op).opcode))
            .sum()
    }

    fn reset(&mut self) {
        self.cached_scalar.clear();
    }
}
