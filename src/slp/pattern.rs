use crate::error::Result;
use crate::ir::{Block, Opcode, Type, ValueId};
use crate::slp::builder::consecutive_loads;
use crate::slp::conversion::ConversionManager;
use crate::slp::graph::{SlpGraph, SuperwordId};
use smallvec::SmallVec;

/// Closed tag set over which the cost model dispatches. Every pattern
/// announces the kind of vector code it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Constant,
    Read,
    Arith,
    Broadcast,
    BroadcastInsert,
}

impl PatternKind {
    /// Whether the pattern supersedes the scalar lane operations. Broadcast
    /// variants read the scalars as inputs and keep them alive, so they save
    /// nothing on the scalar side.
    pub fn replaces_scalars(&self) -> bool {
        matches!(
            self,
            PatternKind::Constant | PatternKind::Read | PatternKind::Arith
        )
    }
}

/// One way of realizing a superword as a single vector value.
///
/// `matches` and `required_scalars` run during planning, before any block
/// mutation; `apply` runs only once a full plan exists, so a failed attempt
/// never leaves partial vector code behind.
pub trait SlpPattern {
    fn kind(&self) -> PatternKind;

    fn matches(&self, block: &Block, graph: &SlpGraph, word: SuperwordId) -> bool;

    /// Scalar lane values the pattern reads directly when applied. The
    /// conversion manager routes these through extraction handling first.
    fn required_scalars(
        &self,
        _block: &Block,
        _graph: &SlpGraph,
        _word: SuperwordId,
    ) -> SmallVec<[ValueId; 4]> {
        SmallVec::new()
    }

    /// Emit the vector realization and return its result value.
    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId>;
}

/// Registration order doubles as tie-break order: the broadcast-insert
/// fallback comes last and matches every superword, so planning can always
/// complete once a graph exists.
pub fn default_patterns() -> Vec<Box<dyn SlpPattern>> {
    vec![
        Box::new(VectorizeConstant),
        Box::new(VectorizeRead),
        Box::new(VectorizeArith),
        Box::new(BroadcastSuperword),
        Box::new(BroadcastInsert),
    ]
}

/// All lanes are floating constants: fold them into one vector constant.
pub struct VectorizeConstant;

impl SlpPattern for VectorizeConstant {
    fn kind(&self) -> PatternKind {
        PatternKind::Constant
    }

    fn matches(&self, block: &Block, graph: &SlpGraph, word: SuperwordId) -> bool {
        graph
            .word(word)
            .lanes()
            .iter()
            .all(|&lane| matches!(block.def_opcode(lane), Some(Opcode::ConstF64(_))))
    }

    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId> {
        let elements: Vec<f64> = graph
            .word(word)
            .lanes()
            .iter()
            .map(|&lane| match block.def_opcode(lane) {
                Some(&Opcode::ConstF64(c)) => c,
                _ => unreachable!("checked by matches"),
            })
            .collect();
        let lanes = elements.len();
        Ok(mgr.create(
            block,
            Opcode::ConstVec(elements),
            &[],
            Type::VecF64 { lanes },
        ))
    }
}

/// Lane-consecutive batch reads off a shared buffer become one wide load.
pub struct VectorizeRead;

impl SlpPattern for VectorizeRead {
    fn kind(&self) -> PatternKind {
        PatternKind::Read
    }

    fn matches(&self, block: &Block, graph: &SlpGraph, word: SuperwordId) -> bool {
        let lanes = graph.word(word).lanes();
        lanes
            .windows(2)
            .all(|pair| consecutive_loads(block, pair[0], pair[1]))
    }

    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId> {
        let first = graph.word(word).element(0);
        let def = block
            .defining_op(first)
            .unwrap_or_else(|| unreachable!("checked by matches"));
        let base = block.op(def).operands[0];
        let index = match block.op(def).opcode {
            Opcode::BatchRead { index } => index,
            _ => unreachable!("checked by matches"),
        };
        let lanes = graph.word(word).num_lanes();
        Ok(mgr.create(
            block,
            Opcode::BatchReadVec { index },
            &[base],
            Type::VecF64 { lanes },
        ))
    }
}

/// Uniform elementwise arithmetic over already vectorized operand
/// superwords.
pub struct VectorizeArith;

impl VectorizeArith {
    fn vector_opcode(scalar: &Opcode) -> Option<Opcode> {
        match scalar {
            Opcode::Add => Some(Opcode::VecAdd),
            Opcode::Mul => Some(Opcode::VecMul),
            Opcode::Sub => Some(Opcode::VecSub),
            Opcode::Log => Some(Opcode::VecLog),
            _ => None,
        }
    }
}

impl SlpPattern for VectorizeArith {
    fn kind(&self) -> PatternKind {
        PatternKind::Arith
    }

    fn matches(&self, block: &Block, graph: &SlpGraph, word: SuperwordId) -> bool {
        let w = graph.word(word);
        if w.is_leaf() {
            return false;
        }
        let first = match block.def_opcode(w.element(0)) {
            Some(opcode) => opcode.clone(),
            None => return false,
        };
        if Self::vector_opcode(&first).is_none() {
            return false;
        }
        if w.num_operands() != first.arity() {
            return false;
        }
        w.lanes().iter().all(|&lane| {
            block
                .def_opcode(lane)
                .is_some_and(|opcode| opcode.name() == first.name())
        })
    }

    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId> {
        let w = graph.word(word);
        let scalar = block
            .def_opcode(w.element(0))
            .cloned()
            .unwrap_or_else(|| unreachable!("checked by matches"));
        let opcode =
            Self::vector_opcode(&scalar).unwrap_or_else(|| unreachable!("checked by matches"));
        let mut operands: SmallVec<[ValueId; 2]> = SmallVec::new();
        for index in 0..w.num_operands() {
            operands.push(mgr.vector_value(w.operand(index))?);
        }
        let lanes = w.num_lanes();
        Ok(mgr.create(block, opcode, &operands, Type::VecF64 { lanes }))
    }
}

/// All lanes hold the same value: a single splat suffices.
pub struct BroadcastSuperword;

impl SlpPattern for BroadcastSuperword {
    fn kind(&self) -> PatternKind {
        PatternKind::Broadcast
    }

    fn matches(&self, _block: &Block, graph: &SlpGraph, word: SuperwordId) -> bool {
        graph.word(word).splattable()
    }

    fn required_scalars(
        &self,
        _block: &Block,
        graph: &SlpGraph,
        word: SuperwordId,
    ) -> SmallVec<[ValueId; 4]> {
        let mut scalars = SmallVec::new();
        scalars.push(graph.word(word).element(0));
        scalars
    }

    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId> {
        let element = graph.word(word).element(0);
        let lanes = graph.word(word).num_lanes();
        Ok(mgr.create(block, Opcode::Splat, &[element], Type::VecF64 { lanes }))
    }
}

/// Universal fallback: splat lane zero, then insert every differing lane.
/// Matches unconditionally so planning never dead-ends.
pub struct BroadcastInsert;

impl SlpPattern for BroadcastInsert {
    fn kind(&self) -> PatternKind {
        PatternKind::BroadcastInsert
    }

    fn matches(&self, _block: &Block, _graph: &SlpGraph, _word: SuperwordId) -> bool {
        true
    }

    fn required_scalars(
        &self,
        _block: &Block,
        graph: &SlpGraph,
        word: SuperwordId,
    ) -> SmallVec<[ValueId; 4]> {
        let mut scalars: SmallVec<[ValueId; 4]> = SmallVec::new();
        for &lane in graph.word(word).lanes() {
            if !scalars.contains(&lane) {
                scalars.push(lane);
            }
        }
        scalars
    }

    fn apply(
        &self,
        block: &mut Block,
        graph: &SlpGraph,
        word: SuperwordId,
        mgr: &mut ConversionManager,
    ) -> Result<ValueId> {
        let w = graph.word(word);
        let lanes = w.num_lanes();
        let first = w.element(0);
        let ty = Type::VecF64 { lanes };
        let mut vector = mgr.create(block, Opcode::Splat, &[first], ty);
        for lane in 1..lanes {
            let element = graph.word(word).element(lane);
            if element != first {
                vector = mgr.create(block, Opcode::Insert { lane }, &[vector, element], ty);
            }
        }
        Ok(vector)
    }
}
