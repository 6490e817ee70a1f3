use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub type ValueId = usize;
pub type OpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    F64,
    I32,
    /// Batch memory handle. Never vectorizable.
    Buffer,
    VecF64 {
        lanes: usize,
    },
}

impl Type {
    pub fn is_vector(&self) -> bool {
        matches!(self, Type::VecF64 { .. })
    }

    /// Scalar lane type eligible for superword membership.
    pub fn is_vectorizable(&self) -> bool {
        matches!(self, Type::F64)
    }
}

/// Host dialect for per-sample probabilistic-kernel evaluation.
///
/// Scalar instructions form the input program; vector instructions are only
/// ever created by the rewriter. Capability queries drive the builder and
/// the conversion manager; isomorphism is decided on [`Opcode::name`], so
/// attribute payloads (constants, read offsets) do not break lane grouping.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    ConstF64(f64),
    ConstI32(i32),
    /// Load feature `index` of the sample addressed by the buffer operand.
    BatchRead { index: u32 },
    Add,
    Mul,
    Sub,
    Log,
    /// Store the value operand at feature `index`. Side-effecting, no result.
    BatchWrite { index: u32 },

    ConstVec(Vec<f64>),
    /// Wide load of `lanes` consecutive features starting at `index`.
    BatchReadVec { index: u32 },
    Splat,
    Insert { lane: usize },
    VecAdd,
    VecMul,
    VecSub,
    VecLog,
    /// Operands: vector, lane index constant (i32).
    ExtractLane,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::ConstF64(_) => "const.f64",
            Opcode::ConstI32(_) => "const.i32",
            Opcode::BatchRead { .. } => "batch.read",
            Opcode::Add => "arith.add",
            Opcode::Mul => "arith.mul",
            Opcode::Sub => "arith.sub",
            Opcode::Log => "math.log",
            Opcode::BatchWrite { .. } => "batch.write",
            Opcode::ConstVec(_) => "vec.const",
            Opcode::BatchReadVec { .. } => "vec.batch_read",
            Opcode::Splat => "vec.splat",
            Opcode::Insert { .. } => "vec.insert",
            Opcode::VecAdd => "vec.add",
            Opcode::VecMul => "vec.mul",
            Opcode::VecSub => "vec.sub",
            Opcode::VecLog => "vec.log",
            Opcode::ExtractLane => "vec.extract",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Opcode::ConstF64(_) | Opcode::ConstI32(_) | Opcode::ConstVec(_) => 0,
            Opcode::BatchRead { .. }
            | Opcode::Log
            | Opcode::BatchReadVec { .. }
            | Opcode::Splat
            | Opcode::VecLog => 1,
            Opcode::Add
            | Opcode::Mul
            | Opcode::Sub
            | Opcode::BatchWrite { .. }
            | Opcode::Insert { .. }
            | Opcode::VecAdd
            | Opcode::VecMul
            | Opcode::VecSub
            | Opcode::ExtractLane => 2,
        }
    }

    pub fn commutative(&self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::VecAdd | Opcode::VecMul
        )
    }

    /// Whether the scalar opcode has a vector counterpart.
    pub fn vectorizable(&self) -> bool {
        matches!(
            self,
            Opcode::ConstF64(_)
                | Opcode::BatchRead { .. }
                | Opcode::Add
                | Opcode::Mul
                | Opcode::Sub
                | Opcode::Log
        )
    }

    pub fn constant_like(&self) -> bool {
        matches!(
            self,
            Opcode::ConstF64(_) | Opcode::ConstI32(_) | Opcode::ConstVec(_)
        )
    }

    pub fn has_side_effects(&self) -> bool {
        matches!(self, Opcode::BatchWrite { .. })
    }

    pub fn has_result(&self) -> bool {
        !matches!(self, Opcode::BatchWrite { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Argument { index: usize },
    OpResult { op: OpId },
}

#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub def: ValueDef,
    pub ty: Type,
    /// Consuming operations, one entry per operand occurrence.
    pub users: Vec<OpId>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OpId,
    pub opcode: Opcode,
    pub operands: SmallVec<[ValueId; 2]>,
    pub result: Option<ValueId>,
}

/// A single basic block of straight-line code: value and operation arenas
/// plus a total program order (`schedule`). Ids stay stable across erasure;
/// an erased operation merely leaves the schedule.
#[derive(Debug, Clone, Default)]
pub struct Block {
    values: Vec<Value>,
    ops: Vec<Operation>,
    schedule: Vec<OpId>,
    positions: FxHashMap<OpId, usize>,
    args: Vec<ValueId>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_argument(&mut self, ty: Type) -> ValueId {
        let id = self.values.len();
        self.values.push(Value {
            id,
            def: ValueDef::Argument {
                index: self.args.len(),
            },
            ty,
            users: Vec::new(),
        });
        self.args.push(id);
        id
    }

    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Number of arena slots, including erased operations.
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn schedule(&self) -> &[OpId] {
        &self.schedule
    }

    pub fn is_scheduled(&self, op: OpId) -> bool {
        self.positions.contains_key(&op)
    }

    pub fn position(&self, op: OpId) -> usize {
        self.positions[&op]
    }

    pub fn is_before(&self, a: OpId, b: OpId) -> bool {
        self.position(a) < self.position(b)
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value].def {
            ValueDef::Argument { .. } => None,
            ValueDef::OpResult { op } => Some(op),
        }
    }

    /// Opcode of the defining operation, if the value is an op result.
    pub fn def_opcode(&self, value: ValueId) -> Option<&Opcode> {
        self.defining_op(value).map(|op| &self.ops[op].opcode)
    }

    pub fn result(&self, op: OpId) -> Option<ValueId> {
        self.ops[op].result
    }

    pub fn users(&self, value: ValueId) -> &[OpId] {
        &self.values[value].users
    }

    pub fn append(&mut self, opcode: Opcode, operands: &[ValueId], result: Option<Type>) -> OpId {
        let at = self.schedule.len();
        self.make_op(opcode, operands, result, at)
    }

    pub fn insert_at_start(
        &mut self,
        opcode: Opcode,
        operands: &[ValueId],
        result: Option<Type>,
    ) -> OpId {
        self.make_op(opcode, operands, result, 0)
    }

    pub fn insert_before(
        &mut self,
        anchor: OpId,
        opcode: Opcode,
        operands: &[ValueId],
        result: Option<Type>,
    ) -> OpId {
        let at = self.position(anchor);
        self.make_op(opcode, operands, result, at)
    }

    pub fn insert_after(
        &mut self,
        anchor: OpId,
        opcode: Opcode,
        operands: &[ValueId],
        result: Option<Type>,
    ) -> OpId {
        let at = self.position(anchor) + 1;
        self.make_op(opcode, operands, result, at)
    }

    fn make_op(
        &mut self,
        opcode: Opcode,
        operands: &[ValueId],
        result: Option<Type>,
        at: usize,
    ) -> OpId {
        debug_assert_eq!(operands.len(), opcode.arity(), "{}", opcode.name());
        let id = self.ops.len();
        let result_id = result.map(|ty| {
            let vid = self.values.len();
            self.values.push(Value {
                id: vid,
                def: ValueDef::OpResult { op: id },
                ty,
                users: Vec::new(),
            });
            vid
        });
        for &operand in operands {
            self.values[operand].users.push(id);
        }
        self.ops.push(Operation {
            id,
            opcode,
            operands: SmallVec::from_slice(operands),
            result: result_id,
        });
        self.schedule.insert(at, id);
        self.renumber();
        id
    }

    /// Erase an operation from the schedule. The result must be unused.
    pub fn erase_op(&mut self, op: OpId) {
        debug_assert!(self.is_scheduled(op));
        if let Some(result) = self.ops[op].result {
            debug_assert!(
                self.values[result].users.is_empty(),
                "erasing an operation whose result is still in use"
            );
        }
        let operands: SmallVec<[ValueId; 2]> = self.ops[op].operands.clone();
        for operand in operands {
            self.remove_user(operand, op);
        }
        let at = self.position(op);
        self.schedule.remove(at);
        self.renumber();
    }

    /// Rewire every use of `old` to `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) {
        let users = std::mem::take(&mut self.values[old].users);
        for &user in &users {
            for slot in self.ops[user].operands.iter_mut() {
                if *slot == old {
                    *slot = new;
                }
            }
        }
        self.values[new].users.extend(users);
    }

    /// Rewire every operand slot of `user` that reads `old` to read `new`.
    pub fn replace_uses_in(&mut self, user: OpId, old: ValueId, new: ValueId) {
        let mut replaced = 0;
        for slot in self.ops[user].operands.iter_mut() {
            if *slot == old {
                *slot = new;
                replaced += 1;
            }
        }
        for _ in 0..replaced {
            self.remove_user(old, user);
            self.values[new].users.push(user);
        }
    }

    pub fn set_schedule(&mut self, order: Vec<OpId>) {
        debug_assert_eq!(order.len(), self.schedule.len());
        self.schedule = order;
        self.renumber();
    }

    fn remove_user(&mut self, value: ValueId, op: OpId) {
        let users = &mut self.values[value].users;
        if let Some(at) = users.iter().position(|&u| u == op) {
            users.remove(at);
        }
    }

    fn renumber(&mut self) {
        self.positions.clear();
        for (at, &op) in self.schedule.iter().enumerate() {
            self.positions.insert(op, at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_follow_replacement() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        let r0 = b.append(Opcode::BatchRead { index: 0 }, &[buf], Some(Type::F64));
        let r1 = b.append(Opcode::BatchRead { index: 1 }, &[buf], Some(Type::F64));
        let v0 = b.result(r0).unwrap();
        let v1 = b.result(r1).unwrap();
        let add = b.append(Opcode::Add, &[v0, v0], Some(Type::F64));

        assert_eq!(b.users(v0), &[add, add]);
        b.replace_uses_in(add, v0, v1);
        assert!(b.users(v0).is_empty());
        assert_eq!(b.users(v1), &[add, add]);
        assert_eq!(b.op(add).operands.as_slice(), &[v1, v1]);
    }

    #[test]
    fn erase_keeps_ids_stable() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        let r0 = b.append(Opcode::BatchRead { index: 0 }, &[buf], Some(Type::F64));
        let r1 = b.append(Opcode::BatchRead { index: 1 }, &[buf], Some(Type::F64));
        b.erase_op(r0);
        assert!(!b.is_scheduled(r0));
        assert!(b.is_scheduled(r1));
        assert_eq!(b.position(r1), 0);
        assert_eq!(b.users(buf), &[r1]);
    }

    #[test]
    fn insertion_respects_anchor() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        let r0 = b.append(Opcode::BatchRead { index: 0 }, &[buf], Some(Type::F64));
        let r2 = b.append(Opcode::BatchRead { index: 2 }, &[buf], Some(Type::F64));
        let r1 = b.insert_after(r0, Opcode::BatchRead { index: 1 }, &[buf], Some(Type::F64));
        assert_eq!(b.schedule(), &[r0, r1, r2]);
        assert!(b.is_before(r1, r2));
    }
}
