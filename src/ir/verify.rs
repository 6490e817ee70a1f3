use crate::ir::{Block, OpId, ValueDef, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("operation {op} references unknown value {value}")]
    BadOperand { op: OpId, value: ValueId },
    #[error("operation {op} has {got} operands, opcode '{opcode}' expects {want}")]
    ArityMismatch {
        op: OpId,
        opcode: &'static str,
        got: usize,
        want: usize,
    },
    #[error("operation {op} uses value {value} before its definition")]
    UseBeforeDef { op: OpId, value: ValueId },
    #[error("operation {op} reads value {value} whose defining operation was erased")]
    DanglingUse { op: OpId, value: ValueId },
    #[error("users list of value {value} disagrees with the operand references")]
    BadUserList { value: ValueId },
}

/// Structural check of a block: operand validity, def-before-use in schedule
/// order, and users-table consistency.
pub fn verify(block: &Block) -> Result<(), VerifyError> {
    let mut defined: FxHashSet<ValueId> = block.args().iter().copied().collect();

    for &op_id in block.schedule() {
        let op = block.op(op_id);
        if op.operands.len() != op.opcode.arity() {
            return Err(VerifyError::ArityMismatch {
                op: op_id,
                opcode: op.opcode.name(),
                got: op.operands.len(),
                want: op.opcode.arity(),
            });
        }
        for &operand in &op.operands {
            if operand >= block.num_values() {
                return Err(VerifyError::BadOperand {
                    op: op_id,
                    value: operand,
                });
            }
            match block.value(operand).def {
                ValueDef::Argument { .. } => {}
                ValueDef::OpResult { op: def_op } => {
                    if !block.is_scheduled(def_op) {
                        return Err(VerifyError::DanglingUse {
                            op: op_id,
                            value: operand,
                        });
                    }
                    if !defined.contains(&operand) {
                        return Err(VerifyError::UseBeforeDef {
                            op: op_id,
                            value: operand,
                        });
                    }
                }
            }
        }
        if let Some(result) = op.result {
            defined.insert(result);
        }
    }

    // Users lists must match the operand references of scheduled operations.
    let mut counted: FxHashMap<ValueId, Vec<OpId>> = FxHashMap::default();
    for &op_id in block.schedule() {
        for &operand in &block.op(op_id).operands {
            counted.entry(operand).or_default().push(op_id);
        }
    }
    for value in 0..block.num_values() {
        let mut expected = counted.remove(&value).unwrap_or_default();
        let mut actual = block.users(value).to_vec();
        expected.sort_unstable();
        actual.sort_unstable();
        if expected != actual {
            return Err(VerifyError::BadUserList { value });
        }
    }
    Ok(())
}
