use crate::config::SlpConfig;
use crate::ir::{Block, ValueId};
use log::debug;
use rustc_hash::FxHashSet;
use std::cmp::Reverse;

/// Supplies candidate seed tuples for vectorization attempts. Each seed is a
/// full-width group of scalar values the graph builder starts from.
pub trait SeedPolicy {
    fn seeds(&self, block: &Block, config: &SlpConfig) -> Vec<Vec<ValueId>>;
}

/// Groups vectorizable operation results by opcode, orders each group by
/// descending operand subtree size, and cuts it into width-sized chunks.
/// Chunks with an internal dependence are skipped unless topological mixing
/// is allowed.
#[derive(Debug, Default)]
pub struct SameOpcodeSeeder;

impl SameOpcodeSeeder {
    pub fn new() -> Self {
        Self
    }
}

impl SeedPolicy for SameOpcodeSeeder {
    fn seeds(&self, block: &Block, config: &SlpConfig) -> Vec<Vec<ValueId>> {
        // Group in first-appearance order so the result is deterministic.
        let mut groups: Vec<(&'static str, Vec<ValueId>)> = Vec::new();
        for &op in block.schedule() {
            let operation = block.op(op);
            if !operation.opcode.vectorizable() || operation.opcode.constant_like() {
                continue;
            }
            let Some(result) = operation.result else {
                continue;
            };
            let name = operation.opcode.name();
            match groups.iter_mut().find(|(group, _)| *group == name) {
                Some((_, members)) => members.push(result),
                None => groups.push((name, vec![result])),
            }
        }

        let mut seeds: Vec<(usize, Vec<ValueId>)> = Vec::new();
        for (name, mut members) in groups {
            // Larger subtrees first; the sort is stable, so program order
            // breaks ties.
            members.sort_by_key(|&value| Reverse(subtree_size(block, value)));
            for chunk in members.chunks_exact(config.width) {
                if !config.allow_topological_mixing && has_internal_dependence(block, chunk) {
                    debug!("skipping {name} seed with an internal dependence");
                    continue;
                }
                let size = chunk.iter().map(|&v| subtree_size(block, v)).sum();
                seeds.push((size, chunk.to_vec()));
            }
        }
        // Attempt the deepest seeds first: they root the largest graphs and
        // subsume the shallow ones.
        seeds.sort_by_key(|&(size, _)| Reverse(size));
        seeds.into_iter().map(|(_, seed)| seed).collect()
    }
}

fn subtree_size(block: &Block, value: ValueId) -> usize {
    let mut seen = FxHashSet::default();
    let mut worklist = vec![value];
    while let Some(value) = worklist.pop() {
        if !seen.insert(value) {
            continue;
        }
        if let Some(op) = block.defining_op(value) {
            worklist.extend(block.op(op).operands.iter().copied());
        }
    }
    seen.len()
}

/// Whether any chunk member transitively depends on another chunk member.
fn has_internal_dependence(block: &Block, chunk: &[ValueId]) -> bool {
    chunk.iter().any(|&value| {
        let Some(op) = block.defining_op(value) else {
            return false;
        };
        let mut seen = FxHashSet::default();
        let mut worklist: Vec<ValueId> = block.op(op).operands.to_vec();
        while let Some(operand) = worklist.pop() {
            if !seen.insert(operand) {
                continue;
            }
            if chunk.contains(&operand) {
                return true;
            }
            if let Some(def) = block.defining_op(operand) {
                worklist.extend(block.op(def).operands.iter().copied());
            }
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Opcode, Type};

    #[test]
    fn seeds_share_an_opcode_and_fill_the_width() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        let mut muls = Vec::new();
        for i in 0..4 {
            let read = b.append(Opcode::BatchRead { index: i }, &[buf], Some(Type::F64));
            let read = b.result(read).unwrap();
            let mul = b.append(Opcode::Mul, &[read, read], Some(Type::F64));
            muls.push(b.result(mul).unwrap());
        }
        let config = SlpConfig::default();
        let seeds = SameOpcodeSeeder::new().seeds(&b, &config);

        // One full read chunk and one full mul chunk.
        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().any(|seed| seed == &muls));
        for seed in &seeds {
            assert_eq!(seed.len(), config.width);
            let name = b.def_opcode(seed[0]).unwrap().name();
            assert!(seed
                .iter()
                .all(|&v| b.def_opcode(v).unwrap().name() == name));
        }
    }

    #[test]
    fn dependent_values_never_share_a_seed() {
        let mut b = Block::new();
        let x = b.add_argument(Type::F64);
        // A chain of adds: each depends on the previous one.
        let mut last = x;
        for _ in 0..4 {
            let add = b.append(Opcode::Add, &[last, x], Some(Type::F64));
            last = b.result(add).unwrap();
        }
        let config = SlpConfig::default();
        let seeds = SameOpcodeSeeder::new().seeds(&b, &config);
        assert!(seeds.is_empty());

        let mixing = SlpConfig {
            allow_topological_mixing: true,
            ..SlpConfig::default()
        };
        assert_eq!(SameOpcodeSeeder::new().seeds(&b, &mixing).len(), 1);
    }

    #[test]
    fn leftover_values_form_no_partial_seed() {
        let mut b = Block::new();
        let buf = b.add_argument(Type::Buffer);
        for i in 0..6 {
            b.append(Opcode::BatchRead { index: i }, &[buf], Some(Type::F64));
        }
        let config = SlpConfig::default();
        let seeds = SameOpcodeSeeder::new().seeds(&b, &config);
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].len(), 4);
    }
}
