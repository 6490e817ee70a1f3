//! End-to-end scenarios: graph building, conversion, extraction handling,
//! and the attempt driver over realistic probabilistic-kernel blocks.

use lanefuse::ir::verify::verify;
use lanefuse::ir::{Block, Opcode, Type, ValueId};
use lanefuse::slp::builder::GraphBuilder;
use lanefuse::slp::conversion::ConversionManager;
use lanefuse::slp::cost::UnitCostModel;
use lanefuse::slp::pattern::{default_patterns, BroadcastSuperword, SlpPattern};
use lanefuse::slp::seeding::{SameOpcodeSeeder, SeedPolicy};
use lanefuse::slp::vectorize_block;
use lanefuse::SlpConfig;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn count_opcode(block: &Block, pred: impl Fn(&Opcode) -> bool) -> usize {
    block
        .schedule()
        .iter()
        .filter(|&&op| pred(&block.op(op).opcode))
        .count()
}

/// A miniature sum-product kernel: out[i] = w0 * in[i] + w1 * in[i + 4],
/// evaluated for four samples in a row.
fn sum_product_block() -> (Block, Vec<ValueId>) {
    let mut b = Block::new();
    let input = b.add_argument(Type::Buffer);
    let output = b.add_argument(Type::Buffer);
    let w0 = b.append(Opcode::ConstF64(0.3), &[], Some(Type::F64));
    let w0 = b.result(w0).unwrap();
    let w1 = b.append(Opcode::ConstF64(0.7), &[], Some(Type::F64));
    let w1 = b.result(w1).unwrap();
    let mut adds = Vec::new();
    for i in 0..4u32 {
        let lo = b.append(Opcode::BatchRead { index: i }, &[input], Some(Type::F64));
        let lo = b.result(lo).unwrap();
        let hi = b.append(
            Opcode::BatchRead { index: i + 4 },
            &[input],
            Some(Type::F64),
        );
        let hi = b.result(hi).unwrap();
        let m0 = b.append(Opcode::Mul, &[lo, w0], Some(Type::F64));
        let m0 = b.result(m0).unwrap();
        let m1 = b.append(Opcode::Mul, &[hi, w1], Some(Type::F64));
        let m1 = b.result(m1).unwrap();
        let add = b.append(Opcode::Add, &[m0, m1], Some(Type::F64));
        let add = b.result(add).unwrap();
        b.append(Opcode::BatchWrite { index: i }, &[output, add], None);
        adds.push(add);
    }
    (b, adds)
}

#[test]
fn graph_building_is_deterministic() {
    let (b, adds) = sum_product_block();
    let config = SlpConfig::default();
    let first = GraphBuilder::build(&b, &config, &adds);
    let second = GraphBuilder::build(&b, &config, &adds);

    assert_eq!(first.num_words(), second.num_words());
    assert_eq!(first.num_nodes(), second.num_nodes());
    for id in 0..first.num_words() {
        assert_eq!(first.word(id).lanes(), second.word(id).lanes());
        assert_eq!(first.word(id).operands(), second.word(id).operands());
    }
}

#[test]
fn trivial_splat_produces_one_broadcast_and_no_extraction() {
    let mut b = Block::new();
    let buf = b.add_argument(Type::Buffer);
    let read = b.append(Opcode::BatchRead { index: 0 }, &[buf], Some(Type::F64));
    let read = b.result(read).unwrap();
    let log = b.append(Opcode::Log, &[read], Some(Type::F64));
    let _keep = b.result(log).unwrap();

    let config = SlpConfig::default();
    let mut cost = UnitCostModel::new();
    let mut graph = GraphBuilder::build(&b, &config, &[read, read, read, read]);
    assert_eq!(graph.num_words(), 1);
    assert!(graph.word(graph.root()).splattable());

    let mut mgr = ConversionManager::new();
    mgr.init_conversion(&b, &graph);
    let pattern = BroadcastSuperword;
    let root = graph.root();
    mgr.setup_conversion_for(&mut b, &mut graph, root, &pattern, &mut cost)
        .unwrap();
    let vector = pattern.apply(&mut b, &graph, root, &mut mgr).unwrap();
    mgr.update(&mut b, &graph, root, vector, &pattern, &mut cost)
        .unwrap();
    mgr.finish_conversion(&mut b);

    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::Splat)), 1);
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::ExtractLane)), 0);
    // The scalar read stays: it feeds both the splat and the scalar log.
    assert!(b.is_scheduled(b.defining_op(read).unwrap()));
    verify(&b).unwrap();
}

#[test]
fn consecutive_reads_fuse_into_a_wide_load_with_lazy_extraction() {
    init_logging();
    let mut b = Block::new();
    let input = b.add_argument(Type::Buffer);
    let output = b.add_argument(Type::Buffer);
    let mut logs = Vec::new();
    for i in 0..4u32 {
        let read = b.append(Opcode::BatchRead { index: i }, &[input], Some(Type::F64));
        let read = b.result(read).unwrap();
        let log = b.append(Opcode::Log, &[read], Some(Type::F64));
        logs.push(b.result(log).unwrap());
    }
    // One lane value escapes the graph through a scalar consumer chain.
    let escape = b.append(Opcode::Mul, &[logs[2], logs[2]], Some(Type::F64));
    let escape = b.result(escape).unwrap();
    b.append(Opcode::BatchWrite { index: 0 }, &[output, escape], None);

    struct LogSeed(Vec<ValueId>);
    impl SeedPolicy for LogSeed {
        fn seeds(&self, _block: &Block, _config: &SlpConfig) -> Vec<Vec<ValueId>> {
            vec![self.0.clone()]
        }
    }

    let config = SlpConfig::default();
    let mut cost = UnitCostModel::new();
    let patterns = default_patterns();
    let stats = vectorize_block(&mut b, &config, &mut cost, &patterns, &LogSeed(logs)).unwrap();

    assert!(stats.changed());
    assert_eq!(
        count_opcode(&b, |o| matches!(o, Opcode::BatchReadVec { .. })),
        1
    );
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::VecLog)), 1);
    // Only the escaping lane is bridged back, with a single extraction.
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::ExtractLane)), 1);
    // The scalar reads and logs lost their users and are gone.
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::BatchRead { .. })), 0);
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::Log)), 0);
    verify(&b).unwrap();
}

#[test]
fn unprofitable_extraction_keeps_the_original_scalar() {
    let mut b = Block::new();
    let input = b.add_argument(Type::Buffer);
    let output = b.add_argument(Type::Buffer);
    // The weight is free to recompute, so bridging it out of the vector
    // never pays off.
    let w = b.append(Opcode::ConstF64(0.5), &[], Some(Type::F64));
    let w = b.result(w).unwrap();
    let mut muls = Vec::new();
    for i in 0..4u32 {
        let read = b.append(Opcode::BatchRead { index: i }, &[input], Some(Type::F64));
        let read = b.result(read).unwrap();
        let mul = b.append(Opcode::Mul, &[read, w], Some(Type::F64));
        let mul = b.result(mul).unwrap();
        b.append(Opcode::BatchWrite { index: i }, &[output, mul], None);
        muls.push(mul);
    }
    // The weight also escapes to a scalar consumer outside the graph.
    b.append(Opcode::BatchWrite { index: 4 }, &[output, w], None);

    struct MulSeed(Vec<ValueId>);
    impl SeedPolicy for MulSeed {
        fn seeds(&self, _block: &Block, _config: &SlpConfig) -> Vec<Vec<ValueId>> {
            vec![self.0.clone()]
        }
    }

    let config = SlpConfig::default();
    let mut cost = UnitCostModel::new();
    let patterns = default_patterns();
    let w_op = b.defining_op(w).unwrap();
    let stats =
        vectorize_block(&mut b, &config, &mut cost, &patterns, &MulSeed(muls.clone())).unwrap();

    assert!(stats.changed());
    // The weight constant survives and the escaping store still reads it;
    // the expensive mul lanes are the only values bridged back.
    assert!(b.is_scheduled(w_op));
    assert!(b.users(w).iter().any(|&op| matches!(b.op(op).opcode, Opcode::BatchWrite { .. })));
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::ExtractLane)), 4);
    assert_eq!(count_opcode(&b, |o| matches!(o, Opcode::Mul)), 0);
    verify(&b).unwrap();
}

#[test]
fn sum_product_kernel_vectorizes_end_to_end() {
    init_logging();
    let (mut b, _) = sum_product_block();
    let scalar_ops = b.schedule().len();

    let config = SlpConfig::default();
    let mut cost = UnitCostModel::new();
    let patterns = default_patterns();
    let stats = vectorize_block(
        &mut b,
        &config,
        &mut cost,
        &patterns,
        &SameOpcodeSeeder::new(),
    )
    .unwrap();

    assert!(stats.changed());
    assert!(stats.superwords_converted >= 3);
    assert!(stats.ops_erased > 0);
    assert!(b.schedule().len() < scalar_ops + stats.superwords_converted);
    // Stores stay scalar and every store still receives a defined value.
    assert_eq!(
        count_opcode(&b, |o| matches!(o, Opcode::BatchWrite { .. })),
        4
    );
    verify(&b).unwrap();

    // Re-linearization keeps every definition ahead of its uses.
    for &op in b.schedule() {
        for &operand in b.op(op).operands.iter() {
            if let Some(def) = b.defining_op(operand) {
                assert!(b.is_before(def, op));
            }
        }
    }
}

#[test]
fn vectorization_is_reproducible_across_runs() {
    let run = || {
        let (mut b, _) = sum_product_block();
        let config = SlpConfig::default();
        let mut cost = UnitCostModel::new();
        let patterns = default_patterns();
        vectorize_block(
            &mut b,
            &config,
            &mut cost,
            &patterns,
            &SameOpcodeSeeder::new(),
        )
        .unwrap();
        b.schedule()
            .iter()
            .map(|&op| b.op(op).opcode.name())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}
