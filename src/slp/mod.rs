//! Superword-level parallelism: builds a dependency graph from a seed tuple
//! of isomorphic scalar values, plans a vector realization for every
//! superword, and rewrites the block only when a complete, profitable plan
//! exists.

pub mod builder;
pub mod conversion;
pub mod cost;
pub mod graph;
pub mod pattern;
pub mod seeding;

use crate::config::SlpConfig;
use crate::error::Result;
use crate::ir::verify::verify;
use crate::ir::{Block, OpId, ValueId};
use crate::slp::builder::GraphBuilder;
use crate::slp::conversion::ConversionManager;
use crate::slp::cost::CostModel;
use crate::slp::graph::{SlpGraph, SuperwordId};
use crate::slp::pattern::SlpPattern;
use crate::slp::seeding::SeedPolicy;
use log::{debug, info};
use rustc_hash::FxHashSet;

#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizeStats {
    pub attempts: usize,
    pub successes: usize,
    pub superwords_converted: usize,
    pub ops_erased: usize,
}

impl VectorizeStats {
    pub fn changed(&self) -> bool {
        self.successes > 0
    }
}

/// Run vectorization attempts over `block` until the seed supply, the
/// attempt bound, or the success bound runs out.
pub fn vectorize_block(
    block: &mut Block,
    config: &SlpConfig,
    cost: &mut dyn CostModel,
    patterns: &[Box<dyn SlpPattern>],
    seeder: &dyn SeedPolicy,
) -> Result<VectorizeStats> {
    let mut stats = VectorizeStats::default();
    let seeds = seeder.seeds(block, config);
    debug!("{} candidate seeds", seeds.len());
    for seed in seeds {
        if stats.attempts >= config.max_attempts
            || stats.successes >= config.max_successful_iterations
        {
            break;
        }
        stats.attempts += 1;
        cost.reset();
        if let Some(attempt) = vectorize_seed(block, config, cost, patterns, &seed)? {
            stats.successes += 1;
            stats.superwords_converted += attempt.superwords_converted;
            stats.ops_erased += attempt.ops_erased;
        }
    }
    info!(
        "vectorization done: {}/{} attempts committed, {} superwords, {} scalar ops erased",
        stats.successes, stats.attempts, stats.superwords_converted, stats.ops_erased
    );
    Ok(stats)
}

struct AttemptOutcome {
    superwords_converted: usize,
    ops_erased: usize,
}

/// One vectorization attempt. Returns `None` when the attempt is abandoned
/// (no graph, no complete plan, or no profit); the block is untouched in
/// that case. Errors indicate an internal contract violation, never a
/// merely unprofitable seed.
fn vectorize_seed(
    block: &mut Block,
    config: &SlpConfig,
    cost: &mut dyn CostModel,
    patterns: &[Box<dyn SlpPattern>],
    seed: &[ValueId],
) -> Result<Option<AttemptOutcome>> {
    if seed.len() != config.width
        || seed
            .iter()
            .any(|&value| !value_vectorizable(block, value))
    {
        return Ok(None);
    }

    let mut graph = GraphBuilder::build(block, config, seed);
    let mut mgr = ConversionManager::new();
    mgr.init_conversion(block, &graph);
    let order = mgr.conversion_order().to_vec();

    // Plan a pattern for every superword before touching the block. The
    // broadcast-insert fallback makes a complete plan the common case, but a
    // host-supplied pattern set may leave gaps.
    let mut plan: Vec<(SuperwordId, &dyn SlpPattern, f64)> = Vec::with_capacity(order.len());
    for &word in &order {
        let mut best: Option<(f64, &dyn SlpPattern)> = None;
        for pattern in patterns {
            if !pattern.matches(block, &graph, word) {
                continue;
            }
            let price = cost.superword_cost(block, &graph, word, pattern.kind());
            if best.is_none_or(|(cheapest, _)| price < cheapest) {
                best = Some((price, &**pattern));
            }
        }
        match best {
            Some((price, pattern)) => plan.push((word, pattern, price)),
            None => {
                debug!("no pattern covers superword {word}, abandoning the attempt");
                return Ok(None);
            }
        }
    }

    if !plan_profitable(block, cost, &graph, &plan) {
        debug!("seed rejected, vector plan does not beat the scalar code");
        return Ok(None);
    }

    let ops_before = block.num_ops();
    for &(word, pattern, _) in &plan {
        mgr.setup_conversion_for(block, &mut graph, word, pattern, cost)?;
        let vector = pattern.apply(block, &graph, word, &mut mgr)?;
        mgr.update(block, &graph, word, vector, pattern, cost)?;
    }
    let ops_erased = erase_dead_scalar_ops(block, ops_before);
    mgr.finish_conversion(block);
    verify(block)?;

    Ok(Some(AttemptOutcome {
        superwords_converted: plan.len(),
        ops_erased,
    }))
}

fn value_vectorizable(block: &Block, value: ValueId) -> bool {
    block.value(value).ty.is_vectorizable()
        && block
            .def_opcode(value)
            .is_some_and(|opcode| opcode.vectorizable())
}

/// Accept the plan when the summed local pattern costs undercut the local
/// costs of the scalar operations the plan replaces.
fn plan_profitable(
    block: &Block,
    cost: &mut dyn CostModel,
    graph: &SlpGraph,
    plan: &[(SuperwordId, &dyn SlpPattern, f64)],
) -> bool {
    let vector_cost: f64 = plan.iter().map(|&(_, _, price)| price).sum();

    // Only patterns that supersede their lanes free up scalar work; the
    // broadcast variants keep their scalar inputs alive.
    let mut replaced: FxHashSet<OpId> = FxHashSet::default();
    for &(word, pattern, _) in plan {
        if !pattern.kind().replaces_scalars() {
            continue;
        }
        for &lane in graph.word(word).lanes() {
            if let Some(op) = block.defining_op(lane) {
                replaced.insert(op);
            }
        }
    }
    // Local cost of an operation is its subtree cost minus its operands'
    // subtree costs.
    let mut scalar_cost = 0.0;
    for &op in &replaced {
        let Some(result) = block.result(op) else {
            continue;
        };
        let mut local = cost.scalar_cost(block, result);
        for index in 0..block.op(op).operands.len() {
            let operand = block.op(op).operands[index];
            local -= cost.scalar_cost(block, operand);
        }
        scalar_cost += local;
    }
    vector_cost < scalar_cost
}

/// Erase pre-existing scalar operations that lost their last user to the
/// rewrite. Operations created by the conversion (ids at or past
/// `ops_before`) are the attempt's product and stay, even when nothing in
/// the block consumes them yet.
fn erase_dead_scalar_ops(block: &mut Block, ops_before: usize) -> usize {
    let mut erased = 0;
    loop {
        let dead: Vec<OpId> = block
            .schedule()
            .iter()
            .copied()
            .filter(|&op| {
                op < ops_before
                    && !block.op(op).opcode.has_side_effects()
                    && block
                        .result(op)
                        .is_some_and(|result| block.users(result).is_empty())
            })
            .collect();
        if dead.is_empty() {
            return erased;
        }
        for &op in dead.iter().rev() {
            block.erase_op(op);
        }
        erased += dead.len();
    }
}
