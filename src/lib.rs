//! Superword-level parallelism (SLP) auto-vectorization engine.
//!
//! Given a block of scalar, data-parallel instructions, the engine discovers
//! groups of isomorphic operations that can be fused into fixed-width vector
//! instructions ("superwords"), decides whether fusing them pays off, and
//! rewrites the block in place while preserving data dependences.
//!
//! The pipeline per seed: [`slp::builder::GraphBuilder`] grows the superword
//! DAG, [`slp::cost::CostModel`] prices scalars, superwords and extractions,
//! and [`slp::conversion::ConversionManager`] applies
//! [`slp::pattern::SlpPattern`]s in dependency order and re-linearizes the
//! block. [`slp::vectorize_block`] drives repeated attempts over seeds from a
//! [`slp::seeding::SeedPolicy`].

pub mod config;
pub mod error;
pub mod ir;
pub mod slp;

pub use config::SlpConfig;
pub use error::{Result, SlpError};
