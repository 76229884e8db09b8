//! Transaction queue simulation on abstract inputs.
//!
//! The inputs to a sim are a transaction source (trait [`TxSource`]), a block
//! source (trait [`BlockSource`]), and the initial mempool state (a flat
//! `Vec<Tx>` whose dependency graph is expressed with vector indices).
//!
//! A transaction source emits transactions into the mempool queue, given a
//! time interval (implying that the source is time-homogeneous). A block
//! source models the discovery of blocks by miners.
//!
//! Miners are assumed to include transactions greedily by fee rate,
//! considering each transaction in isolation (no child-pays-for-parent),
//! subject to a minimum fee rate and a maximum block size given by a
//! [`BlockPolicy`].
//!
//! The output of a sim is a sequence of blocks, each represented by its
//! "stranding fee rate" (SFR): approximately the minimum fee rate required
//! for a transaction to be included in that block. From the SFR sequence the
//! queue metrics of interest are derived by the [`transient`] driver.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod indblock;
mod multitx;
mod queue;
mod ratefn;
#[allow(clippy::module_inception)]
mod sim;
pub mod transient;
mod unitx;
pub mod util;

pub use indblock::IndBlockSource;
pub use multitx::MultiTxSource;
pub use ratefn::{CapRateFn, MonotonicFn, RateFnPoints, TxRateFn};
pub use sim::Sim;
pub use transient::{TransientConfig, TransientSim};
pub use unitx::UniTxSource;

/// Fee rate in satoshis per kB.
pub type FeeRate = i64;

/// Transaction size in bytes.
pub type TxSize = i64;

/// Sentinel fee rate: infinitely high, never included.
pub const MAX_FEE_RATE: FeeRate = i64::MAX;

/// Sentinel tx size.
pub const MAX_TX_SIZE: TxSize = i64::MAX;

/// A simulation transaction. Parents are indices into the mempool vector the
/// tx belongs to; transactions emitted by a [`TxSource`] have no parents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tx {
    #[serde(rename = "feerate")]
    pub fee_rate: FeeRate,
    pub size: TxSize,
    #[serde(skip)]
    pub parents: Vec<usize>,
}

/// A miner's per-block policy. If a block won't include any txs regardless of
/// fee, set `min_fee_rate` to [`MAX_FEE_RATE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPolicy {
    pub min_fee_rate: FeeRate,
    pub max_block_size: TxSize,
}

/// A simulation tx source. For a given time interval `t`, `generate` returns
/// the transactions that arrived in that interval; e.g. with Poisson arrivals
/// the count is Poisson distributed with expected value `txrate * t`.
///
/// A null source (one which always generates zero txs) is permitted.
pub trait TxSource: Send + Sync {
    fn generate(&mut self, t: Duration) -> Vec<Tx>;

    /// Return `n` copies of this source with isolated random states, so that
    /// the copies are concurrent-safe and their randomness is not coupled.
    /// Copy seeds are derived deterministically from the source seed.
    fn copy(&self, n: usize) -> Vec<Box<dyn TxSource>>;

    /// A copy of this source carrying a new seed; the root of a fresh
    /// family of streams.
    fn reseed(&self, seed: u64) -> Box<dyn TxSource>;

    /// The minimum tx size this source will generate; used to optimize
    /// [`Sim`] block termination.
    fn min_size(&self) -> TxSize;

    /// The reverse cumulative transaction byte rate (bytes/s) with respect to
    /// fee rate.
    fn rate_fn(&self) -> TxRateFn;

    /// JSON description of the fitted source, for the service surface.
    fn describe(&self) -> serde_json::Value;
}

/// A simulation block source.
pub trait BlockSource: Send + Sync {
    /// Draw the next inter-block time and block policy.
    fn next_block(&mut self) -> (Duration, BlockPolicy);

    /// Return `n` copies with isolated random states; see [`TxSource::copy`].
    fn copy(&self, n: usize) -> Vec<Box<dyn BlockSource>>;

    /// A copy of this source carrying a new seed; see [`TxSource::reseed`].
    fn reseed(&self, seed: u64) -> Box<dyn BlockSource>;

    /// The cumulative capacity byte rate (bytes/s) with respect to fee rate.
    fn rate_fn(&self) -> CapRateFn;

    /// Expected blocks per second.
    fn block_rate(&self) -> f64;

    /// JSON description of the fitted source, for the service surface.
    fn describe(&self) -> serde_json::Value;
}
