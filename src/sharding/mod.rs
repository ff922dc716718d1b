//! Sharding item allocation.
//!
//! - [`strategy`]: pure functions from (instances, job name, total count) to
//!   an assignment
//! - [`service`]: the leader-only resharding state machine and assignment reads
//! - [`context`]: per-run [`ShardingContexts`] handed to job code

pub mod context;
pub mod service;
pub mod strategy;

pub use context::{ExecutionContextService, ShardingContext, ShardingContexts};
pub use service::{ShardingOutcome, ShardingService};
pub use strategy::{
    strategy_for, AverageAllocation, JobShardingStrategy, OdevityByName,
    RoundRobinByName, ShardingAssignment,
};
