use std::collections::BTreeMap;

use crate::config::ShardingStrategyType;
use crate::instance::JobInstance;

/// Items owned by each instance.
pub type ShardingAssignment = BTreeMap<JobInstance, Vec<u32>>;

/// Decides which instance owns which sharding item.
///
/// Implementations must be pure: the same instance list, job name and total
/// count always produce the same assignment, so a new leader recomputing
/// after a crash writes exactly what the old one would have.
pub trait JobShardingStrategy: Send + Sync {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment;

    fn strategy_type(&self) -> ShardingStrategyType;
}

/// Splits `total` items into contiguous blocks of `total / n`, then hands the
/// `total % n` leftovers to the first instances one each.
///
/// 3 instances, 10 items: `[0,1,2,9]`, `[3,4,5]`, `[6,7,8]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageAllocation;

impl AverageAllocation {
    fn allocate(instances: &[JobInstance], total: u32) -> ShardingAssignment {
        let mut result = ShardingAssignment::new();
        if instances.is_empty() {
            return result;
        }
        let n = instances.len() as u32;
        let per_instance = total / n;
        for (i, instance) in instances.iter().enumerate() {
            let start = i as u32 * per_instance;
            result.insert(instance.clone(), (start..start + per_instance).collect());
        }
        let assigned = per_instance * n;
        for (offset, item) in (assigned..total).enumerate() {
            if let Some(items) = result.get_mut(&instances[offset]) {
                items.push(item);
            }
        }
        result
    }
}

impl JobShardingStrategy for AverageAllocation {
    fn sharding(&self, instances: &[JobInstance], _job_name: &str, total: u32) -> ShardingAssignment {
        Self::allocate(instances, total)
    }

    fn strategy_type(&self) -> ShardingStrategyType {
        ShardingStrategyType::AverageAllocation
    }
}

/// Rotates the instance list by `|hash(job_name)| mod n` before averaging, so
/// jobs sharing a fleet do not all put item 0 on the same instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinByName;

impl JobShardingStrategy for RoundRobinByName {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment {
        if instances.is_empty() {
            return ShardingAssignment::new();
        }
        let offset = name_hash(job_name).unsigned_abs() as usize % instances.len();
        let mut rotated = instances.to_vec();
        rotated.rotate_left(offset);
        AverageAllocation::allocate(&rotated, total)
    }

    fn strategy_type(&self) -> ShardingStrategyType {
        ShardingStrategyType::RoundRobin
    }
}

/// Averages over the instance list in ascending order for odd name hashes and
/// descending order for even ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct OdevityByName;

impl JobShardingStrategy for OdevityByName {
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> ShardingAssignment {
        let mut ordered = instances.to_vec();
        if name_hash(job_name) % 2 == 0 {
            ordered.reverse();
        }
        AverageAllocation::allocate(&ordered, total)
    }

    fn strategy_type(&self) -> ShardingStrategyType {
        ShardingStrategyType::Odevity
    }
}

/// 32-bit `h = 31 * h + c` hash over UTF-16 code units. Stable across
/// processes and platforms, unlike `std`'s randomized hashers.
pub fn name_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

pub fn strategy_for(strategy_type: ShardingStrategyType) -> Box<dyn JobShardingStrategy> {
    match strategy_type {
        ShardingStrategyType::AverageAllocation => Box::new(AverageAllocation),
        ShardingStrategyType::RoundRobin => Box::new(RoundRobinByName),
        ShardingStrategyType::Odevity => Box::new(OdevityByName),
    }
}
