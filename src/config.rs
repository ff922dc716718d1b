use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoordError, Result};

/// How sharding items are spread over the available instances.
///
/// An unrecognised name read back from the registry deserializes as
/// [`ShardingStrategyType::AverageAllocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardingStrategyType {
    AverageAllocation,
    RoundRobin,
    Odevity,
}

impl Default for ShardingStrategyType {
    fn default() -> Self {
        ShardingStrategyType::AverageAllocation
    }
}

impl std::fmt::Display for ShardingStrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardingStrategyType::AverageAllocation => write!(f, "AVERAGE_ALLOCATION"),
            ShardingStrategyType::RoundRobin => write!(f, "ROUND_ROBIN"),
            ShardingStrategyType::Odevity => write!(f, "ODEVITY"),
        }
    }
}

impl std::str::FromStr for ShardingStrategyType {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVERAGE_ALLOCATION" | "AVERAGE" => Ok(ShardingStrategyType::AverageAllocation),
            "ROUND_ROBIN" => Ok(ShardingStrategyType::RoundRobin),
            "ODEVITY" => Ok(ShardingStrategyType::Odevity),
            other => Err(CoordError::InvalidConfig(format!(
                "unknown sharding strategy '{}'",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ShardingStrategyType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(name.parse().unwrap_or_else(|_| {
            tracing::warn!(strategy = %name, "Unknown sharding strategy, using average allocation");
            ShardingStrategyType::AverageAllocation
        }))
    }
}

/// Job configuration shared by every instance through the registry.
///
/// The copy stored under `/{job}/config` is authoritative once a job has been
/// registered, unless a starting instance sets `overwrite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub job_name: String,
    /// Identifies the implementation behind the job. Two deployments using the
    /// same job name with different types is a configuration conflict.
    pub job_type: String,
    pub sharding_total_count: u32,
    /// `"0=A,1=B"` style per-item parameters.
    pub sharding_item_parameters: String,
    pub job_parameter: String,
    pub monitor_execution: bool,
    pub failover: bool,
    pub misfire: bool,
    /// Tolerated clock skew against the registry, -1 disables the check.
    pub max_time_diff_seconds: i64,
    pub job_sharding_strategy_type: ShardingStrategyType,
    pub job_error_handler_type: String,
    /// Reconciliation period, 0 disables reconciliation.
    pub reconcile_interval_minutes: u64,
    /// Only instances carrying this label take sharding items.
    pub label: Option<String>,
    pub disabled: bool,
    pub overwrite: bool,
    pub description: String,
    /// Local fixed-rate execution tick, 0 means trigger-only.
    pub execution_interval_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            job_type: "SIMPLE".to_string(),
            sharding_total_count: 1,
            sharding_item_parameters: String::new(),
            job_parameter: String::new(),
            monitor_execution: true,
            failover: false,
            misfire: true,
            max_time_diff_seconds: -1,
            job_sharding_strategy_type: ShardingStrategyType::AverageAllocation,
            job_error_handler_type: "LOG".to_string(),
            reconcile_interval_minutes: 1,
            label: None,
            disabled: false,
            overwrite: false,
            description: String::new(),
            execution_interval_ms: 0,
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, sharding_total_count: u32) -> Self {
        Self {
            job_name: job_name.into(),
            sharding_total_count,
            ..Default::default()
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.sharding_item_parameters = parameters.into();
        self
    }

    pub fn with_job_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.job_parameter = parameter.into();
        self
    }

    pub fn with_monitor_execution(mut self, enabled: bool) -> Self {
        self.monitor_execution = enabled;
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn with_misfire(mut self, enabled: bool) -> Self {
        self.misfire = enabled;
        self
    }

    pub fn with_max_time_diff_seconds(mut self, seconds: i64) -> Self {
        self.max_time_diff_seconds = seconds;
        self
    }

    pub fn with_strategy(mut self, strategy: ShardingStrategyType) -> Self {
        self.job_sharding_strategy_type = strategy;
        self
    }

    pub fn with_error_handler(mut self, handler_type: impl Into<String>) -> Self {
        self.job_error_handler_type = handler_type.into();
        self
    }

    pub fn with_reconcile_interval_minutes(mut self, minutes: u64) -> Self {
        self.reconcile_interval_minutes = minutes;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_execution_interval_ms(mut self, interval_ms: u64) -> Self {
        self.execution_interval_ms = interval_ms;
        self
    }

    /// Reject configurations that can never be scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(CoordError::InvalidConfig("job name is empty".to_string()));
        }
        if self.job_name.contains('/') {
            return Err(CoordError::InvalidConfig(format!(
                "job name '{}' must not contain '/'",
                self.job_name
            )));
        }
        parse_item_parameters(&self.sharding_item_parameters)?;
        Ok(())
    }

    /// Item parameters keyed by sharding item.
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        parse_item_parameters(&self.sharding_item_parameters)
    }

    /// Whether a change from `previous` to `self` invalidates the assignment.
    pub fn requires_resharding_from(&self, previous: &JobConfig) -> bool {
        self.sharding_total_count != previous.sharding_total_count
            || self.job_sharding_strategy_type != previous.job_sharding_strategy_type
            || self.label != previous.label
    }
}

/// Parse `"0=A,1=B"` into an item → parameter map.
pub fn parse_item_parameters(raw: &str) -> Result<BTreeMap<u32, String>> {
    let mut result = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (item, value) = pair.split_once('=').ok_or_else(|| {
            CoordError::InvalidConfig(format!(
                "sharding item parameter '{}' is not in 'item=value' format",
                pair
            ))
        })?;
        let item: u32 = item.trim().parse().map_err(|_| {
            CoordError::InvalidConfig(format!("sharding item '{}' is not a number", item.trim()))
        })?;
        result.insert(item, value.trim().to_string());
    }
    Ok(result)
}

/// Process-local timing of the coordination loops.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub election_retry_interval_ms: u64,
    pub election_max_attempts: u32,
    pub latch_timeout_ms: u64,
    pub running_wait_timeout_ms: u64,
    pub leader_poll_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            election_retry_interval_ms: 100,
            election_max_attempts: 50,
            latch_timeout_ms: 5_000,
            running_wait_timeout_ms: 5_000,
            leader_poll_interval_ms: 100,
        }
    }
}

impl CoordinatorConfig {
    pub fn latch_timeout(&self) -> Duration {
        Duration::from_millis(self.latch_timeout_ms)
    }

    pub fn running_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.running_wait_timeout_ms)
    }

    pub fn leader_poll_interval(&self) -> Duration {
        Duration::from_millis(self.leader_poll_interval_ms)
    }
}
