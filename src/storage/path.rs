/// Builds registry paths for one job. Every node of a job lives under `/{job}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    job_name: String,
}

pub const CONFIG_NODE: &str = "config";
pub const SERVERS_NODE: &str = "servers";
pub const INSTANCES_NODE: &str = "instances";
pub const SHARDING_NODE: &str = "sharding";
pub const TRIGGER_NODE: &str = "trigger";
pub const SHUTDOWN_NODE: &str = "shutdown";

pub const LEADER_ELECTION_INSTANCE: &str = "leader/election/instance";
pub const LEADER_ELECTION_LATCH: &str = "leader/election/latch";
pub const SHARDING_NECESSARY: &str = "leader/sharding/necessary";
pub const SHARDING_PROCESSING: &str = "leader/sharding/processing";
pub const FAILOVER_ITEMS_ROOT: &str = "leader/failover/items";

impl JobNodePath {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn root(&self) -> String {
        format!("/{}", self.job_name)
    }

    /// Full path of a node relative to the job root.
    pub fn full_path(&self, node: &str) -> String {
        format!("/{}/{}", self.job_name, node)
    }

    /// Job-relative form of a full path, `None` if it belongs to another job.
    pub fn relative<'a>(&self, full_path: &'a str) -> Option<&'a str> {
        full_path
            .strip_prefix('/')
            .and_then(|p| p.strip_prefix(self.job_name.as_str()))
            .and_then(|p| p.strip_prefix('/'))
    }

    pub fn server_node(ip: &str) -> String {
        format!("{}/{}", SERVERS_NODE, ip)
    }

    pub fn instance_node(instance_id: &str) -> String {
        format!("{}/{}", INSTANCES_NODE, instance_id)
    }

    pub fn sharding_item_root(item: u32) -> String {
        format!("{}/{}", SHARDING_NODE, item)
    }

    pub fn sharding_instance_node(item: u32) -> String {
        format!("{}/{}/instance", SHARDING_NODE, item)
    }

    pub fn running_node(item: u32) -> String {
        format!("{}/{}/running", SHARDING_NODE, item)
    }

    pub fn misfire_node(item: u32) -> String {
        format!("{}/{}/misfire", SHARDING_NODE, item)
    }

    pub fn disabled_node(item: u32) -> String {
        format!("{}/{}/disabled", SHARDING_NODE, item)
    }

    /// Records which instance took over `item` through failover.
    pub fn failover_node(item: u32) -> String {
        format!("{}/{}/failover", SHARDING_NODE, item)
    }

    /// Queue entry of an abandoned `item`.
    pub fn failover_item_node(item: u32) -> String {
        format!("{}/{}", FAILOVER_ITEMS_ROOT, item)
    }

    pub fn trigger_node(instance_id: &str) -> String {
        format!("{}/{}", TRIGGER_NODE, instance_id)
    }

    pub fn shutdown_node(instance_id: &str) -> String {
        format!("{}/{}", SHUTDOWN_NODE, instance_id)
    }

    /// Sharding item of a `sharding/{item}/...` relative path.
    pub fn parse_sharding_item(relative: &str) -> Option<u32> {
        relative
            .strip_prefix(SHARDING_NODE)?
            .strip_prefix('/')?
            .split('/')
            .next()?
            .parse()
            .ok()
    }

    pub fn is_config_path(relative: &str) -> bool {
        relative == CONFIG_NODE
    }

    pub fn is_server_path(relative: &str) -> bool {
        relative
            .strip_prefix(SERVERS_NODE)
            .map_or(false, |rest| rest.starts_with('/') && rest.len() > 1)
    }

    pub fn is_instance_path(relative: &str) -> bool {
        relative
            .strip_prefix(INSTANCES_NODE)
            .map_or(false, |rest| rest.starts_with('/') && rest.len() > 1)
    }

    /// Last path segment.
    pub fn leaf(relative: &str) -> &str {
        relative.rsplit('/').next().unwrap_or(relative)
    }
}
