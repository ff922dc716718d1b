//! Presence of job instances and servers in the registry.
//!
//! - **Instances** are ephemeral `instances/{id}` nodes: they disappear with the
//!   session of a crashed or disconnected process
//! - **Servers** are persistent `servers/{ip}` nodes holding `ENABLED` or
//!   `DISABLED`; a server is available when enabled and hosting at least one
//!   live instance

pub mod server;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::path::INSTANCES_NODE;
use crate::storage::{JobNodePath, JobNodeStorage};

pub use server::{ServerService, ServerStatus};

pub const DELIMITER: &str = "@-@";

/// One running process of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: String,
    pub server_ip: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl JobInstance {
    /// Instance of the current process on `server_ip`, id `ip@-@pid`.
    pub fn new(server_ip: impl Into<String>) -> Self {
        let server_ip = server_ip.into();
        Self {
            instance_id: format!("{}{}{}", server_ip, DELIMITER, std::process::id()),
            server_ip,
            labels: Vec::new(),
        }
    }

    pub fn with_id(instance_id: impl Into<String>, server_ip: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            server_ip: server_ip.into(),
            labels: Vec::new(),
        }
    }

    /// Rebuild an instance from its id alone, taking the ip from the prefix.
    pub fn from_id(instance_id: &str) -> Self {
        let server_ip = instance_id
            .split(DELIMITER)
            .next()
            .unwrap_or(instance_id)
            .to_string();
        Self::with_id(instance_id, server_ip)
    }

    /// Attach comma-separated labels.
    pub fn with_labels(mut self, labels: &str) -> Self {
        self.labels = labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl std::fmt::Display for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instance_id)
    }
}

/// Value of an `instances/{id}` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceNode {
    #[serde(flatten)]
    instance: JobInstance,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InstanceService {
    storage: JobNodeStorage,
    local: JobInstance,
    servers: Arc<ServerService>,
}

impl InstanceService {
    pub fn new(storage: JobNodeStorage, local: JobInstance, servers: Arc<ServerService>) -> Self {
        Self {
            storage,
            local,
            servers,
        }
    }

    pub fn local_instance(&self) -> &JobInstance {
        &self.local
    }

    pub fn servers(&self) -> &Arc<ServerService> {
        &self.servers
    }

    /// Register this instance as live.
    pub async fn persist_online(&self) -> Result<()> {
        let node = InstanceNode {
            instance: self.local.clone(),
            started_at: Utc::now(),
        };
        self.storage
            .fill_ephemeral_job_node(
                &JobNodePath::instance_node(&self.local.instance_id),
                &serde_json::to_string(&node)?,
            )
            .await?;
        tracing::info!(
            job = %self.storage.job_name(),
            instance_id = %self.local.instance_id,
            "Instance online"
        );
        Ok(())
    }

    pub async fn remove_instance(&self) -> Result<bool> {
        self.storage
            .remove_job_node_if_existed(&JobNodePath::instance_node(&self.local.instance_id))
            .await
    }

    pub async fn is_local_job_instance_existed(&self) -> Result<bool> {
        self.storage
            .is_job_node_existed(&JobNodePath::instance_node(&self.local.instance_id))
            .await
    }

    pub async fn get_live_instance_ids(&self) -> Result<Vec<String>> {
        self.storage.get_job_node_children_keys(INSTANCES_NODE).await
    }

    /// Every live instance, sorted by id.
    pub async fn get_live_instances(&self) -> Result<Vec<JobInstance>> {
        let mut result = Vec::new();
        for id in self.get_live_instance_ids().await? {
            let data = self
                .storage
                .get_job_node_data(&JobNodePath::instance_node(&id))
                .await?;
            let instance = match data.as_deref().map(serde_json::from_str::<InstanceNode>) {
                Some(Ok(node)) => node.instance,
                // Vanished between listing and reading, or written by an older
                // version: the id still carries the ip.
                Some(Err(_)) => JobInstance::from_id(&id),
                None => continue,
            };
            result.push(instance);
        }
        result.sort();
        Ok(result)
    }

    /// Live instances on enabled servers that carry `label` (if any), in the
    /// stable order sharding strategies expect.
    pub async fn get_available_job_instances(&self, label: Option<&str>) -> Result<Vec<JobInstance>> {
        let mut result = Vec::new();
        for instance in self.get_live_instances().await? {
            if !self.servers.is_enable_server(&instance.server_ip).await? {
                continue;
            }
            if let Some(label) = label {
                if !instance.has_label(label) {
                    continue;
                }
            }
            result.push(instance);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn service(registry: &MemoryRegistry, instance: JobInstance) -> InstanceService {
        let storage = JobNodeStorage::new(registry.session(), "job");
        let servers = Arc::new(ServerService::new(
            storage.clone(),
            instance.server_ip.clone(),
        ));
        InstanceService::new(storage, instance, servers)
    }

    #[test]
    fn instance_id_format() {
        let instance = JobInstance::new("10.0.0.1");
        assert!(instance.instance_id.starts_with("10.0.0.1@-@"));
        assert_eq!(
            JobInstance::from_id("10.0.0.2@-@77").server_ip,
            "10.0.0.2".to_string()
        );
    }

    #[test]
    fn labels_are_parsed() {
        let instance = JobInstance::with_id("a@-@1", "a").with_labels("gpu, ssd,");
        assert_eq!(instance.labels, vec!["gpu".to_string(), "ssd".to_string()]);
        assert!(instance.has_label("ssd"));
        assert!(!instance.has_label("hdd"));
    }

    #[tokio::test]
    async fn available_instances_require_enabled_server() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, JobInstance::with_id("10.0.0.1@-@1", "10.0.0.1"));
        let b = service(&registry, JobInstance::with_id("10.0.0.2@-@1", "10.0.0.2"));
        a.persist_online().await.unwrap();
        b.persist_online().await.unwrap();
        a.servers.persist_online(true).await.unwrap();
        b.servers.persist_online(true).await.unwrap();
        b.servers.disable_server("10.0.0.2").await.unwrap();

        let available = a.get_available_job_instances(None).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].instance_id, "10.0.0.1@-@1");
        assert_eq!(a.get_live_instance_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn available_instances_filter_by_label() {
        let registry = MemoryRegistry::new();
        let a = service(
            &registry,
            JobInstance::with_id("10.0.0.1@-@1", "10.0.0.1").with_labels("gpu"),
        );
        let b = service(&registry, JobInstance::with_id("10.0.0.1@-@2", "10.0.0.1"));
        a.persist_online().await.unwrap();
        b.persist_online().await.unwrap();
        a.servers.persist_online(true).await.unwrap();

        let gpu = a.get_available_job_instances(Some("gpu")).await.unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].instance_id, "10.0.0.1@-@1");
        assert_eq!(a.get_available_job_instances(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_instance_takes_it_offline() {
        let registry = MemoryRegistry::new();
        let a = service(&registry, JobInstance::with_id("10.0.0.1@-@1", "10.0.0.1"));
        a.persist_online().await.unwrap();
        assert!(a.is_local_job_instance_existed().await.unwrap());
        assert!(a.remove_instance().await.unwrap());
        assert!(!a.is_local_job_instance_existed().await.unwrap());
    }
}
