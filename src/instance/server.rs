use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};
use crate::instance::DELIMITER;
use crate::registry::CreateMode;
use crate::storage::path::{INSTANCES_NODE, SERVERS_NODE};
use crate::storage::{JobNodePath, JobNodeStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Enabled,
    Disabled,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Enabled => write!(f, "ENABLED"),
            ServerStatus::Disabled => write!(f, "DISABLED"),
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ENABLED" => Ok(ServerStatus::Enabled),
            "DISABLED" => Ok(ServerStatus::Disabled),
            other => Err(CoordError::Internal(format!("unknown server status '{}'", other))),
        }
    }
}

/// Persisted enabled/disabled state of the servers running a job.
#[derive(Debug, Clone)]
pub struct ServerService {
    storage: JobNodeStorage,
    local_ip: String,
}

impl ServerService {
    pub fn new(storage: JobNodeStorage, local_ip: impl Into<String>) -> Self {
        Self {
            storage,
            local_ip: local_ip.into(),
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Register the local server.
    ///
    /// An operator's `DISABLED` survives restarts: an enabled start only
    /// writes the node when it is missing.
    pub async fn persist_online(&self, enabled: bool) -> Result<()> {
        let node = JobNodePath::server_node(&self.local_ip);
        if enabled {
            self.storage
                .create_job_node_if_absent(
                    &node,
                    &ServerStatus::Enabled.to_string(),
                    CreateMode::Persistent,
                )
                .await?;
        } else {
            self.storage
                .replace_job_node(&node, &ServerStatus::Disabled.to_string())
                .await?;
        }
        Ok(())
    }

    pub async fn status(&self, ip: &str) -> Result<Option<ServerStatus>> {
        match self
            .storage
            .get_job_node_data(&JobNodePath::server_node(ip))
            .await?
        {
            Some(value) => Ok(value.parse().ok()),
            None => Ok(None),
        }
    }

    pub async fn is_enable_server(&self, ip: &str) -> Result<bool> {
        Ok(self.status(ip).await? == Some(ServerStatus::Enabled))
    }

    pub async fn enable_server(&self, ip: &str) -> Result<()> {
        self.storage
            .replace_job_node(&JobNodePath::server_node(ip), &ServerStatus::Enabled.to_string())
            .await
    }

    pub async fn disable_server(&self, ip: &str) -> Result<()> {
        self.storage
            .replace_job_node(
                &JobNodePath::server_node(ip),
                &ServerStatus::Disabled.to_string(),
            )
            .await
    }

    pub async fn get_all_servers(&self) -> Result<Vec<String>> {
        self.storage.get_job_node_children_keys(SERVERS_NODE).await
    }

    /// Enabled and hosting at least one live instance.
    pub async fn is_available_server(&self, ip: &str) -> Result<bool> {
        if !self.is_enable_server(ip).await? {
            return Ok(false);
        }
        let prefix = format!("{}{}", ip, DELIMITER);
        Ok(self
            .storage
            .get_job_node_children_keys(INSTANCES_NODE)
            .await?
            .iter()
            .any(|id| id.starts_with(&prefix)))
    }

    pub async fn has_available_servers(&self) -> Result<bool> {
        for ip in self.get_all_servers().await? {
            if self.is_available_server(&ip).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn service(registry: &MemoryRegistry, ip: &str) -> ServerService {
        ServerService::new(JobNodeStorage::new(registry.session(), "job"), ip)
    }

    #[test]
    fn status_text_form() {
        assert_eq!(ServerStatus::Enabled.to_string(), "ENABLED");
        assert_eq!("DISABLED".parse::<ServerStatus>().unwrap(), ServerStatus::Disabled);
        assert!("".parse::<ServerStatus>().is_err());
    }

    #[tokio::test]
    async fn absent_server_is_not_enabled() {
        let registry = MemoryRegistry::new();
        let server = service(&registry, "10.0.0.1");
        assert!(!server.is_enable_server("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn disabled_status_survives_enabled_restart() {
        let registry = MemoryRegistry::new();
        let server = service(&registry, "10.0.0.1");
        server.persist_online(true).await.unwrap();
        server.disable_server("10.0.0.1").await.unwrap();

        server.persist_online(true).await.unwrap();
        assert!(!server.is_enable_server("10.0.0.1").await.unwrap());

        server.enable_server("10.0.0.1").await.unwrap();
        assert!(server.is_enable_server("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn available_needs_live_instance() {
        let registry = MemoryRegistry::new();
        let server = service(&registry, "10.0.0.1");
        server.persist_online(true).await.unwrap();
        assert!(!server.is_available_server("10.0.0.1").await.unwrap());
        assert!(!server.has_available_servers().await.unwrap());

        server
            .storage
            .fill_ephemeral_job_node("instances/10.0.0.1@-@9", "")
            .await
            .unwrap();
        assert!(server.is_available_server("10.0.0.1").await.unwrap());
        assert!(server.has_available_servers().await.unwrap());
    }
}
