use tokio::sync::RwLock;

use crate::config::JobConfig;
use crate::error::{CoordError, Result};
use crate::storage::path::CONFIG_NODE;
use crate::storage::JobNodeStorage;

/// Reads and writes the job configuration stored under `/{job}/config`.
#[derive(Debug)]
pub struct ConfigService {
    storage: JobNodeStorage,
    cache: RwLock<Option<JobConfig>>,
}

impl ConfigService {
    pub fn new(storage: JobNodeStorage) -> Self {
        Self {
            storage,
            cache: RwLock::new(None),
        }
    }

    /// Publish the local configuration at startup and return the one in force.
    ///
    /// A job already registered with a different `job_type` is a fatal
    /// conflict. Otherwise the registry copy wins unless `overwrite` is set.
    pub async fn persist(&self, local: &JobConfig) -> Result<JobConfig> {
        local.validate()?;
        let effective = match self.read().await? {
            Some(registered) if registered.job_type != local.job_type => {
                return Err(CoordError::ConfigConflict {
                    job_name: local.job_name.clone(),
                    registered: registered.job_type,
                    local: local.job_type.clone(),
                });
            }
            Some(registered) if !local.overwrite => registered,
            _ => {
                self.write(local).await?;
                local.clone()
            }
        };
        *self.cache.write().await = Some(effective.clone());
        Ok(effective)
    }

    /// Replace the registered configuration, e.g. to change the item count.
    pub async fn update(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        self.write(config).await?;
        *self.cache.write().await = Some(config.clone());
        Ok(())
    }

    /// Current configuration, from the local cache when allowed and filled.
    pub async fn load(&self, from_cache: bool) -> Result<JobConfig> {
        if from_cache {
            if let Some(config) = self.cache.read().await.clone() {
                return Ok(config);
            }
        }
        let config = self
            .read()
            .await?
            .ok_or_else(|| CoordError::JobNotFound(self.storage.job_name().to_string()))?;
        *self.cache.write().await = Some(config.clone());
        Ok(config)
    }

    /// Re-read the registered configuration into the cache. Returns the
    /// previously cached copy and the current one.
    pub async fn reload(&self) -> Result<(Option<JobConfig>, JobConfig)> {
        let config = self
            .read()
            .await?
            .ok_or_else(|| CoordError::JobNotFound(self.storage.job_name().to_string()))?;
        let previous = self.cache.write().await.replace(config.clone());
        Ok((previous, config))
    }

    /// Fail if the local clock drifts from the registry beyond the tolerance.
    pub async fn check_max_time_diff_seconds_tolerable(&self) -> Result<()> {
        let config = self.load(true).await?;
        if config.max_time_diff_seconds < 0 {
            return Ok(());
        }
        let registry_time = self.storage.registry_time().await?;
        let diff = (chrono::Utc::now() - registry_time).num_seconds().abs();
        if diff > config.max_time_diff_seconds {
            return Err(CoordError::ExecutionEnvironment {
                max_time_diff_seconds: config.max_time_diff_seconds,
                time_diff_seconds: diff,
            });
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<JobConfig>> {
        match self.storage.get_job_node_data(CONFIG_NODE).await? {
            Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    async fn write(&self, config: &JobConfig) -> Result<()> {
        self.storage
            .replace_job_node(CONFIG_NODE, &serde_json::to_string(config)?)
            .await
    }
}
