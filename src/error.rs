use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job '{job_name}' is registered as type '{registered}', local job type is '{local}'")]
    ConfigConflict {
        job_name: String,
        registered: String,
        local: String,
    },

    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Clock skew between job server and registry is {time_diff_seconds}s, exceeding the tolerated {max_time_diff_seconds}s")]
    ExecutionEnvironment {
        max_time_diff_seconds: i64,
        time_diff_seconds: i64,
    },

    #[error("Timed out waiting for latch: {0}")]
    LockTimeout(String),

    #[error("Job '{job_name}' failed: {source}")]
    JobFailed {
        job_name: String,
        #[source]
        source: JobError,
    },

    #[error("Job is shut down: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Whether a retry on the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::Registry(_) | CoordError::LockTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// Failure reported by user job code for one sharding item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
