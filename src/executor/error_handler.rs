use std::collections::HashMap;
use std::sync::Arc;

use crate::error::JobError;

pub const LOG: &str = "LOG";
pub const IGNORE: &str = "IGNORE";
pub const THROW: &str = "THROW";

/// What to do with an error raised by job code or the execution environment.
pub trait JobErrorHandler: Send + Sync + std::fmt::Debug {
    fn handler_type(&self) -> &'static str;

    /// `Err` aborts the current run; `Ok` lets it continue.
    fn handle_exception(&self, job_name: &str, error: &JobError) -> Result<(), JobError>;
}

#[derive(Debug, Default)]
pub struct LogJobErrorHandler;

impl JobErrorHandler for LogJobErrorHandler {
    fn handler_type(&self) -> &'static str {
        LOG
    }

    fn handle_exception(&self, job_name: &str, error: &JobError) -> Result<(), JobError> {
        tracing::error!(job = %job_name, error = %error, "Job execution error");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IgnoreJobErrorHandler;

impl JobErrorHandler for IgnoreJobErrorHandler {
    fn handler_type(&self) -> &'static str {
        IGNORE
    }

    fn handle_exception(&self, _job_name: &str, _error: &JobError) -> Result<(), JobError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ThrowJobErrorHandler;

impl JobErrorHandler for ThrowJobErrorHandler {
    fn handler_type(&self) -> &'static str {
        THROW
    }

    fn handle_exception(&self, _job_name: &str, error: &JobError) -> Result<(), JobError> {
        Err(error.clone())
    }
}

type HandlerFactory = fn() -> Arc<dyn JobErrorHandler>;

/// Error handlers by type key. Unknown keys fall back to [`LOG`].
#[derive(Debug, Clone)]
pub struct ErrorHandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl Default for ErrorHandlerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(LOG, || Arc::new(LogJobErrorHandler));
        registry.register(IGNORE, || Arc::new(IgnoreJobErrorHandler));
        registry.register(THROW, || Arc::new(ThrowJobErrorHandler));
        registry
    }
}

impl ErrorHandlerRegistry {
    pub fn register(&mut self, key: &str, factory: HandlerFactory) {
        self.factories.insert(key.to_ascii_uppercase(), factory);
    }

    pub fn get(&self, key: &str) -> Arc<dyn JobErrorHandler> {
        match self.factories.get(&key.to_ascii_uppercase()) {
            Some(factory) => factory(),
            None => {
                tracing::warn!(handler = key, "Unknown job error handler, using LOG");
                Arc::new(LogJobErrorHandler)
            }
        }
    }
}
