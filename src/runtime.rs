use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::instance::JobInstance;

/// In-process state of one job on this instance.
///
/// Everything the coordination engine shares lives in the registry; this only
/// holds what is local to the process: identity, whether the job is executing
/// right now, and lifecycle flags.
#[derive(Debug)]
pub struct JobRuntime {
    job_name: String,
    instance: JobInstance,
    running: AtomicBool,
    shutdown: AtomicBool,
    suspended: AtomicBool,
    trigger: Notify,
    cancel: CancellationToken,
}

impl JobRuntime {
    pub fn new(job_name: impl Into<String>, instance: JobInstance) -> Self {
        Self {
            job_name: job_name.into(),
            instance,
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            trigger: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the job as executing. Returns false if it already was.
    pub fn begin_running(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub fn end_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Flag the job as shutting down and cancel its background tasks.
    /// Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.trigger.notify_one();
        first
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    /// Ask the execution loop to run as soon as possible.
    pub fn request_trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn triggered(&self) {
        self.trigger.notified().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
