/// Result alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Empty or malformed model name, unknown model, conflicting adapters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No combination of idle runners frees enough memory for the load
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The pending queue is at capacity
    #[error("server busy, please try again: {0}")]
    QueueFull(String),

    /// The runner did not report ready in time
    #[error("timed out waiting for runner to become ready: {0}")]
    LoadTimeout(String),

    /// The runner exited or could not be started during load
    #[error("runner failed to load: {0}")]
    LoadFailed(String),

    /// The runner exited while it was serving
    #[error("runner crashed: {0}")]
    RunnerCrashed(String),

    /// The caller gave up before the request was resolved
    #[error("request cancelled")]
    Cancelled,

    /// The scheduler is stopping or has stopped
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::InvalidRequest(_) => "invalid_request",
            SchedulerError::ResourceExhausted(_) => "resource_exhausted",
            SchedulerError::QueueFull(_) => "queue_full",
            SchedulerError::LoadTimeout(_) => "load_timeout",
            SchedulerError::LoadFailed(_) => "load_failed",
            SchedulerError::RunnerCrashed(_) => "runner_crashed",
            SchedulerError::Cancelled => "cancelled",
            SchedulerError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::ResourceExhausted(_)
                | SchedulerError::QueueFull(_)
                | SchedulerError::RunnerCrashed(_)
        )
    }
}
