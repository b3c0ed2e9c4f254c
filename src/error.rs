//! Error types for the lifecycle controller

use thiserror::Error;

/// Controller result type
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Errors that can occur while processing lifecycle events
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Message queue error
    #[error("message queue error: {0}")]
    Queue(String),

    /// Scaling group API error
    #[error("scaling group error: {0}")]
    ScalingGroup(String),

    /// Load balancer API error
    #[error("load balancer error: {0}")]
    LoadBalancer(String),

    /// A referenced pool or hook does not exist. Skippable inside the
    /// deregistration stage.
    #[error("{0} not found")]
    NotFound(String),

    /// The instance is not a registered target of the pool. Skippable inside
    /// the deregistration stage.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Cluster API error
    #[error("cluster API error: {0}")]
    Kube(#[from] kube::Error),

    /// Node drain failure
    #[error("node drain failed: {0}")]
    Drain(String),

    /// A message that cannot be accepted for processing
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// An event with the same request id and instance id is already in flight
    #[error("duplicate event: {0}")]
    Duplicate(String),

    /// The event was marked completed while deregistration was in progress
    #[error("event finished execution during deregistration")]
    EventFinished,

    /// A deregistration waiter exhausted its attempts
    #[error("waiter timed out after {0} attempts")]
    WaiterTimeout(u32),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl SentinelError {
    /// Create a message queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a scaling group error
    pub fn scaling_group(msg: impl Into<String>) -> Self {
        Self::ScalingGroup(msg.into())
    }

    /// Create a load balancer error
    pub fn load_balancer(msg: impl Into<String>) -> Self {
        Self::LoadBalancer(msg.into())
    }

    /// Create a not-found error for a named resource
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid-target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Create a node drain error
    pub fn drain(msg: impl Into<String>) -> Self {
        Self::Drain(msg.into())
    }

    /// Create an invalid event error
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    /// Create a duplicate event error
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error represents a missing pool or hook
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error represents a target that is not registered
    pub fn is_invalid_target(&self) -> bool {
        matches!(self, Self::InvalidTarget(_))
    }
}
