//! # lifecycle-sentinel
//!
//! Node-termination lifecycle controller for autoscaled Kubernetes fleets.
//!
//! ## Architecture
//!
//! ```text
//! Queue (lifecycle hooks)        Cluster
//! ├── Poller ──> channel         ├── node lookup / annotations
//! │                              ├── drain via kubectl
//! └── Manager ──> worker/event   └── published events
//!         ├── Heartbeat driver
//!         ├── Drain stage
//!         └── Deregister stage (target groups + classic balancers)
//! ```
//!
//! When the autoscaler decides to terminate an instance it fires a lifecycle
//! hook and waits for an acknowledgement. The controller picks the
//! notification off the queue, drains cluster workloads from the node backing
//! the instance, deregisters the instance from any load balancer pools that
//! contain it, keeps the hook alive with heartbeats while working, and finally
//! reports Continue so the instance can be reaped. Unrecoverable failures
//! report Abandon instead.
//!
//! ## At-least-once processing
//!
//! The queue redelivers messages whose visibility timeout elapses, so every
//! accepted message ends in exactly one of three terminal states, each of
//! which deletes the message: completed, failed, or rejected. In-flight events
//! survive controller restarts through a node annotation holding the original
//! message (see [`manager`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod balancer;
pub mod cluster;
pub mod config;
mod deregister;
pub mod error;
pub mod event;
pub mod events;
pub mod kubectl;
pub mod manager;
pub mod metrics;
mod poller;
pub mod queue;
pub mod scaling;

#[cfg(test)]
mod testutil;

// Error handling
pub use error::{Result, SentinelError};

// Event model
pub use event::{
    CompletionFlag, HookNotification, LifecycleEvent, NodeRef, QueueMessage,
    TERMINATION_TRANSITION,
};

// Manager and its collaborator seams
pub use manager::{
    Manager, Services, EXCLUDE_LABEL_KEY, EXCLUDE_LABEL_VALUE, IN_PROGRESS_ANNOTATION_KEY,
};

// Configuration
pub use config::{Settings, WaiterSettings};

// Service traits and production implementations
pub use balancer::{ClassicBalancerService, ClassicBalancers, TargetGroupService, TargetGroups};
pub use cluster::{ClusterNodes, KubeClusterNodes};
pub use kubectl::{KubectlRunner, NodeDrain};
pub use queue::{MessageQueue, SqsQueue};
pub use scaling::{AutoScalingGroups, LifecycleAction, ScalingGroups};
