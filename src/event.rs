//! Lifecycle event model
//!
//! A [`LifecycleEvent`] is the unit of work of the controller: one termination
//! notification received from the queue, enriched with the cluster node that
//! backs the instance and the heartbeat interval of its hook.
//!
//! The completion flags are shared atomics so that background tasks spawned
//! for an event (heartbeat driver, deregistration waiters) observe completion
//! through their own clones of the event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// The lifecycle transition this controller handles
pub const TERMINATION_TRANSITION: &str = "autoscaling:EC2_INSTANCE_TERMINATING";

/// A message received from the notification queue
///
/// Kept on the event so it can be re-serialized into the node annotation for
/// crash resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Raw notification body
    pub body: String,
    /// Handle required to delete the message from the queue
    pub receipt_handle: String,
}

/// Lifecycle hook notification as delivered in the queue message body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookNotification {
    /// Name of the lifecycle hook that fired
    #[serde(rename = "LifecycleHookName", default)]
    pub lifecycle_hook_name: String,
    /// Account owning the scaling group
    #[serde(rename = "AccountId", default)]
    pub account_id: String,
    /// Unique id of this hook invocation
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    /// Lifecycle transition, expected to be the termination transition
    #[serde(rename = "LifecycleTransition", default)]
    pub lifecycle_transition: String,
    /// Name of the scaling group terminating the instance
    #[serde(rename = "AutoScalingGroupName", default)]
    pub auto_scaling_group_name: String,
    /// Id of the terminating instance
    #[serde(rename = "EC2InstanceId", default)]
    pub ec2_instance_id: String,
    /// Token required to act on the hook
    #[serde(rename = "LifecycleActionToken", default)]
    pub lifecycle_action_token: String,
}

/// A monotonic boolean shared between an event and its background tasks
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    /// Transition the flag to set. The transition is one-way.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been set
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A cluster node referenced by a lifecycle event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRef {
    /// Node name
    pub name: String,
    /// Cloud provider id, contains the instance id
    pub provider_id: String,
    /// Node creation timestamp, used for cache-flush decisions
    pub created_at: Option<DateTime<Utc>>,
}

/// One in-flight termination
#[derive(Debug, Clone, Default)]
pub struct LifecycleEvent {
    /// Name of the lifecycle hook
    pub hook_name: String,
    /// Account owning the scaling group
    pub account_id: String,
    /// Unique id of this hook invocation
    pub request_id: String,
    /// Lifecycle transition carried by the notification
    pub transition: String,
    /// Name of the scaling group
    pub asg_name: String,
    /// Id of the terminating instance
    pub instance_id: String,
    /// Token required to act on the hook
    pub action_token: String,
    /// Handle required to delete the queue message
    pub receipt_handle: String,
    /// URL of the queue the message arrived on
    pub queue_url: String,
    /// Cluster node backing the instance, set after lookup
    pub referenced_node: Option<NodeRef>,
    /// Heartbeat timeout of the hook in seconds
    pub heartbeat_interval: i64,
    /// When processing began
    pub start_time: Option<Instant>,
    /// Original queue message, kept for crash resume
    pub raw_message: Option<QueueMessage>,
    pub(crate) drain_completed: CompletionFlag,
    pub(crate) deregister_completed: CompletionFlag,
    pub(crate) event_completed: CompletionFlag,
}

impl LifecycleEvent {
    /// Build an event from a parsed notification and its queue message
    pub fn from_notification(
        notification: &HookNotification,
        message: &QueueMessage,
        queue_url: &str,
    ) -> Self {
        Self {
            hook_name: notification.lifecycle_hook_name.clone(),
            account_id: notification.account_id.clone(),
            request_id: notification.request_id.clone(),
            transition: notification.lifecycle_transition.clone(),
            asg_name: notification.auto_scaling_group_name.clone(),
            instance_id: notification.ec2_instance_id.clone(),
            action_token: notification.lifecycle_action_token.clone(),
            receipt_handle: message.receipt_handle.clone(),
            queue_url: queue_url.to_string(),
            raw_message: Some(message.clone()),
            ..Self::default()
        }
    }

    /// Build a minimal event for a message that could not be accepted, so the
    /// rejection path can still delete it from the queue
    pub fn partial(message: &QueueMessage, queue_url: &str) -> Self {
        Self {
            receipt_handle: message.receipt_handle.clone(),
            queue_url: queue_url.to_string(),
            raw_message: Some(message.clone()),
            ..Self::default()
        }
    }

    /// Check the event is eligible for processing: the termination transition
    /// and non-empty identifier fields
    pub fn validate(&self) -> Result<()> {
        if self.transition != TERMINATION_TRANSITION {
            return Err(SentinelError::invalid_event(format!(
                "unsupported lifecycle transition {:?}",
                self.transition
            )));
        }
        for (field, value) in [
            ("LifecycleHookName", &self.hook_name),
            ("RequestId", &self.request_id),
            ("AutoScalingGroupName", &self.asg_name),
            ("EC2InstanceId", &self.instance_id),
            ("LifecycleActionToken", &self.action_token),
        ] {
            if value.is_empty() {
                return Err(SentinelError::invalid_event(format!("{field} is empty")));
            }
        }
        Ok(())
    }

    /// Two events are duplicates when request id and instance id match
    pub fn same_identity(&self, other: &LifecycleEvent) -> bool {
        self.request_id == other.request_id && self.instance_id == other.instance_id
    }

    /// Name of the referenced node, empty when no node has been attached
    pub fn node_name(&self) -> String {
        self.referenced_node
            .as_ref()
            .map(|node| node.name.clone())
            .unwrap_or_default()
    }

    /// Stamp the processing start time
    pub fn mark_started(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Seconds elapsed since processing began
    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or_default()
    }

    /// Record that the node drain finished successfully
    pub fn mark_drain_completed(&self) {
        self.drain_completed.set();
    }

    /// Whether the node drain finished successfully
    pub fn drain_completed(&self) -> bool {
        self.drain_completed.is_set()
    }

    /// Record that load balancer deregistration finished successfully
    pub fn mark_deregister_completed(&self) {
        self.deregister_completed.set();
    }

    /// Whether load balancer deregistration finished successfully
    pub fn deregister_completed(&self) -> bool {
        self.deregister_completed.is_set()
    }

    /// Record that the event finished processing. Background tasks observe
    /// this through [`LifecycleEvent::completion_flag`] and exit.
    pub fn mark_completed(&self) {
        self.event_completed.set();
    }

    /// Whether the event finished processing
    pub fn is_completed(&self) -> bool {
        self.event_completed.is_set()
    }

    /// The shared completion flag, handed to waiters as a cancellation signal
    pub fn completion_flag(&self) -> CompletionFlag {
        self.event_completed.clone()
    }
}
