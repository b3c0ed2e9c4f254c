//! Cluster event catalog
//!
//! Every notable transition of an in-flight termination is published as a
//! cluster event against the referenced node, so operators can follow the
//! controller's work from the cluster itself.

use std::collections::BTreeMap;

use crate::error::SentinelError;
use crate::event::LifecycleEvent;

/// Namespace events are published into
pub const EVENT_NAMESPACE: &str = "default";

/// Prefix for generated event object names
pub const EVENT_NAME_PREFIX: &str = "lifecycle-sentinel";

/// Reason attached to a published cluster event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    /// A lifecycle hook notification was accepted for processing
    LifecycleHookReceived,
    /// A lifecycle hook completed processing successfully
    LifecycleHookProcessed,
    /// A lifecycle hook failed processing
    LifecycleHookFailed,
    /// A node drain finished successfully
    NodeDrainSucceeded,
    /// A node drain failed
    NodeDrainFailed,
    /// A target group deregistration finished successfully
    TargetDeregisterSucceeded,
    /// A target group deregistration failed
    TargetDeregisterFailed,
    /// A classic balancer deregistration finished successfully
    InstanceDeregisterSucceeded,
    /// A classic balancer deregistration failed
    InstanceDeregisterFailed,
}

impl EventReason {
    /// Reason string as it appears on the published event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LifecycleHookReceived => "EventLifecycleHookReceived",
            Self::LifecycleHookProcessed => "EventLifecycleHookProcessed",
            Self::LifecycleHookFailed => "EventLifecycleHookFailed",
            Self::NodeDrainSucceeded => "EventNodeDrainSucceeded",
            Self::NodeDrainFailed => "EventNodeDrainFailed",
            Self::TargetDeregisterSucceeded => "EventTargetDeregisterSucceeded",
            Self::TargetDeregisterFailed => "EventTargetDeregisterFailed",
            Self::InstanceDeregisterSucceeded => "EventInstanceDeregisterSucceeded",
            Self::InstanceDeregisterFailed => "EventInstanceDeregisterFailed",
        }
    }

    /// Event level, Warning for failures and Normal otherwise
    pub fn level(&self) -> &'static str {
        match self {
            Self::LifecycleHookFailed
            | Self::NodeDrainFailed
            | Self::TargetDeregisterFailed
            | Self::InstanceDeregisterFailed => "Warning",
            _ => "Normal",
        }
    }
}

/// A cluster event ready to be published
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// Event reason
    pub reason: EventReason,
    /// Structured fields, serialized into the event message
    pub fields: BTreeMap<String, String>,
    /// Name of the node the event refers to, may be empty for partial events
    pub node_name: String,
}

impl ClusterEvent {
    fn new(reason: EventReason, event: &LifecycleEvent, details: String) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("eventID".to_string(), event.request_id.clone());
        fields.insert("ec2InstanceId".to_string(), event.instance_id.clone());
        fields.insert("asgName".to_string(), event.asg_name.clone());
        fields.insert("details".to_string(), details);
        Self {
            reason,
            fields,
            node_name: event.node_name(),
        }
    }

    /// A hook notification was accepted and processing begins
    pub fn hook_received(event: &LifecycleEvent) -> Self {
        Self::new(
            EventReason::LifecycleHookReceived,
            event,
            format!(
                "lifecycle hook for event {} was received, instance {} will begin processing",
                event.request_id, event.instance_id
            ),
        )
    }

    /// A hook finished processing successfully
    pub fn hook_processed(event: &LifecycleEvent, seconds: f64) -> Self {
        Self::new(
            EventReason::LifecycleHookProcessed,
            event,
            format!(
                "lifecycle hook for event {} has completed processing, instance {} gracefully terminated after {seconds:.1}s",
                event.request_id, event.instance_id
            ),
        )
    }

    /// A hook failed processing
    pub fn hook_failed(event: &LifecycleEvent, seconds: f64, err: &SentinelError) -> Self {
        Self::new(
            EventReason::LifecycleHookFailed,
            event,
            format!(
                "lifecycle hook for event {} has failed processing after {seconds:.1}s: {err}",
                event.request_id
            ),
        )
    }

    /// The node drain finished successfully
    pub fn drain_succeeded(event: &LifecycleEvent) -> Self {
        Self::new(
            EventReason::NodeDrainSucceeded,
            event,
            format!(
                "node {} has been drained successfully as a response to a termination event",
                event.node_name()
            ),
        )
    }

    /// The node drain failed
    pub fn drain_failed(event: &LifecycleEvent, err: &SentinelError) -> Self {
        Self::new(
            EventReason::NodeDrainFailed,
            event,
            format!("node {} draining has failed: {err}", event.node_name()),
        )
    }

    /// A target group deregistration finished successfully
    pub fn target_deregister_succeeded(event: &LifecycleEvent, arn: &str, port: i32) -> Self {
        let mut out = Self::new(
            EventReason::TargetDeregisterSucceeded,
            event,
            format!(
                "target {}:{port} has successfully deregistered from target group {arn}",
                event.instance_id
            ),
        );
        out.fields.insert("targetGroup".to_string(), arn.to_string());
        out.fields.insert("port".to_string(), port.to_string());
        out.fields.insert("elbType".to_string(), "alb".to_string());
        out
    }

    /// A target group deregistration failed
    pub fn target_deregister_failed(
        event: &LifecycleEvent,
        arn: &str,
        port: i32,
        err: &SentinelError,
    ) -> Self {
        let mut out = Self::new(
            EventReason::TargetDeregisterFailed,
            event,
            format!(
                "target {}:{port} has failed to deregister from target group {arn}: {err}",
                event.instance_id
            ),
        );
        out.fields.insert("targetGroup".to_string(), arn.to_string());
        out.fields.insert("port".to_string(), port.to_string());
        out.fields.insert("elbType".to_string(), "alb".to_string());
        out
    }

    /// A classic balancer deregistration finished successfully
    pub fn instance_deregister_succeeded(event: &LifecycleEvent, balancer: &str) -> Self {
        let mut out = Self::new(
            EventReason::InstanceDeregisterSucceeded,
            event,
            format!(
                "instance {} has successfully deregistered from classic-elb {balancer}",
                event.instance_id
            ),
        );
        out.fields.insert("elbName".to_string(), balancer.to_string());
        out.fields
            .insert("elbType".to_string(), "classic-elb".to_string());
        out
    }

    /// A classic balancer deregistration failed
    pub fn instance_deregister_failed(
        event: &LifecycleEvent,
        balancer: &str,
        err: &SentinelError,
    ) -> Self {
        let mut out = Self::new(
            EventReason::InstanceDeregisterFailed,
            event,
            format!(
                "instance {} has failed to deregister from classic-elb {balancer}: {err}",
                event.instance_id
            ),
        );
        out.fields.insert("elbName".to_string(), balancer.to_string());
        out.fields
            .insert("elbType".to_string(), "classic-elb".to_string());
        out
    }

    /// Serialized message body for the published event
    pub fn message(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons_are_warnings() {
        assert_eq!(EventReason::LifecycleHookFailed.level(), "Warning");
        assert_eq!(EventReason::NodeDrainFailed.level(), "Warning");
        assert_eq!(EventReason::LifecycleHookProcessed.level(), "Normal");
    }

    #[test]
    fn test_event_fields() {
        let event = LifecycleEvent {
            request_id: "req-1".to_string(),
            instance_id: "i-123".to_string(),
            asg_name: "my-asg".to_string(),
            ..Default::default()
        };
        let out = ClusterEvent::hook_received(&event);
        assert_eq!(out.fields["eventID"], "req-1");
        assert_eq!(out.fields["ec2InstanceId"], "i-123");
        assert!(out.fields["details"].contains("will begin processing"));
        assert!(out.message().contains("req-1"));
    }

    #[test]
    fn test_deregister_event_fields() {
        let event = LifecycleEvent {
            instance_id: "i-123".to_string(),
            ..Default::default()
        };
        let out = ClusterEvent::target_deregister_succeeded(&event, "arn:tg", 8080);
        assert_eq!(out.fields["elbType"], "alb");
        assert_eq!(out.fields["port"], "8080");
        let out = ClusterEvent::instance_deregister_succeeded(&event, "my-elb");
        assert_eq!(out.fields["elbType"], "classic-elb");
        assert_eq!(out.fields["elbName"], "my-elb");
    }
}
