//! Scaling group integration
//!
//! Covers the three hook operations the controller needs: reading a hook's
//! heartbeat timeout, extending the hook while work is in progress, and
//! completing the lifecycle action with Continue or Abandon.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use tracing::{debug, error, info};

use crate::error::{Result, SentinelError};
use crate::event::LifecycleEvent;

/// Hard cap on total heartbeat time for a single event
const MAX_EVENT_SECONDS: i64 = 3600;

/// Result reported when completing a lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Proceed with the termination
    Continue,
    /// Abandon the hook, the instance terminates without further grace
    Abandon,
}

impl LifecycleAction {
    /// Wire representation of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Abandon => "ABANDON",
        }
    }
}

/// Abstract scaling group operations consumed by the controller
#[async_trait]
pub trait ScalingGroups: Send + Sync {
    /// Heartbeat timeout in seconds of the named hook
    async fn hook_heartbeat_interval(&self, asg_name: &str, hook_name: &str) -> Result<i64>;

    /// Extend the hook deadline for the event's instance
    async fn record_heartbeat(&self, event: &LifecycleEvent) -> Result<()>;

    /// Report the terminal result of the hook
    async fn complete_lifecycle_action(
        &self,
        event: &LifecycleEvent,
        action: LifecycleAction,
    ) -> Result<()>;
}

/// Auto Scaling backed implementation
pub struct AutoScalingGroups {
    client: AutoScalingClient,
}

impl AutoScalingGroups {
    /// Create a scaling group service from an Auto Scaling client
    pub fn new(client: AutoScalingClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScalingGroups for AutoScalingGroups {
    async fn hook_heartbeat_interval(&self, asg_name: &str, hook_name: &str) -> Result<i64> {
        let output = self
            .client
            .describe_lifecycle_hooks()
            .auto_scaling_group_name(asg_name)
            .lifecycle_hook_names(hook_name)
            .send()
            .await
            .map_err(|e| {
                SentinelError::scaling_group(format!("failed to describe lifecycle hooks: {e}"))
            })?;

        match output.lifecycle_hooks().first() {
            Some(hook) => Ok(i64::from(hook.heartbeat_timeout().unwrap_or_default())),
            None => Err(SentinelError::not_found(format!(
                "lifecycle hook {hook_name} for scaling group {asg_name}"
            ))),
        }
    }

    async fn record_heartbeat(&self, event: &LifecycleEvent) -> Result<()> {
        debug!(instance_id = %event.instance_id, "extending lifecycle action");
        self.client
            .record_lifecycle_action_heartbeat()
            .auto_scaling_group_name(&event.asg_name)
            .instance_id(&event.instance_id)
            .lifecycle_action_token(&event.action_token)
            .lifecycle_hook_name(&event.hook_name)
            .send()
            .await
            .map_err(|e| {
                SentinelError::scaling_group(format!("failed to record heartbeat: {e}"))
            })?;
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        event: &LifecycleEvent,
        action: LifecycleAction,
    ) -> Result<()> {
        info!(result = action.as_str(), "setting lifecycle event as completed");
        self.client
            .complete_lifecycle_action()
            .auto_scaling_group_name(&event.asg_name)
            .instance_id(&event.instance_id)
            .lifecycle_action_result(action.as_str())
            .lifecycle_hook_name(&event.hook_name)
            .send()
            .await
            .map_err(|e| {
                SentinelError::scaling_group(format!("failed to complete lifecycle action: {e}"))
            })?;
        Ok(())
    }
}

/// Number of heartbeat iterations allowed before the driver gives up and lets
/// the scaling group's own timeout fire
pub(crate) fn max_heartbeat_iterations(recommended_interval: i64) -> i64 {
    MAX_EVENT_SECONDS / recommended_interval.max(1)
}

/// Heartbeat driver for one in-flight event
///
/// Sleeps half the hook's heartbeat timeout between extensions, exits once the
/// event completes, the one-hour ceiling is reached, or the heartbeat call
/// fails. The ceiling and the error exit both leave the instance to be
/// abandoned by the scaling group's own timeout.
pub async fn send_heartbeat(client: Arc<dyn ScalingGroups>, event: LifecycleEvent) {
    let interval = event.heartbeat_interval;
    let recommended_interval = (interval / 2).max(1);
    let max_iterations = max_heartbeat_iterations(recommended_interval);

    debug!(
        scaling_group = %event.asg_name,
        max_interval = interval,
        heartbeat = recommended_interval,
        "starting heartbeat driver"
    );

    let mut iteration_count = 0;
    loop {
        iteration_count += 1;
        tokio::time::sleep(Duration::from_secs(recommended_interval as u64)).await;
        if event.is_completed() {
            return;
        }
        if iteration_count >= max_iterations {
            // hard limit in case the event is never marked completed
            debug!("heartbeat extended over threshold, instance will be abandoned");
            return;
        }
        info!(instance_id = %event.instance_id, "sending heartbeat");
        if let Err(err) = client.record_heartbeat(&event).await {
            error!(
                instance_id = %event.instance_id,
                error = %err,
                "failed to send heartbeat"
            );
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubScalingGroups;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_lifecycle_action_wire_format() {
        assert_eq!(LifecycleAction::Continue.as_str(), "CONTINUE");
        assert_eq!(LifecycleAction::Abandon.as_str(), "ABANDON");
    }

    #[test]
    fn test_max_heartbeat_iterations() {
        assert_eq!(max_heartbeat_iterations(30), 120);
        assert_eq!(max_heartbeat_iterations(1), 3600);
        // degenerate intervals never divide by zero
        assert_eq!(max_heartbeat_iterations(0), 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_exits_on_completed_event() {
        let scaling = Arc::new(StubScalingGroups::default());
        let event = LifecycleEvent {
            instance_id: "i-123486890234".to_string(),
            heartbeat_interval: 60,
            ..Default::default()
        };
        event.mark_completed();

        send_heartbeat(scaling.clone(), event).await;
        assert_eq!(scaling.times_called_heartbeat.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_exits_after_api_error() {
        let scaling = Arc::new(StubScalingGroups {
            fail_heartbeat: true,
            ..Default::default()
        });
        let event = LifecycleEvent {
            instance_id: "i-123486890234".to_string(),
            heartbeat_interval: 60,
            ..Default::default()
        };

        send_heartbeat(scaling.clone(), event).await;
        assert_eq!(scaling.times_called_heartbeat.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_at_iteration_ceiling() {
        let scaling = Arc::new(StubScalingGroups::default());
        let event = LifecycleEvent {
            instance_id: "i-123486890234".to_string(),
            heartbeat_interval: 3600,
            ..Default::default()
        };

        send_heartbeat(scaling.clone(), event).await;
        // one hour ceiling at half-interval spacing allows a single extension
        assert_eq!(scaling.times_called_heartbeat.load(Ordering::SeqCst), 1);
    }
}
