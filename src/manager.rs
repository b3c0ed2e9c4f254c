//! Event processing pipeline
//!
//! The [`Manager`] owns the work queue and drives every accepted event through
//! the same sequence:
//!
//! ```text
//! Poller -> channel -> worker task
//!     parse -> validate -> dedup -> hook interval -> node lookup
//!     process: add -> handle (heartbeat task, drain, deregister) -> complete
//! ```
//!
//! Rejections delete the message without touching the scaling group. Failures
//! report Abandon and delete. Both are terminal for the message, so the queue
//! never redelivers work the controller has already decided on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::balancer::{ClassicBalancers, TargetGroups};
use crate::cluster::ClusterNodes;
use crate::config::Settings;
use crate::error::{Result, SentinelError};
use crate::event::{HookNotification, LifecycleEvent, QueueMessage};
use crate::events::ClusterEvent;
use crate::kubectl::NodeDrain;
use crate::metrics;
use crate::poller;
use crate::queue::MessageQueue;
use crate::scaling::{send_heartbeat, LifecycleAction, ScalingGroups};

/// Label excluding a node from future load balancer pool membership
pub const EXCLUDE_LABEL_KEY: &str = "alpha.service-controller.kubernetes.io/exclude-balancer";

/// Value of the exclusion label
pub const EXCLUDE_LABEL_VALUE: &str = "true";

/// Annotation holding the serialized queue message of an in-flight event, used
/// to resume terminations after a controller restart
pub const IN_PROGRESS_ANNOTATION_KEY: &str = "lifecycle-sentinel.io/in-progress";

/// Collaborating services the manager drives events through
pub struct Services {
    /// Scaling group operations
    pub scaling: Arc<dyn ScalingGroups>,
    /// Notification queue operations
    pub queue: Arc<dyn MessageQueue>,
    /// v2 target group operations
    pub target_groups: Arc<dyn TargetGroups>,
    /// Classic balancer operations
    pub classic_balancers: Arc<dyn ClassicBalancers>,
    /// Cluster node operations
    pub cluster: Arc<dyn ClusterNodes>,
    /// Drain tool operations
    pub drainer: Arc<dyn NodeDrain>,
}

#[derive(Default)]
struct ManagerState {
    work_queue: Vec<LifecycleEvent>,
    completed_events: usize,
    failed_events: usize,
    rejected_events: usize,
    average_latency: f64,
}

/// Owns the work queue, spawns workers, and implements the event bookkeeping
pub struct Manager {
    pub(crate) services: Services,
    pub(crate) settings: Settings,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Create a manager from its collaborating services and settings
    pub fn new(services: Services, settings: Settings) -> Self {
        Self {
            services,
            settings,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Start the controller: metrics server, poller, crash-resume scan, then
    /// consume the event channel forever, spawning one worker per message
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let settings = &self.settings;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            region = %settings.region,
            queue = %settings.queue_name,
            polling_interval_seconds = settings.polling_interval_seconds,
            drain_timeout_seconds = settings.drain_timeout_seconds,
            drain_retry_interval_seconds = settings.drain_retry_interval_seconds,
            with_deregister = settings.with_deregister,
            "starting lifecycle-sentinel service"
        );

        let metrics_port = settings.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(metrics_port).await {
                error!(error = %err, "metrics server exited");
            }
        });

        let queue_url = self.services.queue.queue_url(&settings.queue_name).await?;

        debug!("spawning queue poller");
        let (events_tx, mut events_rx) = mpsc::channel(1);
        tokio::spawn(poller::run(
            self.services.queue.clone(),
            queue_url.clone(),
            settings.polling_interval_seconds,
            events_tx,
        ));

        self.clone().resume_in_progress(queue_url.clone()).await;

        while let Some(message) = events_rx.recv().await {
            let manager = self.clone();
            let url = queue_url.clone();
            tokio::spawn(async move {
                manager.run_worker(message, url).await;
            });
        }
        Ok(())
    }

    /// Restore events that were in flight when a previous controller instance
    /// crashed, by replaying the queue message stored in the node annotation
    async fn resume_in_progress(self: Arc<Self>, queue_url: String) {
        let annotated = match self
            .services
            .cluster
            .nodes_by_annotation(IN_PROGRESS_ANNOTATION_KEY)
            .await
        {
            Ok(annotated) => annotated,
            Err(err) => {
                error!(error = %err, "failed to resume in progress events");
                return;
            }
        };

        for (node, stored) in annotated {
            if stored.is_empty() {
                continue;
            }
            info!(node = %node.name, "trying to resume termination");
            let message: QueueMessage = match serde_json::from_str(&stored) {
                Ok(message) => message,
                Err(err) => {
                    error!(node = %node.name, error = %err, "failed to resume in progress event");
                    continue;
                }
            };
            let manager = self.clone();
            let url = queue_url.clone();
            tokio::spawn(async move {
                manager.run_worker(message, url).await;
            });
        }
    }

    /// Worker entry point for one queue message
    pub(crate) async fn run_worker(self: Arc<Self>, message: QueueMessage, queue_url: String) {
        match self.new_event(&message, &queue_url).await {
            Ok(mut event) => {
                self.publish(ClusterEvent::hook_received(&event)).await;
                if let Err(err) = self.process(&mut event).await {
                    self.fail_event(err, &event, true).await;
                }
            }
            Err(err) => {
                let event = LifecycleEvent::partial(&message, &queue_url);
                self.reject_event(err, &event).await;
            }
        }
    }

    /// Build an accepted event from a queue message: parse, validate,
    /// deduplicate, fetch the hook heartbeat interval, and resolve the node
    pub(crate) async fn new_event(
        &self,
        message: &QueueMessage,
        queue_url: &str,
    ) -> Result<LifecycleEvent> {
        let notification: HookNotification = serde_json::from_str(&message.body)
            .map_err(|err| SentinelError::invalid_event(format!("failed to read message: {err}")))?;
        let mut event = LifecycleEvent::from_notification(&notification, message, queue_url);

        event.validate()?;

        if self.is_already_queued(&event) {
            return Err(SentinelError::duplicate(format!(
                "event {} for instance {} already exists",
                event.request_id, event.instance_id
            )));
        }

        event.heartbeat_interval = self
            .services
            .scaling
            .hook_heartbeat_interval(&event.asg_name, &event.hook_name)
            .await
            .map_err(|err| {
                SentinelError::invalid_event(format!("failed to get hook heartbeat interval: {err}"))
            })?;

        let node = self
            .services
            .cluster
            .find_node_by_instance(&event.instance_id)
            .await?
            .ok_or_else(|| {
                SentinelError::invalid_event(format!(
                    "instance {} is not seen in cluster nodes",
                    event.instance_id
                ))
            })?;
        event.referenced_node = Some(node);

        Ok(event)
    }

    /// Process an accepted event: enqueue, handle, complete. On error the
    /// caller fails the event with abandon.
    pub async fn process(&self, event: &mut LifecycleEvent) -> Result<()> {
        self.add_event(event);
        info!(instance_id = %event.instance_id, "received termination event");
        self.handle_event(event).await?;
        self.complete_event(event).await;
        Ok(())
    }

    /// Stamp the start time and append the event to the work queue
    pub fn add_event(&self, event: &mut LifecycleEvent) {
        event.mark_started();
        let mut state = self.state.lock().unwrap();
        state.work_queue.push(event.clone());
        metrics::TERMINATING_INSTANCES.inc();
    }

    /// Whether an event with the same identity is already in the work queue
    pub fn is_already_queued(&self, event: &LifecycleEvent) -> bool {
        let state = self.state.lock().unwrap();
        state.work_queue.iter().any(|e| e.same_identity(event))
    }

    /// Complete a successfully processed event: evict it from the work queue,
    /// delete the message, report Continue, publish the success event, and
    /// update counters and the smoothed latency
    pub async fn complete_event(&self, event: &LifecycleEvent) {
        let elapsed = event.elapsed_seconds();
        {
            let mut state = self.state.lock().unwrap();
            state.average_latency = if state.average_latency == 0.0 {
                elapsed
            } else {
                (state.average_latency + elapsed) / 2.0
            };
            let before = state.work_queue.len();
            state.work_queue.retain(|e| !e.same_identity(event));
            if state.work_queue.len() < before {
                metrics::TERMINATING_INSTANCES.dec();
            }
            state.completed_events += 1;
            metrics::AVERAGE_DURATION_SECONDS.set(state.average_latency);
        }
        event.mark_completed();

        if let Err(err) = self
            .services
            .queue
            .delete(&event.queue_url, &event.receipt_handle)
            .await
        {
            error!(error = %err, "failed to delete message");
        }
        if let Err(err) = self
            .services
            .scaling
            .complete_lifecycle_action(event, LifecycleAction::Continue)
            .await
        {
            error!(error = %err, "failed to complete lifecycle action");
        }
        self.publish(ClusterEvent::hook_processed(event, elapsed)).await;
        metrics::SUCCESSFUL_EVENTS_TOTAL.inc();
        info!(
            request_id = %event.request_id,
            instance_id = %event.instance_id,
            seconds = elapsed,
            "event completed processing"
        );
    }

    /// Fail an event: evict it from the work queue, publish the failure event,
    /// report Abandon when requested, and delete the message. Tolerates
    /// partial events that never resolved a node or receipt handle.
    pub async fn fail_event(&self, err: SentinelError, event: &LifecycleEvent, abandon: bool) {
        let elapsed = event.elapsed_seconds();
        error!(
            request_id = %event.request_id,
            seconds = elapsed,
            error = %err,
            "event failed processing"
        );
        {
            let mut state = self.state.lock().unwrap();
            state.failed_events += 1;
            let before = state.work_queue.len();
            state.work_queue.retain(|e| !e.same_identity(event));
            if state.work_queue.len() < before {
                metrics::TERMINATING_INSTANCES.dec();
            }
        }
        metrics::FAILED_EVENTS_TOTAL.inc();
        event.mark_completed();
        self.publish(ClusterEvent::hook_failed(event, elapsed, &err)).await;

        if abandon {
            warn!(instance_id = %event.instance_id, "abandoning instance");
            if let Err(err) = self
                .services
                .scaling
                .complete_lifecycle_action(event, LifecycleAction::Abandon)
                .await
            {
                error!(error = %err, "failed to report abandon");
            }
        }

        if event.receipt_handle.is_empty() {
            error!("event failed: invalid message, nothing to delete");
            return;
        }
        if let Err(err) = self
            .services
            .queue
            .delete(&event.queue_url, &event.receipt_handle)
            .await
        {
            error!(error = %err, "failed to delete message");
        }
    }

    /// Reject a message before acceptance: count it and delete the message. No
    /// scaling group call is made, the hook times out on its own.
    pub async fn reject_event(&self, err: SentinelError, event: &LifecycleEvent) {
        debug!(request_id = %event.request_id, error = %err, "event rejected for processing");
        {
            let mut state = self.state.lock().unwrap();
            state.rejected_events += 1;
        }
        metrics::REJECTED_EVENTS_TOTAL.inc();

        if event.receipt_handle.is_empty() {
            error!(error = %err, "event rejected: invalid message, nothing to delete");
            return;
        }
        if let Err(err) = self
            .services
            .queue
            .delete(&event.queue_url, &event.receipt_handle)
            .await
        {
            error!(error = %err, "failed to delete message");
        }
    }

    /// Orchestrate one accepted event: heartbeat driver, crash-resume
    /// annotation, node drain, load balancer deregistration, annotation
    /// cleanup. A drain failure still runs the deregister stage; the drain
    /// error takes precedence when both stages fail.
    pub(crate) async fn handle_event(&self, event: &LifecycleEvent) -> Result<()> {
        if event.heartbeat_interval > 0 {
            tokio::spawn(send_heartbeat(self.services.scaling.clone(), event.clone()));
        }

        let node_name = event.node_name();
        match event.raw_message.as_ref().map(serde_json::to_string) {
            Some(Ok(stored)) => {
                if let Err(err) = self
                    .services
                    .cluster
                    .annotate_node(&node_name, IN_PROGRESS_ANNOTATION_KEY, &stored)
                    .await
                {
                    error!(node = %node_name, error = %err, "failed to store in-progress annotation");
                }
            }
            _ => error!("failed to serialize message for storage, event cannot be restored"),
        }

        metrics::DRAINING_INSTANCES.inc();
        let drain_result = self.drain_node_target(event).await;
        metrics::DRAINING_INSTANCES.dec();
        if drain_result.is_err() {
            metrics::FAILED_NODE_DRAIN_TOTAL.inc();
        }

        let deregister_result = if self.settings.with_deregister {
            metrics::DEREGISTERING_INSTANCES.inc();
            let result = self.drain_loadbalancer_target(event).await;
            metrics::DEREGISTERING_INSTANCES.dec();
            if result.is_err() {
                metrics::FAILED_LB_DEREGISTER_TOTAL.inc();
            }
            result
        } else {
            Ok(())
        };

        drain_result.and(deregister_result)?;

        // clear the stored state once processing is over
        if let Err(err) = self
            .services
            .cluster
            .annotate_node(&node_name, IN_PROGRESS_ANNOTATION_KEY, "")
            .await
        {
            error!(node = %node_name, error = %err, "failed to clear in-progress annotation");
        }
        Ok(())
    }

    /// Drain the referenced node through the drain tool
    pub(crate) async fn drain_node_target(&self, event: &LifecycleEvent) -> Result<()> {
        let node_name = event.node_name();
        let timeout = Duration::from_secs(self.settings.drain_timeout_seconds.max(0) as u64);
        let retry_interval =
            Duration::from_secs(self.settings.drain_retry_interval_seconds.max(0) as u64);

        if let Err(err) = self
            .services
            .drainer
            .drain(&node_name, timeout, retry_interval)
            .await
        {
            self.publish(ClusterEvent::drain_failed(event, &err)).await;
            return Err(err);
        }

        info!(node = %node_name, "completed drain for node");
        event.mark_drain_completed();
        metrics::SUCCESSFUL_NODE_DRAIN_TOTAL.inc();
        self.publish(ClusterEvent::drain_succeeded(event)).await;
        Ok(())
    }

    /// Publish a cluster event, logging failures instead of propagating them
    pub(crate) async fn publish(&self, event: ClusterEvent) {
        if let Err(err) = self.services.cluster.publish_event(event).await {
            error!(error = %err, "failed to publish event");
        }
    }

    /// Number of successfully completed events
    pub fn completed_events(&self) -> usize {
        self.state.lock().unwrap().completed_events
    }

    /// Number of failed events
    pub fn failed_events(&self) -> usize {
        self.state.lock().unwrap().failed_events
    }

    /// Number of rejected messages
    pub fn rejected_events(&self) -> usize {
        self.state.lock().unwrap().rejected_events
    }

    /// Smoothed event processing latency in seconds
    pub fn average_latency(&self) -> f64 {
        self.state.lock().unwrap().average_latency
    }

    /// Number of events currently in the work queue
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().work_queue.len()
    }
}
