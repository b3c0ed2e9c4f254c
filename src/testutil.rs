//! Stub services for tests
//!
//! Each stub implements one of the service traits, records call counts and
//! arguments, and can be primed with fixture data or a failure hint. The
//! failure hints mirror the error classification of the production services:
//! `"not-found"` and `"invalid-target"` produce skippable errors, anything
//! else produces a hard load balancer error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::balancer::{ClassicBalancers, TargetGroups};
use crate::cluster::ClusterNodes;
use crate::config::{Settings, WaiterSettings};
use crate::error::{Result, SentinelError};
use crate::event::{
    CompletionFlag, LifecycleEvent, NodeRef, QueueMessage, TERMINATION_TRANSITION,
};
use crate::events::ClusterEvent;
use crate::kubectl::NodeDrain;
use crate::manager::Services;
use crate::queue::MessageQueue;
use crate::scaling::{LifecycleAction, ScalingGroups};

fn hinted_error(hint: &str, what: &str) -> SentinelError {
    match hint {
        "not-found" => SentinelError::not_found(what.to_string()),
        "invalid-target" => SentinelError::invalid_target(what.to_string()),
        other => SentinelError::load_balancer(other.to_string()),
    }
}

/// Scaling group stub
#[derive(Default)]
pub(crate) struct StubScalingGroups {
    pub heartbeat_timeout: Option<i64>,
    pub fail_heartbeat: bool,
    pub times_called_heartbeat: AtomicUsize,
    pub times_called_complete: AtomicUsize,
    pub last_action: Mutex<Option<LifecycleAction>>,
}

#[async_trait]
impl ScalingGroups for StubScalingGroups {
    async fn hook_heartbeat_interval(&self, asg_name: &str, hook_name: &str) -> Result<i64> {
        self.heartbeat_timeout.ok_or_else(|| {
            SentinelError::not_found(format!(
                "lifecycle hook {hook_name} for scaling group {asg_name}"
            ))
        })
    }

    async fn record_heartbeat(&self, _event: &LifecycleEvent) -> Result<()> {
        self.times_called_heartbeat.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat {
            return Err(SentinelError::scaling_group("heartbeat failed"));
        }
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        _event: &LifecycleEvent,
        action: LifecycleAction,
    ) -> Result<()> {
        self.times_called_complete.fetch_add(1, Ordering::SeqCst);
        *self.last_action.lock().unwrap() = Some(action);
        Ok(())
    }
}

/// Queue stub; receive returns the primed messages on every call
#[derive(Default)]
pub(crate) struct StubQueue {
    pub messages: Mutex<Vec<QueueMessage>>,
    pub times_called_receive: AtomicUsize,
    pub times_called_delete: AtomicUsize,
}

#[async_trait]
impl MessageQueue for StubQueue {
    async fn queue_url(&self, name: &str) -> Result<String> {
        Ok(format!("https://queue.example/{name}"))
    }

    async fn receive_one(&self, _url: &str, _wait_seconds: i64) -> Result<Vec<QueueMessage>> {
        self.times_called_receive.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn delete(&self, _url: &str, _receipt_handle: &str) -> Result<()> {
        self.times_called_delete.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// v2 target group stub
#[derive(Default)]
pub(crate) struct StubTargetGroups {
    groups: Mutex<Vec<String>>,
    // arn -> (instance id, port, health state)
    targets: Mutex<HashMap<String, Vec<(String, i32, String)>>>,
    fail_hint: Mutex<Option<String>>,
    pub times_called_deregister: AtomicUsize,
    pub times_called_wait: AtomicUsize,
    pub times_called_flush: AtomicUsize,
}

impl StubTargetGroups {
    pub fn add_group(&self, arn: &str) {
        self.groups.lock().unwrap().push(arn.to_string());
    }

    pub fn add_target(&self, arn: &str, instance_id: &str, port: i32, state: &str) {
        self.targets
            .lock()
            .unwrap()
            .entry(arn.to_string())
            .or_default()
            .push((instance_id.to_string(), port, state.to_string()));
    }

    pub fn set_fail_hint(&self, hint: &str) {
        *self.fail_hint.lock().unwrap() = Some(hint.to_string());
    }

    fn fail(&self, what: &str) -> Option<SentinelError> {
        self.fail_hint
            .lock()
            .unwrap()
            .as_deref()
            .map(|hint| hinted_error(hint, what))
    }
}

#[async_trait]
impl TargetGroups for StubTargetGroups {
    async fn list_target_groups(&self) -> Result<Vec<String>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn find_instance(&self, arn: &str, instance_id: &str) -> Result<Option<i32>> {
        if let Some(err) = self.fail(&format!("target group {arn}")) {
            return Err(err);
        }
        Ok(self
            .targets
            .lock()
            .unwrap()
            .get(arn)
            .and_then(|targets| {
                targets
                    .iter()
                    .find(|(id, _, _)| id == instance_id)
                    .map(|(_, port, _)| *port)
            }))
    }

    async fn deregister(&self, arn: &str, _instance_id: &str, _port: i32) -> Result<()> {
        self.times_called_deregister.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail(&format!("target group {arn}")) {
            return Err(err);
        }
        Ok(())
    }

    async fn wait_deregistered(
        &self,
        arn: &str,
        instance_id: &str,
        _port: i32,
        _waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()> {
        self.times_called_wait.fetch_add(1, Ordering::SeqCst);
        if cancel.is_set() {
            return Err(SentinelError::EventFinished);
        }
        if let Some(err) = self.fail(&format!("target group {arn}")) {
            return Err(err);
        }
        let drained = self
            .targets
            .lock()
            .unwrap()
            .get(arn)
            .and_then(|targets| targets.iter().find(|(id, _, _)| id == instance_id))
            .map(|(_, _, state)| state == "unused" || state == "draining-complete")
            .unwrap_or(true);
        if drained {
            Ok(())
        } else {
            Err(SentinelError::WaiterTimeout(1))
        }
    }

    fn flush_cache(&self) {
        self.times_called_flush.fetch_add(1, Ordering::SeqCst);
    }
}

/// Classic balancer stub
#[derive(Default)]
pub(crate) struct StubClassicBalancers {
    balancers: Mutex<Vec<String>>,
    // balancer name -> (instance id, state)
    instances: Mutex<HashMap<String, Vec<(String, String)>>>,
    fail_hint: Mutex<Option<String>>,
    pub times_called_deregister: AtomicUsize,
    pub times_called_wait: AtomicUsize,
    pub times_called_flush: AtomicUsize,
}

impl StubClassicBalancers {
    pub fn add_balancer(&self, name: &str) {
        self.balancers.lock().unwrap().push(name.to_string());
    }

    pub fn add_instance(&self, name: &str, instance_id: &str, state: &str) {
        self.instances
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push((instance_id.to_string(), state.to_string()));
    }

    pub fn set_fail_hint(&self, hint: &str) {
        *self.fail_hint.lock().unwrap() = Some(hint.to_string());
    }

    fn fail(&self, what: &str) -> Option<SentinelError> {
        self.fail_hint
            .lock()
            .unwrap()
            .as_deref()
            .map(|hint| hinted_error(hint, what))
    }
}

#[async_trait]
impl ClassicBalancers for StubClassicBalancers {
    async fn list_balancers(&self) -> Result<Vec<String>> {
        Ok(self.balancers.lock().unwrap().clone())
    }

    async fn find_instance(&self, name: &str, instance_id: &str) -> Result<bool> {
        if let Some(err) = self.fail(&format!("classic-elb {name}")) {
            return Err(err);
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .map(|states| states.iter().any(|(id, _)| id == instance_id))
            .unwrap_or(false))
    }

    async fn deregister(&self, name: &str, _instance_id: &str) -> Result<()> {
        self.times_called_deregister.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail(&format!("classic-elb {name}")) {
            return Err(err);
        }
        Ok(())
    }

    async fn wait_deregistered(
        &self,
        name: &str,
        instance_id: &str,
        _waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()> {
        self.times_called_wait.fetch_add(1, Ordering::SeqCst);
        if cancel.is_set() {
            return Err(SentinelError::EventFinished);
        }
        if let Some(err) = self.fail(&format!("classic-elb {name}")) {
            return Err(err);
        }
        let drained = self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .and_then(|states| states.iter().find(|(id, _)| id == instance_id))
            .map(|(_, state)| state == "OutOfService")
            .unwrap_or(true);
        if drained {
            Ok(())
        } else {
            Err(SentinelError::WaiterTimeout(1))
        }
    }

    fn flush_cache(&self) {
        self.times_called_flush.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cluster stub backed by in-memory nodes, annotations, and published events
#[derive(Default)]
pub(crate) struct StubCluster {
    nodes: Mutex<Vec<NodeRef>>,
    // node name -> annotation key -> value
    annotations: Mutex<HashMap<String, HashMap<String, String>>>,
    pub published: Mutex<Vec<ClusterEvent>>,
}

impl StubCluster {
    pub fn add_node(&self, node: NodeRef) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn set_annotation(&self, node_name: &str, key: &str, value: &str) {
        self.annotations
            .lock()
            .unwrap()
            .entry(node_name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn annotation(&self, node_name: &str, key: &str) -> Option<String> {
        self.annotations
            .lock()
            .unwrap()
            .get(node_name)
            .and_then(|annotations| annotations.get(key).cloned())
    }
}

#[async_trait]
impl ClusterNodes for StubCluster {
    async fn nodes_by_annotation(&self, key: &str) -> Result<Vec<(NodeRef, String)>> {
        let nodes = self.nodes.lock().unwrap().clone();
        let annotations = self.annotations.lock().unwrap();
        Ok(nodes
            .into_iter()
            .filter_map(|node| {
                let value = annotations.get(&node.name)?.get(key)?.clone();
                Some((node, value))
            })
            .collect())
    }

    async fn find_node_by_instance(&self, instance_id: &str) -> Result<Option<NodeRef>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|node| node.provider_id.contains(instance_id))
            .cloned())
    }

    async fn annotate_node(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        self.set_annotation(node_name, key, value);
        Ok(())
    }

    async fn publish_event(&self, event: ClusterEvent) -> Result<()> {
        self.published.lock().unwrap().push(event);
        Ok(())
    }
}

/// Drain tool stub
#[derive(Default)]
pub(crate) struct StubDrainer {
    fail_drain: AtomicBool,
    fail_label: AtomicBool,
    pub drained: Mutex<Vec<String>>,
    pub labeled: Mutex<Vec<(String, String, String)>>,
}

impl StubDrainer {
    pub fn set_fail_drain(&self, fail: bool) {
        self.fail_drain.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_label(&self, fail: bool) {
        self.fail_label.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeDrain for StubDrainer {
    async fn drain(
        &self,
        node_name: &str,
        _timeout: Duration,
        _retry_interval: Duration,
    ) -> Result<()> {
        if self.fail_drain.load(Ordering::SeqCst) {
            return Err(SentinelError::drain(format!("drain of {node_name} failed")));
        }
        self.drained.lock().unwrap().push(node_name.to_string());
        Ok(())
    }

    async fn label(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        if self.fail_label.load(Ordering::SeqCst) {
            return Err(SentinelError::drain(format!("label of {node_name} failed")));
        }
        self.labeled.lock().unwrap().push((
            node_name.to_string(),
            key.to_string(),
            value.to_string(),
        ));
        Ok(())
    }
}

/// One stub per service trait, sharing ownership with the manager under test
pub(crate) struct StubSet {
    pub scaling: Arc<StubScalingGroups>,
    pub queue: Arc<StubQueue>,
    pub target_groups: Arc<StubTargetGroups>,
    pub classic_balancers: Arc<StubClassicBalancers>,
    pub cluster: Arc<StubCluster>,
    pub drainer: Arc<StubDrainer>,
}

impl StubSet {
    /// Stubs with a lifecycle hook answering with the given heartbeat timeout
    pub fn with_hook_timeout(heartbeat_timeout: i64) -> Self {
        Self {
            scaling: Arc::new(StubScalingGroups {
                heartbeat_timeout: Some(heartbeat_timeout),
                ..Default::default()
            }),
            queue: Arc::new(StubQueue::default()),
            target_groups: Arc::new(StubTargetGroups::default()),
            classic_balancers: Arc::new(StubClassicBalancers::default()),
            cluster: Arc::new(StubCluster::default()),
            drainer: Arc::new(StubDrainer::default()),
        }
    }

    /// The stubs as a service bundle for a manager
    pub fn services(&self) -> Services {
        Services {
            scaling: self.scaling.clone(),
            queue: self.queue.clone(),
            target_groups: self.target_groups.clone(),
            classic_balancers: self.classic_balancers.clone(),
            cluster: self.cluster.clone(),
            drainer: self.drainer.clone(),
        }
    }
}

/// Settings with jitter disabled and short waiter delays
pub(crate) fn test_settings() -> Settings {
    Settings {
        region: "us-west-2".to_string(),
        queue_name: "my-queue".to_string(),
        kubectl_path: "kubectl".to_string(),
        drain_timeout_seconds: 1,
        drain_retry_interval_seconds: 1,
        polling_interval_seconds: 1,
        with_deregister: false,
        metrics_port: 0,
        thread_jitter_range_seconds: 0.0,
        iteration_jitter_range_seconds: 0.0,
        node_age_cache_ttl_minutes: 100,
        waiter: WaiterSettings {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            max_attempts: 3,
        },
    }
}

/// A node backed by the given provider id, named after its last path segment
pub(crate) fn test_node(provider_id: &str) -> NodeRef {
    let name = provider_id.rsplit('/').next().unwrap_or("node").to_string();
    NodeRef {
        name: format!("node-{name}"),
        provider_id: provider_id.to_string(),
        created_at: None,
    }
}

/// An accepted event for the given instance
pub(crate) fn test_event(instance_id: &str) -> LifecycleEvent {
    LifecycleEvent {
        hook_name: "my-hook".to_string(),
        account_id: "12345689012".to_string(),
        request_id: "63f5b5c2-58b3-0574-b7d5-b3162d0268f0".to_string(),
        transition: TERMINATION_TRANSITION.to_string(),
        asg_name: "my-asg".to_string(),
        instance_id: instance_id.to_string(),
        action_token: "cc34960c-1e41-4703-a665-bdb3e5b81ad3".to_string(),
        receipt_handle: "MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+STFFljTM8tJJg6HRG6PYSasuWXPJB+Cw="
            .to_string(),
        queue_url: "some-queue".to_string(),
        ..Default::default()
    }
}

/// A valid termination notification message for the given instance
pub(crate) fn sample_message(instance_id: &str) -> QueueMessage {
    QueueMessage {
        body: format!(
            r#"{{"LifecycleHookName":"my-hook","AccountId":"12345689012","RequestId":"63f5b5c2-58b3-0574-b7d5-b3162d0268f0","LifecycleTransition":"autoscaling:EC2_INSTANCE_TERMINATING","AutoScalingGroupName":"my-asg","Service":"AWS Auto Scaling","Time":"2019-09-27T02:39:14.183Z","EC2InstanceId":"{instance_id}","LifecycleActionToken":"cc34960c-1e41-4703-a665-bdb3e5b81ad3"}}"#
        ),
        receipt_handle: "MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+STFFljTM8tJJg6HRG6PYSasuWXPJB+Cw="
            .to_string(),
    }
}
