//! Load balancer pool integration
//!
//! Two generations of pools are supported: v2 target groups and classic
//! balancers. For each the controller needs discovery (paginated listing),
//! membership lookup (health describe), deregistration, and a bounded waiter
//! that polls until the pool reports the instance drained.
//!
//! Membership lookups during the discovery phase go through a TTL response
//! cache. A fleet turning over quickly can recycle an instance into a new node
//! before the cache expires, so the caches are flushed whenever a young node
//! terminates. Waiter polls never use the cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_elasticloadbalancing::types::Instance as ElbInstance;
use aws_sdk_elasticloadbalancing::Client as ElbClient;
use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetHealthStateEnum};
use aws_sdk_elasticloadbalancingv2::Client as Elbv2Client;
use tracing::debug;

use crate::config::WaiterSettings;
use crate::error::{Result, SentinelError};
use crate::event::CompletionFlag;

/// Default TTL for the membership response caches
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(180);

/// Classic balancer state of an instance that finished draining
const OUT_OF_SERVICE: &str = "OutOfService";

/// Abstract v2 target group operations consumed by the controller
#[async_trait]
pub trait TargetGroups: Send + Sync {
    /// ARNs of all target groups in the account
    async fn list_target_groups(&self) -> Result<Vec<String>>;

    /// Port the instance is registered on, when it is a member of the group
    async fn find_instance(&self, arn: &str, instance_id: &str) -> Result<Option<i32>>;

    /// Request deregistration of the instance from the group
    async fn deregister(&self, arn: &str, instance_id: &str, port: i32) -> Result<()>;

    /// Poll until the target reports drained, honoring the waiter settings and
    /// the event completion flag
    async fn wait_deregistered(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
        waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()>;

    /// Drop memoized membership responses
    fn flush_cache(&self) {}
}

/// Abstract classic balancer operations consumed by the controller
#[async_trait]
pub trait ClassicBalancers: Send + Sync {
    /// Names of all classic balancers in the account
    async fn list_balancers(&self) -> Result<Vec<String>>;

    /// Whether the instance is a member of the balancer
    async fn find_instance(&self, name: &str, instance_id: &str) -> Result<bool>;

    /// Request deregistration of the instance from the balancer
    async fn deregister(&self, name: &str, instance_id: &str) -> Result<()>;

    /// Poll until the instance reports out of service, honoring the waiter
    /// settings and the event completion flag
    async fn wait_deregistered(
        &self,
        name: &str,
        instance_id: &str,
        waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()>;

    /// Drop memoized membership responses
    fn flush_cache(&self) {}
}

/// Delay before the next waiter poll, doubling from the minimum and capped at
/// the maximum
pub(crate) fn backoff_delay(waiter: &WaiterSettings, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    waiter.min_delay.saturating_mul(factor).min(waiter.max_delay)
}

/// TTL response cache for membership lookups
pub(crate) struct ResponseCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> ResponseCache<T> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|(stored, value)| {
            (stored.elapsed() < self.ttl).then(|| value.clone())
        })
    }

    pub(crate) fn put(&self, key: &str, value: T) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), (Instant::now(), value));
    }

    pub(crate) fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// v2 target group service backed by the elastic load balancing v2 API
pub struct TargetGroupService {
    client: Elbv2Client,
    // arn -> registered (instance id, port) pairs
    health_cache: ResponseCache<Vec<(String, i32)>>,
}

impl TargetGroupService {
    /// Create a target group service from an ELBv2 client
    pub fn new(client: Elbv2Client) -> Self {
        Self {
            client,
            health_cache: ResponseCache::new(HEALTH_CACHE_TTL),
        }
    }

    async fn registered_targets(&self, arn: &str) -> Result<Vec<(String, i32)>> {
        if let Some(cached) = self.health_cache.get(arn) {
            return Ok(cached);
        }
        let output = self
            .client
            .describe_target_health()
            .target_group_arn(arn)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_target_group_not_found_exception() {
                    SentinelError::not_found(format!("target group {arn}"))
                } else {
                    SentinelError::load_balancer(format!(
                        "failed to describe target health for {arn}: {err}"
                    ))
                }
            })?;
        let targets: Vec<(String, i32)> = output
            .target_health_descriptions()
            .iter()
            .filter_map(|desc| {
                let target = desc.target()?;
                Some((target.id()?.to_string(), target.port().unwrap_or_default()))
            })
            .collect();
        self.health_cache.put(arn, targets.clone());
        Ok(targets)
    }

    // Uncached single-target health poll used by the waiter. An absent state
    // means the target is no longer registered.
    async fn target_state(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
    ) -> Result<Option<TargetHealthStateEnum>> {
        let output = self
            .client
            .describe_target_health()
            .target_group_arn(arn)
            .targets(
                TargetDescription::builder()
                    .id(instance_id)
                    .port(port)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_target_group_not_found_exception() {
                    SentinelError::not_found(format!("target group {arn}"))
                } else {
                    SentinelError::load_balancer(format!(
                        "failed to describe target health for {arn}: {err}"
                    ))
                }
            })?;
        for desc in output.target_health_descriptions() {
            let matches = desc
                .target()
                .map(|t| t.id() == Some(instance_id))
                .unwrap_or(false);
            if matches {
                return Ok(desc.target_health().and_then(|h| h.state().cloned()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TargetGroups for TargetGroupService {
    async fn list_target_groups(&self) -> Result<Vec<String>> {
        let mut arns = Vec::new();
        let mut pages = self.client.describe_target_groups().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                SentinelError::load_balancer(format!("failed to describe target groups: {e}"))
            })?;
            for group in page.target_groups() {
                if let Some(arn) = group.target_group_arn() {
                    arns.push(arn.to_string());
                }
            }
        }
        Ok(arns)
    }

    async fn find_instance(&self, arn: &str, instance_id: &str) -> Result<Option<i32>> {
        let targets = self.registered_targets(arn).await?;
        Ok(targets
            .iter()
            .find(|(id, _)| id == instance_id)
            .map(|(_, port)| *port))
    }

    async fn deregister(&self, arn: &str, instance_id: &str, port: i32) -> Result<()> {
        debug!(arn = %arn, instance_id = %instance_id, "deregistering target");
        self.client
            .deregister_targets()
            .target_group_arn(arn)
            .targets(
                TargetDescription::builder()
                    .id(instance_id)
                    .port(port)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_target_group_not_found_exception() {
                    SentinelError::not_found(format!("target group {arn}"))
                } else if err.is_invalid_target_exception() {
                    SentinelError::invalid_target(format!("{instance_id} in {arn}"))
                } else {
                    SentinelError::load_balancer(format!(
                        "failed to deregister {instance_id} from {arn}: {err}"
                    ))
                }
            })?;
        Ok(())
    }

    async fn wait_deregistered(
        &self,
        arn: &str,
        instance_id: &str,
        port: i32,
        waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()> {
        for attempt in 0..waiter.max_attempts {
            if cancel.is_set() {
                return Err(SentinelError::EventFinished);
            }
            match self.target_state(arn, instance_id, port).await {
                Ok(None) | Ok(Some(TargetHealthStateEnum::Unused)) => return Ok(()),
                Ok(Some(state)) => {
                    debug!(arn = %arn, state = ?state, "target still draining");
                }
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            }
            tokio::time::sleep(backoff_delay(waiter, attempt)).await;
        }
        Err(SentinelError::WaiterTimeout(waiter.max_attempts))
    }

    fn flush_cache(&self) {
        self.health_cache.flush();
    }
}

/// Classic balancer service backed by the elastic load balancing API
pub struct ClassicBalancerService {
    client: ElbClient,
    // balancer name -> (instance id, state) pairs
    health_cache: ResponseCache<Vec<(String, String)>>,
}

impl ClassicBalancerService {
    /// Create a classic balancer service from an ELB client
    pub fn new(client: ElbClient) -> Self {
        Self {
            client,
            health_cache: ResponseCache::new(HEALTH_CACHE_TTL),
        }
    }

    async fn instance_states(&self, name: &str, cached: bool) -> Result<Vec<(String, String)>> {
        if cached {
            if let Some(hit) = self.health_cache.get(name) {
                return Ok(hit);
            }
        }
        let output = self
            .client
            .describe_instance_health()
            .load_balancer_name(name)
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_access_point_not_found_exception() {
                    SentinelError::not_found(format!("classic-elb {name}"))
                } else {
                    SentinelError::load_balancer(format!(
                        "failed to describe instance health for {name}: {err}"
                    ))
                }
            })?;
        let states: Vec<(String, String)> = output
            .instance_states()
            .iter()
            .filter_map(|state| {
                Some((
                    state.instance_id()?.to_string(),
                    state.state().unwrap_or_default().to_string(),
                ))
            })
            .collect();
        if cached {
            self.health_cache.put(name, states.clone());
        }
        Ok(states)
    }
}

#[async_trait]
impl ClassicBalancers for ClassicBalancerService {
    async fn list_balancers(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pages = self.client.describe_load_balancers().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                SentinelError::load_balancer(format!("failed to describe load balancers: {e}"))
            })?;
            for description in page.load_balancer_descriptions() {
                if let Some(name) = description.load_balancer_name() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    async fn find_instance(&self, name: &str, instance_id: &str) -> Result<bool> {
        let states = self.instance_states(name, true).await?;
        Ok(states.iter().any(|(id, _)| id == instance_id))
    }

    async fn deregister(&self, name: &str, instance_id: &str) -> Result<()> {
        debug!(balancer = %name, instance_id = %instance_id, "deregistering instance");
        self.client
            .deregister_instances_from_load_balancer()
            .load_balancer_name(name)
            .instances(ElbInstance::builder().instance_id(instance_id).build())
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_access_point_not_found_exception() {
                    SentinelError::not_found(format!("classic-elb {name}"))
                } else if err.is_invalid_end_point_exception() {
                    SentinelError::invalid_target(format!("{instance_id} in {name}"))
                } else {
                    SentinelError::load_balancer(format!(
                        "failed to deregister {instance_id} from {name}: {err}"
                    ))
                }
            })?;
        Ok(())
    }

    async fn wait_deregistered(
        &self,
        name: &str,
        instance_id: &str,
        waiter: &WaiterSettings,
        cancel: &CompletionFlag,
    ) -> Result<()> {
        for attempt in 0..waiter.max_attempts {
            if cancel.is_set() {
                return Err(SentinelError::EventFinished);
            }
            match self.instance_states(name, false).await {
                Ok(states) => {
                    let current = states
                        .iter()
                        .find(|(id, _)| id == instance_id)
                        .map(|(_, state)| state.as_str());
                    match current {
                        None | Some(OUT_OF_SERVICE) => return Ok(()),
                        Some(state) => {
                            debug!(balancer = %name, state = %state, "instance still draining");
                        }
                    }
                }
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            }
            tokio::time::sleep(backoff_delay(waiter, attempt)).await;
        }
        Err(SentinelError::WaiterTimeout(waiter.max_attempts))
    }

    fn flush_cache(&self) {
        self.health_cache.flush();
    }
}
