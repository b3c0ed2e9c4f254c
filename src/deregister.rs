//! Load balancer deregistration stage
//!
//! Discovery, deregistration, and drain-waiting for every pool that contains
//! the terminating instance. Ordering is strict: discover all pools, filter to
//! active memberships, request deregistration serially, then wait on all pools
//! concurrently. The coordinator exits on the first of all-waiters-done, first
//! error, or event completion.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SentinelError};
use crate::event::LifecycleEvent;
use crate::events::ClusterEvent;
use crate::manager::{Manager, EXCLUDE_LABEL_KEY, EXCLUDE_LABEL_VALUE};
use crate::metrics;

/// Lower bound of every jitter sleep
const MIN_JITTER_SECONDS: f64 = 0.3;

/// Sleep a uniformly random duration in `[0.3, range_seconds]`, used to
/// de-correlate parallel workers hitting the same cloud APIs. A range at or
/// below the lower bound disables the sleep.
pub(crate) async fn wait_jitter(range_seconds: f64) {
    if range_seconds <= MIN_JITTER_SECONDS {
        return;
    }
    let seconds = rand::thread_rng().gen_range(MIN_JITTER_SECONDS..range_seconds);
    debug!(seconds, "adding jitter before next call");
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
}

impl Manager {
    /// Deregister the instance from every pool that contains it and wait for
    /// the pools to finish draining
    pub(crate) async fn drain_loadbalancer_target(&self, event: &LifecycleEvent) -> Result<()> {
        let instance_id = event.instance_id.clone();
        let node = event.referenced_node.clone().unwrap_or_default();
        let settings = &self.settings;

        wait_jitter(settings.thread_jitter_range_seconds).await;

        debug!(node = %node.name, "excluding node from load balancers");
        self.services
            .drainer
            .label(&node.name, EXCLUDE_LABEL_KEY, EXCLUDE_LABEL_VALUE)
            .await?;

        // a young node can be backed by an instance recycled before the cache
        // expired, so its membership answers cannot be trusted
        if let Some(created_at) = node.created_at {
            let node_age_minutes = Utc::now().signed_duration_since(created_at).num_minutes();
            if node_age_minutes <= settings.node_age_cache_ttl_minutes {
                info!(
                    ttl_minutes = settings.node_age_cache_ttl_minutes,
                    "node younger than cache TTL was terminated, flushing health caches"
                );
                self.services.target_groups.flush_cache();
                self.services.classic_balancers.flush_cache();
            }
        }

        let target_groups = self.services.target_groups.list_target_groups().await?;
        let balancers = self.services.classic_balancers.list_balancers().await?;

        info!(instance_id = %instance_id, "checking target group and classic balancer membership");
        let mut active_target_groups: Vec<(String, i32)> = Vec::new();
        for (index, arn) in target_groups.iter().enumerate() {
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            debug!(
                instance_id = %instance_id,
                arn = %arn,
                progress = %format!("{}/{}", index + 1, target_groups.len()),
                "checking target group membership"
            );
            match self
                .services
                .target_groups
                .find_instance(arn, &instance_id)
                .await
            {
                Ok(Some(port)) => {
                    active_target_groups.push((arn.clone(), port));
                }
                Ok(None) => {}
                Err(err) if err.is_not_found() => {
                    warn!(arn = %arn, "target group not found, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        let mut active_balancers: Vec<String> = Vec::new();
        for (index, name) in balancers.iter().enumerate() {
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            debug!(
                instance_id = %instance_id,
                balancer = %name,
                progress = %format!("{}/{}", index + 1, balancers.len()),
                "checking classic balancer membership"
            );
            match self
                .services
                .classic_balancers
                .find_instance(name, &instance_id)
                .await
            {
                Ok(true) => active_balancers.push(name.clone()),
                Ok(false) => {}
                Err(err) if err.is_not_found() => {
                    warn!(balancer = %name, "classic balancer not found, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        let work_items = active_target_groups.len() + active_balancers.len();
        info!(
            target_groups = active_target_groups.len(),
            classic_balancers = active_balancers.len(),
            instance_id = %instance_id,
            "found active memberships"
        );
        let (err_tx, mut err_rx) = mpsc::channel::<SentinelError>((work_items * 2).max(1));

        info!(instance_id = %instance_id, "starting deregistration");
        let mut deregistered_balancers: Vec<String> = Vec::new();
        for (index, name) in active_balancers.iter().enumerate() {
            if event.is_completed() {
                return Err(SentinelError::EventFinished);
            }
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            debug!(
                instance_id = %instance_id,
                balancer = %name,
                progress = %format!("{}/{}", index + 1, active_balancers.len()),
                "deregistering instance"
            );
            match self
                .services
                .classic_balancers
                .deregister(name, &instance_id)
                .await
            {
                Ok(()) => deregistered_balancers.push(name.clone()),
                Err(err) if err.is_not_found() => {
                    warn!(balancer = %name, "classic balancer not found, skipping");
                }
                Err(err) if err.is_invalid_target() => {
                    warn!(balancer = %name, instance_id = %instance_id, "instance not found in balancer, skipping");
                }
                Err(err) => {
                    error!(instance_id = %instance_id, balancer = %name, error = %err, "instance deregistration failed");
                    self.publish(ClusterEvent::instance_deregister_failed(event, name, &err))
                        .await;
                    let _ = err_tx.send(err).await;
                }
            }
        }

        let mut deregistered_target_groups: Vec<(String, i32)> = Vec::new();
        for (index, (arn, port)) in active_target_groups.iter().enumerate() {
            if event.is_completed() {
                return Err(SentinelError::EventFinished);
            }
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            debug!(
                instance_id = %instance_id,
                arn = %arn,
                progress = %format!("{}/{}", index + 1, active_target_groups.len()),
                "deregistering target"
            );
            match self
                .services
                .target_groups
                .deregister(arn, &instance_id, *port)
                .await
            {
                Ok(()) => deregistered_target_groups.push((arn.clone(), *port)),
                Err(err) if err.is_not_found() => {
                    warn!(arn = %arn, "target group not found, skipping");
                }
                Err(err) if err.is_invalid_target() => {
                    warn!(arn = %arn, instance_id = %instance_id, "target not found in target group, skipping");
                }
                Err(err) => {
                    error!(instance_id = %instance_id, arn = %arn, error = %err, "target deregistration failed");
                    self.publish(ClusterEvent::target_deregister_failed(
                        event, arn, *port, &err,
                    ))
                    .await;
                    let _ = err_tx.send(err).await;
                }
            }
        }

        info!(instance_id = %instance_id, "starting deregistration waiters");
        let mut waiters = JoinSet::new();

        for name in deregistered_balancers {
            if event.is_completed() {
                return Err(SentinelError::EventFinished);
            }
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            let classic_balancers = self.services.classic_balancers.clone();
            let cluster = self.services.cluster.clone();
            let waiter = settings.waiter.clone();
            let event = event.clone();
            let instance = instance_id.clone();
            let errors = err_tx.clone();
            waiters.spawn(async move {
                debug!(balancer = %name, instance_id = %instance, "starting drain waiter for classic balancer");
                let cancel = event.completion_flag();
                match classic_balancers
                    .wait_deregistered(&name, &instance, &waiter, &cancel)
                    .await
                {
                    Ok(()) => {
                        let out = ClusterEvent::instance_deregister_succeeded(&event, &name);
                        if let Err(err) = cluster.publish_event(out).await {
                            error!(error = %err, "failed to publish event");
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        warn!(balancer = %name, "classic balancer not found, skipping");
                    }
                    Err(err) => {
                        let _ = errors.send(err).await;
                    }
                }
            });
        }

        for (arn, port) in deregistered_target_groups {
            if event.is_completed() {
                return Err(SentinelError::EventFinished);
            }
            wait_jitter(settings.iteration_jitter_range_seconds).await;
            let target_groups = self.services.target_groups.clone();
            let cluster = self.services.cluster.clone();
            let waiter = settings.waiter.clone();
            let event = event.clone();
            let instance = instance_id.clone();
            let errors = err_tx.clone();
            waiters.spawn(async move {
                debug!(arn = %arn, instance_id = %instance, "starting drain waiter for target group");
                let cancel = event.completion_flag();
                match target_groups
                    .wait_deregistered(&arn, &instance, port, &waiter, &cancel)
                    .await
                {
                    Ok(()) => {
                        let out = ClusterEvent::target_deregister_succeeded(&event, &arn, port);
                        if let Err(err) = cluster.publish_event(out).await {
                            error!(error = %err, "failed to publish event");
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        warn!(arn = %arn, "target group not found, skipping");
                    }
                    Err(err) => {
                        let _ = errors.send(err).await;
                    }
                }
            });
        }
        drop(err_tx);

        // first signal wins: all waiters done, or the first error. Dropping
        // the set on the error path cancels the outstanding waiters.
        let outcome = tokio::select! {
            _ = async {
                while waiters.join_next().await.is_some() {}
            } => Ok(()),
            Some(err) = err_rx.recv() => Err(SentinelError::load_balancer(format!(
                "failed to process load balancer drain: {err}"
            ))),
        };
        outcome?;

        debug!(instance_id = %instance_id, "successfully executed all deregistration tasks");
        metrics::SUCCESSFUL_LB_DEREGISTER_TOTAL.inc();
        event.mark_deregister_completed();
        Ok(())
    }
}
