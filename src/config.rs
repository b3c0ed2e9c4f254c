//! Runtime configuration for the controller
//!
//! All tunables are injected through the [`Settings`] carried by the Manager
//! rather than process-wide mutable state, so tests can run with jitter and
//! waiter delays turned down without touching globals.

use std::time::Duration;

/// Parameters for the deregistration waiters
#[derive(Debug, Clone)]
pub struct WaiterSettings {
    /// First backoff delay between health polls
    pub min_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_delay: Duration,
    /// Maximum number of health polls before giving up
    pub max_attempts: u32,
}

impl Default for WaiterSettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(30),
            max_attempts: 500,
        }
    }
}

/// Runtime settings for the controller
#[derive(Debug, Clone)]
pub struct Settings {
    /// AWS region the controller operates in
    pub region: String,
    /// Name of the queue delivering lifecycle hook notifications
    pub queue_name: String,
    /// Path to the kubectl binary used for drain and label operations
    pub kubectl_path: String,
    /// Hard time limit for a node drain
    pub drain_timeout_seconds: i64,
    /// Interval between drain retries
    pub drain_retry_interval_seconds: i64,
    /// Long-poll wait for queue receives, and the retry sleep on receive errors
    pub polling_interval_seconds: i64,
    /// Whether terminating instances are deregistered from load balancer pools
    pub with_deregister: bool,
    /// Port the metrics endpoint listens on
    pub metrics_port: u16,
    /// Jitter range in seconds applied once per deregistration run
    pub thread_jitter_range_seconds: f64,
    /// Jitter range in seconds applied before each pool API call
    pub iteration_jitter_range_seconds: f64,
    /// Node age in minutes below which the health caches are flushed
    pub node_age_cache_ttl_minutes: i64,
    /// Backoff parameters for the deregistration waiters
    pub waiter: WaiterSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: String::new(),
            queue_name: String::new(),
            kubectl_path: "/usr/local/bin/kubectl".to_string(),
            drain_timeout_seconds: 300,
            drain_retry_interval_seconds: 30,
            polling_interval_seconds: 10,
            with_deregister: true,
            metrics_port: 8080,
            thread_jitter_range_seconds: 30.0,
            iteration_jitter_range_seconds: 1.0,
            node_age_cache_ttl_minutes: 90,
            waiter: WaiterSettings::default(),
        }
    }
}
