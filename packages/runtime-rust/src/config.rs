use std::time::Duration;

/// Engine-level configuration.
///
/// Scalar tunables only; how they are loaded (CLI, env, files) is up to
/// the embedding binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long `wait_status_up` waits before giving up.
    pub wait_up_timeout_ms: u64,
    /// Grace period during shutdown in which peers can observe our DOWN
    /// status before transports close. Zero disables the wait.
    pub turn_down_wait_secs: u64,
    /// Upper bound for the in-flight invocation drain at shutdown.
    pub drain_timeout_ms: u64,
    /// Poll granularity of the in-flight drain.
    pub drain_poll_interval_ms: u64,
    /// Interval between register/heartbeat pushes and dead-instance sweeps.
    pub heartbeat_interval_ms: u64,
    /// An instance whose last heartbeat is older than this is evicted.
    pub dead_instance_timeout_ms: u64,
    /// How long the registry waits for a newly seen peer to serve its
    /// metadata before dropping the register message.
    pub discovery_fetch_timeout_ms: u64,
    /// Capacity of the registry message queue.
    pub executor_capacity: usize,
    /// Default per-invocation timeout.
    pub invocation_timeout_ms: u64,
    /// Maximum number of concurrent invocations before load shedding.
    pub max_concurrent_invocations: u32,
}

impl EngineConfig {
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    #[must_use]
    pub fn dead_instance_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_instance_timeout_ms)
    }

    #[must_use]
    pub fn discovery_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_fetch_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wait_up_timeout_ms: 10_000,
            turn_down_wait_secs: 0,
            drain_timeout_ms: 30_000,
            drain_poll_interval_ms: 1_000,
            heartbeat_interval_ms: 30_000,
            dead_instance_timeout_ms: 90_000,
            discovery_fetch_timeout_ms: 5_000,
            executor_capacity: 256,
            invocation_timeout_ms: 30_000,
            max_concurrent_invocations: 10_000,
        }
    }
}
