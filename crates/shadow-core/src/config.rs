//! Configuration for shadow pod orchestration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::error::CoreError;
use crate::exec::ExecConfig;
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::poller::{PollConfig, DEFAULT_POLL_INTERVAL, DEFAULT_TERMINATE_ATTEMPTS};
use crate::refcount::ConflictRetryPolicy;
use crate::watcher::ReconnectPolicy;
use std::time::Duration;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Configuration for shadow pod orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Namespace the shadow pods live in.
    pub namespace: String,

    /// Interval between lifecycle observations (default: 6s).
    pub poll_interval: Duration,

    /// Attempt cap for termination waits (default: 10).
    pub terminate_attempts: u32,

    /// Interval between heartbeat annotations (default: 60s).
    pub heartbeat_interval: Duration,

    /// What a watch does when its stream breaks (default: resubscribe).
    pub reconnect: ReconnectPolicy,

    /// Retries for a conflicting ref-count update (default: 3).
    pub conflict_retries: u32,

    /// Limit on remote command duration (default: none).
    pub exec_timeout: Option<Duration>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("terminate attempts must be at least 1")]
    ZeroTerminateAttempts,

    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("exec timeout must be greater than zero")]
    ZeroExecTimeout,
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            terminate_attempts: DEFAULT_TERMINATE_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            conflict_retries: ConflictRetryPolicy::default().max_retries,
            exec_timeout: None,
        }
    }
}

impl ShadowConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SHADOW_NAMESPACE` | `default` |
    /// | `SHADOW_POLL_INTERVAL_SECS` | `6` |
    /// | `SHADOW_TERMINATE_ATTEMPTS` | `10` |
    /// | `SHADOW_HEARTBEAT_SECS` | `60` |
    /// | `SHADOW_WATCH_RECONNECT` | `resubscribe` (resubscribe, fail) |
    /// | `SHADOW_CONFLICT_RETRIES` | `3` |
    /// | `SHADOW_EXEC_TIMEOUT_SECS` | unset (no limit) |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            namespace: lookup("SHADOW_NAMESPACE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default.namespace),
            poll_interval: parsed("SHADOW_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.poll_interval),
            terminate_attempts: parsed("SHADOW_TERMINATE_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default.terminate_attempts),
            heartbeat_interval: parsed("SHADOW_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.heartbeat_interval),
            reconnect: lookup("SHADOW_WATCH_RECONNECT")
                .map(|v| ReconnectPolicy::parse(&v))
                .unwrap_or(default.reconnect),
            conflict_retries: parsed("SHADOW_CONFLICT_RETRIES")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(default.conflict_retries),
            exec_timeout: parsed("SHADOW_EXEC_TIMEOUT_SECS").map(Duration::from_secs),
        }
    }

    /// Reject values that would make waits or timers degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.terminate_attempts == 0 {
            return Err(ConfigError::ZeroTerminateAttempts);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.exec_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroExecTimeout);
        }
        Ok(())
    }

    /// Poller settings.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            terminate_attempts: self.terminate_attempts,
        }
    }

    /// Watch reconnect policy.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    /// Ref-count conflict retry policy.
    pub fn retry_policy(&self) -> ConflictRetryPolicy {
        ConflictRetryPolicy {
            max_retries: self.conflict_retries,
        }
    }

    /// Exec bridge settings.
    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            timeout: self.exec_timeout,
        }
    }
}
