//! Bounded-retry waits on pod lifecycle phases.
//!
//! Every wait is a small state machine ([`PollState`]) driven by a fixed
//! interval: observe, decide, sleep, repeat. The attempt budget for the
//! running and set-ready waits is `timeout / interval`; the budget is spent
//! when the attempt counter exceeds it, so a wait performs at most
//! `floor(timeout / interval) + 1` observations. Termination waits use their
//! own fixed attempt cap regardless of any caller timeout.
//!
//! Sleeping goes through tokio's timer, so tests drive these waits with a
//! paused clock instead of real delays. Each wait can be aborted through the
//! poller's [`CancellationToken`].

use crate::error::{CoreError, Result};
use crate::instance::{LabelSelector, RuntimeInstance};
use crate::store::PodStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Interval between observations (6 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(6);

/// Attempts made by [`LifecyclePoller::wait_until_terminated`].
pub const DEFAULT_TERMINATE_ATTEMPTS: u32 = 10;

/// Polling configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval between observations.
    pub interval: Duration,
    /// Attempt cap for termination waits.
    pub terminate_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            terminate_attempts: DEFAULT_TERMINATE_ATTEMPTS,
        }
    }
}

/// Result of a termination wait that did not time out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The pod is gone.
    Terminated,
    /// The pod exists and is not being deleted (recreated or deletion cancelled).
    StillPresent(RuntimeInstance),
}

/// Decision after one observation.
#[derive(Debug)]
enum PollState<T> {
    Polling,
    Succeeded(T),
    TimedOut,
}

/// Attempt counter against a `timeout / interval` budget.
#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    attempt: u64,
    max: u64,
}

impl RetryBudget {
    fn for_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        Self {
            attempt: 0,
            max: (timeout.as_millis() / interval_ms) as u64,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempt > self.max
    }

    fn advance(&mut self) {
        self.attempt += 1;
    }
}

/// Waits for pods to reach a target phase.
pub struct LifecyclePoller {
    store: Arc<dyn PodStore>,
    config: PollConfig,
    cancel: CancellationToken,
}

impl LifecyclePoller {
    /// Create a poller over the given store.
    pub fn new(store: Arc<dyn PodStore>, config: PollConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight and future waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Get the polling configuration.
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Wait until a single pod is Running.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Timeout`] naming the pod once the budget is spent
    /// - any fetch error, immediately
    /// - [`CoreError::Cancelled`]
    pub async fn wait_until_running(
        &self,
        name: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<RuntimeInstance> {
        let start = tokio::time::Instant::now();
        let mut budget = RetryBudget::for_timeout(timeout, self.config.interval);

        loop {
            self.ensure_active()?;
            let state = if budget.exhausted() {
                PollState::TimedOut
            } else {
                let pod = self.store.get(name, namespace).await?;
                tracing::trace!(pod = %name, phase = %pod.phase, attempt = budget.attempt, "Polled pod");
                if pod.is_running() {
                    PollState::Succeeded(pod)
                } else {
                    PollState::Polling
                }
            };

            match state {
                PollState::Succeeded(pod) => {
                    tracing::info!(
                        pod = %name,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Pod is ready"
                    );
                    return Ok(pod);
                }
                PollState::TimedOut => {
                    tracing::warn!(pod = %name, attempts = budget.attempt, "Pod failed to start in time");
                    return Err(CoreError::Timeout {
                        resource: name.to_string(),
                        reason: "failed to start".into(),
                    });
                }
                PollState::Polling => {
                    tracing::info!(pod = %name, "Waiting for pod ...");
                    self.pause().await?;
                    budget.advance();
                }
            }
        }
    }

    /// Wait until at least `min_count` pods matching `selector` are Running.
    ///
    /// Returns the Running subset. `min_count` below 1 is treated as 1.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] naming the selector when nothing matched at the last observation
    /// - [`CoreError::Timeout`] naming a non-ready pod otherwise
    /// - any list error, immediately
    /// - [`CoreError::Cancelled`]
    pub async fn wait_until_set_ready(
        &self,
        selector: &LabelSelector,
        namespace: &str,
        timeout: Duration,
        min_count: usize,
    ) -> Result<Vec<RuntimeInstance>> {
        let min_count = min_count.max(1);
        let mut budget = RetryBudget::for_timeout(timeout, self.config.interval);

        loop {
            self.ensure_active()?;
            let pods = self.store.list(selector, namespace).await?;

            let state = if budget.exhausted() {
                PollState::TimedOut
            } else {
                let ready: Vec<RuntimeInstance> =
                    pods.iter().filter(|p| p.is_running()).cloned().collect();
                tracing::trace!(
                    selector = %selector,
                    matched = pods.len(),
                    ready = ready.len(),
                    attempt = budget.attempt,
                    "Polled pod set"
                );
                if ready.len() >= min_count {
                    PollState::Succeeded(ready)
                } else {
                    PollState::Polling
                }
            };

            match state {
                PollState::Succeeded(ready) => {
                    tracing::info!(pod = %ready[0].name(), ready = ready.len(), "Pod is ready");
                    return Ok(ready);
                }
                PollState::TimedOut => {
                    return Err(match pods.iter().find(|p| !p.is_running()).or(pods.first()) {
                        None => CoreError::NotFound(format!("pod with label {selector}")),
                        Some(pod) => CoreError::Timeout {
                            resource: pod.name().to_string(),
                            reason: "failed to start".into(),
                        },
                    });
                }
                PollState::Polling => {
                    tracing::info!(selector = %selector, "Waiting for shadow pod ...");
                    self.pause().await?;
                    budget.advance();
                }
            }
        }
    }

    /// Wait until a pod is gone.
    ///
    /// Each attempt sleeps first, then fetches. A NotFound fetch means the
    /// pod is gone; a pod with a deletion timestamp is still terminating; a
    /// pod without one is returned as [`TerminateOutcome::StillPresent`].
    ///
    /// Exactly [`PollConfig::terminate_attempts`] fetches are made (10 by
    /// default); there is no extra fetch after the last sleep.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Timeout`] once [`PollConfig::terminate_attempts`] are spent
    /// - any fetch error other than NotFound, immediately
    /// - [`CoreError::Cancelled`]
    pub async fn wait_until_terminated(&self, name: &str, namespace: &str) -> Result<TerminateOutcome> {
        let mut attempt = 0u32;

        loop {
            self.ensure_active()?;
            let state = if attempt >= self.config.terminate_attempts {
                PollState::TimedOut
            } else {
                tracing::info!(pod = %name, "Pod not finished yet, waiting ...");
                self.pause().await?;
                match self.store.get(name, namespace).await {
                    Err(e) if e.is_not_found() => PollState::Succeeded(TerminateOutcome::Terminated),
                    Err(e) => return Err(e),
                    Ok(pod) if pod.is_terminating() => PollState::Polling,
                    Ok(pod) => PollState::Succeeded(TerminateOutcome::StillPresent(pod)),
                }
            };

            match state {
                PollState::Succeeded(outcome) => {
                    match &outcome {
                        TerminateOutcome::Terminated => {
                            tracing::info!(pod = %name, "Pod terminated")
                        }
                        TerminateOutcome::StillPresent(_) => {
                            tracing::info!(pod = %name, "Pod is no longer terminating")
                        }
                    }
                    return Ok(outcome);
                }
                PollState::TimedOut => {
                    return Err(CoreError::Timeout {
                        resource: format!("'{name}'"),
                        reason: "still terminating, please try again later".into(),
                    });
                }
                PollState::Polling => attempt += 1,
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(self.config.interval) => Ok(()),
        }
    }
}
