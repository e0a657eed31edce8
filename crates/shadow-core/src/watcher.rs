//! Long-lived watch dispatch.
//!
//! A [`ResourceWatcher`] opens one watch subscription per call and runs it
//! on its own tokio task. Events are delivered either as tagged
//! [`WatchEvent`]s over a single ordered channel ([`WatchSubscription`]) or
//! straight into optional per-kind callbacks ([`WatchHandlers`]), which then
//! run on the watcher task.
//!
//! What happens when the underlying stream ends or fails is decided by the
//! [`ReconnectPolicy`]. A resubscribed watch starts from the store's current
//! state, so changes made while disconnected show up as the store replays
//! them (typically as `Added`), not as the intermediate events that were missed.

use crate::error::{CoreError, Result};
use crate::instance::{RuntimeInstance, WatchEvent};
use crate::store::{PodStore, WatchTarget};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel between the watcher task and its consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// What to do when a watch stream ends or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stop and close the subscription. A stream error is returned from the task.
    FailClosed,
    /// Re-open the watch, doubling the delay between attempts up to `max_backoff`.
    Resubscribe {
        /// First delay after a disconnect.
        initial_backoff: Duration,
        /// Upper bound on the delay.
        max_backoff: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Resubscribe {
            initial_backoff: BACKOFF_INITIAL,
            max_backoff: BACKOFF_MAX,
        }
    }
}

impl ReconnectPolicy {
    /// Parse from string (case-insensitive). Anything but `fail`/`fail-closed` resubscribes.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fail" | "fail-closed" | "failclosed" => Self::FailClosed,
            _ => Self::default(),
        }
    }
}

type Handler = Box<dyn Fn(&RuntimeInstance) + Send + Sync>;

/// Optional callbacks per event kind. A missing callback ignores that kind.
#[derive(Default)]
pub struct WatchHandlers {
    on_add: Option<Handler>,
    on_delete: Option<Handler>,
    on_modify: Option<Handler>,
}

impl WatchHandlers {
    /// Create handlers that ignore every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for `Added` events.
    pub fn on_add(mut self, f: impl Fn(&RuntimeInstance) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Box::new(f));
        self
    }

    /// Called for `Deleted` events.
    pub fn on_delete(mut self, f: impl Fn(&RuntimeInstance) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    /// Called for `Modified` events.
    pub fn on_modify(mut self, f: impl Fn(&RuntimeInstance) + Send + Sync + 'static) -> Self {
        self.on_modify = Some(Box::new(f));
        self
    }

    /// Invoke the callback registered for the event's kind, if any.
    pub fn dispatch(&self, event: &WatchEvent) {
        let handler = match event {
            WatchEvent::Added(_) => &self.on_add,
            WatchEvent::Deleted(_) => &self.on_delete,
            WatchEvent::Modified(_) => &self.on_modify,
        };
        if let Some(f) = handler {
            f(event.instance());
        }
    }
}

impl fmt::Debug for WatchHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandlers")
            .field("on_add", &self.on_add.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_modify", &self.on_modify.is_some())
            .finish()
    }
}

enum Sink {
    Channel(mpsc::Sender<WatchEvent>),
    Handlers(WatchHandlers),
}

impl Sink {
    /// Returns false once the consumer is gone.
    async fn deliver(&self, event: WatchEvent) -> bool {
        match self {
            Self::Channel(tx) => tx.send(event).await.is_ok(),
            Self::Handlers(handlers) => {
                handlers.dispatch(&event);
                true
            }
        }
    }
}

/// Handle to a running watch task.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl WatchHandle {
    /// Ask the watch task to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the watch task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the watch task to exit and return its result.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| CoreError::Store(format!("watch task failed: {e}")))?
    }

    /// Cancel the watch task and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

/// Ordered event channel fed by a watch task.
pub struct WatchSubscription {
    events: mpsc::Receiver<WatchEvent>,
    handle: WatchHandle,
}

impl WatchSubscription {
    /// Next event, or `None` once the watch has stopped.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Ask the watch task to stop.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Cancel the watch task and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        let Self { events, handle } = self;
        drop(events);
        handle.shutdown().await
    }
}

/// Turns a pod watch stream into add/modify/delete events.
pub struct ResourceWatcher {
    store: Arc<dyn PodStore>,
    policy: ReconnectPolicy,
    buffer: usize,
}

impl ResourceWatcher {
    /// Create a watcher over the given store.
    pub fn new(store: Arc<dyn PodStore>, policy: ReconnectPolicy) -> Self {
        Self {
            store,
            policy,
            buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Set the event channel capacity.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Get the reconnect policy.
    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Start watching and deliver events over a channel.
    pub fn subscribe(&self, target: WatchTarget, namespace: &str) -> WatchSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = self.spawn(target, namespace, Sink::Channel(tx));
        WatchSubscription { events: rx, handle }
    }

    /// Start watching and invoke `handlers` on the watcher task.
    pub fn watch(&self, target: WatchTarget, namespace: &str, handlers: WatchHandlers) -> WatchHandle {
        self.spawn(target, namespace, Sink::Handlers(handlers))
    }

    fn spawn(&self, target: WatchTarget, namespace: &str, sink: Sink) -> WatchHandle {
        let cancel = CancellationToken::new();
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let namespace = namespace.to_string();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            run_watch_loop(store, target, namespace, policy, token, sink).await
        });

        WatchHandle { cancel, task }
    }
}

async fn run_watch_loop(
    store: Arc<dyn PodStore>,
    target: WatchTarget,
    namespace: String,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    sink: Sink,
) -> Result<()> {
    let mut backoff = match policy {
        ReconnectPolicy::Resubscribe { initial_backoff, .. } => initial_backoff,
        ReconnectPolicy::FailClosed => Duration::ZERO,
    };

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            opened = store.watch(&target, &namespace) => opened,
        };

        let failure = match opened {
            Ok(mut stream) => {
                tracing::debug!(scope = %target, namespace = %namespace, "Watch opened");
                if let ReconnectPolicy::Resubscribe { initial_backoff, .. } = policy {
                    backoff = initial_backoff;
                }
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            tracing::debug!(
                                pod = %event.instance().name(),
                                kind = event.kind(),
                                "Pod event"
                            );
                            let delivered = tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                delivered = sink.deliver(event) => delivered,
                            };
                            if !delivered {
                                tracing::debug!(scope = %target, "Watch consumer gone, stopping");
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(scope = %target, error = %e, "Watch stream failed");
                            break Some(e);
                        }
                        None => {
                            tracing::info!(scope = %target, "Watch stream closed");
                            break None;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(scope = %target, error = %e, "Failed to open watch");
                Some(e)
            }
        };

        match policy {
            ReconnectPolicy::FailClosed => {
                return match failure {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            ReconnectPolicy::Resubscribe { max_backoff, .. } => {
                tracing::info!(
                    scope = %target,
                    backoff_ms = backoff.as_millis() as u64,
                    "Resubscribing watch"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}
