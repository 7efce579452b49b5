//! Typed publish/subscribe fan-out for protocol and consumer-facing channels.
//!
//! Channels: `hello`, `log`, `snapshot`, `event`, `ack`, `directive`,
//! `status`, `error`, `state:change`, `cache`.
//!
//! Dispatch is synchronous and in subscription order. A handler that returns
//! an error or panics is isolated: the failure is logged, counted, and
//! republished on the `error` channel tagged `handler-error`; remaining
//! handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::protocol::{AckEnvelope, EventEnvelope, LogMessage, SnapshotEnvelope};
use crate::session::SessionStatus;

// ============================================================================
// Channels and notifications
// ============================================================================

/// Fixed channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Hello,
    Log,
    Snapshot,
    Event,
    Ack,
    Directive,
    Status,
    Error,
    StateChange,
    Cache,
}

impl Channel {
    pub const ALL: [Channel; 10] = [
        Channel::Hello,
        Channel::Log,
        Channel::Snapshot,
        Channel::Event,
        Channel::Ack,
        Channel::Directive,
        Channel::Status,
        Channel::Error,
        Channel::StateChange,
        Channel::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Hello => "hello",
            Channel::Log => "log",
            Channel::Snapshot => "snapshot",
            Channel::Event => "event",
            Channel::Ack => "ack",
            Channel::Directive => "directive",
            Channel::Status => "status",
            Channel::Error => "error",
            Channel::StateChange => "state:change",
            Channel::Cache => "cache",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the projection changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Snapshot,
    Event,
    Cache,
}

/// `state:change` payload, scoped to a module and table where applicable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub reason: ChangeReason,
    pub module_id: Option<String>,
    pub table: Option<String>,
}

impl StateChange {
    pub fn snapshot() -> Self {
        Self {
            reason: ChangeReason::Snapshot,
            module_id: None,
            table: None,
        }
    }

    pub fn event(module_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            reason: ChangeReason::Event,
            module_id: Some(module_id.into()),
            table: Some(table.into()),
        }
    }

    pub fn cache(module_id: impl Into<String>) -> Self {
        Self {
            reason: ChangeReason::Cache,
            module_id: Some(module_id.into()),
            table: None,
        }
    }
}

/// `status` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    /// Delay before the next reconnect attempt, when one is scheduled.
    pub reconnect_delay: Option<Duration>,
    pub detail: Option<String>,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Option<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Load,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Stored,
    Failed,
}

/// `cache` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotice {
    pub module_id: String,
    pub op: CacheOp,
    pub outcome: CacheOutcome,
}

/// A message delivered on one channel.
#[derive(Debug, Clone)]
pub enum Notification {
    Hello(Value),
    Log(LogMessage),
    Snapshot(SnapshotEnvelope),
    Event(EventEnvelope),
    Ack(AckEnvelope),
    Directive(Value),
    Status(StatusUpdate),
    Error(ErrorReport),
    StateChange(StateChange),
    Cache(CacheNotice),
}

impl Notification {
    pub fn channel(&self) -> Channel {
        match self {
            Notification::Hello(_) => Channel::Hello,
            Notification::Log(_) => Channel::Log,
            Notification::Snapshot(_) => Channel::Snapshot,
            Notification::Event(_) => Channel::Event,
            Notification::Ack(_) => Channel::Ack,
            Notification::Directive(_) => Channel::Directive,
            Notification::Status(_) => Channel::Status,
            Notification::Error(_) => Channel::Error,
            Notification::StateChange(_) => Channel::StateChange,
            Notification::Cache(_) => Channel::Cache,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Failure reported by a subscriber.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

/// Subscriber for one channel.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, notification: &Notification) -> Result<(), HandlerError>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&Notification) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, notification: &Notification) -> Result<(), HandlerError> {
        self(notification)
    }
}

/// Handle returned by [`StatusBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscribers = Vec<(SubscriptionId, Arc<dyn NotificationHandler>)>;

// ============================================================================
// Bus
// ============================================================================

/// Many-to-many fan-out per channel.
#[derive(Default)]
pub struct StatusBus {
    handlers: RwLock<HashMap<Channel, Subscribers>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`.
    pub fn subscribe<H>(&self, channel: Channel, handler: H) -> SubscriptionId
    where
        H: NotificationHandler + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
            let subscribers = handlers.entry(channel).or_default();
            subscribers.push((id, Arc::new(handler)));
            subscribers.len()
        };
        debug!(channel = %channel, handler_count = count, "Handler subscribed");
        id
    }

    /// Register a closure on `channel`.
    pub fn on<F>(&self, channel: Channel, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(channel, handler)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for subscribers in handlers.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|(sub, _)| *sub != id);
            removed |= subscribers.len() != before;
        }
        removed
    }

    /// Number of handlers on `channel`.
    pub fn handler_count(&self, channel: Channel) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Total handler failures swallowed so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `notification` to every handler on its channel. Returns the
    /// number of handlers that completed successfully.
    pub fn publish(&self, notification: Notification) -> usize {
        let channel = notification.channel();
        // Snapshot the list so handlers may (un)subscribe during dispatch.
        let subscribers: Subscribers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (_, handler) in &subscribers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&notification)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.0,
                Err(payload) => panic_message(payload.as_ref()),
            };
            self.report_failure(channel, failure);
        }
        delivered
    }

    fn report_failure(&self, channel: Channel, message: String) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(channel = %channel, error = %message, "Bus handler failed");
        // Failures on the error channel itself are only logged.
        if channel != Channel::Error {
            self.publish(Notification::Error(
                ErrorReport::new(ErrorKind::HandlerError, message).with_context(channel.as_str()),
            ));
        }
    }
}

impl fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(channel, subs)| (channel.as_str(), subs.len()))
            .collect();
        f.debug_struct("StatusBus")
            .field("handlers", &counts)
            .field("failures", &self.failure_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
