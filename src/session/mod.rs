//! Connection manager.
//!
//! A [`SyncSession`] owns one logical connection to the sync backend. A
//! supervisor task opens links through the session's [`Connector`], sends the
//! handshake, and then feeds every inbound frame, strictly in arrival order,
//! to the projection, the correlator or the bus. When a link closes the
//! supervisor reconnects after an exponential backoff that resets on every
//! successful connection.
//!
//! ```text
//! idle -> connecting -> open -> ready -> closed
//!                 ^                        |
//!                 +------ (backoff) -------+
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{
    CacheNotice, CacheOp, CacheOutcome, ErrorReport, Notification, StatusBus, StatusUpdate,
};
use crate::cache::{CacheAdapter, SaveOptions};
use crate::config::StoreConfig;
use crate::correlator::{AckFuture, MutationPublisher, RequestCorrelator};
use crate::error::{ErrorKind, Result, SyncError};
use crate::protocol::{ClientHello, ClientMessage, DecodeError, ServerMessage, SnapshotEnvelope, SnapshotRequest};
use crate::query::Filter;
use crate::state::{ModuleState, Projection, Tables};
use crate::transport::{Connector, Link, TransportError};
use crate::utils::retry::reconnect_delays;

mod outbox;
mod status;

pub(crate) use outbox::{LinkSlot, Outbox};
pub use status::SessionStatus;

/// Whether the current `connect()` cycle has seen its first snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Closed,
    /// The last connect attempt failed and no reconnect is scheduled.
    Refused(TransportError),
}

/// Builder for [`SyncSession`].
pub struct SessionBuilder {
    config: StoreConfig,
    connector: Arc<dyn Connector>,
    cache: Option<Arc<dyn CacheAdapter>>,
    bus: Option<Arc<StatusBus>>,
}

impl SessionBuilder {
    /// Hydrate from and persist snapshots to `cache`.
    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Publish on an existing bus instead of a private one.
    pub fn bus(mut self, bus: Arc<StatusBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> SyncSession {
        let config = self.config;
        let bus = self.bus.unwrap_or_else(|| Arc::new(StatusBus::new()));
        let (status, _) = watch::channel(SessionStatus::Idle);
        let (ready, _) = watch::channel(Readiness::Pending);
        let (shutdown, _) = watch::channel(false);
        let link: LinkSlot = Arc::new(Mutex::new(None));

        let outbox = Outbox::new(status.subscribe(), link.clone(), bus.clone());
        let correlator = RequestCorrelator::new(config.requests.timeout());
        let publisher = MutationPublisher::new(
            &config.session,
            &config.requests,
            correlator.clone(),
            outbox.clone(),
        );
        let projection = Projection::new(&config.projection, &config.session.module_id, bus.clone());

        let inner = Arc::new(SessionInner {
            auto_reconnect: AtomicBool::new(config.session.auto_reconnect),
            config,
            connector: self.connector,
            cache: self.cache,
            bus,
            projection,
            correlator,
            publisher,
            outbox,
            link,
            status,
            ready,
            shutdown,
            reconnect_delay: Mutex::new(None),
            last_handshake: Mutex::new(None),
            supervisor: AsyncMutex::new(None),
        });
        SyncSession {
            _stop: Arc::new(StopOnDrop(Arc::downgrade(&inner))),
            inner,
        }
    }
}

/// One logical connection to the sync backend. Cheap to clone; clones share
/// the connection. Dropping the last clone stops the session as
/// [`SyncSession::disconnect`] would, without waiting for the link to close.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
    _stop: Arc<StopOnDrop>,
}

/// Signals shutdown when the last [`SyncSession`] handle goes away. The
/// supervisor task holds its own `Arc<SessionInner>`, so the inner state
/// alone never drops while it runs.
struct StopOnDrop(Weak<SessionInner>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.auto_reconnect.store(false, Ordering::SeqCst);
            inner.shutdown.send_replace(true);
        }
    }
}

struct SessionInner {
    config: StoreConfig,
    connector: Arc<dyn Connector>,
    cache: Option<Arc<dyn CacheAdapter>>,
    bus: Arc<StatusBus>,
    projection: Projection,
    correlator: RequestCorrelator,
    publisher: MutationPublisher,
    outbox: Outbox,
    link: LinkSlot,
    status: watch::Sender<SessionStatus>,
    ready: watch::Sender<Readiness>,
    shutdown: watch::Sender<bool>,
    auto_reconnect: AtomicBool,
    reconnect_delay: Mutex<Option<Duration>>,
    last_handshake: Mutex<Option<ClientHello>>,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new<C: Connector>(config: StoreConfig, connector: C) -> Self {
        Self::builder(config, connector).build()
    }

    pub fn builder<C: Connector>(config: StoreConfig, connector: C) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: Arc::new(connector),
            cache: None,
            bus: None,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the session if it is not running and wait for the first
    /// snapshot. Returns a copy of the projection at that point.
    ///
    /// Calling `connect` on a running session waits on the same readiness.
    /// Fails with [`SyncError::Transport`] if a connect attempt fails and no
    /// reconnect follows, and with [`SyncError::Closed`] if the session is
    /// disconnected or its link closes for good before a snapshot arrives.
    pub async fn connect(&self) -> Result<BTreeMap<String, ModuleState>> {
        {
            let mut supervisor = self.inner.supervisor.lock().await;
            let running = supervisor.as_ref().is_some_and(|task| !task.is_finished());
            if !running {
                self.inner.ready.send_replace(Readiness::Pending);
                self.inner.shutdown.send_replace(false);
                self.inner
                    .auto_reconnect
                    .store(self.inner.config.session.auto_reconnect, Ordering::SeqCst);
                self.inner.hydrate_from_cache().await;
                *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
            }
        }

        let mut ready = self.inner.ready.subscribe();
        match settled(&mut ready).await {
            Readiness::Ready => Ok(self.inner.projection.modules()),
            Readiness::Refused(e) => Err(SyncError::Transport(e)),
            Readiness::Pending | Readiness::Closed => Err(SyncError::Closed),
        }
    }

    /// Stop reconnecting, close the active link and mark the session closed.
    /// Pending mutations keep waiting for their ack or timeout.
    pub async fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let task = self.inner.supervisor.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Session supervisor ended abnormally");
            }
        }

        self.inner.ready.send_if_modified(|ready| {
            let pending = *ready == Readiness::Pending;
            if pending {
                *ready = Readiness::Closed;
            }
            pending
        });
        self.inner.set_reconnect_delay(None);
        self.inner
            .set_status(SessionStatus::Closed, None, Some("disconnected".to_string()));
        info!(
            branch_id = %self.branch_id(),
            module_id = %self.module_id(),
            "Session disconnected"
        );
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Receiver observing every status transition.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Delay before the scheduled reconnect attempt, if one is scheduled.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        *lock(&self.inner.reconnect_delay)
    }

    /// The handshake most recently sent.
    pub fn last_handshake(&self) -> Option<ClientHello> {
        lock(&self.inner.last_handshake).clone()
    }

    pub fn branch_id(&self) -> &str {
        &self.inner.config.session.branch_id
    }

    pub fn module_id(&self) -> &str {
        &self.inner.config.session.module_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<StatusBus> {
        &self.inner.bus
    }

    pub fn projection(&self) -> &Projection {
        &self.inner.projection
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    pub fn publisher(&self) -> &MutationPublisher {
        &self.inner.publisher
    }

    /// Ask the backend to resend a module snapshot. Returns the request id.
    ///
    /// Delivery runs on a spawned task, so this must be called from within
    /// a Tokio runtime.
    pub fn request_snapshot(&self, module_id: Option<&str>) -> String {
        let request_id = Uuid::new_v4().to_string();
        let message = ClientMessage::RequestSnapshot(SnapshotRequest {
            branch_id: self.branch_id().to_string(),
            module_id: module_id.unwrap_or(self.module_id()).to_string(),
            request_id: request_id.clone(),
        });
        let outbox = self.inner.outbox.clone();
        let wait = self.inner.config.requests.send_wait();
        tokio::spawn(async move {
            outbox.deliver(&message, wait).await;
        });
        request_id
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Publish an insert and return the future of its acknowledgement.
    ///
    /// Validation failures are returned immediately. Otherwise delivery and
    /// the request timeout run on spawned tasks, so every mutation method
    /// must be called from within a Tokio runtime. The timeout runs whether
    /// or not the returned future is polled.
    pub fn insert(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.inner.publisher.insert(table, record, meta)
    }

    /// Publish a partial merge. Requires a Tokio runtime, like [`Self::insert`].
    pub fn merge(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.inner.publisher.merge(table, record, meta)
    }

    /// Publish an upsert. Requires a Tokio runtime, like [`Self::insert`].
    pub fn save(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.inner.publisher.save(table, record, meta)
    }

    /// Publish a delete by record reference. Requires a Tokio runtime, like
    /// [`Self::insert`].
    pub fn remove(&self, table: &str, record_ref: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.inner.publisher.remove(table, record_ref, meta)
    }

    /// Publish a versioned update. Requires a Tokio runtime, like
    /// [`Self::insert`].
    pub fn update(&self, table: &str, record: Value, meta: Option<Map<String, Value>>) -> Result<AckFuture> {
        self.inner.publisher.update(table, record, meta)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn snapshot(&self, module_id: Option<&str>) -> Option<ModuleState> {
        self.inner.projection.snapshot(module_id)
    }

    pub fn tables(&self, module_id: Option<&str>) -> Tables {
        self.inner.projection.tables(module_id)
    }

    pub fn list_table(&self, table: &str, module_id: Option<&str>) -> Vec<Value> {
        self.inner.projection.list_table(table, module_id)
    }

    pub fn read(&self, table: &str, id: &Value, module_id: Option<&str>) -> Result<Option<Value>> {
        self.inner.projection.read(table, id, module_id)
    }

    pub fn query(&self, table: &str, filter: &Filter, module_id: Option<&str>) -> Result<Vec<Value>> {
        self.inner.projection.query(table, filter, module_id)
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("branch_id", &self.branch_id())
            .field("module_id", &self.module_id())
            .field("status", &self.status())
            .field("pending_requests", &self.inner.correlator.pending_count())
            .finish()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

async fn supervise(inner: Arc<SessionInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = reconnect_delays(&inner.config.reconnect);
    let mut refused = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        inner.set_status(SessionStatus::Connecting, None, None);

        let attempt = tokio::select! {
            attempt = inner.connector.connect() => attempt,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        let (ended, detail) = match attempt {
            Ok(link) => {
                refused = None;
                backoff = reconnect_delays(&inner.config.reconnect);
                inner.set_reconnect_delay(None);
                let detail = inner.run_link(link, &mut shutdown).await;
                (SessionStatus::Closed, detail.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                inner.report(ErrorKind::WsError, e.to_string(), "connect");
                let detail = e.to_string();
                refused = Some(e);
                (SessionStatus::Error, detail)
            }
        };

        if *shutdown.borrow() {
            break;
        }
        let delay = if inner.auto_reconnect.load(Ordering::SeqCst) {
            backoff.next()
        } else {
            None
        };
        inner.set_reconnect_delay(delay);
        inner.set_status(ended, delay, Some(detail));

        let Some(delay) = delay else {
            break;
        };
        info!(delay = ?delay, "Reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    let outcome = match refused {
        Some(e) if !*shutdown.borrow() => Readiness::Refused(e),
        _ => Readiness::Closed,
    };
    inner.ready.send_if_modified(|ready| {
        let pending = *ready == Readiness::Pending;
        if pending {
            *ready = outcome;
        }
        pending
    });
    debug!("Session supervisor stopped");
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}

async fn settled(ready: &mut watch::Receiver<Readiness>) -> Readiness {
    match ready.wait_for(|ready| *ready != Readiness::Pending).await {
        Ok(ready) => ready.clone(),
        Err(_) => Readiness::Closed,
    }
}

impl SessionInner {
    /// Drive one open link until it closes. Returns why it ended.
    async fn run_link(&self, mut link: Box<dyn Link>, shutdown: &mut watch::Receiver<bool>) -> &'static str {
        let hello = self.handshake();
        let sent = match ClientMessage::Hello(hello.clone()).to_text() {
            Ok(text) => link.send(text).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            warn!(error = %e, "Handshake failed");
            self.report(ErrorKind::SendError, e, "handshake");
            let _ = link.close().await;
            return "handshake failed";
        }
        debug!(request_id = %hello.request_id, "Handshake sent");
        *lock(&self.last_handshake) = Some(hello);

        let (writer, mut outbound) = mpsc::unbounded_channel::<String>();
        *lock(&self.link) = Some(writer);
        self.set_status(SessionStatus::Open, None, None);
        info!(
            branch_id = %self.config.session.branch_id,
            module_id = %self.config.session.module_id,
            "Session open"
        );

        let ended = loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Transport error");
                        self.report(ErrorKind::WsError, e.to_string(), "transport");
                    }
                    None => break "closed by server",
                },
                Some(text) = outbound.recv() => {
                    if let Err(e) = link.send(text).await {
                        warn!(error = %e, "Send failed");
                        self.report(ErrorKind::SendError, e.to_string(), "publish");
                    }
                }
                _ = shutdown_requested(shutdown) => {
                    if let Err(e) = link.close().await {
                        debug!(error = %e, "Close failed");
                    }
                    break "disconnected";
                }
            }
        };

        lock(&self.link).take();
        info!(reason = ended, "Link ended");
        ended
    }

    fn handshake(&self) -> ClientHello {
        let session = &self.config.session;
        ClientHello {
            branch_id: session.branch_id.clone(),
            role: session.role.clone(),
            history_limit: session.history_limit,
            request_snapshot: true,
            request_history: session.history_limit > 0,
            lang: session.lang.clone(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    async fn dispatch(&self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(DecodeError::UnknownType(kind)) => {
                warn!(kind = %kind, "Unknown message type dropped");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Malformed message dropped");
                self.report(ErrorKind::ParseError, e.to_string(), "inbound");
                return;
            }
        };
        debug!(kind = message.kind(), "Message received");

        match message {
            ServerMessage::Hello(frame) => {
                self.bus.publish(Notification::Hello(frame));
            }
            ServerMessage::Log(log) => {
                info!(message = %log.message, context = ?log.context, "Server log");
                self.bus.publish(Notification::Log(log));
            }
            ServerMessage::Directive(frame) => {
                self.bus.publish(Notification::Directive(frame));
            }
            ServerMessage::Snapshot(snapshot) => {
                self.projection.apply_snapshot(&snapshot);
                self.persist_snapshot(&snapshot).await;
                self.mark_ready();
                self.bus.publish(Notification::Snapshot(snapshot));
            }
            ServerMessage::Event(event) => {
                self.projection.apply_event(&event);
                self.bus.publish(Notification::Event(event));
            }
            ServerMessage::Ack(ack) => {
                self.correlator.resolve(&ack);
                self.bus.publish(Notification::Ack(ack));
            }
        }
    }

    fn mark_ready(&self) {
        let current = *self.status.borrow();
        if current == SessionStatus::Open {
            self.set_status(SessionStatus::Ready, None, None);
        }
        let first = self.ready.send_if_modified(|ready| {
            let changed = *ready != Readiness::Ready;
            *ready = Readiness::Ready;
            changed
        });
        if first {
            info!(module_id = %self.config.session.module_id, "Session ready");
        }
    }

    async fn hydrate_from_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let module_id = self.config.session.module_id.as_str();
        if self.projection.snapshot(Some(module_id)).is_some() {
            return;
        }

        let outcome = match cache.load(module_id).await {
            Ok(Some(entry)) => {
                self.projection.hydrate(module_id, &entry.data);
                CacheOutcome::Hit
            }
            Ok(None) => CacheOutcome::Miss,
            Err(e) => {
                warn!(module_id = %module_id, error = %e, "Cache load failed");
                self.report(ErrorKind::CacheError, e.to_string(), module_id);
                CacheOutcome::Failed
            }
        };
        debug!(module_id = %module_id, outcome = ?outcome, "Cache load");
        self.bus.publish(Notification::Cache(CacheNotice {
            module_id: module_id.to_string(),
            op: CacheOp::Load,
            outcome,
        }));
    }

    async fn persist_snapshot(&self, snapshot: &SnapshotEnvelope) {
        let Some(cache) = &self.cache else {
            return;
        };
        for (module_id, data) in &snapshot.modules {
            let mut metadata = Map::new();
            if let Some(branch_id) = &snapshot.branch_id {
                metadata.insert("branchId".to_string(), Value::String(branch_id.clone()));
            }
            if let Some(meta) = &snapshot.meta {
                metadata.insert("snapshot".to_string(), meta.clone());
            }
            metadata.insert("savedAt".to_string(), Value::String(Utc::now().to_rfc3339()));
            let options = SaveOptions {
                metadata,
                merge_metadata: true,
            };

            let outcome = match cache.save(module_id, data.clone(), options).await {
                Ok(()) => CacheOutcome::Stored,
                Err(e) => {
                    warn!(module_id = %module_id, error = %e, "Cache save failed");
                    self.report(ErrorKind::CacheError, e.to_string(), module_id);
                    CacheOutcome::Failed
                }
            };
            self.bus.publish(Notification::Cache(CacheNotice {
                module_id: module_id.clone(),
                op: CacheOp::Save,
                outcome,
            }));
        }
    }

    fn set_status(&self, status: SessionStatus, reconnect_delay: Option<Duration>, detail: Option<String>) {
        let previous = self.status.send_replace(status);
        debug!(status = %status, previous = %previous, delay = ?reconnect_delay, "Session status");
        self.bus.publish(Notification::Status(StatusUpdate {
            status,
            reconnect_delay,
            detail,
        }));
    }

    fn set_reconnect_delay(&self, delay: Option<Duration>) {
        *lock(&self.reconnect_delay) = delay;
    }

    fn report(&self, kind: ErrorKind, message: impl Into<String>, context: &str) {
        self.bus.publish(Notification::Error(
            ErrorReport::new(kind, message).with_context(context),
        ));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
