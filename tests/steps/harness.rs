//! Shared session plumbing for the step definitions.
//!
//! Drives a [`SyncSession`] against the in-memory transport so scenarios can
//! play the server side frame by frame.

use std::time::Duration;

use realtime_store::bus::StateChange;
use realtime_store::config::StoreConfig;
use realtime_store::transport::{memory, MemoryServer, ServerLink};
use realtime_store::{Channel, Notification, SessionStatus, SyncSession};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Upper bound for anything a step waits on.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn pos_snapshot() -> Value {
    json!({
        "type": "server:snapshot",
        "branchId": "main",
        "modules": {
            "pos": {"version": 1, "tables": {"order_header": [{"id": "o1", "version": 1}]}}
        }
    })
}

pub fn parse_status(name: &str) -> SessionStatus {
    match name {
        "idle" => SessionStatus::Idle,
        "connecting" => SessionStatus::Connecting,
        "open" => SessionStatus::Open,
        "ready" => SessionStatus::Ready,
        "closed" => SessionStatus::Closed,
        "error" => SessionStatus::Error,
        other => panic!("unknown session status: {other}"),
    }
}

#[derive(Debug)]
pub struct Harness {
    pub config: StoreConfig,
    session: Option<SyncSession>,
    server: Option<MemoryServer>,
    link: Option<ServerLink>,
    changes: Option<mpsc::UnboundedReceiver<StateChange>>,
    pub handshake: Option<Value>,
    pub closed_at: Option<Instant>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::for_test(),
            session: None,
            server: None,
            link: None,
            changes: None,
            handshake: None,
            closed_at: None,
        }
    }

    /// Build the session from the current config on first use.
    pub fn session(&mut self) -> SyncSession {
        if let Some(session) = &self.session {
            return session.clone();
        }
        let (connector, server) = memory();
        let session = SyncSession::new(self.config.clone(), connector);

        let (tx, rx) = mpsc::unbounded_channel();
        session.bus().on(Channel::StateChange, move |n| {
            if let Notification::StateChange(change) = n {
                let _ = tx.send(change.clone());
            }
            Ok(())
        });

        self.session = Some(session.clone());
        self.server = Some(server);
        self.changes = Some(rx);
        session
    }

    pub fn server(&mut self) -> &mut MemoryServer {
        self.session();
        self.server.as_mut().expect("server is created with the session")
    }

    pub fn link(&mut self) -> &mut ServerLink {
        self.link.as_mut().expect("no open server link")
    }

    pub fn take_link(&mut self) -> ServerLink {
        self.link.take().expect("no open server link")
    }

    /// Accept the next connection and consume its handshake.
    pub async fn accept(&mut self) -> Value {
        let server = self.server();
        let mut link = tokio::time::timeout(STEP_TIMEOUT, server.accept())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        let hello = link.recv_message().await.expect("no handshake");
        assert_eq!(hello["type"], "client:hello");
        self.link = Some(link);
        self.handshake = Some(hello.clone());
        hello
    }

    /// Connect, answer the handshake with `snapshot`, and wait for readiness.
    pub async fn connect_with(&mut self, snapshot: Value) -> realtime_store::Result<()> {
        let session = self.session();
        let server = self.server.as_mut().expect("server is created with the session");
        let (connected, link) = tokio::join!(session.connect(), async {
            let mut link = server.accept().await.expect("connector dropped");
            let hello = link.recv_message().await.expect("no handshake");
            link.send(snapshot);
            (link, hello)
        });
        let (link, hello) = link;
        self.link = Some(link);
        self.handshake = Some(hello);
        connected.map(|_| ())?;
        self.drain_changes();
        Ok(())
    }

    pub fn drain_changes(&mut self) {
        if let Some(changes) = self.changes.as_mut() {
            while changes.try_recv().is_ok() {}
        }
    }

    /// Send `frame` and wait until the projection reports a change.
    pub async fn push_event(&mut self, frame: Value) -> StateChange {
        assert!(self.link().send(frame), "server link is closed");
        let changes = self.changes.as_mut().expect("session not started");
        tokio::time::timeout(STEP_TIMEOUT, changes.recv())
            .await
            .expect("projection did not change")
            .expect("bus dropped")
    }

    pub async fn wait_for_status(&mut self, status: SessionStatus) {
        let mut watch = self.session().watch_status();
        tokio::time::timeout(STEP_TIMEOUT, watch.wait_for(|s| *s == status))
            .await
            .unwrap_or_else(|_| panic!("session never reached {status}"))
            .expect("session dropped");
    }
}
