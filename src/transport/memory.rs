//! In-process transport.
//!
//! [`memory()`] returns a connected pair: the [`MemoryConnector`] handed to a
//! session and the [`MemoryServer`] that plays the backend. Every successful
//! `connect` surfaces a [`ServerLink`] from [`MemoryServer::accept`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{Connector, Link, TransportError};

/// Frames pushed from the server side.
#[derive(Debug)]
enum Downstream {
    Text(String),
    Error(String),
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    refusals: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
}

/// Create a connector and its scriptable server side.
pub fn memory() -> (MemoryConnector, MemoryServer) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryConnector {
            incoming: incoming_tx,
            shared: shared.clone(),
        },
        MemoryServer {
            incoming: incoming_rx,
            shared,
        },
    )
}

/// Client half: opens links to the paired [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<ServerLink>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
        self.shared
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());

        let refused = self
            .shared
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("Memory connection refused");
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        self.incoming
            .send(ServerLink {
                to_client: down_tx,
                from_client: up_rx,
            })
            .map_err(|_| TransportError::Connect("server is gone".to_string()))?;

        Ok(Box::new(MemoryLink {
            upstream: Some(up_tx),
            downstream: down_rx,
        }))
    }
}

struct MemoryLink {
    upstream: Option<mpsc::UnboundedSender<String>>,
    downstream: mpsc::UnboundedReceiver<Downstream>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let upstream = self.upstream.as_ref().ok_or(TransportError::Closed)?;
        upstream.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.upstream.is_none() {
            return None;
        }
        match self.downstream.recv().await {
            Some(Downstream::Text(text)) => Some(Ok(text)),
            Some(Downstream::Error(message)) => Some(Err(TransportError::Io(message))),
            Some(Downstream::Close) | None => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.upstream.take();
        self.downstream.close();
        Ok(())
    }
}

/// Server half of the in-process transport.
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<ServerLink>,
    shared: Arc<Shared>,
}

impl MemoryServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<ServerLink> {
        self.incoming.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.shared.refusals.fetch_add(count, Ordering::SeqCst);
    }

    /// When each connection attempt (accepted or refused) was made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.shared
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.shared
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Server end of one accepted connection.
#[derive(Debug)]
pub struct ServerLink {
    to_client: mpsc::UnboundedSender<Downstream>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerLink {
    /// Push a JSON frame to the client. Returns false if the client is gone.
    pub fn send(&self, frame: Value) -> bool {
        self.send_text(frame.to_string())
    }

    /// Push a raw text frame, which need not be valid JSON.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Downstream::Text(text.into())).is_ok()
    }

    /// Surface a transport error on the client side without closing.
    pub fn inject_error(&self, message: impl Into<String>) -> bool {
        self.to_client
            .send(Downstream::Error(message.into()))
            .is_ok()
    }

    /// Close the connection from the server side.
    pub fn close(self) {
        let _ = self.to_client.send(Downstream::Close);
    }

    /// Next raw frame written by the client; `None` once it closed the link.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame written by the client, parsed as JSON. Frames that fail to
    /// parse are skipped.
    pub async fn recv_message(&mut self) -> Option<Value> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Frame already written by the client, if any, without waiting.
    pub fn try_recv_message(&mut self) -> Option<Value> {
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
        None
    }
}
