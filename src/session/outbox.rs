//! Outbound frame delivery.
//!
//! Frames written while the transport is still opening wait for it; frames
//! written while it is confirmed down are abandoned and reported. Abandoning
//! a frame never settles its pending request: that happens only through an
//! ack or the request timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::SessionStatus;
use crate::bus::{ErrorReport, Notification, StatusBus};
use crate::error::ErrorKind;
use crate::protocol::ClientMessage;

/// Writer half of the active link, present while a link is open.
pub(crate) type LinkSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

#[derive(Clone)]
pub(crate) struct Outbox {
    status: watch::Receiver<SessionStatus>,
    link: LinkSlot,
    bus: Arc<StatusBus>,
}

impl Outbox {
    pub(crate) fn new(status: watch::Receiver<SessionStatus>, link: LinkSlot, bus: Arc<StatusBus>) -> Self {
        Self { status, link, bus }
    }

    /// Hand `message` to the active link, waiting up to `wait` for one to
    /// open. Returns whether the frame was handed off.
    pub(crate) async fn deliver(&self, message: &ClientMessage, wait: Duration) -> bool {
        let request_id = message.request_id();
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                self.abandon(request_id, &format!("encode failed: {e}"));
                return false;
            }
        };

        let deadline = Instant::now() + wait;
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.is_writable() {
                if let Some(link) = self.current_link() {
                    if link.send(text.clone()).is_ok() {
                        debug!(request_id = %request_id, "Frame queued on link");
                        return true;
                    }
                }
            } else if current.is_down() {
                self.abandon(request_id, &format!("transport is {current}"));
                return false;
            }

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        self.abandon(request_id, "session dropped");
                        return false;
                    }
                }
                _ = sleep_until(deadline) => {
                    self.abandon(request_id, "transport did not open in time");
                    return false;
                }
            }
        }
    }

    fn current_link(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn abandon(&self, request_id: &str, reason: &str) {
        warn!(request_id = %request_id, reason = %reason, "Send abandoned");
        self.bus.publish(Notification::Error(
            ErrorReport::new(ErrorKind::SendError, reason).with_context(request_id),
        ));
    }
}
